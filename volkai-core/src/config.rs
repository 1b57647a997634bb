use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};

use crate::buffer::DEFAULT_STOP_SEQUENCE;
use crate::error::{ChatError, CoreResult};
use crate::model::GenerationParams;
use crate::prompt::DEFAULT_PREAMBLE;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Hugging Face text-generation-inference streaming endpoint.
    #[default]
    Tgi,
    /// Canned offline replies.
    Null,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct BackendCfg {
    #[serde(default)]
    pub kind: BackendKind,
    /// Full URL of the streaming generation endpoint.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Name of the environment variable that contains the access token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
}

impl Default for BackendCfg {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            endpoint: None,
            token_env: default_token_env(),
        }
    }
}

impl BackendCfg {
    /// Read the access token named by `token_env`. Missing or empty → `None`.
    pub fn token(&self) -> Option<SecretString> {
        std::env::var(&self.token_env)
            .ok()
            .filter(|t| !t.is_empty())
            .map(SecretString::from)
    }
}

fn default_token_env() -> String {
    "HF_TOKEN".into()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HttpCfg {
    /// TCP connect timeout in milliseconds (default 5000ms)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Optional per-host idle connection pool cap (None = reqwest default)
    #[serde(default)]
    pub pool_max_idle_per_host: Option<usize>,
}

impl Default for HttpCfg {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            pool_max_idle_per_host: None,
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct StreamCfg {
    /// Literal markers that end generation from inside the fragment stream.
    #[serde(default = "default_stop_sequences")]
    pub stop_sequences: Vec<String>,
    /// Overall ceiling per request, independent of `max_tokens`.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Coalesce segments up to this many bytes before writing (0 = off).
    #[serde(default)]
    pub coalesce_max_bytes: usize,
    /// Longest time a coalesced batch may wait before it is written.
    #[serde(default = "default_coalesce_max_wait_ms")]
    pub coalesce_max_wait_ms: u64,
}

impl Default for StreamCfg {
    fn default() -> Self {
        Self {
            stop_sequences: default_stop_sequences(),
            request_timeout_ms: default_request_timeout_ms(),
            coalesce_max_bytes: 0,
            coalesce_max_wait_ms: default_coalesce_max_wait_ms(),
        }
    }
}

impl StreamCfg {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn coalesce_max_wait(&self) -> Duration {
        Duration::from_millis(self.coalesce_max_wait_ms)
    }
}

fn default_stop_sequences() -> Vec<String> {
    vec![DEFAULT_STOP_SEQUENCE.to_string()]
}
fn default_request_timeout_ms() -> u64 {
    120_000
}
fn default_coalesce_max_wait_ms() -> u64 {
    50
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ServerCfg {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerCfg {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8000".into()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct PromptCfg {
    /// Context line placed ahead of the conversation ("" disables it).
    #[serde(default = "default_preamble")]
    pub preamble: String,
}

impl Default for PromptCfg {
    fn default() -> Self {
        Self {
            preamble: default_preamble(),
        }
    }
}

fn default_preamble() -> String {
    DEFAULT_PREAMBLE.into()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendCfg,
    /// HTTP client configuration (timeouts, pooling). Missing → defaults.
    #[serde(default)]
    pub http: HttpCfg,
    #[serde(default)]
    pub stream: StreamCfg,
    #[serde(default)]
    pub server: ServerCfg,
    #[serde(default)]
    pub prompt: PromptCfg,
    /// Used when a request omits `max_tokens` / `temperature`.
    #[serde(default)]
    pub defaults: GenerationParams,
}

impl Config {
    /// Load a Config from a file path (JSON or TOML by extension). If the
    /// extension is missing or unrecognized, try JSON first, then TOML.
    pub fn from_path<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(ChatError::from)?;
        let s = std::str::from_utf8(&bytes).map_err(|e| ChatError::Other(e.into()))?;
        let cfg: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => {
                serde_json::from_str::<Self>(s).map_err(|e| ChatError::Other(e.into()))?
            }
            Some("toml") => toml::from_str::<Self>(s).map_err(|e| ChatError::Other(e.into()))?,
            _ => serde_json::from_str::<Self>(s)
                .map_err(|e| ChatError::Other(e.into()))
                .or_else(|_| toml::from_str::<Self>(s).map_err(|e| ChatError::Other(e.into())))?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults overlaid with the process environment:
    /// `HF_ENDPOINT`, `VOLKAI_BACKEND`, `VOLKAI_BIND`, `VOLKAI_STOP_SEQUENCES`
    /// (comma separated) and `VOLKAI_REQUEST_TIMEOUT_MS`.
    pub fn from_env() -> CoreResult<Self> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> CoreResult<Self> {
        let mut cfg = Self::default();
        cfg.backend.endpoint = get("HF_ENDPOINT").filter(|s| !s.is_empty());
        if let Some(kind) = get("VOLKAI_BACKEND") {
            cfg.backend.kind = match kind.as_str() {
                "tgi" => BackendKind::Tgi,
                "null" => BackendKind::Null,
                other => {
                    return Err(ChatError::Validation(format!("unknown backend kind '{other}'")));
                }
            };
        }
        if let Some(bind) = get("VOLKAI_BIND") {
            cfg.server.bind = bind;
        }
        if let Some(stops) = get("VOLKAI_STOP_SEQUENCES") {
            cfg.stream.stop_sequences = stops
                .split(',')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(ms) = get("VOLKAI_REQUEST_TIMEOUT_MS") {
            cfg.stream.request_timeout_ms = ms.trim().parse().map_err(|_| {
                ChatError::Validation(format!("VOLKAI_REQUEST_TIMEOUT_MS is not a number: '{ms}'"))
            })?;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.stream.stop_sequences.is_empty() {
            return Err(ChatError::Validation("at least one stop sequence is required".into()));
        }
        if self.stream.stop_sequences.iter().any(String::is_empty) {
            return Err(ChatError::Validation("stop sequences must not be empty strings".into()));
        }
        if self.stream.request_timeout_ms == 0 {
            return Err(ChatError::Validation("request_timeout_ms must be positive".into()));
        }
        if self.backend.kind == BackendKind::Tgi && self.backend.endpoint.is_none() {
            return Err(ChatError::Validation(
                "backend.endpoint (HF_ENDPOINT) is required for the tgi backend".into(),
            ));
        }
        self.defaults.validate()
    }
}
