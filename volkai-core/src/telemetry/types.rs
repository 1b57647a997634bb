use serde::{Deserialize, Serialize};

/// Structured, provider-agnostic record of one finished stream.
/// Emitted exactly once per pipeline, including when the client went away.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StreamLog {
    pub request_id: Option<String>,
    pub provider: Option<String>,

    /// `completed`, `stop_detected`, `error` or `cancelled`.
    pub termination: Option<String>,
    pub segments: u32,
    pub bytes: u64,
    pub latency_ms: Option<u64>,

    pub error_kind: Option<String>,
    pub error_message: Option<String>,
}

impl StreamLog {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn request_id_opt(mut self, v: Option<&str>) -> Self {
        self.request_id = v.map(|s| s.to_string());
        self
    }
    pub fn provider_opt(mut self, v: Option<&str>) -> Self {
        self.provider = v.map(|s| s.to_string());
        self
    }
    pub fn termination(mut self, v: &str) -> Self {
        self.termination = Some(v.to_string());
        self
    }
    pub fn output(mut self, segments: u32, bytes: u64) -> Self {
        self.segments = segments;
        self.bytes = bytes;
        self
    }
    pub fn latency_ms(mut self, ms: u64) -> Self {
        self.latency_ms = Some(ms);
        self
    }
    pub fn error(mut self, kind: &str, msg: &str) -> Self {
        self.error_kind = Some(kind.to_string());
        self.error_message = Some(msg.to_string());
        self
    }
}
