use std::sync::Arc;

use crate::config::{BackendKind, Config};
use crate::error::{ChatError, CoreResult};
use crate::http_client::HttpClient;
use crate::providers::Tgi;
use crate::source::{FragmentSource, NullSource};

/// Build the fragment source selected by `backend.kind`.
///
/// The source is shared by every request; each `open` call starts its own
/// backend session.
pub fn build_source(cfg: &Config) -> CoreResult<Arc<dyn FragmentSource>> {
    match cfg.backend.kind {
        BackendKind::Null => {
            tracing::info!(backend = "null", "using built-in null backend");
            Ok(Arc::new(NullSource::default()))
        }
        BackendKind::Tgi => {
            let endpoint = cfg.backend.endpoint.clone().ok_or_else(|| {
                ChatError::Validation("backend.endpoint (HF_ENDPOINT) is required for the tgi backend".into())
            })?;
            let token = cfg.backend.token();
            if token.is_none() {
                tracing::warn!(
                    token_env = %cfg.backend.token_env,
                    "no backend token set; sending unauthenticated requests"
                );
            }
            let http = HttpClient::from_cfg(&cfg.http)?;
            tracing::info!(backend = "tgi", endpoint = %endpoint, "using text-generation-inference backend");
            Ok(Arc::new(Tgi::new(http, endpoint, token)))
        }
    }
}
