use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use crate::error::CoreResult;
use crate::model::GenerationParams;
use crate::stream::{Fragment, FragmentStream};

/// A generation backend seen as a lazy sequence of raw text fragments.
///
/// Each `open` starts one backend session. Errors that happen before the first
/// fragment can be read are returned from `open`; later failures arrive as a
/// single `Err` item, after which the stream ends. Dropping the stream must
/// release the session.
#[async_trait]
pub trait FragmentSource: Send + Sync {
    fn name(&self) -> &str;
    /// `request_id` is forwarded to the backend when the transport supports it.
    async fn open(
        &self,
        prompt: &str,
        params: GenerationParams,
        request_id: Option<&str>,
    ) -> CoreResult<FragmentStream>;
}

/// Offline backend that streams a canned reply, one word per fragment.
/// Useful for smoke runs without backend credentials.
pub struct NullSource {
    reply: String,
}

impl NullSource {
    pub const DEFAULT_REPLY: &'static str = "Hello from the VolkAI null backend.";

    pub fn new(reply: impl Into<String>) -> Self {
        Self { reply: reply.into() }
    }
}

impl Default for NullSource {
    fn default() -> Self {
        Self::new(Self::DEFAULT_REPLY)
    }
}

#[async_trait]
impl FragmentSource for NullSource {
    fn name(&self) -> &str {
        "null"
    }

    async fn open(
        &self,
        _prompt: &str,
        params: GenerationParams,
        _request_id: Option<&str>,
    ) -> CoreResult<FragmentStream> {
        let words: Vec<CoreResult<Fragment>> = self
            .reply
            .split_inclusive(' ')
            .take(params.max_tokens as usize)
            .map(|w| Ok(w.to_string()))
            .collect();
        Ok(stream::iter(words).boxed())
    }
}
