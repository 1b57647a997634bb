//! In-process backends for exercising the pipeline and HTTP layer without a
//! network. Compiled for this crate's tests and, via the `test-util` feature,
//! for dependants' tests.

use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};

use crate::error::{ChatError, CoreResult};
use crate::model::GenerationParams;
use crate::source::FragmentSource;
use crate::stream::{Fragment, FragmentStream};

/// One step of a `ScriptedSource` session.
#[derive(Debug, Clone, PartialEq)]
pub enum Scripted {
    Text(String),
    /// Yield a mid-stream backend error; the session ends after it.
    Fail(String),
    /// Never yield again (a stalled backend).
    Stall,
}

/// Replays a fixed script on every `open`; records what it was asked for
/// and how many sessions were dropped.
pub struct ScriptedSource {
    script: Vec<Scripted>,
    open_error: Option<String>,
    calls: Mutex<Vec<(String, GenerationParams)>>,
    request_ids: Mutex<Vec<Option<String>>>,
    released: Arc<AtomicUsize>,
}

impl ScriptedSource {
    pub fn new(script: Vec<Scripted>) -> Self {
        Self {
            script,
            open_error: None,
            calls: Mutex::new(Vec::new()),
            request_ids: Mutex::new(Vec::new()),
            released: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn texts<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(fragments.into_iter().map(|f| Scripted::Text(f.into())).collect())
    }

    /// Every `open` fails before streaming starts.
    pub fn failing_open(message: impl Into<String>) -> Self {
        let mut s = Self::new(Vec::new());
        s.open_error = Some(message.into());
        s
    }

    pub fn calls(&self) -> Vec<(String, GenerationParams)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Request ids passed to each `open`, in call order.
    pub fn request_ids(&self) -> Vec<Option<String>> {
        self.request_ids.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Number of opened sessions whose stream has been dropped.
    pub fn sessions_released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FragmentSource for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn open(
        &self,
        prompt: &str,
        params: GenerationParams,
        request_id: Option<&str>,
    ) -> CoreResult<FragmentStream> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((prompt.to_string(), params));
        }
        if let Ok(mut ids) = self.request_ids.lock() {
            ids.push(request_id.map(str::to_string));
        }
        if let Some(msg) = &self.open_error {
            return Err(ChatError::ProviderUnavailable { provider: msg.clone() });
        }

        let mut items: Vec<CoreResult<Fragment>> = Vec::new();
        let mut stall = false;
        for step in &self.script {
            match step {
                Scripted::Text(t) => items.push(Ok(t.clone())),
                Scripted::Fail(m) => {
                    items.push(Err(ChatError::ProviderError {
                        provider: "scripted".into(),
                        code: "stream".into(),
                        message: m.clone(),
                    }));
                    break;
                }
                Scripted::Stall => {
                    stall = true;
                    break;
                }
            }
        }
        let head = stream::iter(items);
        let inner: FragmentStream = if stall {
            head.chain(stream::pending()).boxed()
        } else {
            head.boxed()
        };
        Ok(ReleaseOnDrop {
            inner,
            released: self.released.clone(),
        }
        .boxed())
    }
}

struct ReleaseOnDrop {
    inner: FragmentStream,
    released: Arc<AtomicUsize>,
}

impl Stream for ReleaseOnDrop {
    type Item = CoreResult<Fragment>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_source_replays_and_tracks_release() {
        let src = ScriptedSource::new(vec![
            Scripted::Text("a".into()),
            Scripted::Fail("boom".into()),
            Scripted::Text("never".into()),
        ]);
        let params = GenerationParams::default();
        let items: Vec<_> = src.open("prompt", params, Some("rid-1")).await.unwrap().collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "a");
        assert!(matches!(items[1], Err(ChatError::ProviderError { .. })));
        assert_eq!(src.sessions_released(), 1);
        assert_eq!(src.calls(), vec![("prompt".to_string(), params)]);
        assert_eq!(src.request_ids(), vec![Some("rid-1".to_string())]);
    }

    #[tokio::test]
    async fn failing_open_errors_before_streaming() {
        let src = ScriptedSource::failing_open("down");
        let err = src.open("p", GenerationParams::default(), None).await.err().expect("must fail");
        assert!(matches!(err, ChatError::ProviderUnavailable { .. }));
    }
}
