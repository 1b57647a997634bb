//! Fragment source → stop-aware buffer → (optional) coalescing.
//!
//! A pipeline is built once from configuration and shared read-only; every
//! request gets its own `StopAwareStream` with its own pending buffer and
//! backend session. Dropping the returned stream (client disconnect) drops
//! the backend session with it.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::stream::{Stream, StreamExt};
use tokio::time::{Instant, Sleep, sleep_until};

use crate::buffer::{Step, StopBuffer, Termination};
use crate::coalesce::Coalesced;
use crate::config::StreamCfg;
use crate::error::{ChatError, CoreResult};
use crate::model::GenerationParams;
use crate::source::FragmentSource;
use crate::stream::{BoxStreamEv, FragmentStream, StreamEvent};
use crate::telemetry::{
    self, KEY_BYTES, KEY_ERROR_KIND, KEY_ERROR_MESSAGE, KEY_LATENCY_MS, KEY_PROVIDER,
    KEY_REQUEST_ID, KEY_SEGMENTS, KEY_TERMINATION, StreamLog,
};

#[derive(Debug, Clone)]
pub struct Pipeline {
    stops: StopBuffer,
    timeout: Duration,
    coalesce_max_bytes: usize,
    coalesce_max_wait: Duration,
}

impl Pipeline {
    pub fn from_cfg(cfg: &StreamCfg) -> CoreResult<Self> {
        // Fail at startup rather than per request on a bad stop list.
        let stops = StopBuffer::new(cfg.stop_sequences.iter().cloned())?;
        Ok(Self {
            stops,
            timeout: cfg.request_timeout(),
            coalesce_max_bytes: cfg.coalesce_max_bytes,
            coalesce_max_wait: cfg.coalesce_max_wait(),
        })
    }

    /// Open one backend session and wrap it. Failures to open (including
    /// hitting the ceiling while connecting) are returned here, before any
    /// event exists, so callers can still answer with a plain error status.
    pub async fn start(
        &self,
        source: &dyn FragmentSource,
        prompt: &str,
        params: GenerationParams,
        request_id: Option<String>,
    ) -> CoreResult<BoxStreamEv> {
        let deadline = Instant::now() + self.timeout;
        let fragments = tokio::time::timeout_at(deadline, source.open(prompt, params, request_id.as_deref()))
            .await
            .map_err(|_| ChatError::Timeout {
                limit_ms: self.timeout.as_millis() as u64,
            })??;
        Ok(self.wrap(fragments, deadline, source.name(), request_id))
    }

    /// Wrap an already opened fragment stream; the ceiling counts from `deadline`.
    pub fn wrap(
        &self,
        fragments: FragmentStream,
        deadline: Instant,
        provider: &str,
        request_id: Option<String>,
    ) -> BoxStreamEv {
        let span = tracing::info_span!(
            "chat_stream",
            { KEY_REQUEST_ID } = request_id.as_deref().unwrap_or("-"),
            { KEY_PROVIDER } = provider,
            { KEY_TERMINATION } = tracing::field::Empty,
        );
        let events = StopAwareStream {
            source: Some(fragments),
            buffer: self.stops.clone(),
            deadline: Some(Box::pin(sleep_until(deadline))),
            limit_ms: self.timeout.as_millis() as u64,
            queued: VecDeque::with_capacity(2),
            started: Instant::now(),
            segments: 0,
            bytes: 0,
            provider: provider.to_string(),
            request_id,
            span,
            logged: false,
        };
        if self.coalesce_max_bytes == 0 {
            events.boxed()
        } else {
            Coalesced::new(events, self.coalesce_max_bytes, self.coalesce_max_wait).boxed()
        }
    }
}

/// Drives a `StopBuffer` from a fragment stream.
///
/// Yields `Segment`s then exactly one terminal event, and releases the
/// source as soon as the terminal event is decided.
pub struct StopAwareStream {
    source: Option<FragmentStream>,
    buffer: StopBuffer,
    deadline: Option<Pin<Box<Sleep>>>,
    limit_ms: u64,
    queued: VecDeque<StreamEvent>,
    started: Instant,
    segments: u32,
    bytes: u64,
    provider: String,
    request_id: Option<String>,
    span: tracing::Span,
    logged: bool,
}

impl StopAwareStream {
    fn apply(&mut self, step: Step, err: Option<ChatError>) {
        if let Some(text) = step.segment {
            self.queued.push_back(StreamEvent::Segment(text));
        }
        let Some(term) = step.terminal else {
            return;
        };
        self.source = None;
        self.deadline = None;
        let ev = match term {
            Termination::Completed => StreamEvent::Completed,
            Termination::StopDetected => StreamEvent::StopDetected,
            Termination::Error => StreamEvent::Error(
                err.unwrap_or_else(|| ChatError::Other(anyhow::anyhow!("stream failed"))),
            ),
        };
        self.queued.push_back(ev);
    }

    fn record(&mut self, ev: &StreamEvent) {
        self.logged = true;
        let _entered = self.span.enter();
        let latency_ms = self.started.elapsed().as_millis() as u64;
        let rid = self.request_id.as_deref().unwrap_or("-");
        let mut log = StreamLog::new()
            .request_id_opt(self.request_id.as_deref())
            .provider_opt(Some(&self.provider))
            .output(self.segments, self.bytes)
            .latency_ms(latency_ms);
        match ev {
            StreamEvent::Error(e) => {
                let message = e.to_string();
                tracing::warn!(
                    { KEY_REQUEST_ID } = rid,
                    { KEY_ERROR_KIND } = e.kind(),
                    { KEY_ERROR_MESSAGE } = message.as_str(),
                    { KEY_SEGMENTS } = self.segments,
                    "stream ended with error"
                );
                self.span.record(KEY_TERMINATION, "error");
                log = log.termination("error").error(e.kind(), &message);
            }
            other => {
                let term = other.termination().map(|t| t.as_str()).unwrap_or("completed");
                tracing::info!(
                    { KEY_REQUEST_ID } = rid,
                    { KEY_TERMINATION } = term,
                    { KEY_SEGMENTS } = self.segments,
                    { KEY_BYTES } = self.bytes,
                    { KEY_LATENCY_MS } = latency_ms,
                    "stream finished"
                );
                self.span.record(KEY_TERMINATION, term);
                log = log.termination(term);
            }
        }
        telemetry::emit_stream(log);
    }
}

impl Stream for StopAwareStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(ev) = self.queued.pop_front() {
                match &ev {
                    StreamEvent::Segment(s) => {
                        self.segments += 1;
                        self.bytes += s.len() as u64;
                    }
                    terminal => self.record(terminal),
                }
                return Poll::Ready(Some(ev));
            }
            if self.buffer.is_done() {
                return Poll::Ready(None);
            }

            if let Some(deadline) = self.deadline.as_mut()
                && deadline.as_mut().poll(cx).is_ready()
            {
                let step = self.buffer.fail();
                let limit_ms = self.limit_ms;
                self.apply(step, Some(ChatError::Timeout { limit_ms }));
                continue;
            }

            let Some(source) = self.source.as_mut() else {
                return Poll::Ready(None);
            };
            match source.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(fragment))) => {
                    let step = self.buffer.push(&fragment);
                    self.apply(step, None);
                }
                Poll::Ready(Some(Err(e))) => {
                    let step = self.buffer.fail();
                    self.apply(step, Some(e));
                }
                Poll::Ready(None) => {
                    let step = self.buffer.finish();
                    self.apply(step, None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl Drop for StopAwareStream {
    fn drop(&mut self) {
        if self.logged {
            return;
        }
        // Client went away mid-stream: normal termination, not a failure.
        self.span.record(KEY_TERMINATION, "cancelled");
        tracing::debug!(
            parent: &self.span,
            {
                { KEY_REQUEST_ID } = self.request_id.as_deref().unwrap_or("-"),
                { KEY_SEGMENTS } = self.segments,
            },
            "stream dropped by client; releasing backend session"
        );
        telemetry::emit_stream(
            StreamLog::new()
                .request_id_opt(self.request_id.as_deref())
                .provider_opt(Some(&self.provider))
                .termination("cancelled")
                .output(self.segments, self.bytes)
                .latency_ms(self.started.elapsed().as_millis() as u64),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::DEFAULT_STOP_SEQUENCE;
    use crate::testing::{Scripted, ScriptedSource};
    use crate::telemetry::TelemetrySink;
    use once_cell::sync::Lazy;
    use std::sync::{Arc, Mutex};

    static STREAM_LOGS: Lazy<Mutex<Vec<StreamLog>>> = Lazy::new(|| Mutex::new(Vec::new()));

    struct TestSink;
    impl TelemetrySink for TestSink {
        fn record_stream(&self, log: StreamLog) {
            STREAM_LOGS.lock().unwrap().push(log);
        }
    }

    fn capture_logs() {
        let _ = telemetry::set_telemetry_sink(Arc::new(TestSink));
        telemetry::test_set_capture_enabled(true);
    }

    fn logs_for(rid: &str) -> Vec<StreamLog> {
        STREAM_LOGS
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.request_id.as_deref() == Some(rid))
            .cloned()
            .collect()
    }

    fn pipeline() -> Pipeline {
        Pipeline::from_cfg(&StreamCfg::default()).unwrap()
    }

    async fn run(p: &Pipeline, src: &ScriptedSource) -> (String, Vec<StreamEvent>) {
        let events: Vec<StreamEvent> = p
            .start(src, "prompt", GenerationParams::default(), None)
            .await
            .expect("open ok")
            .collect()
            .await;
        let text = events.iter().filter_map(StreamEvent::as_segment).collect();
        (text, events)
    }

    #[tokio::test]
    async fn split_marker_scenario() {
        let src = ScriptedSource::texts(["Hel", "lo <", "|endo", "ftext|>", "garbage"]);
        let (text, events) = run(&pipeline(), &src).await;
        assert_eq!(text, "Hello ");
        assert!(matches!(events.last(), Some(StreamEvent::StopDetected)));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        assert_eq!(src.sessions_released(), 1);
    }

    #[tokio::test]
    async fn plain_scenario_completes() {
        let src = ScriptedSource::texts(["a", "b", "c"]);
        let (text, events) = run(&pipeline(), &src).await;
        assert_eq!(text, "abc");
        assert!(matches!(events.last(), Some(StreamEvent::Completed)));
    }

    #[tokio::test]
    async fn same_result_for_any_fragmentation() {
        let full = format!("The answer is 42.{DEFAULT_STOP_SEQUENCE} ignored");
        let p = pipeline();
        let per_char = ScriptedSource::texts(full.chars().map(|c| c.to_string()));
        let whole = ScriptedSource::texts([full.clone()]);
        let (a, ea) = run(&p, &per_char).await;
        let (b, eb) = run(&p, &whole).await;
        assert_eq!(a, "The answer is 42.");
        assert_eq!(a, b);
        assert_eq!(ea.last().and_then(StreamEvent::termination), eb.last().and_then(StreamEvent::termination));
    }

    #[tokio::test]
    async fn midstream_error_drops_pending_and_reports() {
        let src = ScriptedSource::new(vec![
            Scripted::Text("partial <|end".into()),
            Scripted::Fail("connection reset".into()),
        ]);
        let (text, events) = run(&pipeline(), &src).await;
        assert_eq!(text, "partial ");
        match events.last() {
            Some(StreamEvent::Error(ChatError::ProviderError { message, .. })) => {
                assert_eq!(message, "connection reset")
            }
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_backend_hits_ceiling() {
        let cfg = StreamCfg {
            request_timeout_ms: 1_000,
            ..StreamCfg::default()
        };
        let p = Pipeline::from_cfg(&cfg).unwrap();
        let src = ScriptedSource::new(vec![Scripted::Text("hi ".into()), Scripted::Stall]);
        let (text, events) = run(&p, &src).await;
        assert_eq!(text, "hi ");
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Error(ChatError::Timeout { limit_ms: 1_000 }))
        ));
        assert_eq!(src.sessions_released(), 1);
    }

    #[tokio::test]
    async fn open_failure_is_returned_before_streaming() {
        let src = ScriptedSource::failing_open("tgi");
        let res = pipeline().start(&src, "p", GenerationParams::default(), None).await;
        assert!(matches!(res, Err(ChatError::ProviderUnavailable { .. })));
    }

    #[tokio::test]
    async fn dropping_mid_stream_releases_session() {
        capture_logs();
        let src = ScriptedSource::new(vec![Scripted::Text("one ".into()), Scripted::Stall]);
        let mut events = pipeline()
            .start(&src, "p", GenerationParams::default(), Some("rid-cancel".into()))
            .await
            .unwrap();
        assert_eq!(events.next().await.unwrap().as_segment(), Some("one "));
        assert_eq!(src.sessions_released(), 0);
        drop(events);
        assert_eq!(src.sessions_released(), 1);

        let logs = logs_for("rid-cancel");
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].termination.as_deref(), Some("cancelled"));
        assert_eq!(logs[0].segments, 1);
    }

    #[tokio::test]
    async fn emits_one_stream_log_per_request() {
        capture_logs();
        let src = ScriptedSource::texts(["hello", " world<|endoftext|>"]);
        let events: Vec<StreamEvent> = pipeline()
            .start(&src, "p", GenerationParams::default(), Some("rid-log".into()))
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(events.len(), 3);

        let logs = logs_for("rid-log");
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].termination.as_deref(), Some("stop_detected"));
        assert_eq!(logs[0].segments, 2);
        assert_eq!(logs[0].bytes, "hello world".len() as u64);
        assert_eq!(logs[0].provider.as_deref(), Some("scripted"));
        assert_eq!(src.request_ids(), vec![Some("rid-log".to_string())]);
    }

    #[tokio::test]
    async fn stream_span_records_termination() {
        let (store, _guard) = telemetry::test_span::install_capture();
        let src = ScriptedSource::texts(["x<|endoftext|>"]);
        let events: Vec<StreamEvent> = pipeline()
            .start(&src, "p", GenerationParams::default(), Some("rid-span".into()))
            .await
            .unwrap()
            .collect()
            .await;
        assert!(matches!(events.last(), Some(StreamEvent::StopDetected)));
        let fields = store.fields_of("chat_stream").expect("span captured");
        assert_eq!(fields.get(KEY_REQUEST_ID).map(String::as_str), Some("rid-span"));
        assert_eq!(fields.get(KEY_PROVIDER).map(String::as_str), Some("scripted"));
        assert_eq!(fields.get(KEY_TERMINATION).map(String::as_str), Some("stop_detected"));
    }

    #[tokio::test]
    async fn coalescing_keeps_text_and_terminal() {
        let cfg = StreamCfg {
            coalesce_max_bytes: 4,
            ..StreamCfg::default()
        };
        let p = Pipeline::from_cfg(&cfg).unwrap();
        let src = ScriptedSource::texts(["a", "b", "c", "d", "e", "<|endoftext|>"]);
        let (text, events) = run(&p, &src).await;
        assert_eq!(text, "abcde");
        assert_eq!(events[0].as_segment(), Some("abcd"));
        assert!(matches!(events.last(), Some(StreamEvent::StopDetected)));
    }

    #[test]
    fn empty_stop_sequence_rejected_at_build() {
        let cfg = StreamCfg {
            stop_sequences: vec!["".into()],
            ..StreamCfg::default()
        };
        assert!(matches!(Pipeline::from_cfg(&cfg), Err(ChatError::Validation(_))));
    }
}
