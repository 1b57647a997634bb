use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::stream::Stream;
use reqwest::{Client, StatusCode};
use serde::Serialize;

use crate::config::HttpCfg;
use crate::error::{ChatError, CoreResult};

/// Request context carries tracing IDs forwarded to the backend.
#[derive(Clone, Copy, Default)]
pub struct RequestCtx<'a> {
    pub request_id: Option<&'a str>,
}

/// Represents a single Server-Sent-Event line (already split on `\n`).
#[derive(Debug, Clone)]
pub struct SseLine {
    pub line: String,
}

/// A boxed stream of `SseLine` results.
pub type SseStream = Pin<Box<dyn Stream<Item = CoreResult<SseLine>> + Send>>;

type ByteStream = Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>;

/// Thin wrapper around reqwest::Client with defaults and helpers.
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: Client,
    user_agent: String,
}

impl HttpClient {
    pub fn new_default() -> CoreResult<Self> {
        Self::from_cfg(&HttpCfg::default())
    }

    /// No total request timeout is set here: streamed bodies can legitimately
    /// outlive any fixed per-request budget. The pipeline enforces its own.
    pub fn from_cfg(cfg: &HttpCfg) -> CoreResult<Self> {
        let mut builder =
            Client::builder().connect_timeout(Duration::from_millis(cfg.connect_timeout_ms));
        if let Some(n) = cfg.pool_max_idle_per_host {
            builder = builder.pool_max_idle_per_host(n);
        }
        let inner = builder
            .build()
            .map_err(|e| ChatError::Other(anyhow::anyhow!("http client build failed: {e}")))?;
        Ok(Self {
            inner,
            user_agent: concat!("volkai/", env!("CARGO_PKG_VERSION")).to_string(),
        })
    }

    /// POST JSON and return an SSE (Server-Sent Events) line stream.
    /// Each yielded item is one raw line (trim not applied) from the SSE channel.
    pub async fn post_sse_lines<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
        ctx: &RequestCtx<'_>,
    ) -> CoreResult<SseStream> {
        let mut req = self
            .inner
            .post(url)
            .json(body)
            .header("User-Agent", &self.user_agent)
            .header("Accept", "text/event-stream");

        for (k, v) in headers {
            req = req.header(*k, *v);
        }
        if let Some(rid) = ctx.request_id {
            req = req.header("X-Request-Id", rid);
        }

        let resp = req.send().await.map_err(|e| {
            tracing::warn!(error = %e, url, "backend connect failed");
            ChatError::ProviderUnavailable {
                provider: "http".into(),
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            let headers = resp.headers().clone();
            let ra = parse_retry_after(&headers);
            let body = resp.text().await.unwrap_or_default();
            return Err(map_http_error("http", status, ra, &body));
        }
        if let Some(id) = extract_request_id(resp.headers()) {
            tracing::debug!(provider_request_id = %id, "backend stream opened");
        }

        // Stream body as bytes and split on '\n'
        let byte_stream = resp.bytes_stream();
        let line_stream = LineStream::new(Box::pin(byte_stream));
        Ok(Box::pin(line_stream))
    }
}

fn extract_request_id(headers: &reqwest::header::HeaderMap) -> Option<String> {
    static CANDIDATES: [&str; 3] = ["x-request-id", "request-id", "x-compute-request-id"];
    for k in CANDIDATES {
        if let Some(v) = headers.get(k)
            && let Ok(s) = v.to_str()
        {
            return Some(s.to_string());
        }
    }
    None
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    if let Some(v) = headers.get("retry-after")
        && let Ok(s) = v.to_str()
        && let Ok(secs) = s.trim().parse::<u64>()
    {
        return Some(secs);
    }
    // HTTP-date forms are ignored.
    None
}

fn map_http_error(provider: &str, status: StatusCode, retry_after: Option<u64>, body: &str) -> ChatError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => ChatError::RateLimited {
            provider: provider.to_string(),
            retry_after,
        },
        s if s.is_server_error() => ChatError::ProviderUnavailable {
            provider: provider.to_string(),
        },
        s => ChatError::ProviderError {
            provider: provider.to_string(),
            code: s.as_u16().to_string(),
            message: truncate(body, 300),
        },
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() > max {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        let mut t = s[..end].to_string();
        t.push_str("...");
        t
    } else {
        s.to_string()
    }
}

/// Longest SSE line accepted from a backend before the stream is failed.
pub const MAX_LINE_BYTES: usize = 1 << 20;

/// Internal line splitter over a bytes stream; yields `SseLine`s separated by '\n'.
/// Bytes are buffered until a full line is seen so multi-byte characters split
/// across network chunks decode intact.
struct LineStream {
    inner: ByteStream,
    buf: Vec<u8>,
    max_line: usize,
    finished: bool,
}

impl LineStream {
    fn new(inner: ByteStream) -> Self {
        Self::with_max_line(inner, MAX_LINE_BYTES)
    }

    fn with_max_line(inner: ByteStream, max_line: usize) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            max_line,
            finished: false,
        }
    }

    fn take_line(&mut self, end: usize) -> SseLine {
        let mut raw: Vec<u8> = self.buf.drain(..end).collect();
        if raw.last() == Some(&b'\n') {
            raw.pop();
        }
        if raw.last() == Some(&b'\r') {
            raw.pop();
        }
        SseLine {
            line: String::from_utf8_lossy(&raw).into_owned(),
        }
    }
}

impl Stream for LineStream {
    type Item = CoreResult<SseLine>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            // If we already have a newline in the buffer, split and yield immediately.
            if let Some(idx) = self.buf.iter().position(|b| *b == b'\n') {
                let line = self.take_line(idx + 1);
                return Poll::Ready(Some(Ok(line)));
            }
            if self.finished {
                return Poll::Ready(None);
            }
            if self.buf.len() > self.max_line {
                tracing::warn!(buffered = self.buf.len(), "backend line exceeds limit");
                self.finished = true;
                self.buf.clear();
                return Poll::Ready(Some(Err(ChatError::ProviderError {
                    provider: "http".into(),
                    code: "line_too_long".into(),
                    message: format!("SSE line longer than {} bytes", self.max_line),
                })));
            }

            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    self.buf.extend_from_slice(&chunk);
                }
                Poll::Ready(Some(Err(e))) => {
                    tracing::warn!(error = %e, "backend stream broke");
                    self.finished = true;
                    self.buf.clear();
                    return Poll::Ready(Some(Err(ChatError::ProviderUnavailable {
                        provider: "http".into(),
                    })));
                }
                Poll::Ready(None) => {
                    self.finished = true;
                    if !self.buf.is_empty() {
                        let end = self.buf.len();
                        return Poll::Ready(Some(Ok(self.take_line(end))));
                    }
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
