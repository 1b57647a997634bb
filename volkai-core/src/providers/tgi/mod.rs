use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::stream::{Stream, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::{ChatError, CoreResult};
use crate::http_client::{HttpClient, RequestCtx, SseStream};
use crate::model::GenerationParams;
use crate::source::FragmentSource;
use crate::stream::{Fragment, FragmentStream};
use crate::telemetry::{KEY_PROVIDER, KEY_REQUEST_ID};

/// Hugging Face text-generation-inference streaming backend.
#[derive(Debug, Clone)]
pub struct Tgi {
    http: HttpClient,
    endpoint: String,
    token: Option<SecretString>,
    name: String,
}

impl Tgi {
    pub fn new(http: HttpClient, endpoint: String, token: Option<SecretString>) -> Self {
        Self {
            http,
            endpoint,
            token,
            name: "tgi".into(),
        }
    }

    #[cfg(test)]
    pub fn new_for_tests(endpoint: &str) -> Self {
        Tgi::new(
            HttpClient::new_default().unwrap(),
            endpoint.to_string(),
            Some(SecretString::from("test-token".to_string())),
        )
    }

    fn headers(&self) -> Vec<(String, String)> {
        let mut h = vec![("Content-Type".to_string(), "application/json".to_string())];
        if let Some(token) = &self.token {
            h.push((
                "Authorization".to_string(),
                format!("Bearer {}", token.expose_secret()),
            ));
        }
        h
    }
}

// ---- Wire structs (minimal) ----
#[derive(Serialize)]
struct TgiReq<'a> {
    inputs: &'a str,
    parameters: TgiParams,
    stream: bool,
}

#[derive(Serialize)]
struct TgiParams {
    max_new_tokens: u32,
    /// TGI rejects a zero temperature; greedy decoding is `do_sample: false`.
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    do_sample: bool,
    details: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TgiFrame {
    Token {
        token: TgiToken,
    },
    Error {
        error: String,
        #[serde(default)]
        error_type: Option<String>,
    },
    Text(String),
}

#[derive(Deserialize)]
struct TgiToken {
    text: String,
}

#[derive(Debug, PartialEq)]
enum Parsed {
    Fragment(Fragment),
    Failed { code: String, message: String },
    End,
}

/// Interpret one SSE line. `None` for lines that carry no fragment
/// (event names, ids, comments, blank separators, unknown JSON objects).
fn parse_line(line: &str) -> Option<Parsed> {
    let payload = line.strip_prefix("data:")?;
    let payload = payload.strip_prefix(' ').unwrap_or(payload);
    if payload == "[DONE]" {
        return Some(Parsed::End);
    }
    match serde_json::from_str::<TgiFrame>(payload) {
        Ok(TgiFrame::Token { token }) => Some(Parsed::Fragment(token.text)),
        Ok(TgiFrame::Text(text)) => Some(Parsed::Fragment(text)),
        Ok(TgiFrame::Error { error, error_type }) => Some(Parsed::Failed {
            code: error_type.unwrap_or_else(|| "stream".into()),
            message: error,
        }),
        Err(_) if payload.trim_start().starts_with('{') => {
            tracing::debug!(payload, "ignoring unrecognised backend frame");
            None
        }
        // Raw string chunk.
        Err(_) => Some(Parsed::Fragment(payload.to_string())),
    }
}

/// Turns backend SSE lines into fragments; ends after `[DONE]` or the first error.
struct TgiFragments {
    lines: SseStream,
    provider: String,
    done: bool,
}

impl Stream for TgiFragments {
    type Item = CoreResult<Fragment>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if self.done {
                return Poll::Ready(None);
            }
            match self.lines.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(l))) => match parse_line(&l.line) {
                    Some(Parsed::Fragment(f)) => return Poll::Ready(Some(Ok(f))),
                    Some(Parsed::End) => self.done = true,
                    Some(Parsed::Failed { code, message }) => {
                        self.done = true;
                        return Poll::Ready(Some(Err(ChatError::ProviderError {
                            provider: self.provider.clone(),
                            code,
                            message,
                        })));
                    }
                    None => continue,
                },
                Poll::Ready(Some(Err(e))) => {
                    self.done = true;
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => self.done = true,
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[async_trait]
impl FragmentSource for Tgi {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(
        &self,
        prompt: &str,
        params: GenerationParams,
        request_id: Option<&str>,
    ) -> CoreResult<FragmentStream> {
        let sample = params.temperature > 0.0;
        let payload = TgiReq {
            inputs: prompt,
            parameters: TgiParams {
                max_new_tokens: params.max_tokens,
                temperature: sample.then_some(params.temperature),
                do_sample: sample,
                details: false,
            },
            stream: true,
        };
        let owned_headers = self.headers();
        let hdrs: Vec<(&str, &str)> = owned_headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let ctx = RequestCtx { request_id };
        let lines = self
            .http
            .post_sse_lines(&self.endpoint, &payload, &hdrs, &ctx)
            .await?;
        tracing::debug!(
            { KEY_PROVIDER } = self.name.as_str(),
            { KEY_REQUEST_ID } = request_id.unwrap_or("-"),
            max_new_tokens = params.max_tokens,
            "generation session opened"
        );
        Ok(TgiFragments {
            lines,
            provider: self.name.clone(),
            done: false,
        }
        .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::Method::POST;
    use httpmock::MockServer;
    use serde_json::json;

    fn params() -> GenerationParams {
        GenerationParams { max_tokens: 16, temperature: 0.7 }
    }

    async fn drain(stream: FragmentStream) -> Vec<CoreResult<Fragment>> {
        stream.collect().await
    }

    #[test]
    fn parse_line_matrix() {
        assert_eq!(
            parse_line(r#"data:{"token":{"id":1,"text":" Hi","logprob":-0.1,"special":false},"generated_text":null}"#),
            Some(Parsed::Fragment(" Hi".into()))
        );
        assert_eq!(parse_line(r#"data: "raw json string""#), Some(Parsed::Fragment("raw json string".into())));
        assert_eq!(parse_line("data: plain chunk"), Some(Parsed::Fragment("plain chunk".into())));
        assert_eq!(parse_line("data:  two spaces"), Some(Parsed::Fragment(" two spaces".into())));
        assert_eq!(parse_line("data: [DONE]"), Some(Parsed::End));
        assert_eq!(
            parse_line(r#"data:{"error":"overloaded","error_type":"generation"}"#),
            Some(Parsed::Failed { code: "generation".into(), message: "overloaded".into() })
        );
        assert_eq!(parse_line(r#"data:{"unexpected":true}"#), None);
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line(": keep-alive"), None);
        assert_eq!(parse_line("event: token"), None);
    }

    #[tokio::test]
    async fn streams_token_text_unmodified() {
        let server = MockServer::start_async().await;
        let m = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/generate_stream")
                    .header("authorization", "Bearer test-token")
                    .header("x-request-id", "rid-42")
                    .json_body(json!({
                        "inputs": "### Human: hi\n### Assistant:",
                        "parameters": {"max_new_tokens": 16, "temperature": 0.7, "do_sample": true, "details": false},
                        "stream": true
                    }));
                then.status(200)
                    .header("content-type", "text/event-stream")
                    .body(concat!(
                        "data:{\"token\":{\"id\":1,\"text\":\"Hel\",\"special\":false}}\n\n",
                        "data:{\"token\":{\"id\":2,\"text\":\"lo\",\"special\":false}}\n\n",
                        "data:{\"token\":{\"id\":0,\"text\":\"<|endoftext|>\",\"special\":true},\"generated_text\":\"Hello\"}\n\n",
                    ));
            })
            .await;

        let src = Tgi::new_for_tests(&format!("{}/generate_stream", server.base_url()));
        let stream = src.open("### Human: hi\n### Assistant:", params(), Some("rid-42")).await.unwrap();
        let frags: Vec<String> = drain(stream).await.into_iter().map(|f| f.unwrap()).collect();
        assert_eq!(frags, vec!["Hel", "lo", "<|endoftext|>"]);
        m.assert_async().await;
    }

    #[tokio::test]
    async fn zero_temperature_means_greedy() {
        let server = MockServer::start_async().await;
        let m = server
            .mock_async(|when, then| {
                when.method(POST).path("/g").json_body(json!({
                    "inputs": "p",
                    "parameters": {"max_new_tokens": 4, "do_sample": false, "details": false},
                    "stream": true
                }));
                then.status(200).body("data: x\n\n");
            })
            .await;
        let src = Tgi::new_for_tests(&format!("{}/g", server.base_url()));
        let stream = src
            .open("p", GenerationParams { max_tokens: 4, temperature: 0.0 }, None)
            .await
            .unwrap();
        assert_eq!(drain(stream).await.len(), 1);
        m.assert_async().await;
    }

    #[tokio::test]
    async fn midstream_error_frame_ends_sequence() {
        let server = MockServer::start_async().await;
        let _m = server
            .mock_async(|when, then| {
                when.method(POST).path("/generate_stream");
                then.status(200).body(concat!(
                    "data:{\"token\":{\"id\":1,\"text\":\"ok\"}}\n\n",
                    "data:{\"error\":\"CUDA out of memory\",\"error_type\":\"generation\"}\n\n",
                    "data:{\"token\":{\"id\":2,\"text\":\"never\"}}\n\n",
                ));
            })
            .await;
        let src = Tgi::new_for_tests(&format!("{}/generate_stream", server.base_url()));
        let items = drain(src.open("p", params(), None).await.unwrap()).await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "ok");
        match &items[1] {
            Err(ChatError::ProviderError { provider, code, message }) => {
                assert_eq!(provider, "tgi");
                assert_eq!(code, "generation");
                assert_eq!(message, "CUDA out of memory");
            }
            other => panic!("expected ProviderError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn done_marker_stops_reading() {
        let server = MockServer::start_async().await;
        let _m = server
            .mock_async(|when, then| {
                when.method(POST).path("/generate_stream");
                then.status(200).body("data: a\n\ndata: [DONE]\n\ndata: b\n\n");
            })
            .await;
        let src = Tgi::new_for_tests(&format!("{}/generate_stream", server.base_url()));
        let frags: Vec<String> = drain(src.open("p", params(), None).await.unwrap())
            .await
            .into_iter()
            .map(|f| f.unwrap())
            .collect();
        assert_eq!(frags, vec!["a"]);
    }

    #[tokio::test]
    async fn http_failure_surfaces_from_open() {
        let server = MockServer::start_async().await;
        let _m = server
            .mock_async(|when, then| {
                when.method(POST).path("/generate_stream");
                then.status(401).body("bad token");
            })
            .await;
        let src = Tgi::new_for_tests(&format!("{}/generate_stream", server.base_url()));
        let err = src.open("p", params(), None).await.err().expect("must fail");
        match err {
            ChatError::ProviderError { code, .. } => assert_eq!(code, "401"),
            other => panic!("expected ProviderError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn no_token_sends_no_authorization() {
        let server = MockServer::start_async().await;
        let m = server
            .mock_async(|when, then| {
                when.method(POST).path("/generate_stream").matches(|req| {
                    req.headers
                        .as_ref()
                        .is_none_or(|h| h.iter().all(|(k, _)| !k.eq_ignore_ascii_case("authorization")))
                });
                then.status(200).body("data: x\n\n");
            })
            .await;
        let src = Tgi::new(
            HttpClient::new_default().unwrap(),
            format!("{}/generate_stream", server.base_url()),
            None,
        );
        let _ = drain(src.open("p", params(), None).await.unwrap()).await;
        m.assert_async().await;
    }
}
