/// Span/Log attribute keys for streamed chat requests.
/// Keep these stable; changing them is a breaking change for dashboards.
pub const KEY_PROVIDER: &str = "llm.provider";
pub const KEY_REQUEST_ID: &str = "req.id";

pub const KEY_LATENCY_MS: &str = "latency.ms";
pub const KEY_TERMINATION: &str = "stream.termination";
pub const KEY_SEGMENTS: &str = "stream.segments";
pub const KEY_BYTES: &str = "stream.bytes";

/// Error-related (if applicable)
pub const KEY_ERROR_KIND: &str = "error.kind";
pub const KEY_ERROR_MESSAGE: &str = "error.message";
