//! Per-stream telemetry.
//!
//! Every pipeline hands exactly one `StreamLog` to the installed sink when it
//! terminates or is dropped. Nothing is recorded until a sink is installed.

pub mod keys;
pub mod types;
#[cfg(test)]
pub mod test_span;

pub use keys::*;
pub use types::*;

use std::sync::Arc;

use once_cell::sync::OnceCell;

/// Receiver for finished-stream records.
///
/// Called from whichever task polled or dropped the stream, so it must be
/// cheap and must not panic.
pub trait TelemetrySink: Send + Sync + 'static {
    fn record_stream(&self, log: StreamLog);
}

static SINK: OnceCell<Arc<dyn TelemetrySink>> = OnceCell::new();

// Tests share the global sink; only threads that opted in emit.
#[cfg(test)]
thread_local! {
    static CAPTURE: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

/// Install the process-wide sink. Only the first call wins; later calls
/// return `false` and leave the existing sink in place.
pub fn set_telemetry_sink(sink: Arc<dyn TelemetrySink>) -> bool {
    SINK.set(sink).is_ok()
}

#[inline]
pub(crate) fn emit_stream(log: StreamLog) {
    #[cfg(test)]
    {
        if !CAPTURE.with(|c| c.get()) {
            return;
        }
    }
    if let Some(sink) = SINK.get() {
        sink.record_stream(log);
    }
}

/// Opt the current test thread in or out of emission.
#[cfg(test)]
pub fn test_set_capture_enabled(enabled: bool) {
    CAPTURE.with(|c| c.set(enabled));
}
