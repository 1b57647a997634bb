//! Streaming primitives exposed by volkai.
//!
//! Contract:
//! - A pipeline emits 0..n `Segment` events followed by exactly one terminal
//!   event: `Completed`, `StopDetected`, or `Error`.
//! - After a terminal event, no further events are emitted.
//!
//! This module intentionally avoids deriving `Clone` / `PartialEq` because `Error` contains
//! `ChatError`, which is not (and should not be) `Clone` or `Eq`.

use crate::buffer::Termination;
use crate::error::{ChatError, CoreResult};

/// One unit of generated text as produced by the backend.
pub type Fragment = String;

/// Boxed stream of raw fragments. Fragment sources return this.
pub type FragmentStream = futures::stream::BoxStream<'static, CoreResult<Fragment>>;

/// What the delivery layer receives incrementally.
#[derive(Debug)]
pub enum StreamEvent {
    /// Text that is safe to forward to the client. Never empty.
    Segment(String),
    /// The source ended normally.
    Completed,
    /// A stop sequence was found in the fragment stream.
    StopDetected,
    /// Transport/parse error or timeout; the stream ends after this.
    Error(ChatError),
}

impl StreamEvent {
    /// Returns true if this event terminates the stream.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Segment(_))
    }

    /// Convenience accessor for `Segment` contents.
    pub fn as_segment(&self) -> Option<&str> {
        match self {
            Self::Segment(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn termination(&self) -> Option<Termination> {
        match self {
            Self::Segment(_) => None,
            Self::Completed => Some(Termination::Completed),
            Self::StopDetected => Some(Termination::StopDetected),
            Self::Error(_) => Some(Termination::Error),
        }
    }
}

/// Boxed stream of pipeline events.
pub type BoxStreamEv = futures::stream::BoxStream<'static, StreamEvent>;
