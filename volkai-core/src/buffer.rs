//! Stop-sequence aware buffering over an incrementally arriving fragment stream.
//!
//! `StopBuffer` is the synchronous state machine; `pipeline::StopAwareStream`
//! drives it from an async fragment source.
//!
//! Invariants:
//! - The concatenation of all emitted segments never contains a stop sequence.
//! - `pending` is always the longest suffix of the text seen so far that is a
//!   proper prefix of some stop sequence, so it is shorter than the longest
//!   stop sequence.
//! - Once `Done`, nothing else is emitted.

use crate::error::{ChatError, CoreResult};

/// End-of-generation marker emitted by most text-generation backends.
pub const DEFAULT_STOP_SEQUENCE: &str = "<|endoftext|>";

/// Why a stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Source ran out of fragments.
    Completed,
    /// A stop sequence showed up inside the fragment stream.
    StopDetected,
    /// Source failed (transport, protocol or timeout).
    Error,
}

impl Termination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::StopDetected => "stop_detected",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Streaming,
    Done(Termination),
}

/// Output of feeding the buffer one input (fragment, end or failure).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Step {
    /// Text that is now safe to hand to the client. Never empty when `Some`.
    pub segment: Option<String>,
    /// Set exactly once, on the step that ends the stream.
    pub terminal: Option<Termination>,
}

impl Step {
    fn new(segment: String, terminal: Option<Termination>) -> Self {
        Self {
            segment: (!segment.is_empty()).then_some(segment),
            terminal,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StopBuffer {
    stops: Vec<String>,
    longest: usize,
    pending: String,
    state: BufferState,
}

impl StopBuffer {
    /// Build a buffer watching for any of `stops`. At least one non-empty stop
    /// sequence is required.
    pub fn new<I, S>(stops: I) -> CoreResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let stops: Vec<String> = stops.into_iter().map(Into::into).collect();
        if stops.is_empty() {
            return Err(ChatError::Validation(
                "at least one stop sequence is required".into(),
            ));
        }
        if stops.iter().any(|s| s.is_empty()) {
            return Err(ChatError::Validation(
                "stop sequences must not be empty strings".into(),
            ));
        }
        let longest = stops.iter().map(String::len).max().unwrap_or(0);
        Ok(Self {
            stops,
            longest,
            pending: String::new(),
            state: BufferState::Streaming,
        })
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    pub fn pending(&self) -> &str {
        &self.pending
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, BufferState::Done(_))
    }

    /// Feed one fragment.
    pub fn push(&mut self, fragment: &str) -> Step {
        if self.is_done() {
            return Step::default();
        }
        let mut candidate = std::mem::take(&mut self.pending);
        candidate.push_str(fragment);

        if let Some(at) = self.earliest_match(&candidate) {
            candidate.truncate(at);
            self.state = BufferState::Done(Termination::StopDetected);
            return Step::new(candidate, Some(Termination::StopDetected));
        }

        let held = self.held_from(&candidate);
        self.pending = candidate.split_off(held);
        Step::new(candidate, None)
    }

    /// Source reached its end: whatever is pending never completed a stop
    /// sequence and is released.
    pub fn finish(&mut self) -> Step {
        if self.is_done() {
            return Step::default();
        }
        self.state = BufferState::Done(Termination::Completed);
        Step::new(std::mem::take(&mut self.pending), Some(Termination::Completed))
    }

    /// Source failed: pending text is dropped, not emitted.
    pub fn fail(&mut self) -> Step {
        if self.is_done() {
            return Step::default();
        }
        self.pending.clear();
        self.state = BufferState::Done(Termination::Error);
        Step::new(String::new(), Some(Termination::Error))
    }

    fn earliest_match(&self, text: &str) -> Option<usize> {
        self.stops.iter().filter_map(|s| text.find(s.as_str())).min()
    }

    /// Byte offset where the longest suffix of `text` that is a proper prefix
    /// of a stop sequence begins (`text.len()` when there is none).
    fn held_from(&self, text: &str) -> usize {
        let mut start = text.len().saturating_sub(self.longest - 1);
        while !text.is_char_boundary(start) {
            start += 1;
        }
        text[start..]
            .char_indices()
            .map(|(i, _)| start + i)
            .find(|&at| {
                let tail = &text[at..];
                self.stops.iter().any(|s| s.len() > tail.len() && s.starts_with(tail))
            })
            .unwrap_or(text.len())
    }
}
