//! Optional batching of emitted segments into fewer, larger writes.
//!
//! Runs strictly downstream of stop-sequence resolution: it only ever sees
//! text the buffer already released, so it cannot affect what is emitted,
//! only how it is grouped.

use std::future::Future;
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::stream::Stream;
use tokio::time::{Sleep, sleep};

use crate::stream::StreamEvent;

/// Merges consecutive `Segment`s into batches of at most `max_bytes`, or
/// whatever has gathered once the oldest buffered text has waited `max_wait`.
/// A segment that alone exceeds `max_bytes` goes out as its own batch. A
/// terminal event flushes the batch first and is then passed through unchanged.
pub struct Coalesced<S> {
    inner: S,
    max_bytes: usize,
    max_wait: Duration,
    buf: String,
    timer: Option<Pin<Box<Sleep>>>,
    ready: VecDeque<StreamEvent>,
    done: bool,
}

impl<S> Coalesced<S>
where
    S: Stream<Item = StreamEvent> + Unpin,
{
    pub fn new(inner: S, max_bytes: usize, max_wait: Duration) -> Self {
        Self {
            inner,
            max_bytes: max_bytes.max(1),
            max_wait,
            buf: String::new(),
            timer: None,
            ready: VecDeque::with_capacity(2),
            done: false,
        }
    }

    fn flush(&mut self) -> StreamEvent {
        self.timer = None;
        StreamEvent::Segment(std::mem::take(&mut self.buf))
    }

    fn add(&mut self, text: &str) {
        if !self.buf.is_empty() && self.buf.len() + text.len() > self.max_bytes {
            let batch = self.flush();
            self.ready.push_back(batch);
        }
        self.buf.push_str(text);
        if self.buf.len() >= self.max_bytes {
            let batch = self.flush();
            self.ready.push_back(batch);
        } else if self.timer.is_none() {
            self.timer = Some(Box::pin(sleep(self.max_wait)));
        }
    }
}

impl<S> Stream for Coalesced<S>
where
    S: Stream<Item = StreamEvent> + Unpin,
{
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(ev) = self.ready.pop_front() {
                return Poll::Ready(Some(ev));
            }
            if self.done {
                return Poll::Ready(None);
            }
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(StreamEvent::Segment(s))) => self.add(&s),
                Poll::Ready(Some(terminal)) => {
                    self.done = true;
                    if !self.buf.is_empty() {
                        let batch = self.flush();
                        self.ready.push_back(batch);
                    }
                    self.ready.push_back(terminal);
                }
                Poll::Ready(None) => {
                    self.done = true;
                    if !self.buf.is_empty() {
                        let batch = self.flush();
                        self.ready.push_back(batch);
                    }
                }
                Poll::Pending => {
                    if let Some(timer) = self.timer.as_mut()
                        && timer.as_mut().poll(cx).is_ready()
                    {
                        return Poll::Ready(Some(self.flush()));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}
