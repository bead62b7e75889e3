//! Server-sent event decoding for `streamGenerateContent?alt=sse`.

use super::wire::GenerateContentResponse;
use crate::error::ChatError;
use futures_core::Stream;
use std::collections::VecDeque;
use std::fmt::Display;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

const DATA_PREFIX: &str = "data: ";
const DONE: &str = "[DONE]";

/// What a single line of the event stream means to us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    /// A text fragment to hand to the caller.
    Delta(String),
    /// Nothing to emit; keep reading.
    Skip,
    /// Sentinel seen; stop reading.
    Done,
}

/// Classify one line (without its terminator).
pub fn decode_line(line: &str) -> Line {
    if line.trim().is_empty() || line.starts_with(':') {
        return Line::Skip;
    }

    // event:, id:, retry: carry nothing we use.
    let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
        return Line::Skip;
    };

    if payload == DONE {
        return Line::Done;
    }

    match serde_json::from_str::<GenerateContentResponse>(payload) {
        Ok(r) => match r.first_text() {
            Some(text) => Line::Delta(text.to_string()),
            None => Line::Skip,
        },
        Err(e) => {
            tracing::warn!(error = %e, "failed to parse SSE data; skipping line");
            Line::Skip
        }
    }
}

/// Splits arbitrary byte chunks into complete lines.
#[derive(Debug, Default)]
struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();

        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line = self.buf.drain(..=pos).collect::<Vec<u8>>();
            if let Some(s) = to_line(line) {
                out.push(s);
            }
        }

        out
    }

    /// Whatever is left once the body ends without a final newline.
    fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        to_line(std::mem::take(&mut self.buf))
    }
}

fn to_line(mut line: Vec<u8>) -> Option<String> {
    if line.ends_with(b"\n") {
        line.pop();
    }
    if line.ends_with(b"\r") {
        line.pop();
    }
    match String::from_utf8(line) {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::warn!(error = %e, "SSE line is not valid UTF-8; skipping line");
            None
        }
    }
}

/// Lazy stream of text deltas decoded from a response body.
///
/// Reads the body only when polled, ends at `[DONE]` or end of body, and
/// drops the body as soon as it ends. A body error ends the stream with a
/// transport error; malformed lines are skipped.
pub struct DeltaStream<S> {
    body: Option<S>,
    lines: LineBuffer,
    ready: VecDeque<String>,
}

impl<S> DeltaStream<S> {
    pub fn new(body: S) -> Self {
        Self {
            body: Some(body),
            lines: LineBuffer::default(),
            ready: VecDeque::new(),
        }
    }

    /// Decode lines in order until the sentinel; returns false once seen.
    fn feed(&mut self, lines: impl IntoIterator<Item = String>) -> bool {
        for line in lines {
            match decode_line(&line) {
                Line::Delta(text) => self.ready.push_back(text),
                Line::Skip => {}
                Line::Done => return false,
            }
        }
        true
    }
}

impl<S, B, E> Stream for DeltaStream<S>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
{
    type Item = Result<String, ChatError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if let Some(text) = this.ready.pop_front() {
                return Poll::Ready(Some(Ok(text)));
            }

            let Some(body) = this.body.as_mut() else {
                return Poll::Ready(None);
            };

            match ready!(Pin::new(body).poll_next(cx)) {
                Some(Ok(bytes)) => {
                    let lines = this.lines.push(bytes.as_ref());
                    if !this.feed(lines) {
                        tracing::debug!("SSE stream finished with [DONE]");
                        this.body = None;
                    }
                }
                Some(Err(e)) => {
                    this.body = None;
                    this.ready.clear();
                    return Poll::Ready(Some(Err(ChatError::transport(format!(
                        "network stream error: {e}"
                    )))));
                }
                None => {
                    this.body = None;
                    let tail = this.lines.finish();
                    this.feed(tail);
                }
            }
        }
    }
}
