//! Server-sent-event plumbing shared by the streaming backends.
//!
//! [`LineBuffer`] reassembles lines from arbitrary byte chunks (network reads
//! split anywhere, including mid-codepoint).  [`SseLineParser`] pairs `event:`
//! lines with their `data:` payload; backends that use data-only SSE simply
//! get events with `event == None`.

use crate::error::{AgentError, Result};

/// One complete SSE event: the optional `event:` type plus the `data:` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Reassembles newline-terminated lines from a stream of byte chunks.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk of bytes.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete line, without its trailing newline.
    pub fn next_line(&mut self) -> Result<Option<String>> {
        let Some(pos) = self.buf.iter().position(|&b| b == b'\n') else {
            return Ok(None);
        };
        let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        let line = String::from_utf8(line).map_err(|e| AgentError::StreamFailed {
            reason: format!("invalid UTF-8 in stream: {e}"),
        })?;
        Ok(Some(line))
    }
}

/// Parses raw SSE lines into [`SseEvent`]s.
///
/// Accumulates partial state across calls because an event spans multiple
/// lines (`event:` followed by `data:`).
#[derive(Debug, Default)]
pub struct SseLineParser {
    /// The most recently seen `event:` type.
    pending_event: Option<String>,
}

impl SseLineParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a single line from the SSE stream.
    ///
    /// Returns `Some(event)` when a `data:` line completes an event, `None`
    /// for blank lines, comments, and the `event:` prefix line (which only
    /// stashes state for the next `data:` line).
    pub fn feed(&mut self, line: &str) -> Option<SseEvent> {
        let line = line.trim_end();

        // SSE comment lines start with `:`.
        if line.is_empty() || line.starts_with(':') {
            return None;
        }

        if let Some(event_type) = line.strip_prefix("event: ") {
            self.pending_event = Some(event_type.to_owned());
            return None;
        }

        if let Some(data) = line.strip_prefix("data: ") {
            return Some(SseEvent {
                event: self.pending_event.take(),
                data: data.to_owned(),
            });
        }

        tracing::trace!(line, "ignoring unrecognised SSE line");
        None
    }
}
