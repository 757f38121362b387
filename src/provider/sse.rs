//! Server-sent-event decoder for provider streams.
//!
//! Decodes an incremental byte stream into discrete JSON events: lines are
//! buffered across reads and split on `\n`; blank lines and `:` comments
//! are skipped; `data: <json>` payloads are parsed and yielded; the
//! `[DONE]` sentinel ends the sequence (a normal end, not an error); and
//! malformed data payloads are dropped rather than aborting the stream.
//!
//! Each decoder owns its byte buffer for one call and is finite: once the
//! sentinel or stream end is seen it stays terminated.

use std::collections::VecDeque;

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};

use crate::error::{AgentError, Result};

/// Hard cap on unconsumed buffered bytes. Guards against a provider that
/// never sends line terminators.
pub const MAX_BUFFERED_BYTES: usize = 1024 * 1024;

/// A decoded event.
#[derive(Debug, Clone, PartialEq)]
pub enum SseEvent {
    /// A parsed `data:` payload.
    Data(serde_json::Value),
    /// The `[DONE]` sentinel.
    Done,
}

/// Incremental SSE decoder.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    pending: VecDeque<SseEvent>,
    finished: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the done sentinel has been seen.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feed a chunk of bytes, decoding any complete lines.
    ///
    /// Fails with a distinct overflow error when more than
    /// [`MAX_BUFFERED_BYTES`] accumulate without a line break.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        while let Some(line_end) = self.buffer.find('\n') {
            let line = self.buffer[..line_end].trim().to_string();
            self.buffer.drain(..=line_end);
            self.process_line(&line);
            if self.finished {
                self.buffer.clear();
                return Ok(());
            }
        }

        if self.buffer.len() > MAX_BUFFERED_BYTES {
            return Err(AgentError::StreamOverflow {
                buffered: self.buffer.len(),
            });
        }
        Ok(())
    }

    /// Pop the next decoded event, if any.
    pub fn next_event(&mut self) -> Option<SseEvent> {
        self.pending.pop_front()
    }

    fn process_line(&mut self, line: &str) {
        if line.is_empty() || line.starts_with(':') {
            return;
        }
        let Some(data) = line.strip_prefix("data:") else {
            // Named `event:` lines carry no payload on their own; the
            // JSON body repeats the type field, so they are skipped here.
            return;
        };
        let data = data.trim_start();
        if data == "[DONE]" {
            self.finished = true;
            self.pending.push_back(SseEvent::Done);
            return;
        }
        match serde_json::from_str(data) {
            Ok(value) => self.pending.push_back(SseEvent::Data(value)),
            // Malformed vendor frames must not abort the whole stream.
            Err(_) => {}
        }
    }
}

/// Adapt a response byte stream into a stream of decoded JSON events.
///
/// Terminates on the `[DONE]` sentinel or underlying stream end; network
/// errors and buffer overflow are surfaced as stream items.
pub fn json_event_stream<S, B, E>(byte_stream: S) -> BoxStream<'static, Result<serde_json::Value>>
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: Into<AgentError> + Send,
{
    let stream = async_stream::stream! {
        let mut decoder = SseDecoder::new();
        futures::pin_mut!(byte_stream);

        while let Some(chunk_result) = byte_stream.next().await {
            let chunk = match chunk_result {
                Ok(c) => c,
                Err(e) => {
                    yield Err(e.into());
                    return;
                }
            };
            if let Err(e) = decoder.feed(chunk.as_ref()) {
                yield Err(e);
                return;
            }
            while let Some(event) = decoder.next_event() {
                match event {
                    SseEvent::Data(value) => yield Ok(value),
                    SseEvent::Done => return,
                }
            }
        }
    };

    Box::pin(stream)
}
