//! Server-sent event decoding for streamed chat replies
//!
//! The chat endpoint answers with newline-delimited `data: <payload>` lines.
//! Chunks from the transport can split a line anywhere (including inside a
//! multi-byte character), so bytes are buffered until a full line is seen.

use std::fmt::Display;

use futures::{Stream, StreamExt};
use serde_json::Value;

/// Payload marking normal end of stream
pub const DONE_SENTINEL: &str = "[DONE]";

const DATA_PREFIX: &str = "data:";

/// Fields checked, in order, for the text delta of a JSON payload
const DELTA_FIELDS: [&str; 4] = ["content", "delta", "text", "token"];

/// A decoded stream event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Incremental reply text, applied in arrival order
    Delta(String),
    /// Normal termination (sentinel or transport end-of-stream)
    Done,
    /// Transport failure or server-reported error
    Failed(String),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Delta(_))
    }
}

/// Incremental line decoder.
///
/// Feed raw chunks with [`push`](Self::push) and call
/// [`finish`](Self::finish) when the transport ends. Once a terminal event
/// has been produced all further input is ignored.
#[derive(Debug, Default)]
pub struct EventDecoder {
    buffer: Vec<u8>,
    /// Prefix of `buffer` already known to hold no newline
    scanned: usize,
    finished: bool,
}

impl EventDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Decode every complete line now available
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }

        self.buffer.extend_from_slice(chunk);
        while let Some(offset) = self.buffer[self.scanned..].iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=self.scanned + offset).collect();
            self.scanned = 0;
            if let Some(event) = decode_line(&line) {
                if self.record(event, &mut events) {
                    break;
                }
            }
        }
        self.scanned = self.buffer.len();
        events
    }

    /// Flush the trailing partial line and close the stream
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }

        let rest = std::mem::take(&mut self.buffer);
        self.scanned = 0;
        if let Some(event) = decode_line(&rest) {
            if self.record(event, &mut events) {
                return events;
            }
        }
        self.record(StreamEvent::Done, &mut events);
        events
    }

    fn record(&mut self, event: StreamEvent, events: &mut Vec<StreamEvent>) -> bool {
        let terminal = event.is_terminal();
        events.push(event);
        if terminal {
            self.finished = true;
            self.buffer.clear();
        }
        terminal
    }
}

/// Decode a single line; `None` means the line carries nothing.
fn decode_line(raw: &[u8]) -> Option<StreamEvent> {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim_end_matches(['\n', '\r']);

    let payload = line.strip_prefix(DATA_PREFIX)?.trim();
    if payload.is_empty() {
        return None;
    }
    if payload == DONE_SENTINEL {
        return Some(StreamEvent::Done);
    }

    let value: Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(err) => {
            tracing::trace!(error = %err, "dropping malformed stream payload");
            return None;
        }
    };

    match value {
        Value::String(text) if !text.is_empty() => Some(StreamEvent::Delta(text)),
        Value::Object(map) => {
            match map.get("error") {
                None | Some(Value::Null) => {}
                Some(Value::String(error)) => return Some(StreamEvent::Failed(error.clone())),
                Some(other) => return Some(StreamEvent::Failed(other.to_string())),
            }
            DELTA_FIELDS
                .iter()
                .find_map(|field| map.get(*field).and_then(Value::as_str))
                .filter(|text| !text.is_empty())
                .map(|text| StreamEvent::Delta(text.to_string()))
        }
        _ => None,
    }
}

/// Turn a stream of raw chunks into a finite stream of events.
///
/// The output always ends with exactly one terminal event: `Done` for the
/// sentinel or a clean transport close, `Failed` for a read error.
pub fn decode<S, B, E>(chunks: S) -> impl Stream<Item = StreamEvent>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
{
    async_stream::stream! {
        let mut decoder = EventDecoder::new();
        futures::pin_mut!(chunks);

        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(bytes) => {
                    for event in decoder.push(bytes.as_ref()) {
                        yield event;
                    }
                    if decoder.is_finished() {
                        return;
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "chat stream read failed");
                    yield StreamEvent::Failed(err.to_string());
                    return;
                }
            }
        }

        for event in decoder.finish() {
            yield event;
        }
    }
}
