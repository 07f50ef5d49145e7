//! Server-Sent Events decoder shared by the streaming adapters.
//!
//! Bytes arrive in arbitrary slices from `reqwest`; lines are only decoded
//! once complete so multi-byte UTF-8 sequences split across reads survive.
//! An event is dispatched at each blank line:
//!
//! ```text
//! event: content_block_delta
//! data: {"type":"content_block_delta", ...}
//!
//! data: {"choices":[...]}
//!
//! data: [DONE]
//! ```

use futures_util::StreamExt;
use tracing::debug;

use crate::error::{ProviderError, ProviderResult};

/// One dispatched SSE event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental SSE parser
#[derive(Debug, Default)]
pub struct SseDecoder {
    pending: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes; returns every event completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.pending.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(event) = self.take_line(line) {
                events.push(event);
            }
        }
        events
    }

    /// End of body. An event still lacking its blank line is incomplete and
    /// is discarded, never dispatched; returns whether anything was dropped.
    pub fn finish(&mut self) -> bool {
        let dropped = !self.pending.is_empty() || !self.data.is_empty();
        self.pending.clear();
        self.data.clear();
        self.event = None;
        dropped
    }

    fn take_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            // id / retry carry nothing we use
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() {
            self.event = None;
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent {
            event: self.event.take(),
            data,
        })
    }
}

/// Drive an HTTP response body through the decoder, handing each event to
/// `handle`. Returning `Ok(false)` from the handler stops reading early.
pub async fn for_each_event<F>(response: reqwest::Response, mut handle: F) -> ProviderResult<()>
where
    F: FnMut(SseEvent) -> ProviderResult<bool>,
{
    let mut decoder = SseDecoder::new();
    let mut body = response.bytes_stream();
    while let Some(bytes) = body.next().await {
        let bytes = bytes.map_err(|e| ProviderError::Transport(format!("stream read error: {}", e)))?;
        for event in decoder.push(&bytes) {
            if !handle(event)? {
                return Ok(());
            }
        }
    }
    if decoder.finish() {
        debug!("Discarded unterminated SSE event at end of body");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_data_event() {
        let mut d = SseDecoder::new();
        let events = d.push(b"data: {\"a\":1}\n\n");
        assert_eq!(
            events,
            vec![SseEvent {
                event: None,
                data: "{\"a\":1}".into()
            }]
        );
    }

    #[test]
    fn test_named_event() {
        let mut d = SseDecoder::new();
        let events = d.push(b"event: message_start\ndata: {}\n\n");
        assert_eq!(events[0].event.as_deref(), Some("message_start"));
        assert_eq!(events[0].data, "{}");
    }

    #[test]
    fn test_event_split_across_pushes() {
        let mut d = SseDecoder::new();
        assert!(d.push(b"data: hel").is_empty());
        assert!(d.push(b"lo\n").is_empty());
        let events = d.push(b"\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "hello");
    }

    #[test]
    fn test_utf8_split_across_pushes() {
        let text = "data: héllo\n\n".as_bytes();
        // split inside the two-byte 'é'
        let (a, b) = text.split_at(8);
        let mut d = SseDecoder::new();
        assert!(d.push(a).is_empty());
        let events = d.push(b);
        assert_eq!(events[0].data, "héllo");
    }

    #[test]
    fn test_crlf_lines() {
        let mut d = SseDecoder::new();
        let events = d.push(b"data: x\r\n\r\n");
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn test_comments_and_unknown_fields_ignored() {
        let mut d = SseDecoder::new();
        let events = d.push(b": keepalive\nid: 7\nretry: 100\ndata: y\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "y");
    }

    #[test]
    fn test_multiline_data_joined() {
        let mut d = SseDecoder::new();
        let events = d.push(b"data: one\ndata: two\n\n");
        assert_eq!(events[0].data, "one\ntwo");
    }

    #[test]
    fn test_blank_line_without_data_dispatches_nothing() {
        let mut d = SseDecoder::new();
        assert!(d.push(b"event: ping\n\n").is_empty());
    }

    #[test]
    fn test_finish_discards_partial_line() {
        let mut d = SseDecoder::new();
        assert_eq!(d.push(b"data: {\"a\":1}\n\ndata: {\"type\":\"content_blo").len(), 1);
        assert!(d.finish());
        assert!(!d.finish());
    }

    #[test]
    fn test_finish_discards_event_without_blank_line() {
        let mut d = SseDecoder::new();
        assert!(d.push(b"event: message_stop\ndata: {}\n").is_empty());
        assert!(d.finish());
        // a clean body leaves nothing behind
        let mut d = SseDecoder::new();
        assert_eq!(d.push(b"data: x\n\n").len(), 1);
        assert!(!d.finish());
    }

    #[test]
    fn test_multiple_events_in_one_push() {
        let mut d = SseDecoder::new();
        let events = d.push(b"data: a\n\ndata: b\n\ndata: c\n\n");
        let data: Vec<&str> = events.iter().map(|e| e.data.as_str()).collect();
        assert_eq!(data, vec!["a", "b", "c"]);
    }
}
