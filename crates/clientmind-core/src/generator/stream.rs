//! Server-sent-event decoding for model responses.
//!
//! The Agent Builder emits named events (`message_chunk`, `message_complete`, legacy
//! `message`); OpenRouter emits untyped OpenAI-style deltas. All of them reduce to
//! [`StreamEvent`]: deltas append, the other two replace the accumulated text.

use super::model::{ByteStream, ModelError};
use futures_util::StreamExt;
use serde_json::Value;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Delta(String),
    Complete(String),
    LegacyMessage(String),
}

/// One `data:` line with the event name in effect for it.
#[derive(Debug, Clone, PartialEq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub payload: Value,
}

fn non_empty(v: Option<&Value>) -> Option<String> {
    v.and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

pub fn decode_event(event: Option<&str>, payload: &Value) -> Option<StreamEvent> {
    let legacy = || non_empty(payload.pointer("/data/round/response/message"));
    match event {
        Some("message_chunk") => non_empty(payload.pointer("/data/text_chunk")).map(StreamEvent::Delta),
        Some("message_complete") => {
            non_empty(payload.pointer("/data/message_content")).map(StreamEvent::Complete)
        }
        Some("message") => legacy().map(StreamEvent::LegacyMessage),
        None => legacy()
            .map(StreamEvent::LegacyMessage)
            .or_else(|| non_empty(payload.pointer("/choices/0/delta/content")).map(StreamEvent::Delta)),
        Some(_) => None,
    }
}

/// Line-oriented SSE parser that tolerates frames split across network chunks.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    current_event: Option<String>,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(frame) = self.line(&String::from_utf8_lossy(&line)) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flush a trailing line that arrived without a newline.
    pub fn finish(&mut self) -> Option<SseFrame> {
        let rest = std::mem::take(&mut self.buffer);
        self.line(&String::from_utf8_lossy(&rest))
    }

    fn line(&mut self, raw: &str) -> Option<SseFrame> {
        let line = raw.trim();
        if let Some(name) = line.strip_prefix("event:") {
            self.current_event = Some(name.trim().to_string());
            return None;
        }
        let data = line.strip_prefix("data:")?.trim();
        // The event name applies to the next data line only.
        let event = self.current_event.take();
        if data == "[DONE]" {
            return None;
        }
        match serde_json::from_str::<Value>(data) {
            Ok(payload) => {
                let event = event.or_else(|| payload.get("event").and_then(Value::as_str).map(str::to_string));
                Some(SseFrame { event, payload })
            }
            Err(e) => {
                warn!("unparseable SSE data line: {}", e);
                None
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct StreamAccumulator {
    text: String,
    events: Vec<String>,
}

impl StreamAccumulator {
    pub fn apply(&mut self, frame: &SseFrame) {
        if let Some(name) = &frame.event {
            self.events.push(name.clone());
        }
        match decode_event(frame.event.as_deref(), &frame.payload) {
            Some(StreamEvent::Delta(t)) => self.text.push_str(&t),
            Some(StreamEvent::Complete(t)) | Some(StreamEvent::LegacyMessage(t)) => self.text = t,
            None => {}
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Event names seen, in arrival order.
    pub fn events(&self) -> &[String] {
        &self.events
    }

    pub fn into_parts(self) -> (String, Vec<String>) {
        (self.text, self.events)
    }
}

/// Drain a model byte stream into accumulated text.
pub async fn collect_stream(mut stream: ByteStream, debug_logs: bool) -> Result<StreamAccumulator, ModelError> {
    let mut decoder = SseDecoder::default();
    let mut acc = StreamAccumulator::default();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if debug_logs {
            debug!("raw chunk: {} bytes", chunk.len());
        }
        for frame in decoder.push(&chunk) {
            if debug_logs {
                debug!("sse event {:?}", frame.event);
            }
            acc.apply(&frame);
        }
    }
    if let Some(frame) = decoder.finish() {
        acc.apply(&frame);
    }
    Ok(acc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_each_shape() {
        assert_eq!(
            decode_event(Some("message_chunk"), &json!({"data": {"text_chunk": "Hel"}})),
            Some(StreamEvent::Delta("Hel".into()))
        );
        assert_eq!(
            decode_event(Some("message_complete"), &json!({"data": {"message_content": "Hello"}})),
            Some(StreamEvent::Complete("Hello".into()))
        );
        let legacy = json!({"data": {"round": {"response": {"message": "Hi"}}}});
        assert_eq!(
            decode_event(Some("message"), &legacy),
            Some(StreamEvent::LegacyMessage("Hi".into()))
        );
        assert_eq!(decode_event(None, &legacy), Some(StreamEvent::LegacyMessage("Hi".into())));
        assert_eq!(
            decode_event(None, &json!({"choices": [{"delta": {"content": "x"}}]})),
            Some(StreamEvent::Delta("x".into()))
        );
        assert_eq!(decode_event(Some("reasoning"), &legacy), None);
    }

    #[test]
    fn complete_replaces_deltas() {
        let mut decoder = SseDecoder::default();
        let mut acc = StreamAccumulator::default();
        let body = concat!(
            "event: message_chunk\n",
            "data: {\"data\":{\"text_chunk\":\"par\"}}\n\n",
            "event: message_chunk\n",
            "data: {\"data\":{\"text_chunk\":\"tial\"}}\n\n",
        );
        for f in decoder.push(body.as_bytes()) {
            acc.apply(&f);
        }
        assert_eq!(acc.text(), "partial");

        for f in decoder.push(b"data: {\"event\":\"message_complete\",\"data\":{\"message_content\":\"final\"}}\n") {
            acc.apply(&f);
        }
        assert_eq!(acc.text(), "final");
        assert_eq!(acc.events(), ["message_chunk", "message_chunk", "message_complete"]);
    }

    #[test]
    fn event_name_applies_to_one_data_line() {
        let mut decoder = SseDecoder::default();
        let frames = decoder.push(b"event: round_complete\ndata: {}\ndata: {}\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].event.as_deref(), Some("round_complete"));
        assert_eq!(frames[1].event, None);
    }

    #[test]
    fn done_marker_and_garbage_are_ignored() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: [DONE]\ndata: {not json\n: comment\n").is_empty());
    }

    #[test]
    fn trailing_line_without_newline_is_flushed() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: {\"choices\":[{\"delta\":{\"content\":\"z\"}}]}").is_empty());
        let frame = decoder.finish().unwrap();
        assert_eq!(
            decode_event(frame.event.as_deref(), &frame.payload),
            Some(StreamEvent::Delta("z".into()))
        );
    }
}
