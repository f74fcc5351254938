//! `text/event-stream` frame decoder.
//!
//! Splits the byte stream into lines, accumulates `data:` fields, and emits
//! one [`SseEvent`] per blank-line terminated block. Comment lines (`:`),
//! which the server uses as keep-alives, are skipped. A block containing a
//! line that is not valid UTF-8 is dropped whole.

use bytes::BytesMut;
use tokio_util::codec::Decoder;
use tracing::debug;

/// Maximum length of a single line before the stream is considered broken.
const MAX_LINE_LEN: usize = 1_048_576;

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// `event:` field. `None` means the default `message` type.
    pub event: Option<String>,
    /// `data:` lines joined with `\n`.
    pub data: String,
    pub id: Option<String>,
}

impl SseEvent {
    /// Whether this event is delivered to plain message listeners.
    pub fn is_message(&self) -> bool {
        matches!(self.event.as_deref(), None | Some("message"))
    }
}

#[derive(Debug, Default)]
pub struct SseCodec {
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
    /// Set when the current block held a non UTF-8 line.
    malformed: bool,
    /// Bytes of `src` already scanned for a newline.
    scanned: usize,
}

impl SseCodec {
    pub fn new() -> Self {
        Self::default()
    }

    fn take_event(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if std::mem::take(&mut self.malformed) {
            self.data.clear();
            return None;
        }
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent {
            event,
            data,
            id: self.id.clone(),
        })
    }

    fn process_line(&mut self, line: &str) {
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => self.data.push(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            // `retry` and unknown fields carry nothing the subscriber uses.
            _ => {}
        }
    }
}

impl Decoder for SseCodec {
    type Item = SseEvent;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(offset) = src[self.scanned..].iter().position(|b| *b == b'\n') else {
                self.scanned = src.len();
                if src.len() > MAX_LINE_LEN {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "event-stream line exceeds maximum length",
                    ));
                }
                return Ok(None);
            };

            let line = src.split_to(self.scanned + offset + 1);
            self.scanned = 0;

            let mut line = &line[..line.len() - 1];
            if let Some(stripped) = line.strip_suffix(b"\r") {
                line = stripped;
            }

            if line.is_empty() {
                if let Some(event) = self.take_event() {
                    return Ok(Some(event));
                }
                continue;
            }

            match std::str::from_utf8(line) {
                Ok(line) => self.process_line(line),
                Err(e) => {
                    debug!(error = %e, "dropping event-stream block with invalid UTF-8");
                    self.malformed = true;
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(event) => Ok(Some(event)),
            None => {
                // An unterminated trailing block is discarded.
                src.clear();
                self.scanned = 0;
                self.data.clear();
                self.event = None;
                self.malformed = false;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &str) -> Vec<SseEvent> {
        let mut codec = SseCodec::new();
        let mut buf = BytesMut::from(input);
        let mut out = Vec::new();
        while let Some(ev) = codec.decode(&mut buf).unwrap() {
            out.push(ev);
        }
        out
    }

    #[test]
    fn test_single_data_frame() {
        let events = decode_all("data: {\"type\":\"connected\"}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"type\":\"connected\"}");
        assert!(events[0].is_message());
    }

    #[test]
    fn test_multiline_data_and_crlf() {
        let events = decode_all("data: a\r\ndata:b\r\n\r\nevent: ping\ndata: c\nid: 7\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "a\nb");
        assert_eq!(events[1].event.as_deref(), Some("ping"));
        assert_eq!(events[1].id.as_deref(), Some("7"));
        assert!(!events[1].is_message());
    }

    #[test]
    fn test_comments_and_empty_blocks_skipped() {
        let events = decode_all(":\n\n: keep-alive\n\nretry: 1000\n\ndata: x\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn test_split_across_chunks() {
        let mut codec = SseCodec::new();
        let mut buf = BytesMut::from("data: hel");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"lo\n");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"\n");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().data, "hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_unterminated_block_dropped_at_eof() {
        let mut codec = SseCodec::new();
        let mut buf = BytesMut::from("data: complete\n\ndata: partial\n");
        assert_eq!(codec.decode_eof(&mut buf).unwrap().unwrap().data, "complete");
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_oversized_line_is_error() {
        let mut codec = SseCodec::new();
        let mut buf = BytesMut::from(vec![b'x'; MAX_LINE_LEN + 1].as_slice());
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_block_with_invalid_utf8_is_dropped() {
        let mut codec = SseCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"data: {\"type\":\"threat_level_change\",\"anomalyId\":\"1\",\n");
        buf.extend_from_slice(b"data: \"newThreatLevel\":\"crit\xffcal\"}\n\n");
        buf.extend_from_slice(b"data: {\"type\":\"info\",\"message\":\"ok\"}\n\n");

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.data, r#"{"type":"info","message":"ok"}"#);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }
}
