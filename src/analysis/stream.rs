//! Server-sent event reassembly for the analysis workflow stream.
//!
//! The workflow service answers with `data: {json}` blocks separated by blank
//! lines, and the transport chunks that text at arbitrary byte offsets. An
//! event (or a single UTF-8 code point) may therefore span several chunks.
//! [`SseDecoder`] buffers raw bytes until a full block is available;
//! [`EventStream`] adapts it into a pull-based [`Stream`] over a byte stream.

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// Line marker carrying event payloads.
const DATA_MARKER: &str = "data:";

/// Payload signalling logical end of stream.
const DONE_SENTINEL: &str = "[DONE]";

/// Typed event decoded from the workflow stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Incremental text (`text_chunk`, `data.text`).
    TextChunk { text: String },
    /// Final workflow outputs (`workflow_finished`, `data.outputs`).
    WorkflowFinished { outputs: Map<String, Value> },
    /// Chat-style answer fragment (`message`, `answer`).
    Message { answer: String },
    /// Any other event type. Carries the declared type for logging.
    Unrecognized { event: String },
}

/// Reassembler state, derived from the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    Idle,
    Accumulating,
    Closed,
}

/// Push-based decoder: feed chunks, collect complete events.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    /// Buffer prefix already searched for a separator.
    scanned: usize,
    closed: bool,
    malformed: usize,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> DecoderState {
        if self.closed {
            DecoderState::Closed
        } else if self.buffer.is_empty() {
            DecoderState::Idle
        } else {
            DecoderState::Accumulating
        }
    }

    /// Number of event blocks skipped because their payload failed to decode.
    pub fn malformed_count(&self) -> usize {
        self.malformed
    }

    /// Append a chunk and return every event completed by it, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        if self.closed {
            return Vec::new();
        }
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some((end, sep_len)) = find_separator(&self.buffer, self.scanned) {
            let block: Vec<u8> = self.buffer.drain(..end + sep_len).collect();
            self.scanned = 0;
            let text = String::from_utf8_lossy(&block[..end]);
            if let Some(event) = self.decode_block(&text) {
                events.push(event);
            }
        }
        self.scanned = self.buffer.len();
        events
    }

    /// Close the decoder, discarding any unterminated data.
    pub fn finish(&mut self) {
        if !self.buffer.is_empty() {
            debug!(
                bytes = self.buffer.len(),
                "Discarding unterminated event data at end of stream"
            );
        }
        self.buffer.clear();
        self.scanned = 0;
        self.closed = true;
    }

    fn decode_block(&mut self, block: &str) -> Option<StreamEvent> {
        let payload = extract_data(block)?;
        if payload.trim() == DONE_SENTINEL {
            return None;
        }
        match serde_json::from_str::<Value>(&payload) {
            Ok(record) => match classify(record) {
                Some(event) => Some(event),
                None => {
                    self.malformed += 1;
                    warn!("Skipping workflow event with missing fields");
                    None
                }
            },
            Err(e) => {
                self.malformed += 1;
                warn!(error = %e, "Skipping malformed workflow event");
                None
            }
        }
    }
}

/// Longest separator, minus one: a separator can straddle the scanned prefix
/// by at most this many bytes.
const SEPARATOR_OVERLAP: usize = 3;

/// Earliest blank-line separator ending after `scanned`:
/// `(block_end, separator_len)`.
fn find_separator(buf: &[u8], scanned: usize) -> Option<(usize, usize)> {
    let from = scanned.saturating_sub(SEPARATOR_OVERLAP).min(buf.len());
    let window = &buf[from..];
    let lf = find_subslice(window, b"\n\n").map(|i| (from + i, 2));
    let crlf = find_subslice(window, b"\r\n\r\n").map(|i| (from + i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Join the payloads of all `data:` lines in a block.
fn extract_data(block: &str) -> Option<String> {
    let mut lines = block
        .lines()
        .filter_map(|line| line.strip_prefix(DATA_MARKER))
        .map(|rest| rest.strip_prefix(' ').unwrap_or(rest));
    let first = lines.next()?;
    let mut payload = first.to_string();
    for line in lines {
        payload.push('\n');
        payload.push_str(line);
    }
    Some(payload)
}

/// Map a decoded record onto a [`StreamEvent`]. `None` when a known event
/// type lacks its required field.
fn classify(record: Value) -> Option<StreamEvent> {
    let event_type = record
        .get("event")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    match event_type.as_str() {
        "text_chunk" => record["data"]["text"]
            .as_str()
            .map(|text| StreamEvent::TextChunk {
                text: text.to_string(),
            }),
        "workflow_finished" => match &record["data"]["outputs"] {
            Value::Object(outputs) => Some(StreamEvent::WorkflowFinished {
                outputs: outputs.clone(),
            }),
            Value::Null => Some(StreamEvent::WorkflowFinished {
                outputs: Map::new(),
            }),
            _ => None,
        },
        "message" => record["answer"]
            .as_str()
            .map(|answer| StreamEvent::Message {
                answer: answer.to_string(),
            }),
        _ => Some(StreamEvent::Unrecognized { event: event_type }),
    }
}

/// Pull-based event stream over a chunked byte stream.
///
/// Yields events in arrival order. A transport error is yielded once and
/// closes the stream; buffered partial data is dropped.
pub struct EventStream<S> {
    inner: S,
    decoder: SseDecoder,
    pending: VecDeque<StreamEvent>,
    done: bool,
}

impl<S> EventStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            decoder: SseDecoder::new(),
            pending: VecDeque::new(),
            done: false,
        }
    }

    pub fn state(&self) -> DecoderState {
        self.decoder.state()
    }

    pub fn malformed_count(&self) -> usize {
        self.decoder.malformed_count()
    }
}

impl<S, B, E> Stream for EventStream<S>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
{
    type Item = Result<StreamEvent, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(event) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(event)));
            }
            if this.done {
                return Poll::Ready(None);
            }
            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(chunk))) => {
                    this.pending.extend(this.decoder.push(chunk.as_ref()));
                }
                Poll::Ready(Some(Err(e))) => {
                    this.done = true;
                    this.decoder.finish();
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    this.done = true;
                    this.decoder.finish();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{stream, StreamExt};
    use serde_json::json;

    const HELLO: &str = "data: {\"event\":\"text_chunk\",\"data\":{\"text\":\"hello\"}}\n\n";

    fn sample_stream() -> String {
        [
            "data: {\"event\":\"workflow_started\",\"data\":{}}\n\n",
            "data: {\"event\":\"text_chunk\",\"data\":{\"text\":\"Revenue grew \"}}\n\n",
            "data: {\"event\":\"text_chunk\",\"data\":{\"text\":\"12% — strongest in Q3.\"}}\n\n",
            "data: {\"event\":\"message\",\"answer\":\" Done.\"}\n\n",
            "data: {\"event\":\"workflow_finished\",\"data\":{\"outputs\":{\"text\":\"x\"}}}\n\n",
            "data: [DONE]\n\n",
        ]
        .concat()
    }

    fn decode_all(chunks: &[&[u8]]) -> Vec<StreamEvent> {
        let mut decoder = SseDecoder::new();
        let mut events = Vec::new();
        for chunk in chunks {
            events.extend(decoder.push(chunk));
        }
        decoder.finish();
        events
    }

    #[test]
    fn test_single_event() {
        let events = decode_all(&[HELLO.as_bytes()]);
        assert_eq!(
            events,
            vec![StreamEvent::TextChunk {
                text: "hello".into()
            }]
        );
    }

    #[test]
    fn test_split_mid_payload() {
        let split = HELLO.find("t\":\"hello").unwrap();
        let (a, b) = HELLO.as_bytes().split_at(split);
        assert!(a.ends_with(b"\"tex"));
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(a).is_empty());
        assert_eq!(decoder.state(), DecoderState::Accumulating);
        assert_eq!(
            decoder.push(b),
            vec![StreamEvent::TextChunk {
                text: "hello".into()
            }]
        );
        assert_eq!(decoder.state(), DecoderState::Idle);
    }

    #[test]
    fn test_every_split_offset_matches_unchunked() {
        let whole = sample_stream();
        let expected = decode_all(&[whole.as_bytes()]);
        assert_eq!(expected.len(), 5);
        let bytes = whole.as_bytes();
        for offset in 0..=bytes.len() {
            let (a, b) = bytes.split_at(offset);
            assert_eq!(decode_all(&[a, b]), expected, "split at byte {offset}");
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let whole = sample_stream();
        let chunks: Vec<&[u8]> = whole.as_bytes().chunks(1).collect();
        assert_eq!(decode_all(&chunks), decode_all(&[whole.as_bytes()]));
    }

    #[test]
    fn test_malformed_event_skipped() {
        let input = format!("{HELLO}data: {{\"event\":\"text_chunk\",\"data\":{{\"te\n\n{HELLO}");
        let mut decoder = SseDecoder::new();
        let events = decoder.push(input.as_bytes());
        assert_eq!(events.len(), 2);
        assert_eq!(decoder.malformed_count(), 1);
    }

    #[test]
    fn test_missing_required_field_skipped() {
        let input = "data: {\"event\":\"text_chunk\",\"data\":{}}\n\n";
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(input.as_bytes()).is_empty());
        assert_eq!(decoder.malformed_count(), 1);
    }

    #[test]
    fn test_done_sentinel_and_comments_ignored() {
        let input = format!(": keep-alive\n\ndata: [DONE]\n\nevent: ping\n\n{HELLO}");
        let events = decode_all(&[input.as_bytes()]);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_unrecognized_event_type() {
        let input = "data: {\"event\":\"node_started\",\"data\":{}}\n\n";
        let events = decode_all(&[input.as_bytes()]);
        assert_eq!(
            events,
            vec![StreamEvent::Unrecognized {
                event: "node_started".into()
            }]
        );
    }

    #[test]
    fn test_workflow_finished_outputs() {
        let input = "data: {\"event\":\"workflow_finished\",\"data\":{\"outputs\":{\"x\":\"B\",\"n\":2}}}\n\n";
        let events = decode_all(&[input.as_bytes()]);
        match &events[0] {
            StreamEvent::WorkflowFinished { outputs } => {
                assert_eq!(outputs["x"], json!("B"));
                assert_eq!(outputs["n"], json!(2));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_crlf_separator_and_event_line() {
        let input = "event: message\r\ndata: {\"event\":\"message\",\"answer\":\"hi\"}\r\n\r\n";
        let events = decode_all(&[input.as_bytes()]);
        assert_eq!(
            events,
            vec![StreamEvent::Message {
                answer: "hi".into()
            }]
        );
    }

    #[test]
    fn test_multibyte_char_split_across_chunks() {
        let input = "data: {\"event\":\"text_chunk\",\"data\":{\"text\":\"café\"}}\n\n";
        let pos = input.find('é').unwrap() + 1; // inside the 2-byte sequence
        let (a, b) = input.as_bytes().split_at(pos);
        assert_eq!(
            decode_all(&[a, b]),
            vec![StreamEvent::TextChunk {
                text: "café".into()
            }]
        );
    }

    #[test]
    fn test_finish_discards_partial_block() {
        let mut decoder = SseDecoder::new();
        assert!(decoder
            .push(b"data: {\"event\":\"text_chunk\",\"data\":{\"text\":\"cut")
            .is_empty());
        decoder.finish();
        assert_eq!(decoder.state(), DecoderState::Closed);
        assert!(decoder.push(b"\"}}\n\n").is_empty());
    }

    #[test]
    fn test_find_separator_across_scanned_prefix() {
        let buf = b"data: x\r\n\r\nrest";
        // Separator starts before the scanned mark and completes after it.
        assert_eq!(find_separator(buf, 9), Some((7, 4)));
        assert_eq!(find_separator(b"data: x\n\n", 9), Some((7, 2)));
        assert_eq!(find_separator(b"data: x\n", 8), None);
        assert_eq!(find_separator(b"ab", 10), None);
    }

    #[test]
    fn test_large_event_in_small_chunks_scans_incrementally() {
        let text = "x".repeat(64 * 1024);
        let input = format!(
            "data: {{\"event\":\"text_chunk\",\"data\":{{\"text\":\"{text}\"}}}}\n\n"
        );
        let mut decoder = SseDecoder::new();
        let mut events = Vec::new();
        for chunk in input.as_bytes().chunks(16) {
            events.extend(decoder.push(chunk));
            assert_eq!(decoder.scanned, decoder.buffer.len());
        }
        assert_eq!(events, vec![StreamEvent::TextChunk { text }]);
        assert_eq!(decoder.state(), DecoderState::Idle);
    }

    #[tokio::test]
    async fn test_event_stream_over_chunks() {
        let whole = sample_stream();
        let chunks: Vec<Result<Vec<u8>, String>> = whole
            .as_bytes()
            .chunks(7)
            .map(|c| Ok(c.to_vec()))
            .collect();
        let events: Vec<_> = EventStream::new(stream::iter(chunks)).collect().await;
        assert_eq!(events.len(), 5);
        assert!(events.iter().all(Result::is_ok));
    }

    #[tokio::test]
    async fn test_event_stream_transport_error_terminates() {
        let split = HELLO.len() / 2;
        let chunks: Vec<Result<Vec<u8>, String>> = vec![
            Ok(HELLO.as_bytes().to_vec()),
            Ok(HELLO.as_bytes()[..split].to_vec()),
            Err("connection reset".to_string()),
            Ok(HELLO.as_bytes()[split..].to_vec()),
        ];
        let mut events = EventStream::new(stream::iter(chunks));
        assert!(matches!(
            events.next().await,
            Some(Ok(StreamEvent::TextChunk { .. }))
        ));
        assert_eq!(events.next().await, Some(Err("connection reset".to_string())));
        assert_eq!(events.next().await, None);
        assert_eq!(events.state(), DecoderState::Closed);
    }
}
