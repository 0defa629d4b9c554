//! Newline-delimited JSON framing for the event feed.
//!
//! The feed arrives as arbitrary byte chunks from a streaming HTTP body.
//! [`LineDecoder`] buffers partial lines across chunks and yields one decode
//! result per complete, non-blank line.

use bytes::{Buf, BytesMut};

use crate::{EventError, FeedEvent};

/// Longest accepted line, in bytes.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Incremental NDJSON decoder.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buf: BytesMut,
    /// Set while skipping the remainder of an oversized line.
    discarding: bool,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return the results for every line it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<FeedEvent, EventError>> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();

        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line = self.buf.split_to(pos);
            self.buf.advance(1);

            if self.discarding {
                self.discarding = false;
                continue;
            }

            if pos > MAX_LINE_LEN {
                out.push(Err(EventError::LineTooLong {
                    len: pos,
                    max: MAX_LINE_LEN,
                }));
                continue;
            }

            if let Some(result) = decode_line(&line) {
                out.push(result);
            }
        }

        if !self.discarding && self.buf.len() > MAX_LINE_LEN {
            out.push(Err(EventError::LineTooLong {
                len: self.buf.len(),
                max: MAX_LINE_LEN,
            }));
            self.discarding = true;
        }
        if self.discarding {
            self.buf.clear();
        }

        out
    }

    /// Flush a trailing line that was not newline-terminated.
    pub fn finish(&mut self) -> Option<Result<FeedEvent, EventError>> {
        let line = self.buf.split();
        if std::mem::take(&mut self.discarding) {
            return None;
        }
        decode_line(&line)
    }
}

fn decode_line(line: &[u8]) -> Option<Result<FeedEvent, EventError>> {
    let Ok(text) = std::str::from_utf8(line) else {
        return Some(Err(EventError::InvalidUtf8));
    };

    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    Some(FeedEvent::from_json(text))
}

/// Encode an event as one feed line, including the trailing newline.
pub fn encode_line(event: &FeedEvent) -> Result<String, EventError> {
    let mut line = serde_json::to_string(event)?;
    line.push('\n');
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OccupancyUpdate;
    use crpark_id::PoolId;

    fn update(ts: i64) -> FeedEvent {
        FeedEvent::OccupancyUpdate(OccupancyUpdate {
            pool_id: PoolId::parse("lot_001").unwrap(),
            occupied: 3,
            available: 7,
            ts,
        })
    }

    #[test]
    fn test_split_across_chunks() {
        let line = encode_line(&update(1)).unwrap();
        let (a, b) = line.as_bytes().split_at(10);

        let mut decoder = LineDecoder::new();
        assert!(decoder.push(a).is_empty());

        let results = decoder.push(b);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].as_ref().unwrap(), &update(1));
    }

    #[test]
    fn test_multiple_lines_and_blank_keepalives() {
        let mut payload = encode_line(&update(1)).unwrap();
        payload.push_str("\n\r\n");
        payload.push_str(&encode_line(&update(2)).unwrap());

        let mut decoder = LineDecoder::new();
        let results: Vec<_> = decoder
            .push(payload.as_bytes())
            .into_iter()
            .map(|r| r.unwrap().ts())
            .collect();
        assert_eq!(results, vec![1, 2]);
    }

    #[test]
    fn test_bad_line_does_not_poison_stream() {
        let mut payload = String::from("{not json}\n");
        payload.push_str(&encode_line(&update(3)).unwrap());

        let mut decoder = LineDecoder::new();
        let results = decoder.push(payload.as_bytes());
        assert_eq!(results.len(), 2);
        assert!(results[0].is_err());
        assert_eq!(results[1].as_ref().unwrap().ts(), 3);
    }

    #[test]
    fn test_oversized_line_is_discarded() {
        let mut decoder = LineDecoder::new();
        let junk = vec![b'x'; MAX_LINE_LEN + 1];

        let results = decoder.push(&junk);
        assert!(matches!(results[0], Err(EventError::LineTooLong { .. })));

        // Rest of the oversized line, then a good one.
        let mut tail = b"yyy\n".to_vec();
        tail.extend_from_slice(encode_line(&update(4)).unwrap().as_bytes());
        let results = decoder.push(&tail);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].as_ref().unwrap().ts(), 4);
    }

    #[test]
    fn test_oversized_complete_line_is_rejected() {
        let mut payload = vec![b' '; MAX_LINE_LEN + 1];
        payload.extend_from_slice(encode_line(&update(6)).unwrap().as_bytes());
        payload.extend_from_slice(encode_line(&update(7)).unwrap().as_bytes());

        let mut decoder = LineDecoder::new();
        let results = decoder.push(&payload);
        assert_eq!(results.len(), 2);
        assert!(matches!(
            results[0],
            Err(EventError::LineTooLong { max: MAX_LINE_LEN, .. })
        ));
        assert_eq!(results[1].as_ref().unwrap().ts(), 7);
    }

    #[test]
    fn test_finish_flushes_unterminated_line() {
        let line = encode_line(&update(5)).unwrap();
        let mut decoder = LineDecoder::new();
        assert!(decoder.push(line.trim_end().as_bytes()).is_empty());
        assert_eq!(decoder.finish().unwrap().unwrap().ts(), 5);
        assert!(decoder.finish().is_none());
    }

    proptest::proptest! {
        #[test]
        fn prop_chunking_is_transparent(split in proptest::collection::vec(1usize..40, 1..20)) {
            let payload: String = (0..5).map(|ts| encode_line(&update(ts)).unwrap()).collect();
            let bytes = payload.as_bytes();

            let mut decoder = LineDecoder::new();
            let mut seen = Vec::new();
            let mut offset = 0;
            for step in split.iter().cycle() {
                if offset >= bytes.len() {
                    break;
                }
                let end = (offset + step).min(bytes.len());
                seen.extend(decoder.push(&bytes[offset..end]).into_iter().map(|r| r.unwrap().ts()));
                offset = end;
            }

            proptest::prop_assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        }
    }
}
