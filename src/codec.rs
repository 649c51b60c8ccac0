//! Stream codec for a session
//!
//! The stream interleaves two things: newline-terminated JSON control frames
//! and raw file payload. A payload is always announced by a `FILE_METADATA`
//! frame carrying its exact length, and the decoder keeps an explicit count
//! of payload bytes still owed. While that count is non-zero every byte is
//! file content and is never scanned for newlines or parsed as JSON.

use std::sync::Arc;

use crate::error::FrameError;
use crate::message::ControlFrame;
use crate::protocol::MAX_LINE_LEN;
use crate::transform::{self, SecureTransform};

/// Encodes frames for the wire and builds matching decoders
#[derive(Clone, Default)]
pub struct FrameCodec {
    transform: Option<Arc<dyn SecureTransform>>,
}

impl FrameCodec {
    pub fn new(transform: Option<Arc<dyn SecureTransform>>) -> Self {
        Self { transform }
    }

    /// One frame as it goes on the wire, trailing `\n` included
    pub fn encode(&self, frame: &ControlFrame) -> Result<Vec<u8>, FrameError> {
        let json = serde_json::to_vec(frame)?;
        let mut line = match &self.transform {
            Some(t) => transform::seal(t.as_ref(), &json),
            None => json,
        };
        if line.len() > MAX_LINE_LEN {
            return Err(FrameError::LineTooLong {
                len: line.len(),
                max: MAX_LINE_LEN,
            });
        }
        line.push(b'\n');
        Ok(line)
    }

    pub fn decoder(&self) -> FrameDecoder {
        FrameDecoder {
            buf: Vec::with_capacity(64 * 1024),
            pos: 0,
            payload_remaining: 0,
            transform: self.transform.clone(),
        }
    }

    /// Parse a single standalone line (no payload tracking)
    pub fn parse(&self, line: &[u8]) -> Result<ControlFrame, FrameError> {
        decode_line(self.transform.as_deref(), line.trim_ascii())
    }
}

fn decode_line(
    sealer: Option<&dyn SecureTransform>,
    line: &[u8],
) -> Result<ControlFrame, FrameError> {
    match sealer {
        Some(t) => {
            let json = transform::unseal(t, line).map_err(FrameError::Sealed)?;
            Ok(serde_json::from_slice(&json)?)
        }
        None => Ok(serde_json::from_slice(line)?),
    }
}

/// One unit pulled out of the byte stream
#[derive(Debug, PartialEq)]
pub enum Decoded {
    Frame(ControlFrame),
    /// Bytes of the file announced by the last `FILE_METADATA`
    Payload(Vec<u8>),
    /// A line that was expected to be a frame but was not; already discarded
    Malformed(String),
}

pub struct FrameDecoder {
    buf: Vec<u8>,
    pos: usize,
    payload_remaining: u64,
    transform: Option<Arc<dyn SecureTransform>>,
}

impl FrameDecoder {
    /// Append bytes read from the socket, however they were split
    pub fn feed(&mut self, data: &[u8]) {
        if self.pos == self.buf.len() {
            self.buf.clear();
            self.pos = 0;
        } else if self.pos > self.buf.len() / 2 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        self.buf.extend_from_slice(data);
    }

    /// Payload bytes still expected before frame parsing resumes
    pub fn payload_remaining(&self) -> u64 {
        self.payload_remaining
    }

    pub fn in_payload(&self) -> bool {
        self.payload_remaining > 0
    }

    /// Bytes fed but not yet handed out
    pub fn buffered(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn next_item(&mut self) -> Option<Decoded> {
        loop {
            let avail = self.buf.len() - self.pos;
            if avail == 0 {
                return None;
            }

            // Payload first: the remaining count is consulted before any parse
            if self.payload_remaining > 0 {
                let n = (avail as u64).min(self.payload_remaining) as usize;
                let data = self.buf[self.pos..self.pos + n].to_vec();
                self.pos += n;
                self.payload_remaining -= n as u64;
                return Some(Decoded::Payload(data));
            }

            let newline = self.buf[self.pos..].iter().position(|&b| b == b'\n');
            let Some(idx) = newline else {
                if avail > MAX_LINE_LEN {
                    self.pos = self.buf.len();
                    return Some(Decoded::Malformed(
                        FrameError::LineTooLong {
                            len: avail,
                            max: MAX_LINE_LEN,
                        }
                        .to_string(),
                    ));
                }
                return None;
            };

            let start = self.pos;
            self.pos += idx + 1;
            let line = self.buf[start..start + idx].trim_ascii();
            if line.is_empty() {
                continue;
            }
            if line.len() > MAX_LINE_LEN {
                return Some(Decoded::Malformed(
                    FrameError::LineTooLong {
                        len: line.len(),
                        max: MAX_LINE_LEN,
                    }
                    .to_string(),
                ));
            }

            return match decode_line(self.transform.as_deref(), line) {
                Ok(frame) => {
                    if let ControlFrame::FileMetadata { file_size, .. } = &frame {
                        self.payload_remaining = *file_size;
                    }
                    Some(Decoded::Frame(frame))
                }
                Err(e) => Some(Decoded::Malformed(format!(
                    "{} ({} bytes: {:?})",
                    e,
                    line.len(),
                    String::from_utf8_lossy(&line[..line.len().min(64)])
                ))),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{AckStatus, ControlFrame};
    use crate::transform::tests::XorTransform;

    fn drain(dec: &mut FrameDecoder) -> Vec<Decoded> {
        let mut out = Vec::new();
        while let Some(item) = dec.next_item() {
            out.push(item);
        }
        out
    }

    fn collect_payload(items: &[Decoded]) -> Vec<u8> {
        items
            .iter()
            .filter_map(|d| match d {
                Decoded::Payload(p) => Some(p.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    #[test]
    fn test_payload_bytes_are_not_parsed() {
        let codec = FrameCodec::default();
        // Payload that looks exactly like a frame, newline included
        let body = b"{\"type\":\"HEARTBEAT\"}\n{\"type\":\"HEARTBEAT\"}\n".to_vec();
        let mut wire = codec
            .encode(&ControlFrame::FileMetadata {
                file_name: "x.bin".into(),
                file_size: body.len() as u64,
            })
            .unwrap();
        wire.extend_from_slice(&body);
        wire.extend(codec.encode(&ControlFrame::Heartbeat).unwrap());

        let mut dec = codec.decoder();
        dec.feed(&wire);
        let items = drain(&mut dec);
        assert!(matches!(items[0], Decoded::Frame(ControlFrame::FileMetadata { .. })));
        assert_eq!(collect_payload(&items), body);
        assert_eq!(items.last(), Some(&Decoded::Frame(ControlFrame::Heartbeat)));
        let frames = items.iter().filter(|d| matches!(d, Decoded::Frame(_))).count();
        assert_eq!(frames, 2);
        assert_eq!(dec.payload_remaining(), 0);
    }

    #[test]
    fn test_byte_at_a_time_feeding() {
        let codec = FrameCodec::default();
        let body: Vec<u8> = (0..=255u8).cycle().take(3000).collect();
        let mut wire = codec
            .encode(&ControlFrame::FileMetadata {
                file_name: "b".into(),
                file_size: body.len() as u64,
            })
            .unwrap();
        wire.extend_from_slice(&body);
        wire.extend(
            codec
                .encode(&ControlFrame::FileAck {
                    file_name: "b".into(),
                    status: AckStatus::Received,
                })
                .unwrap(),
        );

        let mut dec = codec.decoder();
        let mut items = Vec::new();
        for b in &wire {
            dec.feed(std::slice::from_ref(b));
            items.extend(drain(&mut dec));
        }
        assert_eq!(collect_payload(&items), body);
        assert!(matches!(
            items.last(),
            Some(Decoded::Frame(ControlFrame::FileAck { .. }))
        ));
        assert_eq!(dec.buffered(), 0);
    }

    #[test]
    fn test_malformed_line_is_discarded() {
        let codec = FrameCodec::default();
        let mut dec = codec.decoder();
        dec.feed(b"not json at all\n\r\n{\"type\":\"HEARTBEAT\"}\n");
        let items = drain(&mut dec);
        assert_eq!(items.len(), 2);
        assert!(matches!(items[0], Decoded::Malformed(_)));
        assert_eq!(items[1], Decoded::Frame(ControlFrame::Heartbeat));
    }

    #[test]
    fn test_surrounding_whitespace_is_ignored() {
        let codec = FrameCodec::default();
        let mut dec = codec.decoder();
        dec.feed(b"  {\"type\":\"HEARTBEAT\"}\t\r\n");
        assert_eq!(drain(&mut dec), vec![Decoded::Frame(ControlFrame::Heartbeat)]);
        assert_eq!(
            codec.parse(b"\n {\"type\":\"HEARTBEAT\"} \r\n").unwrap(),
            ControlFrame::Heartbeat
        );
    }

    #[test]
    fn test_partial_line_waits_for_newline() {
        let codec = FrameCodec::default();
        let mut dec = codec.decoder();
        dec.feed(b"{\"type\":\"HEART");
        assert!(dec.next_item().is_none());
        dec.feed(b"BEAT\"}\n");
        assert_eq!(dec.next_item(), Some(Decoded::Frame(ControlFrame::Heartbeat)));
    }

    #[test]
    fn test_overlong_line_is_dropped() {
        let codec = FrameCodec::default();
        let mut dec = codec.decoder();
        dec.feed(&vec![b'x'; MAX_LINE_LEN + 1]);
        assert!(matches!(dec.next_item(), Some(Decoded::Malformed(_))));
        assert_eq!(dec.buffered(), 0);
    }

    #[test]
    fn test_zero_length_file_does_not_enter_payload() {
        let codec = FrameCodec::default();
        let mut dec = codec.decoder();
        let mut wire = codec
            .encode(&ControlFrame::FileMetadata {
                file_name: "empty".into(),
                file_size: 0,
            })
            .unwrap();
        wire.extend(codec.encode(&ControlFrame::Heartbeat).unwrap());
        dec.feed(&wire);
        let items = drain(&mut dec);
        assert_eq!(items.len(), 2);
        assert!(!dec.in_payload());
    }

    #[test]
    fn test_sealed_frames_round_trip_and_payload_stays_raw() {
        let codec = FrameCodec::new(Some(Arc::new(XorTransform(0x5c))));
        let mut wire = codec
            .encode(&ControlFrame::FileMetadata {
                file_name: "s".into(),
                file_size: 4,
            })
            .unwrap();
        assert!(!wire.starts_with(b"{"));
        wire.extend_from_slice(b"\n\n\n\n");
        wire.extend(codec.encode(&ControlFrame::Heartbeat).unwrap());

        let mut dec = codec.decoder();
        dec.feed(&wire);
        let items = drain(&mut dec);
        assert_eq!(collect_payload(&items), b"\n\n\n\n");
        assert_eq!(items.last(), Some(&Decoded::Frame(ControlFrame::Heartbeat)));

        // A plain JSON line is not authentic under the transform
        let mut dec = codec.decoder();
        dec.feed(b"{\"type\":\"HEARTBEAT\"}\n");
        assert!(matches!(dec.next_item(), Some(Decoded::Malformed(_))));
    }

    #[test]
    fn test_encoded_frame_is_single_line() {
        let codec = FrameCodec::default();
        let line = codec
            .encode(&ControlFrame::CancelTransfer {
                file_name: "we\nird\n.exe".into(),
            })
            .unwrap();
        assert_eq!(line.iter().filter(|&&b| b == b'\n').count(), 1);
        assert_eq!(line.last(), Some(&b'\n'));
        assert_eq!(
            codec.parse(&line).unwrap(),
            ControlFrame::CancelTransfer {
                file_name: "we\nird\n.exe".into()
            }
        );
    }
}
