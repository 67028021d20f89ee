//! Line codec: frames a TCP byte stream into raw protocol lines.
//!
//! Splits on `\n` and strips an optional preceding `\r`. Lines are handed
//! up as raw bytes, not text: timeseal-obfuscated input is not valid UTF-8
//! and only the timestamp decoder knows how to read it.
//!
//! Outgoing data passes through unmodified. Callers terminate their own
//! lines; keepalive pings and zipseal-compressed chunks are written as
//! bare byte sequences with no terminator at all.
//!
//! Oversized lines are silently skipped rather than killing the
//! connection, matching how the rest of the protocol layer treats
//! malformed client input as recoverable.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

/// Maximum accepted input line length (excluding the terminator).
/// Anything longer is discarded up to the next newline.
const MAX_LINE_LENGTH: usize = 4096;

/// Codec error: I/O only. Parse problems are handled above this layer.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A tokio codec framing raw lines on `\n` boundaries.
#[derive(Debug, Default)]
pub struct LineCodec {
    /// True when discarding an oversized line and waiting for its `\n`.
    skipping: bool,
}

impl Decoder for LineCodec {
    type Item = Vec<u8>;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.skipping {
            if let Some(pos) = src.iter().position(|&b| b == b'\n') {
                warn!(bytes = pos + 1, "codec: finished skipping oversized line tail");
                src.advance(pos + 1);
                self.skipping = false;
            } else {
                src.clear();
                return Ok(None);
            }
        }

        match src.iter().position(|&b| b == b'\n') {
            Some(pos) if pos > MAX_LINE_LENGTH => {
                warn!(bytes = pos, "codec: skipped oversized line");
                src.advance(pos + 1);
                self.decode(src)
            }
            Some(pos) => {
                let mut line = src.split_to(pos);
                src.advance(1); // the \n itself
                if line.last() == Some(&b'\r') {
                    line.truncate(line.len() - 1);
                }
                Ok(Some(line.to_vec()))
            }
            None => {
                if src.len() > MAX_LINE_LENGTH {
                    warn!(
                        bytes = src.len(),
                        "codec: discarding oversized partial line, waiting for terminator"
                    );
                    src.clear();
                    self.skipping = true;
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<Bytes> for LineCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.len());
        dst.put_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    // ── Decoder ──────────────────────────────────────────────────

    #[test]
    fn decode_complete_line() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::from("who\n");
        let line = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(line, b"who");
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_strips_carriage_return() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::from("who\r\n");
        let line = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(line, b"who");
    }

    #[test]
    fn decode_partial_then_complete() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::from("mat");
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"ch bob\n");
        let line = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(line, b"match bob");
    }

    #[test]
    fn decode_two_lines_in_one_read() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::from("who\ngames\n");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), b"who");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), b"games");
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_preserves_non_utf8_bytes() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::from(&[0x84u8, 0xff, 0x10, b'\n'][..]);
        let line = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(line, vec![0x84, 0xff, 0x10]);
    }

    #[test]
    fn decode_skips_oversized_line_and_continues() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&vec![b'A'; MAX_LINE_LENGTH + 50]);
        buf.extend_from_slice(b"\nwho\n");

        let line = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(line, b"who");
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_skips_oversized_partial_then_completes() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::from(vec![b'A'; MAX_LINE_LENGTH + 50].as_slice());

        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(codec.skipping);
        assert!(buf.is_empty());

        buf.extend_from_slice(b"tail\nwho\n");
        let line = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(line, b"who");
        assert!(!codec.skipping);
    }

    #[test]
    fn decode_empty_buffer() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::new();
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    // ── Encoder ──────────────────────────────────────────────────

    #[test]
    fn encode_passes_bytes_through() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::new();
        codec
            .encode(Bytes::from_static(b"[G]\0"), &mut buf)
            .unwrap();
        assert_eq!(&buf[..], b"[G]\0");
    }
}
