//! Netstring framing (`<len>:<payload>,`)

use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

/// Upper bound on a single frame payload
pub const MAX_FRAME_LENGTH: usize = 4 * 1024 * 1024;

/// Longest accepted length prefix (enough digits for `MAX_FRAME_LENGTH`)
const MAX_PREFIX_DIGITS: usize = 10;

/// Netstring codec.
///
/// Partial frames stay in the buffer until the rest arrives, so message
/// boundaries may fall anywhere inside or across reads. Malformed frames are
/// logged and skipped; they never end the stream.
#[derive(Debug, Clone)]
pub struct NetstringCodec {
    max_length: usize,
    /// Bytes of an oversized frame still to be thrown away
    discard: usize,
}

impl NetstringCodec {
    #[must_use]
    pub const fn new() -> Self {
        Self::with_max_length(MAX_FRAME_LENGTH)
    }

    #[must_use]
    pub const fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length,
            discard: 0,
        }
    }

    /// Drop bytes up to and including the next `,`
    fn resync(src: &mut BytesMut) {
        match src.iter().position(|b| *b == b',') {
            Some(pos) => {
                let _ = src.split_to(pos + 1);
            }
            None => src.clear(),
        }
    }
}

impl Default for NetstringCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for NetstringCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Bytes>> {
        loop {
            if self.discard > 0 {
                let n = self.discard.min(src.len());
                let _ = src.split_to(n);
                self.discard -= n;
                if self.discard > 0 {
                    return Ok(None);
                }
            }

            if src.is_empty() {
                return Ok(None);
            }

            let Some(colon) = src.iter().position(|b| *b == b':') else {
                let digits_only = src.iter().all(u8::is_ascii_digit);
                if digits_only && src.len() <= MAX_PREFIX_DIGITS {
                    return Ok(None);
                }
                warn!(
                    buffered = src.len(),
                    "netstring framing error: malformed length prefix"
                );
                Self::resync(src);
                continue;
            };

            let prefix = &src[..colon];
            let length = if prefix.is_empty()
                || prefix.len() > MAX_PREFIX_DIGITS
                || !prefix.iter().all(u8::is_ascii_digit)
            {
                None
            } else {
                std::str::from_utf8(prefix)
                    .ok()
                    .and_then(|s| s.parse::<usize>().ok())
            };

            let Some(length) = length else {
                warn!(
                    prefix = %String::from_utf8_lossy(prefix),
                    "netstring framing error: invalid length prefix"
                );
                Self::resync(src);
                continue;
            };

            let total = colon + 1 + length + 1;

            if length > self.max_length {
                warn!(
                    length,
                    max = self.max_length,
                    "netstring framing error: frame too large, discarding"
                );
                self.discard = total;
                continue;
            }

            if src.len() < total {
                src.reserve(total - src.len());
                return Ok(None);
            }

            let frame = src.split_to(total);
            if frame[total - 1] != b',' {
                warn!(length, "netstring framing error: missing ',' terminator");
                continue;
            }

            return Ok(Some(frame.freeze().slice(colon + 1..colon + 1 + length)));
        }
    }
}

impl Encoder<Bytes> for NetstringCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> io::Result<()> {
        if item.len() > self.max_length {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame of {} bytes exceeds {}", item.len(), self.max_length),
            ));
        }
        let prefix = item.len().to_string();
        dst.reserve(prefix.len() + item.len() + 2);
        dst.put_slice(prefix.as_bytes());
        dst.put_u8(b':');
        dst.put_slice(&item);
        dst.put_u8(b',');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(payloads: &[&str]) -> Vec<u8> {
        let mut codec = NetstringCodec::new();
        let mut buf = BytesMut::new();
        for p in payloads {
            codec
                .encode(Bytes::copy_from_slice(p.as_bytes()), &mut buf)
                .unwrap();
        }
        buf.to_vec()
    }

    fn decode_chunks(chunks: &[&[u8]]) -> Vec<Bytes> {
        let mut codec = NetstringCodec::new();
        let mut buf = BytesMut::new();
        let mut out = Vec::new();
        for chunk in chunks {
            buf.extend_from_slice(chunk);
            while let Some(frame) = codec.decode(&mut buf).unwrap() {
                out.push(frame);
            }
        }
        out
    }

    #[test]
    fn test_encode() {
        assert_eq!(encode(&["hello"]), b"5:hello,".to_vec());
        assert_eq!(encode(&[""]), b"0:,".to_vec());
    }

    #[test]
    fn test_decode_coalesced() {
        let wire = encode(&["{\"id\":1}", "Dsome log", "{\"id\":2}"]);
        let frames = decode_chunks(&[&wire]);
        assert_eq!(frames.len(), 3);
        assert_eq!(&frames[1][..], b"Dsome log");
    }

    #[test]
    fn test_decode_split_at_every_offset() {
        let payloads = ["{\"id\":1,\"accepted\":true}", "Wwarn line", "", "{\"targetId\":5}"];
        let wire = encode(&payloads);
        let expected = decode_chunks(&[&wire]);

        for i in 0..=wire.len() {
            for j in i..=wire.len() {
                let frames = decode_chunks(&[&wire[..i], &wire[i..j], &wire[j..]]);
                assert_eq!(frames, expected, "split at {i}/{j}");
            }
        }
    }

    #[test]
    fn test_decode_byte_by_byte() {
        let wire = encode(&["abc", "defgh"]);
        let chunks: Vec<&[u8]> = wire.chunks(1).collect();
        let frames = decode_chunks(&chunks);
        assert_eq!(frames, vec![Bytes::from("abc"), Bytes::from("defgh")]);
    }

    #[test]
    fn test_malformed_prefix_resyncs() {
        let mut wire = b"x1:junk,".to_vec();
        wire.extend(encode(&["ok"]));
        let frames = decode_chunks(&[&wire]);
        assert_eq!(frames, vec![Bytes::from("ok")]);
    }

    #[test]
    fn test_missing_terminator_drops_frame() {
        let mut wire = b"3:abc;".to_vec();
        wire.extend(encode(&["next"]));
        let frames = decode_chunks(&[&wire]);
        assert_eq!(frames, vec![Bytes::from("next")]);
    }

    #[test]
    fn test_oversized_frame_is_discarded_across_reads() {
        let mut codec = NetstringCodec::with_max_length(4);
        let mut buf = BytesMut::from(&b"10:01234"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"56789,2:ok,");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Bytes::from("ok")));
    }

    #[test]
    fn test_partial_prefix_waits() {
        let mut codec = NetstringCodec::new();
        let mut buf = BytesMut::from(&b"12"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(&buf[..], b"12");
    }
}
