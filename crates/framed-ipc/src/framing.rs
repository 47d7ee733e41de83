//! Frame boundaries on the byte stream
//!
//! The wire format of the target endpoint was never pinned down, so the
//! framing is chosen at construction time instead of being hard-coded:
//!
//! ```text
//! LengthPrefixed:  [len: 2|4|8 bytes, big|little endian][len bytes of payload]
//! Delimited:       [payload bytes][delimiter]
//! ```
//!
//! [`FrameCodec`] implements the `tokio_util` codec traits for whichever
//! framing is configured, so the read half of the socket can be wrapped in a
//! `FramedRead` and yields complete payloads in arrival order no matter how
//! the bytes were chunked.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::error::{Error, Result};

/// Size of the length prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum PrefixWidth {
    U16,
    U32,
    U64,
}

impl PrefixWidth {
    /// Number of bytes the prefix occupies
    pub fn bytes(self) -> usize {
        match self {
            Self::U16 => 2,
            Self::U32 => 4,
            Self::U64 => 8,
        }
    }

    /// Largest payload length the prefix can express
    pub fn max_len(self) -> u64 {
        match self {
            Self::U16 => u16::MAX as u64,
            Self::U32 => u32::MAX as u64,
            Self::U64 => u64::MAX,
        }
    }
}

impl TryFrom<u8> for PrefixWidth {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            2 => Ok(Self::U16),
            4 => Ok(Self::U32),
            8 => Ok(Self::U64),
            other => Err(format!("unsupported length prefix width: {} (expected 2, 4 or 8)", other)),
        }
    }
}

impl From<PrefixWidth> for u8 {
    fn from(width: PrefixWidth) -> Self {
        width.bytes() as u8
    }
}

/// Byte order of the length prefix
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    #[default]
    Big,
    Little,
}

/// How payloads are delimited on the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Framing {
    LengthPrefixed {
        #[serde(default = "default_width")]
        width: PrefixWidth,
        #[serde(default)]
        byte_order: ByteOrder,
    },
    Delimited {
        #[serde(default = "default_delimiter")]
        delimiter: u8,
    },
}

fn default_width() -> PrefixWidth {
    PrefixWidth::U32
}

fn default_delimiter() -> u8 {
    b'\n'
}

impl Default for Framing {
    fn default() -> Self {
        Self::length_prefixed()
    }
}

impl Framing {
    /// 4-byte big-endian length prefix
    pub fn length_prefixed() -> Self {
        Self::LengthPrefixed {
            width: PrefixWidth::U32,
            byte_order: ByteOrder::Big,
        }
    }

    /// Newline-delimited payloads
    pub fn newline_delimited() -> Self {
        Self::Delimited { delimiter: b'\n' }
    }

    /// Build one contiguous frame so it can go out in a single write
    pub fn encode(&self, payload: &[u8], max_frame_len: usize) -> Result<Bytes> {
        let mut frame = BytesMut::new();
        self.encode_into(payload, max_frame_len, &mut frame)?;
        Ok(frame.freeze())
    }

    /// Append the framed `payload` to `dst`
    pub fn encode_into(&self, payload: &[u8], max_frame_len: usize, dst: &mut BytesMut) -> Result<()> {
        match *self {
            Self::LengthPrefixed { width, byte_order } => {
                let len = payload.len();
                if len > max_frame_len || len as u64 > width.max_len() {
                    return Err(Error::FrameTooLarge {
                        len,
                        max: max_frame_len.min(width.max_len().min(usize::MAX as u64) as usize),
                    });
                }
                dst.reserve(width.bytes() + len);
                write_len(dst, len as u64, width, byte_order);
                dst.extend_from_slice(payload);
            }
            Self::Delimited { delimiter } => {
                if payload.len() > max_frame_len {
                    return Err(Error::FrameTooLarge {
                        len: payload.len(),
                        max: max_frame_len,
                    });
                }
                if payload.contains(&delimiter) {
                    return Err(Error::InvalidFrame(format!(
                        "payload contains delimiter byte 0x{:02x}",
                        delimiter
                    )));
                }
                dst.reserve(payload.len() + 1);
                dst.extend_from_slice(payload);
                dst.put_u8(delimiter);
            }
        }
        Ok(())
    }
}

fn write_len(dst: &mut BytesMut, len: u64, width: PrefixWidth, order: ByteOrder) {
    match (width, order) {
        (PrefixWidth::U16, ByteOrder::Big) => dst.put_u16(len as u16),
        (PrefixWidth::U16, ByteOrder::Little) => dst.put_u16_le(len as u16),
        (PrefixWidth::U32, ByteOrder::Big) => dst.put_u32(len as u32),
        (PrefixWidth::U32, ByteOrder::Little) => dst.put_u32_le(len as u32),
        (PrefixWidth::U64, ByteOrder::Big) => dst.put_u64(len),
        (PrefixWidth::U64, ByteOrder::Little) => dst.put_u64_le(len),
    }
}

fn read_len(header: &[u8], order: ByteOrder) -> u64 {
    let mut value: u64 = 0;
    match order {
        ByteOrder::Big => {
            for &b in header {
                value = (value << 8) | b as u64;
            }
        }
        ByteOrder::Little => {
            for &b in header.iter().rev() {
                value = (value << 8) | b as u64;
            }
        }
    }
    value
}

/// Codec that splits a byte stream into frame payloads
///
/// Oversize frames never surface as errors. When a declared length exceeds
/// `max_frame_len` the whole receive buffer is dropped and decoding carries
/// on with whatever arrives next; the stream is not resynchronised.
#[derive(Debug)]
pub struct FrameCodec {
    framing: Framing,
    max_frame_len: usize,
    discarded: u64,
    /// Bytes of the buffer already searched for a delimiter
    scanned: usize,
}

impl FrameCodec {
    pub fn new(framing: Framing, max_frame_len: usize) -> Self {
        Self {
            framing,
            max_frame_len,
            discarded: 0,
            scanned: 0,
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// How many times buffered input was thrown away because of an oversize frame
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    fn decode_length_prefixed(
        &mut self,
        header_len: usize,
        order: ByteOrder,
        src: &mut BytesMut,
    ) -> Option<BytesMut> {
        if src.len() < header_len {
            return None;
        }

        let declared = read_len(&src[..header_len], order);
        if declared > self.max_frame_len as u64 {
            warn!(
                declared,
                max = self.max_frame_len,
                buffered = src.len(),
                "Declared frame length exceeds limit, discarding receive buffer"
            );
            src.clear();
            self.discarded += 1;
            return None;
        }

        let end = header_len + declared as usize;
        if src.len() < end {
            src.reserve(end - src.len());
            return None;
        }

        let mut frame = src.split_to(end);
        frame.advance(header_len);
        Some(frame)
    }

    fn decode_delimited(&mut self, delimiter: u8, src: &mut BytesMut) -> Option<BytesMut> {
        loop {
            let start = self.scanned.min(src.len());
            let Some(offset) = src[start..].iter().position(|&b| b == delimiter) else {
                self.scanned = src.len();
                if src.len() > self.max_frame_len {
                    warn!(
                        buffered = src.len(),
                        max = self.max_frame_len,
                        "No delimiter within frame limit, discarding receive buffer"
                    );
                    src.clear();
                    self.scanned = 0;
                    self.discarded += 1;
                }
                return None;
            };

            let pos = start + offset;
            let mut record = src.split_to(pos + 1);
            record.truncate(pos);
            self.scanned = 0;

            if record.len() > self.max_frame_len {
                warn!(
                    len = record.len(),
                    max = self.max_frame_len,
                    "Delimited frame exceeds limit, discarding"
                );
                self.discarded += 1;
                continue;
            }
            if record.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Some(record);
        }
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>> {
        let frame = match self.framing {
            Framing::LengthPrefixed { width, byte_order } => {
                self.decode_length_prefixed(width.bytes(), byte_order, src)
            }
            Framing::Delimited { delimiter } => self.decode_delimited(delimiter, src),
        };
        Ok(frame)
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<()> {
        self.framing.encode_into(&payload, self.max_frame_len, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(codec: &mut FrameCodec, buf: &mut BytesMut) -> Vec<Vec<u8>> {
        std::iter::from_fn(|| codec.decode(buf).unwrap())
            .map(|frame| frame.to_vec())
            .collect()
    }

    #[test]
    fn test_default_is_u32_big_endian() {
        let frame = Framing::default().encode(b"abc", 1024).unwrap();
        assert_eq!(frame, vec![0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn test_little_endian_u16() {
        let framing = Framing::LengthPrefixed {
            width: PrefixWidth::U16,
            byte_order: ByteOrder::Little,
        };
        let frame = framing.encode(&[7u8; 258], 1024).unwrap();
        assert_eq!(&frame[..2], &[2, 1]);
        assert_eq!(frame.len(), 260);

        let mut codec = FrameCodec::new(framing, 1024);
        let mut buf = BytesMut::from(&frame[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), vec![7u8; 258]);
    }

    #[test]
    fn test_encode_rejects_oversize() {
        let err = Framing::default().encode(&[0u8; 11], 10).unwrap_err();
        assert!(matches!(err, Error::FrameTooLarge { len: 11, max: 10 }));

        let u16_framing = Framing::LengthPrefixed {
            width: PrefixWidth::U16,
            byte_order: ByteOrder::Big,
        };
        let err = u16_framing.encode(&vec![0u8; 70_000], 1 << 20).unwrap_err();
        assert!(matches!(err, Error::FrameTooLarge { max: 65535, .. }));
    }

    #[test]
    fn test_delimited_rejects_embedded_delimiter() {
        let err = Framing::newline_delimited().encode(b"a\nb", 1024).unwrap_err();
        assert!(matches!(err, Error::InvalidFrame(_)));
    }

    #[test]
    fn test_codec_encoder_matches_framing() {
        let mut codec = FrameCodec::new(Framing::newline_delimited(), 64);
        let mut dst = BytesMut::new();
        codec.encode(Bytes::from_static(b"{}"), &mut dst).unwrap();
        codec.encode(Bytes::from_static(b"[]"), &mut dst).unwrap();
        assert_eq!(&dst[..], b"{}\n[]\n");
        assert!(codec.encode(Bytes::from(vec![b'x'; 65]), &mut dst).is_err());
    }

    #[test]
    fn test_partial_frame_waits_for_more() {
        let mut codec = FrameCodec::new(Framing::default(), 1024);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0, 0, 0]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&[5, b'h', b'e']);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 6);
        buf.extend_from_slice(b"llo");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), &b"hello"[..]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_multiple_frames_in_one_chunk() {
        let framing = Framing::default();
        let mut buf = BytesMut::new();
        framing.encode_into(b"one", 1024, &mut buf).unwrap();
        framing.encode_into(b"two", 1024, &mut buf).unwrap();
        buf.extend_from_slice(&[0, 0]);

        let mut codec = FrameCodec::new(framing, 1024);
        assert_eq!(drain(&mut codec, &mut buf), vec![b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn test_oversize_declared_length_resets_buffer() {
        let framing = Framing::default();
        let mut codec = FrameCodec::new(framing, 64);
        let mut buf = BytesMut::from(&[0x7f, 0xff, 0xff, 0xff, 1, 2, 3][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
        assert_eq!(codec.discarded(), 1);

        framing.encode_into(b"ok", 64, &mut buf).unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), &b"ok"[..]);
    }

    #[test]
    fn test_zero_length_frame() {
        let mut codec = FrameCodec::new(Framing::default(), 64);
        let mut buf = BytesMut::from(&[0u8, 0, 0, 0][..]);
        assert!(codec.decode(&mut buf).unwrap().unwrap().is_empty());
    }

    #[test]
    fn test_delimited_skips_blank_records() {
        let mut codec = FrameCodec::new(Framing::newline_delimited(), 64);
        let mut buf = BytesMut::from(&b"\n  \n{\"a\":1}\n{\"b\""[..]);
        assert_eq!(drain(&mut codec, &mut buf), vec![b"{\"a\":1}".to_vec()]);
        buf.extend_from_slice(b":2}\n");
        assert_eq!(drain(&mut codec, &mut buf), vec![b"{\"b\":2}".to_vec()]);
    }

    #[test]
    fn test_delimited_resumes_scan_where_it_stopped() {
        let mut codec = FrameCodec::new(Framing::newline_delimited(), 1024);
        let mut buf = BytesMut::new();
        for _ in 0..10 {
            buf.extend_from_slice(b"0123456789");
            assert!(codec.decode(&mut buf).unwrap().is_none());
        }
        assert_eq!(codec.scanned, 100);

        buf.extend_from_slice(b"!\nnext");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().len(), 101);
        assert_eq!(codec.scanned, 0);
        assert_eq!(&buf[..], b"next");
    }

    #[test]
    fn test_delimited_without_delimiter_overflows() {
        let mut codec = FrameCodec::new(Framing::newline_delimited(), 8);
        let mut buf = BytesMut::from(&b"0123456789"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
        assert_eq!(codec.discarded(), 1);

        buf.extend_from_slice(b"ok\n");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), &b"ok"[..]);
    }

    #[test]
    fn test_framing_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            framing: Framing,
        }

        let w: Wrapper =
            toml::from_str("[framing]\nkind = \"length_prefixed\"\nwidth = 2\nbyte_order = \"little\"\n")
                .unwrap();
        assert_eq!(
            w.framing,
            Framing::LengthPrefixed {
                width: PrefixWidth::U16,
                byte_order: ByteOrder::Little
            }
        );

        let w: Wrapper = toml::from_str("[framing]\nkind = \"delimited\"\n").unwrap();
        assert_eq!(w.framing, Framing::newline_delimited());

        assert!(toml::from_str::<Wrapper>("[framing]\nkind = \"length_prefixed\"\nwidth = 3\n").is_err());
    }
}
