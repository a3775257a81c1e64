use std::io::{self, ErrorKind};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::service::FrameConfig;
use crate::AppError::{Incomplete, MessageTooLong, MessageTooShort};
use crate::{AppError, AppResult};

pub const DEFAULT_LEN_MSG_LEN: usize = 2;
pub const DEFAULT_MIN_MSG_LEN: u32 = 1;
pub const DEFAULT_MAX_MSG_LEN: u32 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    BigEndian,
    LittleEndian,
}

impl ByteOrder {
    pub fn from_little_endian(little_endian: bool) -> Self {
        if little_endian {
            ByteOrder::LittleEndian
        } else {
            ByteOrder::BigEndian
        }
    }
}

/// Length-prefixed framing.
///
/// ```text
/// ---------------
/// | len | data |
/// ---------------
/// ```
///
/// `len` is an unsigned integer of 1, 2 or 4 bytes. The codec is immutable once
/// built and is shared by every connection of one manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameCodec {
    len_msg_len: usize,
    min_msg_len: u32,
    max_msg_len: u32,
    byte_order: ByteOrder,
}

impl Default for FrameCodec {
    fn default() -> Self {
        FrameCodec {
            len_msg_len: DEFAULT_LEN_MSG_LEN,
            min_msg_len: DEFAULT_MIN_MSG_LEN,
            max_msg_len: DEFAULT_MAX_MSG_LEN,
            byte_order: ByteOrder::BigEndian,
        }
    }
}

impl FrameCodec {
    /// Builds a codec, keeping the default for an unsupported width or a zero bound.
    ///
    /// Bounds are clamped to what the prefix width can represent and swapped
    /// if `min_msg_len > max_msg_len`.
    pub fn new(len_msg_len: usize, min_msg_len: u32, max_msg_len: u32, byte_order: ByteOrder) -> Self {
        let mut codec = FrameCodec {
            byte_order,
            ..Default::default()
        };
        if matches!(len_msg_len, 1 | 2 | 4) {
            codec.len_msg_len = len_msg_len;
        }
        if min_msg_len != 0 {
            codec.min_msg_len = min_msg_len;
        }
        if max_msg_len != 0 {
            codec.max_msg_len = max_msg_len;
        }

        let limit = match codec.len_msg_len {
            1 => u8::MAX as u32,
            2 => u16::MAX as u32,
            _ => u32::MAX,
        };
        codec.min_msg_len = codec.min_msg_len.min(limit);
        codec.max_msg_len = codec.max_msg_len.min(limit);
        if codec.max_msg_len < codec.min_msg_len {
            std::mem::swap(&mut codec.min_msg_len, &mut codec.max_msg_len);
        }
        codec
    }

    pub fn from_config(config: &FrameConfig) -> Self {
        FrameCodec::new(
            config.len_msg_len,
            config.min_msg_len,
            config.max_msg_len,
            ByteOrder::from_little_endian(config.little_endian),
        )
    }

    pub fn len_msg_len(&self) -> usize {
        self.len_msg_len
    }

    pub fn min_msg_len(&self) -> u32 {
        self.min_msg_len
    }

    pub fn max_msg_len(&self) -> u32 {
        self.max_msg_len
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    fn check_len(&self, msg_len: u64) -> AppResult<()> {
        if msg_len < self.min_msg_len as u64 {
            return Err(MessageTooShort(msg_len));
        }
        if msg_len > self.max_msg_len as u64 {
            return Err(MessageTooLong(msg_len));
        }
        Ok(())
    }

    fn peek_len(&self, prefix: &[u8]) -> u64 {
        let mut prefix = prefix;
        match (self.len_msg_len, self.byte_order) {
            (1, _) => prefix.get_u8() as u64,
            (2, ByteOrder::BigEndian) => prefix.get_u16() as u64,
            (2, ByteOrder::LittleEndian) => prefix.get_u16_le() as u64,
            (_, ByteOrder::BigEndian) => prefix.get_u32() as u64,
            (_, ByteOrder::LittleEndian) => prefix.get_u32_le() as u64,
        }
    }

    fn put_len(&self, buffer: &mut BytesMut, msg_len: u32) {
        match (self.len_msg_len, self.byte_order) {
            (1, _) => buffer.put_u8(msg_len as u8),
            (2, ByteOrder::BigEndian) => buffer.put_u16(msg_len as u16),
            (2, ByteOrder::LittleEndian) => buffer.put_u16_le(msg_len as u16),
            (_, ByteOrder::BigEndian) => buffer.put_u32(msg_len),
            (_, ByteOrder::LittleEndian) => buffer.put_u32_le(msg_len),
        }
    }

    /// Validates the frame at the head of `buffer` without consuming it.
    ///
    /// Returns `Incomplete` when more bytes are needed. A length outside the
    /// bounds is rejected as soon as the prefix is available.
    pub fn check(&self, buffer: &mut BytesMut) -> AppResult<usize> {
        if buffer.remaining() < self.len_msg_len {
            return Err(Incomplete);
        }
        let msg_len = self.peek_len(&buffer[..self.len_msg_len]);
        self.check_len(msg_len)?;

        let frame_len = self.len_msg_len + msg_len as usize;
        if buffer.remaining() < frame_len {
            buffer.reserve(frame_len - buffer.remaining());
            return Err(Incomplete);
        }
        Ok(msg_len as usize)
    }

    /// Splits one complete payload off the head of `buffer`.
    pub fn parse(&self, buffer: &mut BytesMut) -> AppResult<Option<Bytes>> {
        match self.check(buffer) {
            Ok(msg_len) => {
                buffer.advance(self.len_msg_len);
                Ok(Some(buffer.split_to(msg_len).freeze()))
            }
            Err(AppError::Incomplete) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Reads the next payload from `reader`, buffering partial frames in `buffer`.
    ///
    /// `None` means the peer closed the stream between two frames; a stream that
    /// ends in the middle of a frame is a connection reset.
    pub async fn read_frame<R>(&self, reader: &mut R, buffer: &mut BytesMut) -> AppResult<Option<Bytes>>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if let Some(payload) = self.parse(buffer)? {
                return Ok(Some(payload));
            }
            if 0 == reader.read_buf(buffer).await? {
                return if buffer.is_empty() {
                    Ok(None)
                } else {
                    Err(io::Error::new(ErrorKind::ConnectionReset, "connection reset by peer").into())
                };
            }
        }
    }

    /// Assembles `parts` into one frame: the length prefix followed by every part in order.
    pub fn encode(&self, parts: &[&[u8]]) -> AppResult<Bytes> {
        let msg_len: u64 = parts.iter().map(|part| part.len() as u64).sum();
        self.check_len(msg_len)?;

        let mut buffer = BytesMut::with_capacity(self.len_msg_len + msg_len as usize);
        self.put_len(&mut buffer, msg_len as u32);
        for part in parts {
            buffer.put_slice(part);
        }
        Ok(buffer.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_defaults() {
        let codec = FrameCodec::default();
        assert_eq!(codec.len_msg_len(), 2);
        assert_eq!(codec.min_msg_len(), 1);
        assert_eq!(codec.max_msg_len(), 4096);
        assert_eq!(codec.byte_order(), ByteOrder::BigEndian);
        assert_eq!(FrameCodec::new(3, 0, 0, ByteOrder::BigEndian), codec);
    }

    #[test]
    fn test_bounds_clamped_to_prefix_width() {
        let codec = FrameCodec::new(1, 10, 4096, ByteOrder::BigEndian);
        assert_eq!(codec.min_msg_len(), 10);
        assert_eq!(codec.max_msg_len(), 255);

        let codec = FrameCodec::new(1, 300, 400, ByteOrder::BigEndian);
        assert_eq!(codec.min_msg_len(), 255);
        assert_eq!(codec.max_msg_len(), 255);
    }

    #[test]
    fn test_bounds_swapped_when_inverted() {
        let codec = FrameCodec::new(4, 100, 20, ByteOrder::LittleEndian);
        assert_eq!(codec.min_msg_len(), 20);
        assert_eq!(codec.max_msg_len(), 100);
    }

    #[rstest]
    #[case(1, ByteOrder::BigEndian)]
    #[case(1, ByteOrder::LittleEndian)]
    #[case(2, ByteOrder::BigEndian)]
    #[case(2, ByteOrder::LittleEndian)]
    #[case(4, ByteOrder::BigEndian)]
    #[case(4, ByteOrder::LittleEndian)]
    fn test_round_trip(#[case] width: usize, #[case] byte_order: ByteOrder) {
        let codec = FrameCodec::new(width, 1, 200, byte_order);
        for len in [1usize, 2, 77, 200] {
            let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let frame = codec.encode(&[&payload[..]]).unwrap();
            assert_eq!(frame.len(), width + len);

            let mut buffer = BytesMut::from(&frame[..]);
            let decoded = codec.parse(&mut buffer).unwrap().unwrap();
            assert_eq!(&decoded[..], &payload[..]);
            assert!(buffer.is_empty());
        }
    }

    #[test]
    fn test_prefix_byte_order_on_the_wire() {
        let big = FrameCodec::new(2, 1, 4096, ByteOrder::BigEndian);
        assert_eq!(&big.encode(&[&b"abc"[..]]).unwrap()[..], &[0x00, 0x03, b'a', b'b', b'c']);

        let little = FrameCodec::new(4, 1, 4096, ByteOrder::LittleEndian);
        assert_eq!(&little.encode(&[&b"a"[..]]).unwrap()[..], &[0x01, 0x00, 0x00, 0x00, b'a']);
    }

    #[test]
    fn test_encode_joins_parts_in_order() {
        let codec = FrameCodec::default();
        let frame = codec.encode(&[&b"\x00\x01"[..], &b"hello"[..], &b""[..]]).unwrap();
        assert_eq!(&frame[..], b"\x00\x07\x00\x01hello");
    }

    #[test]
    fn test_encode_rejects_out_of_bounds() {
        let codec = FrameCodec::new(2, 2, 8, ByteOrder::BigEndian);
        assert!(matches!(codec.encode(&[&b"a"[..]]), Err(AppError::MessageTooShort(1))));
        assert!(matches!(
            codec.encode(&[&b"12345"[..], &b"6789"[..]]),
            Err(AppError::MessageTooLong(9))
        ));
        assert!(matches!(codec.encode(&[]), Err(AppError::MessageTooShort(0))));
    }

    #[test]
    fn test_parse_rejects_length_from_prefix_only() {
        let codec = FrameCodec::new(2, 2, 8, ByteOrder::BigEndian);

        // announces 9 bytes but carries none of them
        let mut buffer = BytesMut::from(&[0x00, 0x09][..]);
        assert!(matches!(codec.parse(&mut buffer), Err(AppError::MessageTooLong(9))));
        assert_eq!(buffer.len(), 2);

        let mut buffer = BytesMut::from(&[0x00, 0x01, b'x', b'y'][..]);
        assert!(matches!(codec.parse(&mut buffer), Err(AppError::MessageTooShort(1))));
        assert_eq!(buffer.len(), 4);
    }

    #[test]
    fn test_parse_waits_for_complete_frame() {
        let codec = FrameCodec::default();
        let mut buffer = BytesMut::from(&[0x00][..]);
        assert!(codec.parse(&mut buffer).unwrap().is_none());

        buffer.extend_from_slice(&[0x03, b'a', b'b']);
        assert!(codec.parse(&mut buffer).unwrap().is_none());

        buffer.extend_from_slice(&[b'c', 0x00, 0x01]);
        let payload = codec.parse(&mut buffer).unwrap().unwrap();
        assert_eq!(&payload[..], b"abc");
        // the next frame's prefix stays buffered
        assert_eq!(&buffer[..], &[0x00, 0x01]);
    }

    #[tokio::test]
    async fn test_read_frame_end_of_stream() {
        let codec = FrameCodec::default();

        let mut reader: &[u8] = b"\x00\x02hi";
        let mut buffer = BytesMut::new();
        let payload = codec.read_frame(&mut reader, &mut buffer).await.unwrap();
        assert_eq!(payload.as_deref(), Some(&b"hi"[..]));
        assert!(codec.read_frame(&mut reader, &mut buffer).await.unwrap().is_none());

        let mut truncated: &[u8] = b"\x00\x05hi";
        let mut buffer = BytesMut::new();
        let err = codec.read_frame(&mut truncated, &mut buffer).await.unwrap_err();
        assert!(matches!(err, AppError::IoError(e) if e.kind() == ErrorKind::ConnectionReset));
    }
}
