//! Length-prefixed binary framing.
//!
//! ```text
//! ┌─────────────────┬─────────┐
//! │ len             │ payload │
//! │ uint 8|16|32    │ bytes   │
//! └─────────────────┴─────────┘
//! ```
//!
//! `len` counts only payload bytes; prefix width and endianness are fixed
//! per codec. The codec is stateless between messages, so one instance is
//! shared across every connection of a server.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

/// Framing codec with configurable prefix width, bounds and endianness.
#[derive(Debug, Clone)]
pub struct MsgCodec {
    len_msg_len: usize,
    min_msg_len: u32,
    max_msg_len: u32,
    little_endian: bool,
}

impl MsgCodec {
    /// Codec with the default configuration: 2-byte big-endian prefix,
    /// payloads of 1..=4096 bytes.
    pub fn new() -> Self {
        Self {
            len_msg_len: 2,
            min_msg_len: 1,
            max_msg_len: 4096,
            little_endian: false,
        }
    }

    /// Configure prefix width and payload bounds. Widths other than 1, 2
    /// or 4 and zero bounds leave the current values; both bounds are then
    /// clamped to the width's maximum representable length.
    pub fn set_msg_len(&mut self, len_msg_len: usize, min_msg_len: u32, max_msg_len: u32) {
        if len_msg_len == 1 || len_msg_len == 2 || len_msg_len == 4 {
            self.len_msg_len = len_msg_len;
        }
        if min_msg_len != 0 {
            self.min_msg_len = min_msg_len;
        }
        if max_msg_len != 0 {
            self.max_msg_len = max_msg_len;
        }

        let max = match self.len_msg_len {
            1 => u8::MAX as u32,
            2 => u16::MAX as u32,
            _ => u32::MAX,
        };
        if self.min_msg_len > max {
            self.min_msg_len = max;
        }
        if self.max_msg_len > max {
            self.max_msg_len = max;
        }
    }

    /// Set the prefix byte order.
    pub fn set_byte_order(&mut self, little_endian: bool) {
        self.little_endian = little_endian;
    }

    /// Configured maximum payload length.
    pub fn max_msg_len(&self) -> u32 {
        self.max_msg_len
    }

    /// Read one framed payload.
    pub async fn read<R: AsyncRead + Unpin>(&self, reader: &mut R) -> Result<Vec<u8>> {
        let mut prefix = [0u8; 4];
        let prefix = &mut prefix[..self.len_msg_len];
        reader.read_exact(prefix).await?;

        let msg_len: u32 = match self.len_msg_len {
            1 => prefix[0] as u32,
            2 => {
                let b = [prefix[0], prefix[1]];
                if self.little_endian {
                    u16::from_le_bytes(b) as u32
                } else {
                    u16::from_be_bytes(b) as u32
                }
            }
            4 => {
                let b = [prefix[0], prefix[1], prefix[2], prefix[3]];
                if self.little_endian {
                    u32::from_le_bytes(b)
                } else {
                    u32::from_be_bytes(b)
                }
            }
            _ => unreachable!("prefix width is validated on set"),
        };

        if msg_len > self.max_msg_len {
            return Err(Error::MsgTooLong);
        }
        if msg_len < self.min_msg_len {
            return Err(Error::MsgTooShort);
        }

        let mut data = vec![0u8; msg_len as usize];
        reader.read_exact(&mut data).await?;
        Ok(data)
    }

    /// Build one framed packet containing the concatenation of `chunks`.
    pub fn frame(&self, chunks: &[&[u8]]) -> Result<Bytes> {
        let msg_len: u32 = chunks.iter().map(|c| c.len() as u32).sum();

        if msg_len > self.max_msg_len {
            return Err(Error::MsgTooLong);
        }
        if msg_len < self.min_msg_len {
            return Err(Error::MsgTooShort);
        }

        let mut buf = BytesMut::with_capacity(self.len_msg_len + msg_len as usize);
        match self.len_msg_len {
            1 => buf.put_u8(msg_len as u8),
            2 => {
                if self.little_endian {
                    buf.put_u16_le(msg_len as u16);
                } else {
                    buf.put_u16(msg_len as u16);
                }
            }
            4 => {
                if self.little_endian {
                    buf.put_u32_le(msg_len);
                } else {
                    buf.put_u32(msg_len);
                }
            }
            _ => unreachable!("prefix width is validated on set"),
        }
        for chunk in chunks {
            buf.put_slice(chunk);
        }
        Ok(buf.freeze())
    }
}

impl Default for MsgCodec {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn roundtrip(codec: &MsgCodec, payload: &[u8]) -> Vec<u8> {
        let framed = codec.frame(&[payload]).unwrap();
        let mut cursor: &[u8] = framed.as_ref();
        codec.read(&mut cursor).await.unwrap()
    }

    #[tokio::test]
    async fn test_roundtrip_all_widths_and_orders() {
        for width in [1usize, 2, 4] {
            for le in [false, true] {
                let mut codec = MsgCodec::new();
                codec.set_msg_len(width, 1, 200);
                codec.set_byte_order(le);

                let payload = b"the quick brown fox";
                assert_eq!(roundtrip(&codec, payload).await, payload);
            }
        }
    }

    #[test]
    fn test_default_prefix_is_big_endian_u16() {
        let codec = MsgCodec::new();
        let framed = codec.frame(&[b"hi"]).unwrap();
        assert_eq!(&framed[..], &[0x00, 0x02, b'h', b'i']);
    }

    #[test]
    fn test_little_endian_prefix() {
        let mut codec = MsgCodec::new();
        codec.set_byte_order(true);
        let framed = codec.frame(&[&[0u8; 300]]).unwrap();
        assert_eq!(&framed[..2], &[0x2c, 0x01]);
    }

    #[test]
    fn test_frame_concatenates_chunks() {
        let codec = MsgCodec::new();
        let framed = codec.frame(&[b"ab", b"cd", b"ef"]).unwrap();
        assert_eq!(&framed[..], &[0x00, 0x06, b'a', b'b', b'c', b'd', b'e', b'f']);
    }

    #[test]
    fn test_write_bounds() {
        let mut codec = MsgCodec::new();
        codec.set_msg_len(2, 2, 8);

        assert!(matches!(
            codec.frame(&[&[0u8; 9]]).unwrap_err(),
            Error::MsgTooLong
        ));
        assert!(matches!(
            codec.frame(&[&[0u8; 1]]).unwrap_err(),
            Error::MsgTooShort
        ));
        assert!(codec.frame(&[&[0u8; 8]]).is_ok());
    }

    #[tokio::test]
    async fn test_read_bounds() {
        let mut codec = MsgCodec::new();
        codec.set_msg_len(2, 2, 16);

        // A frame claiming 17 bytes.
        let mut wire: &[u8] = &[0x00, 0x11];
        assert!(matches!(
            codec.read(&mut wire).await.unwrap_err(),
            Error::MsgTooLong
        ));

        let mut wire: &[u8] = &[0x00, 0x01, 0xff];
        assert!(matches!(
            codec.read(&mut wire).await.unwrap_err(),
            Error::MsgTooShort
        ));
    }

    #[tokio::test]
    async fn test_read_propagates_eof() {
        let codec = MsgCodec::new();
        let mut empty: &[u8] = &[];
        assert!(matches!(
            codec.read(&mut empty).await.unwrap_err(),
            Error::Io(_)
        ));

        // Truncated payload.
        let mut short: &[u8] = &[0x00, 0x05, b'a', b'b'];
        assert!(matches!(
            codec.read(&mut short).await.unwrap_err(),
            Error::Io(_)
        ));
    }

    #[test]
    fn test_set_msg_len_clamps_to_width() {
        let mut codec = MsgCodec::new();
        codec.set_msg_len(1, 1, 100_000);
        assert_eq!(codec.max_msg_len(), u8::MAX as u32);
    }

    #[test]
    fn test_set_msg_len_ignores_invalid_width_and_zero_bounds() {
        let mut codec = MsgCodec::new();
        codec.set_msg_len(3, 0, 0);
        // Everything keeps its default.
        let framed = codec.frame(&[b"hi"]).unwrap();
        assert_eq!(framed.len(), 2 + 2);
        assert_eq!(codec.max_msg_len(), 4096);
    }
}
