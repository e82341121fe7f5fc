//! Tokio codec for newline-terminated protocol lines

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;

/// Maximum accepted length of a single line (1 MiB)
///
/// Grouping configuration pushes are the largest lines on the wire.
pub const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Codec splitting a byte stream into UTF-8 lines
///
/// Both `\n` and `\r\n` terminate a line; the terminator is not part of the
/// decoded item. A trailing unterminated line is returned at end of stream.
#[derive(Debug)]
pub struct LineCodec {
    max_length: usize,
    /// Bytes already scanned for a newline
    next_index: usize,
}

impl LineCodec {
    /// Create a codec with the default line limit
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_LENGTH)
    }

    /// Create a codec with a custom line limit
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
        }
    }

    fn take_line(&mut self, src: &mut BytesMut, len: usize, skip: usize) -> Result<String, ProtocolError> {
        let mut line = src.split_to(len);
        src.advance(skip);
        self.next_index = 0;

        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        String::from_utf8(line.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let scan_to = src.len().min(self.max_length + 1);
        match src[self.next_index..scan_to].iter().position(|b| *b == b'\n') {
            Some(offset) => {
                let len = self.next_index + offset;
                self.take_line(src, len, 1).map(Some)
            }
            None if src.len() > self.max_length => Err(ProtocolError::LineTooLong {
                size: src.len(),
                max: self.max_length,
            }),
            None => {
                self.next_index = scan_to;
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(line) => Ok(Some(line)),
            None if src.is_empty() => Ok(None),
            None => {
                let len = src.len();
                self.take_line(src, len, 0).map(Some)
            }
        }
    }
}

impl Encoder<String> for LineCodec {
    type Error = ProtocolError;

    fn encode(&mut self, line: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if line.len() > self.max_length {
            return Err(ProtocolError::LineTooLong {
                size: line.len(),
                max: self.max_length,
            });
        }

        dst.reserve(line.len() + 1);
        dst.put_slice(line.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}
