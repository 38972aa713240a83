// Form-feed delimited record framing.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

/// Byte that terminates every record on the wire.
pub const RECORD_DELIMITER: u8 = 0x0C;

const DEFAULT_MAX_LENGTH: usize = 1024 * 1024;

/// Splits a byte stream into records on [`RECORD_DELIMITER`].
///
/// Empty records (two delimiters in a row) are skipped. At end of stream a
/// trailing partial record is discarded rather than surfaced as a record.
#[derive(Debug, Clone)]
pub struct RecordCodec {
    max_length: usize,
    // Bytes already scanned for a delimiter; avoids rescanning on each poll.
    next_index: usize,
}

impl RecordCodec {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        RecordCodec {
            max_length,
            next_index: 0,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

impl Default for RecordCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for RecordCodec {
    type Item = BytesMut;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>, std::io::Error> {
        loop {
            let found = src[self.next_index..]
                .iter()
                .position(|b| *b == RECORD_DELIMITER);
            match found {
                Some(offset) => {
                    let end = self.next_index + offset;
                    self.next_index = 0;
                    let record = src.split_to(end);
                    src.advance(1);
                    if record.is_empty() {
                        continue;
                    }
                    if record.len() > self.max_length {
                        return Err(too_long(record.len(), self.max_length));
                    }
                    return Ok(Some(record));
                }
                None => {
                    if src.len() > self.max_length {
                        return Err(too_long(src.len(), self.max_length));
                    }
                    self.next_index = src.len();
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>, std::io::Error> {
        if let Some(record) = self.decode(src)? {
            return Ok(Some(record));
        }
        if !src.is_empty() {
            debug!(bytes = src.len(), "discarding partial record at end of stream");
            src.clear();
        }
        self.next_index = 0;
        Ok(None)
    }
}

impl<T: AsRef<[u8]>> Encoder<T> for RecordCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), std::io::Error> {
        let bytes = item.as_ref();
        dst.reserve(bytes.len() + 1);
        dst.put_slice(bytes);
        dst.put_u8(RECORD_DELIMITER);
        Ok(())
    }
}

fn too_long(len: usize, max: usize) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("record of {} bytes exceeds limit of {} bytes", len, max),
    )
}
