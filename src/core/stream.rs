use super::base_stream::BaseStream;
use super::error::{PDFError, PDFResult};
use std::sync::Arc;

/// A fully resident in-memory stream.
///
/// Used for local documents, decoded stream payloads and content streams.
/// The bytes live in an `Arc` so sub-streams share them without copying.
pub struct Stream {
    bytes: Arc<[u8]>,
    pos: usize,
    start: usize,
    length: usize,
}

impl Stream {
    /// Creates a stream over `bytes[start..start + length]`.
    ///
    /// A `length` of 0 means "to the end of the buffer".
    pub fn new(bytes: Vec<u8>, start: usize, length: usize) -> Self {
        let actual_length = if length == 0 {
            bytes.len().saturating_sub(start)
        } else {
            length
        };
        Stream {
            bytes: Arc::from(bytes),
            pos: start,
            start,
            length: actual_length,
        }
    }

    /// Creates a stream over shared bytes.
    pub fn from_arc(bytes: Arc<[u8]>, start: usize, length: usize) -> Self {
        Stream {
            bytes,
            pos: start,
            start,
            length,
        }
    }

    /// Creates a stream over the whole byte vector.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let length = bytes.len();
        Self::new(bytes, 0, length)
    }

    /// Returns the readable bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[self.start..self.start + self.length]
    }

    /// Returns the shared buffer.
    pub fn shared_bytes(&self) -> Arc<[u8]> {
        Arc::clone(&self.bytes)
    }
}

impl BaseStream for Stream {
    fn length(&self) -> usize {
        self.length
    }

    fn start(&self) -> usize {
        self.start
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn set_pos(&mut self, pos: usize) -> PDFResult<()> {
        if pos > self.start + self.length {
            return Err(PDFError::InvalidPosition {
                pos,
                length: self.length,
            });
        }
        self.pos = pos;
        Ok(())
    }

    fn get_byte(&mut self) -> PDFResult<u8> {
        if self.pos >= self.start + self.length {
            return Err(PDFError::UnexpectedEndOfStream);
        }
        let byte = self.bytes[self.pos];
        self.pos += 1;
        Ok(byte)
    }

    fn get_bytes(&mut self, length: usize) -> PDFResult<Vec<u8>> {
        let max_pos = self.start + self.length;
        let end_pos = (self.pos + length).min(max_pos);
        let bytes = self.bytes[self.pos..end_pos].to_vec();
        self.pos = end_pos;
        Ok(bytes)
    }

    fn get_byte_range(&self, begin: usize, end: usize) -> PDFResult<Vec<u8>> {
        if begin > end || end > self.start + self.length {
            return Err(PDFError::InvalidByteRange { begin, end });
        }
        Ok(self.bytes[begin..end].to_vec())
    }

    fn reset(&mut self) -> PDFResult<()> {
        self.pos = self.start;
        Ok(())
    }

    fn move_start(&mut self) -> PDFResult<()> {
        if self.pos > self.start {
            let offset = self.pos - self.start;
            self.start = self.pos;
            self.length = self.length.saturating_sub(offset);
        }
        Ok(())
    }

    fn make_sub_stream(&self, start: usize, length: usize) -> PDFResult<Box<dyn BaseStream>> {
        let max_pos = self.start + self.length;
        if start > max_pos {
            return Err(PDFError::InvalidByteRange {
                begin: start,
                end: start + length,
            });
        }
        let length = length.min(max_pos - start);
        Ok(Box::new(Stream::from_arc(
            Arc::clone(&self.bytes),
            start,
            length,
        )))
    }
}
