use super::error::PDFResult;

/// Base trait for all PDF byte sources.
///
/// Provides a common interface for reading document bytes that are either
/// fully resident in memory or arriving progressively in chunks. Reads that
/// touch bytes which have not arrived yet fail with
/// [`PDFError::MissingData`](super::error::PDFError::MissingData) so the
/// caller can request the range and retry.
///
/// Positions are absolute offsets into the underlying buffer. `start()` is
/// the offset of the first readable byte, which moves forward after the
/// `%PDF-` header has been located.
pub trait BaseStream: Send + Sync {
    // ============================================================================
    // Required methods
    // ============================================================================

    /// Returns the number of readable bytes from `start()`.
    fn length(&self) -> usize;

    /// Returns the offset of the first readable byte.
    fn start(&self) -> usize;

    /// Returns the current position in the stream.
    fn pos(&self) -> usize;

    /// Sets the current position in the stream.
    fn set_pos(&mut self, pos: usize) -> PDFResult<()>;

    /// Reads and returns a single byte, advancing the position.
    fn get_byte(&mut self) -> PDFResult<u8>;

    /// Reads up to `length` bytes, advancing the position.
    ///
    /// Fewer bytes are returned when the end of the stream is reached.
    fn get_bytes(&mut self, length: usize) -> PDFResult<Vec<u8>>;

    /// Returns the bytes in `begin..end` without changing the position.
    fn get_byte_range(&self, begin: usize, end: usize) -> PDFResult<Vec<u8>>;

    /// Resets the position to `start()`.
    fn reset(&mut self) -> PDFResult<()>;

    /// Makes the current position the new start of the stream.
    fn move_start(&mut self) -> PDFResult<()>;

    /// Creates an independent reader over `start..start + length`.
    ///
    /// The sub-stream shares the underlying bytes.
    fn make_sub_stream(&self, start: usize, length: usize) -> PDFResult<Box<dyn BaseStream>>;

    // ============================================================================
    // Provided methods
    // ============================================================================

    /// Returns true if the stream contains no data.
    fn is_empty(&self) -> bool {
        self.length() == 0
    }

    /// Offset one past the last readable byte.
    fn end(&self) -> usize {
        self.start() + self.length()
    }

    /// Returns true if every byte of the stream is resident.
    fn is_data_loaded(&self) -> bool {
        true
    }

    /// Reads a single byte without advancing the position.
    fn peek_byte(&mut self) -> PDFResult<u8> {
        let current_pos = self.pos();
        let byte = self.get_byte()?;
        self.set_pos(current_pos)?;
        Ok(byte)
    }

    /// Reads the specified number of bytes without advancing the position.
    fn peek_bytes(&mut self, length: usize) -> PDFResult<Vec<u8>> {
        let current_pos = self.pos();
        let bytes = self.get_bytes(length)?;
        self.set_pos(current_pos)?;
        Ok(bytes)
    }

    /// Reads a 16-bit unsigned integer (big-endian).
    fn get_uint16(&mut self) -> PDFResult<u16> {
        let b0 = self.get_byte()?;
        let b1 = self.get_byte()?;
        Ok(((b0 as u16) << 8) | (b1 as u16))
    }

    /// Reads a 32-bit signed integer (big-endian).
    fn get_int32(&mut self) -> PDFResult<i32> {
        let b0 = self.get_byte()? as i32;
        let b1 = self.get_byte()? as i32;
        let b2 = self.get_byte()? as i32;
        let b3 = self.get_byte()? as i32;
        Ok((b0 << 24) | (b1 << 16) | (b2 << 8) | b3)
    }

    /// Reads `length` bytes and converts them to a string, replacing invalid
    /// UTF-8 with the replacement character.
    fn get_string(&mut self, length: usize) -> PDFResult<String> {
        let bytes = self.get_bytes(length)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Skips `n` bytes. A count of 0 skips one byte.
    fn skip(&mut self, n: usize) -> PDFResult<()> {
        let skip_count = if n == 0 { 1 } else { n };
        self.set_pos(self.pos() + skip_count)
    }
}
