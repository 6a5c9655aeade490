use super::base_stream::BaseStream;
use super::error::{PDFError, PDFResult};
use rustc_hash::FxHashSet;
use std::sync::{Arc, Mutex, MutexGuard};

/// Default chunk size: 64KB
pub const DEFAULT_CHUNK_SIZE: usize = 65536;

/// Tracks which chunks of a progressively loaded document have arrived.
///
/// The full-length buffer is allocated up front and filled in as range
/// responses arrive, so any loaded byte can be read without copying. Bytes
/// in chunks that have not been received are never handed out; reading them
/// yields `MissingData` with the requested range.
pub struct ChunkManager {
    bytes: Vec<u8>,
    chunk_size: usize,
    num_chunks: usize,
    loaded_chunks: FxHashSet<usize>,
}

impl ChunkManager {
    /// Creates a manager for a document of `total_length` bytes.
    ///
    /// # Arguments
    /// * `total_length` - Total length of the document
    /// * `chunk_size` - Size of each chunk (default: 64KB)
    pub fn new(total_length: usize, chunk_size: Option<usize>) -> Self {
        let chunk_size = chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE).max(1);
        ChunkManager {
            bytes: vec![0; total_length],
            chunk_size,
            num_chunks: total_length.div_ceil(chunk_size),
            loaded_chunks: FxHashSet::default(),
        }
    }

    pub fn length(&self) -> usize {
        self.bytes.len()
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn num_chunks(&self) -> usize {
        self.num_chunks
    }

    pub fn num_chunks_loaded(&self) -> usize {
        self.loaded_chunks.len()
    }

    /// Gets the chunk number for a given byte position.
    pub fn get_chunk_number(&self, pos: usize) -> usize {
        pos / self.chunk_size
    }

    /// Stores bytes received for the range starting at `begin`.
    ///
    /// `begin` must be chunk aligned. Every chunk fully covered by the data
    /// is marked loaded; a trailing partial chunk only counts when it ends at
    /// the end of the document.
    pub fn on_receive_data(&mut self, begin: usize, chunk: &[u8]) -> PDFResult<()> {
        let end = begin + chunk.len();
        if begin % self.chunk_size != 0 || end > self.bytes.len() {
            return Err(PDFError::InvalidByteRange { begin, end });
        }
        self.bytes[begin..end].copy_from_slice(chunk);

        let begin_chunk = begin / self.chunk_size;
        let end_chunk = if end == self.bytes.len() {
            self.num_chunks
        } else {
            end / self.chunk_size
        };
        for chunk_num in begin_chunk..end_chunk {
            self.loaded_chunks.insert(chunk_num);
        }
        Ok(())
    }

    /// Checks if a specific chunk has been loaded.
    pub fn has_chunk(&self, chunk: usize) -> bool {
        self.loaded_chunks.contains(&chunk)
    }

    /// Returns the chunk numbers that have not been loaded, in order.
    pub fn get_missing_chunks(&self) -> Vec<usize> {
        (0..self.num_chunks)
            .filter(|chunk| !self.loaded_chunks.contains(chunk))
            .collect()
    }

    /// Returns the next unloaded chunk starting from `begin_chunk`, wrapping
    /// around to the beginning.
    pub fn next_empty_chunk(&self, begin_chunk: usize) -> Option<usize> {
        (0..self.num_chunks)
            .map(|i| (begin_chunk + i) % self.num_chunks)
            .find(|chunk| !self.loaded_chunks.contains(chunk))
    }

    /// Returns true when every chunk has arrived.
    pub fn is_data_loaded(&self) -> bool {
        self.loaded_chunks.len() == self.num_chunks
    }

    /// Fails with `MissingData` if any byte in `begin..end` is not loaded.
    pub fn ensure_range(&self, begin: usize, end: usize) -> PDFResult<()> {
        if begin >= end {
            return Ok(());
        }
        let end = end.min(self.bytes.len());
        let begin_chunk = begin / self.chunk_size;
        let end_chunk = end.div_ceil(self.chunk_size);
        if (begin_chunk..end_chunk).any(|chunk| !self.loaded_chunks.contains(&chunk)) {
            return Err(PDFError::MissingData { begin, end });
        }
        Ok(())
    }

    /// Returns the chunk-aligned ranges still missing inside `begin..end`.
    ///
    /// Adjacent missing chunks are grouped into one range.
    pub fn missing_ranges(&self, begin: usize, end: usize) -> Vec<(usize, usize)> {
        let end = end.min(self.bytes.len());
        if begin >= end {
            return Vec::new();
        }
        let begin_chunk = begin / self.chunk_size;
        let end_chunk = end.div_ceil(self.chunk_size);

        let mut ranges: Vec<(usize, usize)> = Vec::new();
        for chunk in begin_chunk..end_chunk {
            if self.loaded_chunks.contains(&chunk) {
                continue;
            }
            let chunk_begin = chunk * self.chunk_size;
            let chunk_end = (chunk_begin + self.chunk_size).min(self.bytes.len());
            match ranges.last_mut() {
                Some(last) if last.1 == chunk_begin => last.1 = chunk_end,
                _ => ranges.push((chunk_begin, chunk_end)),
            }
        }
        ranges
    }

    /// Reads a loaded byte.
    pub fn get_byte(&self, pos: usize) -> PDFResult<u8> {
        if pos >= self.bytes.len() {
            return Err(PDFError::UnexpectedEndOfStream);
        }
        self.ensure_range(pos, pos + 1)?;
        Ok(self.bytes[pos])
    }

    /// Copies a loaded range.
    pub fn get_range(&self, begin: usize, end: usize) -> PDFResult<Vec<u8>> {
        if begin > end || end > self.bytes.len() {
            return Err(PDFError::InvalidByteRange { begin, end });
        }
        self.ensure_range(begin, end)?;
        Ok(self.bytes[begin..end].to_vec())
    }
}

/// Standardizes mutex lock error handling for the chunk manager.
pub(crate) fn lock_manager(
    manager: &Arc<Mutex<ChunkManager>>,
) -> PDFResult<MutexGuard<'_, ChunkManager>> {
    manager
        .lock()
        .map_err(|_| PDFError::StreamError("Failed to lock chunk manager (mutex poisoned)".to_string()))
}

/// A stream over a progressively loaded document.
///
/// Reads go through the shared [`ChunkManager`]; touching a chunk that has
/// not arrived yields `MissingData`. Sub-streams share the manager, so data
/// received later becomes visible to every reader.
pub struct ChunkedStream {
    manager: Arc<Mutex<ChunkManager>>,
    pos: usize,
    start: usize,
    length: usize,
}

impl ChunkedStream {
    pub fn new(manager: Arc<Mutex<ChunkManager>>, length: usize) -> Self {
        ChunkedStream {
            manager,
            pos: 0,
            start: 0,
            length,
        }
    }

    fn with_range(manager: Arc<Mutex<ChunkManager>>, start: usize, length: usize) -> Self {
        ChunkedStream {
            manager,
            pos: start,
            start,
            length,
        }
    }

    pub fn manager(&self) -> &Arc<Mutex<ChunkManager>> {
        &self.manager
    }
}

impl BaseStream for ChunkedStream {
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
        let byte = lock_manager(&self.manager)?.get_byte(self.pos)?;
        self.pos += 1;
        Ok(byte)
    }

    fn get_bytes(&mut self, length: usize) -> PDFResult<Vec<u8>> {
        let end_pos = (self.pos + length).min(self.start + self.length);
        let bytes = lock_manager(&self.manager)?.get_range(self.pos, end_pos)?;
        self.pos = end_pos;
        Ok(bytes)
    }

    fn get_byte_range(&self, begin: usize, end: usize) -> PDFResult<Vec<u8>> {
        if begin > end || end > self.start + self.length {
            return Err(PDFError::InvalidByteRange { begin, end });
        }
        lock_manager(&self.manager)?.get_range(begin, end)
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
        Ok(Box::new(ChunkedStream::with_range(
            Arc::clone(&self.manager),
            start,
            length.min(max_pos - start),
        )))
    }

    fn is_data_loaded(&self) -> bool {
        lock_manager(&self.manager)
            .map(|manager| manager.is_data_loaded())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manager_creation() {
        let manager = ChunkManager::new(1000, Some(100));
        assert_eq!(manager.length(), 1000);
        assert_eq!(manager.num_chunks(), 10);
        assert!(!manager.is_data_loaded());
    }

    #[test]
    fn test_on_receive_data_marks_covered_chunks() {
        let mut manager = ChunkManager::new(250, Some(100));
        manager.on_receive_data(0, &[7; 150]).unwrap();
        assert!(manager.has_chunk(0));
        assert!(!manager.has_chunk(1));

        manager.on_receive_data(200, &[9; 50]).unwrap();
        assert!(manager.has_chunk(2));
        assert_eq!(manager.get_missing_chunks(), vec![1]);
    }

    #[test]
    fn test_unaligned_data_is_rejected() {
        let mut manager = ChunkManager::new(250, Some(100));
        assert!(manager.on_receive_data(10, &[0; 10]).is_err());
    }

    #[test]
    fn test_next_empty_chunk_wraps() {
        let mut manager = ChunkManager::new(300, Some(100));
        manager.on_receive_data(100, &[0; 100]).unwrap();
        manager.on_receive_data(200, &[0; 100]).unwrap();
        assert_eq!(manager.next_empty_chunk(1), Some(0));
        manager.on_receive_data(0, &[0; 100]).unwrap();
        assert_eq!(manager.next_empty_chunk(1), None);
        assert!(manager.is_data_loaded());
    }

    #[test]
    fn test_missing_ranges_are_grouped() {
        let mut manager = ChunkManager::new(500, Some(100));
        manager.on_receive_data(200, &[0; 100]).unwrap();
        assert_eq!(
            manager.missing_ranges(50, 480),
            vec![(0, 200), (300, 500)]
        );
    }

    #[test]
    fn test_chunked_stream_reports_missing_data() {
        let manager = Arc::new(Mutex::new(ChunkManager::new(200, Some(100))));
        let mut stream = ChunkedStream::new(Arc::clone(&manager), 200);

        match stream.get_byte() {
            Err(PDFError::MissingData { begin, end }) => {
                assert_eq!((begin, end), (0, 1));
            }
            other => panic!("expected MissingData, got {:?}", other),
        }
        assert_eq!(stream.pos(), 0);

        lock_manager(&manager)
            .unwrap()
            .on_receive_data(0, &[b'x'; 100])
            .unwrap();
        assert_eq!(stream.get_byte().unwrap(), b'x');

        stream.set_pos(150).unwrap();
        assert!(stream.get_byte().unwrap_err().is_missing_data());
    }
}
