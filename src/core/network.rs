//! Range-request plumbing for progressively loaded documents.
//!
//! The engine does not speak HTTP itself. A transport task owns the
//! connection and serves [`RangeRequest`]s received over a channel; it may
//! also push unsolicited data through [`ChunkedStreamManager::on_receive_data`]
//! as a full download progresses.

use super::chunk_manager::{lock_manager, ChunkManager, ChunkedStream};
use super::error::{PDFError, PDFResult};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Failures reported by a transport.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    /// The resource does not exist (HTTP 404).
    #[error("missing file")]
    MissingFile,

    /// Any other non-2xx status.
    #[error("unexpected response status {0}")]
    UnexpectedResponse(u16),

    #[error("{0}")]
    Other(String),
}

impl From<TransportError> for PDFError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::MissingFile => PDFError::MissingPDF,
            TransportError::UnexpectedResponse(status) => PDFError::UnexpectedResponse { status },
            TransportError::Other(message) => PDFError::Unknown { message },
        }
    }
}

/// A request for bytes `begin..end`, answered through `reply`.
#[derive(Debug)]
pub struct RangeRequest {
    pub begin: usize,
    pub end: usize,
    pub reply: oneshot::Sender<Result<Vec<u8>, TransportError>>,
}

/// Owns the chunk state of a network document and fetches missing ranges.
pub struct ChunkedStreamManager {
    manager: Arc<Mutex<ChunkManager>>,
    length: usize,
    transport: mpsc::Sender<RangeRequest>,
}

impl ChunkedStreamManager {
    /// Creates a manager for a document of `length` bytes.
    ///
    /// # Arguments
    /// * `length` - Total document length, as reported by the transport
    /// * `chunk_size` - Chunk size (default: 64KB)
    /// * `transport` - Channel the transport task receives requests on
    pub fn new(
        length: usize,
        chunk_size: Option<usize>,
        transport: mpsc::Sender<RangeRequest>,
    ) -> Self {
        ChunkedStreamManager {
            manager: Arc::new(Mutex::new(ChunkManager::new(length, chunk_size))),
            length,
            transport,
        }
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn chunk_size(&self) -> PDFResult<usize> {
        Ok(lock_manager(&self.manager)?.chunk_size())
    }

    /// Creates a reader over the whole document.
    pub fn get_stream(&self) -> ChunkedStream {
        ChunkedStream::new(Arc::clone(&self.manager), self.length)
    }

    /// Stores bytes pushed by the transport outside of a request.
    pub fn on_receive_data(&self, begin: usize, data: &[u8]) -> PDFResult<()> {
        lock_manager(&self.manager)?.on_receive_data(begin, data)
    }

    pub fn is_data_loaded(&self) -> PDFResult<bool> {
        Ok(lock_manager(&self.manager)?.is_data_loaded())
    }

    /// Fetches every chunk overlapping `begin..end` that is not loaded yet.
    ///
    /// Requests are chunk aligned and adjacent missing chunks are grouped
    /// into a single request.
    pub async fn request_range(&self, begin: usize, end: usize) -> PDFResult<()> {
        let ranges = lock_manager(&self.manager)?.missing_ranges(begin, end);
        for (range_begin, range_end) in ranges {
            log::debug!("Requesting bytes {}..{}", range_begin, range_end);
            let data = self.fetch(range_begin, range_end).await?;
            if data.len() != range_end - range_begin {
                return Err(PDFError::unknown(format!(
                    "Transport returned {} bytes for range {}..{}",
                    data.len(),
                    range_begin,
                    range_end
                )));
            }
            self.on_receive_data(range_begin, &data)?;
        }
        Ok(())
    }

    /// Fetches everything that is still missing.
    pub async fn request_all_chunks(&self) -> PDFResult<()> {
        self.request_range(0, self.length).await
    }

    async fn fetch(&self, begin: usize, end: usize) -> PDFResult<Vec<u8>> {
        let (reply, response) = oneshot::channel();
        self.transport
            .send(RangeRequest { begin, end, reply })
            .await
            .map_err(|_| PDFError::unknown("Transport channel closed"))?;
        let data = response
            .await
            .map_err(|_| PDFError::unknown("Transport dropped the range request"))??;
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::base_stream::BaseStream;

    fn spawn_transport(data: Vec<u8>, log: Arc<Mutex<Vec<(usize, usize)>>>) -> mpsc::Sender<RangeRequest> {
        let (tx, mut rx) = mpsc::channel::<RangeRequest>(8);
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                log.lock().unwrap().push((request.begin, request.end));
                let _ = request
                    .reply
                    .send(Ok(data[request.begin..request.end].to_vec()));
            }
        });
        tx
    }

    #[tokio::test]
    async fn test_request_range_is_chunk_aligned() {
        let data: Vec<u8> = (0..=255).collect();
        let log = Arc::new(Mutex::new(Vec::new()));
        let manager = ChunkedStreamManager::new(256, Some(64), spawn_transport(data, Arc::clone(&log)));

        manager.request_range(70, 140).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec![(64, 192)]);

        let mut stream = manager.get_stream();
        stream.set_pos(100).unwrap();
        assert_eq!(stream.get_byte().unwrap(), 100);

        // Already loaded chunks are not requested again.
        manager.request_range(64, 128).await.unwrap();
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transport_errors_map_to_pdf_errors() {
        let (tx, mut rx) = mpsc::channel::<RangeRequest>(1);
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                let _ = request.reply.send(Err(TransportError::MissingFile));
            }
        });
        let manager = ChunkedStreamManager::new(10, None, tx);
        assert_eq!(manager.request_all_chunks().await, Err(PDFError::MissingPDF));
    }

    #[test]
    fn test_unexpected_response_keeps_status() {
        let err: PDFError = TransportError::UnexpectedResponse(500).into();
        assert_eq!(err, PDFError::UnexpectedResponse { status: 500 });
    }
}
