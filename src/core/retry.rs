//! Retry support for missing-data driven loading.
//!
//! Operations run against whatever bytes are currently available. When one
//! fails with `MissingData { begin, end }`, the caller asks the data source
//! for that range and re-runs the same operation. For local documents every
//! byte is resident, so the retry path never triggers.

use super::error::{PDFError, PDFResult};
use super::network::ChunkedStreamManager;
use std::sync::Arc;

/// Where the document bytes come from.
#[derive(Clone)]
pub enum DataSource {
    /// Entire buffer is resident.
    Local,
    /// Bytes arrive through range requests.
    Network(Arc<ChunkedStreamManager>),
}

impl DataSource {
    pub fn is_network(&self) -> bool {
        matches!(self, DataSource::Network(_))
    }

    /// Loads `begin..end` so that a retried operation can read it.
    pub async fn request_range(&self, begin: usize, end: usize) -> PDFResult<()> {
        match self {
            DataSource::Local => Err(PDFError::unknown(format!(
                "Missing data {}..{} in a fully loaded document",
                begin, end
            ))),
            DataSource::Network(manager) => manager.request_range(begin, end).await,
        }
    }

    /// Loads every remaining byte.
    pub async fn request_all(&self) -> PDFResult<()> {
        match self {
            DataSource::Local => Ok(()),
            DataSource::Network(manager) => manager.request_all_chunks().await,
        }
    }
}

/// Re-runs `$operation` until it stops failing with `MissingData`.
///
/// Each `MissingData { begin, end }` is answered by awaiting
/// `$source.request_range(begin, end)`. If the same range is reported
/// missing twice in a row the data source cannot deliver it, and the loop
/// gives up with `PDFError::Unknown`. Any other error is returned as is.
///
/// Must be used inside an async context; `$operation` may itself await.
///
/// # Example
/// ```ignore
/// let num_pages = retry_on_missing_data!(source, document.num_pages())?;
/// ```
#[macro_export]
macro_rules! retry_on_missing_data {
    ($source:expr, $operation:expr) => {{
        let mut last_missing: Option<(usize, usize)> = None;
        loop {
            match $operation {
                Ok(result) => break Ok(result),
                Err($crate::core::error::PDFError::MissingData { begin, end }) => {
                    if last_missing == Some((begin, end)) {
                        break Err($crate::core::error::PDFError::unknown(format!(
                            "Range {}..{} is still missing after it was requested",
                            begin, end
                        )));
                    }
                    last_missing = Some((begin, end));
                    if let Err(err) = $source.request_range(begin, end).await {
                        break Err(err);
                    }
                }
                Err(err) => break Err(err),
            }
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::network::RangeRequest;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_local_source_passes_results_through() {
        let source = DataSource::Local;
        let result: PDFResult<u32> = retry_on_missing_data!(source, Ok::<u32, PDFError>(7));
        assert_eq!(result, Ok(7));

        let result: PDFResult<u32> =
            retry_on_missing_data!(source, Err::<u32, PDFError>(PDFError::Terminated));
        assert_eq!(result, Err(PDFError::Terminated));
    }

    #[tokio::test]
    async fn test_local_source_cannot_serve_missing_data() {
        let source = DataSource::Local;
        let result: PDFResult<u32> = retry_on_missing_data!(
            source,
            Err::<u32, PDFError>(PDFError::MissingData { begin: 0, end: 4 })
        );
        assert!(matches!(result, Err(PDFError::Unknown { .. })));
    }

    #[tokio::test]
    async fn test_network_source_retries_until_loaded() {
        let data = b"0123456789".to_vec();
        let (tx, mut rx) = mpsc::channel::<RangeRequest>(4);
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                let _ = request.reply.send(Ok(data[request.begin..request.end].to_vec()));
            }
        });
        let manager = Arc::new(ChunkedStreamManager::new(10, Some(4), tx));
        let source = DataSource::Network(Arc::clone(&manager));
        let attempts = AtomicUsize::new(0);

        let result: PDFResult<Vec<u8>> = retry_on_missing_data!(source, {
            attempts.fetch_add(1, Ordering::SeqCst);
            let mut stream = manager.get_stream();
            crate::core::base_stream::BaseStream::set_pos(&mut stream, 5)
                .and_then(|_| crate::core::base_stream::BaseStream::get_bytes(&mut stream, 3))
        });

        assert_eq!(result.unwrap(), b"567".to_vec());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
