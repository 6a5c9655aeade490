//! Document manager: one interface over locally resident and network
//! loaded documents.
//!
//! Every query runs against the bytes that are currently available and is
//! retried through [`retry_on_missing_data!`](crate::retry_on_missing_data)
//! when it touches a range that has not arrived yet.
//!
//! Based on PDF.js src/core/pdf_manager.js and src/core/worker.js

use super::annotation::Annotation;
use super::base_stream::BaseStream;
use super::catalog::ExplicitDest;
use super::document::{DocumentInfo, PDFDocument};
use super::error::{PDFError, PDFResult, PasswordReason};
use super::evaluator::EvaluatorOptions;
use super::network::{ChunkedStreamManager, RangeRequest};
use super::operator_list::{OperatorList, OperatorListChunk};
use super::outline::OutlineItem;
use super::page::{Page, PageInfo, RenderingIntent};
use super::retry::DataSource;
use super::stream::Stream;
use super::text_content::TextContent;
use super::worker_task::WorkerTask;
use crate::retry_on_missing_data;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use tokio::sync::mpsc;

/// Supplies passwords for encrypted documents.
///
/// Returning `None` gives up and surfaces the password error.
pub trait PasswordProvider: Send + Sync {
    fn request_password(&self, reason: PasswordReason) -> Option<Vec<u8>>;
}

impl<F> PasswordProvider for F
where
    F: Fn(PasswordReason) -> Option<Vec<u8>> + Send + Sync,
{
    fn request_password(&self, reason: PasswordReason) -> Option<Vec<u8>> {
        self(reason)
    }
}

#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Password tried before the provider is asked.
    pub password: Option<Vec<u8>>,
    /// Chunk size of network documents
    pub chunk_size: usize,
    /// Number of times the password provider is asked
    pub max_password_attempts: usize,
    pub evaluator: EvaluatorOptions,
    /// Capacity of operator list channels made by [`PdfManager::operator_list_channel`]
    pub sink_capacity: usize,
}

impl Default for LoadOptions {
    fn default() -> Self {
        LoadOptions {
            password: None,
            chunk_size: 65536,
            max_password_attempts: 3,
            evaluator: EvaluatorOptions::default(),
            sink_capacity: 16,
        }
    }
}

enum Bytes {
    Local(Arc<[u8]>),
    Network(Arc<ChunkedStreamManager>),
}

/// Loads one document and answers queries about it.
///
/// # Example
/// ```no_run
/// use pdf_engine::core::{LoadOptions, PdfManager, RenderingIntent};
///
/// # async fn run() -> Result<(), pdf_engine::core::PDFError> {
/// let data = std::fs::read("document.pdf").unwrap();
/// let manager = PdfManager::local(1, data, LoadOptions::default());
/// manager.load_document(None).await?;
/// let task = manager.create_task("render p0");
/// let ops = manager.get_operator_list(0, RenderingIntent::Display, &task, None).await?;
/// println!("{} operators", ops.total_length());
/// # Ok(())
/// # }
/// ```
pub struct PdfManager {
    doc_id: u32,
    bytes: Bytes,
    source: DataSource,
    options: LoadOptions,
    document: OnceLock<Arc<PDFDocument>>,
    pages: Mutex<FxHashMap<usize, Arc<Page>>>,
    tasks: Mutex<Vec<WorkerTask>>,
}

impl PdfManager {
    /// Manager for a document whose bytes are all resident.
    pub fn local(doc_id: u32, data: Vec<u8>, options: LoadOptions) -> Self {
        PdfManager::with_bytes(doc_id, Bytes::Local(Arc::from(data)), DataSource::Local, options)
    }

    /// Manager for a document of `length` bytes fetched through `transport`.
    pub fn network(doc_id: u32, length: usize, transport: mpsc::Sender<RangeRequest>, options: LoadOptions) -> Self {
        let manager = Arc::new(ChunkedStreamManager::new(length, Some(options.chunk_size), transport));
        PdfManager::with_bytes(
            doc_id,
            Bytes::Network(Arc::clone(&manager)),
            DataSource::Network(manager),
            options,
        )
    }

    fn with_bytes(doc_id: u32, bytes: Bytes, source: DataSource, options: LoadOptions) -> Self {
        PdfManager {
            doc_id,
            bytes,
            source,
            options,
            document: OnceLock::new(),
            pages: Mutex::new(FxHashMap::default()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn doc_id(&self) -> u32 {
        self.doc_id
    }

    pub fn source(&self) -> &DataSource {
        &self.source
    }

    pub fn options(&self) -> &LoadOptions {
        &self.options
    }

    fn make_stream(&self) -> Box<dyn BaseStream> {
        match &self.bytes {
            Bytes::Local(data) => Box::new(Stream::from_arc(Arc::clone(data), 0, data.len())),
            Bytes::Network(manager) => Box::new(manager.get_stream()),
        }
    }

    /// Parses the document structure.
    ///
    /// Broken cross-reference data triggers a second pass in recovery mode
    /// once every byte is loaded. Password errors go to `provider`; each
    /// password it returns is tried in turn, up to
    /// `max_password_attempts` times.
    pub async fn load_document(&self, provider: Option<&dyn PasswordProvider>) -> PDFResult<Arc<PDFDocument>> {
        if let Some(document) = self.document.get() {
            return Ok(Arc::clone(document));
        }

        let mut password = self.options.password.clone();
        let mut attempts = 0;
        let document = loop {
            match self.try_load(password.take()).await {
                Ok(document) => break document,
                Err(err) => {
                    let Some(reason) = err.password_reason() else {
                        return Err(err);
                    };
                    let Some(provider) = provider else {
                        return Err(err);
                    };
                    if attempts >= self.options.max_password_attempts {
                        log::warn!("Giving up after {} password attempts", attempts);
                        return Err(err);
                    }
                    attempts += 1;
                    match provider.request_password(reason) {
                        Some(next) => password = Some(next),
                        None => return Err(err),
                    }
                }
            }
        };

        let document = Arc::new(document);
        Ok(Arc::clone(self.document.get_or_init(|| document)))
    }

    async fn try_load(&self, password: Option<Vec<u8>>) -> PDFResult<PDFDocument> {
        let mut document = PDFDocument::new(self.doc_id, self.make_stream(), password);
        retry_on_missing_data!(self.source, document.check_header())?;
        retry_on_missing_data!(self.source, document.parse_start_xref())?;
        match retry_on_missing_data!(self.source, document.setup(false)) {
            Err(PDFError::XRefParse(reason)) => {
                log::info!("XRef parse error ({}), retrying in recovery mode", reason);
                self.source.request_all().await?;
                document.setup(true)?;
            }
            other => other?,
        }
        Ok(document)
    }

    /// The loaded document.
    pub fn document(&self) -> PDFResult<&Arc<PDFDocument>> {
        self.document
            .get()
            .ok_or_else(|| PDFError::unknown("Document has not been loaded"))
    }

    /// Registers a cancellable task. [`terminate`](Self::terminate) cancels
    /// every task created here.
    pub fn create_task(&self, name: impl Into<String>) -> WorkerTask {
        let task = WorkerTask::new(name);
        let mut tasks = lock(&self.tasks);
        tasks.retain(|t| !t.is_terminated());
        tasks.push(task.clone());
        task
    }

    pub fn terminate(&self) {
        let mut tasks = lock(&self.tasks);
        for task in tasks.drain(..) {
            task.terminate();
        }
    }

    /// A channel for streaming operator list chunks out of
    /// [`get_operator_list`](Self::get_operator_list).
    pub fn operator_list_channel(&self) -> (mpsc::Sender<OperatorListChunk>, mpsc::Receiver<OperatorListChunk>) {
        mpsc::channel(self.options.sink_capacity.max(1))
    }

    pub async fn num_pages(&self) -> PDFResult<usize> {
        let document = self.document()?;
        retry_on_missing_data!(self.source, document.num_pages())
    }

    pub async fn fingerprint(&self) -> PDFResult<String> {
        let document = self.document()?;
        retry_on_missing_data!(self.source, document.fingerprint().map(str::to_string))
    }

    pub async fn document_info(&self) -> PDFResult<DocumentInfo> {
        let document = self.document()?;
        retry_on_missing_data!(self.source, document.document_info().cloned())
    }

    pub async fn metadata(&self) -> PDFResult<Option<String>> {
        let document = self.document()?;
        retry_on_missing_data!(self.source, document.metadata())
    }

    pub async fn outline(&self) -> PDFResult<Option<Vec<OutlineItem>>> {
        let document = self.document()?;
        retry_on_missing_data!(self.source, document.catalog()?.outline(document.xref()))
    }

    pub async fn destinations(&self) -> PDFResult<BTreeMap<String, ExplicitDest>> {
        let document = self.document()?;
        retry_on_missing_data!(self.source, document.catalog()?.destinations(document.xref()))
    }

    /// The page at `page_index`, built once and shared afterwards.
    pub async fn get_page(&self, page_index: usize) -> PDFResult<Arc<Page>> {
        if let Some(page) = lock(&self.pages).get(&page_index) {
            return Ok(Arc::clone(page));
        }
        let document = self.document()?;
        let num_pages = retry_on_missing_data!(self.source, document.num_pages())?;
        if page_index >= num_pages {
            return Err(PDFError::unknown(format!(
                "Invalid page index {} (document has {} pages)",
                page_index, num_pages
            )));
        }
        let page = Arc::new(retry_on_missing_data!(self.source, document.get_page(page_index))?);
        let mut pages = lock(&self.pages);
        Ok(Arc::clone(pages.entry(page_index).or_insert(page)))
    }

    pub async fn page_info(&self, page_index: usize) -> PDFResult<PageInfo> {
        let page = self.get_page(page_index).await?;
        let document = self.document()?;
        retry_on_missing_data!(self.source, page.info(document.xref()))
    }

    /// Evaluates a page. With a `sink`, chunks are streamed while the page
    /// is evaluated and the last one carries `last_chunk`.
    pub async fn get_operator_list(
        &self,
        page_index: usize,
        intent: RenderingIntent,
        task: &WorkerTask,
        sink: Option<mpsc::Sender<OperatorListChunk>>,
    ) -> PDFResult<OperatorList> {
        let page = self.get_page(page_index).await?;
        let document = self.document()?;
        log::debug!("{}: building operator list of page {}", task.name(), page_index);
        page.get_operator_list(document.xref(), &self.source, task, intent, self.options.evaluator, sink)
            .await
    }

    pub async fn get_text_content(&self, page_index: usize, task: &WorkerTask) -> PDFResult<TextContent> {
        let page = self.get_page(page_index).await?;
        let document = self.document()?;
        page.get_text_content(document.xref(), &self.source, task, self.options.evaluator)
            .await
    }

    /// The page annotations that `intent` includes.
    pub async fn get_annotations(&self, page_index: usize, intent: RenderingIntent) -> PDFResult<Vec<Annotation>> {
        let page = self.get_page(page_index).await?;
        let document = self.document()?;
        let annotations = retry_on_missing_data!(self.source, page.get_annotations(document.xref()))?;
        Ok(annotations
            .into_iter()
            .filter(|annotation| intent.includes(annotation))
            .collect())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
