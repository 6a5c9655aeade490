pub mod annotation;
pub mod base_stream;
pub mod catalog;
pub mod chunk_manager;
pub mod cmap;
pub mod crypto;
pub mod decode;
pub mod document;
pub mod encryption;
pub mod error;
pub mod evaluator;
pub mod font;
pub mod lexer;
pub mod network;
pub mod operator_list;
pub mod outline;
pub mod page;
pub mod parser;
pub mod pdf_manager;
pub mod retry;
pub mod stream;
pub mod text_content;
pub mod util;
pub mod worker_task;
pub mod xref;

pub use annotation::{Annotation, AnnotationData, AnnotationFactory};
pub use base_stream::BaseStream;
pub use catalog::Catalog;
pub use chunk_manager::{ChunkManager, ChunkedStream};
pub use cmap::CMap;
pub use document::{DocumentInfo, PDFDocument};
pub use error::{PDFError, PDFResult, PasswordReason};
pub use evaluator::{EvaluatorOptions, PartialEvaluator, ResourceScope};
pub use font::{Font, FontCache};
pub use lexer::{Lexer, Token};
pub use network::{ChunkedStreamManager, RangeRequest, TransportError};
pub use operator_list::{OpCode, OperatorList, OperatorListChunk};
pub use outline::{Destination, LinkAction, OutlineItem};
pub use page::{LocalIdFactory, Page, PageInfo, RenderingIntent};
pub use parser::{Dict, PDFObject, Parser, Ref};
pub use pdf_manager::{LoadOptions, PasswordProvider, PdfManager};
pub use retry::DataSource;
pub use stream::Stream;
pub use text_content::{TextContent, TextItem};
pub use worker_task::WorkerTask;
pub use xref::{XRef, XRefEntry};
