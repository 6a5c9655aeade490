pub mod core;

// Re-export main types for convenience
pub use core::{
    Annotation, BaseStream, Lexer, LoadOptions, OpCode, OperatorList, PDFDocument, PDFError, PDFObject,
    Parser, PdfManager, Ref, RenderingIntent, Stream, TextContent, Token, WorkerTask, XRef, XRefEntry,
};
