use thiserror::Error;

/// Reason passed to a password prompt.
///
/// The numeric values match the codes a viewer shows to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordReason {
    NeedPassword = 1,
    IncorrectPassword = 2,
}

/// Universal error type for PDF operations.
///
/// Covers every failure that can occur while loading, parsing and
/// interpreting a document. `MissingData` is not a real failure: it tells
/// the caller which byte range to fetch before retrying the operation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PDFError {
    /// The document is unrecoverable, even after brute-force recovery.
    #[error("Invalid PDF structure: {0}")]
    InvalidPDF(String),

    /// Bytes in `begin..end` have not been loaded yet.
    #[error("Missing data for range {begin}..{end}")]
    MissingData { begin: usize, end: usize },

    /// The document is encrypted and no (or an empty) password was supplied.
    #[error("No password given")]
    PasswordRequired,

    /// The supplied password does not open the document.
    #[error("Incorrect Password")]
    PasswordIncorrect,

    /// The transport answered with a non-2xx status other than 404.
    #[error("Unexpected server response ({status})")]
    UnexpectedResponse { status: u16 },

    /// The transport reported that the file does not exist.
    #[error("Missing PDF file")]
    MissingPDF,

    /// Catch-all carrying the original message.
    #[error("{message}")]
    Unknown { message: String },

    /// The cross-reference data could not be read; retry in recovery mode.
    #[error("XRef parse error: {0}")]
    XRefParse(String),

    /// The running task was terminated.
    #[error("Worker was terminated")]
    Terminated,

    /// End of stream reached unexpectedly
    #[error("Unexpected end of stream")]
    UnexpectedEndOfStream,

    /// Invalid byte range requested
    #[error("Invalid byte range: {begin}..{end}")]
    InvalidByteRange { begin: usize, end: usize },

    /// Invalid stream position
    #[error("Invalid position {pos} for stream of length {length}")]
    InvalidPosition { pos: usize, length: usize },

    /// Stream operation failed
    #[error("Stream error: {0}")]
    StreamError(String),

    /// Malformed object syntax.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Well-formed objects with the wrong shape (e.g. a page tree kid that
    /// is not a dictionary).
    #[error("Format error: {0}")]
    Format(String),

    /// A stream filter failed.
    #[error("Decode error: {0}")]
    Decode(String),

    /// An indirect object refers back to itself while being resolved.
    #[error("Circular reference detected")]
    CircularReference,
}

impl PDFError {
    pub fn parse_error(message: impl Into<String>) -> Self {
        PDFError::Parse(message.into())
    }

    pub fn format_error(message: impl Into<String>) -> Self {
        PDFError::Format(message.into())
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        PDFError::Unknown {
            message: message.into(),
        }
    }

    /// Returns true if the operation can be retried once more bytes arrive.
    #[inline]
    pub fn is_missing_data(&self) -> bool {
        matches!(self, PDFError::MissingData { .. })
    }

    /// Errors that must never be swallowed by local recovery.
    #[inline]
    pub fn is_fatal_for_recovery(&self) -> bool {
        matches!(
            self,
            PDFError::MissingData { .. }
                | PDFError::Terminated
                | PDFError::PasswordRequired
                | PDFError::PasswordIncorrect
        )
    }

    /// The prompt reason for password failures, `None` otherwise.
    pub fn password_reason(&self) -> Option<PasswordReason> {
        match self {
            PDFError::PasswordRequired => Some(PasswordReason::NeedPassword),
            PDFError::PasswordIncorrect => Some(PasswordReason::IncorrectPassword),
            _ => None,
        }
    }
}

/// Result type alias for PDF operations
pub type PDFResult<T> = Result<T, PDFError>;
