//! Operator codes and the operator list handed to renderers.
//!
//! Based on PDF.js src/shared/util.js (OPS) and src/core/operator_list.js

use super::error::{PDFError, PDFResult};
use super::parser::PDFObject;
use std::fmt;
use tokio::sync::mpsc;

/// Operator list length at which a chunk is flushed to the sink.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 1000;

/// Renderer-facing operator codes.
///
/// Numbering follows the PDF.js OPS enumeration so that lists can be fed to
/// renderers written against it. Codes start at 1; 0 is never a valid op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// Resource that must be loaded before painting
    Dependency = 1,

    // Graphics state
    SetLineWidth = 2,
    SetLineCap = 3,
    SetLineJoin = 4,
    SetMiterLimit = 5,
    SetDash = 6,
    SetRenderingIntent = 7,
    SetFlatness = 8,
    SetGState = 9,
    Save = 10,
    Restore = 11,
    Transform = 12,

    // Path construction
    MoveTo = 13,
    LineTo = 14,
    CurveTo = 15,
    CurveTo2 = 16,
    CurveTo3 = 17,
    ClosePath = 18,
    Rectangle = 19,

    // Path painting
    Stroke = 20,
    CloseStroke = 21,
    Fill = 22,
    EOFill = 23,
    FillStroke = 24,
    EOFillStroke = 25,
    CloseFillStroke = 26,
    CloseEOFillStroke = 27,
    EndPath = 28,
    Clip = 29,
    EOClip = 30,

    // Text
    BeginText = 31,
    EndText = 32,
    SetCharSpacing = 33,
    SetWordSpacing = 34,
    SetHScale = 35,
    SetLeading = 36,
    SetFont = 37,
    SetTextRenderingMode = 38,
    SetTextRise = 39,
    MoveText = 40,
    SetLeadingMoveText = 41,
    SetTextMatrix = 42,
    NextLine = 43,
    ShowText = 44,
    ShowSpacedText = 45,
    NextLineShowText = 46,
    NextLineSetSpacingShowText = 47,
    SetCharWidth = 48,
    SetCharWidthAndBounds = 49,

    // Colour
    SetStrokeColorSpace = 50,
    SetFillColorSpace = 51,
    SetStrokeColor = 52,
    SetStrokeColorN = 53,
    SetFillColor = 54,
    SetFillColorN = 55,
    SetStrokeGray = 56,
    SetFillGray = 57,
    SetStrokeRGBColor = 58,
    SetFillRGBColor = 59,
    SetStrokeCMYKColor = 60,
    SetFillCMYKColor = 61,
    ShadingFill = 62,

    // Inline images
    BeginInlineImage = 63,
    BeginImageData = 64,
    EndInlineImage = 65,

    PaintXObject = 66,

    // Marked content
    MarkPoint = 67,
    MarkPointProps = 68,
    BeginMarkedContent = 69,
    BeginMarkedContentProps = 70,
    EndMarkedContent = 71,
    BeginCompat = 72,
    EndCompat = 73,

    // Emitted by the evaluator only
    PaintFormXObjectBegin = 74,
    PaintFormXObjectEnd = 75,
    BeginGroup = 76,
    EndGroup = 77,
    BeginAnnotations = 78,
    EndAnnotations = 79,
    BeginAnnotation = 80,
    EndAnnotation = 81,
    PaintJpegXObject = 82,
    PaintImageMaskXObject = 83,
    PaintImageMaskXObjectGroup = 84,
    PaintImageXObject = 85,
    PaintInlineImageXObject = 86,
    PaintInlineImageXObjectGroup = 87,
    PaintImageXObjectRepeat = 88,
    PaintImageMaskXObjectRepeat = 89,
    PaintSolidColorImageMask = 90,
    ConstructPath = 91,
    SetStrokeTransparent = 92,
    SetFillTransparent = 93,
}

impl OpCode {
    /// The numeric PDF.js op code.
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// One flushed slice of an operator list.
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorListChunk {
    pub fn_array: Vec<OpCode>,
    pub args_array: Vec<Vec<PDFObject>>,
    /// Operators emitted so far, including this chunk
    pub total_length: usize,
    pub last_chunk: bool,
}

/// Accumulates operators and their arguments in program order.
///
/// With a sink attached, full chunks are sent to the consumer as soon as the
/// list reaches the flush threshold; the list then starts over empty.
pub struct OperatorList {
    fn_array: Vec<OpCode>,
    args_array: Vec<Vec<PDFObject>>,
    dependencies: Vec<String>,
    total_length: usize,
    flush_threshold: usize,
    sink: Option<mpsc::Sender<OperatorListChunk>>,
}

impl Default for OperatorList {
    fn default() -> Self {
        Self::new(None, None)
    }
}

impl OperatorList {
    pub fn new(sink: Option<mpsc::Sender<OperatorListChunk>>, flush_threshold: Option<usize>) -> Self {
        OperatorList {
            fn_array: Vec::new(),
            args_array: Vec::new(),
            dependencies: Vec::new(),
            total_length: 0,
            flush_threshold: flush_threshold.unwrap_or(DEFAULT_FLUSH_THRESHOLD),
            sink,
        }
    }

    /// Number of operators not yet flushed.
    pub fn length(&self) -> usize {
        self.fn_array.len()
    }

    /// Number of operators emitted over the lifetime of the list.
    pub fn total_length(&self) -> usize {
        self.total_length + self.length()
    }

    pub fn fn_array(&self) -> &[OpCode] {
        &self.fn_array
    }

    pub fn args_array(&self) -> &[Vec<PDFObject>] {
        &self.args_array
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn has_sink(&self) -> bool {
        self.sink.is_some()
    }

    pub fn add_op(&mut self, op: OpCode, args: Vec<PDFObject>) {
        self.fn_array.push(op);
        self.args_array.push(args);
    }

    /// Records a resource dependency once, as a `Dependency` op.
    pub fn add_dependency(&mut self, dependency: &str) {
        if self.dependencies.iter().any(|d| d == dependency) {
            return;
        }
        self.dependencies.push(dependency.to_string());
        self.add_op(OpCode::Dependency, vec![PDFObject::Name(dependency.to_string())]);
    }

    /// Flushes a chunk once the threshold is reached. Lists without a sink
    /// just keep growing.
    pub async fn flush_if_needed(&mut self) -> PDFResult<()> {
        if self.sink.is_some() && self.length() >= self.flush_threshold {
            self.flush(false).await?;
        }
        Ok(())
    }

    /// Sends the pending operators to the sink.
    pub async fn flush(&mut self, last_chunk: bool) -> PDFResult<()> {
        let Some(sink) = &self.sink else {
            return Ok(());
        };
        let fn_array = std::mem::take(&mut self.fn_array);
        let args_array = std::mem::take(&mut self.args_array);
        self.total_length += fn_array.len();
        let chunk = OperatorListChunk {
            fn_array,
            args_array,
            total_length: self.total_length,
            last_chunk,
        };
        sink.send(chunk)
            .await
            .map_err(|_| PDFError::unknown("Operator list consumer went away"))
    }

    /// Encodes the list as a nested array: `[[op codes...], [[args]...]]`.
    ///
    /// Used for operator lists embedded as arguments, e.g. tiling patterns.
    pub fn to_object(&self) -> PDFObject {
        PDFObject::array([
            PDFObject::array(self.fn_array.iter().map(|op| PDFObject::Number(op.code() as f64))),
            PDFObject::array(self.args_array.iter().map(|args| PDFObject::array(args.iter().cloned()))),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_numbering() {
        assert_eq!(OpCode::Dependency.code(), 1);
        assert_eq!(OpCode::Save.code(), 10);
        assert_eq!(OpCode::SetFont.code(), 37);
        assert_eq!(OpCode::PaintXObject.code(), 66);
        assert_eq!(OpCode::PaintFormXObjectBegin.code(), 74);
        assert_eq!(OpCode::PaintImageXObject.code(), 85);
        assert_eq!(OpCode::SetFillTransparent.code(), 93);
    }

    #[test]
    fn test_dependencies_are_unique() {
        let mut list = OperatorList::default();
        list.add_dependency("g_d0_f1R");
        list.add_dependency("g_d0_f1R");
        assert_eq!(list.dependencies(), ["g_d0_f1R".to_string()]);
        assert_eq!(list.fn_array(), [OpCode::Dependency]);
    }

    #[tokio::test]
    async fn test_flush_threshold() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut list = OperatorList::new(Some(tx), Some(2));
        list.add_op(OpCode::Save, vec![]);
        list.flush_if_needed().await.unwrap();
        assert!(rx.try_recv().is_err());

        list.add_op(OpCode::Restore, vec![]);
        list.flush_if_needed().await.unwrap();
        let chunk = rx.recv().await.unwrap();
        assert_eq!(chunk.fn_array, vec![OpCode::Save, OpCode::Restore]);
        assert_eq!(chunk.total_length, 2);
        assert!(!chunk.last_chunk);

        list.add_op(OpCode::EndPath, vec![]);
        list.flush(true).await.unwrap();
        let last = rx.recv().await.unwrap();
        assert!(last.last_chunk);
        assert_eq!(last.total_length, 3);
        assert_eq!(list.total_length(), 3);
    }

    #[tokio::test]
    async fn test_list_without_sink_keeps_ops() {
        let mut list = OperatorList::new(None, Some(1));
        list.add_op(OpCode::Save, vec![]);
        list.add_op(OpCode::Restore, vec![]);
        list.flush_if_needed().await.unwrap();
        list.flush(true).await.unwrap();
        assert_eq!(list.length(), 2);
    }
}
