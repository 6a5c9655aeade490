//! Content stream interpretation.
//!
//! [`EvaluatorPreprocessor`] turns content stream bytes into validated
//! operations; [`PartialEvaluator`] resolves the resources they refer to and
//! builds the operator list. Text extraction lives in `text_content`.
//!
//! Based on PDF.js src/core/evaluator.js

use super::error::{PDFError, PDFResult};
use super::font::{ERROR_FONT_NAME, Font, FontCache};
use super::lexer::Lexer;
use super::operator_list::{OpCode, OperatorList};
use super::page::LocalIdFactory;
use super::parser::{Dict, PDFObject, Parser, Ref};
use super::retry::DataSource;
use super::stream::Stream;
use super::util::{IDENTITY_MATRIX, normalize_rect};
use super::worker_task::WorkerTask;
use super::xref::XRef;
use crate::retry_on_missing_data;
use rustc_hash::FxHashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

/// Largest operand stack kept while reading operators.
pub const MAX_OPERANDS: usize = 33;

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Tunables of a [`PartialEvaluator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvaluatorOptions {
    /// Log and skip operators whose resources fail to load
    pub ignore_errors: bool,
    /// Nesting limit for forms and tiling patterns
    pub max_form_depth: usize,
    /// Operator count at which a chunk is sent to the sink
    pub flush_threshold: usize,
}

impl Default for EvaluatorOptions {
    fn default() -> Self {
        EvaluatorOptions {
            ignore_errors: true,
            max_form_depth: 20,
            flush_threshold: super::operator_list::DEFAULT_FLUSH_THRESHOLD,
        }
    }
}

/// Arity information for one content stream operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpInfo {
    pub op: OpCode,
    pub num_args: usize,
    pub variable_args: bool,
}

const fn fixed(op: OpCode, num_args: usize) -> Option<OpInfo> {
    Some(OpInfo { op, num_args, variable_args: false })
}

const fn variable(op: OpCode, num_args: usize) -> Option<OpInfo> {
    Some(OpInfo { op, num_args, variable_args: true })
}

/// Looks up a content stream operator.
pub fn op_info(command: &str) -> Option<OpInfo> {
    use OpCode::*;
    match command {
        // Graphic state
        "w" => fixed(SetLineWidth, 1),
        "J" => fixed(SetLineCap, 1),
        "j" => fixed(SetLineJoin, 1),
        "M" => fixed(SetMiterLimit, 1),
        "d" => fixed(SetDash, 2),
        "ri" => fixed(SetRenderingIntent, 1),
        "i" => fixed(SetFlatness, 1),
        "gs" => fixed(SetGState, 1),
        "q" => fixed(Save, 0),
        "Q" => fixed(Restore, 0),
        "cm" => fixed(Transform, 6),

        // Path
        "m" => fixed(MoveTo, 2),
        "l" => fixed(LineTo, 2),
        "c" => fixed(CurveTo, 6),
        "v" => fixed(CurveTo2, 4),
        "y" => fixed(CurveTo3, 4),
        "h" => fixed(ClosePath, 0),
        "re" => fixed(Rectangle, 4),
        "S" => fixed(Stroke, 0),
        "s" => fixed(CloseStroke, 0),
        "f" | "F" => fixed(Fill, 0),
        "f*" => fixed(EOFill, 0),
        "B" => fixed(FillStroke, 0),
        "B*" => fixed(EOFillStroke, 0),
        "b" => fixed(CloseFillStroke, 0),
        "b*" => fixed(CloseEOFillStroke, 0),
        "n" => fixed(EndPath, 0),

        // Clipping
        "W" => fixed(Clip, 0),
        "W*" => fixed(EOClip, 0),

        // Text
        "BT" => fixed(BeginText, 0),
        "ET" => fixed(EndText, 0),
        "Tc" => fixed(SetCharSpacing, 1),
        "Tw" => fixed(SetWordSpacing, 1),
        "Tz" => fixed(SetHScale, 1),
        "TL" => fixed(SetLeading, 1),
        "Tf" => fixed(SetFont, 2),
        "Tr" => fixed(SetTextRenderingMode, 1),
        "Ts" => fixed(SetTextRise, 1),
        "Td" => fixed(MoveText, 2),
        "TD" => fixed(SetLeadingMoveText, 2),
        "Tm" => fixed(SetTextMatrix, 6),
        "T*" => fixed(NextLine, 0),
        "Tj" => fixed(ShowText, 1),
        "TJ" => fixed(ShowSpacedText, 1),
        "'" => fixed(NextLineShowText, 1),
        "\"" => fixed(NextLineSetSpacingShowText, 3),

        // Type3 fonts
        "d0" => fixed(SetCharWidth, 2),
        "d1" => fixed(SetCharWidthAndBounds, 6),

        // Color
        "CS" => fixed(SetStrokeColorSpace, 1),
        "cs" => fixed(SetFillColorSpace, 1),
        "SC" => variable(SetStrokeColor, 4),
        "SCN" => variable(SetStrokeColorN, 33),
        "sc" => variable(SetFillColor, 4),
        "scn" => variable(SetFillColorN, 33),
        "G" => fixed(SetStrokeGray, 1),
        "g" => fixed(SetFillGray, 1),
        "RG" => fixed(SetStrokeRGBColor, 3),
        "rg" => fixed(SetFillRGBColor, 3),
        "K" => fixed(SetStrokeCMYKColor, 4),
        "k" => fixed(SetFillCMYKColor, 4),

        // Shading
        "sh" => fixed(ShadingFill, 1),

        // Images
        "BI" => fixed(BeginInlineImage, 0),
        "ID" => fixed(BeginImageData, 0),
        "EI" => fixed(EndInlineImage, 1),

        // XObjects
        "Do" => fixed(PaintXObject, 1),
        "MP" => fixed(MarkPoint, 1),
        "DP" => fixed(MarkPointProps, 2),
        "BMC" => fixed(BeginMarkedContent, 1),
        "BDC" => fixed(BeginMarkedContentProps, 2),
        "EMC" => fixed(EndMarkedContent, 0),

        // Compatibility
        "BX" => fixed(BeginCompat, 0),
        "EX" => fixed(EndCompat, 0),

        _ => None,
    }
}

/// Known-command predicate for the content stream lexer.
///
/// Partial names such as `BD` (of `BDC`) and the prefixes of `false` and
/// `null` count as known so that the lexer keeps extending them.
pub fn is_known_command(command: &str) -> bool {
    op_info(command).is_some()
        || matches!(
            command,
            "BM" | "BD" | "true" | "fa" | "fal" | "fals" | "false" | "nu" | "nul" | "null"
        )
}

/// Broad colour space family; all the evaluator needs to know is whether a
/// `scn`/`SCN` operand names a pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorSpaceKind {
    #[default]
    DeviceGray,
    DeviceRGB,
    DeviceCMYK,
    Pattern,
    Other,
}

impl ColorSpaceKind {
    fn from_name(name: &str) -> Option<ColorSpaceKind> {
        match name {
            "DeviceGray" | "G" | "CalGray" => Some(ColorSpaceKind::DeviceGray),
            "DeviceRGB" | "RGB" | "CalRGB" => Some(ColorSpaceKind::DeviceRGB),
            "DeviceCMYK" | "CMYK" => Some(ColorSpaceKind::DeviceCMYK),
            "Pattern" => Some(ColorSpaceKind::Pattern),
            _ => None,
        }
    }
}

/// Graphics state tracked by the preprocessor across `q`/`Q`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EvalState {
    pub fill_color_space: ColorSpaceKind,
    pub stroke_color_space: ColorSpaceKind,
}

/// One operator with its operands.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub op: OpCode,
    pub args: Vec<PDFObject>,
}

impl Default for Operation {
    fn default() -> Self {
        Operation {
            op: OpCode::Dependency,
            args: Vec::new(),
        }
    }
}

/// Reads operators from a content stream and validates their arity.
///
/// Too many operands keep the trailing ones the operator takes; too few
/// drop the operator. Unmatched `Q` operators are dropped, and
/// [`save_depth`](Self::save_depth) tells how many `q` are still open.
pub struct EvaluatorPreprocessor {
    parser: Parser<'static>,
    state: EvalState,
    state_stack: Vec<EvalState>,
}

impl EvaluatorPreprocessor {
    pub fn new(content: Vec<u8>) -> PDFResult<Self> {
        let lexer = Lexer::with_known_commands(Box::new(Stream::from_bytes(content)), is_known_command)?;
        Ok(EvaluatorPreprocessor {
            parser: Parser::new(lexer)?,
            state: EvalState::default(),
            state_stack: Vec::new(),
        })
    }

    pub fn save_depth(&self) -> usize {
        self.state_stack.len()
    }

    pub fn state(&self) -> &EvalState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut EvalState {
        &mut self.state
    }

    /// Reads the next operation. Returns `false` at the end of the stream.
    pub fn read(&mut self, operation: &mut Operation) -> PDFResult<bool> {
        let mut args: Vec<PDFObject> = Vec::new();
        loop {
            let obj = match self.parser.get_object() {
                Ok(obj) => obj,
                Err(e) if e.is_missing_data() || e == PDFError::Terminated => return Err(e),
                Err(e) => {
                    log::warn!("Skipping malformed content stream data: {}", e);
                    args.clear();
                    continue;
                }
            };

            let command = match obj {
                PDFObject::EOF => return Ok(false),
                PDFObject::Command(command) => command,
                operand => {
                    if args.len() >= MAX_OPERANDS {
                        args.remove(0);
                    }
                    args.push(operand);
                    continue;
                }
            };

            let Some(info) = op_info(&command) else {
                log::warn!("Unknown command \"{}\".", command);
                args.clear();
                continue;
            };

            if !info.variable_args && args.len() != info.num_args {
                if args.len() > info.num_args {
                    log::info!(
                        "Command {}: expected {} args, but received {} args.",
                        command,
                        info.num_args,
                        args.len()
                    );
                    args.drain(..args.len() - info.num_args);
                } else {
                    log::warn!(
                        "Skipping command {}: expected {} args, but received {} args.",
                        command,
                        info.num_args,
                        args.len()
                    );
                    args.clear();
                    continue;
                }
            } else if args.len() > info.num_args {
                log::debug!(
                    "Command {}: expected [0, {}] args, but received {} args.",
                    command,
                    info.num_args,
                    args.len()
                );
            }

            match info.op {
                OpCode::Save => self.state_stack.push(self.state),
                OpCode::Restore => match self.state_stack.pop() {
                    Some(previous) => self.state = previous,
                    None => {
                        log::warn!("Dropping unmatched restore operator");
                        args.clear();
                        continue;
                    }
                },
                _ => {}
            }

            operation.op = info.op;
            operation.args = args;
            return Ok(true);
        }
    }
}

/// A resources dictionary with an optional enclosing scope.
///
/// Forms and patterns get a child scope; names missing from their own
/// `/Resources` are looked up in the scope they were painted from.
#[derive(Debug, Clone, Default)]
pub struct ResourceScope<'p> {
    resources: Dict,
    parent: Option<&'p ResourceScope<'p>>,
}

impl<'p> ResourceScope<'p> {
    pub fn new(resources: Dict) -> Self {
        ResourceScope { resources, parent: None }
    }

    pub fn child(&self, resources: Dict) -> ResourceScope<'_> {
        ResourceScope {
            resources,
            parent: Some(self),
        }
    }

    pub fn resources(&self) -> &Dict {
        &self.resources
    }

    /// Finds `name` in the `category` subdictionary, without resolving the
    /// entry itself.
    pub fn lookup_raw(&self, xref: &XRef, category: &str, name: &str) -> PDFResult<Option<PDFObject>> {
        let mut scope = Some(self);
        while let Some(current) = scope {
            if let Some(PDFObject::Dictionary(entries)) = xref.get_resolved(&current.resources, category)?
                && let Some(value) = entries.get(name)
            {
                return Ok(Some(value.clone()));
            }
            scope = current.parent;
        }
        Ok(None)
    }

    /// Finds and resolves `name` in the `category` subdictionary.
    pub fn lookup(&self, xref: &XRef, category: &str, name: &str) -> PDFResult<Option<PDFObject>> {
        match self.lookup_raw(xref, category, name)? {
            Some(value) => Ok(Some(xref.fetch_if_ref(&value)?)),
            None => Ok(None),
        }
    }
}

/// Evaluates content streams of one page.
///
/// Resource fetches that hit bytes which have not been loaded are retried
/// through the [`DataSource`]; other per-operator failures are logged and
/// skipped unless `ignore_errors` is off.
pub struct PartialEvaluator<'a> {
    pub(crate) xref: &'a XRef,
    pub(crate) source: DataSource,
    pub(crate) page_index: usize,
    pub(crate) id_factory: &'a LocalIdFactory,
    pub(crate) font_cache: &'a FontCache,
    pub(crate) doc_id: u32,
    pub(crate) options: EvaluatorOptions,
    resource_ids: Mutex<FxHashMap<(&'static str, Ref), String>>,
}

impl<'a> PartialEvaluator<'a> {
    pub fn new(
        xref: &'a XRef,
        source: DataSource,
        page_index: usize,
        id_factory: &'a LocalIdFactory,
        font_cache: &'a FontCache,
        doc_id: u32,
        options: EvaluatorOptions,
    ) -> Self {
        PartialEvaluator {
            xref,
            source,
            page_index,
            id_factory,
            font_cache,
            doc_id,
            options,
            resource_ids: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn page_index(&self) -> usize {
        self.page_index
    }

    pub fn options(&self) -> &EvaluatorOptions {
        &self.options
    }

    /// Builds the operator list of a content stream.
    ///
    /// Unclosed `q` operators are balanced with trailing `Q` operators.
    pub async fn get_operator_list(
        &self,
        content: Vec<u8>,
        task: &WorkerTask,
        scope: &ResourceScope<'_>,
        op_list: &mut OperatorList,
    ) -> PDFResult<()> {
        self.build_operator_list(content, task, scope, op_list, 0).await
    }

    fn build_operator_list<'s>(
        &'s self,
        content: Vec<u8>,
        task: &'s WorkerTask,
        scope: &'s ResourceScope<'s>,
        op_list: &'s mut OperatorList,
        depth: usize,
    ) -> BoxFuture<'s, PDFResult<()>> {
        Box::pin(async move {
            task.ensure_not_terminated()?;
            let mut preprocessor = EvaluatorPreprocessor::new(content)?;
            let mut operation = Operation::default();

            while preprocessor.read(&mut operation)? {
                let args = std::mem::take(&mut operation.args);
                let op = operation.op;
                let result = match op {
                    OpCode::PaintXObject => self.handle_paint_xobject(&args, task, scope, op_list, depth).await,
                    OpCode::SetFont => self.handle_set_font(&args, task, scope, op_list).await,
                    OpCode::SetGState => self.handle_set_gstate(&args, task, scope, op_list).await,
                    OpCode::ShadingFill => self.handle_shading_fill(&args, task, scope, op_list).await,
                    OpCode::EndInlineImage => self.handle_inline_image(args, op_list),
                    OpCode::SetFillColorSpace | OpCode::SetStrokeColorSpace => {
                        let kind = retry_on_missing_data!(self.source, self.color_space_kind(&args, scope));
                        kind.map(|kind| {
                            let state = preprocessor.state_mut();
                            if op == OpCode::SetFillColorSpace {
                                state.fill_color_space = kind;
                            } else {
                                state.stroke_color_space = kind;
                            }
                            op_list.add_op(op, args);
                        })
                    }
                    OpCode::SetFillColorN if preprocessor.state().fill_color_space == ColorSpaceKind::Pattern => {
                        self.handle_pattern(op, &args, task, scope, op_list, depth).await
                    }
                    OpCode::SetStrokeColorN
                        if preprocessor.state().stroke_color_space == ColorSpaceKind::Pattern =>
                    {
                        self.handle_pattern(op, &args, task, scope, op_list, depth).await
                    }
                    OpCode::BeginMarkedContentProps | OpCode::MarkPointProps => {
                        self.handle_marked_content_props(op, args, scope, op_list).await
                    }
                    _ => {
                        track_device_color_space(op, preprocessor.state_mut());
                        op_list.add_op(op, args);
                        Ok(())
                    }
                };

                if let Err(err) = result {
                    self.recover_from_error(err, task, op)?;
                }
                task.ensure_not_terminated()?;
                op_list.flush_if_needed().await?;
            }

            for _ in 0..preprocessor.save_depth() {
                op_list.add_op(OpCode::Restore, Vec::new());
            }
            Ok(())
        })
    }

    /// Decides whether a failed operator is skipped or aborts evaluation.
    pub(crate) fn recover_from_error(&self, err: PDFError, task: &WorkerTask, op: OpCode) -> PDFResult<()> {
        if err == PDFError::Terminated || err.is_missing_data() || !self.options.ignore_errors {
            return Err(err);
        }
        log::warn!(
            "{} - ignoring errors during \"{}\" operator: \"{}\".",
            task.name(),
            op,
            err
        );
        Ok(())
    }

    /// Id for a resource, stable for each reference within the page.
    fn resource_id(&self, prefix: &'static str, reference: Option<Ref>) -> String {
        let fresh = || format!("{}_{}", prefix, self.id_factory.create_obj_id());
        let Some(reference) = reference else {
            return fresh();
        };
        match self.resource_ids.lock() {
            Ok(mut ids) => ids.entry((prefix, reference)).or_insert_with(fresh).clone(),
            Err(_) => fresh(),
        }
    }

    async fn handle_paint_xobject(
        &self,
        args: &[PDFObject],
        task: &WorkerTask,
        scope: &ResourceScope<'_>,
        op_list: &mut OperatorList,
        depth: usize,
    ) -> PDFResult<()> {
        let Some(name) = args.first().and_then(PDFObject::as_name) else {
            log::warn!("XObject must be referred to by name.");
            return Ok(());
        };
        let Some(entry) = retry_on_missing_data!(self.source, scope.lookup_raw(self.xref, "XObject", name))? else {
            log::warn!("XObject \"{}\" is not available", name);
            return Ok(());
        };
        let reference = entry.as_ref();
        let xobject = retry_on_missing_data!(self.source, self.xref.fetch_if_ref(&entry))?;
        task.ensure_not_terminated()?;

        let PDFObject::Stream { dict, data } = &xobject else {
            log::warn!("XObject \"{}\" should be a stream", name);
            return Ok(());
        };
        let subtype = retry_on_missing_data!(self.source, self.xref.get_resolved(dict, "Subtype"))?;
        match subtype.as_ref().and_then(PDFObject::as_name) {
            Some("Form") => self.build_form_xobject(dict, data, task, scope, op_list, depth).await,
            Some("Image") => self.build_paint_image(dict, reference, op_list).await,
            Some("PS") => {
                log::warn!("Ignoring XObject with subtype PS");
                Ok(())
            }
            other => {
                log::warn!("Unhandled XObject subtype {:?}", other);
                Ok(())
            }
        }
    }

    async fn build_form_xobject(
        &self,
        dict: &Dict,
        data: &[u8],
        task: &WorkerTask,
        scope: &ResourceScope<'_>,
        op_list: &mut OperatorList,
        depth: usize,
    ) -> PDFResult<()> {
        if depth >= self.options.max_form_depth {
            log::warn!("Form XObject nesting exceeds {}; skipping", self.options.max_form_depth);
            return Ok(());
        }

        let matrix = retry_on_missing_data!(self.source, self.xref.get_resolved(dict, "Matrix"))?
            .and_then(|m| m.as_number_array())
            .filter(|m| m.len() == 6)
            .unwrap_or_else(|| IDENTITY_MATRIX.to_vec());
        let bbox = retry_on_missing_data!(self.source, self.xref.get_resolved(dict, "BBox"))?
            .and_then(|b| b.as_number_array())
            .filter(|b| b.len() == 4)
            .map(|b| normalize_rect([b[0], b[1], b[2], b[3]]));
        let bbox_obj = match bbox {
            Some(bbox) => numbers(&bbox),
            None => PDFObject::Null,
        };

        let group = match retry_on_missing_data!(self.source, self.xref.get_resolved(dict, "Group"))? {
            Some(PDFObject::Dictionary(group)) => {
                let flag = |key: &str| group.get(key).and_then(PDFObject::as_boolean).unwrap_or(false);
                let options: Dict = [
                    ("matrix".to_string(), numbers(&matrix)),
                    ("bbox".to_string(), bbox_obj.clone()),
                    ("isolated".to_string(), PDFObject::Boolean(flag("I"))),
                    ("knockout".to_string(), PDFObject::Boolean(flag("K"))),
                ]
                .into_iter()
                .collect();
                Some(PDFObject::Dictionary(options))
            }
            _ => None,
        };

        let content = retry_on_missing_data!(self.source, self.xref.decode_stream_data(dict, data))?;
        let resources = match retry_on_missing_data!(self.source, self.xref.get_resolved(dict, "Resources"))? {
            Some(PDFObject::Dictionary(resources)) => resources,
            _ => Dict::new(),
        };
        task.ensure_not_terminated()?;

        if let Some(group) = &group {
            op_list.add_op(OpCode::BeginGroup, vec![group.clone()]);
        }
        op_list.add_op(OpCode::PaintFormXObjectBegin, vec![numbers(&matrix), bbox_obj]);

        let child = scope.child(resources);
        let result = self
            .build_operator_list(content, task, &child, op_list, depth + 1)
            .await;

        op_list.add_op(OpCode::PaintFormXObjectEnd, Vec::new());
        if let Some(group) = group {
            op_list.add_op(OpCode::EndGroup, vec![group]);
        }
        result
    }

    async fn build_paint_image(&self, dict: &Dict, reference: Option<Ref>, op_list: &mut OperatorList) -> PDFResult<()> {
        let number = |key: &str, abbreviation: &str| -> PDFResult<Option<f64>> {
            let value = match self.xref.get_resolved(dict, key)? {
                Some(value) => Some(value),
                None => self.xref.get_resolved(dict, abbreviation)?,
            };
            Ok(value.and_then(|v| v.as_number()))
        };
        let width = retry_on_missing_data!(self.source, number("Width", "W"))?;
        let height = retry_on_missing_data!(self.source, number("Height", "H"))?;
        let (Some(width), Some(height)) = (width, height) else {
            log::warn!("Image dimensions are missing, or not numbers.");
            return Ok(());
        };
        if width <= 0.0 || height <= 0.0 {
            log::warn!("Invalid image dimensions {}x{}", width, height);
            return Ok(());
        }

        let image_mask = retry_on_missing_data!(self.source, self.xref.get_resolved(dict, "ImageMask"))?
            .and_then(|m| m.as_boolean())
            .unwrap_or(false);
        let id = self.resource_id("img", reference);
        op_list.add_dependency(&id);
        let op = if image_mask {
            OpCode::PaintImageMaskXObject
        } else {
            OpCode::PaintImageXObject
        };
        op_list.add_op(op, vec![PDFObject::Name(id), PDFObject::Number(width), PDFObject::Number(height)]);
        Ok(())
    }

    /// `EI` carries the inline image stream, dictionary included.
    fn handle_inline_image(&self, mut args: Vec<PDFObject>, op_list: &mut OperatorList) -> PDFResult<()> {
        let image = args.pop().unwrap_or(PDFObject::Null);
        let Some(dict) = image.as_dictionary() else {
            log::warn!("Inline image without a dictionary");
            return Ok(());
        };
        let width = dict.get("Width").and_then(PDFObject::as_number);
        let height = dict.get("Height").and_then(PDFObject::as_number);
        let (Some(width), Some(height)) = (width, height) else {
            log::warn!("Image dimensions are missing, or not numbers.");
            return Ok(());
        };
        op_list.add_op(
            OpCode::PaintInlineImageXObject,
            vec![PDFObject::Number(width), PDFObject::Number(height), image],
        );
        Ok(())
    }

    async fn handle_set_font(
        &self,
        args: &[PDFObject],
        task: &WorkerTask,
        scope: &ResourceScope<'_>,
        op_list: &mut OperatorList,
    ) -> PDFResult<()> {
        let size = args.get(1).and_then(PDFObject::as_number).unwrap_or(0.0);
        let name = args.first().and_then(PDFObject::as_name);
        let font = retry_on_missing_data!(self.source, self.load_font(scope, name))?;
        task.ensure_not_terminated()?;

        op_list.add_dependency(font.loaded_name());
        op_list.add_op(
            OpCode::SetFont,
            vec![PDFObject::Name(font.loaded_name().to_string()), PDFObject::Number(size)],
        );
        Ok(())
    }

    /// Loads the font resource `name`, falling back to the error font.
    pub(crate) fn load_font(&self, scope: &ResourceScope<'_>, name: Option<&str>) -> PDFResult<Arc<Font>> {
        let entry = match name {
            Some(name) => scope.lookup_raw(self.xref, "Font", name)?,
            None => None,
        };
        match entry {
            Some(entry) => self.load_font_object(&entry),
            None => {
                log::warn!("fontRes not available: {:?}", name);
                Ok(Arc::new(Font::error_font()))
            }
        }
    }

    /// Loads a font from a reference or an inline dictionary.
    pub(crate) fn load_font_object(&self, entry: &PDFObject) -> PDFResult<Arc<Font>> {
        let reference = entry.as_ref();
        if let Some(reference) = reference
            && let Some(font) = self.font_cache.get(reference)
        {
            return Ok(font);
        }

        let resolved = self.xref.fetch_if_ref(entry)?;
        let Some(dict) = resolved.as_dictionary() else {
            log::warn!("Font resource is not a dictionary");
            return Ok(Arc::new(Font::error_font()));
        };
        let loaded_name = match reference {
            Some(reference) => format!("g_d{}_f{}", self.doc_id, reference),
            None => format!("g_d{}_f{}", self.doc_id, self.font_cache.next_inline_id()),
        };

        let font = match Font::load(self.xref, dict, loaded_name) {
            Ok(font) => font,
            Err(e) if e.is_missing_data() || !self.options.ignore_errors => return Err(e),
            Err(e) => {
                log::warn!("Loading font failed, using {}: {}", ERROR_FONT_NAME, e);
                return Ok(Arc::new(Font::error_font()));
            }
        };
        Ok(match reference {
            Some(reference) => self.font_cache.insert(reference, font),
            None => Arc::new(font),
        })
    }

    async fn handle_set_gstate(
        &self,
        args: &[PDFObject],
        task: &WorkerTask,
        scope: &ResourceScope<'_>,
        op_list: &mut OperatorList,
    ) -> PDFResult<()> {
        let Some(name) = args.first().and_then(PDFObject::as_name) else {
            log::warn!("ExtGState must be referred to by name.");
            return Ok(());
        };
        let gstate = retry_on_missing_data!(self.source, scope.lookup(self.xref, "ExtGState", name))?;
        let Some(PDFObject::Dictionary(gstate)) = gstate else {
            log::warn!("ExtGState \"{}\" is not available", name);
            return Ok(());
        };

        let mut keys: Vec<&String> = gstate.keys().collect();
        keys.sort();
        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            let value = retry_on_missing_data!(self.source, self.xref.fetch_if_ref(&gstate[key]))?;
            let translated = match key.as_str() {
                "Type" => continue,
                "LW" | "LC" | "LJ" | "ML" | "D" | "RI" | "FL" | "CA" | "ca" | "AIS" | "TK" => value,
                "BM" => match &value {
                    PDFObject::Array(modes) => modes.first().map(|m| (**m).clone()).unwrap_or(PDFObject::Null),
                    _ => value,
                },
                "Font" => {
                    let font_entry = value.as_array().and_then(|font| font.first()).map(|f| (**f).clone());
                    let size = value
                        .as_array()
                        .and_then(|font| font.get(1))
                        .and_then(|s| s.as_number())
                        .unwrap_or(0.0);
                    let font = match font_entry {
                        Some(entry) => retry_on_missing_data!(self.source, self.load_font_object(&entry))?,
                        None => Arc::new(Font::error_font()),
                    };
                    task.ensure_not_terminated()?;
                    op_list.add_dependency(font.loaded_name());
                    PDFObject::array([
                        PDFObject::Name(font.loaded_name().to_string()),
                        PDFObject::Number(size),
                    ])
                }
                "SMask" => PDFObject::Boolean(!value.is_name("None") && value.as_dictionary().is_some()),
                "OP" | "op" | "OPM" | "BG" | "BG2" | "UCR" | "UCR2" | "TR" | "TR2" | "HT" | "SM" | "SA" => {
                    log::info!("graphic state operator {}", key);
                    continue;
                }
                _ => {
                    log::info!("Unknown graphic state operator {}", key);
                    continue;
                }
            };
            entries.push(PDFObject::array([PDFObject::Name(key.clone()), translated]));
        }

        op_list.add_op(OpCode::SetGState, vec![PDFObject::array(entries)]);
        Ok(())
    }

    async fn handle_shading_fill(
        &self,
        args: &[PDFObject],
        task: &WorkerTask,
        scope: &ResourceScope<'_>,
        op_list: &mut OperatorList,
    ) -> PDFResult<()> {
        let Some(name) = args.first().and_then(PDFObject::as_name) else {
            log::warn!("Shading must be referred to by name.");
            return Ok(());
        };
        let Some(entry) = retry_on_missing_data!(self.source, scope.lookup_raw(self.xref, "Shading", name))? else {
            log::warn!("Shading \"{}\" is not available", name);
            return Ok(());
        };
        let shading = retry_on_missing_data!(self.source, self.xref.fetch_if_ref(&entry))?;
        task.ensure_not_terminated()?;
        if shading.get("ShadingType").is_none() {
            return Err(PDFError::format_error(format!("Shading \"{}\" has no ShadingType", name)));
        }

        let id = self.resource_id("pattern", entry.as_ref());
        op_list.add_op(OpCode::ShadingFill, vec![PDFObject::Name(id)]);
        Ok(())
    }

    async fn handle_pattern(
        &self,
        op: OpCode,
        args: &[PDFObject],
        task: &WorkerTask,
        scope: &ResourceScope<'_>,
        op_list: &mut OperatorList,
        depth: usize,
    ) -> PDFResult<()> {
        let Some(PDFObject::Name(name)) = args.last() else {
            op_list.add_op(op, args.to_vec());
            return Ok(());
        };
        let Some(entry) = retry_on_missing_data!(self.source, scope.lookup_raw(self.xref, "Pattern", name))? else {
            log::warn!("Pattern \"{}\" is not available", name);
            return Ok(());
        };
        let pattern = retry_on_missing_data!(self.source, self.xref.fetch_if_ref(&entry))?;
        task.ensure_not_terminated()?;
        let Some(dict) = pattern.as_dictionary() else {
            return Err(PDFError::format_error(format!("Pattern \"{}\" is not a dictionary", name)));
        };

        let matrix = dict
            .get("Matrix")
            .and_then(PDFObject::as_number_array)
            .filter(|m| m.len() == 6)
            .unwrap_or_else(|| IDENTITY_MATRIX.to_vec());

        match dict.get("PatternType").and_then(PDFObject::as_integer) {
            Some(1) => {
                let PDFObject::Stream { dict, data } = &pattern else {
                    return Err(PDFError::format_error("Tiling pattern must be a stream"));
                };
                if depth >= self.options.max_form_depth {
                    log::warn!("Tiling pattern nesting exceeds {}; skipping", self.options.max_form_depth);
                    return Ok(());
                }
                let content = retry_on_missing_data!(self.source, self.xref.decode_stream_data(dict, data))?;
                let resources = match retry_on_missing_data!(self.source, self.xref.get_resolved(dict, "Resources"))? {
                    Some(PDFObject::Dictionary(resources)) => resources,
                    _ => Dict::new(),
                };

                let mut tiling_list = OperatorList::new(None, None);
                let child = scope.child(resources);
                self.build_operator_list(content, task, &child, &mut tiling_list, depth + 1)
                    .await?;
                for dependency in tiling_list.dependencies() {
                    op_list.add_dependency(dependency);
                }

                let bbox = dict
                    .get("BBox")
                    .and_then(PDFObject::as_number_array)
                    .filter(|b| b.len() == 4)
                    .map(|b| numbers(&normalize_rect([b[0], b[1], b[2], b[3]])))
                    .unwrap_or(PDFObject::Null);
                let number = |key: &str| PDFObject::Number(dict.get(key).and_then(PDFObject::as_number).unwrap_or(0.0));
                op_list.add_op(
                    op,
                    vec![
                        PDFObject::Name("TilingPattern".to_string()),
                        tiling_list.to_object(),
                        numbers(&matrix),
                        bbox,
                        number("XStep"),
                        number("YStep"),
                        number("PaintType"),
                    ],
                );
                Ok(())
            }
            Some(2) => {
                let shading = match dict.get("Shading") {
                    Some(shading) => shading.clone(),
                    None => return Err(PDFError::format_error("Shading pattern without /Shading")),
                };
                let id = self.resource_id("pattern", shading.as_ref().or(entry.as_ref()));
                op_list.add_op(
                    op,
                    vec![PDFObject::Name("Shading".to_string()), PDFObject::Name(id), numbers(&matrix)],
                );
                Ok(())
            }
            other => {
                log::warn!("Unknown PatternType: {:?}", other);
                Ok(())
            }
        }
    }

    async fn handle_marked_content_props(
        &self,
        op: OpCode,
        mut args: Vec<PDFObject>,
        scope: &ResourceScope<'_>,
        op_list: &mut OperatorList,
    ) -> PDFResult<()> {
        if let Some(PDFObject::Name(name)) = args.get(1) {
            match retry_on_missing_data!(self.source, scope.lookup(self.xref, "Properties", name))? {
                Some(properties) => args[1] = properties,
                None => log::warn!("Marked content properties \"{}\" not found", name),
            }
        }
        op_list.add_op(op, args);
        Ok(())
    }

    fn color_space_kind(&self, args: &[PDFObject], scope: &ResourceScope<'_>) -> PDFResult<ColorSpaceKind> {
        let Some(name) = args.first().and_then(PDFObject::as_name) else {
            return Ok(ColorSpaceKind::Other);
        };
        if let Some(kind) = ColorSpaceKind::from_name(name) {
            return Ok(kind);
        }
        let family = match scope.lookup(self.xref, "ColorSpace", name)? {
            Some(PDFObject::Name(family)) => Some(family),
            Some(PDFObject::Array(items)) => match items.first() {
                Some(first) => self.xref.fetch_if_ref(first)?.as_name().map(str::to_string),
                None => None,
            },
            _ => None,
        };
        Ok(family
            .as_deref()
            .and_then(ColorSpaceKind::from_name)
            .unwrap_or(ColorSpaceKind::Other))
    }
}

fn track_device_color_space(op: OpCode, state: &mut EvalState) {
    match op {
        OpCode::SetFillGray => state.fill_color_space = ColorSpaceKind::DeviceGray,
        OpCode::SetFillRGBColor => state.fill_color_space = ColorSpaceKind::DeviceRGB,
        OpCode::SetFillCMYKColor => state.fill_color_space = ColorSpaceKind::DeviceCMYK,
        OpCode::SetStrokeGray => state.stroke_color_space = ColorSpaceKind::DeviceGray,
        OpCode::SetStrokeRGBColor => state.stroke_color_space = ColorSpaceKind::DeviceRGB,
        OpCode::SetStrokeCMYKColor => state.stroke_color_space = ColorSpaceKind::DeviceCMYK,
        _ => {}
    }
}

pub(crate) fn numbers(values: &[f64]) -> PDFObject {
    PDFObject::array(values.iter().map(|v| PDFObject::Number(*v)))
}
