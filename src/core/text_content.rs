//! Text extraction.
//!
//! Text operators are replayed against a minimal text state; every shown
//! string becomes one [`TextItem`] positioned by the text rendering matrix.
//!
//! Based on PDF.js PartialEvaluator.getTextContent in src/core/evaluator.js

use super::error::PDFResult;
use super::evaluator::{BoxFuture, EvaluatorPreprocessor, Operation, PartialEvaluator, ResourceScope};
use super::font::Font;
use super::operator_list::OpCode;
use super::parser::{Dict, PDFObject};
use super::util::{IDENTITY_MATRIX, transform};
use super::worker_task::WorkerTask;
use crate::retry_on_missing_data;
use std::collections::BTreeMap;
use std::sync::Arc;

/// TJ adjustment, in em, from which a gap is reported as a space.
const SPACE_ADJUSTMENT_THRESHOLD: f64 = 0.1;

/// Font properties a text layer needs to lay out items.
#[derive(Debug, Clone, PartialEq)]
pub struct TextStyle {
    pub font_family: String,
    pub ascent: f64,
    pub descent: f64,
    pub vertical: bool,
}

/// One shown string.
#[derive(Debug, Clone, PartialEq)]
pub struct TextItem {
    pub str: String,
    /// `ltr`, `rtl` or `ttb`
    pub dir: &'static str,
    pub width: f64,
    pub height: f64,
    pub transform: [f64; 6],
    pub font_name: String,
    /// The next item starts on a new line
    pub has_eol: bool,
    pub is_whitespace: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TextContent {
    pub items: Vec<TextItem>,
    /// Keyed by font loaded name
    pub styles: BTreeMap<String, TextStyle>,
}

impl TextContent {
    /// All item strings, with a newline after items that end a line.
    pub fn text(&self) -> String {
        let mut text = String::new();
        for item in &self.items {
            text.push_str(&item.str);
            if item.has_eol {
                text.push('\n');
            }
        }
        text
    }

    fn mark_line_break(&mut self) {
        if let Some(last) = self.items.last_mut() {
            last.has_eol = true;
        }
    }
}

#[derive(Debug, Clone)]
struct TextState {
    ctm: [f64; 6],
    text_matrix: [f64; 6],
    text_line_matrix: [f64; 6],
    font: Option<Arc<Font>>,
    font_size: f64,
    char_spacing: f64,
    word_spacing: f64,
    h_scale: f64,
    leading: f64,
    rise: f64,
    render_mode: i64,
}

impl Default for TextState {
    fn default() -> Self {
        TextState {
            ctm: IDENTITY_MATRIX,
            text_matrix: IDENTITY_MATRIX,
            text_line_matrix: IDENTITY_MATRIX,
            font: None,
            font_size: 0.0,
            char_spacing: 0.0,
            word_spacing: 0.0,
            h_scale: 1.0,
            leading: 0.0,
            rise: 0.0,
            render_mode: 0,
        }
    }
}

impl TextState {
    fn move_text(&mut self, tx: f64, ty: f64) {
        self.text_line_matrix = transform(&self.text_line_matrix, &[1.0, 0.0, 0.0, 1.0, tx, ty]);
        self.text_matrix = self.text_line_matrix;
    }

    fn next_line(&mut self) {
        self.move_text(0.0, -self.leading);
    }

    fn advance(&mut self, tx: f64, ty: f64) {
        self.text_matrix = transform(&self.text_matrix, &[1.0, 0.0, 0.0, 1.0, tx, ty]);
    }

    fn rendering_matrix(&self) -> [f64; 6] {
        let font_matrix = [
            self.font_size * self.h_scale,
            0.0,
            0.0,
            self.font_size,
            0.0,
            self.rise,
        ];
        transform(&self.ctm, &transform(&self.text_matrix, &font_matrix))
    }
}

/// Accumulates one TJ/Tj run.
struct TextRun {
    text: String,
    advance: f64,
    start_text_space: [f64; 6],
    start_rendering: [f64; 6],
}

fn number_arg(args: &[PDFObject], index: usize) -> f64 {
    args.get(index).and_then(PDFObject::as_number).unwrap_or(0.0)
}

fn matrix_arg(args: &[PDFObject]) -> Option<[f64; 6]> {
    let values: Vec<f64> = args.iter().map(PDFObject::as_number).collect::<Option<_>>()?;
    <[f64; 6]>::try_from(values).ok()
}

fn text_direction(text: &str, vertical: bool) -> &'static str {
    if vertical {
        return "ttb";
    }
    let rtl = text
        .chars()
        .any(|c| matches!(c as u32, 0x0590..=0x08FF | 0xFB1D..=0xFDFF | 0xFE70..=0xFEFF));
    if rtl { "rtl" } else { "ltr" }
}

impl PartialEvaluator<'_> {
    /// Extracts the text of a content stream.
    pub async fn get_text_content(
        &self,
        content: Vec<u8>,
        task: &WorkerTask,
        scope: &ResourceScope<'_>,
    ) -> PDFResult<TextContent> {
        let mut text_content = TextContent::default();
        self.build_text_content(content, task, scope, TextState::default(), &mut text_content, 0)
            .await?;
        Ok(text_content)
    }

    fn build_text_content<'s>(
        &'s self,
        content: Vec<u8>,
        task: &'s WorkerTask,
        scope: &'s ResourceScope<'s>,
        initial_state: TextState,
        out: &'s mut TextContent,
        depth: usize,
    ) -> BoxFuture<'s, PDFResult<()>> {
        Box::pin(async move {
            task.ensure_not_terminated()?;
            let mut preprocessor = EvaluatorPreprocessor::new(content)?;
            let mut operation = Operation::default();
            let mut state = initial_state;
            let mut state_stack: Vec<TextState> = Vec::new();

            while preprocessor.read(&mut operation)? {
                let args = std::mem::take(&mut operation.args);
                let op = operation.op;
                let result: PDFResult<()> = match op {
                    OpCode::Save => {
                        state_stack.push(state.clone());
                        Ok(())
                    }
                    OpCode::Restore => {
                        if let Some(previous) = state_stack.pop() {
                            state = previous;
                        }
                        Ok(())
                    }
                    OpCode::Transform => {
                        if let Some(matrix) = matrix_arg(&args) {
                            state.ctm = transform(&state.ctm, &matrix);
                        }
                        Ok(())
                    }
                    OpCode::BeginText => {
                        state.text_matrix = IDENTITY_MATRIX;
                        state.text_line_matrix = IDENTITY_MATRIX;
                        Ok(())
                    }
                    OpCode::SetFont => {
                        let name = args.first().and_then(PDFObject::as_name);
                        match retry_on_missing_data!(self.source, self.load_font(scope, name)) {
                            Ok(font) => {
                                self.use_font(&mut state, out, font, number_arg(&args, 1));
                                Ok(())
                            }
                            Err(e) => Err(e),
                        }
                    }
                    OpCode::SetCharSpacing => {
                        state.char_spacing = number_arg(&args, 0);
                        Ok(())
                    }
                    OpCode::SetWordSpacing => {
                        state.word_spacing = number_arg(&args, 0);
                        Ok(())
                    }
                    OpCode::SetHScale => {
                        state.h_scale = number_arg(&args, 0) / 100.0;
                        Ok(())
                    }
                    OpCode::SetLeading => {
                        state.leading = number_arg(&args, 0);
                        Ok(())
                    }
                    OpCode::SetTextRise => {
                        state.rise = number_arg(&args, 0);
                        Ok(())
                    }
                    OpCode::SetTextRenderingMode => {
                        state.render_mode = args.first().and_then(PDFObject::as_integer).unwrap_or(0);
                        Ok(())
                    }
                    OpCode::MoveText | OpCode::SetLeadingMoveText => {
                        let (tx, ty) = (number_arg(&args, 0), number_arg(&args, 1));
                        if op == OpCode::SetLeadingMoveText {
                            state.leading = -ty;
                        }
                        state.move_text(tx, ty);
                        if ty != 0.0 {
                            out.mark_line_break();
                        }
                        Ok(())
                    }
                    OpCode::SetTextMatrix => {
                        if let Some(matrix) = matrix_arg(&args) {
                            if matrix[5] != state.text_line_matrix[5] || matrix[4] < state.text_matrix[4] {
                                out.mark_line_break();
                            }
                            state.text_matrix = matrix;
                            state.text_line_matrix = matrix;
                        }
                        Ok(())
                    }
                    OpCode::NextLine => {
                        state.next_line();
                        out.mark_line_break();
                        Ok(())
                    }
                    OpCode::ShowText => {
                        if let Some(bytes) = args.first().and_then(PDFObject::as_string) {
                            show_text(&mut state, out, &[PDFObject::String(bytes.to_vec())]);
                        }
                        Ok(())
                    }
                    OpCode::ShowSpacedText => {
                        if let Some(items) = args.first().and_then(PDFObject::as_array) {
                            let items: Vec<PDFObject> = items.iter().map(|item| (**item).clone()).collect();
                            show_text(&mut state, out, &items);
                        }
                        Ok(())
                    }
                    OpCode::NextLineShowText | OpCode::NextLineSetSpacingShowText => {
                        if op == OpCode::NextLineSetSpacingShowText {
                            state.word_spacing = number_arg(&args, 0);
                            state.char_spacing = number_arg(&args, 1);
                        }
                        state.next_line();
                        out.mark_line_break();
                        if let Some(bytes) = args.last().and_then(PDFObject::as_string) {
                            show_text(&mut state, out, &[PDFObject::String(bytes.to_vec())]);
                        }
                        Ok(())
                    }
                    OpCode::SetGState => self.text_gstate(&args, scope, &mut state, out).await,
                    OpCode::PaintXObject => self.text_xobject(&args, task, scope, &state, out, depth).await,
                    _ => Ok(()),
                };

                if let Err(err) = result {
                    self.recover_from_error(err, task, op)?;
                }
                task.ensure_not_terminated()?;
            }
            Ok(())
        })
    }

    fn use_font(&self, state: &mut TextState, out: &mut TextContent, font: Arc<Font>, size: f64) {
        out.styles
            .entry(font.loaded_name().to_string())
            .or_insert_with(|| font.text_style());
        state.font = Some(font);
        state.font_size = size;
    }

    async fn text_gstate(
        &self,
        args: &[PDFObject],
        scope: &ResourceScope<'_>,
        state: &mut TextState,
        out: &mut TextContent,
    ) -> PDFResult<()> {
        let Some(name) = args.first().and_then(PDFObject::as_name) else {
            return Ok(());
        };
        let gstate = retry_on_missing_data!(self.source, scope.lookup(self.xref, "ExtGState", name))?;
        let Some(PDFObject::Dictionary(gstate)) = gstate else {
            return Ok(());
        };
        let Some(font) = retry_on_missing_data!(self.source, self.xref.get_resolved(&gstate, "Font"))? else {
            return Ok(());
        };
        let Some(entry) = font.as_array().and_then(|f| f.first()).map(|f| (**f).clone()) else {
            return Ok(());
        };
        let size = font
            .as_array()
            .and_then(|f| f.get(1))
            .and_then(|s| s.as_number())
            .unwrap_or(0.0);
        let loaded = retry_on_missing_data!(self.source, self.load_font_object(&entry))?;
        self.use_font(state, out, loaded, size);
        Ok(())
    }

    async fn text_xobject(
        &self,
        args: &[PDFObject],
        task: &WorkerTask,
        scope: &ResourceScope<'_>,
        state: &TextState,
        out: &mut TextContent,
        depth: usize,
    ) -> PDFResult<()> {
        let Some(name) = args.first().and_then(PDFObject::as_name) else {
            return Ok(());
        };
        let xobject = retry_on_missing_data!(self.source, scope.lookup(self.xref, "XObject", name))?;
        let Some(PDFObject::Stream { dict, data }) = xobject else {
            return Ok(());
        };
        if !dict.get("Subtype").is_some_and(|s| s.is_name("Form")) {
            return Ok(());
        }
        if depth >= self.options.max_form_depth {
            log::warn!("Form XObject nesting exceeds {}; skipping text", self.options.max_form_depth);
            return Ok(());
        }

        let content = retry_on_missing_data!(self.source, self.xref.decode_stream_data(&dict, &data))?;
        let resources = match retry_on_missing_data!(self.source, self.xref.get_resolved(&dict, "Resources"))? {
            Some(PDFObject::Dictionary(resources)) => resources,
            _ => Dict::new(),
        };
        let mut form_state = state.clone();
        if let Some(matrix) = dict
            .get("Matrix")
            .and_then(PDFObject::as_number_array)
            .and_then(|m| <[f64; 6]>::try_from(m).ok())
        {
            form_state.ctm = transform(&form_state.ctm, &matrix);
        }

        let child = scope.child(resources);
        self.build_text_content(content, task, &child, form_state, out, depth + 1)
            .await
    }
}

/// Lays out a Tj string or TJ array as one item and advances the text matrix.
fn show_text(state: &mut TextState, out: &mut TextContent, items: &[PDFObject]) {
    let font = state
        .font
        .clone()
        .unwrap_or_else(|| Arc::new(Font::error_font()));
    let vertical = font.is_vertical();
    let mut run = TextRun {
        text: String::new(),
        advance: 0.0,
        start_text_space: transform(&state.ctm, &state.text_matrix),
        start_rendering: state.rendering_matrix(),
    };

    for item in items {
        match item {
            PDFObject::Number(adjustment) => {
                let em = -adjustment / 1000.0;
                let offset = em * state.font_size;
                if vertical {
                    state.advance(0.0, -offset);
                    run.advance += offset;
                } else {
                    state.advance(offset * state.h_scale, 0.0);
                    run.advance += offset * state.h_scale;
                }
                if em >= SPACE_ADJUSTMENT_THRESHOLD && !run.text.is_empty() && !run.text.ends_with(char::is_whitespace) {
                    run.text.push(' ');
                }
            }
            other => {
                let Some(bytes) = other.as_string() else {
                    continue;
                };
                for glyph in font.chars_to_glyphs(bytes) {
                    run.text.push_str(&glyph.unicode);
                    let spacing = state.char_spacing + if glyph.is_space { state.word_spacing } else { 0.0 };
                    if vertical {
                        let ty = -state.font_size + spacing;
                        state.advance(0.0, ty);
                        run.advance += ty.abs();
                    } else {
                        let tx = (glyph.width * state.font_size + spacing) * state.h_scale;
                        state.advance(tx, 0.0);
                        run.advance += tx;
                    }
                }
            }
        }
    }

    if run.text.is_empty() {
        return;
    }
    let m = run.start_text_space;
    let trm = run.start_rendering;
    let (width, height) = if vertical {
        (trm[0].hypot(trm[1]), run.advance * m[2].hypot(m[3]))
    } else {
        (run.advance * m[0].hypot(m[1]), trm[2].hypot(trm[3]))
    };
    let is_whitespace = run.text.chars().all(char::is_whitespace);
    out.items.push(TextItem {
        dir: text_direction(&run.text, vertical),
        str: run.text,
        width,
        height,
        transform: trm,
        font_name: font.loaded_name().to_string(),
        has_eol: false,
        is_whitespace,
    });
}
