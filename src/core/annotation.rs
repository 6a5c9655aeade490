//! Annotations: typed records built from annotation dictionaries.
//!
//! [`AnnotationFactory::create`] reads the fields every annotation has and
//! dispatches on `/Subtype` for the rest. Appearance streams are evaluated
//! into the page operator list by [`Annotation::get_operator_list`].
//!
//! Based on PDF.js src/core/annotation.js

use super::error::PDFResult;
use super::evaluator::{PartialEvaluator, ResourceScope, numbers};
use super::operator_list::{OpCode, OperatorList};
use super::outline::{LinkAction, parse_link_action};
use super::page::{LocalIdFactory, MAX_INHERITANCE_DEPTH};
use super::parser::{Dict, PDFObject, Ref};
use super::util::{IDENTITY_MATRIX, axial_aligned_bounding_box, normalize_rect, string_to_pdf_string};
use super::worker_task::WorkerTask;
use super::xref::XRef;
use crate::retry_on_missing_data;
use rustc_hash::FxHashSet;

pub mod flags {
    pub const INVISIBLE: u32 = 0x01;
    pub const HIDDEN: u32 = 0x02;
    pub const PRINT: u32 = 0x04;
    pub const NOZOOM: u32 = 0x08;
    pub const NOROTATE: u32 = 0x10;
    pub const NOVIEW: u32 = 0x20;
    pub const READONLY: u32 = 0x40;
    pub const LOCKED: u32 = 0x80;
    pub const TOGGLENOVIEW: u32 = 0x100;
    pub const LOCKEDCONTENTS: u32 = 0x200;
}

/// Widget field flag: the user may not change the value.
const FIELD_READ_ONLY: u32 = 0x1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BorderStyleType {
    #[default]
    Solid,
    Dashed,
    Beveled,
    Inset,
    Underline,
}

impl BorderStyleType {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "S" => Some(BorderStyleType::Solid),
            "D" => Some(BorderStyleType::Dashed),
            "B" => Some(BorderStyleType::Beveled),
            "I" => Some(BorderStyleType::Inset),
            "U" => Some(BorderStyleType::Underline),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnnotationBorderStyle {
    pub width: f64,
    pub style: BorderStyleType,
    pub dash_array: Vec<f64>,
    pub horizontal_corner_radius: f64,
    pub vertical_corner_radius: f64,
}

impl Default for AnnotationBorderStyle {
    fn default() -> Self {
        AnnotationBorderStyle {
            width: 1.0,
            style: BorderStyleType::Solid,
            dash_array: vec![3.0],
            horizontal_corner_radius: 0.0,
            vertical_corner_radius: 0.0,
        }
    }
}

impl AnnotationBorderStyle {
    /// Reads `/BS`, falling back to the older `/Border` array.
    /// Without either the border is invisible.
    fn read(xref: &XRef, dict: &Dict) -> PDFResult<Self> {
        let mut border = AnnotationBorderStyle::default();

        if let Some(PDFObject::Dictionary(bs)) = xref.get_resolved(dict, "BS")? {
            if let Some(width) = xref.get_resolved(&bs, "W")?.and_then(|w| w.as_number()) {
                border.set_width(width);
            }
            if let Some(style) = xref
                .get_resolved(&bs, "S")?
                .and_then(|s| s.as_name().and_then(BorderStyleType::from_name))
            {
                border.style = style;
            }
            if let Some(dash) = xref.get_resolved(&bs, "D")? {
                border.set_dash_array(&dash);
            }
        } else if let Some(PDFObject::Array(items)) = xref.get_resolved(dict, "Border")? {
            let values = items
                .iter()
                .map(|item| xref.fetch_if_ref(item))
                .collect::<PDFResult<Vec<_>>>()?;
            if values.len() >= 3 {
                border.horizontal_corner_radius = values[0].as_number().unwrap_or(0.0);
                border.vertical_corner_radius = values[1].as_number().unwrap_or(0.0);
                border.set_width(values[2].as_number().unwrap_or(1.0));
                if let Some(dash) = values.get(3) {
                    border.set_dash_array(dash);
                    border.style = BorderStyleType::Dashed;
                }
            }
        } else {
            border.width = 0.0;
        }
        Ok(border)
    }

    fn set_width(&mut self, width: f64) {
        self.width = if width.is_finite() && width >= 0.0 { width } else { 1.0 };
    }

    /// A dash array must be non-empty with non-negative entries that are not
    /// all zero; otherwise the border is drawn solid.
    fn set_dash_array(&mut self, dash: &PDFObject) {
        let Some(values) = dash.as_number_array() else {
            return;
        };
        let valid = !values.is_empty()
            && values.iter().all(|v| *v >= 0.0)
            && values.iter().any(|v| *v > 0.0);
        if valid {
            self.dash_array = values;
        } else {
            self.width = 0.0;
        }
    }
}

/// Converts `/C` to RGB. An empty array means transparent.
fn read_color(color: Option<PDFObject>) -> Option<[u8; 3]> {
    let components = color?.as_number_array()?;
    let to_byte = |v: f64| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
    match components.as_slice() {
        [gray] => Some([to_byte(*gray); 3]),
        [r, g, b] => Some([to_byte(*r), to_byte(*g), to_byte(*b)]),
        [c, m, y, k] => Some([
            to_byte((1.0 - c) * (1.0 - k)),
            to_byte((1.0 - m) * (1.0 - k)),
            to_byte((1.0 - y) * (1.0 - k)),
        ]),
        _ => None,
    }
}

/// Subtype specific data.
#[derive(Debug, Clone, PartialEq)]
pub enum AnnotationData {
    Link {
        action: Option<LinkAction>,
    },
    Text {
        name: String,
        open: bool,
    },
    Widget {
        field_type: Option<String>,
        field_name: String,
        field_value: Vec<String>,
        field_flags: u32,
        read_only: bool,
    },
    FreeText,
    Line {
        coords: [f64; 4],
    },
    Square,
    Circle,
    Polygon {
        vertices: Vec<[f64; 2]>,
    },
    PolyLine {
        vertices: Vec<[f64; 2]>,
    },
    Highlight {
        quad_points: Option<Vec<[f64; 8]>>,
    },
    Underline {
        quad_points: Option<Vec<[f64; 8]>>,
    },
    Squiggly {
        quad_points: Option<Vec<[f64; 8]>>,
    },
    StrikeOut {
        quad_points: Option<Vec<[f64; 8]>>,
    },
    Stamp,
    Caret,
    Ink {
        ink_lists: Vec<Vec<[f64; 2]>>,
    },
    FileAttachment {
        filename: Option<String>,
        content: Option<Vec<u8>>,
    },
    /// Subtypes without a renderable representation, such as `Popup`.
    Unsupported {
        subtype: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub id: String,
    pub subtype: String,
    pub rect: [f64; 4],
    pub flags: u32,
    /// The normal appearance stream, already selected by `/AS`.
    pub appearance: Option<PDFObject>,
    pub border_style: AnnotationBorderStyle,
    pub color: Option<[u8; 3]>,
    pub contents: String,
    pub modification_date: Option<String>,
    pub title: Option<String>,
    pub data: AnnotationData,
}

impl Annotation {
    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    pub fn is_viewable(&self) -> bool {
        !self.has_flag(flags::INVISIBLE) && !self.has_flag(flags::HIDDEN) && !self.has_flag(flags::NOVIEW)
    }

    pub fn is_printable(&self) -> bool {
        self.has_flag(flags::PRINT) && !self.has_flag(flags::INVISIBLE) && !self.has_flag(flags::HIDDEN)
    }

    pub fn has_appearance(&self) -> bool {
        self.appearance.is_some()
    }

    /// Evaluates the appearance stream between `beginAnnotation` and
    /// `endAnnotation`.
    ///
    /// The matrix maps the appearance `/BBox`, transformed by `/Matrix`,
    /// onto the annotation rectangle.
    pub async fn get_operator_list(
        &self,
        evaluator: &PartialEvaluator<'_>,
        task: &WorkerTask,
        op_list: &mut OperatorList,
    ) -> PDFResult<()> {
        let Some(PDFObject::Stream { dict, data }) = &self.appearance else {
            return Ok(());
        };
        let xref = evaluator.xref;
        let content = retry_on_missing_data!(evaluator.source, xref.decode_stream_data(dict, data))?;
        let resources = match retry_on_missing_data!(evaluator.source, xref.get_resolved(dict, "Resources"))? {
            Some(PDFObject::Dictionary(resources)) => resources,
            _ => Dict::new(),
        };

        let bbox = dict
            .get("BBox")
            .and_then(|b| b.as_number_array())
            .and_then(|b| <[f64; 4]>::try_from(b).ok())
            .map(normalize_rect)
            .unwrap_or([0.0, 0.0, 1.0, 1.0]);
        let matrix = dict
            .get("Matrix")
            .and_then(|m| m.as_number_array())
            .and_then(|m| <[f64; 6]>::try_from(m).ok())
            .unwrap_or(IDENTITY_MATRIX);
        let transform = transform_matrix(self.rect, bbox, &matrix);

        op_list.add_op(
            OpCode::BeginAnnotation,
            vec![PDFObject::Name(self.id.clone()), numbers(&self.rect), numbers(&transform)],
        );
        let scope = ResourceScope::new(resources);
        let result = evaluator.get_operator_list(content, task, &scope, op_list).await;
        op_list.add_op(OpCode::EndAnnotation, Vec::new());
        result
    }
}

/// Maps the transformed `bbox` onto `rect`.
fn transform_matrix(rect: [f64; 4], bbox: [f64; 4], matrix: &[f64; 6]) -> [f64; 6] {
    let [min_x, min_y, max_x, max_y] = axial_aligned_bounding_box(bbox, matrix);
    if min_x == max_x || min_y == max_y {
        return [1.0, 0.0, 0.0, 1.0, rect[0], rect[1]];
    }
    let x_ratio = (rect[2] - rect[0]) / (max_x - min_x);
    let y_ratio = (rect[3] - rect[1]) / (max_y - min_y);
    [
        x_ratio,
        0.0,
        0.0,
        y_ratio,
        rect[0] - min_x * x_ratio,
        rect[1] - min_y * y_ratio,
    ]
}

pub struct AnnotationFactory;

impl AnnotationFactory {
    /// Builds the annotation for a `/Annots` entry.
    ///
    /// Returns `None` for entries that are not dictionaries and for
    /// subtypes that are never rendered.
    pub fn create(xref: &XRef, entry: &PDFObject, id_factory: &LocalIdFactory) -> PDFResult<Option<Annotation>> {
        let reference = entry.as_ref();
        let PDFObject::Dictionary(dict) = xref.fetch_if_ref(entry)? else {
            return Ok(None);
        };
        let subtype = xref
            .get_resolved(&dict, "Subtype")?
            .and_then(|s| s.as_name().map(str::to_string));

        let data = read_annotation_data(xref, &dict, subtype.as_deref())?;
        if let AnnotationData::Unsupported { subtype } = &data {
            if subtype.as_deref() != Some("Popup") {
                log::warn!(
                    "Unimplemented annotation type \"{}\", falling back to base annotation.",
                    subtype.as_deref().unwrap_or("")
                );
            }
            return Ok(None);
        }

        let id = match reference {
            Some(reference) => reference.to_string(),
            None => format!("annot_{}", id_factory.create_obj_id()),
        };
        let rect = xref
            .get_resolved(&dict, "Rect")?
            .and_then(|r| r.as_number_array())
            .and_then(|r| <[f64; 4]>::try_from(r).ok())
            .map(normalize_rect)
            .unwrap_or([0.0; 4]);
        let flags = xref
            .get_resolved(&dict, "F")?
            .and_then(|f| f.as_integer())
            .map(|f| f as u32)
            .unwrap_or(0);

        Ok(Some(Annotation {
            id,
            subtype: subtype.unwrap_or_default(),
            rect,
            flags,
            appearance: read_appearance(xref, &dict)?,
            border_style: AnnotationBorderStyle::read(xref, &dict)?,
            color: read_color(xref.get_resolved(&dict, "C")?),
            contents: read_text(xref, &dict, "Contents")?.unwrap_or_default(),
            modification_date: read_text(xref, &dict, "M")?,
            title: read_text(xref, &dict, "T")?,
            data,
        }))
    }
}

fn read_text(xref: &XRef, dict: &Dict, key: &str) -> PDFResult<Option<String>> {
    Ok(match xref.get_resolved(dict, key)? {
        Some(PDFObject::String(s)) | Some(PDFObject::HexString(s)) => Some(string_to_pdf_string(&s)),
        _ => None,
    })
}

/// The `/N` appearance, resolving an appearance state dictionary via `/AS`.
fn read_appearance(xref: &XRef, dict: &Dict) -> PDFResult<Option<PDFObject>> {
    let Some(PDFObject::Dictionary(ap)) = xref.get_resolved(dict, "AP")? else {
        return Ok(None);
    };
    match xref.get_resolved(&ap, "N")? {
        Some(stream @ PDFObject::Stream { .. }) => Ok(Some(stream)),
        Some(PDFObject::Dictionary(states)) => {
            let Some(state) = xref.get_resolved(dict, "AS")?.and_then(|s| s.as_name().map(str::to_string)) else {
                return Ok(None);
            };
            match xref.get_resolved(&states, &state)? {
                Some(stream @ PDFObject::Stream { .. }) => Ok(Some(stream)),
                _ => Ok(None),
            }
        }
        _ => Ok(None),
    }
}

fn read_annotation_data(xref: &XRef, dict: &Dict, subtype: Option<&str>) -> PDFResult<AnnotationData> {
    let data = match subtype {
        Some("Link") => AnnotationData::Link {
            action: parse_link_action(xref, dict)?,
        },
        Some("Text") => AnnotationData::Text {
            name: xref
                .get_resolved(dict, "Name")?
                .and_then(|n| n.as_name().map(str::to_string))
                .unwrap_or_else(|| "Note".to_string()),
            open: xref.get_resolved(dict, "Open")?.and_then(|o| o.as_boolean()).unwrap_or(false),
        },
        Some("Widget") => read_widget(xref, dict)?,
        Some("FreeText") => AnnotationData::FreeText,
        Some("Line") => AnnotationData::Line {
            coords: xref
                .get_resolved(dict, "L")?
                .and_then(|l| l.as_number_array())
                .and_then(|l| <[f64; 4]>::try_from(l).ok())
                .unwrap_or([0.0; 4]),
        },
        Some("Square") => AnnotationData::Square,
        Some("Circle") => AnnotationData::Circle,
        Some("Polygon") => AnnotationData::Polygon {
            vertices: read_points(xref.get_resolved(dict, "Vertices")?),
        },
        Some("PolyLine") => AnnotationData::PolyLine {
            vertices: read_points(xref.get_resolved(dict, "Vertices")?),
        },
        Some("Highlight") => AnnotationData::Highlight {
            quad_points: read_quad_points(xref, dict)?,
        },
        Some("Underline") => AnnotationData::Underline {
            quad_points: read_quad_points(xref, dict)?,
        },
        Some("Squiggly") => AnnotationData::Squiggly {
            quad_points: read_quad_points(xref, dict)?,
        },
        Some("StrikeOut") => AnnotationData::StrikeOut {
            quad_points: read_quad_points(xref, dict)?,
        },
        Some("Stamp") => AnnotationData::Stamp,
        Some("Caret") => AnnotationData::Caret,
        Some("Ink") => {
            let mut ink_lists = Vec::new();
            if let Some(PDFObject::Array(lists)) = xref.get_resolved(dict, "InkList")? {
                for list in lists.iter() {
                    ink_lists.push(read_points(Some(xref.fetch_if_ref(list)?)));
                }
            }
            AnnotationData::Ink { ink_lists }
        }
        Some("FileAttachment") => read_file_attachment(xref, dict)?,
        other => AnnotationData::Unsupported {
            subtype: other.map(str::to_string),
        },
    };
    Ok(data)
}

fn read_points(value: Option<PDFObject>) -> Vec<[f64; 2]> {
    value
        .and_then(|v| v.as_number_array())
        .map(|v| v.chunks_exact(2).map(|p| [p[0], p[1]]).collect())
        .unwrap_or_default()
}

/// `/QuadPoints` in groups of eight. Malformed arrays are ignored.
fn read_quad_points(xref: &XRef, dict: &Dict) -> PDFResult<Option<Vec<[f64; 8]>>> {
    let Some(values) = xref.get_resolved(dict, "QuadPoints")?.and_then(|q| q.as_number_array()) else {
        return Ok(None);
    };
    if values.is_empty() || values.len() % 8 != 0 {
        return Ok(None);
    }
    Ok(Some(
        values
            .chunks_exact(8)
            .filter_map(|quad| <[f64; 8]>::try_from(quad).ok())
            .collect(),
    ))
}

/// Walks the field hierarchy from `dict` upwards, yielding each node.
fn field_ancestry(xref: &XRef, dict: &Dict) -> PDFResult<Vec<Dict>> {
    let mut nodes = vec![dict.clone()];
    let mut visited: FxHashSet<Ref> = FxHashSet::default();
    let mut parent = dict.get("Parent").cloned();
    while let Some(entry) = parent.take() {
        if nodes.len() > MAX_INHERITANCE_DEPTH {
            break;
        }
        if let Some(reference) = entry.as_ref()
            && !visited.insert(reference)
        {
            break;
        }
        let PDFObject::Dictionary(node) = xref.fetch_if_ref(&entry)? else {
            break;
        };
        parent = node.get("Parent").cloned();
        nodes.push(node);
    }
    Ok(nodes)
}

fn read_widget(xref: &XRef, dict: &Dict) -> PDFResult<AnnotationData> {
    let ancestry = field_ancestry(xref, dict)?;
    let inherited = |key: &str| -> PDFResult<Option<PDFObject>> {
        for node in &ancestry {
            if let Some(value) = xref.get_resolved(node, key)? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    };

    let field_type = inherited("FT")?.and_then(|t| t.as_name().map(str::to_string));
    let field_flags = inherited("Ff")?.and_then(|f| f.as_integer()).map(|f| f as u32).unwrap_or(0);
    let field_value = match inherited("V")? {
        Some(PDFObject::Array(items)) => {
            let mut values = Vec::with_capacity(items.len());
            for item in items.iter() {
                if let Some(value) = field_value_text(xref.fetch_if_ref(item)?) {
                    values.push(value);
                }
            }
            values
        }
        Some(value) => field_value_text(value).into_iter().collect(),
        None => Vec::new(),
    };

    let mut parts = Vec::new();
    for node in ancestry.iter().rev() {
        if let Some(name) = read_text(xref, node, "T")? {
            parts.push(name);
        }
    }

    Ok(AnnotationData::Widget {
        field_type,
        field_name: parts.join("."),
        field_value,
        field_flags,
        read_only: field_flags & FIELD_READ_ONLY != 0,
    })
}

fn field_value_text(value: PDFObject) -> Option<String> {
    match value {
        PDFObject::String(s) | PDFObject::HexString(s) => Some(string_to_pdf_string(&s)),
        PDFObject::Name(name) => Some(name),
        _ => None,
    }
}

fn read_file_attachment(xref: &XRef, dict: &Dict) -> PDFResult<AnnotationData> {
    let (filename, content) = match xref.get_resolved(dict, "FS")? {
        Some(PDFObject::String(s)) | Some(PDFObject::HexString(s)) => (Some(string_to_pdf_string(&s)), None),
        Some(PDFObject::Dictionary(spec)) => {
            let filename = match read_text(xref, &spec, "UF")? {
                Some(name) => Some(name),
                None => read_text(xref, &spec, "F")?,
            };
            let content = match xref.get_resolved(&spec, "EF")? {
                Some(PDFObject::Dictionary(ef)) => match ef.get("UF").or_else(|| ef.get("F")) {
                    Some(file) => xref.stream_bytes(&xref.fetch_if_ref(file)?)?,
                    None => None,
                },
                _ => None,
            };
            (filename, content)
        }
        _ => (None, None),
    };
    Ok(AnnotationData::FileAttachment { filename, content })
}
