use super::annotation::{Annotation, AnnotationFactory};
use super::error::PDFResult;
use super::evaluator::{EvaluatorOptions, PartialEvaluator, ResourceScope};
use super::font::FontCache;
use super::operator_list::{OpCode, OperatorList, OperatorListChunk};
use super::parser::{Dict, PDFObject, Ref};
use super::retry::DataSource;
use super::text_content::TextContent;
use super::util::{normalize_rect, normalize_rotation};
use super::worker_task::WorkerTask;
use super::xref::XRef;
use crate::retry_on_missing_data;
use rustc_hash::FxHashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;

/// Longest `/Parent` chain followed for inherited attributes.
pub const MAX_INHERITANCE_DEPTH: usize = 100;

/// US Letter, used when a page has no usable MediaBox.
pub const LETTER_SIZE_MEDIABOX: [f64; 4] = [0.0, 0.0, 612.0, 792.0];

/// Generates object ids unique within one page: `p{page_index}_{n}`.
#[derive(Debug)]
pub struct LocalIdFactory {
    page_index: usize,
    obj_counter: AtomicU32,
}

impl LocalIdFactory {
    pub fn new(page_index: usize) -> Self {
        LocalIdFactory {
            page_index,
            obj_counter: AtomicU32::new(0),
        }
    }

    pub fn create_obj_id(&self) -> String {
        let n = self.obj_counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("p{}_{}", self.page_index, n)
    }
}

/// Which annotations a rendering includes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderingIntent {
    #[default]
    Display,
    Print,
    Any,
}

impl RenderingIntent {
    pub fn includes(&self, annotation: &Annotation) -> bool {
        match self {
            RenderingIntent::Display => annotation.is_viewable(),
            RenderingIntent::Print => annotation.is_printable(),
            RenderingIntent::Any => true,
        }
    }
}

/// Geometry of a page as reported to viewers.
#[derive(Debug, Clone, PartialEq)]
pub struct PageInfo {
    pub page_index: usize,
    pub reference: Option<Ref>,
    pub view: [f64; 4],
    pub rotate: i32,
    pub user_unit: f64,
}

/// A single page in a PDF document.
///
/// Inheritable attributes (`Resources`, `MediaBox`, `CropBox`, `Rotate`) are
/// resolved through the `/Parent` chain and memoized; the page dictionary is
/// immutable, so memoized values never go stale.
///
/// Based on PDF.js src/core/document.js Page
pub struct Page {
    page_index: usize,
    page_dict: Dict,
    page_ref: Option<Ref>,
    doc_id: u32,
    font_cache: Arc<FontCache>,
    id_factory: LocalIdFactory,

    media_box: OnceLock<[f64; 4]>,
    crop_box: OnceLock<[f64; 4]>,
    view: OnceLock<[f64; 4]>,
    rotate: OnceLock<i32>,
    resources: OnceLock<Dict>,
}

impl Page {
    pub fn new(
        page_index: usize,
        page_dict: Dict,
        page_ref: Option<Ref>,
        doc_id: u32,
        font_cache: Arc<FontCache>,
    ) -> Self {
        Page {
            page_index,
            page_dict,
            page_ref,
            doc_id,
            font_cache,
            id_factory: LocalIdFactory::new(page_index),
            media_box: OnceLock::new(),
            crop_box: OnceLock::new(),
            view: OnceLock::new(),
            rotate: OnceLock::new(),
            resources: OnceLock::new(),
        }
    }

    pub fn page_index(&self) -> usize {
        self.page_index
    }

    pub fn page_ref(&self) -> Option<Ref> {
        self.page_ref
    }

    pub fn dict(&self) -> &Dict {
        &self.page_dict
    }

    pub fn id_factory(&self) -> &LocalIdFactory {
        &self.id_factory
    }

    /// Looks up `key` on the page and its ancestors.
    ///
    /// When more than one level defines a dictionary value, the
    /// dictionaries are merged and the nearest definition of each key wins.
    /// Otherwise the nearest value is returned.
    pub fn get_inherited_prop(&self, xref: &XRef, key: &str) -> PDFResult<Option<PDFObject>> {
        let mut values: Vec<PDFObject> = Vec::new();
        let mut visited: FxHashSet<Ref> = self.page_ref.into_iter().collect();
        let mut ancestor: Option<Arc<PDFObject>> = None;

        for _ in 0..MAX_INHERITANCE_DEPTH {
            let node = match &ancestor {
                None => &self.page_dict,
                Some(obj) => match obj.as_dictionary() {
                    Some(dict) => dict,
                    None => break,
                },
            };
            if let Some(value) = xref.get_resolved(node, key)? {
                values.push(value);
            }
            ancestor = match node.get("Parent") {
                Some(PDFObject::Ref(parent)) => {
                    if !visited.insert(*parent) {
                        log::warn!("Loop in the /Parent chain of page {}", self.page_index);
                        break;
                    }
                    Some(xref.fetch(*parent)?)
                }
                Some(PDFObject::Dictionary(parent)) => Some(Arc::new(PDFObject::Dictionary(parent.clone()))),
                _ => break,
            };
        }

        if values.len() <= 1 || !matches!(values[0], PDFObject::Dictionary(_)) {
            return Ok(values.into_iter().next());
        }
        let mut merged = Dict::new();
        for value in values {
            if let PDFObject::Dictionary(dict) = value {
                for (k, v) in dict {
                    merged.entry(k).or_insert(v);
                }
            }
        }
        Ok(Some(PDFObject::Dictionary(merged)))
    }

    fn get_box(&self, xref: &XRef, key: &str) -> PDFResult<Option<[f64; 4]>> {
        let Some(PDFObject::Array(items)) = self.get_inherited_prop(xref, key)? else {
            return Ok(None);
        };
        let mut numbers = Vec::with_capacity(4);
        for item in items.iter() {
            match xref.fetch_if_ref(item)?.as_number() {
                Some(n) => numbers.push(n),
                None => break,
            }
        }
        let Ok(rect) = <[f64; 4]>::try_from(numbers) else {
            log::warn!("Invalid /{} entry.", key);
            return Ok(None);
        };
        let rect = normalize_rect(rect);
        if rect[2] - rect[0] > 0.0 && rect[3] - rect[1] > 0.0 {
            Ok(Some(rect))
        } else {
            log::warn!("Empty, or invalid, /{} entry.", key);
            Ok(None)
        }
    }

    pub fn media_box(&self, xref: &XRef) -> PDFResult<[f64; 4]> {
        if let Some(media_box) = self.media_box.get() {
            return Ok(*media_box);
        }
        let media_box = self.get_box(xref, "MediaBox")?.unwrap_or(LETTER_SIZE_MEDIABOX);
        Ok(*self.media_box.get_or_init(|| media_box))
    }

    pub fn crop_box(&self, xref: &XRef) -> PDFResult<[f64; 4]> {
        if let Some(crop_box) = self.crop_box.get() {
            return Ok(*crop_box);
        }
        let crop_box = match self.get_box(xref, "CropBox")? {
            Some(crop_box) => crop_box,
            None => self.media_box(xref)?,
        };
        Ok(*self.crop_box.get_or_init(|| crop_box))
    }

    /// The visible area: CropBox clipped to MediaBox.
    pub fn view(&self, xref: &XRef) -> PDFResult<[f64; 4]> {
        if let Some(view) = self.view.get() {
            return Ok(*view);
        }
        let media_box = self.media_box(xref)?;
        let crop_box = self.crop_box(xref)?;
        let view = if crop_box == media_box {
            media_box
        } else {
            let intersection = [
                crop_box[0].max(media_box[0]),
                crop_box[1].max(media_box[1]),
                crop_box[2].min(media_box[2]),
                crop_box[3].min(media_box[3]),
            ];
            if intersection[2] > intersection[0] && intersection[3] > intersection[1] {
                intersection
            } else {
                log::warn!("Empty /CropBox and /MediaBox intersection.");
                media_box
            }
        };
        Ok(*self.view.get_or_init(|| view))
    }

    pub fn rotate(&self, xref: &XRef) -> PDFResult<i32> {
        if let Some(rotate) = self.rotate.get() {
            return Ok(*rotate);
        }
        let rotate = self
            .get_inherited_prop(xref, "Rotate")?
            .and_then(|r| r.as_integer())
            .map(normalize_rotation)
            .unwrap_or(0);
        Ok(*self.rotate.get_or_init(|| rotate))
    }

    pub fn user_unit(&self, xref: &XRef) -> PDFResult<f64> {
        Ok(xref
            .get_resolved(&self.page_dict, "UserUnit")?
            .and_then(|u| u.as_number())
            .filter(|u| *u > 0.0)
            .unwrap_or(1.0))
    }

    /// The page resources, merged along the `/Parent` chain.
    pub fn resources(&self, xref: &XRef) -> PDFResult<&Dict> {
        if let Some(resources) = self.resources.get() {
            return Ok(resources);
        }
        let resources = match self.get_inherited_prop(xref, "Resources")? {
            Some(PDFObject::Dictionary(resources)) => resources,
            _ => Dict::new(),
        };
        Ok(self.resources.get_or_init(|| resources))
    }

    pub fn info(&self, xref: &XRef) -> PDFResult<PageInfo> {
        Ok(PageInfo {
            page_index: self.page_index,
            reference: self.page_ref,
            view: self.view(xref)?,
            rotate: self.rotate(xref)?,
            user_unit: self.user_unit(xref)?,
        })
    }

    /// The decoded page content. Arrays of streams are joined with newlines.
    pub fn get_content_stream(&self, xref: &XRef) -> PDFResult<Vec<u8>> {
        let streams = match xref.get_resolved(&self.page_dict, "Contents")? {
            Some(stream @ PDFObject::Stream { .. }) => vec![stream],
            Some(PDFObject::Array(items)) => items
                .iter()
                .map(|item| xref.fetch_if_ref(item))
                .collect::<PDFResult<Vec<_>>>()?,
            _ => Vec::new(),
        };

        let mut content = Vec::new();
        for (i, stream) in streams.iter().enumerate() {
            let data = match xref.stream_bytes(stream) {
                Ok(Some(data)) => data,
                Ok(None) => {
                    log::warn!("Page {}: /Contents entry {} is not a stream", self.page_index, i);
                    continue;
                }
                Err(e) if e.is_fatal_for_recovery() => return Err(e),
                Err(e) => {
                    log::warn!("Page {}: unable to decode content stream {}: {}", self.page_index, i, e);
                    continue;
                }
            };
            if i > 0 {
                content.push(b'\n');
            }
            content.extend_from_slice(&data);
        }
        Ok(content)
    }

    /// Builds every annotation of the page. Broken annotations are skipped.
    pub fn get_annotations(&self, xref: &XRef) -> PDFResult<Vec<Annotation>> {
        let Some(PDFObject::Array(annots)) = xref.get_resolved(&self.page_dict, "Annots")? else {
            return Ok(Vec::new());
        };
        let mut annotations = Vec::with_capacity(annots.len());
        for annot in annots.iter() {
            match AnnotationFactory::create(xref, annot, &self.id_factory) {
                Ok(Some(annotation)) => annotations.push(annotation),
                Ok(None) => {}
                Err(e) if e.is_fatal_for_recovery() => return Err(e),
                Err(e) => log::warn!("getAnnotations: {}", e),
            }
        }
        Ok(annotations)
    }

    fn evaluator<'a>(&'a self, xref: &'a XRef, source: &DataSource, options: EvaluatorOptions) -> PartialEvaluator<'a> {
        PartialEvaluator::new(
            xref,
            source.clone(),
            self.page_index,
            &self.id_factory,
            &self.font_cache,
            self.doc_id,
            options,
        )
    }

    /// Evaluates the page content followed by the annotation appearances
    /// selected by `intent`.
    ///
    /// With a sink, chunks are sent as they fill up and the final one is
    /// flagged `last_chunk`; the returned list then holds only what was not
    /// flushed.
    pub async fn get_operator_list(
        &self,
        xref: &XRef,
        source: &DataSource,
        task: &WorkerTask,
        intent: RenderingIntent,
        options: EvaluatorOptions,
        sink: Option<mpsc::Sender<OperatorListChunk>>,
    ) -> PDFResult<OperatorList> {
        let content = retry_on_missing_data!(source, self.get_content_stream(xref))?;
        let resources = retry_on_missing_data!(source, self.resources(xref))?.clone();
        let annotations = retry_on_missing_data!(source, self.get_annotations(xref))?;
        task.ensure_not_terminated()?;

        let evaluator = self.evaluator(xref, source, options);
        let mut op_list = OperatorList::new(sink, Some(options.flush_threshold));
        let scope = ResourceScope::new(resources);
        evaluator
            .get_operator_list(content, task, &scope, &mut op_list)
            .await?;

        let annotations: Vec<&Annotation> = annotations
            .iter()
            .filter(|annotation| intent.includes(annotation) && annotation.has_appearance())
            .collect();
        if !annotations.is_empty() {
            op_list.add_op(OpCode::BeginAnnotations, Vec::new());
            for annotation in annotations {
                if let Err(err) = annotation.get_operator_list(&evaluator, task, &mut op_list).await {
                    evaluator.recover_from_error(err, task, OpCode::BeginAnnotation)?;
                }
            }
            op_list.add_op(OpCode::EndAnnotations, Vec::new());
        }

        task.ensure_not_terminated()?;
        op_list.flush(true).await?;
        Ok(op_list)
    }

    pub async fn get_text_content(
        &self,
        xref: &XRef,
        source: &DataSource,
        task: &WorkerTask,
        options: EvaluatorOptions,
    ) -> PDFResult<TextContent> {
        let content = retry_on_missing_data!(source, self.get_content_stream(xref))?;
        let resources = retry_on_missing_data!(source, self.resources(xref))?.clone();
        task.ensure_not_terminated()?;

        let evaluator = self.evaluator(xref, source, options);
        let scope = ResourceScope::new(resources);
        evaluator.get_text_content(content, task, &scope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::stream::Stream;

    fn page_with(entries: Vec<(&str, PDFObject)>) -> Page {
        let dict: Dict = entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect();
        Page::new(0, dict, None, 0, Arc::new(FontCache::new()))
    }

    fn empty_xref() -> XRef {
        XRef::new(Box::new(Stream::from_bytes(Vec::new())), None)
    }

    fn numbers(values: &[f64]) -> PDFObject {
        PDFObject::array(values.iter().map(|v| PDFObject::Number(*v)))
    }

    fn dict(entries: Vec<(&str, PDFObject)>) -> PDFObject {
        PDFObject::Dictionary(entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    }

    #[test]
    fn test_local_ids_are_prefixed_by_page() {
        let factory = LocalIdFactory::new(3);
        assert_eq!(factory.create_obj_id(), "p3_1");
        assert_eq!(factory.create_obj_id(), "p3_2");
    }

    #[test]
    fn test_default_media_box() {
        let xref = empty_xref();
        let page = page_with(vec![]);
        assert_eq!(page.media_box(&xref).unwrap(), LETTER_SIZE_MEDIABOX);
        assert_eq!(page.view(&xref).unwrap(), LETTER_SIZE_MEDIABOX);
        assert_eq!(page.rotate(&xref).unwrap(), 0);
    }

    #[test]
    fn test_boxes_are_normalized_and_intersected() {
        let xref = empty_xref();
        let page = page_with(vec![
            ("MediaBox", numbers(&[200.0, 300.0, 0.0, 0.0])),
            ("CropBox", numbers(&[-10.0, 50.0, 100.0, 400.0])),
        ]);
        assert_eq!(page.media_box(&xref).unwrap(), [0.0, 0.0, 200.0, 300.0]);
        assert_eq!(page.crop_box(&xref).unwrap(), [-10.0, 50.0, 100.0, 400.0]);
        assert_eq!(page.view(&xref).unwrap(), [0.0, 50.0, 100.0, 300.0]);
    }

    #[test]
    fn test_empty_media_box_falls_back() {
        let xref = empty_xref();
        let page = page_with(vec![("MediaBox", numbers(&[0.0, 0.0, 0.0, 100.0]))]);
        assert_eq!(page.media_box(&xref).unwrap(), LETTER_SIZE_MEDIABOX);
    }

    #[test]
    fn test_rotation_from_parent() {
        let xref = empty_xref();
        let parent = dict(vec![("Rotate", PDFObject::Number(-90.0))]);
        let page = page_with(vec![("Parent", parent)]);
        assert_eq!(page.rotate(&xref).unwrap(), 270);
    }

    #[test]
    fn test_inherited_resources_are_merged() {
        let xref = empty_xref();
        let grandparent = dict(vec![(
            "Resources",
            dict(vec![
                ("Font", dict(vec![("F1", PDFObject::Name("grandparent".into()))])),
                ("XObject", dict(vec![])),
            ]),
        )]);
        let parent = dict(vec![
            ("Parent", grandparent),
            (
                "Resources",
                dict(vec![
                    ("Font", dict(vec![("F2", PDFObject::Name("parent".into()))])),
                    ("ProcSet", PDFObject::array([PDFObject::Name("PDF".into())])),
                ]),
            ),
        ]);
        let page = page_with(vec![("Parent", parent)]);

        let resources = page.resources(&xref).unwrap();
        assert!(resources.contains_key("XObject"));
        assert!(resources.contains_key("ProcSet"));
        let fonts = resources["Font"].as_dictionary().unwrap();
        assert!(fonts.contains_key("F2"));
        assert!(!fonts.contains_key("F1"));
    }

    #[test]
    fn test_nearest_non_dictionary_value_wins() {
        let xref = empty_xref();
        let parent = dict(vec![("Rotate", PDFObject::Number(90.0))]);
        let page = page_with(vec![("Parent", parent), ("Rotate", PDFObject::Number(180.0))]);
        assert_eq!(page.rotate(&xref).unwrap(), 180);
    }
}
