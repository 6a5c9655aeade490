//! Document outline (bookmarks) and link destinations.
//!
//! Based on PDF.js Catalog.readDocumentOutline() and Catalog.parseDestDictionary()

use super::catalog::{Catalog, ExplicitDest};
use super::error::PDFResult;
use super::parser::{Dict, PDFObject, Ref};
use super::util::string_to_pdf_string;
use super::xref::XRef;
use rustc_hash::FxHashSet;
use std::collections::VecDeque;

/// Where a link or outline item points.
#[derive(Debug, Clone, PartialEq)]
pub enum Destination {
    /// `[page /Fit ...]`; the page is a reference or, for remote files, a number.
    Explicit(ExplicitDest),
    /// A key into the document's named destinations.
    Named(String),
}

impl Destination {
    /// The page reference of an explicit destination.
    pub fn page_ref(&self) -> Option<Ref> {
        match self {
            Destination::Explicit(dest) => dest.first().and_then(|page| page.as_ref()),
            Destination::Named(_) => None,
        }
    }
}

/// The action attached to a link annotation or outline item.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkAction {
    GoTo(Destination),
    Uri(String),
    /// Go to a destination in another file.
    GoToR {
        url: Option<String>,
        dest: Option<Destination>,
        new_window: Option<bool>,
    },
    Launch {
        url: Option<String>,
        new_window: Option<bool>,
    },
    /// Viewer actions such as `NextPage`.
    Named(String),
}

impl LinkAction {
    /// The URL a viewer would open, if any.
    pub fn url(&self) -> Option<&str> {
        match self {
            LinkAction::Uri(url) => Some(url),
            LinkAction::GoToR { url, .. } | LinkAction::Launch { url, .. } => url.as_deref(),
            _ => None,
        }
    }

    pub fn dest(&self) -> Option<&Destination> {
        match self {
            LinkAction::GoTo(dest) => Some(dest),
            LinkAction::GoToR { dest, .. } => dest.as_ref(),
            _ => None,
        }
    }

    pub fn new_window(&self) -> Option<bool> {
        match self {
            LinkAction::GoToR { new_window, .. } | LinkAction::Launch { new_window, .. } => *new_window,
            _ => None,
        }
    }
}

/// One bookmark and its children.
#[derive(Debug, Clone, PartialEq)]
pub struct OutlineItem {
    pub title: String,
    pub dest: Option<Destination>,
    /// Page index of an explicit destination, when it could be resolved.
    pub page_index: Option<usize>,
    pub url: Option<String>,
    pub new_window: Option<bool>,
    /// Named viewer action.
    pub action: Option<String>,
    pub color: [u8; 3],
    pub bold: bool,
    pub italic: bool,
    pub count: Option<i64>,
    pub items: Vec<OutlineItem>,
}

/// Checks the shape of an explicit destination array.
pub fn is_valid_explicit_dest(dest: &[PDFObject]) -> bool {
    let [page, zoom, args @ ..] = dest else {
        return false;
    };
    if !matches!(page, PDFObject::Ref(_)) && page.as_integer().is_none() {
        return false;
    }
    let Some(zoom) = zoom.as_name() else {
        return false;
    };

    let allow_null = match zoom {
        "XYZ" if (2..=3).contains(&args.len()) => true,
        "Fit" | "FitB" => return args.is_empty(),
        "FitH" | "FitBH" | "FitV" | "FitBV" if args.len() <= 1 => true,
        "FitR" if args.len() == 4 => false,
        _ => return false,
    };
    args.iter()
        .all(|arg| matches!(arg, PDFObject::Number(_)) || (allow_null && arg.is_null()))
}

fn to_destination(value: PDFObject) -> Option<Destination> {
    match value {
        PDFObject::Name(name) => Some(Destination::Named(name)),
        PDFObject::String(s) | PDFObject::HexString(s) => Some(Destination::Named(string_to_pdf_string(&s))),
        PDFObject::Array(items) => {
            let dest: ExplicitDest = items.into_iter().map(|item| *item).collect();
            is_valid_explicit_dest(&dest).then_some(Destination::Explicit(dest))
        }
        _ => None,
    }
}

fn file_spec_url(xref: &XRef, value: Option<PDFObject>) -> PDFResult<Option<String>> {
    Ok(match value {
        Some(PDFObject::Dictionary(spec)) => match xref.get_resolved(&spec, "F")? {
            Some(PDFObject::String(s)) | Some(PDFObject::HexString(s)) => Some(string_to_pdf_string(&s)),
            _ => None,
        },
        Some(PDFObject::String(s)) | Some(PDFObject::HexString(s)) => Some(string_to_pdf_string(&s)),
        _ => None,
    })
}

/// Reads the action or destination of a link annotation or outline item.
///
/// Looks at `/A` first, then `/Dest`, then the `/AA` additional actions.
pub fn parse_link_action(xref: &XRef, dest_dict: &Dict) -> PDFResult<Option<LinkAction>> {
    let mut action = xref.get_resolved(dest_dict, "A")?;
    if !matches!(action, Some(PDFObject::Dictionary(_))) {
        if dest_dict.contains_key("Dest") {
            action = None;
        } else if let Some(PDFObject::Dictionary(additional)) = xref.get_resolved(dest_dict, "AA")? {
            action = match additional.get("D").or_else(|| additional.get("U")) {
                Some(value) => Some(xref.fetch_if_ref(value)?),
                None => None,
            };
        }
    }

    let Some(PDFObject::Dictionary(action)) = action else {
        return Ok(match xref.get_resolved(dest_dict, "Dest")? {
            Some(dest) => to_destination(dest).map(LinkAction::GoTo),
            None => None,
        });
    };

    let Some(action_type) = xref.get_resolved(&action, "S")?.and_then(|s| s.as_name().map(str::to_string)) else {
        log::warn!("parseDestDictionary: invalid type in Action dictionary.");
        return Ok(None);
    };

    let parsed = match action_type.as_str() {
        "URI" => match xref.get_resolved(&action, "URI")? {
            Some(PDFObject::String(s)) | Some(PDFObject::HexString(s)) => {
                Some(LinkAction::Uri(String::from_utf8_lossy(&s).into_owned()))
            }
            // Some writers store the URI as a name
            Some(PDFObject::Name(name)) => Some(LinkAction::Uri(format!("/{}", name))),
            _ => None,
        },
        "GoTo" => xref
            .get_resolved(&action, "D")?
            .and_then(to_destination)
            .map(LinkAction::GoTo),
        "GoToR" | "Launch" => {
            let mut url = file_spec_url(xref, xref.get_resolved(&action, "F")?)?;
            let remote_dest = xref.get_resolved(&action, "D")?.and_then(to_destination);
            if let (Some(base), Some(Destination::Named(name))) = (url.as_mut(), remote_dest.as_ref()) {
                let trimmed = base.split('#').next().unwrap_or_default().to_string();
                *base = format!("{}#{}", trimmed, name);
            }
            let new_window = xref.get_resolved(&action, "NewWindow")?.and_then(|n| n.as_boolean());
            if action_type == "GoToR" {
                Some(LinkAction::GoToR { url, dest: remote_dest, new_window })
            } else {
                Some(LinkAction::Launch { url, new_window })
            }
        }
        "Named" => xref
            .get_resolved(&action, "N")?
            .and_then(|n| n.as_name().map(|n| LinkAction::Named(n.to_string()))),
        other => {
            log::warn!("parseDestDictionary - unsupported action: \"{}\".", other);
            None
        }
    };
    Ok(parsed)
}

/// Converts a `/C` entry with three components in 0..=1 to RGB bytes.
fn outline_color(color: Option<PDFObject>) -> [u8; 3] {
    let components = color.and_then(|c| c.as_number_array()).filter(|c| {
        c.len() == 3 && c.iter().all(|v| (0.0..=1.0).contains(v))
    });
    match components {
        Some(c) => [
            (c[0] * 255.0).round() as u8,
            (c[1] * 255.0).round() as u8,
            (c[2] * 255.0).round() as u8,
        ],
        None => [0, 0, 0],
    }
}

/// Walks `/Outlines` breadth-first, following `/First` and `/Next`.
///
/// Items visited twice are skipped, so cyclic outlines terminate.
pub fn parse_document_outline(xref: &XRef, catalog: &Catalog) -> PDFResult<Option<Vec<OutlineItem>>> {
    let Some(PDFObject::Dictionary(outlines)) = xref.get_resolved(catalog.dict(), "Outlines")? else {
        return Ok(None);
    };
    let Some(PDFObject::Ref(first)) = outlines.get("First") else {
        return Ok(None);
    };

    // Flat arena; `parent` indexes into it, None is the root
    let mut arena: Vec<(Option<usize>, OutlineItem)> = Vec::new();
    let mut processed = FxHashSet::default();
    processed.insert(*first);
    let mut queue = VecDeque::from([(*first, None::<usize>)]);

    while let Some((item_ref, parent)) = queue.pop_front() {
        let item = xref.fetch(item_ref)?;
        let Some(item_dict) = item.as_dictionary() else {
            continue;
        };
        if !item_dict.contains_key("Title") {
            log::warn!("Invalid outline item encountered.");
        }

        let action = parse_link_action(xref, item_dict)?;
        let dest = action.as_ref().and_then(|a| a.dest().cloned());
        let page_index = match dest.as_ref() {
            Some(Destination::Explicit(explicit)) => match explicit.first() {
                Some(PDFObject::Ref(page_ref)) if matches!(action, Some(LinkAction::GoTo(_))) => {
                    match catalog.get_page_index(xref, *page_ref) {
                        Ok(index) => Some(index),
                        Err(e) if e.is_fatal_for_recovery() => return Err(e),
                        Err(_) => None,
                    }
                }
                Some(page) => page.as_integer().filter(|&n| n >= 0).map(|n| n as usize),
                None => None,
            },
            _ => None,
        };

        let title = match xref.get_resolved(item_dict, "Title")? {
            Some(PDFObject::String(s)) | Some(PDFObject::HexString(s)) => string_to_pdf_string(&s),
            _ => String::new(),
        };
        let flags = xref.get_resolved(item_dict, "F")?.and_then(|f| f.as_integer()).unwrap_or(0);

        let outline_item = OutlineItem {
            title,
            url: action.as_ref().and_then(|a| a.url().map(str::to_string)),
            new_window: action.as_ref().and_then(LinkAction::new_window),
            action: match &action {
                Some(LinkAction::Named(name)) => Some(name.clone()),
                _ => None,
            },
            dest,
            page_index,
            color: outline_color(xref.get_resolved(item_dict, "C")?),
            bold: flags & 2 != 0,
            italic: flags & 1 != 0,
            count: xref.get_resolved(item_dict, "Count")?.and_then(|c| c.as_integer()),
            items: Vec::new(),
        };
        let index = arena.len();
        arena.push((parent, outline_item));

        if let Some(PDFObject::Ref(child)) = item_dict.get("First")
            && processed.insert(*child)
        {
            queue.push_back((*child, Some(index)));
        }
        if let Some(PDFObject::Ref(next)) = item_dict.get("Next")
            && processed.insert(*next)
        {
            queue.push_back((*next, parent));
        }
    }

    if arena.is_empty() {
        return Ok(None);
    }

    // Children always come after their parent, so fold from the back
    let mut children: Vec<Vec<OutlineItem>> = vec![Vec::new(); arena.len()];
    let mut roots = Vec::new();
    for (index, (parent, mut item)) in arena.into_iter().enumerate().rev() {
        item.items = std::mem::take(&mut children[index]);
        item.items.reverse();
        match parent {
            Some(parent) => children[parent].push(item),
            None => roots.push(item),
        }
    }
    roots.reverse();
    Ok(Some(roots))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn num(n: f64) -> PDFObject {
        PDFObject::Number(n)
    }

    fn name(n: &str) -> PDFObject {
        PDFObject::Name(n.to_string())
    }

    #[test]
    fn test_explicit_dest_validation() {
        let page = PDFObject::Ref(Ref::new(3, 0));
        assert!(is_valid_explicit_dest(&[page.clone(), name("XYZ"), num(0.0), num(792.0), PDFObject::Null]));
        assert!(is_valid_explicit_dest(&[page.clone(), name("Fit")]));
        assert!(!is_valid_explicit_dest(&[page.clone(), name("Fit"), num(1.0)]));
        assert!(is_valid_explicit_dest(&[num(0.0), name("FitH"), num(10.0)]));
        assert!(!is_valid_explicit_dest(&[page.clone(), name("FitR"), num(0.0), PDFObject::Null, num(1.0), num(1.0)]));
        assert!(!is_valid_explicit_dest(&[page, name("Zoom")]));
        assert!(!is_valid_explicit_dest(&[name("Fit")]));
    }

    #[test]
    fn test_outline_color() {
        assert_eq!(outline_color(Some(PDFObject::array([num(1.0), num(0.0), num(0.5)]))), [255, 0, 128]);
        assert_eq!(outline_color(Some(PDFObject::array([num(2.0), num(0.0), num(0.0)]))), [0, 0, 0]);
        assert_eq!(outline_color(None), [0, 0, 0]);
    }

    #[test]
    fn test_link_action_url() {
        let action = LinkAction::GoToR {
            url: Some("other.pdf#chapter".to_string()),
            dest: Some(Destination::Named("chapter".to_string())),
            new_window: Some(true),
        };
        assert_eq!(action.url(), Some("other.pdf#chapter"));
        assert_eq!(action.new_window(), Some(true));
        assert_eq!(action.dest(), Some(&Destination::Named("chapter".to_string())));
    }
}
