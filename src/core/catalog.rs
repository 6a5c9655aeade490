//! The document catalog: page tree, destinations, metadata and forms.
//!
//! Based on PDF.js src/core/catalog.js and src/core/name_number_tree.js

use super::error::{PDFError, PDFResult};
use super::outline::{parse_document_outline, OutlineItem};
use super::parser::{Dict, PDFObject, Ref};
use super::util::string_to_pdf_string;
use super::xref::XRef;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

/// Levels of `/Kids` a name tree lookup descends before giving up.
const MAX_NAME_TREE_LEVELS: usize = 10;

/// An explicit destination array, e.g. `[3 0 R /XYZ 0 792 null]`.
pub type ExplicitDest = Vec<PDFObject>;

fn lock<T>(cache: &Mutex<T>) -> PDFResult<MutexGuard<'_, T>> {
    cache
        .lock()
        .map_err(|_| PDFError::StreamError("Failed to lock catalog cache (mutex poisoned)".to_string()))
}

/// A node still to be visited while walking the page tree.
enum PageNode {
    Ref(Ref),
    Tree { dict: Dict, reference: Option<Ref> },
}

/// The document catalog (`/Root`).
///
/// Lookups take the document's [`XRef`] explicitly; the catalog only keeps
/// the root dictionaries and page tree caches.
pub struct Catalog {
    cat_dict: Dict,
    toplevel_pages: Dict,
    pages_ref: Option<Ref>,
    page_kids_count_cache: Mutex<FxHashMap<Ref, usize>>,
    page_index_cache: Mutex<FxHashMap<Ref, usize>>,
}

impl Catalog {
    /// Reads the catalog from a parsed cross-reference table.
    pub fn new(xref: &XRef) -> PDFResult<Self> {
        let cat_dict = xref
            .root()
            .cloned()
            .ok_or_else(|| PDFError::format_error("Catalog object is not a dictionary."))?;
        let pages_ref = cat_dict.get("Pages").and_then(|p| p.as_ref());
        let toplevel_pages = match xref.get_resolved(&cat_dict, "Pages")? {
            Some(PDFObject::Dictionary(dict)) => dict,
            _ => return Err(PDFError::format_error("Invalid top-level pages dictionary.")),
        };

        Ok(Catalog {
            cat_dict,
            toplevel_pages,
            pages_ref,
            page_kids_count_cache: Mutex::new(FxHashMap::default()),
            page_index_cache: Mutex::new(FxHashMap::default()),
        })
    }

    /// The raw catalog dictionary.
    pub fn dict(&self) -> &Dict {
        &self.cat_dict
    }

    pub fn toplevel_pages(&self) -> &Dict {
        &self.toplevel_pages
    }

    /// `/Count` of the top-level pages node.
    pub fn num_pages(&self, xref: &XRef) -> PDFResult<usize> {
        match xref.get_resolved(&self.toplevel_pages, "Count")?.and_then(|c| c.as_integer()) {
            Some(count) if count >= 0 => Ok(count as usize),
            _ => Err(PDFError::format_error(
                "Page count in top-level pages dictionary is not an integer.",
            )),
        }
    }

    /// The document language (`/Lang`).
    pub fn lang(&self, xref: &XRef) -> PDFResult<Option<String>> {
        Ok(match xref.get_resolved(&self.cat_dict, "Lang")? {
            Some(PDFObject::String(s)) | Some(PDFObject::HexString(s)) => Some(string_to_pdf_string(&s)),
            _ => None,
        })
    }

    /// True when the catalog declares a portable collection.
    pub fn has_collection(&self, xref: &XRef) -> PDFResult<bool> {
        Ok(matches!(
            xref.get_resolved(&self.cat_dict, "Collection")?,
            Some(PDFObject::Dictionary(_))
        ))
    }

    /// Finds the dictionary (and reference) of the page at `page_index`.
    ///
    /// Walks the page tree depth-first without recursion, skipping whole
    /// subtrees whose `/Count` lies before the requested index.
    pub fn get_page_dict(&self, xref: &XRef, page_index: usize) -> PDFResult<(Dict, Option<Ref>)> {
        let mut nodes_to_visit = vec![PageNode::Tree {
            dict: self.toplevel_pages.clone(),
            reference: self.pages_ref,
        }];
        let mut visited: FxHashSet<Ref> = self.pages_ref.into_iter().collect();
        let mut current_page_index = 0usize;

        while let Some(node) = nodes_to_visit.pop() {
            let (dict, reference) = match node {
                PageNode::Ref(reference) => {
                    let cached_count = lock(&self.page_kids_count_cache)?.get(&reference).copied();
                    if let Some(count) = cached_count
                        && current_page_index + count <= page_index
                    {
                        current_page_index += count;
                        continue;
                    }
                    if !visited.insert(reference) {
                        return Err(PDFError::format_error("Pages tree contains circular reference."));
                    }

                    let obj = xref.fetch(reference)?;
                    let PDFObject::Dictionary(dict) = obj.as_ref() else {
                        return Err(PDFError::format_error(
                            "Page dictionary kid reference points to wrong type of object.",
                        ));
                    };
                    if is_page_leaf(xref, dict)? {
                        lock(&self.page_kids_count_cache)?.insert(reference, 1);
                        lock(&self.page_index_cache)?
                            .entry(reference)
                            .or_insert(current_page_index);
                        if current_page_index == page_index {
                            return Ok((dict.clone(), Some(reference)));
                        }
                        current_page_index += 1;
                        continue;
                    }
                    (dict.clone(), Some(reference))
                }
                PageNode::Tree { dict, reference } => (dict, reference),
            };

            if let Some(count) = xref.get_resolved(&dict, "Count")?.and_then(|c| c.as_integer())
                && count >= 0
            {
                let count = count as usize;
                if let Some(reference) = reference {
                    lock(&self.page_kids_count_cache)?.entry(reference).or_insert(count);
                }
                if current_page_index + count <= page_index {
                    current_page_index += count;
                    continue;
                }
            }

            let Some(PDFObject::Array(kids)) = xref.get_resolved(&dict, "Kids")? else {
                if is_page_leaf(xref, &dict)? {
                    if current_page_index == page_index {
                        return Ok((dict, reference));
                    }
                    current_page_index += 1;
                    continue;
                }
                return Err(PDFError::format_error("Page dictionary kids object is not an array."));
            };

            for kid in kids.iter().rev() {
                match &**kid {
                    PDFObject::Ref(r) => nodes_to_visit.push(PageNode::Ref(*r)),
                    PDFObject::Dictionary(d) => nodes_to_visit.push(PageNode::Tree { dict: d.clone(), reference: None }),
                    _ => {
                        return Err(PDFError::format_error(
                            "Page dictionary kid object is not a dictionary.",
                        ));
                    }
                }
            }
        }

        Err(PDFError::format_error(format!("Page index {} not found.", page_index)))
    }

    /// Reverse lookup: the index of the page whose reference is `page_ref`.
    ///
    /// Climbs the `/Parent` chain, counting the pages of every kid that
    /// precedes the current node.
    pub fn get_page_index(&self, xref: &XRef, page_ref: Ref) -> PDFResult<usize> {
        if let Some(index) = lock(&self.page_index_cache)?.get(&page_ref) {
            return Ok(*index);
        }

        let mut total = 0usize;
        let mut kid_ref = page_ref;
        let mut visited = FxHashSet::default();

        loop {
            if !visited.insert(kid_ref) {
                return Err(PDFError::format_error("Pages tree contains circular reference."));
            }
            let node = xref.fetch(kid_ref)?;
            if kid_ref == page_ref {
                let is_page = node.is_dict_type("Page")
                    || node
                        .as_dictionary()
                        .is_some_and(|d| !d.contains_key("Type") && d.contains_key("Contents"));
                if !is_page {
                    return Err(PDFError::format_error(
                        "The reference does not point to a /Page dictionary.",
                    ));
                }
            }
            let PDFObject::Dictionary(node) = node.as_ref() else {
                if node.is_null() {
                    break;
                }
                return Err(PDFError::format_error("Node must be a dictionary."));
            };

            let parent_ref = node.get("Parent").and_then(|p| p.as_ref());
            let parent = match xref.get_resolved(node, "Parent")? {
                None | Some(PDFObject::Null) => break,
                Some(PDFObject::Dictionary(parent)) => parent,
                Some(_) => return Err(PDFError::format_error("Parent must be a dictionary.")),
            };
            let Some(PDFObject::Array(kids)) = xref.get_resolved(&parent, "Kids")? else {
                break;
            };

            let mut found = false;
            for kid in kids.iter() {
                let PDFObject::Ref(kid) = &**kid else {
                    return Err(PDFError::format_error("Kid must be a reference."));
                };
                let kid = *kid;
                if kid == kid_ref {
                    found = true;
                    break;
                }
                let kid_obj = xref.fetch(kid)?;
                let Some(kid_dict) = kid_obj.as_dictionary() else {
                    return Err(PDFError::format_error("Kid node must be a dictionary."));
                };
                total += match xref.get_resolved(kid_dict, "Count")?.and_then(|c| c.as_integer()) {
                    Some(count) if count >= 0 => count as usize,
                    _ => 1,
                };
            }
            if !found {
                return Err(PDFError::format_error("Kid reference not found in parent's kids."));
            }

            match parent_ref {
                Some(next) => kid_ref = next,
                None => break,
            }
        }

        lock(&self.page_index_cache)?.insert(page_ref, total);
        Ok(total)
    }

    /// The `/Names /Dests` tree, if present.
    fn dests_tree<'a>(&self, xref: &'a XRef) -> PDFResult<Option<NameTree<'a>>> {
        let names = match xref.get_resolved(&self.cat_dict, "Names")? {
            Some(PDFObject::Dictionary(names)) => names,
            _ => return Ok(None),
        };
        Ok(names.get("Dests").cloned().map(|root| NameTree::new(root, xref, "Names")))
    }

    /// The legacy `/Dests` dictionary, if present.
    fn dests_dict(&self, xref: &XRef) -> PDFResult<Option<Dict>> {
        Ok(match xref.get_resolved(&self.cat_dict, "Dests")? {
            Some(PDFObject::Dictionary(dict)) => Some(dict),
            _ => None,
        })
    }

    /// All named destinations, from the name tree and the legacy dictionary.
    ///
    /// Name tree entries win over `/Dests` entries with the same name.
    pub fn destinations(&self, xref: &XRef) -> PDFResult<BTreeMap<String, ExplicitDest>> {
        let mut dests = BTreeMap::new();
        if let Some(tree) = self.dests_tree(xref)? {
            for (key, value) in tree.get_all()? {
                if let Some(dest) = fetch_dest(xref, &value)? {
                    dests.insert(string_to_pdf_string(&key), dest);
                }
            }
        }
        if let Some(dict) = self.dests_dict(xref)? {
            for (key, value) in &dict {
                if dests.contains_key(key) {
                    continue;
                }
                if let Some(dest) = fetch_dest(xref, &xref.fetch_if_ref(value)?)? {
                    dests.insert(key.clone(), dest);
                }
            }
        }
        Ok(dests)
    }

    /// Looks up one named destination.
    pub fn get_destination(&self, xref: &XRef, id: &str) -> PDFResult<Option<ExplicitDest>> {
        if let Some(tree) = self.dests_tree(xref)? {
            if let Some(value) = tree.get(id.as_bytes())?
                && let Some(dest) = fetch_dest(xref, &value)?
            {
                return Ok(Some(dest));
            }
            // Keys of broken trees may not be sorted
            if let Some(dest) = self.destinations(xref)?.remove(id) {
                log::warn!("Found \"{}\" at an incorrect position in the NameTree.", id);
                return Ok(Some(dest));
            }
        }
        if let Some(dict) = self.dests_dict(xref)?
            && let Some(value) = dict.get(id)
        {
            return fetch_dest(xref, &xref.fetch_if_ref(value)?);
        }
        Ok(None)
    }

    /// The XMP metadata stream as text.
    ///
    /// Only `/Type /Metadata /Subtype /XML` streams are returned; anything
    /// else, or undecodable data, is skipped.
    pub fn metadata(&self, xref: &XRef) -> PDFResult<Option<String>> {
        let Some(PDFObject::Ref(stream_ref)) = self.cat_dict.get("Metadata") else {
            return Ok(None);
        };
        let stream = xref.fetch(*stream_ref)?;
        let PDFObject::Stream { dict, .. } = stream.as_ref() else {
            return Ok(None);
        };
        let is_xml = dict.get("Type").is_some_and(|t| t.is_name("Metadata"))
            && dict.get("Subtype").is_some_and(|t| t.is_name("XML"));
        if !is_xml {
            return Ok(None);
        }

        match xref.stream_bytes(&stream) {
            Ok(Some(bytes)) => {
                let text = String::from_utf8_lossy(&bytes).into_owned();
                Ok((!text.is_empty()).then_some(text))
            }
            Ok(None) => Ok(None),
            Err(e) if e.is_fatal_for_recovery() => Err(e),
            Err(e) => {
                log::info!("Skipping invalid metadata: \"{}\".", e);
                Ok(None)
            }
        }
    }

    /// The interactive form dictionary (`/AcroForm`).
    pub fn acro_form(&self, xref: &XRef) -> PDFResult<Option<Dict>> {
        match xref.get_resolved(&self.cat_dict, "AcroForm") {
            Ok(Some(PDFObject::Dictionary(dict))) => Ok(Some(dict)),
            Ok(_) => Ok(None),
            Err(e) if e.is_fatal_for_recovery() => Err(e),
            Err(e) => {
                log::info!("Cannot fetch AcroForm entry; assuming no forms are present: {}", e);
                Ok(None)
            }
        }
    }

    /// The document outline (bookmarks), or `None` when there is none.
    pub fn outline(&self, xref: &XRef) -> PDFResult<Option<Vec<OutlineItem>>> {
        match parse_document_outline(xref, self) {
            Ok(outline) => Ok(outline),
            Err(e) if e.is_fatal_for_recovery() => Err(e),
            Err(e) => {
                log::warn!("Unable to read document outline: {}", e);
                Ok(None)
            }
        }
    }
}

/// True for a page object: `/Type /Page`, or a node without `/Kids`.
fn is_page_leaf(xref: &XRef, dict: &Dict) -> PDFResult<bool> {
    let page_type = xref.get_resolved(dict, "Type")?;
    Ok(page_type.is_some_and(|t| t.is_name("Page")) || !dict.contains_key("Kids"))
}

/// Destination values are arrays, or dictionaries holding one under `/D`.
fn fetch_dest(xref: &XRef, value: &PDFObject) -> PDFResult<Option<ExplicitDest>> {
    let dest = match value {
        PDFObject::Dictionary(dict) => xref.get_resolved(dict, "D")?,
        other => Some(other.clone()),
    };
    Ok(match dest {
        Some(PDFObject::Array(items)) => Some(items.into_iter().map(|item| *item).collect()),
        _ => None,
    })
}

/// A name tree (`/Kids`, `/Names`, `/Limits`).
///
/// Keys are compared as raw bytes.
pub struct NameTree<'a> {
    root: PDFObject,
    xref: &'a XRef,
    entries_key: &'static str,
}

impl<'a> NameTree<'a> {
    pub fn new(root: PDFObject, xref: &'a XRef, entries_key: &'static str) -> Self {
        NameTree { root, xref, entries_key }
    }

    /// Every `(key, value)` pair, with indirect values resolved.
    pub fn get_all(&self) -> PDFResult<Vec<(Vec<u8>, PDFObject)>> {
        let mut all = Vec::new();
        let mut processed = FxHashSet::default();
        if let Some(r) = self.root.as_ref() {
            processed.insert(r);
        }
        let mut queue = VecDeque::from([self.root.clone()]);

        while let Some(node) = queue.pop_front() {
            let PDFObject::Dictionary(node) = self.xref.fetch_if_ref(&node)? else {
                continue;
            };
            if node.contains_key("Kids") {
                let Some(PDFObject::Array(kids)) = self.xref.get_resolved(&node, "Kids")? else {
                    continue;
                };
                for kid in kids {
                    if let PDFObject::Ref(r) = &*kid
                        && !processed.insert(*r)
                    {
                        return Err(PDFError::format_error(format!(
                            "Duplicate entry in \"{}\" tree.",
                            self.entries_key
                        )));
                    }
                    queue.push_back(*kid);
                }
                continue;
            }
            let Some(PDFObject::Array(entries)) = self.xref.get_resolved(&node, self.entries_key)? else {
                continue;
            };
            for pair in entries.chunks(2) {
                let [key, value] = pair else { continue };
                if let Some(key) = self.xref.fetch_if_ref(key)?.as_string() {
                    all.push((key.to_vec(), self.xref.fetch_if_ref(value)?));
                }
            }
        }
        Ok(all)
    }

    /// Finds `key` using `/Limits` to pick the subtree.
    pub fn get(&self, key: &[u8]) -> PDFResult<Option<PDFObject>> {
        let mut node = match self.xref.fetch_if_ref(&self.root)? {
            PDFObject::Dictionary(dict) => dict,
            _ => return Ok(None),
        };

        let mut levels = 0;
        while node.contains_key("Kids") {
            levels += 1;
            if levels > MAX_NAME_TREE_LEVELS {
                log::warn!("Search depth limit reached for \"{}\" tree.", self.entries_key);
                return Ok(None);
            }
            let Some(PDFObject::Array(kids)) = self.xref.get_resolved(&node, "Kids")? else {
                return Ok(None);
            };

            let (mut low, mut high) = (0isize, kids.len() as isize - 1);
            let mut next = None;
            while low <= high {
                let middle = (low + high) / 2;
                let PDFObject::Dictionary(kid) = self.xref.fetch_if_ref(&kids[middle as usize])? else {
                    return Ok(None);
                };
                let Some(PDFObject::Array(limits)) = self.xref.get_resolved(&kid, "Limits")? else {
                    return Ok(None);
                };
                let lower = limits.first().map(|l| self.xref.fetch_if_ref(l)).transpose()?;
                let upper = limits.get(1).map(|u| self.xref.fetch_if_ref(u)).transpose()?;
                let (Some(lower), Some(upper)) = (
                    lower.as_ref().and_then(|l| l.as_string()),
                    upper.as_ref().and_then(|u| u.as_string()),
                ) else {
                    return Ok(None);
                };
                if key < lower {
                    high = middle - 1;
                } else if key > upper {
                    low = middle + 1;
                } else {
                    next = Some(kid);
                    break;
                }
            }
            match next {
                Some(kid) => node = kid,
                None => return Ok(None),
            }
        }

        let Some(PDFObject::Array(entries)) = self.xref.get_resolved(&node, self.entries_key)? else {
            return Ok(None);
        };
        let pairs = entries.len() / 2;
        let (mut low, mut high) = (0isize, pairs as isize - 1);
        while low <= high {
            let middle = (low + high) / 2;
            let current = self.xref.fetch_if_ref(&entries[middle as usize * 2])?;
            let Some(current) = current.as_string() else { break };
            if key < current {
                high = middle - 1;
            } else if key > current {
                low = middle + 1;
            } else {
                return Ok(Some(self.xref.fetch_if_ref(&entries[middle as usize * 2 + 1])?));
            }
        }

        // Unsorted leaves: fall back to a linear scan
        for pair in entries.chunks(2) {
            let [current, value] = pair else { continue };
            if self.xref.fetch_if_ref(current)?.as_string() == Some(key) {
                return Ok(Some(self.xref.fetch_if_ref(value)?));
            }
        }
        Ok(None)
    }
}
