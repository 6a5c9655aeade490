use super::base_stream::BaseStream;
use super::decode::decode_stream_object;
use super::encryption::CipherTransformFactory;
use super::error::{PDFError, PDFResult};
use super::lexer::Lexer;
use super::parser::{find_sequence, Dict, PDFObject, Parser, Ref, MAX_FETCH_DEPTH};
use super::stream::Stream;
use lru::LruCache;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};

/// Number of decoded object streams kept in memory.
const OBJECT_STREAM_CACHE_SIZE: usize = 64;

/// Cross-reference table entry.
///
/// Each entry describes where to find an indirect object in the file.
/// Based on PDF.js's XRef entry structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XRefEntry {
    /// Free entry - object number is available for reuse
    Free { next_free: u64, generation: u32 },

    /// Uncompressed entry - object is stored at `offset` (relative to the header)
    Uncompressed { offset: u64, generation: u32 },

    /// Compressed entry - object `index` inside object stream `obj_stream_num`
    Compressed { obj_stream_num: u32, index: u32 },
}

impl XRefEntry {
    /// Returns true if this entry is free.
    pub fn is_free(&self) -> bool {
        matches!(self, XRefEntry::Free { .. })
    }

    /// Returns the generation number for this entry.
    pub fn generation(&self) -> u32 {
        match self {
            XRefEntry::Free { generation, .. } => *generation,
            XRefEntry::Uncompressed { generation, .. } => *generation,
            XRefEntry::Compressed { .. } => 0,
        }
    }
}

/// Decoded contents of one object stream: `(object number, object)` in stream order.
type ObjectStreamEntries = Arc<Vec<(u32, PDFObject)>>;

fn lock_cache<T>(cache: &Mutex<T>) -> PDFResult<MutexGuard<'_, T>> {
    cache
        .lock()
        .map_err(|_| PDFError::StreamError("Failed to lock xref cache (mutex poisoned)".to_string()))
}

/// Cross-reference table for a PDF document.
///
/// Maps object numbers to their locations so that indirect references
/// (like "5 0 R") can be resolved. Parsing needs `&mut self`; once parsed,
/// all lookups take `&self` and the object caches sit behind mutexes so a
/// shared `XRef` can serve concurrent page evaluations.
///
/// Based on PDF.js src/core/xref.js
pub struct XRef {
    /// Document bytes; offsets in entries are relative to `stream.start()`
    stream: Box<dyn BaseStream>,

    /// Entries keyed by object number; the first revision seen wins
    entries: FxHashMap<u32, XRefEntry>,

    /// Offset of the newest cross-reference section
    start_xref: Option<usize>,

    trailer: Option<Dict>,
    root: Option<Dict>,

    password: Option<Vec<u8>>,
    encrypt: Option<CipherTransformFactory>,
    encrypt_ref: Option<Ref>,

    cache: Mutex<FxHashMap<Ref, Arc<PDFObject>>>,
    object_streams: Mutex<LruCache<u32, ObjectStreamEntries>>,
}

impl XRef {
    /// Creates an empty table over `stream`.
    pub fn new(stream: Box<dyn BaseStream>, password: Option<Vec<u8>>) -> Self {
        XRef {
            stream,
            entries: FxHashMap::default(),
            start_xref: None,
            trailer: None,
            root: None,
            password,
            encrypt: None,
            encrypt_ref: None,
            cache: Mutex::new(FxHashMap::default()),
            object_streams: Mutex::new(Self::new_object_stream_cache()),
        }
    }

    fn new_object_stream_cache() -> LruCache<u32, ObjectStreamEntries> {
        LruCache::new(NonZeroUsize::new(OBJECT_STREAM_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN))
    }

    /// The underlying document stream.
    pub fn stream(&self) -> &dyn BaseStream {
        self.stream.as_ref()
    }

    pub(crate) fn stream_mut(&mut self) -> &mut dyn BaseStream {
        self.stream.as_mut()
    }

    /// Sets the offset (relative to the header) of the newest xref section.
    pub fn set_start_xref(&mut self, start_xref: usize) {
        self.start_xref = Some(start_xref);
    }

    /// Replaces the password used by the next `parse`.
    pub fn set_password(&mut self, password: Option<Vec<u8>>) {
        self.password = password;
    }

    /// Reads the cross-reference data and validates the catalog.
    ///
    /// Outside recovery mode, any structural failure yields
    /// `PDFError::XRefParse` so that the caller can retry with
    /// `recovery_mode = true`, which rebuilds the table by scanning every
    /// object in the file.
    pub fn parse(&mut self, recovery_mode: bool) -> PDFResult<()> {
        self.reset();

        let trailer = if recovery_mode {
            log::warn!("Indexing all PDF objects");
            self.index_objects()?
        } else {
            let queue: Vec<usize> = self.start_xref.into_iter().collect();
            self.read_xref(queue)?
                .ok_or_else(|| PDFError::XRefParse("No valid cross-reference section".to_string()))?
        };
        self.trailer = Some(trailer);

        self.setup_encryption()?;

        let root = match self.trailer_value("Root") {
            Ok(root) => root,
            Err(e) if e.is_fatal_for_recovery() => return Err(e),
            Err(e) => {
                log::warn!("Unable to read the /Root entry: {}", e);
                None
            }
        };
        if let Some(PDFObject::Dictionary(root)) = root {
            let pages = match root.get("Pages") {
                Some(pages) => self.fetch_if_ref(pages)?,
                None => PDFObject::Null,
            };
            if matches!(pages, PDFObject::Dictionary(_)) {
                self.root = Some(root);
                return Ok(());
            }
        }

        if !recovery_mode {
            return Err(PDFError::XRefParse("Invalid Root reference".to_string()));
        }
        Err(PDFError::InvalidPDF("Invalid Root reference.".to_string()))
    }

    fn reset(&mut self) {
        self.entries.clear();
        self.trailer = None;
        self.root = None;
        self.encrypt = None;
        self.encrypt_ref = None;
        self.clear_caches();
    }

    fn clear_caches(&mut self) {
        self.cache = Mutex::new(FxHashMap::default());
        self.object_streams = Mutex::new(Self::new_object_stream_cache());
    }

    fn trailer_value(&self, key: &str) -> PDFResult<Option<PDFObject>> {
        match self.trailer.as_ref().and_then(|t| t.get(key)) {
            Some(value) => Ok(Some(self.fetch_if_ref(value)?)),
            None => Ok(None),
        }
    }

    fn setup_encryption(&mut self) -> PDFResult<()> {
        let Some(encrypt_value) = self.trailer.as_ref().and_then(|t| t.get("Encrypt")).cloned() else {
            return Ok(());
        };
        let encrypt_ref = encrypt_value.as_ref();
        let encrypt = match self.fetch_if_ref(&encrypt_value) {
            Ok(PDFObject::Dictionary(dict)) => dict,
            Ok(_) => return Ok(()),
            Err(e) if e.is_fatal_for_recovery() => return Err(e),
            Err(e) => {
                log::warn!("Unable to read the /Encrypt dictionary: {}", e);
                return Ok(());
            }
        };

        let file_id = match self.trailer_value("ID")? {
            Some(PDFObject::Array(ids)) => ids
                .first()
                .and_then(|id| id.as_string())
                .map(<[u8]>::to_vec)
                .unwrap_or_default(),
            _ => Vec::new(),
        };

        let factory = CipherTransformFactory::new(&encrypt, &file_id, self.password.as_deref())?;
        self.encrypt = Some(factory);
        self.encrypt_ref = encrypt_ref;
        // Objects fetched before the key was known are stored undecrypted
        self.clear_caches();
        Ok(())
    }

    // ========================================================================
    // Cross-reference sections
    // ========================================================================

    /// Walks the queue of cross-reference sections, following /XRefStm and /Prev.
    ///
    /// Returns the dictionary of the first section read (the newest trailer).
    fn read_xref(&mut self, queue: Vec<usize>) -> PDFResult<Option<Dict>> {
        let mut queue: VecDeque<usize> = queue.into();
        let mut visited = FxHashSet::default();
        let mut top_dict: Option<Dict> = None;

        while let Some(start_xref) = queue.pop_front() {
            if !visited.insert(start_xref) {
                log::warn!("Skipping XRef section at {} since it was already parsed", start_xref);
                continue;
            }

            let (dict, is_table, mut entries) = match self.read_xref_section(start_xref) {
                Ok(section) => section,
                Err(e) if e.is_fatal_for_recovery() => return Err(e),
                Err(e) => {
                    log::info!("(while reading XRef at {}): {}", start_xref, e);
                    continue;
                }
            };

            // Hybrid files: the stream belongs to the same revision as its table
            if is_table
                && let Some(xref_stm) = dict.get("XRefStm").and_then(|v| v.as_integer())
                && let Ok(xref_stm) = usize::try_from(xref_stm)
                && visited.insert(xref_stm)
            {
                match self.read_xref_section(xref_stm) {
                    Ok((_, false, stream_entries)) => entries = merge_hybrid_entries(entries, stream_entries),
                    Ok(_) => log::warn!("XRefStm at {} is not a cross-reference stream", xref_stm),
                    Err(e) if e.is_fatal_for_recovery() => return Err(e),
                    Err(e) => log::info!("(while reading XRefStm at {}): {}", xref_stm, e),
                }
            }
            self.add_entries(entries);

            match dict.get("Prev") {
                Some(PDFObject::Number(n)) if *n >= 0.0 => queue.push_back(*n as usize),
                // Some writers store /Prev as a reference
                Some(PDFObject::Ref(r)) => queue.push_back(r.num as usize),
                _ => {}
            }

            if top_dict.is_none() {
                top_dict = Some(dict);
            }
        }

        Ok(top_dict)
    }

    /// Reads one section at `start_xref`.
    ///
    /// Returns its dictionary, whether it was a table, and its entries.
    fn read_xref_section(&mut self, start_xref: usize) -> PDFResult<(Dict, bool, Vec<(u32, XRefEntry)>)> {
        let pos = self.stream.start().checked_add(start_xref).unwrap_or(usize::MAX);
        if pos >= self.stream.end() {
            return Err(PDFError::format_error(format!("XRef offset {} is beyond the end", start_xref)));
        }

        let sub_stream = self.stream.make_sub_stream(pos, self.stream.end() - pos)?;
        let mut parser = Parser::new(Lexer::new(sub_stream)?)?;
        let first = parser.get_object()?;

        if first.is_command("xref") {
            let (entries, trailer) = read_xref_table(&mut parser)?;
            return Ok((trailer, true, entries));
        }

        if first.as_integer().is_some() {
            let stream_obj = {
                let mut parser = self.parser_at(pos, 0)?;
                let _num = parser.get_object()?;
                let generation = parser.get_object()?;
                let keyword = parser.get_object()?;
                if generation.as_integer().is_none() || !keyword.is_command("obj") {
                    return Err(PDFError::format_error("Invalid XRef stream"));
                }
                parser.get_object()?
            };
            let PDFObject::Stream { dict, data } = stream_obj else {
                return Err(PDFError::format_error("Invalid XRef stream"));
            };
            let decoded = decode_stream_object(&dict, &data)?;
            let entries = read_xref_stream(&dict, &decoded)?;
            return Ok((dict, false, entries));
        }

        Err(PDFError::format_error("Invalid XRef stream header"))
    }

    /// Adds entries unless a newer revision already defined them.
    fn add_entries(&mut self, entries: Vec<(u32, XRefEntry)>) {
        for (num, entry) in entries {
            self.entries.entry(num).or_insert(entry);
        }
    }

    // ========================================================================
    // Recovery
    // ========================================================================

    /// Rebuilds the table by scanning the whole file for `N G obj` headers.
    ///
    /// Returns the best trailer candidate.
    fn index_objects(&mut self) -> PDFResult<Dict> {
        let start = self.stream.start();
        let buffer = self.stream.get_byte_range(start, self.stream.end())?;
        let length = buffer.len();

        let mut trailers: Vec<usize> = Vec::new();
        let mut xref_stms: Vec<usize> = Vec::new();
        let mut object_streams: Vec<u32> = Vec::new();
        let mut position = 0usize;

        while position < length {
            let ch = buffer[position];
            if matches!(ch, b'\t' | b'\n' | b'\r' | b' ') {
                position += 1;
                continue;
            }
            if ch == b'%' {
                while position < length && buffer[position] != b'\n' && buffer[position] != b'\r' {
                    position += 1;
                }
                continue;
            }

            let token = read_line_token(&buffer, position);
            if keyword_token(token, b"xref") {
                position += skip_until(&buffer, position, b"trailer");
                trailers.push(position);
                position += skip_until(&buffer, position, b"startxref");
            } else if let Some((num, generation, header_len)) = parse_object_header(token) {
                let content_start = position + header_len;
                let replace = match self.entries.get(&num) {
                    None => true,
                    Some(existing) if generation > existing.generation() => true,
                    Some(existing) if generation == existing.generation() => {
                        self.object_parses_at(start + content_start)
                    }
                    Some(_) => false,
                };
                if replace {
                    self.entries.insert(num, XRefEntry::Uncompressed { offset: position as u64, generation });
                }

                let content_length = match find_object_end(&buffer, content_start) {
                    Some((_, match_end, true)) => (match_end + 1).min(length) - position,
                    Some((match_start, _, false)) => {
                        log::warn!("indexObjects: object {} is missing endobj, trying to recover", num);
                        match_start - position
                    }
                    None => length - position,
                };
                let content = &buffer[position..position + content_length];

                // XRef stream suspect: '/XRef' not followed by a letter
                if let Some(tag) = find_sequence(content, b"/XRef")
                    && content.get(tag + 5).is_none_or(|&b| b < 64)
                {
                    xref_stms.push(position);
                }
                if find_sequence(content, b"/ObjStm").is_some() {
                    object_streams.push(num);
                }
                position += content_length.max(1);
            } else if keyword_token(token, b"trailer") {
                trailers.push(position);
                position += skip_until(&buffer, position, b"startxref");
            } else {
                position += token.len() + 1;
            }
        }

        // Entries from cross-reference streams fill in compressed objects
        let mut top_dict = None;
        for xref_stm in xref_stms {
            if let Some(dict) = self.read_xref(vec![xref_stm])?
                && top_dict.is_none()
            {
                top_dict = Some(dict);
            }
        }
        for container in object_streams {
            match self.object_stream(container, 0) {
                Ok(objects) => {
                    let entries = objects
                        .iter()
                        .enumerate()
                        .map(|(index, (num, _))| {
                            (*num, XRefEntry::Compressed { obj_stream_num: container, index: index as u32 })
                        })
                        .collect();
                    self.add_entries(entries);
                }
                Err(e) if e.is_fatal_for_recovery() => return Err(e),
                Err(e) => log::warn!("indexObjects: unreadable object stream {}: {}", container, e),
            }
        }
        // Entries changed, anything fetched so far may be stale
        self.clear_caches();

        let mut candidates: Vec<Dict> = Vec::new();
        for trailer_pos in trailers {
            match self.parse_trailer_at(start + trailer_pos) {
                Ok(Some(dict)) => candidates.push(dict),
                Ok(None) => {}
                Err(e) if e.is_fatal_for_recovery() => return Err(e),
                Err(e) => log::debug!("indexObjects: bad trailer at {}: {}", trailer_pos, e),
            }
        }
        if let Some(dict) = top_dict.clone() {
            candidates.push(dict);
        }
        let is_encrypted = candidates.iter().any(|dict| dict.contains_key("Encrypt"));

        let mut last_valid: Option<Dict> = None;
        for dict in candidates {
            if !self.has_valid_root(&dict)? {
                continue;
            }
            if dict.contains_key("ID") && (!is_encrypted || dict.contains_key("Encrypt")) {
                return Ok(dict);
            }
            last_valid = Some(dict);
        }
        if let Some(dict) = last_valid {
            return Ok(dict);
        }
        if let Some(dict) = top_dict {
            return Ok(dict);
        }
        self.synthesize_trailer()
    }

    /// True when the object at `pos` parses without hitting the end of the file.
    fn object_parses_at(&self, pos: usize) -> bool {
        let parsed = self
            .stream
            .make_sub_stream(pos, self.stream.end().saturating_sub(pos))
            .and_then(Lexer::new)
            .and_then(Parser::new)
            .and_then(|mut parser| parser.get_object());
        !matches!(parsed, Ok(PDFObject::EOF))
    }

    fn parse_trailer_at(&self, pos: usize) -> PDFResult<Option<Dict>> {
        let mut parser = self.parser_at(pos, 0)?;
        if !parser.get_object()?.is_command("trailer") {
            return Ok(None);
        }
        Ok(match parser.get_object()? {
            PDFObject::Dictionary(dict) => Some(dict),
            _ => None,
        })
    }

    /// True when the trailer's /Root is a dictionary with a /Pages dictionary.
    fn has_valid_root(&self, trailer: &Dict) -> PDFResult<bool> {
        let root = match trailer.get("Root").map(|r| self.fetch_if_ref(r)) {
            Some(Ok(root)) => root,
            Some(Err(e)) if e.is_fatal_for_recovery() => return Err(e),
            _ => return Ok(false),
        };
        let pages = match root.get("Pages").map(|p| self.fetch_if_ref(p)) {
            Some(Ok(pages)) => pages,
            Some(Err(e)) if e.is_fatal_for_recovery() => return Err(e),
            _ => return Ok(false),
        };
        Ok(matches!(pages, PDFObject::Dictionary(_)))
    }

    /// Builds a trailer from the objects when no trailer survived.
    fn synthesize_trailer(&self) -> PDFResult<Dict> {
        let mut catalog: Option<Ref> = None;
        let mut nums: Vec<u32> = self.entries.keys().copied().collect();
        nums.sort_unstable();
        for num in nums {
            let Some(entry) = self.entries.get(&num) else { continue };
            if entry.is_free() {
                continue;
            }
            let reference = Ref::new(num, entry.generation());
            let obj = match self.fetch(reference) {
                Ok(obj) => obj,
                Err(e) if e.is_fatal_for_recovery() => return Err(e),
                Err(_) => continue,
            };
            // A stray trailer-like dictionary (e.g. an xref stream dict)
            if let Some(dict) = obj.as_dictionary()
                && dict.contains_key("Root")
                && self.has_valid_root(dict)?
            {
                return Ok(dict.clone());
            }
            if obj.is_dict_type("Catalog") {
                catalog = Some(reference);
            }
        }

        match catalog {
            Some(root) => {
                log::warn!("indexObjects: no trailer found, using catalog {}", root);
                let mut trailer = Dict::new();
                trailer.insert("Root".to_string(), PDFObject::Ref(root));
                trailer.insert("Size".to_string(), PDFObject::Number(self.len() as f64));
                Ok(trailer)
            }
            None => Err(PDFError::InvalidPDF("Invalid PDF structure.".to_string())),
        }
    }

    // ========================================================================
    // Fetching
    // ========================================================================

    fn parser_at(&self, pos: usize, fetch_depth: usize) -> PDFResult<Parser<'_>> {
        let sub_stream = self.stream.make_sub_stream(pos, self.stream.end().saturating_sub(pos))?;
        Parser::with_xref(Lexer::new(sub_stream)?, self, fetch_depth)
    }

    /// Gets a usable entry: free entries and entries at offset 0 count as missing.
    pub fn get_entry(&self, num: u32) -> Option<&XRefEntry> {
        match self.entries.get(&num)? {
            XRefEntry::Free { .. } | XRefEntry::Uncompressed { offset: 0, .. } => None,
            entry => Some(entry),
        }
    }

    /// Number of slots in the table (highest object number + 1).
    pub fn len(&self) -> usize {
        self.entries.keys().max().map_or(0, |&max| max as usize + 1)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn trailer(&self) -> Option<&Dict> {
        self.trailer.as_ref()
    }

    /// The catalog dictionary, available after a successful `parse`.
    pub fn root(&self) -> Option<&Dict> {
        self.root.as_ref()
    }

    pub fn encrypt(&self) -> Option<&CipherTransformFactory> {
        self.encrypt.as_ref()
    }

    /// Fetches an indirect object.
    ///
    /// Missing and free objects resolve to `Null`.
    pub fn fetch(&self, reference: Ref) -> PDFResult<Arc<PDFObject>> {
        self.fetch_nested(reference, 0)
    }

    /// Fetches an indirect object while `depth` fetches are already in progress.
    ///
    /// Fails with `CircularReference` once the chain exceeds [`MAX_FETCH_DEPTH`].
    pub fn fetch_nested(&self, reference: Ref, depth: usize) -> PDFResult<Arc<PDFObject>> {
        if depth > MAX_FETCH_DEPTH {
            return Err(PDFError::CircularReference);
        }
        if let Some(cached) = lock_cache(&self.cache)?.get(&reference) {
            return Ok(Arc::clone(cached));
        }

        let object = match self.get_entry(reference.num) {
            None => return Ok(Arc::new(PDFObject::Null)),
            Some(XRefEntry::Uncompressed { offset, generation }) => {
                self.fetch_uncompressed(reference, *offset as usize, *generation, depth)?
            }
            Some(XRefEntry::Compressed { obj_stream_num, index }) => {
                self.fetch_compressed(reference, *obj_stream_num, *index as usize, depth)?
            }
            Some(XRefEntry::Free { .. }) => PDFObject::Null,
        };

        let object = Arc::new(object);
        lock_cache(&self.cache)?.insert(reference, Arc::clone(&object));
        Ok(object)
    }

    fn fetch_uncompressed(&self, reference: Ref, offset: usize, generation: u32, depth: usize) -> PDFResult<PDFObject> {
        if generation != reference.generation {
            return Err(PDFError::XRefParse(format!("Inconsistent generation in XRef: {}", reference)));
        }

        let mut parser = self.parser_at(self.stream.start() + offset, depth)?;
        let num = parser.get_object()?;
        let gen_obj = parser.get_object()?;
        let keyword = parser.get_object()?;
        if num.as_integer() != Some(reference.num as i64)
            || gen_obj.as_integer() != Some(generation as i64)
            || !keyword.is_command("obj")
        {
            return Err(PDFError::XRefParse(format!("Bad (uncompressed) XRef entry: {}", reference)));
        }
        let object = parser.get_object()?;

        match &self.encrypt {
            Some(factory) if Some(reference) != self.encrypt_ref && !skips_decryption(&object, factory) => {
                factory
                    .create_cipher_transform(reference.num, reference.generation)
                    .decrypt_object(object)
            }
            _ => Ok(object),
        }
    }

    fn fetch_compressed(&self, reference: Ref, container: u32, index: usize, depth: usize) -> PDFResult<PDFObject> {
        let objects = self.object_stream(container, depth)?;
        let Some((_, object)) = objects.get(index) else {
            return Err(PDFError::XRefParse(format!("Bad (compressed) XRef entry: {}", reference)));
        };

        // Siblings pointing at this container are cached too
        let mut cache = lock_cache(&self.cache)?;
        for (i, (num, sibling)) in objects.iter().enumerate() {
            let expected = XRefEntry::Compressed { obj_stream_num: container, index: i as u32 };
            if i != index && self.entries.get(num) == Some(&expected) {
                cache.entry(Ref::new(*num, 0)).or_insert_with(|| Arc::new(sibling.clone()));
            }
        }
        Ok(object.clone())
    }

    /// Decodes and parses object stream `container`, going through the LRU cache.
    fn object_stream(&self, container: u32, depth: usize) -> PDFResult<ObjectStreamEntries> {
        if let Some(hit) = lock_cache(&self.object_streams)?.get(&container) {
            return Ok(Arc::clone(hit));
        }

        let stream = self.fetch_nested(Ref::new(container, 0), depth + 1)?;
        let PDFObject::Stream { dict, data } = stream.as_ref() else {
            return Err(PDFError::format_error("bad ObjStm stream"));
        };
        let first = dict.get("First").and_then(|v| v.as_integer());
        let n = dict.get("N").and_then(|v| v.as_integer());
        let (Some(first), Some(n)) = (first, n) else {
            return Err(PDFError::format_error("invalid first and n parameters for ObjStm stream"));
        };
        if first < 0 || n < 0 {
            return Err(PDFError::format_error("invalid first and n parameters for ObjStm stream"));
        }
        let (first, n) = (first as usize, n as usize);

        let decoded: Arc<[u8]> = Arc::from(self.decode_stream_data(dict, data)?);
        let mut header = Parser::with_xref(
            Lexer::new(Box::new(Stream::from_arc(Arc::clone(&decoded), 0, decoded.len())))?,
            self,
            depth + 1,
        )?;
        let mut pairs: Vec<(u32, usize)> = Vec::with_capacity(n.min(decoded.len()));
        for _ in 0..n {
            let num = header.get_object()?;
            let offset = header.get_object()?;
            match (num.as_integer(), offset.as_integer()) {
                (Some(num), Some(offset)) if num >= 0 && offset >= 0 => pairs.push((num as u32, offset as usize)),
                _ => {
                    return Err(PDFError::format_error(format!(
                        "invalid object number or offset in the ObjStm stream: {:?} {:?}",
                        num, offset
                    )));
                }
            }
        }

        let mut objects = Vec::with_capacity(pairs.len());
        for (i, &(num, offset)) in pairs.iter().enumerate() {
            let begin = (first + offset).min(decoded.len());
            let end = pairs
                .get(i + 1)
                .map(|&(_, next)| (first + next).min(decoded.len()))
                .unwrap_or(decoded.len());
            if end < begin {
                return Err(PDFError::format_error("Invalid offset in the ObjStm stream."));
            }
            let lexer = Lexer::new(Box::new(Stream::from_arc(Arc::clone(&decoded), begin, end - begin)))?;
            let object = match Parser::with_xref(lexer, self, depth + 1).and_then(|mut p| p.get_object()) {
                Ok(object) => object,
                Err(e) if e.is_fatal_for_recovery() => return Err(e),
                Err(e) => {
                    log::warn!("Failed to parse object {} from object stream {}: {}", num, container, e);
                    PDFObject::Null
                }
            };
            objects.push((num, object));
        }

        let objects = Arc::new(objects);
        lock_cache(&self.object_streams)?.put(container, Arc::clone(&objects));
        Ok(objects)
    }

    /// Fetches an object if it's a reference, otherwise returns the object as-is.
    pub fn fetch_if_ref(&self, obj: &PDFObject) -> PDFResult<PDFObject> {
        match obj {
            PDFObject::Ref(reference) => Ok(self.fetch(*reference)?.as_ref().clone()),
            _ => Ok(obj.clone()),
        }
    }

    /// Looks up `key` in `dict`, resolving an indirect value.
    pub fn get_resolved(&self, dict: &Dict, key: &str) -> PDFResult<Option<PDFObject>> {
        match dict.get(key) {
            Some(value) => Ok(Some(self.fetch_if_ref(value)?)),
            None => Ok(None),
        }
    }

    /// Applies the filters of a stream, resolving indirect /Filter and /DecodeParms.
    pub fn decode_stream_data(&self, dict: &Dict, data: &[u8]) -> PDFResult<Vec<u8>> {
        let indirect = |key: &str| matches!(dict.get(key), Some(PDFObject::Ref(_)));
        if indirect("Filter") || indirect("DecodeParms") {
            let mut resolved = dict.clone();
            for key in ["Filter", "DecodeParms"] {
                if let Some(value) = self.get_resolved(dict, key)? {
                    resolved.insert(key.to_string(), value);
                }
            }
            return decode_stream_object(&resolved, data);
        }
        decode_stream_object(dict, data)
    }

    /// Returns the decoded payload of a stream object, or `None` for other objects.
    pub fn stream_bytes(&self, obj: &PDFObject) -> PDFResult<Option<Vec<u8>>> {
        match obj {
            PDFObject::Stream { dict, data } => Ok(Some(self.decode_stream_data(dict, data)?)),
            _ => Ok(None),
        }
    }
}

/// Cross-reference streams are never encrypted; metadata may be stored in the clear.
fn skips_decryption(object: &PDFObject, factory: &CipherTransformFactory) -> bool {
    match object {
        PDFObject::Stream { .. } if object.is_dict_type("XRef") => true,
        PDFObject::Stream { .. } if object.is_dict_type("Metadata") => !factory.encrypt_metadata(),
        _ => false,
    }
}

/// Reads a classic table after the `xref` keyword, up to and including the trailer.
///
/// ```text
/// xref
/// 0 3
/// 0000000000 65535 f
/// 0000000015 00000 n
/// 0000000079 00000 n
/// trailer
/// << /Size 3 /Root 1 0 R >>
/// ```
fn read_xref_table(parser: &mut Parser<'_>) -> PDFResult<(Vec<(u32, XRefEntry)>, Dict)> {
    let mut entries: Vec<(u32, XRefEntry)> = Vec::new();

    loop {
        let header = parser.get_object()?;
        if header.is_command("trailer") {
            break;
        }
        let count_obj = parser.get_object()?;
        let (Some(mut first), Some(count)) = (header.as_integer(), count_obj.as_integer()) else {
            return Err(PDFError::format_error("Invalid XRef table: wrong types in subsection header"));
        };
        if first < 0 || count < 0 {
            return Err(PDFError::format_error("Invalid XRef table: negative subsection header"));
        }

        for i in 0..count {
            let offset = parser.get_object()?;
            let generation = parser.get_object()?;
            let kind = parser.get_object()?;
            let (Some(offset), Some(generation)) = (offset.as_integer(), generation.as_integer()) else {
                return Err(PDFError::format_error(format!("Invalid entry in XRef subsection: {}, {}", first, count)));
            };
            let free = kind.is_command("f");
            if !free && !kind.is_command("n") {
                return Err(PDFError::format_error(format!("Invalid entry in XRef subsection: {}, {}", first, count)));
            }

            // The first entry should be free; tables that start at 1 really mean 0
            if i == 0 && free && first == 1 {
                first = 0;
            }

            let entry = if free {
                XRefEntry::Free { next_free: offset.max(0) as u64, generation: generation as u32 }
            } else {
                XRefEntry::Uncompressed { offset: offset.max(0) as u64, generation: generation as u32 }
            };
            let num = object_number(first, i)
                .ok_or_else(|| PDFError::format_error(format!("Invalid XRef table: object number {} + {}", first, i)))?;
            entries.push((num, entry));
        }
    }

    if entries.iter().any(|(num, entry)| *num == 0 && !entry.is_free()) {
        return Err(PDFError::format_error("Invalid XRef table: unexpected first object"));
    }

    let trailer = match parser.get_object()? {
        PDFObject::Dictionary(dict) => dict,
        PDFObject::Stream { dict, .. } => dict,
        _ => {
            return Err(PDFError::format_error("Invalid XRef table: could not parse trailer dictionary"));
        }
    };
    Ok((entries, trailer))
}

/// `first + i` as an object number, if it fits.
fn object_number(first: i64, i: i64) -> Option<u32> {
    first.checked_add(i).and_then(|num| u32::try_from(num).ok())
}

/// Combines the entries of a hybrid file's table with those of its /XRefStm.
///
/// Table entries win, except that free table slots take the stream's
/// in-use entry for the same object.
fn merge_hybrid_entries(table: Vec<(u32, XRefEntry)>, stream: Vec<(u32, XRefEntry)>) -> Vec<(u32, XRefEntry)> {
    let mut merged: FxHashMap<u32, XRefEntry> = FxHashMap::default();
    for (num, entry) in table {
        merged.entry(num).or_insert(entry);
    }
    for (num, entry) in stream {
        if !entry.is_free() && merged.get(&num).is_none_or(XRefEntry::is_free) {
            merged.insert(num, entry);
        }
    }
    let mut entries: Vec<(u32, XRefEntry)> = merged.into_iter().collect();
    entries.sort_unstable_by_key(|(num, _)| *num);
    entries
}

/// Decodes the binary entries of a cross-reference stream (/W, /Index, /Size).
fn read_xref_stream(dict: &Dict, data: &[u8]) -> PDFResult<Vec<(u32, XRefEntry)>> {
    let widths = dict
        .get("W")
        .and_then(|w| w.as_number_array())
        .filter(|w| w.len() >= 3 && w.iter().all(|&v| v >= 0.0 && v.fract() == 0.0 && v <= 8.0))
        .ok_or_else(|| PDFError::format_error("Invalid XRef entry fields length"))?;
    let (type_width, offset_width, gen_width) = (widths[0] as usize, widths[1] as usize, widths[2] as usize);
    let entry_width = type_width + offset_width + gen_width;

    let ranges = match dict.get("Index").and_then(|i| i.as_number_array()) {
        Some(index) => index,
        None => vec![0.0, dict.get("Size").and_then(|s| s.as_number()).unwrap_or(0.0)],
    };

    let read_field = |bytes: &[u8]| bytes.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64);

    let mut entries = Vec::new();
    let mut pos = 0usize;
    for range in ranges.chunks(2) {
        let [first, n] = range else {
            return Err(PDFError::format_error("Invalid XRef range fields"));
        };
        if first.fract() != 0.0 || n.fract() != 0.0 || *first < 0.0 || *n < 0.0 || *first > f64::from(u32::MAX) {
            return Err(PDFError::format_error(format!("Invalid XRef range fields: {}, {}", first, n)));
        }
        for i in 0..(*n as usize) {
            if pos + entry_width > data.len() {
                return Err(PDFError::format_error("Invalid XRef byteWidths: data ends early"));
            }
            let row = &data[pos..pos + entry_width];
            pos += entry_width;

            // An absent type field defaults to 1
            let kind = if type_width == 0 { 1 } else { read_field(&row[..type_width]) };
            let offset = read_field(&row[type_width..type_width + offset_width]);
            let generation = read_field(&row[type_width + offset_width..]);
            let entry = match kind {
                0 => XRefEntry::Free { next_free: offset, generation: generation as u32 },
                1 => XRefEntry::Uncompressed { offset, generation: generation as u32 },
                2 => XRefEntry::Compressed { obj_stream_num: offset as u32, index: generation as u32 },
                other => return Err(PDFError::format_error(format!("Invalid XRef entry type: {}", other))),
            };
            let num = object_number(*first as i64, i as i64)
                .ok_or_else(|| PDFError::format_error(format!("Invalid XRef range fields: {}, {}", first, n)))?;
            entries.push((num, entry));
        }
    }
    Ok(entries)
}

/// Bytes from `offset` up to the next CR, LF or '<'.
fn read_line_token(data: &[u8], offset: usize) -> &[u8] {
    let end = data[offset..]
        .iter()
        .position(|&b| b == b'\n' || b == b'\r' || b == b'<')
        .map(|p| offset + p)
        .unwrap_or(data.len());
    &data[offset..end]
}

/// True for `keyword` alone or followed by whitespace.
fn keyword_token(token: &[u8], keyword: &[u8]) -> bool {
    token.starts_with(keyword)
        && token
            .get(keyword.len())
            .is_none_or(|&b| Lexer::is_whitespace(b as i32))
}

/// Number of bytes from `offset` to the next occurrence of `what` (or to the end).
fn skip_until(data: &[u8], offset: usize, what: &[u8]) -> usize {
    find_sequence(&data[offset.min(data.len())..], what).unwrap_or(data.len().saturating_sub(offset))
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn skip_pdf_whitespace(data: &[u8], mut pos: usize) -> usize {
    while pos < data.len() && Lexer::is_whitespace(data[pos] as i32) {
        pos += 1;
    }
    pos
}

fn skip_digits(data: &[u8], mut pos: usize) -> usize {
    while pos < data.len() && data[pos].is_ascii_digit() {
        pos += 1;
    }
    pos
}

/// Matches `N G obj` at the start of `data`; returns (num, gen, header length).
fn parse_object_header(data: &[u8]) -> Option<(u32, u32, usize)> {
    let num_end = skip_digits(data, 0);
    if num_end == 0 {
        return None;
    }
    let gen_start = skip_pdf_whitespace(data, num_end);
    if gen_start == num_end {
        return None;
    }
    let gen_end = skip_digits(data, gen_start);
    if gen_end == gen_start {
        return None;
    }
    let obj_start = skip_pdf_whitespace(data, gen_end);
    if obj_start == gen_end || !data[obj_start..].starts_with(b"obj") {
        return None;
    }
    let header_end = obj_start + 3;
    if data.get(header_end).is_some_and(|&b| is_word_byte(b)) {
        return None;
    }
    let num = std::str::from_utf8(&data[..num_end]).ok()?.parse().ok()?;
    let generation = std::str::from_utf8(&data[gen_start..gen_end]).ok()?.parse().ok()?;
    Some((num, generation, header_end))
}

/// Finds what ends the object body starting at `from`: `endobj`, the next
/// `N G obj`, `xref` or `trailer <<`.
///
/// Returns (match start, match end, is endobj).
fn find_object_end(data: &[u8], from: usize) -> Option<(usize, usize, bool)> {
    let at_boundary = |pos: usize| pos == 0 || !is_word_byte(data[pos - 1]);
    let ends_word = |pos: usize| data.get(pos).is_none_or(|&b| !is_word_byte(b));

    let mut pos = from;
    while pos < data.len() {
        if at_boundary(pos) {
            let rest = &data[pos..];
            if rest.starts_with(b"endobj") && ends_word(pos + 6) {
                return Some((pos, pos + 6, true));
            }
            if rest.starts_with(b"xref") && ends_word(pos + 4) {
                return Some((pos, pos + 4, false));
            }
            if rest.starts_with(b"trailer") {
                let after = skip_pdf_whitespace(data, pos + 7);
                if data[after..].starts_with(b"<<") {
                    return Some((pos, after + 2, false));
                }
            }
            if data[pos].is_ascii_digit()
                && let Some((_, _, len)) = parse_object_header(rest)
            {
                return Some((pos, pos + len, false));
            }
        }
        pos += 1;
    }
    None
}
