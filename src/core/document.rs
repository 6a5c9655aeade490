use super::base_stream::BaseStream;
use super::catalog::Catalog;
use super::crypto::calculate_md5;
use super::error::{PDFError, PDFResult};
use super::font::FontCache;
use super::lexer::Lexer;
use super::page::Page;
use super::parser::{find_sequence, Dict, PDFObject, Parser, Ref};
use super::stream::Stream;
use super::util::string_to_pdf_string;
use super::xref::XRef;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

const PDF_HEADER_SIGNATURE: &[u8] = b"%PDF-";
const STARTXREF_SIGNATURE: &[u8] = b"startxref";
const ENDOBJ_SIGNATURE: &[u8] = b"endobj";

/// How far into the file the header may appear.
const HEADER_SEARCH_LIMIT: usize = 1024;
/// Window size of the backward `startxref` search.
const STARTXREF_SEARCH_STEP: usize = 1024;
/// How far into a linearized file the first `endobj` is looked for.
const ENDOBJ_SEARCH_LIMIT: usize = 1024;
/// Bytes hashed for the fingerprint when the trailer has no usable /ID.
const FINGERPRINT_FIRST_BYTES: usize = 1024;
const EMPTY_FINGERPRINT: [u8; 16] = [0; 16];

/// Parameters of a linearized ("fast web view") file.
///
/// Based on PDF.js src/core/parser.js Linearization
#[derive(Debug, Clone, PartialEq)]
pub struct Linearization {
    /// File length (/L)
    pub length: usize,
    /// Primary hint stream offset and length (/H)
    pub hints: Vec<usize>,
    /// Object number of the first page (/O)
    pub object_number_first: u32,
    /// End of the first page section (/E)
    pub end_first: usize,
    /// Page count (/N)
    pub num_pages: usize,
    /// Offset of the main cross-reference table (/T)
    pub main_xref_entries_offset: usize,
    /// Index of the first page (/P)
    pub page_first: usize,
}

impl Linearization {
    fn get_int(dict: &Dict, name: &str, allow_zero: bool) -> PDFResult<usize> {
        match dict.get(name).and_then(|v| v.as_integer()) {
            Some(value) if value > 0 || (allow_zero && value == 0) => Ok(value as usize),
            _ => Err(PDFError::format_error(format!(
                "The \"{}\" parameter in the linearization dictionary is invalid.",
                name
            ))),
        }
    }

    fn get_hints(dict: &Dict) -> PDFResult<Vec<usize>> {
        if let Some(PDFObject::Array(hints)) = dict.get("H")
            && (hints.len() == 2 || hints.len() == 4)
        {
            let values: Option<Vec<usize>> = hints
                .iter()
                .map(|h| h.as_integer().filter(|&v| v > 0).map(|v| v as usize))
                .collect();
            if let Some(values) = values {
                return Ok(values);
            }
        }
        Err(PDFError::format_error("Hint array in the linearization dictionary is invalid."))
    }

    /// Reads the linearization dictionary from the first object of `stream`.
    ///
    /// Returns `Ok(None)` for regular files.
    pub fn create(stream: &dyn BaseStream) -> PDFResult<Option<Self>> {
        let sub_stream = stream.make_sub_stream(stream.start(), stream.length())?;
        let mut parser = Parser::new(Lexer::new(sub_stream)?)?;
        let obj1 = parser.get_object()?;
        let obj2 = parser.get_object()?;
        let obj3 = parser.get_object()?;
        let lin_dict = parser.get_object()?;

        let PDFObject::Dictionary(lin_dict) = lin_dict else {
            return Ok(None);
        };
        let linearized = lin_dict.get("Linearized").and_then(|v| v.as_number());
        if obj1.as_integer().is_none()
            || obj2.as_integer().is_none()
            || !obj3.is_command("obj")
            || !linearized.is_some_and(|v| v > 0.0)
        {
            return Ok(None);
        }

        let length = Self::get_int(&lin_dict, "L", false)?;
        if length != stream.length() {
            return Err(PDFError::format_error(
                "The \"L\" parameter in the linearization dictionary does not equal the stream length.",
            ));
        }
        Ok(Some(Linearization {
            length,
            hints: Self::get_hints(&lin_dict)?,
            object_number_first: Self::get_int(&lin_dict, "O", false)? as u32,
            end_first: Self::get_int(&lin_dict, "E", false)?,
            num_pages: Self::get_int(&lin_dict, "N", false)?,
            main_xref_entries_offset: Self::get_int(&lin_dict, "T", false)?,
            page_first: if lin_dict.contains_key("P") {
                Self::get_int(&lin_dict, "P", true)?
            } else {
                0
            },
        }))
    }
}

/// A value of a non-standard `/Info` key.
#[derive(Debug, Clone, PartialEq)]
pub enum InfoValue {
    String(String),
    Number(f64),
    Boolean(bool),
    Name(String),
}

/// Document-level information: `/Info` entries plus structural flags.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentInfo {
    pub pdf_format_version: Option<String>,
    pub language: Option<String>,
    pub encrypt_filter_name: Option<String>,
    pub is_linearized: bool,
    pub is_acroform_present: bool,
    pub is_xfa_present: bool,
    pub is_collection_present: bool,
    pub encrypted: bool,

    pub title: Option<String>,
    pub author: Option<String>,
    pub subject: Option<String>,
    pub keywords: Option<String>,
    pub creator: Option<String>,
    pub producer: Option<String>,
    pub creation_date: Option<String>,
    pub mod_date: Option<String>,
    pub trapped: Option<String>,
    pub custom: BTreeMap<String, InfoValue>,
}

/// A PDF document: header, cross-reference table and catalog.
///
/// Loading happens in steps so that a progressive loader can retry each one
/// after fetching missing bytes: [`check_header`](Self::check_header),
/// [`parse_start_xref`](Self::parse_start_xref), then
/// [`setup`](Self::setup). [`open`](Self::open) runs all three for bytes
/// that are fully resident.
///
/// Based on PDF.js src/core/document.js PDFDocument
pub struct PDFDocument {
    doc_id: u32,
    xref: XRef,
    catalog: Option<Catalog>,
    pdf_format_version: Option<String>,
    font_cache: Arc<FontCache>,

    linearization: OnceLock<Option<Linearization>>,
    fingerprints: OnceLock<(String, Option<String>)>,
    document_info: OnceLock<DocumentInfo>,
}

impl PDFDocument {
    /// Wraps `stream`; nothing is parsed until the loading steps run.
    pub fn new(doc_id: u32, stream: Box<dyn BaseStream>, password: Option<Vec<u8>>) -> Self {
        PDFDocument {
            doc_id,
            xref: XRef::new(stream, password),
            catalog: None,
            pdf_format_version: None,
            font_cache: Arc::new(FontCache::new()),
            linearization: OnceLock::new(),
            fingerprints: OnceLock::new(),
            document_info: OnceLock::new(),
        }
    }

    /// Opens a fully resident document, falling back to recovery mode when
    /// the cross-reference data is broken.
    ///
    /// # Example
    /// ```no_run
    /// use pdf_engine::core::PDFDocument;
    ///
    /// let pdf_data = std::fs::read("document.pdf").unwrap();
    /// let doc = PDFDocument::open(pdf_data).unwrap();
    /// println!("{} pages", doc.num_pages().unwrap());
    /// ```
    pub fn open(data: Vec<u8>) -> PDFResult<Self> {
        Self::open_with_password(data, None)
    }

    pub fn open_with_password(data: Vec<u8>, password: Option<Vec<u8>>) -> PDFResult<Self> {
        let mut document = PDFDocument::new(0, Box::new(Stream::from_bytes(data)), password);
        document.check_header()?;
        document.parse_start_xref()?;
        match document.setup(false) {
            Err(PDFError::XRefParse(reason)) => {
                log::info!("XRef parse error ({}), retrying in recovery mode", reason);
                document.setup(true)?;
            }
            other => other?,
        }
        Ok(document)
    }

    pub fn doc_id(&self) -> u32 {
        self.doc_id
    }

    pub fn xref(&self) -> &XRef {
        &self.xref
    }

    pub fn xref_mut(&mut self) -> &mut XRef {
        &mut self.xref
    }

    /// The catalog, available after [`setup`](Self::setup).
    pub fn catalog(&self) -> PDFResult<&Catalog> {
        self.catalog
            .as_ref()
            .ok_or_else(|| PDFError::unknown("Document has not been set up"))
    }

    pub fn font_cache(&self) -> &Arc<FontCache> {
        &self.font_cache
    }

    /// The header version, e.g. `1.7`, when it was valid.
    pub fn pdf_format_version(&self) -> Option<&str> {
        self.pdf_format_version.as_deref()
    }

    /// Locates `%PDF-` in the first kilobyte and makes it the stream start.
    ///
    /// A missing header is tolerated with a warning.
    pub fn check_header(&mut self) -> PDFResult<()> {
        let stream = self.xref.stream_mut();
        stream.reset()?;
        let start = stream.start();
        let limit = (start + HEADER_SEARCH_LIMIT).min(stream.end());
        let head = stream.get_byte_range(start, limit)?;
        let Some(offset) = find_sequence(&head, PDF_HEADER_SIGNATURE) else {
            log::warn!("PDF header not found");
            return Ok(());
        };

        stream.set_pos(start + offset)?;
        stream.move_start()?;
        stream.skip(PDF_HEADER_SIGNATURE.len())?;

        let mut version = String::new();
        while version.len() < 12 {
            match stream.get_byte() {
                Ok(ch) if ch > 0x20 => version.push(ch as char),
                Ok(_) | Err(PDFError::UnexpectedEndOfStream) => break,
                Err(e) => return Err(e),
            }
        }
        if is_valid_version(&version) {
            self.pdf_format_version = Some(version);
        } else {
            log::warn!("Invalid PDF header version: {}", version);
        }
        Ok(())
    }

    /// The linearization parameters, or `None` for regular files.
    ///
    /// An invalid linearization dictionary is treated as absent.
    pub fn linearization(&self) -> PDFResult<Option<&Linearization>> {
        if let Some(linearization) = self.linearization.get() {
            return Ok(linearization.as_ref());
        }
        let linearization = match Linearization::create(self.xref.stream()) {
            Ok(linearization) => linearization,
            Err(e) if e.is_fatal_for_recovery() => return Err(e),
            Err(e) => {
                log::info!("{}", e);
                None
            }
        };
        if linearization.is_some() {
            log::info!("Document is linearized");
        }
        Ok(self.linearization.get_or_init(|| linearization).as_ref())
    }

    /// Finds the newest cross-reference section and hands it to the XRef.
    ///
    /// Linearized files start right after the first `endobj`; otherwise the
    /// last `startxref` keyword is searched backwards from the end. Missing
    /// or invalid digits give offset 0.
    pub fn parse_start_xref(&mut self) -> PDFResult<()> {
        let start_xref = if self.linearization()?.is_some() {
            let stream = self.xref.stream();
            let limit = (stream.start() + ENDOBJ_SEARCH_LIMIT).min(stream.end());
            let head = stream.get_byte_range(stream.start(), limit)?;
            match find_sequence(&head, ENDOBJ_SIGNATURE) {
                Some(offset) => offset + ENDOBJ_SIGNATURE.len(),
                None => 0,
            }
        } else {
            self.find_start_xref_offset()?
        };
        self.xref.set_start_xref(start_xref);
        Ok(())
    }

    fn find_start_xref_offset(&self) -> PDFResult<usize> {
        let stream = self.xref.stream();
        let start = stream.start();
        let step_back = STARTXREF_SEARCH_STEP - STARTXREF_SIGNATURE.len();

        let mut pos = stream.end();
        let mut found = None;
        while found.is_none() && pos > start {
            pos = pos.saturating_sub(step_back).max(start);
            let window_end = (pos + STARTXREF_SEARCH_STEP).min(stream.end());
            let window = stream.get_byte_range(pos, window_end)?;
            found = window
                .windows(STARTXREF_SIGNATURE.len())
                .rposition(|w| w == STARTXREF_SIGNATURE)
                .map(|idx| pos + idx);
        }
        let Some(keyword_pos) = found else {
            return Ok(0);
        };

        let digits_start = keyword_pos + STARTXREF_SIGNATURE.len();
        let tail = stream.get_byte_range(digits_start, (digits_start + 64).min(stream.end()))?;
        let digits: String = tail
            .iter()
            .skip_while(|&&b| Lexer::is_whitespace(b as i32))
            .take_while(|b| b.is_ascii_digit())
            .map(|&b| b as char)
            .collect();
        Ok(digits.parse().unwrap_or(0))
    }

    /// Parses the cross-reference data and builds the catalog.
    pub fn setup(&mut self, recovery_mode: bool) -> PDFResult<()> {
        self.catalog = None;
        self.xref.parse(recovery_mode)?;
        self.catalog = Some(Catalog::new(&self.xref)?);
        Ok(())
    }

    /// Page count; linearized files answer from `/N`.
    pub fn num_pages(&self) -> PDFResult<usize> {
        if let Some(linearization) = self.linearization()? {
            return Ok(linearization.num_pages);
        }
        self.catalog()?.num_pages(&self.xref)
    }

    /// The first page of a linearized file, fetched directly by `/O`.
    fn linearization_page(&self, linearization: &Linearization) -> PDFResult<(Dict, Ref)> {
        let reference = Ref::new(linearization.object_number_first, 0);
        let obj = self.xref.fetch(reference)?;
        if let Some(dict) = obj.as_dictionary() {
            let is_page = match dict.get("Type") {
                Some(page_type) => page_type.is_name("Page"),
                None => dict.contains_key("Contents"),
            };
            if is_page {
                return Ok((dict.clone(), reference));
            }
        }
        Err(PDFError::format_error(
            "The Linearization dictionary doesn't point to a valid Page dictionary.",
        ))
    }

    /// Builds the page at `page_index`.
    pub fn get_page(&self, page_index: usize) -> PDFResult<Page> {
        if let Some(linearization) = self.linearization()?
            && linearization.page_first == page_index
        {
            match self.linearization_page(linearization) {
                Ok((dict, reference)) => {
                    return Ok(self.make_page(page_index, dict, Some(reference)));
                }
                Err(e) if e.is_fatal_for_recovery() => return Err(e),
                Err(e) => log::info!("{}", e),
            }
        }
        let (dict, reference) = self.catalog()?.get_page_dict(&self.xref, page_index)?;
        Ok(self.make_page(page_index, dict, reference))
    }

    fn make_page(&self, page_index: usize, dict: Dict, reference: Option<Ref>) -> Page {
        Page::new(page_index, dict, reference, self.doc_id, Arc::clone(&self.font_cache))
    }

    /// Hex fingerprints: the first `/ID` element (or an MD5 of the first
    /// kilobyte) and the second `/ID` element when it differs.
    pub fn fingerprints(&self) -> PDFResult<&(String, Option<String>)> {
        if let Some(fingerprints) = self.fingerprints.get() {
            return Ok(fingerprints);
        }

        let ids = match self.xref.trailer().and_then(|t| t.get("ID")) {
            Some(ids) => match self.xref.fetch_if_ref(ids) {
                Ok(PDFObject::Array(ids)) => ids.into_iter().map(|id| *id).collect(),
                Ok(_) => Vec::new(),
                Err(e) if e.is_fatal_for_recovery() => return Err(e),
                Err(_) => Vec::new(),
            },
            None => Vec::new(),
        };
        fn valid(id: &PDFObject) -> Option<&[u8]> {
            id.as_string().filter(|s| !s.is_empty() && *s != EMPTY_FINGERPRINT)
        }

        let fingerprints = match ids.first().and_then(valid) {
            Some(original) => {
                let modified = ids
                    .get(1)
                    .and_then(valid)
                    .filter(|modified| *modified != original)
                    .map(hex::encode);
                (hex::encode(original), modified)
            }
            None => {
                let stream = self.xref.stream();
                let end = FINGERPRINT_FIRST_BYTES.min(stream.end());
                let head = stream.get_byte_range(0, end)?;
                (hex::encode(calculate_md5(&head)), None)
            }
        };
        Ok(self.fingerprints.get_or_init(|| fingerprints))
    }

    /// The primary fingerprint.
    pub fn fingerprint(&self) -> PDFResult<&str> {
        Ok(self.fingerprints()?.0.as_str())
    }

    /// `/Info` entries and structural flags.
    pub fn document_info(&self) -> PDFResult<&DocumentInfo> {
        if let Some(info) = self.document_info.get() {
            return Ok(info);
        }

        let catalog = self.catalog()?;
        let (is_acroform_present, is_xfa_present) = self.form_info()?;
        let mut info = DocumentInfo {
            pdf_format_version: self.pdf_format_version.clone(),
            language: catalog.lang(&self.xref)?,
            encrypt_filter_name: self.xref.encrypt().map(|_| "Standard".to_string()),
            is_linearized: self.linearization()?.is_some(),
            is_acroform_present,
            is_xfa_present,
            is_collection_present: catalog.has_collection(&self.xref)?,
            encrypted: self.xref.encrypt().is_some(),
            ..DocumentInfo::default()
        };

        let info_dict = match self.xref.trailer().and_then(|t| t.get("Info")) {
            Some(value) => match self.xref.fetch_if_ref(value) {
                Ok(PDFObject::Dictionary(dict)) => Some(dict),
                Ok(_) => None,
                Err(e) if e.is_fatal_for_recovery() => return Err(e),
                Err(_) => {
                    log::info!("The document information dictionary is invalid.");
                    None
                }
            },
            None => None,
        };

        if let Some(info_dict) = info_dict {
            for (key, value) in &info_dict {
                let value = self.xref.fetch_if_ref(value)?;
                let text = value.as_string().map(string_to_pdf_string);
                let slot = match key.as_str() {
                    "Title" => &mut info.title,
                    "Author" => &mut info.author,
                    "Subject" => &mut info.subject,
                    "Keywords" => &mut info.keywords,
                    "Creator" => &mut info.creator,
                    "Producer" => &mut info.producer,
                    "CreationDate" => &mut info.creation_date,
                    "ModDate" => &mut info.mod_date,
                    "Trapped" => {
                        match value.as_name() {
                            Some(name) => info.trapped = Some(name.to_string()),
                            None => log::debug!("Bad value, for key \"Trapped\", in Info: {:?}.", value),
                        }
                        continue;
                    }
                    _ => {
                        let custom = match &value {
                            PDFObject::Number(n) => Some(InfoValue::Number(*n)),
                            PDFObject::Boolean(b) => Some(InfoValue::Boolean(*b)),
                            PDFObject::Name(n) => Some(InfoValue::Name(n.clone())),
                            _ => text.map(InfoValue::String),
                        };
                        match custom {
                            Some(custom) => {
                                info.custom.insert(key.clone(), custom);
                            }
                            None => log::debug!("Bad value, for custom key \"{}\", in Info: {:?}.", key, value),
                        }
                        continue;
                    }
                };
                match text {
                    Some(text) => *slot = Some(text),
                    None => log::debug!("Bad value, for key \"{}\", in Info: {:?}.", key, value),
                }
            }
        }

        Ok(self.document_info.get_or_init(|| info))
    }

    /// (AcroForm with fields present, XFA present).
    fn form_info(&self) -> PDFResult<(bool, bool)> {
        let Some(acro_form) = self.catalog()?.acro_form(&self.xref)? else {
            return Ok((false, false));
        };
        let has_fields = matches!(
            self.xref.get_resolved(&acro_form, "Fields")?,
            Some(PDFObject::Array(fields)) if !fields.is_empty()
        );
        let has_xfa = match self.xref.get_resolved(&acro_form, "XFA")? {
            Some(PDFObject::Array(parts)) => !parts.is_empty(),
            Some(PDFObject::Stream { .. }) => true,
            _ => false,
        };
        Ok((has_fields && !has_xfa, has_xfa))
    }

    /// The XMP metadata, when present.
    pub fn metadata(&self) -> PDFResult<Option<String>> {
        self.catalog()?.metadata(&self.xref)
    }
}

/// `1.0` through `9.9`.
fn is_valid_version(version: &str) -> bool {
    let bytes = version.as_bytes();
    bytes.len() == 3 && (b'1'..=b'9').contains(&bytes[0]) && bytes[1] == b'.' && bytes[2].is_ascii_digit()
}
