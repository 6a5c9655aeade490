use super::error::{PDFError, PDFResult};
use super::lexer::{Lexer, Token};
use super::xref::XRef;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::fmt;

/// Maximum nesting of arrays and dictionaries inside one object.
pub const MAX_NESTING_DEPTH: usize = 256;

/// Maximum chain of indirect fetches triggered while parsing one object.
pub const MAX_FETCH_DEPTH: usize = 32;

/// How far `endstream` is searched for when `/Length` is wrong.
const SCAN_BLOCK_SIZE: usize = 8192;

/// Dictionary storage shared by dictionaries and stream objects.
pub type Dict = HashMap<String, PDFObject>;

/// Indirect object reference in a PDF document.
///
/// Written as "N G R" in a file (e.g., "5 0 R").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ref {
    /// Object number
    pub num: u32,

    /// Generation number (0 for new objects, incremented for updates)
    pub generation: u32,
}

impl Ref {
    #[inline]
    pub const fn new(num: u32, generation: u32) -> Self {
        Self { num, generation }
    }
}

/// Compact form used in generated ids: `12R`, or `12R3` for generation 3.
impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.generation == 0 {
            write!(f, "{}R", self.num)
        } else {
            write!(f, "{}R{}", self.num, self.generation)
        }
    }
}

/// PDF object types as defined in the PDF specification.
#[derive(Debug, Clone, PartialEq)]
pub enum PDFObject {
    /// Null value
    Null,

    /// Boolean value
    Boolean(bool),

    /// Numeric value (integers and reals)
    Number(f64),

    /// String value (from literal strings like (hello))
    String(Vec<u8>),

    /// Hex string value (from hex strings like <48656c6c6f>)
    HexString(Vec<u8>),

    /// Name value (from /Name)
    Name(String),

    /// Array of objects
    /// Uses SmallVec to store up to 4 elements inline (no heap allocation for small arrays)
    /// Uses Box for indirection to avoid infinite type recursion
    Array(SmallVec<[Box<PDFObject>; 4]>),

    /// Dictionary (key-value pairs)
    Dictionary(Dict),

    /// Stream object (dictionary + raw, still encoded, data)
    Stream { dict: Dict, data: Vec<u8> },

    /// Indirect object reference (like "5 0 R")
    Ref(Ref),

    /// End of file marker
    EOF,

    /// Command/operator (like 'q', 'Q', 'cm', 'Tj')
    /// Only used in content streams to distinguish operators from operands
    Command(String),
}

impl PDFObject {
    /// Returns true if this object is the EOF marker.
    pub fn is_eof(&self) -> bool {
        matches!(self, PDFObject::EOF)
    }

    /// Returns true if this object is null.
    pub fn is_null(&self) -> bool {
        matches!(self, PDFObject::Null)
    }

    /// Returns true if this object is the given command.
    #[inline]
    pub fn is_command(&self, cmd: &str) -> bool {
        matches!(self, PDFObject::Command(command) if command == cmd)
    }

    pub fn as_name(&self) -> Option<&str> {
        match self {
            PDFObject::Name(name) => Some(name),
            _ => None,
        }
    }

    /// Returns true if this is the name `name`.
    pub fn is_name(&self, name: &str) -> bool {
        self.as_name() == Some(name)
    }

    /// Returns the bytes of a literal or hex string.
    pub fn as_string(&self) -> Option<&[u8]> {
        match self {
            PDFObject::String(data) | PDFObject::HexString(data) => Some(data),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            PDFObject::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            PDFObject::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the value if it is a whole number.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            PDFObject::Number(n) if n.fract() == 0.0 && n.is_finite() => Some(*n as i64),
            _ => None,
        }
    }

    pub fn as_ref(&self) -> Option<Ref> {
        match self {
            PDFObject::Ref(r) => Some(*r),
            _ => None,
        }
    }

    /// Returns the dictionary of a Dictionary or Stream object.
    pub fn as_dictionary(&self) -> Option<&Dict> {
        match self {
            PDFObject::Dictionary(dict) => Some(dict),
            PDFObject::Stream { dict, .. } => Some(dict),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Box<PDFObject>]> {
        match self {
            PDFObject::Array(arr) => Some(arr),
            _ => None,
        }
    }

    /// Looks up `key` in a dictionary or stream dictionary.
    pub fn get(&self, key: &str) -> Option<&PDFObject> {
        self.as_dictionary().and_then(|dict| dict.get(key))
    }

    /// Returns true if this is a dictionary whose /Type is `type_name`.
    pub fn is_dict_type(&self, type_name: &str) -> bool {
        self.get("Type").is_some_and(|t| t.is_name(type_name))
    }

    /// Reads a numeric array such as a rectangle or matrix.
    pub fn as_number_array(&self) -> Option<Vec<f64>> {
        self.as_array()?
            .iter()
            .map(|item| item.as_number())
            .collect()
    }

    /// Builds an array object from plain values.
    pub fn array(items: impl IntoIterator<Item = PDFObject>) -> Self {
        PDFObject::Array(items.into_iter().map(Box::new).collect())
    }
}

/// PDF Parser for building PDF objects from tokens.
///
/// Analogous to PDF.js's Parser class. Keeps a 2-token lookahead so that
/// indirect references (N G R) and stream objects (dictionary followed by
/// "stream") can be recognized.
///
/// When an [`XRef`] is attached, an indirect `/Length` is resolved through
/// it; otherwise, and whenever the length is wrong, the stream data is
/// delimited by scanning for `endstream`.
pub struct Parser<'a> {
    lexer: Lexer,
    buf1: Option<Token>,
    buf2: Option<Token>,
    xref: Option<&'a XRef>,
    fetch_depth: usize,
    nesting: usize,
}

impl<'a> Parser<'a> {
    /// Creates a parser without reference resolution.
    pub fn new(lexer: Lexer) -> PDFResult<Self> {
        Self::create(lexer, None, 0)
    }

    /// Creates a parser that resolves indirect stream lengths through `xref`.
    ///
    /// `fetch_depth` is the number of fetches already in progress; the
    /// parser refuses to go deeper than [`MAX_FETCH_DEPTH`].
    pub fn with_xref(lexer: Lexer, xref: &'a XRef, fetch_depth: usize) -> PDFResult<Self> {
        Self::create(lexer, Some(xref), fetch_depth)
    }

    fn create(mut lexer: Lexer, xref: Option<&'a XRef>, fetch_depth: usize) -> PDFResult<Self> {
        let buf1 = lexer.get_object()?;
        // Inline image data follows ID directly; never lex past it.
        let buf2 = if matches!(&buf1, Token::Command(c) if c == "ID") {
            None
        } else {
            Some(lexer.get_object()?)
        };
        Ok(Parser {
            lexer,
            buf1: Some(buf1),
            buf2,
            xref,
            fetch_depth,
            nesting: 0,
        })
    }

    /// Advances the lookahead by one token.
    fn shift(&mut self) -> PDFResult<()> {
        if matches!(&self.buf2, Some(Token::Command(c)) if c == "ID") {
            self.buf1 = self.buf2.take();
        } else {
            self.buf1 = match self.buf2.take() {
                Some(token) => Some(token),
                None => Some(self.lexer.get_object()?),
            };
            self.buf2 = Some(self.lexer.get_object()?);
        }
        Ok(())
    }

    /// Returns the next token without consuming it.
    pub fn peek_token(&self) -> Option<&Token> {
        self.buf1.as_ref()
    }

    /// Position of the lexer (one past the lookahead tokens).
    pub fn lexer_position(&self) -> usize {
        self.lexer.get_position()
    }

    /// Checks if there are more objects to parse.
    #[inline]
    pub fn has_more(&self) -> bool {
        !matches!(&self.buf1, Some(Token::EOF) | None)
    }

    /// Gets the next PDF object.
    ///
    /// Based on PDF.js Parser.getObj()
    pub fn get_object(&mut self) -> PDFResult<PDFObject> {
        let token = self.buf1.take().unwrap_or(Token::EOF);
        if matches!(token, Token::EOF) {
            self.buf1 = Some(Token::EOF);
            return Ok(PDFObject::EOF);
        }
        self.shift()?;

        match token {
            Token::ArrayStart => self.parse_array(),
            Token::DictStart => self.parse_dictionary(),

            Token::ArrayEnd => Err(PDFError::parse_error("Unexpected array end token")),
            Token::DictEnd => Err(PDFError::parse_error("Unexpected dictionary end token")),

            Token::Number(n) => {
                if n.fract() == 0.0 && n >= 0.0 {
                    if let (Some(Token::Number(generation)), Some(Token::Command(cmd))) =
                        (&self.buf1, &self.buf2)
                    {
                        if cmd == "R" && generation.fract() == 0.0 && *generation >= 0.0 {
                            let reference = Ref::new(n as u32, *generation as u32);
                            self.shift()?;
                            self.shift()?;
                            return Ok(PDFObject::Ref(reference));
                        }
                    }
                }
                Ok(PDFObject::Number(n))
            }

            Token::Command(cmd) if cmd == "BI" => self.make_inline_image(),

            Token::EOF => Ok(PDFObject::EOF),
            Token::Boolean(b) => Ok(PDFObject::Boolean(b)),
            Token::Null => Ok(PDFObject::Null),
            Token::String(s) => Ok(PDFObject::String(s)),
            Token::HexString(s) => Ok(PDFObject::HexString(s)),
            Token::Name(n) => Ok(PDFObject::Name(n)),
            Token::Command(c) => Ok(PDFObject::Command(c)),
            // PostScript procedures only appear inside function streams,
            // which are consumed as raw bytes.
            Token::BraceStart => Ok(PDFObject::Command("{".to_string())),
            Token::BraceEnd => Ok(PDFObject::Command("}".to_string())),
        }
    }

    fn enter_nesting(&mut self) -> PDFResult<()> {
        self.nesting += 1;
        if self.nesting > MAX_NESTING_DEPTH {
            self.nesting -= 1;
            return Err(PDFError::parse_error(format!(
                "Objects nested deeper than {}",
                MAX_NESTING_DEPTH
            )));
        }
        Ok(())
    }

    /// Parses an array: [ obj1 obj2 ... ]
    fn parse_array(&mut self) -> PDFResult<PDFObject> {
        self.enter_nesting()?;
        let result = self.parse_array_items();
        self.nesting -= 1;
        result
    }

    fn parse_array_items(&mut self) -> PDFResult<PDFObject> {
        let mut array = SmallVec::<[Box<PDFObject>; 4]>::new();

        loop {
            match &self.buf1 {
                Some(Token::ArrayEnd) => {
                    self.shift()?;
                    break;
                }
                Some(Token::EOF) | None => {
                    log::warn!("End of file inside array");
                    break;
                }
                _ => {}
            }

            match self.get_object() {
                Ok(obj) => array.push(Box::new(obj)),
                Err(e) if e.is_fatal_for_recovery() => return Err(e),
                Err(e) => {
                    log::warn!("Error parsing array element: {}, using null", e);
                    array.push(Box::new(PDFObject::Null));
                }
            }
        }

        Ok(PDFObject::Array(array))
    }

    /// Parses a dictionary: << /Key1 value1 /Key2 value2 ... >>
    fn parse_dictionary(&mut self) -> PDFResult<PDFObject> {
        self.enter_nesting()?;
        let result = self.parse_dictionary_entries();
        self.nesting -= 1;
        let dict = result?;

        if !matches!(&self.buf1, Some(Token::DictEnd)) {
            // Hit EOF before '>>'
            return Ok(PDFObject::Dictionary(dict));
        }

        // At this point buf1 = '>>' and buf2 is the lookahead; the lexer sits
        // right after "stream" if this is a stream object.
        if matches!(&self.buf2, Some(Token::Command(cmd)) if cmd == "stream") {
            return self.make_stream(dict);
        }

        self.shift()?;
        Ok(PDFObject::Dictionary(dict))
    }

    fn parse_dictionary_entries(&mut self) -> PDFResult<Dict> {
        let mut dict = Dict::new();

        loop {
            let key = match &self.buf1 {
                Some(Token::DictEnd) => break,
                Some(Token::EOF) | None => {
                    log::warn!("End of file inside dictionary");
                    break;
                }
                Some(Token::Name(name)) => name.clone(),
                Some(other) => {
                    log::warn!("Malformed dictionary: key must be a name object, got {:?}", other);
                    self.shift()?;
                    continue;
                }
            };
            self.shift()?;

            match &self.buf1 {
                Some(Token::EOF) | None => {
                    log::warn!("End of file inside dictionary");
                    break;
                }
                Some(Token::DictEnd) => {
                    dict.insert(key, PDFObject::Null);
                    break;
                }
                _ => {}
            }

            let value = match self.get_object() {
                Ok(val) => val,
                Err(e) if e.is_fatal_for_recovery() => return Err(e),
                Err(e) => {
                    log::warn!("Error parsing dictionary value for key '{}': {}, using null", key, e);
                    PDFObject::Null
                }
            };
            dict.insert(key, value);
        }

        Ok(dict)
    }

    /// Resolves /Length, following an indirect reference through the xref.
    fn stream_length(&self, dict: &Dict) -> PDFResult<Option<usize>> {
        match dict.get("Length") {
            Some(PDFObject::Number(n)) if *n >= 0.0 => Ok(Some(*n as usize)),
            Some(PDFObject::Ref(reference)) => {
                let Some(xref) = self.xref else {
                    log::debug!("Indirect /Length without an xref, scanning for endstream");
                    return Ok(None);
                };
                match xref.fetch_nested(*reference, self.fetch_depth + 1) {
                    Ok(resolved) => match resolved.as_number() {
                        Some(n) if n >= 0.0 => Ok(Some(n as usize)),
                        _ => {
                            log::warn!("Resolved /Length is not a number, scanning for endstream");
                            Ok(None)
                        }
                    },
                    Err(e) if e.is_fatal_for_recovery() => Err(e),
                    Err(e) => {
                        log::warn!(
                            "Failed to resolve /Length reference {}: {}, scanning for endstream",
                            reference, e
                        );
                        Ok(None)
                    }
                }
            }
            _ => Ok(None),
        }
    }

    /// Returns true if the next token at `pos` is `endstream`.
    fn endstream_follows(&self, pos: usize) -> PDFResult<bool> {
        let end = (pos + 64).min(self.lexer.stream_end());
        if pos >= end {
            return Ok(false);
        }
        let bytes = self.lexer.get_byte_range(pos, end)?;
        let skip = bytes
            .iter()
            .take_while(|&&b| Lexer::is_whitespace(b as i32))
            .count();
        Ok(bytes[skip..].starts_with(b"endstream"))
    }

    /// Finds the offset of `needle` at or after `from`.
    fn find_forward(&self, from: usize, needle: &[u8]) -> PDFResult<Option<usize>> {
        let stream_end = self.lexer.stream_end();
        let mut block_start = from;
        while block_start < stream_end {
            let block_end = (block_start + SCAN_BLOCK_SIZE + needle.len()).min(stream_end);
            let block = self.lexer.get_byte_range(block_start, block_end)?;
            if let Some(idx) = find_sequence(&block, needle) {
                return Ok(Some(block_start + idx));
            }
            block_start += SCAN_BLOCK_SIZE;
        }
        Ok(None)
    }

    /// Determines the data length by scanning for `endstream`.
    fn find_stream_length(&self, start: usize) -> PDFResult<usize> {
        let end = match self.find_forward(start, b"endstream")? {
            Some(pos) => pos,
            None => match self.find_forward(start, b"endobj")? {
                Some(pos) => {
                    log::warn!("Missing endstream, stream data ends at endobj");
                    pos
                }
                None => {
                    log::warn!("Missing endstream, stream data runs to end of file");
                    self.lexer.stream_end()
                }
            },
        };

        // Trim the EOL that precedes the keyword
        let mut length = end - start;
        if length > 0 {
            let tail = self.lexer.get_byte_range(end.saturating_sub(2).max(start), end)?;
            if tail.ends_with(b"\r\n") {
                length -= 2;
            } else if tail.ends_with(b"\n") || tail.ends_with(b"\r") {
                length -= 1;
            }
        }
        Ok(length)
    }

    /// Parses a stream object (dictionary followed by stream data).
    ///
    /// Based on PDF.js Parser.makeStream()
    fn make_stream(&mut self, dict: Dict) -> PDFResult<PDFObject> {
        // buf1 = '>>' and buf2 = 'stream'; the lexer sits right after the keyword.
        self.buf1 = None;
        self.buf2 = None;
        self.lexer.skip_to_next_line()?;
        let start = self.lexer.get_position();

        let length = match self.stream_length(&dict)? {
            Some(len)
                if start.checked_add(len).is_some_and(|end| end <= self.lexer.stream_end())
                    && self.endstream_follows(start + len)? =>
            {
                len
            }
            declared => {
                if declared.is_some() {
                    log::warn!("Bad /Length {:?} at offset {}, scanning for endstream", declared, start);
                }
                self.find_stream_length(start)?
            }
        };

        let data = if length == 0 {
            Vec::new()
        } else {
            self.lexer.get_byte_range(start, start + length)?
        };

        self.lexer.set_position(start + length)?;
        let mut next = self.lexer.get_object()?;
        if matches!(&next, Token::Command(cmd) if cmd == "endstream") {
            next = self.lexer.get_object()?;
        }
        self.buf1 = Some(next);
        self.buf2 = Some(self.lexer.get_object()?);

        Ok(PDFObject::Stream { dict, data })
    }

    /// Parses an inline image: `BI <entries> ID <data> EI`.
    ///
    /// Returns the image as a stream object; the next object returned is the
    /// `EI` command. Based on PDF.js Parser.makeInlineImage()
    fn make_inline_image(&mut self) -> PDFResult<PDFObject> {
        let mut dict = Dict::new();
        loop {
            match self.buf1.take() {
                Some(Token::Command(cmd)) if cmd == "ID" => break,
                Some(Token::EOF) | None => {
                    log::warn!("End of file inside inline image dictionary");
                    self.buf1 = Some(Token::EOF);
                    return Ok(PDFObject::Stream { dict, data: Vec::new() });
                }
                Some(Token::Name(key)) => {
                    self.shift()?;
                    if matches!(&self.buf1, Some(Token::EOF) | None) {
                        continue;
                    }
                    let value = match self.get_object() {
                        Ok(value) => value,
                        Err(e) if e.is_fatal_for_recovery() => return Err(e),
                        Err(e) => {
                            log::warn!("Bad inline image entry /{}: {}", key, e);
                            PDFObject::Null
                        }
                    };
                    dict.insert(expand_inline_key(&key).to_string(), expand_inline_value(value));
                }
                Some(other) => {
                    log::warn!("Malformed inline image dictionary entry {:?}", other);
                    self.buf1 = Some(other);
                    self.shift()?;
                }
            }
        }

        // The single whitespace after ID has been consumed as the lexer's
        // current character, so the data starts at the stream position.
        let start = self.lexer.stream_pos();
        let stream_end = self.lexer.stream_end();
        let end_marker = self.find_inline_image_end(start)?;
        let data_end = end_marker.unwrap_or(stream_end);
        let mut length = data_end.saturating_sub(start);
        if end_marker.is_some() && length > 0 {
            let last = self.lexer.get_byte_range(data_end - 1, data_end)?;
            if last.first().is_some_and(|&b| Lexer::is_whitespace(b as i32)) {
                length -= 1;
            }
        }
        let data = if length == 0 {
            Vec::new()
        } else {
            self.lexer.get_byte_range(start, start + length)?
        };

        match end_marker {
            Some(pos) => {
                self.lexer.set_position(pos + 2)?;
                self.buf1 = Some(Token::Command("EI".to_string()));
                self.buf2 = Some(self.lexer.get_object()?);
            }
            None => {
                log::warn!("Inline image without EI");
                self.lexer.set_position(stream_end)?;
                self.buf1 = Some(Token::Command("EI".to_string()));
                self.buf2 = Some(Token::EOF);
            }
        }

        Ok(PDFObject::Stream { dict, data })
    }

    /// Finds an `EI` delimited by whitespace at or after `start`.
    fn find_inline_image_end(&self, start: usize) -> PDFResult<Option<usize>> {
        let stream_end = self.lexer.stream_end();
        let mut search_from = start;
        while let Some(pos) = self.find_forward(search_from, b"EI")? {
            let before_ok = pos == start
                || self
                    .lexer
                    .get_byte_range(pos - 1, pos)?
                    .first()
                    .is_some_and(|&b| Lexer::is_whitespace(b as i32));
            let after_ok = pos + 2 >= stream_end
                || self
                    .lexer
                    .get_byte_range(pos + 2, pos + 3)?
                    .first()
                    .is_some_and(|&b| Lexer::is_whitespace(b as i32) || b == b'%');
            if before_ok && after_ok {
                return Ok(Some(pos));
            }
            search_from = pos + 1;
        }
        Ok(None)
    }
}

fn expand_inline_key(key: &str) -> &str {
    match key {
        "BPC" => "BitsPerComponent",
        "CS" => "ColorSpace",
        "D" => "Decode",
        "DP" => "DecodeParms",
        "F" => "Filter",
        "H" => "Height",
        "IM" => "ImageMask",
        "I" => "Interpolate",
        "W" => "Width",
        "L" => "Length",
        other => other,
    }
}

fn expand_inline_value(value: PDFObject) -> PDFObject {
    match value {
        PDFObject::Name(name) => PDFObject::Name(expand_inline_name(&name).to_string()),
        PDFObject::Array(items) => PDFObject::Array(
            items
                .into_iter()
                .map(|item| Box::new(expand_inline_value(*item)))
                .collect(),
        ),
        other => other,
    }
}

fn expand_inline_name(name: &str) -> &str {
    match name {
        "AHx" => "ASCIIHexDecode",
        "A85" => "ASCII85Decode",
        "LZW" => "LZWDecode",
        "Fl" => "FlateDecode",
        "RL" => "RunLengthDecode",
        "CCF" => "CCITTFaxDecode",
        "DCT" => "DCTDecode",
        "G" => "DeviceGray",
        "RGB" => "DeviceRGB",
        "CMYK" => "DeviceCMYK",
        other => other,
    }
}

/// Returns the first index of `needle` in `haystack`.
pub(crate) fn find_sequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}
