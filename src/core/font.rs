//! Font metrics and character decoding for text extraction.
//!
//! Glyph programs are never parsed; a [`Font`] only knows how to split a
//! shown string into character codes, how wide each one is and what Unicode
//! text it stands for.
//!
//! Based on PDF.js src/core/fonts.js and the font loading parts of
//! src/core/evaluator.js

use super::cmap::CMap;
use super::error::PDFResult;
use super::parser::{Dict, PDFObject, Ref};
use super::text_content::TextStyle;
use super::xref::XRef;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// Loaded name used when a font cannot be found or loaded.
pub const ERROR_FONT_NAME: &str = "g_font_error";

const DEFAULT_FONT_MATRIX: [f64; 6] = [0.001, 0.0, 0.0, 0.001, 0.0, 0.0];

/// Largest number of CIDs a single `/W` range may cover.
const MAX_CID_RANGE: u32 = 0xFFFF;

/// WinAnsiEncoding for 0x80..=0x9F. The remaining high bytes match Latin-1.
const WIN_ANSI_80_9F: [u16; 32] = [
    0x20AC, 0x2022, 0x201A, 0x0192, 0x201E, 0x2026, 0x2020, 0x2021, 0x02C6, 0x2030, 0x0160, 0x2039,
    0x0152, 0x2022, 0x017D, 0x2022, 0x2022, 0x2018, 0x2019, 0x201C, 0x201D, 0x2022, 0x2013, 0x2014,
    0x02DC, 0x2122, 0x0161, 0x203A, 0x0153, 0x2022, 0x017E, 0x0178,
];

const GLYPH_NAMES: &[(&str, char)] = &[
    ("space", ' '),
    ("exclam", '!'),
    ("quotedbl", '"'),
    ("numbersign", '#'),
    ("dollar", '$'),
    ("percent", '%'),
    ("ampersand", '&'),
    ("quotesingle", '\''),
    ("parenleft", '('),
    ("parenright", ')'),
    ("asterisk", '*'),
    ("plus", '+'),
    ("comma", ','),
    ("hyphen", '-'),
    ("period", '.'),
    ("slash", '/'),
    ("zero", '0'),
    ("one", '1'),
    ("two", '2'),
    ("three", '3'),
    ("four", '4'),
    ("five", '5'),
    ("six", '6'),
    ("seven", '7'),
    ("eight", '8'),
    ("nine", '9'),
    ("colon", ':'),
    ("semicolon", ';'),
    ("less", '<'),
    ("equal", '='),
    ("greater", '>'),
    ("question", '?'),
    ("at", '@'),
    ("bracketleft", '['),
    ("backslash", '\\'),
    ("bracketright", ']'),
    ("asciicircum", '^'),
    ("underscore", '_'),
    ("grave", '`'),
    ("braceleft", '{'),
    ("bar", '|'),
    ("braceright", '}'),
    ("asciitilde", '~'),
    ("quoteleft", '\u{2018}'),
    ("quoteright", '\u{2019}'),
    ("quotedblleft", '\u{201C}'),
    ("quotedblright", '\u{201D}'),
    ("bullet", '\u{2022}'),
    ("endash", '\u{2013}'),
    ("emdash", '\u{2014}'),
    ("ellipsis", '\u{2026}'),
    ("dagger", '\u{2020}'),
    ("daggerdbl", '\u{2021}'),
    ("fi", '\u{FB01}'),
    ("fl", '\u{FB02}'),
    ("Euro", '\u{20AC}'),
    ("trademark", '\u{2122}'),
    ("copyright", '\u{00A9}'),
    ("registered", '\u{00AE}'),
    ("degree", '\u{00B0}'),
    ("nbspace", '\u{00A0}'),
];

/// Maps a glyph name to its Unicode value.
///
/// Knows the common Latin names plus the `uniXXXX` and `uXXXX[XX]` forms.
pub fn glyph_name_to_unicode(name: &str) -> Option<char> {
    if let Some(&(_, ch)) = GLYPH_NAMES.iter().find(|(glyph, _)| *glyph == name) {
        return Some(ch);
    }
    let mut chars = name.chars();
    if let (Some(ch), None) = (chars.next(), chars.next())
        && ch.is_ascii_alphabetic()
    {
        return Some(ch);
    }
    let hex = name
        .strip_prefix("uni")
        .filter(|hex| hex.len() == 4)
        .or_else(|| name.strip_prefix('u').filter(|hex| (4..=6).contains(&hex.len())))?;
    u32::from_str_radix(hex, 16).ok().and_then(char::from_u32)
}

/// Decodes a single byte as WinAnsiEncoding.
pub fn win_ansi_char(code: u8) -> char {
    match code {
        0x80..=0x9F => char::from_u32(WIN_ANSI_80_9F[(code - 0x80) as usize] as u32).unwrap_or('\u{2022}'),
        _ => code as char,
    }
}

/// One character code of a shown string.
#[derive(Debug, Clone, PartialEq)]
pub struct Glyph {
    pub code: u32,
    pub unicode: String,
    /// Advance in text space units, before font size scaling
    pub width: f64,
    /// Word spacing applies to this code
    pub is_space: bool,
}

/// A font as far as text layout and extraction are concerned.
#[derive(Debug, Clone)]
pub struct Font {
    loaded_name: String,
    subtype: String,
    base_font: Option<String>,
    composite: bool,
    vertical: bool,
    first_char: u32,
    widths: Vec<f64>,
    cid_widths: FxHashMap<u32, f64>,
    default_width: f64,
    font_matrix: [f64; 6],
    ascent: f64,
    descent: f64,
    font_family: String,
    differences: FxHashMap<u32, char>,
    to_unicode: Option<CMap>,
}

impl Font {
    /// Stand-in for fonts that are missing or failed to load.
    pub fn error_font() -> Font {
        Font {
            loaded_name: ERROR_FONT_NAME.to_string(),
            subtype: "Type1".to_string(),
            base_font: None,
            composite: false,
            vertical: false,
            first_char: 0,
            widths: Vec::new(),
            cid_widths: FxHashMap::default(),
            default_width: 0.0,
            font_matrix: DEFAULT_FONT_MATRIX,
            ascent: 0.8,
            descent: -0.2,
            font_family: "sans-serif".to_string(),
            differences: FxHashMap::default(),
            to_unicode: None,
        }
    }

    /// Reads a font dictionary.
    pub fn load(xref: &XRef, dict: &Dict, loaded_name: String) -> PDFResult<Font> {
        let subtype = xref
            .get_resolved(dict, "Subtype")?
            .and_then(|s| s.as_name().map(str::to_string))
            .unwrap_or_else(|| "Type1".to_string());
        let base_font = xref
            .get_resolved(dict, "BaseFont")?
            .and_then(|s| s.as_name().map(str::to_string));
        let composite = subtype == "Type0";

        let mut font = Font {
            loaded_name,
            subtype,
            base_font,
            composite,
            ..Font::error_font()
        };

        let metrics_dict = if composite {
            let descendant = match xref.get_resolved(dict, "DescendantFonts")? {
                Some(PDFObject::Array(fonts)) => match fonts.first() {
                    Some(first) => xref.fetch_if_ref(first)?.as_dictionary().cloned(),
                    None => None,
                },
                Some(PDFObject::Dictionary(descendant)) => Some(descendant),
                _ => None,
            };
            if let Some(PDFObject::Name(encoding)) = xref.get_resolved(dict, "Encoding")? {
                font.vertical = encoding.ends_with("-V");
            }
            descendant.unwrap_or_default()
        } else {
            dict.clone()
        };

        if let Some(matrix) = xref.get_resolved(dict, "FontMatrix")?.and_then(|m| m.as_number_array())
            && matrix.len() == 6
            && matrix[0] != 0.0
        {
            font.font_matrix = [matrix[0], matrix[1], matrix[2], matrix[3], matrix[4], matrix[5]];
        }

        let descriptor = match xref.get_resolved(&metrics_dict, "FontDescriptor")? {
            Some(PDFObject::Dictionary(descriptor)) => Some(descriptor),
            _ => None,
        };
        font.read_descriptor(xref, descriptor.as_ref())?;

        if composite {
            font.read_cid_widths(xref, &metrics_dict)?;
        } else {
            font.read_simple_widths(xref, dict, descriptor.as_ref())?;
            font.read_differences(xref, dict)?;
        }

        font.to_unicode = match xref.get_resolved(dict, "ToUnicode")? {
            Some(PDFObject::Name(name)) if name.starts_with("Identity") => Some(CMap::identity()),
            Some(stream @ PDFObject::Stream { .. }) => match xref.stream_bytes(&stream) {
                Ok(Some(data)) => Some(CMap::parse(&data)?),
                Ok(None) => None,
                Err(err) if err.is_missing_data() => return Err(err),
                Err(err) => {
                    log::warn!("Unable to read ToUnicode of {}: {}", font.loaded_name, err);
                    None
                }
            },
            _ => None,
        };

        Ok(font)
    }

    fn read_descriptor(&mut self, xref: &XRef, descriptor: Option<&Dict>) -> PDFResult<()> {
        let name = self
            .base_font
            .as_deref()
            .map(|name| name.split_once('+').map_or(name, |(_, rest)| rest))
            .unwrap_or("")
            .to_string();
        let mut flags = 0i64;

        if let Some(descriptor) = descriptor {
            let number = |key: &str| -> PDFResult<Option<f64>> {
                Ok(xref.get_resolved(descriptor, key)?.and_then(|v| v.as_number()))
            };
            let bbox = xref
                .get_resolved(descriptor, "FontBBox")?
                .and_then(|b| b.as_number_array())
                .filter(|b| b.len() == 4);
            let scale = self.font_matrix[3].abs().max(f64::EPSILON);

            if let Some(ascent) = number("Ascent")?.filter(|a| *a != 0.0) {
                self.ascent = ascent * scale;
            } else if let Some(bbox) = &bbox {
                self.ascent = bbox[3] * scale;
            }
            if let Some(descent) = number("Descent")?.filter(|d| *d != 0.0) {
                self.descent = descent * scale;
            } else if let Some(bbox) = &bbox {
                self.descent = bbox[1] * scale;
            }
            if let Some(missing) = number("MissingWidth")? {
                self.default_width = missing;
            }
            flags = xref
                .get_resolved(descriptor, "Flags")?
                .and_then(|f| f.as_integer())
                .unwrap_or(0);
        }

        let lower = name.to_ascii_lowercase();
        self.font_family = if flags & 1 != 0 || lower.contains("courier") || lower.contains("mono") {
            "monospace"
        } else if flags & 2 != 0 || lower.contains("times") || (lower.contains("serif") && !lower.contains("sans")) {
            "serif"
        } else {
            "sans-serif"
        }
        .to_string();
        Ok(())
    }

    fn read_simple_widths(&mut self, xref: &XRef, dict: &Dict, descriptor: Option<&Dict>) -> PDFResult<()> {
        self.first_char = xref
            .get_resolved(dict, "FirstChar")?
            .and_then(|c| c.as_integer())
            .filter(|c| (0..=255).contains(c))
            .unwrap_or(0) as u32;
        if let Some(PDFObject::Array(widths)) = xref.get_resolved(dict, "Widths")? {
            self.widths = widths
                .iter()
                .map(|w| Ok(xref.fetch_if_ref(w)?.as_number().unwrap_or(self.default_width)))
                .collect::<PDFResult<_>>()?;
        } else if descriptor.is_none() {
            log::debug!("{} has no Widths", self.loaded_name);
        }
        Ok(())
    }

    /// Reads `/DW` and `/W` from a CIDFont dictionary.
    fn read_cid_widths(&mut self, xref: &XRef, cid_font: &Dict) -> PDFResult<()> {
        self.default_width = xref
            .get_resolved(cid_font, "DW")?
            .and_then(|w| w.as_number())
            .unwrap_or(1000.0);

        let Some(PDFObject::Array(w)) = xref.get_resolved(cid_font, "W")? else {
            return Ok(());
        };
        let items = w
            .iter()
            .map(|item| xref.fetch_if_ref(item))
            .collect::<PDFResult<Vec<_>>>()?;

        let mut i = 0;
        while i < items.len() {
            let Some(start) = items[i].as_integer().and_then(|s| u32::try_from(s).ok()) else {
                i += 1;
                continue;
            };
            match items.get(i + 1) {
                Some(PDFObject::Array(list)) => {
                    for (offset, width) in list.iter().enumerate() {
                        let Some(cid) = u32::try_from(offset).ok().and_then(|o| start.checked_add(o)) else {
                            break;
                        };
                        if let Some(width) = xref.fetch_if_ref(width)?.as_number() {
                            self.cid_widths.insert(cid, width);
                        }
                    }
                    i += 2;
                }
                Some(end) => {
                    let end = end.as_integer().and_then(|e| u32::try_from(e).ok());
                    let width = items.get(i + 2).and_then(|w| w.as_number());
                    if let (Some(width), Some(end)) = (width, end)
                        && end >= start
                        && end - start <= MAX_CID_RANGE
                    {
                        for cid in start..=end {
                            self.cid_widths.insert(cid, width);
                        }
                    }
                    i += 3;
                }
                None => break,
            }
        }
        Ok(())
    }

    fn read_differences(&mut self, xref: &XRef, dict: &Dict) -> PDFResult<()> {
        let Some(PDFObject::Dictionary(encoding)) = xref.get_resolved(dict, "Encoding")? else {
            return Ok(());
        };
        let Some(PDFObject::Array(differences)) = xref.get_resolved(&encoding, "Differences")? else {
            return Ok(());
        };
        let mut code = 0u32;
        for item in differences.iter() {
            match xref.fetch_if_ref(item)? {
                PDFObject::Number(n) => code = n.max(0.0) as u32,
                PDFObject::Name(name) => {
                    if let Some(ch) = glyph_name_to_unicode(&name) {
                        self.differences.insert(code, ch);
                    }
                    code += 1;
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn loaded_name(&self) -> &str {
        &self.loaded_name
    }

    pub fn subtype(&self) -> &str {
        &self.subtype
    }

    pub fn base_font(&self) -> Option<&str> {
        self.base_font.as_deref()
    }

    pub fn is_composite(&self) -> bool {
        self.composite
    }

    pub fn is_vertical(&self) -> bool {
        self.vertical
    }

    pub fn font_matrix(&self) -> &[f64; 6] {
        &self.font_matrix
    }

    pub fn text_style(&self) -> TextStyle {
        TextStyle {
            font_family: self.font_family.clone(),
            ascent: self.ascent,
            descent: self.descent,
            vertical: self.vertical,
        }
    }

    /// Advance of `code` in glyph space units.
    fn glyph_width(&self, code: u32) -> f64 {
        if self.composite {
            return self.cid_widths.get(&code).copied().unwrap_or(self.default_width);
        }
        code.checked_sub(self.first_char)
            .and_then(|index| self.widths.get(index as usize))
            .copied()
            .unwrap_or(self.default_width)
    }

    fn unicode(&self, code: u32) -> String {
        if let Some(cmap) = &self.to_unicode {
            if let Some(text) = cmap.lookup(code) {
                return text.to_string();
            }
            if cmap.is_empty() && self.composite {
                return char::from_u32(code).map(String::from).unwrap_or_default();
            }
        }
        if self.composite {
            return char::from_u32(code).map(String::from).unwrap_or_default();
        }
        if let Some(ch) = self.differences.get(&code) {
            return ch.to_string();
        }
        u8::try_from(code).map(|b| win_ansi_char(b).to_string()).unwrap_or_default()
    }

    /// Splits a shown string into glyphs.
    ///
    /// Code lengths come from the ToUnicode codespace ranges when present,
    /// otherwise composite fonts read 2-byte codes and simple fonts 1-byte.
    pub fn chars_to_glyphs(&self, bytes: &[u8]) -> Vec<Glyph> {
        let mut glyphs = Vec::with_capacity(bytes.len());
        let codespace = self
            .to_unicode
            .as_ref()
            .filter(|cmap| cmap.has_codespace_ranges());
        let mut offset = 0;

        while offset < bytes.len() {
            let (code, length) = match codespace {
                Some(cmap) => cmap.read_code(bytes, offset),
                None if self.composite => match bytes.get(offset + 1) {
                    Some(&low) => (((bytes[offset] as u32) << 8) | low as u32, 2),
                    None => (bytes[offset] as u32, 1),
                },
                None => (bytes[offset] as u32, 1),
            };
            offset += length;
            glyphs.push(Glyph {
                code,
                unicode: self.unicode(code),
                width: self.glyph_width(code) * self.font_matrix[0],
                is_space: length == 1 && code == 0x20,
            });
        }
        glyphs
    }
}

/// Per-document cache of loaded fonts, keyed by font dictionary reference.
///
/// Inline font dictionaries are not cached; they draw fresh ids from the
/// shared counter instead.
#[derive(Debug, Default)]
pub struct FontCache {
    fonts: Mutex<FxHashMap<Ref, Arc<Font>>>,
    next_inline_id: AtomicU32,
}

impl FontCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, reference: Ref) -> Option<Arc<Font>> {
        self.fonts.lock().ok()?.get(&reference).cloned()
    }

    /// Stores a loaded font. When another task got there first, its font is
    /// kept and returned.
    pub fn insert(&self, reference: Ref, font: Font) -> Arc<Font> {
        let font = Arc::new(font);
        match self.fonts.lock() {
            Ok(mut fonts) => Arc::clone(fonts.entry(reference).or_insert(font)),
            Err(_) => font,
        }
    }

    pub fn len(&self) -> usize {
        self.fonts.lock().map(|fonts| fonts.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Next id for a font without a reference.
    pub fn next_inline_id(&self) -> u32 {
        self.next_inline_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}
