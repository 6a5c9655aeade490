//! ToUnicode CMap parsing.
//!
//! Only the parts needed for text extraction are read: codespace ranges
//! (which decide how many bytes make up one character code) and the
//! `bfchar`/`bfrange` mappings to Unicode.
//!
//! Based on PDF.js src/core/cmap.js

use super::error::PDFResult;
use super::font::glyph_name_to_unicode;
use super::lexer::{Lexer, Token};
use super::stream::Stream;
use rustc_hash::FxHashMap;

/// Largest number of codes a single `bfrange` may expand to.
const MAX_MAP_RANGE: u32 = 0xFFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CodespaceRange {
    num_bytes: usize,
    low: u32,
    high: u32,
}

/// Character code to Unicode mapping read from a `/ToUnicode` stream.
#[derive(Debug, Clone, Default)]
pub struct CMap {
    codespace_ranges: Vec<CodespaceRange>,
    map: FxHashMap<u32, String>,
}

impl CMap {
    /// Parses CMap program text. Unrecognized operators are ignored.
    pub fn parse(data: &[u8]) -> PDFResult<CMap> {
        let mut lexer = Lexer::new(Box::new(Stream::from_bytes(data.to_vec())))?;
        let mut cmap = CMap::default();

        loop {
            match lexer.get_object()? {
                Token::EOF => break,
                Token::Command(cmd) => match cmd.as_str() {
                    "begincodespacerange" => cmap.parse_codespace_range(&mut lexer)?,
                    "beginbfchar" => cmap.parse_bf_char(&mut lexer)?,
                    "beginbfrange" => cmap.parse_bf_range(&mut lexer)?,
                    _ => {}
                },
                _ => {}
            }
        }
        Ok(cmap)
    }

    /// Builds the identity mapping used for `/ToUnicode /Identity-H`.
    pub fn identity() -> CMap {
        CMap {
            codespace_ranges: vec![CodespaceRange {
                num_bytes: 2,
                low: 0,
                high: 0xFFFF,
            }],
            map: FxHashMap::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn has_codespace_ranges(&self) -> bool {
        !self.codespace_ranges.is_empty()
    }

    pub fn lookup(&self, code: u32) -> Option<&str> {
        self.map.get(&code).map(String::as_str)
    }

    /// Reads one character code at `offset`, returning the code and the
    /// number of bytes it spans.
    ///
    /// Bytes are accumulated until the code falls in a codespace range of
    /// matching length. Without a match a single byte is consumed.
    pub fn read_code(&self, bytes: &[u8], offset: usize) -> (u32, usize) {
        let mut code = 0u32;
        for n in 1..=4 {
            let Some(&byte) = bytes.get(offset + n - 1) else {
                break;
            };
            code = (code << 8) | byte as u32;
            if self
                .codespace_ranges
                .iter()
                .any(|range| range.num_bytes == n && range.low <= code && code <= range.high)
            {
                return (code, n);
            }
        }
        (bytes.get(offset).copied().unwrap_or(0) as u32, 1)
    }

    fn parse_codespace_range(&mut self, lexer: &mut Lexer) -> PDFResult<()> {
        loop {
            let low = match lexer.get_object()? {
                Token::HexString(low) => low,
                Token::Command(cmd) if cmd == "endcodespacerange" => return Ok(()),
                Token::EOF => return Ok(()),
                _ => continue,
            };
            let Token::HexString(high) = lexer.get_object()? else {
                log::warn!("Invalid codespace range");
                continue;
            };
            if low.is_empty() || low.len() > 4 {
                continue;
            }
            self.codespace_ranges.push(CodespaceRange {
                num_bytes: low.len(),
                low: code_from_bytes(&low),
                high: code_from_bytes(&high),
            });
        }
    }

    fn parse_bf_char(&mut self, lexer: &mut Lexer) -> PDFResult<()> {
        loop {
            let src = match lexer.get_object()? {
                Token::HexString(src) => src,
                Token::Command(cmd) if cmd == "endbfchar" => return Ok(()),
                Token::EOF => return Ok(()),
                _ => continue,
            };
            let dst = match lexer.get_object()? {
                Token::HexString(dst) => utf16_be_to_string(&dst),
                Token::Name(name) => match glyph_name_to_unicode(&name) {
                    Some(ch) => ch.to_string(),
                    None => continue,
                },
                _ => {
                    log::warn!("Invalid bfchar destination");
                    continue;
                }
            };
            self.map.insert(code_from_bytes(&src), dst);
        }
    }

    fn parse_bf_range(&mut self, lexer: &mut Lexer) -> PDFResult<()> {
        loop {
            let low = match lexer.get_object()? {
                Token::HexString(low) => code_from_bytes(&low),
                Token::Command(cmd) if cmd == "endbfrange" => return Ok(()),
                Token::EOF => return Ok(()),
                _ => continue,
            };
            let Token::HexString(high) = lexer.get_object()? else {
                log::warn!("Invalid bfrange");
                continue;
            };
            let high = code_from_bytes(&high);
            if high < low || high - low > MAX_MAP_RANGE {
                log::warn!("Ignoring bfrange {:#x}..{:#x}", low, high);
                continue;
            }

            match lexer.get_object()? {
                Token::HexString(dst) => {
                    let mut units = utf16_units(&dst);
                    for code in low..=high {
                        self.map.insert(code, String::from_utf16_lossy(&units));
                        if let Some(last) = units.last_mut() {
                            *last = last.wrapping_add(1);
                        }
                    }
                }
                Token::ArrayStart => {
                    let mut code = low;
                    loop {
                        match lexer.get_object()? {
                            Token::HexString(dst) => {
                                if code <= high {
                                    self.map.insert(code, utf16_be_to_string(&dst));
                                }
                                code += 1;
                            }
                            Token::ArrayEnd | Token::EOF => break,
                            _ => {}
                        }
                    }
                }
                _ => log::warn!("Invalid bfrange destination"),
            }
        }
    }
}

fn code_from_bytes(bytes: &[u8]) -> u32 {
    bytes.iter().take(4).fold(0u32, |code, &b| (code << 8) | b as u32)
}

fn utf16_units(bytes: &[u8]) -> Vec<u16> {
    let mut units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    if bytes.len() % 2 == 1 {
        units.push(bytes[bytes.len() - 1] as u16);
    }
    units
}

fn utf16_be_to_string(bytes: &[u8]) -> String {
    String::from_utf16_lossy(&utf16_units(bytes))
}
