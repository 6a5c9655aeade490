//! Text helpers shared by the document model, outlines and annotations.

/// PDFDocEncoding code points for bytes that differ from Latin-1.
///
/// Index 0 corresponds to byte 0x18; 0 means undefined.
const PDF_DOC_ENCODING_HIGH: [u16; 0xA1 - 0x18] = {
    let mut table = [0u16; 0xA1 - 0x18];
    let low: [u16; 8] = [0x02D8, 0x02C7, 0x02C6, 0x02D9, 0x02DD, 0x02DB, 0x02DA, 0x02DC];
    let mut i = 0;
    while i < 8 {
        table[i] = low[i];
        i += 1;
    }
    // 0x20..0x7F is ASCII
    let mut b = 0x20;
    while b < 0x80 {
        table[b - 0x18] = b as u16;
        b += 1;
    }
    let high: [u16; 33] = [
        0x2022, 0x2020, 0x2021, 0x2026, 0x2014, 0x2013, 0x0192, 0x2044, 0x2039, 0x203A, 0x2212, 0x2030,
        0x201E, 0x201C, 0x201D, 0x2018, 0x2019, 0x201A, 0x2122, 0xFB01, 0xFB02, 0x0141, 0x0152, 0x0160,
        0x0178, 0x017D, 0x0131, 0x0142, 0x0153, 0x0161, 0x017E, 0x0000, 0x20AC,
    ];
    let mut j = 0;
    while j < 33 {
        table[0x80 - 0x18 + j] = high[j];
        j += 1;
    }
    table
};

/// Maps one PDFDocEncoding byte to a character.
pub fn pdf_doc_encoding_char(byte: u8) -> Option<char> {
    match byte {
        0x18..=0xA0 => match PDF_DOC_ENCODING_HIGH[(byte - 0x18) as usize] {
            0 => None,
            code => char::from_u32(code as u32),
        },
        _ => Some(byte as char),
    }
}

/// Decodes a PDF text string.
///
/// Handles UTF-16BE, UTF-16LE and UTF-8 byte order marks; anything else is
/// PDFDocEncoding. Language escape sequences (`ESC .. ESC`) inside UTF-16
/// strings are removed.
///
/// Based on PDF.js stringToPDFString()
pub fn string_to_pdf_string(bytes: &[u8]) -> String {
    if bytes.len() >= 2 {
        let big_endian = bytes[0] == 0xFE && bytes[1] == 0xFF;
        if big_endian || (bytes[0] == 0xFF && bytes[1] == 0xFE) {
            let units: Vec<u16> = bytes[2..]
                .chunks_exact(2)
                .map(|pair| {
                    if big_endian {
                        u16::from_be_bytes([pair[0], pair[1]])
                    } else {
                        u16::from_le_bytes([pair[0], pair[1]])
                    }
                })
                .collect();
            let decoded = String::from_utf16_lossy(&units);
            return strip_language_escapes(&decoded);
        }
    }
    if bytes.len() >= 3 && bytes[..3] == [0xEF, 0xBB, 0xBF] {
        return String::from_utf8_lossy(&bytes[3..]).into_owned();
    }

    bytes.iter().filter_map(|&b| pdf_doc_encoding_char(b)).collect()
}

fn strip_language_escapes(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_escape = false;
    for ch in text.chars() {
        if ch == '\u{1b}' {
            in_escape = !in_escape;
            continue;
        }
        if !in_escape {
            out.push(ch);
        }
    }
    out
}

/// Removes NUL characters that some writers leave in names and titles.
pub fn remove_nul_chars(text: &str) -> String {
    text.chars().filter(|&c| c != '\0').collect()
}

/// Normalizes a page rotation to 0, 90, 180 or 270.
///
/// Values that are not multiples of 90 become 0.
pub fn normalize_rotation(rotate: i64) -> i32 {
    if rotate % 90 != 0 {
        return 0;
    }
    rotate.rem_euclid(360) as i32
}

/// Normalizes a rectangle so that (x1, y1) is the lower-left corner.
pub fn normalize_rect(rect: [f64; 4]) -> [f64; 4] {
    [
        rect[0].min(rect[2]),
        rect[1].min(rect[3]),
        rect[0].max(rect[2]),
        rect[1].max(rect[3]),
    ]
}

/// Multiplies two affine matrices `[a b c d e f]` (m1 applied after m2).
pub fn transform(m1: &[f64; 6], m2: &[f64; 6]) -> [f64; 6] {
    [
        m1[0] * m2[0] + m1[2] * m2[1],
        m1[1] * m2[0] + m1[3] * m2[1],
        m1[0] * m2[2] + m1[2] * m2[3],
        m1[1] * m2[2] + m1[3] * m2[3],
        m1[0] * m2[4] + m1[2] * m2[5] + m1[4],
        m1[1] * m2[4] + m1[3] * m2[5] + m1[5],
    ]
}

pub const IDENTITY_MATRIX: [f64; 6] = [1.0, 0.0, 0.0, 1.0, 0.0, 0.0];

pub fn apply_transform(point: [f64; 2], m: &[f64; 6]) -> [f64; 2] {
    [
        point[0] * m[0] + point[1] * m[2] + m[4],
        point[0] * m[1] + point[1] * m[3] + m[5],
    ]
}

/// Bounding box of `rect` after transforming its four corners by `m`.
pub fn axial_aligned_bounding_box(rect: [f64; 4], m: &[f64; 6]) -> [f64; 4] {
    let corners = [
        apply_transform([rect[0], rect[1]], m),
        apply_transform([rect[2], rect[3]], m),
        apply_transform([rect[0], rect[3]], m),
        apply_transform([rect[2], rect[1]], m),
    ];
    corners.iter().fold(
        [f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY],
        |b, p| [b[0].min(p[0]), b[1].min(p[1]), b[2].max(p[0]), b[3].max(p[1])],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pdf_doc_encoding() {
        assert_eq!(string_to_pdf_string(b"Hello"), "Hello");
        assert_eq!(string_to_pdf_string(&[0x80, 0x41, 0xA0]), "\u{2022}A\u{20AC}");
        assert_eq!(string_to_pdf_string(&[0x18]), "\u{02D8}");
        assert_eq!(string_to_pdf_string(&[0xE9]), "é");
    }

    #[test]
    fn test_unicode_byte_order_marks() {
        assert_eq!(string_to_pdf_string(&[0xFE, 0xFF, 0x00, 0x48, 0x00, 0x69]), "Hi");
        assert_eq!(string_to_pdf_string(&[0xFF, 0xFE, 0x48, 0x00, 0x69, 0x00]), "Hi");
        assert_eq!(string_to_pdf_string(&[0xEF, 0xBB, 0xBF, 0xC3, 0xA9]), "é");
    }

    #[test]
    fn test_language_escape_removed() {
        let bytes = [0xFE, 0xFF, 0x00, 0x1B, 0x00, 0x65, 0x00, 0x6E, 0x00, 0x1B, 0x00, 0x41];
        assert_eq!(string_to_pdf_string(&bytes), "A");
    }

    #[test]
    fn test_normalize_rotation() {
        assert_eq!(normalize_rotation(0), 0);
        assert_eq!(normalize_rotation(450), 90);
        assert_eq!(normalize_rotation(-90), 270);
        assert_eq!(normalize_rotation(45), 0);
    }

    #[test]
    fn test_transform_identity() {
        let m = [2.0, 0.0, 0.0, 2.0, 10.0, 20.0];
        assert_eq!(transform(&m, &IDENTITY_MATRIX), m);
        assert_eq!(transform(&IDENTITY_MATRIX, &m), m);
    }

    #[test]
    fn test_bounding_box_of_rotated_rect() {
        let rotate_90 = [0.0, 1.0, -1.0, 0.0, 0.0, 0.0];
        assert_eq!(
            axial_aligned_bounding_box([0.0, 0.0, 10.0, 20.0], &rotate_90),
            [-20.0, 0.0, 0.0, 10.0]
        );
    }
}
