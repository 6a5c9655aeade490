/// Stream decoding and decompression utilities.
///
/// Applies the /Filter chain of a stream object. Supports FlateDecode,
/// LZWDecode, ASCIIHexDecode, ASCII85Decode and RunLengthDecode, plus PNG
/// and TIFF predictors. Image codecs (DCT, JPX, JBIG2, CCITT) are left
/// encoded for the consumer.
///
/// Based on PDF.js src/core/flate_stream.js, lzw_stream.js, ascii_85_stream.js,
/// run_length_stream.js and predictor_stream.js
use super::error::{PDFError, PDFResult};
use super::parser::{Dict, PDFObject};
use flate2::read::{DeflateDecoder, ZlibDecoder};
use std::io::Read;
use weezl::{decode::Decoder as LzwDecoder, BitOrder};

/// Filters whose output is image data rather than bytes for the engine.
const IMAGE_FILTERS: &[&str] = &[
    "DCTDecode",
    "DCT",
    "JPXDecode",
    "JBIG2Decode",
    "CCITTFaxDecode",
    "CCF",
];

/// Returns true if `name` is an image codec that is passed through encoded.
pub fn is_image_filter(name: &str) -> bool {
    IMAGE_FILTERS.contains(&name)
}

/// Decodes a FlateDecode (zlib/deflate) compressed stream.
///
/// Raw deflate data without a zlib header is accepted too. A corrupt or
/// truncated stream yields whatever was decoded before the error.
pub fn decode_flate(compressed_data: &[u8]) -> PDFResult<Vec<u8>> {
    let mut decompressed = Vec::new();
    let zlib_err = match ZlibDecoder::new(compressed_data).read_to_end(&mut decompressed) {
        Ok(_) => return Ok(decompressed),
        Err(e) => e,
    };
    if !decompressed.is_empty() {
        log::warn!("FlateDecode: {} after {} bytes, keeping partial output", zlib_err, decompressed.len());
        return Ok(decompressed);
    }

    let mut raw = Vec::new();
    match DeflateDecoder::new(compressed_data).read_to_end(&mut raw) {
        Ok(_) => Ok(raw),
        Err(_) if !raw.is_empty() => Ok(raw),
        Err(deflate_err) => Err(PDFError::Decode(format!(
            "FlateDecode error: zlib failed ({}), raw deflate failed ({}), {} bytes",
            zlib_err,
            deflate_err,
            compressed_data.len()
        ))),
    }
}

/// Decodes LZW data. `early_change` is the /EarlyChange parameter (default 1).
pub fn decode_lzw(data: &[u8], early_change: bool) -> PDFResult<Vec<u8>> {
    let mut decoder = if early_change {
        LzwDecoder::with_tiff_size_switch(BitOrder::Msb, 8)
    } else {
        LzwDecoder::new(BitOrder::Msb, 8)
    };
    let mut output = Vec::new();
    let result = decoder.into_stream(&mut output).decode_all(data);
    match result.status {
        Ok(_) => Ok(output),
        Err(e) if !output.is_empty() => {
            log::warn!("LZWDecode: {}, keeping partial output", e);
            Ok(output)
        }
        Err(e) => Err(PDFError::Decode(format!("LZWDecode error: {}", e))),
    }
}

/// Decodes ASCIIHex data. Whitespace is ignored and `>` ends the data.
pub fn decode_ascii_hex(data: &[u8]) -> PDFResult<Vec<u8>> {
    let mut result = Vec::with_capacity(data.len() / 2);
    let mut first_digit: Option<u8> = None;

    for &byte in data {
        if byte == b'>' {
            break;
        }
        let digit = match byte {
            b'0'..=b'9' => byte - b'0',
            b'a'..=b'f' => byte - b'a' + 10,
            b'A'..=b'F' => byte - b'A' + 10,
            _ => continue,
        };
        match first_digit.take() {
            Some(high) => result.push((high << 4) | digit),
            None => first_digit = Some(digit),
        }
    }

    // Odd number of digits: implicit trailing 0
    if let Some(high) = first_digit {
        result.push(high << 4);
    }
    Ok(result)
}

/// Decodes ASCII85 data up to the `~>` end marker.
pub fn decode_ascii85(data: &[u8]) -> PDFResult<Vec<u8>> {
    let mut result = Vec::with_capacity(data.len() * 4 / 5);
    let mut tuple = [0u8; 5];
    let mut count = 0usize;

    for &byte in data {
        match byte {
            b'~' => break,
            b'z' if count == 0 => result.extend_from_slice(&[0u8; 4]),
            b'!'..=b'u' => {
                tuple[count] = byte - b'!';
                count += 1;
                if count == 5 {
                    let value = tuple.iter().fold(0u32, |acc, &d| acc.wrapping_mul(85).wrapping_add(d as u32));
                    result.extend_from_slice(&value.to_be_bytes());
                    count = 0;
                }
            }
            b if b.is_ascii_whitespace() || b == 0 => {}
            other => {
                return Err(PDFError::Decode(format!("Invalid ASCII85 character: 0x{:02x}", other)));
            }
        }
    }

    // A partial group of n characters yields n - 1 bytes
    if count > 1 {
        for digit in tuple.iter_mut().skip(count) {
            *digit = 84;
        }
        let value = tuple.iter().fold(0u32, |acc, &d| acc.wrapping_mul(85).wrapping_add(d as u32));
        result.extend_from_slice(&value.to_be_bytes()[..count - 1]);
    }
    Ok(result)
}

/// Decodes RunLength data.
pub fn decode_run_length(data: &[u8]) -> PDFResult<Vec<u8>> {
    let mut result = Vec::new();
    let mut i = 0;
    while i < data.len() {
        let length = data[i];
        i += 1;
        match length {
            128 => break,
            0..=127 => {
                let count = length as usize + 1;
                let end = (i + count).min(data.len());
                result.extend_from_slice(&data[i..end]);
                i = end;
            }
            _ => {
                if let Some(&byte) = data.get(i) {
                    result.extend(std::iter::repeat_n(byte, 257 - length as usize));
                }
                i += 1;
            }
        }
    }
    Ok(result)
}

/// Applies PNG predictor decoding (Predictor 10 to 15).
///
/// Each row is preceded by its own predictor type byte.
pub fn decode_png_predictor(
    data: &[u8],
    colors: usize,
    bits_per_component: usize,
    columns: usize,
) -> PDFResult<Vec<u8>> {
    let pix_bytes = (colors * bits_per_component).div_ceil(8).max(1);
    let row_bytes = (columns * colors * bits_per_component).div_ceil(8);
    let stride = 1 + row_bytes;

    let mut output = Vec::with_capacity(data.len());
    let mut prev_row = vec![0u8; row_bytes];
    let mut row = vec![0u8; row_bytes];

    for chunk in data.chunks(stride) {
        let predictor_byte = chunk[0];
        let raw_bytes = &chunk[1..];
        if raw_bytes.len() < row_bytes {
            log::debug!("PNG predictor: short final row ({} of {} bytes)", raw_bytes.len(), row_bytes);
        }
        row.iter_mut().for_each(|b| *b = 0);
        row[..raw_bytes.len()].copy_from_slice(raw_bytes);

        for i in 0..row_bytes {
            let left = if i >= pix_bytes { row[i - pix_bytes] } else { 0 };
            let up = prev_row[i];
            let up_left = if i >= pix_bytes { prev_row[i - pix_bytes] } else { 0 };
            let predicted = match predictor_byte {
                0 => 0,
                1 => left,
                2 => up,
                3 => ((left as u16 + up as u16) / 2) as u8,
                4 => paeth(left, up, up_left),
                other => {
                    return Err(PDFError::Decode(format!("Unsupported PNG predictor: {}", other)));
                }
            };
            row[i] = row[i].wrapping_add(predicted);
        }

        output.extend_from_slice(&row[..raw_bytes.len()]);
        prev_row.copy_from_slice(&row);
    }

    Ok(output)
}

fn paeth(left: u8, up: u8, up_left: u8) -> u8 {
    let p = left as i32 + up as i32 - up_left as i32;
    let pa = (p - left as i32).abs();
    let pb = (p - up as i32).abs();
    let pc = (p - up_left as i32).abs();
    if pa <= pb && pa <= pc {
        left
    } else if pb <= pc {
        up
    } else {
        up_left
    }
}

/// Applies TIFF predictor 2 (horizontal differencing) for 8-bit components.
pub fn decode_tiff_predictor(data: &[u8], colors: usize, bits_per_component: usize, columns: usize) -> PDFResult<Vec<u8>> {
    if bits_per_component != 8 {
        return Err(PDFError::Decode(format!(
            "TIFF predictor with {} bits per component",
            bits_per_component
        )));
    }
    let row_bytes = columns * colors;
    let mut output = data.to_vec();
    if row_bytes == 0 {
        return Ok(output);
    }
    for row in output.chunks_mut(row_bytes) {
        for i in colors..row.len() {
            row[i] = row[i].wrapping_add(row[i - colors]);
        }
    }
    Ok(output)
}

/// Applies the predictor described by a /DecodeParms dictionary.
fn apply_predictor(data: Vec<u8>, params: Option<&Dict>) -> PDFResult<Vec<u8>> {
    let Some(params) = params else {
        return Ok(data);
    };
    let param = |key: &str, default: usize| {
        params
            .get(key)
            .and_then(|v| v.as_number())
            .map(|n| n as usize)
            .unwrap_or(default)
    };
    let predictor = param("Predictor", 1);
    let colors = param("Colors", 1);
    let bits = param("BitsPerComponent", 8);
    let columns = param("Columns", 1);

    match predictor {
        1 => Ok(data),
        2 => decode_tiff_predictor(&data, colors, bits, columns),
        10..=15 => decode_png_predictor(&data, colors, bits, columns),
        other => Err(PDFError::Decode(format!("Unsupported predictor: {}", other))),
    }
}

/// Collects the filter names of a stream dictionary, in application order.
pub fn filter_names(dict: &Dict) -> Vec<String> {
    match dict.get("Filter") {
        Some(PDFObject::Name(name)) => vec![name.clone()],
        Some(PDFObject::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_name().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

fn decode_params(dict: &Dict, index: usize) -> Option<&Dict> {
    let params = dict.get("DecodeParms").or_else(|| dict.get("DP"))?;
    match params {
        PDFObject::Dictionary(d) => (index == 0).then_some(d),
        PDFObject::Array(items) => items.get(index).and_then(|item| item.as_dictionary()),
        _ => None,
    }
}

/// Decodes stream data according to its /Filter and /DecodeParms entries.
///
/// Decoding stops at the first image codec; the bytes decoded so far are
/// returned as they are.
pub fn decode_stream_object(dict: &Dict, data: &[u8]) -> PDFResult<Vec<u8>> {
    let mut current = data.to_vec();
    for (index, filter) in filter_names(dict).iter().enumerate() {
        if is_image_filter(filter) {
            break;
        }
        let params = decode_params(dict, index);
        current = match filter.as_str() {
            "FlateDecode" | "Fl" => apply_predictor(decode_flate(&current)?, params)?,
            "LZWDecode" | "LZW" => {
                let early_change = params
                    .and_then(|p| p.get("EarlyChange"))
                    .and_then(|v| v.as_number())
                    .map(|n| n != 0.0)
                    .unwrap_or(true);
                apply_predictor(decode_lzw(&current, early_change)?, params)?
            }
            "ASCIIHexDecode" | "AHx" => decode_ascii_hex(&current)?,
            "ASCII85Decode" | "A85" => decode_ascii85(&current)?,
            "RunLengthDecode" | "RL" => decode_run_length(&current)?,
            "Crypt" => current,
            other => {
                log::warn!("Unsupported filter: {}", other);
                return Err(PDFError::Decode(format!("Unsupported filter: {}", other)));
            }
        };
    }
    Ok(current)
}

/// Returns the decoded payload of a stream object, or `None` for other objects.
pub fn stream_data(obj: &PDFObject) -> Option<PDFResult<Vec<u8>>> {
    match obj {
        PDFObject::Stream { dict, data } => Some(decode_stream_object(dict, data)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{write::ZlibEncoder, Compression};
    use std::io::Write;

    fn zlib(data: &[u8]) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn dict(entries: &[(&str, PDFObject)]) -> Dict {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_flate_roundtrip() {
        let compressed = zlib(b"BT /F1 12 Tf (Hello) Tj ET");
        assert_eq!(decode_flate(&compressed).unwrap(), b"BT /F1 12 Tf (Hello) Tj ET");
    }

    #[test]
    fn test_flate_garbage_fails() {
        assert!(decode_flate(&[0xFF, 0xFF, 0xFF]).is_err());
    }

    #[test]
    fn test_ascii_hex() {
        assert_eq!(decode_ascii_hex(b"48 65 6c6c 6F>").unwrap(), b"Hello");
        assert_eq!(decode_ascii_hex(b"ABC>").unwrap(), vec![0xAB, 0xC0]);
    }

    #[test]
    fn test_ascii85() {
        assert_eq!(decode_ascii85(b"87cURD]i,\"Ebo80~>").unwrap(), b"Hello World");
        assert_eq!(decode_ascii85(b"z~>").unwrap(), vec![0, 0, 0, 0]);
        assert!(decode_ascii85(b"\x7f").is_err());
    }

    #[test]
    fn test_run_length() {
        // 3 literal bytes, then 'z' repeated 4 times, then EOD
        let data = [2, b'a', b'b', b'c', 253, b'z', 128];
        assert_eq!(decode_run_length(&data).unwrap(), b"abczzzz");
    }

    #[test]
    fn test_lzw_sample() {
        // Sample from the PDF reference, section 7.4.4.2
        let data = [0x80, 0x0B, 0x60, 0x50, 0x22, 0x0C, 0x0C, 0x85, 0x01];
        assert_eq!(decode_lzw(&data, true).unwrap(), vec![45, 45, 45, 45, 45, 65, 45, 45, 45, 66]);
    }

    #[test]
    fn test_png_up_predictor() {
        // Two rows of 3 bytes using the Up predictor
        let data = [2, 1, 2, 3, 2, 1, 1, 1];
        assert_eq!(decode_png_predictor(&data, 1, 8, 3).unwrap(), vec![1, 2, 3, 2, 3, 4]);
    }

    #[test]
    fn test_filter_chain_with_predictor() {
        let raw = [2u8, 10, 20, 2, 1, 1];
        let d = dict(&[
            (
                "Filter",
                PDFObject::array([
                    PDFObject::Name("ASCIIHexDecode".to_string()),
                    PDFObject::Name("FlateDecode".to_string()),
                ]),
            ),
            (
                "DecodeParms",
                PDFObject::array([
                    PDFObject::Null,
                    PDFObject::Dictionary(dict(&[
                        ("Predictor", PDFObject::Number(12.0)),
                        ("Columns", PDFObject::Number(2.0)),
                    ])),
                ]),
            ),
        ]);
        let hex: String = zlib(&raw).iter().map(|b| format!("{:02x}", b)).collect();
        let decoded = decode_stream_object(&d, hex.as_bytes()).unwrap();
        assert_eq!(decoded, vec![10, 20, 11, 21]);
    }

    #[test]
    fn test_image_filter_stops_chain() {
        let d = dict(&[("Filter", PDFObject::Name("DCTDecode".to_string()))]);
        assert_eq!(decode_stream_object(&d, b"\xFF\xD8").unwrap(), b"\xFF\xD8");
    }
}
