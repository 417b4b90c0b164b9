//! Character encoding detection and conversion.

use encoding_rs::Encoding;

/// Decode UTF-32 (BE or LE) by hand: `encoding_rs` deliberately doesn't
/// implement it (the web platform doesn't use it), but calibre-produced
/// books occasionally carry a UTF-32 BOM, so the container's own decoding
/// policy (spec.md 4.2) has to cover it.
fn decode_utf32(bytes: &[u8], little_endian: bool) -> String {
    let mut out = String::with_capacity(bytes.len() / 4);
    for chunk in bytes.chunks_exact(4) {
        let code = if little_endian {
            u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])
        } else {
            u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])
        };
        out.push(char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER));
    }
    out
}

/// Collapses `\r\n` and lone `\r` to `\n`. Idempotent: running it twice
/// yields the same result as running it once.
pub fn normalize_newlines(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\r' {
            if chars.peek() == Some(&'\n') {
                chars.next();
            }
            out.push('\n');
        } else {
            out.push(c);
        }
    }
    out
}

/// Detect encoding from a byte string and decode to UTF-8, applying the
/// container's full decoding policy: UTF-32 BOM, then UTF-16 BOM, then
/// UTF-8 BOM, then a bare UTF-8 attempt, then a Windows-1252 fallback;
/// newlines are always normalized to `\n` regardless of which branch fired.
pub fn decode_to_utf8(bytes: &[u8]) -> (String, &'static str) {
    let (text, encoding) = decode_to_utf8_raw(bytes);
    (normalize_newlines(&text), encoding)
}

fn decode_to_utf8_raw(bytes: &[u8]) -> (String, &'static str) {
    if bytes.starts_with(&[0x00, 0x00, 0xFE, 0xFF]) {
        return (decode_utf32(&bytes[4..], false), "UTF-32BE");
    }
    if bytes.starts_with(&[0xFF, 0xFE, 0x00, 0x00]) {
        return (decode_utf32(&bytes[4..], true), "UTF-32LE");
    }
    if bytes.starts_with(&[0xEF, 0xBB, 0xBF]) {
        return (String::from_utf8_lossy(&bytes[3..]).to_string(), "UTF-8");
    }
    // UTF-16LE's BOM (FF FE) is a prefix of UTF-32LE's (FF FE 00 00); the
    // UTF-32LE check above already took priority.
    if bytes.starts_with(&[0xFF, 0xFE]) {
        let (result, _, _) = encoding_rs::UTF_16LE.decode(&bytes[2..]);
        return (result.to_string(), "UTF-16LE");
    }
    if bytes.starts_with(&[0xFE, 0xFF]) {
        let (result, _, _) = encoding_rs::UTF_16BE.decode(&bytes[2..]);
        return (result.to_string(), "UTF-16BE");
    }

    // Try UTF-8 first
    match std::str::from_utf8(bytes) {
        Ok(s) => (s.to_string(), "UTF-8"),
        Err(_) => {
            // Sniff an XML-declared encoding before falling back blindly.
            if let Some(declared) = detect_xml_encoding(bytes) {
                if let Some(decoded) = decode_with_encoding(bytes, &declared) {
                    return (decoded, "declared-in-xml");
                }
            }
            // Fall back to Windows-1252 (common for older documents)
            let (result, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            (result.to_string(), "Windows-1252")
        }
    }
}

/// Decode bytes using a specific encoding name.
pub fn decode_with_encoding(bytes: &[u8], encoding_name: &str) -> Option<String> {
    let encoding = Encoding::for_label(encoding_name.as_bytes())?;
    let (result, _, _) = encoding.decode(bytes);
    Some(result.to_string())
}

/// Try to detect the encoding from an XML declaration.
/// Looks for `<?xml ... encoding="..." ?>`.
pub fn detect_xml_encoding(bytes: &[u8]) -> Option<String> {
    // Read enough bytes to find the XML declaration
    let head = &bytes[..bytes.len().min(512)];
    let head_str = String::from_utf8_lossy(head);

    if let Some(start) = head_str.find("encoding=") {
        let rest = &head_str[start + 9..];
        let quote = rest.chars().next()?;
        if quote == '"' || quote == '\'' {
            let rest = &rest[1..];
            if let Some(end) = rest.find(quote) {
                return Some(rest[..end].to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_utf8() {
        let (text, enc) = decode_to_utf8(b"Hello, World!");
        assert_eq!(text, "Hello, World!");
        assert_eq!(enc, "UTF-8");
    }

    #[test]
    fn test_decode_utf8_bom() {
        let mut bytes = vec![0xEF, 0xBB, 0xBF];
        bytes.extend_from_slice(b"Hello");
        let (text, enc) = decode_to_utf8(&bytes);
        assert_eq!(text, "Hello");
        assert_eq!(enc, "UTF-8");
    }

    #[test]
    fn test_detect_xml_encoding() {
        let xml = b"<?xml version=\"1.0\" encoding=\"iso-8859-1\"?><root/>";
        assert_eq!(detect_xml_encoding(xml), Some("iso-8859-1".to_string()));
    }

    #[test]
    fn test_decode_with_encoding() {
        let result = decode_with_encoding(b"Hello", "utf-8");
        assert_eq!(result, Some("Hello".to_string()));

        let result = decode_with_encoding(b"Hello", "nonexistent");
        assert_eq!(result, None);
    }

    #[test]
    fn test_decode_utf32_be_bom() {
        let mut bytes = vec![0x00, 0x00, 0xFE, 0xFF];
        for c in "Hi".chars() {
            bytes.extend_from_slice(&(c as u32).to_be_bytes());
        }
        let (text, enc) = decode_to_utf8(&bytes);
        assert_eq!(text, "Hi");
        assert_eq!(enc, "UTF-32BE");
    }

    #[test]
    fn test_decode_utf32_le_bom() {
        let mut bytes = vec![0xFF, 0xFE, 0x00, 0x00];
        for c in "Hi".chars() {
            bytes.extend_from_slice(&(c as u32).to_le_bytes());
        }
        let (text, enc) = decode_to_utf8(&bytes);
        assert_eq!(text, "Hi");
        assert_eq!(enc, "UTF-32LE");
    }

    #[test]
    fn test_newline_normalization_idempotent() {
        let raw = "a\r\nb\rc\nd";
        let once = normalize_newlines(raw);
        assert_eq!(once, "a\nb\nc\nd");
        assert_eq!(normalize_newlines(&once), once);
    }
}
