//! Byte input decoding.
//!
//! Token sources work on UTF-8 text. Byte input is decoded up front: a byte
//! order mark wins, then the `encoding` pseudo-attribute of the XML
//! declaration, then UTF-8. Malformed sequences are errors, not replacement
//! characters.

use encoding_rs::{Encoding, UTF_16BE, UTF_16LE, UTF_8};

use crate::error::ParseError;

/// Decoded input and what it was decoded from.
#[derive(Debug, Clone)]
pub struct DecodedInput {
    pub text: String,
    pub encoding: &'static Encoding,
    /// Length of the byte order mark that was stripped, 0 if none.
    pub bom_len: usize,
}

/// Decodes XML bytes to UTF-8.
///
/// # Errors
///
/// Returns a [`ParseError`] for an unknown encoding label or bytes that are
/// not valid in the detected encoding.
pub fn decode(bytes: &[u8]) -> Result<DecodedInput, ParseError> {
    let (encoding, bom_len) = match Encoding::for_bom(bytes) {
        Some(found) => found,
        None => (sniff_declared(bytes)?.unwrap_or(UTF_8), 0),
    };
    let body = &bytes[bom_len..];
    let text = encoding
        .decode_without_bom_handling_and_without_replacement(body)
        .ok_or_else(|| ParseError::new(format!("input is not valid {}", encoding.name()), bom_len))?;
    log::trace!("decoded {} bytes as {}", bytes.len(), encoding.name());
    Ok(DecodedInput {
        text: text.into_owned(),
        encoding,
        bom_len,
    })
}

/// Reads the declared encoding from an ASCII-compatible XML declaration.
///
/// UTF-16 without a byte order mark is recognized by the `<?` pattern of its
/// first two characters.
fn sniff_declared(bytes: &[u8]) -> Result<Option<&'static Encoding>, ParseError> {
    match bytes {
        [0x00, b'<', 0x00, b'?', ..] => return Ok(Some(UTF_16BE)),
        [b'<', 0x00, b'?', 0x00, ..] => return Ok(Some(UTF_16LE)),
        _ => {}
    }
    if !bytes.starts_with(b"<?xml") {
        return Ok(None);
    }
    let end = bytes.iter().position(|&b| b == b'>').unwrap_or(bytes.len());
    let Some(label) = pseudo_attribute(&bytes[..end], b"encoding") else {
        return Ok(None);
    };
    let encoding = Encoding::for_label(label).ok_or_else(|| {
        ParseError::new(
            format!("unsupported encoding {:?}", String::from_utf8_lossy(label)),
            0,
        )
    })?;
    // A declaration read as ASCII cannot really be in a 16-bit encoding.
    if encoding == UTF_16LE || encoding == UTF_16BE {
        return Ok(Some(UTF_8));
    }
    Ok(Some(encoding))
}

fn pseudo_attribute<'a>(decl: &'a [u8], name: &[u8]) -> Option<&'a [u8]> {
    let start = decl.windows(name.len()).position(|w| w == name)? + name.len();
    let rest = decl[start..].trim_ascii_start().strip_prefix(b"=")?.trim_ascii_start();
    let (&quote, rest) = rest.split_first()?;
    if quote != b'"' && quote != b'\'' {
        return None;
    }
    let len = rest.iter().position(|&b| b == quote)?;
    Some(&rest[..len])
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_utf8() {
        let decoded = decode("<a>é</a>".as_bytes()).unwrap();
        assert_eq!(decoded.text, "<a>é</a>");
        assert_eq!(decoded.encoding, UTF_8);
        assert_eq!(decoded.bom_len, 0);
    }

    #[test]
    fn test_bom_is_stripped() {
        let decoded = decode(b"\xEF\xBB\xBF<a/>").unwrap();
        assert_eq!(decoded.text, "<a/>");
        assert_eq!(decoded.bom_len, 3);

        let utf16: Vec<u8> = [0xFF, 0xFE]
            .into_iter()
            .chain("<a/>".encode_utf16().flat_map(u16::to_le_bytes))
            .collect();
        let decoded = decode(&utf16).unwrap();
        assert_eq!(decoded.text, "<a/>");
        assert_eq!(decoded.encoding, UTF_16LE);
    }

    #[test]
    fn test_declared_latin1() {
        let decoded = decode(b"<?xml version='1.0' encoding='ISO-8859-1'?><a>\xE9</a>").unwrap();
        assert!(decoded.text.ends_with("<a>é</a>"));
    }

    #[test]
    fn test_unknown_label_and_bad_bytes() {
        assert!(decode(b"<?xml version=\"1.0\" encoding=\"klingon\"?><a/>").is_err());
        assert!(decode(b"<a>\xFF</a>").is_err());
    }

    #[test]
    fn test_pseudo_attribute_spacing() {
        assert_eq!(
            pseudo_attribute(b"<?xml version='1.0' encoding = \"utf-8\" ?", b"encoding"),
            Some(&b"utf-8"[..])
        );
        assert_eq!(pseudo_attribute(b"<?xml version='1.0'?", b"encoding"), None);
    }
}
