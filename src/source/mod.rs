//! [`XmlSource`]: an [`EventSource`] over XML text, backed by quick-xml's
//! namespace-aware reader.
//!
//! The source reads one quick-xml event per pull (two tokens for an empty
//! element tag). Adjacent text, character references and predefined
//! entities are merged into a single `Characters` token.

use std::borrow::Cow;
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Cursor, Read};

use log::trace;
use quick_xml::escape::{resolve_predefined_entity, unescape};
use quick_xml::events::{BytesDecl, BytesStart, Event};
use quick_xml::name::{QName as XmlName, ResolveResult};
use quick_xml::reader::NsReader;

use crate::encoding;
use crate::error::ParseError;
use crate::token::{
    is_xml_whitespace, DocTypeDecl, EventSource, NamespaceBinding, QName, StartTag, Token, TokenAttribute,
    XmlDeclaration,
};

/// Tokens parsed from XML text.
pub struct XmlSource<R: BufRead> {
    reader: NsReader<R>,
    buf: Vec<u8>,
    queue: VecDeque<Token>,
    text: Option<String>,
    depth: usize,
    root_seen: bool,
    events: usize,
    started: bool,
    finished: bool,
}

impl<R: BufRead> std::fmt::Debug for XmlSource<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XmlSource")
            .field("depth", &self.depth)
            .field("position", &self.reader.buffer_position())
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl XmlSource<Cursor<Vec<u8>>> {
    /// Parses UTF-8 text.
    pub fn from_text(xml: impl Into<String>) -> Self {
        Self::from_reader(Cursor::new(xml.into().into_bytes()))
    }

    /// Parses encoded bytes, decoding them to UTF-8 first.
    ///
    /// # Errors
    ///
    /// Returns a [`ParseError`] if the bytes cannot be decoded.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        let decoded = encoding::decode(bytes)?;
        Ok(Self::from_text(decoded.text))
    }
}

impl<T: Read> XmlSource<BufReader<T>> {
    /// Parses UTF-8 from an unbuffered reader.
    pub fn from_read(read: T) -> Self {
        Self::from_reader(BufReader::new(read))
    }
}

impl<R: BufRead> XmlSource<R> {
    /// Parses UTF-8 from a buffered reader, reading only as far as pulls
    /// require.
    pub fn from_reader(reader: R) -> Self {
        let mut reader = NsReader::from_reader(reader);
        reader.config_mut().trim_text(false);
        Self {
            reader,
            buf: Vec::new(),
            queue: VecDeque::new(),
            text: None,
            depth: 0,
            root_seen: false,
            events: 0,
            started: false,
            finished: false,
        }
    }

    fn error(&self, message: impl std::fmt::Display) -> ParseError {
        let offset = usize::try_from(self.reader.buffer_position()).unwrap_or(usize::MAX);
        ParseError::new(message.to_string(), offset)
    }

    fn push_text(&mut self, text: &str) -> Result<(), ParseError> {
        if text.is_empty() {
            return Ok(());
        }
        if self.depth == 0 {
            if is_xml_whitespace(text) {
                return Ok(());
            }
            return Err(self.error("character data outside the document element"));
        }
        self.text.get_or_insert_with(String::new).push_str(text);
        Ok(())
    }

    /// Queues the pending text, then `token`.
    fn emit(&mut self, token: Token) {
        if let Some(text) = self.text.take() {
            self.queue.push_back(Token::Characters(text));
        }
        self.queue.push_back(token);
    }

    /// Reads quick-xml events until at least one token is queued.
    fn fill(&mut self) -> Result<(), ParseError> {
        while self.queue.is_empty() {
            self.buf.clear();
            let result = self.reader.read_event_into(&mut self.buf).map(Event::into_owned);
            let event = match result {
                Ok(event) => event,
                Err(err) => return Err(self.error(err)),
            };
            self.events += 1;
            match event {
                Event::Decl(_) if self.events > 1 => {
                    return Err(self.error("XML declaration after the start of the document"));
                }
                Event::Decl(decl) => {
                    let declaration = declaration(&decl).map_err(|e| self.error(e))?;
                    self.queue.push_back(Token::StartDocument(declaration));
                }
                Event::Start(start) => {
                    let tag = self.start_tag(&start)?;
                    self.depth += 1;
                    self.emit(Token::StartElement(tag));
                }
                Event::Empty(start) => {
                    let tag = self.start_tag(&start)?;
                    self.emit(Token::StartElement(tag));
                    self.queue.push_back(Token::EndElement);
                }
                Event::End(_) => {
                    self.depth = self
                        .depth
                        .checked_sub(1)
                        .ok_or_else(|| self.error("end tag without a matching start tag"))?;
                    self.emit(Token::EndElement);
                }
                Event::Text(text) => {
                    let raw = decode_utf8(&text).map_err(|e| self.error(e))?;
                    let value = unescape(&raw).map_err(|e| self.error(e))?;
                    self.push_text(&normalize_line_endings(&value))?;
                }
                Event::GeneralRef(reference) => {
                    let name = decode_utf8(&reference).map_err(|e| self.error(e))?.into_owned();
                    if let Some(ch) = name.strip_prefix('#').and_then(char_reference) {
                        self.push_text(ch.encode_utf8(&mut [0; 4]))?;
                    } else if let Some(resolved) = resolve_predefined_entity(&name) {
                        self.push_text(resolved)?;
                    } else if name.starts_with('#') {
                        return Err(self.error(format!("invalid character reference &{name};")));
                    } else if self.depth == 0 {
                        return Err(self.error("entity reference outside the document element"));
                    } else {
                        self.emit(Token::EntityReference { name, replacement: None });
                    }
                }
                Event::CData(cdata) => {
                    let text = decode_utf8(&cdata).map_err(|e| self.error(e))?;
                    let text = normalize_line_endings(&text).into_owned();
                    self.emit(Token::CData(text));
                }
                Event::Comment(comment) => {
                    let text = decode_utf8(&comment).map_err(|e| self.error(e))?.into_owned();
                    self.emit(Token::Comment(text));
                }
                Event::PI(pi) => {
                    let target = decode_utf8(pi.target()).map_err(|e| self.error(e))?.into_owned();
                    let data = decode_utf8(pi.content()).map_err(|e| self.error(e))?;
                    let data = data.trim_start().to_string();
                    self.emit(Token::ProcessingInstruction { target, data });
                }
                Event::DocType(doctype) => {
                    let raw = decode_utf8(&doctype).map_err(|e| self.error(e))?;
                    self.emit(Token::DocType(doctype_fields(&raw)));
                }
                Event::Eof => {
                    if self.depth > 0 {
                        return Err(self.error("unexpected end of input inside an element"));
                    }
                    if !self.root_seen {
                        return Err(self.error("no document element"));
                    }
                    self.emit(Token::EndDocument);
                    self.finished = true;
                }
            }
        }
        Ok(())
    }

    fn start_tag(&mut self, start: &BytesStart<'_>) -> Result<StartTag, ParseError> {
        if self.depth == 0 {
            if self.root_seen {
                return Err(self.error("more than one document element"));
            }
            self.root_seen = true;
        }
        let (ns, local) = self.reader.resolver().resolve_element(start.name());
        let namespace = self.resolve(ns)?;
        let local = decode_utf8(local.as_ref()).map_err(|e| self.error(e))?.into_owned();
        let prefix = prefix_of(start.name()).map_err(|e| self.error(e))?;
        let mut tag = StartTag::new(QName {
            local,
            namespace,
            prefix,
        });

        for attr in start.attributes() {
            let attr = attr.map_err(|e| self.error(e))?;
            let key = attr.key.as_ref();
            let raw = decode_utf8(&attr.value).map_err(|e| self.error(e))?;
            let value = unescape(&normalize_attribute(&raw))
                .map_err(|e| self.error(e))?
                .into_owned();
            if key == b"xmlns" {
                tag.namespaces.push(NamespaceBinding::new("", value));
                continue;
            }
            if let Some(declared) = key.strip_prefix(b"xmlns:") {
                let prefix = decode_utf8(declared).map_err(|e| self.error(e))?;
                tag.namespaces.push(NamespaceBinding::new(prefix, value));
                continue;
            }
            let (ns, local) = self.reader.resolver().resolve_attribute(attr.key);
            let name = QName {
                local: decode_utf8(local.as_ref()).map_err(|e| self.error(e))?.into_owned(),
                namespace: self.resolve(ns)?,
                prefix: prefix_of(attr.key).map_err(|e| self.error(e))?,
            };
            tag.attributes.push(TokenAttribute { name, value });
        }
        Ok(tag)
    }

    fn resolve(&self, ns: ResolveResult<'_>) -> Result<Option<String>, ParseError> {
        match ns {
            ResolveResult::Bound(ns) => {
                let uri = decode_utf8(ns.as_ref()).map_err(|e| self.error(e))?;
                Ok((!uri.is_empty()).then(|| uri.into_owned()))
            }
            ResolveResult::Unbound => Ok(None),
            ResolveResult::Unknown(prefix) => Err(self.error(format!(
                "unbound namespace prefix {:?}",
                String::from_utf8_lossy(&prefix)
            ))),
        }
    }
}

impl<R: BufRead> EventSource for XmlSource<R> {
    fn next_token(&mut self) -> Result<Token, ParseError> {
        if !self.started {
            self.started = true;
            // Documents without a declaration still open with StartDocument.
            self.fill()?;
            if !matches!(self.queue.front(), Some(Token::StartDocument(_))) {
                self.queue.push_front(Token::StartDocument(XmlDeclaration::default()));
            }
        }
        if self.queue.is_empty() {
            if self.finished {
                return Err(self.error("read past the end of the document"));
            }
            self.fill()?;
        }
        let token = self
            .queue
            .pop_front()
            .ok_or_else(|| self.error("no token available"))?;
        trace!("xml source: {}", token.kind_name());
        Ok(token)
    }
}

fn decode_utf8(bytes: &[u8]) -> Result<Cow<'_, str>, std::str::Utf8Error> {
    std::str::from_utf8(bytes).map(Cow::Borrowed)
}

fn prefix_of(name: XmlName<'_>) -> Result<String, std::str::Utf8Error> {
    match name.prefix() {
        Some(prefix) => decode_utf8(prefix.as_ref()).map(Cow::into_owned),
        None => Ok(String::new()),
    }
}

fn declaration(decl: &BytesDecl<'_>) -> Result<XmlDeclaration, String> {
    let text = |bytes: &[u8]| {
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|e| e.to_string())
    };
    let version = decl.version().map_err(|e| e.to_string())?;
    let encoding = match decl.encoding() {
        Some(Ok(enc)) => Some(text(&enc)?),
        Some(Err(e)) => return Err(e.to_string()),
        None => None,
    };
    let standalone = match decl.standalone() {
        Some(Ok(value)) => Some(value.as_ref() == b"yes"),
        Some(Err(e)) => return Err(e.to_string()),
        None => None,
    };
    Ok(XmlDeclaration {
        version: Some(text(&version)?),
        encoding,
        standalone,
    })
}

fn char_reference(digits: &str) -> Option<char> {
    let code = match digits.strip_prefix('x') {
        Some(hex) => u32::from_str_radix(hex, 16).ok()?,
        None => digits.parse().ok()?,
    };
    char::from_u32(code).filter(|&c| c != '\0')
}

/// `\r\n` and lone `\r` become `\n`.
fn normalize_line_endings(text: &str) -> Cow<'_, str> {
    if !text.contains('\r') {
        return Cow::Borrowed(text);
    }
    Cow::Owned(text.replace("\r\n", "\n").replace('\r', "\n"))
}

/// Attribute-value normalization: literal whitespace characters become
/// spaces. Runs before references are expanded, so `&#10;` survives.
fn normalize_attribute(raw: &str) -> Cow<'_, str> {
    if !raw.contains(['\t', '\n', '\r']) {
        return Cow::Borrowed(raw);
    }
    Cow::Owned(raw.replace("\r\n", " ").replace(['\t', '\n', '\r'], " "))
}

/// Splits the body of `<!DOCTYPE ...>` into its parts.
fn doctype_fields(raw: &str) -> DocTypeDecl {
    let raw = raw.trim();
    let (head, internal_subset) = match (raw.find('['), raw.rfind(']')) {
        (Some(open), Some(close)) if open < close => (&raw[..open], Some(raw[open + 1..close].to_string())),
        _ => (raw, None),
    };
    let mut rest = head.trim();
    let name_end = rest.find(char::is_whitespace).unwrap_or(rest.len());
    let name = rest[..name_end].to_string();
    rest = rest[name_end..].trim_start();

    let mut public_id = None;
    let mut system_id = None;
    if let Some(after) = rest.strip_prefix("PUBLIC") {
        let (public, after) = quoted(after);
        public_id = public;
        system_id = quoted(after).0;
    } else if let Some(after) = rest.strip_prefix("SYSTEM") {
        system_id = quoted(after).0;
    }
    DocTypeDecl {
        name,
        public_id,
        system_id,
        internal_subset,
    }
}

fn quoted(text: &str) -> (Option<String>, &str) {
    let text = text.trim_start();
    let Some(quote) = text.chars().next().filter(|c| *c == '"' || *c == '\'') else {
        return (None, text);
    };
    match text[1..].find(quote) {
        Some(end) => (Some(text[1..=end].to_string()), &text[end + 2..]),
        None => (None, text),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn tokens(xml: &str) -> Vec<Token> {
        let mut source = XmlSource::from_text(xml);
        let mut out = Vec::new();
        loop {
            let token = source.next_token().unwrap();
            let end = token == Token::EndDocument;
            out.push(token);
            if end {
                return out;
            }
        }
    }

    fn first_error(xml: &str) -> ParseError {
        let mut source = XmlSource::from_text(xml);
        loop {
            if let Err(err) = source.next_token() {
                return err;
            }
        }
    }

    #[test]
    fn test_empty_element_yields_start_and_end() {
        let t = tokens("<a/>");
        assert_eq!(t.len(), 4);
        assert!(matches!(&t[0], Token::StartDocument(d) if d.version.is_none()));
        assert!(matches!(&t[1], Token::StartElement(tag) if tag.name == QName::local("a")));
        assert_eq!(t[2], Token::EndElement);
    }

    #[test]
    fn test_namespaces_and_attributes_resolved() {
        let t = tokens(r#"<p:a xmlns:p="urn:p" xmlns="urn:d" p:x="1" y="2"><b/></p:a>"#);
        let Token::StartElement(tag) = &t[1] else {
            panic!("expected a start tag");
        };
        assert_eq!(tag.name, QName::with_prefix("urn:p", "a", "p"));
        assert_eq!(
            tag.namespaces,
            vec![NamespaceBinding::new("p", "urn:p"), NamespaceBinding::new("", "urn:d")]
        );
        assert_eq!(tag.attributes[0].name, QName::with_prefix("urn:p", "x", "p"));
        // Unprefixed attributes are never in the default namespace.
        assert_eq!(tag.attributes[1].name, QName::local("y"));
        let Token::StartElement(inner) = &t[2] else {
            panic!("expected a start tag");
        };
        assert_eq!(inner.name, QName::new("urn:d", "b"));
    }

    #[test]
    fn test_text_is_coalesced_and_unescaped() {
        let t = tokens("<a>x &amp; y&#x41;&lt;\r\nz</a>");
        assert_eq!(t[2], Token::Characters("x & yA<\nz".to_string()));
        assert_eq!(t[3], Token::EndElement);
    }

    #[test]
    fn test_attribute_whitespace_normalized() {
        let t = tokens("<a v=\"1\n2&#10;3\"/>");
        let Token::StartElement(tag) = &t[1] else {
            panic!("expected a start tag");
        };
        assert_eq!(tag.attributes[0].value, "1 2\n3");
    }

    #[test]
    fn test_declaration_pi_comment_cdata() {
        let t = tokens("<?xml version=\"1.0\" standalone=\"no\"?><!--c--><?go fast now?><a><![CDATA[<x>]]></a>");
        assert!(matches!(&t[0], Token::StartDocument(d) if d.standalone == Some(false)));
        assert_eq!(t[1], Token::Comment("c".to_string()));
        assert_eq!(
            t[2],
            Token::ProcessingInstruction {
                target: "go".to_string(),
                data: "fast now".to_string()
            }
        );
        assert_eq!(t[4], Token::CData("<x>".to_string()));
    }

    #[test]
    fn test_doctype_fields() {
        let d = doctype_fields(r#"html PUBLIC "-//W3C//DTD XHTML 1.0//EN" 'x.dtd' [ <!ENTITY e "v"> ]"#);
        assert_eq!(d.name, "html");
        assert_eq!(d.public_id.as_deref(), Some("-//W3C//DTD XHTML 1.0//EN"));
        assert_eq!(d.system_id.as_deref(), Some("x.dtd"));
        assert_eq!(d.internal_subset.as_deref(), Some(r#" <!ENTITY e "v"> "#));
    }

    #[test]
    fn test_unknown_entity_becomes_reference() {
        let t = tokens("<!DOCTYPE a [<!ENTITY e 'v'>]><a>1&e;2</a>");
        assert!(matches!(&t[1], Token::DocType(d) if d.name == "a"));
        assert_eq!(t[3], Token::Characters("1".to_string()));
        assert_eq!(
            t[4],
            Token::EntityReference {
                name: "e".to_string(),
                replacement: None
            }
        );
        assert_eq!(t[5], Token::Characters("2".to_string()));
    }

    #[test]
    fn test_malformed_input() {
        first_error("<a><b></a>");
        first_error("<a>");
        first_error("<a/><b/>");
        first_error("text<a/>");
        first_error("<p:a/>");
        first_error("");
    }

    #[test]
    fn test_read_past_end_is_error() {
        let mut source = XmlSource::from_text("<a/>");
        while source.next_token().unwrap() != Token::EndDocument {}
        assert!(source.next_token().is_err());
    }

    #[test]
    fn test_from_bytes_decodes() {
        let mut source = XmlSource::from_bytes(b"<?xml version='1.0' encoding='ISO-8859-1'?><a>\xE9</a>").unwrap();
        let mut text = None;
        while let Ok(token) = source.next_token() {
            match token {
                Token::Characters(t) => text = Some(t),
                Token::EndDocument => break,
                _ => {}
            }
        }
        assert_eq!(text.as_deref(), Some("é"));
    }
}
