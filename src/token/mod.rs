//! The token vocabulary shared by event sources, builders and sinks.
//!
//! A [`Token`] is one typed event of a pull-style, namespace-aware XML
//! tokenizer. Builders consume tokens through the [`EventSource`] trait;
//! sinks accept the same vocabulary on the output side. [`TokenStream`] is an
//! in-memory source over a prepared token vector, used for captured subtrees
//! and in tests.

use std::collections::VecDeque;
use std::fmt;

use crate::blob::BinaryPayload;
use crate::error::ParseError;

/// A namespace-qualified name.
///
/// `namespace == None` means "no namespace"; `Some("")` is an explicitly
/// empty namespace URI. Both compare equal for matching purposes (see
/// [`QName::matches`]) but serialize differently: an explicit empty URI
/// undeclares an inherited default namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct QName {
    /// The local part of the name.
    pub local: String,
    /// The namespace URI, if any.
    pub namespace: Option<String>,
    /// The prefix; empty for the default namespace or no prefix.
    pub prefix: String,
}

impl QName {
    /// Creates a name in no namespace.
    pub fn local(local: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            namespace: None,
            prefix: String::new(),
        }
    }

    /// Creates an unprefixed name in the given namespace.
    pub fn new(namespace: impl Into<String>, local: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            namespace: Some(namespace.into()),
            prefix: String::new(),
        }
    }

    /// Creates a prefixed name in the given namespace.
    pub fn with_prefix(
        namespace: impl Into<String>,
        local: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            local: local.into(),
            namespace: Some(namespace.into()),
            prefix: prefix.into(),
        }
    }

    /// Returns the namespace URI, or `""` when there is none.
    #[must_use]
    pub fn namespace_uri(&self) -> &str {
        self.namespace.as_deref().unwrap_or("")
    }

    /// Returns `true` if the name has a non-empty namespace URI.
    #[must_use]
    pub fn has_namespace(&self) -> bool {
        !self.namespace_uri().is_empty()
    }

    /// Compares by namespace URI and local name, ignoring the prefix.
    ///
    /// `None` and `Some("")` both count as "no namespace".
    #[must_use]
    pub fn matches(&self, namespace: Option<&str>, local: &str) -> bool {
        self.local == local && self.namespace_uri() == namespace.unwrap_or("")
    }

    /// Returns `true` if both names denote the same expanded name.
    #[must_use]
    pub fn same_name(&self, other: &QName) -> bool {
        self.matches(other.namespace.as_deref(), &other.local)
    }

    /// Returns the name as written in markup, `prefix:local` or `local`.
    #[must_use]
    pub fn qualified(&self) -> String {
        if self.prefix.is_empty() {
            self.local.clone()
        } else {
            format!("{}:{}", self.prefix, self.local)
        }
    }
}

/// Formats the name in Clark notation, `{uri}local`.
impl fmt::Display for QName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.has_namespace() {
            write!(f, "{{{}}}{}", self.namespace_uri(), self.local)
        } else {
            f.write_str(&self.local)
        }
    }
}

/// A namespace declaration, `xmlns:prefix="uri"` (empty prefix for the
/// default namespace).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NamespaceBinding {
    /// The declared prefix; empty for the default namespace.
    pub prefix: String,
    /// The namespace URI.
    pub uri: String,
}

impl NamespaceBinding {
    pub fn new(prefix: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            uri: uri.into(),
        }
    }
}

/// An attribute carried on a start-element token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenAttribute {
    pub name: QName,
    pub value: String,
}

/// The payload of a start-element token.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StartTag {
    /// The element name.
    pub name: QName,
    /// Namespace declarations made on this element, in document order.
    pub namespaces: Vec<NamespaceBinding>,
    /// Attributes other than namespace declarations.
    pub attributes: Vec<TokenAttribute>,
}

impl StartTag {
    /// Creates a start tag without attributes or declarations.
    pub fn new(name: QName) -> Self {
        Self {
            name,
            namespaces: Vec::new(),
            attributes: Vec::new(),
        }
    }
}

/// Fields of the XML declaration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct XmlDeclaration {
    pub version: Option<String>,
    pub encoding: Option<String>,
    pub standalone: Option<bool>,
}

/// A document type declaration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DocTypeDecl {
    pub name: String,
    pub public_id: Option<String>,
    pub system_id: Option<String>,
    pub internal_subset: Option<String>,
}

/// One typed event of the token stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    StartDocument(XmlDeclaration),
    EndDocument,
    DocType(DocTypeDecl),
    StartElement(StartTag),
    EndElement,
    Characters(String),
    /// Character content backed by a binary blob.
    Binary(BinaryPayload),
    CData(String),
    Comment(String),
    ProcessingInstruction {
        target: String,
        data: String,
    },
    EntityReference {
        name: String,
        /// The replacement text, if the source knows it.
        replacement: Option<String>,
    },
}

impl Token {
    /// Short name of the token kind, for diagnostics.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::StartDocument(_) => "start of document",
            Self::EndDocument => "end of document",
            Self::DocType(_) => "doctype",
            Self::StartElement(_) => "start tag",
            Self::EndElement => "end tag",
            Self::Characters(_) => "characters",
            Self::Binary(_) => "binary characters",
            Self::CData(_) => "CDATA section",
            Self::Comment(_) => "comment",
            Self::ProcessingInstruction { .. } => "processing instruction",
            Self::EntityReference { .. } => "entity reference",
        }
    }

    /// Returns `true` for character data consisting only of XML whitespace.
    #[must_use]
    pub fn is_whitespace(&self) -> bool {
        match self {
            Self::Characters(text) => is_xml_whitespace(text),
            _ => false,
        }
    }
}

/// Returns `true` if every character is XML whitespace (space, tab, CR, LF).
#[must_use]
pub fn is_xml_whitespace(text: &str) -> bool {
    text.bytes()
        .all(|b| matches!(b, b' ' | b'\t' | b'\r' | b'\n'))
}

/// A pull-style producer of tokens.
///
/// Well-formed sources emit exactly one `StartDocument` first and one
/// `EndDocument` last; pulling past the end is a [`ParseError`].
pub trait EventSource {
    /// Pulls the next token.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError`] on malformed input or when the stream is
    /// exhausted.
    fn next_token(&mut self) -> Result<Token, ParseError>;

    /// Releases any underlying resource. The default does nothing.
    fn close(&mut self) {}
}

impl<T: EventSource + ?Sized> EventSource for Box<T> {
    fn next_token(&mut self) -> Result<Token, ParseError> {
        (**self).next_token()
    }

    fn close(&mut self) {
        (**self).close();
    }
}

/// An [`EventSource`] over an in-memory token sequence.
#[derive(Debug, Clone, Default)]
pub struct TokenStream {
    tokens: VecDeque<Token>,
    consumed: usize,
}

impl TokenStream {
    /// Creates a stream that yields `tokens` exactly as given.
    pub fn new(tokens: impl IntoIterator<Item = Token>) -> Self {
        Self {
            tokens: tokens.into_iter().collect(),
            consumed: 0,
        }
    }

    /// Creates a stream that wraps `tokens` in `StartDocument`/`EndDocument`.
    pub fn document(tokens: impl IntoIterator<Item = Token>) -> Self {
        let mut all = VecDeque::new();
        all.push_back(Token::StartDocument(XmlDeclaration::default()));
        all.extend(tokens);
        all.push_back(Token::EndDocument);
        Self {
            tokens: all,
            consumed: 0,
        }
    }

    /// Number of tokens not yet pulled.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.tokens.len()
    }
}

impl EventSource for TokenStream {
    fn next_token(&mut self) -> Result<Token, ParseError> {
        let token = self
            .tokens
            .pop_front()
            .ok_or_else(|| ParseError::new("read past the end of the token stream", self.consumed))?;
        self.consumed += 1;
        Ok(token)
    }

    fn close(&mut self) {
        self.tokens.clear();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_qname_no_namespace_matches_empty_uri() {
        let name = QName::local("item");
        assert!(name.matches(None, "item"));
        assert!(name.matches(Some(""), "item"));
        assert!(!name.matches(Some("urn:x"), "item"));
    }

    #[test]
    fn test_qname_ignores_prefix_when_matching() {
        let a = QName::with_prefix("urn:x", "item", "x");
        let b = QName::with_prefix("urn:x", "item", "y");
        assert!(a.same_name(&b));
        assert_ne!(a, b);
    }

    #[test]
    fn test_qname_display_and_qualified() {
        let name = QName::with_prefix("urn:x", "item", "x");
        assert_eq!(name.to_string(), "{urn:x}item");
        assert_eq!(name.qualified(), "x:item");
        assert_eq!(QName::local("a").to_string(), "a");
    }

    #[test]
    fn test_whitespace_detection() {
        assert!(Token::Characters(" \n\t".to_string()).is_whitespace());
        assert!(!Token::Characters(" x ".to_string()).is_whitespace());
        assert!(!Token::Comment(" ".to_string()).is_whitespace());
    }

    #[test]
    fn test_token_stream_document_wrapping() {
        let mut stream = TokenStream::document(vec![Token::Comment("c".to_string())]);
        assert!(matches!(stream.next_token().unwrap(), Token::StartDocument(_)));
        assert_eq!(stream.next_token().unwrap(), Token::Comment("c".to_string()));
        assert_eq!(stream.next_token().unwrap(), Token::EndDocument);
        assert_eq!(stream.remaining(), 0);
    }

    #[test]
    fn test_token_stream_past_end_is_error() {
        let mut stream = TokenStream::new(vec![Token::EndDocument]);
        stream.next_token().unwrap();
        let err = stream.next_token().unwrap_err();
        assert!(err.message.contains("past the end"));
        assert_eq!(err.location.byte_offset, 1);
    }
}
