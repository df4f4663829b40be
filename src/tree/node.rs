use crate::blob::BinaryPayload;
use crate::sourced::SourcedPayload;
use crate::token::{DocTypeDecl, NamespaceBinding, QName, XmlDeclaration};
use crate::tree::NodeId;
use crate::view::ElementRole;

/// Build progress of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuildState {
    /// Created by a builder whose end token has not been consumed yet, or a
    /// sourced element that has not been expanded.
    Fresh,
    /// All content is present.
    Complete,
    /// Dropped by `discard` or consumed by streaming serialization.
    Discarded,
}

/// The payload of a document node.
#[derive(Debug, Clone, Default)]
pub struct DocumentData {
    /// Fields of the XML declaration read from the source, if any.
    pub declaration: XmlDeclaration,
}

/// The payload of an element node.
#[derive(Debug)]
pub struct ElementData {
    pub name: QName,
    /// Attribute nodes owned by this element, keyed by expanded name.
    pub attributes: Vec<NodeId>,
    /// Namespace declaration nodes scoped to this element, in order.
    pub namespaces: Vec<NodeId>,
    /// What the element means to the view it was created under.
    pub role: ElementRole,
    /// Present when the content comes from a data source.
    pub sourced: Option<SourcedPayload>,
}

impl ElementData {
    pub(crate) fn new(name: QName) -> Self {
        Self {
            name,
            attributes: Vec::new(),
            namespaces: Vec::new(),
            role: ElementRole::Plain,
            sourced: None,
        }
    }
}

/// The payload of an attribute node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeData {
    pub name: QName,
    pub value: String,
    /// `false` for attributes created without namespace processing, whose
    /// local name may contain a colon.
    pub namespace_aware: bool,
}

/// Character content of a text node.
#[derive(Debug, Clone, PartialEq)]
pub enum TextContent {
    Literal(String),
    Binary(BinaryPayload),
}

/// What kind of node this is, with its payload.
#[derive(Debug)]
pub enum NodeKind {
    Document(DocumentData),
    Element(ElementData),
    Attribute(AttributeData),
    NamespaceDeclaration(NamespaceBinding),
    Text(TextContent),
    CData(String),
    Comment(String),
    ProcessingInstruction { target: String, data: String },
    DocType(DocTypeDecl),
    EntityReference {
        name: String,
        replacement: Option<String>,
    },
}

impl NodeKind {
    /// Returns `true` for documents and elements.
    #[must_use]
    pub fn is_container(&self) -> bool {
        matches!(self, Self::Document(_) | Self::Element(_))
    }

    /// Returns `true` for whitespace-only literal text.
    #[must_use]
    pub fn is_whitespace_text(&self) -> bool {
        match self {
            Self::Text(TextContent::Literal(text)) => crate::token::is_xml_whitespace(text),
            _ => false,
        }
    }

    /// A short description used in error messages.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Document(_) => "document".to_string(),
            Self::Element(e) => format!("element {}", e.name.qualified()),
            Self::Attribute(a) => format!("attribute {}", a.name.qualified()),
            Self::NamespaceDeclaration(_) => "namespace declaration".to_string(),
            Self::Text(_) => "text".to_string(),
            Self::CData(_) => "CDATA section".to_string(),
            Self::Comment(_) => "comment".to_string(),
            Self::ProcessingInstruction { .. } => "processing instruction".to_string(),
            Self::DocType(_) => "doctype".to_string(),
            Self::EntityReference { name, .. } => format!("entity reference &{name};"),
        }
    }
}
