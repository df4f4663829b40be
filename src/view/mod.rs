//! Views: per-node-kind behavior layered over the shared node graph.
//!
//! All views use the same node kinds. What differs is the content model a
//! container enforces and, for SOAP, the role an element plays. The behavior
//! for a node is picked once, at creation, by [`content_model`], a dispatch
//! over `(view, kind)`; view-specific accessors are traits implemented for
//! [`NodeData`](crate::tree::NodeData) ([`soap::SoapElement`],
//! [`dom::DomNode`]) plus free helper functions.

pub mod dom;
pub mod soap;

use std::fmt;

use crate::error::{HierarchyError, ModelError};
use crate::token::QName;
use crate::tree::{NodeGraph, NodeId, NodeKind};

pub use soap::SoapVersion;

/// Which flavor of object model a graph presents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum View {
    /// Generic XML object model.
    #[default]
    Om,
    /// SOAP envelope model, versions 1.1 and 1.2.
    Soap,
    /// W3C DOM compatible model.
    Dom,
}

/// What an element means to its view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ElementRole {
    #[default]
    Plain,
    SoapEnvelope(SoapVersion),
    SoapHeader,
    SoapBody,
    SoapFault,
    SoapHeaderBlock,
}

/// Container behavior attached to a node at creation.
pub trait ContentModel: fmt::Debug {
    /// Name of the model, for diagnostics.
    fn name(&self) -> &'static str;

    /// Checks whether `child` may be added to `container`.
    ///
    /// # Errors
    ///
    /// Returns the [`HierarchyError`] describing the violation.
    fn check_child(&self, graph: &NodeGraph, container: NodeId, child: NodeId) -> Result<(), HierarchyError>;

    /// Whether whitespace-only text from a builder is kept as a child.
    /// When `false`, the builder drops it silently.
    fn keeps_whitespace(&self) -> bool {
        true
    }

    /// Whether character data that is not whitespace-only may appear as a
    /// child. Checked on content streamed without building nodes.
    fn accepts_character_data(&self) -> bool {
        true
    }
}

fn not_allowed(graph: &NodeGraph, container: NodeId, child: NodeId) -> HierarchyError {
    HierarchyError::ChildNotAllowed {
        parent: graph.kind(container).describe(),
        child: graph.kind(child).describe(),
    }
}

/// Nodes that never hold children.
#[derive(Debug)]
pub struct LeafModel;

impl ContentModel for LeafModel {
    fn name(&self) -> &'static str {
        "leaf"
    }

    fn check_child(&self, graph: &NodeGraph, container: NodeId, child: NodeId) -> Result<(), HierarchyError> {
        Err(not_allowed(graph, container, child))
    }
}

/// Ordinary element content.
#[derive(Debug)]
pub struct ElementModel;

/// Returns `true` for kinds that may appear in element content.
pub(crate) fn is_content_kind(kind: &NodeKind) -> bool {
    matches!(
        kind,
        NodeKind::Element(_)
            | NodeKind::Text(_)
            | NodeKind::CData(_)
            | NodeKind::Comment(_)
            | NodeKind::ProcessingInstruction { .. }
            | NodeKind::EntityReference { .. }
    )
}

impl ContentModel for ElementModel {
    fn name(&self) -> &'static str {
        "element"
    }

    fn check_child(&self, graph: &NodeGraph, container: NodeId, child: NodeId) -> Result<(), HierarchyError> {
        if is_content_kind(graph.kind(child)) {
            Ok(())
        } else {
            Err(not_allowed(graph, container, child))
        }
    }
}

/// Document content: one element at most, one doctype at most, plus
/// comments and processing instructions. No character data.
#[derive(Debug)]
pub struct DocumentModel;

impl ContentModel for DocumentModel {
    fn name(&self) -> &'static str {
        "document"
    }

    fn check_child(&self, graph: &NodeGraph, container: NodeId, child: NodeId) -> Result<(), HierarchyError> {
        let single = |pred: fn(&NodeKind) -> bool| {
            !graph
                .children_if_available(container)
                .any(|c| c != child && pred(graph.kind(c)))
        };
        let ok = match graph.kind(child) {
            NodeKind::Element(_) => single(|k| matches!(k, NodeKind::Element(_))),
            NodeKind::DocType(_) => single(|k| matches!(k, NodeKind::DocType(_))),
            NodeKind::Comment(_) | NodeKind::ProcessingInstruction { .. } => true,
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(not_allowed(graph, container, child))
        }
    }

    fn keeps_whitespace(&self) -> bool {
        false
    }

    fn accepts_character_data(&self) -> bool {
        false
    }
}

static LEAF: LeafModel = LeafModel;
static ELEMENT: ElementModel = ElementModel;
static DOCUMENT: DocumentModel = DocumentModel;

/// Picks the content model for a new node.
#[must_use]
pub fn content_model(view: View, kind: &NodeKind) -> &'static dyn ContentModel {
    match (view, kind) {
        (View::Dom, NodeKind::Document(_)) => &dom::DOM_DOCUMENT,
        (_, NodeKind::Document(_)) => &DOCUMENT,
        (_, NodeKind::Element(e)) => element_model(view, e.role),
        _ => &LEAF,
    }
}

/// The content model of an element playing `role` under `view`.
#[must_use]
pub(crate) fn element_model(view: View, role: ElementRole) -> &'static dyn ContentModel {
    match view {
        View::Soap => soap::element_model(role),
        View::Om | View::Dom => &ELEMENT,
    }
}

/// Decides the role of each element a builder creates.
pub trait ElementClassifier: fmt::Debug {
    /// Classifies an element at `depth` (1 for the document element).
    ///
    /// # Errors
    ///
    /// Returns an error when the element is not acceptable at this position.
    fn classify(&mut self, depth: usize, parent_role: ElementRole, name: &QName) -> Result<ElementRole, ModelError>;
}

/// Every element is plain.
#[derive(Debug, Default)]
pub struct PlainClassifier;

impl ElementClassifier for PlainClassifier {
    fn classify(&mut self, _depth: usize, _parent_role: ElementRole, _name: &QName) -> Result<ElementRole, ModelError> {
        Ok(ElementRole::Plain)
    }
}

/// The classifier a document builder uses for `view`.
#[must_use]
pub fn classifier_for(view: View) -> Box<dyn ElementClassifier> {
    match view {
        View::Soap => Box::new(soap::SoapClassifier::default()),
        View::Om | View::Dom => Box::new(PlainClassifier),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{DocumentData, ElementData};

    #[test]
    fn test_dispatch_by_view_and_kind() {
        let doc = NodeKind::Document(DocumentData::default());
        assert_eq!(content_model(View::Om, &doc).name(), "document");
        assert_eq!(content_model(View::Dom, &doc).name(), "dom document");
        let element = NodeKind::Element(ElementData::new(QName::local("e")));
        assert_eq!(content_model(View::Om, &element).name(), "element");
        assert_eq!(content_model(View::Soap, &element).name(), "element");
        assert_eq!(
            content_model(View::Om, &NodeKind::Comment(String::new())).name(),
            "leaf"
        );
    }

    #[test]
    fn test_document_drops_whitespace() {
        assert!(!DOCUMENT.keeps_whitespace());
        assert!(ELEMENT.keeps_whitespace());
        assert!(!DOCUMENT.accepts_character_data());
        assert!(ELEMENT.accepts_character_data());
    }
}
