//! DOM view: W3C DOM node typing over the shared graph.
//!
//! The DOM view differs from the generic model in two places only: the
//! document enforces that a doctype precedes the document element, and
//! nodes report DOM node types and names through [`DomNode`].

use crate::error::{HierarchyError, Result};
use crate::tree::{NodeData, NodeGraph, NodeId, NodeKind, TextContent};
use crate::view::{not_allowed, ContentModel, DOCUMENT};

pub const ELEMENT_NODE: u16 = 1;
pub const ATTRIBUTE_NODE: u16 = 2;
pub const TEXT_NODE: u16 = 3;
pub const CDATA_SECTION_NODE: u16 = 4;
pub const ENTITY_REFERENCE_NODE: u16 = 5;
pub const PROCESSING_INSTRUCTION_NODE: u16 = 7;
pub const COMMENT_NODE: u16 = 8;
pub const DOCUMENT_NODE: u16 = 9;
pub const DOCUMENT_TYPE_NODE: u16 = 10;

/// Document content under the DOM view.
#[derive(Debug)]
pub struct DomDocumentModel;

impl ContentModel for DomDocumentModel {
    fn name(&self) -> &'static str {
        "dom document"
    }

    fn check_child(&self, graph: &NodeGraph, container: NodeId, child: NodeId) -> std::result::Result<(), HierarchyError> {
        DOCUMENT.check_child(graph, container, child)?;
        let has_element = graph
            .children_if_available(container)
            .any(|c| c != child && graph.is_element(c));
        if matches!(graph.kind(child), NodeKind::DocType(_)) && has_element {
            return Err(not_allowed(graph, container, child));
        }
        Ok(())
    }

    fn keeps_whitespace(&self) -> bool {
        false
    }

    fn accepts_character_data(&self) -> bool {
        false
    }
}

pub(crate) static DOM_DOCUMENT: DomDocumentModel = DomDocumentModel;

/// DOM accessors on node data.
pub trait DomNode {
    /// The DOM `nodeType` constant.
    fn dom_node_type(&self) -> u16;

    /// The DOM `nodeName`.
    fn dom_node_name(&self) -> String;

    /// The DOM `nodeValue`; `None` for documents, elements and doctypes.
    fn dom_node_value(&self) -> Option<String>;
}

impl DomNode for NodeData {
    fn dom_node_type(&self) -> u16 {
        match &self.kind {
            NodeKind::Document(_) => DOCUMENT_NODE,
            NodeKind::Element(_) => ELEMENT_NODE,
            NodeKind::Attribute(_) | NodeKind::NamespaceDeclaration(_) => ATTRIBUTE_NODE,
            NodeKind::Text(_) => TEXT_NODE,
            NodeKind::CData(_) => CDATA_SECTION_NODE,
            NodeKind::Comment(_) => COMMENT_NODE,
            NodeKind::ProcessingInstruction { .. } => PROCESSING_INSTRUCTION_NODE,
            NodeKind::DocType(_) => DOCUMENT_TYPE_NODE,
            NodeKind::EntityReference { .. } => ENTITY_REFERENCE_NODE,
        }
    }

    fn dom_node_name(&self) -> String {
        match &self.kind {
            NodeKind::Document(_) => "#document".to_string(),
            NodeKind::Element(e) => e.name.qualified(),
            NodeKind::Attribute(a) => a.name.qualified(),
            NodeKind::NamespaceDeclaration(b) if b.prefix.is_empty() => "xmlns".to_string(),
            NodeKind::NamespaceDeclaration(b) => format!("xmlns:{}", b.prefix),
            NodeKind::Text(_) => "#text".to_string(),
            NodeKind::CData(_) => "#cdata-section".to_string(),
            NodeKind::Comment(_) => "#comment".to_string(),
            NodeKind::ProcessingInstruction { target, .. } => target.clone(),
            NodeKind::DocType(d) => d.name.clone(),
            NodeKind::EntityReference { name, .. } => name.clone(),
        }
    }

    fn dom_node_value(&self) -> Option<String> {
        match &self.kind {
            NodeKind::Attribute(a) => Some(a.value.clone()),
            NodeKind::NamespaceDeclaration(b) => Some(b.uri.clone()),
            NodeKind::Text(TextContent::Literal(t)) | NodeKind::CData(t) | NodeKind::Comment(t) => {
                Some(t.clone())
            }
            NodeKind::Text(TextContent::Binary(p)) => p.to_base64().ok(),
            NodeKind::ProcessingInstruction { data, .. } => Some(data.clone()),
            NodeKind::Document(_)
            | NodeKind::Element(_)
            | NodeKind::DocType(_)
            | NodeKind::EntityReference { .. } => None,
        }
    }
}

/// Collects descendant elements of `root` matching `namespace` and `local`
/// in document order, building the subtree as it goes. `"*"` matches any
/// namespace or any local name.
///
/// # Errors
///
/// Propagates build errors.
pub fn elements_by_tag_name_ns(
    graph: &mut NodeGraph,
    root: NodeId,
    namespace: &str,
    local: &str,
) -> Result<Vec<NodeId>> {
    let mut found = Vec::new();
    collect_matching(graph, root, namespace, local, &mut found)?;
    Ok(found)
}

fn collect_matching(
    graph: &mut NodeGraph,
    node: NodeId,
    namespace: &str,
    local: &str,
    found: &mut Vec<NodeId>,
) -> Result<()> {
    let mut child = graph.first_child(node)?;
    while let Some(c) = child {
        if let Some(e) = graph.element(c) {
            let ns_ok = namespace == "*" || e.name.namespace_uri() == namespace;
            let local_ok = local == "*" || e.name.local == local;
            if ns_ok && local_ok {
                found.push(c);
            }
            collect_matching(graph, c, namespace, local, found)?;
        }
        child = graph.next_sibling(c)?;
    }
    Ok(())
}
