//! Deep copies of subtrees.

use log::debug;

use crate::error::{IoError, Result};
use crate::sourced::{ExpansionState, SourcedPayload};
use crate::tree::{BuildState, ElementData, NodeGraph, NodeId, NodeKind, TextContent};

/// Options for [`NodeGraph::clone_subtree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloneOptions {
    /// Read binary payloads into new in-memory blobs instead of sharing the
    /// original blob. Defaults to `false`.
    pub eager_materialize: bool,
    /// Expand unexpanded sourced elements and copy their trees instead of
    /// cloning them as unexpanded elements over a copied data source.
    /// Defaults to `false`.
    pub expand_sourced: bool,
    /// Keep each element's view role in the copy. When `false`, copied
    /// elements are plain. Defaults to `true`.
    pub preserve_model: bool,
}

impl Default for CloneOptions {
    fn default() -> Self {
        Self {
            eager_materialize: false,
            expand_sourced: false,
            preserve_model: true,
        }
    }
}

impl CloneOptions {
    #[must_use]
    pub fn eager_materialize(mut self, eager: bool) -> Self {
        self.eager_materialize = eager;
        self
    }

    #[must_use]
    pub fn expand_sourced(mut self, expand: bool) -> Self {
        self.expand_sourced = expand;
        self
    }

    #[must_use]
    pub fn preserve_model(mut self, preserve: bool) -> Self {
        self.preserve_model = preserve;
        self
    }
}

impl NodeGraph {
    /// Deep-copies `node` and returns the detached, complete copy.
    ///
    /// A node that is still being built is completed first. Unexpanded
    /// sourced elements are cloned without expansion when their data source
    /// can be copied and `expand_sourced` is off.
    ///
    /// # Errors
    ///
    /// Propagates build errors from completing the original, and
    /// [`IoError`] when materializing a blob fails.
    pub fn clone_subtree(&mut self, node: NodeId, options: &CloneOptions) -> Result<NodeId> {
        self.check_live(node)?;
        if let Some(copy) = self.clone_unexpanded(node, options)? {
            return Ok(copy);
        }
        self.ensure_complete(node)?;

        let kind = match &self.node(node).kind {
            NodeKind::Document(d) => NodeKind::Document(d.clone()),
            NodeKind::Element(e) => NodeKind::Element(ElementData::new(e.name.clone())),
            NodeKind::Attribute(a) => NodeKind::Attribute(a.clone()),
            NodeKind::NamespaceDeclaration(b) => NodeKind::NamespaceDeclaration(b.clone()),
            NodeKind::Text(TextContent::Literal(t)) => NodeKind::Text(TextContent::Literal(t.clone())),
            NodeKind::Text(TextContent::Binary(p)) => {
                let payload = if options.eager_materialize {
                    p.materialize().map_err(IoError::from)?
                } else {
                    p.clone()
                };
                NodeKind::Text(TextContent::Binary(payload))
            }
            NodeKind::CData(t) => NodeKind::CData(t.clone()),
            NodeKind::Comment(t) => NodeKind::Comment(t.clone()),
            NodeKind::ProcessingInstruction { target, data } => NodeKind::ProcessingInstruction {
                target: target.clone(),
                data: data.clone(),
            },
            NodeKind::DocType(d) => NodeKind::DocType(d.clone()),
            NodeKind::EntityReference { name, replacement } => NodeKind::EntityReference {
                name: name.clone(),
                replacement: replacement.clone(),
            },
        };
        let copy = self.alloc(kind, BuildState::Complete);

        if let Some(source) = self.element(node) {
            let role = source.role;
            let attributes = source.attributes.clone();
            let namespaces = source.namespaces.clone();
            if options.preserve_model {
                self.set_role(copy, role);
            }
            for decl in namespaces {
                let decl_copy = self.clone_subtree(decl, options)?;
                self.attach_namespace(copy, decl_copy);
            }
            for attr in attributes {
                let attr_copy = self.clone_subtree(attr, options)?;
                self.attach_attribute(copy, attr_copy);
            }
        }

        let mut child = self.first_child_if_available(node);
        while let Some(c) = child {
            let child_copy = self.clone_subtree(c, options)?;
            self.link_last(copy, child_copy);
            child = self.next_sibling_if_available(c);
        }
        Ok(copy)
    }

    /// Clones an unexpanded sourced element over a copy of its data source.
    fn clone_unexpanded(&mut self, node: NodeId, options: &CloneOptions) -> Result<Option<NodeId>> {
        if options.expand_sourced {
            return Ok(None);
        }
        let Some(element) = self.element(node) else {
            return Ok(None);
        };
        let Some(payload) = &element.sourced else {
            return Ok(None);
        };
        if payload.state != ExpansionState::NotExpanded {
            return Ok(None);
        }
        let Some(source) = payload.source.copy() else {
            return Ok(None);
        };
        let name = element.name.clone();
        let role = element.role;
        let copy = self.alloc(
            NodeKind::Element(ElementData {
                sourced: Some(SourcedPayload::new(source)),
                ..ElementData::new(name)
            }),
            BuildState::Fresh,
        );
        if options.preserve_model {
            self.set_role(copy, role);
        }
        debug!("cloned sourced element without expanding it");
        Ok(Some(copy))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::blob::{BinaryPayload, MemoryBlob};
    use crate::token::QName;
    use crate::view::View;

    fn tree_with_binary() -> (NodeGraph, NodeId, NodeId) {
        let mut graph = NodeGraph::new(View::Om);
        let root = graph.create_element(QName::local("root"));
        let doc = graph.document();
        graph.append_child(doc, root).unwrap();
        graph.set_attribute(root, QName::local("id"), "1").unwrap();
        let blob = Rc::new(MemoryBlob::new(b"payload".to_vec()));
        let bin = graph.create_binary_text(BinaryPayload::new(blob).with_content_id("cid:1"));
        graph.append_child(root, bin).unwrap();
        (graph, root, bin)
    }

    #[test]
    fn test_clone_shares_blob_by_default() {
        let (mut graph, root, bin) = tree_with_binary();
        let copy = graph.clone_subtree(root, &CloneOptions::default()).unwrap();
        let bin_copy = graph.first_child_if_available(copy).unwrap();
        assert_ne!(bin_copy, bin);
        let original = graph.binary(bin).unwrap();
        let cloned = graph.binary(bin_copy).unwrap();
        assert!(original.shares_blob(cloned));
        assert_eq!(cloned.content_id.as_deref(), Some("cid:1"));
        assert_eq!(graph.attribute_value(copy, None, "id"), Some("1"));
        assert_eq!(graph.parent(copy), None);
    }

    #[test]
    fn test_clone_materializes_when_eager() {
        let (mut graph, root, bin) = tree_with_binary();
        let options = CloneOptions::default().eager_materialize(true);
        let copy = graph.clone_subtree(root, &options).unwrap();
        let bin_copy = graph.first_child_if_available(copy).unwrap();
        let original = graph.binary(bin).unwrap();
        let cloned = graph.binary(bin_copy).unwrap();
        assert!(!original.shares_blob(cloned));
        assert_eq!(cloned.to_base64().unwrap(), original.to_base64().unwrap());
    }

    #[test]
    fn test_clone_copies_attributes_as_new_nodes() {
        let (mut graph, root, _) = tree_with_binary();
        let copy = graph.clone_subtree(root, &CloneOptions::default()).unwrap();
        let original_attr = graph.attribute(root, None, "id").unwrap();
        let copied_attr = graph.attribute(copy, None, "id").unwrap();
        assert_ne!(original_attr, copied_attr);
        assert_eq!(graph.parent(copied_attr), Some(copy));
    }
}
