//! Namespace scope lookup over the ancestor chain.
//!
//! Only declarations on the node's own element and its ancestors are
//! visited, closest first, so a nearer declaration shadows a farther one.
//! Lookup never pulls from a builder: an element's declarations arrive with
//! its start tag, and a node's ancestors are always started.

use crate::token::NamespaceBinding;
use crate::tree::{NodeGraph, NodeId, NodeKind};

/// The namespace bound to the `xml` prefix.
pub const XML_NAMESPACE: &str = "http://www.w3.org/XML/1998/namespace";

/// The namespace of `xmlns` attributes.
pub const XMLNS_NAMESPACE: &str = "http://www.w3.org/2000/xmlns/";

impl NodeGraph {
    /// Walks the declarations in scope at `node`, closest first.
    fn scope_bindings(&self, node: NodeId) -> impl Iterator<Item = &NamespaceBinding> + '_ {
        self.ancestors(node)
            .filter(move |&a| self.is_element(a))
            .flat_map(move |element| {
                self.namespace_declarations(element)
                    .iter()
                    .filter_map(move |&decl| self.namespace_binding(decl))
            })
    }

    /// Resolves `prefix` (empty for the default namespace) at `node`.
    ///
    /// Returns `None` if the prefix is unbound. The `xml` and `xmlns`
    /// prefixes are always bound.
    ///
    /// # Examples
    ///
    /// ```
    /// use lazyxml::{NodeGraph, View};
    ///
    /// let mut graph = NodeGraph::parse_str(
    ///     r#"<root xmlns:x="urn:x"><x:child/></root>"#,
    ///     View::Om,
    /// );
    /// let root = graph.document_element(false).unwrap().unwrap();
    /// let child = graph.first_child(root).unwrap().unwrap();
    /// assert_eq!(graph.find_namespace_uri(child, "x"), Some("urn:x"));
    /// ```
    #[must_use]
    pub fn find_namespace_uri(&self, node: NodeId, prefix: &str) -> Option<&str> {
        match prefix {
            "xml" => return Some(XML_NAMESPACE),
            "xmlns" => return Some(XMLNS_NAMESPACE),
            _ => {}
        }
        self.scope_bindings(node)
            .find(|b| b.prefix == prefix)
            .map(|b| b.uri.as_str())
    }

    /// Finds a prefix bound to `uri` at `node` that is not shadowed by a
    /// closer declaration of the same prefix.
    #[must_use]
    pub fn find_prefix(&self, node: NodeId, uri: &str) -> Option<&str> {
        if uri == XML_NAMESPACE {
            return Some("xml");
        }
        self.scope_bindings(node)
            .filter(|b| b.uri == uri)
            .map(|b| b.prefix.as_str())
            .find(|prefix| self.find_namespace_uri(node, prefix) == Some(uri))
    }

    /// Looks up a namespace binding in scope at `node` by URI, by prefix, or
    /// by both.
    ///
    /// With both given, the binding must match on both and not be shadowed.
    /// With neither, returns `None`.
    #[must_use]
    pub fn find_namespace(
        &self,
        node: NodeId,
        uri: Option<&str>,
        prefix: Option<&str>,
    ) -> Option<NamespaceBinding> {
        match (uri, prefix) {
            (None, Some(prefix)) => self
                .find_namespace_uri(node, prefix)
                .map(|uri| NamespaceBinding::new(prefix, uri)),
            (Some(uri), None) => self
                .find_prefix(node, uri)
                .map(|prefix| NamespaceBinding::new(prefix, uri)),
            (Some(uri), Some(prefix)) => (self.find_namespace_uri(node, prefix) == Some(uri))
                .then(|| NamespaceBinding::new(prefix, uri)),
            (None, None) => None,
        }
    }

    /// All bindings visible at `node`, each prefix once, closest
    /// declaration winning. Order is closest element first.
    #[must_use]
    pub fn namespaces_in_scope(&self, node: NodeId) -> Vec<NamespaceBinding> {
        let mut seen: Vec<NamespaceBinding> = Vec::new();
        for binding in self.scope_bindings(node) {
            if !seen.iter().any(|b| b.prefix == binding.prefix) {
                seen.push(binding.clone());
            }
        }
        seen
    }

    /// Returns the element that owns or contains `node`, for scope lookups
    /// that start at a non-element node.
    #[must_use]
    pub fn scope_element(&self, node: NodeId) -> Option<NodeId> {
        self.ancestors(node)
            .find(|&a| matches!(self.node(a).kind, NodeKind::Element(_)))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use crate::token::QName;
    use crate::tree::NodeGraph;
    use crate::view::View;

    #[test]
    fn test_closer_declaration_shadows() {
        let mut graph = NodeGraph::new(View::Om);
        let outer = graph.create_element(QName::local("outer"));
        let inner = graph.create_element(QName::local("inner"));
        let doc = graph.document();
        graph.append_child(doc, outer).unwrap();
        graph.append_child(outer, inner).unwrap();
        graph.declare_namespace(outer, "p", "urn:outer").unwrap();
        graph.declare_namespace(inner, "p", "urn:inner").unwrap();
        graph.declare_namespace(outer, "q", "urn:inner").unwrap();

        assert_eq!(graph.find_namespace_uri(inner, "p"), Some("urn:inner"));
        assert_eq!(graph.find_namespace_uri(outer, "p"), Some("urn:outer"));
        assert_eq!(graph.find_prefix(inner, "urn:outer"), None);
        assert_eq!(graph.find_prefix(inner, "urn:inner"), Some("p"));
        assert_eq!(graph.namespaces_in_scope(inner).len(), 2);
    }

    #[test]
    fn test_predefined_and_unbound_prefixes() {
        let mut graph = NodeGraph::new(View::Om);
        let e = graph.create_element(QName::local("e"));
        assert_eq!(
            graph.find_namespace_uri(e, "xml"),
            Some(super::XML_NAMESPACE)
        );
        assert_eq!(graph.find_namespace_uri(e, "nope"), None);
        assert_eq!(graph.find_namespace_uri(e, ""), None);
    }

    #[test]
    fn test_find_namespace_by_uri_and_prefix() {
        let mut graph = NodeGraph::new(View::Om);
        let e = graph.create_element(QName::local("e"));
        graph.declare_namespace(e, "a", "urn:a").unwrap();
        let text = graph.create_text("t");
        graph.append_child(e, text).unwrap();
        let found = graph.find_namespace(text, Some("urn:a"), None).unwrap();
        assert_eq!(found.prefix, "a");
        assert!(graph.find_namespace(e, Some("urn:a"), Some("b")).is_none());
        assert_eq!(graph.scope_element(text), Some(e));
    }
}
