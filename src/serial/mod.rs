//! Serialization.
//!
//! A [`Serializer`] walks a node and reports it to a [`Sink`]. Every walk
//! goes through a [`NamespaceRepairer`], so the sink sees each namespace
//! declaration exactly where it is first needed.
//!
//! Two modes:
//!
//! - **Tree-preserving** (the default): nodes still being built are built
//!   through lazy navigation, and the tree stays navigable afterwards.
//! - **Consuming**: nodes are freed as soon as they have been written, and
//!   the unread rest of a `Fresh` container is streamed straight from its
//!   builder without creating nodes. The serialized node is left consumed.

mod collect;
mod repair;
mod xml;

pub use collect::TokenCollector;
pub use repair::NamespaceRepairer;
pub use xml::{escape_attribute, escape_text, XmlWriter};

use std::io;

use log::debug;

use crate::blob::BinaryPayload;
use crate::error::{IoError, Result, StateError};
use crate::sourced::ExpansionState;
use crate::token::{DocTypeDecl, QName, Token, XmlDeclaration};
use crate::tree::{BuildState, NodeGraph, NodeId, NodeKind, TextContent};

/// Receives serialization events.
///
/// Namespace declarations and attributes follow their start element and
/// precede anything else.
pub trait Sink {
    fn write_start_document(&mut self, _declaration: &XmlDeclaration) -> io::Result<()> {
        Ok(())
    }

    fn write_end_document(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn write_doctype(&mut self, _doctype: &DocTypeDecl) -> io::Result<()> {
        Ok(())
    }

    fn write_start_element(&mut self, name: &QName) -> io::Result<()>;

    fn write_namespace_decl(&mut self, prefix: &str, uri: &str) -> io::Result<()>;

    fn write_attribute(&mut self, name: &QName, value: &str) -> io::Result<()>;

    fn write_end_element(&mut self) -> io::Result<()>;

    fn write_characters(&mut self, text: &str) -> io::Result<()>;

    fn write_cdata(&mut self, text: &str) -> io::Result<()>;

    fn write_comment(&mut self, text: &str) -> io::Result<()>;

    fn write_pi(&mut self, target: &str, data: &str) -> io::Result<()>;

    /// Entity references are dropped unless the sink handles them.
    fn write_entity_ref(&mut self, _name: &str) -> io::Result<()> {
        Ok(())
    }

    /// Binary character content. The default inlines it as base64, read
    /// from the blob in bounded chunks; a sink may override this to send
    /// the blob out of band.
    fn write_binary(&mut self, payload: &BinaryPayload) -> io::Result<()> {
        payload.write_base64(&mut |chunk| self.write_characters(chunk))
    }
}

impl<S: Sink + ?Sized> Sink for &mut S {
    fn write_start_document(&mut self, declaration: &XmlDeclaration) -> io::Result<()> {
        (**self).write_start_document(declaration)
    }

    fn write_end_document(&mut self) -> io::Result<()> {
        (**self).write_end_document()
    }

    fn write_doctype(&mut self, doctype: &DocTypeDecl) -> io::Result<()> {
        (**self).write_doctype(doctype)
    }

    fn write_start_element(&mut self, name: &QName) -> io::Result<()> {
        (**self).write_start_element(name)
    }

    fn write_namespace_decl(&mut self, prefix: &str, uri: &str) -> io::Result<()> {
        (**self).write_namespace_decl(prefix, uri)
    }

    fn write_attribute(&mut self, name: &QName, value: &str) -> io::Result<()> {
        (**self).write_attribute(name, value)
    }

    fn write_end_element(&mut self) -> io::Result<()> {
        (**self).write_end_element()
    }

    fn write_characters(&mut self, text: &str) -> io::Result<()> {
        (**self).write_characters(text)
    }

    fn write_cdata(&mut self, text: &str) -> io::Result<()> {
        (**self).write_cdata(text)
    }

    fn write_comment(&mut self, text: &str) -> io::Result<()> {
        (**self).write_comment(text)
    }

    fn write_pi(&mut self, target: &str, data: &str) -> io::Result<()> {
        (**self).write_pi(target, data)
    }

    fn write_entity_ref(&mut self, name: &str) -> io::Result<()> {
        (**self).write_entity_ref(name)
    }

    fn write_binary(&mut self, payload: &BinaryPayload) -> io::Result<()> {
        (**self).write_binary(payload)
    }
}

/// Options controlling serialization.
#[derive(Debug, Clone)]
pub struct SerializeOptions {
    /// Report the document's XML declaration to the sink. Defaults to
    /// `false`.
    pub xml_declaration: bool,
    /// Consume the tree while writing it. Defaults to `false`.
    pub consume: bool,
    /// Stem for prefixes the repairer has to invent. Defaults to `"ns"`.
    pub prefix_base: String,
}

impl Default for SerializeOptions {
    fn default() -> Self {
        Self {
            xml_declaration: false,
            consume: false,
            prefix_base: "ns".to_string(),
        }
    }
}

impl SerializeOptions {
    #[must_use]
    pub fn xml_declaration(mut self, declaration: bool) -> Self {
        self.xml_declaration = declaration;
        self
    }

    #[must_use]
    pub fn consume(mut self, consume: bool) -> Self {
        self.consume = consume;
        self
    }

    #[must_use]
    pub fn prefix_base(mut self, base: &str) -> Self {
        self.prefix_base = base.to_string();
        self
    }
}

/// Writes nodes to sinks.
#[derive(Debug, Clone, Default)]
pub struct Serializer {
    options: SerializeOptions,
}

impl Serializer {
    pub fn new(options: SerializeOptions) -> Self {
        Self { options }
    }

    /// Writes `node` and its subtree to `sink`.
    ///
    /// # Errors
    ///
    /// - [`StateError::NodeConsumed`] if the node was discarded or already
    ///   consumed.
    /// - Build errors met while completing `Fresh` nodes.
    /// - [`IoError`] from the sink or a blob.
    ///
    /// A failure in consuming mode leaves the tree partially consumed.
    pub fn serialize(&self, graph: &mut NodeGraph, node: NodeId, sink: &mut dyn Sink) -> Result<()> {
        graph.check_live(node)?;
        let mut out = NamespaceRepairer::new(sink, &self.options.prefix_base);
        if self.options.consume {
            debug!("consuming serialization of {}", graph.kind(node).describe());
            self.consume(graph, node, &mut out, true)?;
        } else {
            self.write_node(graph, node, &mut out)?;
        }
        out.finish()?;
        Ok(())
    }

    fn write_node(&self, graph: &mut NodeGraph, node: NodeId, out: &mut dyn Sink) -> Result<()> {
        if graph.expansion_state(node) == Some(ExpansionState::NotExpanded) {
            if let Some(source) = graph.data_source(node) {
                if !source.is_destructive_write() {
                    return source.serialize(out);
                }
            }
            // A destructive source would be gone after writing; build it so
            // the tree survives.
            graph.expand(node)?;
        }
        if graph.is_element(node) {
            write_start_tag(graph, node, out)?;
            self.write_children(graph, node, out)?;
            out.write_end_element()?;
        } else if matches!(graph.kind(node), NodeKind::Document(_)) {
            self.write_declaration(graph, node, out)?;
            self.write_children(graph, node, out)?;
            out.write_end_document()?;
        } else {
            write_leaf(graph.kind(node), out)?;
        }
        Ok(())
    }

    /// Reports the document's declaration, reading it from the input first
    /// if nothing has been pulled yet.
    fn write_declaration(&self, graph: &mut NodeGraph, doc: NodeId, out: &mut dyn Sink) -> Result<()> {
        if !self.options.xml_declaration {
            return Ok(());
        }
        graph.ensure_declaration(doc)?;
        if let NodeKind::Document(data) = graph.kind(doc) {
            out.write_start_document(&data.declaration)?;
        }
        Ok(())
    }

    fn write_children(&self, graph: &mut NodeGraph, node: NodeId, out: &mut dyn Sink) -> Result<()> {
        let mut child = graph.first_child(node)?;
        while let Some(c) = child {
            self.write_node(graph, c, out)?;
            child = graph.next_sibling(c)?;
        }
        Ok(())
    }

    /// Writes and frees `node`. The top node stays behind as a consumed
    /// tombstone so later use reports [`StateError::NodeConsumed`].
    fn consume(&self, graph: &mut NodeGraph, node: NodeId, out: &mut dyn Sink, top: bool) -> Result<()> {
        if graph.expansion_state(node) == Some(ExpansionState::NotExpanded) {
            let source = graph.data_source(node).ok_or(StateError::NotSourced)?;
            source.serialize(out)?;
        } else if graph.is_element(node) {
            write_start_tag(graph, node, out)?;
            self.consume_children(graph, node, out)?;
            out.write_end_element()?;
        } else if matches!(graph.kind(node), NodeKind::Document(_)) {
            self.write_declaration(graph, node, out)?;
            self.consume_children(graph, node, out)?;
            out.write_end_document()?;
        } else {
            write_leaf(graph.kind(node), out)?;
        }
        if top {
            graph.tombstone(node);
        } else {
            graph.free_subtree(node);
        }
        Ok(())
    }

    fn consume_children(&self, graph: &mut NodeGraph, node: NodeId, out: &mut dyn Sink) -> Result<()> {
        while let Some(child) = graph.first_child_if_available(node) {
            self.consume(graph, child, out, false)?;
        }
        if graph.state(node) == BuildState::Fresh {
            graph.pass_through(node, out)?;
        }
        Ok(())
    }
}

fn write_start_tag(graph: &NodeGraph, node: NodeId, out: &mut dyn Sink) -> io::Result<()> {
    let Some(element) = graph.element(node) else {
        return Ok(());
    };
    out.write_start_element(&element.name)?;
    for &decl in &element.namespaces {
        if let NodeKind::NamespaceDeclaration(binding) = graph.kind(decl) {
            out.write_namespace_decl(&binding.prefix, &binding.uri)?;
        }
    }
    for &attr in &element.attributes {
        if let NodeKind::Attribute(a) = graph.kind(attr) {
            out.write_attribute(&a.name, &a.value)?;
        }
    }
    Ok(())
}

fn write_leaf(kind: &NodeKind, out: &mut dyn Sink) -> io::Result<()> {
    match kind {
        NodeKind::Text(TextContent::Literal(text)) => out.write_characters(text),
        NodeKind::Text(TextContent::Binary(payload)) => out.write_binary(payload),
        NodeKind::CData(text) => out.write_cdata(text),
        NodeKind::Comment(text) => out.write_comment(text),
        NodeKind::ProcessingInstruction { target, data } => out.write_pi(target, data),
        NodeKind::DocType(doctype) => out.write_doctype(doctype),
        NodeKind::EntityReference { name, .. } => out.write_entity_ref(name),
        NodeKind::Document(_) | NodeKind::Element(_) | NodeKind::Attribute(_) | NodeKind::NamespaceDeclaration(_) => {
            Ok(())
        }
    }
}

/// Reports one token to a sink.
pub(crate) fn write_token(sink: &mut dyn Sink, token: &Token) -> io::Result<()> {
    match token {
        Token::StartDocument(declaration) => sink.write_start_document(declaration),
        Token::EndDocument => sink.write_end_document(),
        Token::DocType(doctype) => sink.write_doctype(doctype),
        Token::StartElement(tag) => {
            sink.write_start_element(&tag.name)?;
            for binding in &tag.namespaces {
                sink.write_namespace_decl(&binding.prefix, &binding.uri)?;
            }
            for attr in &tag.attributes {
                sink.write_attribute(&attr.name, &attr.value)?;
            }
            Ok(())
        }
        Token::EndElement => sink.write_end_element(),
        Token::Characters(text) => sink.write_characters(text),
        Token::Binary(payload) => sink.write_binary(payload),
        Token::CData(text) => sink.write_cdata(text),
        Token::Comment(text) => sink.write_comment(text),
        Token::ProcessingInstruction { target, data } => sink.write_pi(target, data),
        Token::EntityReference { name, .. } => sink.write_entity_ref(name),
    }
}

/// Tree-preserving serialization with default options.
///
/// # Errors
///
/// See [`Serializer::serialize`].
pub fn serialize(graph: &mut NodeGraph, node: NodeId, sink: &mut dyn Sink) -> Result<()> {
    Serializer::default().serialize(graph, node, sink)
}

/// Consuming serialization: the tree is dismantled as it is written.
///
/// # Errors
///
/// See [`Serializer::serialize`].
pub fn serialize_and_consume(graph: &mut NodeGraph, node: NodeId, sink: &mut dyn Sink) -> Result<()> {
    Serializer::new(SerializeOptions::default().consume(true)).serialize(graph, node, sink)
}

/// Serializes `node` to an XML string.
///
/// # Errors
///
/// See [`Serializer::serialize`].
pub fn to_xml_string(graph: &mut NodeGraph, node: NodeId) -> Result<String> {
    to_xml_string_with_options(graph, node, &SerializeOptions::default())
}

/// Serializes `node` to an XML string with the given options.
///
/// # Errors
///
/// See [`Serializer::serialize`].
pub fn to_xml_string_with_options(graph: &mut NodeGraph, node: NodeId, options: &SerializeOptions) -> Result<String> {
    let mut writer = XmlWriter::new(Vec::new());
    Serializer::new(options.clone()).serialize(graph, node, &mut writer)?;
    String::from_utf8(writer.into_inner()).map_err(|e| IoError::new(e.to_string()).into())
}

impl NodeGraph {
    /// Leaves `node` detached, childless and consumed.
    pub(crate) fn tombstone(&mut self, node: NodeId) {
        self.free_children(node);
        self.detach(node);
        if let Some(data) = self.get_mut(node) {
            if let NodeKind::Element(e) = &mut data.kind {
                e.sourced = None;
            }
            data.state = BuildState::Discarded;
            data.builder = None;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::rc::Rc;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::blob::MemoryBlob;
    use crate::view::View;

    #[test]
    fn test_tree_preserving_builds_and_keeps_tree() {
        let xml = r#"<a x="1"><b>t</b><!--c--><?p d?><c/></a>"#;
        let mut graph = NodeGraph::parse_str(xml, View::Om);
        let doc = graph.document();
        assert_eq!(to_xml_string(&mut graph, doc).unwrap(), xml);
        assert_eq!(graph.state(doc), BuildState::Complete);
        assert_eq!(to_xml_string(&mut graph, doc).unwrap(), xml);
    }

    #[test]
    fn test_consuming_streams_and_tombstones() {
        let xml = r#"<a><b>t</b><c><d/></c></a>"#;
        let mut graph = NodeGraph::parse_str(xml, View::Om);
        let a = graph.document_element(false).unwrap().unwrap();
        graph.first_child(a).unwrap();
        let mut writer = XmlWriter::new(Vec::new());
        serialize_and_consume(&mut graph, a, &mut writer).unwrap();
        assert_eq!(String::from_utf8(writer.into_inner()).unwrap(), xml);
        let err = to_xml_string(&mut graph, a).unwrap_err();
        assert_eq!(err.as_state(), Some(StateError::NodeConsumed));
        // Only the document and the tombstone are left.
        assert_eq!(graph.live_node_count(), 2);
    }

    #[test]
    fn test_consuming_whole_document() {
        let xml = "<?xml version=\"1.0\"?><a>x<b/></a>";
        let mut graph = NodeGraph::parse_str(xml, View::Om);
        let doc = graph.document();
        let options = SerializeOptions::default().consume(true).xml_declaration(true);
        let out = to_xml_string_with_options(&mut graph, doc, &options).unwrap();
        assert_eq!(out, xml);
        assert_eq!(graph.state(doc), BuildState::Discarded);
    }

    #[test]
    fn test_moved_element_gets_its_namespace() {
        let mut graph = NodeGraph::parse_str(r#"<r xmlns:p="urn:p"><p:x p:a="1"/></r>"#, View::Om);
        let r = graph.document_element(false).unwrap().unwrap();
        let x = graph.first_child(r).unwrap().unwrap();
        assert_eq!(to_xml_string(&mut graph, x).unwrap(), r#"<p:x xmlns:p="urn:p" p:a="1"/>"#);
    }

    #[test]
    fn test_binary_text_is_inlined_as_base64() {
        let mut graph = NodeGraph::new(View::Om);
        let e = graph.create_element(QName::local("data"));
        let bin = graph.create_binary_text(BinaryPayload::new(Rc::new(MemoryBlob::new(b"hello".to_vec()))));
        graph.append_child(e, bin).unwrap();
        assert_eq!(to_xml_string(&mut graph, e).unwrap(), "<data>aGVsbG8=</data>");
    }

    #[test]
    fn test_sink_error_is_io_error() {
        #[derive(Default)]
        struct Failing;
        impl Sink for Failing {
            fn write_start_element(&mut self, _name: &QName) -> io::Result<()> {
                Err(io::Error::other("disk full"))
            }
            fn write_namespace_decl(&mut self, _prefix: &str, _uri: &str) -> io::Result<()> {
                Ok(())
            }
            fn write_attribute(&mut self, _name: &QName, _value: &str) -> io::Result<()> {
                Ok(())
            }
            fn write_end_element(&mut self) -> io::Result<()> {
                Ok(())
            }
            fn write_characters(&mut self, _text: &str) -> io::Result<()> {
                Ok(())
            }
            fn write_cdata(&mut self, _text: &str) -> io::Result<()> {
                Ok(())
            }
            fn write_comment(&mut self, _text: &str) -> io::Result<()> {
                Ok(())
            }
            fn write_pi(&mut self, _target: &str, _data: &str) -> io::Result<()> {
                Ok(())
            }
        }
        let mut graph = NodeGraph::parse_str("<a><b/></a>", View::Om);
        let doc = graph.document();
        let err = serialize(&mut graph, doc, &mut Failing).unwrap_err();
        assert!(matches!(err, crate::error::ModelError::Io(_)));
    }
}
