//! Sourced elements: naming and writing without expansion, expansion on
//! structural access, destructive sources and custom builders.

#![allow(clippy::unwrap_used)]

use std::rc::Rc;

use lazyxml::{
    to_xml_string, BuildState, BuilderOptions, CloneOptions, DataSource, ExpansionState, NodeGraph, QName,
    ReaderDataSource, StartTag, StateError, StringDataSource, Token, TokenCaptureBuilder, TokenCollector,
    TokenDataSource, TokenStream, View, XmlWriter,
};
use pretty_assertions::assert_eq;

fn order_source() -> StringDataSource {
    StringDataSource::new(r#"<o:order xmlns:o="urn:orders" id="7"><o:line>widget</o:line></o:order>"#)
        .with_name(QName::with_prefix("urn:orders", "order", "o"))
}

fn write_direct_to_string(graph: &mut NodeGraph, id: lazyxml::NodeId) -> String {
    let mut writer = XmlWriter::new(Vec::new());
    graph.write_direct(id, &mut writer).unwrap();
    String::from_utf8(writer.into_inner()).unwrap()
}

// ---------------------------------------------------------------------------
// Fast path
// ---------------------------------------------------------------------------

#[test]
fn test_name_and_write_direct_never_expand() {
    let mut graph = NodeGraph::new(View::Om);
    let id = graph.create_sourced_element(Box::new(order_source())).unwrap();

    assert_eq!(graph.name(id).unwrap().local, "order");
    let out = write_direct_to_string(&mut graph, id);
    assert_eq!(out, r#"<o:order xmlns:o="urn:orders" id="7"><o:line>widget</o:line></o:order>"#);
    assert_eq!(graph.expansion_state(id), Some(ExpansionState::NotExpanded));
    assert_eq!(graph.state(id), BuildState::Fresh);

    // A second write works for a repeatable source.
    assert_eq!(write_direct_to_string(&mut graph, id), out);
}

#[test]
fn test_serializing_parent_uses_source() {
    let mut graph = NodeGraph::new(View::Om);
    let envelope = graph.create_element(QName::local("batch"));
    let order = graph.create_sourced_element(Box::new(order_source())).unwrap();
    graph.append_child(envelope, order).unwrap();

    let xml = to_xml_string(&mut graph, envelope).unwrap();
    assert_eq!(
        xml,
        r#"<batch><o:order xmlns:o="urn:orders" id="7"><o:line>widget</o:line></o:order></batch>"#
    );
    assert_eq!(graph.expansion_state(order), Some(ExpansionState::NotExpanded));
}

// ---------------------------------------------------------------------------
// Expansion
// ---------------------------------------------------------------------------

#[test]
fn test_structural_access_expands() {
    let mut graph = NodeGraph::new(View::Om);
    let id = graph.create_sourced_element(Box::new(order_source())).unwrap();

    let line = graph.first_child(id).unwrap().unwrap();
    assert_eq!(graph.expansion_state(id), Some(ExpansionState::Expanded));
    assert_eq!(graph.attribute_value(id, None, "id"), Some("7"));
    assert_eq!(graph.find_namespace_uri(id, "o"), Some("urn:orders"));
    assert_eq!(graph.text_content(line).unwrap(), "widget");
    graph.ensure_complete(id).unwrap();
    assert_eq!(graph.state(id), BuildState::Complete);
}

#[test]
fn test_expanded_element_serializes_from_tree() {
    let mut graph = NodeGraph::new(View::Om);
    let id = graph.create_sourced_element(Box::new(order_source())).unwrap();
    graph.expand(id).unwrap();
    graph.ensure_complete(id).unwrap();
    let line = graph.first_child(id).unwrap().unwrap();
    graph.detach(line);
    assert_eq!(
        to_xml_string(&mut graph, id).unwrap(),
        r#"<o:order xmlns:o="urn:orders" id="7"/>"#
    );
}

#[test]
fn test_unnamed_source_expands_on_creation() {
    let mut graph = NodeGraph::new(View::Om);
    let tokens = vec![
        Token::StartElement(StartTag::new(QName::local("note"))),
        Token::Characters("hi".to_string()),
        Token::EndElement,
    ];
    let stream = ReaderDataSource::new(TokenStream::document(tokens), None);
    let id = graph.create_sourced_element(Box::new(stream)).unwrap();
    assert_eq!(graph.expansion_state(id), Some(ExpansionState::Expanded));
    assert_eq!(graph.name(id), Some(&QName::local("note")));
    assert_eq!(graph.text_content(id).unwrap(), "hi");
}

#[test]
fn test_malformed_source_fails_expansion() {
    let mut graph = NodeGraph::new(View::Om);
    let source = StringDataSource::new("<a><b></a>").with_name(QName::local("a"));
    let id = graph.create_sourced_element(Box::new(source)).unwrap();
    let err = graph.ensure_complete(id).unwrap_err();
    assert!(err.is_parse());
}

// ---------------------------------------------------------------------------
// Destructive sources
// ---------------------------------------------------------------------------

#[test]
fn test_destructive_write_consumes_element() {
    let mut graph = NodeGraph::new(View::Om);
    let tokens = vec![
        Token::StartElement(StartTag::new(QName::local("once"))),
        Token::EndElement,
    ];
    let source = ReaderDataSource::new(TokenStream::document(tokens), Some(QName::local("once")));
    let parent = graph.create_element(QName::local("p"));
    let id = graph.create_sourced_element(Box::new(source)).unwrap();
    graph.append_child(parent, id).unwrap();

    assert_eq!(write_direct_to_string(&mut graph, id), "<once/>");
    assert_eq!(graph.state(id), BuildState::Discarded);
    assert_eq!(graph.parent(id), None);
    assert_eq!(graph.children(parent).unwrap(), Vec::new());

    let mut sink = TokenCollector::default();
    let err = graph.write_direct(id, &mut sink).unwrap_err();
    assert_eq!(err.as_state(), Some(StateError::NodeConsumed));
}

#[test]
fn test_tree_serialize_expands_destructive_source() {
    let mut graph = NodeGraph::new(View::Om);
    let tokens = vec![
        Token::StartElement(StartTag::new(QName::local("once"))),
        Token::Characters("x".to_string()),
        Token::EndElement,
    ];
    let source = ReaderDataSource::new(TokenStream::document(tokens), Some(QName::local("once")));
    let id = graph.create_sourced_element(Box::new(source)).unwrap();

    assert_eq!(to_xml_string(&mut graph, id).unwrap(), "<once>x</once>");
    // Expanded into nodes, so the element survives.
    assert_eq!(to_xml_string(&mut graph, id).unwrap(), "<once>x</once>");
}

// ---------------------------------------------------------------------------
// Replacing content and cloning
// ---------------------------------------------------------------------------

#[test]
fn test_set_data_source_replaces_content() {
    let mut graph = NodeGraph::parse_str("<root><old a='1'><x/></old><next/></root>", View::Om);
    let root = graph.document_element(false).unwrap().unwrap();
    let old = graph.first_child(root).unwrap().unwrap();
    graph
        .set_data_source(old, Box::new(StringDataSource::new("<new>n</new>").with_name(QName::local("new"))))
        .unwrap();
    assert_eq!(graph.name(old), Some(&QName::local("new")));
    assert_eq!(graph.attribute_value(old, None, "a"), None);

    assert_eq!(to_xml_string(&mut graph, root).unwrap(), "<root><new>n</new><next/></root>");
}

#[test]
fn test_set_data_source_on_text_fails() {
    let mut graph = NodeGraph::new(View::Om);
    let text = graph.create_text("t");
    let err = graph
        .set_data_source(text, Box::new(StringDataSource::new("<a/>")))
        .unwrap_err();
    assert_eq!(err.as_state(), Some(StateError::NotAContainer));
}

#[test]
fn test_clone_copies_source_without_expanding() {
    let mut graph = NodeGraph::new(View::Om);
    let id = graph.create_sourced_element(Box::new(order_source())).unwrap();
    let copy = graph.clone_subtree(id, &CloneOptions::default()).unwrap();
    assert_eq!(graph.expansion_state(id), Some(ExpansionState::NotExpanded));
    assert_eq!(graph.expansion_state(copy), Some(ExpansionState::NotExpanded));
    assert_eq!(write_direct_to_string(&mut graph, copy), write_direct_to_string(&mut graph, id));

    let expanded = graph
        .clone_subtree(id, &CloneOptions::default().expand_sourced(true))
        .unwrap();
    assert_eq!(graph.expansion_state(expanded), None);
    assert_eq!(graph.state(expanded), BuildState::Complete);
}

// ---------------------------------------------------------------------------
// Custom builders
// ---------------------------------------------------------------------------

#[test]
fn test_custom_builder_captures_matching_element() {
    let xml = r#"<r xmlns:p="urn:p"><p:payload><deep>1</deep></p:payload><after/></r>"#;
    let options = BuilderOptions::default().custom_builder(Some("urn:p"), Some("payload"), 2, Rc::new(TokenCaptureBuilder));
    let mut graph = NodeGraph::parse_str_with(xml, View::Om, options);
    let r = graph.document_element(false).unwrap().unwrap();
    let payload = graph.first_child(r).unwrap().unwrap();

    assert_eq!(graph.expansion_state(payload), Some(ExpansionState::NotExpanded));
    let mut captured = TokenCollector::default();
    graph.data_source(payload).unwrap().serialize(&mut captured).unwrap();
    assert_eq!(captured.tokens().len(), 5);

    let after = graph.next_sibling(payload).unwrap().unwrap();
    assert_eq!(graph.name(after), Some(&QName::local("after")));

    // The captured fragment declares the prefix it inherited.
    let written = write_direct_to_string(&mut graph, payload);
    assert_eq!(written, r#"<p:payload xmlns:p="urn:p"><deep>1</deep></p:payload>"#);
}

#[test]
fn test_token_data_source_round_trip() {
    let tokens = vec![
        Token::StartElement(StartTag::new(QName::new("urn:t", "t"))),
        Token::Comment("c".to_string()),
        Token::EndElement,
    ];
    let source = TokenDataSource::new(tokens.clone());
    assert_eq!(source.qname(), Some(QName::new("urn:t", "t")));
    let mut collector = TokenCollector::default();
    source.serialize(&mut collector).unwrap();
    assert_eq!(collector.into_tokens(), tokens);
}
