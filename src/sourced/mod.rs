//! Sourced elements.
//!
//! A sourced element carries a [`DataSource`] instead of built content. Its
//! name can often be answered by the source itself, and it can be written
//! out by the source without ever building a node. The first structural
//! access *expands* it: a private builder in unwrap mode reads the source,
//! merges the root start tag into the element and then fills it lazily like
//! any other `Fresh` container.

use std::cell::RefCell;
use std::fmt;

use log::debug;

use crate::builder::{root_started, sourced_builder, Step};
use crate::error::{IoError, Result, StateError};
use crate::serial::{self, write_token, Sink};
use crate::source::XmlSource;
use crate::token::{EventSource, QName, Token, TokenStream};
use crate::tree::{BuildState, ElementData, NodeGraph, NodeId, NodeKind};

/// A producer of element content.
pub trait DataSource: fmt::Debug {
    /// Opens a token stream over the content. The stream is a document: its
    /// single element is the sourced element itself.
    ///
    /// # Errors
    ///
    /// Fails if the content cannot be produced (again).
    fn reader(&self) -> Result<Box<dyn EventSource>>;

    /// The element name, if known without reading.
    fn qname(&self) -> Option<QName> {
        None
    }

    /// Writes the element to `sink`. The default replays
    /// [`reader`](Self::reader), skipping the document-level tokens.
    ///
    /// # Errors
    ///
    /// Parse errors from the reader and I/O errors from the sink.
    fn serialize(&self, sink: &mut dyn Sink) -> Result<()> {
        let mut reader = self.reader()?;
        let mut depth = 0usize;
        loop {
            let token = reader.next_token()?;
            match &token {
                Token::EndDocument => break,
                Token::StartElement(_) => depth += 1,
                Token::EndElement => {
                    write_token(sink, &token)?;
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        break;
                    }
                    continue;
                }
                _ if depth == 0 => continue,
                _ => {}
            }
            write_token(sink, &token)?;
        }
        reader.close();
        Ok(())
    }

    /// Reading the content consumes it.
    fn is_destructive_read(&self) -> bool {
        false
    }

    /// Writing the content consumes it.
    fn is_destructive_write(&self) -> bool {
        false
    }

    /// An independent copy, for cloning without expansion.
    fn copy(&self) -> Option<Box<dyn DataSource>> {
        None
    }
}

/// Content given as XML text.
#[derive(Debug, Clone)]
pub struct StringDataSource {
    xml: String,
    name: Option<QName>,
}

impl StringDataSource {
    pub fn new(xml: impl Into<String>) -> Self {
        Self {
            xml: xml.into(),
            name: None,
        }
    }

    /// Lets the source answer [`DataSource::qname`] without parsing.
    #[must_use]
    pub fn with_name(mut self, name: QName) -> Self {
        self.name = Some(name);
        self
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.xml
    }
}

impl DataSource for StringDataSource {
    fn reader(&self) -> Result<Box<dyn EventSource>> {
        Ok(Box::new(XmlSource::from_text(self.xml.clone())))
    }

    fn qname(&self) -> Option<QName> {
        self.name.clone()
    }

    fn copy(&self) -> Option<Box<dyn DataSource>> {
        Some(Box::new(self.clone()))
    }
}

/// Content held as a captured token run, from a start tag to its matching
/// end tag.
#[derive(Debug, Clone)]
pub struct TokenDataSource {
    tokens: Vec<Token>,
}

impl TokenDataSource {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self { tokens }
    }

    #[must_use]
    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }
}

impl DataSource for TokenDataSource {
    fn reader(&self) -> Result<Box<dyn EventSource>> {
        Ok(Box::new(TokenStream::document(self.tokens.iter().cloned())))
    }

    fn qname(&self) -> Option<QName> {
        self.tokens.iter().find_map(|t| match t {
            Token::StartElement(tag) => Some(tag.name.clone()),
            _ => None,
        })
    }

    fn serialize(&self, sink: &mut dyn Sink) -> Result<()> {
        for token in &self.tokens {
            write_token(sink, token)?;
        }
        Ok(())
    }

    fn copy(&self) -> Option<Box<dyn DataSource>> {
        Some(Box::new(self.clone()))
    }
}

/// A one-shot source over an arbitrary token stream. Reading or writing it
/// consumes the stream.
pub struct ReaderDataSource {
    stream: RefCell<Option<Box<dyn EventSource>>>,
    name: Option<QName>,
}

impl fmt::Debug for ReaderDataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaderDataSource")
            .field("consumed", &self.stream.borrow().is_none())
            .field("name", &self.name)
            .finish()
    }
}

impl ReaderDataSource {
    pub fn new(stream: impl EventSource + 'static, name: Option<QName>) -> Self {
        Self {
            stream: RefCell::new(Some(Box::new(stream))),
            name,
        }
    }
}

impl DataSource for ReaderDataSource {
    fn reader(&self) -> Result<Box<dyn EventSource>> {
        self.stream
            .borrow_mut()
            .take()
            .ok_or_else(|| IoError::new("the token stream was already consumed").into())
    }

    fn qname(&self) -> Option<QName> {
        self.name.clone()
    }

    fn is_destructive_read(&self) -> bool {
        true
    }

    fn is_destructive_write(&self) -> bool {
        true
    }
}

/// Whether a sourced element has been read into nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExpansionState {
    NotExpanded,
    Expanded,
}

/// The data source of a sourced element.
#[derive(Debug)]
pub struct SourcedPayload {
    pub(crate) source: Box<dyn DataSource>,
    pub(crate) state: ExpansionState,
}

impl SourcedPayload {
    pub(crate) fn new(source: Box<dyn DataSource>) -> Self {
        Self {
            source,
            state: ExpansionState::NotExpanded,
        }
    }
}

impl NodeGraph {
    /// Creates a detached sourced element. If the source cannot name the
    /// element, it is expanded right away to learn the name.
    ///
    /// # Errors
    ///
    /// Errors raised by that expansion.
    pub fn create_sourced_element(&mut self, source: Box<dyn DataSource>) -> Result<NodeId> {
        match source.qname() {
            Some(name) => Ok(self.create_sourced_element_named(name, source)),
            None => {
                let id = self.create_sourced_element_named(QName::default(), source);
                if let Err(err) = self.expand(id) {
                    self.free_subtree(id);
                    return Err(err);
                }
                Ok(id)
            }
        }
    }

    /// Creates a detached sourced element with a known name.
    pub fn create_sourced_element_named(&mut self, name: QName, source: Box<dyn DataSource>) -> NodeId {
        self.alloc(
            NodeKind::Element(ElementData {
                sourced: Some(SourcedPayload::new(source)),
                ..ElementData::new(name)
            }),
            BuildState::Fresh,
        )
    }

    /// Reads the root start tag of an unexpanded sourced element and
    /// attaches a private builder for the rest. A no-op for any other node.
    ///
    /// # Errors
    ///
    /// Errors from opening the source or reading its start tag.
    pub fn expand(&mut self, id: NodeId) -> Result<()> {
        let Some(NodeKind::Element(element)) = self.get(id).map(|d| &d.kind) else {
            return Ok(());
        };
        let Some(payload) = &element.sourced else {
            return Ok(());
        };
        if payload.state == ExpansionState::Expanded {
            return Ok(());
        }
        let reader = payload.source.reader()?;
        if let NodeKind::Element(element) = &mut self.node_mut(id).kind {
            if let Some(payload) = &mut element.sourced {
                payload.state = ExpansionState::Expanded;
            }
        }
        let bid = self.register_builder(sourced_builder(reader, id));
        self.node_mut(id).builder = Some(bid);
        debug!("expanding sourced {}", self.kind(id).describe());
        while !root_started(self, bid) {
            if self.step(bid)? == Step::Finished {
                break;
            }
        }
        Ok(())
    }

    /// Expansion state of a sourced element; `None` for other nodes.
    #[must_use]
    pub fn expansion_state(&self, id: NodeId) -> Option<ExpansionState> {
        match &self.get(id)?.kind {
            NodeKind::Element(e) => e.sourced.as_ref().map(|p| p.state),
            _ => None,
        }
    }

    /// The data source of a sourced element.
    #[must_use]
    pub fn data_source(&self, id: NodeId) -> Option<&dyn DataSource> {
        match &self.get(id)?.kind {
            NodeKind::Element(e) => e.sourced.as_ref().map(|p| p.source.as_ref()),
            _ => None,
        }
    }

    /// Writes an element to `sink`. An unexpanded sourced element lets its
    /// source write itself without building anything; if that write is
    /// destructive the element is consumed. Anything else is serialized
    /// from the tree.
    ///
    /// # Errors
    ///
    /// [`StateError::NodeConsumed`] for a discarded node, plus write and
    /// build errors.
    pub fn write_direct(&mut self, id: NodeId, sink: &mut dyn Sink) -> Result<()> {
        self.check_live(id)?;
        if self.expansion_state(id) != Some(ExpansionState::NotExpanded) {
            return serial::serialize(self, id, sink);
        }
        let destructive = {
            let source = self.data_source(id).ok_or(StateError::NotSourced)?;
            source.serialize(sink)?;
            source.is_destructive_write()
        };
        if destructive {
            if let NodeKind::Element(e) = &mut self.node_mut(id).kind {
                e.sourced = None;
            }
            self.detach(id);
            self.node_mut(id).state = BuildState::Discarded;
            debug!("sourced element consumed by a destructive write");
        }
        Ok(())
    }

    /// Replaces an element's content, attributes and declarations with a
    /// new data source. The element becomes unexpanded and takes the
    /// source's name when the source knows it.
    ///
    /// # Errors
    ///
    /// [`StateError::NotAContainer`] if `id` is not an element, plus errors
    /// from skipping the element's unread input.
    pub fn set_data_source(&mut self, id: NodeId, source: Box<dyn DataSource>) -> Result<()> {
        self.check_live(id)?;
        if !self.is_element(id) {
            return Err(StateError::NotAContainer.into());
        }
        if self.expansion_state(id) == Some(ExpansionState::NotExpanded) {
            if let NodeKind::Element(e) = &mut self.node_mut(id).kind {
                e.sourced = None;
            }
        } else if self.state(id) == BuildState::Fresh {
            self.remove_children(id)?;
        }
        self.free_children(id);
        let owned: Vec<NodeId> = self
            .element(id)
            .map(|e| e.attributes.iter().chain(&e.namespaces).copied().collect())
            .unwrap_or_default();
        for node in owned {
            self.free_subtree(node);
        }
        let name = source.qname();
        let data = self.node_mut(id);
        data.state = BuildState::Fresh;
        data.builder = None;
        if let NodeKind::Element(e) = &mut data.kind {
            if let Some(name) = name {
                e.name = name;
            }
            e.sourced = Some(SourcedPayload::new(source));
        }
        Ok(())
    }
}
