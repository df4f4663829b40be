//! The lazy builder.
//!
//! A builder owns an [`EventSource`] and a stack of open containers. It pulls
//! one token at a time, only when a read on the graph needs more content,
//! and turns each token into nodes at the position the stack dictates. Every
//! node it creates is `Fresh` until its end token has been consumed, at
//! which point it becomes `Complete` and loses its link to the builder.
//!
//! Builders live in a slab inside the [`NodeGraph`]. While one is stepping,
//! it is taken out of its slot; a re-entrant request for the same builder
//! fails with [`StateError::BuilderBusy`] instead of aliasing it.
//!
//! Two kinds of builder share this code:
//!
//! - the document builder, created by [`NodeGraph::from_source`] and rooted
//!   at the document node;
//! - private builders of sourced elements, which run in *unwrap* mode: the
//!   source's prolog is skipped and its root start tag is merged into the
//!   existing element.
//!
//! Custom builders are not builders in this sense. They receive a captured
//! token run and return a data source.

mod custom;

pub use custom::{CustomBuilder, CustomBuilderEntry, TokenCaptureBuilder};

use std::fmt;
use std::io::BufRead;
use std::rc::Rc;

use log::{debug, trace};

use crate::error::{HierarchyError, ParseError, Result, StateError};
use crate::serial::{write_token, Sink};
use crate::source::XmlSource;
use crate::sourced::{ExpansionState, SourcedPayload};
use crate::token::{is_xml_whitespace, EventSource, QName, StartTag, Token};
use crate::tree::{AttributeData, BuildState, DocumentData, ElementData, NodeGraph, NodeId, NodeKind, TextContent};
use crate::view::{classifier_for, element_model, ContentModel, ElementClassifier, ElementRole, View};

/// Index of a builder in its graph's builder slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct BuilderId(usize);

/// Lifecycle of a builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuilderState {
    /// Tokens remain to be pulled.
    Active,
    /// The root's end token has been consumed.
    Done,
    /// The root was discarded; the rest of its input was skipped.
    Discarded,
    /// Closed by the caller or by an error. Nodes still `Fresh` stay that
    /// way and report [`StateError::Unavailable`].
    Closed,
}

/// Options for a document builder.
#[derive(Debug, Clone)]
pub struct BuilderOptions {
    /// Release the token source as soon as the end of the document has been
    /// consumed. Defaults to `true`.
    pub auto_close: bool,
    /// Drop all whitespace-only character data. Defaults to `false`; views
    /// whose containers cannot hold whitespace drop it regardless.
    pub skip_ignorable_whitespace: bool,
    /// Custom builders, first match wins.
    pub custom_builders: Vec<CustomBuilderEntry>,
}

impl Default for BuilderOptions {
    fn default() -> Self {
        Self {
            auto_close: true,
            skip_ignorable_whitespace: false,
            custom_builders: Vec::new(),
        }
    }
}

impl BuilderOptions {
    #[must_use]
    pub fn auto_close(mut self, auto_close: bool) -> Self {
        self.auto_close = auto_close;
        self
    }

    #[must_use]
    pub fn skip_ignorable_whitespace(mut self, skip: bool) -> Self {
        self.skip_ignorable_whitespace = skip;
        self
    }

    /// Registers a custom builder for elements named `namespace`/`local`
    /// (`None` is a wildcard) at element levels up to `max_depth`.
    #[must_use]
    pub fn custom_builder(
        mut self,
        namespace: Option<&str>,
        local: Option<&str>,
        max_depth: usize,
        builder: Rc<dyn CustomBuilder>,
    ) -> Self {
        self.custom_builders.push(CustomBuilderEntry {
            namespace: namespace.map(str::to_string),
            local: local.map(str::to_string),
            max_depth,
            builder,
        });
        self
    }

    /// The deepest element level any registered custom builder applies to;
    /// 0 when none is registered.
    #[must_use]
    pub fn max_custom_builder_depth(&self) -> usize {
        self.custom_builders
            .iter()
            .map(|e| e.max_depth)
            .max()
            .unwrap_or(0)
    }

    fn custom_builder_for(&self, depth: usize, name: &QName) -> Option<Rc<dyn CustomBuilder>> {
        if depth > self.max_custom_builder_depth() {
            return None;
        }
        self.custom_builders
            .iter()
            .find(|e| e.applies_to(depth, name))
            .map(|e| Rc::clone(&e.builder))
    }
}

/// The outcome of one pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Created(NodeId),
    Ended(NodeId),
    Skipped,
    Finished,
}

pub(crate) struct Builder {
    source: Option<Box<dyn EventSource>>,
    state: BuilderState,
    /// Open containers, outermost first.
    frames: Vec<NodeId>,
    root: NodeId,
    unwrap: bool,
    root_started: bool,
    /// A token read by `peek_name` and not yet processed.
    lookahead: Option<Token>,
    classifier: Box<dyn ElementClassifier>,
    options: BuilderOptions,
    pulled: usize,
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("state", &self.state)
            .field("root", &self.root)
            .field("depth", &self.frames.len())
            .field("unwrap", &self.unwrap)
            .field("pulled", &self.pulled)
            .finish_non_exhaustive()
    }
}

impl Builder {
    fn new(
        source: Box<dyn EventSource>,
        root: NodeId,
        unwrap: bool,
        classifier: Box<dyn ElementClassifier>,
        options: BuilderOptions,
    ) -> Self {
        Self {
            source: Some(source),
            state: BuilderState::Active,
            frames: vec![root],
            root,
            unwrap,
            root_started: !unwrap,
            lookahead: None,
            classifier,
            options,
            pulled: 0,
        }
    }

    fn read(&mut self) -> std::result::Result<Token, ParseError> {
        if let Some(token) = self.lookahead.take() {
            return Ok(token);
        }
        let source = self
            .source
            .as_mut()
            .ok_or_else(|| ParseError::new("the token source has been released", self.pulled))?;
        let token = source.next_token()?;
        self.pulled += 1;
        Ok(token)
    }

    fn error(&self, message: &str) -> ParseError {
        ParseError::new(message, self.pulled)
    }

    fn release_source(&mut self) {
        if let Some(mut source) = self.source.take() {
            source.close();
        }
    }

    fn finish(&mut self, state: BuilderState) {
        self.state = state;
        if self.options.auto_close || self.unwrap || state == BuilderState::Discarded {
            self.release_source();
        }
    }
}

impl NodeGraph {
    /// Creates a graph whose document is built lazily from `source`.
    ///
    /// Nothing is pulled until the first read.
    pub fn from_source(source: impl EventSource + 'static, view: View, options: BuilderOptions) -> Self {
        let mut graph = Self::empty(view);
        let doc = graph.alloc(NodeKind::Document(DocumentData::default()), BuildState::Fresh);
        graph.set_document(doc);
        let builder = Builder::new(Box::new(source), doc, false, classifier_for(view), options);
        let bid = graph.register_builder(builder);
        graph.node_mut(doc).builder = Some(bid);
        graph.document_builder = Some(bid);
        debug!("document builder {} created for {view:?} view", bid.0);
        graph
    }

    /// Creates a lazily built graph over XML text.
    ///
    /// Malformed input is reported by the read that reaches it.
    pub fn parse_str(xml: &str, view: View) -> Self {
        Self::parse_str_with(xml, view, BuilderOptions::default())
    }

    pub fn parse_str_with(xml: &str, view: View, options: BuilderOptions) -> Self {
        Self::from_source(XmlSource::from_text(xml), view, options)
    }

    /// Creates a lazily built graph over encoded XML bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError`] if the bytes cannot be decoded.
    pub fn parse_bytes(bytes: &[u8], view: View) -> Result<Self> {
        let source = XmlSource::from_bytes(bytes)?;
        Ok(Self::from_source(source, view, BuilderOptions::default()))
    }

    /// Creates a lazily built graph over a UTF-8 reader. Input is read in
    /// step with the builder, so unread parts of a large document are
    /// never loaded.
    pub fn parse_reader<R: BufRead + 'static>(reader: R, view: View) -> Self {
        Self::from_source(XmlSource::from_reader(reader), view, BuilderOptions::default())
    }

    pub(crate) fn register_builder(&mut self, builder: Builder) -> BuilderId {
        self.builders.push(Some(builder));
        BuilderId(self.builders.len() - 1)
    }

    fn builder_ref(&self, bid: BuilderId) -> Option<&Builder> {
        self.builders.get(bid.0).and_then(Option::as_ref)
    }

    /// Runs `f` with the builder taken out of its slot. An error other than
    /// a [`StateError`] closes the builder.
    fn with_builder<T>(
        &mut self,
        bid: BuilderId,
        f: impl FnOnce(&mut Self, &mut Builder) -> Result<T>,
    ) -> Result<T> {
        let mut builder = self
            .builders
            .get_mut(bid.0)
            .and_then(Option::take)
            .ok_or(StateError::BuilderBusy)?;
        let result = f(self, &mut builder);
        if let Err(err) = &result {
            if builder.state == BuilderState::Active && err.as_state().is_none() {
                debug!("builder {} closed after error: {err}", bid.0);
                builder.state = BuilderState::Closed;
                builder.release_source();
            }
        }
        self.builders[bid.0] = Some(builder);
        result
    }

    /// State of the document builder, if the graph has one.
    #[must_use]
    pub fn builder_state(&self) -> Option<BuilderState> {
        self.document_builder
            .and_then(|bid| self.builder_ref(bid))
            .map(|b| b.state)
    }

    /// Closes the document builder. Nodes still `Fresh` stay incomplete and
    /// report [`StateError::Unavailable`] when read. With
    /// `release_underlying`, the token source is closed and dropped too.
    ///
    /// # Errors
    ///
    /// [`StateError::NoBuilder`] if the graph was not built from a source.
    pub fn close(&mut self, release_underlying: bool) -> Result<()> {
        let bid = self.document_builder.ok_or(StateError::NoBuilder)?;
        let builder = self
            .builders
            .get_mut(bid.0)
            .and_then(Option::as_mut)
            .ok_or(StateError::BuilderBusy)?;
        if builder.state == BuilderState::Active {
            builder.state = BuilderState::Closed;
            debug!("builder {} closed after {} tokens", bid.0, builder.pulled);
        }
        if release_underlying {
            builder.release_source();
        }
        Ok(())
    }

    /// Drops a builder whose root is being freed.
    pub(crate) fn release_builder_rooted_at(&mut self, bid: BuilderId, node: NodeId) {
        let Some(slot) = self.builders.get_mut(bid.0) else {
            return;
        };
        if slot.as_ref().is_some_and(|b| b.root == node) {
            if let Some(mut builder) = slot.take() {
                builder.release_source();
            }
            if self.document_builder == Some(bid) {
                self.document_builder = None;
            }
            trace!("builder {} released with its root", bid.0);
        }
    }

    // --- Pulling ---

    /// Pulls and processes one token.
    pub(crate) fn step(&mut self, bid: BuilderId) -> Result<Step> {
        self.with_builder(bid, |graph, builder| match builder.state {
            BuilderState::Closed => Err(StateError::Unavailable.into()),
            BuilderState::Done | BuilderState::Discarded => Ok(Step::Finished),
            BuilderState::Active => {
                let token = builder.read()?;
                graph.process(bid, builder, token)
            }
        })
    }

    fn process(&mut self, bid: BuilderId, b: &mut Builder, token: Token) -> Result<Step> {
        trace!("builder {} pulled {}", bid.0, token.kind_name());
        let Some(&top) = b.frames.last() else {
            return Err(b.error("content after the end of the tree").into());
        };
        match token {
            Token::StartDocument(declaration) => {
                if let NodeKind::Document(doc) = &mut self.node_mut(b.root).kind {
                    doc.declaration = declaration;
                }
                Ok(Step::Skipped)
            }
            Token::EndDocument => self.end_document(bid, b),
            Token::StartElement(tag) => self.start_element(bid, b, top, tag),
            Token::EndElement => self.end_element(bid, b),
            // The prolog of a data source belongs to no element.
            _ if !b.root_started => Ok(Step::Skipped),
            Token::Characters(text) => {
                let droppable = b.options.skip_ignorable_whitespace || !self.node(top).model.keeps_whitespace();
                if droppable && is_xml_whitespace(&text) {
                    return Ok(Step::Skipped);
                }
                self.add_leaf(top, NodeKind::Text(TextContent::Literal(text)))
            }
            Token::Binary(payload) => self.add_leaf(top, NodeKind::Text(TextContent::Binary(payload))),
            Token::CData(text) => self.add_leaf(top, NodeKind::CData(text)),
            Token::Comment(text) => self.add_leaf(top, NodeKind::Comment(text)),
            Token::ProcessingInstruction { target, data } => {
                self.add_leaf(top, NodeKind::ProcessingInstruction { target, data })
            }
            Token::DocType(decl) => self.add_leaf(top, NodeKind::DocType(decl)),
            Token::EntityReference { name, replacement } => {
                self.add_leaf(top, NodeKind::EntityReference { name, replacement })
            }
        }
    }

    fn add_leaf(&mut self, top: NodeId, kind: NodeKind) -> Result<Step> {
        // Trailing content of a document that gave away its element.
        if self.state(top) == BuildState::Discarded {
            return Ok(Step::Skipped);
        }
        let id = self.alloc(kind, BuildState::Complete);
        self.link_built(top, id)?;
        Ok(Step::Created(id))
    }

    fn link_built(&mut self, top: NodeId, id: NodeId) -> Result<()> {
        if let Err(err) = self.check_child(top, id) {
            self.free_subtree(id);
            return Err(err);
        }
        self.link_last(top, id);
        Ok(())
    }

    fn start_element(&mut self, bid: BuilderId, b: &mut Builder, top: NodeId, tag: StartTag) -> Result<Step> {
        if !b.root_started {
            b.root_started = true;
            self.apply_start_tag(b.root, tag);
            return Ok(Step::Skipped);
        }
        let depth = b.frames.len() + usize::from(b.unwrap);
        let parent_role = self.element(top).map_or(ElementRole::Plain, |e| e.role);
        let role = b.classifier.classify(depth, parent_role, &tag.name)?;
        if let Some(custom) = b.options.custom_builder_for(depth, &tag.name) {
            return self.capture_custom(b, top, tag, role, custom.as_ref());
        }

        let id = self.alloc(NodeKind::Element(ElementData::new(QName::default())), BuildState::Fresh);
        self.apply_start_tag(id, tag);
        if role != ElementRole::Plain {
            self.set_role(id, role);
        }
        self.link_built(top, id)?;
        self.node_mut(id).builder = Some(bid);
        b.frames.push(id);
        Ok(Step::Created(id))
    }

    /// Gives an element the name, declarations and attributes of a start
    /// tag.
    fn apply_start_tag(&mut self, element: NodeId, tag: StartTag) {
        let StartTag {
            name,
            namespaces,
            attributes,
        } = tag;
        if let NodeKind::Element(e) = &mut self.node_mut(element).kind {
            e.name = name;
        }
        for binding in namespaces {
            let decl = self.alloc(NodeKind::NamespaceDeclaration(binding), BuildState::Complete);
            self.attach_namespace(element, decl);
        }
        for attr in attributes {
            let id = self.alloc(
                NodeKind::Attribute(AttributeData {
                    name: attr.name,
                    value: attr.value,
                    namespace_aware: true,
                }),
                BuildState::Complete,
            );
            self.attach_attribute(element, id);
        }
    }

    /// Reads a whole element into a token run and hands it to a custom
    /// builder. The result is an unexpanded sourced element.
    fn capture_custom(
        &mut self,
        b: &mut Builder,
        top: NodeId,
        mut tag: StartTag,
        role: ElementRole,
        custom: &dyn CustomBuilder,
    ) -> Result<Step> {
        for binding in self.namespaces_in_scope(top) {
            if !tag.namespaces.iter().any(|n| n.prefix == binding.prefix) {
                tag.namespaces.push(binding);
            }
        }
        let name = tag.name.clone();
        let mut tokens = vec![Token::StartElement(tag)];
        let mut open = 1usize;
        while open > 0 {
            let token = b.read()?;
            match &token {
                Token::StartElement(_) => open += 1,
                Token::EndElement => open -= 1,
                Token::EndDocument => return Err(b.error("end of document inside a captured element").into()),
                _ => {}
            }
            tokens.push(token);
        }
        debug!("custom builder captured {name} ({} tokens)", tokens.len());

        let source = custom.create(&name, tokens)?;
        let id = self.alloc(
            NodeKind::Element(ElementData {
                sourced: Some(SourcedPayload::new(source)),
                ..ElementData::new(name)
            }),
            BuildState::Fresh,
        );
        if role != ElementRole::Plain {
            self.set_role(id, role);
        }
        self.link_built(top, id)?;
        Ok(Step::Created(id))
    }

    fn end_element(&mut self, bid: BuilderId, b: &mut Builder) -> Result<Step> {
        // The document frame is closed by EndDocument, never by an end tag.
        let floor = if b.unwrap { 1 } else { 2 };
        if b.frames.len() < floor {
            return Err(b.error("end tag without a matching start tag").into());
        }
        let Some(node) = b.frames.pop() else {
            return Err(b.error("end tag without a matching start tag").into());
        };
        self.finish_node(node);
        if b.frames.is_empty() {
            b.finish(BuilderState::Done);
            debug!("builder {} done after {} tokens", bid.0, b.pulled);
        }
        Ok(Step::Ended(node))
    }

    fn end_document(&mut self, bid: BuilderId, b: &mut Builder) -> Result<Step> {
        if b.unwrap {
            let message = if b.root_started {
                "end of document inside an element"
            } else {
                "the data source produced no element"
            };
            return Err(b.error(message).into());
        }
        if b.frames.len() != 1 {
            return Err(b.error("end of document inside an element").into());
        }
        let root = b.root;
        b.frames.clear();
        self.finish_node(root);
        b.finish(BuilderState::Done);
        debug!("builder {} done after {} tokens", bid.0, b.pulled);
        Ok(Step::Ended(root))
    }

    fn finish_node(&mut self, node: NodeId) {
        if let Some(data) = self.get_mut(node) {
            if data.state == BuildState::Fresh {
                data.state = BuildState::Complete;
            }
            data.builder = None;
        }
    }

    // --- Lazy reads ---

    /// Pulls until `node` is complete. Unexpanded sourced elements are
    /// expanded first.
    ///
    /// # Errors
    ///
    /// - [`StateError::NodeConsumed`] if the node was discarded.
    /// - [`StateError::Unavailable`] if its builder was closed.
    /// - [`ParseError`] and view errors raised while pulling.
    pub fn ensure_complete(&mut self, node: NodeId) -> Result<()> {
        self.check_live(node)?;
        self.expand(node)?;
        while self.state(node) == BuildState::Fresh {
            let bid = self.node(node).builder.ok_or(StateError::Unavailable)?;
            if self.step(bid)? == Step::Finished && self.state(node) == BuildState::Fresh {
                return Err(StateError::Unavailable.into());
            }
        }
        Ok(())
    }

    /// Builds the whole document.
    ///
    /// # Errors
    ///
    /// Same as [`ensure_complete`](Self::ensure_complete).
    pub fn build(&mut self) -> Result<()> {
        let doc = self.document();
        self.ensure_complete(doc)
    }

    /// Returns the first child, pulling until it exists or the container is
    /// complete.
    ///
    /// # Errors
    ///
    /// Same as [`ensure_complete`](Self::ensure_complete).
    pub fn first_child(&mut self, node: NodeId) -> Result<Option<NodeId>> {
        self.check_live(node)?;
        self.expand(node)?;
        loop {
            let data = self.node(node);
            if data.first_child.is_some() || data.state != BuildState::Fresh {
                return Ok(data.first_child);
            }
            let bid = data.builder.ok_or(StateError::Unavailable)?;
            if self.step(bid)? == Step::Finished {
                return Ok(self.node(node).first_child);
            }
        }
    }

    /// Returns the next sibling, pulling until it exists or the parent is
    /// complete. Attributes and namespace declarations have no siblings.
    ///
    /// # Errors
    ///
    /// Same as [`ensure_complete`](Self::ensure_complete).
    pub fn next_sibling(&mut self, node: NodeId) -> Result<Option<NodeId>> {
        self.check_live(node)?;
        if matches!(
            self.kind(node),
            NodeKind::Attribute(_) | NodeKind::NamespaceDeclaration(_)
        ) {
            return Ok(None);
        }
        loop {
            let data = self.node(node);
            if data.next_sibling.is_some() {
                return Ok(data.next_sibling);
            }
            let Some(parent) = data.parent else {
                return Ok(None);
            };
            let parent = self.node(parent);
            if parent.state != BuildState::Fresh {
                return Ok(None);
            }
            let Some(bid) = parent.builder else {
                return Ok(None);
            };
            if self.step(bid)? == Step::Finished {
                return Ok(self.node(node).next_sibling);
            }
        }
    }

    /// Returns the last child. Completes the container.
    ///
    /// # Errors
    ///
    /// Same as [`ensure_complete`](Self::ensure_complete).
    pub fn last_child(&mut self, node: NodeId) -> Result<Option<NodeId>> {
        self.ensure_complete(node)?;
        Ok(self.last_child_if_available(node))
    }

    /// Returns all children. Completes the container.
    ///
    /// # Errors
    ///
    /// Same as [`ensure_complete`](Self::ensure_complete).
    pub fn children(&mut self, node: NodeId) -> Result<Vec<NodeId>> {
        self.ensure_complete(node)?;
        Ok(self.children_if_available(node).collect())
    }

    /// Pulls until the container gains a new child and returns it, or
    /// returns `None` once the container is complete.
    ///
    /// # Errors
    ///
    /// Same as [`ensure_complete`](Self::ensure_complete).
    pub fn next_child_or_null(&mut self, container: NodeId) -> Result<Option<NodeId>> {
        self.check_live(container)?;
        self.expand(container)?;
        while self.state(container) == BuildState::Fresh {
            let bid = self.node(container).builder.ok_or(StateError::Unavailable)?;
            match self.step(bid)? {
                Step::Created(id) if self.parent(id) == Some(container) => return Ok(Some(id)),
                Step::Finished => break,
                _ => {}
            }
        }
        Ok(None)
    }

    /// Returns the first child element.
    ///
    /// # Errors
    ///
    /// Same as [`ensure_complete`](Self::ensure_complete).
    pub fn first_child_element(&mut self, node: NodeId) -> Result<Option<NodeId>> {
        let first = self.first_child(node)?;
        self.element_from(first)
    }

    /// Returns the next sibling that is an element.
    ///
    /// # Errors
    ///
    /// Same as [`ensure_complete`](Self::ensure_complete).
    pub fn next_sibling_element(&mut self, node: NodeId) -> Result<Option<NodeId>> {
        let next = self.next_sibling(node)?;
        self.element_from(next)
    }

    fn element_from(&mut self, mut cursor: Option<NodeId>) -> Result<Option<NodeId>> {
        while let Some(c) = cursor {
            if self.is_element(c) {
                return Ok(Some(c));
            }
            cursor = self.next_sibling(c)?;
        }
        Ok(None)
    }

    /// Returns the first child element with the given expanded name,
    /// building no further than needed.
    ///
    /// # Errors
    ///
    /// Same as [`ensure_complete`](Self::ensure_complete).
    pub fn first_child_with_name(
        &mut self,
        node: NodeId,
        namespace: Option<&str>,
        local: &str,
    ) -> Result<Option<NodeId>> {
        let mut child = self.first_child_element(node)?;
        while let Some(c) = child {
            if self.name(c).is_some_and(|n| n.matches(namespace, local)) {
                return Ok(Some(c));
            }
            child = self.next_sibling_element(c)?;
        }
        Ok(None)
    }

    /// Returns the character content of a node: the payload of a text-like
    /// node, or the concatenated text and CDATA children of a container.
    /// Binary content is rendered as base64.
    ///
    /// # Errors
    ///
    /// Build errors, and [`IoError`](crate::error::IoError) if a blob cannot
    /// be read.
    pub fn text_content(&mut self, node: NodeId) -> Result<String> {
        self.check_live(node)?;
        match self.kind(node) {
            NodeKind::Text(TextContent::Literal(t)) | NodeKind::CData(t) | NodeKind::Comment(t) => {
                return Ok(t.clone());
            }
            NodeKind::Text(TextContent::Binary(p)) => return Ok(p.to_base64()?),
            NodeKind::Attribute(a) => return Ok(a.value.clone()),
            _ => {}
        }
        let mut out = String::new();
        let mut child = self.first_child(node)?;
        while let Some(c) = child {
            match self.kind(c) {
                NodeKind::Text(TextContent::Literal(t)) | NodeKind::CData(t) => out.push_str(t),
                NodeKind::Text(TextContent::Binary(p)) => out.push_str(&p.to_base64()?),
                _ => {}
            }
            child = self.next_sibling(c)?;
        }
        Ok(out)
    }

    /// Returns the document element, building only up to its start tag.
    ///
    /// With `discard_document`, the element is detached and the document
    /// node is discarded together with its other children. The builder
    /// keeps feeding the element; trailing content of the document is
    /// skipped.
    ///
    /// # Errors
    ///
    /// Same as [`ensure_complete`](Self::ensure_complete).
    pub fn document_element(&mut self, discard_document: bool) -> Result<Option<NodeId>> {
        let doc = self.document();
        let Some(element) = self.first_child_element(doc)? else {
            return Ok(None);
        };
        if discard_document {
            self.detach(element);
            self.free_children(doc);
            self.node_mut(doc).state = BuildState::Discarded;
            debug!("document discarded, keeping its element");
        }
        Ok(Some(element))
    }

    /// Removes all children. A container still being built has the rest of
    /// its input skipped and becomes complete without building it.
    ///
    /// # Errors
    ///
    /// [`StateError::NodeConsumed`] if the node was discarded, and errors
    /// raised while skipping.
    pub fn remove_children(&mut self, node: NodeId) -> Result<()> {
        self.check_live(node)?;
        self.expand(node)?;
        if self.state(node) == BuildState::Fresh {
            let bid = self.node(node).builder.ok_or(StateError::Unavailable)?;
            self.with_builder(bid, |graph, b| graph.skip_open(b, node, BuilderState::Done))?;
            self.finish_node(node);
        }
        self.free_children(node);
        Ok(())
    }

    // --- Lookahead ---

    /// Reads ahead to the start tag of the container's next child element
    /// and returns its name without creating the element. Character data,
    /// comments and other tokens met on the way are built normally. Returns
    /// `None` when the container ends first.
    ///
    /// The token stays pending: the next pull on this builder processes it.
    ///
    /// # Errors
    ///
    /// - [`StateError::NotFresh`] if the container is not being built.
    /// - [`StateError::LookaheadPending`] if a previous peek has not been
    ///   consumed yet.
    pub fn peek_name(&mut self, container: NodeId) -> Result<Option<QName>> {
        self.check_live(container)?;
        self.expand(container)?;
        if self.state(container) != BuildState::Fresh {
            return Err(StateError::NotFresh.into());
        }
        let bid = self.node(container).builder.ok_or(StateError::NotFresh)?;
        if self.builder_ref(bid).is_some_and(|b| b.lookahead.is_some()) {
            return Err(StateError::LookaheadPending.into());
        }
        while self.builder_ref(bid).and_then(|b| b.frames.last().copied()) != Some(container) {
            if self.step(bid)? == Step::Finished || self.state(container) != BuildState::Fresh {
                return Ok(None);
            }
        }
        self.with_builder(bid, |graph, b| loop {
            let token = b.read()?;
            match token {
                Token::StartElement(tag) => {
                    let name = tag.name.clone();
                    trace!("builder {} peeked {name}", bid.0);
                    b.lookahead = Some(Token::StartElement(tag));
                    return Ok(Some(name));
                }
                Token::EndElement | Token::EndDocument => {
                    b.lookahead = Some(token);
                    return Ok(None);
                }
                other => {
                    graph.process(bid, b, other)?;
                }
            }
        })
    }

    /// Returns `true` if `container` is the builder's current position and
    /// a peeked token is waiting.
    #[must_use]
    pub fn has_pending_lookahead(&self, container: NodeId) -> bool {
        self.lookahead_builder(container).is_some()
    }

    /// The name recorded by an unconsumed [`peek_name`](Self::peek_name) on
    /// `container`, if it found a start tag.
    #[must_use]
    pub fn pending_lookahead_name(&self, container: NodeId) -> Option<&QName> {
        match &self.lookahead_builder(container)?.lookahead {
            Some(Token::StartElement(tag)) => Some(&tag.name),
            _ => None,
        }
    }

    fn lookahead_builder(&self, container: NodeId) -> Option<&Builder> {
        let bid = self.get(container)?.builder?;
        let builder = self.builder_ref(bid)?;
        (builder.frames.last() == Some(&container) && builder.lookahead.is_some()).then_some(builder)
    }

    // --- Discard ---

    /// Drops a node that is still being built: the rest of its input is
    /// consumed without creating nodes, and the node ends detached and
    /// `Discarded`. An unexpanded sourced element drops its data source
    /// without reading it.
    ///
    /// # Errors
    ///
    /// - [`StateError::NotFresh`] if the node is complete.
    /// - [`StateError::BuilderClosed`] if its builder was closed.
    /// - [`StateError::NodeConsumed`] if it was already discarded.
    pub fn discard(&mut self, node: NodeId) -> Result<()> {
        self.check_live(node)?;
        if self.expansion_state(node) == Some(ExpansionState::NotExpanded) {
            if let NodeKind::Element(e) = &mut self.node_mut(node).kind {
                e.sourced = None;
            }
        } else {
            if self.state(node) != BuildState::Fresh {
                return Err(StateError::NotFresh.into());
            }
            let bid = self.node(node).builder.ok_or(StateError::NotFresh)?;
            self.with_builder(bid, |graph, b| graph.skip_open(b, node, BuilderState::Discarded))?;
        }
        self.free_children(node);
        self.detach(node);
        let data = self.node_mut(node);
        data.state = BuildState::Discarded;
        data.builder = None;
        debug!("discarded {}", self.kind(node).describe());
        Ok(())
    }

    /// Consumes the input of an open container through its end token.
    /// Containers opened inside it are marked discarded and popped. If the
    /// container is the builder's root, the builder moves to `end_state`.
    fn skip_open(&mut self, b: &mut Builder, node: NodeId, end_state: BuilderState) -> Result<()> {
        match b.state {
            BuilderState::Active => {}
            BuilderState::Closed => return Err(StateError::BuilderClosed.into()),
            BuilderState::Done | BuilderState::Discarded => return Err(StateError::Unavailable.into()),
        }
        let idx = b
            .frames
            .iter()
            .position(|&f| f == node)
            .ok_or(StateError::NotFresh)?;
        let whole_document = idx == 0 && !b.unwrap;
        let mut open = b.frames.len() - idx;
        let mut skipped = 0usize;
        loop {
            let token = b.read()?;
            skipped += 1;
            match token {
                Token::StartElement(_) => open += 1,
                Token::EndElement => {
                    open = open.saturating_sub(1);
                    if open == 0 && !whole_document {
                        break;
                    }
                }
                Token::EndDocument if whole_document => break,
                Token::EndDocument => return Err(b.error("end of document inside an element").into()),
                _ => {}
            }
        }
        for &inner in &b.frames[idx + 1..] {
            if let Some(data) = self.get_mut(inner) {
                data.state = BuildState::Discarded;
                data.builder = None;
            }
        }
        b.frames.truncate(idx);
        if b.frames.is_empty() {
            b.finish(end_state);
        }
        trace!("skipped {skipped} tokens");
        Ok(())
    }

    // --- Streaming ---

    /// Writes the unread remainder of `container` straight from its builder
    /// to `out`, creating no nodes, and completes the container.
    ///
    /// Streamed content obeys the same rules as built content: elements are
    /// classified, whitespace is dropped where a container would not keep
    /// it, and character data is refused where a container would refuse it.
    /// Open nodes nested under `container` that are no longer attached to it
    /// are built to completion first.
    pub(crate) fn pass_through(&mut self, container: NodeId, out: &mut dyn Sink) -> Result<()> {
        let bid = self.node(container).builder.ok_or(StateError::Unavailable)?;
        while self.builder_ref(bid).and_then(|b| b.frames.last().copied()) != Some(container) {
            if self.step(bid)? == Step::Finished {
                return Err(StateError::Unavailable.into());
            }
        }
        debug!("streaming the rest of {} from builder {}", self.kind(container).describe(), bid.0);
        let view = self.view();
        self.with_builder(bid, |graph, b| {
            if b.state != BuilderState::Active {
                return Err(StateError::Unavailable.into());
            }
            if b.frames.last() != Some(&container) {
                return Err(StateError::Unavailable.into());
            }
            let document = !b.unwrap && b.frames.len() == 1;
            let base_depth = b.frames.len() + usize::from(b.unwrap);
            let outer_role = graph.element(container).map_or(ElementRole::Plain, |e| e.role);
            let outer_model = graph.node(container).model;
            // Roles and models of the elements opened while streaming.
            let mut open: Vec<(ElementRole, &'static dyn ContentModel)> = Vec::new();
            loop {
                let token = b.read()?;
                trace!("builder {} streamed {}", bid.0, token.kind_name());
                let (role, model) = open.last().copied().unwrap_or((outer_role, outer_model));
                match &token {
                    Token::StartElement(tag) => {
                        let child = b.classifier.classify(base_depth + open.len(), role, &tag.name)?;
                        open.push((child, element_model(view, child)));
                    }
                    Token::EndElement if open.is_empty() && document => {
                        return Err(b.error("end tag without a matching start tag").into());
                    }
                    Token::EndElement if open.is_empty() => break,
                    Token::EndElement => {
                        open.pop();
                    }
                    Token::EndDocument if document && open.is_empty() => break,
                    Token::EndDocument => return Err(b.error("end of document inside an element").into()),
                    Token::StartDocument(_) => continue,
                    Token::Characters(text) if is_xml_whitespace(text) => {
                        if b.options.skip_ignorable_whitespace || !model.keeps_whitespace() {
                            continue;
                        }
                    }
                    Token::Characters(_) | Token::CData(_) | Token::Binary(_) | Token::EntityReference { .. }
                        if !model.accepts_character_data() =>
                    {
                        let parent = match open.len() {
                            0 => graph.kind(container).describe(),
                            _ => model.name().to_string(),
                        };
                        return Err(HierarchyError::ChildNotAllowed {
                            parent,
                            child: token.kind_name().to_string(),
                        }
                        .into());
                    }
                    _ => {}
                }
                write_token(out, &token)?;
            }
            b.frames.pop();
            graph.finish_node(container);
            if b.frames.is_empty() {
                b.finish(BuilderState::Done);
            }
            Ok(())
        })
    }

    /// Pulls the first token of a document that has not been read yet, so
    /// that its XML declaration is known.
    ///
    /// # Errors
    ///
    /// Errors raised while pulling.
    pub(crate) fn ensure_declaration(&mut self, doc: NodeId) -> Result<()> {
        if self.state(doc) != BuildState::Fresh {
            return Ok(());
        }
        let Some(bid) = self.node(doc).builder else {
            return Ok(());
        };
        let unread = self
            .builder_ref(bid)
            .is_some_and(|b| b.pulled == 0 && b.lookahead.is_none() && b.state == BuilderState::Active);
        if unread {
            self.step(bid)?;
        }
        Ok(())
    }
}

/// Creates the private builder of a sourced element.
pub(crate) fn sourced_builder(source: Box<dyn EventSource>, root: NodeId) -> Builder {
    Builder::new(source, root, true, Box::new(crate::view::PlainClassifier), BuilderOptions::default())
}

/// Returns `true` once a sourced element's private builder has applied the
/// root start tag.
pub(crate) fn root_started(graph: &NodeGraph, bid: BuilderId) -> bool {
    graph.builder_ref(bid).is_none_or(|b| b.root_started)
}
