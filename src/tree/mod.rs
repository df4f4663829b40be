//! Arena-based node graph.
//!
//! All nodes live in a slot vector owned by the [`NodeGraph`] and are
//! referenced by [`NodeId`], a generation-checked index. Parent, child and
//! sibling links are ids, so appends and detaches are O(1) and the graph has
//! no reference cycles. Freed slots are recycled; the generation counter
//! makes a stale id from a freed node detectable instead of silently
//! aliasing the slot's new occupant.
//!
//! Navigation methods in this module are pure: they only report what has
//! already been built (`*_if_available`). The lazy, builder-driven
//! counterparts (`first_child`, `next_sibling`, ...) live in
//! [`crate::builder`].

mod clone;
mod namespace;
mod node;

pub use clone::CloneOptions;
pub use namespace::{XMLNS_NAMESPACE, XML_NAMESPACE};
pub use node::{AttributeData, BuildState, DocumentData, ElementData, NodeKind, TextContent};

use std::fmt;
use std::num::NonZeroU32;

use log::trace;

use crate::blob::BinaryPayload;
use crate::builder::{Builder, BuilderId};
use crate::error::{HierarchyError, Result, StateError};
use crate::token::{DocTypeDecl, NamespaceBinding, QName};
use crate::view::{content_model, ContentModel, ElementRole, View};

/// A generation-checked handle to a node in a [`NodeGraph`].
///
/// `Option<NodeId>` has the same size as `NodeId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    index: NonZeroU32,
    generation: u32,
}

impl NodeId {
    fn as_index(self) -> usize {
        self.index.get() as usize
    }
}

/// Storage for a single node.
#[derive(Debug)]
pub struct NodeData {
    /// What kind of node this is and its payload.
    pub kind: NodeKind,
    /// Build progress.
    pub state: BuildState,
    /// Owning container; for attributes and namespace declarations, the
    /// owning element.
    pub(crate) parent: Option<NodeId>,
    pub(crate) first_child: Option<NodeId>,
    pub(crate) last_child: Option<NodeId>,
    pub(crate) next_sibling: Option<NodeId>,
    pub(crate) prev_sibling: Option<NodeId>,
    /// The builder still feeding this node, while it is `Fresh`.
    pub(crate) builder: Option<BuilderId>,
    /// Per-view behavior, chosen once at creation.
    pub(crate) model: &'static dyn ContentModel,
}

impl NodeData {
    fn new(kind: NodeKind, state: BuildState, model: &'static dyn ContentModel) -> Self {
        Self {
            kind,
            state,
            parent: None,
            first_child: None,
            last_child: None,
            next_sibling: None,
            prev_sibling: None,
            builder: None,
            model,
        }
    }

    /// Returns the element payload, if this is an element.
    #[must_use]
    pub fn as_element(&self) -> Option<&ElementData> {
        match &self.kind {
            NodeKind::Element(e) => Some(e),
            _ => None,
        }
    }

    /// Returns the content model attached to this node.
    #[must_use]
    pub fn model(&self) -> &'static dyn ContentModel {
        self.model
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    data: Option<NodeData>,
}

/// A lazily built XML tree.
///
/// The graph owns its nodes and the builders that fill them. Nodes created
/// programmatically are `Complete` immediately; nodes created by a builder
/// stay `Fresh` until their end token has been consumed.
///
/// # Examples
///
/// ```
/// use lazyxml::{NodeGraph, QName, View};
///
/// let mut graph = NodeGraph::new(View::Om);
/// let root = graph.create_element(QName::local("root"));
/// let doc = graph.document();
/// graph.append_child(doc, root).unwrap();
/// assert_eq!(graph.parent(root), Some(doc));
/// ```
pub struct NodeGraph {
    slots: Vec<Slot>,
    free: Vec<usize>,
    view: View,
    document: NodeId,
    pub(crate) builders: Vec<Option<Builder>>,
    pub(crate) document_builder: Option<BuilderId>,
    live: usize,
    peak: usize,
}

impl fmt::Debug for NodeGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeGraph")
            .field("view", &self.view)
            .field("document", &self.document)
            .field("live", &self.live)
            .field("builders", &self.builders.len())
            .finish_non_exhaustive()
    }
}

impl NodeGraph {
    /// Creates a graph holding an empty, complete document.
    #[must_use]
    pub fn new(view: View) -> Self {
        let mut graph = Self::empty(view);
        graph.document = graph.alloc(
            NodeKind::Document(DocumentData::default()),
            BuildState::Complete,
        );
        graph
    }

    /// A graph without any node; the caller allocates the document.
    pub(crate) fn empty(view: View) -> Self {
        // Placeholder so slot 0 is never handed out.
        let placeholder = Slot {
            generation: 0,
            data: None,
        };
        Self {
            slots: vec![placeholder],
            free: Vec::new(),
            view,
            document: NodeId {
                index: NonZeroU32::MIN,
                generation: u32::MAX,
            },
            builders: Vec::new(),
            document_builder: None,
            live: 0,
            peak: 0,
        }
    }

    pub(crate) fn set_document(&mut self, id: NodeId) {
        self.document = id;
    }

    /// The view this graph was created under.
    #[must_use]
    pub fn view(&self) -> View {
        self.view
    }

    /// The document node.
    #[must_use]
    pub fn document(&self) -> NodeId {
        self.document
    }

    /// Returns the node's data, or `None` if the id is stale.
    #[must_use]
    pub fn get(&self, id: NodeId) -> Option<&NodeData> {
        let slot = self.slots.get(id.as_index())?;
        if slot.generation != id.generation {
            return None;
        }
        slot.data.as_ref()
    }

    pub(crate) fn get_mut(&mut self, id: NodeId) -> Option<&mut NodeData> {
        let slot = self.slots.get_mut(id.as_index())?;
        if slot.generation != id.generation {
            return None;
        }
        slot.data.as_mut()
    }

    /// Returns `true` if `id` refers to a node that has not been freed.
    #[must_use]
    pub fn contains(&self, id: NodeId) -> bool {
        self.get(id).is_some()
    }

    /// Returns the node's data.
    ///
    /// # Panics
    ///
    /// Panics if `id` is stale or belongs to another graph.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn node(&self, id: NodeId) -> &NodeData {
        self.get(id).expect("stale or foreign NodeId")
    }

    #[allow(clippy::expect_used)]
    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut NodeData {
        let slot = &mut self.slots[id.as_index()];
        assert_eq!(slot.generation, id.generation, "stale NodeId");
        slot.data.as_mut().expect("stale NodeId")
    }

    /// Returns the node's kind and payload.
    #[must_use]
    pub fn kind(&self, id: NodeId) -> &NodeKind {
        &self.node(id).kind
    }

    /// Returns the node's build state.
    #[must_use]
    pub fn state(&self, id: NodeId) -> BuildState {
        self.node(id).state
    }

    /// Returns `true` if the node is an element.
    #[must_use]
    pub fn is_element(&self, id: NodeId) -> bool {
        matches!(self.node(id).kind, NodeKind::Element(_))
    }

    /// Returns the element payload, if `id` is an element.
    #[must_use]
    pub fn element(&self, id: NodeId) -> Option<&ElementData> {
        self.node(id).as_element()
    }

    /// Returns the name of an element or attribute. Never expands a sourced
    /// element.
    #[must_use]
    pub fn name(&self, id: NodeId) -> Option<&QName> {
        match &self.node(id).kind {
            NodeKind::Element(e) => Some(&e.name),
            NodeKind::Attribute(a) => Some(&a.name),
            _ => None,
        }
    }

    /// Returns the string payload of text, CDATA and comment nodes, and the
    /// value of attributes.
    #[must_use]
    pub fn value(&self, id: NodeId) -> Option<&str> {
        match &self.node(id).kind {
            NodeKind::Text(TextContent::Literal(s)) | NodeKind::CData(s) | NodeKind::Comment(s) => {
                Some(s)
            }
            NodeKind::Attribute(a) => Some(&a.value),
            NodeKind::ProcessingInstruction { data, .. } => Some(data),
            _ => None,
        }
    }

    /// Returns the binary payload of a binary text node.
    #[must_use]
    pub fn binary(&self, id: NodeId) -> Option<&BinaryPayload> {
        match &self.node(id).kind {
            NodeKind::Text(TextContent::Binary(p)) => Some(p),
            _ => None,
        }
    }

    /// Fails with [`StateError::NodeConsumed`] if the node was discarded.
    pub(crate) fn check_live(&self, id: NodeId) -> Result<()> {
        match self.get(id) {
            Some(data) if data.state != BuildState::Discarded => Ok(()),
            _ => Err(StateError::NodeConsumed.into()),
        }
    }

    // --- Pure navigation ---

    /// Returns the owning container (or owning element, for attributes).
    #[must_use]
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).parent
    }

    /// Returns the first child built so far, without pulling.
    #[must_use]
    pub fn first_child_if_available(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).first_child
    }

    /// Returns the last child built so far, without pulling.
    #[must_use]
    pub fn last_child_if_available(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).last_child
    }

    /// Returns the next sibling built so far, without pulling.
    #[must_use]
    pub fn next_sibling_if_available(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).next_sibling
    }

    /// Returns the previous sibling. Earlier siblings are always built.
    #[must_use]
    pub fn previous_sibling(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).prev_sibling
    }

    /// Iterates over the children built so far.
    pub fn children_if_available(&self, id: NodeId) -> Children<'_> {
        Children {
            graph: self,
            next: self.node(id).first_child,
        }
    }

    /// Iterates over a node and its ancestors.
    pub fn ancestors(&self, id: NodeId) -> Ancestors<'_> {
        Ancestors {
            graph: self,
            next: Some(id),
        }
    }

    /// Depth-first iteration over the descendants built so far.
    pub fn descendants_if_available(&self, id: NodeId) -> Descendants<'_> {
        Descendants {
            graph: self,
            root: id,
            next: self.node(id).first_child,
        }
    }

    // --- Allocation ---

    pub(crate) fn alloc(&mut self, kind: NodeKind, state: BuildState) -> NodeId {
        let model = content_model(self.view, &kind);
        let data = NodeData::new(kind, state, model);
        self.live += 1;
        self.peak = self.peak.max(self.live);
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index];
            slot.data = Some(data);
            return NodeId {
                index: index_to_nonzero(index),
                generation: slot.generation,
            };
        }
        let index = self.slots.len();
        self.slots.push(Slot {
            generation: 0,
            data: Some(data),
        });
        NodeId {
            index: index_to_nonzero(index),
            generation: 0,
        }
    }

    fn release(&mut self, id: NodeId) {
        let index = id.as_index();
        let slot = &mut self.slots[index];
        if slot.generation != id.generation || slot.data.is_none() {
            return;
        }
        slot.data = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);
        self.live -= 1;
    }

    /// Changes an element's role and re-selects its content model.
    pub(crate) fn set_role(&mut self, id: NodeId, role: ElementRole) {
        let view = self.view;
        let node = self.node_mut(id);
        if let NodeKind::Element(e) = &mut node.kind {
            e.role = role;
        }
        node.model = content_model(view, &node.kind);
    }

    /// Creates a detached, complete element.
    pub fn create_element(&mut self, name: QName) -> NodeId {
        self.alloc(NodeKind::Element(ElementData::new(name)), BuildState::Complete)
    }

    /// Creates a detached text node.
    pub fn create_text(&mut self, text: impl Into<String>) -> NodeId {
        self.alloc(
            NodeKind::Text(TextContent::Literal(text.into())),
            BuildState::Complete,
        )
    }

    /// Creates a detached text node whose content is a binary payload.
    pub fn create_binary_text(&mut self, payload: BinaryPayload) -> NodeId {
        self.alloc(
            NodeKind::Text(TextContent::Binary(payload)),
            BuildState::Complete,
        )
    }

    pub fn create_cdata(&mut self, text: impl Into<String>) -> NodeId {
        self.alloc(NodeKind::CData(text.into()), BuildState::Complete)
    }

    pub fn create_comment(&mut self, text: impl Into<String>) -> NodeId {
        self.alloc(NodeKind::Comment(text.into()), BuildState::Complete)
    }

    pub fn create_processing_instruction(
        &mut self,
        target: impl Into<String>,
        data: impl Into<String>,
    ) -> NodeId {
        self.alloc(
            NodeKind::ProcessingInstruction {
                target: target.into(),
                data: data.into(),
            },
            BuildState::Complete,
        )
    }

    pub fn create_doctype(&mut self, decl: DocTypeDecl) -> NodeId {
        self.alloc(NodeKind::DocType(decl), BuildState::Complete)
    }

    pub fn create_entity_reference(&mut self, name: impl Into<String>) -> NodeId {
        self.alloc(
            NodeKind::EntityReference {
                name: name.into(),
                replacement: None,
            },
            BuildState::Complete,
        )
    }

    /// Creates a detached, namespace-aware attribute.
    pub fn create_attribute(&mut self, name: QName, value: impl Into<String>) -> NodeId {
        self.alloc(
            NodeKind::Attribute(AttributeData {
                name,
                value: value.into(),
                namespace_aware: true,
            }),
            BuildState::Complete,
        )
    }

    /// Creates a detached attribute without namespace processing; `name` is
    /// kept verbatim, colons included.
    pub fn create_plain_attribute(&mut self, name: &str, value: impl Into<String>) -> NodeId {
        self.alloc(
            NodeKind::Attribute(AttributeData {
                name: QName::local(name),
                value: value.into(),
                namespace_aware: false,
            }),
            BuildState::Complete,
        )
    }

    // --- Structural mutation ---

    /// Links `child` as the last child of `parent` without any checks.
    pub(crate) fn link_last(&mut self, parent: NodeId, child: NodeId) {
        self.node_mut(child).parent = Some(parent);
        if let Some(last) = self.node(parent).last_child {
            self.node_mut(last).next_sibling = Some(child);
            self.node_mut(child).prev_sibling = Some(last);
        } else {
            self.node_mut(parent).first_child = Some(child);
        }
        self.node_mut(parent).last_child = Some(child);
    }

    fn link_after(&mut self, anchor: NodeId, node: NodeId) {
        let parent = self.node(anchor).parent;
        let next = self.node(anchor).next_sibling;
        self.node_mut(node).parent = parent;
        self.node_mut(node).prev_sibling = Some(anchor);
        self.node_mut(node).next_sibling = next;
        self.node_mut(anchor).next_sibling = Some(node);
        match next {
            Some(n) => self.node_mut(n).prev_sibling = Some(node),
            None => {
                if let Some(p) = parent {
                    self.node_mut(p).last_child = Some(node);
                }
            }
        }
    }

    fn link_before(&mut self, anchor: NodeId, node: NodeId) {
        let parent = self.node(anchor).parent;
        let prev = self.node(anchor).prev_sibling;
        self.node_mut(node).parent = parent;
        self.node_mut(node).next_sibling = Some(anchor);
        self.node_mut(node).prev_sibling = prev;
        self.node_mut(anchor).prev_sibling = Some(node);
        match prev {
            Some(p) => self.node_mut(p).next_sibling = Some(node),
            None => {
                if let Some(p) = parent {
                    self.node_mut(p).first_child = Some(node);
                }
            }
        }
    }

    fn check_no_cycle(&self, container: NodeId, child: NodeId) -> Result<()> {
        if self.ancestors(container).any(|a| a == child) {
            return Err(HierarchyError::Cycle.into());
        }
        Ok(())
    }

    pub(crate) fn check_child(&self, container: NodeId, child: NodeId) -> Result<()> {
        let model = self.node(container).model;
        model.check_child(self, container, child)?;
        Ok(())
    }

    /// Appends `child` as the last child of `parent`, detaching it from its
    /// current position first.
    ///
    /// A still-building `parent` is completed before the append so that the
    /// new child lands after all of the parent's source content.
    ///
    /// # Errors
    ///
    /// - [`HierarchyError::Cycle`] if `parent` is `child` or a descendant of it.
    /// - [`HierarchyError::ChildNotAllowed`] if the parent's content model
    ///   rejects the child.
    /// - [`StateError::NodeConsumed`] if either node was discarded.
    pub fn append_child(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        self.check_live(parent)?;
        self.check_live(child)?;
        self.check_no_cycle(parent, child)?;
        if self.node(parent).kind.is_container() {
            self.ensure_complete(parent)?;
        }
        self.check_child(parent, child)?;
        self.detach(child);
        self.link_last(parent, child);
        Ok(())
    }

    /// Inserts `node` directly after `anchor`.
    ///
    /// The anchor's next sibling is pulled from the builder first, so the
    /// insertion cannot interleave with content the builder has yet to add.
    ///
    /// # Errors
    ///
    /// [`HierarchyError::NoParent`] if the anchor is detached,
    /// [`HierarchyError::SelfRelationship`] if `node == anchor`, and the
    /// errors of [`append_child`](Self::append_child).
    pub fn insert_sibling_after(&mut self, anchor: NodeId, node: NodeId) -> Result<()> {
        self.check_live(anchor)?;
        self.check_live(node)?;
        if anchor == node {
            return Err(HierarchyError::SelfRelationship.into());
        }
        let parent = self.parent(anchor).ok_or(HierarchyError::NoParent)?;
        self.check_no_cycle(parent, node)?;
        self.next_sibling(anchor)?;
        self.check_child(parent, node)?;
        self.detach(node);
        self.link_after(anchor, node);
        Ok(())
    }

    /// Inserts `node` directly before `anchor`.
    ///
    /// # Errors
    ///
    /// Same as [`insert_sibling_after`](Self::insert_sibling_after).
    pub fn insert_sibling_before(&mut self, anchor: NodeId, node: NodeId) -> Result<()> {
        self.check_live(anchor)?;
        self.check_live(node)?;
        if anchor == node {
            return Err(HierarchyError::SelfRelationship.into());
        }
        let parent = self.parent(anchor).ok_or(HierarchyError::NoParent)?;
        self.check_no_cycle(parent, node)?;
        self.check_child(parent, node)?;
        self.detach(node);
        self.link_before(anchor, node);
        Ok(())
    }

    /// Prepends `child` as the first child of `parent`.
    ///
    /// # Errors
    ///
    /// Same as [`append_child`](Self::append_child).
    pub fn prepend_child(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        self.check_live(parent)?;
        match self.first_child(parent)? {
            Some(first) => self.insert_sibling_before(first, child),
            None => self.append_child(parent, child),
        }
    }

    /// Detaches a node from its container (or owning element). O(1).
    ///
    /// Detaching a node whose container is still being built is allowed; the
    /// builder keeps filling the detached node if it is itself still open.
    pub fn detach(&mut self, id: NodeId) {
        let Some(parent) = self.node(id).parent else {
            return;
        };
        match &self.node(id).kind {
            NodeKind::Attribute(_) | NodeKind::NamespaceDeclaration(_) => {
                if let NodeKind::Element(e) = &mut self.node_mut(parent).kind {
                    e.attributes.retain(|&a| a != id);
                    e.namespaces.retain(|&n| n != id);
                }
                self.node_mut(id).parent = None;
                return;
            }
            _ => {}
        }

        let prev = self.node(id).prev_sibling;
        let next = self.node(id).next_sibling;
        match prev {
            Some(p) => self.node_mut(p).next_sibling = next,
            None => self.node_mut(parent).first_child = next,
        }
        match next {
            Some(n) => self.node_mut(n).prev_sibling = prev,
            None => self.node_mut(parent).last_child = prev,
        }
        let node = self.node_mut(id);
        node.parent = None;
        node.prev_sibling = None;
        node.next_sibling = None;
    }

    /// Replaces `old` with `new` in `old`'s container. `old` ends detached.
    ///
    /// # Errors
    ///
    /// [`HierarchyError::NoParent`] if `old` is detached, plus the errors of
    /// [`insert_sibling_after`](Self::insert_sibling_after).
    pub fn replace_with(&mut self, old: NodeId, new: NodeId) -> Result<()> {
        if old == new {
            return Ok(());
        }
        self.insert_sibling_after(old, new)?;
        self.detach(old);
        Ok(())
    }

    /// Detaches a node and frees it with its whole subtree.
    ///
    /// A node that is still being built is discarded first, so its remaining
    /// source content is skipped rather than left for the builder.
    ///
    /// # Errors
    ///
    /// Propagates errors from discarding a still-building node.
    pub fn remove(&mut self, id: NodeId) -> Result<()> {
        let data = self.node(id);
        if data.state == BuildState::Fresh && data.builder.is_some() {
            self.discard(id)?;
        }
        self.free_subtree(id);
        Ok(())
    }

    /// Detaches and frees `id` and everything below it.
    pub(crate) fn free_subtree(&mut self, id: NodeId) {
        if !self.contains(id) {
            return;
        }
        self.detach(id);
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let Some(data) = self.get(current) else {
                continue;
            };
            let mut next = data.first_child;
            while let Some(child) = next {
                next = self.node(child).next_sibling;
                stack.push(child);
            }
            if let NodeKind::Element(e) = &data.kind {
                stack.extend(e.attributes.iter().copied());
                stack.extend(e.namespaces.iter().copied());
            }
            if let Some(bid) = data.builder {
                self.release_builder_rooted_at(bid, current);
            }
            self.release(current);
        }
        trace!("freed subtree; {} nodes live", self.live);
    }

    /// Frees every child of `id`, keeping `id` itself.
    pub(crate) fn free_children(&mut self, id: NodeId) {
        while let Some(child) = self.node(id).first_child {
            self.free_subtree(child);
        }
    }

    // --- Attributes and namespace declarations ---

    /// Attribute nodes owned by an element.
    #[must_use]
    pub fn attributes(&self, element: NodeId) -> &[NodeId] {
        match &self.node(element).kind {
            NodeKind::Element(e) => &e.attributes,
            _ => &[],
        }
    }

    /// Finds an attribute by expanded name. `None` and `Some("")` both mean
    /// "no namespace".
    #[must_use]
    pub fn attribute(&self, element: NodeId, namespace: Option<&str>, local: &str) -> Option<NodeId> {
        self.attributes(element).iter().copied().find(|&a| {
            matches!(&self.node(a).kind, NodeKind::Attribute(attr) if attr.name.matches(namespace, local))
        })
    }

    /// Returns the value of an attribute found by expanded name.
    #[must_use]
    pub fn attribute_value(&self, element: NodeId, namespace: Option<&str>, local: &str) -> Option<&str> {
        let id = self.attribute(element, namespace, local)?;
        match &self.node(id).kind {
            NodeKind::Attribute(a) => Some(&a.value),
            _ => None,
        }
    }

    /// Adds an attribute node to an element, replacing any attribute with
    /// the same expanded name. An attribute owned by another element is
    /// cloned rather than moved. Returns the id of the attribute now owned
    /// by `element`.
    ///
    /// # Errors
    ///
    /// [`HierarchyError::ChildNotAllowed`] if `element` is not an element or
    /// `attr` is not an attribute.
    pub fn add_attribute(&mut self, element: NodeId, attr: NodeId) -> Result<NodeId> {
        self.check_live(element)?;
        let data = match &self.node(attr).kind {
            NodeKind::Attribute(a) if self.is_element(element) => a.clone(),
            other => {
                return Err(HierarchyError::ChildNotAllowed {
                    parent: self.node(element).kind.describe(),
                    child: other.describe(),
                }
                .into())
            }
        };
        self.expand(element)?;

        let attr = match self.node(attr).parent {
            Some(owner) if owner == element => return Ok(attr),
            Some(_) => self.alloc(NodeKind::Attribute(data), BuildState::Complete),
            None => attr,
        };
        self.attach_attribute(element, attr);
        Ok(attr)
    }

    /// Links an attribute, dropping any previous one with the same name.
    pub(crate) fn attach_attribute(&mut self, element: NodeId, attr: NodeId) {
        let name = match &self.node(attr).kind {
            NodeKind::Attribute(a) => a.name.clone(),
            _ => return,
        };
        if let Some(old) = self.attribute(element, name.namespace.as_deref(), &name.local) {
            self.free_subtree(old);
        }
        if let NodeKind::Element(e) = &mut self.node_mut(element).kind {
            e.attributes.push(attr);
        }
        self.node_mut(attr).parent = Some(element);
    }

    /// Sets an attribute value, replacing any attribute with the same
    /// expanded name.
    ///
    /// # Errors
    ///
    /// Same as [`add_attribute`](Self::add_attribute).
    pub fn set_attribute(&mut self, element: NodeId, name: QName, value: impl Into<String>) -> Result<NodeId> {
        let attr = self.create_attribute(name, value);
        match self.add_attribute(element, attr) {
            Ok(id) => Ok(id),
            Err(e) => {
                self.free_subtree(attr);
                Err(e)
            }
        }
    }

    /// Removes an attribute by expanded name. Returns `true` if one existed.
    pub fn remove_attribute(&mut self, element: NodeId, namespace: Option<&str>, local: &str) -> bool {
        match self.attribute(element, namespace, local) {
            Some(id) => {
                self.free_subtree(id);
                true
            }
            None => false,
        }
    }

    /// Namespace declaration nodes scoped to an element, in order.
    #[must_use]
    pub fn namespace_declarations(&self, element: NodeId) -> &[NodeId] {
        match &self.node(element).kind {
            NodeKind::Element(e) => &e.namespaces,
            _ => &[],
        }
    }

    /// Returns the binding carried by a namespace declaration node.
    #[must_use]
    pub fn namespace_binding(&self, id: NodeId) -> Option<&NamespaceBinding> {
        match &self.node(id).kind {
            NodeKind::NamespaceDeclaration(b) => Some(b),
            _ => None,
        }
    }

    /// Declares a namespace on an element, replacing an existing
    /// declaration of the same prefix.
    ///
    /// # Errors
    ///
    /// [`HierarchyError::ChildNotAllowed`] if `element` is not an element.
    pub fn declare_namespace(
        &mut self,
        element: NodeId,
        prefix: impl Into<String>,
        uri: impl Into<String>,
    ) -> Result<NodeId> {
        self.check_live(element)?;
        if !self.is_element(element) {
            return Err(HierarchyError::ChildNotAllowed {
                parent: self.node(element).kind.describe(),
                child: "namespace declaration".to_string(),
            }
            .into());
        }
        self.expand(element)?;
        let binding = NamespaceBinding::new(prefix, uri);
        let existing = self
            .namespace_declarations(element)
            .iter()
            .copied()
            .find(|&n| self.namespace_binding(n).is_some_and(|b| b.prefix == binding.prefix));
        if let Some(old) = existing {
            self.free_subtree(old);
        }
        let id = self.alloc(NodeKind::NamespaceDeclaration(binding), BuildState::Complete);
        self.attach_namespace(element, id);
        Ok(id)
    }

    pub(crate) fn attach_namespace(&mut self, element: NodeId, decl: NodeId) {
        if let NodeKind::Element(e) = &mut self.node_mut(element).kind {
            e.namespaces.push(decl);
        }
        self.node_mut(decl).parent = Some(element);
    }

    // --- Accounting ---

    /// Number of nodes currently allocated.
    #[must_use]
    pub fn live_node_count(&self) -> usize {
        self.live
    }

    /// Highest number of simultaneously allocated nodes since creation or
    /// the last [`reset_peak`](Self::reset_peak).
    #[must_use]
    pub fn peak_node_count(&self) -> usize {
        self.peak
    }

    pub fn reset_peak(&mut self) {
        self.peak = self.live;
    }
}

#[allow(clippy::cast_possible_truncation, clippy::expect_used)]
fn index_to_nonzero(index: usize) -> NonZeroU32 {
    NonZeroU32::new(index as u32).expect("slot 0 is reserved")
}

// --- Iterators ---

/// Iterator over the built children of a node.
pub struct Children<'a> {
    graph: &'a NodeGraph,
    next: Option<NodeId>,
}

impl Iterator for Children<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = self.graph.node(current).next_sibling;
        Some(current)
    }
}

/// Iterator over a node and its ancestors.
pub struct Ancestors<'a> {
    graph: &'a NodeGraph,
    next: Option<NodeId>,
}

impl Iterator for Ancestors<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = self.graph.node(current).parent;
        Some(current)
    }
}

/// Depth-first iterator over the built descendants of a node.
pub struct Descendants<'a> {
    graph: &'a NodeGraph,
    root: NodeId,
    next: Option<NodeId>,
}

impl Iterator for Descendants<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        let graph = self.graph;

        if let Some(child) = graph.node(current).first_child {
            self.next = Some(child);
            return Some(current);
        }
        let mut cursor = Some(current);
        while let Some(node) = cursor {
            if node == self.root {
                break;
            }
            if let Some(sibling) = graph.node(node).next_sibling {
                self.next = Some(sibling);
                return Some(current);
            }
            cursor = graph.node(node).parent;
        }
        self.next = None;
        Some(current)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn graph_with_root() -> (NodeGraph, NodeId) {
        let mut graph = NodeGraph::new(View::Om);
        let root = graph.create_element(QName::local("root"));
        let doc = graph.document();
        graph.append_child(doc, root).unwrap();
        (graph, root)
    }

    fn names(graph: &NodeGraph, parent: NodeId) -> Vec<String> {
        graph
            .children_if_available(parent)
            .map(|c| match graph.kind(c) {
                NodeKind::Element(e) => e.name.local.clone(),
                NodeKind::Text(TextContent::Literal(t)) => format!("#{t}"),
                other => other.describe(),
            })
            .collect()
    }

    #[test]
    fn test_new_graph_has_complete_document() {
        let graph = NodeGraph::new(View::Om);
        let doc = graph.document();
        assert!(matches!(graph.kind(doc), NodeKind::Document(_)));
        assert_eq!(graph.state(doc), BuildState::Complete);
        assert_eq!(graph.live_node_count(), 1);
    }

    #[test]
    fn test_append_and_siblings() {
        let (mut graph, root) = graph_with_root();
        let a = graph.create_element(QName::local("a"));
        let b = graph.create_element(QName::local("b"));
        graph.append_child(root, a).unwrap();
        graph.append_child(root, b).unwrap();
        assert_eq!(names(&graph, root), vec!["a", "b"]);
        assert_eq!(graph.previous_sibling(b), Some(a));
        assert_eq!(graph.next_sibling_if_available(a), Some(b));
        assert_eq!(graph.last_child_if_available(root), Some(b));
    }

    #[test]
    fn test_append_moves_node_between_parents() {
        let (mut graph, root) = graph_with_root();
        let a = graph.create_element(QName::local("a"));
        let b = graph.create_element(QName::local("b"));
        let x = graph.create_text("x");
        graph.append_child(root, a).unwrap();
        graph.append_child(root, b).unwrap();
        graph.append_child(a, x).unwrap();
        graph.append_child(b, x).unwrap();
        assert_eq!(graph.first_child_if_available(a), None);
        assert_eq!(graph.parent(x), Some(b));
        assert_eq!(graph.children_if_available(b).count(), 1);
    }

    #[test]
    fn test_append_rejects_cycle() {
        let (mut graph, root) = graph_with_root();
        let a = graph.create_element(QName::local("a"));
        graph.append_child(root, a).unwrap();
        let err = graph.append_child(a, root).unwrap_err();
        assert_eq!(err.as_hierarchy(), Some(&HierarchyError::Cycle));
        let err = graph.append_child(a, a).unwrap_err();
        assert_eq!(err.as_hierarchy(), Some(&HierarchyError::Cycle));
    }

    #[test]
    fn test_document_accepts_single_element() {
        let (mut graph, _root) = graph_with_root();
        let doc = graph.document();
        let second = graph.create_element(QName::local("second"));
        let err = graph.append_child(doc, second).unwrap_err();
        assert!(matches!(
            err.as_hierarchy(),
            Some(HierarchyError::ChildNotAllowed { .. })
        ));
        let comment = graph.create_comment("ok");
        graph.append_child(doc, comment).unwrap();
    }

    #[test]
    fn test_leaf_rejects_children() {
        let (mut graph, root) = graph_with_root();
        let text = graph.create_text("t");
        graph.append_child(root, text).unwrap();
        let other = graph.create_text("u");
        assert!(graph.append_child(text, other).is_err());
    }

    #[test]
    fn test_insert_siblings() {
        let (mut graph, root) = graph_with_root();
        let a = graph.create_element(QName::local("a"));
        let c = graph.create_element(QName::local("c"));
        graph.append_child(root, a).unwrap();
        graph.append_child(root, c).unwrap();
        let b = graph.create_element(QName::local("b"));
        graph.insert_sibling_after(a, b).unwrap();
        let z = graph.create_element(QName::local("z"));
        graph.insert_sibling_before(a, z).unwrap();
        let d = graph.create_element(QName::local("d"));
        graph.insert_sibling_after(c, d).unwrap();
        assert_eq!(names(&graph, root), vec!["z", "a", "b", "c", "d"]);
        assert_eq!(graph.first_child_if_available(root), Some(z));
        assert_eq!(graph.last_child_if_available(root), Some(d));
    }

    #[test]
    fn test_sibling_errors() {
        let (mut graph, root) = graph_with_root();
        let loose = graph.create_element(QName::local("loose"));
        let other = graph.create_element(QName::local("other"));
        let err = graph.insert_sibling_after(loose, other).unwrap_err();
        assert_eq!(err.as_hierarchy(), Some(&HierarchyError::NoParent));
        let a = graph.create_element(QName::local("a"));
        graph.append_child(root, a).unwrap();
        let err = graph.insert_sibling_before(a, a).unwrap_err();
        assert_eq!(err.as_hierarchy(), Some(&HierarchyError::SelfRelationship));
    }

    #[test]
    fn test_detach_middle_child() {
        let (mut graph, root) = graph_with_root();
        let ids: Vec<NodeId> = ["a", "b", "c"]
            .iter()
            .map(|n| {
                let id = graph.create_element(QName::local(*n));
                graph.append_child(root, id).unwrap();
                id
            })
            .collect();
        graph.detach(ids[1]);
        assert_eq!(names(&graph, root), vec!["a", "c"]);
        assert_eq!(graph.parent(ids[1]), None);
        assert_eq!(graph.previous_sibling(ids[2]), Some(ids[0]));
        graph.detach(ids[1]);
        assert_eq!(names(&graph, root), vec!["a", "c"]);
    }

    #[test]
    fn test_replace_with() {
        let (mut graph, root) = graph_with_root();
        let a = graph.create_element(QName::local("a"));
        let b = graph.create_element(QName::local("b"));
        graph.append_child(root, a).unwrap();
        graph.replace_with(a, b).unwrap();
        assert_eq!(names(&graph, root), vec!["b"]);
        assert_eq!(graph.parent(a), None);
    }

    #[test]
    fn test_remove_frees_subtree_and_invalidates_ids() {
        let (mut graph, root) = graph_with_root();
        let a = graph.create_element(QName::local("a"));
        let t = graph.create_text("t");
        graph.append_child(root, a).unwrap();
        graph.append_child(a, t).unwrap();
        graph.set_attribute(a, QName::local("k"), "v").unwrap();
        let before = graph.live_node_count();
        graph.remove(a).unwrap();
        assert_eq!(graph.live_node_count(), before - 3);
        assert!(!graph.contains(a));
        assert!(!graph.contains(t));

        // A recycled slot does not resurrect the stale id.
        let fresh = graph.create_element(QName::local("fresh"));
        assert!(graph.contains(fresh));
        assert!(!graph.contains(a));
    }

    #[test]
    fn test_attributes_last_write_wins() {
        let (mut graph, root) = graph_with_root();
        graph.set_attribute(root, QName::local("k"), "1").unwrap();
        graph.set_attribute(root, QName::new("urn:x", "k"), "ns").unwrap();
        graph.set_attribute(root, QName::local("k"), "2").unwrap();
        assert_eq!(graph.attributes(root).len(), 2);
        assert_eq!(graph.attribute_value(root, None, "k"), Some("2"));
        assert_eq!(graph.attribute_value(root, Some("urn:x"), "k"), Some("ns"));
        assert!(graph.remove_attribute(root, None, "k"));
        assert!(!graph.remove_attribute(root, None, "k"));
    }

    #[test]
    fn test_attribute_owned_elsewhere_is_cloned() {
        let (mut graph, root) = graph_with_root();
        let other = graph.create_element(QName::local("other"));
        graph.append_child(root, other).unwrap();
        let attr = graph.set_attribute(root, QName::local("k"), "v").unwrap();
        let copy = graph.add_attribute(other, attr).unwrap();
        assert_ne!(copy, attr);
        assert_eq!(graph.parent(attr), Some(root));
        assert_eq!(graph.parent(copy), Some(other));
        assert_eq!(graph.attribute_value(other, None, "k"), Some("v"));
    }

    #[test]
    fn test_declare_namespace_replaces_prefix() {
        let (mut graph, root) = graph_with_root();
        graph.declare_namespace(root, "x", "urn:one").unwrap();
        graph.declare_namespace(root, "x", "urn:two").unwrap();
        let decls = graph.namespace_declarations(root);
        assert_eq!(decls.len(), 1);
        assert_eq!(graph.namespace_binding(decls[0]).unwrap().uri, "urn:two");
    }

    #[test]
    fn test_descendants_order() {
        let (mut graph, root) = graph_with_root();
        let a = graph.create_element(QName::local("a"));
        let b = graph.create_element(QName::local("b"));
        let c = graph.create_element(QName::local("c"));
        graph.append_child(root, a).unwrap();
        graph.append_child(a, b).unwrap();
        graph.append_child(root, c).unwrap();
        let order: Vec<NodeId> = graph.descendants_if_available(root).collect();
        assert_eq!(order, vec![a, b, c]);
        let ancestors: Vec<NodeId> = graph.ancestors(b).collect();
        assert_eq!(ancestors, vec![b, a, root, graph.document()]);
    }

    #[test]
    fn test_peak_tracking() {
        let mut graph = NodeGraph::new(View::Om);
        let a = graph.create_element(QName::local("a"));
        let b = graph.create_element(QName::local("b"));
        assert_eq!(graph.peak_node_count(), 3);
        graph.remove(a).unwrap();
        graph.remove(b).unwrap();
        assert_eq!(graph.peak_node_count(), 3);
        graph.reset_peak();
        assert_eq!(graph.peak_node_count(), 1);
    }
}
