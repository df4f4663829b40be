//! SOAP view: envelope structure checks and a thin accessor façade.
//!
//! Under [`View::Soap`](super::View::Soap) the builder classifies elements
//! while it creates them: the document element must be an `Envelope` in the
//! SOAP 1.1 or 1.2 namespace, its children `Header` (at most one, first) and
//! `Body` (exactly one), header children are header blocks and a `Fault` in
//! the body is a fault. Whitespace between the structural elements is
//! dropped.

use crate::error::{HierarchyError, ModelError, Result};
use crate::token::QName;
use crate::tree::{BuildState, NodeData, NodeGraph, NodeId, NodeKind};
use crate::view::{is_content_kind, not_allowed, ContentModel, ElementClassifier, ElementRole};

/// Envelope namespace of SOAP 1.1.
pub const SOAP11_ENVELOPE_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";

/// Envelope namespace of SOAP 1.2.
pub const SOAP12_ENVELOPE_NS: &str = "http://www.w3.org/2003/05/soap-envelope";

/// Prefix used for programmatically created envelopes.
pub const ENVELOPE_PREFIX: &str = "soapenv";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SoapVersion {
    Soap11,
    Soap12,
}

impl SoapVersion {
    #[must_use]
    pub fn envelope_namespace(self) -> &'static str {
        match self {
            Self::Soap11 => SOAP11_ENVELOPE_NS,
            Self::Soap12 => SOAP12_ENVELOPE_NS,
        }
    }

    #[must_use]
    pub fn from_namespace(uri: &str) -> Option<Self> {
        match uri {
            SOAP11_ENVELOPE_NS => Some(Self::Soap11),
            SOAP12_ENVELOPE_NS => Some(Self::Soap12),
            _ => None,
        }
    }
}

/// Children of an envelope: `Header` then `Body`.
#[derive(Debug)]
pub struct EnvelopeModel;

impl ContentModel for EnvelopeModel {
    fn name(&self) -> &'static str {
        "soap envelope"
    }

    fn check_child(&self, graph: &NodeGraph, container: NodeId, child: NodeId) -> std::result::Result<(), HierarchyError> {
        let existing = |role: ElementRole| {
            graph
                .children_if_available(container)
                .any(|c| c != child && graph.element(c).is_some_and(|e| e.role == role))
        };
        match graph.kind(child) {
            NodeKind::Element(e) => match e.role {
                ElementRole::SoapHeader if existing(ElementRole::SoapHeader) => {
                    Err(unexpected("a single Header", &e.name))
                }
                ElementRole::SoapBody if existing(ElementRole::SoapBody) => {
                    Err(unexpected("a single Body", &e.name))
                }
                ElementRole::SoapHeader | ElementRole::SoapBody => Ok(()),
                _ => Err(unexpected("Header or Body", &e.name)),
            },
            NodeKind::Comment(_) | NodeKind::ProcessingInstruction { .. } => Ok(()),
            _ => Err(not_allowed(graph, container, child)),
        }
    }

    fn keeps_whitespace(&self) -> bool {
        false
    }

    fn accepts_character_data(&self) -> bool {
        false
    }
}

/// Content of `Header` and `Body`: anything but structural elements.
#[derive(Debug)]
pub struct SoapContentModel {
    name: &'static str,
    allows_fault: bool,
}

impl ContentModel for SoapContentModel {
    fn name(&self) -> &'static str {
        self.name
    }

    fn check_child(&self, graph: &NodeGraph, container: NodeId, child: NodeId) -> std::result::Result<(), HierarchyError> {
        match graph.kind(child) {
            NodeKind::Element(e) => match e.role {
                ElementRole::SoapEnvelope(_) | ElementRole::SoapHeader | ElementRole::SoapBody => {
                    Err(unexpected("element content", &e.name))
                }
                ElementRole::SoapFault if !self.allows_fault => {
                    Err(unexpected("header block", &e.name))
                }
                _ => Ok(()),
            },
            kind if is_content_kind(kind) => Ok(()),
            _ => Err(not_allowed(graph, container, child)),
        }
    }
}

static ENVELOPE: EnvelopeModel = EnvelopeModel;
static HEADER: SoapContentModel = SoapContentModel {
    name: "soap header",
    allows_fault: false,
};
static BODY: SoapContentModel = SoapContentModel {
    name: "soap body",
    allows_fault: true,
};

pub(crate) fn element_model(role: ElementRole) -> &'static dyn ContentModel {
    match role {
        ElementRole::SoapEnvelope(_) => &ENVELOPE,
        ElementRole::SoapHeader => &HEADER,
        ElementRole::SoapBody => &BODY,
        _ => &super::ELEMENT,
    }
}

fn unexpected(expected: &str, found: &QName) -> HierarchyError {
    HierarchyError::UnexpectedElement {
        expected: expected.to_string(),
        found: found.to_string(),
    }
}

/// Build-time classification of SOAP elements.
#[derive(Debug, Default)]
pub struct SoapClassifier {
    version: Option<SoapVersion>,
    header_seen: bool,
    body_seen: bool,
}

impl ElementClassifier for SoapClassifier {
    fn classify(&mut self, depth: usize, parent_role: ElementRole, name: &QName) -> std::result::Result<ElementRole, ModelError> {
        match depth {
            1 => {
                if name.local != "Envelope" {
                    return Err(unexpected("SOAP Envelope", name).into());
                }
                let version = SoapVersion::from_namespace(name.namespace_uri()).ok_or_else(|| {
                    HierarchyError::UnexpectedElement {
                        expected: "a SOAP envelope namespace".to_string(),
                        found: name.namespace_uri().to_string(),
                    }
                })?;
                self.version = Some(version);
                Ok(ElementRole::SoapEnvelope(version))
            }
            2 => {
                let ns = self.version.map_or("", SoapVersion::envelope_namespace);
                if name.namespace_uri() != ns {
                    return Err(unexpected("Header or Body", name).into());
                }
                match name.local.as_str() {
                    "Header" if self.body_seen => Err(unexpected("Header before Body", name).into()),
                    "Header" if self.header_seen => Err(unexpected("a single Header", name).into()),
                    "Header" => {
                        self.header_seen = true;
                        Ok(ElementRole::SoapHeader)
                    }
                    "Body" if self.body_seen => Err(unexpected("a single Body", name).into()),
                    "Body" => {
                        self.body_seen = true;
                        Ok(ElementRole::SoapBody)
                    }
                    _ => Err(unexpected("Header or Body", name).into()),
                }
            }
            3 => {
                let ns = self.version.map_or("", SoapVersion::envelope_namespace);
                Ok(match parent_role {
                    ElementRole::SoapHeader => ElementRole::SoapHeaderBlock,
                    ElementRole::SoapBody if name.matches(Some(ns), "Fault") => ElementRole::SoapFault,
                    _ => ElementRole::Plain,
                })
            }
            _ => Ok(ElementRole::Plain),
        }
    }
}

/// SOAP accessors on node data.
pub trait SoapElement {
    /// The element's role, `Plain` for non-elements.
    fn soap_role(&self) -> ElementRole;

    fn is_envelope(&self) -> bool {
        matches!(self.soap_role(), ElementRole::SoapEnvelope(_))
    }

    fn is_header(&self) -> bool {
        self.soap_role() == ElementRole::SoapHeader
    }

    fn is_body(&self) -> bool {
        self.soap_role() == ElementRole::SoapBody
    }

    fn is_fault(&self) -> bool {
        self.soap_role() == ElementRole::SoapFault
    }

    fn is_header_block(&self) -> bool {
        self.soap_role() == ElementRole::SoapHeaderBlock
    }

    /// The SOAP version, for envelopes.
    fn soap_version(&self) -> Option<SoapVersion> {
        match self.soap_role() {
            ElementRole::SoapEnvelope(v) => Some(v),
            _ => None,
        }
    }
}

impl SoapElement for NodeData {
    fn soap_role(&self) -> ElementRole {
        self.as_element().map_or(ElementRole::Plain, |e| e.role)
    }
}

/// Returns the envelope, building only as far as its start tag.
///
/// # Errors
///
/// Propagates build errors, including SOAP structure violations.
pub fn envelope(graph: &mut NodeGraph) -> Result<Option<NodeId>> {
    let Some(element) = graph.document_element(false)? else {
        return Ok(None);
    };
    Ok(graph.node(element).is_envelope().then_some(element))
}

/// Returns the SOAP version of the envelope.
///
/// # Errors
///
/// Propagates build errors.
pub fn soap_version(graph: &mut NodeGraph) -> Result<Option<SoapVersion>> {
    Ok(envelope(graph)?.and_then(|env| graph.node(env).soap_version()))
}

fn envelope_child(graph: &mut NodeGraph, role: ElementRole) -> Result<Option<NodeId>> {
    let Some(env) = envelope(graph)? else {
        return Ok(None);
    };
    let mut child = graph.first_child_element(env)?;
    while let Some(c) = child {
        if graph.node(c).soap_role() == role {
            return Ok(Some(c));
        }
        child = graph.next_sibling_element(c)?;
    }
    Ok(None)
}

/// Returns the `Header`, if present.
///
/// # Errors
///
/// Propagates build errors.
pub fn header(graph: &mut NodeGraph) -> Result<Option<NodeId>> {
    envelope_child(graph, ElementRole::SoapHeader)
}

/// Returns the `Body`, building past the header if needed.
///
/// # Errors
///
/// Propagates build errors.
pub fn body(graph: &mut NodeGraph) -> Result<Option<NodeId>> {
    envelope_child(graph, ElementRole::SoapBody)
}

/// Returns all header blocks, completing the header.
///
/// # Errors
///
/// Propagates build errors.
pub fn header_blocks(graph: &mut NodeGraph) -> Result<Vec<NodeId>> {
    let Some(header) = header(graph)? else {
        return Ok(Vec::new());
    };
    Ok(graph
        .children(header)?
        .into_iter()
        .filter(|&c| graph.node(c).is_header_block())
        .collect())
}

/// Returns the name of the first element in the body.
///
/// While the body is still being built, this uses the builder's lookahead:
/// only the start tag of the first body element is read and no node is
/// created for it.
///
/// # Errors
///
/// Propagates build errors.
pub fn first_body_element_name(graph: &mut NodeGraph) -> Result<Option<QName>> {
    let Some(body) = body(graph)? else {
        return Ok(None);
    };
    if graph.state(body) == BuildState::Fresh {
        if graph.has_pending_lookahead(body) {
            return Ok(graph.pending_lookahead_name(body).cloned());
        }
        let built = graph
            .children_if_available(body)
            .find(|&c| graph.is_element(c));
        if let Some(element) = built {
            return Ok(graph.name(element).cloned());
        }
        if graph.node(body).builder.is_some() {
            return graph.peek_name(body);
        }
    }
    let first = graph.first_child_element(body)?;
    Ok(first.and_then(|e| graph.name(e).cloned()))
}

/// Returns `true` if the body's first element is a fault, without building
/// that element.
///
/// # Errors
///
/// Propagates build errors.
pub fn has_fault(graph: &mut NodeGraph) -> Result<bool> {
    let Some(version) = soap_version(graph)? else {
        return Ok(false);
    };
    let name = first_body_element_name(graph)?;
    Ok(name.is_some_and(|n| n.matches(Some(version.envelope_namespace()), "Fault")))
}

/// Returns the fault element, if the body holds one.
///
/// # Errors
///
/// Propagates build errors.
pub fn fault(graph: &mut NodeGraph) -> Result<Option<NodeId>> {
    let Some(body) = body(graph)? else {
        return Ok(None);
    };
    let first = graph.first_child_element(body)?;
    Ok(first.filter(|&e| graph.node(e).is_fault()))
}

fn create_structural(graph: &mut NodeGraph, version: SoapVersion, local: &str, role: ElementRole) -> NodeId {
    let name = QName::with_prefix(version.envelope_namespace(), local, ENVELOPE_PREFIX);
    let id = graph.create_element(name);
    graph.set_role(id, role);
    id
}

/// Creates an envelope with an empty body as the document element.
///
/// # Errors
///
/// Fails if the document already has an element.
pub fn create_envelope(graph: &mut NodeGraph, version: SoapVersion) -> Result<NodeId> {
    let envelope = create_structural(graph, version, "Envelope", ElementRole::SoapEnvelope(version));
    graph.declare_namespace(envelope, ENVELOPE_PREFIX, version.envelope_namespace())?;
    let body = create_structural(graph, version, "Body", ElementRole::SoapBody);
    graph.append_child(envelope, body)?;
    let doc = graph.document();
    graph.append_child(doc, envelope)?;
    Ok(envelope)
}

/// Adds a header block, creating the `Header` in front of the body if the
/// envelope has none yet.
///
/// # Errors
///
/// Fails if the document holds no envelope.
pub fn add_header_block(graph: &mut NodeGraph, name: QName) -> Result<NodeId> {
    let env = envelope(graph)?.ok_or_else(|| HierarchyError::UnexpectedElement {
        expected: "SOAP Envelope".to_string(),
        found: "no document element".to_string(),
    })?;
    let version = graph.node(env).soap_version().unwrap_or(SoapVersion::Soap11);
    let header = match header(graph)? {
        Some(h) => h,
        None => {
            let h = create_structural(graph, version, "Header", ElementRole::SoapHeader);
            match graph.first_child_element(env)? {
                Some(first) => graph.insert_sibling_before(first, h)?,
                None => graph.append_child(env, h)?,
            }
            h
        }
    };
    let block = graph.create_element(name);
    graph.set_role(block, ElementRole::SoapHeaderBlock);
    graph.append_child(header, block)?;
    Ok(block)
}
