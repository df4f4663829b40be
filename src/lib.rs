//! # lazyxml
//!
//! A lazily built XML object model. A document is turned into a node graph
//! only as far as reads demand: asking for an element's first child pulls
//! just enough tokens to create it, and anything never looked at is never
//! built. Subtrees can be discarded unread, streamed to a writer without
//! being built, or backed by an external data source that is expanded only
//! when touched.
//!
//! ## Quick Start
//!
//! ```
//! use lazyxml::{to_xml_string, BuildState, NodeGraph, View};
//!
//! let mut graph = NodeGraph::parse_str("<order><id>7</id><items>...</items></order>", View::Om);
//! let order = graph.document_element(false).unwrap().unwrap();
//! let id = graph.first_child(order).unwrap().unwrap();
//! assert_eq!(graph.text_content(id).unwrap(), "7");
//!
//! // `items` has not been read yet.
//! assert_eq!(graph.state(order), BuildState::Fresh);
//!
//! let xml = to_xml_string(&mut graph, order).unwrap();
//! assert_eq!(xml, "<order><id>7</id><items>...</items></order>");
//! ```
//!
//! ## Modules
//!
//! - [`token`]: tokens and the [`EventSource`] pull interface.
//! - [`source`]: [`XmlSource`], the quick-xml backed event source.
//! - [`tree`]: the node arena and pure navigation.
//! - [`builder`]: lazy building, discard, lookahead and custom builders.
//! - [`sourced`]: elements backed by a [`DataSource`].
//! - [`serial`]: serialization in tree-preserving and consuming modes.
//! - [`view`]: generic, SOAP and DOM views.

pub mod blob;
pub mod builder;
pub mod encoding;
pub mod error;
pub mod serial;
pub mod source;
pub mod sourced;
pub mod token;
pub mod tree;
pub mod view;

pub use blob::{BinaryPayload, Blob, BlobProvider, MemoryBlob};
pub use builder::{BuilderOptions, BuilderState, CustomBuilder, TokenCaptureBuilder};
pub use error::{HierarchyError, IoError, ModelError, ParseError, Result, StateError};
pub use serial::{
    serialize, serialize_and_consume, to_xml_string, to_xml_string_with_options, NamespaceRepairer, SerializeOptions,
    Serializer, Sink, TokenCollector, XmlWriter,
};
pub use source::XmlSource;
pub use sourced::{DataSource, ExpansionState, ReaderDataSource, StringDataSource, TokenDataSource};
pub use token::{EventSource, NamespaceBinding, QName, StartTag, Token, TokenStream};
pub use tree::{BuildState, CloneOptions, NodeData, NodeGraph, NodeId, NodeKind, TextContent};
pub use view::{SoapVersion, View};
