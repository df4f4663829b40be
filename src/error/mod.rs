//! Error types for building, mutating and serializing the object model.
//!
//! Every failure falls into one of four categories, mirrored by the variants
//! of [`ModelError`]:
//!
//! - [`HierarchyError`]: a structural mutation would break the tree (cycles,
//!   children a container does not accept, SOAP structure violations).
//! - [`ParseError`]: the token source failed. Terminal for the builder that
//!   was reading it; whatever was built so far stays navigable.
//! - [`StateError`]: the operation is not valid for the current state of the
//!   node or its builder.
//! - [`IoError`]: a sink or blob failed while serializing. Nothing already
//!   written is rolled back.

use std::fmt;

/// Position in the token source at which a parse error was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceLocation {
    /// 0-based byte offset from the start of the input.
    pub byte_offset: usize,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "byte {}", self.byte_offset)
    }
}

/// The error type returned when the token source fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    /// The primary error message.
    pub message: String,
    /// Where in the source the error occurred.
    pub location: SourceLocation,
}

impl ParseError {
    /// Creates a parse error at the given byte offset.
    pub fn new(message: impl Into<String>, byte_offset: usize) -> Self {
        Self {
            message: message.into(),
            location: SourceLocation { byte_offset },
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "parse error at {}: {}", self.location, self.message)
    }
}

impl std::error::Error for ParseError {}

/// A structural mutation that the tree refuses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HierarchyError {
    /// The new child is the container itself or one of its ancestors.
    Cycle,
    /// A node was asked to become its own sibling.
    SelfRelationship,
    /// A sibling operation was attempted on a node without a parent.
    NoParent,
    /// The container's content model does not accept this kind of child.
    ChildNotAllowed {
        /// Description of the container.
        parent: String,
        /// Description of the rejected child.
        child: String,
    },
    /// An element appeared where the view requires a different one.
    UnexpectedElement {
        /// What the view expected at this position.
        expected: String,
        /// What was found instead.
        found: String,
    },
}

impl fmt::Display for HierarchyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cycle => write!(f, "a node cannot be added to its own subtree"),
            Self::SelfRelationship => write!(f, "a node cannot be its own sibling"),
            Self::NoParent => write!(f, "the node has no parent"),
            Self::ChildNotAllowed { parent, child } => {
                write!(f, "{parent} does not accept {child} as a child")
            }
            Self::UnexpectedElement { expected, found } => {
                write!(f, "expected {expected}, found {found}")
            }
        }
    }
}

impl std::error::Error for HierarchyError {}

/// An operation that is invalid for the current node or builder state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateError {
    /// The node was discarded or consumed by streaming serialization.
    NodeConsumed,
    /// The operation requires a node that is still being built.
    NotFresh,
    /// The builder feeding the node has been closed.
    BuilderClosed,
    /// The node is incomplete and its builder can no longer supply content.
    Unavailable,
    /// A lookahead is already pending and must be consumed first.
    LookaheadPending,
    /// The node cannot hold children.
    NotAContainer,
    /// No builder is attached to the node.
    NoBuilder,
    /// The builder is already busy servicing another request.
    BuilderBusy,
    /// The node is not backed by a data source.
    NotSourced,
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::NodeConsumed => "node has been discarded or consumed",
            Self::NotFresh => "node is not being built",
            Self::BuilderClosed => "builder has been closed",
            Self::Unavailable => "content is unavailable because the builder was closed",
            Self::LookaheadPending => "a lookahead is already pending",
            Self::NotAContainer => "node cannot have children",
            Self::NoBuilder => "node has no builder",
            Self::BuilderBusy => "builder is already in use",
            Self::NotSourced => "element is not backed by a data source",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for StateError {}

/// A sink or blob failure during serialization.
#[derive(Debug)]
pub struct IoError {
    /// Human-readable description.
    pub message: String,
    /// The underlying I/O error, if any.
    pub source: Option<std::io::Error>,
}

impl IoError {
    /// Creates an I/O error without an underlying cause.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "I/O error: {}", self.message)
    }
}

impl std::error::Error for IoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl From<std::io::Error> for IoError {
    fn from(err: std::io::Error) -> Self {
        Self {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

/// Any error surfaced by the object model.
#[derive(Debug)]
pub enum ModelError {
    /// See [`HierarchyError`].
    Hierarchy(HierarchyError),
    /// See [`ParseError`].
    Parse(ParseError),
    /// See [`StateError`].
    State(StateError),
    /// See [`IoError`].
    Io(IoError),
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hierarchy(e) => write!(f, "hierarchy error: {e}"),
            Self::Parse(e) => e.fmt(f),
            Self::State(e) => write!(f, "state error: {e}"),
            Self::Io(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for ModelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Hierarchy(e) => Some(e),
            Self::Parse(e) => Some(e),
            Self::State(e) => Some(e),
            Self::Io(e) => Some(e),
        }
    }
}

impl From<HierarchyError> for ModelError {
    fn from(err: HierarchyError) -> Self {
        Self::Hierarchy(err)
    }
}

impl From<ParseError> for ModelError {
    fn from(err: ParseError) -> Self {
        Self::Parse(err)
    }
}

impl From<StateError> for ModelError {
    fn from(err: StateError) -> Self {
        Self::State(err)
    }
}

impl From<IoError> for ModelError {
    fn from(err: IoError) -> Self {
        Self::Io(err)
    }
}

impl From<std::io::Error> for ModelError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(IoError::from(err))
    }
}

impl ModelError {
    /// Returns the state error, if this is one.
    #[must_use]
    pub fn as_state(&self) -> Option<StateError> {
        match self {
            Self::State(e) => Some(*e),
            _ => None,
        }
    }

    /// Returns the hierarchy error, if this is one.
    #[must_use]
    pub fn as_hierarchy(&self) -> Option<&HierarchyError> {
        match self {
            Self::Hierarchy(e) => Some(e),
            _ => None,
        }
    }

    /// Returns `true` if this is a parse error.
    #[must_use]
    pub fn is_parse(&self) -> bool {
        matches!(self, Self::Parse(_))
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ModelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_location_display() {
        let loc = SourceLocation { byte_offset: 42 };
        assert_eq!(loc.to_string(), "byte 42");
    }

    #[test]
    fn test_parse_error_display() {
        let err = ParseError::new("unexpected end of input", 14);
        assert_eq!(
            err.to_string(),
            "parse error at byte 14: unexpected end of input"
        );
    }

    #[test]
    fn test_hierarchy_error_display() {
        let err = HierarchyError::ChildNotAllowed {
            parent: "document".to_string(),
            child: "a second element".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "document does not accept a second element as a child"
        );
    }

    #[test]
    fn test_model_error_from_state() {
        let err: ModelError = StateError::NodeConsumed.into();
        assert_eq!(err.as_state(), Some(StateError::NodeConsumed));
        assert_eq!(
            err.to_string(),
            "state error: node has been discarded or consumed"
        );
    }

    #[test]
    fn test_io_error_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err = ModelError::from(io);
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains("pipe closed"));
    }

    #[test]
    fn test_errors_implement_error_trait() {
        let _: &dyn std::error::Error = &ParseError::new("x", 0);
        let _: &dyn std::error::Error = &HierarchyError::Cycle;
        let _: &dyn std::error::Error = &StateError::Unavailable;
        let _: &dyn std::error::Error = &IoError::new("x");
    }
}
