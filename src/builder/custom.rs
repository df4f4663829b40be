//! Custom builders: capture a matching element's subtree from the token
//! stream and hand it back as a sourced element.

use std::fmt;
use std::rc::Rc;

use crate::error::ModelError;
use crate::sourced::{DataSource, TokenDataSource};
use crate::token::{QName, Token};

/// Turns the captured tokens of one element into a data source.
///
/// `tokens` run from the element's start tag to its matching end tag. The
/// start tag carries every namespace binding in scope at that point, so the
/// fragment is self-contained.
pub trait CustomBuilder: fmt::Debug {
    /// Creates the data source backing the new sourced element.
    ///
    /// # Errors
    ///
    /// Any error returned here surfaces from the pull that met the element
    /// and closes the builder.
    fn create(&self, name: &QName, tokens: Vec<Token>) -> Result<Box<dyn DataSource>, ModelError>;
}

/// Keeps the captured tokens in memory.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokenCaptureBuilder;

impl CustomBuilder for TokenCaptureBuilder {
    fn create(&self, _name: &QName, tokens: Vec<Token>) -> Result<Box<dyn DataSource>, ModelError> {
        Ok(Box::new(TokenDataSource::new(tokens)))
    }
}

/// A registered custom builder and the names it applies to.
#[derive(Debug, Clone)]
pub struct CustomBuilderEntry {
    /// Namespace to match; `None` matches any namespace.
    pub namespace: Option<String>,
    /// Local name to match; `None` matches any local name.
    pub local: Option<String>,
    /// Deepest element level (1 for the document element) the builder
    /// applies to.
    pub max_depth: usize,
    pub builder: Rc<dyn CustomBuilder>,
}

impl CustomBuilderEntry {
    pub(crate) fn applies_to(&self, depth: usize, name: &QName) -> bool {
        depth <= self.max_depth
            && self.namespace.as_deref().is_none_or(|ns| ns == name.namespace_uri())
            && self.local.as_deref().is_none_or(|l| l == name.local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(namespace: Option<&str>, local: Option<&str>, max_depth: usize) -> CustomBuilderEntry {
        CustomBuilderEntry {
            namespace: namespace.map(str::to_string),
            local: local.map(str::to_string),
            max_depth,
            builder: Rc::new(TokenCaptureBuilder),
        }
    }

    #[test]
    fn test_wildcards_and_depth() {
        let name = QName::new("urn:a", "item");
        assert!(entry(Some("urn:a"), Some("item"), 3).applies_to(2, &name));
        assert!(entry(None, Some("item"), 3).applies_to(3, &name));
        assert!(entry(Some("urn:a"), None, 3).applies_to(1, &name));
        assert!(!entry(Some("urn:a"), Some("item"), 1).applies_to(2, &name));
        assert!(!entry(Some("urn:b"), None, 9).applies_to(2, &name));
        assert!(entry(Some(""), Some("x"), 2).applies_to(2, &QName::local("x")));
    }
}
