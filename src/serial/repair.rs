//! Namespace repair between a serializer and its sink.

use std::io;

use crate::blob::BinaryPayload;
use crate::serial::Sink;
use crate::token::{DocTypeDecl, NamespaceBinding, QName, XmlDeclaration};
use crate::tree::{XMLNS_NAMESPACE, XML_NAMESPACE};

#[derive(Debug)]
struct PendingTag {
    name: QName,
    namespaces: Vec<NamespaceBinding>,
    attributes: Vec<(QName, String)>,
}

/// A [`Sink`] adapter that makes namespace declarations consistent.
///
/// Start tags are held until their declarations and attributes are
/// complete. Then declarations the output already has in scope are
/// dropped, and every prefix used by the element or its attributes that
/// the output does not have bound is declared. An attribute namespace
/// without a usable prefix gets a generated one.
#[derive(Debug)]
pub struct NamespaceRepairer<S: Sink> {
    inner: S,
    scopes: Vec<Vec<NamespaceBinding>>,
    pending: Option<PendingTag>,
    prefix_base: String,
    generated: usize,
}

impl<S: Sink> NamespaceRepairer<S> {
    pub fn new(inner: S, prefix_base: &str) -> Self {
        Self {
            inner,
            scopes: Vec::new(),
            pending: None,
            prefix_base: prefix_base.to_string(),
            generated: 0,
        }
    }

    /// Writes any held start tag.
    ///
    /// # Errors
    ///
    /// Errors from the wrapped sink.
    pub fn finish(&mut self) -> io::Result<()> {
        self.flush()
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    fn resolve<'a>(&'a self, own: &'a [NamespaceBinding], prefix: &str) -> Option<&'a str> {
        if prefix == "xml" {
            return Some(XML_NAMESPACE);
        }
        own.iter()
            .chain(self.scopes.iter().rev().flatten())
            .find(|b| b.prefix == prefix)
            .map(|b| b.uri.as_str())
            .or_else(|| prefix.is_empty().then_some(""))
    }

    /// A non-empty prefix currently bound to `uri`.
    fn prefix_for(&self, own: &[NamespaceBinding], uri: &str) -> Option<String> {
        own.iter()
            .chain(self.scopes.iter().rev().flatten())
            .filter(|b| !b.prefix.is_empty() && b.uri == uri)
            .map(|b| b.prefix.as_str())
            .find(|p| self.resolve(own, p) == Some(uri))
            .map(str::to_string)
    }

    fn fresh_prefix(&mut self, own: &[NamespaceBinding]) -> String {
        loop {
            self.generated += 1;
            let candidate = format!("{}{}", self.prefix_base, self.generated);
            if self.resolve(own, &candidate).is_none() {
                return candidate;
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        let Some(tag) = self.pending.take() else {
            return Ok(());
        };
        let mut own: Vec<NamespaceBinding> = Vec::new();
        for binding in tag.namespaces {
            if binding.prefix == "xml" || binding.prefix == "xmlns" || binding.uri == XMLNS_NAMESPACE {
                continue;
            }
            if own.iter().any(|b| b.prefix == binding.prefix) {
                continue;
            }
            if self.resolve(&[], &binding.prefix) == Some(binding.uri.as_str()) {
                continue;
            }
            own.push(binding);
        }

        let mut name = tag.name;
        let uri = name.namespace_uri().to_string();
        if uri.is_empty() {
            name.prefix.clear();
        }
        if self.resolve(&own, &name.prefix) != Some(uri.as_str()) {
            if own.iter().any(|b| b.prefix == name.prefix) {
                // The element's own declarations bind its prefix elsewhere.
                name.prefix = self.fresh_prefix(&own);
            }
            own.push(NamespaceBinding::new(name.prefix.clone(), uri));
        }

        let mut attributes = Vec::with_capacity(tag.attributes.len());
        for (mut attr, value) in tag.attributes {
            let uri = attr.namespace_uri().to_string();
            if uri.is_empty() {
                attr.prefix.clear();
            } else if uri == XML_NAMESPACE {
                attr.prefix = "xml".to_string();
            } else {
                let usable = !attr.prefix.is_empty() && self.resolve(&own, &attr.prefix) == Some(uri.as_str());
                if !usable {
                    if let Some(prefix) = self.prefix_for(&own, &uri) {
                        attr.prefix = prefix;
                    } else {
                        let free = !attr.prefix.is_empty() && !own.iter().any(|b| b.prefix == attr.prefix);
                        if !free {
                            attr.prefix = self.fresh_prefix(&own);
                        }
                        own.push(NamespaceBinding::new(attr.prefix.clone(), uri));
                    }
                }
            }
            attributes.push((attr, value));
        }

        self.inner.write_start_element(&name)?;
        for binding in &own {
            self.inner.write_namespace_decl(&binding.prefix, &binding.uri)?;
        }
        for (attr, value) in &attributes {
            self.inner.write_attribute(attr, value)?;
        }
        self.scopes.push(own);
        Ok(())
    }

    fn pending_tag(&mut self) -> io::Result<&mut PendingTag> {
        self.pending
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no start tag is open"))
    }
}

impl<S: Sink> Sink for NamespaceRepairer<S> {
    fn write_start_document(&mut self, declaration: &XmlDeclaration) -> io::Result<()> {
        self.flush()?;
        self.inner.write_start_document(declaration)
    }

    fn write_end_document(&mut self) -> io::Result<()> {
        self.flush()?;
        self.inner.write_end_document()
    }

    fn write_doctype(&mut self, doctype: &DocTypeDecl) -> io::Result<()> {
        self.flush()?;
        self.inner.write_doctype(doctype)
    }

    fn write_start_element(&mut self, name: &QName) -> io::Result<()> {
        self.flush()?;
        self.pending = Some(PendingTag {
            name: name.clone(),
            namespaces: Vec::new(),
            attributes: Vec::new(),
        });
        Ok(())
    }

    fn write_namespace_decl(&mut self, prefix: &str, uri: &str) -> io::Result<()> {
        self.pending_tag()?
            .namespaces
            .push(NamespaceBinding::new(prefix, uri));
        Ok(())
    }

    fn write_attribute(&mut self, name: &QName, value: &str) -> io::Result<()> {
        self.pending_tag()?.attributes.push((name.clone(), value.to_string()));
        Ok(())
    }

    fn write_end_element(&mut self) -> io::Result<()> {
        self.flush()?;
        self.scopes.pop();
        self.inner.write_end_element()
    }

    fn write_characters(&mut self, text: &str) -> io::Result<()> {
        self.flush()?;
        self.inner.write_characters(text)
    }

    fn write_cdata(&mut self, text: &str) -> io::Result<()> {
        self.flush()?;
        self.inner.write_cdata(text)
    }

    fn write_comment(&mut self, text: &str) -> io::Result<()> {
        self.flush()?;
        self.inner.write_comment(text)
    }

    fn write_pi(&mut self, target: &str, data: &str) -> io::Result<()> {
        self.flush()?;
        self.inner.write_pi(target, data)
    }

    fn write_entity_ref(&mut self, name: &str) -> io::Result<()> {
        self.flush()?;
        self.inner.write_entity_ref(name)
    }

    fn write_binary(&mut self, payload: &BinaryPayload) -> io::Result<()> {
        self.flush()?;
        self.inner.write_binary(payload)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::serial::XmlWriter;

    fn repaired(f: impl FnOnce(&mut NamespaceRepairer<&mut XmlWriter<Vec<u8>>>) -> io::Result<()>) -> String {
        let mut writer = XmlWriter::new(Vec::new());
        let mut repairer = NamespaceRepairer::new(&mut writer, "ns");
        f(&mut repairer).unwrap();
        repairer.finish().unwrap();
        String::from_utf8(writer.into_inner()).unwrap()
    }

    #[test]
    fn test_redundant_declaration_dropped() {
        let out = repaired(|s| {
            s.write_start_element(&QName::with_prefix("urn:a", "r", "a"))?;
            s.write_namespace_decl("a", "urn:a")?;
            s.write_start_element(&QName::with_prefix("urn:a", "c", "a"))?;
            s.write_namespace_decl("a", "urn:a")?;
            s.write_end_element()?;
            s.write_end_element()
        });
        assert_eq!(out, r#"<a:r xmlns:a="urn:a"><a:c/></a:r>"#);
    }

    #[test]
    fn test_missing_declarations_added() {
        let out = repaired(|s| {
            s.write_start_element(&QName::new("urn:d", "r"))?;
            s.write_start_element(&QName::local("plain"))?;
            s.write_end_element()?;
            s.write_end_element()
        });
        assert_eq!(out, r#"<r xmlns="urn:d"><plain xmlns=""/></r>"#);
    }

    #[test]
    fn test_attribute_prefix_generated() {
        let out = repaired(|s| {
            s.write_start_element(&QName::local("r"))?;
            s.write_attribute(&QName::new("urn:x", "a"), "1")?;
            s.write_attribute(&QName::with_prefix(XML_NAMESPACE, "lang", "xml"), "en")?;
            s.write_end_element()
        });
        assert_eq!(out, r#"<r xmlns:ns1="urn:x" ns1:a="1" xml:lang="en"/>"#);
    }

    #[test]
    fn test_attribute_reuses_bound_prefix() {
        let out = repaired(|s| {
            s.write_start_element(&QName::with_prefix("urn:x", "r", "x"))?;
            s.write_attribute(&QName::with_prefix("urn:x", "a", "y"), "1")?;
            s.write_end_element()
        });
        assert_eq!(out, r#"<x:r xmlns:x="urn:x" x:a="1"/>"#);
    }

    #[test]
    fn test_attribute_outside_start_tag() {
        let mut writer = XmlWriter::new(Vec::new());
        let mut repairer = NamespaceRepairer::new(&mut writer, "ns");
        assert!(repairer.write_attribute(&QName::local("a"), "1").is_err());
    }
}
