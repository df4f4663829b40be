//! XML text output.

use std::borrow::Cow;
use std::io::{self, Write};

use crate::serial::Sink;
use crate::token::{DocTypeDecl, QName, XmlDeclaration};

/// A [`Sink`] that writes XML text to an [`io::Write`].
///
/// Empty elements are written as `<name/>`. The writer trusts its input:
/// namespace consistency is the job of the
/// [`NamespaceRepairer`](crate::serial::NamespaceRepairer) in front of it.
#[derive(Debug)]
pub struct XmlWriter<W: Write> {
    out: W,
    open_start: bool,
    names: Vec<String>,
}

impl<W: Write> XmlWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            open_start: false,
            names: Vec::new(),
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn close_start(&mut self) -> io::Result<()> {
        if self.open_start {
            self.open_start = false;
            self.out.write_all(b">")?;
        }
        Ok(())
    }
}

impl<W: Write> Sink for XmlWriter<W> {
    fn write_start_document(&mut self, declaration: &XmlDeclaration) -> io::Result<()> {
        let version = declaration.version.as_deref().unwrap_or("1.0");
        write!(self.out, "<?xml version=\"{version}\"")?;
        if let Some(encoding) = &declaration.encoding {
            write!(self.out, " encoding=\"{encoding}\"")?;
        }
        if let Some(standalone) = declaration.standalone {
            let value = if standalone { "yes" } else { "no" };
            write!(self.out, " standalone=\"{value}\"")?;
        }
        self.out.write_all(b"?>")
    }

    fn write_end_document(&mut self) -> io::Result<()> {
        self.out.flush()
    }

    fn write_doctype(&mut self, doctype: &DocTypeDecl) -> io::Result<()> {
        write!(self.out, "<!DOCTYPE {}", doctype.name)?;
        match (&doctype.public_id, &doctype.system_id) {
            (Some(public), Some(system)) => write!(self.out, " PUBLIC \"{public}\" \"{system}\"")?,
            (Some(public), None) => write!(self.out, " PUBLIC \"{public}\"")?,
            (None, Some(system)) => write!(self.out, " SYSTEM \"{system}\"")?,
            (None, None) => {}
        }
        if let Some(subset) = &doctype.internal_subset {
            write!(self.out, " [{subset}]")?;
        }
        self.out.write_all(b">")
    }

    fn write_start_element(&mut self, name: &QName) -> io::Result<()> {
        self.close_start()?;
        let qualified = name.qualified();
        write!(self.out, "<{qualified}")?;
        self.names.push(qualified);
        self.open_start = true;
        Ok(())
    }

    fn write_namespace_decl(&mut self, prefix: &str, uri: &str) -> io::Result<()> {
        if prefix.is_empty() {
            write!(self.out, " xmlns=\"{}\"", escape_attribute(uri))
        } else {
            write!(self.out, " xmlns:{prefix}=\"{}\"", escape_attribute(uri))
        }
    }

    fn write_attribute(&mut self, name: &QName, value: &str) -> io::Result<()> {
        write!(self.out, " {}=\"{}\"", name.qualified(), escape_attribute(value))
    }

    fn write_end_element(&mut self) -> io::Result<()> {
        let name = self
            .names
            .pop()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "end tag without a start tag"))?;
        if self.open_start {
            self.open_start = false;
            self.out.write_all(b"/>")
        } else {
            write!(self.out, "</{name}>")
        }
    }

    fn write_characters(&mut self, text: &str) -> io::Result<()> {
        self.close_start()?;
        self.out.write_all(escape_text(text).as_bytes())
    }

    fn write_cdata(&mut self, text: &str) -> io::Result<()> {
        self.close_start()?;
        // `]]>` cannot appear inside a section; split it across two.
        write!(self.out, "<![CDATA[{}]]>", text.replace("]]>", "]]]]><![CDATA[>"))
    }

    fn write_comment(&mut self, text: &str) -> io::Result<()> {
        self.close_start()?;
        write!(self.out, "<!--{text}-->")
    }

    fn write_pi(&mut self, target: &str, data: &str) -> io::Result<()> {
        self.close_start()?;
        if data.is_empty() {
            write!(self.out, "<?{target}?>")
        } else {
            write!(self.out, "<?{target} {data}?>")
        }
    }

    fn write_entity_ref(&mut self, name: &str) -> io::Result<()> {
        self.close_start()?;
        write!(self.out, "&{name};")
    }
}

/// Escapes character data: `&`, `<`, `>`, and `\r` (which would otherwise
/// be normalized away on reading).
#[must_use]
pub fn escape_text(text: &str) -> Cow<'_, str> {
    escape(text, |c| match c {
        '&' => Some("&amp;"),
        '<' => Some("&lt;"),
        '>' => Some("&gt;"),
        '\r' => Some("&#13;"),
        _ => None,
    })
}

/// Escapes a double-quoted attribute value. Whitespace other than spaces is
/// written as character references so it survives normalization.
#[must_use]
pub fn escape_attribute(value: &str) -> Cow<'_, str> {
    escape(value, |c| match c {
        '&' => Some("&amp;"),
        '<' => Some("&lt;"),
        '>' => Some("&gt;"),
        '"' => Some("&quot;"),
        '\t' => Some("&#9;"),
        '\n' => Some("&#10;"),
        '\r' => Some("&#13;"),
        _ => None,
    })
}

fn escape(text: &str, replacement: impl Fn(char) -> Option<&'static str>) -> Cow<'_, str> {
    let Some(first) = text.find(|c| replacement(c).is_some()) else {
        return Cow::Borrowed(text);
    };
    let mut out = String::with_capacity(text.len() + 8);
    out.push_str(&text[..first]);
    for c in text[first..].chars() {
        match replacement(c) {
            Some(escaped) => out.push_str(escaped),
            None => out.push(c),
        }
    }
    Cow::Owned(out)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn written(f: impl FnOnce(&mut XmlWriter<Vec<u8>>) -> io::Result<()>) -> String {
        let mut writer = XmlWriter::new(Vec::new());
        f(&mut writer).unwrap();
        String::from_utf8(writer.into_inner()).unwrap()
    }

    #[test]
    fn test_escaping() {
        assert_eq!(escape_text("a < b & c > d\r"), "a &lt; b &amp; c &gt; d&#13;");
        assert_eq!(escape_attribute("say \"hi\"\n"), "say &quot;hi&quot;&#10;");
        assert!(matches!(escape_text("plain"), Cow::Borrowed(_)));
    }

    #[test]
    fn test_empty_and_nested_elements() {
        let out = written(|w| {
            w.write_start_element(&QName::local("a"))?;
            w.write_attribute(&QName::local("k"), "v")?;
            w.write_start_element(&QName::local("b"))?;
            w.write_end_element()?;
            w.write_characters("x")?;
            w.write_end_element()
        });
        assert_eq!(out, r#"<a k="v"><b/>x</a>"#);
    }

    #[test]
    fn test_declaration_doctype_and_misc() {
        let out = written(|w| {
            w.write_start_document(&XmlDeclaration {
                version: Some("1.0".to_string()),
                encoding: Some("UTF-8".to_string()),
                standalone: Some(true),
            })?;
            w.write_doctype(&DocTypeDecl {
                name: "a".to_string(),
                system_id: Some("a.dtd".to_string()),
                ..DocTypeDecl::default()
            })?;
            w.write_start_element(&QName::local("a"))?;
            w.write_cdata("x]]>y")?;
            w.write_comment(" c ")?;
            w.write_pi("t", "")?;
            w.write_entity_ref("ent")?;
            w.write_end_element()
        });
        assert_eq!(
            out,
            "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?><!DOCTYPE a SYSTEM \"a.dtd\">\
             <a><![CDATA[x]]]]><![CDATA[>y]]><!-- c --><?t?>&ent;</a>"
        );
    }

    #[test]
    fn test_unbalanced_end_is_error() {
        let mut writer = XmlWriter::new(Vec::new());
        assert!(writer.write_end_element().is_err());
    }
}
