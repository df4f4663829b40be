//! A sink that records tokens.

use std::io;

use crate::blob::BinaryPayload;
use crate::serial::Sink;
use crate::token::{DocTypeDecl, NamespaceBinding, QName, StartTag, Token, TokenAttribute, XmlDeclaration};

/// Collects everything written to it as [`Token`]s. Binary content is kept
/// as a [`Token::Binary`] referencing the same blob.
#[derive(Debug, Clone, Default)]
pub struct TokenCollector {
    tokens: Vec<Token>,
}

impl TokenCollector {
    #[must_use]
    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    #[must_use]
    pub fn into_tokens(self) -> Vec<Token> {
        self.tokens
    }

    fn open_tag(&mut self) -> io::Result<&mut StartTag> {
        match self.tokens.last_mut() {
            Some(Token::StartElement(tag)) => Ok(tag),
            _ => Err(io::Error::new(io::ErrorKind::InvalidInput, "no start tag is open")),
        }
    }
}

impl Sink for TokenCollector {
    fn write_start_document(&mut self, declaration: &XmlDeclaration) -> io::Result<()> {
        self.tokens.push(Token::StartDocument(declaration.clone()));
        Ok(())
    }

    fn write_end_document(&mut self) -> io::Result<()> {
        self.tokens.push(Token::EndDocument);
        Ok(())
    }

    fn write_doctype(&mut self, doctype: &DocTypeDecl) -> io::Result<()> {
        self.tokens.push(Token::DocType(doctype.clone()));
        Ok(())
    }

    fn write_start_element(&mut self, name: &QName) -> io::Result<()> {
        self.tokens.push(Token::StartElement(StartTag::new(name.clone())));
        Ok(())
    }

    fn write_namespace_decl(&mut self, prefix: &str, uri: &str) -> io::Result<()> {
        self.open_tag()?.namespaces.push(NamespaceBinding::new(prefix, uri));
        Ok(())
    }

    fn write_attribute(&mut self, name: &QName, value: &str) -> io::Result<()> {
        self.open_tag()?.attributes.push(TokenAttribute {
            name: name.clone(),
            value: value.to_string(),
        });
        Ok(())
    }

    fn write_end_element(&mut self) -> io::Result<()> {
        self.tokens.push(Token::EndElement);
        Ok(())
    }

    fn write_characters(&mut self, text: &str) -> io::Result<()> {
        // Chunked writers (base64) arrive as several calls.
        if let Some(Token::Characters(last)) = self.tokens.last_mut() {
            last.push_str(text);
        } else {
            self.tokens.push(Token::Characters(text.to_string()));
        }
        Ok(())
    }

    fn write_cdata(&mut self, text: &str) -> io::Result<()> {
        self.tokens.push(Token::CData(text.to_string()));
        Ok(())
    }

    fn write_comment(&mut self, text: &str) -> io::Result<()> {
        self.tokens.push(Token::Comment(text.to_string()));
        Ok(())
    }

    fn write_pi(&mut self, target: &str, data: &str) -> io::Result<()> {
        self.tokens.push(Token::ProcessingInstruction {
            target: target.to_string(),
            data: data.to_string(),
        });
        Ok(())
    }

    fn write_entity_ref(&mut self, name: &str) -> io::Result<()> {
        self.tokens.push(Token::EntityReference {
            name: name.to_string(),
            replacement: None,
        });
        Ok(())
    }

    fn write_binary(&mut self, payload: &BinaryPayload) -> io::Result<()> {
        self.tokens.push(Token::Binary(payload.clone()));
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_declarations_attach_to_open_tag() {
        let mut collector = TokenCollector::default();
        collector.write_start_element(&QName::local("a")).unwrap();
        collector.write_namespace_decl("p", "urn:p").unwrap();
        collector.write_attribute(&QName::local("k"), "v").unwrap();
        collector.write_characters("x").unwrap();
        collector.write_characters("y").unwrap();
        assert!(collector.write_attribute(&QName::local("late"), "v").is_err());
        collector.write_end_element().unwrap();
        let tokens = collector.into_tokens();
        assert_eq!(tokens.len(), 3);
        let Token::StartElement(tag) = &tokens[0] else {
            panic!("expected a start tag");
        };
        assert_eq!(tag.namespaces.len(), 1);
        assert_eq!(tag.attributes[0].value, "v");
        assert_eq!(tokens[1], Token::Characters("xy".to_string()));
    }
}
