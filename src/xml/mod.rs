// src/xml/mod.rs
//! Owned XML element tree used for repository documents and the wire format
//!
//! Repository documents (groups, clients, bundles, rules) are small and
//! structural, so they are parsed eagerly into an owned [`Element`] tree via
//! quick-xml events. Serialization is canonical: attributes are written in
//! lexicographic order, making repeated serializations of the same tree
//! byte-identical. That property is what makes configuration determinism
//! directly testable.

mod include;

pub use include::load_with_includes;

use crate::error::{Error, Result};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::fmt;
use std::path::Path;

/// A single XML element: tag name, attributes, direct text, children.
///
/// Attribute insertion order is preserved for inspection, but canonical
/// serialization sorts by attribute name.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Element {
    pub name: String,
    attrs: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<Element>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Builder-style attribute setter
    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(name, value);
        self
    }

    /// Builder-style text setter
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    /// Builder-style child appender
    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(child);
        self
    }

    /// Look up an attribute value
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Set or replace an attribute
    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        if let Some(slot) = self.attrs.iter_mut().find(|(k, _)| *k == name) {
            slot.1 = value;
        } else {
            self.attrs.push((name, value));
        }
    }

    /// Remove an attribute, returning its previous value
    pub fn remove_attr(&mut self, name: &str) -> Option<String> {
        let idx = self.attrs.iter().position(|(k, _)| k == name)?;
        Some(self.attrs.remove(idx).1)
    }

    pub fn has_attr(&self, name: &str) -> bool {
        self.attr(name).is_some()
    }

    /// Boolean attribute: `"true"` (case-insensitive) is true, anything else false
    pub fn bool_attr(&self, name: &str) -> bool {
        self.attr(name)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    /// All attributes in insertion order
    pub fn attrs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attrs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Children with the given tag name
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// First child with the given tag name
    pub fn first_child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Local part of the tag name (`xi:include` -> `include`)
    pub fn local_name(&self) -> &str {
        self.name.rsplit(':').next().unwrap_or(&self.name)
    }

    /// Parse a complete document from a string; returns the root element
    pub fn parse(input: &str) -> Result<Element> {
        let mut reader = Reader::from_str(input);

        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;

        loop {
            match reader.read_event()? {
                Event::Start(start) => {
                    stack.push(element_from_start(&start)?);
                }
                Event::Empty(start) => {
                    let elem = element_from_start(&start)?;
                    attach(&mut stack, &mut root, elem)?;
                }
                Event::End(_) => {
                    let elem = stack
                        .pop()
                        .ok_or_else(|| Error::Xml("unbalanced end tag".to_string()))?;
                    attach(&mut stack, &mut root, elem)?;
                }
                Event::Text(text) => {
                    let text = text.unescape()?;
                    // Inter-element indentation carries no data
                    if !text.trim().is_empty() {
                        if let Some(parent) = stack.last_mut() {
                            parent.text.push_str(&text);
                        }
                    }
                }
                Event::CData(data) => {
                    if let Some(parent) = stack.last_mut() {
                        parent
                            .text
                            .push_str(&String::from_utf8_lossy(&data.into_inner()));
                    }
                }
                Event::Eof => break,
                // Declarations, comments and PIs carry no configuration data
                _ => {}
            }
        }

        if !stack.is_empty() {
            return Err(Error::Xml("unterminated element".to_string()));
        }
        root.ok_or_else(|| Error::Xml("document has no root element".to_string()))
    }

    /// Parse a document from a file
    pub fn parse_file(path: &Path) -> Result<Element> {
        let data = std::fs::read_to_string(path).map_err(|e| Error::RepoLoad {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Element::parse(&data).map_err(|e| Error::RepoLoad {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Canonical serialization without an XML declaration
    pub fn to_xml(&self) -> String {
        let mut writer = Writer::new(Vec::new());
        self.write_into(&mut writer)
            .expect("in-memory XML serialization cannot fail");
        String::from_utf8(writer.into_inner()).expect("serializer emits UTF-8")
    }

    /// Canonical serialization as a standalone document
    pub fn to_document(&self) -> String {
        let mut writer = Writer::new(Vec::new());
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .expect("in-memory XML serialization cannot fail");
        self.write_into(&mut writer)
            .expect("in-memory XML serialization cannot fail");
        String::from_utf8(writer.into_inner()).expect("serializer emits UTF-8")
    }

    fn write_into(&self, writer: &mut Writer<Vec<u8>>) -> quick_xml::Result<()> {
        let mut start = BytesStart::new(self.name.as_str());
        let mut attrs: Vec<&(String, String)> = self.attrs.iter().collect();
        attrs.sort_by(|a, b| a.0.cmp(&b.0));
        for (k, v) in attrs {
            start.push_attribute((k.as_str(), v.as_str()));
        }

        if self.text.is_empty() && self.children.is_empty() {
            writer.write_event(Event::Empty(start))?;
            return Ok(());
        }

        writer.write_event(Event::Start(start))?;
        if !self.text.is_empty() {
            writer.write_event(Event::Text(BytesText::new(&self.text)))?;
        }
        for child in &self.children {
            child.write_into(writer)?;
        }
        writer.write_event(Event::End(BytesEnd::new(self.name.as_str())))?;
        Ok(())
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_xml())
    }
}

fn element_from_start(start: &BytesStart<'_>) -> Result<Element> {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut elem = Element::new(name);
    for attr in start.attributes() {
        let attr = attr.map_err(|e| Error::Xml(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| Error::Xml(e.to_string()))?
            .into_owned();
        elem.attrs.push((key, value));
    }
    Ok(elem)
}

fn attach(stack: &mut [Element], root: &mut Option<Element>, elem: Element) -> Result<()> {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(elem);
    } else if root.is_none() {
        *root = Some(elem);
    } else {
        return Err(Error::Xml("multiple root elements".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic() {
        let doc = Element::parse(
            r#"<Groups version="3.0">
                 <Group name="web" profile="true">
                   <Bundle name="nginx"/>
                 </Group>
               </Groups>"#,
        )
        .unwrap();

        assert_eq!(doc.name, "Groups");
        assert_eq!(doc.attr("version"), Some("3.0"));
        let group = doc.first_child("Group").unwrap();
        assert!(group.bool_attr("profile"));
        assert_eq!(
            group.first_child("Bundle").unwrap().attr("name"),
            Some("nginx")
        );
    }

    #[test]
    fn test_text_and_escaping() {
        let doc = Element::parse("<probe name=\"os\">cat /etc/os-release &amp;&amp; true</probe>")
            .unwrap();
        assert_eq!(doc.text, "cat /etc/os-release && true");

        // Round-trips with escaping restored
        let out = doc.to_xml();
        assert!(out.contains("&amp;&amp;"));
        assert_eq!(Element::parse(&out).unwrap(), doc);
    }

    #[test]
    fn test_canonical_attribute_order() {
        let a = Element::new("Path")
            .with_attr("owner", "root")
            .with_attr("name", "/etc/motd");
        let b = Element::new("Path")
            .with_attr("name", "/etc/motd")
            .with_attr("owner", "root");
        assert_eq!(a.to_xml(), b.to_xml());
        assert_eq!(a.to_xml(), r#"<Path name="/etc/motd" owner="root"/>"#);
    }

    #[test]
    fn test_reject_malformed() {
        assert!(Element::parse("<a><b></a>").is_err());
        assert!(Element::parse("").is_err());
    }

    #[test]
    fn test_local_name() {
        let elem = Element::new("xi:include");
        assert_eq!(elem.local_name(), "include");
        assert_eq!(Element::new("Group").local_name(), "Group");
    }

    #[test]
    fn test_bool_attr_default() {
        let elem = Element::new("Group").with_attr("negate", "TRUE");
        assert!(elem.bool_attr("negate"));
        assert!(!elem.bool_attr("public"));
    }
}
