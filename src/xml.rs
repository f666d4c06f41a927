//! XML infoset and canonical serialization.
//!
//! Parsing uses quick-xml, which is safe against XXE by default (entities
//! are not expanded); DOCTYPE and processing instructions are rejected
//! outright as format errors. Parsed documents become a small owned tree
//! that the send and receive pipelines digest, encrypt, and splice.
//!
//! Serialization is canonical: attributes sorted by name, text trimmed,
//! no insignificant whitespace, minimal escaping. Two semantically equal
//! trees always serialize to identical bytes, which is what makes digest
//! recomputation on the receive side exact.

use crate::error::SecurityError;
use quick_xml::events::Event;
use quick_xml::Reader;

/// The attribute carrying a targettable identifier.
pub const ID_ATTR: &str = "wsu:Id";

/// A node inside an element: nested element or character data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XmlNode {
    /// A nested element
    Element(XmlElement),
    /// Character data (CDATA is folded into text)
    Text(String),
}

/// An owned XML element: qualified name, attributes in document order,
/// children in document order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlElement {
    /// Qualified name as written, e.g. `wsse:Security`
    pub name: String,
    /// (name, value) pairs in document order
    pub attributes: Vec<(String, String)>,
    /// Child nodes in document order
    pub children: Vec<XmlNode>,
}

impl XmlElement {
    /// Create an empty element with the given qualified name
    pub fn new(name: impl Into<String>) -> Self {
        XmlElement {
            name: name.into(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Builder-style: add an attribute
    #[must_use]
    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(name, value);
        self
    }

    /// Builder-style: append a child element
    #[must_use]
    pub fn with_child(mut self, child: XmlElement) -> Self {
        self.children.push(XmlNode::Element(child));
        self
    }

    /// Builder-style: append a text node
    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.children.push(XmlNode::Text(text.into()));
        self
    }

    /// The local part of the qualified name
    pub fn local_name(&self) -> &str {
        match self.name.rsplit_once(':') {
            Some((_, local)) => local,
            None => &self.name,
        }
    }

    /// Look up an attribute by exact name
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Set (or replace) an attribute
    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        if let Some(slot) = self.attributes.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value;
        } else {
            self.attributes.push((name, value));
        }
    }

    /// The element's targettable identifier (`wsu:Id`, falling back to `Id`)
    pub fn id(&self) -> Option<&str> {
        self.attr(ID_ATTR).or_else(|| self.attr("Id"))
    }

    /// Assign the element's targettable identifier
    pub fn set_id(&mut self, id: impl Into<String>) {
        self.set_attr(ID_ATTR, id);
    }

    /// Iterate child elements, skipping text nodes
    pub fn child_elements(&self) -> impl Iterator<Item = &XmlElement> {
        self.children.iter().filter_map(|node| match node {
            XmlNode::Element(el) => Some(el),
            XmlNode::Text(_) => None,
        })
    }

    /// First child element with the given local name
    pub fn find_child(&self, local: &str) -> Option<&XmlElement> {
        self.child_elements().find(|el| el.local_name() == local)
    }

    /// Concatenated direct text content
    pub fn text(&self) -> String {
        let mut out = String::new();
        for node in &self.children {
            if let XmlNode::Text(text) = node {
                out.push_str(text);
            }
        }
        out
    }

    /// Parse a single-rooted document from raw bytes.
    ///
    /// DOCTYPE and processing instructions abort with a format error;
    /// comments are dropped.
    pub fn parse(data: &[u8]) -> Result<XmlElement, SecurityError> {
        let mut reader = Reader::from_reader(data);
        reader.config_mut().trim_text(true);

        let mut stack: Vec<XmlElement> = Vec::new();
        let mut root: Option<XmlElement> = None;
        let mut buf = Vec::new();

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(ref e)) => {
                    if root.is_some() && stack.is_empty() {
                        return Err(SecurityError::Format(
                            "multiple root elements".to_string(),
                        ));
                    }
                    stack.push(read_element_start(e)?);
                }
                Ok(Event::Empty(ref e)) => {
                    let element = read_element_start(e)?;
                    attach(&mut stack, &mut root, element)?;
                }
                Ok(Event::End(_)) => {
                    let element = stack.pop().ok_or_else(|| {
                        SecurityError::Format("unbalanced end tag".to_string())
                    })?;
                    attach(&mut stack, &mut root, element)?;
                }
                Ok(Event::Text(ref t)) => {
                    let text = t
                        .unescape()
                        .map_err(|e| SecurityError::Format(format!("invalid text: {e}")))?;
                    if let Some(top) = stack.last_mut() {
                        top.children.push(XmlNode::Text(text.into_owned()));
                    }
                }
                Ok(Event::CData(ref t)) => {
                    let text = String::from_utf8(t.to_vec()).map_err(|_| {
                        SecurityError::Format("CDATA is not valid UTF-8".to_string())
                    })?;
                    if let Some(top) = stack.last_mut() {
                        top.children.push(XmlNode::Text(text));
                    }
                }
                Ok(Event::DocType(_)) => {
                    return Err(SecurityError::Format("DOCTYPE is not allowed".to_string()));
                }
                Ok(Event::PI(_)) => {
                    return Err(SecurityError::Format(
                        "processing instructions are not allowed".to_string(),
                    ));
                }
                Ok(Event::Decl(_)) | Ok(Event::Comment(_)) => {}
                Ok(Event::Eof) => break,
                Err(e) => return Err(SecurityError::Format(format!("XML parse error: {e}"))),
            }
            buf.clear();
        }

        if !stack.is_empty() {
            return Err(SecurityError::Format("unclosed element".to_string()));
        }
        root.ok_or_else(|| SecurityError::Format("empty document".to_string()))
    }

    /// Canonical serialization of this element and its subtree.
    ///
    /// Attributes are emitted sorted by name, text nodes trimmed, empty
    /// elements written as start/end pairs. Since the parser also trims
    /// text, `parse(canonical_bytes(x))` reproduces `x` for any tree this
    /// crate emits.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        self.write_canonical(&mut out);
        out
    }

    /// Canonicalize into a caller-owned buffer, clearing it first.
    /// Lets per-message pipelines reset one buffer between parts instead
    /// of reallocating.
    pub fn canonical_into(&self, out: &mut Vec<u8>) {
        out.clear();
        self.write_canonical(out);
    }

    fn write_canonical(&self, out: &mut Vec<u8>) {
        out.push(b'<');
        out.extend_from_slice(self.name.as_bytes());

        let mut attrs: Vec<&(String, String)> = self.attributes.iter().collect();
        attrs.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, value) in attrs {
            out.push(b' ');
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b"=\"");
            escape_into(value, true, out);
            out.push(b'"');
        }
        out.push(b'>');

        for child in &self.children {
            match child {
                XmlNode::Element(el) => el.write_canonical(out),
                XmlNode::Text(text) => {
                    let trimmed = text.trim();
                    if !trimmed.is_empty() {
                        escape_into(trimmed, false, out);
                    }
                }
            }
        }

        out.extend_from_slice(b"</");
        out.extend_from_slice(self.name.as_bytes());
        out.push(b'>');
    }
}

fn read_element_start(
    e: &quick_xml::events::BytesStart<'_>,
) -> Result<XmlElement, SecurityError> {
    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let mut element = XmlElement::new(name);
    for attr in e.attributes() {
        let attr = attr.map_err(|e| SecurityError::Format(format!("bad attribute: {e}")))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| SecurityError::Format(format!("bad attribute value: {e}")))?
            .into_owned();
        element.attributes.push((key, value));
    }
    Ok(element)
}

fn attach(
    stack: &mut [XmlElement],
    root: &mut Option<XmlElement>,
    element: XmlElement,
) -> Result<(), SecurityError> {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(XmlNode::Element(element));
    } else {
        if root.is_some() {
            return Err(SecurityError::Format("multiple root elements".to_string()));
        }
        *root = Some(element);
    }
    Ok(())
}

fn escape_into(value: &str, in_attribute: bool, out: &mut Vec<u8>) {
    for byte in value.bytes() {
        match byte {
            b'&' => out.extend_from_slice(b"&amp;"),
            b'<' => out.extend_from_slice(b"&lt;"),
            b'>' => out.extend_from_slice(b"&gt;"),
            b'"' if in_attribute => out.extend_from_slice(b"&quot;"),
            b'\'' if in_attribute => out.extend_from_slice(b"&apos;"),
            _ => out.push(byte),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_roundtrips_canonical_form() {
        let element = XmlElement::new("wsse:Security")
            .with_attr("wsu:Id", "sec-1")
            .with_child(
                XmlElement::new("wsu:Timestamp")
                    .with_child(XmlElement::new("wsu:Created").with_text("2024-01-01T00:00:00Z")),
            );
        let bytes = element.canonical_bytes();
        let reparsed = XmlElement::parse(&bytes).unwrap();
        assert_eq!(element, reparsed);
        assert_eq!(bytes, reparsed.canonical_bytes());
    }

    #[test]
    fn canonical_bytes_sort_attributes() {
        let a = XmlElement::new("e").with_attr("z", "1").with_attr("a", "2");
        let b = XmlElement::new("e").with_attr("a", "2").with_attr("z", "1");
        assert_eq!(a.canonical_bytes(), b.canonical_bytes());
    }

    #[test]
    fn canonical_bytes_escape_content() {
        let el = XmlElement::new("e")
            .with_attr("a", "x\"<y")
            .with_text("a < b & c");
        let bytes = el.canonical_bytes();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.contains("&quot;"));
        assert!(text.contains("a &lt; b &amp; c"));
        let reparsed = XmlElement::parse(&bytes).unwrap();
        assert_eq!(reparsed.attr("a"), Some("x\"<y"));
        assert_eq!(reparsed.text(), "a < b & c");
    }

    #[test]
    fn doctype_rejected() {
        let err = XmlElement::parse(b"<!DOCTYPE foo [<!ENTITY x \"y\">]><e>&x;</e>").unwrap_err();
        assert!(err.is_format_error());
    }

    #[test]
    fn multiple_roots_rejected() {
        let err = XmlElement::parse(b"<a></a><b></b>").unwrap_err();
        assert!(err.is_format_error());
    }

    #[test]
    fn id_helpers_prefer_wsu_id() {
        let mut el = XmlElement::new("e").with_attr("Id", "plain");
        assert_eq!(el.id(), Some("plain"));
        el.set_id("wsu-id");
        assert_eq!(el.id(), Some("wsu-id"));
    }

    #[test]
    fn find_child_matches_local_name() {
        let el = XmlElement::new("parent")
            .with_child(XmlElement::new("ds:SignedInfo"))
            .with_child(XmlElement::new("ds:SignatureValue").with_text("abc"));
        assert!(el.find_child("SignedInfo").is_some());
        assert_eq!(el.find_child("SignatureValue").unwrap().text(), "abc");
        assert!(el.find_child("KeyInfo").is_none());
    }
}
