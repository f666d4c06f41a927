//! Message infoset: an ordered sequence of header elements plus one body
//!
//! Headers are addressed by 0-based index, can be re-read at random, and
//! support in-place replacement, which the receive path uses to splice
//! decrypted plaintext back where the encrypted wrapper stood.

use crate::xml::XmlElement;

/// An in-memory message: ordered headers and a single body element
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    headers: Vec<XmlElement>,
    body: XmlElement,
}

impl Message {
    /// Create a message from its headers (in order) and body
    pub fn new(headers: Vec<XmlElement>, body: XmlElement) -> Self {
        Message { headers, body }
    }

    /// Number of headers
    pub fn header_count(&self) -> usize {
        self.headers.len()
    }

    /// Read a header by index
    pub fn header(&self, index: usize) -> Option<&XmlElement> {
        self.headers.get(index)
    }

    /// Mutable access to a header by index
    pub fn header_mut(&mut self, index: usize) -> Option<&mut XmlElement> {
        self.headers.get_mut(index)
    }

    /// All headers, in order
    pub fn headers(&self) -> &[XmlElement] {
        &self.headers
    }

    /// Replace the header at `index`, returning the previous element.
    /// Replacement never reorders or removes headers.
    pub fn replace_header(&mut self, index: usize, element: XmlElement) -> Option<XmlElement> {
        let slot = self.headers.get_mut(index)?;
        Some(std::mem::replace(slot, element))
    }

    /// Insert a header at the front (used for the security header)
    pub fn push_front_header(&mut self, element: XmlElement) {
        self.headers.insert(0, element);
    }

    /// Remove the header at `index`
    pub fn remove_header(&mut self, index: usize) -> Option<XmlElement> {
        if index < self.headers.len() {
            Some(self.headers.remove(index))
        } else {
            None
        }
    }

    /// Position of the first header with the given local name
    pub fn find_header(&self, local_name: &str) -> Option<usize> {
        self.headers
            .iter()
            .position(|h| h.local_name() == local_name)
    }

    /// The body element
    pub fn body(&self) -> &XmlElement {
        &self.body
    }

    /// Mutable access to the body element
    pub fn body_mut(&mut self) -> &mut XmlElement {
        &mut self.body
    }

    /// Replace the body, returning the previous element
    pub fn replace_body(&mut self, element: XmlElement) -> XmlElement {
        std::mem::replace(&mut self.body, element)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Message {
        Message::new(
            vec![
                XmlElement::new("a:To").with_text("http://example.org/svc"),
                XmlElement::new("a:Action").with_text("urn:op"),
            ],
            XmlElement::new("s:Body").with_child(XmlElement::new("Echo").with_text("hi")),
        )
    }

    #[test]
    fn headers_keep_document_order() {
        let msg = sample();
        assert_eq!(msg.header_count(), 2);
        assert_eq!(msg.header(0).unwrap().local_name(), "To");
        assert_eq!(msg.header(1).unwrap().local_name(), "Action");
        assert_eq!(msg.find_header("Action"), Some(1));
        assert_eq!(msg.find_header("ReplyTo"), None);
    }

    #[test]
    fn replace_header_is_in_place() {
        let mut msg = sample();
        let old = msg
            .replace_header(0, XmlElement::new("a:To").with_text("decrypted"))
            .unwrap();
        assert_eq!(old.text(), "http://example.org/svc");
        assert_eq!(msg.header(0).unwrap().text(), "decrypted");
        assert_eq!(msg.header(1).unwrap().local_name(), "Action");
        assert!(msg.replace_header(5, XmlElement::new("x")).is_none());
    }

    #[test]
    fn body_replacement() {
        let mut msg = sample();
        let old = msg.replace_body(XmlElement::new("s:Body").with_text("cipher"));
        assert_eq!(old.local_name(), "Body");
        assert_eq!(msg.body().text(), "cipher");
    }
}
