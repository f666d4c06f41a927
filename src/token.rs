//! Security tokens, the resolver contract, and the serializer chain
//!
//! This core never interprets concrete token wire formats beyond one
//! built-in symmetric format; everything else goes through the
//! [`TokenFormat`] registry, where the first handler whose capability
//! predicate matches an element takes over entirely.

use crate::error::SecurityError;
use crate::xml::{XmlElement, ID_ATTR};
use std::sync::Arc;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Symmetric key material that zeroizes on drop.
///
/// Length varies by suite (16/24/32 bytes), so this wraps a vector rather
/// than a fixed array.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey(Vec<u8>);

impl SymmetricKey {
    /// Wrap raw key bytes
    pub fn new(bytes: Vec<u8>) -> Self {
        SymmetricKey(bytes)
    }

    /// Borrow the key bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Key length in bits
    pub fn bits(&self) -> u32 {
        (self.0.len() * 8) as u32
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never print key material
        write!(f, "SymmetricKey({} bits)", self.bits())
    }
}

/// A resolved security token: a stable identifier plus optional symmetric
/// key material. Asymmetric tokens carry no inline key here; their formats
/// are external collaborators.
#[derive(Debug, Clone)]
pub struct SecurityToken {
    id: String,
    key: Option<SymmetricKey>,
}

impl SecurityToken {
    /// Create a symmetric token
    pub fn symmetric(id: impl Into<String>, key: Vec<u8>) -> Self {
        SecurityToken {
            id: id.into(),
            key: Some(SymmetricKey::new(key)),
        }
    }

    /// Create a key-less token stub; the key must be resolved out of band
    pub fn reference(id: impl Into<String>) -> Self {
        SecurityToken {
            id: id.into(),
            key: None,
        }
    }

    /// The token's stable identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The token's symmetric key, if any
    pub fn key(&self) -> Option<&SymmetricKey> {
        self.key.as_ref()
    }

    /// The symmetric key length in bits, if key material is present
    pub fn key_bits(&self) -> Option<u32> {
        self.key.as_ref().map(SymmetricKey::bits)
    }
}

/// A key-identifier clause inside a security token reference
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyIdentifier {
    /// Reference by local identifier (`URI="#id"`)
    LocalId(String),
}

impl KeyIdentifier {
    /// Parse a reference URI (`#id`) into a clause
    pub fn from_uri(uri: &str) -> Result<Self, SecurityError> {
        match uri.strip_prefix('#') {
            Some(id) if !id.is_empty() => Ok(KeyIdentifier::LocalId(id.to_string())),
            _ => Err(SecurityError::Format(format!(
                "unsupported reference URI: {uri}"
            ))),
        }
    }

    /// The referenced local identifier
    pub fn local_id(&self) -> &str {
        match self {
            KeyIdentifier::LocalId(id) => id,
        }
    }
}

/// Token lookup: the core distinguishes exactly two outcomes, found and
/// not-found. An unresolved identifier is never partially trusted.
pub trait TokenResolver: Send + Sync {
    /// Resolve a key-identifier clause to a token, if known
    fn try_resolve(&self, clause: &KeyIdentifier) -> Option<Arc<SecurityToken>>;
}

/// In-memory resolver used for session tokens and tests
#[derive(Default)]
pub struct TokenCatalog {
    tokens: Vec<Arc<SecurityToken>>,
}

impl TokenCatalog {
    /// Create an empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a token
    pub fn add(&mut self, token: Arc<SecurityToken>) {
        self.tokens.push(token);
    }
}

impl TokenResolver for TokenCatalog {
    fn try_resolve(&self, clause: &KeyIdentifier) -> Option<Arc<SecurityToken>> {
        let id = clause.local_id();
        self.tokens.iter().find(|t| t.id() == id).cloned()
    }
}

/// A token wire-format handler: a capability predicate plus read/write.
/// The engine selects the first matching handler and delegates entirely.
pub trait TokenFormat: Send + Sync {
    /// Can this handler read the given element?
    fn can_read(&self, element: &XmlElement) -> bool;

    /// Deserialize the element into a token
    fn read(&self, element: &XmlElement) -> Result<SecurityToken, SecurityError>;

    /// Serialize a token into its wire element
    fn write(&self, token: &SecurityToken) -> Result<XmlElement, SecurityError>;
}

/// Ordered set of token-format handlers
pub struct TokenSerializerChain {
    formats: Vec<Box<dyn TokenFormat>>,
}

impl TokenSerializerChain {
    /// A chain containing only the built-in session token format
    pub fn with_defaults() -> Self {
        TokenSerializerChain {
            formats: vec![Box::new(SessionTokenFormat)],
        }
    }

    /// Append a handler to the chain
    pub fn push(&mut self, format: Box<dyn TokenFormat>) {
        self.formats.push(format);
    }

    /// Whether any handler can read the element
    pub fn can_read(&self, element: &XmlElement) -> bool {
        self.formats.iter().any(|f| f.can_read(element))
    }

    /// Read the element with the first matching handler
    pub fn read(&self, element: &XmlElement) -> Result<SecurityToken, SecurityError> {
        for format in &self.formats {
            if format.can_read(element) {
                return format.read(element);
            }
        }
        Err(SecurityError::Format(format!(
            "no token format can read element {}",
            element.name
        )))
    }

    /// Write the token with the first handler that accepts it
    pub fn write(&self, token: &SecurityToken) -> Result<XmlElement, SecurityError> {
        self.formats
            .first()
            .ok_or_else(|| SecurityError::Format("empty token serializer chain".to_string()))?
            .write(token)
    }
}

/// Built-in session token format: a `wsc:SecurityContextToken` carrying
/// only the context identifier. Key material is never written to the
/// wire; the receive side resolves it through its [`TokenResolver`].
pub struct SessionTokenFormat;

impl TokenFormat for SessionTokenFormat {
    fn can_read(&self, element: &XmlElement) -> bool {
        element.local_name() == "SecurityContextToken"
    }

    fn read(&self, element: &XmlElement) -> Result<SecurityToken, SecurityError> {
        let id = element
            .id()
            .ok_or_else(|| {
                SecurityError::Format("SecurityContextToken is missing wsu:Id".to_string())
            })?
            .to_string();
        let identifier = element
            .find_child("Identifier")
            .map(|el| el.text())
            .ok_or_else(|| {
                SecurityError::Format("SecurityContextToken is missing Identifier".to_string())
            })?;
        if identifier.trim() != id {
            return Err(SecurityError::Format(
                "SecurityContextToken identifier does not match its id".to_string(),
            ));
        }
        // a stub: key material comes from the resolver, never the wire
        Ok(SecurityToken::reference(id))
    }

    fn write(&self, token: &SecurityToken) -> Result<XmlElement, SecurityError> {
        Ok(XmlElement::new("wsc:SecurityContextToken")
            .with_attr(ID_ATTR, token.id())
            .with_child(XmlElement::new("wsc:Identifier").with_text(token.id())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

    #[test]
    fn symmetric_key_reports_bits() {
        let key = SymmetricKey::new(vec![0u8; 32]);
        assert_eq!(key.bits(), 256);
        assert!(!format!("{key:?}").contains("0, 0"));
    }

    #[test]
    fn key_identifier_parses_fragment_uris() {
        let clause = KeyIdentifier::from_uri("#tok-1").unwrap();
        assert_eq!(clause.local_id(), "tok-1");
        assert!(KeyIdentifier::from_uri("http://elsewhere").is_err());
        assert!(KeyIdentifier::from_uri("#").is_err());
    }

    #[test]
    fn catalog_resolves_known_tokens_only() {
        let mut catalog = TokenCatalog::new();
        catalog.add(Arc::new(SecurityToken::symmetric("tok-1", vec![7u8; 16])));

        assert!(catalog
            .try_resolve(&KeyIdentifier::LocalId("tok-1".to_string()))
            .is_some());
        assert!(catalog
            .try_resolve(&KeyIdentifier::LocalId("tok-2".to_string()))
            .is_none());
    }

    #[test]
    fn session_token_format_never_writes_key_material() {
        let chain = TokenSerializerChain::with_defaults();
        let token = SecurityToken::symmetric("tok-9", vec![42u8; 24]);

        let element = chain.write(&token).unwrap();
        assert!(chain.can_read(&element));
        let wire = String::from_utf8(element.canonical_bytes()).unwrap();
        assert!(!wire.contains(&BASE64.encode([42u8; 24])));

        // reading back yields a stub; the key comes from the resolver
        let read_back = chain.read(&element).unwrap();
        assert_eq!(read_back.id(), "tok-9");
        assert!(read_back.key().is_none());
    }

    #[test]
    fn session_token_identifier_must_match_id() {
        let chain = TokenSerializerChain::with_defaults();
        let element = XmlElement::new("wsc:SecurityContextToken")
            .with_attr("wsu:Id", "tok-1")
            .with_child(XmlElement::new("wsc:Identifier").with_text("tok-2"));
        assert!(chain.read(&element).unwrap_err().is_format_error());
    }

    #[test]
    fn chain_rejects_unknown_elements() {
        let chain = TokenSerializerChain::with_defaults();
        let element = XmlElement::new("saml:Assertion");
        assert!(!chain.can_read(&element));
        assert!(chain.read(&element).unwrap_err().is_format_error());
    }
}
