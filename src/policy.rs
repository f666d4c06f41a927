//! Protection policy inputs and per-part protection modes
//!
//! The policy is supplied by the binding and treated as immutable for the
//! duration of one message. Each message part's protection mode is
//! computed exactly once from the required-parts sets and the negotiated
//! protection order; the order is policy-wide, so one message never mixes
//! sign-then-encrypt and encrypt-then-sign parts.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// How a single message part is protected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectionMode {
    /// Written in plaintext, not referenced by the signature
    None,
    /// Signed only
    Sign,
    /// Encrypted only
    Encrypt,
    /// Hash the plaintext, then encrypt it
    SignThenEncrypt,
    /// Encrypt, then hash the ciphertext wrapper
    EncryptThenSign,
}

impl ProtectionMode {
    /// Whether this mode contributes a signature reference
    pub fn is_signed(self) -> bool {
        matches!(
            self,
            ProtectionMode::Sign | ProtectionMode::SignThenEncrypt | ProtectionMode::EncryptThenSign
        )
    }

    /// Whether this mode produces an encrypted element
    pub fn is_encrypted(self) -> bool {
        matches!(
            self,
            ProtectionMode::Encrypt
                | ProtectionMode::SignThenEncrypt
                | ProtectionMode::EncryptThenSign
        )
    }
}

/// A set of message parts: header local names plus the body flag
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePartSet {
    /// Header local names in the set
    #[serde(default)]
    pub header_names: BTreeSet<String>,
    /// Whether the body is in the set
    #[serde(default)]
    pub include_body: bool,
}

impl MessagePartSet {
    /// The empty part set
    pub fn none() -> Self {
        Self::default()
    }

    /// A part set covering the body only
    pub fn body_only() -> Self {
        MessagePartSet {
            header_names: BTreeSet::new(),
            include_body: true,
        }
    }

    /// Builder-style: add a header by local name
    #[must_use]
    pub fn with_header(mut self, local_name: impl Into<String>) -> Self {
        self.header_names.insert(local_name.into());
        self
    }

    /// Builder-style: include the body
    #[must_use]
    pub fn with_body(mut self) -> Self {
        self.include_body = true;
        self
    }

    /// Whether a header with this local name is in the set
    pub fn contains_header(&self, local_name: &str) -> bool {
        self.header_names.contains(local_name)
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.header_names.is_empty() && !self.include_body
    }
}

/// Security policy inputs for one message, immutable during processing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectionPolicy {
    /// Parts that must be covered by the primary signature
    pub signed_parts: MessagePartSet,
    /// Parts that must be encrypted
    pub encrypted_parts: MessagePartSet,
    /// Negotiated order: true = encrypt-then-sign, false = sign-then-encrypt
    pub encrypt_before_sign: bool,
    /// Whether the primary token element must itself be signed
    pub protect_primary_token: bool,
    /// Whether full message protection is required at all
    pub require_message_protection: bool,
    /// Sign the destination header even when message protection is off
    pub sign_destination_header: bool,
    /// Local name of the destination header (usually `To`)
    pub destination_header_name: String,
}

impl Default for ProtectionPolicy {
    fn default() -> Self {
        ProtectionPolicy {
            signed_parts: MessagePartSet::body_only(),
            encrypted_parts: MessagePartSet::body_only(),
            encrypt_before_sign: false,
            protect_primary_token: false,
            require_message_protection: true,
            sign_destination_header: false,
            destination_header_name: "To".to_string(),
        }
    }
}

impl ProtectionPolicy {
    fn combine(&self, signed: bool, encrypted: bool) -> ProtectionMode {
        match (signed, encrypted) {
            (false, false) => ProtectionMode::None,
            (true, false) => ProtectionMode::Sign,
            (false, true) => ProtectionMode::Encrypt,
            (true, true) => {
                if self.encrypt_before_sign {
                    ProtectionMode::EncryptThenSign
                } else {
                    ProtectionMode::SignThenEncrypt
                }
            }
        }
    }

    /// Protection mode for a header, by local name
    pub fn mode_for_header(&self, local_name: &str) -> ProtectionMode {
        self.combine(
            self.signed_parts.contains_header(local_name),
            self.encrypted_parts.contains_header(local_name),
        )
    }

    /// Protection mode for the body
    pub fn mode_for_body(&self) -> ProtectionMode {
        self.combine(
            self.signed_parts.include_body,
            self.encrypted_parts.include_body,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modes_follow_part_sets_and_order() {
        let policy = ProtectionPolicy {
            signed_parts: MessagePartSet::body_only().with_header("To"),
            encrypted_parts: MessagePartSet::body_only().with_header("Session"),
            ..ProtectionPolicy::default()
        };

        assert_eq!(policy.mode_for_header("To"), ProtectionMode::Sign);
        assert_eq!(policy.mode_for_header("Session"), ProtectionMode::Encrypt);
        assert_eq!(policy.mode_for_header("Action"), ProtectionMode::None);
        assert_eq!(policy.mode_for_body(), ProtectionMode::SignThenEncrypt);

        let policy = ProtectionPolicy {
            encrypt_before_sign: true,
            ..policy
        };
        assert_eq!(policy.mode_for_body(), ProtectionMode::EncryptThenSign);
    }

    #[test]
    fn mode_predicates() {
        assert!(ProtectionMode::Sign.is_signed());
        assert!(!ProtectionMode::Sign.is_encrypted());
        assert!(ProtectionMode::SignThenEncrypt.is_signed());
        assert!(ProtectionMode::SignThenEncrypt.is_encrypted());
        assert!(!ProtectionMode::None.is_signed());
    }

    #[test]
    fn part_set_serde_round_trip() {
        let set = MessagePartSet::body_only().with_header("To").with_header("Action");
        let json = serde_json::to_string(&set).unwrap();
        let back: MessagePartSet = serde_json::from_str(&json).unwrap();
        assert_eq!(set, back);
    }
}
