//! Unified error type for the wssec public API
//!
//! Internal modules keep their domain-specific errors for precise handling.
//! This unified type is what the protect/verify pipeline surfaces to callers.
//!
//! Cryptographic failures are deliberately collapsed into one opaque
//! category: the `Display` output of [`SecurityError::MessageSecurity`]
//! never names the algorithm or operation that failed, so a peer probing
//! the fault channel cannot distinguish a digest mismatch from a key-unwrap
//! failure. The precise reason is kept on the variant for operator logs.

use thiserror::Error;

/// Unified error type for all message-security operations
///
/// # Error Categories
///
/// - **Format**: malformed XML or a missing mandatory sub-element; the
///   whole pass is aborted
/// - **MessageSecurity**: normalized cryptographic failure (digest
///   mismatch, decryption failure, unsupported algorithm mid-operation)
/// - **PolicyViolation**: a part the policy required to be protected was
///   not, or a singly-expected element occurred twice
/// - **IncompleteDecryption**: a reference-list entry was never consumed
///   by a successful decryption
/// - **WrongEncryptingToken**: an encrypted element's key resolved to a
///   token other than the expected wrapping token
/// - **SecurityNegotiation**: disallowed algorithm or key length under the
///   configured algorithm suite
/// - **LimitExceeded**: a resource bound (nonce/label length, derivation
///   offset, derived-key count) was exceeded before cryptographic work
#[derive(Debug, Error)]
pub enum SecurityError {
    /// Malformed security header or message XML
    #[error("Format error: {0}")]
    Format(String),

    /// Normalized message-security fault; the reason is not displayed
    #[error("Message security verification failed")]
    MessageSecurity {
        /// Internal diagnostic, emitted at debug level only
        reason: String,
    },

    /// A required part was not signed/encrypted, or a protection rule
    /// was violated by the message structure
    #[error("Security policy violation: {0}")]
    PolicyViolation(String),

    /// An advertised encrypted reference was never decrypted
    #[error("Encrypted reference {id} was never resolved by a decryption")]
    IncompleteDecryption {
        /// The reference-list identifier left pending
        id: String,
    },

    /// The encrypting token does not match the expected wrapping token
    #[error("Message was not encrypted with the required encrypting token")]
    WrongEncryptingToken,

    /// Algorithm or key length rejected by the algorithm suite
    #[error("Security negotiation error: {0}")]
    SecurityNegotiation(String),

    /// A configured resource bound was exceeded
    #[error("{what} exceeds the configured maximum ({got} > {max})")]
    LimitExceeded {
        /// What was bounded (label length, derivation offset, ...)
        what: &'static str,
        /// The configured maximum
        max: usize,
        /// The offending value
        got: usize,
    },
}

impl SecurityError {
    /// Normalize an internal cryptographic failure into the opaque
    /// message-security category, logging the precise reason.
    pub(crate) fn crypto(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        tracing::debug!(%reason, "cryptographic operation failed");
        SecurityError::MessageSecurity { reason }
    }

    /// Returns true for faults on the message-security channel
    /// (cryptographic failures and policy violations alike).
    pub fn is_security_fault(&self) -> bool {
        matches!(
            self,
            Self::MessageSecurity { .. }
                | Self::PolicyViolation(_)
                | Self::IncompleteDecryption { .. }
                | Self::WrongEncryptingToken
        )
    }

    /// Returns true if this is a format (parse) error
    pub fn is_format_error(&self) -> bool {
        matches!(self, Self::Format(_))
    }

    /// Returns true if this is a suite-policy (negotiation) fault
    pub fn is_negotiation_error(&self) -> bool {
        matches!(self, Self::SecurityNegotiation(_))
    }

    /// Returns true if a pre-crypto resource bound was violated
    pub fn is_limit_error(&self) -> bool {
        matches!(self, Self::LimitExceeded { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        let err = SecurityError::PolicyViolation("body was not signed".to_string());
        assert!(err.is_security_fault());
        assert!(!err.is_format_error());
        assert!(!err.is_negotiation_error());

        let err = SecurityError::Format("unexpected element".to_string());
        assert!(err.is_format_error());
        assert!(!err.is_security_fault());

        let err = SecurityError::LimitExceeded {
            what: "derivation offset",
            max: 64,
            got: 1024,
        };
        assert!(err.is_limit_error());
    }

    #[test]
    fn test_crypto_errors_display_without_detail() {
        let err = SecurityError::crypto("AES-GCM tag mismatch in header 3");
        let msg = err.to_string();
        assert!(!msg.contains("AES"));
        assert!(!msg.contains("tag"));
        assert!(msg.contains("verification failed"));
    }

    #[test]
    fn test_incomplete_decryption_names_reference() {
        let err = SecurityError::IncompleteDecryption {
            id: "enc-1".to_string(),
        };
        assert!(err.to_string().contains("enc-1"));
        assert!(err.is_security_fault());
    }
}
