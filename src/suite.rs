//! Algorithm suite policy
//!
//! A closed catalog of named suites. Each suite is an immutable record of
//! the algorithms and key lengths a binding accepts, consulted as a hard
//! gate before any cryptographic operation on both the send and receive
//! paths. Suites are constructed by name and passed by reference; there is
//! no global default instance.

use crate::error::SecurityError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Exclusive XML canonicalization, the only form this implementation
/// produces and verifies.
pub const EXCLUSIVE_C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";

/// Names of the suites in the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SuiteName {
    /// AES-128, SHA-1 digests, HMAC-SHA1 signatures
    Basic128,
    /// AES-192, SHA-1 digests, HMAC-SHA1 signatures
    Basic192,
    /// AES-256, SHA-1 digests, HMAC-SHA1 signatures
    Basic256,
    /// AES-128, SHA-256 digests, HMAC-SHA256 signatures
    Basic128Sha256,
    /// AES-256, SHA-256 digests, HMAC-SHA256 signatures
    Basic256Sha256,
}

impl fmt::Display for SuiteName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SuiteName::Basic128 => "Basic128",
            SuiteName::Basic192 => "Basic192",
            SuiteName::Basic256 => "Basic256",
            SuiteName::Basic128Sha256 => "Basic128Sha256",
            SuiteName::Basic256Sha256 => "Basic256Sha256",
        };
        f.write_str(name)
    }
}

impl FromStr for SuiteName {
    type Err = SecurityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Basic128" => Ok(SuiteName::Basic128),
            "Basic192" => Ok(SuiteName::Basic192),
            "Basic256" => Ok(SuiteName::Basic256),
            "Basic128Sha256" => Ok(SuiteName::Basic128Sha256),
            "Basic256Sha256" => Ok(SuiteName::Basic256Sha256),
            other => Err(SecurityError::SecurityNegotiation(format!(
                "unknown algorithm suite: {other}"
            ))),
        }
    }
}

/// Canonicalization algorithms a suite can name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CanonicalizationAlgorithm {
    /// Exclusive XML canonicalization (the only supported value)
    ExclusiveXml,
}

impl CanonicalizationAlgorithm {
    /// Wire identifier for this algorithm
    pub fn uri(self) -> &'static str {
        EXCLUSIVE_C14N
    }
}

/// Digest algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DigestAlgorithm {
    /// SHA-1 (legacy interop)
    Sha1,
    /// SHA-256
    Sha256,
}

impl DigestAlgorithm {
    /// Wire identifier for this algorithm
    pub fn uri(self) -> &'static str {
        match self {
            DigestAlgorithm::Sha1 => "http://www.w3.org/2000/09/xmldsig#sha1",
            DigestAlgorithm::Sha256 => "http://www.w3.org/2001/04/xmlenc#sha256",
        }
    }

    /// Parse a wire identifier
    pub fn from_uri(uri: &str) -> Option<Self> {
        match uri {
            "http://www.w3.org/2000/09/xmldsig#sha1" => Some(DigestAlgorithm::Sha1),
            "http://www.w3.org/2001/04/xmlenc#sha256" => Some(DigestAlgorithm::Sha256),
            _ => None,
        }
    }
}

/// Symmetric data-encryption algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncryptionAlgorithm {
    /// AES-128-GCM
    Aes128Gcm,
    /// AES-192-GCM
    Aes192Gcm,
    /// AES-256-GCM
    Aes256Gcm,
}

impl EncryptionAlgorithm {
    /// Wire identifier for this algorithm
    pub fn uri(self) -> &'static str {
        match self {
            EncryptionAlgorithm::Aes128Gcm => "http://www.w3.org/2009/xmlenc11#aes128-gcm",
            EncryptionAlgorithm::Aes192Gcm => "http://www.w3.org/2009/xmlenc11#aes192-gcm",
            EncryptionAlgorithm::Aes256Gcm => "http://www.w3.org/2009/xmlenc11#aes256-gcm",
        }
    }

    /// Parse a wire identifier
    pub fn from_uri(uri: &str) -> Option<Self> {
        match uri {
            "http://www.w3.org/2009/xmlenc11#aes128-gcm" => Some(EncryptionAlgorithm::Aes128Gcm),
            "http://www.w3.org/2009/xmlenc11#aes192-gcm" => Some(EncryptionAlgorithm::Aes192Gcm),
            "http://www.w3.org/2009/xmlenc11#aes256-gcm" => Some(EncryptionAlgorithm::Aes256Gcm),
            _ => None,
        }
    }

    /// Required key size in bits
    pub fn key_bits(self) -> u32 {
        match self {
            EncryptionAlgorithm::Aes128Gcm => 128,
            EncryptionAlgorithm::Aes192Gcm => 192,
            EncryptionAlgorithm::Aes256Gcm => 256,
        }
    }
}

/// Symmetric signature (MAC) algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SymmetricSignatureAlgorithm {
    /// HMAC-SHA1 (legacy interop)
    HmacSha1,
    /// HMAC-SHA256
    HmacSha256,
}

impl SymmetricSignatureAlgorithm {
    /// Wire identifier for this algorithm
    pub fn uri(self) -> &'static str {
        match self {
            SymmetricSignatureAlgorithm::HmacSha1 => {
                "http://www.w3.org/2000/09/xmldsig#hmac-sha1"
            }
            SymmetricSignatureAlgorithm::HmacSha256 => {
                "http://www.w3.org/2001/04/xmldsig-more#hmac-sha256"
            }
        }
    }

    /// Parse a wire identifier
    pub fn from_uri(uri: &str) -> Option<Self> {
        match uri {
            "http://www.w3.org/2000/09/xmldsig#hmac-sha1" => {
                Some(SymmetricSignatureAlgorithm::HmacSha1)
            }
            "http://www.w3.org/2001/04/xmldsig-more#hmac-sha256" => {
                Some(SymmetricSignatureAlgorithm::HmacSha256)
            }
            _ => None,
        }
    }
}

/// Key-derivation algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DerivationAlgorithm {
    /// P_SHA1 pseudo-random function
    Psha1,
    /// P_SHA256 pseudo-random function
    Psha256,
}

impl DerivationAlgorithm {
    /// Wire identifier for this algorithm
    pub fn uri(self) -> &'static str {
        match self {
            DerivationAlgorithm::Psha1 => "http://schemas.xmlsoap.org/ws/2005/02/sc/dk/p_sha1",
            DerivationAlgorithm::Psha256 => {
                "http://schemas.xmlsoap.org/ws/2005/02/sc/dk/p_sha256"
            }
        }
    }

    /// Parse a wire identifier
    pub fn from_uri(uri: &str) -> Option<Self> {
        match uri {
            "http://schemas.xmlsoap.org/ws/2005/02/sc/dk/p_sha1" => {
                Some(DerivationAlgorithm::Psha1)
            }
            "http://schemas.xmlsoap.org/ws/2005/02/sc/dk/p_sha256" => {
                Some(DerivationAlgorithm::Psha256)
            }
            _ => None,
        }
    }
}

/// Whether a derived key will be used for signing or for encryption.
/// The suite's minimum derived-key length differs between the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDerivationUse {
    /// The derived key signs (MACs) message parts
    Signature,
    /// The derived key encrypts message parts
    Encryption,
}

/// An immutable, named bundle of acceptable algorithms and key lengths.
///
/// Created once per binding and shared read-only; every predicate here is
/// consulted *before* the corresponding cryptographic operation runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlgorithmSuite {
    name: SuiteName,
    canonicalization: CanonicalizationAlgorithm,
    digest: DigestAlgorithm,
    encryption: EncryptionAlgorithm,
    symmetric_signature: SymmetricSignatureAlgorithm,
    key_derivation: DerivationAlgorithm,
    /// Asymmetric signature identifier, recorded for policy metadata only
    asymmetric_signature_uri: String,
    /// Asymmetric key-wrap identifier, recorded for policy metadata only
    asymmetric_key_wrap_uri: String,
    /// Symmetric key-wrap identifier, recorded for policy metadata only
    symmetric_key_wrap_uri: String,
    symmetric_key_bits: u32,
    min_asymmetric_key_bits: u32,
    max_asymmetric_key_bits: u32,
    signature_key_derivation_bits: u32,
    encryption_key_derivation_bits: u32,
}

impl AlgorithmSuite {
    /// Construct the suite with the given catalog name
    pub fn from_name(name: SuiteName) -> Self {
        match name {
            SuiteName::Basic128 => Self::basic(name, EncryptionAlgorithm::Aes128Gcm, false),
            SuiteName::Basic192 => Self::basic(name, EncryptionAlgorithm::Aes192Gcm, false),
            SuiteName::Basic256 => Self::basic(name, EncryptionAlgorithm::Aes256Gcm, false),
            SuiteName::Basic128Sha256 => Self::basic(name, EncryptionAlgorithm::Aes128Gcm, true),
            SuiteName::Basic256Sha256 => Self::basic(name, EncryptionAlgorithm::Aes256Gcm, true),
        }
    }

    /// The Basic128 suite
    pub fn basic128() -> Self {
        Self::from_name(SuiteName::Basic128)
    }

    /// The Basic192 suite
    pub fn basic192() -> Self {
        Self::from_name(SuiteName::Basic192)
    }

    /// The Basic256 suite
    pub fn basic256() -> Self {
        Self::from_name(SuiteName::Basic256)
    }

    /// The Basic128Sha256 suite
    pub fn basic128_sha256() -> Self {
        Self::from_name(SuiteName::Basic128Sha256)
    }

    /// The Basic256Sha256 suite
    pub fn basic256_sha256() -> Self {
        Self::from_name(SuiteName::Basic256Sha256)
    }

    fn basic(name: SuiteName, encryption: EncryptionAlgorithm, sha256: bool) -> Self {
        let key_bits = encryption.key_bits();
        let kw_aes = match encryption {
            EncryptionAlgorithm::Aes128Gcm => "http://www.w3.org/2001/04/xmlenc#kw-aes128",
            EncryptionAlgorithm::Aes192Gcm => "http://www.w3.org/2001/04/xmlenc#kw-aes192",
            EncryptionAlgorithm::Aes256Gcm => "http://www.w3.org/2001/04/xmlenc#kw-aes256",
        };
        AlgorithmSuite {
            name,
            canonicalization: CanonicalizationAlgorithm::ExclusiveXml,
            digest: if sha256 {
                DigestAlgorithm::Sha256
            } else {
                DigestAlgorithm::Sha1
            },
            encryption,
            symmetric_signature: if sha256 {
                SymmetricSignatureAlgorithm::HmacSha256
            } else {
                SymmetricSignatureAlgorithm::HmacSha1
            },
            key_derivation: if sha256 {
                DerivationAlgorithm::Psha256
            } else {
                DerivationAlgorithm::Psha1
            },
            asymmetric_signature_uri: if sha256 {
                "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256".to_string()
            } else {
                "http://www.w3.org/2000/09/xmldsig#rsa-sha1".to_string()
            },
            asymmetric_key_wrap_uri: "http://www.w3.org/2001/04/xmlenc#rsa-oaep-mgf1p"
                .to_string(),
            symmetric_key_wrap_uri: kw_aes.to_string(),
            symmetric_key_bits: key_bits,
            min_asymmetric_key_bits: 1024,
            max_asymmetric_key_bits: 4096,
            // signature derivation is capped at 192 bits in the catalog;
            // encryption derivation matches the cipher key size
            signature_key_derivation_bits: key_bits.min(192),
            encryption_key_derivation_bits: key_bits,
        }
    }

    /// This suite's catalog name
    pub fn name(&self) -> SuiteName {
        self.name
    }

    /// Default canonicalization algorithm
    pub fn canonicalization(&self) -> CanonicalizationAlgorithm {
        self.canonicalization
    }

    /// Default digest algorithm
    pub fn digest(&self) -> DigestAlgorithm {
        self.digest
    }

    /// Default data-encryption algorithm
    pub fn encryption(&self) -> EncryptionAlgorithm {
        self.encryption
    }

    /// Default symmetric signature algorithm
    pub fn symmetric_signature(&self) -> SymmetricSignatureAlgorithm {
        self.symmetric_signature
    }

    /// Default key-derivation algorithm
    pub fn key_derivation(&self) -> DerivationAlgorithm {
        self.key_derivation
    }

    /// Asymmetric signature identifier (policy metadata)
    pub fn asymmetric_signature_uri(&self) -> &str {
        &self.asymmetric_signature_uri
    }

    /// Asymmetric key-wrap identifier (policy metadata)
    pub fn asymmetric_key_wrap_uri(&self) -> &str {
        &self.asymmetric_key_wrap_uri
    }

    /// Symmetric key-wrap identifier (policy metadata)
    pub fn symmetric_key_wrap_uri(&self) -> &str {
        &self.symmetric_key_wrap_uri
    }

    /// Required derived-key length in bits for the given use
    pub fn key_derivation_bits(&self, usage: KeyDerivationUse) -> u32 {
        match usage {
            KeyDerivationUse::Signature => self.signature_key_derivation_bits,
            KeyDerivationUse::Encryption => self.encryption_key_derivation_bits,
        }
    }

    /// Whether a symmetric key of the given bit length is acceptable
    pub fn is_symmetric_key_length_supported(&self, bits: u32) -> bool {
        bits == self.symmetric_key_bits
    }

    /// Whether an asymmetric key of the given bit length is acceptable
    pub fn is_asymmetric_key_length_supported(&self, bits: u32) -> bool {
        bits >= self.min_asymmetric_key_bits && bits <= self.max_asymmetric_key_bits
    }

    /// Whether the given canonicalization identifier is acceptable
    pub fn is_canonicalization_supported(&self, uri: &str) -> bool {
        uri == self.canonicalization.uri()
    }

    /// Whether the given digest identifier is acceptable
    pub fn is_digest_supported(&self, uri: &str) -> bool {
        uri == self.digest.uri()
    }

    /// Whether the given symmetric signature identifier is acceptable
    pub fn is_symmetric_signature_supported(&self, uri: &str) -> bool {
        uri == self.symmetric_signature.uri()
    }

    /// Whether the given data-encryption identifier is acceptable
    pub fn is_encryption_supported(&self, uri: &str) -> bool {
        uri == self.encryption.uri()
    }

    /// Whether the given key-derivation identifier is acceptable
    pub fn is_key_derivation_supported(&self, uri: &str) -> bool {
        uri == self.key_derivation.uri()
    }

    /// Gate a directly-used symmetric key
    pub fn ensure_symmetric_key_length(&self, bits: u32) -> Result<(), SecurityError> {
        if self.is_symmetric_key_length_supported(bits) {
            return Ok(());
        }
        Err(SecurityError::SecurityNegotiation(format!(
            "{bits}-bit symmetric key is not supported by suite {}",
            self.name
        )))
    }

    /// Gate a derived key: the *source* key length must satisfy the
    /// symmetric-key predicate AND the derived length must reach the
    /// suite's derivation length for the given use. Either violation is a
    /// negotiation fault, distinct from generic cryptographic failures.
    pub fn ensure_derived_key_acceptable(
        &self,
        source_bits: u32,
        derived_bits: u32,
        usage: KeyDerivationUse,
    ) -> Result<(), SecurityError> {
        if !self.is_symmetric_key_length_supported(source_bits) {
            return Err(SecurityError::SecurityNegotiation(format!(
                "{source_bits}-bit derivation source key is not supported by suite {}",
                self.name
            )));
        }
        let required = self.key_derivation_bits(usage);
        if derived_bits < required {
            return Err(SecurityError::SecurityNegotiation(format!(
                "derived key of {derived_bits} bits is shorter than the {required} bits \
                 required by suite {}",
                self.name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_names_round_trip() {
        for name in [
            SuiteName::Basic128,
            SuiteName::Basic192,
            SuiteName::Basic256,
            SuiteName::Basic128Sha256,
            SuiteName::Basic256Sha256,
        ] {
            let parsed: SuiteName = name.to_string().parse().unwrap();
            assert_eq!(parsed, name);
            assert_eq!(AlgorithmSuite::from_name(name).name(), name);
        }
    }

    #[test]
    fn basic256_requires_exactly_256_bit_keys() {
        let suite = AlgorithmSuite::basic256();
        assert!(suite.is_symmetric_key_length_supported(256));
        assert!(!suite.is_symmetric_key_length_supported(128));
        assert!(suite.ensure_symmetric_key_length(128).is_err());

        let err = suite.ensure_symmetric_key_length(128).unwrap_err();
        assert!(err.is_negotiation_error());
    }

    #[test]
    fn basic256_derivation_lengths() {
        let suite = AlgorithmSuite::basic256();
        assert_eq!(suite.key_derivation_bits(KeyDerivationUse::Signature), 192);
        assert_eq!(suite.key_derivation_bits(KeyDerivationUse::Encryption), 256);
    }

    #[test]
    fn derived_key_checks_are_two_sided() {
        let suite = AlgorithmSuite::basic256();

        // acceptable: 256-bit source, 256-bit derived encryption key
        suite
            .ensure_derived_key_acceptable(256, 256, KeyDerivationUse::Encryption)
            .unwrap();

        // source key too short
        let err = suite
            .ensure_derived_key_acceptable(128, 256, KeyDerivationUse::Encryption)
            .unwrap_err();
        assert!(err.is_negotiation_error());

        // derived key shorter than the suite's encryption derivation length
        let err = suite
            .ensure_derived_key_acceptable(256, 128, KeyDerivationUse::Encryption)
            .unwrap_err();
        assert!(err.is_negotiation_error());

        // 192-bit derived key is fine for signing under Basic256
        suite
            .ensure_derived_key_acceptable(256, 192, KeyDerivationUse::Signature)
            .unwrap();
    }

    #[test]
    fn asymmetric_key_length_range() {
        let suite = AlgorithmSuite::basic128();
        assert!(suite.is_asymmetric_key_length_supported(2048));
        assert!(!suite.is_asymmetric_key_length_supported(512));
        assert!(!suite.is_asymmetric_key_length_supported(8192));
    }

    #[test]
    fn sha256_variants_swap_digest_and_mac() {
        let suite = AlgorithmSuite::basic128_sha256();
        assert_eq!(suite.digest(), DigestAlgorithm::Sha256);
        assert_eq!(
            suite.symmetric_signature(),
            SymmetricSignatureAlgorithm::HmacSha256
        );
        assert_eq!(suite.key_derivation(), DerivationAlgorithm::Psha256);
        assert!(suite.is_digest_supported(DigestAlgorithm::Sha256.uri()));
        assert!(!suite.is_digest_supported(DigestAlgorithm::Sha1.uri()));
    }

    #[test]
    fn only_exclusive_canonicalization_is_supported() {
        let suite = AlgorithmSuite::basic128();
        assert!(suite.is_canonicalization_supported(EXCLUSIVE_C14N));
        assert!(!suite.is_canonicalization_supported("http://www.w3.org/TR/2001/REC-xml-c14n-20010315"));
    }
}
