mod crypto;
mod derived;
mod elements;
mod error;
mod message;
mod policy;
mod receive;
mod send;
mod suite;
mod token;
mod xml;

pub mod prelude;

pub use derived::{
    derive_key, length_from_bits, DerivationLimits, DerivedKeyCache, DerivedKeyParams,
    DerivedKeyTokenElement, DEFAULT_CACHE_CAPACITY, DEFAULT_LABEL,
};
pub use elements::{
    is_encrypted_header, EncryptedDataElement, ReferenceListElement,
    SecurityTokenReferenceElement, SignatureConfirmationElement, SignatureElement, SignedInfo,
    SignedReference, TimestampElement, STR_TRANSFORM,
};
pub use error::SecurityError;
pub use message::Message;
pub use policy::{MessagePartSet, ProtectionMode, ProtectionPolicy};
pub use receive::{PartProtection, ProtectionReport, ReceiveSecurityHeader, VerifiedMessage};
pub use send::SendSecurityHeader;
pub use suite::{
    AlgorithmSuite, CanonicalizationAlgorithm, DerivationAlgorithm, DigestAlgorithm,
    EncryptionAlgorithm, KeyDerivationUse, SuiteName, SymmetricSignatureAlgorithm, EXCLUSIVE_C14N,
};
pub use token::{
    KeyIdentifier, SecurityToken, SessionTokenFormat, SymmetricKey, TokenCatalog, TokenFormat,
    TokenResolver, TokenSerializerChain,
};
pub use xml::{XmlElement, XmlNode};
