//! Convenient single-import surface for common operations
//!
//! ```
//! use wssec::prelude::*;
//! ```

pub use crate::derived::{DerivationLimits, DerivedKeyCache, DerivedKeyParams};
pub use crate::error::SecurityError;
pub use crate::message::Message;
pub use crate::policy::{MessagePartSet, ProtectionMode, ProtectionPolicy};
pub use crate::receive::{ReceiveSecurityHeader, VerifiedMessage};
pub use crate::send::SendSecurityHeader;
pub use crate::suite::{AlgorithmSuite, SuiteName};
pub use crate::token::{
    SecurityToken, TokenCatalog, TokenResolver, TokenSerializerChain,
};
pub use crate::xml::XmlElement;
