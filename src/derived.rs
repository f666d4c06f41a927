//! Derived key manager
//!
//! Short-lived keys are computed from a longer-lived source key plus
//! per-use parameters (label, nonce, offset/generation) through a
//! P_SHA-style pseudo-random function, limiting exposure of the source
//! key. Derivations are cached in a fixed-capacity ring shared across
//! concurrent messages; this is the only shared mutable state in the
//! crate.
//!
//! All resource bounds (offset, label and nonce lengths) are checked
//! before the PRF runs, so a hostile peer cannot make us stretch a key to
//! arbitrary cost.

use crate::error::SecurityError;
use crate::suite::DerivationAlgorithm;
use crate::token::{KeyIdentifier, SecurityToken, SymmetricKey};
use crate::xml::{XmlElement, ID_ATTR};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use sha1::Sha1;
use sha2::Sha256;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// Label used when the derived-key token does not carry one
pub const DEFAULT_LABEL: &[u8] = b"WS-SecureConversation";

/// Default number of ring slots in the shared cache
pub const DEFAULT_CACHE_CAPACITY: usize = 32;

/// Bounds applied before any derivation work begins
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DerivationLimits {
    /// Maximum acceptable derivation offset in bytes
    pub max_offset: usize,
    /// Maximum acceptable label length in bytes
    pub max_label_len: usize,
    /// Maximum acceptable nonce length in bytes
    pub max_nonce_len: usize,
}

impl Default for DerivationLimits {
    fn default() -> Self {
        DerivationLimits {
            max_offset: 64,
            max_label_len: 128,
            max_nonce_len: 128,
        }
    }
}

/// Parameters identifying one derivation.
///
/// `length` is a byte count; the wire carries lengths in bits, which must
/// be positive multiples of 8 (see [`length_from_bits`]). When only
/// `generation` is supplied the offset is `generation * length`; when both
/// are absent the offset is 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedKeyParams {
    /// Generation counter, mutually exclusive with `offset` on the wire
    pub generation: Option<u32>,
    /// Explicit byte offset into the PRF output
    pub offset: Option<u32>,
    /// Derived key length in bytes
    pub length: usize,
    /// Derivation label
    pub label: Vec<u8>,
    /// Derivation nonce
    pub nonce: Vec<u8>,
    /// PRF selection
    pub algorithm: DerivationAlgorithm,
}

impl DerivedKeyParams {
    /// The offset actually used by the PRF
    pub fn effective_offset(&self) -> Result<usize, SecurityError> {
        if let Some(offset) = self.offset {
            return Ok(offset as usize);
        }
        match self.generation {
            Some(generation) => {
                (generation as usize)
                    .checked_mul(self.length)
                    .ok_or(SecurityError::LimitExceeded {
                        what: "key derivation offset",
                        max: usize::MAX,
                        got: usize::MAX,
                    })
            }
            None => Ok(0),
        }
    }

    /// Reject out-of-bounds parameters before any cryptographic work
    pub fn validate(&self, limits: &DerivationLimits) -> Result<(), SecurityError> {
        if self.length == 0 {
            return Err(SecurityError::Format(
                "derived key length must be positive".to_string(),
            ));
        }
        let offset = self.effective_offset()?;
        if offset > limits.max_offset {
            return Err(SecurityError::LimitExceeded {
                what: "key derivation offset",
                max: limits.max_offset,
                got: offset,
            });
        }
        if self.label.len() > limits.max_label_len {
            return Err(SecurityError::LimitExceeded {
                what: "key derivation label length",
                max: limits.max_label_len,
                got: self.label.len(),
            });
        }
        if self.nonce.len() > limits.max_nonce_len {
            return Err(SecurityError::LimitExceeded {
                what: "key derivation nonce length",
                max: limits.max_nonce_len,
                got: self.nonce.len(),
            });
        }
        Ok(())
    }
}

/// Convert a wire bit count into a byte length, enforcing 8-bit alignment
pub fn length_from_bits(bits: u64) -> Result<usize, SecurityError> {
    if bits == 0 || bits % 8 != 0 {
        return Err(SecurityError::Format(format!(
            "derived key length must be a positive multiple of 8 bits, got {bits}"
        )));
    }
    Ok((bits / 8) as usize)
}

fn p_hash<M: Mac + KeyInit>(
    secret: &[u8],
    seed: &[u8],
    out_len: usize,
) -> Result<Vec<u8>, SecurityError> {
    let mut output = Vec::with_capacity(out_len);
    // A(0) = seed; A(i) = HMAC(secret, A(i-1)); block(i) = HMAC(secret, A(i) || seed)
    let mut a = seed.to_vec();
    while output.len() < out_len {
        let mut mac = <M as Mac>::new_from_slice(secret)
            .map_err(|_| SecurityError::crypto("PRF key rejected"))?;
        mac.update(&a);
        a = mac.finalize().into_bytes().to_vec();

        let mut mac = <M as Mac>::new_from_slice(secret)
            .map_err(|_| SecurityError::crypto("PRF key rejected"))?;
        mac.update(&a);
        mac.update(seed);
        output.extend_from_slice(&mac.finalize().into_bytes());
    }
    output.truncate(out_len);
    Ok(output)
}

/// Derive `params.length` bytes at the effective offset of the PRF output
/// seeded by (source key, label, nonce). Deterministic; bounds are checked
/// before the PRF is invoked.
pub fn derive_key(
    source: &[u8],
    params: &DerivedKeyParams,
    limits: &DerivationLimits,
) -> Result<SymmetricKey, SecurityError> {
    params.validate(limits)?;
    let offset = params.effective_offset()?;
    let total = offset + params.length;

    let mut seed = Vec::with_capacity(params.label.len() + params.nonce.len());
    seed.extend_from_slice(&params.label);
    seed.extend_from_slice(&params.nonce);

    let stream = match params.algorithm {
        DerivationAlgorithm::Psha1 => p_hash::<Hmac<Sha1>>(source, &seed, total)?,
        DerivationAlgorithm::Psha256 => p_hash::<Hmac<Sha256>>(source, &seed, total)?,
    };
    Ok(SymmetricKey::new(stream[offset..].to_vec()))
}

/// One cached derivation. Owned exclusively by a ring slot; overwritten,
/// never individually freed, when its slot is reused.
pub struct DerivedKeyEntry {
    params: DerivedKeyParams,
    source_key: SymmetricKey,
    // strong reference to the originating token, dropped once resolved
    source_token: Mutex<Option<Arc<SecurityToken>>>,
    derived: OnceLock<SymmetricKey>,
}

impl DerivedKeyEntry {
    fn new(params: DerivedKeyParams, source_key: SymmetricKey, token: Arc<SecurityToken>) -> Self {
        DerivedKeyEntry {
            params,
            source_key,
            source_token: Mutex::new(Some(token)),
            derived: OnceLock::new(),
        }
    }

    fn matches(&self, source_key: &[u8], params: &DerivedKeyParams) -> bool {
        self.params == *params && crate::crypto::ct_eq(self.source_key.as_slice(), source_key)
    }

    /// Lazily resolve the derived bytes.
    ///
    /// Double-checked: a lock-free read when already resolved, otherwise
    /// the per-entry lock is taken, the resolved state rechecked, the PRF
    /// run at most once, and the source-token reference released.
    fn resolve(
        &self,
        limits: &DerivationLimits,
        invocations: &AtomicU64,
    ) -> Result<SymmetricKey, SecurityError> {
        if let Some(key) = self.derived.get() {
            return Ok(key.clone());
        }
        let mut token_guard = self.source_token.lock();
        if let Some(key) = self.derived.get() {
            return Ok(key.clone());
        }
        let key = derive_key(self.source_key.as_slice(), &self.params, limits)?;
        invocations.fetch_add(1, Ordering::Relaxed);
        let _ = self.derived.set(key.clone());
        *token_guard = None;
        Ok(key)
    }
}

struct CacheSlot {
    entry: Mutex<Option<Arc<DerivedKeyEntry>>>,
}

/// Fixed-capacity derivation cache shared across concurrent messages.
///
/// Slots are claimed by a monotonically increasing cursor under a coarse
/// lock; the cursor wraps to 0 when incrementing would overflow, and the
/// slot index is the cursor modulo capacity. Insertion past capacity
/// unconditionally overwrites the next ring slot; there is no LRU.
pub struct DerivedKeyCache {
    slots: Box<[CacheSlot]>,
    cursor: Mutex<usize>,
    limits: DerivationLimits,
    invocations: AtomicU64,
}

impl DerivedKeyCache {
    /// Create a cache with the given slot count
    pub fn new(capacity: usize, limits: DerivationLimits) -> Self {
        assert!(capacity > 0, "cache capacity must be positive");
        let slots = (0..capacity)
            .map(|_| CacheSlot {
                entry: Mutex::new(None),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        DerivedKeyCache {
            slots,
            cursor: Mutex::new(0),
            limits,
            invocations: AtomicU64::new(0),
        }
    }

    /// Create a cache with the default capacity and limits
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY, DerivationLimits::default())
    }

    /// The configured derivation bounds
    pub fn limits(&self) -> &DerivationLimits {
        &self.limits
    }

    /// Number of PRF invocations so far; cache hits do not increase it
    pub fn derivation_count(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    /// Derive (or fetch from cache) the key described by `params` from the
    /// given source token.
    pub fn derive(
        &self,
        source_token: &Arc<SecurityToken>,
        params: DerivedKeyParams,
    ) -> Result<SymmetricKey, SecurityError> {
        params.validate(&self.limits)?;
        let source_key = source_token
            .key()
            .ok_or_else(|| SecurityError::crypto("derivation source token has no symmetric key"))?
            .clone();

        if let Some(entry) = self.lookup(source_key.as_slice(), &params) {
            return entry.resolve(&self.limits, &self.invocations);
        }

        let entry = Arc::new(DerivedKeyEntry::new(
            params,
            source_key,
            Arc::clone(source_token),
        ));
        let index = self.claim_slot();
        *self.slots[index].entry.lock() = Some(Arc::clone(&entry));
        entry.resolve(&self.limits, &self.invocations)
    }

    /// Whether a derivation with these parameters is currently cached
    pub fn contains(&self, source_key: &[u8], params: &DerivedKeyParams) -> bool {
        self.lookup(source_key, params).is_some()
    }

    fn lookup(&self, source_key: &[u8], params: &DerivedKeyParams) -> Option<Arc<DerivedKeyEntry>> {
        for slot in self.slots.iter() {
            let guard = slot.entry.lock();
            if let Some(entry) = guard.as_ref() {
                if entry.matches(source_key, params) {
                    return Some(Arc::clone(entry));
                }
            }
        }
        None
    }

    fn claim_slot(&self) -> usize {
        let mut cursor = self.cursor.lock();
        let index = *cursor % self.slots.len();
        // wrap at the maximum representable value, not merely +1
        *cursor = if *cursor == usize::MAX { 0 } else { *cursor + 1 };
        index
    }
}

/// Wire form of a derived-key token (`wsc:DerivedKeyToken`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedKeyTokenElement {
    /// Targettable identifier of the derived-key token itself
    pub id: String,
    /// Reference to the source token
    pub source: KeyIdentifier,
    /// Derivation parameters
    pub params: DerivedKeyParams,
}

impl DerivedKeyTokenElement {
    /// Local name of the wire element
    pub const LOCAL_NAME: &'static str = "DerivedKeyToken";

    /// Serialize to the wire element
    pub fn to_element(&self) -> XmlElement {
        let mut element = XmlElement::new("wsc:DerivedKeyToken")
            .with_attr(ID_ATTR, &self.id)
            .with_attr("Algorithm", self.params.algorithm.uri())
            .with_child(
                XmlElement::new("wsse:SecurityTokenReference").with_child(
                    XmlElement::new("wsse:Reference")
                        .with_attr("URI", format!("#{}", self.source.local_id())),
                ),
            );
        if let Some(generation) = self.params.generation {
            element =
                element.with_child(XmlElement::new("wsc:Generation").with_text(generation.to_string()));
        }
        if let Some(offset) = self.params.offset {
            element = element.with_child(XmlElement::new("wsc:Offset").with_text(offset.to_string()));
        }
        element = element.with_child(
            XmlElement::new("wsc:Length").with_text(((self.params.length as u64) * 8).to_string()),
        );
        if self.params.label != DEFAULT_LABEL {
            element = element.with_child(
                XmlElement::new("wsc:Label")
                    .with_text(String::from_utf8_lossy(&self.params.label).into_owned()),
            );
        }
        element
            .with_child(XmlElement::new("wsc:Nonce").with_text(BASE64.encode(&self.params.nonce)))
    }

    /// Parse the wire element
    pub fn from_element(element: &XmlElement) -> Result<Self, SecurityError> {
        let id = element
            .id()
            .ok_or_else(|| SecurityError::Format("DerivedKeyToken is missing wsu:Id".to_string()))?
            .to_string();

        let algorithm = match element.attr("Algorithm") {
            Some(uri) => DerivationAlgorithm::from_uri(uri).ok_or_else(|| {
                SecurityError::SecurityNegotiation(format!(
                    "unsupported key derivation algorithm: {uri}"
                ))
            })?,
            None => DerivationAlgorithm::Psha1,
        };

        let source_uri = element
            .find_child("SecurityTokenReference")
            .and_then(|str_el| str_el.find_child("Reference"))
            .and_then(|r| r.attr("URI"))
            .ok_or_else(|| {
                SecurityError::Format(
                    "DerivedKeyToken is missing its source token reference".to_string(),
                )
            })?;
        let source = KeyIdentifier::from_uri(source_uri)?;

        let generation = element
            .find_child("Generation")
            .map(|el| parse_u32(&el.text(), "Generation"))
            .transpose()?;
        let offset = element
            .find_child("Offset")
            .map(|el| parse_u32(&el.text(), "Offset"))
            .transpose()?;
        if generation.is_some() && offset.is_some() {
            return Err(SecurityError::Format(
                "DerivedKeyToken must not carry both Generation and Offset".to_string(),
            ));
        }

        let length_bits = element
            .find_child("Length")
            .map(|el| {
                el.text().trim().parse::<u64>().map_err(|_| {
                    SecurityError::Format("DerivedKeyToken Length is not a number".to_string())
                })
            })
            .transpose()?
            .ok_or_else(|| {
                SecurityError::Format("DerivedKeyToken is missing Length".to_string())
            })?;
        let length = length_from_bits(length_bits)?;

        let label = match element.find_child("Label") {
            Some(el) => el.text().into_bytes(),
            None => DEFAULT_LABEL.to_vec(),
        };

        let nonce = element
            .find_child("Nonce")
            .map(|el| {
                BASE64.decode(el.text().trim()).map_err(|e| {
                    SecurityError::Format(format!("DerivedKeyToken nonce is not base64: {e}"))
                })
            })
            .transpose()?
            .ok_or_else(|| SecurityError::Format("DerivedKeyToken is missing Nonce".to_string()))?;

        Ok(DerivedKeyTokenElement {
            id,
            source,
            params: DerivedKeyParams {
                generation,
                offset,
                length,
                label,
                nonce,
                algorithm,
            },
        })
    }
}

fn parse_u32(text: &str, field: &str) -> Result<u32, SecurityError> {
    text.trim()
        .parse::<u32>()
        .map_err(|_| SecurityError::Format(format!("DerivedKeyToken {field} is not a number")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(nonce: &[u8]) -> DerivedKeyParams {
        DerivedKeyParams {
            generation: None,
            offset: None,
            length: 32,
            label: DEFAULT_LABEL.to_vec(),
            nonce: nonce.to_vec(),
            algorithm: DerivationAlgorithm::Psha1,
        }
    }

    #[test]
    fn derivation_is_deterministic() {
        let limits = DerivationLimits::default();
        let source = [7u8; 32];
        let a = derive_key(&source, &params(b"nonce-1"), &limits).unwrap();
        let b = derive_key(&source, &params(b"nonce-1"), &limits).unwrap();
        assert_eq!(a.as_slice(), b.as_slice());
        assert_eq!(a.as_slice().len(), 32);
    }

    #[test]
    fn different_inputs_produce_different_keys() {
        let limits = DerivationLimits::default();
        let source = [7u8; 32];
        let base = derive_key(&source, &params(b"nonce-1"), &limits).unwrap();

        let other_nonce = derive_key(&source, &params(b"nonce-2"), &limits).unwrap();
        assert_ne!(base.as_slice(), other_nonce.as_slice());

        let mut p = params(b"nonce-1");
        p.label = b"other-label".to_vec();
        let other_label = derive_key(&source, &p, &limits).unwrap();
        assert_ne!(base.as_slice(), other_label.as_slice());

        let other_source = derive_key(&[8u8; 32], &params(b"nonce-1"), &limits).unwrap();
        assert_ne!(base.as_slice(), other_source.as_slice());
    }

    #[test]
    fn generation_times_length_is_the_offset() {
        let limits = DerivationLimits {
            max_offset: 256,
            ..DerivationLimits::default()
        };
        let source = [9u8; 32];

        let mut by_generation = params(b"n");
        by_generation.generation = Some(2);
        by_generation.length = 16;

        let mut by_offset = params(b"n");
        by_offset.offset = Some(32);
        by_offset.length = 16;

        assert_eq!(by_generation.effective_offset().unwrap(), 32);
        let a = derive_key(&source, &by_generation, &limits).unwrap();
        let b = derive_key(&source, &by_offset, &limits).unwrap();
        assert_eq!(a.as_slice(), b.as_slice());
    }

    #[test]
    fn adjacent_generations_are_disjoint_prf_windows() {
        let limits = DerivationLimits {
            max_offset: 256,
            ..DerivationLimits::default()
        };
        let source = [3u8; 32];

        let mut gen0 = params(b"n");
        gen0.generation = Some(0);
        gen0.length = 16;
        let mut gen1 = params(b"n");
        gen1.generation = Some(1);
        gen1.length = 16;

        let a = derive_key(&source, &gen0, &limits).unwrap();
        let b = derive_key(&source, &gen1, &limits).unwrap();
        assert_ne!(a.as_slice(), b.as_slice());

        // the concatenation of generations 0 and 1 equals one 32-byte window
        let mut wide = params(b"n");
        wide.length = 32;
        let w = derive_key(&source, &wide, &limits).unwrap();
        assert_eq!(&w.as_slice()[..16], a.as_slice());
        assert_eq!(&w.as_slice()[16..], b.as_slice());
    }

    #[test]
    fn bounds_are_checked_before_derivation() {
        let limits = DerivationLimits::default();
        let source = [1u8; 32];

        let mut p = params(b"n");
        p.offset = Some(65);
        assert!(derive_key(&source, &p, &limits)
            .unwrap_err()
            .is_limit_error());

        let mut p = params(&vec![0u8; 129]);
        p.offset = None;
        assert!(derive_key(&source, &p, &limits)
            .unwrap_err()
            .is_limit_error());

        let mut p = params(b"n");
        p.label = vec![0u8; 129];
        assert!(derive_key(&source, &p, &limits)
            .unwrap_err()
            .is_limit_error());

        let mut p = params(b"n");
        p.length = 0;
        assert!(derive_key(&source, &p, &limits)
            .unwrap_err()
            .is_format_error());
    }

    #[test]
    fn length_from_bits_requires_octet_alignment() {
        assert_eq!(length_from_bits(256).unwrap(), 32);
        assert!(length_from_bits(0).is_err());
        assert!(length_from_bits(129).is_err());
    }

    #[test]
    fn cache_hit_avoids_recomputation() {
        let cache = DerivedKeyCache::with_defaults();
        let token = Arc::new(SecurityToken::symmetric("tok", vec![5u8; 32]));

        let a = cache.derive(&token, params(b"n1")).unwrap();
        assert_eq!(cache.derivation_count(), 1);

        let b = cache.derive(&token, params(b"n1")).unwrap();
        assert_eq!(cache.derivation_count(), 1);
        assert_eq!(a.as_slice(), b.as_slice());

        cache.derive(&token, params(b"n2")).unwrap();
        assert_eq!(cache.derivation_count(), 2);
    }

    #[test]
    fn cache_distinguishes_source_key_bytes() {
        let cache = DerivedKeyCache::with_defaults();
        let token_a = Arc::new(SecurityToken::symmetric("tok", vec![5u8; 32]));
        let token_b = Arc::new(SecurityToken::symmetric("tok", vec![6u8; 32]));

        cache.derive(&token_a, params(b"n")).unwrap();
        cache.derive(&token_b, params(b"n")).unwrap();
        assert_eq!(cache.derivation_count(), 2);
    }

    #[test]
    fn ring_eviction_overwrites_oldest_slot() {
        let cache = DerivedKeyCache::new(4, DerivationLimits::default());
        let token = Arc::new(SecurityToken::symmetric("tok", vec![5u8; 32]));

        for i in 0..4u8 {
            cache.derive(&token, params(&[i])).unwrap();
        }
        assert!(cache.contains(token.key().unwrap().as_slice(), &params(&[0])));

        // fifth insertion reuses slot 0
        cache.derive(&token, params(&[4])).unwrap();
        assert!(!cache.contains(token.key().unwrap().as_slice(), &params(&[0])));
        assert!(cache.contains(token.key().unwrap().as_slice(), &params(&[1])));
        assert!(cache.contains(token.key().unwrap().as_slice(), &params(&[4])));
    }

    #[test]
    fn token_element_round_trips() {
        let element = DerivedKeyTokenElement {
            id: "dkt-1".to_string(),
            source: KeyIdentifier::LocalId("tok-1".to_string()),
            params: DerivedKeyParams {
                generation: Some(3),
                offset: None,
                length: 24,
                label: DEFAULT_LABEL.to_vec(),
                nonce: vec![1, 2, 3, 4],
                algorithm: DerivationAlgorithm::Psha1,
            },
        };
        let xml = element.to_element();
        let parsed = DerivedKeyTokenElement::from_element(&xml).unwrap();
        assert_eq!(parsed, element);
    }

    #[test]
    fn token_element_rejects_generation_and_offset_together() {
        let mut element = DerivedKeyTokenElement {
            id: "dkt-1".to_string(),
            source: KeyIdentifier::LocalId("tok-1".to_string()),
            params: DerivedKeyParams {
                generation: Some(1),
                offset: None,
                length: 16,
                label: DEFAULT_LABEL.to_vec(),
                nonce: vec![9],
                algorithm: DerivationAlgorithm::Psha1,
            },
        }
        .to_element();
        element.children.push(crate::xml::XmlNode::Element(
            XmlElement::new("wsc:Offset").with_text("0"),
        ));
        assert!(DerivedKeyTokenElement::from_element(&element)
            .unwrap_err()
            .is_format_error());
    }

    #[test]
    fn token_element_rejects_unknown_algorithm() {
        let mut xml = DerivedKeyTokenElement {
            id: "dkt-1".to_string(),
            source: KeyIdentifier::LocalId("tok-1".to_string()),
            params: params(b"n"),
        }
        .to_element();
        xml.set_attr("Algorithm", "http://example.org/not-a-kdf");
        let err = DerivedKeyTokenElement::from_element(&xml).unwrap_err();
        assert!(err.is_negotiation_error());
    }
}
