//! Receive-side security header processor
//!
//! Reconstructs and validates the plaintext message from a protected one,
//! enforcing that every part the policy required to be signed or encrypted
//! actually was. The sender is assumed hostile: identifiers are consumed
//! exactly once, digests are recomputed and compared byte-exactly, key
//! sizes and algorithms are gated through the suite before any result is
//! accepted, and every cryptographic failure is normalized into one
//! opaque fault.
//!
//! Processing happens in two explicit passes over the buffered element
//! tree: a bookkeeping pass that classifies the security header's
//! children and records pending decryption references, then a resolution
//! pass that decrypts deferred items, verifies the signature, and walks
//! the outer headers and body in document order. A message is accepted in
//! full or rejected in full; there is no partial acceptance.

use crate::crypto;
use crate::derived::{DerivedKeyCache, DerivedKeyTokenElement};
use crate::elements::{
    is_encrypted_header, EncryptedDataElement, ReferenceListElement,
    SecurityTokenReferenceElement, SignatureConfirmationElement, SignatureElement,
    SignedReference, TimestampElement,
};
use crate::error::SecurityError;
use crate::message::Message;
use crate::suite::{AlgorithmSuite, EncryptionAlgorithm, KeyDerivationUse};
use crate::token::{
    KeyIdentifier, SecurityToken, SymmetricKey, TokenCatalog, TokenResolver, TokenSerializerChain,
};
use crate::xml::XmlElement;
use chrono::Duration;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Protection actually observed for one message part
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartProtection {
    /// Local name of the part (`Body` for the body)
    pub name: String,
    /// Whether a validated signature reference covered the part
    pub signed: bool,
    /// Whether the part was decrypted during processing
    pub encrypted: bool,
}

/// Per-part protection observed while verifying a message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtectionReport {
    /// Headers, in document order (security header excluded)
    pub headers: Vec<PartProtection>,
    /// The body
    pub body: Option<PartProtection>,
}

/// A fully verified and decrypted message
#[derive(Debug)]
pub struct VerifiedMessage {
    /// The reconstructed plaintext message, security header removed
    pub message: Message,
    /// What was actually protected
    pub report: ProtectionReport,
    /// The primary signature value, for confirmation round trips
    pub primary_signature_value: Option<Vec<u8>>,
}

#[derive(Default)]
struct PassState {
    local_tokens: TokenCatalog,
    token_bytes: HashMap<String, Vec<u8>>,
    derived_key_tokens: Vec<DerivedKeyTokenElement>,
    // derived-key token id -> (root source token id, source key bits)
    derived_sources: HashMap<String, (String, u32)>,
    pending: BTreeSet<String>,
    refs: HashMap<String, SignedReference>,
    str_targets: HashMap<String, String>,
    deferred_encrypted: Vec<EncryptedDataElement>,
    primary_signature: Option<SignatureElement>,
    supporting_signatures: Vec<SignatureElement>,
    signature_was_encrypted: bool,
    primary_token_root: Option<String>,
    confirmations: Vec<(SignatureConfirmationElement, Vec<u8>)>,
    timestamp: Option<(TimestampElement, Vec<u8>)>,
}

/// Processor for the protected header of one incoming message
pub struct ReceiveSecurityHeader<'a> {
    suite: &'a AlgorithmSuite,
    policy: &'a crate::policy::ProtectionPolicy,
    resolver: &'a dyn TokenResolver,
    serializer: &'a TokenSerializerChain,
    derived_keys: Option<&'a DerivedKeyCache>,
    expected_encryption_token: Option<Arc<SecurityToken>>,
    expected_confirmations: Option<Vec<Vec<u8>>>,
    validate_timestamp: bool,
    clock_skew: Duration,
    supporting_token_count: usize,
}

impl<'a> ReceiveSecurityHeader<'a> {
    /// Create a processor for one message
    pub fn new(
        suite: &'a AlgorithmSuite,
        policy: &'a crate::policy::ProtectionPolicy,
        resolver: &'a dyn TokenResolver,
        serializer: &'a TokenSerializerChain,
    ) -> Self {
        ReceiveSecurityHeader {
            suite,
            policy,
            resolver,
            serializer,
            derived_keys: None,
            expected_encryption_token: None,
            expected_confirmations: None,
            validate_timestamp: false,
            clock_skew: Duration::minutes(5),
            supporting_token_count: 0,
        }
    }

    /// Accept derived-key tokens, resolving them through this cache
    #[must_use]
    pub fn with_derived_keys(mut self, cache: &'a DerivedKeyCache) -> Self {
        self.derived_keys = Some(cache);
        self
    }

    /// Require every decryption to trace back to this token
    #[must_use]
    pub fn expect_encryption_token(mut self, token: Arc<SecurityToken>) -> Self {
        self.expected_encryption_token = Some(token);
        self
    }

    /// Require signed confirmations of these previously sent signature
    /// values
    #[must_use]
    pub fn expect_signature_confirmations(mut self, values: Vec<Vec<u8>>) -> Self {
        self.expected_confirmations = Some(values);
        self
    }

    /// Validate timestamp freshness with the given clock skew
    #[must_use]
    pub fn with_timestamp_validation(mut self, clock_skew: Duration) -> Self {
        self.validate_timestamp = true;
        self.clock_skew = clock_skew;
        self
    }

    /// Number of supporting tokens expected to derive keys, used to bound
    /// the derived-key count
    #[must_use]
    pub fn with_supporting_token_count(mut self, count: usize) -> Self {
        self.supporting_token_count = count;
        self
    }

    fn max_derived_keys(&self) -> usize {
        // primary signature + encryption + supporting signatures, doubled
        // for interop slack
        (1 + 1 + self.supporting_token_count) * 2
    }

    /// Process the message: parse, decrypt, verify, enforce.
    pub fn process(&self, mut message: Message) -> Result<VerifiedMessage, SecurityError> {
        let security_index = message
            .find_header("Security")
            .ok_or_else(|| SecurityError::Format("message has no security header".to_string()))?;
        let security = match message.remove_header(security_index) {
            Some(el) => el,
            None => return Err(SecurityError::Format("security header vanished".to_string())),
        };
        if security.children.is_empty() {
            return Err(SecurityError::Format("security header is empty".to_string()));
        }

        let mut state = PassState::default();
        self.bookkeeping_pass(&security, &mut state)?;
        self.resolve_derived_keys(&mut state)?;
        self.resolve_deferred_encrypted(&mut state)?;
        self.verify_primary_signature(&mut state)?;

        let (headers_report, headers_mixed) = self.process_headers(&mut message, &mut state)?;
        let (body_report, body_mixed) = self.process_body(&mut message, &mut state)?;

        if (headers_mixed || body_mixed)
            && !self.policy.encrypt_before_sign
            && !state.signature_was_encrypted
        {
            return Err(SecurityError::PolicyViolation(
                "signed-then-encrypted parts require the signature itself to be encrypted"
                    .to_string(),
            ));
        }

        if self.policy.require_message_protection
            && !self.policy.signed_parts.is_empty()
            && state.primary_signature.is_none()
        {
            return Err(SecurityError::PolicyViolation(
                "required signature is missing".to_string(),
            ));
        }

        self.enforce_primary_token_protection(&state)?;
        self.verify_timestamp(&state)?;
        self.verify_confirmations(&state)?;
        self.verify_supporting_signatures(&state)?;
        self.ensure_decryption_complete(&state)?;

        tracing::debug!(
            headers = headers_report.len(),
            signed = headers_report.iter().filter(|p| p.signed).count(),
            encrypted = headers_report.iter().filter(|p| p.encrypted).count(),
            "security header processed"
        );

        Ok(VerifiedMessage {
            primary_signature_value: state
                .primary_signature
                .as_ref()
                .map(|s| s.signature_value.clone()),
            message,
            report: ProtectionReport {
                headers: headers_report,
                body: Some(body_report),
            },
        })
    }

    /// First pass: classify the security header's children in document
    /// order and record all cross-references.
    fn bookkeeping_pass(
        &self,
        security: &XmlElement,
        state: &mut PassState,
    ) -> Result<(), SecurityError> {
        for child in security.child_elements() {
            match child.local_name() {
                TimestampElement::LOCAL_NAME => {
                    if state.timestamp.is_some() {
                        return Err(SecurityError::Format(
                            "more than one Timestamp in security header".to_string(),
                        ));
                    }
                    let timestamp = TimestampElement::from_element(child)?;
                    state.timestamp = Some((timestamp, child.canonical_bytes()));
                }
                DerivedKeyTokenElement::LOCAL_NAME => {
                    if state.derived_key_tokens.len() + 1 > self.max_derived_keys() {
                        return Err(SecurityError::LimitExceeded {
                            what: "derived key count",
                            max: self.max_derived_keys(),
                            got: state.derived_key_tokens.len() + 1,
                        });
                    }
                    state
                        .derived_key_tokens
                        .push(DerivedKeyTokenElement::from_element(child)?);
                }
                SignatureElement::LOCAL_NAME => {
                    let signature = SignatureElement::from_element(child)?;
                    if state.primary_signature.is_none() {
                        state.primary_signature = Some(signature);
                    } else {
                        state.supporting_signatures.push(signature);
                    }
                }
                SignatureConfirmationElement::LOCAL_NAME => {
                    let confirmation = SignatureConfirmationElement::from_element(child)?;
                    state
                        .confirmations
                        .push((confirmation, child.canonical_bytes()));
                }
                ReferenceListElement::LOCAL_NAME => {
                    let list = ReferenceListElement::from_element(child)?;
                    for id in list.ids {
                        if !state.pending.insert(id.clone()) {
                            return Err(SecurityError::Format(format!(
                                "duplicate reference list entry: {id}"
                            )));
                        }
                    }
                }
                EncryptedDataElement::LOCAL_NAME => {
                    state
                        .deferred_encrypted
                        .push(EncryptedDataElement::from_element(child)?);
                }
                SecurityTokenReferenceElement::LOCAL_NAME => {
                    let str_el = SecurityTokenReferenceElement::from_element(child)?;
                    state.str_targets.insert(str_el.id, str_el.target_id);
                }
                _ => {
                    if self.serializer.can_read(child) {
                        let token = self.serializer.read(child)?;
                        state
                            .token_bytes
                            .insert(token.id().to_string(), child.canonical_bytes());
                        // wire tokens carry no key material; a key-less stub
                        // resolves to the real session token out of band
                        let token = if token.key().is_none() {
                            let clause = KeyIdentifier::LocalId(token.id().to_string());
                            self.resolver
                                .try_resolve(&clause)
                                .unwrap_or_else(|| Arc::new(token))
                        } else {
                            Arc::new(token)
                        };
                        state.local_tokens.add(token);
                    } else {
                        return Err(SecurityError::Format(format!(
                            "unrecognized element {} in security header",
                            child.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn resolve(&self, state: &PassState, clause: &KeyIdentifier) -> Option<Arc<SecurityToken>> {
        state
            .local_tokens
            .try_resolve(clause)
            .or_else(|| self.resolver.try_resolve(clause))
    }

    /// Materialize derived-key tokens once all real tokens are known.
    fn resolve_derived_keys(&self, state: &mut PassState) -> Result<(), SecurityError> {
        let tokens = std::mem::take(&mut state.derived_key_tokens);
        for dkt in tokens {
            let source = self.resolve(state, &dkt.source).ok_or_else(|| {
                SecurityError::crypto(format!(
                    "unable to resolve source token of derived key token {}",
                    dkt.id
                ))
            })?;
            let cache = self.derived_keys.ok_or_else(|| {
                SecurityError::crypto("derived key token received but key derivation is disabled")
            })?;
            let key = cache.derive(&source, dkt.params.clone())?;
            let source_bits = source.key_bits().unwrap_or(0);
            state
                .derived_sources
                .insert(dkt.id.clone(), (source.id().to_string(), source_bits));
            state.local_tokens.add(Arc::new(SecurityToken::symmetric(
                dkt.id,
                key.as_slice().to_vec(),
            )));
        }
        Ok(())
    }

    /// Resolve the key for an encrypted element, gating algorithm and key
    /// length through the suite and checking the wrapping-token
    /// expectation before anything is decrypted.
    fn decryption_key(
        &self,
        state: &PassState,
        encrypted: &EncryptedDataElement,
    ) -> Result<(SymmetricKey, EncryptionAlgorithm), SecurityError> {
        let algorithm =
            EncryptionAlgorithm::from_uri(&encrypted.algorithm_uri).ok_or_else(|| {
                SecurityError::SecurityNegotiation(format!(
                    "unsupported encryption algorithm: {}",
                    encrypted.algorithm_uri
                ))
            })?;
        if !self.suite.is_encryption_supported(&encrypted.algorithm_uri) {
            return Err(SecurityError::SecurityNegotiation(format!(
                "encryption algorithm {} is not accepted by suite",
                encrypted.algorithm_uri
            )));
        }

        let clause = match &encrypted.key_reference {
            Some(clause) => clause.clone(),
            None => match &self.expected_encryption_token {
                Some(token) => KeyIdentifier::LocalId(token.id().to_string()),
                None => {
                    return Err(SecurityError::crypto(
                        "encrypted element carries no key reference",
                    ))
                }
            },
        };
        let token = self.resolve(state, &clause).ok_or_else(|| {
            SecurityError::crypto(format!(
                "unable to resolve decryption token {}",
                clause.local_id()
            ))
        })?;
        let key = token
            .key()
            .cloned()
            .ok_or_else(|| SecurityError::crypto("decryption token has no key material"))?;
        let key_bits = key.bits();

        let root = match state.derived_sources.get(token.id()) {
            Some((source_id, source_bits)) => {
                self.suite.ensure_derived_key_acceptable(
                    *source_bits,
                    key_bits,
                    KeyDerivationUse::Encryption,
                )?;
                source_id.clone()
            }
            None => {
                self.suite.ensure_symmetric_key_length(key_bits)?;
                token.id().to_string()
            }
        };

        if let Some(expected) = &self.expected_encryption_token {
            if root != expected.id() {
                return Err(SecurityError::WrongEncryptingToken);
            }
        }
        Ok((key, algorithm))
    }

    /// Decrypt security-header items that were deferred during
    /// bookkeeping. Each consumes its reference-list entry exactly once.
    fn resolve_deferred_encrypted(&self, state: &mut PassState) -> Result<(), SecurityError> {
        let deferred = std::mem::take(&mut state.deferred_encrypted);
        for encrypted in deferred {
            if !state.pending.remove(&encrypted.id) {
                return Err(SecurityError::crypto(format!(
                    "encrypted security header element {} was not advertised in the reference list",
                    encrypted.id
                )));
            }
            let (key, algorithm) = self.decryption_key(state, &encrypted)?;
            let plaintext = crypto::decrypt_data(algorithm, key.as_slice(), &encrypted.cipher_value)
                .map_err(|e| SecurityError::crypto(e.to_string()))?;
            let element = XmlElement::parse(&plaintext)?;

            match element.local_name() {
                SignatureElement::LOCAL_NAME => {
                    let signature = SignatureElement::from_element(&element)?;
                    state.signature_was_encrypted = true;
                    if state.primary_signature.is_none() {
                        state.primary_signature = Some(signature);
                    } else {
                        state.supporting_signatures.push(signature);
                    }
                }
                SignatureConfirmationElement::LOCAL_NAME => {
                    let confirmation = SignatureConfirmationElement::from_element(&element)?;
                    state
                        .confirmations
                        .push((confirmation, element.canonical_bytes()));
                }
                other => {
                    return Err(SecurityError::Format(format!(
                        "unexpected decrypted security header element: {other}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Verify one signature's algorithms, key gates, and MAC. Returns the
    /// root token id the signature's key traces back to.
    fn verify_signature_element(
        &self,
        state: &PassState,
        signature: &SignatureElement,
    ) -> Result<String, SecurityError> {
        let signed_info = &signature.signed_info;
        if !self
            .suite
            .is_canonicalization_supported(&signed_info.canonicalization_uri)
        {
            return Err(SecurityError::SecurityNegotiation(format!(
                "canonicalization {} is not accepted by suite",
                signed_info.canonicalization_uri
            )));
        }
        if !self
            .suite
            .is_symmetric_signature_supported(&signed_info.signature_method_uri)
        {
            return Err(SecurityError::SecurityNegotiation(format!(
                "signature algorithm {} is not accepted by suite",
                signed_info.signature_method_uri
            )));
        }
        for reference in &signed_info.references {
            if !self
                .suite
                .is_digest_supported(reference.digest_algorithm.uri())
            {
                return Err(SecurityError::SecurityNegotiation(format!(
                    "digest algorithm {} is not accepted by suite",
                    reference.digest_algorithm.uri()
                )));
            }
        }

        let token = self.resolve(state, &signature.key_reference).ok_or_else(|| {
            SecurityError::crypto(format!(
                "unable to resolve signing token {}",
                signature.key_reference.local_id()
            ))
        })?;
        let key = token
            .key()
            .cloned()
            .ok_or_else(|| SecurityError::crypto("signing token has no key material"))?;
        let key_bits = key.bits();
        let root = match state.derived_sources.get(token.id()) {
            Some((source_id, source_bits)) => {
                self.suite.ensure_derived_key_acceptable(
                    *source_bits,
                    key_bits,
                    KeyDerivationUse::Signature,
                )?;
                source_id.clone()
            }
            None => {
                self.suite.ensure_symmetric_key_length(key_bits)?;
                token.id().to_string()
            }
        };

        crypto::hmac_verify(
            self.suite.symmetric_signature(),
            key.as_slice(),
            &signed_info.signing_bytes(),
            &signature.signature_value,
        )
        .map_err(|e| SecurityError::crypto(e.to_string()))?;

        Ok(root)
    }

    fn verify_primary_signature(&self, state: &mut PassState) -> Result<(), SecurityError> {
        let signature = match state.primary_signature.clone() {
            Some(signature) => signature,
            None => return Ok(()),
        };
        let root = self.verify_signature_element(state, &signature)?;
        state.primary_token_root = Some(root);

        for reference in &signature.signed_info.references {
            if state
                .refs
                .insert(reference.id.clone(), reference.clone())
                .is_some()
            {
                return Err(SecurityError::Format(format!(
                    "duplicate SignedInfo reference: {}",
                    reference.id
                )));
            }
        }
        Ok(())
    }

    fn verify_supporting_signatures(&self, state: &PassState) -> Result<(), SecurityError> {
        for signature in &state.supporting_signatures {
            self.verify_signature_element(state, signature)?;
        }
        Ok(())
    }

    /// Establish whether canonical bytes identified by `id` are covered by
    /// the validated signature, by exact-id match first, then through a
    /// security-token-reference transform. A covering reference with a
    /// digest mismatch is a fault, never "unsigned".
    fn check_signed(
        &self,
        state: &PassState,
        id: Option<&str>,
        bytes: &[u8],
    ) -> Result<bool, SecurityError> {
        let Some(id) = id else {
            return Ok(false);
        };
        if let Some(reference) = state.refs.get(id) {
            return self.compare_digest(reference, bytes).map(|()| true);
        }
        for (str_id, target_id) in &state.str_targets {
            if target_id == id {
                if let Some(reference) = state.refs.get(str_id) {
                    if reference.str_transform {
                        return self.compare_digest(reference, bytes).map(|()| true);
                    }
                }
            }
        }
        Ok(false)
    }

    fn compare_digest(
        &self,
        reference: &SignedReference,
        bytes: &[u8],
    ) -> Result<(), SecurityError> {
        let digest = crypto::digest_bytes(reference.digest_algorithm, bytes);
        if crypto::ct_eq(&digest, &reference.digest_value) {
            Ok(())
        } else {
            Err(SecurityError::crypto(format!(
                "digest mismatch for reference {}",
                reference.id
            )))
        }
    }

    /// Walk the outer headers in document order: decrypt where the
    /// reference list says so, establish signed status against the form
    /// the sender actually hashed, and enforce the required-parts policy.
    fn process_headers(
        &self,
        message: &mut Message,
        state: &mut PassState,
    ) -> Result<(Vec<PartProtection>, bool), SecurityError> {
        let mut report = Vec::with_capacity(message.header_count());
        let mut any_signed_and_encrypted = false;
        let mut destination_seen = false;

        for index in 0..message.header_count() {
            let original = match message.header(index) {
                Some(header) => header.clone(),
                None => break,
            };

            let mut plain = original;
            let mut encrypted = false;
            let mut wrapper: Option<(Option<String>, Vec<u8>)> = None;

            let directly_referenced = plain
                .id()
                .map(|id| state.pending.contains(id))
                .unwrap_or(false);
            if is_encrypted_header(&plain)
                || plain.local_name() == EncryptedDataElement::LOCAL_NAME
                || directly_referenced
            {
                let inner = if is_encrypted_header(&plain) {
                    plain
                        .find_child(EncryptedDataElement::LOCAL_NAME)
                        .ok_or_else(|| {
                            SecurityError::Format(
                                "EncryptedHeader without EncryptedData".to_string(),
                            )
                        })?
                } else {
                    &plain
                };
                let encrypted_data = EncryptedDataElement::from_element(inner)?;
                if !state.pending.remove(&encrypted_data.id) {
                    return Err(SecurityError::crypto(format!(
                        "encrypted header {} was not advertised in the reference list \
                         or was already consumed",
                        encrypted_data.id
                    )));
                }
                let wrapper_id = plain
                    .id()
                    .map(str::to_string)
                    .unwrap_or_else(|| encrypted_data.id.clone());
                wrapper = Some((Some(wrapper_id), plain.canonical_bytes()));

                let (key, algorithm) = self.decryption_key(state, &encrypted_data)?;
                let plaintext =
                    crypto::decrypt_data(algorithm, key.as_slice(), &encrypted_data.cipher_value)
                        .map_err(|e| SecurityError::crypto(e.to_string()))?;
                plain = XmlElement::parse(&plaintext)?;
                message.replace_header(index, plain.clone());
                encrypted = true;
            }

            // hash the form the sender actually hashed: the ciphertext
            // wrapper under encrypt-then-sign, the plaintext otherwise
            let signed = if encrypted && self.policy.encrypt_before_sign {
                let (wrapper_id, wrapper_bytes) = wrapper
                    .as_ref()
                    .map(|(id, bytes)| (id.as_deref(), bytes.as_slice()))
                    .unwrap_or((None, &[]));
                self.check_signed(state, wrapper_id, wrapper_bytes)?
            } else {
                let bytes = plain.canonical_bytes();
                self.check_signed(state, plain.id(), &bytes)?
            };

            if signed && encrypted {
                any_signed_and_encrypted = true;
            }

            let local_name = plain.local_name().to_string();
            if self.policy.require_message_protection {
                if self.policy.signed_parts.contains_header(&local_name) && !signed {
                    return Err(SecurityError::PolicyViolation(format!(
                        "header {local_name} was required to be signed but was not"
                    )));
                }
                if self.policy.encrypted_parts.contains_header(&local_name) && !encrypted {
                    return Err(SecurityError::PolicyViolation(format!(
                        "header {local_name} was required to be encrypted but was not"
                    )));
                }
            } else if self.policy.sign_destination_header
                && local_name == self.policy.destination_header_name
            {
                if destination_seen {
                    return Err(SecurityError::PolicyViolation(format!(
                        "header {local_name} must occur exactly once"
                    )));
                }
                destination_seen = true;
                if !signed {
                    return Err(SecurityError::PolicyViolation(format!(
                        "header {local_name} was required to be signed but was not"
                    )));
                }
            }

            report.push(PartProtection {
                name: local_name,
                signed,
                encrypted,
            });
        }

        Ok((report, any_signed_and_encrypted))
    }

    /// Process the body with the two sub-orderings: under encrypt-then-sign
    /// the ciphertext element is hashed; under sign-then-encrypt the
    /// decrypted plaintext is.
    fn process_body(
        &self,
        message: &mut Message,
        state: &mut PassState,
    ) -> Result<(PartProtection, bool), SecurityError> {
        let body = message.body().clone();
        let mut signed = false;
        let mut encrypted = false;

        let advertised = body
            .find_child(EncryptedDataElement::LOCAL_NAME)
            .map(EncryptedDataElement::from_element)
            .transpose()?
            .filter(|enc| state.pending.contains(&enc.id));

        if let Some(encrypted_data) = advertised {
            state.pending.remove(&encrypted_data.id);
            if self.policy.encrypt_before_sign {
                let element_bytes = body
                    .find_child(EncryptedDataElement::LOCAL_NAME)
                    .map(XmlElement::canonical_bytes)
                    .unwrap_or_default();
                signed = self.check_signed(state, Some(&encrypted_data.id), &element_bytes)?;
            }

            let (key, algorithm) = self.decryption_key(state, &encrypted_data)?;
            let plaintext =
                crypto::decrypt_data(algorithm, key.as_slice(), &encrypted_data.cipher_value)
                    .map_err(|e| SecurityError::crypto(e.to_string()))?;
            let plain_body = XmlElement::parse(&plaintext)?;

            if !self.policy.encrypt_before_sign {
                let bytes = plain_body.canonical_bytes();
                signed = self.check_signed(state, plain_body.id(), &bytes)?;
            }
            message.replace_body(plain_body);
            encrypted = true;
        } else {
            let bytes = body.canonical_bytes();
            signed = self.check_signed(state, body.id(), &bytes)?;
        }

        if self.policy.require_message_protection {
            if self.policy.signed_parts.include_body && !signed {
                return Err(SecurityError::PolicyViolation(
                    "body was required to be signed but was not".to_string(),
                ));
            }
            if self.policy.encrypted_parts.include_body && !encrypted {
                return Err(SecurityError::PolicyViolation(
                    "body was required to be encrypted but was not".to_string(),
                ));
            }
        }

        let mixed = signed && encrypted;
        Ok((
            PartProtection {
                name: "Body".to_string(),
                signed,
                encrypted,
            },
            mixed,
        ))
    }

    fn enforce_primary_token_protection(&self, state: &PassState) -> Result<(), SecurityError> {
        if !self.policy.protect_primary_token {
            return Ok(());
        }
        let root = state.primary_token_root.as_deref().ok_or_else(|| {
            SecurityError::PolicyViolation(
                "primary token must be signed but no signature was found".to_string(),
            )
        })?;
        let bytes = state.token_bytes.get(root).ok_or_else(|| {
            SecurityError::PolicyViolation(
                "primary token must be signed but was not carried in the header".to_string(),
            )
        })?;
        if !self.check_signed(state, Some(root), bytes)? {
            return Err(SecurityError::PolicyViolation(
                "primary token was required to be signed but was not".to_string(),
            ));
        }
        Ok(())
    }

    fn verify_timestamp(&self, state: &PassState) -> Result<(), SecurityError> {
        let Some((timestamp, bytes)) = &state.timestamp else {
            return Ok(());
        };
        if state.primary_signature.is_some()
            && self.policy.require_message_protection
            && !self.check_signed(state, Some(&timestamp.id), bytes)?
        {
            return Err(SecurityError::PolicyViolation(
                "timestamp was not covered by the signature".to_string(),
            ));
        }
        if self.validate_timestamp {
            timestamp.validate_freshness(self.clock_skew)?;
        }
        Ok(())
    }

    fn verify_confirmations(&self, state: &PassState) -> Result<(), SecurityError> {
        let Some(expected) = &self.expected_confirmations else {
            return Ok(());
        };
        for (confirmation, bytes) in &state.confirmations {
            if !self.check_signed(state, Some(&confirmation.id), bytes)? {
                return Err(SecurityError::PolicyViolation(
                    "signature confirmation was not signed".to_string(),
                ));
            }
        }
        for value in expected {
            let found = state
                .confirmations
                .iter()
                .any(|(confirmation, _)| crypto::ct_eq(&confirmation.value, value));
            if !found {
                return Err(SecurityError::MessageSecurity {
                    reason: "expected signature confirmation was not received".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Terminal invariant: every advertised encrypted reference must have
    /// been consumed by a successful decryption.
    fn ensure_decryption_complete(&self, state: &PassState) -> Result<(), SecurityError> {
        if let Some(id) = state.pending.iter().next() {
            return Err(SecurityError::IncompleteDecryption { id: id.clone() });
        }
        Ok(())
    }
}
