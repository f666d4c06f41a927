//! Send-side security header builder
//!
//! Produces one protected header element containing tokens, one primary
//! signature, and an encryption reference list, such that the wire bytes
//! can be verified and decrypted by the receive-side processor.
//!
//! The builder is a single-message object: construct, start the signature
//! and encryption contexts, apply security to the headers and body in
//! their original order, complete the signature and then the encryption
//! (a signature that must itself be encrypted is only known after signing
//! finishes), and finally assemble the `wsse:Security` header.

use crate::crypto;
use crate::derived::{DerivedKeyCache, DerivedKeyParams, DerivedKeyTokenElement, DEFAULT_LABEL};
use crate::elements::{
    EncryptedDataElement, ReferenceListElement, SecurityTokenReferenceElement, SignatureElement,
    SignatureConfirmationElement, SignedInfo, SignedReference, TimestampElement,
};
use crate::error::SecurityError;
use crate::message::Message;
use crate::policy::{ProtectionMode, ProtectionPolicy};
use crate::suite::{AlgorithmSuite, EncryptionAlgorithm, KeyDerivationUse};
use crate::token::{KeyIdentifier, SecurityToken, SymmetricKey, TokenSerializerChain};
use crate::xml::XmlElement;
use chrono::Duration;
use std::sync::Arc;
use uuid::Uuid;

fn generate_id() -> String {
    format!("id-{}", Uuid::new_v4().simple())
}

fn ensure_id(element: &mut XmlElement) -> String {
    match element.id() {
        Some(id) => id.to_string(),
        None => {
            let id = generate_id();
            element.set_id(id.clone());
            id
        }
    }
}

struct SigningContext {
    token_id: String,
    key: SymmetricKey,
    key_reference: KeyIdentifier,
    references: Vec<SignedReference>,
}

struct EncryptionContext {
    token_id: String,
    key: SymmetricKey,
    key_reference: KeyIdentifier,
    algorithm: EncryptionAlgorithm,
    reference_ids: Vec<String>,
    encrypt_signature: bool,
}

/// Builder for the protected security header of one outgoing message
pub struct SendSecurityHeader<'a> {
    suite: &'a AlgorithmSuite,
    policy: &'a ProtectionPolicy,
    serializer: &'a TokenSerializerChain,
    derived_keys: Option<&'a DerivedKeyCache>,
    canonicalization_uri: String,
    timestamp_ttl: Option<Duration>,
    refer_primary_token_via_str: bool,

    signing: Option<SigningContext>,
    encryption: Option<EncryptionContext>,
    timestamp: Option<TimestampElement>,
    confirmations: Vec<SignatureConfirmationElement>,
    token_elements: Vec<XmlElement>,
    derived_key_elements: Vec<XmlElement>,
    str_elements: Vec<XmlElement>,
    signature: Option<SignatureElement>,
    encrypted_signature: Option<EncryptedDataElement>,
    reference_list: Option<ReferenceListElement>,
    destination_header_signed: bool,
    // canonicalization scratch, reset between parts rather than reallocated
    part_buffer: Vec<u8>,
}

impl<'a> SendSecurityHeader<'a> {
    /// Create a builder for one message
    pub fn new(
        suite: &'a AlgorithmSuite,
        policy: &'a ProtectionPolicy,
        serializer: &'a TokenSerializerChain,
    ) -> Self {
        SendSecurityHeader {
            suite,
            policy,
            serializer,
            derived_keys: None,
            canonicalization_uri: suite.canonicalization().uri().to_string(),
            timestamp_ttl: None,
            refer_primary_token_via_str: false,
            signing: None,
            encryption: None,
            timestamp: None,
            confirmations: Vec::new(),
            token_elements: Vec::new(),
            derived_key_elements: Vec::new(),
            str_elements: Vec::new(),
            signature: None,
            encrypted_signature: None,
            reference_list: None,
            destination_header_signed: false,
            part_buffer: Vec::new(),
        }
    }

    /// Sign and encrypt with keys derived from the session tokens instead
    /// of the token keys themselves
    #[must_use]
    pub fn with_derived_keys(mut self, cache: &'a DerivedKeyCache) -> Self {
        self.derived_keys = Some(cache);
        self
    }

    /// Include and sign a freshness timestamp with the given lifetime
    #[must_use]
    pub fn with_timestamp(mut self, ttl: Duration) -> Self {
        self.timestamp_ttl = Some(ttl);
        self
    }

    /// Echo previously received signature values as signed confirmations
    #[must_use]
    pub fn with_signature_confirmations(mut self, values: Vec<Vec<u8>>) -> Self {
        self.confirmations = values
            .into_iter()
            .map(|value| SignatureConfirmationElement {
                id: generate_id(),
                value,
            })
            .collect();
        self
    }

    /// Reference the primary token through a targettable
    /// security-token-reference (STR transform) instead of its own id
    #[must_use]
    pub fn with_str_token_reference(mut self) -> Self {
        self.refer_primary_token_via_str = true;
        self
    }

    /// Override the canonicalization identifier written to SignedInfo.
    /// Anything other than the suite's exclusive form fails at
    /// [`Self::start_primary_signature`].
    #[must_use]
    pub fn with_canonicalization_uri(mut self, uri: impl Into<String>) -> Self {
        self.canonicalization_uri = uri.into();
        self
    }

    /// The primary signature value, available after completion
    pub fn signature_value(&self) -> Option<&[u8]> {
        self.signature.as_ref().map(|s| s.signature_value.as_slice())
    }

    fn ensure_token_element(&mut self, token: &SecurityToken) -> Result<(), SecurityError> {
        if self
            .token_elements
            .iter()
            .any(|el| el.id() == Some(token.id()))
        {
            return Ok(());
        }
        let element = self.serializer.write(token)?;
        self.token_elements.push(element);
        Ok(())
    }

    fn derive_for(
        &mut self,
        cache: &DerivedKeyCache,
        token: &Arc<SecurityToken>,
        usage: KeyDerivationUse,
    ) -> Result<(SymmetricKey, KeyIdentifier), SecurityError> {
        let source_bits = token.key_bits().ok_or_else(|| {
            SecurityError::SecurityNegotiation(
                "token carries no symmetric key to derive from".to_string(),
            )
        })?;
        let derived_bits = self.suite.key_derivation_bits(usage);
        self.suite
            .ensure_derived_key_acceptable(source_bits, derived_bits, usage)?;

        let params = DerivedKeyParams {
            generation: None,
            offset: None,
            length: (derived_bits / 8) as usize,
            label: DEFAULT_LABEL.to_vec(),
            nonce: crypto::random_bytes(16),
            algorithm: self.suite.key_derivation(),
        };
        let key = cache.derive(token, params.clone())?;

        let dkt_id = generate_id();
        let dkt = DerivedKeyTokenElement {
            id: dkt_id.clone(),
            source: KeyIdentifier::LocalId(token.id().to_string()),
            params,
        };
        self.derived_key_elements.push(dkt.to_element());
        Ok((key, KeyIdentifier::LocalId(dkt_id)))
    }

    /// Begin accumulating the primary signature with the given token.
    ///
    /// Fails fast when the configured canonicalization is not the single
    /// exclusive form this implementation supports, or when the signing
    /// key is rejected by the suite.
    pub fn start_primary_signature(
        &mut self,
        token: Arc<SecurityToken>,
    ) -> Result<(), SecurityError> {
        if !self.suite.is_canonicalization_supported(&self.canonicalization_uri) {
            return Err(SecurityError::SecurityNegotiation(format!(
                "canonicalization {} is not supported; only {} is",
                self.canonicalization_uri,
                self.suite.canonicalization().uri()
            )));
        }
        self.ensure_token_element(&token)?;

        let (key, key_reference) = match self.derived_keys {
            Some(cache) => self.derive_for(cache, &token, KeyDerivationUse::Signature)?,
            None => {
                let key = token.key().cloned().ok_or_else(|| {
                    SecurityError::SecurityNegotiation(
                        "signing token carries no symmetric key".to_string(),
                    )
                })?;
                self.suite.ensure_symmetric_key_length(key.bits())?;
                (key, KeyIdentifier::LocalId(token.id().to_string()))
            }
        };

        self.signing = Some(SigningContext {
            token_id: token.id().to_string(),
            key,
            key_reference,
            references: Vec::new(),
        });
        Ok(())
    }

    /// Begin the encryption context with the given token.
    ///
    /// Fails when no compatible cipher can be constructed from the token
    /// under the suite's default encryption algorithm.
    pub fn start_encryption(&mut self, token: Arc<SecurityToken>) -> Result<(), SecurityError> {
        self.ensure_token_element(&token)?;
        let algorithm = self.suite.encryption();

        let (key, key_reference) = match self.derived_keys {
            Some(cache) => self.derive_for(cache, &token, KeyDerivationUse::Encryption)?,
            None => {
                let key = token.key().cloned().ok_or_else(|| {
                    SecurityError::SecurityNegotiation(
                        "no compatible cipher: encrypting token carries no key".to_string(),
                    )
                })?;
                self.suite.ensure_symmetric_key_length(key.bits())?;
                (key, KeyIdentifier::LocalId(token.id().to_string()))
            }
        };

        if key.as_slice().len() * 8 != algorithm.key_bits() as usize {
            return Err(SecurityError::SecurityNegotiation(format!(
                "no compatible cipher: {} requires a {}-bit key",
                algorithm.uri(),
                algorithm.key_bits()
            )));
        }

        self.encryption = Some(EncryptionContext {
            token_id: token.id().to_string(),
            key,
            key_reference,
            algorithm,
            reference_ids: Vec::new(),
            encrypt_signature: false,
        });
        Ok(())
    }

    fn add_signature_reference(&mut self, id: String, bytes: &[u8]) -> Result<(), SecurityError> {
        self.add_reference(id, false, bytes)
    }

    fn add_reference(
        &mut self,
        id: String,
        str_transform: bool,
        bytes: &[u8],
    ) -> Result<(), SecurityError> {
        let digest_algorithm = self.suite.digest();
        let digest_value = crypto::digest_bytes(digest_algorithm, bytes);
        let signing = self.signing.as_mut().ok_or_else(|| {
            SecurityError::PolicyViolation(
                "part requires signing but no signature was started".to_string(),
            )
        })?;
        signing.references.push(SignedReference {
            id,
            str_transform,
            digest_algorithm,
            digest_value,
        });
        Ok(())
    }

    fn encrypt_part(&mut self, plaintext: &[u8]) -> Result<EncryptedDataElement, SecurityError> {
        let encryption = self.encryption.as_ref().ok_or_else(|| {
            SecurityError::PolicyViolation(
                "part requires encryption but no encryption context was started".to_string(),
            )
        })?;
        let cipher_value =
            crypto::encrypt_data(encryption.algorithm, encryption.key.as_slice(), plaintext)
                .map_err(|e| SecurityError::crypto(e.to_string()))?;
        Ok(EncryptedDataElement {
            id: generate_id(),
            algorithm_uri: encryption.algorithm.uri().to_string(),
            key_reference: Some(encryption.key_reference.clone()),
            cipher_value,
        })
    }

    fn record_encrypted(&mut self, id: String) {
        if let Some(encryption) = self.encryption.as_mut() {
            encryption.reference_ids.push(id);
        }
    }

    fn mark_signature_needs_encryption(&mut self) {
        if let Some(encryption) = self.encryption.as_mut() {
            encryption.encrypt_signature = true;
        }
    }

    /// Apply per-part protection to every header, in original order.
    ///
    /// The protection mode is computed exactly once per header and never
    /// revisited. When message protection is globally off but the
    /// destination header must be signed, that header's hash is captured
    /// separately and a second occurrence is fatal.
    pub fn apply_security_to_headers(
        &mut self,
        message: &mut Message,
    ) -> Result<(), SecurityError> {
        for index in 0..message.header_count() {
            let local_name = match message.header(index) {
                Some(header) => header.local_name().to_string(),
                None => break,
            };

            let special_destination = !self.policy.require_message_protection
                && self.policy.sign_destination_header
                && local_name == self.policy.destination_header_name;

            let mode = if special_destination {
                if self.destination_header_signed {
                    return Err(SecurityError::PolicyViolation(format!(
                        "header {local_name} must be signed and may only occur once"
                    )));
                }
                self.destination_header_signed = true;
                ProtectionMode::Sign
            } else if !self.policy.require_message_protection {
                ProtectionMode::None
            } else {
                self.policy.mode_for_header(&local_name)
            };

            self.protect_header(message, index, mode)?;
        }
        Ok(())
    }

    fn protect_header(
        &mut self,
        message: &mut Message,
        index: usize,
        mode: ProtectionMode,
    ) -> Result<(), SecurityError> {
        let mut buffer = std::mem::take(&mut self.part_buffer);
        let result = self.protect_header_inner(message, index, mode, &mut buffer);
        self.part_buffer = buffer;
        result
    }

    fn protect_header_inner(
        &mut self,
        message: &mut Message,
        index: usize,
        mode: ProtectionMode,
        buffer: &mut Vec<u8>,
    ) -> Result<(), SecurityError> {
        match mode {
            ProtectionMode::None => Ok(()),
            ProtectionMode::Sign => {
                let header = message.header_mut(index).ok_or_else(|| {
                    SecurityError::Format("header index out of range".to_string())
                })?;
                let id = ensure_id(header);
                header.canonical_into(buffer);
                self.add_signature_reference(id, buffer)
            }
            ProtectionMode::Encrypt => {
                let header = message.header(index).ok_or_else(|| {
                    SecurityError::Format("header index out of range".to_string())
                })?;
                header.canonical_into(buffer);
                let encrypted = self.encrypt_part(buffer)?;
                self.record_encrypted(encrypted.id.clone());
                let wrapper = encrypted.into_encrypted_header(generate_id());
                message.replace_header(index, wrapper);
                Ok(())
            }
            ProtectionMode::SignThenEncrypt => {
                let header = message.header_mut(index).ok_or_else(|| {
                    SecurityError::Format("header index out of range".to_string())
                })?;
                let id = ensure_id(header);
                header.canonical_into(buffer);
                self.add_signature_reference(id, buffer)?;

                let encrypted = self.encrypt_part(buffer)?;
                self.record_encrypted(encrypted.id.clone());
                self.mark_signature_needs_encryption();
                let wrapper = encrypted.into_encrypted_header(generate_id());
                message.replace_header(index, wrapper);
                Ok(())
            }
            ProtectionMode::EncryptThenSign => {
                let header = message.header(index).ok_or_else(|| {
                    SecurityError::Format("header index out of range".to_string())
                })?;
                header.canonical_into(buffer);
                let encrypted = self.encrypt_part(buffer)?;
                self.record_encrypted(encrypted.id.clone());

                let wrapper_id = generate_id();
                let wrapper = encrypted.into_encrypted_header(wrapper_id.clone());
                wrapper.canonical_into(buffer);
                self.add_signature_reference(wrapper_id, buffer)?;
                message.replace_header(index, wrapper);
                Ok(())
            }
        }
    }

    /// Apply the four-mode protection handling to the body, buffering the
    /// canonical form in memory and rewriting the body element.
    pub fn apply_body_security(&mut self, message: &mut Message) -> Result<(), SecurityError> {
        let mode = if self.policy.require_message_protection {
            self.policy.mode_for_body()
        } else {
            ProtectionMode::None
        };
        let mut buffer = std::mem::take(&mut self.part_buffer);
        let result = self.apply_body_inner(message, mode, &mut buffer);
        self.part_buffer = buffer;
        result
    }

    fn apply_body_inner(
        &mut self,
        message: &mut Message,
        mode: ProtectionMode,
        buffer: &mut Vec<u8>,
    ) -> Result<(), SecurityError> {
        match mode {
            ProtectionMode::None => Ok(()),
            ProtectionMode::Sign => {
                let body = message.body_mut();
                let id = ensure_id(body);
                body.canonical_into(buffer);
                self.add_signature_reference(id, buffer)
            }
            ProtectionMode::SignThenEncrypt => {
                let body = message.body_mut();
                let id = ensure_id(body);
                body.canonical_into(buffer);
                self.add_signature_reference(id, buffer)?;

                let encrypted = self.encrypt_part(buffer)?;
                self.record_encrypted(encrypted.id.clone());
                self.mark_signature_needs_encryption();
                let name = message.body().name.clone();
                message.replace_body(XmlElement::new(name).with_child(encrypted.to_element()));
                Ok(())
            }
            ProtectionMode::Encrypt => {
                message.body().canonical_into(buffer);
                let encrypted = self.encrypt_part(buffer)?;
                self.record_encrypted(encrypted.id.clone());
                let name = message.body().name.clone();
                message.replace_body(XmlElement::new(name).with_child(encrypted.to_element()));
                Ok(())
            }
            ProtectionMode::EncryptThenSign => {
                message.body().canonical_into(buffer);
                let encrypted = self.encrypt_part(buffer)?;
                self.record_encrypted(encrypted.id.clone());

                let encrypted_element = encrypted.to_element();
                encrypted_element.canonical_into(buffer);
                self.add_signature_reference(encrypted.id.clone(), buffer)?;

                let name = message.body().name.clone();
                message.replace_body(XmlElement::new(name).with_child(encrypted_element));
                Ok(())
            }
        }
    }

    /// Add the remaining references (timestamp, confirmations, primary
    /// token) and compute the signature value over the canonicalized
    /// SignedInfo. Fails when zero references accumulated.
    pub fn complete_signature(&mut self) -> Result<(), SecurityError> {
        if self.signing.is_none() {
            return Ok(());
        }

        if let Some(ttl) = self.timestamp_ttl {
            let timestamp = TimestampElement::fresh(generate_id(), ttl);
            let bytes = timestamp.to_element().canonical_bytes();
            self.add_signature_reference(timestamp.id.clone(), &bytes)?;
            self.timestamp = Some(timestamp);
        }

        let confirmations = self.confirmations.clone();
        for confirmation in &confirmations {
            let bytes = confirmation.to_element().canonical_bytes();
            self.add_signature_reference(confirmation.id.clone(), &bytes)?;
        }

        if self.policy.protect_primary_token {
            let signing_token_id = match self.signing.as_ref() {
                Some(ctx) => ctx.token_id.clone(),
                None => unreachable!("checked above"),
            };
            let token_bytes = self
                .token_elements
                .iter()
                .find(|el| el.id() == Some(signing_token_id.as_str()))
                .map(XmlElement::canonical_bytes)
                .ok_or_else(|| {
                    SecurityError::PolicyViolation(
                        "primary token must be signed but was not serialized".to_string(),
                    )
                })?;
            if self.refer_primary_token_via_str {
                let str_element = SecurityTokenReferenceElement {
                    id: generate_id(),
                    target_id: signing_token_id,
                };
                self.add_reference(str_element.id.clone(), true, &token_bytes)?;
                self.str_elements.push(str_element.to_element());
            } else {
                self.add_reference(signing_token_id, false, &token_bytes)?;
            }
        }

        let signing = match self.signing.as_ref() {
            Some(ctx) => ctx,
            None => unreachable!("checked above"),
        };
        if signing.references.is_empty() {
            return Err(SecurityError::PolicyViolation(
                "no message parts matched the signing policy".to_string(),
            ));
        }

        let signed_info = SignedInfo {
            canonicalization_uri: self.canonicalization_uri.clone(),
            signature_method_uri: self.suite.symmetric_signature().uri().to_string(),
            references: signing.references.clone(),
        };
        let signature_value = crypto::hmac_sign(
            self.suite.symmetric_signature(),
            signing.key.as_slice(),
            &signed_info.signing_bytes(),
        )
        .map_err(|e| SecurityError::crypto(e.to_string()))?;

        self.signature = Some(SignatureElement {
            id: Some(generate_id()),
            signed_info,
            signature_value,
            key_reference: signing.key_reference.clone(),
        });
        Ok(())
    }

    /// Encrypt elements deferred until signing finished (the signature
    /// itself, under sign-then-encrypt with encrypted parts) and build
    /// the reference list. Returns `None` when nothing was encrypted.
    pub fn complete_encryption(&mut self) -> Result<Option<ReferenceListElement>, SecurityError> {
        let needs_signature_encryption = self
            .encryption
            .as_ref()
            .map(|ctx| ctx.encrypt_signature)
            .unwrap_or(false);

        if needs_signature_encryption {
            let signature = self.signature.as_ref().ok_or_else(|| {
                SecurityError::PolicyViolation(
                    "signature encryption requested but no signature was completed".to_string(),
                )
            })?;
            let bytes = signature.to_element().canonical_bytes();
            let encrypted = self.encrypt_part(&bytes)?;
            self.record_encrypted(encrypted.id.clone());
            self.encrypted_signature = Some(encrypted);
        }

        let ids = match self.encryption.as_ref() {
            Some(ctx) if !ctx.reference_ids.is_empty() => ctx.reference_ids.clone(),
            _ => return Ok(None),
        };
        Ok(Some(ReferenceListElement { ids }))
    }

    /// Assemble the `wsse:Security` header element
    pub fn finish(&mut self) -> Result<XmlElement, SecurityError> {
        let mut security = XmlElement::new("wsse:Security");
        if let Some(timestamp) = &self.timestamp {
            security.children.push(crate::xml::XmlNode::Element(timestamp.to_element()));
        }
        for token in &self.token_elements {
            security.children.push(crate::xml::XmlNode::Element(token.clone()));
        }
        for dkt in &self.derived_key_elements {
            security.children.push(crate::xml::XmlNode::Element(dkt.clone()));
        }
        for str_element in &self.str_elements {
            security.children.push(crate::xml::XmlNode::Element(str_element.clone()));
        }
        for confirmation in &self.confirmations {
            security
                .children
                .push(crate::xml::XmlNode::Element(confirmation.to_element()));
        }
        match (&self.encrypted_signature, &self.signature) {
            (Some(encrypted), _) => {
                security
                    .children
                    .push(crate::xml::XmlNode::Element(encrypted.to_element()));
            }
            (None, Some(signature)) => {
                security
                    .children
                    .push(crate::xml::XmlNode::Element(signature.to_element()));
            }
            (None, None) => {}
        }
        if let Some(reference_list) = &self.reference_list {
            security
                .children
                .push(crate::xml::XmlNode::Element(reference_list.to_element()));
        }
        if security.children.is_empty() {
            return Err(SecurityError::PolicyViolation(
                "security header would be empty".to_string(),
            ));
        }
        Ok(security)
    }

    /// Run the full protection pipeline over a message and prepend the
    /// resulting security header.
    pub fn apply(&mut self, message: &mut Message) -> Result<(), SecurityError> {
        self.apply_security_to_headers(message)?;
        self.apply_body_security(message)?;
        self.complete_signature()?;
        self.reference_list = self.complete_encryption()?;
        let header = self.finish()?;
        tracing::debug!(
            parts_signed = self.signature.as_ref().map(|s| s.signed_info.references.len()),
            parts_encrypted = self
                .reference_list
                .as_ref()
                .map(|list| list.ids.len())
                .unwrap_or(0),
            "security header applied"
        );
        message.push_front_header(header);
        Ok(())
    }
}
