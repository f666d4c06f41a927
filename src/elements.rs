//! Wire structures carried inside the security header
//!
//! Typed views over the signature, encryption, and utility elements:
//! build on send, parse on receive. Parsing is strict — a missing
//! mandatory sub-element is a format error that aborts the pass.

use crate::error::SecurityError;
use crate::suite::DigestAlgorithm;
use crate::token::KeyIdentifier;
use crate::xml::{XmlElement, ID_ATTR};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Duration, SecondsFormat, Utc};

/// Identifier of the security-token-reference transform
pub const STR_TRANSFORM: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-soap-message-security-1.0#STR-Transform";

/// One `ds:Reference` inside a SignedInfo
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedReference {
    /// Referred identifier (without the leading `#`)
    pub id: String,
    /// Whether the reference goes through the STR transform
    pub str_transform: bool,
    /// Digest algorithm for this reference
    pub digest_algorithm: DigestAlgorithm,
    /// Expected digest bytes
    pub digest_value: Vec<u8>,
}

impl SignedReference {
    fn to_element(&self) -> XmlElement {
        let mut element = XmlElement::new("ds:Reference").with_attr("URI", format!("#{}", self.id));
        if self.str_transform {
            element = element.with_child(
                XmlElement::new("ds:Transforms")
                    .with_child(XmlElement::new("ds:Transform").with_attr("Algorithm", STR_TRANSFORM)),
            );
        }
        element
            .with_child(
                XmlElement::new("ds:DigestMethod")
                    .with_attr("Algorithm", self.digest_algorithm.uri()),
            )
            .with_child(
                XmlElement::new("ds:DigestValue").with_text(BASE64.encode(&self.digest_value)),
            )
    }

    fn from_element(element: &XmlElement) -> Result<Self, SecurityError> {
        let uri = element
            .attr("URI")
            .ok_or_else(|| SecurityError::Format("Reference is missing URI".to_string()))?;
        let id = KeyIdentifier::from_uri(uri)?.local_id().to_string();

        let str_transform = element
            .find_child("Transforms")
            .map(|transforms| {
                transforms
                    .child_elements()
                    .any(|t| t.attr("Algorithm") == Some(STR_TRANSFORM))
            })
            .unwrap_or(false);

        let digest_uri = element
            .find_child("DigestMethod")
            .and_then(|el| el.attr("Algorithm"))
            .ok_or_else(|| SecurityError::Format("Reference is missing DigestMethod".to_string()))?;
        let digest_algorithm = DigestAlgorithm::from_uri(digest_uri).ok_or_else(|| {
            SecurityError::SecurityNegotiation(format!("unsupported digest algorithm: {digest_uri}"))
        })?;

        let digest_value = element
            .find_child("DigestValue")
            .map(|el| {
                BASE64.decode(el.text().trim()).map_err(|e| {
                    SecurityError::Format(format!("DigestValue is not base64: {e}"))
                })
            })
            .transpose()?
            .ok_or_else(|| SecurityError::Format("Reference is missing DigestValue".to_string()))?;

        Ok(SignedReference {
            id,
            str_transform,
            digest_algorithm,
            digest_value,
        })
    }
}

/// The `ds:SignedInfo` structure: algorithms plus the ordered reference list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedInfo {
    /// Canonicalization identifier the digests and MAC were computed under
    pub canonicalization_uri: String,
    /// Signature (MAC) algorithm identifier
    pub signature_method_uri: String,
    /// Ordered signed references
    pub references: Vec<SignedReference>,
}

impl SignedInfo {
    /// Serialize to `ds:SignedInfo`
    pub fn to_element(&self) -> XmlElement {
        let mut element = XmlElement::new("ds:SignedInfo")
            .with_child(
                XmlElement::new("ds:CanonicalizationMethod")
                    .with_attr("Algorithm", &self.canonicalization_uri),
            )
            .with_child(
                XmlElement::new("ds:SignatureMethod")
                    .with_attr("Algorithm", &self.signature_method_uri),
            );
        for reference in &self.references {
            element = element.with_child(reference.to_element());
        }
        element
    }

    /// The canonical bytes the signature value is computed over
    pub fn signing_bytes(&self) -> Vec<u8> {
        self.to_element().canonical_bytes()
    }

    fn from_element(element: &XmlElement) -> Result<Self, SecurityError> {
        let canonicalization_uri = element
            .find_child("CanonicalizationMethod")
            .and_then(|el| el.attr("Algorithm"))
            .ok_or_else(|| {
                SecurityError::Format("SignedInfo is missing CanonicalizationMethod".to_string())
            })?
            .to_string();
        let signature_method_uri = element
            .find_child("SignatureMethod")
            .and_then(|el| el.attr("Algorithm"))
            .ok_or_else(|| {
                SecurityError::Format("SignedInfo is missing SignatureMethod".to_string())
            })?
            .to_string();
        let references = element
            .child_elements()
            .filter(|el| el.local_name() == "Reference")
            .map(SignedReference::from_element)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(SignedInfo {
            canonicalization_uri,
            signature_method_uri,
            references,
        })
    }
}

/// A `ds:Signature`: SignedInfo, signature value, and the key reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureElement {
    /// Targettable identifier, present when the signature can be confirmed
    /// or encrypted
    pub id: Option<String>,
    /// The signed-info structure
    pub signed_info: SignedInfo,
    /// MAC over the canonicalized SignedInfo
    pub signature_value: Vec<u8>,
    /// Reference to the signing token
    pub key_reference: KeyIdentifier,
}

impl SignatureElement {
    /// Local name of the wire element
    pub const LOCAL_NAME: &'static str = "Signature";

    /// Serialize to `ds:Signature`
    pub fn to_element(&self) -> XmlElement {
        let mut element = XmlElement::new("ds:Signature");
        if let Some(id) = &self.id {
            element.set_attr(ID_ATTR, id);
        }
        element
            .with_child(self.signed_info.to_element())
            .with_child(
                XmlElement::new("ds:SignatureValue")
                    .with_text(BASE64.encode(&self.signature_value)),
            )
            .with_child(
                XmlElement::new("ds:KeyInfo").with_child(
                    XmlElement::new("wsse:SecurityTokenReference").with_child(
                        XmlElement::new("wsse:Reference")
                            .with_attr("URI", format!("#{}", self.key_reference.local_id())),
                    ),
                ),
            )
    }

    /// Parse a `ds:Signature`
    pub fn from_element(element: &XmlElement) -> Result<Self, SecurityError> {
        let signed_info = element
            .find_child("SignedInfo")
            .map(SignedInfo::from_element)
            .transpose()?
            .ok_or_else(|| SecurityError::Format("Signature is missing SignedInfo".to_string()))?;
        let signature_value = element
            .find_child("SignatureValue")
            .map(|el| {
                BASE64.decode(el.text().trim()).map_err(|e| {
                    SecurityError::Format(format!("SignatureValue is not base64: {e}"))
                })
            })
            .transpose()?
            .ok_or_else(|| {
                SecurityError::Format("Signature is missing SignatureValue".to_string())
            })?;
        let key_uri = element
            .find_child("KeyInfo")
            .and_then(|ki| ki.find_child("SecurityTokenReference"))
            .and_then(|str_el| str_el.find_child("Reference"))
            .and_then(|r| r.attr("URI"))
            .ok_or_else(|| {
                SecurityError::Format("Signature is missing its key reference".to_string())
            })?;
        Ok(SignatureElement {
            id: element.id().map(str::to_string),
            signed_info,
            signature_value,
            key_reference: KeyIdentifier::from_uri(key_uri)?,
        })
    }
}

/// An `xenc:EncryptedData` element
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedDataElement {
    /// Targettable identifier, consumed against the reference list
    pub id: String,
    /// Data-encryption algorithm identifier
    pub algorithm_uri: String,
    /// Reference to the encrypting token, when carried inline
    pub key_reference: Option<KeyIdentifier>,
    /// IV-prefixed ciphertext
    pub cipher_value: Vec<u8>,
}

impl EncryptedDataElement {
    /// Local name of the wire element
    pub const LOCAL_NAME: &'static str = "EncryptedData";

    /// Serialize to `xenc:EncryptedData`
    pub fn to_element(&self) -> XmlElement {
        let mut element = XmlElement::new("xenc:EncryptedData")
            .with_attr(ID_ATTR, &self.id)
            .with_child(
                XmlElement::new("xenc:EncryptionMethod").with_attr("Algorithm", &self.algorithm_uri),
            );
        if let Some(key_reference) = &self.key_reference {
            element = element.with_child(
                XmlElement::new("ds:KeyInfo").with_child(
                    XmlElement::new("wsse:SecurityTokenReference").with_child(
                        XmlElement::new("wsse:Reference")
                            .with_attr("URI", format!("#{}", key_reference.local_id())),
                    ),
                ),
            );
        }
        element.with_child(
            XmlElement::new("xenc:CipherData").with_child(
                XmlElement::new("xenc:CipherValue").with_text(BASE64.encode(&self.cipher_value)),
            ),
        )
    }

    /// Parse an `xenc:EncryptedData`
    pub fn from_element(element: &XmlElement) -> Result<Self, SecurityError> {
        let id = element
            .id()
            .ok_or_else(|| SecurityError::Format("EncryptedData is missing its Id".to_string()))?
            .to_string();
        let algorithm_uri = element
            .find_child("EncryptionMethod")
            .and_then(|el| el.attr("Algorithm"))
            .ok_or_else(|| {
                SecurityError::Format("EncryptedData is missing EncryptionMethod".to_string())
            })?
            .to_string();
        let key_reference = element
            .find_child("KeyInfo")
            .and_then(|ki| ki.find_child("SecurityTokenReference"))
            .and_then(|str_el| str_el.find_child("Reference"))
            .and_then(|r| r.attr("URI"))
            .map(KeyIdentifier::from_uri)
            .transpose()?;
        let cipher_value = element
            .find_child("CipherData")
            .and_then(|cd| cd.find_child("CipherValue"))
            .map(|el| {
                BASE64.decode(el.text().trim()).map_err(|e| {
                    SecurityError::Format(format!("CipherValue is not base64: {e}"))
                })
            })
            .transpose()?
            .ok_or_else(|| {
                SecurityError::Format("EncryptedData is missing CipherValue".to_string())
            })?;
        Ok(EncryptedDataElement {
            id,
            algorithm_uri,
            key_reference,
            cipher_value,
        })
    }

    /// Wrap this element for use in place of a message header
    pub fn into_encrypted_header(self, wrapper_id: impl Into<String>) -> XmlElement {
        XmlElement::new("wsse11:EncryptedHeader")
            .with_attr(ID_ATTR, wrapper_id.into())
            .with_child(self.to_element())
    }
}

/// Whether a header element is an `EncryptedHeader` wrapper
pub fn is_encrypted_header(element: &XmlElement) -> bool {
    element.local_name() == "EncryptedHeader"
}

/// An `xenc:ReferenceList`: identifiers of every ciphertext fragment that
/// must be decrypted
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceListElement {
    /// Referred identifiers, in emission order
    pub ids: Vec<String>,
}

impl ReferenceListElement {
    /// Local name of the wire element
    pub const LOCAL_NAME: &'static str = "ReferenceList";

    /// Serialize to `xenc:ReferenceList`
    pub fn to_element(&self) -> XmlElement {
        let mut element = XmlElement::new("xenc:ReferenceList");
        for id in &self.ids {
            element = element.with_child(
                XmlElement::new("xenc:DataReference").with_attr("URI", format!("#{id}")),
            );
        }
        element
    }

    /// Parse an `xenc:ReferenceList`
    pub fn from_element(element: &XmlElement) -> Result<Self, SecurityError> {
        let mut ids = Vec::new();
        for child in element.child_elements() {
            if child.local_name() != "DataReference" {
                return Err(SecurityError::Format(format!(
                    "unexpected element {} in ReferenceList",
                    child.name
                )));
            }
            let uri = child.attr("URI").ok_or_else(|| {
                SecurityError::Format("DataReference is missing URI".to_string())
            })?;
            ids.push(KeyIdentifier::from_uri(uri)?.local_id().to_string());
        }
        Ok(ReferenceListElement { ids })
    }
}

/// A `wsu:Timestamp` carrying the message's freshness window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampElement {
    /// Targettable identifier
    pub id: String,
    /// Creation instant
    pub created: DateTime<Utc>,
    /// Expiry instant
    pub expires: DateTime<Utc>,
}

impl TimestampElement {
    /// Local name of the wire element
    pub const LOCAL_NAME: &'static str = "Timestamp";

    /// A timestamp valid for `ttl` starting now
    pub fn fresh(id: impl Into<String>, ttl: Duration) -> Self {
        let created = Utc::now();
        TimestampElement {
            id: id.into(),
            created,
            expires: created + ttl,
        }
    }

    /// Serialize to `wsu:Timestamp`
    pub fn to_element(&self) -> XmlElement {
        XmlElement::new("wsu:Timestamp")
            .with_attr(ID_ATTR, &self.id)
            .with_child(
                XmlElement::new("wsu:Created")
                    .with_text(self.created.to_rfc3339_opts(SecondsFormat::Millis, true)),
            )
            .with_child(
                XmlElement::new("wsu:Expires")
                    .with_text(self.expires.to_rfc3339_opts(SecondsFormat::Millis, true)),
            )
    }

    /// Parse a `wsu:Timestamp`
    pub fn from_element(element: &XmlElement) -> Result<Self, SecurityError> {
        let id = element
            .id()
            .ok_or_else(|| SecurityError::Format("Timestamp is missing wsu:Id".to_string()))?
            .to_string();
        let created = parse_instant(element, "Created")?;
        let expires = parse_instant(element, "Expires")?;
        if expires < created {
            return Err(SecurityError::Format(
                "Timestamp expires before it was created".to_string(),
            ));
        }
        Ok(TimestampElement {
            id,
            created,
            expires,
        })
    }

    /// Validate freshness against the local clock with the given skew
    pub fn validate_freshness(&self, clock_skew: Duration) -> Result<(), SecurityError> {
        let now = Utc::now();
        if self.created > now + clock_skew {
            return Err(SecurityError::MessageSecurity {
                reason: "timestamp was created in the future".to_string(),
            });
        }
        if self.expires + clock_skew < now {
            return Err(SecurityError::MessageSecurity {
                reason: "timestamp has expired".to_string(),
            });
        }
        Ok(())
    }
}

fn parse_instant(element: &XmlElement, child: &str) -> Result<DateTime<Utc>, SecurityError> {
    let text = element
        .find_child(child)
        .map(|el| el.text())
        .ok_or_else(|| SecurityError::Format(format!("Timestamp is missing {child}")))?;
    DateTime::parse_from_rfc3339(text.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SecurityError::Format(format!("Timestamp {child} is invalid: {e}")))
}

/// A `wsse11:SignatureConfirmation` echoing a previously received
/// signature value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureConfirmationElement {
    /// Targettable identifier (confirmations are themselves signed)
    pub id: String,
    /// The confirmed signature value
    pub value: Vec<u8>,
}

impl SignatureConfirmationElement {
    /// Local name of the wire element
    pub const LOCAL_NAME: &'static str = "SignatureConfirmation";

    /// Serialize to `wsse11:SignatureConfirmation`
    pub fn to_element(&self) -> XmlElement {
        XmlElement::new("wsse11:SignatureConfirmation")
            .with_attr(ID_ATTR, &self.id)
            .with_attr("Value", BASE64.encode(&self.value))
    }

    /// Parse a `wsse11:SignatureConfirmation`
    pub fn from_element(element: &XmlElement) -> Result<Self, SecurityError> {
        let id = element
            .id()
            .ok_or_else(|| {
                SecurityError::Format("SignatureConfirmation is missing wsu:Id".to_string())
            })?
            .to_string();
        let value = element
            .attr("Value")
            .map(|v| {
                BASE64.decode(v).map_err(|e| {
                    SecurityError::Format(format!(
                        "SignatureConfirmation value is not base64: {e}"
                    ))
                })
            })
            .transpose()?
            .ok_or_else(|| {
                SecurityError::Format("SignatureConfirmation is missing Value".to_string())
            })?;
        Ok(SignatureConfirmationElement { id, value })
    }
}

/// A standalone `wsse:SecurityTokenReference` used by the STR transform:
/// a targettable indirection pointing at another element
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityTokenReferenceElement {
    /// Identifier of the reference element itself
    pub id: String,
    /// Identifier of the referred element
    pub target_id: String,
}

impl SecurityTokenReferenceElement {
    /// Local name of the wire element
    pub const LOCAL_NAME: &'static str = "SecurityTokenReference";

    /// Serialize to `wsse:SecurityTokenReference`
    pub fn to_element(&self) -> XmlElement {
        XmlElement::new("wsse:SecurityTokenReference")
            .with_attr(ID_ATTR, &self.id)
            .with_child(
                XmlElement::new("wsse:Reference")
                    .with_attr("URI", format!("#{}", self.target_id)),
            )
    }

    /// Parse a `wsse:SecurityTokenReference`
    pub fn from_element(element: &XmlElement) -> Result<Self, SecurityError> {
        let id = element
            .id()
            .ok_or_else(|| {
                SecurityError::Format("SecurityTokenReference is missing wsu:Id".to_string())
            })?
            .to_string();
        let uri = element
            .find_child("Reference")
            .and_then(|r| r.attr("URI"))
            .ok_or_else(|| {
                SecurityError::Format("SecurityTokenReference is missing Reference".to_string())
            })?;
        Ok(SecurityTokenReferenceElement {
            id,
            target_id: KeyIdentifier::from_uri(uri)?.local_id().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suite::EXCLUSIVE_C14N;

    #[test]
    fn signed_info_round_trips() {
        let signed_info = SignedInfo {
            canonicalization_uri: EXCLUSIVE_C14N.to_string(),
            signature_method_uri: "http://www.w3.org/2000/09/xmldsig#hmac-sha1".to_string(),
            references: vec![
                SignedReference {
                    id: "id-1".to_string(),
                    str_transform: false,
                    digest_algorithm: DigestAlgorithm::Sha1,
                    digest_value: vec![1; 20],
                },
                SignedReference {
                    id: "str-1".to_string(),
                    str_transform: true,
                    digest_algorithm: DigestAlgorithm::Sha1,
                    digest_value: vec![2; 20],
                },
            ],
        };
        let parsed = SignedInfo::from_element(&signed_info.to_element()).unwrap();
        assert_eq!(parsed, signed_info);
        assert!(parsed.references[1].str_transform);
    }

    #[test]
    fn signature_round_trips() {
        let signature = SignatureElement {
            id: Some("sig-1".to_string()),
            signed_info: SignedInfo {
                canonicalization_uri: EXCLUSIVE_C14N.to_string(),
                signature_method_uri: "http://www.w3.org/2001/04/xmldsig-more#hmac-sha256"
                    .to_string(),
                references: vec![],
            },
            signature_value: vec![7; 32],
            key_reference: KeyIdentifier::LocalId("tok-1".to_string()),
        };
        let parsed = SignatureElement::from_element(&signature.to_element()).unwrap();
        assert_eq!(parsed, signature);
    }

    #[test]
    fn encrypted_data_round_trips() {
        let encrypted = EncryptedDataElement {
            id: "enc-1".to_string(),
            algorithm_uri: "http://www.w3.org/2009/xmlenc11#aes256-gcm".to_string(),
            key_reference: Some(KeyIdentifier::LocalId("tok-1".to_string())),
            cipher_value: vec![9; 48],
        };
        let parsed = EncryptedDataElement::from_element(&encrypted.to_element()).unwrap();
        assert_eq!(parsed, encrypted);
    }

    #[test]
    fn encrypted_header_wrapper() {
        let encrypted = EncryptedDataElement {
            id: "enc-1".to_string(),
            algorithm_uri: "http://www.w3.org/2009/xmlenc11#aes128-gcm".to_string(),
            key_reference: None,
            cipher_value: vec![1, 2, 3],
        };
        let wrapper = encrypted.clone().into_encrypted_header("enchdr-1");
        assert!(is_encrypted_header(&wrapper));
        assert_eq!(wrapper.id(), Some("enchdr-1"));
        let inner = wrapper.find_child("EncryptedData").unwrap();
        assert_eq!(EncryptedDataElement::from_element(inner).unwrap(), encrypted);
    }

    #[test]
    fn reference_list_round_trips() {
        let list = ReferenceListElement {
            ids: vec!["enc-1".to_string(), "enc-2".to_string()],
        };
        let parsed = ReferenceListElement::from_element(&list.to_element()).unwrap();
        assert_eq!(parsed, list);
    }

    #[test]
    fn reference_list_rejects_foreign_children() {
        let element =
            XmlElement::new("xenc:ReferenceList").with_child(XmlElement::new("xenc:KeyReference"));
        assert!(ReferenceListElement::from_element(&element)
            .unwrap_err()
            .is_format_error());
    }

    #[test]
    fn timestamp_round_trip_and_freshness() {
        let ts = TimestampElement::fresh("ts-1", Duration::minutes(5));
        let parsed = TimestampElement::from_element(&ts.to_element()).unwrap();
        assert_eq!(parsed.id, "ts-1");
        parsed.validate_freshness(Duration::minutes(5)).unwrap();

        let expired = TimestampElement {
            id: "ts-2".to_string(),
            created: Utc::now() - Duration::hours(2),
            expires: Utc::now() - Duration::hours(1),
        };
        let err = expired.validate_freshness(Duration::minutes(5)).unwrap_err();
        assert!(err.is_security_fault());
    }

    #[test]
    fn timestamp_rejects_inverted_window() {
        let ts = TimestampElement {
            id: "ts-3".to_string(),
            created: Utc::now(),
            expires: Utc::now() - Duration::minutes(10),
        };
        assert!(TimestampElement::from_element(&ts.to_element())
            .unwrap_err()
            .is_format_error());
    }

    #[test]
    fn signature_confirmation_round_trips() {
        let confirmation = SignatureConfirmationElement {
            id: "conf-1".to_string(),
            value: vec![4; 20],
        };
        let parsed =
            SignatureConfirmationElement::from_element(&confirmation.to_element()).unwrap();
        assert_eq!(parsed, confirmation);
    }

    #[test]
    fn str_element_round_trips() {
        let str_el = SecurityTokenReferenceElement {
            id: "str-1".to_string(),
            target_id: "tok-1".to_string(),
        };
        let parsed = SecurityTokenReferenceElement::from_element(&str_el.to_element()).unwrap();
        assert_eq!(parsed, str_el);
    }
}
