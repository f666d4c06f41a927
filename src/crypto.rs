//! Symmetric cryptographic operations for message protection
//!
//! AES-GCM for message-part encryption, SHA digests for signature
//! references, and HMAC with constant-time verification for signature
//! values. Everything here is synchronous and CPU-bound; callers gate the
//! inputs through the algorithm suite before invoking these functions.
//!
//! The ciphertext layout matches the usual streaming form: a random
//! 96-bit IV prepended to the AEAD output (ciphertext + 128-bit tag).

use crate::suite::{DigestAlgorithm, EncryptionAlgorithm, SymmetricSignatureAlgorithm};
use aes_gcm::aead::consts::U12;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm, Nonce};
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

/// AES-192-GCM; the aes-gcm crate only ships 128/256 aliases
type Aes192Gcm = AesGcm<aes_gcm::aes::Aes192, U12>;

type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;

const GCM_IV_SIZE: usize = 12;
const GCM_TAG_SIZE: usize = 16;

/// Errors from low-level cryptographic operations.
///
/// These never cross the crate boundary directly: the send/receive
/// pipelines normalize them into the opaque message-security fault.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("invalid key length for {algorithm}: {got} bytes")]
    InvalidKeyLength {
        algorithm: &'static str,
        got: usize,
    },
    #[error("ciphertext too short: {got} bytes")]
    CiphertextTooShort { got: usize },
    #[error("MAC verification failed")]
    MacVerificationFailed,
}

/// Fill a buffer with OS randomness
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Encrypt `plaintext` under the given algorithm and key.
///
/// Returns `IV || ciphertext || tag`.
pub fn encrypt_data(
    algorithm: EncryptionAlgorithm,
    key: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let mut iv = [0u8; GCM_IV_SIZE];
    OsRng.fill_bytes(&mut iv);
    let nonce = Nonce::from_slice(&iv);

    let ciphertext = match algorithm {
        EncryptionAlgorithm::Aes128Gcm => Aes128Gcm::new_from_slice(key)
            .map_err(|_| CryptoError::InvalidKeyLength {
                algorithm: "AES-128-GCM",
                got: key.len(),
            })?
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?,
        EncryptionAlgorithm::Aes192Gcm => Aes192Gcm::new_from_slice(key)
            .map_err(|_| CryptoError::InvalidKeyLength {
                algorithm: "AES-192-GCM",
                got: key.len(),
            })?
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?,
        EncryptionAlgorithm::Aes256Gcm => Aes256Gcm::new_from_slice(key)
            .map_err(|_| CryptoError::InvalidKeyLength {
                algorithm: "AES-256-GCM",
                got: key.len(),
            })?
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?,
    };

    let mut out = Vec::with_capacity(GCM_IV_SIZE + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt `IV || ciphertext || tag` produced by [`encrypt_data`]
pub fn decrypt_data(
    algorithm: EncryptionAlgorithm,
    key: &[u8],
    data: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if data.len() < GCM_IV_SIZE + GCM_TAG_SIZE {
        return Err(CryptoError::CiphertextTooShort { got: data.len() });
    }
    let (iv, ciphertext) = data.split_at(GCM_IV_SIZE);
    let nonce = Nonce::from_slice(iv);

    match algorithm {
        EncryptionAlgorithm::Aes128Gcm => Aes128Gcm::new_from_slice(key)
            .map_err(|_| CryptoError::InvalidKeyLength {
                algorithm: "AES-128-GCM",
                got: key.len(),
            })?
            .decrypt(nonce, ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed),
        EncryptionAlgorithm::Aes192Gcm => Aes192Gcm::new_from_slice(key)
            .map_err(|_| CryptoError::InvalidKeyLength {
                algorithm: "AES-192-GCM",
                got: key.len(),
            })?
            .decrypt(nonce, ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed),
        EncryptionAlgorithm::Aes256Gcm => Aes256Gcm::new_from_slice(key)
            .map_err(|_| CryptoError::InvalidKeyLength {
                algorithm: "AES-256-GCM",
                got: key.len(),
            })?
            .decrypt(nonce, ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed),
    }
}

/// Compute a digest over canonicalized bytes
pub fn digest_bytes(algorithm: DigestAlgorithm, data: &[u8]) -> Vec<u8> {
    match algorithm {
        DigestAlgorithm::Sha1 => Sha1::digest(data).to_vec(),
        DigestAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
    }
}

/// Compute a signature MAC over canonicalized bytes
pub fn hmac_sign(
    algorithm: SymmetricSignatureAlgorithm,
    key: &[u8],
    data: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    match algorithm {
        SymmetricSignatureAlgorithm::HmacSha1 => {
            let mut mac =
                <HmacSha1 as Mac>::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength {
                    algorithm: "HMAC-SHA1",
                    got: key.len(),
                })?;
            mac.update(data);
            Ok(mac.finalize().into_bytes().to_vec())
        }
        SymmetricSignatureAlgorithm::HmacSha256 => {
            let mut mac =
                <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength {
                    algorithm: "HMAC-SHA256",
                    got: key.len(),
                })?;
            mac.update(data);
            Ok(mac.finalize().into_bytes().to_vec())
        }
    }
}

/// Verify a signature MAC in constant time.
///
/// Variable-time comparison would leak the prefix length of a partially
/// correct forgery through timing.
pub fn hmac_verify(
    algorithm: SymmetricSignatureAlgorithm,
    key: &[u8],
    data: &[u8],
    expected: &[u8],
) -> Result<(), CryptoError> {
    let calculated = hmac_sign(algorithm, key, data)?;
    if calculated.ct_eq(expected).into() {
        Ok(())
    } else {
        Err(CryptoError::MacVerificationFailed)
    }
}

/// Constant-time byte equality for digests and key material
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_round_trip_all_ciphers() {
        for (algorithm, key_len) in [
            (EncryptionAlgorithm::Aes128Gcm, 16),
            (EncryptionAlgorithm::Aes192Gcm, 24),
            (EncryptionAlgorithm::Aes256Gcm, 32),
        ] {
            let key = random_bytes(key_len);
            let plaintext = b"<a:To wsu:Id=\"id-1\">http://example.org/svc</a:To>";
            let ciphertext = encrypt_data(algorithm, &key, plaintext).unwrap();
            assert_ne!(&ciphertext[GCM_IV_SIZE..], plaintext.as_slice());
            let decrypted = decrypt_data(algorithm, &key, &ciphertext).unwrap();
            assert_eq!(decrypted, plaintext);
        }
    }

    #[test]
    fn decrypt_rejects_wrong_key() {
        let key = random_bytes(32);
        let other = random_bytes(32);
        let ciphertext =
            encrypt_data(EncryptionAlgorithm::Aes256Gcm, &key, b"secret").unwrap();
        let result = decrypt_data(EncryptionAlgorithm::Aes256Gcm, &other, &ciphertext);
        assert!(matches!(result, Err(CryptoError::DecryptionFailed)));
    }

    #[test]
    fn decrypt_rejects_tampered_ciphertext() {
        let key = random_bytes(16);
        let mut ciphertext =
            encrypt_data(EncryptionAlgorithm::Aes128Gcm, &key, b"secret").unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0x01;
        let result = decrypt_data(EncryptionAlgorithm::Aes128Gcm, &key, &ciphertext);
        assert!(matches!(result, Err(CryptoError::DecryptionFailed)));
    }

    #[test]
    fn decrypt_rejects_truncated_input() {
        let key = random_bytes(16);
        let result = decrypt_data(EncryptionAlgorithm::Aes128Gcm, &key, &[0u8; 8]);
        assert!(matches!(result, Err(CryptoError::CiphertextTooShort { .. })));
    }

    #[test]
    fn wrong_key_size_is_rejected_before_encryption() {
        let key = random_bytes(16);
        let result = encrypt_data(EncryptionAlgorithm::Aes256Gcm, &key, b"x");
        assert!(matches!(result, Err(CryptoError::InvalidKeyLength { .. })));
    }

    #[test]
    fn digest_lengths() {
        assert_eq!(digest_bytes(DigestAlgorithm::Sha1, b"abc").len(), 20);
        assert_eq!(digest_bytes(DigestAlgorithm::Sha256, b"abc").len(), 32);
    }

    #[test]
    fn hmac_sign_and_verify() {
        let key = random_bytes(24);
        let data = b"<ds:SignedInfo>...</ds:SignedInfo>";
        for algorithm in [
            SymmetricSignatureAlgorithm::HmacSha1,
            SymmetricSignatureAlgorithm::HmacSha256,
        ] {
            let sig = hmac_sign(algorithm, &key, data).unwrap();
            hmac_verify(algorithm, &key, data, &sig).unwrap();

            let mut bad = sig.clone();
            bad[0] ^= 0xFF;
            assert!(matches!(
                hmac_verify(algorithm, &key, data, &bad),
                Err(CryptoError::MacVerificationFailed)
            ));
        }
    }
}
