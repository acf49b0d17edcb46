use ring::digest::{Context, SHA256};
use ring::rand::SystemRandom;
use ring::signature::{
    EcdsaKeyPair, Ed25519KeyPair, KeyPair, UnparsedPublicKey, ECDSA_P256_SHA256_FIXED,
    ECDSA_P256_SHA256_FIXED_SIGNING, ED25519,
};
use ripemd::{Digest as RipemdDigest, Ripemd160};

use crate::error::{BlockchainError, Result};
use std::time::{SystemTime, UNIX_EPOCH};

/// ECDSA over P-256 with SHA-256, fixed-width r‖s signatures
pub const SIG_TYPE_ECDSA_P256: u32 = 1;
/// Ed25519
pub const SIG_TYPE_ED25519: u32 = 2;

pub fn current_timestamp() -> Result<i64> {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| BlockchainError::Crypto(format!("System time error: {e}")))?
        .as_millis();

    if duration > i64::MAX as u128 {
        return Err(BlockchainError::Crypto("Timestamp overflow".to_string()));
    }

    Ok(duration as i64)
}

pub fn sha256_digest(data: &[u8]) -> Vec<u8> {
    let mut context = Context::new(&SHA256);
    context.update(data);
    let digest = context.finish();
    digest.as_ref().to_vec()
}

/// SHA-256 over several slices without concatenating them first.
pub fn sha256_digest_parts(parts: &[&[u8]]) -> [u8; 32] {
    let mut context = Context::new(&SHA256);
    for part in parts {
        context.update(part);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(context.finish().as_ref());
    out
}

pub fn ripemd160_digest(data: &[u8]) -> Vec<u8> {
    let mut hasher = Ripemd160::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

/// Checks `signature` over `message` for the given algorithm and public key.
///
/// Unknown algorithms never verify.
pub fn verify_signature(
    signature_type: u32,
    public_key: &[u8],
    message: &[u8],
    signature: &[u8],
) -> bool {
    match signature_type {
        SIG_TYPE_ECDSA_P256 => UnparsedPublicKey::new(&ECDSA_P256_SHA256_FIXED, public_key)
            .verify(message, signature)
            .is_ok(),
        SIG_TYPE_ED25519 => UnparsedPublicKey::new(&ED25519, public_key)
            .verify(message, signature)
            .is_ok(),
        _ => false,
    }
}

/// A local signing key for regtest tooling and tests
pub struct SigningKey {
    signature_type: u32,
    pkcs8: Vec<u8>,
    public_key: Vec<u8>,
}

impl SigningKey {
    pub fn generate(signature_type: u32) -> Result<SigningKey> {
        let rng = SystemRandom::new();
        match signature_type {
            SIG_TYPE_ECDSA_P256 => {
                let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
                    .map_err(|e| {
                        BlockchainError::Crypto(format!("Failed to generate ECDSA key pair: {e}"))
                    })?
                    .as_ref()
                    .to_vec();
                let key_pair =
                    EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &pkcs8, &rng)
                        .map_err(|e| {
                            BlockchainError::Crypto(format!("Failed to load ECDSA key pair: {e}"))
                        })?;
                let public_key = key_pair.public_key().as_ref().to_vec();
                Ok(SigningKey {
                    signature_type,
                    pkcs8,
                    public_key,
                })
            }
            SIG_TYPE_ED25519 => {
                let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng)
                    .map_err(|e| {
                        BlockchainError::Crypto(format!("Failed to generate Ed25519 key: {e}"))
                    })?
                    .as_ref()
                    .to_vec();
                let key_pair = Ed25519KeyPair::from_pkcs8(&pkcs8).map_err(|e| {
                    BlockchainError::Crypto(format!("Failed to load Ed25519 key: {e}"))
                })?;
                let public_key = key_pair.public_key().as_ref().to_vec();
                Ok(SigningKey {
                    signature_type,
                    pkcs8,
                    public_key,
                })
            }
            other => Err(BlockchainError::Crypto(format!(
                "Unsupported signature type {other}"
            ))),
        }
    }

    pub fn signature_type(&self) -> u32 {
        self.signature_type
    }

    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        match self.signature_type {
            SIG_TYPE_ECDSA_P256 => {
                let rng = SystemRandom::new();
                let key_pair =
                    EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &self.pkcs8, &rng)
                        .map_err(|e| {
                            BlockchainError::Crypto(format!(
                                "Failed to create key pair from PKCS8: {e}"
                            ))
                        })?;
                let signature = key_pair
                    .sign(&rng, message)
                    .map_err(|e| BlockchainError::Crypto(format!("Failed to sign message: {e}")))?;
                Ok(signature.as_ref().to_vec())
            }
            _ => {
                let key_pair = Ed25519KeyPair::from_pkcs8(&self.pkcs8).map_err(|e| {
                    BlockchainError::Crypto(format!("Failed to create key pair from PKCS8: {e}"))
                })?;
                Ok(key_pair.sign(message).as_ref().to_vec())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ecdsa_sign_and_verify() {
        let key = SigningKey::generate(SIG_TYPE_ECDSA_P256).unwrap();
        let sig = key.sign(b"hello").unwrap();
        assert!(verify_signature(SIG_TYPE_ECDSA_P256, key.public_key(), b"hello", &sig));
        assert!(!verify_signature(SIG_TYPE_ECDSA_P256, key.public_key(), b"hellp", &sig));
    }

    #[test]
    fn test_ed25519_sign_and_verify() {
        let key = SigningKey::generate(SIG_TYPE_ED25519).unwrap();
        let sig = key.sign(b"frost").unwrap();
        assert!(verify_signature(SIG_TYPE_ED25519, key.public_key(), b"frost", &sig));
        assert!(!verify_signature(SIG_TYPE_ECDSA_P256, key.public_key(), b"frost", &sig));
    }

    #[test]
    fn test_unknown_signature_type_never_verifies() {
        assert!(!verify_signature(99, &[1, 2, 3], b"msg", &[4, 5, 6]));
    }

    #[test]
    fn test_digest_parts_matches_concatenation() {
        let joined = sha256_digest(b"abcdef");
        let parts = sha256_digest_parts(&[b"abc", b"def"]);
        assert_eq!(joined.as_slice(), parts.as_slice());
        assert_eq!(ripemd160_digest(b"x").len(), 20);
    }
}
