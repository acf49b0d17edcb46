//! Utility functions and helpers
//!
//! Hashing, signatures, wall-clock time and the bincode helpers used
//! throughout the node.

pub mod crypto;
pub mod serialization;

pub use crypto::{
    current_timestamp, ripemd160_digest, sha256_digest, sha256_digest_parts, verify_signature,
    SigningKey, SIG_TYPE_ECDSA_P256, SIG_TYPE_ED25519,
};

pub use serialization::{deserialize, deserialize_exact, serialize};
