//! Error handling for the node
//!
//! Every fallible operation in the crate returns [`Result`]. Validation
//! failures carry a human readable reason that ends up in submission replies
//! and peer logs.

use std::fmt;

/// Result type alias for node operations
pub type Result<T> = std::result::Result<T, BlockchainError>;

/// Error types for all node operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockchainError {
    /// A block, header or transaction broke a consensus rule
    Validation(String),
    /// A block whose parent is not known locally
    Orphan(String),
    /// Database-related errors
    Database(String),
    /// Serialization/deserialization errors
    Serialization(String),
    /// Network communication and peer protocol errors
    Network(String),
    /// Key handling and signing errors
    Crypto(String),
    /// Configuration errors
    Config(String),
    /// File I/O errors
    Io(String),
    /// A lock was poisoned by a panicking thread
    Lock(String),
}

impl BlockchainError {
    /// True for failures caused by the object being checked rather than by
    /// the node itself.
    pub fn is_validation(&self) -> bool {
        matches!(self, BlockchainError::Validation(_))
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        BlockchainError::Validation(msg.into())
    }
}

impl fmt::Display for BlockchainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockchainError::Validation(msg) => write!(f, "Validation error: {msg}"),
            BlockchainError::Orphan(msg) => write!(f, "Orphan block: {msg}"),
            BlockchainError::Database(msg) => write!(f, "Database error: {msg}"),
            BlockchainError::Serialization(msg) => write!(f, "Serialization error: {msg}"),
            BlockchainError::Network(msg) => write!(f, "Network error: {msg}"),
            BlockchainError::Crypto(msg) => write!(f, "Cryptographic error: {msg}"),
            BlockchainError::Config(msg) => write!(f, "Configuration error: {msg}"),
            BlockchainError::Io(msg) => write!(f, "I/O error: {msg}"),
            BlockchainError::Lock(msg) => write!(f, "Lock poisoned: {msg}"),
        }
    }
}

impl std::error::Error for BlockchainError {}

impl From<std::io::Error> for BlockchainError {
    fn from(err: std::io::Error) -> Self {
        BlockchainError::Io(err.to_string())
    }
}

impl From<sled::Error> for BlockchainError {
    fn from(err: sled::Error) -> Self {
        BlockchainError::Database(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for BlockchainError {
    fn from(err: bincode::error::EncodeError) -> Self {
        BlockchainError::Serialization(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for BlockchainError {
    fn from(err: bincode::error::DecodeError) -> Self {
        BlockchainError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for BlockchainError {
    fn from(err: serde_json::Error) -> Self {
        BlockchainError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for BlockchainError {
    fn from(err: toml::de::Error) -> Self {
        BlockchainError::Config(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for BlockchainError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        BlockchainError::Lock(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_reason() {
        let err = BlockchainError::validation("Coinbase could have spent 5 but spent 6");
        assert_eq!(
            err.to_string(),
            "Validation error: Coinbase could have spent 5 but spent 6"
        );
        assert!(err.is_validation());
        assert!(!BlockchainError::Orphan("x".into()).is_validation());
    }
}
