//! Error types for Arbor

use thiserror::Error;
use uuid::Uuid;

/// Main error type for Arbor operations
///
/// Unknown ids are not errors: lookups, deletes and mutations return
/// `Ok(None)` so a batch operation can keep going.
#[derive(Error, Debug)]
pub enum ArborError {
    /// Eviction could not free a slot in the named tier
    #[error("Capacity exhausted in {tier}")]
    CapacityExhausted { tier: String },

    /// Archive record failed authentication or could not be parsed
    #[error("Integrity check failed for archived entry {id}")]
    Integrity { id: Uuid },

    /// A deadline expired (key derivation, encryption, decryption)
    #[error("Timed out during {operation}")]
    Timeout { operation: String },

    /// Persistence failure that survived a retry
    #[error("Storage I/O error: {0}")]
    StorageIo(String),

    /// The id is already held by a different category
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Promotion target is not above the current category
    #[error("Invalid promotion: {0}")]
    InvalidPromotion(String),

    /// Another consolidation run holds the consolidator
    #[error("A consolidation run is already in progress")]
    ConsolidationInProgress,

    /// Key or cipher setup errors
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// General errors
    #[error("{0}")]
    General(String),
}

impl From<serde_json::Error> for ArborError {
    fn from(e: serde_json::Error) -> Self {
        ArborError::Serialization(e.to_string())
    }
}

/// Result type alias for Arbor operations
pub type Result<T> = std::result::Result<T, ArborError>;
