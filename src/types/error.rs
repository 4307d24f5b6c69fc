//! Error types for medichain operations.
//!
//! The taxonomy keeps "you're not allowed", "it doesn't exist", and "it's
//! temporarily unreachable" distinct, since callers need to react
//! differently to each.

use thiserror::Error;

/// Main error type for medichain operations.
#[derive(Debug, Error)]
pub enum MedichainError {
    /// Caller lacks the capability required by the operation.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Referenced patient, record, or request does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A record with this id already exists for the patient.
    #[error("Duplicate record {record_id} for patient {patient}")]
    DuplicateRecord { patient: String, record_id: String },

    /// The patient address has already been registered.
    #[error("Already registered: {0}")]
    AlreadyRegistered(String),

    /// The request has already been approved or denied.
    #[error("Request not pending: {0}")]
    NotPending(String),

    /// Requested access duration must be positive.
    #[error("Invalid duration: {0} seconds")]
    InvalidDuration(u64),

    /// Authentication tag mismatch: wrong key or corrupted ciphertext.
    /// Distinct from transport failure; callers may retry with an
    /// alternate candidate key before surfacing this.
    #[error("Decryption failed: {0}")]
    Decryption(String),

    /// All content-store gateways were exhausted without a success.
    #[error("Content store unavailable: {0}")]
    ContentStoreUnavailable(String),

    /// Ledger call failed or the backend is unreachable.
    #[error("Ledger error: {0}")]
    Ledger(String),

    /// The transaction was declined before submission (e.g. the user
    /// refused to sign). Terminal, not a timeout.
    #[error("Transaction rejected: {0}")]
    Rejected(String),

    /// A stored row or artifact could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invariant violation inside an adapter (e.g. a content-addressed
    /// blob whose bytes no longer match its id).
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for medichain operations.
pub type Result<T> = std::result::Result<T, MedichainError>;
