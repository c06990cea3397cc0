use thiserror::Error;

/// Errors that can occur within the claim/finish engine.
///
/// Claim races and lost leases are not errors: they surface as `None`,
/// empty vectors or `false` from the store.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A JSON column (result, messages) could not be encoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The hostname lookup itself failed (distinct from "no hostname").
    #[error("Hostname resolution failed for site {site_id}: {reason}")]
    Resolver { site_id: String, reason: String },

    /// A stored value could not be mapped onto the domain model.
    #[error("Invalid job data: {0}")]
    InvalidData(String),

    /// No job with the given ID exists in the store.
    #[error("Job not found: {id}")]
    JobNotFound { id: String },
}

pub type Result<T> = std::result::Result<T, EngineError>;
