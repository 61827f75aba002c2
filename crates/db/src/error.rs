//! Database error types.

/// Errors raised by the persistent index layer.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    /// The embedded engine failed.
    #[error("storage engine error: {0}")]
    Backend(#[from] sled::Error),
    /// A stored value failed to decode.
    #[error("failed to decode value in table {table}: {reason}")]
    Decode {
        /// The table the value was read from.
        table: &'static str,
        /// Decoder failure detail.
        reason: String,
    },
    /// A stored key failed to decode.
    #[error("failed to decode key in table {table}")]
    DecodeKey {
        /// The table the key was read from.
        table: &'static str,
    },
    /// A required entry was missing.
    #[error("missing entry in table {table}")]
    Missing {
        /// The table that was queried.
        table: &'static str,
    },
    /// JSON export failed.
    #[error("failed to export table to json: {0}")]
    Export(#[from] std::io::Error),
}
