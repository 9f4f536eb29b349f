//! Error types shared across the yakbak crates.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building or converting core types.
#[derive(Error, Debug)]
pub enum Error {
    /// A field has an invalid format (e.g., wrong hex length).
    #[error("invalid field '{field}': {reason}")]
    InvalidField {
        /// The name of the invalid field.
        field: &'static str,
        /// Description of what's wrong.
        reason: String,
    },

    /// Hex decoding error.
    #[error("hex decode error: {0}")]
    HexDecode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_field_display() {
        let err = Error::InvalidField {
            field: "author",
            reason: "not 64 hex characters".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("author"));
        assert!(msg.contains("not 64 hex characters"));
    }

    #[test]
    fn test_hex_decode_display() {
        let err = Error::HexDecode("invalid character 'g'".to_string());
        let msg = err.to_string();
        assert!(msg.contains("hex decode error"));
        assert!(msg.contains("invalid character"));
    }
}
