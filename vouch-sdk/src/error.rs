//! Codec error type.

/// Errors produced while parsing, validating, or signing messages.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    /// Bytes did not parse as JSON or were not in canonical form.
    #[error("message is not canonical JSON")]
    InvalidFormat,

    /// A required field was absent or had the wrong shape.
    #[error("missing or malformed field: {0}")]
    MissingField(&'static str),

    /// Signature verification failed.
    #[error("invalid signature")]
    InvalidSignature,

    /// Author or recipient identifier lists were not canonically sorted.
    #[error("author/recipient lists are not sorted")]
    UnsortedLists,

    /// A public or secret key failed to decode.
    #[error("invalid key encoding")]
    InvalidKey,
}
