//! Error types for the object transform pipeline

use std::io;

/// All errors that can occur while encoding or decoding an object.
#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    /// A factory or config file was given invalid settings (bad level, bad key size, ...)
    #[error("Invalid transform configuration: {0}")]
    InvalidConfig(String),
    /// The requested cipher transformation is not supported
    #[error("Unsupported cipher: {0}")]
    UnsupportedCipher(String),
    /// Key material could not be parsed or used
    #[error("Invalid key material: {0}")]
    InvalidKey(String),
    /// Two factories with the same class tag were registered on one chain
    #[error("Duplicate transform class registered: {0}")]
    DuplicateTransform(String),
    /// Caller metadata used a key reserved for transform bookkeeping
    #[error("Metadata key {0} is reserved for transform metadata")]
    ReservedMetadataKey(String),
    /// I/O error from the underlying sink or source
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// The object was wrapped with a master key that is not in the key ring
    #[error("Master key {key_id} not found in key ring")]
    KeyNotFound {
        /// Fingerprint recorded in the object's metadata
        key_id: String,
    },
    /// Signature, digest or envelope check failed; the object may have been tampered with
    #[error("Integrity check failed: {0}")]
    IntegrityViolation(String),
    /// A stored config string names a transform this chain cannot rebuild
    #[error("Unsupported transform: {0}")]
    UnsupportedTransform(String),
    /// Operation called in the wrong lifecycle state (e.g. metadata before close)
    #[error("Illegal state: {0}")]
    IllegalState(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TransformError>;

impl TransformError {
    /// Recover a `TransformError` that was carried through a `std::io::Error`
    /// by a `Read`/`Write` adapter. Plain I/O errors come back as `Io`.
    pub fn from_io(err: io::Error) -> Self {
        if err
            .get_ref()
            .is_some_and(|inner| inner.is::<TransformError>())
        {
            if let Some(inner) = err.into_inner() {
                if let Ok(transform) = inner.downcast::<TransformError>() {
                    return *transform;
                }
            }
            return TransformError::Io(io::Error::other("transform error lost in conversion"));
        }
        TransformError::Io(err)
    }

    /// True for errors that indicate tampering or corruption of the stored object.
    pub fn is_integrity(&self) -> bool {
        matches!(self, TransformError::IntegrityViolation(_))
    }
}

impl From<TransformError> for io::Error {
    fn from(err: TransformError) -> Self {
        match err {
            TransformError::Io(e) => e,
            TransformError::IntegrityViolation(_) => io::Error::new(io::ErrorKind::InvalidData, err),
            other => io::Error::other(other),
        }
    }
}
