//! Metadata keys written by the transforms and helpers for merging and stripping them.
//!
//! Every key a transform adds lives under the `x-emc-` namespace. Encryption and compression
//! use disjoint prefixes so their fields never collide, and the chain composer keeps the
//! ordered list of applied config strings under [`TRANSFORM_MODE`].

use crate::error::{Result, TransformError};
use std::collections::HashMap;

/// Object metadata as exchanged with the storage service.
pub type Metadata = HashMap<String, String>;

/// Ordered, `|`-joined list of applied config strings.
pub const TRANSFORM_MODE: &str = "x-emc-transform-mode";

/// Separator between config strings under [`TRANSFORM_MODE`].
pub const TRANSFORM_MODE_SEPARATOR: &str = "|";

/// Prefix of all encryption fields.
pub const ENC_PREFIX: &str = "x-emc-enc-";
/// Base64 cipher IV.
pub const ENC_IV: &str = "x-emc-enc-iv";
/// Hex fingerprint of the master key that wrapped the object key.
pub const ENC_KEY_ID: &str = "x-emc-enc-key-id";
/// Base64 RSA-wrapped object key.
pub const ENC_OBJECT_KEY: &str = "x-emc-enc-object-key";
/// Hex SHA-1 of the plaintext.
pub const ENC_UNENCRYPTED_SHA1: &str = "x-emc-enc-unencrypted-sha1";
/// Decimal plaintext byte count.
pub const ENC_UNENCRYPTED_SIZE: &str = "x-emc-enc-unencrypted-size";
/// Base64 signature over [`ENC_SIGNED_FIELDS`].
pub const ENC_SIGNATURE: &str = "x-emc-enc-metadata-signature";

/// Fields covered by the metadata signature, in canonical (lexical) order.
pub const ENC_SIGNED_FIELDS: [&str; 5] = [
    ENC_IV,
    ENC_KEY_ID,
    ENC_OBJECT_KEY,
    ENC_UNENCRYPTED_SHA1,
    ENC_UNENCRYPTED_SIZE,
];

/// Prefix of all compression fields.
pub const COMP_PREFIX: &str = "x-emc-comp-";
/// Decimal byte count before compression.
pub const COMP_UNCOMPRESSED_SIZE: &str = "x-emc-comp-uncompressed-size";
/// Decimal byte count after compression.
pub const COMP_COMPRESSED_SIZE: &str = "x-emc-comp-compressed-size";
/// Space saved, as a percentage with one decimal.
pub const COMP_RATIO: &str = "x-emc-comp-compression-ratio";
/// Hex SHA-1 of the uncompressed bytes.
pub const COMP_UNCOMPRESSED_SHA1: &str = "x-emc-comp-uncompressed-sha1";

/// True if `key` belongs to a namespace owned by the transform pipeline.
pub fn is_reserved(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.starts_with(ENC_PREFIX) || key.starts_with(COMP_PREFIX) || key == TRANSFORM_MODE
}

/// Reject caller metadata that would be shadowed by transform fields.
pub fn check_caller_metadata(metadata: &Metadata) -> Result<()> {
    match metadata.keys().find(|k| is_reserved(k)) {
        Some(key) => Err(TransformError::ReservedMetadataKey(key.clone())),
        None => Ok(()),
    }
}

/// Copy of `metadata` without any key starting with `prefix`.
pub fn strip_prefix(metadata: &Metadata, prefix: &str) -> Metadata {
    metadata
        .iter()
        .filter(|(k, _)| !k.starts_with(prefix))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Fetch a required field or report the object as corrupt.
pub fn require<'a>(metadata: &'a Metadata, key: &str) -> Result<&'a str> {
    metadata
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| TransformError::IntegrityViolation(format!("missing metadata field {key}")))
}

/// Join config strings for storage under [`TRANSFORM_MODE`].
pub fn encode_transform_mode<S: AsRef<str>>(configs: &[S]) -> String {
    configs
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join(TRANSFORM_MODE_SEPARATOR)
}

/// Split the stored transform list. Empty or absent means no transforms were applied.
pub fn decode_transform_mode(metadata: &Metadata) -> Vec<String> {
    metadata
        .get(TRANSFORM_MODE)
        .map(|v| {
            v.split(TRANSFORM_MODE_SEPARATOR)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
