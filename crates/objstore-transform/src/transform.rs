//! Transform factory and transformer contracts, and the config-string grammar.
//!
//! A config string is `<CLASS>:<algorithm-or-mode>[/<param>...]`, for example
//! `ENC:AES/CBC/PKCS5Padding` or `COMP:LZMA/5`. The class tag selects the factory on decode,
//! the remainder is handed to that factory to rebuild the transformer.

use crate::error::{Result, TransformError};
use crate::metadata::{Metadata, COMP_PREFIX, ENC_PREFIX};
use crate::stream::{BoxSink, BoxSource};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kinds of transform, declared in chain order: earlier variants sit closer to storage.
///
/// Encoding wraps the storage sink with each registered transform in this order, so the
/// first variant is applied last to the caller's bytes and undone first on decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TransformClass {
    /// Envelope encryption, `ENC`.
    Encryption,
    /// Streaming compression, `COMP`.
    Compression,
}

impl TransformClass {
    /// Every class, in chain order.
    pub const ALL: [TransformClass; 2] = [TransformClass::Encryption, TransformClass::Compression];

    /// Config-string prefix.
    pub fn tag(self) -> &'static str {
        match self {
            TransformClass::Encryption => "ENC",
            TransformClass::Compression => "COMP",
        }
    }

    /// Prefix of the metadata fields this class writes.
    pub fn metadata_prefix(self) -> &'static str {
        match self {
            TransformClass::Encryption => ENC_PREFIX,
            TransformClass::Compression => COMP_PREFIX,
        }
    }

    /// Look up a class by its tag (case-insensitive).
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.tag().eq_ignore_ascii_case(tag))
    }
}

impl fmt::Display for TransformClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// A config string split into its class and the class-specific remainder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigString {
    /// Transform class from the tag.
    pub class: TransformClass,
    /// Everything after `<CLASS>:`.
    pub spec: String,
}

impl ConfigString {
    /// Compose `<CLASS>:<spec>`.
    pub fn format(class: TransformClass, spec: &str) -> String {
        format!("{}:{}", class.tag(), spec)
    }

    /// Parse a stored config string. Unknown tags or a missing `:` are unsupported transforms.
    pub fn parse(config: &str) -> Result<Self> {
        let (tag, spec) = config.split_once(':').ok_or_else(|| {
            TransformError::UnsupportedTransform(format!("malformed config string '{config}'"))
        })?;
        let class = TransformClass::from_tag(tag.trim()).ok_or_else(|| {
            TransformError::UnsupportedTransform(format!("unknown transform class '{tag}'"))
        })?;
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(TransformError::UnsupportedTransform(format!(
                "empty transform spec in '{config}'"
            )));
        }
        Ok(Self {
            class,
            spec: spec.to_string(),
        })
    }

    /// Split the spec into `/`-separated parts.
    pub fn parts(&self) -> Vec<&str> {
        self.spec.split('/').collect()
    }
}

/// Long-lived, shareable producer of transformers for one transform kind.
pub trait TransformFactory: Send + Sync {
    /// Class of the transforms this factory builds; also its place in the chain.
    fn transform_class(&self) -> TransformClass;

    /// Bind the factory's current settings to a new encoding transformer.
    fn new_encoder(&self) -> Result<Box<dyn Transformer>>;

    /// Rebuild a decoding transformer from a stored config string and the object's metadata.
    ///
    /// A config string this factory cannot parse is an [`TransformError::UnsupportedTransform`].
    fn decoder_for(
        &self,
        config: &ConfigString,
        metadata: &Metadata,
    ) -> Result<Box<dyn Transformer>>;
}

/// A single-use transform bound to one object stream.
///
/// Not meant to be shared between threads while a stream is open; one writer or one
/// reader per instance.
pub trait Transformer: Send {
    /// Config string describing exactly what this transformer does.
    fn config(&self) -> &str;

    /// Wrap a sink so bytes written to the result come out transformed in `inner`.
    fn encode_sink(&mut self, inner: BoxSink) -> Result<BoxSink>;

    /// Wrap a source so reads from the result return the original bytes.
    fn decode_source(&mut self, inner: BoxSource) -> Result<BoxSource>;

    /// `metadata` merged with this transform's fields.
    ///
    /// Only available once the sink returned by [`Transformer::encode_sink`] is closed;
    /// earlier calls fail with [`TransformError::IllegalState`].
    fn encoded_metadata(&self, metadata: &Metadata) -> Result<Metadata>;

    /// `metadata` with this transform's fields removed.
    fn decoded_metadata(&self, metadata: &Metadata) -> Metadata;
}
