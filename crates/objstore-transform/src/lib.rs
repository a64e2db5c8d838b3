#![warn(missing_docs)]

//! Object transform pipeline: envelope encryption (AES-CBC under RSA-wrapped per-object keys)
//! and streaming compression (Deflate, LZMA), composed into a chain recorded in object metadata.
//!
//! Write path: Data → Compress → Encrypt → Store, plus metadata describing every step
//! Read path:  Store → Decrypt → Decompress → Data, driven only by the stored metadata

pub mod chain;
pub mod cipher;
pub mod compression;
pub mod config;
pub mod encryption;
pub mod error;
pub mod key_ring;
pub mod keys;
pub mod metadata;
pub mod pipe;
pub mod stream;
pub mod transform;

pub use chain::{DecodedObject, EncodingStream, TransformChain};
pub use cipher::{CipherSpec, EnvelopeKey};
pub use compression::{compression_ratio, CompressionFactory, CompressionMode, LzmaProfile};
pub use config::{CompressionConfig, EncryptionConfig, PipelineConfig};
pub use encryption::EncryptionFactory;
pub use error::{Result, TransformError};
pub use key_ring::MasterKeyRing;
pub use keys::MasterKeyPair;
pub use metadata::Metadata;
pub use pipe::PipeConfig;
pub use stream::{BoxSink, BoxSource, MemorySink, ObjectSink, WriterSink};
pub use transform::{ConfigString, TransformClass, TransformFactory, Transformer};
