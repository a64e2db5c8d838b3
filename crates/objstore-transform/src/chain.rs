//! Chain composer: applies registered transforms in class order on write, records what it did
//! under [`TRANSFORM_MODE`], and undoes exactly that list on read.

use crate::compression::CompressionFactory;
use crate::config::PipelineConfig;
use crate::encryption::EncryptionFactory;
use crate::error::{Result, TransformError};
use crate::key_ring::MasterKeyRing;
use crate::keys::MasterKeyPair;
use crate::metadata::{
    check_caller_metadata, decode_transform_mode, encode_transform_mode, Metadata, TRANSFORM_MODE,
};
use crate::stream::{BoxSink, BoxSource};
use crate::transform::{ConfigString, TransformClass, TransformFactory, Transformer};
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Ordered set of transform factories, at most one per [`TransformClass`].
#[derive(Default, Clone)]
pub struct TransformChain {
    factories: BTreeMap<TransformClass, Arc<dyn TransformFactory>>,
}

impl std::fmt::Debug for TransformChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformChain")
            .field("classes", &self.classes())
            .finish()
    }
}

impl TransformChain {
    /// Empty chain; objects pass through untouched.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a factory. A second factory of the same class is rejected.
    pub fn register(&mut self, factory: Arc<dyn TransformFactory>) -> Result<()> {
        let class = factory.transform_class();
        if self.factories.contains_key(&class) {
            return Err(TransformError::DuplicateTransform(class.to_string()));
        }
        self.factories.insert(class, factory);
        Ok(())
    }

    /// Builder form of [`TransformChain::register`].
    pub fn with(mut self, factory: Arc<dyn TransformFactory>) -> Result<Self> {
        self.register(factory)?;
        Ok(self)
    }

    /// Build a chain from configuration, loading master keys from disk.
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let mut chain = Self::new();
        if let Some(comp) = &config.compression {
            let factory = CompressionFactory::new(comp.mode, comp.level)?.with_pipe(comp.pipe())?;
            chain.register(Arc::new(factory))?;
        }
        if let Some(enc) = &config.encryption {
            let current = MasterKeyPair::from_pem_file(&enc.current_key)?;
            let retained = enc
                .retained_keys
                .iter()
                .map(|path| MasterKeyPair::from_pem_file(path))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let ring = MasterKeyRing::with_retained(current, retained);
            chain.register(Arc::new(EncryptionFactory::new(ring, enc.key_size)?))?;
        }
        info!(classes = ?chain.classes(), "transform chain configured");
        Ok(chain)
    }

    /// Registered classes in chain order.
    pub fn classes(&self) -> Vec<TransformClass> {
        self.factories.keys().copied().collect()
    }

    /// The factory registered for `class`.
    pub fn factory(&self, class: TransformClass) -> Option<&Arc<dyn TransformFactory>> {
        self.factories.get(&class)
    }

    /// Wrap `sink` with every registered transform.
    ///
    /// The caller writes the object into the returned stream, closes it, then asks it for the
    /// metadata to store alongside the object.
    #[instrument(skip_all, fields(transforms = self.factories.len()))]
    pub fn encode(&self, sink: BoxSink, metadata: &Metadata) -> Result<EncodingStream> {
        check_caller_metadata(metadata)?;
        let mut transformers = Vec::with_capacity(self.factories.len());
        let mut sink = sink;
        for factory in self.factories.values() {
            let mut transformer = factory.new_encoder()?;
            sink = transformer.encode_sink(sink)?;
            transformers.push(transformer);
        }
        // Outermost wrapper sees the caller's bytes first.
        transformers.reverse();
        debug!(
            transforms = %encode_transform_mode(&configs(&transformers)),
            "encoding stream opened"
        );
        Ok(EncodingStream {
            sink: Some(sink),
            transformers,
            metadata: metadata.clone(),
            state: CloseState::Open,
        })
    }

    /// Wrap `source` to undo the transforms recorded in `metadata`.
    ///
    /// Objects with no recorded transforms and no transform fields come back unchanged. Transform
    /// fields for a class missing from the recorded list are an integrity violation.
    #[instrument(skip_all)]
    pub fn decode(&self, source: BoxSource, metadata: &Metadata) -> Result<DecodedObject> {
        let applied = decode_transform_mode(metadata);
        let recorded = applied
            .iter()
            .map(|raw| ConfigString::parse(raw))
            .collect::<Result<Vec<_>>>()?;
        check_recorded_classes(&recorded, metadata)?;
        if applied.is_empty() {
            debug!("no transforms recorded, passing through");
            let mut metadata = metadata.clone();
            metadata.remove(TRANSFORM_MODE);
            return Ok(DecodedObject {
                reader: source,
                metadata,
            });
        }

        let mut reader = source;
        let mut decoded = metadata.clone();
        for (raw, config) in applied.iter().zip(&recorded).rev() {
            let factory = self.factories.get(&config.class).ok_or_else(|| {
                TransformError::UnsupportedTransform(format!(
                    "no {} transform registered for '{raw}'",
                    config.class
                ))
            })?;
            let mut transformer = factory.decoder_for(config, metadata)?;
            reader = transformer.decode_source(reader)?;
            decoded = transformer.decoded_metadata(&decoded);
        }
        decoded.remove(TRANSFORM_MODE);
        debug!(transforms = applied.len(), "decoding stream opened");
        Ok(DecodedObject {
            reader,
            metadata: decoded,
        })
    }
}

/// Every transform field in `metadata` must belong to a class named in the transform list.
fn check_recorded_classes(configs: &[ConfigString], metadata: &Metadata) -> Result<()> {
    for class in TransformClass::ALL {
        if configs.iter().any(|c| c.class == class) {
            continue;
        }
        let prefix = class.metadata_prefix();
        if let Some(key) = metadata
            .keys()
            .find(|k| k.to_ascii_lowercase().starts_with(prefix))
        {
            return Err(TransformError::IntegrityViolation(format!(
                "metadata field {key} belongs to {class} but {TRANSFORM_MODE} does not record it"
            )));
        }
    }
    Ok(())
}

fn configs(transformers: &[Box<dyn Transformer>]) -> Vec<&str> {
    transformers.iter().map(|t| t.config()).collect()
}

/// Writable side of an encode. Must be closed before the metadata can be read.
pub struct EncodingStream {
    sink: Option<BoxSink>,
    transformers: Vec<Box<dyn Transformer>>,
    metadata: Metadata,
    state: CloseState,
}

/// Lifecycle of an [`EncodingStream`].
#[derive(Debug, Clone, PartialEq, Eq)]
enum CloseState {
    Open,
    Closed,
    /// Closing failed; the stored object is incomplete.
    Failed(String),
}

impl EncodingStream {
    /// Config strings in byte application order.
    pub fn transform_configs(&self) -> Vec<&str> {
        configs(&self.transformers)
    }

    /// Finish every transform and close the storage sink. Closing a closed stream is a no-op;
    /// closing a stream whose close failed reports that failure again.
    ///
    /// For LZMA this waits for the background compressor to drain.
    pub fn close(&mut self) -> Result<()> {
        match &self.state {
            CloseState::Closed => return Ok(()),
            CloseState::Failed(reason) => return Err(previous_close_failed(reason)),
            CloseState::Open => {}
        }
        let Some(sink) = self.sink.take() else {
            return Err(TransformError::IllegalState("encoding stream has no sink".into()));
        };
        match sink.close() {
            Ok(()) => {
                self.state = CloseState::Closed;
                Ok(())
            }
            Err(e) => {
                let err = TransformError::from_io(e);
                warn!(error = %err, "encoding stream failed to close");
                self.state = CloseState::Failed(err.to_string());
                Err(err)
            }
        }
    }

    /// Caller metadata merged with every transform's fields and the transform list.
    pub fn encoded_metadata(&self) -> Result<Metadata> {
        match &self.state {
            CloseState::Open => {
                return Err(TransformError::IllegalState(
                    "encoding stream must be closed before reading metadata".into(),
                ))
            }
            CloseState::Failed(reason) => return Err(previous_close_failed(reason)),
            CloseState::Closed => {}
        }
        let mut metadata = self.metadata.clone();
        for transformer in &self.transformers {
            metadata = transformer.encoded_metadata(&metadata)?;
        }
        if !self.transformers.is_empty() {
            metadata.insert(
                TRANSFORM_MODE.to_string(),
                encode_transform_mode(&self.transform_configs()),
            );
        }
        Ok(metadata)
    }
}

impl Write for EncodingStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.sink.as_mut() {
            Some(sink) => sink.write(buf),
            None => Err(TransformError::IllegalState("write after close".into()).into()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.sink.as_mut() {
            Some(sink) => sink.flush(),
            None => Ok(()),
        }
    }
}

fn previous_close_failed(reason: &str) -> TransformError {
    TransformError::IllegalState(format!("encoding stream failed to close: {reason}"))
}

/// Readable side of a decode.
pub struct DecodedObject {
    /// Original object bytes.
    pub reader: BoxSource,
    /// Stored metadata with every transform field removed.
    pub metadata: Metadata,
}

impl std::fmt::Debug for DecodedObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedObject")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::CompressionMode;
    use crate::keys::test_keys::*;
    use crate::metadata::{COMP_UNCOMPRESSED_SIZE, ENC_KEY_ID};
    use crate::stream::{MemorySink, ObjectSink};
    use std::io::Read;

    /// Storage sink whose device is full.
    struct FullDiskSink;

    impl Write for FullDiskSink {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::other("disk full"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl ObjectSink for FullDiskSink {
        fn close(self: Box<Self>) -> io::Result<()> {
            Ok(())
        }
    }

    fn enc_only_chain() -> TransformChain {
        TransformChain::new()
            .with(Arc::new(EncryptionFactory::with_key_ring(MasterKeyRing::new(
                key_a(),
            ))))
            .unwrap()
    }

    fn full_chain() -> TransformChain {
        TransformChain::new()
            .with(Arc::new(
                CompressionFactory::new(CompressionMode::Deflate, 6).unwrap(),
            ))
            .unwrap()
            .with(Arc::new(EncryptionFactory::with_key_ring(MasterKeyRing::new(
                key_a(),
            ))))
            .unwrap()
    }

    fn put(chain: &TransformChain, data: &[u8], md: &Metadata) -> (Vec<u8>, Metadata) {
        let storage = MemorySink::new();
        let mut stream = chain.encode(storage.boxed(), md).unwrap();
        stream.write_all(data).unwrap();
        stream.close().unwrap();
        (storage.contents(), stream.encoded_metadata().unwrap())
    }

    fn get(chain: &TransformChain, stored: Vec<u8>, md: &Metadata) -> (Vec<u8>, Metadata) {
        let mut obj = chain.decode(Box::new(io::Cursor::new(stored)), md).unwrap();
        let mut out = Vec::new();
        obj.reader.read_to_end(&mut out).unwrap();
        (out, obj.metadata)
    }

    #[test]
    fn test_classes_are_ordered_regardless_of_registration() {
        assert_eq!(
            full_chain().classes(),
            vec![TransformClass::Encryption, TransformClass::Compression]
        );
    }

    #[test]
    fn test_duplicate_class_rejected() {
        let result = full_chain().with(Arc::new(
            CompressionFactory::new(CompressionMode::Lzma, 1).unwrap(),
        ));
        assert!(matches!(result, Err(TransformError::DuplicateTransform(c)) if c == "COMP"));
    }

    #[test]
    fn test_transform_mode_lists_compression_first() {
        let (_, md) = put(&full_chain(), b"hello", &Metadata::new());
        assert_eq!(md[TRANSFORM_MODE], "COMP:Deflate/6|ENC:AES/CBC/PKCS5Padding");
        assert!(md.contains_key(ENC_KEY_ID));
        assert!(md.contains_key(COMP_UNCOMPRESSED_SIZE));
    }

    #[test]
    fn test_chained_roundtrip_restores_caller_metadata() {
        let chain = full_chain();
        let mut caller = Metadata::new();
        caller.insert("content-type".into(), "text/plain".into());
        let data = b"compress me then encrypt me ".repeat(500);
        let (stored, md) = put(&chain, &data, &caller);
        let (out, decoded) = get(&chain, stored, &md);
        assert_eq!(out, data);
        assert_eq!(decoded, caller);
    }

    #[test]
    fn test_empty_chain_is_passthrough() {
        let chain = TransformChain::new();
        let (stored, md) = put(&chain, b"plain", &Metadata::new());
        assert_eq!(stored, b"plain");
        assert!(!md.contains_key(TRANSFORM_MODE));
        assert_eq!(get(&full_chain(), stored, &md).0, b"plain");
    }

    #[test]
    fn test_reserved_caller_keys_rejected() {
        let mut md = Metadata::new();
        md.insert(TRANSFORM_MODE.into(), "ENC:forged".into());
        assert!(matches!(
            full_chain().encode(MemorySink::new().boxed(), &md),
            Err(TransformError::ReservedMetadataKey(_))
        ));
    }

    #[test]
    fn test_metadata_before_close_is_illegal_state() {
        let mut stream = full_chain()
            .encode(MemorySink::new().boxed(), &Metadata::new())
            .unwrap();
        stream.write_all(b"abc").unwrap();
        assert!(matches!(
            stream.encoded_metadata(),
            Err(TransformError::IllegalState(_))
        ));
        stream.close().unwrap();
        stream.close().unwrap();
        assert!(stream.write(b"late").is_err());
        assert!(stream.encoded_metadata().is_ok());
    }

    #[test]
    fn test_unregistered_class_is_unsupported() {
        let (stored, md) = put(&full_chain(), b"secret", &Metadata::new());
        let comp_only = TransformChain::new()
            .with(Arc::new(
                CompressionFactory::new(CompressionMode::Deflate, 6).unwrap(),
            ))
            .unwrap();
        let err = comp_only
            .decode(Box::new(io::Cursor::new(stored)), &md)
            .unwrap_err();
        assert!(matches!(err, TransformError::UnsupportedTransform(_)));
    }

    #[test]
    fn test_unknown_tag_is_unsupported() {
        let mut md = Metadata::new();
        md.insert(TRANSFORM_MODE.into(), "ROT13:13".into());
        let err = full_chain()
            .decode(Box::new(io::Cursor::new(Vec::new())), &md)
            .unwrap_err();
        assert!(matches!(err, TransformError::UnsupportedTransform(_)));
    }

    #[test]
    fn test_failed_close_stays_failed() {
        let mut stream = enc_only_chain()
            .encode(Box::new(FullDiskSink), &Metadata::new())
            .unwrap();
        // Below one cipher block, so nothing reaches the sink before close.
        stream.write_all(b"0123456789").unwrap();
        let first = stream.close().unwrap_err();
        assert!(first.to_string().contains("disk full"), "{first}");

        match stream.close() {
            Err(TransformError::IllegalState(msg)) => assert!(msg.contains("disk full"), "{msg}"),
            other => panic!("second close after failure: {other:?}"),
        }
        assert!(matches!(
            stream.encoded_metadata(),
            Err(TransformError::IllegalState(_))
        ));
        assert!(stream.write(b"late").is_err());
    }

    #[test]
    fn test_stripped_transform_mode_is_integrity_violation() {
        let chain = full_chain();
        let (stored, mut md) = put(&chain, b"compressed and encrypted", &Metadata::new());
        md.remove(TRANSFORM_MODE);
        let err = chain
            .decode(Box::new(io::Cursor::new(stored)), &md)
            .unwrap_err();
        assert!(err.is_integrity(), "{err}");
    }

    #[test]
    fn test_unrecorded_class_fields_are_integrity_violation() {
        let chain = full_chain();
        let (stored, mut md) = put(&chain, b"compressed and encrypted", &Metadata::new());
        md.insert(TRANSFORM_MODE.into(), "ENC:AES/CBC/PKCS5Padding".into());
        let err = chain
            .decode(Box::new(io::Cursor::new(stored)), &md)
            .unwrap_err();
        assert!(err.is_integrity(), "{err}");
        assert!(err.to_string().contains("x-emc-comp-"), "{err}");
    }
}
