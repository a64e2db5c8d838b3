//! Envelope encryption transform: AES-CBC object data under a fresh per-object key,
//! the key wrapped by the current RSA master key, and the envelope fields signed.
//!
//! Encode path: caller → SHA-1 digest → byte count → AES-CBC → sink.
//! Decode path: resolve master key by fingerprint → verify signature → unwrap key → decrypt.

use crate::cipher::{random_iv, CbcReader, CbcWriter, CipherSpec, EnvelopeKey, BLOCK_SIZE};
use crate::error::{Result, TransformError};
use crate::key_ring::MasterKeyRing;
use crate::keys::MasterKeyPair;
use crate::metadata::{
    require, strip_prefix, Metadata, ENC_IV, ENC_KEY_ID, ENC_OBJECT_KEY, ENC_PREFIX,
    ENC_SIGNATURE, ENC_SIGNED_FIELDS, ENC_UNENCRYPTED_SHA1, ENC_UNENCRYPTED_SIZE,
};
use crate::stream::{
    BoxSink, BoxSource, CountingWriter, DigestWriter, ObjectSink, StreamSummary, VerifyingReader,
};
use crate::transform::{ConfigString, TransformClass, TransformFactory, Transformer};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::io::{self, Write};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

/// Builds encryption transformers from a master key ring.
pub struct EncryptionFactory {
    cipher: CipherSpec,
    key_ring: MasterKeyRing,
}

impl std::fmt::Debug for EncryptionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionFactory")
            .field("cipher", &self.cipher)
            .field("key_ring", &self.key_ring)
            .finish()
    }
}

impl EncryptionFactory {
    /// Creates a factory producing AES-CBC transforms with `key_bits`-bit object keys.
    pub fn new(key_ring: MasterKeyRing, key_bits: usize) -> Result<Self> {
        Ok(Self {
            cipher: CipherSpec::aes_cbc(key_bits)?,
            key_ring,
        })
    }

    /// Creates a factory with 256-bit object keys.
    pub fn with_key_ring(key_ring: MasterKeyRing) -> Self {
        Self {
            cipher: CipherSpec::default(),
            key_ring,
        }
    }

    /// The master keys this factory wraps with and unwraps from.
    pub fn key_ring(&self) -> &MasterKeyRing {
        &self.key_ring
    }

    /// Config string of the transformers this factory produces.
    pub fn config_string(&self) -> String {
        ConfigString::format(TransformClass::Encryption, self.cipher.transformation())
    }

    /// Resolve, verify and unwrap the envelope stored in `metadata`.
    fn open_envelope(
        &self,
        metadata: &Metadata,
    ) -> Result<(Arc<MasterKeyPair>, EnvelopeKey)> {
        let key_id = require(metadata, ENC_KEY_ID)?;
        let master = self
            .key_ring
            .find(key_id)
            .ok_or_else(|| TransformError::KeyNotFound {
                key_id: key_id.to_string(),
            })?;

        let signature = decode_field(metadata, ENC_SIGNATURE)?;
        let canonical = canonical_fields(metadata)?;
        if let Err(e) = master.verify(canonical.as_bytes(), &signature) {
            warn!(key_id, "envelope signature verification failed");
            return Err(e);
        }

        let wrapped = decode_field(metadata, ENC_OBJECT_KEY)?;
        let object_key = EnvelopeKey::from_bytes(master.unwrap_object_key(&wrapped)?)?;
        Ok((master, object_key))
    }

    /// Rewrap an object's key under the current master key without touching its data.
    ///
    /// The stored envelope is verified first. Objects already wrapped by the current key are
    /// returned unchanged; otherwise the key id, wrapped key and signature are replaced.
    pub fn rekey(&self, metadata: &Metadata) -> Result<Metadata> {
        let key_id = require(metadata, ENC_KEY_ID)?;
        if self.key_ring.is_current(key_id) {
            return Ok(metadata.clone());
        }
        let (old_master, object_key) = self.open_envelope(metadata)?;
        let current = self.key_ring.current();

        let mut rekeyed = metadata.clone();
        rekeyed.insert(ENC_KEY_ID.to_string(), current.fingerprint().to_string());
        rekeyed.insert(
            ENC_OBJECT_KEY.to_string(),
            BASE64.encode(current.wrap_object_key(object_key.as_bytes())?),
        );
        let signature = current.sign(canonical_fields(&rekeyed)?.as_bytes())?;
        rekeyed.insert(ENC_SIGNATURE.to_string(), BASE64.encode(signature));

        info!(
            from = %old_master.fingerprint(),
            to = %current.fingerprint(),
            "object key rewrapped"
        );
        Ok(rekeyed)
    }
}

impl TransformFactory for EncryptionFactory {
    fn transform_class(&self) -> TransformClass {
        TransformClass::Encryption
    }

    fn new_encoder(&self) -> Result<Box<dyn Transformer>> {
        let master = self.key_ring.current();
        let object_key = self.cipher.generate_key();
        let iv = random_iv();
        let wrapped_key = BASE64.encode(master.wrap_object_key(object_key.as_bytes())?);
        debug!(
            key_id = %master.fingerprint(),
            key_bits = self.cipher.key_bits(),
            "new encryption encoder"
        );
        Ok(Box::new(EncryptionTransformer {
            config: self.config_string(),
            mode: Mode::Encode {
                object_key: Some(object_key),
                iv,
                master,
                wrapped_key,
                summary: Arc::new(OnceLock::new()),
            },
        }))
    }

    fn decoder_for(
        &self,
        config: &ConfigString,
        metadata: &Metadata,
    ) -> Result<Box<dyn Transformer>> {
        CipherSpec::check_transformation(&config.spec).map_err(|_| {
            TransformError::UnsupportedTransform(format!("unsupported cipher '{}'", config.spec))
        })?;
        let (master, object_key) = self.open_envelope(metadata)?;

        let iv: [u8; BLOCK_SIZE] = decode_field(metadata, ENC_IV)?
            .try_into()
            .map_err(|_| TransformError::IntegrityViolation("IV has wrong length".into()))?;
        let expected_size = require(metadata, ENC_UNENCRYPTED_SIZE)?
            .parse::<u64>()
            .map_err(|_| TransformError::IntegrityViolation("plaintext size is not a number".into()))?;
        let expected_sha1 = require(metadata, ENC_UNENCRYPTED_SHA1)?.to_string();

        debug!(key_id = %master.fingerprint(), size = expected_size, "new encryption decoder");
        Ok(Box::new(EncryptionTransformer {
            config: ConfigString::format(TransformClass::Encryption, &config.spec),
            mode: Mode::Decode {
                object_key: Some(object_key),
                iv,
                expected_size,
                expected_sha1,
            },
        }))
    }
}

enum Mode {
    Encode {
        object_key: Option<EnvelopeKey>,
        iv: [u8; BLOCK_SIZE],
        master: Arc<MasterKeyPair>,
        wrapped_key: String,
        summary: Arc<OnceLock<StreamSummary>>,
    },
    Decode {
        object_key: Option<EnvelopeKey>,
        iv: [u8; BLOCK_SIZE],
        expected_size: u64,
        expected_sha1: String,
    },
}

/// One object's encryption, either direction.
pub struct EncryptionTransformer {
    config: String,
    mode: Mode,
}

impl Transformer for EncryptionTransformer {
    fn config(&self) -> &str {
        &self.config
    }

    fn encode_sink(&mut self, inner: BoxSink) -> Result<BoxSink> {
        let Mode::Encode {
            object_key,
            iv,
            summary,
            ..
        } = &mut self.mode
        else {
            return Err(TransformError::IllegalState(
                "decoding transformer cannot encode".into(),
            ));
        };
        let key = object_key
            .take()
            .ok_or_else(|| TransformError::IllegalState("encoding sink already created".into()))?;
        let cipher = CbcWriter::new(inner, &key, iv)?;
        Ok(Box::new(EncryptingSink {
            writer: DigestWriter::new(CountingWriter::new(cipher)),
            summary: Arc::clone(summary),
        }))
    }

    fn decode_source(&mut self, inner: BoxSource) -> Result<BoxSource> {
        let Mode::Decode {
            object_key,
            iv,
            expected_size,
            expected_sha1,
        } = &mut self.mode
        else {
            return Err(TransformError::IllegalState(
                "encoding transformer cannot decode".into(),
            ));
        };
        let key = object_key
            .take()
            .ok_or_else(|| TransformError::IllegalState("decoding source already created".into()))?;
        let plaintext = CbcReader::new(inner, &key, iv)?;
        Ok(Box::new(VerifyingReader::new(
            plaintext,
            Some(*expected_size),
            Some(expected_sha1.clone()),
            "plaintext",
        )))
    }

    fn encoded_metadata(&self, metadata: &Metadata) -> Result<Metadata> {
        let Mode::Encode {
            iv,
            master,
            wrapped_key,
            summary,
            ..
        } = &self.mode
        else {
            return Err(TransformError::IllegalState(
                "decoding transformer has no encoded metadata".into(),
            ));
        };
        let summary = summary.get().ok_or_else(|| {
            TransformError::IllegalState("encoding sink must be closed before reading metadata".into())
        })?;

        let mut encoded = metadata.clone();
        encoded.insert(ENC_IV.to_string(), BASE64.encode(iv));
        encoded.insert(ENC_KEY_ID.to_string(), master.fingerprint().to_string());
        encoded.insert(ENC_OBJECT_KEY.to_string(), wrapped_key.clone());
        encoded.insert(ENC_UNENCRYPTED_SHA1.to_string(), summary.sha1_hex());
        encoded.insert(ENC_UNENCRYPTED_SIZE.to_string(), summary.size.to_string());
        let signature = master.sign(canonical_fields(&encoded)?.as_bytes())?;
        encoded.insert(ENC_SIGNATURE.to_string(), BASE64.encode(signature));
        Ok(encoded)
    }

    fn decoded_metadata(&self, metadata: &Metadata) -> Metadata {
        strip_prefix(metadata, ENC_PREFIX)
    }
}

struct EncryptingSink {
    writer: DigestWriter<CountingWriter<CbcWriter<BoxSink>>>,
    summary: Arc<OnceLock<StreamSummary>>,
}

impl Write for EncryptingSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl ObjectSink for EncryptingSink {
    fn close(self: Box<Self>) -> io::Result<()> {
        let EncryptingSink { writer, summary } = *self;
        let (sha1, counting) = writer.finish();
        let (size, cipher) = counting.into_parts();
        cipher.finish()?.close()?;
        let _ = summary.set(StreamSummary { size, sha1 });
        debug!(size, "encryption sink closed");
        Ok(())
    }
}

/// Canonical signing input: the signed fields in lexical order, one `key:value` per line.
fn canonical_fields(metadata: &Metadata) -> Result<String> {
    let mut canonical = String::new();
    for key in ENC_SIGNED_FIELDS {
        canonical.push_str(key);
        canonical.push(':');
        canonical.push_str(require(metadata, key)?);
        canonical.push('\n');
    }
    Ok(canonical)
}

fn decode_field(metadata: &Metadata, key: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(require(metadata, key)?)
        .map_err(|_| TransformError::IntegrityViolation(format!("{key} is not valid base64")))
}
