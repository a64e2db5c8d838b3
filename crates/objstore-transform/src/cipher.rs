//! Streaming AES-CBC with PKCS#5 padding and per-object envelope keys.
//!
//! The encrypting side is a push-style `Write` filter that holds back at most one partial
//! block; the decrypting side is a `Read` adapter that holds back the last block until end of
//! stream so the padding can be checked and stripped.

use crate::error::{Result, TransformError};
use aes::{Aes128, Aes192, Aes256};
use cbc::cipher::generic_array::GenericArray;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use std::fmt::Debug;
use std::io::{self, Read, Write};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// AES block size (and IV length) in bytes.
pub const BLOCK_SIZE: usize = 16;

/// The only cipher transformation this crate writes.
pub const AES_CBC_PKCS5: &str = "AES/CBC/PKCS5Padding";

/// Default object key size in bits.
pub const DEFAULT_KEY_BITS: usize = 256;

const READ_CHUNK: usize = 16 * 1024;

/// Symmetric cipher configuration of the encryption transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherSpec {
    key_bits: usize,
}

impl Default for CipherSpec {
    fn default() -> Self {
        Self {
            key_bits: DEFAULT_KEY_BITS,
        }
    }
}

impl CipherSpec {
    /// AES-CBC with the given key size (128, 192 or 256 bits).
    pub fn aes_cbc(key_bits: usize) -> Result<Self> {
        match key_bits {
            128 | 192 | 256 => Ok(Self { key_bits }),
            other => Err(TransformError::UnsupportedCipher(format!(
                "AES key size {other} bits (expected 128, 192 or 256)"
            ))),
        }
    }

    /// Check that `transformation` names a cipher this crate can run.
    /// Algorithm, mode and padding names are matched case-insensitively.
    pub fn check_transformation(transformation: &str) -> Result<()> {
        let parts: Vec<&str> = transformation.split('/').collect();
        match parts.as_slice() {
            [alg, mode, padding]
                if alg.eq_ignore_ascii_case("AES")
                    && mode.eq_ignore_ascii_case("CBC")
                    && padding.eq_ignore_ascii_case("PKCS5Padding") =>
            {
                Ok(())
            }
            _ => Err(TransformError::UnsupportedCipher(transformation.to_string())),
        }
    }

    /// Transformation name recorded in the config string.
    pub fn transformation(&self) -> &'static str {
        AES_CBC_PKCS5
    }

    /// Key size in bits.
    pub fn key_bits(&self) -> usize {
        self.key_bits
    }

    /// Generate a fresh random object key of this size.
    pub fn generate_key(&self) -> EnvelopeKey {
        let mut key = vec![0u8; self.key_bits / 8];
        rand::thread_rng().fill_bytes(&mut key);
        EnvelopeKey(key)
    }
}

/// Generate a random IV.
pub fn random_iv() -> [u8; BLOCK_SIZE] {
    let mut iv = [0u8; BLOCK_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);
    iv
}

/// Per-object symmetric key. Only its wrapped form is ever persisted.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EnvelopeKey(Vec<u8>);

impl Debug for EnvelopeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EnvelopeKey([REDACTED; {} bits])", self.0.len() * 8)
    }
}

impl EnvelopeKey {
    /// Adopt unwrapped key bytes, checking they form a valid AES key.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        match bytes.len() {
            16 | 24 | 32 => Ok(Self(bytes)),
            n => Err(TransformError::IntegrityViolation(format!(
                "unwrapped object key has invalid length {n}"
            ))),
        }
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

enum BlockEncryptor {
    Aes128(cbc::Encryptor<Aes128>),
    Aes192(cbc::Encryptor<Aes192>),
    Aes256(cbc::Encryptor<Aes256>),
}

impl BlockEncryptor {
    fn new(key: &EnvelopeKey, iv: &[u8; BLOCK_SIZE]) -> Result<Self> {
        let k = key.as_bytes();
        let bad = |e: cbc::cipher::InvalidLength| TransformError::InvalidKey(e.to_string());
        Ok(match k.len() {
            16 => Self::Aes128(cbc::Encryptor::new_from_slices(k, iv).map_err(bad)?),
            24 => Self::Aes192(cbc::Encryptor::new_from_slices(k, iv).map_err(bad)?),
            32 => Self::Aes256(cbc::Encryptor::new_from_slices(k, iv).map_err(bad)?),
            n => return Err(TransformError::InvalidKey(format!("AES key length {n}"))),
        })
    }

    fn encrypt(&mut self, block: &mut [u8]) {
        let block = GenericArray::from_mut_slice(block);
        match self {
            Self::Aes128(c) => c.encrypt_block_mut(block),
            Self::Aes192(c) => c.encrypt_block_mut(block),
            Self::Aes256(c) => c.encrypt_block_mut(block),
        }
    }
}

enum BlockDecryptor {
    Aes128(cbc::Decryptor<Aes128>),
    Aes192(cbc::Decryptor<Aes192>),
    Aes256(cbc::Decryptor<Aes256>),
}

impl BlockDecryptor {
    fn new(key: &EnvelopeKey, iv: &[u8; BLOCK_SIZE]) -> Result<Self> {
        let k = key.as_bytes();
        let bad = |e: cbc::cipher::InvalidLength| TransformError::InvalidKey(e.to_string());
        Ok(match k.len() {
            16 => Self::Aes128(cbc::Decryptor::new_from_slices(k, iv).map_err(bad)?),
            24 => Self::Aes192(cbc::Decryptor::new_from_slices(k, iv).map_err(bad)?),
            32 => Self::Aes256(cbc::Decryptor::new_from_slices(k, iv).map_err(bad)?),
            n => return Err(TransformError::InvalidKey(format!("AES key length {n}"))),
        })
    }

    fn decrypt(&mut self, block: &mut [u8]) {
        let block = GenericArray::from_mut_slice(block);
        match self {
            Self::Aes128(c) => c.decrypt_block_mut(block),
            Self::Aes192(c) => c.decrypt_block_mut(block),
            Self::Aes256(c) => c.decrypt_block_mut(block),
        }
    }
}

/// Encrypting `Write` filter. Call [`CbcWriter::finish`] to emit the padded final block.
pub struct CbcWriter<W> {
    inner: W,
    cipher: BlockEncryptor,
    pending: Vec<u8>,
    out: Vec<u8>,
}

impl<W: Write> CbcWriter<W> {
    /// Start encrypting into `inner`.
    pub fn new(inner: W, key: &EnvelopeKey, iv: &[u8; BLOCK_SIZE]) -> Result<Self> {
        Ok(Self {
            inner,
            cipher: BlockEncryptor::new(key, iv)?,
            pending: Vec::with_capacity(BLOCK_SIZE),
            out: Vec::new(),
        })
    }

    /// Pad and encrypt the final block, flush, and return the wrapped writer.
    pub fn finish(mut self) -> io::Result<W> {
        let pad = BLOCK_SIZE - self.pending.len();
        self.pending.resize(BLOCK_SIZE, pad as u8);
        let mut block = [0u8; BLOCK_SIZE];
        block.copy_from_slice(&self.pending);
        self.cipher.encrypt(&mut block);
        self.inner.write_all(&block)?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for CbcWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut input = buf;
        self.out.clear();

        if !self.pending.is_empty() {
            let take = (BLOCK_SIZE - self.pending.len()).min(input.len());
            self.pending.extend_from_slice(&input[..take]);
            input = &input[take..];
            if self.pending.len() == BLOCK_SIZE {
                let mut block = [0u8; BLOCK_SIZE];
                block.copy_from_slice(&self.pending);
                self.cipher.encrypt(&mut block);
                self.out.extend_from_slice(&block);
                self.pending.clear();
            }
        }

        let full = input.len() / BLOCK_SIZE * BLOCK_SIZE;
        let start = self.out.len();
        self.out.extend_from_slice(&input[..full]);
        for block in self.out[start..].chunks_exact_mut(BLOCK_SIZE) {
            self.cipher.encrypt(block);
        }
        self.pending.extend_from_slice(&input[full..]);

        if !self.out.is_empty() {
            self.inner.write_all(&self.out)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Decrypting `Read` adapter. Truncated ciphertext or bad padding is an integrity error.
pub struct CbcReader<R> {
    inner: R,
    cipher: BlockDecryptor,
    carry: Vec<u8>,
    held: Option<[u8; BLOCK_SIZE]>,
    plain: Vec<u8>,
    pos: usize,
    eof: bool,
}

impl<R: Read> CbcReader<R> {
    /// Start decrypting `inner`.
    pub fn new(inner: R, key: &EnvelopeKey, iv: &[u8; BLOCK_SIZE]) -> Result<Self> {
        Ok(Self {
            inner,
            cipher: BlockDecryptor::new(key, iv)?,
            carry: Vec::with_capacity(READ_CHUNK + BLOCK_SIZE),
            held: None,
            plain: Vec::with_capacity(READ_CHUNK),
            pos: 0,
            eof: false,
        })
    }

    fn finish_stream(&mut self) -> Result<()> {
        if !self.carry.is_empty() {
            return Err(TransformError::IntegrityViolation(
                "ciphertext length is not a multiple of the block size".into(),
            ));
        }
        let block = self.held.take().ok_or_else(|| {
            TransformError::IntegrityViolation("ciphertext is missing its final block".into())
        })?;
        let pad = block[BLOCK_SIZE - 1] as usize;
        if pad == 0 || pad > BLOCK_SIZE || block[BLOCK_SIZE - pad..].iter().any(|&b| b as usize != pad) {
            return Err(TransformError::IntegrityViolation("invalid cipher padding".into()));
        }
        self.plain.extend_from_slice(&block[..BLOCK_SIZE - pad]);
        Ok(())
    }

    fn fill(&mut self) -> io::Result<()> {
        self.plain.clear();
        self.pos = 0;
        let mut chunk = [0u8; READ_CHUNK];
        let n = loop {
            match self.inner.read(&mut chunk) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };
        if n == 0 {
            self.eof = true;
            return self.finish_stream().map_err(io::Error::from);
        }
        self.carry.extend_from_slice(&chunk[..n]);
        let full = self.carry.len() / BLOCK_SIZE * BLOCK_SIZE;
        for i in (0..full).step_by(BLOCK_SIZE) {
            let mut block = [0u8; BLOCK_SIZE];
            block.copy_from_slice(&self.carry[i..i + BLOCK_SIZE]);
            self.cipher.decrypt(&mut block);
            if let Some(previous) = self.held.replace(block) {
                self.plain.extend_from_slice(&previous);
            }
        }
        self.carry.drain(..full);
        Ok(())
    }
}

impl<R: Read> Read for CbcReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pos >= self.plain.len() {
            if self.eof {
                return Ok(0);
            }
            self.fill()?;
        }
        let n = (self.plain.len() - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&self.plain[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn encrypt_all(data: &[u8], key: &EnvelopeKey, iv: &[u8; BLOCK_SIZE], step: usize) -> Vec<u8> {
        let mut w = CbcWriter::new(Vec::new(), key, iv).unwrap();
        for piece in data.chunks(step.max(1)) {
            w.write_all(piece).unwrap();
        }
        w.finish().unwrap()
    }

    fn decrypt_all(ct: &[u8], key: &EnvelopeKey, iv: &[u8; BLOCK_SIZE]) -> io::Result<Vec<u8>> {
        let mut r = CbcReader::new(ct, key, iv)?;
        let mut out = Vec::new();
        r.read_to_end(&mut out)?;
        Ok(out)
    }

    proptest! {
        #[test]
        fn prop_cbc_roundtrip(
            data in prop::collection::vec(any::<u8>(), 0..20_000),
            step in 1usize..4096,
            bits in prop::sample::select(vec![128usize, 192, 256]),
        ) {
            let key = CipherSpec::aes_cbc(bits).unwrap().generate_key();
            let iv = random_iv();
            let ct = encrypt_all(&data, &key, &iv, step);
            prop_assert_eq!(ct.len(), (data.len() / BLOCK_SIZE + 1) * BLOCK_SIZE);
            prop_assert_eq!(decrypt_all(&ct, &key, &iv).unwrap(), data);
        }
    }

    #[test]
    fn test_write_granularity_does_not_change_ciphertext() {
        let key = CipherSpec::aes_cbc(256).unwrap().generate_key();
        let iv = random_iv();
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(encrypt_all(&data, &key, &iv, 1), encrypt_all(&data, &key, &iv, 1000));
    }

    #[test]
    fn test_empty_plaintext_is_one_padding_block() {
        let key = CipherSpec::aes_cbc(128).unwrap().generate_key();
        let iv = random_iv();
        let ct = encrypt_all(&[], &key, &iv, 1);
        assert_eq!(ct.len(), BLOCK_SIZE);
        assert!(decrypt_all(&ct, &key, &iv).unwrap().is_empty());
    }

    #[test]
    fn test_truncated_ciphertext_is_integrity_error() {
        let key = CipherSpec::aes_cbc(256).unwrap().generate_key();
        let iv = random_iv();
        let ct = encrypt_all(b"some plaintext that spans blocks", &key, &iv, 7);
        let err = decrypt_all(&ct[..ct.len() - 3], &key, &iv).unwrap_err();
        assert!(TransformError::from_io(err).is_integrity());
        let err = decrypt_all(&[], &key, &iv).unwrap_err();
        assert!(TransformError::from_io(err).is_integrity());
    }

    #[test]
    fn test_unsupported_key_size_rejected() {
        assert!(matches!(
            CipherSpec::aes_cbc(512),
            Err(TransformError::UnsupportedCipher(_))
        ));
    }

    #[test]
    fn test_transformation_check() {
        CipherSpec::check_transformation("AES/CBC/PKCS5Padding").unwrap();
        CipherSpec::check_transformation("aes/cbc/pkcs5padding").unwrap();
        assert!(CipherSpec::check_transformation("AES/GCM/NoPadding").is_err());
        assert!(CipherSpec::check_transformation("DES").is_err());
    }

    #[test]
    fn test_envelope_key_debug_is_redacted() {
        let key = CipherSpec::aes_cbc(256).unwrap().generate_key();
        assert_eq!(format!("{key:?}"), "EnvelopeKey([REDACTED; 256 bits])");
        assert!(EnvelopeKey::from_bytes(vec![0; 5]).is_err());
    }
}
