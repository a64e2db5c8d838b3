//! RSA master keys: fingerprinting, object-key wrapping and metadata signatures.

use crate::error::{Result, TransformError};
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPublicKey};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use sha1::{Digest, Sha1};
use sha2::Sha256;
use std::fmt::Debug;
use std::path::Path;

/// Length of a key fingerprint: SHA-1 rendered as hex.
pub const FINGERPRINT_LEN: usize = 40;

/// An RSA key pair used to wrap object keys and sign envelope metadata.
#[derive(Clone)]
pub struct MasterKeyPair {
    private: RsaPrivateKey,
    public: RsaPublicKey,
    fingerprint: String,
}

impl Debug for MasterKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "MasterKeyPair {{ fingerprint: {}, key: [REDACTED] }}",
            self.fingerprint
        )
    }
}

impl MasterKeyPair {
    /// Build a key pair from a private key; the public half and fingerprint are derived.
    pub fn from_private_key(private: RsaPrivateKey) -> Result<Self> {
        let public = RsaPublicKey::from(&private);
        let fingerprint = fingerprint(&public)?;
        Ok(Self {
            private,
            public,
            fingerprint,
        })
    }

    /// Parse a PEM private key, PKCS#8 (`BEGIN PRIVATE KEY`) or PKCS#1 (`BEGIN RSA PRIVATE KEY`).
    pub fn from_pem(pem: &str) -> Result<Self> {
        let private = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|e| TransformError::InvalidKey(format!("cannot parse RSA private key: {e}")))?;
        Self::from_private_key(private)
    }

    /// Load a PEM private key from disk.
    pub fn from_pem_file(path: &Path) -> Result<Self> {
        let pem = std::fs::read_to_string(path).map_err(|e| {
            TransformError::InvalidKey(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_pem(&pem)
    }

    /// Generate a fresh key pair.
    pub fn generate(bits: usize) -> Result<Self> {
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), bits)
            .map_err(|e| TransformError::InvalidKey(format!("RSA key generation failed: {e}")))?;
        Self::from_private_key(private)
    }

    /// Hex fingerprint of the public key.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// The public half.
    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public
    }

    /// Encrypt an object key under this key pair's public key.
    pub fn wrap_object_key(&self, object_key: &[u8]) -> Result<Vec<u8>> {
        wrap_key(&self.public, object_key)
    }

    /// Recover an object key wrapped by [`MasterKeyPair::wrap_object_key`].
    pub fn unwrap_object_key(&self, wrapped: &[u8]) -> Result<Vec<u8>> {
        unwrap_key(&self.private, wrapped)
    }

    /// Sign `message` with RSASSA-PKCS1-v1_5 over SHA-256.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let signing_key = SigningKey::<Sha256>::new(self.private.clone());
        let signature = signing_key
            .try_sign_with_rng(&mut rand::thread_rng(), message)
            .map_err(|e| TransformError::InvalidKey(format!("signing failed: {e}")))?;
        Ok(signature.to_vec())
    }

    /// Check a signature produced by [`MasterKeyPair::sign`].
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        verify_signature(&self.public, message, signature)
    }
}

/// Fingerprint of an RSA public key: SHA-1 over the DER encoding of
/// `RSAPublicKey ::= SEQUENCE { modulus, publicExponent }`, as 40 lowercase hex chars.
pub fn fingerprint(public: &RsaPublicKey) -> Result<String> {
    let der = public
        .to_pkcs1_der()
        .map_err(|e| TransformError::InvalidKey(format!("cannot DER-encode public key: {e}")))?;
    let digest = Sha1::digest(der.as_bytes());
    Ok(to_hex_padded(&digest, FINGERPRINT_LEN))
}

/// Encrypt `object_key` with RSAES-PKCS1-v1_5.
pub fn wrap_key(public: &RsaPublicKey, object_key: &[u8]) -> Result<Vec<u8>> {
    public
        .encrypt(&mut rand::thread_rng(), Pkcs1v15Encrypt, object_key)
        .map_err(|e| TransformError::InvalidKey(format!("cannot wrap object key: {e}")))
}

/// Decrypt a wrapped object key. Failure means the wrapped bytes were altered
/// or belong to another key.
pub fn unwrap_key(private: &RsaPrivateKey, wrapped: &[u8]) -> Result<Vec<u8>> {
    private
        .decrypt(Pkcs1v15Encrypt, wrapped)
        .map_err(|_| TransformError::IntegrityViolation("cannot unwrap object key".to_string()))
}

/// Verify an RSASSA-PKCS1-v1_5/SHA-256 signature.
pub fn verify_signature(
    public: &RsaPublicKey,
    message: &[u8],
    signature: &[u8],
) -> Result<()> {
    let verifying_key = VerifyingKey::<Sha256>::new(public.clone());
    let signature = Signature::try_from(signature)
        .map_err(|_| TransformError::IntegrityViolation("malformed metadata signature".into()))?;
    verifying_key
        .verify(message, &signature)
        .map_err(|_| TransformError::IntegrityViolation("metadata signature mismatch".into()))
}

/// Lowercase hex encoding.
pub fn to_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

/// Lowercase hex encoding, left-padded with zeros to at least `width` characters.
pub fn to_hex_padded(bytes: &[u8], width: usize) -> String {
    format!("{:0>width$}", hex::encode(bytes), width = width)
}

/// Decode hex (either case).
pub fn from_hex(s: &str) -> Result<Vec<u8>> {
    hex::decode(s).map_err(|e| TransformError::InvalidConfig(format!("invalid hex: {e}")))
}
