//! Test Harness - tracing setup, fixture keys and storage round-trip helpers

use objstore_transform::{
    BoxSource, CompressionFactory, CompressionMode, EncryptionFactory, MasterKeyPair, MasterKeyRing,
    MemorySink, Metadata, TransformChain,
};
use sha1::{Digest, Sha1};
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};
use tempfile::TempDir;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// PKCS#8 PEM of fixture master key A.
pub const KEY_A_PEM: &str = include_str!("../../objstore-transform/testdata/master_a.pem");
/// PKCS#8 PEM of fixture master key B.
pub const KEY_B_PEM: &str = include_str!("../../objstore-transform/testdata/master_b.pem");
/// Fingerprint of key A.
pub const KEY_A_FINGERPRINT: &str = "405dda532534b48498415de183b6bc2e3ee9a257";
/// Fingerprint of key B.
pub const KEY_B_FINGERPRINT: &str = "d6c6730f5cccb23ae9f1e46c7bdb8a6306919fa9";

static TRACING: Once = Once::new();

/// Install a fmt subscriber filtered by `RUST_LOG`, once per test binary.
pub fn init_test_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(fmt::layer().with_test_writer())
            .with(EnvFilter::from_default_env())
            .try_init();
    });
}

/// Fixture key A.
pub fn key_a() -> MasterKeyPair {
    MasterKeyPair::from_pem(KEY_A_PEM).expect("fixture key A")
}

/// Fixture key B.
pub fn key_b() -> MasterKeyPair {
    MasterKeyPair::from_pem(KEY_B_PEM).expect("fixture key B")
}

/// Encryption factory with `current` as the only master key and 256-bit object keys.
pub fn encryption(current: MasterKeyPair) -> Arc<EncryptionFactory> {
    Arc::new(EncryptionFactory::with_key_ring(MasterKeyRing::new(current)))
}

/// Compression factory for `mode` at `level`.
pub fn compression(mode: CompressionMode, level: u32) -> Arc<CompressionFactory> {
    Arc::new(CompressionFactory::new(mode, level).expect("valid level"))
}

/// An object as the storage service would hold it.
#[derive(Debug, Clone)]
pub struct StoredObject {
    /// Bytes written to storage.
    pub data: Vec<u8>,
    /// Metadata attached to the object.
    pub metadata: Metadata,
}

/// Write `payload` through `chain` into memory, in `chunk`-sized writes.
pub fn store(
    chain: &TransformChain,
    payload: &[u8],
    metadata: &Metadata,
    chunk: usize,
) -> anyhow::Result<StoredObject> {
    let storage = MemorySink::new();
    let mut stream = chain.encode(storage.boxed(), metadata)?;
    for piece in payload.chunks(chunk.max(1)) {
        stream.write_all(piece)?;
    }
    stream.close()?;
    anyhow::ensure!(storage.is_closed(), "storage sink left open");
    Ok(StoredObject {
        data: storage.contents(),
        metadata: stream.encoded_metadata()?,
    })
}

/// Read `object` back through `chain`.
pub fn load(chain: &TransformChain, object: &StoredObject) -> anyhow::Result<(Vec<u8>, Metadata)> {
    let source: BoxSource = Box::new(Cursor::new(object.data.clone()));
    let mut decoded = chain.decode(source, &object.metadata)?;
    let mut out = Vec::new();
    decoded.reader.read_to_end(&mut out)?;
    Ok((out, decoded.metadata))
}

/// Deterministic, moderately compressible payload of `len` bytes.
pub fn payload(len: usize) -> Vec<u8> {
    let mut state: u32 = 0x9e37_79b9;
    (0..len)
        .map(|i| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            if i % 3 == 0 {
                (state & 0xff) as u8
            } else {
                b"object-store "[i % 13]
            }
        })
        .collect()
}

/// Hex SHA-1 of `data`, computed independently of the pipeline.
pub fn sha1_hex(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}

/// Scratch directory holding fixture key files.
#[derive(Debug)]
pub struct TestEnv {
    temp_dir: TempDir,
}

impl TestEnv {
    /// Fresh temp dir with `master_a.pem` and `master_b.pem` written into it.
    pub fn new() -> Self {
        let temp_dir = tempfile::tempdir().expect("failed to create temp dir");
        std::fs::write(temp_dir.path().join("master_a.pem"), KEY_A_PEM).expect("write key A");
        std::fs::write(temp_dir.path().join("master_b.pem"), KEY_B_PEM).expect("write key B");
        Self { temp_dir }
    }

    /// Root of the scratch directory.
    pub fn dir(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Path of a file inside the scratch directory.
    pub fn path(&self, name: &str) -> PathBuf {
        self.temp_dir.path().join(name)
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}
