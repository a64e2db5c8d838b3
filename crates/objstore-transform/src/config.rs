//! Pipeline configuration, loadable from TOML or JSON.

use crate::cipher::DEFAULT_KEY_BITS;
use crate::compression::{CompressionMode, DEFAULT_LEVEL};
use crate::error::{Result, TransformError};
use crate::pipe::PipeConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Which transforms to register and how to configure them. A missing section leaves that
/// transform out of the chain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Compression settings.
    pub compression: Option<CompressionConfig>,
    /// Encryption settings.
    pub encryption: Option<EncryptionConfig>,
}

/// `[compression]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Engine.
    pub mode: CompressionMode,
    /// Level 0-9.
    pub level: u32,
    /// Bytes per chunk in the LZMA feed pipe.
    pub pipe_chunk_size: usize,
    /// Chunks the LZMA feed pipe holds before writers block.
    pub pipe_capacity: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        let pipe = PipeConfig::default();
        Self {
            mode: CompressionMode::default(),
            level: DEFAULT_LEVEL,
            pipe_chunk_size: pipe.chunk_size,
            pipe_capacity: pipe.capacity,
        }
    }
}

impl CompressionConfig {
    /// Pipe sizing for the LZMA engine.
    pub fn pipe(&self) -> PipeConfig {
        PipeConfig {
            chunk_size: self.pipe_chunk_size,
            capacity: self.pipe_capacity,
        }
    }
}

/// `[encryption]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// AES object key size in bits: 128, 192 or 256.
    pub key_size: usize,
    /// PEM file of the master key new objects are wrapped with.
    pub current_key: PathBuf,
    /// PEM files of older master keys kept for decoding.
    pub retained_keys: Vec<PathBuf>,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            key_size: DEFAULT_KEY_BITS,
            current_key: PathBuf::new(),
            retained_keys: Vec::new(),
        }
    }
}

impl PipelineConfig {
    /// Load from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)
                .map_err(|e| TransformError::InvalidConfig(format!("{}: {e}", path.display()))),
            "json" => serde_json::from_str(&contents)
                .map_err(|e| TransformError::InvalidConfig(format!("{}: {e}", path.display()))),
            _ => Err(TransformError::InvalidConfig(format!(
                "unsupported config file extension: {ext}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = PipelineConfig::default();
        assert!(config.compression.is_none());
        assert!(config.encryption.is_none());

        let comp = CompressionConfig::default();
        assert_eq!(comp.mode, CompressionMode::Lzma);
        assert_eq!(comp.level, 5);
        assert_eq!(comp.pipe(), PipeConfig::default());
        assert_eq!(EncryptionConfig::default().key_size, 256);
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
[compression]
mode = "Deflate"
level = 9

[encryption]
key_size = 128
current_key = "/keys/current.pem"
retained_keys = ["/keys/2025.pem", "/keys/2024.pem"]
"#
        )
        .unwrap();

        let config = PipelineConfig::from_file(file.path()).unwrap();
        let comp = config.compression.unwrap();
        assert_eq!(comp.mode, CompressionMode::Deflate);
        assert_eq!(comp.level, 9);
        assert_eq!(comp.pipe_chunk_size, PipeConfig::default().chunk_size);
        let enc = config.encryption.unwrap();
        assert_eq!(enc.key_size, 128);
        assert_eq!(enc.current_key, PathBuf::from("/keys/current.pem"));
        assert_eq!(enc.retained_keys.len(), 2);
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{
                "compression": {{ "mode": "LZMA", "level": 2, "pipe_chunk_size": 4096, "pipe_capacity": 4 }}
            }}"#
        )
        .unwrap();

        let config = PipelineConfig::from_file(file.path()).unwrap();
        let comp = config.compression.unwrap();
        assert_eq!(comp.mode, CompressionMode::Lzma);
        assert_eq!(
            comp.pipe(),
            PipeConfig {
                chunk_size: 4096,
                capacity: 4
            }
        );
        assert!(config.encryption.is_none());
    }

    #[test]
    fn test_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(matches!(
            PipelineConfig::from_file(file.path()),
            Err(TransformError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_malformed_toml_is_invalid_config() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(file, "[compression\nlevel = ").unwrap();
        assert!(matches!(
            PipelineConfig::from_file(file.path()),
            Err(TransformError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            PipelineConfig::from_file(&dir.path().join("absent.toml")),
            Err(TransformError::Io(_))
        ));
    }
}
