//! Streaming compression transform with two engines.
//!
//! - `Deflate`: zlib through flate2, driven inline from caller writes.
//! - `LZMA`: raw LZMA through xz2. The encoder pulls from a reader, so it runs on a background
//!   thread fed by a bounded pipe (see [`crate::pipe`]).
//!
//! Encode path: caller → SHA-1 digest → byte count → engine → byte count → sink.

use crate::error::{Result, TransformError};
use crate::metadata::{
    strip_prefix, Metadata, COMP_COMPRESSED_SIZE, COMP_PREFIX, COMP_RATIO, COMP_UNCOMPRESSED_SHA1,
    COMP_UNCOMPRESSED_SIZE,
};
use crate::pipe::{BackgroundEncoder, PipeConfig};
use crate::stream::{
    BoxSink, BoxSource, CountingWriter, DigestWriter, ObjectSink, StreamSummary, VerifyingReader,
};
use crate::transform::{ConfigString, TransformClass, TransformFactory, Transformer};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Write};
use std::sync::{Arc, OnceLock};
use tracing::debug;
use xz2::stream::{LzmaOptions, MatchFinder, Stream};

/// Highest accepted compression level.
pub const MAX_LEVEL: u32 = 9;

/// Level used when none is configured.
pub const DEFAULT_LEVEL: u32 = 5;

/// Compression engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionMode {
    /// zlib-wrapped Deflate.
    #[serde(alias = "deflate")]
    Deflate,
    /// Raw LZMA.
    #[default]
    #[serde(rename = "LZMA", alias = "lzma", alias = "Lzma")]
    Lzma,
}

impl CompressionMode {
    /// Name used in config strings.
    pub fn name(self) -> &'static str {
        match self {
            CompressionMode::Deflate => "Deflate",
            CompressionMode::Lzma => "LZMA",
        }
    }

    /// Case-insensitive lookup by config-string name.
    pub fn from_name(name: &str) -> Option<Self> {
        [CompressionMode::Deflate, CompressionMode::Lzma]
            .into_iter()
            .find(|m| m.name().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for CompressionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finder {
    HashChain4,
    BinaryTree2,
    BinaryTree4,
}

/// LZMA encoder parameters for one compression level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LzmaProfile {
    /// Dictionary size in bytes.
    pub dict_size: u32,
    /// Match length at which the match finder stops looking.
    pub nice_len: u32,
    /// Match finder search depth; 0 lets liblzma choose.
    pub depth: u32,
    /// Literal context bits.
    pub literal_context_bits: u32,
    finder: Finder,
    fast: bool,
}

const KIB: u32 = 1024;
const MIB: u32 = 1024 * KIB;

// Dictionaries stop growing at 8 MiB so a level-9 encoder stays around 100 MiB of memory.
const LZMA_PROFILES: [LzmaProfile; 10] = [
    LzmaProfile::new(64 * KIB, 8, 4, Finder::HashChain4, true),
    LzmaProfile::new(256 * KIB, 16, 8, Finder::HashChain4, true),
    LzmaProfile::new(512 * KIB, 32, 16, Finder::BinaryTree2, true),
    LzmaProfile::new(MIB, 32, 24, Finder::BinaryTree4, false),
    LzmaProfile::new(2 * MIB, 64, 32, Finder::BinaryTree4, false),
    LzmaProfile::new(4 * MIB, 64, 48, Finder::BinaryTree4, false),
    LzmaProfile::new(4 * MIB, 96, 64, Finder::BinaryTree4, false),
    LzmaProfile::new(8 * MIB, 128, 96, Finder::BinaryTree4, false),
    LzmaProfile::new(8 * MIB, 192, 128, Finder::BinaryTree4, false),
    LzmaProfile::new(8 * MIB, 273, 512, Finder::BinaryTree4, false),
];

/// Decoder memory ceiling: the largest profile dictionary plus liblzma's fixed overhead.
/// Streams whose header asks for more are rejected instead of allocated.
pub const LZMA_DECODER_MEMLIMIT: u64 = 16 * MIB as u64;

impl LzmaProfile {
    const fn new(dict_size: u32, nice_len: u32, depth: u32, finder: Finder, fast: bool) -> Self {
        Self {
            dict_size,
            nice_len,
            depth,
            literal_context_bits: 3,
            finder,
            fast,
        }
    }

    /// Profile for `level`; levels above [`MAX_LEVEL`] are a configuration error.
    pub fn for_level(level: u32) -> Result<Self> {
        LZMA_PROFILES
            .get(level as usize)
            .copied()
            .ok_or_else(|| level_error(level))
    }

    fn options(&self) -> Result<LzmaOptions> {
        let mut options = LzmaOptions::new_preset(if self.fast { 1 } else { 6 })
            .map_err(|e| TransformError::InvalidConfig(format!("LZMA preset: {e}")))?;
        options
            .dict_size(self.dict_size)
            .nice_len(self.nice_len)
            .depth(self.depth)
            .literal_context_bits(self.literal_context_bits)
            .literal_position_bits(0)
            .position_bits(2)
            .mode(if self.fast {
                xz2::stream::Mode::Fast
            } else {
                xz2::stream::Mode::Normal
            })
            .match_finder(match self.finder {
                Finder::HashChain4 => MatchFinder::HashChain4,
                Finder::BinaryTree2 => MatchFinder::BinaryTree2,
                Finder::BinaryTree4 => MatchFinder::BinaryTree4,
            });
        Ok(options)
    }

    fn encoder(&self) -> Result<Stream> {
        Stream::new_lzma_encoder(&self.options()?)
            .map_err(|e| TransformError::InvalidConfig(format!("LZMA encoder: {e}")))
    }
}

fn level_error(level: u32) -> TransformError {
    TransformError::InvalidConfig(format!(
        "compression level {level} out of range 0..={MAX_LEVEL}"
    ))
}

/// Space saved as a percentage with one decimal; `"0.0"` for empty input.
pub fn compression_ratio(compressed: u64, uncompressed: u64) -> String {
    if uncompressed == 0 {
        return "0.0".to_string();
    }
    let ratio = 100.0 - (compressed as f64 * 100.0 / uncompressed as f64);
    format!("{ratio:.1}")
}

/// Builds compression transformers for one engine and level.
#[derive(Debug, Clone)]
pub struct CompressionFactory {
    mode: CompressionMode,
    level: u32,
    pipe: PipeConfig,
}

impl CompressionFactory {
    /// Creates a factory; `level` must be within `0..=9`.
    pub fn new(mode: CompressionMode, level: u32) -> Result<Self> {
        if level > MAX_LEVEL {
            return Err(level_error(level));
        }
        Ok(Self {
            mode,
            level,
            pipe: PipeConfig::default(),
        })
    }

    /// Override the pipe feeding the LZMA background thread.
    pub fn with_pipe(mut self, pipe: PipeConfig) -> Result<Self> {
        pipe.validate()?;
        self.pipe = pipe;
        Ok(self)
    }

    /// Engine in use.
    pub fn mode(&self) -> CompressionMode {
        self.mode
    }

    /// Level in use.
    pub fn level(&self) -> u32 {
        self.level
    }

    /// Config string, e.g. `COMP:LZMA/5`.
    pub fn config_string(&self) -> String {
        config_string(self.mode, self.level)
    }
}

fn config_string(mode: CompressionMode, level: u32) -> String {
    ConfigString::format(TransformClass::Compression, &format!("{}/{}", mode.name(), level))
}

fn parse_spec(config: &ConfigString) -> Result<(CompressionMode, u32)> {
    let unsupported =
        || TransformError::UnsupportedTransform(format!("unsupported compression '{}'", config.spec));
    let parts = config.parts();
    let mode = CompressionMode::from_name(parts[0]).ok_or_else(unsupported)?;
    let level = match parts.as_slice() {
        [_] => DEFAULT_LEVEL,
        [_, level] => level.parse::<u32>().map_err(|_| unsupported())?,
        _ => return Err(unsupported()),
    };
    if level > MAX_LEVEL {
        return Err(unsupported());
    }
    Ok((mode, level))
}

impl TransformFactory for CompressionFactory {
    fn transform_class(&self) -> TransformClass {
        TransformClass::Compression
    }

    fn new_encoder(&self) -> Result<Box<dyn Transformer>> {
        let lzma = match self.mode {
            CompressionMode::Lzma => Some(LzmaProfile::for_level(self.level)?),
            CompressionMode::Deflate => None,
        };
        debug!(mode = %self.mode, level = self.level, "new compression encoder");
        Ok(Box::new(CompressionTransformer {
            config: self.config_string(),
            mode: self.mode,
            direction: Direction::Encode {
                level: self.level,
                lzma,
                pipe: self.pipe,
                started: false,
                summary: Arc::new(OnceLock::new()),
            },
        }))
    }

    fn decoder_for(
        &self,
        config: &ConfigString,
        metadata: &Metadata,
    ) -> Result<Box<dyn Transformer>> {
        let (mode, level) = parse_spec(config)?;
        let expected_size = metadata
            .get(COMP_UNCOMPRESSED_SIZE)
            .map(|v| {
                v.parse::<u64>().map_err(|_| {
                    TransformError::IntegrityViolation("uncompressed size is not a number".into())
                })
            })
            .transpose()?;
        let expected_sha1 = metadata.get(COMP_UNCOMPRESSED_SHA1).cloned();
        debug!(mode = %mode, level, "new compression decoder");
        Ok(Box::new(CompressionTransformer {
            config: config_string(mode, level),
            mode,
            direction: Direction::Decode {
                expected_size,
                expected_sha1,
                started: false,
            },
        }))
    }
}

/// Sizes and digest of one compressed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CompressionSummary {
    uncompressed: StreamSummary,
    compressed_size: u64,
}

enum Direction {
    Encode {
        level: u32,
        lzma: Option<LzmaProfile>,
        pipe: PipeConfig,
        started: bool,
        summary: Arc<OnceLock<CompressionSummary>>,
    },
    Decode {
        expected_size: Option<u64>,
        expected_sha1: Option<String>,
        started: bool,
    },
}

/// One object's compression, either direction.
pub struct CompressionTransformer {
    config: String,
    mode: CompressionMode,
    direction: Direction,
}

impl Transformer for CompressionTransformer {
    fn config(&self) -> &str {
        &self.config
    }

    fn encode_sink(&mut self, inner: BoxSink) -> Result<BoxSink> {
        let Direction::Encode {
            level,
            lzma,
            pipe,
            started,
            summary,
        } = &mut self.direction
        else {
            return Err(TransformError::IllegalState(
                "decoding transformer cannot encode".into(),
            ));
        };
        if *started {
            return Err(TransformError::IllegalState(
                "encoding sink already created".into(),
            ));
        }
        *started = true;
        let summary = Arc::clone(summary);
        match (self.mode, lzma) {
            (CompressionMode::Deflate, _) => {
                let engine = ZlibEncoder::new(CountingWriter::new(inner), Compression::new(*level));
                Ok(Box::new(DeflateSink {
                    writer: DigestWriter::new(CountingWriter::new(engine)),
                    summary,
                }))
            }
            (CompressionMode::Lzma, Some(profile)) => {
                let stream = profile.encoder()?;
                let engine = BackgroundEncoder::spawn("lzma-compressor", inner, *pipe, move |src, dst| {
                    let mut encoder = xz2::bufread::XzEncoder::new_stream(src, stream);
                    io::copy(&mut encoder, dst).map(|_| ())
                })?;
                Ok(Box::new(LzmaSink {
                    writer: DigestWriter::new(CountingWriter::new(engine)),
                    summary,
                }))
            }
            (CompressionMode::Lzma, None) => Err(level_error(*level)),
        }
    }

    fn decode_source(&mut self, inner: BoxSource) -> Result<BoxSource> {
        let Direction::Decode {
            expected_size,
            expected_sha1,
            started,
        } = &mut self.direction
        else {
            return Err(TransformError::IllegalState(
                "encoding transformer cannot decode".into(),
            ));
        };
        if *started {
            return Err(TransformError::IllegalState(
                "decoding source already created".into(),
            ));
        }
        *started = true;
        let decoded: BoxSource = match self.mode {
            CompressionMode::Deflate => Box::new(ZlibDecoder::new(inner)),
            CompressionMode::Lzma => {
                let stream =
                    Stream::new_lzma_decoder(LZMA_DECODER_MEMLIMIT).map_err(io::Error::from)?;
                Box::new(xz2::read::XzDecoder::new_stream(inner, stream))
            }
        };
        if expected_size.is_none() && expected_sha1.is_none() {
            return Ok(decoded);
        }
        Ok(Box::new(VerifyingReader::new(
            decoded,
            *expected_size,
            expected_sha1.clone(),
            "decompressed",
        )))
    }

    fn encoded_metadata(&self, metadata: &Metadata) -> Result<Metadata> {
        let Direction::Encode { summary, .. } = &self.direction else {
            return Err(TransformError::IllegalState(
                "decoding transformer has no encoded metadata".into(),
            ));
        };
        let summary = summary.get().ok_or_else(|| {
            TransformError::IllegalState("encoding sink must be closed before reading metadata".into())
        })?;
        let size = summary.uncompressed.size;
        let mut encoded = metadata.clone();
        encoded.insert(COMP_UNCOMPRESSED_SIZE.to_string(), size.to_string());
        encoded.insert(COMP_COMPRESSED_SIZE.to_string(), summary.compressed_size.to_string());
        encoded.insert(
            COMP_RATIO.to_string(),
            compression_ratio(summary.compressed_size, size),
        );
        encoded.insert(COMP_UNCOMPRESSED_SHA1.to_string(), summary.uncompressed.sha1_hex());
        Ok(encoded)
    }

    fn decoded_metadata(&self, metadata: &Metadata) -> Metadata {
        strip_prefix(metadata, COMP_PREFIX)
    }
}

fn record(summary: &OnceLock<CompressionSummary>, size: u64, sha1: [u8; 20], compressed_size: u64) {
    let _ = summary.set(CompressionSummary {
        uncompressed: StreamSummary { size, sha1 },
        compressed_size,
    });
    debug!(
        size,
        compressed_size,
        ratio = %compression_ratio(compressed_size, size),
        "compression sink closed"
    );
}

struct DeflateSink {
    writer: DigestWriter<CountingWriter<ZlibEncoder<CountingWriter<BoxSink>>>>,
    summary: Arc<OnceLock<CompressionSummary>>,
}

impl Write for DeflateSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl ObjectSink for DeflateSink {
    fn close(self: Box<Self>) -> io::Result<()> {
        let DeflateSink { writer, summary } = *self;
        let (sha1, counting) = writer.finish();
        let (size, engine) = counting.into_parts();
        let (compressed_size, inner) = engine.finish()?.into_parts();
        inner.close()?;
        record(&summary, size, sha1, compressed_size);
        Ok(())
    }
}

struct LzmaSink {
    writer: DigestWriter<CountingWriter<BackgroundEncoder>>,
    summary: Arc<OnceLock<CompressionSummary>>,
}

impl Write for LzmaSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl ObjectSink for LzmaSink {
    fn close(self: Box<Self>) -> io::Result<()> {
        let LzmaSink { writer, summary } = *self;
        let (sha1, counting) = writer.finish();
        let (size, engine) = counting.into_parts();
        let (inner, compressed_size) = engine.finish()?;
        inner.close()?;
        record(&summary, size, sha1, compressed_size);
        Ok(())
    }
}
