//! Byte sinks and sources the transforms wrap, plus the digest, counting and
//! verifying filters shared by every transform.

use crate::error::{Result, TransformError};
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A writable object stream that must be closed to finish the object.
///
/// Encoding sinks emit trailing bytes (final cipher block, compressor footer) and finalize
/// their digest and size on `close`, then close the sink they wrap. Not intended for use by
/// more than one writer at a time.
pub trait ObjectSink: Write + Send {
    /// Flush trailing state and close this sink and everything beneath it.
    fn close(self: Box<Self>) -> io::Result<()>;
}

/// Boxed [`ObjectSink`], the unit the chain composes.
pub type BoxSink = Box<dyn ObjectSink>;

/// Boxed readable object stream.
pub type BoxSource = Box<dyn Read + Send>;

/// Adapts any `Write` into an [`ObjectSink`]; closing flushes it.
pub struct WriterSink<W> {
    inner: W,
}

impl<W: Write + Send + 'static> WriterSink<W> {
    /// Wraps `inner`.
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Wraps `inner` and boxes it.
    pub fn boxed(inner: W) -> BoxSink {
        Box::new(Self::new(inner))
    }
}

impl<W: Write> Write for WriterSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<W: Write + Send> ObjectSink for WriterSink<W> {
    fn close(mut self: Box<Self>) -> io::Result<()> {
        self.inner.flush()
    }
}

/// In-memory object sink. Clones share one buffer, so a caller can keep a handle
/// and read the stored bytes after the encoding chain has consumed and closed the sink.
#[derive(Clone, Default)]
pub struct MemorySink {
    buf: Arc<Mutex<Vec<u8>>>,
    closed: Arc<AtomicBool>,
}

impl MemorySink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything written so far.
    pub fn contents(&self) -> Vec<u8> {
        self.buf.lock().clone()
    }

    /// True once `close` has been called on any clone.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Boxed clone of this sink, sharing the buffer.
    pub fn boxed(&self) -> BoxSink {
        Box::new(self.clone())
    }
}

impl Write for MemorySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "sink closed"));
        }
        self.buf.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ObjectSink for MemorySink {
    fn close(self: Box<Self>) -> io::Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Size and SHA-1 of a byte stream, fixed once the stream is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSummary {
    /// Bytes seen.
    pub size: u64,
    /// SHA-1 of the bytes seen.
    pub sha1: [u8; 20],
}

impl StreamSummary {
    /// SHA-1 as lowercase hex.
    pub fn sha1_hex(&self) -> String {
        hex::encode(self.sha1)
    }
}

/// Filter that computes the SHA-1 of everything written through it.
pub struct DigestWriter<W> {
    inner: W,
    hasher: Sha1,
}

impl<W: Write> DigestWriter<W> {
    /// Wraps `inner`.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha1::new(),
        }
    }

    /// Finalize the digest and hand back the wrapped writer.
    pub fn finish(self) -> ([u8; 20], W) {
        (self.hasher.finalize().into(), self.inner)
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Filter that counts bytes written through it.
pub struct CountingWriter<W> {
    inner: W,
    count: u64,
}

impl<W: Write> CountingWriter<W> {
    /// Wraps `inner`.
    pub fn new(inner: W) -> Self {
        Self { inner, count: 0 }
    }

    /// Bytes written so far.
    pub fn bytes_written(&self) -> u64 {
        self.count
    }

    /// Byte count and the wrapped writer.
    pub fn into_parts(self) -> (u64, W) {
        (self.count, self.inner)
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Reader that recomputes size and SHA-1 of the decoded stream and, at end of stream,
/// fails with an integrity error if they differ from the values recorded at encode time.
pub struct VerifyingReader<R> {
    inner: R,
    hasher: Sha1,
    count: u64,
    expected_size: Option<u64>,
    expected_sha1: Option<String>,
    label: &'static str,
    verified: bool,
}

impl<R: Read> VerifyingReader<R> {
    /// Wraps `inner`; `None` expectations are not checked.
    pub fn new(
        inner: R,
        expected_size: Option<u64>,
        expected_sha1: Option<String>,
        label: &'static str,
    ) -> Self {
        Self {
            inner,
            hasher: Sha1::new(),
            count: 0,
            expected_size,
            expected_sha1: expected_sha1.map(|s| s.to_ascii_lowercase()),
            label,
            verified: false,
        }
    }

    fn verify(&mut self) -> Result<()> {
        self.verified = true;
        if let Some(expected) = self.expected_size {
            if expected != self.count {
                return Err(TransformError::IntegrityViolation(format!(
                    "{} size mismatch: expected {expected}, got {}",
                    self.label, self.count
                )));
            }
        }
        if let Some(expected) = &self.expected_sha1 {
            let actual = hex::encode(self.hasher.clone().finalize());
            if *expected != actual {
                return Err(TransformError::IntegrityViolation(format!(
                    "{} SHA-1 mismatch",
                    self.label
                )));
            }
        }
        Ok(())
    }
}

impl<R: Read> Read for VerifyingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 && !buf.is_empty() {
            if !self.verified {
                self.verify()?;
            }
            return Ok(0);
        }
        self.hasher.update(&buf[..n]);
        self.count += n as u64;
        if let Some(expected) = self.expected_size {
            if self.count > expected {
                return Err(TransformError::IntegrityViolation(format!(
                    "{} longer than recorded size {expected}",
                    self.label
                ))
                .into());
            }
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_and_count_filters() {
        let sink = MemorySink::new();
        let mut w = DigestWriter::new(CountingWriter::new(sink.clone()));
        w.write_all(b"hello ").unwrap();
        w.write_all(b"world").unwrap();
        let (digest, counting) = w.finish();
        assert_eq!(counting.bytes_written(), 11);
        assert_eq!(digest, <[u8; 20]>::from(Sha1::digest(b"hello world")));
        assert_eq!(sink.contents(), b"hello world");
    }

    #[test]
    fn test_memory_sink_rejects_writes_after_close() {
        let sink = MemorySink::new();
        let mut handle = sink.clone();
        sink.boxed().close().unwrap();
        assert!(sink.is_closed());
        assert!(handle.write(b"x").is_err());
    }

    #[test]
    fn test_verifying_reader_accepts_matching_stream() {
        let data = b"some object bytes".to_vec();
        let sha = hex::encode(Sha1::digest(&data));
        let mut r = VerifyingReader::new(
            io::Cursor::new(data.clone()),
            Some(data.len() as u64),
            Some(sha),
            "test",
        );
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_verifying_reader_rejects_wrong_digest() {
        let mut r = VerifyingReader::new(
            io::Cursor::new(b"abc".to_vec()),
            Some(3),
            Some(hex::encode(Sha1::digest(b"abd"))),
            "test",
        );
        let err = r.read_to_end(&mut Vec::new()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(TransformError::from_io(err).is_integrity());
    }

    #[test]
    fn test_verifying_reader_rejects_wrong_size() {
        let mut r = VerifyingReader::new(io::Cursor::new(b"abcd".to_vec()), Some(3), None, "test");
        let err = r.read_to_end(&mut Vec::new()).unwrap_err();
        assert!(TransformError::from_io(err).is_integrity());
    }

    #[test]
    fn test_verifying_reader_without_expectations_passes() {
        let mut r = VerifyingReader::new(io::Cursor::new(b"abcd".to_vec()), None, None, "test");
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"abcd");
    }
}
