//! Bounded in-memory pipe and a background worker that runs a source-pulling encoder
//! behind a push-style `Write`.
//!
//! Some coders only offer "encode everything from this reader into that writer". To feed them
//! from caller writes, the caller side writes into a [`PipeWriter`], a dedicated thread runs the
//! coder over the matching [`PipeReader`], and the coder's output goes to the real sink.
//! The pipe holds at most `capacity` chunks of `chunk_size` bytes, so a slow coder blocks the
//! caller instead of buffering the object in memory.

use crate::error::{Result, TransformError};
use crate::stream::{BoxSink, CountingWriter};
use crossbeam_channel::{bounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::io::{self, BufRead, Read, Write};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// Sizing of the pipe between caller writes and the background coder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipeConfig {
    /// Bytes per chunk handed to the coder.
    pub chunk_size: usize,
    /// Chunks that may be queued before caller writes block.
    pub capacity: usize,
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            capacity: 8,
        }
    }
}

impl PipeConfig {
    /// Reject zero-sized pipes.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.capacity == 0 {
            return Err(TransformError::InvalidConfig(format!(
                "pipe chunk_size and capacity must be positive (got {} x {})",
                self.chunk_size, self.capacity
            )));
        }
        Ok(())
    }
}

/// First error raised by a background worker, kept for every later caller operation.
#[derive(Debug, Default)]
pub struct StickyError {
    cell: OnceLock<(io::ErrorKind, String)>,
}

impl StickyError {
    /// Record `err` unless an earlier error is already recorded.
    pub fn set(&self, err: &io::Error) {
        let _ = self.cell.set((err.kind(), err.to_string()));
    }

    /// The recorded error, as a fresh `io::Error`.
    pub fn get(&self) -> Option<io::Error> {
        self.cell
            .get()
            .map(|(kind, msg)| io::Error::new(*kind, format!("background compressor failed: {msg}")))
    }

    /// `Err` if an error has been recorded.
    pub fn check(&self) -> io::Result<()> {
        match self.get() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Create a bounded pipe.
pub fn pipe(config: PipeConfig) -> (PipeWriter, PipeReader) {
    let (tx, rx) = bounded(config.capacity);
    (
        PipeWriter {
            tx: Some(tx),
            buf: Vec::with_capacity(config.chunk_size),
            chunk_size: config.chunk_size,
        },
        PipeReader {
            rx,
            current: Vec::new(),
            pos: 0,
        },
    )
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader has gone away")
}

/// Producer end of the pipe.
pub struct PipeWriter {
    tx: Option<Sender<Vec<u8>>>,
    buf: Vec<u8>,
    chunk_size: usize,
}

impl PipeWriter {
    fn send_buffered(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let tx = self.tx.as_ref().ok_or_else(broken_pipe)?;
        let chunk = std::mem::replace(&mut self.buf, Vec::with_capacity(self.chunk_size));
        tx.send(chunk).map_err(|_| broken_pipe())
    }

    /// Send any buffered bytes and signal end of data to the reader.
    pub fn close(&mut self) -> io::Result<()> {
        let result = self.send_buffered();
        self.tx = None;
        result
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.tx.is_none() {
            return Err(broken_pipe());
        }
        let take = (self.chunk_size - self.buf.len()).min(buf.len());
        self.buf.extend_from_slice(&buf[..take]);
        if self.buf.len() == self.chunk_size {
            self.send_buffered()?;
        }
        Ok(take)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_buffered()
    }
}

/// Consumer end of the pipe. Reports end of stream once the writer is closed or dropped
/// and every queued chunk has been read.
pub struct PipeReader {
    rx: Receiver<Vec<u8>>,
    current: Vec<u8>,
    pos: usize,
}

impl BufRead for PipeReader {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        while self.pos >= self.current.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.current = chunk;
                    self.pos = 0;
                }
                Err(_) => return Ok(&[]),
            }
        }
        Ok(&self.current[self.pos..])
    }

    fn consume(&mut self, amt: usize) {
        self.pos = (self.pos + amt).min(self.current.len());
    }
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let available = self.fill_buf()?;
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.consume(n);
        Ok(n)
    }
}

type WorkerResult = io::Result<(BoxSink, u64)>;

/// Push-style writer in front of a coder running on its own thread.
///
/// Every caller-facing operation first checks the sticky error cell, so a failure inside the
/// coder surfaces on the next `write`, `flush` or [`BackgroundEncoder::finish`]. The worker
/// drops its pipe reader when it fails, which also wakes a caller blocked on a full pipe.
pub struct BackgroundEncoder {
    pipe: PipeWriter,
    worker: Option<JoinHandle<WorkerResult>>,
    error: Arc<StickyError>,
}

impl BackgroundEncoder {
    /// Spawn `encode` on a named thread, reading from the pipe and writing into `inner`.
    pub fn spawn<F>(
        name: &str,
        inner: BoxSink,
        config: PipeConfig,
        encode: F,
    ) -> Result<Self>
    where
        F: FnOnce(&mut PipeReader, &mut CountingWriter<BoxSink>) -> io::Result<()> + Send + 'static,
    {
        config.validate()?;
        let (writer, mut reader) = pipe(config);
        let error = Arc::new(StickyError::default());
        let worker_error = Arc::clone(&error);
        let worker = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut out = CountingWriter::new(inner);
                let result = encode(&mut reader, &mut out).and_then(|()| out.flush());
                match result {
                    Ok(()) => {
                        let (written, inner) = out.into_parts();
                        Ok((inner, written))
                    }
                    Err(e) => {
                        warn!(error = %e, "background encoder failed");
                        worker_error.set(&e);
                        drop(reader);
                        Err(e)
                    }
                }
            })?;
        Ok(Self {
            pipe: writer,
            worker: Some(worker),
            error,
        })
    }

    /// Prefer the worker's own error over the broken pipe it caused.
    fn surface(&self, err: io::Error) -> io::Error {
        self.error.get().unwrap_or(err)
    }

    /// Signal end of data, wait for the coder to drain, and return the inner sink with
    /// the number of encoded bytes written to it. Blocks until the worker exits.
    pub fn finish(mut self) -> io::Result<(BoxSink, u64)> {
        self.error.check()?;
        let closed = self.pipe.close();
        let worker = self
            .worker
            .take()
            .ok_or_else(|| io::Error::other("background encoder already finished"))?;
        let joined = worker
            .join()
            .map_err(|_| io::Error::other("background encoder thread panicked"))?;
        let (inner, written) = joined.map_err(|e| self.surface(e))?;
        closed.map_err(|e| self.surface(e))?;
        debug!(written, "background encoder drained");
        Ok((inner, written))
    }
}

impl Write for BackgroundEncoder {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.error.check()?;
        self.pipe.write(buf).map_err(|e| self.surface(e))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.error.check()?;
        self.pipe.flush().map_err(|e| self.surface(e))
    }
}
