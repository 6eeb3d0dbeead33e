// Copyright 2025 Brian Langenberger
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Destinations for encoded streams
//!
//! The finalizer only needs to append bytes and,
//! when possible, to seek back and rewrite STREAMINFO.
//! Sinks which cannot seek leave STREAMINFO as written
//! at stream open.

use parking_lot::Mutex;
use std::io::{Cursor, Seek, SeekFrom, Write};
use std::sync::Arc;

/// Where encoded bytes go
pub trait OutputSink: Send {
    /// Writes all of the given bytes at the current position
    fn write(&mut self, bytes: &[u8]) -> std::io::Result<()>;

    /// Writes a single byte at the current position
    fn write_byte(&mut self, byte: u8) -> std::io::Result<()> {
        self.write(std::slice::from_ref(&byte))
    }

    /// Moves to an absolute byte position, returning the new position
    fn seek(&mut self, position: u64) -> std::io::Result<u64>;

    /// The current byte position
    fn position(&self) -> u64;

    /// Whether [`OutputSink::seek`] is supported
    fn can_seek(&self) -> bool;
}

/// A sink over any seekable writer, such as a file
pub struct SeekableSink<W> {
    writer: W,
    position: u64,
}

impl<W: Write + Seek> SeekableSink<W> {
    /// Wraps writer, taking its current position as our own
    pub fn new(mut writer: W) -> std::io::Result<Self> {
        let position = writer.stream_position()?;
        Ok(Self { writer, position })
    }

    /// Returns inner writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Seek + Send> OutputSink for SeekableSink<W> {
    fn write(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(bytes)?;
        self.position += bytes.len() as u64;
        Ok(())
    }

    fn seek(&mut self, position: u64) -> std::io::Result<u64> {
        self.position = self.writer.seek(SeekFrom::Start(position))?;
        Ok(self.position)
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn can_seek(&self) -> bool {
        true
    }
}

/// A sink over a writer which only appends, such as a pipe or socket
pub struct StreamingSink<W> {
    writer: W,
    position: u64,
}

impl<W: Write> StreamingSink<W> {
    /// Wraps writer
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            position: 0,
        }
    }

    /// Returns inner writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> OutputSink for StreamingSink<W> {
    fn write(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(bytes)?;
        self.position += bytes.len() as u64;
        Ok(())
    }

    fn seek(&mut self, _position: u64) -> std::io::Result<u64> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "sink does not support seeking",
        ))
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn can_seek(&self) -> bool {
        false
    }
}

/// An in-memory, seekable sink whose clones share one buffer
///
/// Handy for encoding to memory while the encoder
/// owns the sink.
#[derive(Clone, Debug, Default)]
pub struct MemorySink {
    buffer: Arc<Mutex<Cursor<Vec<u8>>>>,
}

impl MemorySink {
    /// A copy of everything written so far
    pub fn contents(&self) -> Vec<u8> {
        self.buffer.lock().get_ref().clone()
    }
}

impl OutputSink for MemorySink {
    fn write(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.buffer.lock().write_all(bytes)
    }

    fn seek(&mut self, position: u64) -> std::io::Result<u64> {
        self.buffer.lock().seek(SeekFrom::Start(position))
    }

    fn position(&self) -> u64 {
        self.buffer.lock().position()
    }

    fn can_seek(&self) -> bool {
        true
    }
}
