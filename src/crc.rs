// Copyright 2025 Brian Langenberger
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! CRC-8 and CRC-16 checksums as used by FLAC frames
//!
//! Both are MSB-first with no reflection and an initial value of 0.
//! CRC-8 (polynomial 0x07) covers each frame header,
//! while CRC-16 (polynomial 0x8005) covers the whole frame.

use crate::bitbuffer::BitBuffer;

/// A running checksum over a stream of bytes
pub trait Checksum: Default {
    /// The finished checksum's type
    type Output: Copy + Into<u64>;

    /// Updates checksum with a single byte
    fn update(&mut self, byte: u8);

    /// Updates checksum with many bytes
    fn update_bytes(&mut self, bytes: &[u8]) {
        bytes.iter().for_each(|b| self.update(*b))
    }

    /// Returns current checksum value
    fn checksum(&self) -> Self::Output;
}

const fn crc8_table() -> [u8; 256] {
    let mut table = [0; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x07
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

const fn crc16_table() -> [u16; 256] {
    let mut table = [0; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x8005
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC8: [u8; 256] = crc8_table();
static CRC16: [u16; 256] = crc16_table();

/// The frame header checksum
#[derive(Copy, Clone, Debug, Default)]
pub struct Crc8 {
    crc: u8,
}

impl Checksum for Crc8 {
    type Output = u8;

    #[inline]
    fn update(&mut self, byte: u8) {
        self.crc = CRC8[(self.crc ^ byte) as usize];
    }

    #[inline]
    fn checksum(&self) -> u8 {
        self.crc
    }
}

/// The whole-frame checksum
///
/// In addition to plain bytes, this can digest a [`BitBuffer`]
/// chain directly, merging the partial bytes which
/// straddle node boundaries.
/// A partial byte left at the end of a chain is held
/// until more bits arrive, and is treated as zero-padded
/// if the checksum is taken first.
#[derive(Copy, Clone, Debug, Default)]
pub struct Crc16 {
    crc: u16,
    partial: Option<u8>,
}

impl Crc16 {
    #[inline]
    fn fold(crc: u16, byte: u8) -> u16 {
        (crc << 8) ^ CRC16[((crc >> 8) as u8 ^ byte) as usize]
    }

    /// Resets checksum to its initial state
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Updates checksum with the contents of a buffer chain
    pub fn update_buffer(&mut self, buffer: &BitBuffer) {
        for node in buffer.nodes() {
            let mut start = 0;
            if node.offset != 0 {
                let merged =
                    self.partial.take().unwrap_or(0) | node.bytes.first().copied().unwrap_or(0);
                if node.usable_bits < 8 {
                    self.partial = Some(merged);
                    continue;
                }
                self.crc = Self::fold(self.crc, merged);
                start = 1;
            } else if let Some(partial) = self.partial.take() {
                self.crc = Self::fold(self.crc, partial);
            }

            let full = node.usable_bits / 8;
            if full > start {
                self.crc = node.bytes[start..full]
                    .iter()
                    .fold(self.crc, |crc, b| Self::fold(crc, *b));
            }
            if node.usable_bits % 8 != 0 {
                self.partial = Some(node.bytes[full]);
            }
        }
    }
}

impl Checksum for Crc16 {
    type Output = u16;

    #[inline]
    fn update(&mut self, byte: u8) {
        if let Some(partial) = self.partial.take() {
            self.crc = Self::fold(self.crc, partial);
        }
        self.crc = Self::fold(self.crc, byte);
    }

    fn checksum(&self) -> u16 {
        match self.partial {
            Some(partial) => Self::fold(self.crc, partial),
            None => self.crc,
        }
    }
}

/// A writer which checksums everything passing through it
pub struct CrcWriter<W, C> {
    writer: W,
    crc: C,
}

impl<W: std::io::Write, C: Checksum> CrcWriter<W, C> {
    /// Wraps writer with a fresh checksum
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            crc: C::default(),
        }
    }

    /// Returns checksum of everything written so far
    pub fn checksum(&self) -> C::Output {
        self.crc.checksum()
    }

    /// Returns inner writer
    pub fn into_writer(self) -> W {
        self.writer
    }
}

impl<W: std::io::Write, C: Checksum> std::io::Write for CrcWriter<W, C> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let written = self.writer.write(buf)?;
        self.crc.update_bytes(&buf[0..written]);
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}
