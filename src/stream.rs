// Copyright 2025 Brian Langenberger
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! For writing common FLAC stream items

use crate::Error;
use crate::crc::{Crc8, CrcWriter};
use arrayvec::ArrayVec;
use bitstream_io::{BigEndian, BitWrite, BitWriter, ToBitStream};

/// A frame's sequence number
///
/// For streams with a fixed block size,
/// frame numbers are limited to 31 bits.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FrameNumber(u32);

impl FrameNumber {
    /// The largest frame number
    pub const MAX: u32 = (1 << 31) - 1;

    /// Builds frame number from integer
    ///
    /// # Errors
    ///
    /// Returns [`Error::ExcessiveFrameNumber`] if
    /// the value is larger than 31 bits.
    pub fn new(number: u64) -> Result<Self, Error> {
        u32::try_from(number)
            .ok()
            .filter(|n| *n <= Self::MAX)
            .map(Self)
            .ok_or(Error::ExcessiveFrameNumber)
    }

    /// Advances to the next frame number
    pub fn try_increment(&mut self) -> Result<(), Error> {
        *self = Self::new(u64::from(self.0) + 1)?;
        Ok(())
    }

    /// Frame number as an integer
    pub fn get(self) -> u64 {
        self.0.into()
    }

    /// Frame number in its variable-length coded form
    fn coded(self) -> ArrayVec<u8, 6> {
        let value = self.0;
        let mut bytes = ArrayVec::new();

        let len = match value {
            0..0x80 => {
                bytes.push(value as u8);
                return bytes;
            }
            0x80..0x800 => 2,
            0x800..0x10000 => 3,
            0x10000..0x200000 => 4,
            0x200000..0x4000000 => 5,
            _ => 6,
        };

        bytes.push(((0xFF00 >> len) as u8) | (value >> (6 * (len - 1))) as u8);
        for i in (0..len - 1).rev() {
            bytes.push(0x80 | ((value >> (6 * i)) & 0x3F) as u8);
        }
        bytes
    }
}

impl std::fmt::Display for FrameNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl ToBitStream for FrameNumber {
    type Error = std::io::Error;

    fn to_writer<W: BitWrite + ?Sized>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_bytes(&self.coded())
    }
}

/// How a frame's channels relate to the stream's channels
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ChannelAssignment {
    /// Channels stored independently
    Independent(u8),
    /// Left channel and side (left minus right) channel
    LeftSide,
    /// Side (left minus right) channel and right channel
    SideRight,
    /// Mid channel and side (left minus right) channel
    MidSide,
}

impl ChannelAssignment {
    /// Number of channels in frame
    pub fn count(self) -> u8 {
        match self {
            Self::Independent(c) => c,
            _ => 2,
        }
    }

    /// Index of the side channel, which needs one extra bit per sample
    pub fn side_channel(self) -> Option<usize> {
        match self {
            Self::Independent(_) => None,
            Self::LeftSide | Self::MidSide => Some(1),
            Self::SideRight => Some(0),
        }
    }

    fn code(self) -> u8 {
        match self {
            Self::Independent(c) => c - 1,
            Self::LeftSide => 0b1000,
            Self::SideRight => 0b1001,
            Self::MidSide => 0b1010,
        }
    }
}

/// A frame header field stored after the frame number
#[derive(Copy, Clone, Debug)]
enum Tail {
    None,
    Byte(u8),
    Word(u16),
}

impl ToBitStream for Tail {
    type Error = std::io::Error;

    fn to_writer<W: BitWrite + ?Sized>(&self, w: &mut W) -> std::io::Result<()> {
        match self {
            Self::None => Ok(()),
            Self::Byte(b) => w.write::<8, u8>(*b),
            Self::Word(v) => w.write::<16, u16>(*v),
        }
    }
}

fn block_size_code(block_size: u16) -> (u8, Tail) {
    match block_size {
        192 => (0b0001, Tail::None),
        576 => (0b0010, Tail::None),
        1152 => (0b0011, Tail::None),
        2304 => (0b0100, Tail::None),
        4608 => (0b0101, Tail::None),
        n @ (256 | 512 | 1024 | 2048 | 4096 | 8192 | 16384 | 32768) => {
            (n.ilog2() as u8, Tail::None)
        }
        n @ 1..=256 => (0b0110, Tail::Byte((n - 1) as u8)),
        n => (0b0111, Tail::Word(n.saturating_sub(1))),
    }
}

fn sample_rate_code(sample_rate: u32) -> (u8, Tail) {
    match sample_rate {
        88200 => (0b0001, Tail::None),
        176400 => (0b0010, Tail::None),
        192000 => (0b0011, Tail::None),
        8000 => (0b0100, Tail::None),
        16000 => (0b0101, Tail::None),
        22050 => (0b0110, Tail::None),
        24000 => (0b0111, Tail::None),
        32000 => (0b1000, Tail::None),
        44100 => (0b1001, Tail::None),
        48000 => (0b1010, Tail::None),
        96000 => (0b1011, Tail::None),
        r if r % 1000 == 0 && r <= 255_000 => (0b1100, Tail::Byte((r / 1000) as u8)),
        r if r < 65536 => (0b1101, Tail::Word(r as u16)),
        r if r % 10 == 0 && r <= 655_350 => (0b1110, Tail::Word((r / 10) as u16)),
        _ => (0b0000, Tail::None),
    }
}

fn bits_per_sample_code(bits_per_sample: u32) -> u8 {
    match bits_per_sample {
        8 => 0b001,
        12 => 0b010,
        16 => 0b100,
        20 => 0b101,
        24 => 0b110,
        _ => 0b000,
    }
}

/// A FLAC frame header for a fixed block size stream
#[derive(Copy, Clone, Debug)]
pub struct FrameHeader {
    /// The frame's sequence number
    pub frame_number: FrameNumber,
    /// Number of inter-channel samples in frame
    pub block_size: u16,
    /// Sample rate, in Hz
    pub sample_rate: u32,
    /// Channel assignment
    pub channel_assignment: ChannelAssignment,
    /// Bits per sample
    pub bits_per_sample: u32,
}

impl FrameHeader {
    const SYNC_CODE: u16 = 0b111111111111100;

    /// Appends header, followed by its CRC-8, to the given bytes
    pub fn write_to(&self, bytes: &mut Vec<u8>) -> Result<(), Error> {
        let mut w = BitWriter::endian(CrcWriter::<_, Crc8>::new(&mut *bytes), BigEndian);
        w.build(self)?;
        let crc8 = w.into_writer().checksum();
        bytes.push(crc8);
        Ok(())
    }
}

impl ToBitStream for FrameHeader {
    type Error = Error;

    fn to_writer<W: BitWrite + ?Sized>(&self, w: &mut W) -> Result<(), Self::Error> {
        let (block_size, block_size_tail) = block_size_code(self.block_size);
        let (sample_rate, sample_rate_tail) = sample_rate_code(self.sample_rate);

        w.write::<15, u16>(Self::SYNC_CODE)?;
        w.write_bit(false)?; // fixed block size
        w.write::<4, u8>(block_size)?;
        w.write::<4, u8>(sample_rate)?;
        w.write::<4, u8>(self.channel_assignment.code())?;
        w.write::<3, u8>(bits_per_sample_code(self.bits_per_sample))?;
        w.write_bit(false)?; // reserved
        w.build(&self.frame_number)?;
        w.build(&block_size_tail)?;
        w.build(&sample_rate_tail)?;
        Ok(())
    }
}
