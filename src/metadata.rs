// Copyright 2025 Brian Langenberger
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! For handling the metadata blocks an encoder writes

use crate::Error;
use bitstream_io::{
    BigEndian, BitRead, BitReader, BitWrite, FromBitStream, FromBitStreamUsing, ToBitStream,
};

/// The 32-bit header preceding each metadata block
///
/// One bit flags the final block, seven bits give
/// the block's type and 24 bits its length in bytes.
///
/// # Example
/// ```
/// use bitstream_io::{BitReader, BitRead, BigEndian};
/// use flac_pipeline::metadata::{BlockHeader, BlockType};
///
/// let data: &[u8] = &[0b1_0000000, 0x00, 0x00, 0x22];
/// let mut r = BitReader::endian(data, BigEndian);
/// assert_eq!(
///     r.parse::<BlockHeader>().unwrap(),
///     BlockHeader {
///         last: true,
///         block_type: BlockType::Streaminfo,
///         size: 0x22,
///     },
/// );
/// ```
#[derive(Debug, Eq, PartialEq)]
pub struct BlockHeader {
    /// Set on the last metadata block before the frames
    pub last: bool,
    /// Kind of block that follows
    pub block_type: BlockType,
    /// Length of the block's body, not including this header
    pub size: u32,
}

impl BlockHeader {
    /// The largest block size, in bytes
    pub const MAX_SIZE: u32 = (1 << 24) - 1;
}

impl FromBitStream for BlockHeader {
    type Error = Error;

    fn from_reader<R: BitRead + ?Sized>(r: &mut R) -> Result<Self, Self::Error> {
        Ok(Self {
            last: r.read_bit()?,
            block_type: r.parse()?,
            size: r.read::<24, _>()?,
        })
    }
}

impl ToBitStream for BlockHeader {
    type Error = Error;

    fn to_writer<W: BitWrite + ?Sized>(&self, w: &mut W) -> Result<(), Self::Error> {
        w.write_bit(self.last)?;
        w.build(&self.block_type)?;
        w.write::<24, _>(self.size)?;
        Ok(())
    }
}

/// A metadata block type written by the encoder
#[derive(Copy, Clone, Debug, Ord, PartialOrd, Eq, PartialEq)]
pub enum BlockType {
    /// The STREAMINFO block
    Streaminfo,
    /// The PADDING block
    Padding,
    /// Any other block, which the encoder never writes
    Other(u8),
}

impl FromBitStream for BlockType {
    type Error = std::io::Error;

    fn from_reader<R: BitRead + ?Sized>(r: &mut R) -> Result<Self, Self::Error> {
        Ok(match r.read::<7, u8>()? {
            0 => Self::Streaminfo,
            1 => Self::Padding,
            other => Self::Other(other),
        })
    }
}

impl ToBitStream for BlockType {
    type Error = std::io::Error;

    fn to_writer<W: BitWrite + ?Sized>(&self, w: &mut W) -> Result<(), Self::Error> {
        w.write::<7, u8>(match self {
            Self::Streaminfo => 0,
            Self::Padding => 1,
            Self::Other(other) => *other,
        })
    }
}

/// Stream-wide parameters and totals
///
/// Written once at the head of every stream, before any other
/// metadata block, and overwritten with final totals at close
/// when the sink allows it.
///
/// Its 34-byte body packs, in order, the two 16-bit block sizes,
/// the two 24-bit frame sizes, a 20-bit sample rate,
/// 3 bits of channels less one, 5 bits of sample size less one,
/// a 36-bit sample total and the 16-byte MD5 digest.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Streaminfo {
    /// Smallest block, in inter-channel samples,
    /// not counting a shorter final block
    pub minimum_block_size: u16,
    /// Largest block, in inter-channel samples
    pub maximum_block_size: u16,
    /// Smallest frame in bytes, or 0 if not yet known
    pub minimum_frame_size: u32,
    /// Largest frame in bytes, or 0 if not yet known
    pub maximum_frame_size: u32,
    /// Samples per second
    pub sample_rate: u32,
    /// Channel count
    pub channels: u8,
    /// Sample size in bits
    pub bits_per_sample: u32,
    /// Inter-channel samples in the whole stream, or 0 if not yet known
    pub total_samples: u64,
    /// Digest of the input samples, zeroed until known
    pub md5: [u8; 16],
}

impl Streaminfo {
    /// Size of the block's body, in bytes
    pub const SIZE: u32 = 34;

    /// Largest frame size the 24-bit fields can hold
    pub const MAX_FRAME_SIZE: u32 = (1 << 24) - 1;

    /// Largest sample total the 36-bit field can hold
    pub const MAX_TOTAL_SAMPLES: u64 = (1 << 36) - 1;
}

impl FromBitStream for Streaminfo {
    type Error = std::io::Error;

    fn from_reader<R: BitRead + ?Sized>(r: &mut R) -> Result<Self, Self::Error> {
        Ok(Self {
            minimum_block_size: r.read_to()?,
            maximum_block_size: r.read_to()?,
            minimum_frame_size: r.read::<24, _>()?,
            maximum_frame_size: r.read::<24, _>()?,
            sample_rate: r.read::<20, _>()?,
            channels: r.read::<3, u8>()? + 1,
            bits_per_sample: r.read::<5, u32>()? + 1,
            total_samples: r.read::<36, _>()?,
            md5: r.read_to()?,
        })
    }
}

impl ToBitStream for Streaminfo {
    type Error = std::io::Error;

    fn to_writer<W: BitWrite + ?Sized>(&self, w: &mut W) -> Result<(), Self::Error> {
        w.write_from(self.minimum_block_size)?;
        w.write_from(self.maximum_block_size)?;
        w.write::<24, _>(self.minimum_frame_size)?;
        w.write::<24, _>(self.maximum_frame_size)?;
        w.write::<20, _>(self.sample_rate)?;
        w.write::<3, u8>(self.channels - 1)?;
        w.write::<5, u32>(self.bits_per_sample - 1)?;
        w.write::<36, _>(self.total_samples)?;
        w.write_from(self.md5)?;
        Ok(())
    }
}

/// Zero-filled space reserved after STREAMINFO
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Padding {
    /// Bytes of zeroes
    pub size: u32,
}

impl FromBitStreamUsing for Padding {
    type Context = u32;
    type Error = Error;

    fn from_reader<R: BitRead + ?Sized>(r: &mut R, size: u32) -> Result<Self, Self::Error> {
        r.skip(size * 8)?;
        Ok(Self { size })
    }
}

impl ToBitStream for Padding {
    type Error = std::io::Error;

    fn to_writer<W: BitWrite + ?Sized>(&self, w: &mut W) -> Result<(), Self::Error> {
        w.pad(self.size * 8)
    }
}

/// A metadata block the encoder writes
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Block {
    /// The STREAMINFO block
    Streaminfo(Streaminfo),
    /// A PADDING block
    Padding(Padding),
}

impl Block {
    /// Type written in the block's header
    pub fn block_type(&self) -> BlockType {
        match self {
            Self::Streaminfo(_) => BlockType::Streaminfo,
            Self::Padding(_) => BlockType::Padding,
        }
    }

    /// Length of the block's body, in bytes
    pub fn size(&self) -> u32 {
        match self {
            Self::Streaminfo(_) => Streaminfo::SIZE,
            Self::Padding(p) => p.size,
        }
    }

    /// Length of header and body together, in bytes
    pub fn total_size(&self) -> u64 {
        4 + u64::from(self.size())
    }

    fn write<W: BitWrite + ?Sized>(&self, w: &mut W, last: bool) -> Result<(), Error> {
        if self.size() > BlockHeader::MAX_SIZE {
            return Err(Error::ExcessiveBlockSize);
        }
        w.build(&BlockHeader {
            last,
            block_type: self.block_type(),
            size: self.size(),
        })?;
        match self {
            Self::Streaminfo(streaminfo) => w.build(streaminfo)?,
            Self::Padding(padding) => w.build(padding)?,
        }
        Ok(())
    }
}

impl From<Streaminfo> for Block {
    fn from(streaminfo: Streaminfo) -> Self {
        Self::Streaminfo(streaminfo)
    }
}

impl From<Padding> for Block {
    fn from(padding: Padding) -> Self {
        Self::Padding(padding)
    }
}

/// Given a collection of metadata blocks,
/// writes the "fLaC" stream marker followed by each block
///
/// The last block is flagged as such.
///
/// # Errors
///
/// Passes along any I/O errors from the underlying stream.
/// Returns [`Error::MissingStreaminfo`] if STREAMINFO
/// is not the first and only STREAMINFO block.
pub fn write_blocks<'b>(
    blocks: impl IntoIterator<Item = &'b Block>,
    w: impl std::io::Write,
) -> Result<(), Error> {
    let mut w = bitstream_io::BitWriter::endian(w, BigEndian);
    w.write_bytes(b"fLaC")?;

    let mut blocks = blocks.into_iter().peekable();
    let mut first = true;

    while let Some(block) = blocks.next() {
        // exactly one STREAMINFO, ahead of everything else
        if first != matches!(block, Block::Streaminfo(_)) {
            return Err(Error::MissingStreaminfo);
        }
        first = false;
        block.write(&mut w, blocks.peek().is_none())?;
    }

    match first {
        true => Err(Error::MissingStreaminfo),
        false => Ok(()),
    }
}

/// Reads the "fLaC" stream marker and STREAMINFO block
/// from the start of a stream
///
/// # Errors
///
/// Passes along any I/O errors from the underlying stream.
/// Returns [`Error::MissingStreaminfo`] if the stream
/// doesn't start with a marker and STREAMINFO.
pub fn read_streaminfo<R: std::io::Read>(r: R) -> Result<Streaminfo, Error> {
    let mut r = BitReader::endian(r, BigEndian);

    if &r.read_to::<[u8; 4]>()? != b"fLaC" {
        return Err(Error::MissingStreaminfo);
    }

    match r.parse::<BlockHeader>()? {
        BlockHeader {
            block_type: BlockType::Streaminfo,
            size: Streaminfo::SIZE,
            ..
        } => Ok(r.parse()?),
        _ => Err(Error::MissingStreaminfo),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn streaminfo() -> Streaminfo {
        Streaminfo {
            minimum_block_size: 4096,
            maximum_block_size: 4096,
            minimum_frame_size: 14,
            maximum_frame_size: 12345,
            sample_rate: 44100,
            channels: 2,
            bits_per_sample: 16,
            total_samples: 1_000_000,
            md5: [0xAB; 16],
        }
    }

    #[test]
    fn test_streaminfo_layout() {
        let mut bytes = vec![];
        write_blocks([&Block::from(streaminfo())], &mut bytes).unwrap();

        assert_eq!(bytes.len(), 4 + 4 + 34);
        assert_eq!(&bytes[0..4], b"fLaC");
        // last block, type 0, 34 bytes
        assert_eq!(&bytes[4..8], &[0x80, 0x00, 0x00, 0x22]);
        assert_eq!(&bytes[8..12], &[0x10, 0x00, 0x10, 0x00]);
        // 20 bits of 44100, 3 bits of 1, 5 bits of 15, 4 high bits of total
        assert_eq!(&bytes[18..22], &[0x0A, 0xC4, 0x42, 0xF0]);
        assert_eq!(&bytes[26..42], &[0xAB; 16]);

        assert_eq!(read_streaminfo(bytes.as_slice()).unwrap(), streaminfo());
    }

    #[test]
    fn test_padding() {
        let blocks: [Block; 2] = [streaminfo().into(), Padding { size: 10 }.into()];
        let mut bytes = vec![];
        write_blocks(&blocks, &mut bytes).unwrap();

        assert_eq!(
            bytes.len() as u64,
            4 + blocks.iter().map(|b| b.total_size()).sum::<u64>()
        );
        // STREAMINFO is no longer last
        assert_eq!(bytes[4], 0x00);
        assert_eq!(&bytes[42..46], &[0x81, 0x00, 0x00, 0x0A]);
        assert!(bytes[46..].iter().all(|b| *b == 0));

        let mut r = BitReader::endian(&bytes[42..], BigEndian);
        let header = r.parse::<BlockHeader>().unwrap();
        assert_eq!(
            r.parse_using::<Padding>(header.size).unwrap(),
            Padding { size: 10 }
        );
    }

    #[test]
    fn test_missing_streaminfo() {
        let mut bytes = vec![];
        assert!(matches!(
            write_blocks([&Block::from(Padding { size: 1 })], &mut bytes),
            Err(Error::MissingStreaminfo)
        ));
        assert!(matches!(
            read_streaminfo(&b"RIFF\x80\x00\x00\x22"[..]),
            Err(Error::MissingStreaminfo)
        ));
    }
}
