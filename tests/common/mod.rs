// Copyright 2025 Brian Langenberger
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A minimal FLAC decoder for checking encoded streams

#![allow(dead_code)]

use bitstream_io::{BigEndian, BitRead, BitReader};
use flac_pipeline::crc::{Checksum, Crc8, Crc16};
use flac_pipeline::metadata::{BlockHeader, BlockType, Streaminfo};
use std::io;

/// A decoded frame
#[derive(Debug)]
pub struct Frame {
    pub number: u64,
    pub channel_assignment: u8,
    pub block_size: usize,
    pub size: usize,
    /// Interleaved samples
    pub samples: Vec<i32>,
}

/// A decoded stream
#[derive(Debug)]
pub struct Stream {
    pub streaminfo: Streaminfo,
    pub padding: Option<u32>,
    pub frames: Vec<Frame>,
}

impl Stream {
    /// All interleaved samples, in frame order
    pub fn samples(&self) -> Vec<i32> {
        self.frames
            .iter()
            .flat_map(|f| f.samples.iter().copied())
            .collect()
    }

    /// Frame numbers, in stream order
    pub fn frame_numbers(&self) -> Vec<u64> {
        self.frames.iter().map(|f| f.number).collect()
    }
}

/// Decodes a whole stream, panicking if it is invalid
///
/// Frames take their bits-per-sample from STREAMINFO
/// when their header doesn't give one.
pub fn decode(bytes: &[u8]) -> Stream {
    let mut remaining = bytes;
    let mut r = BitReader::endian(&mut remaining, BigEndian);

    assert_eq!(&r.read_to::<[u8; 4]>().unwrap(), b"fLaC");

    let mut streaminfo = None;
    let mut padding = None;
    loop {
        let header = r.parse::<BlockHeader>().unwrap();
        match header.block_type {
            BlockType::Streaminfo => {
                assert!(streaminfo.is_none());
                assert_eq!(header.size, Streaminfo::SIZE);
                streaminfo = Some(r.parse::<Streaminfo>().unwrap());
            }
            BlockType::Padding => {
                assert!(r.read_to_vec(header.size as usize).unwrap().iter().all(|b| *b == 0));
                padding = Some(header.size);
            }
            BlockType::Other(_) => r.skip(header.size * 8).unwrap(),
        }
        if header.last {
            break;
        }
    }
    drop(r);

    let streaminfo = streaminfo.expect("missing STREAMINFO");
    let mut frames = vec![];
    while !remaining.is_empty() {
        let before = remaining;
        let mut frame = read_frame(&mut remaining, &streaminfo).unwrap();
        frame.size = before.len() - remaining.len();

        let frame_bytes = &before[0..frame.size];
        let mut crc16 = Crc16::default();
        crc16.update_bytes(frame_bytes);
        assert_eq!(crc16.checksum(), 0, "CRC-16 mismatch in frame {}", frame.number);
        frames.push(frame);
    }

    Stream {
        streaminfo,
        padding,
        frames,
    }
}

fn invalid(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

fn read_frame(bytes: &mut &[u8], streaminfo: &Streaminfo) -> io::Result<Frame> {
    let start = *bytes;
    let mut r = BitReader::endian(bytes, BigEndian);

    if r.read::<15, u16>()? != 0b111111111111100 {
        return Err(invalid("invalid sync code"));
    }
    if r.read_bit()? {
        return Err(invalid("variable block size"));
    }
    let block_size_code = r.read::<4, u8>()?;
    let sample_rate_code = r.read::<4, u8>()?;
    let channel_assignment = r.read::<4, u8>()?;
    let bits_per_sample = match r.read::<3, u8>()? {
        0b000 => streaminfo.bits_per_sample,
        0b001 => 8,
        0b010 => 12,
        0b100 => 16,
        0b101 => 20,
        0b110 => 24,
        _ => return Err(invalid("invalid bits-per-sample")),
    };
    if r.read_bit()? {
        return Err(invalid("reserved bit set"));
    }

    let (number, number_len) = read_frame_number(&mut r)?;
    let mut header_len = 4 + number_len;

    let block_size = match block_size_code {
        0b0001 => 192,
        code @ 0b0010..=0b0101 => 576 << (code - 2),
        0b0110 => {
            header_len += 1;
            usize::from(r.read::<8, u8>()?) + 1
        }
        0b0111 => {
            header_len += 2;
            usize::from(r.read::<16, u16>()?) + 1
        }
        code @ 0b1000..=0b1111 => 256 << (code - 8),
        _ => return Err(invalid("invalid block size")),
    };

    match sample_rate_code {
        0b1100 => {
            header_len += 1;
            r.skip(8)?;
        }
        0b1101 | 0b1110 => {
            header_len += 2;
            r.skip(16)?;
        }
        0b1111 => return Err(invalid("invalid sample rate")),
        _ => {}
    }

    r.skip(8)?;
    header_len += 1;

    let mut crc8 = Crc8::default();
    crc8.update_bytes(&start[0..header_len]);
    if crc8.checksum() != 0 {
        return Err(invalid("CRC-8 mismatch"));
    }

    let channels = match channel_assignment {
        c @ 0..=7 => usize::from(c) + 1,
        8..=10 => 2,
        _ => return Err(invalid("invalid channel assignment")),
    };

    let subframes = (0..channels)
        .map(|c| {
            let side = matches!((channel_assignment, c), (8, 1) | (9, 0) | (10, 1));
            read_subframe(&mut r, bits_per_sample + u32::from(side), block_size)
        })
        .collect::<io::Result<Vec<_>>>()?;

    r.byte_align();
    r.skip(16)?;

    let channels = match (channel_assignment, subframes.as_slice()) {
        (8, [left, side]) => vec![
            left.clone(),
            left.iter().zip(side).map(|(l, s)| l - s).collect(),
        ],
        (9, [side, right]) => vec![
            side.iter().zip(right).map(|(s, r)| s + r).collect(),
            right.clone(),
        ],
        (10, [mid, side]) => {
            let (left, right): (Vec<i32>, Vec<i32>) = mid
                .iter()
                .zip(side)
                .map(|(m, s)| {
                    let mid = (m << 1) | (s & 1);
                    ((mid + s) >> 1, (mid - s) >> 1)
                })
                .unzip();
            vec![left, right]
        }
        _ => subframes.clone(),
    };

    let samples = (0..block_size)
        .flat_map(|i| channels.iter().map(move |c| c[i]))
        .collect();

    Ok(Frame {
        number,
        channel_assignment,
        block_size,
        size: 0,
        samples,
    })
}

fn read_frame_number<R: BitRead + ?Sized>(r: &mut R) -> io::Result<(u64, usize)> {
    match r.read_unary::<0>()? {
        0 => Ok((r.read::<7, u64>()?, 1)),
        bytes @ 2..=6 => {
            let mut number = r.read_var::<u64>(7 - bytes)?;
            for _ in 1..bytes {
                if r.read::<2, u8>()? != 0b10 {
                    return Err(invalid("invalid frame number"));
                }
                number = number << 6 | r.read::<6, u64>()?;
            }
            Ok((number, bytes as usize))
        }
        _ => Err(invalid("invalid frame number")),
    }
}

fn read_signed<R: BitRead + ?Sized>(r: &mut R, bits: u32) -> io::Result<i32> {
    match bits {
        0 => Ok(0),
        bits => {
            let value = r.read_var::<u32>(bits)?;
            Ok(((value << (32 - bits)) as i32) >> (32 - bits))
        }
    }
}

const FIXED_COEFFICIENTS: [&[i64]; 5] = [&[], &[1], &[2, -1], &[3, -3, 1], &[4, -6, 4, -1]];

fn read_subframe<R: BitRead + ?Sized>(
    r: &mut R,
    bits_per_sample: u32,
    block_size: usize,
) -> io::Result<Vec<i32>> {
    if r.read_bit()? {
        return Err(invalid("subframe padding bit set"));
    }
    let kind = r.read::<6, u32>()?;
    let wasted = match r.read_bit()? {
        true => r.read_unary::<1>()? + 1,
        false => 0,
    };
    let bits = bits_per_sample
        .checked_sub(wasted)
        .ok_or(invalid("excessive wasted bits"))?;

    let mut samples = match kind {
        0 => vec![read_signed(r, bits)?; block_size],
        1 => (0..block_size)
            .map(|_| read_signed(r, bits))
            .collect::<io::Result<Vec<_>>>()?,
        8..=12 => {
            let order = (kind - 8) as usize;
            let mut samples = (0..order)
                .map(|_| read_signed(r, bits))
                .collect::<io::Result<Vec<_>>>()?;
            let residuals = read_residuals(r, block_size, order)?;
            restore(&mut samples, &residuals, FIXED_COEFFICIENTS[order], 0);
            samples
        }
        32..=63 => {
            let order = (kind - 31) as usize;
            let mut samples = (0..order)
                .map(|_| read_signed(r, bits))
                .collect::<io::Result<Vec<_>>>()?;
            let precision = r.read::<4, u32>()? + 1;
            let shift = read_signed(r, 5)?;
            if shift < 0 {
                return Err(invalid("negative LPC shift"));
            }
            let coefficients = (0..order)
                .map(|_| read_signed(r, precision).map(i64::from))
                .collect::<io::Result<Vec<_>>>()?;
            let residuals = read_residuals(r, block_size, order)?;
            restore(&mut samples, &residuals, &coefficients, shift as u32);
            samples
        }
        _ => return Err(invalid("invalid subframe type")),
    };

    if wasted > 0 {
        samples.iter_mut().for_each(|s| *s <<= wasted);
    }
    Ok(samples)
}

fn restore(samples: &mut Vec<i32>, residuals: &[i32], coefficients: &[i64], shift: u32) {
    for residual in residuals {
        let i = samples.len();
        let prediction = coefficients
            .iter()
            .enumerate()
            .map(|(j, c)| c * i64::from(samples[i - j - 1]))
            .sum::<i64>()
            >> shift;
        samples.push((prediction + i64::from(*residual)) as i32);
    }
}

fn read_residuals<R: BitRead + ?Sized>(
    r: &mut R,
    block_size: usize,
    order: usize,
) -> io::Result<Vec<i32>> {
    let parameter_bits = match r.read::<2, u8>()? {
        0 => 4,
        1 => 5,
        _ => return Err(invalid("invalid residual coding method")),
    };
    let escape = (1 << parameter_bits) - 1;
    let partition_order = r.read::<4, u32>()?;
    let partitions = 1usize << partition_order;
    let partition_len = block_size >> partition_order;

    let mut residuals = Vec::with_capacity(block_size - order);
    for p in 0..partitions {
        let len = match p {
            0 => partition_len
                .checked_sub(order)
                .ok_or(invalid("partition shorter than predictor order"))?,
            _ => partition_len,
        };
        let parameter = r.read_var::<u32>(parameter_bits)?;
        if parameter == escape {
            let width = r.read::<5, u32>()?;
            for _ in 0..len {
                residuals.push(read_signed(r, width)?);
            }
        } else {
            for _ in 0..len {
                let msb = r.read_unary::<1>()?;
                let lsb = match parameter {
                    0 => 0,
                    p => r.read_var::<u32>(p)?,
                };
                let unsigned = (msb << parameter) | lsb;
                residuals.push(((unsigned >> 1) as i32) ^ -((unsigned & 1) as i32));
            }
        }
    }
    Ok(residuals)
}

/// MD5 of interleaved samples as little-endian,
/// sign-extended bytes
pub fn samples_md5(samples: &[i32], bits_per_sample: u32) -> [u8; 16] {
    let bytes = bits_per_sample.div_ceil(8) as usize;
    let raw = samples
        .iter()
        .flat_map(|s| s.to_le_bytes().into_iter().take(bytes))
        .collect::<Vec<u8>>();
    md5::compute(raw).0
}

/// Deterministic pseudo-random sample data,
/// a noisy sine sweep bounded by the given bits-per-sample
pub fn test_signal(channels: usize, frames: usize, bits_per_sample: u32, seed: u64) -> Vec<i32> {
    let mut rng = fastrand::Rng::with_seed(seed);
    let amplitude = f64::from((1 << (bits_per_sample - 1)) - 1) * 0.6;
    let noise = (1 << (bits_per_sample - 8)).max(1);
    (0..frames)
        .flat_map(|i| {
            let t = i as f64 / 44100.0;
            let tone = (t * (220.0 + t * 400.0) * std::f64::consts::TAU).sin() * amplitude;
            (0..channels)
                .map(|c| (tone * (1.0 - c as f64 * 0.1)) as i32 + rng.i32(-noise..noise))
                .collect::<Vec<_>>()
        })
        .collect()
}
