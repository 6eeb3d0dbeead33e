// Copyright 2025 Brian Langenberger
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Per-channel subframe encoding
//!
//! A subframe begins with a zero bit, a 6-bit type
//! and a wasted-bits flag, optionally followed by
//! a unary count of wasted bits:
//!
//! | Type       | Subframe              |
//! |-----------:|-----------------------|
//! | `000000`   | constant              |
//! | `000001`   | verbatim              |
//! | `001xxx`   | fixed, order `xxx`    |
//! | `1xxxxx`   | LPC, order `xxxxx + 1`|

pub mod fixed;
pub mod lpc;

use crate::Error;
use crate::bitbuffer::BitBuffer;
use crate::config::{EncodingPolicy, SubframeMode};
use fixed::FixedEncoder;
use log::trace;
use lpc::LpcEncoder;

/// The coding chosen for one channel of a frame
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Subframe {
    /// Every sample has the same value
    Constant,
    /// Samples stored uncompressed
    Verbatim,
    /// Fixed polynomial predictor
    Fixed {
        /// Predictor order, 0 to 4
        order: u8,
    },
    /// Quantized linear predictor
    Lpc {
        /// Predictor order, 1 to 32
        order: u8,
        /// Coefficient precision, in bits
        precision: u8,
        /// Coefficient shift
        shift: u8,
    },
}

/// Number of trailing zero bits shared by every sample
///
/// Returns 0 for an all-zero block.
pub(crate) fn wasted_bits(samples: &[i32]) -> u32 {
    match samples.iter().fold(0, |acc, s| acc | s) {
        0 => 0,
        bits => bits.trailing_zeros(),
    }
}

/// Whether every sample in a non-empty block is the same
pub(crate) fn is_constant(samples: &[i32]) -> bool {
    match samples.split_first() {
        Some((first, rest)) => rest.iter().all(|s| s == first),
        None => false,
    }
}

/// Size of a subframe header with the given wasted bits
#[inline]
pub(crate) fn header_bits(wasted: u32) -> u64 {
    8 + u64::from(wasted)
}

/// Writes subframe header with the given 6-bit type code
pub(crate) fn write_header(buf: &mut BitBuffer, type_code: u32, wasted: u32) {
    buf.push_bits(u64::from(type_code & 0b111111), 7);
    match wasted {
        0 => buf.push_bit(false),
        wasted => {
            buf.push_bit(true);
            buf.push_zeros(u64::from(wasted - 1));
            buf.push_bit(true);
        }
    }
}

/// Writes constant subframe
pub fn write_constant(buf: &mut BitBuffer, value: i32, bits_per_sample: u32) {
    write_header(buf, 0b000000, 0);
    buf.push_signed(value.into(), bits_per_sample);
}

/// Size of constant subframe, in bits
pub fn constant_bits(bits_per_sample: u32) -> u64 {
    header_bits(0) + u64::from(bits_per_sample)
}

/// Writes verbatim subframe of samples with
/// `wasted` bits already shifted out
pub fn write_verbatim(buf: &mut BitBuffer, samples: &[i32], bits_per_sample: u32, wasted: u32) {
    write_header(buf, 0b000001, wasted);
    samples
        .iter()
        .for_each(|s| buf.push_signed((*s).into(), bits_per_sample));
}

/// Size of verbatim subframe, in bits
pub fn verbatim_bits(len: usize, bits_per_sample: u32, wasted: u32) -> u64 {
    header_bits(wasted) + len as u64 * u64::from(bits_per_sample)
}

/// Chooses and writes subframes
///
/// Holds the reusable state of each strategy
/// so that encoding successive frames doesn't reallocate.
#[derive(Default)]
pub struct SubframeEncoder {
    shifted: Vec<i32>,
    fixed: FixedEncoder,
    lpc: LpcEncoder,
}

#[derive(Copy, Clone)]
enum Choice {
    Verbatim(u64),
    Fixed(u64),
    Lpc(u64),
}

impl SubframeEncoder {
    /// Encodes one channel's samples to the end of `buf`
    /// according to the policy's subframe mode
    ///
    /// `bits_per_sample` is the channel's sample width,
    /// which is one more than the stream's for side channels.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EstimateMismatch`] if the size of the
    /// written subframe differs from the size it was chosen by.
    pub fn encode(
        &mut self,
        buf: &mut BitBuffer,
        samples: &[i32],
        bits_per_sample: u32,
        policy: &EncodingPolicy,
    ) -> Result<Subframe, Error> {
        let mode = policy.subframe_mode();

        if matches!(mode, SubframeMode::Constant | SubframeMode::Exhaustive)
            && is_constant(samples)
        {
            write_constant(buf, samples[0], bits_per_sample);
            return Ok(Subframe::Constant);
        }

        let wasted = wasted_bits(samples);
        let bits_per_sample = bits_per_sample - wasted;
        self.shifted.clear();
        self.shifted.extend(samples.iter().map(|s| s >> wasted));
        let samples = self.shifted.as_slice();
        let (min_partition, max_partition) = policy.partition_orders();

        let verbatim = || Choice::Verbatim(verbatim_bits(samples.len(), bits_per_sample, wasted));

        let choice = match mode {
            SubframeMode::Constant | SubframeMode::Verbatim => verbatim(),
            SubframeMode::Fixed => Choice::Fixed(self.fixed.estimate(
                samples,
                bits_per_sample,
                wasted,
                min_partition,
                max_partition,
            )?),
            SubframeMode::Lpc => match self.lpc.estimate(samples, bits_per_sample, wasted, policy) {
                Some(bits) => Choice::Lpc(bits),
                None => Choice::Fixed(self.fixed.estimate(
                    samples,
                    bits_per_sample,
                    wasted,
                    min_partition,
                    max_partition,
                )?),
            },
            SubframeMode::Exhaustive => {
                let fixed = self.fixed.estimate(
                    samples,
                    bits_per_sample,
                    wasted,
                    min_partition,
                    max_partition,
                )?;
                let best = match self.lpc.estimate(samples, bits_per_sample, wasted, policy) {
                    Some(lpc) if lpc < fixed => Choice::Lpc(lpc),
                    _ => Choice::Fixed(fixed),
                };
                match (best, verbatim()) {
                    (Choice::Fixed(b) | Choice::Lpc(b), v @ Choice::Verbatim(vb)) if vb < b => v,
                    (best, _) => best,
                }
            }
        };

        let start = buf.total_bits();
        let (estimated, subframe) = match choice {
            Choice::Verbatim(bits) => {
                write_verbatim(buf, samples, bits_per_sample, wasted);
                (bits, Subframe::Verbatim)
            }
            Choice::Fixed(bits) => {
                self.fixed.write(buf, samples, bits_per_sample, wasted);
                (bits, self.fixed.subframe())
            }
            Choice::Lpc(bits) => {
                self.lpc.write(buf, samples, bits_per_sample, wasted);
                (bits, self.lpc.subframe())
            }
        };

        match buf.total_bits() - start {
            written if written == estimated => {
                trace!("{subframe:?} subframe, {written} bits");
                Ok(subframe)
            }
            written => Err(Error::EstimateMismatch { estimated, written }),
        }
    }
}
