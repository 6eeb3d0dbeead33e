// Copyright 2025 Brian Langenberger
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! For encoding blocks of samples to complete FLAC frames
//!
//! A frame is its header and CRC-8,
//! one subframe per channel,
//! zero padding to a byte boundary,
//! and a CRC-16 over everything before it.

use crate::Error;
use crate::bitbuffer::BitBuffer;
use crate::config::{ChannelMode, EncodingPolicy, StreamParameters};
use crate::crc::{Checksum, Crc16};
use crate::stream::{ChannelAssignment, FrameHeader, FrameNumber};
use crate::subframe::SubframeEncoder;
use arrayvec::ArrayVec;
use log::trace;

/// Encodes blocks of interleaved samples to FLAC frames
///
/// Each worker owns one of these outright,
/// along with all of its scratch space.
pub struct FrameEncoder {
    params: StreamParameters,
    policy: EncodingPolicy,
    subframes: SubframeEncoder,
    crc: Crc16,
    header: Vec<u8>,
    channels: Vec<Vec<i32>>,
    mid: Vec<i32>,
    side: Vec<i32>,
    candidates: [BitBuffer; 3],
    assignment: Option<ChannelAssignment>,
}

/// Channel slices and widths for one channel assignment
struct Decorrelated<'s> {
    channels: ArrayVec<(&'s [i32], u32), 8>,
}

impl FrameEncoder {
    /// Creates encoder for a stream's parameters and initial policy
    pub fn new(params: StreamParameters, policy: EncodingPolicy) -> Self {
        Self {
            params,
            policy: policy.for_channels(params.channels()),
            subframes: SubframeEncoder::default(),
            crc: Crc16::default(),
            header: Vec::with_capacity(16),
            channels: vec![Vec::new(); params.channels().into()],
            mid: Vec::new(),
            side: Vec::new(),
            candidates: Default::default(),
            assignment: None,
        }
    }

    /// Installs new policy snapshot, used from the next frame on
    pub fn set_policy(&mut self, policy: EncodingPolicy) {
        self.policy = policy.for_channels(self.params.channels());
    }

    /// The encoder's current policy
    pub fn policy(&self) -> &EncodingPolicy {
        &self.policy
    }

    /// Channel assignment of the most recently encoded frame
    pub fn channel_assignment(&self) -> Option<ChannelAssignment> {
        self.assignment
    }

    /// Encodes `count` inter-channel samples from `samples`
    /// as a complete frame, replacing the contents of `out`
    ///
    /// Returns the number of inter-channel samples encoded.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SampleBufferTooShort`] if `samples` holds fewer
    /// than `count` samples per channel,
    /// [`Error::InsufficientSamples`] if `count` is 0 or larger
    /// than a frame can hold,
    /// or [`Error::EstimateMismatch`] if a subframe's
    /// size was mis-estimated.
    pub fn encode(
        &mut self,
        samples: &[i32],
        count: usize,
        frame_number: FrameNumber,
        out: &mut BitBuffer,
    ) -> Result<usize, Error> {
        let channel_count = usize::from(self.params.channels());
        let block_size = u16::try_from(count)
            .ok()
            .filter(|c| *c > 0)
            .ok_or(Error::InsufficientSamples)?;
        if samples.len() < count * channel_count {
            return Err(Error::SampleBufferTooShort);
        }

        for (c, channel) in self.channels.iter_mut().enumerate() {
            channel.clear();
            channel.extend(
                samples[0..count * channel_count]
                    .iter()
                    .skip(c)
                    .step_by(channel_count),
            );
        }

        let assignment = match self.policy.channel_mode() {
            _ if channel_count != 2 => ChannelAssignment::Independent(self.params.channels()),
            ChannelMode::Independent => ChannelAssignment::Independent(2),
            ChannelMode::LeftSide => ChannelAssignment::LeftSide,
            ChannelMode::RightSide => ChannelAssignment::SideRight,
            ChannelMode::MidSide => ChannelAssignment::MidSide,
            ChannelMode::EncoderChoice => {
                self.decorrelate();
                self.encoder_choice()
            }
            ChannelMode::Exhaustive => {
                self.decorrelate();
                self.exhaustive()?
            }
        };

        out.clear();
        self.header.clear();
        FrameHeader {
            frame_number,
            block_size,
            sample_rate: self.params.sample_rate(),
            channel_assignment: assignment,
            bits_per_sample: self.params.bits_per_sample(),
        }
        .write_to(&mut self.header)?;
        out.push_bytes(&self.header);

        match self.policy.channel_mode() {
            ChannelMode::Exhaustive if channel_count == 2 => {
                // trial encodings already hold the winner's subframes
                let index = match assignment {
                    ChannelAssignment::LeftSide => 1,
                    ChannelAssignment::MidSide => 2,
                    _ => 0,
                };
                out.link(std::mem::take(&mut self.candidates[index]));
            }
            _ => {
                if assignment.side_channel().is_some() && self.side.len() != count {
                    self.decorrelate();
                }
                let channels = Self::layout(
                    &self.channels,
                    &self.mid,
                    &self.side,
                    assignment,
                    self.params.bits_per_sample(),
                );
                Self::encode_subframes(&mut self.subframes, &self.policy, &channels, out)?;
            }
        }

        out.pad_to_byte();
        self.crc.reset();
        self.crc.update_buffer(out);
        out.push_bits(self.crc.checksum().into(), 16);

        trace!(
            "frame {frame_number}: {assignment:?}, {} bytes",
            out.total_bits() / 8
        );
        self.assignment = Some(assignment);
        // stale side/mid data must not be mistaken for the next block's
        self.side.clear();
        self.mid.clear();

        Ok(count)
    }

    /// Builds side and mid channels from the left and right channels
    fn decorrelate(&mut self) {
        let (left, right) = (&self.channels[0], &self.channels[1]);
        self.side.clear();
        self.side
            .extend(left.iter().zip(right).map(|(l, r)| l - r));
        self.mid.clear();
        self.mid
            .extend(left.iter().zip(right).map(|(l, r)| (l + r) >> 1));
    }

    /// Channel slices, and the width of each, for an assignment
    fn layout<'s>(
        channels: &'s [Vec<i32>],
        mid: &'s [i32],
        side: &'s [i32],
        assignment: ChannelAssignment,
        bits_per_sample: u32,
    ) -> Decorrelated<'s> {
        let channels = match assignment {
            ChannelAssignment::Independent(_) => channels
                .iter()
                .map(|c| (c.as_slice(), bits_per_sample))
                .collect(),
            ChannelAssignment::LeftSide => [
                (channels[0].as_slice(), bits_per_sample),
                (side, bits_per_sample + 1),
            ]
            .into_iter()
            .collect(),
            ChannelAssignment::SideRight => [
                (side, bits_per_sample + 1),
                (channels[1].as_slice(), bits_per_sample),
            ]
            .into_iter()
            .collect(),
            ChannelAssignment::MidSide => [
                (mid, bits_per_sample),
                (side, bits_per_sample + 1),
            ]
            .into_iter()
            .collect(),
        };
        Decorrelated { channels }
    }

    fn encode_subframes(
        subframes: &mut SubframeEncoder,
        policy: &EncodingPolicy,
        channels: &Decorrelated<'_>,
        out: &mut BitBuffer,
    ) -> Result<(), Error> {
        channels
            .channels
            .iter()
            .try_for_each(|(samples, bits_per_sample)| {
                subframes
                    .encode(out, samples, *bits_per_sample, policy)
                    .map(|_| ())
            })
    }

    /// Picks channel assignment from average channel magnitudes
    fn encoder_choice(&self) -> ChannelAssignment {
        fn mean_magnitude(samples: &[i32]) -> u64 {
            samples.iter().map(|s| u64::from(s.unsigned_abs())).sum::<u64>()
                / samples.len().max(1) as u64
        }

        let left = mean_magnitude(&self.channels[0]);
        let right = mean_magnitude(&self.channels[1]);
        let mid = mean_magnitude(&self.mid);
        let side = mean_magnitude(&self.side);

        // first of the smallest wins
        [
            (left + right, ChannelAssignment::Independent(2)),
            (mid + side, ChannelAssignment::MidSide),
            (left + side, ChannelAssignment::LeftSide),
            (right + side, ChannelAssignment::SideRight),
        ]
        .into_iter()
        .min_by_key(|(cost, _)| *cost)
        .map(|(_, assignment)| assignment)
        .unwrap_or(ChannelAssignment::Independent(2))
    }

    /// Encodes independent, left-side and mid-side subframes
    /// into the candidate buffers and picks the smallest
    fn exhaustive(&mut self) -> Result<ChannelAssignment, Error> {
        const CANDIDATES: [ChannelAssignment; 3] = [
            ChannelAssignment::Independent(2),
            ChannelAssignment::LeftSide,
            ChannelAssignment::MidSide,
        ];

        let mut bits = [0; 3];
        for ((assignment, candidate), bits) in
            CANDIDATES.iter().zip(&mut self.candidates).zip(&mut bits)
        {
            candidate.clear();
            let channels = Self::layout(
                &self.channels,
                &self.mid,
                &self.side,
                *assignment,
                self.params.bits_per_sample(),
            );
            Self::encode_subframes(&mut self.subframes, &self.policy, &channels, candidate)?;
            *bits = candidate.total_bits();
        }

        let [independent, left, mid] = bits;
        Ok(if left <= independent && left <= mid {
            ChannelAssignment::LeftSide
        } else if mid <= independent {
            ChannelAssignment::MidSide
        } else {
            ChannelAssignment::Independent(2)
        })
    }
}
