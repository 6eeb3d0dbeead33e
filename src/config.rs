// Copyright 2025 Brian Langenberger
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Stream parameters, encoding policy and encoder options
//!
//! Out-of-range values are never rejected.
//! They are clamped to the nearest legal bound
//! and the clamping is reported as a `false` validity result.

use log::warn;
use std::time::Duration;

/// Clamps value to the given bounds, logging a warning if it was out of range
fn clamp_logged<T: Copy + Ord + std::fmt::Display>(name: &str, value: T, min: T, max: T) -> (T, bool) {
    let clamped = value.clamp(min, max);
    if clamped != value {
        warn!("{name} {value} out of range, using {clamped}");
        (clamped, false)
    } else {
        (value, true)
    }
}

/// Fixed parameters of one stream
///
/// These are validated once, when the stream is opened,
/// and cannot change while it is being encoded.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct StreamParameters {
    channels: u8,
    sample_rate: u32,
    bits_per_sample: u32,
    block_size: u16,
    valid: bool,
}

impl StreamParameters {
    /// Minimum number of channels
    pub const MIN_CHANNELS: u8 = 1;
    /// Maximum number of channels
    pub const MAX_CHANNELS: u8 = 8;
    /// Minimum sample rate, in Hz
    pub const MIN_SAMPLE_RATE: u32 = 1;
    /// Maximum sample rate, in Hz
    pub const MAX_SAMPLE_RATE: u32 = 655_350;
    /// Minimum bits per sample
    pub const MIN_BITS_PER_SAMPLE: u32 = 4;
    /// Maximum bits per sample
    pub const MAX_BITS_PER_SAMPLE: u32 = 24;
    /// Minimum block size, in inter-channel samples
    pub const MIN_BLOCK_SIZE: u16 = 16;
    /// Maximum block size, in inter-channel samples
    pub const MAX_BLOCK_SIZE: u16 = 65_535;

    /// Builds new set of stream parameters,
    /// clamping any out-of-range value
    ///
    /// Whether every value was in range is
    /// available from [`StreamParameters::is_valid`].
    pub fn new(channels: u8, sample_rate: u32, bits_per_sample: u32, block_size: u16) -> Self {
        let (channels, c) =
            clamp_logged("channel count", channels, Self::MIN_CHANNELS, Self::MAX_CHANNELS);
        let (sample_rate, r) = clamp_logged(
            "sample rate",
            sample_rate,
            Self::MIN_SAMPLE_RATE,
            Self::MAX_SAMPLE_RATE,
        );
        let (bits_per_sample, b) = clamp_logged(
            "bits per sample",
            bits_per_sample,
            Self::MIN_BITS_PER_SAMPLE,
            Self::MAX_BITS_PER_SAMPLE,
        );
        let (block_size, s) = clamp_logged(
            "block size",
            block_size,
            Self::MIN_BLOCK_SIZE,
            Self::MAX_BLOCK_SIZE,
        );

        Self {
            channels,
            sample_rate,
            bits_per_sample,
            block_size,
            valid: c && r && b && s,
        }
    }

    /// Whether all values given at construction were in range
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Number of channels
    pub fn channels(&self) -> u8 {
        self.channels
    }

    /// Sample rate, in Hz
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Bits per sample
    pub fn bits_per_sample(&self) -> u32 {
        self.bits_per_sample
    }

    /// Bytes each sample occupies when byte-aligned
    pub fn bytes_per_sample(&self) -> usize {
        self.bits_per_sample.div_ceil(8) as usize
    }

    /// Block size, in inter-channel samples
    pub fn block_size(&self) -> u16 {
        self.block_size
    }

    /// Number of interleaved samples in a full block
    pub fn block_len(&self) -> usize {
        usize::from(self.block_size) * usize::from(self.channels)
    }
}

/// How each channel's subframe type is chosen
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum SubframeMode {
    /// Constant subframe if the block is constant, verbatim otherwise
    Constant,
    /// Fixed predictor only
    Fixed,
    /// Linear predictor, falling back to fixed if no LPC order applies
    Lpc,
    /// Uncompressed samples only
    Verbatim,
    /// Constant if possible, otherwise the smallest
    /// of fixed and LPC by estimated size
    #[default]
    Exhaustive,
}

/// How stereo channels are decorrelated
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum ChannelMode {
    /// Channels coded independently
    Independent,
    /// Left and side channels
    LeftSide,
    /// Side and right channels
    RightSide,
    /// Mid and side channels
    MidSide,
    /// Fully encode independent, left-side and mid-side
    /// and keep the smallest
    Exhaustive,
    /// Pick a mode from average channel magnitudes
    /// without trial encoding
    #[default]
    EncoderChoice,
}

impl ChannelMode {
    /// Whether mode requires exactly two channels
    pub fn is_stereo_only(self) -> bool {
        !matches!(self, Self::Independent)
    }
}

/// How frames are to be encoded
///
/// A policy may be replaced between frames but never
/// changes during one; each frame encoder works from
/// its own copy.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct EncodingPolicy {
    subframe_mode: SubframeMode,
    channel_mode: ChannelMode,
    min_lpc_order: u32,
    max_lpc_order: u32,
    min_partition_order: u32,
    max_partition_order: u32,
}

impl Default for EncodingPolicy {
    fn default() -> Self {
        Self {
            subframe_mode: SubframeMode::default(),
            channel_mode: ChannelMode::default(),
            min_lpc_order: 1,
            max_lpc_order: 12,
            min_partition_order: 0,
            max_partition_order: 0,
        }
    }
}

impl EncodingPolicy {
    /// Minimum LPC order
    pub const MIN_LPC_ORDER: u32 = 1;
    /// Maximum LPC order
    pub const MAX_LPC_ORDER: u32 = 32;
    /// Maximum Rice partition order
    pub const MAX_PARTITION_ORDER: u32 = crate::rice::MAX_PARTITION_ORDER;

    /// Subframe selection mode
    pub fn subframe_mode(&self) -> SubframeMode {
        self.subframe_mode
    }

    /// Channel decorrelation mode
    pub fn channel_mode(&self) -> ChannelMode {
        self.channel_mode
    }

    /// Minimum and maximum LPC orders to search
    pub fn lpc_orders(&self) -> (u32, u32) {
        (self.min_lpc_order, self.max_lpc_order)
    }

    /// Minimum and maximum Rice partition orders to search
    pub fn partition_orders(&self) -> (u32, u32) {
        (self.min_partition_order, self.max_partition_order)
    }

    /// Sets subframe selection mode
    pub fn set_subframe_mode(&mut self, mode: SubframeMode) {
        self.subframe_mode = mode;
    }

    /// Sets channel decorrelation mode
    pub fn set_channel_mode(&mut self, mode: ChannelMode) {
        self.channel_mode = mode;
    }

    /// Sets the range of LPC orders to search
    ///
    /// Orders are clamped to 1 through 32 and swapped if reversed.
    /// Returns `false` if any adjustment was needed.
    pub fn set_lpc_orders(&mut self, min: u32, max: u32) -> bool {
        let (min, min_ok) = clamp_logged("LPC order", min, Self::MIN_LPC_ORDER, Self::MAX_LPC_ORDER);
        let (max, max_ok) = clamp_logged("LPC order", max, Self::MIN_LPC_ORDER, Self::MAX_LPC_ORDER);
        self.min_lpc_order = min.min(max);
        self.max_lpc_order = min.max(max);
        min_ok && max_ok && min <= max
    }

    /// Sets the range of Rice partition orders to search
    ///
    /// Orders are clamped to 0 through 15 and swapped if reversed.
    /// Returns `false` if any adjustment was needed.
    pub fn set_partition_orders(&mut self, min: u32, max: u32) -> bool {
        let (min, min_ok) =
            clamp_logged("partition order", min, 0, Self::MAX_PARTITION_ORDER);
        let (max, max_ok) =
            clamp_logged("partition order", max, 0, Self::MAX_PARTITION_ORDER);
        self.min_partition_order = min.min(max);
        self.max_partition_order = min.max(max);
        min_ok && max_ok && min <= max
    }

    /// Returns policy with the given subframe mode
    pub fn with_subframe_mode(self, subframe_mode: SubframeMode) -> Self {
        Self {
            subframe_mode,
            ..self
        }
    }

    /// Returns policy with the given channel mode
    pub fn with_channel_mode(self, channel_mode: ChannelMode) -> Self {
        Self {
            channel_mode,
            ..self
        }
    }

    /// Returns policy with the given LPC order range, clamped
    pub fn with_lpc_orders(mut self, min: u32, max: u32) -> Self {
        self.set_lpc_orders(min, max);
        self
    }

    /// Returns policy with the given partition order range, clamped
    pub fn with_partition_orders(mut self, min: u32, max: u32) -> Self {
        self.set_partition_orders(min, max);
        self
    }

    /// Returns policy usable by a stream with the given channel count
    ///
    /// Stereo decorrelation modes fall back to independent
    /// coding for anything other than two channels.
    pub(crate) fn for_channels(self, channels: u8) -> Self {
        if channels != 2 && self.channel_mode.is_stereo_only() {
            Self {
                channel_mode: ChannelMode::Independent,
                ..self
            }
        } else {
            self
        }
    }
}

/// Encoder tuning options
#[derive(Copy, Clone, Debug)]
pub struct EncoderOptions {
    pub(crate) threads: usize,
    pub(crate) queue_limit: usize,
    pub(crate) idle_timeout: Duration,
    pub(crate) padding: Option<u32>,
    encode_delay: Option<fn(u64) -> Duration>,
    #[cfg(test)]
    pub(crate) short_frame: Option<u64>,
}

impl Default for EncoderOptions {
    fn default() -> Self {
        Self {
            threads: 0,
            queue_limit: 5,
            idle_timeout: Duration::from_millis(500),
            padding: None,
            encode_delay: None,
            #[cfg(test)]
            short_frame: None,
        }
    }
}

impl EncoderOptions {
    /// Sets number of worker threads
    ///
    /// With 0 threads, every frame is encoded on the
    /// calling thread.
    pub fn threads(self, threads: usize) -> Self {
        Self { threads, ..self }
    }

    /// Sets the number of submitted-but-unwritten frames
    /// above which the producer waits
    pub fn queue_limit(self, queue_limit: usize) -> Self {
        Self {
            queue_limit: queue_limit.max(1),
            ..self
        }
    }

    /// Sets how long idle workers wait for work before exiting
    pub fn idle_timeout(self, idle_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            ..self
        }
    }

    /// Adds a PADDING block of the given size after STREAMINFO
    pub fn padding(self, bytes: u32) -> Self {
        Self {
            padding: Some(bytes),
            ..self
        }
    }

    /// Sets a function giving an artificial delay
    /// for each frame number before it is encoded
    ///
    /// Used to exercise out-of-order completion.
    pub fn encode_delay(self, delay: fn(u64) -> Duration) -> Self {
        Self {
            encode_delay: Some(delay),
            ..self
        }
    }

    /// Has workers report one sample fewer than
    /// they encoded for the given frame
    #[cfg(test)]
    pub(crate) fn short_frame(self, frame_number: u64) -> Self {
        Self {
            short_frame: Some(frame_number),
            ..self
        }
    }

    pub(crate) fn delay_for(&self, frame_number: u64) -> Option<Duration> {
        self.encode_delay.map(|f| f(frame_number))
    }
}
