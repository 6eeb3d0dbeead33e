// Copyright 2025 Brian Langenberger
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! For writing a stream's metadata, its frames,
//! and its final STREAMINFO

use crate::Error;
use crate::bitbuffer::BitBuffer;
use crate::config::StreamParameters;
use crate::metadata::{Block, Padding, Streaminfo, write_blocks};
use crate::pipeline::{BlockEncodeRequest, Dispatch};
use crate::sink::OutputSink;
use bitstream_io::{BitWrite, BitWriter, LittleEndian};
use log::{debug, trace, warn};

/// Running statistics of the frames written so far
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StreamStatistics {
    frames: u64,
    total_samples: u64,
    minimum_frame_size: Option<u32>,
    maximum_frame_size: Option<u32>,
    minimum_block_size: Option<u16>,
    maximum_block_size: Option<u16>,
    // the most recent block, which may turn out to be the last
    latest_block_size: Option<u16>,
}

impl StreamStatistics {
    /// Records one written frame
    ///
    /// # Errors
    ///
    /// Returns [`Error::ExcessiveFrameSize`] if the frame is too large
    /// for STREAMINFO, or [`Error::ExcessiveTotalSamples`] if the
    /// stream has grown too long.
    pub fn record(&mut self, frame_size: usize, block_size: u16) -> Result<(), Error> {
        let frame_size = u32::try_from(frame_size)
            .ok()
            .filter(|size| *size <= Streaminfo::MAX_FRAME_SIZE)
            .ok_or(Error::ExcessiveFrameSize)?;

        self.total_samples = self
            .total_samples
            .checked_add(block_size.into())
            .filter(|total| *total <= Streaminfo::MAX_TOTAL_SAMPLES)
            .ok_or(Error::ExcessiveTotalSamples)?;
        self.frames += 1;

        self.minimum_frame_size =
            Some(self.minimum_frame_size.map_or(frame_size, |s| s.min(frame_size)));
        self.maximum_frame_size =
            Some(self.maximum_frame_size.map_or(frame_size, |s| s.max(frame_size)));

        if let Some(previous) = self.latest_block_size.replace(block_size) {
            self.minimum_block_size =
                Some(self.minimum_block_size.map_or(previous, |s| s.min(previous)));
            self.maximum_block_size =
                Some(self.maximum_block_size.map_or(previous, |s| s.max(previous)));
        }

        Ok(())
    }

    /// Number of frames written
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Number of inter-channel samples written
    pub fn total_samples(&self) -> u64 {
        self.total_samples
    }

    /// Smallest and largest frame sizes, in bytes
    pub fn frame_sizes(&self) -> Option<(u32, u32)> {
        self.minimum_frame_size.zip(self.maximum_frame_size)
    }

    /// Smallest and largest block sizes, in samples
    ///
    /// The final block is left out, since it may be short,
    /// unless it is the only one.
    pub fn block_sizes(&self) -> Option<(u16, u16)> {
        self.minimum_block_size
            .zip(self.maximum_block_size)
            .or(self.latest_block_size.map(|s| (s, s)))
    }
}

/// The final state of a finished stream
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StreamSummary {
    /// Inter-channel samples encoded
    pub total_samples: u64,
    /// Frames written
    pub frames: u64,
    /// Smallest frame, in bytes
    pub minimum_frame_size: u32,
    /// Largest frame, in bytes
    pub maximum_frame_size: u32,
    /// Smallest block, in samples
    pub minimum_block_size: u16,
    /// Largest block, in samples
    pub maximum_block_size: u16,
    /// MD5 of the unencoded samples
    pub md5: [u8; 16],
    /// Whether the STREAMINFO written at open
    /// was overwritten with these values
    pub patched: bool,
}

/// Writes the stream marker and metadata at open,
/// frames as they are dispatched,
/// and the final STREAMINFO at close
pub struct StreamFinalizer<S> {
    sink: S,
    params: StreamParameters,
    padding: Option<Padding>,
    header_offset: u64,
    statistics: StreamStatistics,
    md5: BitWriter<md5::Context, LittleEndian>,
    bytes: Vec<u8>,
}

impl<S: OutputSink> StreamFinalizer<S> {
    /// Writes "fLaC" marker, placeholder STREAMINFO
    /// and optional PADDING to sink at its current position
    ///
    /// # Errors
    ///
    /// Passes along any I/O error from the sink.
    pub fn open(
        mut sink: S,
        params: StreamParameters,
        padding: Option<u32>,
    ) -> Result<Self, Error> {
        let header_offset = sink.position();
        let padding = padding.map(|size| Padding { size });

        let placeholder = Streaminfo {
            minimum_block_size: params.block_size(),
            maximum_block_size: params.block_size(),
            minimum_frame_size: 0,
            maximum_frame_size: 0,
            sample_rate: params.sample_rate(),
            channels: params.channels(),
            bits_per_sample: params.bits_per_sample(),
            total_samples: 0,
            md5: [0; 16],
        };

        let mut header = Vec::new();
        write_metadata(placeholder, padding.clone(), &mut header)?;
        sink.write(&header)?;

        debug!(
            "stream opened at byte {header_offset}, {} header bytes",
            header.len()
        );

        Ok(Self {
            sink,
            params,
            padding,
            header_offset,
            statistics: StreamStatistics::default(),
            md5: BitWriter::new(md5::Context::new()),
            bytes: Vec::new(),
        })
    }

    /// Writes encoded frame to sink in one piece,
    /// and updates statistics from the `encoded` interleaved
    /// samples it holds
    ///
    /// # Errors
    ///
    /// Passes along any I/O error from the sink,
    /// or returns an error if STREAMINFO cannot hold the new totals.
    pub fn write_frame(
        &mut self,
        frame: &BitBuffer,
        samples: &[i32],
        encoded: usize,
    ) -> Result<(), Error> {
        let block_size = u16::try_from(encoded).map_err(|_| Error::InsufficientSamples)?;
        let samples = samples
            .get(0..encoded * usize::from(self.params.channels()))
            .ok_or(Error::SampleBufferTooShort)?;

        self.bytes.clear();
        frame.write_bytes(&mut self.bytes);
        self.sink.write(&self.bytes)?;
        self.statistics.record(self.bytes.len(), block_size)?;

        let bits = self.params.bytes_per_sample() as u32 * 8;
        samples
            .iter()
            .try_for_each(|s| self.md5.write_signed_var(bits, *s))?;

        Ok(())
    }

    /// Statistics of the frames written so far
    pub fn statistics(&self) -> &StreamStatistics {
        &self.statistics
    }

    /// The sink being written to
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Returns the sink being written to
    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Completes the stream's STREAMINFO and,
    /// if the sink can seek, writes it over the placeholder
    ///
    /// The sink is left positioned at the end of the stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSamples`] if no frames were written,
    /// or passes along any I/O error from the sink.
    pub fn finish(&mut self) -> Result<StreamSummary, Error> {
        let ((minimum_block_size, maximum_block_size), (minimum_frame_size, maximum_frame_size)) =
            self.statistics
                .block_sizes()
                .zip(self.statistics.frame_sizes())
                .ok_or(Error::NoSamples)?;

        let md5 = self.md5.aligned_writer()?.clone().compute().0;

        let streaminfo = Streaminfo {
            minimum_block_size,
            maximum_block_size,
            minimum_frame_size,
            maximum_frame_size,
            sample_rate: self.params.sample_rate(),
            channels: self.params.channels(),
            bits_per_sample: self.params.bits_per_sample(),
            total_samples: self.statistics.total_samples(),
            md5,
        };

        let patched = if self.sink.can_seek() {
            let mut header = Vec::new();
            write_metadata(streaminfo, self.padding.clone(), &mut header)?;

            let end = self.sink.position();
            self.sink.seek(self.header_offset)?;
            self.sink.write(&header)?;
            self.sink.seek(end)?;
            true
        } else {
            warn!("sink cannot seek, STREAMINFO left as written at open");
            false
        };

        debug!(
            "stream closed: {} frames, {} samples",
            self.statistics.frames(),
            self.statistics.total_samples()
        );

        Ok(StreamSummary {
            total_samples: self.statistics.total_samples(),
            frames: self.statistics.frames(),
            minimum_frame_size,
            maximum_frame_size,
            minimum_block_size,
            maximum_block_size,
            md5,
            patched,
        })
    }
}

impl<S: OutputSink> Dispatch for StreamFinalizer<S> {
    fn dispatch(&mut self, request: &BlockEncodeRequest) -> Result<(), Error> {
        if request.encoded_samples() != request.count() {
            return Err(Error::SampleCountMismatch {
                requested: request.count(),
                encoded: request.encoded_samples(),
            });
        }

        self.write_frame(
            request.result(),
            request.samples(),
            request.encoded_samples(),
        )?;

        trace!(
            "frame {} written, {} samples",
            request.frame_number(),
            request.encoded_samples()
        );
        Ok(())
    }
}

fn write_metadata(
    streaminfo: Streaminfo,
    padding: Option<Padding>,
    bytes: &mut Vec<u8>,
) -> Result<(), Error> {
    let blocks = std::iter::once(Block::from(streaminfo))
        .chain(padding.map(Block::from))
        .collect::<Vec<_>>();
    write_blocks(&blocks, bytes)
}
