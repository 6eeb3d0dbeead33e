// Copyright 2025 Brian Langenberger
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A FLAC encoder which spreads frame encoding over a pool of
//! worker threads while writing frames in strict stream order
//!
//! Interleaved PCM samples are sliced into fixed-size blocks,
//! each block is encoded to a FLAC frame by one of the workers,
//! and a single collector hands finished frames to the output
//! sink in frame number order, no matter which worker
//! finished first.
//!
//! # Example
//! ```
//! use flac_pipeline::config::{EncoderOptions, EncodingPolicy, StreamParameters};
//! use flac_pipeline::encode::Encoder;
//! use flac_pipeline::sink::MemorySink;
//!
//! let sink = MemorySink::default();
//! let params = StreamParameters::new(2, 44100, 16, 4096);
//!
//! let mut encoder = Encoder::new(
//!     sink.clone(),
//!     params,
//!     EncodingPolicy::default(),
//!     EncoderOptions::default().threads(2),
//! ).unwrap();
//!
//! // 1 second of stereo silence
//! let samples = vec![0; 44100 * 2];
//! encoder.write_samples(&samples, 44100).unwrap();
//! let summary = encoder.finish().unwrap();
//!
//! assert_eq!(summary.total_samples, 44100);
//! assert!(sink.contents().starts_with(b"fLaC"));
//! ```

pub mod bitbuffer;
pub mod config;
pub mod crc;
pub mod encode;
pub mod finalize;
pub mod frame;
pub mod ingest;
pub mod metadata;
pub mod pipeline;
pub mod rice;
pub mod sink;
pub mod stream;
pub mod subframe;

/// A record describing why a stream stopped accepting work
///
/// Encode-consistency and I/O failures are sticky;
/// once one has been recorded, the stream refuses
/// any further encoding.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Diagnostic {
    /// Frame being handled when the failure occurred, if any
    pub frame_number: Option<u64>,
    /// Human-readable description of the failure
    pub message: String,
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.frame_number {
            Some(frame) => write!(f, "frame {frame}: {}", self.message),
            None => self.message.fmt(f),
        }
    }
}

/// A FLAC encoding error
#[derive(Debug)]
pub enum Error {
    /// An error from the underlying output sink
    Io(std::io::Error),
    /// Sample buffer holds fewer samples than indicated
    SampleBufferTooShort,
    /// More samples requested than are available to encode
    InsufficientSamples,
    /// A subframe's estimated size differs from its written size
    EstimateMismatch {
        /// Size predicted by the estimator, in bits
        estimated: u64,
        /// Size actually written, in bits
        written: u64,
    },
    /// A frame encoded a different number of samples than requested
    SampleCountMismatch {
        /// Samples requested
        requested: usize,
        /// Samples encoded
        encoded: usize,
    },
    /// A residual value does not fit in a signed 32-bit integer
    ResidualOverflow,
    /// Frame number exceeds the 31 bits allowed for fixed-size blocks
    ExcessiveFrameNumber,
    /// Total sample count exceeds the 36 bits of STREAMINFO
    ExcessiveTotalSamples,
    /// Frame size exceeds the 24 bits of STREAMINFO
    ExcessiveFrameSize,
    /// STREAMINFO missing or not the stream's first metadata block
    MissingStreaminfo,
    /// Metadata block too large for its 24-bit size field
    ExcessiveBlockSize,
    /// The stream was halted by an earlier failure
    StreamHalted(Diagnostic),
    /// The encoding pipeline's queues were disconnected
    PipelineClosed,
    /// The stream was finished without any samples
    NoSamples,
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error)
    }
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Io(e) => e.fmt(f),
            Self::SampleBufferTooShort => "sample buffer shorter than sample count".fmt(f),
            Self::InsufficientSamples => "insufficient samples available to encode".fmt(f),
            Self::EstimateMismatch { estimated, written } => write!(
                f,
                "subframe size estimate of {estimated} bits differs from {written} bits written"
            ),
            Self::SampleCountMismatch { requested, encoded } => write!(
                f,
                "{encoded} samples encoded but {requested} samples requested"
            ),
            Self::ResidualOverflow => "residual too large for 32 bits".fmt(f),
            Self::ExcessiveFrameNumber => "frame number too large".fmt(f),
            Self::ExcessiveTotalSamples => "total samples too large".fmt(f),
            Self::ExcessiveFrameSize => "frame size too large".fmt(f),
            Self::MissingStreaminfo => "STREAMINFO block not first in stream".fmt(f),
            Self::ExcessiveBlockSize => "metadata block too large".fmt(f),
            Self::StreamHalted(d) => write!(f, "stream halted by earlier failure ({d})"),
            Self::PipelineClosed => "encoding pipeline closed".fmt(f),
            Self::NoSamples => "no samples written to stream".fmt(f),
        }
    }
}

impl Error {
    /// Whether the error indicates an internal inconsistency
    /// rather than an external failure
    pub fn is_consistency_error(&self) -> bool {
        matches!(
            self,
            Self::EstimateMismatch { .. }
                | Self::SampleCountMismatch { .. }
                | Self::ResidualOverflow
        )
    }

    pub(crate) fn diagnostic(&self, frame_number: Option<u64>) -> Diagnostic {
        match self {
            Self::StreamHalted(d) => d.clone(),
            e => Diagnostic {
                frame_number,
                message: e.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_diagnostic() {
        let diagnostic = Error::MissingStreaminfo.diagnostic(Some(3));
        assert_eq!(diagnostic.frame_number, Some(3));
        assert_eq!(diagnostic.message, Error::MissingStreaminfo.to_string());

        // an existing diagnostic is passed along unchanged
        let halted = Error::StreamHalted(Error::ExcessiveBlockSize.diagnostic(None));
        assert_eq!(
            halted.diagnostic(Some(7)),
            Error::ExcessiveBlockSize.diagnostic(None)
        );
    }
}
