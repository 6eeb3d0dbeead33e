// Copyright 2025 Brian Langenberger
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! For encoding PCM samples to FLAC streams

use crate::config::{EncoderOptions, EncodingPolicy, StreamParameters};
use crate::finalize::{StreamFinalizer, StreamSummary};
use crate::frame::FrameEncoder;
use crate::ingest::{Block, BlockQueue, SamplePool};
use crate::pipeline::{BlockEncodeRequest, Dispatch, Pipeline};
use crate::sink::OutputSink;
use crate::stream::FrameNumber;
use crate::{Diagnostic, Error};
use log::{debug, error};
use std::sync::Arc;

/// Encodes frames on the calling thread
struct Inline<S> {
    encoder: FrameEncoder,
    finalizer: StreamFinalizer<S>,
    request: BlockEncodeRequest,
    next_frame: Option<FrameNumber>,
}

impl<S: OutputSink> Inline<S> {
    fn encode(
        &mut self,
        block: Block,
        policy: EncodingPolicy,
        pool: &SamplePool,
    ) -> Result<(), Error> {
        let frame_number = self.next_frame.ok_or(Error::ExcessiveFrameNumber)?;
        self.next_frame = {
            let mut next = frame_number;
            next.try_increment().ok().map(|()| next)
        };

        self.request.fill(block, frame_number, policy);
        self.request.encode(&mut self.encoder);
        let result = match self.request.take_failure() {
            Some(err) => Err(err),
            None => self.finalizer.dispatch(&self.request),
        };
        pool.give(self.request.take_samples());
        result
    }
}

enum Backend<S> {
    Inline(Box<Inline<S>>),
    Threaded(Pipeline<StreamFinalizer<S>>),
}

/// A FLAC encoder
///
/// Samples are added in any amount, sliced into blocks
/// of the stream's block size and each block is encoded
/// to a frame, either on the calling thread or on a pool
/// of worker threads.
/// Frames are always written in order.
///
/// # Example
/// ```
/// use flac_pipeline::config::{EncoderOptions, EncodingPolicy, StreamParameters};
/// use flac_pipeline::encode::Encoder;
/// use flac_pipeline::sink::MemorySink;
///
/// let sink = MemorySink::default();
/// let mut encoder = Encoder::new(
///     sink.clone(),
///     StreamParameters::new(1, 8000, 8, 16),
///     EncodingPolicy::default(),
///     EncoderOptions::default(),
/// ).unwrap();
///
/// encoder.add_samples(&[1, 2, 3, 4, 5], 5).unwrap();
/// assert_eq!(encoder.samples_available(), 5);
/// assert_eq!(encoder.full_block_samples_available(), 0);
///
/// // nothing to encode until a block fills, or the stream ends
/// assert_eq!(encoder.encode_samples(5, false).unwrap(), 0);
/// assert_eq!(encoder.encode_samples(5, true).unwrap(), 5);
///
/// let summary = encoder.finish().unwrap();
/// assert_eq!(summary.total_samples, 5);
/// assert_eq!(summary.frames, 1);
/// ```
pub struct Encoder<S: OutputSink + 'static> {
    params: StreamParameters,
    policy: EncodingPolicy,
    queue_limit: usize,
    blocks: BlockQueue,
    pool: Arc<SamplePool>,
    backend: Option<Backend<S>>,
    failure: Option<Diagnostic>,
    summary: Option<StreamSummary>,
}

impl<S: OutputSink + 'static> Encoder<S> {
    /// Opens stream on the given sink,
    /// writing its initial metadata blocks
    ///
    /// # Errors
    ///
    /// Passes along any I/O error from the sink.
    pub fn new(
        sink: S,
        params: StreamParameters,
        policy: EncodingPolicy,
        options: EncoderOptions,
    ) -> Result<Self, Error> {
        let finalizer = StreamFinalizer::open(sink, params, options.padding)?;
        let pool = Arc::new(SamplePool::new(params.block_len()));

        let backend = match options.threads {
            0 => Backend::Inline(Box::new(Inline {
                encoder: FrameEncoder::new(params, policy),
                finalizer,
                request: BlockEncodeRequest::default(),
                next_frame: Some(FrameNumber::default()),
            })),
            threads => {
                debug!("encoding with {threads} worker threads");
                Backend::Threaded(Pipeline::new(
                    params,
                    options,
                    Arc::clone(&pool),
                    finalizer,
                ))
            }
        };

        Ok(Self {
            params,
            policy,
            queue_limit: options.queue_limit,
            blocks: BlockQueue::new(&params, Arc::clone(&pool)),
            pool,
            backend: Some(backend),
            failure: None,
            summary: None,
        })
    }

    /// The stream's parameters
    pub fn params(&self) -> &StreamParameters {
        &self.params
    }

    /// The policy applied to newly submitted blocks
    pub fn policy(&self) -> &EncodingPolicy {
        &self.policy
    }

    /// Replaces the encoding policy
    ///
    /// Blocks already submitted keep the policy
    /// they were submitted with.
    pub fn set_policy(&mut self, policy: EncodingPolicy) {
        self.policy = policy;
    }

    /// Adds `count` inter-channel samples from
    /// the interleaved `samples` without encoding them
    ///
    /// # Errors
    ///
    /// Returns [`Error::SampleBufferTooShort`] if `samples` is too short,
    /// or an error if the stream has been halted or closed.
    pub fn add_samples(&mut self, samples: &[i32], count: usize) -> Result<(), Error> {
        self.check()?;
        self.blocks.add_samples(samples, count)
    }

    /// Inter-channel samples waiting in full blocks
    pub fn full_block_samples_available(&self) -> usize {
        self.blocks.full_block_samples_available()
    }

    /// Inter-channel samples waiting in full and partial blocks
    pub fn samples_available(&self) -> usize {
        self.blocks.samples_available()
    }

    /// Encodes up to `count` waiting inter-channel samples
    ///
    /// Only whole blocks are encoded, unless `end` is set,
    /// in which case any remaining count is taken from the
    /// final partial block and the stream is closed.
    /// Returns the number of inter-channel samples submitted
    /// for encoding.
    ///
    /// Waits while too many submitted blocks remain unwritten.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InsufficientSamples`] if `end` is set
    /// and fewer than `count` samples are waiting,
    /// [`Error::StreamHalted`] if an earlier frame failed,
    /// or any error from encoding or writing a frame.
    pub fn encode_samples(&mut self, count: usize, end: bool) -> Result<usize, Error> {
        self.check()?;
        if end && count > self.samples_available() {
            return Err(Error::InsufficientSamples);
        }

        let block_size = usize::from(self.params.block_size());
        let mut remaining = count;

        while remaining >= block_size {
            let Some(block) = self.blocks.pop_block() else {
                break;
            };
            remaining -= block.count;
            self.submit(block)?;
        }

        if let Some(Backend::Threaded(pipeline)) = &self.backend {
            pipeline.block_while_queue_exceeds(self.queue_limit)?;
        }

        if end {
            if remaining > 0 {
                let mut tail = match self.blocks.pop_block() {
                    Some(block) => block,
                    None => self.blocks.take_partial().ok_or(Error::InsufficientSamples)?,
                };
                tail.count = remaining;
                self.submit(tail)?;
                remaining = 0;
            }
            self.close()?;
        }

        Ok(count - remaining)
    }

    /// Adds samples and encodes every block they fill
    ///
    /// # Errors
    ///
    /// As [`Encoder::add_samples`] and [`Encoder::encode_samples`].
    pub fn write_samples(&mut self, samples: &[i32], count: usize) -> Result<(), Error> {
        self.add_samples(samples, count)?;
        self.encode_samples(self.full_block_samples_available(), false)
            .map(|_| ())
    }

    /// Blocks until no more than `limit` submitted blocks
    /// remain unwritten
    ///
    /// Returns at once when encoding on the calling thread.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StreamHalted`] if a frame has failed.
    pub fn block_while_queue_exceeds(&self, limit: usize) -> Result<(), Error> {
        match &self.backend {
            Some(Backend::Threaded(pipeline)) => pipeline.block_while_queue_exceeds(limit),
            _ => self.check(),
        }
    }

    /// Number of submitted blocks not yet written
    pub fn outstanding(&self) -> usize {
        match &self.backend {
            Some(Backend::Threaded(pipeline)) => pipeline.outstanding(),
            _ => 0,
        }
    }

    /// The failure which halted the stream, if any
    pub fn failure(&self) -> Option<Diagnostic> {
        match (&self.failure, &self.backend) {
            (Some(diagnostic), _) => Some(diagnostic.clone()),
            (None, Some(Backend::Threaded(pipeline))) => pipeline.failure(),
            (None, _) => None,
        }
    }

    fn check(&self) -> Result<(), Error> {
        match self.failure() {
            Some(diagnostic) => Err(Error::StreamHalted(diagnostic)),
            None if self.backend.is_none() => Err(Error::PipelineClosed),
            None => Ok(()),
        }
    }

    fn submit(&mut self, block: Block) -> Result<(), Error> {
        let result = match &mut self.backend {
            Some(Backend::Threaded(pipeline)) => pipeline.submit(block, self.policy),
            Some(Backend::Inline(inline)) => inline.encode(block, self.policy, &self.pool),
            None => Err(Error::PipelineClosed),
        };
        self.halt_on(result)
    }

    /// Records any failure from encoding, writing or closing
    /// so that later calls halt
    fn halt_on<T>(&mut self, result: Result<T, Error>) -> Result<T, Error> {
        if let Err(err) = &result {
            if self.failure.is_none()
                && !matches!(err, Error::StreamHalted(_) | Error::PipelineClosed)
            {
                let diagnostic = err.diagnostic(None);
                error!("stream halted: {diagnostic}");
                self.failure = Some(diagnostic);
            }
        }
        result
    }

    fn close(&mut self) -> Result<StreamSummary, Error> {
        if let Some(summary) = &self.summary {
            return Ok(summary.clone());
        }
        self.check()?;

        let result = match self.backend.take() {
            Some(Backend::Threaded(pipeline)) => pipeline
                .shutdown()
                .and_then(|mut finalizer| finalizer.finish()),
            Some(Backend::Inline(mut inline)) => inline.finalizer.finish(),
            None => Err(Error::PipelineClosed),
        };
        let summary = self.halt_on(result)?;

        self.summary = Some(summary.clone());
        Ok(summary)
    }

    /// Encodes any remaining samples as the final frame
    /// and completes the stream
    ///
    /// Dropping the encoder will attempt to finish the stream
    /// automatically, but will ignore any errors that may occur.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSamples`] if nothing was encoded,
    /// [`Error::StreamHalted`] if an earlier frame failed,
    /// or any error from encoding or writing the final frame.
    pub fn finish(mut self) -> Result<StreamSummary, Error> {
        self.finish_inner()
    }

    fn finish_inner(&mut self) -> Result<StreamSummary, Error> {
        match &self.summary {
            Some(summary) => Ok(summary.clone()),
            None => {
                let available = self.samples_available();
                self.encode_samples(available, true)?;
                self.close()
            }
        }
    }
}

impl<S: OutputSink + 'static> Drop for Encoder<S> {
    fn drop(&mut self) {
        if self.backend.is_some() {
            let _ = self.finish_inner();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::SubframeMode;
    use crate::sink::{MemorySink, OutputSink};

    fn noise(len: usize) -> Vec<i32> {
        let mut rng = fastrand::Rng::with_seed(0x5EED);
        (0..len).map(|_| rng.i32(-2000..2000)).collect()
    }

    fn encode(threads: usize, samples: &[i32]) -> (StreamSummary, Vec<u8>) {
        let sink = MemorySink::default();
        let mut encoder = Encoder::new(
            sink.clone(),
            StreamParameters::new(2, 44100, 16, 256),
            EncodingPolicy::default(),
            EncoderOptions::default().threads(threads),
        )
        .unwrap();

        for chunk in samples.chunks(2 * 1000) {
            encoder.write_samples(chunk, chunk.len() / 2).unwrap();
        }
        (encoder.finish().unwrap(), sink.contents())
    }

    #[test]
    fn test_threaded_matches_inline() {
        let samples = noise(2 * 5000);
        let (inline, inline_bytes) = encode(0, &samples);
        let (threaded, threaded_bytes) = encode(3, &samples);

        assert_eq!(inline.total_samples, 5000);
        assert_eq!(inline.frames, 20);
        assert_eq!(inline, threaded);
        assert_eq!(inline_bytes, threaded_bytes);
    }

    #[test]
    fn test_end_requires_samples() {
        let mut encoder = Encoder::new(
            MemorySink::default(),
            StreamParameters::new(1, 44100, 16, 16),
            EncodingPolicy::default(),
            EncoderOptions::default(),
        )
        .unwrap();
        encoder.add_samples(&[1, 2, 3], 3).unwrap();
        assert!(matches!(
            encoder.encode_samples(4, true),
            Err(Error::InsufficientSamples)
        ));
        assert_eq!(encoder.encode_samples(3, true).unwrap(), 3);

        // stream is closed
        assert!(matches!(
            encoder.add_samples(&[1], 1),
            Err(Error::PipelineClosed)
        ));
        assert_eq!(encoder.finish().unwrap().total_samples, 3);
    }

    #[test]
    fn test_policy_change() {
        let sink = MemorySink::default();
        let mut encoder = Encoder::new(
            sink.clone(),
            StreamParameters::new(1, 44100, 16, 16),
            EncodingPolicy::default().with_subframe_mode(SubframeMode::Verbatim),
            EncoderOptions::default(),
        )
        .unwrap();

        encoder.write_samples(&[5; 16], 16).unwrap();
        let verbatim = sink.contents().len();

        encoder.set_policy(EncodingPolicy::default());
        encoder.write_samples(&[5; 16], 16).unwrap();
        let constant = sink.contents().len() - verbatim;

        assert!(constant < verbatim);
        assert_eq!(encoder.finish().unwrap().frames, 2);
    }

    fn halted_at(result: Result<impl std::fmt::Debug, Error>) -> Option<u64> {
        match result {
            Err(Error::StreamHalted(diagnostic)) => diagnostic.frame_number,
            other => panic!("expected halted stream, got {other:?}"),
        }
    }

    #[test]
    fn test_sticky_consistency_error() {
        let sink = MemorySink::default();
        let mut encoder = Encoder::new(
            sink.clone(),
            StreamParameters::new(1, 44100, 16, 16),
            EncodingPolicy::default(),
            EncoderOptions::default().threads(2).short_frame(1),
        )
        .unwrap();

        // the failure may already be visible while submitting
        match encoder.write_samples(&[1; 16 * 3], 16 * 3) {
            Ok(()) => {}
            result => assert_eq!(halted_at(result), Some(1)),
        }
        assert_eq!(halted_at(encoder.block_while_queue_exceeds(0)), Some(1));

        let diagnostic = encoder.failure().unwrap();
        assert_eq!(diagnostic.frame_number, Some(1));
        assert!(diagnostic.message.contains("15 samples encoded"));

        assert_eq!(halted_at(encoder.write_samples(&[1; 16], 16)), Some(1));
        assert_eq!(halted_at(encoder.finish()), Some(1));

        // only the frame before the failure was written
        let header = 4 + 4 + 34;
        assert!(sink.contents().len() > header);
        assert!(sink.contents().len() < header + 2 * 12);
    }

    #[test]
    fn test_sticky_dispatch_error() {
        let mut encoder = Encoder::new(
            MemorySink::default(),
            StreamParameters::new(1, 44100, 16, 16),
            EncodingPolicy::default(),
            EncoderOptions::default(),
        )
        .unwrap();

        assert!(matches!(
            encoder.halt_on::<()>(Err(Error::ExcessiveFrameSize)),
            Err(Error::ExcessiveFrameSize)
        ));
        assert_eq!(halted_at(encoder.write_samples(&[0; 16], 16)), None);
        assert!(encoder.failure().unwrap().message.contains("frame size"));

        // halting errors are not recorded twice
        assert!(encoder.halt_on::<()>(Err(Error::PipelineClosed)).is_err());
        assert!(encoder.failure().unwrap().message.contains("frame size"));
    }

    struct FailingSink {
        written: u64,
    }

    impl OutputSink for FailingSink {
        fn write(&mut self, bytes: &[u8]) -> std::io::Result<()> {
            // room for the metadata only
            if self.written > 0 {
                return Err(std::io::Error::other("sink full"));
            }
            self.written += bytes.len() as u64;
            Ok(())
        }

        fn seek(&mut self, position: u64) -> std::io::Result<u64> {
            Ok(position)
        }

        fn position(&self) -> u64 {
            self.written
        }

        fn can_seek(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_sticky_io_error() {
        let mut encoder = Encoder::new(
            FailingSink { written: 0 },
            StreamParameters::new(1, 44100, 16, 16),
            EncodingPolicy::default(),
            EncoderOptions::default(),
        )
        .unwrap();

        assert!(matches!(
            encoder.write_samples(&[0; 16], 16),
            Err(Error::Io(_))
        ));
        assert!(encoder.failure().is_some());
        assert!(matches!(
            encoder.write_samples(&[0; 16], 16),
            Err(Error::StreamHalted(_))
        ));
        assert!(matches!(encoder.finish(), Err(Error::StreamHalted(_))));
    }
}
