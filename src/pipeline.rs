// Copyright 2025 Brian Langenberger
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! For encoding frames on a pool of worker threads
//!
//! Blocks are submitted in order and each is given the next
//! frame number.
//! Workers take blocks from the unassigned-work queue,
//! encode them with their own [`FrameEncoder`]
//! and place them on the finished-work queue in whatever
//! order they happen to finish.
//! A single collector takes finished blocks and hands them
//! to a [`Dispatch`] strictly in frame number order,
//! stashing any that arrive early.
//!
//! Neither workers nor the collector outlive a period of
//! inactivity; each exits once its queue stays empty for
//! the configured idle timeout and is started again
//! on the next submission.

use crate::bitbuffer::BitBuffer;
use crate::config::{EncoderOptions, EncodingPolicy, StreamParameters};
use crate::frame::FrameEncoder;
use crate::ingest::{Block, SamplePool};
use crate::stream::FrameNumber;
use crate::{Diagnostic, Error};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use log::{debug, error, trace};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;

/// A block of samples on its way through the pipeline
///
/// Requests are recycled once their frame has been dispatched.
#[derive(Debug, Default)]
pub struct BlockEncodeRequest {
    samples: Vec<i32>,
    count: usize,
    frame_number: FrameNumber,
    policy: EncodingPolicy,
    result: BitBuffer,
    encoded: usize,
    valid: bool,
    failure: Option<Error>,
}

impl BlockEncodeRequest {
    /// Builds request for a block of samples
    pub fn new(block: Block, frame_number: FrameNumber, policy: EncodingPolicy) -> Self {
        let mut request = Self::default();
        request.fill(block, frame_number, policy);
        request
    }

    pub(crate) fn fill(&mut self, block: Block, frame_number: FrameNumber, policy: EncodingPolicy) {
        self.samples = block.samples;
        self.count = block.count;
        self.frame_number = frame_number;
        self.policy = policy;
        self.result.clear();
        self.encoded = 0;
        self.valid = false;
        self.failure = None;
    }

    /// Encodes request's block with the given encoder
    ///
    /// On success, the request becomes valid.
    /// Any failure is retained for the collector to report.
    pub fn encode(&mut self, encoder: &mut FrameEncoder) {
        if encoder.policy() != &self.policy {
            encoder.set_policy(self.policy);
        }
        match encoder.encode(
            &self.samples,
            self.count,
            self.frame_number,
            &mut self.result,
        ) {
            Ok(encoded) => {
                self.encoded = encoded;
                self.valid = true;
            }
            Err(err) => {
                self.failure = Some(err);
            }
        }
    }

    /// Takes any encoding failure, or a consistency error
    /// if the request was never encoded
    pub fn take_failure(&mut self) -> Option<Error> {
        match self.failure.take() {
            Some(err) => Some(err),
            None if !self.valid => Some(Error::SampleCountMismatch {
                requested: self.count,
                encoded: self.encoded,
            }),
            None => None,
        }
    }

    pub(crate) fn take_samples(&mut self) -> Vec<i32> {
        std::mem::take(&mut self.samples)
    }

    /// Interleaved samples of the block
    pub fn samples(&self) -> &[i32] {
        &self.samples
    }

    /// Inter-channel samples requested for encoding
    pub fn count(&self) -> usize {
        self.count
    }

    /// The block's frame number
    pub fn frame_number(&self) -> FrameNumber {
        self.frame_number
    }

    /// The encoded frame
    pub fn result(&self) -> &BitBuffer {
        &self.result
    }

    /// Inter-channel samples actually encoded
    pub fn encoded_samples(&self) -> usize {
        self.encoded
    }

    /// Whether the block has been encoded successfully
    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

/// Something which accepts encoded frames in frame number order
pub trait Dispatch: Send {
    /// Receives a valid, encoded request whose frame number
    /// immediately follows the previous one dispatched
    fn dispatch(&mut self, request: &BlockEncodeRequest) -> Result<(), Error>;
}

enum Work {
    Encode(Box<BlockEncodeRequest>),
    Stop,
}

enum Finished {
    Encoded(Box<BlockEncodeRequest>),
    Stop,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum CollectorState {
    Idle,
    Running,
    Draining,
}

/// The collector's private state, owned by one activation at a time
struct Collector<D> {
    dispatch: D,
    next_target: u64,
    early: BTreeMap<u64, Box<BlockEncodeRequest>>,
}

struct Workers {
    active: usize,
    handles: Vec<JoinHandle<()>>,
}

struct Activation {
    state: CollectorState,
    handles: Vec<JoinHandle<()>>,
}

struct Shared<D> {
    options: EncoderOptions,
    params: StreamParameters,
    unassigned: (Sender<Work>, Receiver<Work>),
    finished: (Sender<Finished>, Receiver<Finished>),
    encoders: Mutex<Vec<FrameEncoder>>,
    workers: Mutex<Workers>,
    collector: Mutex<Collector<D>>,
    activation: Mutex<Activation>,
    outstanding: Mutex<usize>,
    retired: Condvar,
    failure: Mutex<Option<Diagnostic>>,
    requests: Mutex<Vec<Box<BlockEncodeRequest>>>,
    samples: Arc<SamplePool>,
}

/// A pool of worker threads encoding frames,
/// and a collector dispatching them in order
pub struct Pipeline<D> {
    shared: Arc<Shared<D>>,
    next_frame: Option<FrameNumber>,
}

impl<D: Dispatch + 'static> Pipeline<D> {
    /// Creates idle pipeline dispatching to the given target
    ///
    /// No threads are started until the first submission.
    pub fn new(
        params: StreamParameters,
        options: EncoderOptions,
        samples: Arc<SamplePool>,
        dispatch: D,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                options,
                params,
                unassigned: unbounded(),
                finished: unbounded(),
                encoders: Mutex::new(Vec::new()),
                workers: Mutex::new(Workers {
                    active: 0,
                    handles: Vec::new(),
                }),
                collector: Mutex::new(Collector {
                    dispatch,
                    next_target: 0,
                    early: BTreeMap::new(),
                }),
                activation: Mutex::new(Activation {
                    state: CollectorState::Idle,
                    handles: Vec::new(),
                }),
                outstanding: Mutex::new(0),
                retired: Condvar::new(),
                failure: Mutex::new(None),
                requests: Mutex::new(Vec::new()),
                samples,
            }),
            next_frame: Some(FrameNumber::default()),
        }
    }

    /// Submits block for encoding as the next frame
    ///
    /// # Errors
    ///
    /// Returns [`Error::StreamHalted`] if an earlier frame failed,
    /// [`Error::ExcessiveFrameNumber`] if the stream has run
    /// out of frame numbers,
    /// or an I/O error if a thread cannot be started.
    pub fn submit(&mut self, block: Block, policy: EncodingPolicy) -> Result<(), Error> {
        self.check()?;

        let frame_number = self.next_frame.ok_or(Error::ExcessiveFrameNumber)?;
        self.next_frame = {
            let mut next = frame_number;
            next.try_increment().ok().map(|()| next)
        };

        let mut request = self
            .shared
            .requests
            .lock()
            .pop()
            .unwrap_or_default();
        request.fill(block, frame_number, policy);

        *self.shared.outstanding.lock() += 1;

        self.shared
            .unassigned
            .0
            .send(Work::Encode(request))
            .map_err(|_| Error::PipelineClosed)?;

        Shared::activate_worker(&self.shared)?;
        Shared::activate_collector(&self.shared)
    }

    /// Blocks until no more than `limit` submitted blocks
    /// remain to be dispatched
    ///
    /// # Errors
    ///
    /// Returns [`Error::StreamHalted`] if a frame has failed.
    pub fn block_while_queue_exceeds(&self, limit: usize) -> Result<(), Error> {
        let mut outstanding = self.shared.outstanding.lock();
        while *outstanding > limit {
            self.shared.retired.wait(&mut outstanding);
        }
        drop(outstanding);
        self.check()
    }

    /// Number of submitted blocks not yet dispatched
    pub fn outstanding(&self) -> usize {
        *self.shared.outstanding.lock()
    }

    /// Number of worker threads currently running
    pub fn active_workers(&self) -> usize {
        self.shared.workers.lock().active
    }

    /// The failure which halted the stream, if any
    pub fn failure(&self) -> Option<Diagnostic> {
        self.shared.failure.lock().clone()
    }

    fn check(&self) -> Result<(), Error> {
        match self.failure() {
            Some(diagnostic) => Err(Error::StreamHalted(diagnostic)),
            None => Ok(()),
        }
    }

    /// Waits for every submitted block to be dispatched,
    /// stops all threads and returns the dispatch target
    ///
    /// # Errors
    ///
    /// Returns [`Error::StreamHalted`] if a frame has failed,
    /// or [`Error::PipelineClosed`] if a thread could not be joined.
    pub fn shutdown(self) -> Result<D, Error> {
        let shared = self.shared;

        {
            let mut outstanding = shared.outstanding.lock();
            while *outstanding > 0 {
                shared.retired.wait(&mut outstanding);
            }
        }

        {
            let mut activation = shared.activation.lock();
            if activation.state == CollectorState::Running {
                // wakes a collector blocked on an empty queue
                shared
                    .finished
                    .0
                    .send(Finished::Stop)
                    .map_err(|_| Error::PipelineClosed)?;
            }
            activation.state = CollectorState::Draining;
        }

        {
            let workers = shared.workers.lock();
            debug!("stopping {} workers", workers.active);
            for _ in 0..workers.active {
                shared
                    .unassigned
                    .0
                    .send(Work::Stop)
                    .map_err(|_| Error::PipelineClosed)?;
            }
        }

        let handles = std::mem::take(&mut shared.workers.lock().handles)
            .into_iter()
            .chain(std::mem::take(&mut shared.activation.lock().handles));
        for handle in handles {
            handle.join().map_err(|_| Error::PipelineClosed)?;
        }

        let failure = shared.failure.lock().take();
        let shared = Arc::into_inner(shared).ok_or(Error::PipelineClosed)?;
        match failure {
            Some(diagnostic) => Err(Error::StreamHalted(diagnostic)),
            None => Ok(shared.collector.into_inner().dispatch),
        }
    }
}

impl<D: Dispatch + 'static> Shared<D> {
    /// Starts another worker if fewer than the configured
    /// number are running
    fn activate_worker(shared: &Arc<Self>) -> Result<(), Error> {
        let mut workers = shared.workers.lock();
        if workers.active >= shared.options.threads {
            return Ok(());
        }

        let encoder = shared.encoders.lock().pop().unwrap_or_else(|| {
            FrameEncoder::new(shared.params, EncodingPolicy::default())
        });
        let id = workers.active;
        let worker = Arc::clone(shared);
        let handle = std::thread::Builder::new()
            .name(format!("flac-worker-{id}"))
            .spawn(move || worker.work(encoder))?;

        workers.active += 1;
        workers.handles.retain(|h| !h.is_finished());
        workers.handles.push(handle);
        debug!("worker {id} started, {} active", workers.active);
        Ok(())
    }

    fn work(self: Arc<Self>, mut encoder: FrameEncoder) {
        loop {
            match self.unassigned.1.recv_timeout(self.options.idle_timeout) {
                Ok(Work::Encode(mut request)) => {
                    let frame_number = request.frame_number.get();
                    if let Some(delay) = self.options.delay_for(frame_number) {
                        std::thread::sleep(delay);
                    }
                    request.encode(&mut encoder);
                    #[cfg(test)]
                    if self.options.short_frame == Some(frame_number) {
                        request.encoded -= 1;
                    }
                    trace!("frame {frame_number} encoded");
                    if self.finished.0.send(Finished::Encoded(request)).is_err() {
                        break;
                    }
                    // the collector may have gone idle during a long encode
                    if let Err(err) = Shared::activate_collector(&self) {
                        error!("unable to start collector: {err}");
                        self.collect_here();
                    }
                }
                Ok(Work::Stop) => break,
                Err(RecvTimeoutError::Timeout) => {
                    let workers = self.workers.lock();
                    if self.unassigned.1.is_empty() {
                        self.retire_worker(workers, encoder);
                        return;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let workers = self.workers.lock();
        self.retire_worker(workers, encoder);
    }

    fn retire_worker(
        &self,
        mut workers: parking_lot::MutexGuard<'_, Workers>,
        encoder: FrameEncoder,
    ) {
        workers.active -= 1;
        self.encoders.lock().push(encoder);
        debug!("worker exited, {} active", workers.active);
    }

    /// Starts the collector if it isn't already running
    fn activate_collector(shared: &Arc<Self>) -> Result<(), Error> {
        let mut activation = shared.activation.lock();
        if activation.state != CollectorState::Idle {
            return Ok(());
        }

        let collector = Arc::clone(shared);
        let handle = std::thread::Builder::new()
            .name("flac-collector".to_owned())
            .spawn(move || collector.collect())?;

        activation.state = CollectorState::Running;
        activation.handles.retain(|h| !h.is_finished());
        activation.handles.push(handle);
        debug!("collector started");
        Ok(())
    }

    /// Runs an activation of the collector on the current thread,
    /// if no other is running
    fn collect_here(&self) {
        {
            let mut activation = self.activation.lock();
            if activation.state != CollectorState::Idle {
                return;
            }
            activation.state = CollectorState::Running;
        }
        self.collect();
    }

    fn collect(&self) {
        let mut collector = self.collector.lock();

        loop {
            // an early arrival may already be due
            let target = collector.next_target;
            if let Some(request) = collector.early.remove(&target) {
                self.retire(&mut collector, request);
                continue;
            }

            match self.finished.1.recv_timeout(self.options.idle_timeout) {
                Ok(Finished::Encoded(request)) if request.frame_number.get() == target => {
                    self.retire(&mut collector, request);
                }
                Ok(Finished::Encoded(request)) => {
                    trace!(
                        "frame {} stashed while waiting for frame {target}",
                        request.frame_number
                    );
                    collector.early.insert(request.frame_number.get(), request);
                }
                Ok(Finished::Stop) => {
                    debug!("collector stopped");
                    return;
                }
                Err(RecvTimeoutError::Timeout) => {
                    let mut activation = self.activation.lock();
                    if self.finished.1.is_empty() {
                        activation.state = match activation.state {
                            CollectorState::Draining => CollectorState::Draining,
                            _ => CollectorState::Idle,
                        };
                        debug!("collector exited");
                        return;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return,
            }

            if self.activation.lock().state == CollectorState::Draining
                && *self.outstanding.lock() == 0
            {
                debug!("collector drained");
                return;
            }
        }
    }

    /// Dispatches request, or records its failure,
    /// and returns it to the pools
    fn retire(&self, collector: &mut Collector<D>, mut request: Box<BlockEncodeRequest>) {
        let frame_number = request.frame_number.get();

        if self.failure.lock().is_none() {
            let result = match request.take_failure() {
                Some(err) => Err(err),
                None => collector.dispatch.dispatch(&request),
            };

            if let Err(err) = result {
                let diagnostic = err.diagnostic(Some(frame_number));
                error!("stream halted: {diagnostic}");
                *self.failure.lock() = Some(diagnostic);
            }
        }

        collector.next_target += 1;

        self.samples.give(request.take_samples());
        self.requests.lock().push(request);

        let mut outstanding = self.outstanding.lock();
        *outstanding -= 1;
        self.retired.notify_all();
    }
}
