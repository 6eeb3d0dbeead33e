// Copyright 2025 Brian Langenberger
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! For slicing incoming samples into fixed-size blocks

use crate::Error;
use crate::config::StreamParameters;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// A free list of sample buffers shared between
/// the thread producing blocks and the thread retiring them
#[derive(Debug, Default)]
pub struct SamplePool {
    free: Mutex<Vec<Vec<i32>>>,
    block_len: usize,
}

impl SamplePool {
    const MAX_FREE: usize = 64;

    /// Creates pool of buffers for the given number of interleaved samples
    pub fn new(block_len: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            block_len,
        }
    }

    /// Takes an empty buffer with room for one block
    pub fn take(&self) -> Vec<i32> {
        match self.free.lock().pop() {
            Some(mut buf) => {
                buf.clear();
                buf
            }
            None => Vec::with_capacity(self.block_len),
        }
    }

    /// Returns buffer to pool
    ///
    /// Buffers too small for a block are dropped.
    pub fn give(&self, buf: Vec<i32>) {
        if buf.capacity() >= self.block_len {
            let mut free = self.free.lock();
            if free.len() < Self::MAX_FREE {
                free.push(buf);
            }
        }
    }

    /// Number of buffers waiting for reuse
    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }
}

/// A block of interleaved samples
#[derive(Debug)]
pub struct Block {
    /// Interleaved samples
    pub samples: Vec<i32>,
    /// Number of inter-channel samples
    pub count: usize,
}

/// Accumulates interleaved samples into blocks
pub struct BlockQueue {
    channels: usize,
    block_size: usize,
    ready: VecDeque<Block>,
    partial: Vec<i32>,
    pool: std::sync::Arc<SamplePool>,
}

impl BlockQueue {
    /// Creates empty queue for a stream's parameters
    pub fn new(params: &StreamParameters, pool: std::sync::Arc<SamplePool>) -> Self {
        Self {
            channels: params.channels().into(),
            block_size: params.block_size().into(),
            ready: VecDeque::new(),
            partial: pool.take(),
            pool,
        }
    }

    fn block_len(&self) -> usize {
        self.block_size * self.channels
    }

    /// Adds `count` inter-channel samples from the
    /// start of the interleaved `samples`
    ///
    /// Samples top up any partial block first,
    /// and every filled block is queued.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SampleBufferTooShort`] if `samples`
    /// holds fewer than `count` inter-channel samples.
    pub fn add_samples(&mut self, samples: &[i32], count: usize) -> Result<(), Error> {
        let mut remaining = samples
            .get(0..count * self.channels)
            .ok_or(Error::SampleBufferTooShort)?;

        while !remaining.is_empty() {
            let room = self.block_len() - self.partial.len();
            let (taken, rest) = remaining.split_at(room.min(remaining.len()));
            self.partial.extend_from_slice(taken);
            remaining = rest;

            if self.partial.len() == self.block_len() {
                let samples = std::mem::replace(&mut self.partial, self.pool.take());
                self.ready.push_back(Block {
                    samples,
                    count: self.block_size,
                });
            }
        }

        Ok(())
    }

    /// Inter-channel samples waiting in full blocks
    pub fn full_block_samples_available(&self) -> usize {
        self.ready.len() * self.block_size
    }

    /// Inter-channel samples waiting in full and partial blocks
    pub fn samples_available(&self) -> usize {
        self.full_block_samples_available() + self.partial.len() / self.channels
    }

    /// Number of full blocks waiting
    pub fn blocks_ready(&self) -> usize {
        self.ready.len()
    }

    /// Removes the oldest full block
    pub fn pop_block(&mut self) -> Option<Block> {
        self.ready.pop_front()
    }

    /// Removes the partial block, if it holds any samples
    pub fn take_partial(&mut self) -> Option<Block> {
        (!self.partial.is_empty()).then(|| {
            let samples = std::mem::replace(&mut self.partial, self.pool.take());
            Block {
                count: samples.len() / self.channels,
                samples,
            }
        })
    }
}
