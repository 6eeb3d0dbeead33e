// Copyright 2025 Brian Langenberger
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! An append-only chain of bit-granular buffers
//!
//! Encoded frames are assembled from many small pieces
//! whose lengths are not byte multiples: frame headers,
//! subframe headers, warm-up samples, Rice-coded residuals.
//! A [`BitBuffer`] accepts those pieces at any bit position
//! and grows by linking new nodes rather than by
//! reallocating and copying what has been written.
//!
//! Each node has an `offset`, the index of its first valid bit,
//! and `usable_bits`, the index one past its last valid bit.
//! For consecutive nodes `a` and `b`,
//! `b.offset == a.usable_bits % 8`: the first byte of `b`
//! continues the last partial byte of `a`, and the two
//! bytes are merged on output.
//!
//! # Example
//! ```
//! use flac_pipeline::bitbuffer::BitBuffer;
//!
//! let mut buf = BitBuffer::new();
//! buf.push_bits(0b101, 3);
//! buf.push_signed(-1, 4);
//! assert_eq!(buf.total_bits(), 7);
//! assert!(buf.pad_to_byte());
//! assert!(!buf.pad_to_byte());
//! assert_eq!(buf.to_bytes(), vec![0b101_1111_0]);
//! ```

const DEFAULT_NODE_BYTES: usize = 512;
const MAX_NODE_BYTES: usize = 1 << 16;

#[derive(Clone, Debug)]
struct Node {
    data: Vec<u8>,
    offset: usize,
    usable_bits: usize,
}

impl Node {
    fn new(bytes: usize, offset: usize) -> Self {
        debug_assert!(offset < 8);
        Self {
            data: vec![0; bytes.max(1)],
            offset,
            usable_bits: offset,
        }
    }

    #[inline]
    fn remaining_bits(&self) -> usize {
        self.data.len() * 8 - self.usable_bits
    }

    #[inline]
    fn valid_bits(&self) -> usize {
        self.usable_bits - self.offset
    }

    /// Writes the low `bits` bits of `value` at our end,
    /// most-significant bit first
    ///
    /// The node must have room and the bytes being written
    /// must still be zero.
    fn put(&mut self, value: u64, bits: u32) {
        let mut remaining = bits;
        let mut pos = self.usable_bits;

        while remaining > 0 {
            let room = 8 - (pos % 8) as u32;
            let take = room.min(remaining);
            let chunk = ((value >> (remaining - take)) & ((1 << take) - 1)) as u8;
            self.data[pos / 8] |= chunk << (room - take);
            pos += take as usize;
            remaining -= take;
        }

        self.usable_bits = pos;
    }
}

/// A view of one node of a [`BitBuffer`] chain
#[derive(Copy, Clone, Debug)]
pub struct NodeBytes<'b> {
    /// The node's bytes, up to and including any final partial byte
    pub bytes: &'b [u8],
    /// Index of the node's first valid bit
    pub offset: usize,
    /// Index one past the node's last valid bit
    pub usable_bits: usize,
}

/// An append-only, arbitrary bit-length buffer
#[derive(Clone, Debug)]
pub struct BitBuffer {
    nodes: Vec<Node>,
    node_bytes: usize,
    total_bits: u64,
}

impl Default for BitBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl BitBuffer {
    /// Creates empty buffer starting on a byte boundary
    pub fn new() -> Self {
        Self::continuing(0)
    }

    /// Creates empty buffer whose first bit lands at
    /// the given bit offset (0 to 7) within its first byte
    ///
    /// Such a buffer can be linked to the end of another
    /// buffer whose length is `offset` bits past a byte boundary
    /// without copying.
    pub fn continuing(offset: u32) -> Self {
        Self::with_node_size(DEFAULT_NODE_BYTES, offset)
    }

    /// Creates empty buffer with the given initial node size, in bytes
    pub fn with_node_size(node_bytes: usize, offset: u32) -> Self {
        let offset = (offset % 8) as usize;
        Self {
            nodes: vec![Node::new(node_bytes, offset)],
            node_bytes: node_bytes.max(1),
            total_bits: 0,
        }
    }

    /// Empties buffer, retaining its first node's storage
    pub fn clear(&mut self) {
        self.clear_continuing(0)
    }

    /// Empties buffer, retaining its first node's storage,
    /// and sets the bit offset of the next write
    pub fn clear_continuing(&mut self, offset: u32) {
        self.nodes.truncate(1);
        let node = &mut self.nodes[0];
        node.data.fill(0);
        node.offset = (offset % 8) as usize;
        node.usable_bits = node.offset;
        self.total_bits = 0;
    }

    /// Total number of valid bits across the whole chain
    #[inline]
    pub fn total_bits(&self) -> u64 {
        self.total_bits
    }

    /// Number of nodes in the chain
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Bit offset of the chain's first valid bit within its first byte
    pub fn start_offset(&self) -> u32 {
        self.nodes[0].offset as u32
    }

    /// Bit position of the next write within its byte
    #[inline]
    pub fn end_offset(&self) -> u32 {
        (self.tail().usable_bits % 8) as u32
    }

    /// Whether the next write begins on a byte boundary
    #[inline]
    pub fn is_byte_aligned(&self) -> bool {
        self.end_offset() == 0
    }

    #[inline]
    fn tail(&self) -> &Node {
        // a chain always has at least one node
        &self.nodes[self.nodes.len() - 1]
    }

    #[inline]
    fn tail_mut(&mut self) -> &mut Node {
        let last = self.nodes.len() - 1;
        &mut self.nodes[last]
    }

    /// Ensures the tail node has room for `bits` more bits,
    /// linking a new node if it does not
    fn reserve(&mut self, bits: usize) {
        if self.tail().remaining_bits() < bits {
            let offset = self.tail().usable_bits % 8;
            let grown = (self.tail().data.len() * 2).clamp(self.node_bytes, MAX_NODE_BYTES);
            let needed = (offset + bits).div_ceil(8);
            self.nodes.push(Node::new(grown.max(needed), offset));
        }
    }

    /// Appends the low-order `bits` bits of `value`
    ///
    /// `bits` must be no more than 64.
    /// Any bits of `value` above `bits` are ignored.
    pub fn push_bits(&mut self, value: u64, bits: u32) {
        debug_assert!(bits <= 64);
        if bits > 0 {
            self.reserve(bits as usize);
            self.tail_mut().put(value, bits);
            self.total_bits += u64::from(bits);
        }
    }

    /// Appends the low-order `bits` bits of a signed value's
    /// two's complement representation
    #[inline]
    pub fn push_signed(&mut self, value: i64, bits: u32) {
        self.push_bits(value as u64, bits)
    }

    /// Appends a single bit
    #[inline]
    pub fn push_bit(&mut self, bit: bool) {
        self.push_bits(u64::from(bit), 1)
    }

    /// Appends `count` zero bits
    pub fn push_zeros(&mut self, mut count: u64) {
        self.total_bits += count;

        while count > 0 {
            if self.tail().remaining_bits() == 0 {
                let chunk = usize::try_from(count)
                    .unwrap_or(usize::MAX)
                    .min(MAX_NODE_BYTES * 8);
                self.reserve(chunk);
            }
            // node storage is zeroed, so we only need to advance
            let tail = self.tail_mut();
            let take = (tail.remaining_bits() as u64).min(count);
            tail.usable_bits += take as usize;
            count -= take;
        }
    }

    /// Appends the whole of the given bytes
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.reserve(bytes.len() * 8);
        let tail = self.tail_mut();
        if tail.usable_bits % 8 == 0 {
            let start = tail.usable_bits / 8;
            tail.data[start..start + bytes.len()].copy_from_slice(bytes);
            tail.usable_bits += bytes.len() * 8;
        } else {
            bytes.iter().for_each(|b| tail.put((*b).into(), 8));
        }
        self.total_bits += bytes.len() as u64 * 8;
    }

    /// Appends many values, each with its own bit width
    ///
    /// Room for all of the values is reserved up front
    /// so that a run of short codes packs without
    /// re-checking node capacity.
    /// Each width must be no more than 32.
    pub fn push_packed(&mut self, values: &[u32], widths: &[u32]) {
        debug_assert_eq!(values.len(), widths.len());
        let total: usize = widths.iter().map(|w| *w as usize).sum();
        if total == 0 {
            return;
        }
        self.reserve(total);
        let tail = self.tail_mut();
        for (value, width) in values.iter().zip(widths) {
            debug_assert!(*width <= 32);
            tail.put((*value).into(), *width);
        }
        self.total_bits += total as u64;
    }

    /// Pads the chain with zero bits up to the next byte boundary
    ///
    /// Returns `true` if any padding was added,
    /// `false` if the chain was already aligned.
    pub fn pad_to_byte(&mut self) -> bool {
        match self.end_offset() {
            0 => false,
            used => {
                // the partial byte already exists and is zero past `used`
                let pad = 8 - used;
                self.tail_mut().usable_bits += pad as usize;
                self.total_bits += u64::from(pad);
                true
            }
        }
    }

    /// Appends another chain's bits to our own
    ///
    /// If `other` starts at the bit offset where we end,
    /// its nodes are moved onto our chain without copying.
    /// Otherwise its bits are copied.
    pub fn link(&mut self, other: BitBuffer) {
        if other.total_bits == 0 {
            return;
        }

        if other.start_offset() == self.end_offset() {
            // drop any empty tail of ours so that
            // the continuation invariant holds across the seam
            if self.tail().valid_bits() == 0 && self.nodes.len() > 1 {
                self.nodes.pop();
            }
            self.total_bits += other.total_bits;
            self.nodes.extend(other.nodes);
        } else {
            self.append(&other);
        }
    }

    /// Copies another chain's bits onto the end of our own
    pub fn append(&mut self, other: &BitBuffer) {
        for node in other.nodes() {
            let mut pos = node.offset;
            while pos < node.usable_bits {
                let in_byte = 8 - pos % 8;
                let take = in_byte.min(node.usable_bits - pos);
                let byte = node.bytes[pos / 8];
                let value = (byte >> (in_byte - take)) & ((1u16 << take) - 1) as u8;
                self.push_bits(value.into(), take as u32);
                pos += take;
            }
        }
    }

    /// Iterates over the nodes of the chain in order
    pub fn nodes(&self) -> impl Iterator<Item = NodeBytes<'_>> {
        self.nodes.iter().map(|n| NodeBytes {
            bytes: &n.data[0..n.usable_bits.div_ceil(8)],
            offset: n.offset,
            usable_bits: n.usable_bits,
        })
    }

    /// Appends the chain's contents to the given byte vector,
    /// merging continuation bytes across node boundaries
    ///
    /// A final partial byte is written zero-padded.
    pub fn write_bytes(&self, out: &mut Vec<u8>) {
        let mut carry: Option<u8> = None;

        for node in self.nodes() {
            let mut start = 0;
            if node.offset != 0 {
                let merged = carry.take().unwrap_or(0) | node.bytes.first().copied().unwrap_or(0);
                if node.usable_bits >= 8 {
                    out.push(merged);
                    start = 1;
                } else {
                    carry = Some(merged);
                    continue;
                }
            } else {
                debug_assert!(carry.is_none(), "node continuation offset mismatch");
                if let Some(c) = carry.take() {
                    out.push(c);
                }
            }

            let full = node.usable_bits / 8;
            if full > start {
                out.extend_from_slice(&node.bytes[start..full]);
            }
            if node.usable_bits % 8 != 0 {
                carry = Some(node.bytes[full]);
            }
        }

        out.extend(carry);
    }

    /// Returns the chain's contents as contiguous bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_bits.div_ceil(8) as usize + 1);
        self.write_bytes(&mut out);
        out
    }
}
