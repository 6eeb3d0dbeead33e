// Copyright 2025 Brian Langenberger
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Rice coding of prediction residuals
//!
//! A residual section is a 2-bit coding method,
//! a 4-bit partition order and `2 ^ order` partitions.
//! Each partition carries its own Rice parameter,
//! or an escape code followed by a 5-bit raw sample width
//! when Rice coding would expand the partition.
//!
//! Every cost this module reports is exact;
//! the bits written by [`write_residual`] always
//! match [`ResidualPlan::bits`].

use crate::bitbuffer::BitBuffer;
use arrayvec::ArrayVec;

/// The largest partition order the format allows
pub const MAX_PARTITION_ORDER: u32 = 15;

/// The largest Rice parameter (5-bit coding, less its escape code)
pub const MAX_PARAMETER: u32 = 30;

const MAX_ESCAPED_WIDTH: u32 = 31;

const ESCAPED_WIDTH_BITS: u32 = 5;

/// How partition parameters are coded
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum CodingMethod {
    /// 4-bit parameters, escape code `1111`
    #[default]
    Rice,
    /// 5-bit parameters, escape code `11111`
    Rice2,
}

impl CodingMethod {
    /// Size of each partition's parameter field, in bits
    pub fn parameter_bits(self) -> u32 {
        match self {
            Self::Rice => 4,
            Self::Rice2 => 5,
        }
    }

    /// Largest parameter value which isn't an escape code
    pub fn max_parameter(self) -> u32 {
        self.escape_code() - 1
    }

    fn escape_code(self) -> u32 {
        (1 << self.parameter_bits()) - 1
    }

    fn method_code(self) -> u32 {
        match self {
            Self::Rice => 0b00,
            Self::Rice2 => 0b01,
        }
    }
}

/// How a single partition is coded
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Partition {
    /// Rice coded with the given parameter
    Rice(u32),
    /// Stored as raw two's complement values of the given width
    Escaped(u32),
}

/// Maps a signed residual onto an unsigned value
/// (0, -1, 1, -2, 2 … become 0, 1, 2, 3, 4 …)
#[inline]
pub fn zigzag(residual: i32) -> u32 {
    ((residual << 1) ^ (residual >> 31)) as u32
}

/// Returns exact size in bits of a partition Rice coded
/// with the given parameter, including a parameter field
/// of `parameter_bits` bits
pub fn calculate_encode_size(residuals: &[i32], parameter: u32, parameter_bits: u32) -> u64 {
    u64::from(parameter_bits)
        + residuals
            .iter()
            .map(|r| 1 + u64::from(parameter) + u64::from(zigzag(*r) >> parameter))
            .sum::<u64>()
}

/// Writes a partition Rice coded with the given parameter,
/// preceded by its `parameter_bits`-wide parameter field
pub fn encode_rice_partition(
    buf: &mut BitBuffer,
    residuals: &[i32],
    parameter: u32,
    parameter_bits: u32,
) {
    const BATCH: usize = 64;

    let mut values = ArrayVec::<u32, BATCH>::new();
    let mut widths = ArrayVec::<u32, BATCH>::new();

    buf.push_bits(parameter.into(), parameter_bits);

    let mask = (1u32 << parameter) - 1;
    for r in residuals {
        let unsigned = zigzag(*r);
        let msb = unsigned >> parameter;

        if values.remaining_capacity() < 2 {
            buf.push_packed(&values, &widths);
            values.clear();
            widths.clear();
        }

        if msb < 32 {
            // unary zeros and stop bit as one value
            values.push(1);
            widths.push(msb + 1);
        } else {
            buf.push_packed(&values, &widths);
            values.clear();
            widths.clear();
            buf.push_zeros(msb.into());
            values.push(1);
            widths.push(1);
        }
        values.push(unsigned & mask);
        widths.push(parameter);
    }

    buf.push_packed(&values, &widths);
}

/// Returns number of bits needed to store every residual
/// as a raw two's complement value, or `None` if that
/// is too wide for an escaped partition
fn escaped_width(residuals: &[i32]) -> Option<u32> {
    let width = residuals
        .iter()
        .filter(|r| **r != 0)
        .map(|r| 33 - (r ^ (r >> 31)).leading_zeros())
        .max()
        .unwrap_or(0);
    (width <= MAX_ESCAPED_WIDTH).then_some(width)
}

/// Chooses best coding for a single partition,
/// returning it along with its cost in bits,
/// not counting the parameter field
fn best_partition(residuals: &[i32]) -> (Partition, u64) {
    if residuals.is_empty() {
        return (Partition::Rice(0), 0);
    }

    let sum = residuals.iter().map(|r| u64::from(zigzag(*r))).sum::<u64>();
    let mean = sum / residuals.len() as u64;
    let estimate = mean.checked_ilog2().unwrap_or(0).min(MAX_PARAMETER);

    let (parameter, rice_bits) = (estimate.saturating_sub(1)..=(estimate + 1).min(MAX_PARAMETER))
        .map(|k| (k, calculate_encode_size(residuals, k, 0)))
        .min_by_key(|(_, bits)| *bits)
        .unwrap_or((0, calculate_encode_size(residuals, 0, 0)));

    match escaped_width(residuals) {
        Some(width) => {
            let escaped_bits =
                u64::from(ESCAPED_WIDTH_BITS) + residuals.len() as u64 * u64::from(width);
            if escaped_bits < rice_bits {
                (Partition::Escaped(width), escaped_bits)
            } else {
                (Partition::Rice(parameter), rice_bits)
            }
        }
        None => (Partition::Rice(parameter), rice_bits),
    }
}

/// Whether residuals of a block can be split into
/// `2 ^ order` partitions
fn valid_partition_order(block_size: usize, predictor_order: usize, order: u32) -> bool {
    match order {
        0 => block_size >= predictor_order,
        order => {
            block_size % (1 << order) == 0 && (block_size >> order) > predictor_order
        }
    }
}

/// A complete coding plan for one residual section
#[derive(Clone, Debug, Default)]
pub struct ResidualPlan {
    method: CodingMethod,
    partition_order: u32,
    partitions: Vec<Partition>,
    scratch: Vec<Partition>,
    partition_len: usize,
    predictor_order: usize,
    bits: u64,
}

impl ResidualPlan {
    /// Exact size of the residual section, in bits
    pub fn bits(&self) -> u64 {
        self.bits
    }

    /// The chosen partition order
    pub fn partition_order(&self) -> u32 {
        self.partition_order
    }

    /// The chosen parameter coding method
    pub fn method(&self) -> CodingMethod {
        self.method
    }

    /// Each partition's coding
    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    /// Plans the coding of a block's residuals
    ///
    /// `residuals` holds `block_size - predictor_order` values.
    /// Partition orders between `min_order` and `max_order`
    /// which evenly divide the block are tried,
    /// and the smallest coding is kept.
    pub fn plan(
        &mut self,
        residuals: &[i32],
        block_size: usize,
        predictor_order: usize,
        min_order: u32,
        max_order: u32,
    ) {
        debug_assert_eq!(residuals.len() + predictor_order, block_size);

        let max_order = max_order.min(MAX_PARTITION_ORDER);
        let min_order = min_order.min(max_order);

        self.bits = u64::MAX;
        self.predictor_order = predictor_order;

        for order in (min_order..=max_order)
            .filter(|o| valid_partition_order(block_size, predictor_order, *o))
        {
            self.try_order(residuals, block_size, predictor_order, order);
        }

        if self.bits == u64::MAX {
            self.try_order(residuals, block_size, predictor_order, 0);
        }
    }

    fn try_order(&mut self, residuals: &[i32], block_size: usize, predictor_order: usize, order: u32) {
        let partition_len = block_size >> order;
        let mut data_bits = 0;
        let mut wide = false;

        self.scratch.clear();
        let (first, rest) = residuals.split_at(partition_len - predictor_order);
        for partition in std::iter::once(first).chain(rest.chunks(partition_len.max(1))) {
            let (coding, bits) = best_partition(partition);
            if let Partition::Rice(k) = coding {
                wide |= k > CodingMethod::Rice.max_parameter();
            }
            self.scratch.push(coding);
            data_bits += bits;
        }

        let method = if wide {
            CodingMethod::Rice2
        } else {
            CodingMethod::Rice
        };

        let bits = 2
            + 4
            + data_bits
            + self.scratch.len() as u64 * u64::from(method.parameter_bits());

        if bits < self.bits {
            self.bits = bits;
            self.method = method;
            self.partition_order = order;
            self.partition_len = partition_len;
            std::mem::swap(&mut self.partitions, &mut self.scratch);
        }
    }
}

/// Writes residual section according to a plan
/// made over the same residuals
pub fn write_residual(buf: &mut BitBuffer, residuals: &[i32], plan: &ResidualPlan) {
    let parameter_bits = plan.method.parameter_bits();

    buf.push_bits(plan.method.method_code().into(), 2);
    buf.push_bits(plan.partition_order.into(), 4);

    let (first, rest) = residuals.split_at(plan.partition_len - plan.predictor_order);
    for (partition, coding) in std::iter::once(first)
        .chain(rest.chunks(plan.partition_len.max(1)))
        .zip(&plan.partitions)
    {
        match coding {
            Partition::Rice(k) => encode_rice_partition(buf, partition, *k, parameter_bits),
            Partition::Escaped(width) => {
                buf.push_bits(plan.method.escape_code().into(), parameter_bits);
                buf.push_bits((*width).into(), ESCAPED_WIDTH_BITS);
                for r in partition {
                    buf.push_signed((*r).into(), *width);
                }
            }
        }
    }
}
