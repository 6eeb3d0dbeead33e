// Copyright 2025 Brian Langenberger
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Fixed polynomial predictor subframes

use super::{Subframe, header_bits, write_header};
use crate::Error;
use crate::bitbuffer::BitBuffer;
use crate::rice::{ResidualPlan, write_residual};

/// The largest fixed predictor order
pub const MAX_ORDER: usize = 4;

/// Prediction residual of sample `i` for the given order
#[inline]
fn residual(samples: &[i32], order: usize, i: usize) -> i64 {
    let s = |back: usize| i64::from(samples[i - back]);
    match order {
        0 => s(0),
        1 => s(0) - s(1),
        2 => s(0) - 2 * s(1) + s(2),
        3 => s(0) - 3 * s(1) + 3 * s(2) - s(3),
        _ => s(0) - 4 * s(1) + 6 * s(2) - 4 * s(3) + s(4),
    }
}

/// Estimates and writes fixed subframes
#[derive(Default)]
pub struct FixedEncoder {
    order: usize,
    residuals: Vec<i32>,
    plan: ResidualPlan,
}

impl FixedEncoder {
    /// Picks predictor order with the smallest summed
    /// absolute residual, plans its Rice coding and returns
    /// the exact size of the resulting subframe, in bits
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResidualOverflow`] if no order's
    /// residuals fit in 32 bits.
    pub fn estimate(
        &mut self,
        samples: &[i32],
        bits_per_sample: u32,
        wasted: u32,
        min_partition_order: u32,
        max_partition_order: u32,
    ) -> Result<u64, Error> {
        let max_order = MAX_ORDER.min(samples.len().saturating_sub(1));

        self.order = (0..=max_order)
            .filter_map(|order| {
                (order..samples.len())
                    .map(|i| residual(samples, order, i))
                    .try_fold(0u64, |sum, r| {
                        i32::try_from(r).ok().map(|_| sum + r.unsigned_abs())
                    })
                    .map(|sum| (order, sum))
            })
            .min_by_key(|(_, sum)| *sum)
            .map(|(order, _)| order)
            .ok_or(Error::ResidualOverflow)?;

        self.residuals.clear();
        self.residuals.extend(
            (self.order..samples.len()).map(|i| residual(samples, self.order, i) as i32),
        );

        self.plan.plan(
            &self.residuals,
            samples.len(),
            self.order,
            min_partition_order,
            max_partition_order,
        );

        Ok(header_bits(wasted)
            + self.order as u64 * u64::from(bits_per_sample)
            + self.plan.bits())
    }

    /// Writes subframe from the most recent estimate,
    /// which must have been made over the same samples
    pub fn write(&self, buf: &mut BitBuffer, samples: &[i32], bits_per_sample: u32, wasted: u32) {
        write_header(buf, 0b001000 | self.order as u32, wasted);
        samples[0..self.order]
            .iter()
            .for_each(|s| buf.push_signed((*s).into(), bits_per_sample));
        write_residual(buf, &self.residuals, &self.plan);
    }

    /// Describes subframe from the most recent estimate
    pub fn subframe(&self) -> Subframe {
        Subframe::Fixed {
            order: self.order as u8,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_order_selection() {
        let mut encoder = FixedEncoder::default();

        // a linear ramp is predicted perfectly from order 2 on,
        // and the smallest such order wins ties
        let ramp = (0..256).map(|i| i * 3 - 200).collect::<Vec<_>>();
        encoder.estimate(&ramp, 16, 0, 0, 0).unwrap();
        assert_eq!(encoder.subframe(), Subframe::Fixed { order: 2 });
        assert!(encoder.residuals.iter().all(|r| *r == 0));

        // a quadratic needs order 3
        let quadratic = (0..256).map(|i| i * i - 1000).collect::<Vec<_>>();
        encoder.estimate(&quadratic, 20, 0, 0, 0).unwrap();
        assert_eq!(encoder.subframe(), Subframe::Fixed { order: 3 });
    }

    #[test]
    fn test_estimate_is_exact() {
        let mut encoder = FixedEncoder::default();
        for len in [1, 2, 5, 192, 4096] {
            let samples = (0..len)
                .map(|_| fastrand::i32(-30000..30000))
                .collect::<Vec<_>>();
            let estimate = encoder.estimate(&samples, 16, 2, 0, 4).unwrap();
            let mut buf = BitBuffer::continuing(5);
            encoder.write(&mut buf, &samples, 16, 2);
            assert_eq!(estimate, buf.total_bits());
        }
    }

    #[test]
    fn test_short_blocks() {
        // a single sample allows only order 0
        let mut encoder = FixedEncoder::default();
        encoder.estimate(&[5], 16, 0, 0, 0).unwrap();
        assert_eq!(encoder.subframe(), Subframe::Fixed { order: 0 });
    }
}
