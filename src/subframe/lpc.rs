// Copyright 2025 Brian Langenberger
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Linear predictive coding subframes
//!
//! Coefficients come from the autocorrelation of
//! the Welch-windowed block via Levinson-Durbin recursion,
//! and are quantized to a precision chosen from the block size.
//! Orders are tried from the highest down, stopping
//! once two orders in a row fail to improve on the best so far.

use super::{Subframe, header_bits, write_header};
use crate::bitbuffer::BitBuffer;
use crate::config::EncodingPolicy;
use crate::rice::{ResidualPlan, write_residual};
use arrayvec::ArrayVec;

/// The largest LPC order
pub const MAX_ORDER: usize = 32;

const MAX_SHIFT: i32 = 15;

const PRECISION_BITS: u32 = 4;

const SHIFT_BITS: u32 = 5;

/// Coefficient precision, in bits, suited to a block size
fn precision(block_size: usize) -> u32 {
    match block_size {
        0..=192 => 7,
        193..=384 => 8,
        385..=576 => 9,
        577..=1152 => 10,
        1153..=2304 => 11,
        2305..=4608 => 12,
        _ => 13,
    }
}

type Coefficients = ArrayVec<i32, MAX_ORDER>;

/// Quantized predictor for one order
#[derive(Clone, Debug, Default)]
struct Predictor {
    coefficients: Coefficients,
    precision: u32,
    shift: u32,
}

impl Predictor {
    /// Quantizes floating-point coefficients to the given precision
    ///
    /// Returns `None` if the coefficients are too large
    /// to quantize without a negative shift.
    fn quantize(lp: &[f64], precision: u32) -> Option<Self> {
        let max_coefficient = (1 << (precision - 1)) - 1;
        let min_coefficient = -(1 << (precision - 1));

        let cmax = lp.iter().fold(0.0f64, |m, c| m.max(c.abs()));
        let shift = if cmax > 0.0 {
            // exponent e where cmax = m * 2^e and 0.5 <= m < 1
            let exponent = cmax.log2().floor() as i32 + 1;
            (precision as i32 - 1 - exponent).min(MAX_SHIFT)
        } else {
            0
        };
        if shift < 0 {
            return None;
        }

        let scale = f64::from(1u32 << shift);
        let mut error = 0.0;
        let coefficients = lp
            .iter()
            .map(|c| {
                error += c * scale;
                let q = (error.round() as i32).clamp(min_coefficient, max_coefficient);
                error -= f64::from(q);
                q
            })
            .collect();

        Some(Self {
            coefficients,
            precision,
            shift: shift as u32,
        })
    }

    fn order(&self) -> usize {
        self.coefficients.len()
    }

    /// Computes residuals, returning `false` if any
    /// doesn't fit in 32 bits
    fn residuals(&self, samples: &[i32], residuals: &mut Vec<i32>) -> bool {
        residuals.clear();
        for i in self.order()..samples.len() {
            let prediction = self
                .coefficients
                .iter()
                .enumerate()
                .map(|(j, c)| i64::from(*c) * i64::from(samples[i - j - 1]))
                .sum::<i64>()
                >> self.shift;
            match i32::try_from(i64::from(samples[i]) - prediction) {
                Ok(r) => residuals.push(r),
                Err(_) => return false,
            }
        }
        true
    }

    fn bits(&self, bits_per_sample: u32) -> u64 {
        self.order() as u64 * u64::from(bits_per_sample + self.precision)
            + u64::from(PRECISION_BITS + SHIFT_BITS)
    }
}

/// Estimates and writes LPC subframes
#[derive(Default)]
pub struct LpcEncoder {
    window: Vec<f64>,
    windowed: Vec<f64>,
    lp: Vec<Vec<f64>>,
    candidate: Predictor,
    candidate_residuals: Vec<i32>,
    candidate_plan: ResidualPlan,
    best: Predictor,
    residuals: Vec<i32>,
    plan: ResidualPlan,
}

impl LpcEncoder {
    /// Builds Welch window for the given block size, if not cached
    fn prepare_window(&mut self, len: usize) {
        if self.window.len() != len {
            let half = (len as f64 - 1.0) / 2.0;
            self.window.clear();
            self.window.extend((0..len).map(|i| {
                let x = (i as f64 - half) / half;
                1.0 - x * x
            }));
        }
    }

    /// Computes LP coefficients for orders 1 to `max_order`,
    /// returning the highest order actually available
    fn analyze(&mut self, samples: &[i32], max_order: usize) -> usize {
        self.prepare_window(samples.len());
        self.windowed.clear();
        self.windowed.extend(
            samples
                .iter()
                .zip(&self.window)
                .map(|(s, w)| f64::from(*s) * w),
        );

        let autoc = (0..=max_order)
            .map(|lag| {
                self.windowed[lag..]
                    .iter()
                    .zip(&self.windowed)
                    .map(|(a, b)| a * b)
                    .sum::<f64>()
            })
            .collect::<ArrayVec<f64, { MAX_ORDER + 1 }>>();

        self.lp.resize_with(max_order, Vec::new);

        // Levinson-Durbin recursion
        let mut lpc = [0.0f64; MAX_ORDER];
        let mut err = autoc[0];
        for i in 0..max_order {
            if err <= 0.0 {
                return i;
            }
            let mut r = -autoc[i + 1];
            for j in 0..i {
                r -= lpc[j] * autoc[i - j];
            }
            r /= err;

            lpc[i] = r;
            for j in 0..(i >> 1) {
                let tmp = lpc[j];
                lpc[j] += r * lpc[i - 1 - j];
                lpc[i - 1 - j] += r * tmp;
            }
            if i & 1 == 1 {
                lpc[i >> 1] += lpc[i >> 1] * r;
            }

            err *= 1.0 - r * r;

            self.lp[i].clear();
            self.lp[i].extend(lpc[0..=i].iter().map(|c| -c));
        }
        max_order
    }

    /// Searches LPC orders allowed by the policy and returns
    /// exact size of the best resulting subframe, in bits,
    /// or `None` if no order applies to the block
    pub fn estimate(
        &mut self,
        samples: &[i32],
        bits_per_sample: u32,
        wasted: u32,
        policy: &EncodingPolicy,
    ) -> Option<u64> {
        let (min_order, max_order) = policy.lpc_orders();
        let (min_partition, max_partition) = policy.partition_orders();

        let max_order = (max_order as usize)
            .min(MAX_ORDER)
            .min(samples.len().saturating_sub(1));
        let min_order = min_order as usize;
        if max_order < min_order.max(1) {
            return None;
        }

        let max_order = self.analyze(samples, max_order);
        let precision = precision(samples.len());

        let mut best_bits = None;
        let mut misses = 0;

        for order in (min_order.max(1)..=max_order).rev() {
            let Some(predictor) = Predictor::quantize(&self.lp[order - 1], precision) else {
                continue;
            };
            if !predictor.residuals(samples, &mut self.candidate_residuals) {
                continue;
            }
            self.candidate_plan.plan(
                &self.candidate_residuals,
                samples.len(),
                order,
                min_partition,
                max_partition,
            );
            self.candidate = predictor;

            let bits = header_bits(wasted)
                + self.candidate.bits(bits_per_sample)
                + self.candidate_plan.bits();

            match best_bits {
                Some(best) if bits >= best => {
                    misses += 1;
                    if misses == 2 {
                        break;
                    }
                }
                _ => {
                    misses = 0;
                    best_bits = Some(bits);
                    std::mem::swap(&mut self.best, &mut self.candidate);
                    std::mem::swap(&mut self.residuals, &mut self.candidate_residuals);
                    std::mem::swap(&mut self.plan, &mut self.candidate_plan);
                }
            }
        }

        best_bits
    }

    /// Writes subframe from the most recent successful estimate,
    /// which must have been made over the same samples
    pub fn write(&self, buf: &mut BitBuffer, samples: &[i32], bits_per_sample: u32, wasted: u32) {
        let order = self.best.order();
        write_header(buf, 0b100000 | (order as u32 - 1), wasted);
        samples[0..order]
            .iter()
            .for_each(|s| buf.push_signed((*s).into(), bits_per_sample));
        buf.push_bits(u64::from(self.best.precision - 1), PRECISION_BITS);
        buf.push_signed(i64::from(self.best.shift), SHIFT_BITS);
        self.best
            .coefficients
            .iter()
            .for_each(|c| buf.push_signed((*c).into(), self.best.precision));
        write_residual(buf, &self.residuals, &self.plan);
    }

    /// Describes subframe from the most recent successful estimate
    pub fn subframe(&self) -> Subframe {
        Subframe::Lpc {
            order: self.best.order() as u8,
            precision: self.best.precision as u8,
            shift: self.best.shift as u8,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn policy(min: u32, max: u32) -> EncodingPolicy {
        EncodingPolicy::default()
            .with_lpc_orders(min, max)
            .with_partition_orders(0, 4)
    }

    #[test]
    fn test_precision() {
        assert_eq!(precision(192), 7);
        assert_eq!(precision(576), 9);
        assert_eq!(precision(4096), 12);
        assert_eq!(precision(65535), 13);
    }

    #[test]
    fn test_quantize() {
        let predictor = Predictor::quantize(&[1.8, -0.9], 12).unwrap();
        // 1.8 needs 1 integer bit plus sign, leaving 10 fractional bits
        assert_eq!(predictor.shift, 10);
        // rounding error of the first carries into the second
        assert_eq!(predictor.coefficients.as_slice(), &[1843, -921]);

        let zeros = Predictor::quantize(&[0.0, 0.0], 12).unwrap();
        assert_eq!(zeros.coefficients.as_slice(), &[0, 0]);

        // tiny coefficients are capped at the largest shift
        let tiny = Predictor::quantize(&[0.0001], 12).unwrap();
        assert_eq!(tiny.shift, 15);
    }

    #[test]
    fn test_estimate_is_exact() {
        let mut encoder = LpcEncoder::default();
        let samples = (0..4096)
            .map(|i| {
                let t = i as f64;
                ((t * 0.03).sin() * 8000.0 + (t * 0.11).cos() * 3000.0) as i32
                    + fastrand::i32(-20..20)
            })
            .collect::<Vec<_>>();

        for (min, max) in [(1, 1), (1, 12), (8, 32)] {
            let estimate = encoder.estimate(&samples, 16, 0, &policy(min, max)).unwrap();
            let mut buf = BitBuffer::continuing(1);
            encoder.write(&mut buf, &samples, 16, 0);
            assert_eq!(estimate, buf.total_bits());
            assert!(estimate < 4096 * 16);

            let Subframe::Lpc { order, .. } = encoder.subframe() else {
                panic!("not an LPC subframe");
            };
            assert!((min..=max).contains(&u32::from(order)));
        }
    }

    #[test]
    fn test_inapplicable() {
        let mut encoder = LpcEncoder::default();
        // block too short for the minimum order
        assert_eq!(encoder.estimate(&[1, 2, 3], 16, 0, &policy(4, 8)), None);
        // silent block has no usable autocorrelation
        assert_eq!(encoder.estimate(&[0; 64], 16, 0, &policy(1, 8)), None);
    }
}
