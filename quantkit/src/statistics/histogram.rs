use serde::{Deserialize, Serialize};

use super::StatisticsError;

/// Default number of histogram bins.
pub const DEFAULT_NUM_BINS: usize = 2048;

/// Fixed-range histogram of a tensor's values. Histograms covering the same range merge by
/// adding counts, which keeps aggregation across calibration samples order independent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    min: f32,
    max: f32,
    counts: Vec<u64>,
}

impl Histogram {
    /// Empty histogram over `[min, max]`.
    pub fn new(min: f32, max: f32, num_bins: usize) -> Self {
        Self {
            min,
            max: max.max(min),
            counts: vec![0; num_bins.max(1)],
        }
    }

    pub fn from_values(values: &[f32], num_bins: usize) -> Result<Self, StatisticsError> {
        if values.is_empty() {
            return Err(StatisticsError::EmptyHistogram);
        }
        let (min, max) = values
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| {
                (lo.min(*v), hi.max(*v))
            });
        let mut hist = Self::new(min, max, num_bins);
        hist.add_values(values);
        Ok(hist)
    }

    pub fn num_bins(&self) -> usize {
        self.counts.len()
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    pub fn min(&self) -> f32 {
        self.min
    }

    pub fn max(&self) -> f32 {
        self.max
    }

    pub fn bin_width(&self) -> f32 {
        (self.max - self.min) / self.counts.len() as f32
    }

    pub fn bin_index(&self, value: f32) -> usize {
        let width = self.bin_width();
        if width <= 0.0 || value <= self.min {
            return 0;
        }
        (((value - self.min) / width) as usize).min(self.counts.len() - 1)
    }

    pub fn bin_centers(&self) -> Vec<f32> {
        let width = self.bin_width();
        (0..self.counts.len())
            .map(|i| self.min + width * (i as f32 + 0.5))
            .collect()
    }

    /// Counts values, the ones outside the range land in the border bins.
    pub fn add_values(&mut self, values: &[f32]) {
        for v in values {
            let idx = self.bin_index(*v);
            self.counts[idx] += 1;
        }
    }

    pub fn merge(&mut self, other: &Histogram) -> Result<(), StatisticsError> {
        if self.min != other.min || self.max != other.max || self.num_bins() != other.num_bins() {
            return Err(StatisticsError::IncompatibleHistograms);
        }
        self.counts
            .iter_mut()
            .zip(other.counts.iter())
            .for_each(|(a, b)| *a += b);
        Ok(())
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    pub fn mean(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        self.bin_centers()
            .iter()
            .zip(self.counts.iter())
            .map(|(c, n)| *c as f64 * *n as f64)
            .sum::<f64>()
            / total as f64
    }

    pub fn std_dev(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        let mean = self.mean();
        let var = self
            .bin_centers()
            .iter()
            .zip(self.counts.iter())
            .map(|(c, n)| (*c as f64 - mean).powi(2) * *n as f64)
            .sum::<f64>()
            / total as f64;
        var.sqrt()
    }

    /// Removes the bins whose centre has a z-score above `z`. Infinite `z` keeps everything.
    pub fn z_filtered(&self, z: f32) -> Histogram {
        if !z.is_finite() {
            return self.clone();
        }
        let (mean, std) = (self.mean(), self.std_dev());
        if std == 0.0 {
            return self.clone();
        }
        let counts = self
            .bin_centers()
            .iter()
            .zip(self.counts.iter())
            .map(|(c, n)| {
                if ((*c as f64 - mean) / std).abs() > z as f64 {
                    0
                } else {
                    *n
                }
            })
            .collect();
        Histogram {
            min: self.min,
            max: self.max,
            counts,
        }
    }

    /// Histogram of `x + shift` for the values counted in `self`.
    pub fn shifted(&self, shift: f32) -> Histogram {
        Histogram {
            min: self.min + shift,
            max: self.max + shift,
            counts: self.counts.clone(),
        }
    }

    /// Smallest and largest edge of the non empty bins.
    pub fn extent(&self) -> Option<(f32, f32)> {
        let first = self.counts.iter().position(|n| *n > 0)?;
        let last = self.counts.iter().rposition(|n| *n > 0)?;
        let width = self.bin_width();
        let lo = self.min + width * first as f32;
        let hi = (self.min + width * (last + 1) as f32).min(self.max);
        Some((lo, hi))
    }

    /// Largest absolute value covered by the non empty bins, 0 for an empty histogram.
    pub fn max_abs(&self) -> f32 {
        self.extent()
            .map(|(lo, hi)| lo.abs().max(hi.abs()))
            .unwrap_or(0.0)
    }
}
