//! Module that takes care of choosing how every tensor of the graph is quantized: the shared
//! threshold arithmetic, the per-node configuration and the threshold search.
mod bias_correction_terms;
mod error_functions;
mod node_config;
mod set_node_config;
mod threshold;

use serde::{Deserialize, Serialize};
use tracing::trace;

pub use bias_correction_terms::compute_bias_correction_terms;
pub use error_functions::{kl_divergence_error, weighted_error};
pub use node_config::{
    AttributeQuantizationConfig, NodeActivationQuantizationConfig, NodeWeightsQuantizationConfig,
    WeightsAttrQuantizationConfig,
};
pub use set_node_config::set_quantization_configs;
pub use threshold::{
    HessianScores, NoHessianScores, StaticHessianScores, ThresholdSearch, N_ITER,
    SYMMETRIC_GRID_SIZE,
};

/// Smallest threshold the library will ever select, 2^-16.
pub const MIN_THRESHOLD: f32 = 1.0 / 65536.0;

/// How the quantization range is constrained.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantizationMethod {
    /// Symmetric range whose threshold is a power of two, dequantization is a shift.
    #[default]
    PowerOfTwo,
    /// Symmetric range with an arbitrary threshold.
    Symmetric,
}

impl QuantizationMethod {
    /// Adjusts a candidate threshold to what the method can represent.
    pub fn constrain(&self, threshold: f32, min_threshold: f32) -> f32 {
        match self {
            QuantizationMethod::PowerOfTwo => power_of_two_threshold(threshold, min_threshold),
            QuantizationMethod::Symmetric => threshold.max(min_threshold),
        }
    }
}

/// Rounds `threshold` up to the nearest power of two, never below `min_threshold`. The result
/// is always >= the input so the quantization range keeps covering the observed data.
pub fn power_of_two_threshold(threshold: f32, min_threshold: f32) -> f32 {
    let t = if threshold.is_finite() {
        threshold.max(min_threshold)
    } else {
        min_threshold
    };
    let mut pot = 2f32.powf(t.log2().ceil());
    // log2 of values right above a power of two can round down
    while pot < t {
        pot *= 2.0;
    }
    pot
}

pub fn is_power_of_two(value: f32) -> bool {
    value > 0.0 && value.is_finite() && value.log2().fract() == 0.0
}

/// The integer grid implied by a threshold: `levels = 2^(n_bits - signed)`,
/// `step = threshold / levels`, integers in `[min_int, max_int]`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuantizationGrid {
    pub threshold: f32,
    pub n_bits: usize,
    pub signed: bool,
}

impl QuantizationGrid {
    pub fn new(threshold: f32, n_bits: usize, signed: bool) -> Self {
        Self {
            threshold,
            n_bits,
            signed,
        }
    }

    pub fn levels(&self) -> f32 {
        2f32.powi((self.n_bits - self.signed as usize) as i32)
    }

    pub fn step(&self) -> f32 {
        self.threshold / self.levels()
    }

    pub fn min_int(&self) -> f32 {
        if self.signed { -self.levels() } else { 0.0 }
    }

    pub fn max_int(&self) -> f32 {
        self.levels() - 1.0
    }

    /// Float interval that is representable without clipping.
    pub fn range(&self) -> (f32, f32) {
        (self.min_int() * self.step(), self.max_int() * self.step())
    }

    /// Integer representation of `value`.
    pub fn quantize_int(&self, value: f32) -> f32 {
        (value / self.step())
            .round()
            .clamp(self.min_int(), self.max_int())
    }

    /// Simulated quantization: quantize then dequantize.
    pub fn quantize(&self, value: f32) -> f32 {
        self.quantize_int(value) * self.step()
    }

    pub fn quantize_slice(&self, values: &[f32]) -> Vec<f32> {
        values.iter().map(|v| self.quantize(*v)).collect()
    }
}

/// Simulated quantization of a tensor with one threshold per leading-axis channel (or a single
/// threshold broadcast over the whole tensor).
pub fn quantize_values(
    values: &[f32],
    thresholds: &[f32],
    n_bits: usize,
    signed: bool,
) -> Vec<f32> {
    if thresholds.is_empty() {
        return values.to_vec();
    }
    let channel_len = (values.len() / thresholds.len()).max(1);
    trace!(
        "quantizing {} values over {} channel(s)",
        values.len(),
        thresholds.len()
    );
    values
        .chunks(channel_len)
        .zip(thresholds.iter().cycle())
        .flat_map(|(chunk, t)| QuantizationGrid::new(*t, n_bits, signed).quantize_slice(chunk))
        .collect()
}
