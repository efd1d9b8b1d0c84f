use quantkit::{
    QuantizationGrid, QuantizationMethod, Tensor,
    quantization::{MIN_THRESHOLD, WeightsAttrQuantizationConfig, quantize_values},
};
use serde::{Deserialize, Serialize};

use crate::{
    QatError, QuantizerGradients, TrainableQuantizer, check_gradient_shape,
    ste::{ste_clip_mask, ste_round},
};

/// Weight quantizer with thresholds fixed by calibration: one per output channel, or a single
/// one for the whole tensor. Weights are always quantized signed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SteWeightQuantizer {
    method: QuantizationMethod,
    n_bits: usize,
    thresholds: Vec<f32>,
}

impl SteWeightQuantizer {
    /// Thresholds are constrained by `method`: power-of-two mode rounds them up.
    pub fn new(method: QuantizationMethod, n_bits: usize, thresholds: Vec<f32>) -> Self {
        let thresholds = thresholds
            .into_iter()
            .map(|t| method.constrain(t, MIN_THRESHOLD))
            .collect();
        Self {
            method,
            n_bits,
            thresholds,
        }
    }

    /// Quantizer of an attribute selected for quantization, `None` when the attribute is kept
    /// in float.
    pub fn from_config(cfg: &WeightsAttrQuantizationConfig) -> Option<Self> {
        (cfg.enabled && !cfg.threshold.is_empty())
            .then(|| Self::new(cfg.method, cfg.n_bits, cfg.threshold.clone()))
    }

    pub fn method(&self) -> QuantizationMethod {
        self.method
    }

    pub fn n_bits(&self) -> usize {
        self.n_bits
    }

    pub fn is_per_channel(&self) -> bool {
        self.thresholds.len() > 1
    }

    fn integer_range(&self) -> (f32, f32) {
        let grid = QuantizationGrid::new(1.0, self.n_bits, true);
        (grid.min_int(), grid.max_int())
    }

    fn channel_len(&self, input: &Tensor) -> Result<usize, QatError> {
        let channels = self.thresholds.len();
        if channels == 0 || input.len() % channels != 0 {
            return Err(QatError::ThresholdCount {
                expected: input.num_channels(),
                got: channels,
            });
        }
        Ok((input.len() / channels).max(1))
    }
}

impl TrainableQuantizer for SteWeightQuantizer {
    fn forward(&self, input: &Tensor) -> Tensor {
        Tensor::new(
            input.get_shape(),
            quantize_values(input.get_data(), &self.thresholds, self.n_bits, true),
        )
    }

    /// The clip is applied to `round(x / step)`, so a value that rounds onto the grid keeps
    /// its gradient even when it lies slightly outside `[min_int * step, max_int * step]`.
    fn backward(
        &self,
        input: &Tensor,
        grad_output: &Tensor,
    ) -> Result<QuantizerGradients, QatError> {
        check_gradient_shape(input, grad_output)?;
        let channel_len = self.channel_len(input)?;
        let scaled = input
            .get_data()
            .chunks(channel_len)
            .zip(self.thresholds.iter())
            .flat_map(|(values, t)| {
                let step = QuantizationGrid::new(*t, self.n_bits, true).step();
                values.iter().map(move |v| v / step)
            })
            .collect();
        let integers = ste_round(&Tensor::new(input.get_shape(), scaled));
        let (min_int, max_int) = self.integer_range();
        let mask = ste_clip_mask(&integers, min_int, max_int);
        let grad = grad_output
            .get_data()
            .iter()
            .zip(mask.get_data())
            .map(|(g, m)| g * m)
            .collect();
        Ok(QuantizerGradients {
            input: Tensor::new(input.get_shape(), grad),
            threshold: None,
        })
    }

    fn thresholds(&self) -> Vec<f32> {
        self.thresholds.clone()
    }

    fn is_trainable(&self) -> bool {
        false
    }
}
