use quantkit::{
    QuantizationGrid, QuantizationMethod, Tensor,
    quantization::{MIN_THRESHOLD, NodeActivationQuantizationConfig},
};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{QatError, QuantizerGradients, TrainableQuantizer, check_gradient_shape};

/// Activation quantizer whose threshold is trained with the network. The stored threshold is
/// the raw trainable value; forward and backward use its constrained version.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SteActivationQuantizer {
    method: QuantizationMethod,
    n_bits: usize,
    signed: bool,
    threshold: f32,
    min_threshold: f32,
}

impl SteActivationQuantizer {
    pub fn new(method: QuantizationMethod, n_bits: usize, signed: bool, threshold: f32) -> Self {
        Self {
            method,
            n_bits,
            signed,
            threshold: threshold.max(MIN_THRESHOLD),
            min_threshold: MIN_THRESHOLD,
        }
    }

    pub fn with_min_threshold(self, min_threshold: f32) -> Self {
        Self {
            min_threshold,
            threshold: self.threshold.max(min_threshold),
            ..self
        }
    }

    /// Quantizer initialised from the calibrated activation config, `None` when the
    /// activation is not quantized.
    pub fn from_config(cfg: &NodeActivationQuantizationConfig) -> Option<Self> {
        let threshold = cfg.threshold.filter(|_| cfg.enabled)?;
        Some(Self::new(cfg.method, cfg.n_bits, cfg.signed, threshold))
    }

    /// Raw trainable threshold.
    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn signed(&self) -> bool {
        self.signed
    }

    fn grid(&self) -> QuantizationGrid {
        QuantizationGrid::new(
            self.method.constrain(self.threshold, self.min_threshold),
            self.n_bits,
            self.signed,
        )
    }

    /// One gradient descent step on the threshold, which never goes below the floor.
    /// Returns the updated threshold.
    pub fn apply_gradient(&mut self, learning_rate: f32, grad: f32) -> f32 {
        let updated = self.threshold - learning_rate * grad;
        self.threshold = if updated.is_finite() {
            updated.max(self.min_threshold)
        } else {
            self.min_threshold
        };
        trace!("activation threshold updated to {}", self.threshold);
        self.threshold
    }
}

impl TrainableQuantizer for SteActivationQuantizer {
    fn forward(&self, input: &Tensor) -> Tensor {
        let grid = self.grid();
        input.map(|v| grid.quantize(v))
    }

    /// With `q = step * clip(round(x / step))` and `step = threshold / levels`, rounding taken
    /// as the identity gives `dq/dthreshold = (round(x / step) - x / step) / levels` inside the
    /// range and `clip_bound / levels` outside of it. The constraint applied to the threshold
    /// is also treated as the identity.
    fn backward(
        &self,
        input: &Tensor,
        grad_output: &Tensor,
    ) -> Result<QuantizerGradients, QatError> {
        check_gradient_shape(input, grad_output)?;
        let grid = self.grid();
        let (step, levels) = (grid.step(), grid.levels());
        let (min_int, max_int) = (grid.min_int(), grid.max_int());
        let mut threshold_grad = 0f32;
        let input_grad = input
            .get_data()
            .iter()
            .zip(grad_output.get_data())
            .map(|(x, g)| {
                let scaled = x / step;
                let rounded = scaled.round();
                if rounded < min_int {
                    threshold_grad += g * min_int / levels;
                    0.0
                } else if rounded > max_int {
                    threshold_grad += g * max_int / levels;
                    0.0
                } else {
                    threshold_grad += g * (rounded - scaled) / levels;
                    *g
                }
            })
            .collect();
        Ok(QuantizerGradients {
            input: Tensor::new(input.get_shape(), input_grad),
            threshold: Some(vec![threshold_grad]),
        })
    }

    fn thresholds(&self) -> Vec<f32> {
        vec![self.grid().threshold]
    }

    fn is_trainable(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use quantkit::QuantizationConfig;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(QuantizationMethod::PowerOfTwo, 3.0, 4.0)]
    #[case(QuantizationMethod::Symmetric, 3.0, 3.0)]
    fn test_constrained_threshold(
        #[case] method: QuantizationMethod,
        #[case] raw: f32,
        #[case] effective: f32,
    ) {
        let quantizer = SteActivationQuantizer::new(method, 8, false, raw);
        assert_eq!(quantizer.threshold(), raw);
        assert_eq!(quantizer.thresholds(), vec![effective]);
        assert!(quantizer.is_trainable());
    }

    #[test]
    fn test_unsigned_forward_and_mask() {
        // 2 bits unsigned, threshold 2: step 0.5, integers in [0, 3]
        let quantizer = SteActivationQuantizer::new(QuantizationMethod::PowerOfTwo, 2, false, 2.0);
        let input = Tensor::from_vec(vec![-0.3, 0.6, 1.4, 2.5]);
        assert_eq!(quantizer.forward(&input).get_data(), &[0.0, 0.5, 1.5, 1.5]);
        let grads = quantizer
            .backward(&input, &Tensor::from_vec(vec![1.0; 4]))
            .unwrap();
        assert_eq!(grads.input.get_data(), &[0.0, 1.0, 1.0, 0.0]);
        // -0.3 rounds to -1, below the range: 0 / 4; 0.6 -> (1 - 1.2) / 4;
        // 1.4 -> (3 - 2.8) / 4; 2.5 clipped at 3 / 4
        let expected = 0.0 + (1.0 - 1.2) / 4.0 + (3.0 - 2.8) / 4.0 + 3.0 / 4.0;
        let got = grads.threshold.unwrap()[0];
        assert!((got - expected).abs() < 1e-5, "{got} != {expected}");
    }

    #[test]
    fn test_threshold_gradient_matches_finite_differences() {
        // symmetric method so the forward is differentiable in the threshold between jumps
        let quantizer = SteActivationQuantizer::new(QuantizationMethod::Symmetric, 4, true, 1.0);
        // values beyond the range only: q = threshold * bound / levels is linear in threshold
        let input = Tensor::from_vec(vec![3.0, -4.0]);
        let grad_out = Tensor::from_vec(vec![1.0, 1.0]);
        let analytic = quantizer
            .backward(&input, &grad_out)
            .unwrap()
            .threshold
            .unwrap()[0];
        let eps = 1e-2;
        let loss = |t: f32| -> f32 {
            let q = SteActivationQuantizer::new(QuantizationMethod::Symmetric, 4, true, t);
            q.forward(&input).get_data().iter().sum()
        };
        let numeric = (loss(1.0 + eps) - loss(1.0 - eps)) / (2.0 * eps);
        assert!((analytic - numeric).abs() < 1e-3, "{analytic} != {numeric}");
    }

    #[test]
    fn test_apply_gradient_keeps_floor() {
        let mut quantizer =
            SteActivationQuantizer::new(QuantizationMethod::PowerOfTwo, 8, true, 1.0)
                .with_min_threshold(0.25);
        assert!((quantizer.apply_gradient(0.1, 2.0) - 0.8).abs() < 1e-6);
        assert_eq!(quantizer.apply_gradient(1.0, 10.0), 0.25);
        assert_eq!(quantizer.apply_gradient(1.0, f32::NAN), 0.25);
    }

    #[test]
    fn test_from_config() {
        let qc = QuantizationConfig::default();
        let mut cfg = NodeActivationQuantizationConfig::new(&qc, true);
        assert!(SteActivationQuantizer::from_config(&cfg).is_none());
        cfg.threshold = Some(4.0);
        cfg.signed = false;
        let quantizer = SteActivationQuantizer::from_config(&cfg).unwrap();
        assert!(!quantizer.signed());
        assert_eq!(quantizer.thresholds(), vec![4.0]);
        cfg.enabled = false;
        assert!(SteActivationQuantizer::from_config(&cfg).is_none());
    }
}
