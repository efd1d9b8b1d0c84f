use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    config::{QuantizationConfig, QuantizationErrorMethod},
    tensor::Tensor,
};

use super::{QuantizationGrid, QuantizationMethod, quantize_values};

/// Platform level policy for one weight attribute, before any threshold is known.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttributeQuantizationConfig {
    pub weights_quantization_method: QuantizationMethod,
    pub weights_n_bits: usize,
    pub weights_per_channel_threshold: bool,
    pub enable_weights_quantization: bool,
}

impl AttributeQuantizationConfig {
    /// Attribute that is kept in float.
    pub fn disabled() -> Self {
        Self {
            weights_quantization_method: QuantizationMethod::PowerOfTwo,
            weights_n_bits: 32,
            weights_per_channel_threshold: false,
            enable_weights_quantization: false,
        }
    }

    pub fn from_config(qc: &QuantizationConfig) -> Self {
        Self {
            weights_quantization_method: qc.weights_quantization_method,
            weights_n_bits: qc.weights_n_bits,
            weights_per_channel_threshold: qc.weights_per_channel_threshold,
            enable_weights_quantization: true,
        }
    }
}

impl Default for AttributeQuantizationConfig {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Final quantization decision for one weight attribute of a node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WeightsAttrQuantizationConfig {
    pub method: QuantizationMethod,
    pub n_bits: usize,
    pub per_channel: bool,
    pub enabled: bool,
    pub error_method: QuantizationErrorMethod,
    pub l_p_value: u32,
    /// One threshold per output channel, or a single one when not per-channel. Empty until
    /// the threshold search ran.
    pub threshold: Vec<f32>,
}

impl WeightsAttrQuantizationConfig {
    pub fn new(attr_cfg: AttributeQuantizationConfig, qc: &QuantizationConfig) -> Self {
        Self {
            method: attr_cfg.weights_quantization_method,
            n_bits: attr_cfg.weights_n_bits,
            per_channel: attr_cfg.weights_per_channel_threshold,
            enabled: attr_cfg.enable_weights_quantization,
            error_method: qc.weights_error_method,
            l_p_value: qc.l_p_value,
            threshold: Vec::new(),
        }
    }

    /// Config of an attribute that is never quantized.
    pub fn disabled() -> Self {
        let attr = AttributeQuantizationConfig::disabled();
        Self {
            method: attr.weights_quantization_method,
            n_bits: attr.weights_n_bits,
            per_channel: false,
            enabled: false,
            error_method: QuantizationErrorMethod::NoClipping,
            l_p_value: 2,
            threshold: Vec::new(),
        }
    }

    pub fn with_threshold(self, threshold: Vec<f32>) -> Self {
        Self { threshold, ..self }
    }

    /// Simulated quantization of the attribute value. Disabled attributes, or ones without a
    /// threshold yet, are returned unchanged.
    pub fn quantize(&self, weights: &Tensor) -> Tensor {
        if !self.enabled || self.threshold.is_empty() {
            return weights.clone();
        }
        Tensor::new(
            weights.get_shape(),
            quantize_values(weights.get_data(), &self.threshold, self.n_bits, true),
        )
    }
}

/// Per-node weights decision: a config per attribute plus the bias correction term computed
/// from calibration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeWeightsQuantizationConfig {
    attrs: BTreeMap<String, WeightsAttrQuantizationConfig>,
    /// Term subtracted from the bias to compensate the expected kernel quantization error.
    pub bias_corrected: Option<Tensor>,
    /// The node's correction is folded into a second-moment correction instead of the bias.
    pub weights_second_moment_correction: bool,
    /// Set once the term has been folded into the bias.
    #[serde(default)]
    pub bias_correction_applied: bool,
}

impl NodeWeightsQuantizationConfig {
    pub fn new(weights_second_moment_correction: bool) -> Self {
        Self {
            attrs: BTreeMap::new(),
            bias_corrected: None,
            weights_second_moment_correction,
            bias_correction_applied: false,
        }
    }

    pub fn set_attr_config<S: Into<String>>(&mut self, attr: S, cfg: WeightsAttrQuantizationConfig) {
        self.attrs.insert(attr.into(), cfg);
    }

    pub fn attr_config(&self, attr: &str) -> Option<&WeightsAttrQuantizationConfig> {
        self.attrs.get(attr)
    }

    pub fn attr_config_mut(&mut self, attr: &str) -> Option<&mut WeightsAttrQuantizationConfig> {
        self.attrs.get_mut(attr)
    }

    pub fn has_attr_config(&self, attr: &str) -> bool {
        self.attrs.contains_key(attr)
    }

    pub fn attrs(&self) -> impl Iterator<Item = (&String, &WeightsAttrQuantizationConfig)> {
        self.attrs.iter()
    }

    pub fn rename_attr(&mut self, from: &str, to: &str) {
        if let Some(cfg) = self.attrs.remove(from) {
            self.attrs.insert(to.to_string(), cfg);
        }
    }

    /// True when a non empty correction term is present.
    pub fn has_bias_correction(&self) -> bool {
        self.bias_corrected
            .as_ref()
            .is_some_and(|term| !term.is_empty())
    }

    /// The bias correction pass must rewrite this node: a term is waiting to be applied and
    /// the node is not handled by the second-moment correction.
    pub fn needs_bias_correction(&self) -> bool {
        self.has_bias_correction()
            && !self.weights_second_moment_correction
            && !self.bias_correction_applied
    }
}

/// Final activation quantization decision of a node's output.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeActivationQuantizationConfig {
    pub method: QuantizationMethod,
    pub n_bits: usize,
    pub enabled: bool,
    pub signed: bool,
    pub error_method: QuantizationErrorMethod,
    pub threshold: Option<f32>,
}

impl NodeActivationQuantizationConfig {
    pub fn new(qc: &QuantizationConfig, enabled: bool) -> Self {
        Self {
            method: qc.activation_quantization_method,
            n_bits: qc.activation_n_bits,
            enabled,
            signed: true,
            error_method: qc.activation_error_method,
            threshold: None,
        }
    }

    pub fn grid(&self) -> Option<QuantizationGrid> {
        self.threshold
            .filter(|_| self.enabled)
            .map(|t| QuantizationGrid::new(t, self.n_bits, self.signed))
    }

    /// Simulated quantization of an activation tensor, identity when disabled.
    pub fn quantize(&self, activation: &Tensor) -> Tensor {
        match self.grid() {
            Some(grid) => activation.map(|v| grid.quantize(v)),
            None => activation.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attr_configs() {
        let qc = QuantizationConfig::default();
        let mut cfg = NodeWeightsQuantizationConfig::new(false);
        assert!(!cfg.has_bias_correction());
        cfg.bias_corrected = Some(Tensor::from_vec(vec![]));
        assert!(!cfg.has_bias_correction());
        cfg.bias_corrected = Some(Tensor::from_vec(vec![0.1]));
        assert!(cfg.has_bias_correction());

        let attr = AttributeQuantizationConfig::from_config(&qc);
        let kernel = WeightsAttrQuantizationConfig::new(attr, &qc).with_threshold(vec![1.0]);
        cfg.set_attr_config("kernel", kernel);
        cfg.set_attr_config("bias", WeightsAttrQuantizationConfig::disabled());
        assert!(cfg.attr_config("kernel").unwrap().enabled);
        assert!(!cfg.attr_config("bias").unwrap().enabled);
        assert!(cfg.attr_config("gamma").is_none());

        let w = Tensor::from_vec(vec![0.3, -2.0]);
        let q = cfg.attr_config("kernel").unwrap().quantize(&w);
        assert_eq!(q.get_data()[1], -1.0);
        assert_eq!(cfg.attr_config("bias").unwrap().quantize(&w), w);
    }

    #[test]
    fn test_activation_config() {
        let qc = QuantizationConfig::default();
        let mut cfg = NodeActivationQuantizationConfig::new(&qc, true);
        let t = Tensor::from_vec(vec![-3.0, 0.26, 5.0]);
        assert_eq!(cfg.quantize(&t), t);
        cfg.threshold = Some(4.0);
        cfg.signed = false;
        let q = cfg.quantize(&t);
        assert_eq!(q.get_data()[0], 0.0);
        assert_eq!(q.get_data()[2], 4.0 - 4.0 / 256.0);
        cfg.enabled = false;
        assert_eq!(cfg.quantize(&t), t);
    }
}
