//! Global quantization policy. A [`QuantizationConfig`] is built once per run, validated before
//! any graph is touched, and then only read by the stages of the pipeline.

use std::{
    collections::{BTreeMap, BTreeSet},
    env,
};

use derive_more::Display;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::quantization::{MIN_THRESHOLD, QuantizationMethod};

/// Process wide default bit width of weights and activations, read once from
/// `QUANTKIT_BIT_LEN`. Falls back to 8 bits when the variable is unset or not a number.
pub static BIT_LEN: Lazy<usize> = Lazy::new(|| {
    env::var("QUANTKIT_BIT_LEN")
        .ok()
        .and_then(|val| val.parse::<usize>().ok())
        .unwrap_or(8)
});

/// Range of supported bit widths, for both weights and activations.
pub const MIN_N_BITS: usize = 2;
pub const MAX_N_BITS: usize = 16;

/// Default configuration used when the caller does not provide one.
pub static DEFAULT_CONFIG: Lazy<QuantizationConfig> = Lazy::new(QuantizationConfig::default);

/// Objective used by the threshold search.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QuantizationErrorMethod {
    /// Use the observed maximum absolute value as threshold.
    #[display("NOCLIPPING")]
    NoClipping,
    /// Minimize the mean squared quantization error.
    #[display("MSE")]
    Mse,
    /// Minimize the mean absolute quantization error.
    #[display("MAE")]
    Mae,
    /// Minimize the KL-divergence between the float and the quantized distributions.
    #[display("KL")]
    Kl,
    /// Minimize the Lp-norm of the quantization error, `p` is `l_p_value`.
    #[display("LP")]
    Lp,
    /// Hessian-weighted squared error, parameters with larger loss sensitivity weigh more.
    #[display("HMSE")]
    Hmse,
}

/// A set of framework operators grouped under a custom opset name, together with the
/// translation of the general attribute names (e.g. `kernel`) into the framework ones
/// (e.g. `weight`).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomOpsetLayers {
    pub operators: Vec<String>,
    #[serde(default)]
    pub attr_mapping: BTreeMap<String, String>,
}

impl CustomOpsetLayers {
    pub fn new<S: Into<String>>(operators: impl IntoIterator<Item = S>) -> Self {
        Self {
            operators: operators.into_iter().map(Into::into).collect(),
            attr_mapping: BTreeMap::new(),
        }
    }

    pub fn with_attr<S: Into<String>>(mut self, general: S, framework: S) -> Self {
        self.attr_mapping.insert(general.into(), framework.into());
        self
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("invalid {target} bit width {n_bits}, expected a value in [{MIN_N_BITS}, {MAX_N_BITS}]")]
    InvalidBitWidth { target: &'static str, n_bits: usize },
    #[error("minimum threshold must be finite and positive, got {0}")]
    InvalidMinThreshold(f32),
    #[error("invalid value {value} for {name}: {reason}")]
    InvalidValue {
        name: &'static str,
        value: f32,
        reason: &'static str,
    },
    #[error("{flag} requires {requires} to be enabled")]
    ConflictingFlags {
        flag: &'static str,
        requires: &'static str,
    },
    #[error("operator {operator} is mapped to both custom opsets {first} and {second}")]
    ConflictingOpsetMapping {
        operator: String,
        first: String,
        second: String,
    },
    #[error("cannot parse quantization config: {0}")]
    Parse(String),
}

/// Encapsulates all the parameters used to quantize a model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantizationConfig {
    pub activation_error_method: QuantizationErrorMethod,
    pub weights_error_method: QuantizationErrorMethod,
    pub activation_quantization_method: QuantizationMethod,
    pub weights_quantization_method: QuantizationMethod,
    pub activation_n_bits: usize,
    pub weights_n_bits: usize,
    pub weights_per_channel_threshold: bool,
    /// Floor applied to every selected threshold.
    pub min_threshold: f32,
    pub relu_bound_to_power_of_2: bool,
    pub weights_bias_correction: bool,
    pub weights_second_moment_correction: bool,
    pub input_scaling: bool,
    pub softmax_shift: bool,
    pub shift_negative_activation_correction: bool,
    pub activation_channel_equalization: bool,
    /// Z-score above which activation values are treated as outliers. `null` in JSON means
    /// no filtering.
    #[serde(with = "infinite_as_null")]
    pub z_threshold: f32,
    pub l_p_value: u32,
    pub linear_collapsing: bool,
    pub residual_collapsing: bool,
    pub shift_negative_ratio: f32,
    pub shift_negative_threshold_recalculation: bool,
    pub shift_negative_params_search: bool,
    pub concat_threshold_update: bool,
    pub activation_bias_correction: bool,
    pub activation_bias_correction_threshold: f32,
    pub custom_tpc_opset_to_layer: Option<BTreeMap<String, CustomOpsetLayers>>,
}

impl Default for QuantizationConfig {
    fn default() -> Self {
        Self {
            activation_error_method: QuantizationErrorMethod::Mse,
            weights_error_method: QuantizationErrorMethod::Mse,
            activation_quantization_method: QuantizationMethod::PowerOfTwo,
            weights_quantization_method: QuantizationMethod::PowerOfTwo,
            activation_n_bits: *BIT_LEN,
            weights_n_bits: *BIT_LEN,
            weights_per_channel_threshold: true,
            min_threshold: MIN_THRESHOLD,
            relu_bound_to_power_of_2: false,
            weights_bias_correction: true,
            weights_second_moment_correction: false,
            input_scaling: false,
            softmax_shift: false,
            shift_negative_activation_correction: true,
            activation_channel_equalization: false,
            z_threshold: f32::INFINITY,
            l_p_value: 2,
            linear_collapsing: true,
            residual_collapsing: true,
            shift_negative_ratio: 0.05,
            shift_negative_threshold_recalculation: false,
            shift_negative_params_search: false,
            concat_threshold_update: false,
            activation_bias_correction: false,
            activation_bias_correction_threshold: 0.0,
            custom_tpc_opset_to_layer: None,
        }
    }
}

impl QuantizationConfig {
    /// Parses a (possibly partial) JSON document, missing fields take their default value.
    /// The result is validated.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Checks the configuration for invalid or contradicting values. Must succeed before any
    /// stage of the pipeline runs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (target, n_bits) in [
            ("weights", self.weights_n_bits),
            ("activation", self.activation_n_bits),
        ] {
            if !(MIN_N_BITS..=MAX_N_BITS).contains(&n_bits) {
                return Err(ConfigError::InvalidBitWidth { target, n_bits });
            }
        }
        if !self.min_threshold.is_finite() || self.min_threshold <= 0.0 {
            return Err(ConfigError::InvalidMinThreshold(self.min_threshold));
        }
        if self.l_p_value < 1 {
            return Err(ConfigError::InvalidValue {
                name: "l_p_value",
                value: self.l_p_value as f32,
                reason: "the norm exponent must be at least 1",
            });
        }
        if !(0.0..=1.0).contains(&self.shift_negative_ratio) {
            return Err(ConfigError::InvalidValue {
                name: "shift_negative_ratio",
                value: self.shift_negative_ratio,
                reason: "must lie in [0, 1]",
            });
        }
        if self.z_threshold.is_nan() || self.z_threshold <= 0.0 {
            return Err(ConfigError::InvalidValue {
                name: "z_threshold",
                value: self.z_threshold,
                reason: "must be positive",
            });
        }
        if self.activation_bias_correction_threshold.is_nan()
            || self.activation_bias_correction_threshold < 0.0
        {
            return Err(ConfigError::InvalidValue {
                name: "activation_bias_correction_threshold",
                value: self.activation_bias_correction_threshold,
                reason: "must be non negative",
            });
        }
        if !self.shift_negative_activation_correction {
            if self.shift_negative_params_search {
                return Err(ConfigError::ConflictingFlags {
                    flag: "shift_negative_params_search",
                    requires: "shift_negative_activation_correction",
                });
            }
            if self.shift_negative_threshold_recalculation {
                return Err(ConfigError::ConflictingFlags {
                    flag: "shift_negative_threshold_recalculation",
                    requires: "shift_negative_activation_correction",
                });
            }
        }
        if let Some(custom) = &self.custom_tpc_opset_to_layer {
            let mut seen: BTreeMap<&str, &str> = BTreeMap::new();
            for (opset, layers) in custom {
                let unique = layers.operators.iter().collect::<BTreeSet<_>>();
                for operator in unique {
                    if let Some(first) = seen.insert(operator.as_str(), opset.as_str()) {
                        return Err(ConfigError::ConflictingOpsetMapping {
                            operator: operator.clone(),
                            first: first.to_string(),
                            second: opset.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

/// JSON has no representation for infinity, store it as `null`.
mod infinite_as_null {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f32, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_infinite() {
            serializer.serialize_none()
        } else {
            serializer.serialize_some(value)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f32, D::Error> {
        Ok(Option::<f32>::deserialize(deserializer)?.unwrap_or(f32::INFINITY))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_default_config() {
        let qc = &*DEFAULT_CONFIG;
        assert_eq!(qc.weights_error_method, QuantizationErrorMethod::Mse);
        assert_eq!(qc.activation_error_method, QuantizationErrorMethod::Mse);
        assert!(qc.weights_bias_correction);
        assert!(!qc.weights_second_moment_correction);
        assert!(qc.z_threshold.is_infinite());
        qc.validate().unwrap();
    }

    #[rstest]
    #[case::zero_bits(QuantizationConfig { weights_n_bits: 0, ..Default::default() })]
    #[case::too_many_bits(QuantizationConfig { activation_n_bits: 33, ..Default::default() })]
    #[case::zero_floor(QuantizationConfig { min_threshold: 0.0, ..Default::default() })]
    #[case::nan_floor(QuantizationConfig { min_threshold: f32::NAN, ..Default::default() })]
    #[case::ratio(QuantizationConfig { shift_negative_ratio: 1.5, ..Default::default() })]
    #[case::lp(QuantizationConfig { l_p_value: 0, ..Default::default() })]
    #[case::search_without_snc(QuantizationConfig {
        shift_negative_activation_correction: false,
        shift_negative_params_search: true,
        ..Default::default()
    })]
    fn test_invalid_configs(#[case] qc: QuantizationConfig) {
        assert!(qc.validate().is_err());
    }

    #[test]
    fn test_conflicting_custom_opsets() {
        let mut custom = BTreeMap::new();
        custom.insert("A".to_string(), CustomOpsetLayers::new(["Linear"]));
        custom.insert("B".to_string(), CustomOpsetLayers::new(["Conv2d", "Linear"]));
        let qc = QuantizationConfig {
            custom_tpc_opset_to_layer: Some(custom),
            ..Default::default()
        };
        assert!(matches!(
            qc.validate(),
            Err(ConfigError::ConflictingOpsetMapping { .. })
        ));
    }

    #[test]
    fn test_partial_json() {
        let qc = QuantizationConfig::from_json(
            r#"{ "weights_error_method": "NOCLIPPING", "relu_bound_to_power_of_2": true }"#,
        )
        .unwrap();
        assert_eq!(qc.weights_error_method, QuantizationErrorMethod::NoClipping);
        assert!(qc.relu_bound_to_power_of_2);
        assert_eq!(qc.activation_error_method, QuantizationErrorMethod::Mse);

        let json = qc.to_json().unwrap();
        let back = QuantizationConfig::from_json(&json).unwrap();
        assert_eq!(back, qc);
        assert!(QuantizationConfig::from_json(r#"{ "weights_n_bits": 1 }"#).is_err());
    }
}
