use std::collections::BTreeMap;

use derive_more::{Display, From};
use serde::{Deserialize, Serialize};

use crate::{
    quantization::{NodeActivationQuantizationConfig, NodeWeightsQuantizationConfig},
    tensor::{Padding, Shape, Tensor},
};

use super::{GraphError, NodeId};

/// General name of the kernel attribute of linear nodes.
pub const KERNEL_ATTR: &str = "kernel";
/// General name of the bias attribute of linear nodes.
pub const BIAS_ATTR: &str = "bias";

/// Non linear element-wise activations.
#[derive(Clone, Copy, Debug, Display, PartialEq, Serialize, Deserialize)]
pub enum ActivationKind {
    Swish,
    Gelu,
    Hardswish,
    Elu,
    Selu,
    #[display("LeakyRelu({alpha})")]
    LeakyRelu {
        alpha: f32,
    },
    Sigmoid,
    Tanh,
}

const SELU_ALPHA: f32 = 1.673_263_2;
const SELU_SCALE: f32 = 1.050_701;

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

impl ActivationKind {
    pub fn apply(&self, x: f32) -> f32 {
        match self {
            ActivationKind::Swish => x * sigmoid(x),
            ActivationKind::Gelu => {
                let c = (2.0 / std::f32::consts::PI).sqrt();
                0.5 * x * (1.0 + (c * (x + 0.044715 * x.powi(3))).tanh())
            }
            ActivationKind::Hardswish => x * (x + 3.0).clamp(0.0, 6.0) / 6.0,
            ActivationKind::Elu => {
                if x > 0.0 {
                    x
                } else {
                    x.exp_m1()
                }
            }
            ActivationKind::Selu => {
                if x > 0.0 {
                    SELU_SCALE * x
                } else {
                    SELU_SCALE * SELU_ALPHA * x.exp_m1()
                }
            }
            ActivationKind::LeakyRelu { alpha } => {
                if x > 0.0 {
                    x
                } else {
                    alpha * x
                }
            }
            ActivationKind::Sigmoid => sigmoid(x),
            ActivationKind::Tanh => x.tanh(),
        }
    }

    /// Activations with a small negative lobe next to a large positive range, the ones a
    /// shift can move into an unsigned range cheaply.
    pub fn has_negative_lobe(&self) -> bool {
        !matches!(self, ActivationKind::Sigmoid | ActivationKind::Tanh)
    }
}

/// Framework agnostic operator computed by a node.
#[derive(Clone, Debug, Display, PartialEq, Serialize, Deserialize)]
pub enum Operator {
    /// Graph input, `shape` is checked against the fed tensor when not empty.
    #[display("Input")]
    Input { shape: Shape },
    /// `kernel [out, in] x input + bias`
    #[display("Dense")]
    Dense,
    /// Convolution of a `[c, h, w]` input with a `[out, c, kh, kw]` kernel. Border positions
    /// read `pad_value`.
    #[display("Conv2d")]
    Conv2d {
        stride: usize,
        padding: Padding,
        pad_value: f32,
    },
    /// Sum of two inputs, or of one input and a constant `operand`.
    #[display("Add")]
    Add { operand: Option<f32> },
    /// `min(max(x, 0), max_value)`
    #[display("Relu")]
    Relu { max_value: Option<f32> },
    #[display("{_0}")]
    Activation(ActivationKind),
    #[display("Flatten")]
    Flatten,
    #[display("Identity")]
    Identity,
}

impl Operator {
    /// Operators with a kernel attribute computing an affine function of their input.
    pub fn is_linear(&self) -> bool {
        matches!(self, Operator::Dense | Operator::Conv2d { .. })
    }

    pub fn is_nonlinear(&self) -> bool {
        matches!(self, Operator::Relu { .. } | Operator::Activation(_))
    }

    pub fn expected_inputs(&self) -> usize {
        match self {
            Operator::Input { .. } => 0,
            Operator::Add { operand: None } => 2,
            _ => 1,
        }
    }
}

/// Value of a free-form framework attribute of a node, e.g. `use_bias`.
#[derive(Clone, Debug, PartialEq, From, Serialize, Deserialize)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl AttrValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

/// One operator instance of the graph.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    /// Operator type name in the host framework, e.g. `Conv2D`.
    pub layer_type: String,
    pub operator: Operator,
    pub inputs: Vec<NodeId>,
    /// Weight attributes, keyed by their general name once opsets are resolved.
    #[serde(default)]
    pub weights: BTreeMap<String, Tensor>,
    #[serde(default)]
    pub framework_attr: BTreeMap<String, AttrValue>,
    /// Opset the layer type resolved to.
    #[serde(default)]
    pub opset: Option<String>,
    /// General attribute name to framework attribute name, filled when opsets are resolved
    /// so export can restore the framework names.
    #[serde(default)]
    pub attr_name_table: BTreeMap<String, String>,
    #[serde(default)]
    pub final_weights_quantization_cfg: Option<NodeWeightsQuantizationConfig>,
    #[serde(default)]
    pub final_activation_quantization_cfg: Option<NodeActivationQuantizationConfig>,
}

impl Node {
    pub fn new<S: Into<String>>(
        name: S,
        layer_type: S,
        operator: Operator,
        inputs: Vec<NodeId>,
    ) -> Self {
        Self {
            name: name.into(),
            layer_type: layer_type.into(),
            operator,
            inputs,
            weights: BTreeMap::new(),
            framework_attr: BTreeMap::new(),
            opset: None,
            attr_name_table: BTreeMap::new(),
            final_weights_quantization_cfg: None,
            final_activation_quantization_cfg: None,
        }
    }

    pub fn with_weight<S: Into<String>>(mut self, attr: S, value: Tensor) -> Self {
        self.weights.insert(attr.into(), value);
        self
    }

    pub fn with_framework_attr<S: Into<String>, V: Into<AttrValue>>(
        mut self,
        name: S,
        value: V,
    ) -> Self {
        self.framework_attr.insert(name.into(), value.into());
        self
    }

    pub fn weight(&self, attr: &str) -> Option<&Tensor> {
        self.weights.get(attr)
    }

    pub fn kernel(&self) -> Option<&Tensor> {
        self.weight(KERNEL_ATTR)
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.weight(BIAS_ATTR)
    }

    pub fn require_weight(&self, attr: &str) -> Result<&Tensor, GraphError> {
        self.weight(attr).ok_or_else(|| GraphError::MissingWeight {
            node: self.name.clone(),
            attr: attr.to_string(),
        })
    }

    pub fn framework_flag(&self, name: &str) -> bool {
        self.framework_attr
            .get(name)
            .and_then(AttrValue::as_bool)
            .unwrap_or(false)
    }

    /// Number of output channels of a linear node.
    pub fn out_channels(&self) -> Option<usize> {
        self.kernel().map(|k| k.num_channels())
    }

    /// Number of input channels (features for Dense) of a linear node.
    pub fn in_channels(&self) -> Option<usize> {
        self.kernel().and_then(|k| k.shape().get(1).copied())
    }

    /// True when the node quantizes its output.
    pub fn is_activation_quantization_enabled(&self) -> bool {
        self.final_activation_quantization_cfg
            .as_ref()
            .is_some_and(|cfg| cfg.enabled)
    }

    /// Applies the operator to its input tensors, in the order of `self.inputs`. `weights`
    /// overrides the node's own weight attributes, used to evaluate simulated quantization.
    pub(crate) fn evaluate(
        &self,
        inputs: &[&Tensor],
        weights: &BTreeMap<String, Tensor>,
    ) -> Result<Tensor, GraphError> {
        if inputs.len() != self.operator.expected_inputs() {
            return Err(GraphError::invalid(
                &self.name,
                format!(
                    "{} expects {} inputs, got {}",
                    self.operator,
                    self.operator.expected_inputs(),
                    inputs.len()
                ),
            ));
        }
        let tensor_err = |error| GraphError::Tensor {
            node: self.name.clone(),
            error,
        };
        let kernel = || {
            weights.get(KERNEL_ATTR).ok_or_else(|| GraphError::MissingWeight {
                node: self.name.clone(),
                attr: KERNEL_ATTR.to_string(),
            })
        };
        let bias = weights.get(BIAS_ATTR);
        match &self.operator {
            Operator::Input { .. } => Err(GraphError::invalid(
                &self.name,
                "input nodes are fed, not evaluated",
            )),
            Operator::Dense => {
                let out = kernel()?.matvec(&inputs[0].flatten()).map_err(tensor_err)?;
                match bias {
                    Some(b) => out.add(b).map_err(tensor_err),
                    None => Ok(out),
                }
            }
            Operator::Conv2d {
                stride,
                padding,
                pad_value,
            } => inputs[0]
                .conv2d(kernel()?, bias, *stride, *padding, *pad_value)
                .map_err(tensor_err),
            Operator::Add { operand: Some(c) } => Ok(inputs[0].map(|v| v + c)),
            Operator::Add { operand: None } => inputs[0].add(inputs[1]).map_err(tensor_err),
            Operator::Relu { max_value } => {
                let max = max_value.unwrap_or(f32::INFINITY);
                Ok(inputs[0].map(|v| v.max(0.0).min(max)))
            }
            Operator::Activation(kind) => Ok(inputs[0].map(|v| kind.apply(v))),
            Operator::Flatten => Ok(inputs[0].flatten()),
            Operator::Identity => Ok(inputs[0].clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(ActivationKind::Swish, -1.0, -0.268_941_43)]
    #[case(ActivationKind::Hardswish, -1.0, -1.0 / 3.0)]
    #[case(ActivationKind::Elu, -1.0, -0.632_120_56)]
    #[case(ActivationKind::LeakyRelu { alpha: 0.1 }, -2.0, -0.2)]
    #[case(ActivationKind::Tanh, 0.0, 0.0)]
    #[case(ActivationKind::Sigmoid, 0.0, 0.5)]
    fn test_activations(#[case] kind: ActivationKind, #[case] x: f32, #[case] expected: f32) {
        assert!((kind.apply(x) - expected).abs() < 1e-5);
    }

    #[test]
    fn test_dense_evaluation() {
        let node = Node::new("fc", "Dense", Operator::Dense, vec![NodeId::from(0)])
            .with_weight(KERNEL_ATTR, Tensor::new(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]))
            .with_weight(BIAS_ATTR, Tensor::from_vec(vec![0.5, -0.5]));
        let x = Tensor::from_vec(vec![1.0, 1.0]);
        let out = node.evaluate(&[&x], &node.weights).unwrap();
        assert_eq!(out.get_data(), &[3.5, 6.5]);
        assert!(node.evaluate(&[], &node.weights).is_err());
        assert!(node.evaluate(&[&x], &BTreeMap::new()).is_err());
    }

    #[test]
    fn test_bounded_relu_and_flags() {
        let node = Node::new("relu", "ReLU", Operator::Relu { max_value: Some(6.0) }, vec![])
            .with_framework_attr("use_bias", false);
        let x = Tensor::from_vec(vec![-1.0, 3.0, 9.0]);
        let out = node.evaluate(&[&x], &node.weights).unwrap();
        assert_eq!(out.get_data(), &[0.0, 3.0, 6.0]);
        assert!(node.evaluate(&[&x, &x], &node.weights).is_err());
        assert!(!node.framework_flag("use_bias"));
        assert!(!node.framework_flag("missing"));
        assert!(node.operator.is_nonlinear());
        assert!(!node.operator.is_linear());
    }
}
