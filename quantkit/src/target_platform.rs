//! Target platform description. Framework layer types are resolved once, when the graph is
//! imported, into an opset name; every later stage only looks at the opset and the general
//! attribute names.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::{
    config::{CustomOpsetLayers, QuantizationConfig},
    graph::{BIAS_ATTR, Graph, GraphError, KERNEL_ATTR},
    quantization::{AttributeQuantizationConfig, QuantizationMethod},
};

/// Built-in opset names.
pub mod opset {
    pub const INPUT: &str = "Input";
    pub const FULLY_CONNECTED: &str = "FullyConnected";
    pub const CONV: &str = "Conv";
    pub const ADD: &str = "Add";
    pub const RELU: &str = "Relu";
    pub const ACTIVATION: &str = "Activation";
    /// Operators that only move data around and keep the quantization of their input.
    pub const NO_QUANTIZATION: &str = "NoQuantization";
}

/// Explicit description of the host framework: how its layer types map to opsets and how
/// its attribute names map to the general ones.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrameworkInfo {
    pub name: String,
    /// Framework attribute telling whether a layer applies its bias.
    pub use_bias_flag: String,
    /// Framework layer type to built-in opset.
    pub layer_opsets: BTreeMap<String, String>,
    /// General attribute name to framework attribute name.
    pub attr_mapping: BTreeMap<String, String>,
}

fn table(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

impl FrameworkInfo {
    /// Keras style names: `Dense`, `Conv2D`, attributes `kernel` / `bias`.
    pub fn keras() -> Self {
        Self {
            name: "keras".into(),
            use_bias_flag: "use_bias".into(),
            layer_opsets: table(&[
                ("InputLayer", opset::INPUT),
                ("Dense", opset::FULLY_CONNECTED),
                ("Conv2D", opset::CONV),
                ("Add", opset::ADD),
                ("ReLU", opset::RELU),
                ("Activation", opset::ACTIVATION),
                ("Flatten", opset::NO_QUANTIZATION),
                ("Reshape", opset::NO_QUANTIZATION),
            ]),
            attr_mapping: table(&[(KERNEL_ATTR, "kernel"), (BIAS_ATTR, "bias")]),
        }
    }

    /// PyTorch style names: `Linear`, `Conv2d`, attributes `weight` / `bias`.
    pub fn pytorch() -> Self {
        Self {
            name: "pytorch".into(),
            use_bias_flag: "bias".into(),
            layer_opsets: table(&[
                ("placeholder", opset::INPUT),
                ("Linear", opset::FULLY_CONNECTED),
                ("Conv2d", opset::CONV),
                ("add", opset::ADD),
                ("ReLU", opset::RELU),
                ("ReLU6", opset::RELU),
                ("SiLU", opset::ACTIVATION),
                ("GELU", opset::ACTIVATION),
                ("Hardswish", opset::ACTIVATION),
                ("Flatten", opset::NO_QUANTIZATION),
                ("Identity", opset::NO_QUANTIZATION),
            ]),
            attr_mapping: table(&[(KERNEL_ATTR, "weight"), (BIAS_ATTR, "bias")]),
        }
    }

    pub fn opset_of(&self, layer_type: &str) -> Option<&str> {
        self.layer_opsets.get(layer_type).map(String::as_str)
    }
}

impl Default for FrameworkInfo {
    fn default() -> Self {
        Self::keras()
    }
}

/// Quantization policy of one opset.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpQuantizationConfig {
    /// Per general attribute name, attributes not listed are kept in float.
    pub attr_configs: BTreeMap<String, AttributeQuantizationConfig>,
    pub enable_activation_quantization: bool,
    pub activation_quantization_method: QuantizationMethod,
    pub activation_n_bits: usize,
    /// The output keeps the quantization of the input, no own threshold.
    pub quantization_preserving: bool,
}

impl OpQuantizationConfig {
    /// Kernel quantized as the config says, bias never quantized, output quantized.
    pub fn from_config(qc: &QuantizationConfig) -> Self {
        let mut attr_configs = BTreeMap::new();
        attr_configs.insert(
            KERNEL_ATTR.to_string(),
            AttributeQuantizationConfig::from_config(qc),
        );
        attr_configs.insert(
            BIAS_ATTR.to_string(),
            AttributeQuantizationConfig::disabled(),
        );
        Self {
            attr_configs,
            enable_activation_quantization: true,
            activation_quantization_method: qc.activation_quantization_method,
            activation_n_bits: qc.activation_n_bits,
            quantization_preserving: false,
        }
    }

    pub fn no_quantization(qc: &QuantizationConfig) -> Self {
        Self {
            attr_configs: BTreeMap::new(),
            enable_activation_quantization: false,
            quantization_preserving: true,
            ..Self::from_config(qc)
        }
    }

    pub fn attr_config(&self, attr: &str) -> AttributeQuantizationConfig {
        self.attr_configs
            .get(attr)
            .cloned()
            .unwrap_or_else(AttributeQuantizationConfig::disabled)
    }
}

/// Opset name to quantization policy, with a fallback for opsets the platform does not list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TargetPlatformCapabilities {
    pub opsets: BTreeMap<String, OpQuantizationConfig>,
    pub default: OpQuantizationConfig,
}

impl TargetPlatformCapabilities {
    pub fn from_config(qc: &QuantizationConfig) -> Self {
        let mut opsets = BTreeMap::new();
        opsets.insert(
            opset::NO_QUANTIZATION.to_string(),
            OpQuantizationConfig::no_quantization(qc),
        );
        Self {
            opsets,
            default: OpQuantizationConfig::from_config(qc),
        }
    }

    pub fn with_opset<S: Into<String>>(mut self, name: S, cfg: OpQuantizationConfig) -> Self {
        self.opsets.insert(name.into(), cfg);
        self
    }

    pub fn op_config(&self, opset: Option<&str>) -> &OpQuantizationConfig {
        opset
            .and_then(|name| self.opsets.get(name))
            .unwrap_or(&self.default)
    }
}

/// Resolves the layer type of every node into its opset and renames framework attributes to
/// their general names. Custom opsets win over the framework ones. Resolving an already
/// resolved graph changes nothing.
pub fn resolve_opsets(
    graph: &Graph,
    fw_info: &FrameworkInfo,
    custom: Option<&BTreeMap<String, CustomOpsetLayers>>,
) -> Result<Graph, GraphError> {
    let mut resolved = graph.clone();
    for (id, node) in resolved.nodes_mut() {
        let custom_match = custom.and_then(|layers| {
            layers
                .iter()
                .find(|(_, l)| l.operators.iter().any(|op| *op == node.layer_type))
        });
        let (opset, mapping) = match custom_match {
            Some((name, layers)) => {
                let mut mapping = fw_info.attr_mapping.clone();
                mapping.extend(layers.attr_mapping.clone());
                (Some(name.clone()), mapping)
            }
            None => (
                fw_info.opset_of(&node.layer_type).map(String::from),
                fw_info.attr_mapping.clone(),
            ),
        };
        for (general, framework) in &mapping {
            let Some(value) = node.weights.remove(framework) else {
                continue;
            };
            if general != framework && node.weights.contains_key(general) {
                return Err(GraphError::invalid(
                    &node.name,
                    format!("both {general} and {framework} attributes are present"),
                ));
            }
            trace!("node {id}: attribute {framework} resolved as {general}");
            node.weights.insert(general.clone(), value);
            node.attr_name_table
                .insert(general.clone(), framework.clone());
        }
        if opset.is_some() {
            node.opset = opset;
        }
        debug!(
            "node {} ({}) resolved to opset {:?}",
            node.name, node.layer_type, node.opset
        );
    }
    Ok(resolved)
}

/// Inverse of the attribute renaming done by [`resolve_opsets`], used on export.
pub fn restore_framework_names(graph: &Graph) -> Graph {
    let mut restored = graph.clone();
    for (_, node) in restored.nodes_mut() {
        let table = node.attr_name_table.clone();
        for (general, framework) in &table {
            if general == framework {
                continue;
            }
            if let Some(value) = node.weights.remove(general) {
                node.weights.insert(framework.clone(), value);
            }
            if let Some(cfg) = node.final_weights_quantization_cfg.as_mut() {
                cfg.rename_attr(general, framework);
            }
        }
    }
    restored
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        graph::{Node, Operator},
        tensor::Tensor,
    };

    fn torch_graph() -> Graph {
        let mut graph = Graph::new();
        let x = graph
            .add_node(Node::new(
                "x",
                "placeholder",
                Operator::Input { shape: vec![2] },
                vec![],
            ))
            .unwrap();
        let fc = graph
            .add_node(
                Node::new("fc", "Linear", Operator::Dense, vec![x])
                    .with_weight("weight", Tensor::identity(2))
                    .with_weight("bias", Tensor::zeros(vec![2])),
            )
            .unwrap();
        let act = graph
            .add_node(Node::new(
                "act",
                "MyActivation",
                Operator::Identity,
                vec![fc],
            ))
            .unwrap();
        graph.set_outputs(vec![act]).unwrap();
        graph
    }

    #[test]
    fn test_resolve_builtin() {
        let graph = torch_graph();
        let resolved = resolve_opsets(&graph, &FrameworkInfo::pytorch(), None).unwrap();
        let fc = resolved.node(resolved.find("fc").unwrap()).unwrap();
        assert_eq!(fc.opset.as_deref(), Some(opset::FULLY_CONNECTED));
        assert!(fc.kernel().is_some());
        assert!(fc.weight("weight").is_none());
        assert_eq!(fc.attr_name_table[KERNEL_ATTR], "weight");
        let act = resolved.node(resolved.find("act").unwrap()).unwrap();
        assert_eq!(act.opset, None);
        // the input graph is untouched
        assert!(graph.node(graph.find("fc").unwrap()).unwrap().kernel().is_none());
        // resolving twice is a no-op
        let again = resolve_opsets(&resolved, &FrameworkInfo::pytorch(), None).unwrap();
        assert_eq!(again, resolved);
        // export restores the framework names
        let restored = restore_framework_names(&resolved);
        let fc = restored.node(restored.find("fc").unwrap()).unwrap();
        assert!(fc.weight("weight").is_some());
    }

    #[test]
    fn test_custom_opsets_take_precedence() {
        let mut custom = BTreeMap::new();
        custom.insert(
            "Custom".to_string(),
            CustomOpsetLayers::new(["MyActivation", "Linear"]).with_attr(KERNEL_ATTR, "w"),
        );
        let mut graph = torch_graph();
        let fc = graph.find("fc").unwrap();
        let node = graph.node_mut(fc).unwrap();
        let w = node.weights.remove("weight").unwrap();
        node.weights.insert("w".into(), w);

        let resolved = resolve_opsets(&graph, &FrameworkInfo::pytorch(), Some(&custom)).unwrap();
        for name in ["fc", "act"] {
            let node = resolved.node(resolved.find(name).unwrap()).unwrap();
            assert_eq!(node.opset.as_deref(), Some("Custom"));
        }
        let fc = resolved.node(fc).unwrap();
        assert!(fc.kernel().is_some());
        assert_eq!(fc.attr_name_table[KERNEL_ATTR], "w");
    }

    #[test]
    fn test_capabilities() {
        let qc = QuantizationConfig::default();
        let tpc = TargetPlatformCapabilities::from_config(&qc);
        let default = tpc.op_config(Some(opset::CONV));
        assert!(default.attr_config(KERNEL_ATTR).enable_weights_quantization);
        assert!(!default.attr_config(BIAS_ATTR).enable_weights_quantization);
        assert!(!default.attr_config("gamma").enable_weights_quantization);
        let flatten = tpc.op_config(Some(opset::NO_QUANTIZATION));
        assert!(!flatten.enable_activation_quantization);
        assert!(flatten.quantization_preserving);
        assert_eq!(tpc.op_config(None), &tpc.default);
    }
}
