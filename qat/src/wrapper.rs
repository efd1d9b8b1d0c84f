use std::collections::BTreeMap;

use itertools::Itertools;
use quantkit::{Graph, NodeId, Tensor};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::{QatError, SteActivationQuantizer, SteWeightQuantizer, TrainableQuantizer};

/// Quantizers attached to one node: its enabled weight attributes and its output activation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeQuantizers {
    pub weights: BTreeMap<String, SteWeightQuantizer>,
    pub activation: Option<SteActivationQuantizer>,
}

impl NodeQuantizers {
    pub fn is_empty(&self) -> bool {
        self.weights.is_empty() && self.activation.is_none()
    }
}

/// Quantizers of a whole graph, keyed by node. Nodes without any quantized attribute or
/// activation have no entry.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QuantizerSet {
    nodes: BTreeMap<NodeId, NodeQuantizers>,
}

impl QuantizerSet {
    pub fn get(&self, id: NodeId) -> Option<&NodeQuantizers> {
        self.nodes.get(&id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut NodeQuantizers> {
        self.nodes.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &NodeQuantizers)> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Simulated quantization of a weight attribute of `id`. Attributes kept in float are
    /// returned unchanged.
    pub fn quantize_weight(&self, id: NodeId, attr: &str, value: &Tensor) -> Tensor {
        match self.get(id).and_then(|q| q.weights.get(attr)) {
            Some(quantizer) => quantizer.forward(value),
            None => value.clone(),
        }
    }

    /// Simulated quantization of the output of `id`.
    pub fn quantize_activation(&self, id: NodeId, output: &Tensor) -> Tensor {
        match self.get(id).and_then(|q| q.activation.as_ref()) {
            Some(quantizer) => quantizer.forward(output),
            None => output.clone(),
        }
    }

    /// Trainable activation quantizers, in node order.
    pub fn activation_quantizers_mut(
        &mut self,
    ) -> impl Iterator<Item = (NodeId, &mut SteActivationQuantizer)> {
        self.nodes
            .iter_mut()
            .filter_map(|(id, q)| q.activation.as_mut().map(|a| (*id, a)))
    }

    /// Writes the effective activation thresholds back into the final activation configs of
    /// `graph`, so the fine-tuned graph can be exported as any calibrated one. Returns the
    /// number of updated nodes.
    pub fn write_back(&self, graph: &mut Graph) -> Result<usize, QatError> {
        let mut updated = 0;
        for (id, quantizers) in &self.nodes {
            let Some(quantizer) = &quantizers.activation else {
                continue;
            };
            let cfg = graph
                .node_mut(*id)
                .map_err(|_| QatError::UnknownNode(*id))?
                .final_activation_quantization_cfg
                .as_mut()
                .ok_or(QatError::MissingThreshold(*id))?;
            cfg.threshold = quantizer.thresholds().first().copied();
            updated += 1;
        }
        debug!("wrote {updated} trained activation thresholds back");
        Ok(updated)
    }
}

/// Builds the quantizers of every node of a calibrated graph from its final quantization
/// configs.
#[instrument(name = "build quantizers", skip_all, fields(nodes = graph.len()))]
pub fn build_quantizers(graph: &Graph) -> Result<QuantizerSet, QatError> {
    let mut nodes = BTreeMap::new();
    for (id, node) in graph.nodes() {
        let activation = match &node.final_activation_quantization_cfg {
            Some(cfg) if cfg.enabled => Some(
                SteActivationQuantizer::from_config(cfg).ok_or(QatError::MissingThreshold(*id))?,
            ),
            _ => None,
        };
        let weights = node
            .final_weights_quantization_cfg
            .iter()
            .flat_map(|cfg| cfg.attrs())
            .filter(|(attr, _)| node.weights.contains_key(attr.as_str()))
            .filter_map(|(attr, cfg)| {
                SteWeightQuantizer::from_config(cfg).map(|q| (attr.clone(), q))
            })
            .collect::<BTreeMap<_, _>>();
        let quantizers = NodeQuantizers {
            weights,
            activation,
        };
        if !quantizers.is_empty() {
            nodes.insert(*id, quantizers);
        }
    }
    debug!("quantizers built for nodes {}", nodes.keys().join(", "));
    Ok(QuantizerSet { nodes })
}
