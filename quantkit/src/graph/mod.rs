//! Framework agnostic graph representation. The graph is an arena of [`Node`]s addressed by
//! stable [`NodeId`]s: cloning it is a bulk copy and ids survive clones and passes, so every
//! pass works as "clone, then mutate the clone".

mod error;
mod node;

use std::{
    collections::{BTreeMap, BTreeSet},
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::Path,
};

use anyhow::Context;
use derive_more::{Display, From};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::tensor::Tensor;

pub use error::GraphError;
pub use node::{ActivationKind, AttrValue, BIAS_ATTR, KERNEL_ATTR, Node, Operator};

/// Stable identifier of a node.
#[derive(
    Clone, Copy, Debug, Display, From, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Output tensor of every node of one evaluation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Trace {
    outputs: BTreeMap<NodeId, Tensor>,
}

impl Trace {
    pub fn get(&self, id: NodeId) -> Option<&Tensor> {
        self.outputs.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &Tensor)> {
        self.outputs.iter()
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    nodes: BTreeMap<NodeId, Node>,
    /// Nodes whose output is an output of the graph.
    outputs: Vec<NodeId>,
    next_id: usize,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node whose inputs are already in the graph and returns its id.
    pub fn add_node(&mut self, node: Node) -> Result<NodeId, GraphError> {
        if let Some(missing) = node.inputs.iter().find(|i| !self.nodes.contains_key(i)) {
            return Err(GraphError::NodeNotFound(*missing));
        }
        if node.inputs.len() != node.operator.expected_inputs() {
            return Err(GraphError::invalid(
                &node.name,
                format!(
                    "{} expects {} inputs, got {}",
                    node.operator,
                    node.operator.expected_inputs(),
                    node.inputs.len()
                ),
            ));
        }
        let id = NodeId(self.next_id);
        self.next_id += 1;
        trace!("adding node {} ({}) as {id}", node.name, node.operator);
        self.nodes.insert(id, node);
        Ok(id)
    }

    /// Removes a node nothing depends on anymore.
    pub fn remove_node(&mut self, id: NodeId) -> Result<Node, GraphError> {
        if !self.nodes.contains_key(&id) {
            return Err(GraphError::NodeNotFound(id));
        }
        if !self.consumers(id).is_empty() || self.is_output(id) {
            return Err(GraphError::NodeInUse(id));
        }
        self.nodes.remove(&id).ok_or(GraphError::NodeNotFound(id))
    }

    /// Rewires every input of `consumer` reading `old` to read `new` instead.
    pub fn replace_input(
        &mut self,
        consumer: NodeId,
        old: NodeId,
        new: NodeId,
    ) -> Result<(), GraphError> {
        if !self.nodes.contains_key(&new) {
            return Err(GraphError::NodeNotFound(new));
        }
        let node = self.node_mut(consumer)?;
        node.inputs
            .iter_mut()
            .filter(|i| **i == old)
            .for_each(|i| *i = new);
        Ok(())
    }

    /// Makes every consumer of `old`, and the graph outputs, read `new` instead.
    pub fn replace_uses(&mut self, old: NodeId, new: NodeId) -> Result<(), GraphError> {
        for consumer in self.consumers(old) {
            if consumer != new {
                self.replace_input(consumer, old, new)?;
            }
        }
        self.outputs
            .iter_mut()
            .filter(|o| **o == old)
            .for_each(|o| *o = new);
        Ok(())
    }

    /// Nodes reading the output of `id`, sorted by id.
    pub fn consumers(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.inputs.contains(&id))
            .map(|(cid, _)| *cid)
            .collect()
    }

    pub fn node(&self, id: NodeId) -> Result<&Node, GraphError> {
        self.nodes.get(&id).ok_or(GraphError::NodeNotFound(id))
    }

    pub fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, GraphError> {
        self.nodes.get_mut(&id).ok_or(GraphError::NodeNotFound(id))
    }

    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .find(|(_, node)| node.name == name)
            .map(|(id, _)| *id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&NodeId, &Node)> {
        self.nodes.iter()
    }

    pub fn nodes_mut(&mut self) -> impl Iterator<Item = (&NodeId, &mut Node)> {
        self.nodes.iter_mut()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Input nodes, in id order. Input tensors are fed in this order.
    pub fn inputs(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|(_, node)| matches!(node.operator, Operator::Input { .. }))
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn outputs(&self) -> &[NodeId] {
        &self.outputs
    }

    pub fn set_outputs(&mut self, outputs: Vec<NodeId>) -> Result<(), GraphError> {
        if let Some(missing) = outputs.iter().find(|o| !self.nodes.contains_key(o)) {
            return Err(GraphError::NodeNotFound(*missing));
        }
        self.outputs = outputs;
        Ok(())
    }

    pub fn is_output(&self, id: NodeId) -> bool {
        self.outputs.contains(&id)
    }

    /// Deterministic topological order: among the ready nodes the smallest id goes first.
    pub fn topological_order(&self) -> Result<Vec<NodeId>, GraphError> {
        let mut pending: BTreeMap<NodeId, usize> = BTreeMap::new();
        let mut consumers: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();
        for (id, node) in &self.nodes {
            let deps = node.inputs.iter().unique().collect_vec();
            for dep in &deps {
                if !self.nodes.contains_key(dep) {
                    return Err(GraphError::NodeNotFound(**dep));
                }
                consumers.entry(**dep).or_default().push(*id);
            }
            pending.insert(*id, deps.len());
        }
        let mut ready: BTreeSet<NodeId> = pending
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = ready.pop_first() {
            order.push(id);
            for consumer in consumers.get(&id).into_iter().flatten() {
                if let Some(n) = pending.get_mut(consumer) {
                    *n -= 1;
                    if *n == 0 {
                        ready.insert(*consumer);
                    }
                }
            }
        }
        if order.len() != self.nodes.len() {
            return Err(GraphError::Cycle);
        }
        Ok(order)
    }

    /// Checks that the graph is well formed: known inputs and outputs, input arity, no cycle.
    pub fn validate(&self) -> Result<(), GraphError> {
        for node in self.nodes.values() {
            if node.inputs.len() != node.operator.expected_inputs() {
                return Err(GraphError::invalid(
                    &node.name,
                    format!("wrong number of inputs for {}", node.operator),
                ));
            }
        }
        if let Some(missing) = self.outputs.iter().find(|o| !self.nodes.contains_key(o)) {
            return Err(GraphError::NodeNotFound(*missing));
        }
        self.topological_order().map(|_| ())
    }

    /// Float evaluation of every node on one sample.
    pub fn run(&self, inputs: &[Tensor]) -> Result<Trace, GraphError> {
        self.evaluate(inputs, false)
    }

    /// Evaluation with the simulated quantization described by the nodes' final configs:
    /// quantized weights and quantized activations.
    pub fn run_quantized(&self, inputs: &[Tensor]) -> Result<Trace, GraphError> {
        self.evaluate(inputs, true)
    }

    fn evaluate(&self, inputs: &[Tensor], quantized: bool) -> Result<Trace, GraphError> {
        let input_ids = self.inputs();
        if input_ids.len() != inputs.len() {
            return Err(GraphError::InputCount {
                expected: input_ids.len(),
                got: inputs.len(),
            });
        }
        let fed: BTreeMap<NodeId, &Tensor> = input_ids.into_iter().zip(inputs.iter()).collect();
        let mut trace = Trace::default();
        for id in self.topological_order()? {
            let node = self.node(id)?;
            let out = match &node.operator {
                Operator::Input { shape } => {
                    let tensor = *fed.get(&id).ok_or(GraphError::NodeNotFound(id))?;
                    if !shape.is_empty() && shape.as_slice() != tensor.shape() {
                        return Err(GraphError::invalid(
                            &node.name,
                            format!("expected input shape {:?}, got {:?}", shape, tensor.shape()),
                        ));
                    }
                    tensor.clone()
                }
                _ => {
                    let args = node
                        .inputs
                        .iter()
                        .map(|i| trace.get(*i).ok_or(GraphError::NodeNotFound(*i)))
                        .collect::<Result<Vec<_>, _>>()?;
                    match (&node.final_weights_quantization_cfg, quantized) {
                        (Some(cfg), true) => {
                            let weights = node
                                .weights
                                .iter()
                                .map(|(attr, w)| {
                                    let q = cfg
                                        .attr_config(attr)
                                        .map(|c| c.quantize(w))
                                        .unwrap_or_else(|| w.clone());
                                    (attr.clone(), q)
                                })
                                .collect();
                            node.evaluate(&args, &weights)?
                        }
                        _ => node.evaluate(&args, &node.weights)?,
                    }
                }
            };
            let out = match (&node.final_activation_quantization_cfg, quantized) {
                (Some(cfg), true) => cfg.quantize(&out),
                _ => out,
            };
            trace.outputs.insert(id, out);
        }
        Ok(trace)
    }

    pub fn to_json(&self) -> Result<String, GraphError> {
        serde_json::to_string(self).map_err(|e| GraphError::Serialization(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, GraphError> {
        let graph: Graph =
            serde_json::from_str(json).map_err(|e| GraphError::Serialization(e.to_string()))?;
        graph.validate()?;
        Ok(graph)
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, GraphError> {
        rmp_serde::to_vec_named(self).map_err(|e| GraphError::Serialization(e.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, GraphError> {
        let graph: Graph =
            rmp_serde::from_slice(bytes).map_err(|e| GraphError::Serialization(e.to_string()))?;
        graph.validate()?;
        Ok(graph)
    }

    /// Writes the graph as MessagePack.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        let file = File::create(path)
            .with_context(|| format!("creating graph file {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        rmp_serde::encode::write_named(&mut writer, self).context("encoding graph")?;
        writer.flush().context("flushing graph file")?;
        debug!("graph with {} nodes saved to {}", self.len(), path.display());
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file =
            File::open(path).with_context(|| format!("opening graph file {}", path.display()))?;
        let graph: Graph =
            rmp_serde::decode::from_read(BufReader::new(file)).context("decoding graph")?;
        graph.validate()?;
        Ok(graph)
    }
}
