use crate::tensor::TensorError;

use super::NodeId;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("node {0} not found in graph")]
    NodeNotFound(NodeId),
    #[error("graph contains a cycle")]
    Cycle,
    #[error("node {0} is still used by other nodes or as a graph output")]
    NodeInUse(NodeId),
    #[error("invalid node {node}: {reason}")]
    InvalidNode { node: String, reason: String },
    #[error("node {node} has no {attr} attribute")]
    MissingWeight { node: String, attr: String },
    #[error("graph expects {expected} input tensors, {got} provided")]
    InputCount { expected: usize, got: usize },
    #[error("tensor error in node {node}: {error}")]
    Tensor { node: String, error: TensorError },
    #[error("cannot (de)serialize graph: {0}")]
    Serialization(String),
}

impl GraphError {
    pub(crate) fn invalid<N: Into<String>, R: Into<String>>(node: N, reason: R) -> Self {
        GraphError::InvalidNode {
            node: node.into(),
            reason: reason.into(),
        }
    }
}
