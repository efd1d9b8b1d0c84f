//! Graph to graph rewrites applied around threshold selection. Every pass takes the graph by
//! reference, clones it and only mutates the clone.

mod activation_bias_correction;
mod bias_correction;
mod linear_collapsing;
mod relu_bound;
mod residual_collapsing;
mod shift_negative;

use std::collections::BTreeSet;

use crate::{
    graph::{AttrValue, BIAS_ATTR, Graph, GraphError, Node, NodeId},
    quantization::WeightsAttrQuantizationConfig,
    target_platform::FrameworkInfo,
    tensor::{Shape, Tensor, TensorError},
};

pub use activation_bias_correction::apply_activation_bias_correction;
pub use bias_correction::apply_bias_correction_to_graph;
pub use linear_collapsing::linear_collapsing;
pub use relu_bound::relu_bound_to_power_of_two;
pub use residual_collapsing::residual_collapsing;
pub use shift_negative::apply_shift_negative_correction;

#[derive(thiserror::Error, Debug)]
pub enum CorrectionError {
    #[error("correction term of shape {term:?} cannot be applied to the bias of shape {bias:?} of node {node}")]
    ShapeMismatch {
        node: String,
        bias: Shape,
        term: Shape,
    },
    #[error("no statistics for node {0}")]
    MissingStatistics(NodeId),
    #[error("graph error during correction: {0}")]
    Graph(#[from] GraphError),
    #[error("generic error during correction: {0}")]
    GenericError(anyhow::Error),
}

impl From<anyhow::Error> for CorrectionError {
    fn from(error: anyhow::Error) -> Self {
        CorrectionError::GenericError(error)
    }
}

/// Graph produced by a pass and the nodes the pass rewrote or inserted.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PassOutcome {
    pub graph: Graph,
    pub rewritten: BTreeSet<NodeId>,
}

impl PassOutcome {
    pub fn unchanged(graph: Graph) -> Self {
        Self {
            graph,
            rewritten: BTreeSet::new(),
        }
    }
}

/// Sum of every kernel slice along axis 0: `W . 1` for Dense, the sum over input channels and
/// spatial positions for Conv2d.
pub(crate) fn kernel_row_sums(kernel: &Tensor) -> Vec<f32> {
    kernel.channel_slices().map(|row| row.iter().sum()).collect()
}

/// `bias -= term` on a linear node. A node without bias gets `-term` as bias, its framework
/// flag is raised and, when the node already has a weights config, the new attribute is
/// explicitly not quantized.
pub(crate) fn subtract_from_bias(
    node: &mut Node,
    term: &Tensor,
    fw_info: &FrameworkInfo,
) -> Result<(), CorrectionError> {
    let shape_error = |_: TensorError| CorrectionError::ShapeMismatch {
        node: node.name.clone(),
        bias: node.bias().map(|b| b.get_shape()).unwrap_or_default(),
        term: term.get_shape(),
    };
    let new_bias = match node.bias() {
        Some(bias) => {
            let corrected = bias.sub(term).map_err(shape_error)?;
            if corrected.get_shape() != bias.get_shape() {
                return Err(shape_error(TensorError::ShapeMismatch {
                    left: bias.get_shape(),
                    right: term.get_shape(),
                }));
            }
            corrected
        }
        None => {
            if let Some(out) = node.out_channels() {
                if term.len() != out {
                    return Err(shape_error(TensorError::ShapeMismatch {
                        left: vec![out],
                        right: term.get_shape(),
                    }));
                }
            }
            node.framework_attr
                .insert(fw_info.use_bias_flag.clone(), AttrValue::Bool(true));
            if let Some(framework) = fw_info.attr_mapping.get(BIAS_ATTR) {
                node.attr_name_table
                    .entry(BIAS_ATTR.to_string())
                    .or_insert_with(|| framework.clone());
            }
            if let Some(cfg) = node.final_weights_quantization_cfg.as_mut() {
                cfg.set_attr_config(BIAS_ATTR, WeightsAttrQuantizationConfig::disabled());
            }
            term.neg()
        }
    };
    node.weights.insert(BIAS_ATTR.to_string(), new_bias);
    Ok(())
}

/// The single consumer of `id`, if there is exactly one and `id` is not a graph output.
pub(crate) fn single_consumer(graph: &Graph, id: NodeId) -> Option<NodeId> {
    if graph.is_output(id) {
        return None;
    }
    match graph.consumers(id).as_slice() {
        [consumer] => Some(*consumer),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{graph::Operator, graph::KERNEL_ATTR};

    #[test]
    fn test_subtract_from_bias() {
        let fw = FrameworkInfo::keras();
        let mut node = Node::new("fc", "Dense", Operator::Dense, vec![])
            .with_weight(KERNEL_ATTR, Tensor::zeros(vec![2, 3]))
            .with_weight(BIAS_ATTR, Tensor::from_vec(vec![1.0, 2.0]));
        subtract_from_bias(&mut node, &Tensor::from_vec(vec![0.1, -0.2]), &fw).unwrap();
        assert_eq!(node.bias().unwrap().get_data(), &[0.9, 2.2]);

        let err = subtract_from_bias(&mut node, &Tensor::from_vec(vec![1.0; 3]), &fw);
        assert!(matches!(err, Err(CorrectionError::ShapeMismatch { .. })));

        // a broadcastable term must not reshape the bias
        let column = Tensor::new(vec![2, 1], vec![0.1, 0.1]);
        let err = subtract_from_bias(&mut node, &column, &fw);
        assert!(matches!(err, Err(CorrectionError::ShapeMismatch { .. })));
        assert_eq!(node.bias().unwrap().get_shape(), vec![2]);
        assert_eq!(node.bias().unwrap().get_data(), &[0.9, 2.2]);

        let mut no_bias = Node::new("fc", "Dense", Operator::Dense, vec![])
            .with_weight(KERNEL_ATTR, Tensor::zeros(vec![2, 3]));
        subtract_from_bias(&mut no_bias, &Tensor::from_vec(vec![0.5, -0.5]), &fw).unwrap();
        assert_eq!(no_bias.bias().unwrap().get_data(), &[-0.5, 0.5]);
        assert!(no_bias.framework_flag("use_bias"));

        let mut wrong = Node::new("fc", "Dense", Operator::Dense, vec![])
            .with_weight(KERNEL_ATTR, Tensor::zeros(vec![2, 3]));
        let term = Tensor::from_vec(vec![1.0; 3]);
        assert!(subtract_from_bias(&mut wrong, &term, &fw).is_err());
        assert!(wrong.bias().is_none());
    }

    #[test]
    fn test_kernel_row_sums() {
        let kernel = Tensor::new(vec![2, 1, 1, 2], vec![1.0, 2.0, -1.0, 0.5]);
        assert_eq!(kernel_row_sums(&kernel), vec![3.0, -0.5]);
    }
}
