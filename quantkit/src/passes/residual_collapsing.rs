use std::collections::BTreeSet;

use tracing::{debug, info, instrument};

use crate::{
    graph::{Graph, KERNEL_ATTR, Node, NodeId, Operator},
    tensor::{Padding, Tensor},
};

use super::{CorrectionError, PassOutcome, single_consumer};

/// Kernel computing `x + L(x)`, when the identity can be expressed in the kernel of `linear`.
fn with_identity(linear: &Node) -> Option<Tensor> {
    let kernel = linear.kernel()?;
    let shape = kernel.get_shape();
    match &linear.operator {
        Operator::Dense if shape.len() == 2 && shape[0] == shape[1] => {
            kernel.add(&Tensor::identity(shape[0])).ok()
        }
        Operator::Conv2d {
            stride: 1,
            padding: Padding::Same,
            pad_value,
        } if *pad_value == 0.0
            && shape.len() == 4
            && shape[0] == shape[1]
            && shape[2] % 2 == 1
            && shape[3] % 2 == 1 =>
        {
            let (channels, kh, kw) = (shape[0], shape[2], shape[3]);
            let mut folded = kernel.clone();
            let data = folded.get_data_mut();
            for c in 0..channels {
                data[((c * channels + c) * kh + kh / 2) * kw + kw / 2] += 1.0;
            }
            Some(folded)
        }
        _ => None,
    }
}

/// `(add, linear)` where `add` sums `x` and `linear(x)` and nothing else reads `linear`.
fn next_candidate(graph: &Graph, skipped: &BTreeSet<NodeId>) -> Option<(NodeId, NodeId)> {
    graph.nodes().find_map(|(add_id, add)| {
        if skipped.contains(add_id) || add.operator != (Operator::Add { operand: None }) {
            return None;
        }
        let [a, b] = add.inputs.as_slice() else {
            return None;
        };
        [(*a, *b), (*b, *a)].into_iter().find_map(|(residual, linear_id)| {
            let linear = graph.node(linear_id).ok()?;
            let eligible = linear.operator.is_linear()
                && linear.inputs == [residual]
                && single_consumer(graph, linear_id) == Some(*add_id)
                && !linear.is_activation_quantization_enabled();
            eligible.then_some((*add_id, linear_id))
        })
    })
}

/// Folds residual additions `Add(x, L(x))` into `L` by adding the identity to its kernel.
/// The folded node keeps its id and name and takes the place of the addition.
#[instrument(name = "residual collapsing", skip_all)]
pub fn residual_collapsing(graph: &Graph) -> Result<PassOutcome, CorrectionError> {
    let mut collapsed = graph.clone();
    let mut rewritten = BTreeSet::new();
    let mut skipped = BTreeSet::new();
    while let Some((add_id, linear_id)) = next_candidate(&collapsed, &skipped) {
        let Some(kernel) = with_identity(collapsed.node(linear_id)?) else {
            debug!("residual add {add_id} cannot be folded");
            skipped.insert(add_id);
            continue;
        };
        let linear = collapsed.node_mut(linear_id)?;
        debug!("folding residual add {add_id} into {}", linear.name);
        linear.weights.insert(KERNEL_ATTR.to_string(), kernel);
        linear.final_weights_quantization_cfg = None;
        collapsed.replace_uses(add_id, linear_id)?;
        collapsed.remove_node(add_id)?;
        rewritten.insert(linear_id);
    }
    info!("residual collapsing folded {} additions", rewritten.len());
    Ok(PassOutcome {
        graph: collapsed,
        rewritten,
    })
}
