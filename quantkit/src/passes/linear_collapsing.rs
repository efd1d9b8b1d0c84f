use std::collections::BTreeSet;

use anyhow::{Result, ensure};
use tracing::{debug, info, instrument, warn};

use crate::{
    graph::{AttrValue, BIAS_ATTR, Graph, KERNEL_ATTR, Node, NodeId, Operator},
    target_platform::FrameworkInfo,
    tensor::Tensor,
};

use super::{CorrectionError, PassOutcome, single_consumer};

/// Kernel and bias of the single linear operator equivalent to `first` followed by `second`.
fn fuse(first: &Node, second: &Node) -> Result<(Tensor, Option<Tensor>)> {
    let k1 = first.require_weight(KERNEL_ATTR)?;
    let k2 = second.require_weight(KERNEL_ATTR)?;
    let s1 = k1.get_shape();
    let s2 = k2.get_shape();
    ensure!(
        s2.len() >= 2 && s2[1] == s1[0],
        "kernel {s2:?} cannot follow kernel {s1:?}"
    );
    ensure!(
        s2[2..].iter().all(|d| *d == 1),
        "only 1x1 kernels can be folded into the previous node"
    );
    // W2 as [o2, o1] and W1 as [o1, rest]
    let w2 = k2.reshape(vec![s2[0], s2[1]])?;
    let rest = k1.len() / s1[0];
    let w1 = k1.reshape(vec![s1[0], rest])?;
    let mut shape = s1.clone();
    shape[0] = s2[0];
    let kernel = w2.matmul(&w1)?.reshape(shape)?;

    let bias = match (first.bias(), second.bias()) {
        (None, None) => None,
        (b1, b2) => {
            let from_first = match b1 {
                Some(b1) => w2.matvec(b1)?,
                None => Tensor::zeros(vec![s2[0]]),
            };
            Some(match b2 {
                Some(b2) => from_first.add(b2)?,
                None => from_first,
            })
        }
    };
    Ok((kernel, bias))
}

fn is_collapsible_pair(first: &Operator, second: &Operator) -> bool {
    match (first, second) {
        (Operator::Dense, Operator::Dense) => true,
        (Operator::Conv2d { .. }, Operator::Conv2d { stride: 1, .. }) => true,
        _ => false,
    }
}

/// First pair `(first, second)` of linear nodes, in topological order, where `second` is the
/// only reader of `first`.
fn next_candidate(graph: &Graph, skipped: &BTreeSet<NodeId>) -> Result<Option<(NodeId, NodeId)>> {
    for id in graph.topological_order()? {
        if skipped.contains(&id) {
            continue;
        }
        let first = graph.node(id)?;
        if !first.operator.is_linear() || first.is_activation_quantization_enabled() {
            continue;
        }
        let Some(consumer) = single_consumer(graph, id) else {
            continue;
        };
        let second = graph.node(consumer)?;
        if second.inputs != [id] || !is_collapsible_pair(&first.operator, &second.operator) {
            continue;
        }
        return Ok(Some((id, consumer)));
    }
    Ok(None)
}

/// Fuses chains of linear nodes into a single node until no pair is left. The fused node
/// keeps the id and the name of the last node of the chain. Pairs that cannot be fused are
/// left as they are.
#[instrument(name = "linear collapsing", skip_all)]
pub fn linear_collapsing(
    graph: &Graph,
    fw_info: &FrameworkInfo,
) -> Result<PassOutcome, CorrectionError> {
    let mut collapsed = graph.clone();
    let mut rewritten = BTreeSet::new();
    let mut skipped = BTreeSet::new();
    while let Some((first_id, second_id)) = next_candidate(&collapsed, &skipped)? {
        let first = collapsed.node(first_id)?.clone();
        let (kernel, bias) = match fuse(&first, collapsed.node(second_id)?) {
            Ok(fused) => fused,
            Err(e) => {
                warn!("cannot collapse {} into its consumer: {e}", first.name);
                skipped.insert(first_id);
                continue;
            }
        };
        let second = collapsed.node_mut(second_id)?;
        debug!("collapsing {} into {}", first.name, second.name);
        second.operator = first.operator.clone();
        second.inputs = first.inputs.clone();
        second.weights.insert(KERNEL_ATTR.to_string(), kernel);
        if let Some(bias) = bias {
            second.weights.insert(BIAS_ATTR.to_string(), bias);
            second
                .framework_attr
                .insert(fw_info.use_bias_flag.clone(), AttrValue::Bool(true));
        }
        second.final_weights_quantization_cfg = None;
        collapsed.remove_node(first_id)?;
        rewritten.remove(&first_id);
        rewritten.insert(second_id);
    }
    info!("linear collapsing fused {} chains", rewritten.len());
    Ok(PassOutcome {
        graph: collapsed,
        rewritten,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        tensor::Padding,
        testing::{calibration_set, conv, dense, dense_chain, dense_relu_dense, input_node},
    };

    fn assert_same_outputs(a: &Graph, b: &Graph) {
        for sample in calibration_set(a, 4, 9) {
            let ta = a.run(&sample).unwrap();
            let tb = b.run(&sample).unwrap();
            let oa = ta.get(a.outputs()[0]).unwrap();
            let ob = tb.get(b.outputs()[0]).unwrap();
            assert_eq!(oa.get_shape(), ob.get_shape());
            for (x, y) in oa.get_data().iter().zip(ob.get_data()) {
                assert!((x - y).abs() < 1e-4, "{x} != {y}");
            }
        }
    }

    #[test]
    fn test_dense_chain() {
        let graph = dense_chain();
        let fw = FrameworkInfo::keras();
        let once = linear_collapsing(&graph, &fw).unwrap();
        assert_eq!(once.graph.len(), 2);
        let fused = once.graph.node(once.graph.outputs()[0]).unwrap();
        assert_eq!(fused.name, "fc3");
        assert_eq!(fused.kernel().unwrap().get_shape(), vec![3, 4]);
        assert_same_outputs(&graph, &once.graph);

        let twice = linear_collapsing(&once.graph, &fw).unwrap();
        assert_eq!(twice.graph, once.graph);
        assert!(twice.rewritten.is_empty());
    }

    #[test]
    fn test_nonlinearity_blocks_collapsing() {
        let graph = dense_relu_dense();
        let outcome = linear_collapsing(&graph, &FrameworkInfo::keras()).unwrap();
        assert_eq!(outcome.graph, graph);
    }

    #[test]
    fn test_branching_is_skipped() {
        let mut graph = dense_chain();
        let fc1 = graph.find("fc1").unwrap();
        let side = graph
            .add_node(dense("side", fc1, Tensor::random_seeded(vec![2, 6], 5), false))
            .unwrap();
        let fc3 = graph.find("fc3").unwrap();
        graph.set_outputs(vec![fc3, side]).unwrap();
        let outcome = linear_collapsing(&graph, &FrameworkInfo::keras()).unwrap();
        // fc2 -> fc3 still collapses, fc1 feeds two nodes and stays
        assert!(outcome.graph.node(fc1).is_ok());
        assert!(outcome.graph.find("fc2").is_none());
        assert_eq!(outcome.graph.len(), graph.len() - 1);
    }

    #[test]
    fn test_conv_then_pointwise() {
        let mut graph = Graph::new();
        let input = graph.add_node(input_node("input", vec![2, 5, 5])).unwrap();
        let c1 = graph
            .add_node(conv("conv1", input, Tensor::random_seeded(vec![4, 2, 3, 3], 1), true))
            .unwrap();
        let c2 = graph
            .add_node(conv("conv2", c1, Tensor::random_seeded(vec![3, 4, 1, 1], 2), false))
            .unwrap();
        graph.set_outputs(vec![c2]).unwrap();
        let outcome = linear_collapsing(&graph, &FrameworkInfo::keras()).unwrap();
        assert_eq!(outcome.graph.len(), 2);
        let fused = outcome.graph.node(c2).unwrap();
        assert_eq!(fused.kernel().unwrap().get_shape(), vec![3, 2, 3, 3]);
        assert!(matches!(
            fused.operator,
            Operator::Conv2d {
                padding: Padding::Same,
                ..
            }
        ));
        assert_same_outputs(&graph, &outcome.graph);

        // a 3x3 second convolution is not folded
        let mut graph = Graph::new();
        let input = graph.add_node(input_node("input", vec![2, 5, 5])).unwrap();
        let c1 = graph
            .add_node(conv("conv1", input, Tensor::random_seeded(vec![4, 2, 3, 3], 1), true))
            .unwrap();
        let c2 = graph
            .add_node(conv("conv2", c1, Tensor::random_seeded(vec![3, 4, 3, 3], 2), false))
            .unwrap();
        graph.set_outputs(vec![c2]).unwrap();
        let outcome = linear_collapsing(&graph, &FrameworkInfo::keras()).unwrap();
        assert_eq!(outcome.graph, graph);
    }
}
