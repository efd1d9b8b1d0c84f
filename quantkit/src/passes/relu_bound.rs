use std::collections::BTreeSet;

use tracing::{debug, info, instrument};

use crate::{
    graph::{BIAS_ATTR, Graph, KERNEL_ATTR, NodeId, Operator},
    quantization::{MIN_THRESHOLD, is_power_of_two, power_of_two_threshold},
};

use super::{CorrectionError, PassOutcome, single_consumer};

/// `(linear1, relu, linear2, bound)` for every `Linear -> Relu{max} -> Linear` chain whose
/// bound is not already a power of two.
fn candidates(graph: &Graph) -> Result<Vec<(NodeId, NodeId, NodeId, f32)>, CorrectionError> {
    let mut found = vec![];
    for (relu_id, relu) in graph.nodes() {
        let Operator::Relu {
            max_value: Some(bound),
        } = relu.operator
        else {
            continue;
        };
        if bound <= 0.0 || is_power_of_two(bound) {
            continue;
        }
        let [first] = relu.inputs.as_slice() else {
            continue;
        };
        let Some(second) = single_consumer(graph, *relu_id) else {
            continue;
        };
        let (l1, l2) = (graph.node(*first)?, graph.node(second)?);
        if l1.operator.is_linear()
            && l2.operator.is_linear()
            && single_consumer(graph, *first) == Some(*relu_id)
            && l2.inputs == [*relu_id]
        {
            found.push((*first, *relu_id, second, bound));
        }
    }
    Ok(found)
}

/// Moves the bound of every bounded ReLU between two linear nodes to the next power of two:
/// the first node is scaled up by `alpha = pot(bound) / bound`, the second one scaled down by
/// the same factor, so the float function is unchanged.
#[instrument(name = "relu bound to power of two", skip_all)]
pub fn relu_bound_to_power_of_two(graph: &Graph) -> Result<PassOutcome, CorrectionError> {
    let mut scaled = graph.clone();
    let mut rewritten = BTreeSet::new();
    let chains = candidates(graph)?;
    for &(l1, relu, l2, bound) in &chains {
        let new_bound = power_of_two_threshold(bound, MIN_THRESHOLD);
        let alpha = new_bound / bound;
        {
            let node = scaled.node_mut(l1)?;
            for attr in [KERNEL_ATTR, BIAS_ATTR] {
                if let Some(w) = node.weights.get_mut(attr) {
                    *w = w.scalar_mul(alpha);
                }
            }
        }
        scaled.node_mut(relu)?.operator = Operator::Relu {
            max_value: Some(new_bound),
        };
        let node = scaled.node_mut(l2)?;
        if let Some(kernel) = node.weights.get_mut(KERNEL_ATTR) {
            *kernel = kernel.scalar_mul(1.0 / alpha);
        }
        if let Operator::Conv2d { pad_value, .. } = &mut node.operator {
            *pad_value *= alpha;
        }
        debug!("relu bound {bound} scaled by {alpha}");
        rewritten.extend([l1, relu, l2]);
    }
    info!("{} relu bounds moved to a power of two", chains.len());
    Ok(PassOutcome {
        graph: scaled,
        rewritten,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        graph::Node,
        tensor::Tensor,
        testing::{calibration_set, dense, dense_relu_dense, input_node},
    };

    fn bounded(max_value: f32) -> Graph {
        let mut graph = Graph::new();
        let input = graph.add_node(input_node("input", vec![2])).unwrap();
        let kernel = Tensor::random_seeded(vec![4, 2], 1).scalar_mul(8.0);
        let fc1 = graph.add_node(dense("fc1", input, kernel, true)).unwrap();
        let relu = graph
            .add_node(Node::new(
                "relu",
                "ReLU",
                Operator::Relu {
                    max_value: Some(max_value),
                },
                vec![fc1],
            ))
            .unwrap();
        let fc2 = graph
            .add_node(dense("fc2", relu, Tensor::random_seeded(vec![2, 4], 2), true))
            .unwrap();
        graph.set_outputs(vec![fc2]).unwrap();
        graph
    }

    #[test]
    fn test_relu6() {
        let graph = bounded(6.0);
        let outcome = relu_bound_to_power_of_two(&graph).unwrap();
        assert_eq!(outcome.rewritten.len(), 3);
        let relu = outcome.graph.node(graph.find("relu").unwrap()).unwrap();
        assert_eq!(
            relu.operator,
            Operator::Relu {
                max_value: Some(8.0)
            }
        );
        let fc1 = graph.find("fc1").unwrap();
        let before = graph.node(fc1).unwrap().kernel().unwrap().get(&[0, 0]);
        let after = outcome.graph.node(fc1).unwrap().kernel().unwrap().get(&[0, 0]);
        assert!((after - before * 8.0 / 6.0).abs() < 1e-5);

        for sample in calibration_set(&graph, 8, 3) {
            let a = graph.run(&sample).unwrap();
            let b = outcome.graph.run(&sample).unwrap();
            let out = graph.outputs()[0];
            let (oa, ob) = (a.get(out).unwrap(), b.get(out).unwrap());
            for (x, y) in oa.get_data().iter().zip(ob.get_data()) {
                assert!((x - y).abs() < 1e-4, "{x} != {y}");
            }
        }
    }

    #[test]
    fn test_untouched_graphs() {
        let graph = bounded(4.0);
        assert_eq!(relu_bound_to_power_of_two(&graph).unwrap().graph, graph);
        let graph = dense_relu_dense();
        assert!(relu_bound_to_power_of_two(&graph).unwrap().rewritten.is_empty());
    }
}
