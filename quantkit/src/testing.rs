//! Small graphs and calibration sets used by the tests of this crate and of the crates built
//! on top of it.

use itertools::Itertools;

use crate::{
    graph::{ActivationKind, BIAS_ATTR, Graph, KERNEL_ATTR, Node, NodeId, Operator},
    tensor::{Padding, Tensor},
};

/// `input [2] -> fc1 (Dense 4x2, bias) -> relu -> fc2 (Dense 2x4, no bias)`
pub fn dense_relu_dense() -> Graph {
    let mut graph = Graph::new();
    let input = graph
        .add_node(input_node("input", vec![2]))
        .expect("valid input");
    let fc1 = graph
        .add_node(dense("fc1", input, Tensor::random_seeded(vec![4, 2], 11), true))
        .expect("valid node");
    let relu = graph
        .add_node(Node::new(
            "relu",
            "ReLU",
            Operator::Relu { max_value: None },
            vec![fc1],
        ))
        .expect("valid node");
    let fc2 = graph
        .add_node(dense("fc2", relu, Tensor::random_seeded(vec![2, 4], 12), false))
        .expect("valid node");
    graph.set_outputs(vec![fc2]).expect("known output");
    graph
}

/// `input [4] -> fc1 -> fc2 -> fc3`, three Dense nodes with biases and no activation in between.
pub fn dense_chain() -> Graph {
    let mut graph = Graph::new();
    let mut last = graph
        .add_node(input_node("input", vec![4]))
        .expect("valid input");
    for (i, out) in [6, 5, 3].into_iter().enumerate() {
        let in_features = if i == 0 { 4 } else { [6, 5][i - 1] };
        last = graph
            .add_node(dense(
                &format!("fc{}", i + 1),
                last,
                Tensor::random_seeded(vec![out, in_features], 20 + i as u64),
                true,
            ))
            .expect("valid node");
    }
    graph.set_outputs(vec![last]).expect("known output");
    graph
}

/// `input [c, 6, 6] -> conv1 (3x3 same, bias) -> act -> conv2 (3x3 same, no bias)`
pub fn conv_activation_conv(activation: ActivationKind, channels: usize) -> Graph {
    let mut graph = Graph::new();
    let input = graph
        .add_node(input_node("input", vec![channels, 6, 6]))
        .expect("valid input");
    let conv1 = graph
        .add_node(conv(
            "conv1",
            input,
            Tensor::random_seeded(vec![channels, channels, 3, 3], 31),
            true,
        ))
        .expect("valid node");
    let act = graph
        .add_node(Node::new(
            "act",
            "Activation",
            Operator::Activation(activation),
            vec![conv1],
        ))
        .expect("valid node");
    let conv2 = graph
        .add_node(conv(
            "conv2",
            act,
            Tensor::random_seeded(vec![channels, channels, 3, 3], 32),
            false,
        ))
        .expect("valid node");
    graph.set_outputs(vec![conv2]).expect("known output");
    graph
}

/// `input [3] -> fc (3x3) -> add(input, fc)`
pub fn dense_residual() -> Graph {
    let mut graph = Graph::new();
    let input = graph
        .add_node(input_node("input", vec![3]))
        .expect("valid input");
    let fc = graph
        .add_node(dense("fc", input, Tensor::random_seeded(vec![3, 3], 41), true))
        .expect("valid node");
    let add = graph
        .add_node(Node::new(
            "add",
            "Add",
            Operator::Add { operand: None },
            vec![input, fc],
        ))
        .expect("valid node");
    graph.set_outputs(vec![add]).expect("known output");
    graph
}

/// `input [2, 4, 4] -> conv (3x3 same, bias) -> fc (Dense 3x32 on the flattened map, bias)`
pub fn conv_dense() -> Graph {
    let mut graph = Graph::new();
    let input = graph
        .add_node(input_node("input", vec![2, 4, 4]))
        .expect("valid input");
    let conv = graph
        .add_node(conv(
            "conv",
            input,
            Tensor::random_seeded(vec![2, 2, 3, 3], 41),
            true,
        ))
        .expect("valid node");
    let fc = graph
        .add_node(dense("fc", conv, Tensor::random_seeded(vec![3, 32], 42), true))
        .expect("valid node");
    graph.set_outputs(vec![fc]).expect("known output");
    graph
}

pub fn input_node(name: &str, shape: Vec<usize>) -> Node {
    Node::new(name, "InputLayer", Operator::Input { shape }, vec![])
}

pub fn dense(name: &str, input: NodeId, kernel: Tensor, use_bias: bool) -> Node {
    let out = kernel.num_channels();
    let node = Node::new(name, "Dense", Operator::Dense, vec![input])
        .with_weight(KERNEL_ATTR, kernel)
        .with_framework_attr("use_bias", use_bias);
    if use_bias {
        node.with_weight(BIAS_ATTR, Tensor::random_seeded(vec![out], out as u64))
    } else {
        node
    }
}

pub fn conv(name: &str, input: NodeId, kernel: Tensor, use_bias: bool) -> Node {
    let out = kernel.num_channels();
    let node = Node::new(
        name,
        "Conv2D",
        Operator::Conv2d {
            stride: 1,
            padding: Padding::Same,
            pad_value: 0.0,
        },
        vec![input],
    )
    .with_weight(KERNEL_ATTR, kernel)
    .with_framework_attr("use_bias", use_bias);
    if use_bias {
        node.with_weight(BIAS_ATTR, Tensor::random_seeded(vec![out], out as u64 + 100))
    } else {
        node
    }
}

/// `n` random samples matching the input shapes of `graph`, values in `[-1, 1)`.
pub fn calibration_set(graph: &Graph, n: usize, seed: u64) -> Vec<Vec<Tensor>> {
    let shapes = graph
        .inputs()
        .into_iter()
        .filter_map(|id| match &graph.node(id).ok()?.operator {
            Operator::Input { shape } => Some(shape.clone()),
            _ => None,
        })
        .collect_vec();
    (0..n)
        .map(|i| {
            shapes
                .iter()
                .enumerate()
                .map(|(j, shape)| {
                    let sample_seed = seed * 1000 + (i * shapes.len() + j) as u64;
                    Tensor::random_seeded(shape.clone(), sample_seed)
                })
                .collect()
        })
        .collect()
}

/// Installs a `tracing` subscriber honouring `RUST_LOG`, once per test binary.
#[cfg(test)]
pub(crate) fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
