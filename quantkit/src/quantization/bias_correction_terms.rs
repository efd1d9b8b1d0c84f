use std::collections::BTreeMap;

use anyhow::{Context, Result, ensure};
use tracing::{debug, instrument};

use crate::{
    graph::{Graph, KERNEL_ATTR, NodeId, Operator},
    statistics::NodeStatistics,
    tensor::Tensor,
};

/// Expected output error of a linear node caused by quantizing its kernel:
/// `term[o] = sum_i sum_k (Q(W) - W)[o, i, k] * E[x_i]`, where `E[x_i]` is the calibration
/// mean of input channel `i`.
pub(crate) fn bias_correction_term(
    kernel: &Tensor,
    quantized: &Tensor,
    input_means: &[f32],
) -> Result<Tensor> {
    let shape = kernel.get_shape();
    ensure!(
        shape.len() >= 2,
        "kernel of shape {shape:?} has no input channel axis"
    );
    let (out_channels, in_channels) = (shape[0], shape[1]);
    ensure!(
        in_channels == input_means.len(),
        "kernel expects {in_channels} input channels, statistics have {}",
        input_means.len()
    );
    let spatial = kernel.len() / (out_channels * in_channels).max(1);
    let error = quantized.sub(kernel)?;
    let term = error
        .get_data()
        .chunks(in_channels * spatial)
        .map(|row| {
            row.chunks(spatial)
                .zip(input_means.iter())
                .map(|(k, mean)| k.iter().sum::<f32>() * mean)
                .sum::<f32>()
        })
        .collect();
    Ok(Tensor::new(vec![out_channels], term))
}

/// Input means matching the input axis of `kernel`. Dense flattens its input, so a Dense
/// node fed by a feature map needs one mean per element instead of one per channel.
fn input_means<'a>(
    operator: &Operator,
    kernel: &Tensor,
    input_stats: &'a NodeStatistics,
) -> &'a [f32] {
    let in_channels = kernel.get_shape().get(1).copied().unwrap_or_default();
    if matches!(operator, Operator::Dense)
        && in_channels != input_stats.channel_means.len()
        && in_channels == input_stats.element_means.len()
    {
        &input_stats.element_means
    } else {
        &input_stats.channel_means
    }
}

/// Stores in the final weights config of every linear node with a quantized kernel the term
/// the bias correction pass subtracts from the bias.
#[instrument(name = "compute bias correction terms", skip_all)]
pub fn compute_bias_correction_terms(
    graph: &Graph,
    stats: &BTreeMap<NodeId, NodeStatistics>,
) -> Result<Graph> {
    let mut corrected = graph.clone();
    for (id, node) in corrected.nodes_mut() {
        if !node.operator.is_linear() {
            continue;
        }
        let (Some(cfg), Some(kernel)) = (
            node.final_weights_quantization_cfg.as_mut(),
            node.weights.get(KERNEL_ATTR),
        ) else {
            continue;
        };
        let Some(kernel_cfg) = cfg.attr_config(KERNEL_ATTR).filter(|c| c.enabled) else {
            continue;
        };
        let input = node
            .inputs
            .first()
            .with_context(|| format!("linear node {} has no input", node.name))?;
        let input_stats = stats
            .get(input)
            .with_context(|| format!("no statistics for the input of node {}", node.name))?;
        let quantized = kernel_cfg.quantize(kernel);
        let means = input_means(&node.operator, kernel, input_stats);
        let term = bias_correction_term(kernel, &quantized, means)
            .with_context(|| format!("bias correction term of node {}", node.name))?;
        debug!("node {id}: bias correction term {:?}", term.get_data());
        cfg.bias_corrected = Some(term);
    }
    Ok(corrected)
}
