use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, instrument};

use crate::{
    config::QuantizationConfig,
    graph::{Graph, KERNEL_ATTR, NodeId},
    quantization::QuantizationGrid,
    statistics::{Histogram, NodeStatistics},
    target_platform::FrameworkInfo,
    tensor::Tensor,
};

use super::{CorrectionError, PassOutcome, kernel_row_sums, subtract_from_bias};

/// Mean quantization error `E[Q(x) - x]` of an activation, estimated on its histogram.
pub(crate) fn mean_quantization_error(hist: &Histogram, grid: &QuantizationGrid) -> f64 {
    let total = hist.total();
    if total == 0 {
        return 0.0;
    }
    let sum: f64 = hist
        .bin_centers()
        .iter()
        .zip(hist.counts())
        .map(|(c, n)| (grid.quantize(*c) - c) as f64 * *n as f64)
        .sum();
    sum / total as f64
}

/// Compensates in the bias of every linear node the mean error introduced by the
/// quantization of its input activation: `bias -= W . E[Q(x) - x]`. The correction is only
/// applied when the error, relative to the threshold of the activation, is above
/// `activation_bias_correction_threshold`.
#[instrument(name = "activation bias correction", skip_all)]
pub fn apply_activation_bias_correction(
    graph: &Graph,
    stats: &BTreeMap<NodeId, NodeStatistics>,
    qc: &QuantizationConfig,
    fw_info: &FrameworkInfo,
) -> Result<PassOutcome, CorrectionError> {
    let mut corrected = graph.clone();
    let mut rewritten = BTreeSet::new();
    for id in graph.topological_order()? {
        let node = graph.node(id)?;
        if !node.operator.is_linear() {
            continue;
        }
        let [input] = node.inputs.as_slice() else {
            continue;
        };
        let Some(grid) = graph
            .node(*input)?
            .final_activation_quantization_cfg
            .as_ref()
            .and_then(|cfg| cfg.grid())
        else {
            continue;
        };
        let input_stats = stats
            .get(input)
            .ok_or(CorrectionError::MissingStatistics(*input))?;
        let hist = input_stats.histogram.z_filtered(qc.z_threshold);
        let error = mean_quantization_error(&hist, &grid);
        let normalized = error.abs() / grid.threshold as f64;
        if error == 0.0 || normalized <= qc.activation_bias_correction_threshold as f64 {
            continue;
        }
        let kernel = node.require_weight(KERNEL_ATTR)?;
        let term = Tensor::from_vec(kernel_row_sums(kernel)).scalar_mul(error as f32);
        subtract_from_bias(corrected.node_mut(id)?, &term, fw_info)?;
        debug!(
            "node {}: input quantization error {error:.6} compensated",
            node.name
        );
        rewritten.insert(id);
    }
    info!(
        "activation bias correction applied to {} nodes",
        rewritten.len()
    );
    Ok(PassOutcome {
        graph: corrected,
        rewritten,
    })
}
