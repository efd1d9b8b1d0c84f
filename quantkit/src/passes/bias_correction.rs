use std::collections::BTreeSet;

use tracing::{debug, info, instrument};

use crate::{graph::Graph, target_platform::FrameworkInfo};

use super::{CorrectionError, PassOutcome, subtract_from_bias};

/// Folds the bias correction term of every eligible node into its bias: a non empty term
/// that was not applied yet, on a node not handled by the second-moment correction.
#[instrument(name = "bias correction", skip_all)]
pub fn apply_bias_correction_to_graph(
    graph: &Graph,
    fw_info: &FrameworkInfo,
) -> Result<PassOutcome, CorrectionError> {
    let mut corrected = graph.clone();
    let mut rewritten = BTreeSet::new();
    for id in graph.node_ids() {
        let node = corrected.node_mut(id)?;
        let Some(cfg) = node.final_weights_quantization_cfg.as_ref() else {
            continue;
        };
        if cfg.has_bias_correction() && cfg.weights_second_moment_correction {
            debug!(
                "node {}: skipped, handled by the second moment correction",
                node.name
            );
            continue;
        }
        if !cfg.needs_bias_correction() {
            continue;
        }
        let Some(term) = cfg.bias_corrected.clone() else {
            continue;
        };
        subtract_from_bias(node, &term, fw_info)?;
        if let Some(cfg) = node.final_weights_quantization_cfg.as_mut() {
            cfg.bias_correction_applied = true;
        }
        debug!("node {}: bias corrected", node.name);
        rewritten.insert(id);
    }
    info!("bias correction applied to {} nodes", rewritten.len());
    Ok(PassOutcome {
        graph: corrected,
        rewritten,
    })
}
