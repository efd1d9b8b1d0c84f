use std::collections::BTreeMap;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument};

use crate::{
    config::QuantizationConfig,
    graph::{Graph, NodeId},
    statistics::NodeStatistics,
    target_platform::TargetPlatformCapabilities,
};

use super::{
    HessianScores, NodeActivationQuantizationConfig, NodeWeightsQuantizationConfig,
    ThresholdSearch, WeightsAttrQuantizationConfig,
};

/// Selects the thresholds of every node and stores them as the node's final weights and
/// activation configs. The input graph is left untouched.
#[instrument(name = "set quantization configs", skip_all)]
pub fn set_quantization_configs(
    graph: &Graph,
    stats: &BTreeMap<NodeId, NodeStatistics>,
    qc: &QuantizationConfig,
    tpc: &TargetPlatformCapabilities,
    hessian: &dyn HessianScores,
) -> Result<Graph> {
    let mut configured = graph.clone();
    for id in graph.topological_order()? {
        let node = configured.node_mut(id)?;
        let op_cfg = tpc.op_config(node.opset.as_deref());

        let enabled = op_cfg.enable_activation_quantization && !op_cfg.quantization_preserving;
        let mut act_cfg = NodeActivationQuantizationConfig {
            method: op_cfg.activation_quantization_method,
            n_bits: op_cfg.activation_n_bits,
            ..NodeActivationQuantizationConfig::new(qc, enabled)
        };
        if enabled {
            let node_stats = stats
                .get(&id)
                .with_context(|| format!("no statistics collected for node {}", node.name))?;
            act_cfg.signed = node_stats.is_signed();
            let hist = node_stats.histogram.z_filtered(qc.z_threshold);
            let search =
                ThresholdSearch::new(act_cfg.method, act_cfg.error_method, act_cfg.n_bits, qc);
            let threshold = search.select_from_histogram(&hist, act_cfg.signed);
            debug!(
                "node {}: activation threshold {threshold} (signed: {})",
                node.name, act_cfg.signed
            );
            act_cfg.threshold = Some(threshold);
        }
        node.final_activation_quantization_cfg = Some(act_cfg);

        if node.weights.is_empty() {
            node.final_weights_quantization_cfg = None;
            continue;
        }
        let mut weights_cfg = NodeWeightsQuantizationConfig::new(
            qc.weights_second_moment_correction && node.operator.is_linear(),
        );
        for (attr, value) in &node.weights {
            let mut attr_cfg = WeightsAttrQuantizationConfig::new(op_cfg.attr_config(attr), qc);
            if attr_cfg.enabled {
                let scores = hessian.weights_scores(&node.name, attr);
                let search = ThresholdSearch::new(
                    attr_cfg.method,
                    attr_cfg.error_method,
                    attr_cfg.n_bits,
                    qc,
                );
                attr_cfg.threshold =
                    search.select_for_tensor(value, attr_cfg.per_channel, scores.as_ref());
                debug!(
                    "node {}: {} thresholds selected for {attr}",
                    node.name,
                    attr_cfg.threshold.len()
                );
            }
            weights_cfg.set_attr_config(attr.clone(), attr_cfg);
        }
        node.final_weights_quantization_cfg = Some(weights_cfg);
    }
    info!("quantization configs set for {} nodes", configured.len());
    Ok(configured)
}
