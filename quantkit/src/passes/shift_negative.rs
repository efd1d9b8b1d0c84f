use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::{
    config::QuantizationConfig,
    graph::{Graph, KERNEL_ATTR, Node, NodeId, Operator},
    quantization::{
        NodeActivationQuantizationConfig, QuantizationGrid, ThresholdSearch, weighted_error,
    },
    statistics::{Histogram, NodeStatistics},
    target_platform::{FrameworkInfo, opset},
    tensor::Tensor,
};

use super::{
    CorrectionError, PassOutcome, kernel_row_sums, single_consumer, subtract_from_bias,
};

/// Number of shifts tried by the parameter search, as fractions `k / N` of the negative range.
const SHIFT_SEARCH_STEPS: usize = 8;

/// Activation whose negative range is worth shifting and the linear node reading it.
#[derive(Clone, Debug)]
struct Candidate {
    activation: NodeId,
    consumer: NodeId,
    cfg: NodeActivationQuantizationConfig,
    threshold: f32,
    min: f32,
    histogram: Histogram,
}

fn find_candidates(
    graph: &Graph,
    stats: &BTreeMap<NodeId, NodeStatistics>,
    qc: &QuantizationConfig,
) -> Result<Vec<Candidate>, CorrectionError> {
    let mut candidates = vec![];
    for id in graph.topological_order()? {
        let node = graph.node(id)?;
        let Operator::Activation(kind) = &node.operator else {
            continue;
        };
        let Some(cfg) = node.final_activation_quantization_cfg.as_ref() else {
            continue;
        };
        if !kind.has_negative_lobe() || !cfg.enabled {
            continue;
        }
        let Some(threshold) = cfg.threshold else {
            continue;
        };
        let node_stats = stats.get(&id).ok_or(CorrectionError::MissingStatistics(id))?;
        if node_stats.min >= 0.0 || node_stats.min.abs() / threshold <= qc.shift_negative_ratio {
            continue;
        }
        let Some(consumer) = single_consumer(graph, id) else {
            debug!("node {}: no single consumer, not shifted", node.name);
            continue;
        };
        let consumer_node = graph.node(consumer)?;
        if !consumer_node.operator.is_linear() || consumer_node.inputs != [id] {
            debug!("node {}: consumer is not linear, not shifted", node.name);
            continue;
        }
        candidates.push(Candidate {
            activation: id,
            consumer,
            cfg: cfg.clone(),
            threshold,
            min: node_stats.min,
            histogram: node_stats.histogram.z_filtered(qc.z_threshold),
        });
    }
    Ok(candidates)
}

/// Error of the unsigned quantization of the shifted activation, with the threshold the
/// search would pick for it.
fn shifted_error(
    candidate: &Candidate,
    search: &ThresholdSearch,
    shift: f32,
    qc: &QuantizationConfig,
) -> f64 {
    let shifted = candidate.histogram.shifted(shift);
    let threshold = search.select_from_histogram(&shifted, false);
    let centers = shifted.bin_centers();
    let counts: Vec<f32> = shifted.counts().iter().map(|c| *c as f32).collect();
    let quantized =
        QuantizationGrid::new(threshold, candidate.cfg.n_bits, false).quantize_slice(&centers);
    weighted_error(
        &centers,
        &quantized,
        Some(&counts),
        candidate.cfg.error_method,
        qc.l_p_value,
    )
}

/// Shift applied to the activation: its whole negative range, or with the parameter search
/// the fraction of it minimizing the quantization error. Ties keep the smallest shift.
fn select_shift(candidate: &Candidate, search: &ThresholdSearch, qc: &QuantizationConfig) -> f32 {
    let full = candidate.min.abs();
    if !qc.shift_negative_params_search {
        return full;
    }
    let mut best = (full, f64::INFINITY);
    for k in 1..=SHIFT_SEARCH_STEPS {
        let shift = full * k as f32 / SHIFT_SEARCH_STEPS as f32;
        let err = shifted_error(candidate, search, shift, qc);
        if err < best.1 {
            best = (shift, err);
        }
    }
    best.0
}

/// Inserts `Add{shift}` after the activation and compensates the shift in the consumer.
/// Returns the id of the inserted node.
fn rewrite(
    graph: &mut Graph,
    candidate: &Candidate,
    shift: f32,
    threshold: f32,
    fw_info: &FrameworkInfo,
) -> Result<NodeId, CorrectionError> {
    let activation = graph.node_mut(candidate.activation)?;
    let name = format!("{}_shift", activation.name);
    if let Some(cfg) = activation.final_activation_quantization_cfg.as_mut() {
        cfg.enabled = false;
    }

    let mut shift_node = Node::new(
        name,
        "Add".to_string(),
        Operator::Add {
            operand: Some(shift),
        },
        vec![candidate.activation],
    );
    shift_node.opset = Some(opset::ADD.to_string());
    shift_node.final_activation_quantization_cfg = Some(NodeActivationQuantizationConfig {
        signed: false,
        threshold: Some(threshold),
        ..candidate.cfg.clone()
    });
    let shift_id = graph.add_node(shift_node)?;
    graph.replace_input(candidate.consumer, candidate.activation, shift_id)?;

    let consumer = graph.node_mut(candidate.consumer)?;
    let kernel = consumer.require_weight(KERNEL_ATTR)?;
    let term = Tensor::from_vec(kernel_row_sums(kernel)).scalar_mul(shift);
    subtract_from_bias(consumer, &term, fw_info)?;
    if let Operator::Conv2d { pad_value, .. } = &mut consumer.operator {
        *pad_value += shift;
    }
    Ok(shift_id)
}

/// True when the float outputs of `candidate` stay within `ratio` of the ones of `reference`,
/// relative to the largest reference output, on every calibration sample.
pub(crate) fn outputs_within_tolerance(
    reference: &Graph,
    candidate: &Graph,
    calibration: &[Vec<Tensor>],
    ratio: f32,
) -> Result<bool> {
    for sample in calibration {
        let expected = reference.run(sample).context("evaluating the reference graph")?;
        let actual = candidate.run(sample).context("evaluating the corrected graph")?;
        for output in reference.outputs() {
            let (Some(e), Some(a)) = (expected.get(*output), actual.get(*output)) else {
                return Ok(false);
            };
            let diff = e.sub(a).context("comparing graph outputs")?.max_abs();
            if diff > ratio * e.max_abs().max(f32::EPSILON) {
                debug!("output {output} moved by {diff}");
                return Ok(false);
            }
        }
    }
    Ok(true)
}

/// Moves activations with a significant negative range into an unsigned range: the output
/// of the activation is shifted by a constant, quantized unsigned after the shift, and the
/// shift is removed again in the bias of the single linear node reading it. A rewrite that
/// changes the float outputs by more than `shift_negative_ratio` on the calibration set is
/// rolled back.
#[instrument(name = "shift negative correction", skip_all)]
pub fn apply_shift_negative_correction(
    graph: &Graph,
    stats: &BTreeMap<NodeId, NodeStatistics>,
    calibration: &[Vec<Tensor>],
    qc: &QuantizationConfig,
    fw_info: &FrameworkInfo,
) -> Result<PassOutcome, CorrectionError> {
    let mut corrected = graph.clone();
    let mut rewritten = BTreeSet::new();
    for candidate in find_candidates(graph, stats, qc)? {
        let search = ThresholdSearch::new(
            candidate.cfg.method,
            candidate.cfg.error_method,
            candidate.cfg.n_bits,
            qc,
        );
        let shift = select_shift(&candidate, &search, qc);
        let threshold = if qc.shift_negative_threshold_recalculation {
            search.select_from_histogram(&candidate.histogram.shifted(shift), false)
        } else {
            candidate
                .cfg
                .method
                .constrain(candidate.threshold + shift, qc.min_threshold)
        };

        let before = corrected.clone();
        let shift_id = rewrite(&mut corrected, &candidate, shift, threshold, fw_info)?;
        if !outputs_within_tolerance(graph, &corrected, calibration, qc.shift_negative_ratio)? {
            warn!(
                "shift of node {} rolled back, outputs moved beyond tolerance",
                candidate.activation
            );
            corrected = before;
            continue;
        }
        debug!(
            "node {}: shifted by {shift}, new threshold {threshold}",
            candidate.activation
        );
        rewritten.extend([candidate.activation, shift_id, candidate.consumer]);
    }
    info!("shift negative correction rewrote {} nodes", rewritten.len());
    Ok(PassOutcome {
        graph: corrected,
        rewritten,
    })
}
