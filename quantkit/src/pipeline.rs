//! End to end post-training quantization of a graph. The stages run in a fixed order and
//! every stage works on a copy of the graph produced by the previous one:
//!
//! 1. config and graph validation, opset resolution
//! 2. linear collapsing, residual collapsing, relu bound to power of two
//! 3. statistics collection and threshold selection
//! 4. shift negative correction, followed by a new statistics collection when it rewrote
//!    anything
//! 5. bias correction terms and bias correction
//! 6. activation bias correction
//!
//! Disabled stages are skipped. The graph given by the caller is never mutated.
use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use tracing::{debug, info, instrument};

use crate::{
    config::QuantizationConfig,
    graph::{Graph, NodeId},
    passes::{
        PassOutcome, apply_activation_bias_correction, apply_bias_correction_to_graph,
        apply_shift_negative_correction, linear_collapsing, relu_bound_to_power_of_two,
        residual_collapsing,
    },
    quantization::{HessianScores, compute_bias_correction_terms, set_quantization_configs},
    statistics::{NodeStatistics, StatisticsCollector},
    target_platform::{
        FrameworkInfo, TargetPlatformCapabilities, resolve_opsets, restore_framework_names,
    },
    tensor::Tensor,
};

/// One stage of a quantization run: the graph it started from and the nodes it rewrote.
#[derive(Clone, Debug, PartialEq)]
pub struct StageReport {
    pub name: &'static str,
    pub before: Graph,
    pub rewritten: BTreeSet<NodeId>,
}

/// Distribution of `|float - quantized|` over every output value of the calibration set,
/// float being the input graph and quantized the simulated quantization of the final one.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutputErrorSummary {
    pub mean: f64,
    pub std_dev: f64,
    pub max: f64,
    pub count: usize,
}

impl OutputErrorSummary {
    fn from_errors(errors: &[f64]) -> Option<Self> {
        if errors.is_empty() {
            return None;
        }
        let std_dev = if errors.len() > 1 {
            errors.iter().std_dev()
        } else {
            0.0
        };
        Some(Self {
            mean: errors.iter().mean(),
            std_dev,
            max: errors.iter().fold(0f64, |acc, e| acc.max(*e)),
            count: errors.len(),
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunReport {
    pub stages: Vec<StageReport>,
    pub output_error: Option<OutputErrorSummary>,
}

impl RunReport {
    pub fn stage(&self, name: &str) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Records a pass outcome and returns the graph it produced.
    fn record(&mut self, name: &'static str, before: Graph, outcome: PassOutcome) -> Graph {
        debug!("stage {name}: {} nodes rewritten", outcome.rewritten.len());
        self.stages.push(StageReport {
            name,
            before,
            rewritten: outcome.rewritten,
        });
        outcome.graph
    }
}

/// Stage names used in the [`RunReport`].
pub mod stage {
    pub const RESOLVE_OPSETS: &str = "resolve opsets";
    pub const LINEAR_COLLAPSING: &str = "linear collapsing";
    pub const RESIDUAL_COLLAPSING: &str = "residual collapsing";
    pub const RELU_BOUND: &str = "relu bound to power of two";
    pub const THRESHOLD_SELECTION: &str = "threshold selection";
    pub const SHIFT_NEGATIVE: &str = "shift negative correction";
    pub const BIAS_CORRECTION: &str = "bias correction";
    pub const ACTIVATION_BIAS_CORRECTION: &str = "activation bias correction";
}

/// Result of [`quantize`]: the graph carrying the final quantization configs of every node.
#[derive(Clone, Debug)]
pub struct QuantizedModel {
    pub graph: Graph,
    /// Calibration statistics of `graph`.
    pub statistics: BTreeMap<NodeId, NodeStatistics>,
    pub report: RunReport,
}

impl QuantizedModel {
    /// Graph handed back to the framework adapter: enabled weight attributes hold their
    /// simulated-quantized values and attributes are named as in the framework again.
    pub fn export(&self) -> Result<Graph> {
        let mut exported = self.graph.clone();
        for (id, node) in exported.nodes_mut() {
            let Some(cfg) = node.final_weights_quantization_cfg.as_ref() else {
                continue;
            };
            for (attr, value) in node.weights.iter_mut() {
                if let Some(attr_cfg) = cfg.attr_config(attr).filter(|c| c.enabled) {
                    ensure!(
                        !attr_cfg.threshold.is_empty(),
                        "attribute {attr} of node {id} is enabled without threshold"
                    );
                    *value = attr_cfg.quantize(value);
                }
            }
        }
        Ok(restore_framework_names(&exported))
    }

    /// Output of the simulated quantized graph on one sample.
    pub fn run(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        let trace = self.graph.run_quantized(inputs)?;
        self.graph
            .outputs()
            .iter()
            .map(|o| trace.get(*o).cloned().context("missing graph output"))
            .collect()
    }
}

fn output_errors(
    reference: &Graph,
    quantized: &Graph,
    calibration: &[Vec<Tensor>],
) -> Result<Vec<f64>> {
    ensure!(
        reference.outputs().len() == quantized.outputs().len(),
        "quantized graph has {} outputs, expected {}",
        quantized.outputs().len(),
        reference.outputs().len()
    );
    let mut errors = vec![];
    for sample in calibration {
        let expected = reference.run(sample)?;
        let actual = quantized.run_quantized(sample)?;
        for (e, a) in reference.outputs().iter().zip(quantized.outputs()) {
            let (Some(e), Some(a)) = (expected.get(*e), actual.get(*a)) else {
                continue;
            };
            errors.extend(
                e.get_data()
                    .iter()
                    .zip(a.get_data())
                    .map(|(x, y)| (x - y).abs() as f64),
            );
        }
    }
    Ok(errors)
}

/// Quantizes `graph` with the thresholds calibrated on `calibration`, one tensor per graph
/// input in every sample.
#[instrument(name = "quantize", skip_all, fields(nodes = graph.len(), samples = calibration.len()))]
pub fn quantize(
    graph: &Graph,
    calibration: &[Vec<Tensor>],
    qc: &QuantizationConfig,
    tpc: &TargetPlatformCapabilities,
    fw_info: &FrameworkInfo,
    hessian: &dyn HessianScores,
) -> Result<QuantizedModel> {
    qc.validate().context("invalid quantization config")?;
    graph.validate().context("invalid input graph")?;
    ensure!(!calibration.is_empty(), "the calibration set is empty");

    let mut report = RunReport::default();
    let resolved = resolve_opsets(graph, fw_info, qc.custom_tpc_opset_to_layer.as_ref())?;
    let mut current = report.record(
        stage::RESOLVE_OPSETS,
        graph.clone(),
        PassOutcome::unchanged(resolved),
    );

    if qc.linear_collapsing {
        let outcome = linear_collapsing(&current, fw_info)?;
        current = report.record(stage::LINEAR_COLLAPSING, current, outcome);
    }
    if qc.residual_collapsing {
        let outcome = residual_collapsing(&current)?;
        current = report.record(stage::RESIDUAL_COLLAPSING, current, outcome);
    }
    if qc.relu_bound_to_power_of_2 {
        let outcome = relu_bound_to_power_of_two(&current)?;
        current = report.record(stage::RELU_BOUND, current, outcome);
    }

    let collector = StatisticsCollector::default();
    let mut statistics = collector.collect(&current, calibration)?;
    let configured = set_quantization_configs(&current, &statistics, qc, tpc, hessian)?;
    let all_nodes = configured.node_ids().into_iter().collect();
    current = report.record(
        stage::THRESHOLD_SELECTION,
        current,
        PassOutcome {
            graph: configured,
            rewritten: all_nodes,
        },
    );

    if qc.shift_negative_activation_correction {
        let outcome =
            apply_shift_negative_correction(&current, &statistics, calibration, qc, fw_info)?;
        let shifted = !outcome.rewritten.is_empty();
        current = report.record(stage::SHIFT_NEGATIVE, current, outcome);
        if shifted {
            statistics = collector.collect(&current, calibration)?;
        }
    }

    if qc.weights_bias_correction {
        let with_terms = compute_bias_correction_terms(&current, &statistics)?;
        let outcome = apply_bias_correction_to_graph(&with_terms, fw_info)?;
        current = report.record(stage::BIAS_CORRECTION, current, outcome);
    }

    if qc.activation_bias_correction {
        let outcome = apply_activation_bias_correction(&current, &statistics, qc, fw_info)?;
        current = report.record(stage::ACTIVATION_BIAS_CORRECTION, current, outcome);
    }

    let errors = output_errors(graph, &current, calibration)?;
    report.output_error = OutputErrorSummary::from_errors(&errors);
    if let Some(summary) = &report.output_error {
        info!(
            "quantization done: mean output error {:.6} (std {:.6}, max {:.6})",
            summary.mean, summary.std_dev, summary.max
        );
    }
    Ok(QuantizedModel {
        graph: current,
        statistics,
        report,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::CustomOpsetLayers,
        graph::{ActivationKind, BIAS_ATTR, KERNEL_ATTR, Operator},
        quantization::NoHessianScores,
        target_platform::opset,
        testing::{
            calibration_set, conv_activation_conv, conv_dense, dense_chain, dense_relu_dense,
            dense_residual, init_test_logging,
        },
    };

    fn run(graph: &Graph, qc: &QuantizationConfig) -> QuantizedModel {
        let calibration = calibration_set(graph, 8, 1);
        quantize(
            graph,
            &calibration,
            qc,
            &TargetPlatformCapabilities::from_config(qc),
            &FrameworkInfo::keras(),
            &NoHessianScores,
        )
        .unwrap()
    }

    #[test]
    fn test_default_pipeline() {
        init_test_logging();
        let graph = dense_relu_dense();
        let original = graph.clone();
        let model = run(&graph, &QuantizationConfig::default());
        assert_eq!(graph, original);

        let names: Vec<_> = model.report.stages.iter().map(|s| s.name).collect();
        assert_eq!(
            names,
            vec![
                stage::RESOLVE_OPSETS,
                stage::LINEAR_COLLAPSING,
                stage::RESIDUAL_COLLAPSING,
                stage::THRESHOLD_SELECTION,
                stage::SHIFT_NEGATIVE,
                stage::BIAS_CORRECTION,
            ]
        );
        for (_, node) in model.graph.nodes() {
            assert!(node.final_activation_quantization_cfg.is_some());
            if node.operator.is_linear() {
                let cfg = node.final_weights_quantization_cfg.as_ref().unwrap();
                assert!(cfg.bias_correction_applied);
            }
        }
        let summary = model.report.output_error.unwrap();
        assert!(summary.mean.is_finite() && summary.max >= summary.mean);
        // 8 samples of 2 outputs
        assert_eq!(summary.count, 16);
        assert_eq!(model.run(&calibration_set(&graph, 1, 2)[0]).unwrap().len(), 1);
    }

    #[test]
    fn test_collapsing_stages() {
        let model = run(&dense_chain(), &QuantizationConfig::default());
        assert_eq!(model.graph.len(), 2);
        let model = run(&dense_residual(), &QuantizationConfig::default());
        assert!(model.graph.find("add").is_none());

        let qc = QuantizationConfig {
            linear_collapsing: false,
            residual_collapsing: false,
            ..Default::default()
        };
        let model = run(&dense_chain(), &qc);
        assert_eq!(model.graph.len(), 4);
        assert!(model.report.stage(stage::LINEAR_COLLAPSING).is_none());
    }

    #[test]
    fn test_shift_negative_stage() {
        let qc = QuantizationConfig {
            shift_negative_ratio: 0.01,
            activation_bias_correction: true,
            ..Default::default()
        };
        let model = run(&conv_activation_conv(ActivationKind::Swish, 2), &qc);
        let shift = model.graph.find("act_shift").unwrap();
        // statistics were collected again on the corrected graph
        assert!(model.statistics.contains_key(&shift));
        assert!(!model.report.stage(stage::SHIFT_NEGATIVE).unwrap().rewritten.is_empty());
        assert!(model.report.stage(stage::ACTIVATION_BIAS_CORRECTION).is_some());
    }

    #[test]
    fn test_dense_on_feature_map() {
        let graph = conv_dense();
        assert!(graph.run(&calibration_set(&graph, 1, 4)[0]).is_ok());
        let qc = QuantizationConfig {
            activation_bias_correction: true,
            ..Default::default()
        };
        let model = run(&graph, &qc);
        let fc = model.graph.find("fc").unwrap();
        let cfg = model
            .graph
            .node(fc)
            .unwrap()
            .final_weights_quantization_cfg
            .as_ref()
            .unwrap();
        assert!(cfg.bias_correction_applied);
        assert_eq!(cfg.bias_corrected.as_ref().unwrap().get_shape(), vec![3]);
        assert_eq!(model.graph.node(fc).unwrap().bias().unwrap().get_shape(), vec![3]);
    }

    #[test]
    fn test_export() {
        let model = run(&dense_relu_dense(), &QuantizationConfig::default());
        let exported = model.export().unwrap();
        let fc1 = exported.find("fc1").unwrap();
        let node = exported.node(fc1).unwrap();
        let cfg = model
            .graph
            .node(fc1)
            .unwrap()
            .final_weights_quantization_cfg
            .clone()
            .unwrap();
        let kernel_cfg = cfg.attr_config(KERNEL_ATTR).unwrap();
        for (row, t) in node.kernel().unwrap().channel_slices().zip(&kernel_cfg.threshold) {
            let step = t / 128.0;
            for v in row {
                assert!(((v / step).round() * step - v).abs() < 1e-6);
            }
        }
        // bias is not quantized
        assert_eq!(
            node.bias(),
            model.graph.node(fc1).unwrap().weights.get(BIAS_ATTR)
        );

        let torch = quantize(
            &dense_relu_dense_torch(),
            &calibration_set(&dense_relu_dense(), 4, 3),
            &QuantizationConfig::default(),
            &TargetPlatformCapabilities::from_config(&QuantizationConfig::default()),
            &FrameworkInfo::pytorch(),
            &NoHessianScores,
        )
        .unwrap();
        let exported = torch.export().unwrap();
        let fc1 = exported.node(exported.find("fc1").unwrap()).unwrap();
        assert!(fc1.weights.contains_key("weight"));
        assert!(!fc1.weights.contains_key(KERNEL_ATTR));
    }

    fn dense_relu_dense_torch() -> Graph {
        let mut graph = dense_relu_dense();
        for (_, node) in graph.nodes_mut() {
            node.layer_type = match node.operator {
                Operator::Input { .. } => "placeholder",
                Operator::Dense => "Linear",
                _ => "ReLU",
            }
            .to_string();
            if let Some(kernel) = node.weights.remove(KERNEL_ATTR) {
                node.weights.insert("weight".into(), kernel);
            }
        }
        graph
    }

    #[test]
    fn test_custom_opsets_and_invalid_config() {
        let mut custom = BTreeMap::new();
        custom.insert(
            opset::NO_QUANTIZATION.to_string(),
            CustomOpsetLayers::new(["ReLU"]),
        );
        let qc = QuantizationConfig {
            custom_tpc_opset_to_layer: Some(custom),
            ..Default::default()
        };
        let tpc = TargetPlatformCapabilities::from_config(&qc);
        let graph = dense_relu_dense();
        let model = quantize(
            &graph,
            &calibration_set(&graph, 4, 3),
            &qc,
            &tpc,
            &FrameworkInfo::keras(),
            &NoHessianScores,
        )
        .unwrap();
        let relu = model.graph.node(model.graph.find("relu").unwrap()).unwrap();
        assert_eq!(relu.opset.as_deref(), Some(opset::NO_QUANTIZATION));

        let bad = QuantizationConfig {
            weights_n_bits: 1,
            ..Default::default()
        };
        let res = quantize(
            &graph,
            &calibration_set(&graph, 4, 3),
            &bad,
            &TargetPlatformCapabilities::from_config(&bad),
            &FrameworkInfo::keras(),
            &NoHessianScores,
        );
        assert!(res.is_err());
        let empty = quantize(&graph, &[], &qc, &tpc, &FrameworkInfo::keras(), &NoHessianScores);
        assert!(empty.is_err());
    }
}
