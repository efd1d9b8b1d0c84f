//! Calibration statistics. The graph is evaluated on every calibration sample and the output
//! of each node is summarised in a [`NodeStatistics`].
//!
//! Aggregation runs in two phases: the value range of every node is reduced first, then the
//! histograms are filled over that fixed range. Both reductions are associative and
//! commutative so the result does not depend on how samples are split across threads.

mod histogram;

use std::collections::BTreeMap;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::{
    graph::{Graph, GraphError, NodeId, Trace},
    tensor::Tensor,
};

pub use histogram::{DEFAULT_NUM_BINS, Histogram};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum StatisticsError {
    #[error("the calibration set is empty")]
    EmptyCalibration,
    #[error("cannot build a histogram without values")]
    EmptyHistogram,
    #[error("histograms with different ranges or bin counts cannot be merged")]
    IncompatibleHistograms,
    #[error("output of node {0} changed shape between calibration samples")]
    InconsistentShape(NodeId),
    #[error("evaluation failed during calibration: {0}")]
    Graph(#[from] GraphError),
}

/// Statistics of the output of one node over the calibration set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeStatistics {
    pub min: f32,
    pub max: f32,
    pub histogram: Histogram,
    /// Mean of every slice of axis 0 (features for 1-D outputs, channels for `[c, h, w]`).
    pub channel_means: Vec<f32>,
    /// Mean of every element of the output, in row-major order. Used for consumers that
    /// flatten their input.
    pub element_means: Vec<f32>,
    /// Number of calibration samples the statistics were collected on.
    pub count: usize,
}

impl NodeStatistics {
    pub fn is_signed(&self) -> bool {
        self.min < 0.0
    }

    pub fn mean(&self) -> f64 {
        self.histogram.mean()
    }
}

/// Range and element sums of one node on part of the calibration set.
#[derive(Clone, Debug)]
struct RangeStats {
    min: f32,
    max: f32,
    element_sums: Vec<f64>,
    num_channels: usize,
    count: usize,
}

impl RangeStats {
    fn from_tensor(tensor: &Tensor) -> Self {
        Self {
            min: tensor.min_value(),
            max: tensor.max_value(),
            element_sums: tensor.get_data().iter().map(|v| *v as f64).collect(),
            num_channels: tensor.num_channels().max(1),
            count: 1,
        }
    }

    fn merge(mut self, other: &RangeStats, id: NodeId) -> Result<Self, StatisticsError> {
        if self.element_sums.len() != other.element_sums.len()
            || self.num_channels != other.num_channels
        {
            return Err(StatisticsError::InconsistentShape(id));
        }
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.element_sums
            .iter_mut()
            .zip(other.element_sums.iter())
            .for_each(|(a, b)| *a += b);
        self.count += other.count;
        Ok(self)
    }

    fn element_means(&self) -> Vec<f32> {
        let norm = self.count.max(1) as f64;
        self.element_sums.iter().map(|s| (s / norm) as f32).collect()
    }

    fn channel_means(&self) -> Vec<f32> {
        let channel_len = (self.element_sums.len() / self.num_channels).max(1);
        let norm = (self.count * channel_len).max(1) as f64;
        self.element_sums
            .chunks(channel_len)
            .map(|c| (c.iter().sum::<f64>() / norm) as f32)
            .collect()
    }
}

#[derive(Clone, Debug)]
pub struct StatisticsCollector {
    pub num_bins: usize,
}

impl Default for StatisticsCollector {
    fn default() -> Self {
        Self {
            num_bins: DEFAULT_NUM_BINS,
        }
    }
}

impl StatisticsCollector {
    pub fn new(num_bins: usize) -> Self {
        Self {
            num_bins: num_bins.max(1),
        }
    }

    /// Collects the statistics of every node of `graph`. Each calibration sample holds one
    /// tensor per graph input.
    #[instrument(name = "collect statistics", skip_all, fields(samples = calibration.len()))]
    pub fn collect(
        &self,
        graph: &Graph,
        calibration: &[Vec<Tensor>],
    ) -> Result<BTreeMap<NodeId, NodeStatistics>, StatisticsError> {
        if calibration.is_empty() {
            return Err(StatisticsError::EmptyCalibration);
        }
        // phase 1: value range and channel sums, summed in sample order
        let per_sample = calibration
            .par_iter()
            .map(|sample| -> Result<BTreeMap<NodeId, RangeStats>, StatisticsError> {
                let trace = graph.run(sample)?;
                Ok(trace
                    .iter()
                    .map(|(id, t)| (*id, RangeStats::from_tensor(t)))
                    .collect())
            })
            .collect::<Result<Vec<_>, _>>()?;
        let mut ranges = per_sample
            .into_iter()
            .map(Ok::<_, StatisticsError>)
            .reduce(|acc, next| merge_ranges(acc?, &next?))
            .ok_or(StatisticsError::EmptyCalibration)??;

        // phase 2: histograms over the fixed ranges
        let empty: BTreeMap<NodeId, Histogram> = ranges
            .iter()
            .map(|(id, r)| (*id, Histogram::new(r.min, r.max, self.num_bins)))
            .collect();
        let histograms = calibration
            .par_iter()
            .map(|sample| -> Result<BTreeMap<NodeId, Histogram>, StatisticsError> {
                let trace = graph.run(sample)?;
                fill_histograms(&empty, &trace)
            })
            .try_reduce(|| empty.clone(), |mut acc, next| {
                for (id, hist) in acc.iter_mut() {
                    if let Some(other) = next.get(id) {
                        hist.merge(other)?;
                    }
                }
                Ok(acc)
            })?;

        let stats = histograms
            .into_iter()
            .filter_map(|(id, histogram)| {
                let range = ranges.remove(&id)?;
                Some((
                    id,
                    NodeStatistics {
                        min: range.min,
                        max: range.max,
                        histogram,
                        channel_means: range.channel_means(),
                        element_means: range.element_means(),
                        count: range.count,
                    },
                ))
            })
            .collect::<BTreeMap<_, _>>();
        debug!(
            "collected statistics of {} nodes over {} samples",
            stats.len(),
            calibration.len()
        );
        Ok(stats)
    }
}

fn merge_ranges(
    mut acc: BTreeMap<NodeId, RangeStats>,
    next: &BTreeMap<NodeId, RangeStats>,
) -> Result<BTreeMap<NodeId, RangeStats>, StatisticsError> {
    for (id, range) in next {
        let merged = match acc.remove(id) {
            Some(current) => current.merge(range, *id)?,
            None => range.clone(),
        };
        acc.insert(*id, merged);
    }
    Ok(acc)
}

fn fill_histograms(
    empty: &BTreeMap<NodeId, Histogram>,
    trace: &Trace,
) -> Result<BTreeMap<NodeId, Histogram>, StatisticsError> {
    let mut histograms = empty.clone();
    for (id, hist) in histograms.iter_mut() {
        let output = trace
            .get(*id)
            .ok_or(StatisticsError::Graph(GraphError::NodeNotFound(*id)))?;
        hist.add_values(output.get_data());
    }
    Ok(histograms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        graph::ActivationKind,
        testing::{calibration_set, conv_activation_conv, dense_relu_dense},
    };

    #[test]
    fn test_collect() {
        let graph = dense_relu_dense();
        let calibration = calibration_set(&graph, 16, 1);
        let stats = StatisticsCollector::new(64)
            .collect(&graph, &calibration)
            .unwrap();
        assert_eq!(stats.len(), graph.len());
        for (id, s) in &stats {
            assert_eq!(s.count, 16);
            assert_eq!(s.histogram.total() as usize, 16 * s.channel_means.len());
            assert!(s.min <= s.max, "node {id}");
        }
        let relu = graph.find("relu").unwrap();
        assert!(!stats[&relu].is_signed());
    }

    #[test]
    fn test_channel_means() {
        let graph = dense_relu_dense();
        let input = graph.inputs()[0];
        let calibration = vec![
            vec![Tensor::from_vec(vec![1.0, -2.0])],
            vec![Tensor::from_vec(vec![3.0, 0.0])],
        ];
        let stats = StatisticsCollector::default()
            .collect(&graph, &calibration)
            .unwrap();
        assert_eq!(stats[&input].channel_means, vec![2.0, -1.0]);
        assert_eq!(stats[&input].element_means, vec![2.0, -1.0]);
        assert_eq!(stats[&input].min, -2.0);
        assert_eq!(stats[&input].max, 3.0);
    }

    #[test]
    fn test_element_means_of_feature_maps() {
        let graph = conv_activation_conv(ActivationKind::Swish, 2);
        let input = graph.inputs()[0];
        let shape = [2, 6, 6];
        let calibration = calibration_set(&graph, 4, 9);
        let stats = StatisticsCollector::default()
            .collect(&graph, &calibration)
            .unwrap();
        let input_stats = &stats[&input];
        assert_eq!(input_stats.channel_means.len(), shape[0]);
        assert_eq!(input_stats.element_means.len(), shape.iter().product::<usize>());
        let first = calibration
            .iter()
            .map(|s| s[0].get_data()[0])
            .sum::<f32>()
            / 4.0;
        assert!((input_stats.element_means[0] - first).abs() < 1e-6);
        // channel means are the means of the element means of each channel
        let channel_len = input_stats.element_means.len() / shape[0];
        for (c, mean) in input_stats.channel_means.iter().enumerate() {
            let expected = input_stats.element_means[c * channel_len..(c + 1) * channel_len]
                .iter()
                .sum::<f32>()
                / channel_len as f32;
            assert!((mean - expected).abs() < 1e-5);
        }
    }

    #[test]
    fn test_sample_order_does_not_matter() {
        let graph = dense_relu_dense();
        let calibration = calibration_set(&graph, 32, 3);
        let mut reversed = calibration.clone();
        reversed.reverse();
        let collector = StatisticsCollector::new(128);
        let a = collector.collect(&graph, &calibration).unwrap();
        let b = collector.collect(&graph, &reversed).unwrap();
        for (id, s) in &a {
            assert_eq!(s.histogram, b[id].histogram);
            assert_eq!((s.min, s.max), (b[id].min, b[id].max));
        }
    }

    #[test]
    fn test_empty_calibration() {
        let graph = dense_relu_dense();
        assert_eq!(
            StatisticsCollector::default().collect(&graph, &[]),
            Err(StatisticsError::EmptyCalibration)
        );
    }
}
