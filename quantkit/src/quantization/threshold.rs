use std::collections::BTreeMap;

use rayon::prelude::*;
use tracing::{trace, warn};

use crate::{
    config::{QuantizationConfig, QuantizationErrorMethod},
    statistics::{DEFAULT_NUM_BINS, Histogram},
    tensor::Tensor,
};

use super::{
    QuantizationGrid, QuantizationMethod, error_functions::kl_divergence_error,
    error_functions::weighted_error,
};

/// Number of power-of-two candidates explored below the no clipping threshold.
pub const N_ITER: usize = 10;
/// Number of points of the symmetric threshold grid.
pub const SYMMETRIC_GRID_SIZE: usize = 100;

/// Source of per-weight sensitivity scores used by the HMSE error method.
pub trait HessianScores: Sync {
    /// Scores for the attribute `attr` of node `node`, same shape as the attribute value.
    fn weights_scores(&self, node: &str, attr: &str) -> Option<Tensor>;
}

/// No scores available, HMSE degrades to MSE.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoHessianScores;

impl HessianScores for NoHessianScores {
    fn weights_scores(&self, _node: &str, _attr: &str) -> Option<Tensor> {
        None
    }
}

/// Precomputed scores keyed by node and attribute name.
#[derive(Clone, Debug, Default)]
pub struct StaticHessianScores {
    scores: BTreeMap<(String, String), Tensor>,
}

impl StaticHessianScores {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<S: Into<String>>(&mut self, node: S, attr: S, scores: Tensor) {
        self.scores.insert((node.into(), attr.into()), scores);
    }
}

impl HessianScores for StaticHessianScores {
    fn weights_scores(&self, node: &str, attr: &str) -> Option<Tensor> {
        self.scores
            .get(&(node.to_string(), attr.to_string()))
            .cloned()
    }
}

/// Searches the threshold minimizing a quantization error among the candidates allowed by a
/// [`QuantizationMethod`]. Candidates are explored in increasing order and a candidate only
/// wins on a strictly lower error, so ties resolve to the smallest threshold.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ThresholdSearch {
    pub method: QuantizationMethod,
    pub error_method: QuantizationErrorMethod,
    pub n_bits: usize,
    pub l_p_value: u32,
    pub min_threshold: f32,
}

impl ThresholdSearch {
    pub fn new(
        method: QuantizationMethod,
        error_method: QuantizationErrorMethod,
        n_bits: usize,
        qc: &QuantizationConfig,
    ) -> Self {
        Self {
            method,
            error_method,
            n_bits,
            l_p_value: qc.l_p_value,
            min_threshold: qc.min_threshold,
        }
    }

    /// Candidate thresholds, sorted, deduplicated and all >= `min_threshold`.
    pub fn candidates(&self, max_abs: f32) -> Vec<f32> {
        let no_clipping = self.method.constrain(max_abs, self.min_threshold);
        let mut candidates: Vec<f32> = match self.method {
            QuantizationMethod::PowerOfTwo => (0..N_ITER)
                .map(|i| (no_clipping / 2f32.powi(i as i32)).max(self.min_threshold))
                .collect(),
            QuantizationMethod::Symmetric => (1..=SYMMETRIC_GRID_SIZE)
                .map(|k| {
                    (no_clipping * k as f32 / SYMMETRIC_GRID_SIZE as f32).max(self.min_threshold)
                })
                .collect(),
        };
        candidates.sort_by(f32::total_cmp);
        candidates.dedup();
        candidates
    }

    fn no_clipping(&self, max_abs: f32) -> f32 {
        self.method.constrain(max_abs, self.min_threshold)
    }

    fn best<F: Fn(f32) -> f64>(&self, candidates: Vec<f32>, error: F) -> f32 {
        let mut best = (self.min_threshold, f64::INFINITY);
        for t in candidates {
            let err = error(t);
            trace!("threshold candidate {t}: error {err}");
            if err < best.1 {
                best = (t, err);
            }
        }
        best.0
    }

    /// Threshold for a set of raw values, e.g. the weights of one output channel. `scores` are
    /// the hessian scores of those values, used by HMSE only.
    pub fn select_from_values(&self, values: &[f32], signed: bool, scores: Option<&[f32]>) -> f32 {
        let max_abs = values.iter().fold(0f32, |acc, v| acc.max(v.abs()));
        if values.is_empty() || max_abs == 0.0 || !max_abs.is_finite() {
            return self.no_clipping(0.0);
        }
        let candidates = self.candidates(max_abs);
        let quantize =
            |t: f32| QuantizationGrid::new(t, self.n_bits, signed).quantize_slice(values);
        match self.error_method {
            QuantizationErrorMethod::NoClipping => self.no_clipping(max_abs),
            QuantizationErrorMethod::Kl => match Histogram::from_values(values, DEFAULT_NUM_BINS) {
                Ok(hist) => self.select_from_histogram(&hist, signed),
                Err(_) => self.no_clipping(max_abs),
            },
            QuantizationErrorMethod::Hmse => {
                let scores = scores.filter(|s| s.len() == values.len());
                if scores.is_none() {
                    warn!("no hessian scores available, HMSE falls back to MSE");
                }
                let method = if scores.is_some() {
                    QuantizationErrorMethod::Hmse
                } else {
                    QuantizationErrorMethod::Mse
                };
                self.best(candidates, |t| {
                    weighted_error(values, &quantize(t), scores, method, self.l_p_value)
                })
            }
            method => self.best(candidates, |t| {
                weighted_error(values, &quantize(t), None, method, self.l_p_value)
            }),
        }
    }

    /// Threshold for an activation described by its collected histogram.
    pub fn select_from_histogram(&self, hist: &Histogram, signed: bool) -> f32 {
        let max_abs = hist.max_abs();
        if hist.total() == 0 || max_abs == 0.0 || !max_abs.is_finite() {
            return self.no_clipping(0.0);
        }
        let candidates = self.candidates(max_abs);
        let centers = hist.bin_centers();
        let counts: Vec<f32> = hist.counts().iter().map(|c| *c as f32).collect();
        match self.error_method {
            QuantizationErrorMethod::NoClipping => self.no_clipping(max_abs),
            QuantizationErrorMethod::Kl => self.best(candidates, |t| {
                let grid = QuantizationGrid::new(t, self.n_bits, signed);
                kl_divergence_error(hist, |x| grid.quantize(x))
            }),
            method => {
                // no per activation hessian information is kept
                let method = if method == QuantizationErrorMethod::Hmse {
                    QuantizationErrorMethod::Mse
                } else {
                    method
                };
                self.best(candidates, |t| {
                    let quantized =
                        QuantizationGrid::new(t, self.n_bits, signed).quantize_slice(&centers);
                    weighted_error(&centers, &quantized, Some(&counts), method, self.l_p_value)
                })
            }
        }
    }

    /// Thresholds of a weight tensor: one per slice of axis 0 when `per_channel`, a single
    /// one otherwise. Channels are searched in parallel.
    pub fn select_for_tensor(
        &self,
        tensor: &Tensor,
        per_channel: bool,
        scores: Option<&Tensor>,
    ) -> Vec<f32> {
        let scores = scores.filter(|s| s.get_shape() == tensor.get_shape());
        if !per_channel || tensor.rank() < 2 {
            return vec![self.select_from_values(
                tensor.get_data(),
                true,
                scores.map(|s| s.get_data()),
            )];
        }
        let channels: Vec<&[f32]> = tensor.channel_slices().collect();
        let score_channels: Option<Vec<&[f32]>> = scores.map(|s| s.channel_slices().collect());
        channels
            .par_iter()
            .enumerate()
            .map(|(i, values)| {
                let channel_scores = score_channels.as_ref().map(|s| s[i]);
                self.select_from_values(values, true, channel_scores)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::quantization::{MIN_THRESHOLD, is_power_of_two};

    fn search(method: QuantizationMethod, error_method: QuantizationErrorMethod) -> ThresholdSearch {
        ThresholdSearch::new(method, error_method, 8, &QuantizationConfig::default())
    }

    #[test]
    fn test_no_clipping_is_max_abs() {
        let values = [-3.2, 1.0, 5.7];
        let sym = search(QuantizationMethod::Symmetric, QuantizationErrorMethod::NoClipping);
        assert_eq!(sym.select_from_values(&values, true, None), 5.7);
        let pot = search(QuantizationMethod::PowerOfTwo, QuantizationErrorMethod::NoClipping);
        assert_eq!(pot.select_from_values(&values, true, None), 8.0);
    }

    #[rstest]
    #[case(QuantizationErrorMethod::NoClipping)]
    #[case(QuantizationErrorMethod::Mse)]
    #[case(QuantizationErrorMethod::Mae)]
    #[case(QuantizationErrorMethod::Lp)]
    #[case(QuantizationErrorMethod::Kl)]
    #[case(QuantizationErrorMethod::Hmse)]
    fn test_power_of_two_selection(#[case] error_method: QuantizationErrorMethod) {
        let t = Tensor::random_seeded(vec![4, 16], 7);
        let s = search(QuantizationMethod::PowerOfTwo, error_method);
        let thresholds = s.select_for_tensor(&t, true, None);
        assert_eq!(thresholds.len(), 4);
        for th in thresholds {
            assert!(is_power_of_two(th));
            assert!(th >= MIN_THRESHOLD);
            assert_eq!(QuantizationMethod::PowerOfTwo.constrain(th, MIN_THRESHOLD), th);
        }
    }

    #[test]
    fn test_all_zero_gives_min_threshold() {
        let s = search(QuantizationMethod::PowerOfTwo, QuantizationErrorMethod::Mse);
        assert_eq!(s.select_from_values(&[0.0; 8], true, None), MIN_THRESHOLD);
        assert_eq!(s.select_from_values(&[], true, None), MIN_THRESHOLD);
        let hist = Histogram::from_values(&[0.0; 8], 16).unwrap();
        assert_eq!(s.select_from_histogram(&hist, false), MIN_THRESHOLD);
    }

    #[test]
    fn test_candidates_sorted_and_floored() {
        let s = search(QuantizationMethod::PowerOfTwo, QuantizationErrorMethod::Mse);
        let c = s.candidates(5.0);
        assert_eq!(c.len(), N_ITER);
        assert_eq!(*c.last().unwrap(), 8.0);
        assert!(c.windows(2).all(|w| w[0] < w[1]));
        let tiny = s.candidates(1e-6);
        assert_eq!(tiny, vec![MIN_THRESHOLD]);
        let sym = search(QuantizationMethod::Symmetric, QuantizationErrorMethod::Mse);
        assert_eq!(sym.candidates(1.0).len(), SYMMETRIC_GRID_SIZE);
    }

    #[test]
    fn test_mse_clips_outlier() {
        // a single outlier is cheaper to clip than to keep in range at 2 bits
        let mut values = vec![1.0f32; 200];
        values.extend_from_slice(&[-1.0; 200]);
        values.push(7.9);
        let s = ThresholdSearch::new(
            QuantizationMethod::PowerOfTwo,
            QuantizationErrorMethod::Mse,
            2,
            &QuantizationConfig::default(),
        );
        let t = s.select_from_values(&values, true, None);
        assert!(t < 8.0);
    }

    #[test]
    fn test_ties_pick_smallest() {
        // every candidate clips nothing and quantizes 0 exactly, all errors are 0
        let s = search(QuantizationMethod::PowerOfTwo, QuantizationErrorMethod::Mse);
        let t = s.best(vec![0.5, 1.0, 2.0], |_| 0.0);
        assert_eq!(t, 0.5);
    }

    #[test]
    fn test_hessian_scores() {
        let mut scores = StaticHessianScores::new();
        scores.insert("dense", "kernel", Tensor::from_vec(vec![1.0, 0.0]));
        assert!(scores.weights_scores("dense", "kernel").is_some());
        assert!(scores.weights_scores("dense", "bias").is_none());
        assert!(NoHessianScores.weights_scores("dense", "kernel").is_none());

        // zero score on the outlier lets HMSE clip it freely
        let values = [0.1, 7.9];
        let s = ThresholdSearch::new(
            QuantizationMethod::PowerOfTwo,
            QuantizationErrorMethod::Hmse,
            2,
            &QuantizationConfig::default(),
        );
        let t = s.select_from_values(&values, true, Some(&[1.0, 0.0]));
        assert!(t < 1.0);
    }
}
