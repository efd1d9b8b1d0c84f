use crate::{config::QuantizationErrorMethod, statistics::Histogram};

/// Smoothing added to empty bins before computing the KL divergence.
const KL_EPSILON: f64 = 1e-10;

/// Error between `values` and their quantized version `quantized`, weighted by `weights` (one
/// per value, e.g. histogram counts or hessian scores). Uniform weights when `None`.
///
/// NOCLIPPING and KL are not element wise measures, they fall back to MSE here.
pub fn weighted_error(
    values: &[f32],
    quantized: &[f32],
    weights: Option<&[f32]>,
    method: QuantizationErrorMethod,
    l_p_value: u32,
) -> f64 {
    let p = match method {
        QuantizationErrorMethod::Mae => 1,
        QuantizationErrorMethod::Lp => l_p_value.max(1) as i32,
        _ => 2,
    };
    let (sum, norm) = values
        .iter()
        .zip(quantized.iter())
        .enumerate()
        .fold((0f64, 0f64), |(sum, norm), (i, (x, q))| {
            let w = weights.map(|w| w[i] as f64).unwrap_or(1.0);
            let diff = (*x as f64 - *q as f64).abs();
            (sum + w * diff.powi(p), norm + w)
        });
    if norm <= 0.0 { 0.0 } else { sum / norm }
}

/// KL divergence between the distribution described by `hist` and the distribution obtained
/// after mapping every bin through `quantizer`. Clipping piles up mass at the range border and
/// a too coarse grid collapses bins together, both raise the divergence.
pub fn kl_divergence_error<F: Fn(f32) -> f32>(hist: &Histogram, quantizer: F) -> f64 {
    let total = hist.total();
    if total == 0 {
        return 0.0;
    }
    let mut quantized_counts = vec![0f64; hist.num_bins()];
    for (center, count) in hist.bin_centers().iter().zip(hist.counts()) {
        if *count > 0 {
            quantized_counts[hist.bin_index(quantizer(*center))] += *count as f64;
        }
    }
    let q_norm: f64 = quantized_counts
        .iter()
        .map(|q| q + KL_EPSILON)
        .sum::<f64>();
    hist.counts()
        .iter()
        .zip(quantized_counts.iter())
        .filter(|(p, _)| **p > 0)
        .map(|(p, q)| {
            let p = *p as f64 / total as f64;
            let q = (q + KL_EPSILON) / q_norm;
            p * (p / q).ln()
        })
        .sum()
}
