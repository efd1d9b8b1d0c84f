//! Straight-through estimator primitives. Each forward function comes with the gradient mask
//! the backward pass multiplies the incoming gradient with.

use quantkit::Tensor;

pub fn ste_round(input: &Tensor) -> Tensor {
    input.map(f32::round)
}

/// Rounding is treated as the identity.
pub fn ste_round_grad(grad_output: &Tensor) -> Tensor {
    grad_output.clone()
}

pub fn ste_clip(input: &Tensor, min: f32, max: f32) -> Tensor {
    input.map(|v| v.clamp(min, max))
}

/// 1 where `min <= x <= max`, 0 elsewhere. Quantizers pass the rounded integers
/// `round(x / step)` and the integer range of their grid.
pub fn ste_clip_mask(input: &Tensor, min: f32, max: f32) -> Tensor {
    input.map(|v| if (min..=max).contains(&v) { 1.0 } else { 0.0 })
}

/// `round(x / step)` clipped to `[min_int, max_int]`, then scaled back.
pub fn ste_quantize(input: &Tensor, step: f32, min_int: f32, max_int: f32) -> Tensor {
    input.map(|v| (v / step).round().clamp(min_int, max_int) * step)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_and_clip() {
        let x = Tensor::from_vec(vec![-2.6, -0.4, 0.5, 1.49, 3.0]);
        assert_eq!(ste_round(&x).get_data(), &[-3.0, -0.0, 1.0, 1.0, 3.0]);
        assert_eq!(ste_clip(&x, -1.0, 1.0).get_data(), &[-1.0, -0.4, 0.5, 1.0, 1.0]);
        assert_eq!(
            ste_clip_mask(&x, -1.0, 1.0).get_data(),
            &[0.0, 1.0, 1.0, 0.0, 0.0]
        );
        let grad = Tensor::from_vec(vec![0.1, 0.2, 0.3, 0.4, 0.5]);
        assert_eq!(ste_round_grad(&grad), grad);
    }

    #[test]
    fn test_quantize() {
        let x = Tensor::from_vec(vec![-1.2, 0.26, 0.74, 2.0]);
        // step 0.5, integers in [-2, 1]
        assert_eq!(
            ste_quantize(&x, 0.5, -2.0, 1.0).get_data(),
            &[-1.0, 0.5, 0.5, 0.5]
        );
    }
}
