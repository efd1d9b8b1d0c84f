//! Trainable quantizers for quantization-aware fine-tuning. Every quantizer is a forward
//! simulated quantization paired with its straight-through backward pass, so a training loop
//! without autograd support for rounding can still propagate gradients through it.
mod activation;
pub mod ste;
mod weights;
mod wrapper;

use quantkit::{NodeId, Tensor};

pub use activation::SteActivationQuantizer;
pub use weights::SteWeightQuantizer;
pub use wrapper::{NodeQuantizers, QuantizerSet, build_quantizers};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum QatError {
    #[error("gradient of shape {grad:?} does not match input of shape {input:?}")]
    GradientShape {
        input: Vec<usize>,
        grad: Vec<usize>,
    },
    #[error("quantizer has {expected} thresholds, got {got}")]
    ThresholdCount { expected: usize, got: usize },
    #[error("node {0} has an enabled quantization config without threshold")]
    MissingThreshold(NodeId),
    #[error("no quantizer for node {0}")]
    UnknownNode(NodeId),
}

/// Gradients produced by the backward pass of a quantizer.
#[derive(Clone, Debug, PartialEq)]
pub struct QuantizerGradients {
    /// Gradient with respect to the quantizer input.
    pub input: Tensor,
    /// Gradient with respect to each threshold, `None` for fixed thresholds.
    pub threshold: Option<Vec<f32>>,
}

/// A simulated quantizer with a straight-through gradient.
pub trait TrainableQuantizer: Send + Sync {
    fn forward(&self, input: &Tensor) -> Tensor;

    /// Straight-through backward pass: rounding is the identity, clipping lets the gradient
    /// through inside the representable range only.
    fn backward(
        &self,
        input: &Tensor,
        grad_output: &Tensor,
    ) -> Result<QuantizerGradients, QatError>;

    /// Effective thresholds, after the method constraint.
    fn thresholds(&self) -> Vec<f32>;

    fn is_trainable(&self) -> bool;
}

pub(crate) fn check_gradient_shape(input: &Tensor, grad: &Tensor) -> Result<(), QatError> {
    if input.shape() != grad.shape() {
        return Err(QatError::GradientShape {
            input: input.get_shape(),
            grad: grad.get_shape(),
        });
    }
    Ok(())
}
