//! Error enum for [`super::Tensor`] and its related operations

pub type Shape = Vec<usize>;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum TensorError {
    #[error("Shapes {left:?} and {right:?} cannot be broadcast together")]
    ShapeMismatch { left: Shape, right: Shape },
    #[error("Parameters to tensor method were incorrect: {0}")]
    ParameterError(String),
}
