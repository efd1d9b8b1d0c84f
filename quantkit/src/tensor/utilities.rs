//! Module containing utility functions when dealing with tensors

use super::error::{Shape, TensorError};

/// Row-major strides of a shape.
pub(crate) fn strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1usize; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

/// Converts a flat index into its coordinates for the given shape.
pub(crate) fn index_to_coord(mut index: usize, shape: &[usize]) -> Vec<usize> {
    let mut coord = vec![0usize; shape.len()];
    for (axis, dim) in shape.iter().enumerate().rev() {
        coord[axis] = index % dim;
        index /= dim;
    }
    coord
}

/// Helper function that given two tensor shapes returns the broadcasted shape, following the
/// usual trailing-dimension rules: dimensions are aligned from the right and each pair must
/// either match or contain a 1.
pub(crate) fn get_broadcasted_shape(a: &[usize], b: &[usize]) -> Result<Shape, TensorError> {
    let rank = a.len().max(b.len());
    let mut out = vec![0usize; rank];
    for i in 0..rank {
        let a_dim = if i < rank - a.len() { 1 } else { a[i - (rank - a.len())] };
        let b_dim = if i < rank - b.len() { 1 } else { b[i - (rank - b.len())] };
        out[i] = match (a_dim, b_dim) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => {
                return Err(TensorError::ShapeMismatch {
                    left: a.to_vec(),
                    right: b.to_vec(),
                });
            }
        };
    }
    Ok(out)
}

/// Maps a coordinate of the broadcasted output back to a flat index of an operand with shape
/// `shape` (right aligned, size-1 dimensions repeat).
pub(crate) fn broadcast_index(coord: &[usize], shape: &[usize], strides: &[usize]) -> usize {
    let offset = coord.len() - shape.len();
    shape
        .iter()
        .zip(strides)
        .enumerate()
        .map(|(axis, (dim, stride))| {
            if *dim == 1 {
                0
            } else {
                coord[axis + offset] * stride
            }
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcasted_shape() {
        assert_eq!(get_broadcasted_shape(&[2, 3], &[3]).unwrap(), vec![2, 3]);
        assert_eq!(get_broadcasted_shape(&[4, 1, 3], &[2, 1]).unwrap(), vec![4, 2, 3]);
        assert_eq!(get_broadcasted_shape(&[], &[5]).unwrap(), vec![5]);
        assert!(get_broadcasted_shape(&[2], &[3]).is_err());
    }

    #[test]
    fn test_index_coord() {
        let shape = vec![2, 2, 3];
        assert_eq!(index_to_coord(5, &shape), vec![0, 1, 2]);
        assert_eq!(strides(&shape), vec![6, 3, 1]);
    }
}
