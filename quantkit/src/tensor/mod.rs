//! Dense `f32` tensor used throughout the graph IR: weights, calibration samples and
//! intermediate activations. Data is stored row-major.

mod error;
mod utilities;

use rand::{Rng, SeedableRng, rngs::StdRng, thread_rng};
use serde::{Deserialize, Serialize};

pub use error::{Shape, TensorError};
use utilities::{broadcast_index, get_broadcasted_shape, index_to_coord, strides};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Padding {
    /// No implicit border, the kernel only visits valid positions.
    #[default]
    Valid,
    /// Output spatial size is `ceil(input / stride)`; the border is split as evenly as possible
    /// with the extra row/column going to the bottom/right.
    Same,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    shape: Shape,
    data: Vec<f32>,
}

impl Tensor {
    /// Creates a new tensor. Panics if `data` does not hold exactly `shape.product()` values,
    /// use [`Tensor::try_new`] when the inputs come from outside the crate.
    pub fn new(shape: Shape, data: Vec<f32>) -> Self {
        assert_eq!(
            shape.iter().product::<usize>(),
            data.len(),
            "shape {:?} does not match data length {}",
            shape,
            data.len()
        );
        Self { shape, data }
    }

    pub fn try_new(shape: Shape, data: Vec<f32>) -> Result<Self, TensorError> {
        let expected = shape.iter().product::<usize>();
        if expected != data.len() {
            return Err(TensorError::ParameterError(format!(
                "expected data length to be {}, supplied data had length: {}",
                expected,
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn from_vec(data: Vec<f32>) -> Self {
        Self {
            shape: vec![data.len()],
            data,
        }
    }

    pub fn scalar(value: f32) -> Self {
        Self {
            shape: vec![],
            data: vec![value],
        }
    }

    pub fn zeros(shape: Shape) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            data: vec![0.0; len],
        }
    }

    pub fn identity(n: usize) -> Self {
        let mut t = Self::zeros(vec![n, n]);
        for i in 0..n {
            t.data[i * n + i] = 1.0;
        }
        t
    }

    /// Uniform random values in `[-1, 1)`.
    pub fn random(shape: Shape) -> Self {
        let mut rng = thread_rng();
        Self::random_with(shape, &mut rng)
    }

    pub fn random_seeded(shape: Shape, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        Self::random_with(shape, &mut rng)
    }

    fn random_with<R: Rng>(shape: Shape, rng: &mut R) -> Self {
        let len = shape.iter().product();
        let data = (0..len).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
        Self { shape, data }
    }

    pub fn get_shape(&self) -> Shape {
        self.shape.clone()
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn get_data(&self) -> &[f32] {
        &self.data
    }

    pub fn get_data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Value at the given coordinates. Panics when out of bounds.
    pub fn get(&self, coords: &[usize]) -> f32 {
        let idx = coords
            .iter()
            .zip(strides(&self.shape))
            .map(|(c, s)| c * s)
            .sum::<usize>();
        self.data[idx]
    }

    pub fn max_abs(&self) -> f32 {
        self.data.iter().fold(0.0f32, |acc, v| acc.max(v.abs()))
    }

    pub fn min_value(&self) -> f32 {
        self.data.iter().copied().fold(f32::INFINITY, f32::min)
    }

    pub fn max_value(&self) -> f32 {
        self.data.iter().copied().fold(f32::NEG_INFINITY, f32::max)
    }

    /// Size of the leading (channel) axis, 1 for scalars.
    pub fn num_channels(&self) -> usize {
        self.shape.first().copied().unwrap_or(1)
    }

    /// Contiguous slices along axis 0, one per output channel.
    pub fn channel_slices(&self) -> impl Iterator<Item = &[f32]> {
        let channel_len = self.data.len() / self.num_channels().max(1);
        self.data.chunks(channel_len.max(1))
    }

    pub fn map<F: Fn(f32) -> f32>(&self, f: F) -> Self {
        Self {
            shape: self.shape.clone(),
            data: self.data.iter().map(|v| f(*v)).collect(),
        }
    }

    pub fn neg(&self) -> Self {
        self.map(|v| -v)
    }

    pub fn scalar_mul(&self, factor: f32) -> Self {
        self.map(|v| v * factor)
    }

    /// Element-wise binary operation with standard broadcasting. Incompatible shapes are an
    /// error, nothing is reshaped implicitly.
    pub fn broadcast_with<F: Fn(f32, f32) -> f32>(
        &self,
        other: &Tensor,
        f: F,
    ) -> Result<Tensor, TensorError> {
        if self.shape == other.shape {
            let data = self
                .data
                .iter()
                .zip(other.data.iter())
                .map(|(a, b)| f(*a, *b))
                .collect();
            return Ok(Tensor::new(self.shape.clone(), data));
        }
        let out_shape = get_broadcasted_shape(&self.shape, &other.shape)?;
        let (ls, rs) = (strides(&self.shape), strides(&other.shape));
        let len = out_shape.iter().product::<usize>();
        let data = (0..len)
            .map(|i| {
                let coord = index_to_coord(i, &out_shape);
                let l = self.data[broadcast_index(&coord, &self.shape, &ls)];
                let r = other.data[broadcast_index(&coord, &other.shape, &rs)];
                f(l, r)
            })
            .collect();
        Ok(Tensor::new(out_shape, data))
    }

    pub fn add(&self, other: &Tensor) -> Result<Tensor, TensorError> {
        self.broadcast_with(other, |a, b| a + b)
    }

    pub fn sub(&self, other: &Tensor) -> Result<Tensor, TensorError> {
        self.broadcast_with(other, |a, b| a - b)
    }

    pub fn mul(&self, other: &Tensor) -> Result<Tensor, TensorError> {
        self.broadcast_with(other, |a, b| a * b)
    }

    pub fn reshape(&self, shape: Shape) -> Result<Tensor, TensorError> {
        Tensor::try_new(shape, self.data.clone())
    }

    pub fn flatten(&self) -> Tensor {
        Tensor::from_vec(self.data.clone())
    }

    /// `[m, n] x [n] -> [m]`
    pub fn matvec(&self, vector: &Tensor) -> Result<Tensor, TensorError> {
        if self.rank() != 2 || vector.len() != self.shape[1] {
            return Err(TensorError::ShapeMismatch {
                left: self.shape.clone(),
                right: vector.shape.clone(),
            });
        }
        let cols = self.shape[1];
        let data = self
            .data
            .chunks(cols)
            .map(|row| row.iter().zip(vector.data.iter()).map(|(a, b)| a * b).sum())
            .collect();
        Ok(Tensor::new(vec![self.shape[0]], data))
    }

    /// `[m, k] x [k, n] -> [m, n]`
    pub fn matmul(&self, other: &Tensor) -> Result<Tensor, TensorError> {
        if self.rank() != 2 || other.rank() != 2 || self.shape[1] != other.shape[0] {
            return Err(TensorError::ShapeMismatch {
                left: self.shape.clone(),
                right: other.shape.clone(),
            });
        }
        let (m, k, n) = (self.shape[0], self.shape[1], other.shape[1]);
        let mut data = vec![0.0f32; m * n];
        for i in 0..m {
            for p in 0..k {
                let a = self.data[i * k + p];
                if a == 0.0 {
                    continue;
                }
                for j in 0..n {
                    data[i * n + j] += a * other.data[p * n + j];
                }
            }
        }
        Ok(Tensor::new(vec![m, n], data))
    }

    /// Naive 2D convolution of a `[c, h, w]` input with a `[o, c, kh, kw]` filter. Positions
    /// outside the input read `pad_value`.
    pub fn conv2d(
        &self,
        filter: &Tensor,
        bias: Option<&Tensor>,
        stride: usize,
        padding: Padding,
        pad_value: f32,
    ) -> Result<Tensor, TensorError> {
        if self.rank() != 3 || filter.rank() != 4 || filter.shape[1] != self.shape[0] {
            return Err(TensorError::ShapeMismatch {
                left: self.shape.clone(),
                right: filter.shape.clone(),
            });
        }
        if stride == 0 {
            return Err(TensorError::ParameterError("stride must be positive".into()));
        }
        let (c, h, w) = (self.shape[0], self.shape[1], self.shape[2]);
        let (o, kh, kw) = (filter.shape[0], filter.shape[2], filter.shape[3]);
        if let Some(b) = bias {
            if b.len() != o {
                return Err(TensorError::ShapeMismatch {
                    left: vec![o],
                    right: b.shape.clone(),
                });
            }
        }
        let (out_h, pad_top) = conv_output_dim(h, kh, stride, padding)?;
        let (out_w, pad_left) = conv_output_dim(w, kw, stride, padding)?;
        let mut out = vec![0.0f32; o * out_h * out_w];
        for oc in 0..o {
            let b = bias.map(|b| b.data[oc]).unwrap_or(0.0);
            for oy in 0..out_h {
                for ox in 0..out_w {
                    let mut acc = b;
                    for ic in 0..c {
                        for ky in 0..kh {
                            for kx in 0..kw {
                                let iy = (oy * stride + ky) as isize - pad_top as isize;
                                let ix = (ox * stride + kx) as isize - pad_left as isize;
                                let value = if iy < 0 || ix < 0 || iy >= h as isize || ix >= w as isize
                                {
                                    pad_value
                                } else {
                                    self.data[ic * h * w + iy as usize * w + ix as usize]
                                };
                                let weight = filter.data[((oc * c + ic) * kh + ky) * kw + kx];
                                acc += value * weight;
                            }
                        }
                    }
                    out[(oc * out_h + oy) * out_w + ox] = acc;
                }
            }
        }
        Ok(Tensor::new(vec![o, out_h, out_w], out))
    }
}

/// Returns the output size and the leading padding of one spatial dimension.
pub(crate) fn conv_output_dim(
    input: usize,
    kernel: usize,
    stride: usize,
    padding: Padding,
) -> Result<(usize, usize), TensorError> {
    match padding {
        Padding::Valid => {
            if kernel > input {
                return Err(TensorError::ParameterError(format!(
                    "kernel size {kernel} larger than input {input} with valid padding"
                )));
            }
            Ok(((input - kernel) / stride + 1, 0))
        }
        Padding::Same => {
            let out = input.div_ceil(stride);
            let total = ((out - 1) * stride + kernel).saturating_sub(input);
            Ok((out, total / 2))
        }
    }
}

impl From<Vec<f32>> for Tensor {
    fn from(data: Vec<f32>) -> Self {
        Tensor::from_vec(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_sub() {
        let bias = Tensor::from_vec(vec![1.0, 2.0]);
        let correction = Tensor::from_vec(vec![0.1, -0.2]);
        let res = bias.sub(&correction).unwrap();
        assert_eq!(res.get_data(), &[1.0 - 0.1, 2.0 + 0.2]);

        let scalar = Tensor::scalar(1.0);
        let res = bias.add(&scalar).unwrap();
        assert_eq!(res.get_data(), &[2.0, 3.0]);

        let wrong = Tensor::from_vec(vec![1.0, 2.0, 3.0]);
        assert!(bias.sub(&wrong).is_err());
    }

    #[test]
    fn test_matmul_matvec() {
        let a = Tensor::new(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let v = Tensor::from_vec(vec![1.0, 0.0, -1.0]);
        assert_eq!(a.matvec(&v).unwrap().get_data(), &[-2.0, -2.0]);
        let id = Tensor::identity(3);
        assert_eq!(a.matmul(&id).unwrap(), a);
    }

    #[test]
    fn test_conv2d_same_padding_value() {
        // 1x1 input channel, 3x3 image of ones, 3x3 kernel of ones
        let input = Tensor::new(vec![1, 3, 3], vec![1.0; 9]);
        let filter = Tensor::new(vec![1, 1, 3, 3], vec![1.0; 9]);
        let out = input.conv2d(&filter, None, 1, Padding::Same, 0.0).unwrap();
        assert_eq!(out.get_shape(), vec![1, 3, 3]);
        assert_eq!(out.get(&[0, 0, 0]), 4.0);
        assert_eq!(out.get(&[0, 1, 1]), 9.0);
        // padding with the same value as the image behaves as an infinite plane
        let out = input.conv2d(&filter, None, 1, Padding::Same, 1.0).unwrap();
        assert!(out.get_data().iter().all(|v| *v == 9.0));
        let out = input.conv2d(&filter, None, 1, Padding::Valid, 0.0).unwrap();
        assert_eq!(out.get_data(), &[9.0]);
    }
}
