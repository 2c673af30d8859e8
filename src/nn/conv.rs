//! Periodic-boundary convolution.
//!
//! The longitude axis of a lat/lon grid wraps around the globe while the
//! latitude axis terminates at the poles. A standard valid convolution gets
//! that topology by explicit padding: wrap columns from the opposite
//! longitude edge, zero-pad the latitude edge, then convolve with no further
//! padding. Padding is a plain transform composed in front of the
//! convolution, not baked into it.
//!
//! Tensor layout is (batch, lat, lon, channel) throughout.

use super::{Activation, ModelError};
use ndarray::{s, Array1, Array4, Axis, Zip};
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

/// Pad `pad` wrapped columns on each longitude edge and `pad` zero rows on
/// each latitude edge.
pub fn pad_periodic(input: &Array4<f32>, pad: usize) -> Array4<f32> {
    let (b, h, w, c) = input.dim();
    let mut out = Array4::<f32>::zeros((b, h + 2 * pad, w + 2 * pad, c));
    out.slice_mut(s![.., pad..pad + h, pad..pad + w, ..])
        .assign(input);
    if pad > 0 {
        out.slice_mut(s![.., pad..pad + h, ..pad, ..])
            .assign(&input.slice(s![.., .., w - pad.., ..]));
        out.slice_mut(s![.., pad..pad + h, pad + w.., ..])
            .assign(&input.slice(s![.., .., ..pad, ..]));
    }
    out
}

/// Backward of [`pad_periodic`]: crop, then fold the wrapped-column
/// gradients back onto the opposite longitude edge. Zero-padded latitude
/// rows contribute nothing.
pub fn pad_periodic_backward(grad: &Array4<f32>, pad: usize) -> Array4<f32> {
    let (_, hp, wp, _) = grad.dim();
    let h = hp - 2 * pad;
    let w = wp - 2 * pad;
    let mut out = grad
        .slice(s![.., pad..pad + h, pad..pad + w, ..])
        .to_owned();
    if pad > 0 {
        let left = grad.slice(s![.., pad..pad + h, ..pad, ..]);
        let right = grad.slice(s![.., pad..pad + h, pad + w.., ..]);
        out.slice_mut(s![.., .., w - pad.., ..])
            .zip_mut_with(&left, |o, &g| *o += g);
        out.slice_mut(s![.., .., ..pad, ..])
            .zip_mut_with(&right, |o, &g| *o += g);
    }
    out
}

/// Valid convolution with stride 1. Weights are (k, k, in, out).
pub fn conv2d_valid(input: &Array4<f32>, weights: &Array4<f32>, bias: &Array1<f32>) -> Array4<f32> {
    let (b, h, w, cin) = input.dim();
    let (k, _, wcin, cout) = weights.dim();
    debug_assert_eq!(cin, wcin);
    let oh = h - k + 1;
    let ow = w - k + 1;

    let mut out = Array4::<f32>::zeros((b, oh, ow, cout));
    Zip::from(out.outer_iter_mut())
        .and(input.outer_iter())
        .par_for_each(|mut out_s, in_s| {
            for co in 0..cout {
                let mut plane = out_s.slice_mut(s![.., .., co]);
                plane.fill(bias[co]);
                for di in 0..k {
                    for dj in 0..k {
                        for ci in 0..cin {
                            let wv = weights[[di, dj, ci, co]];
                            if wv == 0.0 {
                                continue;
                            }
                            let win = in_s.slice(s![di..di + oh, dj..dj + ow, ci]);
                            plane.zip_mut_with(&win, |o, &x| *o += wv * x);
                        }
                    }
                }
            }
        });
    out
}

/// Gradients of [`conv2d_valid`] with respect to input, weights and bias.
pub fn conv2d_valid_backward(
    input: &Array4<f32>,
    weights: &Array4<f32>,
    grad_out: &Array4<f32>,
) -> (Array4<f32>, Array4<f32>, Array1<f32>) {
    let (b, h, w, cin) = input.dim();
    let (k, _, _, cout) = weights.dim();
    let (_, oh, ow, _) = grad_out.dim();
    debug_assert_eq!(grad_out.dim().0, b);

    let grad_bias = grad_out
        .sum_axis(Axis(0))
        .sum_axis(Axis(0))
        .sum_axis(Axis(0));

    let mut grad_weights = Array4::<f32>::zeros((k, k, cin, cout));
    Zip::indexed(&mut grad_weights).par_for_each(|(di, dj, ci, co), gw| {
        let win = input.slice(s![.., di..di + oh, dj..dj + ow, ci]);
        let go = grad_out.slice(s![.., .., .., co]);
        *gw = win.iter().zip(go.iter()).map(|(&x, &g)| x * g).sum();
    });

    let mut grad_input = Array4::<f32>::zeros((b, h, w, cin));
    Zip::from(grad_input.outer_iter_mut())
        .and(grad_out.outer_iter())
        .par_for_each(|mut gin_s, go_s| {
            for di in 0..k {
                for dj in 0..k {
                    for ci in 0..cin {
                        for co in 0..cout {
                            let wv = weights[[di, dj, ci, co]];
                            if wv == 0.0 {
                                continue;
                            }
                            let go = go_s.slice(s![.., .., co]);
                            gin_s
                                .slice_mut(s![di..di + oh, dj..dj + ow, ci])
                                .zip_mut_with(&go, |gi, &g| *gi += wv * g);
                        }
                    }
                }
            }
        });

    (grad_input, grad_weights, grad_bias)
}

/// Intermediate values kept from the forward pass for backpropagation.
pub struct ConvCache {
    padded: Array4<f32>,
    preactivation: Array4<f32>,
}

/// Parameter gradients for one layer.
pub struct ConvGrads {
    pub weights: Array4<f32>,
    pub bias: Array1<f32>,
}

/// A square, stride-1 convolution over a cylindrical grid.
pub struct PeriodicConv2D {
    pub weights: Array4<f32>,
    pub bias: Array1<f32>,
    kernel_size: usize,
    activation: Activation,
}

impl PeriodicConv2D {
    /// Kernel size must be odd: `(k - 1) / 2` padding is only symmetric for
    /// odd k, and an even kernel would silently shift the grid.
    pub fn new(
        in_channels: usize,
        filters: usize,
        kernel_size: usize,
        activation: Activation,
        rng: &mut StdRng,
    ) -> Result<Self, ModelError> {
        if kernel_size == 0 || kernel_size % 2 == 0 {
            return Err(ModelError::InvalidKernel(kernel_size));
        }
        let fan_in = (kernel_size * kernel_size * in_channels) as f32;
        let init = Normal::new(0.0f32, (2.0 / fan_in).sqrt())
            .map_err(|_| ModelError::InvalidKernel(kernel_size))?;
        let weights = Array4::from_shape_simple_fn(
            (kernel_size, kernel_size, in_channels, filters),
            || init.sample(rng),
        );
        Ok(Self {
            weights,
            bias: Array1::zeros(filters),
            kernel_size,
            activation,
        })
    }

    pub fn in_channels(&self) -> usize {
        self.weights.len_of(Axis(2))
    }

    pub fn out_channels(&self) -> usize {
        self.weights.len_of(Axis(3))
    }

    pub fn kernel_size(&self) -> usize {
        self.kernel_size
    }

    pub fn pad_width(&self) -> usize {
        (self.kernel_size - 1) / 2
    }

    /// Forward pass; keeps the padded input and preactivation for backward.
    pub fn forward(&self, input: &Array4<f32>) -> (Array4<f32>, ConvCache) {
        let padded = pad_periodic(input, self.pad_width());
        let preactivation = conv2d_valid(&padded, &self.weights, &self.bias);
        let output = preactivation.mapv(|z| self.activation.apply(z));
        (
            output,
            ConvCache {
                padded,
                preactivation,
            },
        )
    }

    /// Backward pass from the gradient of the loss w.r.t. this layer's
    /// activated output.
    pub fn backward(&self, cache: &ConvCache, grad_output: &Array4<f32>) -> (Array4<f32>, ConvGrads) {
        let mut grad_z = grad_output.clone();
        Zip::from(&mut grad_z)
            .and(&cache.preactivation)
            .par_for_each(|g, &z| *g *= self.activation.grad(z));

        let (grad_padded, grad_weights, grad_bias) =
            conv2d_valid_backward(&cache.padded, &self.weights, &grad_z);
        let grad_input = pad_periodic_backward(&grad_padded, self.pad_width());
        (
            grad_input,
            ConvGrads {
                weights: grad_weights,
                bias: grad_bias,
            },
        )
    }
}
