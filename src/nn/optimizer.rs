//! Adam optimizer with per-layer moment estimates.

use super::conv::{ConvGrads, PeriodicConv2D};
use ndarray::{Array1, Array4};

struct ParamState {
    m_w: Array4<f32>,
    v_w: Array4<f32>,
    m_b: Array1<f32>,
    v_b: Array1<f32>,
}

/// Adam with the usual moment decays and a 1e-7 epsilon.
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    step: i32,
    state: Vec<ParamState>,
}

impl Adam {
    pub fn new(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-7,
            step: 0,
            state: Vec::new(),
        }
    }

    /// Apply one update across all layers. Moment buffers are created on
    /// first use, so the optimizer needs no up-front knowledge of shapes.
    pub fn apply(&mut self, layers: &mut [PeriodicConv2D], grads: &[ConvGrads]) {
        if self.state.is_empty() {
            for layer in layers.iter() {
                self.state.push(ParamState {
                    m_w: Array4::zeros(layer.weights.raw_dim()),
                    v_w: Array4::zeros(layer.weights.raw_dim()),
                    m_b: Array1::zeros(layer.bias.raw_dim()),
                    v_b: Array1::zeros(layer.bias.raw_dim()),
                });
            }
        }
        self.step += 1;
        let bias_corr1 = 1.0 - self.beta1.powi(self.step);
        let bias_corr2 = 1.0 - self.beta2.powi(self.step);
        let scale = self.learning_rate * bias_corr2.sqrt() / bias_corr1;

        for ((layer, grad), state) in layers.iter_mut().zip(grads).zip(&mut self.state) {
            state
                .m_w
                .zip_mut_with(&grad.weights, |m, &g| *m = self.beta1 * *m + (1.0 - self.beta1) * g);
            state
                .v_w
                .zip_mut_with(&grad.weights, |v, &g| *v = self.beta2 * *v + (1.0 - self.beta2) * g * g);
            ndarray::Zip::from(&mut layer.weights)
                .and(&state.m_w)
                .and(&state.v_w)
                .for_each(|w, &m, &v| *w -= scale * m / (v.sqrt() + self.eps));

            state
                .m_b
                .zip_mut_with(&grad.bias, |m, &g| *m = self.beta1 * *m + (1.0 - self.beta1) * g);
            state
                .v_b
                .zip_mut_with(&grad.bias, |v, &g| *v = self.beta2 * *v + (1.0 - self.beta2) * g * g);
            ndarray::Zip::from(&mut layer.bias)
                .and(&state.m_b)
                .and(&state.v_b)
                .for_each(|b, &m, &v| *b -= scale * m / (v.sqrt() + self.eps));
        }
    }
}
