//! A stack of periodic convolutions trained with mean-squared error.
//!
//! Hidden layers share one activation; the final layer is linear so the
//! network can regress unbounded physical fields. Dropout is inverted, so
//! inference needs no rescaling.

use super::conv::{ConvCache, ConvGrads, PeriodicConv2D};
use super::optimizer::Adam;
use super::{Activation, ModelError};
use ndarray::{Array1, Array4, Axis};
use ndarray_npy::{NpzReader, NpzWriter};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs::File;
use std::path::Path;

pub struct Network {
    layers: Vec<PeriodicConv2D>,
    dropout: f32,
    rng: StdRng,
}

impl Network {
    /// Build a network of `filters.len()` layers. `filters[i]` is the output
    /// width of layer i, `kernels[i]` its (odd) kernel size.
    pub fn build(
        in_channels: usize,
        filters: &[usize],
        kernels: &[usize],
        activation: Activation,
        dropout: f32,
        seed: u64,
    ) -> Result<Self, ModelError> {
        if filters.is_empty() {
            return Err(ModelError::NoLayers);
        }
        if filters.len() != kernels.len() {
            return Err(ModelError::MismatchedLayerSpec {
                filters: filters.len(),
                kernels: kernels.len(),
            });
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let mut layers = Vec::with_capacity(filters.len());
        let mut channels = in_channels;
        let last = filters.len() - 1;
        for (i, (&f, &k)) in filters.iter().zip(kernels).enumerate() {
            let act = if i == last { Activation::Linear } else { activation };
            layers.push(PeriodicConv2D::new(channels, f, k, act, &mut rng)?);
            channels = f;
        }
        Ok(Self {
            layers,
            dropout,
            rng,
        })
    }

    pub fn in_channels(&self) -> usize {
        self.layers[0].in_channels()
    }

    pub fn out_channels(&self) -> usize {
        self.layers[self.layers.len() - 1].out_channels()
    }

    fn check_input(&self, x: &Array4<f32>) -> Result<(), ModelError> {
        let actual = x.len_of(Axis(3));
        if actual != self.in_channels() {
            return Err(ModelError::ChannelMismatch {
                expected: self.in_channels(),
                actual,
            });
        }
        Ok(())
    }

    /// Inference pass: no dropout.
    pub fn forward(&self, x: &Array4<f32>) -> Result<Array4<f32>, ModelError> {
        self.check_input(x)?;
        let mut a = x.clone();
        for layer in &self.layers {
            let (out, _) = layer.forward(&a);
            a = out;
        }
        Ok(a)
    }

    /// One optimizer step on a batch. Returns the batch MSE before the
    /// update.
    pub fn train_step(
        &mut self,
        x: &Array4<f32>,
        y: &Array4<f32>,
        opt: &mut Adam,
    ) -> Result<f32, ModelError> {
        self.check_input(x)?;
        let last = self.layers.len() - 1;
        let keep = 1.0 - self.dropout;

        let mut caches: Vec<ConvCache> = Vec::with_capacity(self.layers.len());
        let mut masks: Vec<Option<Array4<f32>>> = Vec::with_capacity(self.layers.len());
        let mut a = x.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            let (mut out, cache) = layer.forward(&a);
            caches.push(cache);
            if i < last && self.dropout > 0.0 {
                let mask = Array4::from_shape_simple_fn(out.raw_dim(), || {
                    if self.rng.gen::<f32>() < keep {
                        1.0 / keep
                    } else {
                        0.0
                    }
                });
                out *= &mask;
                masks.push(Some(mask));
            } else {
                masks.push(None);
            }
            a = out;
        }

        let n = a.len() as f32;
        let diff = &a - y;
        let loss = diff.iter().map(|d| d * d).sum::<f32>() / n;
        let mut grad = diff.mapv(|d| 2.0 * d / n);

        let mut grads: Vec<ConvGrads> = Vec::with_capacity(self.layers.len());
        for i in (0..self.layers.len()).rev() {
            if let Some(mask) = &masks[i] {
                grad *= mask;
            }
            let (grad_in, layer_grads) = self.layers[i].backward(&caches[i], &grad);
            grads.push(layer_grads);
            grad = grad_in;
        }
        grads.reverse();
        opt.apply(&mut self.layers, &grads);
        Ok(loss)
    }

    /// Mean-squared error over a batch without updating weights.
    pub fn evaluate(&self, x: &Array4<f32>, y: &Array4<f32>) -> Result<f32, ModelError> {
        let pred = self.forward(x)?;
        let n = pred.len() as f32;
        Ok(pred
            .iter()
            .zip(y.iter())
            .map(|(p, t)| (p - t) * (p - t))
            .sum::<f32>()
            / n)
    }

    /// Persist every layer's weights and biases as `w{i}`/`b{i}` arrays.
    pub fn save_weights(&self, path: &Path) -> Result<(), ModelError> {
        let mut npz = NpzWriter::new(File::create(path)?);
        for (i, layer) in self.layers.iter().enumerate() {
            npz.add_array(format!("w{}", i), &layer.weights)?;
            npz.add_array(format!("b{}", i), &layer.bias)?;
        }
        npz.finish()?;
        Ok(())
    }

    /// Load a snapshot written by [`Network::save_weights`] into a network of
    /// matching architecture.
    pub fn load_weights(&mut self, path: &Path) -> Result<(), ModelError> {
        let mut npz = NpzReader::new(File::open(path)?)?;
        for (i, layer) in self.layers.iter_mut().enumerate() {
            let w: Array4<f32> = npz
                .by_name(&format!("w{}", i))
                .map_err(|_| ModelError::SnapshotMismatch(format!("missing array w{}", i)))?;
            let b: Array1<f32> = npz
                .by_name(&format!("b{}", i))
                .map_err(|_| ModelError::SnapshotMismatch(format!("missing array b{}", i)))?;
            if w.raw_dim() != layer.weights.raw_dim() {
                return Err(ModelError::SnapshotMismatch(format!(
                    "layer {} weight shape {:?} does not match {:?}",
                    i,
                    w.shape(),
                    layer.weights.shape()
                )));
            }
            if b.len() != layer.bias.len() {
                return Err(ModelError::SnapshotMismatch(format!(
                    "layer {} bias length {} does not match {}",
                    i,
                    b.len(),
                    layer.bias.len()
                )));
            }
            layer.weights = w;
            layer.bias = b;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::s;

    fn sample_input(b: usize, h: usize, w: usize, c: usize) -> Array4<f32> {
        Array4::from_shape_fn((b, h, w, c), |(s, j, i, ch)| {
            ((s * 13 + j * 5 + i * 3 + ch) % 17) as f32 / 8.0 - 1.0
        })
    }

    #[test]
    fn test_build_validation() {
        assert!(matches!(
            Network::build(2, &[], &[], Activation::Elu, 0.0, 0),
            Err(ModelError::NoLayers)
        ));
        assert!(matches!(
            Network::build(2, &[8, 1], &[5], Activation::Elu, 0.0, 0),
            Err(ModelError::MismatchedLayerSpec {
                filters: 2,
                kernels: 1
            })
        ));
        assert!(matches!(
            Network::build(2, &[8, 1], &[5, 4], Activation::Elu, 0.0, 0),
            Err(ModelError::InvalidKernel(4))
        ));
        let net = Network::build(2, &[8, 1], &[5, 5], Activation::Elu, 0.0, 0).unwrap();
        assert_eq!(net.in_channels(), 2);
        assert_eq!(net.out_channels(), 1);
    }

    #[test]
    fn test_channel_mismatch() {
        let net = Network::build(3, &[4, 1], &[3, 3], Activation::Elu, 0.0, 0).unwrap();
        let x = sample_input(2, 4, 6, 2);
        assert!(matches!(
            net.forward(&x),
            Err(ModelError::ChannelMismatch {
                expected: 3,
                actual: 2
            })
        ));
    }

    #[test]
    fn test_training_reduces_loss() {
        // Learn y = shifted mean of x; enough structure that progress is
        // only possible if gradients flow through both layers.
        let mut net = Network::build(2, &[6, 1], &[3, 3], Activation::Elu, 0.0, 42).unwrap();
        let x = sample_input(4, 6, 8, 2);
        let y = x
            .mean_axis(Axis(3))
            .unwrap()
            .insert_axis(Axis(3))
            .mapv(|v| 0.5 * v + 0.1);

        let mut opt = Adam::new(5e-3);
        let first = net.train_step(&x, &y, &mut opt).unwrap();
        let mut last = first;
        for _ in 0..60 {
            last = net.train_step(&x, &y, &mut opt).unwrap();
        }
        assert!(last < first * 0.5, "loss {} -> {}", first, last);
    }

    #[test]
    fn test_dropout_only_affects_training() {
        let mut net = Network::build(1, &[4, 1], &[3, 3], Activation::Elu, 0.5, 3).unwrap();
        let x = sample_input(1, 4, 6, 1);
        let a = net.forward(&x).unwrap();
        let b = net.forward(&x).unwrap();
        assert_eq!(a, b);

        let y = Array4::zeros((1, 4, 6, 1));
        let mut opt = Adam::new(1e-4);
        assert!(net.train_step(&x, &y, &mut opt).is_ok());
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.npz");

        let net = Network::build(2, &[4, 1], &[3, 3], Activation::Elu, 0.0, 11).unwrap();
        net.save_weights(&path).unwrap();

        let mut restored = Network::build(2, &[4, 1], &[3, 3], Activation::Elu, 0.0, 99).unwrap();
        restored.load_weights(&path).unwrap();

        let x = sample_input(2, 5, 7, 2);
        let a = net.forward(&x).unwrap();
        let b = restored.forward(&x).unwrap();
        assert_eq!(
            a.slice(s![0, .., .., ..]),
            b.slice(s![0, .., .., ..])
        );

        let mut wrong = Network::build(2, &[5, 1], &[3, 3], Activation::Elu, 0.0, 0).unwrap();
        assert!(matches!(
            wrong.load_weights(&path),
            Err(ModelError::SnapshotMismatch(_))
        ));
    }
}
