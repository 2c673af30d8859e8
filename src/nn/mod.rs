pub mod conv;
pub mod network;
pub mod optimizer;

pub use conv::{pad_periodic, PeriodicConv2D};
pub use network::Network;
pub use optimizer::Adam;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("periodic convolution requires an odd kernel size, got {0}")]
    InvalidKernel(usize),

    #[error("requires the same number of filters and kernel sizes ({filters} vs {kernels})")]
    MismatchedLayerSpec { filters: usize, kernels: usize },

    #[error("network needs at least one layer")]
    NoLayers,

    #[error("input has {actual} channels, network expects {expected}")]
    ChannelMismatch { expected: usize, actual: usize },

    #[error("snapshot IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot read error: {0}")]
    ReadNpz(#[from] ndarray_npy::ReadNpzError),

    #[error("snapshot write error: {0}")]
    WriteNpz(#[from] ndarray_npy::WriteNpzError),

    #[error("snapshot does not match network: {0}")]
    SnapshotMismatch(String),
}

/// Pointwise nonlinearity applied after each hidden convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Linear,
    Relu,
    LeakyRelu,
    Elu,
    Tanh,
}

impl Activation {
    pub fn apply(&self, z: f32) -> f32 {
        match self {
            Activation::Linear => z,
            Activation::Relu => z.max(0.0),
            Activation::LeakyRelu => {
                if z > 0.0 {
                    z
                } else {
                    0.01 * z
                }
            }
            Activation::Elu => {
                if z > 0.0 {
                    z
                } else {
                    z.exp() - 1.0
                }
            }
            Activation::Tanh => z.tanh(),
        }
    }

    /// Derivative with respect to the pre-activation.
    pub fn grad(&self, z: f32) -> f32 {
        match self {
            Activation::Linear => 1.0,
            Activation::Relu => {
                if z > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Activation::LeakyRelu => {
                if z > 0.0 {
                    1.0
                } else {
                    0.01
                }
            }
            Activation::Elu => {
                if z > 0.0 {
                    1.0
                } else {
                    z.exp()
                }
            }
            Activation::Tanh => {
                let t = z.tanh();
                1.0 - t * t
            }
        }
    }
}

impl std::str::FromStr for Activation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "linear" => Ok(Activation::Linear),
            "relu" => Ok(Activation::Relu),
            "leakyrelu" | "leaky_relu" => Ok(Activation::LeakyRelu),
            "elu" => Ok(Activation::Elu),
            "tanh" => Ok(Activation::Tanh),
            other => Err(format!("unknown activation '{}'", other)),
        }
    }
}
