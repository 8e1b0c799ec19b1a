//! Capsule network classifier with dynamic routing by agreement.
//!
//! A from-scratch CPU implementation of a capsule network for image
//! classification: a convolutional front end, a primary capsule layer built
//! from parallel convolutions, and a class capsule layer whose couplings are
//! decided by routing by agreement instead of pooling. Forward and backward
//! passes are written by hand on [`ndarray`]; there is no autodiff and no
//! GPU dependency.
//!
//! ## Architecture
//!
//! With the default configuration (28x28 grayscale input, 10 classes):
//!
//! ```text
//! images (B, 1, 28, 28)
//!     |   conv 9x9 stride 1, ReLU
//!     v
//! features (B, 256, 20, 20)
//!     |   32 parallel convs 9x9 stride 2, regroup, squash
//!     v
//! primary capsules (B, 1152, 8)
//!     |   votes W_ij, 3 routing iterations
//!     v
//! class capsules (B, 10, 16)        norm of v_j = confidence in class j
//! ```
//!
//! ## Modules
//!
//! - [`core`] — layers, routing, margin loss and their hand-written gradients
//! - [`training`] — batch and epoch drivers plus SGD and Adam optimizers
//! - [`data`] — MNIST IDX loading, normalization and batch gathering
//! - [`checkpoint`] — JSON snapshots of configuration and weights
//!
//! Randomness is always explicit: constructors take a seeded
//! [`rand::rngs::StdRng`], so a fixed seed reproduces a run exactly.

use serde::{Deserialize, Serialize};

pub mod checkpoint;
pub mod core;
pub mod data;
pub mod training;

pub use crate::checkpoint::{load_checkpoint, save_checkpoint, CheckpointData};
pub use crate::core::{
    capsule_norms, squash, squash_backward, CapsError, CapsNet, CapsResult, Conv2d, DigitCaps,
    ForwardState, MarginLoss, ParamView, PrimaryCaps,
};
pub use crate::training::{
    evaluate, train_batch, train_epoch, Adam, EpochMetrics, Metrics, Optimizer, Sgd,
};

use crate::core::conv::conv_output_size;

/// Geometry of one convolution layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_size: usize,
    pub stride: usize,
}

/// Hyperparameters fixing the whole network shape.
///
/// The default matches the classic MNIST layout: a 256-channel feature
/// extractor, 32 primary capsule maps of dimension 8 (1152 capsules) and ten
/// 16-dimensional class capsules routed over 3 iterations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapsNetConfig {
    pub input_height: usize,
    pub input_width: usize,
    /// Feature extractor.
    pub conv1: ConvConfig,
    /// Shared geometry of the primary capsule convolutions.
    pub conv2: ConvConfig,
    /// Number of primary capsule maps (independent convolutions).
    pub caps_maps: usize,
    /// Dimension of a primary capsule; must equal `conv2.out_channels`.
    pub caps_dims: usize,
    pub num_classes: usize,
    /// Dimension of a class capsule.
    pub digit_dims: usize,
    pub routing_iterations: usize,
}

impl Default for CapsNetConfig {
    fn default() -> Self {
        CapsNetConfig {
            input_height: 28,
            input_width: 28,
            conv1: ConvConfig {
                in_channels: 1,
                out_channels: 256,
                kernel_size: 9,
                stride: 1,
            },
            conv2: ConvConfig {
                in_channels: 256,
                out_channels: 8,
                kernel_size: 9,
                stride: 2,
            },
            caps_maps: 32,
            caps_dims: 8,
            num_classes: 10,
            digit_dims: 16,
            routing_iterations: 3,
        }
    }
}

impl CapsNetConfig {
    /// Checks every cross-layer constraint; [`CapsNet::new`] calls this
    /// before any parameter is allocated.
    pub fn validate(&self) -> CapsResult<()> {
        if self.input_height == 0 || self.input_width == 0 {
            return Err(CapsError::Config("input size must be positive".to_string()));
        }
        if self.conv1.out_channels != self.conv2.in_channels {
            return Err(CapsError::Config(format!(
                "feature extractor emits {} channels but primary convs expect {}",
                self.conv1.out_channels, self.conv2.in_channels
            )));
        }
        if self.conv2.out_channels != self.caps_dims {
            return Err(CapsError::Config(format!(
                "primary convs emit {} channels but capsules have {} dimensions",
                self.conv2.out_channels, self.caps_dims
            )));
        }
        if self.caps_maps == 0 || self.caps_dims == 0 {
            return Err(CapsError::Config(
                "primary capsule counts must be positive".to_string(),
            ));
        }
        if self.num_classes == 0 || self.digit_dims == 0 {
            return Err(CapsError::Config(
                "class capsule counts must be positive".to_string(),
            ));
        }
        if self.routing_iterations == 0 {
            return Err(CapsError::Config(
                "routing needs at least one iteration".to_string(),
            ));
        }
        self.num_route_nodes()?;
        Ok(())
    }

    /// Number of primary capsules the configured geometry produces, or a
    /// configuration error when a kernel does not fit its input.
    pub fn num_route_nodes(&self) -> CapsResult<usize> {
        let h1 = conv_output_size(self.input_height, self.conv1.kernel_size, self.conv1.stride);
        let w1 = conv_output_size(self.input_width, self.conv1.kernel_size, self.conv1.stride);
        let (h1, w1) = match (h1, w1) {
            (Some(h), Some(w)) => (h, w),
            _ => {
                return Err(CapsError::Config(format!(
                    "{}x{} input does not fit a {}x{} kernel at stride {}",
                    self.input_height,
                    self.input_width,
                    self.conv1.kernel_size,
                    self.conv1.kernel_size,
                    self.conv1.stride
                )))
            }
        };
        let h2 = conv_output_size(h1, self.conv2.kernel_size, self.conv2.stride);
        let w2 = conv_output_size(w1, self.conv2.kernel_size, self.conv2.stride);
        match (h2, w2) {
            (Some(h), Some(w)) => Ok(self.caps_maps * h * w),
            _ => Err(CapsError::Config(format!(
                "{}x{} feature maps do not fit a {}x{} kernel at stride {}",
                h1, w1, self.conv2.kernel_size, self.conv2.kernel_size, self.conv2.stride
            ))),
        }
    }
}
