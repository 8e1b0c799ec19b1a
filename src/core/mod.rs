//! Core capsule-network algorithm implementation.
//!
//! This module provides the capsule pipeline and its hand-written gradients:
//! - Squashing nonlinearity bounding capsule norms into [0, 1)
//! - Convolutional feature extraction (the only non-capsule primitive)
//! - Primary capsules: parallel convolutions regrouped into capsule vectors
//! - Digit capsules: affine votes combined by dynamic routing by agreement
//! - Margin loss comparing capsule norms against one-hot targets
//!
//! ## Dynamic routing by agreement
//!
//! Lower capsules `u_i` predict every higher capsule through a learned
//! per-pair transform, and an iterative procedure decides how strongly each
//! prediction contributes:
//!
//! ```text
//! û_j|i = W_ij u_i                        (votes, computed once per pass)
//! repeat r times:
//!     c_i  = softmax(b_i)                 (over the higher-capsule axis)
//!     s_j  = Σ_i c_ij û_j|i
//!     v_j  = squash(s_j)
//!     b_ij ← b_ij + û_j|i · v_j           (agreement update)
//! ```
//!
//! The coupling logits `b` start at zero every forward pass and are discarded
//! afterwards; only the learned transforms `W` persist across batches.
//!
//! ## Gradients
//!
//! There is no autodiff here. Each component carries an explicit backward
//! pass (squash Jacobian, vote transform, routing aggregation, convolution),
//! and the layers accumulate parameter gradients for an external optimizer.
//! The routing backward treats the final coupling coefficients as constants:
//! gradients flow through the aggregation and the votes, not through the
//! agreement iterations themselves.

use std::error::Error;
use std::fmt;

pub mod conv;
pub mod loss;
pub mod model;
pub mod primary;
pub mod routing;
pub mod squash;

pub use conv::{conv_output_size, relu, relu_backward, Conv2d};
pub use loss::{capsule_norms, MarginLoss};
pub use model::{CapsNet, ForwardState, ParamView};
pub use primary::{PrimaryCaps, PrimaryForward};
pub use routing::{softmax_rows, DigitCaps, RoutingForward};
pub use squash::{squash, squash_backward};

/// Error type for capsule-network operations.
#[derive(Debug, Clone)]
pub enum CapsError {
    /// Invalid layer or model configuration, detected at construction.
    Config(String),
    /// Input tensor does not match the configured shape chain.
    ShapeMismatch(String),
    /// A capsule vector with zero norm reached the squashing function.
    /// Callers must guarantee nonzero activations (e.g. via conv bias).
    ZeroNorm,
}

impl fmt::Display for CapsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapsError::Config(msg) => write!(f, "Invalid configuration: {}", msg),
            CapsError::ShapeMismatch(msg) => write!(f, "Shape mismatch: {}", msg),
            CapsError::ZeroNorm => {
                write!(f, "Division by zero: capsule vector has zero norm")
            }
        }
    }
}

impl Error for CapsError {}

pub type CapsResult<T> = Result<T, CapsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CapsError::Config("bad kernel".to_string());
        assert_eq!(err.to_string(), "Invalid configuration: bad kernel");

        let err = CapsError::ZeroNorm;
        assert!(err.to_string().contains("zero norm"));
    }
}
