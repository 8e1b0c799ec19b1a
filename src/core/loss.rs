//! Margin loss over class capsule norms.
//!
//! The norm of a class capsule is the network's confidence that the class is
//! present, so the loss pushes the correct class's norm above a high margin
//! and every other norm below a low one:
//!
//! ```text
//! L_k = T_k · max(0, m⁺ − ‖v_k‖)² + λ (1 − T_k) · max(0, ‖v_k‖ − m⁻)²
//! ```
//!
//! with `T_k` the one-hot target. Per-sample losses sum over classes and the
//! batch loss is their mean. λ < 1 keeps absent-class capsules from
//! collapsing all norms early in training.

use ndarray::{s, Array2, Array3, ArrayView2, ArrayView3};

use super::squash::NORM_EPSILON;
use super::{CapsError, CapsResult};

/// Euclidean norm of every capsule lane: `(batch, classes, dims)` in,
/// `(batch, classes)` out.
pub fn capsule_norms(output: &ArrayView3<f32>) -> Array2<f32> {
    let (batch, classes, _) = output.dim();
    let mut norms = Array2::<f32>::zeros((batch, classes));
    for b in 0..batch {
        for j in 0..classes {
            let lane = output.slice(s![b, j, ..]);
            norms[[b, j]] = lane.dot(&lane).sqrt();
        }
    }
    norms
}

/// Two-sided margin loss on capsule norms.
#[derive(Debug, Clone, Copy)]
pub struct MarginLoss {
    /// Margin the present class's norm should exceed.
    pub m_plus: f32,
    /// Margin the absent classes' norms should stay below.
    pub m_minus: f32,
    /// Down-weighting factor for absent-class terms.
    pub lambda: f32,
}

impl Default for MarginLoss {
    fn default() -> Self {
        MarginLoss {
            m_plus: 0.9,
            m_minus: 0.1,
            lambda: 0.5,
        }
    }
}

impl MarginLoss {
    /// Creates a loss with explicit margins.
    ///
    /// Both margins must lie strictly inside (0, 1) with `m_minus < m_plus`,
    /// matching the (0, 1) range of squashed norms.
    pub fn new(m_plus: f32, m_minus: f32, lambda: f32) -> CapsResult<Self> {
        if !(0.0 < m_minus && m_minus < m_plus && m_plus < 1.0) {
            return Err(CapsError::Config(format!(
                "margins must satisfy 0 < m_minus < m_plus < 1, got m_plus={}, m_minus={}",
                m_plus, m_minus
            )));
        }
        if lambda <= 0.0 {
            return Err(CapsError::Config(
                "absent-class weight lambda must be positive".to_string(),
            ));
        }
        Ok(MarginLoss {
            m_plus,
            m_minus,
            lambda,
        })
    }

    fn check_shapes(
        &self,
        output: &ArrayView3<f32>,
        targets: &ArrayView2<f32>,
    ) -> CapsResult<()> {
        let (batch, classes, _) = output.dim();
        if targets.dim() != (batch, classes) {
            return Err(CapsError::ShapeMismatch(format!(
                "margin loss expected targets of shape ({}, {}), got {:?}",
                batch,
                classes,
                targets.dim()
            )));
        }
        Ok(())
    }

    /// Mean margin loss for a batch of class capsules and one-hot targets.
    ///
    /// `output` is `(batch, classes, dims)` and `targets` is
    /// `(batch, classes)`. The result is non-negative and zero only when
    /// every norm clears its margin.
    pub fn compute(&self, output: &ArrayView3<f32>, targets: &ArrayView2<f32>) -> CapsResult<f32> {
        self.check_shapes(output, targets)?;
        let (batch, classes, _) = output.dim();
        let norms = capsule_norms(output);
        let mut total = 0.0;
        for b in 0..batch {
            for j in 0..classes {
                let t = targets[[b, j]];
                let present = (self.m_plus - norms[[b, j]]).max(0.0);
                let absent = (norms[[b, j]] - self.m_minus).max(0.0);
                total += t * present * present + self.lambda * (1.0 - t) * absent * absent;
            }
        }
        Ok(total / batch as f32)
    }

    /// Gradient of [`MarginLoss::compute`] with respect to the capsules.
    ///
    /// Each lane's gradient points along the capsule itself, since the loss
    /// depends on the norm alone; the norm is stabilized so capsules driven
    /// to zero produce a finite gradient.
    pub fn backward(
        &self,
        output: &ArrayView3<f32>,
        targets: &ArrayView2<f32>,
    ) -> CapsResult<Array3<f32>> {
        self.check_shapes(output, targets)?;
        let (batch, classes, dims) = output.dim();
        let norms = capsule_norms(output);
        let scale = 1.0 / batch as f32;
        let mut grad = Array3::<f32>::zeros(output.raw_dim());
        for b in 0..batch {
            for j in 0..classes {
                let t = targets[[b, j]];
                let n = norms[[b, j]];
                let present = (self.m_plus - n).max(0.0);
                let absent = (n - self.m_minus).max(0.0);
                // dL/dn, zero inside both margins.
                let dn = -2.0 * t * present + 2.0 * self.lambda * (1.0 - t) * absent;
                if dn == 0.0 {
                    continue;
                }
                let coef = scale * dn / (n * n + NORM_EPSILON).sqrt();
                for d in 0..dims {
                    grad[[b, j, d]] = coef * output[[b, j, d]];
                }
            }
        }
        Ok(grad)
    }
}
