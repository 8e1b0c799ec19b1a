//! Squashing nonlinearity for capsule vectors.
//!
//! Capsules encode the probability of an entity's presence in the *length*
//! of their output vector, so the raw vector `v` is rescaled to a norm in
//! [0, 1) while keeping its direction:
//!
//! ```text
//! squash(v) = (‖v‖² / (1 + ‖v‖²)) · (v / ‖v‖) = v · ‖v‖ / (1 + ‖v‖²)
//! ```
//!
//! Short vectors shrink towards zero, long vectors saturate towards unit
//! length. The function is applied lane-wise along the last axis of a
//! `(batch, capsules, dims)` tensor; a lane with exactly zero norm is a
//! [`CapsError::ZeroNorm`] error rather than a silent NaN.
//!
//! ## Backward pass
//!
//! With `n = ‖v‖` and gain `f(n) = n / (1 + n²)` the Jacobian splits into an
//! isotropic part and a radial part:
//!
//! ```text
//! ∂squash(v)/∂v = f(n)·I + (f'(n)/n)·v vᵀ,   f'(n) = (1 − n²) / (1 + n²)²
//! ```
//!
//! The matrix is symmetric, so pulling a gradient back is
//! `f(n)·g + (f'(n)/n)·(v·g)·v`. The backward pass stabilizes the norm with
//! [`NORM_EPSILON`] so that lanes driven to zero mid-training produce a
//! finite (vanishing) gradient instead of dividing by zero.

use ndarray::{s, Array3, ArrayView3};

use super::{CapsError, CapsResult};

/// Stabilizer added to squared norms in backward passes only. Forward
/// passes report zero-norm lanes as errors instead of masking them.
pub const NORM_EPSILON: f32 = 1e-12;

/// Applies the squashing nonlinearity along the last axis.
///
/// `input` has shape `(batch, capsules, dims)`; each `dims`-lane is squashed
/// independently. Returns [`CapsError::ZeroNorm`] if any lane has zero norm.
pub fn squash(input: &ArrayView3<f32>) -> CapsResult<Array3<f32>> {
    let (batch, capsules, _) = input.dim();
    let mut output = Array3::<f32>::zeros(input.raw_dim());
    for b in 0..batch {
        for i in 0..capsules {
            let lane = input.slice(s![b, i, ..]);
            let norm_sq: f32 = lane.dot(&lane);
            if norm_sq == 0.0 {
                return Err(CapsError::ZeroNorm);
            }
            // v · n / (1 + n²)
            let factor = norm_sq.sqrt() / (1.0 + norm_sq);
            let mut out = output.slice_mut(s![b, i, ..]);
            out.zip_mut_with(&lane, |o, &x| *o = x * factor);
        }
    }
    Ok(output)
}

/// Pulls a gradient back through [`squash`].
///
/// `input` is the *pre-squash* tensor the forward pass was given and
/// `grad_output` the gradient with respect to the squashed output, both of
/// shape `(batch, capsules, dims)`. The norm is stabilized with
/// [`NORM_EPSILON`], so this never fails; a zero lane yields a near-zero
/// gradient.
pub fn squash_backward(input: &ArrayView3<f32>, grad_output: &ArrayView3<f32>) -> Array3<f32> {
    debug_assert_eq!(input.dim(), grad_output.dim());
    let (batch, capsules, dims) = input.dim();
    let mut grad = Array3::<f32>::zeros(input.raw_dim());
    for b in 0..batch {
        for i in 0..capsules {
            let lane = input.slice(s![b, i, ..]);
            let upstream = grad_output.slice(s![b, i, ..]);
            let norm_sq: f32 = lane.dot(&lane);
            let norm = (norm_sq + NORM_EPSILON).sqrt();
            let gain = norm / (1.0 + norm_sq);
            let gain_prime = (1.0 - norm_sq) / ((1.0 + norm_sq) * (1.0 + norm_sq));
            // f(n)·g + (f'(n)/n)·(v·g)·v
            let radial = gain_prime / norm * lane.dot(&upstream);
            let mut out = grad.slice_mut(s![b, i, ..]);
            for d in 0..dims {
                out[d] = gain * upstream[d] + radial * lane[d];
            }
        }
    }
    grad
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr3, ArrayView1};

    #[test]
    fn test_squash_known_value() {
        // ‖v‖ = 5 for v = (3, 4), so the factor is 5 / 26.
        let input = arr3(&[[[3.0_f32, 4.0]]]);
        let output = squash(&input.view()).unwrap();
        assert_abs_diff_eq!(output[[0, 0, 0]], 15.0 / 26.0, epsilon = 1e-6);
        assert_abs_diff_eq!(output[[0, 0, 1]], 20.0 / 26.0, epsilon = 1e-6);
    }

    #[test]
    fn test_squash_norm_in_unit_interval() {
        let input = arr3(&[[
            [0.01_f32, 0.0, 0.0],
            [1.0, -2.0, 0.5],
            [100.0, 100.0, -100.0],
        ]]);
        let output = squash(&input.view()).unwrap();
        for i in 0..3 {
            let lane: ArrayView1<f32> = output.slice(s![0, i, ..]);
            let norm = lane.dot(&lane).sqrt();
            assert!(norm > 0.0 && norm < 1.0, "norm {} out of (0, 1)", norm);
        }
    }

    #[test]
    fn test_squash_preserves_direction() {
        let input = arr3(&[[[2.0_f32, -1.0, 0.5, 3.0]]]);
        let output = squash(&input.view()).unwrap();
        // Output must be a positive multiple of the input lane.
        let ratio = output[[0, 0, 0]] / input[[0, 0, 0]];
        assert!(ratio > 0.0);
        for d in 0..4 {
            assert_abs_diff_eq!(output[[0, 0, d]], input[[0, 0, d]] * ratio, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_squash_unit_norm_halves() {
        // ‖v‖ = 1 maps to norm 1 / (1 + 1) = 0.5.
        let input = arr3(&[[[1.0_f32, 0.0]]]);
        let output = squash(&input.view()).unwrap();
        assert_abs_diff_eq!(output[[0, 0, 0]], 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(output[[0, 0, 1]], 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_squash_zero_lane_is_error() {
        let input = arr3(&[[[1.0_f32, 2.0], [0.0, 0.0]]]);
        let result = squash(&input.view());
        assert!(matches!(result, Err(CapsError::ZeroNorm)));
    }

    #[test]
    fn test_squash_backward_matches_finite_difference() {
        let input = arr3(&[[[0.8_f32, -0.3, 1.2, 0.4]]]);
        let upstream = arr3(&[[[0.5_f32, 1.0, -0.7, 0.2]]]);
        let analytic = squash_backward(&input.view(), &upstream.view());

        // Scalar objective T(v) = Σ g ⊙ squash(v), probed per coordinate.
        let h = 1e-3_f32;
        for d in 0..4 {
            let mut plus = input.clone();
            plus[[0, 0, d]] += h;
            let mut minus = input.clone();
            minus[[0, 0, d]] -= h;
            let t_plus: f32 = (&squash(&plus.view()).unwrap() * &upstream).sum();
            let t_minus: f32 = (&squash(&minus.view()).unwrap() * &upstream).sum();
            let numeric = (t_plus - t_minus) / (2.0 * h);
            assert_abs_diff_eq!(analytic[[0, 0, d]], numeric, epsilon = 2e-3);
        }
    }

    #[test]
    fn test_squash_backward_zero_lane_is_finite() {
        let input = arr3(&[[[0.0_f32, 0.0, 0.0]]]);
        let upstream = arr3(&[[[1.0_f32, -1.0, 0.5]]]);
        let grad = squash_backward(&input.view(), &upstream.view());
        for d in 0..3 {
            assert!(grad[[0, 0, d]].is_finite());
            assert_abs_diff_eq!(grad[[0, 0, d]], 0.0, epsilon = 1e-5);
        }
    }
}
