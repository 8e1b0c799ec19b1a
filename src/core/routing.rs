//! Digit capsule layer with dynamic routing by agreement.
//!
//! Every lower capsule `u_i` casts a vote for every higher capsule through
//! its own learned transform, `û_j|i = W_ij u_i`. Routing then runs a fixed
//! number of agreement iterations:
//!
//! ```text
//! b = 0
//! repeat r times:
//!     c_i  = softmax(b_i)          (rows normalized over higher capsules)
//!     s_j  = Σ_i c_ij û_j|i
//!     v_j  = squash(s_j)
//!     b_ij ← b_ij + û_j|i · v_j
//! ```
//!
//! Votes that agree with the emerging consensus `v_j` grow their coupling,
//! votes that disagree are suppressed. The logits `b` are shared across the
//! whole batch: the agreement term sums over batch members, so one routing
//! decision is made per forward pass, not one per sample. Logits reset to
//! zero at the start of every pass.
//!
//! ## Backward pass
//!
//! The backward pass differentiates the final aggregation only, treating the
//! final coupling coefficients as constants. Gradients flow through the
//! squash of `s`, the weighted vote sum and the vote transforms; the
//! agreement iterations that *chose* the couplings are not unrolled. With a
//! single routing iteration the couplings really are constant and the
//! gradient is exact.

use ndarray::{s, Array2, Array3, Array4, ArrayView2, ArrayView3, Axis};
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rayon::prelude::*;

use super::squash::{squash, squash_backward};
use super::{CapsError, CapsResult};

/// Row-wise softmax. Each row is shifted by its maximum before
/// exponentiation, so arbitrarily large logits stay finite.
pub fn softmax_rows(logits: &ArrayView2<f32>) -> Array2<f32> {
    let (rows, cols) = logits.dim();
    let mut out = Array2::<f32>::zeros((rows, cols));
    for i in 0..rows {
        let row = logits.slice(s![i, ..]);
        let max = row.fold(f32::NEG_INFINITY, |m, &x| m.max(x));
        let mut denom = 0.0;
        for j in 0..cols {
            let e = (row[j] - max).exp();
            out[[i, j]] = e;
            denom += e;
        }
        for j in 0..cols {
            out[[i, j]] /= denom;
        }
    }
    out
}

/// Cached tensors from a routing forward pass.
pub struct RoutingForward {
    /// Votes `û_j|i`, shape `(batch, route_nodes, classes, out_dim)`.
    pub votes: Array4<f32>,
    /// Final coupling coefficients, shape `(route_nodes, classes)`. Rows
    /// sum to one; shared across the batch.
    pub coupling: Array2<f32>,
    /// Weighted vote sum `s` before squashing, `(batch, classes, out_dim)`.
    pub raw_output: Array3<f32>,
    /// Squashed class capsules `v`, `(batch, classes, out_dim)`.
    pub output: Array3<f32>,
}

/// The class capsule layer: per-pair vote transforms plus routing.
pub struct DigitCaps {
    /// Vote transforms, shape `(route_nodes, classes, out_dim, in_dim)`.
    pub weight: Array4<f32>,
    pub weight_grad: Array4<f32>,
    num_route_nodes: usize,
    in_dim: usize,
    out_dim: usize,
    num_classes: usize,
    num_iterations: usize,
}

impl DigitCaps {
    /// Creates the layer with vote transforms drawn from a standard normal
    /// distribution.
    pub fn new(
        num_route_nodes: usize,
        in_dim: usize,
        out_dim: usize,
        num_classes: usize,
        num_iterations: usize,
        rng: &mut StdRng,
    ) -> CapsResult<Self> {
        if num_route_nodes == 0 || in_dim == 0 || out_dim == 0 || num_classes == 0 {
            return Err(CapsError::Config(
                "digit capsule dimensions must be positive".to_string(),
            ));
        }
        if num_iterations == 0 {
            return Err(CapsError::Config(
                "routing needs at least one iteration".to_string(),
            ));
        }
        let shape = (num_route_nodes, num_classes, out_dim, in_dim);
        let weight = Array4::random_using(shape, StandardNormal, rng);
        Ok(DigitCaps {
            weight,
            weight_grad: Array4::zeros(shape),
            num_route_nodes,
            in_dim,
            out_dim,
            num_classes,
            num_iterations,
        })
    }

    pub fn num_route_nodes(&self) -> usize {
        self.num_route_nodes
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    pub fn num_iterations(&self) -> usize {
        self.num_iterations
    }

    /// Routes `(batch, route_nodes, in_dim)` capsules to class capsules.
    pub fn forward(&self, input: &ArrayView3<f32>) -> CapsResult<RoutingForward> {
        let (batch, nodes, in_dim) = input.dim();
        if nodes != self.num_route_nodes || in_dim != self.in_dim {
            return Err(CapsError::ShapeMismatch(format!(
                "routing expected ({}, {}) capsules, got ({}, {})",
                self.num_route_nodes, self.in_dim, nodes, in_dim
            )));
        }
        let classes = self.num_classes;
        let out_dim = self.out_dim;
        let weight = &self.weight;

        // û_j|i = W_ij u_i, computed once and reused by every iteration.
        let mut votes = Array4::<f32>::zeros((batch, nodes, classes, out_dim));
        votes
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(b, mut votes_b)| {
                for i in 0..nodes {
                    for j in 0..classes {
                        for o in 0..out_dim {
                            let mut acc = 0.0;
                            for d in 0..in_dim {
                                acc += weight[[i, j, o, d]] * input[[b, i, d]];
                            }
                            votes_b[[i, j, o]] = acc;
                        }
                    }
                }
            });

        let mut logits = Array2::<f32>::zeros((nodes, classes));
        let mut coupling = Array2::<f32>::zeros((nodes, classes));
        let mut raw_output = Array3::<f32>::zeros((batch, classes, out_dim));
        let mut output = Array3::<f32>::zeros((batch, classes, out_dim));
        for _ in 0..self.num_iterations {
            coupling = softmax_rows(&logits.view());

            // s_j = Σ_i c_ij û_j|i
            let coupling_ref = &coupling;
            let votes_ref = &votes;
            raw_output
                .axis_iter_mut(Axis(0))
                .into_par_iter()
                .enumerate()
                .for_each(|(b, mut raw_b)| {
                    raw_b.fill(0.0);
                    for i in 0..nodes {
                        for j in 0..classes {
                            let c = coupling_ref[[i, j]];
                            for o in 0..out_dim {
                                raw_b[[j, o]] += c * votes_ref[[b, i, j, o]];
                            }
                        }
                    }
                });
            output = squash(&raw_output.view())?;

            // b_ij += Σ_b û_j|i · v_j, one shared update for the batch.
            let output_ref = &output;
            logits
                .axis_iter_mut(Axis(0))
                .into_par_iter()
                .enumerate()
                .for_each(|(i, mut row)| {
                    for j in 0..classes {
                        let mut agreement = 0.0;
                        for b in 0..batch {
                            for o in 0..out_dim {
                                agreement += votes_ref[[b, i, j, o]] * output_ref[[b, j, o]];
                            }
                        }
                        row[j] += agreement;
                    }
                });
        }

        Ok(RoutingForward {
            votes,
            coupling,
            raw_output,
            output,
        })
    }

    /// Accumulates transform gradients and returns the gradient with
    /// respect to the input capsules.
    ///
    /// `input` and `state` must come from the matching forward pass. The
    /// final couplings are read from `state` and treated as constants.
    pub fn backward(
        &mut self,
        input: &ArrayView3<f32>,
        state: &RoutingForward,
        grad_output: &ArrayView3<f32>,
    ) -> CapsResult<Array3<f32>> {
        let (batch, nodes, in_dim) = input.dim();
        if nodes != self.num_route_nodes || in_dim != self.in_dim {
            return Err(CapsError::ShapeMismatch(format!(
                "routing backward expected ({}, {}) capsules, got ({}, {})",
                self.num_route_nodes, self.in_dim, nodes, in_dim
            )));
        }
        if grad_output.dim() != state.output.dim() {
            return Err(CapsError::ShapeMismatch(format!(
                "routing backward expected gradient of shape {:?}, got {:?}",
                state.output.dim(),
                grad_output.dim()
            )));
        }
        let classes = self.num_classes;
        let out_dim = self.out_dim;

        // v = squash(s): pull the class-capsule gradient back to s.
        let grad_raw = squash_backward(&state.raw_output.view(), grad_output);
        let coupling = &state.coupling;

        // dL/dW_ij = Σ_b c_ij (dL/ds_j) u_iᵀ
        self.weight_grad
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(i, mut wg)| {
                for j in 0..classes {
                    let c = coupling[[i, j]];
                    for o in 0..out_dim {
                        for b in 0..batch {
                            let g = c * grad_raw[[b, j, o]];
                            for d in 0..in_dim {
                                wg[[j, o, d]] += g * input[[b, i, d]];
                            }
                        }
                    }
                }
            });

        // dL/du_i = Σ_j c_ij W_ijᵀ (dL/ds_j)
        let weight = &self.weight;
        let mut grad_input = Array3::<f32>::zeros((batch, nodes, in_dim));
        grad_input
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(b, mut grad_b)| {
                for i in 0..nodes {
                    for j in 0..classes {
                        let c = coupling[[i, j]];
                        for o in 0..out_dim {
                            let g = c * grad_raw[[b, j, o]];
                            for d in 0..in_dim {
                                grad_b[[i, d]] += g * weight[[i, j, o, d]];
                            }
                        }
                    }
                }
            });
        Ok(grad_input)
    }

    /// Resets accumulated transform gradients to zero.
    pub fn zero_grad(&mut self) {
        self.weight_grad.fill(0.0);
    }
}
