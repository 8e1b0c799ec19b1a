//! Gradient-descent optimizers over the parameter registry.
//!
//! Optimizers see the model only through [`ParamView`]s: named mutable
//! parameter tensors paired with their accumulated gradients. Per-parameter
//! state (momentum buffers, Adam moments) is keyed on the parameter name,
//! which is stable for a fixed architecture, so an optimizer survives
//! checkpoint reload as long as the configuration matches.

use std::collections::HashMap;

use ndarray::{azip, ArrayD};

use crate::core::ParamView;

/// One update rule applied to every parameter after a backward pass.
pub trait Optimizer {
    /// Updates every parameter in place from its accumulated gradient.
    fn step(&mut self, params: &mut [ParamView<'_>]);

    fn learning_rate(&self) -> f32;

    fn set_learning_rate(&mut self, learning_rate: f32);
}

/// Stochastic gradient descent, optionally with classical momentum.
pub struct Sgd {
    learning_rate: f32,
    momentum: f32,
    velocity: HashMap<String, ArrayD<f32>>,
}

impl Sgd {
    pub fn new(learning_rate: f32) -> Self {
        Sgd::with_momentum(learning_rate, 0.0)
    }

    pub fn with_momentum(learning_rate: f32, momentum: f32) -> Self {
        Sgd {
            learning_rate,
            momentum,
            velocity: HashMap::new(),
        }
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, params: &mut [ParamView<'_>]) {
        let lr = self.learning_rate;
        let momentum = self.momentum;
        for p in params.iter_mut() {
            if momentum == 0.0 {
                p.value.zip_mut_with(&p.grad, |w, &g| *w -= lr * g);
                continue;
            }
            let velocity = self
                .velocity
                .entry(p.name.clone())
                .or_insert_with(|| ArrayD::zeros(p.grad.raw_dim()));
            velocity.zip_mut_with(&p.grad, |v, &g| *v = momentum * *v - lr * g);
            p.value.zip_mut_with(&*velocity, |w, &v| *w += v);
        }
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, learning_rate: f32) {
        self.learning_rate = learning_rate;
    }
}

/// Adam with bias-corrected first and second moment estimates.
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    timestep: u32,
    first_moment: HashMap<String, ArrayD<f32>>,
    second_moment: HashMap<String, ArrayD<f32>>,
}

impl Adam {
    /// Standard coefficients: β₁ = 0.9, β₂ = 0.999, ε = 1e-8.
    pub fn new(learning_rate: f32) -> Self {
        Adam {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            timestep: 0,
            first_moment: HashMap::new(),
            second_moment: HashMap::new(),
        }
    }
}

impl Optimizer for Adam {
    fn step(&mut self, params: &mut [ParamView<'_>]) {
        // One shared timestep per optimization step, not per parameter.
        self.timestep += 1;
        let lr = self.learning_rate;
        let beta1 = self.beta1;
        let beta2 = self.beta2;
        let eps = self.epsilon;
        let correction1 = 1.0 - beta1.powi(self.timestep as i32);
        let correction2 = 1.0 - beta2.powi(self.timestep as i32);

        for p in params.iter_mut() {
            let first = self
                .first_moment
                .entry(p.name.clone())
                .or_insert_with(|| ArrayD::zeros(p.grad.raw_dim()));
            let second = self
                .second_moment
                .entry(p.name.clone())
                .or_insert_with(|| ArrayD::zeros(p.grad.raw_dim()));

            first.zip_mut_with(&p.grad, |m, &g| *m = beta1 * *m + (1.0 - beta1) * g);
            second.zip_mut_with(&p.grad, |v, &g| *v = beta2 * *v + (1.0 - beta2) * g * g);

            // w -= lr · m̂ / (√v̂ + ε)
            azip!((w in &mut p.value, &m in &*first, &v in &*second) {
                *w -= lr * (m / correction1) / ((v / correction2).sqrt() + eps);
            });
        }
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, learning_rate: f32) {
        self.learning_rate = learning_rate;
    }
}
