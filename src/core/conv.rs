//! Plain 2-D convolution over batched feature maps.
//!
//! This is the only non-capsule primitive in the network: it serves as the
//! front-end feature extractor and as the building block of the primary
//! capsule layer. Convolutions use valid padding (no padding at all), a
//! square kernel and a single stride for both spatial axes, so the output
//! size is `(input − kernel) / stride + 1` per axis. ReLU and its gradient
//! mask live here as well since the feature extractor is the only consumer.
//!
//! The backward pass accumulates weight and bias gradients in the layer
//! (summed over the batch); the gradient with respect to the input is a
//! separate call, so the first layer of a network can skip it.

use ndarray::{azip, s, Array1, Array4, ArrayView4, Axis};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rayon::prelude::*;

use crate::ConvConfig;

use super::{CapsError, CapsResult};

/// Output extent of a valid convolution along one axis, or `None` when the
/// kernel does not fit or the stride is zero.
#[inline]
pub fn conv_output_size(input: usize, kernel: usize, stride: usize) -> Option<usize> {
    if kernel == 0 || stride == 0 || input < kernel {
        return None;
    }
    Some((input - kernel) / stride + 1)
}

/// Element-wise `max(0, x)` over a `(batch, channels, height, width)` tensor.
pub fn relu(input: &ArrayView4<f32>) -> Array4<f32> {
    input.mapv(|x| x.max(0.0))
}

/// Masks an upstream gradient with the ReLU activation pattern.
///
/// `pre_activation` is the tensor ReLU was applied to; positions that were
/// clamped to zero pass no gradient.
pub fn relu_backward(pre_activation: &ArrayView4<f32>, grad_output: &ArrayView4<f32>) -> Array4<f32> {
    let mut grad = grad_output.to_owned();
    azip!((g in &mut grad, &z in pre_activation) if z <= 0.0 { *g = 0.0; });
    grad
}

/// A 2-D convolution layer with learned weights and biases.
///
/// Weights have shape `(out_channels, in_channels, kernel, kernel)` and are
/// initialized with Xavier uniform bounds. Biases are drawn uniformly from
/// `±1/√fan_in`, which keeps activations away from exactly zero; downstream
/// capsule lanes rely on that when they are squashed.
pub struct Conv2d {
    pub weight: Array4<f32>,
    pub bias: Array1<f32>,
    pub weight_grad: Array4<f32>,
    pub bias_grad: Array1<f32>,
    pub stride: usize,
}

impl Conv2d {
    /// Creates a layer from a [`ConvConfig`], drawing initial parameters
    /// from `rng`.
    pub fn new(config: &ConvConfig, rng: &mut StdRng) -> CapsResult<Self> {
        if config.in_channels == 0 || config.out_channels == 0 {
            return Err(CapsError::Config(
                "conv channel counts must be positive".to_string(),
            ));
        }
        if config.kernel_size == 0 {
            return Err(CapsError::Config("conv kernel size must be positive".to_string()));
        }
        if config.stride == 0 {
            return Err(CapsError::Config("conv stride must be positive".to_string()));
        }

        let k = config.kernel_size;
        let fan_in = (config.in_channels * k * k) as f32;
        let fan_out = (config.out_channels * k * k) as f32;
        let limit = (6.0 / (fan_in + fan_out)).sqrt();
        let weight = Array4::random_using(
            (config.out_channels, config.in_channels, k, k),
            Uniform::new(-limit, limit),
            rng,
        );
        let bias_bound = 1.0 / fan_in.sqrt();
        let bias = Array1::random_using(
            config.out_channels,
            Uniform::new(-bias_bound, bias_bound),
            rng,
        );

        Ok(Conv2d {
            weight_grad: Array4::zeros((config.out_channels, config.in_channels, k, k)),
            bias_grad: Array1::zeros(config.out_channels),
            weight,
            bias,
            stride: config.stride,
        })
    }

    pub fn in_channels(&self) -> usize {
        self.weight.dim().1
    }

    pub fn out_channels(&self) -> usize {
        self.weight.dim().0
    }

    pub fn kernel_size(&self) -> usize {
        self.weight.dim().2
    }

    /// Spatial output shape for an input of `in_height` by `in_width`.
    pub fn output_shape(&self, in_height: usize, in_width: usize) -> CapsResult<(usize, usize)> {
        let k = self.kernel_size();
        let out_h = conv_output_size(in_height, k, self.stride);
        let out_w = conv_output_size(in_width, k, self.stride);
        match (out_h, out_w) {
            (Some(h), Some(w)) => Ok((h, w)),
            _ => Err(CapsError::ShapeMismatch(format!(
                "conv input {}x{} is smaller than the {}x{} kernel",
                in_height, in_width, k, k
            ))),
        }
    }

    /// Convolves a `(batch, in_channels, height, width)` input.
    pub fn forward(&self, input: &ArrayView4<f32>) -> CapsResult<Array4<f32>> {
        let (batch, in_ch, in_h, in_w) = input.dim();
        if in_ch != self.in_channels() {
            return Err(CapsError::ShapeMismatch(format!(
                "conv expected {} input channels, got {}",
                self.in_channels(),
                in_ch
            )));
        }
        let (out_h, out_w) = self.output_shape(in_h, in_w)?;
        let out_ch = self.out_channels();
        let k = self.kernel_size();
        let stride = self.stride;
        let weight = &self.weight;
        let bias = &self.bias;

        let mut output = Array4::<f32>::zeros((batch, out_ch, out_h, out_w));
        output
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(b, mut out_b)| {
                for oc in 0..out_ch {
                    for oh in 0..out_h {
                        for ow in 0..out_w {
                            let mut acc = bias[oc];
                            for ic in 0..in_ch {
                                for kh in 0..k {
                                    for kw in 0..k {
                                        acc += input[[b, ic, oh * stride + kh, ow * stride + kw]]
                                            * weight[[oc, ic, kh, kw]];
                                    }
                                }
                            }
                            out_b[[oc, oh, ow]] = acc;
                        }
                    }
                }
            });
        Ok(output)
    }

    /// Accumulates weight and bias gradients for one upstream gradient.
    ///
    /// `input` must be the same tensor the matching forward pass saw.
    /// Gradients are summed over the batch and added onto any gradient
    /// already accumulated; call [`Conv2d::zero_grad`] between steps.
    pub fn backward(
        &mut self,
        input: &ArrayView4<f32>,
        grad_output: &ArrayView4<f32>,
    ) -> CapsResult<()> {
        let (batch, in_ch, in_h, in_w) = input.dim();
        let (out_h, out_w) = self.output_shape(in_h, in_w)?;
        let out_ch = self.out_channels();
        if grad_output.dim() != (batch, out_ch, out_h, out_w) {
            return Err(CapsError::ShapeMismatch(format!(
                "conv backward expected gradient of shape ({}, {}, {}, {}), got {:?}",
                batch,
                out_ch,
                out_h,
                out_w,
                grad_output.dim()
            )));
        }
        let k = self.kernel_size();
        let stride = self.stride;

        // dL/dW[oc,ic,kh,kw] = Σ_b Σ_oh,ow g[b,oc,oh,ow] · x[b,ic,oh·s+kh,ow·s+kw]
        self.weight_grad
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(oc, mut wg)| {
                for ic in 0..in_ch {
                    for kh in 0..k {
                        for kw in 0..k {
                            let mut acc = 0.0;
                            for b in 0..batch {
                                for oh in 0..out_h {
                                    for ow in 0..out_w {
                                        acc += grad_output[[b, oc, oh, ow]]
                                            * input[[b, ic, oh * stride + kh, ow * stride + kw]];
                                    }
                                }
                            }
                            wg[[ic, kh, kw]] += acc;
                        }
                    }
                }
            });

        for oc in 0..out_ch {
            self.bias_grad[oc] += grad_output.slice(s![.., oc, .., ..]).sum();
        }
        Ok(())
    }

    /// Gradient with respect to the layer input, for an input of the given
    /// spatial extent. Layers at the bottom of a network never need this.
    pub fn backward_input(
        &self,
        grad_output: &ArrayView4<f32>,
        in_height: usize,
        in_width: usize,
    ) -> CapsResult<Array4<f32>> {
        let (out_h, out_w) = self.output_shape(in_height, in_width)?;
        let out_ch = self.out_channels();
        let batch = grad_output.dim().0;
        if grad_output.dim() != (batch, out_ch, out_h, out_w) {
            return Err(CapsError::ShapeMismatch(format!(
                "conv backward expected gradient of shape ({}, {}, {}, {}), got {:?}",
                batch,
                out_ch,
                out_h,
                out_w,
                grad_output.dim()
            )));
        }
        let in_ch = self.in_channels();
        let k = self.kernel_size();
        let stride = self.stride;
        let weight = &self.weight;

        // Scatter form: each output position spreads its gradient back over
        // the input window it read.
        let mut grad_input = Array4::<f32>::zeros((batch, in_ch, in_height, in_width));
        grad_input
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(b, mut gi)| {
                for oc in 0..out_ch {
                    for oh in 0..out_h {
                        for ow in 0..out_w {
                            let g = grad_output[[b, oc, oh, ow]];
                            for ic in 0..in_ch {
                                for kh in 0..k {
                                    for kw in 0..k {
                                        gi[[ic, oh * stride + kh, ow * stride + kw]] +=
                                            g * weight[[oc, ic, kh, kw]];
                                    }
                                }
                            }
                        }
                    }
                }
            });
        Ok(grad_input)
    }

    /// Resets accumulated gradients to zero.
    pub fn zero_grad(&mut self) {
        self.weight_grad.fill(0.0);
        self.bias_grad.fill(0.0);
    }
}
