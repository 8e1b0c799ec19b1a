//! Full capsule network: feature extractor, primary capsules, routing.
//!
//! The model owns its layers and a copy of the configuration it was built
//! from. Forward passes are `&self` and return a [`ForwardState`] with every
//! intermediate tensor the backward pass needs, so the network itself stays
//! immutable during inference and can be shared across threads. The backward
//! pass consumes a state together with a loss gradient and accumulates
//! parameter gradients inside the layers; an optimizer then walks
//! [`CapsNet::parameters`].

use ndarray::{Array4, ArrayView2, ArrayView3, ArrayView4, ArrayViewD, ArrayViewMutD};
use rand::rngs::StdRng;

use crate::CapsNetConfig;

use super::conv::{relu, relu_backward, Conv2d};
use super::loss::capsule_norms;
use super::primary::{PrimaryCaps, PrimaryForward};
use super::routing::{DigitCaps, RoutingForward};
use super::{CapsError, CapsResult};

/// Every tensor a forward pass produced, cached for the backward pass.
pub struct ForwardState {
    /// The images the pass was given, `(batch, channels, height, width)`.
    pub input: Array4<f32>,
    /// Feature extractor output before ReLU.
    pub conv_pre: Array4<f32>,
    /// Feature extractor output after ReLU.
    pub conv_out: Array4<f32>,
    pub primary: PrimaryForward,
    pub routing: RoutingForward,
}

impl ForwardState {
    /// Class capsules, `(batch, classes, dims)`.
    pub fn output(&self) -> ArrayView3<f32> {
        self.routing.output.view()
    }

    /// Final routing couplings, `(route_nodes, classes)`.
    pub fn coupling(&self) -> ArrayView2<f32> {
        self.routing.coupling.view()
    }
}

/// A named mutable view of one parameter tensor and its gradient.
///
/// Names are stable across runs for a fixed configuration, so optimizers can
/// key per-parameter state on them.
pub struct ParamView<'a> {
    pub name: String,
    pub value: ArrayViewMutD<'a, f32>,
    pub grad: ArrayViewD<'a, f32>,
}

/// The composed network.
pub struct CapsNet {
    pub conv: Conv2d,
    pub primary: PrimaryCaps,
    pub digit: DigitCaps,
    config: CapsNetConfig,
}

impl CapsNet {
    /// Builds the network, validating the whole shape chain up front and
    /// drawing every initial parameter from `rng` in a fixed order.
    pub fn new(config: CapsNetConfig, rng: &mut StdRng) -> CapsResult<Self> {
        config.validate()?;
        let num_route_nodes = config.num_route_nodes()?;
        let conv = Conv2d::new(&config.conv1, rng)?;
        let primary = PrimaryCaps::new(&config.conv2, config.caps_maps, config.caps_dims, rng)?;
        let digit = DigitCaps::new(
            num_route_nodes,
            config.caps_dims,
            config.digit_dims,
            config.num_classes,
            config.routing_iterations,
            rng,
        )?;
        Ok(CapsNet {
            conv,
            primary,
            digit,
            config,
        })
    }

    pub fn config(&self) -> &CapsNetConfig {
        &self.config
    }

    /// Runs the full pipeline over a batch of images.
    pub fn forward(&self, input: &ArrayView4<f32>) -> CapsResult<ForwardState> {
        let (batch, channels, height, width) = input.dim();
        if batch == 0 {
            return Err(CapsError::ShapeMismatch("empty image batch".to_string()));
        }
        if channels != self.config.conv1.in_channels
            || height != self.config.input_height
            || width != self.config.input_width
        {
            return Err(CapsError::ShapeMismatch(format!(
                "expected ({}, {}, {}) images, got ({}, {}, {})",
                self.config.conv1.in_channels,
                self.config.input_height,
                self.config.input_width,
                channels,
                height,
                width
            )));
        }

        let conv_pre = self.conv.forward(input)?;
        let conv_out = relu(&conv_pre.view());
        let primary = self.primary.forward(&conv_out.view())?;
        let routing = self.digit.forward(&primary.output.view())?;
        Ok(ForwardState {
            input: input.to_owned(),
            conv_pre,
            conv_out,
            primary,
            routing,
        })
    }

    /// Pulls a class-capsule gradient back through every layer,
    /// accumulating parameter gradients.
    pub fn backward(
        &mut self,
        state: &ForwardState,
        grad_output: &ArrayView3<f32>,
    ) -> CapsResult<()> {
        let grad_primary =
            self.digit
                .backward(&state.primary.output.view(), &state.routing, grad_output)?;
        let grad_conv_out =
            self.primary
                .backward(&state.conv_out.view(), &state.primary, &grad_primary.view())?;
        let grad_conv_pre = relu_backward(&state.conv_pre.view(), &grad_conv_out.view());
        self.conv
            .backward(&state.input.view(), &grad_conv_pre.view())?;
        Ok(())
    }

    /// Resets every accumulated parameter gradient.
    pub fn zero_grad(&mut self) {
        self.conv.zero_grad();
        self.primary.zero_grad();
        self.digit.zero_grad();
    }

    /// Mutable views over every parameter and its gradient, in a fixed
    /// order: feature conv, primary maps, digit transforms.
    pub fn parameters(&mut self) -> Vec<ParamView<'_>> {
        let mut params = Vec::with_capacity(3 + 2 * self.primary.convs.len());
        params.push(ParamView {
            name: "conv1.weight".to_string(),
            value: self.conv.weight.view_mut().into_dyn(),
            grad: self.conv.weight_grad.view().into_dyn(),
        });
        params.push(ParamView {
            name: "conv1.bias".to_string(),
            value: self.conv.bias.view_mut().into_dyn(),
            grad: self.conv.bias_grad.view().into_dyn(),
        });
        for (m, conv) in self.primary.convs.iter_mut().enumerate() {
            params.push(ParamView {
                name: format!("primary.{}.weight", m),
                value: conv.weight.view_mut().into_dyn(),
                grad: conv.weight_grad.view().into_dyn(),
            });
            params.push(ParamView {
                name: format!("primary.{}.bias", m),
                value: conv.bias.view_mut().into_dyn(),
                grad: conv.bias_grad.view().into_dyn(),
            });
        }
        params.push(ParamView {
            name: "digit.weight".to_string(),
            value: self.digit.weight.view_mut().into_dyn(),
            grad: self.digit.weight_grad.view().into_dyn(),
        });
        params
    }

    /// Total number of learned scalars.
    pub fn num_parameters(&self) -> usize {
        let mut count = self.conv.weight.len() + self.conv.bias.len();
        for conv in &self.primary.convs {
            count += conv.weight.len() + conv.bias.len();
        }
        count + self.digit.weight.len()
    }

    /// Predicted class per sample: the capsule with the largest norm, ties
    /// resolved towards the lower index.
    pub fn predict(&self, output: &ArrayView3<f32>) -> Vec<usize> {
        let norms = capsule_norms(output);
        norms
            .outer_iter()
            .map(|row| {
                let mut best = 0;
                let mut best_norm = f32::NEG_INFINITY;
                for (j, &norm) in row.iter().enumerate() {
                    if norm > best_norm {
                        best_norm = norm;
                        best = j;
                    }
                }
                best
            })
            .collect()
    }

    /// Human-readable architecture summary.
    pub fn describe(&self) -> String {
        let c1 = &self.config.conv1;
        let c2 = &self.config.conv2;
        format!(
            "CapsNet {}x{} input\n  \
             conv1:   {} -> {} channels, {}x{} kernel, stride {}\n  \
             primary: {} maps x {} dims, {}x{} kernel, stride {} ({} capsules)\n  \
             digit:   {} -> {} capsules of dim {}, {} routing iterations\n  \
             parameters: {}",
            self.config.input_height,
            self.config.input_width,
            c1.in_channels,
            c1.out_channels,
            c1.kernel_size,
            c1.kernel_size,
            c1.stride,
            self.config.caps_maps,
            self.config.caps_dims,
            c2.kernel_size,
            c2.kernel_size,
            c2.stride,
            self.digit.num_route_nodes(),
            self.digit.num_route_nodes(),
            self.config.num_classes,
            self.config.digit_dims,
            self.config.routing_iterations,
            self.num_parameters()
        )
    }
}
