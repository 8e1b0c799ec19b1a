//! Primary capsule layer.
//!
//! The first capsule stage runs a bank of independent convolutions (one per
//! capsule map) over the shared feature tensor and regroups their outputs
//! into capsule vectors. Each map emits `caps_dims` channels; the capsule at
//! map `m` and output position `(h, w)` takes its `caps_dims` components
//! from the channels of that map at that position:
//!
//! ```text
//! u[b, m·H·W + h·W + w, d] = conv_m(x)[b, d, h, w]
//! ```
//!
//! so a map of spatial extent `H × W` contributes `H·W` capsules and the
//! layer produces `maps · H · W` capsules total. The regrouped lanes are
//! squashed, which makes every capsule's norm a detection probability.

use ndarray::{Array3, Array4, ArrayView3, ArrayView4};
use rand::rngs::StdRng;
use rayon::prelude::*;

use crate::ConvConfig;

use super::conv::Conv2d;
use super::squash::{squash, squash_backward};
use super::{CapsError, CapsResult};

/// Cached tensors from a primary-capsule forward pass.
pub struct PrimaryForward {
    /// Capsule lanes before squashing, `(batch, capsules, dims)`.
    pub pre_squash: Array3<f32>,
    /// Squashed capsule outputs, same shape.
    pub output: Array3<f32>,
}

/// A bank of parallel convolutions regrouped into capsules.
pub struct PrimaryCaps {
    pub convs: Vec<Conv2d>,
    caps_dims: usize,
}

impl PrimaryCaps {
    /// Creates `caps_maps` convolution maps sharing one configuration.
    ///
    /// The configured `out_channels` must equal `caps_dims`; the channels of
    /// one map are exactly the components of its capsules.
    pub fn new(
        conv: &ConvConfig,
        caps_maps: usize,
        caps_dims: usize,
        rng: &mut StdRng,
    ) -> CapsResult<Self> {
        if caps_maps == 0 {
            return Err(CapsError::Config(
                "at least one primary capsule map is required".to_string(),
            ));
        }
        if caps_dims == 0 {
            return Err(CapsError::Config(
                "primary capsule dimension must be positive".to_string(),
            ));
        }
        if conv.out_channels != caps_dims {
            return Err(CapsError::Config(format!(
                "primary conv emits {} channels but capsules have {} dimensions",
                conv.out_channels, caps_dims
            )));
        }
        let mut convs = Vec::with_capacity(caps_maps);
        for _ in 0..caps_maps {
            convs.push(Conv2d::new(conv, rng)?);
        }
        Ok(PrimaryCaps { convs, caps_dims })
    }

    pub fn caps_maps(&self) -> usize {
        self.convs.len()
    }

    pub fn caps_dims(&self) -> usize {
        self.caps_dims
    }

    /// Total number of capsules produced for a given input extent.
    pub fn num_capsules(&self, in_height: usize, in_width: usize) -> CapsResult<usize> {
        let (out_h, out_w) = self.convs[0].output_shape(in_height, in_width)?;
        Ok(self.convs.len() * out_h * out_w)
    }

    /// Runs every capsule map over `input` and squashes the regrouped lanes.
    ///
    /// `input` has shape `(batch, in_channels, height, width)`; the output
    /// lanes have shape `(batch, capsules, dims)`.
    pub fn forward(&self, input: &ArrayView4<f32>) -> CapsResult<PrimaryForward> {
        let (batch, _, in_h, in_w) = input.dim();
        let (out_h, out_w) = self.convs[0].output_shape(in_h, in_w)?;
        let spatial = out_h * out_w;

        let maps: Vec<Array4<f32>> = self
            .convs
            .par_iter()
            .map(|conv| conv.forward(input))
            .collect::<CapsResult<Vec<_>>>()?;

        let num_caps = self.convs.len() * spatial;
        let mut pre_squash = Array3::<f32>::zeros((batch, num_caps, self.caps_dims));
        for (m, map) in maps.iter().enumerate() {
            for b in 0..batch {
                for oh in 0..out_h {
                    for ow in 0..out_w {
                        let cap = m * spatial + oh * out_w + ow;
                        for d in 0..self.caps_dims {
                            pre_squash[[b, cap, d]] = map[[b, d, oh, ow]];
                        }
                    }
                }
            }
        }
        let output = squash(&pre_squash.view())?;
        Ok(PrimaryForward { pre_squash, output })
    }

    /// Pulls a capsule-space gradient back through squashing, the regrouping
    /// and every capsule map, accumulating conv parameter gradients.
    ///
    /// Returns the gradient with respect to the shared input tensor, which
    /// sums the contributions of all maps.
    pub fn backward(
        &mut self,
        input: &ArrayView4<f32>,
        state: &PrimaryForward,
        grad_output: &ArrayView3<f32>,
    ) -> CapsResult<Array4<f32>> {
        let (batch, in_ch, in_h, in_w) = input.dim();
        let (out_h, out_w) = self.convs[0].output_shape(in_h, in_w)?;
        let spatial = out_h * out_w;
        let caps_dims = self.caps_dims;

        let grad_pre = squash_backward(&state.pre_squash.view(), grad_output);

        let map_grads: Vec<Array4<f32>> = self
            .convs
            .par_iter_mut()
            .enumerate()
            .map(|(m, conv)| {
                let mut grad_map = Array4::<f32>::zeros((batch, caps_dims, out_h, out_w));
                for b in 0..batch {
                    for oh in 0..out_h {
                        for ow in 0..out_w {
                            let cap = m * spatial + oh * out_w + ow;
                            for d in 0..caps_dims {
                                grad_map[[b, d, oh, ow]] = grad_pre[[b, cap, d]];
                            }
                        }
                    }
                }
                conv.backward(input, &grad_map.view())?;
                conv.backward_input(&grad_map.view(), in_h, in_w)
            })
            .collect::<CapsResult<Vec<_>>>()?;

        let mut grad_input = Array4::<f32>::zeros((batch, in_ch, in_h, in_w));
        for grad_map in &map_grads {
            grad_input += grad_map;
        }
        Ok(grad_input)
    }

    /// Resets accumulated gradients in every capsule map.
    pub fn zero_grad(&mut self) {
        for conv in &mut self.convs {
            conv.zero_grad();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{s, ArrayView1};
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;
    use rand::SeedableRng;

    fn test_layer(rng: &mut StdRng) -> PrimaryCaps {
        let conv = ConvConfig {
            in_channels: 3,
            out_channels: 4,
            kernel_size: 2,
            stride: 1,
        };
        PrimaryCaps::new(&conv, 2, 4, rng).unwrap()
    }

    #[test]
    fn test_capsule_count_follows_conv_geometry() {
        let mut rng = StdRng::seed_from_u64(3);
        let layer = test_layer(&mut rng);
        // 2 maps, each 4x4 after a k2/s1 conv over 5x5.
        assert_eq!(layer.num_capsules(5, 5).unwrap(), 2 * 4 * 4);
    }

    #[test]
    fn test_forward_shapes_and_norms() {
        let mut rng = StdRng::seed_from_u64(3);
        let layer = test_layer(&mut rng);
        let input = Array4::random_using((2, 3, 5, 5), Uniform::new(0.0, 1.0), &mut rng);
        let state = layer.forward(&input.view()).unwrap();
        assert_eq!(state.output.dim(), (2, 32, 4));
        for b in 0..2 {
            for cap in 0..32 {
                let lane: ArrayView1<f32> = state.output.slice(s![b, cap, ..]);
                let norm = lane.dot(&lane).sqrt();
                assert!(norm < 1.0, "capsule norm {} not squashed", norm);
            }
        }
    }

    #[test]
    fn test_regrouping_maps_channels_to_lanes() {
        let mut rng = StdRng::seed_from_u64(3);
        let layer = test_layer(&mut rng);
        let input = Array4::random_using((1, 3, 5, 5), Uniform::new(0.0, 1.0), &mut rng);
        let state = layer.forward(&input.view()).unwrap();

        // Capsule 0 of map 1 starts at index spatial = 16.
        let map1 = layer.convs[1].forward(&input.view()).unwrap();
        for d in 0..4 {
            assert_abs_diff_eq!(
                state.pre_squash[[0, 16, d]],
                map1[[0, d, 0, 0]],
                epsilon = 1e-6
            );
        }
    }

    #[test]
    fn test_rejects_channel_dimension_mismatch() {
        let mut rng = StdRng::seed_from_u64(3);
        let conv = ConvConfig {
            in_channels: 3,
            out_channels: 6,
            kernel_size: 2,
            stride: 1,
        };
        let result = PrimaryCaps::new(&conv, 2, 4, &mut rng);
        assert!(matches!(result, Err(CapsError::Config(_))));
    }

    #[test]
    fn test_backward_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut layer = test_layer(&mut rng);
        let input = Array4::random_using((1, 3, 4, 4), Uniform::new(0.1, 1.0), &mut rng);
        let upstream = Array3::random_using((1, 18, 4), Uniform::new(-1.0, 1.0), &mut rng);

        let state = layer.forward(&input.view()).unwrap();
        layer.zero_grad();
        let grad_input = layer
            .backward(&input.view(), &state, &upstream.view())
            .unwrap();

        // Probe a few input positions against Σ g ⊙ forward(x).
        let h = 1e-3_f32;
        for &(ic, y, x) in &[(0, 0, 0), (1, 2, 1), (2, 3, 3)] {
            let mut probe = input.clone();
            probe[[0, ic, y, x]] += h;
            let plus: f32 = (&layer.forward(&probe.view()).unwrap().output * &upstream).sum();
            probe[[0, ic, y, x]] -= 2.0 * h;
            let minus: f32 = (&layer.forward(&probe.view()).unwrap().output * &upstream).sum();
            let numeric = (plus - minus) / (2.0 * h);
            assert_abs_diff_eq!(grad_input[[0, ic, y, x]], numeric, epsilon = 2e-3);
        }
    }
}
