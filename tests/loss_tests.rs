//! Margin-loss properties through the public API.
//!
//! The loss is zero exactly at the ideal boundary (present class at norm 1,
//! every absent class at 0) and strictly positive anywhere off it. The last
//! test runs the full default 28x28 geometry once, pinning the shape chain
//! all the way from images to the loss scalar.

use capsnet::data::one_hot;
use capsnet::{capsule_norms, CapsNet, CapsNetConfig, MarginLoss};
use ndarray::{s, Array3, Array4};
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Capsule output where each sample's `hot` class is a unit vector along the
/// first component and every other capsule is zero.
fn unit_capsule_output(batch: usize, classes: usize, dims: usize, hot: &[usize]) -> Array3<f32> {
    let mut output = Array3::<f32>::zeros((batch, classes, dims));
    for (b, &k) in hot.iter().enumerate() {
        output[[b, k, 0]] = 1.0;
    }
    output
}

#[test]
fn test_loss_is_zero_at_the_ideal_boundary() {
    let margin = MarginLoss::default();
    let output = unit_capsule_output(2, 10, 16, &[3, 7]);
    let targets = one_hot(&[3, 7], 10).expect("one-hot failed");

    let loss = margin
        .compute(&output.view(), &targets.view())
        .expect("loss failed");
    // Present norm 1 clears m+, absent norm 0 clears m-; both hinges vanish.
    assert_eq!(loss, 0.0);
}

#[test]
fn test_loss_is_positive_when_present_class_falls_short() {
    let margin = MarginLoss::default();
    let mut output = unit_capsule_output(1, 10, 16, &[3]);
    output[[0, 3, 0]] = 0.5;
    let targets = one_hot(&[3], 10).expect("one-hot failed");

    let loss = margin
        .compute(&output.view(), &targets.view())
        .expect("loss failed");
    // (0.9 - 0.5)^2 = 0.16, no absent-class leakage.
    assert!((loss - 0.16).abs() < 1e-6, "loss {}", loss);
}

#[test]
fn test_loss_is_positive_when_absent_class_leaks() {
    let margin = MarginLoss::default();
    let mut output = unit_capsule_output(1, 10, 16, &[3]);
    output[[0, 8, 0]] = 0.3;
    let targets = one_hot(&[3], 10).expect("one-hot failed");

    let loss = margin
        .compute(&output.view(), &targets.view())
        .expect("loss failed");
    // 0.5 * (0.3 - 0.1)^2 = 0.02 from class 8 alone.
    assert!((loss - 0.02).abs() < 1e-6, "loss {}", loss);
}

#[test]
fn test_default_geometry_end_to_end() {
    let mut rng = StdRng::seed_from_u64(2);
    let model = CapsNet::new(CapsNetConfig::default(), &mut rng).expect("Failed to build model");

    // One near-zero and one all-one 28x28 image. The epsilon keeps every
    // capsule away from an exactly zero norm.
    let mut images = Array4::<f32>::from_elem((2, 1, 28, 28), 0.01);
    images.slice_mut(s![1, .., .., ..]).fill(1.0);

    let state = model.forward(&images.view()).expect("Forward failed");
    assert_eq!(state.output().dim(), (2, 10, 16));

    let norms = capsule_norms(&state.output());
    for &n in norms.iter() {
        assert!(n > 0.0 && n < 1.0, "Digit capsule norm {} out of (0, 1)", n);
    }

    let targets = one_hot(&[3, 7], 10).expect("one-hot failed");
    let margin = MarginLoss::default();
    let loss = margin
        .compute(&state.output(), &targets.view())
        .expect("loss failed");
    assert!(loss.is_finite() && loss >= 0.0, "loss {}", loss);
}
