//! Checkpoint round-trip tests through the public API.
//!
//! Serialization goes through JSON, so these tests assert exact equality:
//! the shortest-representation float encoding restores every parameter bit
//! for bit, and a resumed run must match an uninterrupted one.

use capsnet::checkpoint::{load_checkpoint, save_checkpoint};
use capsnet::training::{train_epoch, Sgd};
use capsnet::{CapsNet, CapsNetConfig, ConvConfig, MarginLoss};
use ndarray::Array4;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;

fn small_config() -> CapsNetConfig {
    CapsNetConfig {
        input_height: 8,
        input_width: 8,
        conv1: ConvConfig {
            in_channels: 1,
            out_channels: 3,
            kernel_size: 3,
            stride: 1,
        },
        conv2: ConvConfig {
            in_channels: 3,
            out_channels: 4,
            kernel_size: 3,
            stride: 2,
        },
        caps_maps: 2,
        caps_dims: 4,
        num_classes: 3,
        digit_dims: 4,
        routing_iterations: 2,
    }
}

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("capsnet_it_{}_{}.json", std::process::id(), name))
}

fn random_batch(count: usize, rng: &mut StdRng) -> (Array4<f32>, Vec<u8>) {
    let mut images = Array4::<f32>::zeros((count, 1, 8, 8));
    for v in images.iter_mut() {
        *v = rng.gen::<f32>();
    }
    let labels = (0..count).map(|i| (i % 3) as u8).collect();
    (images, labels)
}

#[test]
fn test_roundtrip_preserves_predictions() {
    let mut rng = StdRng::seed_from_u64(7);
    let model = CapsNet::new(small_config(), &mut rng).expect("Failed to build model");
    let (images, _labels) = random_batch(3, &mut rng);

    let before = model.forward(&images.view()).expect("Forward failed");

    let path = temp_path("roundtrip");
    save_checkpoint(&model, &path, 4, 0.37, 0.81).expect("Save failed");
    let (data, restored) = load_checkpoint(&path).expect("Load failed");
    std::fs::remove_file(&path).ok();

    assert_eq!(data.epoch, 4);
    assert_eq!(data.avg_loss, 0.37);
    assert_eq!(data.accuracy, 0.81);
    assert_eq!(data.config, small_config());

    let after = restored.forward(&images.view()).expect("Forward failed");
    for (a, b) in before.output().iter().zip(after.output().iter()) {
        assert_eq!(a, b, "Restored model should reproduce outputs exactly");
    }
}

#[test]
fn test_resumed_training_matches_uninterrupted() {
    let mut rng = StdRng::seed_from_u64(13);
    let mut model = CapsNet::new(small_config(), &mut rng).expect("Failed to build model");
    let (images, labels) = random_batch(6, &mut rng);
    let margin = MarginLoss::default();

    // Warm up, then checkpoint.
    let mut optimizer = Sgd::new(0.02);
    let mut warmup_rng = StdRng::seed_from_u64(100);
    for _epoch in 0..2 {
        train_epoch(
            &mut model,
            &images.view(),
            &labels,
            3,
            &margin,
            &mut optimizer,
            &mut warmup_rng,
        )
        .expect("Epoch failed");
    }
    let path = temp_path("resume");
    save_checkpoint(&model, &path, 2, 0.0, 0.0).expect("Save failed");
    let (_, mut resumed) = load_checkpoint(&path).expect("Load failed");
    std::fs::remove_file(&path).ok();

    // One more epoch on each, with identical fresh optimizers and shuffles.
    let mut opt_a = Sgd::new(0.02);
    let mut rng_a = StdRng::seed_from_u64(200);
    train_epoch(
        &mut model,
        &images.view(),
        &labels,
        3,
        &margin,
        &mut opt_a,
        &mut rng_a,
    )
    .expect("Epoch failed");

    let mut opt_b = Sgd::new(0.02);
    let mut rng_b = StdRng::seed_from_u64(200);
    train_epoch(
        &mut resumed,
        &images.view(),
        &labels,
        3,
        &margin,
        &mut opt_b,
        &mut rng_b,
    )
    .expect("Epoch failed");

    let out_a = model.forward(&images.view()).expect("Forward failed");
    let out_b = resumed.forward(&images.view()).expect("Forward failed");
    for (a, b) in out_a.output().iter().zip(out_b.output().iter()) {
        assert_eq!(a, b, "Resumed run should match the uninterrupted run");
    }
}

#[test]
fn test_checkpoint_file_is_readable_json() {
    let mut rng = StdRng::seed_from_u64(31);
    let model = CapsNet::new(small_config(), &mut rng).expect("Failed to build model");

    let path = temp_path("readable");
    save_checkpoint(&model, &path, 1, 0.5, 0.5).expect("Save failed");

    let text = std::fs::read_to_string(&path).expect("Checkpoint should be readable");
    std::fs::remove_file(&path).ok();

    let value: serde_json::Value = serde_json::from_str(&text).expect("Checkpoint should be JSON");
    assert!(value.get("config").is_some(), "Missing config field");
    assert!(value.get("digit_weight").is_some(), "Missing digit_weight field");
    assert_eq!(value["epoch"], 1);
}
