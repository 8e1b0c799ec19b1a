//! Checkpoint save/load for capsule networks.
//!
//! Serializes the configuration and every weight tensor to JSON. Loading
//! rebuilds the model from the stored configuration and then overwrites the
//! freshly initialized parameters with the stored values, so a loaded model
//! reproduces the saved one exactly. Optimizer state is not stored; training
//! resumed from a checkpoint restarts its momentum estimates.

use ndarray::{Array1, Array4};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::core::CapsNet;
use crate::CapsNetConfig;
use rand::rngs::StdRng;
use rand::SeedableRng;

/// One tensor flattened for serialization, row-major.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorData {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

/// Serializable checkpoint data.
#[derive(Debug, Serialize, Deserialize)]
pub struct CheckpointData {
    /// Architecture the tensors belong to.
    pub config: CapsNetConfig,
    pub conv_weight: TensorData,
    pub conv_bias: TensorData,
    /// One weight/bias pair per primary capsule map, in map order.
    pub primary_weights: Vec<TensorData>,
    pub primary_biases: Vec<TensorData>,
    pub digit_weight: TensorData,
    /// Epochs completed when this checkpoint was saved.
    pub epoch: usize,
    /// Average training loss at checkpoint time.
    pub avg_loss: f32,
    /// Evaluation accuracy at checkpoint time.
    pub accuracy: f32,
}

fn array4_to_data(arr: &Array4<f32>) -> TensorData {
    TensorData {
        shape: arr.shape().to_vec(),
        data: arr.iter().copied().collect(),
    }
}

fn array1_to_data(arr: &Array1<f32>) -> TensorData {
    TensorData {
        shape: vec![arr.len()],
        data: arr.to_vec(),
    }
}

fn data_to_array4(td: &TensorData, name: &str) -> Result<Array4<f32>, String> {
    if td.shape.len() != 4 {
        return Err(format!(
            "Checkpoint tensor {name} has {} dimensions, expected 4",
            td.shape.len()
        ));
    }
    Array4::from_shape_vec(
        (td.shape[0], td.shape[1], td.shape[2], td.shape[3]),
        td.data.clone(),
    )
    .map_err(|e| format!("Failed to reconstruct tensor {name}: {e}"))
}

fn data_to_array1(td: &TensorData, name: &str) -> Result<Array1<f32>, String> {
    if td.shape.len() != 1 || td.shape[0] != td.data.len() {
        return Err(format!("Checkpoint tensor {name} has an inconsistent shape"));
    }
    Ok(Array1::from(td.data.clone()))
}

fn restore4(target: &mut Array4<f32>, td: &TensorData, name: &str) -> Result<(), String> {
    let arr = data_to_array4(td, name)?;
    if arr.dim() != target.dim() {
        return Err(format!(
            "Checkpoint tensor {name} has shape {:?}, expected {:?}",
            arr.shape(),
            target.shape()
        ));
    }
    *target = arr;
    Ok(())
}

fn restore1(target: &mut Array1<f32>, td: &TensorData, name: &str) -> Result<(), String> {
    let arr = data_to_array1(td, name)?;
    if arr.len() != target.len() {
        return Err(format!(
            "Checkpoint tensor {name} has length {}, expected {}",
            arr.len(),
            target.len()
        ));
    }
    *target = arr;
    Ok(())
}

/// Save a model checkpoint to a JSON file.
///
/// # Errors
///
/// Returns an error if the file cannot be written or the data cannot be
/// serialized.
pub fn save_checkpoint(
    model: &CapsNet,
    path: &Path,
    epoch: usize,
    avg_loss: f32,
    accuracy: f32,
) -> Result<(), String> {
    let data = CheckpointData {
        config: model.config().clone(),
        conv_weight: array4_to_data(&model.conv.weight),
        conv_bias: array1_to_data(&model.conv.bias),
        primary_weights: model
            .primary
            .convs
            .iter()
            .map(|c| array4_to_data(&c.weight))
            .collect(),
        primary_biases: model
            .primary
            .convs
            .iter()
            .map(|c| array1_to_data(&c.bias))
            .collect(),
        digit_weight: array4_to_data(&model.digit.weight),
        epoch,
        avg_loss,
        accuracy,
    };

    let json = serde_json::to_string_pretty(&data)
        .map_err(|e| format!("Failed to serialize checkpoint: {e}"))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create checkpoint directory: {e}"))?;
    }

    std::fs::write(path, json)
        .map_err(|e| format!("Failed to write checkpoint to {}: {e}", path.display()))
}

/// Load a model checkpoint from a JSON file.
///
/// Rebuilds the network from the stored configuration and restores every
/// weight tensor.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, or if any stored
/// tensor disagrees with the stored configuration.
pub fn load_checkpoint(path: &Path) -> Result<(CheckpointData, CapsNet), String> {
    let json = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read checkpoint from {}: {e}", path.display()))?;

    let data: CheckpointData =
        serde_json::from_str(&json).map_err(|e| format!("Failed to parse checkpoint: {e}"))?;

    // The seed is irrelevant: every parameter is overwritten below.
    let mut rng = StdRng::seed_from_u64(0);
    let mut model = CapsNet::new(data.config.clone(), &mut rng)
        .map_err(|e| format!("Checkpoint configuration is invalid: {e}"))?;

    restore4(&mut model.conv.weight, &data.conv_weight, "conv1.weight")?;
    restore1(&mut model.conv.bias, &data.conv_bias, "conv1.bias")?;

    if data.primary_weights.len() != model.primary.convs.len()
        || data.primary_biases.len() != model.primary.convs.len()
    {
        return Err(format!(
            "Checkpoint carries {} primary maps, configuration expects {}",
            data.primary_weights.len(),
            model.primary.convs.len()
        ));
    }
    for (m, conv) in model.primary.convs.iter_mut().enumerate() {
        restore4(
            &mut conv.weight,
            &data.primary_weights[m],
            &format!("primary.{m}.weight"),
        )?;
        restore1(
            &mut conv.bias,
            &data.primary_biases[m],
            &format!("primary.{m}.bias"),
        )?;
    }
    restore4(&mut model.digit.weight, &data.digit_weight, "digit.weight")?;

    Ok((data, model))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ConvConfig;
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;
    use std::fs;

    fn make_test_model() -> CapsNet {
        let config = CapsNetConfig {
            input_height: 6,
            input_width: 6,
            conv1: ConvConfig {
                in_channels: 1,
                out_channels: 3,
                kernel_size: 3,
                stride: 1,
            },
            conv2: ConvConfig {
                in_channels: 3,
                out_channels: 2,
                kernel_size: 3,
                stride: 1,
            },
            caps_maps: 2,
            caps_dims: 2,
            num_classes: 3,
            digit_dims: 4,
            routing_iterations: 2,
        };
        let mut rng = StdRng::seed_from_u64(99);
        CapsNet::new(config, &mut rng).unwrap()
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let model = make_test_model();
        let dir = std::env::temp_dir().join("capsnet_test_checkpoint");
        let path = dir.join("round_trip.json");

        save_checkpoint(&model, &path, 5, 0.42, 0.15).expect("save");
        let (data, loaded) = load_checkpoint(&path).expect("load");

        assert_eq!(data.epoch, 5);
        assert_eq!(data.config, *model.config());
        assert_eq!(loaded.conv.weight, model.conv.weight);
        assert_eq!(loaded.conv.bias, model.conv.bias);
        assert_eq!(loaded.digit.weight, model.digit.weight);
        for (a, b) in loaded.primary.convs.iter().zip(model.primary.convs.iter()) {
            assert_eq!(a.weight, b.weight);
            assert_eq!(a.bias, b.bias);
        }

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_loaded_model_reproduces_outputs() {
        let model = make_test_model();
        let dir = std::env::temp_dir().join("capsnet_test_checkpoint_fwd");
        let path = dir.join("forward.json");
        save_checkpoint(&model, &path, 0, 0.0, 0.0).expect("save");
        let (_, loaded) = load_checkpoint(&path).expect("load");

        let mut rng = StdRng::seed_from_u64(7);
        let images = Array4::random_using((2, 1, 6, 6), Uniform::new(0.0, 1.0), &mut rng);
        let original = model.forward(&images.view()).unwrap();
        let restored = loaded.forward(&images.view()).unwrap();
        assert_eq!(original.routing.output, restored.routing.output);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_checkpoint_creates_directory() {
        let dir = std::env::temp_dir()
            .join("capsnet_test_nested")
            .join("deep")
            .join("path");
        let path = dir.join("checkpoint.json");

        let model = make_test_model();
        let result = save_checkpoint(&model, &path, 0, 0.0, 0.0);
        assert!(result.is_ok());
        assert!(path.exists());

        let _ = fs::remove_dir_all(std::env::temp_dir().join("capsnet_test_nested"));
    }

    #[test]
    fn test_load_nonexistent_checkpoint() {
        let result = load_checkpoint(Path::new("/nonexistent/path.json"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_rejects_corrupt_file() {
        let dir = std::env::temp_dir().join("capsnet_test_corrupt");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("corrupt.json");
        fs::write(&path, "{\"not\": \"a checkpoint\"}").unwrap();
        assert!(load_checkpoint(&path).is_err());
        let _ = fs::remove_dir_all(&dir);
    }
}
