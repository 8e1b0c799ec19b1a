//! Dataset plumbing: MNIST loading, one-hot targets, batch gathering.

pub mod mnist;

pub use mnist::{
    load_mnist_images, load_mnist_labels, load_mnist_test, load_mnist_train, normalize_images,
    MNIST_MEAN, MNIST_STD,
};

use ndarray::{s, Array2, Array4, ArrayView4};

use crate::core::{CapsError, CapsResult};

/// One-hot targets for a slice of class labels, `(samples, num_classes)`.
pub fn one_hot(labels: &[u8], num_classes: usize) -> CapsResult<Array2<f32>> {
    let mut targets = Array2::<f32>::zeros((labels.len(), num_classes));
    for (i, &label) in labels.iter().enumerate() {
        if label as usize >= num_classes {
            return Err(CapsError::ShapeMismatch(format!(
                "label {} out of range for {} classes",
                label, num_classes
            )));
        }
        targets[[i, label as usize]] = 1.0;
    }
    Ok(targets)
}

/// Copies the selected samples into a contiguous batch.
///
/// `images` is the full `(samples, channels, height, width)` dataset;
/// `indices` picks rows in the order they should appear in the batch.
pub fn gather_batch(
    images: &ArrayView4<f32>,
    labels: &[u8],
    indices: &[usize],
) -> CapsResult<(Array4<f32>, Vec<u8>)> {
    let (total, channels, height, width) = images.dim();
    if labels.len() != total {
        return Err(CapsError::ShapeMismatch(format!(
            "{} images but {} labels",
            total,
            labels.len()
        )));
    }
    let mut batch = Array4::<f32>::zeros((indices.len(), channels, height, width));
    let mut batch_labels = Vec::with_capacity(indices.len());
    for (k, &idx) in indices.iter().enumerate() {
        if idx >= total {
            return Err(CapsError::ShapeMismatch(format!(
                "sample index {} out of range ({} samples)",
                idx, total
            )));
        }
        batch
            .slice_mut(s![k, .., .., ..])
            .assign(&images.slice(s![idx, .., .., ..]));
        batch_labels.push(labels[idx]);
    }
    Ok((batch, batch_labels))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_hot_places_single_one() {
        let targets = one_hot(&[2, 0], 4).unwrap();
        assert_eq!(targets.dim(), (2, 4));
        assert_eq!(targets[[0, 2]], 1.0);
        assert_eq!(targets[[1, 0]], 1.0);
        assert_eq!(targets.sum(), 2.0);
    }

    #[test]
    fn test_one_hot_rejects_out_of_range_label() {
        assert!(matches!(
            one_hot(&[4], 4),
            Err(CapsError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_gather_batch_copies_in_index_order() {
        let mut images = Array4::<f32>::zeros((3, 1, 2, 2));
        for i in 0..3 {
            images.slice_mut(s![i, .., .., ..]).fill(i as f32);
        }
        let labels = vec![0u8, 1, 2];
        let (batch, batch_labels) = gather_batch(&images.view(), &labels, &[2, 0]).unwrap();
        assert_eq!(batch.dim(), (2, 1, 2, 2));
        assert_eq!(batch[[0, 0, 0, 0]], 2.0);
        assert_eq!(batch[[1, 0, 0, 0]], 0.0);
        assert_eq!(batch_labels, vec![2, 0]);
    }

    #[test]
    fn test_gather_batch_rejects_bad_index() {
        let images = Array4::<f32>::zeros((2, 1, 2, 2));
        let labels = vec![0u8, 1];
        assert!(matches!(
            gather_batch(&images.view(), &labels, &[5]),
            Err(CapsError::ShapeMismatch(_))
        ));
    }
}
