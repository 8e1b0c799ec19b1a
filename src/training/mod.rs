//! Training and evaluation drivers.
//!
//! [`train_batch`] runs one optimization step end to end: zero gradients,
//! forward, margin loss, backward, optimizer update. [`train_epoch`] shuffles
//! the dataset with the caller's RNG and feeds it through `train_batch` in
//! mini-batches, so a fixed seed reproduces the exact batch order.
//! [`evaluate`] measures loss and accuracy without touching parameters.

pub mod optimizer;

pub use optimizer::{Adam, Optimizer, Sgd};

use ndarray::{s, ArrayView4};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::core::{CapsError, CapsNet, CapsResult, MarginLoss};
use crate::data::{gather_batch, one_hot};

/// Loss and accuracy over one batch or one evaluation run.
#[derive(Debug, Clone, Copy)]
pub struct Metrics {
    pub loss: f32,
    pub accuracy: f32,
}

/// Sample-weighted averages over a full epoch.
#[derive(Debug, Clone, Copy)]
pub struct EpochMetrics {
    pub avg_loss: f32,
    pub accuracy: f32,
    pub batches: usize,
}

/// Fraction of predictions matching their labels.
pub fn accuracy(predictions: &[usize], labels: &[u8]) -> f32 {
    if predictions.is_empty() {
        return 0.0;
    }
    let correct = predictions
        .iter()
        .zip(labels)
        .filter(|(p, l)| **p == **l as usize)
        .count();
    correct as f32 / predictions.len() as f32
}

/// One optimization step over a batch of images and labels.
pub fn train_batch(
    model: &mut CapsNet,
    images: &ArrayView4<f32>,
    labels: &[u8],
    margin: &MarginLoss,
    optimizer: &mut dyn Optimizer,
) -> CapsResult<Metrics> {
    let batch = images.dim().0;
    if labels.len() != batch {
        return Err(CapsError::ShapeMismatch(format!(
            "{} images but {} labels",
            batch,
            labels.len()
        )));
    }
    let targets = one_hot(labels, model.config().num_classes)?;

    model.zero_grad();
    let state = model.forward(images)?;
    let loss = margin.compute(&state.output(), &targets.view())?;
    let grad = margin.backward(&state.output(), &targets.view())?;
    model.backward(&state, &grad.view())?;
    optimizer.step(&mut model.parameters());

    let predictions = model.predict(&state.output());
    Ok(Metrics {
        loss,
        accuracy: accuracy(&predictions, labels),
    })
}

/// One pass over the dataset in shuffled mini-batches.
///
/// The final batch may be smaller than `batch_size`; metrics weight every
/// sample equally regardless of its batch.
pub fn train_epoch(
    model: &mut CapsNet,
    images: &ArrayView4<f32>,
    labels: &[u8],
    batch_size: usize,
    margin: &MarginLoss,
    optimizer: &mut dyn Optimizer,
    rng: &mut StdRng,
) -> CapsResult<EpochMetrics> {
    if batch_size == 0 {
        return Err(CapsError::Config("batch size must be positive".to_string()));
    }
    let total = images.dim().0;
    if total == 0 {
        return Err(CapsError::ShapeMismatch("empty training set".to_string()));
    }
    if labels.len() != total {
        return Err(CapsError::ShapeMismatch(format!(
            "{} images but {} labels",
            total,
            labels.len()
        )));
    }

    let mut indices: Vec<usize> = (0..total).collect();
    indices.shuffle(rng);

    let mut loss_sum = 0.0;
    let mut acc_sum = 0.0;
    let mut batches = 0;
    for chunk in indices.chunks(batch_size) {
        let (batch_images, batch_labels) = gather_batch(images, labels, chunk)?;
        let metrics = train_batch(model, &batch_images.view(), &batch_labels, margin, optimizer)?;
        loss_sum += metrics.loss * chunk.len() as f32;
        acc_sum += metrics.accuracy * chunk.len() as f32;
        batches += 1;
    }
    Ok(EpochMetrics {
        avg_loss: loss_sum / total as f32,
        accuracy: acc_sum / total as f32,
        batches,
    })
}

/// Loss and accuracy over a dataset, walked in order without updates.
pub fn evaluate(
    model: &CapsNet,
    images: &ArrayView4<f32>,
    labels: &[u8],
    batch_size: usize,
    margin: &MarginLoss,
) -> CapsResult<Metrics> {
    if batch_size == 0 {
        return Err(CapsError::Config("batch size must be positive".to_string()));
    }
    let total = images.dim().0;
    if total == 0 {
        return Err(CapsError::ShapeMismatch("empty evaluation set".to_string()));
    }
    if labels.len() != total {
        return Err(CapsError::ShapeMismatch(format!(
            "{} images but {} labels",
            total,
            labels.len()
        )));
    }

    let mut loss_sum = 0.0;
    let mut correct = 0usize;
    let mut start = 0;
    while start < total {
        let end = (start + batch_size).min(total);
        let batch = images.slice(s![start..end, .., .., ..]);
        let batch_labels = &labels[start..end];
        let state = model.forward(&batch)?;
        let targets = one_hot(batch_labels, model.config().num_classes)?;
        loss_sum += margin.compute(&state.output(), &targets.view())? * (end - start) as f32;
        let predictions = model.predict(&state.output());
        correct += predictions
            .iter()
            .zip(batch_labels)
            .filter(|(p, l)| **p == **l as usize)
            .count();
        start = end;
    }
    Ok(Metrics {
        loss: loss_sum / total as f32,
        accuracy: correct as f32 / total as f32,
    })
}
