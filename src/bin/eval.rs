//! Evaluation binary: restore a checkpoint and score it on MNIST.
//!
//! Prints overall margin loss and accuracy plus a per-class accuracy table,
//! which is where capsule length miscalibration usually shows up first.

use capsnet::checkpoint::load_checkpoint;
use capsnet::data::{
    gather_batch, load_mnist_test, load_mnist_train, normalize_images, MNIST_MEAN, MNIST_STD,
};
use capsnet::training::evaluate;
use capsnet::{CapsNet, CapsResult, MarginLoss};
use clap::Parser;
use ndarray::ArrayView4;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "capsnet-eval",
    about = "Evaluate a capsule network checkpoint on MNIST"
)]
struct Args {
    /// Checkpoint file to evaluate
    #[arg(long)]
    checkpoint: PathBuf,

    /// Directory containing the IDX MNIST files
    #[arg(long, default_value = "data/mnist")]
    data_dir: PathBuf,

    /// Mini-batch size
    #[arg(long, default_value_t = 64)]
    batch_size: usize,

    /// Score the training split instead of the test split
    #[arg(long, default_value_t = false)]
    train_split: bool,
}

fn main() {
    let args = Args::parse();

    let (data, model) = load_checkpoint(&args.checkpoint).expect("Failed to load checkpoint");
    eprintln!(
        "Loaded {} (epoch {}, recorded accuracy {:.2}%)",
        args.checkpoint.display(),
        data.epoch,
        data.accuracy * 100.0
    );
    eprintln!("{}", model.describe());
    eprintln!();

    let loaded = if args.train_split {
        load_mnist_train(&args.data_dir)
    } else {
        load_mnist_test(&args.data_dir)
    };
    let (mut images, labels) = match loaded {
        Ok(pair) => pair,
        Err(e) => {
            eprintln!("Failed to load MNIST data from {}: {}", args.data_dir.display(), e);
            std::process::exit(1);
        }
    };
    normalize_images(&mut images, MNIST_MEAN, MNIST_STD);

    let split = if args.train_split { "train" } else { "test" };
    eprintln!("Scoring {} samples from the {} split", labels.len(), split);

    let margin = MarginLoss::default();
    let metrics = evaluate(&model, &images.view(), &labels, args.batch_size, &margin)
        .expect("Evaluation failed");
    let (correct, total) = per_class_counts(&model, &images.view(), &labels, args.batch_size)
        .expect("Evaluation failed");

    println!(
        "Overall: accuracy {:.2}% | margin loss {:.4} | {} samples",
        metrics.accuracy * 100.0,
        metrics.loss,
        labels.len()
    );
    println!();
    println!("Class  Accuracy  Samples");
    for class in 0..correct.len() {
        if total[class] == 0 {
            println!("{:>5}       n/a  {:>7}", class, 0);
            continue;
        }
        let accuracy = correct[class] as f32 / total[class] as f32;
        println!(
            "{:>5}  {:>7.2}%  {:>7}",
            class,
            accuracy * 100.0,
            total[class]
        );
    }
}

/// Per-class correct and total counts over the whole set, batched so memory
/// stays bounded.
fn per_class_counts(
    model: &CapsNet,
    images: &ArrayView4<f32>,
    labels: &[u8],
    batch_size: usize,
) -> CapsResult<(Vec<usize>, Vec<usize>)> {
    let num_classes = model.config().num_classes;
    let mut correct = vec![0usize; num_classes];
    let mut total = vec![0usize; num_classes];

    let indices: Vec<usize> = (0..labels.len()).collect();
    for chunk in indices.chunks(batch_size) {
        let (batch_images, batch_labels) = gather_batch(images, labels, chunk)?;
        let state = model.forward(&batch_images.view())?;
        let predictions = model.predict(&state.output());
        for (prediction, &label) in predictions.iter().zip(batch_labels.iter()) {
            total[label as usize] += 1;
            if *prediction == label as usize {
                correct[label as usize] += 1;
            }
        }
    }
    Ok((correct, total))
}
