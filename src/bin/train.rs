//! Training binary for the capsule network MNIST classifier.
//!
//! Loads the IDX-format MNIST files, trains with mini-batch SGD or Adam,
//! and writes one JSON metrics event per line so runs can be analyzed or
//! plotted afterwards. Checkpoints are plain JSON and can be resumed from
//! or evaluated with `capsnet-eval`.

use capsnet::checkpoint::{load_checkpoint, save_checkpoint};
use capsnet::data::{load_mnist_test, load_mnist_train, normalize_images, MNIST_MEAN, MNIST_STD};
use capsnet::training::{evaluate, train_epoch, Adam, Optimizer, Sgd};
use capsnet::{CapsNet, CapsNetConfig, MarginLoss};
use clap::Parser;
use ndarray::s;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(
    name = "capsnet-train",
    about = "Train a capsule network classifier on MNIST"
)]
struct Args {
    /// Directory containing the four IDX MNIST files
    #[arg(long, default_value = "data/mnist")]
    data_dir: PathBuf,

    /// Metrics output file (one JSON event per line)
    #[arg(long, default_value = "data/output/metrics.jsonl")]
    metrics_file: PathBuf,

    /// Directory for checkpoint files
    #[arg(long, default_value = "data/checkpoints")]
    checkpoint_dir: PathBuf,

    /// Number of training epochs
    #[arg(long, default_value_t = 10)]
    epochs: usize,

    /// Mini-batch size
    #[arg(long, default_value_t = 64)]
    batch_size: usize,

    /// Learning rate
    #[arg(long, default_value_t = 0.01)]
    learning_rate: f32,

    /// Optimizer to use: "adam" or "sgd"
    #[arg(long, default_value = "adam")]
    optimizer: String,

    /// Momentum coefficient (sgd only)
    #[arg(long, default_value_t = 0.9)]
    momentum: f32,

    /// Routing iterations per forward pass
    #[arg(long, default_value_t = 3)]
    routing_iterations: usize,

    /// Seed for parameter initialization and batch shuffling
    #[arg(long, default_value_t = 4242)]
    seed: u64,

    /// Save a checkpoint every N epochs (0 = only at the end)
    #[arg(long, default_value_t = 1)]
    checkpoint_every: usize,

    /// Evaluate on the test split every N epochs (0 = never)
    #[arg(long, default_value_t = 1)]
    eval_every: usize,

    /// Limit the number of training samples (0 = use all)
    #[arg(long, default_value_t = 0)]
    max_train_samples: usize,

    /// Resume training from a checkpoint file
    #[arg(long)]
    resume: Option<PathBuf>,
}

fn main() {
    let args = Args::parse();

    fs::create_dir_all(&args.checkpoint_dir).expect("Failed to create checkpoint directory");
    if let Some(parent) = args.metrics_file.parent() {
        fs::create_dir_all(parent).expect("Failed to create metrics directory");
    }

    let mut rng = StdRng::seed_from_u64(args.seed);

    let (mut model, start_epoch) = match &args.resume {
        Some(path) => {
            let (data, model) = load_checkpoint(path).expect("Failed to load checkpoint");
            eprintln!(
                "Resumed from {} (epoch {}, loss {:.4}, accuracy {:.2}%)",
                path.display(),
                data.epoch,
                data.avg_loss,
                data.accuracy * 100.0
            );
            (model, data.epoch)
        }
        None => {
            let config = CapsNetConfig {
                routing_iterations: args.routing_iterations,
                ..CapsNetConfig::default()
            };
            let model = CapsNet::new(config, &mut rng).expect("Failed to build model");
            (model, 0)
        }
    };

    let mut optimizer: Box<dyn Optimizer> = match args.optimizer.as_str() {
        "adam" => Box::new(Adam::new(args.learning_rate)),
        "sgd" => Box::new(Sgd::with_momentum(args.learning_rate, args.momentum)),
        other => {
            eprintln!("Unknown optimizer '{}', expected 'adam' or 'sgd'", other);
            std::process::exit(2);
        }
    };

    let (mut train_images, mut train_labels) = match load_mnist_train(&args.data_dir) {
        Ok(pair) => pair,
        Err(e) => {
            eprintln!("Failed to load MNIST training data from {}: {}", args.data_dir.display(), e);
            eprintln!("Expected train-images-idx3-ubyte and train-labels-idx1-ubyte");
            std::process::exit(1);
        }
    };
    if args.max_train_samples > 0 && args.max_train_samples < train_labels.len() {
        train_images = train_images
            .slice(s![..args.max_train_samples, .., .., ..])
            .to_owned();
        train_labels.truncate(args.max_train_samples);
    }
    normalize_images(&mut train_images, MNIST_MEAN, MNIST_STD);

    let test_data = match load_mnist_test(&args.data_dir) {
        Ok((mut images, labels)) => {
            normalize_images(&mut images, MNIST_MEAN, MNIST_STD);
            Some((images, labels))
        }
        Err(e) => {
            eprintln!("No test split available ({}), skipping evaluation", e);
            None
        }
    };

    let margin = MarginLoss::default();

    eprintln!("=== Capsule Network Training ===");
    eprintln!("{}", model.describe());
    eprintln!("Training samples: {}", train_labels.len());
    if let Some((_, labels)) = &test_data {
        eprintln!("Test samples: {}", labels.len());
    }
    eprintln!(
        "Optimizer: {} (lr {}), batch size {}, epochs {}, seed {}",
        args.optimizer, args.learning_rate, args.batch_size, args.epochs, args.seed
    );
    eprintln!();

    let mut metrics_out = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&args.metrics_file)
        .expect("Failed to open metrics file");

    let run_start = serde_json::json!({
        "type": "run_start",
        "epochs": args.epochs,
        "batch_size": args.batch_size,
        "learning_rate": args.learning_rate,
        "optimizer": args.optimizer,
        "routing_iterations": model.config().routing_iterations,
        "seed": args.seed,
        "start_epoch": start_epoch,
        "train_samples": train_labels.len(),
        "parameters": model.num_parameters(),
    });
    writeln!(metrics_out, "{}", run_start).expect("Failed to write metrics");

    let mut last_accuracy = 0.0f32;
    let mut last_loss = f32::INFINITY;

    for epoch in (start_epoch + 1)..=(start_epoch + args.epochs) {
        let epoch_start = Instant::now();

        let result = train_epoch(
            &mut model,
            &train_images.view(),
            &train_labels,
            args.batch_size,
            &margin,
            &mut *optimizer,
            &mut rng,
        );
        let epoch_metrics = match result {
            Ok(m) => m,
            Err(e) => {
                eprintln!("Epoch {} failed: {}", epoch, e);
                std::process::exit(1);
            }
        };

        if !epoch_metrics.avg_loss.is_finite() {
            eprintln!(
                "Loss diverged at epoch {} (avg loss {}), aborting",
                epoch, epoch_metrics.avg_loss
            );
            let event = serde_json::json!({
                "type": "diverged",
                "epoch": epoch,
                "avg_loss": epoch_metrics.avg_loss.to_string(),
            });
            writeln!(metrics_out, "{}", event).expect("Failed to write metrics");
            std::process::exit(1);
        }

        let elapsed = epoch_start.elapsed().as_secs_f64();
        eprintln!(
            "Epoch {:3} | loss {:.4} | train acc {:5.2}% | {:6.1}s",
            epoch,
            epoch_metrics.avg_loss,
            epoch_metrics.accuracy * 100.0,
            elapsed
        );
        last_loss = epoch_metrics.avg_loss;
        last_accuracy = epoch_metrics.accuracy;

        let event = serde_json::json!({
            "type": "epoch",
            "epoch": epoch,
            "avg_loss": epoch_metrics.avg_loss,
            "accuracy": epoch_metrics.accuracy,
            "batches": epoch_metrics.batches,
            "elapsed_secs": elapsed,
            "learning_rate": optimizer.learning_rate(),
        });
        writeln!(metrics_out, "{}", event).expect("Failed to write metrics");

        if let Some((images, labels)) = &test_data {
            if args.eval_every > 0 && epoch % args.eval_every == 0 {
                match evaluate(&model, &images.view(), labels, args.batch_size, &margin) {
                    Ok(test_metrics) => {
                        eprintln!(
                            "          test loss {:.4} | test acc {:5.2}%",
                            test_metrics.loss,
                            test_metrics.accuracy * 100.0
                        );
                        last_accuracy = test_metrics.accuracy;
                        let event = serde_json::json!({
                            "type": "eval",
                            "epoch": epoch,
                            "loss": test_metrics.loss,
                            "accuracy": test_metrics.accuracy,
                        });
                        writeln!(metrics_out, "{}", event).expect("Failed to write metrics");
                    }
                    Err(e) => eprintln!("Evaluation failed at epoch {}: {}", epoch, e),
                }
            }
        }

        if args.checkpoint_every > 0 && epoch % args.checkpoint_every == 0 {
            let path = args.checkpoint_dir.join(format!("epoch_{:03}.json", epoch));
            match save_checkpoint(&model, &path, epoch, last_loss, last_accuracy) {
                Ok(()) => {
                    let event = serde_json::json!({
                        "type": "checkpoint",
                        "epoch": epoch,
                        "path": path.display().to_string(),
                    });
                    writeln!(metrics_out, "{}", event).expect("Failed to write metrics");
                }
                Err(e) => eprintln!("Warning: checkpoint at epoch {} failed: {}", epoch, e),
            }
        }

        metrics_out.flush().expect("Failed to flush metrics");
    }

    let final_epoch = start_epoch + args.epochs;
    let final_path = args.checkpoint_dir.join("final.json");
    match save_checkpoint(&model, &final_path, final_epoch, last_loss, last_accuracy) {
        Ok(()) => eprintln!("Saved final checkpoint to {}", final_path.display()),
        Err(e) => eprintln!("Warning: final checkpoint failed: {}", e),
    }

    let event = serde_json::json!({
        "type": "final",
        "epoch": final_epoch,
        "avg_loss": last_loss,
        "accuracy": last_accuracy,
    });
    writeln!(metrics_out, "{}", event).expect("Failed to write metrics");
    metrics_out.flush().expect("Failed to flush metrics");

    eprintln!("Training complete.");
}
