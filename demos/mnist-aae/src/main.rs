use aae::{
    aae::{
        checkpoint::{latest_checkpoint, Checkpoint},
        config::TrainerConfig,
        trainer::Trainer,
        visualize::save_image_grid,
    },
    dataset::{
        mnist::{Mnist, MnistKind},
        ImageDataset, ImageTransform,
    },
    learn::Summarize,
    result::Result,
};
use aae::ndarray::s;
use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Trains an Adversarial Autoencoder on MNIST.
#[derive(Parser, Debug)]
#[command(author, version)]
struct Options {
    /// JSON trainer config, missing fields take their defaults. Ignored with --resume.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Directory with the MNIST files. Defaults to the downloads directory.
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Download missing files.
    #[arg(long)]
    download: bool,
    /// Use FashionMNIST.
    #[arg(long)]
    fashion: bool,
    /// Overrides the number of epochs.
    #[arg(long)]
    epochs: Option<usize>,
    /// Overrides the batch size.
    #[arg(long)]
    batch_size: Option<usize>,
    /// Overrides the seed.
    #[arg(long)]
    seed: Option<u64>,
    /// Writes checkpoints into <OUTPUT_DIR>/model and images into <OUTPUT_DIR>/images.
    #[arg(long)]
    output_dir: Option<PathBuf>,
    /// Resumes from a checkpoint file, or the latest checkpoint in a directory.
    #[arg(long, value_name = "CHECKPOINT")]
    resume: Option<PathBuf>,
}

impl Options {
    /// Applies the overrides to `config`.
    fn apply(&self, config: &mut TrainerConfig) {
        if let Some(output_dir) = self.output_dir.as_ref() {
            config.checkpoint_dir = output_dir.join("model");
            config.image_dir = output_dir.join("images");
        }
        if let Some(epochs) = self.epochs {
            config.epochs = epochs;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let options = Options::parse();
    let mut trainer = if let Some(path) = options.resume.as_ref() {
        let path = if path.is_dir() {
            latest_checkpoint(path)?
                .with_context(|| format!("No checkpoint found in {path:?}!"))?
        } else {
            path.clone()
        };
        tracing::info!("Loading {path:?}.");
        let mut checkpoint = Checkpoint::load(&path)?;
        options.apply(&mut checkpoint.config);
        Trainer::from_checkpoint(checkpoint)?
    } else {
        let mut config = if let Some(path) = options.config.as_ref() {
            TrainerConfig::from_path(path)?
        } else {
            TrainerConfig::default()
        };
        options.apply(&mut config);
        Trainer::new(config)?
    };
    println!("{:#?}", trainer.config());

    let kind = if options.fashion {
        MnistKind::Fashion
    } else {
        MnistKind::Digits
    };
    let builder = Mnist::builder().kind(kind).download(options.download);
    let mnist = if let Some(data_dir) = options.data_dir.as_deref() {
        builder.path(data_dir).build()?
    } else {
        builder.build()?
    };
    let dataset = ImageDataset::new(mnist.train_images().clone(), ImageTransform::default());
    trainer.fit(&dataset)?;

    let summary = trainer.summarize();
    for (epoch, stats) in summary.history().iter().enumerate() {
        let losses = stats
            .losses()
            .map(|(name, loss)| format!("{name}: {loss:.5}"))
            .collect::<Vec<_>>()
            .join(" ");
        println!("epoch: {} {losses}", epoch + 1);
    }
    println!("total time: {:.2?}", summary.total_time());

    // Reconstructions of the first test images.
    let test = ImageDataset::new(mnist.test_images().clone(), ImageTransform::default());
    let images = test
        .transform()
        .apply(test.images().slice(s![..test.len().min(64), .., .., ..]));
    let reconstructions = trainer.reconstruct(images.view())?;
    let path = trainer.config().image_dir.join("reconstructions.png");
    save_image_grid(reconstructions.view(), 8, &path)?;
    println!("Saved {path:?}.");
    Ok(())
}
