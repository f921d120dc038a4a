use aae::{
    aae::{
        checkpoint::{checkpoints, latest_checkpoint, Checkpoint},
        config::{DiscriminatorConfig, GeneratorConfig, TrainerConfig},
        trainer::Trainer,
    },
    dataset::{ImageDataset, ImageTransform},
    learn::{neural_network::layer::Layer, Summarize},
    result::Result,
};
use ndarray::Array;
use std::path::Path;

fn config(dir: &Path, epochs: usize) -> TrainerConfig {
    TrainerConfig {
        generator: GeneratorConfig {
            encoding_dims: 8,
            input_size: 8,
            input_channels: 1,
            step_channels: 2,
            negative_slope: 0.2,
        },
        discriminator: DiscriminatorConfig {
            input_dims: 8,
            negative_slope: 0.2,
        },
        epochs,
        batch_size: 4,
        sample_size: 10,
        checkpoint_dir: dir.join("model"),
        retain_checkpoints: 2,
        image_dir: dir.join("images"),
        seed: Some(0),
        ..TrainerConfig::default()
    }
}

/// `n` 4 x 4 images, padded to 8 x 8.
fn dataset(n: usize) -> ImageDataset {
    let images = Array::from_shape_fn([n, 1, 4, 4], |(i, _, h, w)| {
        ((i * 37 + h * 11 + w * 53) % 256) as u8
    });
    ImageDataset::new(images.into_shared(), ImageTransform::default())
}

fn parameter_values(layer: &impl Layer) -> Vec<Vec<f32>> {
    layer
        .parameters()
        .iter()
        .map(|p| p.value().iter().copied().collect())
        .collect()
}

fn epochs(dir: &Path) -> Result<Vec<usize>> {
    Ok(checkpoints(dir)?.into_iter().map(|(epoch, _)| epoch).collect())
}

#[test]
fn fit_saves_samples_and_checkpoints() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = config(dir.path(), 3);
    let mut trainer = Trainer::new(config.clone())?;
    trainer.fit(&dataset(10))?;
    let summary = trainer.summarize();
    assert_eq!(summary.epoch(), 3);
    assert_eq!(summary.history().len(), 3);
    for stats in summary.history() {
        assert_eq!(stats.count(), 10);
        for name in ["generator_loss", "discriminator_loss"] {
            let loss = stats.loss(name).unwrap();
            assert!(loss.is_finite() && loss > 0., "{name}: {loss}");
        }
    }
    for epoch in 1..=3 {
        let path = config.image_dir.join(format!("epoch{epoch}_generator.png"));
        let image = image::open(&path)?.into_rgb8();
        assert_eq!(image.dimensions(), (8 * 10 + 2, 2 * 10 + 2));
    }
    assert_eq!(epochs(&config.checkpoint_dir)?, [2, 3]);
    let samples = trainer.sample(trainer.fixed_noise().view())?;
    assert_eq!(samples.shape(), &[10, 1, 8, 8]);
    let images = Array::from_elem([1, 1, 8, 8], -1f32);
    assert_eq!(trainer.reconstruct(images.view())?.shape(), &[1, 1, 8, 8]);
    Ok(())
}

#[test]
fn resume_from_checkpoint() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let dataset = dataset(8);
    let mut trainer = Trainer::new(config(dir.path(), 1))?;
    trainer.fit(&dataset)?;
    let path = latest_checkpoint(dir.path().join("model"))?.unwrap();
    let mut checkpoint = Checkpoint::load(&path)?;
    assert_eq!(checkpoint.summary.epoch(), 1);
    assert_eq!(&checkpoint.fixed_noise, trainer.fixed_noise());
    let saved = parameter_values(&checkpoint.generator);
    let trained = parameter_values(trainer.generator());
    assert_eq!(saved, trained);
    assert!(checkpoint
        .generator
        .parameters()
        .iter()
        .all(|p| p.optimizer_state().is_some()));
    checkpoint.config.epochs = 3;
    let mut trainer = Trainer::from_checkpoint(checkpoint)?;
    assert_eq!(trainer.summarize().epoch(), 1);
    trainer.fit(&dataset)?;
    let summary = trainer.summarize();
    assert_eq!(summary.epoch(), 3);
    assert_eq!(summary.history().len(), 3);
    assert_eq!(epochs(&dir.path().join("model"))?, [2, 3]);
    trainer.fit(&dataset)?;
    assert_eq!(trainer.summarize().epoch(), 3);
    Ok(())
}

#[test]
fn skips_batches_of_one() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut trainer = Trainer::new(config(dir.path(), 1))?;
    trainer.fit(&dataset(9))?;
    assert_eq!(trainer.summarize().train().count(), 8);
    Ok(())
}

#[test]
fn seed_is_deterministic() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let a = Trainer::new(config(dir.path(), 1))?;
    let b = Trainer::new(config(dir.path(), 1))?;
    assert_eq!(a.fixed_noise(), b.fixed_noise());
    assert_eq!(
        parameter_values(a.discriminator()),
        parameter_values(b.discriminator())
    );
    assert_eq!(
        parameter_values(a.generator()),
        parameter_values(b.generator())
    );
    Ok(())
}

#[test]
fn rejects_mismatched_dataset() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut trainer = Trainer::new(config(dir.path(), 1))?;
    let images = Array::zeros([4, 1, 8, 8]);
    let dataset = ImageDataset::new(images.into_shared(), ImageTransform::default());
    assert!(trainer.fit(&dataset).is_err());
    assert_eq!(trainer.summarize().epoch(), 0);
    Ok(())
}

#[test]
fn rejects_invalid_config() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path(), 1);
    config.discriminator.input_dims = 16;
    assert!(Trainer::new(config).is_err());
}
