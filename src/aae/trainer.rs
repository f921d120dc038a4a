use super::{
    checkpoint::{prune_checkpoints, Checkpoint},
    config::{NetworkOptimizer, TrainerConfig},
    discriminator::Discriminator,
    generator::Generator,
    loss::{AdversarialLoss, TrainContext},
    visualize::save_image_grid,
};
use crate::{
    dataset::ImageDataset,
    learn::{
        neural_network::{
            autograd::Variable,
            layer::{Forward, Layer},
        },
        Stats, Summarize, Summary, Train,
    },
    result::Result,
};
use anyhow::ensure;
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{Array, Array2, Array4, ArrayView2, ArrayView4};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::path::{Path, PathBuf};

fn seeded_rng(seed: Option<u64>, epoch: usize) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(epoch as u64)),
        None => StdRng::from_entropy(),
    }
}

fn standard_normal(rng: &mut impl Rng, dim: [usize; 2]) -> Array2<f32> {
    Array::from_shape_simple_fn(dim, || rng.sample(StandardNormal))
}

/// Trains the [`Generator`] and [`Discriminator`].
///
/// Each batch runs the configured losses in order, by default the [`GeneratorLoss`](super::loss::GeneratorLoss)
/// and then the [`DiscriminatorLoss`](super::loss::DiscriminatorLoss). After each epoch the trainer
/// renders the fixed noise into `image_dir/epoch{N}_generator.png` and saves a checkpoint into
/// `checkpoint_dir`, keeping the `retain_checkpoints` latest.
pub struct Trainer {
    config: TrainerConfig,
    generator: Generator,
    discriminator: Discriminator,
    generator_optimizer: NetworkOptimizer,
    discriminator_optimizer: NetworkOptimizer,
    losses: Vec<Box<dyn AdversarialLoss>>,
    fixed_noise: Array2<f32>,
    summary: Summary,
    rng: StdRng,
}

impl Trainer {
    /// Creates a new trainer with `config`.
    ///
    /// **Errors**
    ///
    /// The config is invalid, see [`TrainerConfig::validate()`].
    pub fn new(config: TrainerConfig) -> Result<Self> {
        config.validate()?;
        let mut rng = seeded_rng(config.seed, 0);
        let generator = Generator::new(&config.generator, &mut rng)?;
        let discriminator = Discriminator::new(&config.discriminator, &mut rng)?;
        let fixed_noise = standard_normal(
            &mut rng,
            [config.sample_size, config.generator.encoding_dims],
        );
        Self::from_parts(config, generator, discriminator, fixed_noise, Summary::default(), rng)
    }
    /// Restores a trainer from `checkpoint`, resuming at the next epoch.
    ///
    /// The config of the checkpoint may be modified first, for example to train for more epochs.
    ///
    /// **Errors**
    /// - The config is invalid.
    /// - The networks or the fixed noise do not match the config.
    pub fn from_checkpoint(checkpoint: Checkpoint) -> Result<Self> {
        let Checkpoint {
            config,
            summary,
            generator,
            discriminator,
            fixed_noise,
        } = checkpoint;
        config.validate()?;
        ensure!(
            generator.config() == &config.generator,
            "Checkpoint generator does not match the config!"
        );
        ensure!(
            discriminator.config() == &config.discriminator,
            "Checkpoint discriminator does not match the config!"
        );
        ensure!(
            fixed_noise.dim() == (config.sample_size, config.generator.encoding_dims),
            "Checkpoint fixed noise {:?} does not match the config!",
            fixed_noise.shape()
        );
        let rng = seeded_rng(config.seed, summary.epoch());
        tracing::info!("Resuming from epoch {}.", summary.epoch());
        Self::from_parts(config, generator, discriminator, fixed_noise, summary, rng)
    }
    /// Loads the checkpoint at `path` and restores a trainer, see
    /// [`.from_checkpoint()`](Self::from_checkpoint).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_checkpoint(Checkpoint::load(path)?)
    }
    fn from_parts(
        config: TrainerConfig,
        mut generator: Generator,
        mut discriminator: Discriminator,
        fixed_noise: Array2<f32>,
        summary: Summary,
        rng: StdRng,
    ) -> Result<Self> {
        generator.set_training(true)?;
        discriminator.set_training(true)?;
        let generator_optimizer = config.generator_optimizer.build()?;
        let discriminator_optimizer = config.discriminator_optimizer.build()?;
        let losses = config.losses.iter().map(|loss| loss.build()).collect();
        Ok(Self {
            config,
            generator,
            discriminator,
            generator_optimizer,
            discriminator_optimizer,
            losses,
            fixed_noise,
            summary,
            rng,
        })
    }
    /// The config.
    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }
    /// The generator.
    pub fn generator(&self) -> &Generator {
        &self.generator
    }
    /// The discriminator.
    pub fn discriminator(&self) -> &Discriminator {
        &self.discriminator
    }
    /// The noise rendered after each epoch.
    pub fn fixed_noise(&self) -> &Array2<f32> {
        &self.fixed_noise
    }
    /// Trains until `config.epochs` epochs are completed.
    ///
    /// Returns immediately if they already are, for example when resuming from the final
    /// checkpoint.
    ///
    /// **Errors**
    /// - The images do not match the generator config.
    /// - Samples or checkpoints could not be saved.
    pub fn fit(&mut self, dataset: &ImageDataset) -> Result<()> {
        let input_size = self.config.generator.input_size;
        let input_channels = self.config.generator.input_channels;
        ensure!(
            dataset.channels() == input_channels && dataset.image_size() == [input_size, input_size],
            "Dataset images [{}, {:?}] do not match the generator [{input_channels}, [{input_size}, {input_size}]]!",
            dataset.channels(),
            dataset.image_size(),
        );
        let epochs = self.config.epochs;
        let start = self.summary.epoch();
        if start >= epochs {
            tracing::info!("Already trained for {start} epochs.");
            return Ok(());
        }
        tracing::info!(
            "Training for {} epochs on {} images, generator parameters: {}, discriminator parameters: {}",
            epochs - start,
            dataset.len(),
            self.generator.parameter_count(),
            self.discriminator.parameter_count(),
        );
        let style = ProgressStyle::with_template("[{elapsed_precise}] {bar:40} {pos}/{len} epochs {msg}")?;
        let bar = ProgressBar::new(epochs as u64)
            .with_style(style)
            .with_position(start as u64);
        while self.summary.epoch() < epochs {
            let batches = dataset
                .batches(self.config.batch_size, true, &mut self.rng)?
                .drop_last(self.config.drop_last);
            let stats = self.train(batches)?;
            let epoch = self.summary.epoch();
            let losses = stats
                .losses()
                .map(|(name, loss)| format!("{name}: {loss:.5}"))
                .collect::<Vec<_>>()
                .join(" ");
            tracing::info!(
                "epoch: {epoch} elapsed: {:.2?} {losses}",
                self.summary.epoch_time()
            );
            let image = self.save_samples()?;
            tracing::debug!("Saved {image:?}.");
            self.save_checkpoint()?;
            bar.set_message(losses);
            bar.inc(1);
        }
        bar.finish();
        Ok(())
    }
    /// Generates images by decoding `noise` [n, `encoding_dims`].
    ///
    /// Runs the generator in evaluation mode, using the running statistics of the batch norms.
    pub fn sample(&self, noise: ArrayView2<f32>) -> Result<Array4<f32>> {
        let mut generator = self.generator.clone();
        generator.set_training(false)?;
        generator.sample(noise)
    }
    /// Encodes and decodes `images` in evaluation mode.
    pub fn reconstruct(&self, images: ArrayView4<f32>) -> Result<Array4<f32>> {
        let mut generator = self.generator.clone();
        generator.set_training(false)?;
        let (reconstruction, _) = generator.forward(Variable::from(images.to_owned()))?;
        Ok(reconstruction.into_value().into_owned())
    }
    /// Decodes the fixed noise into `image_dir/epoch{N}_generator.png`.
    ///
    /// Returns the path.
    pub fn save_samples(&self) -> Result<PathBuf> {
        let images = self.sample(self.fixed_noise.view())?;
        let path = self
            .config
            .image_dir
            .join(format!("epoch{}_generator.png", self.summary.epoch()));
        save_image_grid(images.view(), 8, &path)?;
        Ok(path)
    }
    /// The current state as a checkpoint.
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            config: self.config.clone(),
            summary: self.summary.clone(),
            generator: self.generator.clone(),
            discriminator: self.discriminator.clone(),
            fixed_noise: self.fixed_noise.clone(),
        }
    }
    /// Saves a checkpoint into `checkpoint_dir` and removes the oldest beyond
    /// `retain_checkpoints`.
    ///
    /// Returns the path.
    pub fn save_checkpoint(&self) -> Result<PathBuf> {
        let dir = &self.config.checkpoint_dir;
        let path = self.checkpoint().save(dir)?;
        tracing::info!("Saved {path:?}.");
        prune_checkpoints(dir, self.config.retain_checkpoints)?;
        Ok(path)
    }
}

impl Train<Array4<f32>> for Trainer {
    fn train<I>(&mut self, train_iter: I) -> Result<Stats>
    where
        I: IntoIterator<Item = Array4<f32>>,
    {
        let Self {
            generator,
            discriminator,
            generator_optimizer,
            discriminator_optimizer,
            losses,
            summary,
            rng,
            ..
        } = self;
        let mut train_iter = train_iter.into_iter();
        summary.run_epoch(|summary| {
            let mut stats = Stats::default();
            let mut context = TrainContext {
                generator: &mut *generator,
                discriminator: &mut *discriminator,
                generator_optimizer: &*generator_optimizer,
                discriminator_optimizer: &*discriminator_optimizer,
                rng: &mut *rng,
            };
            for (i, batch) in train_iter.by_ref().enumerate() {
                let batch_size = batch.dim().0;
                if batch_size < 2 {
                    tracing::warn!(
                        "Skipping batch {i} of epoch {} with {batch_size} images, batch norm requires at least 2.",
                        summary.epoch() + 1
                    );
                    continue;
                }
                let batch = batch.into_shared();
                for loss in losses.iter() {
                    let value = loss.train_ops(&mut context, &batch)?;
                    ensure!(
                        value.is_finite(),
                        "{} is {value} at batch {i}!",
                        loss.name()
                    );
                    tracing::debug!("batch: {i} {}: {value}", loss.name());
                    stats.add_loss(loss.name(), batch_size, value);
                }
                stats.add_count(batch_size);
            }
            Ok(stats)
        })
    }
}

impl Summarize for Trainer {
    fn summarize(&self) -> Summary {
        self.summary.clone()
    }
}
