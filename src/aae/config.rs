use super::loss::{AdversarialLoss, DiscriminatorLoss, GeneratorLoss};
use crate::{
    error::{ensure_non_negative, ensure_nonzero, ConfigError},
    learn::neural_network::{
        layer::Layer,
        optimizer::{Adam, SGD},
    },
    result::Result,
};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
};

/// Generator config.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// The size of the latent code.
    pub encoding_dims: usize,
    /// The height and width of the images. `input_size / 2` must be a power of 4.
    pub input_size: usize,
    /// The channels of the images.
    pub input_channels: usize,
    /// The channels of the first convolution, multiplied by 4 for each following one.
    pub step_channels: usize,
    /// LeakyReLU negative slope.
    pub negative_slope: f32,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            encoding_dims: 128,
            input_size: 32,
            input_channels: 1,
            step_channels: 16,
            negative_slope: 0.2,
        }
    }
}

impl GeneratorConfig {
    /// Validates the config.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure_nonzero("encoding_dims", self.encoding_dims)?;
        ensure_nonzero("input_channels", self.input_channels)?;
        ensure_nonzero("step_channels", self.step_channels)?;
        ensure_non_negative("generator.negative_slope", self.negative_slope)?;
        let input_size = self.input_size;
        let half = input_size / 2;
        if input_size % 2 != 0 || half == 0 || !half.is_power_of_two() || half.trailing_zeros() % 2 != 0 {
            return Err(ConfigError::InputSize { input_size });
        }
        Ok(())
    }
}

/// Discriminator config.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscriminatorConfig {
    /// The size of the latent code.
    pub input_dims: usize,
    /// LeakyReLU negative slope.
    pub negative_slope: f32,
}

impl Default for DiscriminatorConfig {
    fn default() -> Self {
        Self {
            input_dims: 128,
            negative_slope: 0.2,
        }
    }
}

impl DiscriminatorConfig {
    /// Validates the config.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure_nonzero("input_dims / 2", self.input_dims / 2)?;
        ensure_non_negative("discriminator.negative_slope", self.negative_slope)
    }
}

fn default_learning_rate() -> f32 {
    2e-4
}

fn default_betas() -> [f32; 2] {
    [0.5, 0.999]
}

fn default_eps() -> f32 {
    1e-8
}

/// Optimizer config.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name")]
pub enum OptimizerConfig {
    /// [`Adam`].
    Adam {
        /// The learning rate.
        #[serde(default = "default_learning_rate")]
        learning_rate: f32,
        /// See [`AdamBuilder::betas()`](crate::learn::neural_network::optimizer::builder::AdamBuilder::betas).
        #[serde(default = "default_betas")]
        betas: [f32; 2],
        /// Added to the denominator.
        #[serde(default = "default_eps")]
        eps: f32,
        /// L2 penalty.
        #[serde(default)]
        weight_decay: f32,
    },
    /// [`SGD`].
    SGD {
        /// The learning rate.
        #[serde(default = "default_learning_rate")]
        learning_rate: f32,
        /// Momentum.
        #[serde(default)]
        momentum: Option<f32>,
    },
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self::Adam {
            learning_rate: default_learning_rate(),
            betas: default_betas(),
            eps: default_eps(),
            weight_decay: 0.,
        }
    }
}

impl OptimizerConfig {
    /// The learning rate.
    pub fn learning_rate(&self) -> f32 {
        match self {
            Self::Adam { learning_rate, .. } | Self::SGD { learning_rate, .. } => *learning_rate,
        }
    }
    /// Builds the optimizer.
    pub fn build(&self) -> Result<NetworkOptimizer, ConfigError> {
        let learning_rate = self.learning_rate();
        ensure_non_negative("learning_rate", learning_rate)?;
        let kind = match self {
            Self::Adam {
                betas,
                eps,
                weight_decay,
                ..
            } => OptimizerKind::Adam(
                Adam::builder()
                    .betas(*betas)
                    .eps(*eps)
                    .weight_decay(*weight_decay)
                    .build()?,
            ),
            Self::SGD { momentum, .. } => {
                let mut builder = SGD::builder();
                if let Some(momentum) = *momentum {
                    ensure_non_negative("momentum", momentum)?;
                    builder = builder.momentum(momentum);
                }
                OptimizerKind::SGD(builder.build())
            }
        };
        Ok(NetworkOptimizer {
            learning_rate,
            kind,
        })
    }
}

#[derive(Clone, Debug)]
enum OptimizerKind {
    Adam(Adam),
    SGD(SGD),
}

/// An optimizer with a learning rate, built from an [`OptimizerConfig`].
#[derive(Clone, Debug)]
pub struct NetworkOptimizer {
    learning_rate: f32,
    kind: OptimizerKind,
}

impl NetworkOptimizer {
    /// The learning rate.
    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }
    /// Updates the parameters of `layer` that have a gradient.
    pub fn step<L: Layer>(&self, layer: &mut L) -> Result<()> {
        match &self.kind {
            OptimizerKind::Adam(optimizer) => layer.update(self.learning_rate, optimizer),
            OptimizerKind::SGD(optimizer) => layer.update(self.learning_rate, optimizer),
        }
    }
}

/// Loss config.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name")]
pub enum LossConfig {
    /// [`GeneratorLoss`].
    Generator(GeneratorLoss),
    /// [`DiscriminatorLoss`].
    Discriminator(DiscriminatorLoss),
}

impl LossConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::Generator(loss) => {
                ensure_non_negative("reconstruction_weight", loss.reconstruction_weight)?;
                ensure_non_negative("adversarial_weight", loss.adversarial_weight)
            }
            Self::Discriminator(loss) => {
                ensure_non_negative("real_weight", loss.real_weight)?;
                ensure_non_negative("fake_weight", loss.fake_weight)
            }
        }
    }
    /// Builds the loss.
    pub fn build(&self) -> Box<dyn AdversarialLoss> {
        match self {
            Self::Generator(loss) => Box::new(loss.clone()),
            Self::Discriminator(loss) => Box::new(loss.clone()),
        }
    }
}

/// Trainer config.
///
/// The defaults train on MNIST padded to 32 x 32 for 10 epochs.
///
/// Can be loaded from JSON, missing fields take their defaults:
///```
/// # use aae::aae::config::TrainerConfig;
/// let config: TrainerConfig = serde_json::from_str(r#"{
///     "epochs": 20,
///     "generator": { "encoding_dims": 64 },
///     "discriminator": { "input_dims": 64 },
///     "generator_optimizer": { "name": "Adam", "learning_rate": 1e-3 }
/// }"#).unwrap();
/// assert_eq!(config.epochs, 20);
/// assert_eq!(config.batch_size, 64);
/// config.validate().unwrap();
///```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    /// The generator.
    pub generator: GeneratorConfig,
    /// The discriminator.
    pub discriminator: DiscriminatorConfig,
    /// The generator optimizer.
    pub generator_optimizer: OptimizerConfig,
    /// The discriminator optimizer.
    pub discriminator_optimizer: OptimizerConfig,
    /// The losses, run in order on each batch.
    pub losses: Vec<LossConfig>,
    /// The number of epochs to train for.
    pub epochs: usize,
    /// The number of images per batch.
    pub batch_size: usize,
    /// The number of fixed noise samples rendered after each epoch.
    pub sample_size: usize,
    /// Checkpoints are written here.
    pub checkpoint_dir: PathBuf,
    /// The number of checkpoints to keep.
    pub retain_checkpoints: usize,
    /// Sample images are written here.
    pub image_dir: PathBuf,
    /// Seeds the initialization, shuffling and noise. If None, seeds from entropy.
    pub seed: Option<u64>,
    /// Drops the last batch of an epoch if it is smaller than `batch_size`.
    pub drop_last: bool,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            generator: GeneratorConfig::default(),
            discriminator: DiscriminatorConfig::default(),
            generator_optimizer: OptimizerConfig::default(),
            discriminator_optimizer: OptimizerConfig::default(),
            losses: vec![
                LossConfig::Generator(GeneratorLoss::default()),
                LossConfig::Discriminator(DiscriminatorLoss::default()),
            ],
            epochs: 10,
            batch_size: 64,
            sample_size: 64,
            checkpoint_dir: PathBuf::from("model"),
            retain_checkpoints: 5,
            image_dir: PathBuf::from("images"),
            seed: None,
            drop_last: false,
        }
    }
}

impl TrainerConfig {
    /// Loads a JSON config from `path`.
    ///
    /// **Errors**
    /// - The file could not be opened.
    /// - The file is not a valid config.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("Unable to open config {path:?}!"))?;
        let config = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Unable to parse config {path:?}!"))?;
        Ok(config)
    }
    /// Validates the config.
    ///
    /// **Errors**
    /// - The generator `input_size / 2` is not a power of 4.
    /// - The discriminator `input_dims` does not equal the generator `encoding_dims`.
    /// - A size is 0.
    /// - A learning rate or weight is negative or not finite.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.generator.validate()?;
        self.discriminator.validate()?;
        if self.discriminator.input_dims != self.generator.encoding_dims {
            return Err(ConfigError::EncodingDims {
                input_dims: self.discriminator.input_dims,
                encoding_dims: self.generator.encoding_dims,
            });
        }
        self.generator_optimizer.build()?;
        self.discriminator_optimizer.build()?;
        ensure_nonzero("losses", self.losses.len())?;
        for loss in self.losses.iter() {
            loss.validate()?;
        }
        ensure_nonzero("batch_size", self.batch_size)?;
        ensure_nonzero("sample_size", self.sample_size)?;
        ensure_nonzero("retain_checkpoints", self.retain_checkpoints)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = TrainerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.generator_optimizer.learning_rate(), 2e-4);
        assert!(matches!(
            config.discriminator_optimizer,
            OptimizerConfig::Adam { betas, .. } if betas == [0.5, 0.999]
        ));
    }

    #[test]
    fn input_size() {
        for input_size in [2, 8, 32, 128] {
            let config = GeneratorConfig {
                input_size,
                ..GeneratorConfig::default()
            };
            assert_eq!(config.validate(), Ok(()), "{input_size}");
        }
        for input_size in [0, 1, 4, 16, 28, 33, 64] {
            let config = GeneratorConfig {
                input_size,
                ..GeneratorConfig::default()
            };
            assert_eq!(
                config.validate(),
                Err(ConfigError::InputSize { input_size }),
                "{input_size}"
            );
        }
    }

    #[test]
    fn encoding_dims_must_match() {
        let mut config = TrainerConfig::default();
        config.discriminator.input_dims = 64;
        assert_eq!(
            config.validate(),
            Err(ConfigError::EncodingDims {
                input_dims: 64,
                encoding_dims: 128
            })
        );
    }

    #[test]
    fn invalid_values() {
        let mut config = TrainerConfig {
            batch_size: 0,
            ..TrainerConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero { name: "batch_size" })
        );
        config.batch_size = 1;
        config.generator_optimizer = OptimizerConfig::Adam {
            learning_rate: 1e-3,
            betas: [0.9, 1.],
            eps: 1e-8,
            weight_decay: 0.,
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Beta { name: "beta2", .. })
        ));
        config.generator_optimizer = OptimizerConfig::SGD {
            learning_rate: -1.,
            momentum: None,
        };
        assert!(matches!(config.validate(), Err(ConfigError::Float { .. })));
        config.generator_optimizer = OptimizerConfig::default();
        config.losses = vec![LossConfig::Generator(GeneratorLoss {
            reconstruction_weight: f32::NAN,
            adversarial_weight: 0.,
        })];
        assert!(matches!(config.validate(), Err(ConfigError::Float { .. })));
        config.losses.clear();
        assert_eq!(config.validate(), Err(ConfigError::Zero { name: "losses" }));
    }

    #[test]
    fn from_path() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.json");
        let config = TrainerConfig {
            epochs: 3,
            seed: Some(7),
            ..TrainerConfig::default()
        };
        std::fs::write(&path, serde_json::to_string_pretty(&config)?)?;
        assert_eq!(TrainerConfig::from_path(&path)?, config);
        std::fs::write(&path, r#"{ "losses": [{ "name": "Discriminator", "real_weight": 1.0 }] }"#)?;
        let config = TrainerConfig::from_path(&path)?;
        assert_eq!(
            config.losses,
            [LossConfig::Discriminator(DiscriminatorLoss {
                real_weight: 1.,
                fake_weight: 0.5,
            })]
        );
        assert!(TrainerConfig::from_path(dir.path().join("missing.json")).is_err());
        Ok(())
    }
}
