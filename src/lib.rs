/*!
# aae
Adversarial Autoencoders in Rust.

An [Adversarial Autoencoder](https://arxiv.org/abs/1511.05644) is an autoencoder whose latent
code distribution is pushed toward a prior by an adversarial discriminator, instead of a
KL-divergence term.

This crate provides:
- A small host autograd and neural network toolkit built on [`ndarray`], see [`learn::neural_network`].
- The MNIST dataset, see [`dataset::mnist`] (requires feature "mnist").
- The encoder / decoder [`Generator`](aae::generator::Generator), the latent [`Discriminator`](aae::discriminator::Discriminator),
  their losses and a [`Trainer`](aae::trainer::Trainer), see [`aae`].

# Example
```no_run
# use anyhow::Result;
# fn main() -> Result<()> {
use aae::{
    aae::{config::TrainerConfig, trainer::Trainer},
    dataset::{ImageDataset, ImageTransform},
};
use ndarray::Array4;

let images = Array4::<u8>::zeros([256, 1, 28, 28]);
let dataset = ImageDataset::new(images.into_shared(), ImageTransform::default());
let mut trainer = Trainer::new(TrainerConfig::default())?;
trainer.fit(&dataset)?;
# Ok(())
# }
```
*/

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Adversarial autoencoder networks, losses and training.
pub mod aae;
/// Datasets.
pub mod dataset;
/// Errors.
pub mod error;
/// Machine learning.
pub mod learn;

/// Result.
pub mod result {
    /// Result type, see [`anyhow::Result`].
    pub type Result<T, E = anyhow::Error> = std::result::Result<T, E>;
}

#[doc(hidden)]
pub use ndarray;
