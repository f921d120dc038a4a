/*!
The Adversarial Autoencoder.

The [`Generator`](generator::Generator) encodes images into a latent code and decodes them back.
The [`Discriminator`](discriminator::Discriminator) learns to tell codes drawn from a standard normal
prior apart from encodings. The [`GeneratorLoss`](loss::GeneratorLoss) weighs reconstruction
against fooling the discriminator, which pushes the encodings toward the prior. After training,
decoding noise from the prior generates new images.

See [`Trainer`](trainer::Trainer) for the training loop.
*/

/// Checkpoints.
pub mod checkpoint;
/// Configuration.
pub mod config;
/// Discriminator.
pub mod discriminator;
/// Generator.
pub mod generator;
/// Losses.
pub mod loss;
/// Training.
pub mod trainer;
/// Image grids.
pub mod visualize;
