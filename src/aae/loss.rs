use super::{config::NetworkOptimizer, discriminator::Discriminator, generator::Generator};
use crate::{
    learn::{
        criterion::{BCEWithLogitsLoss, Criterion, MSELoss},
        neural_network::{
            autograd::{Variable, Variable0, Variable2, Variable4},
            layer::{Forward, Layer},
        },
    },
    result::Result,
};
use ndarray::{ArcArray, Array, Ix4};
use rand::{rngs::StdRng, Rng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// The networks and optimizers borrowed by a training step.
pub struct TrainContext<'a> {
    /// The generator.
    pub generator: &'a mut Generator,
    /// The discriminator.
    pub discriminator: &'a mut Discriminator,
    /// Updates the generator.
    pub generator_optimizer: &'a NetworkOptimizer,
    /// Updates the discriminator.
    pub discriminator_optimizer: &'a NetworkOptimizer,
    /// Draws the prior samples.
    pub rng: &'a mut StdRng,
}

/// A loss that trains one of the networks.
pub trait AdversarialLoss: Debug + Send + Sync {
    /// The name, used as the key in the stats.
    fn name(&self) -> &'static str;
    /// Runs one optimization step on a batch of `real` images.
    ///
    /// Returns the loss.
    fn train_ops(&self, context: &mut TrainContext<'_>, real: &ArcArray<f32, Ix4>) -> Result<f32>;
}

/// Loss of the generator.
///
/// reconstruction_weight * mse(reconstruction, real) + adversarial_weight * bce_with_logits(D(encoding), 1)
///
/// The reconstruction term dominates, the adversarial term shapes the encodings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorLoss {
    /// Weight of the reconstruction error.
    pub reconstruction_weight: f32,
    /// Weight of fooling the discriminator.
    pub adversarial_weight: f32,
}

impl Default for GeneratorLoss {
    fn default() -> Self {
        Self {
            reconstruction_weight: 0.999,
            adversarial_weight: 0.001,
        }
    }
}

impl GeneratorLoss {
    /// Computes the loss from the `real` images, their `reconstruction` and the discriminator
    /// logits of their encodings.
    pub fn forward(
        &self,
        real: ArcArray<f32, Ix4>,
        reconstruction: Variable4,
        dgz: Variable2,
    ) -> Result<Variable0> {
        let reconstruction = MSELoss
            .eval(reconstruction, real)?
            .scaled(self.reconstruction_weight);
        let ones = ArcArray::ones(dgz.raw_dim());
        let adversarial = BCEWithLogitsLoss
            .eval(dgz, ones)?
            .scaled(self.adversarial_weight);
        reconstruction.add(adversarial)
    }
}

impl AdversarialLoss for GeneratorLoss {
    fn name(&self) -> &'static str {
        "generator_loss"
    }
    /// Encodes and decodes `real`, then updates only the generator.
    ///
    /// The discriminator accumulates gradients that are cleared before its own step.
    fn train_ops(&self, context: &mut TrainContext<'_>, real: &ArcArray<f32, Ix4>) -> Result<f32> {
        let (reconstruction, encoding) = context.generator.forward(Variable::from(real.clone()))?;
        let dgz = context.discriminator.forward(encoding)?;
        context.generator.zero_grad();
        let loss = self.forward(real.clone(), reconstruction, dgz)?;
        loss.backward()?;
        context.generator_optimizer.step(&mut *context.generator)?;
        Ok(loss.item())
    }
}

/// Loss of the discriminator.
///
/// real_weight * bce_with_logits(D(noise), 1) + fake_weight * bce_with_logits(D(encoding), 0)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscriminatorLoss {
    /// Weight of classifying prior samples as real.
    pub real_weight: f32,
    /// Weight of classifying encodings as fake.
    pub fake_weight: f32,
}

impl Default for DiscriminatorLoss {
    fn default() -> Self {
        Self {
            real_weight: 0.5,
            fake_weight: 0.5,
        }
    }
}

impl DiscriminatorLoss {
    /// Computes the loss from the logits of the prior samples `dx` and of the encodings `dgz`.
    pub fn forward(&self, dx: Variable2, dgz: Variable2) -> Result<Variable0> {
        let ones = ArcArray::ones(dx.raw_dim());
        let real = BCEWithLogitsLoss.eval(dx, ones)?.scaled(self.real_weight);
        let zeros = ArcArray::zeros(dgz.raw_dim());
        let fake = BCEWithLogitsLoss.eval(dgz, zeros)?.scaled(self.fake_weight);
        real.add(fake)
    }
}

impl AdversarialLoss for DiscriminatorLoss {
    fn name(&self) -> &'static str {
        "discriminator_loss"
    }
    /// Compares noise from a standard normal with the encodings of `real`, then updates only
    /// the discriminator.
    ///
    /// The encodings are detached, the generator is not modified.
    fn train_ops(&self, context: &mut TrainContext<'_>, real: &ArcArray<f32, Ix4>) -> Result<f32> {
        let encoding = context
            .generator
            .encode(Variable::from(real.clone()))?
            .detach();
        let batch_size = real.dim().0;
        let encoding_dims = context.generator.encoding_dims();
        let rng = &mut *context.rng;
        let noise = Array::from_shape_simple_fn([batch_size, encoding_dims], || {
            rng.sample::<f32, _>(StandardNormal)
        });
        context.discriminator.zero_grad();
        let dx = context.discriminator.forward(Variable::from(noise))?;
        let dgz = context.discriminator.forward(encoding)?;
        let loss = self.forward(dx, dgz)?;
        loss.backward()?;
        context
            .discriminator_optimizer
            .step(&mut *context.discriminator)?;
        Ok(loss.item())
    }
}
