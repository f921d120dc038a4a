use super::config::DiscriminatorConfig;
use crate::{
    learn::neural_network::{
        autograd::{ParameterD, Variable2},
        layer::{BatchNorm, Block, Dense, Forward, Layer, LeakyRelu},
    },
    result::Result,
};
use anyhow::ensure;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Classifies latent codes as drawn from the prior or produced by the encoder.
///
/// - Dense: `input_dims` -> `input_dims / 2`, LeakyRelu.
/// - While the size is greater than 16: Dense halving the size, BatchNorm, LeakyRelu.
/// - Dense: size -> 1.
///
/// Outputs logits [n, 1]. Positive means "prior".
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Discriminator {
    config: DiscriminatorConfig,
    hidden: Vec<Block<Dense>>,
    output: Dense,
}

impl Discriminator {
    /// Creates a new discriminator with `config`, initializing parameters with `rng`.
    ///
    /// **Errors**
    ///
    /// The config is invalid, see [`DiscriminatorConfig::validate()`].
    pub fn new(config: &DiscriminatorConfig, rng: &mut impl Rng) -> Result<Self> {
        config.validate()?;
        let input_dims = config.input_dims;
        let activation = LeakyRelu::new(config.negative_slope);
        let mut size = input_dims / 2;
        let dense = Dense::from_inputs_outputs(input_dims, size, rng)?.with_bias(true, rng)?;
        let mut hidden = vec![Block::new(dense).with_activation(activation)];
        while size > 16 {
            let dense = Dense::from_inputs_outputs(size, size / 2, rng)?.with_bias(true, rng)?;
            hidden.push(
                Block::new(dense)
                    .with_norm(BatchNorm::from_features(size / 2)?)
                    .with_activation(activation),
            );
            size /= 2;
        }
        let output = Dense::from_inputs_outputs(size, 1, rng)?.with_bias(true, rng)?;
        Ok(Self {
            config: config.clone(),
            hidden,
            output,
        })
    }
    /// The config.
    pub fn config(&self) -> &DiscriminatorConfig {
        &self.config
    }
}

impl Layer for Discriminator {
    fn parameters_len(&self) -> usize {
        self.hidden.iter().map(Layer::parameters_len).sum::<usize>() + self.output.parameters_len()
    }
    fn collect_parameters(&self, parameters: &mut Vec<ParameterD>) {
        for block in self.hidden.iter() {
            block.collect_parameters(parameters);
        }
        self.output.collect_parameters(parameters);
    }
    fn collect_parameters_mut<'a>(&'a mut self, parameters: &mut Vec<&'a mut ParameterD>) {
        for block in self.hidden.iter_mut() {
            block.collect_parameters_mut(parameters);
        }
        self.output.collect_parameters_mut(parameters);
    }
    fn set_training(&mut self, training: bool) -> Result<()> {
        for block in self.hidden.iter_mut() {
            block.set_training(training)?;
        }
        self.output.set_training(training)
    }
}

impl Forward<Variable2> for Discriminator {
    type Output = Variable2;
    fn forward(&self, input: Variable2) -> Result<Variable2> {
        let input_dims = self.config.input_dims;
        ensure!(
            input.dim().1 == input_dims,
            "Discriminator expected [_, {input_dims}], found {:?}!",
            input.shape()
        );
        let mut x = input;
        for block in self.hidden.iter() {
            x = x.forward(block)?;
        }
        x.forward(&self.output)
    }
}
