use super::config::GeneratorConfig;
use crate::{
    learn::neural_network::{
        autograd::{ParameterD, Variable, Variable2, Variable4},
        layer::{BatchNorm, Block, Conv2, ConvTranspose2, Dense, Forward, Layer, LeakyRelu},
    },
    result::Result,
};
use anyhow::ensure;
use ndarray::{Array4, ArrayView2};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// The encoder / decoder.
///
/// # Encoder
/// - Conv2 5x5, stride 2, padding 2: `input_channels` -> `step_channels`, LeakyRelu.
/// - While the size is greater than 1: Conv2 5x5, stride 4, padding 2 multiplying the channels
///   by 4, BatchNorm, LeakyRelu.
/// - Dense: channels -> `encoding_dims`.
///
/// # Decoder
/// - Dense: `encoding_dims` -> `step_channels`, reshaped to [n, `step_channels`, 1, 1].
/// - While the size is less than `input_size / 2`: ConvTranspose2 5x5, stride 4, padding 2,
///   output padding 3 multiplying the channels by 4, BatchNorm, LeakyRelu.
/// - ConvTranspose2 5x5, stride 2, padding 2, output padding 1: channels -> `input_channels`.
///
/// The decoder has no output activation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Generator {
    config: GeneratorConfig,
    encoder: Vec<Block<Conv2>>,
    encoder_fc: Dense,
    decoder_fc: Dense,
    decoder: Vec<Block<ConvTranspose2>>,
}

impl Generator {
    /// Creates a new generator with `config`, initializing parameters with `rng`.
    ///
    /// **Errors**
    ///
    /// The config is invalid, see [`GeneratorConfig::validate()`].
    pub fn new(config: &GeneratorConfig, rng: &mut impl Rng) -> Result<Self> {
        config.validate()?;
        let GeneratorConfig {
            encoding_dims,
            input_size,
            input_channels,
            step_channels,
            negative_slope,
        } = *config;
        let activation = LeakyRelu::new(negative_slope);
        let conv = Conv2::from_inputs_outputs_filter(input_channels, step_channels, [5, 5], rng)?
            .with_strides(2)?
            .with_padding(2)?
            .with_bias(true, rng)?;
        let mut encoder = vec![Block::new(conv).with_activation(activation)];
        let mut size = input_size / 2;
        let mut channels = step_channels;
        while size > 1 {
            let conv = Conv2::from_inputs_outputs_filter(channels, channels * 4, [5, 5], rng)?
                .with_strides(4)?
                .with_padding(2)?
                .with_bias(true, rng)?;
            encoder.push(
                Block::new(conv)
                    .with_norm(BatchNorm::from_features(channels * 4)?)
                    .with_activation(activation),
            );
            channels *= 4;
            size /= 4;
        }
        let encoder_fc = Dense::from_inputs_outputs(channels, encoding_dims, rng)?.with_bias(true, rng)?;
        let decoder_fc =
            Dense::from_inputs_outputs(encoding_dims, step_channels, rng)?.with_bias(true, rng)?;
        let mut decoder = Vec::new();
        let mut size = 1;
        let mut channels = step_channels;
        while size < input_size / 2 {
            let conv =
                ConvTranspose2::from_inputs_outputs_filter(channels, channels * 4, [5, 5], rng)?
                    .with_strides(4)?
                    .with_padding(2)?
                    .with_output_padding(3)?
                    .with_bias(true, rng)?;
            decoder.push(
                Block::new(conv)
                    .with_norm(BatchNorm::from_features(channels * 4)?)
                    .with_activation(activation),
            );
            channels *= 4;
            size *= 4;
        }
        let conv = ConvTranspose2::from_inputs_outputs_filter(channels, input_channels, [5, 5], rng)?
            .with_strides(2)?
            .with_padding(2)?
            .with_output_padding(1)?
            .with_bias(true, rng)?;
        decoder.push(Block::new(conv));
        Ok(Self {
            config: config.clone(),
            encoder,
            encoder_fc,
            decoder_fc,
            decoder,
        })
    }
    /// The config.
    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }
    /// The size of the latent code.
    pub fn encoding_dims(&self) -> usize {
        self.config.encoding_dims
    }
    /// Encodes images [n, `input_channels`, `input_size`, `input_size`] into [n, `encoding_dims`].
    pub fn encode(&self, input: Variable4) -> Result<Variable2> {
        let (_, channels, height, width) = input.dim();
        let GeneratorConfig {
            input_size,
            input_channels,
            ..
        } = self.config;
        ensure!(
            channels == input_channels && height == input_size && width == input_size,
            "Generator expected images [_, {input_channels}, {input_size}, {input_size}], found {:?}!",
            input.shape()
        );
        let mut x = input;
        for block in self.encoder.iter() {
            x = x.forward(block)?;
        }
        x.flatten()?.forward(&self.encoder_fc)
    }
    /// Decodes codes [n, `encoding_dims`] into images [n, `input_channels`, `input_size`, `input_size`].
    pub fn decode(&self, encoding: Variable2) -> Result<Variable4> {
        let (batch_size, encoding_dims) = encoding.dim();
        ensure!(
            encoding_dims == self.config.encoding_dims,
            "Generator expected encoding [_, {}], found {:?}!",
            self.config.encoding_dims,
            encoding.shape()
        );
        let x = encoding.forward(&self.decoder_fc)?;
        let channels = x.dim().1;
        let mut x = x.into_shape([batch_size, channels, 1, 1])?;
        for block in self.decoder.iter() {
            x = x.forward(block)?;
        }
        Ok(x)
    }
    /// Decodes `noise` without tracking gradients of the input.
    ///
    /// Call [`.set_training(false)`](Layer::set_training) first to use the running statistics
    /// of the batch norms.
    pub fn sample(&self, noise: ArrayView2<f32>) -> Result<Array4<f32>> {
        let output = self.decode(Variable::from(noise.to_owned()))?;
        Ok(output.into_value().into_owned())
    }
}

impl Layer for Generator {
    fn parameters_len(&self) -> usize {
        self.encoder.iter().map(Layer::parameters_len).sum::<usize>()
            + self.encoder_fc.parameters_len()
            + self.decoder_fc.parameters_len()
            + self.decoder.iter().map(Layer::parameters_len).sum::<usize>()
    }
    fn collect_parameters(&self, parameters: &mut Vec<ParameterD>) {
        for block in self.encoder.iter() {
            block.collect_parameters(parameters);
        }
        self.encoder_fc.collect_parameters(parameters);
        self.decoder_fc.collect_parameters(parameters);
        for block in self.decoder.iter() {
            block.collect_parameters(parameters);
        }
    }
    fn collect_parameters_mut<'a>(&'a mut self, parameters: &mut Vec<&'a mut ParameterD>) {
        for block in self.encoder.iter_mut() {
            block.collect_parameters_mut(parameters);
        }
        self.encoder_fc.collect_parameters_mut(parameters);
        self.decoder_fc.collect_parameters_mut(parameters);
        for block in self.decoder.iter_mut() {
            block.collect_parameters_mut(parameters);
        }
    }
    fn set_training(&mut self, training: bool) -> Result<()> {
        for block in self.encoder.iter_mut() {
            block.set_training(training)?;
        }
        self.encoder_fc.set_training(training)?;
        self.decoder_fc.set_training(training)?;
        for block in self.decoder.iter_mut() {
            block.set_training(training)?;
        }
        Ok(())
    }
}

impl Forward<Variable4> for Generator {
    /// The reconstruction and the encoding.
    type Output = (Variable4, Variable2);
    fn forward(&self, input: Variable4) -> Result<Self::Output> {
        let encoding = self.encode(input)?;
        let reconstruction = self.decode(encoding.clone())?;
        Ok((reconstruction, encoding))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learn::criterion::{Criterion, MSELoss};
    use ndarray::{ArcArray, Array};
    use rand::{rngs::StdRng, SeedableRng};

    fn tiny() -> GeneratorConfig {
        GeneratorConfig {
            encoding_dims: 8,
            input_size: 8,
            input_channels: 1,
            step_channels: 2,
            negative_slope: 0.2,
        }
    }

    #[test]
    fn default_parameter_count() -> Result<()> {
        let generator = Generator::new(&GeneratorConfig::default(), &mut StdRng::seed_from_u64(0))?;
        assert_eq!(generator.encoder.len(), 3);
        assert_eq!(generator.decoder.len(), 3);
        assert_eq!(generator.parameter_count(), 914_097);
        Ok(())
    }

    #[test]
    fn forward_shapes() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(0);
        for input_size in [2, 8, 32] {
            let config = GeneratorConfig {
                input_size,
                ..tiny()
            };
            let generator = Generator::new(&config, &mut rng)?;
            let x = Array::from_elem([3, 1, input_size, input_size], 0.5f32);
            let (reconstruction, encoding) = generator.forward(Variable::from(x))?;
            assert_eq!(reconstruction.shape(), &[3, 1, input_size, input_size]);
            assert_eq!(encoding.shape(), &[3, 8]);
        }
        Ok(())
    }

    #[test]
    fn rejects_wrong_images() -> Result<()> {
        let generator = Generator::new(&tiny(), &mut StdRng::seed_from_u64(0))?;
        let x = Array::zeros([2, 1, 16, 16]);
        assert!(generator.encode(Variable::from(x)).is_err());
        let x = Array::zeros([2, 3, 8, 8]);
        assert!(generator.encode(Variable::from(x)).is_err());
        assert!(generator.sample(Array::zeros([2, 4]).view()).is_err());
        Ok(())
    }

    #[test]
    fn backward_reaches_all_parameters() -> Result<()> {
        let mut generator = Generator::new(&tiny(), &mut StdRng::seed_from_u64(1))?;
        generator.set_training(true)?;
        let x = Array::from_shape_fn([2, 1, 8, 8], |(n, _, h, w)| {
            ((n + h * 3 + w * 5) % 7) as f32 / 3. - 1.
        });
        let (reconstruction, _) = generator.forward(Variable::from(x))?;
        let loss = MSELoss.eval(reconstruction, ArcArray::zeros([2, 1, 8, 8]))?;
        loss.backward()?;
        for parameter in generator.parameters() {
            assert!(parameter.grad().is_some(), "{parameter:?}");
        }
        generator.zero_grad();
        assert!(generator.parameters().iter().all(|p| p.grad().is_none()));
        Ok(())
    }

    #[test]
    fn sample_in_eval_mode() -> Result<()> {
        let mut generator = Generator::new(&tiny(), &mut StdRng::seed_from_u64(2))?;
        generator.set_training(false)?;
        let images = generator.sample(Array::zeros([1, 8]).view())?;
        assert_eq!(images.shape(), &[1, 1, 8, 8]);
        assert!(images.iter().all(|x| x.is_finite()));
        Ok(())
    }

    #[test]
    fn serde() -> Result<()> {
        let mut generator = Generator::new(&tiny(), &mut StdRng::seed_from_u64(3))?;
        generator.set_training(false)?;
        let json = serde_json::to_string(&generator)?;
        let loaded: Generator = serde_json::from_str(&json)?;
        assert_eq!(loaded.config(), generator.config());
        let noise = Array::from_shape_fn([2, 8], |(i, j)| (i + j) as f32 / 8.);
        assert_eq!(
            loaded.sample(noise.view())?,
            generator.sample(noise.view())?
        );
        Ok(())
    }
}
