/*!
# Example
An encoder might look like this:
```
# use aae::{
#     result::Result,
#     learn::neural_network::{
#         autograd::{Variable2, Variable4},
#         layer::{BatchNorm, Block, Conv2, Dense, Forward, Layer, LeakyRelu},
#     },
# };
# use rand::Rng;
struct Encoder {
    conv: Block<Conv2>,
    dense: Dense,
}

impl Encoder {
    fn new(rng: &mut impl Rng) -> Result<Self> {
        let conv = Conv2::from_inputs_outputs_filter(1, 8, [3, 3], rng)?
            .with_strides(2)?
            .with_bias(true, rng)?;
        let conv = Block::new(conv)
            .with_norm(BatchNorm::from_features(8)?)
            .with_activation(LeakyRelu::new(0.2));
        let dense = Dense::from_inputs_outputs(8 * 3 * 3, 16, rng)?.with_bias(true, rng)?;
        Ok(Self { conv, dense })
    }
}

impl Forward<Variable4> for Encoder {
    type Output = Variable2;
    fn forward(&self, input: Variable4) -> Result<Variable2> {
        input.forward(&self.conv)?.flatten()?.forward(&self.dense)
    }
}
```
*/

/// Variables and Parameters.
pub mod autograd;
/// Autograd criteria.
pub mod criterion;
/// Layers.
pub mod layer;
/// Optimizers.
pub mod optimizer;
