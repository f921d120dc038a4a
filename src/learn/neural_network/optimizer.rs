#[cfg(doc)]
use super::autograd::Parameter;
use super::autograd::ParameterD;
use crate::error::ConfigError;
use anyhow::{bail, Result};
use ndarray::{ArcArray, IxDyn, Zip};
use serde::{Deserialize, Serialize};

/// Optimizer builders.
pub mod builder {
    use super::*;

    /// Builder for creating a [`SGD`].
    pub struct SGDBuilder {
        momentum: Option<f32>,
    }

    impl SGDBuilder {
        pub(super) fn new() -> Self {
            Self { momentum: None }
        }
        /// Momentum. Default is 0.
        ///
        /// If `momentum` is greater than 0, a "velocity" tensor will
        /// be added to the [`State`] of each [`Parameter`].
        pub fn momentum(self, momentum: f32) -> Self {
            Self {
                momentum: Some(momentum),
            }
        }
        /// Builds the optimizer.
        pub fn build(self) -> SGD {
            let Self { momentum } = self;
            SGD { momentum }
        }
    }

    /// Builder for creating an [`Adam`].
    pub struct AdamBuilder {
        betas: [f32; 2],
        eps: f32,
        weight_decay: f32,
    }

    impl AdamBuilder {
        pub(super) fn new() -> Self {
            Self {
                betas: [0.9, 0.999],
                eps: 1e-8,
                weight_decay: 0.,
            }
        }
        /// Coefficients for the running averages of the gradient and its square. Default is
        /// [0.9, 0.999].
        pub fn betas(self, betas: [f32; 2]) -> Self {
            Self { betas, ..self }
        }
        /// Added to the denominator. Default is 1e-8.
        pub fn eps(self, eps: f32) -> Self {
            Self { eps, ..self }
        }
        /// L2 penalty. Default is 0.
        pub fn weight_decay(self, weight_decay: f32) -> Self {
            Self {
                weight_decay,
                ..self
            }
        }
        /// Builds the optimizer.
        ///
        /// **Errors**
        /// - The betas are not in [0, 1).
        /// - `eps` or `weight_decay` are negative or not finite.
        pub fn build(self) -> Result<Adam, ConfigError> {
            let Self {
                betas,
                eps,
                weight_decay,
            } = self;
            for (name, beta) in ["beta1", "beta2"].into_iter().zip(betas) {
                if !(0. ..1.).contains(&beta) {
                    return Err(ConfigError::Beta { name, value: beta });
                }
            }
            crate::error::ensure_non_negative("eps", eps)?;
            crate::error::ensure_non_negative("weight_decay", weight_decay)?;
            Ok(Adam {
                betas,
                eps,
                weight_decay,
            })
        }
    }
}
use builder::*;

/// [`State`] value.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Value {
    /// A tensor.
    Tensor(ArcArray<f32, IxDyn>),
    /// An elem.
    Elem(f32),
}

/// Optimizer State.
///
/// Stores per parameter training progress.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct State {
    name: String,
    key_values: Vec<(String, Value)>,
}

impl State {
    /// Creates a new state for the optimizer `name`.
    pub fn new(name: impl Into<String>, key_values: impl IntoIterator<Item = (String, Value)>) -> Self {
        Self {
            name: name.into(),
            key_values: key_values.into_iter().collect(),
        }
    }
    /// Name of the [`Optimizer`].
    pub fn name(&self) -> &str {
        &self.name
    }
    /// The value for `key`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }
    /// Iterator over keys and values.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.key_values
            .iter()
            .map(|(key, value)| (key.as_str(), value))
    }
    /// Iterator over keys and mutable values.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut Value)> {
        self.key_values
            .iter_mut()
            .map(|(key, value)| (key.as_str(), value))
    }
    fn tensors_match(&self, shape: &[usize]) -> bool {
        self.iter().all(|(_, value)| match value {
            Value::Tensor(tensor) => tensor.shape() == shape,
            Value::Elem(_) => true,
        })
    }
}

/// Optimizer.
pub trait Optimizer {
    /// Performs the optimization, updating the parameter with `learning_rate`.
    ///
    /// Parameters without a gradient are skipped.
    fn update(&self, learning_rate: f32, parameter: &mut ParameterD) -> Result<()>;
}

/// Stochastic Gradient Descent.
#[derive(Default, Clone, Debug, Serialize, Deserialize)]
pub struct SGD {
    momentum: Option<f32>,
}

impl SGD {
    /// An SGD builder.
    pub fn builder() -> SGDBuilder {
        SGDBuilder::new()
    }
    fn init_state(&self, parameter: &mut ParameterD) {
        if let Some(state) = parameter.optimizer_state() {
            if state.name() == "SGD"
                && self.momentum.is_some() == state.get("velocity").is_some()
                && state.tensors_match(parameter.shape())
            {
                return;
            }
        }
        let mut key_values = Vec::new();
        if self.momentum.is_some() {
            let velocity = ArcArray::zeros(parameter.raw_dim());
            key_values.push(("velocity".to_string(), Value::Tensor(velocity)));
        }
        parameter
            .value_optimizer_state_mut()
            .1
            .replace(State::new("SGD", key_values));
    }
}

impl Optimizer for SGD {
    fn update(&self, learning_rate: f32, parameter: &mut ParameterD) -> Result<()> {
        let grad = if let Some(grad) = parameter.grad() {
            grad
        } else {
            return Ok(());
        };
        self.init_state(parameter);
        let (value, state) = parameter.value_optimizer_state_mut();
        if let Some(momentum) = self.momentum {
            let velocity = state
                .as_mut()
                .and_then(|state| state.iter_mut().next())
                .map(|(_, velocity)| velocity);
            let velocity = if let Some(Value::Tensor(velocity)) = velocity {
                velocity
            } else {
                bail!("SGD expected velocity!");
            };
            Zip::from(value)
                .and(&grad)
                .and(velocity)
                .for_each(|w, dw, v| sgd_update_with_momentum(w, *dw, learning_rate, momentum, v));
        } else {
            value.scaled_add(-learning_rate, &grad);
        }
        Ok(())
    }
}

fn sgd_update_with_momentum(w: &mut f32, dw: f32, lr: f32, m: f32, v: &mut f32) {
    *v = m * *v + dw;
    *w -= lr * *v;
}

/// Adam.
///
/// See [Adam: A Method for Stochastic Optimization](https://arxiv.org/abs/1412.6980).
///
/// Adds "step", "exp_avg" and "exp_avg_sq" to the [`State`] of each [`Parameter`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Adam {
    betas: [f32; 2],
    eps: f32,
    weight_decay: f32,
}

impl Default for Adam {
    fn default() -> Self {
        Self {
            betas: [0.9, 0.999],
            eps: 1e-8,
            weight_decay: 0.,
        }
    }
}

impl Adam {
    /// An Adam builder.
    pub fn builder() -> AdamBuilder {
        AdamBuilder::new()
    }
    /// The betas.
    pub fn betas(&self) -> [f32; 2] {
        self.betas
    }
    fn init_state(&self, parameter: &mut ParameterD) {
        if let Some(state) = parameter.optimizer_state() {
            if state.name() == "Adam" && state.tensors_match(parameter.shape()) {
                return;
            }
        }
        let zeros = ArcArray::zeros(parameter.raw_dim());
        parameter.value_optimizer_state_mut().1.replace(State::new(
            "Adam",
            [
                ("step".to_string(), Value::Elem(0.)),
                ("exp_avg".to_string(), Value::Tensor(zeros.clone())),
                ("exp_avg_sq".to_string(), Value::Tensor(zeros)),
            ],
        ));
    }
}

impl Optimizer for Adam {
    fn update(&self, learning_rate: f32, parameter: &mut ParameterD) -> Result<()> {
        let grad = if let Some(grad) = parameter.grad() {
            grad
        } else {
            return Ok(());
        };
        self.init_state(parameter);
        let (value, state) = parameter.value_optimizer_state_mut();
        let mut step = None;
        let mut exp_avg = None;
        let mut exp_avg_sq = None;
        for (key, state_value) in state.iter_mut().flat_map(State::iter_mut) {
            match (key, state_value) {
                ("step", Value::Elem(x)) => step = Some(x),
                ("exp_avg", Value::Tensor(x)) => exp_avg = Some(x),
                ("exp_avg_sq", Value::Tensor(x)) => exp_avg_sq = Some(x),
                _ => (),
            }
        }
        let (step, exp_avg, exp_avg_sq) = match (step, exp_avg, exp_avg_sq) {
            (Some(step), Some(exp_avg), Some(exp_avg_sq)) => (step, exp_avg, exp_avg_sq),
            _ => bail!("Adam state is invalid!"),
        };
        *step += 1.;
        let [beta1, beta2] = self.betas;
        let bias_correction1 = 1. - beta1.powf(*step);
        let bias_correction2_sqrt = (1. - beta2.powf(*step)).sqrt();
        let step_size = learning_rate / bias_correction1;
        let eps = self.eps;
        let weight_decay = self.weight_decay;
        Zip::from(value)
            .and(&grad)
            .and(exp_avg)
            .and(exp_avg_sq)
            .for_each(|w, dw, m, v| {
                let dw = dw + weight_decay * *w;
                *m = beta1 * *m + (1. - beta1) * dw;
                *v = beta2 * *v + (1. - beta2) * dw * dw;
                let denom = v.sqrt() / bias_correction2_sqrt + eps;
                *w -= step_size * *m / denom;
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{arr1, ArcArray1, Array1};

    fn parameter_with_grad(value: Array1<f32>, grad: Array1<f32>) -> Result<ParameterD> {
        use crate::learn::neural_network::autograd::{Parameter, Variable};
        let mut parameter = Parameter::from(value).into_dyn();
        parameter.set_training(true);
        let x = parameter.to_variable().into_dimensionality()?;
        let mut builder = Variable::builder();
        if let Some(node) = x.node() {
            builder.edge(node, move |_: ArcArray<f32, ndarray::Ix0>| {
                Ok(grad.into_shared())
            });
        }
        let _: ArcArray1<f32> = x.into_value();
        builder
            .build(ArcArray::from_elem((), 0.))
            .backward()?;
        Ok(parameter)
    }

    #[test]
    fn sgd() -> Result<()> {
        let mut parameter = parameter_with_grad(arr1(&[1., 2.]), arr1(&[0.5, -1.]))?;
        SGD::default().update(0.1, &mut parameter)?;
        assert_relative_eq!(parameter.value()[[0]], 0.95);
        assert_relative_eq!(parameter.value()[[1]], 2.1);
        Ok(())
    }

    #[test]
    fn sgd_momentum() -> Result<()> {
        let mut parameter = parameter_with_grad(arr1(&[1.]), arr1(&[1.]))?;
        let sgd = SGD::builder().momentum(0.5).build();
        sgd.update(0.1, &mut parameter)?;
        sgd.update(0.1, &mut parameter)?;
        // v = 1, then v = 1.5
        assert_relative_eq!(parameter.value()[[0]], 1. - 0.1 - 0.15);
        assert_eq!(parameter.optimizer_state().unwrap().name(), "SGD");
        Ok(())
    }

    #[test]
    fn adam_first_step_is_sign_of_grad() -> Result<()> {
        let mut parameter = parameter_with_grad(arr1(&[1., 1., 1.]), arr1(&[3., -0.25, 10.]))?;
        let adam = Adam::builder().betas([0.5, 0.999]).build()?;
        adam.update(2e-4, &mut parameter)?;
        assert_relative_eq!(parameter.value()[[0]], 1. - 2e-4, epsilon = 1e-6);
        assert_relative_eq!(parameter.value()[[1]], 1. + 2e-4, epsilon = 1e-6);
        assert_relative_eq!(parameter.value()[[2]], 1. - 2e-4, epsilon = 1e-6);
        let state = parameter.optimizer_state().unwrap();
        assert!(matches!(state.get("step"), Some(Value::Elem(x)) if *x == 1.));
        Ok(())
    }

    #[test]
    fn skips_parameters_without_grad() -> Result<()> {
        let mut parameter = ParameterD::from(arr1(&[1f32]).into_dyn());
        Adam::default().update(0.1, &mut parameter)?;
        assert_eq!(parameter.value()[[0]], 1.);
        assert!(parameter.optimizer_state().is_none());
        Ok(())
    }

    #[test]
    fn adam_builder_validates_betas() {
        assert_eq!(
            Adam::builder().betas([1., 0.999]).build().unwrap_err(),
            ConfigError::Beta {
                name: "beta1",
                value: 1.
            }
        );
    }
}
