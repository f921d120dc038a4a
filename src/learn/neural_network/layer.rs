use super::{
    autograd::{into_standard_layout, Parameter, ParameterD, Variable, Variable2, Variable4},
    optimizer::Optimizer,
};
use crate::result::Result;
use anyhow::{bail, ensure};
use ndarray::{ArcArray, Array, Array1, Axis, Dimension, Ix1, Ix2, Ix4};
use parking_lot::RwLock;
use rand::{
    distributions::{Distribution, Uniform},
    Rng,
};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};

mod conv;
use conv::Geometry;

/// A trait for networks and layers.
///
/// [`Layer`] provides reflection and utility methods.
///
/// # Clone
/// Implement [`Clone`] (typically this can be derived) to make it easier to share the layer (potentially between threads).
///
/// # serde
/// Implement [`Serialize`](serde::Serialize) and [`Deserialize`](serde::Deserialize) for saving and loading the layer. This can generally be [derived](<https://serde.rs/derive.html>).
pub trait Layer: Send + Sync + 'static {
    /// The number of parameters.
    ///
    /// This is the length of [`.parameters()`](Self::parameters()).
    fn parameters_len(&self) -> usize {
        0
    }
    #[doc(hidden)]
    #[allow(unused)]
    fn collect_parameters(&self, parameters: &mut Vec<ParameterD>) {}
    /// Enumerates the parameters of the layer, including child layers.
    fn parameters(&self) -> Vec<ParameterD> {
        let mut parameters = Vec::with_capacity(self.parameters_len());
        self.collect_parameters(&mut parameters);
        parameters
    }
    #[doc(hidden)]
    #[allow(unused)]
    fn collect_parameters_mut<'a>(&'a mut self, parameters: &mut Vec<&'a mut ParameterD>) {}
    /// Enumerates mutable references to the parameters of the layer, including child layers.
    fn parameters_mut(&mut self) -> Vec<&mut ParameterD> {
        let mut parameters = Vec::with_capacity(self.parameters_len());
        self.collect_parameters_mut(&mut parameters);
        parameters
    }
    /// The total number of elements of all parameters.
    fn parameter_count(&self) -> usize {
        self.parameters().iter().map(Parameter::len).sum()
    }
    /// Enables / disables training.
    ///
    /// See [`Parameter::set_training()`].
    fn set_training(&mut self, training: bool) -> Result<()> {
        for parameter in self.parameters_mut() {
            parameter.set_training(training);
        }
        Ok(())
    }
    /// Clears the gradients of the parameters.
    fn zero_grad(&mut self) {
        for parameter in self.parameters_mut() {
            parameter.zero_grad();
        }
    }
    /// Updates the layer with the optimizer.
    ///
    /// Call this method on the network after one or more backward passes.
    fn update<O: Optimizer>(&mut self, learning_rate: f32, optimizer: &O) -> Result<()>
    where
        Self: Sized,
    {
        for parameter in self.parameters_mut() {
            optimizer.update(learning_rate, parameter)?;
        }
        Ok(())
    }
}

/// A trait for the forward pass.
///
/// [`Layer`]'s implement [`Forward`], which computes the output as a function of the input.
pub trait Forward<X> {
    /// The output.
    type Output;
    /// Computes the forward pass.
    ///
    /// # Autograd
    /// Operations on [`Variable`] are expected to apply backward ops via [`VariableBuilder`](super::autograd::builder::VariableBuilder).
    ///
    /// **Errors**
    ///
    /// Returns an error if the operation could not be performed. Generally the implemenation should return an error instead of panicking.
    fn forward(&self, input: X) -> Result<Self::Output>;
}

/// Uniform distribution of (-a, a) where a = 1 / sqrt(fan_in).
fn fan_in_uniform(fan_in: usize) -> Uniform<f32> {
    let a = 1. / (fan_in.max(1) as f32).sqrt();
    Uniform::new_inclusive(-a, a)
}

fn sample_parameter<D: Dimension>(
    dim: D,
    fan_in: usize,
    rng: &mut impl Rng,
) -> Result<ParameterD> {
    let data = fan_in_uniform(fan_in)
        .sample_iter(rng)
        .take(dim.size())
        .collect::<Vec<_>>();
    Ok(Parameter::from(Array::from_shape_vec(dim, data)?).into_dyn())
}

fn parameter_variable<D: Dimension>(parameter: &ParameterD) -> Result<Variable<D>> {
    Ok(parameter.to_variable().into_dimensionality()?)
}

/// Dense / fully connected layer.
///
/// y = x.dot(weight.t()) + bias
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Dense {
    weight: ParameterD,
    bias: Option<ParameterD>,
}

impl Dense {
    /// Creates a new [`Dense`] for `inputs` and `outputs`.
    ///
    /// The weight is initialized with a uniform distribution of (-a, a) where a = 1 / sqrt(inputs).
    ///
    /// **Errors**
    ///
    /// `inputs` or `outputs` is 0.
    pub fn from_inputs_outputs(inputs: usize, outputs: usize, rng: &mut impl Rng) -> Result<Self> {
        ensure!(
            inputs > 0 && outputs > 0,
            "Dense inputs {inputs} and outputs {outputs} must be positive!"
        );
        let weight = sample_parameter(Ix2(outputs, inputs), inputs, rng)?;
        Ok(Self { weight, bias: None })
    }
    /// Adds a bias to the layer.
    ///
    /// The bias is initialized like the weight.
    pub fn with_bias(mut self, bias: bool, rng: &mut impl Rng) -> Result<Self> {
        if bias {
            let (outputs, inputs) = (self.weight.shape()[0], self.weight.shape()[1]);
            self.bias
                .replace(sample_parameter(Ix1(outputs), inputs, rng)?);
        } else {
            self.bias = None;
        }
        Ok(self)
    }
    /// The number of input features.
    pub fn inputs(&self) -> usize {
        self.weight.shape()[1]
    }
    /// The number of output features.
    pub fn outputs(&self) -> usize {
        self.weight.shape()[0]
    }
    /// The weight, [outputs, inputs].
    pub fn weight(&self) -> &ParameterD {
        &self.weight
    }
    /// The bias, [outputs].
    pub fn bias(&self) -> Option<&ParameterD> {
        self.bias.as_ref()
    }
}

impl Layer for Dense {
    fn parameters_len(&self) -> usize {
        1 + self.bias.is_some() as usize
    }
    fn collect_parameters(&self, parameters: &mut Vec<ParameterD>) {
        parameters.push(self.weight.clone());
        parameters.extend(self.bias.clone());
    }
    fn collect_parameters_mut<'a>(&'a mut self, parameters: &mut Vec<&'a mut ParameterD>) {
        parameters.push(&mut self.weight);
        parameters.extend(self.bias.as_mut());
    }
}

impl Forward<Variable2> for Dense {
    type Output = Variable2;
    fn forward(&self, input: Variable2) -> Result<Variable2> {
        ensure!(
            input.dim().1 == self.inputs(),
            "Dense expected {} inputs, found {:?}!",
            self.inputs(),
            input.shape()
        );
        let weight = parameter_variable::<Ix2>(&self.weight)?;
        let bias = self
            .bias
            .as_ref()
            .map(parameter_variable::<Ix1>)
            .transpose()?;
        let mut builder = Variable2::builder();
        if let Some(node) = input.node() {
            let weight = weight.value().clone();
            builder.edge(node, move |output_grad: ArcArray<f32, Ix2>| {
                Ok(output_grad.dot(&weight).into_shared())
            });
        }
        if let Some(node) = weight.node() {
            let input = input.value().clone();
            builder.edge(node, move |output_grad: ArcArray<f32, Ix2>| {
                Ok(output_grad.t().dot(&input).into_shared())
            });
        }
        let mut output = input.value().dot(&weight.value().t());
        if let Some(bias) = bias {
            if let Some(node) = bias.node() {
                builder.edge(node, |output_grad: ArcArray<f32, Ix2>| {
                    Ok(output_grad.sum_axis(Axis(0)).into_shared())
                });
            }
            output += bias.value();
        }
        Ok(builder.build(output.into_shared()))
    }
}

/// Convolutional layer.
///
/// The weight is [outputs, inputs, fh, fw].
#[derive(Clone, Serialize, Deserialize)]
pub struct Conv2 {
    weight: ParameterD,
    bias: Option<ParameterD>,
    strides: [usize; 2],
    padding: [usize; 2],
}

impl Conv2 {
    /// Creates a new [`Conv2`] for `inputs`, `outputs`, and `filter`.
    ///
    /// Defaults:
    /// - strides: 1
    /// - padding: 0
    /// - bias: None
    ///
    /// The weight is initialized with a uniform distribution of (-a, a) where a = 1 / sqrt(inputs * fh * fw).
    ///
    /// # Example
    ///```
    /// # use aae::{result::Result, learn::neural_network::layer::Conv2};
    /// # fn main() -> Result<()> {
    /// let mut rng = rand::thread_rng();
    /// let conv = Conv2::from_inputs_outputs_filter(1, 16, [5, 5], &mut rng)?
    ///     .with_strides(2)?
    ///     .with_padding(2)?
    ///     .with_bias(true, &mut rng)?;
    /// # Ok(())
    /// # }
    ///```
    pub fn from_inputs_outputs_filter(
        inputs: usize,
        outputs: usize,
        filter: [usize; 2],
        rng: &mut impl Rng,
    ) -> Result<Self> {
        ensure!(
            inputs > 0 && outputs > 0 && filter.iter().all(|x| *x > 0),
            "Conv2 inputs {inputs}, outputs {outputs} and filter {filter:?} must be positive!"
        );
        let [fh, fw] = filter;
        let fan_in = inputs * fh * fw;
        let weight = sample_parameter(Ix4(outputs, inputs, fh, fw), fan_in, rng)?;
        Ok(Self {
            weight,
            bias: None,
            strides: [1, 1],
            padding: [0, 0],
        })
    }
    /// Sets `strides`, broadcasted to both spatial dimensions.
    ///
    /// **Errors**
    ///
    /// `strides` is 0.
    pub fn with_strides(mut self, strides: usize) -> Result<Self> {
        ensure!(strides > 0, "Conv2 strides must be positive!");
        self.strides = [strides; 2];
        Ok(self)
    }
    /// Sets `padding`, broadcasted to both spatial dimensions.
    pub fn with_padding(mut self, padding: usize) -> Result<Self> {
        self.padding = [padding; 2];
        Ok(self)
    }
    /// Adds a bias to the layer.
    pub fn with_bias(mut self, bias: bool, rng: &mut impl Rng) -> Result<Self> {
        if bias {
            let outputs = self.weight.shape()[0];
            let fan_in = self.weight.len() / outputs;
            self.bias
                .replace(sample_parameter(Ix1(outputs), fan_in, rng)?);
        } else {
            self.bias = None;
        }
        Ok(self)
    }
    /// The weight.
    pub fn weight(&self) -> &ParameterD {
        &self.weight
    }
    /// The bias.
    pub fn bias(&self) -> Option<&ParameterD> {
        self.bias.as_ref()
    }
    fn filter(&self) -> [usize; 2] {
        [self.weight.shape()[2], self.weight.shape()[3]]
    }
}

impl Debug for Conv2 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct("Conv2");
        builder.field("weight", &self.weight);
        if let Some(bias) = self.bias.as_ref() {
            builder.field("bias", bias);
        }
        if self.strides.iter().any(|x| *x != 1) {
            builder.field("strides", &self.strides);
        }
        if self.padding.iter().any(|x| *x != 0) {
            builder.field("padding", &self.padding);
        }
        builder.finish()
    }
}

impl Layer for Conv2 {
    fn parameters_len(&self) -> usize {
        1 + self.bias.is_some() as usize
    }
    fn collect_parameters(&self, parameters: &mut Vec<ParameterD>) {
        parameters.push(self.weight.clone());
        parameters.extend(self.bias.clone());
    }
    fn collect_parameters_mut<'a>(&'a mut self, parameters: &mut Vec<&'a mut ParameterD>) {
        parameters.push(&mut self.weight);
        parameters.extend(self.bias.as_mut());
    }
}

impl Forward<Variable4> for Conv2 {
    type Output = Variable4;
    fn forward(&self, input: Variable4) -> Result<Variable4> {
        let (_, inputs, ih, iw) = input.dim();
        let (outputs, channels) = (self.weight.shape()[0], self.weight.shape()[1]);
        ensure!(
            inputs == channels,
            "Conv2 expected {channels} input channels, found {:?}!",
            input.shape()
        );
        let geometry = Geometry::conv(
            channels,
            [ih, iw],
            self.filter(),
            self.strides,
            self.padding,
        )?;
        let weight = parameter_variable::<Ix4>(&self.weight)?;
        let weight_dim = weight.raw_dim();
        let weight_matrix = into_standard_layout(weight.value().clone())
            .into_shape([outputs, self.weight.len() / outputs])?;
        let x = into_standard_layout(input.value().clone());
        let mut builder = Variable4::builder();
        if let Some(node) = input.node() {
            let weight_matrix = weight_matrix.clone();
            builder.edge(node, move |output_grad: ArcArray<f32, Ix4>| {
                Ok(
                    conv::conv2_backward_input(output_grad.view(), weight_matrix.view(), &geometry)?
                        .into_shared(),
                )
            });
        }
        if let Some(node) = weight.node() {
            let x = x.clone();
            builder.edge(node, move |output_grad: ArcArray<f32, Ix4>| {
                let weight_grad =
                    conv::conv2_backward_weight(x.view(), output_grad.view(), &geometry)?;
                Ok(weight_grad.into_shape(weight_dim)?.into_shared())
            });
        }
        let mut output = conv::conv2(x.view(), weight_matrix.view(), &geometry)?;
        if let Some(bias) = self.bias.as_ref() {
            add_channel_bias(&mut builder, &mut output, parameter_variable::<Ix1>(bias)?)?;
        }
        Ok(builder.build(output.into_shared()))
    }
}

/// Adds `bias` to each channel of `output` [batch_size, channels, h, w].
fn add_channel_bias(
    builder: &mut super::autograd::builder::VariableBuilder<Ix4>,
    output: &mut Array<f32, Ix4>,
    bias: Variable<Ix1>,
) -> Result<()> {
    let channels = bias.shape()[0];
    if let Some(node) = bias.node() {
        builder.edge(node, |output_grad: ArcArray<f32, Ix4>| {
            Ok(output_grad
                .sum_axis(Axis(3))
                .sum_axis(Axis(2))
                .sum_axis(Axis(0))
                .into_shared())
        });
    }
    *output += &bias.value().view().into_shape([channels, 1, 1])?;
    Ok(())
}

/// Transposed convolutional layer.
///
/// The weight is [inputs, outputs, fh, fw].
///
/// The output size is (input - 1) * strides - 2 * padding + filter + output_padding.
#[derive(Clone, Serialize, Deserialize)]
pub struct ConvTranspose2 {
    weight: ParameterD,
    bias: Option<ParameterD>,
    strides: [usize; 2],
    padding: [usize; 2],
    output_padding: [usize; 2],
}

impl ConvTranspose2 {
    /// Creates a new [`ConvTranspose2`] for `inputs`, `outputs`, and `filter`.
    ///
    /// Defaults:
    /// - strides: 1
    /// - padding: 0
    /// - output_padding: 0
    /// - bias: None
    ///
    /// The weight is initialized with a uniform distribution of (-a, a) where a = 1 / sqrt(outputs * fh * fw).
    pub fn from_inputs_outputs_filter(
        inputs: usize,
        outputs: usize,
        filter: [usize; 2],
        rng: &mut impl Rng,
    ) -> Result<Self> {
        ensure!(
            inputs > 0 && outputs > 0 && filter.iter().all(|x| *x > 0),
            "ConvTranspose2 inputs {inputs}, outputs {outputs} and filter {filter:?} must be positive!"
        );
        let [fh, fw] = filter;
        let fan_in = outputs * fh * fw;
        let weight = sample_parameter(Ix4(inputs, outputs, fh, fw), fan_in, rng)?;
        Ok(Self {
            weight,
            bias: None,
            strides: [1, 1],
            padding: [0, 0],
            output_padding: [0, 0],
        })
    }
    /// Sets `strides`, broadcasted to both spatial dimensions.
    ///
    /// **Errors**
    ///
    /// `strides` is 0.
    pub fn with_strides(mut self, strides: usize) -> Result<Self> {
        ensure!(strides > 0, "ConvTranspose2 strides must be positive!");
        self.strides = [strides; 2];
        Ok(self)
    }
    /// Sets `padding`, broadcasted to both spatial dimensions.
    pub fn with_padding(mut self, padding: usize) -> Result<Self> {
        self.padding = [padding; 2];
        Ok(self)
    }
    /// Sets `output_padding`, broadcasted to both spatial dimensions.
    ///
    /// **Errors**
    ///
    /// `output_padding` is not smaller than the strides.
    pub fn with_output_padding(mut self, output_padding: usize) -> Result<Self> {
        if self.strides.iter().any(|s| output_padding >= *s) {
            bail!(
                "ConvTranspose2 output_padding {output_padding} must be smaller than strides {:?}!",
                self.strides
            );
        }
        self.output_padding = [output_padding; 2];
        Ok(self)
    }
    /// Adds a bias to the layer.
    pub fn with_bias(mut self, bias: bool, rng: &mut impl Rng) -> Result<Self> {
        if bias {
            let outputs = self.weight.shape()[1];
            let fan_in = self.weight.len() / self.weight.shape()[0];
            self.bias
                .replace(sample_parameter(Ix1(outputs), fan_in, rng)?);
        } else {
            self.bias = None;
        }
        Ok(self)
    }
    /// The weight.
    pub fn weight(&self) -> &ParameterD {
        &self.weight
    }
    /// The bias.
    pub fn bias(&self) -> Option<&ParameterD> {
        self.bias.as_ref()
    }
    fn filter(&self) -> [usize; 2] {
        [self.weight.shape()[2], self.weight.shape()[3]]
    }
}

impl Debug for ConvTranspose2 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct("ConvTranspose2");
        builder.field("weight", &self.weight);
        if let Some(bias) = self.bias.as_ref() {
            builder.field("bias", bias);
        }
        if self.strides.iter().any(|x| *x != 1) {
            builder.field("strides", &self.strides);
        }
        if self.padding.iter().any(|x| *x != 0) {
            builder.field("padding", &self.padding);
        }
        if self.output_padding.iter().any(|x| *x != 0) {
            builder.field("output_padding", &self.output_padding);
        }
        builder.finish()
    }
}

impl Layer for ConvTranspose2 {
    fn parameters_len(&self) -> usize {
        1 + self.bias.is_some() as usize
    }
    fn collect_parameters(&self, parameters: &mut Vec<ParameterD>) {
        parameters.push(self.weight.clone());
        parameters.extend(self.bias.clone());
    }
    fn collect_parameters_mut<'a>(&'a mut self, parameters: &mut Vec<&'a mut ParameterD>) {
        parameters.push(&mut self.weight);
        parameters.extend(self.bias.as_mut());
    }
}

impl Forward<Variable4> for ConvTranspose2 {
    type Output = Variable4;
    fn forward(&self, input: Variable4) -> Result<Variable4> {
        let (_, inputs, ih, iw) = input.dim();
        let (channels, outputs) = (self.weight.shape()[0], self.weight.shape()[1]);
        ensure!(
            inputs == channels,
            "ConvTranspose2 expected {channels} input channels, found {:?}!",
            input.shape()
        );
        // The forward pass of a transposed convolution is the backward pass of a
        // convolution with the same weight, and vice versa.
        let geometry = Geometry::transpose(
            outputs,
            [ih, iw],
            self.filter(),
            self.strides,
            self.padding,
            self.output_padding,
        )?;
        let weight = parameter_variable::<Ix4>(&self.weight)?;
        let weight_dim = weight.raw_dim();
        let weight_matrix = into_standard_layout(weight.value().clone())
            .into_shape([channels, self.weight.len() / channels])?;
        let x = into_standard_layout(input.value().clone());
        let mut builder = Variable4::builder();
        if let Some(node) = input.node() {
            let weight_matrix = weight_matrix.clone();
            builder.edge(node, move |output_grad: ArcArray<f32, Ix4>| {
                let output_grad = into_standard_layout(output_grad);
                Ok(conv::conv2(output_grad.view(), weight_matrix.view(), &geometry)?.into_shared())
            });
        }
        if let Some(node) = weight.node() {
            let x = x.clone();
            builder.edge(node, move |output_grad: ArcArray<f32, Ix4>| {
                let weight_grad =
                    conv::conv2_backward_weight(output_grad.view(), x.view(), &geometry)?;
                Ok(weight_grad.into_shape(weight_dim)?.into_shared())
            });
        }
        let mut output = conv::conv2_backward_input(x.view(), weight_matrix.view(), &geometry)?;
        if let Some(bias) = self.bias.as_ref() {
            add_channel_bias(&mut builder, &mut output, parameter_variable::<Ix1>(bias)?)?;
        }
        Ok(builder.build(output.into_shared()))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct RunningStats {
    mean: Array1<f32>,
    var: Array1<f32>,
}

/// Batch Normalization.
///
/// Normalizes each channel (axis 1) of the input with the mean and (biased) variance of
/// the batch when training, and running estimates otherwise, then applies a learned scale
/// (weight) and shift (bias).
///
/// The running estimates are updated with `momentum` in each training forward pass, using
/// the unbiased variance.
#[derive(Serialize, Deserialize)]
pub struct BatchNorm {
    weight: ParameterD,
    bias: ParameterD,
    running: RwLock<RunningStats>,
    eps: f32,
    momentum: f32,
    #[serde(skip)]
    training: bool,
}

impl BatchNorm {
    /// Creates a new [`BatchNorm`] for `features` channels.
    ///
    /// Defaults:
    /// - eps: 1e-5
    /// - momentum: 0.1
    ///
    /// The weight is initialized to 1 and the bias to 0.
    pub fn from_features(features: usize) -> Result<Self> {
        ensure!(features > 0, "BatchNorm features must be positive!");
        Ok(Self {
            weight: Parameter::from(Array::ones(features)).into_dyn(),
            bias: Parameter::from(Array::zeros(features)).into_dyn(),
            running: RwLock::new(RunningStats {
                mean: Array::zeros(features),
                var: Array::ones(features),
            }),
            eps: 1e-5,
            momentum: 0.1,
            training: false,
        })
    }
    /// Sets `eps`, added to the variance.
    pub fn with_eps(mut self, eps: f32) -> Result<Self> {
        ensure!(eps.is_finite() && eps > 0., "BatchNorm eps must be positive!");
        self.eps = eps;
        Ok(self)
    }
    /// Sets `momentum`, used to update the running estimates.
    pub fn with_momentum(mut self, momentum: f32) -> Result<Self> {
        ensure!(
            (0. ..=1.).contains(&momentum),
            "BatchNorm momentum must be in [0, 1]!"
        );
        self.momentum = momentum;
        Ok(self)
    }
    /// The number of channels.
    pub fn features(&self) -> usize {
        self.weight.len()
    }
    /// Whether the batch statistics are used.
    pub fn training(&self) -> bool {
        self.training
    }
    /// The running mean.
    pub fn running_mean(&self) -> Array1<f32> {
        self.running.read().mean.clone()
    }
    /// The running variance.
    pub fn running_var(&self) -> Array1<f32> {
        self.running.read().var.clone()
    }
}

impl Clone for BatchNorm {
    fn clone(&self) -> Self {
        Self {
            weight: self.weight.clone(),
            bias: self.bias.clone(),
            running: RwLock::new(self.running.read().clone()),
            eps: self.eps,
            momentum: self.momentum,
            training: self.training,
        }
    }
}

impl Debug for BatchNorm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BatchNorm")
            .field("weight", &self.weight)
            .field("bias", &self.bias)
            .field("eps", &self.eps)
            .field("momentum", &self.momentum)
            .field("training", &self.training)
            .finish()
    }
}

impl Layer for BatchNorm {
    fn parameters_len(&self) -> usize {
        2
    }
    fn collect_parameters(&self, parameters: &mut Vec<ParameterD>) {
        parameters.push(self.weight.clone());
        parameters.push(self.bias.clone());
    }
    fn collect_parameters_mut<'a>(&'a mut self, parameters: &mut Vec<&'a mut ParameterD>) {
        parameters.push(&mut self.weight);
        parameters.push(&mut self.bias);
    }
    fn set_training(&mut self, training: bool) -> Result<()> {
        self.weight.set_training(training);
        self.bias.set_training(training);
        self.training = training;
        Ok(())
    }
}

impl<D: Dimension + 'static> Forward<Variable<D>> for BatchNorm {
    type Output = Variable<D>;
    fn forward(&self, input: Variable<D>) -> Result<Variable<D>> {
        let shape = input.shape().to_vec();
        let features = self.features();
        if shape.len() < 2 || shape[1] != features {
            bail!("BatchNorm expected {features} channels, found {shape:?}!");
        }
        let batch_size = shape[0];
        let len = shape[2..].iter().product::<usize>();
        let n = batch_size * len;
        let dim = input.raw_dim();
        let x = into_standard_layout(input.value().clone()).into_shape([batch_size, features, len])?;
        let (mean, var) = if self.training {
            ensure!(
                n > 1,
                "BatchNorm expected more than 1 value per channel when training, found {shape:?}!"
            );
            let mean = x.sum_axis(Axis(2)).sum_axis(Axis(0)) / n as f32;
            let centered = &x - &mean.view().into_shape([features, 1])?;
            let var = centered
                .map(|x| x * x)
                .sum_axis(Axis(2))
                .sum_axis(Axis(0))
                / n as f32;
            let mut running = self.running.write();
            let momentum = self.momentum;
            let unbias = n as f32 / (n - 1) as f32;
            running
                .mean
                .zip_mut_with(&mean, |r, x| *r = (1. - momentum) * *r + momentum * x);
            running
                .var
                .zip_mut_with(&var, |r, x| *r = (1. - momentum) * *r + momentum * unbias * x);
            (mean, var)
        } else {
            let running = self.running.read();
            (running.mean.clone(), running.var.clone())
        };
        let eps = self.eps;
        let inv_std = var.map(|v| 1. / (v + eps).sqrt());
        let inv_std_c = inv_std.view().into_shape([features, 1])?;
        let x_hat = (&x - &mean.view().into_shape([features, 1])?) * &inv_std_c;
        let weight = parameter_variable::<Ix1>(&self.weight)?;
        let bias = parameter_variable::<Ix1>(&self.bias)?;
        let gamma = weight.value().to_owned();
        let output = &x_hat * &gamma.view().into_shape([features, 1])?
            + &bias.value().view().into_shape([features, 1])?;
        let x_hat = x_hat.into_shared();
        let reshape_grad = move |output_grad: ArcArray<f32, D>| {
            into_standard_layout(output_grad).into_shape([batch_size, features, len])
        };
        let mut builder = Variable::<D>::builder();
        if let Some(node) = input.node() {
            let training = self.training;
            let x_hat = x_hat.clone();
            let dim = dim.clone();
            builder.edge(node, move |output_grad: ArcArray<f32, D>| {
                let dy = reshape_grad(output_grad)?;
                let scale = (&gamma * &inv_std).into_shape([features, 1])?;
                let dx = if training {
                    let dy_sum = dy.sum_axis(Axis(2)).sum_axis(Axis(0));
                    let dy_x_hat_sum = (&dy * &x_hat).sum_axis(Axis(2)).sum_axis(Axis(0));
                    let n = n as f32;
                    let centered = dy.to_owned() * n
                        - &dy_sum.into_shape([features, 1])?
                        - &x_hat * &dy_x_hat_sum.into_shape([features, 1])?;
                    centered * &(scale / n)
                } else {
                    dy.to_owned() * &scale
                };
                Ok(dx.into_shape(dim)?.into_shared())
            });
        }
        if let Some(node) = weight.node() {
            let x_hat = x_hat.clone();
            builder.edge(node, move |output_grad: ArcArray<f32, D>| {
                let dy = reshape_grad(output_grad)?;
                Ok((&dy * &x_hat)
                    .sum_axis(Axis(2))
                    .sum_axis(Axis(0))
                    .into_shared())
            });
        }
        if let Some(node) = bias.node() {
            builder.edge(node, move |output_grad: ArcArray<f32, D>| {
                let dy = reshape_grad(output_grad)?;
                Ok(dy.sum_axis(Axis(2)).sum_axis(Axis(0)).into_shared())
            });
        }
        Ok(builder.build(output.into_shape(dim)?.into_shared()))
    }
}

/// Leaky ReLU activation.
///
/// y = x if x > 0 else x * negative_slope
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct LeakyRelu {
    negative_slope: f32,
}

impl LeakyRelu {
    /// Creates a new [`LeakyRelu`].
    pub fn new(negative_slope: f32) -> Self {
        Self { negative_slope }
    }
    /// The negative slope.
    pub fn negative_slope(&self) -> f32 {
        self.negative_slope
    }
}

impl Default for LeakyRelu {
    fn default() -> Self {
        Self::new(0.01)
    }
}

impl Layer for LeakyRelu {}

impl<D: Dimension + 'static> Forward<Variable<D>> for LeakyRelu {
    type Output = Variable<D>;
    fn forward(&self, input: Variable<D>) -> Result<Variable<D>> {
        Ok(input.leaky_relu(self.negative_slope))
    }
}

/// A layer followed by optional [`BatchNorm`] and [`LeakyRelu`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Block<L> {
    layer: L,
    norm: Option<BatchNorm>,
    activation: Option<LeakyRelu>,
}

impl<L> Block<L> {
    /// Creates a new block from `layer`.
    pub fn new(layer: L) -> Self {
        Self {
            layer,
            norm: None,
            activation: None,
        }
    }
    /// Adds batch normalization.
    pub fn with_norm(mut self, norm: BatchNorm) -> Self {
        self.norm.replace(norm);
        self
    }
    /// Adds an activation.
    pub fn with_activation(mut self, activation: LeakyRelu) -> Self {
        self.activation.replace(activation);
        self
    }
    /// The layer.
    pub fn layer(&self) -> &L {
        &self.layer
    }
    /// The normalization.
    pub fn norm(&self) -> Option<&BatchNorm> {
        self.norm.as_ref()
    }
    /// The activation.
    pub fn activation(&self) -> Option<&LeakyRelu> {
        self.activation.as_ref()
    }
}

impl<L: Layer> Layer for Block<L> {
    fn parameters_len(&self) -> usize {
        self.layer.parameters_len() + self.norm.as_ref().map_or(0, Layer::parameters_len)
    }
    fn collect_parameters(&self, parameters: &mut Vec<ParameterD>) {
        self.layer.collect_parameters(parameters);
        if let Some(norm) = self.norm.as_ref() {
            norm.collect_parameters(parameters);
        }
    }
    fn collect_parameters_mut<'a>(&'a mut self, parameters: &mut Vec<&'a mut ParameterD>) {
        self.layer.collect_parameters_mut(parameters);
        if let Some(norm) = self.norm.as_mut() {
            norm.collect_parameters_mut(parameters);
        }
    }
    fn set_training(&mut self, training: bool) -> Result<()> {
        self.layer.set_training(training)?;
        if let Some(norm) = self.norm.as_mut() {
            norm.set_training(training)?;
        }
        Ok(())
    }
}

impl<L, D> Forward<Variable<D>> for Block<L>
where
    L: Forward<Variable<D>, Output = Variable<D>>,
    D: Dimension + 'static,
{
    type Output = Variable<D>;
    fn forward(&self, input: Variable<D>) -> Result<Variable<D>> {
        let mut output = self.layer.forward(input)?;
        if let Some(norm) = self.norm.as_ref() {
            output = norm.forward(output)?;
        }
        if let Some(activation) = self.activation.as_ref() {
            output = activation.forward(output)?;
        }
        Ok(output)
    }
}
