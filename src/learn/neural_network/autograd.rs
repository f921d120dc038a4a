use super::{layer::Forward, optimizer::State as OptimizerState};
use anyhow::{bail, ensure, Error, Result};
use ndarray::{
    ArcArray, Array, Dimension, IntoDimension, Ix0, Ix1, Ix2, Ix4, IxDyn, ShapeError, Zip,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::{
    collections::VecDeque,
    fmt::{self, Debug},
    marker::PhantomData,
    sync::{Arc, Weak},
};

type GradLock = Arc<RwLock<Option<ArcArray<f32, IxDyn>>>>;

/// Builders.
pub mod builder {
    use super::*;

    /// VariableBuilder.
    ///
    ///```no_run
    /// # use anyhow::Result;
    /// # use aae::learn::neural_network::autograd::{Variable, Variable2};
    /// # use ndarray::ArcArray2;
    /// # let input: Variable2 = todo!();
    /// let mut builder = Variable::builder();
    /// if let Some(node) = input.node() {
    ///     // Add an edge computing the input gradient from the output gradient.
    ///     builder.edge(node, |output_grad: ArcArray2<f32>| -> Result<ArcArray2<f32>> { todo!() });
    /// }
    /// let output_value: ArcArray2<f32> = todo!();
    /// # let _ = {
    /// builder.build(output_value)
    /// # };
    ///```
    pub struct VariableBuilder<D: Dimension> {
        grad: Option<GradLock>,
        edges: Vec<EdgeInner>,
        _m: PhantomData<D>,
    }

    impl<D: Dimension + 'static> VariableBuilder<D> {
        pub(super) fn new() -> Self {
            Self {
                grad: None,
                edges: Vec::new(),
                _m: PhantomData,
            }
        }
        /// Adds a node.
        ///
        /// Ensures a node is created even if edges are not added.
        pub fn node(mut self) -> Self {
            if self.grad.is_none() {
                self.grad.replace(Arc::new(RwLock::default()));
            }
            self
        }
        /// Adds an edge.
        ///
        /// During the backward pass, for each edge to `node`, `f` computes the gradient of `node`
        /// given the gradient of `self`.
        /// When multiple edges compute the same gradient, they are added together.
        /// Once there are no more edges needed to compute a gradient for a node, its edges can
        /// be computed.
        pub fn edge<D2, F>(&mut self, node: &Node<D2>, f: F)
        where
            D2: Dimension,
            F: FnOnce(ArcArray<f32, D>) -> Result<ArcArray<f32, D2>> + Send + Sync + 'static,
        {
            if self.grad.is_none() {
                self.grad.replace(Arc::new(RwLock::default()));
            }
            let mut output_grad_lock = self.grad.clone();
            let node = node.inner.clone();
            let mut input_grad_lock = Arc::downgrade(&node.grad);
            let dim = node.dim.clone();
            let name = std::any::type_name::<F>();
            let mut f = Some(f);
            let op = Box::new(move || -> Result<()> {
                let input_grad_lock = Weak::upgrade(&std::mem::take(&mut input_grad_lock));
                if let Some((f, (input_grad_lock, output_grad_lock))) =
                    f.take().zip(input_grad_lock.zip(output_grad_lock.take()))
                {
                    let grad = output_grad_lock.read().clone();
                    std::mem::drop(output_grad_lock);
                    let grad = if let Some(grad) = grad {
                        grad.into_dimensionality::<D>().map_err(Error::msg)?
                    } else {
                        return Ok(());
                    };
                    let grad = (f)(grad)?.into_dyn();
                    if grad.shape() != dim.slice() {
                        bail!(
                            "{name} computed grad {:?}, expected {:?}!",
                            grad.shape(),
                            dim.slice()
                        );
                    }
                    let mut guard = input_grad_lock.write();
                    if let Some(input_grad) = guard.as_mut() {
                        *input_grad += &grad;
                    } else {
                        guard.replace(grad);
                    }
                }
                Ok(())
            });
            self.edges.push(EdgeInner { name, op, node })
        }
        /// Builds the variable with `value`.
        pub fn build(self, value: ArcArray<f32, D>) -> Variable<D> {
            let node = self
                .grad
                .map(|grad| Node::new(value.raw_dim().into_dyn(), grad, self.edges));
            Variable { value, node }
        }
    }
}
use builder::*;

struct EdgeInner {
    name: &'static str,
    op: Box<dyn FnMut() -> Result<()> + Send + Sync + 'static>,
    node: Arc<NodeInner>,
}

impl Debug for EdgeInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EdgeInner")
            .field("name", &self.name)
            .field("node", &self.node)
            .finish()
    }
}

#[derive(Debug)]
struct NodeInner {
    dim: IxDyn,
    grad: GradLock,
    edges: Mutex<Vec<EdgeInner>>,
}

impl NodeInner {
    fn ready(&self) -> bool {
        Arc::weak_count(&self.grad) == 0
    }
}

/// Node.
///
/// Nodes store gradients and can be connected via [`VariableBuilder::edge()`] to
/// form a graph that is traversed in [`.backward()`](Node::backward).
#[derive(Clone, Debug)]
pub struct Node<D: Dimension> {
    inner: Arc<NodeInner>,
    _m: PhantomData<D>,
}

impl<D: Dimension> Node<D> {
    fn new(dim: IxDyn, grad: GradLock, edges: Vec<EdgeInner>) -> Self {
        Self {
            inner: Arc::new(NodeInner {
                dim,
                grad,
                edges: Mutex::new(edges),
            }),
            _m: PhantomData,
        }
    }
    /// The gradient.
    pub fn grad(&self) -> Option<ArcArray<f32, D>> {
        self.inner.grad.read().clone()?.into_dimensionality().ok()
    }
    /// Executes the backward pass, starting with a gradient of ones.
    pub fn backward(&self) -> Result<()> {
        let grad = ArcArray::<f32, IxDyn>::ones(self.inner.dim.clone())
            .into_dimensionality::<D>()
            .map_err(Error::msg)?;
        self.backward_grad(grad)
    }
    /// Executes the backward pass with `grad`.
    ///
    /// Does nothing if the node already has a gradient.
    pub fn backward_grad(&self, grad: ArcArray<f32, D>) -> Result<()> {
        ensure!(
            grad.shape() == self.inner.dim.slice(),
            "Expected grad {:?}, found {:?}!",
            self.inner.dim.slice(),
            grad.shape()
        );
        {
            let mut guard = self.inner.grad.write();
            if guard.is_some() {
                return Ok(());
            }
            guard.replace(grad.into_dyn());
        }
        let mut queue = VecDeque::new();
        queue.push_back(self.inner.clone());
        while let Some(node) = queue.pop_front() {
            let edges = std::mem::take(&mut *node.edges.lock());
            std::mem::drop(node);
            for mut edge in edges {
                (edge.op)()?;
                let node = edge.node;
                if node.ready() {
                    queue.push_back(node);
                }
            }
        }
        Ok(())
    }
    fn into_dimensionality<D2: Dimension>(self) -> Node<D2> {
        Node {
            inner: self.inner,
            _m: PhantomData,
        }
    }
}

/// Variable.
///
/// Variables are arrays with an optional [`Node`] that stores a gradient. Numerical operations
/// on variables with a node create a graph of edges that is traversed during the backward pass
/// to compute the gradients.
///
/// Variables can be created from arrays via [`From`].
/// Use [`builder()`](Variable::builder) to create a Variable as a function of another variable.
#[derive(Clone)]
pub struct Variable<D: Dimension> {
    value: ArcArray<f32, D>,
    node: Option<Node<D>>,
}

/// Variable with 1 element
pub type Variable0 = Variable<Ix0>;
/// Variable with 2 dimensions
pub type Variable2 = Variable<Ix2>;
/// Variable with 4 dimensions
pub type Variable4 = Variable<Ix4>;
/// Variable with dynamic dimensions
pub type VariableD = Variable<IxDyn>;

impl<D: Dimension> Debug for Variable<D> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Variable")
            .field("shape", &self.shape())
            .field("node", &self.node.is_some())
            .finish()
    }
}

impl<D: Dimension> Variable<D> {
    /// The value of the variable.
    pub fn value(&self) -> &ArcArray<f32, D> {
        &self.value
    }
    /// Converts the variable into its value.
    pub fn into_value(self) -> ArcArray<f32, D> {
        self.value
    }
    /// The node.
    pub fn node(&self) -> Option<&Node<D>> {
        self.node.as_ref()
    }
    /// The gradient, if computed.
    pub fn grad(&self) -> Option<ArcArray<f32, D>> {
        self.node.as_ref()?.grad()
    }
    /// Maps the variable with `F`.
    ///
    /// Shortcut for `f.forward(self)`. This allows chaining methods together.
    pub fn forward<F: Forward<Self>>(self, f: &F) -> Result<F::Output> {
        f.forward(self)
    }
    /// The shape.
    pub fn shape(&self) -> &[usize] {
        self.value.shape()
    }
    /// The dim in pattern form.
    pub fn dim(&self) -> D::Pattern {
        self.value.dim()
    }
    /// The dim.
    pub fn raw_dim(&self) -> D {
        self.value.raw_dim()
    }
    /// Drops the node, so that gradients do not flow into the inputs.
    pub fn detach(self) -> Self {
        Self {
            value: self.value,
            node: None,
        }
    }
    /// Converts into dimensionality `D2`.
    pub fn into_dimensionality<D2>(self) -> Result<Variable<D2>, ShapeError>
    where
        D2: Dimension,
    {
        let value = self.value.into_dimensionality()?;
        Ok(Variable {
            value,
            node: self.node.map(Node::into_dimensionality),
        })
    }
    /// Converts into a dynamic dimensional variable.
    pub fn into_dyn(self) -> VariableD {
        Variable {
            value: self.value.into_dyn(),
            node: self.node.map(Node::into_dimensionality),
        }
    }
}

impl<D: Dimension + 'static> Variable<D> {
    /// A `VariableBuilder` for creating nodes and edges.
    pub fn builder() -> VariableBuilder<D> {
        VariableBuilder::new()
    }
    /// Converts into `shape`.
    ///
    /// The value is copied into standard layout first if necessary.
    pub fn into_shape<E>(self, shape: E) -> Result<Variable<E::Dim>>
    where
        E: IntoDimension,
        E::Dim: 'static,
    {
        let dim = self.raw_dim();
        let mut builder = Variable::builder();
        if let Some(node) = self.node() {
            builder.edge(node, move |output_grad| {
                Ok(into_standard_layout(output_grad).into_shape(dim)?)
            });
        }
        let value = into_standard_layout(self.value).into_shape(shape)?;
        Ok(builder.build(value))
    }
    /// Flattens the variable into 2 dimensions, [batch_size, features].
    pub fn flatten(self) -> Result<Variable2> {
        let shape = self.shape();
        ensure!(!shape.is_empty(), "Can not flatten a 0 dimensional variable!");
        let batch_size = shape[0];
        let features = shape[1..].iter().product::<usize>();
        self.into_shape([batch_size, features])
    }
    /// Multiplies by `alpha`.
    pub fn scaled(self, alpha: f32) -> Self {
        let mut builder = Self::builder();
        if let Some(node) = self.node() {
            builder.edge(node, move |output_grad| {
                Ok(output_grad.map(|dy| alpha * dy).into_shared())
            });
        }
        builder.build(self.value.map(|x| alpha * x).into_shared())
    }
    /// Adds `rhs`.
    ///
    /// **Errors**
    ///
    /// The shapes are not equal.
    pub fn add(self, rhs: Self) -> Result<Self> {
        ensure!(
            self.shape() == rhs.shape(),
            "Can not add {:?} + {:?}!",
            self.shape(),
            rhs.shape()
        );
        let mut builder = Self::builder();
        for node in [self.node(), rhs.node()].into_iter().flatten() {
            builder.edge(node, Ok);
        }
        let mut value = self.value.into_owned();
        value += &rhs.value;
        Ok(builder.build(value.into_shared()))
    }
    /// Leaky ReLU activation.
    ///
    /// y = x if x > 0 else x * negative_slope
    pub fn leaky_relu(self, negative_slope: f32) -> Self {
        let mut builder = Self::builder();
        if let Some(node) = self.node() {
            let input = self.value.clone();
            builder.edge(node, move |output_grad| {
                let mut input_grad = output_grad.into_owned();
                Zip::from(&mut input_grad).and(&input).for_each(|dx, x| {
                    if *x <= 0. {
                        *dx *= negative_slope;
                    }
                });
                Ok(input_grad.into_shared())
            });
        }
        let value = self
            .value
            .map(|x| if *x > 0. { *x } else { x * negative_slope })
            .into_shared();
        builder.build(value)
    }
}

pub(crate) fn into_standard_layout<D: Dimension>(x: ArcArray<f32, D>) -> ArcArray<f32, D> {
    if x.is_standard_layout() {
        x
    } else {
        x.as_standard_layout().into_owned().into_shared()
    }
}

impl Variable0 {
    /// Executes the backward pass.
    ///
    /// See [`Node::backward`].
    pub fn backward(&self) -> Result<()> {
        if let Some(node) = self.node.as_ref() {
            node.backward()?;
        }
        Ok(())
    }
    /// The scalar value.
    pub fn item(&self) -> f32 {
        self.value[()]
    }
}

impl Variable2 {
    /// Matrix product.
    ///
    /// **Errors**
    ///
    /// The inner dimensions do not match.
    pub fn dot(&self, rhs: &Self) -> Result<Self> {
        let lhs = self;
        ensure!(
            lhs.dim().1 == rhs.dim().0,
            "Can not dot {:?} x {:?}!",
            lhs.shape(),
            rhs.shape()
        );
        let mut builder = Self::builder();
        if let Some(node) = lhs.node() {
            let rhs = rhs.value().clone();
            builder.edge(node, move |output_grad| {
                Ok(output_grad.dot(&rhs.t()).into_shared())
            });
        }
        if let Some(node) = rhs.node() {
            let lhs = lhs.value().clone();
            builder.edge(node, move |output_grad| {
                Ok(lhs.t().dot(&output_grad).into_shared())
            });
        }
        let value = lhs.value().dot(rhs.value()).into_shared();
        Ok(builder.build(value))
    }
}

impl<D: Dimension> From<Array<f32, D>> for Variable<D> {
    fn from(array: Array<f32, D>) -> Self {
        Self::from(array.into_shared())
    }
}

impl<D: Dimension> From<ArcArray<f32, D>> for Variable<D> {
    fn from(array: ArcArray<f32, D>) -> Self {
        Self {
            value: array,
            node: None,
        }
    }
}

/// Parameter.
///
/// Parameter values are updated during training by the
/// [`Optimizer`](super::optimizer::Optimizer). A Parameter can be converted to a [`Variable`]
/// via [`.to_variable()`](Parameter::to_variable), which allows it to be used in operations.
/// During training, [`.set_training(true)`](Parameter::set_training) ensures that
/// the variable created from this parameter has a [`Node`].
/// A parameter stores the [`OptimizerState`] which is updated during training
/// in [`Optimizer::update`](super::optimizer::Optimizer::update). Training progress may be saved
/// by serializing with [`serde`].
#[derive(Clone, Serialize, Deserialize)]
#[serde(bound(serialize = "D: Serialize", deserialize = "D: Deserialize<'de>"))]
pub struct Parameter<D: Dimension> {
    value: ArcArray<f32, D>,
    #[serde(skip)]
    grad: Option<GradLock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    optimizer_state: Option<OptimizerState>,
}

/// Parameter with 1 dimension.
pub type Parameter1 = Parameter<Ix1>;
/// Parameter with dynamic dimensions.
pub type ParameterD = Parameter<IxDyn>;

impl<D: Dimension> Parameter<D> {
    /// The value of the parameter.
    pub fn value(&self) -> &ArcArray<f32, D> {
        &self.value
    }
    /// The gradient of the parameter.
    pub fn grad(&self) -> Option<ArcArray<f32, D>> {
        self.grad
            .as_ref()?
            .read()
            .clone()?
            .into_dimensionality()
            .ok()
    }
    /// The shape.
    pub fn shape(&self) -> &[usize] {
        self.value.shape()
    }
    /// The dim.
    pub fn raw_dim(&self) -> D {
        self.value.raw_dim()
    }
    /// The number of elements.
    pub fn len(&self) -> usize {
        self.value.len()
    }
    /// Whether the parameter has 0 elements.
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
    /// Whether the parameter is training, ie will compute a gradient.
    pub fn training(&self) -> bool {
        self.grad.is_some()
    }
    /// Enables / disables training.
    ///
    /// If `training`, ensures that when the parameter is converted to a [`Variable`],
    /// it will have a [`Node`] for computing a gradient.
    /// If `training` is false, discards any gradient that has been computed.
    pub fn set_training(&mut self, training: bool) {
        if training && self.grad.is_none() {
            self.grad.replace(Arc::new(RwLock::default()));
        } else if !training {
            self.grad = None;
        }
    }
    /// Clears the gradient.
    pub fn zero_grad(&mut self) {
        if let Some(grad) = self.grad.as_ref() {
            grad.write().take();
        }
    }
    /// Borrows the optimizer state.
    pub fn optimizer_state(&self) -> Option<&OptimizerState> {
        self.optimizer_state.as_ref()
    }
    /// Borrows the value and optimizer state mutably.
    pub fn value_optimizer_state_mut(
        &mut self,
    ) -> (&mut ArcArray<f32, D>, &mut Option<OptimizerState>) {
        (&mut self.value, &mut self.optimizer_state)
    }
    /// Converts to a `Variable`.
    pub fn to_variable(&self) -> Variable<D> {
        let value = self.value.clone();
        let node = self
            .grad
            .as_ref()
            .map(|grad| Node::new(value.raw_dim().into_dyn(), grad.clone(), Vec::new()));
        Variable { value, node }
    }
    /// Converts into dimensionality `D2`.
    pub fn into_dimensionality<D2>(self) -> Result<Parameter<D2>, ShapeError>
    where
        D2: Dimension,
    {
        Ok(Parameter {
            value: self.value.into_dimensionality()?,
            grad: self.grad,
            optimizer_state: self.optimizer_state,
        })
    }
    /// Converts into a dynamic dimensional parameter.
    pub fn into_dyn(self) -> ParameterD {
        Parameter {
            value: self.value.into_dyn(),
            grad: self.grad,
            optimizer_state: self.optimizer_state,
        }
    }
}

impl<D: Dimension> From<Array<f32, D>> for Parameter<D> {
    fn from(array: Array<f32, D>) -> Self {
        Self::from(array.into_shared())
    }
}

impl<D: Dimension> From<ArcArray<f32, D>> for Parameter<D> {
    fn from(array: ArcArray<f32, D>) -> Self {
        Self {
            value: array,
            grad: None,
            optimizer_state: None,
        }
    }
}

impl<D: Dimension> Debug for Parameter<D> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Parameter")
            .field("shape", &self.shape())
            .field("training", &self.training())
            .field("optimizer_state", &self.optimizer_state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr0, arr2, Array2};

    fn sum(x: Variable2) -> Result<Variable0> {
        let mut builder = Variable::builder();
        if let Some(node) = x.node() {
            let dim = x.raw_dim();
            builder.edge(node, move |output_grad: ArcArray<f32, Ix0>| {
                Ok(Array2::from_elem(dim, output_grad[()]).into_shared())
            });
        }
        Ok(builder.build(arr0(x.value().sum()).into_shared()))
    }

    #[test]
    fn dot_backward() -> Result<()> {
        let mut a = Parameter::from(arr2(&[[1f32, 2.], [3., 4.]]));
        let mut b = Parameter::from(arr2(&[[5f32], [6.]]));
        a.set_training(true);
        b.set_training(true);
        let y = sum(a.to_variable().dot(&b.to_variable())?)?;
        assert_eq!(y.item(), 5. + 12. + 15. + 24.);
        y.backward()?;
        assert_abs_diff_eq!(a.grad().unwrap(), arr2(&[[5f32, 6.], [5., 6.]]).into_shared());
        assert_abs_diff_eq!(b.grad().unwrap(), arr2(&[[4f32], [6.]]).into_shared());
        Ok(())
    }

    #[test]
    fn grads_accumulate_until_zeroed() -> Result<()> {
        let mut a = Parameter::from(arr2(&[[1f32, -2.]]));
        a.set_training(true);
        let x = a.to_variable();
        let y = sum(x.clone().add(x.scaled(2.))?)?;
        y.backward()?;
        assert_abs_diff_eq!(a.grad().unwrap(), arr2(&[[3f32, 3.]]).into_shared());
        sum(a.to_variable())?.backward()?;
        assert_abs_diff_eq!(a.grad().unwrap(), arr2(&[[4f32, 4.]]).into_shared());
        a.zero_grad();
        assert!(a.grad().is_none());
        Ok(())
    }

    #[test]
    fn leaky_relu_backward() -> Result<()> {
        let mut a = Parameter::from(arr2(&[[1f32, -2.]]));
        a.set_training(true);
        let y = a.to_variable().leaky_relu(0.2);
        assert_abs_diff_eq!(y.value().clone(), arr2(&[[1f32, -0.4]]).into_shared());
        sum(y)?.backward()?;
        assert_abs_diff_eq!(a.grad().unwrap(), arr2(&[[1f32, 0.2]]).into_shared());
        Ok(())
    }

    #[test]
    fn into_shape_backward() -> Result<()> {
        let mut a = Parameter::from(Array::from_shape_vec([2, 1, 1, 2], vec![1f32, 2., 3., 4.])?);
        a.set_training(true);
        let y = a.to_variable().flatten()?;
        assert_eq!(y.shape(), &[2, 2]);
        sum(y.scaled(3.))?.backward()?;
        assert_eq!(a.grad().unwrap().shape(), &[2, 1, 1, 2]);
        assert!(a.grad().unwrap().iter().all(|x| *x == 3.));
        Ok(())
    }

    #[test]
    fn detach_stops_gradient() -> Result<()> {
        let mut a = Parameter::from(arr2(&[[1f32, 2.]]));
        a.set_training(true);
        let y = sum(a.to_variable().detach())?;
        assert!(y.node().is_none());
        y.backward()?;
        assert!(a.grad().is_none());
        Ok(())
    }

    #[test]
    fn parameter_serde_skips_grad() -> Result<()> {
        let mut a = Parameter::from(arr2(&[[1f32, 2.]])).into_dyn();
        a.set_training(true);
        let json = serde_json::to_string(&a)?;
        let b: ParameterD = serde_json::from_str(&json)?;
        assert!(!b.training());
        assert_eq!(a.value(), b.value());
        Ok(())
    }
}
