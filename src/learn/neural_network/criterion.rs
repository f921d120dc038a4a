use super::autograd::{Variable, Variable0};
use crate::learn::criterion::{
    bce_with_logits_loss_host, ensure_shapes_match, mse_loss_host, sigmoid, BCEWithLogitsLoss,
    Criterion, MSELoss,
};
use anyhow::Result;
use ndarray::{arr0, ArcArray, Dimension, Ix0, Zip};

impl<D: Dimension + 'static> Criterion<Variable<D>, ArcArray<f32, D>> for MSELoss {
    type Output = Variable0;
    fn eval(&self, input: Variable<D>, target: ArcArray<f32, D>) -> Result<Variable0> {
        ensure_shapes_match("MSELoss", input.shape(), target.shape())?;
        let mut builder = Variable0::builder();
        if let Some(node) = input.node() {
            let input = input.value().clone();
            let target = target.clone();
            builder.edge(node, move |output_grad: ArcArray<f32, Ix0>| {
                let scale = 2. * output_grad[()] / input.len() as f32;
                Ok(Zip::from(&input)
                    .and(&target)
                    .map_collect(|x, t| scale * (x - t))
                    .into_shared())
            });
        }
        let value = mse_loss_host(input.value().view(), target.view());
        Ok(builder.build(arr0(value).into_shared()))
    }
}

impl<D: Dimension + 'static> Criterion<Variable<D>, ArcArray<f32, D>> for BCEWithLogitsLoss {
    type Output = Variable0;
    fn eval(&self, input: Variable<D>, target: ArcArray<f32, D>) -> Result<Variable0> {
        ensure_shapes_match("BCEWithLogitsLoss", input.shape(), target.shape())?;
        let mut builder = Variable0::builder();
        if let Some(node) = input.node() {
            let input = input.value().clone();
            let target = target.clone();
            builder.edge(node, move |output_grad: ArcArray<f32, Ix0>| {
                let scale = output_grad[()] / input.len() as f32;
                Ok(Zip::from(&input)
                    .and(&target)
                    .map_collect(|x, t| scale * (sigmoid(*x) - t))
                    .into_shared())
            });
        }
        let value = bce_with_logits_loss_host(input.value().view(), target.view());
        Ok(builder.build(arr0(value).into_shared()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learn::neural_network::autograd::Parameter;
    use approx::assert_relative_eq;
    use ndarray::{arr2, Array2};

    fn check_gradient<C>(criterion: &C, x: Array2<f32>, t: Array2<f32>)
    where
        C: Criterion<Variable<ndarray::Ix2>, ArcArray<f32, ndarray::Ix2>, Output = Variable0>,
    {
        let eps = 1e-2;
        let t = t.into_shared();
        let mut parameter = Parameter::from(x.clone());
        parameter.set_training(true);
        let loss = criterion.eval(parameter.to_variable(), t.clone()).unwrap();
        loss.backward().unwrap();
        let grad = parameter.grad().unwrap();
        for ((i, j), dx) in grad.indexed_iter() {
            let mut x_plus = x.clone();
            x_plus[[i, j]] += eps;
            let mut x_minus = x.clone();
            x_minus[[i, j]] -= eps;
            let plus = criterion.eval(Variable::from(x_plus), t.clone()).unwrap();
            let minus = criterion.eval(Variable::from(x_minus), t.clone()).unwrap();
            let numeric = (plus.item() - minus.item()) / (2. * eps);
            assert_relative_eq!(*dx, numeric, epsilon = 1e-3, max_relative = 1e-3);
        }
    }

    #[test]
    fn mse_loss_backward() {
        check_gradient(
            &MSELoss,
            arr2(&[[0.5, -1.], [2., 0.25]]),
            arr2(&[[0., 1.], [1.5, -0.5]]),
        );
    }

    #[test]
    fn bce_with_logits_loss_backward() {
        check_gradient(
            &BCEWithLogitsLoss,
            arr2(&[[0.5], [-1.], [2.], [0.]]),
            arr2(&[[1.], [1.], [0.], [0.]]),
        );
    }

    #[test]
    fn without_node() -> Result<()> {
        let x = Variable::from(arr2(&[[1f32, 2.]]));
        let loss = MSELoss.eval(x, arr2(&[[1f32, 0.]]).into_shared())?;
        assert!(loss.node().is_none());
        assert_relative_eq!(loss.item(), 2.);
        Ok(())
    }
}
