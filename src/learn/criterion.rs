use crate::result::Result;
use anyhow::ensure;
use ndarray::{ArrayBase, ArrayView, Data as ArrayData, Dimension, Zip};

/// Criterion.
///
/// Evaluates `input` against `target`, ie a loss function.
pub trait Criterion<X, T> {
    /// The output.
    type Output;
    /// Evaluates the criterion.
    ///
    /// **Errors**
    ///
    /// The shapes of `input` and `target` do not match.
    fn eval(&self, input: X, target: T) -> Result<Self::Output>;
}

/// Mean squared error loss.
///
/// mean((x - t)^2), over all elements.
#[derive(Default, Clone, Copy, Debug)]
pub struct MSELoss;

/// Binary cross entropy with logits.
///
/// mean(max(x, 0) - x * t + ln(1 + exp(-|x|))), over all elements.
///
/// This is equivalent to binary cross entropy of sigmoid(x) with target t, but is numerically
/// stable for large |x|.
#[derive(Default, Clone, Copy, Debug)]
pub struct BCEWithLogitsLoss;

pub(crate) fn ensure_shapes_match(name: &str, input: &[usize], target: &[usize]) -> Result<()> {
    ensure!(
        input == target,
        "{name} input {input:?} does not match target {target:?}!"
    );
    ensure!(!input.contains(&0), "{name} input {input:?} is empty!");
    Ok(())
}

impl<S1, S2, D> Criterion<ArrayBase<S1, D>, ArrayBase<S2, D>> for MSELoss
where
    S1: ArrayData<Elem = f32>,
    S2: ArrayData<Elem = f32>,
    D: Dimension,
{
    type Output = f32;
    fn eval(&self, input: ArrayBase<S1, D>, target: ArrayBase<S2, D>) -> Result<f32> {
        ensure_shapes_match("MSELoss", input.shape(), target.shape())?;
        Ok(mse_loss_host(input.view(), target.view()))
    }
}

impl<S1, S2, D> Criterion<ArrayBase<S1, D>, ArrayBase<S2, D>> for BCEWithLogitsLoss
where
    S1: ArrayData<Elem = f32>,
    S2: ArrayData<Elem = f32>,
    D: Dimension,
{
    type Output = f32;
    fn eval(&self, input: ArrayBase<S1, D>, target: ArrayBase<S2, D>) -> Result<f32> {
        ensure_shapes_match("BCEWithLogitsLoss", input.shape(), target.shape())?;
        Ok(bce_with_logits_loss_host(input.view(), target.view()))
    }
}

pub(crate) fn mse_loss_host<D: Dimension>(x: ArrayView<f32, D>, t: ArrayView<f32, D>) -> f32 {
    let mut sum = 0f64;
    Zip::from(&x).and(&t).for_each(|x, t| {
        let d = (x - t) as f64;
        sum += d * d;
    });
    (sum / x.len() as f64) as f32
}

pub(crate) fn bce_with_logits_loss_host<D: Dimension>(
    x: ArrayView<f32, D>,
    t: ArrayView<f32, D>,
) -> f32 {
    let mut sum = 0f64;
    Zip::from(&x).and(&t).for_each(|x, t| {
        let x = *x as f64;
        let t = *t as f64;
        sum += x.max(0.) - x * t + (-x.abs()).exp().ln_1p();
    });
    (sum / x.len() as f64) as f32
}

pub(crate) fn sigmoid(x: f32) -> f32 {
    if x >= 0. {
        1. / (1. + (-x).exp())
    } else {
        let e = x.exp();
        e / (1. + e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{arr1, arr2};

    #[test]
    fn mse_loss() -> Result<()> {
        let x = arr2(&[[1f32, 2.], [3., 4.]]);
        let t = arr2(&[[1f32, 0.], [0., 4.]]);
        assert_relative_eq!(MSELoss.eval(x.view(), t.view())?, (4. + 9.) / 4.);
        Ok(())
    }

    #[test]
    fn bce_with_logits_loss() -> Result<()> {
        let x = arr1(&[0f32, 2., -3.]);
        let t = arr1(&[1f32, 0., 0.]);
        let expected = [(0f32, 1f32), (2., 0.), (-3., 0.)]
            .iter()
            .map(|(x, t)| {
                let p = 1. / (1. + (-x).exp());
                -(t * p.ln() + (1. - t) * (1. - p).ln())
            })
            .sum::<f32>()
            / 3.;
        assert_relative_eq!(
            BCEWithLogitsLoss.eval(x.view(), t.view())?,
            expected,
            epsilon = 1e-6
        );
        Ok(())
    }

    #[test]
    fn bce_with_logits_loss_is_stable() -> Result<()> {
        let x = arr1(&[100f32, -100.]);
        let t = arr1(&[0f32, 1.]);
        let loss = BCEWithLogitsLoss.eval(x.view(), t.view())?;
        assert!(loss.is_finite());
        assert_relative_eq!(loss, 100., epsilon = 1e-4);
        assert_relative_eq!(sigmoid(-100.), 0., epsilon = 1e-30);
        assert_relative_eq!(sigmoid(0.), 0.5);
        Ok(())
    }

    #[test]
    fn shape_mismatch() {
        let x = arr1(&[1f32, 2.]);
        let t = arr1(&[1f32]);
        assert!(MSELoss.eval(x.view(), t.view()).is_err());
        assert!(BCEWithLogitsLoss.eval(x.view(), t.view()).is_err());
    }
}
