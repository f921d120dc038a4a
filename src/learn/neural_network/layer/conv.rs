use anyhow::{ensure, Result};
use ndarray::{
    parallel::prelude::*, stack, Array2, Array3, Array4, ArrayView2, ArrayView3, ArrayView4, Axis,
};

/// The geometry of a 2d convolution.
///
/// `input` is the spatial size of the convolution input, `output` the spatial size of the
/// convolution output. For transposed convolutions, the roles are swapped, ie the
/// input of the transposed convolution is the `output` of the geometry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) struct Geometry {
    pub(super) channels: usize,
    pub(super) input: [usize; 2],
    pub(super) filter: [usize; 2],
    pub(super) stride: [usize; 2],
    pub(super) padding: [usize; 2],
    pub(super) output: [usize; 2],
}

impl Geometry {
    pub(super) fn conv(
        channels: usize,
        input: [usize; 2],
        filter: [usize; 2],
        stride: [usize; 2],
        padding: [usize; 2],
    ) -> Result<Self> {
        let mut output = [0; 2];
        for i in 0..2 {
            ensure!(stride[i] > 0, "Conv stride must be positive!");
            ensure!(
                input[i] + 2 * padding[i] >= filter[i],
                "Conv input {input:?} with padding {padding:?} is smaller than filter {filter:?}!"
            );
            output[i] = (input[i] + 2 * padding[i] - filter[i]) / stride[i] + 1;
        }
        Ok(Self {
            channels,
            input,
            filter,
            stride,
            padding,
            output,
        })
    }
    /// The geometry of a transposed convolution with `channels` outputs.
    pub(super) fn transpose(
        channels: usize,
        input: [usize; 2],
        filter: [usize; 2],
        stride: [usize; 2],
        padding: [usize; 2],
        output_padding: [usize; 2],
    ) -> Result<Self> {
        let mut output = [0; 2];
        for i in 0..2 {
            ensure!(stride[i] > 0, "ConvTranspose stride must be positive!");
            ensure!(
                output_padding[i] < stride[i],
                "ConvTranspose output_padding {output_padding:?} must be smaller than stride {stride:?}!"
            );
            ensure!(input[i] > 0, "ConvTranspose input {input:?} is empty!");
            let size = (input[i] - 1) * stride[i] + filter[i] + output_padding[i];
            ensure!(
                size > 2 * padding[i],
                "ConvTranspose padding {padding:?} is too large for input {input:?}!"
            );
            output[i] = size - 2 * padding[i];
        }
        let geometry = Self::conv(channels, output, filter, stride, padding)?;
        debug_assert_eq!(geometry.output, input);
        Ok(geometry)
    }
    fn patch_len(&self) -> usize {
        self.channels * self.filter[0] * self.filter[1]
    }
    fn output_len(&self) -> usize {
        self.output[0] * self.output[1]
    }
    /// Calls `f(row, col, c, i, j)` for each patch element that is within the (unpadded) input.
    fn for_each_patch(&self, mut f: impl FnMut(usize, usize, usize, usize, usize)) {
        let [ih, iw] = self.input;
        let [fh, fw] = self.filter;
        let [sh, sw] = self.stride;
        let [ph, pw] = self.padding;
        let [oh, ow] = self.output;
        for c in 0..self.channels {
            for fi in 0..fh {
                for fj in 0..fw {
                    let row = (c * fh + fi) * fw + fj;
                    for oi in 0..oh {
                        let i = oi * sh + fi;
                        if i < ph || i - ph >= ih {
                            continue;
                        }
                        for oj in 0..ow {
                            let j = oj * sw + fj;
                            if j < pw || j - pw >= iw {
                                continue;
                            }
                            f(row, oi * ow + oj, c, i - ph, j - pw);
                        }
                    }
                }
            }
        }
    }
}

/// [channels, ih, iw] -> [channels * fh * fw, oh * ow]
fn im2col(x: ArrayView3<f32>, geometry: &Geometry) -> Array2<f32> {
    let mut cols = Array2::zeros([geometry.patch_len(), geometry.output_len()]);
    geometry.for_each_patch(|row, col, c, i, j| {
        cols[[row, col]] = x[[c, i, j]];
    });
    cols
}

/// [channels * fh * fw, oh * ow] -> [channels, ih, iw]
fn col2im(cols: ArrayView2<f32>, geometry: &Geometry) -> Array3<f32> {
    let [ih, iw] = geometry.input;
    let mut x = Array3::zeros([geometry.channels, ih, iw]);
    geometry.for_each_patch(|row, col, c, i, j| {
        x[[c, i, j]] += cols[[row, col]];
    });
    x
}

fn stack_outputs(outputs: Vec<Array2<f32>>) -> Result<Array3<f32>> {
    let views: Vec<_> = outputs.iter().map(Array2::view).collect();
    Ok(stack(Axis(0), &views)?)
}

/// Convolution.
///
/// x: [batch_size, channels, ih, iw], weight: [outputs, channels * fh * fw]
///
/// Returns [batch_size, outputs, oh, ow].
pub(super) fn conv2(
    x: ArrayView4<f32>,
    weight: ArrayView2<f32>,
    geometry: &Geometry,
) -> Result<Array4<f32>> {
    let batch_size = x.dim().0;
    ensure!(batch_size > 0, "Conv batch is empty!");
    let outputs = weight.dim().0;
    let [oh, ow] = geometry.output;
    let y: Vec<Array2<f32>> = x
        .axis_iter(Axis(0))
        .into_par_iter()
        .map(|x| weight.dot(&im2col(x, geometry)))
        .collect();
    Ok(stack_outputs(y)?.into_shape([batch_size, outputs, oh, ow])?)
}

/// Gradient of [`conv2`] with respect to `x`.
///
/// dy: [batch_size, outputs, oh, ow], weight: [outputs, channels * fh * fw]
///
/// Returns [batch_size, channels, ih, iw].
pub(super) fn conv2_backward_input(
    dy: ArrayView4<f32>,
    weight: ArrayView2<f32>,
    geometry: &Geometry,
) -> Result<Array4<f32>> {
    let (batch_size, outputs, _, _) = dy.dim();
    ensure!(batch_size > 0, "Conv batch is empty!");
    let dy = dy.as_standard_layout();
    let dy = dy
        .view()
        .into_shape([batch_size, outputs, geometry.output_len()])?;
    let dx: Vec<Array3<f32>> = dy
        .axis_iter(Axis(0))
        .into_par_iter()
        .map(|dy| col2im(weight.t().dot(&dy).view(), geometry))
        .collect();
    let views: Vec<_> = dx.iter().map(Array3::view).collect();
    Ok(stack(Axis(0), &views)?)
}

/// Gradient of [`conv2`] with respect to `weight`.
///
/// x: [batch_size, channels, ih, iw], dy: [batch_size, outputs, oh, ow]
///
/// Returns [outputs, channels * fh * fw].
pub(super) fn conv2_backward_weight(
    x: ArrayView4<f32>,
    dy: ArrayView4<f32>,
    geometry: &Geometry,
) -> Result<Array2<f32>> {
    let (batch_size, outputs, _, _) = dy.dim();
    ensure!(batch_size == x.dim().0, "Conv batch sizes do not match!");
    let dy = dy.as_standard_layout();
    let dy = dy
        .view()
        .into_shape([batch_size, outputs, geometry.output_len()])?;
    let patch_len = geometry.patch_len();
    let dw = x
        .axis_iter(Axis(0))
        .into_par_iter()
        .zip(dy.axis_iter(Axis(0)))
        .map(|(x, dy)| dy.dot(&im2col(x, geometry).t()))
        .reduce(|| Array2::zeros([outputs, patch_len]), |a, b| a + b);
    Ok(dw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    fn conv2_naive(x: ArrayView4<f32>, w: ArrayView4<f32>, geometry: &Geometry) -> Array4<f32> {
        let (n, c, ih, iw) = x.dim();
        let (o, _, fh, fw) = w.dim();
        let [oh, ow] = geometry.output;
        let [sh, sw] = geometry.stride;
        let [ph, pw] = geometry.padding;
        let mut y = Array4::zeros([n, o, oh, ow]);
        for ((b, oc, oi, oj), y) in y.indexed_iter_mut() {
            for ic in 0..c {
                for fi in 0..fh {
                    for fj in 0..fw {
                        let i = (oi * sh + fi) as isize - ph as isize;
                        let j = (oj * sw + fj) as isize - pw as isize;
                        if i >= 0 && j >= 0 && (i as usize) < ih && (j as usize) < iw {
                            *y += x[[b, ic, i as usize, j as usize]] * w[[oc, ic, fi, fj]];
                        }
                    }
                }
            }
        }
        y
    }

    #[test]
    fn conv_output_size() -> Result<()> {
        // 32 -> 16 -> 4 -> 1, as in the default generator encoder.
        assert_eq!(Geometry::conv(1, [32, 32], [5, 5], [2, 2], [2, 2])?.output, [16, 16]);
        assert_eq!(Geometry::conv(16, [16, 16], [5, 5], [4, 4], [2, 2])?.output, [4, 4]);
        assert_eq!(Geometry::conv(64, [4, 4], [5, 5], [4, 4], [2, 2])?.output, [1, 1]);
        assert!(Geometry::conv(1, [2, 2], [5, 5], [1, 1], [0, 0]).is_err());
        Ok(())
    }

    #[test]
    fn conv_transpose_output_size() -> Result<()> {
        // 1 -> 4 -> 16 -> 32, as in the default generator decoder.
        assert_eq!(
            Geometry::transpose(64, [1, 1], [5, 5], [4, 4], [2, 2], [3, 3])?.input,
            [4, 4]
        );
        assert_eq!(
            Geometry::transpose(256, [4, 4], [5, 5], [4, 4], [2, 2], [3, 3])?.input,
            [16, 16]
        );
        assert_eq!(
            Geometry::transpose(1, [16, 16], [5, 5], [2, 2], [2, 2], [1, 1])?.input,
            [32, 32]
        );
        assert!(Geometry::transpose(1, [4, 4], [5, 5], [2, 2], [2, 2], [2, 2]).is_err());
        Ok(())
    }

    #[test]
    fn conv2_matches_naive() -> Result<()> {
        let geometry = Geometry::conv(2, [7, 6], [3, 2], [2, 1], [1, 1])?;
        let x = Array::from_shape_fn([3, 2, 7, 6], |(a, b, c, d)| {
            ((a * 7 + b * 5 + c * 3 + d) % 11) as f32 - 5.
        });
        let w = Array::from_shape_fn([4, 2, 3, 2], |(a, b, c, d)| {
            ((a * 3 + b * 2 + c + d * 5) % 7) as f32 - 3.
        });
        let y = conv2(x.view(), w.view().into_shape([4, 2 * 3 * 2])?, &geometry)?;
        assert_eq!(y, conv2_naive(x.view(), w.view(), &geometry));
        Ok(())
    }

    #[test]
    fn col2im_is_adjoint_of_im2col() -> Result<()> {
        // <im2col(x), c> == <x, col2im(c)>
        let geometry = Geometry::conv(2, [5, 5], [3, 3], [2, 2], [1, 1])?;
        let x = Array::from_shape_fn([2, 5, 5], |(a, b, c)| (a + 2 * b + 3 * c) as f32 % 5.);
        let cols = Array::from_shape_fn([2 * 9, 9], |(a, b)| (a * b % 7) as f32 - 3.);
        let lhs = (&im2col(x.view(), &geometry) * &cols).sum();
        let rhs = (&x * &col2im(cols.view(), &geometry)).sum();
        assert_eq!(lhs, rhs);
        Ok(())
    }
}
