use crate::result::Result;
use anyhow::ensure;
use ndarray::{s, ArcArray, Array, Array4, ArrayView4, Axis, Ix4};
use rand::{seq::SliceRandom, Rng};
use serde::{Deserialize, Serialize};
use std::vec::IntoIter as VecIntoIter;

/// MNIST / FashionMNIST.
#[cfg(feature = "mnist")]
pub mod mnist;

/// Image transform.
///
/// Pads each image with `padding` zero pixels on each side, scales pixels to [0, 1] and then
/// normalizes with (x - mean) / std.
///
/// The default maps 28 x 28 MNIST images to 32 x 32 images in [-1, 1].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageTransform {
    /// Zero padding on each side.
    pub padding: usize,
    /// Subtracted from the scaled pixels.
    pub mean: f32,
    /// Divides the centered pixels.
    pub std: f32,
}

impl Default for ImageTransform {
    fn default() -> Self {
        Self {
            padding: 2,
            mean: 0.5,
            std: 0.5,
        }
    }
}

impl ImageTransform {
    /// The [height, width] of the output images.
    pub fn output_size(&self, [height, width]: [usize; 2]) -> [usize; 2] {
        [height + 2 * self.padding, width + 2 * self.padding]
    }
    /// Normalizes a single pixel.
    pub fn normalize(&self, pixel: u8) -> f32 {
        (pixel as f32 / 255. - self.mean) / self.std
    }
    /// Applies the transform to a batch of images [batch_size, channels, h, w].
    pub fn apply(&self, images: ArrayView4<u8>) -> Array4<f32> {
        let (batch_size, channels, height, width) = images.dim();
        let [output_height, output_width] = self.output_size([height, width]);
        let mut output = Array::from_elem(
            [batch_size, channels, output_height, output_width],
            self.normalize(0),
        );
        let p = self.padding;
        output
            .slice_mut(s![.., .., p..p + height, p..p + width])
            .zip_mut_with(&images, |y, x| *y = self.normalize(*x));
        output
    }
}

/// A dataset of images.
///
/// Images are stored as u8 [n, channels, h, w] and transformed into f32 batches on demand.
#[derive(Clone, Debug)]
pub struct ImageDataset {
    images: ArcArray<u8, Ix4>,
    transform: ImageTransform,
}

impl ImageDataset {
    /// Creates a new dataset with `images` and `transform`.
    pub fn new(images: ArcArray<u8, Ix4>, transform: ImageTransform) -> Self {
        Self { images, transform }
    }
    /// The number of images.
    pub fn len(&self) -> usize {
        self.images.dim().0
    }
    /// Whether the dataset has no images.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// The number of channels.
    pub fn channels(&self) -> usize {
        self.images.dim().1
    }
    /// The [height, width] of the transformed images.
    pub fn image_size(&self) -> [usize; 2] {
        let (_, _, height, width) = self.images.dim();
        self.transform.output_size([height, width])
    }
    /// The transform.
    pub fn transform(&self) -> &ImageTransform {
        &self.transform
    }
    /// The raw images.
    pub fn images(&self) -> &ArcArray<u8, Ix4> {
        &self.images
    }
    /// An iterator over transformed batches.
    ///
    /// If `shuffle`, the images are visited in a random order drawn from `rng`. The last batch
    /// may be smaller than `batch_size`.
    ///
    /// **Errors**
    ///
    /// `batch_size` is 0.
    pub fn batches(
        &self,
        batch_size: usize,
        shuffle: bool,
        rng: &mut impl Rng,
    ) -> Result<Batches<'_>> {
        ensure!(batch_size > 0, "batch_size must be greater than 0!");
        let mut indices: Vec<usize> = (0..self.len()).collect();
        if shuffle {
            indices.shuffle(rng);
        }
        Ok(Batches {
            dataset: self,
            indices: indices.into_iter(),
            batch_size,
            drop_last: false,
        })
    }
}

/// Batches iterator.
///
/// See [`ImageDataset::batches()`].
pub struct Batches<'a> {
    dataset: &'a ImageDataset,
    indices: VecIntoIter<usize>,
    batch_size: usize,
    drop_last: bool,
}

impl Batches<'_> {
    /// Drops the last batch if it is smaller than the batch size.
    pub fn drop_last(self, drop_last: bool) -> Self {
        Self { drop_last, ..self }
    }
}

impl Iterator for Batches<'_> {
    type Item = Array4<f32>;
    fn next(&mut self) -> Option<Self::Item> {
        let remaining = self.indices.len();
        if remaining == 0 || (self.drop_last && remaining < self.batch_size) {
            return None;
        }
        let indices: Vec<usize> = self.indices.by_ref().take(self.batch_size).collect();
        let images = self.dataset.images.select(Axis(0), &indices);
        Some(self.dataset.transform.apply(images.view()))
    }
    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.indices.len();
        let batches = if self.drop_last {
            remaining / self.batch_size
        } else {
            (remaining + self.batch_size - 1) / self.batch_size
        };
        (batches, Some(batches))
    }
}

impl ExactSizeIterator for Batches<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::{rngs::StdRng, SeedableRng};

    fn dataset(n: usize) -> ImageDataset {
        let images = Array::from_shape_fn([n, 1, 2, 2], |(i, _, _, _)| i as u8);
        ImageDataset::new(images.into_shared(), ImageTransform::default())
    }

    #[test]
    fn transform_pads_and_normalizes() {
        let transform = ImageTransform::default();
        let images = Array::from_elem([1, 1, 28, 28], 255u8);
        let output = transform.apply(images.view());
        assert_eq!(output.shape(), &[1, 1, 32, 32]);
        assert_relative_eq!(output[[0, 0, 0, 0]], -1.);
        assert_relative_eq!(output[[0, 0, 31, 31]], -1.);
        assert_relative_eq!(output[[0, 0, 2, 2]], 1.);
        assert_relative_eq!(output[[0, 0, 29, 29]], 1.);
        assert_relative_eq!(output[[0, 0, 30, 29]], -1.);
        assert_relative_eq!(transform.normalize(0), -1.);
    }

    #[test]
    fn batches() -> Result<()> {
        let dataset = dataset(10);
        assert_eq!(dataset.image_size(), [6, 6]);
        let mut rng = StdRng::seed_from_u64(0);
        let batches = dataset.batches(4, false, &mut rng)?;
        assert_eq!(batches.len(), 3);
        let sizes: Vec<_> = batches.map(|x| x.dim().0).collect();
        assert_eq!(sizes, [4, 4, 2]);
        let batches = dataset.batches(4, false, &mut rng)?.drop_last(true);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches.count(), 2);
        assert!(dataset.batches(0, false, &mut rng).is_err());
        Ok(())
    }

    #[test]
    fn shuffled_batches_visit_each_image_once() -> Result<()> {
        let dataset = dataset(9);
        let transform = *dataset.transform();
        let mut rng = StdRng::seed_from_u64(1);
        let mut seen: Vec<u8> = dataset
            .batches(4, true, &mut rng)?
            .flat_map(|x| {
                x.outer_iter()
                    .map(|x| x[[0, 3, 3]])
                    .collect::<Vec<_>>()
            })
            .map(|x| (0..=255u8).find(|i| transform.normalize(*i) == x).unwrap())
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..9).collect::<Vec<u8>>());
        Ok(())
    }
}
