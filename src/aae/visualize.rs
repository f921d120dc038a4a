use crate::result::Result;
use anyhow::{ensure, Context};
use image::{Rgb, RgbImage};
use ndarray::ArrayView4;
use std::{fs, path::Path};

/// Converts a pixel in [-1, 1] to [0, 255], clamping values outside the range.
pub fn to_u8(x: f32) -> u8 {
    ((x + 1.) / 2. * 255.).round().clamp(0., 255.) as u8
}

/// Tiles `images` [n, channels, h, w] into a grid with `nrow` images per row, separated by
/// `padding` black pixels.
///
/// Images must have 1 or 3 channels, single channel images are rendered as gray.
pub fn image_grid(images: ArrayView4<f32>, nrow: usize, padding: usize) -> Result<RgbImage> {
    let (n, channels, height, width) = images.dim();
    ensure!(n > 0, "Expected at least 1 image!");
    ensure!(nrow > 0, "nrow must be greater than 0!");
    ensure!(
        channels == 1 || channels == 3,
        "Expected 1 or 3 channels, found {channels}!"
    );
    let columns = nrow.min(n);
    let rows = (n + columns - 1) / columns;
    let grid_width = columns * (width + padding) + padding;
    let grid_height = rows * (height + padding) + padding;
    let mut grid = RgbImage::new(grid_width.try_into()?, grid_height.try_into()?);
    for (i, image) in images.outer_iter().enumerate() {
        let x0 = padding + (i % columns) * (width + padding);
        let y0 = padding + (i / columns) * (height + padding);
        for y in 0..height {
            for x in 0..width {
                let pixel = if channels == 1 {
                    let v = to_u8(image[[0, y, x]]);
                    [v, v, v]
                } else {
                    [0, 1, 2].map(|c| to_u8(image[[c, y, x]]))
                };
                grid.put_pixel((x0 + x) as u32, (y0 + y) as u32, Rgb(pixel));
            }
        }
    }
    Ok(grid)
}

/// Saves `images` as a png grid at `path`, see [`image_grid()`].
///
/// Creates the parent directory if necessary.
pub fn save_image_grid(images: ArrayView4<f32>, nrow: usize, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    image_grid(images, nrow, 2)?
        .save(path)
        .with_context(|| format!("Unable to save image {path:?}!"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    #[test]
    fn pixel_range() {
        assert_eq!(to_u8(-1.), 0);
        assert_eq!(to_u8(1.), 255);
        assert_eq!(to_u8(0.), 128);
        assert_eq!(to_u8(-3.), 0);
        assert_eq!(to_u8(7.), 255);
    }

    #[test]
    fn grid_layout() -> Result<()> {
        let images = Array::from_shape_fn([10, 1, 3, 3], |(i, _, _, _)| i as f32 / 9. * 2. - 1.);
        let grid = image_grid(images.view(), 8, 2)?;
        assert_eq!(grid.dimensions(), (8 * 5 + 2, 2 * 5 + 2));
        assert_eq!(grid.get_pixel(0, 0), &Rgb([0, 0, 0]));
        assert_eq!(grid.get_pixel(2, 2), &Rgb([0, 0, 0]));
        // last image is on the second row, second column
        assert_eq!(grid.get_pixel(2 + 5, 2 + 5), &Rgb([255, 255, 255]));
        let grid = image_grid(images.slice(ndarray::s![..3, .., .., ..]), 8, 0)?;
        assert_eq!(grid.dimensions(), (9, 3));
        Ok(())
    }

    #[test]
    fn invalid_images() {
        let images = Array::zeros([2, 2, 3, 3]);
        assert!(image_grid(images.view(), 8, 2).is_err());
        let images = Array::zeros([0, 1, 3, 3]);
        assert!(image_grid(images.view(), 8, 2).is_err());
    }

    #[test]
    fn save_png() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("images").join("epoch1_generator.png");
        let images = Array::from_elem([4, 3, 4, 4], 0.5f32);
        save_image_grid(images.view(), 8, &path)?;
        let loaded = image::open(&path)?.into_rgb8();
        assert_eq!(loaded.dimensions(), (4 * 6 + 2, 6 + 2));
        assert_eq!(loaded.get_pixel(2, 2), &Rgb([191, 191, 191]));
        Ok(())
    }
}
