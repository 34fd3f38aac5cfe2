use std::path::PathBuf;

use anyhow::{Context, anyhow, ensure};
use burn::tensor::{Tensor, backend::Backend};
use image::{Rgb, RgbImage};

use crate::{RGBD_CHANNELS, depth_rgb_bytes, rgb_bytes};

/// A single RGB-D image on the host, channel-major, values in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct RgbdImage {
    pub size: usize,
    pub pixels: Vec<f32>,
}

impl RgbdImage {
    /// Copy the first image of a `[Batch, 4, S, S]` tensor to host memory.
    pub fn from_batch<B: Backend>(batch: Tensor<B, 4>) -> anyhow::Result<Self> {
        let [batch_size, channels, height, width] = batch.dims();
        ensure!(batch_size > 0, "empty batch");
        ensure!(
            channels == RGBD_CHANNELS && height == width,
            "expected [N, 4, S, S], got {:?}",
            batch.dims()
        );

        let first = batch.narrow(0, 0, 1);
        let pixels: Vec<f32> = first
            .into_data()
            .convert::<f32>()
            .to_vec()
            .map_err(|err| anyhow!("failed to read tensor data: {err:?}"))?;
        Ok(Self {
            size: height,
            pixels,
        })
    }

    fn plane(&self) -> usize {
        self.size * self.size
    }

    pub fn color(&self) -> &[f32] {
        &self.pixels[..3 * self.plane()]
    }

    pub fn depth(&self) -> &[f32] {
        &self.pixels[3 * self.plane()..]
    }
}

/// Receives one held-out input and its reconstruction after each evaluation.
///
/// Errors are reported to the caller but never stop training.
pub trait Visualizer {
    fn render(&self, input: &RgbdImage, reconstruction: &RgbdImage) -> anyhow::Result<()>;
}

/// Writes a 2×2 PNG grid to a fixed path:
///
/// ```text
/// | input RGB          | input depth          |
/// | reconstruction RGB | reconstruction depth |
/// ```
#[derive(Debug, Clone)]
pub struct PngComparison {
    path: PathBuf,
}

impl PngComparison {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn paste(canvas: &mut RgbImage, bytes: &[u8], size: usize, col: usize, row: usize) {
        for (i, px) in bytes.chunks_exact(3).enumerate() {
            let x = (col * size + i % size) as u32;
            let y = (row * size + i / size) as u32;
            canvas.put_pixel(x, y, Rgb([px[0], px[1], px[2]]));
        }
    }
}

impl Visualizer for PngComparison {
    fn render(&self, input: &RgbdImage, reconstruction: &RgbdImage) -> anyhow::Result<()> {
        ensure!(
            input.size == reconstruction.size,
            "input is {0}x{0} but reconstruction is {1}x{1}",
            input.size,
            reconstruction.size
        );
        let size = input.size;
        let mut canvas = RgbImage::new(2 * size as u32, 2 * size as u32);

        Self::paste(&mut canvas, &rgb_bytes(input.color(), size), size, 0, 0);
        Self::paste(&mut canvas, &depth_rgb_bytes(input.depth()), size, 1, 0);
        Self::paste(&mut canvas, &rgb_bytes(reconstruction.color(), size), size, 0, 1);
        Self::paste(&mut canvas, &depth_rgb_bytes(reconstruction.depth()), size, 1, 1);

        canvas
            .save(&self.path)
            .with_context(|| format!("failed to write {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestBackend;

    #[test]
    fn from_batch_takes_first_image() {
        let device = Default::default();
        let batch = Tensor::<TestBackend, 4>::cat(
            vec![Tensor::ones([1, 4, 2, 2], &device), Tensor::zeros([1, 4, 2, 2], &device)],
            0,
        );
        let image = RgbdImage::from_batch(batch).unwrap();
        assert_eq!(image.size, 2);
        assert_eq!(image.pixels, vec![1.0; 16]);
        assert_eq!(image.color().len(), 12);
        assert_eq!(image.depth().len(), 4);
    }

    #[test]
    fn writes_two_by_two_grid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preview.png");

        let input = RgbdImage {
            size: 3,
            pixels: vec![1.0; 36],
        };
        let recon = RgbdImage {
            size: 3,
            pixels: vec![0.0; 36],
        };
        PngComparison::new(&path).render(&input, &recon).unwrap();

        let saved = image::open(&path).unwrap().to_rgb8();
        assert_eq!(saved.dimensions(), (6, 6));
        assert_eq!(saved.get_pixel(0, 0).0, [255, 255, 255]);
        assert_eq!(saved.get_pixel(0, 5).0, [0, 0, 0]);
    }

    #[test]
    fn unwritable_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let image = RgbdImage {
            size: 1,
            pixels: vec![0.5; 4],
        };
        let target = PngComparison::new(dir.path().join("missing/dir/preview.png"));
        assert!(target.render(&image, &image).is_err());
    }
}
