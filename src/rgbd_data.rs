use std::path::{Path, PathBuf};

use anyhow::{Context, ensure};
use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    tensor::{Tensor, TensorData, backend::Backend},
};
use image::imageops::{self, FilterType};

use crate::RGBD_CHANNELS;

// --- Data Handling ---

/// One RGB-D image in channel-major layout (`[4, size, size]` flattened),
/// channels R, G, B, depth, every value in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct RgbdItem {
    pub size: usize,
    pub pixels: Vec<f32>,
}

impl RgbdItem {
    pub fn new(size: usize, pixels: Vec<f32>) -> anyhow::Result<Self> {
        ensure!(
            pixels.len() == RGBD_CHANNELS * size * size,
            "expected {} values for a {}x{} RGB-D image, got {}",
            RGBD_CHANNELS * size * size,
            size,
            size,
            pixels.len()
        );
        Ok(Self { size, pixels })
    }

    /// Image with every channel set to `value`.
    pub fn constant(size: usize, value: f32) -> Self {
        Self {
            size,
            pixels: vec![value; RGBD_CHANNELS * size * size],
        }
    }
}

/// A batcher that stacks [`RgbdItem`]s into a `[batch_size, 4, size, size]` tensor.
///
/// It does not store data itself; items are expected to share one size.
/// The final batch of an epoch may be smaller than the configured batch size.
#[derive(Clone, Debug, Default)]
pub struct RgbdBatcher;

impl RgbdBatcher {
    pub fn new() -> Self {
        Self
    }
}

impl<B: Backend> Batcher<B, RgbdItem, Tensor<B, 4>> for RgbdBatcher {
    fn batch(&self, items: Vec<RgbdItem>, device: &B::Device) -> Tensor<B, 4> {
        let batch_size = items.len();
        let size = items.first().map(|item| item.size).unwrap_or(0);

        let pixels: Vec<f32> = items.into_iter().flat_map(|item| item.pixels).collect();

        Tensor::from_floats(
            TensorData::new(pixels, vec![batch_size, RGBD_CHANNELS, size, size]),
            device,
        )
    }
}

// --- Datasets ---

/// RGB-D pairs stored as PNGs: `<root>/rgb/<name>.png` with a matching
/// `<root>/depth/<name>.png`.
///
/// Every pair is decoded once in [`Self::open`]; pairs that fail to decode
/// are dropped with a warning, so `get` yields an item for every index below
/// `len`. Images are then reloaded lazily, resized to `size × size`, and
/// normalized to `[0, 1]` (depth by the full range of its integer type).
#[derive(Debug, Clone)]
pub struct RgbdFolderDataset {
    pairs: Vec<(PathBuf, PathBuf)>,
    size: usize,
}

impl RgbdFolderDataset {
    pub fn open(root: impl AsRef<Path>, size: usize) -> anyhow::Result<Self> {
        let root = root.as_ref();
        let rgb_dir = root.join("rgb");
        let depth_dir = root.join("depth");

        let mut names = std::fs::read_dir(&rgb_dir)
            .with_context(|| format!("failed to list {}", rgb_dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "png"))
            .filter_map(|path| path.file_name().map(|name| name.to_owned()))
            .collect::<Vec<_>>();
        names.sort();

        let mut pairs = Vec::with_capacity(names.len());
        let mut skipped = 0usize;
        for name in names {
            let rgb = rgb_dir.join(&name);
            let depth = depth_dir.join(&name);
            ensure!(
                depth.exists(),
                "no depth map {} for {}",
                depth.display(),
                rgb.display()
            );

            match Self::decode(&rgb, &depth, size) {
                Ok(_) => pairs.push((rgb, depth)),
                Err(err) => {
                    log::warn!("dropping RGB-D pair {}: {err:#}", rgb.display());
                    skipped += 1;
                }
            }
        }

        log::info!(
            "found {} RGB-D pairs under {} ({} unreadable)",
            pairs.len(),
            root.display(),
            skipped
        );
        Ok(Self { pairs, size })
    }

    pub fn load(&self, index: usize) -> anyhow::Result<RgbdItem> {
        let (rgb_path, depth_path) = self
            .pairs
            .get(index)
            .with_context(|| format!("index {index} out of range"))?;
        Self::decode(rgb_path, depth_path, self.size)
    }

    fn decode(rgb_path: &Path, depth_path: &Path, size: usize) -> anyhow::Result<RgbdItem> {
        let side = size as u32;

        let rgb = image::open(rgb_path)
            .with_context(|| format!("failed to read {}", rgb_path.display()))?
            .to_rgb32f();
        let rgb = imageops::resize(&rgb, side, side, FilterType::Triangle);

        let depth = image::open(depth_path)
            .with_context(|| format!("failed to read {}", depth_path.display()))?
            .to_luma32f();
        let depth = imageops::resize(&depth, side, side, FilterType::Triangle);

        let plane = size * size;
        let mut pixels = vec![0.0f32; RGBD_CHANNELS * plane];
        for (i, p) in rgb.pixels().enumerate() {
            for c in 0..3 {
                pixels[c * plane + i] = p.0[c].clamp(0.0, 1.0);
            }
        }
        for (i, p) in depth.pixels().enumerate() {
            pixels[3 * plane + i] = p.0[0].clamp(0.0, 1.0);
        }

        RgbdItem::new(size, pixels)
    }
}

impl Dataset<RgbdItem> for RgbdFolderDataset {
    /// `None` only past the end. Panics if a pair that decoded in
    /// [`RgbdFolderDataset::open`] no longer does.
    fn get(&self, index: usize) -> Option<RgbdItem> {
        if index >= self.pairs.len() {
            return None;
        }
        match self.load(index) {
            Ok(item) => Some(item),
            Err(err) => panic!("RGB-D pair {index} became unreadable: {err:#}"),
        }
    }

    fn len(&self) -> usize {
        self.pairs.len()
    }
}

/// Deterministic synthetic RGB-D images for smoke tests and demos.
///
/// Each image is a soft disc on a gradient background, with depth falling
/// off from the disc centre; centre and radius vary with the index.
pub fn synthetic_items(count: usize, size: usize) -> Vec<RgbdItem> {
    (0..count)
        .map(|index| {
            let plane = size * size;
            let mut pixels = vec![0.0f32; RGBD_CHANNELS * plane];
            let denom = size.max(1) as f32;
            let cx = ((index * 7) % size.max(1)) as f32 / denom;
            let cy = ((index * 13) % size.max(1)) as f32 / denom;
            let radius = 0.15 + 0.1 * ((index % 5) as f32 / 4.0);

            for y in 0..size {
                for x in 0..size {
                    let u = x as f32 / denom;
                    let v = y as f32 / denom;
                    let dist = ((u - cx).powi(2) + (v - cy).powi(2)).sqrt();
                    let inside = if dist < radius { 1.0 } else { 0.0 };
                    let i = y * size + x;

                    pixels[i] = 0.8 * inside + 0.2 * u;
                    pixels[plane + i] = 0.5 * inside + 0.3 * v;
                    pixels[2 * plane + i] = 0.2 + 0.6 * (1.0 - inside) * u * v;
                    pixels[3 * plane + i] = (1.0 - dist).clamp(0.0, 1.0);
                }
            }
            RgbdItem { size, pixels }
        })
        .collect()
}
