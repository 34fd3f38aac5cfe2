#![recursion_limit = "256"]

// --- IMPORTS ---
use std::path::{Path, PathBuf};

use anyhow::{Context, ensure};
use burn::{
    config::Config,
    data::dataloader::batcher::Batcher,
    tensor::{Distribution, Tensor, TensorData, backend::Backend},
};
use clap::Parser;
use image::RgbImage;
use log::info;

use rgbd_vae::checkpoint::{CHECKPOINT_DIR, FileCheckpointer};
use rgbd_vae::rgbd_data::{RgbdBatcher, RgbdFolderDataset};
use rgbd_vae::trainer::reconstruct_first;
use rgbd_vae::visualize::{PngComparison, RgbdImage, Visualizer};
use rgbd_vae::{DefaultBackend, RgbdVae, TrainingConfig, depth_rgb_bytes, rgb_bytes};

// --- CLI DEFINITION ---

/// Command-line interface for the RGB-D VAE inference tool.
///
/// Two modes:
/// - `--data-dir` with `--index`: reconstruct one RGB-D pair and write a
///   2×2 comparison grid.
/// - otherwise: decode a latent vector, either `--mu` or a draw from
///   `N(0, I)`, and write the RGB and depth halves side by side.
#[derive(Parser, Debug)]
#[command(author, version, about = "RGB-D VAE inference")]
struct Args {
    /// Directory written by the trainer (`config.json`, `checkpoint/`).
    #[arg(short, long, default_value = "rgbd_vae_model")]
    model_dir: PathBuf,

    /// Folder dataset (`rgb/`, `depth/`) to reconstruct from.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[arg(long, default_value_t = 0)]
    index: usize,

    /// Latent vector to decode; must have `latent_dim` entries.
    ///
    /// Example:
    /// `--mu 0.5 -1.2 0.3 ...`
    #[arg(long, value_delimiter = ' ', num_args = 1.., allow_hyphen_values = true, conflicts_with = "data_dir")]
    mu: Option<Vec<f32>>,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(short, long, default_value = "rgbd_output.png")]
    output: PathBuf,
}

// --- HELPER FUNCTIONS ---

/// Writes colour and depth next to each other as one `2S × S` PNG.
fn save_side_by_side(image: &RgbdImage, path: &Path) -> anyhow::Result<()> {
    let size = image.size;
    let color = rgb_bytes(image.color(), size);
    let depth = depth_rgb_bytes(image.depth());

    let mut canvas = RgbImage::new(2 * size as u32, size as u32);
    for (half, bytes) in [color, depth].iter().enumerate() {
        for (i, px) in bytes.chunks_exact(3).enumerate() {
            let x = (half * size + i % size) as u32;
            let y = (i / size) as u32;
            canvas.put_pixel(x, y, image::Rgb([px[0], px[1], px[2]]));
        }
    }

    canvas
        .save(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    info!("Saved image to {}", path.display());
    Ok(())
}

fn latent<B: Backend>(mu: Option<Vec<f32>>, latent_dim: usize, device: &B::Device) -> anyhow::Result<Tensor<B, 2>> {
    match mu {
        Some(values) => {
            ensure!(
                values.len() == latent_dim,
                "--mu has {} elements, but the model has latent_dim={latent_dim}",
                values.len()
            );
            info!("Decoding provided latent vector");
            Ok(Tensor::from_floats(TensorData::new(values, vec![1, latent_dim]), device))
        }
        None => {
            info!("Decoding a random draw from the prior");
            Ok(Tensor::random([1, latent_dim], Distribution::Normal(0.0, 1.0), device))
        }
    }
}

// --- MAIN EXECUTION ---

fn run<B: Backend>(args: Args, device: B::Device) -> anyhow::Result<()> {
    if let Some(seed) = args.seed {
        B::seed(seed);
    }

    let config_path = args.model_dir.join("config.json");
    let config = TrainingConfig::load(&config_path)
        .with_context(|| format!("no config at {}. Did you train the model?", config_path.display()))?;

    let model = RgbdVae::<B>::new(&config.model, &device)?;
    let model = FileCheckpointer::new(args.model_dir.join(CHECKPOINT_DIR)).load_model(model, &device)?;
    info!("Model loaded successfully");

    match &args.data_dir {
        Some(data_dir) => {
            let dataset = RgbdFolderDataset::open(data_dir, config.model.image_size)?;
            let item = dataset.load(args.index)?;
            let batch: Tensor<B, 4> = RgbdBatcher::new().batch(vec![item], &device);

            let (input, reconstruction) = reconstruct_first(&model, batch)?;
            PngComparison::new(&args.output).render(&input, &reconstruction)?;
            info!("Saved comparison to {}", args.output.display());
        }
        None => {
            let z = latent::<B>(args.mu.clone(), model.latent_dim(), &device)?;
            let image = RgbdImage::from_batch(model.decoder.forward(z))?;
            save_side_by_side(&image, &args.output)?;
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let device = <DefaultBackend as Backend>::Device::default();
    run::<DefaultBackend>(args, device)
}
