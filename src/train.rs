#![recursion_limit = "256"]

use std::path::PathBuf;

use anyhow::{Context, bail};
use burn::{
    backend::Autodiff,
    config::Config,
    data::{
        dataloader::DataLoaderBuilder,
        dataset::{Dataset, InMemDataset},
    },
    optim::AdamConfig,
    tensor::backend::{AutodiffBackend, Backend},
};
use clap::Parser;
use log::info;

use rgbd_vae::checkpoint::{CHECKPOINT_DIR, FileCheckpointer};
use rgbd_vae::rgbd_data::{RgbdBatcher, RgbdFolderDataset, RgbdItem, synthetic_items};
use rgbd_vae::trainer::{TestLoader, TrainLoader};
use rgbd_vae::visualize::PngComparison;
use rgbd_vae::{DefaultBackend, IMAGE_SIZE, LATENT_DIM, Trainer, TrainingConfig, VaeConfig};

// --- CLI DEFINITION ---

/// Train the RGB-D VAE with stochastic variational inference.
///
/// Data comes either from `--train-dir`/`--test-dir` (each holding `rgb/` and
/// `depth/` PNG folders with matching file names) or from `--synthetic N`
/// generated images, split 80/20.
#[derive(Parser, Debug)]
#[command(author, version, about = "RGB-D VAE trainer")]
struct Args {
    #[arg(long, requires = "test_dir", conflicts_with = "synthetic")]
    train_dir: Option<PathBuf>,

    #[arg(long, requires = "train_dir")]
    test_dir: Option<PathBuf>,

    /// Train on N generated images instead of a folder dataset.
    #[arg(long)]
    synthetic: Option<usize>,

    #[arg(long, default_value_t = IMAGE_SIZE)]
    image_size: usize,

    #[arg(long, default_value_t = LATENT_DIM)]
    latent_dim: usize,

    /// Channel depths of the encoder stages; the decoder mirrors them.
    #[arg(long, value_delimiter = ',', default_values_t = [32, 64, 128, 256, 512])]
    encoder_depths: Vec<usize>,

    #[arg(long, default_value_t = 0)]
    res_blocks: usize,

    #[arg(long, default_value_t = 1e-4)]
    learning_rate: f64,

    #[arg(long, default_value_t = 50)]
    batch_size: usize,

    #[arg(long, default_value_t = 300)]
    epochs: usize,

    #[arg(long, default_value_t = 5)]
    test_frequency: usize,

    #[arg(long, default_value_t = 1)]
    num_particles: usize,

    /// Use the closed-form KL term in the ELBO.
    #[arg(long)]
    analytic_kl: bool,

    #[arg(long, default_value_t = 101)]
    seed: u64,

    #[arg(long, default_value_t = 4)]
    num_workers: usize,

    /// Directory for `config.json` and the best checkpoint.
    #[arg(short, long, default_value = "rgbd_vae_model")]
    out_dir: PathBuf,

    /// Continue from the checkpoint in `--out-dir`.
    #[arg(long)]
    resume: bool,

    /// Where to write the reconstruction preview after each evaluation.
    #[arg(long, default_value = "reconstruction.png")]
    preview: PathBuf,

    #[arg(long)]
    progress: bool,
}

impl Args {
    fn training_config(&self) -> TrainingConfig {
        let model = VaeConfig::new()
            .with_image_size(self.image_size)
            .with_latent_dim(self.latent_dim)
            .with_encoder_depths(self.encoder_depths.clone())
            .with_num_res_blocks(self.res_blocks);

        TrainingConfig::new(model, AdamConfig::new())
            .with_learning_rate(self.learning_rate)
            .with_batch_size(self.batch_size)
            .with_num_epochs(self.epochs)
            .with_test_frequency(self.test_frequency)
            .with_num_particles(self.num_particles)
            .with_analytic_kl(self.analytic_kl)
            .with_seed(self.seed)
            .with_num_workers(self.num_workers)
            .with_show_progress(self.progress)
    }
}

// --- DATA ---

/// Build the shuffled training loader and the sequential test loader.
fn loaders<B, D>(config: &TrainingConfig, train: D, test: D, device: &B::Device) -> (TrainLoader<B>, TestLoader<B>)
where
    B: AutodiffBackend,
    D: Dataset<RgbdItem> + 'static,
{
    let train_loader: TrainLoader<B> = DataLoaderBuilder::new(RgbdBatcher::new())
        .batch_size(config.batch_size)
        .shuffle(config.seed)
        .num_workers(config.num_workers)
        .set_device(device.clone())
        .build(train);

    let test_loader: TestLoader<B> = DataLoaderBuilder::new(RgbdBatcher::new())
        .batch_size(config.batch_size)
        .num_workers(config.num_workers)
        .set_device(device.clone())
        .build(test);

    (train_loader, test_loader)
}

// --- TRAINING ---

fn run<B: AutodiffBackend>(args: Args, device: B::Device) -> anyhow::Result<()> {
    let config = args.training_config();
    config.validate()?;
    info!("Configuration: {config}");
    info!("Using device: {device:?}");

    std::fs::create_dir_all(&args.out_dir)
        .with_context(|| format!("failed to create {}", args.out_dir.display()))?;
    config
        .save(args.out_dir.join("config.json"))
        .context("failed to save config.json")?;

    let (train_loader, test_loader) = match (&args.train_dir, &args.test_dir, args.synthetic) {
        (Some(train_dir), Some(test_dir), None) => {
            let train = RgbdFolderDataset::open(train_dir, config.model.image_size)?;
            let test = RgbdFolderDataset::open(test_dir, config.model.image_size)?;
            loaders::<B, _>(&config, train, test, &device)
        }
        (None, None, Some(count)) => {
            let mut items = synthetic_items(count, config.model.image_size);
            let test = items.split_off(count * 4 / 5);
            info!("generated {} training and {} test images", items.len(), test.len());
            loaders::<B, _>(&config, InMemDataset::new(items), InMemDataset::new(test), &device)
        }
        _ => bail!("pass either --train-dir with --test-dir, or --synthetic N"),
    };

    let checkpointer = FileCheckpointer::new(args.out_dir.join(CHECKPOINT_DIR));
    let mut trainer = Trainer::<B, _>::new(config, &device)?
        .with_checkpoints(checkpointer.clone())
        .with_visualizer(PngComparison::new(&args.preview));

    if args.resume {
        trainer = trainer.resume(&checkpointer, &device)?;
    }

    let summary = trainer.fit(&train_loader, &test_loader)?;
    match summary.best_test_loss {
        Some(best) => info!(
            "Training finished. Best test loss {best:.4}, checkpoint in {}",
            checkpointer.dir().display()
        ),
        None => info!("Training finished without a checkpoint"),
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    // Autodiff wrapper is required for training to enable gradient tracking.
    type TrainBackend = Autodiff<DefaultBackend>;
    let device = <TrainBackend as Backend>::Device::default();

    run::<TrainBackend>(args, device)
}
