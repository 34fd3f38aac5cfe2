#![allow(dead_code)]

use burn::{
    backend::{Autodiff, NdArray},
    data::{dataloader::DataLoaderBuilder, dataset::InMemDataset},
    optim::{Adam, AdamConfig, adaptor::OptimizerAdaptor},
};
use rgbd_vae::rgbd_data::{RgbdBatcher, RgbdItem};
use rgbd_vae::trainer::{TestLoader, TrainLoader};
use rgbd_vae::{RgbdVae, TrainingConfig, VaeConfig};

pub type TestBackend = NdArray;
pub type TestAutodiffBackend = Autodiff<TestBackend>;

pub const SIZE: usize = 32;

/// 4×32×32 images, 16 latent dimensions, two encoder stages.
pub fn small_config() -> TrainingConfig {
    let model = VaeConfig::new()
        .with_image_size(SIZE)
        .with_latent_dim(16)
        .with_encoder_depths(vec![8, 16]);

    TrainingConfig::new(model, AdamConfig::new())
        .with_learning_rate(1e-3)
        .with_batch_size(5)
        .with_num_epochs(3)
        .with_test_frequency(1)
        .with_num_workers(0)
}

pub fn zeros(count: usize) -> Vec<RgbdItem> {
    vec![RgbdItem::constant(SIZE, 0.0); count]
}

/// Sequential loaders, no shuffling, batches built on the calling thread.
pub fn loaders(
    train: Vec<RgbdItem>,
    test: Vec<RgbdItem>,
    batch_size: usize,
) -> (TrainLoader<TestAutodiffBackend>, TestLoader<TestAutodiffBackend>) {
    let train_loader: TrainLoader<TestAutodiffBackend> = DataLoaderBuilder::new(RgbdBatcher::new())
        .batch_size(batch_size)
        .build(InMemDataset::new(train));
    let test_loader: TestLoader<TestAutodiffBackend> = DataLoaderBuilder::new(RgbdBatcher::new())
        .batch_size(batch_size)
        .build(InMemDataset::new(test));
    (train_loader, test_loader)
}

pub fn adam() -> OptimizerAdaptor<Adam, RgbdVae<TestAutodiffBackend>, TestAutodiffBackend> {
    AdamConfig::new().init()
}
