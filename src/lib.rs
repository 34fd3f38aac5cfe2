pub mod checkpoint;
pub mod conv_model;
pub mod distributions;
pub mod elbo;
pub mod model;
pub mod rgbd_data;
pub mod svi;
pub mod trainer;
pub mod visualize;

pub use conv_model::{RgbdVae, VaeConfig};
pub use elbo::Elbo;
pub use svi::Svi;
pub use trainer::{NumericalInstability, Phase, Trainer, TrainingConfig, TrainingSummary};

/// Channels per image: red, green, blue, depth.
pub const RGBD_CHANNELS: usize = 4;

/// Side length of the square RGB-D images (216).
pub const IMAGE_SIZE: usize = 216;

/// Default dimensionality of the VAE latent space.
///
/// Used by the training CLI and as the architecture default. Adjusting this
/// changes the representational capacity of the bottleneck layer.
pub const LATENT_DIM: usize = 400;

/// Backend the binaries run on: WGPU (Metal, Vulkan, DX12) with the `wgpu`
/// feature, the CPU NdArray backend otherwise.
#[cfg(feature = "wgpu")]
pub type DefaultBackend = burn_wgpu::Wgpu;
#[cfg(not(feature = "wgpu"))]
pub type DefaultBackend = burn::backend::NdArray;

#[cfg(test)]
pub(crate) type TestBackend = burn::backend::NdArray;
#[cfg(test)]
pub(crate) type TestAutodiffBackend = burn::backend::Autodiff<TestBackend>;

fn to_byte(val: f32) -> u8 {
    (val * 255.0).clamp(0.0, 255.0) as u8
}

/// Convert channel-major RGB planes `[3, size, size]` with values `[0.0–1.0]`
/// into interleaved RGB bytes `[0–255]`.
pub fn rgb_bytes(planes: &[f32], size: usize) -> Vec<u8> {
    let plane = size * size;
    let mut res = Vec::with_capacity(3 * plane);
    for i in 0..plane {
        res.push(to_byte(planes[i])); // R
        res.push(to_byte(planes[plane + i])); // G
        res.push(to_byte(planes[2 * plane + i])); // B
    }
    res
}

/// Convert a depth plane `[0.0–1.0]` into grey RGB bytes (R=G=B).
pub fn depth_rgb_bytes(depth: &[f32]) -> Vec<u8> {
    let mut res = Vec::with_capacity(depth.len() * 3);
    for &val in depth {
        let u = to_byte(val);
        res.push(u);
        res.push(u);
        res.push(u);
    }
    res
}
