use anyhow::ensure;
#[cfg(test)]
use burn::module::Param;
use burn::{
    config::Config,
    module::Module,
    nn::{
        BatchNorm, BatchNormConfig, InstanceNorm, InstanceNormConfig, LeakyRelu, LeakyReluConfig,
        Linear, LinearConfig, PaddingConfig2d, Relu,
        conv::{Conv2d, Conv2dConfig},
    },
    tensor::{
        Tensor, activation,
        backend::Backend,
        module::interpolate,
        ops::{InterpolateMode, InterpolateOptions},
    },
};

use crate::{IMAGE_SIZE, LATENT_DIM, RGBD_CHANNELS};

// --- CONFIG ---

/// Architecture of the convolutional RGB-D VAE.
///
/// The encoder halves the spatial resolution once per entry of
/// `encoder_depths`; the decoder mirrors those stages in reverse, upsampling
/// to exactly the sizes the encoder saw, so any `image_size` that survives
/// the downsampling (216 → 108 → 54 → 27 → 13 → 6 for the defaults) decodes
/// back to its original shape.
#[derive(Config, Debug)]
pub struct VaeConfig {
    /// Side length of the square input images.
    #[config(default = 216)]
    pub image_size: usize,
    /// Dimensionality of the latent vector.
    #[config(default = 400)]
    pub latent_dim: usize,
    /// Output channels of each strided encoder stage.
    #[config(default = "vec![32, 64, 128, 256, 512]")]
    pub encoder_depths: Vec<usize>,
    /// Residual blocks at the bottleneck, in both encoder and decoder.
    #[config(default = 0)]
    pub num_res_blocks: usize,
}

impl VaeConfig {
    /// Config matching the crate-level defaults.
    pub fn rgbd() -> Self {
        Self::new()
            .with_image_size(IMAGE_SIZE)
            .with_latent_dim(LATENT_DIM)
    }

    /// Rejects configurations whose encoder and decoder shapes would not line up.
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.latent_dim > 0, "latent_dim must be positive");
        ensure!(
            !self.encoder_depths.is_empty(),
            "encoder_depths must name at least one stage"
        );
        ensure!(
            self.encoder_depths.iter().all(|&d| d > 0),
            "encoder_depths must be positive, got {:?}",
            self.encoder_depths
        );

        let mut size = self.image_size;
        for stage in 0..self.encoder_depths.len() {
            ensure!(
                size >= 2,
                "image_size {} is too small for {} strided stages (stage {} sees {}x{})",
                self.image_size,
                self.encoder_depths.len(),
                stage,
                size,
                size
            );
            size /= 2;
        }
        Ok(())
    }

    /// Spatial size before the first stage and after every stage.
    ///
    /// A 4x4 kernel with stride 2 and padding 1 maps `s` to `floor(s / 2)`.
    pub fn spatial_sizes(&self) -> Vec<usize> {
        let mut sizes = Vec::with_capacity(self.encoder_depths.len() + 1);
        let mut size = self.image_size;
        sizes.push(size);
        for _ in &self.encoder_depths {
            size /= 2;
            sizes.push(size);
        }
        sizes
    }

    /// Channel depth before the first stage and after every stage.
    pub fn channel_depths(&self) -> Vec<usize> {
        std::iter::once(RGBD_CHANNELS)
            .chain(self.encoder_depths.iter().copied())
            .collect()
    }

    /// Length of the flattened bottleneck feature vector.
    pub fn flattened_dim(&self) -> usize {
        let size = self.spatial_sizes().last().copied().unwrap_or(0);
        let depth = self.encoder_depths.last().copied().unwrap_or(0);
        depth * size * size
    }
}

// --- BUILDING BLOCKS ---

/// Strided convolution → batch norm → leaky ReLU; halves the resolution.
#[derive(Module, Debug)]
pub struct DownBlock<B: Backend> {
    conv: Conv2d<B>,
    norm: BatchNorm<B, 2>,
    activation: LeakyRelu,
}

impl<B: Backend> DownBlock<B> {
    pub fn new(channels_in: usize, channels_out: usize, device: &B::Device) -> Self {
        Self {
            conv: Conv2dConfig::new([channels_in, channels_out], [4, 4])
                .with_stride([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device),
            norm: BatchNormConfig::new(channels_out).init(device),
            activation: LeakyReluConfig::new().init(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.norm.forward(x);
        self.activation.forward(x)
    }
}

/// Nearest-neighbour upsample to `out_size` → 3x3 convolution → batch norm → leaky ReLU.
#[derive(Module, Debug)]
pub struct UpBlock<B: Backend> {
    conv: Conv2d<B>,
    norm: BatchNorm<B, 2>,
    activation: LeakyRelu,
    out_size: usize,
}

impl<B: Backend> UpBlock<B> {
    pub fn new(
        channels_in: usize,
        channels_out: usize,
        out_size: usize,
        device: &B::Device,
    ) -> Self {
        Self {
            conv: same_conv3x3(channels_in, channels_out, device),
            norm: BatchNormConfig::new(channels_out).init(device),
            activation: LeakyReluConfig::new().init(),
            out_size,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = upsample_nearest(x, self.out_size);
        let x = self.conv.forward(x);
        let x = self.norm.forward(x);
        self.activation.forward(x)
    }
}

/// Residual block with instance normalization, `relu(f(x) + x)`.
#[derive(Module, Debug)]
pub struct ResBlock<B: Backend> {
    conv1: Conv2d<B>,
    norm1: InstanceNorm<B>,
    conv2: Conv2d<B>,
    norm2: InstanceNorm<B>,
    activation: Relu,
}

impl<B: Backend> ResBlock<B> {
    pub fn new(channels: usize, device: &B::Device) -> Self {
        Self {
            conv1: same_conv3x3(channels, channels, device),
            norm1: InstanceNormConfig::new(channels).init(device),
            conv2: same_conv3x3(channels, channels, device),
            norm2: InstanceNormConfig::new(channels).init(device),
            activation: Relu::new(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let h = self.activation.forward(self.norm1.forward(self.conv1.forward(x.clone())));
        let h = self.norm2.forward(self.conv2.forward(h));
        self.activation.forward(h + x)
    }
}

fn same_conv3x3<B: Backend>(channels_in: usize, channels_out: usize, device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new([channels_in, channels_out], [3, 3])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .init(device)
}

fn upsample_nearest<B: Backend>(x: Tensor<B, 4>, size: usize) -> Tensor<B, 4> {
    interpolate(
        x,
        [size, size],
        InterpolateOptions::new(InterpolateMode::Nearest),
    )
}

// --- CONV ENCODER ---

/// Convolutional encoder for the VAE.
///
/// Structure:
/// - One [`DownBlock`] per entry of `encoder_depths`
///   (216×216 → 108 → 54 → 27 → 13 → 6 with the defaults)
/// - Optional residual blocks at the bottleneck
/// - Flatten, then two linear heads for `mu` and `logvar`
#[derive(Module, Debug)]
pub struct ConvEncoder<B: Backend> {
    blocks: Vec<DownBlock<B>>,
    res_blocks: Vec<ResBlock<B>>,
    fc_mu: Linear<B>,
    fc_logvar: Linear<B>,
}

impl<B: Backend> ConvEncoder<B> {
    /// Construct a new convolutional encoder.
    ///
    /// # Arguments
    /// * `config` – validated VAE configuration
    /// * `device` – Backend device where parameters are allocated
    pub fn new(config: &VaeConfig, device: &B::Device) -> Self {
        let depths = config.channel_depths();

        let blocks = depths
            .windows(2)
            .map(|pair| DownBlock::new(pair[0], pair[1], device))
            .collect();

        let bottleneck = depths[depths.len() - 1];
        let res_blocks = (0..config.num_res_blocks)
            .map(|_| ResBlock::new(bottleneck, device))
            .collect();

        let flattened_dim = config.flattened_dim();
        let fc_mu = LinearConfig::new(flattened_dim, config.latent_dim).init(device);
        let fc_logvar = LinearConfig::new(flattened_dim, config.latent_dim).init(device);

        Self {
            blocks,
            res_blocks,
            fc_mu,
            fc_logvar,
        }
    }

    /// Forward pass for the encoder.
    ///
    /// # Arguments
    /// * `x` – Input batch of shape `[Batch, 4, S, S]`
    ///
    /// # Returns
    /// `(mu, logvar)` – tensors of shape `[Batch, latent_dim]`. The
    /// log-variance is left unclamped.
    pub fn forward(&self, x: Tensor<B, 4>) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let mut x = x;
        for block in &self.blocks {
            x = block.forward(x);
        }
        for block in &self.res_blocks {
            x = block.forward(x);
        }

        // [B, C, s, s] → [B, C*s*s]
        let x = x.flatten::<2>(1, 3);

        let mu = self.fc_mu.forward(x.clone());
        let logvar = self.fc_logvar.forward(x);

        (mu, logvar)
    }
}

#[cfg(test)]
impl<B: Backend> ConvEncoder<B> {
    /// Pin the log-variance head to `value` for every input.
    pub(crate) fn with_constant_logvar(mut self, value: f32) -> Self {
        let weight = self.fc_logvar.weight.val().zeros_like();
        let [_, latent_dim] = weight.dims();
        let bias = Tensor::full([latent_dim], value, &weight.device());

        self.fc_logvar.weight = Param::from_tensor(weight);
        self.fc_logvar.bias = Some(Param::from_tensor(bias));
        self
    }
}

// --- CONV DECODER ---

/// Convolutional decoder for the VAE.
///
/// Structure:
/// - Linear layer expands the latent vector into the bottleneck grid
/// - Optional residual blocks
/// - [`UpBlock`]s retracing the encoder sizes in reverse
/// - Upsample + 3x3 convolution to 4 channels of Bernoulli logits
///
/// Unlike the [`UpBlock`]s, the last stage has no normalization and no leaky
/// ReLU: its convolution output is the logit map itself, and [`Self::forward`]
/// applies the sigmoid on top of it.
#[derive(Module, Debug)]
pub struct ConvDecoder<B: Backend> {
    fc_initial: Linear<B>,
    res_blocks: Vec<ResBlock<B>>,
    blocks: Vec<UpBlock<B>>,
    output_conv: Conv2d<B>,
    bottleneck_channels: usize,
    bottleneck_size: usize,
    image_size: usize,
}

impl<B: Backend> ConvDecoder<B> {
    pub fn new(config: &VaeConfig, device: &B::Device) -> Self {
        let depths = config.channel_depths();
        let sizes = config.spatial_sizes();
        let stages = depths.len() - 1;

        let bottleneck_channels = depths[stages];
        let bottleneck_size = sizes[stages];

        let fc_initial = LinearConfig::new(config.latent_dim, config.flattened_dim()).init(device);

        let res_blocks = (0..config.num_res_blocks)
            .map(|_| ResBlock::new(bottleneck_channels, device))
            .collect();

        // Stage i of the encoder took depths[i-1] @ sizes[i-1] to depths[i] @ sizes[i];
        // undo stages n..2 here, stage 1 is the logit projection below.
        let blocks = (2..=stages)
            .rev()
            .map(|i| UpBlock::new(depths[i], depths[i - 1], sizes[i - 1], device))
            .collect();

        let output_conv = same_conv3x3(depths[1], RGBD_CHANNELS, device);

        Self {
            fc_initial,
            res_blocks,
            blocks,
            output_conv,
            bottleneck_channels,
            bottleneck_size,
            image_size: config.image_size,
        }
    }

    /// Per-pixel, per-channel Bernoulli logits of shape `[Batch, 4, S, S]`.
    pub fn logits(&self, z: Tensor<B, 2>) -> Tensor<B, 4> {
        let [batch_size, _] = z.dims();
        let x = self.fc_initial.forward(z).reshape([
            batch_size,
            self.bottleneck_channels,
            self.bottleneck_size,
            self.bottleneck_size,
        ]);

        let mut x = x;
        for block in &self.res_blocks {
            x = block.forward(x);
        }
        for block in &self.blocks {
            x = block.forward(x);
        }

        let x = upsample_nearest(x, self.image_size);
        self.output_conv.forward(x)
    }

    /// Forward pass for the decoder.
    ///
    /// # Arguments
    /// * `z` – Latent sample, shape `[Batch, latent_dim]`
    ///
    /// # Returns
    /// Bernoulli parameters with shape `[Batch, 4, S, S]`, each in `(0, 1)`.
    pub fn forward(&self, z: Tensor<B, 2>) -> Tensor<B, 4> {
        activation::sigmoid(self.logits(z))
    }
}

// --- CONV VAE MODULE ---

/// Full convolutional VAE composed of:
/// - ConvEncoder
/// - ConvDecoder
///
/// The module tree owns every trainable parameter, so the whole struct is
/// what the optimizer updates. Model/guide densities live in [`crate::model`].
#[derive(Module, Debug)]
pub struct RgbdVae<B: Backend> {
    /// Convolutional encoder producing latent mean and logvar.
    pub encoder: ConvEncoder<B>,
    /// Convolutional decoder producing per-pixel Bernoulli parameters.
    pub decoder: ConvDecoder<B>,
    latent_dim: usize,
    image_size: usize,
}

impl<B: Backend> RgbdVae<B> {
    /// Construct a convolutional VAE from configuration and device.
    ///
    /// Fails if the configuration cannot produce matching encoder/decoder shapes.
    pub fn new(config: &VaeConfig, device: &B::Device) -> anyhow::Result<Self> {
        config.validate()?;
        Ok(Self {
            encoder: ConvEncoder::new(config, device),
            decoder: ConvDecoder::new(config, device),
            latent_dim: config.latent_dim,
            image_size: config.image_size,
        })
    }

    pub fn latent_dim(&self) -> usize {
        self.latent_dim
    }

    /// Shape of a single observation, `[channels, height, width]`.
    pub fn image_shape(&self) -> [usize; 3] {
        [RGBD_CHANNELS, self.image_size, self.image_size]
    }
}
