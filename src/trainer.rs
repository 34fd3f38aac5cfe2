use std::fmt;
use std::sync::Arc;

use anyhow::{Context, ensure};
use burn::{
    config::Config,
    data::dataloader::DataLoader,
    module::{AutodiffModule, Module},
    optim::{Adam, AdamConfig, Optimizer, adaptor::OptimizerAdaptor},
    tensor::{
        Tensor,
        backend::{AutodiffBackend, Backend},
    },
};
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::{error, info, warn};

use crate::checkpoint::{CheckpointStore, FileCheckpointer, TrainingState};
use crate::conv_model::{RgbdVae, VaeConfig};
use crate::elbo::Elbo;
use crate::svi::Svi;
use crate::visualize::{RgbdImage, Visualizer};
use crate::RGBD_CHANNELS;

/// Minibatches for the training phase, on the autodiff backend.
pub type TrainLoader<B> = Arc<dyn DataLoader<B, Tensor<B, 4>>>;

/// Minibatches for the evaluation phase, on the inner (non-autodiff) backend.
pub type TestLoader<B> = Arc<
    dyn DataLoader<
            <B as AutodiffBackend>::InnerBackend,
            Tensor<<B as AutodiffBackend>::InnerBackend, 4>,
        >,
>;

// --- CONFIG ---

/// Everything fixed at process start: architecture, optimizer and loop settings.
#[derive(Config)]
pub struct TrainingConfig {
    pub model: VaeConfig,
    pub optimizer: AdamConfig,
    #[config(default = 1e-4)]
    pub learning_rate: f64,
    #[config(default = 50)]
    pub batch_size: usize,
    #[config(default = 300)]
    pub num_epochs: usize,
    /// Evaluate (and possibly checkpoint) when `epoch % test_frequency == 0`.
    #[config(default = 5)]
    pub test_frequency: usize,
    /// Latent samples per ELBO estimate.
    #[config(default = 1)]
    pub num_particles: usize,
    /// Use the closed-form KL term instead of its Monte Carlo estimate.
    #[config(default = false)]
    pub analytic_kl: bool,
    #[config(default = 101)]
    pub seed: u64,
    #[config(default = 4)]
    pub num_workers: usize,
    #[config(default = false)]
    pub show_progress: bool,
}

impl TrainingConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.model.validate()?;
        ensure!(
            self.learning_rate.is_finite() && self.learning_rate > 0.0,
            "learning_rate must be positive, got {}",
            self.learning_rate
        );
        ensure!(self.batch_size > 0, "batch_size must be positive");
        ensure!(self.test_frequency > 0, "test_frequency must be positive");
        ensure!(self.num_particles > 0, "num_particles must be positive");
        Ok(())
    }

    pub fn elbo(&self) -> anyhow::Result<Elbo> {
        Ok(Elbo::new(self.num_particles)?.with_analytic_kl(self.analytic_kl))
    }
}

// --- ERRORS ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Training,
    Evaluation,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Training => write!(f, "training"),
            Phase::Evaluation => write!(f, "evaluation"),
        }
    }
}

/// Degenerate density estimates detected by the driver. Always fatal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NumericalInstability {
    pub epoch: usize,
    pub phase: Phase,
    pub loss: f64,
}

impl fmt::Display for NumericalInstability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "numerical instability in {} at epoch {}: loss {}",
            self.phase, self.epoch, self.loss
        )
    }
}

impl std::error::Error for NumericalInstability {}

/// A non-finite loss is unstable in any phase. During evaluation a negative
/// per-example loss is unstable too: Bernoulli and Gaussian terms keep the
/// expected negative ELBO non-negative.
pub fn check_stability(epoch: usize, phase: Phase, loss: f64) -> Result<(), NumericalInstability> {
    let negative = phase == Phase::Evaluation && loss < 0.0;
    if !loss.is_finite() || negative {
        return Err(NumericalInstability { epoch, phase, loss });
    }
    Ok(())
}

// --- DRIVER ---

/// Losses collected over one call to [`Trainer::fit`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingSummary {
    /// Average per-example training loss, one entry per epoch run.
    pub train_losses: Vec<f64>,
    /// `(epoch, average per-example test loss)` for every evaluation.
    pub test_losses: Vec<(usize, f64)>,
    /// Epochs whose snapshot was written successfully.
    pub checkpoint_epochs: Vec<usize>,
    pub best_test_loss: Option<f64>,
}

/// Epoch loop over an [`Svi`] with periodic evaluation, best-loss
/// checkpointing and an optional reconstruction preview.
pub struct Trainer<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<RgbdVae<B>, B>,
{
    svi: Svi<B, O>,
    config: TrainingConfig,
    state: TrainingState,
    checkpoints: Option<Box<dyn CheckpointStore<B, O>>>,
    visualizer: Option<Box<dyn Visualizer>>,
}

impl<B> Trainer<B, OptimizerAdaptor<Adam, RgbdVae<B>, B>>
where
    B: AutodiffBackend,
{
    /// Seed the backend, build the VAE and its Adam optimizer.
    pub fn new(config: TrainingConfig, device: &B::Device) -> anyhow::Result<Self> {
        config.validate()?;
        B::seed(config.seed);

        let model = RgbdVae::<B>::new(&config.model, device)?;
        info!(
            "built RGB-D VAE: latent_dim={}, image={:?}, {} parameters",
            model.latent_dim(),
            model.image_shape(),
            model.num_params()
        );
        let optimizer = config.optimizer.init();
        let svi = Svi::new(model, optimizer, config.elbo()?, config.learning_rate);

        Ok(Self::from_svi(svi, config))
    }
}

impl<B, O> Trainer<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<RgbdVae<B>, B>,
{
    pub fn from_svi(svi: Svi<B, O>, config: TrainingConfig) -> Self {
        Self {
            svi,
            config,
            state: TrainingState::default(),
            checkpoints: None,
            visualizer: None,
        }
    }

    pub fn with_checkpoints(mut self, store: impl CheckpointStore<B, O> + 'static) -> Self {
        self.checkpoints = Some(Box::new(store));
        self
    }

    pub fn with_visualizer(mut self, visualizer: impl Visualizer + 'static) -> Self {
        self.visualizer = Some(Box::new(visualizer));
        self
    }

    /// Continue from a snapshot: weights, optimizer moments, next epoch and
    /// best-loss watermark all come from `checkpointer`.
    pub fn resume(mut self, checkpointer: &FileCheckpointer, device: &B::Device) -> anyhow::Result<Self> {
        let elbo = self.svi.elbo();
        let (model, optimizer) = self.svi.into_parts();
        let (model, optimizer, state) = checkpointer
            .restore(model, optimizer, device)
            .with_context(|| format!("failed to resume from {}", checkpointer.dir().display()))?;

        info!(
            "resuming at epoch {} (best test loss {:?})",
            state.epoch, state.best_test_loss
        );
        self.svi = Svi::new(model, optimizer, elbo, self.config.learning_rate);
        self.state = state;
        Ok(self)
    }

    pub fn svi(&self) -> &Svi<B, O> {
        &self.svi
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn into_svi(self) -> Svi<B, O> {
        self.svi
    }

    /// Run epochs `state.epoch..num_epochs`.
    ///
    /// Returns `Err` carrying a [`NumericalInstability`] as soon as a loss is
    /// unstable; no further epochs run.
    pub fn fit(&mut self, train: &TrainLoader<B>, test: &TestLoader<B>) -> anyhow::Result<TrainingSummary> {
        let mut summary = TrainingSummary::default();
        info!(
            "Starting training: epochs {}..{}, evaluating every {}",
            self.state.epoch, self.config.num_epochs, self.config.test_frequency
        );

        for epoch in self.state.epoch..self.config.num_epochs {
            let train_loss = self.train_epoch(epoch, train)?;
            summary.train_losses.push(train_loss);
            info!("[epoch {epoch:03}]  average training loss: {train_loss:.4}");

            self.state.epoch = epoch + 1;

            if epoch % self.config.test_frequency != 0 {
                continue;
            }

            let test_loss = self.evaluate(test)?;
            summary.test_losses.push((epoch, test_loss));
            info!("[epoch {epoch:03}] average test loss: {test_loss:.4}");

            if let Err(instability) = check_stability(epoch, Phase::Evaluation, test_loss) {
                error!("{instability}, aborting");
                return Err(instability.into());
            }

            let improved = self.state.best_test_loss.is_none_or(|best| test_loss < best);
            if improved && self.record_best(epoch, test_loss) {
                summary.checkpoint_epochs.push(epoch);
            }

            if let Some(visualizer) = &self.visualizer {
                if let Err(err) = self.preview(visualizer.as_ref(), test) {
                    warn!("reconstruction preview failed at epoch {epoch}: {err:#}");
                }
            }
        }

        summary.best_test_loss = self.state.best_test_loss;
        Ok(summary)
    }

    /// One pass of SVI steps; returns the average per-example loss.
    pub fn train_epoch(&mut self, epoch: usize, train: &TrainLoader<B>) -> anyhow::Result<f64> {
        let pb = ProgressBar::no_length();
        if !self.config.show_progress {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }

        let mut epoch_loss = 0.0;
        let mut examples = 0usize;

        for x in train.iter() {
            let batch_size = self.check_batch_shape(x.dims())?;
            let loss = self.svi.step(x);

            if let Err(instability) = check_stability(epoch, Phase::Training, loss) {
                pb.finish_and_clear();
                error!("{instability}, aborting");
                return Err(instability.into());
            }

            epoch_loss += loss;
            examples += batch_size;
            pb.inc(batch_size as u64);
        }
        pb.finish_and_clear();

        ensure!(examples > 0, "training loader yielded no examples");
        Ok(epoch_loss / examples as f64)
    }

    /// Average per-example loss over `test` with the model in evaluation mode.
    pub fn evaluate(&self, test: &TestLoader<B>) -> anyhow::Result<f64> {
        let mut test_loss = 0.0;
        let mut examples = 0usize;

        for x in test.iter() {
            let batch_size = self.check_batch_shape(x.dims())?;
            test_loss += self.svi.evaluate_loss(x);
            examples += batch_size;
        }

        ensure!(examples > 0, "test loader yielded no examples");
        Ok(test_loss / examples as f64)
    }

    /// Batch size of a loader batch, or an error if its images do not match the model.
    fn check_batch_shape(&self, dims: [usize; 4]) -> anyhow::Result<usize> {
        let size = self.config.model.image_size;
        ensure!(
            dims[1..] == [RGBD_CHANNELS, size, size],
            "loader yielded a batch of shape {dims:?}, the model expects [N, {RGBD_CHANNELS}, {size}, {size}]"
        );
        Ok(dims[0])
    }

    /// Persist the current snapshot; moves the watermark only if the write succeeded.
    fn record_best(&mut self, epoch: usize, test_loss: f64) -> bool {
        let candidate = TrainingState {
            epoch: epoch + 1,
            best_test_loss: Some(test_loss),
        };

        let Some(store) = &self.checkpoints else {
            self.state = candidate;
            return false;
        };

        match store.save(self.svi.model(), self.svi.optimizer(), &candidate) {
            Ok(()) => {
                info!("SAVING EPOCH {epoch} (test loss {test_loss:.4})");
                self.state = candidate;
                true
            }
            Err(err) => {
                warn!(
                    "checkpoint at epoch {epoch} failed, best test loss stays {:?}: {err:#}",
                    self.state.best_test_loss
                );
                false
            }
        }
    }

    fn preview(&self, visualizer: &dyn Visualizer, test: &TestLoader<B>) -> anyhow::Result<()> {
        let batch = test.iter().next().context("test loader is empty")?;
        let input = batch.narrow(0, 0, 1);

        let model: RgbdVae<B::InnerBackend> = self.svi.model().valid();
        let reconstruction = model.reconstruct(input.clone());

        visualizer.render(
            &RgbdImage::from_batch(input)?,
            &RgbdImage::from_batch(reconstruction)?,
        )
    }
}

/// Reconstruct the first image of a batch on any backend; used by the
/// inference tool outside the training loop.
pub fn reconstruct_first<B: Backend>(model: &RgbdVae<B>, batch: Tensor<B, 4>) -> anyhow::Result<(RgbdImage, RgbdImage)> {
    let input = batch.narrow(0, 0, 1);
    let reconstruction = model.reconstruct(input.clone());
    Ok((RgbdImage::from_batch(input)?, RgbdImage::from_batch(reconstruction)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestAutodiffBackend;
    use crate::rgbd_data::{RgbdBatcher, synthetic_items};
    use burn::data::{dataloader::DataLoaderBuilder, dataset::InMemDataset};

    type Adaptor = OptimizerAdaptor<Adam, RgbdVae<TestAutodiffBackend>, TestAutodiffBackend>;

    fn tiny_config() -> TrainingConfig {
        let model = VaeConfig::new()
            .with_image_size(16)
            .with_latent_dim(4)
            .with_encoder_depths(vec![4, 8]);
        TrainingConfig::new(model, AdamConfig::new())
            .with_batch_size(4)
            .with_num_epochs(2)
            .with_test_frequency(1)
    }

    #[test]
    fn exploding_log_variance_aborts_fit() {
        let device = Default::default();
        let config = tiny_config();

        let mut model = RgbdVae::<TestAutodiffBackend>::new(&config.model, &device).unwrap();
        model.encoder = model.encoder.with_constant_logvar(1e4);
        let optimizer: Adaptor = config.optimizer.init();
        let svi = Svi::new(model, optimizer, config.elbo().unwrap(), config.learning_rate);
        let mut trainer = Trainer::from_svi(svi, config);

        let items = synthetic_items(8, 16);
        let train: TrainLoader<TestAutodiffBackend> = DataLoaderBuilder::new(RgbdBatcher::new())
            .batch_size(4)
            .build(InMemDataset::new(items.clone()));
        let test: TestLoader<TestAutodiffBackend> = DataLoaderBuilder::new(RgbdBatcher::new())
            .batch_size(4)
            .build(InMemDataset::new(items));

        // exp(0.5 * 1e4) overflows, so the held-out estimate is already degenerate
        let eval_loss = trainer.evaluate(&test).unwrap();
        assert!(check_stability(0, Phase::Evaluation, eval_loss).is_err());

        let err = trainer.fit(&train, &test).unwrap_err();
        let instability = err.downcast_ref::<NumericalInstability>().unwrap();
        assert_eq!(instability.epoch, 0);
        assert_eq!(instability.phase, Phase::Training);
        assert!(!instability.loss.is_finite());
        assert_eq!(trainer.state().best_test_loss, None);
    }

    #[test]
    fn stability_rules() {
        assert!(check_stability(0, Phase::Training, 10.0).is_ok());
        assert!(check_stability(0, Phase::Evaluation, 0.0).is_ok());
        assert!(check_stability(0, Phase::Training, -3.0).is_ok());

        let err = check_stability(4, Phase::Evaluation, -0.5).unwrap_err();
        assert_eq!(err.epoch, 4);
        assert_eq!(err.phase, Phase::Evaluation);

        assert!(check_stability(1, Phase::Training, f64::NAN).is_err());
        assert!(check_stability(1, Phase::Evaluation, f64::INFINITY).is_err());
    }

    #[test]
    fn config_validation() {
        let config = TrainingConfig::new(VaeConfig::new(), AdamConfig::new());
        assert!(config.validate().is_ok());
        assert!(config.clone().with_num_particles(0).validate().is_err());
        assert!(config.clone().with_test_frequency(0).validate().is_err());
        assert!(config.clone().with_learning_rate(-1.0).validate().is_err());
        assert!(TrainingConfig { model: VaeConfig::new().with_latent_dim(0), ..config }.validate().is_err());
    }

    #[test]
    fn instability_message_names_phase_and_epoch() {
        let err = NumericalInstability {
            epoch: 7,
            phase: Phase::Evaluation,
            loss: -1.25,
        };
        assert_eq!(err.to_string(), "numerical instability in evaluation at epoch 7: loss -1.25");
    }
}
