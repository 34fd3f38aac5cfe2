use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use burn::{
    module::Module,
    optim::Optimizer,
    record::{BinFileRecorder, FullPrecisionSettings, Recorder},
    tensor::backend::{AutodiffBackend, Backend},
};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::conv_model::RgbdVae;

/// Subdirectory of a training output directory that holds the snapshot.
pub const CHECKPOINT_DIR: &str = "checkpoint";

const MODEL_FILE: &str = "model";
const OPTIMIZER_FILE: &str = "optimizer";
const STATE_FILE: &str = "state.json";

/// Progress persisted next to the weights so training can resume.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    /// First epoch that has not run yet.
    pub epoch: usize,
    /// Lowest evaluation loss that was successfully checkpointed.
    pub best_test_loss: Option<f64>,
}

/// Destination for best-so-far snapshots.
///
/// `save` must overwrite any previous snapshot; the trainer only moves its
/// best-loss watermark once `save` has returned `Ok`.
pub trait CheckpointStore<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<RgbdVae<B>, B>,
{
    fn save(&self, model: &RgbdVae<B>, optimizer: &O, state: &TrainingState) -> anyhow::Result<()>;
}

/// Checkpoints in a directory: `model.bin`, `optimizer.bin` (burn binary
/// records at full precision) and `state.json`.
///
/// The directory is owned by the checkpointer. A save writes all three files
/// into a sibling staging directory and only then swaps it in, so the
/// directory always holds one complete snapshot.
#[derive(Debug, Clone)]
pub struct FileCheckpointer {
    dir: PathBuf,
}

impl FileCheckpointer {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn recorder() -> BinFileRecorder<FullPrecisionSettings> {
        BinFileRecorder::<FullPrecisionSettings>::new()
    }

    /// `<parent>/.<name>.<tag>`, next to the snapshot directory.
    fn sibling(&self, tag: &str) -> anyhow::Result<PathBuf> {
        let name = self
            .dir
            .file_name()
            .with_context(|| format!("checkpoint directory {} has no name", self.dir.display()))?;
        let parent = self
            .dir
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        Ok(parent.join(format!(".{}.{tag}", name.to_string_lossy())))
    }

    fn write_snapshot<B, O>(dir: &Path, model: &RgbdVae<B>, optimizer: &O, state: &TrainingState) -> anyhow::Result<()>
    where
        B: AutodiffBackend,
        O: Optimizer<RgbdVae<B>, B>,
    {
        let recorder = Self::recorder();
        model
            .clone()
            .save_file(dir.join(MODEL_FILE), &recorder)
            .context("failed to save model weights")?;
        recorder
            .record(optimizer.to_record(), dir.join(OPTIMIZER_FILE))
            .context("failed to save optimizer state")?;

        let state_json = serde_json::to_string_pretty(state)?;
        fs::write(dir.join(STATE_FILE), state_json).context("failed to save training state")?;
        Ok(())
    }

    /// Replace the snapshot directory with `staging`. On failure the previous
    /// snapshot is put back.
    fn commit(&self, staging: &Path) -> anyhow::Result<()> {
        if !self.dir.exists() {
            return fs::rename(staging, &self.dir)
                .with_context(|| format!("failed to move snapshot into {}", self.dir.display()));
        }

        let previous = self.sibling("previous")?;
        if previous.exists() {
            fs::remove_dir_all(&previous)
                .with_context(|| format!("failed to clear {}", previous.display()))?;
        }
        fs::rename(&self.dir, &previous)
            .with_context(|| format!("failed to move aside {}", self.dir.display()))?;

        if let Err(err) = fs::rename(staging, &self.dir) {
            if let Err(restore_err) = fs::rename(&previous, &self.dir) {
                warn!(
                    "previous snapshot left at {}: {restore_err}",
                    previous.display()
                );
            }
            return Err(err).with_context(|| format!("failed to move snapshot into {}", self.dir.display()));
        }

        if let Err(err) = fs::remove_dir_all(&previous) {
            warn!("failed to remove old snapshot {}: {err}", previous.display());
        }
        Ok(())
    }

    /// Whether a complete snapshot is present.
    pub fn exists(&self) -> bool {
        self.dir.join(format!("{MODEL_FILE}.bin")).exists()
            && self.dir.join(format!("{OPTIMIZER_FILE}.bin")).exists()
            && self.dir.join(STATE_FILE).exists()
    }

    /// Load only the network weights into `model`.
    pub fn load_model<B: Backend>(
        &self,
        model: RgbdVae<B>,
        device: &B::Device,
    ) -> anyhow::Result<RgbdVae<B>> {
        let path = self.dir.join(MODEL_FILE);
        model
            .load_file(path.clone(), &Self::recorder(), device)
            .with_context(|| format!("failed to load weights from {}", path.display()))
    }

    /// Restore weights, optimizer moments and progress written by [`CheckpointStore::save`].
    pub fn restore<B, O>(
        &self,
        model: RgbdVae<B>,
        optimizer: O,
        device: &B::Device,
    ) -> anyhow::Result<(RgbdVae<B>, O, TrainingState)>
    where
        B: AutodiffBackend,
        O: Optimizer<RgbdVae<B>, B>,
    {
        let model = self.load_model(model, device)?;

        let optimizer_path = self.dir.join(OPTIMIZER_FILE);
        let record = Self::recorder()
            .load(optimizer_path.clone(), device)
            .with_context(|| format!("failed to load optimizer state from {}", optimizer_path.display()))?;
        let optimizer = optimizer.load_record(record);

        let state_path = self.dir.join(STATE_FILE);
        let contents = fs::read_to_string(&state_path)
            .with_context(|| format!("failed to read {}", state_path.display()))?;
        let state: TrainingState = serde_json::from_str(&contents)?;

        Ok((model, optimizer, state))
    }
}

impl<B, O> CheckpointStore<B, O> for FileCheckpointer
where
    B: AutodiffBackend,
    O: Optimizer<RgbdVae<B>, B>,
{
    fn save(&self, model: &RgbdVae<B>, optimizer: &O, state: &TrainingState) -> anyhow::Result<()> {
        let staging = self.sibling("staging")?;
        if staging.exists() {
            fs::remove_dir_all(&staging)
                .with_context(|| format!("failed to clear {}", staging.display()))?;
        }
        fs::create_dir_all(&staging)
            .with_context(|| format!("failed to create {}", staging.display()))?;

        if let Err(err) = Self::write_snapshot(&staging, model, optimizer, state) {
            if let Err(cleanup_err) = fs::remove_dir_all(&staging) {
                warn!("failed to remove {}: {cleanup_err}", staging.display());
            }
            return Err(err);
        }
        self.commit(&staging)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conv_model::VaeConfig;
    use crate::{TestAutodiffBackend, TestBackend};
    use burn::module::AutodiffModule;
    use burn::optim::{Adam, AdamConfig, adaptor::OptimizerAdaptor};
    use burn::tensor::Tensor;

    #[test]
    fn state_round_trips_through_json() {
        let state = TrainingState {
            epoch: 12,
            best_test_loss: Some(1234.5),
        };
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(serde_json::from_str::<TrainingState>(&json).unwrap(), state);
    }

    type Adaptor = OptimizerAdaptor<Adam, RgbdVae<TestAutodiffBackend>, TestAutodiffBackend>;

    fn snapshot_pair() -> (RgbdVae<TestAutodiffBackend>, Adaptor) {
        let config = VaeConfig::new()
            .with_image_size(8)
            .with_latent_dim(2)
            .with_encoder_depths(vec![2]);
        let model = RgbdVae::new(&config, &Default::default()).unwrap();
        (model, AdamConfig::new().init())
    }

    fn weights(model: RgbdVae<TestAutodiffBackend>) -> Vec<f32> {
        let z = Tensor::<TestBackend, 2>::ones([1, 2], &Default::default());
        model.valid().decoder.logits(z).into_data().to_vec().unwrap()
    }

    #[test]
    fn second_save_replaces_the_whole_snapshot() {
        let root = tempfile::tempdir().unwrap();
        let checkpointer = FileCheckpointer::new(root.path().join("snapshot"));

        let (first, optimizer) = snapshot_pair();
        let first_state = TrainingState {
            epoch: 1,
            best_test_loss: Some(100.0),
        };
        checkpointer.save(&first, &optimizer, &first_state).unwrap();

        let (second, optimizer) = snapshot_pair();
        let second_state = TrainingState {
            epoch: 6,
            best_test_loss: Some(80.0),
        };
        checkpointer.save(&second, &optimizer, &second_state).unwrap();

        let (fresh, optimizer) = snapshot_pair();
        let (restored, _, state) = checkpointer
            .restore(fresh, optimizer, &Default::default())
            .unwrap();
        assert_eq!(state, second_state);
        assert_eq!(weights(restored), weights(second));

        // nothing left next to the snapshot
        let entries: Vec<_> = fs::read_dir(root.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn failed_save_leaves_previous_snapshot_intact() {
        let root = tempfile::tempdir().unwrap();
        let checkpointer = FileCheckpointer::new(root.path().join("snapshot"));

        let (first, optimizer) = snapshot_pair();
        let first_state = TrainingState {
            epoch: 1,
            best_test_loss: Some(100.0),
        };
        checkpointer.save(&first, &optimizer, &first_state).unwrap();

        // a plain file where the staging directory should go
        fs::write(checkpointer.sibling("staging").unwrap(), b"in the way").unwrap();

        let (second, optimizer) = snapshot_pair();
        let second_state = TrainingState {
            epoch: 6,
            best_test_loss: Some(80.0),
        };
        assert!(checkpointer.save(&second, &optimizer, &second_state).is_err());

        let (fresh, optimizer) = snapshot_pair();
        let (restored, _, state) = checkpointer
            .restore(fresh, optimizer, &Default::default())
            .unwrap();
        assert_eq!(state, first_state);
        assert_eq!(weights(restored), weights(first));
    }

    #[test]
    fn missing_snapshot_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!FileCheckpointer::new(dir.path().join("nothing")).exists());
    }
}
