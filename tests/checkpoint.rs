mod common;

use std::sync::Mutex;

use burn::{
    module::AutodiffModule,
    optim::Optimizer,
    tensor::{Tensor, TensorData, backend::Backend},
};
use rgbd_vae::checkpoint::{CHECKPOINT_DIR, CheckpointStore, FileCheckpointer, TrainingState};
use rgbd_vae::rgbd_data::synthetic_items;
use rgbd_vae::{RgbdVae, Svi, Trainer};

use common::{SIZE, TestAutodiffBackend, TestBackend, adam, loaders, small_config};

// The NdArray backend keeps one global RNG; tests comparing seeded runs
// must not interleave their draws.
static SEEDED: Mutex<()> = Mutex::new(());

/// Runs `f` on a one-thread rayon pool so NdArray reductions always sum in
/// the same order.
fn single_threaded<R: Send>(f: impl FnOnce() -> R + Send) -> R {
    rayon::ThreadPoolBuilder::new()
        .num_threads(1)
        .build()
        .unwrap()
        .install(f)
}

fn batch(seed_offset: usize) -> TensorData {
    let items = synthetic_items(4 + seed_offset, SIZE);
    let pixels: Vec<f32> = items[seed_offset..]
        .iter()
        .flat_map(|item| item.pixels.clone())
        .collect();
    TensorData::new(pixels, vec![4, 4, SIZE, SIZE])
}

fn decoded_origin<O>(svi: &Svi<TestAutodiffBackend, O>) -> Vec<f32>
where
    O: Optimizer<RgbdVae<TestAutodiffBackend>, TestAutodiffBackend>,
{
    let model = svi.model().valid();
    let z = Tensor::<TestBackend, 2>::zeros([1, model.latent_dim()], &Default::default());
    model.decoder.forward(z).into_data().to_vec().unwrap()
}

#[test]
fn restored_checkpoint_takes_identical_next_step() {
    let _guard = SEEDED.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    single_threaded(restore_and_step);
}

fn restore_and_step() {
    let device = Default::default();
    let config = small_config();
    let dir = tempfile::tempdir().unwrap();
    let checkpointer = FileCheckpointer::new(dir.path().join(CHECKPOINT_DIR));

    TestAutodiffBackend::seed(3);
    let model = RgbdVae::<TestAutodiffBackend>::new(&config.model, &device).unwrap();
    let mut original = Svi::new(model, adam(), config.elbo().unwrap(), config.learning_rate);
    for offset in 0..3 {
        original.step(Tensor::from_data(batch(offset), &device));
    }

    let state = TrainingState {
        epoch: 1,
        best_test_loss: Some(42.0),
    };
    checkpointer
        .save(original.model(), original.optimizer(), &state)
        .unwrap();
    assert!(checkpointer.exists());

    // A differently initialized network, overwritten by the snapshot.
    TestAutodiffBackend::seed(99);
    let fresh = RgbdVae::<TestAutodiffBackend>::new(&config.model, &device).unwrap();
    let (model, optimizer, restored_state) = checkpointer
        .restore(fresh, adam(), &device)
        .unwrap();
    let mut restored = Svi::new(model, optimizer, config.elbo().unwrap(), config.learning_rate);

    assert_eq!(restored_state, state);
    assert_eq!(decoded_origin(&original), decoded_origin(&restored));

    TestAutodiffBackend::seed(7);
    let loss_original = original.step(Tensor::from_data(batch(5), &device));
    TestAutodiffBackend::seed(7);
    let loss_restored = restored.step(Tensor::from_data(batch(5), &device));

    assert_eq!(loss_original, loss_restored);
    assert_eq!(decoded_origin(&original), decoded_origin(&restored));
}

#[test]
fn seeded_runs_are_identical() {
    let _guard = SEEDED.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let device = Default::default();

    let run = || {
        let (train, test) = loaders(synthetic_items(10, SIZE), synthetic_items(5, SIZE), 5);
        let mut trainer = Trainer::<TestAutodiffBackend, _>::new(small_config().with_num_epochs(2), &device).unwrap();
        trainer.fit(&train, &test).unwrap()
    };

    assert_eq!(single_threaded(run), single_threaded(run));
}

#[test]
fn resume_continues_from_saved_epoch() {
    let _guard = SEEDED.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let device = Default::default();
    let dir = tempfile::tempdir().unwrap();
    let checkpointer = FileCheckpointer::new(dir.path().join(CHECKPOINT_DIR));

    let (train, test) = loaders(synthetic_items(10, SIZE), synthetic_items(5, SIZE), 5);
    let mut first = Trainer::<TestAutodiffBackend, _>::new(small_config().with_num_epochs(2), &device)
        .unwrap()
        .with_checkpoints(checkpointer.clone());
    let first_summary = first.fit(&train, &test).unwrap();
    let saved_epoch = first_summary.checkpoint_epochs.last().copied().unwrap() + 1;

    let mut second = Trainer::<TestAutodiffBackend, _>::new(small_config().with_num_epochs(4), &device)
        .unwrap()
        .resume(&checkpointer, &device)
        .unwrap();
    assert_eq!(second.state().epoch, saved_epoch);
    assert_eq!(second.state().best_test_loss, first_summary.best_test_loss);

    let second_summary = second.fit(&train, &test).unwrap();
    assert_eq!(second_summary.train_losses.len(), 4 - saved_epoch);
    assert_eq!(second.state().epoch, 4);
    assert!(second_summary.best_test_loss <= first_summary.best_test_loss);
}

#[test]
fn resume_without_snapshot_fails() {
    let _guard = SEEDED.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let device = Default::default();
    let dir = tempfile::tempdir().unwrap();

    let trainer = Trainer::<TestAutodiffBackend, _>::new(small_config(), &device).unwrap();
    assert!(trainer.resume(&FileCheckpointer::new(dir.path().join(CHECKPOINT_DIR)), &device).is_err());
}

#[test]
fn inference_loads_weights_on_inner_backend() {
    let _guard = SEEDED.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let device = Default::default();
    let config = small_config();
    let dir = tempfile::tempdir().unwrap();
    let checkpointer = FileCheckpointer::new(dir.path().join(CHECKPOINT_DIR));

    let model = RgbdVae::<TestAutodiffBackend>::new(&config.model, &device).unwrap();
    let svi = Svi::new(model, adam(), config.elbo().unwrap(), config.learning_rate);
    checkpointer
        .save(svi.model(), svi.optimizer(), &TrainingState::default())
        .unwrap();

    let loaded = checkpointer
        .load_model(RgbdVae::<TestBackend>::new(&config.model, &device).unwrap(), &device)
        .unwrap();
    let z = Tensor::<TestBackend, 2>::zeros([1, loaded.latent_dim()], &device);
    let values: Vec<f32> = loaded.decoder.forward(z).into_data().to_vec().unwrap();
    assert_eq!(values, decoded_origin(&svi));
}
