mod common;

use common::{batches, config, QuadraticModel};
use kiln_abstraction::{Tensor, TrainableModel};
use kiln_training::{
    compare, export_reduced_precision, CheckpointLabel, CheckpointLayout, CheckpointStore,
    StorageDtype, TrainingDriver, TrainingError,
};
use tempfile::TempDir;

fn samples(n: usize) -> Vec<Tensor> {
    (0..n).map(|i| Tensor::vector(vec![i as f32, 0.0])).collect()
}

#[test]
fn test_compare_renders_at_most_four_samples() {
    let temp = TempDir::new().unwrap();
    let layout = CheckpointLayout::new(temp.path().to_path_buf());
    let mut model = QuadraticModel::new(vec![0.5, 0.5]);

    let path = compare(&mut model, &samples(6), &layout).unwrap();

    assert_eq!(path, layout.comparison_path());
    assert_eq!(model.generate_calls, 4);
    let bytes = std::fs::read(&path).unwrap();
    // 2x2 grid of 2x2 tiles
    let header = b"P6\n4 4\n255\n";
    assert!(bytes.starts_with(header));
    assert_eq!(bytes.len(), header.len() + 4 * 4 * 3);
    assert!(model.is_training());
    assert_eq!(model.mode_switches, vec![false, true]);
}

#[test]
fn test_compare_restores_training_mode_when_generation_fails() {
    let temp = TempDir::new().unwrap();
    let layout = CheckpointLayout::new(temp.path().to_path_buf());
    let mut model = QuadraticModel::new(vec![0.5, 0.5]);
    model.fail_generate_from = Some(2);

    let err = compare(&mut model, &samples(6), &layout).unwrap_err();

    assert!(matches!(err, TrainingError::Render(_)));
    assert!(model.is_training());
    assert!(!layout.comparison_path().exists());
}

#[test]
fn test_compare_requires_a_sample() {
    let temp = TempDir::new().unwrap();
    let layout = CheckpointLayout::new(temp.path().to_path_buf());
    let mut model = QuadraticModel::new(vec![0.5, 0.5]);

    let err = compare(&mut model, &[], &layout).unwrap_err();
    assert!(matches!(err, TrainingError::Render(_)));
    assert!(model.is_training());
}

#[test]
fn test_compare_overwrites_previous_grid() {
    let temp = TempDir::new().unwrap();
    let layout = CheckpointLayout::new(temp.path().to_path_buf());
    let mut model = QuadraticModel::new(vec![-1.0, 0.0]);

    let first = std::fs::read(compare(&mut model, &samples(1), &layout).unwrap()).unwrap();
    model.weight.value.data_mut()[0] = 1.0;
    let second = std::fs::read(compare(&mut model, &samples(1), &layout).unwrap()).unwrap();
    assert_ne!(first, second);
}

fn trained_store(temp: &TempDir) -> (CheckpointStore, QuadraticModel) {
    let model = QuadraticModel::new(vec![1.0, -1.0]);
    let mut driver = TrainingDriver::new(config(temp.path(), 3, 100), model).unwrap();
    driver.run_epoch(batches(150), 0).into_result().unwrap();
    let store = driver.store().clone();
    (store, driver.finish().unwrap())
}

#[test]
fn test_export_is_deterministic_and_leaves_source_untouched() {
    let temp = TempDir::new().unwrap();
    let (store, _) = trained_store(&temp);
    let source = store.latest().unwrap().unwrap();
    let source_bytes = std::fs::read(&source.path).unwrap();

    let first = export_reduced_precision(&store, &source).unwrap();
    let first_bytes = std::fs::read(&first.path).unwrap();
    let second = export_reduced_precision(&store, &source).unwrap();
    let second_bytes = std::fs::read(&second.path).unwrap();

    assert_eq!(first.path, second.path);
    assert!(first.path.to_string_lossy().ends_with("epoch00000_step00000100_fp16.ckpt"));
    assert_eq!(first.dtype, StorageDtype::F16);
    assert_eq!(first_bytes, second_bytes);
    assert_eq!(std::fs::read(&source.path).unwrap(), source_bytes);
}

#[test]
fn test_export_is_not_rotated_and_can_be_restored() {
    let temp = TempDir::new().unwrap();
    let (store, mut model) = trained_store(&temp);
    let source = store.latest().unwrap().unwrap();
    let original = store.load(&source).unwrap();
    let exported = export_reduced_precision(&store, &source).unwrap();

    // saving past retention must not touch the export
    for step in 1000..1005 {
        store.save_model(&model, CheckpointLabel::new(9, step)).unwrap();
    }
    assert!(exported.path.exists());
    assert!(!source.path.exists());
    assert_eq!(store.list().unwrap().len(), 3);
    assert_eq!(store.resolve("epoch0_step100_fp16").unwrap(), exported);

    store.restore(&mut model, &exported).unwrap();
    let restored = model.state();
    for (name, tensor) in &original.tensors {
        for (want, got) in tensor.data().iter().zip(restored.get(name).unwrap().data()) {
            assert!((want - got).abs() <= want.abs() * 1e-3 + 1e-4, "{name}: {want} vs {got}");
        }
    }
}
