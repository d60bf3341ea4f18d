//! 1デバイスでの k-fold 学習から OOF 書き出しまでの通しテスト

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use rtoxic_core::config::{CheckpointConfig, CheckpointScope, MixedPrecisionConfig, OofConfig};
use rtoxic_core::driver::FoldDriver;
use rtoxic_core::model::{ModelFactory, PooledClassifier, PooledClassifierFactory};
use rtoxic_core::oof::{aggregate, write_tables};
use rtoxic_core::scheduler::{FoldScheduler, plan_folds};
use rtoxic_core::store::{ModelStore, SeededStore};
use rtoxic_core::{
    Dataset, DeviceId, DevicePool, Example, ExampleId, ExperimentConfig, Language, TrainError,
};

/// 構築時に貸出中トークン数を記録するファクトリ
struct Observing<'p> {
    inner: PooledClassifierFactory,
    pool: &'p DevicePool,
    builds: AtomicUsize,
    max_leased: AtomicUsize,
}

impl ModelFactory for Observing<'_> {
    type Model = PooledClassifier;

    fn build(&self, device: DeviceId, seed: u64) -> Result<PooledClassifier, TrainError> {
        let leased = self.pool.capacity() - self.pool.available();
        self.max_leased.fetch_max(leased, Ordering::SeqCst);
        self.builds.fetch_add(1, Ordering::SeqCst);
        self.inner.build(device, seed)
    }
}

fn dataset(n: u64) -> Dataset {
    Dataset::new(
        (0..n)
            .map(|i| {
                let lang = Language::ALL[(i % 7) as usize];
                let features = vec![1, (i % 29) as u32 + 3, ((i * 5) % 31) as u32, 2];
                Example::new(ExampleId::Num(i), features, (i % 3 == 0) as u8 as f32, lang, true, false)
            })
            .collect(),
    )
    .unwrap()
}

#[test]
fn kfold_on_single_device_runs_sequentially_and_covers_every_example() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = ExperimentConfig {
        model_name: "e2e".to_string(),
        max_seq_len: 4,
        num_folds: 4,
        num_epochs: 2,
        batch_size: 8,
        accumulation_steps: 1,
        devices: vec![0],
        mixed_precision: MixedPrecisionConfig {
            enabled: false,
            ..MixedPrecisionConfig::default()
        },
        checkpoint: CheckpointConfig {
            scope: CheckpointScope::None,
            output_dir: tmp.path().join("models"),
            ..CheckpointConfig::default()
        },
        oof: OofConfig {
            output_dir: tmp.path().join("oof"),
            ..OofConfig::default()
        },
        ..ExperimentConfig::default()
    };
    let data = dataset(100);

    let (folds, pool) = plan_folds(&cfg, &data).unwrap();
    assert_eq!(folds.len(), 4);
    assert_eq!(pool.capacity(), 1);

    let store: Arc<dyn ModelStore> = Arc::new(SeededStore::new(32, 4));
    let factory = Observing {
        inner: PooledClassifierFactory::new(store, "e2e", 1),
        pool: &pool,
        builds: AtomicUsize::new(0),
        max_leased: AtomicUsize::new(0),
    };
    let driver = FoldDriver::new(&cfg, &factory);
    let report = FoldScheduler::new(driver, &pool)
        .with_workers(cfg.worker_count())
        .run(&folds, &data, cfg.num_epochs);

    assert!(report.failures().is_empty());
    assert_eq!(factory.builds.load(Ordering::SeqCst), 4);
    assert_eq!(factory.max_leased.load(Ordering::SeqCst), 1);
    assert_eq!(pool.available(), 1);

    let results = report.into_complete().unwrap();
    let ids: Vec<usize> = results.iter().map(|r| r.fold_id).collect();
    assert_eq!(ids, vec![0, 1, 2, 3]);
    for r in &results {
        assert_eq!(r.device, DeviceId(0));
        assert_eq!(r.epochs.len(), 2);
        assert_eq!(r.train_size + r.val_size, 100);
    }

    let tables = aggregate(&results, cfg.num_epochs).unwrap();
    assert_eq!(tables.len(), 2);
    for t in &tables {
        assert_eq!(t.len(), 100);
        let unique: HashSet<&ExampleId> = t.rows.iter().map(|(id, _)| id).collect();
        assert_eq!(unique.len(), 100);
        assert!(t.rows.windows(2).all(|w| w[0].0 < w[1].0));
    }

    let paths = write_tables(&tables, &cfg.oof, &cfg.model_name, cfg.max_seq_len).unwrap();
    assert_eq!(paths.len(), 2);
    assert!(paths[0].ends_with("kfolds_e2e_1_4.csv"));
    let text = std::fs::read_to_string(&paths[1]).unwrap();
    assert_eq!(text.lines().count(), 101);
    assert!(!tmp.path().join("models").exists());
}

#[test]
fn identical_seeds_reproduce_oof_predictions() {
    let cfg = ExperimentConfig {
        model_name: "repro".to_string(),
        num_folds: 3,
        num_epochs: 1,
        batch_size: 6,
        devices: vec![0, 1],
        mixed_precision: MixedPrecisionConfig {
            enabled: false,
            ..MixedPrecisionConfig::default()
        },
        checkpoint: CheckpointConfig {
            scope: CheckpointScope::None,
            ..CheckpointConfig::default()
        },
        ..ExperimentConfig::default()
    };
    let data = dataset(30);

    let run = || {
        let (folds, pool) = plan_folds(&cfg, &data).unwrap();
        let factory = PooledClassifierFactory::new(Arc::new(SeededStore::new(32, 4)), "repro", 1);
        let report = FoldScheduler::new(FoldDriver::new(&cfg, &factory), &pool)
            .with_workers(cfg.worker_count())
            .run(&folds, &data, cfg.num_epochs);
        aggregate(&report.into_complete().unwrap(), cfg.num_epochs).unwrap()
    };

    assert_eq!(run(), run());
}
