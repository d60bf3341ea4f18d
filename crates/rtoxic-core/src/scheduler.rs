//! 並列フォールドスケジューラ
//!
//! フォールド番号をチケットとしてチャネルに流し、ワーカースレッドが1件ずつ
//! 取り出して `FoldDriver` を実行する。同時実行数はデバイストークン数で
//! 制限され、デバイスより多いフォールドは `acquire` で待つ。
//! 全フォールドの終了（成功・失敗・パニック）を待ってからフォールド番号順に並べる。

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread;

use crossbeam_channel as chan;

use crate::config::ExperimentConfig;
use crate::data::Dataset;
use crate::device::DevicePool;
use crate::driver::{FoldDriver, FoldResult};
use crate::error::{Error, FoldFailure, MetricError};
use crate::fold::{FoldAssignment, FoldPartitioner};
use crate::metrics::mean_defined;
use crate::model::ModelFactory;

/// 設定を検証してフォールド分割とデバイスプールを作る（ワーカー起動前に失敗させる）
pub fn plan_folds(
    config: &ExperimentConfig,
    data: &Dataset,
) -> Result<(Vec<FoldAssignment>, DevicePool), Error> {
    config.validate()?;
    config.check_label_dim(data.label_dim())?;
    let folds = FoldPartitioner::new(config.num_folds, config.seed).split(data.len())?;
    let pool = DevicePool::new(&config.device_ids())?;
    Ok((folds, pool))
}

/// フォールド × エポックのスコア表（成功したフォールドのみ）
#[derive(Clone, Debug, PartialEq)]
pub struct ScoreMatrix {
    pub fold_ids: Vec<usize>,
    pub scores: Vec<Vec<Result<f64, MetricError>>>,
    pub num_epochs: usize,
}

impl ScoreMatrix {
    /// エポックごとのフォールド平均（未定義のフォールドがあれば `None`）
    pub fn mean_per_epoch(&self) -> Vec<Option<f64>> {
        (0..self.num_epochs)
            .map(|e| mean_defined(self.scores.iter().filter_map(|row| row.get(e))))
            .collect()
    }
}

impl fmt::Display for ScoreMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn cell(v: Option<f64>) -> String {
            v.map_or_else(|| "   n/a".to_string(), |a| format!("{a:.4}"))
        }

        write!(f, "fold")?;
        for e in 0..self.num_epochs {
            write!(f, "  ep{:<4}", e + 1)?;
        }
        writeln!(f)?;
        for (id, row) in self.fold_ids.iter().zip(&self.scores) {
            write!(f, "{id:>4}")?;
            for v in row {
                write!(f, "  {:>6}", cell(v.ok()))?;
            }
            writeln!(f)?;
        }
        write!(f, "mean")?;
        for m in self.mean_per_epoch() {
            write!(f, "  {:>6}", cell(m))?;
        }
        Ok(())
    }
}

/// 全フォールドの結果（フォールド番号順）
#[derive(Debug)]
pub struct KfoldReport {
    pub folds: Vec<Result<FoldResult, FoldFailure>>,
    pub num_epochs: usize,
}

impl KfoldReport {
    pub fn failures(&self) -> Vec<&FoldFailure> {
        self.folds.iter().filter_map(|r| r.as_ref().err()).collect()
    }

    pub fn successes(&self) -> impl Iterator<Item = &FoldResult> {
        self.folds.iter().filter_map(|r| r.as_ref().ok())
    }

    pub fn score_matrix(&self) -> ScoreMatrix {
        let mut fold_ids = Vec::new();
        let mut scores = Vec::new();
        for r in self.successes() {
            fold_ids.push(r.fold_id);
            scores.push(r.epochs.iter().map(|e| e.auc).collect::<Vec<_>>());
        }
        ScoreMatrix {
            fold_ids,
            scores,
            num_epochs: self.num_epochs,
        }
    }

    /// 全フォールド成功なら結果を返し、1つでも失敗していれば `PartialFailure`
    pub fn into_complete(self) -> Result<Vec<FoldResult>, Error> {
        let total = self.folds.len();
        let mut ok = Vec::with_capacity(total);
        let mut failed = Vec::new();
        for r in self.folds {
            match r {
                Ok(v) => ok.push(v),
                Err(e) => failed.push(e),
            }
        }
        if failed.is_empty() {
            Ok(ok)
        } else {
            Err(Error::PartialFailure { failed, total })
        }
    }
}

/// パニックのペイロードからメッセージを取り出す
fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

/// 並列フォールドスケジューラ
pub struct FoldScheduler<'a, F: ModelFactory> {
    driver: FoldDriver<'a, F>,
    pool: &'a DevicePool,
    workers: usize,
}

impl<'a, F: ModelFactory> FoldScheduler<'a, F> {
    pub fn new(driver: FoldDriver<'a, F>, pool: &'a DevicePool) -> Self {
        Self {
            driver,
            pool,
            workers: pool.capacity(),
        }
    }

    /// ワーカー数の上限（デバイス数を超えない）
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.clamp(1, self.pool.capacity());
        self
    }

    /// 全フォールドを実行して結果を待つ
    pub fn run(&self, folds: &[FoldAssignment], data: &Dataset, num_epochs: usize) -> KfoldReport {
        let workers = self.workers.min(folds.len()).max(1);
        log::info!("Starting kfold training: {} folds on {workers} workers", folds.len());

        let (ticket_tx, ticket_rx) = chan::unbounded::<usize>();
        let (result_tx, result_rx) = chan::unbounded::<(usize, Result<FoldResult, FoldFailure>)>();
        for i in 0..folds.len() {
            // 受信側を保持しているので失敗しない
            let _ = ticket_tx.send(i);
        }
        drop(ticket_tx);

        thread::scope(|s| {
            for _ in 0..workers {
                let rx = ticket_rx.clone();
                let tx = result_tx.clone();
                s.spawn(move || {
                    while let Ok(i) = rx.recv() {
                        let fold = &folds[i];
                        let outcome =
                            catch_unwind(AssertUnwindSafe(|| self.driver.run(self.pool, fold, data)));
                        let result = match outcome {
                            Ok(Ok(r)) => Ok(r),
                            Ok(Err(e)) => Err(FoldFailure {
                                fold_id: fold.fold_id,
                                message: e.to_string(),
                            }),
                            Err(payload) => Err(FoldFailure {
                                fold_id: fold.fold_id,
                                message: panic_message(payload.as_ref()),
                            }),
                        };
                        if let Err(f) = &result {
                            log::error!("{f}");
                        }
                        if tx.send((i, result)).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        drop(result_tx);

        let mut slots: Vec<Option<Result<FoldResult, FoldFailure>>> =
            (0..folds.len()).map(|_| None).collect();
        for (i, r) in result_rx.iter() {
            slots[i] = Some(r);
        }
        let results = slots
            .into_iter()
            .zip(folds)
            .map(|(slot, fold)| {
                slot.unwrap_or_else(|| {
                    Err(FoldFailure {
                        fold_id: fold.fold_id,
                        message: "worker exited without a result".to_string(),
                    })
                })
            })
            .collect();

        let report = KfoldReport {
            folds: results,
            num_epochs,
        };
        let means: Vec<String> = report
            .score_matrix()
            .mean_per_epoch()
            .into_iter()
            .map(|m| m.map_or_else(|| "n/a".to_string(), |a| format!("{a:.4}")))
            .collect();
        log::info!("Mean fold ROC_AUC_SCORE: [{}]", means.join(" "));
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Example, ExampleId};
    use crate::device::DeviceId;
    use crate::driver::EpochResult;
    use crate::error::TrainError;
    use crate::lang::Language;
    use crate::model::PooledClassifier;
    use crate::optim::LrConfig;
    use crate::store::{ModelStore, SeededStore};
    use std::time::Duration;

    /// 指定フォールドでパニック / エラーを起こすファクトリ
    struct Flaky {
        panic_on: u64,
        fail_on: u64,
    }

    impl ModelFactory for Flaky {
        type Model = PooledClassifier;

        fn build(&self, _: DeviceId, seed: u64) -> Result<PooledClassifier, TrainError> {
            // seed = config.seed + fold_id
            let fold = seed - 1337;
            if fold == self.panic_on {
                panic!("simulated crash");
            }
            if fold == self.fail_on {
                return Err(TrainError::Store("simulated failure".into()));
            }
            PooledClassifier::new(SeededStore::new(16, 3).load("flaky")?, 1, seed)
        }
    }

    fn dataset(n: u64) -> Dataset {
        Dataset::new(
            (0..n)
                .map(|i| {
                    let features = vec![(i % 16) as u32, 2];
                    Example::new(ExampleId::Num(i), features, (i % 2) as f32, Language::En, true, false)
                })
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_failures_are_isolated_and_tokens_returned() {
        let cfg = ExperimentConfig {
            num_folds: 4,
            num_epochs: 1,
            batch_size: 4,
            devices: vec![0, 1],
            ..ExperimentConfig::default()
        };
        let data = dataset(16);
        let (folds, pool) = plan_folds(&cfg, &data).unwrap();
        let factory = Flaky {
            panic_on: 1,
            fail_on: 3,
        };
        let report = FoldScheduler::new(FoldDriver::new(&cfg, &factory), &pool).run(&folds, &data, 1);

        assert_eq!(pool.available(), 2);
        assert_eq!(report.folds.len(), 4);
        assert!(report.folds[0].is_ok());
        assert!(report.folds[2].is_ok());
        let failures = report.failures();
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].fold_id, 1);
        assert!(failures[0].message.contains("simulated crash"));
        assert_eq!(failures[1].fold_id, 3);

        assert_eq!(report.score_matrix().fold_ids, vec![0, 2]);
        match report.into_complete() {
            Err(Error::PartialFailure { failed, total }) => {
                assert_eq!(total, 4);
                assert_eq!(failed.len(), 2);
            }
            other => panic!("expected partial failure, got {other:?}"),
        }
    }

    #[test]
    fn test_plan_rejects_bad_config_before_dispatch() {
        let data = dataset(3);
        let cfg = ExperimentConfig {
            num_folds: 4,
            ..ExperimentConfig::default()
        };
        assert!(matches!(
            plan_folds(&cfg, &data),
            Err(Error::Config(crate::error::ConfigError::InvalidFoldCount { folds: 4, n_examples: 3 }))
        ));
    }

    #[test]
    fn test_plan_rejects_label_dim_mismatch() {
        // 二値ラベルのデータに言語別ヘッド
        let data = dataset(20);
        let mut cfg = ExperimentConfig::default();
        cfg.head.output_units = Language::COUNT;
        assert!(matches!(
            plan_folds(&cfg, &data),
            Err(Error::Config(crate::error::ConfigError::LengthMismatch { expected: 7, actual: 1, .. }))
        ));
    }

    fn epoch(fold_id: usize, e: usize, auc: Result<f64, MetricError>) -> EpochResult {
        EpochResult {
            fold_id,
            epoch: e,
            auc,
            train_loss: 0.0,
            lr: LrConfig::uniform(1e-3),
            predictions: vec![],
        }
    }

    fn fold(fold_id: usize, aucs: &[Result<f64, MetricError>]) -> FoldResult {
        FoldResult {
            fold_id,
            device: DeviceId(0),
            epochs: aucs.iter().enumerate().map(|(e, a)| epoch(fold_id, e, *a)).collect(),
            ema_auc: None,
            checkpoints: vec![],
            train_size: 0,
            val_size: 0,
            elapsed: Duration::ZERO,
        }
    }

    #[test]
    fn test_mean_per_epoch_marks_undefined() {
        let degenerate = Err(MetricError::Degenerate {
            positives: 0,
            negatives: 4,
        });
        let report = KfoldReport {
            folds: vec![Ok(fold(0, &[Ok(0.6), Ok(0.8)])), Ok(fold(1, &[Ok(0.7), degenerate]))],
            num_epochs: 2,
        };
        let matrix = report.score_matrix();
        let means = matrix.mean_per_epoch();
        assert!((means[0].unwrap() - 0.65).abs() < 1e-12);
        assert_eq!(means[1], None);
        let table = matrix.to_string();
        assert!(table.contains("0.6500"));
        assert!(table.contains("n/a"));
    }
}
