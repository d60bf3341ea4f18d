//! ホールドアウト実験
//!
//! フォールドを使わず1つの学習セットで学習し、エポックごとに複数の名前付き
//! 評価セット（原文の検証データと機械翻訳版など）で AUC を測る。
//! デバイスは k-fold と同じトークンプールから1つ借りる。

use std::path::PathBuf;
use std::time::Instant;

use indicatif::{MultiProgress, ProgressBar};

use crate::config::ExperimentConfig;
use crate::data::{Dataset, Example};
use crate::device::DevicePool;
use crate::driver::{Checkpointer, bar_style};
use crate::error::{MetricError, TrainError};
use crate::eval::evaluate;
use crate::model::{Classifier, ModelFactory};
use crate::optim::{Adam, LrConfig};
use crate::structured_log::{EpochRecord, StructuredLogger, now_ts};
use crate::train::{TrainOptions, Trainer};

/// 名前付き評価セット
#[derive(Clone, Debug)]
pub struct EvalSet {
    pub name: String,
    pub data: Dataset,
}

/// エポックごとの結果
#[derive(Clone, Debug)]
pub struct HoldoutEpoch {
    pub epoch: usize,
    pub train_loss: f32,
    pub lr: LrConfig,
    /// 評価セット順の (名前, AUC)
    pub scores: Vec<(String, Result<f64, MetricError>)>,
    pub checkpoint: Option<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct HoldoutReport {
    pub epochs: Vec<HoldoutEpoch>,
    /// EMA パラメータでの最終評価
    pub ema_scores: Option<Vec<(String, Result<f64, MetricError>)>>,
}

impl HoldoutReport {
    /// 評価セットごとのエポック別 AUC
    pub fn series(&self, name: &str) -> Vec<Result<f64, MetricError>> {
        self.epochs
            .iter()
            .filter_map(|e| e.scores.iter().find(|(n, _)| n == name).map(|(_, a)| *a))
            .collect()
    }
}

fn format_scores(scores: &[(String, Result<f64, MetricError>)]) -> String {
    scores
        .iter()
        .map(|(name, auc)| match auc {
            Ok(a) => format!("{name}: {a:.4}"),
            Err(_) => format!("{name}: n/a"),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// ホールドアウト実験
pub struct HoldoutExperiment<'a, F: ModelFactory> {
    config: &'a ExperimentConfig,
    factory: &'a F,
    checkpointer: Option<&'a Checkpointer>,
    progress: Option<&'a MultiProgress>,
    metrics: Option<&'a StructuredLogger>,
}

impl<'a, F: ModelFactory> HoldoutExperiment<'a, F> {
    pub fn new(config: &'a ExperimentConfig, factory: &'a F) -> Self {
        Self {
            config,
            factory,
            checkpointer: None,
            progress: None,
            metrics: None,
        }
    }

    pub fn with_checkpointer(mut self, checkpointer: &'a Checkpointer) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    pub fn with_progress(mut self, progress: &'a MultiProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_metrics(mut self, metrics: &'a StructuredLogger) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn run(
        &self,
        pool: &DevicePool,
        train: &Dataset,
        eval_sets: &[EvalSet],
    ) -> Result<HoldoutReport, TrainError> {
        self.config.validate()?;
        self.config.check_label_dim(train.label_dim())?;
        for set in eval_sets {
            train.check_compatible(&set.data)?;
        }

        let lease = pool.acquire();
        let device = lease.device();
        let cfg = self.config;
        let start = Instant::now();
        log::info!("Holdout training: {device}");

        let model = self.factory.build(device, cfg.seed)?;
        let optimizer = Adam::new(model.params(), LrConfig::uniform(cfg.lr.decay_start));
        let mut trainer = Trainer::new(model, optimizer, &TrainOptions::from_config(cfg, cfg.seed));

        let train_refs = train.all();
        let eval_refs: Vec<(&str, Vec<&Example>)> =
            eval_sets.iter().map(|s| (s.name.as_str(), s.data.all())).collect();
        log::info!(
            "Train size: {}, eval sets: [{}]",
            train_refs.len(),
            eval_sets
                .iter()
                .map(|s| format!("{}={}", s.name, s.data.len()))
                .collect::<Vec<_>>()
                .join(", ")
        );

        let bar = match self.progress {
            Some(mp) => mp.add(ProgressBar::new(0)),
            None => ProgressBar::hidden(),
        };
        bar.set_style(bar_style());
        bar.set_prefix(format!("holdout {device}"));

        let score_all = |model: &F::Model| -> Vec<(String, Result<f64, MetricError>)> {
            eval_refs
                .iter()
                .map(|(name, refs)| (name.to_string(), evaluate(model, refs, cfg.batch_size).auc))
                .collect()
        };

        let mut epochs: Vec<HoldoutEpoch> = Vec::with_capacity(cfg.num_epochs);
        for epoch in 0..cfg.num_epochs {
            let stats = trainer.train_epoch(epoch, &train_refs, &bar);
            if epochs.last().is_some_and(|prev| prev.lr != stats.lr) {
                log::info!("Switched to fine-tune LR ({:e})", stats.lr.head);
            }
            let scores = score_all(trainer.model());
            log::info!("Epoch {epoch} - {}", format_scores(&scores));

            if let Some(m) = self.metrics {
                for (name, auc) in &scores {
                    m.write_json(&EpochRecord {
                        ts: now_ts(),
                        fold: None,
                        epoch,
                        lr: stats.lr.head,
                        train_loss: stats.mean_loss,
                        auc: auc.ok(),
                        elapsed_sec: start.elapsed().as_secs_f64(),
                        eval_set: Some(name.clone()),
                    });
                }
            }

            let checkpoint = match self.checkpointer {
                Some(c) => {
                    let dir = c.dir_named(&format!("{}_epoch{}", cfg.model_name, epoch + 1));
                    c.save(&dir, trainer.model())?;
                    Some(dir)
                }
                None => None,
            };

            epochs.push(HoldoutEpoch {
                epoch,
                train_loss: stats.mean_loss,
                lr: stats.lr,
                scores,
                checkpoint,
            });
        }
        bar.finish_and_clear();

        let mut ema_scores = None;
        if let Some(ema) = trainer.ema().cloned() {
            let model = trainer.model_mut();
            ema.copy_to(model.params_mut());
            let scores = score_all(&*model);
            log::info!("EMA - {}", format_scores(&scores));
            if let Some(c) = self.checkpointer {
                c.save(&c.dir_named(&format!("{}_ema", cfg.model_name)), &*model)?;
            }
            ema_scores = Some(scores);
        }

        log::info!("Holdout run-time: {:.4}", start.elapsed().as_secs_f64());
        Ok(HoldoutReport { epochs, ema_scores })
    }
}
