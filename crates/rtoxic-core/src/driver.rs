//! フォールドドライバ
//!
//! 1フォールド分の実行:
//! デバイス取得 → モデル構築 → {学習 → 評価} × エポック数 → チェックポイント → デバイス返却。
//!
//! デバイスは `DeviceLease` で保持するため、エラーやパニックで抜けても必ず返却される。
//! フォールド内の学習と評価は逐次実行。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use crate::config::{CheckpointConfig, CheckpointTrigger, ExperimentConfig};
use crate::data::{Dataset, Example, ExampleId};
use crate::device::{DeviceId, DevicePool};
use crate::encode::TokenizerConfig;
use crate::error::{MetricError, TrainError};
use crate::eval::{Evaluation, evaluate};
use crate::fold::FoldAssignment;
use crate::model::{Classifier, ModelFactory};
use crate::optim::{Adam, LrConfig};
use crate::store::ModelStore;
use crate::structured_log::{EpochRecord, StructuredLogger, now_ts};
use crate::train::{TrainOptions, Trainer};

/// (フォールド, エポック) ごとの結果
#[derive(Clone, Debug, PartialEq)]
pub struct EpochResult {
    pub fold_id: usize,
    pub epoch: usize,
    pub auc: Result<f64, MetricError>,
    pub train_loss: f32,
    pub lr: LrConfig,
    /// 検証対象サンプルの (ID, 予測)
    pub predictions: Vec<(ExampleId, f32)>,
}

/// 1フォールド分の結果
#[derive(Clone, Debug)]
pub struct FoldResult {
    pub fold_id: usize,
    pub device: DeviceId,
    pub epochs: Vec<EpochResult>,
    /// EMA パラメータでの最終評価（チェックポイント担当フォールドのみ）
    pub ema_auc: Option<Result<f64, MetricError>>,
    pub checkpoints: Vec<PathBuf>,
    pub train_size: usize,
    pub val_size: usize,
    pub elapsed: Duration,
}

/// チェックポイント保存
pub struct Checkpointer {
    store: Arc<dyn ModelStore>,
    tokenizer: TokenizerConfig,
    config: CheckpointConfig,
    model_name: String,
}

impl Checkpointer {
    pub fn new(
        store: Arc<dyn ModelStore>,
        tokenizer: TokenizerConfig,
        config: CheckpointConfig,
        model_name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            tokenizer,
            config,
            model_name: model_name.into(),
        }
    }

    pub fn owns(&self, fold_id: usize) -> bool {
        self.config.owns(fold_id)
    }

    pub fn trigger(&self) -> CheckpointTrigger {
        self.config.trigger
    }

    fn name_for(&self, fold_id: usize, suffix: &str) -> String {
        // 全フォールド保存時だけフォールド番号で区別する
        match self.config.scope {
            crate::config::CheckpointScope::All => {
                format!("{}{suffix}_fold{fold_id}", self.model_name)
            }
            _ => format!("{}{suffix}", self.model_name),
        }
    }

    /// 通常のチェックポイントの保存先
    pub fn dir_for(&self, fold_id: usize) -> PathBuf {
        self.config.output_dir.join(self.name_for(fold_id, ""))
    }

    /// EMA パラメータの保存先
    pub fn ema_dir_for(&self, fold_id: usize) -> PathBuf {
        self.config.output_dir.join(self.name_for(fold_id, "_ema"))
    }

    /// 任意の名前で保存する（ホールドアウト実験のエポック別保存など）
    pub fn dir_named(&self, name: &str) -> PathBuf {
        self.config.output_dir.join(name)
    }

    pub fn save(&self, dir: &std::path::Path, model: &dyn Classifier) -> Result<(), TrainError> {
        log::info!("Saving model to {}", dir.display());
        self.store.save(dir, model, &self.tokenizer)
    }
}

/// 進捗バーのスタイル
pub(crate) fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{prefix} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} loss:{msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}

/// フォールドドライバ
pub struct FoldDriver<'a, F: ModelFactory> {
    config: &'a ExperimentConfig,
    factory: &'a F,
    checkpointer: Option<&'a Checkpointer>,
    pseudo: &'a [Example],
    progress: Option<&'a MultiProgress>,
    metrics: Option<&'a StructuredLogger>,
}

impl<'a, F: ModelFactory> FoldDriver<'a, F> {
    pub fn new(config: &'a ExperimentConfig, factory: &'a F) -> Self {
        Self {
            config,
            factory,
            checkpointer: None,
            pseudo: &[],
            progress: None,
            metrics: None,
        }
    }

    pub fn with_checkpointer(mut self, checkpointer: &'a Checkpointer) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    /// 全フォールドの学習データ先頭に加える疑似ラベルサンプル
    pub fn with_pseudo_labels(mut self, pseudo: &'a [Example]) -> Self {
        self.pseudo = pseudo;
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

    /// プールからデバイスを借りてフォールドを実行する
    pub fn run(
        &self,
        pool: &DevicePool,
        fold: &FoldAssignment,
        data: &Dataset,
    ) -> Result<FoldResult, TrainError> {
        let lease = pool.acquire();
        self.run_on(lease.device(), fold, data)
    }

    /// 指定デバイスでフォールドを実行する
    pub fn run_on(
        &self,
        device: DeviceId,
        fold: &FoldAssignment,
        data: &Dataset,
    ) -> Result<FoldResult, TrainError> {
        let start = Instant::now();
        let cfg = self.config;
        let fold_id = fold.fold_id;
        log::info!("Fold {fold_id} training: {device}");

        let fold_seed = cfg.seed.wrapping_add(fold_id as u64);
        let model = self.factory.build(device, fold_seed)?;
        let optimizer = Adam::new(model.params(), LrConfig::uniform(cfg.lr.decay_start));
        let mut trainer = Trainer::new(model, optimizer, &TrainOptions::from_config(cfg, fold_seed));

        let train: Vec<&Example> = self.pseudo.iter().chain(data.select(&fold.train_indices)).collect();
        let val = fold.scored_val(data);
        if fold_id == 0 {
            log::info!("train size: {}, val size: {}", train.len(), val.len());
        }

        let bar = match self.progress {
            Some(mp) => mp.add(ProgressBar::new(0)),
            None => ProgressBar::hidden(),
        };
        bar.set_style(bar_style());
        bar.set_prefix(format!("fold {fold_id} {device}"));

        let checkpointer = self.checkpointer.filter(|c| c.owns(fold_id));
        let mut checkpoints = Vec::new();
        let mut best_auc: Option<f64> = None;
        let mut epochs = Vec::with_capacity(cfg.num_epochs);

        for epoch in 0..cfg.num_epochs {
            let stats = trainer.train_epoch(epoch, &train, &bar);
            let Evaluation { auc, predictions } = evaluate(trainer.model(), &val, cfg.batch_size);
            match auc {
                Ok(a) => log::info!("Fold {fold_id}, Epoch {epoch} - AUC: {a:.4}"),
                Err(e) => log::warn!("Fold {fold_id}, Epoch {epoch} - {e}"),
            }
            if let Some(m) = self.metrics {
                m.write_json(&EpochRecord {
                    ts: now_ts(),
                    fold: Some(fold_id),
                    epoch,
                    lr: stats.lr.head,
                    train_loss: stats.mean_loss,
                    auc: auc.ok(),
                    elapsed_sec: start.elapsed().as_secs_f64(),
                    eval_set: None,
                });
            }

            if let Some(c) = checkpointer {
                let save = match c.trigger() {
                    CheckpointTrigger::EveryEpoch => true,
                    CheckpointTrigger::BestAuc => match auc {
                        Ok(a) if best_auc.is_none_or(|b| a > b) => {
                            best_auc = Some(a);
                            true
                        }
                        _ => false,
                    },
                };
                if save {
                    let dir = c.dir_for(fold_id);
                    c.save(&dir, trainer.model())?;
                    if !checkpoints.contains(&dir) {
                        checkpoints.push(dir);
                    }
                }
            }

            epochs.push(EpochResult {
                fold_id,
                epoch,
                auc,
                train_loss: stats.mean_loss,
                lr: stats.lr,
                predictions,
            });
        }
        bar.finish_and_clear();

        let mut ema_auc = None;
        if let Some(c) = checkpointer {
            if let Some(ema) = trainer.ema().cloned() {
                let model = trainer.model_mut();
                ema.copy_to(model.params_mut());
                let auc = evaluate(&*model, &val, cfg.batch_size).auc;
                match auc {
                    Ok(a) => log::info!("EMA -> Fold {fold_id} - AUC: {a:.4}"),
                    Err(e) => log::warn!("EMA -> Fold {fold_id} - {e}"),
                }
                let dir = c.ema_dir_for(fold_id);
                c.save(&dir, &*model)?;
                checkpoints.push(dir);
                ema_auc = Some(auc);
            }
        }

        let elapsed = start.elapsed();
        log::info!("Fold {fold_id} run-time: {:.4}", elapsed.as_secs_f64());
        Ok(FoldResult {
            fold_id,
            device,
            epochs,
            ema_auc,
            checkpoints,
            train_size: train.len(),
            val_size: val.len(),
            elapsed,
        })
    }
}
