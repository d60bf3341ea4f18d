//! 学習ループ
//!
//! エポック単位でミニバッチ学習を行う。
//!
//! - エポックごとにサンプル順をシャッフル
//! - `accumulation_steps` バッチ分の勾配を蓄積してから1回オプティマイザを適用
//! - 凍結段階（`TrainingStage::FrozenHead`）ではエンコーダの勾配を止める
//! - 段階の切り替わりでだけ学習率を差し替える
//! - EMA は逆伝播のたびに更新
//!
//! エポック末尾で蓄積途中の勾配は次エポックへ持ち越される。

use indicatif::ProgressBar;
use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;

use crate::config::{EmaConfig, ExperimentConfig, MixedPrecisionConfig};
use crate::data::Example;
use crate::ema::Ema;
use crate::loss::{BceLoss, LossReduction};
use crate::model::Classifier;
use crate::optim::{LrConfig, Optimizer};
use crate::precision::LossScaler;
use crate::schedule::{LrSchedule, TrainingStage};

/// 学習ループの設定
#[derive(Clone, Debug)]
pub struct TrainOptions {
    pub batch_size: usize,
    pub accumulation_steps: usize,
    pub schedule: LrSchedule,
    pub loss_reduction: LossReduction,
    pub ema: EmaConfig,
    pub mixed_precision: MixedPrecisionConfig,
    /// シャッフル用シード
    pub seed: u64,
}

impl TrainOptions {
    pub fn from_config(config: &ExperimentConfig, seed: u64) -> Self {
        Self {
            batch_size: config.batch_size,
            accumulation_steps: config.accumulation_steps,
            schedule: config.lr.clone(),
            loss_reduction: config.loss_reduction,
            ema: config.ema.clone(),
            mixed_precision: config.mixed_precision.clone(),
            seed,
        }
    }
}

/// 1エポックの統計
#[derive(Clone, Debug, PartialEq)]
pub struct EpochStats {
    pub epoch: usize,
    pub stage: TrainingStage,
    pub lr: LrConfig,
    /// バッチ損失の平均（表示用）
    pub mean_loss: f32,
    pub batches: usize,
    pub optimizer_steps: usize,
    /// 勾配オーバーフローでスキップしたステップ数
    pub skipped_steps: usize,
}

/// 学習器
pub struct Trainer<M: Classifier, O: Optimizer> {
    model: M,
    optimizer: O,
    loss: BceLoss,
    schedule: LrSchedule,
    stage: TrainingStage,
    ema: Option<Ema>,
    scaler: Option<LossScaler>,
    batch_size: usize,
    accumulation_steps: usize,
    rng: ChaCha8Rng,
    backward_passes: usize,
}

impl<M: Classifier, O: Optimizer> Trainer<M, O> {
    /// 混合精度と EMA の準備（学習開始前に一度だけ）を行う
    pub fn new(mut model: M, mut optimizer: O, options: &TrainOptions) -> Self {
        model.set_mixed_precision(options.mixed_precision.enabled);
        let scaler = options.mixed_precision.enabled.then(|| {
            LossScaler::new(
                options.mixed_precision.initial_scale,
                options.mixed_precision.growth_interval,
            )
        });
        let ema = options.ema.enabled.then(|| Ema::register(model.params(), options.ema.decay));

        let stage = TrainingStage::for_epoch(0, options.schedule.finetune_epoch);
        optimizer.set_lr(options.schedule.rates_for(stage));

        Self {
            model,
            optimizer,
            loss: BceLoss::new(options.loss_reduction),
            schedule: options.schedule.clone(),
            stage,
            ema,
            scaler,
            batch_size: options.batch_size.max(1),
            accumulation_steps: options.accumulation_steps.max(1),
            rng: ChaCha8Rng::seed_from_u64(options.seed),
            backward_passes: 0,
        }
    }

    /// 1エポック学習する
    pub fn train_epoch(
        &mut self,
        epoch: usize,
        examples: &[&Example],
        progress: &ProgressBar,
    ) -> EpochStats {
        let stage = TrainingStage::for_epoch(epoch, self.schedule.finetune_epoch);
        if let Some(lr) = self.schedule.transition(self.stage, stage) {
            log::debug!(
                "epoch {epoch}: {:?} -> {:?}, lr encoder={:e} head={:e}",
                self.stage,
                stage,
                lr.encoder,
                lr.head
            );
            self.optimizer.set_lr(lr);
            self.stage = stage;
        }
        let freeze = stage.freeze_encoder();

        let mut order: Vec<usize> = (0..examples.len()).collect();
        order.shuffle(&mut self.rng);

        let num_batches = examples.len().div_ceil(self.batch_size);
        progress.set_length(num_batches as u64);
        progress.set_position(0);

        let mut loss_sum = 0.0f32;
        let mut steps = 0;
        let mut skipped = 0;

        for (batch_idx, chunk) in order.chunks(self.batch_size).enumerate() {
            let features: Vec<&[u32]> =
                chunk.iter().map(|&i| examples[i].features.as_slice()).collect();
            let targets: Vec<f32> =
                chunk.iter().flat_map(|&i| examples[i].label.iter().copied()).collect();

            let probs = self.model.forward(&features, freeze);
            let (loss, mut grad) = self.loss.compute(&probs, &targets);
            if let Some(scaler) = &self.scaler {
                scaler.scale_grad(&mut grad);
            }
            self.model.backward(&grad);
            self.backward_passes += 1;

            if (batch_idx + 1) % self.accumulation_steps == 0 {
                if self.apply_step() {
                    steps += 1;
                } else {
                    skipped += 1;
                }
            }
            if let Some(ema) = &mut self.ema {
                ema.update(self.model.params());
            }

            loss_sum += loss;
            let avg = loss_sum / (batch_idx + 1) as f32;
            progress.set_message(format!("{avg:.6}"));
            progress.inc(1);
        }

        EpochStats {
            epoch,
            stage,
            lr: self.optimizer.lr(),
            mean_loss: if num_batches > 0 {
                loss_sum / num_batches as f32
            } else {
                0.0
            },
            batches: num_batches,
            optimizer_steps: steps,
            skipped_steps: skipped,
        }
    }

    /// 蓄積済み勾配でオプティマイザを適用し、勾配をリセットする
    ///
    /// 勾配が非有限ならステップをスキップして偽を返す。
    fn apply_step(&mut self) -> bool {
        let valid = match &mut self.scaler {
            Some(scaler) => {
                let valid = scaler.unscale_and_check(self.model.params_mut());
                scaler.update(valid);
                valid
            }
            None => true,
        };
        if valid {
            self.optimizer.step(self.model.params_mut());
        }
        self.optimizer.zero_grad(self.model.params_mut());
        valid
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }

    pub fn ema(&self) -> Option<&Ema> {
        self.ema.as_ref()
    }

    pub fn stage(&self) -> TrainingStage {
        self.stage
    }

    /// これまでの逆伝播回数
    pub fn backward_passes(&self) -> usize {
        self.backward_passes
    }

    pub fn loss_scale(&self) -> Option<f32> {
        self.scaler.as_ref().map(LossScaler::scale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ExampleId;
    use crate::lang::Language;
    use crate::model::PooledClassifier;
    use crate::optim::Adam;
    use crate::store::{ModelStore, SeededStore};

    fn examples(n: usize) -> Vec<Example> {
        (0..n)
            .map(|i| {
                let features = vec![1 + (i % 5) as u32, 6 + (i % 7) as u32, (i % 3) as u32];
                let toxic = if i % 3 == 0 { 1.0 } else { 0.0 };
                Example::new(ExampleId::Num(i as u64), features, toxic, Language::En, true, false)
            })
            .collect()
    }

    fn options() -> TrainOptions {
        TrainOptions {
            batch_size: 4,
            accumulation_steps: 1,
            schedule: LrSchedule::default(),
            loss_reduction: LossReduction::Mean,
            ema: EmaConfig::default(),
            mixed_precision: MixedPrecisionConfig {
                enabled: false,
                ..MixedPrecisionConfig::default()
            },
            seed: 11,
        }
    }

    fn trainer(opts: &TrainOptions) -> Trainer<PooledClassifier, Adam> {
        let pretrained = SeededStore::new(16, 4).load("unit").unwrap();
        let model = PooledClassifier::new(pretrained, 1, 5).unwrap();
        let adam = Adam::new(model.params(), LrConfig::uniform(0.0));
        Trainer::new(model, adam, opts)
    }

    #[test]
    fn test_deterministic_for_seed() {
        let data = examples(18);
        let refs: Vec<&Example> = data.iter().collect();
        let opts = options();
        let mut a = trainer(&opts);
        let mut b = trainer(&opts);
        let bar = ProgressBar::hidden();
        for epoch in 0..3 {
            let sa = a.train_epoch(epoch, &refs, &bar);
            let sb = b.train_epoch(epoch, &refs, &bar);
            assert_eq!(sa, sb);
            assert_eq!(a.model().params().flatten_values(), b.model().params().flatten_values());
        }
    }

    #[test]
    fn test_accumulation_matches_large_batch() {
        // 2B 件を B × 2 蓄積で1ステップ vs 2B で1ステップ（勾配は総和）
        let data = examples(8);
        let refs: Vec<&Example> = data.iter().collect();
        let base = TrainOptions {
            loss_reduction: LossReduction::Sum,
            schedule: LrSchedule {
                finetune_epoch: 0,
                finetune: 1e-2,
                ..LrSchedule::default()
            },
            ..options()
        };
        let accumulated = TrainOptions {
            batch_size: 4,
            accumulation_steps: 2,
            ..base.clone()
        };
        let single = TrainOptions {
            batch_size: 8,
            accumulation_steps: 1,
            ..base
        };

        let bar = ProgressBar::hidden();
        let mut a = trainer(&accumulated);
        let mut b = trainer(&single);
        let sa = a.train_epoch(0, &refs, &bar);
        let sb = b.train_epoch(0, &refs, &bar);
        assert_eq!(sa.optimizer_steps, 1);
        assert_eq!(sb.optimizer_steps, 1);

        let va = a.model().params().flatten_values();
        let vb = b.model().params().flatten_values();
        for (x, y) in va.iter().zip(&vb) {
            assert!((x - y).abs() < 1e-5, "{x} vs {y}");
        }
    }

    #[test]
    fn test_lr_switches_at_finetune_epoch() {
        let data = examples(12);
        let refs: Vec<&Example> = data.iter().collect();
        let opts = options();
        let mut t = trainer(&opts);
        let bar = ProgressBar::hidden();

        let high = LrConfig::uniform(opts.schedule.decay_start);
        let low = LrConfig::uniform(opts.schedule.finetune);
        assert_eq!(t.optimizer().lr(), high);
        assert_eq!(t.stage(), TrainingStage::FrozenHead);

        let s0 = t.train_epoch(0, &refs, &bar);
        assert_eq!(s0.lr, high);
        // エポック1開始前はまだ高い学習率
        assert_eq!(t.optimizer().lr(), high);

        let s1 = t.train_epoch(1, &refs, &bar);
        assert_eq!(s1.lr, low);
        assert_eq!(s1.stage, TrainingStage::FineTune);
        t.train_epoch(2, &refs, &bar);
        assert_eq!(t.optimizer().lr(), low);
    }

    #[test]
    fn test_frozen_epoch_keeps_encoder() {
        let data = examples(12);
        let refs: Vec<&Example> = data.iter().collect();
        let mut t = trainer(&options());
        let encoder_before = t.model().params().get(crate::model::ParamId(0)).value.clone();
        t.train_epoch(0, &refs, &ProgressBar::hidden());
        assert_eq!(t.model().params().get(crate::model::ParamId(0)).value, encoder_before);

        t.train_epoch(1, &refs, &ProgressBar::hidden());
        assert_ne!(t.model().params().get(crate::model::ParamId(0)).value, encoder_before);
    }

    #[test]
    fn test_ema_updated_every_backward() {
        let data = examples(10);
        let refs: Vec<&Example> = data.iter().collect();
        let opts = TrainOptions {
            batch_size: 3,
            accumulation_steps: 2,
            ema: EmaConfig {
                enabled: true,
                decay: 0.9,
            },
            ..options()
        };
        let mut t = trainer(&opts);
        let stats = t.train_epoch(0, &refs, &ProgressBar::hidden());
        assert_eq!(stats.batches, 4);
        assert_eq!(stats.optimizer_steps, 2);
        assert_eq!(t.backward_passes(), 4);
        assert_eq!(t.ema().unwrap().updates(), 4);
    }

    #[test]
    fn test_mixed_precision_trains_with_scaling() {
        let data = examples(12);
        let refs: Vec<&Example> = data.iter().collect();
        let opts = TrainOptions {
            mixed_precision: MixedPrecisionConfig::default(),
            ..options()
        };
        let mut t = trainer(&opts);
        let before = t.model().params().flatten_values();
        let stats = t.train_epoch(0, &refs, &ProgressBar::hidden());
        assert_eq!(stats.optimizer_steps + stats.skipped_steps, 3);
        assert!(stats.optimizer_steps > 0);
        assert!(t.loss_scale().is_some());
        assert_ne!(t.model().params().flatten_values(), before);
        assert!(t.model().params().flatten_values().iter().all(|v| v.is_finite()));
    }
}
