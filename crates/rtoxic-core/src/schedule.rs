//! 段階的学習率スケジュール
//!
//! 2状態の遷移: `FrozenHead`（エンコーダ凍結、ヘッドだけ高い学習率）→
//! `FineTune`（全体を低い学習率で微調整）。遷移時の学習率は
//! `LrSchedule::transition` が純粋関数として返し、学習ループはそれを
//! オプティマイザに適用するだけにする。

use serde::{Deserialize, Serialize};

use crate::model::ParamGroup;
use crate::optim::LrConfig;

/// 学習段階
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingStage {
    FrozenHead,
    FineTune,
}

impl TrainingStage {
    /// エポックに対応する段階
    pub fn for_epoch(epoch: usize, finetune_epoch: usize) -> Self {
        if epoch < finetune_epoch {
            TrainingStage::FrozenHead
        } else {
            TrainingStage::FineTune
        }
    }

    /// エンコーダの勾配を止めるか
    pub fn freeze_encoder(self) -> bool {
        matches!(self, TrainingStage::FrozenHead)
    }
}

/// 学習率スケジュール設定
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LrSchedule {
    /// 凍結段階の学習率
    pub decay_start: f32,
    /// 微調整段階の学習率
    pub finetune: f32,
    /// 微調整に切り替えるエポック
    pub finetune_epoch: usize,
    /// 凍結段階でエンコーダに掛ける減衰係数（None なら無効）
    pub layerwise_decay: Option<f32>,
}

impl Default for LrSchedule {
    fn default() -> Self {
        Self {
            decay_start: 1e-3,
            finetune: 1e-5,
            finetune_epoch: 1,
            layerwise_decay: None,
        }
    }
}

impl LrSchedule {
    /// 段階ごとの学習率
    pub fn rates_for(&self, stage: TrainingStage) -> LrConfig {
        match stage {
            TrainingStage::FrozenHead => LrConfig {
                encoder: self.decay_start * self.layerwise_decay.unwrap_or(1.0),
                head: self.decay_start,
            },
            TrainingStage::FineTune => LrConfig::uniform(self.finetune),
        }
    }

    /// 段階が変わったときだけ新しい学習率を返す
    pub fn transition(&self, from: TrainingStage, to: TrainingStage) -> Option<LrConfig> {
        (from != to).then(|| self.rates_for(to))
    }

    /// エポックの学習率（ログ用、ヘッドの値）
    pub fn head_lr_for_epoch(&self, epoch: usize) -> f32 {
        self.rates_for(TrainingStage::for_epoch(epoch, self.finetune_epoch))
            .for_group(ParamGroup::Head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_for_epoch() {
        assert_eq!(TrainingStage::for_epoch(0, 1), TrainingStage::FrozenHead);
        assert_eq!(TrainingStage::for_epoch(1, 1), TrainingStage::FineTune);
        assert_eq!(TrainingStage::for_epoch(3, 1), TrainingStage::FineTune);
        assert_eq!(TrainingStage::for_epoch(0, 0), TrainingStage::FineTune);
        assert!(TrainingStage::FrozenHead.freeze_encoder());
        assert!(!TrainingStage::FineTune.freeze_encoder());
    }

    #[test]
    fn test_rates_and_transition() {
        let s = LrSchedule::default();
        assert_eq!(s.rates_for(TrainingStage::FrozenHead), LrConfig::uniform(1e-3));
        assert_eq!(
            s.transition(TrainingStage::FrozenHead, TrainingStage::FineTune),
            Some(LrConfig::uniform(1e-5))
        );
        assert_eq!(s.transition(TrainingStage::FineTune, TrainingStage::FineTune), None);
    }

    #[test]
    fn test_layerwise_decay_scales_encoder() {
        let s = LrSchedule {
            layerwise_decay: Some(0.75),
            ..LrSchedule::default()
        };
        let lr = s.rates_for(TrainingStage::FrozenHead);
        assert_eq!(lr.head, 1e-3);
        assert!((lr.encoder - 7.5e-4).abs() < 1e-9);
        assert_eq!(s.head_lr_for_epoch(2), 1e-5);
    }
}
