//! 実験設定
//!
//! TOML から読み込み、コマンドライン引数で上書きしたあと `validate()` で
//! ワーカー起動前に検証する。

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::device::DeviceId;
use crate::error::{ConfigError, Error};
use crate::lang::Language;
use crate::loss::LossReduction;
use crate::schedule::LrSchedule;

/// EMA 設定
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmaConfig {
    pub enabled: bool,
    pub decay: f32,
}

impl Default for EmaConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            decay: 0.999,
        }
    }
}

/// 混合精度設定
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MixedPrecisionConfig {
    pub enabled: bool,
    pub initial_scale: f32,
    /// スケールを増やすまでの連続成功ステップ数
    pub growth_interval: usize,
}

impl Default for MixedPrecisionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_scale: 65536.0,
            growth_interval: 2000,
        }
    }
}

/// チェックポイントを保存するフォールド
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointScope {
    /// `primary_fold` だけ（ストレージ節約）
    #[default]
    Primary,
    /// 全フォールド
    All,
    /// 保存しない
    None,
}

/// チェックポイントを保存するタイミング
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointTrigger {
    /// 毎エポック上書き
    #[default]
    EveryEpoch,
    /// AUC が改善したときだけ
    BestAuc,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub scope: CheckpointScope,
    pub primary_fold: usize,
    pub trigger: CheckpointTrigger,
    pub output_dir: PathBuf,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            scope: CheckpointScope::Primary,
            primary_fold: 0,
            trigger: CheckpointTrigger::EveryEpoch,
            output_dir: PathBuf::from("models/kfolds"),
        }
    }
}

impl CheckpointConfig {
    /// このフォールドがチェックポイントを書くか
    pub fn owns(&self, fold_id: usize) -> bool {
        match self.scope {
            CheckpointScope::Primary => fold_id == self.primary_fold,
            CheckpointScope::All => true,
            CheckpointScope::None => false,
        }
    }
}

/// 分類ヘッド設定
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadConfig {
    /// 1 = 二値、言語数 = 言語別
    pub output_units: usize,
}

impl Default for HeadConfig {
    fn default() -> Self {
        Self { output_units: 1 }
    }
}

impl HeadConfig {
    pub fn per_language(&self) -> bool {
        self.output_units > 1
    }
}

/// OOF 出力設定
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OofConfig {
    pub output_dir: PathBuf,
    pub prefix: String,
    pub prediction_column: String,
}

impl Default for OofConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data/oof"),
            prefix: "kfolds".to_string(),
            prediction_column: "toxic".to_string(),
        }
    }
}

/// 実験設定
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub model_name: String,
    pub max_seq_len: usize,
    pub num_folds: usize,
    pub seed: u64,
    pub num_epochs: usize,
    pub batch_size: usize,
    pub accumulation_steps: usize,
    pub devices: Vec<u32>,
    /// 同時実行フォールド数の上限（None ならデバイス数）
    pub workers: Option<usize>,
    pub max_encode_cores: usize,
    pub lr: LrSchedule,
    pub ema: EmaConfig,
    pub mixed_precision: MixedPrecisionConfig,
    pub checkpoint: CheckpointConfig,
    pub head: HeadConfig,
    pub loss_reduction: LossReduction,
    pub oof: OofConfig,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            model_name: "xlm-roberta-large".to_string(),
            max_seq_len: 200,
            num_folds: 4,
            seed: 1337,
            num_epochs: 4,
            batch_size: 24,
            accumulation_steps: 2,
            devices: vec![0, 1],
            workers: None,
            max_encode_cores: 8,
            lr: LrSchedule::default(),
            ema: EmaConfig::default(),
            mixed_precision: MixedPrecisionConfig::default(),
            checkpoint: CheckpointConfig::default(),
            head: HeadConfig::default(),
            loss_reduction: LossReduction::Mean,
            oof: OofConfig::default(),
        }
    }
}

impl ExperimentConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, Error> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.devices.iter().copied().map(DeviceId).collect()
    }

    /// 同時に走らせるワーカー数
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or(self.devices.len()).min(self.devices.len())
    }

    /// 値の範囲と整合性を検証する
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn check(ok: bool, msg: impl FnOnce() -> String) -> Result<(), ConfigError> {
            if ok { Ok(()) } else { Err(ConfigError::Invalid(msg())) }
        }

        if self.num_folds < 2 {
            return Err(ConfigError::InvalidFoldCount {
                folds: self.num_folds,
                n_examples: 0,
            });
        }
        check(!self.model_name.is_empty(), || "model_name must not be empty".into())?;
        check(self.max_seq_len >= 1, || "max_seq_len must be >= 1".into())?;
        check(self.batch_size >= 1, || "batch_size must be >= 1".into())?;
        check(self.accumulation_steps >= 1, || "accumulation_steps must be >= 1".into())?;
        check(self.num_epochs >= 1, || "num_epochs must be >= 1".into())?;
        check(self.max_encode_cores >= 1, || "max_encode_cores must be >= 1".into())?;

        check(!self.devices.is_empty(), || "at least one device is required".into())?;
        let mut seen = HashSet::new();
        for d in &self.devices {
            check(seen.insert(d), || format!("device {d} listed more than once"))?;
        }
        if let Some(w) = self.workers {
            check((1..=self.devices.len()).contains(&w), || {
                format!("workers must be in [1, {}], got {w}", self.devices.len())
            })?;
        }

        check(self.lr.decay_start > 0.0 && self.lr.finetune > 0.0, || {
            format!(
                "learning rates must be positive (decay_start={}, finetune={})",
                self.lr.decay_start, self.lr.finetune
            )
        })?;
        if let Some(f) = self.lr.layerwise_decay {
            check(f > 0.0 && f <= 1.0, || format!("layerwise_decay must be in (0, 1], got {f}"))?;
        }
        check((0.0..1.0).contains(&self.ema.decay), || {
            format!("ema.decay must be in [0, 1), got {}", self.ema.decay)
        })?;
        if self.mixed_precision.enabled {
            check(self.mixed_precision.initial_scale >= 1.0, || {
                "mixed_precision.initial_scale must be >= 1".into()
            })?;
        }

        let units = self.head.output_units;
        check(units == 1 || units == Language::COUNT, || {
            format!("head.output_units must be 1 or {}, got {units}", Language::COUNT)
        })?;
        if self.checkpoint.scope == CheckpointScope::Primary {
            check(self.checkpoint.primary_fold < self.num_folds, || {
                format!(
                    "checkpoint.primary_fold {} out of range for {} folds",
                    self.checkpoint.primary_fold, self.num_folds
                )
            })?;
        }
        Ok(())
    }

    /// ラベル次元が分類ヘッドの出力数と一致するか
    pub fn check_label_dim(&self, label_dim: usize) -> Result<(), ConfigError> {
        if label_dim != self.head.output_units {
            return Err(ConfigError::LengthMismatch {
                what: "label (head.output_units)",
                expected: self.head.output_units,
                actual: label_dim,
            });
        }
        Ok(())
    }
}
