//! 実行設定
//!
//! TOML の `[experiment]` と `[data]` を読み、コマンドライン引数で上書きしてから
//! 学習を始める前に検証する。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use serde::{Deserialize, Serialize};

use rtoxic_core::encode::HashingEncoder;
use rtoxic_core::store::{DirStore, ModelStore, SeededStore};
use rtoxic_core::structured_log::StructuredLogger;
use rtoxic_core::ExperimentConfig;

use crate::dataset::DataConfig;

/// 設定ファイル全体
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub experiment: ExperimentConfig,
    pub data: DataConfig,
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("failed to parse config {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        self.experiment.validate().context("invalid [experiment] section")?;
        self.data.validate().context("invalid [data] section")?;
        Ok(())
    }
}

/// 両バイナリ共通の引数
#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// 実験設定ファイル（TOML）
    #[arg(short, long)]
    pub config: PathBuf,

    /// 事前学習モデルのルート（`<root>/<model_name>/`）。省略時はモデル名から重みを生成する
    #[arg(long)]
    pub model_store: Option<PathBuf>,

    /// 生成重みの語彙数（--model-store 省略時）
    #[arg(long, default_value_t = 30_000)]
    pub vocab_size: usize,

    /// 生成重みの隠れ次元（--model-store 省略時）
    #[arg(long, default_value_t = 32)]
    pub hidden_dim: usize,

    /// エポックごとの JSONL メトリクス出力先（"-" で標準出力）
    #[arg(long)]
    pub metrics_log: Option<String>,

    #[arg(long)]
    pub model_name: Option<String>,

    #[arg(long)]
    pub seed: Option<u64>,

    #[arg(short, long)]
    pub epochs: Option<usize>,

    /// 使用デバイス（カンマ区切り）
    #[arg(long, value_delimiter = ',')]
    pub devices: Option<Vec<u32>>,

    /// 同時実行フォールド数の上限
    #[arg(long)]
    pub workers: Option<usize>,
}

impl CommonArgs {
    /// 設定を読み込み、引数で上書きして検証する
    pub fn load_config(&self) -> Result<RunConfig> {
        let mut run = RunConfig::load(&self.config)?;
        let exp = &mut run.experiment;
        if let Some(name) = &self.model_name {
            exp.model_name = name.clone();
        }
        if let Some(seed) = self.seed {
            exp.seed = seed;
        }
        if let Some(epochs) = self.epochs {
            exp.num_epochs = epochs;
        }
        if let Some(devices) = &self.devices {
            exp.devices = devices.clone();
        }
        if let Some(w) = self.workers {
            exp.workers = Some(w);
        }
        run.validate()?;
        Ok(run)
    }

    pub fn model_store(&self) -> Arc<dyn ModelStore> {
        match &self.model_store {
            Some(root) => Arc::new(DirStore::new(root)),
            None => {
                log::warn!("--model-store not given; using seeded encoder weights");
                Arc::new(SeededStore::new(self.vocab_size, self.hidden_dim))
            }
        }
    }

    pub fn metrics_logger(&self) -> Result<Option<StructuredLogger>> {
        self.metrics_log
            .as_deref()
            .map(|p| StructuredLogger::new(p).with_context(|| format!("failed to open metrics log {p}")))
            .transpose()
    }
}

/// 事前学習モデルの語彙に合わせたエンコーダを作る
pub fn encoder_for(store: &dyn ModelStore, model_name: &str) -> Result<HashingEncoder> {
    let pretrained = store
        .load(model_name)
        .with_context(|| format!("failed to load pretrained model '{model_name}'"))?;
    Ok(HashingEncoder::new(pretrained.config.vocab_size)?)
}

/// env_logger を初期化する（既定レベル info、出力は標準エラー）
pub fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();
}
