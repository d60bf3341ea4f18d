//! # rtoxic-core
//!
//! 多言語 toxic コメント分類器の k-fold 学習オーケストレーション。
//!
//! ## モジュール構成
//!
//! - `data`: 学習サンプル（ID・トークン列・ラベル・言語タグ）とデータセット
//! - `fold`: シード付き k-fold 分割
//! - `device`: デバイストークンのプール（1デバイス1ワーカー）
//! - `model`: 分類器トレイトとプーリングヘッド付き分類器
//! - `optim` / `schedule` / `ema` / `precision` / `loss`: 学習ループの部品
//! - `train` / `eval`: エポック単位の学習ループと評価ループ
//! - `driver` / `scheduler`: フォールド単位の実行と並列スケジューリング
//! - `oof`: out-of-fold 予測の集約
//! - `holdout`: フォールドを使わない train/validation 実験
//!

pub mod config;
pub mod data;
pub mod device;
pub mod encode;
pub mod error;
pub mod lang;
pub mod store;
pub mod structured_log;

// 分割とモデル
pub mod fold;
pub mod model;

// 学習ループの部品
pub mod ema;
pub mod loss;
pub mod metrics;
pub mod optim;
pub mod precision;
pub mod schedule;

// 学習・評価
pub mod eval;
pub mod train;

// オーケストレーション
pub mod driver;
pub mod holdout;
pub mod oof;
pub mod scheduler;

pub use config::ExperimentConfig;
pub use data::{Dataset, Example, ExampleId};
pub use device::{DeviceId, DeviceLease, DevicePool};
pub use error::{ConfigError, Error, FoldFailure, MetricError, OofError, TrainError};
pub use fold::{FoldAssignment, FoldPartitioner};
pub use lang::Language;
