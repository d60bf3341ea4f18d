//! エラー型
//!
//! 設定エラーはワーカー起動前に検出する。フォールド単位の失敗は
//! `FoldFailure` として集約結果に残し、成功した空結果と区別する。

use crate::data::ExampleId;
use crate::device::DeviceId;

/// 設定・入力データの不整合
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// フォールド数が範囲外（2 <= K <= N）
    #[error("num_folds must be in [2, {n_examples}], got {folds}")]
    InvalidFoldCount { folds: usize, n_examples: usize },

    /// 長さの不一致（トークン列長、ラベル次元など）
    #[error("{what} length mismatch: expected {expected}, got {actual}")]
    LengthMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// データセット内の ID 重複
    #[error("duplicate example id: {0}")]
    DuplicateId(ExampleId),

    /// 蒸留ラベルが見つからない ID
    #[error("no distill label for id {0}")]
    MissingDistillLabel(ExampleId),

    /// 空のデータセット
    #[error("dataset '{0}' is empty")]
    EmptyDataset(&'static str),

    /// その他の不正な設定値
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// デバイストークンの管理エラー
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ResourceError {
    #[error("device pool needs at least one device")]
    NoDevices,

    #[error("device {0} listed more than once")]
    DuplicateDevice(DeviceId),
}

/// 評価指標が定義できない
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricError {
    /// 正例または負例が存在せず AUC が未定義
    #[error("AUC undefined: {positives} positive / {negatives} negative labels")]
    Degenerate { positives: usize, negatives: usize },

    /// スコアに NaN / 無限大が含まれる（学習の発散など）
    #[error("AUC undefined: {count} non-finite scores")]
    NonFiniteScore { count: usize },
}

/// フォールド内の学習で起きるエラー
#[derive(thiserror::Error, Debug)]
pub enum TrainError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// 事前学習モデルの読み込み失敗
    #[error("model store: {0}")]
    Store(String),

    /// 重み・出力次元の不一致
    #[error("{what} dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("failed to build thread pool: {0}")]
    ThreadPool(String),
}

/// 失敗したフォールド（パニックを含む）
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("fold {fold_id} failed: {message}")]
pub struct FoldFailure {
    pub fold_id: usize,
    pub message: String,
}

/// out-of-fold 集約の整合性エラー
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum OofError {
    /// 複数のフォールドが同じ ID を予測した（検証集合が素でない）
    #[error("id {id} predicted by both fold {first} and fold {second}")]
    DuplicateId {
        id: ExampleId,
        first: usize,
        second: usize,
    },

    #[error("fold {fold_id} has no result for epoch {epoch}")]
    MissingEpoch { fold_id: usize, epoch: usize },
}

/// クレート全体のエラー
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Train(#[from] TrainError),

    #[error(transparent)]
    Oof(#[from] OofError),

    /// 一部のフォールドが失敗した
    #[error("{} of {total} folds failed (first: {})", failed.len(), first_failure(failed))]
    PartialFailure {
        failed: Vec<FoldFailure>,
        total: usize,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

fn first_failure(failed: &[FoldFailure]) -> String {
    failed.first().map(|f| f.to_string()).unwrap_or_default()
}

/// Result type for rtoxic-core operations
pub type Result<T, E = Error> = std::result::Result<T, E>;
