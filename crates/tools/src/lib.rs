//! # tools
//!
//! `kfold_train` / `holdout_train` バイナリの共通部品。
//!
//! - `common::io`: gzip 対応の入力ヘルパ
//! - `dataset`: CSV データソースの読み込みとエンコード
//! - `run`: 実行設定（TOML + コマンドライン上書き）

pub mod common;
pub mod dataset;
pub mod run;
