//! 構造化 JSONL メトリクスログ
//!
//! (フォールド, エポック) ごとに1行の JSON を書く。複数フォールドのワーカーから
//! 同時に呼ばれるため内部で `Mutex` を持つ。

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use serde::Serialize;

/// 1エポック分の記録
#[derive(Clone, Debug, Serialize)]
pub struct EpochRecord {
    pub ts: String,
    /// フォールド ID（ホールドアウト実験では `None`）
    pub fold: Option<usize>,
    pub epoch: usize,
    pub lr: f32,
    pub train_loss: f32,
    /// 未定義の場合は null
    pub auc: Option<f64>,
    pub elapsed_sec: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eval_set: Option<String>,
}

/// JSONL ロガー（パス `-` なら stdout）
pub struct StructuredLogger {
    to_stdout: bool,
    file: Option<Mutex<BufWriter<File>>>,
}

impl StructuredLogger {
    pub fn new(path: &str) -> io::Result<Self> {
        if path == "-" {
            return Ok(Self {
                to_stdout: true,
                file: None,
            });
        }
        if let Some(parent) = Path::new(path).parent() {
            fs::create_dir_all(parent)?;
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            to_stdout: false,
            file: Some(Mutex::new(BufWriter::new(f))),
        })
    }

    pub fn to_stdout(&self) -> bool {
        self.to_stdout
    }

    pub fn write_json<T: Serialize>(&self, record: &T) {
        let line = match serde_json::to_string(record) {
            Ok(s) => s,
            Err(e) => {
                log::warn!("failed to serialize metrics record: {e}");
                return;
            }
        };
        if self.to_stdout {
            println!("{line}");
        } else if let Some(file) = &self.file {
            if let Ok(mut w) = file.lock() {
                // 途中で落ちても既存の行は残るよう毎回 flush する
                if let Err(e) = writeln!(w, "{line}").and_then(|_| w.flush()) {
                    log::warn!("failed to write metrics log: {e}");
                }
            }
        }
    }
}

/// 現在時刻（RFC 3339）
pub fn now_ts() -> String {
    chrono::Utc::now().to_rfc3339()
}
