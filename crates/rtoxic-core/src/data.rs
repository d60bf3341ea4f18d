//! 学習サンプルとデータセット
//!
//! トークン化済みのサンプルを保持する。トークン列長は全サンプルで一定
//! （MAX_SEQ_LEN にパディング/切り詰め済み）であることを構築時に検証する。

use std::collections::HashSet;
use std::fmt;

use serde::{Serialize, Serializer};

use crate::error::ConfigError;
use crate::lang::Language;

/// サンプル ID
///
/// 数字のみの ID は数値として扱い、ソート順を数値順にする。
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ExampleId {
    Num(u64),
    Text(String),
}

impl ExampleId {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        // "007" や "+7" は表記を保つため文字列のまま
        match raw.parse::<u64>() {
            Ok(n) if n.to_string() == raw => ExampleId::Num(n),
            _ => ExampleId::Text(raw.to_string()),
        }
    }
}

impl From<u64> for ExampleId {
    fn from(n: u64) -> Self {
        ExampleId::Num(n)
    }
}

impl From<&str> for ExampleId {
    fn from(s: &str) -> Self {
        ExampleId::parse(s)
    }
}

impl fmt::Display for ExampleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExampleId::Num(n) => write!(f, "{n}"),
            ExampleId::Text(s) => f.write_str(s),
        }
    }
}

impl Serialize for ExampleId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ExampleId::Num(n) => serializer.serialize_u64(*n),
            ExampleId::Text(s) => serializer.serialize_str(s),
        }
    }
}

/// 学習サンプル
#[derive(Clone, Debug)]
pub struct Example {
    pub id: ExampleId,
    /// トークン ID 列（固定長）
    pub features: Vec<u32>,
    /// ラベル。二値なら長さ1、言語別なら `toxic × one_hot(lang)`
    pub label: Vec<f32>,
    pub lang: Language,
    /// 検証スコアに含めるか（英語の拡張データなどは学習のみに使う）
    pub validation_eligible: bool,
}

impl Example {
    /// toxic スコアからサンプルを作る
    ///
    /// `per_language` が真なら言語別 one-hot ラベルに展開する。
    pub fn new(
        id: ExampleId,
        features: Vec<u32>,
        toxic: f32,
        lang: Language,
        validation_eligible: bool,
        per_language: bool,
    ) -> Self {
        let label = if per_language {
            lang.one_hot().iter().map(|&v| v * toxic).collect()
        } else {
            vec![toxic]
        };
        Self {
            id,
            features,
            label,
            lang,
            validation_eligible,
        }
    }

    /// スカラーラベル（言語別ラベルは非ゼロ成分が1つなので総和で戻せる）
    #[inline]
    pub fn scalar_label(&self) -> f32 {
        self.label.iter().sum()
    }
}

/// データセット
#[derive(Clone, Debug)]
pub struct Dataset {
    examples: Vec<Example>,
    seq_len: usize,
    label_dim: usize,
}

impl Dataset {
    /// サンプル列からデータセットを作成（長さ・ID一意性を検証）
    pub fn new(examples: Vec<Example>) -> Result<Self, ConfigError> {
        let first = examples.first().ok_or(ConfigError::EmptyDataset("examples"))?;
        let seq_len = first.features.len();
        let label_dim = first.label.len();
        if label_dim == 0 {
            return Err(ConfigError::Invalid("label must have at least one component".into()));
        }

        let mut seen = HashSet::with_capacity(examples.len());
        for ex in &examples {
            if ex.features.len() != seq_len {
                return Err(ConfigError::LengthMismatch {
                    what: "encoded features",
                    expected: seq_len,
                    actual: ex.features.len(),
                });
            }
            if ex.label.len() != label_dim {
                return Err(ConfigError::LengthMismatch {
                    what: "label",
                    expected: label_dim,
                    actual: ex.label.len(),
                });
            }
            if !seen.insert(&ex.id) {
                return Err(ConfigError::DuplicateId(ex.id.clone()));
            }
        }

        Ok(Self {
            examples,
            seq_len,
            label_dim,
        })
    }

    /// 複数のデータセットを連結（ID は全体で一意でなければならない）
    pub fn concat(parts: Vec<Dataset>) -> Result<Self, ConfigError> {
        let examples = parts.into_iter().flat_map(|d| d.examples).collect();
        Self::new(examples)
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn label_dim(&self) -> usize {
        self.label_dim
    }

    pub fn examples(&self) -> &[Example] {
        &self.examples
    }

    pub fn get(&self, index: usize) -> Option<&Example> {
        self.examples.get(index)
    }

    /// インデックス列で参照を取り出す
    pub fn select(&self, indices: &[usize]) -> Vec<&Example> {
        indices.iter().map(|&i| &self.examples[i]).collect()
    }

    /// 全サンプルへの参照
    pub fn all(&self) -> Vec<&Example> {
        self.examples.iter().collect()
    }

    /// 他のデータセットと同じ形状か確認
    pub fn check_compatible(&self, other: &Dataset) -> Result<(), ConfigError> {
        if self.seq_len != other.seq_len {
            return Err(ConfigError::LengthMismatch {
                what: "encoded features",
                expected: self.seq_len,
                actual: other.seq_len,
            });
        }
        if self.label_dim != other.label_dim {
            return Err(ConfigError::LengthMismatch {
                what: "label",
                expected: self.label_dim,
                actual: other.label_dim,
            });
        }
        Ok(())
    }
}
