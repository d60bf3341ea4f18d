//! 言語タグ
//!
//! 固定の言語集合と one-hot ベクトルへの対応表。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// 対応言語（並び順が one-hot の成分順）
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    En,
    It,
    Fr,
    Es,
    Tr,
    Ru,
    Pt,
}

impl Language {
    /// 言語数（言語別ヘッドの出力次元）
    pub const COUNT: usize = 7;

    pub const ALL: [Language; Self::COUNT] = [
        Language::En,
        Language::It,
        Language::Fr,
        Language::Es,
        Language::Tr,
        Language::Ru,
        Language::Pt,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn code(self) -> &'static str {
        match self {
            Language::En => "en",
            Language::Es => "es",
            Language::Fr => "fr",
            Language::It => "it",
            Language::Pt => "pt",
            Language::Ru => "ru",
            Language::Tr => "tr",
        }
    }

    /// one-hot ベクトル
    pub fn one_hot(self) -> [f32; Self::COUNT] {
        let mut v = [0.0; Self::COUNT];
        v[self.index()] = 1.0;
        v
    }
}

impl FromStr for Language {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = s.trim().to_ascii_lowercase();
        Language::ALL
            .iter()
            .copied()
            .find(|l| l.code() == code)
            .ok_or_else(|| ConfigError::Invalid(format!("unknown language tag '{s}'")))
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}
