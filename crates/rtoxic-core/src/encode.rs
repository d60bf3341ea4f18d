//! テキストのエンコード
//!
//! 生テキストを固定長のトークン ID 列に変換する。実運用のトークナイザは
//! `TextEncoder` を実装して差し込む。`HashingEncoder` は外部語彙なしで動く
//! 決定的な実装。

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::TrainError;
use crate::store::fnv1a;

/// パディング
pub const PAD_ID: u32 = 0;
/// 系列先頭
pub const CLS_ID: u32 = 1;
/// 系列末尾
pub const SEP_ID: u32 = 2;
const NUM_SPECIAL: u32 = 3;

/// トークナイザ設定（チェックポイントと一緒に保存される）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenizerConfig {
    pub kind: String,
    pub vocab_size: usize,
    pub max_len: usize,
    pub pad_id: u32,
}

impl TokenizerConfig {
    pub fn hashing(vocab_size: usize, max_len: usize) -> Self {
        Self {
            kind: "hashing".to_string(),
            vocab_size,
            max_len,
            pad_id: PAD_ID,
        }
    }
}

/// テキストエンコーダ
pub trait TextEncoder: Sync {
    /// `max_len` にパディング/切り詰めたトークン ID 列を返す
    fn encode(&self, text: &str, max_len: usize) -> Vec<u32>;

    fn vocab_size(&self) -> usize;

    fn config(&self, max_len: usize) -> TokenizerConfig;
}

/// ハッシュ語彙のエンコーダ
///
/// 小文字化した英数字の連続と記号1文字をピースとし、FNV-1a で
/// `[NUM_SPECIAL, vocab_size)` に写像する。
#[derive(Clone, Debug)]
pub struct HashingEncoder {
    vocab_size: u32,
}

impl HashingEncoder {
    pub fn new(vocab_size: usize) -> Result<Self, TrainError> {
        if vocab_size <= NUM_SPECIAL as usize || vocab_size > u32::MAX as usize {
            return Err(TrainError::DimensionMismatch {
                what: "vocab size",
                expected: NUM_SPECIAL as usize + 1,
                actual: vocab_size,
            });
        }
        Ok(Self {
            vocab_size: vocab_size as u32,
        })
    }

    fn piece_id(&self, piece: &str) -> u32 {
        let span = (self.vocab_size - NUM_SPECIAL) as u64;
        NUM_SPECIAL + (fnv1a(piece.as_bytes()) % span) as u32
    }
}

impl TextEncoder for HashingEncoder {
    fn encode(&self, text: &str, max_len: usize) -> Vec<u32> {
        let mut ids = Vec::with_capacity(max_len);
        if max_len == 0 {
            return ids;
        }
        ids.push(CLS_ID);

        // SEP の分を残す
        let budget = max_len.saturating_sub(2);
        let lowered = text.to_lowercase();
        let mut word = String::new();
        let mut pieces = 0usize;
        let mut push_piece = |piece: &str, ids: &mut Vec<u32>, pieces: &mut usize| {
            if *pieces < budget {
                ids.push(self.piece_id(piece));
                *pieces += 1;
            }
        };

        for ch in lowered.chars() {
            if ch.is_alphanumeric() {
                word.push(ch);
                continue;
            }
            if !word.is_empty() {
                push_piece(&word, &mut ids, &mut pieces);
                word.clear();
            }
            if !ch.is_whitespace() {
                let mut buf = [0u8; 4];
                push_piece(ch.encode_utf8(&mut buf), &mut ids, &mut pieces);
            }
        }
        if !word.is_empty() {
            push_piece(&word, &mut ids, &mut pieces);
        }

        if max_len >= 2 {
            ids.push(SEP_ID);
        }
        ids.resize(max_len, PAD_ID);
        ids
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size as usize
    }

    fn config(&self, max_len: usize) -> TokenizerConfig {
        TokenizerConfig::hashing(self.vocab_size as usize, max_len)
    }
}

/// CPU コア数を上限としてテキストを並列にエンコードする
pub fn batch_encode<E: TextEncoder + ?Sized>(
    encoder: &E,
    texts: &[String],
    max_len: usize,
    max_cores: usize,
) -> Result<Vec<Vec<u32>>, TrainError> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(max_cores.max(1))
        .build()
        .map_err(|e| TrainError::ThreadPool(e.to_string()))?;
    Ok(pool.install(|| texts.par_iter().map(|t| encoder.encode(t, max_len)).collect()))
}
