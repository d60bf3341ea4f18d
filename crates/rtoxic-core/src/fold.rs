//! k-fold 分割
//!
//! インデックス範囲をシード付きでシャッフルしてから K 個の検証区間に分ける。
//! 先頭 `N % K` 個のフォールドが1件多くなる。

use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;

use crate::data::{Dataset, Example};
use crate::error::ConfigError;

/// 1フォールド分の割り当て
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FoldAssignment {
    pub fold_id: usize,
    /// 学習インデックス（昇順）
    pub train_indices: Vec<usize>,
    /// 検証インデックス（昇順）
    pub val_indices: Vec<usize>,
}

impl FoldAssignment {
    /// 検証対象フラグの立ったサンプルだけを返す
    pub fn scored_val<'a>(&self, data: &'a Dataset) -> Vec<&'a Example> {
        self.val_indices
            .iter()
            .map(|&i| &data.examples()[i])
            .filter(|ex| ex.validation_eligible)
            .collect()
    }
}

/// k-fold 分割器
#[derive(Clone, Copy, Debug)]
pub struct FoldPartitioner {
    num_folds: usize,
    seed: u64,
}

impl FoldPartitioner {
    pub fn new(num_folds: usize, seed: u64) -> Self {
        Self { num_folds, seed }
    }

    pub fn num_folds(&self) -> usize {
        self.num_folds
    }

    /// `n` 件を分割する
    pub fn split(&self, n: usize) -> Result<Vec<FoldAssignment>, ConfigError> {
        let k = self.num_folds;
        if k < 2 || k > n {
            return Err(ConfigError::InvalidFoldCount {
                folds: k,
                n_examples: n,
            });
        }

        let mut order: Vec<usize> = (0..n).collect();
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        order.shuffle(&mut rng);

        let base = n / k;
        let remainder = n % k;
        let mut folds = Vec::with_capacity(k);
        let mut start = 0;

        for fold_id in 0..k {
            let end = start + base + usize::from(fold_id < remainder);

            let mut in_val = vec![false; n];
            let mut val_indices: Vec<usize> = order[start..end].to_vec();
            for &i in &val_indices {
                in_val[i] = true;
            }
            val_indices.sort_unstable();
            let train_indices = (0..n).filter(|&i| !in_val[i]).collect();

            folds.push(FoldAssignment {
                fold_id,
                train_indices,
                val_indices,
            });
            start = end;
        }

        Ok(folds)
    }
}
