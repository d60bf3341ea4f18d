//! 分類器
//!
//! 学習ループ・評価ループは `Classifier` トレイトだけに依存する。
//! パラメータはモデル構築時に固定の並びで `ParamSet` に登録され、
//! `ParamId`（並びのインデックス）でオプティマイザや EMA から参照される。

mod pooled;

pub use pooled::{PooledClassifier, PooledClassifierFactory};

use serde::{Deserialize, Serialize};

use crate::device::DeviceId;
use crate::error::TrainError;
use crate::store::EncoderConfig;

/// パラメータ ID（`ParamSet` 内の位置）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamId(pub usize);

/// パラメータグループ（グループ単位で学習率を持つ）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamGroup {
    /// 事前学習済みエンコーダ
    Encoder,
    /// 分類ヘッド
    Head,
}

/// 1つのパラメータテンソル（平坦化）
#[derive(Clone, Debug)]
pub struct Param {
    pub name: &'static str,
    pub group: ParamGroup,
    pub value: Vec<f32>,
    pub grad: Vec<f32>,
}

/// パラメータ集合
#[derive(Clone, Debug, Default)]
pub struct ParamSet {
    params: Vec<Param>,
}

impl ParamSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// パラメータを登録して ID を返す
    pub fn register(&mut self, name: &'static str, group: ParamGroup, value: Vec<f32>) -> ParamId {
        let grad = vec![0.0; value.len()];
        self.params.push(Param {
            name,
            group,
            value,
            grad,
        });
        ParamId(self.params.len() - 1)
    }

    #[inline]
    pub fn get(&self, id: ParamId) -> &Param {
        &self.params[id.0]
    }

    #[inline]
    pub fn get_mut(&mut self, id: ParamId) -> &mut Param {
        &mut self.params[id.0]
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ParamId, &Param)> {
        self.params.iter().enumerate().map(|(i, p)| (ParamId(i), p))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Param> {
        self.params.iter_mut()
    }

    /// 総要素数
    pub fn numel(&self) -> usize {
        self.params.iter().map(|p| p.value.len()).sum()
    }

    /// 勾配をゼロにリセット
    pub fn zero_grad(&mut self) {
        for p in &mut self.params {
            p.grad.fill(0.0);
        }
    }

    /// 値を平坦化して連結（テスト・比較用）
    pub fn flatten_values(&self) -> Vec<f32> {
        self.params.iter().flat_map(|p| p.value.iter().copied()).collect()
    }
}

/// 分類器
///
/// `forward` は学習用（逆伝播用のキャッシュを保持）、`predict` は推論用で
/// モデル状態を変更しない。
pub trait Classifier: Send {
    /// 出力次元（二値=1、言語別=言語数）
    fn output_dim(&self) -> usize;

    /// 順伝播。戻り値はバッチ × 出力次元の確率（行優先）
    ///
    /// `freeze` が真ならエンコーダの勾配を計算しない。
    fn forward(&mut self, batch: &[&[u32]], freeze: bool) -> Vec<f32>;

    /// 直前の `forward` に対する逆伝播。`grad_output` は出力確率に対する勾配で、
    /// パラメータの勾配に加算される。
    fn backward(&mut self, grad_output: &[f32]);

    /// 勾配なしの推論
    fn predict(&self, batch: &[&[u32]]) -> Vec<f32>;

    fn params(&self) -> &ParamSet;

    fn params_mut(&mut self) -> &mut ParamSet;

    /// エンコーダ設定（チェックポイント保存用）
    fn encoder_config(&self) -> &EncoderConfig;

    /// 混合精度モードの切り替え（学習開始前に一度だけ呼ぶ）
    fn set_mixed_precision(&mut self, _enabled: bool) {}
}

/// フォールドごとに新しいモデルを作るファクトリ
pub trait ModelFactory: Sync {
    type Model: Classifier + 'static;

    /// `device` に束縛されたモデルを構築する
    fn build(&self, device: DeviceId, seed: u64) -> Result<Self::Model, TrainError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_zero_grad() {
        let mut set = ParamSet::new();
        let a = set.register("a", ParamGroup::Encoder, vec![1.0, 2.0]);
        let b = set.register("b", ParamGroup::Head, vec![3.0]);
        assert_eq!(a, ParamId(0));
        assert_eq!(b, ParamId(1));
        assert_eq!(set.numel(), 3);

        set.get_mut(a).grad[1] = 5.0;
        set.zero_grad();
        assert!(set.iter().all(|(_, p)| p.grad.iter().all(|&g| g == 0.0)));
        assert_eq!(set.flatten_values(), vec![1.0, 2.0, 3.0]);
    }
}
