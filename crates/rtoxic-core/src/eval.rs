//! 評価ループ
//!
//! 勾配なしでバッチ推論し、入力順のまま予測を集める。言語別ヘッドの出力は
//! 言語タグとの要素積の総和でスカラーに射影してから AUC を計算する。

use crate::data::{Example, ExampleId};
use crate::error::MetricError;
use crate::metrics::roc_auc;
use crate::model::Classifier;

/// 評価結果
#[derive(Clone, Debug, PartialEq)]
pub struct Evaluation {
    /// 単一クラスの場合は `Err`（呼び出し側で解釈する）
    pub auc: Result<f64, MetricError>,
    /// 入力順の (ID, スカラー予測)
    pub predictions: Vec<(ExampleId, f32)>,
}

impl Evaluation {
    pub fn auc_or_nan(&self) -> f64 {
        self.auc.unwrap_or(f64::NAN)
    }
}

/// 言語別の出力をスカラーへ射影する
fn project(example: &Example, outputs: &[f32]) -> f32 {
    if outputs.len() == 1 {
        return outputs[0];
    }
    outputs.iter().zip(example.lang.one_hot()).map(|(&p, w)| p * w).sum()
}

/// モデルを評価する（モデルの状態は変更しない）
pub fn evaluate<M: Classifier + ?Sized>(
    model: &M,
    examples: &[&Example],
    batch_size: usize,
) -> Evaluation {
    let out_dim = model.output_dim();
    let mut predictions = Vec::with_capacity(examples.len());
    let mut labels = Vec::with_capacity(examples.len());

    for chunk in examples.chunks(batch_size.max(1)) {
        let features: Vec<&[u32]> = chunk.iter().map(|ex| ex.features.as_slice()).collect();
        let outputs = model.predict(&features);
        for (ex, row) in chunk.iter().zip(outputs.chunks(out_dim)) {
            predictions.push((ex.id.clone(), project(ex, row)));
            labels.push(ex.scalar_label());
        }
    }

    let scores: Vec<f32> = predictions.iter().map(|(_, p)| *p).collect();
    Evaluation {
        auc: roc_auc(&scores, &labels),
        predictions,
    }
}
