//! パラメータの指数移動平均（EMA）
//!
//! シャドウ値はモデル構築時の `ParamSet` の並び（`ParamId`）で固定される。

use crate::model::{ParamId, ParamSet};

/// EMA シャドウ
#[derive(Clone, Debug)]
pub struct Ema {
    decay: f32,
    shadow: Vec<Vec<f32>>,
    updates: usize,
}

impl Ema {
    /// 現在のパラメータ値でシャドウを初期化する
    pub fn register(params: &ParamSet, decay: f32) -> Self {
        Self {
            decay,
            shadow: params.iter().map(|(_, p)| p.value.clone()).collect(),
            updates: 0,
        }
    }

    /// `shadow = decay × shadow + (1 - decay) × param`
    pub fn update(&mut self, params: &ParamSet) {
        debug_assert_eq!(self.shadow.len(), params.len());
        let d = self.decay;
        for (shadow, (_, p)) in self.shadow.iter_mut().zip(params.iter()) {
            for (s, &v) in shadow.iter_mut().zip(&p.value) {
                *s = d * *s + (1.0 - d) * v;
            }
        }
        self.updates += 1;
    }

    pub fn shadow(&self, id: ParamId) -> &[f32] {
        &self.shadow[id.0]
    }

    /// シャドウ値をパラメータに書き戻す
    pub fn copy_to(&self, params: &mut ParamSet) {
        for (p, shadow) in params.iter_mut().zip(&self.shadow) {
            p.value.copy_from_slice(shadow);
        }
    }

    pub fn decay(&self) -> f32 {
        self.decay
    }

    pub fn updates(&self) -> usize {
        self.updates
    }
}
