//! オプティマイザ
//!
//! パラメータグループ（エンコーダ / ヘッド）ごとに学習率を持つ Adam。

use serde::{Deserialize, Serialize};

use crate::model::{ParamGroup, ParamSet};

/// グループ別の学習率
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LrConfig {
    pub encoder: f32,
    pub head: f32,
}

impl LrConfig {
    /// 全グループ同一の学習率
    pub fn uniform(lr: f32) -> Self {
        Self {
            encoder: lr,
            head: lr,
        }
    }

    #[inline]
    pub fn for_group(&self, group: ParamGroup) -> f32 {
        match group {
            ParamGroup::Encoder => self.encoder,
            ParamGroup::Head => self.head,
        }
    }
}

/// オプティマイザ trait
pub trait Optimizer: Send {
    /// 蓄積済みの勾配でパラメータを更新
    fn step(&mut self, params: &mut ParamSet);

    /// 勾配をゼロにリセット
    fn zero_grad(&mut self, params: &mut ParamSet) {
        params.zero_grad();
    }

    /// 学習率を設定
    fn set_lr(&mut self, lr: LrConfig);

    /// 現在の学習率を取得
    fn lr(&self) -> LrConfig;
}

/// Adam オプティマイザ
#[derive(Clone, Debug)]
pub struct Adam {
    lr: LrConfig,
    /// β1（一次モーメントの減衰率）
    pub beta1: f32,
    /// β2（二次モーメントの減衰率）
    pub beta2: f32,
    /// 数値安定性のための小さな値
    pub epsilon: f32,
    t: u32,
    m: Vec<Vec<f32>>,
    v: Vec<Vec<f32>>,
}

impl Adam {
    /// `params` と同じ並びでモーメントを確保する
    pub fn new(params: &ParamSet, lr: LrConfig) -> Self {
        let zeros = || -> Vec<Vec<f32>> {
            params.iter().map(|(_, p)| vec![0.0; p.value.len()]).collect()
        };
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            t: 0,
            m: zeros(),
            v: zeros(),
        }
    }

    /// 適用済みステップ数
    pub fn steps(&self) -> u32 {
        self.t
    }
}

impl Optimizer for Adam {
    fn step(&mut self, params: &mut ParamSet) {
        debug_assert_eq!(self.m.len(), params.len());
        self.t += 1;
        let bc1 = 1.0 - self.beta1.powi(self.t as i32);
        let bc2 = 1.0 - self.beta2.powi(self.t as i32);

        for ((p, m), v) in params.iter_mut().zip(&mut self.m).zip(&mut self.v) {
            let lr_t = self.lr.for_group(p.group) * bc2.sqrt() / bc1;
            for i in 0..p.value.len() {
                let g = p.grad[i];
                m[i] = self.beta1 * m[i] + (1.0 - self.beta1) * g;
                v[i] = self.beta2 * v[i] + (1.0 - self.beta2) * g * g;
                p.value[i] -= lr_t * m[i] / (v[i].sqrt() + self.epsilon);
            }
        }
    }

    fn set_lr(&mut self, lr: LrConfig) {
        self.lr = lr;
    }

    fn lr(&self) -> LrConfig {
        self.lr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_step_moves_by_lr() {
        // バイアス補正後の初回ステップは符号 × 学習率だけ動く
        let mut params = ParamSet::new();
        let enc = params.register("e", ParamGroup::Encoder, vec![1.0]);
        let head = params.register("h", ParamGroup::Head, vec![1.0]);
        params.get_mut(enc).grad[0] = 0.5;
        params.get_mut(head).grad[0] = -2.0;

        let mut adam = Adam::new(&params, LrConfig { encoder: 0.01, head: 0.1 });
        adam.step(&mut params);
        assert!((params.get(enc).value[0] - 0.99).abs() < 1e-5);
        assert!((params.get(head).value[0] - 1.1).abs() < 1e-5);
        assert_eq!(adam.steps(), 1);
    }

    #[test]
    fn test_zero_grad_from_fresh_state_does_not_move() {
        let mut params = ParamSet::new();
        params.register("e", ParamGroup::Encoder, vec![0.3, -0.2]);
        let mut adam = Adam::new(&params, LrConfig::uniform(1.0));
        adam.step(&mut params);
        assert_eq!(params.flatten_values(), vec![0.3, -0.2]);
    }

    #[test]
    fn test_set_lr() {
        let params = ParamSet::new();
        let mut adam = Adam::new(&params, LrConfig::uniform(1e-3));
        adam.set_lr(LrConfig::uniform(1e-5));
        assert_eq!(adam.lr(), LrConfig::uniform(1e-5));
    }
}
