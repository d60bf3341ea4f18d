//! 混合精度
//!
//! 隠れ状態を f16 に丸め、動的ロススケーリングで勾配のアンダーフローを防ぐ。
//! 勾配はスケールされたまま蓄積し、オプティマイザ適用前にまとめて戻す。
//! 非有限の勾配が見つかったステップはスキップしてスケールを下げる。

use half::f16;

use crate::model::ParamSet;

/// f16 を経由して丸める
#[inline]
pub fn round_f16(x: f32) -> f32 {
    f16::from_f32(x).to_f32()
}

/// 動的ロススケーラ
#[derive(Clone, Debug)]
pub struct LossScaler {
    scale: f32,
    growth_factor: f32,
    backoff_factor: f32,
    growth_interval: usize,
    steps_since_growth: usize,
    overflow_count: usize,
}

impl LossScaler {
    pub fn new(initial_scale: f32, growth_interval: usize) -> Self {
        Self {
            scale: initial_scale,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: growth_interval.max(1),
            steps_since_growth: 0,
            overflow_count: 0,
        }
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// 損失の勾配にスケールを掛ける
    pub fn scale_grad(&self, grad: &mut [f32]) {
        for g in grad {
            *g *= self.scale;
        }
    }

    /// 蓄積済み勾配を戻し、すべて有限なら真を返す
    pub fn unscale_and_check(&self, params: &mut ParamSet) -> bool {
        let inv = 1.0 / self.scale;
        let mut finite = true;
        for p in params.iter_mut() {
            for g in &mut p.grad {
                *g *= inv;
                finite &= g.is_finite();
            }
        }
        finite
    }

    /// ステップ後にスケールを更新する
    pub fn update(&mut self, grads_valid: bool) {
        if grads_valid {
            self.steps_since_growth += 1;
            if self.steps_since_growth >= self.growth_interval {
                self.scale *= self.growth_factor;
                self.steps_since_growth = 0;
            }
        } else {
            self.overflow_count += 1;
            self.scale = (self.scale * self.backoff_factor).max(1.0);
            self.steps_since_growth = 0;
            log::debug!("gradient overflow, loss scale -> {}", self.scale);
        }
    }

    pub fn overflow_count(&self) -> usize {
        self.overflow_count
    }
}
