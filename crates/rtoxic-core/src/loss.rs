//! 損失関数

use serde::{Deserialize, Serialize};

/// 確率のクランプ幅（log(0) 回避）
const EPS: f32 = 1e-7;

/// バッチ損失の集約方法
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LossReduction {
    /// 全要素の平均
    #[default]
    Mean,
    /// 全要素の総和（勾配蓄積を大きいバッチと等価にしたい場合）
    Sum,
}

/// バイナリ交差エントロピー（確率入力）
#[derive(Clone, Copy, Debug, Default)]
pub struct BceLoss {
    reduction: LossReduction,
}

impl BceLoss {
    pub fn new(reduction: LossReduction) -> Self {
        Self { reduction }
    }

    pub fn reduction(&self) -> LossReduction {
        self.reduction
    }

    /// 損失と、確率に対する勾配を返す
    pub fn compute(&self, probs: &[f32], targets: &[f32]) -> (f32, Vec<f32>) {
        debug_assert_eq!(probs.len(), targets.len());
        let scale = match self.reduction {
            LossReduction::Mean => 1.0 / probs.len().max(1) as f32,
            LossReduction::Sum => 1.0,
        };

        let mut loss = 0.0f32;
        let grad = probs
            .iter()
            .zip(targets)
            .map(|(&p, &t)| {
                let p = p.clamp(EPS, 1.0 - EPS);
                loss += -t * p.ln() - (1.0 - t) * (1.0 - p).ln();
                scale * (p - t) / (p * (1.0 - p))
            })
            .collect();
        (loss * scale, grad)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bce_values() {
        let (loss, grad) = BceLoss::new(LossReduction::Mean).compute(&[0.5, 0.5], &[1.0, 0.0]);
        assert!((loss - std::f32::consts::LN_2).abs() < 1e-6);
        assert!((grad[0] + 1.0).abs() < 1e-5);
        assert!((grad[1] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_sum_is_mean_times_count() {
        let probs = [0.2, 0.7, 0.9];
        let targets = [0.0, 1.0, 1.0];
        let (mean, gm) = BceLoss::new(LossReduction::Mean).compute(&probs, &targets);
        let (sum, gs) = BceLoss::new(LossReduction::Sum).compute(&probs, &targets);
        assert!((sum - 3.0 * mean).abs() < 1e-5);
        for (a, b) in gm.iter().zip(&gs) {
            assert!((3.0 * a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_saturated_probability_is_finite() {
        let (loss, grad) = BceLoss::default().compute(&[0.0, 1.0], &[1.0, 0.0]);
        assert!(loss.is_finite());
        assert!(grad.iter().all(|g| g.is_finite()));
    }
}
