//! プーリングヘッド付き分類器
//!
//! トークン埋め込み（エンコーダ）→ カーネル幅1の畳み込み（hidden → 出力次元）
//! → 系列方向の max-pool → sigmoid。
//!
//! max-pool の勾配は最大値を取ったトークン位置にだけ流れる。

use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use super::{Classifier, ModelFactory, ParamGroup, ParamId, ParamSet};
use crate::device::DeviceId;
use crate::error::TrainError;
use crate::precision::round_f16;
use crate::store::{EncoderConfig, ModelStore, PretrainedEncoder};

#[inline]
fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// 逆伝播用のキャッシュ
#[derive(Clone, Debug, Default)]
struct ForwardCache {
    /// (サンプル, 出力) ごとの最大値を取ったトークン
    argmax: Vec<Option<u32>>,
    probs: Vec<f32>,
    freeze: bool,
}

/// プーリングヘッド付き分類器
#[derive(Clone, Debug)]
pub struct PooledClassifier {
    params: ParamSet,
    embedding: ParamId,
    conv_w: ParamId,
    conv_b: ParamId,
    encoder: EncoderConfig,
    output_dim: usize,
    half: bool,
    cache: Option<ForwardCache>,
}

impl PooledClassifier {
    /// 事前学習済みエンコーダからモデルを作る（ヘッドは `seed` で初期化）
    pub fn new(pretrained: PretrainedEncoder, output_dim: usize, seed: u64) -> Result<Self, TrainError> {
        pretrained.validate()?;
        if output_dim == 0 {
            return Err(TrainError::DimensionMismatch {
                what: "head output",
                expected: 1,
                actual: 0,
            });
        }

        let hidden = pretrained.config.hidden_dim;
        let bound = 1.0 / (hidden.max(1) as f32).sqrt();
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let conv_w_init: Vec<f32> =
            (0..output_dim * hidden).map(|_| rng.random_range(-bound..=bound)).collect();
        let conv_b_init: Vec<f32> = (0..output_dim).map(|_| rng.random_range(-bound..=bound)).collect();

        let mut params = ParamSet::new();
        let embedding = params.register("encoder.embedding", ParamGroup::Encoder, pretrained.weights);
        let conv_w = params.register("head.conv.weight", ParamGroup::Head, conv_w_init);
        let conv_b = params.register("head.conv.bias", ParamGroup::Head, conv_b_init);

        Ok(Self {
            params,
            embedding,
            conv_w,
            conv_b,
            encoder: pretrained.config,
            output_dim,
            half: false,
            cache: None,
        })
    }

    #[inline]
    fn row(&self, token: u32) -> usize {
        token as usize % self.encoder.vocab_size
    }

    /// トークンの隠れ状態
    fn hidden(&self, token: u32) -> impl Iterator<Item = f32> + '_ {
        let h = self.encoder.hidden_dim;
        let start = self.row(token) * h;
        let half = self.half;
        self.params.get(self.embedding).value[start..start + h]
            .iter()
            .map(move |&v| if half { round_f16(v) } else { v })
    }

    /// 1サンプル分のロジットと argmax トークン
    fn pool(&self, tokens: &[u32], out: usize) -> (f32, Option<u32>) {
        let h = self.encoder.hidden_dim;
        let w = &self.params.get(self.conv_w).value[out * h..(out + 1) * h];
        let b = self.params.get(self.conv_b).value[out];

        let mut best: Option<(f32, u32)> = None;
        for &tok in tokens {
            let z: f32 = self.hidden(tok).zip(w).map(|(x, &wi)| x * wi).sum::<f32>() + b;
            if best.is_none_or(|(bz, _)| z > bz) {
                best = Some((z, tok));
            }
        }
        match best {
            Some((z, tok)) => (z, Some(tok)),
            None => (b, None),
        }
    }

    fn run(&self, batch: &[&[u32]]) -> (Vec<f32>, Vec<Option<u32>>) {
        let mut probs = Vec::with_capacity(batch.len() * self.output_dim);
        let mut argmax = Vec::with_capacity(batch.len() * self.output_dim);
        for tokens in batch {
            for out in 0..self.output_dim {
                let (z, tok) = self.pool(tokens, out);
                probs.push(sigmoid(z));
                argmax.push(tok);
            }
        }
        (probs, argmax)
    }
}

impl Classifier for PooledClassifier {
    fn output_dim(&self) -> usize {
        self.output_dim
    }

    fn forward(&mut self, batch: &[&[u32]], freeze: bool) -> Vec<f32> {
        let (probs, argmax) = self.run(batch);
        self.cache = Some(ForwardCache {
            argmax,
            probs: probs.clone(),
            freeze,
        });
        probs
    }

    fn backward(&mut self, grad_output: &[f32]) {
        let Some(cache) = self.cache.take() else {
            log::warn!("backward called without a preceding forward");
            return;
        };
        debug_assert_eq!(grad_output.len(), cache.probs.len());

        let h = self.encoder.hidden_dim;
        for (i, (&g, &p)) in grad_output.iter().zip(&cache.probs).enumerate() {
            let out = i % self.output_dim;
            let dz = g * p * (1.0 - p);
            self.params.get_mut(self.conv_b).grad[out] += dz;

            let Some(tok) = cache.argmax[i] else {
                continue;
            };
            let hidden: Vec<f32> = self.hidden(tok).collect();
            let w: Vec<f32> = self.params.get(self.conv_w).value[out * h..(out + 1) * h].to_vec();

            let w_grad = &mut self.params.get_mut(self.conv_w).grad[out * h..(out + 1) * h];
            for (gw, x) in w_grad.iter_mut().zip(&hidden) {
                *gw += dz * x;
            }

            if !cache.freeze {
                let start = self.row(tok) * h;
                let e_grad = &mut self.params.get_mut(self.embedding).grad[start..start + h];
                for (ge, wi) in e_grad.iter_mut().zip(&w) {
                    *ge += dz * wi;
                }
            }
        }
    }

    fn predict(&self, batch: &[&[u32]]) -> Vec<f32> {
        self.run(batch).0
    }

    fn params(&self) -> &ParamSet {
        &self.params
    }

    fn params_mut(&mut self) -> &mut ParamSet {
        &mut self.params
    }

    fn encoder_config(&self) -> &EncoderConfig {
        &self.encoder
    }

    fn set_mixed_precision(&mut self, enabled: bool) {
        self.half = enabled;
    }
}

/// ストアから事前学習済みエンコーダを読み込んで `PooledClassifier` を作る
#[derive(Clone)]
pub struct PooledClassifierFactory {
    store: Arc<dyn ModelStore>,
    model_name: String,
    output_dim: usize,
}

impl PooledClassifierFactory {
    pub fn new(store: Arc<dyn ModelStore>, model_name: impl Into<String>, output_dim: usize) -> Self {
        Self {
            store,
            model_name: model_name.into(),
            output_dim,
        }
    }

    pub fn store(&self) -> &Arc<dyn ModelStore> {
        &self.store
    }
}

impl ModelFactory for PooledClassifierFactory {
    type Model = PooledClassifier;

    fn build(&self, device: DeviceId, seed: u64) -> Result<PooledClassifier, TrainError> {
        log::debug!("building {} on {device} (seed {seed})", self.model_name);
        let pretrained = self.store.load(&self.model_name)?;
        PooledClassifier::new(pretrained, self.output_dim, seed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SeededStore;

    fn model(output_dim: usize) -> PooledClassifier {
        let pretrained = SeededStore::new(8, 3).load("test").unwrap();
        PooledClassifier::new(pretrained, output_dim, 1).unwrap()
    }

    /// パラメータ要素を `eps` だけずらしたときの出力の総和
    fn perturbed_sum(m: &PooledClassifier, id: ParamId, idx: usize, eps: f32, batch: &[&[u32]]) -> f32 {
        let mut m = m.clone();
        m.params_mut().get_mut(id).value[idx] += eps;
        m.predict(batch).iter().sum()
    }

    #[test]
    fn test_forward_matches_predict() {
        let mut m = model(2);
        let batch: Vec<&[u32]> = vec![&[1, 2, 3], &[4, 5, 0]];
        let train = m.forward(&batch, false);
        assert_eq!(train, m.predict(&batch));
        assert_eq!(train.len(), 4);
        assert!(train.iter().all(|&p| p > 0.0 && p < 1.0));
    }

    #[test]
    fn test_gradient_matches_finite_difference() {
        let mut m = model(1);
        let batch: Vec<&[u32]> = vec![&[1, 6, 3], &[2, 2, 7]];
        let probs = m.forward(&batch, false);
        m.backward(&vec![1.0; probs.len()]);

        let eps = 1e-3;
        for id in [m.conv_w, m.conv_b] {
            for idx in 0..m.params().get(id).value.len() {
                let numeric = (perturbed_sum(&m, id, idx, eps, &batch)
                    - perturbed_sum(&m, id, idx, -eps, &batch))
                    / (2.0 * eps);
                let analytic = m.params().get(id).grad[idx];
                assert!((numeric - analytic).abs() < 1e-2, "{id:?}[{idx}]: {numeric} vs {analytic}");
            }
        }
    }

    #[test]
    fn test_freeze_skips_encoder_grad() {
        let mut m = model(1);
        let batch: Vec<&[u32]> = vec![&[1, 2, 3]];
        m.forward(&batch, true);
        m.backward(&[1.0]);
        assert!(m.params().get(m.embedding).grad.iter().all(|&g| g == 0.0));
        assert!(m.params().get(m.conv_w).grad.iter().any(|&g| g != 0.0));

        m.params_mut().zero_grad();
        m.forward(&batch, false);
        m.backward(&[1.0]);
        assert!(m.params().get(m.embedding).grad.iter().any(|&g| g != 0.0));
    }

    #[test]
    fn test_mixed_precision_rounds_hidden() {
        let mut m = model(1);
        let batch: Vec<&[u32]> = vec![&[1, 2, 3]];
        let full = m.predict(&batch)[0];
        m.set_mixed_precision(true);
        let half = m.predict(&batch)[0];
        assert!((full - half).abs() < 1e-3);
    }

    #[test]
    fn test_rejects_mismatched_weights() {
        let mut pretrained = SeededStore::new(8, 3).load("test").unwrap();
        pretrained.weights.pop();
        assert!(PooledClassifier::new(pretrained, 1, 0).is_err());
    }
}
