//! 事前学習モデルのストアとチェックポイント保存
//!
//! ディレクトリ形式:
//! - `config.json`: `{"encoder": EncoderConfig, ...}`
//! - `encoder.bin`: エンコーダ重み（f32 リトルエンディアン、vocab × hidden）
//! - `head.bin`: ヘッド重み（チェックポイントのみ）
//! - `tokenizer.json`: トークナイザ設定（チェックポイントのみ）
//!
//! チェックポイントもそのまま事前学習モデルとして読み込める。

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::encode::TokenizerConfig;
use crate::error::TrainError;
use crate::model::{Classifier, ParamGroup};

/// エンコーダ設定
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderConfig {
    pub model_name: String,
    pub vocab_size: usize,
    pub hidden_dim: usize,
}

impl EncoderConfig {
    pub fn weight_len(&self) -> usize {
        self.vocab_size * self.hidden_dim
    }
}

/// 事前学習済みエンコーダ
#[derive(Clone, Debug)]
pub struct PretrainedEncoder {
    pub config: EncoderConfig,
    pub weights: Vec<f32>,
}

impl PretrainedEncoder {
    pub fn validate(&self) -> Result<(), TrainError> {
        if self.weights.len() != self.config.weight_len() {
            return Err(TrainError::DimensionMismatch {
                what: "encoder weights",
                expected: self.config.weight_len(),
                actual: self.weights.len(),
            });
        }
        Ok(())
    }
}

/// 事前学習モデルの読み込みとチェックポイント保存
pub trait ModelStore: Send + Sync {
    fn load(&self, model_name: &str) -> Result<PretrainedEncoder, TrainError>;

    fn save(
        &self,
        dir: &Path,
        model: &dyn Classifier,
        tokenizer: &TokenizerConfig,
    ) -> Result<(), TrainError> {
        write_checkpoint(dir, model, tokenizer)
    }
}

#[derive(Serialize)]
struct CheckpointMeta<'a> {
    encoder: &'a EncoderConfig,
    output_dim: usize,
    params: Vec<ParamMeta>,
    saved_at: String,
}

#[derive(Serialize)]
struct ParamMeta {
    name: &'static str,
    group: ParamGroup,
    len: usize,
}

#[derive(Deserialize)]
struct StoredConfig {
    encoder: EncoderConfig,
}

/// モデルをディレクトリへ保存する
pub fn write_checkpoint(
    dir: &Path,
    model: &dyn Classifier,
    tokenizer: &TokenizerConfig,
) -> Result<(), TrainError> {
    fs::create_dir_all(dir)?;

    let params = model.params();
    let meta = CheckpointMeta {
        encoder: model.encoder_config(),
        output_dim: model.output_dim(),
        params: params
            .iter()
            .map(|(_, p)| ParamMeta {
                name: p.name,
                group: p.group,
                len: p.value.len(),
            })
            .collect(),
        saved_at: chrono::Utc::now().to_rfc3339(),
    };
    let mut w = BufWriter::new(File::create(dir.join("config.json"))?);
    serde_json::to_writer_pretty(&mut w, &meta)?;
    w.flush()?;

    for (group, file) in [(ParamGroup::Encoder, "encoder.bin"), (ParamGroup::Head, "head.bin")] {
        let values = params.iter().filter(|(_, p)| p.group == group).flat_map(|(_, p)| p.value.iter());
        write_f32s(&dir.join(file), values)?;
    }

    let mut w = BufWriter::new(File::create(dir.join("tokenizer.json"))?);
    serde_json::to_writer_pretty(&mut w, tokenizer)?;
    w.flush()?;
    Ok(())
}

fn write_f32s<'a>(path: &Path, values: impl Iterator<Item = &'a f32>) -> Result<(), TrainError> {
    let mut w = BufWriter::new(File::create(path)?);
    for &v in values {
        w.write_f32::<LittleEndian>(v)?;
    }
    w.flush()?;
    Ok(())
}

fn read_f32s(path: &Path, len: usize) -> Result<Vec<f32>, TrainError> {
    let file = File::open(path)?;
    let actual = file.metadata()?.len() as usize / std::mem::size_of::<f32>();
    if actual != len {
        return Err(TrainError::DimensionMismatch {
            what: "encoder.bin",
            expected: len,
            actual,
        });
    }
    let mut r = BufReader::new(file);
    let mut out = vec![0.0f32; len];
    r.read_f32_into::<LittleEndian>(&mut out)?;
    Ok(out)
}

/// ディレクトリベースのストア（`<root>/<model_name>/`）
#[derive(Clone, Debug)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ModelStore for DirStore {
    fn load(&self, model_name: &str) -> Result<PretrainedEncoder, TrainError> {
        let dir = self.root.join(model_name);
        let cfg_path = dir.join("config.json");
        let file = File::open(&cfg_path).map_err(|e| {
            TrainError::Store(format!("failed to open {}: {e}", cfg_path.display()))
        })?;
        let stored: StoredConfig = serde_json::from_reader(BufReader::new(file))?;
        let weights = read_f32s(&dir.join("encoder.bin"), stored.encoder.weight_len())?;
        let encoder = PretrainedEncoder {
            config: stored.encoder,
            weights,
        };
        encoder.validate()?;
        Ok(encoder)
    }
}

/// モデル名から決定的に重みを生成するストア（スモークテスト用）
#[derive(Clone, Debug)]
pub struct SeededStore {
    pub vocab_size: usize,
    pub hidden_dim: usize,
    pub init_scale: f32,
}

impl SeededStore {
    pub fn new(vocab_size: usize, hidden_dim: usize) -> Self {
        Self {
            vocab_size,
            hidden_dim,
            init_scale: 0.5,
        }
    }
}

impl ModelStore for SeededStore {
    fn load(&self, model_name: &str) -> Result<PretrainedEncoder, TrainError> {
        let config = EncoderConfig {
            model_name: model_name.to_string(),
            vocab_size: self.vocab_size,
            hidden_dim: self.hidden_dim,
        };
        let mut rng = ChaCha8Rng::seed_from_u64(fnv1a(model_name.as_bytes()));
        let s = self.init_scale;
        let weights = (0..config.weight_len()).map(|_| rng.random_range(-s..s)).collect();
        Ok(PretrainedEncoder { config, weights })
    }
}

/// FNV-1a（プロセスをまたいで安定なハッシュ）
pub(crate) fn fnv1a(bytes: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        h ^= b as u64;
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    h
}
