//! CSV データソース
//!
//! `{id, <テキスト列>, toxic[, lang]}` 形式の CSV を読み、テキストをエンコードして
//! `Dataset` を作る。学習ソースは複数ファイルをサンプリング率と検証対象フラグ付きで
//! 結合できる。疑似ラベルはテキスト CSV と蒸留ラベル CSV を ID で突き合わせる。

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use rtoxic_core::encode::{TextEncoder, batch_encode};
use rtoxic_core::error::ConfigError;
use rtoxic_core::holdout::EvalSet;
use rtoxic_core::{Dataset, Example, ExampleId, ExperimentConfig, Language};

use crate::common::io::csv_reader;

fn default_text_column() -> String {
    "comment_text".to_string()
}

fn default_sample_frac() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

/// 学習用 CSV
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CsvSource {
    pub path: PathBuf,
    /// 読み込む行の割合 (0, 1]
    #[serde(default = "default_sample_frac")]
    pub sample_frac: f64,
    /// false なら学習のみに使い、検証スコアと OOF には含めない
    #[serde(default = "default_true")]
    pub validation_eligible: bool,
    /// 省略時は `DataConfig::text_column`
    #[serde(default)]
    pub text_column: Option<String>,
}

/// 疑似ラベル（テキスト CSV + 蒸留ラベル CSV）
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PseudoSource {
    pub text: PathBuf,
    /// `{id, toxic}` の蒸留ラベル
    pub labels: PathBuf,
    #[serde(default)]
    pub text_column: Option<String>,
}

/// ホールドアウト実験の評価用 CSV
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EvalSource {
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    pub text_column: Option<String>,
}

/// `[data]` セクション
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub text_column: String,
    pub train: Vec<CsvSource>,
    pub pseudo: Option<PseudoSource>,
    pub eval: Vec<EvalSource>,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            text_column: default_text_column(),
            train: Vec::new(),
            pseudo: None,
            eval: Vec::new(),
        }
    }
}

impl DataConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.train.is_empty() {
            return Err(ConfigError::Invalid("at least one [[data.train]] source is required".into()));
        }
        for src in &self.train {
            if !(src.sample_frac > 0.0 && src.sample_frac <= 1.0) {
                return Err(ConfigError::Invalid(format!(
                    "sample_frac for {} must be in (0, 1], got {}",
                    src.path.display(),
                    src.sample_frac
                )));
            }
        }
        let mut names = HashSet::new();
        for e in &self.eval {
            if !names.insert(e.name.as_str()) {
                return Err(ConfigError::Invalid(format!("eval set '{}' listed more than once", e.name)));
            }
        }
        Ok(())
    }

    fn column_for<'a>(&'a self, explicit: &'a Option<String>) -> &'a str {
        explicit.as_deref().unwrap_or(&self.text_column)
    }
}

/// CSV の1行
#[derive(Clone, Debug, PartialEq)]
pub struct RawRecord {
    pub id: String,
    pub text: String,
    /// toxic 列が無いファイル（テスト用テキストなど）では `None`
    pub toxic: Option<f32>,
    pub lang: Language,
}

fn column_index(headers: &csv::StringRecord, name: &str, path: &Path) -> Result<usize> {
    headers
        .iter()
        .position(|h| h.trim() == name)
        .with_context(|| format!("{}: missing column '{name}'", path.display()))
}

/// CSV を読む。`lang` 列が無ければ英語とみなす
pub fn read_records(path: &Path, text_column: &str) -> Result<Vec<RawRecord>> {
    let mut rdr = csv_reader(path).with_context(|| format!("failed to open {}", path.display()))?;
    let headers = rdr.headers()?.clone();
    let id_col = column_index(&headers, "id", path)?;
    let text_col = column_index(&headers, text_column, path)?;
    let toxic_col = headers.iter().position(|h| h.trim() == "toxic");
    let lang_col = headers.iter().position(|h| h.trim() == "lang");

    let mut records = Vec::new();
    for (i, row) in rdr.records().enumerate() {
        let row = row.with_context(|| format!("{}: failed to read row {}", path.display(), i + 1))?;
        let field = |c: usize| row.get(c).unwrap_or_default();

        let toxic = match toxic_col {
            Some(c) => Some(field(c).trim().parse::<f32>().with_context(|| {
                format!("{}: row {}: invalid toxic value '{}'", path.display(), i + 1, field(c))
            })?),
            None => None,
        };
        let lang = match lang_col {
            Some(c) => field(c)
                .parse::<Language>()
                .with_context(|| format!("{}: row {}", path.display(), i + 1))?,
            None => Language::En,
        };
        records.push(RawRecord {
            id: field(id_col).trim().to_string(),
            text: field(text_col).to_string(),
            toxic,
            lang,
        });
    }
    Ok(records)
}

/// `{id, toxic}` の蒸留ラベルを読む
fn read_distill_labels(path: &Path) -> Result<HashMap<ExampleId, f32>> {
    let mut rdr = csv_reader(path).with_context(|| format!("failed to open {}", path.display()))?;
    let headers = rdr.headers()?.clone();
    let id_col = column_index(&headers, "id", path)?;
    let toxic_col = column_index(&headers, "toxic", path)?;

    let mut labels = HashMap::new();
    for (i, row) in rdr.records().enumerate() {
        let row = row.with_context(|| format!("{}: failed to read row {}", path.display(), i + 1))?;
        let id = ExampleId::parse(row.get(id_col).unwrap_or_default());
        let raw = row.get(toxic_col).unwrap_or_default();
        let toxic: f32 = raw
            .trim()
            .parse()
            .with_context(|| format!("{}: row {}: invalid toxic value '{raw}'", path.display(), i + 1))?;
        labels.insert(id, toxic);
    }
    Ok(labels)
}

/// 行を割合 `frac` だけ無作為に残す（元の行順は保つ）
pub fn sample_records(records: Vec<RawRecord>, frac: f64, rng: &mut ChaCha8Rng) -> Vec<RawRecord> {
    if frac >= 1.0 {
        return records;
    }
    let amount = ((records.len() as f64 * frac).round() as usize).min(records.len());
    let mut keep = vec![false; records.len()];
    for i in rand::seq::index::sample(rng, records.len(), amount).iter() {
        keep[i] = true;
    }
    records.into_iter().zip(keep).filter_map(|(r, k)| k.then_some(r)).collect()
}

/// 学習ソースを読み込み、(レコード, 検証対象フラグ) の列にする
pub fn load_sources(data: &DataConfig, seed: u64) -> Result<Vec<(RawRecord, bool)>> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut out = Vec::new();
    for src in &data.train {
        let records = read_records(&src.path, data.column_for(&src.text_column))?;
        if records.iter().any(|r| r.toxic.is_none()) {
            bail!("{}: training source needs a 'toxic' column", src.path.display());
        }
        let total = records.len();
        let kept = sample_records(records, src.sample_frac, &mut rng);
        log::info!(
            "Loaded {}/{total} rows from {} (validation_eligible={})",
            kept.len(),
            src.path.display(),
            src.validation_eligible
        );
        out.extend(kept.into_iter().map(|r| (r, src.validation_eligible)));
    }
    Ok(out)
}

/// 疑似ラベルを読み込む（テキスト CSV の行順に蒸留ラベルを揃える）
pub fn load_pseudo(src: &PseudoSource, default_column: &str) -> Result<Vec<RawRecord>> {
    let column = src.text_column.as_deref().unwrap_or(default_column);
    let texts = read_records(&src.text, column)?;
    let labels = read_distill_labels(&src.labels)?;

    let records = texts
        .into_iter()
        .map(|r| {
            let id = ExampleId::parse(&r.id);
            let toxic = labels.get(&id).copied().ok_or(ConfigError::MissingDistillLabel(id))?;
            Ok(RawRecord {
                toxic: Some(toxic),
                ..r
            })
        })
        .collect::<Result<Vec<_>>>()?;
    log::info!("Loaded {} pseudo-labelled rows from {}", records.len(), src.text.display());
    Ok(records)
}

/// レコードをエンコードしてサンプル列にする
pub fn encode_records<E: TextEncoder + ?Sized>(
    records: Vec<(RawRecord, bool)>,
    encoder: &E,
    config: &ExperimentConfig,
) -> Result<Vec<Example>> {
    let (meta, texts): (Vec<_>, Vec<String>) = records
        .into_iter()
        .map(|(r, eligible)| ((r.id, r.toxic, r.lang, eligible), r.text))
        .unzip();
    let features = batch_encode(encoder, &texts, config.max_seq_len, config.max_encode_cores)?;
    let per_language = config.head.per_language();

    meta.into_iter()
        .zip(features)
        .map(|((id, toxic, lang, eligible), f)| {
            let toxic = toxic.with_context(|| format!("row with id {id} has no toxic label"))?;
            Ok(Example::new(ExampleId::parse(&id), f, toxic, lang, eligible, per_language))
        })
        .collect()
}

/// 学習データと疑似ラベル
pub struct TrainingData {
    pub train: Dataset,
    /// 全フォールドの学習データ先頭に加える（検証しない）
    pub pseudo: Vec<Example>,
}

/// 学習ソースと疑似ラベルを読み込んでエンコードする
pub fn load_training_data<E: TextEncoder + ?Sized>(
    data: &DataConfig,
    config: &ExperimentConfig,
    encoder: &E,
) -> Result<TrainingData> {
    let train = Dataset::new(encode_records(load_sources(data, config.seed)?, encoder, config)?)?;
    let pseudo = match &data.pseudo {
        Some(src) => {
            let records = load_pseudo(src, &data.text_column)?;
            encode_records(records.into_iter().map(|r| (r, false)).collect(), encoder, config)?
        }
        None => Vec::new(),
    };
    if !pseudo.is_empty() {
        train.check_compatible(&Dataset::new(pseudo.clone())?)?;
        // 疑似ラベルは全フォールドの学習側に入るので学習 ID と重なってはならない
        let train_ids: HashSet<&ExampleId> = train.examples().iter().map(|e| &e.id).collect();
        if let Some(dup) = pseudo.iter().find(|e| train_ids.contains(&e.id)) {
            return Err(ConfigError::DuplicateId(dup.id.clone()).into());
        }
    }
    Ok(TrainingData { train, pseudo })
}

/// 評価セットを読み込む
pub fn load_eval_sets<E: TextEncoder + ?Sized>(
    data: &DataConfig,
    config: &ExperimentConfig,
    encoder: &E,
) -> Result<Vec<EvalSet>> {
    data.eval
        .iter()
        .map(|src| {
            let records = read_records(&src.path, data.column_for(&src.text_column))?;
            let examples = encode_records(records.into_iter().map(|r| (r, true)).collect(), encoder, config)?;
            let dataset = Dataset::new(examples)
                .with_context(|| format!("eval set '{}' ({})", src.name, src.path.display()))?;
            Ok(EvalSet {
                name: src.name.clone(),
                data: dataset,
            })
        })
        .collect()
}
