//! out-of-fold 予測の集約
//!
//! エポックごとに各フォールドの検証予測を1つの表へ和集合で統合し、ID 順に並べる。
//! 検証集合はフォールド間で素なので、同じ ID が2回現れたら整合性エラーとする。

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::config::OofConfig;
use crate::data::ExampleId;
use crate::driver::FoldResult;
use crate::error::OofError;

/// 1エポック分の OOF 予測（ID 昇順）
#[derive(Clone, Debug, PartialEq)]
pub struct OofTable {
    pub epoch: usize,
    pub rows: Vec<(ExampleId, f32)>,
}

impl OofTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// `id,<column>` 形式の CSV を書く
    pub fn write_csv<W: Write>(&self, w: W, column: &str) -> io::Result<()> {
        let mut wtr = csv::Writer::from_writer(w);
        wtr.write_record(["id", column])?;
        for (id, pred) in &self.rows {
            wtr.write_record([id.to_string(), pred.to_string()])?;
        }
        wtr.flush()?;
        Ok(())
    }
}

/// エポックごとに全フォールドの予測を統合する
pub fn aggregate(results: &[FoldResult], num_epochs: usize) -> Result<Vec<OofTable>, OofError> {
    (0..num_epochs)
        .map(|epoch| {
            let mut merged: BTreeMap<ExampleId, (f32, usize)> = BTreeMap::new();
            for fold in results {
                let er = fold
                    .epochs
                    .iter()
                    .find(|e| e.epoch == epoch)
                    .ok_or(OofError::MissingEpoch {
                        fold_id: fold.fold_id,
                        epoch,
                    })?;
                for (id, pred) in &er.predictions {
                    match merged.entry(id.clone()) {
                        Entry::Vacant(v) => {
                            v.insert((*pred, fold.fold_id));
                        }
                        Entry::Occupied(o) => {
                            return Err(OofError::DuplicateId {
                                id: id.clone(),
                                first: o.get().1,
                                second: fold.fold_id,
                            });
                        }
                    }
                }
            }
            Ok(OofTable {
                epoch,
                rows: merged.into_iter().map(|(id, (p, _))| (id, p)).collect(),
            })
        })
        .collect()
}

/// 出力ファイル名（エポックは 1 始まり）
pub fn file_name(prefix: &str, model_name: &str, epoch: usize, max_seq_len: usize) -> String {
    // "org/model" のような名前でもサブディレクトリを作らない
    let model = model_name.replace(['/', '\\'], "_");
    format!("{prefix}_{model}_{}_{max_seq_len}.csv", epoch + 1)
}

/// 全エポックの表を `config.output_dir` に書き出す
pub fn write_tables(
    tables: &[OofTable],
    config: &OofConfig,
    model_name: &str,
    max_seq_len: usize,
) -> io::Result<Vec<PathBuf>> {
    fs::create_dir_all(&config.output_dir)?;
    tables
        .iter()
        .map(|t| {
            let path = config
                .output_dir
                .join(file_name(&config.prefix, model_name, t.epoch, max_seq_len));
            write_table(t, &path, &config.prediction_column)?;
            log::info!("Wrote {} OOF predictions to {}", t.len(), path.display());
            Ok(path)
        })
        .collect()
}

fn write_table(table: &OofTable, path: &Path, column: &str) -> io::Result<()> {
    table.write_csv(BufWriter::new(File::create(path)?), column)
}
