//! k-fold 学習
//!
//! 学習 CSV を K 分割し、デバイス数だけのワーカーでフォールドを並列に学習する。
//! 全フォールドが成功したらエポックごとの out-of-fold 予測を CSV に書き出す。

use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::MultiProgress;

use rtoxic_core::driver::{Checkpointer, FoldDriver};
use rtoxic_core::encode::TextEncoder;
use rtoxic_core::model::PooledClassifierFactory;
use rtoxic_core::oof::{aggregate, write_tables};
use rtoxic_core::scheduler::{FoldScheduler, plan_folds};
use tools::dataset::load_training_data;
use tools::run::{CommonArgs, encoder_for, init_logging};

#[derive(Parser, Debug)]
#[command(name = "kfold_train")]
#[command(about = "Train a toxic-comment classifier with k-fold cross validation")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    /// フォールド数の上書き
    #[arg(long)]
    folds: Option<usize>,

    /// OOF 予測の出力先の上書き
    #[arg(long)]
    oof_dir: Option<std::path::PathBuf>,
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let start = Instant::now();

    let mut run = cli.common.load_config()?;
    if let Some(k) = cli.folds {
        run.experiment.num_folds = k;
    }
    if let Some(dir) = &cli.oof_dir {
        run.experiment.oof.output_dir = dir.clone();
    }
    run.validate()?;
    let cfg = &run.experiment;

    let store = cli.common.model_store();
    let encoder = encoder_for(store.as_ref(), &cfg.model_name)?;
    let data = load_training_data(&run.data, cfg, &encoder)?;
    log::info!(
        "Loaded {} training examples and {} pseudo labels",
        data.train.len(),
        data.pseudo.len()
    );

    let (folds, pool) = plan_folds(cfg, &data.train).context("failed to plan folds")?;
    if let Some(first) = folds.first() {
        log::info!(
            "Fold 0: train {} + pseudo {}, validation {}",
            first.train_indices.len(),
            data.pseudo.len(),
            first.scored_val(&data.train).len()
        );
    }

    let factory = PooledClassifierFactory::new(store.clone(), cfg.model_name.clone(), cfg.head.output_units);
    let checkpointer = Checkpointer::new(
        store,
        encoder.config(cfg.max_seq_len),
        cfg.checkpoint.clone(),
        cfg.model_name.clone(),
    );
    let metrics = cli.common.metrics_logger()?;
    let progress = MultiProgress::new();

    let mut driver = FoldDriver::new(cfg, &factory)
        .with_checkpointer(&checkpointer)
        .with_pseudo_labels(&data.pseudo)
        .with_progress(&progress);
    if let Some(m) = &metrics {
        driver = driver.with_metrics(m);
    }

    let report = FoldScheduler::new(driver, &pool)
        .with_workers(cfg.worker_count())
        .run(&folds, &data.train, cfg.num_epochs);
    log::info!("ROC AUC per fold and epoch:\n{}", report.score_matrix());

    let results = report.into_complete().context("k-fold training did not complete")?;
    let tables = aggregate(&results, cfg.num_epochs).context("failed to aggregate OOF predictions")?;
    let paths = write_tables(&tables, &cfg.oof, &cfg.model_name, cfg.max_seq_len)
        .context("failed to write OOF predictions")?;

    log::info!(
        "Wrote {} OOF files; total elapsed {:.1}s",
        paths.len(),
        start.elapsed().as_secs_f64()
    );
    Ok(())
}
