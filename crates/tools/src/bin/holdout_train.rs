//! ホールドアウト学習
//!
//! フォールドを使わずに学習 CSV 全体（と疑似ラベル）で学習し、エポックごとに
//! `[[data.eval]]` の各評価セットで AUC を測る。

use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::Parser;
use indicatif::MultiProgress;

use rtoxic_core::driver::Checkpointer;
use rtoxic_core::encode::TextEncoder;
use rtoxic_core::holdout::HoldoutExperiment;
use rtoxic_core::model::PooledClassifierFactory;
use rtoxic_core::{Dataset, DevicePool};
use tools::dataset::{load_eval_sets, load_training_data};
use tools::run::{CommonArgs, encoder_for, init_logging};

#[derive(Parser, Debug)]
#[command(name = "holdout_train")]
#[command(about = "Train a toxic-comment classifier and score it on held-out evaluation sets")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let start = Instant::now();

    let run = cli.common.load_config()?;
    if run.data.eval.is_empty() {
        bail!("holdout_train needs at least one [[data.eval]] set");
    }
    let cfg = &run.experiment;

    let store = cli.common.model_store();
    let encoder = encoder_for(store.as_ref(), &cfg.model_name)?;
    let data = load_training_data(&run.data, cfg, &encoder)?;
    let train = if data.pseudo.is_empty() {
        data.train
    } else {
        // 疑似ラベルを先頭に置く（k-fold と同じ順序）
        Dataset::concat(vec![Dataset::new(data.pseudo)?, data.train])
            .context("pseudo labels overlap the training ids")?
    };
    let eval_sets = load_eval_sets(&run.data, cfg, &encoder)?;

    let pool = DevicePool::new(&cfg.device_ids())?;
    let factory = PooledClassifierFactory::new(store.clone(), cfg.model_name.clone(), cfg.head.output_units);
    let checkpointer = Checkpointer::new(
        store,
        encoder.config(cfg.max_seq_len),
        cfg.checkpoint.clone(),
        cfg.model_name.clone(),
    );
    let metrics = cli.common.metrics_logger()?;
    let progress = MultiProgress::new();

    let mut experiment = HoldoutExperiment::new(cfg, &factory).with_progress(&progress);
    if cfg.checkpoint.owns(cfg.checkpoint.primary_fold) {
        experiment = experiment.with_checkpointer(&checkpointer);
    }
    if let Some(m) = &metrics {
        experiment = experiment.with_metrics(m);
    }

    let report = experiment.run(&pool, &train, &eval_sets)?;
    for set in &eval_sets {
        let series: Vec<String> = report
            .series(&set.name)
            .into_iter()
            .map(|a| a.map_or_else(|_| "n/a".to_string(), |v| format!("{v:.4}")))
            .collect();
        log::info!("{}: [{}]", set.name, series.join(" "));
    }
    log::info!("Total elapsed {:.1}s", start.elapsed().as_secs_f64());
    Ok(())
}
