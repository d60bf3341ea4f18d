use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::path::Path;
use std::process::Command;

fn write_config(dir: &Path, experiment: &str) -> std::path::PathBuf {
    let train = dir.join("train.csv");
    let mut csv = String::from("id,comment_text,lang,toxic\n");
    let langs = ["en", "es", "fr", "it", "pt", "ru", "tr"];
    for i in 0..24 {
        let word = if i % 3 == 0 { "idiot stupid" } else { "thanks friend" };
        csv.push_str(&format!("{i},{word} {i},{},{}\n", langs[i % 7], (i % 3 == 0) as u8));
    }
    std::fs::write(&train, csv).unwrap();

    let cfg = dir.join("run.toml");
    let body = format!(
        "[experiment]\n{experiment}\n\n[[data.train]]\npath = {:?}\n\n[[data.eval]]\nname = \"raw\"\npath = {:?}\n",
        train.display().to_string(),
        train.display().to_string()
    );
    std::fs::write(&cfg, body).unwrap();
    cfg
}

#[test]
fn cli_single_fold_config_fails_before_training() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = write_config(tmp.path(), "num_folds = 1\ndevices = [0]");
    let mut cmd = Command::cargo_bin("kfold_train").unwrap();
    cmd.arg("--config")
        .arg(&cfg)
        .assert()
        .failure()
        .stderr(predicate::str::contains("num_folds"));
    assert!(!tmp.path().join("models").exists());
}

#[test]
fn cli_duplicate_devices_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = write_config(tmp.path(), "devices = [0, 0]");
    let mut cmd = Command::cargo_bin("kfold_train").unwrap();
    cmd.arg("--config")
        .arg(&cfg)
        .assert()
        .failure()
        .stderr(predicate::str::contains("more than once"));
}

#[test]
fn cli_missing_config_fails() {
    let mut cmd = Command::cargo_bin("kfold_train").unwrap();
    cmd.arg("--config")
        .arg("does/not/exist.toml")
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to read config"));
}

#[test]
fn cli_requires_config_exits_2() {
    let mut cmd = Command::cargo_bin("holdout_train").unwrap();
    cmd.assert().failure().code(predicate::eq(2));
}

#[test]
fn cli_small_kfold_run_writes_oof() {
    let tmp = tempfile::tempdir().unwrap();
    let experiment = format!(
        "model_name = \"tiny\"\nmax_seq_len = 6\nnum_folds = 3\nnum_epochs = 2\nbatch_size = 4\n\
         devices = [0, 1]\nmax_encode_cores = 2\n\n\
         [experiment.checkpoint]\nscope = \"none\"\n\n\
         [experiment.oof]\noutput_dir = {:?}\n",
        tmp.path().join("oof").display().to_string()
    );
    let cfg = write_config(tmp.path(), &experiment);
    let mut cmd = Command::cargo_bin("kfold_train").unwrap();
    cmd.arg("--config")
        .arg(&cfg)
        .arg("--vocab-size")
        .arg("128")
        .arg("--hidden-dim")
        .arg("4")
        .assert()
        .success();

    for epoch in 1..=2 {
        let path = tmp.path().join(format!("oof/kfolds_tiny_{epoch}_6.csv"));
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().next(), Some("id,toxic"));
        assert_eq!(text.lines().count(), 25);
    }
}

#[test]
fn cli_small_holdout_run_writes_metrics() {
    let tmp = tempfile::tempdir().unwrap();
    let experiment = "model_name = \"tiny\"\nmax_seq_len = 6\nnum_epochs = 1\nbatch_size = 4\n\
                      devices = [0]\n\n[experiment.checkpoint]\nscope = \"none\"\n";
    let cfg = write_config(tmp.path(), experiment);
    let metrics = tmp.path().join("metrics.jsonl");
    let mut cmd = Command::cargo_bin("holdout_train").unwrap();
    cmd.arg("--config")
        .arg(&cfg)
        .arg("--vocab-size")
        .arg("128")
        .arg("--hidden-dim")
        .arg("4")
        .arg("--metrics-log")
        .arg(&metrics)
        .assert()
        .success();

    let text = std::fs::read_to_string(&metrics).unwrap();
    let line: serde_json::Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
    assert_eq!(line["epoch"], 0);
    assert_eq!(line["eval_set"], "raw");
}
