//! Experiment run log: one JSON line per training run under
//! `<tracking_dir>/<experiment>/runs.jsonl`.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub experiment: String,
    pub started_at_ms: u64,
    pub finished_at_ms: u64,
    pub params: BTreeMap<String, serde_json::Value>,
    pub metrics: BTreeMap<String, f64>,
}

pub struct Run {
    record: RunRecord,
    log_path: PathBuf,
}

impl Run {
    pub fn start(tracking_dir: &Path, experiment: &str) -> Self {
        Self {
            record: RunRecord {
                experiment: experiment.to_string(),
                started_at_ms: now_ms(),
                finished_at_ms: 0,
                params: BTreeMap::new(),
                metrics: BTreeMap::new(),
            },
            log_path: tracking_dir.join(experiment).join("runs.jsonl"),
        }
    }

    pub fn log_param(&mut self, key: &str, value: impl Serialize) {
        // serialising plain scalars does not fail
        let value = serde_json::to_value(value).unwrap_or(serde_json::Value::Null);
        self.record.params.insert(key.to_string(), value);
    }

    pub fn log_metric(&mut self, key: &str, value: f64) {
        self.record.metrics.insert(key.to_string(), value);
    }

    /// Appends the finished record to the run log and returns it.
    pub fn finish(mut self) -> Result<RunRecord, Error> {
        self.record.finished_at_ms = now_ms();
        let io = |source| Error::Tracking {
            path: self.log_path.clone(),
            source,
        };
        if let Some(dir) = self.log_path.parent() {
            std::fs::create_dir_all(dir).map_err(io)?;
        }
        let mut line = serde_json::to_string(&self.record)
            .map_err(|e| io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        line.push('\n');
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .and_then(|mut f| f.write_all(line.as_bytes()))
            .map_err(io)?;
        Ok(self.record)
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[test]
fn test_runs_are_appended() {
    let dir = tempfile::tempdir().unwrap();

    for accuracy in [0.9, 0.95] {
        let mut run = Run::start(dir.path(), "bulk-discount-model");
        run.log_param("n_estimators", 50);
        run.log_param("seed", 42u64);
        run.log_metric("accuracy", accuracy);
        let record = run.finish().unwrap();
        assert!(record.finished_at_ms >= record.started_at_ms);
    }

    let text =
        std::fs::read_to_string(dir.path().join("bulk-discount-model").join("runs.jsonl")).unwrap();
    let records = text
        .lines()
        .map(|l| serde_json::from_str::<RunRecord>(l).unwrap())
        .collect::<Vec<_>>();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].metrics["accuracy"], 0.9);
    assert_eq!(records[1].metrics["accuracy"], 0.95);
    assert_eq!(records[1].params["n_estimators"], serde_json::json!(50));
}
