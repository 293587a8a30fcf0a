//! JSON-lines journal of training runs and forecasts.
//!
//! Engines never write files; callers decide when an entry is journaled.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::model::TrainingResult;
use crate::state::Prediction;

const DEFAULT_LOG_DIR: &str = "logs";
const TRAINING_LOG: &str = "training.jsonl";
const FORECAST_LOG: &str = "forecast.jsonl";

fn log_dir<P: AsRef<Path>>(dir: P) -> io::Result<PathBuf> {
    fs::create_dir_all(&dir)?;
    Ok(dir.as_ref().to_path_buf())
}

fn append_json_line<P: AsRef<Path>, T: Serialize>(path: P, value: &T) -> io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    serde_json::to_writer(&mut file, value)
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
    file.write_all(b"\n")
}

fn timestamp_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

#[derive(Debug, Serialize)]
pub struct TrainingLogEntry {
    pub engine: String,
    pub sequences: usize,
    /// `None` when the loss was not finite.
    pub loss: Option<f64>,
    pub converged: bool,
    pub timestamp_ms: u128,
}

pub fn log_training_run<W>(
    engine: &str,
    sequences: usize,
    result: &TrainingResult<W>,
) -> io::Result<()> {
    log_training_run_in(DEFAULT_LOG_DIR, engine, sequences, result)
}

pub fn log_training_run_in<P: AsRef<Path>, W>(
    dir: P,
    engine: &str,
    sequences: usize,
    result: &TrainingResult<W>,
) -> io::Result<()> {
    let dir = log_dir(dir)?;
    let entry = TrainingLogEntry {
        engine: engine.to_string(),
        sequences,
        loss: Some(result.loss).filter(|loss| loss.is_finite()),
        converged: result.converged,
        timestamp_ms: timestamp_ms(),
    };
    append_json_line(dir.join(TRAINING_LOG), &entry)
}

#[derive(Debug, Serialize)]
pub struct ForecastLogEntry {
    pub engine: String,
    pub horizon: usize,
    pub mean: Vec<f64>,
    pub variance: Vec<f64>,
    pub warnings: Vec<String>,
    pub timestamp_ms: u128,
}

pub fn log_forecast(engine: &str, prediction: &Prediction) -> io::Result<()> {
    log_forecast_in(DEFAULT_LOG_DIR, engine, prediction)
}

pub fn log_forecast_in<P: AsRef<Path>>(
    dir: P,
    engine: &str,
    prediction: &Prediction,
) -> io::Result<()> {
    let dir = log_dir(dir)?;
    let entry = ForecastLogEntry {
        engine: engine.to_string(),
        horizon: prediction.horizon,
        mean: prediction.mean.clone(),
        variance: prediction.variance.clone(),
        warnings: prediction
            .early_warnings
            .iter()
            .map(|signal| format!("{}:{}", signal.kind, signal.label))
            .collect(),
        timestamp_ms: timestamp_ms(),
    };
    append_json_line(dir.join(FORECAST_LOG), &entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ConfidenceBand, Trajectory};

    fn scratch_dir(name: &str) -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("cogstate_logging_{}_{}", name, std::process::id()));
        fs::remove_dir_all(&dir).ok();
        dir
    }

    #[test]
    fn training_entries_append_one_line_each() {
        let dir = scratch_dir("training");
        let result = TrainingResult::new(0.05, ());
        log_training_run_in(&dir, "plrnn", 3, &result).unwrap();
        log_training_run_in(&dir, "plrnn", 3, &TrainingResult::new(f64::INFINITY, ())).unwrap();

        let contents = fs::read_to_string(dir.join(TRAINING_LOG)).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["engine"], "plrnn");
        assert_eq!(first["converged"], true);
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert!(second["loss"].is_null());
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn forecast_entry_records_horizon() {
        let dir = scratch_dir("forecast");
        let prediction = Prediction {
            mean: vec![0.5, 0.5],
            variance: vec![0.1, 0.1],
            confidence_band: ConfidenceBand::from_mean_variance(&[0.5, 0.5], &[0.1, 0.1]),
            horizon: 4,
            trajectory: Trajectory::default(),
            early_warnings: Vec::new(),
        };
        log_forecast_in(&dir, "kalmanformer", &prediction).unwrap();

        let contents = fs::read_to_string(dir.join(FORECAST_LOG)).unwrap();
        let entry: serde_json::Value = serde_json::from_str(contents.trim()).unwrap();
        assert_eq!(entry["horizon"], 4);
        assert_eq!(entry["mean"][0], 0.5);
        fs::remove_dir_all(&dir).ok();
    }
}
