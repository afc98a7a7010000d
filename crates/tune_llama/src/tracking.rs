//! Experiment tracking: one JSON object per optimizer step in `metrics.jsonl`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub const METRICS_FILE: &str = "metrics.jsonl";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepMetrics {
    pub step: usize,
    pub loss: f64,
    pub lr: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eval_loss: Option<f64>,
    pub grad_norm: f64,
    pub timestamp: String,
}

pub struct MetricsTracker {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl MetricsTracker {
    /// Appends to `<dir>/metrics.jsonl`, so a resumed run continues the same file.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(METRICS_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(
        &mut self,
        step: usize,
        loss: f64,
        lr: f64,
        eval_loss: Option<f64>,
        grad_norm: f64,
    ) -> Result<()> {
        let row = StepMetrics {
            step,
            loss,
            lr,
            eval_loss,
            grad_norm,
            timestamp: chrono::Local::now().to_rfc3339(),
        };
        serde_json::to_writer(&mut self.writer, &row)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

pub fn read_metrics(path: &Path) -> Result<Vec<StepMetrics>> {
    let text = std::fs::read_to_string(path)?;
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(Into::into))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_append_across_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let mut t = MetricsTracker::open(dir.path())?;
            t.record(1, 2.5, 1e-4, None, 0.7)?;
        }
        let mut t = MetricsTracker::open(dir.path())?;
        t.record(2, 2.1, 2e-4, Some(2.3), 0.5)?;

        let rows = read_metrics(t.path())?;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].step, 1);
        assert_eq!(rows[0].eval_loss, None);
        assert_eq!(rows[1].eval_loss, Some(2.3));
        Ok(())
    }
}
