use std::fs::File;
use std::io::Write;
use std::path::Path;

use serde::Serialize;

use crate::error::SimError;
use crate::model::StepReport;

pub const RUN_LOG_HEADER: [&str; 7] = [
    "#block",
    "epoch",
    "price",
    "supply",
    "coupons",
    "redeemable",
    "faith",
];

/// Tab-separated per-step log. Only steps in which some agent acted are
/// written.
pub struct RunLog<W: Write> {
    wtr: csv::Writer<W>,
    rows: usize,
}

impl RunLog<File> {
    pub fn create(path: &Path) -> Result<Self, SimError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        RunLog::from_writer(File::create(path)?)
    }
}

impl<W: Write> RunLog<W> {
    pub fn from_writer(inner: W) -> Result<Self, SimError> {
        let mut wtr = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .from_writer(inner);
        wtr.write_record(RUN_LOG_HEADER)?;
        Ok(RunLog { wtr, rows: 0 })
    }

    /// Append `report` if the step was successful. Returns whether a row was written.
    pub fn record(&mut self, report: &StepReport) -> Result<bool, SimError> {
        if !report.anyone_acted {
            return Ok(false);
        }
        self.wtr.write_record(&[
            report.block.to_string(),
            report.epoch.to_string(),
            format!("{:.6}", report.price),
            report.supply.to_string(),
            report.total_coupons.to_string(),
            report.total_redeemable.to_string(),
            format!("{:.2}", report.faith),
        ])?;
        self.wtr.flush()?;
        self.rows += 1;
        Ok(true)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn into_inner(self) -> Result<W, SimError> {
        self.wtr.into_inner().map_err(|e| SimError::Io(e.into_error()))
    }
}

/// End-of-run facts for one worker, saved next to its run log.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub worker: usize,
    pub seed: u64,
    pub started_at: String,
    pub finished_at: String,
    pub steps: u64,
    pub logged_rows: usize,
    pub final_block: Option<u64>,
    pub final_epoch: Option<u64>,
    pub final_price: Option<f64>,
}

impl RunSummary {
    pub fn save_json(&self, path: &Path) -> Result<(), SimError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| SimError::Config(format!("cannot serialise run summary: {}", e)))?;
        std::fs::write(path, json)?;
        Ok(())
    }
}
