use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

use crate::signal::{BandSignal, Sample, TelemetrySink};

const HEADER: &str = "At,Heartrate";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Appends one `<timestamp>,<rate>` row per heart rate sample.
pub struct CsvSink {
    path: PathBuf,
}

impl CsvSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        CsvSink { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TelemetrySink for CsvSink {
    fn name(&self) -> &'static str {
        "csv"
    }

    async fn on_sample(&mut self, sample: &Sample) -> anyhow::Result<()> {
        let BandSignal::Heartrate(bpm) = sample.signal else {
            return Ok(());
        };

        let exists = tokio::fs::try_exists(&self.path).await.unwrap_or(false);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening {}", self.path.display()))?;

        let mut row = String::new();
        if !exists {
            row.push_str(HEADER);
            row.push('\n');
        }
        row.push_str(&format!("{},{bpm}\n", sample.at.format(TIMESTAMP_FORMAT)));

        file.write_all(row.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
