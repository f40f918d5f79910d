use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;

use crate::signal::{BandSignal, Sample, TelemetrySink};

/// Keeps a file holding nothing but the latest heart rate.
pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileSink { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TelemetrySink for FileSink {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn on_sample(&mut self, sample: &Sample) -> anyhow::Result<()> {
        let BandSignal::Heartrate(bpm) = sample.signal else {
            return Ok(());
        };
        tokio::fs::write(&self.path, bpm.to_string())
            .await
            .with_context(|| format!("writing {}", self.path.display()))
    }
}
