//! File-backed state for a stack: last run report, outputs, audit trail
//! and the simulated cloud.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use crate::api::{ProvisioningEvent, RecordedEvent, StackOutputs};
use crate::runtime::{SimSnapshot, StatusReport};

const REPORT_FILE: &str = "report.json";
const OUTPUTS_FILE: &str = "outputs.json";
const EVENTS_FILE: &str = "events.jsonl";
const CLOUD_FILE: &str = "cloud.json";

/// One directory per stack under the configured state root.
pub struct StateRepository {
    dir: PathBuf,
}

impl StateRepository {
    pub fn new(root: &Path, stack: &str) -> Self {
        Self {
            dir: root.join(stack),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn write_json<T: Serialize>(&self, file: &str, value: &T) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating state directory {}", self.dir.display()))?;
        let path = self.dir.join(file);
        let tmp = self.dir.join(format!("{file}.tmp"));
        let body = serde_json::to_vec_pretty(value)?;
        tokio::fs::write(&tmp, body)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    }

    async fn read_json<T: DeserializeOwned>(&self, file: &str) -> Result<Option<T>> {
        let path = self.dir.join(file);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .with_context(|| format!("parsing {}", path.display()))?;
                Ok(Some(value))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }

    pub async fn save_report(&self, report: &StatusReport) -> Result<()> {
        self.write_json(REPORT_FILE, report).await
    }

    pub async fn load_report(&self) -> Result<Option<StatusReport>> {
        self.read_json(REPORT_FILE).await
    }

    pub async fn save_outputs(&self, outputs: &StackOutputs) -> Result<()> {
        self.write_json(OUTPUTS_FILE, outputs).await
    }

    pub async fn load_outputs(&self) -> Result<Option<StackOutputs>> {
        self.read_json(OUTPUTS_FILE).await
    }

    pub async fn clear_outputs(&self) -> Result<()> {
        match tokio::fs::remove_file(self.dir.join(OUTPUTS_FILE)).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    pub async fn save_cloud(&self, snapshot: &SimSnapshot) -> Result<()> {
        self.write_json(CLOUD_FILE, snapshot).await
    }

    pub async fn load_cloud(&self) -> Result<Option<SimSnapshot>> {
        self.read_json(CLOUD_FILE).await
    }

    /// Append to the audit trail, one JSON object per line.
    pub async fn record(&self, event: ProvisioningEvent) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let mut line = serde_json::to_vec(&RecordedEvent::now(event))?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(EVENTS_FILE))
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    pub async fn events(&self) -> Result<Vec<RecordedEvent>> {
        let path = self.dir.join(EVENTS_FILE);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        raw.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).with_context(|| format!("parsing {}", path.display())))
            .collect()
    }
}
