//! Built-in worker that indexes finished generations.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use super::Worker;
use crate::domain::{EventRecord, GenerationRecord, RequestStatus};

/// One line of `index.jsonl`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexEntry {
    pub event_id: Uuid,
    pub request_id: Uuid,
    pub build_id: String,
    pub generations: Vec<GenerationRecord>,
}

/// Appends finished requests to an index file, once per event
pub struct IndexWorker {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl IndexWorker {
    pub const INTEREST_KEY: &'static str = "index";

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Index at `<home>/index.jsonl`
    pub fn in_home(home: &Path) -> Self {
        Self::new(home.join("index.jsonl"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every indexed entry in order
    pub async fn entries(&self) -> Result<Vec<IndexEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.path)
            .await
            .with_context(|| format!("Failed to open index: {}", self.path.display()))?;

        let mut lines = BufReader::new(file).lines();
        let mut entries = Vec::new();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let entry: IndexEntry = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse index entry: {}", line))?;
            entries.push(entry);
        }

        Ok(entries)
    }

    async fn append(&self, entry: &IndexEntry) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open index: {}", self.path.display()))?;

        let json = serde_json::to_string(entry).context("Failed to serialize index entry")?;
        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to write index entry")?;
        file.flush().await.context("Failed to flush index")?;

        Ok(())
    }
}

#[async_trait]
impl Worker for IndexWorker {
    fn interest_key(&self) -> &str {
        Self::INTEREST_KEY
    }

    async fn handle(&self, event: &EventRecord) -> Result<()> {
        if event.status != RequestStatus::Finished {
            return Ok(());
        }

        let _guard = self.write_lock.lock().await;
        if self.entries().await?.iter().any(|e| e.event_id == event.id) {
            debug!(event_id = %event.id, "Event already indexed");
            return Ok(());
        }

        self.append(&IndexEntry {
            event_id: event.id,
            request_id: event.request_id(),
            build_id: event.request.build_id.clone(),
            generations: event.generations.clone(),
        })
        .await?;

        info!(
            event_id = %event.id,
            build_id = %event.request.build_id,
            "Indexed finished generation"
        );
        Ok(())
    }
}
