//! File-based request store.
//!
//! Layout under the store root:
//!
//! ```text
//! store.lock                      exclusive lock for read-modify-write
//! jobs/<hex(job_id)>.json         job id -> PipelineJobRef index
//! requests/<id>/request.json      current request snapshot
//! requests/<id>/jobs.jsonl        PipelineJobRef per phase attempt
//! requests/<id>/generations.jsonl GenerationRecord upserts (last wins)
//! requests/<id>/events.jsonl      EventRecord log in causal order
//! requests/<id>/delivered.jsonl   ids of events acknowledged by the channel
//! ```
//!
//! Logs are newline-delimited JSON for easy inspection. Every mutation
//! runs on the blocking pool while holding an `fs2` exclusive lock, so
//! several processes may share one store.
//!
//! The `request.json` rename is the commit point. Generation and event
//! entries carry the revision they were written for; readers ignore entries
//! above the snapshot's revision, and the next commit discards them. A
//! partially written last line is skipped on read and cut off before the
//! next append.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::domain::{EventRecord, GenerationRecord, GenerationRequest, Phase, PipelineJobRef};

use super::store::{upsert_generation, Commit, RequestStore, StoreError};

/// Line of `generations.jsonl`
#[derive(Debug, Serialize, Deserialize)]
struct GenerationEntry {
    revision: u64,
    record: GenerationRecord,
}

/// JSONL-backed request store
#[derive(Debug, Clone)]
pub struct FileStore {
    layout: Arc<Layout>,
}

#[derive(Debug)]
struct Layout {
    root: PathBuf,
}

impl Layout {
    fn requests_dir(&self) -> PathBuf {
        self.root.join("requests")
    }

    fn jobs_index_dir(&self) -> PathBuf {
        self.root.join("jobs")
    }

    fn job_index_path(&self, job_id: &str) -> PathBuf {
        self.jobs_index_dir().join(format!("{}.json", hex::encode(job_id)))
    }

    fn request_dir(&self, id: Uuid) -> PathBuf {
        self.requests_dir().join(id.to_string())
    }

    fn request_path(&self, id: Uuid) -> PathBuf {
        self.request_dir(id).join("request.json")
    }

    fn log_path(&self, id: Uuid, log: &str) -> PathBuf {
        self.request_dir(id).join(format!("{}.jsonl", log))
    }

    /// Take the store-wide exclusive lock (released when the file drops)
    fn lock(&self) -> Result<File, StoreError> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(self.root.join("store.lock"))?;
        file.lock_exclusive()?;
        Ok(file)
    }

    fn read_request(&self, id: Uuid) -> Result<Option<GenerationRequest>, StoreError> {
        read_json(&self.request_path(id))
    }

    fn write_request(&self, request: &GenerationRequest) -> Result<(), StoreError> {
        let path = self.request_path(request.id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(request)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn request_ids(&self) -> Result<Vec<Uuid>, StoreError> {
        let dir = self.requests_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(id) = entry.file_name().to_str().and_then(|n| Uuid::parse_str(n).ok()) {
                    ids.push(id);
                }
            }
        }
        Ok(ids)
    }

    fn all_requests(&self) -> Result<Vec<GenerationRequest>, StoreError> {
        let mut requests = Vec::new();
        for id in self.request_ids()? {
            if let Some(request) = self.read_request(id)? {
                requests.push(request);
            }
        }
        requests.sort_by_key(|r| r.created_at);
        Ok(requests)
    }

    /// Revision of the committed snapshot; `None` before the request exists
    fn committed_revision(&self, id: Uuid) -> Result<Option<u64>, StoreError> {
        Ok(self.read_request(id)?.map(|r| r.revision))
    }

    fn generations(&self, id: Uuid) -> Result<Vec<GenerationRecord>, StoreError> {
        let Some(revision) = self.committed_revision(id)? else {
            return Ok(Vec::new());
        };

        let mut records = Vec::new();
        for entry in read_jsonl::<GenerationEntry>(&self.log_path(id, "generations"))? {
            if entry.revision <= revision {
                upsert_generation(&mut records, entry.record);
            }
        }
        Ok(records)
    }

    fn events(&self, id: Uuid) -> Result<Vec<EventRecord>, StoreError> {
        let Some(revision) = self.committed_revision(id)? else {
            return Ok(Vec::new());
        };

        Ok(read_jsonl::<EventRecord>(&self.log_path(id, "events"))?
            .into_iter()
            .filter(|e| e.request.revision <= revision)
            .collect())
    }

    /// Drop log entries left behind by a commit that never reached its snapshot
    fn discard_uncommitted(&self, id: Uuid, revision: u64) -> Result<(), StoreError> {
        let events_path = self.log_path(id, "events");
        let events = read_jsonl::<EventRecord>(&events_path)?;
        if events.iter().any(|e| e.request.revision > revision) {
            warn!(request_id = %id, revision, "Discarding uncommitted events");
            let kept: Vec<_> = events
                .into_iter()
                .filter(|e| e.request.revision <= revision)
                .collect();
            rewrite_jsonl(&events_path, &kept)?;
        }

        let generations_path = self.log_path(id, "generations");
        let entries = read_jsonl::<GenerationEntry>(&generations_path)?;
        if entries.iter().any(|e| e.revision > revision) {
            warn!(request_id = %id, revision, "Discarding uncommitted generation records");
            let kept: Vec<_> = entries.into_iter().filter(|e| e.revision <= revision).collect();
            rewrite_jsonl(&generations_path, &kept)?;
        }
        Ok(())
    }

    fn delivered(&self, id: Uuid) -> Result<HashSet<Uuid>, StoreError> {
        Ok(read_jsonl::<Uuid>(&self.log_path(id, "delivered"))?
            .into_iter()
            .collect())
    }
}

impl FileStore {
    /// Create or open a store rooted at `root`
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let layout = Layout { root: root.into() };
        tokio::fs::create_dir_all(layout.requests_dir()).await?;
        tokio::fs::create_dir_all(layout.jobs_index_dir()).await?;

        Ok(Self {
            layout: Arc::new(layout),
        })
    }

    /// Open the store in the configured location ($SBOMER_HOME/store)
    pub async fn open_default() -> anyhow::Result<Self> {
        let root = crate::config::store_dir()?;
        Ok(Self::open(root).await?)
    }

    pub fn root(&self) -> &Path {
        &self.layout.root
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Layout) -> Result<T, StoreError> + Send + 'static,
    {
        let layout = Arc::clone(&self.layout);
        tokio::task::spawn_blocking(move || op(&layout))
            .await
            .map_err(|e| StoreError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
    }
}

#[async_trait]
impl RequestStore for FileStore {
    async fn insert(&self, request: &GenerationRequest, event: &EventRecord) -> Result<(), StoreError> {
        let request = request.clone();
        let event = event.clone();
        self.blocking(move |layout| {
            let _lock = layout.lock()?;
            if layout.request_path(request.id).exists() {
                return Err(StoreError::AlreadyExists(request.id));
            }
            fs::create_dir_all(layout.request_dir(request.id))?;
            append_jsonl(&layout.log_path(request.id, "events"), &event)?;
            layout.write_request(&request)
        })
        .await
    }

    async fn get(&self, id: Uuid) -> Result<Option<GenerationRequest>, StoreError> {
        self.blocking(move |layout| layout.read_request(id)).await
    }

    async fn find_by_build_id(&self, build_id: &str) -> Result<Option<GenerationRequest>, StoreError> {
        let build_id = build_id.to_string();
        self.blocking(move |layout| {
            Ok(layout
                .all_requests()?
                .into_iter()
                .find(|r| r.build_id == build_id))
        })
        .await
    }

    async fn list(&self) -> Result<Vec<GenerationRequest>, StoreError> {
        self.blocking(|layout| layout.all_requests()).await
    }

    async fn job_ref(
        &self,
        request_id: Uuid,
        phase: Phase,
        attempt: u32,
    ) -> Result<Option<PipelineJobRef>, StoreError> {
        self.blocking(move |layout| {
            Ok(read_jsonl::<PipelineJobRef>(&layout.log_path(request_id, "jobs"))?
                .into_iter()
                .rev()
                .find(|j| j.phase == phase && j.attempt == attempt))
        })
        .await
    }

    async fn put_job_ref(&self, job: &PipelineJobRef) -> Result<(), StoreError> {
        let job = job.clone();
        self.blocking(move |layout| {
            let _lock = layout.lock()?;
            fs::create_dir_all(layout.request_dir(job.request_id))?;
            append_jsonl(&layout.log_path(job.request_id, "jobs"), &job)?;
            fs::write(layout.job_index_path(&job.job_id), serde_json::to_vec(&job)?)?;
            Ok(())
        })
        .await
    }

    async fn find_job_ref(&self, job_id: &str) -> Result<Option<PipelineJobRef>, StoreError> {
        let job_id = job_id.to_string();
        self.blocking(move |layout| read_json(&layout.job_index_path(&job_id)))
            .await
    }

    async fn commit(&self, commit: Commit) -> Result<(), StoreError> {
        self.blocking(move |layout| {
            let _lock = layout.lock()?;
            let id = commit.request.id;

            let stored = layout.read_request(id)?.ok_or(StoreError::NotFound(id))?;
            if stored.revision != commit.previous_revision {
                return Err(StoreError::Conflict {
                    id,
                    expected: commit.previous_revision,
                    actual: stored.revision,
                });
            }

            layout.discard_uncommitted(id, stored.revision)?;

            let revision = commit.request.revision;
            if let Some(record) = commit.generation {
                let entry = GenerationEntry { revision, record };
                append_jsonl(&layout.log_path(id, "generations"), &entry)?;
            }
            append_jsonl(&layout.log_path(id, "events"), &commit.event)?;
            layout.write_request(&commit.request)
        })
        .await
    }

    async fn generations(&self, request_id: Uuid) -> Result<Vec<GenerationRecord>, StoreError> {
        self.blocking(move |layout| layout.generations(request_id)).await
    }

    async fn events(&self, request_id: Uuid) -> Result<Vec<EventRecord>, StoreError> {
        self.blocking(move |layout| layout.events(request_id)).await
    }

    async fn undelivered_events(&self) -> Result<Vec<EventRecord>, StoreError> {
        self.blocking(|layout| {
            let mut pending = Vec::new();
            for id in layout.request_ids()? {
                let delivered = layout.delivered(id)?;
                pending.extend(
                    layout
                        .events(id)?
                        .into_iter()
                        .filter(|e| !delivered.contains(&e.id)),
                );
            }
            pending.sort_by_key(|e| e.created);
            Ok(pending)
        })
        .await
    }

    async fn mark_delivered(&self, event_id: Uuid) -> Result<(), StoreError> {
        self.blocking(move |layout| {
            let _lock = layout.lock()?;
            for id in layout.request_ids()? {
                let owns_event = layout.events(id)?.iter().any(|e| e.id == event_id);
                if owns_event {
                    if !layout.delivered(id)?.contains(&event_id) {
                        append_jsonl(&layout.log_path(id, "delivered"), &event_id)?;
                    }
                    break;
                }
            }
            Ok(())
        })
        .await
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read(path)?;
    Ok(Some(serde_json::from_slice(&content)?))
}

/// Read a log; an unparseable last line is an interrupted append and skipped
fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, StoreError> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let reader = BufReader::new(File::open(path)?);
    let mut lines = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if !line.trim().is_empty() {
            lines.push(line);
        }
    }

    let last = lines.len().saturating_sub(1);
    let mut items = Vec::with_capacity(lines.len());
    for (index, line) in lines.iter().enumerate() {
        match serde_json::from_str(line) {
            Ok(item) => items.push(item),
            Err(e) if index == last => {
                warn!(path = %path.display(), error = %e, "Skipping partially written line");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(items)
}

fn append_jsonl<T: Serialize>(path: &Path, item: &T) -> Result<(), StoreError> {
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)?;
    truncate_partial_line(&mut file)?;

    let json = serde_json::to_string(item)?;
    file.write_all(format!("{}\n", json).as_bytes())?;
    file.flush()?;
    Ok(())
}

/// Cut an unterminated last line so the next append starts on a fresh line
fn truncate_partial_line(file: &mut File) -> Result<(), StoreError> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(());
    }

    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    if last[0] == b'\n' {
        return Ok(());
    }

    let mut content = Vec::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut content)?;
    let keep = content
        .iter()
        .rposition(|b| *b == b'\n')
        .map(|i| i + 1)
        .unwrap_or(0);
    warn!(dropped = content.len() - keep, "Truncating partially written line");
    file.set_len(keep as u64)?;
    Ok(())
}

/// Replace a log atomically with `items`
fn rewrite_jsonl<T: Serialize>(path: &Path, items: &[T]) -> Result<(), StoreError> {
    let tmp = path.with_extension("jsonl.tmp");
    let mut content = String::new();
    for item in items {
        content.push_str(&serde_json::to_string(item)?);
        content.push('\n');
    }
    fs::write(&tmp, content)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
