//! Job persistence for Bayline: the `JobStore` contract plus in-memory and file-backed stores.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Context;
use async_trait::async_trait;
use bayline_core::{Job, JobError, JobUpdate};
use chrono::Utc;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "bayline-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    /// The booking id is already indexed. Callers fall back to the update path.
    #[error("a job for booking {booking_id} already exists ({job_id})")]
    Conflict { booking_id: String, job_id: Uuid },
    #[error("job {0} not found")]
    NotFound(Uuid),
    #[error(transparent)]
    Rejected(#[from] JobError),
    #[error("job store failure: {0:#}")]
    Backend(#[from] anyhow::Error),
}

/// Key-value job storage keyed by job id, with a unique secondary index on booking id.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Conditional insert: fails with [`StoreError::Conflict`] if the booking id is taken.
    async fn create_job(&self, job: Job) -> Result<Job, StoreError>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, StoreError>;

    async fn get_job_by_booking_id(&self, booking_id: &str) -> Result<Option<Job>, StoreError>;

    async fn update_job(&self, job_id: Uuid, update: JobUpdate) -> Result<Job, StoreError>;

    async fn list_jobs(&self) -> Result<Vec<Job>, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    jobs: HashMap<Uuid, Job>,
    by_booking: HashMap<String, Uuid>,
}

/// Process-local store. Also the shared fake for pipeline and handler tests.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    state: Mutex<MemoryState>,
    writes: AtomicUsize,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful creates and updates issued against this store.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_job(&self, job: Job) -> Result<Job, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.by_booking.get(&job.booking_id) {
            return Err(StoreError::Conflict {
                booking_id: job.booking_id.clone(),
                job_id: *existing,
            });
        }
        state.by_booking.insert(job.booking_id.clone(), job.job_id);
        state.jobs.insert(job.job_id, job.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(job)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.state.lock().await.jobs.get(&job_id).cloned())
    }

    async fn get_job_by_booking_id(&self, booking_id: &str) -> Result<Option<Job>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .by_booking
            .get(booking_id)
            .and_then(|job_id| state.jobs.get(job_id))
            .cloned())
    }

    async fn update_job(&self, job_id: Uuid, update: JobUpdate) -> Result<Job, StoreError> {
        let mut state = self.state.lock().await;
        let job = state.jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        let mut next = job.clone();
        update.apply_to(&mut next, Utc::now())?;
        *job = next.clone();
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(next)
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let state = self.state.lock().await;
        let mut jobs = state.jobs.values().cloned().collect::<Vec<_>>();
        jobs.sort_by_key(|job| (job.appointment_time, job.created_at));
        Ok(jobs)
    }
}

/// Durable store of one JSON document per job under `root/jobs/`.
///
/// The booking index is one file per booking under `root/bookings/` naming the job that
/// owns it. A create writes the job document first and the index last, both by temp-file
/// rename, so the index is the commit point. An index that is empty, unreadable, or points
/// at a missing document is an abandoned create and is free to be claimed again.
#[derive(Debug)]
pub struct FileJobStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FileJobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn booking_key(booking_id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(booking_id.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn job_path(&self, job_id: Uuid) -> PathBuf {
        self.root.join("jobs").join(format!("{job_id}.json"))
    }

    fn booking_index_path(&self, booking_id: &str) -> PathBuf {
        self.root
            .join("bookings")
            .join(format!("{}.ref", Self::booking_key(booking_id)))
    }

    async fn ensure_layout(&self) -> anyhow::Result<()> {
        for dir in ["jobs", "bookings"] {
            let path = self.root.join(dir);
            fs::create_dir_all(&path)
                .await
                .with_context(|| format!("creating store directory {}", path.display()))?;
        }
        Ok(())
    }

    async fn read_job(&self, job_id: Uuid) -> anyhow::Result<Option<Job>> {
        let path = self.job_path(job_id);
        match fs::read(&path).await {
            Ok(bytes) => {
                let job = serde_json::from_slice(&bytes)
                    .with_context(|| format!("parsing job document {}", path.display()))?;
                Ok(Some(job))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => {
                Err(err).with_context(|| format!("reading job document {}", path.display()))
            }
        }
    }

    async fn read_booking_index(&self, booking_id: &str) -> anyhow::Result<Option<Uuid>> {
        let path = self.booking_index_path(booking_id);
        match fs::read_to_string(&path).await {
            Ok(text) => match Uuid::parse_str(text.trim()) {
                Ok(job_id) => Ok(Some(job_id)),
                Err(err) => {
                    warn!(
                        %booking_id,
                        path = %path.display(),
                        error = %err,
                        "ignoring unreadable booking index"
                    );
                    Ok(None)
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => {
                Err(err).with_context(|| format!("reading booking index {}", path.display()))
            }
        }
    }

    /// The job a booking is committed to, skipping abandoned index entries.
    async fn committed_job(&self, booking_id: &str) -> anyhow::Result<Option<Job>> {
        let Some(job_id) = self.read_booking_index(booking_id).await? else {
            return Ok(None);
        };
        let job = self.read_job(job_id).await?;
        if job.is_none() {
            warn!(%booking_id, %job_id, "booking index points at a missing job document");
        }
        Ok(job)
    }

    async fn write_job(&self, job: &Job) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(job).context("serializing job document")?;
        write_atomic(&self.job_path(job.job_id), &bytes).await
    }
}

/// Replace `path` with `bytes` via a temp file in the same directory and a rename.
async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn create_job(&self, job: Job) -> Result<Job, StoreError> {
        let _guard = self.write_lock.lock().await;
        self.ensure_layout().await?;

        if let Some(existing) = self.committed_job(&job.booking_id).await? {
            return Err(StoreError::Conflict {
                booking_id: job.booking_id.clone(),
                job_id: existing.job_id,
            });
        }

        self.write_job(&job).await?;
        let index_path = self.booking_index_path(&job.booking_id);
        if let Err(err) = write_atomic(&index_path, job.job_id.to_string().as_bytes()).await {
            let _ = fs::remove_file(self.job_path(job.job_id)).await;
            return Err(err.context("committing booking index").into());
        }

        debug!(job_id = %job.job_id, booking_id = %job.booking_id, "job document created");
        Ok(job)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.read_job(job_id).await?)
    }

    async fn get_job_by_booking_id(&self, booking_id: &str) -> Result<Option<Job>, StoreError> {
        Ok(self.committed_job(booking_id).await?)
    }

    async fn update_job(&self, job_id: Uuid, update: JobUpdate) -> Result<Job, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut job = self
            .read_job(job_id)
            .await?
            .ok_or(StoreError::NotFound(job_id))?;
        update.apply_to(&mut job, Utc::now())?;
        self.write_job(&job).await?;
        Ok(job)
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let dir = self.root.join("jobs");
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("listing {}", dir.display()))
                    .into())
            }
        };

        let mut jobs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing {}", dir.display()))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(&path)
                .await
                .with_context(|| format!("reading job document {}", path.display()))?;
            let job: Job = serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing job document {}", path.display()))?;
            // Documents from a create that never committed its index are not jobs.
            if self.read_booking_index(&job.booking_id).await? != Some(job.job_id) {
                debug!(job_id = %job.job_id, "skipping uncommitted job document");
                continue;
            }
            jobs.push(job);
        }
        jobs.sort_by_key(|job| (job.appointment_time, job.created_at));
        Ok(jobs)
    }
}
