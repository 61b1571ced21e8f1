//! Job lifecycle: admission of upstream work, backlog eviction, top job
//!
//! Every distinct piece of work from the node becomes an immutable `Job`.
//! The retained set is a height window below the highest job seen; shares
//! are checked against it. Each new admission is announced once on a
//! broadcast channel, which the server fans out to sessions.

use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::core::params::{epoch_of, JOB_ID_LEN};
use crate::core::types::*;

/// Admission notifications buffered per subscriber
const JOB_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Job {
    /// Last 16 hex digits of the header hash
    pub id: String,
    pub header_hash: Hash256,
    pub seed_hash: Hash256,
    pub target: Hash256,
    pub height: u64,
    pub epoch: u64,
    /// Admission order, strictly increasing
    pub seq: u64,
}

/// Deterministic job id for a header hash.
pub fn job_id(header_hash: &Hash256) -> String {
    let full = hex::encode(header_hash);
    full[full.len() - JOB_ID_LEN..].to_string()
}

struct JobSet {
    jobs: Vec<Arc<Job>>,
    top: Option<Arc<Job>>,
    next_seq: u64,
}

pub struct JobManager {
    inner: RwLock<JobSet>,
    backlog: u64,
    epoch_length: u64,
    notify: broadcast::Sender<Arc<Job>>,
}

impl JobManager {
    pub fn new(backlog: u64, epoch_length: u64) -> Self {
        let (notify, _) = broadcast::channel(JOB_CHANNEL_CAPACITY);
        Self {
            inner: RwLock::new(JobSet {
                jobs: Vec::new(),
                top: None,
                next_seq: 0,
            }),
            backlog,
            epoch_length,
            notify,
        }
    }

    /// Admit a unit of work. Returns the new job, or `None` when the work is
    /// already retained or falls below the backlog window.
    pub fn admit(&self, work: &Work) -> Option<Arc<Job>> {
        let id = job_id(&work.header_hash);

        let job = {
            let mut set = self.inner.write();
            if set.jobs.iter().any(|j| j.id == id) {
                return None;
            }

            let top_height = set.top.as_ref().map(|t| t.height).unwrap_or(0);
            let floor = work.height.max(top_height).saturating_sub(self.backlog);
            if work.height < floor {
                tracing::debug!("Ignoring work at height {} below backlog floor {}", work.height, floor);
                return None;
            }

            let job = Arc::new(Job {
                id,
                header_hash: work.header_hash,
                seed_hash: work.seed_hash,
                target: work.target,
                height: work.height,
                epoch: epoch_of(work.height, self.epoch_length),
                seq: set.next_seq,
            });
            set.next_seq += 1;

            set.jobs.retain(|j| j.height >= floor);
            set.jobs.push(job.clone());
            if job.height >= top_height || set.top.is_none() {
                set.top = Some(job.clone());
            }
            job
        };

        tracing::info!("⛏️  New block to mine at height {}. Job #{}", job.height, job.id);
        // No subscribers is fine; the next session picks up the top job on login
        let _ = self.notify.send(job.clone());
        Some(job)
    }

    pub fn top_job(&self) -> Option<Arc<Job>> {
        self.inner.read().top.clone()
    }

    pub fn find(&self, id: &str) -> Option<Arc<Job>> {
        self.inner.read().jobs.iter().find(|j| j.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Job>> {
        self.notify.subscribe()
    }

    /// Current top job, waiting up to `timeout` for the first admission.
    pub async fn wait_for_top_job(&self, timeout: Duration) -> Option<Arc<Job>> {
        if let Some(job) = self.top_job() {
            return Some(job);
        }
        let mut rx = self.subscribe();
        // Admission may have raced the subscribe
        if let Some(job) = self.top_job() {
            return Some(job);
        }
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => self.top_job(),
            _ => None,
        }
    }
}
