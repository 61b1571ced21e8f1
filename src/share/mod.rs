//! Share validation
//!
//! A submitted share is checked against the retained jobs and the epoch
//! dataset, evaluated with the PoW engine, credited to the session, and then
//! always forwarded to the node, which decides whether it is a block.

use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::params::{JOB_ID_LEN, NONCE_HEX_LEN};
use crate::core::types::*;
use crate::epoch::EpochCache;
use crate::error::StratumError;
use crate::events::{EventSink, PoolEvent};
use crate::jobs::{Job, JobManager};
use crate::pow::PowOutput;
use crate::session::{Dialect, SessionTable};
use crate::upstream::UpstreamClient;

/// Parameters every share submission carries
const SHARE_PARAM_COUNT: usize = 3;

/// A share submission after parsing, before any state is consulted.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ShareRequest {
    /// `eth_submitWork(nonce, header, mix)`
    Pull { nonce: u64, header_hash: Hash256 },
    /// `mining.submit(worker, extranonce ‖ job id, nonce suffix)`
    Push { job_id: String, suffix: String },
}

/// Identity and difficulty of the submitting session, copied out of the
/// table so no lock is held while hashing or talking to the node.
struct Submitter {
    extranonce: String,
    difficulty: f64,
    address: String,
    worker: String,
    solo: bool,
}

pub struct ShareValidator {
    jobs: Arc<JobManager>,
    epochs: Arc<EpochCache>,
    sessions: Arc<SessionTable>,
    upstream: Arc<dyn UpstreamClient>,
    events: Arc<dyn EventSink>,
    nonce_size: usize,
    validator_wait: Duration,
}

impl ShareValidator {
    pub fn new(
        jobs: Arc<JobManager>,
        epochs: Arc<EpochCache>,
        sessions: Arc<SessionTable>,
        upstream: Arc<dyn UpstreamClient>,
        events: Arc<dyn EventSink>,
        nonce_size: usize,
        validator_wait: Duration,
    ) -> Self {
        Self {
            jobs,
            epochs,
            sessions,
            upstream,
            events,
            nonce_size,
            validator_wait,
        }
    }

    /// Validate and credit one share from connection `conn_id`.
    ///
    /// `Ok(true)` is the reply for every accepted share, whether or not the
    /// node then takes it as a block.
    pub async fn process_share(
        &self,
        params: &[Value],
        dialect: Dialect,
        conn_id: u64,
    ) -> Result<bool, StratumError> {
        let request = self.parse(params, dialect)?;

        let submitter = self
            .sessions
            .with_mut(conn_id, |s| Submitter {
                extranonce: s.extranonce.clone(),
                difficulty: s.difficulty,
                address: s.address.clone(),
                worker: s.worker.clone(),
                solo: s.solo,
            })
            .ok_or(StratumError::NotSubscribed)?;

        let top = self.jobs.top_job().ok_or(StratumError::ValidatorNotReady)?;
        let dataset = self
            .epochs
            .ensure_within(top.epoch, self.validator_wait)
            .await
            .map_err(|e| {
                tracing::debug!("Validator not ready: {}", e);
                StratumError::ValidatorNotReady
            })?;

        let (job, nonce) = match &request {
            ShareRequest::Pull { nonce, header_hash } => {
                if *header_hash != top.header_hash {
                    return Err(StratumError::StaleShare);
                }
                (top.clone(), *nonce)
            }
            ShareRequest::Push { job_id, suffix } => {
                let job = self.jobs.find(job_id).ok_or(StratumError::StaleShare)?;
                let nonce = parse_nonce(&format!("{}{}", submitter.extranonce, suffix))
                    .ok_or(StratumError::MalformedShare)?;
                (job, nonce)
            }
        };

        let dataset = if job.epoch == top.epoch {
            dataset
        } else {
            self.epochs
                .ensure_within(job.epoch, self.validator_wait)
                .await
                .map_err(|_| StratumError::ValidatorNotReady)?
        };

        let PowOutput { result, mix_hash } = self
            .epochs
            .engine()
            .compute(&dataset, &job.header_hash, nonce)
            .map_err(|e| {
                tracing::warn!("PoW evaluation failed: {}", e);
                StratumError::ValidatorNotReady
            })?;

        // Credit the share; the session may already be gone, events still go out
        let now = Instant::now();
        self.sessions.with_mut(conn_id, |s| s.record_share(now));

        let difficulty = if dialect.is_push() {
            target_to_difficulty(&result)
        } else {
            submitter.difficulty
        };
        tracing::debug!(
            "Valid share from {}.{} job={} nonce={} diff={:.2}",
            submitter.address,
            submitter.worker,
            job.id,
            nonce_to_hex(nonce),
            difficulty
        );
        self.events.emit(PoolEvent::ShareAccepted {
            address: submitter.address.clone(),
            worker: submitter.worker.clone(),
            difficulty,
            solo: submitter.solo,
        });

        self.submit_upstream(&job, nonce, &mix_hash, &submitter).await;
        Ok(true)
    }

    async fn submit_upstream(&self, job: &Job, nonce: u64, mix_hash: &Hash256, submitter: &Submitter) {
        match self.upstream.submit_work(nonce, &job.header_hash, mix_hash).await {
            Ok(true) => {
                tracing::info!(
                    "🎉 Candidate block #{} was mined by {}.{}",
                    job.height,
                    submitter.address,
                    submitter.worker
                );
                self.events.emit(PoolEvent::CandidateFound {
                    address: submitter.address.clone(),
                    height: job.height,
                    nonce: nonce_to_hex(nonce),
                    solo: submitter.solo,
                });
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!("Failed to submit work for #{}: {}", job.height, e);
                self.events.emit(PoolEvent::SubmissionFailed {
                    address: submitter.address.clone(),
                    height: job.height,
                    reason: e.to_string(),
                });
            }
        }
    }

    fn parse(&self, params: &[Value], dialect: Dialect) -> Result<ShareRequest, StratumError> {
        if params.len() != SHARE_PARAM_COUNT {
            return Err(StratumError::MalformedShare);
        }
        let text = |i: usize| params[i].as_str().ok_or(StratumError::MalformedShare);

        match dialect {
            Dialect::Pull | Dialect::PushProxy => {
                let nonce = parse_nonce(text(0)?).ok_or(StratumError::MalformedShare)?;
                let header_hash = parse_hash(text(1)?).ok_or(StratumError::MalformedShare)?;
                parse_hash(text(2)?).ok_or(StratumError::MalformedShare)?;
                Ok(ShareRequest::Pull { nonce, header_hash })
            }
            Dialect::Push => {
                let job_ref = strip_hex(text(1)?);
                if job_ref.len() != self.nonce_size + JOB_ID_LEN || !job_ref.is_ascii() {
                    return Err(StratumError::MalformedShare);
                }
                let suffix = strip_hex(text(2)?);
                if suffix.len() != NONCE_HEX_LEN - self.nonce_size
                    || !suffix.chars().all(|c| c.is_ascii_hexdigit())
                {
                    return Err(StratumError::MalformedShare);
                }
                Ok(ShareRequest::Push {
                    job_id: job_ref[self.nonce_size..].to_lowercase(),
                    suffix: suffix.to_string(),
                })
            }
        }
    }
}
