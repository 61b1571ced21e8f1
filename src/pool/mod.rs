//! ForgePool orchestration
//!
//! Architecture:
//!   Miners ←stratum→ StratumListener(s) ←Arc<Pool>→ JobManager / EpochCache
//!                                                    ↑
//!                           refresh sweep ← UpstreamClient (node JSON-RPC)
//!
//! `Pool` owns every shared component. Three independent timers drive it:
//! the upstream refresh (new work → epoch datasets → job admission), the
//! VarDiff retarget, and the idle sweep. Job admissions are fanned out to
//! sessions by the broadcaster in `stratum`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use crate::config::PoolConfig;
use crate::core::params::epoch_of;
use crate::epoch::store::EpochStore;
use crate::epoch::EpochCache;
use crate::error::{PoolError, UpstreamError};
use crate::events::{EventSink, PoolEvent};
use crate::jobs::{Job, JobManager};
use crate::pow::{ForgeHash, PowEngine};
use crate::session::{Dialect, Session, SessionTable};
use crate::share::ShareValidator;
use crate::stratum::protocol::{job_result_line, notify_params, pull_job, push_line};
use crate::stratum::{self, StratumListener};
use crate::upstream::UpstreamClient;
use crate::vardiff::VarDiffController;

// ─── Pool State ─────────────────────────────────────────────────────

pub struct Pool {
    pub config: PoolConfig,
    pub jobs: Arc<JobManager>,
    pub epochs: Arc<EpochCache>,
    pub sessions: Arc<SessionTable>,
    pub validator: ShareValidator,
    pub vardiff: VarDiffController,
    pub upstream: Arc<dyn UpstreamClient>,
    pub events: Arc<dyn EventSink>,
    next_conn: AtomicU64,
}

impl Pool {
    pub fn new(
        config: PoolConfig,
        engine: Arc<dyn PowEngine>,
        store: Option<Arc<EpochStore>>,
        upstream: Arc<dyn UpstreamClient>,
        events: Arc<dyn EventSink>,
    ) -> Arc<Self> {
        let jobs = Arc::new(JobManager::new(config.max_backlog, config.epoch_length));
        let epochs = EpochCache::with_store(engine, store, config.epoch_generation_timeout());
        let sessions = Arc::new(SessionTable::new());
        let validator = ShareValidator::new(
            jobs.clone(),
            epochs.clone(),
            sessions.clone(),
            upstream.clone(),
            events.clone(),
            config.nonce_size,
            config.validator_wait(),
        );
        let vardiff = VarDiffController::new(config.var_diff.clone());

        Arc::new(Self {
            config,
            jobs,
            epochs,
            sessions,
            validator,
            vardiff,
            upstream,
            events,
            next_conn: AtomicU64::new(1),
        })
    }

    /// Pool with the default ForgeHash engine, plus the on-disk dataset
    /// store when `cache_dir` is set.
    pub fn from_config(
        config: PoolConfig,
        upstream: Arc<dyn UpstreamClient>,
        events: Arc<dyn EventSink>,
    ) -> Result<Arc<Self>, PoolError> {
        let store = match &config.cache_dir {
            Some(dir) => {
                tracing::info!("💾 Epoch dataset store at {}", dir.display());
                Some(Arc::new(EpochStore::open(dir)?))
            }
            None => None,
        };
        let engine = Arc::new(ForgeHash::new(config.dataset_size));
        Ok(Self::new(config, engine, store, upstream, events))
    }

    pub fn next_conn_id(&self) -> u64 {
        self.next_conn.fetch_add(1, Ordering::Relaxed)
    }

    /// Job message for one session in its dialect.
    pub fn job_line(&self, session: &Session, job: &Job) -> String {
        match session.dialect {
            Dialect::Push => push_line("mining.notify", notify_params(&session.extranonce, job)),
            Dialect::Pull | Dialect::PushProxy => job_result_line(pull_job(
                job,
                session.difficulty,
                self.config.var_diff.unit_multiplier,
            )),
        }
    }

    /// Queue `job` for every live session. Sessions with a full outbox are
    /// skipped this round. Returns `(sent, skipped)`.
    pub fn broadcast_job(&self, job: &Job) -> (usize, usize) {
        let mut sent = 0;
        let mut skipped = 0;
        self.sessions.for_each(|s| {
            if s.outbox.try_send(self.job_line(s, job)) {
                sent += 1;
            } else {
                skipped += 1;
            }
        });
        (sent, skipped)
    }

    /// Deregister whatever the connection left behind.
    pub(crate) fn close_connection(&self, conn_id: u64, extranonce: &str) {
        if let Some(session) = self.sessions.remove(conn_id) {
            tracing::info!(
                "🔌 Miner disconnected {}.{}@{}",
                session.address,
                session.worker,
                session.ip
            );
            self.events.emit(PoolEvent::SessionDisconnect { id: session.unique_id });
        }
        self.sessions.release_extranonce(extranonce);
    }

    // ─── Sweeps ─────────────────────────────────────────────────────

    /// Fetch work from the node, make sure its epoch (and the next one) is
    /// being prepared, drop stale epochs, then admit the work.
    pub async fn refresh(&self) -> Result<Option<Arc<Job>>, UpstreamError> {
        let work = self.upstream.latest_work().await?;
        let epoch = epoch_of(work.height, self.config.epoch_length);

        self.epochs.start(epoch);
        self.epochs.ensure_next_epoch(epoch + 1);
        self.epochs.evict_older_than(epoch);

        Ok(self.jobs.admit(&work))
    }

    /// Retarget every session that has VarDiff enabled and notify the ones
    /// whose difficulty changed. Returns how many changed.
    pub fn retarget_all(&self, now: Instant) -> usize {
        let top = self.jobs.top_job();
        let unit = self.config.var_diff.unit_multiplier;
        let mut changed = 0;

        self.sessions.for_each_mut(|s| {
            if !s.var_diff {
                return;
            }
            let Some(change) = self.vardiff.retarget(s, now) else {
                return;
            };
            changed += 1;
            tracing::info!(
                "⚖️  Retargeted {}.{}@{} from {} to {}",
                s.address,
                s.worker,
                s.ip,
                change.old,
                change.new
            );
            let update = match s.dialect {
                Dialect::Push => Some(push_line("mining.set_difficulty", serde_json::json!([change.new]))),
                Dialect::PushProxy => top
                    .as_ref()
                    .map(|job| job_result_line(pull_job(job, change.new, unit))),
                // Picked up on the next eth_getWork
                Dialect::Pull => None,
            };
            if let Some(line) = update {
                if !s.outbox.try_send(line) {
                    tracing::debug!("Difficulty update for {} dropped, outbox full", s.ip);
                }
            }
        });
        changed
    }

    /// Disconnect sessions silent for longer than the miner timeout.
    pub fn sweep_idle(&self, now: Instant) -> usize {
        let timeout = self.config.miner_timeout();
        let mut idle = Vec::new();
        self.sessions.for_each(|s| {
            if s.idle_for(now) > timeout {
                idle.push(s.conn_id);
            }
        });

        for conn_id in &idle {
            if let Some(session) = self.sessions.remove(*conn_id) {
                tracing::warn!(
                    "Miner timed out and disconnected {}.{}@{}",
                    session.address,
                    session.worker,
                    session.ip
                );
                session.outbox.close();
                self.events.emit(PoolEvent::SessionDisconnect { id: session.unique_id });
            }
        }
        idle.len()
    }

    /// First refresh at startup: wait (bounded) for the current epoch so the
    /// first shares can be validated.
    async fn warm_up(&self) {
        match self.refresh().await {
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Initial work fetch from {} failed: {}", self.config.upstream, e);
                return;
            }
        }
        if let Some(job) = self.jobs.top_job() {
            match self.epochs.ensure(job.epoch).await {
                Ok(ds) => tracing::info!("🧮 Validator ready for epoch #{}", ds.epoch),
                Err(e) => tracing::warn!("Validator not ready at startup: {}", e),
            }
        }
    }
}

// ─── Pool Server Entry Point ────────────────────────────────────────

/// Bind every configured port, start the broadcaster and sweeps, and serve
/// until `shutdown` flips.
pub async fn run(pool: Arc<Pool>, shutdown: watch::Receiver<bool>) -> Result<(), PoolError> {
    let mut listeners = Vec::with_capacity(pool.config.ports.len());
    for port in &pool.config.ports {
        let addr = format!("0.0.0.0:{}", port.port);
        listeners.push(StratumListener::bind(&addr, port.clone()).await?);
    }

    tokio::spawn(stratum::broadcast_jobs(pool.clone(), shutdown.clone()));
    pool.warm_up().await;
    spawn_sweeps(&pool, &shutdown);

    let mut servers = Vec::with_capacity(listeners.len());
    for listener in listeners {
        servers.push(tokio::spawn(listener.serve(pool.clone(), shutdown.clone())));
    }
    for server in servers {
        let _ = server.await;
    }
    tracing::info!("⛏️  Pool stopped");
    Ok(())
}

fn delayed_interval(period: Duration) -> tokio::time::Interval {
    tokio::time::interval_at(tokio::time::Instant::now() + period, period)
}

fn spawn_sweeps(pool: &Arc<Pool>, shutdown: &watch::Receiver<bool>) {
    // Upstream refresh
    {
        let p = pool.clone();
        let mut stop = shutdown.clone();
        tokio::spawn(async move {
            let mut interval = delayed_interval(p.config.refresh_interval());
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = p.refresh().await {
                            tracing::warn!("Failed to get work: {}", e);
                        }
                    }
                    _ = stop.changed() => break,
                }
            }
        });
    }

    // VarDiff retarget
    {
        let p = pool.clone();
        let mut stop = shutdown.clone();
        tokio::spawn(async move {
            let mut interval = delayed_interval(p.config.retarget_interval());
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let changed = p.retarget_all(Instant::now());
                        if changed > 0 {
                            tracing::debug!("Retarget sweep changed {} session(s)", changed);
                        }
                    }
                    _ = stop.changed() => break,
                }
            }
        });
    }

    // Idle miners
    {
        let p = pool.clone();
        let mut stop = shutdown.clone();
        tokio::spawn(async move {
            let mut interval = delayed_interval(p.config.idle_sweep_interval());
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        p.sweep_idle(Instant::now());
                    }
                    _ = stop.changed() => break,
                }
            }
        });
    }

    // Stats
    {
        let p = pool.clone();
        let mut stop = shutdown.clone();
        tokio::spawn(async move {
            let mut interval = delayed_interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let top = p.jobs.top_job();
                        tracing::info!(
                            "⛏️  Pool: {} miners, {} jobs, top height {}, epochs {:?}",
                            p.sessions.len(),
                            p.jobs.len(),
                            top.map(|j| j.height).unwrap_or(0),
                            p.epochs.epochs()
                        );
                    }
                    _ = stop.changed() => break,
                }
            }
        });
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::core::types::Work;
    use crate::events::ChannelSink;
    use crate::pow::testing::CountingEngine;
    use crate::upstream::testing::MockUpstream;
    use tokio::sync::mpsc;

    pub fn test_config() -> PoolConfig {
        PoolConfig {
            epoch_length: 100,
            ..Default::default()
        }
    }

    pub fn test_pool_with(upstream: Arc<MockUpstream>) -> (Arc<Pool>, mpsc::UnboundedReceiver<PoolEvent>) {
        test_pool_with_config(test_config(), upstream)
    }

    pub fn test_pool_with_config(
        config: PoolConfig,
        upstream: Arc<MockUpstream>,
    ) -> (Arc<Pool>, mpsc::UnboundedReceiver<PoolEvent>) {
        let (sink, events) = ChannelSink::new();
        let engine = Arc::new(CountingEngine::new(Duration::ZERO));
        let pool = Pool::new(config, engine, None, upstream, Arc::new(sink));
        (pool, events)
    }

    pub fn test_pool() -> (Arc<Pool>, mpsc::UnboundedReceiver<PoolEvent>) {
        test_pool_with(Arc::new(MockUpstream::new()))
    }

    /// Work whose header is `[tag; 32]`.
    pub fn work(tag: u8, height: u64) -> Work {
        Work {
            header_hash: [tag; 32],
            seed_hash: [0; 32],
            target: [0x0f; 32],
            height,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::session::testing::session;
    use crate::upstream::testing::MockUpstream;
    use serde_json::Value;

    #[tokio::test]
    async fn test_refresh_prepares_epochs_before_broadcast() {
        let upstream = Arc::new(MockUpstream::new());
        let (pool, _events) = test_pool_with(upstream.clone());
        let mut jobs_rx = pool.jobs.subscribe();

        upstream.set_work(work(1, 150));
        let job = pool.refresh().await.unwrap().unwrap();
        assert_eq!(job.epoch, 1);

        // By the time the job is announced both epochs are cached or generating
        let announced = jobs_rx.recv().await.unwrap();
        assert_eq!(announced.id, job.id);
        assert!(pool.epochs.contains(1));
        assert!(pool.epochs.contains(2));

        pool.epochs.ensure(1).await.unwrap();
        pool.epochs.ensure(2).await.unwrap();

        // Same work again: no new job
        assert!(pool.refresh().await.unwrap().is_none());

        // Two epochs later the oldest entry goes
        upstream.set_work(work(2, 350));
        pool.refresh().await.unwrap().unwrap();
        assert!(!pool.epochs.contains(1));
        assert!(pool.epochs.contains(2));
        assert!(pool.epochs.contains(3));
        assert!(pool.epochs.contains(4));
    }

    #[tokio::test]
    async fn test_refresh_surfaces_upstream_error() {
        let (pool, _events) = test_pool();
        assert!(pool.refresh().await.is_err());
        assert!(pool.jobs.is_empty());
    }

    #[tokio::test]
    async fn test_retarget_updates_by_dialect() {
        let (pool, _events) = test_pool();
        pool.jobs.admit(&work(7, 10));

        let mut receivers = Vec::new();
        for (conn_id, dialect) in [(1, Dialect::Push), (2, Dialect::PushProxy), (3, Dialect::Pull)] {
            let (mut s, rx) = session(conn_id, dialect, 1000.0);
            let t0 = s.last_activity;
            s.record_share(t0 + Duration::from_secs(1));
            s.record_share(t0 + Duration::from_secs(2));
            pool.sessions.insert(s);
            receivers.push(rx);
        }

        let now = Instant::now() + Duration::from_secs(3);
        assert_eq!(pool.retarget_all(now), 3);

        // max jump 100%: 1000 → 2000
        let push: Value = serde_json::from_str(&receivers[0].try_recv().unwrap()).unwrap();
        assert_eq!(push["method"], "mining.set_difficulty");
        assert_eq!(push["params"][0], 2000.0);

        let proxy: Value = serde_json::from_str(&receivers[1].try_recv().unwrap()).unwrap();
        assert_eq!(proxy["id"], 0);
        assert_eq!(
            proxy["result"][2],
            crate::core::types::hash_to_hex(&crate::core::types::difficulty_to_target(2000.0))
        );

        assert!(receivers[2].try_recv().is_err());
        assert_eq!(pool.sessions.get(3).unwrap().difficulty, 2000.0);
    }

    #[tokio::test]
    async fn test_retarget_skips_disabled_sessions() {
        let (pool, _events) = test_pool();
        let (mut s, _rx) = session(1, Dialect::Push, 1000.0);
        s.var_diff = false;
        let t0 = s.last_activity;
        s.record_share(t0 + Duration::from_secs(1));
        pool.sessions.insert(s);
        assert_eq!(pool.retarget_all(Instant::now() + Duration::from_secs(2)), 0);
    }

    #[tokio::test]
    async fn test_idle_sweep_disconnects() {
        let (pool, mut events) = test_pool();
        let (s, _rx) = session(1, Dialect::Push, 1000.0);
        let cancel = s.outbox.cancel.clone();
        let id = s.unique_id.clone();
        let t0 = s.last_activity;
        pool.sessions.insert(s);
        let (fresh, _rx2) = session(2, Dialect::Pull, 1000.0);
        pool.sessions.insert(fresh);

        let later = t0 + pool.config.miner_timeout() + Duration::from_secs(1);
        assert_eq!(pool.sweep_idle(later - Duration::from_secs(2)), 0);

        pool.sessions.with_mut(2, |s| s.last_activity = later);
        assert_eq!(pool.sweep_idle(later), 1);
        assert!(!pool.sessions.contains(1));
        assert!(pool.sessions.contains(2));
        assert!(cancel.is_cancelled());
        assert_eq!(events.try_recv().unwrap(), PoolEvent::SessionDisconnect { id });
    }

    #[tokio::test]
    async fn test_broadcast_skips_full_outbox() {
        let (pool, _events) = test_pool();
        let (s, _rx) = session(1, Dialect::Pull, 1000.0);
        let cancel = s.outbox.cancel.clone();
        pool.sessions.insert(s);

        let job = pool.jobs.admit(&work(3, 20)).unwrap();
        let mut sent = 0;
        let mut skipped = 0;
        for _ in 0..crate::core::params::OUTBOX_CAPACITY + 5 {
            let (a, b) = pool.broadcast_job(&job);
            sent += a;
            skipped += b;
        }
        assert_eq!(sent, crate::core::params::OUTBOX_CAPACITY);
        assert_eq!(skipped, 5);
        assert!(pool.sessions.contains(1));
        assert!(!cancel.is_cancelled());
    }
}
