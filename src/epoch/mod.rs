//! Epoch-keyed verification dataset cache
//!
//! Datasets are generated on the blocking pool, one generation per epoch at a
//! time: a second request for an epoch that is already generating joins the
//! in-flight generation through its `watch` channel instead of starting
//! another. Waiters are always bounded by a timeout.

pub mod store;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use crate::error::{EpochError, PowError};
use crate::pow::{EpochDataset, PowEngine};
use store::EpochStore;

#[derive(Debug, Clone)]
enum GenState {
    Pending,
    Ready(Arc<EpochDataset>),
    Failed(String),
}

enum Slot {
    Generating(watch::Receiver<GenState>),
    Ready(Arc<EpochDataset>),
}

enum Begin {
    Ready(Arc<EpochDataset>),
    Waiting(watch::Receiver<GenState>),
}

pub struct EpochCache {
    engine: Arc<dyn PowEngine>,
    store: Option<Arc<EpochStore>>,
    slots: Mutex<HashMap<u64, Slot>>,
    timeout: Duration,
    started: AtomicU64,
}

impl EpochCache {
    pub fn new(engine: Arc<dyn PowEngine>, timeout: Duration) -> Arc<Self> {
        Self::with_store(engine, None, timeout)
    }

    pub fn with_store(
        engine: Arc<dyn PowEngine>,
        store: Option<Arc<EpochStore>>,
        timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            engine,
            store,
            slots: Mutex::new(HashMap::new()),
            timeout,
            started: AtomicU64::new(0),
        })
    }

    pub fn engine(&self) -> &Arc<dyn PowEngine> {
        &self.engine
    }

    /// Wait (bounded by the generation timeout) for the dataset of `epoch`,
    /// starting or joining its generation as needed.
    pub async fn ensure(self: &Arc<Self>, epoch: u64) -> Result<Arc<EpochDataset>, EpochError> {
        self.ensure_within(epoch, self.timeout).await
    }

    /// `ensure` with an explicit wait bound.
    pub async fn ensure_within(
        self: &Arc<Self>,
        epoch: u64,
        wait: Duration,
    ) -> Result<Arc<EpochDataset>, EpochError> {
        match self.begin(epoch) {
            Begin::Ready(ds) => Ok(ds),
            Begin::Waiting(mut rx) => {
                let outcome = tokio::time::timeout(
                    wait,
                    rx.wait_for(|s| !matches!(s, GenState::Pending)),
                )
                .await;
                match outcome {
                    Ok(Ok(state)) => match state.clone() {
                        GenState::Ready(ds) => Ok(ds),
                        GenState::Failed(reason) => Err(EpochError::Failed { epoch, reason }),
                        GenState::Pending => Err(EpochError::Timeout(epoch)),
                    },
                    Ok(Err(_)) => Err(EpochError::Failed {
                        epoch,
                        reason: "generation task dropped".into(),
                    }),
                    Err(_) => Err(EpochError::Timeout(epoch)),
                }
            }
        }
    }

    /// Begin (or join) generation without waiting.
    pub fn start(self: &Arc<Self>, epoch: u64) {
        let _ = self.begin(epoch);
    }

    /// Pre-generate the upcoming epoch in the background; the dataset lands
    /// in the cache when ready.
    pub fn ensure_next_epoch(self: &Arc<Self>, epoch: u64) {
        if let Begin::Waiting(_) = self.begin(epoch) {
            tracing::debug!("🧮 Next epoch #{} queued for pre-calculation", epoch);
        }
    }

    /// Ready dataset for `epoch`, never waits.
    pub fn get(&self, epoch: u64) -> Option<Arc<EpochDataset>> {
        match self.slots.lock().get(&epoch) {
            Some(Slot::Ready(ds)) => Some(ds.clone()),
            _ => None,
        }
    }

    pub fn is_generating(&self, epoch: u64) -> bool {
        matches!(self.slots.lock().get(&epoch), Some(Slot::Generating(_)))
    }

    pub fn contains(&self, epoch: u64) -> bool {
        self.slots.lock().contains_key(&epoch)
    }

    /// Epochs with an entry (ready or generating), ascending.
    pub fn epochs(&self) -> Vec<u64> {
        let mut out: Vec<u64> = self.slots.lock().keys().copied().collect();
        out.sort_unstable();
        out
    }

    /// Number of generations started since creation.
    pub fn generations_started(&self) -> u64 {
        self.started.load(Ordering::SeqCst)
    }

    /// Drop ready entries more than one epoch behind `epoch`. Generations
    /// still in flight are left alone. Returns how many entries were removed.
    pub fn evict_older_than(&self, epoch: u64) -> usize {
        let keep_from = epoch.saturating_sub(1);
        let removed = {
            let mut slots = self.slots.lock();
            let before = slots.len();
            slots.retain(|e, slot| *e >= keep_from || matches!(slot, Slot::Generating(_)));
            before - slots.len()
        };
        if let Some(store) = &self.store {
            if let Err(e) = store.prune_below(keep_from) {
                tracing::warn!("Epoch store prune failed: {}", e);
            }
        }
        if removed > 0 {
            tracing::info!("🧹 Evicted {} stale epoch dataset(s) below #{}", removed, keep_from);
        }
        removed
    }

    fn begin(self: &Arc<Self>, epoch: u64) -> Begin {
        let (tx, rx) = {
            let mut slots = self.slots.lock();
            match slots.get(&epoch) {
                Some(Slot::Ready(ds)) => return Begin::Ready(ds.clone()),
                Some(Slot::Generating(rx)) => return Begin::Waiting(rx.clone()),
                None => {}
            }
            let (tx, rx) = watch::channel(GenState::Pending);
            slots.insert(epoch, Slot::Generating(rx.clone()));
            (tx, rx)
        };
        self.started.fetch_add(1, Ordering::SeqCst);
        tracing::info!("🧮 Calculating verification dataset for epoch #{}", epoch);

        let cache = self.clone();
        tokio::spawn(async move {
            let engine = cache.engine.clone();
            let store = cache.store.clone();
            let t0 = Instant::now();
            let outcome = tokio::task::spawn_blocking(move || {
                load_or_generate(engine.as_ref(), store.as_deref(), epoch)
            })
            .await;

            let state = match outcome {
                Ok(Ok(ds)) => {
                    let ds = Arc::new(ds);
                    cache.finish(epoch, Some(ds.clone()));
                    tracing::info!(
                        "🧮 Epoch #{} ready in {:.2}s, seed {}",
                        epoch,
                        t0.elapsed().as_secs_f64(),
                        hex::encode(ds.seed)
                    );
                    GenState::Ready(ds)
                }
                Ok(Err(e)) => {
                    cache.finish(epoch, None);
                    tracing::error!("❌ Epoch #{} generation failed: {}", epoch, e);
                    GenState::Failed(e.to_string())
                }
                Err(e) => {
                    cache.finish(epoch, None);
                    tracing::error!("❌ Epoch #{} generation task aborted: {}", epoch, e);
                    GenState::Failed(e.to_string())
                }
            };
            let _ = tx.send(state);
        });

        Begin::Waiting(rx)
    }

    /// Settle a generating slot. Slots evicted mid-generation stay evicted.
    fn finish(&self, epoch: u64, dataset: Option<Arc<EpochDataset>>) {
        let mut slots = self.slots.lock();
        if !matches!(slots.get(&epoch), Some(Slot::Generating(_))) {
            return;
        }
        match dataset {
            Some(ds) => {
                slots.insert(epoch, Slot::Ready(ds));
            }
            None => {
                slots.remove(&epoch);
            }
        }
    }
}

fn load_or_generate(
    engine: &dyn PowEngine,
    store: Option<&EpochStore>,
    epoch: u64,
) -> Result<EpochDataset, PowError> {
    if let Some(store) = store {
        match store.get(epoch) {
            Ok(Some(ds))
                if ds.seed == engine.seed_hash(epoch) && ds.data.len() == engine.dataset_size() =>
            {
                tracing::debug!("💾 Loaded epoch #{} dataset from store", epoch);
                return Ok(ds);
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Epoch store read failed: {}", e),
        }
    }

    let ds = engine.generate(epoch)?;

    if let Some(store) = store {
        if let Err(e) = store.put(&ds) {
            tracing::warn!("Epoch store write failed: {}", e);
        }
    }
    Ok(ds)
}
