//! Per-connection miner state and the live session table
//!
//! A connection reserves its extranonce as soon as it is accepted; the
//! `Session` itself only exists once a login/authorize succeeds. Both are
//! released when the connection closes.

use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::ring_buffer::RingBuffer;

/// Wire protocol family a session speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Dialect {
    /// getwork: `eth_submitLogin` / `eth_getWork` / `eth_submitWork`
    Pull,
    /// EthProxy: pull login, but jobs are pushed as unsolicited results
    PushProxy,
    /// EthereumStratum/1.0.0: `mining.subscribe` / `mining.notify`
    Push,
}

impl Dialect {
    pub fn is_push(&self) -> bool {
        matches!(self, Dialect::Push)
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Dialect::Pull => "pull",
            Dialect::PushProxy => "push-proxy",
            Dialect::Push => "push",
        };
        f.write_str(s)
    }
}

/// Write side of a connection as seen by everything outside its task.
#[derive(Debug, Clone)]
pub struct Outbox {
    pub tx: mpsc::Sender<String>,
    pub cancel: CancellationToken,
}

impl Outbox {
    /// Queue a line without waiting. Returns false when the queue is full or
    /// the connection is gone.
    pub fn try_send(&self, line: String) -> bool {
        self.tx.try_send(line).is_ok()
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub unique_id: String,
    pub conn_id: u64,
    pub address: String,
    pub worker: String,
    pub solo: bool,
    pub dialect: Dialect,
    pub extranonce: String,
    pub difficulty: f64,
    pub last_activity: Instant,
    pub history: RingBuffer,
    pub active: bool,
    pub var_diff: bool,
    pub ip: String,
    pub port: u16,
    pub outbox: Outbox,
}

impl Session {
    /// Record an accepted share: push the gap since the previous activity
    /// into the history and reset the activity clock.
    pub fn record_share(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_activity).as_secs_f64();
        self.history.append(elapsed);
        self.last_activity = now;
        self.active = true;
    }

    pub fn idle_for(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(self.last_activity)
    }
}

#[derive(Default)]
struct Table {
    sessions: HashMap<u64, Session>,
    nonces: HashSet<String>,
}

/// All live sessions plus the extranonces reserved by open connections.
#[derive(Default)]
pub struct SessionTable {
    inner: Mutex<Table>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve an extranonce of `len` hex characters that no open
    /// connection holds, walking up from a random start. `None` once all
    /// `16^len` values are taken.
    pub fn reserve_extranonce(&self, len: usize) -> Option<String> {
        let space = 16u64.checked_pow(u32::try_from(len).ok()?)?;
        let mut table = self.inner.lock();
        if table.nonces.len() as u64 >= space {
            return None;
        }
        let start = rand::thread_rng().gen_range(0..space);
        for step in 0..space {
            let candidate = format!("{:0width$x}", (start + step) % space, width = len);
            if table.nonces.insert(candidate.clone()) {
                return Some(candidate);
            }
        }
        None
    }

    pub fn release_extranonce(&self, nonce: &str) {
        self.inner.lock().nonces.remove(nonce);
    }

    #[cfg(test)]
    pub fn is_reserved(&self, nonce: &str) -> bool {
        self.inner.lock().nonces.contains(nonce)
    }

    /// Register a session. A repeated login on the same connection replaces
    /// the previous session, which is returned.
    pub fn insert(&self, session: Session) -> Option<Session> {
        self.inner.lock().sessions.insert(session.conn_id, session)
    }

    pub fn remove(&self, conn_id: u64) -> Option<Session> {
        self.inner.lock().sessions.remove(&conn_id)
    }

    pub fn contains(&self, conn_id: u64) -> bool {
        self.inner.lock().sessions.contains_key(&conn_id)
    }

    pub fn get(&self, conn_id: u64) -> Option<Session> {
        self.inner.lock().sessions.get(&conn_id).cloned()
    }

    /// Run `f` against a live session under the table lock.
    pub fn with_mut<R>(&self, conn_id: u64, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        self.inner.lock().sessions.get_mut(&conn_id).map(f)
    }

    /// Visit every live session under the table lock. `f` must not block.
    pub fn for_each(&self, mut f: impl FnMut(&Session)) {
        for session in self.inner.lock().sessions.values() {
            f(session);
        }
    }

    /// Visit every live session mutably under the table lock.
    pub fn for_each_mut(&self, mut f: impl FnMut(&mut Session)) {
        for session in self.inner.lock().sessions.values_mut() {
            f(session);
        }
    }

    #[cfg(test)]
    pub fn snapshot(&self) -> Vec<Session> {
        self.inner.lock().sessions.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_extranonce_unique_among_live() {
        let table = SessionTable::new();
        // 1 hex char: only 16 possible values
        let mut seen = HashSet::new();
        for _ in 0..16 {
            let nonce = table.reserve_extranonce(1).unwrap();
            assert_eq!(nonce.len(), 1);
            assert!(seen.insert(nonce));
        }
    }

    #[test]
    fn test_extranonce_space_exhausted() {
        let table = SessionTable::new();
        for _ in 0..16 {
            table.reserve_extranonce(1).unwrap();
        }
        assert_eq!(table.reserve_extranonce(1), None);
        // the table is still usable afterwards
        assert!(table.is_empty());
        table.release_extranonce("a");
        assert_eq!(table.reserve_extranonce(1).as_deref(), Some("a"));
    }

    #[test]
    fn test_extranonce_keeps_leading_zeros() {
        let table = SessionTable::new();
        for _ in 0..64 {
            assert_eq!(table.reserve_extranonce(4).unwrap().len(), 4);
        }
    }

    #[test]
    fn test_extranonce_reusable_after_release() {
        let table = SessionTable::new();
        let all: Vec<String> = (0..16).map(|_| table.reserve_extranonce(1).unwrap()).collect();
        table.release_extranonce(&all[7]);
        assert!(!table.is_reserved(&all[7]));
        assert_eq!(table.reserve_extranonce(1).as_ref(), Some(&all[7]));
    }

    #[test]
    fn test_insert_remove() {
        let table = SessionTable::new();
        let (s, _rx) = testing::session(7, Dialect::Pull, 10.0);
        assert!(table.insert(s).is_none());
        assert!(table.contains(7));
        assert_eq!(table.with_mut(7, |s| s.difficulty), Some(10.0));
        assert!(table.remove(7).is_some());
        assert!(!table.contains(7));
        assert!(table.with_mut(7, |s| s.difficulty).is_none());
    }

    #[test]
    fn test_record_share_pushes_interval() {
        let (mut s, _rx) = testing::session(1, Dialect::Push, 10.0);
        let start = s.last_activity;
        s.active = false;
        s.record_share(start + Duration::from_secs(12));
        assert!(s.active);
        assert_eq!(s.history.len(), 1);
        assert_eq!(s.history.average(None), Some(12.0));
        assert_eq!(s.idle_for(start + Duration::from_secs(20)), Duration::from_secs(8));
    }

    #[test]
    fn test_outbox_full_is_not_fatal() {
        let (tx, _rx) = mpsc::channel(1);
        let outbox = Outbox {
            tx,
            cancel: CancellationToken::new(),
        };
        assert!(outbox.try_send("a".into()));
        assert!(!outbox.try_send("b".into()));
        assert!(!outbox.cancel.is_cancelled());
    }

    #[test]
    fn test_dialect_display() {
        assert_eq!(Dialect::PushProxy.to_string(), "push-proxy");
        assert!(Dialect::Push.is_push());
        assert!(!Dialect::Pull.is_push());
    }
}
