//! Variable difficulty retargeting
//!
//! Each retarget compares a session's average share interval against the
//! target interval. Outside the variance band the difficulty moves toward
//! `target / average * difficulty`, limited by the per-step jump and the
//! configured bounds. A session that has gone quiet for longer than the
//! upper band contributes its current idle time as an extra sample, so a
//! miner that stopped finding shares is eased down.

use std::time::Instant;

use crate::config::VarDiffConfig;
use crate::core::ring_buffer::RingBuffer;
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Retarget {
    pub old: f64,
    pub new: f64,
}

#[derive(Debug, Clone)]
pub struct VarDiffController {
    config: VarDiffConfig,
}

impl VarDiffController {
    pub fn new(config: VarDiffConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &VarDiffConfig {
        &self.config
    }

    /// Starting difficulty for a new session, clamped into the bounds.
    pub fn initial_difficulty(&self, port_difficulty: f64) -> f64 {
        self.config.clamp(port_difficulty)
    }

    /// Retarget one session in place. On a change the share history is
    /// cleared; the caller is responsible for telling the miner.
    pub fn retarget(&self, session: &mut Session, now: Instant) -> Option<Retarget> {
        let idle = session.idle_for(now).as_secs_f64();
        let new = self.next_difficulty(&session.history, session.difficulty, idle)?;
        let old = session.difficulty;
        session.difficulty = new;
        session.history.clear();
        Some(Retarget { old, new })
    }

    /// Pure difficulty step. `None` means leave the difficulty alone.
    pub fn next_difficulty(&self, history: &RingBuffer, difficulty: f64, idle_secs: f64) -> Option<f64> {
        let cfg = &self.config;
        let target = cfg.target_interval_secs;
        let band = cfg.variance_percent / 100.0 * target;
        let low = target - band;
        let high = target + band;
        let min = cfg.min_bound();
        let max = cfg.max_bound();

        let extra = (idle_secs > high).then_some(idle_secs);
        let average = history.average(extra)?;

        let mut new = if average > high && difficulty > min {
            (target / average * difficulty).max(min)
        } else if average < low && difficulty < max {
            if average <= 0.0 {
                max
            } else {
                (target / average * difficulty).min(max)
            }
        } else {
            return None;
        };

        let max_change = cfg.max_jump_percent / 100.0 * difficulty;
        if (new - difficulty).abs() > max_change {
            new = if new > difficulty {
                difficulty + max_change
            } else {
                difficulty - max_change
            };
        }
        let new = new.clamp(min, max);

        if new == difficulty {
            None
        } else {
            Some(new)
        }
    }
}
