//! Pool events for the persistence/API side
//!
//! The stratum engine only emits; storing shares, crediting rounds and
//! serving statistics happen in whatever consumes the sink.

use serde::Serialize;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PoolEvent {
    SessionConnect {
        id: String,
        address: String,
        worker: String,
        ip: String,
        port: u16,
    },
    SessionDisconnect {
        id: String,
    },
    ShareAccepted {
        address: String,
        worker: String,
        difficulty: f64,
        solo: bool,
    },
    CandidateFound {
        address: String,
        height: u64,
        nonce: String,
        solo: bool,
    },
    SubmissionFailed {
        address: String,
        height: u64,
        reason: String,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: PoolEvent);
}

/// Writes every event to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: PoolEvent) {
        match event {
            PoolEvent::SessionConnect { address, worker, ip, port, .. } => {
                tracing::info!("🔌 Miner connected {}.{}@{} on port {}", address, worker, ip, port);
            }
            PoolEvent::SessionDisconnect { id } => {
                tracing::info!("🔌 Session {} disconnected", id);
            }
            PoolEvent::ShareAccepted { address, worker, difficulty, solo } => {
                tracing::debug!(
                    "Share from {}.{} diff={} solo={}",
                    address, worker, difficulty, solo
                );
            }
            PoolEvent::CandidateFound { address, height, nonce, solo } => {
                tracing::info!(
                    "🎉 Candidate block #{} mined by {} (nonce {}, solo={})",
                    height, address, nonce, solo
                );
            }
            PoolEvent::SubmissionFailed { address, height, reason } => {
                tracing::warn!("Submit for #{} from {} failed: {}", height, address, reason);
            }
        }
    }
}

/// Forwards events to an in-process consumer.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<PoolEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PoolEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: PoolEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("Event consumer gone, dropping event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_sink_delivers_in_order() {
        let (sink, mut rx) = ChannelSink::new();
        sink.emit(PoolEvent::SessionDisconnect { id: "a".into() });
        sink.emit(PoolEvent::SessionDisconnect { id: "b".into() });
        assert_eq!(rx.try_recv().unwrap(), PoolEvent::SessionDisconnect { id: "a".into() });
        assert_eq!(rx.try_recv().unwrap(), PoolEvent::SessionDisconnect { id: "b".into() });
    }

    #[test]
    fn test_channel_sink_survives_dropped_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        sink.emit(PoolEvent::SessionDisconnect { id: "x".into() });
    }

    #[test]
    fn test_event_json_shape() {
        let ev = PoolEvent::CandidateFound {
            address: "0xab".into(),
            height: 12,
            nonce: "0x0000000000000001".into(),
            solo: true,
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["event"], "candidate_found");
        assert_eq!(v["height"], 12);
        assert_eq!(v["solo"], true);
    }
}
