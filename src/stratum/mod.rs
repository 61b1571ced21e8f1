//! Stratum server
//!
//! Architecture:
//!   Miner ←TCP, JSON lines→ connection task ←Arc<Pool>→ jobs / epochs / sessions
//!
//! One task per connection. Replies are written by the connection task in
//! request order; everything pushed from outside (job broadcasts, difficulty
//! changes) goes through the session's bounded outbox and is interleaved
//! between requests. The idle sweep and shutdown close a connection through
//! its cancellation token; a connection that has not logged in within the
//! miner timeout closes itself.

pub mod handlers;
pub mod protocol;

use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

use crate::config::PortConfig;
use crate::core::params::{http_response, OUTBOX_CAPACITY};
use crate::error::PoolError;
use crate::pool::Pool;
use crate::session::Outbox;
use protocol::{classify, Inbound};

/// Per-connection state owned by the connection task.
pub(crate) struct Connection {
    pub conn_id: u64,
    pub extranonce: String,
    pub ip: String,
    pub port: PortConfig,
    pub outbox: Outbox,
}

/// A bound stratum port.
pub struct StratumListener {
    listener: TcpListener,
    port: PortConfig,
}

impl StratumListener {
    /// Bind `addr` for the given port settings. Failure here is fatal to
    /// startup.
    pub async fn bind(addr: &str, port: PortConfig) -> Result<Self, PoolError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| PoolError::Bind {
                port: port.port,
                source,
            })?;
        Ok(Self { listener, port })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until shutdown.
    pub async fn serve(self, pool: Arc<Pool>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            "⛏️  Started stratum server on port {} (diff {}, solo={}, getwork={}, stratum={})",
            self.port.port,
            self.port.difficulty,
            self.port.allow_solo,
            self.port.allow_pull,
            self.port.allow_push
        );
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let pool = pool.clone();
                        let port = self.port.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            handle_connection(pool, stream, peer, port, shutdown).await;
                        });
                    }
                    Err(e) => tracing::error!("Stratum accept error: {}", e),
                },
                _ = shutdown.changed() => break,
            }
        }
        tracing::info!("Stratum server on port {} stopped", self.port.port);
    }
}

async fn write_line(writer: &mut OwnedWriteHalf, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await
}

async fn handle_connection(
    pool: Arc<Pool>,
    stream: TcpStream,
    peer: SocketAddr,
    port: PortConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let Some(extranonce) = pool.sessions.reserve_extranonce(pool.config.nonce_size) else {
        tracing::warn!("No free extranonce, refusing connection from {}", peer);
        return;
    };
    let _ = stream.set_nodelay(true);
    let (reader, mut writer) = stream.into_split();
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(pool.config.max_buffer_size));

    let (tx, mut rx) = mpsc::channel::<String>(OUTBOX_CAPACITY);
    let cancel = CancellationToken::new();
    let mut conn = Connection {
        conn_id: pool.next_conn_id(),
        extranonce,
        ip: peer.ip().to_string(),
        port,
        outbox: Outbox {
            tx,
            cancel: cancel.clone(),
        },
    };
    tracing::debug!("🔌 Connection #{} from {} (extranonce {})", conn.conn_id, peer, conn.extranonce);

    // One miner timeout to log in; after login the idle sweep owns the
    // session.
    let login_deadline = tokio::time::sleep(pool.config.miner_timeout());
    tokio::pin!(login_deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = shutdown.changed() => break,
            _ = &mut login_deadline, if !pool.sessions.contains(conn.conn_id) => {
                tracing::warn!("No login from {} within {:?}, disconnecting", conn.ip, pool.config.miner_timeout());
                break;
            }
            Some(line) = rx.recv() => {
                if write_line(&mut writer, &line).await.is_err() {
                    break;
                }
            }
            frame = lines.next() => match frame {
                Some(Ok(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match classify(line) {
                        Inbound::NotAnObject => {
                            tracing::warn!("Malformed stratum request from {}: not an object", conn.ip);
                        }
                        Inbound::Request(req) => {
                            if !req.has_id() {
                                tracing::warn!("Malformed stratum request from {}: no id", conn.ip);
                                continue;
                            }
                            let out = handlers::dispatch(&pool, &mut conn, req).await;
                            let mut failed = false;
                            for line in &out {
                                if write_line(&mut writer, line).await.is_err() {
                                    failed = true;
                                    break;
                                }
                            }
                            if failed {
                                break;
                            }
                        }
                        Inbound::Http(version) => {
                            let _ = writer.write_all(http_response(version).as_bytes()).await;
                            let _ = writer.shutdown().await;
                            break;
                        }
                        Inbound::Malformed(e) => {
                            tracing::warn!("Malformed message from {}: {}", conn.ip, e);
                            break;
                        }
                    }
                }
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    tracing::warn!("Excessive packet size from {}", conn.ip);
                    break;
                }
                Some(Err(LinesCodecError::Io(e))) => {
                    if e.kind() != std::io::ErrorKind::ConnectionReset {
                        tracing::debug!("Socket error from {}: {}", conn.ip, e);
                    }
                    break;
                }
                None => break,
            },
        }
    }

    pool.close_connection(conn.conn_id, &conn.extranonce);
}

/// Fan each admitted job out to every live session until shutdown.
pub async fn broadcast_jobs(pool: Arc<Pool>, mut shutdown: watch::Receiver<bool>) {
    let mut rx = pool.jobs.subscribe();
    loop {
        let job = tokio::select! {
            received = rx.recv() => match received {
                Ok(job) => job,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!("Job broadcast lagged by {}, sending top job", n);
                    match pool.jobs.top_job() {
                        Some(job) => job,
                        None => continue,
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown.changed() => break,
        };
        let (sent, skipped) = pool.broadcast_job(&job);
        tracing::debug!("Job #{} sent to {} session(s), {} skipped", job.id, sent, skipped);
    }
}
