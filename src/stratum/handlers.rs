//! Method dispatch for both dialects
//!
//! Each handler returns the lines to write back, reply first, followed by
//! any pushes that must come after it (difficulty, job, extranonce).

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;

use super::protocol::*;
use super::Connection;
use crate::core::params::STRATUM_PROTOCOL_VERSION;
use crate::core::ring_buffer::RingBuffer;
use crate::core::types::*;
use crate::error::StratumError;
use crate::events::PoolEvent;
use crate::pool::Pool;
use crate::session::{Dialect, Session};

/// Default worker name when the login carries none
const DEFAULT_WORKER: &str = "0";

struct Login {
    address: String,
    worker: String,
    solo: bool,
}

pub(crate) async fn dispatch(pool: &Arc<Pool>, conn: &mut Connection, req: Request) -> Vec<String> {
    let id = req.id.clone();
    let (method, params) = match (req.method.as_deref(), req.params_list()) {
        (Some(method), Some(params)) => (method, params),
        _ => return vec![Reply::error(id, &StratumError::MalformedRequest).to_line()],
    };

    let mut pushes = Vec::new();
    let outcome = match method {
        "eth_submitLogin" => submit_login(pool, conn, params, req.worker.as_deref(), &mut pushes),
        "eth_getWork" => get_work(pool, conn).await,
        "eth_submitHashrate" => Ok(json!(true)),
        "eth_submitWork" => submit_share(pool, conn, params, Dialect::Pull).await,
        "mining.subscribe" => subscribe(conn, params),
        "mining.authorize" => authorize(pool, conn, params, &mut pushes),
        "mining.submit" => submit_share(pool, conn, params, Dialect::Push).await,
        "mining.extranonce.subscribe" => {
            pushes.push(push_line("mining.set_extranonce", json!([conn.extranonce])));
            Ok(json!(true))
        }
        other => {
            tracing::debug!("Unknown stratum method '{}' from {}", other, conn.ip);
            Err(StratumError::UnknownMethod)
        }
    };

    if let Err(e) = &outcome {
        tracing::debug!("{} from {} rejected: {}", method, conn.ip, e);
    }

    let mut lines = vec![Reply::from_result(id, outcome).to_line()];
    lines.append(&mut pushes);
    lines
}

/// Shares are parsed in the dialect the session logged in with, so a
/// submission in the other family's shape is malformed.
async fn submit_share(
    pool: &Arc<Pool>,
    conn: &Connection,
    params: &[Value],
    fallback: Dialect,
) -> Result<Value, StratumError> {
    let dialect = pool
        .sessions
        .with_mut(conn.conn_id, |s| s.dialect)
        .unwrap_or(fallback);
    pool.validator
        .process_share(params, dialect, conn.conn_id)
        .await
        .map(Value::Bool)
}

fn param_str(params: &[Value], i: usize) -> Option<&str> {
    params.get(i).and_then(Value::as_str)
}

/// Shared login rules for `eth_submitLogin` and `mining.authorize`:
/// `login` is `address[.worker]`, the password opts into solo mining.
fn validate_login(
    conn: &Connection,
    params: &[Value],
    proxy_worker: Option<&str>,
) -> Result<Login, StratumError> {
    let login = match param_str(params, 0) {
        Some(l) if !l.is_empty() => l,
        _ => return Err(StratumError::validation("Missing login")),
    };
    let pass = param_str(params, 1).unwrap_or("");

    let solo = pass.contains("solo");
    if solo && !conn.port.allow_solo {
        return Err(StratumError::validation("Solo mining is not allowed on this port"));
    }

    let (address, login_worker) = match login.split_once('.') {
        Some((address, worker)) => (address, Some(worker)),
        None => (login, None),
    };
    if !validate_address(address) {
        return Err(StratumError::validation("Invalid address"));
    }

    let worker = login_worker
        .or_else(|| param_str(params, 2))
        .or(proxy_worker)
        .filter(|w| !w.is_empty())
        .unwrap_or(DEFAULT_WORKER);

    Ok(Login {
        address: address.to_lowercase(),
        worker: worker.to_string(),
        solo,
    })
}

/// Register the session for this connection and announce it.
fn open_session(pool: &Arc<Pool>, conn: &Connection, login: Login, dialect: Dialect) -> Session {
    let session = Session {
        unique_id: unique_id(),
        conn_id: conn.conn_id,
        address: login.address,
        worker: login.worker,
        solo: login.solo,
        dialect,
        extranonce: conn.extranonce.clone(),
        difficulty: pool.vardiff.initial_difficulty(conn.port.difficulty),
        last_activity: Instant::now(),
        history: RingBuffer::new(pool.config.var_diff.history_size),
        active: true,
        var_diff: conn.port.var_diff,
        ip: conn.ip.clone(),
        port: conn.port.port,
        outbox: conn.outbox.clone(),
    };

    if let Some(previous) = pool.sessions.insert(session.clone()) {
        pool.events.emit(PoolEvent::SessionDisconnect { id: previous.unique_id });
    }

    tracing::info!(
        "⛏️  {} connected {}.{}@{} on port {} ({}, diff {})",
        if session.solo { "Solo miner" } else { "Miner" },
        session.address,
        session.worker,
        session.ip,
        session.port,
        session.dialect,
        session.difficulty
    );
    pool.events.emit(PoolEvent::SessionConnect {
        id: session.unique_id.clone(),
        address: session.address.clone(),
        worker: session.worker.clone(),
        ip: session.ip.clone(),
        port: session.port,
    });
    session
}

fn submit_login(
    pool: &Arc<Pool>,
    conn: &mut Connection,
    params: &[Value],
    proxy_worker: Option<&str>,
    pushes: &mut Vec<String>,
) -> Result<Value, StratumError> {
    if !conn.port.allow_pull {
        return Err(StratumError::validation("Getwork is not allowed on this port"));
    }
    let login = validate_login(conn, params, proxy_worker)?;
    let dialect = if proxy_worker.is_some() {
        Dialect::PushProxy
    } else {
        Dialect::Pull
    };
    let session = open_session(pool, conn, login, dialect);

    if let Some(job) = pool.jobs.top_job() {
        pushes.push(pool.job_line(&session, &job));
    }
    Ok(json!(true))
}

async fn get_work(pool: &Arc<Pool>, conn: &Connection) -> Result<Value, StratumError> {
    let difficulty = pool
        .sessions
        .with_mut(conn.conn_id, |s| s.difficulty)
        .ok_or(StratumError::NotSubscribed)?;
    let job = pool
        .jobs
        .wait_for_top_job(pool.config.get_work_timeout())
        .await
        .ok_or(StratumError::WorkNotReady)?;
    Ok(pull_job(&job, difficulty, pool.config.var_diff.unit_multiplier))
}

fn subscribe(conn: &Connection, params: &[Value]) -> Result<Value, StratumError> {
    if param_str(params, 1) != Some(STRATUM_PROTOCOL_VERSION) {
        return Err(StratumError::validation("Unsupported protocol version"));
    }
    if !conn.port.allow_push {
        return Err(StratumError::validation("Stratum is not allowed on this port"));
    }
    let subscription = unique_id();
    Ok(subscribe_result(&subscription, &conn.extranonce))
}

fn authorize(
    pool: &Arc<Pool>,
    conn: &mut Connection,
    params: &[Value],
    pushes: &mut Vec<String>,
) -> Result<Value, StratumError> {
    if !conn.port.allow_push {
        return Err(StratumError::validation("Stratum is not allowed on this port"));
    }
    let login = validate_login(conn, params, None)?;
    let session = open_session(pool, conn, login, Dialect::Push);

    pushes.push(push_line("mining.set_difficulty", json!([session.difficulty])));
    if let Some(job) = pool.jobs.top_job() {
        pushes.push(pool.job_line(&session, &job));
    }
    Ok(json!(true))
}
