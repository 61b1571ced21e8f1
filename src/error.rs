//! Error types for forgepool.
//!
//! Client-facing failures are `StratumError`: each variant knows the message
//! sent back in the reply and whether the connection survives it. Everything
//! else converts into the top-level `PoolError`.

use thiserror::Error;

use crate::core::params::STRATUM_ERROR_CODE;

/// Errors reported to a miner in a stratum reply.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StratumError {
    /// Share params have the wrong count or fail to parse
    #[error("Malformed PoW result")]
    MalformedShare,

    /// The submitting connection has no live session
    #[error("Not subscribed")]
    NotSubscribed,

    /// Verification dataset missing or the PoW capability failed; retry later
    #[error("Validator is not yet ready")]
    ValidatorNotReady,

    /// Share references work that is no longer retained
    #[error("Stale share")]
    StaleShare,

    /// Login/authorize rejected (bad address, solo disallowed, ...)
    #[error("{0}")]
    Validation(String),

    /// No top job appeared within the get-work wait
    #[error("Work not ready")]
    WorkNotReady,

    /// Request object without a method or params
    #[error("Malformed stratum request")]
    MalformedRequest,

    #[error("Unknown stratum method")]
    UnknownMethod,
}

impl StratumError {
    pub fn code(&self) -> i32 {
        STRATUM_ERROR_CODE
    }

    pub fn validation(msg: &str) -> Self {
        StratumError::Validation(msg.to_string())
    }
}

/// Framing-level violations. Always end the connection.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("excessive packet size (over {0} bytes)")]
    Oversized(usize),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PowError {
    #[error("dataset is empty")]
    EmptyDataset,

    #[error("generation failed: {0}")]
    Generation(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EpochError {
    #[error("epoch {0} generation timed out")]
    Timeout(u64),

    #[error("epoch {epoch} generation failed: {reason}")]
    Failed { epoch: u64, reason: String },
}

#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("cannot reach upstream {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("upstream request timed out")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid HTTP response")]
    Http,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("unexpected work format: {0}")]
    BadWork(String),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] bincode::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level error for starting and running the pool.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("failed to bind stratum port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PoolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stratum_messages() {
        assert_eq!(StratumError::StaleShare.to_string(), "Stale share");
        assert_eq!(StratumError::MalformedShare.to_string(), "Malformed PoW result");
        assert_eq!(
            StratumError::validation("Invalid address").to_string(),
            "Invalid address"
        );
        assert_eq!(StratumError::UnknownMethod.code(), -1);
    }

    #[test]
    fn test_pool_error_from_config() {
        let err: PoolError = ConfigError::Invalid("no ports".into()).into();
        assert_eq!(err.to_string(), "invalid config: no ports");
    }
}
