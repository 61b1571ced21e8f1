//! Upstream chain node access
//!
//! The pool needs exactly two calls from the node: the current work package
//! and submission of a solved share. `RpcUpstream` speaks plain HTTP/1.1
//! JSON-RPC over a fresh TCP connection per call.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::core::types::*;
use crate::error::UpstreamError;

#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Current work package from the node.
    async fn latest_work(&self) -> Result<Work, UpstreamError>;

    /// Submit a solution. `Ok(true)` means the node accepted it as a block.
    async fn submit_work(
        &self,
        nonce: u64,
        header_hash: &Hash256,
        mix_hash: &Hash256,
    ) -> Result<bool, UpstreamError>;
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: serde_json::Value,
    id: u64,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

/// JSON-RPC client for a node at `host:port`.
#[derive(Debug, Clone)]
pub struct RpcUpstream {
    addr: String,
    timeout: Duration,
}

impl RpcUpstream {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Send one request and return its `result`.
    pub async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, UpstreamError> {
        tokio::time::timeout(self.timeout, self.call_inner(method, params))
            .await
            .map_err(|_| UpstreamError::Timeout)?
    }

    async fn call_inner(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, UpstreamError> {
        let body = serde_json::to_string(&RpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: 1,
        })?;

        let mut stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|source| UpstreamError::Connect {
                addr: self.addr.clone(),
                source,
            })?;

        let http_request = format!(
            "POST / HTTP/1.1\r\nHost: {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            self.addr,
            body.len(),
            body
        );
        stream.write_all(http_request.as_bytes()).await?;

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await?;

        let json_body = http_body(&response).ok_or(UpstreamError::Http)?;
        let rpc_response: RpcResponse = serde_json::from_slice(json_body)?;

        if let Some(err) = rpc_response.error {
            return Err(UpstreamError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        Ok(rpc_response.result.unwrap_or(serde_json::Value::Null))
    }
}

/// Body of a raw HTTP response: everything after the blank line.
fn http_body(response: &[u8]) -> Option<&[u8]> {
    let pos = response.windows(4).position(|w| w == b"\r\n\r\n")?;
    Some(&response[pos + 4..])
}

/// Decode an `eth_getWork` result: `[header, seed, target, height?]`.
pub fn parse_work(value: &serde_json::Value) -> Result<Work, UpstreamError> {
    let items = value
        .as_array()
        .ok_or_else(|| UpstreamError::BadWork("result is not an array".into()))?;
    if items.len() < 4 {
        return Err(UpstreamError::BadWork(format!(
            "expected 4 elements, got {}",
            items.len()
        )));
    }
    let field = |i: usize| -> Result<&str, UpstreamError> {
        items[i]
            .as_str()
            .ok_or_else(|| UpstreamError::BadWork(format!("element {} is not a string", i)))
    };
    let hash = |i: usize| -> Result<Hash256, UpstreamError> {
        parse_hash(field(i)?).ok_or_else(|| UpstreamError::BadWork(format!("element {} is not a 32-byte hash", i)))
    };

    let height = match &items[3] {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => parse_quantity(s),
        _ => None,
    }
    .ok_or_else(|| UpstreamError::BadWork("bad block height".into()))?;

    Ok(Work {
        header_hash: hash(0)?,
        seed_hash: hash(1)?,
        target: hash(2)?,
        height,
    })
}

#[async_trait]
impl UpstreamClient for RpcUpstream {
    async fn latest_work(&self) -> Result<Work, UpstreamError> {
        let result = self.call("eth_getWork", json!([])).await?;
        parse_work(&result)
    }

    async fn submit_work(
        &self,
        nonce: u64,
        header_hash: &Hash256,
        mix_hash: &Hash256,
    ) -> Result<bool, UpstreamError> {
        let params = json!([nonce_to_hex(nonce), hash_to_hex(header_hash), hash_to_hex(mix_hash)]);
        let result = self.call("eth_submitWork", params).await?;
        Ok(result.as_bool().unwrap_or(false))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Scriptable in-memory node.
    #[derive(Default)]
    pub struct MockUpstream {
        pub work: Mutex<Option<Work>>,
        pub accept: Mutex<bool>,
        pub fail_submit: Mutex<bool>,
        pub submissions: Mutex<Vec<(u64, Hash256, Hash256)>>,
    }

    impl MockUpstream {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_work(&self, work: Work) {
            *self.work.lock() = Some(work);
        }

        pub fn submitted(&self) -> Vec<(u64, Hash256, Hash256)> {
            self.submissions.lock().clone()
        }
    }

    #[async_trait]
    impl UpstreamClient for MockUpstream {
        async fn latest_work(&self) -> Result<Work, UpstreamError> {
            self.work
                .lock()
                .clone()
                .ok_or_else(|| UpstreamError::BadWork("no work".into()))
        }

        async fn submit_work(
            &self,
            nonce: u64,
            header_hash: &Hash256,
            mix_hash: &Hash256,
        ) -> Result<bool, UpstreamError> {
            self.submissions.lock().push((nonce, *header_hash, *mix_hash));
            if *self.fail_submit.lock() {
                return Err(UpstreamError::Timeout);
            }
            Ok(*self.accept.lock())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncBufReadExt;
    use tokio::net::TcpListener;

    /// One-shot HTTP server answering a single request with `body`.
    async fn serve_once(body: String) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = tokio::io::BufReader::new(stream);
            let mut content_length = 0usize;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).await.unwrap();
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    break;
                }
                if let Some(v) = trimmed.strip_prefix("Content-Length:") {
                    content_length = v.trim().parse().unwrap();
                }
            }
            let mut req = vec![0u8; content_length];
            reader.read_exact(&mut req).await.unwrap();
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            );
            reader.get_mut().write_all(response.as_bytes()).await.unwrap();
            String::from_utf8(req).unwrap()
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn test_latest_work() {
        let header = format!("0x{}", "aa".repeat(32));
        let seed = format!("0x{}", "bb".repeat(32));
        let target = format!("0x{}", "0f".repeat(32));
        let body = json!({"jsonrpc": "2.0", "id": 1, "result": [header, seed, target, "0x1e8480"]}).to_string();
        let (addr, server) = serve_once(body).await;

        let work = RpcUpstream::new(addr).latest_work().await.unwrap();
        assert_eq!(work.header_hash, [0xaa; 32]);
        assert_eq!(work.seed_hash, [0xbb; 32]);
        assert_eq!(work.target, [0x0f; 32]);
        assert_eq!(work.height, 2_000_000);

        let request = server.await.unwrap();
        assert!(request.contains("\"eth_getWork\""));
    }

    #[tokio::test]
    async fn test_submit_work_params() {
        let body = json!({"jsonrpc": "2.0", "id": 1, "result": true}).to_string();
        let (addr, server) = serve_once(body).await;

        let ok = RpcUpstream::new(addr)
            .submit_work(0x1122, &[0x01; 32], &[0x02; 32])
            .await
            .unwrap();
        assert!(ok);

        let request: serde_json::Value = serde_json::from_str(&server.await.unwrap()).unwrap();
        assert_eq!(request["method"], "eth_submitWork");
        assert_eq!(request["params"][0], "0x0000000000001122");
        assert_eq!(request["params"][1], format!("0x{}", "01".repeat(32)));
    }

    #[tokio::test]
    async fn test_rpc_error_maps() {
        let body = json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32000, "message": "no work"}}).to_string();
        let (addr, _server) = serve_once(body).await;
        let err = RpcUpstream::new(addr).latest_work().await.unwrap_err();
        assert!(matches!(err, UpstreamError::Rpc { code: -32000, .. }));
    }

    #[tokio::test]
    async fn test_unreachable_node() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let err = RpcUpstream::new(addr).latest_work().await.unwrap_err();
        assert!(matches!(err, UpstreamError::Connect { .. }));
    }

    #[tokio::test]
    async fn test_silent_node_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        // accept and hold the socket without answering
        let _server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(stream);
        });

        let client = RpcUpstream::new(addr.clone()).with_timeout(Duration::from_millis(100));
        assert_eq!(client.addr(), addr);
        let err = client.latest_work().await.unwrap_err();
        assert!(matches!(err, UpstreamError::Timeout));
    }

    #[test]
    fn test_parse_work_rejects_short() {
        assert!(parse_work(&json!(["0x00", "0x00"])).is_err());
        assert!(parse_work(&json!("nope")).is_err());
    }
}
