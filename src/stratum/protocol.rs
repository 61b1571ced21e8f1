//! Stratum wire format
//!
//! Newline-delimited JSON. Requests are `{id, method, params}`, replies
//! `{id, error, result}`. Server pushes come in two shapes: `{id: null,
//! method, params}` for EthereumStratum sessions and `{id: 0, jsonrpc:
//! "2.0", result}` job packages for getwork/EthProxy sessions.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::core::params::STRATUM_PROTOCOL_VERSION;
use crate::core::types::*;
use crate::error::StratumError;
use crate::jobs::Job;

#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Value,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
    /// EthProxy puts the worker name at the top level of the login request
    #[serde(default)]
    pub worker: Option<String>,
}

impl Request {
    pub fn has_id(&self) -> bool {
        !self.id.is_null()
    }

    /// Params as a list. Object or scalar params count as missing.
    pub fn params_list(&self) -> Option<&[Value]> {
        match &self.params {
            Some(Value::Array(items)) => Some(items),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyError {
    pub code: i32,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub id: Value,
    pub error: Option<ReplyError>,
    pub result: Value,
}

impl Reply {
    pub fn success(id: Value, result: Value) -> Self {
        Reply { id, error: None, result }
    }

    pub fn error(id: Value, err: &StratumError) -> Self {
        Reply {
            id,
            error: Some(ReplyError {
                code: err.code(),
                message: err.to_string(),
            }),
            result: Value::Null,
        }
    }

    pub fn from_result(id: Value, outcome: Result<Value, StratumError>) -> Self {
        match outcome {
            Ok(result) => Reply::success(id, result),
            Err(e) => Reply::error(id, &e),
        }
    }

    pub fn to_line(&self) -> String {
        to_line(self)
    }
}

fn to_line<T: Serialize>(msg: &T) -> String {
    // Serializing plain Values and derived structs cannot fail
    serde_json::to_string(msg).unwrap_or_default()
}

/// `{id: null, method, params}`
pub fn push_line(method: &str, params: Value) -> String {
    to_line(&json!({ "id": Value::Null, "method": method, "params": params }))
}

/// `{id: 0, jsonrpc: "2.0", result}`
pub fn job_result_line(result: Value) -> String {
    to_line(&json!({ "id": 0, "jsonrpc": "2.0", "result": result }))
}

/// getwork package: `[header, seed, share target]`, all `0x` hex.
pub fn pull_job(job: &Job, difficulty: f64, unit_multiplier: f64) -> Value {
    json!([
        hash_to_hex(&job.header_hash),
        hash_to_hex(&job.seed_hash),
        hash_to_hex(&difficulty_to_target(difficulty * unit_multiplier)),
    ])
}

/// `mining.notify` params: `[extranonce ‖ job id, seed, header, clean]`,
/// hashes without `0x`.
pub fn notify_params(extranonce: &str, job: &Job) -> Value {
    json!([
        format!("{}{}", extranonce, job.id),
        hex::encode(job.seed_hash),
        hex::encode(job.header_hash),
        true
    ])
}

/// `mining.subscribe` result.
pub fn subscribe_result(subscription_id: &str, extranonce: &str) -> Value {
    json!([
        ["mining.notify", subscription_id, STRATUM_PROTOCOL_VERSION],
        extranonce
    ])
}

/// What a single inbound line turned out to be.
#[derive(Debug)]
pub enum Inbound {
    Request(Request),
    /// Valid JSON that is not an object; logged and skipped
    NotAnObject,
    /// HTTP request line; answer with the banner in this HTTP version
    Http(&'static str),
    Malformed(String),
}

pub fn classify(line: &str) -> Inbound {
    match serde_json::from_str::<Value>(line) {
        Ok(value @ Value::Object(_)) => {
            let id = value.get("id").cloned().unwrap_or(Value::Null);
            // Wrongly typed fields still get a reply, as a request without a method
            let req = serde_json::from_value::<Request>(value).unwrap_or(Request {
                id,
                method: None,
                params: None,
                worker: None,
            });
            Inbound::Request(req)
        }
        Ok(_) => Inbound::NotAnObject,
        Err(e) => {
            if line.starts_with("GET /") || line.starts_with("POST /") {
                if line.contains("HTTP/1.1") {
                    return Inbound::Http("HTTP/1.1");
                }
                if line.contains("HTTP/1.0") {
                    return Inbound::Http("HTTP/1.0");
                }
            }
            Inbound::Malformed(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        let mut header_hash = [0u8; 32];
        header_hash[31] = 0x42;
        Job {
            id: crate::jobs::job_id(&header_hash),
            header_hash,
            seed_hash: [0x01; 32],
            target: [0xff; 32],
            height: 1,
            epoch: 0,
            seq: 0,
        }
    }

    #[test]
    fn test_classify_request() {
        match classify(r#"{"id":1,"method":"eth_getWork","params":[]}"#) {
            Inbound::Request(req) => {
                assert!(req.has_id());
                assert_eq!(req.method.as_deref(), Some("eth_getWork"));
                assert_eq!(req.params_list().map(|p| p.len()), Some(0));
                assert!(req.worker.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_classify_missing_id() {
        match classify(r#"{"method":"eth_getWork","params":[]}"#) {
            Inbound::Request(req) => assert!(!req.has_id()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_classify_http() {
        assert!(matches!(classify("GET / HTTP/1.1"), Inbound::Http("HTTP/1.1")));
        assert!(matches!(classify("POST /status HTTP/1.0"), Inbound::Http("HTTP/1.0")));
        assert!(matches!(classify("GET / HTTP/2"), Inbound::Malformed(_)));
        assert!(matches!(classify("hello"), Inbound::Malformed(_)));
    }

    #[test]
    fn test_classify_json_scalars_are_skipped() {
        for line in ["[]", "1", r#""x""#, "null"] {
            assert!(matches!(classify(line), Inbound::NotAnObject), "{}", line);
        }
    }

    #[test]
    fn test_classify_wrong_field_types() {
        match classify(r#"{"id":5,"method":7,"params":[]}"#) {
            Inbound::Request(req) => {
                assert_eq!(req.id, json!(5));
                assert!(req.method.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_reply_shape() {
        let ok: Value = serde_json::from_str(&Reply::success(json!(3), json!(true)).to_line()).unwrap();
        assert_eq!(ok, json!({"id": 3, "error": null, "result": true}));

        let err = Reply::error(json!(4), &StratumError::StaleShare);
        let v: Value = serde_json::from_str(&err.to_line()).unwrap();
        assert_eq!(v, json!({"id": 4, "error": {"code": -1, "message": "Stale share"}, "result": null}));
    }

    #[test]
    fn test_job_messages() {
        let j = job();
        let v: Value = serde_json::from_str(&job_result_line(pull_job(&j, 1.0, 1.0))).unwrap();
        assert_eq!(v["id"], 0);
        assert_eq!(v["jsonrpc"], "2.0");
        assert_eq!(v["result"][0], hash_to_hex(&j.header_hash));
        assert_eq!(v["result"][2], hash_to_hex(&MAX_TARGET));

        let n: Value = serde_json::from_str(&push_line("mining.notify", notify_params("ab12", &j))).unwrap();
        assert!(n["id"].is_null());
        assert_eq!(n["params"][0], "ab120000000000000042");
        assert_eq!(n["params"][1], "01".repeat(32));
        assert_eq!(n["params"][3], true);
    }

    #[test]
    fn test_subscribe_result() {
        assert_eq!(
            subscribe_result("s1", "ab12"),
            json!([["mining.notify", "s1", "EthereumStratum/1.0.0"], "ab12"])
        );
    }
}
