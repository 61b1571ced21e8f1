/// ForgePool protocol parameters
/// Wire-level constants and the defaults every config knob falls back to.

/// Blocks per verification epoch (Ethash-style chains use 30,000)
pub const DEFAULT_EPOCH_LENGTH: u64 = 30_000;

/// The only push-dialect protocol version `mining.subscribe` accepts
pub const STRATUM_PROTOCOL_VERSION: &str = "EthereumStratum/1.0.0";

/// Maximum buffered, not yet newline-terminated input per connection (10 KB)
pub const MAX_BUFFER_SIZE: usize = 10 * 1024;

/// Extranonce length in hex characters
pub const DEFAULT_NONCE_SIZE: usize = 4;

/// Full proof-of-work nonce length in hex characters (8 bytes)
pub const NONCE_HEX_LEN: usize = 16;

/// Job ids are the trailing hex digits of the header hash
pub const JOB_ID_LEN: usize = 16;

/// Share-interval history kept per session for VarDiff
pub const DEFAULT_HISTORY_SIZE: usize = 16;

/// Jobs older than `top height - MAX_BACKLOG` are dropped
pub const DEFAULT_MAX_BACKLOG: u64 = 3;

/// Body of the plaintext reply given to HTTP health probes
pub const HTTP_BANNER: &str = "Mining server online";

/// Outbound messages queued per connection before broadcasts start skipping it
pub const OUTBOX_CAPACITY: usize = 64;

/// Error code carried in every stratum error reply
pub const STRATUM_ERROR_CODE: i32 = -1;

/// Epoch number for a block height
pub fn epoch_of(height: u64, epoch_length: u64) -> u64 {
    if epoch_length == 0 {
        return 0;
    }
    height / epoch_length
}

/// Full plaintext HTTP response for the health-check fallback
pub fn http_response(version: &str) -> String {
    format!(
        "{} 200 OK\nContent-Type: text/plain\nContent-Length: {}\n\n{}",
        version,
        HTTP_BANNER.len(),
        HTTP_BANNER
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_boundaries() {
        assert_eq!(epoch_of(0, DEFAULT_EPOCH_LENGTH), 0);
        assert_eq!(epoch_of(29_999, DEFAULT_EPOCH_LENGTH), 0);
        assert_eq!(epoch_of(30_000, DEFAULT_EPOCH_LENGTH), 1);
        assert_eq!(epoch_of(95_000, DEFAULT_EPOCH_LENGTH), 3);
    }

    #[test]
    fn test_zero_epoch_length() {
        assert_eq!(epoch_of(12345, 0), 0);
    }

    #[test]
    fn test_http_response_length() {
        let resp = http_response("HTTP/1.1");
        assert!(resp.starts_with("HTTP/1.1 200 OK\n"));
        assert!(resp.contains("Content-Length: 20\n"));
        assert!(resp.ends_with("\n\nMining server online"));
    }
}
