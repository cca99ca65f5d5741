//! Runtime tunables, collected into one `serde`-(de)serializable struct.
//!
//! Pattern grounded on the teacher's own `toml`-based config loading
//! (formerly `ctrl::Cluster::load_toml`, removed along with `Cluster` —
//! see `DESIGN.md`). Defaults match spec §6's "Configuration constants".

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::rpc::status::{RpcError, RpcStatus};

/// Tunable parameters for a `Client`/`Server`'s connections.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Size in bytes of each context's scratch page. Must be a power of
    /// two, 1 KiB to 64 KiB.
    pub page_size: usize,

    /// Number of contexts (in-flight RPC slots) per connection.
    pub n_ctx: u16,

    /// Completion queue capacity. Must be at least `2 * n_ctx`.
    pub cq_cap: u32,

    /// Payload size at or below which a request takes the Send-only
    /// (`ImmRequest`) fast path instead of Send-then-Read.
    pub imm_request_size: usize,

    /// Number of worker threads draining the server's task ring.
    pub worker_count: usize,

    /// Queue-pair retry count on transient failures.
    pub retry_count: u8,

    /// Queue-pair RNR (receiver-not-ready) retry count.
    pub rnr_retry_count: u8,

    /// Maximum number of outstanding RDMA reads/atomics as the initiator.
    pub initiator_depth: u8,

    /// Maximum number of outstanding RDMA reads/atomics as the responder.
    pub responder_resources: u8,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            page_size: 1024,
            n_ctx: 16,
            cq_cap: 32,
            imm_request_size: 4096,
            worker_count: 4,
            retry_count: 7,
            rnr_retry_count: 7,
            initiator_depth: 16,
            responder_resources: 16,
        }
    }
}

impl RpcConfig {
    /// Load a config from a TOML file, falling back to [`Default`] for any
    /// field the file omits.
    pub fn load_toml(path: impl AsRef<Path>) -> RpcStatus<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| RpcError::ConfigError(format!("failed to read config file: {e}")))?;
        toml::from_str(&text)
            .map_err(|e| RpcError::ConfigError(format!("failed to parse config file: {e}")))
    }

    /// Validate internal consistency (power-of-two page size, CQ capacity
    /// large enough for the context count, at least one context/worker).
    pub fn validate(&self) -> RpcStatus<()> {
        if !self.page_size.is_power_of_two() || !(1024..=65536).contains(&self.page_size) {
            return Err(RpcError::ConfigError(format!(
                "page_size {} must be a power of two in [1024, 65536]",
                self.page_size
            )));
        }
        if self.n_ctx == 0 {
            return Err(RpcError::ConfigError("n_ctx must be positive".into()));
        }
        if (self.cq_cap as u32) < 2 * self.n_ctx as u32 {
            return Err(RpcError::ConfigError(format!(
                "cq_cap {} must be at least 2 * n_ctx ({})",
                self.cq_cap,
                2 * self.n_ctx
            )));
        }
        if self.worker_count == 0 {
            return Err(RpcError::ConfigError("worker_count must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        RpcConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_non_power_of_two_page_size() {
        let mut cfg = RpcConfig::default();
        cfg.page_size = 1500;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_undersized_cq() {
        let mut cfg = RpcConfig::default();
        cfg.cq_cap = 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn toml_roundtrip_fills_in_defaults() {
        let partial = "n_ctx = 8\n";
        let cfg: RpcConfig = toml::from_str(partial).unwrap();
        assert_eq!(cfg.n_ctx, 8);
        assert_eq!(cfg.page_size, RpcConfig::default().page_size);
    }
}
