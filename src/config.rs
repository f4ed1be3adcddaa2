//! Session configuration parameters
//!
//! Every timing constant the connection layer uses lives here so a host
//! application can tune (and persist) them.  The reconnection curve is an
//! empirical heuristic; only the budget guarantee is contractual.

use core::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Tunable parameters for one device connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    // --- Exchange ---
    /// Default bound on one command/response exchange (milliseconds)
    pub apdu_timeout_ms: u32,
    /// Retries for one failed frame write before escalating
    pub frame_write_retries: u8,
    /// Delay between frame write retries (milliseconds)
    pub frame_retry_delay_ms: u32,
    /// Bound on the MTU negotiation exchange (milliseconds)
    pub mtu_handshake_timeout_ms: u32,

    // --- Reconnection ---
    /// Time allowed to re-establish a lost link before terminating (milliseconds)
    pub reconnect_budget_ms: u32,
    /// Delay after a failed reconnection attempt (milliseconds)
    pub reconnect_delay_ms: u32,
    /// Delay after an attempt that failed because the peer is out of range
    pub out_of_range_delay_ms: u32,
    /// Fixed wait when the transport cannot signal reachability (milliseconds)
    pub reachability_fallback_ms: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            // Exchange
            apdu_timeout_ms: 30_000,
            frame_write_retries: 3,
            frame_retry_delay_ms: 50,
            mtu_handshake_timeout_ms: 2_000,

            // Reconnection
            reconnect_budget_ms: 5_000,
            reconnect_delay_ms: 250,
            out_of_range_delay_ms: 1_000,
            reachability_fallback_ms: 200,
        }
    }
}

impl SessionConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|_| Error::Config("malformed JSON configuration"))?;
        config.validate()?;
        Ok(config)
    }

    /// Decode a persisted configuration blob.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let config: Self =
            postcard::from_bytes(bytes).map_err(|_| Error::Config("malformed configuration blob"))?;
        config.validate()?;
        Ok(config)
    }

    /// Encode for persistence.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        postcard::to_allocvec(self).map_err(|_| Error::Config("configuration encoding failed"))
    }

    /// Reject combinations the connection layer cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.apdu_timeout_ms == 0 {
            return Err(Error::Config("apdu_timeout_ms must be non-zero"));
        }
        if self.reconnect_budget_ms == 0 {
            return Err(Error::Config("reconnect_budget_ms must be non-zero"));
        }
        if self.mtu_handshake_timeout_ms == 0 {
            return Err(Error::Config("mtu_handshake_timeout_ms must be non-zero"));
        }
        if self.reconnect_delay_ms > self.reconnect_budget_ms {
            return Err(Error::Config("reconnect_delay_ms exceeds reconnect_budget_ms"));
        }
        if self.out_of_range_delay_ms < self.reconnect_delay_ms {
            return Err(Error::Config("out_of_range_delay_ms shorter than reconnect_delay_ms"));
        }
        if u32::from(self.frame_write_retries) * self.frame_retry_delay_ms >= self.apdu_timeout_ms {
            return Err(Error::Config("frame retries cannot fit in apdu_timeout_ms"));
        }
        Ok(())
    }

    pub fn apdu_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.apdu_timeout_ms))
    }

    pub fn frame_retry_delay(&self) -> Duration {
        Duration::from_millis(u64::from(self.frame_retry_delay_ms))
    }

    pub fn mtu_handshake_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.mtu_handshake_timeout_ms))
    }

    pub fn reconnect_budget(&self) -> Duration {
        Duration::from_millis(u64::from(self.reconnect_budget_ms))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(u64::from(self.reconnect_delay_ms))
    }

    pub fn out_of_range_delay(&self) -> Duration {
        Duration::from_millis(u64::from(self.out_of_range_delay_ms))
    }

    pub fn reachability_fallback(&self) -> Duration {
        Duration::from_millis(u64::from(self.reachability_fallback_ms))
    }
}
