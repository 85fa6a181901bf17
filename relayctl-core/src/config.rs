//! Protocol timing and policy. Every field has a default, so an empty table is valid.

use std::time::Duration;

use serde::Deserialize;

/// Tunables shared by both roles.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProtocolConfig {
    /// Minimum gap between actor beacons (default 2000 ms).
    #[serde(default = "default_beacon_interval_ms")]
    pub beacon_interval_ms: u64,
    /// Peer considered gone after this long without a beacon (default 5000 ms).
    #[serde(default = "default_discovery_timeout_ms")]
    pub discovery_timeout_ms: u64,
    /// Outstanding challenge lifetime on the controller (default 1000 ms).
    #[serde(default = "default_challenge_timeout_ms")]
    pub challenge_timeout_ms: u64,
    /// Absolute limit on OTA coordination state (default 300 s).
    #[serde(default = "default_ota_timeout_ms")]
    pub ota_timeout_ms: u64,
    /// Lifetime of a replay-cache entry (default 10 s).
    #[serde(default = "default_nonce_ttl_ms")]
    pub nonce_ttl_ms: u64,
    /// Refuse relay commands to peers that have not passed the challenge (default false).
    #[serde(default)]
    pub require_authenticated_peers: bool,
}

fn default_beacon_interval_ms() -> u64 {
    2000
}
fn default_discovery_timeout_ms() -> u64 {
    5000
}
fn default_challenge_timeout_ms() -> u64 {
    1000
}
fn default_ota_timeout_ms() -> u64 {
    300_000
}
fn default_nonce_ttl_ms() -> u64 {
    10_000
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            beacon_interval_ms: default_beacon_interval_ms(),
            discovery_timeout_ms: default_discovery_timeout_ms(),
            challenge_timeout_ms: default_challenge_timeout_ms(),
            ota_timeout_ms: default_ota_timeout_ms(),
            nonce_ttl_ms: default_nonce_ttl_ms(),
            require_authenticated_peers: false,
        }
    }
}

impl ProtocolConfig {
    pub fn beacon_interval(&self) -> Duration {
        Duration::from_millis(self.beacon_interval_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn challenge_timeout(&self) -> Duration {
        Duration::from_millis(self.challenge_timeout_ms)
    }

    pub fn ota_timeout(&self) -> Duration {
        Duration::from_millis(self.ota_timeout_ms)
    }

    pub fn nonce_ttl(&self) -> Duration {
        Duration::from_millis(self.nonce_ttl_ms)
    }
}
