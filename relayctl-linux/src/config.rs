//! Load config from file and environment.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use relayctl_core::security::KEY_LEN;
use relayctl_core::{LinkAddress, PeerId, ProtocolConfig, SessionKey, SharedSecret};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Actor,
    Controller,
}

/// Daemon configuration. File: ~/.config/relayctl/config.toml or /etc/relayctl/config.toml.
/// Env overrides: RELAYCTL_NODE_ID, RELAYCTL_PORT, RELAYCTL_SHARED_SECRET.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_role")]
    pub role: Role,
    /// Node id 0..=9 (default 1).
    #[serde(default = "default_node_id")]
    pub node_id: u8,
    /// Emulated radio address. Defaults to 02:00:00:00:00:<node_id>.
    #[serde(default)]
    pub link_address: Option<String>,
    /// 32 ASCII characters or 64 hex digits. Required.
    #[serde(default)]
    pub shared_secret: Option<String>,
    /// Multicast UDP port carrying the emulated radio (default 45690).
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_multicast_group")]
    pub multicast_group: Ipv4Addr,
    /// Engine tick period (default 100 ms).
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub actor: ActorSection,
    #[serde(default)]
    pub controller: ControllerSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActorSection {
    /// Beacons are sent only while this file exists. Unset means always enabled.
    #[serde(default)]
    pub enable_file: Option<PathBuf>,
    /// Shell command started when an OTA handoff is committed.
    /// The handoff succeeds once the command starts; its exit status is not awaited.
    #[serde(default)]
    pub update_command: Option<String>,
    /// Fixed session key (64 hex digits). Unset means a fresh random key each start.
    #[serde(default)]
    pub session_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControllerSection {
    /// Actor ids whose beacons are accepted (default 1..=9).
    #[serde(default = "default_actor_ids")]
    pub actor_ids: Vec<u8>,
    #[serde(default)]
    pub session_keys: Vec<SessionKeyEntry>,
}

/// Out-of-band provisioned actor session key (`[[controller.session_keys]]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionKeyEntry {
    pub peer: u8,
    /// 64 hex digits.
    pub key: String,
}

fn default_role() -> Role {
    Role::Actor
}
fn default_node_id() -> u8 {
    1
}
fn default_port() -> u16 {
    45690
}
fn default_multicast_group() -> Ipv4Addr {
    Ipv4Addr::new(239, 255, 60, 61)
}
fn default_tick_interval_ms() -> u64 {
    100
}
fn default_actor_ids() -> Vec<u8> {
    (1..=9).collect()
}

impl Default for ControllerSection {
    fn default() -> Self {
        Self {
            actor_ids: default_actor_ids(),
            session_keys: Vec::new(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            role: default_role(),
            node_id: default_node_id(),
            link_address: None,
            shared_secret: None,
            port: default_port(),
            multicast_group: default_multicast_group(),
            tick_interval_ms: default_tick_interval_ms(),
            protocol: ProtocolConfig::default(),
            actor: ActorSection::default(),
            controller: ControllerSection::default(),
        }
    }
}

/// Load config: explicit path, else first existing default path, else defaults; then env vars.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(path) => read_file(path)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(path) => read_file(&path)?,
            None => Config::default(),
        },
    };
    c.apply_env(|key| std::env::var(key).ok())?;
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/relayctl/config.toml"));
    }
    out.push(PathBuf::from("/etc/relayctl/config.toml"));
    out
}

fn read_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing config {}", path.display()))
}

impl Config {
    /// Apply RELAYCTL_* overrides. `lookup` is `std::env::var` outside tests.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(s) = lookup("RELAYCTL_NODE_ID") {
            self.node_id = s
                .parse()
                .with_context(|| format!("RELAYCTL_NODE_ID={s:?} is not a number"))?;
        }
        if let Some(s) = lookup("RELAYCTL_PORT") {
            self.port = s
                .parse()
                .with_context(|| format!("RELAYCTL_PORT={s:?} is not a port"))?;
        }
        if let Some(s) = lookup("RELAYCTL_SHARED_SECRET") {
            self.shared_secret = Some(s);
        }
        Ok(())
    }

    pub fn node_id(&self) -> anyhow::Result<PeerId> {
        Ok(PeerId::try_from(self.node_id)?)
    }

    pub fn link_address(&self) -> anyhow::Result<LinkAddress> {
        match &self.link_address {
            Some(s) => Ok(s.parse()?),
            None => Ok(LinkAddress([0x02, 0, 0, 0, 0, self.node_id])),
        }
    }

    pub fn shared_secret(&self) -> anyhow::Result<SharedSecret> {
        let Some(s) = self.shared_secret.as_deref() else {
            bail!("shared_secret is not set (config file or RELAYCTL_SHARED_SECRET)");
        };
        if s.len() == KEY_LEN * 2 {
            let bytes = decode_key(s).context("shared_secret")?;
            return Ok(SharedSecret::from_bytes(bytes));
        }
        Ok(SharedSecret::from_passphrase(s)?)
    }

    pub fn actor_session_key(&self) -> anyhow::Result<Option<SessionKey>> {
        self.actor
            .session_key
            .as_deref()
            .map(|s| {
                let key = decode_key(s).context("actor session_key")?;
                Ok::<_, anyhow::Error>(SessionKey::from_bytes(key))
            })
            .transpose()
    }

    pub fn actor_ids(&self) -> anyhow::Result<Vec<PeerId>> {
        self.controller
            .actor_ids
            .iter()
            .map(|&raw| Ok::<_, anyhow::Error>(PeerId::try_from(raw)?))
            .collect()
    }

    pub fn session_keys(&self) -> anyhow::Result<Vec<(PeerId, SessionKey)>> {
        self.controller
            .session_keys
            .iter()
            .map(|entry| {
                let peer = PeerId::try_from(entry.peer)?;
                let key = decode_key(&entry.key)
                    .with_context(|| format!("session key for peer {peer}"))?;
                Ok::<_, anyhow::Error>((peer, SessionKey::from_bytes(key)))
            })
            .collect()
    }

    /// Resolve everything fallible once, at startup.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.node_id()?;
        self.link_address()?;
        self.shared_secret()?;
        if self.tick_interval_ms == 0 {
            bail!("tick_interval_ms must be positive");
        }
        match self.role {
            Role::Actor => {
                self.actor_session_key()?;
            }
            Role::Controller => {
                self.actor_ids()?;
                self.session_keys()?;
            }
        }
        Ok(())
    }
}

fn decode_key(s: &str) -> anyhow::Result<[u8; KEY_LEN]> {
    let bytes = hex::decode(s)?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("expected {KEY_LEN} bytes, got {len}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX_SECRET: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    #[test]
    fn empty_file_gives_defaults() {
        let c: Config = toml::from_str("").unwrap();
        assert_eq!(c.role, Role::Actor);
        assert_eq!(c.node_id, 1);
        assert_eq!(c.port, 45690);
        assert_eq!(c.tick_interval_ms, 100);
        assert_eq!(c.protocol, ProtocolConfig::default());
        assert_eq!(c.controller.actor_ids, (1..=9).collect::<Vec<u8>>());
        assert_eq!(c.link_address().unwrap(), LinkAddress([2, 0, 0, 0, 0, 1]));
    }

    #[test]
    fn full_controller_file() {
        let c: Config = toml::from_str(&format!(
            r#"
            role = "controller"
            node_id = 0
            link_address = "24:0a:c4:00:00:10"
            shared_secret = "{HEX_SECRET}"
            port = 50000

            [protocol]
            beacon_interval_ms = 1000
            require_authenticated_peers = true

            [controller]
            actor_ids = [3, 4]

            [[controller.session_keys]]
            peer = 3
            key = "{HEX_SECRET}"
            "#
        ))
        .unwrap();
        c.validate().unwrap();
        assert_eq!(c.role, Role::Controller);
        assert_eq!(c.node_id().unwrap().get(), 0);
        assert_eq!(c.protocol.beacon_interval_ms, 1000);
        assert_eq!(c.protocol.discovery_timeout_ms, 5000);
        assert!(c.protocol.require_authenticated_peers);
        let ids: Vec<u8> = c.actor_ids().unwrap().iter().map(|p| p.get()).collect();
        assert_eq!(ids, vec![3, 4]);
        let keys = c.session_keys().unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].0.get(), 3);
        assert_eq!(keys[0].1.as_bytes()[31], 0x1f);
    }

    #[test]
    fn unknown_key_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128").is_err());
        assert!(toml::from_str::<Config>("[protocol]\nretries = 3").is_err());
    }

    #[test]
    fn secret_formats() {
        let mut c = Config::default();
        assert!(c.shared_secret().is_err());
        c.shared_secret = Some("0123456789ABCDEF0123456789ABCDEF".into());
        assert!(c.shared_secret().is_ok());
        c.shared_secret = Some(HEX_SECRET.into());
        assert!(c.shared_secret().is_ok());
        c.shared_secret = Some("too short".into());
        assert!(c.shared_secret().is_err());
    }

    #[test]
    fn env_overrides_file() {
        let mut c = Config::default();
        c.apply_env(|key| match key {
            "RELAYCTL_NODE_ID" => Some("4".into()),
            "RELAYCTL_PORT" => Some("46000".into()),
            "RELAYCTL_SHARED_SECRET" => Some(HEX_SECRET.into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(c.node_id, 4);
        assert_eq!(c.port, 46000);
        c.validate().unwrap();
    }

    #[test]
    fn bad_values_fail_validation() {
        let mut c = Config::default();
        assert!(c.apply_env(|_| Some("x".into())).is_err());

        let mut c = Config {
            shared_secret: Some(HEX_SECRET.into()),
            node_id: 12,
            ..Config::default()
        };
        assert!(c.validate().is_err());
        c.node_id = 2;
        c.link_address = Some("not-a-mac".into());
        assert!(c.validate().is_err());
        c.link_address = None;
        c.actor.session_key = Some("abcd".into());
        assert!(c.validate().is_err());
    }
}
