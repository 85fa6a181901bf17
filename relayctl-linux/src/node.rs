//! Node runtime: drives one protocol engine from the socket, a tick timer and stdin.

use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use relayctl_core::{
    Actor, ActorState, Controller, ControllerState, EnableInput, LinkAddress, PeerAuth, PeerId,
    Security, UpdateError, UpdateManager,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::config::{Config, Role};
use crate::link::{self, UdpLink, MAX_DATAGRAM_LEN};

/// Beacons follow the presence of a file (a stand-in for a hardware enable switch).
struct FileEnable(PathBuf);

impl EnableInput for FileEnable {
    fn is_enabled(&mut self) -> bool {
        self.0.exists()
    }
}

/// Hands the update off to a shell command. Success means the command started.
struct CommandUpdater(String);

impl UpdateManager for CommandUpdater {
    fn enter_update_mode(&mut self) -> Result<(), UpdateError> {
        tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.0)
            .spawn()
            .map(|child| info!(pid = ?child.id(), command = %self.0, "update command started"))
            .map_err(|e| UpdateError::Failed(e.to_string()))
    }
}

enum Engine {
    Actor(Actor<UdpLink>),
    Controller(Controller<UdpLink>),
}

impl Engine {
    fn build(cfg: &Config, link: UdpLink, booted_at: Instant) -> anyhow::Result<Self> {
        let id = cfg.node_id()?;
        let secret = cfg.shared_secret()?;
        Ok(match cfg.role {
            Role::Actor => {
                let security = match cfg.actor_session_key()? {
                    Some(key) => Security::with_session_key(secret, key),
                    None => Security::new(secret),
                };
                let mut actor = Actor::new(id, security, link, cfg.protocol.clone(), booted_at);
                if let Some(path) = &cfg.actor.enable_file {
                    actor = actor.with_enable_input(FileEnable(path.clone()));
                }
                if let Some(cmd) = &cfg.actor.update_command {
                    actor = actor.with_update_manager(CommandUpdater(cmd.clone()));
                }
                Engine::Actor(actor)
            }
            Role::Controller => {
                let mut controller = Controller::new(
                    id,
                    Security::new(secret),
                    link,
                    cfg.protocol.clone(),
                    cfg.actor_ids()?,
                    booted_at,
                );
                for (peer, key) in cfg.session_keys()? {
                    controller.provision_session_key(peer, key);
                }
                Engine::Controller(controller)
            }
        })
    }

    fn on_tick(&mut self, now: Instant) {
        match self {
            Engine::Actor(a) => a.on_tick(now),
            Engine::Controller(c) => c.on_tick(now),
        }
    }

    fn on_frame(&mut self, from: LinkAddress, frame: &[u8], now: Instant) {
        match self {
            Engine::Actor(a) => a.on_frame_received(from, frame, now),
            Engine::Controller(c) => c.on_frame_received(from, frame, now),
        }
    }

    /// Run one operator command; returns the text to print.
    fn command(&mut self, line: &str, now: Instant) -> String {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return String::new();
        };
        let arg = words.next();
        match self {
            Engine::Actor(a) => actor_command(a, verb, arg),
            Engine::Controller(c) => controller_command(c, verb, arg, now),
        }
    }
}

fn actor_command(a: &mut Actor<UdpLink>, verb: &str, arg: Option<&str>) -> String {
    match (verb, arg) {
        ("relay", Some("on")) => {
            a.set_relay(true);
            "relay on".into()
        }
        ("relay", Some("off")) => {
            a.set_relay(false);
            "relay off".into()
        }
        ("state", None) => format!(
            "actor {} state={} relay={}",
            a.id(),
            actor_state_name(a.current_state()),
            on_off(a.relay_state())
        ),
        ("session-key", None) => hex::encode(a.session_key().as_bytes()),
        ("help", _) => "commands: relay on|off, state, session-key".into(),
        _ => format!("unknown command {verb:?} (try help)"),
    }
}

fn controller_command(
    c: &mut Controller<UdpLink>,
    verb: &str,
    arg: Option<&str>,
    now: Instant,
) -> String {
    let peer = arg.and_then(|s| s.parse::<u8>().ok()).and_then(PeerId::new);
    match (verb, peer) {
        ("toggle", Some(p)) => match c.request_relay_toggle(p, now) {
            Ok(true) => format!("toggle sent to {p}"),
            Ok(false) => format!("toggle to {p} not sent (link busy)"),
            Err(e) => format!("toggle refused: {e}"),
        },
        ("auth", Some(p)) => match c.request_authentication(p, now) {
            Ok(_) => format!("challenge sent to {p}"),
            Err(e) => format!("challenge refused: {e}"),
        },
        ("ota", None) => match c.request_ota_broadcast(now) {
            Ok(n) => format!("OTA prepare sent to {n} of {} peers", c.registry().len()),
            Err(e) => format!("OTA request failed: {e}"),
        },
        ("abort", None) => match c.request_ota_abort(now) {
            Ok(n) => format!("OTA abort sent to {n} peers"),
            Err(e) => format!("OTA abort failed: {e}"),
        },
        ("peers", None) => peer_table(c, now),
        ("state", None) => match c.current_state() {
            ControllerState::Idle => "controller idle".into(),
            ControllerState::OtaRequested { since } => format!(
                "controller OTA requested {}s ago",
                now.saturating_duration_since(since).as_secs()
            ),
        },
        ("help", _) => "commands: toggle <id>, auth <id>, ota, abort, peers, state".into(),
        ("toggle" | "auth", None) => format!("{verb} needs a peer id 0-9"),
        _ => format!("unknown command {verb:?} (try help)"),
    }
}

fn peer_table(c: &Controller<UdpLink>, now: Instant) -> String {
    if c.registry().is_empty() {
        return "no peers".into();
    }
    let mut out = String::from("id  address            relay  rssi  seen   identity    ota");
    for p in c.registry().iter() {
        let identity = match p.auth {
            PeerAuth::Authenticated { .. } => "verified",
            PeerAuth::IdentityUnverified => "unverified",
        };
        let _ = write!(
            out,
            "\n{:<3} {}  {:<5}  {:>4}  {:>4}ms  {:<10}  {:?}",
            p.id,
            p.link_address,
            on_off(p.relay_state),
            p.signal_quality,
            now.saturating_duration_since(p.last_seen).as_millis(),
            identity,
            p.ota,
        );
    }
    out
}

fn actor_state_name(s: ActorState) -> &'static str {
    match s {
        ActorState::Idle => "idle",
        ActorState::OtaPreparing => "ota-preparing",
        ActorState::OtaActive => "ota-active",
        ActorState::Error => "error",
    }
}

fn on_off(b: bool) -> &'static str {
    if b {
        "on"
    } else {
        "off"
    }
}

/// Run the node until Ctrl+C or SIGTERM.
pub async fn run(cfg: Config) -> anyhow::Result<()> {
    let local = cfg.link_address()?;
    let socket = link::make_multicast_socket(cfg.multicast_group, cfg.port)
        .await
        .with_context(|| format!("joining {}:{}", cfg.multicast_group, cfg.port))?;
    let socket = Arc::new(socket);
    let udp_link = UdpLink::new(socket.clone(), cfg.multicast_group, cfg.port, local);
    let mut engine = Engine::build(&cfg, udp_link, Instant::now())?;
    info!(role = ?cfg.role, node = cfg.node_id, address = %local, port = cfg.port, "node started");

    let mut ticker = tokio::time::interval(Duration::from_millis(cfg.tick_interval_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN + 1];
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => engine.on_tick(Instant::now()),
            res = socket.recv_from(&mut buf) => match res {
                Ok((n, _)) => {
                    if let Some((from, frame)) = link::accept_datagram(&local, &buf[..n]) {
                        engine.on_frame(from, frame, Instant::now());
                    }
                }
                Err(e) => warn!(error = %e, "link receive failed"),
            },
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    let out = engine.command(line.trim(), Instant::now());
                    if !out.is_empty() {
                        println!("{out}");
                    }
                }
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!(error = %e, "stdin closed");
                    stdin_open = false;
                }
            },
            res = &mut shutdown => {
                res?;
                info!("shutting down");
                return Ok(());
            }
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_enable_follows_file() {
        let path = std::env::temp_dir().join(format!("relayctl-enable-{}", std::process::id()));
        let mut enable = FileEnable(path.clone());
        assert!(!enable.is_enabled());
        std::fs::write(&path, b"").unwrap();
        assert!(enable.is_enabled());
        std::fs::remove_file(&path).unwrap();
        assert!(!enable.is_enabled());
    }

    #[tokio::test]
    async fn update_handoff_succeeds_once_command_starts() {
        // The exit status is not awaited: a command that fails after starting still counts.
        let mut updater = CommandUpdater("exit 3".into());
        assert!(updater.enter_update_mode().is_ok());
    }

    #[test]
    fn state_names() {
        assert_eq!(actor_state_name(ActorState::OtaPreparing), "ota-preparing");
        assert_eq!(on_off(true), "on");
    }
}
