//! Actor role: owns one relay, announces itself, obeys authenticated commands.
//!
//! Host-driven: the host calls [`Actor::on_tick`] periodically and
//! [`Actor::on_frame_received`] for every inbound datagram. Replies go out
//! through the injected [`Transport`]. Nothing here blocks.

use std::time::Instant;

use tracing::{debug, info, trace, warn};

use crate::config::ProtocolConfig;
use crate::nonce::NonceRegistry;
use crate::protocol::{Challenge, Message, MessageHeader, MsgType, PeerId, Tag, Target};
use crate::security::{Security, SessionKey};
use crate::transport::{LinkAddress, Transport};
use crate::wire;

/// Whether the actor may currently announce itself (an enable switch on real hardware).
pub trait EnableInput {
    fn is_enabled(&mut self) -> bool;
}

impl<F: FnMut() -> bool> EnableInput for F {
    fn is_enabled(&mut self) -> bool {
        self()
    }
}

/// Enable input for boards without an enable switch.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysEnabled;

impl EnableInput for AlwaysEnabled {
    fn is_enabled(&mut self) -> bool {
        true
    }
}

/// Firmware-update collaborator. Called once when OTA preparation is committed;
/// it takes the radio down and joins whatever network serves the image.
pub trait UpdateManager {
    fn enter_update_mode(&mut self) -> Result<(), UpdateError>;
}

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("no update manager configured")]
    Unavailable,
    #[error("failed to enter update mode: {0}")]
    Failed(String),
}

/// Default update manager: refuses, which parks the actor in `Error` until the OTA timeout.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoUpdateManager;

impl UpdateManager for NoUpdateManager {
    fn enter_update_mode(&mut self) -> Result<(), UpdateError> {
        Err(UpdateError::Unavailable)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorState {
    /// Normal radio duty.
    Idle,
    /// Valid OtaPrepare received and acknowledged; handoff happens on the next tick.
    OtaPreparing,
    /// Handed off to the update manager.
    OtaActive,
    /// Handoff failed. Cleared by the OTA timeout.
    Error,
}

pub struct Actor<T: Transport> {
    id: PeerId,
    security: Security,
    nonces: NonceRegistry,
    transport: T,
    enable: Box<dyn EnableInput>,
    updater: Box<dyn UpdateManager>,
    config: ProtocolConfig,
    state: ActorState,
    relay_state: bool,
    booted_at: Instant,
    last_beacon: Option<Instant>,
    ota_since: Option<Instant>,
}

impl<T: Transport> Actor<T> {
    /// Relay starts OFF. `booted_at` anchors the uptime carried in headers.
    pub fn new(
        id: PeerId,
        security: Security,
        transport: T,
        config: ProtocolConfig,
        booted_at: Instant,
    ) -> Self {
        Self {
            id,
            security,
            nonces: NonceRegistry::new(config.nonce_ttl()),
            transport,
            enable: Box::new(AlwaysEnabled),
            updater: Box::new(NoUpdateManager),
            config,
            state: ActorState::Idle,
            relay_state: false,
            booted_at,
            last_beacon: None,
            ota_since: None,
        }
    }

    pub fn with_enable_input(mut self, enable: impl EnableInput + 'static) -> Self {
        self.enable = Box::new(enable);
        self
    }

    pub fn with_update_manager(mut self, updater: impl UpdateManager + 'static) -> Self {
        self.updater = Box::new(updater);
        self
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn current_state(&self) -> ActorState {
        self.state
    }

    pub fn relay_state(&self) -> bool {
        self.relay_state
    }

    /// Local override (a physical button, a host command). Not announced until the next beacon.
    pub fn set_relay(&mut self, on: bool) {
        if self.relay_state != on {
            info!(actor = %self.id, relay = on, "relay set locally");
        }
        self.relay_state = on;
    }

    pub fn session_key(&self) -> &SessionKey {
        self.security.session_key()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Periodic tick: OTA timeout, update-mode handoff, beacon.
    pub fn on_tick(&mut self, now: Instant) {
        if let Some(since) = self.ota_since {
            if now.saturating_duration_since(since) > self.config.ota_timeout() {
                info!(actor = %self.id, from = ?self.state, "OTA timeout, back to idle");
                self.state = ActorState::Idle;
                self.ota_since = None;
            }
        }

        match self.state {
            ActorState::Idle => self.maybe_beacon(now),
            ActorState::OtaPreparing => match self.updater.enter_update_mode() {
                Ok(()) => {
                    info!(actor = %self.id, "entered firmware update mode");
                    self.state = ActorState::OtaActive;
                }
                Err(e) => {
                    warn!(actor = %self.id, error = %e, "update mode handoff failed");
                    self.state = ActorState::Error;
                }
            },
            ActorState::OtaActive | ActorState::Error => {}
        }
    }

    fn maybe_beacon(&mut self, now: Instant) {
        if !self.enable.is_enabled() {
            return;
        }
        let due = self.last_beacon.map_or(true, |t| {
            now.saturating_duration_since(t) >= self.config.beacon_interval()
        });
        if !due {
            return;
        }
        self.last_beacon = Some(now);
        let msg = Message::Beacon {
            header: self.header(MsgType::Beacon, Target::All, now),
            sender_id: self.id.get(),
            relay_state: self.relay_state,
            signal_quality: self.transport.signal_quality(),
        };
        match wire::encode_frame(&msg) {
            Ok(frame) => {
                let sent = self.transport.send_broadcast(&frame);
                trace!(actor = %self.id, relay = self.relay_state, sent, "beacon");
            }
            Err(e) => warn!(error = %e, "failed to encode beacon"),
        }
    }

    /// Handle one inbound datagram. Malformed, misaddressed, replayed and
    /// unauthenticated frames are all dropped silently.
    pub fn on_frame_received(&mut self, from: LinkAddress, bytes: &[u8], now: Instant) {
        let msg = match wire::decode_frame(bytes) {
            Ok(m) => m,
            Err(e) => {
                trace!(%from, error = %e, "dropping malformed frame");
                return;
            }
        };
        let header = *msg.header();
        if !header.is_addressed_to(self.id) {
            return;
        }
        let Some(sender) = header.sender() else {
            trace!(%from, sender = header.sender, "dropping frame with invalid sender id");
            return;
        };
        if !matches!(self.state, ActorState::Idle | ActorState::OtaPreparing) {
            trace!(%from, state = ?self.state, "radio duty suspended, dropping frame");
            return;
        }

        match msg {
            Message::RelayToggle { tag, .. } => {
                self.handle_relay_toggle(from, sender, &header, &tag, now)
            }
            Message::OtaPrepare { tag, .. } => {
                self.handle_ota_prepare(from, sender, &header, &tag, now)
            }
            Message::OtaAbort { .. } => self.handle_ota_abort(sender, &header, now),
            Message::Challenge { challenge, .. } => {
                self.handle_challenge(from, sender, &challenge, now)
            }
            Message::Ping { .. } => {
                let pong = Message::Pong {
                    header: self.header(MsgType::Pong, Target::Peer(sender), now),
                };
                self.reply(from, &pong);
            }
            _ => {}
        }
    }

    /// Tag first, then nonce: unauthenticated frames never occupy replay-cache slots.
    fn accept_command(
        &mut self,
        sender: PeerId,
        header: &MessageHeader,
        tag: &Tag,
        now: Instant,
    ) -> bool {
        if !self.security.verify_command(header, tag) {
            debug!(actor = %self.id, %sender, "bad command tag");
            return false;
        }
        if !self.nonces.record_if_new(sender, header.nonce, now) {
            debug!(actor = %self.id, %sender, nonce = header.nonce, "replayed command");
            return false;
        }
        true
    }

    fn handle_relay_toggle(
        &mut self,
        from: LinkAddress,
        sender: PeerId,
        header: &MessageHeader,
        tag: &Tag,
        now: Instant,
    ) {
        if self.state != ActorState::Idle {
            return;
        }
        if !self.accept_command(sender, header, tag, now) {
            return;
        }
        self.relay_state = !self.relay_state;
        info!(actor = %self.id, controller = %sender, relay = self.relay_state, "relay toggled");
        let reply = Message::RelayState {
            header: self.header(MsgType::RelayState, Target::Peer(sender), now),
            relay_state: self.relay_state,
        };
        self.reply(from, &reply);
    }

    fn handle_ota_prepare(
        &mut self,
        from: LinkAddress,
        sender: PeerId,
        header: &MessageHeader,
        tag: &Tag,
        now: Instant,
    ) {
        if !self.accept_command(sender, header, tag, now) {
            return;
        }
        let ack = Message::OtaAck {
            header: self.header(MsgType::OtaAck, Target::Peer(sender), now),
        };
        self.reply(from, &ack);
        // A repeated prepare while already preparing is re-acknowledged only.
        if self.state == ActorState::Idle {
            info!(actor = %self.id, controller = %sender, "OTA prepare accepted");
            self.state = ActorState::OtaPreparing;
            self.ota_since = Some(now);
        }
    }

    fn handle_ota_abort(&mut self, sender: PeerId, header: &MessageHeader, now: Instant) {
        if self.state != ActorState::OtaPreparing {
            return;
        }
        if !self.nonces.record_if_new(sender, header.nonce, now) {
            return;
        }
        info!(actor = %self.id, controller = %sender, "OTA aborted");
        self.state = ActorState::Idle;
        self.ota_since = None;
    }

    fn handle_challenge(
        &mut self,
        from: LinkAddress,
        sender: PeerId,
        challenge: &Challenge,
        now: Instant,
    ) {
        let response = self.security.respond_to_challenge(challenge);
        let msg = Message::Response {
            header: self.header(MsgType::Response, Target::Peer(sender), now),
            response,
        };
        debug!(actor = %self.id, controller = %sender, "answering challenge");
        self.reply(from, &msg);
    }

    fn header(&self, msg_type: MsgType, target: Target, now: Instant) -> MessageHeader {
        MessageHeader::new(
            msg_type,
            self.id,
            target,
            uptime_ms(self.booted_at, now),
            self.security.generate_nonce(),
        )
    }

    fn reply(&mut self, to: LinkAddress, msg: &Message) -> bool {
        match wire::encode_frame(msg) {
            Ok(frame) => self.transport.send_unicast(&to, &frame),
            Err(e) => {
                warn!(error = %e, "failed to encode reply");
                false
            }
        }
    }
}

/// Wrapping 32-bit millisecond uptime, like a microcontroller tick counter.
pub(crate) fn uptime_ms(booted_at: Instant, now: Instant) -> u32 {
    now.saturating_duration_since(booted_at).as_millis() as u32
}
