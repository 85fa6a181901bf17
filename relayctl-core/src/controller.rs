//! Controller role: discovers actors and issues authenticated commands to them.
//!
//! Status reports coming back (RelayState, OtaAck, Pong) carry no tag, so they
//! are only trusted as telemetry: they must come from the link address the
//! peer beaconed from and must not replay a recent nonce.

use std::collections::HashMap;
use std::time::Instant;

use tracing::{debug, info, trace, warn};

use crate::actor::uptime_ms;
use crate::config::ProtocolConfig;
use crate::discovery::{DiscoveryRegistry, OtaReadiness, RegistryError, Upsert};
use crate::nonce::NonceRegistry;
use crate::protocol::{Challenge, Message, MessageHeader, MsgType, PeerId, Tag, Target};
use crate::security::{Security, SessionKey};
use crate::transport::{LinkAddress, Transport};
use crate::wire::{self, FrameEncodeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    /// OtaPrepare sent to the discovered peers at `since`.
    OtaRequested { since: Instant },
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("peer {0} has not been discovered")]
    UnknownPeer(PeerId),
    #[error("firmware update in progress")]
    OtaInProgress,
    #[error("peer {0} has not proven its identity")]
    NotAuthenticated(PeerId),
    #[error(transparent)]
    Encode(#[from] FrameEncodeError),
}

#[derive(Debug)]
struct PendingChallenge {
    peer: PeerId,
    challenge: Challenge,
    issued_at: Instant,
}

pub struct Controller<T: Transport> {
    id: PeerId,
    security: Security,
    nonces: NonceRegistry,
    registry: DiscoveryRegistry,
    transport: T,
    config: ProtocolConfig,
    actor_ids: Vec<PeerId>,
    session_keys: HashMap<PeerId, SessionKey>,
    challenges: Vec<PendingChallenge>,
    state: ControllerState,
    booted_at: Instant,
}

impl<T: Transport> Controller<T> {
    /// Beacons are only accepted from `actor_ids`.
    pub fn new(
        id: PeerId,
        security: Security,
        transport: T,
        config: ProtocolConfig,
        actor_ids: impl IntoIterator<Item = PeerId>,
        booted_at: Instant,
    ) -> Self {
        Self {
            id,
            security,
            nonces: NonceRegistry::new(config.nonce_ttl()),
            registry: DiscoveryRegistry::new(config.discovery_timeout()),
            transport,
            actor_ids: actor_ids.into_iter().collect(),
            session_keys: HashMap::new(),
            challenges: Vec::new(),
            state: ControllerState::Idle,
            config,
            booted_at,
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn current_state(&self) -> ControllerState {
        self.state
    }

    pub fn registry(&self) -> &DiscoveryRegistry {
        &self.registry
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Install the session key an actor exported out of band. Needed before its
    /// challenge response can be verified.
    pub fn provision_session_key(&mut self, peer: PeerId, key: SessionKey) {
        self.session_keys.insert(peer, key);
    }

    pub fn on_tick(&mut self, now: Instant) {
        for id in self.registry.expire_stale(now) {
            info!(peer = %id, "peer lost");
            self.challenges.retain(|c| c.peer != id);
        }

        let challenge_timeout = self.config.challenge_timeout();
        self.challenges.retain(|c| {
            let live = now.saturating_duration_since(c.issued_at) <= challenge_timeout;
            if !live {
                debug!(peer = %c.peer, "challenge expired unanswered");
            }
            live
        });

        if let ControllerState::OtaRequested { since } = self.state {
            if now.saturating_duration_since(since) > self.config.ota_timeout() {
                info!("OTA coordination timed out, back to idle");
                self.state = ControllerState::Idle;
                self.registry.reset_ota();
            }
        }
    }

    /// Handle one inbound datagram. Anything invalid is dropped without a reply.
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

        match msg {
            Message::Beacon {
                sender_id,
                relay_state,
                signal_quality,
                ..
            } => self.handle_beacon(from, sender, sender_id, relay_state, signal_quality, now),
            Message::RelayState { relay_state, .. } => {
                if self.accept_report(from, sender, &header, now) {
                    self.registry.update_relay_state(sender, relay_state, now);
                    debug!(peer = %sender, relay = relay_state, "relay state report");
                }
            }
            Message::OtaAck { .. } => self.handle_ota_ack(from, sender, &header, now),
            Message::Response { response, .. } => self.handle_response(from, sender, &response),
            Message::Ping { .. } => {
                let pong = Message::Pong {
                    header: self.header(MsgType::Pong, Target::Peer(sender), now),
                };
                if let Ok(frame) = wire::encode_frame(&pong) {
                    self.transport.send_unicast(&from, &frame);
                }
            }
            Message::Pong { .. } => {
                if self.accept_report(from, sender, &header, now) {
                    self.registry.touch(sender, now);
                }
            }
            _ => {}
        }
    }

    fn handle_beacon(
        &mut self,
        from: LinkAddress,
        sender: PeerId,
        sender_id: u8,
        relay_state: bool,
        signal_quality: i8,
        now: Instant,
    ) {
        if sender_id != sender.get() || !self.actor_ids.contains(&sender) {
            trace!(%from, %sender, sender_id, "ignoring beacon from unconfigured actor");
            return;
        }
        match self
            .registry
            .register_or_update(sender, from, relay_state, signal_quality, now)
        {
            Ok(Upsert::Inserted) => {
                info!(peer = %sender, address = %from, relay = relay_state, "peer discovered");
                if self.session_keys.contains_key(&sender) {
                    if let Err(e) = self.request_authentication(sender, now) {
                        warn!(peer = %sender, error = %e, "failed to challenge new peer");
                    }
                }
            }
            Ok(Upsert::Updated) => trace!(peer = %sender, "beacon"),
            Ok(Upsert::Moved) => {
                warn!(peer = %sender, address = %from, "peer moved, identity unverified");
                self.challenges.retain(|c| c.peer != sender);
                if self.session_keys.contains_key(&sender) {
                    if let Err(e) = self.request_authentication(sender, now) {
                        warn!(peer = %sender, error = %e, "failed to challenge moved peer");
                    }
                }
            }
            Err(RegistryError::Full(n)) => {
                warn!(peer = %sender, capacity = n, "discovery registry full, beacon ignored")
            }
        }
    }

    /// Untagged report: known peer, recorded address, fresh nonce.
    fn accept_report(
        &mut self,
        from: LinkAddress,
        sender: PeerId,
        header: &MessageHeader,
        now: Instant,
    ) -> bool {
        match self.registry.find(sender) {
            Some(peer) if peer.link_address == from => {}
            Some(_) => {
                debug!(peer = %sender, %from, "report from unexpected address");
                return false;
            }
            None => {
                trace!(peer = %sender, "report from unknown peer");
                return false;
            }
        }
        if !self.nonces.record_if_new(sender, header.nonce, now) {
            debug!(peer = %sender, nonce = header.nonce, "replayed report");
            return false;
        }
        true
    }

    fn handle_ota_ack(
        &mut self,
        from: LinkAddress,
        sender: PeerId,
        header: &MessageHeader,
        now: Instant,
    ) {
        if !matches!(self.state, ControllerState::OtaRequested { .. }) {
            return;
        }
        let requested = self
            .registry
            .find(sender)
            .is_some_and(|p| p.ota == OtaReadiness::Requested);
        if !requested || !self.accept_report(from, sender, header, now) {
            return;
        }
        self.registry.set_ota(sender, OtaReadiness::Ready);
        self.registry.touch(sender, now);
        info!(peer = %sender, "peer ready for update");
    }

    fn handle_response(&mut self, from: LinkAddress, sender: PeerId, response: &Tag) {
        let Some(pos) = self.challenges.iter().position(|c| c.peer == sender) else {
            trace!(peer = %sender, "unsolicited challenge response");
            return;
        };
        let known_address = self
            .registry
            .find(sender)
            .is_some_and(|p| p.link_address == from);
        if !known_address {
            return;
        }
        let pending = self.challenges.swap_remove(pos);
        let Some(key) = self.session_keys.get(&sender) else {
            debug!(peer = %sender, "no session key provisioned, identity stays unverified");
            return;
        };
        if self
            .security
            .verify_response(&pending.challenge, response, key)
        {
            let key = key.clone();
            self.registry.mark_authenticated(sender, key);
            info!(peer = %sender, "peer authenticated");
        } else {
            warn!(peer = %sender, "challenge response did not verify");
        }
    }

    /// Send a fresh challenge to a discovered peer, replacing any outstanding one.
    pub fn request_authentication(
        &mut self,
        peer: PeerId,
        now: Instant,
    ) -> Result<bool, CommandError> {
        let to = self
            .registry
            .find(peer)
            .map(|p| p.link_address)
            .ok_or(CommandError::UnknownPeer(peer))?;
        let challenge = self.security.issue_challenge();
        let msg = Message::Challenge {
            header: self.header(MsgType::Challenge, Target::Peer(peer), now),
            challenge,
        };
        let frame = wire::encode_frame(&msg)?;
        self.challenges.retain(|c| c.peer != peer);
        self.challenges.push(PendingChallenge {
            peer,
            challenge,
            issued_at: now,
        });
        debug!(%peer, "challenge sent");
        Ok(self.transport.send_unicast(&to, &frame))
    }

    /// Ask one peer to flip its relay. `Ok(false)` means the radio refused the frame.
    pub fn request_relay_toggle(
        &mut self,
        peer: PeerId,
        now: Instant,
    ) -> Result<bool, CommandError> {
        if matches!(self.state, ControllerState::OtaRequested { .. }) {
            return Err(CommandError::OtaInProgress);
        }
        let found = self
            .registry
            .find(peer)
            .ok_or(CommandError::UnknownPeer(peer))?;
        if self.config.require_authenticated_peers && !found.is_authenticated() {
            return Err(CommandError::NotAuthenticated(peer));
        }
        let to = found.link_address;
        let header = self.header(MsgType::RelayToggle, Target::Peer(peer), now);
        let tag = self.security.authenticate_command(&header);
        let frame = wire::encode_frame(&Message::RelayToggle { header, tag })?;
        let sent = self.transport.send_unicast(&to, &frame);
        info!(%peer, sent, "relay toggle sent");
        Ok(sent)
    }

    /// Send OtaPrepare to every discovered peer and enter `OtaRequested`.
    /// Re-issuing keeps the original start time. Returns how many sends succeeded.
    pub fn request_ota_broadcast(&mut self, now: Instant) -> Result<usize, CommandError> {
        let targets: Vec<(PeerId, LinkAddress)> = self
            .registry
            .iter()
            .map(|p| (p.id, p.link_address))
            .collect();
        let mut delivered = 0;
        for (peer, to) in targets {
            let header = self.header(MsgType::OtaPrepare, Target::Peer(peer), now);
            let tag = self.security.authenticate_command(&header);
            let frame = wire::encode_frame(&Message::OtaPrepare { header, tag })?;
            if self.transport.send_unicast(&to, &frame) {
                delivered += 1;
            }
            self.registry.set_ota(peer, OtaReadiness::Requested);
        }
        if self.state == ControllerState::Idle {
            self.state = ControllerState::OtaRequested { since: now };
        }
        info!(peers = self.registry.len(), delivered, "OTA prepare broadcast");
        Ok(delivered)
    }

    /// Tell every discovered peer to abandon OTA preparation and return to `Idle`.
    pub fn request_ota_abort(&mut self, now: Instant) -> Result<usize, CommandError> {
        let targets: Vec<(PeerId, LinkAddress)> = self
            .registry
            .iter()
            .map(|p| (p.id, p.link_address))
            .collect();
        let mut delivered = 0;
        for (peer, to) in targets {
            let msg = Message::OtaAbort {
                header: self.header(MsgType::OtaAbort, Target::Peer(peer), now),
            };
            let frame = wire::encode_frame(&msg)?;
            if self.transport.send_unicast(&to, &frame) {
                delivered += 1;
            }
        }
        self.state = ControllerState::Idle;
        self.registry.reset_ota();
        info!(delivered, "OTA aborted");
        Ok(delivered)
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
}
