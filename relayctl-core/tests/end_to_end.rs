//! Actor and controller engines wired together over an in-memory radio.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use relayctl_core::{
    decode_frame, encode_frame, Actor, ActorState, Controller, ControllerState, LinkAddress,
    Message, MessageHeader, MsgType, OtaReadiness, PeerId, ProtocolConfig, Security, SharedSecret,
    Target, Transport, UpdateError, UpdateManager,
};

const SECRET: [u8; 32] = *b"relayctl-e2e-shared-secret-32byt";
const CONTROLLER_ADDR: LinkAddress = LinkAddress([0x24, 0x0A, 0xC4, 0, 0, 0x10]);

/// (destination, frame); `None` is broadcast.
type Air = Rc<RefCell<Vec<(Option<LinkAddress>, Vec<u8>)>>>;

struct Radio {
    air: Air,
}

impl Transport for Radio {
    fn send_broadcast(&mut self, frame: &[u8]) -> bool {
        self.air.borrow_mut().push((None, frame.to_vec()));
        true
    }

    fn send_unicast(&mut self, to: &LinkAddress, frame: &[u8]) -> bool {
        self.air.borrow_mut().push((Some(*to), frame.to_vec()));
        true
    }
}

struct ReadyUpdater;

impl UpdateManager for ReadyUpdater {
    fn enter_update_mode(&mut self) -> Result<(), UpdateError> {
        Ok(())
    }
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn id(n: u8) -> PeerId {
    PeerId::new(n).unwrap()
}

fn actor_addr(n: u8) -> LinkAddress {
    LinkAddress([0x24, 0x0A, 0xC4, 0, 0, n])
}

fn security() -> Security {
    Security::new(SharedSecret::from_bytes(SECRET))
}

fn actor(n: u8, t0: Instant) -> (Actor<Radio>, Air) {
    let air = Air::default();
    let actor = Actor::new(
        id(n),
        security(),
        Radio { air: air.clone() },
        ProtocolConfig::default(),
        t0,
    )
    .with_update_manager(ReadyUpdater);
    (actor, air)
}

fn controller(actors: &[u8], t0: Instant) -> (Controller<Radio>, Air) {
    let air = Air::default();
    let controller = Controller::new(
        id(0),
        security(),
        Radio { air: air.clone() },
        ProtocolConfig::default(),
        actors.iter().map(|&n| id(n)),
        t0,
    );
    (controller, air)
}

fn drain(air: &Air) -> Vec<(Option<LinkAddress>, Vec<u8>)> {
    std::mem::take(&mut *air.borrow_mut())
}

/// Deliver an actor's beacon to the controller.
fn discover(a: &mut Actor<Radio>, a_air: &Air, c: &mut Controller<Radio>, now: Instant) {
    a.on_tick(now);
    for (to, frame) in drain(a_air) {
        assert_eq!(to, None);
        c.on_frame_received(actor_addr(a.id().get()), &frame, now);
    }
}

#[test]
fn toggle_round_trip_and_replay_rejected() {
    init_logging();
    let t0 = Instant::now();
    let (mut a, a_air) = actor(3, t0);
    let (mut c, c_air) = controller(&[3], t0);
    discover(&mut a, &a_air, &mut c, t0);
    assert_eq!(c.registry().len(), 1);

    assert!(c.request_relay_toggle(id(3), t0).unwrap());
    let sent = drain(&c_air);
    assert_eq!(sent.len(), 1);
    let (to, toggle) = &sent[0];
    assert_eq!(*to, Some(actor_addr(3)));

    a.on_frame_received(CONTROLLER_ADDR, toggle, t0);
    assert!(a.relay_state());
    let replies = drain(&a_air);
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].0, Some(CONTROLLER_ADDR));
    match decode_frame(&replies[0].1).unwrap() {
        Message::RelayState { relay_state, .. } => assert!(relay_state),
        other => panic!("expected relay state, got {other:?}"),
    }
    c.on_frame_received(actor_addr(3), &replies[0].1, t0);
    assert!(c.registry().find(id(3)).unwrap().relay_state);

    // Identical bytes again: no toggle, no reply.
    a.on_frame_received(CONTROLLER_ADDR, toggle, t0 + Duration::from_millis(100));
    assert!(a.relay_state());
    assert!(drain(&a_air).is_empty());
}

#[test]
fn ota_coordination_with_two_actors_then_timeout() {
    init_logging();
    let t0 = Instant::now();
    let (mut a1, a1_air) = actor(1, t0);
    let (mut a2, a2_air) = actor(2, t0);
    let (mut c, c_air) = controller(&[1, 2], t0);
    discover(&mut a1, &a1_air, &mut c, t0);
    discover(&mut a2, &a2_air, &mut c, t0);

    assert_eq!(c.request_ota_broadcast(t0).unwrap(), 2);
    for (to, frame) in drain(&c_air) {
        match to {
            Some(addr) if addr == actor_addr(1) => {
                a1.on_frame_received(CONTROLLER_ADDR, &frame, t0)
            }
            Some(addr) if addr == actor_addr(2) => {
                a2.on_frame_received(CONTROLLER_ADDR, &frame, t0)
            }
            other => panic!("unexpected destination {other:?}"),
        }
    }
    assert_eq!(a1.current_state(), ActorState::OtaPreparing);
    assert_eq!(a2.current_state(), ActorState::OtaPreparing);

    for (n, air) in [(1u8, &a1_air), (2u8, &a2_air)] {
        for (_, frame) in drain(air) {
            assert!(matches!(decode_frame(&frame).unwrap(), Message::OtaAck { .. }));
            c.on_frame_received(actor_addr(n), &frame, t0);
        }
    }
    assert!(c.registry().iter().all(|p| p.ota == OtaReadiness::Ready));

    a1.on_tick(t0 + Duration::from_millis(50));
    assert_eq!(a1.current_state(), ActorState::OtaActive);

    let later = t0 + Duration::from_secs(301);
    c.on_tick(later);
    assert_eq!(c.current_state(), ControllerState::Idle);
    a1.on_tick(later);
    assert_eq!(a1.current_state(), ActorState::Idle);
}

#[test]
fn spoofed_relay_state_ignored() {
    init_logging();
    let t0 = Instant::now();
    let (mut a, a_air) = actor(4, t0);
    let (mut c, _c_air) = controller(&[4], t0);
    discover(&mut a, &a_air, &mut c, t0);

    let forged = encode_frame(&Message::RelayState {
        header: MessageHeader::new(MsgType::RelayState, id(4), Target::Peer(id(0)), 0, 42),
        relay_state: true,
    })
    .unwrap();
    c.on_frame_received(LinkAddress([0xDE, 0xAD, 0xBE, 0xEF, 0, 1]), &forged, t0);
    assert!(!c.registry().find(id(4)).unwrap().relay_state);
}

#[test]
fn challenge_response_authenticates_provisioned_actor() {
    init_logging();
    let t0 = Instant::now();
    let (mut a, a_air) = actor(5, t0);
    let (mut c, c_air) = controller(&[5], t0);
    c.provision_session_key(id(5), a.session_key().clone());
    discover(&mut a, &a_air, &mut c, t0);

    let challenge = drain(&c_air);
    assert_eq!(challenge.len(), 1);
    a.on_frame_received(CONTROLLER_ADDR, &challenge[0].1, t0);
    for (_, frame) in drain(&a_air) {
        c.on_frame_received(actor_addr(5), &frame, t0);
    }
    assert!(c.registry().find(id(5)).unwrap().is_authenticated());
}

#[test]
fn actor_ignores_frames_for_other_ids() {
    init_logging();
    let t0 = Instant::now();
    let (mut a, a_air) = actor(6, t0);
    let header = MessageHeader::new(MsgType::RelayToggle, id(0), Target::Peer(id(7)), 0, 1);
    let tag = security().authenticate_command(&header);
    let frame = encode_frame(&Message::RelayToggle { header, tag }).unwrap();
    a.on_frame_received(CONTROLLER_ADDR, &frame, t0);
    assert!(!a.relay_state());
    assert!(drain(&a_air).is_empty());
}

#[test]
fn ota_abort_returns_actor_to_idle() {
    init_logging();
    let t0 = Instant::now();
    let (mut a, a_air) = actor(7, t0);
    let (mut c, c_air) = controller(&[7], t0);
    discover(&mut a, &a_air, &mut c, t0);

    c.request_ota_broadcast(t0).unwrap();
    for (_, frame) in drain(&c_air) {
        a.on_frame_received(CONTROLLER_ADDR, &frame, t0);
    }
    assert_eq!(a.current_state(), ActorState::OtaPreparing);

    c.request_ota_abort(t0).unwrap();
    for (_, frame) in drain(&c_air) {
        a.on_frame_received(CONTROLLER_ADDR, &frame, t0);
    }
    assert_eq!(a.current_state(), ActorState::Idle);
    assert_eq!(c.current_state(), ControllerState::Idle);
}

#[test]
fn controller_ignores_unconfigured_actor() {
    init_logging();
    let t0 = Instant::now();
    let (mut a, a_air) = actor(8, t0);
    let (mut c, _c_air) = controller(&[1, 2], t0);
    discover(&mut a, &a_air, &mut c, t0);
    assert!(c.registry().is_empty());
}
