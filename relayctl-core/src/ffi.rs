//! C ABI for linking relayctl-core as a static library into microcontroller
//! firmware or other C/C++ hosts.
//!
//! The host owns the radio. It registers a send callback plus an opaque context
//! pointer at creation, feeds received frames in through `*_on_frame`, and calls
//! `*_tick` from its main loop. Time comes from the monotonic clock.

use std::cell::Cell;
use std::ffi::c_void;
use std::os::raw::c_int;
use std::rc::Rc;
use std::slice;
use std::time::Instant;

use crate::actor::{Actor, ActorState, UpdateError, UpdateManager};
use crate::config::ProtocolConfig;
use crate::controller::{Controller, ControllerState};
use crate::protocol::PeerId;
use crate::security::{Security, SessionKey, SharedSecret, KEY_LEN};
use crate::transport::{LinkAddress, Transport};
use crate::wire::MAX_FRAME_LEN;

/// Send callback. `addr` points at 6 bytes, or is null for broadcast.
/// Returns true if the radio accepted the frame.
pub type SendFn =
    extern "C" fn(ctx: *mut c_void, addr: *const u8, data: *const u8, len: usize) -> bool;

/// Update-mode callback. Returns true once the device is in update mode.
pub type UpdateFn = extern "C" fn(ctx: *mut c_void) -> bool;

struct CallbackTransport {
    send: SendFn,
    ctx: *mut c_void,
    signal_quality: i8,
}

impl Transport for CallbackTransport {
    fn send_broadcast(&mut self, frame: &[u8]) -> bool {
        (self.send)(self.ctx, std::ptr::null(), frame.as_ptr(), frame.len())
    }

    fn send_unicast(&mut self, to: &LinkAddress, frame: &[u8]) -> bool {
        (self.send)(self.ctx, to.as_bytes().as_ptr(), frame.as_ptr(), frame.len())
    }

    fn signal_quality(&self) -> i8 {
        self.signal_quality
    }
}

struct CallbackUpdater {
    enter: UpdateFn,
    ctx: *mut c_void,
}

impl UpdateManager for CallbackUpdater {
    fn enter_update_mode(&mut self) -> Result<(), UpdateError> {
        if (self.enter)(self.ctx) {
            Ok(())
        } else {
            Err(UpdateError::Failed("host update callback refused".into()))
        }
    }
}

struct ActorHandle {
    actor: Actor<CallbackTransport>,
    enabled: Rc<Cell<bool>>,
}

type ControllerHandle = Controller<CallbackTransport>;

/// Largest frame the protocol produces; size receive buffers with this.
#[no_mangle]
pub extern "C" fn relayctl_max_frame_len() -> usize {
    MAX_FRAME_LEN
}

unsafe fn read_secret(secret_32: *const u8) -> SharedSecret {
    let mut bytes = [0u8; KEY_LEN];
    bytes.copy_from_slice(slice::from_raw_parts(secret_32, KEY_LEN));
    SharedSecret::from_bytes(bytes)
}

unsafe fn read_address(addr_6: *const u8) -> LinkAddress {
    let mut bytes = [0u8; 6];
    bytes.copy_from_slice(slice::from_raw_parts(addr_6, 6));
    LinkAddress(bytes)
}

/// Create an actor. `secret_32` is the 32-byte network secret. `update` may be null,
/// in which case OTA preparation always ends in the error state.
/// Returns an opaque handle, or null on bad arguments.
#[no_mangle]
pub extern "C" fn relayctl_actor_create(
    node_id: u8,
    secret_32: *const u8,
    send: Option<SendFn>,
    update: Option<UpdateFn>,
    ctx: *mut c_void,
) -> *mut c_void {
    let (Some(id), Some(send)) = (PeerId::new(node_id), send) else {
        return std::ptr::null_mut();
    };
    if secret_32.is_null() {
        return std::ptr::null_mut();
    }
    let secret = unsafe { read_secret(secret_32) };
    let transport = CallbackTransport {
        send,
        ctx,
        signal_quality: 0,
    };
    let enabled = Rc::new(Cell::new(true));
    let flag = enabled.clone();
    let mut actor = Actor::new(
        id,
        Security::new(secret),
        transport,
        ProtocolConfig::default(),
        Instant::now(),
    )
    .with_enable_input(move || flag.get());
    if let Some(enter) = update {
        actor = actor.with_update_manager(CallbackUpdater { enter, ctx });
    }
    Box::into_raw(Box::new(ActorHandle { actor, enabled })) as *mut c_void
}

/// Destroy an actor. No-op if h is null.
#[no_mangle]
pub extern "C" fn relayctl_actor_destroy(h: *mut c_void) {
    if h.is_null() {
        return;
    }
    let _ = unsafe { Box::from_raw(h as *mut ActorHandle) };
}

/// Mirror the board's enable switch. Beacons stop while disabled.
#[no_mangle]
pub extern "C" fn relayctl_actor_set_enabled(h: *mut c_void, enabled: bool) -> c_int {
    if h.is_null() {
        return -1;
    }
    let handle = unsafe { &*(h as *const ActorHandle) };
    handle.enabled.set(enabled);
    0
}

/// Signal strength (dBm) to report in beacons.
#[no_mangle]
pub extern "C" fn relayctl_actor_set_signal_quality(h: *mut c_void, dbm: i8) -> c_int {
    if h.is_null() {
        return -1;
    }
    let handle = unsafe { &mut *(h as *mut ActorHandle) };
    handle.actor.transport_mut().signal_quality = dbm;
    0
}

#[no_mangle]
pub extern "C" fn relayctl_actor_tick(h: *mut c_void) -> c_int {
    if h.is_null() {
        return -1;
    }
    let handle = unsafe { &mut *(h as *mut ActorHandle) };
    handle.actor.on_tick(Instant::now());
    0
}

/// Feed one received frame. `addr_6` is the sender's link address.
#[no_mangle]
pub extern "C" fn relayctl_actor_on_frame(
    h: *mut c_void,
    addr_6: *const u8,
    data: *const u8,
    len: usize,
) -> c_int {
    if h.is_null() || addr_6.is_null() || (data.is_null() && len > 0) {
        return -1;
    }
    let handle = unsafe { &mut *(h as *mut ActorHandle) };
    let from = unsafe { read_address(addr_6) };
    let frame: &[u8] = if len == 0 {
        &[]
    } else {
        unsafe { slice::from_raw_parts(data, len) }
    };
    handle.actor.on_frame_received(from, frame, Instant::now());
    0
}

/// 0 idle, 1 preparing OTA, 2 in update mode, 3 error; -1 if h is null.
#[no_mangle]
pub extern "C" fn relayctl_actor_state(h: *mut c_void) -> c_int {
    if h.is_null() {
        return -1;
    }
    let handle = unsafe { &*(h as *const ActorHandle) };
    match handle.actor.current_state() {
        ActorState::Idle => 0,
        ActorState::OtaPreparing => 1,
        ActorState::OtaActive => 2,
        ActorState::Error => 3,
    }
}

/// 1 relay on, 0 off, -1 if h is null.
#[no_mangle]
pub extern "C" fn relayctl_actor_relay_state(h: *mut c_void) -> c_int {
    if h.is_null() {
        return -1;
    }
    let handle = unsafe { &*(h as *const ActorHandle) };
    c_int::from(handle.actor.relay_state())
}

/// Copy this actor's session key (32 bytes) for out-of-band provisioning on a controller.
#[no_mangle]
pub extern "C" fn relayctl_actor_session_key(h: *mut c_void, out_key_32: *mut u8) -> c_int {
    if h.is_null() || out_key_32.is_null() {
        return -1;
    }
    let handle = unsafe { &*(h as *const ActorHandle) };
    let key = handle.actor.session_key().as_bytes();
    unsafe {
        out_key_32.copy_from_nonoverlapping(key.as_ptr(), KEY_LEN);
    }
    0
}

/// Create a controller accepting beacons from `actor_ids[0..n]`. Ids out of range are skipped.
#[no_mangle]
pub extern "C" fn relayctl_controller_create(
    node_id: u8,
    secret_32: *const u8,
    actor_ids: *const u8,
    n: usize,
    send: Option<SendFn>,
    ctx: *mut c_void,
) -> *mut c_void {
    let (Some(id), Some(send)) = (PeerId::new(node_id), send) else {
        return std::ptr::null_mut();
    };
    if secret_32.is_null() || (actor_ids.is_null() && n > 0) {
        return std::ptr::null_mut();
    }
    let secret = unsafe { read_secret(secret_32) };
    let ids: Vec<PeerId> = if n == 0 {
        Vec::new()
    } else {
        unsafe { slice::from_raw_parts(actor_ids, n) }
            .iter()
            .filter_map(|&raw| PeerId::new(raw))
            .collect()
    };
    let transport = CallbackTransport {
        send,
        ctx,
        signal_quality: 0,
    };
    let controller = Controller::new(
        id,
        Security::new(secret),
        transport,
        ProtocolConfig::default(),
        ids,
        Instant::now(),
    );
    Box::into_raw(Box::new(controller)) as *mut c_void
}

#[no_mangle]
pub extern "C" fn relayctl_controller_destroy(h: *mut c_void) {
    if h.is_null() {
        return;
    }
    let _ = unsafe { Box::from_raw(h as *mut ControllerHandle) };
}

#[no_mangle]
pub extern "C" fn relayctl_controller_tick(h: *mut c_void) -> c_int {
    if h.is_null() {
        return -1;
    }
    let controller = unsafe { &mut *(h as *mut ControllerHandle) };
    controller.on_tick(Instant::now());
    0
}

#[no_mangle]
pub extern "C" fn relayctl_controller_on_frame(
    h: *mut c_void,
    addr_6: *const u8,
    data: *const u8,
    len: usize,
) -> c_int {
    if h.is_null() || addr_6.is_null() || (data.is_null() && len > 0) {
        return -1;
    }
    let controller = unsafe { &mut *(h as *mut ControllerHandle) };
    let from = unsafe { read_address(addr_6) };
    let frame: &[u8] = if len == 0 {
        &[]
    } else {
        unsafe { slice::from_raw_parts(data, len) }
    };
    controller.on_frame_received(from, frame, Instant::now());
    0
}

/// Install an actor's exported session key so its challenge responses can be verified.
#[no_mangle]
pub extern "C" fn relayctl_controller_provision_session_key(
    h: *mut c_void,
    peer_id: u8,
    key_32: *const u8,
) -> c_int {
    let Some(peer) = PeerId::new(peer_id) else {
        return -1;
    };
    if h.is_null() || key_32.is_null() {
        return -1;
    }
    let controller = unsafe { &mut *(h as *mut ControllerHandle) };
    let mut bytes = [0u8; KEY_LEN];
    unsafe {
        bytes.copy_from_slice(slice::from_raw_parts(key_32, KEY_LEN));
    }
    controller.provision_session_key(peer, SessionKey::from_bytes(bytes));
    0
}

/// 1 sent, 0 radio refused the frame, -1 rejected (unknown peer, OTA in progress, bad args).
#[no_mangle]
pub extern "C" fn relayctl_controller_request_toggle(h: *mut c_void, peer_id: u8) -> c_int {
    let Some(peer) = PeerId::new(peer_id) else {
        return -1;
    };
    if h.is_null() {
        return -1;
    }
    let controller = unsafe { &mut *(h as *mut ControllerHandle) };
    match controller.request_relay_toggle(peer, Instant::now()) {
        Ok(sent) => c_int::from(sent),
        Err(_) => -1,
    }
}

/// Send a challenge to a discovered peer. Same return convention as the toggle request.
#[no_mangle]
pub extern "C" fn relayctl_controller_request_authentication(
    h: *mut c_void,
    peer_id: u8,
) -> c_int {
    let Some(peer) = PeerId::new(peer_id) else {
        return -1;
    };
    if h.is_null() {
        return -1;
    }
    let controller = unsafe { &mut *(h as *mut ControllerHandle) };
    match controller.request_authentication(peer, Instant::now()) {
        Ok(sent) => c_int::from(sent),
        Err(_) => -1,
    }
}

/// Returns the number of peers the OtaPrepare was handed to, or -1.
#[no_mangle]
pub extern "C" fn relayctl_controller_request_ota(h: *mut c_void) -> c_int {
    if h.is_null() {
        return -1;
    }
    let controller = unsafe { &mut *(h as *mut ControllerHandle) };
    match controller.request_ota_broadcast(Instant::now()) {
        Ok(n) => n as c_int,
        Err(_) => -1,
    }
}

#[no_mangle]
pub extern "C" fn relayctl_controller_request_ota_abort(h: *mut c_void) -> c_int {
    if h.is_null() {
        return -1;
    }
    let controller = unsafe { &mut *(h as *mut ControllerHandle) };
    match controller.request_ota_abort(Instant::now()) {
        Ok(n) => n as c_int,
        Err(_) => -1,
    }
}

/// 0 idle, 1 OTA requested, -1 if h is null.
#[no_mangle]
pub extern "C" fn relayctl_controller_state(h: *mut c_void) -> c_int {
    if h.is_null() {
        return -1;
    }
    let controller = unsafe { &*(h as *const ControllerHandle) };
    match controller.current_state() {
        ControllerState::Idle => 0,
        ControllerState::OtaRequested { .. } => 1,
    }
}

#[no_mangle]
pub extern "C" fn relayctl_controller_peer_count(h: *mut c_void) -> c_int {
    if h.is_null() {
        return -1;
    }
    let controller = unsafe { &*(h as *const ControllerHandle) };
    controller.registry().len() as c_int
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: [u8; 32] = *b"0123456789ABCDEF0123456789ABCDEF";

    #[derive(Default)]
    struct Outbox {
        frames: Vec<(Option<[u8; 6]>, Vec<u8>)>,
    }

    extern "C" fn record(ctx: *mut c_void, addr: *const u8, data: *const u8, len: usize) -> bool {
        let outbox = unsafe { &mut *(ctx as *mut Outbox) };
        let to = if addr.is_null() {
            None
        } else {
            let mut a = [0u8; 6];
            a.copy_from_slice(unsafe { slice::from_raw_parts(addr, 6) });
            Some(a)
        };
        let frame = unsafe { slice::from_raw_parts(data, len) }.to_vec();
        outbox.frames.push((to, frame));
        true
    }

    #[test]
    fn create_rejects_bad_arguments() {
        let mut outbox = Outbox::default();
        let ctx = &mut outbox as *mut Outbox as *mut c_void;
        assert!(relayctl_actor_create(10, SECRET.as_ptr(), Some(record), None, ctx).is_null());
        assert!(relayctl_actor_create(1, std::ptr::null(), Some(record), None, ctx).is_null());
        assert!(relayctl_actor_create(1, SECRET.as_ptr(), None, None, ctx).is_null());
        assert_eq!(relayctl_actor_tick(std::ptr::null_mut()), -1);
        relayctl_actor_destroy(std::ptr::null_mut());
    }

    #[test]
    fn actor_beacon_reaches_controller_and_toggle_comes_back() {
        let mut actor_out = Outbox::default();
        let mut ctrl_out = Outbox::default();
        let actor_addr = [2u8, 0, 0, 0, 0, 1];
        let ctrl_addr = [2u8, 0, 0, 0, 0, 0];
        let ids = [1u8];

        let a = relayctl_actor_create(
            1,
            SECRET.as_ptr(),
            Some(record),
            None,
            &mut actor_out as *mut Outbox as *mut c_void,
        );
        let c = relayctl_controller_create(
            0,
            SECRET.as_ptr(),
            ids.as_ptr(),
            ids.len(),
            Some(record),
            &mut ctrl_out as *mut Outbox as *mut c_void,
        );
        assert!(!a.is_null() && !c.is_null());

        assert_eq!(relayctl_actor_tick(a), 0);
        let (to, beacon) = actor_out.frames.pop().unwrap();
        assert_eq!(to, None);
        relayctl_controller_on_frame(c, actor_addr.as_ptr(), beacon.as_ptr(), beacon.len());
        assert_eq!(relayctl_controller_peer_count(c), 1);

        assert_eq!(relayctl_controller_request_toggle(c, 1), 1);
        let (to, toggle) = ctrl_out.frames.pop().unwrap();
        assert_eq!(to, Some(actor_addr));
        relayctl_actor_on_frame(a, ctrl_addr.as_ptr(), toggle.as_ptr(), toggle.len());
        assert_eq!(relayctl_actor_relay_state(a), 1);
        assert_eq!(relayctl_controller_request_toggle(c, 7), -1);

        let mut key = [0u8; 32];
        assert_eq!(relayctl_actor_session_key(a, key.as_mut_ptr()), 0);
        assert_ne!(key, [0u8; 32]);

        relayctl_actor_destroy(a);
        relayctl_controller_destroy(c);
    }

    #[test]
    fn disabled_actor_does_not_beacon() {
        let mut outbox = Outbox::default();
        let a = relayctl_actor_create(
            2,
            SECRET.as_ptr(),
            Some(record),
            None,
            &mut outbox as *mut Outbox as *mut c_void,
        );
        assert_eq!(relayctl_actor_set_enabled(a, false), 0);
        relayctl_actor_tick(a);
        assert!(outbox.frames.is_empty());
        relayctl_actor_destroy(a);
    }
}
