//! Authenticated relay command and discovery protocol.
//! Host-driven: no I/O; the host feeds frames and ticks, engines send through a `Transport`.

pub mod actor;
pub mod config;
pub mod controller;
pub mod discovery;
pub mod nonce;
pub mod protocol;
pub mod security;
pub mod transport;
pub mod wire;

/// C ABI for firmware and other non-Rust hosts.
pub mod ffi;

pub use actor::{Actor, ActorState, AlwaysEnabled, EnableInput, UpdateError, UpdateManager};
pub use config::ProtocolConfig;
pub use controller::{CommandError, Controller, ControllerState};
pub use discovery::{DiscoveredPeer, DiscoveryRegistry, OtaReadiness, PeerAuth};
pub use nonce::NonceRegistry;
pub use protocol::{Message, MessageHeader, MsgType, PeerId, Target};
pub use security::{Security, SecurityError, SessionKey, SharedSecret};
pub use transport::{LinkAddress, Transport};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError, MAX_FRAME_LEN};
