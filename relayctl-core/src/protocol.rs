//! Wire message types: header layout, message codes and peer identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Highest valid node id. Ids are shared between actors and controllers.
pub const MAX_PEER_ID: u8 = 9;

/// Target byte meaning "every actor in range".
pub const WILDCARD_TARGET: u8 = 0xFF;

/// Encoded size of [`MessageHeader`].
pub const HEADER_LEN: usize = 11;

pub const CHALLENGE_LEN: usize = 16;
pub const TAG_LEN: usize = 32;

/// HMAC-SHA256 output carried by commands and challenge responses.
pub type Tag = [u8; TAG_LEN];

/// Random challenge sent by a controller.
pub type Challenge = [u8; CHALLENGE_LEN];

/// Node id in `0..=MAX_PEER_ID`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct PeerId(u8);

impl PeerId {
    pub fn new(id: u8) -> Option<Self> {
        (id <= MAX_PEER_ID).then_some(PeerId(id))
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for PeerId {
    type Error = InvalidPeerId;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        PeerId::new(id).ok_or(InvalidPeerId(id))
    }
}

impl From<PeerId> for u8 {
    fn from(id: PeerId) -> u8 {
        id.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("peer id {0} out of range (max {max})", max = MAX_PEER_ID)]
pub struct InvalidPeerId(pub u8);

/// Addressee of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Peer(PeerId),
    /// Wildcard: every actor.
    All,
}

impl Target {
    pub fn from_raw(raw: u8) -> Option<Self> {
        if raw == WILDCARD_TARGET {
            Some(Target::All)
        } else {
            PeerId::new(raw).map(Target::Peer)
        }
    }

    pub fn to_raw(self) -> u8 {
        match self {
            Target::Peer(id) => id.get(),
            Target::All => WILDCARD_TARGET,
        }
    }
}

/// Message codes. Values are part of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgType {
    Beacon = 0x01,
    Challenge = 0x10,
    Response = 0x11,
    RelayToggle = 0x20,
    RelayState = 0x21,
    OtaPrepare = 0x30,
    OtaAck = 0x31,
    OtaAbort = 0x32,
    Ping = 0x40,
    Pong = 0x41,
}

impl MsgType {
    pub fn from_u8(code: u8) -> Option<Self> {
        Some(match code {
            0x01 => MsgType::Beacon,
            0x10 => MsgType::Challenge,
            0x11 => MsgType::Response,
            0x20 => MsgType::RelayToggle,
            0x21 => MsgType::RelayState,
            0x30 => MsgType::OtaPrepare,
            0x31 => MsgType::OtaAck,
            0x32 => MsgType::OtaAbort,
            0x40 => MsgType::Ping,
            0x41 => MsgType::Pong,
            _ => return None,
        })
    }

    /// Commands must carry a tag over the header, keyed with the shared secret.
    pub fn is_command(self) -> bool {
        matches!(self, MsgType::RelayToggle | MsgType::OtaPrepare)
    }
}

/// Fixed 11-byte header that starts every message. Field order is the wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub msg_type: u8,
    pub sender: u8,
    pub target: u8,
    /// Sender uptime in ms. Advisory; never used for ordering.
    pub timestamp_ms: u32,
    pub nonce: u32,
}

impl MessageHeader {
    pub fn new(
        msg_type: MsgType,
        sender: PeerId,
        target: Target,
        timestamp_ms: u32,
        nonce: u32,
    ) -> Self {
        Self {
            msg_type: msg_type as u8,
            sender: sender.get(),
            target: target.to_raw(),
            timestamp_ms,
            nonce,
        }
    }

    pub fn msg_type(&self) -> Option<MsgType> {
        MsgType::from_u8(self.msg_type)
    }

    /// `None` when the sender byte is not a valid node id.
    pub fn sender(&self) -> Option<PeerId> {
        PeerId::new(self.sender)
    }

    pub fn target(&self) -> Option<Target> {
        Target::from_raw(self.target)
    }

    /// True when the target is `id` or the wildcard.
    pub fn is_addressed_to(&self, id: PeerId) -> bool {
        self.target == id.get() || self.target == WILDCARD_TARGET
    }

    /// Exact wire bytes; this is the input to the command tag.
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0] = self.msg_type;
        out[1] = self.sender;
        out[2] = self.target;
        out[3..7].copy_from_slice(&self.timestamp_ms.to_le_bytes());
        out[7..11].copy_from_slice(&self.nonce.to_le_bytes());
        out
    }
}

/// All wire messages. Encoding is bincode (fixed-width, little-endian, no
/// length prefixes), which yields the packed layout; see the wire module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Actor presence announcement, broadcast.
    Beacon {
        header: MessageHeader,
        sender_id: u8,
        relay_state: bool,
        signal_quality: i8,
    },
    Challenge {
        header: MessageHeader,
        challenge: Challenge,
    },
    /// HMAC(session_key || shared_secret, challenge).
    Response {
        header: MessageHeader,
        response: Tag,
    },
    /// Tag is HMAC(shared_secret, header bytes).
    RelayToggle {
        header: MessageHeader,
        tag: Tag,
    },
    RelayState {
        header: MessageHeader,
        relay_state: bool,
    },
    OtaPrepare {
        header: MessageHeader,
        tag: Tag,
    },
    OtaAck {
        header: MessageHeader,
    },
    OtaAbort {
        header: MessageHeader,
    },
    Ping {
        header: MessageHeader,
    },
    Pong {
        header: MessageHeader,
    },
}

impl Message {
    pub fn header(&self) -> &MessageHeader {
        match self {
            Message::Beacon { header, .. }
            | Message::Challenge { header, .. }
            | Message::Response { header, .. }
            | Message::RelayToggle { header, .. }
            | Message::RelayState { header, .. }
            | Message::OtaPrepare { header, .. }
            | Message::OtaAck { header }
            | Message::OtaAbort { header }
            | Message::Ping { header }
            | Message::Pong { header } => header,
        }
    }

    /// The type implied by the variant (not read from the header).
    pub fn msg_type(&self) -> MsgType {
        match self {
            Message::Beacon { .. } => MsgType::Beacon,
            Message::Challenge { .. } => MsgType::Challenge,
            Message::Response { .. } => MsgType::Response,
            Message::RelayToggle { .. } => MsgType::RelayToggle,
            Message::RelayState { .. } => MsgType::RelayState,
            Message::OtaPrepare { .. } => MsgType::OtaPrepare,
            Message::OtaAck { .. } => MsgType::OtaAck,
            Message::OtaAbort { .. } => MsgType::OtaAbort,
            Message::Ping { .. } => MsgType::Ping,
            Message::Pong { .. } => MsgType::Pong,
        }
    }
}
