//! Framing: one message per datagram, bincode payload, exact size per message type.
//!
//! There is no length prefix. The receiver reads the type byte, then requires
//! the datagram to be exactly the size of that type before decoding anything.

use crate::protocol::{Message, MessageHeader, MsgType, CHALLENGE_LEN, HEADER_LEN, TAG_LEN};

/// Largest datagram the radio link carries.
pub const MAX_FRAME_LEN: usize = 250;

/// Exact encoded size of a message of type `t`, header included.
pub const fn frame_len(t: MsgType) -> usize {
    HEADER_LEN
        + match t {
            MsgType::Beacon => 3,
            MsgType::Challenge => CHALLENGE_LEN,
            MsgType::Response | MsgType::RelayToggle | MsgType::OtaPrepare => TAG_LEN,
            MsgType::RelayState => 1,
            MsgType::OtaAck | MsgType::OtaAbort | MsgType::Ping | MsgType::Pong => 0,
        }
}

/// Encode a message into a single datagram.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    let header = msg.header();
    let kind = msg.msg_type();
    if header.msg_type != kind as u8 {
        return Err(FrameEncodeError::TypeMismatch {
            header: header.msg_type,
            variant: kind as u8,
        });
    }
    let out = match msg {
        Message::Beacon {
            header,
            sender_id,
            relay_state,
            signal_quality,
        } => bincode::serialize(&(header, sender_id, relay_state, signal_quality)),
        Message::Challenge { header, challenge } => bincode::serialize(&(header, challenge)),
        Message::Response { header, response } => bincode::serialize(&(header, response)),
        Message::RelayToggle { header, tag } | Message::OtaPrepare { header, tag } => {
            bincode::serialize(&(header, tag))
        }
        Message::RelayState {
            header,
            relay_state,
        } => bincode::serialize(&(header, relay_state)),
        Message::OtaAck { header }
        | Message::OtaAbort { header }
        | Message::Ping { header }
        | Message::Pong { header } => bincode::serialize(header),
    }?;
    debug_assert_eq!(out.len(), frame_len(kind));
    Ok(out)
}

/// Error encoding a message into a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("header type {header:#04x} does not match message variant {variant:#04x}")]
    TypeMismatch { header: u8, variant: u8 },
}

/// Decode one datagram. Anything that is not exactly one well-formed message is rejected.
pub fn decode_frame(bytes: &[u8]) -> Result<Message, FrameDecodeError> {
    if bytes.len() < HEADER_LEN {
        return Err(FrameDecodeError::TooShort(bytes.len()));
    }
    if bytes.len() > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge(bytes.len()));
    }
    let kind = MsgType::from_u8(bytes[0]).ok_or(FrameDecodeError::UnknownType(bytes[0]))?;
    let expected = frame_len(kind);
    if bytes.len() != expected {
        return Err(FrameDecodeError::LengthMismatch {
            msg_type: bytes[0],
            expected,
            actual: bytes.len(),
        });
    }
    let msg = match kind {
        MsgType::Beacon => {
            let (header, sender_id, relay_state, signal_quality) =
                bincode::deserialize::<(MessageHeader, u8, bool, i8)>(bytes)?;
            Message::Beacon {
                header,
                sender_id,
                relay_state,
                signal_quality,
            }
        }
        MsgType::Challenge => {
            let (header, challenge) = bincode::deserialize(bytes)?;
            Message::Challenge { header, challenge }
        }
        MsgType::Response => {
            let (header, response) = bincode::deserialize(bytes)?;
            Message::Response { header, response }
        }
        MsgType::RelayToggle => {
            let (header, tag) = bincode::deserialize(bytes)?;
            Message::RelayToggle { header, tag }
        }
        MsgType::OtaPrepare => {
            let (header, tag) = bincode::deserialize(bytes)?;
            Message::OtaPrepare { header, tag }
        }
        MsgType::RelayState => {
            let (header, relay_state) = bincode::deserialize(bytes)?;
            Message::RelayState {
                header,
                relay_state,
            }
        }
        MsgType::OtaAck => Message::OtaAck {
            header: bincode::deserialize(bytes)?,
        },
        MsgType::OtaAbort => Message::OtaAbort {
            header: bincode::deserialize(bytes)?,
        },
        MsgType::Ping => Message::Ping {
            header: bincode::deserialize(bytes)?,
        },
        MsgType::Pong => Message::Pong {
            header: bincode::deserialize(bytes)?,
        },
    };
    Ok(msg)
}

/// Error decoding a frame. Callers drop the frame; the variant is for local logging only.
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("frame shorter than header ({0} bytes)")]
    TooShort(usize),
    #[error("frame too large ({0} bytes)")]
    TooLarge(usize),
    #[error("unknown message type {0:#04x}")]
    UnknownType(u8),
    #[error("message type {msg_type:#04x} expects {expected} bytes, got {actual}")]
    LengthMismatch {
        msg_type: u8,
        expected: usize,
        actual: usize,
    },
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PeerId, Target};

    fn header(t: MsgType) -> MessageHeader {
        MessageHeader::new(t, PeerId::new(1).unwrap(), Target::All, 1000, 0xA5A5_0001)
    }

    fn sample_beacon() -> Message {
        Message::Beacon {
            header: header(MsgType::Beacon),
            sender_id: 1,
            relay_state: true,
            signal_quality: -61,
        }
    }

    #[test]
    fn frame_sizes_match_packed_layout() {
        assert_eq!(frame_len(MsgType::Beacon), 14);
        assert_eq!(frame_len(MsgType::Challenge), 27);
        assert_eq!(frame_len(MsgType::Response), 43);
        assert_eq!(frame_len(MsgType::RelayToggle), 43);
        assert_eq!(frame_len(MsgType::RelayState), 12);
        assert_eq!(frame_len(MsgType::OtaPrepare), 43);
        assert_eq!(frame_len(MsgType::OtaAck), 11);
        assert_eq!(frame_len(MsgType::Ping), 11);
    }

    #[test]
    fn roundtrip_beacon() {
        let msg = sample_beacon();
        let frame = encode_frame(&msg).unwrap();
        assert_eq!(frame.len(), 14);
        assert_eq!(frame[0], MsgType::Beacon as u8);
        assert_eq!(frame[13], (-61i8) as u8);
        assert_eq!(decode_frame(&frame).unwrap(), msg);
    }

    #[test]
    fn roundtrip_relay_toggle() {
        let msg = Message::RelayToggle {
            header: header(MsgType::RelayToggle),
            tag: [7u8; 32],
        };
        let frame = encode_frame(&msg).unwrap();
        assert_eq!(&frame[..HEADER_LEN], &msg.header().to_bytes()[..]);
        assert_eq!(&frame[HEADER_LEN..], &[7u8; 32][..]);
        assert_eq!(decode_frame(&frame).unwrap(), msg);
    }

    #[test]
    fn short_frame_rejected() {
        let frame = encode_frame(&sample_beacon()).unwrap();
        assert!(matches!(
            decode_frame(&frame[..5]),
            Err(FrameDecodeError::TooShort(5))
        ));
    }

    #[test]
    fn length_mismatch_rejected() {
        let mut frame = encode_frame(&sample_beacon()).unwrap();
        frame.push(0);
        assert!(matches!(
            decode_frame(&frame),
            Err(FrameDecodeError::LengthMismatch {
                expected: 14,
                actual: 15,
                ..
            })
        ));
        frame.truncate(13);
        assert!(matches!(
            decode_frame(&frame),
            Err(FrameDecodeError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn unknown_type_rejected() {
        let mut frame = encode_frame(&Message::Ping {
            header: header(MsgType::Ping),
        })
        .unwrap();
        frame[0] = 0x02;
        assert!(matches!(
            decode_frame(&frame),
            Err(FrameDecodeError::UnknownType(0x02))
        ));
    }

    #[test]
    fn invalid_bool_rejected() {
        let mut frame = encode_frame(&Message::RelayState {
            header: header(MsgType::RelayState),
            relay_state: false,
        })
        .unwrap();
        frame[HEADER_LEN] = 2;
        assert!(matches!(
            decode_frame(&frame),
            Err(FrameDecodeError::Decode(_))
        ));
    }

    #[test]
    fn oversized_frame_rejected() {
        let frame = vec![MsgType::Ping as u8; MAX_FRAME_LEN + 1];
        assert!(matches!(
            decode_frame(&frame),
            Err(FrameDecodeError::TooLarge(_))
        ));
    }

    #[test]
    fn mismatched_header_type_not_encoded() {
        let msg = Message::OtaAck {
            header: header(MsgType::Ping),
        };
        assert!(matches!(
            encode_frame(&msg),
            Err(FrameEncodeError::TypeMismatch { .. })
        ));
    }
}
