//! Radio link seam: link-layer addresses and the send primitive engines call.

use std::fmt;
use std::str::FromStr;

/// 6-byte link-layer address (a radio MAC).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkAddress(pub [u8; 6]);

impl LinkAddress {
    pub const BROADCAST: LinkAddress = LinkAddress([0xFF; 6]);

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl fmt::Display for LinkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl fmt::Debug for LinkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LinkAddress({self})")
    }
}

impl FromStr for LinkAddress {
    type Err = ParseLinkAddressError;

    /// Parses `aa:bb:cc:dd:ee:ff` (`-` also accepted as separator).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 6];
        let mut parts = s.split(|c| c == ':' || c == '-');
        for byte in out.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| ParseLinkAddressError(s.to_string()))?;
            if part.len() != 2 {
                return Err(ParseLinkAddressError(s.to_string()));
            }
            *byte =
                u8::from_str_radix(part, 16).map_err(|_| ParseLinkAddressError(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(ParseLinkAddressError(s.to_string()));
        }
        Ok(LinkAddress(out))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid link address {0:?} (expected aa:bb:cc:dd:ee:ff)")]
pub struct ParseLinkAddressError(pub String);

/// Send side of the radio link. Sends are fire-and-forget: `true` means the frame
/// was handed to the radio, not that anyone received it. Implementations must not block.
pub trait Transport {
    fn send_broadcast(&mut self, frame: &[u8]) -> bool;

    fn send_unicast(&mut self, to: &LinkAddress, frame: &[u8]) -> bool;

    /// Current received signal strength (dBm) as reported by the radio, for beacons.
    fn signal_quality(&self) -> i8 {
        0
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send_broadcast(&mut self, frame: &[u8]) -> bool {
        (**self).send_broadcast(frame)
    }

    fn send_unicast(&mut self, to: &LinkAddress, frame: &[u8]) -> bool {
        (**self).send_unicast(to, frame)
    }

    fn signal_quality(&self) -> i8 {
        (**self).signal_quality()
    }
}

/// Records every frame; used by the engine unit tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingTransport {
    pub sent: Vec<(Option<LinkAddress>, Vec<u8>)>,
    pub fail: bool,
}

#[cfg(test)]
impl RecordingTransport {
    pub fn take(&mut self) -> Vec<(Option<LinkAddress>, Vec<u8>)> {
        std::mem::take(&mut self.sent)
    }
}

#[cfg(test)]
impl Transport for RecordingTransport {
    fn send_broadcast(&mut self, frame: &[u8]) -> bool {
        self.sent.push((None, frame.to_vec()));
        !self.fail
    }

    fn send_unicast(&mut self, to: &LinkAddress, frame: &[u8]) -> bool {
        self.sent.push((Some(*to), frame.to_vec()));
        !self.fail
    }

    fn signal_quality(&self) -> i8 {
        -50
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let a: LinkAddress = "24:0A:C4:12:34:56".parse().unwrap();
        assert_eq!(a.0, [0x24, 0x0A, 0xC4, 0x12, 0x34, 0x56]);
        assert_eq!(a.to_string(), "24:0a:c4:12:34:56");
        let b: LinkAddress = "24-0a-c4-12-34-56".parse().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert!("24:0a:c4:12:34".parse::<LinkAddress>().is_err());
        assert!("24:0a:c4:12:34:56:78".parse::<LinkAddress>().is_err());
        assert!("24:0a:c4:12:34:zz".parse::<LinkAddress>().is_err());
        assert!("240:a:c4:12:34:56".parse::<LinkAddress>().is_err());
    }

    #[test]
    fn broadcast_address() {
        assert!(LinkAddress::BROADCAST.is_broadcast());
        assert!(!LinkAddress([0; 6]).is_broadcast());
    }
}
