//! Command authentication and challenge/response identity proof.
//!
//! Two independent keys:
//! - the shared secret, provisioned out of band, authenticates commands from any
//!   controller to any actor;
//! - the session key, regenerated every boot, binds a challenge response to one
//!   running actor.
//!
//! All tag comparisons are constant time.

use std::fmt;

use hmac::digest::{Key, KeyInit, Output};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::protocol::{Challenge, MessageHeader, Tag, CHALLENGE_LEN, TAG_LEN};

type HmacSha256 = Hmac<Sha256>;

/// SHA-256 input block size; HMAC keys are normalized to this length.
const BLOCK_LEN: usize = 64;

/// Length of both key components.
pub const KEY_LEN: usize = 32;

/// Long-term pre-shared secret (32 bytes). Immutable after provisioning.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; KEY_LEN]);

impl SharedSecret {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        SharedSecret(bytes)
    }

    /// Accept a secret given as exactly 32 bytes of text (the provisioning format
    /// used by existing deployments).
    pub fn from_passphrase(passphrase: &str) -> Result<Self, SecurityError> {
        let bytes: [u8; KEY_LEN] =
            passphrase
                .as_bytes()
                .try_into()
                .map_err(|_| SecurityError::SecretLength {
                    expected: KEY_LEN,
                    actual: passphrase.len(),
                })?;
        Ok(SharedSecret(bytes))
    }

    fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

/// Per-boot random key used only in the challenge/response exchange.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; KEY_LEN]);

impl SessionKey {
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        SessionKey(key)
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        SessionKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl PartialEq for SessionKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for SessionKey {}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// HMAC-SHA256 over `message`. Pure; no protocol logic. Any key length is accepted:
/// keys longer than a block are hashed first, shorter ones are zero-padded.
pub fn compute_tag(key: &[u8], message: &[u8]) -> Tag {
    let mut block = Zeroizing::new([0u8; BLOCK_LEN]);
    if key.len() > BLOCK_LEN {
        let digest: Output<Sha256> = Sha256::digest(key);
        block[..digest.len()].copy_from_slice(&digest);
    } else {
        block[..key.len()].copy_from_slice(key);
    }
    let mut mac = <HmacSha256 as KeyInit>::new(Key::<HmacSha256>::from_slice(&block[..]));
    mac.update(message);
    let out = mac.finalize().into_bytes();
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&out);
    tag
}

fn tags_match(expected: &Tag, presented: &Tag) -> bool {
    expected.ct_eq(presented).into()
}

/// Key material for the identity proof: session key followed by shared secret.
fn proof_key(session_key: &SessionKey, shared: &SharedSecret) -> Zeroizing<[u8; 2 * KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; 2 * KEY_LEN]);
    key[..KEY_LEN].copy_from_slice(session_key.as_bytes());
    key[KEY_LEN..].copy_from_slice(shared.as_bytes());
    key
}

/// Security service for one node: owns the shared secret and this node's session key.
pub struct Security {
    shared: SharedSecret,
    session_key: SessionKey,
}

impl Security {
    /// New service with a fresh random session key.
    pub fn new(shared: SharedSecret) -> Self {
        Self::with_session_key(shared, SessionKey::generate())
    }

    pub fn with_session_key(shared: SharedSecret, session_key: SessionKey) -> Self {
        Self {
            shared,
            session_key,
        }
    }

    /// This node's session key. Hosts export it out of band so a controller can
    /// verify challenge responses.
    pub fn session_key(&self) -> &SessionKey {
        &self.session_key
    }

    pub fn generate_nonce(&self) -> u32 {
        OsRng.next_u32()
    }

    /// Tag for a command: HMAC(shared_secret, header bytes).
    pub fn authenticate_command(&self, header: &MessageHeader) -> Tag {
        compute_tag(self.shared.as_bytes(), &header.to_bytes())
    }

    pub fn verify_command(&self, header: &MessageHeader, tag: &Tag) -> bool {
        tags_match(&self.authenticate_command(header), tag)
    }

    pub fn issue_challenge(&self) -> Challenge {
        let mut challenge = [0u8; CHALLENGE_LEN];
        OsRng.fill_bytes(&mut challenge);
        challenge
    }

    /// Response = HMAC(session_key || shared_secret, challenge).
    pub fn respond_to_challenge(&self, challenge: &Challenge) -> Tag {
        let key = proof_key(&self.session_key, &self.shared);
        compute_tag(&key[..], challenge)
    }

    /// Recompute the response with the session key believed to belong to the responder.
    pub fn verify_response(
        &self,
        challenge: &Challenge,
        response: &Tag,
        claimed_session_key: &SessionKey,
    ) -> bool {
        let key = proof_key(claimed_session_key, &self.shared);
        tags_match(&compute_tag(&key[..], challenge), response)
    }
}

impl fmt::Debug for Security {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Security").finish_non_exhaustive()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SecurityError {
    #[error("shared secret must be {expected} bytes, got {actual}")]
    SecretLength { expected: usize, actual: usize },
}
