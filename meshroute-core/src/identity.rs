//! Raw identifiers and command addressing: 512-bit ids, id derivation, command ids.

use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::Deserialize;
use sha2::{Digest, Sha512};

/// Size of a raw id on the wire (512 bits).
pub const RAW_ID_SIZE: usize = 64;

/// Fixed-size identifier owned by a backend. Routing ranges start at these ids.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Deserialize)]
pub struct RawId(#[serde(with = "bytes_64")] [u8; RAW_ID_SIZE]);

mod bytes_64 {
    use serde::{Deserialize, Deserializer};
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 64], D::Error> {
        let buf: Vec<u8> = Deserialize::deserialize(d)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 64 bytes"))
    }
}

impl RawId {
    pub const ZERO: RawId = RawId([0u8; RAW_ID_SIZE]);

    pub fn from_bytes(bytes: [u8; RAW_ID_SIZE]) -> Self {
        RawId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; RAW_ID_SIZE] {
        &self.0
    }

    pub(crate) fn as_bytes_mut(&mut self) -> &mut [u8; RAW_ID_SIZE] {
        &mut self.0
    }

    /// Derive an id from an arbitrary key: SHA-512 digest of the key bytes.
    pub fn from_key(key: &[u8]) -> Self {
        let mut hasher = Sha512::new();
        hasher.update(key);
        RawId(hasher.finalize().into())
    }

    /// Random id from the OS RNG. Used for backends configured without explicit ids.
    pub fn random() -> Self {
        let mut id = [0u8; RAW_ID_SIZE];
        OsRng.fill_bytes(&mut id);
        RawId(id)
    }
}

impl Default for RawId {
    fn default() -> Self {
        RawId::ZERO
    }
}

// Log-friendly form: the first 6 bytes in hex.
impl fmt::Display for RawId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..6] {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for RawId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawId({})", self)
    }
}

/// Addressing part of a command header: raw id plus the group it is routed in.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub struct CommandId {
    pub id: RawId,
    pub group_id: u32,
    pub kind: u32,
}

impl CommandId {
    pub const SIZE: usize = RAW_ID_SIZE + 4 + 4;

    pub fn new(id: RawId, group_id: u32) -> Self {
        Self {
            id,
            group_id,
            kind: 0,
        }
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.group_id, self.id)
    }
}
