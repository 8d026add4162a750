//! Route exchange protocol: command codes, flags, header and version.

use bitflags::bitflags;

use crate::identity::CommandId;

/// Current protocol version (major, minor, patch, build).
pub const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion([0, 26, 3, 1]);

const VERSION_OFFSET: usize = 0;
const SHARD_COUNT_OFFSET: usize = 16;

/// Four-component protocol version carried inside a reverse-lookup command id.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub struct ProtocolVersion(pub [u32; 4]);

impl ProtocolVersion {
    pub fn major(&self) -> u32 {
        self.0[0]
    }

    pub fn minor(&self) -> u32 {
        self.0[1]
    }

    /// Read the version from the first 16 bytes of the id (big endian).
    pub fn decode_from(id: &CommandId) -> Self {
        let bytes = id.id.as_bytes();
        let mut v = [0u32; 4];
        for (i, part) in v.iter_mut().enumerate() {
            let at = VERSION_OFFSET + i * 4;
            *part = u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        }
        ProtocolVersion(v)
    }

    /// Write the version into the first 16 bytes of the id.
    pub fn encode_into(&self, id: &mut CommandId) {
        let bytes = id.id.as_bytes_mut();
        for (i, part) in self.0.iter().enumerate() {
            let at = VERSION_OFFSET + i * 4;
            bytes[at..at + 4].copy_from_slice(&part.to_be_bytes());
        }
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d] = self.0;
        write!(f, "{}.{}.{}.{}", a, b, c, d)
    }
}

/// Read the indexes shard count hint (bytes 16..20 of the id).
pub fn decode_shard_count(id: &CommandId) -> u32 {
    let b = id.id.as_bytes();
    u32::from_be_bytes([
        b[SHARD_COUNT_OFFSET],
        b[SHARD_COUNT_OFFSET + 1],
        b[SHARD_COUNT_OFFSET + 2],
        b[SHARD_COUNT_OFFSET + 3],
    ])
}

/// Write the indexes shard count hint into bytes 16..20 of the id.
pub fn encode_shard_count(id: &mut CommandId, count: u32) {
    id.id.as_bytes_mut()[SHARD_COUNT_OFFSET..SHARD_COUNT_OFFSET + 4]
        .copy_from_slice(&count.to_be_bytes());
}

/// Command codes handled by this crate. Anything else is passed through as `Other`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Command {
    ReverseLookup,
    Join,
    Other(u32),
}

impl Command {
    pub fn from_u32(code: u32) -> Self {
        match code {
            2 => Command::ReverseLookup,
            3 => Command::Join,
            other => Command::Other(other),
        }
    }

    pub fn to_u32(self) -> u32 {
        match self {
            Command::ReverseLookup => 2,
            Command::Join => 3,
            Command::Other(code) => code,
        }
    }
}

bitflags! {
    /// Command header flags (64 bits). Unknown bits are kept as-is.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CommandFlags: u64 {
        /// Failure must be acknowledged; the peer tears the connection down.
        const NEED_ACK = 1 << 2;
        /// Send straight to the addressed connection, not through group routing.
        const DIRECT = 1 << 3;
        /// Receiver must not take its per-key lock for this command.
        const NOLOCK = 1 << 4;
        /// This command is a response.
        const REPLY = 1 << 5;
    }
}

impl Default for CommandFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// Fixed header in front of every command payload.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct CommandHeader {
    pub id: CommandId,
    pub trans: u64,
    pub cmd: Command,
    pub status: i32,
    pub flags: CommandFlags,
    /// Payload length following the header.
    pub size: u64,
}

impl CommandHeader {
    /// id (72) + trans (8) + cmd (4) + status (4) + flags (8) + size (8).
    pub const SIZE: usize = CommandId::SIZE + 8 + 4 + 4 + 8 + 8;

    pub fn new(id: CommandId, cmd: Command) -> Self {
        Self {
            id,
            trans: 0,
            cmd,
            status: 0,
            flags: CommandFlags::empty(),
            size: 0,
        }
    }

    pub fn is_reply(&self) -> bool {
        self.flags.contains(CommandFlags::REPLY)
    }
}
