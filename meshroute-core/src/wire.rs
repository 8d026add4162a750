//! Binary layout: command header, address container, id container, backend id blocks.
//! Big endian, no padding. Fixed-size records are `zerocopy` structs of byte arrays,
//! cast straight from received bytes; the variable-length parts go through a
//! bounds-checked cursor, and writes through a builder that knows the exact final size.

use std::collections::TryReserveError;
use std::fmt;
use std::mem::size_of;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::identity::{CommandId, RawId, RAW_ID_SIZE};
use crate::protocol::{Command, CommandFlags, CommandHeader};
use crate::route::BackendInfo;

/// One address record: 28 bytes storage + addr_len (u16) + family (u16).
pub const ADDRESS_RECORD_SIZE: usize = 32;
/// addr_count (u32) + node_addr_num (u32).
pub const ADDRESS_CONTAINER_HEADER_SIZE: usize = 8;
/// backend_count (u32).
pub const ID_CONTAINER_HEADER_SIZE: usize = 4;
/// backend_id (u32) + group_id (u32) + id_count (u32).
pub const BACKEND_BLOCK_HEADER_SIZE: usize = 12;

const ADDRESS_STORAGE_SIZE: usize = 28;
const AF_INET: u16 = 2;
const AF_INET6: u16 = 10;
const SOCKADDR_IN_LEN: u16 = 16;
const SOCKADDR_IN6_LEN: u16 = 28;

/// Error decoding a wire structure. Never produced by a partial read: the cursor
/// checks length before touching bytes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("truncated buffer: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("size of {0} overflows")]
    Overflow(&'static str),
}

/// Error building a wire buffer.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("allocation failed: {0}")]
    OutOfMemory(#[from] TryReserveError),
    #[error("{0} does not fit a 32-bit count")]
    TooMany(&'static str),
    #[error("buffer size mismatch: computed {expected}, written {written}")]
    SizeMismatch { expected: usize, written: usize },
}

/// Command header as laid out on the wire. Every field is a big-endian byte array,
/// so any 104 bytes are a valid value.
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct WireHeader {
    id: [u8; RAW_ID_SIZE],
    group_id: [u8; 4],
    kind: [u8; 4],
    trans: [u8; 8],
    cmd: [u8; 4],
    status: [u8; 4],
    flags: [u8; 8],
    size: [u8; 8],
}

/// addr_count + node_addr_num in front of the address records.
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct AddressContainerHeader {
    addr_count: [u8; 4],
    node_addr_num: [u8; 4],
}

/// Fixed part of a backend id block; `id_count` raw ids follow.
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct BlockHeader {
    backend_id: [u8; 4],
    group_id: [u8; 4],
    id_count: [u8; 4],
}

const _: () = assert!(size_of::<WireHeader>() == CommandHeader::SIZE);
const _: () = assert!(size_of::<AddressContainerHeader>() == ADDRESS_CONTAINER_HEADER_SIZE);
const _: () = assert!(size_of::<BlockHeader>() == BACKEND_BLOCK_HEADER_SIZE);
const _: () = assert!(size_of::<NodeAddress>() == ADDRESS_RECORD_SIZE);

/// Bounds-checked read cursor over a received buffer.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Unread tail of the buffer.
    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::Truncated {
                needed: n,
                available: self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// Cast the next `size_of::<T>()` bytes to a fixed-size record without copying.
    pub fn read_record<T>(&mut self) -> Result<&'a T, DecodeError>
    where
        T: FromBytes + KnownLayout + Immutable,
    {
        let (record, _) = T::ref_from_prefix(self.rest()).map_err(|_| DecodeError::Truncated {
            needed: size_of::<T>(),
            available: self.remaining(),
        })?;
        self.pos += size_of::<T>();
        Ok(record)
    }

    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_be_bytes(*self.read_record::<[u8; 4]>()?))
    }

    pub fn read_raw_id(&mut self) -> Result<RawId, DecodeError> {
        Ok(RawId::from_bytes(*self.read_record::<[u8; RAW_ID_SIZE]>()?))
    }
}

/// Append-only builder for a buffer whose exact size is known before writing.
pub struct Writer {
    buf: Vec<u8>,
    expected: usize,
}

impl Writer {
    /// Reserve exactly `size` bytes. Fails instead of aborting when allocation fails.
    pub fn with_exact_size(size: usize) -> Result<Self, EncodeError> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(size)?;
        Ok(Self {
            buf,
            expected: size,
        })
    }

    pub fn remaining(&self) -> usize {
        self.expected.saturating_sub(self.buf.len())
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn put_record<T: IntoBytes + Immutable>(&mut self, record: &T) {
        self.put_bytes(record.as_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.put_bytes(&v.to_be_bytes());
    }

    pub fn put_raw_id(&mut self, id: &RawId) {
        self.put_bytes(id.as_bytes());
    }

    /// Finish and check that exactly the reserved size was written.
    pub fn finish(self) -> Result<Vec<u8>, EncodeError> {
        if self.buf.len() != self.expected {
            return Err(EncodeError::SizeMismatch {
                expected: self.expected,
                written: self.buf.len(),
            });
        }
        Ok(self.buf)
    }
}

/// Fixed-size socket address record as exchanged between nodes.
#[repr(C)]
#[derive(Clone, Copy, Eq, PartialEq, Hash, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct NodeAddress {
    storage: [u8; ADDRESS_STORAGE_SIZE],
    addr_len: [u8; 2],
    family: [u8; 2],
}

impl NodeAddress {
    pub fn family(&self) -> u16 {
        u16::from_be_bytes(self.family)
    }

    fn addr_len(&self) -> u16 {
        u16::from_be_bytes(self.addr_len)
    }

    /// Convert back to a socket address. `None` for unknown families or bad lengths.
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        let s = &self.storage;
        let port = u16::from_be_bytes([s[0], s[1]]);
        match (self.family(), self.addr_len()) {
            (AF_INET, SOCKADDR_IN_LEN) => {
                let ip = Ipv4Addr::new(s[2], s[3], s[4], s[5]);
                Some(SocketAddr::V4(SocketAddrV4::new(ip, port)))
            }
            (AF_INET6, SOCKADDR_IN6_LEN) => {
                let flowinfo = u32::from_be_bytes([s[2], s[3], s[4], s[5]]);
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&s[6..22]);
                let scope_id = u32::from_be_bytes([s[22], s[23], s[24], s[25]]);
                Some(SocketAddr::V6(SocketAddrV6::new(
                    Ipv6Addr::from(octets),
                    port,
                    flowinfo,
                    scope_id,
                )))
            }
            _ => None,
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.to_socket_addr().map(|a| a.ip())
    }
}

impl From<SocketAddr> for NodeAddress {
    fn from(addr: SocketAddr) -> Self {
        let mut storage = [0u8; ADDRESS_STORAGE_SIZE];
        storage[0..2].copy_from_slice(&addr.port().to_be_bytes());
        let (addr_len, family) = match addr {
            SocketAddr::V4(a) => {
                storage[2..6].copy_from_slice(&a.ip().octets());
                (SOCKADDR_IN_LEN, AF_INET)
            }
            SocketAddr::V6(a) => {
                storage[2..6].copy_from_slice(&a.flowinfo().to_be_bytes());
                storage[6..22].copy_from_slice(&a.ip().octets());
                storage[22..26].copy_from_slice(&a.scope_id().to_be_bytes());
                (SOCKADDR_IN6_LEN, AF_INET6)
            }
        };
        Self {
            storage,
            addr_len: addr_len.to_be_bytes(),
            family: family.to_be_bytes(),
        }
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_socket_addr() {
            Some(a) => write!(f, "{}", a),
            None => write!(f, "<family {} len {}>", self.family(), self.addr_len()),
        }
    }
}

impl fmt::Debug for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeAddress({})", self)
    }
}

/// Reachable addresses of one node.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AddressContainer {
    /// Sender's own address count, informational.
    pub node_addr_num: u32,
    pub addrs: Vec<NodeAddress>,
}

/// Ids owned by one backend of the sending node.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BackendIdBlock {
    pub backend_id: u32,
    pub group_id: u32,
    pub ids: Vec<RawId>,
}

impl CommandHeader {
    pub fn encode(&self) -> [u8; CommandHeader::SIZE] {
        let mut out = [0u8; CommandHeader::SIZE];
        out.copy_from_slice(self.to_wire().as_bytes());
        out
    }

    fn to_wire(&self) -> WireHeader {
        WireHeader {
            id: *self.id.id.as_bytes(),
            group_id: self.id.group_id.to_be_bytes(),
            kind: self.id.kind.to_be_bytes(),
            trans: self.trans.to_be_bytes(),
            cmd: self.cmd.to_u32().to_be_bytes(),
            status: self.status.to_be_bytes(),
            flags: self.flags.bits().to_be_bytes(),
            size: self.size.to_be_bytes(),
        }
    }

    /// Parse a header from the front of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let wire = Reader::new(bytes).read_record::<WireHeader>()?;
        Ok(Self {
            id: CommandId {
                id: RawId::from_bytes(wire.id),
                group_id: u32::from_be_bytes(wire.group_id),
                kind: u32::from_be_bytes(wire.kind),
            },
            trans: u64::from_be_bytes(wire.trans),
            cmd: Command::from_u32(u32::from_be_bytes(wire.cmd)),
            status: i32::from_be_bytes(wire.status),
            flags: CommandFlags::from_bits_retain(u64::from_be_bytes(wire.flags)),
            size: u64::from_be_bytes(wire.size),
        })
    }
}

/// Exact byte size of an announcement for these addresses and backends.
pub fn announcement_size(
    addr_count: usize,
    backends: &[BackendInfo],
) -> Result<usize, EncodeError> {
    let overflow = || EncodeError::TooMany("announcement");
    let mut total = addr_count
        .checked_mul(ADDRESS_RECORD_SIZE)
        .and_then(|n| n.checked_add(CommandHeader::SIZE + ADDRESS_CONTAINER_HEADER_SIZE))
        .and_then(|n| n.checked_add(ID_CONTAINER_HEADER_SIZE))
        .ok_or_else(overflow)?;
    for backend in backends {
        total = backend
            .ids
            .len()
            .checked_mul(RAW_ID_SIZE)
            .and_then(|n| n.checked_add(BACKEND_BLOCK_HEADER_SIZE))
            .and_then(|n| total.checked_add(n))
            .ok_or_else(overflow)?;
    }
    Ok(total)
}

/// Serialize the whole route table plus local addresses into one announcement.
/// `template` supplies id, trans, command and flags; `size` is filled in here.
/// Inactive backends are announced too, with their last known ids.
pub fn encode_announcement(
    template: &CommandHeader,
    local_addresses: &[NodeAddress],
    backends: &[BackendInfo],
) -> Result<Vec<u8>, EncodeError> {
    let addr_count =
        u32::try_from(local_addresses.len()).map_err(|_| EncodeError::TooMany("addresses"))?;
    let backend_count =
        u32::try_from(backends.len()).map_err(|_| EncodeError::TooMany("backends"))?;

    let total = announcement_size(local_addresses.len(), backends)?;
    let mut w = Writer::with_exact_size(total)?;

    let mut header = *template;
    header.size = (total - CommandHeader::SIZE) as u64;
    w.put_record(&header.to_wire());

    w.put_record(&AddressContainerHeader {
        addr_count: addr_count.to_be_bytes(),
        node_addr_num: addr_count.to_be_bytes(),
    });
    for addr in local_addresses {
        w.put_record(addr);
    }

    w.put_u32(backend_count);
    for (backend_id, backend) in backends.iter().enumerate() {
        let id_count =
            u32::try_from(backend.ids.len()).map_err(|_| EncodeError::TooMany("backend ids"))?;
        w.put_record(&BlockHeader {
            backend_id: (backend_id as u32).to_be_bytes(),
            group_id: backend.group_id.to_be_bytes(),
            id_count: id_count.to_be_bytes(),
        });
        for id in &backend.ids {
            w.put_raw_id(id);
        }
    }
    w.finish()
}

/// Decode the address container at the front of `bytes`; returns it and the bytes after it.
pub fn decode_address_container(bytes: &[u8]) -> Result<(AddressContainer, &[u8]), DecodeError> {
    let mut r = Reader::new(bytes);
    let head = r.read_record::<AddressContainerHeader>()?;
    let addr_count = u32::from_be_bytes(head.addr_count);
    let node_addr_num = u32::from_be_bytes(head.node_addr_num);
    let needed = (addr_count as usize)
        .checked_mul(ADDRESS_RECORD_SIZE)
        .ok_or(DecodeError::Overflow("address list"))?;
    if r.remaining() < needed {
        return Err(DecodeError::Truncated {
            needed: ADDRESS_CONTAINER_HEADER_SIZE + needed,
            available: bytes.len(),
        });
    }
    let mut addrs = Vec::with_capacity(addr_count as usize);
    for _ in 0..addr_count {
        addrs.push(*r.read_record::<NodeAddress>()?);
    }
    Ok((
        AddressContainer {
            node_addr_num,
            addrs,
        },
        r.rest(),
    ))
}

/// Decode one backend id block at the cursor, advancing past it.
/// The id array length is checked against the remaining bytes before any id is read.
pub fn decode_backend_id_block(r: &mut Reader<'_>) -> Result<BackendIdBlock, DecodeError> {
    let head = r.read_record::<BlockHeader>()?;
    let id_count = u32::from_be_bytes(head.id_count);
    let ids_len = (id_count as usize)
        .checked_mul(RAW_ID_SIZE)
        .ok_or(DecodeError::Overflow("backend id array"))?;
    if r.remaining() < ids_len {
        return Err(DecodeError::Truncated {
            needed: ids_len,
            available: r.remaining(),
        });
    }
    let mut ids = Vec::with_capacity(id_count as usize);
    for _ in 0..id_count {
        ids.push(r.read_raw_id()?);
    }
    Ok(BackendIdBlock {
        backend_id: u32::from_be_bytes(head.backend_id),
        group_id: u32::from_be_bytes(head.group_id),
        ids,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::RawId;

    fn addr(s: &str) -> NodeAddress {
        NodeAddress::from(s.parse::<SocketAddr>().unwrap())
    }

    fn backend(activated: bool, group_id: u32, ids: &[RawId]) -> BackendInfo {
        BackendInfo {
            activated,
            group_id,
            ids: ids.to_vec(),
        }
    }

    #[test]
    fn header_roundtrip() {
        let mut header = CommandHeader::new(CommandId::new(RawId::from_key(b"n"), 3), Command::Join);
        header.trans = 42;
        header.status = -22;
        header.flags = CommandFlags::DIRECT | CommandFlags::NOLOCK;
        header.size = 1000;
        let bytes = header.encode();
        assert_eq!(bytes.len(), CommandHeader::SIZE);
        assert_eq!(CommandHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn header_fields_at_fixed_offsets() {
        let mut header = CommandHeader::new(CommandId::new(RawId::from_key(b"n"), 7), Command::Join);
        header.id.kind = 9;
        header.trans = 0x0102_0304_0506_0708;
        header.status = -5;
        header.flags = CommandFlags::REPLY;
        header.size = 0x10;
        let bytes = header.encode();
        assert_eq!(&bytes[..64], RawId::from_key(b"n").as_bytes());
        assert_eq!(bytes[64..68], 7u32.to_be_bytes());
        assert_eq!(bytes[68..72], 9u32.to_be_bytes());
        assert_eq!(bytes[72..80], 0x0102_0304_0506_0708u64.to_be_bytes());
        assert_eq!(bytes[80..84], 3u32.to_be_bytes());
        assert_eq!(bytes[84..88], (-5i32).to_be_bytes());
        assert_eq!(bytes[88..96], (1u64 << 5).to_be_bytes());
        assert_eq!(bytes[96..104], 0x10u64.to_be_bytes());
    }

    #[test]
    fn header_decodes_from_prefix_of_longer_buffer() {
        let header = CommandHeader::new(CommandId::default(), Command::ReverseLookup);
        let mut bytes = header.encode().to_vec();
        bytes.extend_from_slice(&[0xee; 7]);
        assert_eq!(CommandHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn node_address_record_layout() {
        let v4 = addr("10.0.0.1:1025");
        let bytes = v4.as_bytes();
        assert_eq!(bytes.len(), ADDRESS_RECORD_SIZE);
        assert_eq!(bytes[0..2], 1025u16.to_be_bytes());
        assert_eq!(bytes[2..6], [10, 0, 0, 1]);
        assert_eq!(bytes[28..30], SOCKADDR_IN_LEN.to_be_bytes());
        assert_eq!(bytes[30..32], AF_INET.to_be_bytes());

        let mut unknown = bytes.to_vec();
        unknown[31] = 99;
        let mut r = Reader::new(&unknown);
        let decoded = *r.read_record::<NodeAddress>().unwrap();
        assert_eq!(decoded.family(), 99);
        assert_eq!(decoded.to_socket_addr(), None);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn header_too_short() {
        let bytes = [0u8; CommandHeader::SIZE - 1];
        assert!(matches!(
            CommandHeader::decode(&bytes),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn node_address_v4_and_v6() {
        let scoped = SocketAddr::V6(SocketAddrV6::new("fe80::1".parse().unwrap(), 1026, 7, 3));
        for sa in [
            "10.0.0.1:1025".parse::<SocketAddr>().unwrap(),
            "[::1]:9".parse().unwrap(),
            scoped,
        ] {
            assert_eq!(NodeAddress::from(sa).to_socket_addr(), Some(sa));
        }
    }

    #[test]
    fn announcement_size_is_exact() {
        let backends = vec![
            backend(true, 1, &[RawId::from_key(b"a"), RawId::from_key(b"b")]),
            BackendInfo::default(),
            backend(false, 2, &[RawId::from_key(b"c")]),
        ];
        let addrs = [addr("10.0.0.1:1025"), addr("10.0.1.1:1025")];
        let header = CommandHeader::new(CommandId::default(), Command::Join);
        let buf = encode_announcement(&header, &addrs, &backends).unwrap();
        let expected = CommandHeader::SIZE
            + ADDRESS_CONTAINER_HEADER_SIZE
            + 2 * ADDRESS_RECORD_SIZE
            + ID_CONTAINER_HEADER_SIZE
            + 3 * BACKEND_BLOCK_HEADER_SIZE
            + 3 * RAW_ID_SIZE;
        assert_eq!(buf.len(), expected);
        assert_eq!(announcement_size(2, &backends).unwrap(), expected);
        let decoded = CommandHeader::decode(&buf).unwrap();
        assert_eq!(decoded.size as usize, expected - CommandHeader::SIZE);
    }

    #[test]
    fn address_container_decodes_and_returns_rest() {
        let addrs = [addr("10.0.0.1:1025"), addr("[::1]:1025")];
        let header = CommandHeader::new(CommandId::default(), Command::Join);
        let buf = encode_announcement(&header, &addrs, &[]).unwrap();
        let (cnt, rest) = decode_address_container(&buf[CommandHeader::SIZE..]).unwrap();
        assert_eq!(cnt.addrs, addrs.to_vec());
        assert_eq!(cnt.node_addr_num, 2);
        assert_eq!(rest, &0u32.to_be_bytes()[..]);
    }

    #[test]
    fn address_container_rejects_short_list() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&3u32.to_be_bytes());
        buf.extend_from_slice(&3u32.to_be_bytes());
        buf.extend_from_slice(&[0u8; 2 * ADDRESS_RECORD_SIZE]);
        assert_eq!(
            decode_address_container(&buf),
            Err(DecodeError::Truncated {
                needed: ADDRESS_CONTAINER_HEADER_SIZE + 3 * ADDRESS_RECORD_SIZE,
                available: buf.len(),
            })
        );
        assert!(decode_address_container(&buf[..5]).is_err());
    }

    #[test]
    fn backend_block_rejects_huge_id_count() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&1u32.to_be_bytes());
        buf.extend_from_slice(&u32::MAX.to_be_bytes());
        buf.extend_from_slice(&[0u8; RAW_ID_SIZE]);
        let mut r = Reader::new(&buf);
        assert!(matches!(
            decode_backend_id_block(&mut r),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn backend_block_advances_cursor() {
        let ids = [RawId::from_key(b"x"), RawId::from_key(b"y")];
        let mut buf = Vec::new();
        buf.extend_from_slice(&3u32.to_be_bytes());
        buf.extend_from_slice(&1u32.to_be_bytes());
        buf.extend_from_slice(&2u32.to_be_bytes());
        for id in &ids {
            buf.extend_from_slice(id.as_bytes());
        }
        buf.push(0xff);
        let mut r = Reader::new(&buf);
        let block = decode_backend_id_block(&mut r).unwrap();
        assert_eq!(block.backend_id, 3);
        assert_eq!(block.group_id, 1);
        assert_eq!(block.ids, ids.to_vec());
        assert_eq!(r.remaining(), 1);
    }

    #[test]
    fn writer_detects_size_mismatch() {
        let mut w = Writer::with_exact_size(8).unwrap();
        w.put_u32(1);
        assert_eq!(w.remaining(), 4);
        assert!(matches!(
            w.finish(),
            Err(EncodeError::SizeMismatch {
                expected: 8,
                written: 4
            })
        ));
    }
}
