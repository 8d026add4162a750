//! Property-based tests for the announcement codec and id container validation.
//!
//! - Encoding a table and decoding it back yields the same (backend_id, group_id, ids)
//! - Every truncation of a valid payload is rejected, never panics
//! - Arbitrary bytes never panic the decoder
//! - Declared counts that exceed the buffer are always rejected

use std::net::SocketAddr;

use meshroute_core::validator::{self, ValidationError};
use meshroute_core::wire::{ADDRESS_CONTAINER_HEADER_SIZE, ADDRESS_RECORD_SIZE};
use meshroute_core::{
    encode_announcement, BackendInfo, Command, CommandHeader, CommandId, NodeAddress, RawId,
};
use proptest::prelude::*;

fn raw_id_strategy() -> impl Strategy<Value = RawId> {
    any::<u64>().prop_map(|seed| RawId::from_key(&seed.to_be_bytes()))
}

fn backend_strategy() -> impl Strategy<Value = BackendInfo> {
    (
        any::<bool>(),
        any::<u32>(),
        prop::collection::vec(raw_id_strategy(), 0..4),
    )
        .prop_map(|(activated, group_id, ids)| BackendInfo {
            activated,
            group_id,
            ids,
        })
}

fn address_strategy() -> impl Strategy<Value = NodeAddress> {
    (any::<[u8; 4]>(), any::<u16>())
        .prop_map(|(ip, port)| NodeAddress::from(SocketAddr::from((ip, port))))
}

fn payload_of(addrs: &[NodeAddress], backends: &[BackendInfo]) -> Vec<u8> {
    let header = CommandHeader::new(CommandId::default(), Command::Join);
    let frame = encode_announcement(&header, addrs, backends).unwrap();
    frame[CommandHeader::SIZE..].to_vec()
}

#[test]
fn prop_roundtrip_ignores_activation() {
    proptest!(|(
        addrs in prop::collection::vec(address_strategy(), 0..3),
        backends in prop::collection::vec(backend_strategy(), 0..6),
    )| {
        let payload = payload_of(&addrs, &backends);
        let decoded = validator::decode_route_payload(&payload).unwrap();

        prop_assert_eq!(&decoded.addresses.addrs, &addrs);
        prop_assert_eq!(decoded.addresses.node_addr_num as usize, addrs.len());
        prop_assert_eq!(decoded.blocks.len(), backends.len());
        for (i, (block, backend)) in decoded.blocks.iter().zip(&backends).enumerate() {
            prop_assert_eq!(block.backend_id as usize, i);
            prop_assert_eq!(block.group_id, backend.group_id);
            prop_assert_eq!(&block.ids, &backend.ids);
        }
    });
}

#[test]
fn prop_every_truncation_rejected() {
    proptest!(|(
        addrs in prop::collection::vec(address_strategy(), 0..3),
        backends in prop::collection::vec(backend_strategy(), 1..4),
    )| {
        let payload = payload_of(&addrs, &backends);
        for cut in 0..payload.len() {
            prop_assert!(validator::decode_route_payload(&payload[..cut]).is_err());
        }
    });
}

#[test]
fn prop_arbitrary_bytes_never_panic() {
    proptest!(|(bytes in prop::collection::vec(any::<u8>(), 0..512))| {
        let _ = validator::decode_route_payload(&bytes);
        let _ = validator::validate_id_container(&bytes);
        let _ = CommandHeader::decode(&bytes);
    });
}

#[test]
fn prop_inflated_id_count_rejected() {
    proptest!(|(
        ids in prop::collection::vec(raw_id_strategy(), 0..4),
        extra in 1u32..=u32::MAX - 4,
    )| {
        let mut buf = 1u32.to_be_bytes().to_vec();
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&(ids.len() as u32 + extra).to_be_bytes());
        for id in &ids {
            buf.extend_from_slice(id.as_bytes());
        }
        let rejected = matches!(
            validator::validate_id_container(&buf),
            Err(ValidationError::Truncated { .. })
        );
        prop_assert!(rejected);
    });
}

#[test]
fn prop_inflated_backend_count_rejected() {
    proptest!(|(
        backends in prop::collection::vec(backend_strategy(), 0..4),
        extra in 1u32..1000,
    )| {
        let payload = payload_of(&[], &backends);
        let mut ids = payload[ADDRESS_CONTAINER_HEADER_SIZE..].to_vec();
        ids[..4].copy_from_slice(&(backends.len() as u32 + extra).to_be_bytes());
        prop_assert!(validator::validate_id_container(&ids).is_err());
    });
}

#[test]
fn prop_inflated_address_count_rejected() {
    proptest!(|(
        addrs in prop::collection::vec(address_strategy(), 0..3),
        extra in 1u32..10_000,
    )| {
        let mut payload = payload_of(&addrs, &[]);
        payload[..4].copy_from_slice(&(addrs.len() as u32 + extra).to_be_bytes());
        let available = payload.len();
        let needed = ADDRESS_CONTAINER_HEADER_SIZE
            + (addrs.len() + extra as usize) * ADDRESS_RECORD_SIZE;
        // Only the id container header trails the addresses, so the count can never fit.
        prop_assert!(needed > available);
        prop_assert!(meshroute_core::decode_address_container(&payload).is_err());
    });
}
