//! Id container validation: turn an untrusted buffer into backend id blocks or reject it whole.

use crate::wire::{
    self, AddressContainer, BackendIdBlock, DecodeError, Reader, BACKEND_BLOCK_HEADER_SIZE,
    ID_CONTAINER_HEADER_SIZE,
};

/// Why an id container was rejected. No block from a rejected container is ever applied.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("id container truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("declared {declared} backends but buffer holds {found_bytes} bytes for them")]
    CountMismatch { declared: u32, found_bytes: usize },
    #[error("malformed id container: {0}")]
    Malformed(&'static str),
}

impl From<DecodeError> for ValidationError {
    fn from(e: DecodeError) -> Self {
        match e {
            DecodeError::Truncated { needed, available } => {
                ValidationError::Truncated { needed, available }
            }
            DecodeError::Overflow(what) => ValidationError::Malformed(what),
        }
    }
}

/// Validate `declared_backend_count` blocks covering all of `bytes`.
/// Blocks come back in wire order, not sorted by backend id.
pub fn validate_blocks(
    bytes: &[u8],
    declared_backend_count: u32,
) -> Result<Vec<BackendIdBlock>, ValidationError> {
    let count_mismatch = || ValidationError::CountMismatch {
        declared: declared_backend_count,
        found_bytes: bytes.len(),
    };
    // Every block has at least a header; reject impossible counts before allocating.
    let min_len = (declared_backend_count as usize)
        .checked_mul(BACKEND_BLOCK_HEADER_SIZE)
        .ok_or_else(count_mismatch)?;
    if min_len > bytes.len() {
        return Err(count_mismatch());
    }

    let mut r = Reader::new(bytes);
    let mut blocks = Vec::with_capacity(declared_backend_count as usize);
    for _ in 0..declared_backend_count {
        blocks.push(wire::decode_backend_id_block(&mut r)?);
    }
    if r.remaining() != 0 {
        return Err(count_mismatch());
    }
    Ok(blocks)
}

/// Validate a full id container: backend count header followed by its blocks.
pub fn validate_id_container(bytes: &[u8]) -> Result<Vec<BackendIdBlock>, ValidationError> {
    let mut r = Reader::new(bytes);
    let backend_count = r.read_u32().map_err(|_| ValidationError::Truncated {
        needed: ID_CONTAINER_HEADER_SIZE,
        available: bytes.len(),
    })?;
    validate_blocks(r.rest(), backend_count)
}

/// Address list plus backend blocks, as carried by join requests and route announcements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePayload {
    pub addresses: AddressContainer,
    pub blocks: Vec<BackendIdBlock>,
}

/// Decode a complete announcement payload (the bytes after the command header).
pub fn decode_route_payload(payload: &[u8]) -> Result<RoutePayload, ValidationError> {
    let (addresses, rest) = wire::decode_address_container(payload)?;
    let blocks = validate_id_container(rest)?;
    Ok(RoutePayload { addresses, blocks })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{RawId, RAW_ID_SIZE};

    fn push_block(buf: &mut Vec<u8>, backend_id: u32, group_id: u32, ids: &[RawId]) {
        buf.extend_from_slice(&backend_id.to_be_bytes());
        buf.extend_from_slice(&group_id.to_be_bytes());
        buf.extend_from_slice(&(ids.len() as u32).to_be_bytes());
        for id in ids {
            buf.extend_from_slice(id.as_bytes());
        }
    }

    fn container(blocks: &[(u32, u32, Vec<RawId>)]) -> Vec<u8> {
        let mut buf = (blocks.len() as u32).to_be_bytes().to_vec();
        for (b, g, ids) in blocks {
            push_block(&mut buf, *b, *g, ids);
        }
        buf
    }

    #[test]
    fn blocks_returned_in_wire_order() {
        let x = RawId::from_key(b"x");
        let buf = container(&[(5, 1, vec![x]), (0, 2, vec![]), (3, 1, vec![x, x])]);
        let blocks = validate_id_container(&buf).unwrap();
        let order: Vec<u32> = blocks.iter().map(|b| b.backend_id).collect();
        assert_eq!(order, vec![5, 0, 3]);
        assert_eq!(blocks[2].ids.len(), 2);
        assert!(blocks[1].ids.is_empty());
    }

    #[test]
    fn empty_container_is_valid() {
        assert_eq!(validate_id_container(&0u32.to_be_bytes()).unwrap(), vec![]);
    }

    #[test]
    fn missing_count_header_is_truncated() {
        assert!(matches!(
            validate_id_container(&[0, 0]),
            Err(ValidationError::Truncated { .. })
        ));
    }

    #[test]
    fn huge_backend_count_rejected_before_reading() {
        let mut buf = u32::MAX.to_be_bytes().to_vec();
        push_block(&mut buf, 0, 0, &[]);
        assert!(matches!(
            validate_id_container(&buf),
            Err(ValidationError::CountMismatch {
                declared: u32::MAX,
                ..
            })
        ));
    }

    #[test]
    fn trailing_bytes_are_count_mismatch() {
        let mut buf = container(&[(1, 1, vec![RawId::from_key(b"a")])]);
        buf.extend_from_slice(&[0u8; 4]);
        assert!(matches!(
            validate_id_container(&buf),
            Err(ValidationError::CountMismatch { declared: 1, .. })
        ));
    }

    #[test]
    fn second_block_short_rejects_whole_container() {
        let a = RawId::from_key(b"a");
        let mut buf = container(&[(1, 1, vec![a]), (2, 1, vec![a, a])]);
        buf.truncate(buf.len() - RAW_ID_SIZE / 2);
        assert!(matches!(
            validate_id_container(&buf),
            Err(ValidationError::Truncated { .. })
        ));
    }

    #[test]
    fn validate_blocks_with_external_count() {
        let a = RawId::from_key(b"a");
        let mut body = Vec::new();
        push_block(&mut body, 9, 4, &[a]);
        let blocks = validate_blocks(&body, 1).unwrap();
        assert_eq!(blocks[0].backend_id, 9);
        assert!(validate_blocks(&body, 2).is_err());
        assert!(validate_blocks(&body, 0).is_err());
    }
}
