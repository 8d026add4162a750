//! Storage node membership: route table, join protocol and wire codec.
//! Host-driven: no I/O; the host supplies transport and identifier store.

pub mod error;
pub mod host;
pub mod identity;
pub mod node;
pub mod protocol;
pub mod route;
pub mod validator;
pub mod wire;

pub use error::RouteError;
pub use host::{
    ConnectionId, IdentifierStore, PeerRoutes, SameMajorMinor, StoreError, Transport,
    TransportError, VersionPolicy,
};
pub use identity::{CommandId, RawId, RAW_ID_SIZE};
pub use node::{Node, NodeIdentity};
pub use protocol::{Command, CommandFlags, CommandHeader, ProtocolVersion, PROTOCOL_VERSION};
pub use route::{BackendInfo, JoinState, PeerRecord, RouteTable};
pub use validator::{decode_route_payload, RoutePayload, ValidationError};
pub use wire::{decode_address_container, encode_announcement, NodeAddress};
