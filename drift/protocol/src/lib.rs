//! Wire types and manager RPC contract shared by the user daemon session.
//!
//! The manager itself is an external collaborator (see spec §1/§6); this
//! crate only models the client-facing contract: the generated gRPC stubs
//! (in [`pb`]), a couple of convenience domain types layered on top of them,
//! and the framing used for the forwarder's tunneled byte stream.

pub mod pb {
    tonic::include_proto!("drift.manager");
}

pub mod disposition;
pub mod error;
pub mod snapshot;
pub mod tunnel;

pub use disposition::Disposition;
pub use error::ProtocolError;
pub use snapshot::{AgentRecord, AgentSnapshot, InterceptRecord, InterceptSnapshot};
