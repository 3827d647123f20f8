//! State-synchronization RPC runtime.
//!
//! One authoritative host process shares a mutable application-state tree
//! with any number of remote clients over an abstract duplex transport.
//! The host replicates state as a full sync followed by ordered structural
//! patches; host and clients invoke procedures on each other through an
//! id-correlated call/return/exception protocol. See `tidepool-proto` for
//! the wire frames.

pub mod client;
pub mod error;
pub mod host;
pub mod rpc;
pub mod state;
pub mod telemetry;
pub mod transport;

pub use client::{Client, ClientConfig};
pub use error::RpcError;
pub use host::{CloseHookGuard, Host, HostConfig, RESYNC_PROCEDURE};
pub use rpc::{
    handler_fn, CallOrigin, ConnectionId, ProcedureHandler, ProcedureRegistry, ProcedureTree,
    DEFAULT_CALL_TIMEOUT,
};
pub use state::StateError;

pub use tidepool_proto as proto;
