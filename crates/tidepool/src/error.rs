use thiserror::Error;

use tidepool_proto::message::CodecError;
use tidepool_proto::{WireError, WireErrorKind};

use crate::rpc::ConnectionId;
use crate::state::StateError;

/// Everything a call site or configuration site can observe going wrong.
///
/// Registration failures surface synchronously and never cross the wire;
/// remote failures arrive as `rpc_exception` frames and are reconstructed
/// here from the machine-checkable wire kind.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The call timed out or the owning connection went away first.
    #[error("connection lost")]
    ConnectionLost,
    /// The host targeted a client id that is not connected.
    #[error("client '{0}' is not connected")]
    ClientNotFound(ConnectionId),
    /// A client-side call was attempted with no active connection.
    #[error("no server connection is available")]
    ServerUnavailable,
    #[error("procedure '{0}' is already registered")]
    ProcedureAlreadyRegistered(String),
    #[error("procedure '{0}' is not registered")]
    ProcedureNotRegistered(String),
    /// The remote handler ran and failed.
    #[error("remote call failed: {0}")]
    Remote(WireError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("return value did not deserialize: {0}")]
    ReturnType(#[source] serde_json::Error),
}

impl RpcError {
    pub(crate) fn from_wire(error: WireError) -> Self {
        match error.kind {
            WireErrorKind::ProcedureNotRegistered => match error.procedure_path() {
                Some(path) => Self::ProcedureNotRegistered(path.to_string()),
                None => Self::Remote(error),
            },
            WireErrorKind::HandlerFailed => Self::Remote(error),
        }
    }
}
