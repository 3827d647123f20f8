use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::WireError;
use crate::patch::PatchOp;

/// The closed set of frames a host and a client exchange.
///
/// Every frame serializes as a JSON text message of the shape
/// `{"type": <tag>, "data": <payload>}`. Unknown tags fail decoding; the
/// set is closed on purpose and peers must not extend it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Message {
    /// Invoke a procedure on the remote peer.
    RpcCall {
        call_id: String,
        path: String,
        params: Vec<Value>,
    },
    /// Successful completion of a previously issued call.
    RpcReturn { call_id: String, value: Value },
    /// Failed completion of a previously issued call.
    RpcException { call_id: String, error: WireError },
    /// Full snapshot of the shared state. Host to client only.
    StateSync { state: Value },
    /// Ordered structural operations describing one state transition.
    /// Host to client only.
    StatePatch { patch: Vec<PatchOp> },
}

impl Message {
    pub fn rpc_call(
        call_id: impl Into<String>,
        path: impl Into<String>,
        params: Vec<Value>,
    ) -> Self {
        Self::RpcCall {
            call_id: call_id.into(),
            path: path.into(),
            params,
        }
    }

    pub fn rpc_return(call_id: impl Into<String>, value: Value) -> Self {
        Self::RpcReturn {
            call_id: call_id.into(),
            value,
        }
    }

    pub fn rpc_exception(call_id: impl Into<String>, error: WireError) -> Self {
        Self::RpcException {
            call_id: call_id.into(),
            error,
        }
    }

    pub fn state_sync(state: Value) -> Self {
        Self::StateSync { state }
    }

    pub fn state_patch(patch: Vec<PatchOp>) -> Self {
        Self::StatePatch { patch }
    }

    /// True for the call/return/exception frames handled by the
    /// correlation engine.
    pub fn is_rpc(&self) -> bool {
        matches!(
            self,
            Self::RpcCall { .. } | Self::RpcReturn { .. } | Self::RpcException { .. }
        )
    }

    /// True for the sync/patch frames handled by the state mirror.
    pub fn is_state(&self) -> bool {
        matches!(self, Self::StateSync { .. } | Self::StatePatch { .. })
    }

    /// The wire tag, for logging.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::RpcCall { .. } => "rpc_call",
            Self::RpcReturn { .. } => "rpc_return",
            Self::RpcException { .. } => "rpc_exception",
            Self::StateSync { .. } => "state_sync",
            Self::StatePatch { .. } => "state_patch",
        }
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode frame: {0}")]
    Decode(#[source] serde_json::Error),
}

pub fn encode(message: &Message) -> Result<String, CodecError> {
    serde_json::to_string(message).map_err(CodecError::Encode)
}

pub fn decode(text: &str) -> Result<Message, CodecError> {
    serde_json::from_str(text).map_err(CodecError::Decode)
}
