//! Wire protocol for the tidepool runtime: the closed frame set exchanged
//! between a host and its clients, the structural patch operations used for
//! state replication, and the error payload carried by failed calls.

pub mod error;
pub mod message;
pub mod patch;

pub use error::{WireError, WireErrorKind};
pub use message::{decode, encode, CodecError, Message};
pub use patch::{apply_patch, diff, PatchError, PatchOp, PathSegment};
