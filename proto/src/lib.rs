//! Wire protocol between the guest daemon and its controller.
//!
//! Shared by both ends: the daemon decodes calls and encodes replies, a
//! controller does the opposite with the same records.

pub mod args;
pub mod chunk;
mod error;
pub mod frame;
pub mod message;
mod mountable;
pub mod procedure;
pub mod xdr;

pub use chunk::{Chunk, ChunkKind, Progress};
pub use error::ProtoError;
pub use frame::Frame;
pub use message::{ErrorBody, MessageHeader, Reply, Status};
pub use mountable::{BTRFSVOL_PREFIX, Mountable};
pub use procedure::{Procedure, Transfer, optargs};
pub use xdr::{Opaque, XdrDecode, XdrDecoder, XdrEncode, XdrEncoder};

pub const PROGRAM: u32 = 0x2000_F5F5;
pub const PROTOCOL_VERSION: u32 = 4;

/// Hard upper bound on any framed message.
pub const MESSAGE_MAX: usize = 4 * 1024 * 1024;

/// Largest payload carried by a single stream chunk.
pub const MAX_CHUNK_SIZE: usize = 256 * 1024;

/// Error messages are truncated to this many bytes.
pub const ERROR_LEN: usize = 64 * 1024;

/// Sent once by the daemon when it is ready for requests.
pub const LAUNCH_FLAG: u32 = 0xF5F5_5FF5;
pub const CANCEL_FLAG: u32 = 0xFFFF_EEEE;
pub const PROGRESS_FLAG: u32 = 0xFFFF_5555;

pub const PROGRESS_MESSAGE_SIZE: usize = 24;
