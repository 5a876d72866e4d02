use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtoError {
    #[error("message truncated: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("length {len} exceeds limit of {max} bytes")]
    TooLong { len: u64, max: usize },

    #[error("invalid boolean value {0}")]
    InvalidBool(u32),

    #[error("string contains an embedded NUL byte")]
    EmbeddedNul,

    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    #[error("invalid {field} value {value}")]
    InvalidEnum { field: &'static str, value: i32 },

    #[error("unknown procedure number {0}")]
    UnknownProcedure(i32),

    #[error("{0}: expecting a btrfs volume")]
    InvalidMountable(String),

    #[error("unexpected flag word 0x{0:08x}")]
    UnexpectedFlag(u32),

    #[error("connection closed mid-message")]
    UnexpectedEof,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
