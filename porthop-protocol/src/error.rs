//! Protocol error types.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("packet too short: {0} bytes")]
    PacketTooShort(usize),

    #[error("packet length mismatch: header says {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("decryption failed: {0}")]
    Decrypt(String),

    #[error("decompression failed: {0}")]
    Decompress(#[from] snap::Error),

    #[error("malformed payload: {0}")]
    Payload(String),

    #[error("fragment out of bounds: offset {offset} + len {len} > total {total}")]
    Fragment {
        offset: usize,
        len: usize,
        total: usize,
    },

    #[error("address pool exhausted")]
    PoolExhausted,

    #[error("invalid network: {0}")]
    InvalidNetwork(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
