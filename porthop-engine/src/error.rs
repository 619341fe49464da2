//! Engine error types.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Protocol(#[from] porthop_protocol::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("engine already running")]
    AlreadyRunning,
}
