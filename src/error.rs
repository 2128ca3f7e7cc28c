//! Error types for the plugin bridge.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("shared memory error: {0}")]
    SharedMemory(String),

    #[error("message queue error: {0}")]
    Queue(String),

    #[error("failed to start host endpoint: {0}")]
    Spawn(String),

    #[error("host endpoint is not responding")]
    HandshakeTimeout,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
