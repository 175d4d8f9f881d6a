// thiserror-based error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("Protocol: {0}")]
    Protocol(#[from] ev07b_protocol::ProtocolError),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("write queue full")]
    WriteQueueFull,
    #[error("Store: {0}")]
    Store(String),
    #[error("Config: {0}")]
    Config(#[from] config::ConfigError),
}

pub type Result<T> = std::result::Result<T, GatewayError>;
