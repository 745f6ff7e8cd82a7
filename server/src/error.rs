use crate::physics::PhysicsError;
use shared::CodecError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("physics world failed to initialise: {0}")]
    PhysicsInit(PhysicsError),
    #[error(transparent)]
    Physics(#[from] PhysicsError),
    #[error("invalid configuration: {0}")]
    Config(&'static str),
}
