use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("a connection attempt is already in progress")]
    AlreadyConnecting,
    #[error("already connected")]
    AlreadyConnected,
    #[error("no tokio runtime to drive the connection")]
    NoRuntime,
}
