use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("malformed beacon datagram")]
    BadBeacon,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
