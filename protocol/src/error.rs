use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("message exceeds maximum size: {0} bytes")]
    Oversized(usize),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("invalid authentication signature")]
    BadSignature,
}
