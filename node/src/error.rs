use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("protocol error: {0}")]
    Protocol(#[from] veil_protocol::ProtocolError),

    #[error("network error: {0}")]
    Network(#[from] veil_network::NetworkError),

    #[error("store error: {0}")]
    Store(#[from] veil_store::StoreError),

    #[error("config error: {0}")]
    Config(String),

    #[error("processor fault: {0}")]
    Processor(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("node is stopping")]
    Stopping,
}
