#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error("manager RPC failed: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("manager stream ended unexpectedly")]
    StreamClosed,

    #[error("failed to encode tunnel frame: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("failed to decode tunnel frame: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}
