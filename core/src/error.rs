use alloy::primitives::Address;
use thiserror::Error;

/// Infrastructure-level errors.
///
/// Remote send failures are deliberately not represented here: the engine
/// never branches on an error message outside the send-error classifier,
/// which maps them into its own closed taxonomy.
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    #[error("RPC error: {message}")]
    RpcError { message: String },

    #[error("no unlocked key for address {address}")]
    KeyNotFound { address: Address },

    #[error("validation error: {message}")]
    ValidationError { message: String },

    #[error("internal error: {message}")]
    InternalError { message: String },
}
