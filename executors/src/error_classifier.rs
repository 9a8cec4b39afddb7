use alloy::transports::{RpcError, TransportErrorKind};

/// The closed taxonomy every remote send error maps into. The rest of the
/// engine only ever branches on this; raw error strings never escape this
/// module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendErrorKind {
    /// The transaction can never be included on any chain under any gas
    /// price. The error is persisted on the row and its nonce released.
    Fatal,

    /// The gas price is below the node's acceptance floor. Retried in
    /// place at a bumped price, same nonce.
    TerminallyUnderpriced,

    /// The node already has this exact hash. Treated as a successful
    /// broadcast.
    AlreadyInMempool,

    /// The nonce is below the account's current nonce, or a conflicting
    /// transaction occupies it. Treated as a successful broadcast of
    /// *something* at this nonce; the intent is re-queued.
    NonceAlreadyUsed,

    /// Network trouble, node restart, timeout, or anything unrecognized.
    /// Retried on the next round.
    Transient,
}

/// A classified send failure.
#[derive(Debug, Clone)]
pub struct SendError {
    pub kind: SendErrorKind,
    pub message: String,
}

impl SendError {
    pub fn from_rpc_error(error: &RpcError<TransportErrorKind>) -> Self {
        match error {
            RpcError::ErrorResp(payload) => Self {
                kind: classify_message(&payload.message),
                message: payload.message.to_string(),
            },
            other => Self {
                kind: SendErrorKind::Transient,
                message: other.to_string(),
            },
        }
    }
}

/// Classification goes by the node's exact error strings. A string is
/// never parsed for anything beyond membership here, and anything
/// unrecognized defaults to transient so a new node version can only ever
/// make the engine retry more, not lose transactions.
fn classify_message(message: &str) -> SendErrorKind {
    match message {
        "exceeds block gas limit"
        | "invalid sender"
        | "negative value"
        | "oversized data"
        | "gas uint64 overflow"
        | "intrinsic gas too low"
        | "nonce too high" => SendErrorKind::Fatal,

        "transaction underpriced" => SendErrorKind::TerminallyUnderpriced,

        // Either the key is shared with another wallet, or we crashed
        // after broadcast and are resending a transaction that was
        // already mined.
        "nonce too low" | "replacement transaction underpriced" => SendErrorKind::NonceAlreadyUsed,

        _ if message.starts_with("known transaction:") => SendErrorKind::AlreadyInMempool,

        _ => SendErrorKind::Transient,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::rpc::json_rpc::ErrorPayload;

    fn rpc_error(message: &str) -> RpcError<TransportErrorKind> {
        RpcError::ErrorResp(ErrorPayload {
            code: -32000,
            message: message.to_string().into(),
            data: None,
        })
    }

    #[test]
    fn fatal_errors_map_to_fatal() {
        for message in [
            "exceeds block gas limit",
            "invalid sender",
            "negative value",
            "oversized data",
            "gas uint64 overflow",
            "intrinsic gas too low",
            "nonce too high",
        ] {
            let error = SendError::from_rpc_error(&rpc_error(message));
            assert_eq!(error.kind, SendErrorKind::Fatal, "{message}");
            assert_eq!(error.message, message);
        }
    }

    #[test]
    fn underpriced_mapping() {
        let error = SendError::from_rpc_error(&rpc_error("transaction underpriced"));
        assert_eq!(error.kind, SendErrorKind::TerminallyUnderpriced);
    }

    #[test]
    fn nonce_already_used_mapping() {
        for message in ["nonce too low", "replacement transaction underpriced"] {
            let error = SendError::from_rpc_error(&rpc_error(message));
            assert_eq!(error.kind, SendErrorKind::NonceAlreadyUsed, "{message}");
        }
    }

    #[test]
    fn already_in_mempool_mapping() {
        let error = SendError::from_rpc_error(&rpc_error(
            "known transaction: 0x414c0c58eb1577e55d7c65eecc9ae53fe2665c56847496f1aa92bc4a1ca7a0d5",
        ));
        assert_eq!(error.kind, SendErrorKind::AlreadyInMempool);
    }

    #[test]
    fn unknown_strings_are_transient() {
        for message in ["", "some weird error", "nonce too lowz", "Transaction underpriced"] {
            let error = SendError::from_rpc_error(&rpc_error(message));
            assert_eq!(error.kind, SendErrorKind::Transient, "{message:?}");
        }
    }

    #[test]
    fn transport_failures_are_transient() {
        let error = SendError::from_rpc_error(&TransportErrorKind::custom_str("connection reset"));
        assert_eq!(error.kind, SendErrorKind::Transient);
    }
}
