use crate::node::NodeState;

/// Failure kinds callers may want to tell apart
///
/// Everything else travels as a plain `anyhow::Error` with context attached.
/// Use `err.downcast_ref::<HarnessError>()` to match on these.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("failed to start chain container: {0}")]
    ContainerStart(String),
    #[error("container port {0} has no host mapping")]
    PortMapping(String),
    #[error("JSON-RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("transaction {0} reverted")]
    TransactionReverted(String),
    #[error("node at {0} exited before becoming ready")]
    NodeExited(String),
    #[error("illegal node state transition {from:?} -> {to:?}")]
    IllegalTransition { from: NodeState, to: NodeState },
    #[error("keystore error: {0}")]
    Keystore(String),
    #[error("port range exhausted: {0}")]
    PortsExhausted(String),
}
