use std::path::PathBuf;

use palisade_primitives::{BlockId, TxId};
use palisade_signer::SignerError;

/// Deterministic or resource-bound failure of a single transaction, as
/// reported by the controller in a trace.
///
/// Failures split along the subjective/objective axis: subjective outcomes
/// depend on this node's local resource or timing state and are retried;
/// objective outcomes are reproducible on any honest node and are surfaced to
/// the submitter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransactionError {
    #[error("expired transaction {0}")]
    ExpiredTx(TxId),

    #[error("duplicate transaction {0}")]
    TxDuplicate(TxId),

    #[error("transaction exceeded the pending block's cpu budget")]
    BlockCpuUsageExceeded,

    #[error("transaction exceeded the pending block's net budget")]
    BlockNetUsageExceeded,

    #[error("transaction deadline exceeded")]
    DeadlineExceeded,

    #[error("transaction authorization failed: {0}")]
    AuthorizationFailure(String),

    #[error("transaction execution failed: {0}")]
    Execution(String),
}

impl TransactionError {
    /// Whether this failure is subjective.
    ///
    /// A deadline failure is only subjective when the deadline that tripped
    /// was a local preprocessing cap rather than the submitter-facing
    /// transaction time limit.
    pub fn is_subjective(&self, deadline_was_subjective: bool) -> bool {
        match self {
            Self::BlockCpuUsageExceeded | Self::BlockNetUsageExceeded => true,
            Self::DeadlineExceeded => deadline_was_subjective,
            _ => false,
        }
    }
}

/// Errors raised by the chain controller itself, as opposed to failures of an
/// individual transaction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControllerError {
    /// The state database guard tripped; the node must stop before it
    /// corrupts state.
    #[error("state database guard tripped")]
    Guard,

    /// The memory-mapped state database is out of space.
    #[error("state database memory exhausted")]
    DatabaseExhausted,

    /// The database was left dirty by an unclean shutdown.
    #[error("state database dirty, replay required")]
    DatabaseDirty,

    #[error("block validation failed: {0}")]
    InvalidBlock(String),

    #[error("{0}")]
    Other(String),
}

impl ControllerError {
    /// Fatal errors terminate the production task; the node process maps them
    /// to an [`ExitCode`](crate::exit::ExitCode).
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Guard | Self::DatabaseExhausted | Self::DatabaseDirty)
    }
}

/// Top-level error type of the production core.
#[derive(Debug, thiserror::Error)]
pub enum ProducerError {
    #[error("received block {id} from the future, ignoring it")]
    BlockFromTheFuture { id: BlockId },

    #[error("produce_block called while not actually producing")]
    NotProducing,

    #[error("pending block does not exist but it should")]
    MissingPendingBlock,

    #[error("snapshot named {} already exists", path.display())]
    SnapshotExists { path: PathBuf },

    #[error("no such snapshots directory {}", path.display())]
    SnapshotDirectoryNotFound { path: PathBuf },

    #[error("invalid producer configuration: {0}")]
    Config(String),

    #[error("production core is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Signer(#[from] SignerError),

    #[error(transparent)]
    Controller(#[from] ControllerError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_failures_are_always_subjective() {
        assert!(TransactionError::BlockCpuUsageExceeded.is_subjective(false));
        assert!(TransactionError::BlockNetUsageExceeded.is_subjective(true));
    }

    #[test]
    fn deadline_subjectivity_follows_the_deadline_origin() {
        assert!(TransactionError::DeadlineExceeded.is_subjective(true));
        assert!(!TransactionError::DeadlineExceeded.is_subjective(false));
    }

    #[test]
    fn deterministic_failures_are_objective() {
        let id = TxId::new(palisade_primitives::Digest::ZERO);
        assert!(!TransactionError::ExpiredTx(id).is_subjective(true));
        assert!(!TransactionError::TxDuplicate(id).is_subjective(true));
        assert!(!TransactionError::AuthorizationFailure("missing auth".into()).is_subjective(true));
    }
}
