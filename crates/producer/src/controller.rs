use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use palisade_primitives::block::{BlockId, BlockNumber, BlockState, SignedBlock};
use palisade_primitives::transaction::TransactionMeta;
use palisade_primitives::{AccountName, Digest, PublicKey, Signature, Timestamp, TxId};
use palisade_signer::SignerError;

use crate::error::{ControllerError, TransactionError};

/// How the controller replays state for this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Includes the effects of the pending block; required for production.
    Speculative,
    /// Head state only.
    Head,
    /// The node neither produces nor speculates.
    ReadOnly,
    /// Irreversible state only.
    Irreversible,
}

/// Result of applying one transaction to the pending block.
///
/// A trace with `error` set is a completed execution attempt that failed; the
/// error carries the objective/subjective classification.
#[derive(Debug, Clone)]
pub struct TxTrace {
    pub id: TxId,
    pub error: Option<TransactionError>,
    pub cpu_usage: Duration,
    pub net_usage: u64,
}

impl TxTrace {
    pub fn success(id: TxId) -> Self {
        Self { id, error: None, cpu_usage: Duration::ZERO, net_usage: 0 }
    }

    pub fn failure(id: TxId, error: TransactionError) -> Self {
        Self { id, error: Some(error), cpu_usage: Duration::ZERO, net_usage: 0 }
    }
}

/// Header fields of the block currently under assembly.
#[derive(Debug, Clone)]
pub struct PendingBlockHeader {
    pub number: BlockNumber,
    pub timestamp: Timestamp,
    pub producer: AccountName,
    pub signing_key: PublicKey,
}

/// Facade over the chain controller.
///
/// The controller owns the state database, the fork database, and all
/// validation rules. Its API is single-threaded-entry; the production core
/// only calls it from the event-loop task, which serializes access.
pub trait Controller: Send + Sync + 'static {
    /// Handle for an in-flight block validation started on the controller's
    /// own worker threads.
    type BlockFuture: Send + 'static;

    fn read_mode(&self) -> ReadMode;

    fn head_block_state(&self) -> Arc<BlockState>;

    fn head_block_num(&self) -> BlockNumber {
        self.head_block_state().block_num
    }

    fn head_block_id(&self) -> BlockId {
        self.head_block_state().id
    }

    fn head_block_time(&self) -> Timestamp {
        self.head_block_state().header.timestamp
    }

    fn last_irreversible_block_num(&self) -> BlockNumber;

    fn fetch_block_by_number(&self, number: BlockNumber) -> Option<Arc<SignedBlock>>;

    /// Whether a block with this id is already known, on any fork.
    fn contains_block(&self, id: &BlockId) -> bool;

    fn pending_block(&self) -> Option<PendingBlockHeader>;

    /// Opens a new pending block at `block_time`, confirming `confirm_count`
    /// ancestors in its header. Any previous pending block must have been
    /// aborted first.
    fn start_block(&self, block_time: Timestamp, confirm_count: u16) -> Result<(), ControllerError>;

    /// Discards the pending block, returning its applied transactions to the
    /// unapplied set. A no-op when no pending block exists.
    fn abort_block(&self);

    fn finalize_block(&self) -> Result<(), ControllerError>;

    /// Signs the finalized block with the provided signer.
    fn sign_block(
        &self,
        signer: &dyn Fn(&Digest) -> Result<Signature, SignerError>,
    ) -> Result<(), ControllerError>;

    fn commit_block(&self) -> Result<(), ControllerError>;

    fn push_transaction(
        &self,
        tx: &Arc<TransactionMeta>,
        deadline: Timestamp,
    ) -> Result<TxTrace, ControllerError>;

    /// Dispatches an on-chain-scheduled (deferred) transaction.
    fn push_scheduled_transaction(
        &self,
        id: TxId,
        deadline: Timestamp,
    ) -> Result<TxTrace, ControllerError>;

    fn unapplied_transactions(&self) -> Vec<Arc<TransactionMeta>>;

    fn drop_unapplied_transaction(&self, id: &TxId);

    fn drop_all_unapplied_transactions(&self);

    /// Ids of scheduled transactions that are due at the pending block time.
    fn scheduled_transactions(&self) -> Vec<TxId>;

    fn is_known_unexpired_transaction(&self, id: &TxId) -> bool;

    /// Starts validating a peer block on the controller's worker threads.
    fn create_block_state_future(&self, block: Arc<SignedBlock>) -> Self::BlockFuture;

    /// Applies a validated peer block to the fork database and, when it
    /// extends the best chain, to head state.
    fn push_block(&self, future: Self::BlockFuture) -> Result<(), ControllerError>;

    /// Extra cpu budget granted to transactions, compensating for subjective
    /// billing differences between this node and the producer.
    fn set_subjective_cpu_leeway(&self, leeway: Duration);

    fn add_resource_greylist(&self, account: &AccountName);

    fn remove_resource_greylist(&self, account: &AccountName);

    fn resource_greylist(&self) -> Vec<AccountName>;

    /// Deterministic hash of the full chain state at head.
    fn integrity_hash(&self) -> Digest;

    fn write_snapshot(&self, path: &Path) -> Result<(), ControllerError>;

    /// How long a failed deferred transaction stays off the schedule. This is
    /// a consensus parameter of the chain.
    fn deferred_tx_expiration_window(&self) -> Duration;
}
