use std::sync::Arc;

use palisade_primitives::block::BlockId;
use palisade_primitives::transaction::TransactionMeta;
use palisade_primitives::{AccountName, Digest, Signature};
use tokio::sync::broadcast;

use crate::error::TransactionError;

const CHANNEL_CAPACITY: usize = 1024;

/// Acknowledgement published for every transaction that reached a final
/// outcome, successful or not.
#[derive(Debug, Clone)]
pub struct TransactionAck {
    pub tx: Arc<TransactionMeta>,
    pub error: Option<TransactionError>,
}

/// BFT-style pre-confirmation: a local producer that did not author a block
/// vouches for it by signing its digest.
#[derive(Debug, Clone)]
pub struct ConfirmedBlock {
    pub block_id: BlockId,
    pub digest: Digest,
    pub producer: AccountName,
    pub signature: Signature,
}

/// Outbound signal hub of the production core.
///
/// Publishing never blocks; a subscriber that falls behind loses the oldest
/// events, which is acceptable for advisory signals.
#[derive(Debug, Clone)]
pub struct ProducerEvents {
    transaction_acks: broadcast::Sender<TransactionAck>,
    confirmed_blocks: broadcast::Sender<ConfirmedBlock>,
    rejected_blocks: broadcast::Sender<BlockId>,
}

impl Default for ProducerEvents {
    fn default() -> Self {
        Self {
            transaction_acks: broadcast::channel(CHANNEL_CAPACITY).0,
            confirmed_blocks: broadcast::channel(CHANNEL_CAPACITY).0,
            rejected_blocks: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }
}

impl ProducerEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe_transaction_acks(&self) -> broadcast::Receiver<TransactionAck> {
        self.transaction_acks.subscribe()
    }

    pub fn subscribe_confirmed_blocks(&self) -> broadcast::Receiver<ConfirmedBlock> {
        self.confirmed_blocks.subscribe()
    }

    pub fn subscribe_rejected_blocks(&self) -> broadcast::Receiver<BlockId> {
        self.rejected_blocks.subscribe()
    }

    pub(crate) fn publish_transaction_ack(&self, ack: TransactionAck) {
        let _ = self.transaction_acks.send(ack);
    }

    pub(crate) fn publish_confirmed_block(&self, confirmation: ConfirmedBlock) {
        let _ = self.confirmed_blocks.send(confirmation);
    }

    pub(crate) fn publish_rejected_block(&self, id: BlockId) {
        let _ = self.rejected_blocks.send(id);
    }
}
