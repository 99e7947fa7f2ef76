use std::fmt;

use crate::account::AccountName;
use crate::crypto::{Digest, Signature};
use crate::schedule::ProducerSchedule;
use crate::time::Timestamp;
use crate::transaction::TxId;

/// Block height type.
pub type BlockNumber = u64;

/// Block identifier: the header digest with the block height spliced into the
/// leading 8 bytes, so the height can be read back without a lookup.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId([u8; 32]);

impl BlockId {
    pub const ZERO: Self = Self([0u8; 32]);

    pub fn new(number: BlockNumber, digest: Digest) -> Self {
        let mut bytes = *digest.as_bytes();
        bytes[..8].copy_from_slice(&number.to_be_bytes());
        Self(bytes)
    }

    pub fn number(&self) -> BlockNumber {
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&self.0[..8]);
        BlockNumber::from_be_bytes(prefix)
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({self})")
    }
}

/// A block header as exchanged with peers and persisted by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub number: BlockNumber,
    pub timestamp: Timestamp,
    pub producer: AccountName,
    /// How many prior blocks the producer confirms with this header.
    pub confirmed: u16,
    pub previous: BlockId,
    pub transaction_mroot: Digest,
    pub schedule_version: u32,
}

impl BlockHeader {
    /// Canonical digest of the header contents.
    pub fn digest(&self) -> Digest {
        let mut bytes = Vec::with_capacity(128);
        bytes.extend_from_slice(&self.number.to_be_bytes());
        bytes.extend_from_slice(&self.timestamp.as_micros().to_be_bytes());
        bytes.extend_from_slice(self.producer.as_str().as_bytes());
        bytes.extend_from_slice(&self.confirmed.to_be_bytes());
        bytes.extend_from_slice(self.previous.as_bytes());
        bytes.extend_from_slice(self.transaction_mroot.as_bytes());
        bytes.extend_from_slice(&self.schedule_version.to_be_bytes());
        Digest::hash(&bytes)
    }

    pub fn id(&self) -> BlockId {
        BlockId::new(self.number, self.digest())
    }
}

/// A complete block as received from a peer or produced locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedBlock {
    pub header: BlockHeader,
    pub producer_signature: Signature,
    pub transactions: Vec<TxId>,
}

impl SignedBlock {
    pub fn id(&self) -> BlockId {
        self.header.id()
    }
}

/// A validated block together with the schedule context the controller derived
/// for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockState {
    pub id: BlockId,
    pub block_num: BlockNumber,
    pub header: BlockHeader,
    /// Schedule in force when this block was produced.
    pub active_schedule: ProducerSchedule,
    /// Set when a pending schedule will be promoted with the next block; this
    /// is the schedule that becomes active then.
    pub promoted_schedule: Option<ProducerSchedule>,
    pub transaction_count: usize,
}

impl BlockState {
    pub fn from_header(
        header: BlockHeader,
        active_schedule: ProducerSchedule,
        transaction_count: usize,
    ) -> Self {
        Self {
            id: header.id(),
            block_num: header.number,
            header,
            active_schedule,
            promoted_schedule: None,
            transaction_count,
        }
    }

    /// The digest a producer signs to confirm this block.
    pub fn sig_digest(&self) -> Digest {
        let mut bytes = Vec::with_capacity(64);
        bytes.extend_from_slice(self.id.as_bytes());
        bytes.extend_from_slice(&self.active_schedule.version.to_be_bytes());
        Digest::hash(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(number: BlockNumber) -> BlockHeader {
        BlockHeader {
            number,
            timestamp: Timestamp::from_micros(number as i64 * 500_000),
            producer: "alice".parse().unwrap(),
            confirmed: 0,
            previous: BlockId::ZERO,
            transaction_mroot: Digest::ZERO,
            schedule_version: 1,
        }
    }

    #[test]
    fn id_embeds_block_number() {
        let id = header(42).id();
        assert_eq!(id.number(), 42);
    }

    #[test]
    fn header_digest_is_field_sensitive() {
        let a = header(7);
        let mut b = a.clone();
        b.confirmed = 1;
        assert_ne!(a.digest(), b.digest());
    }
}
