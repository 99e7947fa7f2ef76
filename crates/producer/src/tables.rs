use std::collections::{BTreeSet, HashMap};

use palisade_primitives::block::BlockNumber;
use palisade_primitives::{AccountName, Timestamp, TxId};

/// A set of transaction ids with expiry timestamps, indexed both by id
/// (unique) and by expiry (ordered, non-unique).
///
/// Backs both the persistent-transaction set and the deferred-transaction
/// blacklist; entries only ever leave by expiring.
#[derive(Debug, Default)]
pub struct TxExpiryIndex {
    by_id: HashMap<TxId, Timestamp>,
    by_expiry: BTreeSet<(Timestamp, TxId)>,
}

impl TxExpiryIndex {
    /// Inserts an entry. Returns `false` when the id is already tracked, in
    /// which case the original expiry is kept.
    pub fn insert(&mut self, id: TxId, expiry: Timestamp) -> bool {
        if self.by_id.contains_key(&id) {
            return false;
        }
        self.by_id.insert(id, expiry);
        self.by_expiry.insert((expiry, id));
        true
    }

    pub fn contains(&self, id: &TxId) -> bool {
        self.by_id.contains_key(id)
    }

    /// Removes every entry with `expiry <= cutoff`, returning how many were
    /// dropped.
    pub fn expire_through(&mut self, cutoff: Timestamp) -> usize {
        let mut expired = 0;
        while let Some(&(expiry, id)) = self.by_expiry.iter().next() {
            if expiry > cutoff {
                break;
            }
            self.by_expiry.remove(&(expiry, id));
            self.by_id.remove(&id);
            expired += 1;
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

/// Highest block number this node has signed for each local producer.
///
/// The watermark is a double-sign barrier: the node never signs a block at or
/// below a height it already signed for the same producer, even across forks.
/// In-memory only; a restart falls back to the conservative zero-confirmation
/// default.
#[derive(Debug, Default)]
pub struct ProducerWatermarks {
    marks: HashMap<AccountName, BlockNumber>,
}

impl ProducerWatermarks {
    pub fn get(&self, producer: &AccountName) -> Option<BlockNumber> {
        self.marks.get(producer).copied()
    }

    /// Raises the watermark for `producer` to `number`. Watermarks are
    /// strictly monotone; a lower observation is ignored.
    pub fn observe(&mut self, producer: &AccountName, number: BlockNumber) {
        let mark = self.marks.entry(producer.clone()).or_insert(number);
        if *mark < number {
            *mark = number;
        }
    }
}

#[cfg(test)]
mod tests {
    use palisade_primitives::Digest;

    use super::*;

    fn id(n: u8) -> TxId {
        TxId::new(Digest::hash([n]))
    }

    fn t(micros: i64) -> Timestamp {
        Timestamp::from_micros(micros)
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut index = TxExpiryIndex::default();
        assert!(index.insert(id(1), t(10)));
        assert!(!index.insert(id(1), t(20)));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn expiry_is_inclusive_and_ordered() {
        let mut index = TxExpiryIndex::default();
        index.insert(id(1), t(10));
        index.insert(id(2), t(20));
        index.insert(id(3), t(20));
        index.insert(id(4), t(30));

        assert_eq!(index.expire_through(t(20)), 3);
        assert!(!index.contains(&id(1)));
        assert!(!index.contains(&id(2)));
        assert!(!index.contains(&id(3)));
        assert!(index.contains(&id(4)));
    }

    #[test]
    fn expire_on_empty_index_is_a_noop() {
        let mut index = TxExpiryIndex::default();
        assert_eq!(index.expire_through(t(1_000)), 0);
    }

    #[test]
    fn watermarks_never_regress() {
        let alice: AccountName = "alice".parse().unwrap();
        let mut marks = ProducerWatermarks::default();

        assert_eq!(marks.get(&alice), None);
        marks.observe(&alice, 10);
        marks.observe(&alice, 7);
        assert_eq!(marks.get(&alice), Some(10));
        marks.observe(&alice, 11);
        assert_eq!(marks.get(&alice), Some(11));
    }
}
