use std::time::Duration;

use crate::time::Timestamp;

/// Consensus-level timing parameters of the chain.
///
/// These are protocol constants on a live network; they are carried as a value
/// so tests can compress time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainConfig {
    /// Wall-clock width of one block slot.
    pub block_interval: Duration,
    /// Number of consecutive slots a scheduled producer owns before rotation.
    pub producer_repetitions: u32,
    /// How long a failed deferred transaction stays blacklisted.
    pub deferred_tx_expiration_window: Duration,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            block_interval: Duration::from_millis(500),
            producer_repetitions: 12,
            deferred_tx_expiration_window: Duration::from_secs(600),
        }
    }
}

impl ChainConfig {
    pub fn block_interval_us(&self) -> i64 {
        self.block_interval.as_micros() as i64
    }

    /// The slot that contains `time`. Slot 0 starts at the Unix epoch.
    pub fn slot_of(&self, time: Timestamp) -> u64 {
        (time.as_micros() / self.block_interval_us()) as u64
    }

    /// The start time of `slot`.
    pub fn slot_time(&self, slot: u64) -> Timestamp {
        Timestamp::from_micros(slot as i64 * self.block_interval_us())
    }

    /// Whether `slot` is the last repetition in its producer's consecutive run.
    pub fn is_last_slot_in_round(&self, slot: u64) -> bool {
        slot % self.producer_repetitions as u64 == self.producer_repetitions as u64 - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_round_trip() {
        let chain = ChainConfig::default();
        let t = Timestamp::from_micros(10 * 500_000);
        assert_eq!(chain.slot_of(t), 10);
        assert_eq!(chain.slot_time(10), t);
        // mid-slot times map to the containing slot
        assert_eq!(chain.slot_of(t.offset_micros(499_999)), 10);
    }

    #[test]
    fn last_slot_in_round() {
        let chain = ChainConfig { producer_repetitions: 12, ..Default::default() };
        assert!(!chain.is_last_slot_in_round(0));
        assert!(chain.is_last_slot_in_round(11));
        assert!(chain.is_last_slot_in_round(23));
        assert!(!chain.is_last_slot_in_round(24));
    }
}
