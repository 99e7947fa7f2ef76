use metrics::{register_counter, Counter};

/// Counters for the production hot paths.
pub(crate) struct ProducerMetrics {
    /// Blocks this node finalized, signed, and committed.
    pub blocks_produced_total: Counter,
    /// Transactions applied into pending blocks, across all phases.
    pub transactions_applied_total: Counter,
    /// Transactions dropped for objective failures.
    pub transactions_failed_total: Counter,
    /// Peer blocks accepted through the incoming-block handler.
    pub blocks_received_total: Counter,
    /// Peer blocks the controller refused.
    pub blocks_rejected_total: Counter,
}

impl Default for ProducerMetrics {
    fn default() -> Self {
        Self {
            blocks_produced_total: register_counter!("producer_blocks_produced_total"),
            transactions_applied_total: register_counter!("producer_transactions_applied_total"),
            transactions_failed_total: register_counter!("producer_transactions_failed_total"),
            blocks_received_total: register_counter!("producer_blocks_received_total"),
            blocks_rejected_total: register_counter!("producer_blocks_rejected_total"),
        }
    }
}
