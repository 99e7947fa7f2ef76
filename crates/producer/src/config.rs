use std::path::PathBuf;

use palisade_primitives::{AccountName, PrivateKey};
use serde::{Deserialize, Serialize};

/// Static producer configuration, sourced from the node's CLI or config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ProducerConfig {
    /// Enable block production even if the chain is stale.
    pub enable_stale_production: bool,

    /// Start the node with production paused.
    pub pause_on_startup: bool,

    /// Maximum wall-clock time, in milliseconds, a pushed transaction may
    /// execute before being considered invalid. Negative means unbounded.
    pub max_transaction_time_ms: i32,

    /// Maximum age, in seconds, of the irreversible block for a chain this
    /// node will produce on. Negative means unbounded.
    pub max_irreversible_block_age_s: i32,

    /// Accounts this node is authorized to produce for.
    pub producer_names: Vec<AccountName>,

    /// Deprecated `[public-key, private-key]` pairs; prefer
    /// `signature_providers`.
    pub private_keys: Vec<(String, String)>,

    /// Signature provider specs of the form
    /// `<public-key>=<KEY|WALLET>:<data>`.
    pub signature_providers: Vec<String>,

    /// Timeout, in milliseconds, for a wallet daemon signing request.
    pub wallet_provider_timeout_ms: u64,

    /// Accounts denied access to extended cpu/net virtual resources.
    pub greylist_accounts: Vec<AccountName>,

    /// Offset of non-last block producing time, in microseconds. Negative
    /// ships blocks sooner, positive later.
    pub produce_time_offset_us: i32,

    /// Offset of the last block in a producer's round, in microseconds.
    pub last_block_time_offset_us: i32,

    /// Maximum wall-clock time, in milliseconds, spent retiring scheduled
    /// transactions in any block before returning to normal processing.
    pub max_scheduled_transaction_time_per_block_ms: i32,

    /// Ratio between incoming and deferred transactions when both compete
    /// for the assembly window.
    pub incoming_defer_ratio: f64,

    /// Worker threads for transaction signature recovery.
    pub producer_threads: usize,

    /// Where snapshots are written.
    pub snapshots_dir: PathBuf,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        // development default: a deterministic key so a fresh single-node
        // chain can produce out of the box
        let dev_key = PrivateKey::from_seed("nathan");
        let dev_provider = format!("{}=KEY:{}", dev_key.public_key(), dev_key.to_hex());

        Self {
            enable_stale_production: false,
            pause_on_startup: false,
            max_transaction_time_ms: 30,
            max_irreversible_block_age_s: -1,
            producer_names: Vec::new(),
            private_keys: Vec::new(),
            signature_providers: vec![dev_provider],
            wallet_provider_timeout_ms: 5,
            greylist_accounts: Vec::new(),
            produce_time_offset_us: 0,
            last_block_time_offset_us: 0,
            max_scheduled_transaction_time_per_block_ms: 100,
            incoming_defer_ratio: 1.0,
            producer_threads: 2,
            snapshots_dir: PathBuf::from("snapshots"),
        }
    }
}

/// Live-tunable knobs. `None` fields are left unchanged; the last write wins.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeOptions {
    pub max_transaction_time_ms: Option<i32>,
    pub max_irreversible_block_age_s: Option<i32>,
    pub produce_time_offset_us: Option<i32>,
    pub last_block_time_offset_us: Option<i32>,
    pub max_scheduled_transaction_time_per_block_ms: Option<i32>,
    pub subjective_cpu_leeway_us: Option<i64>,
    pub incoming_defer_ratio: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = ProducerConfig::default();
        assert_eq!(config.max_transaction_time_ms, 30);
        assert_eq!(config.max_irreversible_block_age_s, -1);
        assert_eq!(config.wallet_provider_timeout_ms, 5);
        assert_eq!(config.max_scheduled_transaction_time_per_block_ms, 100);
        assert_eq!(config.incoming_defer_ratio, 1.0);
        assert_eq!(config.snapshots_dir, PathBuf::from("snapshots"));
        assert_eq!(config.signature_providers.len(), 1);
    }

    #[test]
    fn config_round_trips_through_kebab_case_keys() {
        let raw = r#"{
            "enable-stale-production": true,
            "producer-names": ["alice", "bob"],
            "incoming-defer-ratio": 2.0
        }"#;

        let config: ProducerConfig = serde_json::from_str(raw).unwrap();
        assert!(config.enable_stale_production);
        assert_eq!(config.producer_names.len(), 2);
        assert_eq!(config.incoming_defer_ratio, 2.0);
        // untouched fields keep their defaults
        assert_eq!(config.max_transaction_time_ms, 30);
    }

    #[test]
    fn runtime_options_default_to_no_changes() {
        assert_eq!(RuntimeOptions::default(), serde_json::from_str("{}").unwrap());
    }
}
