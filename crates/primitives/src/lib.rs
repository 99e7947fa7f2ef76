#![cfg_attr(not(test), warn(unused_crate_dependencies))]

pub mod account;
pub mod block;
pub mod chain;
pub mod crypto;
pub mod schedule;
pub mod time;
pub mod transaction;

pub use account::AccountName;
pub use block::{BlockId, BlockNumber};
pub use crypto::{Digest, PrivateKey, PublicKey, Signature};
pub use time::Timestamp;
pub use transaction::TxId;
