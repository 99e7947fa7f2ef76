#![cfg_attr(not(test), warn(unused_crate_dependencies))]

//! The block production core of a Palisade node.
//!
//! The core decides when this node should build a block, what goes into it,
//! how it gets signed and committed, and how peer blocks that compete for the
//! same slot are treated. It is driven by a single event-loop task
//! ([`service::ProductionTask`]) that owns all mutable state; everything else
//! talks to it through a [`service::ProducerHandle`].

pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod exit;
pub mod service;
mod tables;

pub use config::{ProducerConfig, RuntimeOptions};
pub use controller::{Controller, PendingBlockHeader, ReadMode, TxTrace};
pub use error::{ControllerError, ProducerError, TransactionError};
pub use events::{ConfirmedBlock, ProducerEvents, TransactionAck};
pub use exit::ExitCode;
pub use service::{
    ChainSubscriptions, IntegrityHashInfo, PendingBlockMode, ProducerHandle, ProductionTask,
    SnapshotInfo, TxResult,
};
