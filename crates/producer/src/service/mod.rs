//! The production service: a single event-loop task that owns every mutable
//! table of the core, plus the cloneable handle used to reach it.
//!
//! All state-mutating work (scheduling, pool bookkeeping, mode decisions,
//! timer handling, incoming-event handling) happens on the loop, so none of
//! it needs locks. The only other threads involved are the signature
//! recovery workers, which hand their results back through a channel.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use palisade_primitives::block::{BlockId, BlockState, SignedBlock};
use palisade_primitives::chain::ChainConfig;
use palisade_primitives::transaction::TransactionMeta;
use palisade_primitives::{AccountName, Digest, PrivateKey, PublicKey, Signature};
use palisade_signer::{ProviderSpec, SignerError, SignerRegistry};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod block_producer;
mod metrics;
mod timer;
mod verify;

#[cfg(test)]
#[path = "block_producer_tests.rs"]
mod tests;

use self::block_producer::{BlockProducer, BlockProducerArgs};
use self::verify::{SignatureWorkerPool, TxSubmission};
use crate::config::{ProducerConfig, RuntimeOptions};
use crate::controller::{Controller, ReadMode, TxTrace};
use crate::error::{ControllerError, ProducerError, TransactionError};
use crate::events::{ConfirmedBlock, ProducerEvents, TransactionAck};

pub(crate) const LOG_TARGET: &str = "producer";
pub(crate) const TRX_LOG_TARGET: &str = "producer::transaction";

/// What the node does with the block currently under assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingBlockMode {
    /// This node owns the current slot and will finalize the block.
    Producing,
    /// The block is a local view that a peer block will replace.
    Speculating,
}

/// Final outcome of a submitted transaction.
pub type TxResult = Result<TxTrace, TransactionError>;

#[derive(Debug, Clone)]
pub struct SnapshotInfo {
    pub head_block_id: BlockId,
    pub snapshot_name: PathBuf,
}

#[derive(Debug, Clone)]
pub struct IntegrityHashInfo {
    pub head_block_id: BlockId,
    pub integrity_hash: Digest,
}

/// The inbound channels the production core consumes: peer blocks, gossiped
/// transactions, and the controller's block signals.
pub struct ChainSubscriptions {
    pub incoming_blocks: mpsc::Receiver<Arc<SignedBlock>>,
    pub incoming_transactions: mpsc::Receiver<Arc<TransactionMeta>>,
    pub accepted_blocks: broadcast::Receiver<Arc<BlockState>>,
    pub irreversible_blocks: broadcast::Receiver<Arc<SignedBlock>>,
}

enum ProducerCommand {
    SubmitTransaction {
        tx: Arc<TransactionMeta>,
        persist_until_expired: bool,
        responder: Option<verify::TxResponder>,
    },
    SubmitBlock {
        block: Arc<SignedBlock>,
        responder: oneshot::Sender<Result<(), ProducerError>>,
    },
    Pause,
    Resume,
    Paused { reply: oneshot::Sender<bool> },
    UpdateRuntimeOptions(RuntimeOptions),
    GetRuntimeOptions { reply: oneshot::Sender<RuntimeOptions> },
    AddGreylist(Vec<AccountName>),
    RemoveGreylist(Vec<AccountName>),
    GetGreylist { reply: oneshot::Sender<Vec<AccountName>> },
    CreateSnapshot { reply: oneshot::Sender<Result<SnapshotInfo, ProducerError>> },
    IntegrityHash { reply: oneshot::Sender<IntegrityHashInfo> },
}

/// Cloneable front door to the production task.
#[derive(Clone)]
pub struct ProducerHandle {
    commands: mpsc::UnboundedSender<ProducerCommand>,
    signers: Arc<SignerRegistry>,
    events: ProducerEvents,
}

impl ProducerHandle {
    /// Submits a transaction for admission into the pending block. Returns
    /// immediately with a receiver that fires exactly once with the final
    /// outcome; signature recovery and admission run asynchronously.
    pub fn submit_transaction(
        &self,
        tx: Arc<TransactionMeta>,
        persist_until_expired: bool,
    ) -> Result<oneshot::Receiver<TxResult>, ProducerError> {
        let (responder, receiver) = oneshot::channel();
        self.commands
            .send(ProducerCommand::SubmitTransaction {
                tx,
                persist_until_expired,
                responder: Some(responder),
            })
            .map_err(|_| ProducerError::ShuttingDown)?;
        Ok(receiver)
    }

    /// Submits a gossiped transaction with no completion interest.
    pub fn relay_transaction(&self, tx: Arc<TransactionMeta>) -> Result<(), ProducerError> {
        self.commands
            .send(ProducerCommand::SubmitTransaction {
                tx,
                persist_until_expired: false,
                responder: None,
            })
            .map_err(|_| ProducerError::ShuttingDown)
    }

    /// Hands a peer block to the core and waits until it has been pushed (or
    /// rejected) and the scheduler re-armed.
    pub async fn sync_block(&self, block: Arc<SignedBlock>) -> Result<(), ProducerError> {
        let (responder, receiver) = oneshot::channel();
        self.commands
            .send(ProducerCommand::SubmitBlock { block, responder })
            .map_err(|_| ProducerError::ShuttingDown)?;
        receiver.await.map_err(|_| ProducerError::ShuttingDown)?
    }

    pub fn pause(&self) -> Result<(), ProducerError> {
        self.commands.send(ProducerCommand::Pause).map_err(|_| ProducerError::ShuttingDown)
    }

    pub fn resume(&self) -> Result<(), ProducerError> {
        self.commands.send(ProducerCommand::Resume).map_err(|_| ProducerError::ShuttingDown)
    }

    pub async fn paused(&self) -> Result<bool, ProducerError> {
        let (reply, receiver) = oneshot::channel();
        self.commands
            .send(ProducerCommand::Paused { reply })
            .map_err(|_| ProducerError::ShuttingDown)?;
        receiver.await.map_err(|_| ProducerError::ShuttingDown)
    }

    pub fn update_runtime_options(&self, options: RuntimeOptions) -> Result<(), ProducerError> {
        self.commands
            .send(ProducerCommand::UpdateRuntimeOptions(options))
            .map_err(|_| ProducerError::ShuttingDown)
    }

    pub async fn runtime_options(&self) -> Result<RuntimeOptions, ProducerError> {
        let (reply, receiver) = oneshot::channel();
        self.commands
            .send(ProducerCommand::GetRuntimeOptions { reply })
            .map_err(|_| ProducerError::ShuttingDown)?;
        receiver.await.map_err(|_| ProducerError::ShuttingDown)
    }

    pub fn add_greylist_accounts(&self, accounts: Vec<AccountName>) -> Result<(), ProducerError> {
        self.commands
            .send(ProducerCommand::AddGreylist(accounts))
            .map_err(|_| ProducerError::ShuttingDown)
    }

    pub fn remove_greylist_accounts(
        &self,
        accounts: Vec<AccountName>,
    ) -> Result<(), ProducerError> {
        self.commands
            .send(ProducerCommand::RemoveGreylist(accounts))
            .map_err(|_| ProducerError::ShuttingDown)
    }

    pub async fn greylist_accounts(&self) -> Result<Vec<AccountName>, ProducerError> {
        let (reply, receiver) = oneshot::channel();
        self.commands
            .send(ProducerCommand::GetGreylist { reply })
            .map_err(|_| ProducerError::ShuttingDown)?;
        receiver.await.map_err(|_| ProducerError::ShuttingDown)
    }

    pub async fn create_snapshot(&self) -> Result<SnapshotInfo, ProducerError> {
        let (reply, receiver) = oneshot::channel();
        self.commands
            .send(ProducerCommand::CreateSnapshot { reply })
            .map_err(|_| ProducerError::ShuttingDown)?;
        receiver.await.map_err(|_| ProducerError::ShuttingDown)?
    }

    pub async fn integrity_hash(&self) -> Result<IntegrityHashInfo, ProducerError> {
        let (reply, receiver) = oneshot::channel();
        self.commands
            .send(ProducerCommand::IntegrityHash { reply })
            .map_err(|_| ProducerError::ShuttingDown)?;
        receiver.await.map_err(|_| ProducerError::ShuttingDown)
    }

    /// Whether this node holds a signature provider for `key`.
    pub fn is_producer_key(&self, key: &PublicKey) -> bool {
        self.signers.contains(key)
    }

    /// Signs an arbitrary digest with one of this node's registered keys.
    pub fn sign_compact(&self, key: &PublicKey, digest: &Digest) -> Result<Signature, SignerError> {
        self.signers.sign(key, digest)
    }

    pub fn subscribe_transaction_acks(&self) -> broadcast::Receiver<TransactionAck> {
        self.events.subscribe_transaction_acks()
    }

    pub fn subscribe_confirmed_blocks(&self) -> broadcast::Receiver<ConfirmedBlock> {
        self.events.subscribe_confirmed_blocks()
    }

    pub fn subscribe_rejected_blocks(&self) -> broadcast::Receiver<BlockId> {
        self.events.subscribe_rejected_blocks()
    }
}

/// The production event loop.
#[must_use = "ProductionTask does nothing unless run"]
pub struct ProductionTask<C: Controller> {
    producer: BlockProducer<C>,
    commands: mpsc::UnboundedReceiver<ProducerCommand>,
    verified: mpsc::UnboundedReceiver<TxSubmission>,
    subscriptions: ChainSubscriptions,
    shutdown: CancellationToken,
}

impl<C: Controller> ProductionTask<C> {
    /// Builds the task and its handle. Fails fast on configuration the core
    /// cannot run with.
    pub fn new(
        controller: Arc<C>,
        config: ProducerConfig,
        chain: ChainConfig,
        subscriptions: ChainSubscriptions,
        shutdown: CancellationToken,
    ) -> Result<(Self, ProducerHandle), ProducerError> {
        if config.producer_threads == 0 {
            return Err(ProducerError::Config(
                "producer-threads must be greater than 0".into(),
            ));
        }

        let producers: BTreeSet<AccountName> = config.producer_names.iter().cloned().collect();
        if !producers.is_empty() && controller.read_mode() != ReadMode::Speculative {
            return Err(ProducerError::Config(
                "block production is impossible unless the controller read mode is speculative"
                    .into(),
            ));
        }

        let snapshots_dir = config.snapshots_dir.clone();
        if !snapshots_dir.exists() {
            std::fs::create_dir_all(&snapshots_dir)
                .map_err(|err| ProducerError::Config(err.to_string()))?;
        }
        if !snapshots_dir.is_dir() {
            return Err(ProducerError::SnapshotDirectoryNotFound { path: snapshots_dir });
        }

        let signers = Arc::new(build_signer_registry(&config));

        for account in &config.greylist_accounts {
            controller.add_resource_greylist(account);
        }

        let events = ProducerEvents::new();
        let verify_pool = SignatureWorkerPool::new(config.producer_threads)?;
        let (verified_tx, verified_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let mut producer = BlockProducer::new(BlockProducerArgs {
            controller,
            chain,
            signers: Arc::clone(&signers),
            producers,
            events: events.clone(),
            verify_pool,
            verified_tx,
            enable_stale_production: config.enable_stale_production,
            pause_on_startup: config.pause_on_startup,
            max_transaction_time_ms: config.max_transaction_time_ms,
            max_irreversible_block_age_s: config.max_irreversible_block_age_s,
            produce_time_offset_us: config.produce_time_offset_us,
            last_block_time_offset_us: config.last_block_time_offset_us,
            max_scheduled_transaction_time_per_block_ms: config
                .max_scheduled_transaction_time_per_block_ms,
            incoming_defer_ratio: config.incoming_defer_ratio,
            snapshots_dir,
        });
        producer.seed_irreversible_block_time();

        let task = Self {
            producer,
            commands: commands_rx,
            verified: verified_rx,
            subscriptions,
            shutdown,
        };
        let handle = ProducerHandle { commands: commands_tx, signers, events };
        Ok((task, handle))
    }

    /// Drives the core until shutdown or a fatal controller condition. The
    /// returned error maps to a process exit code via
    /// [`ExitCode`](crate::exit::ExitCode).
    pub async fn run(mut self) -> Result<(), ControllerError> {
        if self.producer.local_producer_count() > 0 {
            info!(
                target: LOG_TARGET,
                producers = self.producer.local_producer_count(),
                "Launching block production."
            );
        }

        self.producer.schedule_production_loop();

        loop {
            if let Some(fatal) = self.producer.fatal.take() {
                error!(target: LOG_TARGET, %fatal, "Stopping production on fatal controller error.");
                self.producer.stop();
                return Err(fatal);
            }

            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,

                Some(command) = self.commands.recv() => self.handle_command(command),

                Some(submission) = self.verified.recv() => {
                    self.producer.process_incoming_transaction(submission);
                }

                Some(block) = self.subscriptions.incoming_blocks.recv() => {
                    let _ = self.producer.on_incoming_block(block);
                }

                Some(tx) = self.subscriptions.incoming_transactions.recv() => {
                    self.producer.submit_transaction(tx, false, None);
                }

                bsp = recv_broadcast(&mut self.subscriptions.accepted_blocks) => {
                    self.producer.on_accepted_block(&bsp);
                }

                block = recv_broadcast(&mut self.subscriptions.irreversible_blocks) => {
                    self.producer.on_irreversible_block(&block);
                }

                fired = self.producer.timer.fired() => {
                    self.producer.on_timer(fired);
                }
            }
        }

        self.producer.stop();
        info!(target: LOG_TARGET, "Production loop stopped.");
        Ok(())
    }

    fn handle_command(&mut self, command: ProducerCommand) {
        match command {
            ProducerCommand::SubmitTransaction { tx, persist_until_expired, responder } => {
                self.producer.submit_transaction(tx, persist_until_expired, responder);
            }
            ProducerCommand::SubmitBlock { block, responder } => {
                let result = self.producer.on_incoming_block(block);
                let _ = responder.send(result);
            }
            ProducerCommand::Pause => self.producer.pause(),
            ProducerCommand::Resume => self.producer.resume(),
            ProducerCommand::Paused { reply } => {
                let _ = reply.send(self.producer.paused());
            }
            ProducerCommand::UpdateRuntimeOptions(options) => {
                self.producer.update_runtime_options(options);
            }
            ProducerCommand::GetRuntimeOptions { reply } => {
                let _ = reply.send(self.producer.runtime_options());
            }
            ProducerCommand::AddGreylist(accounts) => {
                self.producer.add_greylist_accounts(accounts);
            }
            ProducerCommand::RemoveGreylist(accounts) => {
                self.producer.remove_greylist_accounts(accounts);
            }
            ProducerCommand::GetGreylist { reply } => {
                let _ = reply.send(self.producer.greylist_accounts());
            }
            ProducerCommand::CreateSnapshot { reply } => {
                let _ = reply.send(self.producer.create_snapshot());
            }
            ProducerCommand::IntegrityHash { reply } => {
                let _ = reply.send(self.producer.integrity_hash());
            }
        }
    }
}

/// Receives the next broadcast value, skipping lag gaps and pending forever
/// once the channel closes (so a dropped publisher does not spin the loop).
async fn recv_broadcast<T: Clone>(receiver: &mut broadcast::Receiver<T>) -> T {
    loop {
        match receiver.recv().await {
            Ok(value) => return value,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(target: LOG_TARGET, skipped, "Falling behind on a chain signal.");
            }
            Err(broadcast::error::RecvError::Closed) => return std::future::pending().await,
        }
    }
}

fn build_signer_registry(config: &ProducerConfig) -> SignerRegistry {
    let mut registry = SignerRegistry::new();
    let timeout = Duration::from_millis(config.wallet_provider_timeout_ms);

    for (public_key, private_key) in &config.private_keys {
        match private_key.parse::<PrivateKey>() {
            Ok(key) => {
                let blanked = "*".repeat(private_key.len());
                warn!(
                    target: LOG_TARGET,
                    "\"private-keys\" is deprecated, use \
                     \"signature-providers = {public_key}=KEY:{blanked}\"."
                );
                registry.insert_key(key);
            }
            Err(_) => error!(target: LOG_TARGET, "Malformed private key pair, ignoring!"),
        }
    }

    for spec in &config.signature_providers {
        let parsed = match spec.parse::<ProviderSpec>() {
            Ok(parsed) => parsed,
            Err(err) => {
                error!(target: LOG_TARGET, %err, "Malformed signature provider, ignoring!");
                continue;
            }
        };
        if let Err(err) = registry.insert_spec(parsed, timeout) {
            error!(target: LOG_TARGET, %err, "Failed to register signature provider, ignoring!");
        }
    }

    registry
}
