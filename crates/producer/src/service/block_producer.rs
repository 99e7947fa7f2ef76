// # Production Scheduler
//
// The producer is driven by a single timer with four re-arm policies, chosen
// by the outcome of `start_block`:
//
// ```text
//                      ┌─────────────────┐
//            ┌────────►│   start_block   │◄──────────────┐
//            │         └─────────────────┘               │
//            │            │    │    │    │               │
//            │     failed │    │    │    │ waiting       │
//            │            ▼    │    │    ▼               │
//            │   retry in i/10 │    │   next local slot  │
//            │                 │    │   (or sleep until  │
//            │       exhausted │    │    a peer block)   │
//            │                 ▼    ▼                    │
//            │          succeeded + producing:           │
//            │          arm at block deadline            │
//            │                      │                    │
//            │                      ▼                    │
//            │            ┌─────────────────┐            │
//            └────────────│  produce_block  │────────────┘
//                         └─────────────────┘
// ```
//
// Re-arming increments a correlation id; a timer handler whose id is stale
// drops itself, which makes cancellation race-free without real timer
// cancellation.
//
// ## Modes
//
// Exactly one `PendingBlockMode` is in force while a pending block exists:
//
// - **Producing**: this node owns the current slot; the pending block will be
//   finalized, signed, and committed at its deadline.
// - **Speculating**: the node assembles a local view of the next block but
//   discards it when a peer block arrives.
//
// Mode selection runs at the top of every `start_block` and any failed check
// demotes to speculating; the mode is never durable across restarts.

use std::collections::{BTreeSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use palisade_primitives::block::{BlockNumber, BlockState, SignedBlock};
use palisade_primitives::chain::ChainConfig;
use palisade_primitives::schedule::ProducerKey;
use palisade_primitives::transaction::TransactionMeta;
use palisade_primitives::{AccountName, Timestamp};
use palisade_signer::{SignerError, SignerRegistry};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use super::metrics::ProducerMetrics;
use super::timer::{FiredTimer, ProductionTimer, TimerAction};
use super::verify::{SignatureWorkerPool, TxResponder, TxSubmission};
use super::{IntegrityHashInfo, PendingBlockMode, SnapshotInfo, LOG_TARGET, TRX_LOG_TARGET};
use crate::config::RuntimeOptions;
use crate::controller::{Controller, PendingBlockHeader, ReadMode};
use crate::error::{ControllerError, ProducerError, TransactionError};
use crate::events::{ConfirmedBlock, ProducerEvents, TransactionAck};
use crate::tables::{ProducerWatermarks, TxExpiryIndex};

/// Outcome of one assembly cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StartBlockResult {
    /// All pools drained before the preprocess deadline.
    Succeeded,
    /// Unrecoverable controller error; retry shortly.
    Failed,
    /// No suitable action right now (read-only mode, or speculation paused
    /// while the chain is stale).
    Waiting,
    /// The preprocess deadline elapsed before the pools drained.
    Exhausted,
}

enum TxCategory {
    Persisted,
    UnexpiredUnpersisted,
    Expired,
}

pub(crate) struct BlockProducer<C: Controller> {
    controller: Arc<C>,
    chain: ChainConfig,
    signers: Arc<SignerRegistry>,
    producers: BTreeSet<AccountName>,
    events: ProducerEvents,
    verify_pool: SignatureWorkerPool,
    /// Route by which verified submissions re-enter the loop.
    verified_tx: mpsc::UnboundedSender<TxSubmission>,
    pub(super) timer: ProductionTimer,

    production_enabled: bool,
    production_paused: bool,
    pending_block_mode: PendingBlockMode,

    persistent_transactions: TxExpiryIndex,
    blacklisted_transactions: TxExpiryIndex,
    pending_incoming: VecDeque<TxSubmission>,
    watermarks: ProducerWatermarks,

    max_transaction_time_ms: i32,
    max_irreversible_block_age_s: i32,
    produce_time_offset_us: i32,
    last_block_time_offset_us: i32,
    max_scheduled_transaction_time_per_block_ms: i32,
    incoming_defer_ratio: f64,
    /// Running credit for incoming transactions while retiring scheduled
    /// ones; see the interleave in phase D.
    incoming_tx_weight: f64,

    irreversible_block_time: Timestamp,
    last_signed_block_time: Timestamp,
    last_signed_block_num: BlockNumber,
    start_time: Timestamp,

    snapshots_dir: PathBuf,
    metrics: ProducerMetrics,

    /// Set when the controller reports an unrecoverable condition; the event
    /// loop exits with the matching process code.
    pub(super) fatal: Option<ControllerError>,
}

pub(crate) struct BlockProducerArgs<C: Controller> {
    pub controller: Arc<C>,
    pub chain: ChainConfig,
    pub signers: Arc<SignerRegistry>,
    pub producers: BTreeSet<AccountName>,
    pub events: ProducerEvents,
    pub verify_pool: SignatureWorkerPool,
    pub verified_tx: mpsc::UnboundedSender<TxSubmission>,
    pub enable_stale_production: bool,
    pub pause_on_startup: bool,
    pub max_transaction_time_ms: i32,
    pub max_irreversible_block_age_s: i32,
    pub produce_time_offset_us: i32,
    pub last_block_time_offset_us: i32,
    pub max_scheduled_transaction_time_per_block_ms: i32,
    pub incoming_defer_ratio: f64,
    pub snapshots_dir: PathBuf,
}

impl<C: Controller> BlockProducer<C> {
    pub fn new(args: BlockProducerArgs<C>) -> Self {
        Self {
            controller: args.controller,
            chain: args.chain,
            signers: args.signers,
            producers: args.producers,
            events: args.events,
            verify_pool: args.verify_pool,
            verified_tx: args.verified_tx,
            timer: ProductionTimer::new(),
            production_enabled: args.enable_stale_production,
            production_paused: args.pause_on_startup,
            pending_block_mode: PendingBlockMode::Speculating,
            persistent_transactions: TxExpiryIndex::default(),
            blacklisted_transactions: TxExpiryIndex::default(),
            pending_incoming: VecDeque::new(),
            watermarks: ProducerWatermarks::default(),
            max_transaction_time_ms: args.max_transaction_time_ms,
            max_irreversible_block_age_s: args.max_irreversible_block_age_s,
            produce_time_offset_us: args.produce_time_offset_us,
            last_block_time_offset_us: args.last_block_time_offset_us,
            max_scheduled_transaction_time_per_block_ms: args
                .max_scheduled_transaction_time_per_block_ms,
            incoming_defer_ratio: args.incoming_defer_ratio,
            incoming_tx_weight: 0.0,
            irreversible_block_time: Timestamp::MAX,
            last_signed_block_time: Timestamp::ZERO,
            last_signed_block_num: 0,
            start_time: Timestamp::now(),
            snapshots_dir: args.snapshots_dir,
            metrics: ProducerMetrics::default(),
            fatal: None,
        }
    }

    pub fn pending_block_mode(&self) -> PendingBlockMode {
        self.pending_block_mode
    }

    pub(super) fn local_producer_count(&self) -> usize {
        self.producers.len()
    }

    /// Tear-down: invalidate the timer and kill remote signers. No new work
    /// is dispatched after this returns; the verify pool drains on drop.
    pub(super) fn stop(&mut self) {
        self.timer.cancel();
        self.signers.revoke_remote();
    }

    // --- policy helpers ---

    fn irreversible_block_age(&self, now: Timestamp) -> Duration {
        now.saturating_since(self.irreversible_block_time)
    }

    fn max_irreversible_block_age(&self) -> Option<Duration> {
        u64::try_from(self.max_irreversible_block_age_s).ok().map(Duration::from_secs)
    }

    fn production_disabled_by_policy(&self) -> bool {
        if !self.production_enabled || self.production_paused {
            return true;
        }
        match self.max_irreversible_block_age() {
            Some(max_age) => self.irreversible_block_age(Timestamp::now()) >= max_age,
            None => false,
        }
    }

    /// The next slot boundary at or after `max(now, head_block_time)`. When
    /// the boundary is closer than a tenth of the interval there is not
    /// enough time to assemble anything useful, so the following slot is
    /// taken instead.
    fn calculate_pending_block_time(&self) -> Timestamp {
        let now = Timestamp::now();
        let base = now.max(self.controller.head_block_time());
        let interval = self.chain.block_interval_us();

        let min_time_to_next_block = interval - (base.as_micros() % interval);
        let mut block_time = base.offset_micros(min_time_to_next_block);

        if block_time.saturating_since(now) < Duration::from_micros((interval / 10) as u64) {
            block_time = block_time.offset_micros(interval);
        }
        block_time
    }

    /// Wall-clock deadline for shipping the block at `block_time`. The last
    /// repetition in a producer's round gets its own offset so the handoff to
    /// the next producer can be tuned separately.
    fn calculate_block_deadline(&self, block_time: Timestamp) -> Timestamp {
        let last_block = self.chain.is_last_slot_in_round(self.chain.slot_of(block_time));
        let offset_us =
            if last_block { self.last_block_time_offset_us } else { self.produce_time_offset_us };
        block_time.offset_micros(offset_us as i64)
    }

    /// The earliest future slot at which `producer` may produce, given the
    /// active schedule and its watermark. `None` when the producer is not in
    /// the active schedule.
    fn calculate_next_block_time(
        &self,
        producer: &AccountName,
        base_time: Timestamp,
    ) -> Option<Timestamp> {
        let hbs = self.controller.head_block_state();
        let schedule = &hbs.active_schedule;
        let producer_index = schedule.position_of(producer)? as u64;

        let schedule_len = schedule.producers.len() as u64;
        let reps = self.chain.producer_repetitions as u64;

        // A watermark in the future disqualifies this producer until the head
        // passes it. This is conservative and assumes no blocks are dropped;
        // if they are, the producer wakes up, finds itself still disqualified
        // and recalculates with better information.
        let mut minimum_offset = 1u64;
        if let Some(watermark) = self.watermarks.get(producer) {
            let mut block_num = hbs.block_num;
            if self.controller.pending_block().is_some() {
                block_num += 1;
            }
            if watermark > block_num {
                minimum_offset = watermark - block_num + 1;
            }
        }

        let minimum_slot = self.chain.slot_of(base_time) + minimum_offset;
        let minimum_slot_producer_index = (minimum_slot % (schedule_len * reps)) / reps;

        if producer_index == minimum_slot_producer_index {
            return Some(self.chain.slot_time(minimum_slot));
        }

        // rounds between the minimum slot's producer and this producer
        let mut producer_distance = producer_index as i64 - minimum_slot_producer_index as i64;
        if producer_distance < 0 {
            producer_distance += schedule_len as i64;
        }

        // align the minimum slot to the first of its repetitions, then offset
        // to this producer's earliest set of slots
        let first_minimum_producer_slot = minimum_slot - (minimum_slot % reps);
        let next_block_slot = first_minimum_producer_slot + (producer_distance as u64 * reps);
        Some(self.chain.slot_time(next_block_slot))
    }

    // --- assembly ---

    /// Best-effort drain of all pending work into a fresh pending block,
    /// bounded by the preprocess deadline. Phases run in strict order:
    /// expire persisted, replay unapplied, expire blacklist, retire scheduled
    /// (producing only, interleaved with incoming), drain incoming.
    pub(super) fn start_block(&mut self) -> StartBlockResult {
        if self.controller.read_mode() == ReadMode::ReadOnly {
            return StartBlockResult::Waiting;
        }

        let hbs = self.controller.head_block_state();
        let now = Timestamp::now();
        let block_time = self.calculate_pending_block_time();

        self.pending_block_mode = PendingBlockMode::Producing;

        let scheduled_producer: ProducerKey = hbs
            .active_schedule
            .scheduled_producer(self.chain.slot_of(block_time), self.chain.producer_repetitions)
            .clone();
        let watermark = self.watermarks.get(&scheduled_producer.producer_name);
        let irreversible_block_age = self.irreversible_block_age(now);

        if !self.production_enabled {
            self.pending_block_mode = PendingBlockMode::Speculating;
        } else if !self.producers.contains(&scheduled_producer.producer_name) {
            self.pending_block_mode = PendingBlockMode::Speculating;
        } else if !self.signers.contains(&scheduled_producer.signing_key) {
            warn!(
                target: LOG_TARGET,
                scheduled_key = %scheduled_producer.signing_key,
                "Not producing block because I don't have the private key for the scheduled key."
            );
            self.pending_block_mode = PendingBlockMode::Speculating;
        } else if self.production_paused {
            warn!(target: LOG_TARGET, "Not producing block because production is explicitly paused.");
            self.pending_block_mode = PendingBlockMode::Speculating;
        } else if self
            .max_irreversible_block_age()
            .is_some_and(|max_age| irreversible_block_age >= max_age)
        {
            warn!(
                target: LOG_TARGET,
                age = ?irreversible_block_age,
                "Not producing block because the irreversible block is too old."
            );
            self.pending_block_mode = PendingBlockMode::Speculating;
        }

        if self.pending_block_mode == PendingBlockMode::Producing {
            // the watermark can exceed the head on a different fork; signing
            // at or below it would be a double sign
            if let Some(watermark) = watermark {
                if watermark >= hbs.block_num + 1 {
                    warn!(
                        target: LOG_TARGET,
                        producer = %scheduled_producer.producer_name,
                        watermark,
                        head_block_num = hbs.block_num,
                        "Not producing block because this producer signed a block at a higher \
                         height than the current fork's head."
                    );
                    self.pending_block_mode = PendingBlockMode::Speculating;
                }
            }
        }

        if self.pending_block_mode == PendingBlockMode::Speculating {
            let head_block_age = now.saturating_since(self.controller.head_block_time());
            if head_block_age > Duration::from_secs(5) {
                return StartBlockResult::Waiting;
            }
        }

        let mut blocks_to_confirm = 0u16;
        if self.pending_block_mode == PendingBlockMode::Producing {
            // How many recent blocks this producer can safely confirm:
            // nothing on a fresh watermark (conservative after a crash), the
            // distance to the watermark otherwise, zero when the watermark is
            // at or past the head (a different fork).
            if let Some(watermark) = watermark {
                if watermark < hbs.block_num {
                    blocks_to_confirm =
                        u16::try_from(hbs.block_num - watermark).unwrap_or(u16::MAX);
                }
            }
        }

        self.controller.abort_block();
        if let Err(err) = self.controller.start_block(block_time, blocks_to_confirm) {
            if err.is_fatal() {
                self.fatal = Some(err.clone());
            }
            error!(target: LOG_TARGET, %err, "Failed to start block.");
            return StartBlockResult::Failed;
        }

        let Some(pending) = self.controller.pending_block() else {
            return StartBlockResult::Failed;
        };

        let preprocess_deadline = self.calculate_block_deadline(block_time);

        if self.pending_block_mode == PendingBlockMode::Producing
            && pending.signing_key != scheduled_producer.signing_key
        {
            warn!(
                target: LOG_TARGET,
                expected = %scheduled_producer.signing_key,
                actual = %pending.signing_key,
                "Block signing key is not expected value, reverting to speculative mode."
            );
            self.pending_block_mode = PendingBlockMode::Speculating;
        }

        self.apply_pending_work(&pending, preprocess_deadline)
    }

    /// Phases A through E against an open pending block.
    fn apply_pending_work(
        &mut self,
        pending: &PendingBlockHeader,
        preprocess_deadline: Timestamp,
    ) -> StartBlockResult {
        let mut exhausted = false;

        // Phase A: drop persisted transactions that expired before the
        // pending block's own timestamp.
        let orig_persisted = self.persistent_transactions.len();
        let num_expired = self.persistent_transactions.expire_through(pending.timestamp);
        if num_expired > 0 {
            debug!(
                target: LOG_TARGET,
                total = orig_persisted,
                expired = num_expired,
                "Processed persisted transactions."
            );
        }

        // Only entries queued before this cycle started are drained below;
        // anything re-queued by a subjective failure waits for the next one.
        let mut incoming_budget = self.pending_incoming.len();

        // Phase B: replay the unapplied set.
        if self.producers.is_empty() && self.persistent_transactions.is_empty() {
            // a pure relay node has no use for unapplied transactions
            self.controller.drop_all_unapplied_transactions();
        } else {
            let unapplied = self.controller.unapplied_transactions();
            let mut apply_trxs: Vec<Arc<TransactionMeta>> = Vec::with_capacity(unapplied.len());

            for trx in unapplied {
                let category = self.categorize(&trx, pending.timestamp);
                match category {
                    TxCategory::Expired => {
                        if !self.producers.is_empty() {
                            debug!(
                                target: TRX_LOG_TARGET,
                                tx = %trx.id(),
                                "Dropping an expired transaction that was previously accepted."
                            );
                        }
                        self.controller.drop_unapplied_transaction(&trx.id());
                    }
                    TxCategory::UnexpiredUnpersisted if self.producers.is_empty() => {
                        self.controller.drop_unapplied_transaction(&trx.id());
                    }
                    TxCategory::Persisted => apply_trxs.push(trx),
                    TxCategory::UnexpiredUnpersisted => {
                        if self.pending_block_mode == PendingBlockMode::Producing {
                            apply_trxs.push(trx);
                        }
                    }
                }
            }

            if !apply_trxs.is_empty() {
                let mut num_applied: u64 = 0;
                let mut num_failed: u64 = 0;
                let mut num_processed = 0;
                let total = apply_trxs.len();

                for trx in apply_trxs {
                    if preprocess_deadline <= Timestamp::now() {
                        exhausted = true;
                    }
                    if exhausted {
                        break;
                    }
                    num_processed += 1;

                    let (deadline, deadline_is_subjective) =
                        self.transaction_deadline(preprocess_deadline);

                    match self.controller.push_transaction(&trx, deadline) {
                        Ok(trace) => match trace.error {
                            Some(err) if err.is_subjective(deadline_is_subjective) => {
                                exhausted = true;
                            }
                            Some(_) => {
                                // failed on its own terms, not worth replaying
                                self.controller.drop_unapplied_transaction(&trx.id());
                                num_failed += 1;
                            }
                            None => num_applied += 1,
                        },
                        Err(err) => {
                            if err.is_fatal() {
                                self.fatal = Some(err);
                                return StartBlockResult::Failed;
                            }
                            error!(target: LOG_TARGET, %err, "Failed to push unapplied transaction.");
                        }
                    }
                }

                self.metrics.transactions_applied_total.increment(num_applied);
                self.metrics.transactions_failed_total.increment(num_failed);
                debug!(
                    target: LOG_TARGET,
                    processed = num_processed,
                    total,
                    applied = num_applied,
                    failed = num_failed,
                    "Processed previously applied transactions."
                );
            }
        }

        if self.pending_block_mode == PendingBlockMode::Producing {
            let result = self.retire_scheduled_transactions(
                preprocess_deadline,
                &mut incoming_budget,
                &mut exhausted,
            );
            if let Some(result) = result {
                return result;
            }
        }

        if exhausted || preprocess_deadline <= Timestamp::now() {
            return StartBlockResult::Exhausted;
        }

        // Phase E: drain whatever incoming budget remains.
        self.incoming_tx_weight = 0.0;
        if !self.pending_incoming.is_empty() {
            debug!(
                target: LOG_TARGET,
                count = incoming_budget,
                "Processing pending incoming transactions."
            );
            while incoming_budget > 0 && !self.pending_incoming.is_empty() {
                if let Some(submission) = self.pending_incoming.pop_front() {
                    incoming_budget -= 1;
                    self.process_incoming_transaction(submission);
                }
                if preprocess_deadline <= Timestamp::now() {
                    return StartBlockResult::Exhausted;
                }
            }
        }

        StartBlockResult::Succeeded
    }

    /// Phases C and D: expire the blacklist, then retire due scheduled
    /// transactions under their own tighter deadline, paying down queued
    /// incoming transactions at `incoming_defer_ratio` along the way.
    ///
    /// Returns `Some` to short-circuit the whole cycle (fatal failure).
    fn retire_scheduled_transactions(
        &mut self,
        preprocess_deadline: Timestamp,
        incoming_budget: &mut usize,
        exhausted: &mut bool,
    ) -> Option<StartBlockResult> {
        let now = Timestamp::now();

        let orig_blacklist = self.blacklisted_transactions.len();
        let num_expired = self.blacklisted_transactions.expire_through(now);
        if num_expired > 0 {
            debug!(
                target: LOG_TARGET,
                total = orig_blacklist,
                expired = num_expired,
                "Processed blacklisted transactions."
            );
        }

        let scheduled_trxs = self.controller.scheduled_transactions();
        if scheduled_trxs.is_empty() {
            return None;
        }

        let mut num_applied: u64 = 0;
        let mut num_failed: u64 = 0;
        let mut num_processed = 0;
        let total = scheduled_trxs.len();

        let mut scheduled_trx_deadline = preprocess_deadline;
        if self.max_scheduled_transaction_time_per_block_ms >= 0 {
            scheduled_trx_deadline = scheduled_trx_deadline.min(
                Timestamp::now()
                    + Duration::from_millis(self.max_scheduled_transaction_time_per_block_ms as u64),
            );
        }

        for trx_id in scheduled_trxs {
            if scheduled_trx_deadline <= Timestamp::now() {
                *exhausted = true;
            }
            if *exhausted {
                break;
            }
            num_processed += 1;

            // pay down the incoming queue at the configured ratio before
            // spending time on another deferred transaction
            while self.incoming_tx_weight >= 1.0
                && *incoming_budget > 0
                && !self.pending_incoming.is_empty()
            {
                if scheduled_trx_deadline <= Timestamp::now() {
                    break;
                }
                if let Some(submission) = self.pending_incoming.pop_front() {
                    *incoming_budget -= 1;
                    self.incoming_tx_weight -= 1.0;
                    self.process_incoming_transaction(submission);
                }
            }

            if scheduled_trx_deadline <= Timestamp::now() {
                *exhausted = true;
                break;
            }

            if self.blacklisted_transactions.contains(&trx_id) {
                continue;
            }

            let (deadline, deadline_is_subjective) =
                self.transaction_deadline(scheduled_trx_deadline);

            match self.controller.push_scheduled_transaction(trx_id, deadline) {
                Ok(trace) => match trace.error {
                    Some(err) if err.is_subjective(deadline_is_subjective) => {
                        *exhausted = true;
                    }
                    Some(_) => {
                        // deterministic failure; keep it off the schedule
                        // until its expiration window has passed
                        let expiry =
                            Timestamp::now() + self.controller.deferred_tx_expiration_window();
                        self.blacklisted_transactions.insert(trx_id, expiry);
                        num_failed += 1;
                    }
                    None => num_applied += 1,
                },
                Err(err) => {
                    if err.is_fatal() {
                        self.fatal = Some(err);
                        return Some(StartBlockResult::Failed);
                    }
                    error!(target: LOG_TARGET, %err, "Failed to push scheduled transaction.");
                }
            }

            self.incoming_tx_weight += self.incoming_defer_ratio;
            if *incoming_budget == 0 {
                self.incoming_tx_weight = 0.0;
            }
        }

        self.metrics.transactions_applied_total.increment(num_applied);
        self.metrics.transactions_failed_total.increment(num_failed);
        debug!(
            target: LOG_TARGET,
            processed = num_processed,
            total,
            applied = num_applied,
            failed = num_failed,
            "Processed scheduled transactions."
        );

        None
    }

    fn categorize(&self, trx: &TransactionMeta, pending_block_time: Timestamp) -> TxCategory {
        if trx.expiration() < pending_block_time {
            TxCategory::Expired
        } else if self.persistent_transactions.contains(&trx.id()) {
            TxCategory::Persisted
        } else {
            TxCategory::UnexpiredUnpersisted
        }
    }

    /// Per-transaction deadline: the submitter-facing execution limit, capped
    /// by the assembly deadline. The deadline is subjective when the cap (a
    /// local concern) is the binding constraint.
    fn transaction_deadline(&self, cap: Timestamp) -> (Timestamp, bool) {
        let mut deadline =
            Timestamp::now() + Duration::from_millis(self.max_transaction_time_ms.max(0) as u64);
        let mut subjective = false;
        if self.max_transaction_time_ms < 0
            || (self.pending_block_mode == PendingBlockMode::Producing && cap < deadline)
        {
            subjective = true;
            deadline = cap;
        }
        (deadline, subjective)
    }

    // --- incoming transactions ---

    /// Entry point for a transaction from the network or RPC. Returns
    /// immediately; signature recovery runs on the worker pool and the
    /// admission continues on the event loop once it completes.
    pub(super) fn submit_transaction(
        &self,
        tx: Arc<TransactionMeta>,
        persist_until_expired: bool,
        responder: Option<TxResponder>,
    ) {
        let submission = TxSubmission { tx, persist_until_expired, responder };

        let job = Arc::clone(&submission.tx);
        let recovery = self.verify_pool.spawn(move || {
            job.recover_keys();
        });

        let done = self.verified_tx.clone();
        tokio::spawn(async move {
            // a panicked recovery still admits the transaction; its keys stay
            // unrecovered and authority checks reject it deterministically
            if let Err(err) = recovery.await {
                warn!(
                    target: LOG_TARGET,
                    tx = %submission.tx.id(),
                    %err,
                    "Signature recovery failed."
                );
            }
            // the loop may already be shutting down; dropping the submission
            // also drops its responder, which the submitter observes
            let _ = done.send(submission);
        });
    }

    /// Admission of a signature-verified transaction into the pending block,
    /// or into the queue when none exists.
    pub(super) fn process_incoming_transaction(&mut self, submission: TxSubmission) {
        let Some(pending) = self.controller.pending_block() else {
            self.pending_incoming.push_back(submission);
            return;
        };
        let block_time = pending.timestamp;
        let id = submission.tx.id();

        if submission.tx.expiration() < block_time {
            self.respond(submission, Err(TransactionError::ExpiredTx(id)), &pending);
            return;
        }

        if self.controller.is_known_unexpired_transaction(&id) {
            self.respond(submission, Err(TransactionError::TxDuplicate(id)), &pending);
            return;
        }

        let block_deadline = self.calculate_block_deadline(block_time);
        let (deadline, deadline_is_subjective) = self.transaction_deadline(block_deadline);

        match self.controller.push_transaction(&submission.tx, deadline) {
            Ok(trace) => match trace.error.clone() {
                Some(err) if err.is_subjective(deadline_is_subjective) => {
                    match self.pending_block_mode {
                        PendingBlockMode::Producing => debug!(
                            target: TRX_LOG_TARGET,
                            block_num = pending.number,
                            producer = %pending.producer,
                            tx = %id,
                            "Block could not fit transaction, retrying."
                        ),
                        PendingBlockMode::Speculating => debug!(
                            target: TRX_LOG_TARGET,
                            tx = %id,
                            "Speculative execution could not fit transaction, retrying."
                        ),
                    }
                    self.pending_incoming.push_back(submission);
                }
                Some(err) => self.respond(submission, Err(err), &pending),
                None => {
                    if submission.persist_until_expired {
                        // replay into every future speculative block until it
                        // expires or is included
                        self.persistent_transactions.insert(id, submission.tx.expiration());
                    }
                    self.respond(submission, Ok(trace), &pending);
                }
            },
            Err(err) => {
                if err.is_fatal() {
                    self.fatal = Some(err);
                } else {
                    self.respond(
                        submission,
                        Err(TransactionError::Execution(err.to_string())),
                        &pending,
                    );
                }
            }
        }
    }

    /// Publishes the outcome on the ack channel and fires the responder.
    fn respond(
        &self,
        submission: TxSubmission,
        result: Result<crate::controller::TxTrace, TransactionError>,
        pending: &PendingBlockHeader,
    ) {
        let TxSubmission { tx, responder, .. } = submission;

        match (&result, self.pending_block_mode) {
            (Ok(_), PendingBlockMode::Producing) => debug!(
                target: TRX_LOG_TARGET,
                block_num = pending.number,
                producer = %pending.producer,
                tx = %tx.id(),
                "Block is accepting transaction."
            ),
            (Ok(_), PendingBlockMode::Speculating) => debug!(
                target: TRX_LOG_TARGET,
                tx = %tx.id(),
                "Speculative execution is accepting transaction."
            ),
            (Err(why), PendingBlockMode::Producing) => debug!(
                target: TRX_LOG_TARGET,
                block_num = pending.number,
                producer = %pending.producer,
                tx = %tx.id(),
                %why,
                "Block is rejecting transaction."
            ),
            (Err(why), PendingBlockMode::Speculating) => debug!(
                target: TRX_LOG_TARGET,
                tx = %tx.id(),
                %why,
                "Speculative execution is rejecting transaction."
            ),
        }

        self.events
            .publish_transaction_ack(TransactionAck { tx, error: result.as_ref().err().cloned() });
        if let Some(responder) = responder {
            let _ = responder.send(result);
        }
    }

    // --- scheduler ---

    /// One turn of the production loop: assemble, then re-arm the timer for
    /// whatever comes next.
    pub(super) fn schedule_production_loop(&mut self) {
        self.timer.cancel();

        let result = self.start_block();

        match result {
            StartBlockResult::Failed => {
                warn!(target: LOG_TARGET, "Failed to start a pending block, will try again later.");
                self.timer.arm_in(self.chain.block_interval / 10, TimerAction::RestartLoop);
            }

            StartBlockResult::Waiting => {
                if !self.producers.is_empty() && !self.production_disabled_by_policy() {
                    debug!(
                        target: LOG_TARGET,
                        "Waiting till another block is received and scheduling production change."
                    );
                    let base = self.calculate_pending_block_time();
                    self.schedule_delayed_production_loop(base);
                } else {
                    debug!(target: LOG_TARGET, "Waiting till another block is received.");
                }
            }

            StartBlockResult::Succeeded | StartBlockResult::Exhausted
                if self.pending_block_mode == PendingBlockMode::Producing =>
            {
                let Some(pending) = self.controller.pending_block() else {
                    warn!(target: LOG_TARGET, "Producing without a pending block, retrying.");
                    self.timer.arm_in(self.chain.block_interval / 10, TimerAction::RestartLoop);
                    return;
                };

                let deadline = self.calculate_block_deadline(pending.timestamp);
                if deadline > Timestamp::now() {
                    // ship this block off no later than its deadline
                    debug!(
                        target: LOG_TARGET,
                        block_num = pending.number,
                        at = %deadline,
                        "Scheduling block production on normal block."
                    );
                    self.timer.arm_at(deadline, TimerAction::ProduceBlock);
                } else {
                    // past the deadline already: ship up to one block time
                    // earlier than the pending timestamp, or immediately
                    let expect_time = pending.timestamp - self.chain.block_interval;
                    if Timestamp::now() >= expect_time {
                        debug!(
                            target: LOG_TARGET,
                            block_num = pending.number,
                            "Scheduling block production on exhausted block immediately."
                        );
                        self.timer.arm_in(Duration::ZERO, TimerAction::ProduceBlock);
                    } else {
                        debug!(
                            target: LOG_TARGET,
                            block_num = pending.number,
                            at = %expect_time,
                            "Scheduling block production on exhausted block."
                        );
                        self.timer.arm_at(expect_time, TimerAction::ProduceBlock);
                    }
                }
            }

            StartBlockResult::Succeeded | StartBlockResult::Exhausted => {
                // speculating
                if !self.producers.is_empty() && !self.production_disabled_by_policy() {
                    debug!(
                        target: LOG_TARGET,
                        "Speculative block created; scheduling production change."
                    );
                    if let Some(pending) = self.controller.pending_block() {
                        self.schedule_delayed_production_loop(pending.timestamp);
                    }
                } else {
                    debug!(target: LOG_TARGET, "Speculative block created.");
                }
            }
        }
    }

    /// Arms the timer for the earliest future slot owned by any local
    /// producer, waking one block interval before the slot so there is a full
    /// interval to assemble.
    fn schedule_delayed_production_loop(&mut self, base_time: Timestamp) {
        let mut wake_up_time: Option<Timestamp> = None;
        for producer in &self.producers {
            if let Some(next_block_time) = self.calculate_next_block_time(producer, base_time) {
                let producer_wake_up_time = next_block_time - self.chain.block_interval;
                wake_up_time = Some(match wake_up_time {
                    Some(current) => current.min(producer_wake_up_time),
                    None => producer_wake_up_time,
                });
            }
        }

        if let Some(wake_up_time) = wake_up_time {
            debug!(target: LOG_TARGET, at = %wake_up_time, "Scheduling production change.");
            self.timer.arm_at(wake_up_time, TimerAction::RestartLoop);
        } else {
            debug!(
                target: LOG_TARGET,
                "Not scheduling production change, no local producers had valid wake up times."
            );
        }
    }

    /// Timer callback. Returns `false` for a stale correlation id, which
    /// makes the no-op observable to tests.
    pub(super) fn on_timer(&mut self, fired: FiredTimer) -> bool {
        if !self.timer.is_current(&fired) {
            trace!(target: LOG_TARGET, "Dropping stale timer callback.");
            return false;
        }

        match fired.action {
            TimerAction::RestartLoop => self.schedule_production_loop(),
            TimerAction::ProduceBlock => {
                let produced = self.maybe_produce_block();
                debug!(target: LOG_TARGET, produced, "Producing block returned.");
            }
        }
        true
    }

    pub(super) fn maybe_produce_block(&mut self) -> bool {
        let produced = match self.produce_block() {
            Ok(()) => true,
            Err(err) => {
                if let ProducerError::Controller(ref controller_err) = err {
                    if controller_err.is_fatal() {
                        self.fatal = Some(controller_err.clone());
                    }
                }
                debug!(target: LOG_TARGET, %err, "Aborting block due to produce_block error.");
                self.controller.abort_block();
                false
            }
        };

        // the loop is re-armed on every exit path
        self.schedule_production_loop();
        produced
    }

    fn produce_block(&mut self) -> Result<(), ProducerError> {
        if self.pending_block_mode != PendingBlockMode::Producing {
            return Err(ProducerError::NotProducing);
        }
        let pending = self.controller.pending_block().ok_or(ProducerError::MissingPendingBlock)?;
        if !self.signers.contains(&pending.signing_key) {
            return Err(SignerError::KeyNotFound(pending.signing_key).into());
        }

        self.controller.finalize_block()?;

        let signers = Arc::clone(&self.signers);
        let signing_key = pending.signing_key;
        let signing_started = std::time::Instant::now();
        self.controller.sign_block(&|digest| signers.sign(&signing_key, digest))?;
        trace!(target: LOG_TARGET, elapsed = ?signing_started.elapsed(), "Signing took.");

        self.controller.commit_block()?;

        let new_head = self.controller.head_block_state();
        self.watermarks.observe(&new_head.header.producer, new_head.block_num);
        self.metrics.blocks_produced_total.increment(1);

        info!(
            target: LOG_TARGET,
            id = %format!("{:.16}", new_head.id.to_string()),
            block_num = new_head.block_num,
            timestamp = %new_head.header.timestamp,
            producer = %new_head.header.producer,
            trxs = new_head.transaction_count,
            lib = self.controller.last_irreversible_block_num(),
            confirmed = new_head.header.confirmed,
            "Produced block."
        );
        Ok(())
    }

    // --- incoming blocks ---

    /// Handles a peer block, then re-arms the loop regardless of the outcome.
    pub(super) fn on_incoming_block(&mut self, block: Arc<SignedBlock>) -> Result<(), ProducerError> {
        let result = self.handle_incoming_block(&block);

        match &result {
            Err(ProducerError::BlockFromTheFuture { id }) => {
                warn!(target: LOG_TARGET, block = %id, "Received a block from the future, ignoring it.");
            }
            Err(ProducerError::Controller(err)) if err.is_fatal() => {
                self.fatal = Some(err.clone());
            }
            Err(err) => error!(target: LOG_TARGET, %err, "Failed to handle incoming block."),
            Ok(()) => {}
        }

        self.schedule_production_loop();
        result
    }

    fn handle_incoming_block(&mut self, block: &Arc<SignedBlock>) -> Result<(), ProducerError> {
        let id = block.id();
        debug!(target: LOG_TARGET, block = %id, "Received incoming block.");

        let now = Timestamp::now();
        if block.header.timestamp > now + Duration::from_secs(7) {
            return Err(ProducerError::BlockFromTheFuture { id });
        }

        if self.controller.contains_block(&id) {
            return Ok(());
        }

        let future = self.controller.create_block_state_future(Arc::clone(block));

        // the peer block must be applied on a clean head; whatever was
        // assembled locally for this slot is discarded
        self.controller.abort_block();

        match self.controller.push_block(future) {
            Ok(()) => {}
            Err(err) if err.is_fatal() => return Err(err.into()),
            Err(err) => {
                error!(target: LOG_TARGET, %err, block = %id, "Controller rejected block.");
                self.metrics.blocks_rejected_total.increment(1);
                self.events.publish_rejected_block(id);
                return Ok(());
            }
        }

        self.metrics.blocks_received_total.increment(1);

        // if the head's next slot is in the present or future, we are synced
        let head_time = self.controller.head_block_time();
        let next_slot_time = self.chain.slot_time(self.chain.slot_of(head_time) + 1);
        if next_slot_time >= Timestamp::now() {
            self.production_enabled = true;
        }

        let age = Timestamp::now().saturating_since(block.header.timestamp);
        if age < Duration::from_secs(300) || block.header.number % 1000 == 0 {
            info!(
                target: LOG_TARGET,
                id = %format!("{:.16}", id.to_string()),
                block_num = block.header.number,
                timestamp = %block.header.timestamp,
                producer = %block.header.producer,
                trxs = block.transactions.len(),
                lib = self.controller.last_irreversible_block_num(),
                confirmed = block.header.confirmed,
                latency_ms = age.as_millis() as u64,
                "Received block."
            );
        }

        Ok(())
    }

    /// Runs when the controller reports a validated block, local or remote.
    ///
    /// A local producer in the block's schedule that did not author it casts
    /// a BFT-style pre-confirmation by signing the block's digest. When the
    /// block promotes a new schedule version, producers newly in the schedule
    /// get their watermark seeded at the current head so they can never sign
    /// historical heights.
    pub(super) fn on_accepted_block(&mut self, bsp: &BlockState) {
        if bsp.header.timestamp <= self.last_signed_block_time {
            return;
        }
        if bsp.header.timestamp <= self.start_time {
            return;
        }
        if bsp.block_num <= self.last_signed_block_num {
            return;
        }

        for producer in &self.producers {
            if producer == &bsp.header.producer {
                continue;
            }
            let Some(signing_key) = bsp.active_schedule.key_of(producer) else {
                continue;
            };
            if !self.signers.contains(signing_key) {
                continue;
            }

            let digest = bsp.sig_digest();
            match self.signers.sign(signing_key, &digest) {
                Ok(signature) => {
                    self.last_signed_block_time = bsp.header.timestamp;
                    self.last_signed_block_num = bsp.block_num;
                    self.events.publish_confirmed_block(ConfirmedBlock {
                        block_id: bsp.id,
                        digest,
                        producer: producer.clone(),
                        signature,
                    });
                }
                Err(err) => {
                    warn!(target: LOG_TARGET, %err, %producer, "Failed to sign block confirmation.");
                }
            }
        }

        if let Some(promoted) = &bsp.promoted_schedule {
            if promoted.version != bsp.active_schedule.version {
                for key in &promoted.producers {
                    let name = &key.producer_name;
                    if self.producers.contains(name) && !bsp.active_schedule.contains(name) {
                        self.watermarks.observe(name, bsp.block_num);
                    }
                }
            }
        }
    }

    pub(super) fn on_irreversible_block(&mut self, block: &SignedBlock) {
        self.irreversible_block_time = block.header.timestamp;
    }

    // --- control surface ---

    pub(super) fn pause(&mut self) {
        self.production_paused = true;
    }

    pub(super) fn resume(&mut self) {
        self.production_paused = false;
        // we may have been speculating only because of the pause policy;
        // re-evaluate the mode now
        if self.pending_block_mode == PendingBlockMode::Speculating {
            self.controller.abort_block();
            self.schedule_production_loop();
        }
    }

    pub(super) fn paused(&self) -> bool {
        self.production_paused
    }

    pub(super) fn update_runtime_options(&mut self, options: RuntimeOptions) {
        let mut check_speculating = false;

        if let Some(value) = options.max_transaction_time_ms {
            self.max_transaction_time_ms = value;
        }
        if let Some(value) = options.max_irreversible_block_age_s {
            self.max_irreversible_block_age_s = value;
            check_speculating = true;
        }
        if let Some(value) = options.produce_time_offset_us {
            self.produce_time_offset_us = value;
        }
        if let Some(value) = options.last_block_time_offset_us {
            self.last_block_time_offset_us = value;
        }
        if let Some(value) = options.max_scheduled_transaction_time_per_block_ms {
            self.max_scheduled_transaction_time_per_block_ms = value;
        }
        if let Some(value) = options.incoming_defer_ratio {
            self.incoming_defer_ratio = value;
        }

        if check_speculating && self.pending_block_mode == PendingBlockMode::Speculating {
            self.controller.abort_block();
            self.schedule_production_loop();
        }

        if let Some(value) = options.subjective_cpu_leeway_us {
            self.controller.set_subjective_cpu_leeway(Duration::from_micros(value.max(0) as u64));
        }
    }

    pub(super) fn runtime_options(&self) -> RuntimeOptions {
        RuntimeOptions {
            max_transaction_time_ms: Some(self.max_transaction_time_ms),
            max_irreversible_block_age_s: Some(self.max_irreversible_block_age_s),
            produce_time_offset_us: Some(self.produce_time_offset_us),
            last_block_time_offset_us: Some(self.last_block_time_offset_us),
            max_scheduled_transaction_time_per_block_ms: Some(
                self.max_scheduled_transaction_time_per_block_ms,
            ),
            subjective_cpu_leeway_us: None,
            incoming_defer_ratio: Some(self.incoming_defer_ratio),
        }
    }

    pub(super) fn add_greylist_accounts(&self, accounts: Vec<AccountName>) {
        for account in &accounts {
            self.controller.add_resource_greylist(account);
        }
    }

    pub(super) fn remove_greylist_accounts(&self, accounts: Vec<AccountName>) {
        for account in &accounts {
            self.controller.remove_resource_greylist(account);
        }
    }

    pub(super) fn greylist_accounts(&self) -> Vec<AccountName> {
        self.controller.resource_greylist()
    }

    /// Writes a snapshot of head state. A pending block would make the read
    /// inconsistent, so it is aborted first and the loop re-armed after.
    pub(super) fn create_snapshot(&mut self) -> Result<SnapshotInfo, ProducerError> {
        let had_pending = self.controller.pending_block().is_some();
        if had_pending {
            self.controller.abort_block();
        }

        let result = self.write_snapshot();

        if had_pending {
            self.schedule_production_loop();
        }
        result
    }

    fn write_snapshot(&self) -> Result<SnapshotInfo, ProducerError> {
        let head_block_id = self.controller.head_block_id();
        let path = self.snapshots_dir.join(format!("snapshot-{head_block_id}.bin"));

        if path.is_file() {
            return Err(ProducerError::SnapshotExists { path });
        }

        self.controller.write_snapshot(&path)?;
        info!(target: LOG_TARGET, path = %path.display(), "Wrote snapshot.");
        Ok(SnapshotInfo { head_block_id, snapshot_name: path })
    }

    /// Computes the integrity hash of head state, aborting any pending block
    /// first for the same consistency reason as snapshots.
    pub(super) fn integrity_hash(&mut self) -> IntegrityHashInfo {
        let had_pending = self.controller.pending_block().is_some();
        if had_pending {
            self.controller.abort_block();
        }

        let info = IntegrityHashInfo {
            head_block_id: self.controller.head_block_id(),
            integrity_hash: self.controller.integrity_hash(),
        };

        if had_pending {
            self.schedule_production_loop();
        }
        info
    }

    /// Seeds the irreversible-block clock from the controller at startup.
    pub(super) fn seed_irreversible_block_time(&mut self) {
        let lib_num = self.controller.last_irreversible_block_num();
        match self.controller.fetch_block_by_number(lib_num) {
            Some(lib) => self.on_irreversible_block(&lib),
            // no irreversible block yet; never consider the chain stale
            None => self.irreversible_block_time = Timestamp::MAX,
        }
    }

    #[cfg(test)]
    pub(super) fn pending_incoming_len(&self) -> usize {
        self.pending_incoming.len()
    }

    #[cfg(test)]
    pub(super) fn persistent_contains(&self, id: &palisade_primitives::TxId) -> bool {
        self.persistent_transactions.contains(id)
    }

    #[cfg(test)]
    pub(super) fn blacklist_contains(&self, id: &palisade_primitives::TxId) -> bool {
        self.blacklisted_transactions.contains(id)
    }

    #[cfg(test)]
    pub(super) fn watermark_of(&self, producer: &AccountName) -> Option<BlockNumber> {
        self.watermarks.get(producer)
    }

    #[cfg(test)]
    pub(super) fn set_watermark(&mut self, producer: &AccountName, number: BlockNumber) {
        self.watermarks.observe(producer, number);
    }
}
