//! Expiry Daemon
//!
//! Timer-driven sweep over the expiry index. Each cycle expires the due
//! items in `(expiry_time, id)` order under batched local transactions and,
//! every few cycles, runs a full clean of stale references. The cleanup
//! cadence adapts to how much each clean actually found.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock, RwLockUpgradableReadGuard};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, info_span, warn, Span};

use super::alarm::{Alarm, AlarmId, AlarmScheduler};
use super::{Expirable, ExpirableReference, ExpiryIndex, NO_ID};
use crate::config::{Properties, DEFAULT_EXPIRY_INTERVAL_MS, EXPIRY_INTERVAL};
use crate::error::{ExpiryError, Result, StoreError};
use crate::observability::{CycleHistory, DaemonDiagnostics, DumpNode};
use crate::storage::{Transaction, TransactionFactory};

/// Successful expirations per transaction
pub const BATCH_SIZE: usize = 20;
/// Initial (and minimum) number of cycles between full cleans
pub const CLEANUP_EVERY_N_CYCLES: u32 = 5;
/// Ceiling of the cleanup cadence
pub const MAX_CLEANUP_CYCLES: u32 = 100;
const CLEANUP_STEP: u32 = 5;
/// Consecutive failed cycles tolerated before the daemon terminates
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;
/// Cycles kept for the diagnostic dump
pub const HISTORY_SIZE: usize = 30;

/// How often the sweep runs a full clean of the index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupCadence {
    limit: u32,
    count: u32,
}

impl Default for CleanupCadence {
    fn default() -> Self {
        Self {
            limit: CLEANUP_EVERY_N_CYCLES,
            count: 0,
        }
    }
}

impl CleanupCadence {
    /// Cycles between full cleans
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Count one cycle; `true` when this cycle should run a full clean
    pub fn tick(&mut self) -> bool {
        self.count += 1;
        if self.count >= self.limit {
            self.count = 0;
            true
        } else {
            false
        }
    }

    /// Slow down when cleans find little, speed up when they find a lot
    pub fn adapt(&mut self, cleaned: usize) {
        if cleaned < 10 {
            if self.limit < MAX_CLEANUP_CYCLES {
                self.limit += CLEANUP_STEP;
            }
        } else if cleaned > 1000 {
            self.limit = CLEANUP_EVERY_N_CYCLES;
        } else if cleaned > 100 && self.limit > CLEANUP_EVERY_N_CYCLES {
            self.limit = (self.limit - CLEANUP_STEP).max(CLEANUP_EVERY_N_CYCLES);
        }
    }
}

/// Counters of one sweep cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryCycle {
    pub started_at: DateTime<Utc>,
    pub index_size: usize,
    pub processed: usize,
    pub expired: usize,
    pub remain: usize,
    pub gone: usize,
    pub cleaned: usize,
}

impl ExpiryCycle {
    fn new(index_size: usize) -> Self {
        Self {
            started_at: Utc::now(),
            index_size,
            processed: 0,
            expired: 0,
            remain: 0,
            gone: 0,
            cleaned: 0,
        }
    }

    fn dump(&self) -> DumpNode {
        DumpNode::new("cycle")
            .with_child(DumpNode::timestamp("start", Some(self.started_at)))
            .with_child(DumpNode::leaf("index-size", self.index_size))
            .with_child(DumpNode::leaf("processed", self.processed))
            .with_child(DumpNode::leaf("expired", self.expired))
            .with_child(DumpNode::leaf("remain", self.remain))
            .with_child(DumpNode::leaf("gone", self.gone))
            .with_child(DumpNode::leaf("cleaned", self.cleaned))
    }
}

/// Local transaction of one sweep, committed every `BATCH_SIZE` expirations.
///
/// References of accepted expirations stay indexed until their transaction
/// commits. A rolled back batch leaves them tracked for the next cycle.
struct Batch<'a> {
    factory: &'a dyn TransactionFactory,
    index: &'a ExpiryIndex,
    transaction: Option<Box<dyn Transaction>>,
    accepted: Vec<ExpirableReference>,
}

impl<'a> Batch<'a> {
    fn new(factory: &'a dyn TransactionFactory, index: &'a ExpiryIndex) -> Self {
        Self {
            factory,
            index,
            transaction: None,
            accepted: Vec::with_capacity(BATCH_SIZE),
        }
    }

    /// Current transaction, begun on first use
    fn transaction(&mut self) -> std::result::Result<&mut dyn Transaction, StoreError> {
        let transaction = match self.transaction.take() {
            Some(transaction) => transaction,
            None => self.factory.begin_local_transaction()?,
        };
        Ok(&mut **self.transaction.insert(transaction))
    }

    /// Count one accepted expiration; a full batch is committed and a fresh
    /// transaction begun for the rest of the cycle
    fn expired(&mut self, reference: ExpirableReference) -> std::result::Result<(), StoreError> {
        self.accepted.push(reference);
        if self.accepted.len() >= BATCH_SIZE {
            self.commit()?;
            self.transaction = Some(self.factory.begin_local_transaction()?);
        }
        Ok(())
    }

    fn commit(&mut self) -> std::result::Result<(), StoreError> {
        if let Some(transaction) = self.transaction.take() {
            transaction.commit()?;
        }
        for reference in self.accepted.drain(..) {
            self.index.remove(&reference);
        }
        Ok(())
    }

    /// Commit outstanding work, or roll back an idle transaction
    fn finish(mut self) -> std::result::Result<(), StoreError> {
        if !self.accepted.is_empty() {
            return self.commit();
        }
        match self.transaction.take() {
            Some(transaction) => transaction.rollback(),
            None => Ok(()),
        }
    }

    fn abandon(mut self) {
        if let Some(transaction) = self.transaction.take() {
            if let Err(err) = transaction.rollback() {
                warn!(error = %err, "rollback of failed expiry batch failed");
            }
        }
        if !self.accepted.is_empty() {
            debug!(kept = self.accepted.len(), "rolled back expirations stay indexed");
        }
    }
}

struct ExpirerInner {
    span: Span,
    properties: Properties,
    transactions: Arc<dyn TransactionFactory>,
    scheduler: AlarmScheduler,
    index: ExpiryIndex,
    started: AtomicBool,
    interval_ms: AtomicU64,
    alarm: RwLock<Option<Alarm>>,
    cadence: Mutex<CleanupCadence>,
    consecutive_failures: AtomicU32,
    history: Mutex<CycleHistory<ExpiryCycle>>,
    diagnostics: Mutex<DaemonDiagnostics>,
}

/// Expiry daemon of a message store
#[derive(Clone)]
pub struct Expirer {
    inner: Arc<ExpirerInner>,
}

impl Expirer {
    /// Create a stopped expirer for the store called `store_name`
    pub fn new(
        store_name: &str,
        properties: Properties,
        transactions: Arc<dyn TransactionFactory>,
        scheduler: AlarmScheduler,
    ) -> Self {
        Self {
            inner: Arc::new(ExpirerInner {
                span: info_span!("expirer", store = %store_name),
                properties,
                transactions,
                scheduler,
                index: ExpiryIndex::new(),
                started: AtomicBool::new(false),
                interval_ms: AtomicU64::new(0),
                alarm: RwLock::new(None),
                cadence: Mutex::new(CleanupCadence::default()),
                consecutive_failures: AtomicU32::new(0),
                history: Mutex::new(CycleHistory::new(HISTORY_SIZE)),
                diagnostics: Mutex::new(DaemonDiagnostics::default()),
            }),
        }
    }

    /// Start sweeping.
    ///
    /// The interval is `interval_override` (ms) when given, otherwise the
    /// `expiryInterval` property, otherwise 1000ms. An interval below 1
    /// leaves the daemon stopped.
    pub fn start(&self, interval_override: Option<u64>) -> Result<()> {
        let inner = &self.inner;
        let _enter = inner.span.enter();

        let interval = match interval_override {
            Some(ms) => i64::try_from(ms).unwrap_or(i64::MAX),
            None => {
                let (ms, err) = inner
                    .properties
                    .parse_or(EXPIRY_INTERVAL, DEFAULT_EXPIRY_INTERVAL_MS);
                if let Some(err) = err {
                    warn!(error = %err, fallback_ms = ms, "invalid expiry interval");
                    inner.diagnostics.lock().record_error(&err);
                }
                ms
            }
        };
        if interval < 1 {
            info!(interval_ms = interval, "expiry disabled");
            return Ok(());
        }

        if inner
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ExpiryError::AlreadyRunning("expirer"));
        }
        inner.interval_ms.store(interval as u64, Ordering::SeqCst);
        inner.consecutive_failures.store(0, Ordering::SeqCst);
        inner.diagnostics.lock().started_at = Some(Utc::now());
        info!(interval_ms = interval, indexed = inner.index.size(), "expirer started");

        if !inner.index.is_empty() {
            self.ensure_scheduled();
        }
        Ok(())
    }

    /// Stop sweeping. The pending alarm is cancelled; a cycle already in
    /// flight finishes but does not reschedule. The index is kept.
    pub fn stop(&self) {
        let inner = &self.inner;
        let _enter = inner.span.enter();
        if let Some(alarm) = inner.alarm.write().take() {
            alarm.cancel();
        }
        if inner.started.swap(false, Ordering::SeqCst) {
            inner.diagnostics.lock().stopped_at = Some(Utc::now());
            info!(indexed = inner.index.size(), "expirer stopped");
        }
    }

    /// Whether items can currently expire
    pub fn is_running(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// Number of tracked references
    pub fn size(&self) -> usize {
        self.inner.index.size()
    }

    /// Resolved sweep interval, zero until started
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.inner.interval_ms.load(Ordering::SeqCst))
    }

    /// Current cleanup cadence
    pub fn cleanup_cadence(&self) -> CleanupCadence {
        *self.inner.cadence.lock()
    }

    /// Track `item`. Ignored while stopped or once the item has left the
    /// store. Registering the same `(expiry_time, id)` twice stops the
    /// daemon and fails with [`ExpiryError::DuplicateExpirable`].
    pub fn add_expirable(&self, item: &Arc<dyn Expirable>) -> Result<()> {
        let inner = &self.inner;
        let _enter = inner.span.enter();
        let reference = ExpirableReference::new(item)?.with_expiry_time(item.expiry_time());
        if !self.is_running() || !item.is_in_store() {
            return Ok(());
        }

        let (expiry_time, id) = (reference.expiry_time(), reference.id());
        if !inner.index.put(reference) {
            let err = ExpiryError::DuplicateExpirable { expiry_time, id };
            error!(expiry_time, id, "duplicate expirable, stopping expirer");
            inner.diagnostics.lock().record_error(&err);
            self.stop();
            return Err(err);
        }
        self.ensure_scheduled();
        Ok(())
    }

    /// Stop tracking `item`. Returns whether a reference was removed.
    /// A pending alarm is left to fire even if the index became empty.
    pub fn remove_expirable(&self, item: &Arc<dyn Expirable>) -> bool {
        let _enter = self.inner.span.enter();
        if !self.is_running() || item.id() == NO_ID {
            return false;
        }
        match ExpirableReference::new(item) {
            Ok(reference) => self
                .inner
                .index
                .remove(&reference.with_expiry_time(item.expiry_time())),
            Err(_) => false,
        }
    }

    /// Schedule a sweep unless one is already pending
    fn ensure_scheduled(&self) {
        let inner = &self.inner;
        if inner.alarm.read().is_some() {
            return;
        }
        let slot = inner.alarm.upgradable_read();
        if slot.is_some() {
            return;
        }
        let mut slot = RwLockUpgradableReadGuard::upgrade(slot);
        *slot = Some(self.create_alarm());
    }

    fn create_alarm(&self) -> Alarm {
        let weak: Weak<ExpirerInner> = Arc::downgrade(&self.inner);
        self.inner.scheduler.create(self.interval(), move |id| {
            if let Some(inner) = weak.upgrade() {
                Expirer { inner }.alarm(id);
            }
        })
    }

    /// Timer callback: one sweep cycle, then reschedule
    fn alarm(&self, fired: AlarmId) {
        if let Err(err) = self.run_cycle() {
            let _enter = self.inner.span.enter();
            error!(error = %err, "expiry daemon terminated");
        }
        self.reschedule(fired);
    }

    fn reschedule(&self, fired: AlarmId) {
        let inner = &self.inner;
        let mut slot = inner.alarm.write();
        // a stop/start raced this callback and owns a newer alarm
        if slot.as_ref().is_some_and(|alarm| alarm.id() != fired) {
            return;
        }
        if inner.started.load(Ordering::SeqCst) && !inner.index.is_empty() {
            *slot = Some(self.create_alarm());
        } else {
            *slot = None;
        }
    }

    /// Run one sweep cycle now.
    ///
    /// Failures are retried on the next cycle; more than
    /// `MAX_CONSECUTIVE_FAILURES` in a row stop the daemon and return
    /// [`ExpiryError::ExpiryDaemonTerminated`].
    pub fn run_cycle(&self) -> Result<()> {
        let inner = &self.inner;
        let _enter = inner.span.enter();
        if !inner.started.load(Ordering::SeqCst) {
            debug!("expirer stopped before cycle ran");
            return Ok(());
        }

        let mut cycle = ExpiryCycle::new(inner.index.size());
        let outcome = self.sweep(&mut cycle);
        inner.history.lock().push(cycle);

        match outcome {
            Ok(()) => {
                inner.consecutive_failures.store(0, Ordering::SeqCst);
                if cycle.processed > 0 || cycle.cleaned > 0 {
                    debug!(
                        processed = cycle.processed,
                        expired = cycle.expired,
                        remain = cycle.remain,
                        gone = cycle.gone,
                        cleaned = cycle.cleaned,
                        "expiry cycle complete"
                    );
                }
                Ok(())
            }
            Err(err) => {
                inner.diagnostics.lock().record_error(&err);
                let failures = inner.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures > MAX_CONSECUTIVE_FAILURES {
                    self.stop();
                    return Err(ExpiryError::ExpiryDaemonTerminated(err));
                }
                warn!(error = %err, failures, "expiry cycle failed, retrying next cycle");
                Ok(())
            }
        }
    }

    fn sweep(&self, cycle: &mut ExpiryCycle) -> std::result::Result<(), StoreError> {
        let inner = &self.inner;
        let cleanup = inner.cadence.lock().tick();
        let mut batch = Batch::new(inner.transactions.as_ref(), &inner.index);

        let result = self.expire_due(Utc::now().timestamp_millis(), &mut batch, cycle);
        if let Err(err) = result {
            batch.abandon();
            return Err(err);
        }

        batch.finish()?;

        if cleanup {
            cycle.cleaned = inner.index.clean();
            let mut cadence = inner.cadence.lock();
            cadence.adapt(cycle.cleaned);
            debug!(cleaned = cycle.cleaned, every = cadence.limit(), "expiry index cleaned");
        }
        Ok(())
    }

    /// Expire every reference due at `now`, earliest first.
    ///
    /// Entries that declined, and accepted ones whose batch has not yet
    /// committed, stay in place, so the scan continues after the last
    /// entry it kept.
    fn expire_due(
        &self,
        now: i64,
        batch: &mut Batch<'_>,
        cycle: &mut ExpiryCycle,
    ) -> std::result::Result<(), StoreError> {
        let index = &self.inner.index;
        let mut kept: Option<ExpirableReference> = None;

        loop {
            let next = match &kept {
                Some(last) => index.first_after(last),
                None => index.first(),
            };
            let Some(reference) = next else { break };
            if reference.expiry_time() > now {
                break;
            }
            cycle.processed += 1;

            match reference.expirable().filter(|item| item.is_in_store()) {
                Some(item) => {
                    if item.expire(batch.transaction()?)? {
                        cycle.expired += 1;
                        batch.expired(reference.clone())?;
                    } else {
                        cycle.remain += 1;
                    }
                    kept = Some(reference);
                }
                None => {
                    index.remove(&reference);
                    cycle.gone += 1;
                }
            }
        }
        Ok(())
    }

    /// Recorded cycles, oldest first
    pub fn history(&self) -> Vec<ExpiryCycle> {
        self.inner.history.lock().iter().copied().collect()
    }

    /// Diagnostic dump of the daemon
    pub fn dump(&self) -> DumpNode {
        let inner = &self.inner;
        let mut node = DumpNode::new("expirer")
            .with_child(DumpNode::leaf("interval-ms", self.interval().as_millis()))
            .with_child(DumpNode::leaf("started", self.is_running()))
            .with_child(DumpNode::leaf("index-size", inner.index.size()))
            .with_child(DumpNode::leaf("cleanup-every", self.cleanup_cadence().limit()))
            .with_child(DumpNode::leaf(
                "consecutive-failures",
                inner.consecutive_failures.load(Ordering::SeqCst),
            ));
        inner.diagnostics.lock().write_into(&mut node);

        let mut history = DumpNode::new("history");
        for cycle in inner.history.lock().iter() {
            history.push(cycle.dump());
        }
        node.with_child(history)
    }
}
