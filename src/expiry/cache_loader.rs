//! Cache Loader
//!
//! Restart recovery. Takes one snapshot of the persisted streams that hold
//! expirable items and reloads a bounded number of them per timer cycle.
//! Reloaded items register themselves with the expirer. Once every stream
//! has been visited the loader stops for good.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock, RwLockUpgradableReadGuard};
use std::iter::Peekable;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use std::vec;
use tracing::{debug, error, info, info_span, warn, Span};

use super::alarm::{Alarm, AlarmId, AlarmScheduler};
use crate::config::{
    Properties, CACHE_LOADER_INTERVAL, DEFAULT_CACHE_LOADER_INTERVAL_SECS,
    DEFAULT_MAX_STREAMS_PER_CYCLE, MAX_STREAMS_PER_CYCLE,
};
use crate::error::{ExpiryError, Result, StoreError};
use crate::observability::{CycleHistory, DaemonDiagnostics, DumpNode};
use crate::storage::{LinkRegistry, Persistence, StreamId};

/// Cycles kept for the diagnostic dump
pub const HISTORY_SIZE: usize = 10;

/// Record of one reload cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderCycle {
    pub started_at: DateTime<Utc>,
    pub streams_loaded: usize,
    pub duration: Duration,
}

impl LoaderCycle {
    fn dump(&self) -> DumpNode {
        DumpNode::new("cycle")
            .with_child(DumpNode::timestamp("start", Some(self.started_at)))
            .with_child(DumpNode::leaf("streams", self.streams_loaded))
            .with_child(DumpNode::leaf("duration-ms", self.duration.as_millis()))
    }
}

type Cursor = Peekable<vec::IntoIter<StreamId>>;

struct LoaderInner {
    span: Span,
    properties: Properties,
    persistence: Arc<dyn Persistence>,
    links: Arc<dyn LinkRegistry>,
    scheduler: AlarmScheduler,
    enabled: AtomicBool,
    shutdown: AtomicBool,
    interval_secs: AtomicU64,
    max_streams_per_cycle: AtomicUsize,
    snapshot_size: AtomicUsize,
    total_loaded: AtomicUsize,
    cursor: Mutex<Option<Cursor>>,
    alarm: RwLock<Option<Alarm>>,
    history: Mutex<CycleHistory<LoaderCycle>>,
    diagnostics: Mutex<DaemonDiagnostics>,
}

/// Restart recovery daemon of a message store
#[derive(Clone)]
pub struct CacheLoader {
    inner: Arc<LoaderInner>,
}

impl CacheLoader {
    /// Create a stopped loader for the store called `store_name`
    pub fn new(
        store_name: &str,
        properties: Properties,
        persistence: Arc<dyn Persistence>,
        links: Arc<dyn LinkRegistry>,
        scheduler: AlarmScheduler,
    ) -> Self {
        Self {
            inner: Arc::new(LoaderInner {
                span: info_span!("cache_loader", store = %store_name),
                properties,
                persistence,
                links,
                scheduler,
                enabled: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                interval_secs: AtomicU64::new(0),
                max_streams_per_cycle: AtomicUsize::new(DEFAULT_MAX_STREAMS_PER_CYCLE),
                snapshot_size: AtomicUsize::new(0),
                total_loaded: AtomicUsize::new(0),
                cursor: Mutex::new(None),
                alarm: RwLock::new(None),
                history: Mutex::new(CycleHistory::new(HISTORY_SIZE)),
                diagnostics: Mutex::new(DaemonDiagnostics::default()),
            }),
        }
    }

    /// Snapshot the streams holding expirable items and schedule the first
    /// reload cycle.
    ///
    /// The interval is `interval_override` (seconds) when given, otherwise
    /// the `cacheLoaderInterval` property, otherwise 60s. A failing
    /// snapshot query disables the loader and returns
    /// [`ExpiryError::CacheLoaderTerminated`].
    pub fn start(&self, interval_override: Option<u64>) -> Result<()> {
        let inner = &self.inner;
        let _enter = inner.span.enter();
        if inner.enabled.load(Ordering::SeqCst) {
            return Err(ExpiryError::AlreadyRunning("cache loader"));
        }

        let interval = match interval_override {
            Some(secs) => i64::try_from(secs).unwrap_or(i64::MAX),
            None => self.resolve(CACHE_LOADER_INTERVAL, DEFAULT_CACHE_LOADER_INTERVAL_SECS),
        };
        let max_streams = self.resolve(MAX_STREAMS_PER_CYCLE, DEFAULT_MAX_STREAMS_PER_CYCLE);
        inner
            .max_streams_per_cycle
            .store(max_streams.max(1), Ordering::SeqCst);
        inner
            .interval_secs
            .store(u64::try_from(interval).unwrap_or(0), Ordering::SeqCst);

        let snapshot = match inner.persistence.identify_streams_with_expirable_items() {
            Ok(snapshot) => snapshot,
            Err(err) => {
                inner.enabled.store(false, Ordering::SeqCst);
                inner.diagnostics.lock().record_error(&err);
                error!(error = %err, "cannot identify streams with expirable items");
                return Err(ExpiryError::CacheLoaderTerminated(err));
            }
        };

        let mut streams: Vec<StreamId> = snapshot.into_iter().collect();
        streams.sort_unstable();
        let count = streams.len();
        inner.snapshot_size.store(count, Ordering::SeqCst);
        inner.total_loaded.store(0, Ordering::SeqCst);
        *inner.cursor.lock() = Some(streams.into_iter().peekable());
        inner.shutdown.store(false, Ordering::SeqCst);
        inner.diagnostics.lock().started_at = Some(Utc::now());

        if count > 0 && interval >= 1 {
            inner.enabled.store(true, Ordering::SeqCst);
            info!(streams = count, interval_secs = interval, max_streams, "cache loader started");
            self.ensure_scheduled();
        } else {
            info!(streams = count, interval_secs = interval, "nothing to reload");
        }
        Ok(())
    }

    fn resolve<T: std::str::FromStr + Copy + std::fmt::Display>(&self, key: &str, default: T) -> T {
        let (value, err) = self.inner.properties.parse_or(key, default);
        if let Some(err) = err {
            warn!(error = %err, fallback = %value, "invalid cache loader property");
            self.inner.diagnostics.lock().record_error(&err);
        }
        value
    }

    /// Stop reloading. A cycle in flight finishes its current stream.
    pub fn stop(&self) {
        let inner = &self.inner;
        let _enter = inner.span.enter();
        inner.shutdown.store(true, Ordering::SeqCst);
        self.disable();
    }

    fn disable(&self) {
        let inner = &self.inner;
        if let Some(alarm) = inner.alarm.write().take() {
            alarm.cancel();
        }
        if inner.enabled.swap(false, Ordering::SeqCst) {
            inner.diagnostics.lock().stopped_at = Some(Utc::now());
            info!(
                loaded = inner.total_loaded.load(Ordering::SeqCst),
                snapshot = inner.snapshot_size.load(Ordering::SeqCst),
                "cache loader stopped"
            );
        }
    }

    /// Whether reload cycles are still scheduled
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Resolved reload interval, zero until started
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.inner.interval_secs.load(Ordering::SeqCst))
    }

    /// Streams reloaded per cycle
    pub fn max_streams_per_cycle(&self) -> usize {
        self.inner.max_streams_per_cycle.load(Ordering::SeqCst)
    }

    /// Streams visited since `start`
    pub fn streams_loaded(&self) -> usize {
        self.inner.total_loaded.load(Ordering::SeqCst)
    }

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
        let weak: Weak<LoaderInner> = Arc::downgrade(&self.inner);
        self.inner.scheduler.create(self.interval(), move |id| {
            if let Some(inner) = weak.upgrade() {
                CacheLoader { inner }.alarm(id);
            }
        })
    }

    fn alarm(&self, fired: AlarmId) {
        let _enter = self.inner.span.enter();
        if let Err(err) = self.run_cycle() {
            error!(error = %err, "cache loader terminated");
        }
        self.reschedule(fired);
    }

    fn reschedule(&self, fired: AlarmId) {
        let inner = &self.inner;
        let mut slot = inner.alarm.write();
        if slot.as_ref().is_some_and(|alarm| alarm.id() != fired) {
            return;
        }
        if inner.enabled.load(Ordering::SeqCst) {
            *slot = Some(self.create_alarm());
        } else {
            *slot = None;
        }
    }

    /// Reload up to `maxStreamsPerCycle` streams now.
    ///
    /// Stops the loader once the snapshot is exhausted. A failing link
    /// stops it too and returns [`ExpiryError::CacheLoaderTerminated`],
    /// unless the failure is an interruption during shutdown.
    pub fn run_cycle(&self) -> Result<()> {
        let inner = &self.inner;
        if !inner.enabled.load(Ordering::SeqCst) {
            return Ok(());
        }

        let started_at = Utc::now();
        let timer = Instant::now();
        let mut loaded = 0;
        let outcome = self.reload(&mut loaded);

        inner.history.lock().push(LoaderCycle {
            started_at,
            streams_loaded: loaded,
            duration: timer.elapsed(),
        });
        inner.total_loaded.fetch_add(loaded, Ordering::SeqCst);

        match outcome {
            Ok(true) => {
                info!(streams = inner.snapshot_size.load(Ordering::SeqCst), "all streams reloaded");
                self.disable();
                Ok(())
            }
            Ok(false) => {
                debug!(loaded, "reload cycle complete");
                Ok(())
            }
            Err(StoreError::Interrupted) if inner.shutdown.load(Ordering::SeqCst) => {
                debug!("reload interrupted by shutdown");
                Ok(())
            }
            Err(err) => {
                inner.diagnostics.lock().record_error(&err);
                self.disable();
                Err(ExpiryError::CacheLoaderTerminated(err))
            }
        }
    }

    /// Returns whether the snapshot is exhausted
    fn reload(&self, loaded: &mut usize) -> std::result::Result<bool, StoreError> {
        let inner = &self.inner;
        let max = inner.max_streams_per_cycle.load(Ordering::SeqCst);
        let mut cursor = inner.cursor.lock();
        let Some(streams) = cursor.as_mut() else {
            return Ok(true);
        };

        while inner.enabled.load(Ordering::SeqCst) && *loaded < max {
            let Some(stream) = streams.next() else { break };
            *loaded += 1;
            match inner.links.get_link(stream) {
                Some(link) => {
                    link.load_owned_links()?;
                }
                None => debug!(%stream, "stream no longer present, skipping"),
            }
        }
        Ok(streams.peek().is_none())
    }

    /// Recorded cycles, oldest first
    pub fn history(&self) -> Vec<LoaderCycle> {
        self.inner.history.lock().iter().copied().collect()
    }

    /// Diagnostic dump of the loader
    pub fn dump(&self) -> DumpNode {
        let inner = &self.inner;
        let mut node = DumpNode::new("cache-loader")
            .with_child(DumpNode::leaf("interval-secs", self.interval().as_secs()))
            .with_child(DumpNode::leaf("max-streams-per-cycle", self.max_streams_per_cycle()))
            .with_child(DumpNode::leaf("enabled", self.is_enabled()))
            .with_child(DumpNode::leaf("shutdown", inner.shutdown.load(Ordering::SeqCst)))
            .with_child(DumpNode::leaf("snapshot-size", inner.snapshot_size.load(Ordering::SeqCst)))
            .with_child(DumpNode::leaf("streams-loaded", self.streams_loaded()));
        inner.diagnostics.lock().write_into(&mut node);

        let mut history = DumpNode::new("history");
        for cycle in inner.history.lock().iter() {
            history.push(cycle.dump());
        }
        node.with_child(history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Link;
    use hashbrown::HashSet;
    use parking_lot::Mutex as PlMutex;
    use tokio_test::{assert_err, assert_ok};

    struct FixedPersistence(std::result::Result<HashSet<StreamId>, StoreError>);

    impl Persistence for FixedPersistence {
        fn identify_streams_with_expirable_items(
            &self,
        ) -> std::result::Result<HashSet<StreamId>, StoreError> {
            self.0.clone()
        }
    }

    /// Link registry that records which streams were loaded
    #[derive(Default)]
    struct RecordingLinks {
        loaded: PlMutex<Vec<StreamId>>,
        missing: HashSet<StreamId>,
        failing: Option<(StreamId, StoreError)>,
    }

    struct RecordingLink {
        stream: StreamId,
        registry: Arc<RecordingLinks>,
    }

    impl Link for RecordingLink {
        fn load_owned_links(&self) -> std::result::Result<bool, StoreError> {
            if let Some((stream, err)) = &self.registry.failing {
                if *stream == self.stream {
                    return Err(err.clone());
                }
            }
            self.registry.loaded.lock().push(self.stream);
            Ok(true)
        }
    }

    struct Registry(Arc<RecordingLinks>);

    impl LinkRegistry for Registry {
        fn get_link(&self, stream: StreamId) -> Option<Arc<dyn Link>> {
            if self.0.missing.contains(&stream) {
                return None;
            }
            Some(Arc::new(RecordingLink {
                stream,
                registry: self.0.clone(),
            }))
        }
    }

    fn streams(n: i64) -> HashSet<StreamId> {
        (1..=n).map(StreamId).collect()
    }

    fn loader(
        persistence: std::result::Result<HashSet<StreamId>, StoreError>,
        links: RecordingLinks,
        properties: Properties,
    ) -> (CacheLoader, Arc<RecordingLinks>) {
        let links = Arc::new(links);
        let loader = CacheLoader::new(
            "test",
            properties,
            Arc::new(FixedPersistence(persistence)),
            Arc::new(Registry(links.clone())),
            AlarmScheduler::try_current().unwrap(),
        );
        (loader, links)
    }

    fn per_cycle(k: usize) -> Properties {
        Properties::new().with_property(MAX_STREAMS_PER_CYCLE, k.to_string())
    }

    // long interval so only explicit run_cycle calls reload
    const MANUAL: Option<u64> = Some(3600);

    #[tokio::test]
    async fn test_runs_ceil_n_over_k_cycles() {
        let (loader, links) = loader(Ok(streams(23)), RecordingLinks::default(), per_cycle(5));
        assert_ok!(loader.start(MANUAL));
        assert!(loader.is_enabled());

        let mut cycles = 0;
        while loader.is_enabled() {
            assert_ok!(loader.run_cycle());
            cycles += 1;
            assert!(cycles <= 5);
        }
        assert_eq!(cycles, 5);
        assert_eq!(links.loaded.lock().len(), 23);
        assert_eq!(loader.streams_loaded(), 23);

        let loaded: Vec<_> = loader.history().iter().map(|c| c.streams_loaded).collect();
        assert_eq!(loaded, vec![5, 5, 5, 5, 3]);

        // exhausted loaders never reload again
        assert_ok!(loader.run_cycle());
        assert_eq!(loader.history().len(), 5);
    }

    #[tokio::test]
    async fn test_exact_multiple_stops_without_empty_cycle() {
        let (loader, _) = loader(Ok(streams(10)), RecordingLinks::default(), per_cycle(5));
        assert_ok!(loader.start(MANUAL));
        assert_ok!(loader.run_cycle());
        assert!(loader.is_enabled());
        assert_ok!(loader.run_cycle());
        assert!(!loader.is_enabled());
        assert_eq!(loader.history().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_link_is_skipped() {
        let links = RecordingLinks {
            missing: [StreamId(2)].into_iter().collect(),
            ..Default::default()
        };
        let (loader, links) = loader(Ok(streams(3)), links, Properties::new());
        assert_ok!(loader.start(MANUAL));
        assert_ok!(loader.run_cycle());
        assert_eq!(*links.loaded.lock(), vec![StreamId(1), StreamId(3)]);
        assert!(!loader.is_enabled());
    }

    #[tokio::test]
    async fn test_snapshot_failure_is_fatal() {
        let (loader, _) = loader(
            Err(StoreError::Persistence("no log".into())),
            RecordingLinks::default(),
            Properties::new(),
        );
        let err = assert_err!(loader.start(MANUAL));
        assert_eq!(
            err,
            ExpiryError::CacheLoaderTerminated(StoreError::Persistence("no log".into()))
        );
        assert!(!loader.is_enabled());
        assert!(loader.dump().find("last-error").is_some());
    }

    #[tokio::test]
    async fn test_empty_snapshot_is_inert() {
        let (loader, _) = loader(Ok(HashSet::new()), RecordingLinks::default(), Properties::new());
        assert_ok!(loader.start(MANUAL));
        assert!(!loader.is_enabled());
        assert!(loader.inner.alarm.read().is_none());
    }

    #[tokio::test]
    async fn test_zero_interval_is_inert() {
        let (loader, _) = loader(Ok(streams(3)), RecordingLinks::default(), Properties::new());
        assert_ok!(loader.start(Some(0)));
        assert!(!loader.is_enabled());
    }

    #[tokio::test]
    async fn test_property_fallbacks() {
        let props = Properties::new()
            .with_property(CACHE_LOADER_INTERVAL, "2")
            .with_property(MAX_STREAMS_PER_CYCLE, "many");
        let (loader, _) = loader(Ok(streams(1)), RecordingLinks::default(), props);
        assert_ok!(loader.start(None));
        assert_eq!(loader.interval(), Duration::from_secs(2));
        assert_eq!(loader.max_streams_per_cycle(), DEFAULT_MAX_STREAMS_PER_CYCLE);
        loader.stop();
    }

    #[tokio::test]
    async fn test_link_failure_is_fatal() {
        let links = RecordingLinks {
            failing: Some((StreamId(2), StoreError::Severe("corrupt".into()))),
            ..Default::default()
        };
        let (loader, _) = loader(Ok(streams(4)), links, Properties::new());
        assert_ok!(loader.start(MANUAL));
        let err = assert_err!(loader.run_cycle());
        assert!(matches!(err, ExpiryError::CacheLoaderTerminated(_)));
        assert!(!loader.is_enabled());
    }

    #[tokio::test]
    async fn test_interruption_during_shutdown_is_swallowed() {
        let links = RecordingLinks {
            failing: Some((StreamId(1), StoreError::Interrupted)),
            ..Default::default()
        };
        let (loader, _) = loader(Ok(streams(2)), links, Properties::new());
        assert_ok!(loader.start(MANUAL));
        loader.inner.shutdown.store(true, Ordering::SeqCst);
        assert_ok!(loader.run_cycle());
    }

    #[tokio::test]
    async fn test_stop_prevents_further_cycles() {
        let (loader, links) = loader(Ok(streams(4)), RecordingLinks::default(), per_cycle(1));
        assert_ok!(loader.start(MANUAL));
        assert_ok!(loader.run_cycle());
        loader.stop();
        assert_ok!(loader.run_cycle());
        assert_eq!(links.loaded.lock().len(), 1);
        assert!(loader.inner.alarm.read().is_none());
        assert_eq!(loader.dump().find("shutdown").and_then(DumpNode::value), Some("true"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_reloads_everything() {
        let (loader, links) = loader(Ok(streams(3)), RecordingLinks::default(), per_cycle(1));
        assert_ok!(loader.start(Some(1)));
        assert_eq!(
            loader.start(Some(1)),
            Err(ExpiryError::AlreadyRunning("cache loader"))
        );

        for _ in 0..10 {
            if !loader.is_enabled() {
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        assert!(!loader.is_enabled());
        assert_eq!(links.loaded.lock().len(), 3);
        assert_eq!(loader.history().len(), 3);
    }
}
