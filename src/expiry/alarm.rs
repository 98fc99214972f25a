//! Alarm Scheduler
//!
//! One-shot timer callbacks on a shared tokio runtime.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Identifies one alarm for the lifetime of its scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AlarmId(u64);

impl fmt::Display for AlarmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "alarm-{}", self.0)
    }
}

/// Creates alarms on a tokio runtime
#[derive(Debug, Clone)]
pub struct AlarmScheduler {
    handle: Handle,
    next_id: Arc<AtomicU64>,
}

impl AlarmScheduler {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Scheduler on the runtime of the calling task.
    /// `None` outside a tokio runtime.
    pub fn try_current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }

    /// Number of alarms created so far
    pub fn created(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed) - 1
    }

    /// Run `callback` once after `delay`
    pub fn create<F>(&self, delay: Duration, callback: F) -> Alarm
    where
        F: FnOnce(AlarmId) + Send + 'static,
    {
        let id = AlarmId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let task = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            callback(id);
        });
        Alarm { id, task }
    }
}

/// A pending one-shot alarm
#[derive(Debug)]
pub struct Alarm {
    id: AlarmId,
    task: JoinHandle<()>,
}

impl Alarm {
    pub fn id(&self) -> AlarmId {
        self.id
    }

    /// Cancel the alarm if it has not fired. A callback that is already
    /// running is not interrupted.
    pub fn cancel(self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_alarm_fires_once() {
        let scheduler = AlarmScheduler::try_current().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let alarm = scheduler.create(Duration::from_millis(10), move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(alarm.is_finished());
    }

    #[tokio::test]
    async fn test_cancelled_alarm_never_fires() {
        let scheduler = AlarmScheduler::try_current().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let alarm = scheduler.create(Duration::from_millis(30), move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });
        alarm.cancel();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_ids_are_distinct() {
        let scheduler = AlarmScheduler::try_current().unwrap();
        let a = scheduler.create(Duration::from_secs(60), |_| {});
        let b = scheduler.create(Duration::from_secs(60), |_| {});
        assert_ne!(a.id(), b.id());
        assert_eq!(scheduler.created(), 2);
        a.cancel();
        b.cancel();
    }

    #[test]
    fn test_no_runtime() {
        assert!(AlarmScheduler::try_current().is_none());
    }
}
