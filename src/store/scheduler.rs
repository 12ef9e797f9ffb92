//! Debounced saving with a bounded maximum wait.
//!
//! Every replicant that persists owns a [`SaveScheduler`]. A save runs `interval` after the
//! last change, but never later than `max_wait` after the first unsaved change, so a value
//! that keeps changing is still written regularly. Saves for one replicant never overlap.

use std::{sync::Weak, time::Duration};

use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, trace, warn};

use super::StoreError;

/// Default time between the last change and the save.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(100);
/// Default upper bound between the first unsaved change and the save.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(1);

/// Timing of a [`SaveScheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavePolicy {
    /// Time between the last change and the save. Zero saves right away.
    pub interval: Duration,
    /// Upper bound between the first unsaved change and the save.
    pub max_wait: Duration,
}

impl Default for SavePolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            max_wait: DEFAULT_MAX_WAIT,
        }
    }
}

impl SavePolicy {
    /// The same policy with a different interval.
    pub fn with_interval(self, interval: Duration) -> Self {
        Self { interval, ..self }
    }

    /// When to save, given the first unsaved change and the latest change.
    fn deadline(&self, first_pending: Instant, last_change: Instant) -> Instant {
        (last_change + self.interval).min(first_pending + self.max_wait.max(self.interval))
    }
}

/// Something that can write its current state to a store.
pub trait Persist: Send + Sync + 'static {
    /// Write the current state.
    fn persist(&self) -> Result<(), StoreError>;
}

#[derive(Debug)]
enum Command {
    Schedule,
    FlushNow(oneshot::Sender<Result<(), StoreError>>),
    Cancel,
}

/// Owns the save timer of one replicant.
///
/// The timer runs on a background task that ends when the scheduler is dropped. Must be
/// created inside a tokio runtime.
#[derive(Debug)]
pub struct SaveScheduler {
    tx: mpsc::UnboundedSender<Command>,
    _task: AbortOnDropHandle<()>,
}

impl SaveScheduler {
    /// Spawn the timer task for `target`.
    pub fn spawn(target: Weak<dyn Persist>, policy: SavePolicy) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::task::spawn(run(rx, target, policy));
        Self {
            tx,
            _task: AbortOnDropHandle::new(task),
        }
    }

    /// Note a change, (re)arming the timer.
    pub fn schedule(&self) {
        self.tx.send(Command::Schedule).ok();
    }

    /// Save right away if a change is pending, bypassing the timer.
    pub async fn flush_now(&self) -> Result<(), StoreError> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::FlushNow(reply)).is_err() {
            return Ok(());
        }
        rx.await.unwrap_or(Ok(()))
    }

    /// Drop any pending save.
    pub fn cancel(&self) {
        self.tx.send(Command::Cancel).ok();
    }
}

#[derive(Debug, Default)]
struct Pending {
    first: Option<Instant>,
    deadline: Option<Instant>,
}

impl Pending {
    fn clear(&mut self) {
        self.first = None;
        self.deadline = None;
    }
}

async fn run(
    mut rx: mpsc::UnboundedReceiver<Command>,
    target: Weak<dyn Persist>,
    policy: SavePolicy,
) {
    let mut pending = Pending::default();
    loop {
        let deadline = pending.deadline;
        let timer = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            biased;
            cmd = rx.recv() => match cmd {
                None => break,
                Some(Command::Schedule) => {
                    let now = Instant::now();
                    let first = *pending.first.get_or_insert(now);
                    pending.deadline = Some(policy.deadline(first, now));
                }
                Some(Command::FlushNow(reply)) => {
                    let res = match pending.first {
                        Some(_) => save(&target),
                        None => Ok(()),
                    };
                    match &res {
                        Ok(()) => pending.clear(),
                        Err(_) => {
                            let retry = Instant::now() + policy.interval.max(policy.max_wait);
                            pending.deadline = Some(retry);
                        }
                    }
                    reply.send(res).ok();
                }
                Some(Command::Cancel) => {
                    trace!("pending save cancelled");
                    pending.clear();
                }
            },
            _ = timer => {
                match save(&target) {
                    Ok(()) => pending.clear(),
                    Err(err) => {
                        // stays dirty, retried on the next cycle
                        warn!("failed to save: {err:#}");
                        let retry = Instant::now() + policy.interval.max(policy.max_wait);
                        pending.deadline = Some(retry);
                    }
                }
            }
        }
    }
    debug!("save scheduler stopped");
}

fn save(target: &Weak<dyn Persist>) -> Result<(), StoreError> {
    match target.upgrade() {
        Some(target) => target.persist(),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    };

    use testresult::TestResult;
    use tokio::time::advance;

    use super::*;
    use crate::store::UnavailableSnafu;

    #[derive(Debug, Default)]
    struct Counter {
        saves: AtomicUsize,
        failing: AtomicBool,
    }

    impl Persist for Counter {
        fn persist(&self) -> Result<(), StoreError> {
            if self.failing.load(Ordering::Relaxed) {
                return UnavailableSnafu.fail();
            }
            self.saves.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    impl Counter {
        fn saves(&self) -> usize {
            self.saves.load(Ordering::Relaxed)
        }
    }

    fn setup(policy: SavePolicy) -> (Arc<Counter>, SaveScheduler) {
        let counter = Arc::new(Counter::default());
        let weak = Arc::downgrade(&counter) as Weak<dyn Persist>;
        let scheduler = SaveScheduler::spawn(weak, policy);
        (counter, scheduler)
    }

    /// Let the scheduler task process its queue.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn debounces_bursts() {
        let (counter, scheduler) = setup(SavePolicy::default());
        for _ in 0..5 {
            scheduler.schedule();
            settle().await;
            advance(Duration::from_millis(50)).await;
        }
        assert_eq!(counter.saves(), 0);
        advance(Duration::from_millis(60)).await;
        settle().await;
        assert_eq!(counter.saves(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn max_wait_bounds_the_delay() {
        let (counter, scheduler) = setup(SavePolicy::default());
        // changes every 50ms never leave a quiet 100ms gap
        for _ in 0..41 {
            scheduler.schedule();
            settle().await;
            advance(Duration::from_millis(50)).await;
        }
        settle().await;
        assert_eq!(counter.saves(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_saves_right_away() {
        let (counter, scheduler) = setup(SavePolicy::default().with_interval(Duration::ZERO));
        scheduler.schedule();
        settle().await;
        advance(Duration::from_millis(1)).await;
        settle().await;
        assert_eq!(counter.saves(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_now_and_cancel() -> TestResult {
        let (counter, scheduler) = setup(SavePolicy::default());
        scheduler.flush_now().await?;
        assert_eq!(counter.saves(), 0, "nothing pending");

        scheduler.schedule();
        scheduler.flush_now().await?;
        assert_eq!(counter.saves(), 1);

        scheduler.schedule();
        scheduler.cancel();
        settle().await;
        advance(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(counter.saves(), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn failed_saves_are_retried() {
        let (counter, scheduler) = setup(SavePolicy::default());
        counter.failing.store(true, Ordering::Relaxed);
        scheduler.schedule();
        settle().await;
        advance(Duration::from_millis(150)).await;
        settle().await;
        assert_eq!(counter.saves(), 0);

        counter.failing.store(false, Ordering::Relaxed);
        advance(Duration::from_millis(1100)).await;
        settle().await;
        assert_eq!(counter.saves(), 1);
    }
}
