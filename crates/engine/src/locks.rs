use crate::shutdown::Shutdown;
use core_types::{FailureKind, OrderSide};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::{timeout, Duration};

/// The fixed set of cross-worker operation locks.
///
/// The derived order is the global acquisition order: `CandleData < Buy < Sell`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockCategory {
    CandleData,
    Buy,
    Sell,
}

impl LockCategory {
    pub const ALL: [LockCategory; 3] = [LockCategory::CandleData, LockCategory::Buy, LockCategory::Sell];

    pub fn for_side(side: OrderSide) -> Self {
        match side {
            OrderSide::Buy => LockCategory::Buy,
            OrderSide::Sell => LockCategory::Sell,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LockCategory::CandleData => "candle_data",
            LockCategory::Buy => "buy",
            LockCategory::Sell => "sell",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for LockCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LockError {
    #[error("Timed out after {waited:?} waiting for the {category} lock")]
    Timeout { category: LockCategory, waited: Duration },

    #[error("Wait for the {0} lock cancelled by shutdown")]
    Cancelled(LockCategory),
}

impl LockError {
    pub fn category(&self) -> LockCategory {
        match self {
            LockError::Timeout { category, .. } | LockError::Cancelled(category) => *category,
        }
    }

    pub fn failure_kind(&self) -> FailureKind {
        match self {
            LockError::Timeout { .. } => FailureKind::LockTimeout,
            LockError::Cancelled(_) => FailureKind::Cancelled,
        }
    }
}

/// Proof that `OperationLocks::with_lock` gave up on a lock.
///
/// The counterpart of `LockToken` for the failure path: the ledger only records an
/// order that never held its side lock when shown the miss for that lock.
#[derive(Error, Debug, Clone, PartialEq)]
#[error(transparent)]
pub struct LockMiss {
    error: LockError,
}

impl LockMiss {
    pub fn error(&self) -> &LockError {
        &self.error
    }

    pub fn category(&self) -> LockCategory {
        self.error.category()
    }

    pub fn failure_kind(&self) -> FailureKind {
        self.error.failure_kind()
    }
}

#[derive(Debug, Default)]
struct Counters {
    acquired: AtomicU64,
    released: AtomicU64,
}

/// Acquisition and release counts of one lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LockStats {
    pub acquired: u64,
    pub released: u64,
}

impl LockStats {
    pub fn held(&self) -> bool {
        self.acquired > self.released
    }
}

struct LockSlot {
    mutex: Arc<Mutex<()>>,
    counters: Arc<Counters>,
}

/// Exclusive ownership of one operation lock. Released when dropped.
///
/// Only `OperationLocks` can create one, which is what lets the ledger demand a
/// token as proof that the caller holds the matching lock.
pub struct LockToken {
    category: LockCategory,
    counters: Arc<Counters>,
    _guard: OwnedMutexGuard<()>,
}

impl LockToken {
    pub fn category(&self) -> LockCategory {
        self.category
    }
}

impl fmt::Debug for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockToken").field("category", &self.category).finish()
    }
}

impl Drop for LockToken {
    fn drop(&mut self) {
        self.counters.released.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(lock = %self.category, "Lock released");
    }
}

/// The named mutual-exclusion locks shared by every market worker.
pub struct OperationLocks {
    slots: [LockSlot; 3],
    max_wait: Option<Duration>,
    shutdown: Shutdown,
}

impl OperationLocks {
    pub fn new(max_wait: Option<Duration>, shutdown: Shutdown) -> Self {
        let slot = || LockSlot {
            mutex: Arc::new(Mutex::new(())),
            counters: Arc::new(Counters::default()),
        };
        Self {
            slots: [slot(), slot(), slot()],
            max_wait,
            shutdown,
        }
    }

    fn slot(&self, category: LockCategory) -> &LockSlot {
        &self.slots[category.index()]
    }

    /// Waits for the lock, bounded by `max_wait` when configured and by the stop signal.
    pub async fn acquire(&self, category: LockCategory) -> Result<LockToken, LockError> {
        let slot = self.slot(category);
        let wait = slot.mutex.clone().lock_owned();

        let guard = match self.max_wait {
            Some(limit) => tokio::select! {
                biased;
                _ = self.shutdown.wait() => Err(LockError::Cancelled(category)),
                guard = timeout(limit, wait) => guard.map_err(|_| LockError::Timeout { category, waited: limit }),
            },
            None => tokio::select! {
                biased;
                _ = self.shutdown.wait() => Err(LockError::Cancelled(category)),
                guard = wait => Ok(guard),
            },
        }?;

        slot.counters.acquired.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(lock = %category, "Lock acquired");
        Ok(LockToken {
            category,
            counters: slot.counters.clone(),
            _guard: guard,
        })
    }

    /// Runs `f` while holding the lock. The token moves into `f`, so the lock is
    /// released whenever its future completes, fails, panics or is dropped.
    pub async fn with_lock<T, F, Fut>(&self, category: LockCategory, f: F) -> Result<T, LockMiss>
    where
        F: FnOnce(LockToken) -> Fut,
        Fut: Future<Output = T>,
    {
        let token = self.acquire(category).await.map_err(|error| LockMiss { error })?;
        Ok(f(token).await)
    }

    /// Acquires several locks in the global order. On failure the locks already
    /// taken are released before returning.
    pub async fn acquire_ordered(&self, categories: &[LockCategory]) -> Result<Vec<LockToken>, LockError> {
        let mut ordered = categories.to_vec();
        ordered.sort();
        ordered.dedup();

        let mut tokens = Vec::with_capacity(ordered.len());
        for category in ordered {
            tokens.push(self.acquire(category).await?);
        }
        Ok(tokens)
    }

    pub fn stats(&self) -> BTreeMap<LockCategory, LockStats> {
        LockCategory::ALL
            .iter()
            .map(|&category| {
                let counters = &self.slot(category).counters;
                (
                    category,
                    LockStats {
                        acquired: counters.acquired.load(Ordering::SeqCst),
                        released: counters.released.load(Ordering::SeqCst),
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown;
    use tokio::time::{sleep, Instant};

    #[tokio::test(start_paused = true)]
    async fn second_holder_times_out_then_succeeds_after_release() {
        let (_trigger, stop) = shutdown::channel();
        let locks = OperationLocks::new(Some(Duration::from_millis(500)), stop);

        let token = locks.acquire(LockCategory::Buy).await.unwrap();
        let start = Instant::now();
        let err = locks.acquire(LockCategory::Buy).await.unwrap_err();
        assert_eq!(
            err,
            LockError::Timeout { category: LockCategory::Buy, waited: Duration::from_millis(500) }
        );
        assert_eq!(err.failure_kind(), FailureKind::LockTimeout);
        assert!(start.elapsed() >= Duration::from_millis(500));

        // Other categories are independent.
        drop(locks.acquire(LockCategory::Sell).await.unwrap());

        drop(token);
        drop(locks.acquire(LockCategory::Buy).await.unwrap());

        let stats = locks.stats();
        assert_eq!(stats[&LockCategory::Buy], LockStats { acquired: 2, released: 2 });
        assert_eq!(stats[&LockCategory::Sell], LockStats { acquired: 1, released: 1 });
        assert_eq!(stats[&LockCategory::CandleData], LockStats::default());
    }

    #[tokio::test]
    async fn with_lock_releases_after_an_error() {
        let (_trigger, stop) = shutdown::channel();
        let locks = OperationLocks::new(None, stop);

        let result: Result<Result<(), &str>, _> = locks
            .with_lock(LockCategory::Sell, |token| async move {
                assert_eq!(token.category(), LockCategory::Sell);
                Err("exchange said no")
            })
            .await;
        assert_eq!(result.unwrap(), Err("exchange said no"));
        assert!(!locks.stats()[&LockCategory::Sell].held());
    }

    #[tokio::test(start_paused = true)]
    async fn with_lock_hands_back_a_miss_for_the_lock_it_gave_up_on() {
        let (_trigger, stop) = shutdown::channel();
        let locks = OperationLocks::new(Some(Duration::from_millis(50)), stop);
        let _held = locks.acquire(LockCategory::Sell).await.unwrap();

        let miss = locks
            .with_lock(LockCategory::Sell, |_token| async {})
            .await
            .unwrap_err();
        assert_eq!(miss.category(), LockCategory::Sell);
        assert_eq!(miss.failure_kind(), FailureKind::LockTimeout);
        assert_eq!(
            miss.error(),
            &LockError::Timeout { category: LockCategory::Sell, waited: Duration::from_millis(50) }
        );
    }

    #[tokio::test]
    async fn panicking_holder_still_releases() {
        let (_trigger, stop) = shutdown::channel();
        let locks = Arc::new(OperationLocks::new(None, stop));

        let task = tokio::spawn({
            let locks = locks.clone();
            async move {
                let _token = locks.acquire(LockCategory::CandleData).await.unwrap();
                panic!("worker bug");
            }
        });
        assert!(task.await.is_err());

        drop(locks.acquire(LockCategory::CandleData).await.unwrap());
        assert_eq!(
            locks.stats()[&LockCategory::CandleData],
            LockStats { acquired: 2, released: 2 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stop_signal_cancels_waiters() {
        let (trigger, stop) = shutdown::channel();
        let locks = Arc::new(OperationLocks::new(None, stop));
        let token = locks.acquire(LockCategory::Buy).await.unwrap();

        let waiter = tokio::spawn({
            let locks = locks.clone();
            async move { locks.acquire(LockCategory::Buy).await }
        });
        sleep(Duration::from_secs(1)).await;
        trigger.trigger();

        assert_eq!(waiter.await.unwrap().unwrap_err(), LockError::Cancelled(LockCategory::Buy));
        drop(token);
        assert_eq!(locks.stats()[&LockCategory::Buy], LockStats { acquired: 1, released: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn aborted_waiter_leaves_nothing_behind() {
        let (_trigger, stop) = shutdown::channel();
        let locks = Arc::new(OperationLocks::new(None, stop));
        let token = locks.acquire(LockCategory::Sell).await.unwrap();

        let waiter = tokio::spawn({
            let locks = locks.clone();
            async move { locks.acquire(LockCategory::Sell).await.map(|_| ()) }
        });
        sleep(Duration::from_millis(10)).await;
        waiter.abort();
        assert!(waiter.await.unwrap_err().is_cancelled());

        drop(token);
        drop(locks.acquire(LockCategory::Sell).await.unwrap());
        assert!(!locks.stats()[&LockCategory::Sell].held());
    }

    #[tokio::test]
    async fn ordered_acquisition_follows_the_global_order() {
        let (_trigger, stop) = shutdown::channel();
        let locks = OperationLocks::new(None, stop);

        let tokens = locks
            .acquire_ordered(&[LockCategory::Sell, LockCategory::CandleData, LockCategory::Sell])
            .await
            .unwrap();
        let held: Vec<_> = tokens.iter().map(LockToken::category).collect();
        assert_eq!(held, vec![LockCategory::CandleData, LockCategory::Sell]);

        drop(tokens);
        assert!(locks.stats().values().all(|s| !s.held()));
    }
}
