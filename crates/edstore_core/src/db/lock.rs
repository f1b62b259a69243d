//! Process-wide write lock with abandoned-owner recovery.
//!
//! # Responsibility
//! - Serialize every write statement and transaction across all connections.
//! - Track which threads are waiting so a leaked lock can be recovered.
//!
//! # Invariants
//! - At most one thread owns the lock; the owner may re-acquire it (hold count).
//! - A thread is in the waiting set exactly while blocked in `acquire`.
//! - [`WriteLock`] is `!Send`: a held lock never moves to another thread.
//! - A lock whose owning thread has exited without releasing is replaced by a
//!   fresh generation and every waiter is woken to retry against it.

use log::{debug, error, warn};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

/// Interval at which blocked waiters re-check whether the owner is still alive.
pub const DEFAULT_LEAK_POLL: Duration = Duration::from_millis(250);

static GLOBAL_BROKER: Lazy<Arc<LockBroker>> = Lazy::new(|| Arc::new(LockBroker::new()));

thread_local! {
    // Dropped by the runtime when the thread exits; owners hold a `Weak` to it.
    static THREAD_LIVENESS: Arc<()> = Arc::new(());
}

struct Owner {
    thread: ThreadId,
    // `None` when the owner acquired during thread teardown; never treated as leaked.
    liveness: Option<Weak<()>>,
    holds: usize,
}

impl Owner {
    fn is_abandoned(&self) -> bool {
        self.liveness
            .as_ref()
            .is_some_and(|token| token.strong_count() == 0)
    }
}

#[derive(Default)]
struct BrokerState {
    owner: Option<Owner>,
    generation: u64,
    /// `true` = still waiting; `false` = woken by leak recovery, must retry.
    waiting: HashMap<ThreadId, bool>,
    leaks_recovered: u64,
}

/// Mutual-exclusion primitive shared by every connection of the process.
pub struct LockBroker {
    state: Mutex<BrokerState>,
    released: Condvar,
    leak_poll: Duration,
}

impl Default for LockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl LockBroker {
    pub fn new() -> Self {
        Self::with_leak_poll(DEFAULT_LEAK_POLL)
    }

    /// Creates a broker whose waiters check owner liveness every `leak_poll`.
    pub fn with_leak_poll(leak_poll: Duration) -> Self {
        Self {
            state: Mutex::new(BrokerState::default()),
            released: Condvar::new(),
            leak_poll,
        }
    }

    /// Returns the broker shared by the whole process.
    pub fn global() -> Arc<LockBroker> {
        Arc::clone(&GLOBAL_BROKER)
    }

    /// Blocks until the calling thread owns the lock.
    ///
    /// Re-entrant: a thread that already owns the lock gets another guard
    /// immediately and the lock is released when the last guard drops.
    pub fn acquire(&self) -> WriteLock<'_> {
        let me = thread::current().id();
        let mut state = self.lock_state();

        if let Some(owner) = state.owner.as_mut() {
            if owner.thread == me {
                owner.holds += 1;
                let generation = state.generation;
                return WriteLock::new(self, generation);
            }
        }

        state.waiting.insert(me, true);
        loop {
            let abandoned = match state.owner.as_ref() {
                None => break,
                Some(owner) => owner.is_abandoned(),
            };

            if abandoned {
                self.recover_leak(&mut state);
                continue;
            }

            let (next, _) = self
                .released
                .wait_timeout(state, self.leak_poll)
                .unwrap_or_else(PoisonError::into_inner);
            state = next;

            if state.waiting.get(&me) == Some(&false) {
                debug!(
                    "event=lock_acquire module=db status=retry generation={}",
                    state.generation
                );
                state.waiting.insert(me, true);
            }
        }

        state.waiting.remove(&me);
        state.owner = Some(Owner {
            thread: me,
            liveness: THREAD_LIVENESS.try_with(Arc::downgrade).ok(),
            holds: 1,
        });
        let generation = state.generation;
        WriteLock::new(self, generation)
    }

    /// Returns whether any thread currently owns the lock.
    pub fn is_held(&self) -> bool {
        self.lock_state().owner.is_some()
    }

    /// Returns whether the calling thread owns the lock.
    pub fn is_held_by_current_thread(&self) -> bool {
        let me = thread::current().id();
        self.lock_state()
            .owner
            .as_ref()
            .is_some_and(|owner| owner.thread == me)
    }

    /// Number of threads blocked in [`LockBroker::acquire`].
    pub fn waiting_threads(&self) -> usize {
        self.lock_state().waiting.len()
    }

    /// Number of abandoned locks recovered since creation.
    pub fn leaks_recovered(&self) -> u64 {
        self.lock_state().leaks_recovered
    }

    /// Current lock generation; bumped every time a leaked lock is replaced.
    pub fn generation(&self) -> u64 {
        self.lock_state().generation
    }

    fn release(&self, generation: u64) {
        let me = thread::current().id();
        let mut state = self.lock_state();

        if state.generation != generation {
            // The lock this guard belonged to was already replaced.
            warn!(
                "event=lock_release module=db status=skipped reason=stale_generation guard_generation={} current_generation={}",
                generation, state.generation
            );
            return;
        }

        let Some(owner) = state.owner.as_mut() else {
            error!("event=lock_release module=db status=error error_code=lock_not_held");
            return;
        };
        if owner.thread != me {
            error!("event=lock_release module=db status=error error_code=not_owner");
            return;
        }

        owner.holds -= 1;
        if owner.holds == 0 {
            state.owner = None;
            drop(state);
            self.released.notify_one();
        }
    }

    fn recover_leak(&self, state: &mut BrokerState) {
        state.owner = None;
        state.generation += 1;
        state.leaks_recovered += 1;

        let mut interrupted = 0usize;
        for still_waiting in state.waiting.values_mut() {
            if *still_waiting {
                *still_waiting = false;
                interrupted += 1;
            }
        }

        warn!(
            "event=lock_leak module=db status=recovered generation={} interrupted_waiters={}",
            state.generation, interrupted
        );
        self.released.notify_all();
    }

    fn lock_state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Proof of write-lock ownership; releases the lock when dropped.
///
/// The guard cannot be sent to another thread.
#[must_use = "the write lock is released as soon as the guard is dropped"]
pub struct WriteLock<'a> {
    broker: &'a LockBroker,
    generation: u64,
    _not_send: PhantomData<*const ()>,
}

impl<'a> WriteLock<'a> {
    fn new(broker: &'a LockBroker, generation: u64) -> Self {
        Self {
            broker,
            generation,
            _not_send: PhantomData,
        }
    }

    /// Releases the lock now instead of at end of scope.
    pub fn release(self) {}
}

impl Drop for WriteLock<'_> {
    fn drop(&mut self) {
        self.broker.release(self.generation);
    }
}

#[cfg(test)]
mod tests {
    use super::LockBroker;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn acquire_and_release_toggles_held_state() {
        let broker = LockBroker::new();
        assert!(!broker.is_held());

        let guard = broker.acquire();
        assert!(broker.is_held());
        drop(guard);

        assert!(!broker.is_held());
        assert_eq!(broker.waiting_threads(), 0);
    }

    #[test]
    fn ownership_is_reported_per_thread() {
        let broker = Arc::new(LockBroker::new());
        assert!(!broker.is_held_by_current_thread());

        let guard = broker.acquire();
        assert!(broker.is_held_by_current_thread());
        let other = Arc::clone(&broker);
        let seen_elsewhere = thread::spawn(move || other.is_held_by_current_thread())
            .join()
            .unwrap();
        assert!(!seen_elsewhere);

        guard.release();
        assert!(!broker.is_held_by_current_thread());
    }

    #[test]
    fn owner_can_reacquire_without_deadlock() {
        let broker = LockBroker::new();
        let outer = broker.acquire();
        let inner = broker.acquire();
        drop(inner);
        assert!(broker.is_held(), "outer guard must keep the lock");
        drop(outer);
        assert!(!broker.is_held());
    }

    #[test]
    fn concurrent_holders_never_overlap() {
        let broker = Arc::new(LockBroker::new());
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let start = Arc::new(Barrier::new(8));

        let handles = (0..8)
            .map(|_| {
                let broker = Arc::clone(&broker);
                let active = Arc::clone(&active);
                let max_seen = Arc::clone(&max_seen);
                let start = Arc::clone(&start);
                thread::spawn(move || {
                    start.wait();
                    for _ in 0..20 {
                        let _guard = broker.acquire();
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_micros(200));
                        active.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert!(!broker.is_held());
    }

    #[test]
    fn panicking_owner_releases_through_unwind() {
        let broker = Arc::new(LockBroker::new());
        let owner = Arc::clone(&broker);
        let result = thread::spawn(move || {
            let _guard = owner.acquire();
            panic!("owner failed mid-write");
        })
        .join();
        assert!(result.is_err());

        drop(broker.acquire());
        assert_eq!(broker.leaks_recovered(), 0);
    }

    #[test]
    fn forgotten_guard_on_exited_thread_is_recovered() {
        let broker = Arc::new(LockBroker::with_leak_poll(Duration::from_millis(10)));
        let owner = Arc::clone(&broker);
        thread::spawn(move || std::mem::forget(owner.acquire()))
            .join()
            .unwrap();

        assert!(broker.is_held());
        let guard = broker.acquire();
        assert_eq!(broker.leaks_recovered(), 1);
        assert_eq!(broker.generation(), 1);
        drop(guard);
        assert!(!broker.is_held());
    }
}
