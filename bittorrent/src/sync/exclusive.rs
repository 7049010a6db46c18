use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use tokio::sync::Notify;

struct State {
    locked: bool,
    waiters: VecDeque<Arc<Notify>>,
}

/// A single-slot async mutex that hands the lock to waiters in the order
/// they called `acquire`, not in whatever order the runtime happens to wake
/// tasks. Built from a plain queue of `Notify` handles rather than
/// `tokio::sync::Mutex`, since that type makes no fairness guarantee at all.
///
/// Used to serialise the handful of torrent-wide critical sections that
/// must not interleave: piece-completion bookkeeping against concurrent
/// `handle_message` calls is the one the engine relies on.
pub struct AsyncExclusive {
    state: Mutex<State>,
}

impl AsyncExclusive {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                locked: false,
                waiters: VecDeque::new(),
            }),
        }
    }

    pub async fn acquire(&self) -> ExclusiveGuard<'_> {
        let notify = {
            let mut state = self.state.lock().unwrap();
            if !state.locked {
                state.locked = true;
                None
            } else {
                let notify = Arc::new(Notify::new());
                state.waiters.push_back(notify.clone());
                Some(notify)
            }
        };

        if let Some(notify) = notify {
            notify.notified().await;
        }

        ExclusiveGuard { lock: self }
    }

    fn release(&self) {
        let mut state = self.state.lock().unwrap();
        match state.waiters.pop_front() {
            // Ownership passes straight to the next waiter; `locked` stays true.
            Some(next) => next.notify_one(),
            None => state.locked = false,
        }
    }
}

impl Default for AsyncExclusive {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases the exclusive section on drop, waking the next queued waiter
/// if there is one.
pub struct ExclusiveGuard<'a> {
    lock: &'a AsyncExclusive,
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_mutual_exclusion() {
        let lock = Arc::new(AsyncExclusive::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for _ in 0..50 {
            let lock = lock.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                let _guard = lock.acquire().await;
                let before = counter.fetch_add(1, Ordering::SeqCst);
                tokio::task::yield_now().await;
                assert_eq!(counter.load(Ordering::SeqCst), before + 1);
            }));
        }

        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 50);
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let lock = Arc::new(AsyncExclusive::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        // Hold the lock so subsequent acquires queue up in program order.
        let first_guard = lock.acquire().await;

        let mut handles = Vec::new();
        for i in 0..5 {
            let lock = lock.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _guard = lock.acquire().await;
                order.lock().unwrap().push(i);
            }));
            // Give each task a chance to register as a waiter before the next spawns.
            tokio::task::yield_now().await;
        }

        drop(first_guard);
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }
}
