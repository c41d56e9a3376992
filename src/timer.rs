//! Cancellable one-shot timers.
//!
//! A timer belongs to whoever scheduled it. Scheduling again replaces the
//! pending run instead of stacking a second one, and dropping the owner
//! cancels whatever is still pending.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use tokio::task::JoinHandle;

#[derive(Debug, Default)]
pub struct CancellableTimer {
    handle: Option<JoinHandle<()>>,
}

impl CancellableTimer {
    pub fn new() -> Self {
        Self { handle: None }
    }

    /// Runs `f` after `delay`, cancelling any run that is still pending.
    pub fn schedule<F>(&mut self, delay: Duration, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.cancel();
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            f();
        }));
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn is_pending(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for CancellableTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Identifies one scheduling of a key in a [`TimerSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ticket(u64);

/// One [`CancellableTimer`] per key.
///
/// A callback that already fired can still be waiting on a lock while its
/// key is rescheduled. It gets the [`Ticket`] it was scheduled under and
/// should act only if [`finish`](Self::finish) accepts it.
#[derive(Debug)]
pub struct TimerSet<K> {
    timers: HashMap<K, (Ticket, CancellableTimer)>,
    next: u64,
}

impl<K: Eq + Hash> TimerSet<K> {
    pub fn new() -> Self {
        Self {
            timers: HashMap::new(),
            next: 0,
        }
    }

    pub fn schedule<F>(&mut self, key: K, delay: Duration, f: F) -> Ticket
    where
        F: FnOnce(Ticket) + Send + 'static,
    {
        self.next += 1;
        let ticket = Ticket(self.next);
        let (current, timer) = self.timers.entry(key).or_default();
        *current = ticket;
        timer.schedule(delay, move || f(ticket));
        ticket
    }

    /// Retires `key` if `ticket` is still its latest scheduling. A stale
    /// ticket leaves the newer timer alone and returns `false`.
    pub fn finish(&mut self, key: &K, ticket: Ticket) -> bool {
        if self.timers.get(key).is_some_and(|(current, _)| *current == ticket) {
            self.timers.remove(key);
            true
        } else {
            false
        }
    }

    pub fn cancel(&mut self, key: &K) {
        // Dropping the timer aborts it.
        self.timers.remove(key);
    }

    pub fn cancel_where<P>(&mut self, mut pred: P)
    where
        P: FnMut(&K) -> bool,
    {
        self.timers.retain(|k, _| !pred(k));
    }

    pub fn cancel_all(&mut self) {
        self.timers.clear();
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.timers.get(key).is_some_and(|(_, t)| t.is_pending())
    }

    pub fn len(&self) -> usize {
        self.timers.values().filter(|(_, t)| t.is_pending()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Eq + Hash> Default for TimerSet<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn rescheduling_replaces_the_pending_run() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut timer = CancellableTimer::new();

        for _ in 0..3 {
            let fired = fired.clone();
            timer.schedule(Duration::from_millis(2000), move || {
                fired.fetch_add(1, Ordering::SeqCst);
            });
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(1600)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_owner_cancels() {
        let fired = Arc::new(AtomicUsize::new(0));
        {
            let mut set = TimerSet::new();
            let f = fired.clone();
            set.schedule("a", Duration::from_millis(100), move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            });
            assert!(set.is_pending(&"a"));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_where_only_touches_matching_keys() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut set = TimerSet::new();
        for key in [("c1", 1), ("c1", 2), ("c2", 1)] {
            let f = fired.clone();
            set.schedule(key, Duration::from_millis(100), move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            });
        }
        set.cancel_where(|(chat, _)| *chat == "c1");
        assert_eq!(set.len(), 1);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_tickets_do_not_retire_a_rescheduled_key() {
        let mut set = TimerSet::new();
        let first = set.schedule("c1", Duration::from_millis(100), |_| {});
        let second = set.schedule("c1", Duration::from_millis(100), |_| {});
        assert_ne!(first, second);

        assert!(!set.finish(&"c1", first));
        assert!(set.is_pending(&"c1"));

        assert!(set.finish(&"c1", second));
        assert!(!set.is_pending(&"c1"));
        assert!(!set.finish(&"c1", second));
    }

    #[tokio::test(start_paused = true)]
    async fn callbacks_receive_their_own_ticket() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut set = TimerSet::new();
        let s = seen.clone();
        let ticket = set.schedule("c1", Duration::from_millis(100), move |t| {
            s.lock().unwrap().push(t);
        });
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(*seen.lock().unwrap(), vec![ticket]);
        assert!(set.finish(&"c1", ticket));
    }
}
