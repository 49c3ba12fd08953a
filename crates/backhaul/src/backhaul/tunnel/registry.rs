use std::{collections::VecDeque, time::Duration};

use tokio::{
    sync::{Mutex, Notify},
    time::Instant,
};

use crate::backhaul::telemetry::ActiveConnection;

/// A registered data-plane connection waiting to be claimed by exactly one public session.
#[derive(Debug)]
pub struct TunnelQueueEntry<S> {
    pub stream: S,
    pub remote: String,
    pub registered_at: Instant,
    active: Option<ActiveConnection>,
}

impl<S> TunnelQueueEntry<S> {
    pub fn new(stream: S, remote: impl Into<String>) -> Self {
        Self {
            stream,
            remote: remote.into(),
            registered_at: Instant::now(),
            active: None,
        }
    }

    /// Ties the tunnel's "active connection" accounting to the entry's lifetime.
    pub fn with_guard(mut self, guard: ActiveConnection) -> Self {
        self.active = Some(guard);
        self
    }

    pub fn age(&self) -> Duration {
        self.registered_at.elapsed()
    }

    pub fn into_parts(self) -> (S, Option<ActiveConnection>) {
        (self.stream, self.active)
    }
}

#[derive(Debug)]
struct QueueState<S> {
    entries: VecDeque<TunnelQueueEntry<S>>,
    closed: bool,
}

/// Per-client FIFO of unclaimed tunnels; the hand-off point between the tunnel listener and
/// public sessions.
#[derive(Debug)]
pub struct TunnelQueue<S> {
    state: Mutex<QueueState<S>>,
    ready: Notify,
    max_age: Duration,
}

impl<S> TunnelQueue<S> {
    /// Entries older than `max_age` are discarded instead of being handed out.
    pub fn new(max_age: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState {
                entries: VecDeque::new(),
                closed: false,
            }),
            ready: Notify::new(),
            max_age,
        }
    }

    /// Enqueues a tunnel. A closed queue hands the entry back so the caller can drop it.
    pub async fn push(&self, entry: TunnelQueueEntry<S>) -> Result<(), TunnelQueueEntry<S>> {
        let mut st = self.state.lock().await;
        if st.closed {
            return Err(entry);
        }
        st.entries.push_back(entry);
        drop(st);
        self.ready.notify_one();
        Ok(())
    }

    /// Claims the oldest fresh entry without waiting.
    pub async fn try_pop(&self) -> Option<TunnelQueueEntry<S>> {
        let mut st = self.state.lock().await;
        self.pop_fresh(&mut st)
    }

    /// Waits for a fresh entry. Returns `None` once the queue is closed.
    ///
    /// Cancel-safe: a caller that gives up (e.g. on timeout) never consumes an entry.
    pub async fn pop(&self) -> Option<TunnelQueueEntry<S>> {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut st = self.state.lock().await;
                if let Some(entry) = self.pop_fresh(&mut st) {
                    return Some(entry);
                }
                if st.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Drops stale entries, returning how many were discarded.
    pub async fn prune(&self) -> usize {
        let mut st = self.state.lock().await;
        let before = st.entries.len();
        let max_age = self.max_age;
        st.entries.retain(|e| e.age() <= max_age);
        before - st.entries.len()
    }

    /// Closes the queue, dropping every pending entry and waking all waiters.
    pub async fn close(&self) {
        let mut st = self.state.lock().await;
        st.closed = true;
        st.entries.clear();
        drop(st);
        self.ready.notify_waiters();
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    fn pop_fresh(&self, st: &mut QueueState<S>) -> Option<TunnelQueueEntry<S>> {
        while let Some(entry) = st.entries.pop_front() {
            if entry.age() > self.max_age {
                tracing::debug!(remote = %entry.remote, "registry: discarded stale tunnel");
                continue;
            }
            return Some(entry);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn queue() -> Arc<TunnelQueue<u32>> {
        Arc::new(TunnelQueue::new(Duration::from_secs(30)))
    }

    #[tokio::test]
    async fn pops_in_fifo_order() {
        let q = queue();
        for i in 0..3 {
            q.push(TunnelQueueEntry::new(i, "t")).await.unwrap();
        }
        assert_eq!(q.len().await, 3);
        for i in 0..3 {
            assert_eq!(q.pop().await.unwrap().stream, i);
        }
        assert!(q.try_pop().await.is_none());
    }

    #[tokio::test]
    async fn pop_waits_for_push() {
        let q = queue();
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.pop().await.map(|e| e.stream) })
        };
        tokio::task::yield_now().await;
        q.push(TunnelQueueEntry::new(9, "t")).await.unwrap();
        assert_eq!(waiter.await.unwrap(), Some(9));
    }

    #[tokio::test]
    async fn concurrent_waiters_get_distinct_entries() {
        let q = queue();
        let mut waiters = Vec::new();
        for _ in 0..8 {
            let q = q.clone();
            waiters.push(tokio::spawn(async move { q.pop().await.map(|e| e.stream) }));
        }
        tokio::task::yield_now().await;
        for i in 0..8 {
            q.push(TunnelQueueEntry::new(i, "t")).await.unwrap();
        }

        let mut got = Vec::new();
        for w in waiters {
            got.push(w.await.unwrap().unwrap());
        }
        got.sort_unstable();
        assert_eq!(got, (0..8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn timed_out_waiter_does_not_consume() {
        let q = queue();
        let res = tokio::time::timeout(Duration::from_millis(10), q.pop()).await;
        assert!(res.is_err());

        q.push(TunnelQueueEntry::new(1, "t")).await.unwrap();
        assert_eq!(q.len().await, 1);
        assert_eq!(q.pop().await.unwrap().stream, 1);
    }

    #[tokio::test]
    async fn close_wakes_waiters_and_rejects_pushes() {
        let q = queue();
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.pop().await.is_none() })
        };
        tokio::task::yield_now().await;
        q.close().await;
        assert!(waiter.await.unwrap());

        let rejected = q.push(TunnelQueueEntry::new(5, "t")).await.unwrap_err();
        assert_eq!(rejected.stream, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_entries_are_skipped_and_pruned() {
        let q = queue();
        q.push(TunnelQueueEntry::new(1, "old")).await.unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;
        q.push(TunnelQueueEntry::new(2, "new")).await.unwrap();

        assert_eq!(q.try_pop().await.unwrap().stream, 2);

        q.push(TunnelQueueEntry::new(3, "x")).await.unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(q.prune().await, 1);
        assert_eq!(q.len().await, 0);
    }
}
