//! Periodic snapshot polling with per-subscriber fan-out.
//!
//! Each subscriber owns a small bounded queue. A tick never waits on a
//! subscriber: if its queue is full it is dropped and told so, rather than
//! silently skipping snapshots or stalling everyone else.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use quickdock_core::{EngineError, SharedSnapshot, SnapshotBuilder, StateSnapshot};
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;

use crate::error::HubError;

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Time between polls.
    pub interval: Duration,
    /// Snapshots a subscriber may have queued before it is dropped.
    pub subscriber_buffer: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            subscriber_buffer: 8,
        }
    }
}

struct Slot {
    tx: mpsc::Sender<SharedSnapshot>,
    overloaded: Arc<AtomicBool>,
}

#[derive(Default)]
struct Inner {
    current: Option<SharedSnapshot>,
    seq: u64,
    subscribers: HashMap<u64, Slot>,
}

/// Holds the current snapshot and pushes every new one to all subscribers.
pub struct BroadcastHub {
    builder: SnapshotBuilder,
    config: HubConfig,
    inner: Mutex<Inner>,
    next_id: AtomicU64,
}

impl BroadcastHub {
    #[must_use]
    pub fn new(builder: SnapshotBuilder, config: HubConfig) -> Arc<Self> {
        Arc::new(Self {
            builder,
            config,
            inner: Mutex::new(Inner::default()),
            next_id: AtomicU64::new(1),
        })
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The most recently published snapshot, if any tick has succeeded.
    #[must_use]
    pub fn current(&self) -> Option<SharedSnapshot> {
        self.inner().current.clone()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner().subscribers.len()
    }

    /// Register a subscriber. The current snapshot, if any, is queued
    /// immediately so the client does not wait a full interval.
    #[must_use]
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.config.subscriber_buffer.max(1));
        let overloaded = Arc::new(AtomicBool::new(false));

        let mut inner = self.inner();
        if let Some(current) = &inner.current {
            // Fresh channel with capacity >= 1, cannot be full.
            let _ = tx.try_send(Arc::clone(current));
        }
        inner.subscribers.insert(
            id,
            Slot {
                tx,
                overloaded: Arc::clone(&overloaded),
            },
        );
        drop(inner);

        tracing::debug!(subscriber_id = id, "Subscriber registered");
        Subscription {
            id,
            rx,
            overloaded,
            hub: Arc::downgrade(self),
            closed: false,
        }
    }

    /// Remove a subscriber. Idempotent and never blocks on I/O.
    ///
    /// Returns whether the subscriber was still registered.
    pub fn unsubscribe(&self, id: u64) -> bool {
        let removed = self.inner().subscribers.remove(&id).is_some();
        if removed {
            tracing::debug!(subscriber_id = id, "Subscriber removed");
        }
        removed
    }

    /// Run one poll: build a snapshot and publish it.
    ///
    /// On failure nothing is published and the previous snapshot stays current.
    ///
    /// # Errors
    /// Returns the engine error that prevented the snapshot from being built.
    pub async fn tick(&self) -> Result<SharedSnapshot, EngineError> {
        match self.builder.build().await {
            Ok(snapshot) => Ok(self.publish(snapshot)),
            Err(e) => {
                tracing::warn!(error = %e, "Snapshot tick failed, keeping previous snapshot");
                Err(e)
            }
        }
    }

    fn publish(&self, snapshot: StateSnapshot) -> SharedSnapshot {
        let mut inner = self.inner();
        inner.seq += 1;
        let snapshot = Arc::new(snapshot.sequenced(inner.seq));
        inner.current = Some(Arc::clone(&snapshot));

        inner.subscribers.retain(|&id, slot| {
            match slot.tx.try_send(Arc::clone(&snapshot)) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    slot.overloaded.store(true, Ordering::Release);
                    tracing::warn!(subscriber_id = id, "Dropping subscriber that cannot keep up");
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });

        tracing::debug!(
            seq = snapshot.seq,
            projects = snapshot.projects.len(),
            subscribers = inner.subscribers.len(),
            "Snapshot published"
        );
        snapshot
    }

    /// Poll on the configured interval until `cancel` fires.
    ///
    /// Subscribers are released when the loop ends.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = self.tick() => {}
            }
        }

        self.inner().subscribers.clear();
        tracing::info!("Broadcast hub stopped");
    }

    /// Spawn [`Self::run`] on the runtime.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        tokio::spawn(async move { hub.run(cancel).await })
    }
}

/// A live registration with the hub. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<SharedSnapshot>,
    overloaded: Arc<AtomicBool>,
    hub: Weak<BroadcastHub>,
    closed: bool,
}

impl Subscription {
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next snapshot.
    ///
    /// Snapshots arrive in publication order. Once the subscriber has been
    /// dropped for falling behind, the queued snapshots are still yielded and
    /// then `SubscriberOverloaded` is returned.
    ///
    /// # Errors
    /// `SubscriberOverloaded` if the hub dropped this subscriber, `Closed` if
    /// it was unsubscribed or the hub stopped.
    pub async fn recv(&mut self) -> Result<SharedSnapshot, HubError> {
        if self.closed {
            return Err(HubError::Closed);
        }
        match self.rx.recv().await {
            Some(snapshot) => Ok(snapshot),
            None if self.overloaded.load(Ordering::Acquire) => Err(HubError::SubscriberOverloaded),
            None => Err(HubError::Closed),
        }
    }

    /// Unsubscribe. Nothing is yielded after this returns.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.rx.close();
        if let Some(hub) = self.hub.upgrade() {
            hub.unsubscribe(self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use quickdock_core::{
        ContainerStatus,
        testing::{ScriptedEngine, container_view},
    };

    use super::*;

    fn hub_with(engine: &Arc<ScriptedEngine>, buffer: usize) -> Arc<BroadcastHub> {
        BroadcastHub::new(
            SnapshotBuilder::new(engine.clone()),
            HubConfig {
                interval: Duration::from_millis(10),
                subscriber_buffer: buffer,
            },
        )
    }

    fn engine() -> Arc<ScriptedEngine> {
        ScriptedEngine::new(vec![container_view("a", ContainerStatus::Running, Some("x"))])
    }

    #[tokio::test]
    async fn test_subscribers_receive_ticks_in_order() {
        let engine = engine();
        let hub = hub_with(&engine, 8);
        let mut first = hub.subscribe();
        let mut second = hub.subscribe();

        for _ in 0..3 {
            hub.tick().await.unwrap();
        }

        for sub in [&mut first, &mut second] {
            let seqs = [
                sub.recv().await.unwrap().seq,
                sub.recv().await.unwrap().seq,
                sub.recv().await.unwrap().seq,
            ];
            assert_eq!(seqs, [1, 2, 3]);
        }
    }

    #[tokio::test]
    async fn test_failed_tick_publishes_nothing() {
        let engine = engine();
        let hub = hub_with(&engine, 8);
        let mut sub = hub.subscribe();

        hub.tick().await.unwrap();
        engine.set_unavailable(true);
        assert!(hub.tick().await.is_err());
        assert_eq!(hub.current().unwrap().seq, 1);

        engine.set_unavailable(false);
        hub.tick().await.unwrap();

        assert_eq!(sub.recv().await.unwrap().seq, 1);
        assert_eq!(sub.recv().await.unwrap().seq, 2);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), sub.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_new_subscriber_gets_current_snapshot_immediately() {
        let engine = engine();
        let hub = hub_with(&engine, 8);
        hub.tick().await.unwrap();
        hub.tick().await.unwrap();

        let mut late = hub.subscribe();
        let snapshot = late.recv().await.unwrap();
        assert_eq!(snapshot.seq, 2);
        assert_eq!(snapshot.project("x").unwrap().containers.len(), 1);
    }

    #[tokio::test]
    async fn test_no_snapshot_before_first_tick() {
        let engine = engine();
        let hub = hub_with(&engine, 8);
        let mut sub = hub.subscribe();
        assert!(hub.current().is_none());
        assert!(
            tokio::time::timeout(Duration::from_millis(30), sub.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_dropped_without_blocking_others() {
        let engine = engine();
        let hub = hub_with(&engine, 2);
        let mut slow = hub.subscribe();
        let mut fast = hub.subscribe();

        for expected in 1..=4 {
            hub.tick().await.unwrap();
            assert_eq!(fast.recv().await.unwrap().seq, expected);
        }

        assert_eq!(hub.subscriber_count(), 1);
        assert_eq!(slow.recv().await.unwrap().seq, 1);
        assert_eq!(slow.recv().await.unwrap().seq, 2);
        assert_eq!(slow.recv().await.unwrap_err(), HubError::SubscriberOverloaded);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent_and_final() {
        let engine = engine();
        let hub = hub_with(&engine, 8);
        let mut sub = hub.subscribe();
        hub.tick().await.unwrap();

        sub.close();
        sub.close();
        assert!(!hub.unsubscribe(sub.id()));
        assert_eq!(hub.subscriber_count(), 0);

        hub.tick().await.unwrap();
        assert_eq!(sub.recv().await.unwrap_err(), HubError::Closed);
    }

    #[tokio::test]
    async fn test_dropping_subscription_unsubscribes() {
        let engine = engine();
        let hub = hub_with(&engine, 8);
        let sub = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 1);
        drop(sub);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_run_loop_polls_and_stops_on_cancel() {
        let engine = engine();
        let hub = hub_with(&engine, 64);
        let mut sub = hub.subscribe();
        let cancel = CancellationToken::new();
        let handle = hub.spawn(cancel.clone());

        let first = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(second.seq > first.seq);

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(hub.subscriber_count(), 0);
        while let Ok(_) = sub.recv().await {}
        assert!(engine.list_calls() >= 2);
    }

    #[tokio::test]
    async fn test_run_loop_survives_engine_outage() {
        let engine = engine();
        engine.set_unavailable(true);
        let hub = hub_with(&engine, 64);
        let mut sub = hub.subscribe();
        let cancel = CancellationToken::new();
        let handle = hub.spawn(cancel.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(hub.current().is_none());

        engine.set_unavailable(false);
        let snapshot = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.seq, 1);

        cancel.cancel();
        handle.await.unwrap();
    }
}
