//! Per-user presence.
//!
//! [`PresenceTracker`] owns the local state machines and their timers and
//! emits a [`PresenceSnapshot`] for every transition; [`publisher`] pushes
//! those onto the fanout backbone, and every instance folds them into its
//! [`PresenceDirectory`].
//!
//! Each online period of a user carries an epoch. A connection holds a
//! [`PresenceLease`] stamped with the epoch it joined, so signals from a
//! connection that outlived a hard timeout cannot touch the next period.

pub mod directory;
pub mod publisher;
pub mod state;

pub use directory::{PresenceDirectory, PresenceSnapshot, UserPresenceView};
pub use state::{PresenceError, PresenceSignal, PresenceState, PresenceStatus, Timeouts};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::config::PresenceConfig;
use crate::metrics;

struct Timer {
    handle: AbortHandle,
    deadline: DateTime<Utc>,
    generation: u64,
}

struct UserPresence {
    state: PresenceState,
    timer: Option<Timer>,
    epoch: u64,
}

/// One connection's device slot in its user's presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceLease {
    user_id: Uuid,
    epoch: u64,
}

impl PresenceLease {
    pub fn user_id(&self) -> Uuid {
        self.user_id
    }
}

impl Drop for UserPresence {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.handle.abort();
        }
    }
}

pub struct PresenceTracker {
    instance_id: Uuid,
    timeouts: Timeouts,
    records: DashMap<Uuid, UserPresence>,
    seq: AtomicU64,
    generations: AtomicU64,
    epochs: AtomicU64,
    changes: mpsc::UnboundedSender<PresenceSnapshot>,
    weak_self: Weak<PresenceTracker>,
}

impl PresenceTracker {
    /// Build a tracker. The receiver yields snapshots in emission order and
    /// must be drained by a single publisher task.
    pub fn new(
        instance_id: Uuid,
        config: &PresenceConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<PresenceSnapshot>) {
        let (changes, rx) = mpsc::unbounded_channel();
        let timeouts = Timeouts {
            idle: config.idle_timeout,
            hard: config.hard_timeout,
        };
        let tracker = Arc::new_cyclic(|weak_self| Self {
            instance_id,
            timeouts,
            records: DashMap::new(),
            seq: AtomicU64::new(0),
            generations: AtomicU64::new(0),
            epochs: AtomicU64::new(0),
            changes,
            weak_self: weak_self.clone(),
        });
        (tracker, rx)
    }

    /// Count one more device for `user_id`.
    pub fn connect(&self, user_id: Uuid) -> PresenceLease {
        // Connect is always valid and never stale.
        let epoch = match self.signal(user_id, PresenceSignal::Connect, None) {
            Ok(Some((_, epoch))) => epoch,
            _ => 0,
        };
        PresenceLease { user_id, epoch }
    }

    /// Release the lease's device slot. Ignored when the lease's online
    /// period already ended.
    pub fn disconnect(&self, lease: PresenceLease) {
        if let Ok(None) = self.signal(lease.user_id, PresenceSignal::Disconnect, Some(lease.epoch)) {
            tracing::debug!(user_id = %lease.user_id, "stale presence disconnect ignored");
        }
    }

    /// Keep-alive from a live connection. A lease whose period timed out
    /// joins the current one again.
    pub fn heartbeat(&self, lease: &mut PresenceLease) {
        if let Ok(None) = self.signal(lease.user_id, PresenceSignal::Heartbeat, Some(lease.epoch)) {
            self.rejoin(lease);
        }
    }

    pub fn activity(&self, lease: &mut PresenceLease) {
        if let Ok(None) = self.signal(lease.user_id, PresenceSignal::Activity, Some(lease.epoch)) {
            self.rejoin(lease);
        }
    }

    pub fn call_start(&self, user_id: Uuid) -> Result<PresenceStatus, PresenceError> {
        self.signal(user_id, PresenceSignal::CallStart, None)
            .map(|r| r.map_or(PresenceStatus::Offline, |(status, _)| status))
    }

    pub fn call_end(&self, user_id: Uuid) -> PresenceStatus {
        match self.signal(user_id, PresenceSignal::CallEnd, None) {
            Ok(Some((status, _))) => status,
            _ => PresenceStatus::Offline,
        }
    }

    fn rejoin(&self, lease: &mut PresenceLease) {
        tracing::info!(user_id = %lease.user_id, "presence restored for live connection");
        *lease = self.connect(lease.user_id);
    }

    /// Local status only; use the directory for the cluster-wide view.
    pub fn status(&self, user_id: Uuid) -> PresenceStatus {
        self.records
            .get(&user_id)
            .map(|r| r.state.status)
            .unwrap_or(PresenceStatus::Offline)
    }

    pub fn state(&self, user_id: Uuid) -> Option<PresenceState> {
        self.records.get(&user_id).map(|r| r.state.clone())
    }

    pub fn tracked_users(&self) -> usize {
        self.records.len()
    }

    /// Re-emit a snapshot for every locally present user so remote
    /// directories stay fresh even if a transition event was lost.
    pub fn republish_local(&self) -> usize {
        let now = Utc::now();
        let mut count = 0;
        for record in self.records.iter() {
            if record.state.status != PresenceStatus::Offline {
                self.send_snapshot(*record.key(), &record.state, now);
                count += 1;
            }
        }
        count
    }

    /// Apply `signal`. With `epoch` set the signal is scoped to that online
    /// period and yields `Ok(None)` when the period is over.
    fn signal(
        &self,
        user_id: Uuid,
        signal: PresenceSignal,
        epoch: Option<u64>,
    ) -> Result<Option<(PresenceStatus, u64)>, PresenceError> {
        let now = Utc::now();
        let result = {
            let mut record = self
                .records
                .entry(user_id)
                .or_insert_with(|| UserPresence {
                    state: PresenceState::offline(now),
                    timer: None,
                    epoch: 0,
                });
            let was_offline = record.state.status == PresenceStatus::Offline;
            if epoch.is_some_and(|e| was_offline || e != record.epoch) {
                Ok(None)
            } else {
                match record.state.apply(signal, now) {
                    Ok(transition) => {
                        if was_offline && record.state.status != PresenceStatus::Offline {
                            record.epoch = self.epochs.fetch_add(1, Ordering::Relaxed) + 1;
                        }
                        if let Some(t) = transition {
                            self.emit(user_id, &record.state, t, now);
                        }
                        self.rearm(user_id, &mut record);
                        Ok(Some((record.state.status, record.epoch)))
                    }
                    Err(e) => Err(e),
                }
            }
        };
        self.evict_if_offline(user_id);
        result
    }

    fn on_timer(&self, user_id: Uuid, generation: u64) {
        let now = Utc::now();
        {
            let Some(mut record) = self.records.get_mut(&user_id) else {
                return;
            };
            match &record.timer {
                Some(timer) if timer.generation == generation => {}
                _ => return,
            }
            record.timer = None;

            if let Some(t) = record.state.evaluate(now, &self.timeouts) {
                if t.to == PresenceStatus::Offline {
                    tracing::info!(user_id = %user_id, "presence heartbeat timeout");
                }
                self.emit(user_id, &record.state, t, now);
            }
            self.rearm(user_id, &mut record);
        }
        self.evict_if_offline(user_id);
    }

    /// Keep one pending timer per user, firing at the nearest deadline.
    /// Deadlines only move later on heartbeats, so an existing earlier timer
    /// is kept and re-evaluates on fire.
    fn rearm(&self, user_id: Uuid, record: &mut UserPresence) {
        let Some(deadline) = record.state.next_deadline(&self.timeouts) else {
            if let Some(timer) = record.timer.take() {
                timer.handle.abort();
            }
            return;
        };

        if let Some(timer) = &record.timer {
            if timer.deadline <= deadline {
                return;
            }
            timer.handle.abort();
        }

        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let delay = (deadline - Utc::now()).to_std().unwrap_or_default();
        let tracker = self.weak_self.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tracker) = tracker.upgrade() {
                tracker.on_timer(user_id, generation);
            }
        });

        record.timer = Some(Timer {
            handle: task.abort_handle(),
            deadline,
            generation,
        });
    }

    fn evict_if_offline(&self, user_id: Uuid) {
        self.records
            .remove_if(&user_id, |_, r| r.state.status == PresenceStatus::Offline);
    }

    fn emit(&self, user_id: Uuid, state: &PresenceState, t: state::Transition, now: DateTime<Utc>) {
        metrics::PRESENCE_TRANSITIONS
            .with_label_values(&[t.to.as_str()])
            .inc();
        tracing::debug!(
            user_id = %user_id,
            from = t.from.as_str(),
            to = t.to.as_str(),
            devices = state.device_count,
            "presence transition"
        );
        self.send_snapshot(user_id, state, now);
    }

    // Called with the user's record locked, which keeps per-user order.
    fn send_snapshot(&self, user_id: Uuid, state: &PresenceState, now: DateTime<Utc>) {
        let snapshot = PresenceSnapshot {
            user_id,
            instance_id: self.instance_id,
            status: state.status,
            device_count: state.device_count,
            seq: self.seq.fetch_add(1, Ordering::Relaxed) + 1,
            at: now,
        };
        if self.changes.send(snapshot).is_err() {
            tracing::debug!(user_id = %user_id, "presence publisher gone, snapshot dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> PresenceConfig {
        PresenceConfig {
            heartbeat_interval: Duration::from_millis(50),
            idle_timeout: Duration::from_millis(200),
            hard_timeout: Duration::from_millis(400),
            stale_after: Duration::from_millis(150),
        }
    }

    #[tokio::test]
    async fn connect_disconnect_emits_ordered_snapshots() {
        let (tracker, mut rx) = PresenceTracker::new(Uuid::new_v4(), &config());
        let user = Uuid::new_v4();

        let first = tracker.connect(user);
        assert_eq!(tracker.status(user), PresenceStatus::Online);
        let second = tracker.connect(user);
        tracker.disconnect(first);
        tracker.disconnect(second);

        let online = rx.recv().await.unwrap();
        let offline = rx.recv().await.unwrap();
        assert_eq!(online.status, PresenceStatus::Online);
        assert_eq!(offline.status, PresenceStatus::Offline);
        assert!(offline.seq > online.seq);
        assert!(rx.try_recv().is_err());
        assert_eq!(tracker.tracked_users(), 0);
    }

    #[tokio::test]
    async fn call_start_requires_a_connection() {
        let (tracker, _rx) = PresenceTracker::new(Uuid::new_v4(), &config());
        let user = Uuid::new_v4();

        assert!(tracker.call_start(user).is_err());
        assert_eq!(tracker.tracked_users(), 0);

        let _lease = tracker.connect(user);
        assert_eq!(tracker.call_start(user).unwrap(), PresenceStatus::InCall);
        assert_eq!(tracker.call_end(user), PresenceStatus::Online);
    }

    #[tokio::test]
    async fn idle_then_hard_timeout_fire_from_timers() {
        let (tracker, mut rx) = PresenceTracker::new(Uuid::new_v4(), &config());
        let user = Uuid::new_v4();
        let _lease = tracker.connect(user);
        assert_eq!(rx.recv().await.unwrap().status, PresenceStatus::Online);

        let away = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(away.status, PresenceStatus::Away);
        let offline = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(offline.status, PresenceStatus::Offline);
        assert_eq!(offline.device_count, 0);
        assert_eq!(tracker.status(user), PresenceStatus::Offline);
        assert_eq!(tracker.tracked_users(), 0);
    }

    #[tokio::test]
    async fn heartbeats_hold_off_the_hard_timeout() {
        let (tracker, mut rx) = PresenceTracker::new(Uuid::new_v4(), &config());
        let user = Uuid::new_v4();
        let mut lease = tracker.connect(user);
        rx.recv().await.unwrap();

        for _ in 0..6 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            tracker.activity(&mut lease);
        }
        assert_eq!(tracker.status(user), PresenceStatus::Online);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn republish_covers_present_users_only() {
        let (tracker, mut rx) = PresenceTracker::new(Uuid::new_v4(), &config());
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let _a = tracker.connect(a);
        let b_lease = tracker.connect(b);
        tracker.disconnect(b_lease);
        while rx.try_recv().is_ok() {}

        assert_eq!(tracker.republish_local(), 1);
        assert_eq!(rx.recv().await.unwrap().user_id, a);
    }

    #[tokio::test]
    async fn transitions_survive_a_missing_publisher() {
        let (tracker, rx) = PresenceTracker::new(Uuid::new_v4(), &config());
        drop(rx);
        let user = Uuid::new_v4();

        let lease = tracker.connect(user);
        assert_eq!(tracker.status(user), PresenceStatus::Online);
        tracker.disconnect(lease);
        assert_eq!(tracker.tracked_users(), 0);
    }

    fn short_config() -> PresenceConfig {
        PresenceConfig {
            heartbeat_interval: Duration::from_millis(20),
            idle_timeout: Duration::from_secs(60),
            hard_timeout: Duration::from_millis(100),
            stale_after: Duration::from_millis(150),
        }
    }

    async fn wait_for(rx: &mut mpsc::UnboundedReceiver<PresenceSnapshot>, status: PresenceStatus) {
        loop {
            let snapshot = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("no presence snapshot")
                .expect("tracker dropped");
            if snapshot.status == status {
                return;
            }
        }
    }

    #[tokio::test]
    async fn late_disconnect_after_hard_timeout_keeps_new_device_online() {
        let (tracker, mut rx) = PresenceTracker::new(Uuid::new_v4(), &short_config());
        let user = Uuid::new_v4();

        let old = tracker.connect(user);
        wait_for(&mut rx, PresenceStatus::Offline).await;
        assert_eq!(tracker.tracked_users(), 0);

        // A new device joins before the dead socket's session notices.
        let mut live = tracker.connect(user);
        tracker.disconnect(old);
        assert_eq!(tracker.status(user), PresenceStatus::Online);
        assert_eq!(tracker.state(user).unwrap().device_count, 1);

        tracker.heartbeat(&mut live);
        tracker.activity(&mut live);
        assert_eq!(tracker.status(user), PresenceStatus::Online);

        tracker.disconnect(live);
        assert_eq!(tracker.status(user), PresenceStatus::Offline);
        assert_eq!(tracker.tracked_users(), 0);
    }

    #[tokio::test]
    async fn disconnect_of_an_evicted_user_is_a_no_op() {
        let (tracker, mut rx) = PresenceTracker::new(Uuid::new_v4(), &short_config());
        let user = Uuid::new_v4();

        let lease = tracker.connect(user);
        wait_for(&mut rx, PresenceStatus::Offline).await;

        tracker.disconnect(lease);
        assert_eq!(tracker.tracked_users(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn heartbeat_from_a_timed_out_connection_rejoins() {
        let (tracker, mut rx) = PresenceTracker::new(Uuid::new_v4(), &short_config());
        let user = Uuid::new_v4();

        let mut lease = tracker.connect(user);
        wait_for(&mut rx, PresenceStatus::Offline).await;

        tracker.heartbeat(&mut lease);
        assert_eq!(rx.recv().await.unwrap().status, PresenceStatus::Online);
        assert_eq!(tracker.state(user).unwrap().device_count, 1);

        tracker.disconnect(lease);
        assert_eq!(tracker.status(user), PresenceStatus::Offline);
    }

    #[tokio::test]
    async fn rejoined_connection_counts_beside_a_newer_one() {
        let (tracker, mut rx) = PresenceTracker::new(Uuid::new_v4(), &short_config());
        let user = Uuid::new_v4();

        let mut old = tracker.connect(user);
        wait_for(&mut rx, PresenceStatus::Offline).await;

        let new = tracker.connect(user);
        tracker.heartbeat(&mut old);
        assert_eq!(tracker.state(user).unwrap().device_count, 2);

        tracker.disconnect(old);
        assert_eq!(tracker.status(user), PresenceStatus::Online);
        tracker.disconnect(new);
        assert_eq!(tracker.status(user), PresenceStatus::Offline);
    }
}
