use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use super::{PresenceDirectory, PresenceSnapshot, PresenceTracker};
use crate::fanout::{FanoutBridge, FanoutPayload};
use crate::topic::Topic;

/// Drain tracker snapshots onto the bridge. A single task keeps each
/// user's events in emission order.
pub async fn run_publisher(
    mut changes: mpsc::UnboundedReceiver<PresenceSnapshot>,
    bridge: Arc<FanoutBridge>,
) {
    while let Some(snapshot) = changes.recv().await {
        let user_id = snapshot.user_id;
        if let Err(e) = bridge
            .publish(
                Topic::Presence(user_id),
                FanoutPayload::PresenceChanged(snapshot),
            )
            .await
        {
            tracing::warn!(user_id = %user_id, error = %e, "presence change not broadcast");
        }
    }
    tracing::debug!("presence publisher stopped");
}

/// Every heartbeat interval: republish local users and prune the directory.
pub async fn run_republisher(
    tracker: Arc<PresenceTracker>,
    directory: Arc<PresenceDirectory>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let republished = tracker.republish_local();
                let pruned = directory.prune();
                tracing::trace!(republished, pruned, "presence refresh");
            }
            _ = shutdown.changed() => break,
        }
    }
}
