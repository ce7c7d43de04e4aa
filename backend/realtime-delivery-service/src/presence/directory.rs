use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use super::state::PresenceStatus;

/// One instance's view of one user, as carried by presence-changed events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceSnapshot {
    pub user_id: Uuid,
    pub instance_id: Uuid,
    pub status: PresenceStatus,
    pub device_count: u32,
    /// Monotonic per producing instance
    pub seq: u64,
    pub at: DateTime<Utc>,
}

/// Cluster-wide status of a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPresenceView {
    pub user_id: Uuid,
    pub status: PresenceStatus,
    pub device_count: u32,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Folds presence snapshots from every instance into a per-user view.
///
/// Snapshots older than `stale_after` no longer count, so an instance that
/// dies without publishing Offline drops out once its last republish ages.
pub struct PresenceDirectory {
    users: DashMap<Uuid, HashMap<Uuid, PresenceSnapshot>>,
    stale_after: ChronoDuration,
}

impl PresenceDirectory {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            users: DashMap::new(),
            stale_after: ChronoDuration::from_std(stale_after)
                .unwrap_or_else(|_| ChronoDuration::seconds(90)),
        }
    }

    /// Fold in a snapshot. Returns the new aggregate view when the user's
    /// effective status or device count changed.
    pub fn apply(&self, snapshot: &PresenceSnapshot) -> Option<UserPresenceView> {
        let now = Utc::now();
        if now - snapshot.at > self.stale_after {
            return None;
        }

        let mut instances = self.users.entry(snapshot.user_id).or_default();
        let before = aggregate(snapshot.user_id, &instances, now, self.stale_after);

        if let Some(existing) = instances.get(&snapshot.instance_id) {
            if existing.seq > snapshot.seq {
                return None;
            }
        }
        instances.insert(snapshot.instance_id, snapshot.clone());

        let after = aggregate(snapshot.user_id, &instances, now, self.stale_after);
        (before.status != after.status || before.device_count != after.device_count)
            .then_some(after)
    }

    pub fn view(&self, user_id: Uuid) -> UserPresenceView {
        let now = Utc::now();
        match self.users.get(&user_id) {
            Some(instances) => aggregate(user_id, &instances, now, self.stale_after),
            None => UserPresenceView {
                user_id,
                status: PresenceStatus::Offline,
                device_count: 0,
                last_seen: None,
            },
        }
    }

    pub fn online_users(&self) -> Vec<UserPresenceView> {
        let now = Utc::now();
        let mut online: Vec<UserPresenceView> = self
            .users
            .iter()
            .map(|entry| aggregate(*entry.key(), entry.value(), now, self.stale_after))
            .filter(|view| view.status != PresenceStatus::Offline)
            .collect();
        online.sort_by_key(|v| v.user_id);
        online
    }

    /// Drop stale snapshots and users with nothing left.
    pub fn prune(&self) -> usize {
        let now = Utc::now();
        let stale_after = self.stale_after;
        let before = self.users.len();
        self.users.retain(|_, instances| {
            instances.retain(|_, s| now - s.at <= stale_after);
            !instances.is_empty()
        });
        before - self.users.len()
    }
}

fn aggregate(
    user_id: Uuid,
    instances: &HashMap<Uuid, PresenceSnapshot>,
    now: DateTime<Utc>,
    stale_after: ChronoDuration,
) -> UserPresenceView {
    let mut status = PresenceStatus::Offline;
    let mut device_count = 0;
    let mut last_seen = None;

    for snapshot in instances.values() {
        last_seen = last_seen.max(Some(snapshot.at));
        if now - snapshot.at > stale_after {
            continue;
        }
        if snapshot.status.rank() > status.rank() {
            status = snapshot.status;
        }
        if snapshot.status != PresenceStatus::Offline {
            device_count += snapshot.device_count;
        }
    }

    UserPresenceView {
        user_id,
        status,
        device_count,
        last_seen,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(user: Uuid, instance: Uuid, status: PresenceStatus, devices: u32, seq: u64) -> PresenceSnapshot {
        PresenceSnapshot {
            user_id: user,
            instance_id: instance,
            status,
            device_count: devices,
            seq,
            at: Utc::now(),
        }
    }

    #[test]
    fn aggregates_across_instances() {
        let directory = PresenceDirectory::new(Duration::from_secs(90));
        let user = Uuid::new_v4();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        let view = directory.apply(&snap(user, a, PresenceStatus::Away, 1, 1)).unwrap();
        assert_eq!(view.status, PresenceStatus::Away);

        let view = directory.apply(&snap(user, b, PresenceStatus::InCall, 2, 1)).unwrap();
        assert_eq!(view.status, PresenceStatus::InCall);
        assert_eq!(view.device_count, 3);

        let view = directory.apply(&snap(user, b, PresenceStatus::Offline, 0, 2)).unwrap();
        assert_eq!(view.status, PresenceStatus::Away);
        assert_eq!(view.device_count, 1);
        assert_eq!(directory.online_users().len(), 1);
    }

    #[test]
    fn older_sequence_is_ignored() {
        let directory = PresenceDirectory::new(Duration::from_secs(90));
        let user = Uuid::new_v4();
        let instance = Uuid::new_v4();

        directory.apply(&snap(user, instance, PresenceStatus::Online, 1, 5));
        directory.apply(&snap(user, instance, PresenceStatus::Offline, 0, 6));
        assert!(directory
            .apply(&snap(user, instance, PresenceStatus::Online, 1, 5))
            .is_none());
        assert_eq!(directory.view(user).status, PresenceStatus::Offline);
    }

    #[test]
    fn republish_without_change_reports_nothing() {
        let directory = PresenceDirectory::new(Duration::from_secs(90));
        let user = Uuid::new_v4();
        let instance = Uuid::new_v4();

        assert!(directory.apply(&snap(user, instance, PresenceStatus::Online, 1, 1)).is_some());
        assert!(directory.apply(&snap(user, instance, PresenceStatus::Online, 1, 2)).is_none());
    }

    #[test]
    fn stale_snapshots_do_not_count() {
        let directory = PresenceDirectory::new(Duration::from_secs(90));
        let user = Uuid::new_v4();
        let mut old = snap(user, Uuid::new_v4(), PresenceStatus::Online, 1, 1);
        old.at = Utc::now() - ChronoDuration::seconds(120);

        assert!(directory.apply(&old).is_none());
        assert_eq!(directory.view(user).status, PresenceStatus::Offline);
        assert!(directory.online_users().is_empty());
    }

    #[test]
    fn prune_removes_aged_entries() {
        let directory = PresenceDirectory::new(Duration::from_secs(90));
        let user = Uuid::new_v4();
        directory.apply(&snap(user, Uuid::new_v4(), PresenceStatus::Online, 1, 1));

        directory
            .users
            .get_mut(&user)
            .unwrap()
            .values_mut()
            .for_each(|s| s.at = Utc::now() - ChronoDuration::seconds(200));

        assert_eq!(directory.view(user).status, PresenceStatus::Offline);
        assert!(directory.view(user).last_seen.is_some());
        assert_eq!(directory.prune(), 1);
        assert_eq!(directory.view(user).last_seen, None);
    }
}
