use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Offline,
    Online,
    Away,
    InCall,
}

impl PresenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Offline => "offline",
            PresenceStatus::Online => "online",
            PresenceStatus::Away => "away",
            PresenceStatus::InCall => "in_call",
        }
    }

    /// Rank used when folding several instances into one status.
    pub fn rank(&self) -> u8 {
        match self {
            PresenceStatus::Offline => 0,
            PresenceStatus::Away => 1,
            PresenceStatus::Online => 2,
            PresenceStatus::InCall => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceSignal {
    Connect,
    Disconnect,
    Heartbeat,
    Activity,
    CallStart,
    CallEnd,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PresenceError {
    #[error("cannot {signal:?} while {from:?}")]
    InvalidTransition {
        from: PresenceStatus,
        signal: PresenceSignal,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: PresenceStatus,
    pub to: PresenceStatus,
}

#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub idle: Duration,
    pub hard: Duration,
}

/// One user's presence on this instance.
///
/// `status == Offline` holds exactly when `device_count == 0`.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceState {
    pub status: PresenceStatus,
    pub device_count: u32,
    pub last_heartbeat: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl PresenceState {
    pub fn offline(now: DateTime<Utc>) -> Self {
        Self {
            status: PresenceStatus::Offline,
            device_count: 0,
            last_heartbeat: now,
            last_activity: now,
        }
    }

    /// Apply an explicit signal. Redundant signals are absorbed as `Ok(None)`.
    pub fn apply(
        &mut self,
        signal: PresenceSignal,
        now: DateTime<Utc>,
    ) -> Result<Option<Transition>, PresenceError> {
        let from = self.status;
        match signal {
            PresenceSignal::Connect => {
                self.device_count += 1;
                self.last_heartbeat = now;
                self.last_activity = now;
                if from == PresenceStatus::Offline {
                    self.status = PresenceStatus::Online;
                }
            }
            PresenceSignal::Disconnect => {
                if self.device_count == 0 {
                    return Ok(None);
                }
                self.device_count -= 1;
                if self.device_count == 0 {
                    self.status = PresenceStatus::Offline;
                }
            }
            PresenceSignal::Heartbeat => {
                if from != PresenceStatus::Offline {
                    self.last_heartbeat = now;
                }
            }
            PresenceSignal::Activity => {
                if from == PresenceStatus::Offline {
                    return Ok(None);
                }
                self.last_heartbeat = now;
                self.last_activity = now;
                if from == PresenceStatus::Away {
                    self.status = PresenceStatus::Online;
                }
            }
            PresenceSignal::CallStart => match from {
                PresenceStatus::Online | PresenceStatus::Away => {
                    self.status = PresenceStatus::InCall;
                    self.last_activity = now;
                }
                PresenceStatus::InCall => {}
                PresenceStatus::Offline => {
                    return Err(PresenceError::InvalidTransition { from, signal });
                }
            },
            PresenceSignal::CallEnd => {
                if from == PresenceStatus::InCall {
                    self.status = PresenceStatus::Online;
                    self.last_activity = now;
                }
            }
        }

        Ok(self.transition_from(from))
    }

    /// Apply timer-driven transitions due at `now`.
    pub fn evaluate(&mut self, now: DateTime<Utc>, timeouts: &Timeouts) -> Option<Transition> {
        let from = self.status;
        if from == PresenceStatus::Offline {
            return None;
        }

        if now - self.last_heartbeat >= to_chrono(timeouts.hard) {
            self.device_count = 0;
            self.status = PresenceStatus::Offline;
        } else if from == PresenceStatus::Online
            && now - self.last_activity >= to_chrono(timeouts.idle)
        {
            self.status = PresenceStatus::Away;
        }

        self.transition_from(from)
    }

    /// Earliest instant at which `evaluate` could change the status.
    pub fn next_deadline(&self, timeouts: &Timeouts) -> Option<DateTime<Utc>> {
        match self.status {
            PresenceStatus::Offline => None,
            PresenceStatus::Online => Some(std::cmp::min(
                self.last_heartbeat + to_chrono(timeouts.hard),
                self.last_activity + to_chrono(timeouts.idle),
            )),
            PresenceStatus::Away | PresenceStatus::InCall => {
                Some(self.last_heartbeat + to_chrono(timeouts.hard))
            }
        }
    }

    fn transition_from(&self, from: PresenceStatus) -> Option<Transition> {
        (from != self.status).then_some(Transition {
            from,
            to: self.status,
        })
    }
}

fn to_chrono(d: Duration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or_else(|_| ChronoDuration::days(36_500))
}
