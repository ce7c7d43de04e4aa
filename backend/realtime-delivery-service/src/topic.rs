use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use uuid::Uuid;

pub const CHAT_PATTERN: &str = "chat:*";
pub const PRESENCE_PATTERN: &str = "presence:*";
pub const NOTIFICATIONS_PATTERN: &str = "notifications:*";

/// Routing key shared by the connection registry and the fanout backbone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Chat(Uuid),
    Presence(Uuid),
    Notifications(Uuid),
}

impl Topic {
    /// Backbone channel name for this topic.
    pub fn channel(&self) -> String {
        match self {
            Topic::Chat(id) => format!("chat:{id}"),
            Topic::Presence(user_id) => format!("presence:{user_id}"),
            Topic::Notifications(user_id) => format!("notifications:{user_id}"),
        }
    }

    pub fn from_channel(channel: &str) -> Option<Topic> {
        let (prefix, id) = channel.split_once(':')?;
        let id = Uuid::parse_str(id).ok()?;
        match prefix {
            "chat" => Some(Topic::Chat(id)),
            "presence" => Some(Topic::Presence(id)),
            "notifications" => Some(Topic::Notifications(id)),
            _ => None,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.channel())
    }
}

impl Serialize for Topic {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Topic {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Topic::from_channel(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown topic channel: {raw}")))
    }
}

/// Glob match supporting `*` and `?`, the subset of Redis PSUBSCRIBE
/// patterns this service uses.
pub fn matches_pattern(pattern: &str, channel: &str) -> bool {
    let p = pattern.as_bytes();
    let c = channel.as_bytes();
    let (mut pi, mut ci) = (0, 0);
    let mut star: Option<usize> = None;
    let mut mark = 0;

    while ci < c.len() {
        if pi < p.len() && (p[pi] == b'?' || p[pi] == c[ci]) {
            pi += 1;
            ci += 1;
        } else if pi < p.len() && p[pi] == b'*' {
            star = Some(pi);
            mark = ci;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            ci = mark;
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == b'*' {
        pi += 1;
    }
    pi == p.len()
}
