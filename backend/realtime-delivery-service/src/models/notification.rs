use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Notification type enumeration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationType {
    /// A task was assigned to the recipient
    TaskAssigned,
    /// A task the recipient follows was completed
    TaskCompleted,
    /// Someone commented on the recipient's task
    TaskComment,
    /// The recipient was mentioned in a comment or chat
    Mention,
    /// The recipient was added to a board
    BoardInvite,
    /// The recipient was added to a project
    ProjectInvite,
    /// A file was shared with the recipient
    FileShared,
    /// A due date is close
    DeadlineApproaching,
    /// A chat message arrived while the recipient was away
    ChatMessage,
    /// A call was started in one of the recipient's chats
    CallStarted,
    /// Platform announcement
    System,
}

/// How a notification type is presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationDisplay {
    pub icon: &'static str,
    /// `{actor}` and `{subject}` are substituted from the payload
    pub template: &'static str,
}

const DISPLAY_TABLE: &[(NotificationType, NotificationDisplay)] = &[
    (
        NotificationType::TaskAssigned,
        NotificationDisplay {
            icon: "clipboard-check",
            template: "{actor} assigned you \"{subject}\"",
        },
    ),
    (
        NotificationType::TaskCompleted,
        NotificationDisplay {
            icon: "check-circle",
            template: "{actor} completed \"{subject}\"",
        },
    ),
    (
        NotificationType::TaskComment,
        NotificationDisplay {
            icon: "message-square",
            template: "{actor} commented on \"{subject}\"",
        },
    ),
    (
        NotificationType::Mention,
        NotificationDisplay {
            icon: "at-sign",
            template: "{actor} mentioned you in {subject}",
        },
    ),
    (
        NotificationType::BoardInvite,
        NotificationDisplay {
            icon: "layout",
            template: "{actor} added you to the board \"{subject}\"",
        },
    ),
    (
        NotificationType::ProjectInvite,
        NotificationDisplay {
            icon: "folder-plus",
            template: "{actor} invited you to the project \"{subject}\"",
        },
    ),
    (
        NotificationType::FileShared,
        NotificationDisplay {
            icon: "file",
            template: "{actor} shared \"{subject}\" with you",
        },
    ),
    (
        NotificationType::DeadlineApproaching,
        NotificationDisplay {
            icon: "clock",
            template: "\"{subject}\" is due soon",
        },
    ),
    (
        NotificationType::ChatMessage,
        NotificationDisplay {
            icon: "message-circle",
            template: "{actor} sent you a message",
        },
    ),
    (
        NotificationType::CallStarted,
        NotificationDisplay {
            icon: "video",
            template: "{actor} started a call in {subject}",
        },
    ),
    (
        NotificationType::System,
        NotificationDisplay {
            icon: "bell",
            template: "{subject}",
        },
    ),
];

impl NotificationType {
    pub const ALL: [NotificationType; 11] = [
        NotificationType::TaskAssigned,
        NotificationType::TaskCompleted,
        NotificationType::TaskComment,
        NotificationType::Mention,
        NotificationType::BoardInvite,
        NotificationType::ProjectInvite,
        NotificationType::FileShared,
        NotificationType::DeadlineApproaching,
        NotificationType::ChatMessage,
        NotificationType::CallStarted,
        NotificationType::System,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::TaskAssigned => "TASK_ASSIGNED",
            NotificationType::TaskCompleted => "TASK_COMPLETED",
            NotificationType::TaskComment => "TASK_COMMENT",
            NotificationType::Mention => "MENTION",
            NotificationType::BoardInvite => "BOARD_INVITE",
            NotificationType::ProjectInvite => "PROJECT_INVITE",
            NotificationType::FileShared => "FILE_SHARED",
            NotificationType::DeadlineApproaching => "DEADLINE_APPROACHING",
            NotificationType::ChatMessage => "CHAT_MESSAGE",
            NotificationType::CallStarted => "CALL_STARTED",
            NotificationType::System => "SYSTEM",
        }
    }

    pub fn display(&self) -> NotificationDisplay {
        DISPLAY_TABLE
            .iter()
            .find(|(kind, _)| kind == self)
            .map(|(_, display)| *display)
            .unwrap_or(NotificationDisplay {
                icon: "bell",
                template: "{subject}",
            })
    }

    /// Render the template with `actorName` and `subject` from the payload.
    pub fn render(&self, payload: &serde_json::Value) -> String {
        let actor = payload
            .get("actorName")
            .and_then(|v| v.as_str())
            .unwrap_or("Someone");
        let subject = payload
            .get("subject")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        self.display()
            .template
            .replace("{actor}", actor)
            .replace("{subject}", subject)
    }
}

impl FromStr for NotificationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NotificationType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown notification type: {s}"))
    }
}

/// Core notification model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: Uuid,
    /// Recipient user ID
    pub user_id: Uuid,
    pub notification_type: NotificationType,
    pub payload: serde_json::Value,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn view(&self) -> NotificationView {
        let display = self.notification_type.display();
        NotificationView {
            notification: self.clone(),
            icon: display.icon,
            message: self.notification_type.render(&self.payload),
        }
    }
}

/// Notification with its rendered presentation, as sent to clients.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationView {
    #[serde(flatten)]
    pub notification: Notification,
    pub icon: &'static str,
    pub message: String,
}

/// Creation request from a producing service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewNotification {
    pub user_id: Uuid,
    pub notification_type: NotificationType,
    #[serde(default = "empty_payload")]
    pub payload: serde_json::Value,
}

fn empty_payload() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

impl NewNotification {
    pub fn validate(&self) -> Result<(), String> {
        if self.user_id.is_nil() {
            return Err("userId must not be nil".into());
        }
        if !self.payload.is_object() {
            return Err("payload must be a JSON object".into());
        }
        Ok(())
    }
}
