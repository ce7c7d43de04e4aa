pub mod chat;
pub mod message;
pub mod notification;

pub use chat::{Chat, ChatParticipant, ChatSummary};
pub use message::{Message, MessageRead, ReadReceipt, MAX_MESSAGE_LENGTH};
pub use notification::{NewNotification, Notification, NotificationDisplay, NotificationType, NotificationView};
