pub mod events;
pub mod message_types;
pub mod session;

pub use events::{ChatFanoutHandler, PresenceFanoutHandler};
pub use message_types::{ClientCommand, ClientFrame, ServerFrame};
pub use session::{handle_frame, ChatSession};
