pub mod input;
mod message;
mod review;
mod thread;

pub use message::{
    ChatImage, ChatMessage, MessageType, PaymentRequest, RequestField, SupportFields,
};
pub(crate) use message::MessagePayload;
pub use review::{RatingSummary, Review};
pub use thread::{ChatThread, SenderRole, ThreadStatus, UserKey};
