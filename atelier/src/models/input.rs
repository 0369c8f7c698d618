//! Input DTOs with garde validation for store operations.
//!
//! Frames arriving from the feed server and calls from the app layer both go
//! through these before touching the database.

use garde::Validate;
use serde::{Deserialize, Serialize};

use super::message::{ChatImage, PaymentRequest, RequestField, SupportFields};
use super::thread::{SenderRole, UserKey};
use crate::error::StoreError;

const MAX_CHAT_ID_LENGTH: usize = 256;
const MAX_ARTIST_ID_LENGTH: usize = 128;
const MAX_SENDER_ID_LENGTH: usize = 128;
const MAX_MESSAGE_LENGTH: usize = 10000;
const MAX_IMAGES_PER_MESSAGE: usize = 20;
const MAX_REQUEST_FIELDS: usize = 50;
const MAX_REVIEW_LENGTH: usize = 2000;

/// Which form started the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Commission,
    ArtistApplication,
}

impl RequestKind {
    /// Preview text written to the thread when the form is delivered.
    pub fn summary(&self) -> &'static str {
        match self {
            RequestKind::Commission => "Commission request delivered.",
            RequestKind::ArtistApplication => "Artist application delivered.",
        }
    }
}

/// Input for delivering a request form into a (possibly new) chat
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[garde(context(()))]
pub struct ChatRequestInput {
    #[garde(length(min = 1, max = MAX_ARTIST_ID_LENGTH))]
    pub artist_id: String,
    #[garde(skip)]
    pub artist_user_key: UserKey,
    #[garde(skip)]
    pub client_user_key: UserKey,
    #[garde(skip)]
    pub kind: RequestKind,
    #[garde(length(max = MAX_REQUEST_FIELDS))]
    pub request_fields: Vec<RequestField>,
}

/// Input for sending a message
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[garde(context(()))]
pub struct SendMessageInput {
    #[garde(length(min = 1, max = MAX_CHAT_ID_LENGTH))]
    pub chat_id: String,
    #[garde(length(min = 1, max = MAX_ARTIST_ID_LENGTH))]
    pub artist_id: String,
    #[garde(skip)]
    #[serde(default)]
    pub artist_user_key: Option<UserKey>,
    #[garde(skip)]
    pub client_user_key: UserKey,
    #[garde(length(min = 1, max = MAX_SENDER_ID_LENGTH))]
    pub sender_id: String,
    #[garde(skip)]
    pub sender_role: SenderRole,
    #[garde(length(max = MAX_MESSAGE_LENGTH))]
    #[serde(default)]
    pub text: String,
    #[garde(length(max = MAX_IMAGES_PER_MESSAGE))]
    #[serde(default)]
    pub images: Vec<ChatImage>,
    #[garde(skip)]
    #[serde(default)]
    pub payment_request: Option<PaymentRequest>,
    #[garde(skip)]
    #[serde(default)]
    pub support_fields: Option<SupportFields>,
}

impl SendMessageInput {
    /// Plain text message with no attachments.
    pub fn text(
        chat_id: impl Into<String>,
        artist_id: impl Into<String>,
        client_user_key: UserKey,
        sender_id: impl Into<String>,
        sender_role: SenderRole,
        text: impl Into<String>,
    ) -> Self {
        Self {
            chat_id: chat_id.into(),
            artist_id: artist_id.into(),
            artist_user_key: None,
            client_user_key,
            sender_id: sender_id.into(),
            sender_role,
            text: text.into(),
            images: Vec::new(),
            payment_request: None,
            support_fields: None,
        }
    }

    pub(crate) fn has_content(&self) -> bool {
        !self.text.trim().is_empty()
            || !self.images.is_empty()
            || self.payment_request.is_some()
            || self.support_fields.as_ref().is_some_and(|f| !f.is_empty())
    }
}

/// Input for writing a new review
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[garde(context(()))]
pub struct ReviewInput {
    #[garde(length(min = 1, max = MAX_ARTIST_ID_LENGTH))]
    pub artist_id: String,
    #[garde(skip)]
    pub user_key: UserKey,
    #[garde(range(min = 1, max = 5))]
    pub rating: i64,
    #[garde(length(max = MAX_REVIEW_LENGTH))]
    #[serde(default)]
    pub content: String,
}

/// Input for editing an existing review
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default)]
#[garde(context(()))]
pub struct ReviewUpdateInput {
    #[garde(range(min = 1, max = 5))]
    #[serde(default)]
    pub rating: Option<i64>,
    #[garde(length(max = MAX_REVIEW_LENGTH))]
    #[serde(default)]
    pub content: Option<String>,
}

/// Helper trait to convert garde validation errors to store errors
pub trait ValidateExt {
    fn validate_input(&self) -> Result<(), StoreError>;
}

impl<T: Validate<Context = ()>> ValidateExt for T {
    fn validate_input(&self) -> Result<(), StoreError> {
        self.validate()
            .map_err(|e| StoreError::Validation(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_review_rating_out_of_range_is_rejected() {
        let input = ReviewInput {
            artist_id: "artist-1".to_string(),
            user_key: 1,
            rating: 6,
            content: String::new(),
        };
        assert!(matches!(
            input.validate_input(),
            Err(StoreError::Validation(_))
        ));
    }

    #[test]
    fn test_review_update_without_rating_is_valid() {
        let input = ReviewUpdateInput {
            rating: None,
            content: Some("Lovely linework".to_string()),
        };
        assert!(input.validate_input().is_ok());
    }

    #[test]
    fn test_send_message_requires_chat_id() {
        let input = SendMessageInput::text("", "artist-1", 1, "1", SenderRole::Client, "hi");
        assert!(input.validate_input().is_err());
    }

    #[test]
    fn test_blank_text_without_attachments_has_no_content() {
        let mut input =
            SendMessageInput::text("7__1", "artist-1", 1, "1", SenderRole::Client, "   ");
        assert!(!input.has_content());

        input.images.push(ChatImage {
            name: "sketch.png".to_string(),
            url: "https://cdn.example/sketch.png".to_string(),
        });
        assert!(input.has_content());
    }
}
