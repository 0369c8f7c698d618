use serde::{Deserialize, Serialize};

use super::thread::SenderRole;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    Request,
    PaymentRequest,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::Request => "request",
            MessageType::PaymentRequest => "payment_request",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "text" => Some(MessageType::Text),
            "request" => Some(MessageType::Request),
            "payment_request" => Some(MessageType::PaymentRequest),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatImage {
    pub name: String,
    pub url: String,
}

/// One answered field of an artist's request form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestField {
    pub title: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub kind: String,
    pub amount: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_no: Option<String>,
    #[serde(default)]
    pub is_test_payment: bool,
    #[serde(default)]
    pub cancelled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SupportFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ChatImage>,
}

impl SupportFields {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.content.is_none() && self.images.is_empty()
    }
}

/// Optional message attachments, stored as one JSON column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub(crate) struct MessagePayload {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ChatImage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub request_fields: Vec<RequestField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_request: Option<PaymentRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub support_fields: Option<SupportFields>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub sender_role: SenderRole,
    pub message_type: MessageType,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ChatImage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub request_fields: Vec<RequestField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_request: Option<PaymentRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub support_fields: Option<SupportFields>,
    pub created_at: i64,
}
