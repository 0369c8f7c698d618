use rusqlite::{params, OptionalExtension, Transaction};
use tracing::{debug, warn};

use super::chat::load_thread;
use crate::db::{Database, ThreadChange};
use crate::error::StoreError;
use crate::models::input::{SendMessageInput, ValidateExt};
use crate::models::{ChatMessage, MessagePayload, MessageType, SenderRole};

/// Preview shown for image-only messages
const IMAGE_PREVIEW: &str = "Image";

pub(crate) struct NewMessage<'a> {
    pub chat_id: &'a str,
    pub sender_id: &'a str,
    pub sender_role: SenderRole,
    pub message_type: MessageType,
    pub text: &'a str,
    pub payload: MessagePayload,
}

/// Append a message row inside an open transaction.
pub(crate) fn insert_message(
    tx: &Transaction<'_>,
    message: NewMessage<'_>,
    created_at: i64,
) -> Result<ChatMessage, StoreError> {
    let id = uuid::Uuid::new_v4().to_string();
    let payload = if message.payload == MessagePayload::default() {
        None
    } else {
        Some(serde_json::to_string(&message.payload)?)
    };

    tx.execute(
        "INSERT INTO messages (id, chat_id, sender_id, sender_role, message_type, text, payload, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            &id,
            message.chat_id,
            message.sender_id,
            message.sender_role.as_str(),
            message.message_type.as_str(),
            message.text,
            payload,
            created_at
        ],
    )?;

    Ok(ChatMessage {
        id,
        chat_id: message.chat_id.to_string(),
        sender_id: message.sender_id.to_string(),
        sender_role: message.sender_role,
        message_type: message.message_type,
        text: message.text.to_string(),
        images: message.payload.images,
        request_fields: message.payload.request_fields,
        payment_request: message.payload.payment_request,
        support_fields: message.payload.support_fields,
        created_at,
    })
}

/// Thread preview for a message: trimmed text, or a placeholder for image-only sends.
fn summary_text(input: &SendMessageInput) -> String {
    let trimmed = input.text.trim();
    if !trimmed.is_empty() {
        trimmed.to_string()
    } else if !input.images.is_empty() {
        IMAGE_PREVIEW.to_string()
    } else {
        input.text.clone()
    }
}

/// Send a message, creating the chat when it does not exist yet.
pub fn send_chat_message(db: &Database, input: SendMessageInput) -> Result<ChatMessage, StoreError> {
    input.validate_input()?;
    if !input.has_content() {
        return Err(StoreError::Validation("Message has no content".to_string()));
    }

    let summary = summary_text(&input);
    let message_type = if input.payment_request.is_some() {
        MessageType::PaymentRequest
    } else {
        MessageType::Text
    };
    let (mut conn, now) = db.lock_for_write()?;
    let tx = conn.transaction()?;

    let exists: Option<String> = tx
        .query_row("SELECT id FROM chats WHERE id = ?1", [&input.chat_id], |row| {
            row.get(0)
        })
        .optional()?;

    if exists.is_none() {
        tx.execute(
            "INSERT INTO chats (id, artist_id, client_user_key, artist_user_key,
                last_message, last_message_at, last_message_sender_role, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?6, ?6)",
            params![
                &input.chat_id,
                &input.artist_id,
                input.client_user_key,
                input.artist_user_key,
                &summary,
                now,
                input.sender_role.as_str()
            ],
        )?;
    } else {
        tx.execute(
            "UPDATE chats SET last_message = ?2, last_message_at = ?3,
                last_message_sender_role = ?4,
                artist_user_key = COALESCE(?5, artist_user_key),
                updated_at = ?3
             WHERE id = ?1",
            params![
                &input.chat_id,
                &summary,
                now,
                input.sender_role.as_str(),
                input.artist_user_key
            ],
        )?;
    }

    let support_fields = input.support_fields.filter(|f| !f.is_empty());
    let message = insert_message(
        &tx,
        NewMessage {
            chat_id: &input.chat_id,
            sender_id: &input.sender_id,
            sender_role: input.sender_role,
            message_type,
            text: &input.text,
            payload: MessagePayload {
                images: input.images,
                request_fields: Vec::new(),
                payment_request: input.payment_request,
                support_fields,
            },
        },
        now,
    )?;

    let thread = load_thread(&tx, &input.chat_id)?
        .ok_or_else(|| StoreError::ChatNotFound(input.chat_id.clone()))?;
    tx.commit()?;
    drop(conn);

    debug!(chat_id = %thread.id, role = %message.sender_role, "Message sent");
    db.notify(ThreadChange {
        chat_id: thread.id,
        client_user_key: thread.client_user_key,
        artist_user_key: thread.artist_user_key,
    });

    Ok(message)
}

/// Messages of one chat, oldest first
pub fn get_messages(
    db: &Database,
    chat_id: &str,
    limit: u32,
    offset: u32,
) -> Result<Vec<ChatMessage>, StoreError> {
    let conn = db.lock()?;
    let mut stmt = conn.prepare(
        "SELECT id, chat_id, sender_id, sender_role, message_type, text, payload, created_at
         FROM messages
         WHERE chat_id = ?1
         ORDER BY created_at ASC, rowid ASC
         LIMIT ?2 OFFSET ?3",
    )?;

    let rows = stmt
        .query_map(params![chat_id, limit, offset], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, i64>(7)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut messages = Vec::with_capacity(rows.len());
    for (id, chat_id, sender_id, role, kind, text, payload, created_at) in rows {
        let sender_role = role
            .parse::<SenderRole>()
            .map_err(StoreError::CorruptRow)?;
        let message_type = MessageType::parse(&kind).unwrap_or_else(|| {
            warn!(message_id = %id, kind = %kind, "Unknown message type, reading as text");
            MessageType::Text
        });
        let payload: MessagePayload = match payload {
            Some(json) => serde_json::from_str(&json)?,
            None => MessagePayload::default(),
        };

        messages.push(ChatMessage {
            id,
            chat_id,
            sender_id,
            sender_role,
            message_type,
            text,
            images: payload.images,
            request_fields: payload.request_fields,
            payment_request: payload.payment_request,
            support_fields: payload.support_fields,
            created_at,
        });
    }

    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::chat::get_thread;
    use crate::models::{ChatImage, PaymentRequest, SupportFields};

    fn text_from(role: SenderRole, text: &str) -> SendMessageInput {
        let sender = match role {
            SenderRole::Artist => "10",
            _ => "20",
        };
        SendMessageInput::text("10__20", "artist-10", 20, sender, role, text)
    }

    #[test]
    fn test_first_message_creates_thread() {
        let db = Database::open_in_memory().unwrap();
        let mut input = text_from(SenderRole::Client, "  hello there  ");
        input.artist_user_key = Some(10);

        let message = send_chat_message(&db, input).unwrap();
        assert_eq!(message.message_type, MessageType::Text);

        let thread = get_thread(&db, "10__20").unwrap().unwrap();
        assert_eq!(thread.last_message.as_deref(), Some("hello there"));
        assert_eq!(thread.last_message_at, Some(message.created_at));
        assert_eq!(thread.artist_user_key, Some(10));
    }

    #[test]
    fn test_reply_keeps_artist_key_when_not_given() {
        let db = Database::open_in_memory().unwrap();
        let mut first = text_from(SenderRole::Client, "hi");
        first.artist_user_key = Some(10);
        send_chat_message(&db, first).unwrap();

        send_chat_message(&db, text_from(SenderRole::Artist, "hey")).unwrap();

        let thread = get_thread(&db, "10__20").unwrap().unwrap();
        assert_eq!(thread.artist_user_key, Some(10));
        assert_eq!(thread.last_message_sender_role, Some(SenderRole::Artist));
    }

    #[test]
    fn test_image_only_message_uses_placeholder_preview() {
        let db = Database::open_in_memory().unwrap();
        let mut input = text_from(SenderRole::Client, "");
        input.images.push(ChatImage {
            name: "ref.png".to_string(),
            url: "https://cdn.example/ref.png".to_string(),
        });

        send_chat_message(&db, input).unwrap();

        let thread = get_thread(&db, "10__20").unwrap().unwrap();
        assert_eq!(thread.last_message.as_deref(), Some(IMAGE_PREVIEW));
        let messages = get_messages(&db, "10__20", 10, 0).unwrap();
        assert_eq!(messages[0].images.len(), 1);
    }

    #[test]
    fn test_empty_message_is_rejected() {
        let db = Database::open_in_memory().unwrap();
        let result = send_chat_message(&db, text_from(SenderRole::Client, "   "));
        assert!(matches!(result, Err(StoreError::Validation(_))));
        assert!(get_thread(&db, "10__20").unwrap().is_none());
    }

    #[test]
    fn test_payment_request_message_type() {
        let db = Database::open_in_memory().unwrap();
        let mut input = text_from(SenderRole::Artist, "Deposit please");
        input.payment_request = Some(PaymentRequest {
            kind: "deposit".to_string(),
            amount: 30000,
            order_no: None,
            is_test_payment: true,
            cancelled: false,
        });

        let message = send_chat_message(&db, input).unwrap();
        assert_eq!(message.message_type, MessageType::PaymentRequest);

        let stored = get_messages(&db, "10__20", 10, 0).unwrap();
        assert_eq!(stored[0].payment_request.as_ref().unwrap().amount, 30000);
    }

    #[test]
    fn test_empty_support_fields_are_dropped() {
        let db = Database::open_in_memory().unwrap();
        let mut input = text_from(SenderRole::Client, "Where is my order?");
        input.support_fields = Some(SupportFields::default());

        let message = send_chat_message(&db, input).unwrap();
        assert!(message.support_fields.is_none());
    }

    #[test]
    fn test_messages_are_paged_oldest_first() {
        let db = Database::open_in_memory().unwrap();
        for text in ["one", "two", "three"] {
            send_chat_message(&db, text_from(SenderRole::Client, text)).unwrap();
        }

        let page = get_messages(&db, "10__20", 2, 1).unwrap();
        let texts: Vec<_> = page.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["two", "three"]);
    }

    #[test]
    fn test_concurrent_sends_commit_in_timestamp_order() {
        let db = std::sync::Arc::new(Database::open_in_memory().unwrap());
        let mut first = text_from(SenderRole::Client, "start");
        first.artist_user_key = Some(10);
        send_chat_message(&db, first).unwrap();

        let writers: Vec<_> = (0..8)
            .map(|i| {
                let db = db.clone();
                std::thread::spawn(move || {
                    let role = if i % 2 == 0 {
                        SenderRole::Client
                    } else {
                        SenderRole::Artist
                    };
                    for n in 0..25 {
                        send_chat_message(&db, text_from(role, &format!("{}-{}", i, n))).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let stamps: Vec<i64> = {
            let conn = db.lock().unwrap();
            let mut stmt = conn
                .prepare("SELECT created_at FROM messages ORDER BY rowid ASC")
                .unwrap();
            let rows = stmt.query_map([], |row| row.get(0)).unwrap();
            rows.collect::<Result<_, _>>().unwrap()
        };
        assert_eq!(stamps.len(), 201);
        assert!(stamps.windows(2).all(|w| w[0] < w[1]));

        let thread = get_thread(&db, "10__20").unwrap().unwrap();
        assert_eq!(thread.last_message_at, stamps.last().copied());
    }
}
