use rusqlite::{params, OptionalExtension, Row, Transaction};
use tracing::{info, warn};

use super::message::{insert_message, NewMessage};
use crate::db::{Database, ThreadChange};
use crate::error::StoreError;
use crate::models::input::{ChatRequestInput, ValidateExt};
use crate::models::{ChatThread, MessagePayload, MessageType, SenderRole, ThreadStatus, UserKey};
use crate::utils::{build_chat_id, support_chat_id, SUPPORT_ADMIN_USER_KEY, SUPPORT_ARTIST_ID};

const SUPPORT_PREVIEW: &str = "Your support chat has started.";
const SUPPORT_GREETING: &str = "Your support chat has started. Leave us any question.";
const CHAT_STARTED: &str = "Chat started.";

pub(crate) const THREAD_COLUMNS: &str = "id, artist_id, client_user_key, artist_user_key, status,
    last_message, last_message_at, last_message_sender_role,
    client_last_read_at, artist_last_read_at, created_at, updated_at";

/// Map a `chats` row selected with [`THREAD_COLUMNS`].
///
/// Unknown status or role strings are logged and read as the lenient default
/// rather than failing the whole query.
pub(crate) fn thread_from_row(row: &Row<'_>) -> rusqlite::Result<ChatThread> {
    let id: String = row.get(0)?;
    let status: String = row.get(4)?;
    let role: Option<String> = row.get(7)?;

    let status = status.parse::<ThreadStatus>().unwrap_or_else(|e| {
        warn!(chat_id = %id, error = %e, "Unreadable thread status");
        ThreadStatus::Pending
    });
    let last_message_sender_role = role.and_then(|r| match r.parse::<SenderRole>() {
        Ok(role) => Some(role),
        Err(e) => {
            warn!(chat_id = %id, error = %e, "Unreadable sender role");
            None
        }
    });

    Ok(ChatThread {
        id,
        artist_id: row.get(1)?,
        client_user_key: row.get(2)?,
        artist_user_key: row.get(3)?,
        status,
        last_message: row.get(5)?,
        last_message_at: row.get(6)?,
        last_message_sender_role,
        client_last_read_at: row.get(8)?,
        artist_last_read_at: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

pub(crate) fn load_thread(
    tx: &Transaction<'_>,
    chat_id: &str,
) -> Result<Option<ChatThread>, StoreError> {
    let thread = tx
        .query_row(
            &format!("SELECT {} FROM chats WHERE id = ?1", THREAD_COLUMNS),
            [chat_id],
            thread_from_row,
        )
        .optional()?;
    Ok(thread)
}

fn change_for(thread: &ChatThread) -> ThreadChange {
    ThreadChange {
        chat_id: thread.id.clone(),
        client_user_key: thread.client_user_key,
        artist_user_key: thread.artist_user_key,
    }
}

/// Deliver a request form, creating the chat on first contact.
///
/// Re-delivering between the same pair reactivates the existing chat.
pub fn create_chat_from_request(
    db: &Database,
    input: ChatRequestInput,
) -> Result<String, StoreError> {
    input.validate_input()?;

    let chat_id = build_chat_id(input.artist_user_key, input.client_user_key);
    let summary = input.kind.summary();
    let (mut conn, now) = db.lock_for_write()?;
    let tx = conn.transaction()?;

    tx.execute(
        "INSERT INTO chats (id, artist_id, client_user_key, artist_user_key, status,
            last_message, last_message_at, last_message_sender_role,
            client_last_read_at, artist_last_read_at, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, 'active', ?5, ?6, 'client', ?6, ?6, ?6, ?6)
         ON CONFLICT(id) DO UPDATE SET
            status = 'active',
            last_message = excluded.last_message,
            last_message_at = excluded.last_message_at,
            last_message_sender_role = excluded.last_message_sender_role,
            client_last_read_at = excluded.client_last_read_at,
            artist_last_read_at = excluded.artist_last_read_at,
            artist_user_key = excluded.artist_user_key,
            updated_at = excluded.updated_at",
        params![
            &chat_id,
            &input.artist_id,
            input.client_user_key,
            input.artist_user_key,
            summary,
            now
        ],
    )?;

    insert_message(
        &tx,
        NewMessage {
            chat_id: &chat_id,
            sender_id: &input.client_user_key.to_string(),
            sender_role: SenderRole::Client,
            message_type: MessageType::Request,
            text: summary,
            payload: MessagePayload {
                request_fields: input.request_fields,
                ..Default::default()
            },
        },
        now,
    )?;

    tx.commit()?;
    drop(conn);

    info!(chat_id = %chat_id, kind = ?input.kind, "Request delivered");
    db.notify(ThreadChange {
        chat_id: chat_id.clone(),
        client_user_key: input.client_user_key,
        artist_user_key: Some(input.artist_user_key),
    });

    Ok(chat_id)
}

/// Create the client's support chat if it does not exist yet.
pub fn create_or_get_support_chat(
    db: &Database,
    client_user_key: UserKey,
) -> Result<String, StoreError> {
    let chat_id = support_chat_id(client_user_key);
    let (mut conn, now) = db.lock_for_write()?;
    let tx = conn.transaction()?;

    let inserted = tx.execute(
        "INSERT INTO chats (id, artist_id, client_user_key, artist_user_key, status,
            last_message, last_message_at, last_message_sender_role,
            client_last_read_at, artist_last_read_at, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, 'active', ?5, ?6, 'system', ?6, ?6, ?6, ?6)
         ON CONFLICT(id) DO NOTHING",
        params![
            &chat_id,
            SUPPORT_ARTIST_ID,
            client_user_key,
            SUPPORT_ADMIN_USER_KEY,
            SUPPORT_PREVIEW,
            now
        ],
    )?;

    if inserted == 0 {
        return Ok(chat_id);
    }

    insert_message(
        &tx,
        NewMessage {
            chat_id: &chat_id,
            sender_id: SUPPORT_ARTIST_ID,
            sender_role: SenderRole::System,
            message_type: MessageType::Text,
            text: SUPPORT_GREETING,
            payload: MessagePayload::default(),
        },
        now,
    )?;

    tx.commit()?;
    drop(conn);

    info!(chat_id = %chat_id, "Support chat created");
    db.notify(ThreadChange {
        chat_id: chat_id.clone(),
        client_user_key,
        artist_user_key: Some(SUPPORT_ADMIN_USER_KEY),
    });

    Ok(chat_id)
}

/// Activate a pending (or missing) chat from the artist side.
///
/// Returns whether the chat was started by this call.
pub fn accept_chat_if_pending(
    db: &Database,
    chat_id: &str,
    artist_id: &str,
    artist_user_key: Option<UserKey>,
    client_user_key: UserKey,
) -> Result<bool, StoreError> {
    let (mut conn, now) = db.lock_for_write()?;
    let tx = conn.transaction()?;

    let existing = load_thread(&tx, chat_id)?;
    match &existing {
        Some(thread) if thread.status == ThreadStatus::Active => return Ok(false),
        Some(_) => {
            tx.execute(
                "UPDATE chats SET status = 'active', last_message = ?2, last_message_at = ?3,
                    last_message_sender_role = 'system', artist_last_read_at = ?3, updated_at = ?3,
                    artist_user_key = COALESCE(?4, artist_user_key)
                 WHERE id = ?1",
                params![chat_id, CHAT_STARTED, now, artist_user_key],
            )?;
        }
        None => {
            tx.execute(
                "INSERT INTO chats (id, artist_id, client_user_key, artist_user_key, status,
                    last_message, last_message_at, last_message_sender_role,
                    artist_last_read_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 'active', ?5, ?6, 'system', ?6, ?6, ?6)",
                params![chat_id, artist_id, client_user_key, artist_user_key, CHAT_STARTED, now],
            )?;
        }
    }

    insert_message(
        &tx,
        NewMessage {
            chat_id,
            sender_id: artist_id,
            sender_role: SenderRole::System,
            message_type: MessageType::Text,
            text: CHAT_STARTED,
            payload: MessagePayload::default(),
        },
        now,
    )?;

    let thread = load_thread(&tx, chat_id)?
        .ok_or_else(|| StoreError::ChatNotFound(chat_id.to_string()))?;
    tx.commit()?;
    drop(conn);

    info!(chat_id = %chat_id, "Chat accepted");
    db.notify(change_for(&thread));

    Ok(true)
}

/// Record that `role` has read the chat up to now. System reads are ignored.
pub fn mark_chat_read(db: &Database, chat_id: &str, role: SenderRole) -> Result<(), StoreError> {
    let column = match role {
        SenderRole::Client => "client_last_read_at",
        SenderRole::Artist => "artist_last_read_at",
        SenderRole::System => return Ok(()),
    };
    let (mut conn, now) = db.lock_for_write()?;
    let tx = conn.transaction()?;

    let updated = tx.execute(
        &format!("UPDATE chats SET {} = ?2 WHERE id = ?1", column),
        params![chat_id, now],
    )?;
    if updated == 0 {
        return Err(StoreError::ChatNotFound(chat_id.to_string()));
    }

    let thread = load_thread(&tx, chat_id)?
        .ok_or_else(|| StoreError::ChatNotFound(chat_id.to_string()))?;
    tx.commit()?;
    drop(conn);

    db.notify(change_for(&thread));
    Ok(())
}

pub fn get_thread(db: &Database, chat_id: &str) -> Result<Option<ChatThread>, StoreError> {
    let conn = db.lock()?;
    let thread = conn
        .query_row(
            &format!("SELECT {} FROM chats WHERE id = ?1", THREAD_COLUMNS),
            [chat_id],
            thread_from_row,
        )
        .optional()?;
    Ok(thread)
}

/// Threads where `user_key` is the client, most recent first
pub fn threads_for_client(db: &Database, user_key: UserKey) -> Result<Vec<ChatThread>, StoreError> {
    query_threads(db, "client_user_key", user_key)
}

/// Threads where `user_key` is the artist, most recent first
pub fn threads_for_artist(db: &Database, user_key: UserKey) -> Result<Vec<ChatThread>, StoreError> {
    query_threads(db, "artist_user_key", user_key)
}

fn query_threads(
    db: &Database,
    column: &str,
    user_key: UserKey,
) -> Result<Vec<ChatThread>, StoreError> {
    let conn = db.lock()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM chats WHERE {} = ?1
         ORDER BY COALESCE(last_message_at, 0) DESC, id ASC",
        THREAD_COLUMNS, column
    ))?;

    let threads = stmt
        .query_map([user_key], thread_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(threads)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::input::RequestKind;
    use crate::models::RequestField;

    fn request(artist: UserKey, client: UserKey) -> ChatRequestInput {
        ChatRequestInput {
            artist_id: format!("artist-{}", artist),
            artist_user_key: artist,
            client_user_key: client,
            kind: RequestKind::Commission,
            request_fields: vec![RequestField {
                title: "Size".to_string(),
                value: "A4".to_string(),
            }],
        }
    }

    #[test]
    fn test_repeated_request_reuses_thread() {
        let db = Database::open_in_memory().unwrap();

        let first = create_chat_from_request(&db, request(10, 20)).unwrap();
        let second = create_chat_from_request(&db, request(10, 20)).unwrap();
        assert_eq!(first, second);

        assert_eq!(threads_for_client(&db, 20).unwrap().len(), 1);
        assert_eq!(threads_for_artist(&db, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_request_thread_starts_fully_read() {
        let db = Database::open_in_memory().unwrap();
        let chat_id = create_chat_from_request(&db, request(10, 20)).unwrap();

        let thread = get_thread(&db, &chat_id).unwrap().unwrap();
        assert_eq!(thread.status, ThreadStatus::Active);
        assert_eq!(thread.last_message_sender_role, Some(SenderRole::Client));
        assert_eq!(thread.last_message_at, thread.client_last_read_at);
        assert_eq!(thread.last_message_at, thread.artist_last_read_at);
        assert_eq!(thread.last_message.as_deref(), Some("Commission request delivered."));
    }

    #[test]
    fn test_support_chat_created_once() {
        let db = Database::open_in_memory().unwrap();
        let mut changes = db.subscribe();

        let first = create_or_get_support_chat(&db, 55).unwrap();
        let second = create_or_get_support_chat(&db, 55).unwrap();
        assert_eq!(first, "dev__55");
        assert_eq!(first, second);

        // only the creating call publishes a change
        assert_eq!(changes.try_recv().unwrap().chat_id, "dev__55");
        assert!(changes.try_recv().is_err());

        let thread = get_thread(&db, &first).unwrap().unwrap();
        assert_eq!(thread.artist_user_key, Some(SUPPORT_ADMIN_USER_KEY));
        assert_eq!(thread.artist_id, SUPPORT_ARTIST_ID);
        assert_eq!(thread.last_message_sender_role, Some(SenderRole::System));
    }

    #[test]
    fn test_accept_chat_only_once() {
        let db = Database::open_in_memory().unwrap();
        let chat_id = build_chat_id(3, 4);

        assert!(accept_chat_if_pending(&db, &chat_id, "artist-3", Some(3), 4).unwrap());
        assert!(!accept_chat_if_pending(&db, &chat_id, "artist-3", Some(3), 4).unwrap());

        let thread = get_thread(&db, &chat_id).unwrap().unwrap();
        assert_eq!(thread.status, ThreadStatus::Active);
        assert_eq!(thread.artist_user_key, Some(3));
        assert_eq!(thread.client_last_read_at, None);
        assert_eq!(thread.last_message.as_deref(), Some(CHAT_STARTED));
    }

    #[test]
    fn test_mark_read_updates_only_that_side() {
        let db = Database::open_in_memory().unwrap();
        let chat_id = create_chat_from_request(&db, request(10, 20)).unwrap();
        let before = get_thread(&db, &chat_id).unwrap().unwrap();

        mark_chat_read(&db, &chat_id, SenderRole::Artist).unwrap();
        let after = get_thread(&db, &chat_id).unwrap().unwrap();

        assert!(after.artist_last_read_at > before.artist_last_read_at);
        assert_eq!(after.client_last_read_at, before.client_last_read_at);
    }

    #[test]
    fn test_mark_read_as_system_is_noop() {
        let db = Database::open_in_memory().unwrap();
        // no such chat, still fine because nothing is written
        assert!(mark_chat_read(&db, "missing", SenderRole::System).is_ok());
    }

    #[test]
    fn test_mark_read_unknown_chat_errors() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(
            mark_chat_read(&db, "missing", SenderRole::Client),
            Err(StoreError::ChatNotFound(_))
        ));
    }
}
