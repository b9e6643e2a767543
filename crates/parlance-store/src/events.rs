//! Conversation event log.
//!
//! Writes go through [`append_event`], which assigns the next per-conversation
//! sequence number in the same statement as the insert. Reads go through
//! [`list_events`], oldest first, with an optional `after_seq` cursor.

use rusqlite::{params, Connection};

use crate::error::StoreError;
use crate::event::{ConversationEvent, NewConversationEvent};

/// Default page size for [`list_events`].
pub const DEFAULT_EVENT_LIMIT: i64 = 200;

/// Appends an event to a conversation's log.
///
/// # Errors
///
/// Returns `StoreError::Database` on SQL failure or
/// `StoreError::Serialization` if the metadata cannot be serialised.
pub fn append_event(
    conn: &Connection,
    conversation_id: &str,
    event: &NewConversationEvent,
) -> Result<ConversationEvent, StoreError> {
    let metadata_json = serde_json::to_string(&event.metadata)?;
    let occurred_at = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
    let role = event.role.map(|r| r.as_str());

    // Sequence assignment happens inside the INSERT so two writers on the
    // same conversation cannot both observe the same MAX(seq).
    let (id, seq): (i64, i64) = conn.query_row(
        "INSERT INTO conversation_events
            (conversation_id, seq, event_type, role, content, metadata_json, occurred_at)
         VALUES (
            ?1,
            (SELECT COALESCE(MAX(seq), 0) + 1 FROM conversation_events WHERE conversation_id = ?1),
            ?2, ?3, ?4, ?5, ?6
         )
         RETURNING id, seq",
        params![
            conversation_id,
            event.event_type.as_str(),
            role,
            event.content,
            metadata_json,
            occurred_at,
        ],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    tracing::debug!(
        conversation_id,
        seq,
        event_type = event.event_type.as_str(),
        "conversation event appended"
    );

    Ok(ConversationEvent {
        id,
        conversation_id: conversation_id.to_string(),
        seq,
        event_type: event.event_type.as_str().to_string(),
        role: role.map(str::to_string),
        content: event.content.clone(),
        metadata: event.metadata.clone(),
        occurred_at,
    })
}

/// Lists a conversation's events in sequence order.
///
/// Only events with `seq > after_seq` are returned when a cursor is given.
/// `limit` defaults to [`DEFAULT_EVENT_LIMIT`].
///
/// # Errors
///
/// Returns `StoreError::Database` on SQL failure or
/// `StoreError::Serialization` if stored metadata is not valid JSON.
pub fn list_events(
    conn: &Connection,
    conversation_id: &str,
    after_seq: Option<i64>,
    limit: Option<i64>,
) -> Result<Vec<ConversationEvent>, StoreError> {
    let limit = limit.unwrap_or(DEFAULT_EVENT_LIMIT).clamp(1, 1_000);
    let mut stmt = conn.prepare(
        "SELECT id, conversation_id, seq, event_type, role, content, metadata_json, occurred_at
         FROM conversation_events
         WHERE conversation_id = ?1 AND seq > ?2
         ORDER BY seq ASC
         LIMIT ?3",
    )?;

    let rows = stmt.query_map(
        params![conversation_id, after_seq.unwrap_or(0), limit],
        |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
            ))
        },
    )?;

    let mut events = Vec::new();
    for row in rows {
        let (id, conversation_id, seq, event_type, role, content, metadata_json, occurred_at) =
            row?;
        events.push(ConversationEvent {
            id,
            conversation_id,
            seq,
            event_type,
            role,
            content,
            metadata: serde_json::from_str(&metadata_json)?,
            occurred_at,
        });
    }
    Ok(events)
}
