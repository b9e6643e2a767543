//! Per-call usage records.

use parlance_types::{TransportKind, UsageSnapshot};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::error::StoreError;

/// Usage reported when a session is torn down.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageReport<'a> {
    pub call_id: &'a str,
    pub agent_id: &'a str,
    pub transport: TransportKind,
    pub usage: UsageSnapshot,
}

/// A stored usage row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallUsage {
    pub call_id: String,
    pub agent_id: String,
    pub transport: String,
    pub audio_bytes: u64,
    pub stt_seconds: f64,
    pub tts_characters: u64,
    pub reported_at: String,
}

/// Records usage for a call. Reporting the same call again overwrites the
/// earlier figures.
///
/// # Errors
///
/// Returns `StoreError::Database` on SQL failure.
pub fn report_usage(conn: &Connection, report: &UsageReport<'_>) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO call_usage
            (call_id, agent_id, transport, audio_bytes, stt_seconds, tts_characters)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(call_id) DO UPDATE SET
            agent_id = excluded.agent_id,
            transport = excluded.transport,
            audio_bytes = excluded.audio_bytes,
            stt_seconds = excluded.stt_seconds,
            tts_characters = excluded.tts_characters,
            reported_at = datetime('now')",
        params![
            report.call_id,
            report.agent_id,
            report.transport.as_str(),
            report.usage.audio_bytes as i64,
            report.usage.stt_seconds,
            report.usage.tts_characters as i64,
        ],
    )?;
    tracing::info!(
        call_id = report.call_id,
        agent_id = report.agent_id,
        audio_bytes = report.usage.audio_bytes,
        stt_seconds = report.usage.stt_seconds,
        tts_characters = report.usage.tts_characters,
        "call usage reported"
    );
    Ok(())
}

/// Fetches the usage recorded for `call_id`, if any.
///
/// # Errors
///
/// Returns `StoreError::Database` on SQL failure.
pub fn get_usage(conn: &Connection, call_id: &str) -> Result<Option<CallUsage>, StoreError> {
    let usage = conn
        .query_row(
            "SELECT call_id, agent_id, transport, audio_bytes, stt_seconds, tts_characters, reported_at
             FROM call_usage WHERE call_id = ?1",
            params![call_id],
            |row| {
                Ok(CallUsage {
                    call_id: row.get(0)?,
                    agent_id: row.get(1)?,
                    transport: row.get(2)?,
                    audio_bytes: row.get::<_, i64>(3)?.max(0) as u64,
                    stt_seconds: row.get(4)?,
                    tts_characters: row.get::<_, i64>(5)?.max(0) as u64,
                    reported_at: row.get(6)?,
                })
            },
        )
        .optional()?;
    Ok(usage)
}
