//! Agent voice configuration lookup.

use parlance_types::VoiceConfig;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::StoreError;

/// Loads the voice configuration for `agent_id`.
///
/// Returns `Ok(None)` when no agent is registered under that id; callers
/// decide whether to fall back to [`VoiceConfig::fallback`].
///
/// # Errors
///
/// Returns `StoreError::Database` on SQL failure or
/// `StoreError::Serialization` if the stored tool list is not valid JSON.
pub fn find_voice_config(
    conn: &Connection,
    agent_id: &str,
) -> Result<Option<VoiceConfig>, StoreError> {
    let row = conn
        .query_row(
            "SELECT agent_id, display_name, system_prompt, locale, barge_in,
                    stt_model, tts_model, tts_voice, tools_json
             FROM agents WHERE agent_id = ?1",
            params![agent_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, bool>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, Option<String>>(7)?,
                    row.get::<_, String>(8)?,
                ))
            },
        )
        .optional()?;

    let Some((
        agent_id,
        display_name,
        system_prompt,
        locale,
        barge_in,
        stt_model,
        tts_model,
        tts_voice,
        tools_json,
    )) = row
    else {
        return Ok(None);
    };

    Ok(Some(VoiceConfig {
        agent_id,
        display_name,
        system_prompt,
        locale,
        barge_in,
        stt_model,
        tts_model,
        tts_voice,
        tools: serde_json::from_str(&tools_json)?,
    }))
}

/// Inserts or replaces the configuration for `config.agent_id`.
///
/// # Errors
///
/// Returns `StoreError::Database` on SQL failure or
/// `StoreError::Serialization` if the tool list cannot be serialised.
pub fn upsert_agent(conn: &Connection, config: &VoiceConfig) -> Result<(), StoreError> {
    let tools_json = serde_json::to_string(&config.tools)?;
    conn.execute(
        "INSERT INTO agents
            (agent_id, display_name, system_prompt, locale, barge_in,
             stt_model, tts_model, tts_voice, tools_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(agent_id) DO UPDATE SET
            display_name = excluded.display_name,
            system_prompt = excluded.system_prompt,
            locale = excluded.locale,
            barge_in = excluded.barge_in,
            stt_model = excluded.stt_model,
            tts_model = excluded.tts_model,
            tts_voice = excluded.tts_voice,
            tools_json = excluded.tools_json,
            updated_at = datetime('now')",
        params![
            config.agent_id,
            config.display_name,
            config.system_prompt,
            config.locale,
            config.barge_in,
            config.stt_model,
            config.tts_model,
            config.tts_voice,
            tools_json,
        ],
    )?;
    Ok(())
}
