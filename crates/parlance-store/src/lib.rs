//! Persistence for Parlance voice sessions.
//!
//! Three concerns live here, all on plain `rusqlite::Connection`s so callers
//! decide how to schedule blocking work:
//!
//! | Concern | Operations |
//! |---------|-----------|
//! | Agent configuration | [`find_voice_config`], [`upsert_agent`] |
//! | Conversation event log | [`append_event`], [`list_events`] |
//! | Call usage | [`report_usage`], [`get_usage`] |
//!
//! The conversation log is append-only. Each conversation has its own
//! monotonically increasing sequence, assigned atomically on insert.

mod agents;
mod error;
mod event;
mod events;
mod usage;

pub use agents::{find_voice_config, upsert_agent};
pub use error::StoreError;
pub use event::{ConversationEvent, ConversationEventType, NewConversationEvent};
pub use events::{append_event, list_events, DEFAULT_EVENT_LIMIT};
pub use usage::{get_usage, report_usage, CallUsage, UsageReport};
