use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Snowflake-style platform identifiers. Represented as `i64` to match the
/// `<@ID>` mention syntax and the persistence schema's integer primary keys.
pub type GuildId = i64;
pub type ChannelId = i64;
pub type UserId = i64;

/// Voice synthesis speaker identity. Text in storage (legacy installs carry
/// an integer column that gets migrated once, see migrations/0002).
pub type SpeakerId = i64;

// ─── Queue ──────────────────────────────────────────────────────────────────

/// One unit of work for a guild's playback queue: text to speak plus the
/// speaker voice it should be spoken in. Produced by the Event Router for
/// user messages, or by the Session Manager for system announcements.
///
/// `author_id` is absent for system announcements; the Playback Worker
/// builds its normalizer context's user scope from it when present, and
/// falls back to guild+global dictionary scopes when it is not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    pub text: String,
    pub speaker_id: SpeakerId,
    pub author_id: Option<UserId>,
}

impl QueueItem {
    pub fn new(text: impl Into<String>, speaker_id: SpeakerId) -> Self {
        Self {
            text: text.into(),
            speaker_id,
            author_id: None,
        }
    }

    pub fn from_author(text: impl Into<String>, speaker_id: SpeakerId, author_id: UserId) -> Self {
        Self {
            text: text.into(),
            speaker_id,
            author_id: Some(author_id),
        }
    }
}

// ─── Dictionary ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DictionaryScope {
    Global,
    Guild,
    User,
}

/// A single substitution rule. `author_id` is only ever set for guild/user
/// rows — global entries have no author since nobody ever created new
/// dictionary content through the bot for them.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DictionaryEntry {
    pub key: String,
    pub value: String,
    pub author_id: Option<UserId>,
}

// ─── Voice preferences ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, FromRow)]
pub struct UserVoicePref {
    pub user_id: UserId,
    pub speaker_id: SpeakerId,
}

/// Per-guild TTS playback speed multiplier (defaults to 1.0 when no row exists).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, FromRow)]
pub struct GuildVoiceSpeed {
    pub guild_id: GuildId,
    pub speed: f64,
}

// ─── Autojoin ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, FromRow)]
pub struct AutojoinConfig {
    pub guild_id: GuildId,
    pub vc_channel_id: ChannelId,
    pub tts_channel_id: ChannelId,
}

// ─── Persisted voice-channel state ──────────────────────────────────────────

/// Mirrors the subset of a connected session needed to recover it across a
/// restart. Every row should eventually correspond to either a live session
/// or get deleted by reconciliation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, FromRow)]
pub struct PersistedVcState {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    pub tts_channel_id: ChannelId,
}

// ─── Server stats ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ServerStatsRow {
    pub id: i64,
    pub ts: chrono::DateTime<chrono::Utc>,
    pub guild_count: i64,
}
