use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Pool, Postgres};

use crate::config::DatabaseConfig;

pub type DbPool = Pool<Postgres>;

/// Initialize the database connection pool.
pub async fn init_pool(config: &DatabaseConfig) -> Result<DbPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.connection_string())
        .await?;

    Ok(pool)
}

/// Run embedded SQL migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ─── Dictionary ─────────────────────────────────────────────────────────────

pub mod dictionary {
    use sqlx::PgPool;

    use crate::error::AppResult;
    use crate::models::{DictionaryEntry, GuildId, UserId};

    pub async fn list_global(pool: &PgPool) -> AppResult<Vec<DictionaryEntry>> {
        let rows = sqlx::query_as::<_, DictionaryEntry>(
            "SELECT key, value, NULL::bigint AS author_id FROM global_dictionary ORDER BY key",
        )
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    pub async fn list_for_guild(pool: &PgPool, guild_id: GuildId) -> AppResult<Vec<DictionaryEntry>> {
        let rows = sqlx::query_as::<_, DictionaryEntry>(
            "SELECT key, value, author_id FROM guild_dictionary WHERE guild_id = $1 ORDER BY key",
        )
        .bind(guild_id)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    pub async fn list_for_user(pool: &PgPool, user_id: UserId) -> AppResult<Vec<DictionaryEntry>> {
        let rows = sqlx::query_as::<_, DictionaryEntry>(
            "SELECT key, value, NULL::bigint AS author_id FROM user_dictionary WHERE user_id = $1 ORDER BY key",
        )
        .bind(user_id)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    pub async fn upsert_guild(
        pool: &PgPool,
        guild_id: GuildId,
        key: &str,
        value: &str,
        author_id: Option<UserId>,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO guild_dictionary (guild_id, key, value, author_id)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (guild_id, key) DO UPDATE SET value = $3, author_id = $4
            "#,
        )
        .bind(guild_id)
        .bind(key)
        .bind(value)
        .bind(author_id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_user(pool: &PgPool, user_id: UserId, key: &str, value: &str) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO user_dictionary (user_id, key, value)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id, key) DO UPDATE SET value = $3
            "#,
        )
        .bind(user_id)
        .bind(key)
        .bind(value)
        .execute(pool)
        .await?;
        Ok(())
    }
}

// ─── Ban list ───────────────────────────────────────────────────────────────

pub mod banlist {
    use sqlx::PgPool;

    use crate::error::AppResult;
    use crate::models::UserId;

    pub async fn list_all(pool: &PgPool) -> AppResult<Vec<UserId>> {
        let ids: Vec<(UserId,)> = sqlx::query_as("SELECT user_id FROM banlist")
            .fetch_all(pool)
            .await?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    pub async fn add(pool: &PgPool, user_id: UserId) -> AppResult<()> {
        sqlx::query("INSERT INTO banlist (user_id) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(user_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn remove(pool: &PgPool, user_id: UserId) -> AppResult<()> {
        sqlx::query("DELETE FROM banlist WHERE user_id = $1")
            .bind(user_id)
            .execute(pool)
            .await?;
        Ok(())
    }
}

// ─── VC state ───────────────────────────────────────────────────────────────

pub mod vc_state {
    use sqlx::PgPool;

    use crate::error::AppResult;
    use crate::models::{ChannelId, GuildId, PersistedVcState};

    pub async fn list_all(pool: &PgPool) -> AppResult<Vec<PersistedVcState>> {
        let rows = sqlx::query_as::<_, PersistedVcState>(
            "SELECT guild_id, channel_id, tts_channel_id FROM vc_state",
        )
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    pub async fn upsert(
        pool: &PgPool,
        guild_id: GuildId,
        channel_id: ChannelId,
        tts_channel_id: ChannelId,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO vc_state (guild_id, channel_id, tts_channel_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (guild_id) DO UPDATE SET channel_id = $2, tts_channel_id = $3
            "#,
        )
        .bind(guild_id)
        .bind(channel_id)
        .bind(tts_channel_id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn delete(pool: &PgPool, guild_id: GuildId) -> AppResult<()> {
        sqlx::query("DELETE FROM vc_state WHERE guild_id = $1")
            .bind(guild_id)
            .execute(pool)
            .await?;
        Ok(())
    }
}

// ─── Per-user voice preference ──────────────────────────────────────────────

pub mod user_voice {
    use sqlx::PgPool;

    use crate::error::AppResult;
    use crate::models::{SpeakerId, UserId};

    /// The column is TEXT (see migrations/0002) so non-numeric speaker
    /// identifiers from newer engines fit too; rows written before this
    /// crate existed are plain digit strings and parse cleanly.
    pub async fn get(pool: &PgPool, user_id: UserId) -> AppResult<Option<SpeakerId>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT speaker_id FROM user_voice WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(pool)
                .await?;
        Ok(row.and_then(|(id,)| id.parse().ok()))
    }

    pub async fn set(pool: &PgPool, user_id: UserId, speaker_id: SpeakerId) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO user_voice (user_id, speaker_id)
            VALUES ($1, $2)
            ON CONFLICT (user_id) DO UPDATE SET speaker_id = $2
            "#,
        )
        .bind(user_id)
        .bind(speaker_id.to_string())
        .execute(pool)
        .await?;
        Ok(())
    }
}

// ─── Per-guild voice speed ──────────────────────────────────────────────────

pub mod server_voice_speed {
    use sqlx::PgPool;

    use crate::error::AppResult;
    use crate::models::GuildId;

    pub async fn get(pool: &PgPool, guild_id: GuildId) -> AppResult<f64> {
        let row: Option<(f64,)> =
            sqlx::query_as("SELECT speed FROM server_voice_speed WHERE guild_id = $1")
                .bind(guild_id)
                .fetch_optional(pool)
                .await?;
        Ok(row.map(|(speed,)| speed).unwrap_or(1.0))
    }

    pub async fn set(pool: &PgPool, guild_id: GuildId, speed: f64) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO server_voice_speed (guild_id, speed)
            VALUES ($1, $2)
            ON CONFLICT (guild_id) DO UPDATE SET speed = $2
            "#,
        )
        .bind(guild_id)
        .bind(speed)
        .execute(pool)
        .await?;
        Ok(())
    }
}

// ─── Autojoin ───────────────────────────────────────────────────────────────

pub mod autojoin {
    use sqlx::PgPool;

    use crate::error::AppResult;
    use crate::models::{AutojoinConfig, ChannelId, GuildId};

    pub async fn list_all(pool: &PgPool) -> AppResult<Vec<AutojoinConfig>> {
        let rows = sqlx::query_as::<_, AutojoinConfig>(
            "SELECT guild_id, vc_channel_id, tts_channel_id FROM autojoin_config",
        )
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    pub async fn set(
        pool: &PgPool,
        guild_id: GuildId,
        vc_channel_id: ChannelId,
        tts_channel_id: ChannelId,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO autojoin_config (guild_id, vc_channel_id, tts_channel_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (guild_id) DO UPDATE SET vc_channel_id = $2, tts_channel_id = $3
            "#,
        )
        .bind(guild_id)
        .bind(vc_channel_id)
        .bind(tts_channel_id)
        .execute(pool)
        .await?;
        Ok(())
    }
}

// ─── Server stats ───────────────────────────────────────────────────────────

pub mod server_stats {
    use sqlx::PgPool;

    use crate::error::AppResult;

    /// Insert a sample row, then prune anything older than a day — the
    /// table is a rolling window, not a history.
    pub async fn record(pool: &PgPool, guild_count: i64) -> AppResult<()> {
        let mut tx = pool.begin().await?;
        sqlx::query("INSERT INTO server_stats (ts, guild_count) VALUES (NOW(), $1)")
            .bind(guild_count)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM server_stats WHERE ts < NOW() - INTERVAL '1 day'")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}
