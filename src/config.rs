use anyhow::{Context, Result};
use chrono::Timelike;
use std::path::Path;

/// Top-level configuration, assembled from an optional `tts-relay.toml` file
/// (internal defaults) and then a fixed set of flat environment variables,
/// which always win. Mirrors the layered `config::Config::builder()`
/// approach while still honoring the flat `TTS_ENGINE_URL`-style surface
/// operators already script against.
#[derive(Debug, Clone)]
pub struct TtsRelayConfig {
    pub engine: EngineConfig,
    pub database: DatabaseConfig,
    pub runtime: RuntimeConfig,
    pub high_load: Option<HighLoadWindow>,
    pub http: HttpConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Comma-separated `TTS_ENGINE_URL` list, re-read on every synthesis call
    /// by the TTS client so operators can add/remove engines live.
    pub urls: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
    pub ssl: bool,
    pub max_connections: u32,
}

impl DatabaseConfig {
    pub fn connection_string(&self) -> String {
        let sslmode = if self.ssl { "require" } else { "disable" };
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            self.user, self.password, self.host, self.port, self.name, sslmode
        )
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// `DEBUG=1` suppresses writes to persistence tables used only for
    /// metrics/state restore.
    pub debug: bool,
    /// `RECONNECT=false` skips the startup reconnection sweep entirely.
    pub reconnect: bool,
    pub voice_connect_timeout: std::time::Duration,
    pub admin_id: Option<i64>,
    pub shard_count: u32,
}

/// Default speaker voice used for system announcements and as the override
/// during a high-load window when no other value is configured.
pub const DEFAULT_SPEAKER_ID: crate::models::SpeakerId = 1;

/// Daily `HH:MM-HH:MM` window (with wrap-around across midnight) in which
/// the session manager's speaker-id lookup returns a fixed high-load override.
#[derive(Debug, Clone, Copy)]
pub struct HighLoadWindow {
    pub start_minutes: u32,
    pub end_minutes: u32,
    /// Fixed UTC offset for the configured timezone. Default Asia/Tokyo (+9h).
    pub tz_offset: chrono::FixedOffset,
    /// Speaker voice every guild is pinned to while inside the window,
    /// regardless of each user's persisted preference.
    pub override_speaker_id: crate::models::SpeakerId,
}

impl HighLoadWindow {
    /// Parse `HH:MM-HH:MM`. Timezone defaults to Asia/Tokyo. The override
    /// voice comes from `HIGH_LOAD_SPEAKER_ID`, falling back to the same
    /// default speaker used for system announcements.
    pub fn parse(raw: &str, override_speaker_id: crate::models::SpeakerId) -> Result<Self> {
        let (start, end) = raw
            .split_once('-')
            .with_context(|| format!("HIGH_LOAD_TIME must be HH:MM-HH:MM, got '{raw}'"))?;
        Ok(Self {
            start_minutes: parse_hhmm(start)?,
            end_minutes: parse_hhmm(end)?,
            tz_offset: chrono::FixedOffset::east_opt(9 * 3600).expect("valid fixed offset"),
            override_speaker_id,
        })
    }

    /// Whether `now` (any timezone) falls inside the configured window,
    /// handling wrap-around across midnight.
    pub fn contains(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        let local = now.with_timezone(&self.tz_offset);
        let minutes = local.time().hour() * 60 + local.time().minute();
        if self.start_minutes <= self.end_minutes {
            minutes >= self.start_minutes && minutes < self.end_minutes
        } else {
            minutes >= self.start_minutes || minutes < self.end_minutes
        }
    }
}

fn parse_hhmm(raw: &str) -> Result<u32> {
    let (h, m) = raw
        .split_once(':')
        .with_context(|| format!("expected HH:MM, got '{raw}'"))?;
    let h: u32 = h.parse().context("invalid hour")?;
    let m: u32 = m.parse().context("invalid minute")?;
    Ok(h * 60 + m)
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl TtsRelayConfig {
    /// Load configuration from an optional `tts-relay.toml` file (internal
    /// defaults only — logging level/format) layered under the operator
    /// environment variables.
    pub fn load() -> Result<Self> {
        let config_path =
            std::env::var("TTS_RELAY_CONFIG").unwrap_or_else(|_| "tts-relay.toml".to_string());

        let mut builder = config::Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.format", "text")?;

        if Path::new(&config_path).exists() {
            builder = builder.add_source(config::File::with_name(&config_path));
        }

        let file_settings = builder.build()?;
        let logging = LoggingConfig {
            level: file_settings.get_string("logging.level")?,
            format: file_settings.get_string("logging.format")?,
        };

        let engine_urls = std::env::var("TTS_ENGINE_URL")
            .unwrap_or_else(|_| "http://localhost:50021".to_string());
        let engine = EngineConfig {
            urls: engine_urls
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        };

        let database = DatabaseConfig {
            host: env_or("DB_HOST", "localhost"),
            port: env_or("DB_PORT", "5432").parse().context("DB_PORT")?,
            name: env_or("DB_NAME", "tts_relay"),
            user: env_or("DB_USER", "postgres"),
            password: std::env::var("DB_PASSWORD").unwrap_or_default(),
            ssl: env_bool("DB_SSL", false),
            max_connections: 10,
        };

        let runtime = RuntimeConfig {
            debug: env_or("DEBUG", "0") == "1",
            reconnect: env_or("RECONNECT", "true").to_lowercase() != "false",
            voice_connect_timeout: std::time::Duration::from_secs(
                env_or("VOICE_CONNECT_TIMEOUT", "60").parse().context("VOICE_CONNECT_TIMEOUT")?,
            ),
            admin_id: std::env::var("ADMIN_ID").ok().and_then(|s| s.parse().ok()),
            shard_count: env_or("SHARD_COUNT", "1").parse().context("SHARD_COUNT")?,
        };

        let high_load = match std::env::var("HIGH_LOAD_TIME") {
            Ok(raw) if !raw.trim().is_empty() => {
                let override_speaker_id = std::env::var("HIGH_LOAD_SPEAKER_ID")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_SPEAKER_ID);
                Some(HighLoadWindow::parse(raw.trim(), override_speaker_id)?)
            }
            _ => None,
        };

        let http = HttpConfig {
            port: env_or("HTTP_PORT", "8080").parse().context("HTTP_PORT")?,
        };

        Ok(Self {
            engine,
            database,
            runtime,
            high_load,
            http,
            logging,
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.as_str(), "1" | "true" | "TRUE" | "True"),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn high_load_window_same_day() {
        let w = HighLoadWindow::parse("09:00-17:00", DEFAULT_SPEAKER_ID).unwrap();
        let inside = chrono::Utc.with_ymd_and_hms(2026, 1, 1, 3, 0, 0).unwrap(); // 12:00 JST
        assert!(w.contains(inside));
        let outside = chrono::Utc.with_ymd_and_hms(2026, 1, 1, 23, 0, 0).unwrap(); // 08:00 JST
        assert!(!w.contains(outside));
    }

    #[test]
    fn high_load_window_wraps_midnight() {
        // 22:00-03:00 JST: 23:00 JST should land inside the window.
        let w = HighLoadWindow::parse("22:00-03:00", DEFAULT_SPEAKER_ID).unwrap();
        let at_23_jst = chrono::Utc.with_ymd_and_hms(2026, 1, 1, 14, 0, 0).unwrap();
        assert!(w.contains(at_23_jst));
        let at_10_jst = chrono::Utc.with_ymd_and_hms(2026, 1, 1, 1, 0, 0).unwrap();
        assert!(!w.contains(at_10_jst));
    }
}
