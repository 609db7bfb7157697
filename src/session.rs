use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use crate::config::{TtsRelayConfig, DEFAULT_SPEAKER_ID};
use crate::db;
use crate::dictionary_cache::DictionaryCache;
use crate::error::ConnectError;
use crate::models::{AutojoinConfig, ChannelId, GuildId, PersistedVcState, QueueItem, SpeakerId, UserId};
use crate::normalize::MentionResolver;
use crate::playback::{self, PlaybackCounters, PlaybackHost};
use crate::queue::QueueCore;
use crate::tts_client::TtsClient;
use crate::voice_transport::{VoiceHandle, VoiceTransport};

/// Backoff between `connectVoice` attempts: 1s, 2s, 4s. Index is clamped so a
/// `maxAttempts` larger than three just repeats the final delay.
const CONNECT_BACKOFF: [Duration; 3] = [Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4)];
const DEFAULT_MAX_CONNECT_ATTEMPTS: usize = 3;

/// Resolves mention tokens for a specific guild. The chat-gateway
/// collaborator owns the member/role cache this reads from; the session
/// manager only needs one handed to it per guild when a session is created.
pub trait ResolverProvider: Send + Sync {
    fn resolver_for_guild(&self, guild_id: GuildId) -> Arc<dyn MentionResolver>;
}

/// Out-of-scope collaborator for posting a notification embed to a text
/// channel, used by `autoJoinOnMember`.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn post_notification(&self, channel_id: ChannelId, title: &str, body: &str);
}

/// A voice-state transition for one member, as delivered by the chat
/// gateway. `before_channel`/`after_channel` are `None` when the member
/// wasn't/isn't in any voice channel in this guild.
pub struct VoiceStateChange {
    pub guild_id: GuildId,
    pub user_id: UserId,
    pub display_name: String,
    pub before_channel: Option<ChannelId>,
    pub after_channel: Option<ChannelId>,
}

struct GuildState {
    voice_channel_id: Option<ChannelId>,
    tts_channel_id: Option<ChannelId>,
    voice_handle: Option<Arc<dyn VoiceHandle>>,
    shard: Option<u32>,
    speed: f64,
    resolver: Arc<dyn MentionResolver>,
    cancel: Option<CancellationToken>,
}

/// One guild's session state plus the exclusive lock that serializes every
/// mutation of its voice handle. This is the "connectLock" from the data
/// model — folded into the actor rather than kept as a separate map, since
/// nothing else needs to lock a guild's connect path.
struct GuildActor {
    guild_id: GuildId,
    connect_lock: tokio::sync::Mutex<()>,
    state: RwLock<GuildState>,
}

impl PlaybackHost for GuildActor {
    fn is_connected(&self) -> bool {
        self.state.read().unwrap().voice_handle.is_some()
    }

    fn voice_handle(&self) -> Option<Arc<dyn VoiceHandle>> {
        self.state.read().unwrap().voice_handle.clone()
    }

    fn speed(&self) -> f64 {
        self.state.read().unwrap().speed
    }

    fn shard(&self) -> Option<u32> {
        self.state.read().unwrap().shard
    }

    fn resolver(&self) -> Arc<dyn MentionResolver> {
        self.state.read().unwrap().resolver.clone()
    }
}

/// Owns every guild's voice-session lifecycle: join/leave, reconnect,
/// auto-join, startup recovery, and the 10-minute reconciliation sweep.
/// `connectVoice` is the only path that ever touches a guild's voice
/// handle — every public operation here funnels through it.
pub struct SessionManager {
    actors: DashMap<GuildId, Arc<GuildActor>>,
    autojoin: DashMap<GuildId, AutojoinConfig>,
    transport: Arc<dyn VoiceTransport>,
    pool: PgPool,
    queue: Arc<QueueCore>,
    dict: Arc<DictionaryCache>,
    tts: Arc<TtsClient>,
    counters: Arc<dyn PlaybackCounters>,
    resolvers: Arc<dyn ResolverProvider>,
    notifications: Arc<dyn NotificationSink>,
    config: Arc<RwLock<TtsRelayConfig>>,
}

impl SessionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: PgPool,
        transport: Arc<dyn VoiceTransport>,
        queue: Arc<QueueCore>,
        dict: Arc<DictionaryCache>,
        tts: Arc<TtsClient>,
        counters: Arc<dyn PlaybackCounters>,
        resolvers: Arc<dyn ResolverProvider>,
        notifications: Arc<dyn NotificationSink>,
        config: Arc<RwLock<TtsRelayConfig>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            actors: DashMap::new(),
            autojoin: DashMap::new(),
            transport,
            pool,
            queue,
            dict,
            tts,
            counters,
            resolvers,
            notifications,
            config,
        })
    }

    /// Populate the in-memory autojoin table from storage. Call once at
    /// startup; there's no external notify for this table, unlike the
    /// dictionaries, so it isn't kept fresh beyond that.
    pub async fn load_autojoin_configs(&self) -> Result<(), crate::error::AppError> {
        for cfg in db::autojoin::list_all(&self.pool).await? {
            self.autojoin.insert(cfg.guild_id, cfg);
        }
        Ok(())
    }

    fn config_debug(&self) -> bool {
        self.config.read().unwrap().runtime.debug
    }

    async fn get_or_create_actor(&self, guild_id: GuildId) -> Arc<GuildActor> {
        if let Some(actor) = self.actors.get(&guild_id) {
            return actor.value().clone();
        }

        let speed = match db::server_voice_speed::get(&self.pool, guild_id).await {
            Ok(speed) => speed,
            Err(err) => {
                tracing::warn!(guild_id, error = %err, "failed to load guild voice speed, defaulting to 1.0");
                1.0
            }
        };

        let shard_count = self.config.read().unwrap().runtime.shard_count;
        let shard = if shard_count > 0 {
            Some((guild_id.rem_euclid(shard_count as i64)) as u32)
        } else {
            None
        };

        let actor = Arc::new(GuildActor {
            guild_id,
            connect_lock: tokio::sync::Mutex::new(()),
            state: RwLock::new(GuildState {
                voice_channel_id: None,
                tts_channel_id: None,
                voice_handle: None,
                shard,
                speed,
                resolver: self.resolvers.resolver_for_guild(guild_id),
                cancel: None,
            }),
        });
        self.actors.insert(guild_id, actor.clone());
        actor
    }

    fn start_playback(&self, guild_id: GuildId, actor: &Arc<GuildActor>) {
        let cancel = CancellationToken::new();
        actor.state.write().unwrap().cancel = Some(cancel.clone());

        let host: Arc<dyn PlaybackHost> = actor.clone();
        tokio::spawn(playback::run_loop(
            guild_id,
            self.queue.clone(),
            self.dict.clone(),
            self.tts.clone(),
            self.counters.clone(),
            host,
            cancel,
        ));
    }

    /// The single choke point for voice-handle lifecycle. Acquires the
    /// guild's connect lock for its whole duration so no two callers can
    /// race to mutate the same handle.
    async fn connect_voice(
        &self,
        actor: &Arc<GuildActor>,
        channel_id: ChannelId,
        max_attempts: usize,
    ) -> Result<Arc<dyn VoiceHandle>, ConnectError> {
        let _guard = actor.connect_lock.lock().await;

        if let Some(handle) = actor.state.read().unwrap().voice_handle.clone() {
            if handle.channel_id() == channel_id {
                return Ok(handle);
            }
            handle.disconnect().await;
            actor.state.write().unwrap().voice_handle = None;
        }

        let timeout = self.config.read().unwrap().runtime.voice_connect_timeout;
        let mut last_err = None;

        for attempt in 0..max_attempts.max(1) {
            match self
                .transport
                .connect(actor.guild_id, channel_id, timeout, false, true)
                .await
            {
                Ok(handle) => {
                    let handle: Arc<dyn VoiceHandle> = Arc::from(handle);
                    actor.state.write().unwrap().voice_handle = Some(handle.clone());
                    return Ok(handle);
                }
                Err(err) if err.is_4006() => {
                    // Do not retry and do not touch any handle: an earlier
                    // revision force-disconnected here and that turned a
                    // single bad close into a reconnect storm.
                    tracing::warn!(guild_id = actor.guild_id, "voice close 4006, aborting connect attempt");
                    return Err(err);
                }
                Err(ConnectError::AlreadyConnected) => {
                    // The platform thinks we're connected but we hold no
                    // handle for it; there's nothing local to reuse.
                    return Err(ConnectError::AlreadyConnected);
                }
                Err(err) => {
                    tracing::warn!(
                        guild_id = actor.guild_id,
                        attempt = attempt + 1,
                        error = %err,
                        "voice connect attempt failed"
                    );
                    last_err = Some(err);
                    if attempt + 1 < max_attempts {
                        let delay = CONNECT_BACKOFF[attempt.min(CONNECT_BACKOFF.len() - 1)];
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(last_err.unwrap_or(ConnectError::Timeout))
    }

    /// Cancels the playback worker, disconnects any voice handle, clears the
    /// queue, and deletes persisted state. Used both standalone (`leave`)
    /// and as the first step of `join` when a session already exists.
    async fn teardown(&self, guild_id: GuildId) {
        if let Some((_, actor)) = self.actors.remove(&guild_id) {
            let (cancel, handle) = {
                let mut state = actor.state.write().unwrap();
                (state.cancel.take(), state.voice_handle.take())
            };
            if let Some(cancel) = cancel {
                cancel.cancel();
            }
            if let Some(handle) = handle {
                handle.disconnect().await;
            }
        }

        self.queue.clear(guild_id);

        if !self.config_debug() {
            if let Err(err) = db::vc_state::delete(&self.pool, guild_id).await {
                tracing::warn!(guild_id, error = %err, "failed to delete persisted vc state");
            }
        }
    }

    /// `join(guildId, voiceChannel, ttsChannel)` — tears down any existing
    /// session first, connects, persists state, starts the worker, and
    /// speaks a one-off connect announcement using the requester's voice.
    pub async fn join(
        &self,
        guild_id: GuildId,
        voice_channel_id: ChannelId,
        tts_channel_id: ChannelId,
        requester_id: UserId,
    ) -> Result<(), ConnectError> {
        if self.actors.contains_key(&guild_id) {
            self.teardown(guild_id).await;
        }

        let actor = self.get_or_create_actor(guild_id).await;
        self.connect_voice(&actor, voice_channel_id, DEFAULT_MAX_CONNECT_ATTEMPTS).await?;

        {
            let mut state = actor.state.write().unwrap();
            state.voice_channel_id = Some(voice_channel_id);
            state.tts_channel_id = Some(tts_channel_id);
        }

        if !self.config_debug() {
            if let Err(err) = db::vc_state::upsert(&self.pool, guild_id, voice_channel_id, tts_channel_id).await {
                tracing::warn!(guild_id, error = %err, "failed to persist vc state");
            }
        }

        self.start_playback(guild_id, &actor);

        let speaker_id = self.user_speaker_id_for(requester_id).await;
        self.queue.enqueue(
            guild_id,
            QueueItem::from_author("接続しました。", speaker_id, requester_id),
        );

        Ok(())
    }

    /// `leave(guildId)`.
    pub async fn leave(&self, guild_id: GuildId) {
        self.teardown(guild_id).await;
    }

    async fn load_persisted(&self, guild_id: GuildId) -> Option<PersistedVcState> {
        match db::vc_state::list_all(&self.pool).await {
            Ok(rows) => rows.into_iter().find(|r| r.guild_id == guild_id),
            Err(err) => {
                tracing::warn!(guild_id, error = %err, "failed to load persisted vc state");
                None
            }
        }
    }

    /// `reconnectOnDrop(guildId)` — the bot was removed from its voice room
    /// by something other than `leave`/`join`. Discard whatever local state
    /// remains and try once, from the last known persisted channel.
    pub async fn reconnect_on_drop(&self, guild_id: GuildId) {
        if let Some((_, actor)) = self.actors.remove(&guild_id) {
            if let Some(cancel) = actor.state.write().unwrap().cancel.take() {
                cancel.cancel();
            }
        }

        let Some(persisted) = self.load_persisted(guild_id).await else {
            return;
        };

        let actor = self.get_or_create_actor(guild_id).await;
        match self.connect_voice(&actor, persisted.channel_id, 1).await {
            Ok(_) => {
                {
                    let mut state = actor.state.write().unwrap();
                    state.voice_channel_id = Some(persisted.channel_id);
                    state.tts_channel_id = Some(persisted.tts_channel_id);
                }
                self.start_playback(guild_id, &actor);
            }
            Err(err) => {
                tracing::warn!(guild_id, error = %err, "reconnect after drop failed");
                self.actors.remove(&guild_id);
            }
        }
    }

    /// `autoJoinOnMember(guildId, channelJoined)`.
    pub async fn auto_join_on_member(&self, guild_id: GuildId, channel_joined: ChannelId) {
        if self.actors.contains_key(&guild_id) {
            return;
        }
        let Some(cfg) = self.autojoin.get(&guild_id).map(|e| *e.value()) else {
            return;
        };
        if cfg.vc_channel_id != channel_joined {
            return;
        }

        let actor = self.get_or_create_actor(guild_id).await;
        match self.connect_voice(&actor, cfg.vc_channel_id, DEFAULT_MAX_CONNECT_ATTEMPTS).await {
            Ok(_) => {
                {
                    let mut state = actor.state.write().unwrap();
                    state.voice_channel_id = Some(cfg.vc_channel_id);
                    state.tts_channel_id = Some(cfg.tts_channel_id);
                }
                if !self.config_debug() {
                    if let Err(err) =
                        db::vc_state::upsert(&self.pool, guild_id, cfg.vc_channel_id, cfg.tts_channel_id).await
                    {
                        tracing::warn!(guild_id, error = %err, "failed to persist vc state");
                    }
                }
                self.start_playback(guild_id, &actor);
                self.notifications
                    .post_notification(cfg.tts_channel_id, "自動接続", "ボイスチャンネルに接続しました。")
                    .await;
            }
            Err(err) => {
                tracing::warn!(guild_id, error = %err, "autojoin connect failed");
                self.actors.remove(&guild_id);
            }
        }
    }

    /// `startupRecover()` — run once at boot. Skips the sweep entirely when
    /// `RECONNECT=false`, and skips any single guild whose target channel
    /// has emptied out since the process last ran.
    pub async fn startup_recover(&self) {
        if !self.config.read().unwrap().runtime.reconnect {
            tracing::info!("reconnect disabled, skipping startup vc recovery");
            return;
        }

        let rows = match db::vc_state::list_all(&self.pool).await {
            Ok(rows) => rows,
            Err(err) => {
                tracing::error!(error = %err, "failed to load persisted vc state at startup");
                return;
            }
        };

        for row in rows {
            let members = self.transport.non_bot_member_count(row.guild_id, row.channel_id).await;
            if members == 0 {
                tracing::info!(guild_id = row.guild_id, "skipping startup reconnect, channel empty");
                continue;
            }

            let actor = self.get_or_create_actor(row.guild_id).await;
            match self.connect_voice(&actor, row.channel_id, DEFAULT_MAX_CONNECT_ATTEMPTS).await {
                Ok(_) => {
                    {
                        let mut state = actor.state.write().unwrap();
                        state.voice_channel_id = Some(row.channel_id);
                        state.tts_channel_id = Some(row.tts_channel_id);
                    }
                    self.start_playback(row.guild_id, &actor);
                }
                Err(err) => {
                    tracing::warn!(guild_id = row.guild_id, error = %err, "startup recovery connect failed");
                    self.actors.remove(&row.guild_id);
                }
            }
        }
    }

    /// `sync()` — periodic reconciliation. See `reconcile_plan` for the pure
    /// decision logic; this just executes it against storage.
    pub async fn sync(&self) {
        let persisted = match db::vc_state::list_all(&self.pool).await {
            Ok(rows) => rows,
            Err(err) => {
                tracing::error!(error = %err, "sync: failed to load persisted vc state");
                return;
            }
        };

        let actor_states: Vec<(GuildId, bool, Option<ChannelId>, Option<ChannelId>)> = self
            .actors
            .iter()
            .map(|entry| {
                let state = entry.value().state.read().unwrap();
                (*entry.key(), state.voice_handle.is_some(), state.voice_channel_id, state.tts_channel_id)
            })
            .collect();

        let (to_delete, to_upsert) = reconcile_plan(&persisted, &actor_states);

        for guild_id in to_delete {
            if let Err(err) = db::vc_state::delete(&self.pool, guild_id).await {
                tracing::warn!(guild_id, error = %err, "sync: failed to delete stale vc state");
            }
        }
        for (guild_id, vc, tts) in to_upsert {
            if let Err(err) = db::vc_state::upsert(&self.pool, guild_id, vc, tts).await {
                tracing::warn!(guild_id, error = %err, "sync: failed to persist vc state");
            }
        }
    }

    pub async fn sync_loop(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            self.sync().await;
        }
    }

    /// The text channel currently bound to a guild's active session, if any.
    /// The Event Router checks this before enqueuing an inbound message.
    pub fn tts_channel(&self, guild_id: GuildId) -> Option<ChannelId> {
        self.actors.get(&guild_id)?.state.read().unwrap().tts_channel_id
    }

    /// Stops whatever is currently playing for a guild without tearing the
    /// session down. Used by the skip command alongside `queue.clear`.
    pub async fn stop_playback(&self, guild_id: GuildId) {
        let handle = self
            .actors
            .get(&guild_id)
            .and_then(|actor| actor.state.read().unwrap().voice_handle.clone());
        if let Some(handle) = handle {
            handle.stop().await;
        }
    }

    /// `userSpeakerIdFor(userId)`, using the real clock.
    pub async fn user_speaker_id_for(&self, user_id: UserId) -> SpeakerId {
        self.user_speaker_id_for_at(user_id, chrono::Utc::now()).await
    }

    async fn user_speaker_id_for_at(&self, user_id: UserId, now: chrono::DateTime<chrono::Utc>) -> SpeakerId {
        let high_load = self.config.read().unwrap().high_load;
        if let Some(window) = high_load {
            if window.contains(now) {
                return window.override_speaker_id;
            }
        }

        match db::user_voice::get(&self.pool, user_id).await {
            Ok(Some(id)) => id,
            Ok(None) => DEFAULT_SPEAKER_ID,
            Err(err) => {
                tracing::warn!(user_id, error = %err, "failed to load user voice pref, using default");
                DEFAULT_SPEAKER_ID
            }
        }
    }

    /// Handles a single member's voice-state transition in a guild the bot
    /// currently occupies: announces arrivals/departures into the room,
    /// then tears the session down if that departure left the bot alone.
    /// Transitions that don't touch the bot's channel are ignored.
    pub async fn handle_voice_state_change(&self, event: VoiceStateChange) {
        let Some(actor) = self.actors.get(&event.guild_id).map(|e| e.value().clone()) else {
            return;
        };
        let Some(occupied) = actor.state.read().unwrap().voice_channel_id else {
            return;
        };

        let was_here = event.before_channel == Some(occupied);
        let now_here = event.after_channel == Some(occupied);
        if !was_here && !now_here {
            return;
        }

        if now_here && !was_here {
            self.queue.enqueue(
                event.guild_id,
                QueueItem::new(format!("{}が参加しました。", event.display_name), DEFAULT_SPEAKER_ID),
            );
        } else if was_here && !now_here {
            self.queue.enqueue(
                event.guild_id,
                QueueItem::new(format!("{}が退出しました。", event.display_name), DEFAULT_SPEAKER_ID),
            );
        }

        let remaining = self.transport.non_bot_member_count(event.guild_id, occupied).await;
        if remaining == 0 {
            self.teardown(event.guild_id).await;
        }
    }
}

/// Pure reconciliation decision for `sync()` (P7): which persisted rows no
/// longer correspond to a connected session and should be deleted, and
/// which connected guilds have no persisted row and should get one.
fn reconcile_plan(
    persisted: &[PersistedVcState],
    actor_states: &[(GuildId, bool, Option<ChannelId>, Option<ChannelId>)],
) -> (Vec<GuildId>, Vec<(GuildId, ChannelId, ChannelId)>) {
    let connected: HashSet<GuildId> = actor_states
        .iter()
        .filter(|(_, connected, ..)| *connected)
        .map(|(guild_id, ..)| *guild_id)
        .collect();

    let to_delete = persisted
        .iter()
        .filter(|row| !connected.contains(&row.guild_id))
        .map(|row| row.guild_id)
        .collect();

    let persisted_guilds: HashSet<GuildId> = persisted.iter().map(|row| row.guild_id).collect();
    let to_upsert = actor_states
        .iter()
        .filter(|(guild_id, connected, ..)| *connected && !persisted_guilds.contains(guild_id))
        .filter_map(|(guild_id, _, vc, tts)| match (vc, tts) {
            (Some(vc), Some(tts)) => Some((*guild_id, *vc, *tts)),
            _ => None,
        })
        .collect();

    (to_delete, to_upsert)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatabaseConfig, EngineConfig, HighLoadWindow, HttpConfig, LoggingConfig, RuntimeConfig};
    use crate::voice_transport::test_double::{InMemoryVoiceTransport, ScriptedOutcome};
    use chrono::TimeZone;
    use std::sync::atomic::Ordering;

    struct NoopNotifications;
    #[async_trait]
    impl NotificationSink for NoopNotifications {
        async fn post_notification(&self, _channel_id: ChannelId, _title: &str, _body: &str) {}
    }

    struct NullResolver;
    impl MentionResolver for NullResolver {
        fn display_name(&self, _: UserId) -> Option<String> {
            None
        }
        fn role_name(&self, _: UserId) -> Option<String> {
            None
        }
    }

    struct FixedResolverProvider;
    impl ResolverProvider for FixedResolverProvider {
        fn resolver_for_guild(&self, _guild_id: GuildId) -> Arc<dyn MentionResolver> {
            Arc::new(NullResolver)
        }
    }

    struct NoopCounters;
    impl PlaybackCounters for NoopCounters {
        fn record_success(&self, _: GuildId, _: Option<u32>) {}
        fn record_error(&self, _: GuildId, _: Option<u32>) {}
    }

    fn lazy_pool() -> PgPool {
        sqlx::pool::PoolOptions::<sqlx::Postgres>::new()
            .max_connections(1)
            .connect_lazy("postgres://invalid/invalid")
            .unwrap()
    }

    fn test_config(high_load: Option<HighLoadWindow>) -> TtsRelayConfig {
        TtsRelayConfig {
            engine: EngineConfig { urls: vec!["http://localhost:50021".into()] },
            database: DatabaseConfig {
                host: "localhost".into(),
                port: 5432,
                name: "test".into(),
                user: "test".into(),
                password: "".into(),
                ssl: false,
                max_connections: 1,
            },
            runtime: RuntimeConfig {
                debug: true,
                reconnect: true,
                voice_connect_timeout: Duration::from_secs(5),
                admin_id: None,
                shard_count: 1,
            },
            high_load,
            http: HttpConfig { port: 8080 },
            logging: LoggingConfig { level: "info".into(), format: "text".into() },
        }
    }

    fn test_manager(high_load: Option<HighLoadWindow>) -> (Arc<SessionManager>, Arc<InMemoryVoiceTransport>) {
        let transport = Arc::new(InMemoryVoiceTransport::new(Vec::new()));
        let pool = lazy_pool();
        let manager = SessionManager::new(
            pool.clone(),
            transport.clone(),
            QueueCore::new(),
            DictionaryCache::new(pool),
            Arc::new(TtsClient::new(Arc::new(std::sync::RwLock::new(test_config(high_load.clone()))))),
            Arc::new(NoopCounters),
            Arc::new(FixedResolverProvider),
            Arc::new(NoopNotifications),
            Arc::new(RwLock::new(test_config(high_load))),
        );
        (manager, transport)
    }

    #[tokio::test]
    async fn connect_voice_reuses_handle_for_same_channel() {
        let (manager, transport) = test_manager(None);
        let actor = manager.get_or_create_actor(1).await;

        let first = manager.connect_voice(&actor, 10, 3).await.unwrap();
        let second = manager.connect_voice(&actor, 10, 3).await.unwrap();

        assert_eq!(first.channel_id(), second.channel_id());
        assert_eq!(transport.connect_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn connect_voice_returns_immediately_on_4006_without_retry() {
        let (manager, transport) = test_manager(None);
        transport.script.lock().await.push(ScriptedOutcome::Fail(4006));
        let actor = manager.get_or_create_actor(1).await;

        let err = manager.connect_voice(&actor, 10, 3).await.unwrap_err();

        assert!(err.is_4006());
        assert_eq!(transport.connect_calls.load(Ordering::SeqCst), 1);
        assert!(actor.state.read().unwrap().voice_handle.is_none());
    }

    #[tokio::test]
    async fn join_starts_session_and_enqueues_connect_announcement() {
        let (manager, _transport) = test_manager(None);

        manager.join(1, 10, 20, 5).await.unwrap();

        assert_eq!(manager.queue.length(1), 1);
        let item = manager.queue.try_dequeue(1).unwrap();
        assert_eq!(item.text, "接続しました。");
        assert_eq!(item.author_id, Some(5));
        assert!(manager.actors.get(&1).unwrap().value().state.read().unwrap().voice_handle.is_some());
    }

    #[tokio::test]
    async fn join_tears_down_prior_session_before_reconnecting() {
        let (manager, transport) = test_manager(None);

        manager.join(1, 10, 20, 5).await.unwrap();
        manager.join(1, 11, 20, 5).await.unwrap();

        assert_eq!(transport.connect_calls.load(Ordering::SeqCst), 2);
        let state = manager.actors.get(&1).unwrap();
        assert_eq!(state.value().state.read().unwrap().voice_channel_id, Some(11));
    }

    #[tokio::test]
    async fn voice_state_change_announces_arrival_then_auto_leaves_when_empty() {
        let (manager, transport) = test_manager(None);
        manager.join(1, 10, 20, 5).await.unwrap();
        manager.queue.clear(1); // drop the connect announcement to isolate this test

        manager
            .handle_voice_state_change(VoiceStateChange {
                guild_id: 1,
                user_id: 7,
                display_name: "Bob".into(),
                before_channel: None,
                after_channel: Some(10),
            })
            .await;
        let announced = manager.queue.try_dequeue(1).unwrap();
        assert_eq!(announced.text, "Bobが参加しました。");

        transport.set_member_count(10, 0).await;
        manager
            .handle_voice_state_change(VoiceStateChange {
                guild_id: 1,
                user_id: 7,
                display_name: "Bob".into(),
                before_channel: Some(10),
                after_channel: None,
            })
            .await;

        assert!(manager.actors.get(&1).is_none());
    }

    #[tokio::test]
    async fn voice_state_change_ignores_moves_between_other_rooms() {
        let (manager, _transport) = test_manager(None);
        manager.join(1, 10, 20, 5).await.unwrap();
        manager.queue.clear(1);

        manager
            .handle_voice_state_change(VoiceStateChange {
                guild_id: 1,
                user_id: 7,
                display_name: "Bob".into(),
                before_channel: Some(99),
                after_channel: Some(98),
            })
            .await;

        assert_eq!(manager.queue.length(1), 0);
        assert!(manager.actors.get(&1).is_some());
    }

    #[tokio::test]
    async fn high_load_override_applies_inside_window() {
        let window = HighLoadWindow::parse("09:00-17:00", 99).unwrap();
        let (manager, _transport) = test_manager(Some(window));

        let inside = chrono::Utc.with_ymd_and_hms(2026, 1, 1, 3, 0, 0).unwrap(); // 12:00 JST
        assert_eq!(manager.user_speaker_id_for_at(5, inside).await, 99);

        let outside = chrono::Utc.with_ymd_and_hms(2026, 1, 1, 23, 0, 0).unwrap(); // 08:00 JST
        assert_eq!(manager.user_speaker_id_for_at(5, outside).await, DEFAULT_SPEAKER_ID);
    }

    #[test]
    fn reconcile_plan_deletes_stale_and_inserts_missing() {
        let persisted = vec![
            PersistedVcState { guild_id: 1, channel_id: 10, tts_channel_id: 20 }, // stale: not connected
            PersistedVcState { guild_id: 2, channel_id: 10, tts_channel_id: 20 }, // still connected, fine
        ];
        let actor_states = vec![
            (2, true, Some(10), Some(20)),
            (3, true, Some(11), Some(21)), // connected but never persisted
            (4, false, None, None),        // known but not connected, irrelevant
        ];

        let (to_delete, to_upsert) = reconcile_plan(&persisted, &actor_states);

        assert_eq!(to_delete, vec![1]);
        assert_eq!(to_upsert, vec![(3, 11, 21)]);
    }
}
