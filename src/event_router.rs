use std::sync::Arc;

use async_trait::async_trait;

use crate::bans::BanSet;
use crate::models::{ChannelId, GuildId, QueueItem, UserId};
use crate::normalize::format_attachment_text;
use crate::queue::QueueCore;
use crate::session::{SessionManager, VoiceStateChange};

/// The literal content that triggers the skip shortcut (§4.4). Kept as a
/// router-level check rather than a queue item so a skip can never race
/// with the text it's meant to cut off.
const SKIP_COMMAND: &str = "s";

/// Everything the router needs about one inbound text message. The chat
/// gateway collaborator is responsible for filling this in from its own
/// message representation.
pub struct InboundMessage {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    pub author_id: UserId,
    pub author_is_bot: bool,
    pub is_dm: bool,
    pub body: String,
    pub image_count: usize,
}

/// Out-of-scope collaborator for acknowledging a skip command visibly (e.g.
/// a reaction on the source message).
#[async_trait]
pub trait AckSink: Send + Sync {
    async fn acknowledge_skip(&self, channel_id: ChannelId, message_author: UserId);
}

/// Demultiplexes inbound text and voice-state events to the Queue Core and
/// Session Manager. Owns the drop predicates (bot/DM/ban/unbound-channel)
/// and the skip shortcut; every other decision belongs to the components it
/// forwards to.
pub struct EventRouter {
    queue: Arc<QueueCore>,
    pub(crate) session: Arc<SessionManager>,
    bans: Arc<BanSet>,
    acks: Arc<dyn AckSink>,
}

impl EventRouter {
    pub fn new(
        queue: Arc<QueueCore>,
        session: Arc<SessionManager>,
        bans: Arc<BanSet>,
        acks: Arc<dyn AckSink>,
    ) -> Self {
        Self { queue, session, bans, acks }
    }

    /// Handles one inbound text message (§4.7). Drops silently unless the
    /// author is eligible and the channel is the guild's bound TTS channel.
    pub async fn handle_message(&self, msg: InboundMessage) {
        if msg.author_is_bot || msg.is_dm || self.bans.contains(msg.author_id) {
            return;
        }
        if self.session.tts_channel(msg.guild_id) != Some(msg.channel_id) {
            return;
        }

        if msg.body.trim() == SKIP_COMMAND {
            self.queue.clear(msg.guild_id);
            self.session.stop_playback(msg.guild_id).await;
            self.acks.acknowledge_skip(msg.channel_id, msg.author_id).await;
            return;
        }

        let effective_text = format_attachment_text(&msg.body, msg.image_count);
        let speaker_id = self.session.user_speaker_id_for(msg.author_id).await;
        self.queue.enqueue(
            msg.guild_id,
            QueueItem::from_author(effective_text, speaker_id, msg.author_id),
        );
    }

    /// Handles one voice-state transition (§4.7): arrival/departure
    /// announcements and bot-alone auto-leave run through the Session
    /// Manager as-is; autojoin-on-arrival is evaluated here since it applies
    /// to channels the bot doesn't yet occupy.
    pub async fn handle_voice_state_change(&self, event: VoiceStateChange) {
        let guild_id = event.guild_id;
        let joined_new_channel = match (event.before_channel, event.after_channel) {
            (before, Some(after)) if before != Some(after) => Some(after),
            _ => None,
        };

        self.session.handle_voice_state_change(event).await;

        if let Some(channel_id) = joined_new_channel {
            self.session.auto_join_on_member(guild_id, channel_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatabaseConfig, EngineConfig, HttpConfig, LoggingConfig, RuntimeConfig, TtsRelayConfig};
    use crate::dictionary_cache::DictionaryCache;
    use crate::normalize::MentionResolver;
    use crate::playback::PlaybackCounters;
    use crate::session::{NotificationSink, ResolverProvider};
    use crate::tts_client::TtsClient;
    use crate::voice_transport::test_double::InMemoryVoiceTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::RwLock;
    use std::time::Duration;

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

    struct CountingAcks {
        count: AtomicUsize,
    }
    #[async_trait]
    impl AckSink for CountingAcks {
        async fn acknowledge_skip(&self, _channel_id: ChannelId, _author: UserId) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn lazy_pool() -> sqlx::PgPool {
        sqlx::pool::PoolOptions::<sqlx::Postgres>::new()
            .max_connections(1)
            .connect_lazy("postgres://invalid/invalid")
            .unwrap()
    }

    fn test_config() -> TtsRelayConfig {
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
            high_load: None,
            http: HttpConfig { port: 8080 },
            logging: LoggingConfig { level: "info".into(), format: "text".into() },
        }
    }

    fn test_router() -> (EventRouter, Arc<QueueCore>, Arc<BanSet>, Arc<CountingAcks>) {
        let pool = lazy_pool();
        let queue = QueueCore::new();
        let bans = BanSet::new();
        let acks = Arc::new(CountingAcks { count: AtomicUsize::new(0) });
        let session = SessionManager::new(
            pool.clone(),
            Arc::new(InMemoryVoiceTransport::new(Vec::new())),
            queue.clone(),
            DictionaryCache::new(pool),
            Arc::new(TtsClient::new(Arc::new(RwLock::new(test_config())))),
            Arc::new(NoopCounters),
            Arc::new(FixedResolverProvider),
            Arc::new(NoopNotifications),
            Arc::new(RwLock::new(test_config())),
        );
        let router = EventRouter::new(queue.clone(), session, bans.clone(), acks.clone());
        (router, queue, bans, acks)
    }

    fn msg(guild_id: GuildId, channel_id: ChannelId, author_id: UserId, body: &str) -> InboundMessage {
        InboundMessage {
            guild_id,
            channel_id,
            author_id,
            author_is_bot: false,
            is_dm: false,
            body: body.to_string(),
            image_count: 0,
        }
    }

    #[tokio::test]
    async fn drops_message_outside_bound_channel() {
        let (router, queue, _bans, _acks) = test_router();
        router.handle_message(msg(1, 999, 5, "hello")).await;
        assert_eq!(queue.length(1), 0);
    }

    #[tokio::test]
    async fn enqueues_message_in_bound_channel() {
        let (router, queue, _bans, _acks) = test_router();
        router.session.join(1, 10, 20, 5).await.unwrap();
        queue.clear(1); // drop connect announcement

        router.handle_message(msg(1, 20, 5, "hello")).await;

        let item = queue.try_dequeue(1).unwrap();
        assert_eq!(item.text, "hello");
        assert_eq!(item.author_id, Some(5));
    }

    #[tokio::test]
    async fn drops_message_from_banned_user() {
        let (router, queue, bans, _acks) = test_router();
        router.session.join(1, 10, 20, 5).await.unwrap();
        queue.clear(1);
        bans.add(5);

        router.handle_message(msg(1, 20, 5, "hello")).await;

        assert_eq!(queue.length(1), 0);
    }

    #[tokio::test]
    async fn skip_clears_queue_and_acknowledges_without_enqueuing() {
        let (router, queue, _bans, acks) = test_router();
        router.session.join(1, 10, 20, 5).await.unwrap();
        queue.enqueue(1, QueueItem::new("pending", 1));

        router.handle_message(msg(1, 20, 5, "s")).await;

        assert_eq!(queue.length(1), 0);
        assert_eq!(acks.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn image_only_message_becomes_count_phrase() {
        let (router, queue, _bans, _acks) = test_router();
        router.session.join(1, 10, 20, 5).await.unwrap();
        queue.clear(1);

        router
            .handle_message(InboundMessage {
                guild_id: 1,
                channel_id: 20,
                author_id: 5,
                author_is_bot: false,
                is_dm: false,
                body: String::new(),
                image_count: 3,
            })
            .await;

        assert_eq!(queue.try_dequeue(1).unwrap().text, "3枚の画像");
    }
}
