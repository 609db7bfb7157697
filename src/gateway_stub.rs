//! Placeholder implementations of the platform ports this crate defines as
//! contracts (`VoiceTransport`, `ResolverProvider`, `NotificationSink`,
//! `AckSink`). A real chat-gateway adapter binary wires these to the actual
//! platform client; this binary exists to boot the core pipeline's ambient
//! services (config, migrations, caches, reconciliation, metrics) on its
//! own, so it reports every connect attempt as unavailable rather than
//! reaching out to a gateway that isn't there.

use std::sync::Arc;

use async_trait::async_trait;

use tts_relay_core::error::ConnectError;
use tts_relay_core::event_router::AckSink;
use tts_relay_core::models::{ChannelId, GuildId, UserId};
use tts_relay_core::normalize::MentionResolver;
use tts_relay_core::session::{NotificationSink, ResolverProvider};
use tts_relay_core::voice_transport::{VoiceHandle, VoiceTransport};

pub struct UnconnectedVoiceTransport;

#[async_trait]
impl VoiceTransport for UnconnectedVoiceTransport {
    async fn connect(
        &self,
        _guild_id: GuildId,
        _channel_id: ChannelId,
        _timeout: std::time::Duration,
        _self_mute: bool,
        _self_deaf: bool,
    ) -> Result<Box<dyn VoiceHandle>, ConnectError> {
        Err(ConnectError::Transport("no gateway adapter wired into this binary".into()))
    }

    async fn non_bot_member_count(&self, _guild_id: GuildId, _channel_id: ChannelId) -> u32 {
        0
    }
}

struct NullResolver;
impl MentionResolver for NullResolver {
    fn display_name(&self, _user_id: UserId) -> Option<String> {
        None
    }
    fn role_name(&self, _role_id: UserId) -> Option<String> {
        None
    }
}

pub struct NullResolverProvider;
impl ResolverProvider for NullResolverProvider {
    fn resolver_for_guild(&self, _guild_id: GuildId) -> Arc<dyn MentionResolver> {
        Arc::new(NullResolver)
    }
}

pub struct NullNotificationSink;
#[async_trait]
impl NotificationSink for NullNotificationSink {
    async fn post_notification(&self, channel_id: ChannelId, title: &str, body: &str) {
        tracing::debug!(channel_id, title, body, "notification dropped, no gateway adapter wired");
    }
}

pub struct NullAckSink;
#[async_trait]
impl AckSink for NullAckSink {
    async fn acknowledge_skip(&self, channel_id: ChannelId, author: UserId) {
        tracing::debug!(channel_id, author, "skip ack dropped, no gateway adapter wired");
    }
}
