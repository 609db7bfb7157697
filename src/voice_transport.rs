use async_trait::async_trait;

use crate::error::ConnectError;
use crate::models::{ChannelId, GuildId};

/// A connected voice-room handle. Owned exclusively by the `GuildSession`
/// that created it. The real implementation wraps whatever the chat
/// platform's voice gateway client hands back.
#[async_trait]
pub trait VoiceHandle: Send + Sync {
    fn channel_id(&self) -> ChannelId;
    async fn play_file(&self, path: &std::path::Path) -> Result<(), ConnectError>;
    async fn is_playing(&self) -> bool;
    /// Stop whatever is currently playing without disconnecting. Used by the
    /// skip command; a no-op if nothing is playing.
    async fn stop(&self);
    async fn disconnect(&self);
}

/// The out-of-scope collaborator this crate connects through. A real
/// implementation binds to the platform's voice gateway; tests use
/// `InMemoryVoiceTransport` instead.
#[async_trait]
pub trait VoiceTransport: Send + Sync {
    async fn connect(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        timeout: std::time::Duration,
        self_mute: bool,
        self_deaf: bool,
    ) -> Result<Box<dyn VoiceHandle>, ConnectError>;

    /// How many non-bot members currently sit in `channel_id`. Used by
    /// startup recovery to skip reconnecting to a channel nobody is in.
    /// Returns 0 if the channel can't be resolved (deleted, guild unknown).
    async fn non_bot_member_count(&self, guild_id: GuildId, channel_id: ChannelId) -> u32;
}

#[cfg(any(test, feature = "test-doubles"))]
pub mod test_double {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::sync::Mutex;

    /// What the next `connect()` call should do, set up by the test before
    /// exercising the session manager.
    #[derive(Debug, Clone)]
    pub enum ScriptedOutcome {
        Succeed,
        Fail(u16),
        Timeout,
    }

    pub struct InMemoryVoiceTransport {
        pub script: Mutex<Vec<ScriptedOutcome>>,
        pub connect_calls: std::sync::atomic::AtomicUsize,
        /// Per-channel non-bot member counts a test sets up before exercising
        /// startup recovery. Channels absent here report 0 (empty/unknown).
        pub member_counts: Mutex<std::collections::HashMap<ChannelId, u32>>,
    }

    impl InMemoryVoiceTransport {
        pub fn new(script: Vec<ScriptedOutcome>) -> Self {
            Self {
                script: Mutex::new(script),
                connect_calls: std::sync::atomic::AtomicUsize::new(0),
                member_counts: Mutex::new(std::collections::HashMap::new()),
            }
        }

        pub async fn set_member_count(&self, channel_id: ChannelId, count: u32) {
            self.member_counts.lock().await.insert(channel_id, count);
        }
    }

    #[async_trait]
    impl VoiceTransport for InMemoryVoiceTransport {
        async fn connect(
            &self,
            _guild_id: GuildId,
            channel_id: ChannelId,
            _timeout: std::time::Duration,
            _self_mute: bool,
            _self_deaf: bool,
        ) -> Result<Box<dyn VoiceHandle>, ConnectError> {
            self.connect_calls.fetch_add(1, Ordering::SeqCst);
            let outcome = {
                let mut script = self.script.lock().await;
                if script.is_empty() {
                    ScriptedOutcome::Succeed
                } else {
                    script.remove(0)
                }
            };
            match outcome {
                ScriptedOutcome::Succeed => Ok(Box::new(InMemoryVoiceHandle {
                    channel_id,
                    playing: Arc::new(AtomicBool::new(false)),
                    disconnected: Arc::new(AtomicBool::new(false)),
                })),
                ScriptedOutcome::Fail(code) => Err(ConnectError::Closed(code)),
                ScriptedOutcome::Timeout => Err(ConnectError::Timeout),
            }
        }

        async fn non_bot_member_count(&self, _guild_id: GuildId, channel_id: ChannelId) -> u32 {
            *self.member_counts.lock().await.get(&channel_id).unwrap_or(&0)
        }
    }

    pub struct InMemoryVoiceHandle {
        channel_id: ChannelId,
        playing: Arc<AtomicBool>,
        disconnected: Arc<AtomicBool>,
    }

    #[async_trait]
    impl VoiceHandle for InMemoryVoiceHandle {
        fn channel_id(&self) -> ChannelId {
            self.channel_id
        }

        async fn play_file(&self, _path: &std::path::Path) -> Result<(), ConnectError> {
            self.playing.store(true, Ordering::SeqCst);
            let playing = self.playing.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                playing.store(false, Ordering::SeqCst);
            });
            Ok(())
        }

        async fn is_playing(&self) -> bool {
            self.playing.load(Ordering::SeqCst)
        }

        async fn stop(&self) {
            self.playing.store(false, Ordering::SeqCst);
        }

        async fn disconnect(&self) {
            self.playing.store(false, Ordering::SeqCst);
            self.disconnected.store(true, Ordering::SeqCst);
        }
    }
}
