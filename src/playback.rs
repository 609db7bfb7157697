use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::dictionary_cache::DictionaryCache;
use crate::models::{GuildId, QueueItem};
use crate::normalize::{MentionResolver, NormalizeContext};
use crate::queue::QueueCore;
use crate::tts_client::TtsClient;
use crate::voice_transport::VoiceHandle;

const EMPTY_QUEUE_SLEEP: Duration = Duration::from_millis(100);
const PLAYBACK_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Per-item TTS counters a guild actor feeds back to the metrics layer.
pub trait PlaybackCounters: Send + Sync {
    fn record_success(&self, guild_id: GuildId, shard: Option<u32>);
    fn record_error(&self, guild_id: GuildId, shard: Option<u32>);
}

/// What the Playback Worker needs from the owning `GuildSession` each
/// iteration: whether it's still connected, a handle to play through, the
/// guild's configured speed, and a mention resolver scoped to this guild.
#[async_trait]
pub trait PlaybackHost: Send + Sync {
    fn is_connected(&self) -> bool;
    fn voice_handle(&self) -> Option<Arc<dyn VoiceHandle>>;
    fn speed(&self) -> f64;
    fn shard(&self) -> Option<u32>;
    fn resolver(&self) -> Arc<dyn MentionResolver>;
}

/// One iteration of the per-guild loop. Never returns an `Err` — a failure
/// in normalize/synthesize/playback increments the error counter and lets
/// the caller continue; the loop never terminates because one item failed.
async fn run_once(
    item: QueueItem,
    guild_id: GuildId,
    dict: &DictionaryCache,
    tts: &TtsClient,
    counters: &dyn PlaybackCounters,
    host: &dyn PlaybackHost,
) {
    let Some(voice_handle) = host.voice_handle() else {
        return;
    };

    let snapshot = dict.snapshot_for_context(Some(guild_id), item.author_id).await;

    let resolver = host.resolver();
    let mut ctx = NormalizeContext::new(resolver.as_ref()).with_guild(guild_id);
    if let Some(user_id) = item.author_id {
        ctx = ctx.with_user(user_id);
    }
    let normalized = crate::normalize::normalize(&item.text, &ctx, &snapshot);

    let path = match tts
        .synthesize_to_file(&normalized, item.speaker_id, host.speed(), "playback")
        .await
    {
        Ok(path) => path,
        Err(err) => {
            tracing::warn!(guild_id, error = %err, "synthesis failed, dropping item");
            counters.record_error(guild_id, host.shard());
            return;
        }
    };

    if let Err(err) = voice_handle.play_file(&path).await {
        tracing::warn!(guild_id, error = %err, "playback failed to start");
        counters.record_error(guild_id, host.shard());
        let _ = tokio::fs::remove_file(&path).await;
        return;
    }

    while voice_handle.is_playing().await {
        tokio::time::sleep(PLAYBACK_POLL_INTERVAL).await;
    }

    counters.record_success(guild_id, host.shard());
    let _ = tokio::fs::remove_file(&path).await;
}

/// Runs the cooperative loop until `cancel` fires. Cancellation interrupts
/// the sleep/poll promptly — within one tick — and any in-flight synthesis
/// is simply abandoned; its audio is never played.
pub async fn run_loop(
    guild_id: GuildId,
    queue: Arc<QueueCore>,
    dict: Arc<DictionaryCache>,
    tts: Arc<TtsClient>,
    counters: Arc<dyn PlaybackCounters>,
    host: Arc<dyn PlaybackHost>,
    cancel: CancellationToken,
) {
    loop {
        let Some(item) = queue.try_dequeue(guild_id) else {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(EMPTY_QUEUE_SLEEP) => {}
            }
            continue;
        };

        if !host.is_connected() {
            continue;
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = run_once(item, guild_id, &dict, &tts, counters.as_ref(), host.as_ref()) => {}
        }
    }
}
