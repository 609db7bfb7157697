use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;

use crate::models::GuildId;
use crate::playback::PlaybackCounters;

/// In-process sampler for the per-minute TTS/error gauges (§6). The
/// `metrics` crate's own counters are monotonic, so the "sampled and reset
/// each minute" fields are computed from plain `AtomicU64`s here and
/// published as gauges on a fixed tick rather than emitted as running
/// counters.
pub struct MetricsSampler {
    success_total: AtomicU64,
    error_total: AtomicU64,
    success_by_shard: DashMap<u32, AtomicU64>,
    error_by_shard: DashMap<u32, AtomicU64>,
}

impl MetricsSampler {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            success_total: AtomicU64::new(0),
            error_total: AtomicU64::new(0),
            success_by_shard: DashMap::new(),
            error_by_shard: DashMap::new(),
        })
    }

    /// Reads and zeroes every counter, publishing each as a gauge. Intended
    /// to run on a 60s tick; safe to call from a single task since it's the
    /// only writer of the gauges it owns.
    pub fn sample_and_reset(&self) {
        let success = self.success_total.swap(0, Ordering::SeqCst);
        let error = self.error_total.swap(0, Ordering::SeqCst);
        metrics::gauge!("tts_count_per_minute").set(success as f64);
        metrics::gauge!("tts_error_count_per_minute").set(error as f64);

        for entry in self.success_by_shard.iter() {
            let count = entry.value().swap(0, Ordering::SeqCst);
            metrics::gauge!("tts_count_per_minute_shard", "shard" => entry.key().to_string()).set(count as f64);
        }
        for entry in self.error_by_shard.iter() {
            let count = entry.value().swap(0, Ordering::SeqCst);
            metrics::gauge!("tts_error_count_per_minute_shard", "shard" => entry.key().to_string())
                .set(count as f64);
        }
    }

    pub async fn run(self: std::sync::Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            self.sample_and_reset();
        }
    }
}

impl PlaybackCounters for MetricsSampler {
    fn record_success(&self, _guild_id: GuildId, shard: Option<u32>) {
        self.success_total.fetch_add(1, Ordering::SeqCst);
        if let Some(shard) = shard {
            self.success_by_shard.entry(shard).or_insert_with(|| AtomicU64::new(0)).fetch_add(1, Ordering::SeqCst);
        }
    }

    fn record_error(&self, _guild_id: GuildId, shard: Option<u32>) {
        self.error_total.fetch_add(1, Ordering::SeqCst);
        if let Some(shard) = shard {
            self.error_by_shard.entry(shard).or_insert_with(|| AtomicU64::new(0)).fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Publishes the voice-room and guild counts the Session Manager owns.
/// Called by the collaborator that tracks gateway guild membership, since
/// this crate only knows about guilds it has an active session for.
pub fn publish_voice_room_count(count: u64) {
    metrics::gauge!("voice_room_count").set(count as f64);
}

pub fn publish_guild_count(count: u64) {
    metrics::gauge!("guild_count").set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_and_reset_zeroes_counters() {
        let sampler = MetricsSampler::new();
        sampler.record_success(1, Some(0));
        sampler.record_error(1, Some(0));
        sampler.record_success(1, None);

        sampler.sample_and_reset();

        assert_eq!(sampler.success_total.load(Ordering::SeqCst), 0);
        assert_eq!(sampler.error_total.load(Ordering::SeqCst), 0);
        assert_eq!(sampler.success_by_shard.get(&0).unwrap().load(Ordering::SeqCst), 0);
    }
}
