use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::seq::SliceRandom;
use serde_json::Value;

use crate::config::TtsRelayConfig;
use crate::error::SynthesisError;
use crate::models::SpeakerId;

const ATTEMPTS_PER_ENGINE: usize = 3;
const RETRY_DELAY: Duration = Duration::from_millis(500);

pub struct SynthesisResult {
    pub used_engine_url: String,
    pub wav_bytes: Vec<u8>,
    pub duration_seconds: f64,
}

/// Load-balanced client over a pool of TTS engine URLs. Configuration is
/// re-read on every call so operators can add/remove engines without a
/// restart.
pub struct TtsClient {
    http: reqwest::Client,
    config: std::sync::Arc<std::sync::RwLock<TtsRelayConfig>>,
}

impl TtsClient {
    pub fn new(config: std::sync::Arc<std::sync::RwLock<TtsRelayConfig>>) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    fn current_engine_order(&self) -> Vec<String> {
        let mut urls = self.config.read().unwrap().engine.urls.clone();
        urls.shuffle(&mut rand::thread_rng());
        urls
    }

    /// `synthesize(text, speakerId, speed)` — two sequential HTTP exchanges
    /// per attempt against a randomly chosen engine, retried up to three
    /// times before failing over to the next engine.
    pub async fn synthesize(
        &self,
        text: &str,
        speaker_id: SpeakerId,
        speed: f64,
    ) -> Result<SynthesisResult, SynthesisError> {
        let engines = self.current_engine_order();
        let mut last_error: Option<SynthesisError> = None;

        for base_url in &engines {
            for attempt in 0..ATTEMPTS_PER_ENGINE {
                let started = std::time::Instant::now();
                match self.try_once(base_url, text, speaker_id, speed).await {
                    Ok(wav_bytes) => {
                        let elapsed = started.elapsed();
                        let duration_seconds = wav_duration_seconds(&wav_bytes).unwrap_or(0.0);
                        publish_processing_ratio(elapsed, duration_seconds);
                        return Ok(SynthesisResult {
                            used_engine_url: base_url.clone(),
                            wav_bytes,
                            duration_seconds,
                        });
                    }
                    Err(err) => {
                        tracing::warn!(
                            engine = %base_url,
                            attempt = attempt + 1,
                            error = %err,
                            "tts synthesis attempt failed"
                        );
                        last_error = Some(err);
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
            }
        }

        tracing::error!(error = ?last_error, "all configured tts engines exhausted");
        Err(SynthesisError::EngineUnavailable)
    }

    async fn try_once(
        &self,
        base_url: &str,
        text: &str,
        speaker_id: SpeakerId,
        speed: f64,
    ) -> Result<Vec<u8>, SynthesisError> {
        let query_resp = self
            .http
            .post(format!("{base_url}/audio_query"))
            .query(&[("text", text), ("speaker", &speaker_id.to_string())])
            .send()
            .await
            .map_err(|e| SynthesisError::Transient(e.to_string()))?;

        if query_resp.status().is_server_error() {
            return Err(SynthesisError::Transient(format!(
                "audio_query returned {}",
                query_resp.status()
            )));
        }

        let mut audio_query: Value = query_resp
            .json()
            .await
            .map_err(|e| SynthesisError::Transient(e.to_string()))?;

        if let Some(obj) = audio_query.as_object_mut() {
            if obj.contains_key("speedScale") {
                obj.insert("speedScale".to_string(), Value::from(speed));
            }
        }

        let synth_resp = self
            .http
            .post(format!("{base_url}/synthesis"))
            .query(&[("speaker", &speaker_id.to_string())])
            .json(&audio_query)
            .send()
            .await
            .map_err(|e| SynthesisError::Transient(e.to_string()))?;

        if synth_resp.status().is_server_error() {
            return Err(SynthesisError::Transient(format!(
                "synthesis returned {}",
                synth_resp.status()
            )));
        }

        let wav_bytes = synth_resp
            .bytes()
            .await
            .map_err(|e| SynthesisError::Transient(e.to_string()))?;

        Ok(wav_bytes.to_vec())
    }

    /// `listSpeakers()` — a single random engine, no retry: low-stakes
    /// metadata call, not worth the failover machinery.
    pub async fn list_speakers(&self) -> Result<Value, SynthesisError> {
        let engines = self.current_engine_order();
        let base_url = engines
            .first()
            .ok_or(SynthesisError::EngineUnavailable)?;

        let resp = self
            .http
            .get(format!("{base_url}/speakers"))
            .send()
            .await
            .map_err(|e| SynthesisError::Transient(e.to_string()))?;

        resp.json().await.map_err(|e| SynthesisError::Transient(e.to_string()))
    }

    /// `synthesizeToFile` — saves under a project-root `tmp/` directory,
    /// named `tmp_<uuid>_<purpose>.wav`. The caller owns deletion after playback.
    pub async fn synthesize_to_file(
        &self,
        text: &str,
        speaker_id: SpeakerId,
        speed: f64,
        purpose: &str,
    ) -> Result<PathBuf, SynthesisError> {
        let result = self.synthesize(text, speaker_id, speed).await?;

        let tmp_dir = tmp_dir();
        tokio::fs::create_dir_all(&tmp_dir)
            .await
            .map_err(SynthesisError::Io)?;

        let filename = format!("tmp_{}_{purpose}.wav", uuid::Uuid::new_v4());
        let path = tmp_dir.join(filename);
        tokio::fs::write(&path, &result.wav_bytes)
            .await
            .map_err(SynthesisError::Io)?;

        Ok(path)
    }
}

fn tmp_dir() -> PathBuf {
    Path::new("tmp").to_path_buf()
}

fn wav_duration_seconds(wav_bytes: &[u8]) -> Result<f64, SynthesisError> {
    let reader = hound::WavReader::new(Cursor::new(wav_bytes))
        .map_err(|_| SynthesisError::MalformedWav)?;
    let spec = reader.spec();
    if spec.sample_rate == 0 {
        return Ok(0.0);
    }
    Ok(reader.duration() as f64 / spec.sample_rate as f64)
}

/// Publish `elapsed · 60 / durationSeconds` (processing-seconds per
/// synthesized minute) to the configured gauge. Never fails the call.
fn publish_processing_ratio(elapsed: Duration, duration_seconds: f64) {
    if duration_seconds <= 0.0 {
        return;
    }
    let seconds_per_minute = elapsed.as_secs_f64() * 60.0 / duration_seconds;
    metrics::gauge!("voice_generation_seconds_per_minute").set(seconds_per_minute);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine_wav(duration_secs: f64, sample_rate: u32) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut buf = Vec::new();
        {
            let mut writer = hound::WavWriter::new(Cursor::new(&mut buf), spec).unwrap();
            let n_samples = (duration_secs * sample_rate as f64) as u32;
            for _ in 0..n_samples {
                writer.write_sample(0i16).unwrap();
            }
            writer.finalize().unwrap();
        }
        buf
    }

    #[test]
    fn wav_duration_matches_written_length() {
        let wav = sine_wav(2.0, 24000);
        let duration = wav_duration_seconds(&wav).unwrap();
        assert!((duration - 2.0).abs() < 0.01);
    }

    #[test]
    fn malformed_wav_is_reported() {
        assert!(wav_duration_seconds(b"not a wav file").is_err());
    }
}
