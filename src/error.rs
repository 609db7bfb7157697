use thiserror::Error;

/// Errors from the voice-connect path.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("voice connect timed out")]
    Timeout,

    #[error("voice transport error: {0}")]
    Transport(String),

    /// Non-retryable: the gateway closed with a numeric close code. Codes
    /// other than 4006 are retried by the generic backoff path; 4006 means
    /// the session is already in use elsewhere and retrying just restarts
    /// the storm.
    #[error("voice connection closed (code {0})")]
    Closed(u16),

    /// Not actually an error — the caller should reuse the existing handle.
    #[error("already connected")]
    AlreadyConnected,
}

impl ConnectError {
    /// True for the non-retryable close code: no teardown, no backoff, just give up.
    pub fn is_4006(&self) -> bool {
        matches!(self, ConnectError::Closed(4006))
    }
}

/// Errors from the TTS synthesis path.
#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("no configured TTS engine could synthesize the request")]
    EngineUnavailable,

    #[error("transient engine error: {0}")]
    Transient(String),

    #[error("malformed WAV response from engine")]
    MalformedWav,

    #[error("io error writing synthesized audio: {0}")]
    Io(#[from] std::io::Error),
}

/// Crate-wide error type used anywhere a caller needs to unify the above
/// with storage failures.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Synthesis(#[from] SynthesisError),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type AppResult<T> = Result<T, AppError>;
