//! Per-guild multi-tenant text-to-speech relay: voice-session lifecycle,
//! ordered synthesis-and-playback queue, text normalization, and the
//! load-balanced TTS synthesis client. See `SPEC_FULL.md` for the full
//! component breakdown; this crate implements the core pipeline and leaves
//! the chat-platform gateway, the TTS engine process, and the HTTP
//! control-plane as collaborator contracts at its edges.

pub mod bans;
pub mod config;
pub mod db;
pub mod dictionary_cache;
pub mod error;
pub mod event_router;
pub mod metrics;
pub mod models;
pub mod normalize;
pub mod playback;
pub mod queue;
pub mod session;
pub mod tts_client;
pub mod voice_transport;
