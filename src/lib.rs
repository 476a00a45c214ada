//! Lumière Voice - real-time voice assistant core
//!
//! This library streams microphone audio to a Live speech-to-speech model
//! and plays the spoken replies back gaplessly:
//! - PCM framing and base64 transport encoding
//! - Microphone capture at 16 kHz in fixed-size blocks
//! - Gapless playback scheduling at 24 kHz with barge-in
//! - A single-queue session state machine with exactly-once teardown
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Host (CLI / widget)                  │
//! │        ControlHandle  ◀──▶  SessionEvent             │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                SessionController                     │
//! │   CaptureSource  │  PlaybackScheduler  │  Channel    │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │          Live API (BidiGenerateContent)              │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod session;
pub mod voice;

pub use config::{Config, SessionConfig};
pub use error::{Error, ErrorKind, Result};
pub use session::{ControlHandle, SessionController, SessionEvent, SessionState};
