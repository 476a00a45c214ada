//! Duplex Live session: wire format, network channel and lifecycle
//!
//! ```text
//!  mic ─▶ CaptureSource ─┐                      ┌─▶ PlaybackScheduler ─▶ speaker
//!                        ▼                      │
//!                 SessionController (one queue) ┤
//!                        ▲                      │
//!  UI ─▶ ControlHandle ──┘     SessionChannel ◀─┘─▶ Live API
//! ```

mod channel;
mod controller;
mod events;
pub mod wire;

pub use channel::{LiveChannel, SessionChannel};
pub use controller::{LiveFactory, SessionController, SessionFactory, SessionState};
pub use events::{ChannelEvent, ControlEvent, ControlHandle, EventSender, SessionEvent, SessionId};
