//! Voice processing module
//!
//! Handles PCM framing, microphone capture, and gapless playback.
//! The Live session itself lives in `session`.

mod capture;
pub mod codec;
mod playback;

pub use capture::{
    BlockAssembler, CAPTURE_SAMPLE_RATE, CaptureSource, CpalInput, DEFAULT_BLOCK_SIZE,
    InputDevice, SampleSink,
};
pub use codec::{AudioFrame, decode, encode};
pub use playback::{
    CpalOutput, FinishSink, OutputDevice, PLAYBACK_SAMPLE_RATE, PlaybackScheduler,
    PlaybackSource, SourceId,
};

use crate::Error;

/// Map a cpal failure onto the device error taxonomy
///
/// cpal has no dedicated permission error; hosts report refusals through
/// their backend-specific message.
pub(crate) fn device_error(err: impl std::fmt::Display) -> Error {
    let message = err.to_string();
    let lower = message.to_lowercase();
    if ["permission", "denied", "not authorized", "not permitted"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        Error::PermissionDenied(message)
    } else {
        Error::DeviceUnavailable(message)
    }
}
