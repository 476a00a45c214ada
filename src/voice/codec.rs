//! Linear PCM framing
//!
//! Converts between f32 samples in `[-1.0, 1.0]` and the 16-bit little-endian
//! representation used on the wire.

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use crate::{Error, Result};

/// Fixed-point scale for 16-bit PCM
const PCM_SCALE: f32 = 32768.0;

/// A chunk of mono 16-bit PCM audio
///
/// Samples are stored as little-endian bytes, the way they travel on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    sample_rate: u32,
    data: Vec<u8>,
}

impl AudioFrame {
    /// Encode f32 samples into a frame
    #[must_use]
    pub fn from_samples(samples: &[f32], sample_rate: u32) -> Self {
        Self {
            sample_rate,
            data: encode(samples),
        }
    }

    /// Wrap raw PCM bytes
    ///
    /// # Errors
    ///
    /// Returns a decode error if the byte count is not a whole number of samples
    pub fn from_pcm(data: Vec<u8>, sample_rate: u32) -> Result<Self> {
        if data.len() % 2 != 0 {
            return Err(Error::Decode(format!(
                "pcm payload has odd length {}",
                data.len()
            )));
        }
        Ok(Self { sample_rate, data })
    }

    /// Decode a base64 payload as delivered by the service
    ///
    /// # Errors
    ///
    /// Returns a decode error for invalid base64 or an odd byte count
    pub fn from_base64(payload: &str, sample_rate: u32) -> Result<Self> {
        let data = STANDARD
            .decode(payload)
            .map_err(|e| Error::Decode(format!("invalid base64 audio: {e}")))?;
        Self::from_pcm(data, sample_rate)
    }

    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Number of samples in the frame
    #[must_use]
    pub const fn len(&self) -> usize {
        self.data.len() / 2
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Raw little-endian bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Playback length of the frame
    #[must_use]
    pub fn duration(&self) -> Duration {
        #[allow(clippy::cast_precision_loss)]
        Duration::from_secs_f64(self.len() as f64 / f64::from(self.sample_rate))
    }

    /// MIME type announced alongside the payload
    #[must_use]
    pub fn mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.sample_rate)
    }

    /// Base64 payload for the wire
    #[must_use]
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.data)
    }

    /// Decode back to f32 samples
    #[must_use]
    pub fn to_samples(&self) -> Vec<f32> {
        // Length is checked at construction
        decode(&self.data).unwrap_or_default()
    }
}

/// Encode f32 samples as 16-bit little-endian PCM
///
/// Each sample is scaled by 32768 and truncated toward zero; values outside
/// the i16 range saturate.
#[must_use]
pub fn encode(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        #[allow(clippy::cast_possible_truncation)]
        let value = (sample * PCM_SCALE) as i16;
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// Decode 16-bit little-endian PCM into f32 samples
///
/// # Errors
///
/// Returns a decode error if `bytes` has an odd length
pub fn decode(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 2 != 0 {
        return Err(Error::Decode(format!(
            "pcm payload has odd length {}",
            bytes.len()
        )));
    }

    Ok(bytes
        .chunks_exact(2)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / PCM_SCALE)
        .collect())
}
