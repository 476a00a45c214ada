//! Audio capture from microphone

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};
use rubato::{FftFixedIn, Resampler};

use super::codec::AudioFrame;
use super::device_error;
use crate::{Error, Result};

/// Sample rate for audio capture (16kHz for speech)
pub const CAPTURE_SAMPLE_RATE: u32 = 16000;

/// Samples per outbound frame
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Resampler input chunk length
const RESAMPLE_CHUNK: usize = 1024;

/// Receives mono f32 samples from an input device's audio thread
pub type SampleSink = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// A microphone the capture source can drive
///
/// `open` acquires the device and wires the sink, `start` makes it flow.
/// Samples handed to the sink are mono at the requested rate.
pub trait InputDevice {
    /// Acquire the device
    ///
    /// # Errors
    ///
    /// Returns `PermissionDenied` or `DeviceUnavailable` if the device cannot
    /// be acquired
    fn open(&mut self, sample_rate: u32, sink: SampleSink) -> Result<()>;

    /// Begin delivering samples
    ///
    /// # Errors
    ///
    /// Returns error if the stream cannot be started
    fn start(&mut self) -> Result<()>;

    /// Release the device. Must be idempotent.
    fn close(&mut self);
}

/// Splits an arbitrary sample stream into fixed-size blocks
#[derive(Debug)]
pub struct BlockAssembler {
    block_size: usize,
    pending: Vec<f32>,
}

impl BlockAssembler {
    #[must_use]
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            pending: Vec::with_capacity(block_size * 2),
        }
    }

    /// Append samples, emitting every completed block in order
    pub fn push(&mut self, samples: &[f32], mut emit: impl FnMut(&[f32])) {
        self.pending.extend_from_slice(samples);
        let mut offset = 0;
        while self.pending.len() - offset >= self.block_size {
            emit(&self.pending[offset..offset + self.block_size]);
            offset += self.block_size;
        }
        self.pending.drain(..offset);
    }

    /// Samples waiting for the next block
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}

/// Owns the microphone and pushes encoded frames
///
/// Frames are produced for as long as the source is open and started; the
/// device drives timing, so delivery is push-style through the callback
/// given to [`CaptureSource::open`].
pub struct CaptureSource {
    device: Box<dyn InputDevice>,
    capturing: bool,
    closed: bool,
}

impl CaptureSource {
    /// Acquire the input device at 16kHz
    ///
    /// No frames are delivered until [`CaptureSource::start`] is called.
    ///
    /// # Errors
    ///
    /// Returns `PermissionDenied` or `DeviceUnavailable` if the device cannot
    /// be acquired, or a configuration error for a zero block size
    pub fn open<F>(
        mut device: Box<dyn InputDevice>,
        block_size: usize,
        mut on_frame: F,
    ) -> Result<Self>
    where
        F: FnMut(AudioFrame) + Send + 'static,
    {
        if block_size == 0 {
            return Err(Error::Config("capture block size must be positive".to_string()));
        }

        let mut blocks = BlockAssembler::new(block_size);
        device.open(
            CAPTURE_SAMPLE_RATE,
            Box::new(move |samples: &[f32]| {
                blocks.push(samples, |block| {
                    on_frame(AudioFrame::from_samples(block, CAPTURE_SAMPLE_RATE));
                });
            }),
        )?;

        tracing::debug!(block_size, sample_rate = CAPTURE_SAMPLE_RATE, "capture source opened");

        Ok(Self {
            device,
            capturing: false,
            closed: false,
        })
    }

    /// Start pushing frames
    ///
    /// # Errors
    ///
    /// Returns error if the source was closed or the stream cannot start
    pub fn start(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::DeviceUnavailable("capture source is closed".to_string()));
        }
        if self.capturing {
            return Ok(());
        }

        self.device.start()?;
        self.capturing = true;
        tracing::debug!("audio capture started");
        Ok(())
    }

    /// Stop the hardware stream. Calling it again is a no-op.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.device.close();
        self.closed = true;
        self.capturing = false;
        tracing::debug!("audio capture stopped");
    }

    /// Check if currently capturing
    #[must_use]
    pub const fn is_capturing(&self) -> bool {
        self.capturing
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for CaptureSource {
    fn drop(&mut self) {
        self.close();
    }
}

/// Converts a device's native stream into mono at the capture rate
struct InputConverter {
    channels: usize,
    resampler: Option<FftFixedIn<f32>>,
    mono: Vec<f32>,
    pending: Vec<f32>,
}

impl InputConverter {
    fn new(channels: u16, device_rate: u32, target_rate: u32) -> Result<Self> {
        let resampler = if device_rate == target_rate {
            None
        } else {
            let resampler = FftFixedIn::<f32>::new(
                device_rate as usize,
                target_rate as usize,
                RESAMPLE_CHUNK,
                2,
                1,
            )
            .map_err(|e| Error::DeviceUnavailable(format!("cannot resample input: {e}")))?;
            Some(resampler)
        };

        Ok(Self {
            channels: usize::from(channels.max(1)),
            resampler,
            mono: Vec::new(),
            pending: Vec::new(),
        })
    }

    fn process(&mut self, data: &[f32], sink: &mut SampleSink) {
        if self.channels == 1 && self.resampler.is_none() {
            sink(data);
            return;
        }

        self.mono.clear();
        #[allow(clippy::cast_precision_loss)]
        let scale = 1.0 / self.channels as f32;
        self.mono.extend(
            data.chunks(self.channels)
                .map(|frame| frame.iter().sum::<f32>() * scale),
        );

        let Some(resampler) = self.resampler.as_mut() else {
            sink(&self.mono);
            return;
        };

        self.pending.extend_from_slice(&self.mono);
        let mut offset = 0;
        loop {
            let needed = resampler.input_frames_next();
            if self.pending.len() - offset < needed {
                break;
            }
            match resampler.process(&[&self.pending[offset..offset + needed]], None) {
                Ok(out) => {
                    if let Some(channel) = out.first() {
                        sink(channel);
                    }
                }
                Err(e) => tracing::warn!(error = %e, "input resampling failed, chunk dropped"),
            }
            offset += needed;
        }
        self.pending.drain(..offset);
    }
}

/// Default input device via cpal
#[derive(Default)]
pub struct CpalInput {
    stream: Option<Stream>,
}

impl CpalInput {
    #[must_use]
    pub const fn new() -> Self {
        Self { stream: None }
    }
}

impl InputDevice for CpalInput {
    fn open(&mut self, sample_rate: u32, mut sink: SampleSink) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| Error::DeviceUnavailable("no input device available".to_string()))?;

        let native = device
            .supported_input_configs()
            .map_err(device_error)?
            .find(|c| {
                c.channels() == 1
                    && c.min_sample_rate() <= SampleRate(sample_rate)
                    && c.max_sample_rate() >= SampleRate(sample_rate)
            });

        let config: StreamConfig = match native {
            Some(supported) => supported.with_sample_rate(SampleRate(sample_rate)).config(),
            // Fallback: device default, converted in the callback
            None => device.default_input_config().map_err(device_error)?.config(),
        };
        let mut converter =
            InputConverter::new(config.channels, config.sample_rate.0, sample_rate)?;

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            device_rate = config.sample_rate.0,
            sample_rate,
            channels = config.channels,
            "audio capture initialized"
        );

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    converter.process(data, &mut sink);
                },
                |err| {
                    tracing::error!(error = %err, "audio capture error");
                },
                None,
            )
            .map_err(device_error)?;

        self.stream = Some(stream);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| Error::DeviceUnavailable("input device not open".to_string()))?;
        stream.play().map_err(device_error)
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.pause() {
                tracing::debug!(error = %e, "pausing input stream failed");
            }
            drop(stream);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Input device that hands its sink back to the test
    #[derive(Clone, Default)]
    struct ManualInput {
        sink: Arc<Mutex<Option<SampleSink>>>,
        started: Arc<Mutex<bool>>,
        closes: Arc<Mutex<usize>>,
    }

    impl ManualInput {
        fn feed(&self, samples: &[f32]) {
            if let Some(sink) = self.sink.lock().unwrap().as_mut() {
                sink(samples);
            }
        }
    }

    impl InputDevice for ManualInput {
        fn open(&mut self, _sample_rate: u32, sink: SampleSink) -> Result<()> {
            *self.sink.lock().unwrap() = Some(sink);
            Ok(())
        }

        fn start(&mut self) -> Result<()> {
            *self.started.lock().unwrap() = true;
            Ok(())
        }

        fn close(&mut self) {
            *self.closes.lock().unwrap() += 1;
            *self.sink.lock().unwrap() = None;
        }
    }

    #[test]
    fn test_block_assembler_emits_full_blocks() {
        let mut blocks = BlockAssembler::new(4);
        let mut emitted = Vec::new();

        blocks.push(&[1.0, 2.0, 3.0], |b| emitted.push(b.to_vec()));
        assert!(emitted.is_empty());
        assert_eq!(blocks.buffered(), 3);

        blocks.push(&[4.0, 5.0, 6.0, 7.0, 8.0, 9.0], |b| emitted.push(b.to_vec()));
        assert_eq!(emitted, vec![vec![1.0, 2.0, 3.0, 4.0], vec![5.0, 6.0, 7.0, 8.0]]);
        assert_eq!(blocks.buffered(), 1);
    }

    #[test]
    fn test_capture_source_frames_blocks() {
        let input = ManualInput::default();
        let frames = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&frames);

        let mut capture = CaptureSource::open(Box::new(input.clone()), 2048, move |frame| {
            sink.lock().unwrap().push(frame);
        })
        .unwrap();
        capture.start().unwrap();
        assert!(*input.started.lock().unwrap());

        input.feed(&vec![0.25; 1000]);
        input.feed(&vec![0.25; 3500]);

        let frames = frames.lock().unwrap();
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.len() == 2048));
        assert!(frames.iter().all(|f| f.sample_rate() == CAPTURE_SAMPLE_RATE));
    }

    #[test]
    fn test_capture_close_is_idempotent() {
        let input = ManualInput::default();
        let mut capture = CaptureSource::open(Box::new(input.clone()), 16, |_| {}).unwrap();

        capture.close();
        capture.close();
        drop(capture);

        assert_eq!(*input.closes.lock().unwrap(), 1);
    }

    #[test]
    fn test_start_after_close_fails() {
        let mut capture =
            CaptureSource::open(Box::new(ManualInput::default()), 16, |_| {}).unwrap();
        capture.close();
        assert!(capture.start().is_err());
    }

    #[test]
    fn test_zero_block_size_rejected() {
        assert!(CaptureSource::open(Box::new(ManualInput::default()), 0, |_| {}).is_err());
    }

    #[test]
    fn test_converter_downmixes_stereo() {
        let mut converter = InputConverter::new(2, 16000, 16000).unwrap();
        let out = Arc::new(Mutex::new(Vec::new()));
        let collected = Arc::clone(&out);
        let mut sink: SampleSink =
            Box::new(move |s: &[f32]| collected.lock().unwrap().extend_from_slice(s));

        converter.process(&[0.2, 0.4, -1.0, 0.0], &mut sink);
        let out = out.lock().unwrap();
        assert_eq!(out.len(), 2);
        assert!((out[0] - 0.3).abs() < 1e-6);
        assert!((out[1] + 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_converter_resamples_to_capture_rate() {
        let mut converter = InputConverter::new(1, 48000, CAPTURE_SAMPLE_RATE).unwrap();
        let out = Arc::new(Mutex::new(0usize));
        let counted = Arc::clone(&out);
        let mut sink: SampleSink = Box::new(move |s: &[f32]| *counted.lock().unwrap() += s.len());

        // One second of input in device-sized callbacks
        for _ in 0..100 {
            converter.process(&[0.0; 480], &mut sink);
        }

        let produced = *out.lock().unwrap();
        assert!(produced > 14_000 && produced <= 16_000, "produced {produced}");
    }
}
