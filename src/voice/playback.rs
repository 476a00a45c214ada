//! Gapless audio playback to speakers

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};

use super::device_error;
use crate::{Error, Result};

/// Sample rate of synthesized speech from the service
pub const PLAYBACK_SAMPLE_RATE: u32 = 24000;

/// Stable identifier of a scheduled playback source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(u64);

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "src-{}", self.0)
    }
}

/// Notified from the audio thread when a source finishes naturally
pub type FinishSink = Box<dyn FnMut(SourceId) + Send + 'static>;

/// A speaker the scheduler can place sources on
///
/// Times are seconds on the device's own clock, which must never run
/// backwards. A source stopped through [`OutputDevice::stop`] is not reported
/// as finished.
pub trait OutputDevice {
    /// Acquire the device and start its clock
    ///
    /// # Errors
    ///
    /// Returns `PermissionDenied` or `DeviceUnavailable` if the device cannot
    /// be acquired
    fn open(&mut self, sample_rate: u32, on_finished: FinishSink) -> Result<()>;

    /// Current device clock in seconds
    fn now(&self) -> f64;

    /// Begin playing `samples` at `start_at`
    ///
    /// # Errors
    ///
    /// Returns error if the device is closed
    fn start(&mut self, id: SourceId, samples: Arc<[f32]>, start_at: f64) -> Result<()>;

    /// Halt a source. Unknown or finished ids are ignored.
    fn stop(&mut self, id: SourceId);

    /// Release the device. Must be idempotent.
    fn close(&mut self);
}

/// A single scheduled unit of decoded audio
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackSource {
    pub id: SourceId,
    /// Device time the source begins
    pub start_at: f64,
    /// Length in seconds
    pub duration: f64,
}

/// Schedules decoded buffers back-to-back on an output device
///
/// Keeps the timeline cursor (`next_start_time`) and the set of sources that
/// have been started but not yet finished.
pub struct PlaybackScheduler {
    output: Box<dyn OutputDevice>,
    sample_rate: u32,
    next_start_time: f64,
    active: BTreeMap<SourceId, PlaybackSource>,
    next_id: u64,
    closed: bool,
}

impl PlaybackScheduler {
    /// Acquire the output device
    ///
    /// # Errors
    ///
    /// Returns error if the output device cannot be opened
    pub fn open(
        mut output: Box<dyn OutputDevice>,
        sample_rate: u32,
        on_finished: FinishSink,
    ) -> Result<Self> {
        output.open(sample_rate, on_finished)?;
        let next_start_time = output.now();

        tracing::debug!(sample_rate, "playback scheduler opened");

        Ok(Self {
            output,
            sample_rate,
            next_start_time,
            active: BTreeMap::new(),
            next_id: 0,
            closed: false,
        })
    }

    /// Schedule a buffer after everything already queued
    ///
    /// # Errors
    ///
    /// Returns error if the scheduler is closed or the device rejects the source
    pub fn schedule(&mut self, samples: Vec<f32>) -> Result<SourceId> {
        let now = self.output.now();
        self.schedule_at(samples, now)
    }

    /// Schedule a buffer given the device clock reading `now`
    ///
    /// The buffer starts at `max(next_start_time, now)`: directly after the
    /// previous one, or immediately if the clock has already passed it.
    ///
    /// # Errors
    ///
    /// Returns error if the scheduler is closed or the device rejects the source
    pub fn schedule_at(&mut self, samples: Vec<f32>, now: f64) -> Result<SourceId> {
        if self.closed {
            return Err(Error::DeviceUnavailable("playback scheduler is closed".to_string()));
        }

        #[allow(clippy::cast_precision_loss)]
        let duration = samples.len() as f64 / f64::from(self.sample_rate);
        let start_at = self.next_start_time.max(now);
        let id = SourceId(self.next_id);

        self.output.start(id, samples.into(), start_at)?;
        self.next_id += 1;

        self.active.insert(
            id,
            PlaybackSource {
                id,
                start_at,
                duration,
            },
        );
        self.next_start_time = start_at + duration;

        tracing::trace!(
            source = %id,
            start_at,
            duration,
            gap = start_at - now,
            active = self.active.len(),
            "scheduled playback source"
        );

        Ok(id)
    }

    /// Remove a source that finished naturally
    ///
    /// Returns false for ids that are not active (already stopped or retired).
    pub fn retire(&mut self, id: SourceId) -> bool {
        let removed = self.active.remove(&id).is_some();
        if removed {
            tracing::trace!(source = %id, active = self.active.len(), "playback source finished");
        }
        removed
    }

    /// Halt every active source and rewind the cursor to the device clock
    pub fn stop_all(&mut self) {
        let stopped = self.active.len();
        for id in self.active.keys() {
            self.output.stop(*id);
        }
        self.active.clear();
        self.next_start_time = self.output.now();

        if stopped > 0 {
            tracing::debug!(stopped, "playback interrupted");
        }
    }

    /// Stop everything and release the output device. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.stop_all();
        self.output.close();
        self.closed = true;
        tracing::debug!("playback scheduler closed");
    }

    #[must_use]
    pub const fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// True when nothing is scheduled or playing
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.active.is_empty()
    }

    #[must_use]
    pub fn source(&self, id: SourceId) -> Option<&PlaybackSource> {
        self.active.get(&id)
    }

    /// Current device clock in seconds
    #[must_use]
    pub fn now(&self) -> f64 {
        self.output.now()
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.close();
    }
}

/// A source placed on the mixer timeline
struct Voice {
    id: SourceId,
    start_frame: u64,
    samples: Arc<[f32]>,
    /// Source samples per device frame
    step: f64,
}

impl Voice {
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn end_frame(&self) -> u64 {
        self.start_frame + (self.samples.len() as f64 / self.step).ceil() as u64
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn sample_at(&self, frame: u64) -> f32 {
        if frame < self.start_frame {
            return 0.0;
        }
        let offset = (frame - self.start_frame) as f64 * self.step;
        let index = offset as usize;
        let Some(&current) = self.samples.get(index) else {
            return 0.0;
        };
        let next = self.samples.get(index + 1).copied().unwrap_or(current);
        let frac = (offset - index as f64) as f32;
        (next - current).mul_add(frac, current)
    }
}

/// Render state shared with the output stream callback
struct Mixer {
    device_rate: u32,
    source_rate: u32,
    frames_rendered: u64,
    voices: Vec<Voice>,
    /// Source time and device frame where the last placed voice ends
    tail: Option<Tail>,
    on_finished: Option<FinishSink>,
}

#[derive(Clone, Copy)]
struct Tail {
    id: SourceId,
    end_at: f64,
    end_frame: u64,
}

impl Mixer {
    fn new(source_rate: u32) -> Self {
        Self {
            device_rate: source_rate,
            source_rate,
            frames_rendered: 0,
            voices: Vec::new(),
            tail: None,
            on_finished: None,
        }
    }

    /// Put a source on the timeline at `start_at` seconds
    ///
    /// A source starting where the previous one ends reuses its end frame, so
    /// adjacent sources neither overlap nor leave a gap after rounding.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn place(&mut self, id: SourceId, samples: Arc<[f32]>, start_at: f64) {
        let device_rate = f64::from(self.device_rate);
        let requested = match self.tail {
            Some(tail) if ((start_at - tail.end_at) * device_rate).abs() < 0.5 => tail.end_frame,
            _ => (start_at * device_rate).round().max(0.0) as u64,
        };
        let start_frame = requested.max(self.frames_rendered);
        let step = f64::from(self.source_rate) / device_rate;
        let end_at = start_at + samples.len() as f64 / f64::from(self.source_rate);

        let voice = Voice {
            id,
            start_frame,
            samples,
            step,
        };
        self.tail = Some(Tail {
            id,
            end_at,
            end_frame: voice.end_frame(),
        });
        self.voices.push(voice);
    }

    fn remove(&mut self, id: SourceId) {
        self.voices.retain(|voice| voice.id != id);
        if self.tail.is_some_and(|tail| tail.id == id) {
            self.tail = None;
        }
    }

    fn clear(&mut self) {
        self.voices.clear();
        self.tail = None;
    }

    #[allow(clippy::cast_precision_loss)]
    fn now(&self) -> f64 {
        self.frames_rendered as f64 / f64::from(self.device_rate)
    }

    fn render(&mut self, data: &mut [f32], channels: usize) {
        let mut frames = 0u64;
        for frame in data.chunks_mut(channels) {
            let position = self.frames_rendered + frames;
            let mixed: f32 = self.voices.iter().map(|v| v.sample_at(position)).sum();
            frame.fill(mixed.clamp(-1.0, 1.0));
            frames += 1;
        }
        self.frames_rendered += frames;

        let rendered = self.frames_rendered;
        let on_finished = &mut self.on_finished;
        self.voices.retain(|voice| {
            let done = voice.end_frame() <= rendered;
            if done {
                if let Some(notify) = on_finished.as_mut() {
                    notify(voice.id);
                }
            }
            !done
        });
    }
}

/// Default output device via cpal
///
/// Runs one output stream for the lifetime of the device and mixes scheduled
/// sources into it by frame index. The device clock is the number of frames
/// rendered so far.
pub struct CpalOutput {
    mixer: Arc<Mutex<Mixer>>,
    stream: Option<Stream>,
}

impl Default for CpalOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl CpalOutput {
    #[must_use]
    pub fn new() -> Self {
        Self {
            mixer: Arc::new(Mutex::new(Mixer::new(PLAYBACK_SAMPLE_RATE))),
            stream: None,
        }
    }
}

impl OutputDevice for CpalOutput {
    fn open(&mut self, sample_rate: u32, on_finished: FinishSink) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| Error::DeviceUnavailable("no output device available".to_string()))?;

        let supports = |channels: u16| {
            device.supported_output_configs().ok()?.find(|c| {
                c.channels() == channels
                    && c.min_sample_rate() <= SampleRate(sample_rate)
                    && c.max_sample_rate() >= SampleRate(sample_rate)
            })
        };

        let config: StreamConfig = match supports(1).or_else(|| supports(2)) {
            Some(supported) => supported.with_sample_rate(SampleRate(sample_rate)).config(),
            // Fallback: device default, sources are resampled while mixing
            None => device.default_output_config().map_err(device_error)?.config(),
        };
        let channels = usize::from(config.channels.max(1));

        {
            let mut mixer = self
                .mixer
                .lock()
                .map_err(|_| Error::Unknown("playback mixer poisoned".to_string()))?;
            mixer.device_rate = config.sample_rate.0;
            mixer.source_rate = sample_rate;
            mixer.frames_rendered = 0;
            mixer.clear();
            mixer.on_finished = Some(on_finished);
        }

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            device_rate = config.sample_rate.0,
            sample_rate,
            channels = config.channels,
            "audio playback initialized"
        );

        let mixer = Arc::clone(&self.mixer);
        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    if let Ok(mut mixer) = mixer.lock() {
                        mixer.render(data, channels);
                    } else {
                        data.fill(0.0);
                    }
                },
                |err| {
                    tracing::error!(error = %err, "audio playback error");
                },
                None,
            )
            .map_err(device_error)?;

        stream.play().map_err(device_error)?;
        self.stream = Some(stream);
        Ok(())
    }

    fn now(&self) -> f64 {
        self.mixer.lock().map(|m| m.now()).unwrap_or_default()
    }

    fn start(&mut self, id: SourceId, samples: Arc<[f32]>, start_at: f64) -> Result<()> {
        if self.stream.is_none() {
            return Err(Error::DeviceUnavailable("output device not open".to_string()));
        }

        self.mixer
            .lock()
            .map_err(|_| Error::Unknown("playback mixer poisoned".to_string()))?
            .place(id, samples, start_at);
        Ok(())
    }

    fn stop(&mut self, id: SourceId) {
        if let Ok(mut mixer) = self.mixer.lock() {
            mixer.remove(id);
        }
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            tracing::debug!("audio playback closed");
        }
        if let Ok(mut mixer) = self.mixer.lock() {
            mixer.clear();
            mixer.on_finished = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Output device with a hand-driven clock
    #[derive(Default)]
    struct ClockOutput {
        now: Arc<Mutex<f64>>,
        started: Arc<Mutex<Vec<(SourceId, f64)>>>,
        stopped: Arc<Mutex<Vec<SourceId>>>,
    }

    impl OutputDevice for ClockOutput {
        fn open(&mut self, _sample_rate: u32, _on_finished: FinishSink) -> Result<()> {
            Ok(())
        }

        fn now(&self) -> f64 {
            *self.now.lock().unwrap()
        }

        fn start(&mut self, id: SourceId, _samples: Arc<[f32]>, start_at: f64) -> Result<()> {
            self.started.lock().unwrap().push((id, start_at));
            Ok(())
        }

        fn stop(&mut self, id: SourceId) {
            self.stopped.lock().unwrap().push(id);
        }

        fn close(&mut self) {}
    }

    fn scheduler() -> (PlaybackScheduler, Arc<Mutex<f64>>, Arc<Mutex<Vec<SourceId>>>) {
        let output = ClockOutput::default();
        let clock = Arc::clone(&output.now);
        let stopped = Arc::clone(&output.stopped);
        let scheduler =
            PlaybackScheduler::open(Box::new(output), PLAYBACK_SAMPLE_RATE, Box::new(|_| {}))
                .unwrap();
        (scheduler, clock, stopped)
    }

    #[test]
    fn test_back_to_back_when_clock_keeps_up() {
        let (mut scheduler, _clock, _) = scheduler();

        let a = scheduler.schedule_at(vec![0.0; 12000], 1.0).unwrap();
        let b = scheduler.schedule_at(vec![0.0; 7200], 1.1).unwrap();

        assert_eq!(scheduler.source(a).unwrap().start_at, 1.0);
        assert!((scheduler.source(b).unwrap().start_at - 1.5).abs() < 1e-9);
        assert!((scheduler.next_start_time() - 1.8).abs() < 1e-9);
    }

    #[test]
    fn test_gap_only_after_stall() {
        let (mut scheduler, _clock, _) = scheduler();

        scheduler.schedule_at(vec![0.0; 2400], 0.0).unwrap();
        // Clock ran past the end of the first buffer
        let late = scheduler.schedule_at(vec![0.0; 2400], 0.35).unwrap();

        assert_eq!(scheduler.source(late).unwrap().start_at, 0.35);
    }

    #[test]
    fn test_retire_unknown_is_noop() {
        let (mut scheduler, _clock, _) = scheduler();
        let id = scheduler.schedule_at(vec![0.0; 240], 0.0).unwrap();

        assert!(scheduler.retire(id));
        assert!(!scheduler.retire(id));
        assert!(scheduler.is_idle());
    }

    #[test]
    fn test_stop_all_clears_and_rewinds() {
        let (mut scheduler, clock, stopped) = scheduler();

        let a = scheduler.schedule_at(vec![0.0; 24000], 0.0).unwrap();
        let b = scheduler.schedule_at(vec![0.0; 24000], 0.0).unwrap();
        *clock.lock().unwrap() = 0.4;

        scheduler.stop_all();

        assert!(scheduler.is_idle());
        assert_eq!(*stopped.lock().unwrap(), vec![a, b]);
        assert_eq!(scheduler.next_start_time(), 0.4);

        // Late completion of a stopped source
        assert!(!scheduler.retire(a));
    }

    #[test]
    fn test_closed_scheduler_rejects_sources() {
        let (mut scheduler, _clock, _) = scheduler();
        scheduler.close();
        scheduler.close();
        assert!(scheduler.schedule(vec![0.0; 10]).is_err());
    }

    #[test]
    fn test_mixer_plays_sources_back_to_back() {
        let finished = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&finished);
        let mut mixer = Mixer {
            device_rate: 4,
            source_rate: 4,
            frames_rendered: 0,
            voices: vec![
                Voice {
                    id: SourceId(0),
                    start_frame: 0,
                    samples: Arc::from(vec![0.1, 0.2]),
                    step: 1.0,
                },
                Voice {
                    id: SourceId(1),
                    start_frame: 2,
                    samples: Arc::from(vec![0.3, 0.4]),
                    step: 1.0,
                },
            ],
            tail: None,
            on_finished: Some(Box::new(move |id| log.lock().unwrap().push(id))),
        };

        let mut out = [0.0f32; 3];
        mixer.render(&mut out, 1);
        assert_eq!(out, [0.1, 0.2, 0.3]);
        assert_eq!(*finished.lock().unwrap(), vec![SourceId(0)]);

        let mut out = [0.0f32; 4];
        mixer.render(&mut out, 2);
        assert_eq!(out, [0.4, 0.4, 0.0, 0.0]);
        assert_eq!(*finished.lock().unwrap(), vec![SourceId(0), SourceId(1)]);
        assert!((mixer.now() - 1.25).abs() < 1e-9);
    }

    #[test]
    fn test_voice_interpolates_when_resampling() {
        let voice = Voice {
            id: SourceId(0),
            start_frame: 10,
            samples: Arc::from(vec![0.0, 1.0]),
            step: 0.5,
        };

        assert_eq!(voice.sample_at(9), 0.0);
        assert_eq!(voice.sample_at(10), 0.0);
        assert!((voice.sample_at(11) - 0.5).abs() < 1e-6);
        assert_eq!(voice.sample_at(12), 1.0);
        assert_eq!(voice.end_frame(), 14);
    }

    #[test]
    fn test_adjacent_sources_share_boundary_frame_when_resampling() {
        let mut mixer = Mixer::new(PLAYBACK_SAMPLE_RATE);
        mixer.device_rate = 44_100;

        // 4 source samples span 7.35 device frames: rounding the next start
        // alone would land on frame 7 while the first voice ends at frame 8
        mixer.place(SourceId(0), Arc::from(vec![0.1; 4]), 0.0);
        mixer.place(SourceId(1), Arc::from(vec![0.1; 4]), 4.0 / 24_000.0);
        mixer.place(SourceId(2), Arc::from(vec![0.1; 4]), 8.0 / 24_000.0);

        assert_eq!(mixer.voices[0].end_frame(), 8);
        assert_eq!(mixer.voices[1].start_frame, 8);
        assert_eq!(mixer.voices[2].start_frame, mixer.voices[1].end_frame());
    }

    #[test]
    fn test_source_after_gap_is_placed_by_time() {
        let mut mixer = Mixer::new(PLAYBACK_SAMPLE_RATE);
        mixer.device_rate = 44_100;

        mixer.place(SourceId(0), Arc::from(vec![0.1; 4]), 0.0);
        mixer.place(SourceId(1), Arc::from(vec![0.1; 4]), 0.01);
        assert_eq!(mixer.voices[1].start_frame, 441);

        // Stopping the last voice forgets its boundary
        mixer.remove(SourceId(1));
        mixer.place(SourceId(2), Arc::from(vec![0.1; 4]), 0.01 + 4.0 / 24_000.0);
        assert_eq!(mixer.voices[1].start_frame, 448);
    }
}
