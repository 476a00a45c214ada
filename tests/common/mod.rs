//! Shared test utilities
//!
//! Fake devices and channel that record every call, so session behavior can
//! be checked without audio hardware or network access.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use lumiere_voice::session::{ChannelEvent, EventSender, SessionChannel, SessionFactory};
use lumiere_voice::voice::{AudioFrame, FinishSink, InputDevice, OutputDevice, SampleSink, SourceId};
use lumiere_voice::{Error, Result, SessionConfig};

/// Microphone that is fed by the test
#[derive(Clone, Default)]
pub struct FakeInput {
    pub deny: Arc<Mutex<bool>>,
    pub sink: Arc<Mutex<Option<SampleSink>>>,
    pub opens: Arc<Mutex<usize>>,
    pub starts: Arc<Mutex<usize>>,
    pub closes: Arc<Mutex<usize>>,
}

impl FakeInput {
    /// Push samples as if the hardware delivered them
    pub fn feed(&self, samples: &[f32]) {
        if let Some(sink) = self.sink.lock().unwrap().as_mut() {
            sink(samples);
        }
    }

    pub fn closes(&self) -> usize {
        *self.closes.lock().unwrap()
    }
}

impl InputDevice for FakeInput {
    fn open(&mut self, _sample_rate: u32, sink: SampleSink) -> Result<()> {
        if *self.deny.lock().unwrap() {
            return Err(Error::PermissionDenied("microphone access denied".to_string()));
        }
        *self.opens.lock().unwrap() += 1;
        *self.sink.lock().unwrap() = Some(sink);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        *self.starts.lock().unwrap() += 1;
        Ok(())
    }

    fn close(&mut self) {
        *self.closes.lock().unwrap() += 1;
        *self.sink.lock().unwrap() = None;
    }
}

/// Speaker with a manually advanced clock
#[derive(Clone, Default)]
pub struct FakeOutput {
    pub clock: Arc<Mutex<f64>>,
    pub on_finished: Arc<Mutex<Option<FinishSink>>>,
    pub started: Arc<Mutex<Vec<(SourceId, usize, f64)>>>,
    pub stopped: Arc<Mutex<Vec<SourceId>>>,
    pub opens: Arc<Mutex<usize>>,
    pub closes: Arc<Mutex<usize>>,
}

impl FakeOutput {
    pub fn set_clock(&self, seconds: f64) {
        *self.clock.lock().unwrap() = seconds;
    }

    /// Report natural completion of a source
    pub fn finish(&self, id: SourceId) {
        if let Some(sink) = self.on_finished.lock().unwrap().as_mut() {
            sink(id);
        }
    }

    /// Ids and start times of every source started so far
    pub fn starts(&self) -> Vec<(SourceId, f64)> {
        self.started
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _, at)| (*id, *at))
            .collect()
    }

    pub fn opens(&self) -> usize {
        *self.opens.lock().unwrap()
    }

    pub fn closes(&self) -> usize {
        *self.closes.lock().unwrap()
    }
}

impl OutputDevice for FakeOutput {
    fn open(&mut self, _sample_rate: u32, on_finished: FinishSink) -> Result<()> {
        *self.opens.lock().unwrap() += 1;
        *self.on_finished.lock().unwrap() = Some(on_finished);
        Ok(())
    }

    fn now(&self) -> f64 {
        *self.clock.lock().unwrap()
    }

    fn start(&mut self, id: SourceId, samples: Arc<[f32]>, start_at: f64) -> Result<()> {
        self.started.lock().unwrap().push((id, samples.len(), start_at));
        Ok(())
    }

    fn stop(&mut self, id: SourceId) {
        self.stopped.lock().unwrap().push(id);
    }

    fn close(&mut self) {
        *self.closes.lock().unwrap() += 1;
    }
}

/// Channel that hands its event sender to the test
#[derive(Clone, Default)]
pub struct FakeChannel {
    pub events: Arc<Mutex<Option<EventSender>>>,
    pub connects: Arc<Mutex<Vec<SessionConfig>>>,
    pub sent: Arc<Mutex<Vec<AudioFrame>>>,
    pub closes: Arc<Mutex<usize>>,
}

impl FakeChannel {
    /// Raise a channel event as the network side would
    pub fn emit(&self, event: ChannelEvent) {
        if let Some(events) = self.events.lock().unwrap().as_ref() {
            events.channel(event);
        }
    }

    pub fn connects(&self) -> usize {
        self.connects.lock().unwrap().len()
    }

    pub fn sent(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn closes(&self) -> usize {
        *self.closes.lock().unwrap()
    }
}

impl SessionChannel for FakeChannel {
    fn connect(&mut self, config: &SessionConfig, events: EventSender) -> Result<()> {
        self.connects.lock().unwrap().push(config.clone());
        *self.events.lock().unwrap() = Some(events);
        Ok(())
    }

    fn send(&mut self, frame: &AudioFrame) {
        self.sent.lock().unwrap().push(frame.clone());
    }

    fn close(&mut self) {
        *self.closes.lock().unwrap() += 1;
    }
}

/// Factory that returns clones of shared fakes
#[derive(Clone, Default)]
pub struct FakeFactory {
    pub input: FakeInput,
    pub output: FakeOutput,
    pub channel: FakeChannel,
}

impl SessionFactory for FakeFactory {
    fn input(&mut self) -> Box<dyn InputDevice> {
        Box::new(self.input.clone())
    }

    fn output(&mut self) -> Box<dyn OutputDevice> {
        Box::new(self.output.clone())
    }

    fn channel(&mut self) -> Box<dyn SessionChannel> {
        Box::new(self.channel.clone())
    }
}

/// Generate sine wave samples at `sample_rate`
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn sine(frequency: f32, duration_secs: f32, sample_rate: u32) -> Vec<f32> {
    let num_samples = (sample_rate as f32 * duration_secs) as usize;
    (0..num_samples)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            0.5 * (2.0 * std::f32::consts::PI * frequency * t).sin()
        })
        .collect()
}
