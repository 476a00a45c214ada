//! Session lifecycle state machine
//!
//! The controller owns the one active [`Session`] and is the only place its
//! state is mutated. Device callbacks, channel events and UI commands all
//! arrive as [`ControlEvent`]s on a single queue and are handled in arrival
//! order by [`SessionController::dispatch`].

use tokio::sync::mpsc;

use super::channel::{LiveChannel, SessionChannel};
use super::events::{
    ChannelEvent, ControlEvent, ControlHandle, EventSender, SessionEvent, SessionId,
};
use crate::config::{Config, SessionConfig};
use crate::voice::{
    AudioFrame, CaptureSource, CpalInput, CpalOutput, InputDevice, OutputDevice,
    PLAYBACK_SAMPLE_RATE, PlaybackScheduler, SourceId,
};
use crate::{Error, Result};

/// Lifecycle state of the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No resources held
    Idle,
    /// Devices acquired, session negotiation in flight
    Connecting,
    /// Audio flowing both ways
    Active,
    /// Normal teardown in progress
    Closing,
    /// Teardown after a failure
    Error,
}

impl SessionState {
    /// States that hold a session
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Connecting | Self::Active)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Active => write!(f, "active"),
            Self::Closing => write!(f, "closing"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Creates the devices and channel for each new session
pub trait SessionFactory {
    fn input(&mut self) -> Box<dyn InputDevice>;
    fn output(&mut self) -> Box<dyn OutputDevice>;
    fn channel(&mut self) -> Box<dyn SessionChannel>;
}

/// Default audio devices plus a Live API channel
pub struct LiveFactory {
    config: Config,
}

impl LiveFactory {
    #[must_use]
    pub const fn new(config: Config) -> Self {
        Self { config }
    }
}

impl SessionFactory for LiveFactory {
    fn input(&mut self) -> Box<dyn InputDevice> {
        Box::new(CpalInput::new())
    }

    fn output(&mut self) -> Box<dyn OutputDevice> {
        Box::new(CpalOutput::new())
    }

    fn channel(&mut self) -> Box<dyn SessionChannel> {
        Box::new(LiveChannel::from_config(&self.config))
    }
}

/// One duplex conversation and the resources it holds
struct Session {
    id: SessionId,
    capture: CaptureSource,
    scheduler: PlaybackScheduler,
    channel: Box<dyn SessionChannel>,
}

impl Session {
    fn release(mut self) {
        self.capture.close();
        self.channel.close();
        self.scheduler.close();
    }
}

/// Orchestrates capture, channel and playback for the widget
pub struct SessionController<F> {
    factory: F,
    config: SessionConfig,
    block_size: usize,
    state: SessionState,
    session: Option<Session>,
    generation: u64,
    speaking: bool,
    cleanups: usize,
    tx: mpsc::UnboundedSender<ControlEvent>,
    rx: mpsc::UnboundedReceiver<ControlEvent>,
    notify: mpsc::UnboundedSender<SessionEvent>,
}

impl<F: SessionFactory> SessionController<F> {
    /// Create an idle controller and the receiver for its UI notifications
    #[must_use]
    pub fn new(
        factory: F,
        config: SessionConfig,
        block_size: usize,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (notify, notifications) = mpsc::unbounded_channel();

        let controller = Self {
            factory,
            config,
            block_size,
            state: SessionState::Idle,
            session: None,
            generation: 0,
            speaking: false,
            cleanups: 0,
            tx,
            rx,
            notify,
        };
        (controller, notifications)
    }

    /// Handle for posting UI commands
    #[must_use]
    pub fn handle(&self) -> ControlHandle {
        ControlHandle::new(self.tx.clone())
    }

    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Id of the session currently held, if any
    #[must_use]
    pub fn session_id(&self) -> Option<SessionId> {
        self.session.as_ref().map(|s| s.id)
    }

    /// Playback scheduler of the current session
    #[must_use]
    pub fn playback(&self) -> Option<&PlaybackScheduler> {
        self.session.as_ref().map(|s| &s.scheduler)
    }

    /// Number of teardowns performed so far
    #[must_use]
    pub const fn cleanup_count(&self) -> usize {
        self.cleanups
    }

    /// Run until a shutdown event arrives
    pub async fn run(mut self) {
        tracing::debug!("session controller running");
        while let Some(event) = self.rx.recv().await {
            if !self.dispatch(event) {
                break;
            }
        }
        tracing::debug!("session controller stopped");
    }

    /// Handle every event already queued, without waiting
    ///
    /// Returns the number of events handled.
    pub fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.rx.try_recv() {
            handled += 1;
            if !self.dispatch(event) {
                break;
            }
        }
        handled
    }

    /// Apply one event to the state machine
    ///
    /// Returns false once the controller has been shut down.
    pub fn dispatch(&mut self, event: ControlEvent) -> bool {
        match event {
            ControlEvent::Start => self.start(),
            ControlEvent::Stop => self.stop(),
            ControlEvent::Shutdown => {
                self.stop();
                return false;
            }
            ControlEvent::Captured { session, frame } => {
                if self.is_current(session) {
                    self.send_frame(&frame);
                }
            }
            ControlEvent::Channel { session, event } => {
                if self.is_current(session) {
                    self.on_channel(event);
                } else {
                    tracing::trace!(%session, ?event, "stale channel event ignored");
                }
            }
            ControlEvent::PlaybackFinished { session, source } => {
                if self.is_current(session) {
                    self.on_playback_finished(source);
                }
            }
        }
        true
    }

    fn is_current(&self, id: SessionId) -> bool {
        self.session.as_ref().is_some_and(|s| s.id == id)
    }

    fn start(&mut self) {
        if self.state != SessionState::Idle {
            tracing::debug!(state = %self.state, "start ignored, session already live");
            return;
        }

        self.generation += 1;
        let id = SessionId(self.generation);

        self.transition(SessionState::Connecting);
        self.emit(SessionEvent::Connecting);

        match self.open_session(id) {
            Ok(session) => self.session = Some(session),
            Err(e) => self.fail(e),
        }
    }

    /// Acquire microphone, speaker and channel in that order
    ///
    /// Anything acquired before a failure is released when it drops.
    fn open_session(&mut self, id: SessionId) -> Result<Session> {
        let events = EventSender::new(self.tx.clone(), id);

        let capture_events = events.clone();
        let capture = CaptureSource::open(self.factory.input(), self.block_size, move |frame| {
            capture_events.captured(frame);
        })?;

        let finish_events = events.clone();
        let scheduler = PlaybackScheduler::open(
            self.factory.output(),
            PLAYBACK_SAMPLE_RATE,
            Box::new(move |source| finish_events.playback_finished(source)),
        )?;

        let mut channel = self.factory.channel();
        channel.connect(&self.config, events)?;

        tracing::info!(session = %id, model = %self.config.model, "session connecting");

        Ok(Session {
            id,
            capture,
            scheduler,
            channel,
        })
    }

    fn stop(&mut self) {
        if self.state.is_live() {
            self.close_session();
        } else {
            tracing::debug!(state = %self.state, "stop ignored, no live session");
        }
    }

    fn close_session(&mut self) {
        self.transition(SessionState::Closing);
        self.cleanup();
        self.transition(SessionState::Idle);
        self.emit(SessionEvent::Stopped);
    }

    fn fail(&mut self, err: Error) {
        let kind = err.kind();
        tracing::error!(error = %err, %kind, state = %self.state, "session failed");

        self.transition(SessionState::Error);
        self.cleanup();
        self.transition(SessionState::Idle);
        self.emit(SessionEvent::Error {
            kind,
            message: err.to_string(),
        });
    }

    fn cleanup(&mut self) {
        self.cleanups += 1;
        self.speaking = false;
        if let Some(session) = self.session.take() {
            let id = session.id;
            session.release();
            tracing::info!(session = %id, "session released");
        }
    }

    fn on_channel(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Opened => self.on_open(),
            ChannelEvent::Audio(frame) => {
                if self.state == SessionState::Active {
                    self.play(&frame);
                }
            }
            ChannelEvent::Interrupted => {
                if self.state == SessionState::Active {
                    tracing::debug!("service interrupted its turn");
                    if let Some(session) = self.session.as_mut() {
                        session.scheduler.stop_all();
                    }
                    self.set_speaking(false);
                }
            }
            ChannelEvent::TurnComplete => tracing::debug!("model turn complete"),
            ChannelEvent::Closed => match self.state {
                SessionState::Connecting => self.fail(Error::ConnectFailed(
                    "session closed before it was ready".to_string(),
                )),
                SessionState::Active => {
                    tracing::info!("session closed by service");
                    self.close_session();
                }
                _ => {}
            },
            ChannelEvent::Error(e) if e.is_recoverable() => {
                tracing::warn!(error = %e, "inbound frame dropped");
            }
            ChannelEvent::Error(e) => {
                if self.state.is_live() {
                    self.fail(e);
                }
            }
        }
    }

    fn on_open(&mut self) {
        if self.state != SessionState::Connecting {
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };

        if let Err(e) = session.capture.start() {
            self.fail(e);
            return;
        }

        self.transition(SessionState::Active);
        self.emit(SessionEvent::Started);
        self.emit(SessionEvent::Listening);
    }

    fn send_frame(&mut self, frame: &AudioFrame) {
        if self.state != SessionState::Active {
            return;
        }
        if let Some(session) = self.session.as_mut() {
            session.channel.send(frame);
        }
    }

    fn play(&mut self, frame: &AudioFrame) {
        if frame.sample_rate() != PLAYBACK_SAMPLE_RATE {
            tracing::warn!(
                sample_rate = frame.sample_rate(),
                expected = PLAYBACK_SAMPLE_RATE,
                "inbound frame at unexpected rate dropped"
            );
            return;
        }
        if frame.is_empty() {
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };

        match session.scheduler.schedule(frame.to_samples()) {
            Ok(_) => self.set_speaking(true),
            Err(e) => self.fail(e),
        }
    }

    fn on_playback_finished(&mut self, source: SourceId) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.scheduler.retire(source) && session.scheduler.is_idle() {
            self.set_speaking(false);
        }
    }

    fn set_speaking(&mut self, speaking: bool) {
        if self.speaking == speaking || self.state != SessionState::Active {
            return;
        }
        self.speaking = speaking;
        self.emit(if speaking {
            SessionEvent::Speaking
        } else {
            SessionEvent::Listening
        });
    }

    fn transition(&mut self, next: SessionState) {
        if self.state == next {
            return;
        }
        tracing::info!(from = %self.state, to = %next, "session state");
        self.state = next;
    }

    fn emit(&self, event: SessionEvent) {
        if self.notify.send(event).is_err() {
            tracing::trace!("no listener for session events");
        }
    }
}

impl SessionController<LiveFactory> {
    /// Controller wired to the default audio devices and the Live API
    #[must_use]
    pub fn live(config: Config) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let session = config.session.clone();
        let block_size = config.capture_block_size;
        Self::new(LiveFactory::new(config), session, block_size)
    }
}
