//! Events flowing into and out of the session controller
//!
//! Every device callback, network event and UI command becomes a
//! [`ControlEvent`] on one queue, so all session state is mutated from a
//! single place. [`SessionEvent`]s go the other way, to the hosting UI.

use tokio::sync::mpsc;

use crate::voice::{AudioFrame, SourceId};
use crate::{Error, ErrorKind};

/// Generation number of a session within one controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub(crate) u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Event raised by a session channel
#[derive(Debug)]
pub enum ChannelEvent {
    /// Session ready to accept audio
    Opened,
    /// One decodable audio chunk from the remote peer
    Audio(AudioFrame),
    /// The service cut its own speech short (user barged in)
    Interrupted,
    /// The model finished its turn
    TurnComplete,
    /// Remote or local termination
    Closed,
    /// Failure; decode errors are recoverable, everything else is fatal
    Error(Error),
}

/// Input to the controller's event queue
#[derive(Debug)]
pub enum ControlEvent {
    /// User pressed start
    Start,
    /// User pressed stop
    Stop,
    /// Tear down and end the run loop
    Shutdown,
    /// A captured frame is ready to send
    Captured { session: SessionId, frame: AudioFrame },
    /// Something happened on the session channel
    Channel { session: SessionId, event: ChannelEvent },
    /// A playback source finished naturally
    PlaybackFinished { session: SessionId, source: SourceId },
}

/// Notification for the hosting UI
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Devices are being acquired and the session negotiated
    Connecting,
    /// Session is live
    Started,
    /// Waiting for the user to speak
    Listening,
    /// Assistant speech is playing
    Speaking,
    /// Session ended normally
    Stopped,
    /// Session ended on a failure; terminal, not retried
    Error { kind: ErrorKind, message: String },
}

/// Posts events for one session onto the controller queue
///
/// Cheap to clone and safe to use from audio threads: sending never blocks.
/// Events posted after the controller has gone away are dropped.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<ControlEvent>,
    session: SessionId,
}

impl EventSender {
    pub(crate) const fn new(tx: mpsc::UnboundedSender<ControlEvent>, session: SessionId) -> Self {
        Self { tx, session }
    }

    #[must_use]
    pub const fn session(&self) -> SessionId {
        self.session
    }

    /// Report a captured frame
    pub fn captured(&self, frame: AudioFrame) {
        self.post(ControlEvent::Captured {
            session: self.session,
            frame,
        });
    }

    /// Report a channel event
    pub fn channel(&self, event: ChannelEvent) {
        self.post(ControlEvent::Channel {
            session: self.session,
            event,
        });
    }

    /// Report natural completion of a playback source
    pub fn playback_finished(&self, source: SourceId) {
        self.post(ControlEvent::PlaybackFinished {
            session: self.session,
            source,
        });
    }

    fn post(&self, event: ControlEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!(session = %self.session, "controller gone, event dropped");
        }
    }
}

/// UI-side handle for driving a controller
#[derive(Debug, Clone)]
pub struct ControlHandle {
    tx: mpsc::UnboundedSender<ControlEvent>,
}

impl ControlHandle {
    pub(crate) const fn new(tx: mpsc::UnboundedSender<ControlEvent>) -> Self {
        Self { tx }
    }

    /// Request a new session
    pub fn start(&self) {
        let _ = self.tx.send(ControlEvent::Start);
    }

    /// Request the current session to end
    pub fn stop(&self) {
        let _ = self.tx.send(ControlEvent::Stop);
    }

    /// Tear everything down and stop the controller loop
    pub fn shutdown(&self) {
        let _ = self.tx.send(ControlEvent::Shutdown);
    }
}
