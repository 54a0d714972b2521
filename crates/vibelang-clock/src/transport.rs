//! Transport server abstraction.
//!
//! The bridge never talks to JACK directly. It goes through
//! [`TransportServer`] and [`ClientSession`], which are implemented by the
//! JACK back end ([`crate::jack_server`]) and by the in-process simulator
//! ([`crate::simulated`]).

use crate::error::Result;

/// One sample period of transport position.
pub type Frames = u32;

/// Transport state as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportState {
    /// Transport halted
    #[default]
    Stopped,
    /// Transport playing
    Rolling,
    /// Waiting for slow-sync clients before rolling
    Starting,
    /// Any other server-defined state
    Other,
}

impl TransportState {
    /// Ordinal sent to the host: Stopped=0, Rolling=1, Starting=2, other=3.
    pub fn ordinal(self) -> u8 {
        match self {
            TransportState::Stopped => 0,
            TransportState::Rolling => 1,
            TransportState::Starting => 2,
            TransportState::Other => 3,
        }
    }

    /// Inverse of [`TransportState::ordinal`]; unknown values map to `Other`.
    pub fn from_ordinal(ordinal: u8) -> Self {
        match ordinal {
            0 => TransportState::Stopped,
            1 => TransportState::Rolling,
            2 => TransportState::Starting,
            _ => TransportState::Other,
        }
    }
}

impl std::fmt::Display for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransportState::Stopped => "stopped",
            TransportState::Rolling => "rolling",
            TransportState::Starting => "starting",
            TransportState::Other => "other",
        };
        f.write_str(name)
    }
}

/// Result of a single transport query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportSnapshot {
    /// Position in frames
    pub frame: Frames,
    /// Transport state
    pub state: TransportState,
    /// Server sample rate in Hz
    pub sample_rate: u32,
}

impl TransportSnapshot {
    /// Position converted to milliseconds.
    pub fn position_ms(&self) -> f64 {
        frames_to_ms(self.frame, self.sample_rate)
    }
}

/// Convert a frame count to milliseconds. A zero rate yields 0.
pub fn frames_to_ms(frames: Frames, sample_rate: u32) -> f64 {
    if sample_rate == 0 {
        return 0.0;
    }
    frames as f64 * 1000.0 / sample_rate as f64
}

/// Convert milliseconds to the nearest frame, clamped to the frame range.
pub fn ms_to_frames(ms: f64, sample_rate: u32) -> Frames {
    clamp_frames(ms * sample_rate as f64 / 1000.0)
}

/// Clamp a host-provided frame value into `0..=Frames::MAX`. NaN maps to 0.
pub fn clamp_frames(value: f64) -> Frames {
    if value.is_nan() || value <= 0.0 {
        0
    } else if value >= Frames::MAX as f64 {
        Frames::MAX
    } else {
        value.round() as Frames
    }
}

/// Which server implementation a session belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerKind {
    /// JACK audio connection kit
    Jack,
    /// In-process simulator
    Simulated,
}

impl std::fmt::Display for ServerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerKind::Jack => f.write_str("JACK"),
            ServerKind::Simulated => f.write_str("the simulated server"),
        }
    }
}

/// Describes an open session and what it is allowed to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescriptor {
    /// Server implementation
    pub server: ServerKind,
    /// Name the server assigned to our client
    pub client_name: String,
    /// Whether the host's own audio processing runs through this server
    pub drives_host_audio: bool,
}

impl SessionDescriptor {
    /// Freewheeling only makes sense when the host's audio is driven by the
    /// same server whose clock we follow.
    pub fn supports_freewheel(&self) -> bool {
        self.drives_host_audio
    }
}

/// Called by the server when it shuts down underneath us.
pub type ShutdownHandler = Box<dyn FnMut() + Send>;

/// Real-time view of the transport handed to a [`TimebaseCallback`].
///
/// Implementations must be wait-free: no locks, no allocation, no logging.
pub trait TransportCursor {
    /// Current transport position in frames.
    fn frame(&self) -> Frames;

    /// Request a relocation to `frame`.
    fn locate(&self, frame: Frames);
}

/// Hook run by the server's processing thread on every cycle while the
/// session holds timebase-master status.
pub trait TimebaseCallback: Send {
    /// Runs to completion inside the server's process cycle.
    fn on_cycle(&mut self, transport: &dyn TransportCursor);
}

/// Connects to a transport server.
pub trait TransportServer: Send + Sync {
    /// Open a named client session. The session is inactive until
    /// [`ClientSession::activate`] succeeds.
    fn open(&self, client_name: &str) -> Result<Box<dyn ClientSession>>;
}

/// A client session with a transport server.
///
/// Registration methods are called by the connection task before
/// activation; query and request methods by the control thread after.
pub trait ClientSession: Send {
    /// What this session is and what it may do.
    fn descriptor(&self) -> &SessionDescriptor;

    /// Install the handler run when the server goes away.
    fn on_shutdown(&mut self, handler: ShutdownHandler);

    /// Register as timebase master, installing the real-time hook.
    fn set_timebase_callback(&mut self, callback: Box<dyn TimebaseCallback>) -> Result<()>;

    /// Start processing. Callbacks may run from here on.
    fn activate(&mut self) -> Result<()>;

    /// Position, state and sample rate in one query.
    fn query(&self) -> Result<TransportSnapshot>;

    /// Current sample rate.
    fn sample_rate(&self) -> Result<u32>;

    /// Relocate the transport.
    fn locate(&self, frame: Frames) -> Result<()>;

    /// Start the transport rolling.
    fn start(&self) -> Result<()>;

    /// Stop the transport.
    fn stop(&self) -> Result<()>;

    /// Switch freewheel processing on or off.
    fn set_freewheel(&self, enabled: bool) -> Result<()>;

    /// Give up timebase-master status. Once this returns the timebase
    /// callback is never invoked again.
    fn release_timebase(&mut self) -> Result<()>;

    /// Deactivate and close the session.
    fn close(self: Box<Self>) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_ordinals() {
        assert_eq!(TransportState::Stopped.ordinal(), 0);
        assert_eq!(TransportState::Rolling.ordinal(), 1);
        assert_eq!(TransportState::Starting.ordinal(), 2);
        assert_eq!(TransportState::Other.ordinal(), 3);
        assert_eq!(TransportState::from_ordinal(7), TransportState::Other);
    }

    #[test]
    fn test_ms_frame_conversion() {
        assert_eq!(ms_to_frames(1000.0, 48000), 48000);
        assert_eq!(ms_to_frames(0.5, 44100), 22);
        assert_eq!(frames_to_ms(24000, 48000), 500.0);
        assert_eq!(frames_to_ms(100, 0), 0.0);
    }

    #[test]
    fn test_clamp_frames() {
        assert_eq!(clamp_frames(-5.0), 0);
        assert_eq!(clamp_frames(f64::NAN), 0);
        assert_eq!(clamp_frames(1e12), Frames::MAX);
        assert_eq!(clamp_frames(99.6), 100);
    }

    #[test]
    fn test_freewheel_capability() {
        let mut descriptor = SessionDescriptor {
            server: ServerKind::Jack,
            client_name: "vibe-clock".to_string(),
            drives_host_audio: false,
        };
        assert!(!descriptor.supports_freewheel());
        descriptor.drives_host_audio = true;
        assert!(descriptor.supports_freewheel());
    }
}
