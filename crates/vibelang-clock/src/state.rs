//! Shared bridge state.
//!
//! [`BridgeState`] is touched by three threads: the control thread (polls and
//! commands), the connection task, and the transport server's real-time
//! thread. Every field is stored in an atomic, so the real-time side never
//! waits on a lock. The connection fields change hands in sequence (task,
//! then shutdown notification, then teardown after the task is joined); the
//! others have a single writer.
//!
//! | field              | writer            | readers              |
//! |--------------------|-------------------|----------------------|
//! | `connected`        | connection task, shutdown notification, teardown | control |
//! | `status`           | connection task, shutdown notification, teardown | control |
//! | `sample_rate`      | reporter          | control              |
//! | `transport_state`  | reporter          | reporter             |
//! | `loop_enabled`     | commands          | real-time            |
//! | `loop_region`      | commands          | real-time            |
//!
//! The loop-wrap latch is not here: it lives inside the
//! [`LoopController`](crate::looper::LoopController), which only the
//! real-time thread can reach.

use crate::error::{Error, Result};
use crate::transport::TransportState;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};

/// A validated loop region in frames, `begin < end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopRegion {
    begin: u32,
    end: u32,
}

impl LoopRegion {
    /// Create a loop region, rejecting inverted or empty regions.
    pub fn new(begin: u32, end: u32) -> Result<Self> {
        if begin >= end {
            return Err(Error::InvalidLoopRegion { begin, end });
        }
        Ok(Self { begin, end })
    }

    /// First frame of the loop.
    pub fn begin(&self) -> u32 {
        self.begin
    }

    /// Frame at which the transport wraps back to `begin`.
    pub fn end(&self) -> u32 {
        self.end
    }

    // Both bounds share one word so the real-time thread never sees a
    // begin from one region paired with the end of another.
    fn pack(self) -> u64 {
        ((self.begin as u64) << 32) | self.end as u64
    }

    fn unpack(word: u64) -> Self {
        Self {
            begin: (word >> 32) as u32,
            end: word as u32,
        }
    }
}

/// Lifecycle of the connection to the transport server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionStatus {
    /// Still trying to open a session
    Connecting = 0,
    /// Session open, activated, timebase callback installed
    Connected = 1,
    /// A session opened but could not be activated; not retried
    ActivationFailed = 2,
    /// The server went away after we were connected
    ServerLost = 3,
    /// The bridge was torn down
    Stopped = 4,
}

impl ConnectionStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Connected,
            2 => Self::ActivationFailed,
            3 => Self::ServerLost,
            _ => Self::Stopped,
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::ActivationFailed => "activation failed",
            Self::ServerLost => "server lost",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// State shared between the control thread, the connection task and the
/// real-time timebase callback.
#[derive(Debug, Default)]
pub struct BridgeState {
    connected: AtomicBool,
    status: AtomicU8,
    sample_rate: AtomicU32,
    transport_state: AtomicU8,
    loop_enabled: AtomicBool,
    loop_region: AtomicU64,
}

impl BridgeState {
    /// Fresh state: disconnected, no cached rate, transport assumed stopped,
    /// loop disabled.
    pub fn new() -> Self {
        Self::default()
    }

    // ---- connection ----

    /// True while a session is active.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Current connection lifecycle stage.
    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, status: ConnectionStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Mark the session as live. The session must already be installed
    /// where the control thread looks for it.
    pub(crate) fn mark_connected(&self) {
        self.set_status(ConnectionStatus::Connected);
        self.connected.store(true, Ordering::Release);
    }

    /// Called from the server's shutdown notification.
    pub(crate) fn mark_server_lost(&self) {
        self.connected.store(false, Ordering::Release);
        self.set_status(ConnectionStatus::ServerLost);
    }

    pub(crate) fn mark_stopped(&self) {
        self.connected.store(false, Ordering::Release);
        self.set_status(ConnectionStatus::Stopped);
    }

    // ---- reporter caches ----

    /// Last sample rate seen by the reporter, 0 before the first poll.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Relaxed)
    }

    /// Store a new rate, returning true if it differs from the cached one.
    pub(crate) fn swap_sample_rate(&self, rate: u32) -> bool {
        self.sample_rate.swap(rate, Ordering::Relaxed) != rate
    }

    /// Last transport state seen by the reporter.
    pub fn transport_state(&self) -> TransportState {
        TransportState::from_ordinal(self.transport_state.load(Ordering::Relaxed))
    }

    /// Store a new transport state, returning true if it changed.
    pub(crate) fn swap_transport_state(&self, state: TransportState) -> bool {
        let ordinal = state.ordinal();
        self.transport_state.swap(ordinal, Ordering::Relaxed) != ordinal
    }

    // ---- loop configuration ----

    /// Install a loop region and enable looping.
    pub(crate) fn enable_loop(&self, region: LoopRegion) {
        self.loop_region.store(region.pack(), Ordering::Relaxed);
        self.loop_enabled.store(true, Ordering::Release);
    }

    /// Disable looping; the stored region is kept.
    pub(crate) fn disable_loop(&self) {
        self.loop_enabled.store(false, Ordering::Release);
    }

    /// Whether the loop is currently enforced.
    pub fn loop_enabled(&self) -> bool {
        self.loop_enabled.load(Ordering::Acquire)
    }

    /// Active loop region, `None` while looping is disabled.
    ///
    /// Called every cycle from the real-time thread.
    #[inline]
    pub fn active_loop(&self) -> Option<LoopRegion> {
        if !self.loop_enabled.load(Ordering::Acquire) {
            return None;
        }
        let word = self.loop_region.load(Ordering::Relaxed);
        Some(LoopRegion::unpack(word))
    }

    /// Last region stored, whether or not looping is enabled.
    pub fn stored_loop(&self) -> Option<LoopRegion> {
        let region = LoopRegion::unpack(self.loop_region.load(Ordering::Relaxed));
        (region.begin < region.end).then_some(region)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_rejects_inverted_and_empty() {
        assert!(matches!(
            LoopRegion::new(1000, 500),
            Err(Error::InvalidLoopRegion { begin: 1000, end: 500 })
        ));
        assert!(LoopRegion::new(500, 500).is_err());
        let region = LoopRegion::new(0, 48000).unwrap();
        assert_eq!((region.begin(), region.end()), (0, 48000));
    }

    #[test]
    fn test_region_survives_packing() {
        let region = LoopRegion::new(u32::MAX - 1, u32::MAX).unwrap();
        assert_eq!(LoopRegion::unpack(region.pack()), region);
    }

    #[test]
    fn test_fresh_state() {
        let state = BridgeState::new();
        assert!(!state.is_connected());
        assert_eq!(state.status(), ConnectionStatus::Connecting);
        assert_eq!(state.sample_rate(), 0);
        assert_eq!(state.transport_state(), TransportState::Stopped);
        assert_eq!(state.active_loop(), None);
        assert_eq!(state.stored_loop(), None);
    }

    #[test]
    fn test_disable_keeps_region() {
        let state = BridgeState::new();
        let region = LoopRegion::new(100, 200).unwrap();
        state.enable_loop(region);
        assert_eq!(state.active_loop(), Some(region));

        state.disable_loop();
        assert_eq!(state.active_loop(), None);
        assert_eq!(state.stored_loop(), Some(region));
    }

    #[test]
    fn test_cache_swaps_report_change() {
        let state = BridgeState::new();
        assert!(state.swap_sample_rate(48000));
        assert!(!state.swap_sample_rate(48000));
        assert!(state.swap_sample_rate(44100));

        assert!(!state.swap_transport_state(TransportState::Stopped));
        assert!(state.swap_transport_state(TransportState::Rolling));
        assert_eq!(state.transport_state(), TransportState::Rolling);
    }

    #[test]
    fn test_server_lost_clears_connected() {
        let state = BridgeState::new();
        state.mark_connected();
        assert!(state.is_connected());
        state.mark_server_lost();
        assert!(!state.is_connected());
        assert_eq!(state.status(), ConnectionStatus::ServerLost);
    }
}
