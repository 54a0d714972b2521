//! The transport bridge.
//!
//! A [`Bridge`] is what a host instantiates: construction starts the
//! connection task and returns at once, [`Bridge::poll`] reports the
//! transport, [`Bridge::handle`] executes host commands, and dropping the
//! bridge tears everything down in order:
//!
//! 1. stop and join the connection task,
//! 2. release timebase-master status, so the loop controller is no longer
//!    called from the server's real-time thread,
//! 3. close the session,
//! 4. free the shared state.

use crate::commands::Command;
use crate::config::Config;
use crate::connection::{
    close_session, lock_slot, lock_wraps, ConnectionManager, ConnectionSettings, SessionSlot, WrapSlot,
};
use crate::error::{Error, Result};
use crate::looper::LoopWrap;
use crate::reporter::{Outlets, TransportReporter};
use crate::state::{BridgeState, ConnectionStatus, LoopRegion};
use crate::transport::{clamp_frames, ms_to_frames, ClientSession, Frames, SessionDescriptor, TransportServer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Bridge between a host and the shared transport clock.
pub struct Bridge {
    name: String,
    state: Arc<BridgeState>,
    session: SessionSlot,
    reporter: TransportReporter,
    connection: Option<ConnectionManager>,
    wraps: WrapSlot,
    dropped_wraps: Arc<AtomicU64>,
}

impl Bridge {
    /// Create a bridge using the settings in `config`.
    pub fn new(server: Arc<dyn TransportServer>, config: &Config) -> Result<Self> {
        Self::with_settings(server, config.connection_settings())
    }

    /// Create a bridge with explicit connection settings. The bridge starts
    /// out disconnected.
    pub fn with_settings(server: Arc<dyn TransportServer>, settings: ConnectionSettings) -> Result<Self> {
        let name = settings.client_name.clone();
        let state = Arc::new(BridgeState::new());
        let session: SessionSlot = Arc::new(Mutex::new(None));
        let wraps: WrapSlot = Arc::new(Mutex::new(None));
        let dropped_wraps = Arc::new(AtomicU64::new(0));

        let connection = ConnectionManager::spawn(
            server,
            settings,
            state.clone(),
            session.clone(),
            wraps.clone(),
            dropped_wraps.clone(),
        )?;

        Ok(Self {
            name,
            reporter: TransportReporter::new(state.clone()),
            state,
            session,
            connection: Some(connection),
            wraps,
            dropped_wraps,
        })
    }

    // ---- inspection ----

    /// Shared state, for hosts that want to display it.
    pub fn state(&self) -> &BridgeState {
        &self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.status()
    }

    /// Active loop region, `None` while looping is off.
    pub fn loop_region(&self) -> Option<LoopRegion> {
        self.state.active_loop()
    }

    /// Descriptor of the live session.
    pub fn descriptor(&self) -> Option<SessionDescriptor> {
        if !self.is_connected() {
            return None;
        }
        lock_slot(&self.session).as_ref().map(|s| s.descriptor().clone())
    }

    /// Loop-wrap events lost because the ring was full.
    pub fn dropped_loop_wraps(&self) -> u64 {
        self.dropped_wraps.load(Ordering::Relaxed)
    }

    // ---- host surface ----

    /// Execute a host command. Failures are logged, never returned.
    pub fn handle(&self, command: Command, outlets: &mut dyn Outlets) {
        let result = match command {
            Command::Locate(ms) => self.locate(ms),
            Command::LocateFrame(frame) => self.locate_frame(clamp_frames(frame)),
            Command::Start => self.start(),
            Command::Stop => self.stop(),
            Command::Loop { begin_ms, end_ms } => self.set_loop_region_ms(begin_ms, end_ms),
            Command::LoopFrame { begin, end } => self.set_loop_region(clamp_frames(begin), clamp_frames(end)),
            Command::Unloop => {
                self.unloop();
                Ok(())
            }
            Command::Freewheel(enabled) => self.set_freewheel(enabled),
            Command::Poll => {
                self.poll(outlets);
                Ok(())
            }
        };

        match result {
            Ok(()) => {}
            Err(Error::NotConnected) => log::info!("{}: {}: not connected", self.name, command.name()),
            Err(e) => log::warn!("{}: {}: {}", self.name, command.name(), e),
        }
    }

    /// Report position (always), sample rate and state (on change).
    /// Does nothing while disconnected.
    pub fn poll(&self, outlets: &mut dyn Outlets) {
        if !self.state.is_connected() {
            return;
        }
        let guard = lock_slot(&self.session);
        let Some(session) = guard.as_deref() else {
            return;
        };
        if let Err(e) = self.reporter.poll(session, outlets) {
            log::debug!("{}: transport query failed: {}", self.name, e);
        }
    }

    /// Forward pending loop-wrap events to `outlets`. Returns how many.
    pub fn drain_loop_wraps(&self, outlets: &mut dyn Outlets) -> usize {
        self.pop_loop_wraps(|_| outlets.loop_wrap())
    }

    // ---- transport commands ----

    /// Relocate to a position in milliseconds.
    pub fn locate(&self, ms: f64) -> Result<()> {
        let rate = self.conversion_rate()?;
        self.locate_frame(ms_to_frames(ms, rate))
    }

    /// Relocate to a position in frames.
    pub fn locate_frame(&self, frame: Frames) -> Result<()> {
        self.with_session(|session| session.locate(frame))
    }

    pub fn start(&self) -> Result<()> {
        self.with_session(|session| session.start())
    }

    pub fn stop(&self) -> Result<()> {
        self.with_session(|session| session.stop())
    }

    /// Loop between two frames and jump to the loop start.
    ///
    /// An inverted or empty region is rejected and leaves the current loop
    /// untouched. The region is stored even while disconnected; only the
    /// jump needs the server.
    pub fn set_loop_region(&self, begin: Frames, end: Frames) -> Result<()> {
        let region = LoopRegion::new(begin, end)?;
        self.state.enable_loop(region);
        match self.locate_frame(region.begin()) {
            Err(Error::NotConnected) => {
                log::debug!("{}: loop {}..{} stored, not connected", self.name, begin, end);
                Ok(())
            }
            other => other,
        }
    }

    /// Loop between two positions in milliseconds.
    pub fn set_loop_region_ms(&self, begin_ms: f64, end_ms: f64) -> Result<()> {
        let rate = self.conversion_rate()?;
        self.set_loop_region(ms_to_frames(begin_ms, rate), ms_to_frames(end_ms, rate))
    }

    /// Stop enforcing the loop. The region is kept.
    pub fn unloop(&self) {
        self.state.disable_loop();
    }

    /// Switch freewheel mode. Only allowed when the host's audio runs through
    /// the same server.
    pub fn set_freewheel(&self, enabled: bool) -> Result<()> {
        self.with_session(|session| {
            let descriptor = session.descriptor();
            if !descriptor.supports_freewheel() {
                return Err(Error::FreewheelUnsupported {
                    server: descriptor.server.to_string(),
                });
            }
            session.set_freewheel(enabled)
        })
    }

    /// Tear the bridge down now instead of on drop.
    pub fn close(mut self) {
        self.teardown();
    }

    // ---- internals ----

    fn pop_loop_wraps(&self, mut f: impl FnMut(LoopWrap)) -> usize {
        let mut guard = lock_wraps(&self.wraps);
        let Some(consumer) = guard.as_mut() else {
            return 0;
        };
        let mut count = 0;
        while let Ok(wrap) = consumer.pop() {
            f(wrap);
            count += 1;
        }
        count
    }

    fn with_session<T>(&self, f: impl FnOnce(&dyn ClientSession) -> Result<T>) -> Result<T> {
        if !self.state.is_connected() {
            return Err(Error::NotConnected);
        }
        let guard = lock_slot(&self.session);
        let session = guard.as_deref().ok_or(Error::NotConnected)?;
        f(session)
    }

    /// Rate for millisecond conversions: the reporter's cached rate, or the
    /// session's when nothing has been polled yet.
    fn conversion_rate(&self) -> Result<u32> {
        match self.state.sample_rate() {
            0 => self.with_session(|session| session.sample_rate()),
            rate => Ok(rate),
        }
    }

    fn teardown(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.stop();
        }
        if let Some(session) = lock_slot(&self.session).take() {
            close_session(session);
        }
        lock_wraps(&self.wraps).take();
        self.state.mark_stopped();
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.teardown();
    }
}
