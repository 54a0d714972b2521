//! In-process transport server.
//!
//! [`SimulatedServer`] behaves like a tiny JACK transport: it has a position,
//! a state and a sample rate, accepts one timebase master, and runs the
//! master's callback whenever [`SimulatedServer::run_cycle`] is called. It
//! can be switched off to look like a server that is not running, made to
//! refuse activation, or shut down underneath its clients.
//!
//! As in JACK, a relocation request takes effect two process cycles after it
//! was made: a request made during cycle N is visible from cycle N+2.
//!
//! `vibe-clock --simulate` drives it from a clock thread; the test suites
//! drive it cycle by cycle.

use crate::error::{Error, Result};
use crate::transport::{
    ClientSession, Frames, ServerKind, SessionDescriptor, ShutdownHandler, TimebaseCallback, TransportCursor,
    TransportServer, TransportSnapshot, TransportState,
};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const NO_RELOCATE: u64 = u64::MAX;

struct SimClient {
    id: u64,
    active: bool,
    shutdown: Option<ShutdownHandler>,
}

struct Master {
    client: u64,
    callback: Box<dyn TimebaseCallback>,
}

#[derive(Default)]
struct Registry {
    clients: Vec<SimClient>,
    master: Option<Master>,
}

impl Registry {
    fn client_mut(&mut self, id: u64) -> Option<&mut SimClient> {
        self.clients.iter_mut().find(|c| c.id == id)
    }

    fn is_active(&self, id: u64) -> bool {
        self.clients.iter().any(|c| c.id == id && c.active)
    }
}

struct Inner {
    running: AtomicBool,
    fail_activation: AtomicBool,
    drives_host_audio: AtomicBool,
    frame: AtomicU32,
    requested: AtomicU64,
    scheduled: AtomicU64,
    state: AtomicU8,
    sample_rate: AtomicU32,
    freewheel: AtomicBool,
    next_id: AtomicU64,
    open_attempts: AtomicUsize,
    relocations: AtomicUsize,
    callbacks: AtomicUsize,
    closed_while_master: AtomicUsize,
    registry: Mutex<Registry>,
}

impl Inner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        // A panicking test callback must not wedge every other test step.
        self.registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_running(&self) -> Result<()> {
        if self.running.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::Transport("simulated server is not running".to_string()))
        }
    }

    fn relocate(&self, frame: Frames) {
        self.requested.store(frame as u64, Ordering::Release);
        self.relocations.fetch_add(1, Ordering::Relaxed);
    }

    /// Apply the relocation scheduled last cycle and schedule the newest
    /// request for the next one.
    fn advance_relocations(&self) {
        let due = self.scheduled.swap(NO_RELOCATE, Ordering::AcqRel);
        if due != NO_RELOCATE {
            self.frame.store(due as Frames, Ordering::Release);
        }
        let requested = self.requested.swap(NO_RELOCATE, Ordering::AcqRel);
        self.scheduled.store(requested, Ordering::Release);
    }
}

/// Cursor handed to the timebase callback; touches atomics only.
struct SimCursor<'a>(&'a Inner);

impl TransportCursor for SimCursor<'_> {
    fn frame(&self) -> Frames {
        self.0.frame.load(Ordering::Acquire)
    }

    fn locate(&self, frame: Frames) {
        self.0.relocate(frame);
    }
}

/// Handle to a simulated transport server. Clones share the same server.
#[derive(Clone)]
pub struct SimulatedServer {
    inner: Arc<Inner>,
}

impl SimulatedServer {
    /// A running server at `sample_rate`, transport stopped at frame 0.
    pub fn new(sample_rate: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                running: AtomicBool::new(true),
                fail_activation: AtomicBool::new(false),
                drives_host_audio: AtomicBool::new(true),
                frame: AtomicU32::new(0),
                requested: AtomicU64::new(NO_RELOCATE),
                scheduled: AtomicU64::new(NO_RELOCATE),
                state: AtomicU8::new(TransportState::Stopped.ordinal()),
                sample_rate: AtomicU32::new(sample_rate),
                freewheel: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                open_attempts: AtomicUsize::new(0),
                relocations: AtomicUsize::new(0),
                callbacks: AtomicUsize::new(0),
                closed_while_master: AtomicUsize::new(0),
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    /// A server that refuses connections until [`set_running`](Self::set_running).
    pub fn offline(sample_rate: u32) -> Self {
        let server = Self::new(sample_rate);
        server.set_running(false);
        server
    }

    /// Whether sessions report that the host's audio runs through this server.
    pub fn with_host_audio(self, drives_host_audio: bool) -> Self {
        self.inner.drives_host_audio.store(drives_host_audio, Ordering::Relaxed);
        self
    }

    pub fn set_running(&self, running: bool) {
        self.inner.running.store(running, Ordering::Release);
    }

    /// Make every following activation fail.
    pub fn fail_activation(&self, fail: bool) {
        self.inner.fail_activation.store(fail, Ordering::Relaxed);
    }

    pub fn frame(&self) -> Frames {
        self.inner.frame.load(Ordering::Acquire)
    }

    /// Move the transport immediately, bypassing the relocation delay and
    /// the relocation counter.
    pub fn set_frame(&self, frame: Frames) {
        self.inner.frame.store(frame, Ordering::Release);
    }

    pub fn state(&self) -> TransportState {
        TransportState::from_ordinal(self.inner.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: TransportState) {
        self.inner.state.store(state.ordinal(), Ordering::Release);
    }

    pub fn sample_rate(&self) -> u32 {
        self.inner.sample_rate.load(Ordering::Relaxed)
    }

    pub fn set_sample_rate(&self, rate: u32) {
        self.inner.sample_rate.store(rate, Ordering::Relaxed);
    }

    pub fn is_freewheeling(&self) -> bool {
        self.inner.freewheel.load(Ordering::Relaxed)
    }

    /// Number of `open` calls, successful or not.
    pub fn open_attempts(&self) -> usize {
        self.inner.open_attempts.load(Ordering::Relaxed)
    }

    /// Number of relocations requested by clients.
    pub fn relocations(&self) -> usize {
        self.inner.relocations.load(Ordering::Relaxed)
    }

    /// Number of timebase callback invocations.
    pub fn callback_invocations(&self) -> usize {
        self.inner.callbacks.load(Ordering::Relaxed)
    }

    /// Sessions closed without releasing timebase-master status first.
    pub fn closed_while_master(&self) -> usize {
        self.inner.closed_while_master.load(Ordering::Relaxed)
    }

    pub fn has_timebase_master(&self) -> bool {
        self.inner.registry().master.is_some()
    }

    /// Clients currently registered (open, not yet closed).
    pub fn client_count(&self) -> usize {
        self.inner.registry().clients.len()
    }

    /// Run one process cycle of `nframes`.
    ///
    /// Due relocations are applied, the callback of an active timebase
    /// master runs, then a rolling transport advances. A starting transport
    /// begins rolling. Returns whether the callback ran.
    pub fn run_cycle(&self, nframes: Frames) -> bool {
        let inner = &*self.inner;
        if !inner.running.load(Ordering::Acquire) {
            return false;
        }
        inner.advance_relocations();

        let ran = {
            let mut registry = inner.registry();
            let master_active = registry.master.as_ref().is_some_and(|m| registry.is_active(m.client));
            match registry.master.as_mut() {
                Some(master) if master_active => {
                    master.callback.on_cycle(&SimCursor(inner));
                    inner.callbacks.fetch_add(1, Ordering::Relaxed);
                    true
                }
                _ => false,
            }
        };

        match self.state() {
            TransportState::Starting => self.set_state(TransportState::Rolling),
            TransportState::Rolling => {
                let frame = self.frame().saturating_add(nframes);
                self.set_frame(frame);
            }
            _ => {}
        }

        ran
    }

    /// Emulate the server going away: clients are notified through their
    /// shutdown handlers and the timebase master is dropped.
    pub fn shutdown(&self) {
        self.set_running(false);
        let handlers: Vec<ShutdownHandler> = {
            let mut registry = self.inner.registry();
            registry.master = None;
            registry
                .clients
                .iter_mut()
                .filter_map(|c| {
                    c.active = false;
                    c.shutdown.take()
                })
                .collect()
        };
        for mut handler in handlers {
            handler();
        }
    }

    /// Run cycles of `nframes` from a background thread at the pace a real
    /// server would.
    pub fn spawn_clock(&self, nframes: Frames) -> SimulatedClock {
        let server = self.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let handle = thread::Builder::new()
            .name("vibe-clock-sim".to_string())
            .spawn(move || {
                while !thread_stop.load(Ordering::Relaxed) {
                    server.run_cycle(nframes);
                    let rate = server.sample_rate().max(1);
                    thread::sleep(Duration::from_secs_f64(nframes as f64 / rate as f64));
                }
            })
            .ok();
        SimulatedClock { stop, handle }
    }
}

impl TransportServer for SimulatedServer {
    fn open(&self, client_name: &str) -> Result<Box<dyn ClientSession>> {
        self.inner.open_attempts.fetch_add(1, Ordering::Relaxed);
        if !self.inner.running.load(Ordering::Acquire) {
            return Err(Error::ServerUnavailable("simulated server is not running".to_string()));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.registry().clients.push(SimClient {
            id,
            active: false,
            shutdown: None,
        });

        Ok(Box::new(SimulatedSession {
            id,
            inner: self.inner.clone(),
            descriptor: SessionDescriptor {
                server: ServerKind::Simulated,
                client_name: client_name.to_string(),
                drives_host_audio: self.inner.drives_host_audio.load(Ordering::Relaxed),
            },
        }))
    }
}

/// Background thread running simulated process cycles. Stops on drop.
pub struct SimulatedClock {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for SimulatedClock {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// A client session on a [`SimulatedServer`].
pub struct SimulatedSession {
    id: u64,
    inner: Arc<Inner>,
    descriptor: SessionDescriptor,
}

impl ClientSession for SimulatedSession {
    fn descriptor(&self) -> &SessionDescriptor {
        &self.descriptor
    }

    fn on_shutdown(&mut self, handler: ShutdownHandler) {
        if let Some(client) = self.inner.registry().client_mut(self.id) {
            client.shutdown = Some(handler);
        }
    }

    fn set_timebase_callback(&mut self, callback: Box<dyn TimebaseCallback>) -> Result<()> {
        self.inner.ensure_running()?;
        self.inner.registry().master = Some(Master {
            client: self.id,
            callback,
        });
        Ok(())
    }

    fn activate(&mut self) -> Result<()> {
        if self.inner.fail_activation.load(Ordering::Relaxed) {
            return Err(Error::Activation("simulated activation failure".to_string()));
        }
        self.inner.ensure_running()?;
        match self.inner.registry().client_mut(self.id) {
            Some(client) => {
                client.active = true;
                Ok(())
            }
            None => Err(Error::Activation("client was removed".to_string())),
        }
    }

    fn query(&self) -> Result<TransportSnapshot> {
        self.inner.ensure_running()?;
        Ok(TransportSnapshot {
            frame: self.inner.frame.load(Ordering::Acquire),
            state: TransportState::from_ordinal(self.inner.state.load(Ordering::Acquire)),
            sample_rate: self.inner.sample_rate.load(Ordering::Relaxed),
        })
    }

    fn sample_rate(&self) -> Result<u32> {
        self.inner.ensure_running()?;
        Ok(self.inner.sample_rate.load(Ordering::Relaxed))
    }

    fn locate(&self, frame: Frames) -> Result<()> {
        self.inner.ensure_running()?;
        self.inner.relocate(frame);
        Ok(())
    }

    fn start(&self) -> Result<()> {
        self.inner.ensure_running()?;
        if TransportState::from_ordinal(self.inner.state.load(Ordering::Acquire)) != TransportState::Rolling {
            self.inner.state.store(TransportState::Starting.ordinal(), Ordering::Release);
        }
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.inner.ensure_running()?;
        self.inner.state.store(TransportState::Stopped.ordinal(), Ordering::Release);
        Ok(())
    }

    fn set_freewheel(&self, enabled: bool) -> Result<()> {
        self.inner.ensure_running()?;
        self.inner.freewheel.store(enabled, Ordering::Relaxed);
        Ok(())
    }

    fn release_timebase(&mut self) -> Result<()> {
        let mut registry = self.inner.registry();
        if registry.master.as_ref().is_some_and(|m| m.client == self.id) {
            registry.master = None;
        }
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<()> {
        drop(self);
        Ok(())
    }
}

impl Drop for SimulatedSession {
    fn drop(&mut self) {
        let mut registry = self.inner.registry();
        registry.clients.retain(|c| c.id != self.id);
        if registry.master.as_ref().is_some_and(|m| m.client == self.id) {
            self.inner.closed_while_master.fetch_add(1, Ordering::Relaxed);
            registry.master = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counting(Arc<AtomicUsize>);

    impl TimebaseCallback for Counting {
        fn on_cycle(&mut self, _transport: &dyn TransportCursor) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_offline_server_refuses_open() {
        let server = SimulatedServer::offline(48000);
        assert!(matches!(server.open("x"), Err(Error::ServerUnavailable(_))));
        assert_eq!(server.open_attempts(), 1);

        server.set_running(true);
        assert!(server.open("x").is_ok());
        assert_eq!(server.open_attempts(), 2);
    }

    #[test]
    fn test_callback_runs_only_for_master() {
        let server = SimulatedServer::new(48000);
        let count = Arc::new(AtomicUsize::new(0));
        let mut session = server.open("x").unwrap();
        assert!(!server.run_cycle(64));

        session.set_timebase_callback(Box::new(Counting(count.clone()))).unwrap();
        assert!(!server.run_cycle(64), "inactive clients get no callbacks");
        session.activate().unwrap();
        assert!(server.run_cycle(64));
        assert!(server.run_cycle(64));

        session.release_timebase().unwrap();
        assert!(!server.run_cycle(64));
        assert_eq!(count.load(Ordering::Relaxed), 2);

        session.close().unwrap();
        assert_eq!(server.closed_while_master(), 0);
    }

    #[test]
    fn test_closing_master_is_recorded() {
        let server = SimulatedServer::new(48000);
        let mut session = server.open("x").unwrap();
        session
            .set_timebase_callback(Box::new(Counting(Arc::new(AtomicUsize::new(0)))))
            .unwrap();
        session.close().unwrap();
        assert_eq!(server.closed_while_master(), 1);
        assert!(!server.has_timebase_master());
    }

    #[test]
    fn test_rolling_transport_advances() {
        let server = SimulatedServer::new(48000);
        let session = server.open("x").unwrap();
        session.start().unwrap();
        assert_eq!(server.state(), TransportState::Starting);

        server.run_cycle(256);
        assert_eq!(server.state(), TransportState::Rolling);
        assert_eq!(server.frame(), 0);

        server.run_cycle(256);
        assert_eq!(server.frame(), 256);

        session.stop().unwrap();
        server.run_cycle(256);
        assert_eq!(server.frame(), 256);
    }

    #[test]
    fn test_relocation_lands_two_cycles_later() {
        let server = SimulatedServer::new(48000);
        let session = server.open("x").unwrap();
        server.set_frame(500);
        session.locate(100).unwrap();
        assert_eq!(server.relocations(), 1);

        server.run_cycle(64);
        assert_eq!(server.frame(), 500);
        server.run_cycle(64);
        assert_eq!(server.frame(), 100);
    }

    #[test]
    fn test_shutdown_notifies_clients() {
        let server = SimulatedServer::new(48000);
        let notified = Arc::new(AtomicBool::new(false));
        let mut session = server.open("x").unwrap();
        let flag = notified.clone();
        session.on_shutdown(Box::new(move || flag.store(true, Ordering::SeqCst)));
        session.activate().unwrap();

        server.shutdown();
        assert!(notified.load(Ordering::SeqCst));
        assert!(session.query().is_err());
        assert!(!server.has_timebase_master());
    }

    #[test]
    fn test_close_unregisters_client() {
        let server = SimulatedServer::new(48000);
        let session = server.open("x").unwrap();
        assert_eq!(server.client_count(), 1);
        session.close().unwrap();
        assert_eq!(server.client_count(), 0);
    }
}
