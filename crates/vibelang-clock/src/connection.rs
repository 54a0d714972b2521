//! Background connection to the transport server.
//!
//! The connection task keeps trying to open a session until it succeeds,
//! waiting a fixed interval between attempts. A successful attempt installs
//! the shutdown handler, registers the [`LoopController`] as timebase
//! callback, activates the session and hands it to the bridge together with
//! the consumer end of that session's loop-wrap ring.
//!
//! The task waits on a stop channel instead of sleeping, so teardown can end
//! it at any backoff point. With `reconnect_on_shutdown` it also stays
//! around after connecting and starts over when the server goes away.

use crate::error::{Error, Result};
use crate::config::DEFAULT_WRAP_QUEUE;
use crate::looper::{LoopController, LoopMode, LoopWrap};
use crate::state::{BridgeState, ConnectionStatus};
use crate::transport::{ClientSession, TransportServer};
use crossbeam_channel::{bounded, select, Receiver, RecvTimeoutError, Sender};
use rtrb::{Consumer, RingBuffer};
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Where the live session is kept. Only the control thread and the
/// connection task lock it; the real-time callback never does.
pub(crate) type SessionSlot = Arc<Mutex<Option<Box<dyn ClientSession>>>>;

pub(crate) fn lock_slot(slot: &SessionSlot) -> MutexGuard<'_, Option<Box<dyn ClientSession>>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Consumer end of the live session's loop-wrap ring. Control side only,
/// like [`SessionSlot`].
pub(crate) type WrapSlot = Arc<Mutex<Option<Consumer<LoopWrap>>>>;

pub(crate) fn lock_wraps(slot: &WrapSlot) -> MutexGuard<'_, Option<Consumer<LoopWrap>>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Release timebase status, then close. The order matters: the server must
/// stop calling into the loop controller before the session goes away.
pub(crate) fn close_session(mut session: Box<dyn ClientSession>) {
    let name = session.descriptor().client_name.clone();
    if let Err(e) = session.release_timebase() {
        log::debug!("{}: release timebase: {}", name, e);
    }
    if let Err(e) = session.close() {
        log::warn!("{}: failed to close session: {}", name, e);
    }
}

/// Settings for the connection task.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Client name requested from the server
    pub client_name: String,
    /// Wait between connection attempts
    pub retry_interval: Duration,
    /// Start over when the server shuts down
    pub reconnect_on_shutdown: bool,
    /// Loop crossing detection for the installed controller
    pub loop_mode: LoopMode,
    /// Capacity of each session's loop-wrap ring
    pub wrap_queue: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            client_name: "vibe-clock".to_string(),
            retry_interval: Duration::from_secs(1),
            reconnect_on_shutdown: true,
            loop_mode: LoopMode::default(),
            wrap_queue: DEFAULT_WRAP_QUEUE,
        }
    }
}

/// Handle to the background connection task.
pub struct ConnectionManager {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    /// Start the connection task. Returns immediately.
    pub(crate) fn spawn(
        server: Arc<dyn TransportServer>,
        settings: ConnectionSettings,
        state: Arc<BridgeState>,
        slot: SessionSlot,
        wraps: WrapSlot,
        dropped_wraps: Arc<AtomicU64>,
    ) -> Result<Self> {
        let (stop_tx, stop_rx) = bounded(0);
        let connector = Connector {
            server,
            settings,
            state,
            slot,
            wraps,
            dropped_wraps,
            stop_rx,
        };

        let handle = thread::Builder::new()
            .name("vibe-clock-connect".to_string())
            .spawn(move || connector.run())?;

        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Whether the task has finished (connected without reconnect, gave up,
    /// or was stopped).
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Signal the task to stop and wait for it.
    pub fn stop(&mut self) {
        // Dropping the sender wakes the task from any backoff wait.
        self.stop_tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("connection task panicked");
            }
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Connector {
    server: Arc<dyn TransportServer>,
    settings: ConnectionSettings,
    state: Arc<BridgeState>,
    slot: SessionSlot,
    wraps: WrapSlot,
    dropped_wraps: Arc<AtomicU64>,
    stop_rx: Receiver<()>,
}

struct Connected {
    session: Box<dyn ClientSession>,
    wraps: Consumer<LoopWrap>,
    lost_rx: Receiver<()>,
}

impl Connector {
    fn run(self) {
        let name = self.settings.client_name.clone();
        loop {
            self.state.set_status(ConnectionStatus::Connecting);

            let Some(Connected { session, wraps, lost_rx }) = self.connect_with_retry() else {
                return;
            };

            let descriptor = session.descriptor().clone();
            // Wraps still queued from a previous session are dropped with it.
            *lock_wraps(&self.wraps) = Some(wraps);
            *lock_slot(&self.slot) = Some(session);
            self.state.mark_connected();
            log::info!("{}: connected to {} as '{}'", name, descriptor.server, descriptor.client_name);

            if !self.settings.reconnect_on_shutdown {
                // Shutdown may have raced with activation.
                if lost_rx.try_recv().is_ok() {
                    self.state.mark_server_lost();
                }
                return;
            }

            select! {
                recv(self.stop_rx) -> _ => return,
                recv(lost_rx) -> _ => {}
            }

            self.state.mark_server_lost();
            log::warn!("{}: transport server shut down, reconnecting", name);
            if let Some(session) = lock_slot(&self.slot).take() {
                close_session(session);
            }
            if self.should_stop() {
                return;
            }
        }
    }

    /// Retry until a session is up. `None` when stopped or when the failure
    /// is not worth retrying.
    fn connect_with_retry(&self) -> Option<Connected> {
        let name = &self.settings.client_name;
        let mut attempt = 0u64;
        loop {
            attempt += 1;
            match self.try_connect() {
                Ok(connected) => {
                    if attempt > 1 {
                        log::debug!("{}: connected after {} attempts", name, attempt);
                    }
                    return Some(connected);
                }
                Err(e) if e.is_retryable() => {
                    log::info!("{}: transport server not running? retry... ({})", name, e);
                }
                Err(e) => {
                    log::error!("{}: {}", name, e);
                    self.state.set_status(ConnectionStatus::ActivationFailed);
                    return None;
                }
            }

            if self.should_stop() {
                return None;
            }
        }
    }

    fn try_connect(&self) -> Result<Connected> {
        let mut session = self.server.open(&self.settings.client_name)?;

        let (lost_tx, lost_rx) = bounded(1);
        let state = self.state.clone();
        session.on_shutdown(Box::new(move || {
            state.mark_server_lost();
            let _ = lost_tx.try_send(());
        }));

        let (producer, consumer) = RingBuffer::new(self.settings.wrap_queue.max(1));
        let looper = LoopController::new(self.state.clone(), self.settings.loop_mode, producer)
            .with_drop_counter(self.dropped_wraps.clone());
        if let Err(e) = session.set_timebase_callback(Box::new(looper)) {
            log::warn!("{}: could not become timebase master, looping disabled: {}", self.settings.client_name, e);
        }

        if let Err(e) = session.activate() {
            close_session(session);
            return Err(match e {
                Error::Activation(_) => e,
                other => Error::Activation(other.to_string()),
            });
        }

        Ok(Connected {
            session,
            wraps: consumer,
            lost_rx,
        })
    }

    /// Wait one retry interval; true if the bridge asked us to stop.
    fn should_stop(&self) -> bool {
        !matches!(
            self.stop_rx.recv_timeout(self.settings.retry_interval),
            Err(RecvTimeoutError::Timeout)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::SimulatedServer;
    use crate::test_util::wait_for;
    use std::time::Instant;

    fn settings(reconnect: bool) -> ConnectionSettings {
        ConnectionSettings {
            client_name: "connection-test".to_string(),
            retry_interval: Duration::from_millis(10),
            reconnect_on_shutdown: reconnect,
            loop_mode: LoopMode::Alternating,
            wrap_queue: 8,
        }
    }

    struct Spawned {
        manager: ConnectionManager,
        state: Arc<BridgeState>,
        slot: SessionSlot,
        wraps: WrapSlot,
    }

    fn spawn(server: &SimulatedServer, reconnect: bool) -> Spawned {
        let state = Arc::new(BridgeState::new());
        let slot: SessionSlot = Arc::new(Mutex::new(None));
        let wraps: WrapSlot = Arc::new(Mutex::new(None));
        let manager = ConnectionManager::spawn(
            Arc::new(server.clone()),
            settings(reconnect),
            state.clone(),
            slot.clone(),
            wraps.clone(),
            Arc::new(AtomicU64::new(0)),
        )
        .unwrap();
        Spawned {
            manager,
            state,
            slot,
            wraps,
        }
    }

    #[test]
    fn test_retries_until_server_appears() {
        let server = SimulatedServer::offline(48000);
        let Spawned {
            mut manager,
            state,
            slot,
            wraps,
        } = spawn(&server, false);

        wait_for("two failed attempts", || server.open_attempts() >= 2);
        assert!(!state.is_connected());
        assert_eq!(state.status(), ConnectionStatus::Connecting);

        server.set_running(true);
        wait_for("connection", || state.is_connected());
        assert!(server.open_attempts() >= 3);
        assert!(lock_slot(&slot).is_some());
        assert!(lock_wraps(&wraps).is_some());
        assert!(server.has_timebase_master());

        wait_for("task exit", || manager.is_finished());
        manager.stop();
    }

    #[test]
    fn test_activation_failure_is_not_retried() {
        let server = SimulatedServer::new(48000);
        server.fail_activation(true);
        let Spawned {
            manager, state, slot, ..
        } = spawn(&server, true);

        wait_for("task exit", || manager.is_finished());
        assert_eq!(state.status(), ConnectionStatus::ActivationFailed);
        assert!(!state.is_connected());
        assert!(lock_slot(&slot).is_none());
        assert_eq!(server.open_attempts(), 1);
        assert_eq!(server.client_count(), 0);
        assert_eq!(server.closed_while_master(), 0);
    }

    #[test]
    fn test_stop_interrupts_backoff() {
        let server = SimulatedServer::offline(48000);
        let state = Arc::new(BridgeState::new());
        let mut slow = settings(false);
        slow.retry_interval = Duration::from_secs(60);
        let mut manager = ConnectionManager::spawn(
            Arc::new(server.clone()),
            slow,
            state,
            Arc::new(Mutex::new(None)),
            Arc::new(Mutex::new(None)),
            Arc::new(AtomicU64::new(0)),
        )
        .unwrap();

        wait_for("first attempt", || server.open_attempts() >= 1);
        let started = Instant::now();
        manager.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_shutdown_without_reconnect_stays_offline() {
        let server = SimulatedServer::new(48000);
        let Spawned { manager, state, .. } = spawn(&server, false);
        wait_for("connection", || state.is_connected());
        wait_for("task exit", || manager.is_finished());

        server.shutdown();
        assert!(!state.is_connected());
        assert_eq!(state.status(), ConnectionStatus::ServerLost);

        server.set_running(true);
        thread::sleep(Duration::from_millis(50));
        assert!(!state.is_connected());
        assert_eq!(server.open_attempts(), 1);
    }

    #[test]
    fn test_reconnects_after_shutdown() {
        let server = SimulatedServer::new(48000);
        let Spawned {
            mut manager, state, ..
        } = spawn(&server, true);
        wait_for("connection", || state.is_connected());

        server.shutdown();
        wait_for("server lost", || !state.is_connected());
        server.set_running(true);
        wait_for("reconnection", || state.is_connected());

        assert_eq!(server.client_count(), 1);
        assert!(server.has_timebase_master());
        manager.stop();
    }

    #[test]
    fn test_reconnected_session_delivers_wraps() {
        let server = SimulatedServer::new(48000);
        let Spawned {
            mut manager,
            state,
            wraps,
            ..
        } = spawn(&server, true);
        wait_for("connection", || state.is_connected());

        server.shutdown();
        wait_for("server lost", || !state.is_connected());
        server.set_running(true);
        wait_for("reconnection", || state.is_connected());

        state.enable_loop(crate::state::LoopRegion::new(0, 100).unwrap());
        server.set_frame(150);
        server.run_cycle(64);

        let wrap = lock_wraps(&wraps).as_mut().map(|consumer| consumer.pop());
        assert!(matches!(wrap, Some(Ok(LoopWrap { at: 150, to: 0 }))));
        manager.stop();
    }
}
