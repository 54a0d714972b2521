//! JACK transport back end.
//!
//! Locate, start and stop use the safe [`jack::Transport`] API. Queries,
//! timebase registration and freewheel go through `jack-sys` directly, as
//! does the real-time side of the timebase callback. The safe query folds
//! every state it does not know into `Rolling`, which would hide
//! `JackTransportNetStarting`.

use crate::error::{Error, Result};
use crate::transport::{
    ClientSession, Frames, ServerKind, SessionDescriptor, ShutdownHandler, TimebaseCallback, TransportCursor,
    TransportServer, TransportSnapshot, TransportState,
};
use jack_sys as j;
use std::mem::MaybeUninit;
use std::os::raw::{c_int, c_void};

/// Opens sessions on the running JACK server. Never starts a server.
pub struct JackServer {
    drives_host_audio: bool,
}

impl JackServer {
    /// `drives_host_audio` tells sessions whether the host's own audio runs
    /// through JACK, which is what makes freewheeling meaningful.
    pub fn new(drives_host_audio: bool) -> Self {
        Self { drives_host_audio }
    }
}

impl TransportServer for JackServer {
    fn open(&self, client_name: &str) -> Result<Box<dyn ClientSession>> {
        let (client, status) = jack::Client::new(client_name, jack::ClientOptions::NO_START_SERVER)
            .map_err(|e| Error::ServerUnavailable(e.to_string()))?;
        log::debug!("JACK client '{}' opened ({:?})", client.name(), status);

        let descriptor = SessionDescriptor {
            server: ServerKind::Jack,
            client_name: client.name().to_string(),
            drives_host_audio: self.drives_host_audio,
        };

        Ok(Box::new(JackSession {
            descriptor,
            stage: Stage::Inactive(client),
            shutdown: None,
            timebase: None,
            master: false,
        }))
    }
}

/// JACK notification handler.
struct JackNotifications {
    on_shutdown: Option<std::sync::Mutex<ShutdownHandler>>,
}

impl jack::NotificationHandler for JackNotifications {
    unsafe fn shutdown(&mut self, status: jack::ClientStatus, reason: &str) {
        log::warn!("JACK client shutdown: {:?} - {}", status, reason);
        if let Some(handler) = self.on_shutdown.as_mut() {
            let handler = handler.get_mut().unwrap_or_else(|e| e.into_inner());
            handler();
        }
    }
}

enum Stage {
    Inactive(jack::Client),
    Active(jack::AsyncClient<JackNotifications, ()>),
    Closed,
}

/// Heap-pinned state handed to JACK as the timebase callback argument.
struct TimebaseContext {
    client: *mut j::jack_client_t,
    callback: Box<dyn TimebaseCallback>,
}

// SAFETY: the raw client pointer is only dereferenced by JACK calls made from
// JACK's process thread while the client is open; the session closes the
// client before dropping the context.
unsafe impl Send for TimebaseContext {}

/// Real-time transport view backed by the raw client.
struct RawCursor(*mut j::jack_client_t);

impl TransportCursor for RawCursor {
    fn frame(&self) -> Frames {
        unsafe { j::jack_get_current_transport_frame(self.0) }
    }

    fn locate(&self, frame: Frames) {
        unsafe {
            j::jack_transport_locate(self.0, frame);
        }
    }
}

unsafe extern "C" fn timebase_trampoline(
    _state: j::jack_transport_state_t,
    _nframes: j::jack_nframes_t,
    _pos: *mut j::jack_position_t,
    _new_pos: c_int,
    arg: *mut c_void,
) {
    let context = &mut *(arg as *mut TimebaseContext);
    let cursor = RawCursor(context.client);
    context.callback.on_cycle(&cursor);
}

fn map_raw_state(state: j::jack_transport_state_t) -> TransportState {
    match state {
        j::JackTransportStopped => TransportState::Stopped,
        j::JackTransportRolling => TransportState::Rolling,
        j::JackTransportStarting => TransportState::Starting,
        _ => TransportState::Other,
    }
}

/// A JACK client session.
pub struct JackSession {
    descriptor: SessionDescriptor,
    // Declared before `timebase`: the client must close before the context
    // it points JACK at is freed.
    stage: Stage,
    shutdown: Option<ShutdownHandler>,
    timebase: Option<Box<TimebaseContext>>,
    master: bool,
}

impl JackSession {
    fn client(&self) -> Result<&jack::Client> {
        match &self.stage {
            Stage::Inactive(client) => Ok(client),
            Stage::Active(active) => Ok(active.as_client()),
            Stage::Closed => Err(Error::NotConnected),
        }
    }

    fn release(&mut self) -> Result<()> {
        if !self.master {
            return Ok(());
        }
        self.master = false;
        let raw = self.client()?.raw();
        let rc = unsafe { j::jack_release_timebase(raw) };
        if rc != 0 {
            return Err(Error::Transport(format!("jack_release_timebase returned {}", rc)));
        }
        Ok(())
    }

    fn teardown(&mut self) -> Result<()> {
        let released = self.release();
        let closed = match std::mem::replace(&mut self.stage, Stage::Closed) {
            Stage::Active(active) => active.deactivate().map(|_| ()).map_err(Error::from),
            Stage::Inactive(client) => {
                drop(client);
                Ok(())
            }
            Stage::Closed => Ok(()),
        };
        // Client is closed, JACK holds no more references to the context.
        self.timebase = None;
        released.and(closed)
    }
}

impl ClientSession for JackSession {
    fn descriptor(&self) -> &SessionDescriptor {
        &self.descriptor
    }

    fn on_shutdown(&mut self, handler: ShutdownHandler) {
        self.shutdown = Some(handler);
    }

    fn set_timebase_callback(&mut self, callback: Box<dyn TimebaseCallback>) -> Result<()> {
        if self.timebase.is_some() {
            return Err(Error::Transport("timebase callback already installed".to_string()));
        }
        let raw = self.client()?.raw();
        let mut context = Box::new(TimebaseContext { client: raw, callback });
        let arg = &mut *context as *mut TimebaseContext as *mut c_void;

        // Unconditional: take over from any current master.
        let rc = unsafe { j::jack_set_timebase_callback(raw, 0, Some(timebase_trampoline), arg) };
        if rc != 0 {
            return Err(Error::Transport(format!("jack_set_timebase_callback returned {}", rc)));
        }
        self.timebase = Some(context);
        self.master = true;
        Ok(())
    }

    fn activate(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.stage, Stage::Closed) {
            Stage::Inactive(client) => {
                let notifications = JackNotifications {
                    on_shutdown: self.shutdown.take().map(std::sync::Mutex::new),
                };
                let active = client
                    .activate_async(notifications, ())
                    .map_err(|e| Error::Activation(e.to_string()))?;
                self.stage = Stage::Active(active);
                Ok(())
            }
            other => {
                self.stage = other;
                Err(Error::Activation("client is not in the inactive state".to_string()))
            }
        }
    }

    fn query(&self) -> Result<TransportSnapshot> {
        let client = self.client()?;
        let mut pos = MaybeUninit::<j::jack_position_t>::zeroed();
        // SAFETY: the client is open and `pos` is a valid out-pointer; JACK
        // fills it before returning.
        let (state, pos) = unsafe {
            let state = j::jack_transport_query(client.raw(), pos.as_mut_ptr());
            (state, pos.assume_init())
        };
        Ok(TransportSnapshot {
            frame: pos.frame,
            state: map_raw_state(state),
            sample_rate: client.sample_rate() as u32,
        })
    }

    fn sample_rate(&self) -> Result<u32> {
        Ok(self.client()?.sample_rate() as u32)
    }

    fn locate(&self, frame: Frames) -> Result<()> {
        self.client()?.transport().locate(frame)?;
        Ok(())
    }

    fn start(&self) -> Result<()> {
        self.client()?.transport().start()?;
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.client()?.transport().stop()?;
        Ok(())
    }

    fn set_freewheel(&self, enabled: bool) -> Result<()> {
        let raw = self.client()?.raw();
        let rc = unsafe { j::jack_set_freewheel(raw, enabled as c_int) };
        if rc != 0 {
            return Err(Error::Transport(format!("jack_set_freewheel returned {}", rc)));
        }
        Ok(())
    }

    fn release_timebase(&mut self) -> Result<()> {
        self.release()
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        self.teardown()
    }
}

impl Drop for JackSession {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            log::debug!("JACK session teardown: {}", e);
        }
    }
}

/// Check if JACK is running.
pub fn is_jack_running() -> bool {
    jack::Client::new("vibe-clock-check", jack::ClientOptions::NO_START_SERVER).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_mapping() {
        assert_eq!(map_raw_state(j::JackTransportStopped), TransportState::Stopped);
        assert_eq!(map_raw_state(j::JackTransportRolling), TransportState::Rolling);
        assert_eq!(map_raw_state(j::JackTransportStarting), TransportState::Starting);
    }

    #[test]
    fn test_unknown_states_report_other() {
        assert_eq!(map_raw_state(j::JackTransportNetStarting), TransportState::Other);
        assert_eq!(map_raw_state(j::JackTransportLooping), TransportState::Other);
        assert_eq!(map_raw_state(99), TransportState::Other);
        assert_eq!(map_raw_state(j::JackTransportNetStarting).ordinal(), 3);
    }

    #[test]
    fn test_open_without_server_is_retryable() {
        // Only meaningful on machines without a JACK server.
        if is_jack_running() {
            return;
        }
        let server = JackServer::new(true);
        match server.open("vibe-clock-test") {
            Err(e) => assert!(e.is_retryable()),
            Ok(_) => panic!("opened a session without a JACK server"),
        }
    }
}
