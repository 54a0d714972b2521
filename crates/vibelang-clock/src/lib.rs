//! vibelang-clock - JACK transport bridge for VibeLang
//!
//! Connects a host to the JACK transport so it can follow and drive the
//! shared clock. Features include:
//!
//! - Position, sample rate and transport state reporting
//! - Locate, start and stop
//! - Loop enforcement as timebase master, from JACK's real-time thread
//! - Freewheel control when the host's audio runs through JACK
//! - Background connection with retry, so hosts never block on a missing server
//! - An in-process simulated server for tests and headless use
//!
//! # Usage as a Library
//!
//! ```no_run
//! use std::sync::Arc;
//! use vibelang_clock::{Bridge, BridgeEvent, Config, JackServer};
//!
//! let config = Config::load_or_default();
//! let server = Arc::new(JackServer::new(config.host.audio_via_jack));
//! let bridge = Bridge::new(server, &config).unwrap();
//!
//! // Loop the first two seconds once connected
//! bridge.set_loop_region_ms(0.0, 2000.0).ok();
//!
//! // Poll from the host's control loop
//! let mut events: Vec<BridgeEvent> = Vec::new();
//! bridge.poll(&mut events);
//! bridge.drain_loop_wraps(&mut events);
//! ```

pub mod bridge;
pub mod commands;
pub mod config;
pub mod connection;
pub mod error;
pub mod jack_server;
pub mod looper;
pub mod reporter;
pub mod simulated;
pub mod state;
pub mod transport;

#[cfg(test)]
mod test_util;

// Re-export main types
pub use bridge::Bridge;
pub use commands::Command;
pub use config::Config;
pub use connection::{ConnectionManager, ConnectionSettings};
pub use error::{Error, Result};
pub use jack_server::{is_jack_running, JackServer};
pub use looper::{LoopController, LoopMode, LoopWrap};
pub use reporter::{BridgeEvent, Outlets, TransportReporter};
pub use simulated::{SimulatedClock, SimulatedServer};
pub use state::{BridgeState, ConnectionStatus, LoopRegion};
pub use transport::{
    clamp_frames, frames_to_ms, ms_to_frames, ClientSession, Frames, ServerKind, SessionDescriptor, TimebaseCallback,
    TransportCursor, TransportServer, TransportSnapshot, TransportState,
};
