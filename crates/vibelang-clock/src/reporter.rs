//! Change-only transport reporting for the control thread.

use crate::error::Result;
use crate::state::BridgeState;
use crate::transport::{ClientSession, TransportState};
use std::sync::Arc;

/// Output channels of the bridge.
///
/// The host adapter implements this to deliver values to wherever its
/// outputs go (outlets, a UI, stdout).
pub trait Outlets {
    /// Transport position in milliseconds, sent on every poll while connected.
    fn position_ms(&mut self, ms: f64);

    /// Sample rate, sent when it changes.
    fn sample_rate(&mut self, rate: u32);

    /// Transport state ordinal (0-3), sent when it changes.
    fn transport_state(&mut self, ordinal: u8);

    /// The transport wrapped from the loop end back to the loop start.
    fn loop_wrap(&mut self);
}

/// A single output value, for hosts that prefer a queue over callbacks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BridgeEvent {
    Position(f64),
    SampleRate(u32),
    State(TransportState),
    LoopWrap,
}

impl Outlets for Vec<BridgeEvent> {
    fn position_ms(&mut self, ms: f64) {
        self.push(BridgeEvent::Position(ms));
    }

    fn sample_rate(&mut self, rate: u32) {
        self.push(BridgeEvent::SampleRate(rate));
    }

    fn transport_state(&mut self, ordinal: u8) {
        self.push(BridgeEvent::State(TransportState::from_ordinal(ordinal)));
    }

    fn loop_wrap(&mut self) {
        self.push(BridgeEvent::LoopWrap);
    }
}

/// Polls the transport and emits position, sample rate and state.
pub struct TransportReporter {
    state: Arc<BridgeState>,
}

impl TransportReporter {
    pub fn new(state: Arc<BridgeState>) -> Self {
        Self { state }
    }

    /// Query the session once and emit to `outlets`.
    ///
    /// Position is always emitted. Sample rate and state only when they
    /// differ from the cached values; both caches are updated.
    pub fn poll(&self, session: &dyn ClientSession, outlets: &mut dyn Outlets) -> Result<()> {
        let snapshot = session.query()?;

        outlets.position_ms(snapshot.position_ms());

        if self.state.swap_sample_rate(snapshot.sample_rate) {
            outlets.sample_rate(snapshot.sample_rate);
        }

        if self.state.swap_transport_state(snapshot.state) {
            outlets.transport_state(snapshot.state.ordinal());
        }

        Ok(())
    }
}
