//! Loop enforcement in the transport server's real-time thread.
//!
//! [`LoopController`] is the timebase callback installed when the bridge
//! becomes timebase master. Every process cycle it checks the transport
//! position against the active loop region and, when the end is reached,
//! relocates to the loop start and pushes a [`LoopWrap`] onto an `rtrb`
//! ring for the control thread to pick up.
//!
//! Nothing in here locks, allocates, logs or wakes another thread; the
//! control side polls the ring.

use crate::state::BridgeState;
use crate::transport::{Frames, TimebaseCallback, TransportCursor};
use rtrb::Producer;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// How loop-end crossings are detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopMode {
    /// Level-triggered latch that flips on every cycle spent past the loop
    /// end. A wrap fires on the first such cycle, the latch is cleared on the
    /// next one, and so on, so a transport parked past the end wraps on
    /// every other cycle.
    #[default]
    Alternating,
    /// Fires once when the position moves from before the loop end to at or
    /// past it.
    EdgeTriggered,
}

impl std::str::FromStr for LoopMode {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "alternating" => Ok(LoopMode::Alternating),
            "edge" | "edge_triggered" => Ok(LoopMode::EdgeTriggered),
            other => Err(crate::error::Error::Parse(format!("unknown loop mode '{}'", other))),
        }
    }
}

/// A loop-wrap event raised from the real-time thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopWrap {
    /// Position at which the wrap was detected
    pub at: Frames,
    /// Loop start the transport was relocated to
    pub to: Frames,
}

/// The real-time loop enforcement callback.
pub struct LoopController {
    state: Arc<BridgeState>,
    mode: LoopMode,
    /// One-shot guard for [`LoopMode::Alternating`].
    latch: bool,
    /// Position seen on the previous cycle, for [`LoopMode::EdgeTriggered`].
    previous: Option<Frames>,
    wraps: Producer<LoopWrap>,
    dropped: Arc<AtomicU64>,
}

impl LoopController {
    /// Create a controller reading the loop region from `state` and
    /// reporting wraps on `wraps`.
    pub fn new(state: Arc<BridgeState>, mode: LoopMode, wraps: Producer<LoopWrap>) -> Self {
        Self {
            state,
            mode,
            latch: false,
            previous: None,
            wraps,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Share a counter for wrap events lost to a full ring.
    pub fn with_drop_counter(mut self, dropped: Arc<AtomicU64>) -> Self {
        self.dropped = dropped;
        self
    }

    /// Crossing detection mode.
    pub fn mode(&self) -> LoopMode {
        self.mode
    }

    /// Current value of the alternating latch.
    pub fn latched(&self) -> bool {
        self.latch
    }

    fn wrap(&mut self, transport: &dyn TransportCursor, at: Frames, to: Frames) {
        transport.locate(to);
        if self.wraps.push(LoopWrap { at, to }).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl TimebaseCallback for LoopController {
    fn on_cycle(&mut self, transport: &dyn TransportCursor) {
        let Some(region) = self.state.active_loop() else {
            self.previous = None;
            return;
        };

        let frame = transport.frame();
        match self.mode {
            LoopMode::Alternating => {
                if frame >= region.end() {
                    if !self.latch {
                        self.wrap(transport, frame, region.begin());
                        self.latch = true;
                    } else {
                        self.latch = false;
                    }
                }
            }
            LoopMode::EdgeTriggered => {
                let was_before_end = self.previous.map_or(true, |prev| prev < region.end());
                if frame >= region.end() && was_before_end {
                    self.wrap(transport, frame, region.begin());
                }
                self.previous = Some(frame);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::LoopRegion;
    use rtrb::{Consumer, RingBuffer};
    use std::cell::Cell;

    /// Cursor that records relocations instead of applying them.
    struct FakeCursor {
        frame: Cell<Frames>,
        locates: Cell<usize>,
        last_locate: Cell<Option<Frames>>,
    }

    impl FakeCursor {
        fn at(frame: Frames) -> Self {
            Self {
                frame: Cell::new(frame),
                locates: Cell::new(0),
                last_locate: Cell::new(None),
            }
        }
    }

    impl TransportCursor for FakeCursor {
        fn frame(&self) -> Frames {
            self.frame.get()
        }

        fn locate(&self, frame: Frames) {
            self.locates.set(self.locates.get() + 1);
            self.last_locate.set(Some(frame));
        }
    }

    fn controller(mode: LoopMode, begin: u32, end: u32) -> (LoopController, Arc<BridgeState>, Consumer<LoopWrap>) {
        let state = Arc::new(BridgeState::new());
        state.enable_loop(LoopRegion::new(begin, end).unwrap());
        let (tx, rx) = RingBuffer::new(16);
        (LoopController::new(state.clone(), mode, tx), state, rx)
    }

    fn drain(rx: &mut Consumer<LoopWrap>) -> Vec<LoopWrap> {
        std::iter::from_fn(|| rx.pop().ok()).collect()
    }

    #[test]
    fn test_alternating_two_cycles_past_end_wrap_once() {
        let (mut looper, _state, mut rx) = controller(LoopMode::Alternating, 0, 48000);
        let cursor = FakeCursor::at(48000);

        looper.on_cycle(&cursor);
        assert!(looper.latched());
        looper.on_cycle(&cursor);
        assert!(!looper.latched());

        assert_eq!(cursor.locates.get(), 1);
        assert_eq!(cursor.last_locate.get(), Some(0));
        assert_eq!(drain(&mut rx), vec![LoopWrap { at: 48000, to: 0 }]);
    }

    #[test]
    fn test_alternating_parked_past_end_wraps_every_other_cycle() {
        let (mut looper, _state, mut rx) = controller(LoopMode::Alternating, 0, 48000);
        let cursor = FakeCursor::at(50000);

        for _ in 0..6 {
            looper.on_cycle(&cursor);
        }

        assert_eq!(cursor.locates.get(), 3);
        assert_eq!(drain(&mut rx).len(), 3);
    }

    #[test]
    fn test_before_end_does_nothing() {
        let (mut looper, _state, rx) = controller(LoopMode::Alternating, 1000, 2000);
        let cursor = FakeCursor::at(1999);
        looper.on_cycle(&cursor);
        assert_eq!(cursor.locates.get(), 0);
        assert!(rx.is_empty());
        assert!(!looper.latched());
    }

    #[test]
    fn test_disabled_loop_is_ignored() {
        let (mut looper, state, rx) = controller(LoopMode::Alternating, 0, 100);
        state.disable_loop();
        let cursor = FakeCursor::at(500);
        looper.on_cycle(&cursor);
        looper.on_cycle(&cursor);
        assert_eq!(cursor.locates.get(), 0);
        assert!(rx.is_empty());
    }

    #[test]
    fn test_edge_triggered_fires_once_per_crossing() {
        let (mut looper, _state, mut rx) = controller(LoopMode::EdgeTriggered, 0, 48000);
        let cursor = FakeCursor::at(47000);

        looper.on_cycle(&cursor);
        cursor.frame.set(48100);
        for _ in 0..5 {
            looper.on_cycle(&cursor);
        }
        assert_eq!(cursor.locates.get(), 1);

        // Next lap
        cursor.frame.set(100);
        looper.on_cycle(&cursor);
        cursor.frame.set(48050);
        looper.on_cycle(&cursor);

        assert_eq!(cursor.locates.get(), 2);
        assert_eq!(drain(&mut rx).len(), 2);
    }

    #[test]
    fn test_edge_triggered_first_cycle_past_end_counts_as_crossing() {
        let (mut looper, _state, mut rx) = controller(LoopMode::EdgeTriggered, 10, 20);
        let cursor = FakeCursor::at(25);
        looper.on_cycle(&cursor);
        assert_eq!(cursor.last_locate.get(), Some(10));
        assert_eq!(rx.pop().unwrap(), LoopWrap { at: 25, to: 10 });
    }

    #[test]
    fn test_full_ring_counts_dropped_wraps() {
        let state = Arc::new(BridgeState::new());
        state.enable_loop(LoopRegion::new(0, 10).unwrap());
        let (tx, mut rx) = RingBuffer::new(1);
        let dropped = Arc::new(AtomicU64::new(0));
        let mut looper = LoopController::new(state, LoopMode::EdgeTriggered, tx).with_drop_counter(dropped.clone());
        let cursor = FakeCursor::at(5);

        for _ in 0..3 {
            cursor.frame.set(5);
            looper.on_cycle(&cursor);
            cursor.frame.set(15);
            looper.on_cycle(&cursor);
        }

        // Relocation still happens even when the event is lost
        assert_eq!(cursor.locates.get(), 3);
        assert_eq!(drain(&mut rx).len(), 1);
        assert_eq!(dropped.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_loop_mode_parsing() {
        assert_eq!("alternating".parse::<LoopMode>().unwrap(), LoopMode::Alternating);
        assert_eq!("edge-triggered".parse::<LoopMode>().unwrap(), LoopMode::EdgeTriggered);
        assert_eq!("edge".parse::<LoopMode>().unwrap(), LoopMode::EdgeTriggered);
        assert!("sideways".parse::<LoopMode>().is_err());
    }
}
