use crate::engine::EngineState;
use crate::io::{ChannelRef, Value};
use serde::Serialize;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Whose turn it is on the shared IO image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// The engine may latch inputs, step programs and commit outputs.
    Scan,
    /// The environment may read outputs and write inputs for the next tick.
    World,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierWait {
    Ready(u64),
    TimedOut,
    Closed,
}

/// Alternates the engine and environment threads so that inputs never change
/// between a cycle's snapshot and its output commit.
pub struct TickBarrier {
    state: Mutex<(Phase, u64)>,
    changed: Condvar,
}

impl Default for TickBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl TickBarrier {
    pub fn new() -> Self {
        Self {
            state: Mutex::new((Phase::Scan, 0)),
            changed: Condvar::new(),
        }
    }

    pub fn phase(&self) -> (Phase, u64) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Blocks until the barrier reaches `phase`, it is closed, or `timeout`
    /// elapses.
    pub fn wait_for(&self, phase: Phase, timeout: Duration) -> BarrierWait {
        let deadline = Instant::now() + timeout;
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            match guard.0 {
                Phase::Closed => return BarrierWait::Closed,
                current if current == phase => return BarrierWait::Ready(guard.1),
                _ => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return BarrierWait::TimedOut;
            }
            guard = self
                .changed
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }

    pub fn hand_to_world(&self, tick: u64) {
        self.set(Phase::World, tick);
    }

    pub fn hand_to_scan(&self) {
        let tick = self.phase().1;
        self.set(Phase::Scan, tick);
    }

    pub fn close(&self) {
        self.set(Phase::Closed, self.phase().1);
    }

    fn set(&self, phase: Phase, tick: u64) {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if guard.0 == Phase::Closed {
            return;
        }
        *guard = (phase, tick);
        self.changed.notify_all();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelValue {
    pub channel: ChannelRef,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgramStatus {
    pub name: String,
    /// `None` until the program has been initialized by a start.
    pub state: Option<String>,
}

/// What observers see after each cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleSnapshot {
    pub tick: u64,
    pub sim_time_ms: u64,
    pub engine_state: EngineState,
    pub inputs: Vec<ChannelValue>,
    pub outputs: Vec<ChannelValue>,
    pub programs: Vec<ProgramStatus>,
    pub cycles_executed: u64,
    pub program_failures: u64,
    pub watchdog_overruns: u64,
    pub last_cycle_us: u64,
    pub max_cycle_us: u64,
    /// Failures from the most recent cycle, rendered as `program: error`.
    pub last_failures: Vec<String>,
}

/// Latest-value exchange between the engine thread and observers such as the
/// bridge and the metrics updater. Readers never block the engine for longer
/// than an `Arc` clone.
#[derive(Default)]
pub struct CycleExchange {
    latest: Mutex<Arc<CycleSnapshot>>,
}

impl CycleExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, snapshot: CycleSnapshot) {
        *self.latest.lock().unwrap_or_else(|e| e.into_inner()) = Arc::new(snapshot);
    }

    pub fn read(&self) -> Arc<CycleSnapshot> {
        Arc::clone(&self.latest.lock().unwrap_or_else(|e| e.into_inner()))
    }
}
