use crate::clock::SimulationClock;
use crate::error::{PlcError, Result};
use crate::io::{IoStore, OutputCommand};
use crate::registry::ProgramRegistry;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    #[default]
    Idle,
    Running,
    Stopping,
    Stopped,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Idle => "idle",
            EngineState::Running => "running",
            EngineState::Stopping => "stopping",
            EngineState::Stopped => "stopped",
        }
    }

    /// Numeric encoding for gauges (0=idle, 1=running, 2=stopping, 3=stopped).
    pub fn code(&self) -> u8 {
        match self {
            EngineState::Idle => 0,
            EngineState::Running => 1,
            EngineState::Stopping => 2,
            EngineState::Stopped => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartTarget {
    All,
    Program(String),
}

/// Cooperative stop request, observed by the engine at cycle boundaries.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgramFailure {
    pub program: String,
    pub error: PlcError,
}

#[derive(Debug, Clone)]
pub struct CycleReport {
    /// Tick whose inputs were scanned.
    pub tick: u64,
    /// Tick after the clock advanced.
    pub next_tick: u64,
    /// Simulated time at the start of the cycle.
    pub time: Duration,
    pub programs_stepped: usize,
    pub failures: Vec<ProgramFailure>,
    pub outputs: Vec<OutputCommand>,
    pub wall: Duration,
    pub state_after: EngineState,
}

#[derive(Clone, Default, Debug)]
pub struct ExecutionStats {
    pub cycles_executed: u64,
    pub program_failures: u64,
    pub watchdog_overruns: u64,
    pub last_cycle_us: u64,
    pub max_cycle_us: u64,
}

/// Runs scan cycles over the registered programs.
///
/// Per cycle: latch an input snapshot, step every selected program in
/// registry order, apply the collected outputs in that order and advance the
/// clock. A failing program loses its outputs for the cycle; the others are
/// unaffected.
pub struct ExecutionEngine {
    state: EngineState,
    target: StartTarget,
    stats: ExecutionStats,
    watchdog_budget: Duration,
    stop: StopHandle,
}

impl ExecutionEngine {
    pub fn new(watchdog_budget: Duration) -> Self {
        Self {
            state: EngineState::Idle,
            target: StartTarget::All,
            stats: ExecutionStats::default(),
            watchdog_budget,
            stop: StopHandle::default(),
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn target(&self) -> &StartTarget {
        &self.target
    }

    pub fn stats(&self) -> &ExecutionStats {
        &self.stats
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    fn selected(&self, name: &str) -> bool {
        match &self.target {
            StartTarget::All => true,
            StartTarget::Program(target) => target == name,
        }
    }

    /// Idle/Stopped -> Running. Reinitializes the selected programs against a
    /// fresh input snapshot and writes their initial outputs.
    pub fn start(
        &mut self,
        registry: &mut ProgramRegistry,
        store: &IoStore,
        clock: &SimulationClock,
        target: StartTarget,
    ) -> Result<()> {
        if matches!(self.state, EngineState::Running | EngineState::Stopping) {
            return Err(PlcError::InvalidState {
                operation: "start",
                state: self.state.as_str(),
            });
        }
        if let StartTarget::Program(name) = &target {
            if !registry.contains(name) {
                return Err(PlcError::ProgramNotFound { name: name.clone() });
            }
        }

        self.target = target;
        self.stop.clear();
        clock.restart();

        let snapshot = store.snapshot_inputs(clock.now(), clock.elapsed());
        let mut initial = Vec::new();
        for slot in registry.iter_mut() {
            if self.selected(slot.name()) {
                slot.initialize(&snapshot);
                initial.extend(slot.initial_outputs());
            }
        }
        store.apply_outputs(&initial, clock.now())?;

        self.state = EngineState::Running;
        log::info!(
            "Engine running {:?} from tick {}",
            self.target,
            clock.now()
        );
        Ok(())
    }

    /// Graceful stop. Cycles are never interrupted, so with no cycle in flight
    /// the drain completes immediately.
    pub fn stop(&mut self, clock: &SimulationClock) {
        match self.state {
            EngineState::Running | EngineState::Stopping => {
                self.state = EngineState::Stopping;
                self.finish_stop(clock);
            }
            EngineState::Idle | EngineState::Stopped => {}
        }
    }

    fn finish_stop(&mut self, clock: &SimulationClock) {
        clock.stop();
        self.state = EngineState::Stopped;
        self.stop.clear();
        log::info!(
            "Engine stopped at tick {} after {} cycles",
            clock.now(),
            self.stats.cycles_executed
        );
    }

    pub fn run_cycle(
        &mut self,
        registry: &mut ProgramRegistry,
        store: &IoStore,
        clock: &SimulationClock,
    ) -> Result<CycleReport> {
        if self.state != EngineState::Running {
            return Err(PlcError::InvalidState {
                operation: "run a cycle",
                state: self.state.as_str(),
            });
        }
        let started = Instant::now();
        let tick = clock.now();
        let time = clock.elapsed();

        // 1. Latch inputs once for every program in this cycle.
        let snapshot = store.snapshot_inputs(tick, time);

        // 2. Step programs in registry order.
        let mut outputs: Vec<OutputCommand> = Vec::new();
        let mut failures: Vec<ProgramFailure> = Vec::new();
        let mut programs_stepped = 0;
        for slot in registry.iter_mut() {
            if !self.selected(slot.name()) {
                continue;
            }
            programs_stepped += 1;
            let step_started = Instant::now();
            let result = slot.step(&snapshot);
            let spent = step_started.elapsed();
            if spent > self.watchdog_budget {
                self.stats.watchdog_overruns += 1;
                log::warn!(
                    "Program '{}' took {:?} at tick {} (budget {:?})",
                    slot.name(),
                    spent,
                    tick,
                    self.watchdog_budget
                );
            }
            match result {
                Ok(commands) => outputs.extend(commands),
                Err(error) => {
                    log::warn!("Program '{}' failed at tick {}: {}", slot.name(), tick, error);
                    failures.push(ProgramFailure {
                        program: slot.name().to_string(),
                        error,
                    });
                }
            }
        }

        // 3. Commit outputs in program order; last write per channel wins.
        store.apply_outputs(&outputs, tick)?;

        // 4. Cycle complete; advance simulated time.
        let next_tick = clock.advance()?;

        let wall = started.elapsed();
        let wall_us = wall.as_micros() as u64;
        self.stats.cycles_executed += 1;
        self.stats.program_failures += failures.len() as u64;
        self.stats.last_cycle_us = wall_us;
        self.stats.max_cycle_us = self.stats.max_cycle_us.max(wall_us);

        if self.stop.is_requested() {
            self.state = EngineState::Stopping;
            self.finish_stop(clock);
        }

        Ok(CycleReport {
            tick,
            next_tick,
            time,
            programs_stepped,
            failures,
            outputs,
            wall,
            state_after: self.state,
        })
    }
}
