use crate::clock::{Pacing, SimulationClock};
use crate::engine::{
    CycleReport, EngineState, ExecutionEngine, ExecutionStats, ProgramFailure, StartTarget,
    StopHandle,
};
use crate::environment::{SimulationEnvironment, TickInfo};
use crate::error::{PlcError, Result};
use crate::io::{InputUpdate, IoCard, IoStore};
use crate::program::Program;
use crate::registry::ProgramRegistry;
use crate::sync::{
    BarrierWait, ChannelValue, CycleExchange, CycleSnapshot, Phase, ProgramStatus, TickBarrier,
};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct MasterConfig {
    pub tick_duration: Duration,
    /// `None` runs cycles back to back, as fast as the host allows.
    pub pacing: Option<Pacing>,
    /// Wall-time budget for a single program step before a watchdog overrun
    /// is recorded.
    pub watchdog_budget: Duration,
    /// How long the engine and environment threads block before re-checking
    /// for shutdown.
    pub barrier_timeout: Duration,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            tick_duration: Duration::from_millis(50),
            pacing: None,
            watchdog_budget: Duration::from_millis(50),
            barrier_timeout: Duration::from_millis(100),
        }
    }
}

/// Operator commands. Queued and applied by the engine thread at a cycle
/// boundary, never in the middle of a cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    Start(String),
    StartAll,
    Stop,
    SetInput(InputUpdate),
}

impl ControlCommand {
    pub fn label(&self) -> &'static str {
        match self {
            ControlCommand::Start(_) => "start",
            ControlCommand::StartAll => "start_all",
            ControlCommand::Stop => "stop",
            ControlCommand::SetInput(_) => "set_input",
        }
    }
}

const TICKET_PENDING: u8 = 0;
const TICKET_TAKEN: u8 = 1;
const TICKET_ABANDONED: u8 = 2;

/// Decides, exactly once, whether a waited-on command is applied by the
/// engine or withdrawn by a requester that stopped waiting.
#[derive(Debug, Default)]
struct Ticket(AtomicU8);

impl Ticket {
    fn take(&self) -> bool {
        self.0
            .compare_exchange(TICKET_PENDING, TICKET_TAKEN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn abandon(&self) -> bool {
        self.0
            .compare_exchange(
                TICKET_PENDING,
                TICKET_ABANDONED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

pub struct ControlRequest {
    pub command: ControlCommand,
    reply: Option<(Sender<Result<()>>, Arc<Ticket>)>,
}

#[derive(Clone)]
pub struct ControlSender {
    tx: Sender<ControlRequest>,
}

impl ControlSender {
    /// Queues a command without waiting for its outcome.
    pub fn submit(&self, command: ControlCommand) -> Result<()> {
        self.tx
            .send(ControlRequest {
                command,
                reply: None,
            })
            .map_err(|_| PlcError::ControlUnavailable {
                reason: "engine has shut down",
            })
    }

    /// Queues a command and waits up to `timeout` for the engine to apply it.
    ///
    /// A command that times out is withdrawn: the engine skips it, so an
    /// error from this call always means the command had no effect.
    pub fn request(&self, command: ControlCommand, timeout: Duration) -> Result<()> {
        let (reply_tx, reply_rx) = mpsc::channel();
        let ticket = Arc::new(Ticket::default());
        self.tx
            .send(ControlRequest {
                command,
                reply: Some((reply_tx, Arc::clone(&ticket))),
            })
            .map_err(|_| PlcError::ControlUnavailable {
                reason: "engine has shut down",
            })?;
        let shut_down = || PlcError::ControlUnavailable {
            reason: "engine has shut down",
        };
        match reply_rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                if ticket.abandon() {
                    return Err(PlcError::ControlUnavailable {
                        reason: "no reply before timeout",
                    });
                }
                // The engine already took the command; its reply is imminent.
                reply_rx.recv().unwrap_or_else(|_| Err(shut_down()))
            }
            Err(RecvTimeoutError::Disconnected) => Err(shut_down()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub cycles: u64,
    pub failures: Vec<ProgramFailure>,
}

/// Owns the IO store, clock, registry and engine of one simulated PLC and
/// couples them to a simulation environment.
pub struct PlcMaster {
    store: Arc<IoStore>,
    clock: Arc<SimulationClock>,
    registry: ProgramRegistry,
    engine: ExecutionEngine,
    exchange: Arc<CycleExchange>,
    config: MasterConfig,
    control_tx: Sender<ControlRequest>,
    control_rx: Receiver<ControlRequest>,
    last_failures: Vec<String>,
}

impl PlcMaster {
    pub fn new(cards: &[Box<dyn IoCard>], config: MasterConfig) -> Result<Self> {
        let store = IoStore::new(cards)?;
        let clock = match config.pacing {
            Some(pacing) => SimulationClock::with_pacing(config.tick_duration, pacing)?,
            None => SimulationClock::new(config.tick_duration)?,
        };
        let (control_tx, control_rx) = mpsc::channel();
        let master = Self {
            store: Arc::new(store),
            clock: Arc::new(clock),
            registry: ProgramRegistry::new(),
            engine: ExecutionEngine::new(config.watchdog_budget),
            exchange: Arc::new(CycleExchange::new()),
            config,
            control_tx,
            control_rx,
            last_failures: Vec::new(),
        };
        master.publish();
        Ok(master)
    }

    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<IoStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<SimulationClock> {
        &self.clock
    }

    pub fn registry(&self) -> &ProgramRegistry {
        &self.registry
    }

    pub fn exchange(&self) -> Arc<CycleExchange> {
        Arc::clone(&self.exchange)
    }

    pub fn engine_state(&self) -> EngineState {
        self.engine.state()
    }

    pub fn stats(&self) -> &ExecutionStats {
        self.engine.stats()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.engine.stop_handle()
    }

    pub fn control(&self) -> ControlSender {
        ControlSender {
            tx: self.control_tx.clone(),
        }
    }

    /// Registers a program after checking every channel it declares against
    /// the IO layout.
    pub fn load_program<P: Program>(&mut self, program: P) -> Result<()> {
        let layout = self.store.layout();
        for usage in program.channels() {
            if let Err(e) = layout.check(usage.channel, usage.kind) {
                log::warn!("Rejected program '{}': {}", program.name(), e);
                return Err(e);
            }
        }
        layout.check_commands(&program.initial_outputs())?;
        self.registry.register(program)?;
        self.publish();
        Ok(())
    }

    /// Removes a program. Unloading the single program the engine is running
    /// stops the engine first.
    pub fn unload_program(&mut self, name: &str) -> bool {
        let running_target = self.engine.state() == EngineState::Running
            && matches!(self.engine.target(), StartTarget::Program(target) if target == name);
        if running_target && self.registry.contains(name) {
            log::warn!("Unloading running program '{}', stopping the engine", name);
            self.engine.stop(&self.clock);
        }
        let removed = self.registry.unregister(name);
        self.publish();
        removed
    }

    pub fn start(&mut self, name: &str) -> Result<()> {
        self.start_target(StartTarget::Program(name.to_string()))
    }

    pub fn start_all(&mut self) -> Result<()> {
        self.start_target(StartTarget::All)
    }

    fn start_target(&mut self, target: StartTarget) -> Result<()> {
        self.engine
            .start(&mut self.registry, &self.store, &self.clock, target)?;
        self.last_failures.clear();
        self.publish();
        Ok(())
    }

    pub fn stop(&mut self) {
        self.engine.stop(&self.clock);
        self.publish();
    }

    /// Runs one scan cycle without touching the environment.
    pub fn cycle(&mut self) -> Result<CycleReport> {
        let report = self
            .engine
            .run_cycle(&mut self.registry, &self.store, &self.clock)?;
        self.last_failures = report
            .failures
            .iter()
            .map(|f| format!("{}: {}", f.program, f.error))
            .collect();
        self.publish();
        Ok(report)
    }

    pub fn handle_command(&mut self, command: ControlCommand) -> Result<()> {
        log::debug!("Applying control command {:?}", command);
        match command {
            ControlCommand::Start(name) => self.start(&name),
            ControlCommand::StartAll => self.start_all(),
            ControlCommand::Stop => {
                self.stop();
                Ok(())
            }
            ControlCommand::SetInput(update) => {
                self.store.apply_inputs(&[update])?;
                self.publish();
                Ok(())
            }
        }
    }

    fn dispatch(&mut self, request: ControlRequest) {
        let label = request.command.label();
        if let Some((_, ticket)) = &request.reply {
            if !ticket.take() {
                log::debug!("Skipping '{}' command withdrawn by its requester", label);
                return;
            }
        }
        let result = self.handle_command(request.command);
        if let Err(e) = &result {
            log::warn!("Rejected '{}' command: {}", label, e);
        }
        if let Some((reply, _)) = request.reply {
            let _ = reply.send(result);
        }
    }

    /// Applies every queued control command. Returns how many were handled.
    pub fn drain_commands(&mut self) -> usize {
        let mut handled = 0;
        loop {
            match self.control_rx.try_recv() {
                Ok(request) => {
                    self.dispatch(request);
                    handled += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        handled
    }

    /// Writes the environment's starting inputs.
    pub fn prepare<E: SimulationEnvironment + ?Sized>(&mut self, environment: &mut E) -> Result<()> {
        let updates = environment.prepare(self.store.layout());
        self.store.apply_inputs(&updates)?;
        log::info!(
            "Environment '{}' prepared with {} input(s)",
            environment.name(),
            updates.len()
        );
        self.publish();
        Ok(())
    }

    /// One lock-step tick: queued commands, a scan cycle, then the
    /// environment's turn for the new tick.
    pub fn step<E: SimulationEnvironment + ?Sized>(
        &mut self,
        environment: &mut E,
    ) -> Result<CycleReport> {
        self.drain_commands();
        let report = self.cycle()?;
        self.world_turn(environment, report.next_tick)?;
        Ok(report)
    }

    fn world_turn<E: SimulationEnvironment + ?Sized>(
        &mut self,
        environment: &mut E,
        tick: u64,
    ) -> Result<()> {
        let outputs = self.store.snapshot_outputs();
        let updates = environment.on_tick(
            TickInfo {
                tick,
                time: self.clock.time_at(tick),
            },
            &outputs,
        );
        self.store.apply_inputs(&updates)?;
        Ok(())
    }

    /// Runs up to `ticks` lock-step cycles, ending early if the engine stops.
    pub fn run_for<E: SimulationEnvironment + ?Sized>(
        &mut self,
        environment: &mut E,
        ticks: u64,
    ) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        for _ in 0..ticks {
            if self.engine.state() != EngineState::Running {
                break;
            }
            let report = self.step(environment)?;
            summary.cycles += 1;
            summary.failures.extend(report.failures);
        }
        Ok(summary)
    }

    /// Moves the master onto an engine thread and the environment onto a
    /// second thread. The two alternate through a [`TickBarrier`], so inputs
    /// stay frozen from a cycle's snapshot until its outputs are committed.
    ///
    /// With `limit` set the run ends after that many cycles.
    pub fn spawn<E>(self, environment: E, limit: Option<u64>) -> RunHandle<E>
    where
        E: SimulationEnvironment + 'static,
    {
        let barrier = Arc::new(TickBarrier::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let control = self.control();
        let stop = self.stop_handle();
        let exchange = self.exchange();
        let store = Arc::clone(&self.store);

        let world = {
            let barrier = Arc::clone(&barrier);
            let store = Arc::clone(&store);
            let clock = Arc::clone(&self.clock);
            let timeout = self.config.barrier_timeout;
            let mut environment = environment;
            thread::spawn(move || {
                let _close = CloseOnDrop(Arc::clone(&barrier));
                loop {
                    match barrier.wait_for(Phase::World, timeout) {
                        BarrierWait::Closed => break,
                        BarrierWait::TimedOut => continue,
                        BarrierWait::Ready(tick) => {
                            let outputs = store.snapshot_outputs();
                            let info = TickInfo {
                                tick,
                                time: clock.time_at(tick),
                            };
                            let updates = environment.on_tick(info, &outputs);
                            if let Err(e) = store.apply_inputs(&updates) {
                                log::warn!(
                                    "Environment '{}' wrote invalid inputs at tick {}: {}",
                                    environment.name(),
                                    tick,
                                    e
                                );
                            }
                            barrier.hand_to_scan();
                        }
                    }
                }
                environment
            })
        };

        let engine = {
            let barrier = Arc::clone(&barrier);
            let shutdown = Arc::clone(&shutdown);
            let mut master = self;
            thread::spawn(move || {
                let _close = CloseOnDrop(Arc::clone(&barrier));
                let result = master.drive(&barrier, &shutdown, limit);
                if let Err(e) = &result {
                    log::error!("Engine thread stopped on error: {}", e);
                }
                master.stop();
                (master, result)
            })
        };

        RunHandle {
            shutdown,
            stop,
            control,
            exchange,
            store,
            engine,
            world,
        }
    }

    fn drive(&mut self, barrier: &TickBarrier, shutdown: &AtomicBool, limit: Option<u64>) -> Result<u64> {
        let timeout = self.config.barrier_timeout;
        let mut cycles = 0u64;
        while !shutdown.load(Ordering::Acquire) {
            match barrier.wait_for(Phase::Scan, timeout) {
                BarrierWait::Closed => break,
                BarrierWait::TimedOut => continue,
                BarrierWait::Ready(_) => {}
            }
            self.drain_commands();
            if self.engine.state() != EngineState::Running {
                // Simulated time is frozen until a start command arrives.
                match self.control_rx.recv_timeout(timeout) {
                    Ok(request) => self.dispatch(request),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
                continue;
            }
            let report = self.cycle()?;
            cycles += 1;
            barrier.hand_to_world(report.next_tick);
            if limit.is_some_and(|limit| cycles >= limit) {
                // Let the environment react to the final tick.
                barrier.wait_for(Phase::Scan, timeout);
                break;
            }
        }
        Ok(cycles)
    }

    fn publish(&self) {
        let layout = self.store.layout();
        let inputs = layout
            .inputs()
            .zip(self.store.input_values())
            .map(|(channel, value)| ChannelValue { channel, value })
            .collect();
        let output_image = self.store.snapshot_outputs();
        let outputs = layout
            .outputs()
            .zip(output_image.values().iter().copied())
            .map(|(channel, value)| ChannelValue { channel, value })
            .collect();
        let programs = self
            .registry
            .list_in_order()
            .map(|p| ProgramStatus {
                name: p.name().to_string(),
                state: p.state_label(),
            })
            .collect();
        let stats = self.engine.stats();
        self.exchange.publish(CycleSnapshot {
            tick: self.clock.now(),
            sim_time_ms: self.clock.elapsed().as_millis() as u64,
            engine_state: self.engine.state(),
            inputs,
            outputs,
            programs,
            cycles_executed: stats.cycles_executed,
            program_failures: stats.program_failures,
            watchdog_overruns: stats.watchdog_overruns,
            last_cycle_us: stats.last_cycle_us,
            max_cycle_us: stats.max_cycle_us,
            last_failures: self.last_failures.clone(),
        });
    }
}

/// Closes the barrier when a worker exits, including by panic, so the peer
/// thread does not wait forever.
struct CloseOnDrop(Arc<TickBarrier>);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.0.close();
    }
}

pub struct RunOutcome<E> {
    pub master: PlcMaster,
    pub environment: E,
    /// Cycles executed, or the error that ended the engine thread.
    pub result: Result<u64>,
}

pub struct RunHandle<E> {
    shutdown: Arc<AtomicBool>,
    stop: StopHandle,
    control: ControlSender,
    exchange: Arc<CycleExchange>,
    store: Arc<IoStore>,
    engine: JoinHandle<(PlcMaster, Result<u64>)>,
    world: JoinHandle<E>,
}

impl<E> RunHandle<E> {
    /// Stops the engine after its in-flight cycle. The threads stay up and
    /// accept a fresh start command.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn control(&self) -> ControlSender {
        self.control.clone()
    }

    pub fn exchange(&self) -> Arc<CycleExchange> {
        Arc::clone(&self.exchange)
    }

    pub fn store(&self) -> Arc<IoStore> {
        Arc::clone(&self.store)
    }

    /// Asks both threads to exit. The engine finishes its in-flight cycle
    /// first.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.engine.is_finished()
    }

    pub fn join(self) -> Result<RunOutcome<E>> {
        let (master, result) = self
            .engine
            .join()
            .map_err(|_| PlcError::WorkerPanicked { worker: "engine" })?;
        let environment = self
            .world
            .join()
            .map_err(|_| PlcError::WorkerPanicked {
                worker: "environment",
            })?;
        Ok(RunOutcome {
            master,
            environment,
            result,
        })
    }
}
