use crate::infra::audit::{AuditEventType, AuditLogger};
use scan_core::{CycleExchange, CycleSnapshot, EngineState};
use scan_io::metrics::{
    init_metrics, serve_metrics, CURRENT_TICK, CYCLES_EXECUTED, CYCLE_TIME_US, ENGINE_STATE,
    PROGRAMS_LOADED, PROGRAM_FAILURES, SIM_TIME_SECONDS, WATCHDOG_OVERRUNS,
};
use std::sync::{atomic::AtomicBool, Arc};
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub fn init() {
    init_metrics();
}

pub fn start_metrics_server(addr: &Option<String>) -> Option<thread::JoinHandle<()>> {
    addr.as_ref().map(|addr| {
        info!(addr = %addr, "Starting metrics server");
        serve_metrics(addr.clone())
    })
}

/// Follows published cycle snapshots, mirrors them into the Prometheus
/// metrics and records engine transitions in the audit trail.
pub struct SnapshotWatcher {
    audit: Option<Arc<AuditLogger>>,
    engine_state: EngineState,
    cycles_executed: u64,
    program_failures: u64,
    watchdog_overruns: u64,
}

impl SnapshotWatcher {
    pub fn new(audit: Option<Arc<AuditLogger>>) -> Self {
        Self {
            audit,
            engine_state: EngineState::Idle,
            cycles_executed: 0,
            program_failures: 0,
            watchdog_overruns: 0,
        }
    }

    pub fn observe(&mut self, snapshot: &CycleSnapshot) {
        CURRENT_TICK.set(snapshot.tick as f64);
        SIM_TIME_SECONDS.set(snapshot.sim_time_ms as f64 / 1000.0);
        ENGINE_STATE.set(f64::from(snapshot.engine_state.code()));
        PROGRAMS_LOADED.set(snapshot.programs.len() as f64);

        let new_cycles = snapshot.cycles_executed.saturating_sub(self.cycles_executed);
        if new_cycles > 0 {
            CYCLES_EXECUTED.inc_by(new_cycles);
            CYCLE_TIME_US.observe(snapshot.last_cycle_us as f64);
        }
        let new_overruns = snapshot
            .watchdog_overruns
            .saturating_sub(self.watchdog_overruns);
        WATCHDOG_OVERRUNS.inc_by(new_overruns);
        self.cycles_executed = snapshot.cycles_executed;
        self.watchdog_overruns = snapshot.watchdog_overruns;

        let new_failures = snapshot.program_failures.saturating_sub(self.program_failures);
        if new_failures > 0 {
            PROGRAM_FAILURES.inc_by(new_failures);
            self.audit(
                snapshot.tick,
                AuditEventType::ProgramFault,
                serde_json::json!({
                    "new_failures": new_failures,
                    "failures": snapshot.last_failures,
                }),
            );
        }
        self.program_failures = snapshot.program_failures;

        if snapshot.engine_state != self.engine_state {
            info!(
                from = self.engine_state.as_str(),
                to = snapshot.engine_state.as_str(),
                tick = snapshot.tick,
                "Engine state changed"
            );
            match snapshot.engine_state {
                EngineState::Running => self.audit(
                    snapshot.tick,
                    AuditEventType::EngineStarted,
                    serde_json::json!({ "programs": snapshot.programs }),
                ),
                EngineState::Stopped => self.audit(
                    snapshot.tick,
                    AuditEventType::EngineStopped,
                    serde_json::json!({
                        "cycles_executed": snapshot.cycles_executed,
                        "program_failures": snapshot.program_failures,
                    }),
                ),
                EngineState::Idle | EngineState::Stopping => {}
            }
            self.engine_state = snapshot.engine_state;
        }
    }

    fn audit(&self, tick: u64, event_type: AuditEventType, details: serde_json::Value) {
        if let Some(logger) = &self.audit {
            if let Err(e) = logger.log_event(tick, event_type, details) {
                warn!(error = %e, "Failed to write audit entry");
            }
        }
    }
}

pub fn start_metrics_updater(
    exchange: Arc<CycleExchange>,
    audit: Option<Arc<AuditLogger>>,
    stop: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut watcher = SnapshotWatcher::new(audit);
        while !stop.load(std::sync::atomic::Ordering::Relaxed) {
            watcher.observe(&exchange.read());
            thread::sleep(POLL_INTERVAL);
        }
        // Pick up whatever the engine published while shutting down.
        watcher.observe(&exchange.read());
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::audit::AuditEntry;
    use tempfile::tempdir;

    fn entries(path: &std::path::Path) -> Vec<AuditEntry> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn transitions_and_faults_reach_the_audit_trail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let logger = Arc::new(AuditLogger::new(&path).unwrap());
        let mut watcher = SnapshotWatcher::new(Some(logger));

        let mut snapshot = CycleSnapshot::default();
        watcher.observe(&snapshot);

        snapshot.engine_state = EngineState::Running;
        snapshot.tick = 1;
        snapshot.cycles_executed = 1;
        watcher.observe(&snapshot);
        // No change, no entry.
        watcher.observe(&snapshot);

        snapshot.tick = 4;
        snapshot.cycles_executed = 4;
        snapshot.program_failures = 2;
        snapshot.last_failures = vec!["strict: no transition".into()];
        watcher.observe(&snapshot);

        snapshot.engine_state = EngineState::Stopped;
        watcher.observe(&snapshot);

        let kinds: Vec<AuditEventType> = entries(&path).into_iter().map(|e| e.event_type).collect();
        assert_eq!(
            kinds,
            vec![
                AuditEventType::EngineStarted,
                AuditEventType::ProgramFault,
                AuditEventType::EngineStopped,
            ]
        );
        let fault = &entries(&path)[1];
        assert_eq!(fault.tick, 4);
        assert_eq!(fault.details["new_failures"], 2);
    }

    #[test]
    fn updater_exits_on_stop() {
        let exchange = Arc::new(CycleExchange::new());
        let stop = Arc::new(AtomicBool::new(false));
        let handle = start_metrics_updater(Arc::clone(&exchange), None, Arc::clone(&stop));
        exchange.publish(CycleSnapshot {
            tick: 9,
            ..CycleSnapshot::default()
        });
        stop.store(true, std::sync::atomic::Ordering::Relaxed);
        handle.join().unwrap();
    }
}
