use crate::infra::audit::{AuditEventType, AuditLogger};
use crate::runtime::config::RuntimeConfig;
use crate::runtime::logging::init_tracing;
use crate::runtime::telemetry;
use scan_core::door::{garage_door_program, DoorWorld};
use scan_core::{BasicIoCard, IoCard, MasterConfig, Pacing, PlcError, PlcMaster};
use scan_io::auth::AuthConfig;
use scan_io::bridge::{Bridge, BridgeConfig, BridgeContext, CommandRecord};
use std::path::PathBuf;
use std::sync::{atomic::AtomicBool, Arc};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Plc(#[from] PlcError),

    #[error("bridge could not bind {addr}: {source}")]
    Bridge {
        addr: String,
        source: std::io::Error,
    },

    #[error("audit log {path} could not be opened: {source}")]
    Audit {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub fn run_from_args() -> Result<(), RuntimeError> {
    let config = RuntimeConfig::from_env();
    if config.show_help {
        RuntimeConfig::print_help();
        return Ok(());
    }
    run(config)
}

pub fn run(config: RuntimeConfig) -> Result<(), RuntimeError> {
    let _log_guard = init_tracing(config.json_logs, config.log_dir.as_deref());

    telemetry::init();
    let _metrics_handle = telemetry::start_metrics_server(&config.metrics_addr);

    let audit_logger = init_audit_logger(config.audit_path.as_ref())?;
    audit(
        &audit_logger,
        0,
        AuditEventType::SystemStart,
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "tick_ms": config.tick_ms,
            "acceleration": config.acceleration,
            "bridge_enabled": config.bridge_enabled,
            "metrics_enabled": config.metrics_addr.is_some(),
        }),
    );

    let result = run_simulation(&config, &audit_logger);
    if let Err(e) = &result {
        error!(error = %e, "Runtime stopped on error");
    }
    result
}

fn run_simulation(
    config: &RuntimeConfig,
    audit_logger: &Option<Arc<AuditLogger>>,
) -> Result<(), RuntimeError> {
    let master_config = build_master_config(config)?;
    info!(
        tick_ms = config.tick_ms,
        acceleration = config.acceleration,
        watchdog_ms = master_config.watchdog_budget.as_millis() as u64,
        "Configuring scan-cycle master"
    );

    let cards: Vec<Box<dyn IoCard>> = vec![Box::new(BasicIoCard::new("door"))];
    let mut master = PlcMaster::new(&cards, master_config)?;

    let program = garage_door_program()?;
    master.load_program(program)?;
    for name in master.registry().names() {
        info!(program = %name, "Program loaded");
        audit(
            audit_logger,
            master.clock().now(),
            AuditEventType::ProgramLoaded,
            serde_json::json!({ "program": name }),
        );
    }

    let mut world = DoorWorld::new(config.travel_ticks);
    master.prepare(&mut world)?;

    match config.program.as_deref() {
        Some("all") => master.start_all()?,
        Some(name) => master.start(name)?,
        None => info!("No program started, waiting for a bridge start command"),
    }

    let stop = Arc::new(AtomicBool::new(false));
    let exchange = master.exchange();
    let layout = master.store().shared_layout();

    // Bind before spawning anything so a taken port fails the run cleanly.
    let bridge = if config.bridge_enabled {
        let bridge_config = build_bridge_config(config);
        let addr = bridge_config.bind_addr.clone();
        Some(
            Bridge::bind(bridge_config)
                .map_err(|source| RuntimeError::Bridge { addr, source })?,
        )
    } else {
        info!("Bridge disabled");
        None
    };

    let handle = master.spawn(world, config.ticks);

    let updater = telemetry::start_metrics_updater(
        Arc::clone(&exchange),
        audit_logger.clone(),
        Arc::clone(&stop),
    );

    let bridge_handle = bridge.map(|bridge| {
        let ctx = BridgeContext {
            exchange: Arc::clone(&exchange),
            control: handle.control(),
            layout,
            on_command: audit_logger.clone().map(|logger| {
                let exchange = Arc::clone(&exchange);
                Arc::new(move |record: &CommandRecord| {
                    let tick = exchange.read().tick;
                    if let Err(e) = logger.log_event(
                        tick,
                        AuditEventType::CommandReceived,
                        serde_json::json!({
                            "request": record.request,
                            "client_id": record.client_id,
                            "sequence": record.sequence,
                            "accepted": record.accepted,
                            "detail": record.detail,
                        }),
                    ) {
                        warn!(error = %e, "Failed to write audit entry");
                    }
                }) as scan_io::CommandHook
            }),
        };
        let stop_bridge = Arc::clone(&stop);
        if let Ok(addr) = bridge.local_addr() {
            info!(addr = %addr, "Starting bridge");
        }
        thread::spawn(move || bridge.run(ctx, stop_bridge))
    });

    info!("scan-plc running. Connect a client to the bridge to operate the door.");

    let deadline = config
        .run_seconds
        .map(|seconds| Instant::now() + Duration::from_secs(seconds));
    if let Some(seconds) = config.run_seconds {
        info!(seconds, "Running for limited duration");
    }
    while !handle.is_finished() {
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            handle.shutdown();
            break;
        }
        thread::sleep(Duration::from_millis(20));
    }

    let outcome = handle.join()?;
    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    if let Some(handle) = bridge_handle {
        let _ = handle.join();
    }
    let _ = updater.join();

    let stats = outcome.master.stats().clone();
    let world = &outcome.environment;
    info!(
        cycles_executed = stats.cycles_executed,
        program_failures = stats.program_failures,
        watchdog_overruns = stats.watchdog_overruns,
        max_cycle_us = stats.max_cycle_us,
        door_position = world.position(),
        motor_faults = world.motor_faults(),
        "Run complete"
    );
    audit(
        audit_logger,
        outcome.master.clock().now(),
        AuditEventType::SystemShutdown,
        serde_json::json!({
            "cycles_executed": stats.cycles_executed,
            "program_failures": stats.program_failures,
            "watchdog_overruns": stats.watchdog_overruns,
            "door_open": world.is_open(),
        }),
    );

    outcome.result?;
    Ok(())
}

fn build_master_config(config: &RuntimeConfig) -> Result<MasterConfig, PlcError> {
    // Exactly zero means unpaced; anything else must be a valid pacing.
    let pacing = if config.acceleration == 0.0 {
        None
    } else {
        Some(Pacing::new(config.acceleration)?)
    };
    Ok(MasterConfig {
        tick_duration: Duration::from_millis(config.tick_ms),
        pacing,
        ..Default::default()
    })
}

fn build_bridge_config(config: &RuntimeConfig) -> BridgeConfig {
    BridgeConfig {
        bind_addr: config.bind_addr.clone(),
        publish_interval: Duration::from_millis(config.publish_ms.max(1)),
        auth: AuthConfig {
            enabled: config.auth_secret.is_some(),
            secret: config.auth_secret.clone().unwrap_or_default().into_bytes(),
            max_age_secs: config.auth_max_age_secs,
        },
        require_handshake: config.bridge_require_handshake,
        ..Default::default()
    }
}

fn init_audit_logger(
    audit_path: Option<&PathBuf>,
) -> Result<Option<Arc<AuditLogger>>, RuntimeError> {
    audit_path
        .map(|path| match AuditLogger::new(path) {
            Ok(logger) => {
                info!(path = %path.display(), "Audit logging enabled");
                Ok(Arc::new(logger))
            }
            Err(source) => Err(RuntimeError::Audit {
                path: path.clone(),
                source,
            }),
        })
        .transpose()
}

fn audit(
    logger: &Option<Arc<AuditLogger>>,
    tick: u64,
    event_type: AuditEventType,
    details: serde_json::Value,
) {
    if let Some(logger) = logger {
        if let Err(e) = logger.log_event(tick, event_type, details) {
            warn!(error = %e, "Failed to write audit entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_acceleration(acceleration: f64) -> RuntimeConfig {
        RuntimeConfig {
            acceleration,
            ..Default::default()
        }
    }

    #[test]
    fn zero_acceleration_runs_unpaced() {
        let master = build_master_config(&with_acceleration(0.0)).unwrap();
        assert!(master.pacing.is_none());
        let master = build_master_config(&with_acceleration(4.0)).unwrap();
        assert_eq!(master.pacing, Some(Pacing::new(4.0).unwrap()));
    }

    #[test]
    fn invalid_acceleration_is_a_config_error() {
        for acceleration in [-1.0, f64::NAN, f64::INFINITY, 1e-300] {
            let err = build_master_config(&with_acceleration(acceleration)).unwrap_err();
            assert!(
                matches!(err, PlcError::InvalidConfig { .. }),
                "{acceleration}: {err:?}"
            );
        }
    }
}
