//! Prometheus metrics for the scan-cycle runtime and its bridge.

use prometheus::{Encoder, Gauge, Histogram, HistogramOpts, IntCounter, Registry, TextEncoder};
use std::sync::LazyLock;
use std::thread;
use tiny_http::{Header, Response, Server};

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// ============================================================================
// Scan Cycle Metrics
// ============================================================================

pub static CYCLES_EXECUTED: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "scanplc_cycles_executed_total",
        "Total scan cycles executed",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static PROGRAM_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "scanplc_program_failures_total",
        "Program steps that failed and had their outputs dropped",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static WATCHDOG_OVERRUNS: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "scanplc_watchdog_overruns_total",
        "Program steps that exceeded the watchdog budget",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Wall time of a scan cycle in microseconds
pub static CYCLE_TIME_US: LazyLock<Histogram> = LazyLock::new(|| {
    let histogram = Histogram::with_opts(
        HistogramOpts::new(
            "scanplc_cycle_time_us",
            "Scan cycle wall time distribution in microseconds",
        )
        .buckets(vec![
            1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0,
        ]),
    )
    .unwrap();
    REGISTRY.register(Box::new(histogram.clone())).unwrap();
    histogram
});

// ============================================================================
// Simulation State Metrics
// ============================================================================

pub static CURRENT_TICK: LazyLock<Gauge> = LazyLock::new(|| {
    let gauge = Gauge::new("scanplc_tick", "Current simulation clock tick").unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

pub static SIM_TIME_SECONDS: LazyLock<Gauge> = LazyLock::new(|| {
    let gauge = Gauge::new(
        "scanplc_sim_time_seconds",
        "Simulated time elapsed in seconds",
    )
    .unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

/// Engine state (0=idle,1=running,2=stopping,3=stopped)
pub static ENGINE_STATE: LazyLock<Gauge> = LazyLock::new(|| {
    let gauge = Gauge::new(
        "scanplc_engine_state",
        "Engine state (0=idle,1=running,2=stopping,3=stopped)",
    )
    .unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

pub static PROGRAMS_LOADED: LazyLock<Gauge> = LazyLock::new(|| {
    let gauge = Gauge::new("scanplc_programs_loaded", "Programs in the registry").unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

// ============================================================================
// Bridge Metrics
// ============================================================================

/// Bridge client connection status (1 = connected, 0 = disconnected)
pub static BRIDGE_CONNECTED: LazyLock<Gauge> = LazyLock::new(|| {
    let gauge = Gauge::new(
        "scanplc_bridge_connected",
        "Bridge client connection status (1=connected, 0=disconnected)",
    )
    .unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

pub static BRIDGE_COMMANDS_ACCEPTED: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "scanplc_bridge_commands_accepted_total",
        "Bridge commands applied by the engine",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static BRIDGE_COMMANDS_REJECTED: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "scanplc_bridge_commands_rejected_total",
        "Bridge commands rejected by validation or by the engine",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static COMMANDS_OUT_OF_ORDER: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "scanplc_commands_out_of_order_total",
        "Commands rejected due to out-of-order sequence",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static AUTH_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "scanplc_auth_failures_total",
        "Commands rejected due to invalid auth tokens",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static AUTH_MISSING: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "scanplc_auth_missing_total",
        "Commands rejected due to missing auth tokens",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

// ============================================================================
// Metrics HTTP Server
// ============================================================================

/// Start the metrics HTTP server on the given address.
pub fn serve_metrics(bind_addr: String) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let server = match Server::http(&bind_addr) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("Failed to start metrics server on {}: {}", bind_addr, e);
                return;
            }
        };

        tracing::info!("Metrics server listening on http://{}/metrics", bind_addr);

        for request in server.incoming_requests() {
            match request.url() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let mut buffer = Vec::new();

                    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
                        tracing::warn!("Failed to encode metrics: {}", e);
                        let _ = request.respond(
                            Response::from_string("Internal Server Error").with_status_code(500),
                        );
                        continue;
                    }

                    let mut response = Response::from_data(buffer);
                    if let Ok(header) = Header::from_bytes(
                        &b"Content-Type"[..],
                        &b"text/plain; version=0.0.4"[..],
                    ) {
                        response = response.with_header(header);
                    }
                    let _ = request.respond(response);
                }
                "/health" => {
                    let _ = request.respond(Response::from_string("OK"));
                }
                "/ready" => {
                    // Ready once the engine has completed a cycle
                    if CYCLES_EXECUTED.get() > 0 {
                        let _ = request.respond(Response::from_string("Ready"));
                    } else {
                        let _ = request
                            .respond(Response::from_string("Not Ready").with_status_code(503));
                    }
                }
                _ => {
                    let _ =
                        request.respond(Response::from_string("Not Found").with_status_code(404));
                }
            }
        }
    })
}

/// Initialize all metrics (forces lazy initialization)
pub fn init_metrics() {
    let _ = CYCLES_EXECUTED.get();
    let _ = PROGRAM_FAILURES.get();
    let _ = WATCHDOG_OVERRUNS.get();
    let _ = CYCLE_TIME_US.get_sample_count();
    let _ = CURRENT_TICK.get();
    let _ = SIM_TIME_SECONDS.get();
    let _ = ENGINE_STATE.get();
    let _ = PROGRAMS_LOADED.get();
    let _ = BRIDGE_CONNECTED.get();
    let _ = BRIDGE_COMMANDS_ACCEPTED.get();
    let _ = BRIDGE_COMMANDS_REJECTED.get();
    let _ = COMMANDS_OUT_OF_ORDER.get();
    let _ = AUTH_FAILURES.get();
    let _ = AUTH_MISSING.get();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_exposes_scan_metrics() {
        init_metrics();
        CYCLES_EXECUTED.inc();
        let names: Vec<String> = REGISTRY
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.iter().any(|n| n == "scanplc_cycles_executed_total"));
        assert!(names.iter().any(|n| n == "scanplc_engine_state"));
        assert!(names.iter().any(|n| n == "scanplc_bridge_connected"));
    }
}
