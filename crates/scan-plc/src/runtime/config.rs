use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub show_help: bool,
    pub tick_ms: u64,
    /// Simulated seconds per wall second. `0` runs unpaced.
    pub acceleration: f64,
    pub ticks: Option<u64>,
    pub run_seconds: Option<u64>,
    /// `"all"`, a program name, or `None` to wait for a bridge `start`.
    pub program: Option<String>,
    pub travel_ticks: u32,
    pub bind_addr: String,
    pub bridge_enabled: bool,
    pub publish_ms: u64,
    pub json_logs: bool,
    pub log_dir: Option<PathBuf>,
    pub metrics_addr: Option<String>,
    pub audit_path: Option<PathBuf>,
    pub auth_secret: Option<String>,
    pub auth_max_age_secs: u64,
    pub bridge_require_handshake: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            show_help: false,
            tick_ms: 50,
            acceleration: 1.0,
            ticks: None,
            run_seconds: None,
            program: Some("all".to_string()),
            travel_ticks: scan_core::door::DEFAULT_TRAVEL_TICKS,
            bind_addr: "127.0.0.1:7000".to_string(),
            bridge_enabled: true,
            publish_ms: 100,
            json_logs: false,
            log_dir: None,
            metrics_addr: None,
            audit_path: None,
            auth_secret: None,
            auth_max_age_secs: 300,
            bridge_require_handshake: false,
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let args: Vec<String> = std::env::args().collect();
        Self::from_args(&args)
    }

    pub fn from_args(args: &[String]) -> Self {
        let mut cfg = RuntimeConfig::default();
        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--tick-ms" => {
                    if i + 1 < args.len() {
                        cfg.tick_ms = args[i + 1].parse().unwrap_or(cfg.tick_ms);
                        i += 1;
                    }
                }
                "--acceleration" => {
                    if i + 1 < args.len() {
                        cfg.acceleration = args[i + 1].parse().unwrap_or(cfg.acceleration);
                        i += 1;
                    }
                }
                "--ticks" => {
                    if i + 1 < args.len() {
                        cfg.ticks = args[i + 1].parse::<u64>().ok();
                        i += 1;
                    }
                }
                "--run-seconds" => {
                    if i + 1 < args.len() {
                        cfg.run_seconds = args[i + 1].parse::<u64>().ok();
                        i += 1;
                    }
                }
                "--program" => {
                    if i + 1 < args.len() {
                        cfg.program = match args[i + 1].as_str() {
                            "none" => None,
                            name => Some(name.to_string()),
                        };
                        i += 1;
                    }
                }
                "--travel-ticks" => {
                    if i + 1 < args.len() {
                        cfg.travel_ticks = args[i + 1].parse().unwrap_or(cfg.travel_ticks);
                        i += 1;
                    }
                }
                "--bind" => {
                    if i + 1 < args.len() {
                        cfg.bind_addr = args[i + 1].clone();
                        i += 1;
                    }
                }
                "--no-bridge" => {
                    cfg.bridge_enabled = false;
                }
                "--publish-ms" => {
                    if i + 1 < args.len() {
                        cfg.publish_ms = args[i + 1].parse().unwrap_or(cfg.publish_ms);
                        i += 1;
                    }
                }
                "--json-logs" => {
                    cfg.json_logs = true;
                }
                "--log-dir" => {
                    if i + 1 < args.len() {
                        cfg.log_dir = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "--metrics-addr" => {
                    if i + 1 < args.len() {
                        cfg.metrics_addr = Some(args[i + 1].clone());
                        i += 1;
                    }
                }
                "--audit-log" => {
                    if i + 1 < args.len() {
                        cfg.audit_path = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "--auth-secret" => {
                    if i + 1 < args.len() {
                        cfg.auth_secret = Some(args[i + 1].clone());
                        i += 1;
                    }
                }
                "--auth-max-age" => {
                    if i + 1 < args.len() {
                        cfg.auth_max_age_secs = args[i + 1].parse().unwrap_or(300);
                        i += 1;
                    }
                }
                "--require-handshake" => {
                    cfg.bridge_require_handshake = true;
                }
                "--help" | "-h" => {
                    cfg.show_help = true;
                    break;
                }
                _ => {}
            }
            i += 1;
        }
        cfg
    }

    pub fn print_help() {
        println!(
            r#"scan-plc - Scan-cycle PLC simulator

USAGE:
    scan-plc [OPTIONS]

OPTIONS:
    --tick-ms <MS>          Simulated duration of one tick [default: 50]
    --acceleration <X>      Simulated seconds per wall second (at least 0.001), 0 runs unpaced [default: 1]
    --ticks <N>             Stop after N scan cycles
    --run-seconds <SECS>    Run for a fixed wall duration then exit
    --program <NAME>        Program to start: a name, "all" or "none" [default: all]
    --travel-ticks <N>      Ticks the simulated door needs end to end [default: 3]
    --bind <ADDR>           Bridge TCP bind address [default: 127.0.0.1:7000]
    --no-bridge             Disable the TCP bridge
    --publish-ms <MS>       Interval between bridge state messages [default: 100]
    --json-logs             Output logs in JSON format (for log aggregation)
    --log-dir <PATH>        Also write daily rolling log files to this directory
    --metrics-addr <ADDR>   Enable Prometheus metrics server on address (e.g., 0.0.0.0:9090)
    --audit-log <PATH>      Enable audit logging to specified JSONL file
    --auth-secret <STR>     Shared secret for HMAC token authentication
    --auth-max-age <SECS>   Maximum age for auth tokens in seconds [default: 300]
    --require-handshake     Require a hello before accepting commands
    -h, --help              Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG                Set log filter (e.g., RUST_LOG=debug,scan_core=trace)

EXAMPLES:
    # Door demo with metrics
    scan-plc --metrics-addr 0.0.0.0:9090

    # Wait for an operator to start programs over the bridge
    scan-plc --program none --require-handshake --auth-secret changeme

    # Short unpaced run
    scan-plc --no-bridge --acceleration 0 --ticks 1000
"#
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("scan-plc")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn defaults_start_everything_in_real_time() {
        let cfg = RuntimeConfig::from_args(&args(&[]));
        assert_eq!(cfg.program.as_deref(), Some("all"));
        assert_eq!(cfg.tick_ms, 50);
        assert_eq!(cfg.acceleration, 1.0);
        assert!(cfg.bridge_enabled);
    }

    #[test]
    fn parses_run_flags() {
        let cfg = RuntimeConfig::from_args(&args(&[
            "--tick-ms",
            "10",
            "--acceleration",
            "0",
            "--ticks",
            "25",
            "--program",
            "none",
            "--no-bridge",
            "--audit-log",
            "/tmp/audit.jsonl",
            "--unknown-flag",
        ]));
        assert_eq!(cfg.tick_ms, 10);
        assert_eq!(cfg.acceleration, 0.0);
        assert_eq!(cfg.ticks, Some(25));
        assert_eq!(cfg.program, None);
        assert!(!cfg.bridge_enabled);
        assert_eq!(cfg.audit_path, Some(PathBuf::from("/tmp/audit.jsonl")));
    }

    #[test]
    fn help_stops_parsing() {
        let cfg = RuntimeConfig::from_args(&args(&["-h", "--no-bridge"]));
        assert!(cfg.show_help);
        assert!(cfg.bridge_enabled);
    }
}
