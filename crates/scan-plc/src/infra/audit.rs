//! Append-only audit trail of operator and engine events.
//!
//! One JSON object per line. Entries are flushed as they are written so the
//! file stays readable if the process is killed.

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    SystemStart,
    SystemShutdown,
    /// A program was registered with the master
    ProgramLoaded,
    /// The engine entered `running`
    EngineStarted,
    /// The engine reached `stopped`
    EngineStopped,
    /// A program step failed and its outputs were dropped
    ProgramFault,
    /// A state-changing bridge command, accepted or not
    CommandReceived,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Simulation tick the event belongs to
    pub tick: u64,
    /// Wall-clock Unix timestamp in microseconds
    pub unix_us: u64,
    pub event_type: AuditEventType,
    pub details: serde_json::Value,
}

pub struct AuditLogger {
    writer: Mutex<BufWriter<File>>,
}

impl AuditLogger {
    /// Opens `path` in append mode, creating parent directories as needed.
    pub fn new(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            writer: Mutex::new(BufWriter::with_capacity(8192, file)),
        })
    }

    pub fn log(&self, entry: AuditEntry) -> std::io::Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        serde_json::to_writer(&mut *writer, &entry)?;
        writer.write_all(b"\n")?;
        writer.flush()
    }

    pub fn log_event(
        &self,
        tick: u64,
        event_type: AuditEventType,
        details: serde_json::Value,
    ) -> std::io::Result<()> {
        self.log(AuditEntry {
            tick,
            unix_us: unix_now_us(),
            event_type,
            details,
        })
    }
}

pub fn unix_now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::tempdir;

    #[test]
    fn test_audit_logger_writes_jsonl() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs").join("audit.jsonl");

        let logger = AuditLogger::new(&path).unwrap();
        logger
            .log_event(
                0,
                AuditEventType::SystemStart,
                serde_json::json!({"version": "0.1.0"}),
            )
            .unwrap();
        logger
            .log_event(
                7,
                AuditEventType::ProgramFault,
                serde_json::json!({"program": "garage-door", "error": "unhandled"}),
            )
            .unwrap();

        let mut content = String::new();
        File::open(&path)
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();

        let lines: Vec<&str> = content.trim().split('\n').collect();
        assert_eq!(lines.len(), 2);

        let first: AuditEntry = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.event_type, AuditEventType::SystemStart);
        assert!(first.unix_us > 0);

        let second: AuditEntry = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.tick, 7);
        assert_eq!(second.details["program"], "garage-door");
        assert!(lines[1].contains("\"event_type\":\"program_fault\""));
    }

    #[test]
    fn test_audit_logger_appends_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        for tick in 0..2 {
            let logger = AuditLogger::new(&path).unwrap();
            logger
                .log_event(tick, AuditEventType::EngineStarted, serde_json::json!({}))
                .unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
    }
}
