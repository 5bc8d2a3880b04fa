//! Audit logging for privileged zone operations
//!
//! Membership changes, leadership changes and refused privileged calls are
//! written as JSON lines. One logger is owned by the server context.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

/// Audit log event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditEventType {
    ServerAdded,
    ServerDeleted,
    ServerReset,
    LeadershipAcquired,
    LeadershipLost,
    AccessDenied,
    Halted,
}

/// Audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
    pub event: AuditEventType,
    pub actor: String,
    pub target: Option<String>,
    pub message: String,
    pub meta: Option<serde_json::Value>,
}

pub struct AuditLogger {
    file: Option<Mutex<File>>,
    echo: bool,
}

impl AuditLogger {
    /// Open (append) the audit log at `path`. With `echo` every entry is
    /// also emitted as a tracing event under the `audit` target.
    pub fn new(path: impl AsRef<Path>, echo: bool) -> Self {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())
            .map_err(|e| {
                tracing::warn!("audit log {} unavailable: {}", path.as_ref().display(), e)
            })
            .ok()
            .map(Mutex::new);
        Self { file, echo }
    }

    /// Logger that drops every entry
    pub fn disabled() -> Self {
        Self {
            file: None,
            echo: false,
        }
    }

    pub fn log(&self, entry: AuditEntry) {
        if self.echo {
            tracing::info!(target: "audit", event = ?entry.event, actor = %entry.actor, "{}", entry.message);
        }
        let Some(file) = &self.file else {
            return;
        };
        let line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("audit entry not serializable: {}", e);
                return;
            }
        };
        if let Err(e) = writeln!(file.lock(), "{}", line) {
            tracing::warn!("audit write failed: {}", e);
        }
    }

    pub fn log_event(
        &self,
        event: AuditEventType,
        actor: impl Into<String>,
        target: Option<String>,
        message: impl Into<String>,
        meta: Option<serde_json::Value>,
    ) {
        self.log(AuditEntry {
            timestamp: Utc::now(),
            event,
            actor: actor.into(),
            target,
            message: message.into(),
            meta,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_lines_are_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let logger = AuditLogger::new(&path, false);
        logger.log_event(
            AuditEventType::ServerAdded,
            "admin",
            Some("zone/0/server/3".to_string()),
            "server added",
            Some(serde_json::json!({ "endpoint": "http://10.0.0.3:2634" })),
        );
        logger.log_event(AuditEventType::LeadershipAcquired, "server/0", None, "term 4", None);

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: AuditEntry = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.event, AuditEventType::ServerAdded);
        assert_eq!(first.target.as_deref(), Some("zone/0/server/3"));
    }
}
