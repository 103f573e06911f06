//! Run log - one NDJSON line per card execution.
//!
//! Append-only. Each line is a JSON object:
//! ```json
//! {"ts":"2026-10-19T10:30:00Z","type":"run","run_id":"...","card":"QBR","status":"completed","duration_ms":12,"steps":[...]}
//! {"ts":"2026-10-19T10:30:01Z","type":"rejected","card":"QBR","error":{"error":"validation_error",...}}
//! ```
//!
//! Inputs and outputs are not written; only their top-level keys.

use atlas_protocol::{AuditEntry, Dossier, ErrorBody, RunStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuditLogError {
    #[error("Failed to open audit log {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write audit record: {0}")]
    Write(String),
}

#[derive(Debug)]
pub struct AuditLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl AuditLog {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, AuditLogError> {
        let path = path.into();
        let open_err = |source| AuditLogError::Open {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(open_err)?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(open_err)?;

        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            path,
        })
    }

    /// Record a finished run (completed, blocked or failed).
    pub fn log_run(&self, dossier: &Dossier) -> Result<(), AuditLogError> {
        self.write_record(&RunRecord::Run {
            ts: Utc::now(),
            run_id: dossier.run_id.as_str(),
            card: &dossier.card,
            version: &dossier.version,
            status: dossier.status,
            duration_ms: dossier.duration_ms,
            input_keys: keys_of(&dossier.inputs),
            error: dossier.error.as_ref(),
            steps: &dossier.audit,
        })
    }

    /// Record a run refused before any step ran.
    pub fn log_rejected(&self, card: &str, error: &ErrorBody) -> Result<(), AuditLogError> {
        self.write_record(&RunRecord::Rejected {
            ts: Utc::now(),
            card,
            error,
        })
    }

    fn write_record(&self, record: &RunRecord<'_>) -> Result<(), AuditLogError> {
        let json =
            serde_json::to_string(record).map_err(|e| AuditLogError::Write(e.to_string()))?;

        let mut writer = self
            .writer
            .lock()
            .map_err(|e| AuditLogError::Write(format!("lock poisoned: {}", e)))?;
        writeln!(writer, "{}", json).map_err(|e| AuditLogError::Write(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| AuditLogError::Write(e.to_string()))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RunRecord<'a> {
    Run {
        ts: DateTime<Utc>,
        run_id: &'a str,
        card: &'a str,
        version: &'a str,
        status: RunStatus,
        duration_ms: u64,
        input_keys: Vec<&'a str>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<&'a ErrorBody>,
        steps: &'a [AuditEntry],
    },
    Rejected {
        ts: DateTime<Utc>,
        card: &'a str,
        error: &'a ErrorBody,
    },
}

fn keys_of(value: &Value) -> Vec<&str> {
    match value {
        Value::Object(map) => map.keys().map(String::as_str).collect(),
        _ => Vec::new(),
    }
}
