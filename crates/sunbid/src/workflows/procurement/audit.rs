use std::io::Write;
use std::path::Path;

use serde::Serialize;

use super::domain::Application;

#[derive(Debug)]
pub enum AuditExportError {
    Io(std::io::Error),
    Csv(csv::Error),
}

impl std::fmt::Display for AuditExportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditExportError::Io(err) => write!(f, "failed to write audit export: {}", err),
            AuditExportError::Csv(err) => write!(f, "could not encode audit rows: {}", err),
        }
    }
}

impl std::error::Error for AuditExportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AuditExportError::Io(err) => Some(err),
            AuditExportError::Csv(err) => Some(err),
        }
    }
}

impl From<std::io::Error> for AuditExportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<csv::Error> for AuditExportError {
    fn from(err: csv::Error) -> Self {
        Self::Csv(err)
    }
}

#[derive(Debug, Serialize)]
struct AuditRow<'a> {
    application_id: String,
    sequence: u64,
    at: String,
    actor_id: &'a str,
    actor_role: &'static str,
    action: &'static str,
    from: &'static str,
    to: &'static str,
}

/// Flattens every application's transition history into one CSV, oldest entry first per application.
pub fn export_audit_csv<W: Write>(
    writer: W,
    applications: &[Application],
) -> Result<usize, AuditExportError> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    let mut rows = 0;
    for application in applications {
        for entry in &application.history {
            csv_writer.serialize(AuditRow {
                application_id: application.id.to_string(),
                sequence: entry.sequence,
                at: entry.at.to_rfc3339(),
                actor_id: &entry.actor.id.0,
                actor_role: entry.actor.role.label(),
                action: entry.action.label(),
                from: entry.from.map(|status| status.label()).unwrap_or(""),
                to: entry.to.label(),
            })?;
            rows += 1;
        }
    }
    csv_writer.flush()?;
    Ok(rows)
}

pub fn export_audit_file<P: AsRef<Path>>(
    path: P,
    applications: &[Application],
) -> Result<usize, AuditExportError> {
    let file = std::fs::File::create(path)?;
    export_audit_csv(file, applications)
}
