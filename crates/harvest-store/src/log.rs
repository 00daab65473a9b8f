//! The append-only `log.ndjson` event log.
//!
//! Event shapes follow the bulk export logging format, so downstream
//! tooling that understands bulk export logs can consume crawl and
//! hydration runs too. Each event is one line:
//! `{exportId, timestamp, eventId, eventDetail}`.

use std::path::{Path, PathBuf};

use serde_json::{json, Value};

use harvest_core::time::now_utc;

use crate::error::Result;
use crate::ndjson::NdjsonFileWriter;

pub struct EventLog {
    path: PathBuf,
    export_id: String,
}

impl EventLog {
    /// Create a log writing into `<dir>/log.ndjson`.
    ///
    /// Starts with a random export ID for events emitted before kickoff
    /// succeeds; once a poll URL is known, [`EventLog::set_export_id`]
    /// switches to it so interrupted exports and their resumptions share
    /// an ID.
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join("log.ndjson"),
            export_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn export_id(&self) -> &str {
        &self.export_id
    }

    pub fn set_export_id(&mut self, export_id: impl Into<String>) {
        self.export_id = export_id.into();
    }

    /// Append one event. The file is opened per event so log lines hit
    /// disk promptly even if the process dies.
    pub fn event(&self, event_id: &str, detail: Value) -> Result<()> {
        let mut row = json!({
            "exportId": self.export_id,
            "timestamp": now_utc().to_string(),
            "eventId": event_id,
            "eventDetail": detail,
        });
        if event_id == "kickoff" {
            // The log spec allows extra keys; sunder-prefix ours in case
            // it later claims more names.
            row["_client"] = json!("fhir-harvest");
            row["_clientVersion"] = json!(env!("CARGO_PKG_VERSION"));
        }

        let mut writer = NdjsonFileWriter::create(&self.path, true);
        writer.write(&row)?;
        writer.finish()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ndjson;
    use tempfile::tempdir;

    #[test]
    fn test_events_append_with_export_id() {
        let dir = tempdir().unwrap();
        let mut log = EventLog::new(dir.path());
        log.event("kickoff", json!({"exportUrl": "https://x/$export"}))
            .unwrap();
        log.set_export_id("https://x/poll/1");
        log.event("status_complete", json!({"transactionTime": "2024-01-01T00:00:00Z"}))
            .unwrap();

        let path = dir.path().join("log.ndjson");
        let rows: Vec<_> = ndjson::read_file(&path)
            .unwrap()
            .map(|r| r.unwrap().1)
            .collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["eventId"], "kickoff");
        assert_eq!(rows[0]["_client"], "fhir-harvest");
        assert_eq!(rows[1]["exportId"], "https://x/poll/1");
        assert!(rows[1].get("_client").is_none());
    }
}
