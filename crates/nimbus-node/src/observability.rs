//! The ambient stack pieces that don't belong to any one subsystem:
//! `tracing` initialization, the Prometheus-text `/metrics` exposition,
//! and the on-disk [`AuditRecorder`] `nimbus-security`'s own doc comment
//! says belongs here.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use async_trait::async_trait;
use nimbus_core::audit::{AuditEventV1, AuditOutcome, AuditRecorder};
use nimbus_core::error::NimbusError;
use nimbus_scheduler::NodeStatsTable;
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

use crate::error::NodeError;
use crate::http::ClusterControl;

/// Installs a `fmt` subscriber filtered by `RUST_LOG` (default `info`).
/// The teacher's own observability crate layers OpenTelemetry export on
/// top of this same `registry + EnvFilter + fmt` skeleton; this node
/// skips the exporter layer since nothing here ships spans off-box yet.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Appends every audit event to a newline-delimited JSON file, resuming
/// the hash chain from the last line on disk rather than starting a new
/// chain (and thus a detectable gap) on every restart.
pub struct FileAuditRecorder {
    file: Mutex<File>,
    tip_hash: Mutex<String>,
    next_sequence: Mutex<u64>,
}

impl FileAuditRecorder {
    pub fn open(path: &Path) -> Result<Self, NodeError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let (tip_hash, next_sequence) = Self::read_tip(path)?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file: Mutex::new(file), tip_hash: Mutex::new(tip_hash), next_sequence: Mutex::new(next_sequence) })
    }

    fn read_tip(path: &Path) -> Result<(String, u64), NodeError> {
        let Ok(file) = File::open(path) else {
            return Ok((AuditEventV1::GENESIS_HASH.to_string(), 0));
        };
        let mut last: Option<AuditEventV1> = None;
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let event: AuditEventV1 = serde_json::from_str(&line)
                .map_err(|err| NodeError::Audit(format!("corrupt audit log entry: {err}")))?;
            last = Some(event);
        }
        match last {
            Some(event) => {
                let tip = event.event_hash();
                Ok((tip, event.sequence + 1))
            }
            None => Ok((AuditEventV1::GENESIS_HASH.to_string(), 0)),
        }
    }
}

#[async_trait]
impl AuditRecorder for FileAuditRecorder {
    async fn record(&self, principal: &str, action: &str, outcome: AuditOutcome, detail: Option<String>) -> Result<(), NimbusError> {
        let mut tip = self.tip_hash.lock();
        let mut sequence = self.next_sequence.lock();
        let event = AuditEventV1 {
            sequence: *sequence,
            epoch_ms: nimbus_core::runtime::wall_clock_epoch_ms(),
            principal: principal.to_string(),
            action: action.to_string(),
            outcome,
            detail,
            prev_hash: tip.clone(),
        };
        let line = serde_json::to_string(&event).map_err(|err| NimbusError::fatal(err.to_string()))?;
        let mut file = self.file.lock();
        writeln!(file, "{line}").map_err(|err| NimbusError::fatal(err.to_string()))?;
        file.flush().map_err(|err| NimbusError::fatal(err.to_string()))?;

        *tip = event.event_hash();
        *sequence += 1;
        Ok(())
    }

    async fn tip_hash(&self) -> String {
        self.tip_hash.lock().clone()
    }
}

/// Renders the handful of gauges this node exposes in Prometheus's text
/// exposition format. No histogram/summary support: nothing here needs
/// latency buckets yet, and adding a registry crate for five gauges would
/// be a heavier dependency than the thing it measures.
pub fn render_metrics(stats: &NodeStatsTable, raft: &dyn ClusterControl) -> String {
    let mut out = String::new();
    out.push_str("# HELP nimbus_scheduler_capacity_total Declared concurrency summed across known nodes.\n");
    out.push_str("# TYPE nimbus_scheduler_capacity_total gauge\n");
    out.push_str(&format!("nimbus_scheduler_capacity_total {}\n", stats.aggregate_capacity()));

    out.push_str("# HELP nimbus_scheduler_in_flight_total In-flight requests summed across known nodes.\n");
    out.push_str("# TYPE nimbus_scheduler_in_flight_total gauge\n");
    out.push_str(&format!("nimbus_scheduler_in_flight_total {}\n", stats.aggregate_in_flight()));

    out.push_str("# HELP nimbus_raft_term Current Raft term observed by this node.\n");
    out.push_str("# TYPE nimbus_raft_term gauge\n");
    out.push_str(&format!("nimbus_raft_term {}\n", raft.current_term()));

    out.push_str("# HELP nimbus_raft_commit_index Current Raft commit index observed by this node.\n");
    out.push_str("# TYPE nimbus_raft_commit_index gauge\n");
    out.push_str(&format!("nimbus_raft_commit_index {}\n", raft.commit_index()));

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recorder_resumes_the_chain_across_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("events.jsonl");

        {
            let recorder = FileAuditRecorder::open(&path).unwrap();
            recorder.record("alice", "models.pull", AuditOutcome::Allowed, None).await.unwrap();
        }

        let reopened = FileAuditRecorder::open(&path).unwrap();
        let tip_before = reopened.tip_hash().await;
        reopened.record("bob", "models.pull", AuditOutcome::Denied, Some("rbac".into())).await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: AuditEventV1 = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.sequence, 1);
        assert_eq!(second.prev_hash, tip_before);
    }

    #[test]
    fn missing_file_starts_at_genesis() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nonexistent.jsonl");
        let (tip, sequence) = FileAuditRecorder::read_tip(&path).unwrap();
        assert_eq!(tip, AuditEventV1::GENESIS_HASH);
        assert_eq!(sequence, 0);
    }
}
