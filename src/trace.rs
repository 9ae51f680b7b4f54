use std::path::PathBuf;

use anyhow::Result;
use serde::Serialize;
use serde_json as json;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::machine::state::MachineState;

/// One line of the session trace. Transitions come from the coordinator;
/// execution entries are whatever the page side reported.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TraceEntry {
    Transition {
        timestamp_ms: u64,
        session_id: Option<String>,
        trigger: String,
        from: MachineState,
        to: MachineState,
        step_index: usize,
    },
    Execution {
        timestamp_ms: u64,
        session_id: Option<String>,
        entry: json::Value,
    },
}

/// Appends trace entries to `<dir>/walkthrough-trace.jsonl`. Writes are
/// fire-and-forget from the caller's point of view: errors are logged
/// and never interrupt a dispatch.
pub struct TraceWriter {
    trace_file: File,
    path: PathBuf,
}

impl TraceWriter {
    pub async fn create(directory: PathBuf) -> Result<Self> {
        tokio::fs::create_dir_all(&directory).await?;
        let path = directory.join("walkthrough-trace.jsonl");
        log::info!("writing session trace to {}", path.display());
        let trace_file = File::options()
            .append(true)
            .create(true)
            .open(&path)
            .await?;
        Ok(TraceWriter { trace_file, path })
    }

    pub async fn append(&mut self, entry: &TraceEntry) {
        let result: Result<()> = async {
            self.trace_file
                .write_all(json::to_string(entry)?.as_bytes())
                .await?;
            self.trace_file.write_u8(b'\n').await?;
            Ok(())
        }
        .await;
        if let Err(error) = result {
            log::warn!(
                "dropping trace entry for {}: {}",
                self.path.display(),
                error
            );
        }
    }
}
