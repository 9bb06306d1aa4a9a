use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{ResultStore, StoreResult};
use crate::evaluator::fusion::FusionResult;

/// One line of the verdict log
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "lowercase")]
pub enum LogRecord {
    Verdict {
        transaction_id: String,
        logged_at: DateTime<Utc>,
        result: FusionResult,
    },
    Analysis {
        transaction_id: String,
        logged_at: DateTime<Utc>,
        analysis_type: String,
        metadata: serde_json::Value,
    },
}

/// Append-only JSON-lines result store with an in-memory index
pub struct JsonlResultStore {
    log_path: PathBuf,
    index: Mutex<HashMap<String, FusionResult>>,
}

impl JsonlResultStore {
    /// Opens (or creates) the log and rebuilds the index from it.
    pub fn open(log_path: impl AsRef<Path>) -> StoreResult<Self> {
        let log_path = log_path.as_ref().to_path_buf();

        // Ensure the log directory exists
        if let Some(dir) = log_path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }

        let mut index = HashMap::new();
        if log_path.exists() {
            let content = std::fs::read_to_string(&log_path)?;
            for (line_no, line) in content.lines().enumerate().filter(|(_, l)| !l.trim().is_empty()) {
                match serde_json::from_str::<LogRecord>(line) {
                    Ok(LogRecord::Verdict { transaction_id, result, .. }) => {
                        index.entry(transaction_id).or_insert(result);
                    }
                    Ok(LogRecord::Analysis { .. }) => {}
                    Err(e) => warn!(line = line_no + 1, error = %e, "Skipping unreadable verdict log line"),
                }
            }
            info!(path = %log_path.display(), verdicts = index.len(), "Verdict log loaded");
        }

        Ok(Self {
            log_path,
            index: Mutex::new(index),
        })
    }

    pub fn path(&self) -> &Path {
        &self.log_path
    }

    fn append(&self, record: &LogRecord) -> StoreResult<()> {
        let json = serde_json::to_string(record)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;

        file.write_all(json.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(())
    }
}

#[async_trait]
impl ResultStore for JsonlResultStore {
    async fn put(&self, transaction_id: &str, result: &FusionResult) -> StoreResult<()> {
        // Held across the append so lines from concurrent runs never interleave
        let mut index = self.index.lock().await;
        if index.contains_key(transaction_id) {
            return Ok(());
        }

        self.append(&LogRecord::Verdict {
            transaction_id: transaction_id.to_string(),
            logged_at: Utc::now(),
            result: result.clone(),
        })?;
        index.insert(transaction_id.to_string(), result.clone());

        Ok(())
    }

    async fn get(&self, transaction_id: &str) -> StoreResult<Option<FusionResult>> {
        Ok(self.index.lock().await.get(transaction_id).cloned())
    }

    async fn put_analysis(
        &self,
        transaction_id: &str,
        analysis_type: &str,
        metadata: serde_json::Value,
    ) -> StoreResult<()> {
        let _guard = self.index.lock().await;
        self.append(&LogRecord::Analysis {
            transaction_id: transaction_id.to_string(),
            logged_at: Utc::now(),
            analysis_type: analysis_type.to_string(),
            metadata,
        })
    }
}
