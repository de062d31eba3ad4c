//! Feedback log
//!
//! Append-only record of how past query results were judged. Entries live in
//! a `DashMap` keyed by sequence number, so appends never block readers. An
//! optional JSON-lines file mirrors the log across runs.

use crate::error::{AgentError, Result};
use crate::prompt::Example;
use crate::query::QueryResult;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

pub const SUCCESS: &str = "success";
pub const FAILURE: &str = "failure";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub id: Uuid,
    pub result_id: Uuid,
    pub question: String,
    pub sql: String,
    pub execution_time_secs: f64,
    pub category: String,
    pub note: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedbackSummary {
    pub total: usize,
    pub success_rate: f64,
    /// Failure notes and how often each was reported.
    pub common_issues: BTreeMap<String, usize>,
}

pub struct FeedbackLog {
    entries: DashMap<u64, FeedbackRecord>,
    next_seq: AtomicU64,
    mirror: Option<(PathBuf, Mutex<()>)>,
}

impl Default for FeedbackLog {
    fn default() -> Self {
        Self::new()
    }
}

impl FeedbackLog {
    /// In-memory log.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next_seq: AtomicU64::new(0),
            mirror: None,
        }
    }

    /// Log mirrored to a JSON-lines file; records already in the file are loaded.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let log = Self {
            mirror: Some((path.clone(), Mutex::new(()))),
            ..Self::new()
        };

        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                for (line_no, line) in contents.lines().enumerate().filter(|(_, l)| !l.trim().is_empty()) {
                    match serde_json::from_str::<FeedbackRecord>(line) {
                        Ok(record) => log.insert(record),
                        Err(e) => warn!("Skipping malformed feedback line {} in {}: {}", line_no + 1, path.display(), e),
                    }
                }
                info!("Loaded {} feedback records from {}", log.len(), path.display());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(log)
    }

    fn insert(&self, record: FeedbackRecord) {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.entries.insert(seq, record);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a record for `result`. Only an empty category is rejected; a
    /// failing file mirror is logged and does not fail the call.
    pub async fn record(&self, result: &QueryResult, category: &str, note: &str) -> Result<()> {
        let category = category.trim();
        if category.is_empty() {
            return Err(AgentError::Input("feedback category cannot be empty".to_string()));
        }

        let record = FeedbackRecord {
            id: Uuid::new_v4(),
            result_id: result.id(),
            question: result.question().to_string(),
            sql: result.sql().to_string(),
            execution_time_secs: result.execution_time().as_secs_f64(),
            category: category.to_lowercase(),
            note: note.trim().to_string(),
            recorded_at: Utc::now(),
        };

        if let Some((path, lock)) = &self.mirror {
            let _guard = lock.lock().await;
            if let Err(e) = append_line(path, &record).await {
                warn!("Failed to mirror feedback to {}: {}", path.display(), e);
            }
        }

        info!("Recorded '{}' feedback for result {}", record.category, record.result_id);
        self.insert(record);
        Ok(())
    }

    /// All records in insertion order.
    pub fn snapshot(&self) -> Vec<FeedbackRecord> {
        let mut entries: Vec<(u64, FeedbackRecord)> =
            self.entries.iter().map(|e| (*e.key(), e.value().clone())).collect();
        entries.sort_by_key(|(seq, _)| *seq);
        entries.into_iter().map(|(_, record)| record).collect()
    }

    pub fn analyze(&self) -> FeedbackSummary {
        let records = self.snapshot();
        let successes = records.iter().filter(|r| r.category == SUCCESS).count();
        let mut common_issues = BTreeMap::new();
        for record in records.iter().filter(|r| r.category == FAILURE) {
            *common_issues.entry(record.note.clone()).or_insert(0) += 1;
        }
        FeedbackSummary {
            total: records.len(),
            success_rate: if records.is_empty() { 0.0 } else { successes as f64 / records.len() as f64 },
            common_issues,
        }
    }

    /// The most recent `limit` distinct successful statements.
    pub fn learning_examples(&self, limit: usize) -> Vec<Example> {
        let mut examples: Vec<Example> = Vec::new();
        for record in self.snapshot().into_iter().rev() {
            if examples.len() >= limit {
                break;
            }
            if record.category != SUCCESS || record.sql.is_empty() || examples.iter().any(|e| e.sql == record.sql) {
                continue;
            }
            examples.push(Example {
                question: record.question,
                sql: record.sql,
            });
        }
        examples.reverse();
        examples
    }
}

async fn append_line(path: &Path, record: &FeedbackRecord) -> Result<()> {
    let mut line = serde_json::to_string(record)?;
    line.push('\n');
    let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(path).await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn result(question: &str, sql: &str) -> QueryResult {
        QueryResult::success(question, sql.to_string(), vec![], Duration::from_millis(5), None)
    }

    #[tokio::test]
    async fn test_empty_category_is_rejected() {
        let log = FeedbackLog::new();
        let err = log.record(&result("q", "SELECT 1"), "  ", "note").await.unwrap_err();
        assert!(matches!(err, AgentError::Input(_)));
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn test_analysis_and_examples() {
        let log = FeedbackLog::new();
        log.record(&result("count customers", "SELECT COUNT(*) FROM customers"), "success", "").await.unwrap();
        log.record(&result("slow one", "SELECT * FROM orders"), "failure", "too slow").await.unwrap();
        log.record(&result("slow two", "SELECT * FROM orders o"), "FAILURE", "too slow").await.unwrap();
        log.record(&result("tidy", "SELECT 1"), "performance", "fine").await.unwrap();

        let summary = log.analyze();
        assert_eq!(summary.total, 4);
        assert!((summary.success_rate - 0.25).abs() < f64::EPSILON);
        assert_eq!(summary.common_issues.get("too slow"), Some(&2));

        let examples = log.learning_examples(5);
        assert_eq!(examples.len(), 1);
        assert_eq!(examples[0].question, "count customers");
    }

    #[tokio::test]
    async fn test_concurrent_appends_are_all_kept() {
        let log = Arc::new(FeedbackLog::new());
        let mut handles = Vec::new();
        for i in 0..20 {
            let log = Arc::clone(&log);
            handles.push(tokio::spawn(async move {
                log.record(&result(&format!("q{}", i), "SELECT 1"), "success", "").await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(log.snapshot().len(), 20);
    }

    #[tokio::test]
    async fn test_mirror_round_trips_through_file() {
        let path = std::env::temp_dir().join(format!("sql-agent-feedback-{}.jsonl", Uuid::new_v4()));
        {
            let log = FeedbackLog::open(&path).await.unwrap();
            log.record(&result("count customers", "SELECT COUNT(*) FROM customers"), "success", "ok")
                .await
                .unwrap();
        }
        let reopened = FeedbackLog::open(&path).await.unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.snapshot()[0].note, "ok");
        tokio::fs::remove_file(&path).await.unwrap();
    }
}
