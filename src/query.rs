//! Query request and result types, with table/JSON/CSV rendering.

use crate::error::{AgentError, ErrorKind, Result, ValidationRule};
use crate::value::{Row, Value};
use chrono::{DateTime, Utc};
use indexmap::IndexSet;
use itertools::Itertools;
use serde::{Serialize, Serializer};
use std::time::Duration;
use uuid::Uuid;

/// A natural-language question plus caller options. Built once, never mutated.
#[derive(Debug, Clone, Serialize)]
pub struct QueryRequest {
    question: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "serialize_opt_secs")]
    timeout: Option<Duration>,
    explain: bool,
}

impl QueryRequest {
    pub fn new(question: impl Into<String>) -> Result<Self> {
        let question = question.into();
        let trimmed = question.trim();
        if trimmed.is_empty() {
            return Err(AgentError::Input("question cannot be empty".to_string()));
        }
        Ok(Self {
            question: trimmed.to_string(),
            context: None,
            limit: None,
            timeout: None,
            explain: false,
        })
    }

    pub fn with_limit(self, limit: u64) -> Result<Self> {
        if limit == 0 {
            return Err(AgentError::Input("result limit must be a positive integer".to_string()));
        }
        Ok(Self {
            limit: Some(limit),
            ..self
        })
    }

    pub fn with_timeout_secs(self, secs: f64) -> Result<Self> {
        if !secs.is_finite() || secs <= 0.0 {
            return Err(AgentError::Input(format!("timeout must be a positive number of seconds, got {}", secs)));
        }
        let timeout = Duration::try_from_secs_f64(secs)
            .map_err(|e| AgentError::Input(format!("timeout of {} seconds is out of range: {}", secs, e)))?;
        Ok(Self {
            timeout: Some(timeout),
            ..self
        })
    }

    pub fn with_explanation(self, explain: bool) -> Self {
        Self { explain, ..self }
    }

    pub fn with_context(self, context: impl Into<String>) -> Self {
        let context = context.into();
        Self {
            context: if context.trim().is_empty() { None } else { Some(context) },
            ..self
        }
    }

    pub fn question(&self) -> &str {
        &self.question
    }

    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn explain(&self) -> bool {
        self.explain
    }
}

/// Typed failure carried by a [`QueryResult`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryError {
    pub kind: ErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<ValidationRule>,
    pub message: String,
}

impl From<&AgentError> for QueryError {
    fn from(err: &AgentError) -> Self {
        Self {
            kind: err.kind(),
            rule: err.violated_rule(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
    Csv,
}

impl std::str::FromStr for OutputFormat {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "table" => Ok(OutputFormat::Table),
            "json" => Ok(OutputFormat::Json),
            "csv" => Ok(OutputFormat::Csv),
            other => Err(AgentError::Input(format!("unknown output format '{}'", other))),
        }
    }
}

/// Outcome of one query request. Produced once, read-only afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    id: Uuid,
    question: String,
    sql: String,
    rows: Vec<Row>,
    #[serde(rename = "execution_time_secs", serialize_with = "serialize_secs")]
    execution_time: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    explanation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<QueryError>,
    created_at: DateTime<Utc>,
}

impl QueryResult {
    pub(crate) fn success(
        question: &str,
        sql: String,
        rows: Vec<Row>,
        execution_time: Duration,
        explanation: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            question: question.to_string(),
            sql,
            rows,
            execution_time,
            explanation,
            error: None,
            created_at: Utc::now(),
        }
    }

    pub(crate) fn failure(question: &str, sql: Option<String>, execution_time: Duration, error: &AgentError) -> Self {
        Self {
            id: Uuid::new_v4(),
            question: question.to_string(),
            sql: sql.unwrap_or_default(),
            rows: Vec::new(),
            execution_time,
            explanation: None,
            error: Some(QueryError::from(error)),
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn question(&self) -> &str {
        &self.question
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn execution_time(&self) -> Duration {
        self.execution_time
    }

    pub fn explanation(&self) -> Option<&str> {
        self.explanation.as_deref()
    }

    pub fn error(&self) -> Option<&QueryError> {
        self.error.as_ref()
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Column names in first-seen order across all rows.
    pub fn columns(&self) -> Vec<&str> {
        let columns: IndexSet<&str> = self
            .rows
            .iter()
            .flat_map(|row| row.keys().map(|k| k.as_str()))
            .collect();
        columns.into_iter().collect()
    }

    pub fn format(&self, format: OutputFormat) -> Result<String> {
        match format {
            OutputFormat::Table => Ok(self.to_table()),
            OutputFormat::Json => Ok(serde_json::to_string_pretty(&self.to_json())?),
            OutputFormat::Csv => self.to_csv(),
        }
    }

    pub fn to_table(&self) -> String {
        if self.rows.is_empty() {
            return "No results found.".to_string();
        }
        let columns = self.columns();
        let cells: Vec<Vec<String>> = self
            .rows
            .iter()
            .map(|row| columns.iter().map(|c| cell_text(row.get(*c))).collect())
            .collect();

        let widths: Vec<usize> = columns
            .iter()
            .enumerate()
            .map(|(idx, name)| {
                cells
                    .iter()
                    .map(|row| row[idx].chars().count())
                    .chain(std::iter::once(name.chars().count()))
                    .max()
                    .unwrap_or(0)
            })
            .collect();

        let header = columns
            .iter()
            .zip(&widths)
            .map(|(name, width)| format!("{:<width$}", name, width = *width))
            .join(" | ");
        let separator = "-".repeat(header.chars().count());
        let body = cells.iter().map(|row| {
            row.iter()
                .zip(&widths)
                .map(|(cell, width)| format!("{:<width$}", cell, width = *width))
                .join(" | ")
        });

        std::iter::once(header)
            .chain(std::iter::once(separator))
            .chain(body)
            .join("\n")
    }

    /// Rows as a JSON array of objects.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Array(
            self.rows
                .iter()
                .map(|row| {
                    serde_json::Value::Object(row.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
                })
                .collect(),
        )
    }

    pub fn to_csv(&self) -> Result<String> {
        let columns = self.columns();
        let mut writer = csv::Writer::from_writer(Vec::new());
        if !columns.is_empty() {
            writer.write_record(&columns)?;
        }
        for row in &self.rows {
            writer.write_record(columns.iter().map(|c| match row.get(*c) {
                None | Some(Value::Null) => String::new(),
                Some(value) => value.to_string(),
            }))?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| AgentError::Csv(e.to_string()))?;
        String::from_utf8(bytes).map_err(|e| AgentError::Csv(e.to_string()))
    }
}

fn cell_text(value: Option<&Value>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn serialize_secs<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

fn serialize_opt_secs<S: Serializer>(d: &Option<Duration>, s: S) -> std::result::Result<S::Ok, S::Error> {
    match d {
        Some(d) => s.serialize_f64(d.as_secs_f64()),
        None => s.serialize_none(),
    }
}
