//! Schema generator
//!
//! Profiles a sample dataset, asks the completion service for a schema in a
//! fixed JSON notation, and parses the answer into the schema model. Nothing
//! is applied here.

use crate::db::Dialect;
use crate::error::{AgentError, Result};
use crate::llm::{CompletionClient, Prompt};
use crate::schema::{Column, ForeignKey, Schema, Table};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Rows kept from a sample file.
pub const MAX_SAMPLE_ROWS: usize = 100;
const SAMPLE_VALUES_PER_COLUMN: usize = 5;

lazy_static! {
    static ref JSON_FENCE: Regex = Regex::new(r"(?s)```(?:json)?[^\n]*\n(.*?)```").unwrap();
    static ref FK_PAREN: Regex = Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_]*)\s*\(\s*([A-Za-z_][A-Za-z0-9_]*)\s*\)\s*$").unwrap();
    static ref FK_DOT: Regex = Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_]*)\.([A-Za-z_][A-Za-z0-9_]*)\s*$").unwrap();
    static ref FK_TABLE: Regex = Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_]*)\s*$").unwrap();
}

/// Tabular sample: headers plus up to [`MAX_SAMPLE_ROWS`] rows. Empty cells
/// are nulls.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleData {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
    /// Rows in the source, including those beyond the sample.
    pub total_rows: usize,
}

impl SampleData {
    pub fn from_csv_reader<R: Read>(reader: R) -> Result<Self> {
        Self::read_csv(reader, MAX_SAMPLE_ROWS)
    }

    pub fn from_csv_path(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        Self::from_csv_reader(file)
    }

    /// Every row of a CSV file, for import rather than profiling.
    pub fn load_csv_path(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        Self::read_csv(file, usize::MAX)
    }

    fn read_csv<R: Read>(reader: R, max_rows: usize) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
        let headers: Vec<String> = reader.headers()?.iter().map(|h| h.trim().to_string()).collect();
        if headers.is_empty() || headers.iter().all(|h| h.is_empty()) {
            return Err(AgentError::Input("sample has no header row".to_string()));
        }

        let mut rows = Vec::new();
        let mut total_rows = 0;
        for record in reader.records() {
            let record = record?;
            total_rows += 1;
            if rows.len() < max_rows {
                rows.push(
                    (0..headers.len())
                        .map(|i| record.get(i).map(str::trim).filter(|v| !v.is_empty()).map(str::to_string))
                        .collect(),
                );
            }
        }
        Ok(Self { headers, rows, total_rows })
    }

    pub fn column_values(&self, idx: usize) -> impl Iterator<Item = Option<&str>> {
        self.rows.iter().map(move |row| row.get(idx).and_then(|v| v.as_deref()))
    }

    pub fn profile(&self) -> SampleProfile {
        SampleProfile {
            total_rows: self.total_rows,
            columns: self
                .headers
                .iter()
                .enumerate()
                .map(|(idx, name)| profile_column(name, self.column_values(idx)))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Integer,
    Decimal,
    Boolean,
    Date,
    Timestamp,
    Text,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnProfile {
    pub name: String,
    pub sample_values: Vec<String>,
    pub unique_count: usize,
    pub null_count: usize,
    pub inferred: ValueKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleProfile {
    pub total_rows: usize,
    pub columns: Vec<ColumnProfile>,
}

fn profile_column<'a>(name: &str, values: impl Iterator<Item = Option<&'a str>>) -> ColumnProfile {
    let values: Vec<Option<&str>> = values.collect();
    let present: Vec<&str> = values.iter().flatten().copied().collect();
    let inferred = infer_kind(&present);

    let numbers: Vec<f64> = match inferred {
        ValueKind::Integer | ValueKind::Decimal => present
            .iter()
            .filter_map(|v| v.parse::<Decimal>().ok())
            .filter_map(|d| d.to_f64())
            .collect(),
        _ => Vec::new(),
    };

    ColumnProfile {
        name: name.to_string(),
        sample_values: present.iter().take(SAMPLE_VALUES_PER_COLUMN).map(|v| v.to_string()).collect(),
        unique_count: present.iter().collect::<HashSet<_>>().len(),
        null_count: values.len() - present.len(),
        inferred,
        min: numbers.iter().copied().reduce(f64::min),
        max: numbers.iter().copied().reduce(f64::max),
    }
}

fn infer_kind(values: &[&str]) -> ValueKind {
    if values.is_empty() {
        return ValueKind::Text;
    }
    let all = |check: fn(&str) -> bool| values.iter().all(|v| check(v));
    if all(|v| v.parse::<i64>().is_ok()) {
        ValueKind::Integer
    } else if all(|v| v.parse::<Decimal>().is_ok()) {
        ValueKind::Decimal
    } else if all(|v| matches!(v.to_lowercase().as_str(), "true" | "false" | "yes" | "no" | "t" | "f")) {
        ValueKind::Boolean
    } else if all(|v| NaiveDate::parse_from_str(v, "%Y-%m-%d").is_ok()) {
        ValueKind::Date
    } else if all(is_timestamp) {
        ValueKind::Timestamp
    } else {
        ValueKind::Text
    }
}

fn is_timestamp(value: &str) -> bool {
    DateTime::parse_from_rfc3339(value).is_ok()
        || NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S").is_ok()
        || NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S").is_ok()
}

const SCHEMA_SYSTEM_PROMPT: &str = r#"You are a database designer. You turn sample data into a normalized relational schema.

RULES:
- Answer with ONE JSON object inside a ```json fenced block and nothing else
- Every table has exactly one primary key column
- Reference other tables with "foreign_key": "table(column)"
- Use plain snake_case identifiers
- Allowed types: SERIAL, INTEGER, BIGINT, NUMERIC(p,s), REAL, TEXT, VARCHAR(n), BOOLEAN, DATE, TIMESTAMP, JSONB, UUID
- Order tables so referenced tables come first; never create circular references"#;

const SCHEMA_NOTATION: &str = r#"OUTPUT FORMAT:
```json
{
  "tables": [
    {
      "table_name": "customers",
      "description": "One row per customer",
      "columns": [
        {"name": "customer_id", "data_type": "SERIAL", "primary_key": true, "nullable": false},
        {"name": "customer_name", "data_type": "VARCHAR(100)", "nullable": false, "description": "Natural key"}
      ]
    },
    {
      "table_name": "orders",
      "columns": [
        {"name": "order_id", "data_type": "SERIAL", "primary_key": true, "nullable": false},
        {"name": "customer_id", "data_type": "INTEGER", "foreign_key": "customers(customer_id)"}
      ]
    }
  ]
}
```"#;

#[derive(Debug, Deserialize)]
struct GeneratedSchema {
    tables: Vec<GeneratedTable>,
}

#[derive(Debug, Deserialize)]
struct GeneratedTable {
    #[serde(alias = "name")]
    table_name: String,
    #[serde(default)]
    description: Option<String>,
    columns: Vec<GeneratedColumn>,
}

#[derive(Debug, Deserialize)]
struct GeneratedColumn {
    name: String,
    #[serde(alias = "type")]
    data_type: String,
    #[serde(default)]
    nullable: Option<bool>,
    #[serde(default)]
    primary_key: bool,
    #[serde(default)]
    foreign_key: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

pub struct SchemaGenerator {
    client: CompletionClient,
    dialect: Dialect,
}

impl SchemaGenerator {
    pub fn new(client: CompletionClient, dialect: Dialect) -> Self {
        Self { client, dialect }
    }

    pub async fn generate(&self, sample: &SampleData, description: Option<&str>, timeout: Duration) -> Result<Schema> {
        let prompt = self.build_prompt(sample, description)?;
        let raw = self.client.complete(&prompt, timeout).await?;
        let schema = parse_schema_response(&raw)?;
        info!(
            "Generated schema with {} tables: {}",
            schema.tables.len(),
            schema.tables.iter().map(|t| t.name.as_str()).join(", ")
        );
        Ok(schema)
    }

    pub fn build_prompt(&self, sample: &SampleData, description: Option<&str>) -> Result<Prompt> {
        let analysis = serde_json::to_string_pretty(&sample.profile())?;
        let mut user = format!(
            "TARGET DATABASE: {}\n\nDATA ANALYSIS:\n{}",
            self.dialect.name(),
            analysis
        );
        if let Some(description) = description.map(str::trim).filter(|d| !d.is_empty()) {
            user.push_str(&format!("\n\nINTENDED USE:\n{}", description));
        }
        user.push_str("\n\n");
        user.push_str(SCHEMA_NOTATION);
        debug!("Schema prompt covers {} columns", sample.headers.len());
        Ok(Prompt::new(SCHEMA_SYSTEM_PROMPT, user))
    }
}

/// Parse the JSON schema notation out of raw model output.
pub fn parse_schema_response(raw: &str) -> Result<Schema> {
    let json = JSON_FENCE
        .captures(raw)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
        .or_else(|| {
            let start = raw.find('{')?;
            let end = raw.rfind('}')?;
            (start < end).then(|| &raw[start..=end])
        })
        .ok_or_else(|| AgentError::SchemaParse("no JSON schema in model output".to_string()))?;

    let generated: GeneratedSchema =
        serde_json::from_str(json).map_err(|e| AgentError::SchemaParse(format!("malformed schema notation: {}", e)))?;

    let mut tables = Vec::with_capacity(generated.tables.len());
    for table in generated.tables {
        let mut columns = Vec::with_capacity(table.columns.len());
        let mut foreign_keys = Vec::new();
        for column in table.columns {
            if let Some(target) = column.foreign_key.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
                foreign_keys.push(parse_foreign_key(&column.name, target)?);
            }
            columns.push(Column {
                nullable: !column.primary_key && column.nullable.unwrap_or(true),
                primary_key: column.primary_key,
                default: None,
                description: column.description.filter(|d| !d.trim().is_empty()),
                data_type: column.data_type.trim().to_string(),
                name: column.name.trim().to_string(),
            });
        }

        match columns.iter().filter(|c| c.primary_key).count() {
            1 => {}
            0 => return Err(AgentError::SchemaParse(format!("table '{}' has no primary key", table.table_name))),
            n => {
                return Err(AgentError::SchemaParse(format!(
                    "table '{}' declares {} primary key columns",
                    table.table_name, n
                )))
            }
        }

        tables.push(Table {
            name: table.table_name.trim().to_string(),
            columns,
            foreign_keys,
            description: table.description.filter(|d| !d.trim().is_empty()),
        });
    }

    resolve_bare_references(&mut tables);
    let schema = Schema::new(tables);
    schema.validate()?;
    Ok(schema)
}

fn parse_foreign_key(column: &str, target: &str) -> Result<ForeignKey> {
    let caps = FK_PAREN
        .captures(target)
        .or_else(|| FK_DOT.captures(target))
        .or_else(|| FK_TABLE.captures(target))
        .ok_or_else(|| AgentError::SchemaParse(format!("malformed foreign key '{}' on column '{}'", target, column)))?;
    Ok(ForeignKey {
        column: column.trim().to_string(),
        referenced_table: caps[1].to_string(),
        referenced_column: caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_default(),
    })
}

/// `"foreign_key": "customers"` points at the referenced table's primary key.
fn resolve_bare_references(tables: &mut [Table]) {
    let keys: Vec<(String, String)> = tables
        .iter()
        .filter_map(|t| t.primary_key().map(|c| (t.name.to_lowercase(), c.name.clone())))
        .collect();
    for table in tables.iter_mut() {
        for fk in table.foreign_keys.iter_mut().filter(|fk| fk.referenced_column.is_empty()) {
            if let Some((_, pk)) = keys.iter().find(|(t, _)| *t == fk.referenced_table.to_lowercase()) {
                fk.referenced_column = pk.clone();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{CompletionProvider, ProviderFailure};
    use crate::retry::RetryPolicy;
    use async_trait::async_trait;
    use std::sync::Arc;

    const CSV: &str = "customer_name,order_total,ordered_on,vip\nAda,10.50,2024-01-02,true\nGrace,7,2024-01-03,false\nAda,,2024-02-01,true\n";

    const RESPONSE: &str = r#"Here is the schema:
```json
{"tables": [
  {"table_name": "customers", "description": "People who order",
   "columns": [
     {"name": "customer_id", "data_type": "SERIAL", "primary_key": true},
     {"name": "customer_name", "data_type": "VARCHAR(100)", "nullable": false}
   ]},
  {"table_name": "orders",
   "columns": [
     {"name": "order_id", "data_type": "SERIAL", "primary_key": true},
     {"name": "customer_id", "data_type": "INTEGER", "foreign_key": "customers(customer_id)"},
     {"name": "order_total", "data_type": "NUMERIC(10,2)"}
   ]}
]}
```"#;

    struct Fixed(&'static str);

    #[async_trait]
    impl CompletionProvider for Fixed {
        async fn complete(&self, _prompt: &Prompt) -> std::result::Result<String, ProviderFailure> {
            Ok(self.0.to_string())
        }
    }

    #[test]
    fn test_profile_infers_kinds_and_counts() {
        let sample = SampleData::from_csv_reader(CSV.as_bytes()).unwrap();
        assert_eq!(sample.total_rows, 3);
        let profile = sample.profile();

        let name = &profile.columns[0];
        assert_eq!(name.inferred, ValueKind::Text);
        assert_eq!(name.unique_count, 2);

        let total = &profile.columns[1];
        assert_eq!(total.inferred, ValueKind::Decimal);
        assert_eq!(total.null_count, 1);
        assert_eq!(total.min, Some(7.0));
        assert_eq!(total.max, Some(10.5));

        assert_eq!(profile.columns[2].inferred, ValueKind::Date);
        assert_eq!(profile.columns[3].inferred, ValueKind::Boolean);
    }

    #[test]
    fn test_parses_notation() {
        let schema = parse_schema_response(RESPONSE).unwrap();
        assert_eq!(schema.tables.len(), 2);
        let orders = schema.table("orders").unwrap();
        assert_eq!(orders.foreign_keys[0].referenced_table, "customers");
        assert_eq!(orders.foreign_keys[0].referenced_column, "customer_id");
        assert!(!schema.table("customers").unwrap().column("customer_id").unwrap().nullable);
        assert_eq!(schema.table("customers").unwrap().description.as_deref(), Some("People who order"));
    }

    #[test]
    fn test_rejects_malformed_notation() {
        let missing_pk = r#"{"tables": [{"table_name": "t", "columns": [{"name": "a", "data_type": "TEXT"}]}]}"#;
        assert!(matches!(parse_schema_response(missing_pk), Err(AgentError::SchemaParse(_))));

        let dangling = r#"{"tables": [{"table_name": "t", "columns": [
            {"name": "id", "data_type": "SERIAL", "primary_key": true},
            {"name": "u_id", "data_type": "INTEGER", "foreign_key": "users(id)"}]}]}"#;
        assert!(matches!(parse_schema_response(dangling), Err(AgentError::SchemaParse(_))));

        let duplicate = r#"{"tables": [
            {"table_name": "t", "columns": [{"name": "id", "data_type": "SERIAL", "primary_key": true}]},
            {"table_name": "t", "columns": [{"name": "id", "data_type": "SERIAL", "primary_key": true}]}]}"#;
        assert!(matches!(parse_schema_response(duplicate), Err(AgentError::SchemaParse(_))));

        assert!(matches!(parse_schema_response("no schema here"), Err(AgentError::SchemaParse(_))));
    }

    #[test]
    fn test_bare_table_reference_points_at_primary_key() {
        let raw = r#"{"tables": [
            {"table_name": "users", "columns": [{"name": "user_id", "data_type": "SERIAL", "primary_key": true}]},
            {"table_name": "posts", "columns": [
                {"name": "post_id", "data_type": "SERIAL", "primary_key": true},
                {"name": "author", "data_type": "INTEGER", "foreign_key": "users"}]}]}"#;
        let schema = parse_schema_response(raw).unwrap();
        assert_eq!(schema.table("posts").unwrap().foreign_keys[0].referenced_column, "user_id");
    }

    #[tokio::test]
    async fn test_generate_round_trip() {
        let client = CompletionClient::new(Arc::new(Fixed(RESPONSE)), RetryPolicy::none());
        let generator = SchemaGenerator::new(client, Dialect::Postgres);
        let sample = SampleData::from_csv_reader(CSV.as_bytes()).unwrap();

        let prompt = generator.build_prompt(&sample, Some("track orders")).unwrap();
        assert!(prompt.user.contains("\"customer_name\""));
        assert!(prompt.user.contains("INTENDED USE:\ntrack orders"));

        let schema = generator.generate(&sample, None, Duration::from_secs(1)).await.unwrap();
        assert!(schema.has_table("orders"));
    }
}
