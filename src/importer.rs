//! Data importer
//!
//! Loads records table by table in foreign-key dependency order. Foreign-key
//! cells may hold provisional keys (a parent's natural key, or the primary key
//! the input gave the parent row); they are swapped for the keys the database
//! generated for parents inserted earlier in the same run.
//!
//! Each table is one transaction. A failed table does not undo the tables
//! committed before it, so the caller always gets a per-table report.

use crate::db::{ColumnBinding, Database, Dialect};
use crate::error::{AgentError, ErrorKind, Result};
use crate::schema::{Column, Schema, Table, TypeFamily};
use crate::schema_generator::SampleData;
use crate::value::Value;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// One input row: column name to cell text, `None` for null.
pub type Record = IndexMap<String, Option<String>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableRecords {
    pub rows: Vec<Record>,
    /// Field whose value identifies a row to its children. It does not have
    /// to be a column of the table.
    #[serde(default)]
    pub natural_key: Option<String>,
}

impl TableRecords {
    pub fn new(rows: Vec<Record>) -> Self {
        Self { rows, natural_key: None }
    }

    pub fn with_natural_key(mut self, field: impl Into<String>) -> Self {
        self.natural_key = Some(field.into());
        self
    }
}

/// Raw records keyed by table name, in any order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRecords {
    tables: IndexMap<String, TableRecords>,
}

impl RawRecords {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, table: impl Into<String>, records: TableRecords) -> Self {
        self.tables.insert(table.into(), records);
        self
    }

    pub fn get(&self, table: &str) -> Option<&TableRecords> {
        self.tables
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(table))
            .map(|(_, records)| records)
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Split one denormalised CSV into per-table records.
    ///
    /// A column `col` of table `t` is read from header `col`, `t_col` (also
    /// with `t` singularised) or `col` without underscores. A header `t_name`
    /// is the natural key of `t`, and a foreign key to `t` is filled from it.
    /// Rows of a table some foreign key points at are kept once per distinct
    /// value set; rows of every other table are kept as they appear.
    pub fn from_flat(sample: &SampleData, schema: &Schema) -> Result<Self> {
        let header = |name: &str| sample.headers.iter().position(|h| h.eq_ignore_ascii_case(name));
        let natural_header = |table: &str| {
            name_prefixes(table)
                .iter()
                .find_map(|prefix| header(&format!("{}_name", prefix)))
        };

        let mut records = RawRecords::new();
        for table in schema.dependency_order()? {
            let mut sources: Vec<(String, usize)> = Vec::new();
            for column in table.columns.iter().filter(|c| !c.is_generated()) {
                let source = match table.foreign_key_for(&column.name) {
                    Some(fk) => natural_header(&fk.referenced_table),
                    None => {
                        let mut candidates = vec![column.name.clone()];
                        candidates.extend(
                            name_prefixes(&table.name)
                                .iter()
                                .map(|prefix| format!("{}_{}", prefix, column.name)),
                        );
                        candidates.push(column.name.replace('_', ""));
                        candidates.iter().find_map(|c| header(c))
                    }
                };
                if let Some(idx) = source {
                    sources.push((column.name.clone(), idx));
                }
            }
            if sources.is_empty() {
                continue;
            }

            let natural_key = match natural_header(&table.name) {
                Some(idx) => {
                    let mapped = sources.iter().find(|(_, source)| *source == idx).map(|(column, _)| column.clone());
                    Some(mapped.unwrap_or_else(|| {
                        sources.push((sample.headers[idx].clone(), idx));
                        sample.headers[idx].clone()
                    }))
                }
                None => None,
            };

            let referenced = schema.tables.iter().any(|t| {
                t.foreign_keys
                    .iter()
                    .any(|fk| fk.referenced_table.eq_ignore_ascii_case(&table.name))
            });
            let mut seen = HashSet::new();
            let mut rows = Vec::new();
            for row in &sample.rows {
                let cells: Vec<Option<String>> = sources.iter().map(|(_, idx)| row.get(*idx).cloned().flatten()).collect();
                if cells.iter().all(Option::is_none) || (referenced && !seen.insert(cells.clone())) {
                    continue;
                }
                rows.push(sources.iter().map(|(name, _)| name.clone()).zip(cells).collect());
            }

            records.tables.insert(table.name.clone(), TableRecords { rows, natural_key });
        }
        Ok(records)
    }
}

/// `customers` also matches `customer`, `categories` also `category`.
fn name_prefixes(table: &str) -> Vec<String> {
    let lower = table.to_lowercase();
    let singular = if let Some(stem) = lower.strip_suffix("ies") {
        Some(format!("{}y", stem))
    } else {
        lower.strip_suffix('s').map(str::to_string)
    };
    let mut prefixes = vec![lower.clone()];
    prefixes.extend(singular.filter(|s| !s.is_empty() && *s != lower));
    prefixes
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TableStatus {
    Imported { rows: usize },
    Failed { kind: ErrorKind, message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableImportOutcome {
    pub table: String,
    #[serde(flatten)]
    pub status: TableStatus,
}

/// Per-table outcome, in import order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImportReport {
    pub tables: Vec<TableImportOutcome>,
}

impl ImportReport {
    pub fn is_complete(&self) -> bool {
        self.tables.iter().all(|t| matches!(t.status, TableStatus::Imported { .. }))
    }

    pub fn rows_imported(&self) -> usize {
        self.tables
            .iter()
            .map(|t| match t.status {
                TableStatus::Imported { rows } => rows,
                TableStatus::Failed { .. } => 0,
            })
            .sum()
    }

    pub fn failures(&self) -> impl Iterator<Item = &TableImportOutcome> {
        self.tables.iter().filter(|t| matches!(t.status, TableStatus::Failed { .. }))
    }
}

/// Provisional key text to the parent's generated primary key.
type KeyMap = HashMap<String, Value>;

pub struct DataImporter {
    db: Arc<dyn Database>,
    timeout: Duration,
}

impl DataImporter {
    pub fn new(db: Arc<dyn Database>, timeout: Duration) -> Self {
        Self { db, timeout }
    }

    /// Import against the live schema. Unknown tables or columns fail the
    /// whole call before anything is inserted; failures after that are
    /// reported per table.
    pub async fn import(&self, records: &RawRecords) -> Result<ImportReport> {
        let live = self.db.fetch_schema().await?;
        check_against_schema(records, &live)?;

        let mut keys: HashMap<String, KeyMap> = HashMap::new();
        let mut report = ImportReport::default();
        for table in live.dependency_order()? {
            let Some(table_records) = records.get(&table.name) else {
                continue;
            };

            let status = match self.import_table(table, table_records, &keys).await {
                Ok((rows, generated)) => {
                    info!("Imported {} rows into {}", rows, table.name);
                    keys.insert(table.name.to_lowercase(), generated);
                    TableStatus::Imported { rows }
                }
                Err(e) => {
                    warn!("Import into {} failed: {}", table.name, e);
                    TableStatus::Failed {
                        kind: e.kind(),
                        message: e.to_string(),
                    }
                }
            };
            report.tables.push(TableImportOutcome {
                table: table.name.clone(),
                status,
            });
        }
        Ok(report)
    }

    async fn import_table(&self, table: &Table, records: &TableRecords, keys: &HashMap<String, KeyMap>) -> Result<(usize, KeyMap)> {
        let dialect = self.db.dialect();
        let columns: Vec<_> = table
            .columns
            .iter()
            .filter(|c| !generated_by_database(table, c, dialect) && records.rows.iter().any(|row| field(row, &c.name).is_some()))
            .collect();
        let bindings: Vec<ColumnBinding> = columns
            .iter()
            .map(|c| ColumnBinding {
                name: c.name.clone(),
                sql_type: c.data_type.clone(),
            })
            .collect();

        let mut rows = Vec::with_capacity(records.rows.len());
        for record in &records.rows {
            let mut values = Vec::with_capacity(columns.len());
            for column in &columns {
                let cell = field(record, &column.name).cloned().flatten();
                let value = match (cell, table.foreign_key_for(&column.name)) {
                    (Some(provisional), Some(fk)) => {
                        let parent = keys
                            .get(&fk.referenced_table.to_lowercase())
                            .and_then(|generated| generated.get(&provisional))
                            .ok_or_else(|| {
                                AgentError::UnresolvedReference(format!(
                                    "{}.{} = '{}' matches no imported row of {}",
                                    table.name, column.name, provisional, fk.referenced_table
                                ))
                            })?;
                        parent.to_text()
                    }
                    (Some(text), None) if dialect == Dialect::Sqlite && column.type_family() == Some(TypeFamily::Boolean) => {
                        Some(sqlite_bool(&text))
                    }
                    (cell, _) => cell,
                };
                values.push(value);
            }
            rows.push(values);
        }

        let key_column = table.primary_key().map(|c| c.name.as_str());
        let generated = self
            .db
            .insert_rows(&table.name, &bindings, &rows, key_column, self.timeout)
            .await?;

        let mut key_map = KeyMap::new();
        for (record, id) in records.rows.iter().zip(generated) {
            let natural = records.natural_key.as_deref().and_then(|k| field(record, k)).cloned().flatten();
            let supplied = key_column.and_then(|k| field(record, k)).cloned().flatten();
            for provisional in natural.into_iter().chain(supplied) {
                key_map.insert(provisional, id.clone());
            }
        }
        Ok((rows.len(), key_map))
    }
}

/// Serial columns, and on SQLite the single `INTEGER` primary key (a rowid alias).
fn generated_by_database(table: &Table, column: &Column, dialect: Dialect) -> bool {
    if column.is_generated() {
        return true;
    }
    dialect == Dialect::Sqlite
        && column.primary_key
        && column.data_type.trim().eq_ignore_ascii_case("INTEGER")
        && table.columns.iter().filter(|c| c.primary_key).count() == 1
}

fn field<'a>(record: &'a Record, name: &str) -> Option<&'a Option<String>> {
    record
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value)
}

fn sqlite_bool(text: &str) -> String {
    match text.trim().to_lowercase().as_str() {
        "true" | "t" | "yes" | "y" | "1" => "1".to_string(),
        "false" | "f" | "no" | "n" | "0" => "0".to_string(),
        _ => text.to_string(),
    }
}

fn check_against_schema(records: &RawRecords, schema: &Schema) -> Result<()> {
    for name in records.table_names() {
        let table = schema
            .table(name)
            .ok_or_else(|| AgentError::SchemaMismatch(format!("table '{}' does not exist", name)))?;
        let Some(table_records) = records.get(name) else {
            continue;
        };
        for record in &table_records.rows {
            for key in record.keys() {
                let is_natural_key = table_records.natural_key.as_deref().is_some_and(|k| k.eq_ignore_ascii_case(key));
                if table.column(key).is_none() && !is_natural_key {
                    return Err(AgentError::SchemaMismatch(format!(
                        "column '{}' does not exist in table '{}'",
                        key, table.name
                    )));
                }
            }
        }
    }
    Ok(())
}
