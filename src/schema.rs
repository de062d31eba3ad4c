//! Schema model
//!
//! Tables, columns and foreign keys as plain data, plus the structural checks
//! and the foreign-key dependency order shared by the applier and the importer.

use crate::error::{AgentError, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

lazy_static! {
    static ref IDENTIFIER: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
    static ref TYPE_SHAPE: Regex =
        Regex::new(r"^[A-Za-z][A-Za-z0-9 ]*(\(\s*\d+\s*(,\s*\d+\s*)?\))?(\s*\[\])?$").unwrap();
    static ref TRAILING_CAST: Regex = Regex::new(r"(::[A-Za-z][A-Za-z0-9 ]*(\(\s*\d+\s*(,\s*\d+\s*)?\))?)+$").unwrap();
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    #[serde(default = "default_true")]
    pub nullable: bool,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
            primary_key: false,
            default: None,
            description: None,
        }
    }

    pub fn primary(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn type_family(&self) -> Option<TypeFamily> {
        TypeFamily::parse(&self.data_type)
    }

    /// Values for this column are produced by the database (serial types).
    pub fn is_generated(&self) -> bool {
        let upper = self.data_type.trim().to_uppercase();
        upper.ends_with("SERIAL") || self.default.as_deref().is_some_and(|d| d.to_lowercase().starts_with("nextval("))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub column: String,
    pub referenced_table: String,
    pub referenced_column: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Table {
    pub fn new(name: impl Into<String>, columns: Vec<Column>) -> Self {
        Self {
            name: name.into(),
            columns,
            foreign_keys: Vec::new(),
            description: None,
        }
    }

    pub fn with_foreign_key(
        mut self,
        column: impl Into<String>,
        referenced_table: impl Into<String>,
        referenced_column: impl Into<String>,
    ) -> Self {
        self.foreign_keys.push(ForeignKey {
            column: column.into(),
            referenced_table: referenced_table.into(),
            referenced_column: referenced_column.into(),
        });
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Case-insensitive column lookup.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn primary_key(&self) -> Option<&Column> {
        self.columns.iter().find(|c| c.primary_key)
    }

    pub fn foreign_key_for(&self, column: &str) -> Option<&ForeignKey> {
        self.foreign_keys.iter().find(|fk| fk.column.eq_ignore_ascii_case(column))
    }

    /// Lower-cased column names mapped to their type family. Two tables with
    /// the same signature are considered structurally identical.
    pub fn signature(&self) -> BTreeMap<String, Option<TypeFamily>> {
        self.columns
            .iter()
            .map(|c| (c.name.to_lowercase(), c.type_family()))
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub tables: Vec<Table>,
}

impl Schema {
    pub fn new(tables: Vec<Table>) -> Self {
        Self { tables }
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Case-insensitive table lookup.
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name.eq_ignore_ascii_case(name))
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.table(name).is_some()
    }

    /// Structural checks: identifiers, duplicates, empty tables, column types,
    /// and foreign keys pointing at existing tables and columns.
    pub fn validate(&self) -> Result<()> {
        let mut table_names = HashSet::new();
        for table in &self.tables {
            check_identifier("table", &table.name)?;
            if !table_names.insert(table.name.to_lowercase()) {
                return Err(AgentError::SchemaParse(format!("duplicate table name '{}'", table.name)));
            }
            if table.columns.is_empty() {
                return Err(AgentError::SchemaParse(format!("table '{}' has no columns", table.name)));
            }

            let mut column_names = HashSet::new();
            for column in &table.columns {
                check_identifier("column", &column.name)?;
                if !column_names.insert(column.name.to_lowercase()) {
                    return Err(AgentError::SchemaParse(format!(
                        "duplicate column '{}' in table '{}'",
                        column.name, table.name
                    )));
                }
                if !TYPE_SHAPE.is_match(column.data_type.trim()) || column.type_family().is_none() {
                    return Err(AgentError::SchemaParse(format!(
                        "unknown column type '{}' for {}.{}",
                        column.data_type, table.name, column.name
                    )));
                }
                if let Some(default) = &column.default {
                    check_default(default).map_err(|reason| {
                        AgentError::SchemaParse(format!(
                            "unsupported default for {}.{}: {}",
                            table.name, column.name, reason
                        ))
                    })?;
                }
            }
        }

        for table in &self.tables {
            for fk in &table.foreign_keys {
                if table.column(&fk.column).is_none() {
                    return Err(AgentError::SchemaParse(format!(
                        "foreign key column '{}' does not exist in table '{}'",
                        fk.column, table.name
                    )));
                }
                let target = self.table(&fk.referenced_table).ok_or_else(|| {
                    AgentError::SchemaParse(format!(
                        "dangling foreign key {}.{} -> {}",
                        table.name, fk.column, fk.referenced_table
                    ))
                })?;
                if target.column(&fk.referenced_column).is_none() {
                    return Err(AgentError::SchemaParse(format!(
                        "dangling foreign key {}.{} -> {}.{}",
                        table.name, fk.column, fk.referenced_table, fk.referenced_column
                    )));
                }
            }
        }

        Ok(())
    }

    /// Tables ordered so that every table comes after the tables it references.
    /// Ties keep schema order. Fails with `CyclicSchema` when no order exists
    /// (a self-reference counts as a cycle).
    pub fn dependency_order(&self) -> Result<Vec<&Table>> {
        let dependencies: Vec<HashSet<usize>> = self
            .tables
            .iter()
            .map(|table| {
                table
                    .foreign_keys
                    .iter()
                    .filter_map(|fk| {
                        self.tables
                            .iter()
                            .position(|t| t.name.eq_ignore_ascii_case(&fk.referenced_table))
                    })
                    .collect()
            })
            .collect();

        let mut placed = vec![false; self.tables.len()];
        let mut order = Vec::with_capacity(self.tables.len());

        while order.len() < self.tables.len() {
            let next = (0..self.tables.len())
                .find(|&idx| !placed[idx] && dependencies[idx].iter().all(|&dep| dep != idx && placed[dep]));
            match next {
                Some(idx) => {
                    placed[idx] = true;
                    order.push(&self.tables[idx]);
                }
                None => {
                    let stuck: Vec<&str> = self
                        .tables
                        .iter()
                        .enumerate()
                        .filter(|(idx, _)| !placed[*idx])
                        .map(|(_, t)| t.name.as_str())
                        .collect();
                    return Err(AgentError::CyclicSchema(format!(
                        "foreign keys form a cycle among: {}",
                        stuck.join(", ")
                    )));
                }
            }
        }

        Ok(order)
    }

    /// Text rendering used in prompts.
    pub fn describe(&self) -> String {
        let mut lines = Vec::new();
        for table in &self.tables {
            lines.push(format!("Table: {}", table.name));
            if let Some(description) = &table.description {
                lines.push(format!("Description: {}", description));
            }
            lines.push("Columns:".to_string());
            for column in &table.columns {
                let mut line = format!("  - {} ({})", column.name, column.data_type);
                if !column.nullable {
                    line.push_str(" NOT NULL");
                }
                if column.primary_key {
                    line.push_str(" PRIMARY KEY");
                }
                if let Some(description) = &column.description {
                    line.push_str(&format!(" -- {}", description));
                }
                lines.push(line);
            }
            if !table.foreign_keys.is_empty() {
                lines.push("Foreign Keys:".to_string());
                for fk in &table.foreign_keys {
                    lines.push(format!("  - {} -> {}.{}", fk.column, fk.referenced_table, fk.referenced_column));
                }
            }
            lines.push(String::new());
        }
        lines.join("\n")
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// Coarse type classes used to compare declared and introspected types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TypeFamily {
    Integer,
    Decimal,
    Float,
    Text,
    Boolean,
    Timestamp,
    Date,
    Time,
    Json,
    Uuid,
}

impl TypeFamily {
    pub fn parse(data_type: &str) -> Option<TypeFamily> {
        let upper = data_type.trim().to_uppercase();
        let base = upper
            .split('(')
            .next()
            .unwrap_or_default()
            .trim_end_matches("[]")
            .trim();

        let family = match base {
            "INT" | "INT2" | "INT4" | "INT8" | "INTEGER" | "SMALLINT" | "BIGINT" | "SERIAL"
            | "SMALLSERIAL" | "BIGSERIAL" | "SERIAL4" | "SERIAL8" => TypeFamily::Integer,
            "DECIMAL" | "NUMERIC" | "MONEY" => TypeFamily::Decimal,
            "FLOAT" | "FLOAT4" | "FLOAT8" | "REAL" | "DOUBLE" | "DOUBLE PRECISION" => TypeFamily::Float,
            "TEXT" | "VARCHAR" | "CHAR" | "CHARACTER" | "CHARACTER VARYING" | "BPCHAR" | "NAME"
            | "CITEXT" => TypeFamily::Text,
            "BOOL" | "BOOLEAN" => TypeFamily::Boolean,
            "TIMESTAMP" | "TIMESTAMPTZ" | "DATETIME" | "TIMESTAMP WITH TIME ZONE"
            | "TIMESTAMP WITHOUT TIME ZONE" => TypeFamily::Timestamp,
            "DATE" => TypeFamily::Date,
            "TIME" | "TIMETZ" | "TIME WITH TIME ZONE" | "TIME WITHOUT TIME ZONE" => TypeFamily::Time,
            "JSON" | "JSONB" => TypeFamily::Json,
            "UUID" => TypeFamily::Uuid,
            _ => return None,
        };
        Some(family)
    }
}

fn check_identifier(kind: &str, name: &str) -> Result<()> {
    if IDENTIFIER.is_match(name) {
        Ok(())
    } else {
        Err(AgentError::SchemaParse(format!("invalid {} name '{}'", kind, name)))
    }
}

fn check_default(default: &str) -> std::result::Result<(), String> {
    let value = TRAILING_CAST.replace(default.trim(), "");
    let value = value.trim();
    let upper = value.to_uppercase();
    let is_keyword = matches!(
        upper.as_str(),
        "NULL" | "TRUE" | "FALSE" | "CURRENT_DATE" | "CURRENT_TIMESTAMP" | "CURRENT_TIME" | "NOW()"
    );
    let is_number = value.parse::<f64>().is_ok();
    let is_string = value.len() >= 2
        && value.starts_with('\'')
        && value.ends_with('\'')
        && !value[1..value.len() - 1].contains('\'');
    let is_sequence = upper.starts_with("NEXTVAL(") && !value.contains(';');

    if is_keyword || is_number || is_string || is_sequence {
        Ok(())
    } else {
        Err(format!("'{}' is not a literal", value))
    }
}
