use std::fmt;
use thiserror::Error;

/// The validator rule that rejected a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValidationRule {
    /// Statement kind is outside the allow-list.
    StatementType,
    /// Comments, system catalogs or file output.
    ForbiddenConstruct,
    /// Fragments of the question copied verbatim into the statement.
    QuestionInjection,
    /// Unknown table or column.
    SchemaReference,
    /// Requested row limit could not be enforced.
    ResultLimit,
}

impl fmt::Display for ValidationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValidationRule::StatementType => "statement-type",
            ValidationRule::ForbiddenConstruct => "forbidden-construct",
            ValidationRule::QuestionInjection => "question-injection",
            ValidationRule::SchemaReference => "schema-reference",
            ValidationRule::ResultLimit => "result-limit",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone)]
pub enum AgentError {
    #[error("Input error: {0}")]
    Input(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Completion timed out after {0:.1}s")]
    Timeout(f64),

    #[error("Extraction error: {0}")]
    Extraction(String),

    #[error("Validation failed ({rule}): {message}")]
    Validation { rule: ValidationRule, message: String },

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Execution timed out after {0:.1}s")]
    ExecutionTimeout(f64),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Schema parse error: {0}")]
    SchemaParse(String),

    #[error("Cyclic schema: {0}")]
    CyclicSchema(String),

    #[error("Schema conflict: {0}")]
    SchemaConflict(String),

    #[error("Unresolved reference: {0}")]
    UnresolvedReference(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("CSV error: {0}")]
    Csv(String),
}

/// Copyable tag for an [`AgentError`], used in results and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Input,
    Config,
    Provider,
    Timeout,
    Extraction,
    Validation,
    SchemaMismatch,
    ExecutionTimeout,
    ConstraintViolation,
    Connection,
    Execution,
    SchemaParse,
    CyclicSchema,
    SchemaConflict,
    UnresolvedReference,
    Io,
    Json,
    Csv,
}

impl AgentError {
    pub fn validation(rule: ValidationRule, message: impl Into<String>) -> Self {
        AgentError::Validation {
            rule,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::Input(_) => ErrorKind::Input,
            AgentError::Config(_) => ErrorKind::Config,
            AgentError::Provider(_) => ErrorKind::Provider,
            AgentError::Timeout(_) => ErrorKind::Timeout,
            AgentError::Extraction(_) => ErrorKind::Extraction,
            AgentError::Validation { .. } => ErrorKind::Validation,
            AgentError::SchemaMismatch(_) => ErrorKind::SchemaMismatch,
            AgentError::ExecutionTimeout(_) => ErrorKind::ExecutionTimeout,
            AgentError::ConstraintViolation(_) => ErrorKind::ConstraintViolation,
            AgentError::Connection(_) => ErrorKind::Connection,
            AgentError::Execution(_) => ErrorKind::Execution,
            AgentError::SchemaParse(_) => ErrorKind::SchemaParse,
            AgentError::CyclicSchema(_) => ErrorKind::CyclicSchema,
            AgentError::SchemaConflict(_) => ErrorKind::SchemaConflict,
            AgentError::UnresolvedReference(_) => ErrorKind::UnresolvedReference,
            AgentError::Io(_) => ErrorKind::Io,
            AgentError::Json(_) => ErrorKind::Json,
            AgentError::Csv(_) => ErrorKind::Csv,
        }
    }

    /// The rule that rejected the statement, for validation failures.
    pub fn violated_rule(&self) -> Option<ValidationRule> {
        match self {
            AgentError::Validation { rule, .. } => Some(*rule),
            _ => None,
        }
    }
}

impl From<std::io::Error> for AgentError {
    fn from(err: std::io::Error) -> Self {
        AgentError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(err: serde_json::Error) -> Self {
        AgentError::Json(err.to_string())
    }
}

impl From<csv::Error> for AgentError {
    fn from(err: csv::Error) -> Self {
        AgentError::Csv(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
