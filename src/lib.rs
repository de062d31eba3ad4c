pub mod config;
pub mod db;
pub mod error;
pub mod executor;
pub mod feedback;
pub mod history;
pub mod importer;
pub mod llm;
pub mod orchestrator;
pub mod prompt;
pub mod query;
pub mod retry;
pub mod schema;
pub mod schema_applier;
pub mod schema_generator;
pub mod sql;
pub mod value;

pub use config::{AgentConfig, LlmConfig};
pub use db::{connect, Database, Dialect, PgDatabase, SqliteDatabase, StatementKind};
pub use error::{AgentError, ErrorKind, Result, ValidationRule};
pub use executor::{Execution, QueryExecutor};
pub use feedback::{FeedbackLog, FeedbackRecord, FeedbackSummary};
pub use history::{ConversationHistory, Turn};
pub use importer::{DataImporter, ImportReport, RawRecords, Record, TableImportOutcome, TableRecords, TableStatus};
pub use llm::{CompletionClient, CompletionProvider, OpenAiProvider, Prompt, ProviderFailure};
pub use orchestrator::{Orchestrator, PipelineStage, StageOutcome};
pub use prompt::{Example, PromptBuilder};
pub use query::{OutputFormat, QueryError, QueryRequest, QueryResult};
pub use retry::RetryPolicy;
pub use schema::{Column, ForeignKey, Schema, Table, TypeFamily};
pub use schema_applier::{ApplyReport, SchemaApplier};
pub use schema_generator::{SampleData, SchemaGenerator};
pub use sql::{extract, Extracted, SqlValidator, ValidatedStatement};
pub use value::{Row, Value};
