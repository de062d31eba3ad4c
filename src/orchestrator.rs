//! Orchestrator
//!
//! Sequences schema generation, schema application and data import, then
//! answers questions through prompt, completion, extraction, validation and
//! execution. Every stage that depends on the current table structure reads
//! it from the database first.

use crate::config::AgentConfig;
use crate::db::{self, Database};
use crate::error::{AgentError, Result};
use crate::executor::QueryExecutor;
use crate::feedback::{FeedbackLog, FeedbackSummary};
use crate::history::ConversationHistory;
use crate::importer::{DataImporter, ImportReport, RawRecords};
use crate::llm::{CompletionClient, OpenAiProvider};
use crate::prompt::PromptBuilder;
use crate::query::{QueryRequest, QueryResult};
use crate::schema::Schema;
use crate::schema_applier::{ApplyReport, SchemaApplier};
use crate::schema_generator::{SampleData, SchemaGenerator};
use crate::sql::{extract, SqlValidator};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Successful examples offered to the model with each question.
const PROMPT_EXAMPLES: usize = 3;

/// One unit of pipeline work.
#[derive(Debug, Clone)]
pub enum PipelineStage {
    GenerateSchema {
        sample: SampleData,
        description: Option<String>,
    },
    ApplySchema(Schema),
    ImportData(RawRecords),
    Query(QueryRequest),
}

#[derive(Debug, Clone)]
pub enum StageOutcome {
    SchemaGenerated(Schema),
    SchemaApplied(ApplyReport),
    DataImported(ImportReport),
    Answered(QueryResult),
}

pub struct Orchestrator {
    config: Arc<AgentConfig>,
    db: Arc<dyn Database>,
    client: CompletionClient,
    feedback: Arc<FeedbackLog>,
    history: ConversationHistory,
    /// Last schema generated or read back from the database.
    schema: RwLock<Option<Schema>>,
}

impl Orchestrator {
    pub fn new(config: Arc<AgentConfig>, db: Arc<dyn Database>, client: CompletionClient, feedback: Arc<FeedbackLog>) -> Self {
        Self {
            config,
            db,
            client,
            feedback,
            history: ConversationHistory::new(),
            schema: RwLock::new(None),
        }
    }

    /// Connect to the configured database and completion provider.
    pub async fn connect(config: AgentConfig) -> Result<Self> {
        config.validate()?;
        let db = db::connect(&config.database_url).await?;
        let provider = OpenAiProvider::new(&config.llm)?;
        let client = CompletionClient::new(Arc::new(provider), config.retry.clone());
        let feedback = match &config.feedback_log {
            Some(path) => FeedbackLog::open(path).await?,
            None => FeedbackLog::new(),
        };
        info!("Orchestrator ready ({} backend)", db.dialect().name());
        Ok(Self::new(Arc::new(config), db, client, Arc::new(feedback)))
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn feedback(&self) -> &FeedbackLog {
        &self.feedback
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    /// Schema as last seen by this session, without touching the database.
    pub async fn cached_schema(&self) -> Option<Schema> {
        self.schema.read().await.clone()
    }

    /// Read the table structure from the database and remember it.
    pub async fn live_schema(&self) -> Result<Schema> {
        let schema = self.db.fetch_schema().await?;
        *self.schema.write().await = Some(schema.clone());
        Ok(schema)
    }

    pub async fn generate_schema(&self, sample: &SampleData, description: Option<&str>) -> Result<Schema> {
        let generator = SchemaGenerator::new(self.client.clone(), self.db.dialect());
        let schema = generator.generate(sample, description, self.config.completion_timeout).await?;
        *self.schema.write().await = Some(schema.clone());
        Ok(schema)
    }

    pub async fn apply_schema(&self, schema: &Schema) -> Result<ApplyReport> {
        let report = SchemaApplier::new(self.db.clone(), self.config.query_timeout).apply(schema).await?;
        self.live_schema().await?;
        Ok(report)
    }

    pub async fn import_data(&self, records: &RawRecords) -> Result<ImportReport> {
        let report = DataImporter::new(self.db.clone(), self.config.query_timeout).import(records).await?;
        if !report.is_complete() {
            warn!("Import finished with {} failed tables", report.failures().count());
        }
        Ok(report)
    }

    /// Split a denormalised CSV across the live tables and import it.
    pub async fn import_csv(&self, path: impl AsRef<Path>) -> Result<ImportReport> {
        let schema = self.live_schema().await?;
        if schema.is_empty() {
            return Err(AgentError::SchemaMismatch("database has no tables to import into".to_string()));
        }
        let sample = SampleData::load_csv_path(path)?;
        let records = RawRecords::from_flat(&sample, &schema)?;
        self.import_data(&records).await
    }

    /// Answer `request`, failing with the first error any stage reports.
    pub async fn ask(&self, request: &QueryRequest) -> Result<QueryResult> {
        self.answer(request, &mut None).await
    }

    /// Like [`ask`](Self::ask), but failures become a `QueryResult` carrying
    /// the error and whatever statement had been generated.
    pub async fn process(&self, request: &QueryRequest) -> QueryResult {
        let started = Instant::now();
        let mut generated = None;
        match self.answer(request, &mut generated).await {
            Ok(result) => result,
            Err(e) => {
                warn!("Question '{}' failed: {}", request.question(), e);
                QueryResult::failure(request.question(), generated, started.elapsed(), &e)
            }
        }
    }

    async fn answer(&self, request: &QueryRequest, generated: &mut Option<String>) -> Result<QueryResult> {
        let schema = self.live_schema().await?;
        let dialect = self.db.dialect();

        let prompt = PromptBuilder::new(dialect)
            .with_word_budget(self.config.prompt_max_words)
            .with_examples(self.feedback.learning_examples(PROMPT_EXAMPLES))
            .with_history(self.history.relevant(request.question()))
            .build_query_prompt(request, &schema)?;

        let completion_timeout = request.timeout().unwrap_or(self.config.completion_timeout);
        let raw = self.client.complete(&prompt, completion_timeout).await?;

        let extracted = extract(&raw)?;
        *generated = Some(extracted.sql.clone());

        let statement = SqlValidator::new(self.config.allow_writes).validate(
            &extracted.sql,
            &schema,
            request.question(),
            request.limit(),
        )?;
        *generated = Some(statement.sql.clone());

        let query_timeout = request.timeout().unwrap_or(self.config.query_timeout);
        let execution = QueryExecutor::new(self.db.clone()).execute(&statement, query_timeout).await?;

        let explanation = if request.explain() { extracted.explanation } else { None };
        let result = QueryResult::success(
            request.question(),
            statement.sql,
            execution.rows,
            execution.elapsed,
            explanation,
        );
        self.history.record(request, &result);
        Ok(result)
    }

    pub async fn record_feedback(&self, result: &QueryResult, category: &str, note: &str) -> Result<()> {
        self.feedback.record(result, category, note).await
    }

    pub fn feedback_summary(&self) -> FeedbackSummary {
        self.feedback.analyze()
    }

    pub async fn run_stage(&self, stage: PipelineStage) -> Result<StageOutcome> {
        match stage {
            PipelineStage::GenerateSchema { sample, description } => self
                .generate_schema(&sample, description.as_deref())
                .await
                .map(StageOutcome::SchemaGenerated),
            PipelineStage::ApplySchema(schema) => self.apply_schema(&schema).await.map(StageOutcome::SchemaApplied),
            PipelineStage::ImportData(records) => self.import_data(&records).await.map(StageOutcome::DataImported),
            PipelineStage::Query(request) => Ok(StageOutcome::Answered(self.process(&request).await)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteDatabase;
    use crate::error::{ErrorKind, ValidationRule};
    use crate::llm::{CompletionProvider, Prompt, ProviderFailure};
    use crate::retry::RetryPolicy;
    use crate::schema::{Column, Table};
    use crate::value::Value;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Recording {
        reply: String,
        prompts: Mutex<Vec<Prompt>>,
    }

    #[async_trait]
    impl CompletionProvider for Recording {
        async fn complete(&self, prompt: &Prompt) -> std::result::Result<String, ProviderFailure> {
            self.prompts.lock().unwrap().push(prompt.clone());
            Ok(self.reply.clone())
        }
    }

    async fn orchestrator(reply: &str) -> (Orchestrator, Arc<Recording>) {
        let provider = Arc::new(Recording {
            reply: reply.to_string(),
            prompts: Mutex::new(Vec::new()),
        });
        let db: Arc<dyn Database> = Arc::new(SqliteDatabase::open_in_memory().unwrap());
        let orchestrator = Orchestrator::new(
            Arc::new(AgentConfig::default()),
            db,
            CompletionClient::new(provider.clone(), RetryPolicy::none()),
            Arc::new(FeedbackLog::new()),
        );
        let schema = Schema::new(vec![Table::new(
            "customers",
            vec![Column::new("id", "SERIAL").primary(), Column::new("name", "TEXT")],
        )]);
        orchestrator.run_stage(PipelineStage::ApplySchema(schema)).await.unwrap();
        (orchestrator, provider)
    }

    #[tokio::test]
    async fn test_apply_stage_refreshes_cached_schema() {
        let (orchestrator, _) = orchestrator("```sql\nSELECT 1\n```").await;
        let cached = orchestrator.cached_schema().await.unwrap();
        assert!(cached.has_table("customers"));
    }

    #[tokio::test]
    async fn test_process_reports_rejected_statement() {
        let (orchestrator, _) = orchestrator("```sql\nSELECT * FROM invoices\n```").await;
        let request = QueryRequest::new("list invoices").unwrap();
        let result = orchestrator.process(&request).await;

        assert!(!result.is_success());
        assert_eq!(result.sql(), "SELECT * FROM invoices");
        assert_eq!(result.error().unwrap().kind, ErrorKind::SchemaMismatch);
    }

    #[tokio::test]
    async fn test_writes_need_the_flag() {
        let (orchestrator, _) = orchestrator("```sql\nDELETE FROM customers\n```").await;
        let err = orchestrator.ask(&QueryRequest::new("remove everyone").unwrap()).await.unwrap_err();
        assert_eq!(err.violated_rule(), Some(ValidationRule::StatementType));
    }

    #[tokio::test]
    async fn test_successful_feedback_becomes_an_example() {
        let (orchestrator, provider) =
            orchestrator("```sql\nSELECT COUNT(*) AS total FROM customers\n```\nExplanation: counts rows").await;

        let request = QueryRequest::new("How many customers?").unwrap().with_explanation(true);
        let first = orchestrator.ask(&request).await.unwrap();
        assert_eq!(first.rows()[0]["total"], Value::Integer(0));
        assert_eq!(first.explanation(), Some("counts rows"));

        orchestrator.record_feedback(&first, "success", "right answer").await.unwrap();
        orchestrator.ask(&request).await.unwrap();

        let prompts = provider.prompts.lock().unwrap();
        assert!(!prompts[0].user.contains("SIMILAR EXAMPLES"));
        assert!(prompts[1].user.contains("Query: SELECT COUNT(*) AS total FROM customers"));
        assert_eq!(orchestrator.feedback_summary().total, 1);
    }

    #[tokio::test]
    async fn test_related_question_sees_previous_query() {
        let (orchestrator, provider) = orchestrator("```sql\nSELECT name FROM customers\n```").await;

        orchestrator.ask(&QueryRequest::new("list customer names").unwrap()).await.unwrap();
        orchestrator.ask(&QueryRequest::new("count all orders").unwrap()).await.unwrap();
        orchestrator.ask(&QueryRequest::new("list customer names again").unwrap()).await.unwrap();
        assert_eq!(orchestrator.history().len(), 3);

        let prompts = provider.prompts.lock().unwrap();
        assert!(!prompts[0].user.contains("PREVIOUS QUERIES"));
        assert!(!prompts[1].user.contains("PREVIOUS QUERIES"));
        assert!(prompts[2].user.contains("PREVIOUS QUERIES:\nQuestion: list customer names\nQuery: SELECT name FROM customers"));
        assert!(!prompts[2].user.contains("Question: count all orders"));
    }

    #[tokio::test]
    async fn test_rejected_statements_stay_out_of_history() {
        let (orchestrator, _) = orchestrator("```sql\nSELECT * FROM invoices\n```").await;
        orchestrator.process(&QueryRequest::new("list invoices").unwrap()).await;
        assert!(orchestrator.history().is_empty());
    }
}
