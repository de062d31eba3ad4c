use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sql_agent::{AgentConfig, FeedbackLog, OutputFormat, Orchestrator, QueryRequest, RawRecords, SampleData, Schema};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Ask questions of a relational database in plain language
#[derive(Parser)]
#[command(name = "sql-agent")]
#[command(about = "Natural-language questions to validated SQL, plus schema generation and data import")]
struct Args {
    /// Database URL (postgres://..., sqlite:path); defaults to DATABASE_URL
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Completion model; defaults to OPENAI_MODEL or the built-in default
    #[arg(long, global = true)]
    model: Option<String>,

    /// Allow INSERT/UPDATE/DELETE statements from questions
    #[arg(long, global = true)]
    allow_writes: bool,

    /// JSON-lines file that keeps feedback across runs
    #[arg(long, global = true)]
    feedback_log: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Answer a question with a single validated statement
    Ask {
        question: String,

        /// Cap the number of rows returned
        #[arg(short, long)]
        limit: Option<u64>,

        /// Per-call timeout in seconds
        #[arg(short, long)]
        timeout: Option<f64>,

        /// Ask the model to explain the statement
        #[arg(short, long)]
        explain: bool,

        /// Extra context passed to the model
        #[arg(long)]
        context: Option<String>,

        /// table, json or csv
        #[arg(short, long, default_value = "table")]
        format: String,

        /// Record feedback for the answer (e.g. success, failure, performance)
        #[arg(long)]
        feedback: Option<String>,

        /// Note stored with the feedback
        #[arg(long, default_value = "")]
        note: String,
    },
    /// Print the live database schema
    Schema {
        #[arg(long)]
        json: bool,
    },
    /// Propose a schema for a CSV sample
    GenerateSchema {
        csv: PathBuf,

        /// What the data will be used for
        #[arg(short, long)]
        description: Option<String>,

        /// Write the schema JSON here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Apply the generated schema right away
        #[arg(long)]
        apply: bool,
    },
    /// Create the tables of a schema JSON file
    ApplySchema { schema: PathBuf },
    /// Import a denormalised CSV, or per-table records with --records
    Import {
        path: PathBuf,

        /// Treat the file as per-table records in JSON
        #[arg(long)]
        records: bool,
    },
    /// Summarise recorded feedback
    Feedback,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = AgentConfig::from_env()?;
    if let Some(url) = args.database_url {
        config.database_url = url;
    }
    if let Some(model) = args.model {
        config.llm.model = model;
    }
    if args.allow_writes {
        config.allow_writes = true;
    }
    if let Some(path) = args.feedback_log {
        config.feedback_log = Some(path);
    }

    if let Command::Feedback = args.command {
        let log = match &config.feedback_log {
            Some(path) => FeedbackLog::open(path).await?,
            None => FeedbackLog::new(),
        };
        println!("{}", serde_json::to_string_pretty(&log.analyze())?);
        return Ok(());
    }

    let orchestrator = Orchestrator::connect(config).await?;

    match args.command {
        Command::Ask {
            question,
            limit,
            timeout,
            explain,
            context,
            format,
            feedback,
            note,
        } => {
            let format: OutputFormat = format.parse()?;
            let mut request = QueryRequest::new(question)?.with_explanation(explain);
            if let Some(limit) = limit {
                request = request.with_limit(limit)?;
            }
            if let Some(secs) = timeout {
                request = request.with_timeout_secs(secs)?;
            }
            if let Some(context) = context {
                request = request.with_context(context);
            }

            let result = orchestrator.process(&request).await;
            if let Some(error) = result.error() {
                eprintln!("❌ {}", error.message);
                if !result.sql().is_empty() {
                    eprintln!("   SQL: {}", result.sql());
                }
            } else {
                if format == OutputFormat::Table {
                    println!("📋 SQL: {}\n", result.sql());
                }
                println!("{}", result.format(format)?);
                if let Some(explanation) = result.explanation() {
                    println!("\n💡 {}", explanation);
                }
                info!("Answered in {:.3}s", result.execution_time().as_secs_f64());
            }

            if let Some(category) = feedback {
                orchestrator.record_feedback(&result, &category, &note).await?;
            }
            if !result.is_success() {
                std::process::exit(1);
            }
        }
        Command::Schema { json } => {
            let schema = orchestrator.live_schema().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&schema)?);
            } else if schema.is_empty() {
                println!("No tables found.");
            } else {
                println!("{}", schema);
            }
        }
        Command::GenerateSchema {
            csv,
            description,
            output,
            apply,
        } => {
            let sample = SampleData::from_csv_path(&csv).with_context(|| format!("reading {}", csv.display()))?;
            println!("🔍 Profiling {} rows from {}", sample.total_rows, csv.display());
            let schema = orchestrator.generate_schema(&sample, description.as_deref()).await?;
            let schema_json = serde_json::to_string_pretty(&schema)?;

            match output {
                Some(path) => {
                    std::fs::write(&path, &schema_json)?;
                    println!("✅ Schema saved to: {}", path.display());
                }
                None => println!("{}", schema_json),
            }

            if apply {
                let report = orchestrator.apply_schema(&schema).await?;
                println!("✅ Created: {}", report.created.join(", "));
            }
        }
        Command::ApplySchema { schema } => {
            let text = std::fs::read_to_string(&schema).with_context(|| format!("reading {}", schema.display()))?;
            let schema: Schema = serde_json::from_str(&text)?;
            let report = orchestrator.apply_schema(&schema).await?;
            if report.is_noop() {
                println!("✅ Schema already applied");
            } else {
                println!("✅ Created: {}", report.created.join(", "));
            }
            if !report.unchanged.is_empty() {
                println!("   Unchanged: {}", report.unchanged.join(", "));
            }
        }
        Command::Import { path, records } => {
            let report = if records {
                let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
                let records: RawRecords = serde_json::from_str(&text)?;
                orchestrator.import_data(&records).await?
            } else {
                orchestrator.import_csv(&path).await?
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_complete() {
                std::process::exit(1);
            }
        }
        Command::Feedback => unreachable!("handled before connecting"),
    }

    Ok(())
}
