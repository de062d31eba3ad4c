mod common;

use common::{orchestrator, sql_reply, ScriptedProvider};
use regex::Regex;
use sql_agent::{
    AgentError, Column, Database, ErrorKind, OutputFormat, Orchestrator, PipelineStage, ProviderFailure, QueryRequest,
    RawRecords, RetryPolicy, Schema, StageOutcome, StatementKind, Table, TableRecords, Value,
};
use std::sync::Arc;
use std::time::Duration;

fn shop() -> Schema {
    Schema::new(vec![
        Table::new(
            "customers",
            vec![Column::new("id", "SERIAL").primary(), Column::new("name", "TEXT").not_null()],
        ),
        Table::new(
            "orders",
            vec![
                Column::new("id", "SERIAL").primary(),
                Column::new("customer_id", "INTEGER").not_null(),
                Column::new("total", "NUMERIC(10,2)"),
            ],
        )
        .with_foreign_key("customer_id", "customers", "id"),
    ])
}

async fn seeded(provider: Arc<ScriptedProvider>) -> (Orchestrator, Arc<dyn Database>) {
    let (orchestrator, db) = orchestrator(provider, RetryPolicy::none());
    orchestrator.run_stage(PipelineStage::ApplySchema(shop())).await.unwrap();

    let customers = ["Ada", "Grace", "Edsger", "Barbara", "Donald", "Frances", "Niklaus"]
        .iter()
        .map(|name| [("name".to_string(), Some(name.to_string()))].into_iter().collect())
        .collect();
    let records = RawRecords::new().with_table("customers", TableRecords::new(customers));
    match orchestrator.run_stage(PipelineStage::ImportData(records)).await.unwrap() {
        StageOutcome::DataImported(report) => assert!(report.is_complete()),
        other => panic!("unexpected outcome {:?}", other),
    }
    (orchestrator, db)
}

async fn customer_count(db: &Arc<dyn Database>) -> Value {
    let rows = db
        .run_statement("SELECT COUNT(*) AS n FROM customers", StatementKind::Read, Duration::from_secs(5))
        .await
        .unwrap();
    rows[0]["n"].clone()
}

#[tokio::test]
async fn test_how_many_customers() {
    let provider = ScriptedProvider::replying(&sql_reply("SELECT COUNT(*) AS customer_count\nFROM customers;"));
    let (orchestrator, _db) = seeded(provider).await;

    let request = QueryRequest::new("How many customers do we have?").unwrap();
    let result = orchestrator.ask(&request).await.unwrap();

    let normalized = result.sql().split_whitespace().collect::<Vec<_>>().join(" ");
    let shape = Regex::new(r"(?i)^SELECT COUNT\(\*\).* FROM customers\b").unwrap();
    assert!(shape.is_match(&normalized), "unexpected statement: {}", normalized);

    assert_eq!(result.rows().len(), 1);
    let row = &result.rows()[0];
    assert_eq!(row.len(), 1);
    let count = row.values().next().and_then(Value::as_i64).unwrap();
    assert!(count >= 0);
    assert_eq!(count, 7);

    let csv = result.format(OutputFormat::Csv).unwrap();
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines, vec!["customer_count", "7"]);
}

#[tokio::test]
async fn test_blank_question_never_reaches_the_provider() {
    let provider = ScriptedProvider::replying(&sql_reply("SELECT 1"));
    let (_orchestrator, _db) = orchestrator(provider.clone(), RetryPolicy::none());

    for question in ["", "   ", "\n\t"] {
        let err = QueryRequest::new(question).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Input);
    }
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn test_stacked_statements_are_never_executed() {
    let provider = ScriptedProvider::replying(&sql_reply("SELECT 1; DROP TABLE customers;"));
    let (orchestrator, db) = seeded(provider).await;

    let result = orchestrator.process(&QueryRequest::new("anything").unwrap()).await;
    let error = result.error().unwrap();
    assert!(matches!(error.kind, ErrorKind::Extraction | ErrorKind::Validation));
    assert_eq!(customer_count(&db).await, Value::Integer(7));
}

#[tokio::test]
async fn test_requested_limit_is_appended() {
    let provider = ScriptedProvider::replying(&sql_reply("SELECT name FROM customers ORDER BY name"));
    let (orchestrator, _db) = seeded(provider).await;

    let request = QueryRequest::new("list customers").unwrap().with_limit(5).unwrap();
    let result = orchestrator.ask(&request).await.unwrap();
    assert!(result.sql().to_uppercase().contains("LIMIT 5"));
    assert_eq!(result.rows().len(), 5);
}

#[tokio::test]
async fn test_narrower_limit_is_kept() {
    let provider = ScriptedProvider::replying(&sql_reply("SELECT name FROM customers ORDER BY name LIMIT 3"));
    let (orchestrator, _db) = seeded(provider).await;

    let request = QueryRequest::new("first three customers").unwrap().with_limit(5).unwrap();
    let result = orchestrator.ask(&request).await.unwrap();
    assert!(result.sql().to_uppercase().contains("LIMIT 3"));
    assert!(!result.sql().to_uppercase().contains("LIMIT 5"));
    assert_eq!(result.rows().len(), 3);
}

#[tokio::test]
async fn test_unknown_column_is_a_schema_mismatch() {
    let provider = ScriptedProvider::replying(&sql_reply("SELECT email FROM customers"));
    let (orchestrator, _db) = seeded(provider).await;

    let err = orchestrator.ask(&QueryRequest::new("customer emails").unwrap()).await.unwrap_err();
    assert!(matches!(err, AgentError::SchemaMismatch(_)));
}

#[tokio::test]
async fn test_transient_provider_failures_are_retried() {
    let provider = ScriptedProvider::new(vec![
        Err(ProviderFailure::transient("HTTP 429")),
        Err(ProviderFailure::transient("HTTP 503")),
        Ok(sql_reply("SELECT COUNT(*) FROM customers")),
    ]);
    let retry = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5), 2.0);
    let (orchestrator, _db) = orchestrator(provider.clone(), retry);
    orchestrator.run_stage(PipelineStage::ApplySchema(shop())).await.unwrap();

    let result = orchestrator.ask(&QueryRequest::new("How many customers?").unwrap()).await.unwrap();
    assert_eq!(result.rows().len(), 1);
    assert_eq!(provider.calls(), 3);
}

#[tokio::test]
async fn test_provider_gives_up_after_retries() {
    let provider = ScriptedProvider::new(vec![
        Err(ProviderFailure::transient("connection reset")),
        Err(ProviderFailure::transient("connection reset")),
    ]);
    let retry = RetryPolicy::new(1, Duration::from_millis(1), Duration::from_millis(5), 2.0);
    let (orchestrator, _db) = orchestrator(provider.clone(), retry);

    let err = orchestrator.ask(&QueryRequest::new("anything").unwrap()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Provider);
    assert_eq!(provider.calls(), 2);
}

#[tokio::test]
async fn test_empty_result_renders_placeholder() {
    let provider = ScriptedProvider::replying(&sql_reply("SELECT name FROM customers WHERE name = 'Nobody'"));
    let (orchestrator, _db) = seeded(provider).await;

    let result = orchestrator.ask(&QueryRequest::new("is nobody a customer").unwrap()).await.unwrap();
    assert!(result.rows().is_empty());
    assert_eq!(result.format(OutputFormat::Table).unwrap(), "No results found.");
}
