mod common;

use common::{orchestrator_with, sql_reply, ScriptedProvider};
use sql_agent::{
    AgentConfig, Column, PipelineStage, QueryRequest, RawRecords, RetryPolicy, Schema, StatementKind, Table,
    TableRecords, Value,
};
use std::sync::Arc;
use std::time::Duration;

const RUNAWAY_INSERT: &str = "INSERT INTO customers (name) \
WITH RECURSIVE n(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM n) SELECT 'x' FROM n";

#[tokio::test]
async fn test_aborted_question_frees_the_connection() {
    let config = AgentConfig {
        allow_writes: true,
        query_timeout: Duration::from_secs(60),
        ..AgentConfig::default()
    };
    let (orchestrator, db) = orchestrator_with(config, ScriptedProvider::replying(&sql_reply(RUNAWAY_INSERT)), RetryPolicy::none());

    let schema = Schema::new(vec![Table::new(
        "customers",
        vec![Column::new("id", "SERIAL").primary(), Column::new("name", "TEXT").not_null()],
    )]);
    orchestrator.run_stage(PipelineStage::ApplySchema(schema)).await.unwrap();
    let seed = RawRecords::new().with_table(
        "customers",
        TableRecords::new(vec![[("name".to_string(), Some("Ada".to_string()))].into_iter().collect()]),
    );
    orchestrator.import_data(&seed).await.unwrap();

    let orchestrator = Arc::new(orchestrator);
    let running = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            let request = QueryRequest::new("add a customer called x for every number").unwrap();
            orchestrator.ask(&request).await
        })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    running.abort();
    assert!(running.await.unwrap_err().is_cancelled());

    let rows = tokio::time::timeout(
        Duration::from_secs(2),
        db.run_statement("SELECT COUNT(*) AS n FROM customers", StatementKind::Read, Duration::from_secs(2)),
    )
    .await
    .expect("connection still held by the aborted statement")
    .unwrap();
    assert_eq!(rows[0]["n"], Value::Integer(1));
}
