#![allow(dead_code)]

use async_trait::async_trait;
use sql_agent::{
    AgentConfig, CompletionClient, CompletionProvider, Database, FeedbackLog, Orchestrator, Prompt, ProviderFailure,
    RetryPolicy, SqliteDatabase,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Completion provider that plays back canned replies in order. The last
/// reply repeats once the queue runs dry.
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<Result<String, ProviderFailure>>>,
    last: Mutex<Option<String>>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(replies: Vec<Result<String, ProviderFailure>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            last: Mutex::new(None),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn replying(reply: &str) -> Arc<Self> {
        Self::new(vec![Ok(reply.to_string())])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    async fn complete(&self, _prompt: &Prompt) -> Result<String, ProviderFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.replies.lock().unwrap().pop_front();
        match next {
            Some(Ok(text)) => {
                *self.last.lock().unwrap() = Some(text.clone());
                Ok(text)
            }
            Some(Err(failure)) => Err(failure),
            None => self
                .last
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| ProviderFailure::terminal("script exhausted")),
        }
    }
}

pub fn sql_reply(sql: &str) -> String {
    format!("Here is the query:\n```sql\n{}\n```", sql)
}

/// Orchestrator over a fresh in-memory SQLite database.
pub fn orchestrator(provider: Arc<ScriptedProvider>, retry: RetryPolicy) -> (Orchestrator, Arc<dyn Database>) {
    orchestrator_with(AgentConfig::default(), provider, retry)
}

pub fn orchestrator_with(
    config: AgentConfig,
    provider: Arc<ScriptedProvider>,
    retry: RetryPolicy,
) -> (Orchestrator, Arc<dyn Database>) {
    let db: Arc<dyn Database> = Arc::new(SqliteDatabase::open_in_memory().unwrap());
    let orchestrator = Orchestrator::new(
        Arc::new(config),
        db.clone(),
        CompletionClient::new(provider, retry),
        Arc::new(FeedbackLog::new()),
    );
    (orchestrator, db)
}
