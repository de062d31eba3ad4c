//! Process-wide configuration
//!
//! Built once at startup (environment, `.env`, then CLI overrides), wrapped in
//! an `Arc` and handed read-only to every component.

use crate::error::{AgentError, Result};
use crate::prompt::DEFAULT_MAX_WORDS;
use crate::retry::RetryPolicy;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            temperature: 0.1,
            max_tokens: 1000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub llm: LlmConfig,
    pub database_url: String,
    pub completion_timeout: Duration,
    pub query_timeout: Duration,
    /// Permit INSERT/UPDATE/DELETE statements from the query pipeline.
    pub allow_writes: bool,
    pub retry: RetryPolicy,
    /// Word budget for query prompts.
    pub prompt_max_words: usize,
    /// Optional JSON-lines mirror of the feedback log.
    pub feedback_log: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            llm: LlmConfig::default(),
            database_url: String::new(),
            completion_timeout: Duration::from_secs(60),
            query_timeout: Duration::from_secs(30),
            allow_writes: false,
            retry: RetryPolicy::default(),
            prompt_max_words: DEFAULT_MAX_WORDS,
            feedback_log: None,
        }
    }
}

impl AgentConfig {
    /// Read configuration from the environment (after loading `.env`).
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; `from_env` uses the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(key) = lookup("OPENAI_API_KEY") {
            config.llm.api_key = key;
        }
        if let Some(model) = lookup("OPENAI_MODEL") {
            config.llm.model = model;
        }
        if let Some(url) = lookup("OPENAI_BASE_URL") {
            config.llm.base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(url) = lookup("DATABASE_URL").or_else(|| lookup("DB_CONNECTION_STRING")) {
            config.database_url = url;
        }
        if let Some(secs) = lookup("SQL_AGENT_QUERY_TIMEOUT") {
            config.query_timeout = parse_seconds("SQL_AGENT_QUERY_TIMEOUT", &secs)?;
        }
        if let Some(secs) = lookup("SQL_AGENT_COMPLETION_TIMEOUT") {
            config.completion_timeout = parse_seconds("SQL_AGENT_COMPLETION_TIMEOUT", &secs)?;
        }
        if let Some(flag) = lookup("SQL_AGENT_ALLOW_WRITES") {
            config.allow_writes = matches!(flag.trim().to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(retries) = lookup("SQL_AGENT_MAX_RETRIES") {
            config.retry.max_retries = retries.trim().parse().map_err(|_| {
                AgentError::Config(format!("SQL_AGENT_MAX_RETRIES must be an integer, got '{}'", retries))
            })?;
        }
        if let Some(words) = lookup("SQL_AGENT_PROMPT_WORDS") {
            config.prompt_max_words = words.trim().parse().map_err(|_| {
                AgentError::Config(format!("SQL_AGENT_PROMPT_WORDS must be an integer, got '{}'", words))
            })?;
        }
        if let Some(path) = lookup("SQL_AGENT_FEEDBACK_LOG") {
            config.feedback_log = Some(PathBuf::from(path));
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database_url.trim().is_empty() {
            return Err(AgentError::Config("database URL is not set (DATABASE_URL)".to_string()));
        }
        if self.query_timeout.is_zero() || self.completion_timeout.is_zero() {
            return Err(AgentError::Config("timeouts must be positive".to_string()));
        }
        if self.prompt_max_words == 0 {
            return Err(AgentError::Config("prompt word budget must be positive".to_string()));
        }
        if self.llm.base_url.trim().is_empty() {
            return Err(AgentError::Config("LLM base URL is empty".to_string()));
        }
        Ok(())
    }
}

fn parse_seconds(key: &str, raw: &str) -> Result<Duration> {
    let secs: f64 = raw
        .trim()
        .parse()
        .map_err(|_| AgentError::Config(format!("{} must be a number of seconds, got '{}'", key, raw)))?;
    if !secs.is_finite() || secs <= 0.0 {
        return Err(AgentError::Config(format!("{} must be positive, got {}", key, secs)));
    }
    Duration::try_from_secs_f64(secs)
        .map_err(|e| AgentError::Config(format!("{} is out of range: {}", key, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_reads_overrides() {
        let config = AgentConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "sqlite::memory:"),
            ("OPENAI_BASE_URL", "http://localhost:8080/v1/"),
            ("SQL_AGENT_QUERY_TIMEOUT", "2.5"),
            ("SQL_AGENT_ALLOW_WRITES", "true"),
            ("SQL_AGENT_MAX_RETRIES", "1"),
            ("SQL_AGENT_PROMPT_WORDS", "1500"),
        ]))
        .unwrap();

        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.llm.base_url, "http://localhost:8080/v1");
        assert_eq!(config.query_timeout, Duration::from_millis(2500));
        assert!(config.allow_writes);
        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(config.prompt_max_words, 1500);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_timeout() {
        let err = AgentConfig::from_lookup(lookup(&[("SQL_AGENT_QUERY_TIMEOUT", "-1")])).unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));

        let err = AgentConfig::from_lookup(lookup(&[("SQL_AGENT_QUERY_TIMEOUT", "1e20")])).unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
    }

    #[test]
    fn test_missing_database_url_fails_validation() {
        let config = AgentConfig::from_lookup(lookup(&[])).unwrap();
        assert!(matches!(config.validate(), Err(AgentError::Config(_))));
    }
}
