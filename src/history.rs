//! Conversation history
//!
//! Recently answered questions and the statements that answered them. Turns
//! that share words with a new question are shown to the model as previous
//! queries. Like the feedback log, turns live in a `DashMap` keyed by
//! sequence number so recording never blocks readers.

use crate::prompt::Example;
use crate::query::{QueryRequest, QueryResult};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Turns considered when a new question arrives.
pub const CONTEXT_WINDOW: usize = 5;

/// Words a past question must share with the new one to be relevant.
const MIN_SHARED_WORDS: usize = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub question: String,
    pub sql: String,
    pub context: Option<String>,
    pub asked_at: DateTime<Utc>,
}

pub struct ConversationHistory {
    turns: DashMap<u64, Turn>,
    next_seq: AtomicU64,
    window: usize,
}

impl Default for ConversationHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::with_window(CONTEXT_WINDOW)
    }

    pub fn with_window(window: usize) -> Self {
        Self {
            turns: DashMap::new(),
            next_seq: AtomicU64::new(0),
            window: window.max(1),
        }
    }

    /// Remember a successful answer. Failed results are not kept.
    ///
    /// The log holds at most twice the window; past that it is cut back to
    /// the newest `window` turns.
    pub fn record(&self, request: &QueryRequest, result: &QueryResult) {
        if !result.is_success() || result.sql().is_empty() {
            return;
        }
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.turns.insert(
            seq,
            Turn {
                question: request.question().to_string(),
                sql: result.sql().to_string(),
                context: request.context().map(str::to_string),
                asked_at: Utc::now(),
            },
        );

        let window = self.window as u64;
        if self.turns.len() > self.window * 2 {
            self.turns.retain(|k, _| *k + window > seq);
            debug!("Trimmed conversation history to {} turns", self.turns.len());
        }
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// The newest `window` turns, oldest first.
    pub fn recent(&self) -> Vec<Turn> {
        let mut turns: Vec<(u64, Turn)> = self.turns.iter().map(|e| (*e.key(), e.value().clone())).collect();
        turns.sort_by_key(|(seq, _)| *seq);
        let skip = turns.len().saturating_sub(self.window);
        turns.into_iter().skip(skip).map(|(_, turn)| turn).collect()
    }

    /// Recent turns relevant to `question`, as prompt examples.
    pub fn relevant(&self, question: &str) -> Vec<Example> {
        self.recent()
            .into_iter()
            .filter(|turn| is_relevant(question, &turn.question))
            .map(|turn| Example {
                question: turn.question,
                sql: turn.sql,
            })
            .collect()
    }
}

fn words(text: &str) -> HashSet<String> {
    text.split_whitespace().map(str::to_lowercase).collect()
}

fn is_relevant(question: &str, previous: &str) -> bool {
    words(question).intersection(&words(previous)).count() >= MIN_SHARED_WORDS
}
