use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Engine, EngineError, EngineMode, Outcome, Session};
use crate::domain::Row;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedResponse {
    Rows(Vec<Row>),
    Error(EngineError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub session: usize,
    pub sql: String,
}

#[derive(Default)]
struct ScriptedState {
    responses: Mutex<HashMap<String, ScriptedResponse>>,
    delays: Mutex<HashMap<String, Duration>>,
    journal: Mutex<Vec<JournalEntry>>,
    open_failure: Mutex<Option<String>>,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

/// In-process engine that answers from a script keyed by exact statement text.
/// Unscripted statements succeed with no rows. Clones share the same script,
/// journal and counters.
#[derive(Clone, Default)]
pub struct ScriptedEngine {
    state: Arc<ScriptedState>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(self, sql: impl Into<String>, rows: Vec<Row>) -> Self {
        self.set_rows(sql, rows);
        self
    }

    pub fn with_error(self, sql: impl Into<String>, message: impl Into<String>) -> Self {
        self.set_error(sql, message);
        self
    }

    pub fn with_delay(self, sql: impl Into<String>, delay: Duration) -> Self {
        self.state.delays.lock().insert(sql.into(), delay);
        self
    }

    pub fn set_rows(&self, sql: impl Into<String>, rows: Vec<Row>) {
        self.state
            .responses
            .lock()
            .insert(sql.into(), ScriptedResponse::Rows(rows));
    }

    pub fn set_error(&self, sql: impl Into<String>, message: impl Into<String>) {
        self.state.responses.lock().insert(
            sql.into(),
            ScriptedResponse::Error(EngineError::new(message)),
        );
    }

    pub fn clear_response(&self, sql: &str) {
        self.state.responses.lock().remove(sql);
    }

    /// Makes every subsequent `open_session` fail with `message`.
    pub fn fail_open(&self, message: impl Into<String>) {
        *self.state.open_failure.lock() = Some(message.into());
    }

    pub fn journal(&self) -> Vec<String> {
        self.state
            .journal
            .lock()
            .iter()
            .map(|entry| entry.sql.clone())
            .collect()
    }

    pub fn journal_entries(&self) -> Vec<JournalEntry> {
        self.state.journal.lock().clone()
    }

    pub fn clear_journal(&self) {
        self.state.journal.lock().clear();
    }

    pub fn sessions_opened(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    pub fn sessions_closed(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Engine for ScriptedEngine {
    fn mode(&self) -> EngineMode {
        EngineMode::Scripted
    }

    async fn open_session(&self) -> Result<Box<dyn Session>> {
        if let Some(message) = self.state.open_failure.lock().clone() {
            return Err(Error::Engine(message));
        }
        let id = self.state.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            id,
            state: Arc::clone(&self.state),
        }))
    }
}

struct ScriptedSession {
    id: usize,
    state: Arc<ScriptedState>,
}

#[async_trait]
impl Session for ScriptedSession {
    async fn execute(&mut self, sql: &str) -> Outcome {
        self.state.journal.lock().push(JournalEntry {
            session: self.id,
            sql: sql.to_string(),
        });

        let delay = self.state.delays.lock().get(sql).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let response = self.state.responses.lock().get(sql).cloned();
        match response {
            Some(ScriptedResponse::Rows(rows)) => Ok(rows),
            Some(ScriptedResponse::Error(err)) => Err(err),
            None => Ok(Vec::new()),
        }
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Value;

    #[tokio::test]
    async fn test_scripted_default_is_empty_success() {
        let engine = ScriptedEngine::new();
        let mut session = engine.open_session().await.unwrap();
        assert_eq!(session.execute("CREATE TABLE t (i int);").await, Ok(vec![]));
        assert_eq!(engine.mode(), EngineMode::Scripted);
    }

    #[tokio::test]
    async fn test_scripted_responses() {
        let engine = ScriptedEngine::new()
            .with_rows("SELECT 3;", vec![vec![Value::Int(3)]])
            .with_error("SELECT 1/0;", "division by zero");
        let mut session = engine.open_session().await.unwrap();

        assert_eq!(session.execute("SELECT 3;").await, Ok(vec![vec![Value::Int(3)]]));
        assert_eq!(
            session.execute("SELECT 1/0;").await,
            Err(EngineError::new("division by zero"))
        );

        engine.clear_response("SELECT 1/0;");
        assert_eq!(session.execute("SELECT 1/0;").await, Ok(vec![]));
    }

    #[tokio::test]
    async fn test_scripted_journal_tracks_sessions() {
        let engine = ScriptedEngine::new();
        let mut first = engine.open_session().await.unwrap();
        let mut second = engine.open_session().await.unwrap();
        first.execute("SELECT 1;").await.unwrap();
        second.execute("SELECT 2;").await.unwrap();

        let entries = engine.journal_entries();
        assert_eq!(entries[0], JournalEntry { session: 0, sql: "SELECT 1;".into() });
        assert_eq!(entries[1], JournalEntry { session: 1, sql: "SELECT 2;".into() });

        first.close().await.unwrap();
        second.close().await.unwrap();
        assert_eq!(engine.sessions_opened(), 2);
        assert_eq!(engine.sessions_closed(), 2);

        engine.clear_journal();
        assert!(engine.journal().is_empty());
    }

    #[tokio::test]
    async fn test_scripted_open_failure() {
        let engine = ScriptedEngine::new();
        engine.fail_open("connection refused");
        assert!(matches!(engine.open_session().await, Err(Error::Engine(_))));
        assert_eq!(engine.sessions_opened(), 0);
    }
}
