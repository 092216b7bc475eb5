mod postgres;
mod scripted;

pub use self::postgres::PostgresEngine;
pub use self::scripted::{JournalEntry, ScriptedEngine, ScriptedResponse};

use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::domain::Row;
use crate::error::{Error, Result};
use crate::loader::{has_data_placeholder, DataFolder};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EngineMode {
    #[default]
    Scripted,
    Postgres,
}

/// An error reported by the engine under test. This is an outcome the verifier
/// inspects, not a failure of the runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineError {
    pub message: String,
    pub code: Option<String>,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    /// Builds an error from raw engine output, keeping only the message text.
    pub fn from_raw(raw: &str) -> Self {
        Self::new(Self::normalize(raw))
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Strips severity prefixes and the `DETAIL`/`HINT`/`CONTEXT`/`QUERY`/`LINE n`
    /// lines that backends append to the primary message.
    pub fn normalize(raw: &str) -> String {
        let mut kept: Vec<&str> = Vec::new();
        let mut skip_pointer = false;
        for line in raw.lines() {
            let trimmed = line.trim();
            if skip_pointer && trimmed.chars().all(|c| c == '^') {
                skip_pointer = false;
                continue;
            }
            skip_pointer = false;
            if is_context_line(trimmed) {
                skip_pointer = trimmed.starts_with("LINE ");
                continue;
            }
            kept.push(line);
        }

        let joined = kept.join("\n");
        let mut message = joined.trim();
        for prefix in SEVERITY_PREFIXES {
            if let Some(rest) = message.strip_prefix(prefix) {
                message = rest.trim_start();
                break;
            }
        }
        message.to_string()
    }
}

const SEVERITY_PREFIXES: &[&str] = &["ERROR:", "FATAL:", "PANIC:", "error:"];

const CONTEXT_PREFIXES: &[&str] = &["DETAIL:", "HINT:", "CONTEXT:", "QUERY:"];

fn is_context_line(line: &str) -> bool {
    if CONTEXT_PREFIXES.iter().any(|p| line.starts_with(p)) {
        return true;
    }
    match line.strip_prefix("LINE ") {
        Some(rest) => match rest.split_once(':') {
            Some((num, _)) => !num.is_empty() && num.chars().all(|c| c.is_ascii_digit()),
            None => false,
        },
        None => false,
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} (SQLSTATE {})", self.message, code),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for EngineError {}

/// What the engine returned for one statement.
pub type Outcome = std::result::Result<Vec<Row>, EngineError>;

/// One logical connection to the engine under test. Statements run one at a
/// time and their effects persist for later statements on the same session.
#[async_trait]
pub trait Session: Send {
    async fn execute(&mut self, sql: &str) -> Outcome;

    async fn close(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait Engine: Send + Sync {
    fn mode(&self) -> EngineMode;

    async fn open_session(&self) -> Result<Box<dyn Session>>;
}

/// Runs statements on an exclusively owned session under a per-statement
/// deadline and an external cancellation signal.
pub struct StatementExecutor {
    session: Box<dyn Session>,
    timeout: Duration,
    cancel: CancellationToken,
    data_folder: Option<DataFolder>,
}

impl StatementExecutor {
    pub fn new(session: Box<dyn Session>, timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            session,
            timeout,
            cancel,
            data_folder: None,
        }
    }

    pub fn with_data_folder(mut self, data_folder: Option<DataFolder>) -> Self {
        self.data_folder = data_folder;
        self
    }

    /// Sends exactly one statement. `Ok` carries the engine's outcome, including
    /// engine errors; `Err` is reserved for timeouts, cancellation and statements
    /// that could not be prepared for sending.
    pub async fn execute(&mut self, sql: &str) -> Result<Outcome> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let sql = self.prepare_sql(sql)?;
        let start = Instant::now();

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = tokio::time::timeout(self.timeout, self.session.execute(&sql)) => {
                crate::metrics::record_statement_duration(start);
                result.map_err(|_| Error::Timeout {
                    statement: sql.to_string(),
                    elapsed_ms: start.elapsed().as_millis() as u64,
                })
            }
        }
    }

    fn prepare_sql<'a>(&self, sql: &'a str) -> Result<std::borrow::Cow<'a, str>> {
        match &self.data_folder {
            Some(folder) => folder.substitute(sql),
            None if has_data_placeholder(sql) => Err(Error::Config(format!(
                "Statement references a data file but no data directory is configured: {}",
                sql
            ))),
            None => Ok(std::borrow::Cow::Borrowed(sql)),
        }
    }

    pub async fn close(self) -> Result<()> {
        self.session.close().await
    }
}
