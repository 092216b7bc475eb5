use std::time::Duration;

use async_trait::async_trait;
use tokio_postgres::types::Type as PgType;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, Config as PgConfig, NoTls, SimpleQueryMessage, SimpleQueryRow};

use super::{Engine, EngineError, EngineMode, Outcome, Session};
use crate::config::EngineConfig;
use crate::domain::{Row, Value};
use crate::error::{Error, Result};

const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);

const DESCRIBE_SAVEPOINT: &str = "regress_runner_describe";

/// Engine reached over the PostgreSQL wire protocol. Each session is its own
/// connection; with `isolate_database` it also gets a scratch database that is
/// dropped when the session closes.
pub struct PostgresEngine {
    config: PgConfig,
    isolate_database: bool,
    connect_retries: u32,
}

impl PostgresEngine {
    pub fn new(url: &str) -> Result<Self> {
        let config: PgConfig = url
            .parse()
            .map_err(|e| Error::Config(format!("Invalid engine url: {}", e)))?;
        Ok(Self {
            config,
            isolate_database: false,
            connect_retries: 3,
        })
    }

    pub fn from_config(engine: &EngineConfig) -> Result<Self> {
        let url = engine
            .url
            .as_deref()
            .ok_or_else(|| Error::Config("No engine url configured".into()))?;
        Ok(Self::new(url)?
            .isolate_database(engine.isolate_database)
            .connect_retries(engine.connect_retries))
    }

    pub fn isolate_database(mut self, isolate: bool) -> Self {
        self.isolate_database = isolate;
        self
    }

    pub fn connect_retries(mut self, retries: u32) -> Self {
        self.connect_retries = retries;
        self
    }

    async fn connect(&self, config: &PgConfig) -> Result<Client> {
        let attempts = self.connect_retries.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match config.connect(NoTls).await {
                Ok((client, connection)) => {
                    tokio::spawn(async move {
                        if let Err(e) = connection.await {
                            tracing::warn!(error = %e, "Engine connection closed with error");
                        }
                    });
                    return Ok(client);
                }
                Err(e) => {
                    tracing::warn!(attempt, attempts, error = %e, "Failed to connect to engine");
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                    }
                }
            }
        }

        Err(Error::Engine(format!(
            "Failed to connect after {} attempts: {}",
            attempts,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }
}

#[async_trait]
impl Engine for PostgresEngine {
    fn mode(&self) -> EngineMode {
        EngineMode::Postgres
    }

    async fn open_session(&self) -> Result<Box<dyn Session>> {
        if !self.isolate_database {
            let client = self.connect(&self.config).await?;
            return Ok(Box::new(PostgresSession {
                client,
                scratch: None,
            }));
        }

        let admin = self.connect(&self.config).await?;
        let name = format!("regress_{}", uuid::Uuid::new_v4().simple());
        admin
            .batch_execute(&format!("CREATE DATABASE \"{}\"", name))
            .await
            .map_err(|e| Error::Engine(format!("Failed to create database {}: {}", name, e)))?;
        tracing::debug!(database = %name, "Created scratch database");

        let mut config = self.config.clone();
        config.dbname(&name);
        let client = match self.connect(&config).await {
            Ok(client) => client,
            Err(e) => {
                drop_database(&admin, &name).await;
                return Err(e);
            }
        };

        Ok(Box::new(PostgresSession {
            client,
            scratch: Some(ScratchDatabase { admin, name }),
        }))
    }
}

struct ScratchDatabase {
    admin: Client,
    name: String,
}

struct PostgresSession {
    client: Client,
    scratch: Option<ScratchDatabase>,
}

impl PostgresSession {
    /// Column types of a statement that has just run successfully on this
    /// session. Inside a transaction block the Parse is wrapped in a savepoint,
    /// since a failed Parse would otherwise abort the block.
    async fn column_types(&self, sql: &str) -> Option<Vec<PgType>> {
        let in_block = match self
            .client
            .simple_query(&format!("SAVEPOINT {}", DESCRIBE_SAVEPOINT))
            .await
        {
            Ok(_) => true,
            Err(e) if e.code() == Some(&SqlState::NO_ACTIVE_SQL_TRANSACTION) => false,
            Err(e) => {
                tracing::debug!(error = %e, "Cannot describe statement, reading cells as text");
                return None;
            }
        };

        let described = self.client.prepare(sql).await;

        if in_block {
            let restore = match &described {
                Ok(_) => format!("RELEASE SAVEPOINT {}", DESCRIBE_SAVEPOINT),
                Err(_) => format!(
                    "ROLLBACK TO SAVEPOINT {0}; RELEASE SAVEPOINT {0}",
                    DESCRIBE_SAVEPOINT
                ),
            };
            if let Err(e) = self.client.batch_execute(&restore).await {
                tracing::warn!(error = %e, "Failed to release describe savepoint");
            }
        }

        match described {
            Ok(statement) => Some(statement.columns().iter().map(|c| c.type_().clone()).collect()),
            Err(e) => {
                tracing::debug!(error = %e, "Cannot describe statement, reading cells as text");
                None
            }
        }
    }
}

#[async_trait]
impl Session for PostgresSession {
    /// Runs `sql` with the simple-query protocol, so the engine sees exactly the
    /// text it was given and reports its own error. Column types are learned
    /// afterwards, and only for single commands that returned rows.
    async fn execute(&mut self, sql: &str) -> Outcome {
        let messages = self
            .client
            .simple_query(sql)
            .await
            .map_err(|e| engine_error(&e))?;

        let raw_rows: Vec<SimpleQueryRow> = messages
            .into_iter()
            .filter_map(|message| match message {
                SimpleQueryMessage::Row(row) => Some(row),
                _ => None,
            })
            .collect();
        if raw_rows.is_empty() {
            return Ok(Vec::new());
        }

        let types = if is_single_command(sql) {
            self.column_types(sql).await
        } else {
            None
        };

        let rows = raw_rows
            .iter()
            .map(|row| {
                (0..row.len())
                    .map(|idx| decode_cell(row.get(idx), types.as_ref().and_then(|t| t.get(idx))))
                    .collect::<Row>()
            })
            .collect();
        Ok(rows)
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let PostgresSession { client, scratch } = *self;
        drop(client);
        if let Some(scratch) = scratch {
            drop_database(&scratch.admin, &scratch.name).await;
        }
        Ok(())
    }
}

async fn drop_database(admin: &Client, name: &str) {
    let sql = format!("DROP DATABASE IF EXISTS \"{}\" WITH (FORCE)", name);
    match admin.batch_execute(&sql).await {
        Ok(()) => tracing::debug!(database = %name, "Dropped scratch database"),
        Err(e) => tracing::warn!(database = %name, error = %e, "Failed to drop scratch database"),
    }
}

fn engine_error(e: &tokio_postgres::Error) -> EngineError {
    match e.as_db_error() {
        Some(db) => EngineError::new(db.message()).with_code(db.code().code()),
        None => EngineError::from_raw(&e.to_string()),
    }
}

/// Whether `sql` holds exactly one command, ignoring a trailing `;`. Quoted text,
/// dollar-quoted bodies and comments are skipped. Text with a psql meta-command
/// never counts as a single command.
fn is_single_command(sql: &str) -> bool {
    let bytes = sql.as_bytes();
    let mut terminated = false;
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        let next = bytes.get(i + 1).copied();
        match c {
            b'-' if next == Some(b'-') => {
                i = find(bytes, i, b"\n").unwrap_or(bytes.len());
                continue;
            }
            b'/' if next == Some(b'*') => {
                i = find(bytes, i + 2, b"*/").map_or(bytes.len(), |end| end + 2);
                continue;
            }
            c if c.is_ascii_whitespace() => {
                i += 1;
                continue;
            }
            _ if terminated => return false,
            b';' => terminated = true,
            b'\\' => return false,
            b'\'' | b'"' => {
                i = find(bytes, i + 1, &[c]).map_or(bytes.len(), |end| end + 1);
                continue;
            }
            b'$' => {
                if let Some(tag_len) = dollar_tag_len(&bytes[i..]) {
                    let tag = &bytes[i..i + tag_len];
                    i = find(bytes, i + tag_len, tag).map_or(bytes.len(), |end| end + tag_len);
                    continue;
                }
            }
            _ => {}
        }
        i += 1;
    }
    true
}

fn find(haystack: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| from + pos)
}

/// Length of a `$tag$` opener at the start of `bytes`, including both `$`.
fn dollar_tag_len(bytes: &[u8]) -> Option<usize> {
    let rest = bytes.get(1..)?;
    let end = rest.iter().position(|&b| b == b'$')?;
    let tag = &rest[..end];
    let valid = tag
        .first()
        .map_or(true, |b| b.is_ascii_alphabetic() || *b == b'_')
        && tag.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'_');
    valid.then_some(end + 2)
}

fn decode_cell(raw: Option<&str>, ty: Option<&PgType>) -> Value {
    let Some(text) = raw else {
        return Value::Null;
    };
    let Some(ty) = ty else {
        return Value::Text(text.to_string());
    };

    let decoded = match *ty {
        PgType::BOOL => match text {
            "t" => Some(Value::Bool(true)),
            "f" => Some(Value::Bool(false)),
            _ => None,
        },
        PgType::INT2 | PgType::INT4 | PgType::INT8 | PgType::OID => {
            text.parse::<i64>().ok().map(Value::Int)
        }
        PgType::FLOAT4 | PgType::FLOAT8 => text.parse::<f64>().ok().map(Value::Float),
        PgType::NUMERIC => Some(Value::Numeric(text.to_string())),
        PgType::BYTEA => decode_bytea(text).map(Value::Bytes),
        _ => None,
    };
    decoded.unwrap_or_else(|| Value::Text(text.to_string()))
}

fn decode_bytea(text: &str) -> Option<Vec<u8>> {
    let hex = text.strip_prefix("\\x")?;
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
        .collect()
}
