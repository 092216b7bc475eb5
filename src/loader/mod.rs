mod data_folder;

use std::path::{Path, PathBuf};

use glob::glob;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info};

use crate::converters::json_to_row;
use crate::domain::{Expected, RegressionFile, RegressionFileStatement, RowOrder, SuiteName, ValueMatch};
use crate::error::{Error, Result};
use crate::registry::Registry;

pub use data_folder::{has_data_placeholder, DataFolder};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FixtureFile {
    name: String,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    statements: Vec<FixtureStatement>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FixtureStatement {
    sql: String,
    #[serde(default)]
    rows: Option<Vec<JsonValue>>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    unordered: bool,
    /// `false` compares cells by exact kind, normalizing only decimals.
    #[serde(default = "default_normalize")]
    normalize: bool,
    #[serde(default)]
    skip: bool,
}

fn default_normalize() -> bool {
    true
}

/// Reads JSON fixture files into a [`Registry`]. All files are collected before
/// anything is resolved, so the order in which files are found does not matter.
pub struct FixtureLoader;

impl FixtureLoader {
    pub fn load_dir(path: impl AsRef<Path>) -> Result<Registry> {
        let mut registry = Registry::new();
        for file in Self::load_files(path)? {
            registry.register(file)?;
        }
        info!(suites = registry.len(), "Loaded fixtures");
        Ok(registry)
    }

    pub fn load_files(path: impl AsRef<Path>) -> Result<Vec<RegressionFile>> {
        let root = path.as_ref();
        if !root.is_dir() {
            return Err(Error::Loader(format!(
                "Fixture path is not a directory: {}",
                root.display()
            )));
        }

        let pattern = root.join("**/*.json");
        let pattern_str = pattern.to_string_lossy();

        let mut files: Vec<PathBuf> = glob(&pattern_str)
            .map_err(|e| Error::Loader(format!("Invalid glob pattern: {}", e)))?
            .filter_map(|r| r.ok())
            .collect();
        files.sort();

        files
            .into_iter()
            .map(|file_path| Self::load_file(&file_path))
            .collect()
    }

    pub fn load_file(path: impl AsRef<Path>) -> Result<RegressionFile> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Loader(format!("Failed to read {}: {}", path.display(), e)))?;
        debug!(path = %path.display(), "Parsing fixture");
        Self::parse_str(&content, &path.display().to_string())
    }

    /// Parses one fixture document. `origin` is only used in error messages.
    pub fn parse_str(content: &str, origin: &str) -> Result<RegressionFile> {
        let invalid = |reason: String| Error::InvalidFixture {
            path: origin.to_string(),
            reason,
        };

        let fixture: FixtureFile =
            serde_json::from_str(content).map_err(|e| invalid(e.to_string()))?;

        let name = SuiteName::new(fixture.name).map_err(|e| invalid(e.to_string()))?;
        let depends_on = fixture
            .depends_on
            .into_iter()
            .map(SuiteName::new)
            .collect::<Result<Vec<_>>>()
            .map_err(|e| invalid(e.to_string()))?;

        let mut file = RegressionFile::new(name).depends_on(depends_on);
        file.enabled = fixture.enabled;
        for tag in fixture.tags {
            file = file.tag(tag);
        }

        for (idx, stmt) in fixture.statements.into_iter().enumerate() {
            let statement =
                convert_statement(stmt).map_err(|reason| invalid(format!("statement {}: {}", idx, reason)))?;
            file.statements.push(statement);
        }

        Ok(file)
    }
}

fn convert_statement(stmt: FixtureStatement) -> std::result::Result<RegressionFileStatement, String> {
    if stmt.sql.trim().is_empty() {
        return Err("sql cannot be empty".to_string());
    }

    if stmt.rows.is_none() {
        if stmt.unordered {
            return Err("unordered only applies to rows".to_string());
        }
        if !stmt.normalize {
            return Err("normalize only applies to rows".to_string());
        }
    }

    let expected = match (stmt.rows, stmt.error) {
        (Some(_), Some(_)) => {
            return Err("rows and error are mutually exclusive".to_string());
        }
        (None, Some(error)) if error.is_empty() => {
            return Err("error substring cannot be empty".to_string());
        }
        (None, Some(error)) => Expected::Error(error),
        (Some(rows), None) => {
            let rows = rows.iter().map(json_to_row).collect::<std::result::Result<Vec<_>, _>>()?;
            let order = if stmt.unordered {
                RowOrder::Unordered
            } else {
                RowOrder::Exact
            };
            let matching = if stmt.normalize {
                ValueMatch::Normalized
            } else {
                ValueMatch::Strict
            };
            Expected::Rows {
                rows,
                order,
                matching,
            }
        }
        (None, None) => Expected::Void,
    };

    Ok(RegressionFileStatement {
        sql: stmt.sql,
        expected,
        skip: stmt.skip,
    })
}
