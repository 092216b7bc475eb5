pub mod config;
pub mod converters;
pub mod domain;
pub mod error;
pub mod executor;
pub mod loader;
pub mod metrics;
pub mod registry;
pub mod report;
pub mod resolver;
pub mod runner;
pub mod verifier;

pub use config::{Config, DependencyMode, LogFormat};
pub use domain::{
    Expected, RegressionFile, RegressionFileStatement, Row, RowOrder, SuiteName, Value, ValueMatch,
};
pub use error::{Error, Result};
pub use executor::{Engine, EngineError, EngineMode, PostgresEngine, ScriptedEngine, Session, StatementExecutor};
pub use loader::{DataFolder, FixtureLoader};
pub use registry::Registry;
pub use report::{compare, Comparison, CorpusReport, RunReport, SuiteReport, SuiteStatus, Totals};
pub use resolver::{dependency_closure, resolve};
pub use runner::{CorpusRunner, RunOptions, SuiteRunner};
pub use verifier::{verify, Mismatch, RowDiff, Verdict};
