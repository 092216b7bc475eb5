use thiserror::Error;

use crate::domain::SuiteName;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Duplicate suite: {0}")]
    DuplicateSuite(SuiteName),

    #[error("Suite {suite} depends on unregistered suite {dependency}")]
    UnknownDependency {
        suite: SuiteName,
        dependency: SuiteName,
    },

    #[error("Unknown suite: {0}")]
    UnknownSuite(String),

    #[error("Cyclic dependency: {}", format_path(.path))]
    CyclicDependency { path: Vec<SuiteName> },

    #[error("Invalid suite name: {0:?}")]
    InvalidSuiteName(String),

    #[error("Invalid fixture {path}: {reason}")]
    InvalidFixture { path: String, reason: String },

    #[error("Loader error: {0}")]
    Loader(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Statement timed out after {elapsed_ms} ms: {statement}")]
    Timeout { statement: String, elapsed_ms: u64 },

    #[error("Run cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Errors that mean the fixtures or the runner's setup are wrong, as opposed
    /// to the engine misbehaving.
    pub fn is_setup(&self) -> bool {
        matches!(
            self,
            Error::DuplicateSuite(_)
                | Error::UnknownDependency { .. }
                | Error::UnknownSuite(_)
                | Error::CyclicDependency { .. }
                | Error::InvalidSuiteName(_)
                | Error::InvalidFixture { .. }
                | Error::Loader(_)
                | Error::Config(_)
        )
    }

    pub fn with_suite(self, suite: &SuiteName) -> Self {
        match self {
            Error::Engine(msg) => Error::Engine(format!("[suite={}] {}", suite, msg)),
            Error::Loader(msg) => Error::Loader(format!("[suite={}] {}", suite, msg)),
            other => other,
        }
    }
}

fn format_path(path: &[SuiteName]) -> String {
    path.iter()
        .map(|name| name.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> SuiteName {
        SuiteName::new(s).unwrap()
    }

    #[test]
    fn test_error_display_duplicate_suite() {
        let err = Error::DuplicateSuite(name("int4"));
        assert_eq!(format!("{}", err), "Duplicate suite: int4");
    }

    #[test]
    fn test_error_display_unknown_dependency() {
        let err = Error::UnknownDependency {
            suite: name("vacuum_parallel"),
            dependency: name("write_parallel"),
        };
        assert_eq!(
            format!("{}", err),
            "Suite vacuum_parallel depends on unregistered suite write_parallel"
        );
    }

    #[test]
    fn test_error_display_cycle_path() {
        let err = Error::CyclicDependency {
            path: vec![name("a"), name("b"), name("a")],
        };
        assert_eq!(format!("{}", err), "Cyclic dependency: a -> b -> a");
    }

    #[test]
    fn test_error_display_timeout() {
        let err = Error::Timeout {
            statement: "SELECT pg_sleep(10);".to_string(),
            elapsed_ms: 500,
        };
        assert_eq!(
            format!("{}", err),
            "Statement timed out after 500 ms: SELECT pg_sleep(10);"
        );
    }

    #[test]
    fn test_setup_classification() {
        assert!(Error::DuplicateSuite(name("a")).is_setup());
        assert!(Error::UnknownSuite("x".to_string()).is_setup());
        assert!(Error::CyclicDependency { path: vec![] }.is_setup());
        assert!(Error::InvalidSuiteName(String::new()).is_setup());
        assert!(Error::Loader("bad data path".to_string()).is_setup());
        assert!(Error::Config("no data directory".to_string()).is_setup());
        assert!(!Error::Engine("boom".to_string()).is_setup());
        assert!(!Error::Cancelled.is_setup());
        assert!(!Error::Timeout {
            statement: String::new(),
            elapsed_ms: 1
        }
        .is_setup());
    }

    #[test]
    fn test_with_suite_engine() {
        let err = Error::Engine("connection refused".to_string()).with_suite(&name("case"));
        match err {
            Error::Engine(msg) => {
                assert!(msg.contains("[suite=case]"));
                assert!(msg.contains("connection refused"));
            }
            _ => panic!("Expected Engine variant"),
        }
    }

    #[test]
    fn test_with_suite_passthrough() {
        let err = Error::Cancelled.with_suite(&name("case"));
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err: serde_json::Error = serde_json::from_str::<()>("invalid").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }
}
