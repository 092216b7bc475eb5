mod diff;

pub use diff::{rows_match, DiffEntry, RowDiff};

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::Expected;
use crate::executor::Outcome;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum Mismatch {
    ExpectedErrorButSucceeded { expected: String, rows: usize },
    ErrorMismatch { expected: String, actual: String },
    UnexpectedError { error: String },
    RowsMismatch(RowDiff),
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mismatch::ExpectedErrorButSucceeded { expected, rows } => write!(
                f,
                "expected error containing {:?} but statement succeeded with {} rows",
                expected, rows
            ),
            Mismatch::ErrorMismatch { expected, actual } => write!(
                f,
                "expected error containing {:?}, got {:?}",
                expected, actual
            ),
            Mismatch::UnexpectedError { error } => write!(f, "unexpected error: {}", error),
            Mismatch::RowsMismatch(diff) => write!(f, "{}", diff),
        }
    }
}

/// Per-statement classification. Every statement of a scheduled suite ends up
/// with exactly one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum Verdict {
    Passed,
    Failed(Mismatch),
    Skipped,
    /// The statement could not be sent as written.
    SetupError(String),
    TimedOut { elapsed_ms: u64 },
    Cancelled,
    /// Not executed because an earlier statement stopped the suite.
    NotRun,
}

impl Verdict {
    pub fn name(&self) -> &'static str {
        match self {
            Verdict::Passed => "passed",
            Verdict::Failed(_) => "failed",
            Verdict::Skipped => "skipped",
            Verdict::SetupError(_) => "setup_error",
            Verdict::TimedOut { .. } => "timed_out",
            Verdict::Cancelled => "cancelled",
            Verdict::NotRun => "not_run",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Verdict::Failed(_) | Verdict::SetupError(_) | Verdict::TimedOut { .. } | Verdict::Cancelled
        )
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Failed(mismatch) => write!(f, "failed: {}", mismatch),
            Verdict::SetupError(msg) => write!(f, "setup error: {}", msg),
            Verdict::TimedOut { elapsed_ms } => write!(f, "timed out after {} ms", elapsed_ms),
            other => f.write_str(other.name()),
        }
    }
}

/// Checks one engine outcome against the statement's expectation.
pub fn verify(expected: &Expected, actual: &Outcome) -> Verdict {
    match (expected, actual) {
        (Expected::Error(substring), Err(err)) => {
            if err.message.contains(substring.as_str()) {
                Verdict::Passed
            } else {
                Verdict::Failed(Mismatch::ErrorMismatch {
                    expected: substring.clone(),
                    actual: err.message.clone(),
                })
            }
        }
        (Expected::Error(substring), Ok(rows)) => {
            Verdict::Failed(Mismatch::ExpectedErrorButSucceeded {
                expected: substring.clone(),
                rows: rows.len(),
            })
        }
        (_, Err(err)) => Verdict::Failed(Mismatch::UnexpectedError {
            error: err.message.clone(),
        }),
        (Expected::Void, Ok(_)) => Verdict::Passed,
        (
            Expected::Rows {
                rows,
                order,
                matching,
            },
            Ok(actual_rows),
        ) => {
            match RowDiff::compute(rows, actual_rows, *order, *matching) {
                None => Verdict::Passed,
                Some(diff) => Verdict::Failed(Mismatch::RowsMismatch(diff)),
            }
        }
    }
}
