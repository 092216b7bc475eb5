use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use std::ops::AddAssign;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::domain::SuiteName;
use crate::error::{Error, Result};
use crate::verifier::Verdict;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementRecord {
    pub index: usize,
    pub sql: String,
    pub verdict: Verdict,
    #[serde(default)]
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuiteStatus {
    Passed,
    Failed,
    Skipped,
    SetupError,
    Timeout,
    Cancelled,
    /// A dependency failed under strict dependency mode.
    DependencyFailed,
    /// Not started because a prerequisite root failed.
    Blocked,
}

impl SuiteStatus {
    pub fn name(&self) -> &'static str {
        match self {
            SuiteStatus::Passed => "passed",
            SuiteStatus::Failed => "failed",
            SuiteStatus::Skipped => "skipped",
            SuiteStatus::SetupError => "setup_error",
            SuiteStatus::Timeout => "timeout",
            SuiteStatus::Cancelled => "cancelled",
            SuiteStatus::DependencyFailed => "dependency_failed",
            SuiteStatus::Blocked => "blocked",
        }
    }

    pub fn is_failure(&self) -> bool {
        !matches!(
            self,
            SuiteStatus::Passed | SuiteStatus::Skipped | SuiteStatus::Blocked
        )
    }
}

impl std::fmt::Display for SuiteStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuiteRole {
    Root,
    Dependency,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub passed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl Totals {
    pub fn total(&self) -> usize {
        self.passed + self.skipped + self.failed
    }
}

impl AddAssign for Totals {
    fn add_assign(&mut self, other: Self) {
        self.passed += other.passed;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

/// Verdicts of one suite within a run, in statement order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteReport {
    pub name: SuiteName,
    pub role: SuiteRole,
    pub status: SuiteStatus,
    pub statements: Vec<StatementRecord>,
}

impl SuiteReport {
    pub fn new(name: SuiteName, role: SuiteRole) -> Self {
        Self {
            name,
            role,
            status: SuiteStatus::Passed,
            statements: Vec::new(),
        }
    }

    fn ids_where(&self, pred: impl Fn(&Verdict) -> bool) -> Vec<usize> {
        self.statements
            .iter()
            .filter(|s| pred(&s.verdict))
            .map(|s| s.index)
            .collect()
    }

    pub fn pass_ids(&self) -> Vec<usize> {
        self.ids_where(|v| matches!(v, Verdict::Passed))
    }

    pub fn skip_ids(&self) -> Vec<usize> {
        self.ids_where(|v| matches!(v, Verdict::Skipped))
    }

    pub fn fail_ids(&self) -> Vec<usize> {
        self.ids_where(Verdict::is_failure)
    }

    /// Statements never reached count in none of the three buckets.
    pub fn totals(&self) -> Totals {
        Totals {
            passed: self.pass_ids().len(),
            skipped: self.skip_ids().len(),
            failed: self.fail_ids().len(),
        }
    }

    pub fn first_failure(&self) -> Option<&StatementRecord> {
        self.statements.iter().find(|s| s.verdict.is_failure())
    }
}

/// Outcome of one root invocation: the root plus every dependency that ran on
/// its session, in execution order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub root: SuiteName,
    pub status: SuiteStatus,
    #[serde(default)]
    pub order: Vec<SuiteName>,
    #[serde(default)]
    pub suites: Vec<SuiteReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub elapsed_ms: u64,
}

impl RunReport {
    pub fn new(root: SuiteName, status: SuiteStatus) -> Self {
        Self {
            root,
            status,
            order: Vec::new(),
            suites: Vec::new(),
            error: None,
            elapsed_ms: 0,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn passed(&self) -> bool {
        self.status == SuiteStatus::Passed
    }

    pub fn suite(&self, name: &str) -> Option<&SuiteReport> {
        self.suites.iter().find(|s| s.name.as_str() == name)
    }

    pub fn root_report(&self) -> Option<&SuiteReport> {
        self.suites.iter().find(|s| s.role == SuiteRole::Root)
    }

    /// Totals of the root suite only; dependency verdicts are excluded.
    pub fn totals(&self) -> Totals {
        self.root_report().map(SuiteReport::totals).unwrap_or_default()
    }

    pub fn summary(&self) -> String {
        let totals = self.totals();
        let mut out = format!(
            "{}: {} ({} passed, {} skipped, {} failed, {} ms)",
            self.root, self.status, totals.passed, totals.skipped, totals.failed, self.elapsed_ms
        );
        if let Some(error) = &self.error {
            let _ = write!(out, "\n  {}", error);
        }
        for suite in &self.suites {
            if let Some(failure) = suite.first_failure() {
                let _ = write!(
                    out,
                    "\n  [{}#{}] {}\n    {}",
                    suite.name,
                    failure.index,
                    failure.sql.trim(),
                    failure.verdict.to_string().replace('\n', "\n    ")
                );
            }
        }
        out
    }
}

/// Reports of every root in a corpus run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorpusReport {
    pub runs: Vec<RunReport>,
    #[serde(default)]
    pub elapsed_ms: u64,
}

impl CorpusReport {
    pub fn passed(&self) -> bool {
        self.runs.iter().all(|r| !r.status.is_failure())
    }

    pub fn run(&self, root: &str) -> Option<&RunReport> {
        self.runs.iter().find(|r| r.root.as_str() == root)
    }

    pub fn totals(&self) -> Totals {
        let mut totals = Totals::default();
        for run in &self.runs {
            totals += run.totals();
        }
        totals
    }

    /// Number of roots per status.
    pub fn status_counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for run in &self.runs {
            *counts.entry(run.status.name()).or_insert(0) += 1;
        }
        counts
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), json)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Loader(format!("Failed to read report {}: {}", path.display(), e)))?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementChange {
    pub suite: SuiteName,
    pub index: usize,
    pub sql: String,
    pub detail: Option<String>,
}

/// Difference between two corpus runs, keyed by root suite and statement text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comparison {
    pub from: Totals,
    pub to: Totals,
    pub regressions: Vec<StatementChange>,
    pub progressions: Vec<StatementChange>,
}

pub fn compare(from: &CorpusReport, to: &CorpusReport) -> Comparison {
    let mut regressions = Vec::new();
    let mut progressions = Vec::new();

    for run in &to.runs {
        let before = from.run(run.root.as_str()).and_then(RunReport::root_report);
        let Some(after) = run.root_report() else {
            // Nothing was recorded for the root, e.g. it is no longer registered.
            if run.status.is_failure() {
                let detail = run.error.clone().unwrap_or_else(|| run.status.to_string());
                for record in before.iter().flat_map(|b| &b.statements) {
                    if record.verdict == Verdict::Passed {
                        regressions.push(StatementChange {
                            suite: run.root.clone(),
                            index: record.index,
                            sql: record.sql.clone(),
                            detail: Some(detail.clone()),
                        });
                    }
                }
            }
            continue;
        };
        let failed_before = sql_where(before, Verdict::is_failure);
        let passed_before = sql_where(before, |v| matches!(v, Verdict::Passed));

        for record in &after.statements {
            if record.verdict.is_failure() && !failed_before.contains(record.sql.as_str()) {
                regressions.push(StatementChange {
                    suite: run.root.clone(),
                    index: record.index,
                    sql: record.sql.clone(),
                    detail: Some(record.verdict.to_string()),
                });
            } else if record.verdict == Verdict::Passed
                && !passed_before.contains(record.sql.as_str())
            {
                progressions.push(StatementChange {
                    suite: run.root.clone(),
                    index: record.index,
                    sql: record.sql.clone(),
                    detail: None,
                });
            }
        }
    }

    Comparison {
        from: from.totals(),
        to: to.totals(),
        regressions,
        progressions,
    }
}

fn sql_where(report: Option<&SuiteReport>, pred: impl Fn(&Verdict) -> bool) -> HashSet<&str> {
    report
        .map(|r| {
            r.statements
                .iter()
                .filter(|s| pred(&s.verdict))
                .map(|s| s.sql.as_str())
                .collect()
        })
        .unwrap_or_default()
}

impl Comparison {
    pub fn has_regressions(&self) -> bool {
        !self.regressions.is_empty()
    }

    pub fn to_markdown(&self) -> String {
        let mut sb = String::new();
        sb.push_str("|   | Before | After |\n");
        sb.push_str("| --- | --- | --- |\n");
        let _ = writeln!(sb, "| Total | {} | {} |", self.from.total(), self.to.total());
        let _ = writeln!(sb, "| Successful | {} | {} |", self.from.passed, self.to.passed);
        let _ = writeln!(sb, "| Skipped | {} | {} |", self.from.skipped, self.to.skipped);
        let _ = writeln!(sb, "| Failures | {} | {} |", self.from.failed, self.to.failed);
        let _ = writeln!(
            sb,
            "| Success rate | {:.4}% | {:.4}% |",
            percent(self.from.passed, self.from.total()),
            percent(self.to.passed, self.to.total())
        );

        write_changes(&mut sb, "Regressions", &self.regressions);
        write_changes(&mut sb, "Progressions", &self.progressions);
        sb
    }
}

fn percent(part: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    part as f64 / total as f64 * 100.0
}

fn write_changes(sb: &mut String, title: &str, changes: &[StatementChange]) {
    if changes.is_empty() {
        return;
    }
    let _ = writeln!(sb, "\n## {}", title);
    let mut current: Option<&SuiteName> = None;
    for change in changes {
        if current != Some(&change.suite) {
            let _ = writeln!(sb, "### {}", change.suite);
            current = Some(&change.suite);
        }
        let _ = writeln!(sb, "```\nQUERY:  {}", change.sql.trim());
        if let Some(detail) = &change.detail {
            let _ = writeln!(sb, "RESULT: {}", detail);
        }
        sb.push_str("```\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verifier::Mismatch;
    use tempfile::TempDir;

    fn name(s: &str) -> SuiteName {
        SuiteName::new(s).unwrap()
    }

    fn record(index: usize, sql: &str, verdict: Verdict) -> StatementRecord {
        StatementRecord {
            index,
            sql: sql.to_string(),
            verdict,
            elapsed_ms: 0,
        }
    }

    fn failed() -> Verdict {
        Verdict::Failed(Mismatch::UnexpectedError {
            error: "boom".into(),
        })
    }

    fn run(root: &str, statements: Vec<StatementRecord>) -> RunReport {
        let mut suite = SuiteReport::new(name(root), SuiteRole::Root);
        suite.statements = statements;
        if suite.first_failure().is_some() {
            suite.status = SuiteStatus::Failed;
        }
        let mut report = RunReport::new(name(root), suite.status);
        report.order = vec![name(root)];
        report.suites.push(suite);
        report
    }

    #[test]
    fn test_suite_report_tracker_ids() {
        let mut suite = SuiteReport::new(name("int4"), SuiteRole::Root);
        suite.statements = vec![
            record(0, "CREATE TABLE INT4_TBL(f1 int4);", Verdict::Passed),
            record(1, "\\gset", Verdict::Skipped),
            record(2, "SELECT 1/0;", failed()),
            record(3, "SELECT 1;", Verdict::NotRun),
        ];
        assert_eq!(suite.pass_ids(), vec![0]);
        assert_eq!(suite.skip_ids(), vec![1]);
        assert_eq!(suite.fail_ids(), vec![2]);
        assert_eq!(
            suite.totals(),
            Totals {
                passed: 1,
                skipped: 1,
                failed: 1
            }
        );
        assert_eq!(suite.first_failure().map(|r| r.index), Some(2));
    }

    #[test]
    fn test_run_totals_exclude_dependencies() {
        let mut report = run("case", vec![record(0, "SELECT 1;", Verdict::Passed)]);
        let mut dep = SuiteReport::new(name("test_setup"), SuiteRole::Dependency);
        dep.statements = vec![record(0, "CREATE TABLE x();", failed())];
        report.suites.insert(0, dep);

        assert_eq!(report.totals().passed, 1);
        assert_eq!(report.totals().failed, 0);
        assert_eq!(report.root_report().unwrap().name, name("case"));
        assert!(report.suite("test_setup").is_some());
    }

    #[test]
    fn test_status_classification() {
        assert!(!SuiteStatus::Passed.is_failure());
        assert!(!SuiteStatus::Skipped.is_failure());
        assert!(!SuiteStatus::Blocked.is_failure());
        assert!(SuiteStatus::Timeout.is_failure());
        assert!(SuiteStatus::DependencyFailed.is_failure());
        assert_eq!(SuiteStatus::SetupError.to_string(), "setup_error");
    }

    #[test]
    fn test_corpus_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("report.json");
        let corpus = CorpusReport {
            runs: vec![
                run("case", vec![record(0, "SELECT 1;", Verdict::Passed)]),
                run("int4", vec![record(0, "SELECT 1/0;", failed())]),
            ],
            elapsed_ms: 12,
        };
        corpus.save(&path).unwrap();

        let loaded = CorpusReport::load(&path).unwrap();
        assert_eq!(loaded, corpus);
        assert!(!loaded.passed());
        assert_eq!(loaded.status_counts().get("failed"), Some(&1));
        assert_eq!(loaded.totals().total(), 2);
    }

    #[test]
    fn test_load_missing_report() {
        assert!(matches!(
            CorpusReport::load("/nonexistent/report.json"),
            Err(Error::Loader(_))
        ));
    }

    #[test]
    fn test_compare_regressions_and_progressions() {
        let before = CorpusReport {
            runs: vec![run(
                "int4",
                vec![
                    record(0, "SELECT 1;", Verdict::Passed),
                    record(1, "SELECT 2;", failed()),
                ],
            )],
            elapsed_ms: 0,
        };
        let after = CorpusReport {
            runs: vec![run(
                "int4",
                vec![
                    record(0, "SELECT 1;", failed()),
                    record(1, "SELECT 2;", Verdict::Passed),
                ],
            )],
            elapsed_ms: 0,
        };

        let comparison = compare(&before, &after);
        assert_eq!(comparison.regressions.len(), 1);
        assert_eq!(comparison.regressions[0].sql, "SELECT 1;");
        assert_eq!(comparison.progressions.len(), 1);
        assert_eq!(comparison.progressions[0].sql, "SELECT 2;");
        assert!(comparison.has_regressions());

        let markdown = comparison.to_markdown();
        assert!(markdown.contains("## Regressions\n### int4\n```\nQUERY:  SELECT 1;"));
        assert!(markdown.contains("## Progressions"));
        assert!(markdown.contains("| Total | 2 | 2 |"));
    }

    #[test]
    fn test_compare_root_without_statements_regresses() {
        let before = CorpusReport {
            runs: vec![run(
                "int4",
                vec![
                    record(0, "SELECT 1;", Verdict::Passed),
                    record(1, "SELECT 2;", Verdict::Passed),
                    record(2, "SELECT 3;", failed()),
                ],
            )],
            elapsed_ms: 0,
        };
        let after = CorpusReport {
            runs: vec![RunReport::new(SuiteName::new("int4").unwrap(), SuiteStatus::SetupError)
                .with_error("Unknown suite: int4")],
            elapsed_ms: 0,
        };

        let comparison = compare(&before, &after);
        let sql: Vec<&str> = comparison.regressions.iter().map(|r| r.sql.as_str()).collect();
        assert_eq!(sql, vec!["SELECT 1;", "SELECT 2;"]);
        assert_eq!(
            comparison.regressions[0].detail.as_deref(),
            Some("Unknown suite: int4")
        );
        assert!(comparison.has_regressions());

        let blocked = CorpusReport {
            runs: vec![RunReport::new(SuiteName::new("int4").unwrap(), SuiteStatus::Blocked)],
            elapsed_ms: 0,
        };
        assert!(!compare(&before, &blocked).has_regressions());
    }

    #[test]
    fn test_compare_identical_runs() {
        let corpus = CorpusReport {
            runs: vec![run("case", vec![record(0, "SELECT 1;", Verdict::Passed)])],
            elapsed_ms: 0,
        };
        let comparison = compare(&corpus, &corpus);
        assert!(comparison.regressions.is_empty());
        assert!(comparison.progressions.is_empty());
        assert!(!comparison.to_markdown().contains("##"));
    }
}
