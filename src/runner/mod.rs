mod corpus;

pub use corpus::CorpusRunner;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, DependencyMode};
use crate::domain::{RegressionFile, RegressionFileStatement, SuiteName};
use crate::error::Error;
use crate::executor::{Engine, StatementExecutor};
use crate::loader::DataFolder;
use crate::metrics;
use crate::registry::Registry;
use crate::report::{RunReport, StatementRecord, SuiteReport, SuiteRole, SuiteStatus};
use crate::resolver;
use crate::verifier::{verify, Mismatch, Verdict};

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub statement_timeout: Duration,
    pub dependency_mode: DependencyMode,
    /// Run suites that are marked disabled instead of skipping them.
    pub include_disabled: bool,
    pub data_folder: Option<DataFolder>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            statement_timeout: Duration::from_secs(30),
            dependency_mode: DependencyMode::Lenient,
            include_disabled: false,
            data_folder: None,
        }
    }
}

impl RunOptions {
    pub fn from_config(config: &Config) -> crate::error::Result<Self> {
        let data_folder = config
            .fixtures
            .data_dir
            .as_ref()
            .map(DataFolder::new)
            .transpose()?;
        Ok(Self {
            statement_timeout: Duration::from_millis(config.runner.statement_timeout_ms),
            dependency_mode: config.runner.dependency_mode,
            include_disabled: config.runner.include_disabled,
            data_folder,
        })
    }
}

/// Runs one root suite and its resolved dependencies over a single session.
///
/// A run moves through resolution, execution of the resolved order and
/// reporting. Resolution failures end the run before a session is opened; the
/// session, once opened, is always closed before the report is returned.
#[derive(Clone)]
pub struct SuiteRunner {
    registry: Arc<Registry>,
    engine: Arc<dyn Engine>,
    options: RunOptions,
}

impl SuiteRunner {
    pub fn new(registry: Arc<Registry>, engine: Arc<dyn Engine>) -> Self {
        Self {
            registry,
            engine,
            options: RunOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Runs `name` and reports whether it did not fail. Skipped suites count as
    /// not failed.
    pub async fn run_tests(&self, name: &str) -> bool {
        let root = match SuiteName::new(name) {
            Ok(root) => root,
            Err(e) => {
                warn!(error = %e, "Cannot run suite");
                return false;
            }
        };
        let report = self.run(&root, &CancellationToken::new()).await;
        !report.status.is_failure()
    }

    pub async fn run(&self, root: &SuiteName, cancel: &CancellationToken) -> RunReport {
        let start = Instant::now();
        info!(suite = %root, "Starting run");

        let mut report = self.run_root(root, cancel).await;
        report.elapsed_ms = start.elapsed().as_millis() as u64;

        metrics::record_suite_status(report.status.name());
        metrics::record_run_duration(root.as_str(), start);
        if report.status.is_failure() {
            warn!(suite = %root, status = %report.status, elapsed_ms = report.elapsed_ms, "Run failed");
        } else {
            info!(suite = %root, status = %report.status, elapsed_ms = report.elapsed_ms, "Run finished");
        }
        report
    }

    async fn run_root(&self, root: &SuiteName, cancel: &CancellationToken) -> RunReport {
        let root_file = self.registry.lookup(root);

        let order = match resolver::resolve(&self.registry, root) {
            Ok(order) => order,
            Err(e) => {
                warn!(suite = %root, error = %e, "Dependency resolution failed");
                let mut report = RunReport::new(root.clone(), SuiteStatus::SetupError).with_error(e.to_string());
                if let Some(file) = &root_file {
                    report.suites.push(setup_failure_report(file, &e));
                }
                return report;
            }
        };

        let Some(root_file) = root_file else {
            return RunReport::new(root.clone(), SuiteStatus::SetupError)
                .with_error(Error::UnknownSuite(root.to_string()).to_string());
        };

        let mut report = RunReport::new(root.clone(), SuiteStatus::Passed);
        report.order = order.clone();
        debug!(suite = %root, order = ?order, "Resolved execution order");

        if !self.is_enabled(&root_file) {
            info!(suite = %root, "Suite is disabled, skipping");
            report.status = SuiteStatus::Skipped;
            report
                .suites
                .push(uniform_report(&root_file, SuiteRole::Root, SuiteStatus::Skipped, Verdict::Skipped));
            return report;
        }

        if cancel.is_cancelled() {
            report.status = SuiteStatus::Cancelled;
            report
                .suites
                .push(uniform_report(&root_file, SuiteRole::Root, SuiteStatus::Cancelled, Verdict::NotRun));
            return report;
        }

        let session = match self.engine.open_session().await {
            Ok(session) => session,
            Err(e) => {
                let e = e.with_suite(root);
                warn!(suite = %root, error = %e, "Failed to open session");
                report.status = SuiteStatus::SetupError;
                report.error = Some(e.to_string());
                report.suites.push(setup_failure_report(&root_file, &e));
                return report;
            }
        };
        metrics::record_session_opened();

        let mut executor = StatementExecutor::new(session, self.options.statement_timeout, cancel.clone())
            .with_data_folder(self.options.data_folder.clone());

        let status = self
            .run_resolved(&mut executor, &root_file, &order, &mut report)
            .await;
        report.status = status;

        if let Err(e) = executor.close().await {
            warn!(suite = %root, error = %e, "Failed to close session");
        }
        metrics::record_session_closed();

        report
    }

    async fn run_resolved(
        &self,
        executor: &mut StatementExecutor,
        root_file: &RegressionFile,
        order: &[SuiteName],
        report: &mut RunReport,
    ) -> SuiteStatus {
        let strict = self.options.dependency_mode == DependencyMode::Strict;

        for name in order {
            let Some(file) = self.registry.lookup(name) else {
                report.error = Some(Error::UnknownSuite(name.to_string()).to_string());
                return SuiteStatus::SetupError;
            };
            let role = if file.name == root_file.name {
                SuiteRole::Root
            } else {
                SuiteRole::Dependency
            };

            if !self.is_enabled(&file) {
                debug!(suite = %file.name, "Dependency is disabled, contributing no statements");
                report
                    .suites
                    .push(uniform_report(&file, role, SuiteStatus::Skipped, Verdict::Skipped));
                continue;
            }

            let fail_fast = role == SuiteRole::Root || strict;
            let suite = self.run_suite(executor, &file, role, fail_fast).await;
            let status = suite.status;
            report.suites.push(suite);

            if role == SuiteRole::Root {
                return status;
            }

            let abort = match status {
                SuiteStatus::Timeout | SuiteStatus::Cancelled => Some(status),
                SuiteStatus::Failed | SuiteStatus::SetupError if strict => {
                    warn!(suite = %root_file.name, dependency = %file.name, "Dependency failed");
                    Some(SuiteStatus::DependencyFailed)
                }
                SuiteStatus::Failed => {
                    debug!(suite = %root_file.name, dependency = %file.name, "Dependency had failures, continuing");
                    None
                }
                _ => None,
            };
            if let Some(status) = abort {
                report
                    .suites
                    .push(uniform_report(root_file, SuiteRole::Root, status, Verdict::NotRun));
                return status;
            }
        }

        // The resolved order always ends with the root.
        SuiteStatus::SetupError
    }

    async fn run_suite(
        &self,
        executor: &mut StatementExecutor,
        file: &RegressionFile,
        role: SuiteRole,
        fail_fast: bool,
    ) -> SuiteReport {
        let mut suite = SuiteReport::new(file.name.clone(), role);
        let mut stopped: Option<SuiteStatus> = None;
        let mut any_failed = false;

        for (index, stmt) in file.statements.iter().enumerate() {
            let (verdict, elapsed_ms) = if stopped.is_some() {
                (Verdict::NotRun, 0)
            } else if stmt.skip {
                (Verdict::Skipped, 0)
            } else {
                run_statement(executor, stmt).await
            };

            if verdict != Verdict::NotRun {
                metrics::record_statement_verdict(verdict.name());
            }

            match &verdict {
                Verdict::TimedOut { .. } => {
                    warn!(suite = %file.name, statement = index, "Statement timed out");
                    stopped = Some(SuiteStatus::Timeout);
                }
                Verdict::Cancelled => {
                    info!(suite = %file.name, statement = index, "Run cancelled");
                    stopped = Some(SuiteStatus::Cancelled);
                }
                v if v.is_failure() => {
                    any_failed = true;
                    debug!(suite = %file.name, statement = index, verdict = %v, "Statement failed");
                    if fail_fast {
                        stopped = Some(SuiteStatus::Failed);
                    }
                }
                v => debug!(suite = %file.name, statement = index, verdict = v.name(), elapsed_ms, "Statement finished"),
            }

            suite.statements.push(StatementRecord {
                index,
                sql: stmt.sql.clone(),
                verdict,
                elapsed_ms,
            });
        }

        suite.status = match stopped {
            Some(status) => status,
            None if any_failed => SuiteStatus::Failed,
            None => SuiteStatus::Passed,
        };
        suite
    }

    fn is_enabled(&self, file: &RegressionFile) -> bool {
        file.enabled || self.options.include_disabled
    }
}

async fn run_statement(
    executor: &mut StatementExecutor,
    stmt: &RegressionFileStatement,
) -> (Verdict, u64) {
    let start = Instant::now();
    let verdict = match executor.execute(&stmt.sql).await {
        Ok(outcome) => verify(&stmt.expected, &outcome),
        Err(Error::Timeout { elapsed_ms, .. }) => Verdict::TimedOut { elapsed_ms },
        Err(Error::Cancelled) => Verdict::Cancelled,
        Err(e) if e.is_setup() => Verdict::SetupError(e.to_string()),
        Err(e) => Verdict::Failed(Mismatch::UnexpectedError { error: e.to_string() }),
    };
    (verdict, start.elapsed().as_millis() as u64)
}

/// The root's report when the run stopped before its session could be used.
fn setup_failure_report(file: &RegressionFile, error: &Error) -> SuiteReport {
    uniform_report(
        file,
        SuiteRole::Root,
        SuiteStatus::SetupError,
        Verdict::SetupError(error.to_string()),
    )
}

/// A suite report in which every statement carries the same verdict.
fn uniform_report(
    file: &RegressionFile,
    role: SuiteRole,
    status: SuiteStatus,
    verdict: Verdict,
) -> SuiteReport {
    let mut suite = SuiteReport::new(file.name.clone(), role);
    suite.status = status;
    suite.statements = file
        .statements
        .iter()
        .enumerate()
        .map(|(index, stmt)| StatementRecord {
            index,
            sql: stmt.sql.clone(),
            verdict: verdict.clone(),
            elapsed_ms: 0,
        })
        .collect();
    suite
}
