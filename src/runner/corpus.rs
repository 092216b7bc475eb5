use std::collections::{HashMap, HashSet};
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::SuiteRunner;
use crate::config::DependencyMode;
use crate::domain::SuiteName;
use crate::metrics;
use crate::registry::Registry;
use crate::report::{CorpusReport, RunReport, SuiteStatus};
use crate::resolver;

pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Runs many roots, each on its own session. Roots run concurrently unless one
/// is in the other's dependency closure, in which case the prerequisite root
/// finishes first.
pub struct CorpusRunner {
    runner: SuiteRunner,
    max_concurrency: usize,
}

impl CorpusRunner {
    pub fn new(runner: SuiteRunner) -> Self {
        Self::with_max_concurrency(runner, DEFAULT_MAX_CONCURRENCY)
    }

    pub fn with_max_concurrency(runner: SuiteRunner, max_concurrency: usize) -> Self {
        Self {
            runner,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Every registered suite, sorted, optionally restricted to those carrying `tag`.
    pub fn select_roots(registry: &Registry, tag: Option<&str>) -> Vec<SuiteName> {
        let mut roots: Vec<SuiteName> = registry
            .iter()
            .filter(|file| tag.map(|t| file.has_tag(t)).unwrap_or(true))
            .map(|file| file.name.clone())
            .collect();
        roots.sort();
        roots
    }

    pub async fn run(&self, roots: &[SuiteName], cancel: &CancellationToken) -> CorpusReport {
        let start = Instant::now();

        let mut seen = HashSet::new();
        let roots: Vec<SuiteName> = roots
            .iter()
            .filter(|r| seen.insert((*r).clone()))
            .cloned()
            .collect();
        let total_count = roots.len();
        info!(roots = total_count, max_concurrency = self.max_concurrency, "Starting corpus run");

        let mut state = ScheduleState::new(&roots, self.prerequisites(&roots), self.max_concurrency);
        let (tx, mut rx) = mpsc::channel::<(SuiteName, RunReport)>(total_count.max(1));
        let block_on_failure = self.runner.options().dependency_mode == DependencyMode::Strict;

        let mut reports: HashMap<SuiteName, RunReport> = HashMap::with_capacity(total_count);

        self.spawn_ready(&mut state, &tx, cancel);
        self.settle_pending(&mut state, &mut reports, cancel);

        while reports.len() < total_count {
            let (name, report) = match rx.recv().await {
                Some(msg) => msg,
                None => break,
            };

            state.finish_in_flight(&name);
            if block_on_failure && report.status.is_failure() {
                state.mark_blocked(&name);
            } else {
                state.mark_completed(&name);
            }
            reports.insert(name, report);

            self.settle_pending(&mut state, &mut reports, cancel);
            self.spawn_ready(&mut state, &tx, cancel);
            self.settle_pending(&mut state, &mut reports, cancel);
        }

        let runs: Vec<RunReport> = roots
            .iter()
            .filter_map(|root| reports.remove(root))
            .collect();
        let corpus = CorpusReport {
            runs,
            elapsed_ms: start.elapsed().as_millis() as u64,
        };

        let counts = corpus.status_counts();
        let failed = corpus.runs.iter().filter(|r| r.status.is_failure()).count();
        let passed = counts.get("passed").copied().unwrap_or(0);
        metrics::record_corpus_run(passed, failed, total_count - passed - failed);
        info!(
            roots = total_count,
            passed,
            failed,
            elapsed_ms = corpus.elapsed_ms,
            "Corpus run finished"
        );
        corpus
    }

    /// For each root, the other roots inside its dependency closure.
    fn prerequisites(&self, roots: &[SuiteName]) -> HashMap<SuiteName, HashSet<SuiteName>> {
        let root_set: HashSet<&SuiteName> = roots.iter().collect();
        roots
            .iter()
            .map(|root| {
                let prereqs = match resolver::dependency_closure(self.runner.registry(), root) {
                    Ok(closure) => closure
                        .into_iter()
                        .filter(|dep| root_set.contains(dep))
                        .collect(),
                    // The run itself reports the resolution failure.
                    Err(_) => HashSet::new(),
                };
                (root.clone(), prereqs)
            })
            .collect()
    }

    fn spawn_ready(
        &self,
        state: &mut ScheduleState,
        tx: &mpsc::Sender<(SuiteName, RunReport)>,
        cancel: &CancellationToken,
    ) {
        if cancel.is_cancelled() {
            return;
        }

        for name in state.ready_roots() {
            state.mark_in_flight(&name);
            let runner = self.runner.clone();
            let tx = tx.clone();
            let cancel = cancel.clone();

            tokio::spawn(async move {
                let root = name.clone();
                let run = tokio::spawn(async move { runner.run(&root, &cancel).await });
                let report = match run.await {
                    Ok(report) => report,
                    Err(e) => {
                        tracing::error!(suite = %name, error = %e, "Suite run aborted");
                        RunReport::new(name.clone(), SuiteStatus::SetupError)
                            .with_error(format!("Suite run aborted: {}", e))
                    }
                };
                if tx.send((name.clone(), report)).await.is_err() {
                    tracing::error!(suite = %name, "Failed to send run report - receiver dropped");
                }
            });
        }
        metrics::set_active_sessions(state.in_flight.len());
    }

    /// Records reports for pending roots that will never be started: those behind
    /// a blocked prerequisite, and everything left once the run is cancelled.
    fn settle_pending(
        &self,
        state: &mut ScheduleState,
        reports: &mut HashMap<SuiteName, RunReport>,
        cancel: &CancellationToken,
    ) {
        loop {
            let newly_blocked: Vec<(SuiteName, SuiteName)> = state
                .pending()
                .filter_map(|name| state.blocked_prerequisite(name).map(|dep| (name.clone(), dep.clone())))
                .collect();
            if newly_blocked.is_empty() {
                break;
            }
            for (name, dep) in newly_blocked {
                warn!(suite = %name, prerequisite = %dep, "Skipping suite, prerequisite failed");
                state.mark_blocked(&name);
                let report = RunReport::new(name.clone(), SuiteStatus::Blocked)
                    .with_error(format!("Prerequisite suite {} failed", dep));
                reports.insert(name, report);
            }
        }

        if cancel.is_cancelled() && state.in_flight.is_empty() {
            let remaining: Vec<SuiteName> = state.pending().cloned().collect();
            for name in remaining {
                state.mark_blocked(&name);
                reports.insert(name.clone(), RunReport::new(name, SuiteStatus::Cancelled));
            }
        }
    }
}

struct ScheduleState {
    order: Vec<SuiteName>,
    pending_deps: HashMap<SuiteName, HashSet<SuiteName>>,
    completed: HashSet<SuiteName>,
    blocked: HashSet<SuiteName>,
    in_flight: HashSet<SuiteName>,
    max_concurrency: usize,
}

impl ScheduleState {
    fn new(
        order: &[SuiteName],
        pending_deps: HashMap<SuiteName, HashSet<SuiteName>>,
        max_concurrency: usize,
    ) -> Self {
        Self {
            order: order.to_vec(),
            pending_deps,
            completed: HashSet::new(),
            blocked: HashSet::new(),
            in_flight: HashSet::new(),
            max_concurrency,
        }
    }

    fn is_pending(&self, name: &SuiteName) -> bool {
        !self.completed.contains(name) && !self.blocked.contains(name) && !self.in_flight.contains(name)
    }

    fn pending(&self) -> impl Iterator<Item = &SuiteName> {
        self.order.iter().filter(|name| self.is_pending(name))
    }

    fn is_ready(&self, name: &SuiteName) -> bool {
        self.pending_deps
            .get(name)
            .map(|deps| deps.is_empty())
            .unwrap_or(true)
            && self.is_pending(name)
    }

    fn blocked_prerequisite(&self, name: &SuiteName) -> Option<&SuiteName> {
        self.pending_deps
            .get(name)
            .and_then(|deps| deps.iter().find(|dep| self.blocked.contains(*dep)))
    }

    fn mark_completed(&mut self, name: &SuiteName) {
        self.completed.insert(name.clone());
        for deps in self.pending_deps.values_mut() {
            deps.remove(name);
        }
    }

    fn mark_blocked(&mut self, name: &SuiteName) {
        self.blocked.insert(name.clone());
    }

    fn mark_in_flight(&mut self, name: &SuiteName) {
        self.in_flight.insert(name.clone());
    }

    fn finish_in_flight(&mut self, name: &SuiteName) {
        self.in_flight.remove(name);
    }

    fn ready_roots(&self) -> Vec<SuiteName> {
        let available_slots = self.max_concurrency.saturating_sub(self.in_flight.len());
        if available_slots == 0 {
            return vec![];
        }

        self.order
            .iter()
            .filter(|name| self.is_ready(name))
            .take(available_slots)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RegressionFile, RegressionFileStatement};
    use crate::executor::ScriptedEngine;
    use crate::runner::RunOptions;
    use std::sync::Arc;
    use std::time::Duration;

    fn name(s: &str) -> SuiteName {
        SuiteName::new(s).unwrap()
    }

    fn suite(s: &str, deps: &[&str]) -> RegressionFile {
        RegressionFile::new(name(s))
            .depends_on(deps.iter().map(|d| name(d)))
            .statement(RegressionFileStatement::void(format!("SELECT '{}';", s)))
    }

    fn corpus(files: Vec<RegressionFile>, engine: &ScriptedEngine, max_concurrency: usize) -> CorpusRunner {
        let mut registry = Registry::new();
        registry.register_all(files).unwrap();
        let runner = SuiteRunner::new(Arc::new(registry), Arc::new(engine.clone()));
        CorpusRunner::with_max_concurrency(runner, max_concurrency)
    }

    #[test]
    fn test_select_roots_by_tag() {
        let mut registry = Registry::new();
        registry
            .register_all(vec![
                suite("int4", &[]).tag("numeric"),
                suite("case", &[]),
                suite("int8", &[]).tag("numeric"),
            ])
            .unwrap();

        assert_eq!(
            CorpusRunner::select_roots(&registry, None),
            vec![name("case"), name("int4"), name("int8")]
        );
        assert_eq!(
            CorpusRunner::select_roots(&registry, Some("numeric")),
            vec![name("int4"), name("int8")]
        );
    }

    #[tokio::test]
    async fn test_corpus_reports_in_input_order() {
        let engine = ScriptedEngine::new();
        let runner = corpus(vec![suite("b", &[]), suite("a", &[]), suite("c", &[])], &engine, 2);

        let report = runner
            .run(&[name("b"), name("a"), name("c"), name("a")], &CancellationToken::new())
            .await;
        let roots: Vec<&str> = report.runs.iter().map(|r| r.root.as_str()).collect();
        assert_eq!(roots, vec!["b", "a", "c"]);
        assert!(report.passed());
        assert_eq!(engine.sessions_opened(), 3);
        assert_eq!(engine.sessions_closed(), 3);
    }

    #[tokio::test]
    async fn test_corpus_failure_does_not_stop_siblings() {
        let engine = ScriptedEngine::new().with_error("SELECT 'int4';", "boom");
        let runner = corpus(vec![suite("int4", &[]), suite("int8", &[])], &engine, 1);

        let report = runner.run(&[name("int4"), name("int8")], &CancellationToken::new()).await;
        assert_eq!(report.run("int4").unwrap().status, SuiteStatus::Failed);
        assert_eq!(report.run("int8").unwrap().status, SuiteStatus::Passed);
        assert!(!report.passed());
    }

    #[tokio::test]
    async fn test_corpus_dependent_roots_never_overlap() {
        let engine = ScriptedEngine::new().with_delay("SELECT 'test_setup';", Duration::from_millis(30));
        let runner = corpus(vec![suite("test_setup", &[]), suite("int4", &["test_setup"])], &engine, 4);

        let report = runner
            .run(&[name("int4"), name("test_setup")], &CancellationToken::new())
            .await;
        assert!(report.passed());

        // Root test_setup runs on session 0; root int4 starts only after it.
        let entries = engine.journal_entries();
        let first_int4 = entries.iter().position(|e| e.sql == "SELECT 'int4';").unwrap();
        let setup_root = entries
            .iter()
            .position(|e| e.sql == "SELECT 'test_setup';")
            .unwrap();
        assert!(setup_root < first_int4);
        assert_eq!(entries[setup_root].session, 0);
        assert_eq!(entries.len(), 3);
    }

    #[tokio::test]
    async fn test_corpus_strict_blocks_dependents() {
        let engine = ScriptedEngine::new().with_error("SELECT 'test_setup';", "boom");
        let mut registry = Registry::new();
        registry
            .register_all(vec![suite("test_setup", &[]), suite("int4", &["test_setup"])])
            .unwrap();
        let runner = SuiteRunner::new(Arc::new(registry), Arc::new(engine.clone())).with_options(RunOptions {
            dependency_mode: DependencyMode::Strict,
            ..RunOptions::default()
        });
        let runner = CorpusRunner::new(runner);

        let report = runner
            .run(&[name("test_setup"), name("int4")], &CancellationToken::new())
            .await;
        assert_eq!(report.run("test_setup").unwrap().status, SuiteStatus::Failed);
        assert_eq!(report.run("int4").unwrap().status, SuiteStatus::Blocked);
        assert_eq!(engine.sessions_opened(), 1);
    }

    #[tokio::test]
    async fn test_corpus_lenient_runs_dependents_after_failure() {
        let engine = ScriptedEngine::new().with_error("SELECT 'test_setup';", "boom");
        let runner = corpus(vec![suite("test_setup", &[]), suite("int4", &["test_setup"])], &engine, 2);

        let report = runner
            .run(&[name("test_setup"), name("int4")], &CancellationToken::new())
            .await;
        assert_eq!(report.run("test_setup").unwrap().status, SuiteStatus::Failed);
        assert_eq!(report.run("int4").unwrap().status, SuiteStatus::Passed);
    }

    struct PanickingEngine;

    #[async_trait::async_trait]
    impl crate::executor::Engine for PanickingEngine {
        fn mode(&self) -> crate::executor::EngineMode {
            crate::executor::EngineMode::Scripted
        }

        async fn open_session(&self) -> crate::error::Result<Box<dyn crate::executor::Session>> {
            panic!("engine crashed");
        }
    }

    #[tokio::test]
    async fn test_corpus_survives_panicking_run() {
        let mut registry = Registry::new();
        registry.register_all(vec![suite("a", &[]), suite("b", &["a"])]).unwrap();
        let runner = SuiteRunner::new(Arc::new(registry), Arc::new(PanickingEngine));
        let runner = CorpusRunner::new(runner);

        let report = runner.run(&[name("a"), name("b")], &CancellationToken::new()).await;
        assert_eq!(report.runs.len(), 2);
        assert!(report.runs.iter().all(|r| r.status == SuiteStatus::SetupError));
        assert!(report.run("a").unwrap().error.as_deref().unwrap().contains("aborted"));
    }

    #[tokio::test]
    async fn test_corpus_cancelled_before_start() {
        let engine = ScriptedEngine::new();
        let runner = corpus(vec![suite("a", &[]), suite("b", &[])], &engine, 2);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = runner.run(&[name("a"), name("b")], &cancel).await;
        assert_eq!(report.runs.len(), 2);
        assert!(report.runs.iter().all(|r| r.status == SuiteStatus::Cancelled));
        assert_eq!(engine.sessions_opened(), 0);
    }

    #[test]
    fn test_schedule_state_limits_slots() {
        let roots: Vec<SuiteName> = (0..5).map(|i| name(&format!("s{}", i))).collect();
        let mut state = ScheduleState::new(&roots, HashMap::new(), 2);

        let ready = state.ready_roots();
        assert_eq!(ready, vec![name("s0"), name("s1")]);
        for root in &ready {
            state.mark_in_flight(root);
        }
        assert!(state.ready_roots().is_empty());

        state.finish_in_flight(&name("s0"));
        state.mark_completed(&name("s0"));
        assert_eq!(state.ready_roots(), vec![name("s2")]);
    }

    #[test]
    fn test_schedule_state_waits_for_prerequisites() {
        let roots = vec![name("int4"), name("test_setup")];
        let mut deps = HashMap::new();
        deps.insert(name("int4"), HashSet::from([name("test_setup")]));
        let mut state = ScheduleState::new(&roots, deps, 4);

        assert_eq!(state.ready_roots(), vec![name("test_setup")]);
        state.mark_blocked(&name("test_setup"));
        assert_eq!(state.blocked_prerequisite(&name("int4")), Some(&name("test_setup")));
        assert!(state.ready_roots().is_empty());
    }
}
