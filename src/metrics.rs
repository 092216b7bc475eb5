use metrics::{counter, gauge, histogram};
use std::time::Instant;

pub fn record_statement_verdict(verdict: &str) {
    counter!("statements_total", "verdict" => verdict.to_string()).increment(1);
}

pub fn record_statement_duration(start: Instant) {
    histogram!("statement_duration_seconds").record(start.elapsed().as_secs_f64());
}

pub fn record_suite_status(status: &str) {
    counter!("suites_total", "status" => status.to_string()).increment(1);
}

pub fn record_run_duration(root: &str, start: Instant) {
    let duration = start.elapsed().as_secs_f64();
    histogram!("run_duration_seconds", "root" => root.to_string()).record(duration);
}

pub fn set_active_sessions(count: usize) {
    gauge!("active_sessions").set(count as f64);
}

pub fn record_session_opened() {
    counter!("sessions_opened_total").increment(1);
}

pub fn record_session_closed() {
    counter!("sessions_closed_total").increment(1);
}

pub fn record_corpus_run(passed: usize, failed: usize, skipped: usize) {
    counter!("corpus_roots_passed_total").increment(passed as u64);
    counter!("corpus_roots_failed_total").increment(failed as u64);
    counter!("corpus_roots_skipped_total").increment(skipped as u64);
}
