//! Outcome records and the reporting seam
//!
//! Every check ends in exactly one [`OutcomeRecord`]. Records are handed to a
//! [`Reporter`] as they are produced and never changed afterwards.

use serde::Serialize;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

/// Severity of a single check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Outcome {
    Ok,
    Info,
    Issue,
    Error,
}

impl Outcome {
    /// Issues and Errors count against conformance
    pub fn is_defect(&self) -> bool {
        matches!(self, Outcome::Issue | Outcome::Error)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Ok => write!(f, "OK"),
            Outcome::Info => write!(f, "INFO"),
            Outcome::Issue => write!(f, "ISSUE"),
            Outcome::Error => write!(f, "ERROR"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutcomeRecord {
    pub outcome: Outcome,
    pub test: String,
    pub message: String,
}

impl OutcomeRecord {
    pub fn new(outcome: Outcome, test: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            outcome,
            test: test.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for OutcomeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<24} {:<6} {}", self.test, self.outcome, self.message)
    }
}

/// Receives outcome records and diagnostic lines from a run
pub trait Reporter: Send + Sync {
    fn record(&self, record: &OutcomeRecord);

    /// Free-form diagnostic or "about to call" line
    fn trace(&self, test: &str, message: &str);

    /// A test group was switched off in the settings
    fn configuration_alert(&self, message: &str);
}

/// Writes everything through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn record(&self, record: &OutcomeRecord) {
        match record.outcome {
            Outcome::Ok | Outcome::Info => tracing::info!("{}", record),
            Outcome::Issue => tracing::warn!("{}", record),
            Outcome::Error => tracing::error!("{}", record),
        }
    }

    fn trace(&self, test: &str, message: &str) {
        tracing::debug!("{:<24} {}", test, message);
    }

    fn configuration_alert(&self, message: &str) {
        tracing::warn!("Configuration: {}", message);
    }
}

/// Keeps every record in memory
#[derive(Debug, Default)]
pub struct RecordingReporter {
    records: Mutex<Vec<OutcomeRecord>>,
    traces: Mutex<Vec<(String, String)>>,
    alerts: Mutex<Vec<String>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<OutcomeRecord> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Trace lines as (test, message)
    pub fn traces(&self) -> Vec<(String, String)> {
        self.traces.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn alerts(&self) -> Vec<String> {
        self.alerts.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Records for one test name
    pub fn for_test(&self, test: &str) -> Vec<OutcomeRecord> {
        self.records().into_iter().filter(|r| r.test == test).collect()
    }

    /// Outcomes recorded for one test name, in order
    pub fn outcomes(&self, test: &str) -> Vec<Outcome> {
        self.for_test(test).into_iter().map(|r| r.outcome).collect()
    }

    pub fn has(&self, test: &str, outcome: Outcome) -> bool {
        self.for_test(test).iter().any(|r| r.outcome == outcome)
    }

    pub fn count(&self, outcome: Outcome) -> usize {
        self.records().iter().filter(|r| r.outcome == outcome).count()
    }

    pub fn defects(&self) -> Vec<OutcomeRecord> {
        self.records().into_iter().filter(|r| r.outcome.is_defect()).collect()
    }
}

impl Reporter for RecordingReporter {
    fn record(&self, record: &OutcomeRecord) {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).push(record.clone());
    }

    fn trace(&self, test: &str, message: &str) {
        self.traces
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((test.to_string(), message.to_string()));
    }

    fn configuration_alert(&self, message: &str) {
        self.alerts.lock().unwrap_or_else(|e| e.into_inner()).push(message.to_string());
    }
}

/// Running totals per severity
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    pub ok: usize,
    pub info: usize,
    pub issues: usize,
    pub errors: usize,
}

impl OutcomeCounts {
    pub fn add(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Ok => self.ok += 1,
            Outcome::Info => self.info += 1,
            Outcome::Issue => self.issues += 1,
            Outcome::Error => self.errors += 1,
        }
    }
}

/// Result of a whole run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub counts: OutcomeCounts,
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl RunSummary {
    /// No Issues, no Errors and the run was not cut short
    pub fn is_conformant(&self) -> bool {
        !self.cancelled && self.counts.issues == 0 && self.counts.errors == 0
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ok, {} info, {} issues, {} errors in {:.1}s{}",
            self.counts.ok,
            self.counts.info,
            self.counts.issues,
            self.counts.errors,
            self.elapsed.as_secs_f64(),
            if self.cancelled { " (cancelled)" } else { "" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_reporter_filters_by_test() {
        let reporter = RecordingReporter::new();
        reporter.record(&OutcomeRecord::new(Outcome::Ok, "Altitude", "45.0"));
        reporter.record(&OutcomeRecord::new(Outcome::Issue, "Azimuth", "out of range"));
        reporter.record(&OutcomeRecord::new(Outcome::Info, "Altitude", "note"));
        reporter.configuration_alert("Performance tests disabled");

        assert_eq!(reporter.outcomes("Altitude"), vec![Outcome::Ok, Outcome::Info]);
        assert!(reporter.has("Azimuth", Outcome::Issue));
        assert_eq!(reporter.count(Outcome::Issue), 1);
        assert_eq!(reporter.defects().len(), 1);
        assert_eq!(reporter.alerts(), vec!["Performance tests disabled".to_string()]);
    }

    #[test]
    fn test_counts_and_summary() {
        let mut counts = OutcomeCounts::default();
        for outcome in [Outcome::Ok, Outcome::Ok, Outcome::Info, Outcome::Issue] {
            counts.add(outcome);
        }
        let summary = RunSummary {
            counts,
            cancelled: false,
            elapsed: Duration::from_secs(2),
        };
        assert!(!summary.is_conformant());
        assert_eq!(summary.to_string(), "2 ok, 1 info, 1 issues, 0 errors in 2.0s");
    }

    #[test]
    fn test_defect_severities() {
        assert!(!Outcome::Ok.is_defect());
        assert!(!Outcome::Info.is_defect());
        assert!(Outcome::Issue.is_defect());
        assert!(Outcome::Error.is_defect());
    }
}
