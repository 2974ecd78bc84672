//! Run report aggregation
//!
//! Pure collection: verdicts and freeform messages accumulate per test,
//! keyed by identity and category, with filtering and a summary count at
//! the end. No decision logic lives here.

use std::fmt;

use serde::Serialize;

use crate::catalog::{TestCategory, TestId};

/// Final classification of one test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Verdict {
    /// All responses matched, nothing noteworthy
    Pass,
    /// A response matched no accepted pattern, or test logic failed it
    Fail,
    /// Passed, but with warnings attached
    Warning,
    /// Passed, with advisories but no warnings
    AdvisoryOnly,
    /// Never executed: unmet dependency, unsupported parameter, or the run
    /// was cancelled/abandoned first
    NotRun,
    /// The device violated the protocol itself, or the test chain could
    /// not be driven to completion
    Broken,
}

impl Verdict {
    /// Whether this verdict counts as a pass in the summary
    pub fn passed(self) -> bool {
        matches!(self, Self::Pass | Self::Warning | Self::AdvisoryOnly)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Warning => "WARNING",
            Self::AdvisoryOnly => "ADVISORY",
            Self::NotRun => "NOT-RUN",
            Self::Broken => "BROKEN",
        };
        write!(f, "{}", name)
    }
}

/// Kind of a freeform report message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MessageKind {
    /// Explains a Fail or Broken verdict
    Error,
    Warning,
    Advisory,
    /// Neutral context, e.g. why a test was skipped
    Note,
}

/// A message attached to a test's report entry
#[derive(Debug, Clone, Serialize)]
pub struct ReportMessage {
    pub kind: MessageKind,
    pub text: String,
}

impl ReportMessage {
    pub fn new(kind: MessageKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }
}

/// Report entry for one test
#[derive(Debug, Clone, Serialize)]
pub struct TestReport {
    pub id: TestId,
    pub category: TestCategory,
    pub verdict: Verdict,
    pub messages: Vec<ReportMessage>,
}

/// Summary counts over a finished run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub passed: usize,
    pub failed: usize,
    pub broken: usize,
    pub not_run: usize,
    /// Total warning messages across all tests
    pub warnings: usize,
    /// Total advisory messages across all tests
    pub advisories: usize,
}

/// The finished, read-only record of a run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    entries: Vec<TestReport>,
}

impl RunReport {
    /// All entries in execution-plus-skip order
    pub fn entries(&self) -> &[TestReport] {
        &self.entries
    }

    pub fn by_category(&self, category: TestCategory) -> impl Iterator<Item = &TestReport> {
        self.entries.iter().filter(move |e| e.category == category)
    }

    pub fn by_verdict(&self, verdict: Verdict) -> impl Iterator<Item = &TestReport> {
        self.entries.iter().filter(move |e| e.verdict == verdict)
    }

    pub fn get(&self, id: &TestId) -> Option<&TestReport> {
        self.entries.iter().find(|e| &e.id == id)
    }

    pub fn summary(&self) -> Summary {
        let mut summary = Summary::default();
        for entry in &self.entries {
            match entry.verdict {
                Verdict::Pass | Verdict::Warning | Verdict::AdvisoryOnly => summary.passed += 1,
                Verdict::Fail => summary.failed += 1,
                Verdict::Broken => summary.broken += 1,
                Verdict::NotRun => summary.not_run += 1,
            }
            for message in &entry.messages {
                match message.kind {
                    MessageKind::Warning => summary.warnings += 1,
                    MessageKind::Advisory => summary.advisories += 1,
                    _ => {}
                }
            }
        }
        summary
    }
}

/// Accumulates entries while the run executes
#[derive(Debug, Default)]
pub struct ReportBuilder {
    entries: Vec<TestReport>,
}

impl ReportBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, entry: TestReport) {
        tracing::info!(test = %entry.id, verdict = %entry.verdict, "test finished");
        self.entries.push(entry);
    }

    pub fn finish(self) -> RunReport {
        RunReport {
            entries: self.entries,
        }
    }
}

/// Progress notification for live display by the embedding tool
#[derive(Debug, Clone, Serialize)]
pub enum ProgressEvent {
    TestStarted { id: TestId },
    TestFinished { id: TestId, verdict: Verdict },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, verdict: Verdict, messages: Vec<ReportMessage>) -> TestReport {
        TestReport {
            id: TestId::new(id),
            category: TestCategory::Core,
            verdict,
            messages,
        }
    }

    #[test]
    fn summary_counts_by_verdict_and_message_kind() {
        let mut builder = ReportBuilder::new();
        builder.record(entry("a", Verdict::Pass, vec![]));
        builder.record(entry(
            "b",
            Verdict::Warning,
            vec![ReportMessage::new(MessageKind::Warning, "footprint > 512")],
        ));
        builder.record(entry(
            "c",
            Verdict::AdvisoryOnly,
            vec![ReportMessage::new(MessageKind::Advisory, "odd but legal")],
        ));
        builder.record(entry("d", Verdict::Fail, vec![]));
        builder.record(entry("e", Verdict::NotRun, vec![]));
        builder.record(entry("f", Verdict::Broken, vec![]));

        let report = builder.finish();
        let summary = report.summary();
        assert_eq!(summary.passed, 3);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.broken, 1);
        assert_eq!(summary.not_run, 1);
        assert_eq!(summary.warnings, 1);
        assert_eq!(summary.advisories, 1);
    }

    #[test]
    fn filtering_by_verdict() {
        let mut builder = ReportBuilder::new();
        builder.record(entry("a", Verdict::Pass, vec![]));
        builder.record(entry("b", Verdict::Fail, vec![]));
        let report = builder.finish();
        let failed: Vec<_> = report.by_verdict(Verdict::Fail).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id.as_str(), "b");
    }

    #[test]
    fn report_serializes_to_json() {
        let mut builder = ReportBuilder::new();
        builder.record(entry("a", Verdict::Pass, vec![]));
        let report = builder.finish();
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"Pass\""));
    }
}
