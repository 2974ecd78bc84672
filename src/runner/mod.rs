//! Run coordination
//!
//! Drives the scheduled order strictly one test at a time per target: build
//! the instance, run `initiate`, hand the request to the transport, await
//! exactly one response (or the deadline), classify it, and loop through
//! continuations until the test is done. One coordinator per target; there
//! is no shared mutable state across concurrent target runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Notify};
use tokio::time::timeout;

use crate::behavior::{EarlyVerdict, MatchedResponse, TestContext};
use crate::catalog::{Catalog, TestDescriptor};
use crate::common::{EngineConfig, Result};
use crate::matcher::{classify, Classification, Severity};
use crate::property::PropertyStore;
use crate::protocol::{
    describe_parameter, ExchangeOutcome, ParameterRegistry, Target, Transport,
};
use crate::report::{
    MessageKind, ProgressEvent, ReportBuilder, ReportMessage, RunReport, TestReport, Verdict,
};
use crate::schedule::{self, SkipReason};

/// Cooperative cancellation handle for a run
///
/// Cancelling never loses the report: tests not yet executed are recorded
/// NOT-RUN with reason "run cancelled".
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // register with the Notify before the final flag check; a cancel
        // landing in between would otherwise notify no one and the wakeup
        // would be lost until the current exchange resolved
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

/// Lifecycle phase of a test instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Pending,
    AwaitingResponse,
    Continuing,
    Verifying,
}

/// Effect of one test execution on the channel health accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransportHealth {
    /// No exchange completed (early verdict, or accepted silence)
    Untouched,
    /// A response arrived; the channel works
    Responsive,
    /// Timeout or channel error
    Failed,
}

/// How a single test came to rest
enum Disposition {
    /// Chain completed and every response matched
    Clean,
    Failed(String),
    Broken(String),
    NotRun(String),
}

struct Execution {
    verdict: Verdict,
    messages: Vec<ReportMessage>,
    health: TransportHealth,
    cancelled: bool,
}

/// Executes a scheduled catalog against one target
pub struct RunCoordinator<T> {
    target: Target,
    transport: T,
    registry: Arc<dyn ParameterRegistry>,
    config: EngineConfig,
    progress: Option<mpsc::UnboundedSender<ProgressEvent>>,
    cancel: CancelToken,
}

impl<T: Transport> RunCoordinator<T> {
    pub fn new(
        target: Target,
        transport: T,
        registry: Arc<dyn ParameterRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            target,
            transport,
            registry,
            config,
            progress: None,
            cancel: CancelToken::new(),
        }
    }

    /// Stream progress events (test started/finished) to a channel
    pub fn with_progress(mut self, sender: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        self.progress = Some(sender);
        self
    }

    /// Handle for aborting the run from elsewhere
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(sender) = &self.progress {
            let _ = sender.send(event);
        }
    }

    /// Execute the full catalog and return the report
    ///
    /// Catalog-authoring errors (cycles, ambiguous producers) abort before
    /// any request is sent. Everything else ends up in the report.
    #[tracing::instrument(skip(self, catalog), fields(target = %self.target))]
    pub async fn run(&mut self, catalog: &Catalog) -> Result<RunReport> {
        let schedule = schedule::plan(catalog, self.registry.as_ref())?;

        let mut store = PropertyStore::new();
        let mut builder = ReportBuilder::new();

        // plan() derives the indices from this catalog, so lookups succeed
        for (index, reason) in &schedule.skipped {
            let Some(test) = catalog.get(*index) else {
                continue;
            };
            let text = match reason {
                SkipReason::UnsupportedParameter => format!(
                    "{} not supported by the device",
                    describe_parameter(self.registry.as_ref(), test.parameter)
                ),
                other => other.to_string(),
            };
            builder.record(TestReport {
                id: test.id.clone(),
                category: test.category,
                verdict: Verdict::NotRun,
                messages: vec![ReportMessage::new(MessageKind::Note, text)],
            });
        }

        let mut consecutive_failures = 0u32;
        let mut abandoned: Option<&str> = None;

        for &index in &schedule.ordered {
            let Some(test) = catalog.get(index) else {
                continue;
            };

            if abandoned.is_none() && self.cancel.is_cancelled() {
                abandoned = Some("run cancelled");
            }
            if let Some(reason) = abandoned {
                builder.record(TestReport {
                    id: test.id.clone(),
                    category: test.category,
                    verdict: Verdict::NotRun,
                    messages: vec![ReportMessage::new(MessageKind::Note, reason)],
                });
                continue;
            }

            self.emit(ProgressEvent::TestStarted {
                id: test.id.clone(),
            });

            let execution = self.execute(test, &mut store).await;

            match execution.health {
                TransportHealth::Responsive => consecutive_failures = 0,
                TransportHealth::Failed => consecutive_failures += 1,
                TransportHealth::Untouched => {}
            }

            self.emit(ProgressEvent::TestFinished {
                id: test.id.clone(),
                verdict: execution.verdict,
            });
            builder.record(TestReport {
                id: test.id.clone(),
                category: test.category,
                verdict: execution.verdict,
                messages: execution.messages,
            });

            if execution.cancelled {
                abandoned = Some("run cancelled");
            } else if consecutive_failures >= self.config.unreachable_threshold {
                tracing::warn!(
                    failures = consecutive_failures,
                    "abandoning run, device unreachable"
                );
                abandoned = Some("device unreachable");
            }
        }

        Ok(builder.finish())
    }

    /// Drive one test's state machine to completion
    async fn execute(&mut self, test: &TestDescriptor, store: &mut PropertyStore) -> Execution {
        let mut ctx = TestContext::new(
            test.id.clone(),
            test.parameter,
            self.target.sub_device,
            store,
        );
        let mut phase = Phase::Pending;

        if let Err(e) = test.behavior.initiate(&mut ctx) {
            return finish(&ctx, Disposition::Broken(e.to_string()), TransportHealth::Untouched);
        }

        let mut rounds = 0u32;
        let mut health = TransportHealth::Untouched;
        let disposition = loop {
            if let Some(early) = ctx.take_early() {
                break match early {
                    EarlyVerdict::NotRun(reason) => Disposition::NotRun(reason),
                    EarlyVerdict::Failed(reason) => Disposition::Failed(reason),
                    EarlyVerdict::Broken(reason) => Disposition::Broken(reason),
                };
            }

            let Some((request, expected)) = ctx.take_outgoing() else {
                if phase == Phase::Pending {
                    break Disposition::Broken("initiate produced no request".to_string());
                }
                break Disposition::Clean;
            };

            rounds += 1;
            if rounds > self.config.max_continuation_rounds {
                break Disposition::Broken(format!(
                    "continuation loop exceeded after {} round trips",
                    self.config.max_continuation_rounds
                ));
            }

            phase = Phase::AwaitingResponse;
            tracing::debug!(
                test = %test.id,
                command = %request.command_class,
                parameter = %request.parameter,
                sub_device = request.sub_device,
                round = rounds,
                "sending request"
            );

            let cancel = self.cancel.clone();
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Execution {
                        verdict: Verdict::NotRun,
                        messages: vec![ReportMessage::new(MessageKind::Note, "run cancelled")],
                        health: TransportHealth::Untouched,
                        cancelled: true,
                    };
                }
                result = timeout(
                    self.config.request_timeout(),
                    self.transport.send(&self.target, &request),
                ) => match result {
                    Err(_) => {
                        tracing::debug!(test = %test.id, "request deadline expired");
                        ExchangeOutcome::NoResponse
                    }
                    Ok(Err(e)) => {
                        health = TransportHealth::Failed;
                        break Disposition::Failed(format!("transport error: {}", e));
                    }
                    Ok(Ok(response)) => {
                        health = TransportHealth::Responsive;
                        if response.parameter != request.parameter {
                            break Disposition::Broken(format!(
                                "response names wrong parameter: sent {}, answered {}",
                                describe_parameter(self.registry.as_ref(), request.parameter),
                                describe_parameter(self.registry.as_ref(), response.parameter),
                            ));
                        }
                        ExchangeOutcome::Response(response)
                    }
                },
            };

            match classify(&expected, &outcome) {
                Classification::Unmatched { description } => {
                    if matches!(outcome, ExchangeOutcome::NoResponse) {
                        health = TransportHealth::Failed;
                    }
                    break Disposition::Failed(format!("unexpected response: {}", description));
                }
                Classification::Matched(index) => {
                    let Some(entry) = expected.into_iter().nth(index) else {
                        break Disposition::Broken(format!(
                            "matcher returned out-of-range entry {}",
                            index
                        ));
                    };
                    if let Some((severity, message)) = entry.severity() {
                        let message = message.to_string();
                        match severity {
                            Severity::Warning => ctx.add_warning(message),
                            Severity::Advisory => ctx.add_advisory(message),
                        }
                    }
                    let matched = MatchedResponse::from_outcome(&outcome);
                    match entry.into_continuation() {
                        Some(continuation) => {
                            phase = Phase::Continuing;
                            if let Err(e) = continuation(&mut ctx, &matched) {
                                break Disposition::Broken(e.to_string());
                            }
                        }
                        None => {
                            phase = Phase::Verifying;
                            if let Err(e) = test.behavior.verify(&mut ctx, &matched) {
                                break Disposition::Broken(e.to_string());
                            }
                        }
                    }
                }
            }
        };

        finish(&ctx, disposition, health)
    }
}

/// Fold the disposition and collected annotations into a verdict
fn finish(ctx: &TestContext<'_>, disposition: Disposition, health: TransportHealth) -> Execution {
    let mut messages = Vec::new();
    let verdict = match disposition {
        Disposition::Failed(reason) => {
            messages.push(ReportMessage::new(MessageKind::Error, reason));
            Verdict::Fail
        }
        Disposition::Broken(reason) => {
            messages.push(ReportMessage::new(MessageKind::Error, reason));
            Verdict::Broken
        }
        Disposition::NotRun(reason) => {
            messages.push(ReportMessage::new(MessageKind::Note, reason));
            Verdict::NotRun
        }
        Disposition::Clean => {
            if !ctx.warnings().is_empty() {
                Verdict::Warning
            } else if !ctx.advisories().is_empty() {
                Verdict::AdvisoryOnly
            } else {
                Verdict::Pass
            }
        }
    };

    for warning in ctx.warnings() {
        messages.push(ReportMessage::new(MessageKind::Warning, warning.clone()));
    }
    for advisory in ctx.advisories() {
        messages.push(ReportMessage::new(MessageKind::Advisory, advisory.clone()));
    }

    Execution {
        verdict,
        messages,
        health,
        cancelled: false,
    }
}
