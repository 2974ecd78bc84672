//! End-to-end tests for the conformance engine
//!
//! Each test wires a small catalog to a scripted in-memory transport that
//! plays the role of the responder, then checks the resulting report.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use rdm_conformance::{
    behavior::{GetAndCapture, GetWithJunkData, SetThenVerify},
    Catalog, CancelToken, CommandClass, DeviceResponse, EngineConfig, Error, ExpectedResult,
    FieldValue, NackReason, ParameterId, ParameterRegistry, ProgressEvent, Request, Result,
    RunCoordinator, RunReport, Target, TestBehavior, TestCategory, TestContext, TestDescriptor,
    Transport, Verdict,
};

const COUNT_PID: u16 = 0x0050;
const ITEM_PID: u16 = 0x0051;

/// Registry that supports every parameter except a listed set
struct FakeRegistry {
    unsupported: Vec<u16>,
}

impl FakeRegistry {
    fn all() -> Self {
        Self {
            unsupported: Vec::new(),
        }
    }

    fn without(unsupported: Vec<u16>) -> Self {
        Self { unsupported }
    }
}

impl ParameterRegistry for FakeRegistry {
    fn is_supported(&self, parameter: ParameterId) -> bool {
        !self.unsupported.contains(&parameter.0)
    }

    fn parameter_name(&self, parameter: ParameterId) -> Option<String> {
        match parameter.0 {
            COUNT_PID => Some("ITEM_COUNT".to_string()),
            ITEM_PID => Some("ITEM".to_string()),
            _ => None,
        }
    }
}

/// What the scripted responder does with one request
enum Reply {
    Ack(Vec<(&'static str, FieldValue)>),
    Nack(NackReason),
    /// Never answer; the engine's deadline must fire
    Silence,
    /// Channel-level failure
    ChannelError,
    /// Answer for a different parameter than was asked
    WrongParameter,
}

type RequestLog = Arc<Mutex<Vec<Request>>>;

/// In-memory transport driven by a scripting closure
struct ScriptedTransport {
    log: RequestLog,
    script: Box<dyn FnMut(&Request) -> Reply + Send>,
}

impl ScriptedTransport {
    fn new(script: impl FnMut(&Request) -> Reply + Send + 'static) -> (Self, RequestLog) {
        let log: RequestLog = Arc::default();
        (
            Self {
                log: log.clone(),
                script: Box::new(script),
            },
            log,
        )
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&mut self, _target: &Target, request: &Request) -> Result<DeviceResponse> {
        self.log.lock().unwrap().push(request.clone());
        match (self.script)(request) {
            Reply::Ack(fields) => {
                let fields: BTreeMap<String, FieldValue> = fields
                    .into_iter()
                    .map(|(name, value)| (name.to_string(), value))
                    .collect();
                Ok(DeviceResponse::ack(request.parameter, fields))
            }
            Reply::Nack(reason) => Ok(DeviceResponse::nack(request.parameter, reason)),
            Reply::Silence => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            Reply::ChannelError => Err(Error::transport("port closed")),
            Reply::WrongParameter => Ok(DeviceResponse::ack(
                ParameterId(request.parameter.0 ^ 0x0001),
                BTreeMap::new(),
            )),
        }
    }
}

fn coordinator(
    transport: ScriptedTransport,
    registry: FakeRegistry,
    config: EngineConfig,
) -> RunCoordinator<ScriptedTransport> {
    RunCoordinator::new(
        Target::root("7a70:00000001"),
        transport,
        Arc::new(registry),
        config,
    )
}

fn verdicts(report: &RunReport) -> Vec<(String, Verdict)> {
    report
        .entries()
        .iter()
        .map(|entry| (entry.id.to_string(), entry.verdict))
        .collect()
}

/// GET one item by index; requires the count discovered by another test
struct GetItem {
    index: i64,
}

impl TestBehavior for GetItem {
    fn initiate(&self, ctx: &mut TestContext<'_>) -> Result<()> {
        let count = ctx.get_integer_property("count")?;
        if count < self.index {
            ctx.set_not_run(format!("device reports only {} items", count));
            return Ok(());
        }
        ctx.send_get_with_payload(
            vec![self.index as u8],
            vec![ExpectedResult::ack_with_values([("index", self.index)])],
        )
    }
}

fn item_catalog() -> Catalog {
    // GetItem tests are declared before their producer on purpose: the
    // scheduler must still run GetCount first.
    let mut catalog = Catalog::new();
    for index in 1..=3 {
        catalog.push(
            TestDescriptor::new(
                format!("GetItem{}", index).as_str(),
                TestCategory::SubDevices,
                ParameterId(ITEM_PID),
                Arc::new(GetItem { index }),
            )
            .requires(["count"]),
        );
    }
    catalog.push(
        TestDescriptor::new(
            "GetCount",
            TestCategory::Core,
            ParameterId(COUNT_PID),
            Arc::new(GetAndCapture::new().capture("count", "count")),
        )
        .provides(["count"]),
    );
    catalog
}

#[tokio::test]
async fn end_to_end_count_then_items() {
    let (transport, log) = ScriptedTransport::new(|request| match request.parameter.0 {
        COUNT_PID => Reply::Ack(vec![("count", FieldValue::Integer(3))]),
        ITEM_PID => Reply::Ack(vec![("index", FieldValue::Integer(
            request.payload[0] as i64,
        ))]),
        _ => Reply::Nack(NackReason::UnknownPid),
    });

    let mut runner = coordinator(transport, FakeRegistry::all(), EngineConfig::default());
    let report = runner.run(&item_catalog()).await.unwrap();

    // four passes, count discovered before any item
    assert_eq!(report.summary().passed, 4);
    assert!(report
        .entries()
        .iter()
        .all(|entry| entry.verdict == Verdict::Pass));

    let sent = log.lock().unwrap();
    assert_eq!(sent[0].parameter.0, COUNT_PID);
    let indices: Vec<u8> = sent[1..].iter().map(|request| request.payload[0]).collect();
    assert_eq!(indices, [1, 2, 3]);
}

#[tokio::test]
async fn zero_count_skips_items_at_runtime() {
    let (transport, _log) = ScriptedTransport::new(|request| match request.parameter.0 {
        COUNT_PID => Reply::Ack(vec![("count", FieldValue::Integer(0))]),
        _ => Reply::Nack(NackReason::UnknownPid),
    });

    let mut runner = coordinator(transport, FakeRegistry::all(), EngineConfig::default());
    let report = runner.run(&item_catalog()).await.unwrap();

    let summary = report.summary();
    assert_eq!(summary.passed, 1);
    assert_eq!(summary.not_run, 3);
}

#[tokio::test]
async fn unsupported_parameter_prunes_without_traffic() {
    let (transport, log) = ScriptedTransport::new(|_| Reply::Nack(NackReason::UnknownPid));

    let mut runner = coordinator(
        transport,
        FakeRegistry::without(vec![COUNT_PID]),
        EngineConfig::default(),
    );
    let report = runner.run(&item_catalog()).await.unwrap();

    // GetCount is unsupported; every GetItem transitively follows it down
    assert_eq!(report.summary().not_run, 4);
    assert!(log.lock().unwrap().is_empty());

    let count_entry = report
        .entries()
        .iter()
        .find(|entry| entry.id.as_str() == "GetCount")
        .unwrap();
    assert!(count_entry.messages[0].text.contains("ITEM_COUNT"));
}

#[tokio::test(start_paused = true)]
async fn timeout_resolves_to_fail() {
    let (transport, _log) = ScriptedTransport::new(|_| Reply::Silence);

    let catalog = Catalog::new().with(TestDescriptor::new(
        "GetCount",
        TestCategory::Core,
        ParameterId(COUNT_PID),
        Arc::new(GetAndCapture::new()),
    ));

    let mut runner = coordinator(transport, FakeRegistry::all(), EngineConfig::default());
    let report = runner.run(&catalog).await.unwrap();

    let entry = &report.entries()[0];
    assert_eq!(entry.verdict, Verdict::Fail);
    assert!(entry.messages[0].text.contains("no response"));
}

/// A command that intentionally provokes silence (e.g. a reset)
struct ExpectSilence;

impl TestBehavior for ExpectSilence {
    fn initiate(&self, ctx: &mut TestContext<'_>) -> Result<()> {
        ctx.send_set(vec![0x01], vec![ExpectedResult::no_response()])
    }
}

#[tokio::test(start_paused = true)]
async fn expected_silence_passes() {
    let (transport, _log) = ScriptedTransport::new(|_| Reply::Silence);

    let catalog = Catalog::new().with(TestDescriptor::new(
        "ResetDevice",
        TestCategory::Control,
        ParameterId(0x1001),
        Arc::new(ExpectSilence),
    ));

    let mut runner = coordinator(transport, FakeRegistry::all(), EngineConfig::default());
    let report = runner.run(&catalog).await.unwrap();
    assert_eq!(report.entries()[0].verdict, Verdict::Pass);
}

#[tokio::test]
async fn set_then_verify_round_trips() {
    let applied = Arc::new(Mutex::new(0i64));
    let state = applied.clone();
    let (transport, log) = ScriptedTransport::new(move |request| {
        match request.command_class {
            CommandClass::Set => {
                *state.lock().unwrap() = request.payload[0] as i64;
                Reply::Ack(vec![])
            }
            CommandClass::Get => Reply::Ack(vec![(
                "dmx_start_address",
                FieldValue::Integer(*state.lock().unwrap()),
            )]),
        }
    });

    let catalog = Catalog::new().with(TestDescriptor::new(
        "SetStartAddress",
        TestCategory::DmxSetup,
        ParameterId(0x00f0),
        Arc::new(SetThenVerify::new(vec![42], "dmx_start_address", 42i64)),
    ));

    let mut runner = coordinator(transport, FakeRegistry::all(), EngineConfig::default());
    let report = runner.run(&catalog).await.unwrap();

    assert_eq!(report.entries()[0].verdict, Verdict::Pass);
    let sent = log.lock().unwrap();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].command_class, CommandClass::Set);
    assert_eq!(sent[1].command_class, CommandClass::Get);
}

#[tokio::test]
async fn set_then_verify_catches_a_lying_device() {
    // device acks the SET but never applies it
    let (transport, _log) = ScriptedTransport::new(|request| match request.command_class {
        CommandClass::Set => Reply::Ack(vec![]),
        CommandClass::Get => Reply::Ack(vec![("dmx_start_address", FieldValue::Integer(1))]),
    });

    let catalog = Catalog::new().with(TestDescriptor::new(
        "SetStartAddress",
        TestCategory::DmxSetup,
        ParameterId(0x00f0),
        Arc::new(SetThenVerify::new(vec![42], "dmx_start_address", 42i64)),
    ));

    let mut runner = coordinator(transport, FakeRegistry::all(), EngineConfig::default());
    let report = runner.run(&catalog).await.unwrap();

    let entry = &report.entries()[0];
    assert_eq!(entry.verdict, Verdict::Fail);
    assert!(entry.messages[0].text.contains("unexpected response"));
}

#[tokio::test]
async fn tolerated_ack_yields_warning_verdict() {
    // GET with junk data should nack, but an ack only warns
    let (transport, _log) = ScriptedTransport::new(|_| Reply::Ack(vec![]));

    let catalog = Catalog::new().with(TestDescriptor::new(
        "GetCountWithData",
        TestCategory::ErrorConditions,
        ParameterId(COUNT_PID),
        Arc::new(GetWithJunkData::new()),
    ));

    let mut runner = coordinator(transport, FakeRegistry::all(), EngineConfig::default());
    let report = runner.run(&catalog).await.unwrap();

    let entry = &report.entries()[0];
    assert_eq!(entry.verdict, Verdict::Warning);
    assert!(entry.verdict.passed());
    assert_eq!(report.summary().warnings, 1);
}

#[tokio::test]
async fn wrong_parameter_in_reply_is_broken() {
    let (transport, _log) = ScriptedTransport::new(|_| Reply::WrongParameter);

    let catalog = Catalog::new()
        .with(TestDescriptor::new(
            "GetCount",
            TestCategory::Core,
            ParameterId(COUNT_PID),
            Arc::new(GetAndCapture::new()),
        ))
        .with(TestDescriptor::new(
            "GetItem",
            TestCategory::Core,
            ParameterId(ITEM_PID),
            Arc::new(GetAndCapture::new()),
        ));

    let mut runner = coordinator(transport, FakeRegistry::all(), EngineConfig::default());
    let report = runner.run(&catalog).await.unwrap();

    // broken responses don't abort the remaining schedule
    assert_eq!(verdicts(&report).len(), 2);
    for entry in report.entries() {
        assert_eq!(entry.verdict, Verdict::Broken);
        assert!(entry.messages[0].text.contains("wrong parameter"));
    }
}

fn looping_entry() -> ExpectedResult {
    ExpectedResult::ack().then(|ctx, _| ctx.send_get(vec![looping_entry()]))
}

/// Authoring bug: every ack chains yet another GET
struct LoopForever;

impl TestBehavior for LoopForever {
    fn initiate(&self, ctx: &mut TestContext<'_>) -> Result<()> {
        ctx.send_get(vec![looping_entry()])
    }
}

#[tokio::test]
async fn continuation_loop_is_bounded() {
    let (transport, log) = ScriptedTransport::new(|_| Reply::Ack(vec![]));

    let catalog = Catalog::new().with(TestDescriptor::new(
        "Runaway",
        TestCategory::Core,
        ParameterId(COUNT_PID),
        Arc::new(LoopForever),
    ));

    let config = EngineConfig {
        max_continuation_rounds: 3,
        ..EngineConfig::default()
    };
    let mut runner = coordinator(transport, FakeRegistry::all(), config);
    let report = runner.run(&catalog).await.unwrap();

    let entry = &report.entries()[0];
    assert_eq!(entry.verdict, Verdict::Broken);
    assert!(entry.messages[0].text.contains("continuation loop exceeded"));
    assert_eq!(log.lock().unwrap().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn repeated_failures_abandon_the_run() {
    let (transport, log) = ScriptedTransport::new(|_| Reply::Silence);

    let mut catalog = Catalog::new();
    for index in 0..5 {
        catalog.push(TestDescriptor::new(
            format!("Get{}", index).as_str(),
            TestCategory::Core,
            ParameterId(COUNT_PID),
            Arc::new(GetAndCapture::new()),
        ));
    }

    let config = EngineConfig {
        unreachable_threshold: 2,
        ..EngineConfig::default()
    };
    let mut runner = coordinator(transport, FakeRegistry::all(), config);
    let report = runner.run(&catalog).await.unwrap();

    let summary = report.summary();
    assert_eq!(summary.failed, 2);
    assert_eq!(summary.not_run, 3);
    assert_eq!(log.lock().unwrap().len(), 2);

    let abandoned = &report.entries()[2];
    assert!(abandoned.messages[0].text.contains("device unreachable"));
}

#[tokio::test]
async fn channel_error_fails_the_test() {
    let responses = Arc::new(Mutex::new(0u32));
    let counter = responses.clone();
    let (transport, _log) = ScriptedTransport::new(move |_| {
        let mut n = counter.lock().unwrap();
        *n += 1;
        if *n == 1 {
            Reply::ChannelError
        } else {
            Reply::Ack(vec![])
        }
    });

    let catalog = Catalog::new()
        .with(TestDescriptor::new(
            "First",
            TestCategory::Core,
            ParameterId(COUNT_PID),
            Arc::new(GetAndCapture::new()),
        ))
        .with(TestDescriptor::new(
            "Second",
            TestCategory::Core,
            ParameterId(ITEM_PID),
            Arc::new(GetAndCapture::new()),
        ));

    let mut runner = coordinator(transport, FakeRegistry::all(), EngineConfig::default());
    let report = runner.run(&catalog).await.unwrap();

    assert_eq!(
        verdicts(&report),
        [
            ("First".to_string(), Verdict::Fail),
            ("Second".to_string(), Verdict::Pass),
        ]
    );
    let first = &report.entries()[0];
    assert!(first.messages[0].text.contains("transport error"));
}

#[tokio::test]
async fn cancellation_yields_a_complete_report() {
    let (transport, _log) = ScriptedTransport::new(|_| Reply::Ack(vec![]));

    let mut runner = coordinator(transport, FakeRegistry::all(), EngineConfig::default());
    let token: CancelToken = runner.cancel_token();
    token.cancel();

    let report = runner.run(&item_catalog()).await.unwrap();

    assert_eq!(report.entries().len(), 4);
    for entry in report.entries() {
        assert_eq!(entry.verdict, Verdict::NotRun);
        assert!(entry.messages[0].text.contains("run cancelled"));
    }
}

#[tokio::test(start_paused = true)]
async fn mid_exchange_cancellation_stops_the_run_promptly() {
    let (transport, log) = ScriptedTransport::new(|_| Reply::Silence);

    let mut catalog = Catalog::new();
    for index in 0..3 {
        catalog.push(TestDescriptor::new(
            format!("Get{}", index).as_str(),
            TestCategory::Core,
            ParameterId(COUNT_PID),
            Arc::new(GetAndCapture::new()),
        ));
    }

    let mut runner = coordinator(transport, FakeRegistry::all(), EngineConfig::default());
    let token = runner.cancel_token();
    // fires while the first exchange is still outstanding, well before its
    // five-second deadline
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
    });

    let report = runner.run(&catalog).await.unwrap();

    assert_eq!(report.entries().len(), 3);
    for entry in report.entries() {
        assert_eq!(entry.verdict, Verdict::NotRun);
        assert!(entry.messages[0].text.contains("run cancelled"));
    }
    // only the in-flight request reached the wire
    assert_eq!(log.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn progress_events_bracket_each_test() {
    let (transport, _log) = ScriptedTransport::new(|request| match request.parameter.0 {
        COUNT_PID => Reply::Ack(vec![("count", FieldValue::Integer(3))]),
        _ => Reply::Ack(vec![("index", FieldValue::Integer(
            request.payload[0] as i64,
        ))]),
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut runner =
        coordinator(transport, FakeRegistry::all(), EngineConfig::default()).with_progress(tx);
    runner.run(&item_catalog()).await.unwrap();

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert_eq!(events.len(), 8);
    assert!(matches!(
        &events[0],
        ProgressEvent::TestStarted { id } if id.as_str() == "GetCount"
    ));
    assert!(matches!(
        &events[1],
        ProgressEvent::TestFinished { id, verdict: Verdict::Pass } if id.as_str() == "GetCount"
    ));
}

#[tokio::test]
async fn dependency_cycle_aborts_with_zero_traffic() {
    let (transport, log) = ScriptedTransport::new(|_| Reply::Ack(vec![]));

    let catalog = Catalog::new()
        .with(
            TestDescriptor::new(
                "A",
                TestCategory::Core,
                ParameterId(COUNT_PID),
                Arc::new(GetAndCapture::new()),
            )
            .provides(["a"])
            .requires(["b"]),
        )
        .with(
            TestDescriptor::new(
                "B",
                TestCategory::Core,
                ParameterId(ITEM_PID),
                Arc::new(GetAndCapture::new()),
            )
            .provides(["b"])
            .requires(["a"]),
        );

    let mut runner = coordinator(transport, FakeRegistry::all(), EngineConfig::default());
    let err = runner.run(&catalog).await.unwrap_err();
    assert!(matches!(err, Error::DependencyCycle(_)));
    assert!(log.lock().unwrap().is_empty());
}
