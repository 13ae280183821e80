use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use phone_agent_lib::action::types::{Action, ParsedAction};
use phone_agent_lib::agent_engine::event_bus::StateBus;
use phone_agent_lib::agent_engine::history::{HistoryRecord, HistoryStore};
use phone_agent_lib::agent_engine::message::{Message, Role};
use phone_agent_lib::agent_engine::orchestrator::TaskOrchestrator;
use phone_agent_lib::agent_engine::state::{EntryRole, TaskRequest, TaskStatus};
use phone_agent_lib::config::{AppConfig, BusyPolicy};
use phone_agent_lib::errors::{AgentError, AgentResult, FailureKind};
use phone_agent_lib::executor::coordinator::Viewport;
use phone_agent_lib::executor::device::{DeviceAutomation, StepResult};
use phone_agent_lib::llm::provider::ModelClient;
use phone_agent_lib::llm::types::{CallConfig, LlmResponse};
use phone_agent_lib::perception::screenshot::Screenshot;
use phone_agent_lib::spawn_agent;

const BACK: &str = "<think>go back</think><answer>do(action=\"Back\")</answer>";

enum Reply {
    Text(&'static str),
    Unavailable,
    Hang,
}

/// Replays scripted replies, then keeps answering `fallback`.
struct ScriptedModel {
    script: Mutex<VecDeque<Reply>>,
    fallback: &'static str,
    requests: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedModel {
    fn new(script: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback: BACK,
            requests: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, messages: &[Message], _cfg: &CallConfig) -> AgentResult<LlmResponse> {
        self.requests.lock().unwrap().push(messages.to_vec());
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Reply::Text(t)) => Ok(LlmResponse { content: t.to_string() }),
            Some(Reply::Unavailable) => Err(AgentError::ModelUnavailable("connection reset".into())),
            Some(Reply::Hang) => std::future::pending().await,
            None => Ok(LlmResponse { content: self.fallback.to_string() }),
        }
    }
}

struct MockDevice {
    available: bool,
    /// First capture yields no screenshot, later ones error.
    blind: bool,
    fail_dispatch: Option<&'static str>,
    captures: AtomicUsize,
    dispatched: Mutex<Vec<(ParsedAction, Viewport)>>,
}

impl MockDevice {
    fn new() -> Arc<Self> {
        Arc::new(Self::plain())
    }

    fn unavailable() -> Arc<Self> {
        Arc::new(Self { available: false, ..Self::plain() })
    }

    fn blind() -> Arc<Self> {
        Arc::new(Self { blind: true, ..Self::plain() })
    }

    fn failing(message: &'static str) -> Arc<Self> {
        Arc::new(Self { fail_dispatch: Some(message), ..Self::plain() })
    }

    fn plain() -> Self {
        Self {
            available: true,
            blind: false,
            fail_dispatch: None,
            captures: AtomicUsize::new(0),
            dispatched: Mutex::new(Vec::new()),
        }
    }

    fn dispatch_count(&self) -> usize {
        self.dispatched.lock().unwrap().len()
    }
}

fn png(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(width, height, image::Rgb([10, 120, 200]));
    let mut out = Vec::new();
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
        .unwrap();
    out
}

#[async_trait]
impl DeviceAutomation for MockDevice {
    async fn is_available(&self) -> bool {
        self.available
    }

    async fn capture_screen(&self) -> AgentResult<Option<Screenshot>> {
        let n = self.captures.fetch_add(1, Ordering::SeqCst);
        if self.blind {
            return match n {
                0 => Ok(None),
                _ => Err(AgentError::Perception("screencap exited with status 1".into())),
            };
        }
        Ok(Some(Screenshot::from_encoded(png(720, 1280))?))
    }

    async fn foreground_app(&self) -> AgentResult<Option<String>> {
        Ok(Some("com.android.settings".into()))
    }

    async fn dispatch(&self, action: &ParsedAction, viewport: Viewport) -> AgentResult<StepResult> {
        self.dispatched.lock().unwrap().push((action.clone(), viewport));
        Ok(match self.fail_dispatch {
            Some(msg) => StepResult::failed(msg),
            None => StepResult::ok(""),
        })
    }
}

#[derive(Default)]
struct MemoryStore {
    records: Mutex<Vec<HistoryRecord>>,
}

#[async_trait]
impl HistoryStore for MemoryStore {
    async fn append(&self, record: &HistoryRecord) -> AgentResult<()> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn load(&self) -> Vec<HistoryRecord> {
        self.records.lock().unwrap().clone()
    }

    async fn clear(&self) -> AgentResult<()> {
        self.records.lock().unwrap().clear();
        Ok(())
    }
}

/// Rejects every write.
struct BrokenStore;

#[async_trait]
impl HistoryStore for BrokenStore {
    async fn append(&self, _record: &HistoryRecord) -> AgentResult<()> {
        Err(AgentError::Persistence("disk full".into()))
    }

    async fn load(&self) -> Vec<HistoryRecord> {
        Vec::new()
    }

    async fn clear(&self) -> AgentResult<()> {
        Err(AgentError::Persistence("disk full".into()))
    }
}

fn fast_config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.agent.settle_delay_ms = 0;
    cfg.retry.base_delay_ms = 1;
    cfg.retry.max_delay_ms = 5;
    cfg
}

fn orchestrator(
    device: Arc<MockDevice>,
    model: Arc<ScriptedModel>,
    store: Arc<MemoryStore>,
    config: AppConfig,
) -> TaskOrchestrator {
    TaskOrchestrator::new(device, model, CallConfig::default(), store, StateBus::default(), config)
}

#[tokio::test]
async fn never_finishing_run_hits_the_step_bound() {
    let device = MockDevice::new();
    let model = ScriptedModel::new(vec![]);
    let orch = orchestrator(device.clone(), model.clone(), Arc::default(), fast_config());

    let outcome = orch.run(TaskRequest::live("open wifi settings"), CancellationToken::new()).await;

    assert_eq!(outcome.status(), TaskStatus::Failed);
    assert_eq!(outcome.failure, Some(FailureKind::StepBoundExceeded));
    assert_eq!(outcome.run.step_count, 50);
    assert!(outcome.error.unwrap().contains("50 steps"));
    assert_eq!(model.calls(), 50);
    assert_eq!(device.dispatch_count(), 50);
    assert!(outcome.run.finished_at.is_some());
}

#[tokio::test]
async fn requests_stay_within_the_context_window() {
    let device = MockDevice::new();
    let model = ScriptedModel::new(vec![]);
    let mut cfg = fast_config();
    cfg.agent.max_steps = 15;
    let orch = orchestrator(device, model.clone(), Arc::default(), cfg);

    orch.run(TaskRequest::live("scroll"), CancellationToken::new()).await;

    for request in model.requests() {
        assert_eq!(request[0].role(), Role::System);
        assert_eq!(request.iter().filter(|m| m.role() == Role::System).count(), 1);
        assert!(request.len() <= 21, "request had {} messages", request.len());
        // Only the newest user turn carries a screenshot.
        let with_images = request.iter().filter(|m| m.has_images()).count();
        assert_eq!(with_images, 1);
        assert!(request.last().unwrap().has_images());
    }
}

#[tokio::test]
async fn empty_response_fails_without_dispatching() {
    let device = MockDevice::new();
    let model = ScriptedModel::new(vec![Reply::Text(BACK), Reply::Text(BACK), Reply::Text("   ")]);
    let orch = orchestrator(device.clone(), model.clone(), Arc::default(), fast_config());

    let outcome = orch.run(TaskRequest::live("open camera"), CancellationToken::new()).await;

    assert_eq!(outcome.status(), TaskStatus::Failed);
    assert_eq!(outcome.failure, Some(FailureKind::EmptyResponse));
    assert_eq!(outcome.run.step_count, 3);
    assert_eq!(model.calls(), 3);
    assert_eq!(device.dispatch_count(), 2);
}

#[tokio::test]
async fn finish_completes_with_message_and_persists_entries() {
    let device = MockDevice::new();
    let model = ScriptedModel::new(vec![
        Reply::Text("<think>tap wifi</think><answer>do(action=\"Tap\", element=[500,250])</answer>"),
        Reply::Text("<think>done</think><answer>finish(message=\"Wi-Fi is on\")</answer>"),
    ]);
    let store = Arc::new(MemoryStore::default());
    let orch = orchestrator(device.clone(), model.clone(), store.clone(), fast_config());
    let state = orch.bus().subscribe();

    let outcome = orch.run(TaskRequest::live("turn on wifi"), CancellationToken::new()).await;

    assert_eq!(outcome.status(), TaskStatus::Completed);
    assert_eq!(outcome.completion.as_deref(), Some("Wi-Fi is on"));
    assert_eq!(outcome.run.step_count, 2);

    let dispatched = device.dispatched.lock().unwrap().clone();
    assert_eq!(dispatched.len(), 1);
    assert!(matches!(dispatched[0].0, ParsedAction::Action(Action::Tap { .. })));
    assert_eq!(dispatched[0].1, Viewport::new(720, 1280));

    let snapshot = state.borrow().clone();
    assert!(!snapshot.running);
    assert_eq!(snapshot.status, Some(TaskStatus::Completed));
    assert_eq!(snapshot.completion_message.as_deref(), Some("Wi-Fi is on"));
    let roles: Vec<_> = snapshot.messages.iter().map(|e| e.role).collect();
    assert_eq!(
        roles,
        vec![EntryRole::User, EntryRole::Assistant, EntryRole::Tool, EntryRole::Assistant]
    );
    assert_eq!(snapshot.messages[1].thinking.as_deref(), Some("tap wifi"));
    assert_eq!(snapshot.messages[2].content, "Action executed successfully");

    let records = store.load().await;
    let statuses: Vec<_> = records
        .iter()
        .filter_map(|r| match r {
            HistoryRecord::Status { status, .. } => Some(*status),
            _ => None,
        })
        .collect();
    assert_eq!(statuses, vec![TaskStatus::Running, TaskStatus::Completed]);

    // Second request carries the first turn back in tagged form.
    let second = &model.requests()[1];
    assert!(second
        .iter()
        .any(|m| m.role() == Role::Assistant
            && m.text_content() == "<think>tap wifi</think><answer>do(action=\"Tap\", element=[500,250])</answer>"));
    assert!(second.last().unwrap().text_content().starts_with("Continue with the task."));
}

#[tokio::test]
async fn do_call_naming_finish_completes_without_dispatch() {
    let device = MockDevice::new();
    let model = ScriptedModel::new(vec![
        Reply::Text(BACK),
        Reply::Text("<think>done</think><answer>do(action=\"finish\", message=\"ok\")</answer>"),
    ]);
    let orch = orchestrator(device.clone(), model.clone(), Arc::default(), fast_config());

    let outcome = orch.run(TaskRequest::live("go back once"), CancellationToken::new()).await;

    assert_eq!(outcome.status(), TaskStatus::Completed);
    assert_eq!(outcome.completion.as_deref(), Some("ok"));
    assert_eq!(outcome.run.step_count, 2);
    assert_eq!(model.calls(), 2);
    let dispatched = device.dispatched.lock().unwrap().clone();
    assert_eq!(dispatched.len(), 1);
    assert_eq!(dispatched[0].0, ParsedAction::Action(Action::Back));
}

#[tokio::test]
async fn degraded_screen_reply_and_store_do_not_abort_the_run() {
    let device = MockDevice::blind();
    let model = ScriptedModel::new(vec![
        Reply::Text("I have no idea"),
        Reply::Text("finish(message=\"gave up\")"),
    ]);
    let orch = TaskOrchestrator::new(
        device.clone(),
        model.clone(),
        CallConfig::default(),
        Arc::new(BrokenStore),
        StateBus::default(),
        fast_config(),
    );

    let outcome = orch.run(TaskRequest::live("find the torch"), CancellationToken::new()).await;

    assert_eq!(outcome.status(), TaskStatus::Completed);
    assert_eq!(outcome.completion.as_deref(), Some("gave up"));
    assert_eq!(device.captures.load(Ordering::SeqCst), 2);
    let dispatched = device.dispatched.lock().unwrap().clone();
    assert_eq!(
        dispatched,
        vec![(ParsedAction::RawText("I have no idea".into()), Viewport::new(1080, 1920))]
    );
    for request in model.requests() {
        assert!(request.iter().all(|m| !m.has_images()));
    }
    assert_eq!(orch.bus().subscribe().borrow().messages.len(), 4);
}

#[tokio::test]
async fn no_settle_delay_after_the_final_step() {
    let device = MockDevice::new();
    let model = ScriptedModel::new(vec![]);
    let mut cfg = fast_config();
    cfg.agent.max_steps = 1;
    cfg.agent.settle_delay_ms = 60_000;
    let orch = orchestrator(device.clone(), model, Arc::default(), cfg);

    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        orch.run(TaskRequest::live("one step"), CancellationToken::new()),
    )
    .await
    .expect("run ends without waiting out the settle delay");

    assert_eq!(outcome.failure, Some(FailureKind::StepBoundExceeded));
    assert_eq!(device.dispatch_count(), 1);
}

#[tokio::test]
async fn unavailable_automation_fails_before_any_step() {
    let device = MockDevice::unavailable();
    let model = ScriptedModel::new(vec![]);
    let orch = orchestrator(device.clone(), model.clone(), Arc::default(), fast_config());

    let outcome = orch.run(TaskRequest::live("anything"), CancellationToken::new()).await;

    assert_eq!(outcome.status(), TaskStatus::Failed);
    assert_eq!(outcome.failure, Some(FailureKind::AutomationUnavailable));
    assert_eq!(outcome.run.step_count, 0);
    assert_eq!(model.calls(), 0);
    assert_eq!(device.captures.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn failed_action_ends_the_run() {
    let device = MockDevice::failing("element not found");
    let model = ScriptedModel::new(vec![]);
    let orch = orchestrator(device.clone(), model, Arc::default(), fast_config());

    let outcome = orch.run(TaskRequest::live("tap it"), CancellationToken::new()).await;

    assert_eq!(outcome.status(), TaskStatus::Failed);
    assert_eq!(outcome.failure, Some(FailureKind::ActionExecutionFailed));
    assert!(outcome.error.unwrap().contains("element not found"));
    assert_eq!(outcome.run.step_count, 1);
}

#[tokio::test]
async fn transient_model_errors_are_retried() {
    let device = MockDevice::new();
    let model = ScriptedModel::new(vec![
        Reply::Unavailable,
        Reply::Unavailable,
        Reply::Text("finish(message=\"ok\")"),
    ]);
    let orch = orchestrator(device, model.clone(), Arc::default(), fast_config());

    let outcome = orch.run(TaskRequest::live("check"), CancellationToken::new()).await;

    assert_eq!(outcome.status(), TaskStatus::Completed);
    assert_eq!(outcome.completion.as_deref(), Some("ok"));
    assert_eq!(model.calls(), 3);
}

#[tokio::test]
async fn retries_disabled_fails_on_first_error() {
    let device = MockDevice::new();
    let model = ScriptedModel::new(vec![Reply::Unavailable]);
    let mut cfg = fast_config();
    cfg.retry.max_retries = 0;
    let orch = orchestrator(device, model.clone(), Arc::default(), cfg);

    let outcome = orch.run(TaskRequest::live("check"), CancellationToken::new()).await;

    assert_eq!(outcome.status(), TaskStatus::Failed);
    assert_eq!(outcome.failure, Some(FailureKind::ModelUnavailable));
    assert_eq!(model.calls(), 1);
}

#[tokio::test]
async fn cancellation_aborts_a_hung_model_call() {
    let device = MockDevice::new();
    let model = ScriptedModel::new(vec![Reply::Hang]);
    let orch = Arc::new(orchestrator(device, model.clone(), Arc::default(), fast_config()));
    let token = CancellationToken::new();

    let task = {
        let orch = orch.clone();
        let token = token.clone();
        tokio::spawn(async move { orch.run(TaskRequest::live("wait"), token).await })
    };
    while model.calls() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    token.cancel();

    let outcome = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    assert_eq!(outcome.status(), TaskStatus::Aborted);
    assert_eq!(outcome.failure, Some(FailureKind::Cancelled));
}

#[tokio::test]
async fn wall_clock_budget_aborts_the_run() {
    let device = MockDevice::new();
    let model = ScriptedModel::new(vec![Reply::Hang]);
    let mut cfg = fast_config();
    cfg.agent.max_duration_secs = Some(1);
    let orch = orchestrator(device, model, Arc::default(), cfg);

    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        orch.run(TaskRequest::live("slow"), CancellationToken::new()),
    )
    .await
    .unwrap();

    assert_eq!(outcome.status(), TaskStatus::Aborted);
    assert_eq!(outcome.failure, Some(FailureKind::DeadlineExceeded));
}

#[tokio::test]
async fn image_run_resends_the_fixed_image() {
    let device = MockDevice::new();
    let model = ScriptedModel::new(vec![Reply::Text(BACK), Reply::Text("finish(message=\"a cat\")")]);
    let orch = orchestrator(device.clone(), model.clone(), Arc::default(), fast_config());
    let image = Screenshot::from_encoded(png(1600, 900)).unwrap();

    let outcome = orch.run(TaskRequest::image("", image), CancellationToken::new()).await;

    assert_eq!(outcome.status(), TaskStatus::Completed);
    assert_eq!(outcome.run.goal, "Analyze this image.");
    assert_eq!(device.captures.load(Ordering::SeqCst), 0);

    let requests = model.requests();
    assert!(requests[0].last().unwrap().has_images());
    assert!(requests[0].last().unwrap().text_content().starts_with("Analyze this image."));
    assert!(requests[1].last().unwrap().has_images());
    assert!(requests[1].last().unwrap().text_content().starts_with("Continue analyzing the image."));

    let dispatched = device.dispatched.lock().unwrap().clone();
    assert_eq!(dispatched[0].1, Viewport::new(1080, 1920));
}

async fn wait_until(
    rx: &mut tokio::sync::watch::Receiver<phone_agent_lib::agent_engine::state::AgentSnapshot>,
    pred: impl FnMut(&phone_agent_lib::agent_engine::state::AgentSnapshot) -> bool,
) {
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(pred))
        .await
        .expect("state change within timeout")
        .expect("engine alive");
}

#[tokio::test]
async fn busy_agent_rejects_a_second_goal_then_aborts() {
    let device = MockDevice::new();
    let model = ScriptedModel::new(vec![Reply::Hang]);
    let store = Arc::new(MemoryStore::default());
    let handle = spawn_agent(fast_config(), device, model.clone(), CallConfig::default(), store);

    let run_id = handle.start_task("first").await.unwrap();
    let second = handle.start_task("second").await;
    assert!(matches!(second, Err(AgentError::Busy)));
    assert!(matches!(handle.clear_history().await, Err(AgentError::Busy)));

    let mut rx = handle.subscribe();
    wait_until(&mut rx, |s| s.run_id == Some(run_id) && s.running).await;
    handle.abort().await.unwrap();
    wait_until(&mut rx, |s| !s.running && s.status == Some(TaskStatus::Aborted)).await;
    assert!(handle.snapshot().error.is_some());

    handle.dismiss_notices().await.unwrap();
    wait_until(&mut rx, |s| s.error.is_none()).await;

    handle.clear_history().await.unwrap();
    assert!(handle.snapshot().messages.is_empty());
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn cancel_active_policy_replaces_the_running_goal() {
    let device = MockDevice::new();
    let model = ScriptedModel::new(vec![Reply::Hang, Reply::Text("finish(message=\"second done\")")]);
    let mut cfg = fast_config();
    cfg.agent.busy_policy = BusyPolicy::CancelActive;
    let handle = spawn_agent(cfg, device, model.clone(), CallConfig::default(), Arc::new(MemoryStore::default()));

    let first = handle.start_task("first").await.unwrap();
    while model.calls() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let second = handle.start_task("second").await.unwrap();
    assert_ne!(first, second);

    let mut rx = handle.subscribe();
    wait_until(&mut rx, |s| s.run_id == Some(second) && s.status == Some(TaskStatus::Completed)).await;
    assert_eq!(handle.snapshot().completion_message.as_deref(), Some("second done"));
}

#[tokio::test]
async fn history_is_restored_at_startup() {
    let store = Arc::new(MemoryStore::default());
    {
        let orch = orchestrator(
            MockDevice::new(),
            ScriptedModel::new(vec![Reply::Text("finish(message=\"done\")")]),
            store.clone(),
            fast_config(),
        );
        orch.run(TaskRequest::live("earlier goal"), CancellationToken::new()).await;
    }

    let handle = spawn_agent(
        fast_config(),
        MockDevice::new(),
        ScriptedModel::new(vec![]),
        CallConfig::default(),
        store,
    );
    let mut rx = handle.subscribe();
    wait_until(&mut rx, |s| !s.messages.is_empty()).await;
    assert_eq!(handle.snapshot().messages[0].content, "earlier goal");
}
