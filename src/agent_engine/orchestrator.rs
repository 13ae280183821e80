use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::action::finish::FinishSignal;
use crate::action::parser::{self, ParsedResponse};
use crate::action::types::Action;
use crate::agent_engine::context::ConversationContext;
use crate::agent_engine::event_bus::StateBus;
use crate::agent_engine::history::{HistoryRecord, HistoryStore};
use crate::agent_engine::loop_control::{LoopController, RetryPolicy};
use crate::agent_engine::message::{Message, Segment};
use crate::agent_engine::prompt;
use crate::agent_engine::state::{
    ChatEntry, EntryRole, ObservationSource, TaskOutcome, TaskRequest, TaskRun, TaskStatus,
};
use crate::config::AppConfig;
use crate::errors::{AgentError, AgentResult};
use crate::executor::coordinator::Viewport;
use crate::executor::device::{DeviceAutomation, StepResult};
use crate::llm::provider::ModelClient;
use crate::llm::types::{CallConfig, LlmResponse};
use crate::perception::screenshot::{encode_for_model, Screenshot};

/// Drives one task run: observe, ask the model, parse, act, repeat.
pub struct TaskOrchestrator {
    device: Arc<dyn DeviceAutomation>,
    model: Arc<dyn ModelClient>,
    call_config: CallConfig,
    store: Arc<dyn HistoryStore>,
    bus: StateBus,
    config: AppConfig,
    retry: RetryPolicy,
}

/// Per-step observation fed into the user message.
struct Observation {
    image: Option<Segment>,
    current_app: Option<String>,
}

impl TaskOrchestrator {
    pub fn new(
        device: Arc<dyn DeviceAutomation>,
        model: Arc<dyn ModelClient>,
        call_config: CallConfig,
        store: Arc<dyn HistoryStore>,
        bus: StateBus,
        config: AppConfig,
    ) -> Self {
        let retry = RetryPolicy::from_config(&config.retry);
        Self {
            device,
            model,
            call_config,
            store,
            bus,
            config,
            retry,
        }
    }

    pub fn bus(&self) -> &StateBus {
        &self.bus
    }

    pub fn store(&self) -> &Arc<dyn HistoryStore> {
        &self.store
    }

    /// Fresh run record for `request`. Image requests without text get the
    /// configured image goal.
    pub fn new_run(&self, request: &TaskRequest) -> TaskRun {
        TaskRun::start(self.effective_goal(request))
    }

    pub async fn run(&self, request: TaskRequest, cancel: CancellationToken) -> TaskOutcome {
        let run = self.new_run(&request);
        self.run_as(run, request, cancel).await
    }

    /// Runs `request` under an already created `run` record.
    pub async fn run_as(
        &self,
        mut run: TaskRun,
        request: TaskRequest,
        cancel: CancellationToken,
    ) -> TaskOutcome {
        tracing::info!(
            run_id = %run.id,
            goal = %run.goal,
            image = request.is_image(),
            model = %self.call_config.model,
            "task started"
        );

        let max_steps = self.config.agent.max_steps;
        self.bus.update(|s| {
            s.running = true;
            s.run_id = Some(run.id);
            s.step = 0;
            s.max_steps = max_steps;
            s.status = Some(TaskStatus::Running);
            s.error = None;
            s.completion_message = None;
        });
        let goal_entry = ChatEntry::new(run.id, EntryRole::User, run.goal.clone());
        self.emit(goal_entry).await;
        self.persist(HistoryRecord::status(run.id, TaskStatus::Running, None)).await;

        let result = self.drive(&mut run, &request, &cancel).await;

        let (status, completion, failure, error) = match result {
            Ok(message) => (TaskStatus::Completed, Some(message), None, None),
            Err(e) => {
                let status = if e.is_abort() { TaskStatus::Aborted } else { TaskStatus::Failed };
                (status, None, Some(e.kind()), Some(e.to_string()))
            }
        };
        run.finish(status);

        match status {
            TaskStatus::Completed => tracing::info!(
                run_id = %run.id,
                steps = run.step_count,
                "task completed"
            ),
            _ => tracing::warn!(
                run_id = %run.id,
                steps = run.step_count,
                ?status,
                error = error.as_deref().unwrap_or_default(),
                "task ended without completing"
            ),
        }

        let detail = completion.clone().or_else(|| error.clone());
        self.persist(HistoryRecord::status(run.id, status, detail)).await;
        // Last observable effect of the run: nothing awaits after this.
        let step = run.step_count;
        self.bus.update(|s| {
            s.running = false;
            s.step = step;
            s.status = Some(status);
            s.error = error.clone();
            s.completion_message = completion.clone();
        });

        TaskOutcome {
            run,
            completion,
            failure,
            error,
        }
    }

    fn effective_goal(&self, request: &TaskRequest) -> String {
        if request.goal.trim().is_empty() && request.is_image() {
            prompt::image_goal(&self.config.prompts)
        } else {
            request.goal.clone()
        }
    }

    /// The step loop. `Ok` carries the completion message.
    async fn drive(
        &self,
        run: &mut TaskRun,
        request: &TaskRequest,
        cancel: &CancellationToken,
    ) -> AgentResult<String> {
        let mut ctl = LoopController::new(&self.config.agent);
        let deadline = ctl.deadline();

        if !race(cancel, deadline, self.device.is_available()).await? {
            tracing::error!(run_id = %run.id, "device automation unavailable");
            return Err(AgentError::AutomationUnavailable);
        }

        let agent_cfg = &self.config.agent;
        let default_viewport =
            Viewport::new(agent_cfg.default_viewport_width, agent_cfg.default_viewport_height);
        let mut viewport = default_viewport;
        let mut context = ConversationContext::new();
        let fixed_image = match &request.source {
            ObservationSource::FixedImage(shot) => self.compress(shot),
            ObservationSource::LiveScreen => None,
        };
        let image_run = request.is_image();

        loop {
            if ctl.deadline_passed() {
                return Err(AgentError::DeadlineExceeded);
            }
            if !ctl.begin_step() {
                tracing::warn!(run_id = %run.id, max_steps = ctl.max_steps(), "step bound reached");
                return Err(AgentError::StepBoundExceeded(ctl.max_steps()));
            }
            let step = ctl.step_count();
            run.step_count = step;
            self.bus.update(|s| s.step = step);

            // BuildStep
            if step == 1 {
                context.append(prompt::system_message(&self.config.prompts))?;
            }
            let observation = match &request.source {
                ObservationSource::LiveScreen => {
                    self.observe_live(cancel, deadline, &mut viewport, default_viewport).await?
                }
                ObservationSource::FixedImage(_) => Observation {
                    image: fixed_image.clone(),
                    current_app: self.foreground_app(cancel, deadline).await?,
                },
            };
            let text = if step == 1 {
                run.goal.clone()
            } else {
                prompt::continue_directive(&self.config.prompts, image_run)
            };
            context.append(prompt::user_message(
                &text,
                observation.image,
                observation.current_app.as_deref(),
            ))?;
            tracing::info!(
                run_id = %run.id,
                step,
                app = observation.current_app.as_deref().unwrap_or("Unknown"),
                "step observation built"
            );

            // Dispatch
            context.trim(agent_cfg.context_limit);
            let view = context.request_view(agent_cfg.strip_history_images);
            let response = self.complete_with_retry(&view, cancel, deadline).await?;
            if response.is_empty() {
                tracing::error!(run_id = %run.id, step, "model returned empty content");
                return Err(AgentError::EmptyResponse);
            }

            // Parse
            let parsed = parser::parse(&response.content);
            tracing::info!(
                run_id = %run.id,
                step,
                form = ?parsed.form,
                action = parsed.action.as_action().map(Action::name).unwrap_or("raw"),
                "model response parsed"
            );
            let assistant_entry = ChatEntry::new(run.id, EntryRole::Assistant, parsed.action_text.clone())
                .with_thinking(parsed.thinking.clone())
                .with_action(parsed.action.as_action().cloned());
            self.emit(assistant_entry).await;

            if let FinishSignal::Finish { message, evidence } = &parsed.finish {
                tracing::info!(run_id = %run.id, step, ?evidence, "finish detected");
                return Ok(message.clone());
            }

            // Execute
            let result = self.execute(&parsed, viewport, cancel, deadline).await?;

            // UpdateContext
            self.update_context(&mut context, run, &parsed, &result).await?;
            if !result.success {
                return Err(AgentError::ActionExecutionFailed(result.message));
            }

            // No settle after the last allowed step; the bound check follows.
            if agent_cfg.settle_delay_ms > 0 && ctl.step_count() < ctl.max_steps() {
                race(
                    cancel,
                    deadline,
                    tokio::time::sleep(Duration::from_millis(agent_cfg.settle_delay_ms)),
                )
                .await?;
            }
        }
    }

    async fn observe_live(
        &self,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
        viewport: &mut Viewport,
        default_viewport: Viewport,
    ) -> AgentResult<Observation> {
        let shot = match race(cancel, deadline, self.device.capture_screen()).await? {
            Ok(Some(shot)) => Some(shot),
            Ok(None) => {
                tracing::warn!("screen capture unavailable; continuing without screenshot");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "screen capture failed; continuing without screenshot");
                None
            }
        };

        *viewport = match &shot {
            Some(s) if s.width > 0 && s.height > 0 => Viewport::new(s.width, s.height),
            _ => default_viewport,
        };
        let image = shot.as_ref().and_then(|s| self.compress(s));
        let current_app = self.foreground_app(cancel, deadline).await?;
        Ok(Observation { image, current_app })
    }

    async fn foreground_app(
        &self,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> AgentResult<Option<String>> {
        match race(cancel, deadline, self.device.foreground_app()).await? {
            Ok(app) => Ok(app),
            Err(e) => {
                tracing::warn!(error = %e, "foreground app query failed");
                Ok(None)
            }
        }
    }

    fn compress(&self, shot: &Screenshot) -> Option<Segment> {
        let p = &self.config.perception;
        match encode_for_model(shot, p.max_image_dimension, p.jpeg_quality) {
            Ok(segment) => Some(segment),
            Err(e) => {
                tracing::warn!(error = %e, "screenshot encoding failed; sending without image");
                None
            }
        }
    }

    async fn complete_with_retry(
        &self,
        messages: &[Message],
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> AgentResult<LlmResponse> {
        let mut attempt = 0u32;
        loop {
            let call = self.model.complete(messages, &self.call_config);
            match race(cancel, deadline, call).await? {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    let delay = self.retry.delay_for(attempt);
                    tracing::warn!(
                        error = %e,
                        attempt,
                        max_retries = self.retry.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "model call failed; retrying"
                    );
                    race(cancel, deadline, tokio::time::sleep(delay)).await?;
                }
                Err(e) => {
                    tracing::error!(error = %e, attempts = attempt + 1, "model call failed");
                    return Err(e);
                }
            }
        }
    }

    async fn execute(
        &self,
        parsed: &ParsedResponse,
        viewport: Viewport,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> AgentResult<StepResult> {
        let result = match race(cancel, deadline, self.device.dispatch(&parsed.action, viewport)).await? {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(error = %e, "device dispatch error");
                StepResult::failed(e.to_string())
            }
        };
        tracing::info!(success = result.success, message = %result.message, "action executed");
        Ok(result)
    }

    async fn update_context(
        &self,
        context: &mut ConversationContext,
        run: &TaskRun,
        parsed: &ParsedResponse,
        result: &StepResult,
    ) -> AgentResult<()> {
        context.append(prompt::assistant_message(&parsed.thinking, &parsed.action_text))?;
        let tool = prompt::tool_message(&result.message);
        let tool_text = tool.text_content();
        context.append(tool)?;
        context.trim(self.config.agent.context_limit);

        self.emit(ChatEntry::new(run.id, EntryRole::Tool, tool_text)).await;
        Ok(())
    }

    /// Presentation first, then persistence. Store failures never end the run.
    async fn emit(&self, entry: ChatEntry) {
        self.bus.push_entry(entry.clone());
        self.persist(HistoryRecord::message(entry)).await;
    }

    async fn persist(&self, record: HistoryRecord) {
        if let Err(e) = self.store.append(&record).await {
            tracing::warn!(error = %e, "failed to persist history record");
        }
    }
}

/// Runs `fut` unless the token fires or the deadline passes first.
async fn race<F: Future>(
    cancel: &CancellationToken,
    deadline: Option<Instant>,
    fut: F,
) -> AgentResult<F::Output> {
    let expiry = async {
        match deadline {
            Some(d) => tokio::time::sleep_until(d).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AgentError::Cancelled),
        _ = expiry => Err(AgentError::DeadlineExceeded),
        out = fut => Ok(out),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn race_prefers_cancellation() {
        let token = CancellationToken::new();
        token.cancel();
        let out = race(&token, None, async { 1 }).await;
        assert!(matches!(out, Err(AgentError::Cancelled)));
    }

    #[tokio::test]
    async fn race_reports_deadline() {
        let token = CancellationToken::new();
        let deadline = Some(Instant::now() + Duration::from_millis(10));
        let out = race(&token, deadline, std::future::pending::<()>()).await;
        assert!(matches!(out, Err(AgentError::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn race_passes_output_through() {
        let token = CancellationToken::new();
        assert_eq!(race(&token, None, async { 7 }).await.unwrap(), 7);
    }
}
