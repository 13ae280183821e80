use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent_engine::history::chat_entries;
use crate::agent_engine::orchestrator::TaskOrchestrator;
use crate::agent_engine::state::{AgentEvent, TaskOutcome, TaskRequest, TaskStatus};
use crate::config::BusyPolicy;
use crate::errors::{AgentError, AgentResult};

/// Supervisor that owns the event channel and keeps at most one run alive.
pub struct AgentEngine {
    orchestrator: Arc<TaskOrchestrator>,
    event_rx: mpsc::Receiver<AgentEvent>,
    busy_policy: BusyPolicy,
    active: Option<ActiveRun>,
}

struct ActiveRun {
    run_id: Uuid,
    cancel: CancellationToken,
    handle: JoinHandle<TaskOutcome>,
}

enum Wake {
    RunEnded(Result<TaskOutcome, JoinError>),
    Event(Option<AgentEvent>),
}

impl AgentEngine {
    pub fn new(
        orchestrator: Arc<TaskOrchestrator>,
        event_rx: mpsc::Receiver<AgentEvent>,
        busy_policy: BusyPolicy,
    ) -> Self {
        Self {
            orchestrator,
            event_rx,
            busy_policy,
            active: None,
        }
    }

    pub async fn run_loop(&mut self) {
        self.restore_history().await;

        loop {
            let wake = match self.active.as_mut() {
                Some(active) => tokio::select! {
                    res = &mut active.handle => Wake::RunEnded(res),
                    ev = self.event_rx.recv() => Wake::Event(ev),
                },
                None => Wake::Event(self.event_rx.recv().await),
            };

            match wake {
                Wake::RunEnded(res) => {
                    self.active = None;
                    self.on_run_ended(res);
                }
                Wake::Event(None) | Wake::Event(Some(AgentEvent::Shutdown)) => {
                    self.stop_active().await;
                    break;
                }
                Wake::Event(Some(event)) => self.handle_event(event).await,
            }
        }
        tracing::info!("agent loop ended");
    }

    async fn handle_event(&mut self, event: AgentEvent) {
        self.reap_finished().await;
        match event {
            AgentEvent::StartTask { request, ack } => self.start(request, ack).await,
            AgentEvent::Abort => match &self.active {
                Some(active) => {
                    tracing::info!(run_id = %active.run_id, "abort requested");
                    active.cancel.cancel();
                }
                None => tracing::debug!("abort requested while idle; ignored"),
            },
            AgentEvent::ClearHistory { ack } => {
                let result = self.clear_history().await;
                let _ = ack.send(result);
            }
            AgentEvent::DismissNotices => self.orchestrator.bus().update(|s| {
                s.error = None;
                s.completion_message = None;
            }),
            // Handled by run_loop.
            AgentEvent::Shutdown => {}
        }
    }

    async fn start(&mut self, request: TaskRequest, ack: oneshot::Sender<AgentResult<Uuid>>) {
        if let Some(active_id) = self.active.as_ref().map(|a| a.run_id) {
            match self.busy_policy {
                BusyPolicy::Reject => {
                    tracing::warn!(active = %active_id, "start rejected: a task is already running");
                    let _ = ack.send(Err(AgentError::Busy));
                    return;
                }
                BusyPolicy::CancelActive => {
                    tracing::info!(active = %active_id, "cancelling active task for new goal");
                    self.stop_active().await;
                }
            }
        }

        let run = self.orchestrator.new_run(&request);
        let run_id = run.id;
        let cancel = CancellationToken::new();

        self.orchestrator.bus().update(|s| {
            s.running = true;
            s.run_id = Some(run_id);
        });

        let orchestrator = self.orchestrator.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { orchestrator.run_as(run, request, token).await });
        self.active = Some(ActiveRun { run_id, cancel, handle });

        tracing::info!(run_id = %run_id, "task spawned");
        let _ = ack.send(Ok(run_id));
    }

    /// Collects a run that ended while an event was being selected.
    async fn reap_finished(&mut self) {
        if self.active.as_ref().is_some_and(|a| a.handle.is_finished()) {
            if let Some(active) = self.active.take() {
                let res = active.handle.await;
                self.on_run_ended(res);
            }
        }
    }

    /// Cancels the active run and waits for it to unwind.
    async fn stop_active(&mut self) {
        if let Some(active) = self.active.take() {
            active.cancel.cancel();
            let res = active.handle.await;
            self.on_run_ended(res);
        }
    }

    fn on_run_ended(&self, res: Result<TaskOutcome, JoinError>) {
        match res {
            Ok(outcome) => tracing::info!(
                run_id = %outcome.run.id,
                status = ?outcome.status(),
                steps = outcome.run.step_count,
                "run finished"
            ),
            Err(e) => {
                tracing::error!(error = %e, "task panicked");
                self.orchestrator.bus().update(|s| {
                    s.running = false;
                    s.status = Some(TaskStatus::Failed);
                    s.error = Some(format!("Internal error: {e}"));
                });
            }
        }
    }

    async fn clear_history(&self) -> AgentResult<()> {
        if self.active.is_some() {
            return Err(AgentError::Busy);
        }
        self.orchestrator.store().clear().await?;
        self.orchestrator.bus().update(|s| {
            s.messages.clear();
            s.error = None;
            s.completion_message = None;
            s.status = None;
            s.run_id = None;
            s.step = 0;
        });
        tracing::info!("history cleared");
        Ok(())
    }

    async fn restore_history(&self) {
        let entries = chat_entries(self.orchestrator.store().load().await);
        if entries.is_empty() {
            return;
        }
        tracing::info!(count = entries.len(), "restored chat history");
        self.orchestrator.bus().update(|s| s.messages = entries);
    }
}
