pub mod action;
pub mod agent_engine;
pub mod config;
pub mod errors;
pub mod executor;
pub mod llm;
pub mod perception;

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use crate::agent_engine::engine::AgentEngine;
use crate::agent_engine::event_bus::StateBus;
use crate::agent_engine::history::{HistoryStore, JsonlHistoryStore};
use crate::agent_engine::orchestrator::TaskOrchestrator;
use crate::agent_engine::state::{AgentEvent, AgentSnapshot, TaskRequest};
use crate::config::AppConfig;
use crate::errors::{AgentError, AgentResult};
use crate::executor::device::DeviceAutomation;
use crate::llm::provider::ModelClient;
use crate::llm::registry::ProviderRegistry;
use crate::llm::types::CallConfig;
use crate::perception::screenshot::Screenshot;

/// Installs the global fmt subscriber. `RUST_LOG` overrides the default `info` filter.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}

/// Host-side handle for sending commands into the agent loop and observing
/// its state.
#[derive(Clone)]
pub struct AgentHandle {
    tx: mpsc::Sender<AgentEvent>,
    state_rx: watch::Receiver<AgentSnapshot>,
}

impl AgentHandle {
    /// Submits a goal. Resolves with the new run id once the run has started,
    /// or `AgentError::Busy` when another run is active and the busy policy
    /// rejects.
    pub async fn start_task(&self, goal: impl Into<String>) -> AgentResult<Uuid> {
        self.submit(TaskRequest::live(goal)).await
    }

    /// Image-initiated run: `image` is re-sent as the observation on every step.
    pub async fn start_image_task(&self, goal: impl Into<String>, image: Screenshot) -> AgentResult<Uuid> {
        self.submit(TaskRequest::image(goal, image)).await
    }

    pub async fn submit(&self, request: TaskRequest) -> AgentResult<Uuid> {
        let (ack, rx) = oneshot::channel();
        self.send(AgentEvent::StartTask { request, ack }).await?;
        rx.await.map_err(|_| loop_stopped())?
    }

    pub async fn abort(&self) -> AgentResult<()> {
        self.send(AgentEvent::Abort).await
    }

    /// Wipes persisted and displayed history. Fails with `Busy` during a run.
    pub async fn clear_history(&self) -> AgentResult<()> {
        let (ack, rx) = oneshot::channel();
        self.send(AgentEvent::ClearHistory { ack }).await?;
        rx.await.map_err(|_| loop_stopped())?
    }

    /// Clears the error and completion notices.
    pub async fn dismiss_notices(&self) -> AgentResult<()> {
        self.send(AgentEvent::DismissNotices).await
    }

    pub async fn shutdown(&self) -> AgentResult<()> {
        self.send(AgentEvent::Shutdown).await
    }

    pub fn subscribe(&self) -> watch::Receiver<AgentSnapshot> {
        self.state_rx.clone()
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        self.state_rx.borrow().clone()
    }

    async fn send(&self, event: AgentEvent) -> AgentResult<()> {
        self.tx.send(event).await.map_err(|_| loop_stopped())
    }
}

fn loop_stopped() -> AgentError {
    AgentError::Agent("agent loop is not running".into())
}

/// Spawns the engine on the current tokio runtime and returns its handle.
pub fn spawn_agent(
    config: AppConfig,
    device: Arc<dyn DeviceAutomation>,
    model: Arc<dyn ModelClient>,
    call_config: CallConfig,
    store: Arc<dyn HistoryStore>,
) -> AgentHandle {
    let bus = StateBus::default();
    let state_rx = bus.subscribe();
    let busy_policy = config.agent.busy_policy;
    tracing::info!(provider = %model.name(), model = %call_config.model, "spawning AgentEngine background task");
    let orchestrator = Arc::new(TaskOrchestrator::new(
        device,
        model,
        call_config,
        store,
        bus,
        config,
    ));

    let (tx, rx) = mpsc::channel::<AgentEvent>(32);
    tokio::spawn(async move {
        let mut engine = AgentEngine::new(orchestrator, rx, busy_policy);
        engine.run_loop().await;
        tracing::info!("AgentEngine task exited");
    });

    AgentHandle { tx, state_rx }
}

/// Loads `.env` and `config.toml`, builds the model client from the active
/// provider and persists history to the platform data dir.
pub fn spawn_agent_from_config(device: Arc<dyn DeviceAutomation>) -> AgentResult<AgentHandle> {
    let _ = dotenvy::dotenv();

    let config = config::load_config()?;
    let registry = ProviderRegistry::from_config(&config);
    let (model, call_config) = registry.active()?;
    let store: Arc<dyn HistoryStore> =
        Arc::new(JsonlHistoryStore::open_default(config.storage.history_path.as_deref()));

    Ok(spawn_agent(config, device, model, call_config, store))
}
