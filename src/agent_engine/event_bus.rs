use tokio::sync::watch;

use crate::agent_engine::state::{AgentSnapshot, ChatEntry};

/// Latest-value channel feeding the presentation layer. Observers that fall
/// behind see only the newest snapshot.
#[derive(Clone)]
pub struct StateBus {
    tx: watch::Sender<AgentSnapshot>,
}

impl StateBus {
    pub fn new(initial: AgentSnapshot) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<AgentSnapshot> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> AgentSnapshot {
        self.tx.borrow().clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut AgentSnapshot)) {
        self.tx.send_modify(f);
    }

    pub fn push_entry(&self, entry: ChatEntry) {
        self.tx.send_modify(|s| s.messages.push(entry));
    }
}

impl Default for StateBus {
    fn default() -> Self {
        Self::new(AgentSnapshot::default())
    }
}
