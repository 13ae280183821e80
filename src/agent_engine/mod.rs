pub mod context;
pub mod engine;
pub mod event_bus;
pub mod history;
pub mod loop_control;
pub mod message;
pub mod orchestrator;
pub mod prompt;
pub mod state;
