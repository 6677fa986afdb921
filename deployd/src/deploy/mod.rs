//! Deploy pipeline

pub mod fsm;
pub mod orchestrator;
pub mod service;

pub use orchestrator::{Orchestrator, PipelineSettings};
pub use service::DeployService;
