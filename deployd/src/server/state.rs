//! Server state

use std::sync::Arc;

use crate::deploy::DeployService;

/// Server state shared across handlers
pub struct ServerState {
    pub service: Arc<DeployService>,
}

impl ServerState {
    pub fn new(service: Arc<DeployService>) -> Self {
        Self { service }
    }
}
