//! Port allocator for backend processes

use std::collections::BTreeSet;

use tokio::net::TcpListener;
use tracing::{debug, warn};

use crate::deploy::context::ExecutionContext;
use crate::deploy::supervisor::ProcessSupervisor;
use crate::errors::DeployError;
use crate::storage::settings::PortSettings;

/// Picks the first free port at or above a base. The supervisor's live
/// process table is the only record of which ports are taken.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    base_port: u16,
    probe_listeners: bool,
}

impl PortAllocator {
    pub fn new(settings: &PortSettings) -> Self {
        Self {
            base_port: settings.base_port,
            probe_listeners: settings.probe_listeners,
        }
    }

    pub fn base_port(&self) -> u16 {
        self.base_port
    }

    /// Allocate a port not used by any managed process. If the supervisor
    /// cannot be queried, allocation starts over from the base port with
    /// nothing reserved.
    pub async fn allocate(
        &self,
        ctx: &ExecutionContext,
        supervisor: &dyn ProcessSupervisor,
    ) -> Result<u16, DeployError> {
        let reserved: BTreeSet<u16> = match supervisor.list(ctx).await {
            Ok(processes) => processes.iter().filter_map(|p| p.port).collect(),
            Err(e) if e.is_canceled() => return Err(e),
            Err(e) => {
                warn!(error = %e, "process supervisor query failed");
                ctx.log(format!(
                    "Could not read running processes, starting from port {}",
                    self.base_port
                ));
                BTreeSet::new()
            }
        };

        let port = self.next_free(&reserved).await?;
        debug!(port, reserved = ?reserved, "allocated port");
        Ok(port)
    }

    async fn next_free(&self, reserved: &BTreeSet<u16>) -> Result<u16, DeployError> {
        let mut port = self.base_port;
        loop {
            if !reserved.contains(&port) && (!self.probe_listeners || is_bindable(port).await) {
                return Ok(port);
            }
            port = port.checked_add(1).ok_or_else(|| {
                DeployError::Process(format!("no free port at or above {}", self.base_port))
            })?;
        }
    }
}

async fn is_bindable(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).await.is_ok()
}
