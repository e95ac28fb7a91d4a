pub mod qemu;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use facet::Facet;
use facet_value::Value;

use crate::error::RoostError;
use crate::vault::{FetchType, PrepareAction, VmImage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Off,
    Stopped,
    Running,
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            VmState::Off => "off",
            VmState::Stopped => "stopped",
            VmState::Running => "running",
        })
    }
}

/// Observer for VM state transitions. Implementations must not block.
pub trait VmStatusMonitor: Send + Sync {
    fn on_resume(&self, name: &str);
    fn on_stop(&self, name: &str);
    fn on_shutdown(&self, name: &str);
}

/// Monitor that only logs.
pub struct LoggingMonitor;

impl VmStatusMonitor for LoggingMonitor {
    fn on_resume(&self, name: &str) {
        tracing::info!(name, "instance running");
    }

    fn on_stop(&self, name: &str) {
        tracing::info!(name, "instance stopped");
    }

    fn on_shutdown(&self, name: &str) {
        tracing::info!(name, "instance shut down");
    }
}

/// One VM and the backend process behind it.
#[async_trait]
pub trait VirtualMachine: Send + Sync {
    /// No-op when already running.
    async fn start(&mut self) -> Result<(), RoostError>;
    /// Graceful power-off; waits for the process to exit.
    async fn stop(&mut self) -> Result<(), RoostError>;
    async fn shutdown(&mut self) -> Result<(), RoostError>;
    fn current_state(&self) -> VmState;
    /// Host port forwarded to the guest's port 22.
    fn forwarding_port(&self) -> u16;
    /// Poll SSH on the forwarding port until it answers, the process dies
    /// (`ProcessExited`) or `timeout` passes (`Timeout`).
    async fn wait_until_ssh_up(&mut self, timeout: Duration) -> Result<(), RoostError>;
}

#[derive(Debug, Clone)]
pub struct VirtualMachineDescription {
    pub num_cores: u32,
    pub mem_size: String,
    /// Bytes; zero keeps the image's own size.
    pub disk_space: u64,
    pub vm_name: String,
    pub image: VmImage,
    pub cloud_init_config: Value,
}

#[async_trait]
pub trait VirtualMachineFactory: Send + Sync {
    async fn create_virtual_machine(
        &self,
        desc: &VirtualMachineDescription,
        monitor: Arc<dyn VmStatusMonitor>,
    ) -> Result<Box<dyn VirtualMachine>, RoostError>;

    fn fetch_type(&self) -> FetchType;

    /// Turn a freshly downloaded image into one the backend can boot.
    async fn prepare(&self, image: VmImage) -> Result<VmImage, RoostError>;
}

/// Hands a factory's `prepare` to the vault.
pub struct FactoryPrepare<'a>(pub &'a dyn VirtualMachineFactory);

#[async_trait]
impl PrepareAction for FactoryPrepare<'_> {
    async fn prepare(&self, image: VmImage) -> Result<VmImage, RoostError> {
        self.0.prepare(image).await
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Facet)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Runs commands inside a guest reachable on a forwarded SSH port.
#[async_trait]
pub trait VmExecute: Send + Sync {
    async fn execute(&self, port: u16, args: &[String]) -> Result<ExecOutput, RoostError>;
}
