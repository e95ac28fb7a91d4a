use std::collections::BTreeSet;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use facet::Facet;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, watch};

use super::{
    VirtualMachine, VirtualMachineDescription, VirtualMachineFactory, VmState, VmStatusMonitor,
};
use crate::cloudinit;
use crate::config::QemuConfig;
use crate::error::RoostError;
use crate::ssh;
use crate::vault::{FetchType, VmImage};

const KILL_GRACE: Duration = Duration::from_secs(10);
const SSH_POLL_INTERVAL: Duration = Duration::from_secs(1);

// ── factory ──────────────────────────────────────────────

/// Forwarding ports handed out so far. Allocation walks the range from
/// where it last stopped and wraps around, skipping assigned ports.
struct PortPool {
    next: u32,
    assigned: BTreeSet<u16>,
}

impl PortPool {
    fn take(&mut self, first: u16, last: u16, is_free: impl Fn(u16) -> bool) -> Option<u16> {
        let (first, last) = (u32::from(first), u32::from(last));
        for _ in first..=last {
            if self.next < first || self.next > last {
                self.next = first;
            }
            let port = self.next as u16;
            self.next += 1;
            if self.assigned.contains(&port) {
                continue;
            }
            if is_free(port) {
                self.assigned.insert(port);
                return Some(port);
            }
            tracing::debug!(port, "port busy, skipping");
        }
        None
    }
}

/// A forwarding port owned by one VM; back in the pool on drop.
pub struct PortLease {
    port: u16,
    pool: Arc<Mutex<PortPool>>,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        let mut pool = self.pool.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        pool.assigned.remove(&self.port);
    }
}

pub struct QemuVirtualMachineFactory {
    config: QemuConfig,
    shutdown_timeout: Duration,
    ports: Arc<Mutex<PortPool>>,
}

impl QemuVirtualMachineFactory {
    pub fn new(config: QemuConfig, shutdown_timeout: Duration) -> Self {
        let first = u32::from(config.first_port);
        Self {
            config,
            shutdown_timeout,
            ports: Arc::new(Mutex::new(PortPool {
                next: first,
                assigned: BTreeSet::new(),
            })),
        }
    }

    /// Next unassigned port in the range that can be bound on loopback.
    fn allocate_port(&self) -> Result<PortLease, RoostError> {
        self.lease_port(|port| TcpListener::bind(("127.0.0.1", port)).is_ok())
    }

    fn lease_port(&self, is_free: impl Fn(u16) -> bool) -> Result<PortLease, RoostError> {
        let port = self
            .ports
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take(self.config.first_port, self.config.last_port, is_free)
            .ok_or_else(|| RoostError::Validation {
                message: format!(
                    "no free forwarding port left in {}..={}",
                    self.config.first_port, self.config.last_port
                ),
            })?;
        Ok(PortLease {
            port,
            pool: self.ports.clone(),
        })
    }
}

#[async_trait]
impl VirtualMachineFactory for QemuVirtualMachineFactory {
    async fn create_virtual_machine(
        &self,
        desc: &VirtualMachineDescription,
        monitor: Arc<dyn VmStatusMonitor>,
    ) -> Result<Box<dyn VirtualMachine>, RoostError> {
        let image = &desc.image.image_path;
        let dir = image.parent().unwrap_or(Path::new("."));
        let iso = dir.join("cloud-init.iso");
        cloudinit::write_seed_iso(&iso, &desc.cloud_init_config, &desc.vm_name).await?;

        if desc.disk_space > 0 {
            grow_image(image, desc.disk_space).await?;
        }

        let lease = self.allocate_port()?;
        let port = lease.port();
        let args = qemu_args(desc, &iso, port, &self.config.accel);
        tracing::info!(name = %desc.vm_name, port, "qemu instance defined");

        Ok(Box::new(
            QemuVirtualMachine::new(
                desc.vm_name.clone(),
                self.config.binary.clone(),
                args,
                vec![image.clone(), iso],
                port,
                self.shutdown_timeout,
                monitor,
            )
            .holding(lease),
        ))
    }

    fn fetch_type(&self) -> FetchType {
        FetchType::ImageOnly
    }

    async fn prepare(&self, image: VmImage) -> Result<VmImage, RoostError> {
        Ok(image)
    }
}

pub fn qemu_args(desc: &VirtualMachineDescription, iso: &Path, port: u16, accel: &str) -> Vec<String> {
    vec![
        "-accel".into(),
        accel.into(),
        "-hda".into(),
        desc.image.image_path.display().to_string(),
        "-drive".into(),
        format!("file={},if=virtio,format=raw", iso.display()),
        "-smp".into(),
        desc.num_cores.to_string(),
        "-m".into(),
        desc.mem_size.clone(),
        "-device".into(),
        "virtio-net-pci,netdev=hostnet0,id=net0".into(),
        "-netdev".into(),
        format!("user,id=hostnet0,hostfwd=tcp::{port}-:22"),
        "-monitor".into(),
        "stdio".into(),
        "-chardev".into(),
        "null,id=char0".into(),
        "-serial".into(),
        "chardev:char0".into(),
        "-nographic".into(),
    ]
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct ImageInfo {
    #[facet(rename = "virtual-size")]
    #[facet(default)]
    virtual_size: u64,
}

async fn qemu_img(args: &[&str], image: &Path) -> Result<Vec<u8>, RoostError> {
    let output = Command::new("qemu-img")
        .args(args)
        .arg(image)
        .output()
        .await
        .map_err(|e| RoostError::io("running qemu-img", e))?;
    if !output.status.success() {
        return Err(RoostError::ExternalCommand {
            command: "qemu-img".into(),
            message: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(output.stdout)
}

/// Grow the image to `bytes`; never shrinks.
async fn grow_image(image: &Path, bytes: u64) -> Result<(), RoostError> {
    let json = qemu_img(&["info", "--output=json"], image).await?;
    let info: ImageInfo = facet_json::from_str(&String::from_utf8_lossy(&json)).map_err(|e| {
        RoostError::ExternalCommand {
            command: "qemu-img info".into(),
            message: e.to_string(),
        }
    })?;
    if info.virtual_size >= bytes {
        tracing::debug!(path = %image.display(), size = info.virtual_size, "image already large enough");
        return Ok(());
    }

    let output = Command::new("qemu-img")
        .arg("resize")
        .arg(image)
        .arg(bytes.to_string())
        .output()
        .await
        .map_err(|e| RoostError::io("running qemu-img", e))?;
    if !output.status.success() {
        return Err(RoostError::ExternalCommand {
            command: "qemu-img resize".into(),
            message: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    tracing::info!(path = %image.display(), bytes, "resized instance image");
    Ok(())
}

// ── virtual machine ──────────────────────────────────────

struct Process {
    stdin: Option<ChildStdin>,
    kill: Option<oneshot::Sender<()>>,
    requested: Arc<AtomicBool>,
}

/// A QEMU process driven through its monitor on stdio.
pub struct QemuVirtualMachine {
    name: String,
    program: String,
    args: Vec<String>,
    required_files: Vec<PathBuf>,
    port: u16,
    shutdown_timeout: Duration,
    monitor: Arc<dyn VmStatusMonitor>,
    state: Arc<watch::Sender<VmState>>,
    process: Option<Process>,
    _lease: Option<PortLease>,
}

impl QemuVirtualMachine {
    pub fn new(
        name: String,
        program: String,
        args: Vec<String>,
        required_files: Vec<PathBuf>,
        port: u16,
        shutdown_timeout: Duration,
        monitor: Arc<dyn VmStatusMonitor>,
    ) -> Self {
        let (state, _) = watch::channel(VmState::Off);
        Self {
            name,
            program,
            args,
            required_files,
            port,
            shutdown_timeout,
            monitor,
            state: Arc::new(state),
            process: None,
            _lease: None,
        }
    }

    /// Keep `lease` reserved for as long as this VM exists.
    pub fn holding(mut self, lease: PortLease) -> Self {
        self._lease = Some(lease);
        self
    }

    fn spawn_exit_watcher(&self, mut child: Child, kill_rx: oneshot::Receiver<()>, requested: Arc<AtomicBool>) {
        let name = self.name.clone();
        let state = self.state.clone();
        let monitor = self.monitor.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    let _ = child.kill().await;
                    child.wait().await
                }
            };
            match status {
                Ok(s) => tracing::info!(name = %name, status = %s, "qemu exited"),
                Err(e) => tracing::warn!(name = %name, error = %e, "lost track of qemu"),
            }
            if !requested.load(Ordering::SeqCst) {
                monitor.on_shutdown(&name);
            }
            state.send_replace(VmState::Off);
        });
    }

    async fn wait_for_off(&self, timeout: Duration) -> bool {
        let mut rx = self.state.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|s| *s == VmState::Off))
            .await
            .is_ok()
    }

    async fn power_off(&mut self) -> Result<(), RoostError> {
        let Some(mut process) = self.process.take() else {
            return Ok(());
        };
        if self.current_state() == VmState::Off {
            return Ok(());
        }
        process.requested.store(true, Ordering::SeqCst);

        if let Some(stdin) = process.stdin.as_mut() {
            if let Err(e) = stdin.write_all(b"system_powerdown\n").await {
                tracing::debug!(name = %self.name, error = %e, "qemu monitor closed");
            }
            let _ = stdin.flush().await;
        }

        if self.wait_for_off(self.shutdown_timeout).await {
            return Ok(());
        }

        tracing::warn!(name = %self.name, "guest ignored powerdown, killing qemu");
        if let Some(kill) = process.kill.take() {
            let _ = kill.send(());
        }
        if self.wait_for_off(KILL_GRACE).await {
            Ok(())
        } else {
            Err(RoostError::Timeout {
                message: format!("qemu for \"{}\" did not exit", self.name),
            })
        }
    }
}

#[async_trait]
impl VirtualMachine for QemuVirtualMachine {
    async fn start(&mut self) -> Result<(), RoostError> {
        if self.current_state() == VmState::Running {
            return Ok(());
        }
        if let Some(missing) = self.required_files.iter().find(|p| !p.exists()) {
            return Err(RoostError::PreconditionFailed {
                message: format!("cannot start VM without {}", missing.display()),
            });
        }

        tracing::debug!(name = %self.name, program = %self.program, args = ?self.args, "starting qemu");
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RoostError::ExternalCommand {
                command: self.program.clone(),
                message: e.to_string(),
            })?;

        let stdin = child.stdin.take();
        if let Some(stderr) = child.stderr.take() {
            let name = self.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(name = %name, "qemu: {line}");
                }
            });
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        let requested = Arc::new(AtomicBool::new(false));
        self.state.send_replace(VmState::Running);
        self.spawn_exit_watcher(child, kill_rx, requested.clone());
        self.process = Some(Process {
            stdin,
            kill: Some(kill_tx),
            requested,
        });

        self.monitor.on_resume(&self.name);
        Ok(())
    }

    /// Like `shutdown`, but leaves the VM `Stopped` rather than `Off`.
    async fn stop(&mut self) -> Result<(), RoostError> {
        self.power_off().await?;
        self.state.send_replace(VmState::Stopped);
        self.monitor.on_stop(&self.name);
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), RoostError> {
        self.power_off().await?;
        self.monitor.on_shutdown(&self.name);
        Ok(())
    }

    fn current_state(&self) -> VmState {
        *self.state.borrow()
    }

    fn forwarding_port(&self) -> u16 {
        self.port
    }

    async fn wait_until_ssh_up(&mut self, timeout: Duration) -> Result<(), RoostError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.current_state() != VmState::Running {
                return Err(RoostError::ProcessExited {
                    message: format!(
                        "qemu for \"{}\" not running when waiting for ssh service to start",
                        self.name
                    ),
                });
            }
            if ssh::handshake(self.port).await.is_ok() {
                tracing::info!(name = %self.name, port = self.port, "ssh is up");
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(RoostError::Timeout {
                    message: format!(
                        "timed out waiting for ssh service on \"{}\" to start",
                        self.name
                    ),
                });
            }
            tokio::time::sleep(SSH_POLL_INTERVAL).await;
        }
    }
}
