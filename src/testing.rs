//! Test doubles shared by the unit tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::backend::{
    ExecOutput, VirtualMachine, VirtualMachineDescription, VirtualMachineFactory, VmExecute,
    VmState, VmStatusMonitor,
};
use crate::error::RoostError;
use crate::fetcher::{ProgressFn, UrlDownloader};
use crate::image_host::{Query, VmImageHost, VmImageInfo};
use crate::names::NameGenerator;
use crate::simplestreams::INDEX_PATH;
use crate::vault::{FetchType, VmImage};

pub const HOST_URL: &str = "https://images.test/releases/";
pub const MANIFEST_PATH: &str = "streams/v1/com.ubuntu.cloud:released:download.json";
pub const XENIAL_ID: &str = "1797c5c82016c1e65f4008fcf89deae3a044ef76087a9ec5b907c6d64a3609ac";
pub const YAKKETY_ID: &str = "8e8ad8e5a2f4c6bbaf4d9d5a0a6a1d2e4bcf7f2d8c0c9a9d4e6f1b3a5c7d9e0f";

pub fn index_json() -> String {
    format!(
        r#"{{
  "index": {{
    "com.ubuntu.cloud:released:download": {{
      "datatype": "image-downloads",
      "path": "{MANIFEST_PATH}"
    }},
    "com.ubuntu.cloud:released:aws": {{
      "datatype": "image-ids",
      "path": "streams/v1/com.ubuntu.cloud:released:aws.json"
    }}
  }}
}}"#
    )
}

pub fn manifest_json() -> String {
    format!(
        r#"{{
  "updated": "Wed, 08 Mar 2017 04:20:00 +0000",
  "products": {{
    "com.ubuntu.cloud:server:16.04:amd64": {{
      "aliases": "16.04,default,lts,x,xenial",
      "arch": "amd64",
      "release": "xenial",
      "release_title": "16.04 LTS",
      "versions": {{
        "20170306": {{
          "items": {{
            "disk1.img": {{
              "path": "server/xenial/20170306/xenial-disk1.img",
              "sha256": "0ld0ld0ld"
            }}
          }}
        }},
        "20170307": {{
          "items": {{
            "disk1.img": {{
              "path": "server/xenial/20170307/xenial-disk1.img",
              "sha256": "{XENIAL_ID}"
            }},
            "boot-kernel": {{
              "path": "server/xenial/20170307/vmlinuz",
              "sha256": "k"
            }},
            "boot-initrd": {{
              "path": "server/xenial/20170307/initrd",
              "sha256": "i"
            }}
          }}
        }}
      }}
    }},
    "com.ubuntu.cloud:server:16.10:amd64": {{
      "aliases": "16.10,y,yakkety",
      "arch": "amd64",
      "release": "yakkety",
      "release_title": "16.10",
      "versions": {{
        "20170303": {{
          "items": {{
            "disk1.img": {{
              "path": "server/yakkety/20170303/yakkety-disk1.img",
              "sha256": "{YAKKETY_ID}"
            }}
          }}
        }}
      }}
    }},
    "com.ubuntu.cloud:server:16.04:arm64": {{
      "aliases": "arm-only",
      "arch": "arm64",
      "release": "xenial",
      "versions": {{
        "20170307": {{
          "items": {{
            "disk1.img": {{
              "path": "server/xenial/20170307/xenial-arm64-disk1.img",
              "sha256": "a4a4a4"
            }}
          }}
        }}
      }}
    }},
    "com.ubuntu.cloud:server:17.04:amd64": {{
      "aliases": "nodisk",
      "arch": "amd64",
      "release": "zesty",
      "versions": {{
        "20170301": {{
          "items": {{
            "root.tar.xz": {{
              "path": "server/zesty/20170301/root.tar.xz",
              "sha256": "7a7a7a"
            }}
          }}
        }}
      }}
    }}
  }}
}}"#
    )
}

// ── downloader ───────────────────────────────────────────

/// Serves canned bodies for `download` and writes placeholder files for
/// `download_to`, counting every call.
#[derive(Default)]
pub struct TrackingDownloader {
    files: HashMap<String, Vec<u8>>,
    requested: Mutex<Vec<String>>,
    download_calls: AtomicUsize,
    download_to_calls: AtomicUsize,
    fail: AtomicBool,
}

impl TrackingDownloader {
    /// Serves the fixture index and manifest under [`HOST_URL`].
    pub fn with_manifest() -> Self {
        let mut files = HashMap::new();
        files.insert(format!("{HOST_URL}{INDEX_PATH}"), index_json().into_bytes());
        files.insert(
            format!("{HOST_URL}{MANIFEST_PATH}"),
            manifest_json().into_bytes(),
        );
        Self {
            files,
            ..Self::default()
        }
    }

    pub fn fail_downloads(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn download_calls(&self) -> usize {
        self.download_calls.load(Ordering::SeqCst)
    }

    pub fn download_to_calls(&self) -> usize {
        self.download_to_calls.load(Ordering::SeqCst)
    }

    pub fn requested(&self) -> Vec<String> {
        self.requested
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    fn record(&self, url: &str) {
        if let Ok(mut r) = self.requested.lock() {
            r.push(url.to_string());
        }
    }
}

#[async_trait]
impl UrlDownloader for TrackingDownloader {
    async fn download(&self, url: &str) -> Result<Vec<u8>, RoostError> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        self.record(url);
        if self.fail.load(Ordering::SeqCst) {
            return Err(RoostError::network(format!("failed to download {url}")));
        }
        self.files
            .get(url)
            .cloned()
            .ok_or_else(|| RoostError::network(format!("connection refused: {url}")))
    }

    async fn download_to(
        &self,
        url: &str,
        dest: &Path,
        progress: ProgressFn<'_>,
    ) -> Result<(), RoostError> {
        self.download_to_calls.fetch_add(1, Ordering::SeqCst);
        self.record(url);
        if self.fail.load(Ordering::SeqCst) {
            return Err(RoostError::network(format!("failed to download {url}")));
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| RoostError::io("test mkdir", e))?;
        }
        let body = self
            .files
            .get(url)
            .cloned()
            .unwrap_or_else(|| format!("contents of {url}").into_bytes());
        std::fs::write(dest, body).map_err(|e| RoostError::io("test write", e))?;
        progress(50);
        progress(100);
        Ok(())
    }
}

// ── image host ───────────────────────────────────────────

/// Resolves the empty query, any alias of `info` and its id to `info`.
pub struct StubImageHost {
    pub info: VmImageInfo,
    calls: AtomicUsize,
}

impl Default for StubImageHost {
    fn default() -> Self {
        Self {
            info: VmImageInfo {
                aliases: vec!["default".into(), "xenial".into()],
                release: "xenial".into(),
                release_title: Some("16.04 LTS".into()),
                image_location: format!("{HOST_URL}server/xenial/20170307/xenial-disk1.img"),
                kernel_location: Some(format!("{HOST_URL}server/xenial/20170307/vmlinuz")),
                initrd_location: Some(format!("{HOST_URL}server/xenial/20170307/initrd")),
                id: XENIAL_ID.into(),
                version: "20170307".into(),
            },
            calls: AtomicUsize::new(0),
        }
    }
}

impl StubImageHost {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VmImageHost for StubImageHost {
    async fn info_for(&self, query: &Query) -> Result<VmImageInfo, RoostError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let release = query.release.as_str();
        if release.is_empty() || release == self.info.id || self.info.aliases.iter().any(|a| a == release) {
            Ok(self.info.clone())
        } else {
            Err(RoostError::ImageNotFound {
                query: release.to_string(),
            })
        }
    }

    async fn for_each_entry_do(
        &self,
        action: &mut (dyn for<'v> FnMut(&'v VmImageInfo) + Send),
    ) -> Result<(), RoostError> {
        action(&self.info);
        Ok(())
    }
}

// ── status monitor ───────────────────────────────────────

#[derive(Default)]
pub struct RecordingMonitor {
    events: Mutex<Vec<&'static str>>,
}

impl RecordingMonitor {
    pub fn events(&self) -> Vec<&'static str> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    fn push(&self, event: &'static str) {
        if let Ok(mut e) = self.events.lock() {
            e.push(event);
        }
    }
}

impl VmStatusMonitor for RecordingMonitor {
    fn on_resume(&self, _name: &str) {
        self.push("resume");
    }

    fn on_stop(&self, _name: &str) {
        self.push("stop");
    }

    fn on_shutdown(&self, _name: &str) {
        self.push("shutdown");
    }
}

// ── virtual machines ─────────────────────────────────────

/// In-memory VM: state flips instantly, SSH is up unless told otherwise.
pub struct StubVm {
    state: VmState,
    port: u16,
    ssh_fails: bool,
    ssh_gate: Option<Arc<Notify>>,
}

impl StubVm {
    pub fn new(port: u16, ssh_fails: bool) -> Self {
        Self {
            state: VmState::Off,
            port,
            ssh_fails,
            ssh_gate: None,
        }
    }

    pub fn boxed() -> Box<dyn VirtualMachine> {
        Box::new(Self::new(2222, false))
    }
}

#[async_trait]
impl VirtualMachine for StubVm {
    async fn start(&mut self) -> Result<(), RoostError> {
        self.state = VmState::Running;
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), RoostError> {
        self.state = VmState::Stopped;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), RoostError> {
        self.state = VmState::Off;
        Ok(())
    }

    fn current_state(&self) -> VmState {
        self.state
    }

    fn forwarding_port(&self) -> u16 {
        self.port
    }

    async fn wait_until_ssh_up(&mut self, timeout: Duration) -> Result<(), RoostError> {
        if let Some(gate) = &self.ssh_gate {
            gate.notified().await;
        }
        if self.ssh_fails {
            return Err(RoostError::Timeout {
                message: format!("ssh not reachable within {}s", timeout.as_secs()),
            });
        }
        Ok(())
    }
}

/// Builds [`StubVm`]s and remembers every description it was handed.
pub struct StubFactory {
    descriptions: Mutex<Vec<VirtualMachineDescription>>,
    prepared: AtomicUsize,
    next_port: AtomicU16,
    ssh_fails: AtomicBool,
    ssh_gate: Mutex<Option<Arc<Notify>>>,
    broken: Mutex<Option<String>>,
}

impl Default for StubFactory {
    fn default() -> Self {
        Self {
            descriptions: Mutex::new(Vec::new()),
            prepared: AtomicUsize::new(0),
            next_port: AtomicU16::new(50000),
            ssh_fails: AtomicBool::new(false),
            ssh_gate: Mutex::new(None),
            broken: Mutex::new(None),
        }
    }
}

impl StubFactory {
    /// Later VMs block in `wait_until_ssh_up` until the gate is notified.
    pub fn gate_ssh(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        if let Ok(mut g) = self.ssh_gate.lock() {
            *g = Some(gate.clone());
        }
        gate
    }

    /// Refuse to build a VM named `name`; `None` builds everything again.
    pub fn fail_create_for(&self, name: Option<&str>) {
        if let Ok(mut b) = self.broken.lock() {
            *b = name.map(str::to_string);
        }
    }

    pub fn fail_ssh(&self, fail: bool) {
        self.ssh_fails.store(fail, Ordering::SeqCst);
    }

    pub fn created(&self) -> usize {
        self.descriptions.lock().map(|d| d.len()).unwrap_or_default()
    }

    pub fn prepared(&self) -> usize {
        self.prepared.load(Ordering::SeqCst)
    }

    pub fn descriptions(&self) -> Vec<VirtualMachineDescription> {
        self.descriptions
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl VirtualMachineFactory for StubFactory {
    async fn create_virtual_machine(
        &self,
        desc: &VirtualMachineDescription,
        _monitor: Arc<dyn VmStatusMonitor>,
    ) -> Result<Box<dyn VirtualMachine>, RoostError> {
        let broken = self.broken.lock().ok().and_then(|b| b.clone());
        if broken.as_deref() == Some(desc.vm_name.as_str()) {
            return Err(RoostError::ProcessExited {
                message: format!("qemu for {} exited at startup", desc.vm_name),
            });
        }
        if let Ok(mut d) = self.descriptions.lock() {
            d.push(desc.clone());
        }
        let port = self.next_port.fetch_add(1, Ordering::SeqCst);
        let mut vm = StubVm::new(port, self.ssh_fails.load(Ordering::SeqCst));
        vm.ssh_gate = self.ssh_gate.lock().ok().and_then(|g| g.clone());
        Ok(Box::new(vm))
    }

    fn fetch_type(&self) -> FetchType {
        FetchType::ImageOnly
    }

    async fn prepare(&self, image: VmImage) -> Result<VmImage, RoostError> {
        self.prepared.fetch_add(1, Ordering::SeqCst);
        Ok(image)
    }
}

// ── exec ─────────────────────────────────────────────────

/// Echoes the argument vector back on stdout.
#[derive(Default)]
pub struct EchoExecutor {
    calls: Mutex<Vec<(u16, Vec<String>)>>,
}

impl EchoExecutor {
    pub fn calls(&self) -> Vec<(u16, Vec<String>)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl VmExecute for EchoExecutor {
    async fn execute(&self, port: u16, args: &[String]) -> Result<ExecOutput, RoostError> {
        if let Ok(mut c) = self.calls.lock() {
            c.push((port, args.to_vec()));
        }
        Ok(ExecOutput {
            stdout: format!("{}\n", args.join(" ")),
            stderr: String::new(),
            exit_code: 0,
        })
    }
}

// ── names ────────────────────────────────────────────────

/// Hands out the given names in order, then repeats the last one.
pub struct FixedNames {
    names: Vec<String>,
    next: AtomicUsize,
}

impl FixedNames {
    pub fn new(names: &[&str]) -> Self {
        Self {
            names: names.iter().map(|n| n.to_string()).collect(),
            next: AtomicUsize::new(0),
        }
    }
}

impl NameGenerator for FixedNames {
    fn make_name(&self) -> String {
        let i = self.next.fetch_add(1, Ordering::SeqCst);
        self.names
            .get(i.min(self.names.len().saturating_sub(1)))
            .cloned()
            .unwrap_or_else(|| "unnamed".into())
    }
}
