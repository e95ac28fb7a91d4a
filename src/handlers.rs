//! The daemon's command handlers and the state they orchestrate.
//!
//! [`Daemon`] owns the instance registry, the image vault and the backend.
//! It is driven from a single task, so handlers never run concurrently and
//! take `&mut self`.

use std::path::Path;
use std::sync::Arc;

use facet::Facet;
use tokio::sync::mpsc::UnboundedSender;

use crate::backend::{
    ExecOutput, FactoryPrepare, VirtualMachine, VirtualMachineDescription, VirtualMachineFactory,
    VmExecute, VmState, VmStatusMonitor,
};
use crate::cloudinit;
use crate::config::{DaemonConfig, validate_instance_name};
use crate::error::RoostError;
use crate::image_host::{Query, VmImageHost};
use crate::instances::{self, Instance, InstanceRegistry, VmSpecs};
use crate::names::NameGenerator;
use crate::util::{normalize_mem_size, parse_size};
use crate::vault::{VmImage, VmImageVault};

const NAME_ATTEMPTS: usize = 100;

// ── wire types ───────────────────────────────────────────

/// Empty or zero fields take the defaults.
#[derive(Debug, Clone, Default, Facet)]
pub struct CreateRequest {
    /// Alias or image id; empty for the default image.
    pub image: String,
    pub name: String,
    pub num_cores: u32,
    pub mem_size: String,
    pub disk_space: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Facet)]
#[repr(u8)]
pub enum CreateReply {
    DownloadProgress(i32),
    CreateComplete(String),
    InstanceName(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Facet)]
#[repr(u8)]
pub enum InstanceStatus {
    Running,
    Stopped,
    Trashed,
    /// Recorded, but its VM could not be rebuilt at startup.
    Unavailable,
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            InstanceStatus::Running => "RUNNING",
            InstanceStatus::Stopped => "STOPPED",
            InstanceStatus::Trashed => "TRASHED",
            InstanceStatus::Unavailable => "UNAVAILABLE",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct InstanceSummary {
    pub name: String,
    pub status: InstanceStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct InstanceInfo {
    pub name: String,
    pub status: InstanceStatus,
    pub release: String,
    pub image_id: String,
    pub image_version: String,
    pub num_cores: u32,
    pub mem_size: String,
    pub disk_space: u64,
    pub ssh_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct ImageEntry {
    pub aliases: Vec<String>,
    pub release: String,
    pub version: String,
    pub id: String,
}

// ── daemon ───────────────────────────────────────────────

/// Backend pieces selected once at startup.
pub struct Collaborators {
    pub vault: Box<dyn VmImageVault>,
    pub host: Arc<dyn VmImageHost>,
    pub factory: Arc<dyn VirtualMachineFactory>,
    pub executor: Arc<dyn VmExecute>,
    pub names: Arc<dyn NameGenerator>,
    pub monitor: Arc<dyn VmStatusMonitor>,
    pub ssh_public_key: String,
}

/// What startup did with each persisted instance record.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Reconciliation {
    pub restored: usize,
    pub held: usize,
    pub dropped: usize,
}

pub struct Daemon {
    config: DaemonConfig,
    reconciled: Reconciliation,
    registry: InstanceRegistry,
    vault: Box<dyn VmImageVault>,
    host: Arc<dyn VmImageHost>,
    factory: Arc<dyn VirtualMachineFactory>,
    executor: Arc<dyn VmExecute>,
    names: Arc<dyn NameGenerator>,
    monitor: Arc<dyn VmStatusMonitor>,
    ssh_public_key: String,
}

fn status_of(vm: &dyn VirtualMachine) -> InstanceStatus {
    match vm.current_state() {
        VmState::Running => InstanceStatus::Running,
        VmState::Off | VmState::Stopped => InstanceStatus::Stopped,
    }
}

impl Daemon {
    /// Build the daemon and bring back the instances recorded at
    /// `records_path`. Records whose instance image is gone are dropped and
    /// the file is rewritten without them; vault images no record owns are
    /// removed. Records whose VM cannot be rebuilt are held unchanged.
    /// Restored VMs stay off.
    pub async fn new(
        config: DaemonConfig,
        records_path: &Path,
        parts: Collaborators,
    ) -> Result<Self, RoostError> {
        let mut daemon = Self {
            config,
            reconciled: Reconciliation::default(),
            registry: InstanceRegistry::new(records_path),
            vault: parts.vault,
            host: parts.host,
            factory: parts.factory,
            executor: parts.executor,
            names: parts.names,
            monitor: parts.monitor,
            ssh_public_key: parts.ssh_public_key,
        };

        let records = instances::load_records(records_path)?;

        for name in daemon.vault.instance_names() {
            if !records.contains_key(&name) {
                tracing::warn!(name = %name, "removing image with no instance record");
                daemon.discard_image(&name).await;
            }
        }

        let mut tally = Reconciliation::default();
        for (name, record) in records {
            let Some(image) = daemon.vault.instance_image(&name) else {
                tracing::warn!(name = %name, "instance image vanished, dropping instance");
                tally.dropped += 1;
                continue;
            };
            let desc = daemon.description(&name, &record.specs, image);
            match daemon
                .factory
                .create_virtual_machine(&desc, daemon.monitor.clone())
                .await
            {
                Ok(vm) => {
                    daemon
                        .registry
                        .restore(&name, record.specs, vm, record.trashed);
                    tally.restored += 1;
                }
                Err(e) => {
                    tracing::error!(name = %name, error = %e, "cannot restore instance, keeping its record");
                    daemon.registry.hold(&name, record);
                    tally.held += 1;
                }
            }
        }
        if tally.dropped > 0 {
            daemon.registry.persist()?;
        }

        tracing::info!(
            restored = tally.restored,
            held = tally.held,
            dropped = tally.dropped,
            "instances reconciled"
        );
        daemon.reconciled = tally;
        Ok(daemon)
    }

    pub fn reconciliation(&self) -> Reconciliation {
        self.reconciled
    }

    fn description(&self, name: &str, specs: &VmSpecs, image: VmImage) -> VirtualMachineDescription {
        VirtualMachineDescription {
            num_cores: specs.num_cores,
            mem_size: specs.mem_size.clone(),
            disk_space: specs.disk_space,
            vm_name: name.to_string(),
            image,
            cloud_init_config: cloudinit::make_cloud_init_config(&self.ssh_public_key, name),
        }
    }

    // ── create ───────────────────────────────────────────

    /// Progress and the assigned name go to `replies`. On failure nothing
    /// stays registered and the error is `PreconditionFailed`, except for
    /// name collisions.
    pub async fn create(
        &mut self,
        request: CreateRequest,
        replies: &UnboundedSender<CreateReply>,
    ) -> Result<String, RoostError> {
        self.try_create(request, replies)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "create failed");
                e.into_precondition()
            })
    }

    async fn try_create(
        &mut self,
        request: CreateRequest,
        replies: &UnboundedSender<CreateReply>,
    ) -> Result<String, RoostError> {
        let name = self.pick_name(&request.name)?;
        let specs = specs_from(&request)?;
        if self.vault.has_record_for(&name) {
            tracing::warn!(name = %name, "discarding leftover image for unregistered name");
            self.vault.remove(&name).await?;
        }
        tracing::info!(name = %name, image = %request.image, cores = specs.num_cores, mem = %specs.mem_size, "creating instance");

        let query = Query {
            name: name.clone(),
            release: request.image.clone(),
        };
        let progress = |percent: i32| {
            let _ = replies.send(CreateReply::DownloadProgress(percent));
        };
        let prepare = FactoryPrepare(self.factory.as_ref());
        let image = self
            .vault
            .fetch_image(self.factory.fetch_type(), &query, &prepare, &progress)
            .await?;

        let vm = match self.boot(&name, &specs, image).await {
            Ok(vm) => vm,
            Err(e) => {
                self.discard_image(&name).await;
                return Err(e);
            }
        };

        if let Err(e) = self.registry.create(&name, specs, vm) {
            self.discard_image(&name).await;
            return Err(e);
        }

        let _ = replies.send(CreateReply::CreateComplete(format!(
            "instance \"{name}\" is running"
        )));
        let _ = replies.send(CreateReply::InstanceName(name.clone()));
        tracing::info!(name = %name, "instance created");
        Ok(name)
    }

    fn pick_name(&self, requested: &str) -> Result<String, RoostError> {
        if !requested.is_empty() {
            validate_instance_name(requested)?;
            if self.registry.contains(requested) {
                return Err(RoostError::AlreadyExists {
                    name: requested.to_string(),
                });
            }
            return Ok(requested.to_string());
        }

        (0..NAME_ATTEMPTS)
            .map(|_| self.names.make_name())
            .find(|candidate| !self.registry.contains(candidate))
            .ok_or_else(|| RoostError::PreconditionFailed {
                message: format!("unable to generate a unique name after {NAME_ATTEMPTS} attempts"),
            })
    }

    async fn boot(
        &mut self,
        name: &str,
        specs: &VmSpecs,
        image: VmImage,
    ) -> Result<Box<dyn VirtualMachine>, RoostError> {
        let desc = self.description(name, specs, image);
        let mut vm = self
            .factory
            .create_virtual_machine(&desc, self.monitor.clone())
            .await?;

        let timeout = self.config.timeouts.create_ssh();
        let booted = match vm.start().await {
            Ok(()) => vm.wait_until_ssh_up(timeout).await,
            Err(e) => Err(e),
        };
        if let Err(e) = booted {
            if let Err(stop_err) = vm.shutdown().await {
                tracing::warn!(name, error = %stop_err, "failed to stop half-created instance");
            }
            return Err(e);
        }
        Ok(vm)
    }

    async fn discard_image(&mut self, name: &str) {
        if let Err(e) = self.vault.remove(name).await {
            tracing::warn!(name, error = %e, "failed to remove image of failed instance");
        }
    }

    // ── lifecycle ────────────────────────────────────────

    fn active(&mut self, name: &str) -> Result<&mut Instance, RoostError> {
        self.registry
            .find_active(name)
            .ok_or_else(|| RoostError::NotFound { name: name.into() })
    }

    pub async fn start(&mut self, name: &str) -> Result<(), RoostError> {
        let timeout = self.config.timeouts.start_ssh();
        let instance = self.active(name)?;
        instance.vm.start().await?;
        instance.vm.wait_until_ssh_up(timeout).await?;
        tracing::info!(name, "instance started");
        Ok(())
    }

    pub async fn stop(&mut self, name: &str) -> Result<(), RoostError> {
        self.active(name)?.vm.shutdown().await?;
        tracing::info!(name, "instance stopped");
        Ok(())
    }

    pub async fn trash(&mut self, name: &str) -> Result<(), RoostError> {
        self.active(name)?.vm.shutdown().await?;
        self.registry.move_to_trash(name)?;
        tracing::info!(name, "instance trashed");
        Ok(())
    }

    /// Back to active, still off.
    pub fn recover(&mut self, name: &str) -> Result<(), RoostError> {
        self.registry.recover(name)?;
        tracing::info!(name, "instance recovered");
        Ok(())
    }

    /// Remove every trashed instance. A failure on one instance does not
    /// stop the others; failed instances stay in the trash and the failures
    /// are reported together.
    pub async fn empty_trash(&mut self) -> Result<(), RoostError> {
        let mut failures = Vec::new();
        for name in self.registry.trashed_names() {
            if let Err(e) = self.purge(&name).await {
                tracing::error!(name = %name, error = %e, "failed to purge instance");
                failures.push(format!("{name}: {e}"));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(RoostError::PreconditionFailed {
                message: format!("failed to remove {}", failures.join("; ")),
            })
        }
    }

    async fn purge(&mut self, name: &str) -> Result<(), RoostError> {
        self.vault.remove(name).await?;
        let mut instance = self.registry.purge_trashed(name)?;
        if instance.vm.current_state() == VmState::Running {
            instance.vm.shutdown().await?;
        }
        tracing::info!(name, "instance deleted");
        Ok(())
    }

    pub async fn exec(&mut self, name: &str, args: &[String]) -> Result<ExecOutput, RoostError> {
        let instance = self.active(name)?;
        if args.is_empty() {
            return Err(RoostError::Unimplemented {
                command: "exec without a command".into(),
            });
        }
        if instance.vm.current_state() != VmState::Running {
            return Err(RoostError::PreconditionFailed {
                message: format!("instance \"{name}\" is not running"),
            });
        }
        let port = instance.vm.forwarding_port();
        self.executor.execute(port, args).await
    }

    // ── queries ──────────────────────────────────────────

    /// Active instances first, then trashed, each by name.
    pub fn list(&self) -> Vec<InstanceSummary> {
        let active = self.registry.active().map(|(name, i)| InstanceSummary {
            name: name.clone(),
            status: status_of(i.vm.as_ref()),
        });
        let trashed = self.registry.trashed().map(|(name, _)| InstanceSummary {
            name: name.clone(),
            status: InstanceStatus::Trashed,
        });
        let held = self.registry.held().map(|(name, _)| InstanceSummary {
            name: name.clone(),
            status: InstanceStatus::Unavailable,
        });
        active.chain(trashed).chain(held).collect()
    }

    pub fn info(&self, name: &str) -> Result<InstanceInfo, RoostError> {
        let (specs, status, ssh_port) =
            if let Some((_, i)) = self.registry.active().find(|(n, _)| *n == name) {
                (&i.specs, status_of(i.vm.as_ref()), i.vm.forwarding_port())
            } else if let Some((_, i)) = self.registry.trashed().find(|(n, _)| *n == name) {
                (&i.specs, InstanceStatus::Trashed, i.vm.forwarding_port())
            } else if let Some((_, r)) = self.registry.held().find(|(n, _)| *n == name) {
                (&r.specs, InstanceStatus::Unavailable, 0)
            } else {
                return Err(RoostError::NotFound { name: name.into() });
            };

        let image = self.vault.image_info_for(name);
        Ok(InstanceInfo {
            name: name.to_string(),
            status,
            release: image
                .as_ref()
                .map(|i| i.release_title.clone().unwrap_or_else(|| i.release.clone()))
                .unwrap_or_default(),
            image_id: image.as_ref().map(|i| i.id.clone()).unwrap_or_default(),
            image_version: image.map(|i| i.version).unwrap_or_default(),
            num_cores: specs.num_cores,
            mem_size: specs.mem_size.clone(),
            disk_space: specs.disk_space,
            ssh_port,
        })
    }

    pub async fn find(&mut self) -> Result<Vec<ImageEntry>, RoostError> {
        let mut entries = Vec::new();
        self.host
            .for_each_entry_do(&mut |info| {
                entries.push(ImageEntry {
                    aliases: info.aliases.clone(),
                    release: info.release.clone(),
                    version: info.version.clone(),
                    id: info.id.clone(),
                })
            })
            .await?;
        Ok(entries)
    }

    pub fn version(&self) -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }

    /// Power off every running instance; used when the daemon exits.
    pub async fn shutdown_all(&mut self) {
        for (name, instance) in self.registry.active_mut() {
            if instance.vm.current_state() != VmState::Running {
                continue;
            }
            if let Err(e) = instance.vm.shutdown().await {
                tracing::warn!(name = %name, error = %e, "failed to shut down instance");
            }
        }
    }
}

fn specs_from(request: &CreateRequest) -> Result<VmSpecs, RoostError> {
    let defaults = VmSpecs::default();
    Ok(VmSpecs {
        num_cores: if request.num_cores == 0 {
            defaults.num_cores
        } else {
            request.num_cores
        },
        mem_size: if request.mem_size.trim().is_empty() {
            defaults.mem_size
        } else {
            normalize_mem_size(&request.mem_size)?
        },
        disk_space: if request.disk_space.trim().is_empty() {
            defaults.disk_space
        } else {
            parse_size(&request.disk_space)?
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LoggingMonitor;
    use crate::fetcher::ProgressFn;
    use crate::image_host::VmImageInfo;
    use crate::testing::{EchoExecutor, FixedNames, StubFactory, StubImageHost, TrackingDownloader};
    use crate::vault::{DefaultVmImageVault, FetchType, PrepareAction};
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    /// The real vault, except that the images of `stuck` cannot be removed.
    struct StuckVault {
        inner: DefaultVmImageVault,
        stuck: Vec<String>,
    }

    #[async_trait]
    impl VmImageVault for StuckVault {
        async fn fetch_image(
            &mut self,
            fetch_type: FetchType,
            query: &Query,
            prepare: &dyn PrepareAction,
            monitor: ProgressFn<'_>,
        ) -> Result<VmImage, RoostError> {
            self.inner.fetch_image(fetch_type, query, prepare, monitor).await
        }

        async fn remove(&mut self, name: &str) -> Result<(), RoostError> {
            if self.stuck.iter().any(|s| s == name) {
                return Err(RoostError::PreconditionFailed {
                    message: format!("image of {name} is busy"),
                });
            }
            self.inner.remove(name).await
        }

        fn has_record_for(&self, name: &str) -> bool {
            self.inner.has_record_for(name)
        }

        fn instance_image(&self, name: &str) -> Option<VmImage> {
            self.inner.instance_image(name)
        }

        fn instance_names(&self) -> Vec<String> {
            self.inner.instance_names()
        }

        fn image_info_for(&self, name: &str) -> Option<VmImageInfo> {
            self.inner.image_info_for(name)
        }
    }

    struct Harness {
        dir: tempfile::TempDir,
        host: Arc<StubImageHost>,
        downloader: Arc<TrackingDownloader>,
        factory: Arc<StubFactory>,
        executor: Arc<EchoExecutor>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                host: Arc::new(StubImageHost::default()),
                downloader: Arc::new(TrackingDownloader::default()),
                factory: Arc::new(StubFactory::default()),
                executor: Arc::new(EchoExecutor::default()),
            }
        }

        fn records_path(&self) -> std::path::PathBuf {
            self.dir.path().join("instances.json")
        }

        fn vault_dir(&self) -> std::path::PathBuf {
            self.dir.path().join("vault")
        }

        async fn daemon(&self) -> Daemon {
            self.daemon_with_names(&["pied-piper"]).await
        }

        fn open_vault(&self) -> DefaultVmImageVault {
            DefaultVmImageVault::open(self.host.clone(), self.downloader.clone(), &self.vault_dir())
                .unwrap()
        }

        async fn daemon_with_names(&self, names: &[&str]) -> Daemon {
            self.daemon_with_vault(Box::new(self.open_vault()), names).await
        }

        async fn daemon_with_stuck_images(&self, stuck: &[&str]) -> Daemon {
            let vault = StuckVault {
                inner: self.open_vault(),
                stuck: stuck.iter().map(|s| s.to_string()).collect(),
            };
            self.daemon_with_vault(Box::new(vault), &["pied-piper"]).await
        }

        async fn daemon_with_vault(&self, vault: Box<dyn VmImageVault>, names: &[&str]) -> Daemon {
            Daemon::new(
                DaemonConfig::default(),
                &self.records_path(),
                Collaborators {
                    vault,
                    host: self.host.clone(),
                    factory: self.factory.clone(),
                    executor: self.executor.clone(),
                    names: Arc::new(FixedNames::new(names)),
                    monitor: Arc::new(LoggingMonitor),
                    ssh_public_key: "ssh-ed25519 AAAAtest roost@localhost".into(),
                },
            )
            .await
            .unwrap()
        }
    }

    fn request(name: &str) -> CreateRequest {
        CreateRequest {
            image: "xenial".into(),
            name: name.into(),
            ..CreateRequest::default()
        }
    }

    async fn create(daemon: &mut Daemon, req: CreateRequest) -> Result<(String, Vec<CreateReply>), RoostError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let name = daemon.create(req, &tx).await?;
        drop(tx);
        let mut replies = Vec::new();
        while let Some(r) = rx.recv().await {
            replies.push(r);
        }
        Ok((name, replies))
    }

    fn statuses(daemon: &Daemon) -> Vec<(String, InstanceStatus)> {
        daemon
            .list()
            .into_iter()
            .map(|s| (s.name, s.status))
            .collect()
    }

    #[tokio::test]
    async fn foo_walks_through_its_whole_lifecycle() {
        let h = Harness::new();
        let mut daemon = h.daemon().await;

        let (name, replies) = create(&mut daemon, request("foo")).await.unwrap();
        assert_eq!(name, "foo");
        let progress: Vec<_> = replies
            .iter()
            .filter(|r| matches!(r, CreateReply::DownloadProgress(_)))
            .collect();
        assert_eq!(progress.len(), 2);
        assert_eq!(replies.last(), Some(&CreateReply::InstanceName("foo".into())));
        assert_eq!(statuses(&daemon), vec![("foo".into(), InstanceStatus::Running)]);

        daemon.stop("foo").await.unwrap();
        assert_eq!(statuses(&daemon), vec![("foo".into(), InstanceStatus::Stopped)]);

        daemon.trash("foo").await.unwrap();
        assert_eq!(statuses(&daemon), vec![("foo".into(), InstanceStatus::Trashed)]);

        daemon.recover("foo").unwrap();
        assert_eq!(statuses(&daemon), vec![("foo".into(), InstanceStatus::Stopped)]);
        let info = daemon.info("foo").unwrap();
        assert_eq!(
            (info.num_cores, info.mem_size.as_str(), info.disk_space),
            (1, "1G", 0)
        );
    }

    #[tokio::test]
    async fn names_are_unique_across_active_and_trash() {
        let h = Harness::new();
        let mut daemon = h.daemon().await;
        create(&mut daemon, request("foo")).await.unwrap();

        let err = create(&mut daemon, request("foo")).await.unwrap_err();
        assert_eq!(err.code(), "already_exists");

        daemon.trash("foo").await.unwrap();
        let err = create(&mut daemon, request("foo")).await.unwrap_err();
        assert_eq!(err.code(), "already_exists");
        assert_eq!(daemon.list().len(), 1);
    }

    #[tokio::test]
    async fn two_creates_download_and_prepare_once() {
        let h = Harness::new();
        let mut daemon = h.daemon().await;
        create(&mut daemon, request("foo")).await.unwrap();
        create(&mut daemon, request("bar")).await.unwrap();

        assert_eq!(h.downloader.download_to_calls(), 1);
        assert_eq!(h.factory.prepared(), 1);
        let foo = daemon.info("foo").unwrap();
        let bar = daemon.info("bar").unwrap();
        assert_eq!(foo.image_id, bar.image_id);
        assert_ne!(foo.ssh_port, bar.ssh_port);
    }

    #[tokio::test]
    async fn specs_default_and_explicit_are_persisted() {
        let h = Harness::new();
        let mut daemon = h.daemon().await;
        create(&mut daemon, request("foo")).await.unwrap();
        create(
            &mut daemon,
            CreateRequest {
                num_cores: 4,
                mem_size: "2G".into(),
                ..request("bar")
            },
        )
        .await
        .unwrap();

        let records = instances::load_records(&h.records_path()).unwrap();
        assert_eq!(records["foo"].specs, VmSpecs::default());
        assert_eq!(
            records["bar"].specs,
            VmSpecs {
                num_cores: 4,
                mem_size: "2G".into(),
                disk_space: 0
            }
        );
    }

    #[tokio::test]
    async fn generated_name_skips_taken_ones() {
        let h = Harness::new();
        let mut daemon = h.daemon_with_names(&["foo", "foo", "bar"]).await;
        create(&mut daemon, request("foo")).await.unwrap();

        let (name, replies) = create(&mut daemon, request("")).await.unwrap();
        assert_eq!(name, "bar");
        assert_eq!(replies.last(), Some(&CreateReply::InstanceName("bar".into())));
    }

    #[tokio::test]
    async fn name_generation_gives_up() {
        let h = Harness::new();
        let mut daemon = h.daemon_with_names(&["foo"]).await;
        create(&mut daemon, request("foo")).await.unwrap();

        let err = create(&mut daemon, request("")).await.unwrap_err();
        assert_eq!(err.code(), "failed_precondition");
        assert!(err.to_string().contains("unique name"));
    }

    #[tokio::test]
    async fn failed_create_leaves_nothing_behind() {
        let h = Harness::new();
        let mut daemon = h.daemon().await;
        h.factory.fail_ssh(true);

        let err = create(&mut daemon, request("foo")).await.unwrap_err();
        assert_eq!(err.code(), "failed_precondition");
        assert!(daemon.list().is_empty());
        assert!(matches!(daemon.info("foo"), Err(RoostError::NotFound { .. })));
        assert!(!h.vault_dir().join("instances").join("foo").exists());

        // the name is free again
        h.factory.fail_ssh(false);
        create(&mut daemon, request("foo")).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_image_is_precondition_failure() {
        let h = Harness::new();
        let mut daemon = h.daemon().await;
        let err = create(
            &mut daemon,
            CreateRequest {
                image: "plan9".into(),
                ..request("foo")
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "failed_precondition");
        assert!(err.to_string().contains("plan9"));
        assert!(daemon.list().is_empty());
    }

    #[tokio::test]
    async fn bad_arguments_fail_create() {
        let h = Harness::new();
        let mut daemon = h.daemon().await;
        assert!(create(&mut daemon, request("-leading-dash")).await.is_err());
        let bad_mem = CreateRequest {
            mem_size: "lots".into(),
            ..request("foo")
        };
        assert!(create(&mut daemon, bad_mem).await.is_err());
        assert_eq!(h.downloader.download_to_calls(), 0);
    }

    #[tokio::test]
    async fn restart_restores_active_and_trashed_instances() {
        let h = Harness::new();
        {
            let mut daemon = h.daemon().await;
            create(&mut daemon, request("foo")).await.unwrap();
            create(
                &mut daemon,
                CreateRequest {
                    num_cores: 4,
                    mem_size: "2G".into(),
                    ..request("bar")
                },
            )
            .await
            .unwrap();
            daemon.trash("bar").await.unwrap();
        }

        let daemon = h.daemon().await;
        assert_eq!(
            statuses(&daemon),
            vec![
                ("foo".into(), InstanceStatus::Stopped),
                ("bar".into(), InstanceStatus::Trashed),
            ]
        );
        assert_eq!(daemon.info("bar").unwrap().num_cores, 4);
        // restore reuses the instance images
        assert_eq!(h.downloader.download_to_calls(), 1);
    }

    #[tokio::test]
    async fn restart_drops_instances_whose_image_vanished() {
        let h = Harness::new();
        {
            let mut daemon = h.daemon().await;
            create(&mut daemon, request("foo")).await.unwrap();
            create(&mut daemon, request("bar")).await.unwrap();
        }
        std::fs::remove_dir_all(h.vault_dir().join("instances").join("bar")).unwrap();

        let daemon = h.daemon().await;
        assert_eq!(statuses(&daemon), vec![("foo".into(), InstanceStatus::Stopped)]);

        let records = instances::load_records(&h.records_path()).unwrap();
        assert_eq!(records.keys().collect::<Vec<_>>(), vec!["foo"]);
    }

    #[tokio::test]
    async fn unbuildable_instance_is_held_until_a_later_restart() {
        let h = Harness::new();
        {
            let mut daemon = h.daemon().await;
            create(&mut daemon, request("foo")).await.unwrap();
            create(&mut daemon, request("bar")).await.unwrap();
        }

        h.factory.fail_create_for(Some("bar"));
        let mut daemon = h.daemon().await;
        assert_eq!(
            statuses(&daemon),
            vec![
                ("foo".into(), InstanceStatus::Stopped),
                ("bar".into(), InstanceStatus::Unavailable),
            ]
        );
        assert_eq!(
            daemon.reconciliation(),
            Reconciliation {
                restored: 1,
                held: 1,
                dropped: 0
            }
        );
        assert_eq!(daemon.info("bar").unwrap().status, InstanceStatus::Unavailable);
        assert_eq!(daemon.start("bar").await.unwrap_err().code(), "not_found");
        assert_eq!(
            create(&mut daemon, request("bar")).await.unwrap_err().code(),
            "already_exists"
        );

        // rewriting the record file keeps the held record
        create(&mut daemon, request("baz")).await.unwrap();
        let records = instances::load_records(&h.records_path()).unwrap();
        assert_eq!(
            records.keys().collect::<Vec<_>>(),
            vec!["bar", "baz", "foo"]
        );
        drop(daemon);

        h.factory.fail_create_for(None);
        let daemon = h.daemon().await;
        assert_eq!(
            statuses(&daemon),
            vec![
                ("bar".into(), InstanceStatus::Stopped),
                ("baz".into(), InstanceStatus::Stopped),
                ("foo".into(), InstanceStatus::Stopped),
            ]
        );
        assert_eq!(daemon.reconciliation().restored, 3);
    }

    #[tokio::test]
    async fn restart_counts_dropped_records_apart_from_restored() {
        let h = Harness::new();
        {
            let mut daemon = h.daemon().await;
            create(&mut daemon, request("foo")).await.unwrap();
            create(&mut daemon, request("bar")).await.unwrap();
            create(&mut daemon, request("baz")).await.unwrap();
        }
        std::fs::remove_dir_all(h.vault_dir().join("instances").join("baz")).unwrap();
        h.factory.fail_create_for(Some("bar"));

        let daemon = h.daemon().await;
        assert_eq!(
            daemon.reconciliation(),
            Reconciliation {
                restored: 1,
                held: 1,
                dropped: 1
            }
        );
    }

    #[tokio::test]
    async fn startup_removes_images_no_record_owns() {
        let h = Harness::new();
        {
            let mut daemon = h.daemon().await;
            create(&mut daemon, request("foo")).await.unwrap();
        }
        std::fs::remove_file(h.records_path()).unwrap();

        let mut daemon = h.daemon().await;
        assert!(daemon.list().is_empty());
        assert!(daemon.vault.instance_names().is_empty());
        assert!(!h.vault_dir().join("instances").join("foo").exists());

        // the old image is not reused for an image the host does not know
        let err = create(
            &mut daemon,
            CreateRequest {
                image: "plan9".into(),
                ..request("foo")
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "failed_precondition");
        assert!(err.to_string().contains("plan9"));
    }

    #[tokio::test]
    async fn empty_trash_reports_every_failure_and_keeps_what_failed() {
        let h = Harness::new();
        let mut daemon = h.daemon_with_stuck_images(&["foo", "baz"]).await;
        for name in ["foo", "bar", "baz"] {
            create(&mut daemon, request(name)).await.unwrap();
            daemon.trash(name).await.unwrap();
        }

        let err = daemon.empty_trash().await.unwrap_err();
        assert_eq!(err.code(), "failed_precondition");
        assert_eq!(
            err.to_string(),
            "failed to remove baz: image of baz is busy; foo: image of foo is busy"
        );

        assert_eq!(
            statuses(&daemon),
            vec![
                ("baz".into(), InstanceStatus::Trashed),
                ("foo".into(), InstanceStatus::Trashed),
            ]
        );
        assert!(!h.vault_dir().join("instances").join("bar").exists());
        assert!(h.vault_dir().join("instances").join("foo").exists());
        let records = instances::load_records(&h.records_path()).unwrap();
        assert_eq!(records.keys().collect::<Vec<_>>(), vec!["baz", "foo"]);
        assert!(records.values().all(|r| r.trashed));

        // the name that went through is free again
        create(&mut daemon, request("bar")).await.unwrap();
    }

    #[tokio::test]
    async fn trash_then_empty_trash_is_permanent() {
        let h = Harness::new();
        let mut daemon = h.daemon().await;
        create(&mut daemon, request("foo")).await.unwrap();
        create(&mut daemon, request("bar")).await.unwrap();

        daemon.trash("foo").await.unwrap();
        daemon.empty_trash().await.unwrap();

        assert!(matches!(daemon.recover("foo"), Err(RoostError::NotFound { .. })));
        assert_eq!(statuses(&daemon), vec![("bar".into(), InstanceStatus::Running)]);
        assert!(!h.vault_dir().join("instances").join("foo").exists());
        assert!(!instances::load_records(&h.records_path()).unwrap().contains_key("foo"));

        // the name can be reused
        create(&mut daemon, request("foo")).await.unwrap();
    }

    #[tokio::test]
    async fn empty_trash_with_nothing_trashed_is_ok() {
        let h = Harness::new();
        let mut daemon = h.daemon().await;
        daemon.empty_trash().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_names_are_not_found_and_change_nothing() {
        let h = Harness::new();
        let mut daemon = h.daemon().await;
        create(&mut daemon, request("foo")).await.unwrap();
        let before = statuses(&daemon);

        assert_eq!(daemon.info("nonexistent").unwrap_err().code(), "not_found");
        assert_eq!(daemon.start("nonexistent").await.unwrap_err().code(), "not_found");
        assert_eq!(daemon.stop("nonexistent").await.unwrap_err().code(), "not_found");
        assert_eq!(daemon.trash("nonexistent").await.unwrap_err().code(), "not_found");
        assert_eq!(daemon.recover("foo").unwrap_err().code(), "not_found");
        assert_eq!(
            daemon.exec("nonexistent", &["ls".into()]).await.unwrap_err().code(),
            "not_found"
        );
        assert_eq!(statuses(&daemon), before);
    }

    #[tokio::test]
    async fn trashed_instance_cannot_be_started() {
        let h = Harness::new();
        let mut daemon = h.daemon().await;
        create(&mut daemon, request("foo")).await.unwrap();
        daemon.trash("foo").await.unwrap();
        assert_eq!(daemon.start("foo").await.unwrap_err().code(), "not_found");
        assert_eq!(daemon.info("foo").unwrap().status, InstanceStatus::Trashed);
    }

    #[tokio::test]
    async fn start_brings_a_stopped_instance_back() {
        let h = Harness::new();
        let mut daemon = h.daemon().await;
        create(&mut daemon, request("foo")).await.unwrap();
        daemon.stop("foo").await.unwrap();
        daemon.start("foo").await.unwrap();
        assert_eq!(daemon.info("foo").unwrap().status, InstanceStatus::Running);
    }

    #[tokio::test]
    async fn exec_runs_over_the_forwarding_port() {
        let h = Harness::new();
        let mut daemon = h.daemon().await;
        create(&mut daemon, request("foo")).await.unwrap();
        let port = daemon.info("foo").unwrap().ssh_port;

        let out = daemon
            .exec("foo", &["uname".into(), "-a".into()])
            .await
            .unwrap();
        assert_eq!(out.stdout, "uname -a\n");
        assert_eq!(
            h.executor.calls(),
            vec![(port, vec!["uname".to_string(), "-a".to_string()])]
        );
    }

    #[tokio::test]
    async fn exec_without_command_is_unimplemented() {
        let h = Harness::new();
        let mut daemon = h.daemon().await;
        create(&mut daemon, request("foo")).await.unwrap();
        let err = daemon.exec("foo", &[]).await.unwrap_err();
        assert_eq!(err.code(), "unimplemented");
        assert!(h.executor.calls().is_empty());
    }

    #[tokio::test]
    async fn exec_needs_a_running_instance() {
        let h = Harness::new();
        let mut daemon = h.daemon().await;
        create(&mut daemon, request("foo")).await.unwrap();
        daemon.stop("foo").await.unwrap();
        let err = daemon.exec("foo", &["ls".into()]).await.unwrap_err();
        assert_eq!(err.code(), "failed_precondition");
    }

    #[tokio::test]
    async fn info_reports_image_and_cloud_init_carries_the_key() {
        let h = Harness::new();
        let mut daemon = h.daemon().await;
        create(&mut daemon, request("foo")).await.unwrap();

        let info = daemon.info("foo").unwrap();
        assert_eq!(info.release, "16.04 LTS");
        assert_eq!(info.image_id, h.host.info.id);
        assert_eq!(info.image_version, "20170307");

        let desc = h.factory.descriptions().pop().unwrap();
        assert_eq!(desc.vm_name, "foo");
        let user_data = cloudinit::to_user_data(&desc.cloud_init_config).unwrap();
        assert!(user_data.contains("ssh-ed25519 AAAAtest"));
    }

    #[tokio::test]
    async fn find_lists_known_images() {
        let h = Harness::new();
        let mut daemon = h.daemon().await;
        let images = daemon.find().await.unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].release, "xenial");
        assert!(images[0].aliases.contains(&"default".to_string()));
    }

    #[tokio::test]
    async fn version_is_crate_version() {
        let h = Harness::new();
        let daemon = h.daemon().await;
        assert_eq!(daemon.version(), env!("CARGO_PKG_VERSION"));
    }
}
