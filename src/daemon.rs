use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use roam::Tx;
use roam_stream::{Client, Connector, HandshakeConfig, NoDispatcher, accept};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};

use crate::backend::qemu::QemuVirtualMachineFactory;
use crate::backend::{ExecOutput, LoggingMonitor};
use crate::config::DaemonConfig;
use crate::error::{RoostError, RpcError};
use crate::fetcher::{HttpDownloader, UrlDownloader};
use crate::handlers::{
    Collaborators, CreateReply, CreateRequest, Daemon, ImageEntry, InstanceInfo, InstanceSummary,
};
use crate::image_host::{SimpleStreamsHost, SimpleStreamsHostConfig, VmImageHost};
use crate::names::PetNameGenerator;
use crate::paths;
use crate::ssh::{SshExecutor, SshKey};
use crate::vault::DefaultVmImageVault;

const COMMAND_QUEUE: usize = 16;

// ── Roam service definition ─────────────────────────────────────────

#[roam::service]
pub trait RoostDaemon {
    /// Streams progress on `output` while the instance is built; resolves
    /// to the instance name.
    async fn create(
        &self,
        request: CreateRequest,
        output: Tx<CreateReply>,
    ) -> Result<String, RpcError>;
    async fn start(&self, name: String) -> Result<String, RpcError>;
    async fn stop(&self, name: String) -> Result<String, RpcError>;
    async fn trash(&self, name: String) -> Result<String, RpcError>;
    async fn recover(&self, name: String) -> Result<String, RpcError>;
    async fn empty_trash(&self) -> Result<String, RpcError>;
    async fn exec(&self, name: String, args: Vec<String>) -> Result<ExecOutput, RpcError>;
    async fn list(&self) -> Result<Vec<InstanceSummary>, RpcError>;
    async fn info(&self, name: String) -> Result<InstanceInfo, RpcError>;
    async fn find(&self) -> Result<Vec<ImageEntry>, RpcError>;
    async fn version(&self) -> Result<String, RpcError>;
}

// ── Connector: always Unix socket ───────────────────────────────────

pub struct DaemonConnector {
    path: PathBuf,
}

impl Connector for DaemonConnector {
    type Transport = UnixStream;

    async fn connect(&self) -> io::Result<UnixStream> {
        UnixStream::connect(&self.path).await
    }
}

pub type DaemonClient = RoostDaemonClient<Client<DaemonConnector, NoDispatcher>>;

// ── command queue ───────────────────────────────────────────────────

type Reply<T> = oneshot::Sender<Result<T, RoostError>>;

/// One RPC, queued for the dispatch loop that owns the [`Daemon`].
pub enum DaemonCommand {
    Create(CreateRequest, mpsc::UnboundedSender<CreateReply>, Reply<String>),
    Start(String, Reply<String>),
    Stop(String, Reply<String>),
    Trash(String, Reply<String>),
    Recover(String, Reply<String>),
    EmptyTrash(Reply<String>),
    Exec(String, Vec<String>, Reply<ExecOutput>),
    List(Reply<Vec<InstanceSummary>>),
    Info(String, Reply<InstanceInfo>),
    Find(Reply<Vec<ImageEntry>>),
    Version(Reply<String>),
}

/// Run one command to completion against the daemon.
pub async fn dispatch(daemon: &mut Daemon, command: DaemonCommand) {
    match command {
        DaemonCommand::Create(request, replies, reply) => {
            let result = daemon.create(request, &replies).await;
            drop(replies);
            let _ = reply.send(result);
        }
        DaemonCommand::Start(name, reply) => {
            let result = daemon.start(&name).await;
            let _ = reply.send(result.map(|()| format!("started {name}")));
        }
        DaemonCommand::Stop(name, reply) => {
            let result = daemon.stop(&name).await;
            let _ = reply.send(result.map(|()| format!("stopped {name}")));
        }
        DaemonCommand::Trash(name, reply) => {
            let result = daemon.trash(&name).await;
            let _ = reply.send(result.map(|()| format!("trashed {name}")));
        }
        DaemonCommand::Recover(name, reply) => {
            let result = daemon.recover(&name);
            let _ = reply.send(result.map(|()| format!("recovered {name}")));
        }
        DaemonCommand::EmptyTrash(reply) => {
            let result = daemon.empty_trash().await;
            let _ = reply.send(result.map(|()| "trash emptied".to_string()));
        }
        DaemonCommand::Exec(name, args, reply) => {
            let _ = reply.send(daemon.exec(&name, &args).await);
        }
        DaemonCommand::List(reply) => {
            let _ = reply.send(Ok(daemon.list()));
        }
        DaemonCommand::Info(name, reply) => {
            let _ = reply.send(daemon.info(&name));
        }
        DaemonCommand::Find(reply) => {
            let _ = reply.send(daemon.find().await);
        }
        DaemonCommand::Version(reply) => {
            let _ = reply.send(Ok(daemon.version()));
        }
    }
}

// ── DaemonImpl: forwards RPCs into the queue ────────────────────────

#[derive(Clone)]
pub struct DaemonImpl {
    commands: mpsc::Sender<DaemonCommand>,
}

impl DaemonImpl {
    pub fn new(commands: mpsc::Sender<DaemonCommand>) -> Self {
        Self { commands }
    }

    async fn call<T>(&self, command: impl FnOnce(Reply<T>) -> DaemonCommand) -> Result<T, RpcError> {
        let gone = || RpcError {
            code: "internal".into(),
            message: "daemon is shutting down".into(),
        };
        let (tx, rx) = oneshot::channel();
        self.commands.send(command(tx)).await.map_err(|_| gone())?;
        rx.await.map_err(|_| gone())?.map_err(RpcError::from)
    }
}

impl RoostDaemon for DaemonImpl {
    async fn create(
        &self,
        _cx: &roam::Context,
        request: CreateRequest,
        output: Tx<CreateReply>,
    ) -> Result<String, RpcError> {
        let (replies, mut rx) = mpsc::unbounded_channel();
        let forward = async move {
            while let Some(r) = rx.recv().await {
                if let Err(e) = output.send(&r).await {
                    tracing::debug!("create progress dropped: {e}");
                }
            }
        };
        let (result, ()) = tokio::join!(
            self.call(|reply| DaemonCommand::Create(request, replies, reply)),
            forward
        );
        result
    }

    async fn start(&self, _cx: &roam::Context, name: String) -> Result<String, RpcError> {
        self.call(|reply| DaemonCommand::Start(name, reply)).await
    }

    async fn stop(&self, _cx: &roam::Context, name: String) -> Result<String, RpcError> {
        self.call(|reply| DaemonCommand::Stop(name, reply)).await
    }

    async fn trash(&self, _cx: &roam::Context, name: String) -> Result<String, RpcError> {
        self.call(|reply| DaemonCommand::Trash(name, reply)).await
    }

    async fn recover(&self, _cx: &roam::Context, name: String) -> Result<String, RpcError> {
        self.call(|reply| DaemonCommand::Recover(name, reply)).await
    }

    async fn empty_trash(&self, _cx: &roam::Context) -> Result<String, RpcError> {
        self.call(DaemonCommand::EmptyTrash).await
    }

    async fn exec(
        &self,
        _cx: &roam::Context,
        name: String,
        args: Vec<String>,
    ) -> Result<ExecOutput, RpcError> {
        self.call(|reply| DaemonCommand::Exec(name, args, reply)).await
    }

    async fn list(&self, _cx: &roam::Context) -> Result<Vec<InstanceSummary>, RpcError> {
        self.call(DaemonCommand::List).await
    }

    async fn info(&self, _cx: &roam::Context, name: String) -> Result<InstanceInfo, RpcError> {
        self.call(|reply| DaemonCommand::Info(name, reply)).await
    }

    async fn find(&self, _cx: &roam::Context) -> Result<Vec<ImageEntry>, RpcError> {
        self.call(DaemonCommand::Find).await
    }

    async fn version(&self, _cx: &roam::Context) -> Result<String, RpcError> {
        self.call(DaemonCommand::Version).await
    }
}

// ── connect(): create a client connected to the daemon ──────────────

pub fn connect() -> Result<DaemonClient, RoostError> {
    if !is_daemon_running(&paths::pid_path()) {
        return Err(RoostError::Daemon {
            message: "no daemon running. Run `roost serve` first.".into(),
        });
    }
    let connector = DaemonConnector {
        path: paths::socket_path(),
    };
    let client = roam_stream::connect(connector, HandshakeConfig::default(), NoDispatcher);
    Ok(RoostDaemonClient::new(client))
}

pub fn is_daemon_running(pid_file: &Path) -> bool {
    let Ok(contents) = std::fs::read_to_string(pid_file) else {
        return false;
    };
    let Ok(pid) = contents.trim().parse::<i32>() else {
        return false;
    };
    Path::new(&format!("/proc/{pid}")).exists()
}

// ── Daemon serve loop ───────────────────────────────────────────────

/// Wire the production backend together and reconcile persisted state.
async fn build_daemon(config: DaemonConfig) -> Result<Daemon, RoostError> {
    let key = SshKey::load_or_generate(&paths::ssh_key_path())?;
    let downloader: Arc<dyn UrlDownloader> = Arc::new(HttpDownloader::new()?);
    let host: Arc<dyn VmImageHost> = Arc::new(SimpleStreamsHost::new(
        SimpleStreamsHostConfig {
            host_url: config.image.host_url.clone(),
            arch: config.image.arch.clone(),
            default_alias: config.image.default_alias.clone(),
            manifest_ttl: config.manifest_ttl(),
        },
        downloader.clone(),
    ));
    let vault = DefaultVmImageVault::open(host.clone(), downloader, &paths::vault_dir())?;
    let factory = Arc::new(QemuVirtualMachineFactory::new(
        config.qemu.clone(),
        config.timeouts.shutdown(),
    ));
    let executor = Arc::new(SshExecutor::new(key.clone(), config.ssh.user.clone()));

    Daemon::new(
        config,
        &paths::instances_file(),
        Collaborators {
            vault: Box::new(vault),
            host,
            factory,
            executor,
            names: Arc::new(PetNameGenerator),
            monitor: Arc::new(LoggingMonitor),
            ssh_public_key: key.public_key().to_string(),
        },
    )
    .await
}

pub async fn run_serve(config: DaemonConfig) -> Result<(), RoostError> {
    let pid_file = paths::pid_path();
    if is_daemon_running(&pid_file) {
        return Err(RoostError::Daemon {
            message: format!("a daemon is already running (pid file {})", pid_file.display()),
        });
    }

    let mut daemon = build_daemon(config).await?;

    let data = paths::data_dir();
    std::fs::create_dir_all(&data)
        .map_err(|e| RoostError::io(format!("creating {}", data.display()), e))?;
    std::fs::write(&pid_file, std::process::id().to_string())
        .map_err(|e| RoostError::io(format!("writing PID file {}", pid_file.display()), e))?;

    let sock_path = paths::socket_path();
    if sock_path.exists() {
        let _ = std::fs::remove_file(&sock_path);
    }
    let listener = tokio::net::UnixListener::bind(&sock_path)
        .map_err(|e| RoostError::io(format!("binding Unix socket {}", sock_path.display()), e))?;

    let (command_tx, mut command_rx) = mpsc::channel::<DaemonCommand>(COMMAND_QUEUE);
    let handler = DaemonImpl::new(command_tx);

    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| RoostError::io("registering SIGTERM handler", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| RoostError::io("registering SIGINT handler", e))?;

    tracing::info!(sock = %sock_path.display(), version = env!("CARGO_PKG_VERSION"), "daemon listening");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let dispatcher = RoostDaemonDispatcher::new(handler.clone());
                        tokio::spawn(async move {
                            match accept(stream, HandshakeConfig::default(), dispatcher).await {
                                Ok((_handle, _incoming, driver)) => {
                                    if let Err(e) = driver.run().await {
                                        tracing::debug!("connection driver ended: {e}");
                                    }
                                }
                                Err(e) => tracing::error!("daemon handshake failed: {e}"),
                            }
                        });
                    }
                    Err(e) => tracing::error!("daemon accept error: {e}"),
                }
            }
            Some(command) = command_rx.recv() => {
                dispatch(&mut daemon, command).await;
            }
            _ = sigterm.recv() => {
                tracing::info!("daemon received SIGTERM");
                break;
            }
            _ = sigint.recv() => {
                tracing::info!("daemon received SIGINT");
                break;
            }
        }
    }

    daemon.shutdown_all().await;
    let _ = std::fs::remove_file(&sock_path);
    let _ = std::fs::remove_file(&pid_file);

    tracing::info!("daemon exited");
    Ok(())
}
