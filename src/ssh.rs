use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::keys::{self, PrivateKeyWithHashAlg};
use russh::ChannelMsg;

use crate::backend::{ExecOutput, VmExecute};
use crate::error::RoostError;
use crate::util::shell_join;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// ── daemon identity ──────────────────────────────────────

fn key_err(e: ssh_key::Error) -> RoostError {
    RoostError::Persist {
        what: "daemon SSH key".into(),
        message: e.to_string(),
    }
}

/// The daemon's Ed25519 identity, stored in OpenSSH format.
#[derive(Clone)]
pub struct SshKey {
    private_openssh: String,
    public_openssh: String,
}

impl SshKey {
    /// Load the key at `path`, generating and saving a fresh one (plus
    /// `<path>.pub`) the first time. A missing `.pub` is rebuilt from the
    /// private key.
    pub fn load_or_generate(path: &Path) -> Result<Self, RoostError> {
        let pub_path = path.with_extension("pub");
        let key = if path.exists() {
            let private_openssh = std::fs::read_to_string(path)
                .map_err(|e| RoostError::io(format!("reading {}", path.display()), e))?;
            let key = Self::from_private(private_openssh)?;
            if pub_path.exists() {
                return Ok(key);
            }
            tracing::info!(path = %pub_path.display(), "restoring missing public key");
            key
        } else {
            let key = Self::generate()?;
            key.write_private(path)?;
            tracing::info!(path = %path.display(), "generated daemon SSH key");
            key
        };

        std::fs::write(&pub_path, format!("{}\n", key.public_openssh))
            .map_err(|e| RoostError::io(format!("writing {}", pub_path.display()), e))?;
        Ok(key)
    }

    fn write_private(&self, path: &Path) -> Result<(), RoostError> {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| RoostError::io(format!("creating {}", parent.display()), e))?;
        }
        std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(self.private_openssh.as_bytes()))
            .map_err(|e| RoostError::io(format!("writing {}", path.display()), e))
    }

    fn generate() -> Result<Self, RoostError> {
        use ssh_key::{Algorithm, LineEnding, PrivateKey};

        let private = PrivateKey::random(&mut rand_core::OsRng, Algorithm::Ed25519)
            .map_err(key_err)?;
        let private_openssh = private.to_openssh(LineEnding::LF).map_err(key_err)?;
        Self::from_private(private_openssh.to_string())
    }

    fn from_private(private_openssh: String) -> Result<Self, RoostError> {
        let private = ssh_key::PrivateKey::from_openssh(&private_openssh).map_err(key_err)?;
        let public = private.public_key().to_openssh().map_err(key_err)?;
        Ok(Self {
            private_openssh,
            public_openssh: format!("{public} roost@localhost"),
        })
    }

    /// `ssh-ed25519 AAAA… roost@localhost`
    pub fn public_key(&self) -> &str {
        &self.public_openssh
    }

    fn decode(&self) -> Result<keys::PrivateKey, RoostError> {
        keys::decode_secret_key(&self.private_openssh, None)
            .map_err(|e| RoostError::network(format!("failed to decode SSH key: {e}")))
    }
}

// ── russh client ─────────────────────────────────────────

/// Accepts any host key; guests are freshly booted and only reachable
/// through the local forward.
struct SshHandler;

impl client::Handler for SshHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

async fn connect(port: u16) -> Result<client::Handle<SshHandler>, RoostError> {
    let config = Arc::new(client::Config::default());
    let addr = format!("127.0.0.1:{port}");
    match tokio::time::timeout(CONNECT_TIMEOUT, client::connect(config, &*addr, SshHandler)).await
    {
        Ok(Ok(handle)) => Ok(handle),
        Ok(Err(e)) => Err(RoostError::network(format!("ssh connect to {addr} failed: {e}"))),
        Err(_) => Err(RoostError::Timeout {
            message: format!("ssh connect to {addr} timed out"),
        }),
    }
}

/// One SSH handshake against the forwarded port.
pub async fn handshake(port: u16) -> Result<(), RoostError> {
    let handle = connect(port).await?;
    let _ = handle
        .disconnect(russh::Disconnect::ByApplication, "", "en")
        .await;
    Ok(())
}

/// Runs commands as the configured guest user, authenticated with the
/// daemon key.
pub struct SshExecutor {
    key: SshKey,
    user: String,
}

impl SshExecutor {
    pub fn new(key: SshKey, user: impl Into<String>) -> Self {
        Self {
            key,
            user: user.into(),
        }
    }
}

#[async_trait]
impl VmExecute for SshExecutor {
    async fn execute(&self, port: u16, args: &[String]) -> Result<ExecOutput, RoostError> {
        let mut handle = connect(port).await?;

        let key = PrivateKeyWithHashAlg::new(Arc::new(self.key.decode()?), None);
        let auth = handle
            .authenticate_publickey(&self.user, key)
            .await
            .map_err(|e| RoostError::network(format!("ssh authentication failed: {e}")))?;
        if !auth.success() {
            return Err(RoostError::network(format!(
                "ssh authentication rejected for user {}",
                self.user
            )));
        }

        let command = shell_join(args);
        tracing::debug!(port, command = %command, "ssh exec");

        let ssh_err = |e: russh::Error| RoostError::network(format!("ssh exec failed: {e}"));
        let mut channel = handle.channel_open_session().await.map_err(ssh_err)?;
        channel.exec(true, command.as_str()).await.map_err(ssh_err)?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = -1;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext: 1 } => stderr.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status } => exit_code = exit_status as i32,
                _ => {}
            }
        }

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await;

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
        })
    }
}
