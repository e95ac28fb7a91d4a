use std::path::{Path, PathBuf};
use std::time::Duration;

use facet::Facet;

use crate::error::RoostError;

pub const DEFAULT_IMAGE_HOST: &str = "https://cloud-images.ubuntu.com/releases/";

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct DaemonConfig {
    #[facet(default)]
    pub image: ImageConfig,
    #[facet(default)]
    pub qemu: QemuConfig,
    #[facet(default)]
    pub timeouts: TimeoutsConfig,
    #[facet(default)]
    pub ssh: SshConfig,
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct ImageConfig {
    /// Base URL of the simplestreams mirror; must end with `/`.
    #[facet(default = "https://cloud-images.ubuntu.com/releases/")]
    pub host_url: String,
    #[facet(default = 300)]
    pub manifest_ttl_s: u64,
    #[facet(default = "amd64")]
    pub arch: String,
    /// Alias substituted when a create request names no image.
    #[facet(default = "default")]
    pub default_alias: String,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            host_url: DEFAULT_IMAGE_HOST.into(),
            manifest_ttl_s: 300,
            arch: "amd64".into(),
            default_alias: "default".into(),
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct QemuConfig {
    #[facet(default = "qemu-system-x86_64")]
    pub binary: String,
    #[facet(default = "kvm")]
    pub accel: String,
    #[facet(default = 49152)]
    pub first_port: u16,
    #[facet(default = 65535)]
    pub last_port: u16,
}

impl Default for QemuConfig {
    fn default() -> Self {
        Self {
            binary: "qemu-system-x86_64".into(),
            accel: "kvm".into(),
            first_port: 49152,
            last_port: 65535,
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct TimeoutsConfig {
    #[facet(default = 300)]
    pub create_ssh_s: u64,
    #[facet(default = 120)]
    pub start_ssh_s: u64,
    #[facet(default = 60)]
    pub shutdown_s: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            create_ssh_s: 300,
            start_ssh_s: 120,
            shutdown_s: 60,
        }
    }
}

impl TimeoutsConfig {
    pub fn create_ssh(&self) -> Duration {
        Duration::from_secs(self.create_ssh_s)
    }

    pub fn start_ssh(&self) -> Duration {
        Duration::from_secs(self.start_ssh_s)
    }

    pub fn shutdown(&self) -> Duration {
        Duration::from_secs(self.shutdown_s)
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct SshConfig {
    #[facet(default = "ubuntu")]
    pub user: String,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: "ubuntu".into(),
        }
    }
}

impl DaemonConfig {
    pub fn manifest_ttl(&self) -> Duration {
        Duration::from_secs(self.image.manifest_ttl_s)
    }
}

// ── validation ────────────────────────────────────────────

fn validate_config(config: &DaemonConfig) -> Result<(), RoostError> {
    if !config.image.host_url.ends_with('/') {
        return Err(RoostError::Validation {
            message: format!(
                "image.host_url must end with '/' (got '{}')",
                config.image.host_url
            ),
        });
    }
    if config.image.manifest_ttl_s == 0 {
        return Err(RoostError::Validation {
            message: "image.manifest_ttl_s must be at least 1".into(),
        });
    }
    if config.image.default_alias.is_empty() {
        return Err(RoostError::Validation {
            message: "image.default_alias cannot be empty".into(),
        });
    }
    if config.qemu.first_port == 0 || config.qemu.first_port > config.qemu.last_port {
        return Err(RoostError::Validation {
            message: format!(
                "qemu port range {}..={} is invalid",
                config.qemu.first_port, config.qemu.last_port
            ),
        });
    }
    if config.timeouts.create_ssh_s == 0 || config.timeouts.start_ssh_s == 0 {
        return Err(RoostError::Validation {
            message: "ssh timeouts must be at least 1 second".into(),
        });
    }
    Ok(())
}

/// Instance names follow `[a-zA-Z0-9][a-zA-Z0-9-]*` so they double as hostnames and directory names.
pub fn validate_instance_name(name: &str) -> Result<(), RoostError> {
    let mut chars = name.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '-');
    if !valid {
        return Err(RoostError::Validation {
            message: format!("instance name must match [a-zA-Z0-9][a-zA-Z0-9-]* (got '{name}')"),
        });
    }
    Ok(())
}

// ── public API ────────────────────────────────────────────

/// Load the daemon config; a missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<DaemonConfig, RoostError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no daemon config, using defaults");
            return Ok(DaemonConfig::default());
        }
        Err(source) => {
            return Err(RoostError::ConfigLoad {
                path: path.display().to_string(),
                source,
            });
        }
    };

    let config: DaemonConfig =
        facet_toml::from_str(&contents).map_err(|e| RoostError::ConfigParse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

    validate_config(&config)?;
    Ok(config)
}

/// Resolve `--config` against the default location.
pub fn config_path(explicit: Option<&Path>) -> PathBuf {
    explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(crate::paths::default_config_path)
}
