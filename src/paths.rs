use std::path::PathBuf;

/// Daemon cache root: `~/.cache/roost/`
pub fn cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("roost")
}

/// Image vault directory: `~/.cache/roost/vault/`
pub fn vault_dir() -> PathBuf {
    cache_dir().join("vault")
}

/// Daemon state directory: `~/.local/share/roost/`
pub fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("roost")
}

/// Default daemon config file: `~/.config/roost/roostd.toml`
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("roost")
        .join("roostd.toml")
}

/// Persisted instance records.
pub fn instances_file() -> PathBuf {
    data_dir().join("instances.json")
}

/// Private half of the daemon's SSH identity; the public half sits next to it with `.pub`.
pub fn ssh_key_path() -> PathBuf {
    data_dir().join("id_ed25519")
}

/// Unix socket the daemon listens on.
pub fn socket_path() -> PathBuf {
    data_dir().join("roostd.sock")
}

pub fn pid_path() -> PathBuf {
    data_dir().join("roostd.pid")
}

pub fn logs_dir() -> PathBuf {
    data_dir().join("logs")
}
