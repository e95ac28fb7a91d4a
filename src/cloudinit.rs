use std::path::Path;

use facet_value::{VArray, Value, value};

use crate::error::RoostError;

/// The stanza every instance gets: grow the root partition to the disk.
pub fn base_config() -> Value {
    value!({
        "growpart": {
            "mode": "auto",
            "devices": ["/"],
            "ignore_growroot_disabled": false,
        },
    })
}

/// Base stanza plus the daemon's public key and the instance hostname.
pub fn make_cloud_init_config(ssh_public_key: &str, hostname: &str) -> Value {
    let mut config = base_config();
    if let Some(obj) = config.as_object_mut() {
        obj.insert(
            "ssh_authorized_keys",
            Value::from(VArray::from_iter([Value::from(ssh_public_key)])),
        );
        obj.insert("hostname", Value::from(hostname));
    }
    config
}

/// Render a config as NoCloud `user-data`.
pub fn to_user_data(config: &Value) -> Result<String, RoostError> {
    let yaml = facet_yaml::to_string(config).map_err(|e| RoostError::Persist {
        what: "cloud-init user-data".into(),
        message: e.to_string(),
    })?;
    // cloud-init wants `#cloud-config` on the very first line
    let yaml = yaml.strip_prefix("---\n").unwrap_or(&yaml);
    Ok(format!("#cloud-config\n{yaml}"))
}

pub fn meta_data(hostname: &str) -> String {
    format!("instance-id: {hostname}\nlocal-hostname: {hostname}\n")
}

/// Write a `CIDATA` seed ISO at `iso_path`, preferring `cloud-localds` and
/// falling back to `genisoimage`.
pub async fn write_seed_iso(iso_path: &Path, config: &Value, hostname: &str) -> Result<(), RoostError> {
    let dir = iso_path.parent().unwrap_or(Path::new("."));
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| RoostError::io(format!("creating directory {}", dir.display()), e))?;

    let user_data_path = dir.join("user-data");
    let meta_data_path = dir.join("meta-data");
    tokio::fs::write(&user_data_path, to_user_data(config)?)
        .await
        .map_err(|e| RoostError::io(format!("writing {}", user_data_path.display()), e))?;
    tokio::fs::write(&meta_data_path, meta_data(hostname))
        .await
        .map_err(|e| RoostError::io(format!("writing {}", meta_data_path.display()), e))?;

    let localds = tokio::process::Command::new("cloud-localds")
        .arg(iso_path)
        .arg(&user_data_path)
        .arg(&meta_data_path)
        .output()
        .await;

    let (command, output) = match localds {
        Ok(out) => ("cloud-localds", out),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("cloud-localds not found, trying genisoimage");
            let out = tokio::process::Command::new("genisoimage")
                .arg("-output")
                .arg(iso_path)
                .args(["-volid", "cidata", "-joliet", "-rock"])
                .arg(&user_data_path)
                .arg(&meta_data_path)
                .output()
                .await
                .map_err(|e| RoostError::ExternalCommand {
                    command: "genisoimage".into(),
                    message: e.to_string(),
                })?;
            ("genisoimage", out)
        }
        Err(e) => return Err(RoostError::io("running cloud-localds", e)),
    };

    if !output.status.success() {
        return Err(RoostError::ExternalCommand {
            command: command.into(),
            message: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    tracing::info!(path = %iso_path.display(), "generated cloud-init seed ISO");
    Ok(())
}
