use std::path::Path;

use crate::error::RoostError;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

/// Parse a memory/disk size such as `"1G"`, `"512M"`, `"100K"` or a plain byte count.
///
/// Binary units; a trailing `B` is tolerated (`"2GB"`).
pub fn parse_size(s: &str) -> Result<u64, RoostError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(RoostError::Validation {
            message: "size cannot be empty".into(),
        });
    }

    let (digits, suffix) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(i) => (&s[..i], s[i..].to_ascii_uppercase()),
        None => (s, String::new()),
    };

    let value: u64 = digits.parse().map_err(|_| RoostError::Validation {
        message: format!("invalid size '{s}'"),
    })?;

    let multiplier = match suffix.trim_end_matches('B') {
        "" => 1,
        "K" => KIB,
        "M" => MIB,
        "G" => GIB,
        _ => {
            return Err(RoostError::Validation {
                message: format!("unknown size suffix in '{s}' (use K, M or G)"),
            });
        }
    };

    value.checked_mul(multiplier).ok_or_else(|| RoostError::Validation {
        message: format!("size overflows: '{s}'"),
    })
}

/// Validate a memory size string and return it normalized (trimmed, upper-case suffix).
pub fn normalize_mem_size(s: &str) -> Result<String, RoostError> {
    let bytes = parse_size(s)?;
    if bytes == 0 {
        return Err(RoostError::Validation {
            message: "memory size must be greater than zero".into(),
        });
    }
    Ok(s.trim().to_ascii_uppercase())
}

pub fn format_size(bytes: u64) -> String {
    if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// Quote each argument for a POSIX shell and join them with spaces.
pub fn shell_join(args: &[String]) -> String {
    args.iter()
        .map(|a| format!("'{}'", a.replace('\'', r"'\''")))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Replace `path` wholesale: write a sibling temp file, then rename over.
pub fn write_atomic(path: &Path, contents: &str) -> Result<(), RoostError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| RoostError::io(format!("creating {}", parent.display()), e))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = std::path::PathBuf::from(tmp);
    std::fs::write(&tmp, contents)
        .map_err(|e| RoostError::io(format!("writing {}", tmp.display()), e))?;
    std::fs::rename(&tmp, path).map_err(|e| {
        RoostError::io(
            format!("renaming {} to {}", tmp.display(), path.display()),
            e,
        )
    })
}
