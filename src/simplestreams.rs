//! Parsing of simplestreams `index.json` and `image-downloads` manifests.

use std::collections::HashMap;

use facet::Facet;

use crate::error::RoostError;
use crate::image_host::VmImageInfo;

pub const INDEX_PATH: &str = "streams/v1/index.json";

const DISK_ITEM: &str = "disk1.img";
const KERNEL_ITEMS: &[&str] = &["boot-kernel", "vmlinuz"];
const INITRD_ITEMS: &[&str] = &["boot-initrd", "initrd"];

// ── wire shapes ──────────────────────────────────────────

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct RawIndex {
    #[facet(default)]
    index: HashMap<String, RawIndexEntry>,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct RawIndexEntry {
    #[facet(default)]
    datatype: String,
    #[facet(default)]
    path: String,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct RawManifest {
    #[facet(default)]
    updated: String,
    #[facet(default)]
    products: HashMap<String, RawProduct>,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct RawProduct {
    #[facet(default)]
    aliases: String,
    #[facet(default)]
    arch: String,
    #[facet(default)]
    release: String,
    #[facet(default)]
    release_title: Option<String>,
    #[facet(default)]
    versions: HashMap<String, RawVersion>,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct RawVersion {
    #[facet(default)]
    items: HashMap<String, RawItem>,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct RawItem {
    #[facet(default)]
    path: String,
    #[facet(default)]
    sha256: String,
}

fn utf8<'a>(bytes: &'a [u8], what: &str) -> Result<&'a str, RoostError> {
    std::str::from_utf8(bytes)
        .map_err(|e| RoostError::network(format!("{what} is not valid UTF-8: {e}")))
}

// ── index ────────────────────────────────────────────────

/// Path (relative to the host URL) of the `image-downloads` manifest.
pub fn manifest_path(index_json: &[u8]) -> Result<String, RoostError> {
    let index: RawIndex = facet_json::from_str(utf8(index_json, "simplestreams index")?)
        .map_err(|e| RoostError::network(format!("invalid simplestreams index: {e}")))?;
    index
        .index
        .into_values()
        .find(|e| e.datatype == "image-downloads" && !e.path.is_empty())
        .map(|e| e.path)
        .ok_or_else(|| RoostError::network("simplestreams index has no image-downloads entry"))
}

// ── manifest ─────────────────────────────────────────────

/// Flattened manifest: one entry per product, newest version only.
/// Locations are still relative to the host URL.
#[derive(Debug, Clone)]
pub struct Manifest {
    pub updated: String,
    pub products: Vec<VmImageInfo>,
    by_alias: HashMap<String, usize>,
    by_id: HashMap<String, usize>,
}

impl Manifest {
    pub fn from_json(json: &[u8], arch: &str) -> Result<Self, RoostError> {
        let raw: RawManifest = facet_json::from_str(utf8(json, "simplestreams manifest")?)
            .map_err(|e| RoostError::network(format!("invalid manifest: {e}")))?;

        let mut keys: Vec<_> = raw.products.keys().cloned().collect();
        keys.sort();

        let mut products = Vec::new();
        for key in keys {
            let Some(product) = raw.products.get(&key) else {
                continue;
            };
            if product.arch != arch {
                continue;
            }
            let Some((version, latest)) = product.versions.iter().max_by(|a, b| a.0.cmp(b.0))
            else {
                continue;
            };
            let Some(disk) = latest.items.get(DISK_ITEM) else {
                tracing::debug!(product = %key, version = %version, "no disk image, skipping");
                continue;
            };
            let pick = |names: &[&str]| {
                names
                    .iter()
                    .find_map(|n| latest.items.get(*n))
                    .map(|i| i.path.clone())
            };

            products.push(VmImageInfo {
                aliases: product
                    .aliases
                    .split(',')
                    .map(str::trim)
                    .filter(|a| !a.is_empty())
                    .map(String::from)
                    .collect(),
                release: product.release.clone(),
                release_title: product.release_title.clone(),
                image_location: disk.path.clone(),
                kernel_location: pick(KERNEL_ITEMS),
                initrd_location: pick(INITRD_ITEMS),
                id: disk.sha256.clone(),
                version: version.clone(),
            });
        }

        if products.is_empty() {
            return Err(RoostError::network(format!(
                "invalid manifest: no {arch} images found"
            )));
        }

        let mut by_alias = HashMap::new();
        let mut by_id = HashMap::new();
        for (i, info) in products.iter().enumerate() {
            for alias in &info.aliases {
                by_alias.entry(alias.clone()).or_insert(i);
            }
            by_id.entry(info.id.clone()).or_insert(i);
        }

        Ok(Self {
            updated: raw.updated,
            products,
            by_alias,
            by_id,
        })
    }

    /// Exact alias match first, then content id.
    pub fn find(&self, key: &str) -> Option<&VmImageInfo> {
        self.by_alias
            .get(key)
            .or_else(|| self.by_id.get(key))
            .map(|&i| &self.products[i])
    }
}
