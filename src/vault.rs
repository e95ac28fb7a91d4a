use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use facet::Facet;

use crate::error::RoostError;
use crate::fetcher::{ProgressFn, UrlDownloader};
use crate::image_host::{Query, VmImageHost, VmImageInfo};
use crate::util::write_atomic;

const PREPARED_INDEX: &str = "prepared-images.json";
const INSTANCE_INDEX: &str = "instance-images.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchType {
    ImageOnly,
    ImageKernelAndInitrd,
}

/// Local image files plus the content id they were fetched under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmImage {
    pub image_path: PathBuf,
    pub kernel_path: Option<PathBuf>,
    pub initrd_path: Option<PathBuf>,
    pub id: String,
}

/// Backend hook run once on every freshly downloaded image.
#[async_trait]
pub trait PrepareAction: Send + Sync {
    async fn prepare(&self, image: VmImage) -> Result<VmImage, RoostError>;
}

#[async_trait]
impl<F> PrepareAction for F
where
    F: Fn(VmImage) -> Result<VmImage, RoostError> + Send + Sync,
{
    async fn prepare(&self, image: VmImage) -> Result<VmImage, RoostError> {
        self(image)
    }
}

#[async_trait]
pub trait VmImageVault: Send {
    async fn fetch_image(
        &mut self,
        fetch_type: FetchType,
        query: &Query,
        prepare: &dyn PrepareAction,
        monitor: ProgressFn<'_>,
    ) -> Result<VmImage, RoostError>;

    /// Drop the instance's image copy. Unknown names are a no-op.
    async fn remove(&mut self, name: &str) -> Result<(), RoostError>;

    fn has_record_for(&self, name: &str) -> bool;

    /// The instance's recorded image, without consulting the image host.
    fn instance_image(&self, name: &str) -> Option<VmImage>;

    /// Every instance name the vault holds an image for.
    fn instance_names(&self) -> Vec<String>;

    fn image_info_for(&self, name: &str) -> Option<VmImageInfo>;
}

// ── persisted records ────────────────────────────────────

#[derive(Debug, Clone, Facet)]
struct ImageRecord {
    image_path: String,
    #[facet(default)]
    kernel_path: Option<String>,
    #[facet(default)]
    initrd_path: Option<String>,
    info: VmImageInfo,
}

impl ImageRecord {
    fn new(image: &VmImage, info: &VmImageInfo) -> Self {
        let s = |p: &Path| p.display().to_string();
        Self {
            image_path: s(&image.image_path),
            kernel_path: image.kernel_path.as_deref().map(s),
            initrd_path: image.initrd_path.as_deref().map(s),
            info: info.clone(),
        }
    }

    fn image(&self) -> VmImage {
        VmImage {
            image_path: PathBuf::from(&self.image_path),
            kernel_path: self.kernel_path.as_ref().map(PathBuf::from),
            initrd_path: self.initrd_path.as_ref().map(PathBuf::from),
            id: self.info.id.clone(),
        }
    }

    fn files_present(&self) -> bool {
        [
            Some(&self.image_path),
            self.kernel_path.as_ref(),
            self.initrd_path.as_ref(),
        ]
        .into_iter()
        .flatten()
        .all(|p| Path::new(p).exists())
    }
}

fn load_records(path: &Path) -> BTreeMap<String, ImageRecord> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return BTreeMap::new(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "cannot read vault index");
            return BTreeMap::new();
        }
    };
    let records: BTreeMap<String, ImageRecord> = match facet_json::from_str(&contents) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring corrupt vault index");
            return BTreeMap::new();
        }
    };

    records
        .into_iter()
        .filter(|(key, record)| {
            let present = record.files_present();
            if !present {
                tracing::info!(key = %key, "image files vanished, dropping vault record");
            }
            present
        })
        .collect()
}

fn save_records(path: &Path, records: &BTreeMap<String, ImageRecord>) -> Result<(), RoostError> {
    let json = facet_json::to_string(records).map_err(|e| RoostError::Persist {
        what: path.display().to_string(),
        message: e.to_string(),
    })?;
    write_atomic(path, &json)
}

fn file_name_of(location: &str) -> &str {
    location
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("image.img")
}

/// Content ids become directory names.
fn dir_key(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

// ── DefaultVmImageVault ──────────────────────────────────

/// Content-addressed image cache.
///
/// Layout under the vault root:
/// - `images/<id>/`: downloaded and prepared files, shared by every instance
/// - `instances/<name>/`: the per-instance writable copy
/// - `prepared-images.json`, `instance-images.json`: the two indexes
pub struct DefaultVmImageVault {
    host: Arc<dyn VmImageHost>,
    downloader: Arc<dyn UrlDownloader>,
    root: PathBuf,
    prepared: BTreeMap<String, ImageRecord>,
    instances: BTreeMap<String, ImageRecord>,
}

impl DefaultVmImageVault {
    pub fn open(
        host: Arc<dyn VmImageHost>,
        downloader: Arc<dyn UrlDownloader>,
        root: &Path,
    ) -> Result<Self, RoostError> {
        std::fs::create_dir_all(root)
            .map_err(|e| RoostError::io(format!("creating vault {}", root.display()), e))?;
        let prepared = load_records(&root.join(PREPARED_INDEX));
        let instances = load_records(&root.join(INSTANCE_INDEX));
        tracing::debug!(
            root = %root.display(),
            prepared = prepared.len(),
            instances = instances.len(),
            "vault opened"
        );
        Ok(Self {
            host,
            downloader,
            root: root.to_path_buf(),
            prepared,
            instances,
        })
    }

    async fn download_image(
        &self,
        fetch_type: FetchType,
        info: &VmImageInfo,
        monitor: ProgressFn<'_>,
    ) -> Result<VmImage, RoostError> {
        let dir = self.root.join("images").join(dir_key(&info.id));

        let image_path = dir.join(file_name_of(&info.image_location));
        self.downloader
            .download_to(&info.image_location, &image_path, monitor)
            .await?;

        let (kernel_path, initrd_path) = match fetch_type {
            FetchType::ImageOnly => (None, None),
            FetchType::ImageKernelAndInitrd => {
                let (Some(kernel), Some(initrd)) = (&info.kernel_location, &info.initrd_location)
                else {
                    return Err(RoostError::PreconditionFailed {
                        message: format!("image {} has no kernel and initrd", info.id),
                    });
                };
                let kernel_path = dir.join(file_name_of(kernel));
                self.downloader
                    .download_to(kernel, &kernel_path, monitor)
                    .await?;
                let initrd_path = dir.join(file_name_of(initrd));
                self.downloader
                    .download_to(initrd, &initrd_path, monitor)
                    .await?;
                (Some(kernel_path), Some(initrd_path))
            }
        };

        Ok(VmImage {
            image_path,
            kernel_path,
            initrd_path,
            id: info.id.clone(),
        })
    }

    async fn materialize(&self, name: &str, prepared: &VmImage) -> Result<VmImage, RoostError> {
        let dir = self.root.join("instances").join(name);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| RoostError::io(format!("creating {}", dir.display()), e))?;

        let copy = |src: PathBuf| {
            let dest = dir.join(src.file_name().unwrap_or(src.as_os_str()));
            async move {
                tokio::fs::copy(&src, &dest).await.map_err(|e| {
                    RoostError::io(
                        format!("copying {} to {}", src.display(), dest.display()),
                        e,
                    )
                })?;
                Ok::<_, RoostError>(dest)
            }
        };

        let image_path = copy(prepared.image_path.clone()).await?;
        let kernel_path = match &prepared.kernel_path {
            Some(p) => Some(copy(p.clone()).await?),
            None => None,
        };
        let initrd_path = match &prepared.initrd_path {
            Some(p) => Some(copy(p.clone()).await?),
            None => None,
        };

        Ok(VmImage {
            image_path,
            kernel_path,
            initrd_path,
            id: prepared.id.clone(),
        })
    }
}

#[async_trait]
impl VmImageVault for DefaultVmImageVault {
    async fn fetch_image(
        &mut self,
        fetch_type: FetchType,
        query: &Query,
        prepare: &dyn PrepareAction,
        monitor: ProgressFn<'_>,
    ) -> Result<VmImage, RoostError> {
        let info = self.host.info_for(query).await?;

        if let Some(record) = self.instances.get(&query.name) {
            if record.info.id == info.id && record.files_present() {
                return Ok(record.image());
            }
            tracing::info!(name = %query.name, old = %record.info.id, new = %info.id, "replacing instance image");
            self.remove(&query.name).await?;
        }

        let prepared = match self.prepared.get(&info.id).filter(|r| r.files_present()) {
            Some(record) => {
                tracing::debug!(id = %info.id, "image already prepared");
                record.image()
            }
            None => {
                tracing::info!(id = %info.id, release = %info.release, "fetching image");
                let downloaded = self.download_image(fetch_type, &info, monitor).await?;
                let prepared = prepare.prepare(downloaded).await?;
                self.prepared
                    .insert(info.id.clone(), ImageRecord::new(&prepared, &info));
                save_records(&self.root.join(PREPARED_INDEX), &self.prepared)?;
                prepared
            }
        };

        let image = self.materialize(&query.name, &prepared).await?;
        self.instances
            .insert(query.name.clone(), ImageRecord::new(&image, &info));
        save_records(&self.root.join(INSTANCE_INDEX), &self.instances)?;
        tracing::info!(name = %query.name, id = %image.id, "instance image ready");
        Ok(image)
    }

    async fn remove(&mut self, name: &str) -> Result<(), RoostError> {
        if !self.instances.contains_key(name) {
            return Ok(());
        }
        let dir = self.root.join("instances").join(name);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(RoostError::io(format!("removing {}", dir.display()), e)),
        }
        self.instances.remove(name);
        save_records(&self.root.join(INSTANCE_INDEX), &self.instances)?;
        tracing::info!(name, "instance image removed");
        Ok(())
    }

    fn has_record_for(&self, name: &str) -> bool {
        self.instances
            .get(name)
            .is_some_and(ImageRecord::files_present)
    }

    fn instance_image(&self, name: &str) -> Option<VmImage> {
        self.instances
            .get(name)
            .filter(|r| r.files_present())
            .map(ImageRecord::image)
    }

    fn instance_names(&self) -> Vec<String> {
        self.instances.keys().cloned().collect()
    }

    fn image_info_for(&self, name: &str) -> Option<VmImageInfo> {
        self.instances.get(name).map(|r| r.info.clone())
    }
}
