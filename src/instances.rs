use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use facet::Facet;

use crate::backend::VirtualMachine;
use crate::error::RoostError;
use crate::util::write_atomic;

/// Resources an instance was created with. Fixed for its lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct VmSpecs {
    pub num_cores: u32,
    pub mem_size: String,
    /// Bytes; zero means "whatever the image ships with".
    pub disk_space: u64,
}

impl Default for VmSpecs {
    fn default() -> Self {
        Self {
            num_cores: 1,
            mem_size: "1G".into(),
            disk_space: 0,
        }
    }
}

/// On-disk shape of one instance.
#[derive(Debug, Clone, Facet)]
struct InstanceRecord {
    num_cores: u32,
    mem_size: String,
    disk_space: u64,
    #[facet(default)]
    deleted: bool,
}

/// A record read back at startup, before its VM is rebuilt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedInstance {
    pub specs: VmSpecs,
    pub trashed: bool,
}

pub struct Instance {
    pub vm: Box<dyn VirtualMachine>,
    pub specs: VmSpecs,
}

/// Read the instance record file. A missing file is an empty registry.
pub fn load_records(path: &Path) -> Result<BTreeMap<String, PersistedInstance>, RoostError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(RoostError::io(format!("reading {}", path.display()), e)),
    };
    let records: BTreeMap<String, InstanceRecord> =
        facet_json::from_str(&contents).map_err(|e| RoostError::Persist {
            what: path.display().to_string(),
            message: format!("corrupt instance records: {e}"),
        })?;

    Ok(records
        .into_iter()
        .map(|(name, r)| {
            (
                name,
                PersistedInstance {
                    specs: VmSpecs {
                        num_cores: r.num_cores,
                        mem_size: r.mem_size,
                        disk_space: r.disk_space,
                    },
                    trashed: r.deleted,
                },
            )
        })
        .collect())
}

/// Owns every instance's VM handle, split into active and trashed.
/// Records that could not be rebuilt at startup are held as-is: they keep
/// their name and are written back unchanged. A name lives in at most one
/// of the three sets.
pub struct InstanceRegistry {
    path: PathBuf,
    active: BTreeMap<String, Instance>,
    trashed: BTreeMap<String, Instance>,
    held: BTreeMap<String, PersistedInstance>,
}

impl InstanceRegistry {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            active: BTreeMap::new(),
            trashed: BTreeMap::new(),
            held: BTreeMap::new(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.active.contains_key(name)
            || self.trashed.contains_key(name)
            || self.held.contains_key(name)
    }

    /// Register a new active instance and persist. Nothing stays registered
    /// if the record file cannot be written.
    pub fn create(
        &mut self,
        name: &str,
        specs: VmSpecs,
        vm: Box<dyn VirtualMachine>,
    ) -> Result<(), RoostError> {
        if self.contains(name) {
            return Err(RoostError::AlreadyExists { name: name.into() });
        }
        self.active.insert(name.into(), Instance { vm, specs });
        if let Err(e) = self.persist() {
            self.active.remove(name);
            return Err(e);
        }
        Ok(())
    }

    /// Put back an instance read from disk. Does not persist.
    pub fn restore(&mut self, name: &str, specs: VmSpecs, vm: Box<dyn VirtualMachine>, trashed: bool) {
        let set = if trashed {
            &mut self.trashed
        } else {
            &mut self.active
        };
        set.insert(name.into(), Instance { vm, specs });
    }

    /// Keep a record whose VM could not be rebuilt. Does not persist.
    pub fn hold(&mut self, name: &str, record: PersistedInstance) {
        self.held.insert(name.into(), record);
    }

    pub fn find_active(&mut self, name: &str) -> Option<&mut Instance> {
        self.active.get_mut(name)
    }

    pub fn find_trashed(&mut self, name: &str) -> Option<&mut Instance> {
        self.trashed.get_mut(name)
    }

    pub fn move_to_trash(&mut self, name: &str) -> Result<(), RoostError> {
        let instance = self
            .active
            .remove(name)
            .ok_or_else(|| RoostError::NotFound { name: name.into() })?;
        self.trashed.insert(name.into(), instance);
        if let Err(e) = self.persist() {
            if let Some(instance) = self.trashed.remove(name) {
                self.active.insert(name.into(), instance);
            }
            return Err(e);
        }
        Ok(())
    }

    pub fn recover(&mut self, name: &str) -> Result<(), RoostError> {
        let instance = self
            .trashed
            .remove(name)
            .ok_or_else(|| RoostError::NotFound { name: name.into() })?;
        self.active.insert(name.into(), instance);
        if let Err(e) = self.persist() {
            if let Some(instance) = self.active.remove(name) {
                self.trashed.insert(name.into(), instance);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Drop a trashed instance for good and persist. Hands back the VM so
    /// the caller can release its resources. The instance stays trashed if
    /// the record file cannot be written.
    pub fn purge_trashed(&mut self, name: &str) -> Result<Instance, RoostError> {
        let instance = self
            .trashed
            .remove(name)
            .ok_or_else(|| RoostError::NotFound { name: name.into() })?;
        if let Err(e) = self.persist() {
            self.trashed.insert(name.into(), instance);
            return Err(e);
        }
        Ok(instance)
    }

    pub fn trashed_names(&self) -> Vec<String> {
        self.trashed.keys().cloned().collect()
    }

    pub fn active(&self) -> impl Iterator<Item = (&String, &Instance)> {
        self.active.iter()
    }

    pub fn trashed(&self) -> impl Iterator<Item = (&String, &Instance)> {
        self.trashed.iter()
    }

    pub fn held(&self) -> impl Iterator<Item = (&String, &PersistedInstance)> {
        self.held.iter()
    }

    pub fn active_mut(&mut self) -> impl Iterator<Item = (&String, &mut Instance)> {
        self.active.iter_mut()
    }

    /// Rewrite the whole record file.
    pub fn persist(&self) -> Result<(), RoostError> {
        let record = |specs: &VmSpecs, deleted| InstanceRecord {
            num_cores: specs.num_cores,
            mem_size: specs.mem_size.clone(),
            disk_space: specs.disk_space,
            deleted,
        };
        let records: BTreeMap<String, InstanceRecord> = self
            .active
            .iter()
            .map(|(n, i)| (n.clone(), record(&i.specs, false)))
            .chain(self.trashed.iter().map(|(n, i)| (n.clone(), record(&i.specs, true))))
            .chain(self.held.iter().map(|(n, r)| (n.clone(), record(&r.specs, r.trashed))))
            .collect();

        let json = facet_json::to_string(&records).map_err(|e| RoostError::Persist {
            what: self.path.display().to_string(),
            message: e.to_string(),
        })?;
        write_atomic(&self.path, &json)?;
        tracing::debug!(path = %self.path.display(), instances = records.len(), "instance records written");
        Ok(())
    }
}
