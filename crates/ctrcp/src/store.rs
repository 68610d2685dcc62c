//! Container metadata lookup.
//!
//! The copy engine needs exactly two facts about a container: where its root
//! filesystem lives on the host, and which mounts are layered over it. The
//! [`ContainerStore`] trait is that seam; [`DirectoryStore`] is the shipped
//! implementation, reading metadata from a state directory.
//!
//! # Store Structure
//!
//! ```text
//! /var/lib/ctrcp/
//! └── containers/
//!     └── <container-id>/
//!         ├── config.json    # ContainerMetadata
//!         ├── rootfs/        # conventional location of the root filesystem
//!         ├── hostname       # identity files substituted into /etc
//!         ├── hosts
//!         └── resolv.conf
//! ```
//!
//! A minimal `config.json`:
//!
//! ```json
//! {
//!   "id": "4f2a9c...",
//!   "name": "web",
//!   "rootfs": "rootfs",
//!   "mounts": [
//!     { "destination": "/data", "source": "/srv/data", "type": "bind" },
//!     { "destination": "/cache", "source": "/var/lib/ctrcp/volumes/ab12/_data", "type": "volume" }
//!   ]
//! }
//! ```
//!
//! # Security Model
//!
//! The store root is held as a [`cap_std::fs::Dir`] and every metadata read is
//! relative to it, so a container reference can never make the store read a
//! file outside its own tree.

use std::path::{Path, PathBuf};

use cap_std::ambient_authority;
use cap_std::fs::Dir;
use serde::{Deserialize, Serialize};

use crate::error::{CopyError, Result};
use crate::mounts::MountTable;
use crate::paths::ContainerRoot;

/// Directory under the store root holding one directory per container.
const CONTAINERS_DIR: &str = "containers";

/// Metadata file inside each container directory.
const CONFIG_FILE: &str = "config.json";

/// Shortest id prefix accepted for prefix matching.
const MIN_PREFIX_LEN: usize = 3;

/// How a declared mount is backed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeclaredMountKind {
    /// Host path bound into the container.
    #[default]
    Bind,
    /// Named or anonymous volume.
    Volume,
}

/// A mount as declared in container metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredMount {
    /// Path inside the container.
    pub destination: String,
    /// Absolute host path.
    pub source: PathBuf,
    /// Bind or volume.
    #[serde(rename = "type", default)]
    pub kind: DeclaredMountKind,
    /// Whether the mount is read-only inside the container.
    #[serde(default)]
    pub read_only: bool,
}

/// What the store knows about one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerMetadata {
    /// Full container id.
    #[serde(default)]
    pub id: String,
    /// Optional human-readable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Host directory holding the root filesystem.
    pub rootfs: PathBuf,
    /// Bind mounts and volumes.
    #[serde(default)]
    pub mounts: Vec<DeclaredMount>,
    /// Host file substituted for `/etc/hostname`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname_path: Option<PathBuf>,
    /// Host file substituted for `/etc/hosts`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hosts_path: Option<PathBuf>,
    /// Host file substituted for `/etc/resolv.conf`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolv_conf_path: Option<PathBuf>,
}

impl ContainerMetadata {
    /// The container's root directory.
    pub fn root(&self) -> Result<ContainerRoot> {
        ContainerRoot::new(&self.rootfs)
    }

    /// The container's mount table.
    pub fn mount_table(&self) -> Result<MountTable> {
        MountTable::build(self)
    }
}

/// Source of container metadata.
///
/// Implementations must be read-only: looking up a container never changes it.
pub trait ContainerStore: Send + Sync {
    /// Find a container by id, unique id prefix, or name.
    fn lookup(&self, reference: &str) -> Result<ContainerMetadata>;

    /// All containers known to the store.
    fn list(&self) -> Result<Vec<ContainerMetadata>>;
}

/// A [`ContainerStore`] backed by a state directory.
#[derive(Debug)]
pub struct DirectoryStore {
    /// Directory handle for the store root.
    root_dir: Dir,
    /// Host path of the store root, used to absolutize relative rootfs paths.
    root_path: PathBuf,
}

impl DirectoryStore {
    /// Open the store rooted at `root`.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root_path = root.as_ref();
        let root_path = if root_path.is_absolute() {
            root_path.to_path_buf()
        } else {
            std::env::current_dir()?.join(root_path)
        };

        let root_dir = Dir::open_ambient_dir(&root_path, ambient_authority())
            .map_err(|e| CopyError::from_io(e, &root_path))?;

        Ok(Self {
            root_dir,
            root_path,
        })
    }

    /// Host path of the store root.
    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    /// Host path of a container's state directory.
    pub fn container_dir(&self, id: &str) -> PathBuf {
        self.root_path.join(CONTAINERS_DIR).join(id)
    }

    fn validate_reference(reference: &str) -> Result<()> {
        if reference.is_empty()
            || reference == "."
            || reference == ".."
            || reference.contains('/')
            || reference.contains('\0')
        {
            return Err(CopyError::NotFound(format!("container {:?}", reference)));
        }
        Ok(())
    }

    /// Container ids present in the store, sorted.
    fn container_ids(&self) -> Result<Vec<String>> {
        let containers = match self.root_dir.open_dir(CONTAINERS_DIR) {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CopyError::from_io(e, &self.root_path.join(CONTAINERS_DIR))),
        };

        let mut ids = Vec::new();
        for entry in containers.entries()? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                ids.push(name.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Load the metadata of the container with exactly this id.
    fn load(&self, id: &str) -> Result<ContainerMetadata> {
        let config_path = Path::new(CONTAINERS_DIR).join(id).join(CONFIG_FILE);
        let content = self.root_dir.read_to_string(&config_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CopyError::NotFound(format!("container {}", id))
            } else {
                CopyError::from_io(e, &self.root_path.join(&config_path))
            }
        })?;

        let mut metadata: ContainerMetadata = serde_json::from_str(&content)?;
        if metadata.id.is_empty() {
            metadata.id = id.to_string();
        }

        let container_dir = self.container_dir(id);
        if metadata.rootfs.is_relative() {
            metadata.rootfs = container_dir.join(&metadata.rootfs);
        }
        for mount in &metadata.mounts {
            if mount.source.is_relative() {
                return Err(CopyError::InvalidMetadata(format!(
                    "container {}: mount source must be absolute: {}",
                    id,
                    mount.source.display()
                )));
            }
        }

        let specials = [
            (&mut metadata.hostname_path, "hostname"),
            (&mut metadata.hosts_path, "hosts"),
            (&mut metadata.resolv_conf_path, "resolv.conf"),
        ];
        for (slot, file_name) in specials {
            if slot.is_none() {
                let relative = Path::new(CONTAINERS_DIR).join(id).join(file_name);
                if self.root_dir.exists(&relative) {
                    *slot = Some(container_dir.join(file_name));
                }
            }
        }

        tracing::debug!(
            "loaded container {} (rootfs {}, {} mounts)",
            metadata.id,
            metadata.rootfs.display(),
            metadata.mounts.len()
        );
        Ok(metadata)
    }
}

impl ContainerStore for DirectoryStore {
    fn lookup(&self, reference: &str) -> Result<ContainerMetadata> {
        Self::validate_reference(reference)?;

        // Exact id
        match self.load(reference) {
            Ok(metadata) => return Ok(metadata),
            Err(CopyError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let ids = self.container_ids()?;

        // Unique id prefix
        if reference.len() >= MIN_PREFIX_LEN {
            let matches: Vec<&String> = ids.iter().filter(|id| id.starts_with(reference)).collect();
            match matches.len() {
                1 => return self.load(matches[0]),
                n if n > 1 => {
                    return Err(CopyError::AmbiguousReference(format!(
                        "prefix '{}' matches {} containers",
                        reference, n
                    )));
                }
                _ => {}
            }
        }

        // Name
        for id in &ids {
            match self.load(id) {
                Ok(metadata) if metadata.name.as_deref() == Some(reference) => {
                    return Ok(metadata);
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("skipping container {}: {}", id, e),
            }
        }

        Err(CopyError::NotFound(format!("container {}", reference)))
    }

    fn list(&self) -> Result<Vec<ContainerMetadata>> {
        let mut containers = Vec::new();
        for id in self.container_ids()? {
            match self.load(&id) {
                Ok(metadata) => containers.push(metadata),
                Err(e) => tracing::warn!("skipping container {}: {}", id, e),
            }
        }
        Ok(containers)
    }
}
