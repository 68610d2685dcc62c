//! Container mount table.
//!
//! Maps container-side paths to the host storage that backs them: bind
//! mounts, volumes, and the per-container identity files (`/etc/hostname`,
//! `/etc/hosts`, `/etc/resolv.conf`) that live next to the container's
//! metadata rather than in its root filesystem.
//!
//! The table is built once per transfer from [`ContainerMetadata`] and is
//! immutable afterwards. Building it touches no files.

use std::path::PathBuf;

use serde::Serialize;

use crate::error::{CopyError, Result};
use crate::paths::{ContainerPath, ContainerRoot, HostPath};
use crate::store::{ContainerMetadata, DeclaredMountKind};

/// Container paths of the identity files substituted from host-side state.
pub const HOSTNAME_PATH: &str = "/etc/hostname";
/// See [`HOSTNAME_PATH`].
pub const HOSTS_PATH: &str = "/etc/hosts";
/// See [`HOSTNAME_PATH`].
pub const RESOLV_CONF_PATH: &str = "/etc/resolv.conf";

/// What backs a mount point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MountKind {
    /// A host file or directory bound into the container.
    Bind,
    /// Host-managed volume storage.
    Volume,
    /// A container identity file kept in the container's state directory.
    SpecialFile,
}

impl std::fmt::Display for MountKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            MountKind::Bind => "bind",
            MountKind::Volume => "volume",
            MountKind::SpecialFile => "special-file",
        })
    }
}

/// One entry of the mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    /// Where the mount appears inside the container.
    pub container_path: ContainerPath,
    /// The host storage backing it.
    pub host_path: HostPath,
    /// What kind of storage this is.
    pub kind: MountKind,
    /// Whether the container sees the mount read-only.
    pub read_only: bool,
}

/// A mount strictly below some copy root, addressed relative to that root.
///
/// Archive traversal reads through overlays and extraction writes through
/// them, so a copy that spans a mount point sees what the container sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Overlay {
    /// Mount point relative to the copy root.
    pub relative: PathBuf,
    /// The host storage backing it.
    pub host_path: HostPath,
    /// Whether the container sees the mount read-only.
    pub read_only: bool,
}

/// Longest-prefix lookup from container paths to mount points.
#[derive(Debug, Clone, Default)]
pub struct MountTable {
    /// Sorted deepest first so the first match is the longest prefix.
    mounts: Vec<MountPoint>,
}

impl MountTable {
    /// Build the table for one container.
    ///
    /// Special files are added first; a user-declared mount with the same
    /// destination replaces them.
    pub fn build(metadata: &ContainerMetadata) -> Result<Self> {
        let mut mounts: Vec<MountPoint> = Vec::new();

        let specials = [
            (HOSTNAME_PATH, metadata.hostname_path.as_ref()),
            (HOSTS_PATH, metadata.hosts_path.as_ref()),
            (RESOLV_CONF_PATH, metadata.resolv_conf_path.as_ref()),
        ];
        for (destination, source) in specials {
            if let Some(source) = source {
                mounts.push(Self::mount_point(
                    destination,
                    source,
                    MountKind::SpecialFile,
                    false,
                )?);
            }
        }

        for declared in &metadata.mounts {
            let kind = match declared.kind {
                DeclaredMountKind::Bind => MountKind::Bind,
                DeclaredMountKind::Volume => MountKind::Volume,
            };
            let mount = Self::mount_point(
                &declared.destination,
                &declared.source,
                kind,
                declared.read_only,
            )?;
            mounts.retain(|m| m.container_path != mount.container_path);
            mounts.push(mount);
        }

        mounts.sort_by(|a, b| {
            b.container_path
                .depth()
                .cmp(&a.container_path.depth())
                .then_with(|| a.container_path.cmp(&b.container_path))
        });

        Ok(Self { mounts })
    }

    fn mount_point(
        destination: &str,
        source: &std::path::Path,
        kind: MountKind,
        read_only: bool,
    ) -> Result<MountPoint> {
        let container_path = ContainerPath::parse(destination)?;
        if container_path.is_root() {
            return Err(CopyError::InvalidMetadata(format!(
                "mount destination cannot be the container root: {:?}",
                destination
            )));
        }
        if !source.is_absolute() {
            return Err(CopyError::InvalidMetadata(format!(
                "mount source for {} must be absolute: {}",
                container_path,
                source.display()
            )));
        }
        Ok(MountPoint {
            container_path,
            host_path: HostPath::new(source),
            kind,
            read_only,
        })
    }

    /// The mount whose destination is the longest prefix of `path`.
    pub fn lookup(&self, path: &ContainerPath) -> Option<&MountPoint> {
        self.mounts.iter().find(|m| path.starts_with(&m.container_path))
    }

    /// Map a container path to host storage: through the covering mount if
    /// there is one, otherwise under the container root.
    pub fn host_path_for(
        &self,
        root: &ContainerRoot,
        path: &ContainerPath,
    ) -> (HostPath, Option<&MountPoint>) {
        match self.lookup(path) {
            Some(mount) => {
                let suffix = path.strip_prefix(&mount.container_path).unwrap_or(&[]);
                (mount.host_path.join_components(suffix), Some(mount))
            }
            None => (root.join(path), None),
        }
    }

    /// Whether `path` is exactly a mount destination.
    pub fn is_mount_point(&self, path: &ContainerPath) -> bool {
        self.mounts.iter().any(|m| &m.container_path == path)
    }

    /// Mounts strictly below `root`, deepest first.
    pub fn overlays_below(&self, root: &ContainerPath) -> Vec<Overlay> {
        self.mounts
            .iter()
            .filter_map(|m| {
                let rest = m.container_path.strip_prefix(root)?;
                if rest.is_empty() {
                    return None;
                }
                Some(Overlay {
                    relative: rest.iter().collect(),
                    host_path: m.host_path.clone(),
                    read_only: m.read_only,
                })
            })
            .collect()
    }

    /// Entries, deepest destination first.
    pub fn iter(&self) -> impl Iterator<Item = &MountPoint> {
        self.mounts.iter()
    }

    /// Number of mount points.
    pub fn len(&self) -> usize {
        self.mounts.len()
    }

    /// Whether the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DeclaredMount;
    use std::path::Path;

    fn metadata(mounts: Vec<DeclaredMount>) -> ContainerMetadata {
        ContainerMetadata {
            id: "0123456789abcdef".into(),
            name: None,
            rootfs: PathBuf::from("/state/rootfs"),
            mounts,
            hostname_path: Some(PathBuf::from("/state/hostname")),
            hosts_path: Some(PathBuf::from("/state/hosts")),
            resolv_conf_path: None,
        }
    }

    fn declared(destination: &str, source: &str, kind: DeclaredMountKind) -> DeclaredMount {
        DeclaredMount {
            destination: destination.into(),
            source: PathBuf::from(source),
            kind,
            read_only: false,
        }
    }

    #[test]
    fn test_special_files_present() {
        let table = MountTable::build(&metadata(vec![])).unwrap();
        assert_eq!(table.len(), 2);

        let hosts = table
            .lookup(&ContainerPath::parse("/etc/hosts").unwrap())
            .unwrap();
        assert_eq!(hosts.kind, MountKind::SpecialFile);
        assert_eq!(hosts.host_path.as_path(), Path::new("/state/hosts"));

        // No resolv.conf path was given, so it stays in the rootfs.
        assert!(
            table
                .lookup(&ContainerPath::parse("/etc/resolv.conf").unwrap())
                .is_none()
        );
    }

    #[test]
    fn test_longest_prefix_wins() {
        let table = MountTable::build(&metadata(vec![
            declared("/data", "/host/data", DeclaredMountKind::Bind),
            declared("/data/cache", "/host/cache", DeclaredMountKind::Volume),
        ]))
        .unwrap();

        let root = ContainerRoot::new("/state/rootfs").unwrap();
        let path = ContainerPath::parse("/data/cache/x/y").unwrap();
        let (host, mount) = table.host_path_for(&root, &path);
        assert_eq!(host.as_path(), Path::new("/host/cache/x/y"));
        assert_eq!(mount.unwrap().kind, MountKind::Volume);

        let path = ContainerPath::parse("/data/other").unwrap();
        let (host, _) = table.host_path_for(&root, &path);
        assert_eq!(host.as_path(), Path::new("/host/data/other"));

        let path = ContainerPath::parse("/database").unwrap();
        let (host, mount) = table.host_path_for(&root, &path);
        assert!(mount.is_none());
        assert_eq!(host.as_path(), Path::new("/state/rootfs/database"));
    }

    #[test]
    fn test_user_mount_replaces_special_file() {
        let table = MountTable::build(&metadata(vec![declared(
            "/etc//hosts",
            "/custom/hosts",
            DeclaredMountKind::Bind,
        )]))
        .unwrap();

        let hosts = table
            .lookup(&ContainerPath::parse("/etc/hosts").unwrap())
            .unwrap();
        assert_eq!(hosts.kind, MountKind::Bind);
        assert_eq!(hosts.host_path.as_path(), Path::new("/custom/hosts"));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_overlays_below() {
        let table = MountTable::build(&metadata(vec![
            declared("/data", "/host/data", DeclaredMountKind::Bind),
            declared("/data/cache", "/host/cache", DeclaredMountKind::Volume),
            declared("/database", "/host/db", DeclaredMountKind::Volume),
        ]))
        .unwrap();

        let below = table.overlays_below(&ContainerPath::parse("/data").unwrap());
        assert_eq!(below.len(), 1);
        assert_eq!(below[0].relative, Path::new("cache"));
        assert_eq!(below[0].host_path.as_path(), Path::new("/host/cache"));

        // The mount at the root itself is not an overlay of it.
        let below = table.overlays_below(&ContainerPath::parse("/data/cache").unwrap());
        assert!(below.is_empty());

        let mut all: Vec<PathBuf> = table
            .overlays_below(&ContainerPath::root())
            .into_iter()
            .map(|o| o.relative)
            .collect();
        all.sort();
        assert_eq!(
            all,
            ["data", "data/cache", "database", "etc/hostname", "etc/hosts"]
                .map(PathBuf::from)
        );
    }

    #[test]
    fn test_rejects_root_destination_and_relative_source() {
        let err = MountTable::build(&metadata(vec![declared(
            "/../",
            "/host",
            DeclaredMountKind::Bind,
        )]))
        .unwrap_err();
        assert!(matches!(err, CopyError::InvalidMetadata(_)));

        let err = MountTable::build(&metadata(vec![declared(
            "/data",
            "host/data",
            DeclaredMountKind::Bind,
        )]))
        .unwrap_err();
        assert!(matches!(err, CopyError::InvalidMetadata(_)));
    }
}
