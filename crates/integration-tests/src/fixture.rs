//! Test fixtures for isolated container stores.

use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use ctrcp::DirectoryStore;

/// Id of the fixture container.
pub const CONTAINER_ID: &str = "c0ffee0123456789abcdef0123456789";

/// Name of the fixture container.
pub const CONTAINER_NAME: &str = "web";

/// Content of `/some/path/test` inside the container.
pub const CONTAINER_CONTENT: &str = "holla, i am the container";

/// Content of the same path in the fake host tree.
pub const HOST_CONTENT: &str = "hello, i am the host";

/// A container in an isolated store, plus a fake host tree.
///
/// Layout under the temporary directory:
/// - `store/containers/<id>/` - metadata, rootfs and identity files
/// - `volume/` - backing directory of the anonymous volume at `/foo`
/// - `bind/` - source of the bind mount at `/data`
/// - `bind-file` - source of the single-file bind mount at `/etc/app.conf`
/// - `host/` - stands in for the host's own filesystem; contains
///   `some/path/test` with [`HOST_CONTENT`]
///
/// The rootfs holds `/some/path/test` with [`CONTAINER_CONTENT`], absolute
/// symlinks pointing at it and into the bind mount, and a file with colons
/// in its name. Everything is removed on drop.
pub struct TestContainer {
    _temp_dir: TempDir,
    base: PathBuf,
    store: DirectoryStore,
}

impl TestContainer {
    /// Create the fixture.
    pub fn new() -> color_eyre::Result<Self> {
        let temp_dir = TempDir::new()?;
        let base = temp_dir.path().to_path_buf();

        let container_dir = base.join("store/containers").join(CONTAINER_ID);
        let rootfs = container_dir.join("rootfs");
        std::fs::create_dir_all(rootfs.join("some/path"))?;
        std::fs::create_dir_all(rootfs.join("etc"))?;
        std::fs::create_dir_all(rootfs.join("foo"))?;
        std::fs::create_dir_all(rootfs.join("data"))?;
        std::fs::write(rootfs.join("some/path/test"), CONTAINER_CONTENT)?;
        std::fs::write(rootfs.join("te:s:t"), "colons are fine")?;
        std::fs::write(rootfs.join("etc/app.conf"), "shadowed by the bind mount")?;
        symlink("/some/path/test", rootfs.join("container_path"))?;
        symlink("/some/path", rootfs.join("link_dir"))?;
        symlink("/data/nested", rootfs.join("to_bind"))?;

        std::fs::write(container_dir.join("hostname"), "c0ffee012345\n")?;
        std::fs::write(container_dir.join("hosts"), "127.0.0.1 localhost\n")?;
        std::fs::write(container_dir.join("resolv.conf"), "nameserver 10.0.2.3\n")?;

        let volume = base.join("volume");
        std::fs::create_dir_all(volume.join("sub"))?;
        std::fs::write(volume.join("bar"), "volume file")?;
        std::fs::write(volume.join("sub/baz"), "nested volume file")?;

        let bind = base.join("bind");
        std::fs::create_dir_all(bind.join("nested"))?;
        std::fs::write(bind.join("nested/file.txt"), "bind mounted content")?;

        let bind_file = base.join("bind-file");
        std::fs::write(&bind_file, "key = value\n")?;

        std::fs::create_dir_all(base.join("host/some/path"))?;
        std::fs::write(base.join("host/some/path/test"), HOST_CONTENT)?;

        let config = serde_json::json!({
            "id": CONTAINER_ID,
            "name": CONTAINER_NAME,
            "rootfs": "rootfs",
            "mounts": [
                { "destination": "/foo", "source": volume, "type": "volume" },
                { "destination": "/data", "source": bind, "type": "bind" },
                { "destination": "/etc/app.conf", "source": bind_file, "type": "bind" },
            ],
        });
        std::fs::write(container_dir.join("config.json"), config.to_string())?;

        let store = DirectoryStore::open(base.join("store"))?;

        Ok(Self {
            _temp_dir: temp_dir,
            base,
            store,
        })
    }

    /// The opened store.
    pub fn store(&self) -> &DirectoryStore {
        &self.store
    }

    /// Store root, as passed to `ctrcp --root`.
    pub fn store_root(&self) -> PathBuf {
        self.base.join("store")
    }

    /// Host directory of the container's root filesystem.
    pub fn rootfs(&self) -> PathBuf {
        self.store_root()
            .join("containers")
            .join(CONTAINER_ID)
            .join("rootfs")
    }

    /// Backing directory of the `/foo` volume.
    pub fn volume(&self) -> PathBuf {
        self.base.join("volume")
    }

    /// Source of the `/data` bind mount.
    pub fn bind(&self) -> PathBuf {
        self.base.join("bind")
    }

    /// The fake host tree.
    pub fn host(&self) -> PathBuf {
        self.base.join("host")
    }

    /// Create an empty scratch directory under the fixture.
    pub fn scratch(&self, name: &str) -> color_eyre::Result<PathBuf> {
        let path = self.base.join(name);
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }

    /// `CONTAINER:PATH` for the fixture container.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}:{}", CONTAINER_NAME, path)
    }
}

impl std::fmt::Debug for TestContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestContainer")
            .field("base", &self.base)
            .finish()
    }
}

/// Display form of a path, for endpoint arguments.
pub fn path_arg(path: &Path) -> String {
    path.display().to_string()
}
