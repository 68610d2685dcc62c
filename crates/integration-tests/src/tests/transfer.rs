//! End-to-end copies through the library API.

use std::io::{self, Cursor};
use std::path::Path;

use ctrcp::{CopyError, Stage, Transfer, TransferError, TransferIo, TransferReport};

use crate::fixture::{CONTAINER_CONTENT, HOST_CONTENT, TestContainer, path_arg};
use crate::integration_test;

fn copy(
    container: &TestContainer,
    source: &str,
    destination: &str,
) -> Result<TransferReport, TransferError> {
    copy_with_stdin(container, source, destination, Vec::new())
}

fn copy_with_stdin(
    container: &TestContainer,
    source: &str,
    destination: &str,
    stdin: Vec<u8>,
) -> Result<TransferReport, TransferError> {
    Transfer::new(container.store()).run(
        source,
        destination,
        TransferIo::new(Box::new(Cursor::new(stdin)), Box::new(io::sink())),
    )
}

/// An archive holding one file under an arbitrary raw name.
fn raw_archive(name: &[u8], content: &[u8]) -> io::Result<Vec<u8>> {
    let mut header = tar::Header::new_old();
    header.as_old_mut().name[..name.len()].copy_from_slice(name);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_mode(0o644);
    header.set_size(content.len() as u64);
    header.set_cksum();
    let mut builder = tar::Builder::new(Vec::new());
    builder.append(&header, content)?;
    builder.into_inner()
}

/// Compare two trees by relative path and file content.
fn assert_same_tree(expected: &Path, actual: &Path) -> color_eyre::Result<()> {
    for entry in std::fs::read_dir(expected)? {
        let entry = entry?;
        let other = actual.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            assert!(other.is_dir(), "{} should be a directory", other.display());
            assert_same_tree(&entry.path(), &other)?;
        } else {
            assert_eq!(
                std::fs::read(entry.path())?,
                std::fs::read(&other)?,
                "{} differs",
                other.display()
            );
        }
    }
    Ok(())
}

integration_test!(test_copy_out_garbage_path, || {
    let container = TestContainer::new()?;
    let out = container.scratch("out")?;

    copy(
        &container,
        &container.endpoint("../../../../../../../../../../../../some/path/test"),
        &path_arg(&out),
    )?;

    let copied = std::fs::read_to_string(out.join("test"))?;
    assert_eq!(copied, CONTAINER_CONTENT);
    assert_ne!(copied, HOST_CONTENT);

    Ok(())
});

integration_test!(test_copy_out_relative_and_absolute_agree, || {
    let container = TestContainer::new()?;
    let a = container.scratch("a")?;
    let b = container.scratch("b")?;

    copy(&container, &container.endpoint("some/path/test"), &path_arg(&a))?;
    copy(&container, &container.endpoint("/some/path/test"), &path_arg(&b))?;
    assert_eq!(std::fs::read(a.join("test"))?, std::fs::read(b.join("test"))?);

    Ok(())
});

integration_test!(test_copy_out_absolute_symlink, || {
    let container = TestContainer::new()?;
    let out = container.scratch("out")?;

    copy(&container, &container.endpoint("/container_path"), &path_arg(&out))?;
    assert_eq!(std::fs::read_to_string(out.join("test"))?, CONTAINER_CONTENT);

    Ok(())
});

integration_test!(test_copy_out_symlink_component, || {
    let container = TestContainer::new()?;
    let out = container.scratch("out")?;

    copy(&container, &container.endpoint("/link_dir/test"), &path_arg(&out))?;
    assert_eq!(std::fs::read_to_string(out.join("test"))?, CONTAINER_CONTENT);

    Ok(())
});

integration_test!(test_copy_out_volume_mount_point, || {
    let container = TestContainer::new()?;
    let out = container.scratch("out")?;

    let report = copy(&container, &container.endpoint("/foo"), &path_arg(&out))?;
    assert_eq!(report.container_path.to_string(), "/foo");
    assert_same_tree(&container.volume(), &out.join("foo"))?;

    Ok(())
});

integration_test!(test_copy_out_bind_mounted_file, || {
    let container = TestContainer::new()?;
    let out = container.scratch("out")?;

    copy(
        &container,
        &container.endpoint("/data/nested/file.txt"),
        &path_arg(&out),
    )?;
    assert_eq!(
        std::fs::read(out.join("file.txt"))?,
        std::fs::read(container.bind().join("nested/file.txt"))?
    );

    // Single-file bind mount
    copy(&container, &container.endpoint("/etc/app.conf"), &path_arg(&out))?;
    assert_eq!(std::fs::read_to_string(out.join("app.conf"))?, "key = value\n");

    Ok(())
});

integration_test!(test_copy_out_special_files, || {
    let container = TestContainer::new()?;
    let out = container.scratch("out")?;
    let state = container.rootfs().parent().ok_or("rootfs has a parent")?.to_path_buf();

    for name in ["hostname", "hosts", "resolv.conf"] {
        copy(
            &container,
            &container.endpoint(&format!("/etc/{}", name)),
            &path_arg(&out),
        )?;
        assert_eq!(std::fs::read(out.join(name))?, std::fs::read(state.join(name))?);
    }

    Ok(())
});

integration_test!(test_copy_colon_name_round_trip, || {
    let container = TestContainer::new()?;
    let out = container.scratch("out")?;

    copy(&container, &container.endpoint("/te:s:t"), &path_arg(&out))?;
    assert_eq!(std::fs::read_to_string(out.join("te:s:t"))?, "colons are fine");

    // Back in under a new directory name; the colon survives the trip.
    copy(&container, &path_arg(&out), &container.endpoint("/returned"))?;
    assert_eq!(
        std::fs::read_to_string(container.rootfs().join("returned/te:s:t"))?,
        "colons are fine"
    );

    Ok(())
});

integration_test!(test_copy_in_through_absolute_symlink, || {
    let container = TestContainer::new()?;
    let src = container.scratch("src")?;
    std::fs::write(src.join("payload"), "copied in")?;

    // `/link_dir` points at `/some/path` inside the container.
    copy(&container, &path_arg(&src.join("payload")), &container.endpoint("/link_dir/"))?;
    assert_eq!(
        std::fs::read_to_string(container.rootfs().join("some/path/payload"))?,
        "copied in"
    );
    assert!(!container.host().join("some/path/payload").exists());

    Ok(())
});

integration_test!(test_copy_in_hostile_names_rejected, || {
    let container = TestContainer::new()?;

    for name in [&b"../escaped"[..], b"/escaped", b"a/../../escaped"] {
        let archive = raw_archive(name, b"evil")?;
        let err = copy_with_stdin(&container, "-", &container.endpoint("/"), archive).unwrap_err();
        assert_eq!(err.stage, Stage::Extract);
        assert!(matches!(err.error, CopyError::InvalidPath(_)), "{:?}", err);
    }

    let state = container.rootfs().parent().ok_or("rootfs has a parent")?.to_path_buf();
    assert!(!state.join("escaped").exists());
    assert!(!Path::new("/escaped").exists());

    Ok(())
});

integration_test!(test_copy_in_existing_symlink_cannot_escape, || {
    let container = TestContainer::new()?;
    let outside = container.scratch("outside")?;
    // A link planted by the container pointing at a real host directory.
    std::os::unix::fs::symlink(&outside, container.rootfs().join("planted"))?;

    let archive = raw_archive(b"planted/pwned", b"evil")?;
    let result = copy_with_stdin(&container, "-", &container.endpoint("/"), archive);
    assert!(result.is_err());
    assert!(!outside.join("pwned").exists());

    Ok(())
});

integration_test!(test_copy_between_containers_refused, || {
    let container = TestContainer::new()?;
    let err = copy(&container, &container.endpoint("/a"), &container.endpoint("/b")).unwrap_err();
    assert_eq!(err.stage, Stage::Parse);
    assert!(matches!(err.error, CopyError::AmbiguousEndpoint(_)));

    let err = copy(&container, "/tmp/a", "/tmp/b").unwrap_err();
    assert!(matches!(err.error, CopyError::AmbiguousEndpoint(_)));

    Ok(())
});

integration_test!(test_copy_out_root_follows_mounts, || {
    let container = TestContainer::new()?;
    let snapshot = container.scratch("out")?.join("snapshot");

    copy(&container, &container.endpoint("/"), &path_arg(&snapshot))?;
    assert_same_tree(&container.volume(), &snapshot.join("foo"))?;
    assert_same_tree(&container.bind(), &snapshot.join("data"))?;
    assert_eq!(std::fs::read_to_string(snapshot.join("etc/app.conf"))?, "key = value\n");
    assert_eq!(
        std::fs::read_to_string(snapshot.join("etc/hosts"))?,
        "127.0.0.1 localhost\n"
    );
    assert_eq!(
        std::fs::read_to_string(snapshot.join("some/path/test"))?,
        CONTAINER_CONTENT
    );

    Ok(())
});

integration_test!(test_copy_in_spanning_a_bind_mount, || {
    let container = TestContainer::new()?;
    let src = container.scratch("src")?.join("data");
    std::fs::create_dir(&src)?;
    std::fs::write(src.join("fresh"), "written through the mount")?;

    copy(&container, &path_arg(&src), &container.endpoint("/"))?;
    assert_eq!(
        std::fs::read_to_string(container.bind().join("fresh"))?,
        "written through the mount"
    );
    assert!(!container.rootfs().join("data/fresh").exists());

    Ok(())
});
