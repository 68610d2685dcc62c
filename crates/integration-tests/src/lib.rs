//! End-to-end copies between a fake host tree and a fake container.
//!
//! Each test gets a private store in a temporary directory from
//! [`fixture::TestContainer`]: one container named `web` with a rootfs, a
//! volume at `/foo`, bind mounts at `/data` and `/etc/app.conf`, identity
//! files next to its metadata, and a `host/` tree that mirrors rootfs paths
//! with different content. A copy that reads or writes the wrong side shows
//! up as the wrong bytes, without a container runtime and without root.
//!
//! Tests drive either the library ([`ctrcp::Transfer`]) or the built
//! `ctrcp` binary against that store. They are collected by
//! [`integration_test!`] and run by libtest-mimic, so the usual
//! `cargo test -- <filter>` arguments apply.

#![allow(unsafe_code)] // Required for linkme

use libtest_mimic::{Arguments, Trial};
use linkme::distributed_slice;

pub mod fixture;
mod tests;

/// Every registered copy test, filled in by [`integration_test!`].
#[distributed_slice]
pub static INTEGRATION_TESTS: [fn() -> Trial];

/// Run the registered tests with libtest-mimic's command line handling.
pub fn run_tests() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let args = Arguments::from_args();
    let tests: Vec<Trial> = INTEGRATION_TESTS.iter().map(|f| f()).collect();

    let conclusion = libtest_mimic::run(&args, tests);
    conclusion.exit();
}

/// Register a test body that returns `Result<(), Box<dyn Error>>`.
///
/// Errors become test failures carrying the error's message, so a failed
/// copy reports its stage (`extract: permission denied: ...`).
///
/// # Example
///
/// ```ignore
/// use integration_tests::{integration_test, fixture::{CONTAINER_CONTENT, TestContainer, path_arg}};
///
/// integration_test!(test_copy_out_hosts, || {
///     let container = TestContainer::new()?;
///     let out = container.scratch("out")?;
///     ctrcp::Transfer::new(container.store()).run(
///         &container.endpoint("/some/path/test"),
///         &path_arg(&out),
///         ctrcp::TransferIo::inherit(),
///     )?;
///     assert_eq!(std::fs::read_to_string(out.join("test"))?, CONTAINER_CONTENT);
///     Ok(())
/// });
/// ```
#[macro_export]
macro_rules! integration_test {
    ($name:ident, $body:expr) => {
        $crate::paste::paste! {
            #[$crate::linkme::distributed_slice($crate::INTEGRATION_TESTS)]
            #[linkme(crate = $crate::linkme)]
            fn [<__register_ $name>]() -> $crate::libtest_mimic::Trial {
                $crate::libtest_mimic::Trial::test(
                    stringify!($name),
                    move || {
                        let result: Result<(), Box<dyn std::error::Error + Send + Sync>> = $body();
                        result.map_err(|e| $crate::libtest_mimic::Failed::from(e.to_string()))
                    },
                )
            }
        }
    };
}

// Used by the macro expansion.
pub use libtest_mimic;
pub use linkme;
pub use paste;
