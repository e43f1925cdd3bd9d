//! Build metadata accessors.
//! Includes the generated version.rs from the build script so there is a
//! single source of truth for build time and git hash.

include!(concat!(env!("OUT_DIR"), "/version.rs"));

/// Crate version from Cargo.toml
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Build time string from the build script (UTC)
pub fn build_time() -> &'static str {
    BUILD_TIME
}

/// Short git hash captured by the build script
pub fn git_hash() -> &'static str {
    GIT_HASH
}

/// Long version line used by `--version`
pub fn long_version() -> String {
    format!("{} (built {}, git {})", version(), build_time(), git_hash())
}
