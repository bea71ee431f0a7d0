//! Path helpers for temporary containers and catalogs.
//!
//! Every fusion test writes real Zarr containers to disk; these helpers keep
//! their layout consistent across the suite.

use std::path::{Path, PathBuf};

/// Returns the workspace root directory.
///
/// This is determined by walking up from the current crate's manifest directory
/// until we find the workspace Cargo.toml.
pub fn workspace_root() -> PathBuf {
    // Start from the test-utils crate manifest dir
    let manifest_dir = env!("CARGO_MANIFEST_DIR");
    PathBuf::from(manifest_dir)
        .parent() // crates/
        .and_then(|p| p.parent()) // workspace root
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from(manifest_dir))
}

/// Creates a temporary directory for test output.
///
/// The directory is automatically cleaned up when the returned `TempDir` is dropped.
pub fn temp_test_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("Failed to create temporary test directory")
}

/// Creates a temporary directory with a specific prefix.
pub fn temp_test_dir_with_prefix(prefix: &str) -> tempfile::TempDir {
    tempfile::Builder::new()
        .prefix(prefix)
        .tempdir()
        .expect("Failed to create temporary test directory")
}

/// Output container path inside `dir`.
pub fn output_container(dir: &Path) -> PathBuf {
    dir.join("fused.zarr")
}

/// Source view container path for `setup` inside `dir`.
pub fn view_container(dir: &Path, setup: u32) -> PathBuf {
    dir.join(format!("view-setup{}.zarr", setup))
}
