use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};

/// The name of the directory next to the host executable that addons live
/// in.
pub const ADDON_DIRECTORY: &str = "addons";

/// Returns the directory containing the host executable.
pub fn host_directory() -> Result<PathBuf> {
    let exe = std::env::current_exe()?;
    exe.parent()
        .map(Path::to_owned)
        .ok_or_else(|| anyhow!("{} has no parent directory", exe.display()))
}

/// Returns the directory addons are discovered in.
pub fn addon_directory() -> Result<PathBuf> {
    Ok(host_directory()?.join(ADDON_DIRECTORY))
}
