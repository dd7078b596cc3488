use std::env::consts::DLL_EXTENSION;
use std::fs;
use std::path::{Path, PathBuf};

use log::*;

use super::AddonRecord;
use crate::error::AddonError;

/// The extension of an addon's own settings file.
pub const SETTINGS_EXTENSION: &str = "ini";

/// Finds every addon under `directory`, creating it if it doesn't exist yet.
///
/// Each subdirectory containing a module is one addon, named after the
/// subdirectory. A module with the same name as the subdirectory is preferred;
/// otherwise the first one by file name is used. Subdirectories without a
/// module are skipped.
pub fn discover(directory: &Path) -> Result<Vec<AddonRecord>, AddonError> {
    if !directory.exists() {
        fs::create_dir_all(directory).map_err(|source| AddonError::Scan {
            path: directory.to_owned(),
            source,
        })?;
        info!("Created addon directory {}", directory.display());
        return Ok(Vec::new());
    }

    let mut records = Vec::new();
    for dir in sorted_entries(directory)? {
        if !dir.is_dir() {
            continue;
        }
        let Some(name) = dir.file_name().and_then(|n| n.to_str()) else {
            warn!("Skipping addon directory with a non-Unicode name: {}", dir.display());
            continue;
        };

        let files = match sorted_entries(&dir) {
            Ok(files) => files,
            Err(e) => {
                warn!("{e}");
                continue;
            }
        };

        let preferred = dir.join(format!("{name}.{DLL_EXTENSION}"));
        let mut module = preferred.is_file().then_some(preferred);
        let mut config_path = None;
        for file in files.into_iter().filter(|f| f.is_file()) {
            if has_extension(&file, DLL_EXTENSION) {
                module.get_or_insert(file);
            } else if has_extension(&file, SETTINGS_EXTENSION) {
                config_path.get_or_insert(file);
            }
        }

        match module {
            Some(path) => {
                debug!("Found addon {name} at {}", path.display());
                records.push(AddonRecord::new(name, path, config_path));
            }
            None => debug!("No module in {}, skipping", dir.display()),
        }
    }
    Ok(records)
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>, AddonError> {
    let scan_error = |source| AddonError::Scan {
        path: dir.to_owned(),
        source,
    };
    let mut entries = fs::read_dir(dir)
        .map_err(scan_error)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(scan_error)?;
    entries.sort();
    Ok(entries)
}

fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(extension))
}
