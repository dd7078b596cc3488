use std::path::PathBuf;

use thiserror::Error;

/// Why an import slot or code site couldn't be patched. None of these are
/// fatal: the affected hook is simply left uninstalled.
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("malformed module image: {0}")]
    Pe(pelite::Error),

    #[error("RVA {rva:#x} lies outside the {size:#x}-byte image")]
    OutOfBounds { rva: usize, size: usize },

    #[error("{symbol} is not imported by name from {dll}")]
    ImportNotFound { dll: String, symbol: String },

    #[error("failed to change page protection at {address:#x}: {message}")]
    Protect { address: usize, message: String },
}

impl From<pelite::Error> for PatchError {
    fn from(e: pelite::Error) -> Self {
        PatchError::Pe(e)
    }
}

impl PatchError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, PatchError::ImportNotFound { .. })
    }
}

/// Why an addon couldn't be discovered or loaded.
#[derive(Debug, Error)]
pub enum AddonError {
    #[error("failed to load addon module {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },

    #[error("failed to scan addon directory {path}: {source}")]
    Scan {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
