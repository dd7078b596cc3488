use std::ffi::c_void;
use std::path::Path;
use std::ptr::NonNull;

use addon_api::*;
use libloading::Library;

use crate::error::AddonError;

/// Opens addon modules. The real implementation is [LibraryLoader]; tests
/// swap in modules built from plain Rust functions.
pub trait ModuleLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<Box<dyn AddonModule>, AddonError>;
}

/// A loaded addon module. Dropping it unloads the module.
pub trait AddonModule: Send + Sync {
    /// Returns the address of the export named `name`, which must be
    /// nul-terminated.
    fn symbol(&self, name: &[u8]) -> Option<NonNull<c_void>>;
}

impl AddonModule for Library {
    fn symbol(&self, name: &[u8]) -> Option<NonNull<c_void>> {
        // Safety: we only take the address. What it points to is decided by
        // the caller.
        let symbol = unsafe { self.get::<*mut c_void>(name) }.ok()?;
        NonNull::new(*symbol)
    }
}

/// Loads addons as dynamic libraries.
#[derive(Debug, Default, Clone, Copy)]
pub struct LibraryLoader;

impl ModuleLoader for LibraryLoader {
    fn load(&self, path: &Path) -> Result<Box<dyn AddonModule>, AddonError> {
        // Safety: running an addon's initializers is the whole point of
        // loading it.
        let library = unsafe { open(path) }.map_err(|source| AddonError::Load {
            path: path.to_owned(),
            source,
        })?;
        Ok(Box::new(library))
    }
}

/// Searches the addon's own directory for its dependencies first, falling back
/// to the standard search order.
#[cfg(windows)]
unsafe fn open(path: &Path) -> Result<Library, libloading::Error> {
    use libloading::os::windows;

    match unsafe { windows::Library::load_with_flags(path, windows::LOAD_WITH_ALTERED_SEARCH_PATH) }
    {
        Ok(library) => Ok(library.into()),
        Err(e) => {
            log::debug!("Altered search path failed for {}: {e}", path.display());
            unsafe { Library::new(path) }
        }
    }
}

#[cfg(not(windows))]
unsafe fn open(path: &Path) -> Result<Library, libloading::Error> {
    unsafe { Library::new(path) }
}

/// Every entry point an addon may export. Each one is independently present
/// or absent.
#[derive(Debug, Default, Clone, Copy)]
pub struct EntryPoints {
    pub initialize: Option<InitializeFn>,
    pub shutdown: Option<ShutdownFn>,
    pub get_capabilities: Option<GetCapabilitiesFn>,
    pub render_settings: Option<RenderSettingsFn>,
    pub intercept_resource: Option<InterceptResourceFn>,
    pub get_name: Option<GetNameFn>,
    pub get_version: Option<GetVersionFn>,
}

impl EntryPoints {
    /// Looks up every entry point `module` exports.
    ///
    /// ## Safety
    ///
    /// Each export `module` has under one of the names in [exports] must have
    /// the matching signature from [addon_api].
    pub unsafe fn resolve(module: &dyn AddonModule) -> Self {
        unsafe fn get<F: Copy>(module: &dyn AddonModule, name: &[u8]) -> Option<F> {
            let address = module.symbol(name)?.as_ptr();
            Some(unsafe { std::mem::transmute_copy::<*mut c_void, F>(&address) })
        }

        unsafe {
            Self {
                initialize: get(module, exports::INITIALIZE)
                    .or_else(|| get(module, exports::LEGACY_INITIALIZE)),
                shutdown: get(module, exports::SHUTDOWN),
                get_capabilities: get(module, exports::GET_CAPABILITIES),
                render_settings: get(module, exports::RENDER_SETTINGS),
                intercept_resource: get(module, exports::INTERCEPT_RESOURCE),
                get_name: get(module, exports::GET_NAME),
                get_version: get(module, exports::GET_VERSION),
            }
        }
    }

    /// Whether the module exports none of the addon entry points.
    pub fn is_empty(&self) -> bool {
        self.initialize.is_none()
            && self.shutdown.is_none()
            && self.get_capabilities.is_none()
            && self.render_settings.is_none()
            && self.intercept_resource.is_none()
            && self.get_name.is_none()
            && self.get_version.is_none()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;
    use crate::addons::fake::{FakeLoader, legacy_module, shaders_module};

    #[test]
    fn resolves_exported_entry_points() {
        let module = shaders_module();
        let entry_points = unsafe { EntryPoints::resolve(&module) };
        assert!(!entry_points.is_empty());
        assert!(entry_points.initialize.is_some());
        assert!(entry_points.shutdown.is_some());
        assert!(entry_points.intercept_resource.is_some());
        assert!(entry_points.get_name.is_some());
        assert_eq!(
            unsafe { entry_points.get_capabilities.unwrap()() },
            (Capabilities::HAS_SETTINGS | Capabilities::PATCH_HOST_LOGIC).bits()
        );
    }

    #[test]
    fn falls_back_to_the_legacy_initializer() {
        let module = legacy_module();
        let entry_points = unsafe { EntryPoints::resolve(&module) };
        assert!(entry_points.initialize.is_some());
        assert!(entry_points.shutdown.is_none());
        assert!(entry_points.get_capabilities.is_none());
        assert!(entry_points.render_settings.is_none());
    }

    #[test]
    fn module_without_exports_is_empty() {
        let module = FakeLoader.load(Path::new("empty/empty.dll")).unwrap();
        assert!(unsafe { EntryPoints::resolve(&*module) }.is_empty());
    }

    #[test]
    fn library_loader_reports_bad_modules() {
        let dir = TempDir::new().unwrap();
        let path = dir
            .path()
            .join(format!("broken.{}", std::env::consts::DLL_EXTENSION));
        fs::write(&path, b"not a module").unwrap();

        let err = LibraryLoader.load(&path).err().unwrap();
        assert!(matches!(err, AddonError::Load { path: p, .. } if p == path));
    }
}
