//! Discovering, loading and talking to addons.
//!
//! An addon is a dynamic library in its own subdirectory of the addon
//! directory. All addon management happens on one thread, which also owns the
//! UI context addons are initialized with. Resource queries may come from any
//! thread.

use std::ffi::{CStr, c_char};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use std::{ptr, slice};

use addon_api::{Capabilities, Host};
use anyhow::{Result, bail};
use log::*;

use crate::config::{CONFIG_FILE, Config};
use crate::error::AddonError;
use crate::interceptor::ResourceOverride;
use crate::resource::ResourceId;

mod discovery;
mod host;
mod loader;

#[cfg(test)]
pub(crate) mod fake;

pub use discovery::*;
pub use host::HostContext;
use host::HostServices;
pub use loader::*;

/// One addon found on disk, and its state if it's loaded.
pub struct AddonRecord {
    name: String,
    path: PathBuf,
    config_path: Option<PathBuf>,
    enabled: bool,
    loaded: Option<LoadedAddon>,
}

struct LoadedAddon {
    entry_points: EntryPoints,
    capabilities: Capabilities,
    reported_name: Option<String>,
    version: Option<String>,
    initialized: bool,

    // Declared last so it's dropped after everything that points into it.
    _module: Box<dyn AddonModule>,
}

impl AddonRecord {
    pub(crate) fn new(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        config_path: Option<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            config_path,
            enabled: true,
            loaded: None,
        }
    }

    /// The name of the addon's directory, which is also its key in the
    /// config.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The name the addon reports for itself, falling back on [Self::name].
    pub fn display_name(&self) -> &str {
        self.loaded
            .as_ref()
            .and_then(|l| l.reported_name.as_deref())
            .unwrap_or(&self.name)
    }

    pub fn version(&self) -> Option<&str> {
        self.loaded.as_ref()?.version.as_deref()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The addon's own settings file, if it ships one.
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    /// What the addon advertised when it was loaded. Empty while unloaded.
    pub fn capabilities(&self) -> Capabilities {
        self.loaded
            .as_ref()
            .map(|l| l.capabilities)
            .unwrap_or_default()
    }

    /// The entry points the addon exports. All absent while unloaded.
    pub fn entry_points(&self) -> EntryPoints {
        self.loaded
            .as_ref()
            .map(|l| l.entry_points)
            .unwrap_or_default()
    }

    fn load(&mut self, loader: &dyn ModuleLoader) -> Result<(), AddonError> {
        if self.loaded.is_some() {
            return Ok(());
        }

        let module = loader.load(&self.path)?;
        // Safety: anything exported under an addon entry point name is assumed
        // to follow the addon ABI.
        let entry_points = unsafe { EntryPoints::resolve(&*module) };
        if entry_points.is_empty() {
            warn!(
                "{} exports no addon entry points, it won't do anything",
                self.path.display()
            );
        }

        let capabilities = match entry_points.get_capabilities {
            Some(get_capabilities) => {
                Capabilities::from_bits_truncate(unsafe { get_capabilities() })
            }
            None => Capabilities::empty(),
        };
        let reported_name = entry_points.get_name.and_then(|f| unsafe { c_string(f()) });
        let version = entry_points
            .get_version
            .and_then(|f| unsafe { c_string(f()) });

        info!(
            "Loaded addon {} {} from {} ({capabilities:?})",
            reported_name.as_deref().unwrap_or(&self.name),
            version.as_deref().unwrap_or("(unversioned)"),
            self.path.display()
        );
        self.loaded = Some(LoadedAddon {
            entry_points,
            capabilities,
            reported_name,
            version,
            initialized: false,
            _module: module,
        });
        Ok(())
    }

    /// Runs the addon's initializer unless it already has. Returns whether it
    /// ran.
    fn initialize(&mut self, host: *mut Host, context: &HostContext) -> bool {
        let Some(loaded) = self.loaded.as_mut() else {
            return false;
        };
        if loaded.initialized {
            return false;
        }
        loaded.initialized = true;

        let Some(initialize) = loaded.entry_points.initialize else {
            return false;
        };
        debug!("Initializing addon {}", self.name);
        unsafe {
            initialize(
                host,
                context.ui_context,
                context.ui_alloc,
                context.ui_free,
                context.ui_alloc_user_data,
            )
        };
        true
    }

    fn unload(&mut self) {
        let Some(loaded) = self.loaded.take() else {
            return;
        };
        if let Some(shutdown) = loaded.entry_points.shutdown {
            unsafe { shutdown() };
        }
        drop(loaded);
        info!("Unloaded addon {}", self.name);
    }

    fn intercept(&self, name: ResourceId<'_>, ty: ResourceId<'_>) -> Option<Vec<u8>> {
        let intercept = self.loaded.as_ref()?.entry_points.intercept_resource?;

        let mut data = ptr::null();
        let mut size = 0u32;
        // Safety: the ids are exactly what the host passed us, and the
        // out-pointers are live locals.
        if !unsafe { intercept(name.as_raw(), ty.as_raw(), &mut data, &mut size) }
            || data.is_null()
            || size == 0
        {
            return None;
        }
        // Safety: the addon promises `size` readable bytes until it returns,
        // which is as long as we need them.
        Some(unsafe { slice::from_raw_parts(data.cast::<u8>(), size as usize) }.to_vec())
    }
}

unsafe fn c_string(ptr: *const c_char) -> Option<String> {
    (!ptr.is_null()).then(|| unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
}

/// Owns every addon and the config recording which are enabled.
pub struct AddonManager {
    directory: PathBuf,
    config: Config,
    loader: Box<dyn ModuleLoader>,
    host: HostServices,

    /// The context addons were last initialized with, reused for addons
    /// loaded later.
    context: Option<HostContext>,

    addons: Vec<AddonRecord>,
}

impl AddonManager {
    /// Scans `directory` for addons and reads its config. Nothing is loaded
    /// yet. A broken config is logged and the defaults are used instead.
    pub fn new(directory: impl Into<PathBuf>, loader: Box<dyn ModuleLoader>) -> Result<Self> {
        let directory = directory.into();
        let config = Config::load_or_default(directory.join(CONFIG_FILE));
        let mut manager = Self {
            directory,
            config,
            loader,
            host: HostServices::new(),
            context: None,
            addons: Vec::new(),
        };
        manager.rescan()?;
        Ok(manager)
    }

    fn rescan(&mut self) -> Result<(), AddonError> {
        self.addons = discover(&self.directory)?;
        for addon in &mut self.addons {
            addon.enabled = self.config.is_enabled(&addon.name);
        }
        info!(
            "Found {} addon(s) in {}",
            self.addons.len(),
            self.directory.display()
        );
        Ok(())
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Every discovered addon, in discovery order.
    pub fn addons(&self) -> &[AddonRecord] {
        &self.addons
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Loads every enabled addon that isn't loaded yet. An addon that fails
    /// to load is logged and stays unloaded. Returns how many were loaded.
    pub fn load_enabled(&mut self) -> usize {
        let mut count = 0;
        for addon in self.addons.iter_mut().filter(|a| a.enabled) {
            if addon.is_loaded() {
                continue;
            }
            match addon.load(&*self.loader) {
                Ok(()) => count += 1,
                Err(e) => warn!("{e}"),
            }
        }
        count
    }

    /// Initializes every loaded addon that hasn't been yet, and remembers
    /// `context` for addons loaded later.
    ///
    /// This must run on the thread that owns the UI context.
    pub fn initialize(&mut self, context: HostContext) {
        let host = self.host.as_ptr();
        for addon in self.addons.iter_mut().filter(|a| a.enabled) {
            addon.initialize(host, &context);
        }
        self.context = Some(context);
    }

    /// Asks each enabled addon in discovery order for an override, and
    /// returns the first non-empty one.
    pub fn intercept_resource(&self, name: ResourceId<'_>, ty: ResourceId<'_>) -> Option<Vec<u8>> {
        self.addons
            .iter()
            .filter(|a| a.enabled)
            .find_map(|a| a.intercept(name, ty))
    }

    pub fn unload_all(&mut self) {
        for addon in &mut self.addons {
            addon.unload();
        }
    }

    /// Unloads everything, then rediscovers, reconfigures, reloads and
    /// reinitializes from scratch.
    pub fn reload(&mut self) -> Result<()> {
        info!("Reloading addons");
        self.unload_all();
        self.config = Config::load_or_default(self.config.path().to_owned());
        self.rescan()?;
        self.load_enabled();
        if let Some(context) = self.context {
            self.initialize(context);
        }
        Ok(())
    }

    /// Enables or disables the addon at `index`, loading or unloading it to
    /// match, and saves the config.
    pub fn toggle(&mut self, index: usize, enable: bool) -> Result<()> {
        let Some(addon) = self.addons.get_mut(index) else {
            bail!("there's no addon #{index}");
        };

        addon.enabled = enable;
        if !enable {
            addon.unload();
        } else if !addon.is_loaded() {
            match addon.load(&*self.loader) {
                Ok(()) => {
                    if let Some(context) = &self.context {
                        addon.initialize(self.host.as_ptr(), context);
                    }
                }
                Err(e) => warn!("{e}"),
            }
        }

        self.save_config()
    }

    /// Shows the settings of the addon at `index`, if it has any. Returns
    /// whether it did.
    ///
    /// This must run on the thread that owns the UI context.
    pub fn render_settings(&self, index: usize) -> bool {
        let Some(addon) = self.addons.get(index) else {
            return false;
        };
        match addon.entry_points().render_settings {
            Some(render) => {
                unsafe { render() };
                true
            }
            None => {
                if addon.capabilities().contains(Capabilities::HAS_SETTINGS) {
                    warn!("{} claims to have settings but can't render them", addon.name);
                }
                false
            }
        }
    }

    /// Whether any enabled addon asked for the host's logic to be patched.
    pub fn wants_logic_patches(&self) -> bool {
        self.addons.iter().any(|a| {
            a.enabled && a.capabilities().contains(Capabilities::PATCH_HOST_LOGIC)
        })
    }

    pub fn show_fps_counter(&self) -> bool {
        self.config.debug().show_fps_counter
    }

    pub fn set_show_fps_counter(&mut self, show: bool) -> Result<()> {
        self.config.debug_mut().show_fps_counter = show;
        self.save_config()
    }

    pub fn show_custom_shader_border(&self) -> bool {
        self.config.debug().show_custom_shader_border
    }

    pub fn set_show_custom_shader_border(&mut self, show: bool) -> Result<()> {
        self.config.debug_mut().show_custom_shader_border = show;
        self.save_config()
    }

    fn save_config(&mut self) -> Result<()> {
        for addon in &self.addons {
            self.config.set_enabled(addon.name.clone(), addon.enabled);
        }
        self.config.save()
    }
}

impl Drop for AddonManager {
    fn drop(&mut self) {
        self.unload_all();
    }
}

impl ResourceOverride for RwLock<AddonManager> {
    fn intercept_resource(&self, name: ResourceId<'_>, ty: ResourceId<'_>) -> Option<Vec<u8>> {
        self.read()
            .unwrap_or_else(PoisonError::into_inner)
            .intercept_resource(name, ty)
    }
}
