use crate::LogicPatches;

/// Encapsulates what's specific to the module being proxied. We try to keep
/// this minimal, with everything else shared across targets.
pub trait Target: Send + Sync + 'static {
    /// The file name of the module whose resource imports are rebound.
    const MODULE: &'static str;

    /// The instructions neutralized when an addon asks for it.
    const LOGIC_PATCHES: LogicPatches;
}

#[cfg(windows)]
pub use self::windows_runtime::*;

#[cfg(windows)]
mod windows_runtime {
    use std::sync::mpsc::Sender;
    use std::sync::{Arc, Mutex, PoisonError};

    use anyhow::{Context, Result};
    use log::*;
    use windows::Win32::System::LibraryLoader::LoadLibraryW;
    use windows::core::HSTRING;

    use super::Target;
    use crate::addons::{AddonManager, HostContext, LibraryLoader};
    use crate::hooks::{self, InstalledHooks};
    use crate::interceptor::Interceptor;
    use crate::patcher::{ModuleImage, VirtualProtection};
    use crate::{AddonCommand, AddonThread, Proxy, utils};

    /// Everything [initialize] set up.
    pub struct Runtime {
        proxy: Arc<Proxy>,
        hooks: Mutex<Option<InstalledHooks>>,
        thread: AddonThread,
    }

    impl Runtime {
        pub fn proxy(&self) -> &Arc<Proxy> {
            &self.proxy
        }

        /// Returns a handle for sending commands to the addon thread.
        pub fn commands(&self) -> Sender<AddonCommand> {
            self.thread.sender()
        }

        /// Restores the target's imports and unloads every addon.
        ///
        /// This runs on whatever thread unloads the proxy, so it can't wait
        /// for the addon thread.
        pub fn shutdown(&self) {
            let hooks = self
                .hooks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(hooks) = hooks {
                // Safety: the target outlives us, since we hold a reference
                // to it from LoadLibraryW.
                unsafe { hooks.uninstall(&VirtualProtection) };
            }
            self.proxy.shutdown();
        }
    }

    /// Loads `T`'s module, rebinds its resource imports and starts the addon
    /// thread, which loads the addons and then applies any logic patches they
    /// ask for.
    pub fn initialize<T: Target>() -> Result<Runtime> {
        let module = unsafe { LoadLibraryW(&HSTRING::from(T::MODULE)) }
            .with_context(|| format!("failed to load {}", T::MODULE))?;
        info!("{} loaded", T::MODULE);

        // Everything that can fail runs before the module's imports are
        // touched.
        let manager = AddonManager::new(utils::addon_directory()?, Box::new(LibraryLoader))?;
        let proxy = Arc::new(Proxy::new(Arc::new(Interceptor::new()), manager));

        // Safety: LoadLibraryW returned a mapped module we never free.
        let image = unsafe { ModuleImage::from_module(module.0.cast()) };
        let hooks = unsafe {
            hooks::install(proxy.interceptor().clone(), &image, &VirtualProtection)
        }?;

        // Addons are loaded off the loader lock.
        let thread = AddonThread::spawn(proxy.clone(), HostContext::default(), move |proxy| {
            // Safety: the sites were taken from this exact module.
            unsafe { proxy.apply_logic_patches(&image, T::LOGIC_PATCHES, &VirtualProtection) };
        });
        let thread = match thread {
            Ok(thread) => thread,
            Err(e) => {
                // Safety: the module is still loaded.
                unsafe { hooks.uninstall(&VirtualProtection) };
                proxy.shutdown();
                return Err(e).context("failed to start the addon thread");
            }
        };

        Ok(Runtime {
            proxy,
            hooks: Mutex::new(Some(hooks)),
            thread,
        })
    }
}
