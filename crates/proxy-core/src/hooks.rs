//! The functions we bind into the target module's import table, and the
//! routine that binds them.
//!
//! Import slots can only hold plain function pointers, so the trampolines
//! reach the [Interceptor] through a process-wide slot that [install] fills
//! exactly once. Everything else about interception lives in the
//! [Interceptor] itself.

use std::ffi::c_void;
use std::sync::{Arc, OnceLock};

use anyhow::{Result, bail};
use log::*;

use crate::interceptor::Interceptor;
use crate::patcher::{ImportBinding, ModuleImage, ProtectMemory, patch_import};
use crate::resource::*;

static INSTALLED: OnceLock<Arc<Interceptor>> = OnceLock::new();

/// The DLL the host imports its resource functions from.
pub const RESOURCE_DLL: &str = "kernel32.dll";

unsafe extern "system" fn find_resource_w(
    module: ModuleHandle,
    name: *const u16,
    ty: *const u16,
) -> *mut c_void {
    match INSTALLED.get() {
        Some(interceptor) => unsafe { interceptor.find_resource(module, name, ty) },
        None => std::ptr::null_mut(),
    }
}

unsafe extern "system" fn load_resource(module: ModuleHandle, info: *mut c_void) -> *mut c_void {
    match INSTALLED.get() {
        Some(interceptor) => unsafe { interceptor.load_resource(module, info) },
        None => std::ptr::null_mut(),
    }
}

unsafe extern "system" fn sizeof_resource(module: ModuleHandle, info: *mut c_void) -> u32 {
    match INSTALLED.get() {
        Some(interceptor) => unsafe { interceptor.sizeof_resource(module, info) },
        None => 0,
    }
}

unsafe extern "system" fn lock_resource(data: *mut c_void) -> *mut c_void {
    match INSTALLED.get() {
        Some(interceptor) => unsafe { interceptor.lock_resource(data) },
        None => std::ptr::null_mut(),
    }
}

unsafe extern "system" fn free_resource(data: *mut c_void) -> i32 {
    match INSTALLED.get() {
        Some(interceptor) => unsafe { interceptor.free_resource(data) },
        None => 1,
    }
}

/// The import slots rebound by [install].
#[derive(Debug, Default)]
pub struct InstalledHooks {
    bindings: Vec<(&'static str, ImportBinding)>,
}

impl InstalledHooks {
    /// The names of the functions that were hooked.
    pub fn symbols(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.bindings.iter().map(|(symbol, _)| *symbol)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Rebinds every slot we patched to the host's original function. Slots
    /// rebound by someone else in the meantime are left alone.
    ///
    /// ## Safety
    ///
    /// The patched module must still be loaded.
    pub unsafe fn uninstall(self, protect: &impl ProtectMemory) {
        for (symbol, binding) in self.bindings {
            match unsafe { binding.restore(protect) } {
                Ok(true) => debug!("Restored {symbol}"),
                Ok(false) => warn!("{symbol} was rebound by someone else, leaving it"),
                Err(e) => warn!("Couldn't restore {symbol}: {e}"),
            }
        }
        info!("Resource hooks uninstalled");
    }
}

/// Publishes `interceptor` to the trampolines and rebinds `image`'s imports
/// of the five resource functions to them.
///
/// A function whose import can't be patched is logged and left alone; calls
/// to it simply aren't intercepted. This can only succeed once per process.
///
/// ## Safety
///
/// `image` must be a loaded module whose imports of the resource functions
/// follow the Win32 signatures, and it must stay loaded while the hooks are
/// installed.
pub unsafe fn install(
    interceptor: Arc<Interceptor>,
    image: &ModuleImage,
    protect: &impl ProtectMemory,
) -> Result<InstalledHooks> {
    if INSTALLED.set(interceptor.clone()).is_err() {
        bail!("resource hooks are already installed");
    }
    let originals = interceptor.originals();

    let mut hooks = InstalledHooks::default();
    let mut patch = |symbol: &'static str, replacement: usize| {
        match unsafe { patch_import(image, RESOURCE_DLL, symbol, replacement, protect) } {
            Ok(binding) => {
                hooks.bindings.push((symbol, binding));
                Some(binding.original())
            }
            Err(e) => {
                warn!("Hook for {symbol} not installed: {e}");
                None
            }
        }
    };

    // Safety: each original came out of the slot we replaced with a function
    // of the same signature.
    unsafe {
        if let Some(original) =
            patch("FindResourceW", find_resource_w as FindResourceWFn as usize)
        {
            originals
                .find_resource
                .bind(std::mem::transmute::<usize, FindResourceWFn>(original));
        }
        if let Some(original) = patch("LoadResource", load_resource as LoadResourceFn as usize) {
            originals
                .load_resource
                .bind(std::mem::transmute::<usize, LoadResourceFn>(original));
        }
        if let Some(original) =
            patch("SizeofResource", sizeof_resource as SizeofResourceFn as usize)
        {
            originals
                .sizeof_resource
                .bind(std::mem::transmute::<usize, SizeofResourceFn>(original));
        }
        if let Some(original) = patch("LockResource", lock_resource as LockResourceFn as usize) {
            originals
                .lock_resource
                .bind(std::mem::transmute::<usize, LockResourceFn>(original));
        }
        if let Some(original) = patch("FreeResource", free_resource as FreeResourceFn as usize) {
            originals
                .free_resource
                .bind(std::mem::transmute::<usize, FreeResourceFn>(original));
        }
    }

    info!(
        "Installed {} of 5 resource hooks: {}",
        hooks.len(),
        hooks.symbols().collect::<Vec<_>>().join(", ")
    );
    Ok(hooks)
}
