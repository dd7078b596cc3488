use std::ffi::c_void;
use std::ptr;
use std::sync::{Arc, PoisonError, RwLock};

use log::*;

use crate::cache::ResourceCache;
use crate::handle::SyntheticHandle;
use crate::resource::{ModuleHandle, ResourceApi, ResourceId};

/// The id every string-named override is stored under. Only one such
/// override can be live at a time: a later one replaces the earlier entry.
pub const STRING_RESOURCE_ID: u16 = 0xFFFF;

/// Something that may want to replace one of the host's resources.
pub trait ResourceOverride: Send + Sync {
    /// Returns the bytes to serve in place of the resource, if any.
    fn intercept_resource(&self, name: ResourceId<'_>, ty: ResourceId<'_>) -> Option<Vec<u8>>;
}

/// Decides, call by call, whether a resource request is served from
/// overrides or forwarded to the host's own implementation.
///
/// Every method is safe to call concurrently from any thread. A handle is
/// classified afresh on each call from its bits alone.
pub struct Interceptor {
    originals: ResourceApi,
    cache: ResourceCache,
    overrides: RwLock<Option<Arc<dyn ResourceOverride>>>,
}

impl Interceptor {
    pub fn new() -> Self {
        Self {
            originals: ResourceApi::default(),
            cache: ResourceCache::new(),
            overrides: RwLock::new(None),
        }
    }

    /// The host implementations requests are forwarded to.
    pub fn originals(&self) -> &ResourceApi {
        &self.originals
    }

    pub fn cache(&self) -> &ResourceCache {
        &self.cache
    }

    /// Starts consulting `overrides` on every lookup.
    pub fn attach(&self, overrides: Arc<dyn ResourceOverride>) {
        *self.overrides.write().unwrap_or_else(PoisonError::into_inner) = Some(overrides);
    }

    /// Stops consulting overrides and drops every cached resource. From here
    /// on every call is forwarded unchanged.
    pub fn detach(&self) {
        self.overrides
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.cache.clear();
    }

    /// Returns a synthetic handle if an override exists for `name`/`ty`.
    pub fn intercept(&self, name: ResourceId<'_>, ty: ResourceId<'_>) -> Option<SyntheticHandle> {
        // Clone out of the lock so no addon code runs while we hold it.
        let overrides = self
            .overrides
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()?;

        let bytes = overrides.intercept_resource(name, ty)?;
        if bytes.is_empty() {
            return None;
        }

        let handle = SyntheticHandle::encode(name.as_int().unwrap_or(STRING_RESOURCE_ID));
        let len = bytes.len();
        self.cache.put(handle, bytes);
        debug!("Intercepted resource {name} (type {ty}), {len} bytes as {handle:?}");
        Some(handle)
    }

    /// Replacement for `FindResourceW`.
    ///
    /// ## Safety
    ///
    /// The arguments must satisfy `FindResourceW`'s contract.
    pub unsafe fn find_resource(
        &self,
        module: ModuleHandle,
        name: *const u16,
        ty: *const u16,
    ) -> *mut c_void {
        let (name_id, type_id) = unsafe { (ResourceId::from_raw(name), ResourceId::from_raw(ty)) };
        if let Some(handle) = self.intercept(name_id, type_id) {
            return handle.as_ptr();
        }

        match self.originals.find_resource.get() {
            Some(original) => unsafe { original(module, name, ty) },
            None => ptr::null_mut(),
        }
    }

    /// Replacement for `LoadResource`. Our bytes are already resident, so a
    /// synthetic handle is its own loaded token.
    ///
    /// ## Safety
    ///
    /// The arguments must satisfy `LoadResource`'s contract.
    pub unsafe fn load_resource(&self, module: ModuleHandle, info: *mut c_void) -> *mut c_void {
        if SyntheticHandle::from_ptr(info).is_some() {
            return info;
        }

        match self.originals.load_resource.get() {
            Some(original) => unsafe { original(module, info) },
            None => ptr::null_mut(),
        }
    }

    /// Replacement for `SizeofResource`.
    ///
    /// ## Safety
    ///
    /// The arguments must satisfy `SizeofResource`'s contract.
    pub unsafe fn sizeof_resource(&self, module: ModuleHandle, info: *mut c_void) -> u32 {
        if let Some(handle) = SyntheticHandle::from_ptr(info) {
            return match self.cache.get(handle) {
                Some(resource) => resource.size(),
                None => {
                    warn!("SizeofResource on unknown {handle:?}");
                    0
                }
            };
        }

        match self.originals.sizeof_resource.get() {
            Some(original) => unsafe { original(module, info) },
            None => 0,
        }
    }

    /// Replacement for `LockResource`.
    ///
    /// ## Safety
    ///
    /// The argument must satisfy `LockResource`'s contract.
    pub unsafe fn lock_resource(&self, data: *mut c_void) -> *mut c_void {
        if let Some(handle) = SyntheticHandle::from_ptr(data) {
            return match self.cache.get(handle) {
                Some(resource) => resource.as_ptr() as *mut c_void,
                None => {
                    warn!("LockResource on unknown {handle:?}");
                    ptr::null_mut()
                }
            };
        }

        match self.originals.lock_resource.get() {
            Some(original) => unsafe { original(data) },
            None => ptr::null_mut(),
        }
    }

    /// Replacement for `FreeResource`. Synthetic resources are owned by the
    /// cache and stay put until it's cleared, since the host may ask for them
    /// again.
    ///
    /// ## Safety
    ///
    /// The argument must satisfy `FreeResource`'s contract.
    pub unsafe fn free_resource(&self, data: *mut c_void) -> i32 {
        if SyntheticHandle::from_ptr(data).is_some() {
            return 1;
        }

        match self.originals.free_resource.get() {
            Some(original) => unsafe { original(data) },
            None => 1,
        }
    }
}

impl Default for Interceptor {
    fn default() -> Self {
        Self::new()
    }
}
