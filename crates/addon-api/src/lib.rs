//! The binary contract between the resource proxy and the addons it loads.
//!
//! Addons are plain dynamic libraries. Every entry point is optional and is
//! looked up by its exported name, so an addon only exports what it actually
//! implements. The signatures and calling convention here must never change in
//! a way that breaks addons built against an earlier version.

use std::ffi::{c_char, c_void};

bitflags::bitflags! {
    /// The optional behaviors an addon advertises through
    /// [`exports::GET_CAPABILITIES`].
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct Capabilities: u32 {
        /// The addon draws a settings panel through
        /// [`exports::RENDER_SETTINGS`].
        const HAS_SETTINGS = 1 << 0;

        /// Reserved for addons that provide upscalers.
        const UPSCALER_PROVIDER = 1 << 1;

        /// Reserved for addons that provide frame generation.
        const FRAMEGEN_PROVIDER = 1 << 2;

        /// The addon asks the host to neutralize a fixed set of instructions
        /// in the target module so that overridden resources are honored.
        const PATCH_HOST_LOGIC = 1 << 3;
    }
}

/// Nul-terminated names of the entry points the host looks for.
pub mod exports {
    pub const INITIALIZE: &[u8] = b"AddonInitialize\0";

    /// Older addons export their initializer under this name.
    pub const LEGACY_INITIALIZE: &[u8] = b"AddonInit\0";

    pub const SHUTDOWN: &[u8] = b"AddonShutdown\0";
    pub const GET_CAPABILITIES: &[u8] = b"GetAddonCapabilities\0";
    pub const RENDER_SETTINGS: &[u8] = b"AddonRenderSettings\0";
    pub const INTERCEPT_RESOURCE: &[u8] = b"AddonInterceptResource\0";
    pub const GET_NAME: &[u8] = b"GetAddonName\0";
    pub const GET_VERSION: &[u8] = b"GetAddonVersion\0";
}

/// Called once after every addon has been loaded, on the thread that owns the
/// UI context. The last three arguments are the UI library's allocator hooks so
/// an addon can share the host's UI heap. Any of the UI pointers may be null.
pub type InitializeFn = unsafe extern "C" fn(
    host: *mut Host,
    ui_context: *mut c_void,
    ui_alloc: *mut c_void,
    ui_free: *mut c_void,
    ui_alloc_user_data: *mut c_void,
);

pub type ShutdownFn = unsafe extern "C" fn();

/// Returns the raw bits of [`Capabilities`].
pub type GetCapabilitiesFn = unsafe extern "C" fn() -> u32;

pub type RenderSettingsFn = unsafe extern "C" fn();

/// Asked for every resource lookup the host makes.
///
/// `name` and `resource_type` are passed exactly as the host passed them to
/// its lookup call: either a pointer to a nul-terminated UTF-16 string, or an
/// integer identifier in the low 16 bits of the pointer value.
///
/// To override the resource the addon writes a pointer to its bytes and their
/// length through the out parameters and returns `true`. The bytes only need to
/// stay valid until the call returns; the host copies them.
pub type InterceptResourceFn = unsafe extern "C" fn(
    name: *const u16,
    resource_type: *const u16,
    out_data: *mut *const c_void,
    out_size: *mut u32,
) -> bool;

/// Returns a nul-terminated string owned by the addon.
pub type GetNameFn = unsafe extern "C" fn() -> *const c_char;

/// Returns a nul-terminated string owned by the addon.
pub type GetVersionFn = unsafe extern "C" fn() -> *const c_char;

/// Services the host exposes to addons.
///
/// This is laid out as an object with a single virtual-table pointer so that
/// addons written against the C++ `IHost` interface can call it directly.
#[repr(C)]
pub struct Host {
    pub vtable: *const HostVtable,
}

#[repr(C)]
pub struct HostVtable {
    /// Writes a nul-terminated UTF-16 message to the host's log.
    pub log: unsafe extern "C" fn(this: *mut Host, message: *const u16),
}

impl Host {
    /// Writes `message` to the host log through the virtual table.
    ///
    /// ## Safety
    ///
    /// `this` must point to a live host object and `message` to a
    /// nul-terminated UTF-16 string.
    pub unsafe fn log(this: *mut Host, message: *const u16) {
        unsafe { ((*(*this).vtable).log)(this, message) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_bits_are_stable() {
        assert_eq!(Capabilities::HAS_SETTINGS.bits(), 1);
        assert_eq!(Capabilities::PATCH_HOST_LOGIC.bits(), 8);
        assert_eq!(
            Capabilities::from_bits_truncate(0xFFFF_FFF0 | 0b1001),
            Capabilities::HAS_SETTINGS | Capabilities::PATCH_HOST_LOGIC
        );
    }

    #[test]
    fn export_names_are_nul_terminated() {
        for name in [
            exports::INITIALIZE,
            exports::LEGACY_INITIALIZE,
            exports::SHUTDOWN,
            exports::GET_CAPABILITIES,
            exports::RENDER_SETTINGS,
            exports::INTERCEPT_RESOURCE,
            exports::GET_NAME,
            exports::GET_VERSION,
        ] {
            assert_eq!(name.last(), Some(&0));
            assert!(!name[..name.len() - 1].contains(&0));
        }
    }

    #[test]
    fn host_object_is_a_single_pointer() {
        assert_eq!(size_of::<Host>(), size_of::<usize>());
    }
}
