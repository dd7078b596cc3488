//! Addon modules built from plain Rust functions, for tests.
//!
//! Calls into the fake addons are recorded per thread, so tests running in
//! parallel don't see each other's events.

use std::cell::RefCell;
use std::ffi::{c_char, c_void};
use std::path::Path;
use std::ptr::NonNull;

use addon_api::*;

use super::loader::{AddonModule, ModuleLoader};
use crate::error::AddonError;
use crate::resource::{RT_RCDATA, to_wide};

thread_local! {
    static EVENTS: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

fn record(event: impl Into<String>) {
    EVENTS.with(|events| events.borrow_mut().push(event.into()));
}

/// Returns and forgets everything the fake addons did on this thread.
pub(crate) fn take_events() -> Vec<String> {
    EVENTS.with(|events| events.take())
}

pub(crate) const SHADER_BYTES: &[u8] = b"DXBC-shaders";
pub(crate) const LEGACY_BYTES: &[u8] = b"DXBC-legacy";

pub(crate) struct FakeModule {
    name: &'static str,
    symbols: Vec<(&'static [u8], usize)>,
}

impl AddonModule for FakeModule {
    fn symbol(&self, name: &[u8]) -> Option<NonNull<c_void>> {
        self.symbols
            .iter()
            .find(|(symbol, _)| *symbol == name)
            .and_then(|(_, address)| NonNull::new(*address as *mut c_void))
    }
}

impl Drop for FakeModule {
    fn drop(&mut self) {
        record(format!("{}:freed", self.name));
    }
}

/// Loads a fake module chosen by the file stem of the path.
pub(crate) struct FakeLoader;

impl ModuleLoader for FakeLoader {
    fn load(&self, path: &Path) -> Result<Box<dyn AddonModule>, AddonError> {
        let module = match path.file_stem().and_then(|s| s.to_str()) {
            Some("shaders") => shaders_module(),
            Some("legacy") => legacy_module(),
            Some("empty") => FakeModule {
                name: "empty",
                symbols: Vec::new(),
            },
            _ => {
                return Err(AddonError::Load {
                    path: path.to_owned(),
                    source: libloading::Error::DlOpenUnknown,
                });
            }
        };
        Ok(Box::new(module))
    }
}

fn is_int(id: *const u16, value: u16) -> bool {
    id as usize == value as usize
}

/// Overrides resources #7 and #8 of type `RT_RCDATA`, and exports everything.
pub(crate) fn shaders_module() -> FakeModule {
    unsafe extern "C" fn initialize(
        host: *mut Host,
        ui_context: *mut c_void,
        _: *mut c_void,
        _: *mut c_void,
        _: *mut c_void,
    ) {
        record(format!("shaders:init:{:#x}", ui_context as usize));
        unsafe { Host::log(host, to_wide("shaders ready").as_ptr()) };
    }

    unsafe extern "C" fn shutdown() {
        record("shaders:shutdown");
    }

    unsafe extern "C" fn capabilities() -> u32 {
        (Capabilities::HAS_SETTINGS | Capabilities::PATCH_HOST_LOGIC).bits()
    }

    unsafe extern "C" fn render_settings() {
        record("shaders:settings");
    }

    unsafe extern "C" fn intercept(
        name: *const u16,
        ty: *const u16,
        out_data: *mut *const c_void,
        out_size: *mut u32,
    ) -> bool {
        if !(is_int(name, 7) || is_int(name, 8)) || !is_int(ty, RT_RCDATA) {
            return false;
        }
        unsafe {
            *out_data = SHADER_BYTES.as_ptr().cast();
            *out_size = SHADER_BYTES.len() as u32;
        }
        true
    }

    unsafe extern "C" fn name() -> *const c_char {
        c"Custom Shaders".as_ptr()
    }

    unsafe extern "C" fn version() -> *const c_char {
        c"1.2.0".as_ptr()
    }

    FakeModule {
        name: "shaders",
        symbols: vec![
            (exports::INITIALIZE, initialize as InitializeFn as usize),
            (exports::SHUTDOWN, shutdown as ShutdownFn as usize),
            (exports::GET_CAPABILITIES, capabilities as GetCapabilitiesFn as usize),
            (exports::RENDER_SETTINGS, render_settings as RenderSettingsFn as usize),
            (exports::INTERCEPT_RESOURCE, intercept as InterceptResourceFn as usize),
            (exports::GET_NAME, name as GetNameFn as usize),
            (exports::GET_VERSION, version as GetVersionFn as usize),
        ],
    }
}

/// Exports only the legacy initializer and an interceptor that claims #7 with
/// no bytes and overrides #8.
pub(crate) fn legacy_module() -> FakeModule {
    unsafe extern "C" fn initialize(
        _: *mut Host,
        _: *mut c_void,
        _: *mut c_void,
        _: *mut c_void,
        _: *mut c_void,
    ) {
        record("legacy:init");
    }

    unsafe extern "C" fn intercept(
        name: *const u16,
        _: *const u16,
        out_data: *mut *const c_void,
        out_size: *mut u32,
    ) -> bool {
        unsafe {
            if is_int(name, 7) {
                *out_data = LEGACY_BYTES.as_ptr().cast();
                *out_size = 0;
                true
            } else if is_int(name, 8) {
                *out_data = LEGACY_BYTES.as_ptr().cast();
                *out_size = LEGACY_BYTES.len() as u32;
                true
            } else {
                false
            }
        }
    }

    FakeModule {
        name: "legacy",
        symbols: vec![
            (exports::LEGACY_INITIALIZE, initialize as InitializeFn as usize),
            (exports::INTERCEPT_RESOURCE, intercept as InterceptResourceFn as usize),
        ],
    }
}
