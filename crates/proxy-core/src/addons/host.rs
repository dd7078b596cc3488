use std::ffi::c_void;
use std::ptr;

use addon_api::{Host, HostVtable};
use log::*;

use crate::resource::wide_str;

/// The UI state handed to addons when they're initialized. Any of these may
/// be null if the host has no UI.
#[derive(Debug, Clone, Copy)]
pub struct HostContext {
    pub ui_context: *mut c_void,
    pub ui_alloc: *mut c_void,
    pub ui_free: *mut c_void,
    pub ui_alloc_user_data: *mut c_void,
}

// Safety: these are opaque to us. Addons are only initialized on the thread
// that owns the UI context, which is the only place they're dereferenced.
unsafe impl Send for HostContext {}
unsafe impl Sync for HostContext {}

impl Default for HostContext {
    fn default() -> Self {
        Self {
            ui_context: ptr::null_mut(),
            ui_alloc: ptr::null_mut(),
            ui_free: ptr::null_mut(),
            ui_alloc_user_data: ptr::null_mut(),
        }
    }
}

static VTABLE: HostVtable = HostVtable { log: log_message };

unsafe extern "C" fn log_message(_this: *mut Host, message: *const u16) {
    if message.is_null() {
        return;
    }
    // Safety: addons pass nul-terminated strings.
    let message = String::from_utf16_lossy(unsafe { wide_str(message) });
    info!(target: "addon", "{message}");
}

/// The [Host] object addons receive. It has a stable address for as long as
/// this lives.
pub(crate) struct HostServices(Box<Host>);

// Safety: the only thing behind the pointer is the immutable static vtable.
unsafe impl Send for HostServices {}
unsafe impl Sync for HostServices {}

impl HostServices {
    pub(crate) fn new() -> Self {
        Self(Box::new(Host { vtable: &VTABLE }))
    }

    pub(crate) fn as_ptr(&self) -> *mut Host {
        ptr::from_ref(&*self.0).cast_mut()
    }
}
