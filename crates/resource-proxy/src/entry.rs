use std::ffi::c_void;
use std::sync::OnceLock;

use proxy_core::Runtime;
use windows::Win32::Foundation::HINSTANCE;
use windows::Win32::System::LibraryLoader::DisableThreadLibraryCalls;
use windows::Win32::System::SystemServices::{DLL_PROCESS_ATTACH, DLL_PROCESS_DETACH};

use crate::target;

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// The entrypoint called when the DLL is loaded and unloaded.
///
/// On load this loads the original module, rebinds its resource imports and
/// starts the addon thread. Addons themselves are loaded on that thread, since
/// loading libraries under the loader lock is asking for deadlocks.
#[unsafe(no_mangle)]
extern "system" fn DllMain(hmodule: HINSTANCE, call_reason: u32, reserved: *mut c_void) -> bool {
    match call_reason {
        DLL_PROCESS_ATTACH => {
            let _ = unsafe { DisableThreadLibraryCalls(hmodule.into()) };
            proxy_core::handle_panics();
            proxy_core::start_logger();

            match proxy_core::initialize::<target::LosslessScaling>() {
                Ok(runtime) => {
                    let _ = RUNTIME.set(runtime);
                }
                Err(e) => {
                    log::error!("Resource proxy failed to start: {e:?}");
                    // Without the original module the host can't work at all.
                    return false;
                }
            }
        }
        // When the whole process is exiting, other threads are already gone
        // and modules may already be unmapped, so leave everything be.
        DLL_PROCESS_DETACH if reserved.is_null() => {
            if let Some(runtime) = RUNTIME.get() {
                runtime.shutdown();
            }
        }
        _ => {}
    }
    true
}

/// Returns 1 if the host should draw its FPS counter.
#[unsafe(no_mangle)]
extern "C" fn GetShowFpsCounterProxy() -> i32 {
    RUNTIME
        .get()
        .is_some_and(|runtime| runtime.proxy().addons().show_fps_counter())
        .into()
}
