use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::{self, JoinHandle};

use anyhow::Result;
use log::*;

use crate::addons::{AddonManager, HostContext};
use crate::interceptor::Interceptor;
use crate::patcher::{ModuleImage, ProtectMemory, patch_code};

/// Instructions in the target module that are overwritten when an addon asks
/// for [addon_api::Capabilities::PATCH_HOST_LOGIC].
#[derive(Debug, Clone, Copy)]
pub struct LogicPatches {
    /// The RVA of every site to overwrite.
    pub sites: &'static [usize],

    /// What each site is overwritten with.
    pub bytes: &'static [u8],
}

/// Everything the proxy has running: the interceptor the hooks talk to, and
/// the addons it consults.
pub struct Proxy {
    interceptor: Arc<Interceptor>,
    addons: Arc<RwLock<AddonManager>>,
    logic_patched: AtomicBool,
}

impl Proxy {
    /// Wires `addons` up as the interceptor's source of overrides.
    pub fn new(interceptor: Arc<Interceptor>, addons: AddonManager) -> Self {
        let addons = Arc::new(RwLock::new(addons));
        interceptor.attach(addons.clone());
        Self {
            interceptor,
            addons,
            logic_patched: AtomicBool::new(false),
        }
    }

    pub fn interceptor(&self) -> &Arc<Interceptor> {
        &self.interceptor
    }

    pub fn addons(&self) -> RwLockReadGuard<'_, AddonManager> {
        self.addons.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn addons_mut(&self) -> RwLockWriteGuard<'_, AddonManager> {
        self.addons.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Loads every enabled addon, then initializes them all.
    pub fn load_and_initialize(&self, context: HostContext) {
        let mut addons = self.addons_mut();
        let count = addons.load_enabled();
        addons.initialize(context);
        info!("{count} addon(s) loaded and initialized");
    }

    /// Reloads every addon. Handles served before the reload no longer
    /// resolve.
    pub fn reload(&self) -> Result<()> {
        let mut addons = self.addons_mut();
        let result = addons.reload();
        self.interceptor.cache().clear();
        result
    }

    pub fn toggle(&self, index: usize, enable: bool) -> Result<()> {
        self.addons_mut().toggle(index, enable)
    }

    pub fn set_show_fps_counter(&self, show: bool) -> Result<()> {
        self.addons_mut().set_show_fps_counter(show)
    }

    /// Applies `patches` to `image` if an enabled addon asks for them and they
    /// haven't been applied yet. Returns how many sites were written.
    ///
    /// ## Safety
    ///
    /// `image` must be the module `patches` was written for, and no thread may
    /// be executing the patched instructions.
    pub unsafe fn apply_logic_patches(
        &self,
        image: &ModuleImage,
        patches: LogicPatches,
        protect: &impl ProtectMemory,
    ) -> usize {
        if !self.addons().wants_logic_patches() || self.logic_patched.swap(true, Ordering::SeqCst)
        {
            return 0;
        }

        let mut count = 0;
        for &rva in patches.sites {
            match unsafe { patch_code(image, rva, patches.bytes, protect) } {
                Ok(()) => count += 1,
                Err(e) => warn!("Logic patch at {rva:#x} failed: {e}"),
            }
        }
        info!("Applied {count} of {} logic patches", patches.sites.len());
        count
    }

    /// Stops intercepting and unloads every addon. Hooks stay in place but
    /// pass everything through.
    pub fn shutdown(&self) {
        self.interceptor.detach();
        self.addons_mut().unload_all();
        info!("Proxy shut down");
    }
}

/// Requests for the addon thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddonCommand {
    Reload,
    Toggle { index: usize, enable: bool },
    SetShowFpsCounter(bool),
    Shutdown,
}

/// The thread that owns every addon. It loads and initializes them when it
/// starts, then runs commands until it's told to shut down or every sender is
/// gone.
pub struct AddonThread {
    sender: Sender<AddonCommand>,
    handle: JoinHandle<()>,
}

impl AddonThread {
    /// Starts the thread. `on_loaded` runs on it once the addons are loaded
    /// and initialized.
    pub fn spawn(
        proxy: Arc<Proxy>,
        context: HostContext,
        on_loaded: impl FnOnce(&Proxy) + Send + 'static,
    ) -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("addons".into())
            .spawn(move || run(&proxy, context, on_loaded, receiver))?;
        Ok(Self { sender, handle })
    }

    /// Returns a handle for sending commands from other threads.
    pub fn sender(&self) -> Sender<AddonCommand> {
        self.sender.clone()
    }

    /// Queues `command`. Returns false if the thread has already exited.
    pub fn send(&self, command: AddonCommand) -> bool {
        self.sender.send(command).is_ok()
    }

    /// Tells the thread to shut down and waits for it.
    pub fn join(self) {
        let _ = self.sender.send(AddonCommand::Shutdown);
        if self.handle.join().is_err() {
            error!("Addon thread panicked");
        }
    }
}

fn run(
    proxy: &Proxy,
    context: HostContext,
    on_loaded: impl FnOnce(&Proxy),
    receiver: Receiver<AddonCommand>,
) {
    info!("Addon thread started");
    proxy.load_and_initialize(context);
    on_loaded(proxy);

    for command in receiver {
        debug!("Addon command: {command:?}");
        let result = match command {
            AddonCommand::Reload => proxy.reload(),
            AddonCommand::Toggle { index, enable } => proxy.toggle(index, enable),
            AddonCommand::SetShowFpsCounter(show) => proxy.set_show_fps_counter(show),
            AddonCommand::Shutdown => break,
        };
        if let Err(e) = result {
            warn!("{command:?} failed: {e:?}");
        }
    }

    proxy.shutdown();
}
