//! Shared machinery for proxy DLLs that stand in for a host module and let
//! addons override the resources it loads.

pub mod addons;
pub mod cache;
pub mod config;
pub mod error;
pub mod handle;
pub mod hooks;
pub mod interceptor;
mod logging;
pub mod patcher;
pub mod resource;
mod runtime;
mod target;
pub mod utils;

pub use logging::{handle_panics, log_directory, start_logger};
pub use runtime::*;
pub use target::*;
