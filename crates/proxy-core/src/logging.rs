//! Where the proxy's diagnostics end up. The host has no console, so
//! anything a user could report has to reach either a file or a dialog.

use std::any::Any;
use std::fs::{self, File, OpenOptions};
use std::panic::{self, Location};
use std::path::{Path, PathBuf};

use anyhow::Result;
use backtrace::Backtrace;
use chrono::prelude::*;
use log::*;
use simplelog::{
    ColorChoice, CombinedLogger, ConfigBuilder, SharedLogger, TermLogger, TerminalMode,
    WriteLogger,
};

use crate::utils;

const LOG_DIRECTORY: &str = "log";
const LOG_FILE_FORMAT: &str = "resource-proxy-%Y-%m-%d.log";

/// Replaces the panic hook with one that logs the panic and its backtrace,
/// then points the user at the log in a dialog.
pub fn handle_panics() {
    panic::set_hook(Box::new(|info| {
        let summary = describe_panic(info.payload(), info.location());
        error!("{summary}\n{:?}", Backtrace::new());
        message_box(&format!(
            "{summary}\n\nThe full report is in {}.",
            log_directory().display()
        ));
    }));
}

fn describe_panic(payload: &(dyn Any + Send), location: Option<&Location<'_>>) -> String {
    let message = payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string payload");
    match location {
        Some(location) => format!("Resource proxy panicked at {location}: {message}"),
        None => format!("Resource proxy panicked: {message}"),
    }
}

#[cfg(windows)]
fn message_box(message: &str) {
    use windows::Win32::UI::WindowsAndMessaging::{MB_ICONERROR, MessageBoxW};
    use windows::core::{HSTRING, w};

    unsafe { MessageBoxW(None, &HSTRING::from(message), w!("Resource Proxy"), MB_ICONERROR) };
}

#[cfg(not(windows))]
fn message_box(_message: &str) {}

/// The `log` directory next to the host executable, or under the working
/// directory if the executable can't be located.
pub fn log_directory() -> PathBuf {
    utils::host_directory()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(LOG_DIRECTORY)
}

/// Sends warnings to the terminal, if the host has one, and everything from
/// info up to a dated file under [log_directory].
///
/// Failing to open the file only costs the file; failing to install the
/// logger at all means one is already installed.
pub fn start_logger() {
    let directory = log_directory();
    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        LevelFilter::Warn,
        simplelog::Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )];
    let file_error = match open_log_file(&directory) {
        Ok(file) => {
            // Addon messages are logged under their own target, so keep
            // targets visible in the file.
            let config = ConfigBuilder::new()
                .set_target_level(LevelFilter::Error)
                .build();
            loggers.push(WriteLogger::new(LevelFilter::Info, config, file));
            None
        }
        Err(e) => Some(e),
    };
    let _ = CombinedLogger::init(loggers);

    match file_error {
        None => info!("Logging to {}", directory.display()),
        Some(e) => warn!("No log file in {}: {e}", directory.display()),
    }
}

/// Opens today's log file in `directory` for appending, creating both as
/// needed.
fn open_log_file(directory: &Path) -> Result<File> {
    fs::create_dir_all(directory)?;
    let path = directory.join(Local::now().format(LOG_FILE_FORMAT).to_string());
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}
