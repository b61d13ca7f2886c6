//! Logging to the first serial port, mirrored to the UEFI console while boot services are up.
//!
//! Per-module maximum levels come from `tomatboot.toml`. A setting for a module also covers
//! everything nested inside it, and the most specific setting wins.

use core::fmt::Write;
use core::sync::atomic::{AtomicBool, Ordering};

use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};
use spin::{Mutex, Once};
use uart_16550::SerialPort;
use x86_64::instructions::interrupts::without_interrupts;

use crate::config;

const PORT: u16 = 0x3F8;

const COLOR_GREY: &str = "\x1b[90m";
const COLOR_WHITE: &str = "\x1b[37m";
const COLOR_BLUE: &str = "\x1b[34m";
const COLOR_GREEN: &str = "\x1b[32m";
const COLOR_YELLOW: &str = "\x1b[33m";
const COLOR_RED: &str = "\x1b[31m";
const COLOR_NORMAL: &str = "\x1b[0m";

static LOGGER: Once<BootLogger> = Once::new();

pub fn init() -> Result<(), SetLoggerError> {
    let logger = LOGGER.call_once(|| {
        let port = unsafe {
            let mut port = SerialPort::new(PORT);
            port.init();
            port
        };

        BootLogger {
            port: Mutex::new(port),
            console: AtomicBool::new(cfg!(target_os = "uefi")),
        }
    });

    log::set_logger(logger)?;
    log::set_max_level(
        config::log_levels()
            .values()
            .copied()
            .fold(config::default_log_level(), Ord::max),
    );
    Ok(())
}

/// Stops mirroring to the UEFI console, which goes away with boot services
pub fn boot_services_exited() {
    if let Some(logger) = LOGGER.get() {
        logger.console.store(false, Ordering::SeqCst);
    }
}

/// Maximum level for `target`, taken from the longest configured module path that contains it
fn max_level<'a>(
    levels: impl IntoIterator<Item = (&'a str, LevelFilter)>,
    default: LevelFilter,
    target: &str,
) -> LevelFilter {
    levels
        .into_iter()
        .filter(|(module, _)| {
            target == *module
                || (target.starts_with(module) && target[module.len()..].starts_with("::"))
        })
        .max_by_key(|(module, _)| module.len())
        .map_or(default, |(_, level)| level)
}

struct BootLogger {
    port: Mutex<SerialPort>,
    console: AtomicBool,
}

impl BootLogger {
    #[cfg(target_os = "uefi")]
    fn write_console(&self, record: &Record) {
        if self.console.load(Ordering::SeqCst) {
            uefi::system::with_stdout(|stdout| {
                let _ = writeln!(stdout, "[{:>5}] {}", record.level(), record.args());
            });
        }
    }

    #[cfg(not(target_os = "uefi"))]
    fn write_console(&self, _record: &Record) {}
}

impl Log for BootLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        let levels = config::log_levels()
            .entries()
            .map(|(module, level)| (*module, *level));
        metadata.level() <= max_level(levels, config::default_log_level(), metadata.target())
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        without_interrupts(|| {
            let mut w = self.port.lock();

            let level_color = match record.level() {
                Level::Trace => COLOR_WHITE,
                Level::Debug => COLOR_BLUE,
                Level::Info => COLOR_GREEN,
                Level::Warn => COLOR_YELLOW,
                Level::Error => COLOR_RED,
            };

            let _ = write!(
                w,
                "{}[{:<26}]{} ",
                COLOR_GREY,
                record.module_path().unwrap_or(record.target()),
                COLOR_NORMAL
            );
            let _ = write!(w, "{}{:>5}{} ", level_color, record.level(), COLOR_NORMAL);
            let _ = writeln!(w, "{}-{} {}", COLOR_GREY, COLOR_NORMAL, record.args());
        });

        self.write_console(record);
    }

    fn flush(&self) {}
}
