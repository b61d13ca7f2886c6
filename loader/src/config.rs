//! Build-time settings and the boot entry file.
//!
//! The entry file is plain text. A line starting with `:` begins an entry and names it. The
//! following `KEY=VALUE` lines describe it:
//!
//! ```text
//! :TomatOS
//! PROTOCOL=tboot
//! PATH=boot/kernel.elf
//! CMDLINE=quiet
//! MODULE=initrd,boot/initrd.tar
//! ```
//!
//! Blank lines and lines starting with `#` are ignored.
#![allow(clippy::all)]

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use log::{warn, LevelFilter};
use thiserror::Error;

use crate::error::BootError;
use crate::file::File;
use crate::firmware::Firmware;

include!(concat!(env!("OUT_DIR"), "/config.rs"));

/// Longest line accepted in the entry file, in bytes
pub const MAX_LINE_LEN: usize = 255;

pub fn log_levels() -> &'static phf::Map<&'static str, LevelFilter> {
    &LOG_LEVEL_FILTERS
}

pub fn default_log_level() -> LevelFilter {
    DEFAULT_LOG_LEVEL
}

/// Path of the boot entry file on the boot volume
pub fn entries_file() -> &'static str {
    ENTRIES_FILE
}

/// Extra descriptor slots reserved beyond the current memory map size
pub fn memory_map_slack() -> usize {
    MEMORY_MAP_SLACK
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProtocolKind {
    Kboot,
    Tboot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootModule {
    pub tag: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootEntry {
    pub name: String,
    pub protocol: ProtocolKind,
    pub image_path: String,
    pub command_line: String,
    pub modules: Vec<BootModule>,
}

impl BootEntry {
    fn named(name: &str) -> BootEntry {
        BootEntry {
            name: name.to_string(),
            protocol: ProtocolKind::Tboot,
            image_path: String::new(),
            command_line: String::new(),
            modules: Vec::new(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("entry file is not valid UTF-8")]
    NotUtf8,
    #[error("line {0} is longer than 255 bytes")]
    LineTooLong(usize),
    #[error("line {0}: entry name is empty")]
    EmptyName(usize),
    #[error("line {line}: `{key}` appears before any entry")]
    OrphanKey { line: usize, key: String },
    #[error("line {0}: expected KEY=VALUE")]
    MissingValue(usize),
    #[error("line {line}: unknown protocol `{value}`")]
    UnknownProtocol { line: usize, value: String },
    #[error("line {0}: MODULE must be `tag,path`")]
    MalformedModule(usize),
    #[error("entry `{0}` has no PATH")]
    MissingPath(String),
}

/// Parses the entry file. Entries are returned in file order.
pub fn parse_entries(text: &str) -> Result<Vec<BootEntry>, ConfigError> {
    let mut entries: Vec<BootEntry> = Vec::new();

    for (index, raw) in text.split('\n').enumerate() {
        let number = index + 1;
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        if line.len() > MAX_LINE_LEN {
            return Err(ConfigError::LineTooLong(number));
        }
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(name) = line.strip_prefix(':') {
            let name = name.trim();
            if name.is_empty() {
                return Err(ConfigError::EmptyName(number));
            }
            finish_entry(entries.last())?;
            entries.push(BootEntry::named(name));
            continue;
        }

        let (key, value) = line
            .split_once('=')
            .ok_or(ConfigError::MissingValue(number))?;
        let entry = entries.last_mut().ok_or_else(|| ConfigError::OrphanKey {
            line: number,
            key: key.to_string(),
        })?;

        match key {
            "PATH" => entry.image_path = value.to_string(),
            "CMDLINE" => entry.command_line = value.to_string(),
            "PROTOCOL" => {
                entry.protocol = match value {
                    "tboot" => ProtocolKind::Tboot,
                    "kboot" => ProtocolKind::Kboot,
                    other => {
                        return Err(ConfigError::UnknownProtocol {
                            line: number,
                            value: other.to_string(),
                        })
                    }
                }
            }
            "MODULE" => {
                let (tag, path) = value
                    .split_once(',')
                    .ok_or(ConfigError::MalformedModule(number))?;
                if tag.is_empty() || path.is_empty() {
                    return Err(ConfigError::MalformedModule(number));
                }
                entry.modules.push(BootModule {
                    tag: tag.to_string(),
                    path: path.to_string(),
                });
            }
            other => warn!("Ignoring unknown key `{}` on line {}", other, number),
        }
    }

    finish_entry(entries.last())?;
    Ok(entries)
}

fn finish_entry(entry: Option<&BootEntry>) -> Result<(), ConfigError> {
    match entry {
        Some(entry) if entry.image_path.is_empty() => {
            Err(ConfigError::MissingPath(entry.name.clone()))
        }
        _ => Ok(()),
    }
}

/// Reads and parses the entry file from the boot volume
pub fn load_entries<F: Firmware>(firmware: &mut F) -> Result<Vec<BootEntry>, BootError> {
    let mut file = File::open(firmware, entries_file())?;
    let size = file.size()?;
    let mut contents = alloc::vec![0u8; size as usize];
    file.read_exact_at(0, &mut contents)?;

    let text = core::str::from_utf8(&contents).map_err(|_| ConfigError::NotUtf8)?;
    let entries = parse_entries(text)?;
    if entries.is_empty() {
        return Err(BootError::NoEntries);
    }
    Ok(entries)
}
