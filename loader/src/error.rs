use alloc::string::String;

use thiserror::Error;
use uefi::Status;

use crate::config::ConfigError;
use crate::ledger::Owner;

/// Reasons a kernel image is rejected. These are all detected before anything is placed in memory,
/// except for [`ImageError::SegmentSizeMismatch`], which is detected per segment.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ImageError {
    #[error("file is too small to hold an ELF header")]
    Truncated,
    #[error("bad ELF magic {0:02x?}")]
    BadMagic([u8; 4]),
    #[error("ELF class {0} is not ELF64")]
    WrongClass(u8),
    #[error("ELF data encoding {0} is not little-endian")]
    WrongByteOrder(u8),
    #[error("ELF type {0} is not an executable")]
    WrongType(u16),
    #[error("ELF machine {0:#x} is not x86-64")]
    WrongMachine(u16),
    #[error("image has no program headers")]
    MissingProgramHeaders,
    #[error("program header entries are {0} bytes, at least 56 are needed")]
    BadProgramHeaderSize(u16),
    #[error("image has no section header table")]
    MissingSectionTable,
    #[error("section header entries are {0} bytes, at least 64 are needed")]
    BadSectionHeaderSize(u16),
    #[error("section name string table index {0} is out of range")]
    MissingStringTable(u16),
    #[error("section name offset {0:#x} is outside the string table")]
    InvalidSectionName(u32),
    #[error("section name at offset {0:#x} is too long")]
    SectionNameTooLong(u32),
    #[error("section {0} not found")]
    SectionNotFound(&'static str),
    #[error("section {name} is {size} bytes, but {expected} are needed")]
    SectionTooSmall {
        name: &'static str,
        size: u64,
        expected: usize,
    },
    #[error("segment at {address:#x} has memory size {memory_size:#x}, file size {file_size:#x}")]
    SegmentSizeMismatch {
        address: u64,
        memory_size: u64,
        file_size: u64,
    },
    #[error("kernel requests mapping type {0}, only identity mappings are supported")]
    UnsupportedMapping(u32),
}

/// Everything that can stop a boot before the kernel is entered
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BootError {
    #[error("invalid kernel image: {0}")]
    Image(#[from] ImageError),
    #[error("invalid boot configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("no boot entries configured")]
    NoEntries,
    #[error("path {0} is too long")]
    PathTooLong(String),
    #[error("could not open {path}: {status:?}")]
    Open { path: String, status: Status },
    #[error("could not read {path}: {status:?}")]
    Io { path: String, status: Status },
    #[error("short read from {path}: wanted {expected} bytes at {offset:#x}, got {actual}")]
    ShortRead {
        path: String,
        offset: u64,
        expected: usize,
        actual: usize,
    },
    #[error("could not place {pages} pages for {owner} at {address:#x}: {status:?}")]
    Placement {
        owner: Owner,
        address: u64,
        pages: usize,
        status: Status,
    },
    #[error("could not allocate {pages} pages for {owner}: {status:?}")]
    Allocation {
        owner: Owner,
        pages: usize,
        status: Status,
    },
    #[error("could not release {pages} pages at {address:#x}: {status:?}")]
    Release {
        address: u64,
        pages: usize,
        status: Status,
    },
    #[error("{protocol} kernels cannot receive boot modules")]
    ModulesUnsupported { protocol: &'static str },
    #[error("{0} boot modules requested, too many to tag")]
    TooManyModules(usize),
    #[error("command line is {length} bytes, at most {max} fit")]
    CommandLineTooLong { length: usize, max: usize },
    #[error("could not read the memory map: {0:?}")]
    MemoryMap(Status),
    #[error("memory map kept growing past {0} bytes")]
    MemoryMapTooLarge(usize),
    #[error("could not exit boot services: {0:?}")]
    ExitBootServices(Status),
}
