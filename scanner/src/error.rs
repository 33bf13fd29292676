use core::fmt::{Debug, Display, Formatter};
use std::error::Error as ErrorTrait;

use mod_pe::PeError;

pub enum ScanError {
    /// An OS entry point could not be resolved at startup.
    ApiResolution(&'static str),
    /// The scanners only run on Windows targets.
    UnsupportedPlatform,
    /// The on-disk module file could not be read.
    ModuleFile(String),
    /// A remote read returned nothing at this address.
    RemoteRead(u64),
    /// NtQueryVirtualMemory failed for this address.
    RemoteQuery(u64),
    /// The remote module header buffer could not be initialized.
    RemoteHeaderUnavailable,
    /// The on-disk image and the mapped image disagree on bitness.
    BitnessMismatch,
    /// Enumerating the modules of the target process failed.
    ModuleEnumeration,
    /// Opening or sampling a thread failed.
    ThreadAccess(u32),
    /// A PE structure was malformed.
    Pe(PeError),
    /// Writing a report failed.
    Io(std::io::Error),
}

impl Debug for ScanError {
    fn fmt(&self, f: &mut Formatter) -> core::fmt::Result {
        // Delegate to Display
        write!(f, "{}", self)
    }
}

impl Display for ScanError {
    fn fmt(&self, f: &mut Formatter) -> core::fmt::Result {
        match self {
            Self::ApiResolution(name) => write!(f, "Failed to resolve OS entry point: {}", name),
            Self::UnsupportedPlatform => write!(f, "Live scanning requires a Windows target"),
            Self::ModuleFile(path) => write!(f, "Failed to read module file: {}", path),
            Self::RemoteRead(addr) => write!(f, "Failed to read remote memory at {:x}", addr),
            Self::RemoteQuery(addr) => write!(f, "Failed to query remote memory at {:x}", addr),
            Self::RemoteHeaderUnavailable => {
                write!(f, "Failed to initialize remote module header")
            },
            Self::BitnessMismatch => {
                write!(f, "On-disk and in-memory images disagree on bitness")
            },
            Self::ModuleEnumeration => write!(f, "Failed to enumerate process modules"),
            Self::ThreadAccess(tid) => write!(f, "Failed to access thread {}", tid),
            Self::Pe(err) => write!(f, "PE parsing failed: {}", err),
            Self::Io(err) => write!(f, "Report output failed: {}", err),
        }
    }
}

impl ErrorTrait for ScanError {}

impl From<PeError> for ScanError {
    fn from(err: PeError) -> Self { Self::Pe(err) }
}

impl From<std::io::Error> for ScanError {
    fn from(err: std::io::Error) -> Self { Self::Io(err) }
}
