#![no_std]
//! # Kagami Win32
//!
//! NT and Win32 definitions needed by the Kagami scanners: PE file-format
//! structures, thread/memory information classes, and tables of function
//! pointers that are resolved at runtime from `ntdll`, `kernel32` and
//! `dbghelp` instead of being linked at build time.

pub mod dbghelp;
pub mod kernel32;
pub mod ntapi;
pub mod ntdef;
pub mod ntstatus;
pub mod utils;
