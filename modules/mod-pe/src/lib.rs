#![no_std]
//! # mod-pe
//!
//! PE image parsing over untrusted byte buffers. The same code reads
//! on-disk files (raw section layout) and memory-mapped module images
//! (virtual layout); every access is bounds-checked so a truncated or
//! hostile image can never take the scanner down with it.

extern crate alloc;

pub mod error;
pub mod exports;
pub mod headers;
pub mod imports;

pub use error::PeError;
pub use exports::{enumerate_exports, ExportEntry};
pub use headers::{Layout, PeHeaders, PeImage};
pub use imports::{enumerate_imports, ImportEntry};
