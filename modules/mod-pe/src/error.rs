use core::{
    error::Error as ErrorTrait,
    fmt::{Debug, Display, Formatter},
};

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum PeError {
    /// The buffer ends before the structure being read.
    Truncated,
    /// e_magic is not "MZ".
    BadDosSignature,
    /// The NT signature is not "PE\0\0".
    BadNtSignature,
    /// The optional header magic is neither PE32 nor PE32+.
    BadOptionalMagic,
    /// A data directory points outside the image.
    DirectoryOutOfBounds,
    /// An import descriptor or its thunk list cannot be read.
    BadImportDescriptor,
    /// The export directory arrays cannot be read.
    BadExportDirectory,
}

impl Debug for PeError {
    fn fmt(&self, f: &mut Formatter) -> core::fmt::Result {
        // Delegate to Display
        write!(f, "{}", self)
    }
}

impl Display for PeError {
    fn fmt(&self, f: &mut Formatter) -> core::fmt::Result {
        match self {
            Self::Truncated => write!(f, "Buffer too small for the PE structure being read"),
            Self::BadDosSignature => write!(f, "Invalid DOS signature"),
            Self::BadNtSignature => write!(f, "Invalid NT signature"),
            Self::BadOptionalMagic => write!(f, "Unrecognized optional header magic"),
            Self::DirectoryOutOfBounds => write!(f, "Data directory points outside the image"),
            Self::BadImportDescriptor => write!(f, "Malformed import descriptor"),
            Self::BadExportDirectory => write!(f, "Malformed export directory"),
        }
    }
}

impl ErrorTrait for PeError {}
