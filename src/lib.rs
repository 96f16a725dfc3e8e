//! A read-only structural model of Windows Portable Executable images.
//!
//! An [`Image`](Image) is opened over any seekable byte stream. Opening parses the headers and the
//! section table; the content of each data directory is only decoded the first time it is asked
//! for, and is cached from then on.
//!
//! ```no_run
//! use peview::Image;
//!
//! let image = Image::from_file("kernel32.dll").unwrap();
//!
//! if let Some(exports) = image.exports().unwrap() {
//!     for export in exports.iter() {
//!         println!("{}", export);
//!     }
//! }
//! ```

pub mod address;
pub mod buffer;
pub mod clr;
pub mod directory;
pub mod exports;
pub mod headers;
pub mod image;
pub mod imports;
pub mod resources;
pub mod section;
pub mod tls;
pub mod types;

#[cfg(test)]
mod tests;

use std::io;
use std::sync::Arc;

pub use crate::address::AddressSpace;
pub use crate::directory::{CancelToken, ContentStatus, DataDirectory, DirectoryContent, DirectoryContentRegistry};
pub use crate::headers::ImageDirectoryEntry;
pub use crate::image::{Image, ImageOptions};
pub use crate::section::{Section, SectionTable};
pub use crate::types::*;

/// The broad class an [`Error`](Error) falls into.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ErrorKind {
    /// A structure in the image is inconsistent: bad signatures, declared ranges that run out of
    /// bounds, out-of-range ordinals, overlapping sections.
    MalformedStructure,
    /// An address does not belong to any section or to the headers.
    UnmappedAddress,
    /// Reading from the backing stream failed.
    IOFailure,
    /// A load was abandoned through its [`CancelToken`](CancelToken).
    Cancelled,
}

/// Errors produced while reading an image.
///
/// Errors are cheap to clone so that a directory that failed to load can hand back the same
/// error on every later request.
#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(Arc<io::Error>),
    #[error("short read at 0x{offset:x}: expected {expected} bytes, got {actual}")]
    ShortRead { offset: u64, expected: usize, actual: usize },
    #[error("range 0x{start:x}..0x{end:x} is out of bounds (length 0x{len:x})")]
    OutOfBounds { start: u64, end: u64, len: u64 },
    #[error("invalid DOS signature 0x{0:04x}")]
    InvalidDOSSignature(u16),
    #[error("invalid PE signature 0x{0:08x}")]
    InvalidPESignature(u32),
    #[error("invalid optional header magic 0x{0:04x}")]
    InvalidNTSignature(u16),
    #[error("malformed headers: {0}")]
    BadHeaders(String),
    #[error("malformed section table: {0}")]
    BadSectionTable(String),
    #[error("address {0} is not mapped by any section")]
    UnmappedAddress(RVA),
    #[error("range of 0x{size:x} bytes at {rva} runs past the region that maps it")]
    UnmappedRange { rva: RVA, size: u32 },
    #[error("offset {0} is not mapped by any section")]
    UnmappedOffset(Offset),
    #[error("virtual address {0} is outside the image")]
    InvalidVA(VA),
    #[error("corrupt export directory: {0}")]
    CorruptExportDirectory(String),
    #[error("corrupt resource directory at {offset}: {reason}")]
    CorruptResourceDirectory { offset: ResourceOffset, reason: String },
    #[error("corrupt {0:?} directory: {1}")]
    CorruptDirectory(ImageDirectoryEntry, String),
    #[error("incorrect CLR metadata signature 0x{0:08x}")]
    InvalidCLRSignature(u32),
    #[error("string at {0} is not terminated")]
    UnterminatedString(RVA),
    #[error("load cancelled")]
    Cancelled,
}
impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) | Error::ShortRead { .. } => ErrorKind::IOFailure,
            Error::UnmappedAddress(_) | Error::UnmappedRange { .. } | Error::UnmappedOffset(_) | Error::InvalidVA(_) => ErrorKind::UnmappedAddress,
            Error::Cancelled => ErrorKind::Cancelled,
            _ => ErrorKind::MalformedStructure,
        }
    }
}
impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error::Io(Arc::new(error))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
