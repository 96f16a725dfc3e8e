//! The thread-local storage directory.
//!
//! The 32-bit and 64-bit layouts only differ in pointer width, so both decode into one
//! [`TLSContent`](TLSContent) holding 64-bit fields and the architecture they came from.

use byteorder::{ByteOrder, LittleEndian};

use std::sync::Arc;

use crate::{Error, Result};
use crate::directory::{DirectoryContent, LoadContext};
use crate::headers::*;
use crate::image::Image;
use crate::types::*;

/// The most callbacks read before the callback array is treated as unterminated.
pub const MAX_CALLBACKS: usize = 0x1000;

/// The decoded TLS directory.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct TLSContent {
    pub arch: Arch,
    pub location: Location,
    pub start_address_of_raw_data: u64,
    pub end_address_of_raw_data: u64,
    pub address_of_index: u64,
    pub address_of_callbacks: u64,
    pub size_of_zero_fill: u32,
    pub characteristics: u32,
}
impl TLSContent {
    pub fn from_directory32(directory: &ImageTLSDirectory32, location: Location) -> Self {
        Self {
            arch: Arch::X86,
            location,
            start_address_of_raw_data: directory.start_address_of_raw_data as u64,
            end_address_of_raw_data: directory.end_address_of_raw_data as u64,
            address_of_index: directory.address_of_index as u64,
            address_of_callbacks: directory.address_of_callbacks as u64,
            size_of_zero_fill: directory.size_of_zero_fill,
            characteristics: directory.characteristics,
        }
    }
    pub fn from_directory64(directory: &ImageTLSDirectory64, location: Location) -> Self {
        Self {
            arch: Arch::X64,
            location,
            start_address_of_raw_data: directory.start_address_of_raw_data,
            end_address_of_raw_data: directory.end_address_of_raw_data,
            address_of_index: directory.address_of_index,
            address_of_callbacks: directory.address_of_callbacks,
            size_of_zero_fill: directory.size_of_zero_fill,
            characteristics: directory.characteristics,
        }
    }
    /// Wrap a raw address field as a VA of this directory's width.
    pub fn va(&self, value: u64) -> VA {
        match self.arch {
            Arch::X86 => VA::VA32(VA32(value as u32)),
            Arch::X64 => VA::VA64(VA64(value)),
        }
    }
    pub fn start_address(&self) -> VA {
        self.va(self.start_address_of_raw_data)
    }
    pub fn end_address(&self) -> VA {
        self.va(self.end_address_of_raw_data)
    }
    pub fn index_address(&self) -> VA {
        self.va(self.address_of_index)
    }
    pub fn callbacks_address(&self) -> VA {
        self.va(self.address_of_callbacks)
    }
    /// The size of the TLS template data.
    pub fn raw_data_size(&self) -> u64 {
        self.end_address_of_raw_data.saturating_sub(self.start_address_of_raw_data)
    }
    /// The alignment of the TLS data, taken from the ```IMAGE_SCN_ALIGN_*``` bits of the characteristics.
    pub fn alignment(&self) -> Option<u32> {
        let bits = (self.characteristics & SectionCharacteristics::ALIGN_MASK.bits()) >> 20;

        match bits {
            0 => None,
            n => Some(1 << (n - 1)),
        }
    }
    /// Read the zero-terminated array of callback addresses.
    pub fn callbacks(&self, image: &Image) -> Result<Vec<VA>> {
        let mut result = Vec::<VA>::new();

        if self.address_of_callbacks == 0 {
            return Ok(result);
        }

        let pointer_size = self.arch.pointer_size() as u32;
        let mut rva = image.address_space().rva_of_va(self.callbacks_address())?;

        loop {
            if result.len() >= MAX_CALLBACKS {
                return Err(Error::CorruptDirectory(ImageDirectoryEntry::TLS, "callback array is not terminated".to_string()));
            }

            let data = image.read_rva(rva, pointer_size)?;
            let value = match self.arch {
                Arch::X86 => LittleEndian::read_u32(&data) as u64,
                Arch::X64 => LittleEndian::read_u64(&data),
            };

            if value == 0 {
                break;
            }

            result.push(self.va(value));
            rva = rva.checked_add(pointer_size).ok_or(Error::UnmappedAddress(rva))?;
        }

        Ok(result)
    }
}

/// Load the TLS directory of an image.
pub fn load(context: &LoadContext<'_>) -> Result<DirectoryContent> {
    let image = context.image;
    let directory = &context.directory;

    let required = match image.arch() {
        Arch::X86 => ImageTLSDirectory32::SIZE,
        Arch::X64 => ImageTLSDirectory64::SIZE,
    };

    if (directory.size as usize) < required {
        return Err(Error::CorruptDirectory(
            ImageDirectoryEntry::TLS,
            format!("directory size 0x{:x} is smaller than 0x{:x}", directory.size, required),
        ));
    }

    let content = match image.arch() {
        Arch::X86 => {
            let raw = image.read_structure::<ImageTLSDirectory32>(directory.virtual_address)?;
            TLSContent::from_directory32(&raw, context.location.clone())
        },
        Arch::X64 => {
            let raw = image.read_structure::<ImageTLSDirectory64>(directory.virtual_address)?;
            TLSContent::from_directory64(&raw, context.location.clone())
        },
    };

    Ok(DirectoryContent::TLS(Arc::new(content)))
}
