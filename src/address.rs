//! Translation between file offsets, RVAs and VAs.
//!
//! An [`AddressSpace`](AddressSpace) holds nothing but the section table and the few optional header
//! fields translation depends on, so every method here is a pure function of its inputs.

use crate::Error;
use crate::section::{Section, SectionTable};
use crate::types::*;

/// The address layout of an image.
#[derive(Clone, Debug)]
pub struct AddressSpace {
    pub sections: SectionTable,
    pub arch: Arch,
    pub image_base: u64,
    pub size_of_headers: u32,
    pub size_of_image: u32,
}
impl AddressSpace {
    pub fn new(sections: SectionTable, arch: Arch, image_base: u64, size_of_headers: u32, size_of_image: u32) -> Self {
        Self { sections, arch, image_base, size_of_headers, size_of_image }
    }
    /// Find the section containing the given RVA.
    pub fn section_for(&self, rva: RVA) -> Option<&Section> {
        self.sections.by_rva(rva)
    }
    /// Check whether an RVA belongs to the headers rather than to any section.
    pub fn is_header_region(&self, rva: RVA) -> bool {
        self.section_for(rva).is_none() && rva.0 < self.size_of_headers
    }
    /// Translate an RVA to a file offset relative to the given section, or as a header address
    /// when no section is given.
    ///
    /// An RVA inside the section's virtual range but past its raw data still gets an offset; it
    /// points at the zero-fill region and [`locate`](AddressSpace::locate) reports it as having no
    /// raw bytes.
    pub fn offset_of(&self, section: Option<&Section>, rva: RVA) -> Result<Offset, Error> {
        match section {
            Some(section) => {
                if !section.has_rva(rva) {
                    return Err(Error::UnmappedAddress(rva));
                }

                let delta = rva.0 - section.virtual_address.0;

                section.pointer_to_raw_data.0
                    .checked_add(delta)
                    .map(Offset)
                    .ok_or(Error::UnmappedAddress(rva))
            },
            None => {
                if rva.0 < self.size_of_headers {
                    Ok(Offset(rva.0))
                }
                else {
                    Err(Error::UnmappedAddress(rva))
                }
            },
        }
    }
    /// Translate an RVA to a file offset.
    pub fn rva_to_offset(&self, rva: RVA) -> Result<Offset, Error> {
        self.offset_of(self.section_for(rva), rva)
    }
    /// Translate an RVA to a VA. The width of the result follows the image's architecture.
    pub fn va_of(&self, rva: RVA) -> VA {
        match self.arch {
            Arch::X86 => VA::VA32(VA32((self.image_base as u32).wrapping_add(rva.0))),
            Arch::X64 => VA::VA64(VA64(self.image_base.wrapping_add(rva.0 as u64))),
        }
    }
    /// Translate a VA back to an RVA.
    pub fn rva_of_va(&self, va: VA) -> Result<RVA, Error> {
        let value = va.as_u64();

        if value < self.image_base {
            return Err(Error::InvalidVA(va));
        }

        let delta = value - self.image_base;

        if delta > u32::MAX as u64 {
            return Err(Error::InvalidVA(va));
        }

        Ok(RVA(delta as u32))
    }
    /// Translate a file offset back to an RVA.
    pub fn rva_of_offset(&self, offset: Offset) -> Result<RVA, Error> {
        if let Some(section) = self.sections.by_offset(offset) {
            let delta = offset.0 - section.pointer_to_raw_data.0;

            return Ok(RVA(section.virtual_address.0 + delta));
        }

        if offset.0 < self.size_of_headers {
            Ok(RVA(offset.0))
        }
        else {
            Err(Error::UnmappedOffset(offset))
        }
    }
    /// The number of bytes from the given RVA to the end of the region that maps it: the end of
    /// its section in memory, or the end of the headers.
    pub fn mapped_remainder(&self, rva: RVA) -> Result<u32, Error> {
        match self.section_for(rva) {
            Some(section) => Ok((section.virtual_end() - rva.0 as u64) as u32),
            None if rva.0 < self.size_of_headers => Ok(self.size_of_headers - rva.0),
            None => Err(Error::UnmappedAddress(rva)),
        }
    }
    /// Resolve a range of ```size``` bytes starting at the given RVA.
    ///
    /// The returned location's ```raw_size``` is the number of leading bytes that come from the
    /// file; the rest of the range is zero-fill. The whole range must lie in one section, or in the
    /// headers.
    pub fn locate(&self, rva: RVA, size: u32) -> Result<Location, Error> {
        let section = self.section_for(rva);
        let offset = self.offset_of(section, rva)?;

        if size > self.mapped_remainder(rva)? {
            return Err(Error::UnmappedRange { rva, size });
        }

        let raw_size = match section {
            Some(section) => {
                let delta = rva.0 - section.virtual_address.0;
                std::cmp::min(size, section.raw_extent().saturating_sub(delta))
            },
            None => size,
        };

        Ok(Location {
            offset,
            rva,
            va: self.va_of(rva),
            size,
            raw_size,
            section: section.cloned(),
        })
    }
}
