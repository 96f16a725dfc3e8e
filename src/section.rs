//! The section table of an image.
//!
//! Sections are decoded once when the image is opened and never change afterwards. The table
//! keeps them ordered by virtual address so RVA lookups can binary search it.

use log::warn;

use crate::Error;
use crate::headers::{ImageSectionHeader, SectionCharacteristics};
use crate::types::{Offset, RVA};

/// A named region of the image with distinct virtual and raw extents.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Section {
    pub name: String,
    pub virtual_address: RVA,
    pub virtual_size: u32,
    pub pointer_to_raw_data: Offset,
    pub size_of_raw_data: u32,
    pub characteristics: SectionCharacteristics,
}
impl Section {
    pub fn from_header(header: &ImageSectionHeader) -> Self {
        Self {
            name: header.name_str(),
            virtual_address: header.virtual_address,
            virtual_size: header.virtual_size,
            pointer_to_raw_data: header.pointer_to_raw_data,
            size_of_raw_data: header.size_of_raw_data,
            characteristics: header.characteristics,
        }
    }
    /// The number of bytes the section occupies in memory. Linkers sometimes leave ```VirtualSize```
    /// at zero, in which case the loader falls back to ```SizeOfRawData```.
    pub fn virtual_extent(&self) -> u32 {
        if self.virtual_size == 0 { self.size_of_raw_data } else { self.virtual_size }
    }
    /// The number of bytes the section has on disk that are actually mapped.
    pub fn raw_extent(&self) -> u32 {
        std::cmp::min(self.size_of_raw_data, self.virtual_extent())
    }
    /// The RVA one past the end of this section in memory.
    pub fn virtual_end(&self) -> u64 {
        self.virtual_address.0 as u64 + self.virtual_extent() as u64
    }
    /// Check whether the given RVA falls within ```[VirtualAddress, VirtualAddress+VirtualSize)```.
    pub fn has_rva(&self, rva: RVA) -> bool {
        self.virtual_address.0 <= rva.0 && (rva.0 as u64) < self.virtual_end()
    }
    /// Check whether the given file offset falls within the mapped raw data of this section.
    pub fn has_offset(&self, offset: Offset) -> bool {
        let start = self.pointer_to_raw_data.0 as u64;
        let end = start + self.raw_extent() as u64;

        start <= offset.0 as u64 && (offset.0 as u64) < end
    }
    /// Check whether the given RVA lands in the part of the section past its raw data,
    /// which the loader fills with zeros.
    pub fn is_zero_fill(&self, rva: RVA) -> bool {
        self.has_rva(rva) && (rva.0 - self.virtual_address.0) >= self.raw_extent()
    }
}

/// An ordered, immutable collection of sections.
#[derive(Clone, Default, Debug)]
pub struct SectionTable {
    sections: Vec<Section>,
}
impl SectionTable {
    /// Build a table from raw section headers.
    ///
    /// When ```strict``` is set, headers that are not sorted by virtual address or whose virtual
    /// ranges overlap are rejected with [`Error::BadSectionTable`](Error::BadSectionTable). Otherwise
    /// the sections are sorted and overlaps are only logged.
    pub fn new(headers: &[ImageSectionHeader], strict: bool) -> Result<Self, Error> {
        let mut sections: Vec<Section> = headers.iter().map(Section::from_header).collect();

        let sorted = sections.windows(2).all(|w| w[0].virtual_address <= w[1].virtual_address);

        if !sorted {
            if strict {
                return Err(Error::BadSectionTable("sections are not sorted by virtual address".to_string()));
            }

            warn!("section table is not sorted by virtual address, sorting");
            sections.sort_by_key(|s| s.virtual_address);
        }

        for pair in sections.windows(2) {
            if pair[0].virtual_end() > pair[1].virtual_address.0 as u64 {
                let message = format!(
                    "section {:?} [{}, 0x{:x}) overlaps section {:?} at {}",
                    pair[0].name, pair[0].virtual_address, pair[0].virtual_end(),
                    pair[1].name, pair[1].virtual_address,
                );

                if strict {
                    return Err(Error::BadSectionTable(message));
                }

                warn!("{}", message);
            }
        }

        Ok(Self { sections })
    }
    pub fn len(&self) -> usize {
        self.sections.len()
    }
    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }
    pub fn iter(&self) -> std::slice::Iter<'_, Section> {
        self.sections.iter()
    }
    pub fn get(&self, index: usize) -> Option<&Section> {
        self.sections.get(index)
    }
    /// Find the section containing the given RVA.
    pub fn by_rva(&self, rva: RVA) -> Option<&Section> {
        // last section starting at or before the rva
        let index = self.sections.partition_point(|s| s.virtual_address.0 <= rva.0);

        if index == 0 {
            return None;
        }

        let section = &self.sections[index - 1];

        if section.has_rva(rva) { Some(section) } else { None }
    }
    /// Find the section whose raw data contains the given file offset.
    pub fn by_offset(&self, offset: Offset) -> Option<&Section> {
        self.sections.iter().find(|s| s.has_offset(offset))
    }
    /// Find the first section with the given name, ignoring ASCII case.
    pub fn by_name(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name.eq_ignore_ascii_case(name))
    }
}
impl<'a> IntoIterator for &'a SectionTable {
    type Item = &'a Section;
    type IntoIter = std::slice::Iter<'a, Section>;

    fn into_iter(self) -> Self::IntoIter {
        self.sections.iter()
    }
}
