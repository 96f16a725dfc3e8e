//! The import directory: which modules an image depends on and what it takes from each.

use byteorder::{ByteOrder, LittleEndian};

use log::debug;

use std::sync::Arc;

use crate::{Error, Result};
use crate::directory::{DirectoryContent, LoadContext};
use crate::headers::{ImageDirectoryEntry, ImageImportDescriptor, RawStructure};
use crate::image::Image;
use crate::types::*;

/// The most thunks a single descriptor may have before its thunk array is treated as unterminated.
pub const MAX_THUNKS: usize = 0x10000;

/// One imported function.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum ImportData {
    Ordinal(u32),
    ImportByName { hint: u16, name: String },
}

/// One imported module.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct ImportDescriptor {
    pub descriptor: ImageImportDescriptor,
    pub name: String,
    pub functions: Vec<ImportData>,
}
impl ImportDescriptor {
    /// Find an import by name, ignoring ASCII case.
    pub fn by_name(&self, name: &str) -> Option<&ImportData> {
        self.functions.iter().find(|f| match f {
            ImportData::ImportByName { name: n, .. } => n.eq_ignore_ascii_case(name),
            ImportData::Ordinal(_) => false,
        })
    }
}

/// The decoded import directory.
#[derive(Clone, Debug)]
pub struct ImportContent {
    pub location: Location,
    descriptors: Vec<ImportDescriptor>,
}
impl ImportContent {
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
    pub fn iter(&self) -> std::slice::Iter<'_, ImportDescriptor> {
        self.descriptors.iter()
    }
    pub fn get(&self, index: usize) -> Option<&ImportDescriptor> {
        self.descriptors.get(index)
    }
    /// Find a module by name, ignoring ASCII case.
    pub fn by_name(&self, name: &str) -> Option<&ImportDescriptor> {
        self.descriptors.iter().find(|d| d.name.eq_ignore_ascii_case(name))
    }
}
impl<'a> IntoIterator for &'a ImportContent {
    type Item = &'a ImportDescriptor;
    type IntoIter = std::slice::Iter<'a, ImportDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.descriptors.iter()
    }
}

fn read_thunk(image: &Image, rva: RVA) -> Result<Thunk> {
    let data = image.read_rva(rva, image.arch().pointer_size() as u32)?;

    Ok(match image.arch() {
        Arch::X86 => Thunk::Thunk32(Thunk32(LittleEndian::read_u32(&data))),
        Arch::X64 => Thunk::Thunk64(Thunk64(LittleEndian::read_u64(&data))),
    })
}

fn read_functions(context: &LoadContext<'_>, descriptor: &ImageImportDescriptor) -> Result<Vec<ImportData>> {
    let image = context.image;
    let mut thunk_rva = if descriptor.original_first_thunk.0 != 0 { descriptor.original_first_thunk } else { descriptor.first_thunk };
    let mut result = Vec::<ImportData>::new();

    if thunk_rva.0 == 0 {
        return Ok(result);
    }

    loop {
        if result.len() >= MAX_THUNKS {
            return Err(Error::CorruptDirectory(
                ImageDirectoryEntry::Import,
                format!("thunk array at {} is not terminated", thunk_rva),
            ));
        }

        let thunk = read_thunk(image, thunk_rva)?;

        if thunk.is_null() {
            break;
        }

        let function = match thunk.parse_import() {
            ThunkData::Ordinal(ordinal) => ImportData::Ordinal(ordinal),
            ThunkData::ImportByName(rva) => {
                let hint = image.read_rva(rva, 2)?;
                let name_rva = rva.checked_add(2).ok_or(Error::UnmappedAddress(rva))?;

                ImportData::ImportByName {
                    hint: LittleEndian::read_u16(&hint),
                    name: image.read_cstring(name_rva)?,
                }
            },
            _ => return Err(Error::CorruptDirectory(ImageDirectoryEntry::Import, format!("unexpected thunk at {}", thunk_rva))),
        };

        result.push(function);

        thunk_rva = thunk_rva
            .checked_add(image.arch().pointer_size() as u32)
            .ok_or(Error::UnmappedAddress(thunk_rva))?;
    }

    Ok(result)
}

/// Load the import directory of an image.
pub fn load(context: &LoadContext<'_>) -> Result<DirectoryContent> {
    let image = context.image;
    let directory = &context.directory;
    let count = directory.size as usize / ImageImportDescriptor::SIZE;

    if count == 0 {
        return Err(Error::CorruptDirectory(
            ImageDirectoryEntry::Import,
            format!("directory size 0x{:x} cannot hold a descriptor", directory.size),
        ));
    }

    let mut descriptors = Vec::<ImportDescriptor>::new();

    for index in 0..count {
        context.checkpoint()?;

        let rva = u32::try_from(index * ImageImportDescriptor::SIZE)
            .ok()
            .and_then(|delta| directory.virtual_address.checked_add(delta))
            .ok_or_else(|| Error::CorruptDirectory(
                ImageDirectoryEntry::Import,
                format!("descriptor {} lies past the end of the address space", index),
            ))?;
        let descriptor = image.read_structure::<ImageImportDescriptor>(rva)?;

        if descriptor.is_terminator() {
            break;
        }

        let name = image.read_cstring(descriptor.name)?;
        let functions = read_functions(context, &descriptor)?;

        descriptors.push(ImportDescriptor { descriptor, name, functions });
    }

    debug!("{} imported modules", descriptors.len());

    Ok(DirectoryContent::Import(Arc::new(ImportContent {
        location: context.location.clone(),
        descriptors,
    })))
}
