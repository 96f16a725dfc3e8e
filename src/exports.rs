//! The export directory.
//!
//! The directory points at three parallel tables: the address table (one RVA per exported slot),
//! the name pointer table and the ordinal table (one entry per exported name). Joining them gives
//! the named exports; address table slots no name refers to are exported by ordinal only.

use byteorder::{ByteOrder, LittleEndian};

use chrono::{DateTime, Utc};

use log::debug;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::{Error, Result};
use crate::directory::{DataDirectory, DirectoryContent, LoadContext};
use crate::headers::{ImageExportDirectory, RawStructure, timestamp_to_datetime};
use crate::types::*;

/// A single exported symbol.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Export {
    /// The slot in the address table.
    pub index: u32,
    /// The slot in the name pointer table, absent for ordinal-only exports.
    pub name_index: Option<u32>,
    pub function: RVA,
    /// Empty for ordinal-only exports.
    pub name: String,
    pub ordinal: u32,
    /// The ```module.symbol``` this export redirects to, or empty.
    pub forwarder: String,
}
impl Export {
    pub fn is_forwarder(&self) -> bool {
        !self.forwarder.is_empty()
    }
    pub fn is_ordinal_only(&self) -> bool {
        self.name_index.is_none()
    }
}
impl fmt::Display for Export {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X} {:04} {}", self.function.0, self.ordinal, self.name)?;

        if self.is_forwarder() {
            write!(f, " -> {}", self.forwarder)?;
        }

        Ok(())
    }
}

/// The three parallel tables of an export directory, already read out of the image.
#[derive(Clone, Default, Eq, PartialEq, Debug)]
pub struct ExportTables {
    pub functions: Vec<u32>,
    pub names: Vec<RVA>,
    pub ordinals: Vec<u16>,
}

/// Join the export tables into the list of exports, ordered by ordinal.
///
/// ```read_string``` reads the zero-terminated string at an RVA; it is called for every name and
/// every forwarder. Any failure aborts the whole reconstruction.
pub fn reconstruct<F>(directory: &DataDirectory, export_directory: &ImageExportDirectory, tables: &ExportTables, mut read_string: F) -> Result<Vec<Export>>
where
    F: FnMut(RVA) -> Result<String>
{
    if tables.names.len() != tables.ordinals.len() {
        return Err(Error::CorruptExportDirectory(format!(
            "{} names but {} name ordinals", tables.names.len(), tables.ordinals.len(),
        )));
    }

    if tables.names.len() > tables.functions.len() {
        return Err(Error::CorruptExportDirectory(format!(
            "{} names for only {} functions", tables.names.len(), tables.functions.len(),
        )));
    }

    let mut referenced = vec![false; tables.functions.len()];
    let mut result = Vec::<Export>::with_capacity(tables.functions.len());

    for (name_index, (&name_rva, &slot)) in tables.names.iter().zip(tables.ordinals.iter()).enumerate() {
        let slot = slot as usize;

        if slot >= tables.functions.len() {
            return Err(Error::CorruptExportDirectory(format!(
                "name {} refers to ordinal slot {} of {}", name_index, slot, tables.functions.len(),
            )));
        }

        referenced[slot] = true;

        let function = RVA(tables.functions[slot]);
        let name = read_string(name_rva)?;
        let forwarder = forwarder_of(directory, function, &mut read_string)?;

        result.push(Export {
            index: slot as u32,
            name_index: Some(name_index as u32),
            function,
            name,
            ordinal: ordinal_of(export_directory, slot)?,
            forwarder,
        });
    }

    for (slot, &function) in tables.functions.iter().enumerate() {
        if referenced[slot] {
            continue;
        }

        let function = RVA(function);
        let forwarder = forwarder_of(directory, function, &mut read_string)?;

        result.push(Export {
            index: slot as u32,
            name_index: None,
            function,
            name: String::new(),
            ordinal: ordinal_of(export_directory, slot)?,
            forwarder,
        });
    }

    result.sort_by_key(|e| e.ordinal);

    Ok(result)
}

/// A function RVA inside the export directory's own range points at a forwarder string.
fn forwarder_of<F: FnMut(RVA) -> Result<String>>(directory: &DataDirectory, function: RVA, read_string: &mut F) -> Result<String> {
    let end = RVA(std::cmp::min(directory.end(), u32::MAX as u64) as u32);

    match Thunk32(function.0).parse_export(directory.virtual_address, end) {
        ThunkData::ForwarderString(rva) => read_string(rva),
        _ => Ok(String::new()),
    }
}

fn ordinal_of(export_directory: &ImageExportDirectory, slot: usize) -> Result<u32> {
    export_directory.base
        .checked_add(slot as u32)
        .ok_or_else(|| Error::CorruptExportDirectory(format!("ordinal base {} overflows", export_directory.base)))
}

/// Where the export tables sit in the image. A table with no entries has no location.
#[derive(Clone, Default, Eq, PartialEq, Debug)]
pub struct ExportTableLocations {
    pub functions: Option<Location>,
    pub names: Option<Location>,
    pub ordinals: Option<Location>,
    /// One location per name pointer, covering the name string and its terminator.
    pub name_strings: Vec<Location>,
}

/// The decoded export directory.
#[derive(Clone, Debug)]
pub struct ExportContent {
    pub directory: ImageExportDirectory,
    pub location: Location,
    /// The name the module was linked as.
    pub name: String,
    /// The raw tables the exports were joined from.
    pub tables: ExportTables,
    pub table_locations: ExportTableLocations,
    exports: Vec<Export>,
}
impl ExportContent {
    pub fn len(&self) -> usize {
        self.exports.len()
    }
    pub fn is_empty(&self) -> bool {
        self.exports.is_empty()
    }
    pub fn iter(&self) -> std::slice::Iter<'_, Export> {
        self.exports.iter()
    }
    pub fn exports(&self) -> &[Export] {
        &self.exports
    }
    /// Get the export at the given position in ordinal order.
    pub fn get(&self, index: usize) -> Option<&Export> {
        self.exports.get(index)
    }
    /// Find the first export with the given name, ignoring ASCII case.
    pub fn by_name(&self, name: &str) -> Option<&Export> {
        self.exports.iter().find(|e| e.name.eq_ignore_ascii_case(name))
    }
    /// Find the first export with the given name and forwarder, ignoring ASCII case.
    pub fn by_name_and_forwarder(&self, name: &str, forwarder: &str) -> Option<&Export> {
        self.exports.iter().find(|e| e.name.eq_ignore_ascii_case(name) && e.forwarder.eq_ignore_ascii_case(forwarder))
    }
    pub fn by_ordinal(&self, ordinal: u32) -> Option<&Export> {
        self.exports.iter().find(|e| e.ordinal == ordinal)
    }
    pub fn time_date_stamp(&self) -> Option<DateTime<Utc>> {
        timestamp_to_datetime(self.directory.time_date_stamp)
    }
}
impl<'a> IntoIterator for &'a ExportContent {
    type Item = &'a Export;
    type IntoIter = std::slice::Iter<'a, Export>;

    fn into_iter(self) -> Self::IntoIter {
        self.exports.iter()
    }
}

/// Read one of the export tables. A table larger than the directory itself, or one that runs past
/// the end of the file, means the directory is corrupt.
fn read_table(context: &LoadContext<'_>, table: &str, rva: RVA, size: u64) -> Result<(Option<Location>, Vec<u8>)> {
    if size == 0 {
        return Ok((None, Vec::new()));
    }

    if size > context.directory.size as u64 {
        return Err(Error::CorruptExportDirectory(format!(
            "{} table of 0x{:x} bytes exceeds the directory size 0x{:x}", table, size, context.directory.size,
        )));
    }

    let image = context.image;
    let location = image.address_space().locate(rva, size as u32)?;
    let file_end = location.offset.0 as u64 + location.raw_size as u64;

    if file_end > image.len() {
        return Err(Error::CorruptExportDirectory(format!(
            "{} table at {} runs past the end of the file", table, location.offset,
        )));
    }

    context.checkpoint()?;

    let data = image.get_bytes(&location)?;

    Ok((Some(location), data))
}

/// Load the export directory of an image.
pub fn load(context: &LoadContext<'_>) -> Result<DirectoryContent> {
    let image = context.image;
    let directory = &context.directory;

    if (directory.size as usize) < ImageExportDirectory::SIZE {
        return Err(Error::CorruptExportDirectory(format!("directory size 0x{:x} is too small", directory.size)));
    }

    let export_directory = image.read_structure::<ImageExportDirectory>(directory.virtual_address)?;
    let function_count = export_directory.number_of_functions as u64;
    let name_count = export_directory.number_of_names as u64;

    if name_count > function_count {
        return Err(Error::CorruptExportDirectory(format!(
            "{} names for only {} functions", name_count, function_count,
        )));
    }

    let (functions_location, raw_functions) = read_table(context, "address", export_directory.address_of_functions, function_count * 4)?;
    let (names_location, raw_names) = read_table(context, "name pointer", export_directory.address_of_names, name_count * 4)?;
    let (ordinals_location, raw_ordinals) = read_table(context, "ordinal", export_directory.address_of_name_ordinals, name_count * 2)?;

    let mut tables = ExportTables {
        functions: vec![0u32; function_count as usize],
        names: Vec::with_capacity(name_count as usize),
        ordinals: vec![0u16; name_count as usize],
    };

    LittleEndian::read_u32_into(&raw_functions, &mut tables.functions);
    LittleEndian::read_u16_into(&raw_ordinals, &mut tables.ordinals);
    tables.names.extend(raw_names.chunks_exact(4).map(|c| RVA(LittleEndian::read_u32(c))));

    let name = if export_directory.name.0 != 0 {
        image.read_cstring(export_directory.name)?
    }
    else {
        String::new()
    };

    let mut string_sizes = HashMap::<RVA, u32>::new();

    let exports = reconstruct(directory, &export_directory, &tables, |rva| {
        context.checkpoint()?;

        let data = image.read_cstring_bytes(rva)?;
        string_sizes.insert(rva, data.len() as u32 + 1);

        Ok(String::from_utf8_lossy(&data).into_owned())
    })?;

    let name_strings = tables.names
        .iter()
        .map(|&rva| {
            let size = string_sizes.get(&rva).copied().unwrap_or(1);
            image.address_space().locate(rva, size)
        })
        .collect::<Result<Vec<_>>>()?;

    debug!("{:?} exports {} symbols ({} named)", name, exports.len(), name_count);

    Ok(DirectoryContent::Export(Arc::new(ExportContent {
        directory: export_directory,
        location: context.location.clone(),
        name,
        tables,
        table_locations: ExportTableLocations {
            functions: functions_location,
            names: names_location,
            ordinals: ordinals_location,
            name_strings,
        },
        exports,
    })))
}
