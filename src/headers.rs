//! This module contains all the headers necessary to parse various aspects of a PE file.
//!
//! Objects taken directly from C are typically prefixed with "Image" and will closely
//! resemble the names of their C counterparts, but named to conform to Rust standards.
//! For example, ```IMAGE_DIRECTORY_ENTRY``` is known as [ImageDirectoryEntry](ImageDirectoryEntry) in
//! this library.
//!
//! Every structure here is an owned copy of the on-disk bytes. They are decoded field by field
//! in little-endian order through the [`RawStructure`](RawStructure) trait, never cast in place.

use bitflags::bitflags;

use byteorder::{LittleEndian, ReadBytesExt};

use chrono::{DateTime, TimeZone, Utc};

use std::io::{self, Cursor, Read};

use crate::Error;
use crate::buffer::padded_string;
use crate::types::*;

pub const DOS_SIGNATURE: u16    = 0x5A4D;
pub const NT_SIGNATURE: u32     = 0x00004550;

pub const HDR32_MAGIC: u16 = 0x010B;
pub const HDR64_MAGIC: u16 = 0x020B;

/// The maximum number of data directories the Windows loader will honor.
pub const MAX_DATA_DIRECTORIES: usize = 16;

/// A structure with a fixed on-disk size that can be decoded from a little-endian byte source.
pub trait RawStructure: Sized {
    /// The size of the structure on disk, in bytes.
    const SIZE: usize;

    /// Decode the structure from the given reader.
    fn read<R: Read>(reader: &mut R) -> io::Result<Self>;

    /// Decode the structure from the start of the given slice. Returns [`Error::OutOfBounds`](Error::OutOfBounds)
    /// if the slice is too short.
    fn from_bytes(data: &[u8]) -> Result<Self, Error> {
        if data.len() < Self::SIZE {
            return Err(Error::OutOfBounds { start: 0, end: Self::SIZE as u64, len: data.len() as u64 });
        }

        let result = Self::read(&mut Cursor::new(data))?;
        Ok(result)
    }
}

/// Convert a PE ```TimeDateStamp``` field into a UTC timestamp.
pub fn timestamp_to_datetime(time_date_stamp: u32) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(time_date_stamp as i64, 0).single()
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct ImageDOSHeader {
    pub e_magic: u16,
    pub e_cblp: u16,
    pub e_cp: u16,
    pub e_crlc: u16,
    pub e_cparhdr: u16,
    pub e_minalloc: u16,
    pub e_maxalloc: u16,
    pub e_ss: u16,
    pub e_sp: u16,
    pub e_csum: u16,
    pub e_ip: u16,
    pub e_cs: u16,
    pub e_lfarlc: u16,
    pub e_ovno: u16,
    pub e_res: [u16; 4],
    pub e_oemid: u16,
    pub e_oeminfo: u16,
    pub e_res2: [u16; 10],
    pub e_lfanew: Offset,
}
impl RawStructure for ImageDOSHeader {
    const SIZE: usize = 64;

    fn read<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut header = Self::default();

        header.e_magic = reader.read_u16::<LittleEndian>()?;
        header.e_cblp = reader.read_u16::<LittleEndian>()?;
        header.e_cp = reader.read_u16::<LittleEndian>()?;
        header.e_crlc = reader.read_u16::<LittleEndian>()?;
        header.e_cparhdr = reader.read_u16::<LittleEndian>()?;
        header.e_minalloc = reader.read_u16::<LittleEndian>()?;
        header.e_maxalloc = reader.read_u16::<LittleEndian>()?;
        header.e_ss = reader.read_u16::<LittleEndian>()?;
        header.e_sp = reader.read_u16::<LittleEndian>()?;
        header.e_csum = reader.read_u16::<LittleEndian>()?;
        header.e_ip = reader.read_u16::<LittleEndian>()?;
        header.e_cs = reader.read_u16::<LittleEndian>()?;
        header.e_lfarlc = reader.read_u16::<LittleEndian>()?;
        header.e_ovno = reader.read_u16::<LittleEndian>()?;
        reader.read_u16_into::<LittleEndian>(&mut header.e_res)?;
        header.e_oemid = reader.read_u16::<LittleEndian>()?;
        header.e_oeminfo = reader.read_u16::<LittleEndian>()?;
        reader.read_u16_into::<LittleEndian>(&mut header.e_res2)?;
        header.e_lfanew = Offset(reader.read_u32::<LittleEndian>()?);

        Ok(header)
    }
}

bitflags! {
    /// A bitflag structure representing file characteristics in the file header.
    pub struct FileCharacteristics: u16 {
        const RELOCS_STRIPPED         = 0x0001;
        const EXECUTABLE_IMAGE        = 0x0002;
        const LINE_NUMS_STRIPPED      = 0x0004;
        const LOCAL_SYMS_STRIPPED     = 0x0008;
        const AGGRESSIVE_WS_TRIM      = 0x0010;
        const LARGE_ADDRESS_AWARE     = 0x0020;
        const BYTES_REVERSED_LO       = 0x0080;
        const MACHINE_32BIT           = 0x0100;
        const DEBUG_STRIPPED          = 0x0200;
        const REMOVABLE_RUN_FROM_SWAP = 0x0400;
        const NET_RUN_FROM_SWAP       = 0x0800;
        const SYSTEM                  = 0x1000;
        const DLL                     = 0x2000;
        const UP_SYSTEM_ONLY          = 0x4000;
        const BYTES_REVERSED_HI       = 0x8000;
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct ImageFileHeader {
    pub machine: u16,
    pub number_of_sections: u16,
    pub time_date_stamp: u32,
    pub pointer_to_symbol_table: Offset,
    pub number_of_symbols: u32,
    pub size_of_optional_header: u16,
    pub characteristics: FileCharacteristics,
}
impl RawStructure for ImageFileHeader {
    const SIZE: usize = 20;

    fn read<R: Read>(reader: &mut R) -> io::Result<Self> {
        Ok(Self {
            machine: reader.read_u16::<LittleEndian>()?,
            number_of_sections: reader.read_u16::<LittleEndian>()?,
            time_date_stamp: reader.read_u32::<LittleEndian>()?,
            pointer_to_symbol_table: Offset(reader.read_u32::<LittleEndian>()?),
            number_of_symbols: reader.read_u32::<LittleEndian>()?,
            size_of_optional_header: reader.read_u16::<LittleEndian>()?,
            characteristics: FileCharacteristics::from_bits_truncate(reader.read_u16::<LittleEndian>()?),
        })
    }
}

bitflags! {
    /// A series of bitflags representing DLL characteristics.
    pub struct DLLCharacteristics: u16 {
        const HIGH_ENTROPY_VA       = 0x0020;
        const DYNAMIC_BASE          = 0x0040;
        const FORCE_INTEGRITY       = 0x0080;
        const NX_COMPAT             = 0x0100;
        const NO_ISOLATION          = 0x0200;
        const NO_SEH                = 0x0400;
        const NO_BIND               = 0x0800;
        const APPCONTAINER          = 0x1000;
        const WDM_DRIVER            = 0x2000;
        const GUARD_CF              = 0x4000;
        const TERMINAL_SERVER_AWARE = 0x8000;
    }
}

/// The fixed part of the 32-bit optional header. The data directory array that follows it
/// is variable-sized and parsed separately.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct ImageOptionalHeader32 {
    pub magic: u16,
    pub major_linker_version: u8,
    pub minor_linker_version: u8,
    pub size_of_code: u32,
    pub size_of_initialized_data: u32,
    pub size_of_uninitialized_data: u32,
    pub address_of_entry_point: RVA,
    pub base_of_code: RVA,
    pub base_of_data: RVA,
    pub image_base: u32,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub major_operating_system_version: u16,
    pub minor_operating_system_version: u16,
    pub major_image_version: u16,
    pub minor_image_version: u16,
    pub major_subsystem_version: u16,
    pub minor_subsystem_version: u16,
    pub win32_version_value: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub checksum: u32,
    pub subsystem: u16,
    pub dll_characteristics: DLLCharacteristics,
    pub size_of_stack_reserve: u32,
    pub size_of_stack_commit: u32,
    pub size_of_heap_reserve: u32,
    pub size_of_heap_commit: u32,
    pub loader_flags: u32,
    pub number_of_rva_and_sizes: u32,
}
impl RawStructure for ImageOptionalHeader32 {
    const SIZE: usize = 96;

    fn read<R: Read>(reader: &mut R) -> io::Result<Self> {
        Ok(Self {
            magic: reader.read_u16::<LittleEndian>()?,
            major_linker_version: reader.read_u8()?,
            minor_linker_version: reader.read_u8()?,
            size_of_code: reader.read_u32::<LittleEndian>()?,
            size_of_initialized_data: reader.read_u32::<LittleEndian>()?,
            size_of_uninitialized_data: reader.read_u32::<LittleEndian>()?,
            address_of_entry_point: RVA(reader.read_u32::<LittleEndian>()?),
            base_of_code: RVA(reader.read_u32::<LittleEndian>()?),
            base_of_data: RVA(reader.read_u32::<LittleEndian>()?),
            image_base: reader.read_u32::<LittleEndian>()?,
            section_alignment: reader.read_u32::<LittleEndian>()?,
            file_alignment: reader.read_u32::<LittleEndian>()?,
            major_operating_system_version: reader.read_u16::<LittleEndian>()?,
            minor_operating_system_version: reader.read_u16::<LittleEndian>()?,
            major_image_version: reader.read_u16::<LittleEndian>()?,
            minor_image_version: reader.read_u16::<LittleEndian>()?,
            major_subsystem_version: reader.read_u16::<LittleEndian>()?,
            minor_subsystem_version: reader.read_u16::<LittleEndian>()?,
            win32_version_value: reader.read_u32::<LittleEndian>()?,
            size_of_image: reader.read_u32::<LittleEndian>()?,
            size_of_headers: reader.read_u32::<LittleEndian>()?,
            checksum: reader.read_u32::<LittleEndian>()?,
            subsystem: reader.read_u16::<LittleEndian>()?,
            dll_characteristics: DLLCharacteristics::from_bits_truncate(reader.read_u16::<LittleEndian>()?),
            size_of_stack_reserve: reader.read_u32::<LittleEndian>()?,
            size_of_stack_commit: reader.read_u32::<LittleEndian>()?,
            size_of_heap_reserve: reader.read_u32::<LittleEndian>()?,
            size_of_heap_commit: reader.read_u32::<LittleEndian>()?,
            loader_flags: reader.read_u32::<LittleEndian>()?,
            number_of_rva_and_sizes: reader.read_u32::<LittleEndian>()?,
        })
    }
}

/// The fixed part of the 64-bit optional header.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct ImageOptionalHeader64 {
    pub magic: u16,
    pub major_linker_version: u8,
    pub minor_linker_version: u8,
    pub size_of_code: u32,
    pub size_of_initialized_data: u32,
    pub size_of_uninitialized_data: u32,
    pub address_of_entry_point: RVA,
    pub base_of_code: RVA,
    pub image_base: u64,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub major_operating_system_version: u16,
    pub minor_operating_system_version: u16,
    pub major_image_version: u16,
    pub minor_image_version: u16,
    pub major_subsystem_version: u16,
    pub minor_subsystem_version: u16,
    pub win32_version_value: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub checksum: u32,
    pub subsystem: u16,
    pub dll_characteristics: DLLCharacteristics,
    pub size_of_stack_reserve: u64,
    pub size_of_stack_commit: u64,
    pub size_of_heap_reserve: u64,
    pub size_of_heap_commit: u64,
    pub loader_flags: u32,
    pub number_of_rva_and_sizes: u32,
}
impl RawStructure for ImageOptionalHeader64 {
    const SIZE: usize = 112;

    fn read<R: Read>(reader: &mut R) -> io::Result<Self> {
        Ok(Self {
            magic: reader.read_u16::<LittleEndian>()?,
            major_linker_version: reader.read_u8()?,
            minor_linker_version: reader.read_u8()?,
            size_of_code: reader.read_u32::<LittleEndian>()?,
            size_of_initialized_data: reader.read_u32::<LittleEndian>()?,
            size_of_uninitialized_data: reader.read_u32::<LittleEndian>()?,
            address_of_entry_point: RVA(reader.read_u32::<LittleEndian>()?),
            base_of_code: RVA(reader.read_u32::<LittleEndian>()?),
            image_base: reader.read_u64::<LittleEndian>()?,
            section_alignment: reader.read_u32::<LittleEndian>()?,
            file_alignment: reader.read_u32::<LittleEndian>()?,
            major_operating_system_version: reader.read_u16::<LittleEndian>()?,
            minor_operating_system_version: reader.read_u16::<LittleEndian>()?,
            major_image_version: reader.read_u16::<LittleEndian>()?,
            minor_image_version: reader.read_u16::<LittleEndian>()?,
            major_subsystem_version: reader.read_u16::<LittleEndian>()?,
            minor_subsystem_version: reader.read_u16::<LittleEndian>()?,
            win32_version_value: reader.read_u32::<LittleEndian>()?,
            size_of_image: reader.read_u32::<LittleEndian>()?,
            size_of_headers: reader.read_u32::<LittleEndian>()?,
            checksum: reader.read_u32::<LittleEndian>()?,
            subsystem: reader.read_u16::<LittleEndian>()?,
            dll_characteristics: DLLCharacteristics::from_bits_truncate(reader.read_u16::<LittleEndian>()?),
            size_of_stack_reserve: reader.read_u64::<LittleEndian>()?,
            size_of_stack_commit: reader.read_u64::<LittleEndian>()?,
            size_of_heap_reserve: reader.read_u64::<LittleEndian>()?,
            size_of_heap_commit: reader.read_u64::<LittleEndian>()?,
            loader_flags: reader.read_u32::<LittleEndian>()?,
            number_of_rva_and_sizes: reader.read_u32::<LittleEndian>()?,
        })
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct ImageNTHeaders32 {
    pub signature: u32,
    pub file_header: ImageFileHeader,
    pub optional_header: ImageOptionalHeader32,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct ImageNTHeaders64 {
    pub signature: u32,
    pub file_header: ImageFileHeader,
    pub optional_header: ImageOptionalHeader64,
}

/// Represents either a 32-bit or 64-bit NT header.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum NTHeaders {
    NTHeaders32(ImageNTHeaders32),
    NTHeaders64(ImageNTHeaders64),
}
impl NTHeaders {
    pub fn arch(&self) -> Arch {
        match self {
            Self::NTHeaders32(_) => Arch::X86,
            Self::NTHeaders64(_) => Arch::X64,
        }
    }
    pub fn file_header(&self) -> &ImageFileHeader {
        match self {
            Self::NTHeaders32(h32) => &h32.file_header,
            Self::NTHeaders64(h64) => &h64.file_header,
        }
    }
    pub fn image_base(&self) -> u64 {
        match self {
            Self::NTHeaders32(h32) => h32.optional_header.image_base as u64,
            Self::NTHeaders64(h64) => h64.optional_header.image_base,
        }
    }
    pub fn size_of_image(&self) -> u32 {
        match self {
            Self::NTHeaders32(h32) => h32.optional_header.size_of_image,
            Self::NTHeaders64(h64) => h64.optional_header.size_of_image,
        }
    }
    pub fn size_of_headers(&self) -> u32 {
        match self {
            Self::NTHeaders32(h32) => h32.optional_header.size_of_headers,
            Self::NTHeaders64(h64) => h64.optional_header.size_of_headers,
        }
    }
    pub fn entrypoint(&self) -> RVA {
        match self {
            Self::NTHeaders32(h32) => h32.optional_header.address_of_entry_point,
            Self::NTHeaders64(h64) => h64.optional_header.address_of_entry_point,
        }
    }
    /// The number of data directories, rounded down to 16 like the Windows loader does.
    pub fn number_of_rva_and_sizes(&self) -> usize {
        let sizes = match self {
            Self::NTHeaders32(h32) => h32.optional_header.number_of_rva_and_sizes,
            Self::NTHeaders64(h64) => h64.optional_header.number_of_rva_and_sizes,
        };

        std::cmp::min(sizes as usize, MAX_DATA_DIRECTORIES)
    }
    /// The size of the fixed portion of the optional header, i.e. where the data directory array begins.
    pub fn fixed_optional_header_size(&self) -> usize {
        match self {
            Self::NTHeaders32(_) => ImageOptionalHeader32::SIZE,
            Self::NTHeaders64(_) => ImageOptionalHeader64::SIZE,
        }
    }
}

bitflags! {
    /// A series of bitflags representing section characteristics.
    pub struct SectionCharacteristics: u32 {
        const TYPE_NO_PAD            = 0x00000008;
        const CNT_CODE               = 0x00000020;
        const CNT_INITIALIZED_DATA   = 0x00000040;
        const CNT_UNINITIALIZED_DATA = 0x00000080;
        const LNK_OTHER              = 0x00000100;
        const LNK_INFO               = 0x00000200;
        const LNK_REMOVE             = 0x00000800;
        const LNK_COMDAT             = 0x00001000;
        const GPREL                  = 0x00008000;
        const ALIGN_MASK             = 0x00F00000;
        const LNK_NRELOC_OVFL        = 0x01000000;
        const MEM_DISCARDABLE        = 0x02000000;
        const MEM_NOT_CACHED         = 0x04000000;
        const MEM_NOT_PAGED          = 0x08000000;
        const MEM_SHARED             = 0x10000000;
        const MEM_EXECUTE            = 0x20000000;
        const MEM_READ               = 0x40000000;
        const MEM_WRITE              = 0x80000000;
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct ImageSectionHeader {
    pub name: [u8; 8],
    pub virtual_size: u32,
    pub virtual_address: RVA,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: Offset,
    pub pointer_to_relocations: Offset,
    pub pointer_to_linenumbers: Offset,
    pub number_of_relocations: u16,
    pub number_of_linenumbers: u16,
    pub characteristics: SectionCharacteristics,
}
impl ImageSectionHeader {
    /// Get the name of this section, trimmed at the first zero byte.
    pub fn name_str(&self) -> String {
        padded_string(&self.name)
    }
}
impl RawStructure for ImageSectionHeader {
    const SIZE: usize = 40;

    fn read<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut name = [0u8; 8];
        reader.read_exact(&mut name)?;

        Ok(Self {
            name,
            virtual_size: reader.read_u32::<LittleEndian>()?,
            virtual_address: RVA(reader.read_u32::<LittleEndian>()?),
            size_of_raw_data: reader.read_u32::<LittleEndian>()?,
            pointer_to_raw_data: Offset(reader.read_u32::<LittleEndian>()?),
            pointer_to_relocations: Offset(reader.read_u32::<LittleEndian>()?),
            pointer_to_linenumbers: Offset(reader.read_u32::<LittleEndian>()?),
            number_of_relocations: reader.read_u16::<LittleEndian>()?,
            number_of_linenumbers: reader.read_u16::<LittleEndian>()?,
            characteristics: SectionCharacteristics::from_bits_truncate(reader.read_u32::<LittleEndian>()?),
        })
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum ImageDirectoryEntry {
    Export           = 0,
    Import           = 1,
    Resource         = 2,
    Exception        = 3,
    Security         = 4,
    BaseReloc        = 5,
    Debug            = 6,
    Architecture     = 7,
    GlobalPTR        = 8,
    TLS              = 9,
    LoadConfig       = 10,
    BoundImport      = 11,
    IAT              = 12,
    DelayImport      = 13,
    CLRRuntimeHeader = 14,
    Reserved         = 15,
}
impl ImageDirectoryEntry {
    /// Every directory entry, in data directory table order.
    pub const ALL: [ImageDirectoryEntry; MAX_DATA_DIRECTORIES] = [
        Self::Export, Self::Import, Self::Resource, Self::Exception,
        Self::Security, Self::BaseReloc, Self::Debug, Self::Architecture,
        Self::GlobalPTR, Self::TLS, Self::LoadConfig, Self::BoundImport,
        Self::IAT, Self::DelayImport, Self::CLRRuntimeHeader, Self::Reserved,
    ];

    /// Get the directory entry at the given index of the data directory table.
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct ImageDataDirectory {
    pub virtual_address: RVA,
    pub size: u32,
}
impl RawStructure for ImageDataDirectory {
    const SIZE: usize = 8;

    fn read<R: Read>(reader: &mut R) -> io::Result<Self> {
        Ok(Self {
            virtual_address: RVA(reader.read_u32::<LittleEndian>()?),
            size: reader.read_u32::<LittleEndian>()?,
        })
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct ImageExportDirectory {
    pub characteristics: u32,
    pub time_date_stamp: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub name: RVA,
    pub base: u32,
    pub number_of_functions: u32,
    pub number_of_names: u32,
    pub address_of_functions: RVA, // [u32; number_of_functions]
    pub address_of_names: RVA, // [RVA; number_of_names]
    pub address_of_name_ordinals: RVA, // [u16; number_of_names]
}
impl RawStructure for ImageExportDirectory {
    const SIZE: usize = 40;

    fn read<R: Read>(reader: &mut R) -> io::Result<Self> {
        Ok(Self {
            characteristics: reader.read_u32::<LittleEndian>()?,
            time_date_stamp: reader.read_u32::<LittleEndian>()?,
            major_version: reader.read_u16::<LittleEndian>()?,
            minor_version: reader.read_u16::<LittleEndian>()?,
            name: RVA(reader.read_u32::<LittleEndian>()?),
            base: reader.read_u32::<LittleEndian>()?,
            number_of_functions: reader.read_u32::<LittleEndian>()?,
            number_of_names: reader.read_u32::<LittleEndian>()?,
            address_of_functions: RVA(reader.read_u32::<LittleEndian>()?),
            address_of_names: RVA(reader.read_u32::<LittleEndian>()?),
            address_of_name_ordinals: RVA(reader.read_u32::<LittleEndian>()?),
        })
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct ImageImportDescriptor {
    pub original_first_thunk: RVA,
    pub time_date_stamp: u32,
    pub forwarder_chain: u32,
    pub name: RVA,
    pub first_thunk: RVA,
}
impl ImageImportDescriptor {
    /// An all-zero descriptor terminates the import table.
    pub fn is_terminator(&self) -> bool {
        *self == Self::default()
    }
}
impl RawStructure for ImageImportDescriptor {
    const SIZE: usize = 20;

    fn read<R: Read>(reader: &mut R) -> io::Result<Self> {
        Ok(Self {
            original_first_thunk: RVA(reader.read_u32::<LittleEndian>()?),
            time_date_stamp: reader.read_u32::<LittleEndian>()?,
            forwarder_chain: reader.read_u32::<LittleEndian>()?,
            name: RVA(reader.read_u32::<LittleEndian>()?),
            first_thunk: RVA(reader.read_u32::<LittleEndian>()?),
        })
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct ImageResourceDirectory {
    pub characteristics: u32,
    pub time_date_stamp: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub number_of_named_entries: u16,
    pub number_of_id_entries: u16,
}
impl ImageResourceDirectory {
    /// The total number of entries following this header.
    pub fn entries(&self) -> usize {
        self.number_of_named_entries as usize + self.number_of_id_entries as usize
    }
}
impl RawStructure for ImageResourceDirectory {
    const SIZE: usize = 16;

    fn read<R: Read>(reader: &mut R) -> io::Result<Self> {
        Ok(Self {
            characteristics: reader.read_u32::<LittleEndian>()?,
            time_date_stamp: reader.read_u32::<LittleEndian>()?,
            major_version: reader.read_u16::<LittleEndian>()?,
            minor_version: reader.read_u16::<LittleEndian>()?,
            number_of_named_entries: reader.read_u16::<LittleEndian>()?,
            number_of_id_entries: reader.read_u16::<LittleEndian>()?,
        })
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct ImageResourceDirectoryEntry {
    pub name: u32,
    pub offset_to_data: u32,
}
impl ImageResourceDirectoryEntry {
    /// Get the identifier of this entry, which is either a numeric ID or an offset to a name string.
    pub fn get_id(&self) -> ResourceDirectoryID {
        if (self.name & 0x80000000) != 0 {
            ResourceDirectoryID::Name(ResourceOffset(self.name & 0x7FFFFFFF))
        }
        else {
            ResourceDirectoryID::ID(self.name)
        }
    }
    /// Get the data this entry points to, which is either a subdirectory or a data entry.
    pub fn get_data(&self) -> ResourceDirectoryData {
        if (self.offset_to_data & 0x80000000) != 0 {
            ResourceDirectoryData::Directory(ResourceOffset(self.offset_to_data & 0x7FFFFFFF))
        }
        else {
            ResourceDirectoryData::Data(ResourceOffset(self.offset_to_data))
        }
    }
}
impl RawStructure for ImageResourceDirectoryEntry {
    const SIZE: usize = 8;

    fn read<R: Read>(reader: &mut R) -> io::Result<Self> {
        Ok(Self {
            name: reader.read_u32::<LittleEndian>()?,
            offset_to_data: reader.read_u32::<LittleEndian>()?,
        })
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct ImageResourceDataEntry {
    pub offset_to_data: RVA,
    pub size: u32,
    pub code_page: u32,
    pub reserved: u32,
}
impl RawStructure for ImageResourceDataEntry {
    const SIZE: usize = 16;

    fn read<R: Read>(reader: &mut R) -> io::Result<Self> {
        Ok(Self {
            offset_to_data: RVA(reader.read_u32::<LittleEndian>()?),
            size: reader.read_u32::<LittleEndian>()?,
            code_page: reader.read_u32::<LittleEndian>()?,
            reserved: reader.read_u32::<LittleEndian>()?,
        })
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct ImageTLSDirectory32 {
    pub start_address_of_raw_data: u32,
    pub end_address_of_raw_data: u32,
    pub address_of_index: u32,
    pub address_of_callbacks: u32,
    pub size_of_zero_fill: u32,
    pub characteristics: u32,
}
impl RawStructure for ImageTLSDirectory32 {
    const SIZE: usize = 24;

    fn read<R: Read>(reader: &mut R) -> io::Result<Self> {
        Ok(Self {
            start_address_of_raw_data: reader.read_u32::<LittleEndian>()?,
            end_address_of_raw_data: reader.read_u32::<LittleEndian>()?,
            address_of_index: reader.read_u32::<LittleEndian>()?,
            address_of_callbacks: reader.read_u32::<LittleEndian>()?,
            size_of_zero_fill: reader.read_u32::<LittleEndian>()?,
            characteristics: reader.read_u32::<LittleEndian>()?,
        })
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct ImageTLSDirectory64 {
    pub start_address_of_raw_data: u64,
    pub end_address_of_raw_data: u64,
    pub address_of_index: u64,
    pub address_of_callbacks: u64,
    pub size_of_zero_fill: u32,
    pub characteristics: u32,
}
impl RawStructure for ImageTLSDirectory64 {
    const SIZE: usize = 40;

    fn read<R: Read>(reader: &mut R) -> io::Result<Self> {
        Ok(Self {
            start_address_of_raw_data: reader.read_u64::<LittleEndian>()?,
            end_address_of_raw_data: reader.read_u64::<LittleEndian>()?,
            address_of_index: reader.read_u64::<LittleEndian>()?,
            address_of_callbacks: reader.read_u64::<LittleEndian>()?,
            size_of_zero_fill: reader.read_u32::<LittleEndian>()?,
            characteristics: reader.read_u32::<LittleEndian>()?,
        })
    }
}

bitflags! {
    /// Flags of the ```IMAGE_COR20_HEADER``` structure.
    pub struct ComImageFlags: u32 {
        const ILONLY                     = 0x00000001;
        const REQUIRED_32BIT             = 0x00000002;
        const IL_LIBRARY                 = 0x00000004;
        const STRONGNAMESIGNED           = 0x00000008;
        const NATIVE_ENTRYPOINT          = 0x00000010;
        const TRACKDEBUGDATA             = 0x00010000;
        const PREFERRED_32BIT            = 0x00020000;
    }
}

/// Represents an ```IMAGE_COR20_HEADER```, the CLR runtime header.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct ImageCOR20Header {
    pub cb: u32,
    pub major_runtime_version: u16,
    pub minor_runtime_version: u16,
    pub metadata: ImageDataDirectory,
    pub flags: ComImageFlags,
    pub entry_point_token: u32,
    pub resources: ImageDataDirectory,
    pub strong_name_signature: ImageDataDirectory,
    pub code_manager_table: ImageDataDirectory,
    pub vtable_fixups: ImageDataDirectory,
    pub export_address_table_jumps: ImageDataDirectory,
    pub managed_native_header: ImageDataDirectory,
}
impl RawStructure for ImageCOR20Header {
    const SIZE: usize = 72;

    fn read<R: Read>(reader: &mut R) -> io::Result<Self> {
        Ok(Self {
            cb: reader.read_u32::<LittleEndian>()?,
            major_runtime_version: reader.read_u16::<LittleEndian>()?,
            minor_runtime_version: reader.read_u16::<LittleEndian>()?,
            metadata: ImageDataDirectory::read(reader)?,
            flags: ComImageFlags::from_bits_truncate(reader.read_u32::<LittleEndian>()?),
            entry_point_token: reader.read_u32::<LittleEndian>()?,
            resources: ImageDataDirectory::read(reader)?,
            strong_name_signature: ImageDataDirectory::read(reader)?,
            code_manager_table: ImageDataDirectory::read(reader)?,
            vtable_fixups: ImageDataDirectory::read(reader)?,
            export_address_table_jumps: ImageDataDirectory::read(reader)?,
            managed_native_header: ImageDataDirectory::read(reader)?,
        })
    }
}

pub const CLR_METADATA_SIGNATURE: u32 = 0x424A5342;

/// The upper bound on the metadata version string length. The runtime pads it to a multiple
/// of four and never emits more than 255 bytes.
pub const MAX_CLR_VERSION_LENGTH: i32 = 256;

/// Represents the CLR metadata root header that the ```MetaData``` directory of the COR20 header points to.
///
/// Unlike the other structures in this module its size depends on the embedded version string,
/// so it is read with [`CLRMetaDataHeader::read`](CLRMetaDataHeader::read) directly.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct CLRMetaDataHeader {
    pub signature: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub reserved: u32,
    pub version_length: i32,
    pub version: String,
    pub flags: u16,
    pub number_of_streams: u16,
}
impl CLRMetaDataHeader {
    /// Decode the header. The signature is checked before anything past it is read.
    pub fn read<R: Read>(reader: &mut R) -> Result<Self, Error> {
        let signature = reader.read_u32::<LittleEndian>()?;

        if signature != CLR_METADATA_SIGNATURE {
            return Err(Error::InvalidCLRSignature(signature));
        }

        let major_version = reader.read_u16::<LittleEndian>()?;
        let minor_version = reader.read_u16::<LittleEndian>()?;
        let reserved = reader.read_u32::<LittleEndian>()?;
        let version_length = reader.read_i32::<LittleEndian>()?;

        if version_length < 0 || version_length > MAX_CLR_VERSION_LENGTH {
            return Err(Error::CorruptDirectory(
                ImageDirectoryEntry::CLRRuntimeHeader,
                format!("metadata version length {} out of range", version_length),
            ));
        }

        let mut version_bytes = vec![0u8; version_length as usize];
        reader.read_exact(&mut version_bytes)?;

        let version = padded_string(&version_bytes);

        Ok(Self {
            signature,
            major_version,
            minor_version,
            reserved,
            version_length,
            version,
            flags: reader.read_u16::<LittleEndian>()?,
            number_of_streams: reader.read_u16::<LittleEndian>()?,
        })
    }
    /// The number of bytes this header occupies on disk.
    pub fn size(&self) -> usize {
        4 + 2 + 2 + 4 + 4 + self.version_length as usize + 2 + 2
    }
}
