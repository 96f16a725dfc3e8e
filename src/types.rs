//! This module contains Rust types to help with the parsing of PE files.

use std::fmt;

use crate::Error;
use crate::address::AddressSpace;
use crate::section::Section;

/// Represents the architecture of the PE image.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Arch {
    X86,
    X64,
}
impl Arch {
    /// The size of a pointer for this architecture, in bytes.
    pub fn pointer_size(&self) -> usize {
        match self {
            Arch::X86 => 4,
            Arch::X64 => 8,
        }
    }
}

/// Represents an object which could be considered an address in a PE file.
pub trait Address {
    /// Convert the address to an offset value.
    fn as_offset(&self, space: &AddressSpace) -> Result<Offset, Error>;
    /// Convert the address to an RVA value.
    fn as_rva(&self, space: &AddressSpace) -> Result<RVA, Error>;
    /// Convert the address to a VA value.
    fn as_va(&self, space: &AddressSpace) -> Result<VA, Error>;
}

/// Represents a file offset in the image. This typically represents an address of the file on disk versus the file in memory.
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Offset(pub u32);
impl Address for Offset {
    fn as_offset(&self, _: &AddressSpace) -> Result<Offset, Error> {
        Ok(*self)
    }
    fn as_rva(&self, space: &AddressSpace) -> Result<RVA, Error> {
        space.rva_of_offset(*self)
    }
    fn as_va(&self, space: &AddressSpace) -> Result<VA, Error> {
        let rva = space.rva_of_offset(*self)?;
        Ok(space.va_of(rva))
    }
}
impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}
impl fmt::LowerHex for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Represents a relative virtual address (i.e., RVA). This address typically points to data in memory versus data on disk.
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct RVA(pub u32);
impl RVA {
    /// Add a byte count to this RVA, returning ```None``` on overflow.
    pub fn checked_add(&self, value: u32) -> Option<RVA> {
        self.0.checked_add(value).map(RVA)
    }
}
impl Address for RVA {
    fn as_offset(&self, space: &AddressSpace) -> Result<Offset, Error> {
        space.rva_to_offset(*self)
    }
    fn as_rva(&self, _: &AddressSpace) -> Result<RVA, Error> {
        Ok(*self)
    }
    fn as_va(&self, space: &AddressSpace) -> Result<VA, Error> {
        Ok(space.va_of(*self))
    }
}
impl fmt::Display for RVA {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}
impl fmt::LowerHex for RVA {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Represents a 32-bit virtual address (i.e., VA). This address typically points directly to active memory.
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash, Debug)]
pub struct VA32(pub u32);
impl Address for VA32 {
    fn as_offset(&self, space: &AddressSpace) -> Result<Offset, Error> {
        VA::VA32(*self).as_offset(space)
    }
    fn as_rva(&self, space: &AddressSpace) -> Result<RVA, Error> {
        space.rva_of_va(VA::VA32(*self))
    }
    fn as_va(&self, _: &AddressSpace) -> Result<VA, Error> {
        Ok(VA::VA32(*self))
    }
}

/// Represents a 64-bit virtual address (i.e., VA). This address typically points directly to active memory.
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash, Debug)]
pub struct VA64(pub u64);
impl Address for VA64 {
    fn as_offset(&self, space: &AddressSpace) -> Result<Offset, Error> {
        VA::VA64(*self).as_offset(space)
    }
    fn as_rva(&self, space: &AddressSpace) -> Result<RVA, Error> {
        space.rva_of_va(VA::VA64(*self))
    }
    fn as_va(&self, _: &AddressSpace) -> Result<VA, Error> {
        Ok(VA::VA64(*self))
    }
}

/// Represents either a 32-bit or a 64-bit virtual address.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum VA {
    VA32(VA32),
    VA64(VA64),
}
impl VA {
    /// Get the address value, widened to 64 bits.
    pub fn as_u64(&self) -> u64 {
        match self {
            VA::VA32(va) => va.0 as u64,
            VA::VA64(va) => va.0,
        }
    }
}
impl Address for VA {
    fn as_offset(&self, space: &AddressSpace) -> Result<Offset, Error> {
        let rva = space.rva_of_va(*self)?;
        space.rva_to_offset(rva)
    }
    fn as_rva(&self, space: &AddressSpace) -> Result<RVA, Error> {
        space.rva_of_va(*self)
    }
    fn as_va(&self, _: &AddressSpace) -> Result<VA, Error> {
        Ok(*self)
    }
}
impl fmt::Display for VA {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VA::VA32(va) => write!(f, "0x{:08x}", va.0),
            VA::VA64(va) => write!(f, "0x{:016x}", va.0),
        }
    }
}

/// A fully-resolved address: where a range of bytes lives both in the file and in memory.
///
/// Locations are produced by [`AddressSpace::locate`](crate::address::AddressSpace::locate) and are
/// plain values; holding one does not keep anything borrowed.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Location {
    pub offset: Offset,
    pub rva: RVA,
    pub va: VA,
    /// The number of bytes the range covers.
    pub size: u32,
    /// The number of bytes of the range backed by file data. Anything past this is zero-fill.
    pub raw_size: u32,
    pub section: Option<Section>,
}
impl Location {
    /// Check whether the given RVA falls within this location.
    pub fn contains(&self, rva: RVA) -> bool {
        self.rva.0 <= rva.0 && (rva.0 as u64) < (self.rva.0 as u64 + self.size as u64)
    }
    /// The RVA one past the end of this location.
    pub fn end(&self) -> u64 {
        self.rva.0 as u64 + self.size as u64
    }
}

/// An enum representing thunk data for imports and exports.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ThunkData {
    ForwarderString(RVA),
    Function(RVA),
    ImportByName(RVA),
    Ordinal(u32),
}
/// Functions to help with thunks in import/export data.
pub trait ThunkFunctions {
    /// Check whether this thunk is an ordinal or not.
    fn is_ordinal(&self) -> bool;
    /// Parse this thunk as an export address table slot. An address inside ```[start, end)```,
    /// the export directory's own range, names a forwarder string.
    fn parse_export(&self, start: RVA, end: RVA) -> ThunkData;
    /// Parse this thunk as an import thunk.
    fn parse_import(&self) -> ThunkData;
}

/// Represents a 32-bit thunk entry.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Thunk32(pub u32);
impl ThunkFunctions for Thunk32 {
    fn is_ordinal(&self) -> bool {
        (self.0 & 0x80000000) != 0
    }
    fn parse_export(&self, start: RVA, end: RVA) -> ThunkData {
        if start.0 <= self.0 && self.0 < end.0 {
            ThunkData::ForwarderString(RVA(self.0))
        }
        else {
            ThunkData::Function(RVA(self.0))
        }
    }
    fn parse_import(&self) -> ThunkData {
        if self.is_ordinal() {
            ThunkData::Ordinal(self.0 & 0xFFFF)
        }
        else {
            ThunkData::ImportByName(RVA(self.0 & 0x7FFFFFFF))
        }
    }
}

/// Represents a 64-bit thunk entry.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Thunk64(pub u64);
impl ThunkFunctions for Thunk64 {
    fn is_ordinal(&self) -> bool {
        (self.0 & 0x8000000000000000) != 0
    }
    fn parse_export(&self, start: RVA, end: RVA) -> ThunkData {
        Thunk32(self.0 as u32).parse_export(start, end)
    }
    fn parse_import(&self) -> ThunkData {
        if self.is_ordinal() {
            ThunkData::Ordinal((self.0 & 0xFFFF) as u32)
        }
        else {
            ThunkData::ImportByName(RVA((self.0 & 0x7FFFFFFF) as u32))
        }
    }
}

/// Abstractly represents a thunk object.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Thunk {
    Thunk32(Thunk32),
    Thunk64(Thunk64),
}
impl Thunk {
    /// Check whether the thunk is the zero entry that terminates a thunk array.
    pub fn is_null(&self) -> bool {
        match self {
            Thunk::Thunk32(t) => t.0 == 0,
            Thunk::Thunk64(t) => t.0 == 0,
        }
    }
    pub fn parse_import(&self) -> ThunkData {
        match self {
            Thunk::Thunk32(t) => t.parse_import(),
            Thunk::Thunk64(t) => t.parse_import(),
        }
    }
}

/// Represents an offset relative to the start of the resource directory.
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct ResourceOffset(pub u32);
impl fmt::Display for ResourceOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "+0x{:x}", self.0)
    }
}

/// The raw identifier of a resource directory entry: either a numeric ID or the offset of its name string.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ResourceDirectoryID {
    ID(u32),
    Name(ResourceOffset),
}

/// What a resource directory entry points at.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ResourceDirectoryData {
    Directory(ResourceOffset),
    Data(ResourceOffset),
}

/// A resource directory identifier with its name string, if any, already decoded.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub enum ResolvedDirectoryID {
    ID(u32),
    Name(String),
}
impl ResolvedDirectoryID {
    /// Compare against a name, ignoring ASCII case. Numeric IDs never match a name.
    pub fn matches_name(&self, name: &str) -> bool {
        match self {
            ResolvedDirectoryID::ID(_) => false,
            ResolvedDirectoryID::Name(n) => n.eq_ignore_ascii_case(name),
        }
    }
}
impl From<u32> for ResolvedDirectoryID {
    fn from(id: u32) -> Self {
        ResolvedDirectoryID::ID(id)
    }
}
impl From<&str> for ResolvedDirectoryID {
    fn from(name: &str) -> Self {
        ResolvedDirectoryID::Name(name.to_string())
    }
}
impl From<ResourceID> for ResolvedDirectoryID {
    fn from(id: ResourceID) -> Self {
        ResolvedDirectoryID::ID(id as u32)
    }
}
impl fmt::Display for ResolvedDirectoryID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolvedDirectoryID::ID(id) => match ResourceID::from_u32(*id) {
                Some(known) => write!(f, "{}", known.name()),
                None => write!(f, "#{}", id),
            },
            ResolvedDirectoryID::Name(name) => write!(f, "{}", name),
        }
    }
}

/// The predefined resource types.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum ResourceID {
    Cursor = 1,
    Bitmap = 2,
    Icon = 3,
    Menu = 4,
    Dialog = 5,
    String = 6,
    FontDir = 7,
    Font = 8,
    Accelerator = 9,
    RCData = 10,
    MessageTable = 11,
    GroupCursor = 12,
    GroupIcon = 14,
    Version = 16,
    DlgInclude = 17,
    PlugPlay = 19,
    VXD = 20,
    AniCursor = 21,
    AniIcon = 22,
    HTML = 23,
    Manifest = 24,
}
impl ResourceID {
    pub fn from_u32(id: u32) -> Option<Self> {
        match id {
            1 => Some(Self::Cursor),
            2 => Some(Self::Bitmap),
            3 => Some(Self::Icon),
            4 => Some(Self::Menu),
            5 => Some(Self::Dialog),
            6 => Some(Self::String),
            7 => Some(Self::FontDir),
            8 => Some(Self::Font),
            9 => Some(Self::Accelerator),
            10 => Some(Self::RCData),
            11 => Some(Self::MessageTable),
            12 => Some(Self::GroupCursor),
            14 => Some(Self::GroupIcon),
            16 => Some(Self::Version),
            17 => Some(Self::DlgInclude),
            19 => Some(Self::PlugPlay),
            20 => Some(Self::VXD),
            21 => Some(Self::AniCursor),
            22 => Some(Self::AniIcon),
            23 => Some(Self::HTML),
            24 => Some(Self::Manifest),
            _ => None,
        }
    }
    /// The conventional ```RT_*``` name of this resource type, without the prefix.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Cursor => "CURSOR",
            Self::Bitmap => "BITMAP",
            Self::Icon => "ICON",
            Self::Menu => "MENU",
            Self::Dialog => "DIALOG",
            Self::String => "STRING",
            Self::FontDir => "FONTDIR",
            Self::Font => "FONT",
            Self::Accelerator => "ACCELERATOR",
            Self::RCData => "RCDATA",
            Self::MessageTable => "MESSAGETABLE",
            Self::GroupCursor => "GROUP_CURSOR",
            Self::GroupIcon => "GROUP_ICON",
            Self::Version => "VERSION",
            Self::DlgInclude => "DLGINCLUDE",
            Self::PlugPlay => "PLUGPLAY",
            Self::VXD => "VXD",
            Self::AniCursor => "ANICURSOR",
            Self::AniIcon => "ANIICON",
            Self::HTML => "HTML",
            Self::Manifest => "MANIFEST",
        }
    }
}
