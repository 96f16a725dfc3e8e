//! The [`Image`](Image) object: a PE file opened over a seekable stream.
//!
//! Opening an image reads the DOS header, the NT headers, the data directory table and the section
//! table. Nothing else is touched until it is asked for. Directory content goes through a
//! [`ContentCache`](crate::directory::ContentCache) so every directory is decoded at most once.

use log::{debug, trace, warn};

use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::{Error, Result};
use crate::address::AddressSpace;
use crate::clr::CLRContent;
use crate::directory::*;
use crate::exports::ExportContent;
use crate::headers::*;
use crate::imports::ImportContent;
use crate::resources::{ResourceContent, ResourceData, ResourceDecoder, ResourceEntry, ResourceLanguage, ResourceRegistry, ResourceType};
use crate::section::SectionTable;
use crate::tls::TLSContent;
use crate::types::*;

/// The default cap on zero-terminated strings read out of an image.
pub const DEFAULT_MAX_STRING_LENGTH: usize = 0x1000;

const STRING_CHUNK: usize = 64;
const SAVE_CHUNK: usize = 0x10000;

/// Anything an image can be read from.
pub trait ReadSeek: Read + Seek {}
impl<T: Read + Seek + ?Sized> ReadSeek for T {}

/// Settings fixed when an image is opened.
#[derive(Clone, Debug)]
pub struct ImageOptions {
    /// Decoders for resource data, keyed by resource type.
    pub resource_registry: ResourceRegistry,
    /// Loaders for directory content, keyed by directory type.
    pub loaders: DirectoryContentRegistry,
    /// Zero-terminated strings longer than this are rejected as unterminated.
    pub max_string_length: usize,
    /// Reject unsorted or overlapping section tables instead of repairing them.
    pub strict_sections: bool,
}
impl ImageOptions {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_resource_registry(mut self, registry: ResourceRegistry) -> Self {
        self.resource_registry = registry;
        self
    }
    pub fn with_loaders(mut self, loaders: DirectoryContentRegistry) -> Self {
        self.loaders = loaders;
        self
    }
    pub fn with_max_string_length(mut self, length: usize) -> Self {
        self.max_string_length = length;
        self
    }
    pub fn with_strict_sections(mut self, strict: bool) -> Self {
        self.strict_sections = strict;
        self
    }
}
impl Default for ImageOptions {
    fn default() -> Self {
        Self {
            resource_registry: ResourceRegistry::default(),
            loaders: DirectoryContentRegistry::default(),
            max_string_length: DEFAULT_MAX_STRING_LENGTH,
            strict_sections: true,
        }
    }
}

/// The backing stream. Every seek and the read that follows it happen under one lock.
struct ImageStream {
    inner: Mutex<Box<dyn ReadSeek + Send>>,
    len: u64,
    reads: AtomicU64,
}
impl ImageStream {
    fn new(mut stream: Box<dyn ReadSeek + Send>) -> Result<Self> {
        let len = stream.seek(SeekFrom::End(0))?;

        Ok(Self {
            inner: Mutex::new(stream),
            len,
            reads: AtomicU64::new(0),
        })
    }
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset + buf.len() as u64;

        if end > self.len {
            return Err(Error::OutOfBounds { start: offset, end, len: self.len });
        }

        let mut stream = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        self.reads.fetch_add(1, Ordering::Relaxed);

        stream.seek(SeekFrom::Start(offset))?;

        let mut filled = 0;

        while filled < buf.len() {
            match stream.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::from(e)),
            }
        }

        if filled != buf.len() {
            return Err(Error::ShortRead { offset, expected: buf.len(), actual: filled });
        }

        trace!("read 0x{:x} bytes at 0x{:x}", buf.len(), offset);

        Ok(())
    }
}

/// A PE image opened for reading.
///
/// An image is `Send + Sync`: any number of threads may request content at the same time.
pub struct Image {
    stream: ImageStream,
    dos_header: ImageDOSHeader,
    nt_headers: NTHeaders,
    section_headers: Vec<ImageSectionHeader>,
    data_directories: Vec<ImageDataDirectory>,
    address_space: AddressSpace,
    loaders: DirectoryContentRegistry,
    cache: ContentCache,
    resource_registry: RwLock<Arc<ResourceRegistry>>,
    max_string_length: usize,
}
impl Image {
    /// Open an image over the given stream with default options.
    pub fn open<R: Read + Seek + Send + 'static>(stream: R) -> Result<Self> {
        Self::with_options(stream, ImageOptions::default())
    }
    /// Open an image from a file on disk.
    pub fn from_file<P: AsRef<Path>>(filename: P) -> Result<Self> {
        let file = File::open(filename)?;
        Self::open(file)
    }
    /// Open an image over an in-memory copy of the given data.
    pub fn from_data(data: &[u8]) -> Result<Self> {
        Self::open(Cursor::new(data.to_vec()))
    }
    /// Open an image over the given stream.
    ///
    /// This validates the DOS signature, the PE signature and the optional header magic, reads the
    /// data directory table and builds the section table.
    pub fn with_options<R: Read + Seek + Send + 'static>(stream: R, options: ImageOptions) -> Result<Self> {
        let stream = ImageStream::new(Box::new(stream))?;

        let dos_header = read_structure::<ImageDOSHeader>(&stream, 0)?;

        if dos_header.e_magic != DOS_SIGNATURE {
            return Err(Error::InvalidDOSSignature(dos_header.e_magic));
        }

        let e_lfanew = dos_header.e_lfanew.0 as u64;

        let mut signature = [0u8; 4];
        stream.read_at(e_lfanew, &mut signature)?;
        let signature = u32::from_le_bytes(signature);

        if signature != NT_SIGNATURE {
            return Err(Error::InvalidPESignature(signature));
        }

        let file_header_offset = e_lfanew + 4;
        let file_header = read_structure::<ImageFileHeader>(&stream, file_header_offset)?;
        let optional_offset = file_header_offset + ImageFileHeader::SIZE as u64;

        let mut magic = [0u8; 2];
        stream.read_at(optional_offset, &mut magic)?;
        let magic = u16::from_le_bytes(magic);

        let nt_headers = match magic {
            HDR32_MAGIC => NTHeaders::NTHeaders32(ImageNTHeaders32 {
                signature,
                file_header,
                optional_header: read_structure::<ImageOptionalHeader32>(&stream, optional_offset)?,
            }),
            HDR64_MAGIC => NTHeaders::NTHeaders64(ImageNTHeaders64 {
                signature,
                file_header,
                optional_header: read_structure::<ImageOptionalHeader64>(&stream, optional_offset)?,
            }),
            _ => return Err(Error::InvalidNTSignature(magic)),
        };

        let size_of_optional = file_header.size_of_optional_header as usize;
        let fixed_size = nt_headers.fixed_optional_header_size();

        if size_of_optional < fixed_size {
            return Err(Error::BadHeaders(format!(
                "optional header size 0x{:x} is smaller than its fixed part (0x{:x})", size_of_optional, fixed_size,
            )));
        }

        let mut directory_count = nt_headers.number_of_rva_and_sizes();
        let directory_room = (size_of_optional - fixed_size) / ImageDataDirectory::SIZE;

        if directory_count > directory_room {
            warn!("NumberOfRvaAndSizes exceeds the optional header, truncating to {}", directory_room);
            directory_count = directory_room;
        }

        let mut raw_directories = vec![0u8; directory_count * ImageDataDirectory::SIZE];
        stream.read_at(optional_offset + fixed_size as u64, &mut raw_directories)?;

        let data_directories = raw_directories
            .chunks_exact(ImageDataDirectory::SIZE)
            .map(ImageDataDirectory::from_bytes)
            .collect::<Result<Vec<_>>>()?;

        let section_count = file_header.number_of_sections as usize;
        let mut raw_sections = vec![0u8; section_count * ImageSectionHeader::SIZE];
        stream.read_at(optional_offset + size_of_optional as u64, &mut raw_sections)?;

        let section_headers = raw_sections
            .chunks_exact(ImageSectionHeader::SIZE)
            .map(ImageSectionHeader::from_bytes)
            .collect::<Result<Vec<_>>>()?;

        let sections = SectionTable::new(&section_headers, options.strict_sections)?;

        let address_space = AddressSpace::new(
            sections,
            nt_headers.arch(),
            nt_headers.image_base(),
            nt_headers.size_of_headers(),
            nt_headers.size_of_image(),
        );

        debug!(
            "opened {:?} image: base 0x{:x}, {} sections, {} data directories",
            address_space.arch, address_space.image_base, section_count, data_directories.len(),
        );

        Ok(Self {
            stream,
            dos_header,
            nt_headers,
            section_headers,
            data_directories,
            address_space,
            loaders: options.loaders,
            cache: ContentCache::new(),
            resource_registry: RwLock::new(Arc::new(options.resource_registry)),
            max_string_length: options.max_string_length,
        })
    }

    pub fn dos_header(&self) -> &ImageDOSHeader {
        &self.dos_header
    }
    /// The MS-DOS stub program between the DOS header and the NT headers. Empty when ```e_lfanew```
    /// points straight past the DOS header.
    pub fn dos_stub(&self) -> Result<Location> {
        let start = ImageDOSHeader::SIZE as u32;
        let size = self.dos_header.e_lfanew.0.saturating_sub(start);

        self.address_space.locate(RVA(start), size)
    }
    pub fn nt_headers(&self) -> &NTHeaders {
        &self.nt_headers
    }
    pub fn arch(&self) -> Arch {
        self.address_space.arch
    }
    pub fn section_headers(&self) -> &[ImageSectionHeader] {
        &self.section_headers
    }
    pub fn sections(&self) -> &SectionTable {
        &self.address_space.sections
    }
    pub fn address_space(&self) -> &AddressSpace {
        &self.address_space
    }
    /// The length of the backing stream in bytes.
    pub fn len(&self) -> u64 {
        self.stream.len
    }
    pub fn is_empty(&self) -> bool {
        self.stream.len == 0
    }
    /// The number of reads issued against the backing stream so far.
    pub fn stream_reads(&self) -> u64 {
        self.stream.reads.load(Ordering::Relaxed)
    }
    pub fn max_string_length(&self) -> usize {
        self.max_string_length
    }

    /// Get the data directory of the given type. Returns ```None``` if the directory table is too short
    /// to contain it. The returned directory may be [empty](DataDirectory::is_empty).
    pub fn directory(&self, entry: ImageDirectoryEntry) -> Option<DataDirectory> {
        self.data_directories.get(entry as usize).map(|d| DataDirectory {
            entry,
            virtual_address: d.virtual_address,
            size: d.size,
        })
    }
    /// Get every data directory present in the table, in table order.
    pub fn directories(&self) -> Vec<DataDirectory> {
        ImageDirectoryEntry::ALL
            .iter()
            .filter_map(|&entry| self.directory(entry))
            .collect()
    }
    /// Get the decoded content of a data directory.
    ///
    /// Returns ```Ok(None)``` when the directory is absent, empty or has no registered loader. The first
    /// successful call decodes the content; later calls return the same shared content. A failed load
    /// returns the same error on every call until [`reload`](Image::reload).
    pub fn content(&self, entry: ImageDirectoryEntry) -> Result<Option<DirectoryContent>> {
        self.content_with_cancel(entry, None)
    }
    /// Like [`content`](Image::content), but the load can be abandoned through ```cancel```. A cancelled
    /// load returns [`Error::Cancelled`](Error::Cancelled) and leaves nothing cached.
    pub fn content_with_cancel(&self, entry: ImageDirectoryEntry, cancel: Option<&CancelToken>) -> Result<Option<DirectoryContent>> {
        let directory = match self.directory(entry) {
            Some(d) if !d.is_empty() => d,
            _ => return Ok(None),
        };

        let loader = match self.loaders.get(entry) {
            Some(l) => l,
            None => return Ok(None),
        };

        let content = self.cache.get_or_load(entry, || {
            let location = self.address_space.locate(directory.virtual_address, directory.size)?;
            let context = LoadContext { image: self, directory, location, cancel };

            context.checkpoint()?;
            loader(&context)
        })?;

        Ok(Some(content))
    }
    /// Discard whatever is cached for a directory and load it again.
    pub fn reload(&self, entry: ImageDirectoryEntry) -> Result<Option<DirectoryContent>> {
        debug!("reloading {:?} content", entry);

        self.cache.reset(entry);
        self.content(entry)
    }
    pub fn content_status(&self, entry: ImageDirectoryEntry) -> ContentStatus {
        self.cache.status(entry)
    }
    pub fn exports(&self) -> Result<Option<Arc<ExportContent>>> {
        let content = self.content(ImageDirectoryEntry::Export)?;
        Ok(content.and_then(|c| c.as_exports().cloned()))
    }
    pub fn imports(&self) -> Result<Option<Arc<ImportContent>>> {
        let content = self.content(ImageDirectoryEntry::Import)?;
        Ok(content.and_then(|c| c.as_imports().cloned()))
    }
    pub fn resources(&self) -> Result<Option<Arc<ResourceContent>>> {
        let content = self.content(ImageDirectoryEntry::Resource)?;
        Ok(content.and_then(|c| c.as_resources().cloned()))
    }
    pub fn tls(&self) -> Result<Option<Arc<TLSContent>>> {
        let content = self.content(ImageDirectoryEntry::TLS)?;
        Ok(content.and_then(|c| c.as_tls().cloned()))
    }
    pub fn clr(&self) -> Result<Option<Arc<CLRContent>>> {
        let content = self.content(ImageDirectoryEntry::CLRRuntimeHeader)?;
        Ok(content.and_then(|c| c.as_clr().cloned()))
    }

    /// Resolve ```size``` bytes at the given address into a [`Location`](Location).
    pub fn location_of<A: Address>(&self, address: A, size: u32) -> Result<Location> {
        let rva = address.as_rva(&self.address_space)?;
        self.address_space.locate(rva, size)
    }
    /// Read bytes straight from the file.
    pub fn read_offset(&self, offset: Offset, size: usize) -> Result<Vec<u8>> {
        let mut result = vec![0u8; size];
        self.stream.read_at(offset.0 as u64, &mut result)?;
        Ok(result)
    }
    /// Read ```size``` bytes of the image as it would appear in memory, starting at the given RVA.
    pub fn read_rva(&self, rva: RVA, size: u32) -> Result<Vec<u8>> {
        let location = self.address_space.locate(rva, size)?;
        self.get_bytes(&location)
    }
    /// Read a structure of the image as it would appear in memory.
    pub fn read_structure<T: RawStructure>(&self, rva: RVA) -> Result<T> {
        let data = self.read_rva(rva, T::SIZE as u32)?;
        T::from_bytes(&data)
    }
    /// Copy the bytes of a location out of the image. The zero-fill part of the range is produced
    /// without touching the stream.
    pub fn get_bytes(&self, location: &Location) -> Result<Vec<u8>> {
        let mut result = vec![0u8; location.size as usize];
        let raw_size = std::cmp::min(location.raw_size, location.size) as usize;

        if raw_size > 0 {
            self.stream.read_at(location.offset.0 as u64, &mut result[..raw_size])?;
        }

        Ok(result)
    }
    /// Stream the bytes of a location into a writer, returning the number of bytes written.
    pub fn save_bytes<W: Write>(&self, location: &Location, writer: &mut W) -> Result<u64> {
        let mut buffer = vec![0u8; SAVE_CHUNK];
        let mut written = 0u64;
        let mut offset = location.offset.0 as u64;
        let mut remaining_raw = std::cmp::min(location.raw_size, location.size) as usize;

        while remaining_raw > 0 {
            let chunk = std::cmp::min(remaining_raw, SAVE_CHUNK);

            self.stream.read_at(offset, &mut buffer[..chunk])?;
            writer.write_all(&buffer[..chunk])?;

            offset += chunk as u64;
            written += chunk as u64;
            remaining_raw -= chunk;
        }

        let mut remaining_zero = location.size.saturating_sub(location.raw_size) as usize;

        if remaining_zero > 0 {
            buffer.iter_mut().for_each(|b| *b = 0);
        }

        while remaining_zero > 0 {
            let chunk = std::cmp::min(remaining_zero, SAVE_CHUNK);

            writer.write_all(&buffer[..chunk])?;

            written += chunk as u64;
            remaining_zero -= chunk;
        }

        writer.flush()?;

        Ok(written)
    }
    /// Read a zero-terminated ASCII string at the given RVA.
    ///
    /// Strings longer than the image's ```max_string_length``` fail with
    /// [`Error::UnterminatedString`](Error::UnterminatedString).
    pub fn read_cstring(&self, rva: RVA) -> Result<String> {
        let data = self.read_cstring_bytes(rva)?;
        Ok(String::from_utf8_lossy(&data).into_owned())
    }
    /// Read the bytes of a zero-terminated string at the given RVA, without the terminator.
    pub fn read_cstring_bytes(&self, rva: RVA) -> Result<Vec<u8>> {
        let mut result = Vec::<u8>::new();
        let mut cursor = rva;

        loop {
            let remaining = self.max_string_length + 1 - result.len();
            let mapped = self.address_space.mapped_remainder(cursor)? as usize;
            let chunk = std::cmp::min(std::cmp::min(STRING_CHUNK, remaining), mapped);

            if chunk == 0 {
                return Err(Error::UnterminatedString(rva));
            }

            let data = self.read_rva(cursor, chunk as u32)?;

            if let Some(end) = data.iter().position(|&b| b == 0) {
                result.extend_from_slice(&data[..end]);
                break;
            }

            result.extend_from_slice(&data);
            cursor = cursor.checked_add(chunk as u32).ok_or(Error::UnterminatedString(rva))?;
        }

        if result.len() > self.max_string_length {
            return Err(Error::UnterminatedString(rva));
        }

        Ok(result)
    }

    /// Take a snapshot of the current resource registry.
    pub fn resource_registry(&self) -> Arc<ResourceRegistry> {
        self.resource_registry.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
    /// Replace the resource registry. Decodes already underway keep the registry they started with.
    pub fn set_resource_registry(&self, registry: ResourceRegistry) {
        *self.resource_registry.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(registry);
    }
    /// Register a decoder for a resource type. Returns ```false``` if the type already has one.
    pub fn register_resource_type<I: Into<ResolvedDirectoryID>>(&self, id: I, decoder: ResourceDecoder) -> bool {
        let mut guard = self.resource_registry.write().unwrap_or_else(PoisonError::into_inner);
        let mut registry = (**guard).clone();
        let registered = registry.register(id, decoder);

        if registered {
            *guard = Arc::new(registry);
        }

        registered
    }
    /// Remove the decoder of a resource type. Returns ```false``` if it had none.
    pub fn unregister_resource_type<I: Into<ResolvedDirectoryID>>(&self, id: I) -> bool {
        let mut guard = self.resource_registry.write().unwrap_or_else(PoisonError::into_inner);
        let mut registry = (**guard).clone();
        let removed = registry.unregister(id);

        if removed {
            *guard = Arc::new(registry);
        }

        removed
    }
    /// Fetch the bytes of a resource leaf and decode them with the decoder registered for its type,
    /// or wrap them as raw data if there is none.
    pub fn resource_data(&self, resource_type: &ResourceType, entry: &ResourceEntry, language: &ResourceLanguage) -> Result<Box<dyn ResourceData>> {
        let registry = self.resource_registry();
        let data = self.get_bytes(&language.location)?;

        registry.decode(resource_type, entry, language, data)
    }
}

fn read_structure<T: RawStructure>(stream: &ImageStream, offset: u64) -> Result<T> {
    let mut data = vec![0u8; T::SIZE];
    stream.read_at(offset, &mut data)?;
    T::from_bytes(&data)
}
