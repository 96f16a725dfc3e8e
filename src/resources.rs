//! The resource directory.
//!
//! Resources form a three level tree: resource type, then resource name or ID, then language. The
//! leaves point at the actual resource bytes, which are only read when asked for. The whole
//! directory is read into memory once and the tree is parsed from that buffer by offset.
//!
//! What a leaf's bytes turn into depends on its type. A [`ResourceRegistry`](ResourceRegistry)
//! maps resource types to decoders; types without one come back as [`RawResource`](RawResource).

use log::{debug, warn};

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::Write;
use std::sync::Arc;

use crate::{Error, Result};
use crate::address::AddressSpace;
use crate::buffer::utf16_string;
use crate::directory::{DirectoryContent, LoadContext};
use crate::headers::*;
use crate::types::*;

/// Decoded resource data.
pub trait ResourceData: fmt::Debug + Send + Sync {
    /// The bytes the resource was decoded from.
    fn raw_bytes(&self) -> &[u8];
    /// Write the resource's bytes to the given writer.
    fn save(&self, writer: &mut dyn Write) -> Result<()> {
        writer.write_all(self.raw_bytes())?;
        Ok(())
    }
    /// The resource as text, for resource types that are text.
    fn as_text(&self) -> Option<&str> {
        None
    }
}

/// Resource data no decoder claimed.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct RawResource {
    pub data: Vec<u8>,
}
impl ResourceData for RawResource {
    fn raw_bytes(&self) -> &[u8] {
        &self.data
    }
}

/// A text resource such as a manifest or an HTML page.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct TextResource {
    pub data: Vec<u8>,
    pub text: String,
}
impl TextResource {
    /// Decode text that is either UTF-16LE with a byte order mark or UTF-8, with or without one.
    pub fn new(data: Vec<u8>) -> Self {
        let text = if data.starts_with(&[0xFF, 0xFE]) {
            utf16_string(&data[2..])
        }
        else {
            let body = data.strip_prefix(&[0xEF, 0xBB, 0xBF][..]).unwrap_or(&data[..]);
            String::from_utf8_lossy(body).into_owned()
        };

        let text = text.trim_end_matches('\0').to_string();

        Self { data, text }
    }
}
impl ResourceData for TextResource {
    fn raw_bytes(&self) -> &[u8] {
        &self.data
    }
    fn as_text(&self) -> Option<&str> {
        Some(&self.text)
    }
}

/// Turns the bytes of a resource leaf into resource data.
///
/// A decoder gets the type, entry and language the bytes belong to. It runs on whatever thread
/// fetched the resource and must not touch shared state.
pub type ResourceDecoder = Arc<dyn Fn(&ResourceType, &ResourceEntry, &ResourceLanguage, Vec<u8>) -> Result<Box<dyn ResourceData>> + Send + Sync>;

fn decode_text(_: &ResourceType, _: &ResourceEntry, _: &ResourceLanguage, data: Vec<u8>) -> Result<Box<dyn ResourceData>> {
    Ok(Box::new(TextResource::new(data)))
}

/// The mapping of resource types to decoders.
///
/// The first decoder registered for a type stays: registering a type that already has one fails.
#[derive(Clone)]
pub struct ResourceRegistry {
    decoders: HashMap<ResolvedDirectoryID, ResourceDecoder>,
}
impl ResourceRegistry {
    /// A registry without any decoders.
    pub fn empty() -> Self {
        Self { decoders: HashMap::new() }
    }
    /// Register a decoder. Returns ```false``` and leaves the registry untouched if the type already has one.
    pub fn register<I: Into<ResolvedDirectoryID>>(&mut self, id: I, decoder: ResourceDecoder) -> bool {
        let id = id.into();

        if self.decoders.contains_key(&id) {
            return false;
        }

        self.decoders.insert(id, decoder);
        true
    }
    /// Remove the decoder of a type. Returns ```false``` if it had none.
    pub fn unregister<I: Into<ResolvedDirectoryID>>(&mut self, id: I) -> bool {
        self.decoders.remove(&id.into()).is_some()
    }
    pub fn contains<I: Into<ResolvedDirectoryID>>(&self, id: I) -> bool {
        self.decoders.contains_key(&id.into())
    }
    pub fn get(&self, id: &ResolvedDirectoryID) -> Option<&ResourceDecoder> {
        self.decoders.get(id)
    }
    pub fn len(&self) -> usize {
        self.decoders.len()
    }
    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }
    /// Decode the bytes of a leaf with the decoder of its type, or wrap them as raw data.
    pub fn decode(&self, resource_type: &ResourceType, entry: &ResourceEntry, language: &ResourceLanguage, data: Vec<u8>) -> Result<Box<dyn ResourceData>> {
        match self.decoders.get(&resource_type.id) {
            Some(decoder) => decoder(resource_type, entry, language, data),
            None => Ok(Box::new(RawResource { data })),
        }
    }
}
impl Default for ResourceRegistry {
    /// Manifests and HTML pages decode as text.
    fn default() -> Self {
        let mut registry = Self::empty();

        registry.register(ResourceID::Manifest, Arc::new(decode_text));
        registry.register(ResourceID::HTML, Arc::new(decode_text));

        registry
    }
}
impl fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.decoders.keys()).finish()
    }
}

/// A leaf of the resource tree.
#[derive(Clone, Debug)]
pub struct ResourceLanguage {
    pub id: ResolvedDirectoryID,
    pub data_entry: ImageResourceDataEntry,
    /// Where the resource bytes are.
    pub location: Location,
    pub code_page: u32,
}
impl ResourceLanguage {
    /// The numeric language ID, if the leaf has one.
    pub fn language_id(&self) -> Option<u32> {
        match self.id {
            ResolvedDirectoryID::ID(id) => Some(id),
            ResolvedDirectoryID::Name(_) => None,
        }
    }
}

/// The second level of the resource tree: one named or numbered resource and its languages.
#[derive(Clone, Debug)]
pub struct ResourceEntry {
    pub id: ResolvedDirectoryID,
    pub languages: Vec<ResourceLanguage>,
    /// Languages that could not be parsed.
    pub errors: Vec<Error>,
}
impl ResourceEntry {
    pub fn by_language(&self, language: u32) -> Option<&ResourceLanguage> {
        self.languages.iter().find(|l| l.id == ResolvedDirectoryID::ID(language))
    }
    pub fn iter(&self) -> std::slice::Iter<'_, ResourceLanguage> {
        self.languages.iter()
    }
}

/// The first level of the resource tree: every resource of one type.
#[derive(Clone, Debug)]
pub struct ResourceType {
    pub id: ResolvedDirectoryID,
    pub entries: Vec<ResourceEntry>,
    /// Entries that could not be parsed.
    pub errors: Vec<Error>,
}
impl ResourceType {
    pub fn by_id<I: Into<ResolvedDirectoryID>>(&self, id: I) -> Option<&ResourceEntry> {
        let id = id.into();
        self.entries.iter().find(|e| e.id == id)
    }
    /// Find an entry by name, ignoring ASCII case.
    pub fn by_name(&self, name: &str) -> Option<&ResourceEntry> {
        self.entries.iter().find(|e| e.id.matches_name(name))
    }
    pub fn iter(&self) -> std::slice::Iter<'_, ResourceEntry> {
        self.entries.iter()
    }
}
impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// The decoded resource directory.
#[derive(Clone, Debug)]
pub struct ResourceContent {
    pub directory: ImageResourceDirectory,
    pub location: Location,
    pub types: Vec<ResourceType>,
    /// Types that could not be parsed.
    pub errors: Vec<Error>,
}
impl ResourceContent {
    pub fn len(&self) -> usize {
        self.types.len()
    }
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
    pub fn iter(&self) -> std::slice::Iter<'_, ResourceType> {
        self.types.iter()
    }
    pub fn by_id<I: Into<ResolvedDirectoryID>>(&self, id: I) -> Option<&ResourceType> {
        let id = id.into();
        self.types.iter().find(|t| t.id == id)
    }
    /// Find a type by name, ignoring ASCII case.
    pub fn by_name(&self, name: &str) -> Option<&ResourceType> {
        self.types.iter().find(|t| t.id.matches_name(name))
    }
    /// Every leaf of the tree along with the type and entry it sits under.
    pub fn leaves(&self) -> impl Iterator<Item = (&ResourceType, &ResourceEntry, &ResourceLanguage)> {
        self.types.iter().flat_map(|t| {
            t.entries.iter().flat_map(move |e| e.languages.iter().map(move |l| (t, e, l)))
        })
    }
    /// Check whether any part of the tree failed to parse.
    pub fn is_partial(&self) -> bool {
        !self.errors.is_empty()
            || self.types.iter().any(|t| !t.errors.is_empty() || t.entries.iter().any(|e| !e.errors.is_empty()))
    }
}
impl<'a> IntoIterator for &'a ResourceContent {
    type Item = &'a ResourceType;
    type IntoIter = std::slice::Iter<'a, ResourceType>;

    fn into_iter(self) -> Self::IntoIter {
        self.types.iter()
    }
}

fn corrupt<S: Into<String>>(offset: ResourceOffset, reason: S) -> Error {
    Error::CorruptResourceDirectory { offset, reason: reason.into() }
}

/// Parses the tree out of the resource directory bytes.
///
/// Every directory may be entered once. A tree whose entries share a subdirectory is rejected at the
/// second reference, so the number of nodes stays bounded by the size of the directory.
struct TreeParser<'a> {
    data: &'a [u8],
    space: &'a AddressSpace,
    visited: HashSet<ResourceOffset>,
}
impl<'a> TreeParser<'a> {
    fn slice(&self, offset: ResourceOffset, size: usize, what: &str) -> Result<&'a [u8]> {
        let start = offset.0 as usize;
        let end = start.checked_add(size).ok_or_else(|| corrupt(offset, format!("{} overflows", what)))?;

        if end > self.data.len() {
            return Err(corrupt(offset, format!("{} runs past the end of the resource directory", what)));
        }

        Ok(&self.data[start..end])
    }
    fn directory(&self, offset: ResourceOffset) -> Result<(ImageResourceDirectory, Vec<ImageResourceDirectoryEntry>)> {
        let header = ImageResourceDirectory::from_bytes(self.slice(offset, ImageResourceDirectory::SIZE, "directory header")?)?;

        let entries_offset = ResourceOffset(offset.0 + ImageResourceDirectory::SIZE as u32);
        let raw_entries = self.slice(entries_offset, header.entries() * ImageResourceDirectoryEntry::SIZE, "entry array")?;

        let entries = raw_entries
            .chunks_exact(ImageResourceDirectoryEntry::SIZE)
            .map(ImageResourceDirectoryEntry::from_bytes)
            .collect::<Result<Vec<_>>>()?;

        Ok((header, entries))
    }
    fn enter(&mut self, offset: ResourceOffset) -> Result<(ImageResourceDirectory, Vec<ImageResourceDirectoryEntry>)> {
        if !self.visited.insert(offset) {
            return Err(corrupt(offset, "subdirectory is referenced more than once"));
        }

        self.directory(offset)
    }
    fn resolve(&self, id: ResourceDirectoryID) -> Result<ResolvedDirectoryID> {
        let offset = match id {
            ResourceDirectoryID::ID(id) => return Ok(ResolvedDirectoryID::ID(id)),
            ResourceDirectoryID::Name(offset) => offset,
        };

        let length = self.slice(offset, 2, "name length")?;
        let length = u16::from_le_bytes([length[0], length[1]]) as usize;

        let raw_name = self.slice(ResourceOffset(offset.0 + 2), length * 2, "name")?;

        Ok(ResolvedDirectoryID::Name(utf16_string(raw_name)))
    }
    fn subdirectory(&self, entry: &ImageResourceDirectoryEntry, level: &str) -> Result<ResourceOffset> {
        match entry.get_data() {
            ResourceDirectoryData::Directory(offset) => Ok(offset),
            ResourceDirectoryData::Data(offset) => Err(corrupt(offset, format!("{} entry points at data, not a subdirectory", level))),
        }
    }
    fn parse(&mut self, context: &LoadContext<'_>) -> Result<(ImageResourceDirectory, Vec<ResourceType>, Vec<Error>)> {
        let (root, entries) = self.enter(ResourceOffset(0))?;

        let mut types = Vec::<ResourceType>::with_capacity(entries.len());
        let mut seen = HashSet::<ResolvedDirectoryID>::with_capacity(entries.len());
        let mut errors = Vec::<Error>::new();

        for entry in entries {
            context.checkpoint()?;

            let parsed = self.resolve(entry.get_id()).and_then(|id| {
                if !seen.insert(id.clone()) {
                    return Err(corrupt(ResourceOffset(0), format!("duplicate resource type {}", id)));
                }

                let offset = self.subdirectory(&entry, "type")?;
                self.parse_type(id, offset)
            });

            match parsed {
                Ok(resource_type) => types.push(resource_type),
                Err(error) => {
                    warn!("skipping resource type: {}", error);
                    errors.push(error);
                },
            }
        }

        Ok((root, types, errors))
    }
    fn parse_type(&mut self, id: ResolvedDirectoryID, offset: ResourceOffset) -> Result<ResourceType> {
        let (_, entries) = self.enter(offset)?;
        let mut result = ResourceType { id, entries: Vec::with_capacity(entries.len()), errors: Vec::new() };
        let mut seen = HashSet::<ResolvedDirectoryID>::with_capacity(entries.len());

        for entry in entries {
            let parsed = self.resolve(entry.get_id()).and_then(|id| {
                if !seen.insert(id.clone()) {
                    return Err(corrupt(offset, format!("duplicate resource {} under type {}", id, result.id)));
                }

                let child = self.subdirectory(&entry, "name")?;
                self.parse_entry(id, child)
            });

            match parsed {
                Ok(resource_entry) => result.entries.push(resource_entry),
                Err(error) => {
                    warn!("skipping resource under type {}: {}", result.id, error);
                    result.errors.push(error);
                },
            }
        }

        Ok(result)
    }
    fn parse_entry(&mut self, id: ResolvedDirectoryID, offset: ResourceOffset) -> Result<ResourceEntry> {
        let (_, entries) = self.enter(offset)?;
        let mut result = ResourceEntry { id, languages: Vec::with_capacity(entries.len()), errors: Vec::new() };
        let mut seen = HashSet::<ResolvedDirectoryID>::with_capacity(entries.len());

        for entry in entries {
            let parsed = self.resolve(entry.get_id()).and_then(|id| {
                if !seen.insert(id.clone()) {
                    return Err(corrupt(offset, format!("duplicate language {} under resource {}", id, result.id)));
                }

                self.parse_language(id, &entry)
            });

            match parsed {
                Ok(language) => result.languages.push(language),
                Err(error) => {
                    warn!("skipping language of resource {}: {}", result.id, error);
                    result.errors.push(error);
                },
            }
        }

        Ok(result)
    }
    fn parse_language(&self, id: ResolvedDirectoryID, entry: &ImageResourceDirectoryEntry) -> Result<ResourceLanguage> {
        let offset = match entry.get_data() {
            ResourceDirectoryData::Data(offset) => offset,
            ResourceDirectoryData::Directory(offset) => return Err(corrupt(offset, "language entry points at a subdirectory, not data")),
        };

        let data_entry = ImageResourceDataEntry::from_bytes(self.slice(offset, ImageResourceDataEntry::SIZE, "data entry")?)?;
        let location = self.space.locate(data_entry.offset_to_data, data_entry.size)?;

        Ok(ResourceLanguage {
            id,
            data_entry,
            location,
            code_page: data_entry.code_page,
        })
    }
}

/// Load the resource directory of an image.
pub fn load(context: &LoadContext<'_>) -> Result<DirectoryContent> {
    let image = context.image;
    let data = image.get_bytes(&context.location)?;

    context.checkpoint()?;

    let mut parser = TreeParser { data: &data, space: image.address_space(), visited: HashSet::new() };
    let (directory, types, errors) = parser.parse(context)?;

    let content = ResourceContent {
        directory,
        location: context.location.clone(),
        types,
        errors,
    };

    debug!(
        "resource tree: {} types, {} leaves{}",
        content.len(),
        content.leaves().count(),
        if content.is_partial() { " (partial)" } else { "" },
    );

    Ok(DirectoryContent::Resource(Arc::new(content)))
}
