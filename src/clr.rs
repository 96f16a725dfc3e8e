//! The CLR runtime header of managed images, and the metadata root it points at.

use log::debug;

use std::io::Cursor;
use std::sync::Arc;

use crate::{Error, Result};
use crate::directory::{DirectoryContent, LoadContext};
use crate::headers::*;
use crate::types::*;

/// The largest metadata root header there can be: the fixed fields plus the longest version string.
const MAX_METADATA_HEADER: u32 = 20 + MAX_CLR_VERSION_LENGTH as u32;

/// The decoded CLR runtime header.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct CLRContent {
    pub location: Location,
    pub header: ImageCOR20Header,
    pub metadata_location: Location,
    pub metadata: CLRMetaDataHeader,
}
impl CLRContent {
    /// The runtime version string from the metadata root, e.g. ```v4.0.30319```.
    pub fn version(&self) -> &str {
        &self.metadata.version
    }
    pub fn is_il_only(&self) -> bool {
        self.header.flags.contains(ComImageFlags::ILONLY)
    }
}

/// Load the CLR runtime header of an image.
pub fn load(context: &LoadContext<'_>) -> Result<DirectoryContent> {
    let image = context.image;
    let directory = &context.directory;

    if (directory.size as usize) < ImageCOR20Header::SIZE {
        return Err(Error::CorruptDirectory(
            ImageDirectoryEntry::CLRRuntimeHeader,
            format!("directory size 0x{:x} is smaller than the runtime header", directory.size),
        ));
    }

    let header = image.read_structure::<ImageCOR20Header>(directory.virtual_address)?;

    context.checkpoint()?;

    let metadata_directory = header.metadata;
    let metadata_location = image.address_space().locate(metadata_directory.virtual_address, metadata_directory.size)?;
    let data = image.read_rva(metadata_directory.virtual_address, std::cmp::min(metadata_directory.size, MAX_METADATA_HEADER))?;

    let metadata = CLRMetaDataHeader::read(&mut Cursor::new(data)).map_err(|e| match e {
        Error::Io(_) => Error::CorruptDirectory(
            ImageDirectoryEntry::CLRRuntimeHeader,
            "metadata header is truncated".to_string(),
        ),
        other => other,
    })?;

    debug!("CLR runtime {}.{}, metadata version {:?}", header.major_runtime_version, header.minor_runtime_version, metadata.version);

    Ok(DirectoryContent::CLR(Arc::new(CLRContent {
        location: context.location.clone(),
        header,
        metadata_location,
        metadata,
    })))
}
