use super::*;
use super::buffer::*;
use super::directory::{ContentStatus, LoadContext};
use super::exports::*;
use super::headers::*;
use super::image::ImageOptions;
use super::imports::ImportData;
use super::resources::*;
use super::types::*;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use std::io;
use std::sync::Arc;

struct TestSection {
    name: &'static str,
    virtual_address: u32,
    virtual_size: u32,
    pointer_to_raw_data: u32,
    data: Vec<u8>,
}

/// Lays out a minimal PE image: DOS header at 0, NT headers right after the DOS stub (at 0x40 when
/// there is none), headers padded to 0x400.
struct TestImage {
    arch: Arch,
    image_base: u64,
    stub: Vec<u8>,
    sections: Vec<TestSection>,
    directories: [(u32, u32); 16],
    number_of_rva_and_sizes: u32,
}
impl TestImage {
    fn new(arch: Arch) -> Self {
        let image_base = match arch {
            Arch::X86 => 0x400000,
            Arch::X64 => 0x140000000,
        };

        Self { arch, image_base, stub: Vec::new(), sections: Vec::new(), directories: [(0, 0); 16], number_of_rva_and_sizes: 16 }
    }
    fn dos_stub(mut self, stub: &[u8]) -> Self {
        self.stub = stub.to_vec();
        self
    }
    fn section(mut self, name: &'static str, virtual_address: u32, virtual_size: u32, pointer_to_raw_data: u32, data: Vec<u8>) -> Self {
        self.sections.push(TestSection { name, virtual_address, virtual_size, pointer_to_raw_data, data });
        self
    }
    fn directory(mut self, entry: ImageDirectoryEntry, rva: u32, size: u32) -> Self {
        self.directories[entry as usize] = (rva, size);
        self
    }
    fn rva_and_sizes(mut self, count: u32) -> Self {
        self.number_of_rva_and_sizes = count;
        self
    }
    fn build(&self) -> Vec<u8> {
        let mut out = Vec::<u8>::new();

        out.write_u16::<LittleEndian>(DOS_SIGNATURE).unwrap();
        out.resize(0x3C, 0);
        out.write_u32::<LittleEndian>(0x40 + self.stub.len() as u32).unwrap();
        out.extend_from_slice(&self.stub);

        out.write_u32::<LittleEndian>(NT_SIGNATURE).unwrap();

        let (machine, fixed_size) = match self.arch {
            Arch::X86 => (0x14Cu16, ImageOptionalHeader32::SIZE),
            Arch::X64 => (0x8664u16, ImageOptionalHeader64::SIZE),
        };

        out.write_u16::<LittleEndian>(machine).unwrap();
        out.write_u16::<LittleEndian>(self.sections.len() as u16).unwrap();
        out.write_u32::<LittleEndian>(0).unwrap();
        out.write_u32::<LittleEndian>(0).unwrap();
        out.write_u32::<LittleEndian>(0).unwrap();
        out.write_u16::<LittleEndian>((fixed_size + 16 * ImageDataDirectory::SIZE) as u16).unwrap();
        out.write_u16::<LittleEndian>(0x2102).unwrap();

        let size_of_image = self.sections
            .iter()
            .map(|s| s.virtual_address + std::cmp::max(s.virtual_size, s.data.len() as u32))
            .max()
            .unwrap_or(0x1000);
        let size_of_image = (size_of_image + 0xFFF) & !0xFFF;

        match self.arch {
            Arch::X86 => out.write_u16::<LittleEndian>(HDR32_MAGIC).unwrap(),
            Arch::X64 => out.write_u16::<LittleEndian>(HDR64_MAGIC).unwrap(),
        }

        out.write_u8(14).unwrap();
        out.write_u8(0).unwrap();
        out.write_u32::<LittleEndian>(0).unwrap();
        out.write_u32::<LittleEndian>(0).unwrap();
        out.write_u32::<LittleEndian>(0).unwrap();
        out.write_u32::<LittleEndian>(0x1000).unwrap();
        out.write_u32::<LittleEndian>(0x1000).unwrap();

        match self.arch {
            Arch::X86 => {
                out.write_u32::<LittleEndian>(0).unwrap();
                out.write_u32::<LittleEndian>(self.image_base as u32).unwrap();
            },
            Arch::X64 => out.write_u64::<LittleEndian>(self.image_base).unwrap(),
        }

        out.write_u32::<LittleEndian>(0x1000).unwrap();
        out.write_u32::<LittleEndian>(0x200).unwrap();

        for version in [6u16, 0, 0, 0, 6, 0] {
            out.write_u16::<LittleEndian>(version).unwrap();
        }

        out.write_u32::<LittleEndian>(0).unwrap();
        out.write_u32::<LittleEndian>(size_of_image).unwrap();
        out.write_u32::<LittleEndian>(0x400).unwrap();
        out.write_u32::<LittleEndian>(0).unwrap();
        out.write_u16::<LittleEndian>(2).unwrap();
        out.write_u16::<LittleEndian>(0x0140).unwrap();

        for value in [0x100000u64, 0x1000, 0x100000, 0x1000] {
            match self.arch {
                Arch::X86 => out.write_u32::<LittleEndian>(value as u32).unwrap(),
                Arch::X64 => out.write_u64::<LittleEndian>(value).unwrap(),
            }
        }

        out.write_u32::<LittleEndian>(0).unwrap();
        out.write_u32::<LittleEndian>(self.number_of_rva_and_sizes).unwrap();

        for (rva, size) in self.directories.iter() {
            out.write_u32::<LittleEndian>(*rva).unwrap();
            out.write_u32::<LittleEndian>(*size).unwrap();
        }

        for section in self.sections.iter() {
            let mut name = [0u8; 8];
            name[..section.name.len()].copy_from_slice(section.name.as_bytes());

            let characteristics = if section.name == ".text" { 0x60000020u32 } else { 0x40000040u32 };

            out.extend_from_slice(&name);
            out.write_u32::<LittleEndian>(section.virtual_size).unwrap();
            out.write_u32::<LittleEndian>(section.virtual_address).unwrap();
            out.write_u32::<LittleEndian>(section.data.len() as u32).unwrap();
            out.write_u32::<LittleEndian>(section.pointer_to_raw_data).unwrap();
            out.write_u32::<LittleEndian>(0).unwrap();
            out.write_u32::<LittleEndian>(0).unwrap();
            out.write_u16::<LittleEndian>(0).unwrap();
            out.write_u16::<LittleEndian>(0).unwrap();
            out.write_u32::<LittleEndian>(characteristics).unwrap();
        }

        assert!(out.len() <= 0x400);
        out.resize(0x400, 0);

        for section in self.sections.iter() {
            let start = section.pointer_to_raw_data as usize;
            let end = start + section.data.len();

            if out.len() < end {
                out.resize(end, 0);
            }

            out[start..end].copy_from_slice(&section.data);
        }

        out
    }
    fn open(&self) -> Image {
        Image::from_data(&self.build()).unwrap()
    }
}

fn put_u16(data: &mut [u8], offset: usize, value: u16) {
    LittleEndian::write_u16(&mut data[offset..], value);
}
fn put_u32(data: &mut [u8], offset: usize, value: u32) {
    LittleEndian::write_u32(&mut data[offset..], value);
}
fn put_u64(data: &mut [u8], offset: usize, value: u64) {
    LittleEndian::write_u64(&mut data[offset..], value);
}
fn put_bytes(data: &mut [u8], offset: usize, bytes: &[u8]) {
    data[offset..offset + bytes.len()].copy_from_slice(bytes);
}

#[allow(clippy::too_many_arguments)]
fn put_export_directory(data: &mut [u8], at: usize, name: u32, base: u32, functions: u32, names: u32, address_of_functions: u32, address_of_names: u32, address_of_name_ordinals: u32) {
    put_u32(data, at + 4, 1600000000);
    put_u32(data, at + 12, name);
    put_u32(data, at + 16, base);
    put_u32(data, at + 20, functions);
    put_u32(data, at + 24, names);
    put_u32(data, at + 28, address_of_functions);
    put_u32(data, at + 32, address_of_names);
    put_u32(data, at + 36, address_of_name_ordinals);
}

/// One `.text` section at 0x1000 (raw 0x400, 0x200 bytes) holding an export directory at 0x1100:
/// two functions, one of them named "Foo" through the given ordinal table entry.
fn foo_image(ordinal: u16) -> TestImage {
    let mut text = vec![0u8; 0x200];

    put_export_directory(&mut text, 0x100, 0x1140, 1, 2, 1, 0x1128, 0x1130, 0x1134);
    put_u32(&mut text, 0x128, 0x1050);
    put_u32(&mut text, 0x12C, 0x1060);
    put_u32(&mut text, 0x130, 0x1138);
    put_u16(&mut text, 0x134, ordinal);
    put_bytes(&mut text, 0x138, b"Foo\0");
    put_bytes(&mut text, 0x140, b"test.dll\0");

    TestImage::new(Arch::X86)
        .section(".text", 0x1000, 0x200, 0x400, text)
        .directory(ImageDirectoryEntry::Export, 0x1100, 0x60)
}

#[test]
fn test_headers() {
    let image = foo_image(0).open();

    assert_eq!(image.dos_header().e_magic, DOS_SIGNATURE);
    assert_eq!(image.dos_header().e_lfanew, Offset(0x40));
    assert_eq!(image.arch(), Arch::X86);
    assert_eq!(image.nt_headers().image_base(), 0x400000);
    assert_eq!(image.nt_headers().size_of_headers(), 0x400);
    assert_eq!(image.nt_headers().entrypoint(), RVA(0x1000));
    assert_eq!(image.nt_headers().file_header().number_of_sections, 1);
    assert_eq!(image.nt_headers().file_header().characteristics.contains(FileCharacteristics::DLL), true);

    assert_eq!(image.section_headers().len(), 1);
    assert_eq!(image.section_headers()[0].name_str(), ".text");
    assert_eq!(image.sections().len(), 1);
    assert_eq!(image.directories().len(), 16);
}

#[test]
fn test_bad_signatures() {
    let mut data = foo_image(0).build();
    data[0] = b'X';

    match Image::from_data(&data) {
        Err(Error::InvalidDOSSignature(sig)) => assert_eq!(sig, 0x5A58),
        other => panic!("unexpected result: {:?}", other.map(|_| ())),
    }

    let mut data = foo_image(0).build();
    data[0x40] = b'X';

    let result = Image::from_data(&data);
    assert_eq!(matches!(result, Err(Error::InvalidPESignature(_))), true);

    let mut data = foo_image(0).build();
    put_u16(&mut data, 0x58, 0x1234);

    let result = Image::from_data(&data);
    assert_eq!(matches!(result, Err(Error::InvalidNTSignature(0x1234))), true);

    let result = Image::from_data(&data[..0x20]);
    assert_eq!(result.is_err(), true);
    assert_eq!(result.err().map(|e| e.kind()), Some(ErrorKind::MalformedStructure));
}

#[test]
fn test_translation_round_trip() {
    let image = foo_image(0).open();
    let space = image.address_space();

    for rva in [0x1000u32, 0x1050, 0x1100, 0x11FF] {
        let offset = space.rva_to_offset(RVA(rva)).unwrap();

        assert_eq!(offset, Offset(rva - 0x1000 + 0x400));
        assert_eq!(space.rva_of_offset(offset).unwrap(), RVA(rva));
        assert_eq!(RVA(rva).as_offset(space).unwrap(), offset);
        assert_eq!(offset.as_rva(space).unwrap(), RVA(rva));
    }

    assert_eq!(space.va_of(RVA(0x1050)), VA::VA32(VA32(0x401050)));
    assert_eq!(space.rva_of_va(VA::VA32(VA32(0x401050))).unwrap(), RVA(0x1050));
    assert_eq!(VA32(0x401050).as_offset(space).unwrap(), Offset(0x450));

    let below_base = space.rva_of_va(VA::VA32(VA32(0x1000)));
    assert_eq!(below_base.err().map(|e| e.kind()), Some(ErrorKind::UnmappedAddress));

    let location = space.locate(RVA(0x1050), 0x10).unwrap();
    assert_eq!(location.offset, Offset(0x450));
    assert_eq!(location.va, VA::VA32(VA32(0x401050)));
    assert_eq!(location.raw_size, 0x10);
    assert_eq!(location.section.as_ref().map(|s| s.name.as_str()), Some(".text"));
}

#[test]
fn test_translation_64() {
    let image = TestImage::new(Arch::X64)
        .section(".text", 0x1000, 0x200, 0x400, vec![0xCC; 0x200])
        .open();
    let space = image.address_space();

    assert_eq!(image.arch(), Arch::X64);
    assert_eq!(space.va_of(RVA(0x1010)), VA::VA64(VA64(0x140001010)));
    assert_eq!(space.rva_of_va(VA::VA64(VA64(0x140001010))).unwrap(), RVA(0x1010));
    assert_eq!(VA64(0x140001010).as_offset(space).unwrap(), Offset(0x410));

    let too_far = space.rva_of_va(VA::VA64(VA64(0x240000000)));
    assert_eq!(matches!(too_far, Err(Error::InvalidVA(_))), true);
}

#[test]
fn test_header_region() {
    let image = foo_image(0).open();
    let space = image.address_space();

    assert_eq!(space.is_header_region(RVA(0x3C)), true);
    assert_eq!(space.rva_to_offset(RVA(0x3C)).unwrap(), Offset(0x3C));
    assert_eq!(space.rva_of_offset(Offset(0x3C)).unwrap(), RVA(0x3C));

    let header = image.read_rva(RVA(0), 2).unwrap();
    assert_eq!(header, b"MZ".to_vec());

    let unmapped = space.rva_to_offset(RVA(0x800));
    assert_eq!(matches!(unmapped, Err(Error::UnmappedAddress(RVA(0x800)))), true);
    assert_eq!(unmapped.err().map(|e| e.kind()), Some(ErrorKind::UnmappedAddress));

    let past_end = space.rva_to_offset(RVA(0x1200));
    assert_eq!(past_end.is_err(), true);

    let offset = space.rva_of_offset(Offset(0x800));
    assert_eq!(matches!(offset, Err(Error::UnmappedOffset(Offset(0x800)))), true);
}

#[test]
fn test_zero_fill() {
    let mut text = vec![0xAAu8; 0x200];
    text[0x1FF] = 0xBB;

    let image = TestImage::new(Arch::X86)
        .section(".text", 0x1000, 0x1000, 0x400, text)
        .open();
    let space = image.address_space();

    let section = space.section_for(RVA(0x1800)).unwrap();
    assert_eq!(section.is_zero_fill(RVA(0x1800)), true);
    assert_eq!(section.is_zero_fill(RVA(0x1100)), false);

    let location = space.locate(RVA(0x1800), 0x10).unwrap();
    assert_eq!(location.raw_size, 0);

    let reads = image.stream_reads();
    let data = image.read_rva(RVA(0x1800), 0x10).unwrap();

    assert_eq!(data, vec![0u8; 0x10]);
    assert_eq!(image.stream_reads(), reads);

    let straddle = image.read_rva(RVA(0x11FE), 4).unwrap();
    assert_eq!(straddle, vec![0xAA, 0xBB, 0, 0]);
}

#[test]
fn test_section_bounds() {
    let mut text = vec![0xAAu8; 0x200];
    put_bytes(&mut text, 0x1F0, b"End\0");
    put_bytes(&mut text, 0x1FE, b"AB");

    let mut data = vec![0xBBu8; 0x200];
    put_bytes(&mut data, 0, b"C\0");

    let image = TestImage::new(Arch::X86)
        .section(".text", 0x1000, 0x200, 0x400, text)
        .section(".data", 0x1200, 0x200, 0x600, data)
        .open();
    let space = image.address_space();

    let crossing = image.location_of(RVA(0x1100), 0x200);
    assert_eq!(matches!(crossing, Err(Error::UnmappedRange { rva: RVA(0x1100), size: 0x200 })), true);
    assert_eq!(crossing.err().map(|e| e.kind()), Some(ErrorKind::UnmappedAddress));

    let past_image = image.read_rva(RVA(0x1300), 0x1000);
    assert_eq!(past_image.err().map(|e| e.kind()), Some(ErrorKind::UnmappedAddress));
    assert_eq!(image.read_rva(RVA(0x11FF), 2).is_err(), true);

    assert_eq!(space.mapped_remainder(RVA(0x1100)).unwrap(), 0x100);
    assert_eq!(space.mapped_remainder(RVA(0x3F0)).unwrap(), 0x10);
    assert_eq!(space.locate(RVA(0x3F0), 0x20).is_err(), true);
    assert_eq!(space.locate(RVA(0x3F0), 0x10).ok().map(|l| l.raw_size), Some(0x10));

    let location = image.location_of(RVA(0x1000), 0x100).unwrap();
    assert_eq!(location.raw_size, 0x100);
    assert_eq!(image.get_bytes(&location).unwrap(), vec![0xAA; 0x100]);
    assert_eq!(image.read_rva(RVA(0x1200), 4).unwrap(), vec![b'C', 0, 0xBB, 0xBB]);

    // strings stop at the end of the section that maps them
    assert_eq!(image.read_cstring(RVA(0x11F0)).unwrap(), "End");
    assert_eq!(image.read_cstring(RVA(0x11FE)).unwrap(), "ABC");

    let mut inconsistent = image.location_of(RVA(0x1000), 4).unwrap();
    inconsistent.raw_size = 0x10;

    assert_eq!(image.get_bytes(&inconsistent).unwrap(), vec![0xAA; 4]);

    let mut saved = Vec::<u8>::new();
    assert_eq!(image.save_bytes(&inconsistent, &mut saved).unwrap(), 4);
    assert_eq!(saved, vec![0xAA; 4]);
}

#[test]
fn test_dos_stub() {
    let stub = b"\x0E\x1F\xBA\x0E\x00\xB4\x09\xCD\x21This program cannot be run in DOS mode.\r\r\n$\0\0\0\0\0\0\0\0\0\0\0\0";

    let image = foo_image(0).dos_stub(stub).open();
    let location = image.dos_stub().unwrap();

    assert_eq!(image.dos_header().e_lfanew, Offset(0x40 + stub.len() as u32));
    assert_eq!(location.offset, Offset(0x40));
    assert_eq!(location.size as usize, stub.len());
    assert_eq!(location.section.is_none(), true);
    assert_eq!(image.get_bytes(&location).unwrap(), stub.to_vec());
    assert_eq!(image.exports().unwrap().map(|e| e.len()), Some(2));

    let bare = foo_image(0).open();
    assert_eq!(bare.dos_stub().ok().map(|l| l.size), Some(0));
}

#[test]
fn test_section_table() {
    let image = TestImage::new(Arch::X86)
        .section(".text", 0x1000, 0x200, 0x400, vec![0; 0x200])
        .section(".data", 0x2000, 0, 0x600, vec![1; 0x200])
        .open();
    let sections = image.sections();

    assert_eq!(sections.len(), 2);
    assert_eq!(sections.by_name(".DATA").map(|s| s.virtual_address), Some(RVA(0x2000)));
    assert_eq!(sections.by_name(".rsrc").is_none(), true);
    assert_eq!(sections.by_rva(RVA(0x2100)).map(|s| s.name.as_str()), Some(".data"));
    assert_eq!(sections.by_rva(RVA(0x2200)).is_none(), true);
    assert_eq!(sections.by_offset(Offset(0x610)).map(|s| s.name.as_str()), Some(".data"));
    assert_eq!(sections.by_rva(RVA(0x0FFF)).is_none(), true);

    let data = sections.get(1).unwrap();
    assert_eq!(data.virtual_extent(), 0x200);
    assert_eq!(data.characteristics.contains(SectionCharacteristics::CNT_INITIALIZED_DATA), true);

    let names = sections.iter().map(|s| s.name.clone()).collect::<Vec<String>>();
    assert_eq!(names, vec![".text".to_string(), ".data".to_string()]);
}

#[test]
fn test_bad_section_table() {
    let overlapping = TestImage::new(Arch::X86)
        .section(".text", 0x1000, 0x1800, 0x400, vec![0; 0x200])
        .section(".data", 0x2000, 0x200, 0x600, vec![0; 0x200])
        .build();

    let result = Image::from_data(&overlapping);
    assert_eq!(matches!(result, Err(Error::BadSectionTable(_))), true);
    assert_eq!(result.err().map(|e| e.kind()), Some(ErrorKind::MalformedStructure));

    let unsorted = TestImage::new(Arch::X86)
        .section(".data", 0x2000, 0x200, 0x600, vec![0; 0x200])
        .section(".text", 0x1000, 0x200, 0x400, vec![0; 0x200])
        .build();

    let result = Image::from_data(&unsorted);
    assert_eq!(matches!(result, Err(Error::BadSectionTable(_))), true);

    let lenient = Image::with_options(io::Cursor::new(unsorted), ImageOptions::new().with_strict_sections(false)).unwrap();
    assert_eq!(lenient.sections().get(0).map(|s| s.name.as_str()), Some(".text"));
    assert_eq!(lenient.address_space().rva_to_offset(RVA(0x2010)).unwrap(), Offset(0x610));
}

#[test]
fn test_exports() {
    let image = foo_image(0).open();
    let exports = image.exports().unwrap().unwrap();

    let expected = vec![
        Export { index: 0, name_index: Some(0), function: RVA(0x1050), name: "Foo".to_string(), ordinal: 1, forwarder: String::new() },
        Export { index: 1, name_index: None, function: RVA(0x1060), name: String::new(), ordinal: 2, forwarder: String::new() },
    ];

    assert_eq!(exports.exports(), expected.as_slice());
    assert_eq!(exports.name, "test.dll");
    assert_eq!(exports.directory.number_of_functions, 2);
    assert_eq!(exports.time_date_stamp().map(|t| t.timestamp()), Some(1600000000));
    assert_eq!(exports.location.rva, RVA(0x1100));

    assert_eq!(exports.tables.functions, vec![0x1050, 0x1060]);
    assert_eq!(exports.tables.names, vec![RVA(0x1138)]);
    assert_eq!(exports.tables.ordinals, vec![0]);

    let locations = &exports.table_locations;
    assert_eq!(locations.functions.as_ref().map(|l| (l.rva, l.size)), Some((RVA(0x1128), 8)));
    assert_eq!(locations.names.as_ref().map(|l| (l.rva, l.size)), Some((RVA(0x1130), 4)));
    assert_eq!(locations.ordinals.as_ref().map(|l| (l.rva, l.size)), Some((RVA(0x1134), 2)));
    assert_eq!(locations.name_strings.len(), 1);
    assert_eq!(image.get_bytes(&locations.name_strings[0]).unwrap(), b"Foo\0".to_vec());
    assert_eq!(image.get_bytes(locations.functions.as_ref().unwrap()).unwrap(), vec![0x50, 0x10, 0, 0, 0x60, 0x10, 0, 0]);

    assert_eq!(exports.get(0).map(|e| e.to_string()), Some("0x00001050 0001 Foo".to_string()));
    assert_eq!(exports.by_name("foo").map(|e| e.ordinal), Some(1));
    assert_eq!(exports.by_name("Bar").is_none(), true);
    assert_eq!(exports.by_ordinal(2).map(|e| e.function), Some(RVA(0x1060)));
    assert_eq!(exports.by_ordinal(3).is_none(), true);
    assert_eq!(exports.get(2).is_none(), true);
    assert_eq!(exports.get(1).map(|e| e.is_ordinal_only()), Some(true));
}

#[test]
fn test_export_forwarders() {
    let mut text = vec![0u8; 0x200];

    put_export_directory(&mut text, 0x100, 0x1148, 1, 3, 2, 0x1128, 0x1134, 0x113C);
    put_u32(&mut text, 0x128, 0x1050);
    put_u32(&mut text, 0x12C, 0x1150);
    put_u32(&mut text, 0x130, 0x1060);
    put_u32(&mut text, 0x134, 0x1140);
    put_u32(&mut text, 0x138, 0x1144);
    put_u16(&mut text, 0x13C, 1);
    put_u16(&mut text, 0x13E, 0);
    put_bytes(&mut text, 0x140, b"Foo\0");
    put_bytes(&mut text, 0x144, b"Bar\0");
    put_bytes(&mut text, 0x148, b"fwd.dll\0");
    put_bytes(&mut text, 0x150, b"NTDLL.RtlFoo\0");

    let image = TestImage::new(Arch::X86)
        .section(".text", 0x1000, 0x200, 0x400, text)
        .directory(ImageDirectoryEntry::Export, 0x1100, 0x60)
        .open();
    let exports = image.exports().unwrap().unwrap();

    assert_eq!(exports.len(), 3);

    let ordinals = exports.iter().map(|e| e.ordinal).collect::<Vec<u32>>();
    assert_eq!(ordinals, vec![1, 2, 3]);

    let bar = exports.get(0).unwrap();
    assert_eq!(bar.name, "Bar");
    assert_eq!(bar.name_index, Some(1));
    assert_eq!(bar.is_forwarder(), false);

    let foo = exports.get(1).unwrap();
    assert_eq!(foo.name, "Foo");
    assert_eq!(foo.function, RVA(0x1150));
    assert_eq!(foo.forwarder, "NTDLL.RtlFoo");
    assert_eq!(foo.to_string(), "0x00001150 0002 Foo -> NTDLL.RtlFoo");

    assert_eq!(exports.by_name_and_forwarder("FOO", "ntdll.rtlfoo").map(|e| e.index), Some(1));
    assert_eq!(exports.by_name_and_forwarder("Foo", "").is_none(), true);
    assert_eq!(exports.by_name_and_forwarder("Bar", "").map(|e| e.index), Some(0));

    let unnamed = exports.get(2).unwrap();
    assert_eq!(unnamed.name, "");
    assert_eq!(unnamed.forwarder, "");
    assert_eq!(unnamed.index, 2);
}

#[test]
fn test_export_completeness() {
    // five slots, two of them named, one name aliasing another's slot
    let directory = DataDirectory { entry: ImageDirectoryEntry::Export, virtual_address: RVA(0x5000), size: 0x100 };
    let export_directory = ImageExportDirectory { base: 10, number_of_functions: 5, number_of_names: 3, ..Default::default() };
    let tables = ExportTables {
        functions: vec![0x1000, 0x1010, 0x5080, 0x1030, 0x1040],
        names: vec![RVA(0x6000), RVA(0x6010), RVA(0x6020)],
        ordinals: vec![3, 0, 3],
    };

    let mut reads = Vec::<RVA>::new();
    let exports = reconstruct(&directory, &export_directory, &tables, |rva| {
        reads.push(rva);
        Ok(format!("s{:x}", rva.0))
    }).unwrap();

    let slots = exports.iter().map(|e| e.index).collect::<Vec<u32>>();
    assert_eq!(slots, vec![0, 1, 2, 3, 3, 4]);

    let ordinals = exports.iter().map(|e| e.ordinal).collect::<Vec<u32>>();
    assert_eq!(ordinals, vec![10, 11, 12, 13, 13, 14]);

    for slot in 0..5u32 {
        assert_eq!(exports.iter().any(|e| e.index == slot), true);
    }

    assert_eq!(exports.iter().filter(|e| e.name_index.is_none()).count(), 3);

    let forwarded = exports.iter().find(|e| e.index == 2).unwrap();
    assert_eq!(forwarded.name, "");
    assert_eq!(forwarded.forwarder, "s5080");
    assert_eq!(reads.contains(&RVA(0x5080)), true);

    let bad = ExportTables { functions: vec![0x1000], names: vec![RVA(0x6000)], ordinals: vec![1] };
    let result = reconstruct(&directory, &export_directory, &bad, |_| Ok(String::new()));
    assert_eq!(matches!(result, Err(Error::CorruptExportDirectory(_))), true);

    let failing = reconstruct(&directory, &export_directory, &tables, |rva| {
        if rva == RVA(0x6010) { Err(Error::UnterminatedString(rva)) } else { Ok(String::new()) }
    });
    assert_eq!(matches!(failing, Err(Error::UnterminatedString(RVA(0x6010)))), true);
}

#[test]
fn test_corrupt_export_ordinal() {
    let image = foo_image(5).open();

    let first = image.content(ImageDirectoryEntry::Export);
    assert_eq!(matches!(first, Err(Error::CorruptExportDirectory(_))), true);
    assert_eq!(image.content_status(ImageDirectoryEntry::Export), ContentStatus::Failed);

    let reads = image.stream_reads();
    let second = image.exports();

    assert_eq!(matches!(second, Err(Error::CorruptExportDirectory(_))), true);
    assert_eq!(image.stream_reads(), reads);
    assert_eq!(first.err().map(|e| e.to_string()), second.err().map(|e| e.to_string()));
}

#[test]
fn test_export_table_bounds() {
    let mut text = vec![0u8; 0x200];
    put_export_directory(&mut text, 0x100, 0, 1, 0x100, 0, 0x1128, 0, 0);

    let image = TestImage::new(Arch::X86)
        .section(".text", 0x1000, 0x200, 0x400, text)
        .directory(ImageDirectoryEntry::Export, 0x1100, 0x60)
        .open();

    let result = image.exports();
    assert_eq!(matches!(result, Err(Error::CorruptExportDirectory(_))), true);
    assert_eq!(result.err().map(|e| e.kind()), Some(ErrorKind::MalformedStructure));

    let mut text = vec![0u8; 0x200];
    put_export_directory(&mut text, 0x100, 0, 1, 1, 2, 0x1128, 0x1130, 0x1138);

    let image = TestImage::new(Arch::X86)
        .section(".text", 0x1000, 0x200, 0x400, text)
        .directory(ImageDirectoryEntry::Export, 0x1100, 0x60)
        .open();

    assert_eq!(matches!(image.exports(), Err(Error::CorruptExportDirectory(_))), true);

    // the section claims 0x400 raw bytes but the file ends 0x100 bytes in
    let mut text = vec![0u8; 0x400];
    put_export_directory(&mut text, 0, 0, 1, 2, 0, 0x1300, 0, 0);

    let mut data = TestImage::new(Arch::X86)
        .section(".text", 0x1000, 0x400, 0x400, text)
        .directory(ImageDirectoryEntry::Export, 0x1000, 0x300)
        .build();
    data.truncate(0x500);

    let image = Image::from_data(&data).unwrap();
    let result = image.exports();

    match result {
        Err(Error::CorruptExportDirectory(message)) => assert_eq!(message.contains("past the end"), true),
        other => panic!("unexpected result: {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_content_cache() {
    let image = foo_image(0).open();

    assert_eq!(image.content_status(ImageDirectoryEntry::Export), ContentStatus::NotLoaded);

    let first = image.content(ImageDirectoryEntry::Export).unwrap().unwrap();
    let reads = image.stream_reads();
    let second = image.content(ImageDirectoryEntry::Export).unwrap().unwrap();

    assert_eq!(first.ptr_eq(&second), true);
    assert_eq!(image.stream_reads(), reads);
    assert_eq!(image.content_status(ImageDirectoryEntry::Export), ContentStatus::Loaded);

    let typed = image.exports().unwrap().unwrap();
    assert_eq!(Arc::ptr_eq(&typed, first.as_exports().unwrap()), true);
    assert_eq!(first.as_resources().is_none(), true);

    let reloaded = image.reload(ImageDirectoryEntry::Export).unwrap().unwrap();
    assert_eq!(reloaded.ptr_eq(&first), false);
    assert_eq!(reloaded.as_exports().unwrap().exports(), typed.exports());
    assert_eq!(image.stream_reads() > reads, true);
}

#[test]
fn test_absent_content() {
    let image = foo_image(0)
        .directory(ImageDirectoryEntry::Exception, 0x1000, 0x10)
        .open();

    assert_eq!(image.directory(ImageDirectoryEntry::Import).map(|d| d.is_empty()), Some(true));
    assert_eq!(image.imports().unwrap().is_none(), true);
    assert_eq!(image.content(ImageDirectoryEntry::Exception).unwrap().is_none(), true);
    assert_eq!(image.directory(ImageDirectoryEntry::Exception).map(|d| d.contains(RVA(0x1008))), Some(true));

    let short = foo_image(0)
        .directory(ImageDirectoryEntry::Resource, 0x1000, 0x10)
        .rva_and_sizes(2)
        .open();

    assert_eq!(short.directories().len(), 2);
    assert_eq!(short.directory(ImageDirectoryEntry::Resource).is_none(), true);
    assert_eq!(short.resources().unwrap().is_none(), true);
    assert_eq!(short.exports().unwrap().is_some(), true);

    let unregistered = Image::with_options(
        io::Cursor::new(foo_image(0).build()),
        ImageOptions::new().with_loaders(DirectoryContentRegistry::empty()),
    ).unwrap();

    assert_eq!(unregistered.exports().unwrap().is_none(), true);
}

#[test]
fn test_cancelled_load() {
    let image = foo_image(0).open();
    let token = CancelToken::new();

    token.cancel();

    let result = image.content_with_cancel(ImageDirectoryEntry::Export, Some(&token));
    assert_eq!(matches!(result, Err(Error::Cancelled)), true);
    assert_eq!(result.err().map(|e| e.kind()), Some(ErrorKind::Cancelled));
    assert_eq!(image.content_status(ImageDirectoryEntry::Export), ContentStatus::NotLoaded);

    let live = CancelToken::new();
    let content = image.content_with_cancel(ImageDirectoryEntry::Export, Some(&live)).unwrap();
    assert_eq!(content.is_some(), true);
    assert_eq!(image.content_status(ImageDirectoryEntry::Export), ContentStatus::Loaded);
}

#[test]
fn test_single_flight() {
    let reference = foo_image(0).open();
    let before = reference.stream_reads();
    reference.exports().unwrap();
    let load_reads = reference.stream_reads() - before;

    let image = foo_image(0).open();
    let opened = image.stream_reads();

    let results = std::thread::scope(|scope| {
        let handles = (0..8)
            .map(|_| scope.spawn(|| image.exports().unwrap().unwrap()))
            .collect::<Vec<_>>();

        handles.into_iter().map(|h| h.join().unwrap()).collect::<Vec<_>>()
    });

    for result in results.iter() {
        assert_eq!(Arc::ptr_eq(result, &results[0]), true);
    }

    assert_eq!(image.stream_reads() - opened, load_reads);
}

#[test]
fn test_bytes() {
    let mut text = (0..0x200).map(|x| x as u8).collect::<Vec<u8>>();
    text[0x1FF] = 0x42;

    let image = TestImage::new(Arch::X86)
        .section(".text", 0x1000, 0x300, 0x400, text)
        .open();

    let location = image.location_of(RVA(0x1100), 0x180).unwrap();
    assert_eq!(location.raw_size, 0x100);
    assert_eq!(location.contains(RVA(0x127F)), true);
    assert_eq!(location.contains(RVA(0x1280)), false);

    let bytes = image.get_bytes(&location).unwrap();
    assert_eq!(bytes.len(), 0x180);
    assert_eq!(bytes[0], 0x00);
    assert_eq!(bytes[0xFF], 0x42);
    assert_eq!(bytes[0x100..].iter().all(|&b| b == 0), true);

    let mut saved = Vec::<u8>::new();
    let written = image.save_bytes(&location, &mut saved).unwrap();

    assert_eq!(written, 0x180);
    assert_eq!(saved, bytes);

    let va_location = image.location_of(VA32(0x401010), 4).unwrap();
    assert_eq!(image.get_bytes(&va_location).unwrap(), vec![0x10, 0x11, 0x12, 0x13]);

    assert_eq!(image.read_offset(Offset(0x402), 2).unwrap(), vec![0x02, 0x03]);
    assert_eq!(matches!(image.read_offset(Offset(0x5FF), 2), Err(Error::OutOfBounds { .. })), true);
}

#[test]
fn test_strings() {
    let mut text = vec![0u8; 0x200];
    put_bytes(&mut text, 0x10, b"ExitProcess\0");
    put_bytes(&mut text, 0x100, &[b'A'; 0x100]);

    let data = TestImage::new(Arch::X86)
        .section(".text", 0x1000, 0x300, 0x400, text)
        .build();

    let image = Image::from_data(&data).unwrap();
    assert_eq!(image.read_cstring(RVA(0x1010)).unwrap(), "ExitProcess");
    assert_eq!(image.read_cstring(RVA(0x1100)).unwrap().len(), 0x100);

    let capped = Image::with_options(io::Cursor::new(data), ImageOptions::new().with_max_string_length(4)).unwrap();
    assert_eq!(capped.max_string_length(), 4);
    assert_eq!(matches!(capped.read_cstring(RVA(0x1010)), Err(Error::UnterminatedString(RVA(0x1010)))), true);
    assert_eq!(capped.read_cstring(RVA(0x1018)).unwrap(), "ess");
}

enum TestId {
    Id(u32),
    Name(&'static str),
}
impl TestId {
    fn field(&self, name_offset: usize) -> u32 {
        match self {
            TestId::Id(id) => *id,
            TestId::Name(_) => 0x80000000 | name_offset as u32,
        }
    }
    fn name_size(&self) -> usize {
        match self {
            TestId::Id(_) => 0,
            TestId::Name(name) => 2 + 2 * name.encode_utf16().count(),
        }
    }
    fn is_named(&self) -> bool {
        matches!(self, TestId::Name(_))
    }
}

struct TestEntry {
    id: TestId,
    languages: Vec<(u32, Vec<u8>)>,
}

struct TestType {
    id: TestId,
    entries: Vec<TestEntry>,
}

struct TestResources {
    data: Vec<u8>,
    type_dirs: Vec<usize>,
    entry_dirs: Vec<Vec<usize>>,
}

fn align4(value: usize) -> usize {
    (value + 3) & !3
}

fn put_directory_header<'a, I: Iterator<Item = &'a TestId>>(data: &mut [u8], at: usize, ids: I) {
    let (named, numbered) = ids.fold((0u16, 0u16), |(n, i), id| if id.is_named() { (n + 1, i) } else { (n, i + 1) });

    put_u16(data, at + 12, named);
    put_u16(data, at + 14, numbered);
}

fn put_name(data: &mut [u8], at: usize, id: &TestId) {
    if let TestId::Name(name) = id {
        let units = name.encode_utf16().collect::<Vec<u16>>();

        put_u16(data, at, units.len() as u16);

        for (i, unit) in units.iter().enumerate() {
            put_u16(data, at + 2 + i * 2, *unit);
        }
    }
}

/// Lays out a resource directory: directory tables first, then data entries, names and finally the data.
fn resource_section(base: u32, types: &[TestType]) -> TestResources {
    let dir_size = |n: usize| 16 + 8 * n;
    let mut cursor = dir_size(types.len());

    let mut type_dirs = Vec::new();
    for t in types {
        type_dirs.push(cursor);
        cursor += dir_size(t.entries.len());
    }

    let mut entry_dirs = Vec::new();
    for t in types {
        let mut dirs = Vec::new();
        for e in &t.entries {
            dirs.push(cursor);
            cursor += dir_size(e.languages.len());
        }
        entry_dirs.push(dirs);
    }

    let mut data_entries = Vec::new();
    for t in types {
        let mut per_type = Vec::new();
        for e in &t.entries {
            let mut per_entry = Vec::new();
            for _ in &e.languages {
                per_entry.push(cursor);
                cursor += 16;
            }
            per_type.push(per_entry);
        }
        data_entries.push(per_type);
    }

    let mut type_names = Vec::new();
    let mut entry_names = Vec::new();
    for t in types {
        type_names.push(cursor);
        cursor += t.id.name_size();

        let mut names = Vec::new();
        for e in &t.entries {
            names.push(cursor);
            cursor += e.id.name_size();
        }
        entry_names.push(names);
    }

    cursor = align4(cursor);

    let mut blobs = Vec::new();
    for t in types {
        for e in &t.entries {
            for (_, bytes) in &e.languages {
                blobs.push(cursor);
                cursor += align4(bytes.len());
            }
        }
    }

    let mut data = vec![0u8; cursor];
    let mut blob = 0;

    put_directory_header(&mut data, 0, types.iter().map(|t| &t.id));

    for (ti, t) in types.iter().enumerate() {
        put_u32(&mut data, 16 + 8 * ti, t.id.field(type_names[ti]));
        put_u32(&mut data, 16 + 8 * ti + 4, 0x80000000 | type_dirs[ti] as u32);
        put_name(&mut data, type_names[ti], &t.id);

        put_directory_header(&mut data, type_dirs[ti], t.entries.iter().map(|e| &e.id));

        for (ei, e) in t.entries.iter().enumerate() {
            let at = type_dirs[ti] + 16 + 8 * ei;

            put_u32(&mut data, at, e.id.field(entry_names[ti][ei]));
            put_u32(&mut data, at + 4, 0x80000000 | entry_dirs[ti][ei] as u32);
            put_name(&mut data, entry_names[ti][ei], &e.id);

            put_u16(&mut data, entry_dirs[ti][ei] + 14, e.languages.len() as u16);

            for (li, (language, bytes)) in e.languages.iter().enumerate() {
                let at = entry_dirs[ti][ei] + 16 + 8 * li;
                let data_entry = data_entries[ti][ei][li];

                put_u32(&mut data, at, *language);
                put_u32(&mut data, at + 4, data_entry as u32);

                put_u32(&mut data, data_entry, base + blobs[blob] as u32);
                put_u32(&mut data, data_entry + 4, bytes.len() as u32);
                put_u32(&mut data, data_entry + 8, 1252);

                put_bytes(&mut data, blobs[blob], bytes);
                blob += 1;
            }
        }
    }

    TestResources { data, type_dirs, entry_dirs }
}

fn test_tree() -> Vec<TestType> {
    vec![
        TestType {
            id: TestId::Name("CUSTOM"),
            entries: vec![
                TestEntry { id: TestId::Id(1), languages: vec![(0, b"custom".to_vec())] },
            ],
        },
        TestType {
            id: TestId::Id(10),
            entries: vec![
                TestEntry { id: TestId::Name("CONFIG"), languages: vec![(1033, vec![1, 2, 3, 4])] },
                TestEntry { id: TestId::Id(101), languages: vec![(1033, b"abc".to_vec()), (1031, b"xyz".to_vec())] },
            ],
        },
        TestType {
            id: TestId::Id(24),
            entries: vec![
                TestEntry { id: TestId::Id(1), languages: vec![(1033, b"\xEF\xBB\xBF<assembly/>".to_vec())] },
            ],
        },
    ]
}

fn resource_image(resources: &TestResources) -> TestImage {
    let mut rsrc = resources.data.clone();
    rsrc.resize((rsrc.len() + 0x1FF) & !0x1FF, 0);

    let virtual_size = rsrc.len() as u32;

    TestImage::new(Arch::X86)
        .section(".text", 0x1000, 0x200, 0x400, vec![0; 0x200])
        .section(".rsrc", 0x2000, virtual_size, 0x600, rsrc)
        .directory(ImageDirectoryEntry::Resource, 0x2000, resources.data.len() as u32)
}

#[test]
fn test_resource_tree() {
    let tree = test_tree();
    let resources = resource_section(0x2000, &tree);
    let image = resource_image(&resources).open();
    let content = image.resources().unwrap().unwrap();

    assert_eq!(content.is_partial(), false);
    assert_eq!(content.directory.number_of_named_entries, 1);
    assert_eq!(content.directory.number_of_id_entries, 2);
    assert_eq!(content.len(), tree.len());
    assert_eq!(content.leaves().count(), 5);

    for (resource_type, expected) in content.iter().zip(tree.iter()) {
        match &expected.id {
            TestId::Id(id) => assert_eq!(resource_type.id, ResolvedDirectoryID::ID(*id)),
            TestId::Name(name) => assert_eq!(resource_type.id, ResolvedDirectoryID::Name(name.to_string())),
        }

        assert_eq!(resource_type.entries.len(), expected.entries.len());

        for (entry, expected) in resource_type.iter().zip(expected.entries.iter()) {
            let languages = entry.iter().map(|l| l.language_id()).collect::<Vec<_>>();
            let expected_languages = expected.languages.iter().map(|(l, _)| Some(*l)).collect::<Vec<_>>();

            assert_eq!(languages, expected_languages);

            for (language, (_, bytes)) in entry.iter().zip(expected.languages.iter()) {
                assert_eq!(language.code_page, 1252);
                assert_eq!(language.location.size as usize, bytes.len());
                assert_eq!(language.location.section.as_ref().map(|s| s.name.as_str()), Some(".rsrc"));
                assert_eq!(&image.get_bytes(&language.location).unwrap(), bytes);
            }
        }
    }

    let custom = content.by_name("custom").unwrap();
    assert_eq!(custom.to_string(), "CUSTOM");

    let rcdata = content.by_id(ResourceID::RCData).unwrap();
    assert_eq!(rcdata.to_string(), "RCDATA");
    assert_eq!(rcdata.by_name("Config").is_some(), true);
    assert_eq!(rcdata.by_id(101).and_then(|e| e.by_language(1031)).is_some(), true);
    assert_eq!(rcdata.by_id(102).is_none(), true);

    assert_eq!(content.by_id(ResourceID::Icon).is_none(), true);
    assert_eq!(ResolvedDirectoryID::ID(300).to_string(), "#300");
}

#[test]
fn test_resource_registry() {
    let resources = resource_section(0x2000, &test_tree());
    let image = resource_image(&resources).open();
    let content = image.resources().unwrap().unwrap();

    let manifest = content.by_id(ResourceID::Manifest).unwrap();
    let entry = manifest.by_id(1).unwrap();
    let language = entry.by_language(1033).unwrap();

    let data = image.resource_data(manifest, entry, language).unwrap();
    assert_eq!(data.as_text(), Some("<assembly/>"));
    assert_eq!(data.raw_bytes().len(), 14);

    let rcdata = content.by_id(ResourceID::RCData).unwrap();
    let entry = rcdata.by_id(101).unwrap();
    let language = entry.by_language(1033).unwrap();

    let raw = image.resource_data(rcdata, entry, language).unwrap();
    assert_eq!(raw.as_text().is_none(), true);
    assert_eq!(raw.raw_bytes(), b"abc");

    let mut saved = Vec::<u8>::new();
    raw.save(&mut saved).unwrap();
    assert_eq!(saved, b"abc".to_vec());

    let upper: ResourceDecoder = Arc::new(|_: &ResourceType, _: &ResourceEntry, _: &ResourceLanguage, data: Vec<u8>| -> Result<Box<dyn ResourceData>> {
        Ok(Box::new(TextResource::new(data.to_ascii_uppercase())))
    });
    let lower: ResourceDecoder = Arc::new(|_: &ResourceType, _: &ResourceEntry, _: &ResourceLanguage, data: Vec<u8>| -> Result<Box<dyn ResourceData>> {
        Ok(Box::new(TextResource::new(data.to_ascii_lowercase())))
    });

    assert_eq!(image.register_resource_type(ResourceID::RCData, upper), true);
    assert_eq!(image.register_resource_type(ResourceID::RCData, lower), false);

    let decoded = image.resource_data(rcdata, entry, language).unwrap();
    assert_eq!(decoded.as_text(), Some("ABC"));

    let snapshot = image.resource_registry();
    assert_eq!(image.unregister_resource_type(ResourceID::RCData), true);
    assert_eq!(image.unregister_resource_type(ResourceID::RCData), false);
    assert_eq!(snapshot.contains(ResourceID::RCData), true);

    let raw_again = image.resource_data(rcdata, entry, language).unwrap();
    assert_eq!(raw_again.as_text().is_none(), true);

    let custom = content.by_name("CUSTOM").unwrap();
    let custom_entry = custom.by_id(1).unwrap();
    let custom_language = custom_entry.by_language(0).unwrap();
    let text: ResourceDecoder = Arc::new(|_: &ResourceType, _: &ResourceEntry, _: &ResourceLanguage, data: Vec<u8>| -> Result<Box<dyn ResourceData>> {
        Ok(Box::new(TextResource::new(data)))
    });

    assert_eq!(image.register_resource_type("CUSTOM", text), true);
    assert_eq!(image.resource_data(custom, custom_entry, custom_language).unwrap().as_text(), Some("custom"));

    image.set_resource_registry(ResourceRegistry::empty());
    assert_eq!(image.resource_registry().is_empty(), true);
    assert_eq!(image.resource_data(manifest, manifest.by_id(1).unwrap(), manifest.by_id(1).unwrap().by_language(1033).unwrap()).unwrap().as_text().is_none(), true);

    let mut registry = ResourceRegistry::default();
    assert_eq!(registry.len(), 2);
    assert_eq!(registry.contains(ResourceID::HTML), true);
    assert_eq!(registry.unregister(ResourceID::HTML), true);
    assert_eq!(registry.contains(ResourceID::HTML), false);
}

#[test]
fn test_text_resource() {
    let utf16 = [0xFFu8, 0xFE, b'h', 0, b'i', 0, 0, 0];
    assert_eq!(TextResource::new(utf16.to_vec()).text, "hi");
    assert_eq!(TextResource::new(b"plain".to_vec()).text, "plain");
}

#[test]
fn test_resource_subtree_corruption() {
    let tree = test_tree();

    let mut resources = resource_section(0x2000, &tree);
    put_u32(&mut resources.data, 16 + 8 + 4, 0x80000000 | 0xFFF0);

    let image = resource_image(&resources).open();
    let content = image.resources().unwrap().unwrap();

    assert_eq!(content.is_partial(), true);
    assert_eq!(content.len(), 2);
    assert_eq!(content.errors.len(), 1);
    assert_eq!(matches!(content.errors[0], Error::CorruptResourceDirectory { .. }), true);
    assert_eq!(content.by_name("CUSTOM").is_some(), true);
    assert_eq!(content.by_id(ResourceID::Manifest).is_some(), true);
    assert_eq!(content.by_id(ResourceID::RCData).is_none(), true);

    // an entry array that runs past the end of the directory
    let mut resources = resource_section(0x2000, &tree);
    let custom_dir = resources.type_dirs[0];
    put_u16(&mut resources.data, custom_dir + 14, 0x1000);

    let image = resource_image(&resources).open();
    let content = image.resources().unwrap().unwrap();

    assert_eq!(content.len(), 2);
    assert_eq!(content.errors.len(), 1);
    assert_eq!(content.by_name("CUSTOM").is_none(), true);

    // a language entry that points at a subdirectory
    let mut resources = resource_section(0x2000, &tree);
    let entry_dir = resources.entry_dirs[1][1];
    let offset = LittleEndian::read_u32(&resources.data[entry_dir + 16 + 4..]);
    put_u32(&mut resources.data, entry_dir + 16 + 4, 0x80000000 | offset);

    let image = resource_image(&resources).open();
    let content = image.resources().unwrap().unwrap();

    assert_eq!(content.len(), 3);
    assert_eq!(content.errors.is_empty(), true);
    assert_eq!(content.is_partial(), true);

    let entry = content.by_id(ResourceID::RCData).and_then(|t| t.by_id(101)).unwrap();
    assert_eq!(entry.languages.len(), 1);
    assert_eq!(entry.errors.len(), 1);
    assert_eq!(entry.by_language(1031).is_some(), true);
    assert_eq!(content.leaves().count(), 4);
}

#[test]
fn test_resource_shared_subdirectory() {
    let tree = test_tree();

    // resource 101 under RCDATA reuses the language directory of CONFIG
    let mut resources = resource_section(0x2000, &tree);
    let rcdata_dir = resources.type_dirs[1];
    let config_dir = resources.entry_dirs[1][0];
    put_u32(&mut resources.data, rcdata_dir + 16 + 8 + 4, 0x80000000 | config_dir as u32);

    let image = resource_image(&resources).open();
    let content = image.resources().unwrap().unwrap();
    let rcdata = content.by_id(ResourceID::RCData).unwrap();

    assert_eq!(content.is_partial(), true);
    assert_eq!(content.errors.is_empty(), true);
    assert_eq!(rcdata.entries.len(), 1);
    assert_eq!(rcdata.errors.len(), 1);
    assert_eq!(matches!(rcdata.errors[0], Error::CorruptResourceDirectory { offset, .. } if offset == ResourceOffset(config_dir as u32)), true);
    assert_eq!(content.leaves().count(), 3);

    // every type points at the same directory
    let mut resources = resource_section(0x2000, &tree);
    let custom_dir = resources.type_dirs[0];

    for index in 1..tree.len() {
        put_u32(&mut resources.data, 16 + 8 * index + 4, 0x80000000 | custom_dir as u32);
    }

    let image = resource_image(&resources).open();
    let content = image.resources().unwrap().unwrap();

    assert_eq!(content.len(), 1);
    assert_eq!(content.errors.len(), tree.len() - 1);
    assert_eq!(content.leaves().count(), 1);

    // a type that points back at the root
    let mut resources = resource_section(0x2000, &tree);
    put_u32(&mut resources.data, 16 + 4, 0x80000000);

    let image = resource_image(&resources).open();
    let content = image.resources().unwrap().unwrap();

    assert_eq!(content.len(), tree.len() - 1);
    assert_eq!(content.by_name("CUSTOM").is_none(), true);
}

#[test]
fn test_resource_root_corruption() {
    let resources = resource_section(0x2000, &test_tree());
    let image = resource_image(&resources)
        .directory(ImageDirectoryEntry::Resource, 0x2000, 8)
        .open();

    let result = image.resources();
    assert_eq!(matches!(result, Err(Error::CorruptResourceDirectory { .. })), true);
    assert_eq!(result.err().map(|e| e.kind()), Some(ErrorKind::MalformedStructure));
    assert_eq!(image.content_status(ImageDirectoryEntry::Resource), ContentStatus::Failed);
}

#[test]
fn test_imports() {
    let mut text = vec![0u8; 0x200];

    put_u32(&mut text, 0x100, 0x1180);
    put_u32(&mut text, 0x10C, 0x1160);
    put_u32(&mut text, 0x110, 0x1190);
    put_bytes(&mut text, 0x160, b"KERNEL32.dll\0");
    put_u32(&mut text, 0x180, 0x11A0);
    put_u32(&mut text, 0x184, 0x80000010);
    put_u32(&mut text, 0x190, 0x11A0);
    put_u32(&mut text, 0x194, 0x80000010);
    put_u16(&mut text, 0x1A0, 0x0123);
    put_bytes(&mut text, 0x1A2, b"ExitProcess\0");

    let image = TestImage::new(Arch::X86)
        .section(".text", 0x1000, 0x200, 0x400, text)
        .directory(ImageDirectoryEntry::Import, 0x1100, 40)
        .open();

    let imports = image.imports().unwrap().unwrap();
    assert_eq!(imports.len(), 1);

    let kernel32 = imports.by_name("kernel32.DLL").unwrap();
    assert_eq!(kernel32.descriptor.first_thunk, RVA(0x1190));
    assert_eq!(kernel32.functions, vec![
        ImportData::ImportByName { hint: 0x123, name: "ExitProcess".to_string() },
        ImportData::Ordinal(0x10),
    ]);
    assert_eq!(kernel32.by_name("exitprocess").is_some(), true);

    let top = TestImage::new(Arch::X86)
        .section(".text", 0x1000, 0x200, 0x400, vec![0; 0x200])
        .directory(ImageDirectoryEntry::Import, 0xFFFFFFF0, 40)
        .open();

    assert_eq!(top.imports().err().map(|e| e.kind()), Some(ErrorKind::UnmappedAddress));

    let context = LoadContext {
        image: &top,
        directory: DataDirectory { entry: ImageDirectoryEntry::Import, virtual_address: RVA(0xFFFFFFF0), size: 40 },
        location: top.location_of(RVA(0x1000), 40).unwrap(),
        cancel: None,
    };

    assert_eq!(super::imports::load(&context).is_err(), true);
}

#[test]
fn test_tls() {
    let mut text = vec![0u8; 0x400];

    put_u32(&mut text, 0x100, 0x402000);
    put_u32(&mut text, 0x104, 0x402010);
    put_u32(&mut text, 0x108, 0x403000);
    put_u32(&mut text, 0x10C, 0x401200);
    put_u32(&mut text, 0x114, 0x00300000);
    put_u32(&mut text, 0x200, 0x401300);
    put_u32(&mut text, 0x204, 0x401310);

    let image = TestImage::new(Arch::X86)
        .section(".text", 0x1000, 0x400, 0x400, text)
        .directory(ImageDirectoryEntry::TLS, 0x1100, 24)
        .open();

    let tls = image.tls().unwrap().unwrap();
    assert_eq!(tls.arch, Arch::X86);
    assert_eq!(tls.start_address(), VA::VA32(VA32(0x402000)));
    assert_eq!(tls.raw_data_size(), 0x10);
    assert_eq!(tls.index_address(), VA::VA32(VA32(0x403000)));
    assert_eq!(tls.alignment(), Some(4));
    assert_eq!(tls.callbacks(&image).unwrap(), vec![VA::VA32(VA32(0x401300)), VA::VA32(VA32(0x401310))]);

    let mut text = vec![0u8; 0x400];

    put_u64(&mut text, 0x100, 0x140002000);
    put_u64(&mut text, 0x108, 0x140002100);
    put_u64(&mut text, 0x110, 0x140003000);
    put_u64(&mut text, 0x118, 0);

    let image = TestImage::new(Arch::X64)
        .section(".text", 0x1000, 0x400, 0x400, text)
        .directory(ImageDirectoryEntry::TLS, 0x1100, 40)
        .open();

    let tls = image.tls().unwrap().unwrap();
    assert_eq!(tls.arch, Arch::X64);
    assert_eq!(tls.end_address(), VA::VA64(VA64(0x140002100)));
    assert_eq!(tls.raw_data_size(), 0x100);
    assert_eq!(tls.alignment(), None);
    assert_eq!(tls.callbacks(&image).unwrap().is_empty(), true);

    let short = TestImage::new(Arch::X64)
        .section(".text", 0x1000, 0x400, 0x400, vec![0; 0x400])
        .directory(ImageDirectoryEntry::TLS, 0x1100, 24)
        .open();

    assert_eq!(matches!(short.tls(), Err(Error::CorruptDirectory(ImageDirectoryEntry::TLS, _))), true);
}

fn clr_image(signature: u32) -> TestImage {
    let mut text = vec![0u8; 0x400];

    put_u32(&mut text, 0x100, 72);
    put_u16(&mut text, 0x104, 2);
    put_u16(&mut text, 0x106, 5);
    put_u32(&mut text, 0x108, 0x1200);
    put_u32(&mut text, 0x10C, 0x40);
    put_u32(&mut text, 0x110, 1);
    put_u32(&mut text, 0x114, 0x06000001);

    put_u32(&mut text, 0x200, signature);
    put_u16(&mut text, 0x204, 1);
    put_u16(&mut text, 0x206, 1);
    put_u32(&mut text, 0x20C, 12);
    put_bytes(&mut text, 0x210, b"v4.0.30319\0\0");
    put_u16(&mut text, 0x21E, 5);

    TestImage::new(Arch::X86)
        .section(".text", 0x1000, 0x400, 0x400, text)
        .directory(ImageDirectoryEntry::CLRRuntimeHeader, 0x1100, 72)
}

#[test]
fn test_clr() {
    let image = clr_image(CLR_METADATA_SIGNATURE).open();
    let clr = image.clr().unwrap().unwrap();

    assert_eq!(clr.header.cb, 72);
    assert_eq!(clr.header.major_runtime_version, 2);
    assert_eq!(clr.header.metadata.virtual_address, RVA(0x1200));
    assert_eq!(clr.header.entry_point_token, 0x06000001);
    assert_eq!(clr.is_il_only(), true);
    assert_eq!(clr.version(), "v4.0.30319");
    assert_eq!(clr.metadata.version_length, 12);
    assert_eq!(clr.metadata.number_of_streams, 5);
    assert_eq!(clr.metadata.size(), 0x20);
    assert_eq!(clr.metadata_location.offset, Offset(0x600));

    let bad = clr_image(0xDEADBEEF).open();
    let result = bad.clr();

    assert_eq!(matches!(result, Err(Error::InvalidCLRSignature(0xDEADBEEF))), true);
    assert_eq!(result.err().map(|e| e.kind()), Some(ErrorKind::MalformedStructure));
}

#[test]
fn test_errors() {
    let error = Error::from(io::Error::new(io::ErrorKind::UnexpectedEof, "eof"));

    assert_eq!(error.kind(), ErrorKind::IOFailure);
    assert_eq!(error.clone().to_string(), error.to_string());
    assert_eq!(Error::UnmappedAddress(RVA(0x1234)).to_string(), "address 0x00001234 is not mapped by any section");

    let short = Error::ShortRead { offset: 0x1_0000_0400, expected: 4, actual: 1 };
    assert_eq!(short.to_string(), "short read at 0x100000400: expected 4 bytes, got 1");
    assert_eq!(short.kind(), ErrorKind::IOFailure);
}

#[test]
fn test_hashes_and_entropy() {
    let data = b"abc".to_vec();

    assert_eq!(hex::encode(data.md5()), "900150983cd24fb0d6963f7d28e17f72");
    assert_eq!(hex::encode(data.sha1()), "a9993e364706816aba3e25717850c26c9cd0d89d");
    assert_eq!(hex::encode(data.sha256()), "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad");

    assert_eq!(vec![0u8; 256].entropy(), 0.0);
    assert_eq!((0..=255u8).collect::<Vec<u8>>().entropy(), 8.0);
    assert_eq!(Vec::<u8>::new().entropy(), 0.0);

    assert_eq!(padded_string(b".text\0\0\0"), ".text");
    assert_eq!(zero_terminated(b"abc"), None);
    assert_eq!(utf16_string(&[b'o', 0, b'k', 0]), "ok");
}
