//! Fixtures for the end-to-end tests: a minimal PE32 image and a matching
//! PDB container, both assembled byte by byte.
//!
//! Image layout (fixed, so tests can assert exact offsets):
//!
//! ```text
//! 0x000  DOS header, e_lfanew = 0x80
//! 0x088  FileHeader.TimeDateStamp
//! 0x0D8  OptionalHeader.CheckSum
//! 0x178  section table (.text at RVA 0x1000, .rdata at RVA 0x2000)
//! 0x400  debug directory (one CodeView entry)
//! 0x420  CodeView record: guid, age 2, "test.pdb"
//! ```

use std::path::Path;

use pestamp::{
    file::io::write_le_at,
    pdb::{
        dbi::{DbiHeader, DbiModuleInfo, DbiSectionContrib},
        stream::PdbStream,
        writer, PdbFile,
    },
};

/// The signature shared by the fixture image and PDB.
pub const TEST_GUID: [u8; 16] = [
    0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xF0, 0x01,
];

/// Age recorded in the fixture image and PDB before canonicalization.
pub const TEST_AGE: u32 = 2;

/// File offset of `FileHeader.TimeDateStamp` in the fixture image.
pub const IMAGE_TIMESTAMP_OFFSET: usize = 0x88;
/// File offset of `OptionalHeader.CheckSum` in the fixture image.
pub const IMAGE_CHECKSUM_OFFSET: usize = 0xD8;
/// File offset of the CodeView signature in the fixture image.
pub const IMAGE_CV_GUID_OFFSET: usize = 0x424;
/// File offset of the CodeView age in the fixture image.
pub const IMAGE_CV_AGE_OFFSET: usize = 0x434;

fn w16(image: &mut [u8], offset: usize, value: u16) {
    write_le_at(image, offset, value).unwrap();
}

fn w32(image: &mut [u8], offset: usize, value: u32) {
    write_le_at(image, offset, value).unwrap();
}

/// Builds the fixture image, with or without a debug directory and CodeView
/// record.
pub fn build_image(with_codeview: bool) -> Vec<u8> {
    let mut image = vec![0_u8; 0x600];

    // DOS header.
    image[0] = b'M';
    image[1] = b'Z';
    w32(&mut image, 0x3C, 0x80);

    // NT headers.
    w32(&mut image, 0x80, 0x0000_4550);
    w16(&mut image, 0x84, 0x014C);
    w16(&mut image, 0x86, 2);
    w32(&mut image, 0x88, 0x5E1A_2B3C);
    w16(&mut image, 0x94, 224);
    w16(&mut image, 0x96, 0x0102);

    w16(&mut image, 0x98, 0x010B);
    image[0x9A] = 14;
    w32(&mut image, 0x9C, 0x200);
    w32(&mut image, 0xA0, 0x200);
    w32(&mut image, 0xA8, 0x1000);
    w32(&mut image, 0xAC, 0x1000);
    w32(&mut image, 0xB0, 0x2000);
    w32(&mut image, 0xB4, 0x0040_0000);
    w32(&mut image, 0xB8, 0x1000);
    w32(&mut image, 0xBC, 0x200);
    w16(&mut image, 0xC0, 6);
    w16(&mut image, 0xC8, 6);
    w32(&mut image, 0xD0, 0x3000);
    w32(&mut image, 0xD4, 0x200);
    w32(&mut image, 0xD8, 0xAABB_CCDD);
    w16(&mut image, 0xDC, 3);
    w32(&mut image, 0xE0, 0x0010_0000);
    w32(&mut image, 0xE4, 0x1000);
    w32(&mut image, 0xE8, 0x0010_0000);
    w32(&mut image, 0xEC, 0x1000);
    w32(&mut image, 0xF4, 16);

    if with_codeview {
        w32(&mut image, 0xF8 + 6 * 8, 0x2000);
        w32(&mut image, 0xFC + 6 * 8, 28);
    }

    // Section table.
    let text = 0x178;
    image[text..text + 5].copy_from_slice(b".text");
    w32(&mut image, text + 8, 0x1F0);
    w32(&mut image, text + 12, 0x1000);
    w32(&mut image, text + 16, 0x200);
    w32(&mut image, text + 20, 0x200);
    w32(&mut image, text + 36, 0x6000_0020);

    let rdata = 0x1A0;
    image[rdata..rdata + 6].copy_from_slice(b".rdata");
    w32(&mut image, rdata + 8, 0x200);
    w32(&mut image, rdata + 12, 0x2000);
    w32(&mut image, rdata + 16, 0x200);
    w32(&mut image, rdata + 20, 0x400);
    w32(&mut image, rdata + 36, 0x4000_0040);

    for offset in 0x200..0x400 {
        image[offset] = (offset as u8) ^ 0xA5;
    }

    if with_codeview {
        // One debug directory entry of type CodeView.
        w32(&mut image, 0x404, 0x5E1A_2B3C);
        w32(&mut image, 0x40C, 2);
        w32(&mut image, 0x410, 24 + 9);
        w32(&mut image, 0x414, 0x2020);
        w32(&mut image, 0x418, 0x420);

        w32(&mut image, 0x420, 0x5344_5352);
        image[0x424..0x434].copy_from_slice(&TEST_GUID);
        w32(&mut image, 0x434, TEST_AGE);
        image[0x438..0x441].copy_from_slice(b"test.pdb\0");
    }

    image
}

/// Builds the header info stream of the fixture PDB.
fn info_stream() -> Vec<u8> {
    let mut data = vec![0_u8; 32];
    w32(&mut data, 0, 20_000_404); // version
    w32(&mut data, 4, 0x1122_3344); // timestamp
    w32(&mut data, 8, TEST_AGE);
    data[12..28].copy_from_slice(&TEST_GUID);
    data
}

/// Builds the DBI stream of the fixture PDB: one module info record and one
/// section contribution, with garbage in every field the rewrite must clear.
fn dbi_stream() -> Vec<u8> {
    let mut data = vec![0_u8; DbiHeader::SIZE];
    w32(&mut data, 0, 0xFFFF_FFFF);
    w32(&mut data, 4, 19_990_903);
    w32(&mut data, DbiHeader::AGE, TEST_AGE);
    w16(&mut data, DbiHeader::PUBLIC_SYMBOL_INFO_STREAM, 6);
    w16(&mut data, DbiHeader::SYMBOL_RECORD_STREAM, 5);

    let mut modi = vec![0_u8; DbiModuleInfo::SIZE];
    w32(&mut modi, DbiModuleInfo::OFFSETS, 0xDEAD_BEEF);
    modi.extend_from_slice(b"a.obj\0");
    modi.extend_from_slice(b"a.obj\0");
    w32(&mut data, DbiHeader::GP_MODI_SIZE, modi.len() as u32);
    data.extend_from_slice(&modi);

    let mut contrib = vec![0_u8; DbiSectionContrib::SIZE];
    w16(&mut contrib, DbiSectionContrib::PAD1, 0xAAAA);
    w16(&mut contrib, DbiSectionContrib::PAD2, 0xBBBB);
    w32(
        &mut data,
        DbiHeader::SECTION_CONTRIBUTION_SIZE,
        contrib.len() as u32,
    );
    data.extend_from_slice(&0xF12E_BA2D_u32.to_le_bytes());
    data.extend_from_slice(&contrib);

    data
}

/// Builds the symbol record stream: one record whose name terminator is
/// followed by junk padding.
fn symbol_record_stream() -> Vec<u8> {
    let mut payload = vec![0x0E, 0x11];
    payload.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
    payload.extend_from_slice(b"f\0");
    payload.extend_from_slice(&[0xCC, 0xCC]);

    let mut data = 14_u16.to_le_bytes().to_vec();
    data.extend_from_slice(&payload);
    data
}

/// Builds the public symbol info stream: a 28-byte header with junk in the
/// padding word at offset 24.
fn public_stream() -> Vec<u8> {
    let mut data = vec![0_u8; 28];
    w32(&mut data, 24, 0xEEEE_EEEE);
    data
}

/// Writes a PDB matching the fixture image's CodeView record to `path`.
pub fn write_matching_pdb(path: &Path) {
    let mut pdb = PdbFile::new();
    pdb.push_stream(Some(PdbStream::from_bytes(vec![1, 2, 3, 4]))); // old directory
    pdb.push_stream(Some(PdbStream::from_bytes(info_stream())));
    pdb.push_stream(Some(PdbStream::from_bytes(b"TPI placeholder".to_vec())));
    pdb.push_stream(Some(PdbStream::from_bytes(dbi_stream())));
    pdb.push_stream(Some(PdbStream::from_bytes(Vec::new())));
    pdb.push_stream(Some(PdbStream::from_bytes(symbol_record_stream())));
    pdb.push_stream(Some(PdbStream::from_bytes(public_stream())));

    writer::write(path, &pdb).unwrap();
}
