use alloc::{string::String, vec::Vec};
use core::mem::size_of;

use kagami_win32::ntdef::{
    ImageImportDescriptor,
    IMAGE_DIRECTORY_ENTRY_IMPORT,
    IMAGE_ORDINAL_FLAG32,
    IMAGE_ORDINAL_FLAG64,
};

use crate::{error::PeError, headers::PeImage};

/// Caps on hostile images: no real module comes close to either.
const MAX_DESCRIPTORS: u32 = 4096;
const MAX_THUNKS: u32 = 0x1_0000;
const MAX_NAME_LEN: usize = 512;

/// One declared import: the IAT slot at `thunk_rva` should hold `dll`'s
/// `name` (or the export with `ordinal` when imported by ordinal).
#[derive(Clone, PartialEq, Eq)]
pub struct ImportEntry {
    pub dll:       String,
    pub thunk_rva: u32,
    pub name:      Option<String>,
    pub ordinal:   Option<u16>,
}

/// Walk the import descriptor array and the original-first-thunk list of
/// each descriptor.
///
/// An image without an import directory yields an empty list; descriptors
/// or thunk lists pointing outside the buffer are a hard failure.
pub fn enumerate_imports(image: &PeImage) -> Result<Vec<ImportEntry>, PeError> {
    let dir = match image.headers.data_directory(IMAGE_DIRECTORY_ENTRY_IMPORT) {
        Some(dir) => dir,
        None => return Ok(Vec::new()),
    };

    let is_64 = image.headers.is_64;
    let thunk_size = image.headers.thunk_size() as u32;
    let mut entries = Vec::new();

    for index in 0 .. MAX_DESCRIPTORS {
        let desc_rva = dir
            .virtual_address
            .checked_add(index * size_of::<ImageImportDescriptor>() as u32)
            .ok_or(PeError::BadImportDescriptor)?;
        let desc: ImageImportDescriptor = image
            .read_struct_at_rva(desc_rva)
            .ok_or(PeError::BadImportDescriptor)?;
        if desc.original_first_thunk == 0 && desc.first_thunk == 0 && desc.name == 0 {
            break;
        }

        let dll = image
            .cstr_at_rva(desc.name, MAX_NAME_LEN)
            .ok_or(PeError::BadImportDescriptor)?;

        // the hint/name table survives binding; fall back to the IAT list
        // for images that never had one
        let lookup_rva = if desc.original_first_thunk != 0 {
            desc.original_first_thunk
        }
        else {
            desc.first_thunk
        };

        for thunk_index in 0 .. MAX_THUNKS {
            let offset = thunk_index
                .checked_mul(thunk_size)
                .ok_or(PeError::BadImportDescriptor)?;
            let entry_rva = lookup_rva
                .checked_add(offset)
                .ok_or(PeError::BadImportDescriptor)?;

            let (raw, by_ordinal, ordinal_or_hint_rva) = if is_64 {
                let value = image
                    .read_u64_at_rva(entry_rva)
                    .ok_or(PeError::BadImportDescriptor)?;
                (
                    value,
                    value & IMAGE_ORDINAL_FLAG64 != 0,
                    (value & 0x7fff_ffff) as u32,
                )
            }
            else {
                let value = image
                    .read_u32_at_rva(entry_rva)
                    .ok_or(PeError::BadImportDescriptor)?;
                (
                    u64::from(value),
                    value & IMAGE_ORDINAL_FLAG32 != 0,
                    value & 0x7fff_ffff,
                )
            };
            if raw == 0 {
                break;
            }

            let thunk_rva = desc
                .first_thunk
                .checked_add(offset)
                .ok_or(PeError::BadImportDescriptor)?;
            if by_ordinal {
                entries.push(ImportEntry {
                    dll: dll.clone(),
                    thunk_rva,
                    name: None,
                    ordinal: Some((raw & 0xffff) as u16),
                });
            }
            else {
                // skip the 2-byte hint in front of the name
                let name = image
                    .cstr_at_rva(
                        ordinal_or_hint_rva
                            .checked_add(2)
                            .ok_or(PeError::BadImportDescriptor)?,
                        MAX_NAME_LEN,
                    )
                    .ok_or(PeError::BadImportDescriptor)?;
                entries.push(ImportEntry {
                    dll: dll.clone(),
                    thunk_rva,
                    name: Some(name),
                    ordinal: None,
                });
            }
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use kagami_win32::ntdef::ImageDataDirectory;

    use super::*;
    use crate::headers::{
        tests::{build_pe64_raw, bytes_of},
        Layout,
    };

    /// Import payload at rva 0x1000: one descriptor for kernel32.dll with
    /// a named import and an ordinal import, then the terminator.
    fn build_imports_payload() -> vec::Vec<u8> {
        const BASE: u32 = 0x1000;
        let mut payload = vec![0u8; 0x400];

        let desc_size = size_of::<ImageImportDescriptor>() as u32;
        let oft_rva = BASE + 2 * desc_size;
        let iat_rva = oft_rva + 3 * 8;
        let dll_name_rva = iat_rva + 3 * 8;
        let hint_name_rva = dll_name_rva + 16;

        let desc = ImageImportDescriptor {
            original_first_thunk: oft_rva,
            time_date_stamp:      0,
            forwarder_chain:      0,
            name:                 dll_name_rva,
            first_thunk:          iat_rva,
        };

        let mut write = |rva: u32, bytes: &[u8]| {
            let off = (rva - BASE) as usize;
            payload[off .. off + bytes.len()].copy_from_slice(bytes);
        };
        write(BASE, bytes_of(&desc));
        // OFT: name thunk, ordinal thunk, terminator
        write(oft_rva, &u64::from(hint_name_rva).to_le_bytes());
        write(oft_rva + 8, &(IMAGE_ORDINAL_FLAG64 | 42).to_le_bytes());
        write(dll_name_rva, b"KERNEL32.dll\0");
        write(hint_name_rva, &1u16.to_le_bytes());
        write(hint_name_rva + 2, b"HeapAlloc\0");
        payload
    }

    fn build_image_with_imports() -> vec::Vec<u8> {
        let mut buf = build_pe64_raw(&build_imports_payload());
        let dir = ImageDataDirectory {
            virtual_address: 0x1000,
            size:            0x400,
        };
        let opt_off = 0x80 + 4 + size_of::<kagami_win32::ntdef::ImageFileHeader>();
        // data_directory[1] follows the export entry at +0x70
        let dir_off = opt_off + 0x78;
        buf[dir_off .. dir_off + 8].copy_from_slice(bytes_of(&dir));
        buf
    }

    #[test]
    fn no_import_directory_is_empty_not_error() {
        let buf = build_pe64_raw(&[]);
        let image = PeImage::parse(&buf, Layout::Raw).unwrap();
        assert!(enumerate_imports(&image).unwrap().is_empty());
    }

    #[test]
    fn named_and_ordinal_imports_are_walked() {
        let buf = build_image_with_imports();
        let image = PeImage::parse(&buf, Layout::Raw).unwrap();
        let entries = enumerate_imports(&image).unwrap();
        assert_eq!(entries.len(), 2);

        assert_eq!(entries[0].dll, "KERNEL32.dll");
        assert_eq!(entries[0].name.as_deref(), Some("HeapAlloc"));
        assert_eq!(entries[0].ordinal, None);

        assert_eq!(entries[1].name, None);
        assert_eq!(entries[1].ordinal, Some(42));
        // thunk RVAs index into the IAT, 8 bytes apart
        assert_eq!(entries[1].thunk_rva, entries[0].thunk_rva + 8);
    }

    #[test]
    fn descriptor_outside_image_is_a_hard_failure() {
        let mut buf = build_image_with_imports();
        let opt_off = 0x80 + 4 + size_of::<kagami_win32::ntdef::ImageFileHeader>();
        let dir_off = opt_off + 0x78;
        buf[dir_off .. dir_off + 4].copy_from_slice(&0x8_0000u32.to_le_bytes());
        let image = PeImage::parse(&buf, Layout::Raw).unwrap();
        assert_eq!(
            enumerate_imports(&image).err(),
            Some(PeError::BadImportDescriptor)
        );
    }
}
