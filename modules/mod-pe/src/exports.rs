use alloc::{collections::BTreeSet, string::String, vec::Vec};

use kagami_win32::ntdef::{ImageExportDirectory, IMAGE_DIRECTORY_ENTRY_EXPORT};

use crate::{error::PeError, headers::PeImage};

/// Upper bound on the function/name arrays of one export directory.
const MAX_EXPORTS: u32 = 0x2_0000;
/// Longest accepted export or forwarder name.
const MAX_NAME_LEN: usize = 512;

/// One row of a module's export directory.
///
/// Aliased exports produce one entry per name, all sharing the same RVA;
/// ordinal-only exports carry no name. A forwarder holds the
/// `targetdll.TargetFunc` string instead of code.
#[derive(Clone, PartialEq, Eq)]
pub struct ExportEntry {
    pub ordinal:   u32,
    pub rva:       u32,
    pub name:      Option<String>,
    pub forwarder: Option<String>,
}

/// Enumerate the export directory of `image`.
///
/// A module without an export directory yields an empty list; a directory
/// whose arrays cannot be read is a hard failure.
pub fn enumerate_exports(image: &PeImage) -> Result<Vec<ExportEntry>, PeError> {
    let dir = match image.headers.data_directory(IMAGE_DIRECTORY_ENTRY_EXPORT) {
        Some(dir) => dir,
        None => return Ok(Vec::new()),
    };
    let export_dir: ImageExportDirectory = image
        .read_struct_at_rva(dir.virtual_address)
        .ok_or(PeError::BadExportDirectory)?;

    let function_count = export_dir.number_of_functions.min(MAX_EXPORTS);
    let name_count = export_dir.number_of_names.min(MAX_EXPORTS);

    let functions = read_u32_array(image, export_dir.address_of_functions, function_count)?;
    let names = read_u32_array(image, export_dir.address_of_names, name_count)?;
    let ordinals = read_u16_array(image, export_dir.address_of_name_ordinals, name_count)?;

    let forwarder_span = dir.virtual_address .. dir.virtual_address.saturating_add(dir.size);

    // names first, so aliases come out as separate entries sharing an RVA
    let mut named_indices: BTreeSet<u32> = BTreeSet::new();
    let mut entries = Vec::with_capacity(functions.len());
    for (name_rva, ord_index) in names.iter().zip(ordinals.iter()) {
        let index = u32::from(*ord_index);
        let rva = match functions.get(index as usize) {
            Some(&rva) if rva != 0 => rva,
            _ => continue,
        };
        let name = image
            .cstr_at_rva(*name_rva, MAX_NAME_LEN)
            .ok_or(PeError::BadExportDirectory)?;
        named_indices.insert(index);
        entries.push(ExportEntry {
            ordinal: export_dir.base.wrapping_add(index),
            rva,
            name: Some(name),
            forwarder: forwarder_at(image, rva, &forwarder_span),
        });
    }

    // the rest are exported by ordinal only
    for (index, &rva) in functions.iter().enumerate() {
        if rva == 0 || named_indices.contains(&(index as u32)) {
            continue;
        }
        entries.push(ExportEntry {
            ordinal: export_dir.base.wrapping_add(index as u32),
            rva,
            name: None,
            forwarder: forwarder_at(image, rva, &forwarder_span),
        });
    }
    Ok(entries)
}

/// An export whose RVA points back inside the export directory is a
/// forwarder; the bytes there hold the target as `dll.Func` or `dll.#123`.
fn forwarder_at(image: &PeImage, rva: u32, span: &core::ops::Range<u32>) -> Option<String> {
    if span.contains(&rva) {
        image.cstr_at_rva(rva, MAX_NAME_LEN)
    }
    else {
        None
    }
}

fn read_u32_array(image: &PeImage, rva: u32, count: u32) -> Result<Vec<u32>, PeError> {
    let bytes = image
        .slice_at_rva(rva, count as usize * 4)
        .ok_or(PeError::BadExportDirectory)?;
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

fn read_u16_array(image: &PeImage, rva: u32, count: u32) -> Result<Vec<u16>, PeError> {
    let bytes = image
        .slice_at_rva(rva, count as usize * 2)
        .ok_or(PeError::BadExportDirectory)?;
    Ok(bytes
        .chunks_exact(2)
        .map(|chunk| u16::from_le_bytes([chunk[0], chunk[1]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use alloc::{vec, vec::Vec};
    use core::mem::size_of;

    use kagami_win32::ntdef::ImageDataDirectory;

    use super::*;
    use crate::headers::{
        tests::{build_pe64_raw, bytes_of},
        Layout,
    };

    /// Export directory living at rva 0x1000 with:
    ///   ordinal base 1, three function slots, names "Alpha", "AlphaAlias"
    ///   (both ordinal index 0), "Forwarded" (index 2 -> forwarder string).
    fn build_exports_payload() -> Vec<u8> {
        const BASE: u32 = 0x1000;
        let mut payload = vec![0u8; 0x400];

        let dir_size = size_of::<ImageExportDirectory>() as u32;
        let functions_rva = BASE + dir_size;
        let names_rva = functions_rva + 3 * 4;
        let ordinals_rva = names_rva + 3 * 4;
        let strings_rva = ordinals_rva + 3 * 2;

        let alpha_rva = strings_rva;
        let alias_rva = alpha_rva + 6;
        let fwd_name_rva = alias_rva + 11;
        let fwd_target_rva = fwd_name_rva + 10;

        let export_dir = ImageExportDirectory {
            characteristics: 0,
            time_date_stamp: 0,
            major_version: 0,
            minor_version: 0,
            name: 0,
            base: 1,
            number_of_functions: 3,
            number_of_names: 3,
            address_of_functions: functions_rva,
            address_of_names: names_rva,
            address_of_name_ordinals: ordinals_rva,
        };

        let mut write = |rva: u32, bytes: &[u8]| {
            let off = (rva - BASE) as usize;
            payload[off .. off + bytes.len()].copy_from_slice(bytes);
        };
        write(BASE, bytes_of(&export_dir));
        // functions: [code rva, ordinal-only code rva, forwarder rva]
        write(functions_rva, &0x1800u32.to_le_bytes());
        write(functions_rva + 4, &0x1900u32.to_le_bytes());
        write(functions_rva + 8, &fwd_target_rva.to_le_bytes());
        // names -> ordinal indices [0, 0, 2]
        write(names_rva, &alpha_rva.to_le_bytes());
        write(names_rva + 4, &alias_rva.to_le_bytes());
        write(names_rva + 8, &fwd_name_rva.to_le_bytes());
        write(ordinals_rva, &0u16.to_le_bytes());
        write(ordinals_rva + 2, &0u16.to_le_bytes());
        write(ordinals_rva + 4, &2u16.to_le_bytes());
        write(alpha_rva, b"Alpha\0");
        write(alias_rva, b"AlphaAlias\0");
        write(fwd_name_rva, b"Forwarded\0");
        write(fwd_target_rva, b"ntdll.RtlTarget\0");
        payload
    }

    fn build_image_with_exports() -> Vec<u8> {
        let mut buf = build_pe64_raw(&build_exports_payload());
        // point data_directory[0] at the export payload; the directory
        // array of the 64-bit optional header starts 0x70 from its end
        let dir = ImageDataDirectory {
            virtual_address: 0x1000,
            size:            0x400,
        };
        let nt_off = 0x80usize;
        let opt_off = nt_off + 4 + size_of::<kagami_win32::ntdef::ImageFileHeader>();
        let dir_off = opt_off + 0x70;
        buf[dir_off .. dir_off + 8].copy_from_slice(bytes_of(&dir));
        buf
    }

    #[test]
    fn no_export_directory_is_empty_not_error() {
        let buf = build_pe64_raw(&[]);
        let image = PeImage::parse(&buf, Layout::Raw).unwrap();
        assert!(enumerate_exports(&image).unwrap().is_empty());
    }

    #[test]
    fn aliases_share_an_rva() {
        let buf = build_image_with_exports();
        let image = PeImage::parse(&buf, Layout::Raw).unwrap();
        let entries = enumerate_exports(&image).unwrap();

        let aliased: Vec<_> = entries.iter().filter(|e| e.rva == 0x1800).collect();
        assert_eq!(aliased.len(), 2);
        let mut names: Vec<_> = aliased.iter().filter_map(|e| e.name.as_deref()).collect();
        names.sort_unstable();
        assert_eq!(names, ["Alpha", "AlphaAlias"]);
    }

    #[test]
    fn ordinal_only_export_has_no_name() {
        let buf = build_image_with_exports();
        let image = PeImage::parse(&buf, Layout::Raw).unwrap();
        let entries = enumerate_exports(&image).unwrap();

        let by_ordinal: Vec<_> = entries.iter().filter(|e| e.name.is_none()).collect();
        assert_eq!(by_ordinal.len(), 1);
        assert_eq!(by_ordinal[0].rva, 0x1900);
        assert_eq!(by_ordinal[0].ordinal, 2);
    }

    #[test]
    fn forwarder_string_is_captured() {
        let buf = build_image_with_exports();
        let image = PeImage::parse(&buf, Layout::Raw).unwrap();
        let entries = enumerate_exports(&image).unwrap();

        let forwarded = entries
            .iter()
            .find(|e| e.name.as_deref() == Some("Forwarded"))
            .unwrap();
        assert_eq!(forwarded.forwarder.as_deref(), Some("ntdll.RtlTarget"));
    }

    #[test]
    fn unreadable_arrays_are_a_hard_failure() {
        let mut buf = build_image_with_exports();
        // send address_of_functions outside the image
        let functions_field_off = 0x200 + 28;
        buf[functions_field_off .. functions_field_off + 4]
            .copy_from_slice(&0x9_0000u32.to_le_bytes());
        let image = PeImage::parse(&buf, Layout::Raw).unwrap();
        assert_eq!(
            enumerate_exports(&image).err(),
            Some(PeError::BadExportDirectory)
        );
    }
}
