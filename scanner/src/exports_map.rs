use core::fmt::{Display, Formatter};
use std::collections::{BTreeMap, BTreeSet};

use log::{debug, warn};
use mod_pe::{enumerate_exports, ExportEntry, Layout, PeImage};

use crate::{error::ScanError, registry::ModuleRegistry};

/// Lowercase file name without extension: `C:\Windows\System32\ntdll.dll`
/// becomes `ntdll`.
pub fn dll_short_name(path: &str) -> String {
    let file = path
        .rsplit(|c| c == '\\' || c == '/')
        .next()
        .unwrap_or(path);
    let stem = match file.rsplit_once('.') {
        Some((stem, _ext)) if !stem.is_empty() => stem,
        _ => file,
    };
    stem.to_ascii_lowercase()
}

/// One exported function, identified by library short name, export name
/// (or `#<ordinal>` when nameless) and RVA inside its library.
///
/// A value type: aliased and forwarded exports produce several of these
/// sharing one virtual address, held in a set, with no back-pointers.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct ExportedFunc {
    pub lib:  String,
    pub name: String,
    pub rva:  u32,
}

impl ExportedFunc {
    pub fn new(lib: &str, name: &str, rva: u32) -> Self {
        Self {
            lib: lib.to_ascii_lowercase(),
            name: String::from(name),
            rva,
        }
    }

    /// Same function identity. An empty name matches no one.
    pub fn is_same_name(&self, other: &Self) -> bool {
        !self.name.is_empty() && self.name == other.name
    }

    pub fn is_same_lib(&self, other: &Self) -> bool { self.lib == other.lib }
}

impl Display for ExportedFunc {
    fn fmt(&self, f: &mut Formatter) -> core::fmt::Result {
        write!(f, "{}.{}", self.lib, self.name)
    }
}

struct DllInfo {
    path: String,
    size: u64,
}

/// Everything every loaded DLL exports, keyed by the virtual address the
/// export currently resolves to.
///
/// A pure view over the on-disk images, built once per scan pass; it is
/// not kept consistent with runtime unloads during the pass.
#[derive(Default)]
pub struct ExportsMap {
    dlls: BTreeMap<u64, DllInfo>,
    va_to_funcs: BTreeMap<u64, BTreeSet<ExportedFunc>>,
    name_to_va: BTreeMap<(String, String), u64>,
    pending_forwarders: Vec<(ExportedFunc, String, String)>,
}

impl ExportsMap {
    pub fn new() -> Self { Self::default() }

    /// Build the map from the on-disk image of every module in the
    /// registry, then resolve forwarder chains.
    pub fn from_registry(registry: &ModuleRegistry) -> Result<Self, ScanError> {
        let mut map = Self::new();
        for module in registry.iter() {
            let buf = match std::fs::read(&module.path) {
                Ok(buf) => buf,
                Err(_) => {
                    warn!("cannot read module file: {}", module.path);
                    continue;
                },
            };
            let image = match PeImage::parse(&buf, Layout::Raw) {
                Ok(image) => image,
                Err(err) => {
                    warn!("cannot parse {}: {}", module.path, err);
                    continue;
                },
            };
            let entries = match enumerate_exports(&image) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!("export directory of {} is malformed: {}", module.path, err);
                    continue;
                },
            };
            map.add_dll(module.base, &module.path, u64::from(image.headers.image_size), &entries);
        }
        map.resolve_forwarders();
        Ok(map)
    }

    /// Register one DLL's exports at its load base. Forwarders are queued
    /// and materialize once their target DLL is known.
    pub fn add_dll(&mut self, base: u64, path: &str, image_size: u64, entries: &[ExportEntry]) {
        if base == 0 {
            return;
        }
        let lib = dll_short_name(path);
        self.dlls.insert(base, DllInfo {
            path: String::from(path),
            size: image_size,
        });

        for entry in entries {
            let name = match &entry.name {
                Some(name) => name.clone(),
                None => format!("#{}", entry.ordinal),
            };
            let func = ExportedFunc {
                lib: lib.clone(),
                name,
                rva: entry.rva,
            };
            if let Some(forwarder) = &entry.forwarder {
                if let Some((target_lib, target_name)) = forwarder.rsplit_once('.') {
                    self.pending_forwarders.push((
                        func,
                        target_lib.to_ascii_lowercase(),
                        String::from(target_name),
                    ));
                }
                continue;
            }
            let va = base + u64::from(entry.rva);
            self.name_to_va
                .insert((func.lib.clone(), func.name.clone()), va);
            self.va_to_funcs.entry(va).or_default().insert(func);
        }
    }

    /// Attach forwarded exports to the VA of their final target. Chains
    /// (a forwarder pointing at another forwarder) settle over repeated
    /// passes; anything unresolved when the passes stop making progress
    /// points at a DLL that is not loaded.
    pub fn resolve_forwarders(&mut self) {
        let mut pending = core::mem::take(&mut self.pending_forwarders);
        loop {
            let before = pending.len();
            pending.retain(|(func, target_lib, target_name)| {
                let key = (target_lib.clone(), target_name.clone());
                match self.name_to_va.get(&key) {
                    Some(&va) => {
                        self.name_to_va
                            .insert((func.lib.clone(), func.name.clone()), va);
                        self.va_to_funcs.entry(va).or_default().insert(func.clone());
                        false
                    },
                    None => true,
                }
            });
            if pending.len() == before {
                break;
            }
        }
        for (func, target_lib, _) in &pending {
            debug!("unresolved forwarder {} -> {}.*", func, target_lib);
        }
    }

    /// Every export resolving to `va`. Multi-valued to preserve aliases.
    pub fn find_exports_by_va(&self, va: u64) -> Option<&BTreeSet<ExportedFunc>> {
        self.va_to_funcs.get(&va).filter(|set| !set.is_empty())
    }

    /// The load base of the DLL whose image currently backs `va`.
    pub fn find_dll_base_by_func_va(&self, va: u64) -> Option<u64> {
        let (&base, info) = self.dlls.range(..= va).next_back()?;
        if va < base.saturating_add(info.size) {
            Some(base)
        }
        else {
            None
        }
    }

    /// Full path of the DLL loaded at `base`; empty when unknown.
    pub fn get_dll_path(&self, base: u64) -> &str {
        self.dlls.get(&base).map(|info| info.path.as_str()).unwrap_or("")
    }

    pub fn dll_count(&self) -> usize { self.dlls.len() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: Option<&str>, ordinal: u32, rva: u32, forwarder: Option<&str>) -> ExportEntry {
        ExportEntry {
            ordinal,
            rva,
            name: name.map(String::from),
            forwarder: forwarder.map(String::from),
        }
    }

    fn sample_map() -> ExportsMap {
        let mut map = ExportsMap::new();
        map.add_dll(
            0x7ff0_0000_0000,
            "C:\\Windows\\System32\\ntdll.dll",
            0x20_0000,
            &[
                entry(Some("RtlAllocateHeap"), 12, 0x1000, None),
                entry(Some("NtClose"), 13, 0x2000, None),
                entry(None, 900, 0x3000, None),
            ],
        );
        map.add_dll(
            0x7ff1_0000_0000,
            "C:\\Windows\\System32\\kernel32.dll",
            0x10_0000,
            &[
                entry(Some("CloseHandle"), 1, 0x5000, None),
                // forwarded into ntdll
                entry(Some("HeapAlloc"), 2, 0x200, Some("NTDLL.RtlAllocateHeap")),
            ],
        );
        map.resolve_forwarders();
        map
    }

    #[test]
    fn short_name_variants() {
        assert_eq!(dll_short_name("C:\\Windows\\System32\\NTDLL.DLL"), "ntdll");
        assert_eq!(dll_short_name("kernel32.dll"), "kernel32");
        assert_eq!(dll_short_name("noext"), "noext");
    }

    #[test]
    fn forwarded_export_aliases_the_target_va() {
        let map = sample_map();
        let funcs = map.find_exports_by_va(0x7ff0_0000_1000).unwrap();
        let mut names: Vec<String> = funcs.iter().map(|f| f.to_string()).collect();
        names.sort();
        assert_eq!(names, ["kernel32.HeapAlloc", "ntdll.RtlAllocateHeap"]);
    }

    #[test]
    fn ordinal_only_exports_get_hash_names() {
        let map = sample_map();
        let funcs = map.find_exports_by_va(0x7ff0_0000_3000).unwrap();
        assert_eq!(funcs.iter().next().unwrap().name, "#900");
    }

    #[test]
    fn reverse_lookup_respects_image_span() {
        let map = sample_map();
        assert_eq!(
            map.find_dll_base_by_func_va(0x7ff0_0000_1234),
            Some(0x7ff0_0000_0000)
        );
        // past the end of ntdll but before kernel32
        assert_eq!(map.find_dll_base_by_func_va(0x7ff0_1000_0000), None);
        assert_eq!(map.find_dll_base_by_func_va(0x10), None);
    }

    #[test]
    fn unknown_base_yields_empty_path() {
        let map = sample_map();
        assert_eq!(map.get_dll_path(0xdead), "");
        assert_eq!(
            map.get_dll_path(0x7ff0_0000_0000),
            "C:\\Windows\\System32\\ntdll.dll"
        );
    }
}
