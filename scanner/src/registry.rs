use std::collections::BTreeMap;

/// One module of the target process, as seen by the OS loader.
#[derive(Clone, Debug)]
pub struct ModuleDesc {
    pub base: u64,
    pub size: u64,
    /// Full on-disk path of the backing image.
    pub path: String,
    /// Set by other scanners when the module itself looks tampered.
    pub is_suspicious: bool,
    pub is_64: bool,
}

impl ModuleDesc {
    /// Lowercase file name without extension, e.g. `kernel32`.
    pub fn short_name(&self) -> String { crate::exports_map::dll_short_name(&self.path) }
}

/// The loaded-modules view of the target process. Built once per scan
/// pass; read-only while scans run.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: BTreeMap<u64, ModuleDesc>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self {
            modules: BTreeMap::new(),
        }
    }

    /// Register a module. Descriptors with a zero base are rejected:
    /// nothing legitimate loads at address zero.
    pub fn insert(&mut self, desc: ModuleDesc) {
        if desc.base != 0 {
            self.modules.insert(desc.base, desc);
        }
    }

    /// The module covering `addr`, where a module covers
    /// `[base, base + size)`. Interval lookup over the sorted bases.
    pub fn find_module_containing(&self, addr: u64) -> Option<&ModuleDesc> {
        let (_, desc) = self.modules.range(..= addr).next_back()?;
        if addr < desc.base.saturating_add(desc.size) {
            Some(desc)
        }
        else {
            None
        }
    }

    pub fn get(&self, base: u64) -> Option<&ModuleDesc> { self.modules.get(&base) }

    pub fn mark_suspicious(&mut self, base: u64) {
        if let Some(desc) = self.modules.get_mut(&base) {
            desc.is_suspicious = true;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModuleDesc> { self.modules.values() }

    pub fn len(&self) -> usize { self.modules.len() }

    pub fn is_empty(&self) -> bool { self.modules.is_empty() }
}

#[cfg(windows)]
mod live {
    use kagami_win32::{kernel32::ModuleInfo, ntdef::HMODULE};
    use log::warn;
    use mod_pe::{Layout, PeImage};

    use super::{ModuleDesc, ModuleRegistry};
    use crate::{
        error::ScanError,
        process::{Process, ProcessMemory as _},
        sys::sys,
    };

    impl ModuleRegistry {
        /// Populate the registry from the OS loaded-modules view of the
        /// target process.
        pub fn from_process(process: &Process) -> Result<Self, ScanError> {
            let sys = sys()?;
            let mut handles: Vec<HMODULE> = vec![core::ptr::null_mut(); 256];
            let mut needed: u32 = 0;
            loop {
                let cb = (handles.len() * core::mem::size_of::<HMODULE>()) as u32;
                let ok = unsafe {
                    (sys.kernel32.enum_process_modules)(
                        process.handle(),
                        handles.as_mut_ptr(),
                        cb,
                        &mut needed,
                    )
                };
                if ok == 0 {
                    return Err(ScanError::ModuleEnumeration);
                }
                if needed <= cb {
                    handles.truncate(needed as usize / core::mem::size_of::<HMODULE>());
                    break;
                }
                handles.resize(needed as usize / core::mem::size_of::<HMODULE>(), core::ptr::null_mut());
            }

            let mut registry = Self::new();
            for &handle in &handles {
                let mut info = ModuleInfo {
                    lp_base_of_dll: core::ptr::null_mut(),
                    size_of_image:  0,
                    entry_point:    core::ptr::null_mut(),
                };
                let ok = unsafe {
                    (sys.kernel32.get_module_information)(
                        process.handle(),
                        handle,
                        &mut info,
                        core::mem::size_of::<ModuleInfo>() as u32,
                    )
                };
                if ok == 0 {
                    continue;
                }
                let base = info.lp_base_of_dll as u64;

                let mut name_buf = [0u16; 1024];
                let len = unsafe {
                    (sys.kernel32.get_module_file_name_ex_w)(
                        process.handle(),
                        handle,
                        name_buf.as_mut_ptr(),
                        name_buf.len() as u32,
                    )
                };
                if len == 0 {
                    warn!("no path for module at {:x}, skipping", base);
                    continue;
                }
                let path = String::from_utf16_lossy(&name_buf[.. len as usize]);

                // the remote header decides the module's bitness
                let mut header = vec![0u8; 0x1000];
                let is_64 = match process.read_memory(base, &mut header) {
                    Ok(read) if read > 0 => PeImage::parse(&header, Layout::Virtual)
                        .map(|image| image.headers.is_64)
                        .unwrap_or(true),
                    _ => true,
                };

                registry.insert(ModuleDesc {
                    base,
                    size: u64::from(info.size_of_image),
                    path,
                    is_suspicious: false,
                    is_64,
                });
            }
            Ok(registry)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(base: u64, size: u64, path: &str) -> ModuleDesc {
        ModuleDesc {
            base,
            size,
            path: path.into(),
            is_suspicious: false,
            is_64: true,
        }
    }

    #[test]
    fn zero_base_is_rejected() {
        let mut registry = ModuleRegistry::new();
        registry.insert(module(0, 0x1000, "c:\\bad.dll"));
        assert!(registry.is_empty());
    }

    #[test]
    fn interval_lookup_covers_base_to_end() {
        let mut registry = ModuleRegistry::new();
        registry.insert(module(0x1000_0000, 0x2000, "c:\\a.dll"));
        registry.insert(module(0x2000_0000, 0x1000, "c:\\b.dll"));

        assert!(registry.find_module_containing(0x1000_0000).is_some());
        assert_eq!(
            registry.find_module_containing(0x1000_1fff).map(|m| m.base),
            Some(0x1000_0000)
        );
        // one past the end
        assert!(registry.find_module_containing(0x1000_2000).is_none());
        // gap between the modules
        assert!(registry.find_module_containing(0x1800_0000).is_none());
        assert_eq!(
            registry.find_module_containing(0x2000_0fff).map(|m| m.base),
            Some(0x2000_0000)
        );
    }

    #[test]
    fn suspicious_flag_sticks() {
        let mut registry = ModuleRegistry::new();
        registry.insert(module(0x1000, 0x1000, "c:\\a.dll"));
        registry.mark_suspicious(0x1000);
        assert!(registry.get(0x1000).unwrap().is_suspicious);
    }

    #[test]
    fn short_name_strips_path_and_extension() {
        let desc = module(0x1000, 0x1000, "C:\\Windows\\System32\\KERNEL32.DLL");
        assert_eq!(desc.short_name(), "kernel32");
    }
}
