use std::collections::BTreeMap;
use std::io::Write;

use kagami_win32::ntdef::IMAGE_DIRECTORY_ENTRY_IMPORT;
use log::{debug, warn};
use mod_pe::{enumerate_imports, Layout, PeHeaders, PeImage};
use serde::Serialize;

use crate::{
    error::ScanError,
    exports_map::{dll_short_name, ExportedFunc, ExportsMap},
    params::{system_dirs, IatFilterMode, ScanParams},
    process::{fetch_alloc_base, read_remote_image, ProcessMemory},
    registry::{ModuleDesc, ModuleRegistry},
    report::{hex, ScanStatus},
};

/// Declared imports of one module: IAT slot RVA to the export that should
/// fill it. A None value marks a declared import that could not be
/// resolved; comparison skips those silently.
#[derive(Default)]
pub struct ImportsCollection {
    thunk_to_func: BTreeMap<u32, Option<ExportedFunc>>,
}

impl ImportsCollection {
    pub fn new() -> Self { Self::default() }

    pub fn insert(&mut self, thunk_rva: u32, func: Option<ExportedFunc>) {
        self.thunk_to_func.insert(thunk_rva, func);
    }

    pub fn get(&self, thunk_rva: u32) -> Option<&ExportedFunc> {
        self.thunk_to_func.get(&thunk_rva).and_then(Option::as_ref)
    }

    /// Ascending by thunk RVA.
    pub fn iter(&self) -> impl Iterator<Item = (u32, Option<&ExportedFunc>)> {
        self.thunk_to_func.iter().map(|(&rva, func)| (rva, func.as_ref()))
    }

    pub fn len(&self) -> usize { self.thunk_to_func.len() }

    pub fn is_empty(&self) -> bool { self.thunk_to_func.is_empty() }
}

/// IAT slots whose filled value was not covered by any declared export.
/// Iteration is ascending by thunk RVA, so serialized reports reproduce.
#[derive(Default, Clone)]
pub struct ImpsNotCovered {
    thunk_to_addr: BTreeMap<u32, u64>,
}

impl ImpsNotCovered {
    pub fn new() -> Self { Self::default() }

    pub fn insert(&mut self, thunk_rva: u32, filled_val: u64) {
        self.thunk_to_addr.insert(thunk_rva, filled_val);
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, u64)> + '_ {
        self.thunk_to_addr.iter().map(|(&rva, &addr)| (rva, addr))
    }

    pub fn count(&self) -> usize { self.thunk_to_addr.len() }
}

/// The on-disk image of a module, loaded for its declared import table.
pub struct ModuleData {
    pub path: String,
    buf: Vec<u8>,
    is_64: bool,
}

impl ModuleData {
    pub fn load(path: &str) -> Result<Self, ScanError> {
        let buf = std::fs::read(path).map_err(|_| ScanError::ModuleFile(String::from(path)))?;
        Self::from_buf(path, buf)
    }

    pub fn from_buf(path: &str, buf: Vec<u8>) -> Result<Self, ScanError> {
        let headers = PeHeaders::parse(&buf)?;
        Ok(Self {
            path: String::from(path),
            is_64: headers.is_64,
            buf,
        })
    }

    pub fn is_64(&self) -> bool { self.is_64 }

    /// The declared thunk table, keyed by IAT slot RVA. Ordinal imports
    /// without a name come out as `#<ordinal>`.
    pub fn imports_collection(&self) -> Result<ImportsCollection, ScanError> {
        let image = PeImage::parse(&self.buf, Layout::Raw)?;
        let mut collection = ImportsCollection::new();
        for entry in enumerate_imports(&image)? {
            let lib = dll_short_name(&entry.dll);
            let declared = if lib.is_empty() {
                None
            }
            else {
                let name = match (&entry.name, entry.ordinal) {
                    (Some(name), _) => name.clone(),
                    (None, Some(ordinal)) => format!("#{}", ordinal),
                    (None, None) => String::new(),
                };
                Some(ExportedFunc::new(&lib, &name, 0))
            };
            collection.insert(entry.thunk_rva, declared);
        }
        Ok(collection)
    }
}

/// The module as mapped in the target process: header page first, full
/// image only when a scan actually needs it. The buffer belongs to one
/// scan and dies with it.
pub struct RemoteModuleData {
    pub base: u64,
    headers: Option<PeHeaders>,
    image: Option<Vec<u8>>,
}

const HEADER_SIZE: usize = 0x1000;

impl RemoteModuleData {
    pub fn load<M: ProcessMemory + ?Sized>(mem: &M, base: u64) -> Self {
        let mut header = vec![0u8; HEADER_SIZE];
        let headers = match mem.read_memory(base, &mut header) {
            Ok(read) if read > 0 => PeHeaders::parse(&header).ok(),
            _ => None,
        };
        Self {
            base,
            headers,
            image: None,
        }
    }

    pub fn is_initialized(&self) -> bool { self.headers.is_some() }

    pub fn is_64(&self) -> Option<bool> { self.headers.as_ref().map(|h| h.is_64) }

    pub fn hdr_image_size(&self) -> u32 {
        self.headers.as_ref().map(|h| h.image_size).unwrap_or(0)
    }

    /// Step 2 of the precondition sequence: a module may legitimately
    /// have no import directory, and a directory beyond the declared
    /// image size is nothing the scan can walk.
    pub fn has_import_table(&self) -> bool {
        let Some(headers) = &self.headers else {
            return false;
        };
        let Some(dir) = headers.data_directory(IMAGE_DIRECTORY_ENTRY_IMPORT) else {
            return false;
        };
        if dir.virtual_address > headers.image_size {
            warn!("import table out of scope at {:x}", self.base);
            return false;
        }
        true
    }

    pub fn load_full_image<M: ProcessMemory + ?Sized>(&mut self, mem: &M) -> Result<(), ScanError> {
        let size = self.hdr_image_size() as usize;
        if size == 0 {
            return Err(ScanError::RemoteHeaderUnavailable);
        }
        self.image = Some(read_remote_image(mem, self.base, size)?);
        Ok(())
    }

    pub fn image(&self) -> Option<&[u8]> { self.image.as_deref() }
}

/// The filled value of one IAT slot in the local copy of the remote
/// image; zero when the slot lies outside the buffer.
fn get_thunk_at(image: &[u8], rva: u32, is_64: bool) -> u64 {
    let offset = rva as usize;
    if is_64 {
        image
            .get(offset .. offset + 8)
            .map(|b| u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
            .unwrap_or(0)
    }
    else {
        image
            .get(offset .. offset + 4)
            .map(|b| u64::from(u32::from_le_bytes([b[0], b[1], b[2], b[3]])))
            .unwrap_or(0)
    }
}

/// Compares a remote module's IAT against the imports its on-disk image
/// declares, and classifies every discrepancy.
pub struct IatScanner<'a, M: ProcessMemory + ?Sized> {
    mem: &'a M,
    module: &'a ModuleDesc,
    registry: &'a ModuleRegistry,
    exports_map: &'a ExportsMap,
    filter: IatFilterMode,
    listed_imports: &'a [String],
    system32_path: String,
    syswow64_path: String,
}

impl<'a, M: ProcessMemory + ?Sized> IatScanner<'a, M> {
    pub fn new(
        mem: &'a M,
        module: &'a ModuleDesc,
        registry: &'a ModuleRegistry,
        exports_map: &'a ExportsMap,
        params: &'a ScanParams,
    ) -> Self {
        let (system32_path, syswow64_path) = system_dirs();
        Self {
            mem,
            module,
            registry,
            exports_map,
            filter: params.iat_filter,
            listed_imports: &params.listed_imports,
            system32_path,
            syswow64_path,
        }
    }

    /// Scan the module and return the findings as a report. Failures are
    /// a status on the report, never an unwind; an errored scan carries
    /// no partial findings.
    pub fn scan_remote(&self) -> IatScanReport {
        let mut remote = RemoteModuleData::load(self.mem, self.module.base);
        let mut report = IatScanReport::new(
            self.module.base,
            u64::from(remote.hdr_image_size()).max(self.module.size),
            self.module.short_name(),
        );
        if !remote.is_initialized() {
            warn!("failed to initialize remote module header at {:x}", self.module.base);
            report.status = ScanStatus::Error;
            return report;
        }
        if !remote.has_import_table() {
            // a legitimate image shape; nothing to scan
            report.status = ScanStatus::NotSuspicious;
            return report;
        }
        if remote.load_full_image(self.mem).is_err() {
            warn!("failed to read remote module image at {:x}", self.module.base);
            report.status = ScanStatus::Error;
            return report;
        }

        let mut not_covered = ImpsNotCovered::new();
        let collection = match self.scan_by_original_table(&remote, &mut not_covered) {
            Ok(collection) => collection,
            Err(err) => {
                warn!("IAT scan of {} failed: {}", self.module.path, err);
                report.status = ScanStatus::Error;
                return report;
            },
        };

        if not_covered.count() > 0 {
            debug!("IAT of {} has {} uncovered thunks", self.module.path, not_covered.count());
            report.stored_func = self.list_all_imports(&remote);
        }
        report.not_covered = match self.filter {
            IatFilterMode::Unfiltered | IatFilterMode::UnfilteredSysAll => not_covered,
            IatFilterMode::Listed => Self::filter_listed(&collection, &not_covered, self.listed_imports),
            IatFilterMode::CleanSysFiltered => self.filter_results(&not_covered),
        };
        report.status = if report.not_covered.count() > 0 {
            ScanStatus::Suspicious
        }
        else {
            ScanStatus::NotSuspicious
        };
        report
    }

    /// Walk the declared thunk table and compare each slot against the
    /// filled value observed in the remote image.
    fn scan_by_original_table(
        &self,
        remote: &RemoteModuleData,
        not_covered: &mut ImpsNotCovered,
    ) -> Result<ImportsCollection, ScanError> {
        let module_data = ModuleData::load(&self.module.path)?;
        let remote_is_64 = remote.is_64().ok_or(ScanError::RemoteHeaderUnavailable)?;
        if module_data.is_64() != remote_is_64 {
            return Err(ScanError::BitnessMismatch);
        }
        let image = remote.image().ok_or(ScanError::RemoteHeaderUnavailable)?;
        let collection = module_data.imports_collection()?;

        for (thunk_rva, declared) in collection.iter() {
            let Some(declared) = declared else {
                // the original import cannot be retrieved
                continue;
            };
            let filled_val = get_thunk_at(image, thunk_rva, remote_is_64);

            let possible = self.exports_map.find_exports_by_va(filled_val);
            let Some(possible) = possible else {
                // the .NET runtime rebinds these at startup to a CLR stub
                // that is not an export of anything
                if declared.lib == "mscoree"
                    && (declared.name == "_CorExeMain" || declared.name == "_CorDllMain")
                {
                    continue;
                }
                not_covered.insert(thunk_rva, filled_val);
                continue;
            };

            let covered = possible
                .iter()
                .any(|candidate| self.is_valid_fill(filled_val, declared, candidate));
            if !covered {
                not_covered.insert(thunk_rva, filled_val);
            }
        }
        Ok(collection)
    }

    /// Whether `candidate` legitimizes the observed fill for `declared`.
    ///
    /// A matching name in the declared DLL is the normal case; a matching
    /// name served out of another DLL is accepted only when that DLL
    /// resides in a system directory, which is how API-set and known-DLL
    /// forwarding looks from the outside. Hooks redirect elsewhere.
    fn is_valid_fill(&self, filled_val: u64, declared: &ExportedFunc, candidate: &ExportedFunc) -> bool {
        if !candidate.is_same_name(declared) {
            return false;
        }
        if candidate.is_same_lib(declared) {
            return true;
        }
        let Some(dll_base) = self.exports_map.find_dll_base_by_func_va(filled_val) else {
            return false;
        };
        self.is_in_system_dir(self.exports_map.get_dll_path(dll_base))
    }

    fn is_in_system_dir(&self, module_path: &str) -> bool {
        let dir = match module_path.rsplit_once('\\') {
            Some((dir, _file)) => dir,
            None => return false,
        };
        let dir = dir.to_ascii_lowercase();
        dir == self.system32_path || dir == self.syswow64_path
    }

    /// `Listed` mode: keep slots whose declared import the caller named;
    /// an empty list passes everything through.
    fn filter_listed(
        collection: &ImportsCollection,
        not_covered: &ImpsNotCovered,
        listed: &[String],
    ) -> ImpsNotCovered {
        if listed.is_empty() {
            return not_covered.clone();
        }
        let mut kept = ImpsNotCovered::new();
        for (thunk, addr) in not_covered.iter() {
            if let Some(declared) = collection.get(thunk) {
                if listed.iter().any(|name| *name == declared.name) {
                    kept.insert(thunk, addr);
                }
            }
        }
        kept
    }

    /// `CleanSysFiltered` mode: drop hooks that lead into system-directory
    /// DLLs, unless the scanned module itself is flagged suspicious.
    /// Addresses outside any known module or allocation are always kept.
    fn filter_results(&self, not_covered: &ImpsNotCovered) -> ImpsNotCovered {
        let mut kept = ImpsNotCovered::new();
        for (thunk, addr) in not_covered.iter() {
            let module = self.registry.find_module_containing(addr);
            let module_start = module
                .map(|m| m.base)
                .unwrap_or_else(|| fetch_alloc_base(self.mem, addr));
            if module_start == 0 {
                // invalid address of the hook
                kept.insert(thunk, addr);
                continue;
            }
            // hooks leading into an already-flagged module stay visible
            if module.is_some_and(|m| m.is_suspicious) {
                kept.insert(thunk, addr);
                continue;
            }
            let module_path = self.exports_map.get_dll_path(module_start);
            if self.is_in_system_dir(module_path) {
                debug!("skipped hook into {}", module_path);
                continue;
            }
            kept.insert(thunk, addr);
        }
        kept
    }

    /// Collect the full imports view of the remote image, used to label
    /// hooked slots in reports.
    fn list_all_imports(&self, remote: &RemoteModuleData) -> ImportsCollection {
        let Some(image) = remote.image() else {
            return ImportsCollection::new();
        };
        let Ok(parsed) = PeImage::parse(image, Layout::Virtual) else {
            return ImportsCollection::new();
        };
        let Ok(entries) = enumerate_imports(&parsed) else {
            return ImportsCollection::new();
        };
        let mut collection = ImportsCollection::new();
        for entry in entries {
            let lib = dll_short_name(&entry.dll);
            let name = match (&entry.name, entry.ordinal) {
                (Some(name), _) => name.clone(),
                (None, Some(ordinal)) => format!("#{}", ordinal),
                (None, None) => String::new(),
            };
            collection.insert(entry.thunk_rva, Some(ExportedFunc::new(&lib, &name, 0)));
        }
        collection
    }
}

#[derive(Serialize)]
struct HookJson {
    thunk_rva: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    func_name: Option<String>,
    target: String,
}

#[derive(Serialize)]
struct IatScanBody {
    module: String,
    module_size: String,
    module_file: String,
    status: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    hooks_list: Option<Vec<HookJson>>,
}

#[derive(Serialize)]
struct IatScanJson {
    iat_scan: IatScanBody,
}

/// Findings of one IAT scan. Owned by the caller, freed after
/// serialization; safe to emit from any thread.
pub struct IatScanReport {
    pub module_base: u64,
    pub module_size: u64,
    pub module_file: String,
    pub status: ScanStatus,
    /// Full imports collection, for symbolic enrichment of the findings.
    pub stored_func: ImportsCollection,
    /// Filtered uncovered slots, ascending by thunk RVA.
    pub not_covered: ImpsNotCovered,
}

impl IatScanReport {
    pub fn new(module_base: u64, module_size: u64, module_file: String) -> Self {
        Self {
            module_base,
            module_size,
            module_file,
            status: ScanStatus::NotSuspicious,
            stored_func: ImportsCollection::new(),
            not_covered: ImpsNotCovered::new(),
        }
    }

    pub fn count_hooked(&self) -> usize { self.not_covered.count() }

    /// The nested JSON view. `hooks_list` is present only when there is
    /// at least one uncovered slot.
    pub fn to_json(&self) -> serde_json::Value {
        let hooks_list = if self.not_covered.count() == 0 {
            None
        }
        else {
            Some(
                self.not_covered
                    .iter()
                    .map(|(thunk, addr)| HookJson {
                        thunk_rva: hex(u64::from(thunk)),
                        func_name: self.stored_func.get(thunk).map(|f| f.to_string()),
                        target: hex(addr),
                    })
                    .collect(),
            )
        };
        let view = IatScanJson {
            iat_scan: IatScanBody {
                module: hex(self.module_base),
                module_size: hex(self.module_size),
                module_file: self.module_file.clone(),
                status: self.status.as_i32(),
                hooks_list,
            },
        };
        serde_json::to_value(view).unwrap_or(serde_json::Value::Null)
    }

    /// One `;`-separated row per uncovered slot:
    /// `thunk;declared->resolved;module_base+offset;is_suspicious`.
    /// Returns false without touching the writer when there is nothing to
    /// save.
    pub fn save_not_recovered<W: Write, M: ProcessMemory + ?Sized>(
        &self,
        out: &mut W,
        mem: &M,
        registry: &ModuleRegistry,
        exports_map: &ExportsMap,
    ) -> Result<bool, ScanError> {
        const DELIM: char = ';';
        if self.not_covered.count() == 0 {
            return Ok(false);
        }
        for (thunk, addr) in self.not_covered.iter() {
            write!(out, "{:x}{}", thunk, DELIM)?;
            match self.stored_func.get(thunk) {
                Some(declared) => write!(out, "{}", declared)?,
                None => write!(out, "(unknown)")?,
            }
            write!(out, "->")?;

            let module = registry.find_module_containing(addr);
            let module_start = module
                .map(|m| m.base)
                .unwrap_or_else(|| fetch_alloc_base(mem, addr));

            match exports_map
                .find_exports_by_va(addr)
                .and_then(|funcs| funcs.iter().next())
            {
                Some(func) => write!(out, "{}", func)?,
                None if module_start == 0 => write!(out, "(invalid)")?,
                None => {
                    match module {
                        Some(m) => write!(out, "{}.(unknown_func)", m.short_name())?,
                        None => write!(out, "(unknown)")?,
                    }
                },
            }

            let offset = addr.wrapping_sub(module_start);
            write!(out, "{}{:x}+{:x}", DELIM, module_start, offset)?;
            if let Some(m) = module {
                write!(out, "{}{}", DELIM, u32::from(m.is_suspicious))?;
            }
            writeln!(out)?;
        }
        Ok(true)
    }

    /// Write the not-recovered list to a file, original-table style.
    pub fn generate_list<M: ProcessMemory + ?Sized>(
        &self,
        file_name: &str,
        mem: &M,
        registry: &ModuleRegistry,
        exports_map: &ExportsMap,
    ) -> Result<bool, ScanError> {
        let mut file = std::fs::File::create(file_name)?;
        self.save_not_recovered(&mut file, mem, registry, exports_map)
    }
}
