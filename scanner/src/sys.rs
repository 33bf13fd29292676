//! Runtime resolution of the OS entry points the scanners call.
//!
//! Nothing here is linked at build time: the loader data of the current
//! process yields the bases of `ntdll` and `kernel32`, their export
//! directories yield the function addresses, and `dbghelp.dll` is pulled
//! in through the resolved `LoadLibraryA`. The resolved tables live in a
//! process-wide cell, written once.

use core::arch::asm;

use kagami_win32::{
    dbghelp::Dbghelp,
    kernel32::Kernel32,
    ntapi::Ntdll,
    ntdef::{LoaderDataTableEntry, PebLoaderData, TEB},
    utils::utf16_eq_ignore_ascii_case,
};
use mod_pe::{enumerate_exports, Layout, PeHeaders, PeImage};
use once_cell::sync::OnceCell;

use crate::error::ScanError;

pub struct Sys {
    pub ntdll:    Ntdll,
    pub kernel32: Kernel32,
    pub dbghelp:  Dbghelp,
}

static SYS: OnceCell<Sys> = OnceCell::new();

/// The resolved API tables, initializing them on first use.
pub fn sys() -> Result<&'static Sys, ScanError> { SYS.get_or_try_init(Sys::resolve) }

#[cfg(target_arch = "x86_64")]
fn nt_current_teb() -> *mut TEB {
    let teb_ptr: *mut TEB;
    unsafe {
        asm!(
            "mov {}, gs:[0x30]",
            out(reg) teb_ptr
        );
    }
    teb_ptr
}

#[cfg(target_arch = "x86")]
fn nt_current_teb() -> *mut TEB {
    let teb_ptr: *mut TEB;
    unsafe {
        asm!(
            "mov {}, fs:[0x18]",
            out(reg) teb_ptr
        );
    }
    teb_ptr
}

/// Base address of a module in the current process, found by walking the
/// PEB loader list and comparing base names case-insensitively.
unsafe fn find_module_base(name: &str) -> Option<*mut u8> {
    let teb = nt_current_teb();
    let peb = teb.as_ref()?.process_environment_block;
    if peb.is_null() {
        return None;
    }
    let loader_data = (*peb).loader_data.cast::<PebLoaderData>();
    if loader_data.is_null() {
        return None;
    }
    let head = &(*loader_data).in_load_order_module_list as *const _ as *mut kagami_win32::ntdef::ListEntry;
    let mut link = (*head).flink;
    while !link.is_null() && link != head {
        let entry = link.cast::<LoaderDataTableEntry>();
        let dll_name = &(*entry).base_dll_name;
        if !dll_name.buffer.is_null() {
            let chars = core::slice::from_raw_parts(dll_name.buffer, usize::from(dll_name.length) / 2);
            if utf16_eq_ignore_ascii_case(chars, name) {
                return Some((*entry).dll_base.cast::<u8>());
            }
        }
        link = (*link).flink;
    }
    None
}

/// View a module mapped in the current process as a virtual-layout image.
unsafe fn image_of(base: *mut u8) -> Result<&'static [u8], ScanError> {
    let header = core::slice::from_raw_parts(base, 0x1000);
    let headers = PeHeaders::parse(header)?;
    Ok(core::slice::from_raw_parts(base, headers.image_size as usize))
}

/// Export addresses of one loaded module, by name.
unsafe fn export_table(base: *mut u8) -> Result<Vec<(String, *mut u8)>, ScanError> {
    let image = PeImage::parse(image_of(base)?, Layout::Virtual)?;
    let entries = enumerate_exports(&image)?;
    Ok(entries
        .into_iter()
        .filter(|entry| entry.forwarder.is_none())
        .filter_map(|entry| {
            entry
                .name
                .map(|name| (name, base.add(entry.rva as usize)))
        })
        .collect())
}

fn lookup(table: &[(String, *mut u8)], name: &'static str) -> Result<*mut u8, ScanError> {
    table
        .iter()
        .find(|(export, _)| export == name)
        .map(|(_, addr)| *addr)
        .ok_or(ScanError::ApiResolution(name))
}

macro_rules! resolve_fn {
    ($table:expr, $name:literal) => {
        unsafe { core::mem::transmute(lookup(&$table, $name)?) }
    };
}

impl Sys {
    fn resolve() -> Result<Self, ScanError> {
        let ntdll_base =
            unsafe { find_module_base("ntdll.dll") }.ok_or(ScanError::ApiResolution("ntdll.dll"))?;
        let kernel32_base = unsafe { find_module_base("kernel32.dll") }
            .ok_or(ScanError::ApiResolution("kernel32.dll"))?;

        let ntdll_exports = unsafe { export_table(ntdll_base)? };
        let kernel32_exports = unsafe { export_table(kernel32_base)? };

        let mut ntdll = Ntdll::new();
        ntdll.module_base = ntdll_base;
        ntdll.nt_close = resolve_fn!(ntdll_exports, "NtClose");
        ntdll.nt_open_thread = resolve_fn!(ntdll_exports, "NtOpenThread");
        ntdll.nt_suspend_thread = resolve_fn!(ntdll_exports, "NtSuspendThread");
        ntdll.nt_resume_thread = resolve_fn!(ntdll_exports, "NtResumeThread");
        ntdll.nt_get_context_thread = resolve_fn!(ntdll_exports, "NtGetContextThread");
        ntdll.nt_query_information_thread = resolve_fn!(ntdll_exports, "NtQueryInformationThread");
        ntdll.nt_query_information_process = resolve_fn!(ntdll_exports, "NtQueryInformationProcess");
        ntdll.nt_query_system_information = resolve_fn!(ntdll_exports, "NtQuerySystemInformation");
        ntdll.nt_read_virtual_memory = resolve_fn!(ntdll_exports, "NtReadVirtualMemory");
        ntdll.nt_query_virtual_memory = resolve_fn!(ntdll_exports, "NtQueryVirtualMemory");

        let mut kernel32 = Kernel32::new();
        kernel32.module_base = kernel32_base;
        kernel32.load_library_a = resolve_fn!(kernel32_exports, "LoadLibraryA");
        kernel32.enum_process_modules = resolve_fn!(kernel32_exports, "K32EnumProcessModules");
        kernel32.get_module_file_name_ex_w = resolve_fn!(kernel32_exports, "K32GetModuleFileNameExW");
        kernel32.get_module_information = resolve_fn!(kernel32_exports, "K32GetModuleInformation");
        kernel32.is_wow64_process = resolve_fn!(kernel32_exports, "IsWow64Process");
        kernel32.wow64_get_thread_context = resolve_fn!(kernel32_exports, "Wow64GetThreadContext");

        let dbghelp_base = unsafe { (kernel32.load_library_a)(c"dbghelp.dll".as_ptr().cast()) };
        if dbghelp_base.is_null() {
            return Err(ScanError::ApiResolution("dbghelp.dll"));
        }
        let dbghelp_exports = unsafe { export_table(dbghelp_base.cast::<u8>())? };

        let mut dbghelp = Dbghelp::new();
        dbghelp.module_base = dbghelp_base.cast::<u8>();
        dbghelp.sym_initialize_w = resolve_fn!(dbghelp_exports, "SymInitializeW");
        dbghelp.sym_cleanup = resolve_fn!(dbghelp_exports, "SymCleanup");
        dbghelp.sym_set_options = resolve_fn!(dbghelp_exports, "SymSetOptions");
        dbghelp.sym_from_addr_w = resolve_fn!(dbghelp_exports, "SymFromAddrW");
        dbghelp.sym_function_table_access_64 =
            resolve_fn!(dbghelp_exports, "SymFunctionTableAccess64");
        dbghelp.sym_get_module_base_64 = resolve_fn!(dbghelp_exports, "SymGetModuleBase64");
        dbghelp.stack_walk_64 = resolve_fn!(dbghelp_exports, "StackWalk64");

        Ok(Self {
            ntdll,
            kernel32,
            dbghelp,
        })
    }
}
