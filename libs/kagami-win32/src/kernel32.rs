use core::{ffi::c_void, ptr::null_mut};

use crate::ntdef::{HANDLE, HMODULE, PCSTR, PVOID, PWSTR};

pub type LoadLibraryA = unsafe extern "system" fn(lp_lib_file_name: PCSTR) -> HMODULE;

pub type K32EnumProcessModules = unsafe extern "system" fn(
    h_process: HANDLE,
    lph_module: *mut HMODULE,
    cb: u32,
    lpcb_needed: *mut u32,
) -> i32;

pub type K32GetModuleFileNameExW = unsafe extern "system" fn(
    h_process: HANDLE,
    h_module: HMODULE,
    lp_filename: PWSTR,
    n_size: u32,
) -> u32;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ModuleInfo {
    pub lp_base_of_dll: PVOID,
    pub size_of_image:  u32,
    pub entry_point:    PVOID,
}

pub type K32GetModuleInformation = unsafe extern "system" fn(
    h_process: HANDLE,
    h_module: HMODULE,
    lp_modinfo: *mut ModuleInfo,
    cb: u32,
) -> i32;

pub type IsWow64Process =
    unsafe extern "system" fn(h_process: HANDLE, wow64_process: *mut i32) -> i32;

/// The context record is typed loosely so the table stays independent of
/// the Wow64Context definition; callers pass `&mut Wow64Context` cast.
pub type Wow64GetThreadContext =
    unsafe extern "system" fn(h_thread: HANDLE, lp_context: PVOID) -> i32;

pub struct Kernel32 {
    pub module_base: *mut u8,
    pub load_library_a: LoadLibraryA,
    pub enum_process_modules: K32EnumProcessModules,
    pub get_module_file_name_ex_w: K32GetModuleFileNameExW,
    pub get_module_information: K32GetModuleInformation,
    pub is_wow64_process: IsWow64Process,
    pub wow64_get_thread_context: Wow64GetThreadContext,
}

impl Default for Kernel32 {
    fn default() -> Self { Self::new() }
}

impl Kernel32 {
    pub fn new() -> Self {
        Self {
            module_base: null_mut(),
            load_library_a: unsafe { core::mem::transmute(null_mut::<c_void>()) },
            enum_process_modules: unsafe { core::mem::transmute(null_mut::<c_void>()) },
            get_module_file_name_ex_w: unsafe { core::mem::transmute(null_mut::<c_void>()) },
            get_module_information: unsafe { core::mem::transmute(null_mut::<c_void>()) },
            is_wow64_process: unsafe { core::mem::transmute(null_mut::<c_void>()) },
            wow64_get_thread_context: unsafe { core::mem::transmute(null_mut::<c_void>()) },
        }
    }
}

// Safety: the table holds plain function pointers, written once at startup
unsafe impl Sync for Kernel32 {}
// Safety: the table holds plain function pointers, written once at startup
unsafe impl Send for Kernel32 {}
