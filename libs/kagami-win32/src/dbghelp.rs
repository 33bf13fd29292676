use core::{ffi::c_void, ptr::null_mut};

use crate::ntdef::{HANDLE, PCWSTR, PVOID};

pub const ADDR_MODE_FLAT: u32 = 3;

pub const SYMOPT_UNDNAME: u32 = 0x0000_0002;
pub const SYMOPT_DEFERRED_LOADS: u32 = 0x0000_0004;
pub const SYMOPT_FAIL_CRITICAL_ERRORS: u32 = 0x0000_0200;
pub const SYMOPT_NO_PROMPTS: u32 = 0x0008_0000;

/// Longest symbol name requested from SymFromAddrW, in characters.
pub const MAX_SYM_NAME: usize = 2000;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct Address64 {
    pub offset:  u64,
    pub segment: u16,
    pub mode:    u32,
}

impl Default for Address64 {
    fn default() -> Self {
        Self {
            offset:  0,
            segment: 0,
            mode:    ADDR_MODE_FLAT,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct KdHelp64 {
    pub thread: u64,
    pub th_callback_stack: u32,
    pub th_callback_b_store: u32,
    pub next_callback: u32,
    pub frame_pointer: u32,
    pub ki_call_user_mode: u64,
    pub ke_user_callback_dispatcher: u64,
    pub system_range_start: u64,
    pub ki_user_exception_dispatcher: u64,
    pub stack_base: u64,
    pub stack_limit: u64,
    pub build_version: u32,
    pub retpoline_stub_function_table_size: u32,
    pub retpoline_stub_function_table: u64,
    pub retpoline_stub_offset: u32,
    pub retpoline_stub_size: u32,
    pub reserved0: [u64; 2],
}

#[repr(C)]
pub struct StackFrame64 {
    pub addr_pc:          Address64,
    pub addr_return:      Address64,
    pub addr_frame:       Address64,
    pub addr_stack:       Address64,
    pub addr_b_store:     Address64,
    pub func_table_entry: PVOID,
    pub params:           [u64; 4],
    pub far:              i32,
    pub is_virtual:       i32,
    pub reserved:         [u64; 3],
    pub kd_help:          KdHelp64,
}

impl Default for StackFrame64 {
    fn default() -> Self {
        // Safety: all-zero is a valid initial frame; address modes are set
        // by the caller before the first StackWalk64 call
        unsafe { core::mem::zeroed() }
    }
}

/// SYMBOL_INFOW header. Callers allocate `size_of::<SymbolInfoW>() +
/// MAX_SYM_NAME * 2` bytes and let the name run past the one-element array.
#[repr(C)]
pub struct SymbolInfoW {
    pub size_of_struct: u32,
    pub type_index:     u32,
    pub reserved:       [u64; 2],
    pub index:          u32,
    pub size:           u32,
    pub mod_base:       u64,
    pub flags:          u32,
    pub value:          u64,
    pub address:        u64,
    pub register:       u32,
    pub scope:          u32,
    pub tag:            u32,
    pub name_len:       u32,
    pub max_name_len:   u32,
    pub name:           [u16; 1],
}

pub type ReadProcessMemoryRoutine64 = unsafe extern "system" fn(
    h_process: HANDLE,
    base_address: u64,
    buffer: PVOID,
    size: u32,
    number_of_bytes_read: *mut u32,
) -> i32;

pub type FunctionTableAccessRoutine64 =
    unsafe extern "system" fn(h_process: HANDLE, addr_base: u64) -> PVOID;

pub type GetModuleBaseRoutine64 =
    unsafe extern "system" fn(h_process: HANDLE, address: u64) -> u64;

pub type TranslateAddressRoutine64 =
    unsafe extern "system" fn(h_process: HANDLE, h_thread: HANDLE, lpaddr: *mut Address64) -> u64;

pub type SymInitializeW = unsafe extern "system" fn(
    h_process: HANDLE,
    user_search_path: PCWSTR,
    invade_process: i32,
) -> i32;

pub type SymCleanup = unsafe extern "system" fn(h_process: HANDLE) -> i32;

pub type SymSetOptions = unsafe extern "system" fn(sym_options: u32) -> u32;

pub type SymFromAddrW = unsafe extern "system" fn(
    h_process: HANDLE,
    address: u64,
    displacement: *mut u64,
    symbol: *mut SymbolInfoW,
) -> i32;

pub type SymFunctionTableAccess64 =
    unsafe extern "system" fn(h_process: HANDLE, addr_base: u64) -> PVOID;

pub type SymGetModuleBase64 =
    unsafe extern "system" fn(h_process: HANDLE, address: u64) -> u64;

pub type StackWalk64 = unsafe extern "system" fn(
    machine_type: u32,
    h_process: HANDLE,
    h_thread: HANDLE,
    stack_frame: *mut StackFrame64,
    context_record: PVOID,
    read_memory_routine: Option<ReadProcessMemoryRoutine64>,
    function_table_access_routine: Option<FunctionTableAccessRoutine64>,
    get_module_base_routine: Option<GetModuleBaseRoutine64>,
    translate_address: Option<TranslateAddressRoutine64>,
) -> i32;

/// Table of the dbghelp entry points used for stack walking and symbol
/// resolution. dbghelp.dll is not a known DLL, so it is pulled in with
/// LoadLibraryA before its exports are resolved.
pub struct Dbghelp {
    pub module_base: *mut u8,
    pub sym_initialize_w: SymInitializeW,
    pub sym_cleanup: SymCleanup,
    pub sym_set_options: SymSetOptions,
    pub sym_from_addr_w: SymFromAddrW,
    pub sym_function_table_access_64: SymFunctionTableAccess64,
    pub sym_get_module_base_64: SymGetModuleBase64,
    pub stack_walk_64: StackWalk64,
}

impl Default for Dbghelp {
    fn default() -> Self { Self::new() }
}

impl Dbghelp {
    pub fn new() -> Self {
        Self {
            module_base: null_mut(),
            sym_initialize_w: unsafe { core::mem::transmute(null_mut::<c_void>()) },
            sym_cleanup: unsafe { core::mem::transmute(null_mut::<c_void>()) },
            sym_set_options: unsafe { core::mem::transmute(null_mut::<c_void>()) },
            sym_from_addr_w: unsafe { core::mem::transmute(null_mut::<c_void>()) },
            sym_function_table_access_64: unsafe { core::mem::transmute(null_mut::<c_void>()) },
            sym_get_module_base_64: unsafe { core::mem::transmute(null_mut::<c_void>()) },
            stack_walk_64: unsafe { core::mem::transmute(null_mut::<c_void>()) },
        }
    }
}

// Safety: the table holds plain function pointers, written once at startup
unsafe impl Sync for Dbghelp {}
// Safety: the table holds plain function pointers, written once at startup
unsafe impl Send for Dbghelp {}
