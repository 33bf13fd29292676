use core::{
    ffi::{c_long, c_ushort, c_void},
    ptr::null_mut,
};

pub type NTSTATUS = i32;

// Definition of Windows types
pub type HANDLE = *mut c_void;
pub type PHANDLE = *mut HANDLE;
pub type HMODULE = *mut c_void;
pub type LONG = c_long;
pub type ULONG = u32;
pub type PVOID = *mut c_void;
pub type AccessMask = u32;
pub type USHORT = c_ushort;
#[expect(
    non_camel_case_types,
    reason = "Windows API types use screaming snake case for types, this aliases it"
)]
pub type SIZE_T = usize;
pub type ULONGLONG = u64;
pub type LONGLONG = i64;
pub type DWORD = u32;
pub type DWORD64 = u64;
pub type WORD = c_ushort;
pub type PWSTR = *mut u16;
pub type PCSTR = *const u8;
pub type PCWSTR = *const u16;
#[expect(
    non_camel_case_types,
    reason = "Windows API types use screaming snake case for types, this aliases it"
)]
pub type ULONG_PTR = usize;

// Windows NT Headers
pub const IMAGE_DOS_SIGNATURE: u16 = 0x5a4d; // "MZ"
pub const IMAGE_NT_SIGNATURE: u32 = 0x00004550; // "PE\0\0"

pub const IMAGE_FILE_MACHINE_I386: u16 = 0x014c;
pub const IMAGE_FILE_MACHINE_AMD64: u16 = 0x8664;

pub const IMAGE_NT_OPTIONAL_HDR32_MAGIC: u16 = 0x10b;
pub const IMAGE_NT_OPTIONAL_HDR64_MAGIC: u16 = 0x20b;

pub const IMAGE_DIRECTORY_ENTRY_EXPORT: usize = 0;
pub const IMAGE_DIRECTORY_ENTRY_IMPORT: usize = 1;
pub const IMAGE_NUMBEROF_DIRECTORY_ENTRIES: usize = 16;

pub const IMAGE_ORDINAL_FLAG32: u32 = 0x8000_0000;
pub const IMAGE_ORDINAL_FLAG64: u64 = 0x8000_0000_0000_0000;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ImageDosHeader {
    pub e_magic:    u16,
    pub e_cblp:     u16,
    pub e_cp:       u16,
    pub e_crlc:     u16,
    pub e_cparhdr:  u16,
    pub e_minalloc: u16,
    pub e_maxalloc: u16,
    pub e_ss:       u16,
    pub e_sp:       u16,
    pub e_csum:     u16,
    pub e_ip:       u16,
    pub e_cs:       u16,
    pub e_lfarlc:   u16,
    pub e_ovno:     u16,
    pub e_res:      [u16; 4],
    pub e_oemid:    u16,
    pub e_oeminfo:  u16,
    pub e_res2:     [u16; 10],
    pub e_lfanew:   i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ImageFileHeader {
    pub machine:                 u16,
    pub number_of_sections:      u16,
    pub time_date_stamp:         u32,
    pub pointer_to_symbol_table: u32,
    pub number_of_symbols:       u32,
    pub size_of_optional_header: u16,
    pub characteristics:         u16,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct ImageDataDirectory {
    pub virtual_address: u32,
    pub size:            u32,
}

/// Both optional-header layouts are declared unconditionally: the scanner
/// inspects 32-bit images from a 64-bit process and vice versa, so the
/// host architecture must not decide which one exists.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ImageOptionalHeader32 {
    pub magic: u16,
    pub major_linker_version: u8,
    pub minor_linker_version: u8,
    pub size_of_code: u32,
    pub size_of_initialized_data: u32,
    pub size_of_uninitialized_data: u32,
    pub address_of_entry_point: u32,
    pub base_of_code: u32,
    pub base_of_data: u32,
    pub image_base: u32,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub major_operating_system_version: u16,
    pub minor_operating_system_version: u16,
    pub major_image_version: u16,
    pub minor_image_version: u16,
    pub major_subsystem_version: u16,
    pub minor_subsystem_version: u16,
    pub win32_version_value: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub check_sum: u32,
    pub subsystem: u16,
    pub dll_characteristics: u16,
    pub size_of_stack_reserve: u32,
    pub size_of_stack_commit: u32,
    pub size_of_heap_reserve: u32,
    pub size_of_heap_commit: u32,
    pub loader_flags: u32,
    pub number_of_rva_and_sizes: u32,
    pub data_directory: [ImageDataDirectory; IMAGE_NUMBEROF_DIRECTORY_ENTRIES],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ImageOptionalHeader64 {
    pub magic: u16,
    pub major_linker_version: u8,
    pub minor_linker_version: u8,
    pub size_of_code: u32,
    pub size_of_initialized_data: u32,
    pub size_of_uninitialized_data: u32,
    pub address_of_entry_point: u32,
    pub base_of_code: u32,
    pub image_base: u64,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub major_operating_system_version: u16,
    pub minor_operating_system_version: u16,
    pub major_image_version: u16,
    pub minor_image_version: u16,
    pub major_subsystem_version: u16,
    pub minor_subsystem_version: u16,
    pub win32_version_value: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub check_sum: u32,
    pub subsystem: u16,
    pub dll_characteristics: u16,
    pub size_of_stack_reserve: u64,
    pub size_of_stack_commit: u64,
    pub size_of_heap_reserve: u64,
    pub size_of_heap_commit: u64,
    pub loader_flags: u32,
    pub number_of_rva_and_sizes: u32,
    pub data_directory: [ImageDataDirectory; IMAGE_NUMBEROF_DIRECTORY_ENTRIES],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ImageNtHeaders32 {
    pub signature:       u32,
    pub file_header:     ImageFileHeader,
    pub optional_header: ImageOptionalHeader32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ImageNtHeaders64 {
    pub signature:       u32,
    pub file_header:     ImageFileHeader,
    pub optional_header: ImageOptionalHeader64,
}

pub const IMAGE_SIZEOF_SHORT_NAME: usize = 8;

pub const IMAGE_SCN_MEM_EXECUTE: u32 = 0x2000_0000;
pub const IMAGE_SCN_MEM_READ: u32 = 0x4000_0000;
pub const IMAGE_SCN_MEM_WRITE: u32 = 0x8000_0000;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ImageSectionHeader {
    pub name: [u8; IMAGE_SIZEOF_SHORT_NAME],
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
    pub pointer_to_relocations: u32,
    pub pointer_to_linenumbers: u32,
    pub number_of_relocations: u16,
    pub number_of_linenumbers: u16,
    pub characteristics: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ImageExportDirectory {
    pub characteristics:          u32,
    pub time_date_stamp:          u32,
    pub major_version:            u16,
    pub minor_version:            u16,
    pub name:                     u32,
    pub base:                     u32,
    pub number_of_functions:      u32,
    pub number_of_names:          u32,
    pub address_of_functions:     u32,
    pub address_of_names:         u32,
    pub address_of_name_ordinals: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ImageImportDescriptor {
    /// 0 terminates the descriptor array; otherwise the RVA of the
    /// original first thunk (the hint/name table).
    pub original_first_thunk: u32,
    pub time_date_stamp:      u32,
    pub forwarder_chain:      u32,
    pub name:                 u32,
    pub first_thunk:          u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ListEntry {
    pub flink: *mut ListEntry,
    pub blink: *mut ListEntry,
}

// Definition of UNICODE_STRING
#[repr(C)]
#[derive(Clone, Copy)]
pub struct UnicodeString {
    pub length:         u16,
    pub maximum_length: u16,
    pub buffer:         *mut u16,
}

impl Default for UnicodeString {
    fn default() -> Self { Self::new() }
}

impl UnicodeString {
    pub const fn new() -> Self {
        Self {
            length:         0,
            maximum_length: 0,
            buffer:         null_mut(),
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ClientId {
    pub unique_process: HANDLE,
    pub unique_thread:  HANDLE,
}

// Safety: the handles are plain values here, never dereferenced by this type
unsafe impl Sync for ClientId {}
// Safety: the handles are plain values here, never dereferenced by this type
unsafe impl Send for ClientId {}

impl Default for ClientId {
    fn default() -> Self { Self::new() }
}

impl ClientId {
    pub const fn new() -> Self {
        Self {
            unique_process: null_mut(),
            unique_thread:  null_mut(),
        }
    }

    pub fn from_tid(tid: u32) -> Self {
        Self {
            unique_process: null_mut(),
            unique_thread:  tid as usize as HANDLE,
        }
    }
}

pub const OBJ_CASE_INSENSITIVE: ULONG = 0x40;

#[repr(C)]
pub struct ObjectAttributes {
    pub length:                   ULONG,
    pub root_directory:           HANDLE,
    pub object_name:              *mut UnicodeString,
    pub attributes:               ULONG,
    pub security_descriptor:      PVOID,
    pub security_quality_of_service: PVOID,
}

impl Default for ObjectAttributes {
    fn default() -> Self { Self::new() }
}

impl ObjectAttributes {
    pub const fn new() -> Self {
        Self {
            length:                   core::mem::size_of::<Self>() as ULONG,
            root_directory:           null_mut(),
            object_name:              null_mut(),
            attributes:               0,
            security_descriptor:      null_mut(),
            security_quality_of_service: null_mut(),
        }
    }
}

// PEB loader data, trimmed to the fields walked during bootstrap
#[repr(C)]
pub struct PebLoaderData {
    pub length: u32,
    pub initialized: u32,
    pub ss_handle: PVOID,
    pub in_load_order_module_list: ListEntry,
    pub in_memory_order_module_list: ListEntry,
    pub in_initialization_order_module_list: ListEntry,
}

#[repr(C)]
pub struct LoaderDataTableEntry {
    pub in_load_order_links: ListEntry,
    pub in_memory_order_links: ListEntry,
    pub in_initialization_order_links: ListEntry,
    pub dll_base: PVOID,
    pub entry_point: PVOID,
    pub size_of_image: u32,
    pub full_dll_name: UnicodeString,
    pub base_dll_name: UnicodeString,
    pub flags: u32,
    pub load_count: i16,
    pub tls_index: i16,
}

#[repr(C)]
pub struct PEB {
    pub inherited_address_space: bool,
    pub read_image_file_exec_options: bool,
    pub being_debugged: bool,
    pub spare: bool,
    pub mutant: HANDLE,
    pub image_base: PVOID,
    pub loader_data: *const PebLoaderData,
    pub process_parameters: PVOID,
}

#[repr(C)]
pub struct NtTib {
    pub exception_list: PVOID,
    pub stack_base: PVOID,
    pub stack_limit: PVOID,
    pub sub_system_tib: PVOID,
    pub fiber_data: PVOID,
    pub arbitrary_user_pointer: PVOID,
    pub self_: PVOID,
}

/// Prefix of the TEB, declared only as far as the fields the scanner reads.
#[repr(C)]
pub struct TEB {
    pub nt_tib: NtTib,
    pub environment_pointer: PVOID,
    pub client_id: ClientId,
    pub active_rpc_handle: PVOID,
    pub thread_local_storage_pointer: PVOID,
    pub process_environment_block: *mut PEB,
}

// Memory protection and state
pub const PAGE_NOACCESS: u32 = 0x01;
pub const PAGE_READONLY: u32 = 0x02;
pub const PAGE_READWRITE: u32 = 0x04;
pub const PAGE_WRITECOPY: u32 = 0x08;
pub const PAGE_EXECUTE: u32 = 0x10;
pub const PAGE_EXECUTE_READ: u32 = 0x20;
pub const PAGE_EXECUTE_READWRITE: u32 = 0x40;
pub const PAGE_EXECUTE_WRITECOPY: u32 = 0x80;
pub const PAGE_GUARD: u32 = 0x100;

pub const MEM_COMMIT: u32 = 0x1000;
pub const MEM_RESERVE: u32 = 0x2000;
pub const MEM_FREE: u32 = 0x10000;

pub const MEM_PRIVATE: u32 = 0x20000;
pub const MEM_MAPPED: u32 = 0x40000;
pub const MEM_IMAGE: u32 = 0x1000000;

/// MemoryBasicInformation class for NtQueryVirtualMemory.
pub const MEMORY_BASIC_INFORMATION_CLASS: u32 = 0;

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct MemoryBasicInformation {
    pub base_address:       u64,
    pub allocation_base:    u64,
    pub allocation_protect: u32,
    pub partition_id:       u16,
    pub region_size:        u64,
    pub state:              u32,
    pub protect:            u32,
    pub kind:               u32,
}

// Process and thread access rights
pub const PROCESS_QUERY_INFORMATION: AccessMask = 0x0400;
pub const PROCESS_VM_READ: AccessMask = 0x0010;

pub const THREAD_GET_CONTEXT: AccessMask = 0x0008;
pub const THREAD_SUSPEND_RESUME: AccessMask = 0x0002;
pub const THREAD_QUERY_INFORMATION: AccessMask = 0x0040;

#[repr(C)]
pub struct ProcessBasicInformation {
    pub exit_status: NTSTATUS,
    pub peb_base_address: PVOID,
    pub affinity_mask: ULONG_PTR,
    pub base_priority: LONG,
    pub unique_process_id: ULONG_PTR,
    pub inherited_from_unique_process_id: ULONG_PTR,
}

/// SystemProcessInformation class for NtQuerySystemInformation.
pub const SYSTEM_PROCESS_INFORMATION_CLASS: u32 = 5;

/// ThreadBasicInformation class for NtQueryInformationThread.
pub const THREAD_BASIC_INFORMATION_CLASS: u32 = 0;
/// ThreadQuerySetWin32StartAddress class for NtQueryInformationThread.
pub const THREAD_QUERY_SET_WIN32_START_ADDRESS_CLASS: u32 = 9;

#[repr(C)]
pub struct ThreadBasicInformation {
    pub exit_status: NTSTATUS,
    pub teb_base_address: PVOID,
    pub client_id: ClientId,
    pub affinity_mask: ULONG_PTR,
    pub priority: LONG,
    pub base_priority: LONG,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct LargeInteger {
    pub quad_part: i64,
}

#[repr(C)]
pub struct SystemThreadInformation {
    pub kernel_time:      LargeInteger,
    pub user_time:        LargeInteger,
    pub create_time:      LargeInteger,
    pub wait_time:        ULONG,
    pub start_address:    PVOID,
    pub client_id:        ClientId,
    pub priority:         c_long,
    pub base_priority:    c_long,
    pub context_switches: ULONG,
    pub thread_state:     u32,
    pub wait_reason:      u32,
}

#[repr(C)]
pub struct SystemProcessInformation {
    pub next_entry_offset: u32,
    pub number_of_threads: u32,
    pub working_set_private_size: LargeInteger,
    pub hard_fault_count: u32,
    pub number_of_threads_high_watermark: u32,
    pub cycle_time: u64,
    pub create_time: LargeInteger,
    pub user_time: LargeInteger,
    pub kernel_time: LargeInteger,
    pub image_name: UnicodeString,
    pub base_priority: c_long,
    pub unique_process_id: HANDLE,
    pub inherited_from_unique_process_id: HANDLE,
    pub handle_count: u32,
    pub session_id: u32,
    pub unique_process_key: ULONG_PTR,
    pub peak_virtual_size: SIZE_T,
    pub virtual_size: SIZE_T,
    pub page_fault_count: ULONG,
    pub peak_working_set_size: SIZE_T,
    pub working_set_size: SIZE_T,
    pub quota_peak_paged_pool_usage: SIZE_T,
    pub quota_paged_pool_usage: SIZE_T,
    pub quota_peak_non_paged_pool_usage: SIZE_T,
    pub quota_non_paged_pool_usage: SIZE_T,
    pub pagefile_usage: SIZE_T,
    pub peak_pagefile_usage: SIZE_T,
    pub private_page_count: SIZE_T,
    pub read_operation_count: LargeInteger,
    pub write_operation_count: LargeInteger,
    pub other_operation_count: LargeInteger,
    pub read_transfer_count: LargeInteger,
    pub write_transfer_count: LargeInteger,
    pub other_transfer_count: LargeInteger,
    pub threads: [SystemThreadInformation; 1],
}

// Thread context
pub const CONTEXT_AMD64: u32 = 0x0010_0000;
pub const CONTEXT_CONTROL: u32 = CONTEXT_AMD64 | 0x1;
pub const CONTEXT_INTEGER: u32 = CONTEXT_AMD64 | 0x2;
pub const CONTEXT_SEGMENTS: u32 = CONTEXT_AMD64 | 0x4;
pub const CONTEXT_FLOATING_POINT: u32 = CONTEXT_AMD64 | 0x8;
pub const CONTEXT_FULL: u32 = CONTEXT_CONTROL | CONTEXT_INTEGER | CONTEXT_FLOATING_POINT;

pub const WOW64_CONTEXT_I386: u32 = 0x0001_0000;
pub const WOW64_CONTEXT_CONTROL: u32 = WOW64_CONTEXT_I386 | 0x1;
pub const WOW64_CONTEXT_INTEGER: u32 = WOW64_CONTEXT_I386 | 0x2;
pub const WOW64_CONTEXT_SEGMENTS: u32 = WOW64_CONTEXT_I386 | 0x4;
pub const WOW64_CONTEXT_FULL: u32 = WOW64_CONTEXT_CONTROL | WOW64_CONTEXT_INTEGER | WOW64_CONTEXT_SEGMENTS;

#[repr(C)]
#[derive(Clone, Copy)]
#[expect(
    non_snake_case,
    reason = "The M128A structure is a Windows API structure"
)]
pub struct M128A {
    pub Low:  ULONGLONG,
    pub High: LONGLONG,
}

/// The AMD64 CONTEXT record. The structure must be 16-byte aligned or
/// NtGetContextThread rejects it.
#[repr(C, align(16))]
#[expect(
    non_snake_case,
    reason = "The CONTEXT structure is a Windows API structure"
)]
pub struct CONTEXT {
    pub P1Home:               DWORD64,
    pub P2Home:               DWORD64,
    pub P3Home:               DWORD64,
    pub P4Home:               DWORD64,
    pub P5Home:               DWORD64,
    pub P6Home:               DWORD64,
    pub ContextFlags:         DWORD,
    pub MxCsr:                DWORD,
    pub SegCs:                WORD,
    pub SegDs:                WORD,
    pub SegEs:                WORD,
    pub SegFs:                WORD,
    pub SegGs:                WORD,
    pub SegSs:                WORD,
    pub EFlags:               DWORD,
    pub Dr0:                  DWORD64,
    pub Dr1:                  DWORD64,
    pub Dr2:                  DWORD64,
    pub Dr3:                  DWORD64,
    pub Dr6:                  DWORD64,
    pub Dr7:                  DWORD64,
    pub Rax:                  DWORD64,
    pub Rcx:                  DWORD64,
    pub Rdx:                  DWORD64,
    pub Rbx:                  DWORD64,
    pub Rsp:                  DWORD64,
    pub Rbp:                  DWORD64,
    pub Rsi:                  DWORD64,
    pub Rdi:                  DWORD64,
    pub R8:                   DWORD64,
    pub R9:                   DWORD64,
    pub R10:                  DWORD64,
    pub R11:                  DWORD64,
    pub R12:                  DWORD64,
    pub R13:                  DWORD64,
    pub R14:                  DWORD64,
    pub R15:                  DWORD64,
    pub Rip:                  DWORD64,
    pub FltSave:              [u8; 512],
    pub VectorRegister:       [M128A; 26],
    pub VectorControl:        DWORD64,
    pub DebugControl:         DWORD64,
    pub LastBranchToRip:      DWORD64,
    pub LastBranchFromRip:    DWORD64,
    pub LastExceptionToRip:   DWORD64,
    pub LastExceptionFromRip: DWORD64,
}

impl Default for CONTEXT {
    fn default() -> Self {
        // Safety: an all-zero CONTEXT is the documented initial state
        unsafe { core::mem::zeroed() }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
#[expect(
    non_snake_case,
    reason = "The WOW64 floating-save area is a Windows API structure"
)]
pub struct Wow64FloatingSaveArea {
    pub ControlWord:   DWORD,
    pub StatusWord:    DWORD,
    pub TagWord:       DWORD,
    pub ErrorOffset:   DWORD,
    pub ErrorSelector: DWORD,
    pub DataOffset:    DWORD,
    pub DataSelector:  DWORD,
    pub RegisterArea:  [u8; 80],
    pub Cr0NpxState:   DWORD,
}

/// The x86 CONTEXT record used for WoW64 threads.
#[repr(C)]
#[expect(
    non_snake_case,
    reason = "The WOW64_CONTEXT structure is a Windows API structure"
)]
pub struct Wow64Context {
    pub ContextFlags:      DWORD,
    pub Dr0:               DWORD,
    pub Dr1:               DWORD,
    pub Dr2:               DWORD,
    pub Dr3:               DWORD,
    pub Dr6:               DWORD,
    pub Dr7:               DWORD,
    pub FloatSave:         Wow64FloatingSaveArea,
    pub SegGs:             DWORD,
    pub SegFs:             DWORD,
    pub SegEs:             DWORD,
    pub SegDs:             DWORD,
    pub Edi:               DWORD,
    pub Esi:               DWORD,
    pub Ebx:               DWORD,
    pub Edx:               DWORD,
    pub Ecx:               DWORD,
    pub Eax:               DWORD,
    pub Ebp:               DWORD,
    pub Eip:               DWORD,
    pub SegCs:             DWORD,
    pub EFlags:            DWORD,
    pub Esp:               DWORD,
    pub SegSs:             DWORD,
    pub ExtendedRegisters: [u8; 512],
}

impl Default for Wow64Context {
    fn default() -> Self {
        // Safety: an all-zero context is the documented initial state
        unsafe { core::mem::zeroed() }
    }
}
