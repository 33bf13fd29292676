use core::{ffi::c_void, ptr::null_mut};

use crate::ntdef::{
    AccessMask,
    ClientId,
    ObjectAttributes,
    HANDLE,
    NTSTATUS,
    PHANDLE,
    PVOID,
    SIZE_T,
    ULONG,
};

pub type NtClose = unsafe extern "system" fn(handle: HANDLE) -> NTSTATUS;

pub type NtOpenThread = unsafe extern "system" fn(
    thread_handle: PHANDLE,
    desired_access: AccessMask,
    object_attributes: *mut ObjectAttributes,
    client_id: *mut ClientId,
) -> NTSTATUS;

pub type NtSuspendThread =
    unsafe extern "system" fn(thread_handle: HANDLE, previous_suspend_count: *mut ULONG) -> NTSTATUS;

pub type NtResumeThread =
    unsafe extern "system" fn(thread_handle: HANDLE, previous_suspend_count: *mut ULONG) -> NTSTATUS;

/// The context record pointer is untyped here: the caller passes either a
/// CONTEXT or, through the WoW64 variant on kernel32, a Wow64Context.
pub type NtGetContextThread =
    unsafe extern "system" fn(thread_handle: HANDLE, thread_context: PVOID) -> NTSTATUS;

pub type NtQueryInformationThread = unsafe extern "system" fn(
    thread_handle: HANDLE,
    thread_information_class: u32,
    thread_information: PVOID,
    thread_information_length: ULONG,
    return_length: *mut ULONG,
) -> NTSTATUS;

pub type NtQueryInformationProcess = unsafe extern "system" fn(
    process_handle: HANDLE,
    process_information_class: u32,
    process_information: PVOID,
    process_information_length: ULONG,
    return_length: *mut ULONG,
) -> NTSTATUS;

pub type NtQuerySystemInformation = unsafe extern "system" fn(
    system_information_class: u32,
    system_information: PVOID,
    system_information_length: ULONG,
    return_length: *mut ULONG,
) -> NTSTATUS;

pub type NtReadVirtualMemory = unsafe extern "system" fn(
    process_handle: HANDLE,
    base_address: PVOID,
    buffer: PVOID,
    buffer_size: SIZE_T,
    number_of_bytes_read: *mut SIZE_T,
) -> NTSTATUS;

pub type NtQueryVirtualMemory = unsafe extern "system" fn(
    process_handle: HANDLE,
    base_address: PVOID,
    memory_information_class: u32,
    memory_information: PVOID,
    memory_information_length: SIZE_T,
    return_length: *mut SIZE_T,
) -> NTSTATUS;

/// Table of the ntdll entry points the scanners call, filled in once at
/// startup by resolving each name against ntdll's export directory.
pub struct Ntdll {
    pub module_base: *mut u8,
    pub nt_close: NtClose,
    pub nt_open_thread: NtOpenThread,
    pub nt_suspend_thread: NtSuspendThread,
    pub nt_resume_thread: NtResumeThread,
    pub nt_get_context_thread: NtGetContextThread,
    pub nt_query_information_thread: NtQueryInformationThread,
    pub nt_query_information_process: NtQueryInformationProcess,
    pub nt_query_system_information: NtQuerySystemInformation,
    pub nt_read_virtual_memory: NtReadVirtualMemory,
    pub nt_query_virtual_memory: NtQueryVirtualMemory,
}

impl Default for Ntdll {
    fn default() -> Self { Self::new() }
}

impl Ntdll {
    pub fn new() -> Self {
        Self {
            module_base: null_mut(),
            nt_close: unsafe { core::mem::transmute(null_mut::<c_void>()) },
            nt_open_thread: unsafe { core::mem::transmute(null_mut::<c_void>()) },
            nt_suspend_thread: unsafe { core::mem::transmute(null_mut::<c_void>()) },
            nt_resume_thread: unsafe { core::mem::transmute(null_mut::<c_void>()) },
            nt_get_context_thread: unsafe { core::mem::transmute(null_mut::<c_void>()) },
            nt_query_information_thread: unsafe { core::mem::transmute(null_mut::<c_void>()) },
            nt_query_information_process: unsafe { core::mem::transmute(null_mut::<c_void>()) },
            nt_query_system_information: unsafe { core::mem::transmute(null_mut::<c_void>()) },
            nt_read_virtual_memory: unsafe { core::mem::transmute(null_mut::<c_void>()) },
            nt_query_virtual_memory: unsafe { core::mem::transmute(null_mut::<c_void>()) },
        }
    }
}

// Safety: the table holds plain function pointers, written once at startup
unsafe impl Sync for Ntdll {}
// Safety: the table holds plain function pointers, written once at startup
unsafe impl Send for Ntdll {}
