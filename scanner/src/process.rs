use kagami_win32::ntdef::{
    MEM_COMMIT,
    MEM_FREE,
    PAGE_EXECUTE,
    PAGE_EXECUTE_READ,
    PAGE_EXECUTE_READWRITE,
    PAGE_EXECUTE_WRITECOPY,
    PAGE_GUARD,
    PAGE_READWRITE,
    PAGE_WRITECOPY,
};

use crate::error::ScanError;

/// One region of the target's virtual address space, as reported by the
/// OS memory query.
#[derive(Clone, Copy, Debug, Default)]
pub struct RegionInfo {
    pub base:       u64,
    pub alloc_base: u64,
    pub size:       u64,
    pub state:      u32,
    pub protect:    u32,
    pub kind:       u32,
}

impl RegionInfo {
    pub fn is_committed(&self) -> bool { self.state & MEM_COMMIT != 0 }

    pub fn is_free(&self) -> bool { self.state & MEM_FREE != 0 }

    pub fn is_executable(&self) -> bool {
        self.protect & PAGE_GUARD == 0
            && self.protect
                & (PAGE_EXECUTE | PAGE_EXECUTE_READ | PAGE_EXECUTE_READWRITE | PAGE_EXECUTE_WRITECOPY)
                != 0
    }

    pub fn is_writable(&self) -> bool {
        self.protect & (PAGE_READWRITE | PAGE_WRITECOPY | PAGE_EXECUTE_READWRITE | PAGE_EXECUTE_WRITECOPY)
            != 0
    }
}

/// Read access to a foreign address space.
///
/// The live implementation wraps a process handle; tests substitute a
/// buffer-backed double, which keeps every comparison and classification
/// path exercisable off the target OS.
pub trait ProcessMemory {
    /// Read up to `buf.len()` bytes at `addr`, returning how many were
    /// copied. Partial reads are expected near region boundaries.
    fn read_memory(&self, addr: u64, buf: &mut [u8]) -> Result<usize, ScanError>;

    /// The memory region containing `addr`, or None when the query fails.
    fn query_region(&self, addr: u64) -> Option<RegionInfo>;

    fn read_u64(&self, addr: u64) -> Option<u64> {
        let mut buf = [0u8; 8];
        match self.read_memory(addr, &mut buf) {
            Ok(8) => Some(u64::from_le_bytes(buf)),
            _ => None,
        }
    }

    fn read_u32(&self, addr: u64) -> Option<u32> {
        let mut buf = [0u8; 4];
        match self.read_memory(addr, &mut buf) {
            Ok(4) => Some(u32::from_le_bytes(buf)),
            _ => None,
        }
    }

    /// A pointer-width word of the inspected bitness.
    fn read_word(&self, addr: u64, is_64: bool) -> Option<u64> {
        if is_64 {
            self.read_u64(addr)
        }
        else {
            self.read_u32(addr).map(u64::from)
        }
    }
}

/// Allocation base of the page containing `addr`; zero when the address
/// lies outside any committed or reserved region.
pub fn fetch_alloc_base<M: ProcessMemory + ?Sized>(mem: &M, addr: u64) -> u64 {
    match mem.query_region(addr) {
        Some(region) if !region.is_free() => region.alloc_base,
        _ => 0,
    }
}

const PAGE_SIZE: usize = 0x1000;

/// Copy `size` bytes of the mapped image at `base` into a local buffer,
/// page by page. Unreadable pages stay zero-filled; the read fails as a
/// whole only when not a single page came through.
pub fn read_remote_image<M: ProcessMemory + ?Sized>(
    mem: &M,
    base: u64,
    size: usize,
) -> Result<Vec<u8>, ScanError> {
    let mut image = vec![0u8; size];
    let mut any = false;
    let mut offset = 0usize;
    while offset < size {
        let chunk = PAGE_SIZE.min(size - offset);
        let Some(slice) = image.get_mut(offset .. offset + chunk) else {
            break;
        };
        if let Ok(read) = mem.read_memory(base + offset as u64, slice) {
            any |= read > 0;
        }
        offset += chunk;
    }
    if any {
        Ok(image)
    }
    else {
        Err(ScanError::RemoteRead(base))
    }
}

#[cfg(windows)]
mod live {
    use core::{ffi::c_void, mem::size_of};

    use kagami_win32::{
        ntdef::{MemoryBasicInformation, HANDLE, MEMORY_BASIC_INFORMATION_CLASS, SIZE_T},
        ntstatus::NT_SUCCESS,
    };

    use super::{ProcessMemory, RegionInfo};
    use crate::{error::ScanError, sys::sys};

    /// A target process, borrowed as a read-only handle. Opening and
    /// closing the handle is the driver's business.
    pub struct Process {
        handle: HANDLE,
    }

    impl Process {
        pub fn from_handle(handle: HANDLE) -> Self { Self { handle } }

        pub fn handle(&self) -> HANDLE { self.handle }

        /// Whether the process runs 32-bit code under WoW64.
        pub fn is_wow64(&self) -> Result<bool, ScanError> {
            let sys = sys()?;
            let mut wow64: i32 = 0;
            let ok = unsafe { (sys.kernel32.is_wow64_process)(self.handle, &mut wow64) };
            if ok == 0 {
                return Err(ScanError::RemoteQuery(0));
            }
            Ok(wow64 != 0)
        }
    }

    // Safety: the wrapped handle is used for read-only queries
    unsafe impl Send for Process {}
    // Safety: the wrapped handle is used for read-only queries
    unsafe impl Sync for Process {}

    impl ProcessMemory for Process {
        fn read_memory(&self, addr: u64, buf: &mut [u8]) -> Result<usize, ScanError> {
            let sys = sys()?;
            let mut read: SIZE_T = 0;
            let status = unsafe {
                (sys.ntdll.nt_read_virtual_memory)(
                    self.handle,
                    addr as usize as *mut c_void,
                    buf.as_mut_ptr().cast::<c_void>(),
                    buf.len(),
                    &mut read,
                )
            };
            // partial copies still deliver bytes
            if NT_SUCCESS(status) || read > 0 {
                Ok(read)
            }
            else {
                Err(ScanError::RemoteRead(addr))
            }
        }

        fn query_region(&self, addr: u64) -> Option<RegionInfo> {
            let sys = sys().ok()?;
            let mut info = MemoryBasicInformation::default();
            let mut returned: SIZE_T = 0;
            let status = unsafe {
                (sys.ntdll.nt_query_virtual_memory)(
                    self.handle,
                    addr as usize as *mut c_void,
                    MEMORY_BASIC_INFORMATION_CLASS,
                    (&mut info as *mut MemoryBasicInformation).cast::<c_void>(),
                    size_of::<MemoryBasicInformation>(),
                    &mut returned,
                )
            };
            if !NT_SUCCESS(status) {
                return None;
            }
            Some(RegionInfo {
                base:       info.base_address,
                alloc_base: info.allocation_base,
                size:       info.region_size,
                state:      info.state,
                protect:    info.protect,
                kind:       info.kind,
            })
        }
    }
}

#[cfg(windows)]
pub use live::Process;

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::BTreeMap;

    use super::{ProcessMemory, RegionInfo};
    use crate::error::ScanError;

    /// Buffer-backed stand-in for a remote address space.
    #[derive(Default)]
    pub struct FakeMemory {
        regions: BTreeMap<u64, (Vec<u8>, RegionInfo)>,
    }

    impl FakeMemory {
        pub fn new() -> Self { Self::default() }

        pub fn map(&mut self, base: u64, bytes: Vec<u8>, protect: u32, kind: u32) {
            let info = RegionInfo {
                base,
                alloc_base: base,
                size: bytes.len() as u64,
                state: kagami_win32::ntdef::MEM_COMMIT,
                protect,
                kind,
            };
            self.regions.insert(base, (bytes, info));
        }

        pub fn write(&mut self, addr: u64, bytes: &[u8]) {
            let mut written = false;
            for (&base, (buf, _)) in self.regions.iter_mut() {
                if addr >= base && addr < base + buf.len() as u64 {
                    let off = (addr - base) as usize;
                    buf[off .. off + bytes.len()].copy_from_slice(bytes);
                    written = true;
                    break;
                }
            }
            assert!(written, "write outside mapped regions");
        }
    }

    impl ProcessMemory for FakeMemory {
        fn read_memory(&self, addr: u64, buf: &mut [u8]) -> Result<usize, ScanError> {
            for (&base, (bytes, _)) in self.regions.iter() {
                let end = base + bytes.len() as u64;
                if addr >= base && addr < end {
                    let off = (addr - base) as usize;
                    let avail = bytes.len() - off;
                    let count = avail.min(buf.len());
                    buf[.. count].copy_from_slice(&bytes[off .. off + count]);
                    return Ok(count);
                }
            }
            Err(ScanError::RemoteRead(addr))
        }

        fn query_region(&self, addr: u64) -> Option<RegionInfo> {
            for (&base, (bytes, info)) in self.regions.iter() {
                if addr >= base && addr < base + bytes.len() as u64 {
                    return Some(*info);
                }
            }
            None
        }
    }

    #[cfg(test)]
    mod tests {
        use kagami_win32::ntdef::{MEM_PRIVATE, PAGE_EXECUTE_READWRITE, PAGE_READONLY};

        use super::*;
        use crate::process::{fetch_alloc_base, read_remote_image};

        #[test]
        fn fake_memory_partial_reads() {
            let mut mem = FakeMemory::new();
            mem.map(0x1000, vec![0xaa; 0x10], PAGE_READONLY, MEM_PRIVATE);
            let mut buf = [0u8; 0x20];
            assert_eq!(mem.read_memory(0x1008, &mut buf).unwrap(), 8);
        }

        #[test]
        fn alloc_base_zero_outside_any_region() {
            let mut mem = FakeMemory::new();
            mem.map(0x4000, vec![0; 0x1000], PAGE_EXECUTE_READWRITE, MEM_PRIVATE);
            assert_eq!(fetch_alloc_base(&mem, 0x4800), 0x4000);
            assert_eq!(fetch_alloc_base(&mem, 0x9999_0000), 0);
        }

        #[test]
        fn remote_image_read_zero_fills_gaps() {
            let mut mem = FakeMemory::new();
            mem.map(0x1_0000, vec![0x41; 0x1000], PAGE_READONLY, MEM_PRIVATE);
            // second page not mapped
            let image = read_remote_image(&mem, 0x1_0000, 0x2000).unwrap();
            assert_eq!(image[0], 0x41);
            assert_eq!(image[0x1000], 0);
        }

        #[test]
        fn remote_image_read_fails_when_nothing_is_readable() {
            let mem = FakeMemory::new();
            assert!(read_remote_image(&mem, 0x5_0000, 0x1000).is_err());
        }
    }
}
