//! The process-wide symbol service, consumed through an interface so the
//! scanners never depend on dbghelp being usable (or present, in tests).

/// Resolves an address in the target process to a debug-symbol name.
pub trait SymbolResolver {
    /// The symbol covering `addr`, or None when no debug information
    /// knows the address.
    fn resolve(&self, addr: u64) -> Option<String>;
}

/// Resolver used when no symbol source is available; everything falls
/// back to export names and `module!+offset` strings.
pub struct NoSymbols;

impl SymbolResolver for NoSymbols {
    fn resolve(&self, _addr: u64) -> Option<String> { None }
}

#[cfg(windows)]
mod live {
    use core::mem::size_of;

    use kagami_win32::{
        dbghelp::{
            SymbolInfoW,
            MAX_SYM_NAME,
            SYMOPT_DEFERRED_LOADS,
            SYMOPT_FAIL_CRITICAL_ERRORS,
            SYMOPT_NO_PROMPTS,
            SYMOPT_UNDNAME,
        },
        ntdef::HANDLE,
    };

    use super::SymbolResolver;
    use crate::{error::ScanError, sys::sys};

    /// Debug-symbol resolution through dbghelp, scoped to one target
    /// process. Initializes the symbol handler on construction and cleans
    /// it up on drop.
    pub struct DbghelpSymbols {
        process: HANDLE,
    }

    impl DbghelpSymbols {
        pub fn new(process: HANDLE) -> Result<Self, ScanError> {
            let sys = sys()?;
            unsafe {
                (sys.dbghelp.sym_set_options)(
                    SYMOPT_UNDNAME | SYMOPT_DEFERRED_LOADS | SYMOPT_FAIL_CRITICAL_ERRORS | SYMOPT_NO_PROMPTS,
                );
            }
            let ok = unsafe { (sys.dbghelp.sym_initialize_w)(process, core::ptr::null(), 1) };
            if ok == 0 {
                return Err(ScanError::ApiResolution("SymInitializeW"));
            }
            Ok(Self { process })
        }
    }

    impl SymbolResolver for DbghelpSymbols {
        fn resolve(&self, addr: u64) -> Option<String> {
            let sys = sys().ok()?;
            // u64-backed buffer keeps SymbolInfoW's 8-byte alignment
            let bytes = size_of::<SymbolInfoW>() + MAX_SYM_NAME * 2;
            let mut buffer = vec![0u64; bytes.div_ceil(8)];
            let info = buffer.as_mut_ptr().cast::<SymbolInfoW>();
            let mut displacement: u64 = 0;
            unsafe {
                (*info).size_of_struct = size_of::<SymbolInfoW>() as u32;
                (*info).max_name_len = MAX_SYM_NAME as u32;
                let ok = (sys.dbghelp.sym_from_addr_w)(self.process, addr, &mut displacement, info);
                if ok == 0 {
                    return None;
                }
                let len = ((*info).name_len as usize).min(MAX_SYM_NAME);
                let name = core::slice::from_raw_parts((*info).name.as_ptr(), len);
                let name = String::from_utf16_lossy(name);
                if name.is_empty() {
                    None
                }
                else {
                    Some(name)
                }
            }
        }
    }

    impl Drop for DbghelpSymbols {
        fn drop(&mut self) {
            if let Ok(sys) = sys() {
                unsafe {
                    (sys.dbghelp.sym_cleanup)(self.process);
                }
            }
        }
    }
}

#[cfg(windows)]
pub use live::DbghelpSymbols;

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::BTreeMap;

    use super::SymbolResolver;

    /// Table-driven resolver for tests.
    #[derive(Default)]
    pub struct FakeSymbols {
        pub table: BTreeMap<u64, String>,
    }

    impl SymbolResolver for FakeSymbols {
        fn resolve(&self, addr: u64) -> Option<String> { self.table.get(&addr).cloned() }
    }
}
