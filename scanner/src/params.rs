/// Post-classification filtering of uncovered IAT slots.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IatFilterMode {
    /// Surface every uncovered slot.
    Unfiltered,
    /// Surface only slots whose declared import is on the caller's list;
    /// an empty list passes everything through.
    Listed,
    /// Drop slots resolving into system-directory DLLs, unless the target
    /// module itself is flagged suspicious.
    CleanSysFiltered,
    /// Like [`IatFilterMode::Unfiltered`], keeping the system-DLL-only
    /// cases the caller asked about.
    UnfilteredSysAll,
}

/// How much detail the JSON emitters include.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum JsonDetail {
    Basic,
    Details,
    DetailsAll,
}

/// Per-pass scanner configuration. System directory paths are expanded
/// from `%SystemRoot%` once, at scanner construction, and kept as
/// per-scanner state.
#[derive(Clone, Debug)]
pub struct ScanParams {
    pub iat_filter: IatFilterMode,
    pub json_detail: JsonDetail,
    /// Machine words inspected below the stack pointer when the OS stack
    /// walk fails and the bounded linear scan takes over.
    pub stack_scan_depth: usize,
    /// The target process hosts the .NET runtime; shellcode indicators
    /// from JIT-emitted pages are suppressed for managed threads.
    pub is_managed: bool,
    /// Allowlist for [`IatFilterMode::Listed`], by declared import name.
    pub listed_imports: Vec<String>,
}

impl Default for ScanParams {
    fn default() -> Self {
        Self {
            iat_filter: IatFilterMode::CleanSysFiltered,
            json_detail: JsonDetail::Basic,
            stack_scan_depth: 0x200,
            is_managed: false,
            listed_imports: Vec::new(),
        }
    }
}

/// Lowercase `%SystemRoot%\system32` and `%SystemRoot%\syswow64`,
/// falling back to the conventional root when the variable is unset.
pub(crate) fn system_dirs() -> (String, String) {
    let root = std::env::var("SystemRoot").unwrap_or_else(|_| String::from("C:\\Windows"));
    let root = root.trim_end_matches('\\').to_ascii_lowercase();
    (format!("{}\\system32", root), format!("{}\\syswow64", root))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detail_levels_are_ordered() {
        assert!(JsonDetail::Details >= JsonDetail::Basic);
        assert!(JsonDetail::DetailsAll > JsonDetail::Details);
    }

    #[test]
    fn system_dirs_are_lowercase_pairs() {
        let (system32, syswow64) = system_dirs();
        assert!(system32.ends_with("\\system32"));
        assert!(syswow64.ends_with("\\syswow64"));
        assert_eq!(system32, system32.to_ascii_lowercase());
    }
}
