use std::collections::{BTreeMap, BTreeSet};

use kagami_win32::ntdef::{HANDLE, MEM_IMAGE};
use log::{debug, warn};
use serde::Serialize;

use crate::{
    exports_map::ExportsMap,
    params::ScanParams,
    process::{ProcessMemory, RegionInfo},
    registry::{ModuleDesc, ModuleRegistry},
    report::{hex, ScanStatus},
    symbols::SymbolResolver,
};

pub const THREAD_STATE_UNKNOWN: u32 = u32::MAX;
pub const THREAD_STATE_RUNNING: u32 = 2;
pub const THREAD_STATE_WAITING: u32 = 5;

/// The fixed taxonomy of suspicious-thread indicators.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum ThSusIndicator {
    SusStart,
    SusIp,
    SusRet,
    SusCallstackShc,
    SusCallsIntegrity,
    SusCallstackCorrupt,
}

impl ThSusIndicator {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SusStart => "SUS_START",
            Self::SusIp => "SUS_IP",
            Self::SusRet => "SUS_RET",
            Self::SusCallstackShc => "SUS_CALLSTACK_SHC",
            Self::SusCallsIntegrity => "SUS_CALLS_INTEGRITY",
            Self::SusCallstackCorrupt => "SUS_CALLSTACK_CORRUPT",
        }
    }

    pub fn from_name(value: &str) -> Option<Self> {
        match value {
            "SUS_START" => Some(Self::SusStart),
            "SUS_IP" => Some(Self::SusIp),
            "SUS_RET" => Some(Self::SusRet),
            "SUS_CALLSTACK_SHC" => Some(Self::SusCallstackShc),
            "SUS_CALLS_INTEGRITY" => Some(Self::SusCallsIntegrity),
            "SUS_CALLSTACK_CORRUPT" => Some(Self::SusCallstackCorrupt),
            _ => None,
        }
    }
}

pub fn translate_thread_state(state: u32) -> String {
    String::from(match state {
        0 => "Initialized",
        1 => "Ready",
        2 => "Running",
        3 => "Standby",
        4 => "Terminated",
        5 => "Waiting",
        6 => "Transition",
        7 => "DeferredReady",
        8 => "GateWaitObsolete",
        9 => "WaitingForProcessInSwap",
        _ => return format!("({})", state),
    })
}

pub fn translate_wait_reason(reason: u32) -> String {
    String::from(match reason {
        0 => "Executive",
        1 => "FreePage",
        2 => "PageIn",
        3 => "PoolAllocation",
        4 => "DelayExecution",
        5 => "Suspended",
        6 => "UserRequest",
        7 => "WrExecutive",
        8 => "WrFreePage",
        9 => "WrPageIn",
        10 => "WrPoolAllocation",
        11 => "WrDelayExecution",
        12 => "WrSuspended",
        13 => "WrUserRequest",
        14 => "WrEventPair",
        15 => "WrQueue",
        16 => "WrLpcReceive",
        17 => "WrLpcReply",
        18 => "WrVirtualMemory",
        19 => "WrPageOut",
        20 => "WrRendezvous",
        21 => "WrKeyedEvent",
        22 => "WrTerminated",
        23 => "WrProcessInSwap",
        24 => "WrCpuRateControl",
        25 => "WrCalloutStack",
        26 => "WrKernel",
        27 => "WrResource",
        28 => "WrPushLock",
        29 => "WrMutex",
        30 => "WrQuantumEnd",
        31 => "WrDispatchInt",
        32 => "WrPreempted",
        33 => "WrYieldExecution",
        34 => "WrFastMutex",
        35 => "WrGuardedMutex",
        36 => "WrRundown",
        37 => "WrAlertByThreadId",
        38 => "WrDeferredPreempt",
        _ => return format!("({})", reason),
    })
}

/// One thread of the target process, as sampled from the system's
/// process-information snapshot.
#[derive(Clone, Debug)]
pub struct ThreadInfo {
    pub tid: u32,
    pub start_address: u64,
    pub state: u32,
    pub wait_reason: u32,
    pub wait_time: u32,
    /// Whether state and wait fields were actually sampled.
    pub is_extended: bool,
}

impl ThreadInfo {
    pub fn new(tid: u32) -> Self {
        Self {
            tid,
            start_address: 0,
            state: THREAD_STATE_UNKNOWN,
            wait_reason: 0,
            wait_time: 0,
            is_extended: false,
        }
    }
}

/// A sampled fragment of a thread's execution state.
#[derive(Clone, Debug)]
pub struct CtxDetails {
    pub is_64: bool,
    pub ip: u64,
    pub sp: u64,
    pub bp: u64,
    /// The last return address observed on the stack.
    pub last_ret: u64,
    /// The return address stored at the current stack top.
    pub ret_on_stack: u64,
    pub is_ret_as_syscall: bool,
    pub is_ret_in_frame: bool,
    /// The call stack touches .NET runtime modules.
    pub is_managed: bool,
    /// Return addresses, innermost frame first.
    pub call_stack: Vec<u64>,
}

impl Default for CtxDetails {
    fn default() -> Self {
        Self {
            is_64: true,
            ip: 0,
            sp: 0,
            bp: 0,
            last_ret: 0,
            ret_on_stack: 0,
            is_ret_as_syscall: true,
            is_ret_in_frame: true,
            is_managed: false,
            call_stack: Vec::new(),
        }
    }
}

/// Shannon entropy and size of the memory area around a suspicious
/// address.
#[derive(Clone, Copy, Debug)]
pub struct AreaStats {
    pub entropy:   f64,
    pub area_size: u64,
}

pub(crate) fn shannon_entropy(bytes: &[u8]) -> f64 {
    if bytes.is_empty() {
        return 0.0;
    }
    let mut counts = [0usize; 256];
    for &byte in bytes {
        counts[byte as usize] += 1;
    }
    let total = bytes.len() as f64;
    counts
        .iter()
        .filter(|&&count| count > 0)
        .map(|&count| {
            let p = count as f64 / total;
            -p * p.log2()
        })
        .sum()
}

#[derive(Serialize)]
struct CallstackJson {
    stack_ptr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    frames_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frames: Option<Vec<String>>,
}

#[derive(Serialize)]
struct ThreadInfoJson {
    state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    wait_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    callstack: Option<CallstackJson>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_sysc: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_func: Option<String>,
}

#[derive(Serialize)]
struct StatsJson {
    entropy:   f64,
    area_size: String,
}

#[derive(Serialize)]
struct ThreadScanBody {
    thread_id: u32,
    thread_info: ThreadInfoJson,
    indicators: Vec<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    susp_addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    susp_return_addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    module: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    module_size: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    protection: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stats: Option<StatsJson>,
}

#[derive(Serialize)]
struct ThreadScanJson {
    thread_scan: ThreadScanBody,
}

/// Findings of one thread scan. Owned by the caller; the scanners never
/// keep a reference to it.
pub struct ThreadScanReport {
    pub tid: u32,
    pub status: ScanStatus,
    /// Address that triggered the report; zero when none.
    pub susp_addr: u64,
    /// Base of the module identified at the suspicious address, when any.
    pub module: u64,
    pub module_size: u64,
    pub protection: u32,
    pub stack_ptr: u64,
    pub thread_state: u32,
    pub thread_wait_reason: u32,
    pub thread_wait_time: u32,
    pub start_address: u64,
    pub last_syscall: String,
    pub last_function: String,
    pub c_details: CtxDetails,
    pub addr_to_symbol: BTreeMap<u64, String>,
    pub shc_candidates: BTreeSet<u64>,
    pub indicators: BTreeSet<ThSusIndicator>,
    pub stats: Option<AreaStats>,
}

impl ThreadScanReport {
    pub fn new(tid: u32) -> Self {
        Self {
            tid,
            status: ScanStatus::NotSuspicious,
            susp_addr: 0,
            module: 0,
            module_size: 0,
            protection: 0,
            stack_ptr: 0,
            thread_state: THREAD_STATE_UNKNOWN,
            thread_wait_reason: 0,
            thread_wait_time: 0,
            start_address: 0,
            last_syscall: String::new(),
            last_function: String::new(),
            c_details: CtxDetails::default(),
            addr_to_symbol: BTreeMap::new(),
            shc_candidates: BTreeSet::new(),
            indicators: BTreeSet::new(),
            stats: None,
        }
    }

    fn has(&self, indicator: ThSusIndicator) -> bool { self.indicators.contains(&indicator) }

    /// The nested JSON view, gated by the requested detail level.
    ///
    /// Call-stack frames appear at `Details` and above, or whenever the
    /// stack itself is implicated (`SUS_CALLSTACK_SHC`,
    /// `SUS_CALLSTACK_CORRUPT`); frames iterate outermost-first. The
    /// last-call fields follow the same rule with `SUS_CALLS_INTEGRITY`.
    pub fn to_json(&self, detail: crate::params::JsonDetail) -> serde_json::Value {
        let print_callstack = detail >= crate::params::JsonDetail::Details
            || self.has(ThSusIndicator::SusCallstackShc)
            || self.has(ThSusIndicator::SusCallstackCorrupt);
        let show_last_call = detail >= crate::params::JsonDetail::Details
            || self.has(ThSusIndicator::SusCallsIntegrity)
            || self.has(ThSusIndicator::SusCallstackCorrupt);

        let callstack = if self.stack_ptr == 0 {
            None
        }
        else {
            let frames = (print_callstack && !self.c_details.call_stack.is_empty()).then(|| {
                self.c_details
                    .call_stack
                    .iter()
                    .rev()
                    .map(|&addr| {
                        match self.addr_to_symbol.get(&addr) {
                            Some(symbol) => format!("{:x};{}", addr, symbol),
                            None => hex(addr),
                        }
                    })
                    .collect()
            });
            Some(CallstackJson {
                stack_ptr: hex(self.stack_ptr),
                frames_count: (!self.c_details.call_stack.is_empty())
                    .then(|| self.c_details.call_stack.len()),
                frames,
            })
        };

        let state = if self.thread_state == THREAD_STATE_UNKNOWN {
            String::from("UNKNOWN")
        }
        else {
            translate_thread_state(self.thread_state)
        };
        let wait_reason = (self.thread_state == THREAD_STATE_WAITING)
            .then(|| translate_wait_reason(self.thread_wait_reason));

        let last_sysc = (show_last_call && !self.last_syscall.is_empty())
            .then(|| self.last_syscall.clone());
        let last_func = (show_last_call
            && !self.last_function.is_empty()
            && self.last_function != self.last_syscall)
            .then(|| self.last_function.clone());

        let module_found = self.module != 0 && self.module_size != 0;
        let (susp_addr, susp_return_addr) = if self.susp_addr == 0 {
            (None, None)
        }
        else if module_found {
            (Some(hex(self.susp_addr)), None)
        }
        else {
            (None, Some(hex(self.susp_addr)))
        };

        let view = ThreadScanJson {
            thread_scan: ThreadScanBody {
                thread_id: self.tid,
                thread_info: ThreadInfoJson {
                    state,
                    wait_reason,
                    callstack,
                    last_sysc,
                    last_func,
                },
                indicators: self.indicators.iter().map(|i| i.as_str()).collect(),
                susp_addr,
                susp_return_addr,
                module: (self.module != 0).then(|| hex(self.module)),
                module_size: (self.module_size != 0).then(|| hex(self.module_size)),
                protection: (self.susp_addr != 0).then(|| hex(u64::from(self.protection))),
                stats: self.stats.map(|stats| {
                    StatsJson {
                        entropy:   stats.entropy,
                        area_size: hex(stats.area_size),
                    }
                }),
            },
        };
        serde_json::to_value(view).unwrap_or(serde_json::Value::Null)
    }
}

/// Expected length of a `FF /2` (call r/m) instruction starting at
/// `bytes[0]`, derived from its modrm/sib encoding; None when the bytes
/// do not encode an indirect call.
fn indirect_call_len(bytes: &[u8]) -> Option<usize> {
    if *bytes.first()? != 0xff {
        return None;
    }
    let modrm = *bytes.get(1)?;
    let reg = (modrm >> 3) & 7;
    if reg != 2 && reg != 3 {
        return None;
    }
    let mode = modrm >> 6;
    let rm = modrm & 7;
    let mut len = 2usize;
    if mode != 3 && rm == 4 {
        len += 1; // SIB byte
    }
    match mode {
        0 => {
            if rm == 5 {
                len += 4; // disp32 / RIP-relative
            }
        },
        1 => len += 1,
        2 => len += 4,
        _ => {},
    }
    Some(len)
}

/// Whether the bytes immediately before `ret_addr` decode to any call
/// form, i.e. whether `ret_addr` can be a genuine call-return site.
pub(crate) fn is_preceded_by_call<M: ProcessMemory + ?Sized>(mem: &M, ret_addr: u64) -> bool {
    const WINDOW: usize = 7;
    if ret_addr < WINDOW as u64 {
        return false;
    }
    let mut window = [0u8; WINDOW];
    match mem.read_memory(ret_addr - WINDOW as u64, &mut window) {
        Ok(read) if read == WINDOW => {},
        _ => return false,
    }
    for length in 2 ..= WINDOW {
        let Some(slice) = window.get(WINDOW - length ..) else {
            continue;
        };
        // direct near call, rel32
        if length == 5 && slice.first() == Some(&0xe8) {
            return true;
        }
        if indirect_call_len(slice) == Some(length) {
            return true;
        }
    }
    false
}

const MAX_FRAMES: usize = 128;
const MAX_FALLBACK_FRAMES: usize = 64;
const RET_ON_STACK_PROBE: usize = 16;
const STATS_READ_CAP: usize = 0x4000;

/// Low-level modules whose frames wrap the actual blocking call.
const LOW_LEVEL_MODULES: [&str; 5] = ["ntdll", "win32u", "wow64", "wow64cpu", "wow64win"];

/// .NET runtime modules; JIT-emitted pages make their threads look like
/// shellcode to the unbacked-memory heuristics.
const DOTNET_MODULES: [&str; 6] = [
    "clr",
    "coreclr",
    "clrjit",
    "mscorwks",
    "mscoree",
    "mscoreei",
];

/// Pairs the integrity check accepts although the names do not overlap.
const SYSCALL_FUNC_ALLOWLIST: [(&str, &[&str]); 5] = [
    ("delayexecution", &["sleep"]),
    ("waitforalertbythreadid", &["waitonaddress", "sleepconditionvariable"]),
    ("removeiocompletion", &["getqueuedcompletionstatus"]),
    ("removeiocompletionex", &["getqueuedcompletionstatusex"]),
    ("signalandwaitforsingleobject", &["signalobjectandwait"]),
];

/// Samples one thread of the target process and classifies suspicious
/// execution sites and stack corruption.
///
/// The scan advances through Init, Sampled (context captured under a
/// short suspension), Unwound, Classified and Reported; a failure at any
/// step lands the report in the error state instead.
pub struct ThreadScanner<'a, M: ProcessMemory + ?Sized> {
    mem: &'a M,
    process_handle: HANDLE,
    info: &'a ThreadInfo,
    registry: &'a ModuleRegistry,
    exports_map: &'a ExportsMap,
    symbols: &'a dyn SymbolResolver,
    is_managed: bool,
    is_wow64: bool,
    stack_scan_depth: usize,
}

impl<'a, M: ProcessMemory + ?Sized> ThreadScanner<'a, M> {
    #[expect(
        clippy::too_many_arguments,
        reason = "the scanner borrows every shared pass structure it reads"
    )]
    pub fn new(
        mem: &'a M,
        process_handle: HANDLE,
        info: &'a ThreadInfo,
        registry: &'a ModuleRegistry,
        exports_map: &'a ExportsMap,
        symbols: &'a dyn SymbolResolver,
        params: &ScanParams,
        is_wow64: bool,
    ) -> Self {
        Self {
            mem,
            process_handle,
            info,
            registry,
            exports_map,
            symbols,
            is_managed: params.is_managed,
            is_wow64,
            stack_scan_depth: params.stack_scan_depth,
        }
    }

    pub fn process_handle(&self) -> HANDLE { self.process_handle }

    /// Scan the thread and return the findings as a report. Failure to
    /// open or sample the thread errors this report only; the enclosing
    /// pass moves on to the next work unit.
    pub fn scan_remote(&self) -> ThreadScanReport {
        let mut report = ThreadScanReport::new(self.info.tid);
        self.init_report(&mut report);

        if let Err(err) = self.sample_context(&mut report) {
            warn!("thread {}: {}", self.info.tid, err);
            report.status = ScanStatus::Error;
            return report;
        }
        self.unwind(&mut report);
        self.classify(&mut report);
        self.filter_dotnet(&mut report);
        self.resolve_symbols(&mut report);
        self.check_calls_integrity(&mut report);

        report.status = if report.indicators.is_empty() {
            ScanStatus::NotSuspicious
        }
        else {
            ScanStatus::Suspicious
        };
        report
    }

    fn init_report(&self, report: &mut ThreadScanReport) {
        report.thread_state = if self.info.is_extended {
            self.info.state
        }
        else {
            THREAD_STATE_UNKNOWN
        };
        report.thread_wait_reason = self.info.wait_reason;
        report.thread_wait_time = self.info.wait_time;
        report.start_address = self.info.start_address;
        report.c_details.is_64 = !self.is_wow64;
        // a thread parked in a wait got there through a syscall; its
        // top-of-stack return address must look like a real call return
        report.c_details.is_ret_as_syscall =
            self.info.is_extended && self.info.state == THREAD_STATE_WAITING;
    }

    /// Capture the register context under a suspension held as briefly as
    /// possible; everything afterwards works on the snapshot.
    #[cfg(windows)]
    fn sample_context(&self, report: &mut ThreadScanReport) -> Result<(), crate::error::ScanError> {
        self.sample_context_live(report)
    }

    #[cfg(not(windows))]
    fn sample_context(&self, _report: &mut ThreadScanReport) -> Result<(), crate::error::ScanError> {
        Err(crate::error::ScanError::UnsupportedPlatform)
    }

    /// Walk the call stack with the OS unwinder; when that produces
    /// nothing, fall back to the bounded linear scan of the stack region.
    fn unwind(&self, report: &mut ThreadScanReport) {
        #[cfg(windows)]
        let walked = self.fill_call_stack_walk(report);
        #[cfg(not(windows))]
        let walked = false;
        if !walked {
            debug!("thread {}: stack walk unavailable, scanning the stack", self.info.tid);
            report.c_details.call_stack = self.fallback_stack_scan(report.c_details.sp);
        }
        report.c_details.ret_on_stack = self
            .probe_ret_on_stack(report.c_details.sp)
            .or_else(|| report.c_details.call_stack.first().copied())
            .unwrap_or(0);
    }

    /// Word-aligned slots from the stack pointer up, kept when they point
    /// into executable committed memory. The depth limit and the
    /// protection check keep the false-positive rate testable.
    pub(crate) fn fallback_stack_scan(&self, sp: u64) -> Vec<u64> {
        let mut frames = Vec::new();
        if sp == 0 {
            return frames;
        }
        let word = if self.is_wow64 { 4 } else { 8 };
        for index in 0 .. self.stack_scan_depth {
            if frames.len() >= MAX_FALLBACK_FRAMES {
                break;
            }
            let slot = sp + (index * word) as u64;
            let Some(value) = self.mem.read_word(slot, !self.is_wow64) else {
                break;
            };
            if value == 0 {
                continue;
            }
            if self
                .mem
                .query_region(value)
                .is_some_and(|region| region.is_committed() && region.is_executable())
            {
                frames.push(value);
            }
        }
        frames
    }

    /// First stack slot near the top holding something executable; the
    /// return address the current frame would go back to.
    fn probe_ret_on_stack(&self, sp: u64) -> Option<u64> {
        if sp == 0 {
            return None;
        }
        let word = if self.is_wow64 { 4 } else { 8 };
        for index in 0 .. RET_ON_STACK_PROBE {
            let slot = sp + (index * word) as u64;
            let value = self.mem.read_word(slot, !self.is_wow64)?;
            if value != 0
                && self
                    .mem
                    .query_region(value)
                    .is_some_and(|region| region.is_committed() && region.is_executable())
            {
                return Some(value);
            }
        }
        None
    }

    /// Whether executing at `addr` is something a healthy thread does:
    /// inside a registered, unflagged module, in memory that is not both
    /// writable and executable.
    pub(crate) fn suspicious_exec_site(
        &self,
        addr: u64,
    ) -> Option<(Option<&ModuleDesc>, RegionInfo)> {
        if addr == 0 {
            return None;
        }
        let region = self.mem.query_region(addr);
        match self.registry.find_module_containing(addr) {
            None => Some((None, region.unwrap_or_default())),
            Some(module) if module.is_suspicious => Some((Some(module), region.unwrap_or_default())),
            Some(module) => {
                match region {
                    Some(region) if region.is_writable() && region.is_executable() => {
                        Some((Some(module), region))
                    },
                    _ => None,
                }
            },
        }
    }

    fn report_suspicious_addr(
        &self,
        report: &mut ThreadScanReport,
        addr: u64,
        module: Option<&ModuleDesc>,
        region: RegionInfo,
    ) {
        if report.susp_addr != 0 {
            return;
        }
        report.susp_addr = addr;
        report.protection = region.protect;
        if let Some(module) = module {
            report.module = module.base;
            report.module_size = module.size;
        }
        if region.is_committed() && region.size != 0 {
            let size = (region.size as usize).min(STATS_READ_CAP);
            let mut bytes = vec![0u8; size];
            if let Ok(read) = self.mem.read_memory(region.base, &mut bytes) {
                if read > 0 {
                    bytes.truncate(read);
                    report.stats = Some(AreaStats {
                        entropy:   shannon_entropy(&bytes),
                        area_size: region.size,
                    });
                }
            }
        }
    }

    /// Steps 4-6 of the scan: instruction pointer, start address, return
    /// addresses, stack shape.
    pub(crate) fn classify(&self, report: &mut ThreadScanReport) {
        let details = report.c_details.clone();

        if let Some((module, region)) = self.suspicious_exec_site(details.ip) {
            report.indicators.insert(ThSusIndicator::SusIp);
            self.report_suspicious_addr(report, details.ip, module, region);
        }
        if let Some((module, region)) = self.suspicious_exec_site(report.start_address) {
            report.indicators.insert(ThSusIndicator::SusStart);
            self.report_suspicious_addr(report, report.start_address, module, region);
        }

        // shellcode candidates: return addresses into executable memory
        // that no registered module backs
        for &ret in &details.call_stack {
            if self.registry.find_module_containing(ret).is_some() {
                continue;
            }
            let Some(region) = self.mem.query_region(ret) else {
                continue;
            };
            if region.is_committed() && region.is_executable() && region.kind != MEM_IMAGE {
                report.shc_candidates.insert(ret);
                report.indicators.insert(ThSusIndicator::SusCallstackShc);
                self.report_suspicious_addr(report, ret, None, region);
            }
        }

        // the top-of-stack return address must sit right after a call
        if details.ret_on_stack != 0 {
            let in_frame = is_preceded_by_call(self.mem, details.ret_on_stack);
            report.c_details.is_ret_in_frame = in_frame;
            if !in_frame && details.is_ret_as_syscall {
                report.indicators.insert(ThSusIndicator::SusRet);
                let region = self.mem.query_region(details.ret_on_stack).unwrap_or_default();
                let module = self.registry.find_module_containing(details.ret_on_stack);
                self.report_suspicious_addr(report, details.ret_on_stack, module, region);
            }
        }

        // a live stack the unwinder could not walk at all
        if details.call_stack.is_empty()
            && details.sp != 0
            && self
                .mem
                .query_region(details.sp)
                .is_some_and(|region| region.is_committed())
        {
            report.indicators.insert(ThSusIndicator::SusCallstackCorrupt);
        }
    }

    /// Step 8: threads of a managed process legitimately run through
    /// JIT-emitted pages; the shellcode indicator is withdrawn for them.
    pub(crate) fn filter_dotnet(&self, report: &mut ThreadScanReport) {
        if !self.is_managed {
            return;
        }
        let touches_runtime = report
            .c_details
            .call_stack
            .iter()
            .chain(core::iter::once(&report.c_details.ip))
            .filter_map(|&addr| self.registry.find_module_containing(addr))
            .any(|module| {
                let name = module.short_name();
                DOTNET_MODULES.contains(&name.as_str()) || name.starts_with("mscor")
            });
        if touches_runtime {
            report.c_details.is_managed = true;
            if report.indicators.remove(&ThSusIndicator::SusCallstackShc) {
                debug!("thread {}: shellcode indicator suppressed for managed thread", self.info.tid);
            }
        }
    }

    /// Step 7: name every address of interest. Debug symbols win over
    /// export names, which win over `module!+offset`.
    pub(crate) fn resolve_symbols(&self, report: &mut ThreadScanReport) {
        let mut addrs: BTreeSet<u64> = report.c_details.call_stack.iter().copied().collect();
        addrs.insert(report.c_details.ip);
        addrs.insert(report.c_details.last_ret);
        addrs.insert(report.c_details.ret_on_stack);
        addrs.remove(&0);

        for addr in addrs {
            if let Some(name) = self.resolve_addr_to_string(addr) {
                report.addr_to_symbol.insert(addr, name);
            }
        }

        report.last_syscall = self.resolve_last_syscall(report).unwrap_or_default();
        report.last_function = self.resolve_last_function(report).unwrap_or_default();
    }

    fn resolve_addr_to_string(&self, addr: u64) -> Option<String> {
        if let Some(symbol) = self.symbols.resolve(addr) {
            if !symbol.is_empty() {
                return Some(symbol);
            }
        }
        if let Some(funcs) = self.exports_map.find_exports_by_va(addr) {
            if let Some(func) = funcs.iter().next() {
                return Some(func.to_string());
            }
        }
        let module = self.registry.find_module_containing(addr)?;
        Some(format!("{}!+{:x}", module.short_name(), addr - module.base))
    }

    /// The blocked syscall this thread sits in: the symbol at the
    /// captured instruction pointer, when it lives in a low-level module
    /// and carries the Nt/Zw prefix.
    fn resolve_last_syscall(&self, report: &ThreadScanReport) -> Option<String> {
        let ip = report.c_details.ip;
        let module = self.registry.find_module_containing(ip)?;
        if !LOW_LEVEL_MODULES.contains(&module.short_name().as_str()) {
            return None;
        }
        let symbol = report.addr_to_symbol.get(&ip)?;
        let func = func_part(symbol);
        (func.starts_with("Nt") || func.starts_with("Zw")).then(|| String::from(func))
    }

    /// The innermost frame outside the low-level modules: the API call
    /// that issued the syscall.
    fn resolve_last_function(&self, report: &ThreadScanReport) -> Option<String> {
        for &ret in &report.c_details.call_stack {
            let Some(module) = self.registry.find_module_containing(ret) else {
                continue;
            };
            if LOW_LEVEL_MODULES.contains(&module.short_name().as_str()) {
                continue;
            }
            if let Some(symbol) = report.addr_to_symbol.get(&ret) {
                return Some(String::from(func_part(symbol)));
            }
        }
        None
    }

    /// Step 6: a waiting thread's resolved syscall and the API function
    /// above it should tell one story; divergence beyond the small
    /// allowlist is an indicator.
    pub(crate) fn check_calls_integrity(&self, report: &mut ThreadScanReport) {
        if !report.c_details.is_ret_as_syscall {
            return;
        }
        if report.last_syscall.is_empty() || report.last_function.is_empty() {
            return;
        }
        let core_name = report
            .last_syscall
            .trim_start_matches("Nt")
            .trim_start_matches("Zw")
            .to_ascii_lowercase();
        let func = report.last_function.to_ascii_lowercase();
        if func.contains(&core_name) || core_name.contains(&func) {
            return;
        }
        let allowlisted = SYSCALL_FUNC_ALLOWLIST
            .iter()
            .filter(|(syscall, _)| core_name.starts_with(syscall))
            .flat_map(|(_, funcs)| funcs.iter())
            .any(|accepted| func.contains(accepted));
        if !allowlisted {
            debug!(
                "thread {}: last syscall {} does not match last function {}",
                self.info.tid, report.last_syscall, report.last_function
            );
            report.indicators.insert(ThSusIndicator::SusCallsIntegrity);
        }
    }
}

/// The function part of a resolved symbol, stripping `module.` / `module!`
/// prefixes.
fn func_part(symbol: &str) -> &str {
    symbol
        .rsplit(|c| c == '.' || c == '!')
        .next()
        .unwrap_or(symbol)
}

#[cfg(windows)]
mod live {
    use core::{ffi::c_void, mem::size_of, ptr::null_mut};

    use kagami_win32::{
        dbghelp::{Address64, StackFrame64},
        ntdef::{
            ClientId,
            ObjectAttributes,
            SystemProcessInformation,
            SystemThreadInformation,
            Wow64Context,
            CONTEXT,
            CONTEXT_CONTROL,
            CONTEXT_INTEGER,
            HANDLE,
            IMAGE_FILE_MACHINE_AMD64,
            IMAGE_FILE_MACHINE_I386,
            SYSTEM_PROCESS_INFORMATION_CLASS,
            THREAD_GET_CONTEXT,
            THREAD_QUERY_INFORMATION,
            THREAD_QUERY_SET_WIN32_START_ADDRESS_CLASS,
            THREAD_SUSPEND_RESUME,
            WOW64_CONTEXT_CONTROL,
            WOW64_CONTEXT_INTEGER,
        },
        ntstatus::{NT_SUCCESS, STATUS_INFO_LENGTH_MISMATCH},
    };
    use log::debug;

    use super::{ThreadInfo, ThreadScanReport, ThreadScanner, MAX_FRAMES};
    use crate::{error::ScanError, process::ProcessMemory, sys::sys};

    struct HandleGuard(HANDLE);

    impl Drop for HandleGuard {
        fn drop(&mut self) {
            if let Ok(sys) = sys() {
                unsafe {
                    (sys.ntdll.nt_close)(self.0);
                }
            }
        }
    }

    /// Resumes the thread on drop, so no analysis path can leave the
    /// target suspended.
    struct SuspendGuard(HANDLE);

    impl SuspendGuard {
        fn suspend(handle: HANDLE) -> Result<Self, ScanError> {
            let sys = sys()?;
            let status = unsafe { (sys.ntdll.nt_suspend_thread)(handle, null_mut()) };
            if !NT_SUCCESS(status) {
                return Err(ScanError::ThreadAccess(0));
            }
            Ok(Self(handle))
        }
    }

    impl Drop for SuspendGuard {
        fn drop(&mut self) {
            if let Ok(sys) = sys() {
                unsafe {
                    (sys.ntdll.nt_resume_thread)(self.0, null_mut());
                }
            }
        }
    }

    impl<'a, M: ProcessMemory + ?Sized> ThreadScanner<'a, M> {
        pub(super) fn sample_context_live(
            &self,
            report: &mut ThreadScanReport,
        ) -> Result<(), ScanError> {
            let sys = sys()?;
            let mut handle: HANDLE = null_mut();
            let mut attributes = ObjectAttributes::new();
            let mut client_id = ClientId::from_tid(self.info.tid);
            let status = unsafe {
                (sys.ntdll.nt_open_thread)(
                    &mut handle,
                    THREAD_GET_CONTEXT | THREAD_SUSPEND_RESUME | THREAD_QUERY_INFORMATION,
                    &mut attributes,
                    &mut client_id,
                )
            };
            if !NT_SUCCESS(status) || handle.is_null() {
                return Err(ScanError::ThreadAccess(self.info.tid));
            }
            let handle = HandleGuard(handle);

            if report.start_address == 0 {
                let mut start: u64 = 0;
                let status = unsafe {
                    (sys.ntdll.nt_query_information_thread)(
                        handle.0,
                        THREAD_QUERY_SET_WIN32_START_ADDRESS_CLASS,
                        (&mut start as *mut u64).cast::<c_void>(),
                        size_of::<u64>() as u32,
                        null_mut(),
                    )
                };
                if NT_SUCCESS(status) {
                    report.start_address = start;
                }
            }

            // capture under suspension, resume before any expensive work
            if self.is_wow64 {
                let mut context = Wow64Context::default();
                context.ContextFlags = WOW64_CONTEXT_CONTROL | WOW64_CONTEXT_INTEGER;
                {
                    let _suspended = SuspendGuard::suspend(handle.0)?;
                    let ok = unsafe {
                        (sys.kernel32.wow64_get_thread_context)(
                            handle.0,
                            (&mut context as *mut Wow64Context).cast::<c_void>(),
                        )
                    };
                    if ok == 0 {
                        return Err(ScanError::ThreadAccess(self.info.tid));
                    }
                }
                report.c_details.ip = u64::from(context.Eip);
                report.c_details.sp = u64::from(context.Esp);
                report.c_details.bp = u64::from(context.Ebp);
            }
            else {
                let mut context = CONTEXT::default();
                context.ContextFlags = CONTEXT_CONTROL | CONTEXT_INTEGER;
                {
                    let _suspended = SuspendGuard::suspend(handle.0)?;
                    let status = unsafe {
                        (sys.ntdll.nt_get_context_thread)(
                            handle.0,
                            (&mut context as *mut CONTEXT).cast::<c_void>(),
                        )
                    };
                    if !NT_SUCCESS(status) {
                        return Err(ScanError::ThreadAccess(self.info.tid));
                    }
                }
                report.c_details.ip = context.Rip;
                report.c_details.sp = context.Rsp;
                report.c_details.bp = context.Rbp;
            }

            report.stack_ptr = report.c_details.sp;
            report.c_details.last_ret = self
                .mem
                .read_word(report.c_details.sp, !self.is_wow64)
                .unwrap_or(0);
            Ok(())
        }

        /// StackWalk64 over the captured context. Returns false when the
        /// walk produced no frames; non-monotonic stack pointers raise
        /// the corruption indicator directly.
        pub(super) fn fill_call_stack_walk(&self, report: &mut ThreadScanReport) -> bool {
            let Ok(sys) = sys() else {
                return false;
            };
            let mut handle: HANDLE = null_mut();
            let mut attributes = ObjectAttributes::new();
            let mut client_id = ClientId::from_tid(self.info.tid);
            let status = unsafe {
                (sys.ntdll.nt_open_thread)(
                    &mut handle,
                    THREAD_GET_CONTEXT | THREAD_QUERY_INFORMATION,
                    &mut attributes,
                    &mut client_id,
                )
            };
            if !NT_SUCCESS(status) || handle.is_null() {
                return false;
            }
            let handle = HandleGuard(handle);

            let details = &report.c_details;
            let mut frame = StackFrame64::default();
            frame.addr_pc = Address64 {
                offset: details.ip,
                ..Address64::default()
            };
            frame.addr_frame = Address64 {
                offset: details.bp,
                ..Address64::default()
            };
            frame.addr_stack = Address64 {
                offset: details.sp,
                ..Address64::default()
            };

            // StackWalk64 mutates the context it is given; feed it a scratch copy
            let mut context64 = CONTEXT::default();
            let mut context32 = Wow64Context::default();
            let (machine, context_ptr) = if self.is_wow64 {
                context32.ContextFlags = WOW64_CONTEXT_CONTROL | WOW64_CONTEXT_INTEGER;
                context32.Eip = details.ip as u32;
                context32.Esp = details.sp as u32;
                context32.Ebp = details.bp as u32;
                (
                    u32::from(IMAGE_FILE_MACHINE_I386),
                    (&mut context32 as *mut Wow64Context).cast::<c_void>(),
                )
            }
            else {
                context64.ContextFlags = CONTEXT_CONTROL | CONTEXT_INTEGER;
                context64.Rip = details.ip;
                context64.Rsp = details.sp;
                context64.Rbp = details.bp;
                (
                    u32::from(IMAGE_FILE_MACHINE_AMD64),
                    (&mut context64 as *mut CONTEXT).cast::<c_void>(),
                )
            };

            let mut frames = Vec::new();
            let mut last_sp = 0u64;
            let mut non_monotonic = false;
            for _ in 0 .. MAX_FRAMES {
                let ok = unsafe {
                    (sys.dbghelp.stack_walk_64)(
                        machine,
                        self.process_handle,
                        handle.0,
                        &mut frame,
                        context_ptr,
                        None,
                        Some(sys.dbghelp.sym_function_table_access_64),
                        Some(sys.dbghelp.sym_get_module_base_64),
                        None,
                    )
                };
                if ok == 0 || frame.addr_pc.offset == 0 {
                    break;
                }
                let ret = frame.addr_return.offset;
                if ret == 0 {
                    break;
                }
                if last_sp != 0 && frame.addr_stack.offset < last_sp {
                    non_monotonic = true;
                }
                last_sp = frame.addr_stack.offset;
                frames.push(ret);
            }

            if non_monotonic {
                debug!("thread {}: non-monotonic frame pointers", self.info.tid);
                report
                    .indicators
                    .insert(super::ThSusIndicator::SusCallstackCorrupt);
            }
            if frames.is_empty() {
                return false;
            }
            report.c_details.call_stack = frames;
            true
        }
    }

    /// Sample state, wait reason and wait time of every thread of `pid`
    /// from the system snapshot.
    pub fn collect_thread_info(pid: u32) -> Result<Vec<ThreadInfo>, ScanError> {
        let sys = sys()?;
        let mut buffer: Vec<u8> = vec![0u8; 0x40000];
        loop {
            let mut needed: u32 = 0;
            let status = unsafe {
                (sys.ntdll.nt_query_system_information)(
                    SYSTEM_PROCESS_INFORMATION_CLASS,
                    buffer.as_mut_ptr().cast::<c_void>(),
                    buffer.len() as u32,
                    &mut needed,
                )
            };
            if status == STATUS_INFO_LENGTH_MISMATCH {
                let grow = (needed as usize).max(buffer.len() * 2);
                buffer.resize(grow, 0);
                continue;
            }
            if !NT_SUCCESS(status) {
                return Err(ScanError::ThreadAccess(0));
            }
            break;
        }

        let mut threads = Vec::new();
        let mut offset = 0usize;
        loop {
            let Some(window) = buffer.get(offset ..) else {
                break;
            };
            if window.len() < size_of::<SystemProcessInformation>() {
                break;
            }
            // Safety: bounds checked above; the snapshot layout is
            // SystemProcessInformation records chained by next_entry_offset
            let entry: SystemProcessInformation =
                unsafe { core::ptr::read_unaligned(window.as_ptr().cast()) };
            if entry.unique_process_id as usize == pid as usize {
                let thread_base = offset + core::mem::offset_of!(SystemProcessInformation, threads);
                for index in 0 .. entry.number_of_threads as usize {
                    let thread_offset = thread_base + index * size_of::<SystemThreadInformation>();
                    let Some(bytes) = buffer.get(thread_offset ..) else {
                        break;
                    };
                    if bytes.len() < size_of::<SystemThreadInformation>() {
                        break;
                    }
                    // Safety: bounds checked above
                    let thread: SystemThreadInformation =
                        unsafe { core::ptr::read_unaligned(bytes.as_ptr().cast()) };
                    threads.push(ThreadInfo {
                        tid: thread.client_id.unique_thread as usize as u32,
                        start_address: thread.start_address as u64,
                        state: thread.thread_state,
                        wait_reason: thread.wait_reason,
                        wait_time: thread.wait_time,
                        is_extended: true,
                    });
                }
                break;
            }
            if entry.next_entry_offset == 0 {
                break;
            }
            offset += entry.next_entry_offset as usize;
        }
        Ok(threads)
    }
}

#[cfg(windows)]
pub use live::collect_thread_info;

#[cfg(test)]
mod tests {
    use core::ptr::null_mut;

    use kagami_win32::ntdef::{
        MEM_PRIVATE,
        PAGE_EXECUTE_READ,
        PAGE_EXECUTE_READWRITE,
        PAGE_READWRITE,
    };
    use mod_pe::ExportEntry;

    use super::*;
    use crate::{
        params::JsonDetail,
        process::testing::FakeMemory,
        symbols::{testing::FakeSymbols, NoSymbols},
    };

    const NTDLL_BASE: u64 = 0x7ffa_0000_0000;
    const USER32_BASE: u64 = 0x7ffd_0000_0000;
    const KERNELBASE_BASE: u64 = 0x7ffc_0000_0000;
    const CLR_BASE: u64 = 0x7ffe_0000_0000;
    const SHC_BASE: u64 = 0x5000_0000;
    const STACK_BASE: u64 = 0x9000_0000;

    /// Return address in ntdll right after an E8 rel32 call.
    const NTDLL_RET: u64 = NTDLL_BASE + 0x1505;
    /// Return address in user32 right after an FF 15 indirect call.
    const USER32_RET: u64 = USER32_BASE + 0x2006;
    /// Return address in kernelbase right after an FF D0 call.
    const KERNELBASE_RET: u64 = KERNELBASE_BASE + 0x3002;
    /// An address in ntdll with no call in front of it.
    const NTDLL_NOT_A_RET: u64 = NTDLL_BASE + 0x1c00;

    fn fixture() -> (FakeMemory, ModuleRegistry, ExportsMap) {
        let mut mem = FakeMemory::new();

        let mut ntdll_code = vec![0x90u8; 0x3000];
        ntdll_code[0x1500 .. 0x1505].copy_from_slice(&[0xe8, 0x10, 0x00, 0x00, 0x00]);
        mem.map(NTDLL_BASE, ntdll_code, PAGE_EXECUTE_READ, MEM_IMAGE);

        let mut user32_code = vec![0x90u8; 0x3000];
        user32_code[0x2000 .. 0x2006].copy_from_slice(&[0xff, 0x15, 0x44, 0x33, 0x22, 0x11]);
        mem.map(USER32_BASE, user32_code, PAGE_EXECUTE_READ, MEM_IMAGE);

        let mut kernelbase_code = vec![0x90u8; 0x4000];
        kernelbase_code[0x3000 .. 0x3002].copy_from_slice(&[0xff, 0xd0]);
        mem.map(KERNELBASE_BASE, kernelbase_code, PAGE_EXECUTE_READ, MEM_IMAGE);

        mem.map(CLR_BASE, vec![0x90u8; 0x1000], PAGE_EXECUTE_READ, MEM_IMAGE);
        mem.map(SHC_BASE, vec![0xccu8; 0x1000], PAGE_EXECUTE_READWRITE, MEM_PRIVATE);
        mem.map(STACK_BASE, vec![0u8; 0x1000], PAGE_READWRITE, MEM_PRIVATE);

        let mut registry = ModuleRegistry::new();
        for (base, size, path) in [
            (NTDLL_BASE, 0x3000, "C:\\Windows\\System32\\ntdll.dll"),
            (USER32_BASE, 0x3000, "C:\\Windows\\System32\\user32.dll"),
            (KERNELBASE_BASE, 0x4000, "C:\\Windows\\System32\\KernelBase.dll"),
            (CLR_BASE, 0x1000, "C:\\Windows\\Microsoft.NET\\Framework64\\v4.0\\clr.dll"),
        ] {
            registry.insert(ModuleDesc {
                base,
                size,
                path: String::from(path),
                is_suspicious: false,
                is_64: true,
            });
        }

        let mut exports_map = ExportsMap::new();
        exports_map.add_dll(
            NTDLL_BASE,
            "C:\\Windows\\System32\\ntdll.dll",
            0x3000,
            &[ExportEntry {
                ordinal: 1,
                rva: 0x2000,
                name: Some(String::from("NtClose")),
                forwarder: None,
            }],
        );
        exports_map.resolve_forwarders();

        (mem, registry, exports_map)
    }

    fn waiting_info(tid: u32) -> ThreadInfo {
        ThreadInfo {
            tid,
            start_address: NTDLL_BASE + 0x100,
            state: THREAD_STATE_WAITING,
            wait_reason: 6, // UserRequest
            wait_time: 100,
            is_extended: true,
        }
    }

    fn scanner<'a>(
        mem: &'a FakeMemory,
        info: &'a ThreadInfo,
        registry: &'a ModuleRegistry,
        exports_map: &'a ExportsMap,
        symbols: &'a dyn SymbolResolver,
        params: &'a ScanParams,
    ) -> ThreadScanner<'a, FakeMemory> {
        ThreadScanner::new(mem, null_mut(), info, registry, exports_map, symbols, params, false)
    }

    fn base_report(info: &ThreadInfo) -> ThreadScanReport {
        let mut report = ThreadScanReport::new(info.tid);
        report.thread_state = info.state;
        report.thread_wait_reason = info.wait_reason;
        report.start_address = info.start_address;
        report.stack_ptr = STACK_BASE + 0x800;
        report.c_details.sp = STACK_BASE + 0x800;
        report.c_details.is_ret_as_syscall = true;
        report
    }

    #[test]
    fn state_and_wait_reason_translations() {
        assert_eq!(translate_thread_state(THREAD_STATE_WAITING), "Waiting");
        assert_eq!(translate_thread_state(2), "Running");
        assert_eq!(translate_thread_state(77), "(77)");
        assert_eq!(translate_wait_reason(6), "UserRequest");
        assert_eq!(translate_wait_reason(11), "WrDelayExecution");
        assert_eq!(translate_wait_reason(99), "(99)");
    }

    #[test]
    fn indicator_names_round_trip() {
        for indicator in [
            ThSusIndicator::SusStart,
            ThSusIndicator::SusIp,
            ThSusIndicator::SusRet,
            ThSusIndicator::SusCallstackShc,
            ThSusIndicator::SusCallsIntegrity,
            ThSusIndicator::SusCallstackCorrupt,
        ] {
            assert_eq!(ThSusIndicator::from_name(indicator.as_str()), Some(indicator));
        }
        assert_eq!(ThSusIndicator::from_name("NONE"), None);
    }

    #[test]
    fn entropy_of_uniform_and_degenerate_buffers() {
        assert_eq!(shannon_entropy(&[]), 0.0);
        assert_eq!(shannon_entropy(&[7u8; 256]), 0.0);
        let two_symbols: Vec<u8> = (0 .. 64).map(|i| (i % 2) as u8).collect();
        assert!((shannon_entropy(&two_symbols) - 1.0).abs() < 1e-9);
        let all_bytes: Vec<u8> = (0 ..= 255u8).collect();
        assert!((shannon_entropy(&all_bytes) - 8.0).abs() < 1e-9);
    }

    #[test]
    fn call_opcode_forms_are_recognized() {
        let (mem, ..) = fixture();
        // E8 rel32
        assert!(is_preceded_by_call(&mem, NTDLL_RET));
        // FF 15 disp32
        assert!(is_preceded_by_call(&mem, USER32_RET));
        // FF D0
        assert!(is_preceded_by_call(&mem, KERNELBASE_RET));
        // plain nop sled
        assert!(!is_preceded_by_call(&mem, NTDLL_NOT_A_RET));
        // unreadable memory
        assert!(!is_preceded_by_call(&mem, 0x1234));
    }

    #[test]
    fn fallback_scan_keeps_only_executable_targets() {
        let (mut mem, registry, exports_map) = fixture();
        let sp = STACK_BASE + 0x100;
        mem.write(sp, &0x12u64.to_le_bytes()); // garbage, not mapped
        mem.write(sp + 8, &NTDLL_RET.to_le_bytes()); // executable
        mem.write(sp + 16, &(STACK_BASE + 0x10).to_le_bytes()); // mapped, not executable
        mem.write(sp + 24, &0u64.to_le_bytes());
        mem.write(sp + 32, &(SHC_BASE + 0x10).to_le_bytes()); // executable

        let info = waiting_info(1);
        let params = ScanParams::default();
        let scanner = scanner(&mem, &info, &registry, &exports_map, &NoSymbols, &params);
        let frames = scanner.fallback_stack_scan(sp);
        assert_eq!(frames, vec![NTDLL_RET, SHC_BASE + 0x10]);
    }

    #[test]
    fn ip_in_rwx_private_region_raises_sus_ip_only() {
        let (mem, registry, exports_map) = fixture();
        let info = waiting_info(2);
        let params = ScanParams::default();
        let scanner = scanner(&mem, &info, &registry, &exports_map, &NoSymbols, &params);

        let mut report = base_report(&info);
        report.start_address = 0;
        report.c_details.ip = SHC_BASE + 0x10;
        report.c_details.call_stack = vec![NTDLL_RET];
        report.c_details.ret_on_stack = NTDLL_RET;
        scanner.classify(&mut report);

        assert_eq!(
            report.indicators.iter().copied().collect::<Vec<_>>(),
            vec![ThSusIndicator::SusIp]
        );
        assert_eq!(report.susp_addr, SHC_BASE + 0x10);
        assert!(report.stats.is_some());

        let json = report.to_json(JsonDetail::Basic);
        let body = &json["thread_scan"];
        assert_eq!(body["indicators"][0], "SUS_IP");
        // no module at the address: the report uses susp_return_addr
        assert_eq!(
            body["susp_return_addr"],
            format!("{:x}", SHC_BASE + 0x10)
        );
        assert!(body["susp_addr"].is_null());
        assert_eq!(body["protection"], "40");
    }

    #[test]
    fn shellcode_frame_raises_shc_and_forces_frames_into_json() {
        let (mem, registry, exports_map) = fixture();
        let info = waiting_info(3);
        let params = ScanParams::default();
        let scanner = scanner(&mem, &info, &registry, &exports_map, &NoSymbols, &params);

        let mut report = base_report(&info);
        report.c_details.ip = NTDLL_BASE + 0x1800;
        report.c_details.call_stack = vec![SHC_BASE + 0x20, USER32_RET];
        report.c_details.ret_on_stack = NTDLL_RET;
        scanner.classify(&mut report);

        assert!(report.indicators.contains(&ThSusIndicator::SusCallstackShc));
        assert!(report.shc_candidates.contains(&(SHC_BASE + 0x20)));

        // frames must appear even at the basic detail level
        let json = report.to_json(JsonDetail::Basic);
        let frames = json["thread_scan"]["thread_info"]["callstack"]["frames"]
            .as_array()
            .unwrap();
        // outermost-first: the user32 frame leads, the shellcode frame ends
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], format!("{:x}", USER32_RET));
        assert_eq!(frames[1], format!("{:x}", SHC_BASE + 0x20));
    }

    #[test]
    fn ret_not_after_call_raises_sus_ret_for_waiting_thread() {
        let (mem, registry, exports_map) = fixture();
        let info = waiting_info(4);
        let params = ScanParams::default();
        let scanner = scanner(&mem, &info, &registry, &exports_map, &NoSymbols, &params);

        let mut report = base_report(&info);
        report.c_details.ip = NTDLL_BASE + 0x1800;
        report.c_details.call_stack = vec![NTDLL_RET];
        report.c_details.ret_on_stack = NTDLL_NOT_A_RET;
        scanner.classify(&mut report);

        assert!(report.indicators.contains(&ThSusIndicator::SusRet));
        assert!(!report.c_details.is_ret_in_frame);

        // the same shape on a running thread is not an indicator
        let mut report = base_report(&info);
        report.c_details.is_ret_as_syscall = false;
        report.c_details.ip = NTDLL_BASE + 0x1800;
        report.c_details.call_stack = vec![NTDLL_RET];
        report.c_details.ret_on_stack = NTDLL_NOT_A_RET;
        scanner.classify(&mut report);
        assert!(!report.indicators.contains(&ThSusIndicator::SusRet));
    }

    #[test]
    fn unwalkable_live_stack_is_corrupt() {
        let (mem, registry, exports_map) = fixture();
        let info = waiting_info(5);
        let params = ScanParams::default();
        let scanner = scanner(&mem, &info, &registry, &exports_map, &NoSymbols, &params);

        let mut report = base_report(&info);
        report.c_details.ip = NTDLL_BASE + 0x1800;
        scanner.classify(&mut report);
        assert!(report.indicators.contains(&ThSusIndicator::SusCallstackCorrupt));
    }

    #[test]
    fn managed_thread_suppresses_shellcode_indicator() {
        let (mem, registry, exports_map) = fixture();
        let info = waiting_info(6);
        let params = ScanParams {
            is_managed: true,
            ..ScanParams::default()
        };
        let scanner = scanner(&mem, &info, &registry, &exports_map, &NoSymbols, &params);

        let mut report = base_report(&info);
        report.c_details.ip = NTDLL_BASE + 0x1800;
        report.c_details.call_stack = vec![SHC_BASE + 0x20, CLR_BASE + 0x100];
        scanner.classify(&mut report);
        assert!(report.indicators.contains(&ThSusIndicator::SusCallstackShc));

        scanner.filter_dotnet(&mut report);
        assert!(report.c_details.is_managed);
        assert!(!report.indicators.contains(&ThSusIndicator::SusCallstackShc));
        // the candidate list itself stays, for the record
        assert!(report.shc_candidates.contains(&(SHC_BASE + 0x20)));
    }

    #[test]
    fn symbol_preference_debug_then_export_then_offset() {
        let (mem, registry, exports_map) = fixture();
        let info = waiting_info(7);
        let params = ScanParams::default();
        let mut symbols = FakeSymbols::default();
        symbols
            .table
            .insert(NTDLL_BASE + 0x1800, String::from("NtWaitForSingleObject"));
        let scanner = scanner(&mem, &info, &registry, &exports_map, &symbols, &params);

        let mut report = base_report(&info);
        report.c_details.ip = NTDLL_BASE + 0x1800; // debug symbol
        report.c_details.last_ret = NTDLL_BASE + 0x2000; // export: NtClose
        report.c_details.ret_on_stack = NTDLL_BASE + 0x2345; // neither
        scanner.resolve_symbols(&mut report);

        assert_eq!(
            report.addr_to_symbol.get(&(NTDLL_BASE + 0x1800)).unwrap(),
            "NtWaitForSingleObject"
        );
        assert_eq!(
            report.addr_to_symbol.get(&(NTDLL_BASE + 0x2000)).unwrap(),
            "ntdll.NtClose"
        );
        assert_eq!(
            report.addr_to_symbol.get(&(NTDLL_BASE + 0x2345)).unwrap(),
            "ntdll!+2345"
        );
    }

    #[test]
    fn calls_integrity_flags_divergent_wait() {
        let (mem, registry, exports_map) = fixture();
        let info = waiting_info(8);
        let params = ScanParams::default();
        let mut symbols = FakeSymbols::default();
        symbols
            .table
            .insert(NTDLL_BASE + 0x1800, String::from("NtWaitForSingleObject"));
        symbols.table.insert(USER32_RET, String::from("MessageBoxA"));
        let scanner = scanner(&mem, &info, &registry, &exports_map, &symbols, &params);

        let mut report = base_report(&info);
        report.c_details.ip = NTDLL_BASE + 0x1800;
        report.c_details.call_stack = vec![NTDLL_RET, USER32_RET];
        scanner.resolve_symbols(&mut report);
        assert_eq!(report.last_syscall, "NtWaitForSingleObject");
        assert_eq!(report.last_function, "MessageBoxA");

        scanner.check_calls_integrity(&mut report);
        assert!(report.indicators.contains(&ThSusIndicator::SusCallsIntegrity));
    }

    #[test]
    fn calls_integrity_accepts_matching_and_allowlisted_pairs() {
        let (mem, registry, exports_map) = fixture();
        let info = waiting_info(9);
        let params = ScanParams::default();

        // NtWaitForSingleObject under WaitForSingleObjectEx: name overlap
        let mut symbols = FakeSymbols::default();
        symbols
            .table
            .insert(NTDLL_BASE + 0x1800, String::from("NtWaitForSingleObject"));
        symbols
            .table
            .insert(KERNELBASE_RET, String::from("WaitForSingleObjectEx"));
        let scanner_a = scanner(&mem, &info, &registry, &exports_map, &symbols, &params);
        let mut report = base_report(&info);
        report.c_details.ip = NTDLL_BASE + 0x1800;
        report.c_details.call_stack = vec![NTDLL_RET, KERNELBASE_RET];
        scanner_a.resolve_symbols(&mut report);
        scanner_a.check_calls_integrity(&mut report);
        assert!(!report.indicators.contains(&ThSusIndicator::SusCallsIntegrity));

        // NtDelayExecution under SleepEx: allowlisted
        let mut symbols = FakeSymbols::default();
        symbols
            .table
            .insert(NTDLL_BASE + 0x1800, String::from("NtDelayExecution"));
        symbols.table.insert(KERNELBASE_RET, String::from("SleepEx"));
        let scanner_b = scanner(&mem, &info, &registry, &exports_map, &symbols, &params);
        let mut report = base_report(&info);
        report.c_details.ip = NTDLL_BASE + 0x1800;
        report.c_details.call_stack = vec![NTDLL_RET, KERNELBASE_RET];
        scanner_b.resolve_symbols(&mut report);
        scanner_b.check_calls_integrity(&mut report);
        assert!(!report.indicators.contains(&ThSusIndicator::SusCallsIntegrity));
    }

    #[test]
    fn json_detail_gates_frames_and_last_call_fields() {
        let info = waiting_info(10);
        let mut report = base_report(&info);
        report.c_details.call_stack = vec![NTDLL_RET, USER32_RET];
        report.last_syscall = String::from("NtWaitForSingleObject");
        report.last_function = String::from("WaitForSingleObjectEx");

        let basic = report.to_json(JsonDetail::Basic);
        let info_json = &basic["thread_scan"]["thread_info"];
        assert!(info_json["callstack"]["frames"].is_null());
        assert_eq!(info_json["callstack"]["frames_count"], 2);
        assert!(info_json["last_sysc"].is_null());
        assert_eq!(info_json["state"], "Waiting");
        assert_eq!(info_json["wait_reason"], "UserRequest");

        let details = report.to_json(JsonDetail::Details);
        let info_json = &details["thread_scan"]["thread_info"];
        assert!(info_json["frames"].is_null());
        assert_eq!(
            info_json["callstack"]["frames"].as_array().unwrap().len(),
            2
        );
        assert_eq!(info_json["last_sysc"], "NtWaitForSingleObject");
        assert_eq!(info_json["last_func"], "WaitForSingleObjectEx");
    }

    #[test]
    fn report_round_trips_indicators_and_addresses() {
        let info = waiting_info(11);
        let mut report = base_report(&info);
        report.susp_addr = SHC_BASE + 0x10;
        report.protection = PAGE_EXECUTE_READWRITE;
        report.indicators.insert(ThSusIndicator::SusIp);
        report.indicators.insert(ThSusIndicator::SusCallstackShc);

        let text = serde_json::to_string(&report.to_json(JsonDetail::Basic)).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        let body = &parsed["thread_scan"];

        let round_tripped: std::collections::BTreeSet<ThSusIndicator> = body["indicators"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| ThSusIndicator::from_name(v.as_str().unwrap()).unwrap())
            .collect();
        assert_eq!(round_tripped, report.indicators);

        let addr = u64::from_str_radix(body["susp_return_addr"].as_str().unwrap(), 16).unwrap();
        assert_eq!(addr, report.susp_addr);
    }

    #[cfg(not(windows))]
    #[test]
    fn live_scan_errors_off_windows() {
        let (mem, registry, exports_map) = fixture();
        let info = waiting_info(12);
        let params = ScanParams::default();
        let scanner = scanner(&mem, &info, &registry, &exports_map, &NoSymbols, &params);
        let report = scanner.scan_remote();
        assert_eq!(report.status, ScanStatus::Error);
        assert!(report.indicators.is_empty());
    }
}
