//! Userspace platform backend.
//!
//! Implements the kernel capabilities on a normal Linux process so the whole
//! interception layer can run outside the kernel:
//! - dispatch tables live in anonymous `mmap` pages that really are read-only
//!   until a patch window opens them with `mprotect`
//! - symbol probes are an in-memory registry that tests fire by hand
//! - detached tasks are named `std::thread`s
//! - files, user buffers and iovecs are plain byte vectors
//!
//! Page protection acts on whole pages, so only tables allocated with
//! [`HostTable`] may be patched through a [`HostPlatform`].

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use memmap2::{MmapMut, MmapOptions};

use crate::dispatch::CallFrame;
use crate::patch::{DispatchTable, TableKind};
use crate::read_proxy::{CopyFault, FileOperations, IovIter, OpenFile, UserBuffer};
use crate::platform::{
    KernelVersion, PageProtection, Platform, PlatformCaps, Preemption, ProbeHandler, SymbolProbes,
    Task, TaskSpawner,
};

/// Base of the fake kernel text addresses handed out for probed symbols
const SYMBOL_BASE: usize = 0xffff_ffc0_0810_0000;

fn host_page_size() -> usize {
    let ps = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if ps > 0 {
        ps as usize
    } else {
        4096
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Something the platform was asked to do, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEvent {
    PreemptDisable,
    PreemptEnable,
    UnmapAliases,
    SetRw(usize),
    SetRo(usize),
    FlushTlb(usize, usize),
    ProbeRegistered(&'static str),
    ProbeUnregistered(&'static str),
    Spawned(&'static str),
}

/// A dispatch table backed by its own read-only anonymous mapping.
pub struct HostTable {
    _map: MmapMut,
    table: DispatchTable,
}

impl HostTable {
    /// Map `len` slots all pointing at `fill`, then seal the pages read-only.
    pub fn new(kind: TableKind, len: usize, fill: usize) -> io::Result<Self> {
        let page_size = host_page_size();
        let bytes = (len.max(1) * std::mem::size_of::<usize>()).div_ceil(page_size) * page_size;

        let mut map = MmapOptions::new().len(bytes).map_anon()?;
        let base = map.as_mut_ptr() as *mut usize;
        for i in 0..len {
            // Safety: the mapping holds at least `len` slots
            unsafe { base.add(i).write(fill) };
        }

        let ret = unsafe { libc::mprotect(base as *mut libc::c_void, bytes, libc::PROT_READ) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }

        // Safety: the mapping is owned by the returned value
        let table = unsafe { DispatchTable::from_raw_parts(kind, base, len) }
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "null mapping"))?;
        Ok(Self { _map: map, table })
    }

    /// The table view. Only valid while `self` is alive.
    pub fn table(&self) -> DispatchTable {
        self.table
    }
}

struct HostProbe {
    addr: usize,
    handler: ProbeHandler,
}

pub struct HostPlatform {
    caps: PlatformCaps,
    page_size: usize,
    symbols: HashMap<&'static str, usize>,
    probes: Mutex<HashMap<&'static str, HostProbe>>,
    events: Mutex<Vec<PlatformEvent>>,
    preempt_depth: AtomicIsize,
    fail_spawns: AtomicBool,
    spawned: AtomicUsize,
}

impl HostPlatform {
    pub fn new(kernel: KernelVersion) -> Self {
        Self {
            caps: PlatformCaps::new(kernel),
            page_size: host_page_size(),
            symbols: HashMap::new(),
            probes: Mutex::new(HashMap::new()),
            events: Mutex::new(Vec::new()),
            preempt_depth: AtomicIsize::new(0),
            fail_spawns: AtomicBool::new(false),
            spawned: AtomicUsize::new(0),
        }
    }

    /// Enable probes and make `symbols` resolvable.
    pub fn with_symbols(mut self, symbols: &[&'static str]) -> Self {
        self.caps.probes = true;
        for (i, sym) in symbols.iter().enumerate() {
            self.symbols.insert(*sym, SYMBOL_BASE + i * 0x100);
        }
        self
    }

    pub fn with_tables(mut self, native: Option<&HostTable>, compat: Option<&HostTable>) -> Self {
        self.caps.syscall_table = native.map(HostTable::table);
        self.caps.compat_syscall_table = compat.map(HostTable::table);
        self
    }

    /// Run the pre-handler attached at `symbol`, as the kernel would on entry.
    pub fn fire(&self, symbol: &str, frame: &mut CallFrame) -> Option<i32> {
        let handler = lock(&self.probes).get(symbol).map(|p| p.handler.clone())?;
        Some(handler(frame))
    }

    pub fn is_probed(&self, symbol: &str) -> bool {
        lock(&self.probes).contains_key(symbol)
    }

    pub fn events(&self) -> Vec<PlatformEvent> {
        lock(&self.events).clone()
    }

    pub fn clear_events(&self) {
        lock(&self.events).clear();
    }

    pub fn preempt_depth(&self) -> isize {
        self.preempt_depth.load(Ordering::SeqCst)
    }

    /// Make every following spawn fail as if the kernel were out of tasks.
    pub fn fail_spawns(&self, fail: bool) {
        self.fail_spawns.store(fail, Ordering::SeqCst);
    }

    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    fn record(&self, event: PlatformEvent) {
        lock(&self.events).push(event);
    }

    fn mprotect(&self, addr: usize, pages: usize, prot: libc::c_int) -> i32 {
        let len = pages * self.page_size;
        let ret = unsafe { libc::mprotect(addr as *mut libc::c_void, len, prot) };
        if ret == 0 {
            0
        } else {
            -io::Error::last_os_error().raw_os_error().unwrap_or(libc::EINVAL)
        }
    }
}

impl PageProtection for HostPlatform {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn unmap_aliases(&self) {
        self.record(PlatformEvent::UnmapAliases);
    }

    fn set_memory_rw(&self, addr: usize, pages: usize) -> i32 {
        self.record(PlatformEvent::SetRw(addr));
        self.mprotect(addr, pages, libc::PROT_READ | libc::PROT_WRITE)
    }

    fn set_memory_ro(&self, addr: usize, pages: usize) -> i32 {
        self.record(PlatformEvent::SetRo(addr));
        self.mprotect(addr, pages, libc::PROT_READ)
    }

    fn flush_tlb_range(&self, start: usize, end: usize) {
        self.record(PlatformEvent::FlushTlb(start, end));
    }
}

impl Preemption for HostPlatform {
    fn preempt_disable(&self) {
        self.preempt_depth.fetch_add(1, Ordering::SeqCst);
        self.record(PlatformEvent::PreemptDisable);
    }

    fn preempt_enable(&self) {
        self.preempt_depth.fetch_sub(1, Ordering::SeqCst);
        self.record(PlatformEvent::PreemptEnable);
    }
}

impl SymbolProbes for HostPlatform {
    fn register_probe(&self, symbol: &'static str, handler: ProbeHandler) -> Result<usize, i32> {
        if !self.caps.probes {
            return Err(-libc::ENOSYS);
        }
        let addr = *self.symbols.get(symbol).ok_or(-libc::ENOENT)?;

        let mut probes = lock(&self.probes);
        if probes.contains_key(symbol) {
            return Err(-libc::EBUSY);
        }
        probes.insert(symbol, HostProbe { addr, handler });
        drop(probes);

        self.record(PlatformEvent::ProbeRegistered(symbol));
        Ok(addr)
    }

    fn unregister_probe(&self, symbol: &'static str, addr: usize) {
        let mut probes = lock(&self.probes);
        if probes.get(symbol).is_some_and(|p| p.addr == addr) {
            probes.remove(symbol);
        }
        drop(probes);
        self.record(PlatformEvent::ProbeUnregistered(symbol));
    }
}

impl TaskSpawner for HostPlatform {
    fn spawn(&self, name: &'static str, task: Task) -> io::Result<()> {
        if self.fail_spawns.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::OutOfMemory, "task spawn refused"));
        }
        // Dropping the handle detaches the thread
        std::thread::Builder::new().name(name.to_string()).spawn(task)?;
        self.spawned.fetch_add(1, Ordering::SeqCst);
        self.record(PlatformEvent::Spawned(name));
        Ok(())
    }
}

impl Platform for HostPlatform {
    fn caps(&self) -> &PlatformCaps {
        &self.caps
    }
}

/// File content served from memory.
pub struct MemoryFileOps {
    content: Vec<u8>,
    read: bool,
    read_iter: bool,
}

impl MemoryFileOps {
    /// Supports both read conventions.
    pub fn new(content: &[u8]) -> Self {
        Self {
            content: content.to_vec(),
            read: true,
            read_iter: true,
        }
    }

    pub fn read_only(content: &[u8]) -> Self {
        Self {
            read_iter: false,
            ..Self::new(content)
        }
    }

    pub fn iter_only(content: &[u8]) -> Self {
        Self {
            read: false,
            ..Self::new(content)
        }
    }

    fn rest(&self, pos: u64) -> &[u8] {
        let start = usize::try_from(pos).unwrap_or(usize::MAX).min(self.content.len());
        &self.content[start..]
    }
}

impl FileOperations for MemoryFileOps {
    fn has_read(&self) -> bool {
        self.read
    }

    fn read(&self, _file: &OpenFile, buf: &mut dyn UserBuffer, pos: &mut u64) -> isize {
        let rest = self.rest(*pos);
        let n = rest.len().min(buf.len());
        if n == 0 {
            return 0;
        }
        if buf.copy_to_user(0, &rest[..n]).is_err() {
            return -(libc::EFAULT as isize);
        }
        *pos += n as u64;
        n as isize
    }

    fn has_read_iter(&self) -> bool {
        self.read_iter
    }

    fn read_iter(&self, _file: &OpenFile, pos: &mut u64, to: &mut dyn IovIter) -> isize {
        let n = to.copy_to_iter(self.rest(*pos));
        *pos += n as u64;
        n as isize
    }
}

/// A user buffer of fixed capacity. Only the bytes written by the last
/// successful copy are kept.
#[derive(Debug)]
pub struct HostBuffer {
    data: Vec<u8>,
    filled: usize,
    fault: bool,
}

impl HostBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            filled: 0,
            fault: false,
        }
    }

    /// Every copy into this buffer faults.
    pub fn faulting(capacity: usize) -> Self {
        Self {
            fault: true,
            ..Self::new(capacity)
        }
    }

    pub fn filled(&self) -> &[u8] {
        &self.data[..self.filled]
    }
}

impl UserBuffer for HostBuffer {
    fn len(&self) -> usize {
        self.data.len()
    }

    fn copy_to_user(&mut self, offset: usize, src: &[u8]) -> Result<(), CopyFault> {
        let end = offset.checked_add(src.len()).ok_or(CopyFault)?;
        if self.fault || end > self.data.len() {
            return Err(CopyFault);
        }
        self.data[offset..end].copy_from_slice(src);
        self.filled = end;
        Ok(())
    }
}

/// An iovec that takes at most `capacity` more bytes.
#[derive(Debug, Default)]
pub struct HostIovIter {
    data: Vec<u8>,
    capacity: usize,
}

impl HostIovIter {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl IovIter for HostIovIter {
    fn count(&self) -> usize {
        self.capacity - self.data.len()
    }

    fn copy_to_iter(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.count());
        self.data.extend_from_slice(&src[..n]);
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_host_table_is_sealed_read_only() {
        let table = HostTable::new(TableKind::Compat, 400, 0xdead).unwrap();
        let dt = table.table();
        assert_eq!(dt.len(), 400);
        assert_eq!(dt.read(0).unwrap().addr(), 0xdead);
        assert_eq!(dt.read(399).unwrap().addr(), 0xdead);
        assert_eq!(dt.base_addr() % host_page_size(), 0);
    }

    #[test]
    fn test_probe_lifecycle() {
        let platform =
            HostPlatform::new(KernelVersion::new(5, 4, 0)).with_symbols(&["input_event"]);
        let handler: ProbeHandler = Arc::new(|frame: &mut CallFrame| {
            frame.set_arg(0, 99);
            0
        });

        let addr = platform.register_probe("input_event", handler.clone()).unwrap();
        assert_eq!(platform.register_probe("input_event", handler.clone()), Err(-libc::EBUSY));
        assert_eq!(platform.register_probe("nope", handler), Err(-libc::ENOENT));

        let mut frame = CallFrame::default();
        assert_eq!(platform.fire("input_event", &mut frame), Some(0));
        assert_eq!(frame.arg(0), 99);

        platform.unregister_probe("input_event", addr);
        assert!(!platform.is_probed("input_event"));
        assert_eq!(platform.fire("input_event", &mut frame), None);
    }

    #[test]
    fn test_probes_unavailable() {
        let platform = HostPlatform::new(KernelVersion::new(3, 10, 0));
        let handler: ProbeHandler = Arc::new(|_: &mut CallFrame| 0);
        assert_eq!(platform.register_probe("input_event", handler), Err(-libc::ENOSYS));
    }

    #[test]
    fn test_spawn_failure_is_reported() {
        let platform = HostPlatform::new(KernelVersion::new(5, 4, 0));
        platform.fail_spawns(true);
        assert!(platform.spawn("kp_unregister", Box::new(|| {})).is_err());
        assert_eq!(platform.spawned(), 0);
    }
}
