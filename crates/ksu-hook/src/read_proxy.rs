//! init.rc read injection
//!
//! When `init` first reads `/system/etc/init/hw/init.rc`, the file's read
//! operations are swapped for a proxy. The proxy passes the real content
//! through untouched and, once the real file reports end-of-stream, appends
//! [`KERNEL_SU_RC`] across as many reads as the caller needs.
//!
//! Phases, process-wide:
//!
//! ```text
//! Unmatched -> Proxying -> Draining -> Drained
//! ```
//!
//! The installation latch is taken at most once. A later matching read only
//! switches the hook off; the proxied file keeps its proxy.
//!
//! The cursor assumes a single reader (init) and is not guarded beyond
//! atomicity of each update.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Process that gets the injection
pub const TARGET_COMM: &str = "init";
/// File that gets the injection
pub const TARGET_PATH: &str = "/system/etc/init/hw/init.rc";
pub const TARGET_NAME: &str = "init.rc";

/// Appended to init.rc. Starts ksud at each boot stage in the su domain.
pub const KERNEL_SU_RC: &str = "\n\
on post-fs-data\n    \
start logd\n    \
exec u:r:su:s0 root -- /data/adb/ksud post-fs-data\n\
\n\
on nonencrypted\n    \
exec u:r:su:s0 root -- /data/adb/ksud services\n\
\n\
on property:vold.decrypt=trigger_restart_framework\n    \
exec u:r:su:s0 root -- /data/adb/ksud services\n\
\n\
on property:sys.boot_completed=1\n    \
exec u:r:su:s0 root -- /data/adb/ksud boot-completed\n\
\n\
\n";

const EINVAL: isize = -(libc::EINVAL as isize);

/// A user-space copy hit an unmapped or read-only page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("copy to user space faulted")]
pub struct CopyFault;

/// Contiguous destination of a `read` call.
pub trait UserBuffer {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy all of `src` to `offset`. Either everything lands or nothing does.
    fn copy_to_user(&mut self, offset: usize, src: &[u8]) -> Result<(), CopyFault>;
}

/// Scatter-gather destination of a `read_iter` call.
pub trait IovIter {
    /// Bytes the iterator can still take.
    fn count(&self) -> usize;

    /// Copy as much of `src` as fits; returns the number of bytes taken.
    fn copy_to_iter(&mut self, src: &[u8]) -> usize;
}

/// The read half of a file's operation table. A file may support either
/// convention, both, or neither.
pub trait FileOperations: Send + Sync {
    fn has_read(&self) -> bool;

    fn read(&self, file: &OpenFile, buf: &mut dyn UserBuffer, pos: &mut u64) -> isize;

    fn has_read_iter(&self) -> bool;

    fn read_iter(&self, file: &OpenFile, pos: &mut u64, to: &mut dyn IovIter) -> isize;
}

/// An open file whose operation table may be replaced while it is open.
pub struct OpenFile {
    path: String,
    regular: bool,
    ops: RwLock<Arc<dyn FileOperations>>,
}

impl OpenFile {
    pub fn new(path: impl Into<String>, regular: bool, ops: Arc<dyn FileOperations>) -> Self {
        Self {
            path: path.into(),
            regular,
            ops: RwLock::new(ops),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Final path component.
    pub fn name(&self) -> &str {
        Path::new(&self.path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("")
    }

    pub fn is_regular(&self) -> bool {
        self.regular
    }

    pub fn ops(&self) -> Arc<dyn FileOperations> {
        self.ops
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn replace_ops(&self, ops: Arc<dyn FileOperations>) {
        *self.ops.write().unwrap_or_else(PoisonError::into_inner) = ops;
    }

    /// Read through whatever operations the file currently has.
    pub fn read(&self, buf: &mut dyn UserBuffer, pos: &mut u64) -> isize {
        let ops = self.ops();
        if !ops.has_read() {
            return EINVAL;
        }
        ops.read(self, buf, pos)
    }

    pub fn read_iter(&self, pos: &mut u64, to: &mut dyn IovIter) -> isize {
        let ops = self.ops();
        if !ops.has_read_iter() {
            return EINVAL;
        }
        ops.read_iter(self, pos, to)
    }
}

impl std::fmt::Debug for OpenFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenFile")
            .field("path", &self.path)
            .field("regular", &self.regular)
            .finish()
    }
}

/// Descriptor lookup used by the `read(fd, ..)` entry point.
pub trait FdTable {
    fn get(&self, fd: u32) -> Option<Arc<OpenFile>>;
}

impl FdTable for HashMap<u32, Arc<OpenFile>> {
    fn get(&self, fd: u32) -> Option<Arc<OpenFile>> {
        HashMap::get(self, &fd).cloned()
    }
}

/// Where the injection is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPhase {
    /// Target not seen yet
    Unmatched,
    /// Proxy installed, real content still flowing
    Proxying,
    /// Part of the payload delivered
    Draining,
    Drained,
}

/// The payload and how much of it has been delivered.
#[derive(Debug)]
pub struct InjectionStream {
    payload: &'static [u8],
    cursor: AtomicUsize,
    installed: AtomicBool,
}

impl InjectionStream {
    pub const fn new(payload: &'static [u8]) -> Self {
        Self {
            payload,
            cursor: AtomicUsize::new(0),
            installed: AtomicBool::new(false),
        }
    }

    pub fn payload(&self) -> &'static [u8] {
        self.payload
    }

    pub fn cursor(&self) -> usize {
        self.cursor.load(Ordering::Acquire)
    }

    pub fn remaining(&self) -> usize {
        self.payload.len() - self.cursor()
    }

    /// Take the installation latch. True only for the first caller.
    pub fn latch(&self) -> bool {
        !self.installed.swap(true, Ordering::AcqRel)
    }

    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::Acquire)
    }

    /// Started appending but not finished.
    pub fn is_draining(&self) -> bool {
        let c = self.cursor();
        c != 0 && c < self.payload.len()
    }

    pub fn is_drained(&self) -> bool {
        self.cursor() >= self.payload.len()
    }

    pub fn phase(&self) -> ReadPhase {
        match self.cursor() {
            _ if !self.is_installed() => ReadPhase::Unmatched,
            0 => ReadPhase::Proxying,
            c if c < self.payload.len() => ReadPhase::Draining,
            _ => ReadPhase::Drained,
        }
    }

    /// Offer up to `capacity` payload bytes to `copy`, which returns how many
    /// it accepted. The cursor advances by exactly that many.
    pub fn drain<F>(&self, capacity: usize, copy: F) -> usize
    where
        F: FnOnce(&[u8]) -> usize,
    {
        let start = self.cursor();
        let n = capacity.min(self.payload.len() - start);
        if n == 0 {
            return 0;
        }

        let accepted = copy(&self.payload[start..start + n]).min(n);
        if accepted == 0 {
            log_proxy_warn!("append error", appended = start);
            return 0;
        }

        let cursor = start + accepted;
        self.cursor.store(cursor, Ordering::Release);
        log_proxy_info!("append", count = accepted);
        if cursor == self.payload.len() {
            log_proxy_info!("append done");
        }
        accepted
    }
}

/// Operation table installed on the target file.
pub struct ProxyOps {
    inner: Arc<dyn FileOperations>,
    stream: Arc<InjectionStream>,
}

impl ProxyOps {
    pub fn new(inner: Arc<dyn FileOperations>, stream: Arc<InjectionStream>) -> Self {
        Self { inner, stream }
    }

    /// Run the real read unless appending is already under way. `Some` means
    /// the caller should return that value as-is.
    fn pass_through<F>(&self, read: F) -> Option<isize>
    where
        F: FnOnce() -> isize,
    {
        if self.stream.is_draining() {
            return None;
        }
        let ret = read();
        if ret != 0 || self.stream.is_drained() {
            return Some(ret);
        }
        log_proxy_info!("orig read finished, start append rc");
        None
    }
}

impl FileOperations for ProxyOps {
    fn has_read(&self) -> bool {
        self.inner.has_read()
    }

    fn read(&self, file: &OpenFile, buf: &mut dyn UserBuffer, pos: &mut u64) -> isize {
        if let Some(ret) = self.pass_through(|| self.inner.read(file, buf, pos)) {
            return ret;
        }
        let appended = self.stream.drain(buf.len(), |chunk| match buf.copy_to_user(0, chunk) {
            Ok(()) => chunk.len(),
            Err(_) => 0,
        });
        appended as isize
    }

    fn has_read_iter(&self) -> bool {
        self.inner.has_read_iter()
    }

    fn read_iter(&self, file: &OpenFile, pos: &mut u64, to: &mut dyn IovIter) -> isize {
        if let Some(ret) = self.pass_through(|| self.inner.read_iter(file, pos, to)) {
            return ret;
        }
        let appended = self.stream.drain(to.count(), |chunk| to.copy_to_iter(chunk));
        appended as isize
    }
}

/// Matches reads of the target file and installs the proxy on it.
#[derive(Debug)]
pub struct ReadInterceptionProxy {
    stream: Arc<InjectionStream>,
    active: AtomicBool,
}

impl Default for ReadInterceptionProxy {
    fn default() -> Self {
        Self::new(Arc::new(InjectionStream::new(KERNEL_SU_RC.as_bytes())))
    }
}

impl ReadInterceptionProxy {
    pub fn new(stream: Arc<InjectionStream>) -> Self {
        Self {
            stream,
            active: AtomicBool::new(true),
        }
    }

    pub fn stream(&self) -> &Arc<InjectionStream> {
        &self.stream
    }

    pub fn phase(&self) -> ReadPhase {
        self.stream.phase()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Called on entry to a read of `file` by the task named `comm`. Returns
    /// true if this call installed the proxy.
    pub fn handle_vfs_read(&self, comm: &str, file: &OpenFile) -> bool {
        if !self.is_active() || comm != TARGET_COMM {
            return false;
        }
        if !file.is_regular() || file.name() != TARGET_NAME || file.path() != TARGET_PATH {
            return false;
        }

        if !self.stream.latch() {
            // Only the first read needs us
            self.stop_vfs_read_hook();
            return false;
        }

        log_proxy_info!(
            "vfs_read",
            path = file.path(),
            comm = comm,
            rc_count = self.stream.payload().len(),
        );
        let inner = file.ops();
        file.replace_ops(Arc::new(ProxyOps::new(inner, self.stream.clone())));
        true
    }

    /// `read(fd, ..)` entry: resolve the descriptor, then match as above.
    pub fn handle_sys_read(&self, comm: &str, fds: &dyn FdTable, fd: u32) -> bool {
        match fds.get(fd) {
            Some(file) => self.handle_vfs_read(comm, &file),
            None => false,
        }
    }

    /// Stop matching. An already installed proxy keeps draining.
    pub fn stop_vfs_read_hook(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            log_proxy_info!("vfs_read hook stopped");
        }
    }
}
