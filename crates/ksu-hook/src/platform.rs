//! Kernel capabilities consumed by the interception layer.
//!
//! Every primitive the hooks need from the running kernel is reached through
//! one of these traits: page protection for dispatch tables, preemption
//! control, symbol-based probes and detached task spawning. `host` provides a
//! userspace implementation.

use std::fmt;
use std::io;
use std::sync::Arc;

use crate::dispatch::CallFrame;
use crate::patch::DispatchTable;

/// Pre-handler attached to a symbol probe. Runs before the probed function
/// with its argument registers; may rewrite them in place.
pub type ProbeHandler = Arc<dyn Fn(&mut CallFrame) -> i32 + Send + Sync>;

/// Detached unit of work handed to a [`TaskSpawner`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub trait PageProtection: Send + Sync {
    fn page_size(&self) -> usize;

    /// Drop lazily-flushed alternate mappings (vmalloc aliases).
    fn unmap_aliases(&self);

    fn set_memory_rw(&self, addr: usize, pages: usize) -> i32;

    fn set_memory_ro(&self, addr: usize, pages: usize) -> i32;

    /// Invalidate cached translations for `[start, end)` on every CPU.
    fn flush_tlb_range(&self, start: usize, end: usize);
}

pub trait Preemption: Send + Sync {
    fn preempt_disable(&self);
    fn preempt_enable(&self);
}

pub trait SymbolProbes: Send + Sync {
    /// Attach `handler` at `symbol`. Returns the resolved address, or a
    /// negative errno.
    fn register_probe(&self, symbol: &'static str, handler: ProbeHandler) -> Result<usize, i32>;

    /// Detach the probe at `addr`. The primitive reports no status.
    fn unregister_probe(&self, symbol: &'static str, addr: usize);
}

pub trait TaskSpawner: Send + Sync {
    /// Run `task` on an independent, detached context.
    fn spawn(&self, name: &'static str, task: Task) -> io::Result<()>;
}

/// Everything the interceptor needs from the kernel it is loaded into.
pub trait Platform: PageProtection + Preemption + SymbolProbes + TaskSpawner {
    fn caps(&self) -> &PlatformCaps;
}

/// Disables preemption for its lifetime.
pub struct PreemptGuard<'a, P: Preemption + ?Sized> {
    platform: &'a P,
}

impl<'a, P: Preemption + ?Sized> PreemptGuard<'a, P> {
    pub fn new(platform: &'a P) -> Self {
        platform.preempt_disable();
        Self { platform }
    }
}

impl<P: Preemption + ?Sized> Drop for PreemptGuard<'_, P> {
    fn drop(&mut self) {
        self.platform.preempt_enable();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KernelVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl KernelVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse a release string such as `5.10.198-android12-9-g1234`.
    pub fn parse(release: &str) -> Option<Self> {
        let mut parts = release.split(|c: char| !c.is_ascii_digit());
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        Some(Self::new(major, minor, patch))
    }
}

impl fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Capabilities detected once at load time.
#[derive(Debug, Clone)]
pub struct PlatformCaps {
    pub kernel: KernelVersion,
    /// Symbol-based probes are available.
    pub probes: bool,
    pub syscall_table: Option<DispatchTable>,
    pub compat_syscall_table: Option<DispatchTable>,
}

impl PlatformCaps {
    pub fn new(kernel: KernelVersion) -> Self {
        Self {
            kernel,
            probes: false,
            syscall_table: None,
            compat_syscall_table: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_android_release() {
        assert_eq!(
            KernelVersion::parse("5.10.198-android12-9-g1234"),
            Some(KernelVersion::new(5, 10, 198))
        );
        assert_eq!(
            KernelVersion::parse("4.14"),
            Some(KernelVersion::new(4, 14, 0))
        );
        assert_eq!(KernelVersion::parse("linux"), None);
    }

    #[test]
    fn test_version_ordering() {
        assert!(KernelVersion::new(4, 19, 0) > KernelVersion::new(4, 14, 302));
        assert!(KernelVersion::new(3, 18, 140) < KernelVersion::new(4, 4, 0));
        assert_eq!(KernelVersion::new(4, 9, 1).to_string(), "4.9.1");
    }
}
