// =============================================================================
// patch.rs - In-place rewriting of read-only dispatch tables
// =============================================================================
//
// A dispatch table stays live and callable from every CPU while one of its
// slots is swapped. The sequence per slot is:
//
//   1. drop alternate mappings, make the page writable, flush TLB, full fence
//   2. volatile read of the current slot (the saved original)
//   3. fence, volatile pointer-sized write of the new handler, fence
//   4. drop aliases, page back to read-only, flush TLB, fence
//
// Steps 1 and 4 live in WritableWindow so protection is restored on every exit
// path. Other CPUs observe either the old or the new pointer, never a torn
// one. There is no stop-the-world: a caller may still be reading the slot
// while the window is open.
// =============================================================================

use std::ptr::{self, NonNull};
use std::sync::atomic::{fence, Ordering};

use crate::error::{HookError, Result};
use crate::platform::{PageProtection, PreemptGuard, Preemption};
use crate::reals::RawHandler;

/// Which of the two syscall tables a slot lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableKind {
    Native,
    /// 32-bit callers on a 64-bit kernel.
    Compat,
}

impl TableKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TableKind::Native => "native",
            TableKind::Compat => "compat",
        }
    }
}

/// A function-pointer table addressed by call number.
#[derive(Debug, Clone, Copy)]
pub struct DispatchTable {
    kind: TableKind,
    base: NonNull<usize>,
    len: usize,
}

// Safety: slots are only touched through volatile pointer-sized accesses.
unsafe impl Send for DispatchTable {}
unsafe impl Sync for DispatchTable {}

impl DispatchTable {
    /// # Safety
    ///
    /// `base` must point to `len` pointer-sized slots that stay mapped for
    /// the lifetime of every copy of the returned table.
    pub unsafe fn from_raw_parts(kind: TableKind, base: *mut usize, len: usize) -> Option<Self> {
        Some(Self {
            kind,
            base: NonNull::new(base)?,
            len,
        })
    }

    pub fn kind(&self) -> TableKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn base_addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    fn slot_ptr(&self, index: usize) -> Result<*mut usize> {
        if index >= self.len {
            return Err(HookError::IndexOutOfRange {
                kind: self.kind,
                index,
                len: self.len,
            });
        }
        // Safety: bounds checked above
        Ok(unsafe { self.base.as_ptr().add(index) })
    }

    /// Current value of a slot, without patching.
    pub fn read(&self, index: usize) -> Result<RawHandler> {
        let slot = self.slot_ptr(index)?;
        Ok(RawHandler::from_addr(unsafe { ptr::read_volatile(slot) }))
    }
}

/// Page containing a slot, writable for the lifetime of the window.
pub struct WritableWindow<'a, P: PageProtection + ?Sized> {
    platform: &'a P,
    page: usize,
    page_size: usize,
}

impl<'a, P: PageProtection + ?Sized> WritableWindow<'a, P> {
    pub fn open(platform: &'a P, addr: usize) -> Self {
        let page_size = platform.page_size();
        let page = addr & !(page_size - 1);

        platform.unmap_aliases();
        // Return codes are not checked; the toggles are assumed to succeed
        let _ = platform.set_memory_rw(page, 1);
        platform.flush_tlb_range(page, page + page_size);
        fence(Ordering::SeqCst);

        Self {
            platform,
            page,
            page_size,
        }
    }
}

impl<P: PageProtection + ?Sized> Drop for WritableWindow<'_, P> {
    fn drop(&mut self) {
        self.platform.unmap_aliases();
        let _ = self.platform.set_memory_ro(self.page, 1);
        self.platform
            .flush_tlb_range(self.page, self.page + self.page_size);
        fence(Ordering::SeqCst);
    }
}

/// Swaps slots of read-only dispatch tables.
pub struct DispatchTablePatcher<'a, P: PageProtection + Preemption + ?Sized> {
    platform: &'a P,
}

impl<'a, P: PageProtection + Preemption + ?Sized> DispatchTablePatcher<'a, P> {
    pub fn new(platform: &'a P) -> Self {
        Self { platform }
    }

    /// Replace `table[index]` with `new`, returning the value it held.
    pub fn install(
        &self,
        table: &DispatchTable,
        index: usize,
        new: RawHandler,
    ) -> Result<RawHandler> {
        self.install_with(table, index, new, |_| {})
    }

    /// Like [`install`](Self::install), but hands the original to `save`
    /// before the new pointer becomes visible to other CPUs.
    pub fn install_with<F>(
        &self,
        table: &DispatchTable,
        index: usize,
        new: RawHandler,
        save: F,
    ) -> Result<RawHandler>
    where
        F: FnOnce(RawHandler),
    {
        let slot = table.slot_ptr(index)?;

        let _preempt = PreemptGuard::new(self.platform);
        let _window = WritableWindow::open(self.platform, slot as usize);

        fence(Ordering::SeqCst);
        // Safety: slot is in bounds and its page is writable inside the window
        let original = RawHandler::from_addr(unsafe { ptr::read_volatile(slot) });
        save(original);
        fence(Ordering::SeqCst);
        unsafe { ptr::write_volatile(slot, new.addr()) };
        fence(Ordering::SeqCst);

        log_patch_debug!(
            "slot swapped",
            table = table.kind().as_str(),
            index = index,
            original = original.addr(),
            installed = new.addr(),
        );
        Ok(original)
    }

    /// Put a previously saved original back into its slot.
    pub fn restore(
        &self,
        table: &DispatchTable,
        index: usize,
        original: RawHandler,
    ) -> Result<RawHandler> {
        self.install(table, index, original)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostPlatform, HostTable, PlatformEvent};
    use crate::platform::KernelVersion;

    extern "C" fn default_handler() -> isize {
        -38
    }

    extern "C" fn replacement() -> isize {
        7
    }

    fn setup() -> (HostPlatform, HostTable) {
        let table =
            HostTable::new(TableKind::Native, 512, default_handler as *const () as usize).unwrap();
        let platform = HostPlatform::new(KernelVersion::new(5, 10, 0));
        (platform, table)
    }

    #[test]
    fn test_install_returns_original_and_publishes_new() {
        let (platform, table) = setup();
        let patcher = DispatchTablePatcher::new(&platform);
        let new = RawHandler::from_addr(replacement as *const () as usize);

        let original = patcher.install(&table.table(), 142, new).unwrap();
        assert_eq!(original.addr(), default_handler as *const () as usize);
        assert_eq!(table.table().read(142).unwrap(), new);
        // Neighbours untouched
        assert_eq!(table.table().read(141).unwrap().addr(), default_handler as *const () as usize);
        assert_eq!(table.table().read(143).unwrap().addr(), default_handler as *const () as usize);
    }

    #[test]
    fn test_install_then_restore_is_identity() {
        let (platform, table) = setup();
        let patcher = DispatchTablePatcher::new(&platform);
        let before = table.table().read(79).unwrap();

        let original = patcher
            .install(&table.table(), 79, RawHandler::from_addr(replacement as *const () as usize))
            .unwrap();
        let displaced = patcher.restore(&table.table(), 79, original).unwrap();

        assert_eq!(displaced.addr(), replacement as *const () as usize);
        assert_eq!(table.table().read(79).unwrap(), before);
    }

    #[test]
    fn test_save_runs_before_publish() {
        let (platform, table) = setup();
        let patcher = DispatchTablePatcher::new(&platform);
        let dt = table.table();

        let new = RawHandler::from_addr(replacement as *const () as usize);

        patcher
            .install_with(&dt, 48, new, |orig| {
                // The slot still holds the original while we are saving it
                assert_eq!(dt.read(48).unwrap(), orig);
            })
            .unwrap();
    }

    #[test]
    fn test_protection_sequence_and_preemption_balanced() {
        let (platform, table) = setup();
        let patcher = DispatchTablePatcher::new(&platform);
        platform.clear_events();

        patcher
            .install(&table.table(), 221, RawHandler::from_addr(replacement as *const () as usize))
            .unwrap();

        let page = table.table().base_addr();
        let ps = platform.page_size();
        assert_eq!(
            platform.events(),
            vec![
                PlatformEvent::PreemptDisable,
                PlatformEvent::UnmapAliases,
                PlatformEvent::SetRw(page),
                PlatformEvent::FlushTlb(page, page + ps),
                PlatformEvent::UnmapAliases,
                PlatformEvent::SetRo(page),
                PlatformEvent::FlushTlb(page, page + ps),
                PlatformEvent::PreemptEnable,
            ]
        );
        assert_eq!(platform.preempt_depth(), 0);
    }

    #[test]
    fn test_out_of_range_touches_nothing() {
        let (platform, table) = setup();
        let patcher = DispatchTablePatcher::new(&platform);
        platform.clear_events();

        let err = patcher
            .install(&table.table(), 512, RawHandler::from_addr(replacement as *const () as usize))
            .unwrap_err();
        assert!(matches!(err, HookError::IndexOutOfRange { index: 512, len: 512, .. }));
        assert!(platform.events().is_empty());
    }
}
