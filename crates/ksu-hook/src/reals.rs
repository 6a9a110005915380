//! Saved original handlers
//!
//! Every hook calls through to the handler it displaced. The displaced
//! address is captured once, before the replacement is published, and read
//! lock-free from whatever CPU the hook fires on.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Address of a function stored in a dispatch slot.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RawHandler(usize);

impl RawHandler {
    pub const NULL: RawHandler = RawHandler(0);

    pub const fn from_addr(addr: usize) -> Self {
        Self(addr)
    }

    pub const fn addr(self) -> usize {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Storage for the original handler of one hooked entry point
pub struct SavedHandler {
    ptr: AtomicUsize,
    name: &'static str,
}

impl SavedHandler {
    pub const fn new(name: &'static str) -> Self {
        Self {
            ptr: AtomicUsize::new(0),
            name,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn load(&self) -> Option<RawHandler> {
        let p = self.ptr.load(Ordering::Acquire);
        (p != 0).then_some(RawHandler(p))
    }

    pub fn store(&self, handler: RawHandler) {
        self.ptr.store(handler.addr(), Ordering::Release);
    }

    pub fn is_saved(&self) -> bool {
        self.ptr.load(Ordering::Acquire) != 0
    }

    /// Reinterpret the saved address as a function pointer of type `F`.
    ///
    /// # Safety
    ///
    /// `F` must be a function pointer type matching the ABI of the function
    /// that was stored.
    pub unsafe fn get<F: Copy>(&self) -> Option<F> {
        debug_assert_eq!(std::mem::size_of::<F>(), std::mem::size_of::<usize>());
        let handler = self.load()?;
        Some(std::mem::transmute_copy::<usize, F>(&handler.addr()))
    }
}

impl std::fmt::Debug for SavedHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SavedHandler")
            .field("name", &self.name)
            .field("ptr", &format_args!("{:#x}", self.ptr.load(Ordering::Relaxed)))
            .finish()
    }
}
