//! Hook registration state
//!
//! Two kinds of hooks live here:
//! - [`HookDescriptor`]: a symbol-based probe. Registered iff its resolved
//!   address is set.
//! - [`TableHook`]: one patched dispatch-table slot and the original it
//!   displaced.
//!
//! The public register/unregister calls log their outcome and return
//! nothing; `try_*` variants hand the status back for callers that care.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{HookError, Result};
use crate::patch::{DispatchTable, DispatchTablePatcher, TableKind};
use crate::platform::{Platform, ProbeHandler};
use crate::reals::{RawHandler, SavedHandler};

/// Externally visible registration state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookState {
    Unregistered,
    Registered,
}

/// A probe on a named kernel function.
pub struct HookDescriptor {
    symbol: &'static str,
    handler: ProbeHandler,
    /// Resolved address; 0 while unregistered
    addr: AtomicUsize,
    /// Held while a register call is talking to the platform
    claimed: AtomicBool,
}

impl HookDescriptor {
    pub fn new(symbol: &'static str, handler: ProbeHandler) -> Self {
        Self {
            symbol,
            handler,
            addr: AtomicUsize::new(0),
            claimed: AtomicBool::new(false),
        }
    }

    pub fn symbol(&self) -> &'static str {
        self.symbol
    }

    pub fn addr(&self) -> Option<usize> {
        let a = self.addr.load(Ordering::Acquire);
        (a != 0).then_some(a)
    }

    pub fn state(&self) -> HookState {
        if self.addr().is_some() {
            HookState::Registered
        } else {
            HookState::Unregistered
        }
    }
}

impl std::fmt::Debug for HookDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookDescriptor")
            .field("symbol", &self.symbol)
            .field("state", &self.state())
            .finish()
    }
}

/// One hooked dispatch-table slot.
#[derive(Debug)]
pub struct TableHook {
    kind: TableKind,
    index: usize,
    original: SavedHandler,
    installed: AtomicUsize,
}

impl TableHook {
    pub const fn new(kind: TableKind, index: usize, name: &'static str) -> Self {
        Self {
            kind,
            index,
            original: SavedHandler::new(name),
            installed: AtomicUsize::new(0),
        }
    }

    pub fn kind(&self) -> TableKind {
        self.kind
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &'static str {
        self.original.name()
    }

    /// The handler this hook displaced, kept even after a restore so
    /// in-flight calls can still reach it.
    pub fn original(&self) -> &SavedHandler {
        &self.original
    }

    pub fn installed(&self) -> Option<RawHandler> {
        let a = self.installed.load(Ordering::Acquire);
        (a != 0).then_some(RawHandler::from_addr(a))
    }

    pub fn state(&self) -> HookState {
        if self.installed().is_some() {
            HookState::Registered
        } else {
            HookState::Unregistered
        }
    }
}

fn check_kind(table: &DispatchTable, hook: &TableHook) -> Result<()> {
    if table.kind() != hook.kind {
        return Err(HookError::TableMismatch {
            hook: hook.kind,
            table: table.kind(),
        });
    }
    Ok(())
}

#[derive(Clone)]
pub struct HookRegistry {
    platform: Arc<dyn Platform>,
}

impl HookRegistry {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self { platform }
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    /// Attach a probe. Failures are logged and otherwise dropped.
    pub fn register(&self, hook: &HookDescriptor) {
        let _ = self.try_register(hook);
    }

    pub fn try_register(&self, hook: &HookDescriptor) -> Result<usize> {
        if hook
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log_hook_warn!("register kp: already registered", symbol = hook.symbol);
            return Err(HookError::AlreadyRegistered(hook.symbol));
        }

        let result = self
            .platform
            .register_probe(hook.symbol, hook.handler.clone());
        let ret = match result {
            Ok(_) => 0,
            Err(code) => code,
        };
        log_hook_info!("register kp", symbol = hook.symbol, ret = ret);

        match result {
            Ok(addr) => {
                hook.addr.store(addr, Ordering::Release);
                Ok(addr)
            }
            Err(code) => {
                hook.claimed.store(false, Ordering::Release);
                Err(HookError::Register {
                    symbol: hook.symbol,
                    code,
                })
            }
        }
    }

    /// Detach a probe. A hook that never registered only gets a log line.
    pub fn unregister(&self, hook: &HookDescriptor) {
        let _ = self.try_unregister(hook);
    }

    pub fn try_unregister(&self, hook: &HookDescriptor) -> Result<()> {
        let addr = hook.addr.swap(0, Ordering::AcqRel);
        if addr == 0 {
            log_hook_info!(
                "unregister kp: not registered in the first place",
                symbol = hook.symbol,
            );
            return Err(HookError::NotRegistered(hook.symbol));
        }

        self.platform.unregister_probe(hook.symbol, addr);
        hook.claimed.store(false, Ordering::Release);
        // The primitive reports nothing
        log_hook_info!("unregister kp", symbol = hook.symbol, ret = "??");
        Ok(())
    }

    /// Point `table[hook.index]` at `handler`, saving the displaced original
    /// before the new pointer is published.
    pub fn install_table_hook(
        &self,
        table: &DispatchTable,
        hook: &TableHook,
        handler: RawHandler,
    ) -> Result<()> {
        check_kind(table, hook)?;
        if hook
            .installed
            .compare_exchange(0, handler.addr(), Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log_hook_warn!(
                "table hook already installed",
                name = hook.name(),
                table = hook.kind.as_str(),
                index = hook.index,
            );
            return Err(HookError::SlotBusy {
                kind: hook.kind,
                index: hook.index,
            });
        }

        let patcher = DispatchTablePatcher::new(&*self.platform);
        let result = patcher.install_with(table, hook.index, handler, |orig| {
            hook.original.store(orig)
        });
        match result {
            Ok(original) => {
                log_hook_info!(
                    "table hook installed",
                    name = hook.name(),
                    table = hook.kind.as_str(),
                    index = hook.index,
                    original = original.addr(),
                );
                Ok(())
            }
            Err(e) => {
                hook.installed.store(0, Ordering::Release);
                log_hook_error!(
                    "table hook failed",
                    name = hook.name(),
                    error = tracing::field::display(&e),
                );
                Err(e)
            }
        }
    }

    /// Put the saved original back. No-op for hooks that are not installed.
    pub fn restore_table_hook(&self, table: &DispatchTable, hook: &TableHook) -> Result<()> {
        check_kind(table, hook)?;
        if hook.installed().is_none() {
            return Err(HookError::NotRegistered(hook.name()));
        }
        let Some(original) = hook.original.load() else {
            return Err(HookError::NotRegistered(hook.name()));
        };

        let patcher = DispatchTablePatcher::new(&*self.platform);
        patcher.restore(table, hook.index, original)?;
        hook.installed.store(0, Ordering::Release);
        log_hook_info!(
            "table hook restored",
            name = hook.name(),
            table = hook.kind.as_str(),
            index = hook.index,
        );
        Ok(())
    }
}
