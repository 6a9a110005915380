// =============================================================================
// state.rs - The interceptor
// =============================================================================
//
// All hook state lives in one Interceptor built at load time:
//   - the platform and the policy collaborators
//   - the strategy picked from platform capabilities
//   - probe descriptors and dispatch table slots
//   - the init.rc read proxy and the safe mode latch
//
// Probe handlers hold a Weak back-reference; table trampolines find the
// interceptor through the slot `publish` fills.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use ksu_config::{Config, HookConfig, StrategyChoice};

use crate::dispatch::{CallFrame, Dispatcher, InputEvent, Syscall, SyscallPolicy};
use crate::error::{HookError, Result};
use crate::patch::{DispatchTable, TableKind};
use crate::platform::{KernelVersion, Platform, PlatformCaps, ProbeHandler};
use crate::read_proxy::{FdTable, OpenFile, ReadInterceptionProxy};
use crate::registry::{HookDescriptor, HookRegistry, TableHook};
use crate::safe_mode::SafeModeLatch;
use crate::symbols::{BOUNDED_TRANSITION_SYMBOL, INPUT_EVENT_SYMBOL};
use crate::trampoline::{self, CallConvention};
use crate::worker::DeferredUnregisterWorker;

/// Syscall wrappers take a register frame from this release on.
const SYSCALL_WRAPPERS: KernelVersion = KernelVersion::new(4, 17, 0);
/// Table handlers take a register frame from this release on.
const REGISTER_FRAME_TABLES: KernelVersion = KernelVersion::new(4, 19, 0);
/// Window in which the bounded transition check needs bypassing.
const TRANSITION_MIN: KernelVersion = KernelVersion::new(3, 18, 0);
const TRANSITION_MAX: KernelVersion = KernelVersion::new(4, 14, 0);

/// How syscall entry points are intercepted, decided once at load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStrategy {
    /// Probes on the syscall wrappers
    Probe,
    /// Patch dispatch table slots
    Table { convention: CallConvention },
    Disabled,
}

impl HookStrategy {
    pub fn select(caps: &PlatformCaps, choice: StrategyChoice) -> Self {
        let probe = caps.probes.then_some(HookStrategy::Probe);
        let table = caps.syscall_table.map(|_| HookStrategy::Table {
            convention: if caps.kernel >= REGISTER_FRAME_TABLES {
                CallConvention::Registers
            } else {
                CallConvention::Direct
            },
        });

        let selected = match choice {
            StrategyChoice::None => None,
            StrategyChoice::Probe => probe,
            StrategyChoice::Table => table,
            StrategyChoice::Auto => {
                if caps.kernel >= SYSCALL_WRAPPERS {
                    probe.or(table)
                } else {
                    table
                }
            }
        };
        selected.unwrap_or(HookStrategy::Disabled)
    }
}

struct SyscallTableHooks {
    native: [TableHook; 4],
    compat: [TableHook; 4],
}

impl SyscallTableHooks {
    fn new() -> Self {
        let hook = |kind, sc: Syscall| TableHook::new(kind, sc.number(kind), sc.name());
        Self {
            native: Syscall::ALL.map(|sc| hook(TableKind::Native, sc)),
            compat: Syscall::ALL.map(|sc| hook(TableKind::Compat, sc)),
        }
    }

    fn get(&self, kind: TableKind, syscall: Syscall) -> &TableHook {
        let i = syscall as usize;
        match kind {
            TableKind::Native => &self.native[i],
            TableKind::Compat => &self.compat[i],
        }
    }
}

pub struct Interceptor {
    platform: Arc<dyn Platform>,
    dispatcher: Dispatcher,
    registry: HookRegistry,
    worker: DeferredUnregisterWorker,
    strategy: HookStrategy,
    config: HookConfig,
    syscall_probes: [Arc<HookDescriptor>; 4],
    table_hooks: SyscallTableHooks,
    input_hook: Arc<HookDescriptor>,
    input_stopped: AtomicBool,
    transition_hook: Arc<HookDescriptor>,
    read_proxy: ReadInterceptionProxy,
    safe_mode: SafeModeLatch,
}

impl Interceptor {
    pub fn new(
        platform: Arc<dyn Platform>,
        policy: Arc<dyn SyscallPolicy>,
        config: &HookConfig,
    ) -> Arc<Self> {
        let dispatcher = Dispatcher::new(policy);
        let registry = HookRegistry::new(platform.clone());
        let worker = DeferredUnregisterWorker::new(registry.clone());
        let strategy = HookStrategy::select(platform.caps(), config.strategy);

        Arc::new_cyclic(|weak: &Weak<Interceptor>| {
            let syscall_probes = Syscall::ALL.map(|sc| {
                let d = dispatcher.clone();
                let handler: ProbeHandler =
                    Arc::new(move |frame: &mut CallFrame| d.syscall_probe(sc, frame));
                Arc::new(HookDescriptor::new(sc.probe_symbol(), handler))
            });

            let d = dispatcher.clone();
            let transition: ProbeHandler =
                Arc::new(move |frame: &mut CallFrame| d.bounded_transition_probe(frame));

            let me = weak.clone();
            let input: ProbeHandler = Arc::new(move |frame: &mut CallFrame| match me.upgrade() {
                Some(state) => state.on_input_event(InputEvent::from_frame(frame)),
                None => 0,
            });

            Interceptor {
                platform,
                dispatcher,
                registry,
                worker,
                strategy,
                config: config.clone(),
                syscall_probes,
                table_hooks: SyscallTableHooks::new(),
                input_hook: Arc::new(HookDescriptor::new(INPUT_EVENT_SYMBOL, input)),
                input_stopped: AtomicBool::new(false),
                transition_hook: Arc::new(HookDescriptor::new(
                    BOUNDED_TRANSITION_SYMBOL,
                    transition,
                )),
                read_proxy: ReadInterceptionProxy::default(),
                safe_mode: SafeModeLatch::new(),
            }
        })
    }

    /// Read the on-device config, set up logging, then build and load.
    ///
    /// A bad value only loses that value: the rest of the file and the
    /// remaining overrides still apply.
    pub fn start(platform: Arc<dyn Platform>, policy: Arc<dyn SyscallPolicy>) -> Result<Arc<Self>> {
        let (config, problems) = Config::load_lenient();
        ksu_config::logging::init_logging(config.log.level);
        for e in &problems {
            log_hook_warn!("config value ignored", error = tracing::field::display(e));
        }

        let state = Self::new(platform, policy, &config.hooks);
        state.load()?;
        Ok(state)
    }

    /// Make this interceptor the one table trampolines call into.
    pub fn publish(self: &Arc<Self>) -> Result<()> {
        trampoline::publish(self.clone())
    }

    /// Install syscall hooks with the selected strategy, then the key-event
    /// observer. Individual hook failures are logged and skipped.
    pub fn load(self: &Arc<Self>) -> Result<()> {
        let caps = self.platform.caps();
        log_hook_info!(
            "loading",
            kernel = tracing::field::display(caps.kernel),
            strategy = tracing::field::debug(self.strategy),
        );

        match self.strategy {
            HookStrategy::Probe => {
                for hook in &self.syscall_probes {
                    self.registry.register(hook);
                }
            }
            HookStrategy::Table { convention } => {
                // Trampolines must find us before the first slot goes live
                self.publish()?;
                let table = caps.syscall_table.ok_or(HookError::NoTable(TableKind::Native))?;
                self.install_table(&table, convention);
                match (convention, caps.compat_syscall_table) {
                    (CallConvention::Direct, Some(compat)) if self.config.compat_table => {
                        self.install_table(&compat, convention);
                    }
                    _ => {}
                }
            }
            HookStrategy::Disabled => {
                log_hook_warn!("no syscall hook strategy available");
            }
        }

        if self.config.input_hook {
            self.registry.register(&self.input_hook);
        }
        Ok(())
    }

    fn install_table(&self, table: &DispatchTable, convention: CallConvention) {
        for sc in Syscall::ALL {
            let Some(handler) = trampoline::handler(convention, table.kind(), sc) else {
                continue;
            };
            let hook = self.table_hooks.get(table.kind(), sc);
            // Logged by the registry
            let _ = self.registry.install_table_hook(table, hook, handler);
        }
    }

    /// Put back every table slot and detach every probe still attached.
    pub fn unload(&self) {
        let caps = self.platform.caps();
        for (table, hooks) in [
            (caps.syscall_table, &self.table_hooks.native),
            (caps.compat_syscall_table, &self.table_hooks.compat),
        ] {
            let Some(table) = table else { continue };
            for hook in hooks.iter().filter(|h| h.installed().is_some()) {
                let _ = self.registry.restore_table_hook(&table, hook);
            }
        }

        let probes = self
            .syscall_probes
            .iter()
            .chain([&self.input_hook, &self.transition_hook]);
        for hook in probes.filter(|h| h.addr().is_some()) {
            self.registry.unregister(hook);
        }
        log_hook_info!("unloaded");
    }

    fn transition_window(&self) -> bool {
        let v = self.platform.caps().kernel;
        (TRANSITION_MIN..TRANSITION_MAX).contains(&v)
    }

    /// Attach the bounded transition probe once the policy knows both SIDs.
    pub fn start_transition_routine(&self) {
        if !self.transition_window() || self.dispatcher.policy().transition_sids().is_none() {
            return;
        }
        self.registry.register(&self.transition_hook);
    }

    pub fn end_transition_routine(&self) {
        if !self.transition_window() {
            return;
        }
        self.worker.schedule_unregister(self.transition_hook.clone());
    }

    /// Stop observing key events. Safe to call from the observer itself.
    pub fn stop_input_hook(&self) {
        if self.input_stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.input_hook.addr().is_some() {
            self.worker.schedule_unregister(self.input_hook.clone());
        }
    }

    fn on_input_event(&self, event: InputEvent) -> i32 {
        if self.safe_mode.on_key_event(event.kind, event.code, event.value) {
            self.stop_input_hook();
        }
        0
    }

    /// Whether enough volume-down presses were seen. The first call also
    /// retires the key-event observer.
    pub fn is_safe_mode(&self) -> bool {
        if self.safe_mode.is_latched() {
            return true;
        }
        self.stop_input_hook();
        self.safe_mode.check()
    }

    /// Entry hook for `vfs_read`.
    pub fn on_vfs_read(&self, comm: &str, file: &OpenFile) -> bool {
        self.read_proxy.handle_vfs_read(comm, file)
    }

    /// Entry hook for `read(fd, ..)`.
    pub fn on_sys_read(&self, comm: &str, fds: &dyn FdTable, fd: u32) -> bool {
        self.read_proxy.handle_sys_read(comm, fds, fd)
    }

    pub fn stop_vfs_read_hook(&self) {
        self.read_proxy.stop_vfs_read_hook();
    }

    pub fn strategy(&self) -> HookStrategy {
        self.strategy
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn registry(&self) -> &HookRegistry {
        &self.registry
    }

    pub fn read_proxy(&self) -> &ReadInterceptionProxy {
        &self.read_proxy
    }

    pub fn safe_mode(&self) -> &SafeModeLatch {
        &self.safe_mode
    }

    pub fn table_hook(&self, kind: TableKind, syscall: Syscall) -> &TableHook {
        self.table_hooks.get(kind, syscall)
    }

    pub fn syscall_probe(&self, syscall: Syscall) -> &Arc<HookDescriptor> {
        &self.syscall_probes[syscall as usize]
    }

    pub fn input_hook(&self) -> &Arc<HookDescriptor> {
        &self.input_hook
    }

    pub fn transition_hook(&self) -> &Arc<HookDescriptor> {
        &self.transition_hook
    }
}
