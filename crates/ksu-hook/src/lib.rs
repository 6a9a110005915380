//! # ksu-hook
//!
//! Syscall interception and init.rc read injection for KernelSU.
//!
//! Two independent mechanisms:
//! - **Syscall hooks**: reboot, execve, faccessat and newfstatat are routed
//!   through [`SyscallPolicy`] either by probes on their wrappers or by
//!   patching the live dispatch tables ([`patch`]).
//! - **Read injection**: the first read of init.rc by init gets
//!   [`read_proxy::KERNEL_SU_RC`] appended after the real content.
//!
//! Everything the kernel provides is reached through [`platform::Platform`];
//! [`host`] implements it for a normal process.

#[macro_use]
extern crate ksu_config;

pub mod dispatch;
pub mod error;
pub mod host;
pub mod patch;
pub mod platform;
pub mod read_proxy;
pub mod reals;
pub mod registry;
pub mod safe_mode;
pub mod state;
pub mod symbols;
pub mod trampoline;
pub mod worker;

pub use dispatch::{CallFrame, Dispatcher, Syscall, SyscallPolicy, TransitionSids, UserPtr};
pub use error::{HookError, Result};
pub use patch::{DispatchTable, DispatchTablePatcher, TableKind};
pub use platform::{KernelVersion, Platform, PlatformCaps};
pub use read_proxy::ReadInterceptionProxy;
pub use registry::{HookDescriptor, HookRegistry, HookState};
pub use safe_mode::SafeModeLatch;
pub use state::{HookStrategy, Interceptor};
pub use worker::DeferredUnregisterWorker;
