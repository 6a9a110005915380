// =============================================================================
// trampoline.rs - Entry points written into dispatch tables
// =============================================================================
//
// A dispatch table slot holds a bare function pointer, so these functions
// reach interceptor state through the one published slot below. Shapes:
//   - *_regs    - 4.19+ tables, one `*const CallFrame` argument
//   - *_native  - older native tables, plain arguments
//   - *_compat  - 32-bit compatibility table, plain arguments
//
// Each trampoline looks up the original it displaced and lets the
// Dispatcher forward to it exactly once. With nothing published, or no
// saved original, the call fails with -ENOSYS.
// =============================================================================

use std::sync::{Arc, OnceLock};

use crate::dispatch::{CallFrame, Syscall, UserPtr};
use crate::error::{HookError, Result};
use crate::patch::TableKind;
use crate::reals::RawHandler;
use crate::state::Interceptor;

const ENOSYS: isize = -(libc::ENOSYS as isize);

static LOADED: OnceLock<Arc<Interceptor>> = OnceLock::new();

/// Make `state` visible to the trampolines. Only one interceptor can ever be
/// published per process.
pub(crate) fn publish(state: Arc<Interceptor>) -> Result<()> {
    LOADED.set(state).map_err(|_| HookError::AlreadyPublished)
}

pub fn loaded() -> Option<&'static Arc<Interceptor>> {
    LOADED.get()
}

/// How a syscall table passes arguments to its handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallConvention {
    /// One pointer to the saved user register frame (kernel 4.19+).
    Registers,
    /// Arguments passed directly.
    Direct,
}

pub type FrameFn = unsafe extern "C" fn(*const CallFrame) -> isize;
pub type RebootFn = unsafe extern "C" fn(i32, i32, u32, usize) -> isize;
pub type ExecveFn = unsafe extern "C" fn(usize, usize, usize) -> isize;
pub type FaccessatFn = unsafe extern "C" fn(i32, usize, i32) -> isize;
pub type StatFn = unsafe extern "C" fn(i32, usize, usize, i32) -> isize;

/// The trampoline to install for `syscall` in a table of `kind`.
/// Register-frame tables only exist as native tables.
pub fn handler(
    convention: CallConvention,
    kind: TableKind,
    syscall: Syscall,
) -> Option<RawHandler> {
    use CallConvention::{Direct, Registers};

    let f: *const () = match (convention, kind, syscall) {
        (Registers, TableKind::Compat, _) => return None,
        (Registers, TableKind::Native, Syscall::Reboot) => reboot_regs as *const (),
        (Registers, TableKind::Native, Syscall::Execve) => execve_regs as *const (),
        (Registers, TableKind::Native, Syscall::Faccessat) => faccessat_regs as *const (),
        (Registers, TableKind::Native, Syscall::Newfstatat) => newfstatat_regs as *const (),
        (Direct, TableKind::Native, Syscall::Reboot) => reboot_native as *const (),
        (Direct, TableKind::Native, Syscall::Execve) => execve_native as *const (),
        (Direct, TableKind::Native, Syscall::Faccessat) => faccessat_native as *const (),
        (Direct, TableKind::Native, Syscall::Newfstatat) => newfstatat_native as *const (),
        (Direct, TableKind::Compat, Syscall::Reboot) => reboot_compat as *const (),
        (Direct, TableKind::Compat, Syscall::Execve) => execve_compat as *const (),
        (Direct, TableKind::Compat, Syscall::Faccessat) => faccessat_compat as *const (),
        (Direct, TableKind::Compat, Syscall::Newfstatat) => fstatat64_compat as *const (),
    };
    Some(RawHandler::from_addr(f as usize))
}

/// # Safety
///
/// `F` must match the signature of the handler saved for `syscall` in `kind`.
unsafe fn original<F: Copy>(
    kind: TableKind,
    syscall: Syscall,
) -> Option<(&'static Interceptor, F)> {
    let state: &'static Interceptor = loaded()?;
    let f = state.table_hook(kind, syscall).original().get::<F>()?;
    Some((state, f))
}

// ----------------------------------------------------------------------------
// Register-frame convention
// ----------------------------------------------------------------------------

unsafe fn frame_call(syscall: Syscall, regs: *const CallFrame) -> isize {
    let Some((state, orig)) = original::<FrameFn>(TableKind::Native, syscall) else {
        return ENOSYS;
    };
    let Some(frame) = regs.as_ref() else {
        return orig(regs);
    };

    let forward = |f: &CallFrame| unsafe { orig(f) };
    let d = state.dispatcher();
    match syscall {
        Syscall::Reboot => d.reboot_frame(frame, forward),
        Syscall::Execve => d.execve_frame(frame, forward),
        Syscall::Faccessat => d.faccessat_frame(frame, forward),
        Syscall::Newfstatat => d.stat_frame(frame, forward),
    }
}

pub unsafe extern "C" fn reboot_regs(regs: *const CallFrame) -> isize {
    frame_call(Syscall::Reboot, regs)
}

pub unsafe extern "C" fn execve_regs(regs: *const CallFrame) -> isize {
    frame_call(Syscall::Execve, regs)
}

pub unsafe extern "C" fn faccessat_regs(regs: *const CallFrame) -> isize {
    frame_call(Syscall::Faccessat, regs)
}

pub unsafe extern "C" fn newfstatat_regs(regs: *const CallFrame) -> isize {
    frame_call(Syscall::Newfstatat, regs)
}

// ----------------------------------------------------------------------------
// Direct-argument convention
// ----------------------------------------------------------------------------

unsafe fn reboot_direct(kind: TableKind, magic1: i32, magic2: i32, cmd: u32, arg: usize) -> isize {
    let Some((state, orig)) = original::<RebootFn>(kind, Syscall::Reboot) else {
        return ENOSYS;
    };
    state
        .dispatcher()
        .reboot(magic1, magic2, cmd, UserPtr(arg), |m1, m2, c, a| unsafe { orig(m1, m2, c, a.0) })
}

unsafe fn execve_direct(kind: TableKind, filename: usize, argv: usize, envp: usize) -> isize {
    let Some((state, orig)) = original::<ExecveFn>(kind, Syscall::Execve) else {
        return ENOSYS;
    };
    state.dispatcher().execve(
        kind == TableKind::Compat,
        UserPtr(filename),
        UserPtr(argv),
        UserPtr(envp),
        |f, a, e| unsafe { orig(f.0, a.0, e.0) },
    )
}

unsafe fn faccessat_direct(kind: TableKind, dfd: i32, filename: usize, mode: i32) -> isize {
    let Some((state, orig)) = original::<FaccessatFn>(kind, Syscall::Faccessat) else {
        return ENOSYS;
    };
    state
        .dispatcher()
        .faccessat(dfd, UserPtr(filename), mode, |d, f, m| unsafe { orig(d, f.0, m) })
}

unsafe fn stat_direct(
    kind: TableKind,
    dfd: i32,
    filename: usize,
    statbuf: usize,
    flags: i32,
) -> isize {
    let Some((state, orig)) = original::<StatFn>(kind, Syscall::Newfstatat) else {
        return ENOSYS;
    };
    state.dispatcher().stat(
        dfd,
        UserPtr(filename),
        UserPtr(statbuf),
        flags,
        |d, f, s, fl| unsafe { orig(d, f.0, s.0, fl) },
    )
}

pub unsafe extern "C" fn reboot_native(magic1: i32, magic2: i32, cmd: u32, arg: usize) -> isize {
    reboot_direct(TableKind::Native, magic1, magic2, cmd, arg)
}

pub unsafe extern "C" fn execve_native(filename: usize, argv: usize, envp: usize) -> isize {
    execve_direct(TableKind::Native, filename, argv, envp)
}

pub unsafe extern "C" fn faccessat_native(dfd: i32, filename: usize, mode: i32) -> isize {
    faccessat_direct(TableKind::Native, dfd, filename, mode)
}

pub unsafe extern "C" fn newfstatat_native(
    dfd: i32,
    filename: usize,
    statbuf: usize,
    flags: i32,
) -> isize {
    stat_direct(TableKind::Native, dfd, filename, statbuf, flags)
}

pub unsafe extern "C" fn reboot_compat(magic1: i32, magic2: i32, cmd: u32, arg: usize) -> isize {
    reboot_direct(TableKind::Compat, magic1, magic2, cmd, arg)
}

pub unsafe extern "C" fn execve_compat(filename: usize, argv: usize, envp: usize) -> isize {
    execve_direct(TableKind::Compat, filename, argv, envp)
}

pub unsafe extern "C" fn faccessat_compat(dfd: i32, filename: usize, mode: i32) -> isize {
    faccessat_direct(TableKind::Compat, dfd, filename, mode)
}

pub unsafe extern "C" fn fstatat64_compat(
    dfd: i32,
    filename: usize,
    statbuf: usize,
    flags: i32,
) -> isize {
    stat_direct(TableKind::Compat, dfd, filename, statbuf, flags)
}
