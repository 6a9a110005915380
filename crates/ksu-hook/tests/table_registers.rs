//! Table patching on a 4.19+ kernel, where handlers take a register frame.
//!
//! Publishing is once per process, so the whole lifecycle is one test.

mod common;

use std::sync::{Arc, Mutex};

use common::{SuPolicy, SH_PATH, SU_PATH};
use ksu_config::HookConfig;
use ksu_hook::host::{HostPlatform, HostTable};
use ksu_hook::reals::RawHandler;
use ksu_hook::trampoline::{self, CallConvention, FrameFn};
use ksu_hook::{
    CallFrame, DispatchTablePatcher, HookError, HookState, HookStrategy, Interceptor, KernelVersion,
    Syscall, TableKind,
};

static SEEN: Mutex<Vec<String>> = Mutex::new(Vec::new());

extern "C" fn sys_ni() -> isize {
    -38
}

unsafe extern "C" fn orig_reboot(regs: *const CallFrame) -> isize {
    let f = &*regs;
    SEEN.lock().unwrap().push(format!("reboot arg={:#x}", f.arg(3)));
    0
}

unsafe extern "C" fn orig_execve(regs: *const CallFrame) -> isize {
    let f = &*regs;
    SEEN.lock().unwrap().push(format!("execve {:#x}", f.arg(0)));
    -2
}

unsafe extern "C" fn orig_faccessat(regs: *const CallFrame) -> isize {
    let f = &*regs;
    SEEN.lock().unwrap().push(format!("faccessat {:#x} {}", f.arg(1), f.arg(2)));
    0
}

unsafe extern "C" fn orig_newfstatat(regs: *const CallFrame) -> isize {
    let f = &*regs;
    let line = format!("newfstatat {} {:#x} {:#x}", f.arg(0) as i32, f.arg(1), f.arg(2));
    SEEN.lock().unwrap().push(line);
    0
}

fn originals() -> [(Syscall, usize); 4] {
    [
        (Syscall::Reboot, orig_reboot as *const () as usize),
        (Syscall::Execve, orig_execve as *const () as usize),
        (Syscall::Faccessat, orig_faccessat as *const () as usize),
        (Syscall::Newfstatat, orig_newfstatat as *const () as usize),
    ]
}

fn slot_fn(table: &HostTable, syscall: Syscall) -> FrameFn {
    let addr = table.table().read(syscall.number(TableKind::Native)).unwrap().addr();
    unsafe { std::mem::transmute::<usize, FrameFn>(addr) }
}

#[test]
fn test_register_frame_table_lifecycle() {
    let native = HostTable::new(TableKind::Native, 512, sys_ni as *const () as usize).unwrap();
    let compat = HostTable::new(TableKind::Compat, 512, sys_ni as *const () as usize).unwrap();
    let platform = Arc::new(
        HostPlatform::new(KernelVersion::new(5, 10, 66)).with_tables(Some(&native), Some(&compat)),
    );

    // Seed the table with the "kernel" handlers
    let patcher = DispatchTablePatcher::new(&*platform);
    for (sc, addr) in originals() {
        patcher
            .install(&native.table(), sc.number(TableKind::Native), RawHandler::from_addr(addr))
            .unwrap();
    }

    let policy = Arc::new(SuPolicy::default());
    let state = Interceptor::new(platform.clone(), policy.clone(), &HookConfig::default());
    state.load().unwrap();

    assert_eq!(
        state.strategy(),
        HookStrategy::Table {
            convention: CallConvention::Registers
        }
    );
    for (sc, addr) in originals() {
        let hook = state.table_hook(TableKind::Native, sc);
        assert_eq!(hook.state(), HookState::Registered);
        assert_eq!(hook.original().load().unwrap().addr(), addr);
        assert_eq!(
            native.table().read(sc.number(TableKind::Native)).unwrap(),
            trampoline::handler(CallConvention::Registers, TableKind::Native, sc).unwrap()
        );
        // No compat hooks with register frames
        assert_eq!(
            compat.table().read(sc.number(TableKind::Compat)).unwrap().addr(),
            sys_ni as *const () as usize
        );
    }

    // Calls go through the policy and reach the original exactly once
    let frame = CallFrame::from_args(&[0xdeadbeef, 672274793, 0x01234567, 0x4000]);
    assert_eq!(unsafe { slot_fn(&native, Syscall::Reboot)(&frame) }, 0);

    let frame = CallFrame::from_args(&[SU_PATH, 0x10, 0x20]);
    assert_eq!(unsafe { slot_fn(&native, Syscall::Execve)(&frame) }, -2);

    let frame = CallFrame::from_args(&[3, SU_PATH, 1]);
    assert_eq!(unsafe { slot_fn(&native, Syscall::Faccessat)(&frame) }, 0);

    let frame = CallFrame::from_args(&[5, SU_PATH, 0x9000, 0]);
    assert_eq!(unsafe { slot_fn(&native, Syscall::Newfstatat)(&frame) }, 0);

    assert_eq!(
        *SEEN.lock().unwrap(),
        vec![
            "reboot arg=0x0".to_string(),
            format!("execve {SH_PATH:#x}"),
            format!("faccessat {SH_PATH:#x} 1"),
            format!("newfstatat -100 {SH_PATH:#x} 0x9000"),
        ]
    );
    assert_eq!(
        policy.calls(),
        vec!["reboot 0xdeadbeef 19088743", "execve Some(-100)", "faccessat 3", "stat 5"]
    );

    // One interceptor per process
    assert!(matches!(state.publish(), Err(HookError::AlreadyPublished)));

    state.unload();
    for (sc, addr) in originals() {
        assert_eq!(native.table().read(sc.number(TableKind::Native)).unwrap().addr(), addr);
        assert_eq!(state.table_hook(TableKind::Native, sc).state(), HookState::Unregistered);
    }
}
