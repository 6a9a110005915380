#![allow(dead_code)]

use std::sync::Mutex;

use ksu_hook::dispatch::AT_FDCWD;
use ksu_hook::{SyscallPolicy, TransitionSids, UserPtr};

/// Stand-in for the su policy: records each call and redirects `/system/bin/su`
/// style lookups to a fixed replacement address.
#[derive(Default)]
pub struct SuPolicy {
    calls: Mutex<Vec<String>>,
    pub sids: Option<TransitionSids>,
}

pub const SU_PATH: usize = 0x7fff_0000;
pub const SH_PATH: usize = 0x7fff_1000;

impl SuPolicy {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl SyscallPolicy for SuPolicy {
    fn on_reboot(&self, magic1: i32, _magic2: i32, cmd: u32, arg: &mut UserPtr) {
        self.record(format!("reboot {:#x} {cmd}", magic1 as u32));
        if magic1 as u32 == 0xdeadbeef {
            arg.0 = 0;
        }
    }

    fn on_execve(
        &self,
        fd: Option<i32>,
        filename: &mut UserPtr,
        _argv: Option<&mut UserPtr>,
        _envp: Option<&mut UserPtr>,
    ) {
        self.record(format!("execve {fd:?}"));
        if filename.0 == SU_PATH {
            filename.0 = SH_PATH;
        }
    }

    fn on_faccessat(&self, dfd: &mut i32, filename: &mut UserPtr, _mode: &mut i32) {
        self.record(format!("faccessat {dfd}"));
        if filename.0 == SU_PATH {
            filename.0 = SH_PATH;
        }
    }

    fn on_stat(&self, dfd: &mut i32, filename: &mut UserPtr, _flags: &mut i32) {
        self.record(format!("stat {dfd}"));
        if filename.0 == SU_PATH {
            filename.0 = SH_PATH;
            *dfd = AT_FDCWD;
        }
    }

    fn transition_sids(&self) -> Option<TransitionSids> {
        self.sids
    }
}
