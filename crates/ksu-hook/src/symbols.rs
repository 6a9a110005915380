//! Syscall numbers and probe symbols.
//!
//! Native numbers follow the generic (arm64) syscall table; compat numbers
//! follow the 32-bit ARM EABI table.

use crate::dispatch::Syscall;
use crate::patch::TableKind;

pub const INPUT_EVENT_SYMBOL: &str = "input_event";
pub const BOUNDED_TRANSITION_SYMBOL: &str = "security_bounded_transition";

impl Syscall {
    pub fn number(self, kind: TableKind) -> usize {
        match (kind, self) {
            (TableKind::Native, Syscall::Reboot) => 142,
            (TableKind::Native, Syscall::Execve) => 221,
            (TableKind::Native, Syscall::Faccessat) => 48,
            (TableKind::Native, Syscall::Newfstatat) => 79,
            (TableKind::Compat, Syscall::Reboot) => 88,
            (TableKind::Compat, Syscall::Execve) => 11,
            (TableKind::Compat, Syscall::Faccessat) => 334,
            // fstatat64
            (TableKind::Compat, Syscall::Newfstatat) => 327,
        }
    }

    /// Syscall wrapper that receives the user register frame as its only
    /// argument.
    pub fn probe_symbol(self) -> &'static str {
        match self {
            Syscall::Reboot => "__arm64_sys_reboot",
            Syscall::Execve => "__arm64_sys_execve",
            Syscall::Faccessat => "__arm64_sys_faccessat",
            Syscall::Newfstatat => "__arm64_sys_newfstatat",
        }
    }
}
