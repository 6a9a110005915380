//! Call handler adapters
//!
//! Each intercepted entry point arrives in one of three shapes:
//! - a register frame (`pt_regs` style syscall tables, kernel 4.19+)
//! - plain native arguments (older native tables)
//! - plain 32-bit compat arguments
//! plus the probe shape, where a pre-handler sees the probed function's
//! argument registers and may rewrite them in place.
//!
//! Adapters decode the shape into typed parameters, let the policy inspect
//! and rewrite them, and then call the saved original exactly once with
//! whatever the policy left behind. Nothing is ever swallowed.

use std::sync::Arc;

/// `AT_FDCWD`, passed for native execve calls
pub const AT_FDCWD: i32 = -100;

/// Number of argument registers captured in a frame
pub const FRAME_ARGS: usize = 8;

/// Argument registers of an intercepted call.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallFrame {
    pub regs: [usize; FRAME_ARGS],
}

impl CallFrame {
    pub fn from_args(args: &[usize]) -> Self {
        let mut frame = Self::default();
        let n = args.len().min(FRAME_ARGS);
        frame.regs[..n].copy_from_slice(&args[..n]);
        frame
    }

    pub fn arg(&self, n: usize) -> usize {
        self.regs[n]
    }

    pub fn set_arg(&mut self, n: usize, value: usize) {
        self.regs[n] = value;
    }

    fn arg_i32(&self, n: usize) -> i32 {
        self.regs[n] as i32
    }

    fn set_arg_i32(&mut self, n: usize, value: i32) {
        self.regs[n] = value as isize as usize;
    }

    /// The syscall's own frame, for probes placed on a syscall wrapper whose
    /// first argument points at the user register frame.
    ///
    /// # Safety
    ///
    /// The first argument must be null or point to a live `CallFrame`.
    pub unsafe fn syscall_frame(&mut self) -> Option<&mut CallFrame> {
        (self.regs[0] as *mut CallFrame).as_mut()
    }
}

/// An address in the calling process.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct UserPtr(pub usize);

impl UserPtr {
    pub const NULL: UserPtr = UserPtr(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Arguments of `input_event(dev, type, code, value)` as seen by its probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputEvent {
    pub kind: u32,
    pub code: u32,
    pub value: i32,
}

impl InputEvent {
    pub fn from_frame(frame: &CallFrame) -> Self {
        Self {
            kind: frame.arg(1) as u32,
            code: frame.arg(2) as u32,
            value: frame.arg_i32(3),
        }
    }
}

/// SELinux SIDs used by the privilege-transition special case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionSids {
    pub init: u32,
    pub su: u32,
}

/// Policy collaborators invoked by the hooks.
///
/// Implementations may rewrite any `&mut` parameter; the rewritten value is
/// what the original entry point receives.
pub trait SyscallPolicy: Send + Sync {
    fn on_reboot(&self, magic1: i32, magic2: i32, cmd: u32, arg: &mut UserPtr);

    /// `fd` is `Some(AT_FDCWD)` for native callers and `None` for compat ones.
    /// `argv`/`envp` are reserved and currently always `None`.
    fn on_execve(
        &self,
        fd: Option<i32>,
        filename: &mut UserPtr,
        argv: Option<&mut UserPtr>,
        envp: Option<&mut UserPtr>,
    );

    fn on_faccessat(&self, dfd: &mut i32, filename: &mut UserPtr, mode: &mut i32);

    fn on_stat(&self, dfd: &mut i32, filename: &mut UserPtr, flags: &mut i32);

    /// SIDs for init and su once the policy has resolved them.
    fn transition_sids(&self) -> Option<TransitionSids> {
        None
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    policy: Arc<dyn SyscallPolicy>,
}

impl Dispatcher {
    pub fn new(policy: Arc<dyn SyscallPolicy>) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &Arc<dyn SyscallPolicy> {
        &self.policy
    }

    // ------------------------------------------------------------------
    // Frame decoders, shared by register-frame tables and probes
    // ------------------------------------------------------------------

    fn reboot_args(&self, frame: &mut CallFrame) {
        let mut arg = UserPtr(frame.arg(3));
        self.policy.on_reboot(
            frame.arg_i32(0),
            frame.arg_i32(1),
            frame.arg(2) as u32,
            &mut arg,
        );
        frame.set_arg(3, arg.0);
    }

    fn execve_args(&self, frame: &mut CallFrame) {
        let mut filename = UserPtr(frame.arg(0));
        self.policy
            .on_execve(Some(AT_FDCWD), &mut filename, None, None);
        frame.set_arg(0, filename.0);
    }

    fn faccessat_args(&self, frame: &mut CallFrame) {
        let mut dfd = frame.arg_i32(0);
        let mut filename = UserPtr(frame.arg(1));
        let mut mode = frame.arg_i32(2);
        self.policy.on_faccessat(&mut dfd, &mut filename, &mut mode);
        frame.set_arg_i32(0, dfd);
        frame.set_arg(1, filename.0);
        frame.set_arg_i32(2, mode);
    }

    fn stat_args(&self, frame: &mut CallFrame) {
        // newfstatat(dfd, filename, statbuf, flag)
        let mut dfd = frame.arg_i32(0);
        let mut filename = UserPtr(frame.arg(1));
        let mut flags = frame.arg_i32(3);
        self.policy.on_stat(&mut dfd, &mut filename, &mut flags);
        frame.set_arg_i32(0, dfd);
        frame.set_arg(1, filename.0);
        frame.set_arg_i32(3, flags);
    }

    // ------------------------------------------------------------------
    // Register-frame convention
    // ------------------------------------------------------------------

    pub fn reboot_frame<F>(&self, frame: &CallFrame, original: F) -> isize
    where
        F: FnOnce(&CallFrame) -> isize,
    {
        let mut frame = *frame;
        self.reboot_args(&mut frame);
        original(&frame)
    }

    pub fn execve_frame<F>(&self, frame: &CallFrame, original: F) -> isize
    where
        F: FnOnce(&CallFrame) -> isize,
    {
        let mut frame = *frame;
        self.execve_args(&mut frame);
        original(&frame)
    }

    pub fn faccessat_frame<F>(&self, frame: &CallFrame, original: F) -> isize
    where
        F: FnOnce(&CallFrame) -> isize,
    {
        let mut frame = *frame;
        self.faccessat_args(&mut frame);
        original(&frame)
    }

    pub fn stat_frame<F>(&self, frame: &CallFrame, original: F) -> isize
    where
        F: FnOnce(&CallFrame) -> isize,
    {
        let mut frame = *frame;
        self.stat_args(&mut frame);
        original(&frame)
    }

    // ------------------------------------------------------------------
    // Direct-argument convention (native and compat)
    // ------------------------------------------------------------------

    pub fn reboot<F>(
        &self,
        magic1: i32,
        magic2: i32,
        cmd: u32,
        mut arg: UserPtr,
        original: F,
    ) -> isize
    where
        F: FnOnce(i32, i32, u32, UserPtr) -> isize,
    {
        self.policy.on_reboot(magic1, magic2, cmd, &mut arg);
        original(magic1, magic2, cmd, arg)
    }

    pub fn execve<F>(
        &self,
        compat: bool,
        mut filename: UserPtr,
        argv: UserPtr,
        envp: UserPtr,
        original: F,
    ) -> isize
    where
        F: FnOnce(UserPtr, UserPtr, UserPtr) -> isize,
    {
        let fd = (!compat).then_some(AT_FDCWD);
        self.policy.on_execve(fd, &mut filename, None, None);
        original(filename, argv, envp)
    }

    pub fn faccessat<F>(
        &self,
        mut dfd: i32,
        mut filename: UserPtr,
        mut mode: i32,
        original: F,
    ) -> isize
    where
        F: FnOnce(i32, UserPtr, i32) -> isize,
    {
        self.policy.on_faccessat(&mut dfd, &mut filename, &mut mode);
        original(dfd, filename, mode)
    }

    pub fn stat<F>(
        &self,
        mut dfd: i32,
        mut filename: UserPtr,
        statbuf: UserPtr,
        mut flags: i32,
        original: F,
    ) -> isize
    where
        F: FnOnce(i32, UserPtr, UserPtr, i32) -> isize,
    {
        self.policy.on_stat(&mut dfd, &mut filename, &mut flags);
        original(dfd, filename, statbuf, flags)
    }

    // ------------------------------------------------------------------
    // Probe pre-handlers. Always return 0 so the probed function runs.
    // ------------------------------------------------------------------

    /// Pre-handler for a probe on one of the syscall wrappers.
    pub fn syscall_probe(&self, syscall: Syscall, frame: &mut CallFrame) -> i32 {
        // Safety: wrapper probes receive the user register frame in arg 0
        let Some(real) = (unsafe { frame.syscall_frame() }) else {
            return 0;
        };
        match syscall {
            Syscall::Reboot => self.reboot_args(real),
            Syscall::Execve => self.execve_args(real),
            Syscall::Faccessat => self.faccessat_args(real),
            Syscall::Newfstatat => self.stat_args(real),
        }
        0
    }

    /// Pre-handler for `security_bounded_transition(old_sid, new_sid)`.
    ///
    /// An init -> su transition gets its old SID rewritten to the new one so
    /// the bounded check passes.
    pub fn bounded_transition_probe(&self, frame: &mut CallFrame) -> i32 {
        let Some(sids) = self.policy.transition_sids() else {
            return 0;
        };
        let old_sid = frame.arg(0) as u32;
        let new_sid = frame.arg(1) as u32;

        if old_sid == sids.init && new_sid == sids.su {
            log_hook_info!(
                "security_bounded_transition: forcing init -> su transition",
                init = sids.init,
                su = sids.su,
            );
            frame.set_arg(0, new_sid as usize);
        }
        0
    }
}

/// The syscalls the layer intercepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Syscall {
    Reboot,
    Execve,
    Faccessat,
    Newfstatat,
}

impl Syscall {
    pub const ALL: [Syscall; 4] = [
        Syscall::Reboot,
        Syscall::Execve,
        Syscall::Faccessat,
        Syscall::Newfstatat,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Syscall::Reboot => "reboot",
            Syscall::Execve => "execve",
            Syscall::Faccessat => "faccessat",
            Syscall::Newfstatat => "newfstatat",
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Policy that records every call and rewrites a few arguments.
    #[derive(Default)]
    pub(crate) struct RecordingPolicy {
        pub calls: Mutex<Vec<String>>,
        pub sids: Option<TransitionSids>,
    }

    impl RecordingPolicy {
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl SyscallPolicy for RecordingPolicy {
        fn on_reboot(&self, magic1: i32, magic2: i32, cmd: u32, arg: &mut UserPtr) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("reboot {magic1:#x} {magic2} {cmd} {:#x}", arg.0));
            arg.0 = 0x5a5a;
        }

        fn on_execve(
            &self,
            fd: Option<i32>,
            filename: &mut UserPtr,
            _argv: Option<&mut UserPtr>,
            _envp: Option<&mut UserPtr>,
        ) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("execve {fd:?} {:#x}", filename.0));
            if filename.0 == 0x1000 {
                filename.0 = 0x2000;
            }
        }

        fn on_faccessat(&self, dfd: &mut i32, filename: &mut UserPtr, mode: &mut i32) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("faccessat {dfd} {:#x} {mode}", filename.0));
            *mode = 0;
        }

        fn on_stat(&self, dfd: &mut i32, filename: &mut UserPtr, flags: &mut i32) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("stat {dfd} {:#x} {flags}", filename.0));
            *dfd = AT_FDCWD;
        }

        fn transition_sids(&self) -> Option<TransitionSids> {
            self.sids
        }
    }

    fn dispatcher() -> (Arc<RecordingPolicy>, Dispatcher) {
        let policy = Arc::new(RecordingPolicy::default());
        (policy.clone(), Dispatcher::new(policy))
    }

    #[test]
    fn test_frame_adapter_forwards_rewritten_frame_once() {
        let (policy, d) = dispatcher();
        let frame = CallFrame::from_args(&[0xfee1dead, 672274793, 0x4321fedc, 0x7000]);
        let mut calls = 0;

        let ret = d.reboot_frame(&frame, |f| {
            calls += 1;
            assert_eq!(f.arg(3), 0x5a5a);
            assert_eq!(f.arg(2), 0x4321fedc);
            -1
        });

        assert_eq!(ret, -1);
        assert_eq!(calls, 1);
        assert_eq!(policy.calls(), vec!["reboot 0xfee1dead 672274793 1126301404 0x7000"]);
    }

    #[test]
    fn test_direct_execve_distinguishes_compat() {
        let (policy, d) = dispatcher();

        let ret = d.execve(false, UserPtr(0x1000), UserPtr(0x10), UserPtr(0x20), |f, a, e| {
            assert_eq!((f, a, e), (UserPtr(0x2000), UserPtr(0x10), UserPtr(0x20)));
            0
        });
        assert_eq!(ret, 0);
        d.execve(true, UserPtr(0x3000), UserPtr::NULL, UserPtr::NULL, |_, _, _| 0);

        assert_eq!(
            policy.calls(),
            vec!["execve Some(-100) 0x1000", "execve None 0x3000"]
        );
    }

    #[test]
    fn test_faccessat_and_stat_mutations_reach_original() {
        let (_, d) = dispatcher();

        let ret = d.faccessat(3, UserPtr(0x40), 4, |dfd, name, mode| {
            assert_eq!((dfd, name, mode), (3, UserPtr(0x40), 0));
            11
        });
        assert_eq!(ret, 11);

        let frame = CallFrame::from_args(&[5, 0x80, 0x90, 0x100]);
        let ret = d.stat_frame(&frame, |f| {
            assert_eq!(f.arg(0) as i32, AT_FDCWD);
            assert_eq!(f.arg(2), 0x90);
            assert_eq!(f.arg(3), 0x100);
            22
        });
        assert_eq!(ret, 22);
    }

    #[test]
    fn test_syscall_probe_rewrites_real_frame() {
        let (policy, d) = dispatcher();
        let mut real = CallFrame::from_args(&[0x1000, 0, 0]);
        let mut wrapper = CallFrame::from_args(&[&mut real as *mut CallFrame as usize]);

        assert_eq!(d.syscall_probe(Syscall::Execve, &mut wrapper), 0);
        assert_eq!(real.arg(0), 0x2000);
        assert_eq!(policy.calls(), vec!["execve Some(-100) 0x1000"]);
    }

    #[test]
    fn test_syscall_probe_ignores_null_frame() {
        let (policy, d) = dispatcher();
        let mut wrapper = CallFrame::default();
        assert_eq!(d.syscall_probe(Syscall::Reboot, &mut wrapper), 0);
        assert!(policy.calls().is_empty());
    }

    #[test]
    fn test_bounded_transition_only_for_init_to_su() {
        let policy = Arc::new(RecordingPolicy {
            sids: Some(TransitionSids { init: 7, su: 42 }),
            ..Default::default()
        });
        let d = Dispatcher::new(policy);

        let mut frame = CallFrame::from_args(&[7, 42]);
        d.bounded_transition_probe(&mut frame);
        assert_eq!(frame.arg(0), 42);

        let mut frame = CallFrame::from_args(&[8, 42]);
        d.bounded_transition_probe(&mut frame);
        assert_eq!(frame.arg(0), 8);
    }

    #[test]
    fn test_input_event_decode() {
        let frame = CallFrame::from_args(&[0xdead, 1, 114, -1i32 as u32 as usize]);
        assert_eq!(
            InputEvent::from_frame(&frame),
            InputEvent {
                kind: 1,
                code: 114,
                value: -1
            }
        );
    }

    #[test]
    fn test_bounded_transition_without_sids_is_inert() {
        let (_, d) = dispatcher();
        let mut frame = CallFrame::from_args(&[7, 42]);
        d.bounded_transition_probe(&mut frame);
        assert_eq!(frame.arg(0), 7);
    }
}
