// =============================================================================
// worker.rs - Deferred hook removal
// =============================================================================
//
// A probe that wants to remove itself cannot do so from inside its own
// pre-handler. Removal is handed to a one-shot detached task instead:
//   - schedule_unregister()      - fire and forget, failures only logged
//   - try_schedule_unregister()  - same, but reports a spawn failure
//
// There is no join and no status channel. A request whose task cannot be
// spawned is dropped.
// =============================================================================

use std::sync::Arc;

use crate::error::{HookError, Result};
use crate::registry::{HookDescriptor, HookRegistry};

/// Name given to every removal task
pub const UNREGISTER_TASK: &str = "kp_unregister";

#[derive(Clone)]
pub struct DeferredUnregisterWorker {
    registry: HookRegistry,
}

impl DeferredUnregisterWorker {
    pub fn new(registry: HookRegistry) -> Self {
        Self { registry }
    }

    pub fn schedule_unregister(&self, hook: Arc<HookDescriptor>) {
        let _ = self.try_schedule_unregister(hook);
    }

    pub fn try_schedule_unregister(&self, hook: Arc<HookDescriptor>) -> Result<()> {
        let symbol = hook.symbol();
        let registry = self.registry.clone();
        let task = Box::new(move || registry.unregister(&hook));

        match self.registry.platform().spawn(UNREGISTER_TASK, task) {
            Ok(()) => {
                log_worker_info!("unregister scheduled", symbol = symbol);
                Ok(())
            }
            Err(source) => {
                log_worker_error!(
                    "unregister task spawn failed, request dropped",
                    symbol = symbol,
                    error = tracing::field::display(&source),
                );
                Err(HookError::Spawn {
                    name: UNREGISTER_TASK,
                    source,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::CallFrame;
    use crate::host::{HostPlatform, PlatformEvent};
    use crate::platform::{KernelVersion, ProbeHandler};
    use crate::registry::HookState;
    use std::time::{Duration, Instant};

    fn setup() -> (Arc<HostPlatform>, DeferredUnregisterWorker, Arc<HookDescriptor>) {
        let platform = Arc::new(
            HostPlatform::new(KernelVersion::new(4, 9, 0))
                .with_symbols(&["security_bounded_transition"]),
        );
        let registry = HookRegistry::new(platform.clone());
        let handler: ProbeHandler = Arc::new(|_: &mut CallFrame| 0);
        let hook = Arc::new(HookDescriptor::new("security_bounded_transition", handler));
        registry.register(&hook);
        (platform, DeferredUnregisterWorker::new(registry), hook)
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_unregister_runs_on_spawned_task() {
        let (platform, worker, hook) = setup();
        assert_eq!(hook.state(), HookState::Registered);

        worker.try_schedule_unregister(hook.clone()).unwrap();

        assert!(wait_for(|| hook.state() == HookState::Unregistered));
        assert!(!platform.is_probed("security_bounded_transition"));
        assert!(platform.events().contains(&PlatformEvent::Spawned(UNREGISTER_TASK)));
    }

    #[test]
    fn test_spawn_failure_drops_request() {
        let (platform, worker, hook) = setup();
        platform.fail_spawns(true);

        let err = worker.try_schedule_unregister(hook.clone()).unwrap_err();
        assert!(matches!(err, HookError::Spawn { name: UNREGISTER_TASK, .. }));

        // No retry: the hook stays attached
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(hook.state(), HookState::Registered);
        assert!(platform.is_probed("security_bounded_transition"));
    }

    #[test]
    fn test_unregister_from_inside_probe_is_deferred() {
        let platform =
            Arc::new(HostPlatform::new(KernelVersion::new(5, 4, 0)).with_symbols(&["input_event"]));
        let registry = HookRegistry::new(platform.clone());
        let worker = DeferredUnregisterWorker::new(registry.clone());

        let hook = Arc::new_cyclic(|weak: &std::sync::Weak<HookDescriptor>| {
            let weak = weak.clone();
            let worker = worker.clone();
            let handler: ProbeHandler = Arc::new(move |_: &mut CallFrame| {
                if let Some(me) = weak.upgrade() {
                    worker.schedule_unregister(me);
                }
                0
            });
            HookDescriptor::new("input_event", handler)
        });
        registry.register(&hook);

        // Firing holds no platform lock while the handler runs
        assert_eq!(platform.fire("input_event", &mut CallFrame::default()), Some(0));
        assert!(wait_for(|| !platform.is_probed("input_event")));
        assert_eq!(hook.state(), HookState::Unregistered);
    }
}
