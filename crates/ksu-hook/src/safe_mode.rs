//! Volume-down safe mode latch
//!
//! Counts volume-down presses seen by the key-event observer. Three presses
//! before the first query put the device in safe mode for good.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

pub const EV_KEY: u32 = 0x01;
pub const KEY_VOLUMEDOWN: u32 = 114;

/// Presses needed to enter safe mode
pub const SAFE_MODE_THRESHOLD: u32 = 3;

#[derive(Debug, Default)]
pub struct SafeModeLatch {
    presses: AtomicU32,
    latched: AtomicBool,
}

impl SafeModeLatch {
    pub const fn new() -> Self {
        Self {
            presses: AtomicU32::new(0),
            latched: AtomicBool::new(false),
        }
    }

    /// Feed one input event. Returns true when this press reached the
    /// threshold, meaning the observer is no longer needed.
    pub fn on_key_event(&self, kind: u32, code: u32, value: i32) -> bool {
        if kind != EV_KEY || code != KEY_VOLUMEDOWN {
            return false;
        }
        log_input_info!("KEY_VOLUMEDOWN", value = value);
        if value == 0 || self.latched.load(Ordering::Acquire) {
            return false;
        }

        let count = self.presses.fetch_add(1, Ordering::AcqRel) + 1;
        count == SAFE_MODE_THRESHOLD
    }

    /// Evaluate the latch. Once set it stays set.
    pub fn check(&self) -> bool {
        if self.latched.load(Ordering::Acquire) {
            return true;
        }

        let count = self.presses();
        log_input_info!("volumedown_pressed_count", count = count);
        if count >= SAFE_MODE_THRESHOLD {
            log_input_info!("KEY_VOLUMEDOWN pressed max times, safe mode detected");
            self.latched.store(true, Ordering::Release);
            return true;
        }
        false
    }

    pub fn presses(&self) -> u32 {
        self.presses.load(Ordering::Acquire)
    }

    pub fn is_latched(&self) -> bool {
        self.latched.load(Ordering::Acquire)
    }
}
