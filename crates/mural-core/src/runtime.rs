//! Process-wide initialisation of the feature runtime.
//!
//! Heavy static state (the binary test pattern) is built once on first use.
//! Hosts that want to pay that cost up front call [`initialize`] early and
//! may gate their own setup on [`is_ready`].

use std::sync::Once;
use std::sync::atomic::{AtomicBool, Ordering};

use log::info;

static INIT: Once = Once::new();
static READY: AtomicBool = AtomicBool::new(false);

/// Initialises the runtime. Safe to call from any thread, any number of times.
pub fn initialize() {
    INIT.call_once(|| {
        let pairs = crate::codec::orb::warm_pattern_cache();
        READY.store(true, Ordering::Release);
        info!(target: "mural_core::runtime", "feature runtime ready ({pairs} sampling pairs)");
    });
}

pub fn is_ready() -> bool {
    READY.load(Ordering::Acquire)
}
