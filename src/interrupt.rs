//! Process-wide cooperative interrupt flag.
//!
//! One flag is created per top-level invocation and a clone is handed to
//! every engine instance, parent and child alike.  Setting it is monotonic:
//! there is deliberately no way to clear it, so once an interrupt is
//! observed every peer winds down.  Engines poll it between rounds — an
//! in-flight external tool always runs to completion first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a graceful stop.  Irreversible.
    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
