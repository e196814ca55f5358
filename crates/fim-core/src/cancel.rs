use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Co-operative cancellation flag shared between the signal handler and a
/// traversal pass. Checked between path visits, never mid-hash.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
