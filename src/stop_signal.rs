use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Creates a linked pair for signalling background loops to exit. Dropping the
/// `Stopper` raises the signal; each loop polls its `StopCheck` once per tick.
pub(crate) fn new() -> (Stopper, StopCheck) {
    let stop_signal = Arc::new(AtomicBool::new(false));

    let stopper = Stopper {
        stop_signal: stop_signal.clone(),
    };
    let stop_check = StopCheck { stop_signal };

    (stopper, stop_check)
}

pub(crate) struct Stopper {
    stop_signal: Arc<AtomicBool>,
}

impl Stopper {
    pub(crate) fn stop(&self) {
        self.stop_signal.store(true, Ordering::Release);
    }
}

impl Drop for Stopper {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Clone)]
pub(crate) struct StopCheck {
    stop_signal: Arc<AtomicBool>,
}

impl StopCheck {
    pub(crate) fn should_stop(&self) -> bool {
        self.stop_signal.load(Ordering::Acquire)
    }
}
