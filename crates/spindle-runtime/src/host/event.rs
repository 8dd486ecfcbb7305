//! Host events: generation counters behind a condition variable.
//!
//! Each `record` bumps the recorded generation and enqueues a signal on the
//! recording stream; a wait snapshots the recorded generation at enqueue time
//! and blocks until the completed generation catches up.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct Generations {
    recorded: u64,
    completed: u64,
    /// Stream that recorded this event inside an active capture.
    captured_by: Option<u64>,
}

#[derive(Debug, Default)]
pub(crate) struct EventState {
    gens: Mutex<Generations>,
    cv: Condvar,
}

impl EventState {
    /// Reserve the next generation for a recording.
    pub(crate) fn next_generation(&self) -> u64 {
        let mut g = self.gens.lock();
        g.recorded += 1;
        g.captured_by = None;
        g.recorded
    }

    /// Generation a wait enqueued now must reach.
    pub(crate) fn latest(&self) -> u64 {
        self.gens.lock().recorded
    }

    pub(crate) fn complete(&self, gen: u64) {
        let mut g = self.gens.lock();
        if gen > g.completed {
            g.completed = gen;
        }
        self.cv.notify_all();
    }

    pub(crate) fn wait_for(&self, gen: u64) {
        let mut g = self.gens.lock();
        while g.completed < gen {
            self.cv.wait(&mut g);
        }
    }

    pub(crate) fn mark_captured(&self, stream: Option<u64>) {
        self.gens.lock().captured_by = stream;
    }

    pub(crate) fn captured_by(&self) -> Option<u64> {
        self.gens.lock().captured_by
    }
}

/// Event handle of the host accelerator.
#[derive(Debug, Clone, Default)]
pub struct HostEvent {
    pub(crate) state: Arc<EventState>,
}

impl HostEvent {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Whether every recording so far has completed.
    pub fn is_complete(&self) -> bool {
        let g = self.state.gens.lock();
        g.completed >= g.recorded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_wait_blocks_until_complete() {
        let ev = HostEvent::new();
        let gen = ev.state.next_generation();
        assert!(!ev.is_complete());

        let state = Arc::clone(&ev.state);
        let signaller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            state.complete(gen);
        });
        ev.state.wait_for(gen);
        assert!(ev.is_complete());
        signaller.join().unwrap();
    }

    #[test]
    fn test_never_recorded_is_complete() {
        let ev = HostEvent::new();
        assert_eq!(ev.state.latest(), 0);
        ev.state.wait_for(0);
        assert!(ev.is_complete());
    }

    #[test]
    fn test_stale_signal_does_not_regress() {
        let ev = HostEvent::new();
        let first = ev.state.next_generation();
        let second = ev.state.next_generation();
        ev.state.complete(second);
        ev.state.complete(first);
        ev.state.wait_for(second);
        assert!(ev.is_complete());
    }
}
