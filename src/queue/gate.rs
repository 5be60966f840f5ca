//! Administrative on/off switches for submission and claiming.

use std::sync::atomic::{AtomicBool, Ordering};

/// The two independent gates of a queue. Both start open.
///
/// Each `CeQueue` owns its own `Gates`, so two queues in one process never
/// share pause state.
#[derive(Debug, Default)]
pub struct Gates {
    submit_paused: AtomicBool,
    peek_paused: AtomicBool,
}

impl Gates {
    pub fn pause_submit(&self) {
        self.submit_paused.store(true, Ordering::Release);
    }

    pub fn resume_submit(&self) {
        self.submit_paused.store(false, Ordering::Release);
    }

    pub fn is_submit_paused(&self) -> bool {
        self.submit_paused.load(Ordering::Acquire)
    }

    pub fn pause_peek(&self) {
        self.peek_paused.store(true, Ordering::Release);
    }

    pub fn resume_peek(&self) {
        self.peek_paused.store(false, Ordering::Release);
    }

    pub fn is_peek_paused(&self) -> bool {
        self.peek_paused.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gates_are_independent() {
        let gates = Gates::default();
        assert!(!gates.is_submit_paused());
        assert!(!gates.is_peek_paused());

        gates.pause_submit();
        assert!(gates.is_submit_paused());
        assert!(!gates.is_peek_paused());

        gates.pause_peek();
        gates.resume_submit();
        assert!(!gates.is_submit_paused());
        assert!(gates.is_peek_paused());

        gates.resume_peek();
        assert!(!gates.is_peek_paused());
    }
}
