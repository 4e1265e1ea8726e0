//! One-shot completion handshake between the thread that submits a descriptor and the channel's
//! completion context.
//!
//! A [CompletionGate] is armed once per transfer. Arming hands out a [CompletionToken], which is
//! moved into the descriptor's completion callback; the callback is the only thing that signals
//! it. The submitting thread then blocks in [CompletionGate::wait]. If the channel throws the
//! callback away without running it (the descriptor was terminated or never accepted), dropping
//! the token releases the waiter with [Outcome::Aborted], so a discarded descriptor can never leave
//! its submitter asleep.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// How an armed gate was released.
pub enum Outcome {
    /// The completion callback ran.
    Completed,
    /// The token was dropped without being signaled.
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateState {
    Idle,
    Armed,
    Released(Outcome),
}

#[derive(Debug)]
struct GateInner {
    data: Mutex<(GateState, u64)>,
    cv: Condvar,
}

#[derive(Debug)]
pub struct CompletionGate {
    inner: Arc<GateInner>,
}

#[derive(Debug)]
/// The signaling half of an armed gate. Single use.
pub struct CompletionToken {
    inner: Arc<GateInner>,
    generation: u64,
    fired: bool,
}

impl Default for CompletionGate {
    fn default() -> Self {
        Self {
            inner: Arc::new(GateInner {
                data: Mutex::new((GateState::Idle, 0)),
                cv: Condvar::new(),
            }),
        }
    }
}

impl CompletionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reinitialize the gate for a new transfer and return the token that releases it. Any token
    /// handed out by an earlier arming becomes stale and can no longer release the gate.
    pub fn arm(&mut self) -> CompletionToken {
        let mut data = self.inner.data.lock();
        data.0 = GateState::Armed;
        data.1 = data.1.wrapping_add(1);
        CompletionToken {
            inner: self.inner.clone(),
            generation: data.1,
            fired: false,
        }
    }

    /// Block until the current arming is released. There is no timeout.
    ///
    /// # Panics
    /// Panics if the gate is not armed, since nothing could ever release it.
    pub fn wait(&self) -> Outcome {
        let mut data = self.inner.data.lock();
        loop {
            match data.0 {
                GateState::Released(outcome) => {
                    data.0 = GateState::Idle;
                    return outcome;
                }
                GateState::Armed => self.inner.cv.wait(&mut data),
                GateState::Idle => panic!("waiting on a completion gate that was never armed"),
            }
        }
    }

    /// Returns true if the current arming has been released and not yet consumed by a waiter.
    #[cfg(test)]
    fn is_released(&self) -> bool {
        matches!(self.inner.data.lock().0, GateState::Released(_))
    }
}

impl CompletionToken {
    /// Signal completion. Called from the completion callback.
    pub fn signal(mut self) {
        self.release(Outcome::Completed);
    }

    fn release(&mut self, outcome: Outcome) {
        if self.fired {
            return;
        }
        self.fired = true;
        let mut data = self.inner.data.lock();
        if data.1 != self.generation || data.0 != GateState::Armed {
            tracing::warn!(
                "stale completion token (generation {}, gate at {})",
                self.generation,
                data.1
            );
            return;
        }
        data.0 = GateState::Released(outcome);
        self.inner.cv.notify_one();
    }
}

impl Drop for CompletionToken {
    fn drop(&mut self) {
        self.release(Outcome::Aborted);
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use super::*;

    #[test]
    fn signal_from_other_thread() {
        let mut gate = CompletionGate::new();
        let token = gate.arm();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            token.signal();
        });
        assert_eq!(gate.wait(), Outcome::Completed);
        t.join().unwrap();
    }

    #[test]
    fn signal_before_wait() {
        let mut gate = CompletionGate::new();
        gate.arm().signal();
        assert!(gate.is_released());
        assert_eq!(gate.wait(), Outcome::Completed);
        assert!(!gate.is_released());
    }

    #[test]
    fn dropped_token_aborts() {
        let mut gate = CompletionGate::new();
        let token = gate.arm();
        drop(token);
        assert_eq!(gate.wait(), Outcome::Aborted);
    }

    #[test]
    fn stale_token_is_ignored() {
        let mut gate = CompletionGate::new();
        let old = gate.arm();
        let new = gate.arm();
        old.signal();
        assert!(!gate.is_released());
        new.signal();
        assert_eq!(gate.wait(), Outcome::Completed);
    }

    #[test]
    fn rearm_after_completion() {
        let mut gate = CompletionGate::new();
        for _ in 0..3 {
            let token = gate.arm();
            let t = thread::spawn(move || token.signal());
            assert_eq!(gate.wait(), Outcome::Completed);
            t.join().unwrap();
        }
    }

    #[test]
    #[should_panic]
    fn wait_unarmed_panics() {
        let gate = CompletionGate::new();
        gate.wait();
    }
}
