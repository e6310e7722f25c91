//! Generation-counted thread barrier for multi-threaded test bodies
//!
//! Every call to [`Barrier::enter`] is one rendezvous round: the last of the
//! expected threads to arrive advances the generation and wakes everybody.
//! Waiters re-check the generation, so spurious wakeups are harmless. If fewer
//! threads than expected ever arrive, the waiters block forever; the test's
//! timeout is what ends such a run.

use std::sync::{Condvar, Mutex};

struct BarrierState {
    waiting: u16,
    generation: u64,
}

pub struct Barrier {
    threads: u16,
    state: Mutex<BarrierState>,
    cond: Condvar,
}

impl Barrier {
    pub fn new(threads: u16) -> Self {
        Self {
            threads,
            state: Mutex::new(BarrierState {
                waiting: 0,
                generation: 0,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn threads(&self) -> u16 {
        self.threads
    }

    /// Current generation, i.e. the number of completed rounds
    pub fn generation(&self) -> u64 {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .generation
    }

    /// Block until `threads` callers have entered this round.
    ///
    /// Returns the generation that the completed round started in.
    pub fn enter(&self) -> u64 {
        // A test thread that panicked while holding the lock is already
        // failing the whole process, keep the others moving
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let generation = state.generation;

        state.waiting += 1;
        if state.waiting >= self.threads {
            state.waiting = 0;
            state.generation += 1;
            self.cond.notify_all();
            return generation;
        }

        while state.generation == generation {
            state = self.cond.wait(state).unwrap_or_else(|e| e.into_inner());
        }

        generation
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_single_thread_never_blocks() {
        let barrier = Barrier::new(1);
        assert_eq!(barrier.enter(), 0);
        assert_eq!(barrier.enter(), 1);
        assert_eq!(barrier.generation(), 2);
    }

    #[test]
    fn test_all_threads_released_together() {
        const THREADS: u16 = 8;
        let barrier = Arc::new(Barrier::new(THREADS));
        let arrived = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let barrier = barrier.clone();
                let arrived = arrived.clone();
                thread::spawn(move || {
                    arrived.fetch_add(1, Ordering::SeqCst);
                    let generation = barrier.enter();
                    // Nobody leaves before everybody arrived
                    let seen = arrived.load(Ordering::SeqCst);
                    (generation, seen)
                })
            })
            .collect();

        for handle in handles {
            let (generation, seen) = handle.join().unwrap();
            assert_eq!(generation, 0);
            assert_eq!(seen, THREADS as usize);
        }
        assert_eq!(barrier.generation(), 1);
    }

    #[test]
    fn test_repeated_rounds_stay_in_lockstep() {
        const THREADS: u16 = 4;
        const ROUNDS: u64 = 25;
        let barrier = Arc::new(Barrier::new(THREADS));
        let counter = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let barrier = barrier.clone();
                let counter = counter.clone();
                thread::spawn(move || {
                    for round in 0..ROUNDS {
                        counter.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(barrier.enter(), round * 2);
                        // Every thread incremented exactly once this round
                        let expected = (round as usize + 1) * THREADS as usize;
                        assert_eq!(counter.load(Ordering::SeqCst), expected);
                        barrier.enter();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(barrier.generation(), ROUNDS * 2);
    }

    #[test]
    fn test_waiter_blocks_until_last_arrival() {
        let barrier = Arc::new(Barrier::new(2));
        let released = Arc::new(AtomicUsize::new(0));

        let waiter = {
            let barrier = barrier.clone();
            let released = released.clone();
            thread::spawn(move || {
                barrier.enter();
                released.store(1, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert_eq!(released.load(Ordering::SeqCst), 0);
        assert_eq!(barrier.generation(), 0);

        barrier.enter();
        waiter.join().unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
